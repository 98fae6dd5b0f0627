use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
/// One metrics sample for one entity, appended once per poll tick.
pub struct HistoryPoint {
    /// Epoch seconds.
    pub timestamp: i64,
    pub cpu: f64,
    pub mem_usage: f64,
    pub disk_usage: f64,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub net_in_rate: f64,
    pub net_out_rate: f64,
}
