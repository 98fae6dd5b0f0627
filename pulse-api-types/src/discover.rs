use serde::{Deserialize, Serialize};

use super::NodeKind;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// An unconfigured PVE/PBS instance found by the subnet scanner.
pub struct DiscoveredServer {
    pub ip: String,
    pub port: u16,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}
