use std::path::Path;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::{file_get_json_opt, store_json};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// Process-wide settings, stored as plain JSON in `system.json`.
pub struct SystemConfig {
    /// Poll tick in seconds.
    pub poll_interval_secs: u64,
    /// Default upstream call deadline in seconds.
    pub connect_timeout_secs: u64,
    /// Address the HTTP/WebSocket surface binds to.
    pub listen: String,
    /// CIDR the discovery scanner probes; unset disables scanning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_subnet: Option<String>,
    pub discovery_interval_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            connect_timeout_secs: 10,
            listen: "127.0.0.1:7655".to_string(),
            discovery_subnet: None,
            discovery_interval_secs: 300,
        }
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        Ok(file_get_json_opt(path)
            .with_context(|| format!("unable to load system config {:?}", path))?
            .unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        store_json(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = SystemConfig::load(Path::new("/nonexistent/system.json")).unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.poll_interval_secs, 10);
    }
}
