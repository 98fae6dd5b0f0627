use serde::{Deserialize, Serialize};

use super::NodeKind;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// Which resource classes a node worker fetches each tick.
///
/// PVE nodes use the first four flags, PBS nodes the last four; flags for
/// the other product family are ignored.
pub struct NodeCapabilities {
    pub monitor_vms: bool,
    pub monitor_containers: bool,
    pub monitor_storage: bool,
    pub monitor_backups: bool,
    pub monitor_datastores: bool,
    pub monitor_sync_jobs: bool,
    pub monitor_verify_jobs: bool,
    pub monitor_prune_jobs: bool,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            monitor_vms: true,
            monitor_containers: true,
            monitor_storage: true,
            monitor_backups: true,
            monitor_datastores: true,
            monitor_sync_jobs: true,
            monitor_verify_jobs: true,
            monitor_prune_jobs: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// One member of a PVE cluster as reported by `/cluster/status`.
pub struct ClusterEndpoint {
    /// Node name inside the cluster.
    pub node_name: String,
    /// IP or hostname the member is reachable under.
    pub host: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
/// Cached cluster membership, refreshed at most every five minutes.
pub struct ClusterInfo {
    /// Canonical cluster name; entities of a cluster are tagged with this,
    /// never with the entry endpoint's hostname.
    pub name: String,
    pub endpoints: Vec<ClusterEndpoint>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// A configured upstream node. This is what the credential store encrypts.
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    /// Human name, also the `instance` stamp on standalone-node entities.
    pub name: String,
    /// Base URL of the entry endpoint, e.g. `https://pve1:8006`.
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    /// Per-call deadline override in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterInfo>,
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    pub fn has_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    pub fn has_token(&self) -> bool {
        self.token_secret.as_deref().is_some_and(|t| !t.is_empty())
            && self.token_name.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Host part of the configured URL, without scheme or port.
    pub fn host(&self) -> String {
        let rest = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))
            .unwrap_or(&self.url);
        let rest = rest.split('/').next().unwrap_or(rest);
        rest.rsplit_once(':')
            .map(|(host, port)| {
                if port.chars().all(|c| c.is_ascii_digit()) {
                    host.to_string()
                } else {
                    rest.to_string()
                }
            })
            .unwrap_or_else(|| rest.to_string())
    }

    /// Port of the configured URL, defaulting per product family.
    pub fn port(&self) -> u16 {
        let rest = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))
            .unwrap_or(&self.url);
        let rest = rest.split('/').next().unwrap_or(rest);
        rest.rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or_else(|| self.kind.default_port())
    }

    /// Strips both secrets; what the config API returns.
    pub fn to_summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            kind: self.kind,
            name: self.name.clone(),
            url: self.url.clone(),
            user: self.user.clone(),
            token_name: self.token_name.clone(),
            has_password: self.has_password(),
            has_token: self.has_token(),
            verify_tls: self.verify_tls,
            capabilities: self.capabilities,
            cluster: self.cluster.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// Node configuration without secrets, for the REST surface.
pub struct NodeSummary {
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    pub has_password: bool,
    pub has_token: bool,
    pub verify_tls: bool,
    pub capabilities: NodeCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(url: &str) -> NodeConfig {
        NodeConfig {
            id: "n1".into(),
            kind: NodeKind::Pve,
            name: "pve1".into(),
            url: url.into(),
            user: Some("monitor@pam".into()),
            password: None,
            token_name: Some("pulse".into()),
            token_secret: Some("secret".into()),
            verify_tls: true,
            timeout_secs: None,
            capabilities: NodeCapabilities::default(),
            cluster: None,
        }
    }

    #[test]
    fn host_and_port_from_url() {
        assert_eq!(node("https://pve1:8006").host(), "pve1");
        assert_eq!(node("https://pve1:8006").port(), 8006);
        assert_eq!(node("https://10.0.0.10").host(), "10.0.0.10");
        assert_eq!(node("https://10.0.0.10").port(), 8006);
        assert_eq!(node("https://pve1:443/path").port(), 443);
    }

    #[test]
    fn summary_hides_secrets() {
        let n = node("https://pve1:8006");
        let summary = n.to_summary();
        assert!(summary.has_token);
        assert!(!summary.has_password);
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("tokenSecret").is_none());
        assert!(json.get("password").is_none());
    }
}
