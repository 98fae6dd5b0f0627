//! Authenticated HTTPS client for the PVE and PBS APIs.
//!
//! One logical client per `(node, endpoint)` pair. Strictly read-only
//! upstream: every operation is an idempotent GET, carries a deadline, is
//! retried with jittered backoff on transient failures and capped by a
//! per-endpoint semaphore.

mod error;
mod http_client;
mod pbs;
mod pve;

pub use error::ApiError;
pub use http_client::{probe_version, Auth, ClientOptions, HttpClient};
pub use pbs::{PbsApi, PbsDatastoreUsage, PbsJobInfo, PbsSnapshotInfo};
pub use pve::{
    ClusterMemberInfo, ClusterStatusInfo, PveApi, PveGuestInfo, PveNodeInfo, PveSnapshotInfo,
    PveStorageContent, PveStorageInfo, VersionInfo,
};

use std::time::Duration;

use anyhow::{bail, Error};

use pulse_api_types::{NodeConfig, NodeKind};

/// Build the authentication material from a node's configuration.
pub fn auth_for(config: &NodeConfig) -> Result<Auth, Error> {
    let user = config.user.clone().unwrap_or_default();
    if config.has_token() {
        Ok(Auth::Token {
            userid: user,
            token_name: config.token_name.clone().unwrap_or_default(),
            secret: config.token_secret.clone().unwrap_or_default(),
        })
    } else if config.has_password() {
        Ok(Auth::Ticket {
            userid: user,
            password: config.password.clone().unwrap_or_default(),
        })
    } else {
        bail!("node '{}' has neither token nor password", config.name);
    }
}

/// Client for a node's configured entry endpoint.
pub fn client_for(config: &NodeConfig) -> Result<HttpClient, Error> {
    client_for_endpoint(config, &config.host())
}

/// Client for one concrete endpoint of a node; clustered nodes have
/// several.
pub fn client_for_endpoint(config: &NodeConfig, host: &str) -> Result<HttpClient, Error> {
    let timeout = Duration::from_secs(config.timeout_secs.unwrap_or(10).max(1));
    HttpClient::new(
        config.kind,
        host,
        config.port(),
        auth_for(config)?,
        ClientOptions {
            verify_tls: config.verify_tls,
            timeout,
            ..ClientOptions::default()
        },
    )
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("kind", &self.kind())
            .field("server", &self.server())
            .finish_non_exhaustive()
    }
}

/// One-call connectivity check used by the config API before a node is
/// saved.
pub async fn test_connection(config: &NodeConfig) -> Result<VersionInfo, ApiError> {
    let client =
        client_for(config).map_err(|err| ApiError::Permanent(err.to_string()))?;
    match config.kind {
        NodeKind::Pve => PveApi::version(&client).await,
        NodeKind::Pbs => PbsApi::version(&client).await,
    }
}
