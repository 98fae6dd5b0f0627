//! Opportunistic subnet discovery of unconfigured PVE/PBS instances.
//!
//! Every five minutes the configured subnet is probed on the two product
//! ports with a bounded connection pool; hits are HTTP-probed for a
//! version and surfaced through the state hub. Hosts that are already
//! configured, and known cluster members, are excluded.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Error};
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::sync::{watch, Semaphore};

use pulse_api_types::{DiscoveredServer, NodeKind};

use crate::state::StateHub;

/// Concurrent probes in flight.
const PROBE_POOL: usize = 32;

const TCP_TIMEOUT: Duration = Duration::from_secs(1);
const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

const PORTS: [u16; 2] = [8006, 8007];

/// Hosts the scanner must not report.
pub type ExcludedHosts = Arc<dyn Fn() -> HashSet<String> + Send + Sync>;

pub async fn run_scanner(
    hub: Arc<StateHub>,
    subnet: String,
    interval: Duration,
    excluded: ExcludedHosts,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    log::info!("discovery scanner watching {}", subnet);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let scan = tokio::select! {
            _ = shutdown.changed() => break,
            result = scan_subnet(&subnet) => result,
        };
        match scan {
            Ok(mut servers) => {
                let excluded = excluded();
                servers.retain(|s| !excluded.contains(&s.ip));
                log::debug!("discovery: {} candidate(s) on {}", servers.len(), subnet);
                hub.set_discovered(servers);
            }
            Err(err) => log::warn!("discovery scan of {} failed: {}", subnet, err),
        }
    }
    log::info!("discovery scanner stopped");
}

/// One full sweep of the subnet.
pub async fn scan_subnet(subnet: &str) -> Result<Vec<DiscoveredServer>, Error> {
    let cidr: cidr::Ipv4Cidr = subnet
        .parse()
        .map_err(|err| format_err!("invalid discovery subnet '{}' - {}", subnet, err))?;
    // limit the sweep to something neighbourly; /16 is already 65k hosts
    if cidr.network_length() < 16 {
        return Err(format_err!(
            "discovery subnet '{}' too large (min /16)",
            subnet
        ));
    }

    let first: u32 = cidr.first_address().into();
    let last: u32 = cidr.last_address().into();
    let pool = Arc::new(Semaphore::new(PROBE_POOL));

    let mut probes = Vec::new();
    for raw in first..=last {
        let ip = Ipv4Addr::from(raw);
        for port in PORTS {
            let pool = pool.clone();
            probes.push(async move {
                let _permit = pool.acquire().await.ok()?;
                probe_host(ip, port).await
            });
        }
    }

    let mut servers: Vec<DiscoveredServer> =
        join_all(probes).await.into_iter().flatten().collect();
    servers.sort_by(|a, b| (&a.ip, a.port).cmp(&(&b.ip, b.port)));
    Ok(servers)
}

async fn probe_host(ip: Ipv4Addr, port: u16) -> Option<DiscoveredServer> {
    let address = (ip, port);
    let connected = tokio::time::timeout(TCP_TIMEOUT, TcpStream::connect(address))
        .await
        .ok()?
        .ok()?;
    drop(connected);

    let ip = ip.to_string();
    let version = match pulse_client::probe_version(&ip, port, HTTP_TIMEOUT).await {
        Ok(version) => version,
        // listening on the port but not speaking the API
        Err(err) => {
            log::debug!("version probe of {}:{} failed: {}", ip, port, err);
            return None;
        }
    };

    let kind = if port == 8007 {
        NodeKind::Pbs
    } else {
        NodeKind::Pve
    };
    Some(DiscoveredServer {
        ip,
        port,
        kind,
        version,
        hostname: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_subnet_is_rejected() {
        assert!(scan_subnet("10.0.0.0/8").await.is_err());
        assert!(scan_subnet("not-a-subnet").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn excluded_hosts_are_filtered() {
        // no listeners in the test environment, so the scan comes back
        // empty either way; this exercises the wiring end to end
        let hub = StateHub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let excluded: ExcludedHosts = Arc::new(|| HashSet::from(["127.0.0.1".to_string()]));
        let task = tokio::spawn(run_scanner(
            hub.clone(),
            "127.0.0.1/32".to_string(),
            Duration::from_secs(300),
            excluded,
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(hub.discovered().iter().all(|s| s.ip != "127.0.0.1"));
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
