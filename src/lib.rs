//! Pulse: real-time monitoring aggregator for Proxmox VE and Proxmox
//! Backup Server fleets.
//!
//! A single authoritative process polls the upstream APIs, merges the
//! per-node views into one snapshot, evaluates alert thresholds with
//! hysteresis, fans the snapshot out to WebSocket subscribers and keeps a
//! small in-memory metrics history.

pub mod alerts;
pub mod daemon;
pub mod discovery;
pub mod history;
pub mod poll;
pub mod reload;
pub mod server;
pub mod state;
