//! Shared data model for the pulse monitoring daemon.
//!
//! Everything that crosses a component boundary lives here: node
//! configuration, normalized resource records, merged snapshots, alerts and
//! their thresholds, history samples and discovery results. Wire names are
//! camelCase because the WebSocket protocol feeds existing JSON clients.

use serde::{Deserialize, Serialize};

pub mod lenient;

mod alert;
mod backup;
mod discover;
mod history;
mod node;
mod resources;
mod snapshot;

pub use alert::*;
pub use backup::*;
pub use discover::*;
pub use history::*;
pub use node::*;
pub use resources::*;
pub use snapshot::*;

/// Tags recognized on PVE guests (case-sensitive).
pub const TAG_NO_ALERTS: &str = "pulse-no-alerts";
pub const TAG_MONITOR_ONLY: &str = "pulse-monitor-only";
pub const TAG_RELAXED: &str = "pulse-relaxed";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
/// The two upstream product families we poll.
pub enum NodeKind {
    /// Proxmox Virtual Environment, API on port 8006.
    Pve,
    /// Proxmox Backup Server, API on port 8007.
    Pbs,
}

serde_plain::derive_display_from_serialize!(NodeKind);
serde_plain::derive_fromstr_from_deserialize!(NodeKind);

impl NodeKind {
    /// The default API port for this product family.
    pub fn default_port(self) -> u16 {
        match self {
            NodeKind::Pve => 8006,
            NodeKind::Pbs => 8007,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Guest type as reported by PVE.
pub enum GuestKind {
    #[default]
    Qemu,
    Lxc,
}

serde_plain::derive_display_from_serialize!(GuestKind);
serde_plain::derive_fromstr_from_deserialize!(GuestKind);
