//! Snapshot assembly: merge the buffered partials into one authoritative,
//! deterministically ordered snapshot.

use std::collections::{HashMap, HashSet};

use pulse_api_types::{BackupRecord, Guest, PveBackups, Snapshot};

use super::PartialSnapshot;

/// Merge the last-received partial of every worker.
///
/// Entities are sorted by `(instance, type, vmid)`, duplicate guests
/// (several configured entries of one cluster) collapse to the report of
/// the hosting node, and PVE-side views of PBS backups are dropped in
/// favour of the direct PBS records.
pub fn assemble(
    partials: &HashMap<String, PartialSnapshot>,
    previous_generated_at: i64,
    now_ms: i64,
) -> Snapshot {
    let mut snapshot = Snapshot {
        // strictly monotonic even when assemblies land in the same
        // millisecond
        generated_at: now_ms.max(previous_generated_at + 1),
        ..Default::default()
    };

    let mut ordered: Vec<&PartialSnapshot> = partials.values().collect();
    ordered.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    let mut guest_snapshots = Vec::new();
    let mut storage_backups = Vec::new();
    for partial in ordered {
        snapshot.nodes.extend(partial.nodes.iter().cloned());
        snapshot.vms.extend(partial.vms.iter().cloned());
        snapshot
            .containers
            .extend(partial.containers.iter().cloned());
        snapshot.storage.extend(partial.storage.iter().cloned());
        guest_snapshots.extend(partial.guest_snapshots.iter().cloned());
        storage_backups.extend(partial.storage_backups.iter().cloned());
        snapshot
            .pbs_backups
            .extend(partial.pbs_backups.iter().cloned());
        if let Some(instance) = &partial.pbs_instance {
            snapshot.pbs_instances.push(instance.clone());
        }
    }

    dedup_guests(&mut snapshot.vms);
    dedup_guests(&mut snapshot.containers);

    snapshot.nodes.sort_by(|a, b| {
        (&a.cluster_name, &a.name).cmp(&(&b.cluster_name, &b.name))
    });
    // nodes can appear twice when two configured entries share a cluster
    snapshot.nodes.dedup_by(|a, b| a.name == b.name && a.kind == b.kind);
    snapshot
        .storage
        .sort_by(|a, b| (&a.instance, &a.id).cmp(&(&b.instance, &b.id)));
    snapshot.storage.dedup_by(|a, b| a.id == b.id && a.instance == b.instance);
    snapshot
        .pbs_instances
        .sort_by(|a, b| a.name.cmp(&b.name));

    storage_backups = dedup_pbs_backups(storage_backups, &snapshot.pbs_backups);

    sort_backups(&mut guest_snapshots);
    sort_backups(&mut storage_backups);
    sort_backups(&mut snapshot.pbs_backups);
    snapshot.pve_backups = PveBackups {
        guest_snapshots,
        storage_backups,
    };

    snapshot
}

/// Sort by `(instance, type, vmid)` and drop duplicates, preferring the
/// entry whose `node` matches the reported hosting node (they all do after
/// normalization, so the first in sorted order wins).
fn dedup_guests(guests: &mut Vec<Guest>) {
    guests.sort_by(|a, b| {
        (&a.instance, a.kind as u8, a.vmid, &a.node).cmp(&(&b.instance, b.kind as u8, b.vmid, &b.node))
    });
    let mut seen = HashSet::new();
    guests.retain(|guest| seen.insert((guest.instance.clone(), guest.kind as u8, guest.vmid)));
}

/// A PBS backup reachable both through a PVE storage and the PBS API is a
/// single record, keyed by `(vmid, floor(backupTime))`; the direct PBS
/// record wins (it carries namespace and verification state).
pub(crate) fn dedup_pbs_backups(
    storage_backups: Vec<BackupRecord>,
    pbs_backups: &[BackupRecord],
) -> Vec<BackupRecord> {
    let remote_keys: HashSet<(u64, i64)> =
        pbs_backups.iter().map(|record| record.dedup_key()).collect();
    storage_backups
        .into_iter()
        .filter(|record| {
            !(record.shadows_remote() && remote_keys.contains(&record.dedup_key()))
        })
        .collect()
}

fn sort_backups(records: &mut [BackupRecord]) {
    records.sort_by_key(|record| (record.vmid(), record.backup_time()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_api_types::{
        ConnectionHealth, DiskUsage, GuestKind, GuestStatus, MemoryUsage, NodeKind,
        NodeOnlineStatus, NodeStatus,
    };

    fn guest(instance: &str, node: &str, vmid: u64) -> Guest {
        Guest {
            kind: GuestKind::Qemu,
            vmid,
            node: node.to_string(),
            instance: instance.to_string(),
            name: format!("vm{}", vmid),
            status: GuestStatus::Running,
            cpu: 0.1,
            cpus: 1,
            memory: MemoryUsage::new(1, 2),
            disk: DiskUsage::default(),
            disk_read: 0.0,
            disk_write: 0.0,
            network_in: 0.0,
            network_out: 0.0,
            uptime: 0,
            tags: Vec::new(),
            meta: None,
        }
    }

    fn node_status(name: &str) -> NodeStatus {
        NodeStatus {
            name: name.to_string(),
            kind: NodeKind::Pve,
            status: NodeOnlineStatus::Online,
            connection_health: ConnectionHealth::Healthy,
            cpu: 0.0,
            memory: MemoryUsage::default(),
            disk: DiskUsage::default(),
            uptime: 0,
            is_cluster_member: false,
            cluster_name: None,
            cluster_endpoints: Vec::new(),
            stale: false,
        }
    }

    fn local_backup(vmid: u64, time: i64, on_pbs: bool) -> BackupRecord {
        BackupRecord::Local {
            vmid,
            guest_type: GuestKind::Qemu,
            node: "pve1".into(),
            backup_time: time,
            size_bytes: None,
            storage: "backup-01".into(),
            volid: format!("backup-01:backup/vm/{}/{}", vmid, time),
            protected: false,
            encrypted: None,
            notes: None,
            on_pbs,
        }
    }

    fn remote_backup(vmid: u64, time: i64) -> BackupRecord {
        BackupRecord::Remote {
            vmid,
            guest_type: GuestKind::Qemu,
            backup_time: time,
            size_bytes: Some(1024),
            datastore: "backup-01".into(),
            namespace: "prod".into(),
            verified: Some(true),
            protected: false,
            encrypted: None,
            owner: None,
            notes: None,
        }
    }

    #[test]
    fn generated_at_is_strictly_monotonic() {
        let partials = HashMap::new();
        let first = assemble(&partials, 0, 1000);
        let second = assemble(&partials, first.generated_at, 1000);
        assert!(second.generated_at > first.generated_at);
    }

    #[test]
    fn guests_are_sorted_and_deduplicated() {
        let mut partials = HashMap::new();
        partials.insert(
            "a".to_string(),
            PartialSnapshot {
                node_id: "a".into(),
                instance: "prod".into(),
                vms: vec![guest("prod", "pve-b", 101), guest("prod", "pve-a", 100)],
                ..Default::default()
            },
        );
        // a second configured entry of the same cluster reports vm 100 too
        partials.insert(
            "b".to_string(),
            PartialSnapshot {
                node_id: "b".into(),
                instance: "prod".into(),
                vms: vec![guest("prod", "pve-a", 100)],
                ..Default::default()
            },
        );

        let snapshot = assemble(&partials, 0, 1000);
        let vmids: Vec<u64> = snapshot.vms.iter().map(|g| g.vmid).collect();
        assert_eq!(vmids, vec![100, 101]);
    }

    /// A PBS-backed PVE storage entry and the direct PBS listing describe
    /// the same backup; only the PBS record survives.
    #[test]
    fn pbs_backups_deduplicate_across_sources() {
        let mut partials = HashMap::new();
        partials.insert(
            "pve".to_string(),
            PartialSnapshot {
                node_id: "pve".into(),
                instance: "pve1".into(),
                storage_backups: vec![
                    local_backup(101, 1_700_000_000, true),
                    local_backup(200, 1_600_000_000, false),
                ],
                ..Default::default()
            },
        );
        partials.insert(
            "pbs".to_string(),
            PartialSnapshot {
                node_id: "pbs".into(),
                instance: "backup".into(),
                pbs_backups: vec![remote_backup(101, 1_700_000_000)],
                ..Default::default()
            },
        );

        let snapshot = assemble(&partials, 0, 1000);
        assert_eq!(snapshot.pbs_backups.len(), 1);
        // the plain local backup stays, the shadowed one is gone
        assert_eq!(snapshot.pve_backups.storage_backups.len(), 1);
        assert_eq!(snapshot.pve_backups.storage_backups[0].vmid(), 200);
        // namespace of the surviving record is preserved
        match &snapshot.pbs_backups[0] {
            BackupRecord::Remote { namespace, .. } => assert_eq!(namespace, "prod"),
            other => panic!("unexpected record {:?}", other),
        }
        // invariant: no duplicate (vmid, time) among PBS backups
        let mut keys = HashSet::new();
        for record in &snapshot.pbs_backups {
            assert!(keys.insert(record.dedup_key()));
        }
    }

    #[test]
    fn non_pbs_local_backup_with_same_key_survives() {
        let survivors = dedup_pbs_backups(
            vec![local_backup(101, 1_700_000_000, false)],
            &[remote_backup(101, 1_700_000_000)],
        );
        assert_eq!(survivors.len(), 1);
    }

    #[test]
    fn duplicate_node_entries_collapse() {
        let mut partials = HashMap::new();
        for id in ["a", "b"] {
            partials.insert(
                id.to_string(),
                PartialSnapshot {
                    node_id: id.into(),
                    instance: "prod".into(),
                    nodes: vec![node_status("pve-a"), node_status("pve-b")],
                    ..Default::default()
                },
            );
        }
        let snapshot = assemble(&partials, 0, 1000);
        assert_eq!(snapshot.nodes.len(), 2);
    }
}
