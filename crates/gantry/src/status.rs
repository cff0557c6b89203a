use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tracing::info;

/// Process-wide counters. Plain atomic adds on the hot path; a snapshot is
/// only taken for `dump_status` and control-channel status replies.
#[derive(Default)]
pub struct Stats {
    pub accepted: AtomicU64,
    pub refused: AtomicU64,
    pub closed: AtomicU64,
    pub reaped: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub dispatch_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub overflow_drops: AtomicU64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub accepted: u64,
    pub refused: u64,
    pub closed: u64,
    pub reaped: u64,
    pub active: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub dispatch_errors: u64,
    pub protocol_errors: u64,
    pub overflow_drops: u64,
}

impl Stats {
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active: u64) -> StatusSnapshot {
        StatusSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            active,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnEntry {
    pub worker: u16,
    pub server: String,
    pub peer: String,
}

/// The process-level connection registry: conn id → where it lives.
///
/// Workers insert on accept and remove on close; `dump_status` and the
/// control channel read it. A spin lock is enough — entries change at
/// connection rate, not message rate.
#[derive(Default)]
pub struct ConnDirectory {
    entries: spin::Mutex<HashMap<u64, ConnEntry>>,
}

impl ConnDirectory {
    pub fn insert(&self, id: u64, entry: ConnEntry) {
        self.entries.lock().insert(id, entry);
    }

    pub fn remove(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn per_server_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.lock().values() {
            *counts.entry(entry.server.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Log a status snapshot; this is what SIGUSR2 and the Status control
/// command ultimately produce.
pub fn dump(stats: &Stats, directory: &ConnDirectory) {
    let snap = stats.snapshot(directory.len() as u64);
    info!(
        active = snap.active,
        accepted = snap.accepted,
        refused = snap.refused,
        closed = snap.closed,
        reaped = snap.reaped,
        bytes_in = snap.bytes_in,
        bytes_out = snap.bytes_out,
        frames_in = snap.frames_in,
        frames_out = snap.frames_out,
        dispatch_errors = snap.dispatch_errors,
        protocol_errors = snap.protocol_errors,
        overflow_drops = snap.overflow_drops,
        "status"
    );
    for (server, count) in directory.per_server_counts() {
        info!(%server, count, "status per-listener");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_back_adds() {
        let stats = Stats::default();
        Stats::bump(&stats.accepted);
        Stats::add(&stats.bytes_in, 128);
        let snap = stats.snapshot(3);
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.bytes_in, 128);
        assert_eq!(snap.active, 3);
    }

    #[test]
    fn directory_counts_per_server() {
        let dir = ConnDirectory::default();
        dir.insert(1, ConnEntry { worker: 1, server: "game".into(), peer: "a".into() });
        dir.insert(2, ConnEntry { worker: 2, server: "game".into(), peer: "b".into() });
        dir.insert(3, ConnEntry { worker: 1, server: "chat".into(), peer: "c".into() });
        assert_eq!(dir.len(), 3);

        let counts = dir.per_server_counts();
        assert_eq!(counts["game"], 2);
        assert_eq!(counts["chat"], 1);

        dir.remove(2);
        assert_eq!(dir.per_server_counts()["game"], 1);
    }
}
