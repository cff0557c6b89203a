use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tracing::info;

/// Admin request flags, written by signal handlers and the control channel,
/// consumed by the main worker between readiness batches.
///
/// Reload/reopen/dump are generation counters so back-to-back requests each
/// fire once; shutdown is latched and never clears.
#[derive(Default)]
pub(crate) struct AdminFlags {
    pub shutdown: AtomicBool,
    pub reload: AtomicU64,
    pub reopen_logs: AtomicU64,
    pub dump_status: AtomicU64,
}

/// Handle for requesting admin actions on a running [`crate::Runtime`].
///
/// What triggers these is external to the core: binaries wire OS signals to
/// them, the control channel maps command frames to them. Every action runs
/// on the main worker, outside any connection callback.
#[derive(Clone, Default)]
pub struct Controller {
    flags: Arc<AdminFlags>,
}

impl Controller {
    /// Begin graceful shutdown: workers stop accepting work, fire `on_close`
    /// for their connections, drain outbound buffers up to the configured
    /// deadline, and exit.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.flags.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flags.shutdown.load(Ordering::SeqCst)
    }

    /// Ask every worker's script host to reload.
    pub fn reload_script(&self) {
        info!("script reload requested");
        self.flags.reload.fetch_add(1, Ordering::SeqCst);
    }

    /// Reopen log files after rotation.
    pub fn reopen_logs(&self) {
        info!("log reopen requested");
        self.flags.reopen_logs.fetch_add(1, Ordering::SeqCst);
    }

    /// Log a status snapshot.
    pub fn dump_status(&self) {
        self.flags.dump_status.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn reload_generation(&self) -> u64 {
        self.flags.reload.load(Ordering::SeqCst)
    }

    pub(crate) fn reopen_generation(&self) -> u64 {
        self.flags.reopen_logs.load(Ordering::SeqCst)
    }

    pub(crate) fn dump_generation(&self) -> u64 {
        self.flags.dump_status.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_count_requests() {
        let ctl = Controller::default();
        assert_eq!(ctl.reload_generation(), 0);
        ctl.reload_script();
        ctl.reload_script();
        assert_eq!(ctl.reload_generation(), 2);
        assert!(!ctl.is_shutting_down());
        ctl.shutdown();
        assert!(ctl.is_shutting_down());
    }
}
