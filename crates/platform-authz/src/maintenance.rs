//! Background maintenance.
//!
//! Expired temporary grants already resolve to "absent" at check time, so
//! the sweeper only reclaims memory. It also prunes the audit log to the
//! configured retention.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::AccessEngine;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired temporary grants removed.
    pub expired_grants: usize,
    /// Audit entries pruned.
    pub pruned_entries: usize,
}

/// Run one sweep over the engine.
pub fn sweep(engine: &AccessEngine) -> SweepReport {
    let report = SweepReport {
        expired_grants: engine.sweep_expired(),
        pruned_entries: engine.prune_audit(),
    };
    if report != SweepReport::default() {
        tracing::info!(
            expired_grants = report.expired_grants,
            pruned_entries = report.pruned_entries,
            "Maintenance sweep"
        );
    }
    report
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "Sweeper task ended abnormally");
        }
    }

    /// Check if the task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Spawn a task that sweeps the engine every `interval`.
///
/// Must be called from within a tokio runtime.
pub fn spawn_sweeper(engine: Arc<AccessEngine>, interval: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(interval_ms = interval.as_millis() as u64, "Sweeper started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    sweep(&engine);
                }
            }
        }
        tracing::debug!("Sweeper stopped");
    });
    SweeperHandle { shutdown_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn test_sweeper_purges_expired_grants() {
        let engine = Arc::new(AccessEngine::new(EngineConfig::default()).unwrap());
        engine
            .grant_temporary("guest", "user.read", Duration::from_millis(50), None)
            .unwrap();
        assert_eq!(engine.grants().temporary_grants().len(), 1);

        let handle = spawn_sweeper(Arc::clone(&engine), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(engine.grants().temporary_grants().is_empty());
        assert!(handle.is_running());
        handle.shutdown().await;
    }

    #[test]
    fn test_sweep_keeps_live_grants() {
        let engine = AccessEngine::new(EngineConfig::default()).unwrap();
        engine
            .grant_temporary("guest", "user.read", Duration::from_secs(3600), None)
            .unwrap();

        assert_eq!(sweep(&engine), SweepReport::default());
        assert_eq!(engine.grants().temporary_grants().len(), 1);
    }
}
