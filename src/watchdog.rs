//! GraphiVault - Idle Watchdog
//!
//! Background tokio task that drives the idle timeout, so an unattended
//! session locks even when nothing touches the vault.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::vault::Vault;

/// Default check interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle to a running watchdog
pub struct IdleWatchdog {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl IdleWatchdog {
    /// Spawn on the current tokio runtime
    pub fn spawn(vault: Arc<Vault>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // First tick fires immediately

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let vault = Arc::clone(&vault);
                        // Locking touches the audit file
                        match tokio::task::spawn_blocking(move || vault.check_timeout()).await {
                            Ok(true) => log::info!("Watchdog locked idle session"),
                            Ok(false) => {}
                            Err(e) => log::error!("Watchdog check failed: {}", e),
                        }
                    }
                    _ = stop.notified() => break,
                }
            }

            log::debug!("Idle watchdog stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop and wait for the task to finish
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            log::warn!("Idle watchdog ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::config::VaultConfig;
    use crate::crypto::kdf::{KdfParams, StandardKdf};
    use crate::session::{ManualClock, SessionPhase};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_watchdog_locks_idle_session() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let config = VaultConfig {
            kdf: KdfParams::pbkdf2_sha512(1_000),
            ..VaultConfig::default()
        };
        let vault = Arc::new(
            Vault::with_parts(dir.path(), config, clock.clone(), Arc::new(StandardKdf)).unwrap(),
        );
        vault.initialize_vault(&"correct-horse".into()).unwrap();
        vault.unlock(&"correct-horse".into()).unwrap();

        let watchdog = IdleWatchdog::spawn(Arc::clone(&vault), Duration::from_millis(10));

        clock.advance(chrono::Duration::minutes(31));
        let mut locked = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            // Status queries would lock on their own; only the audit trail
            // shows the watchdog did it
            let events = vault.audit_events(10).unwrap();
            if events.iter().any(|e| e.event == AuditEvent::IdleTimeout) {
                locked = true;
                break;
            }
        }
        watchdog.stop().await;

        assert!(locked);
        assert_eq!(vault.get_status().session.state, SessionPhase::Locked);
    }
}
