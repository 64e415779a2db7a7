//! Expiration sweeper
//!
//! Periodically retires expired warnings: reachable owners are told, an
//! `Expired` event is emitted for every record, then exactly those records
//! are deleted in one change. A warning that expires mid-sweep waits for the
//! next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::events::LedgerEvent;
use super::store::WarningStore;
use super::{LedgerResult, SweepRequest};
use crate::LEDGER_TARGET;
use crate::host::SessionProvider;
use crate::messages::Messages;

/// Default time between sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 180;

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub notified: usize,
    pub removed: u64,
}

/// Retires expired warnings
pub struct ExpirationSweeper {
    store: Arc<WarningStore>,
    host: Arc<dyn SessionProvider>,
    messages: Arc<Messages>,
}

/// Running sweeper task
pub struct SweeperHandle {
    tx: Sender<SweepRequest>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Ask for a sweep outside the regular schedule
    pub async fn sweep_now(&self) {
        if self.tx.send(SweepRequest::SweepNow).await.is_err() {
            warn!(target: LEDGER_TARGET, "Sweeper task is gone, sweep request dropped");
        }
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(self) {
        if self.tx.send(SweepRequest::Shutdown).await.is_err() {
            debug!(target: LEDGER_TARGET, "Sweeper task already stopped");
        }
        if let Err(e) = self.task.await {
            error!(target: LEDGER_TARGET, "Sweeper task ended abnormally: {e}");
        }
    }
}

impl ExpirationSweeper {
    #[must_use]
    pub fn new(store: Arc<WarningStore>, host: Arc<dyn SessionProvider>, messages: Arc<Messages>) -> Self {
        Self { store, host, messages }
    }

    /// Run a single sweep
    ///
    /// A failed notice is logged and the sweep carries on with the next
    /// record.
    ///
    /// # Errors
    /// Returns a persistence error if the expired warnings cannot be listed
    /// or deleted.
    pub async fn run_once(&self) -> LedgerResult<SweepReport> {
        let cutoff = Utc::now();
        let expired = self.store.get_expired_warnings_at(cutoff).await?;
        if expired.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut notified = 0;
        for record in &expired {
            if self.host.is_reachable(&record.account).await {
                let notice = self.messages.expired(&record.reason);
                match self.host.send_notice(&record.account, &notice).await {
                    Ok(()) => notified += 1,
                    Err(e) => warn!(
                        target: LEDGER_TARGET,
                        account = %record.account,
                        warning_id = record.id,
                        "Failed to send expiry notice: {e}"
                    ),
                }
            }
            self.store.observers().dispatch(&LedgerEvent::Expired {
                record: record.clone(),
            });
        }

        let ids: Vec<u64> = expired.iter().map(|record| record.id).collect();
        let removed = self.store.remove_warnings_by_ids(&ids).await?;
        info!(target: LEDGER_TARGET, expired = expired.len(), notified, removed, "Expired warnings swept");
        Ok(SweepReport {
            expired: expired.len(),
            notified,
            removed,
        })
    }

    /// Spawn the periodic sweep task
    ///
    /// The first sweep happens one interval after start.
    #[must_use]
    pub fn start(self, interval_secs: u64) -> SweeperHandle {
        let (tx, rx) = mpsc::channel::<SweepRequest>(16);
        let task = tokio::spawn(async move {
            self.sweep_task(rx, interval_secs).await;
        });
        SweeperHandle { tx, task }
    }

    async fn sweep_task(&self, mut rx: Receiver<SweepRequest>, interval_secs: u64) {
        info!(target: LEDGER_TARGET, "Starting expiration sweeper with {interval_secs}s interval");

        let period = Duration::from_secs(interval_secs.max(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(request) = rx.recv() => {
                    match request {
                        SweepRequest::SweepNow => {
                            debug!(target: LEDGER_TARGET, "Received request to sweep now");
                            if let Err(e) = self.run_once().await {
                                error!(target: LEDGER_TARGET, "Error sweeping expired warnings: {e}");
                            }
                        }
                        SweepRequest::Shutdown => {
                            info!(target: LEDGER_TARGET, "Received shutdown request for expiration sweeper");
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(target: LEDGER_TARGET, "Error in periodic expiration sweep: {e}");
                    }
                }
            }
        }

        info!(target: LEDGER_TARGET, "Expiration sweeper shut down");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::host::testing::FakeHost;
    use crate::host::{BanEntry, BanTarget, HostError};
    use crate::ledger::backend::MemoryBackend;
    use crate::ledger::events::ObserverRegistry;
    use crate::ledger::events::testing::RecordingObserver;
    use crate::ledger::record::AccountName;

    struct Fixture {
        store: Arc<WarningStore>,
        host: Arc<FakeHost>,
        recorder: Arc<RecordingObserver>,
    }

    impl Fixture {
        fn new() -> Self {
            let observers = ObserverRegistry::new();
            let recorder = Arc::new(RecordingObserver::default());
            observers.register(recorder.clone());
            let store = Arc::new(WarningStore::new(Arc::new(MemoryBackend::new()), observers));
            Self {
                store,
                host: Arc::new(FakeHost::default()),
                recorder,
            }
        }

        fn sweeper(&self) -> ExpirationSweeper {
            ExpirationSweeper::new(self.store.clone(), self.host.clone(), Arc::new(Messages::default()))
        }

        /// Add a warning and push its expiry into the past
        async fn add_expired(&self, account: &str, reason: &str) -> u64 {
            let account = AccountName::new(account);
            let record = self.store.add_warning(&account, reason, "Console", None).await.unwrap();
            let past = Utc::now() - ChronoDuration::minutes(5);
            self.store.edit_expiration(record.id, &account, Some(past)).await.unwrap();
            record.id
        }
    }

    #[tokio::test]
    async fn test_sweep_notifies_reachable_and_emits_for_all() {
        let fixture = Fixture::new();
        fixture.host.set_online("steve", true);
        fixture.add_expired("steve", "spam").await;
        fixture.add_expired("alex", "griefing").await;
        fixture
            .store
            .add_warning(&"steve".into(), "fresh", "Console", None)
            .await
            .unwrap();

        let report = fixture.sweeper().run_once().await.unwrap();
        assert_eq!(report, SweepReport { expired: 2, notified: 1, removed: 2 });
        assert_eq!(
            fixture.host.notices_for("steve"),
            vec!["Your warning has expired: spam".to_string()]
        );
        assert!(fixture.host.notices_for("alex").is_empty());

        let expired_events = fixture.recorder.names().into_iter().filter(|n| *n == "expired").count();
        assert_eq!(expired_events, 2);
        assert_eq!(fixture.store.get_warning_count(&"steve".into()).await.unwrap(), 1);

        let again = fixture.sweeper().run_once().await.unwrap();
        assert_eq!(again, SweepReport::default());
    }

    /// Host that expires another warning the first time it is asked about reachability
    struct ExpiringHost {
        store: Arc<WarningStore>,
        late: (u64, AccountName),
        fired: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl SessionProvider for ExpiringHost {
        async fn is_reachable(&self, _account: &AccountName) -> bool {
            if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let past = Utc::now() - ChronoDuration::seconds(1);
                let (id, account) = &self.late;
                self.store.edit_expiration(*id, account, Some(past)).await.unwrap();
            }
            false
        }

        async fn has_bypass(&self, _account: &AccountName) -> bool {
            false
        }

        async fn send_notice(&self, _account: &AccountName, _message: &str) -> Result<(), HostError> {
            Ok(())
        }

        async fn disconnect(&self, _account: &AccountName, _message: &str) -> Result<(), HostError> {
            Ok(())
        }

        async fn address_of(&self, _account: &AccountName) -> Result<Option<String>, HostError> {
            Ok(None)
        }

        async fn is_banned(&self, _target: &BanTarget) -> Result<bool, HostError> {
            Ok(false)
        }

        async fn add_ban(&self, _entry: BanEntry) -> Result<(), HostError> {
            Ok(())
        }

        async fn block_address(&self, _address: &str) -> Result<(), HostError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_warning_expiring_mid_sweep_is_kept_for_next_sweep() {
        let fixture = Fixture::new();
        let announced = fixture.add_expired("steve", "spam").await;
        let alex = AccountName::new("alex");
        let late = fixture
            .store
            .add_warning(&alex, "griefing", "Console", None)
            .await
            .unwrap();

        let host = Arc::new(ExpiringHost {
            store: fixture.store.clone(),
            late: (late.id, alex.clone()),
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        let sweeper = ExpirationSweeper::new(fixture.store.clone(), host, Arc::new(Messages::default()));

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport { expired: 1, notified: 0, removed: 1 });
        let expired_ids: Vec<u64> = fixture
            .recorder
            .events()
            .into_iter()
            .filter_map(|event| match event {
                LedgerEvent::Expired { record } => Some(record.id),
                _ => None,
            })
            .collect();
        assert_eq!(expired_ids, vec![announced]);

        // Still stored, and announced by the following sweep
        let pending = fixture.store.get_expired_warnings().await.unwrap();
        assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![late.id]);
        let next = sweeper.run_once().await.unwrap();
        assert_eq!(next.removed, 1);
    }

    #[tokio::test]
    async fn test_failed_notice_does_not_abort_sweep() {
        let fixture = Fixture::new();
        fixture.host.set_online("steve", true);
        fixture.host.set_online("alex", true);
        fixture
            .host
            .fail_notices_for
            .lock()
            .unwrap()
            .insert(AccountName::new("steve"));
        fixture.add_expired("steve", "spam").await;
        fixture.add_expired("alex", "griefing").await;

        let report = fixture.sweeper().run_once().await.unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(report.notified, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(fixture.host.notices_for("alex").len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_request_channel() {
        let fixture = Fixture::new();
        fixture.add_expired("steve", "spam").await;

        let handle = fixture.sweeper().start(3_600);
        handle.sweep_now().await;
        handle.shutdown().await;

        assert!(fixture.store.get_expired_warnings().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let fixture = Fixture::new();
        fixture.add_expired("steve", "spam").await;

        let handle = fixture.sweeper().start(DEFAULT_SWEEP_INTERVAL_SECS);
        tokio::time::sleep(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS + 1)).await;
        assert!(fixture.store.get_expired_warnings().await.unwrap().is_empty());
        handle.shutdown().await;
    }
}
