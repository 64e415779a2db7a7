//! Ledger service
//!
//! This module wires the store, escalation, scheduler, pending tracker and
//! sweeper into the workflows the hosting server drives: issuing a warning
//! and handling an account joining.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::escalation::{Decision, decide};
use super::pending::PendingPunishments;
use super::punishment::{PunishmentKind, PunishmentOrder};
use super::record::{self, AccountName, WarningRecord};
use super::scheduler::{ApplyOutcome, PunishmentScheduler, SchedulerSettings};
use super::store::{AccountLocks, WarningStore};
use super::sweeper::{ExpirationSweeper, SweeperHandle};
use super::LedgerResult;
use crate::host::SessionProvider;
use crate::messages::Messages;
use crate::{LEDGER_TARGET, PUNISH_TARGET};

/// When and how warnings escalate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Warning count at which the punishment applies
    pub limit: u64,
    pub kind: PunishmentKind,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            kind: PunishmentKind::None,
        }
    }
}

/// Result of issuing a warning
#[derive(Debug)]
pub struct IssueOutcome {
    pub record: WarningRecord,
    /// Active warnings after this one
    pub count: u64,
    pub decision: Decision,
    /// Delayed punishment task, when one was scheduled
    pub punishment: Option<JoinHandle<ApplyOutcome>>,
}

/// What happened when an account joined
#[derive(Debug, Default)]
pub struct JoinReport {
    /// Active warnings, `None` if the store could not be read
    pub active: Option<u64>,
    /// Warnings received since the account was last seen
    pub new_warnings: u64,
    /// Pending punishments handed back to the scheduler
    pub resubmitted: usize,
    pub punishments: Vec<JoinHandle<ApplyOutcome>>,
}

/// Application root for the warning ledger
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<WarningStore>,
    pending: Arc<PendingPunishments>,
    scheduler: PunishmentScheduler,
    host: Arc<dyn SessionProvider>,
    policy: EscalationPolicy,
    messages: Arc<Messages>,
    /// Last warning count each account was shown
    last_seen: Arc<DashMap<AccountName, u64>>,
    issue_locks: Arc<AccountLocks>,
    sweeper: Arc<Mutex<Option<SweeperHandle>>>,
}

impl LedgerService {
    #[must_use]
    pub fn new(
        store: Arc<WarningStore>,
        host: Arc<dyn SessionProvider>,
        policy: EscalationPolicy,
        settings: SchedulerSettings,
    ) -> Self {
        let messages = Arc::new(settings.messages.clone());
        let scheduler = PunishmentScheduler::new(Arc::clone(&host), settings, store.observers().clone());
        Self {
            store,
            pending: Arc::new(PendingPunishments::new()),
            scheduler,
            host,
            policy,
            messages,
            last_seen: Arc::new(DashMap::new()),
            issue_locks: Arc::new(AccountLocks::new()),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<WarningStore> {
        &self.store
    }

    #[must_use]
    pub fn pending(&self) -> &PendingPunishments {
        &self.pending
    }

    /// Issue a warning and escalate if the account reached the limit
    ///
    /// Adding, counting and deciding run under a per-account lock so two
    /// warnings for the same account cannot both decide on a stale count.
    ///
    /// # Errors
    /// Returns validation and persistence errors from the store. Punishment
    /// failures are logged only.
    pub async fn issue_warning(
        &self,
        account: &AccountName,
        reason: &str,
        source: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<IssueOutcome> {
        let _guard = self.issue_locks.lock(account).await;

        let record = self.store.add_warning(account, reason, source, expires_at).await?;
        let reachable = self.host.is_reachable(account).await;
        if reachable {
            let notice = self
                .messages
                .warned(&record.source, &record.reason, &expiration_text(&record));
            if let Err(e) = self.host.send_notice(account, &notice).await {
                warn!(target: LEDGER_TARGET, account = %account, "Failed to notify warned account: {e}");
            }
        }

        let count = self.store.get_warning_count(account).await?;
        let has_bypass = self.host.has_bypass(account).await;
        let decision = decide(count, self.policy.limit, self.policy.kind, has_bypass, reachable);

        let mut punishment = None;
        if let (Decision::ApplyNow | Decision::Defer, Some(sanction)) = (decision, self.policy.kind.sanction()) {
            info!(target: PUNISH_TARGET, account = %account, count, %decision, "Warning limit reached");
            if decision == Decision::ApplyNow {
                let order = PunishmentOrder::new(account.clone(), sanction, &record.source, &record.reason)
                    .with_warning_count(count);
                punishment = self.scheduler.schedule(order).await;
            } else {
                self.pending.add(account, sanction, &record.source, &record.reason);
            }
        }

        Ok(IssueOutcome {
            record,
            count,
            decision,
            punishment,
        })
    }

    /// Greet a joining account and deliver its pending punishments
    pub async fn handle_join(&self, account: &AccountName) -> JoinReport {
        let mut report = JoinReport::default();

        match self.store.get_warning_count(account).await {
            Ok(count) => {
                let last = self.last_seen.get(account).map_or(0, |seen| *seen);
                if count > last {
                    report.new_warnings = count - last;
                    self.notify(account, &self.messages.new_warnings(report.new_warnings)).await;
                }
                self.last_seen.insert(account.clone(), count);

                let summary = if count > 0 {
                    self.messages.active_warnings(count)
                } else {
                    self.messages.no_warnings.clone()
                };
                self.notify(account, &summary).await;
                report.active = Some(count);
            }
            Err(e) => error!(target: LEDGER_TARGET, account = %account, "Failed to read warnings on join: {e}"),
        }

        let pending = self.pending.drain(account);
        report.resubmitted = pending.len();
        for punishment in pending {
            if let Some(task) = self.scheduler.schedule(punishment.into_order()).await {
                report.punishments.push(task);
            }
        }
        if report.resubmitted > 0 {
            info!(target: PUNISH_TARGET, account = %account, count = report.resubmitted, "Delivered pending punishments");
        }

        report
    }

    /// Start the periodic expiration sweeper, replacing a running one
    pub async fn start_sweeper(&self, interval_secs: u64) {
        let sweeper = ExpirationSweeper::new(Arc::clone(&self.store), Arc::clone(&self.host), Arc::clone(&self.messages));
        let previous = self.sweeper.lock().await.replace(sweeper.start(interval_secs));
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    /// Trigger a sweep on the running sweeper
    pub async fn sweep_now(&self) {
        match self.sweeper.lock().await.as_ref() {
            Some(handle) => handle.sweep_now().await,
            None => warn!(target: LEDGER_TARGET, "Sweep requested but the sweeper is not running"),
        }
    }

    /// Stop the sweeper and close the store
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
        self.store.close();
        info!(target: LEDGER_TARGET, "Ledger service shut down");
    }

    async fn notify(&self, account: &AccountName, message: &str) {
        if let Err(e) = self.host.send_notice(account, message).await {
            warn!(target: LEDGER_TARGET, account = %account, "Failed to send notice: {e}");
        }
    }
}

/// "never expire" or "expire in 2 days (2024-01-03 10:00:00)"
fn expiration_text(record: &WarningRecord) -> String {
    match record.expires_at {
        None => "never expire".to_string(),
        Some(at) => format!(
            "expire in {} ({})",
            record::format_duration((at - Utc::now()).num_seconds()),
            record::format_timestamp(at)
        ),
    }
}
