//! Delayed punishment scheduler
//!
//! This module applies punishments, optionally after a grace period during
//! which the target has been told what is coming. Application is the single
//! cancellation point: registered [`PunishmentListener`]s may veto it.
//! Failures talking to the host are logged and never returned.

use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{LedgerEvent, ObserverRegistry};
use super::punishment::{PunishmentOrder, Sanction};
use crate::PUNISH_TARGET;
use crate::host::{BanEntry, BanTarget, HostError, SessionProvider};
use crate::messages::{Messages, PunishmentMessages};

/// Punishment about to be applied, offered to listeners for veto
#[derive(Debug)]
pub struct PunishmentEvent {
    order: PunishmentOrder,
    cancelled: bool,
}

impl PunishmentEvent {
    #[must_use]
    pub fn order(&self) -> &PunishmentOrder {
        &self.order
    }

    /// Stop the punishment from being applied
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Hook run right before a punishment is applied
pub trait PunishmentListener: Send + Sync {
    fn before_punish(&self, event: &mut PunishmentEvent);
}

/// How an application attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The ban already existed; the session was still disconnected
    AlreadyBanned,
    Cancelled,
    Unreachable,
    Failed,
}

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Grace period in seconds; zero or negative applies immediately
    pub delay_secs: i64,
    /// Tempban window used when an order has no explicit end
    pub tempban_duration: Duration,
    pub messages: Messages,
    pub punishment_messages: PunishmentMessages,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            delay_secs: 0,
            tempban_duration: Duration::days(1),
            messages: Messages::default(),
            punishment_messages: PunishmentMessages::default(),
        }
    }
}

/// Applies punishments through the host, immediately or after a delay
#[derive(Clone)]
pub struct PunishmentScheduler {
    host: Arc<dyn SessionProvider>,
    settings: Arc<SchedulerSettings>,
    observers: ObserverRegistry,
    listeners: Arc<RwLock<Vec<Arc<dyn PunishmentListener>>>>,
}

impl PunishmentScheduler {
    #[must_use]
    pub fn new(host: Arc<dyn SessionProvider>, settings: SchedulerSettings, observers: ObserverRegistry) -> Self {
        Self {
            host,
            settings: Arc::new(settings),
            observers,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PunishmentListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn PunishmentListener>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply now, or after the configured delay
    ///
    /// With a delay, the target is told immediately and the returned task
    /// applies the punishment later if the target is still reachable. An
    /// unreachable target at that point is dropped, not queued.
    pub async fn schedule(&self, order: PunishmentOrder) -> Option<JoinHandle<ApplyOutcome>> {
        let delay_secs = self.settings.delay_secs;
        if delay_secs <= 0 {
            self.apply(order).await;
            return None;
        }

        let account = order.account.clone();
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(delay_secs.unsigned_abs())).await;
            if !scheduler.host.is_reachable(&order.account).await {
                debug!(target: PUNISH_TARGET, account = %order.account, "Target left during the grace period, punishment dropped");
                return ApplyOutcome::Unreachable;
            }
            scheduler.apply(order).await
        });

        let notice = self.settings.messages.delay_notice(delay_secs);
        if let Err(e) = self.host.send_notice(&account, &notice).await {
            warn!(target: PUNISH_TARGET, account = %account, "Failed to send punishment notice: {e}");
        }
        info!(target: PUNISH_TARGET, account = %account, delay_secs, "Punishment scheduled");
        Some(handle)
    }

    /// Apply a punishment to a reachable target
    pub async fn apply(&self, order: PunishmentOrder) -> ApplyOutcome {
        if !self.host.is_reachable(&order.account).await {
            warn!(target: PUNISH_TARGET, account = %order.account, "Cannot punish an unreachable account");
            return ApplyOutcome::Unreachable;
        }

        let mut event = PunishmentEvent {
            order,
            cancelled: false,
        };
        for listener in self.listeners() {
            listener.before_punish(&mut event);
        }
        let order = event.order;
        if event.cancelled {
            info!(target: PUNISH_TARGET, account = %order.account, "Punishment cancelled by listener");
            return ApplyOutcome::Cancelled;
        }

        self.observers.dispatch(&LedgerEvent::Punished {
            account: order.account.clone(),
            sanction: order.sanction,
            issuer: order.issuer.clone(),
            reason: order.reason.clone(),
            warning_count: order.warning_count,
        });

        let message = self.settings.punishment_messages.for_sanction(order.sanction);
        let result = match order.sanction {
            Sanction::Kick => self.kick(&order, message).await,
            Sanction::Ban => {
                let target = BanTarget::Account(order.account.clone());
                self.ban(target, &order, message, order.until).await
            }
            Sanction::Tempban => {
                let until = order
                    .until
                    .unwrap_or_else(|| Utc::now() + self.settings.tempban_duration);
                let target = BanTarget::Account(order.account.clone());
                self.ban(target, &order, message, Some(until)).await
            }
            Sanction::BanIp => self.ban_ip(&order, message).await,
        };

        result.unwrap_or_else(|e| {
            error!(target: PUNISH_TARGET, account = %order.account, sanction = %order.sanction, "Failed to apply punishment: {e}");
            ApplyOutcome::Failed
        })
    }

    async fn kick(&self, order: &PunishmentOrder, message: &str) -> Result<ApplyOutcome, HostError> {
        self.host.disconnect(&order.account, message).await?;
        info!(target: PUNISH_TARGET, account = %order.account, "Kicked account");
        Ok(ApplyOutcome::Applied)
    }

    async fn ban(
        &self,
        target: BanTarget,
        order: &PunishmentOrder,
        message: &str,
        until: Option<chrono::DateTime<Utc>>,
    ) -> Result<ApplyOutcome, HostError> {
        if self.host.is_banned(&target).await? {
            info!(target: PUNISH_TARGET, account = %order.account, "{target} is already banned, skipping duplicate ban");
            self.host.disconnect(&order.account, message).await?;
            return Ok(ApplyOutcome::AlreadyBanned);
        }

        self.host
            .add_ban(BanEntry {
                target: target.clone(),
                reason: order.reason.clone(),
                expires_at: until,
                issuer: order.issuer.clone(),
            })
            .await?;
        self.host.disconnect(&order.account, message).await?;
        match until {
            Some(until) => info!(target: PUNISH_TARGET, account = %order.account, %until, "Banned {target}"),
            None => info!(target: PUNISH_TARGET, account = %order.account, "Banned {target} permanently"),
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn ban_ip(&self, order: &PunishmentOrder, message: &str) -> Result<ApplyOutcome, HostError> {
        let address = self
            .host
            .address_of(&order.account)
            .await?
            .ok_or_else(|| HostError::Failed(format!("no network address for {}", order.account)))?;

        let outcome = self
            .ban(BanTarget::Address(address.clone()), order, message, order.until)
            .await?;
        if outcome == ApplyOutcome::Applied {
            self.host.block_address(&address).await?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::host::MockSessionProvider;
    use crate::host::testing::FakeHost;
    use crate::ledger::events::testing::RecordingObserver;
    use crate::ledger::AccountName;

    fn order(sanction: Sanction) -> PunishmentOrder {
        PunishmentOrder::new(AccountName::new("Steve"), sanction, "Admin", "spam")
    }

    fn scheduler(host: Arc<FakeHost>, delay_secs: i64) -> (PunishmentScheduler, Arc<RecordingObserver>) {
        let observers = ObserverRegistry::new();
        let recorder = Arc::new(RecordingObserver::default());
        observers.register(recorder.clone());
        let settings = SchedulerSettings {
            delay_secs,
            ..SchedulerSettings::default()
        };
        (PunishmentScheduler::new(host, settings, observers), recorder)
    }

    fn online_host() -> Arc<FakeHost> {
        let host = Arc::new(FakeHost::default());
        host.set_online("steve", true);
        host
    }

    #[tokio::test]
    async fn test_kick_uses_configured_message() {
        let host = online_host();
        let (scheduler, recorder) = scheduler(host.clone(), 0);

        assert!(scheduler.schedule(order(Sanction::Kick)).await.is_none());
        let disconnects = host.disconnects();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].1, PunishmentMessages::default().kick);
        assert_eq!(recorder.names(), vec!["punished"]);
    }

    #[tokio::test]
    async fn test_duplicate_ban_still_disconnects() {
        let host = online_host();
        let (scheduler, _) = scheduler(host.clone(), 0);

        assert_eq!(scheduler.apply(order(Sanction::Ban)).await, ApplyOutcome::Applied);
        assert_eq!(scheduler.apply(order(Sanction::Ban)).await, ApplyOutcome::AlreadyBanned);
        assert_eq!(host.bans().len(), 1);
        assert_eq!(host.disconnects().len(), 2);
        assert_eq!(host.bans()[0].expires_at, None);
    }

    #[tokio::test]
    async fn test_tempban_defaults_to_configured_window() {
        let host = online_host();
        let (scheduler, _) = scheduler(host.clone(), 0);

        let before = Utc::now();
        scheduler.apply(order(Sanction::Tempban)).await;
        let until = host.bans()[0].expires_at.unwrap();
        assert!(until >= before + Duration::days(1));
        assert!(until <= Utc::now() + Duration::days(1));

        let explicit = Utc::now() + Duration::hours(2);
        host.bans.lock().unwrap().clear();
        scheduler.apply(order(Sanction::Tempban).with_until(explicit)).await;
        assert_eq!(host.bans()[0].expires_at, Some(explicit));
    }

    #[tokio::test]
    async fn test_ip_ban_blocks_address() {
        let host = online_host();
        host.set_address("steve", "10.0.0.7");
        let (scheduler, _) = scheduler(host.clone(), 0);

        assert_eq!(scheduler.apply(order(Sanction::BanIp)).await, ApplyOutcome::Applied);
        assert_eq!(host.bans()[0].target, BanTarget::Address("10.0.0.7".to_string()));
        assert_eq!(host.blocked(), vec!["10.0.0.7".to_string()]);
        assert_eq!(host.disconnects().len(), 1);

        assert_eq!(scheduler.apply(order(Sanction::BanIp)).await, ApplyOutcome::AlreadyBanned);
        assert_eq!(host.blocked().len(), 1);
        assert_eq!(host.disconnects().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_left_alone() {
        let host = Arc::new(FakeHost::default());
        let (scheduler, recorder) = scheduler(host.clone(), 0);

        assert_eq!(scheduler.apply(order(Sanction::Ban)).await, ApplyOutcome::Unreachable);
        assert!(host.bans().is_empty());
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_listener_can_cancel() {
        struct Veto(AtomicBool);
        impl PunishmentListener for Veto {
            fn before_punish(&self, event: &mut PunishmentEvent) {
                self.0.store(true, Ordering::SeqCst);
                assert_eq!(event.order().sanction, Sanction::Ban);
                event.cancel();
            }
        }

        let host = online_host();
        let (scheduler, recorder) = scheduler(host.clone(), 0);
        let veto = Arc::new(Veto(AtomicBool::new(false)));
        scheduler.add_listener(veto.clone());

        assert_eq!(scheduler.apply(order(Sanction::Ban)).await, ApplyOutcome::Cancelled);
        assert!(veto.0.load(Ordering::SeqCst));
        assert!(host.bans().is_empty());
        assert!(host.disconnects().is_empty());
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_ban_failure_is_contained() {
        let host = online_host();
        *host.fail_bans.lock().unwrap() = true;
        let (scheduler, _) = scheduler(host.clone(), 0);

        assert_eq!(scheduler.apply(order(Sanction::Ban)).await, ApplyOutcome::Failed);
        assert!(host.disconnects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_punishment_notices_then_applies() {
        let host = online_host();
        let (scheduler, _) = scheduler(host.clone(), 30);

        let handle = scheduler.schedule(order(Sanction::Kick)).await.unwrap();
        assert_eq!(host.notices_for("steve").len(), 1);
        assert!(host.notices_for("steve")[0].contains("30 seconds"));
        assert!(host.disconnects().is_empty());

        assert_eq!(handle.await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(host.disconnects().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_punishment_dropped_when_target_leaves() {
        let host = online_host();
        let (scheduler, recorder) = scheduler(host.clone(), 30);

        let handle = scheduler.schedule(order(Sanction::Ban)).await.unwrap();
        host.set_online("steve", false);

        assert_eq!(handle.await.unwrap(), ApplyOutcome::Unreachable);
        assert!(host.bans().is_empty());
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_error_is_logged_not_returned() {
        let mut host = MockSessionProvider::new();
        host.expect_is_reachable().returning(|_| true);
        host.expect_disconnect()
            .times(1)
            .returning(|_, _| Err(HostError::Failed("socket closed".to_string())));

        let scheduler = PunishmentScheduler::new(Arc::new(host), SchedulerSettings::default(), ObserverRegistry::new());
        assert_eq!(scheduler.apply(order(Sanction::Kick)).await, ApplyOutcome::Failed);
    }

    #[tokio::test]
    async fn test_missing_address_fails_ip_ban() {
        let mut host = MockSessionProvider::new();
        host.expect_is_reachable().returning(|_| true);
        host.expect_address_of().returning(|_| Ok(None));
        host.expect_add_ban().never();
        host.expect_block_address().never();

        let scheduler = PunishmentScheduler::new(Arc::new(host), SchedulerSettings::default(), ObserverRegistry::new());
        assert_eq!(scheduler.apply(order(Sanction::BanIp)).await, ApplyOutcome::Failed);
    }
}
