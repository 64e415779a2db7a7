//! Pending punishment tracker
//!
//! Holds punishments that could not be applied because the target was
//! offline. Entries are kept for 24 hours at most.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use super::punishment::{PunishmentOrder, Sanction};
use super::record::AccountName;
use crate::PUNISH_TARGET;

/// How long a deferred punishment stays deliverable
pub const RETENTION_HOURS: i64 = 24;

/// A punishment waiting for its target to come back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPunishment {
    pub account: AccountName,
    pub sanction: Sanction,
    pub issuer: String,
    pub reason: String,
    pub queued_at: DateTime<Utc>,
}

impl PendingPunishment {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.queued_at > Duration::hours(RETENTION_HOURS)
    }

    /// Turn the entry back into an order for the scheduler
    #[must_use]
    pub fn into_order(self) -> PunishmentOrder {
        PunishmentOrder::new(self.account, self.sanction, self.issuer, self.reason)
    }
}

/// Per-account queues of deferred punishments
#[derive(Debug, Default)]
pub struct PendingPunishments {
    entries: DashMap<AccountName, Vec<PendingPunishment>>,
}

impl PendingPunishments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a punishment, purging stale entries of every account first
    pub fn add(&self, account: &AccountName, sanction: Sanction, issuer: &str, reason: &str) {
        let now = Utc::now();
        self.purge_stale(now);
        self.push(account, sanction, issuer, reason, now);
        info!(target: PUNISH_TARGET, account = %account, %sanction, "Punishment deferred until the account is reachable");
    }

    fn push(
        &self,
        account: &AccountName,
        sanction: Sanction,
        issuer: &str,
        reason: &str,
        queued_at: DateTime<Utc>,
    ) {
        self.entries
            .entry(account.clone())
            .or_default()
            .push(PendingPunishment {
                account: account.clone(),
                sanction,
                issuer: issuer.to_string(),
                reason: reason.to_string(),
                queued_at,
            });
    }

    #[must_use]
    pub fn has_pending(&self, account: &AccountName) -> bool {
        self.entries.get(account).is_some_and(|list| !list.is_empty())
    }

    /// Queued punishments of an account in the order they were added
    #[must_use]
    pub fn get_pending(&self, account: &AccountName) -> Vec<PendingPunishment> {
        self.entries.get(account).map(|list| list.clone()).unwrap_or_default()
    }

    pub fn clear(&self, account: &AccountName) {
        self.entries.remove(account);
    }

    /// Take ownership of an account's queue, dropping stale entries
    ///
    /// Removal is a single map operation, so an `add` racing with a drain is
    /// either part of the returned list or stays queued for the next drain.
    #[must_use]
    pub fn drain(&self, account: &AccountName) -> Vec<PendingPunishment> {
        let now = Utc::now();
        let Some((_, list)) = self.entries.remove(account) else {
            return Vec::new();
        };
        let total = list.len();
        let fresh: Vec<PendingPunishment> = list.into_iter().filter(|p| !p.is_stale(now)).collect();
        if fresh.len() < total {
            debug!(target: PUNISH_TARGET, account = %account, dropped = total - fresh.len(), "Dropped stale pending punishments");
        }
        fresh
    }

    /// Remove entries older than the retention window
    pub fn purge_stale(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, list| {
            list.retain(|p| !p.is_stale(now));
            !list.is_empty()
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn add_queued_at(
        &self,
        account: &AccountName,
        sanction: Sanction,
        issuer: &str,
        reason: &str,
        queued_at: DateTime<Utc>,
    ) {
        self.push(account, sanction, issuer, reason, queued_at);
    }
}
