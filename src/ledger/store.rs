//! Warning store
//!
//! This module provides the warning store: persistence of warning records
//! through a [`WarningBackend`], the cached per-account count, and lifecycle
//! events. Mutations on the same account are serialized by a per-account
//! lock, which is held until the resulting events have been dispatched so
//! observers see each account's changes in commit order.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use super::backend::{Change, NewRow, Select, StoredRow, WarningBackend};
use super::cache::{COUNT_PATTERN, CountCache};
use super::events::{EditField, LedgerEvent, ObserverRegistry};
use super::record::{self, AccountName, WarningRecord};
use super::LedgerResult;
use crate::LEDGER_TARGET;

/// Per-account async mutexes
///
/// An account's entry is dropped again once nobody holds or waits on it.
#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: DashMap<AccountName, Arc<Mutex<()>>>,
}

impl AccountLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an account
    pub async fn lock(&self, account: &AccountName) -> AccountGuard<'_> {
        let lock = Arc::clone(
            self.locks
                .entry(account.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        AccountGuard {
            guard: Some(lock.lock_owned().await),
            locks: &self.locks,
            account: account.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one account, released on drop
pub struct AccountGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<AccountName, Arc<Mutex<()>>>,
    account: AccountName,
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        // Release first so the guard's own reference is gone before counting
        drop(self.guard.take());
        self.locks
            .remove_if(&self.account, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Aggregate view of one account's active warnings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub account: AccountName,
    pub count: u64,
    pub latest: DateTime<Utc>,
    pub ids: Vec<u64>,
}

/// Store for warning records
pub struct WarningStore {
    backend: Arc<dyn WarningBackend>,
    cache: CountCache,
    observers: ObserverRegistry,
    locks: AccountLocks,
}

impl WarningStore {
    /// Create a store with the default count TTL
    #[must_use]
    pub fn new(backend: Arc<dyn WarningBackend>, observers: ObserverRegistry) -> Self {
        Self {
            backend,
            cache: CountCache::new(),
            observers,
            locks: AccountLocks::new(),
        }
    }

    /// Create a store with a custom count TTL in seconds
    ///
    /// # Errors
    /// Returns a validation error if the TTL is above one day.
    pub fn with_cache_ttl(
        backend: Arc<dyn WarningBackend>,
        observers: ObserverRegistry,
        cache_ttl: u64,
    ) -> LedgerResult<Self> {
        Ok(Self {
            cache: CountCache::with_ttl(cache_ttl)?,
            ..Self::new(backend, observers)
        })
    }

    #[must_use]
    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Add a warning and return the persisted record
    ///
    /// # Errors
    /// Returns a validation error for blank text or an expiry not after now,
    /// and a persistence error if the backend fails.
    pub async fn add_warning(
        &self,
        account: &AccountName,
        reason: &str,
        source: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<WarningRecord> {
        let created_at = record::now();
        self.insert(account, reason, source, created_at, expires_at).await
    }

    /// Add a warning that lasts `duration` from its creation; `None` never expires
    ///
    /// # Errors
    /// Same as [`WarningStore::add_warning`].
    pub async fn add_warning_lasting(
        &self,
        account: &AccountName,
        reason: &str,
        source: &str,
        duration: Option<Duration>,
    ) -> LedgerResult<WarningRecord> {
        let created_at = record::now();
        let expires_at = match duration {
            None => None,
            Some(duration) => Some(
                created_at
                    .checked_add_signed(duration)
                    .ok_or_else(|| super::LedgerError::validation("warning duration is out of range"))?,
            ),
        };
        self.insert(account, reason, source, created_at, expires_at).await
    }

    async fn insert(
        &self,
        account: &AccountName,
        reason: &str,
        source: &str,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<WarningRecord> {
        if account.is_empty() {
            return Err(super::LedgerError::validation("account name must not be empty"));
        }
        let reason = record::require_text("reason", reason)?;
        let source = record::require_text("source", source)?;
        let expires_at = record::validate_expiry(created_at, expires_at)?;

        let _guard = self.locks.lock(account).await;
        let record = {
            let row = NewRow {
                player_name: account.clone(),
                reason: reason.clone(),
                source: source.clone(),
                expiration: expires_at.map(record::format_timestamp),
                timestamp: record::format_timestamp(created_at),
            };
            let id = self.backend.execute_insert(row).await.map_err(|e| {
                error!(target: LEDGER_TARGET, account = %account, "Failed to add warning: {e}");
                e
            })?;
            self.cache.invalidate(&CountCache::count_key(account));
            WarningRecord {
                id,
                account: account.clone(),
                reason,
                source,
                created_at,
                expires_at,
            }
        };

        info!(target: LEDGER_TARGET, account = %account, warning_id = record.id, "Warning added");
        self.observers.dispatch(&LedgerEvent::Added {
            record: record.clone(),
        });
        Ok(record)
    }

    /// Remove every warning of an account and return how many were removed
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn remove_all_warnings(&self, account: &AccountName) -> LedgerResult<u64> {
        let _guard = self.locks.lock(account).await;
        let (removed, records) = {
            let rows = self
                .backend
                .execute_select(Select::ByAccount {
                    account: account.clone(),
                })
                .await?;
            if rows.is_empty() {
                return Ok(0);
            }
            let removed = self
                .backend
                .execute_change(Change::DeleteAccount {
                    account: account.clone(),
                })
                .await?;
            self.cache.invalidate(&CountCache::count_key(account));
            (removed, decode_rows(&rows))
        };

        info!(target: LEDGER_TARGET, account = %account, removed, "Warnings cleared");
        for record in records {
            self.observers.dispatch(&LedgerEvent::Removed { record });
        }
        Ok(removed)
    }

    /// Remove one warning, only if it belongs to `account`
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn remove_warning_by_id(&self, id: u64, account: &AccountName) -> LedgerResult<bool> {
        let _guard = self.locks.lock(account).await;
        let record = {
            let rows = self
                .backend
                .execute_select(Select::ById {
                    id,
                    account: account.clone(),
                })
                .await?;
            let affected = self
                .backend
                .execute_change(Change::DeleteById {
                    id,
                    account: account.clone(),
                })
                .await?;
            if affected == 0 {
                return Ok(false);
            }
            self.cache.invalidate(&CountCache::count_key(account));
            decode_rows(&rows).into_iter().next()
        };

        info!(target: LEDGER_TARGET, account = %account, warning_id = id, "Warning removed");
        if let Some(record) = record {
            self.observers.dispatch(&LedgerEvent::Removed { record });
        }
        Ok(true)
    }

    /// Active warnings of an account, oldest first
    ///
    /// Rows that cannot be decoded are logged and skipped.
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn get_warnings(&self, account: &AccountName) -> LedgerResult<Vec<WarningRecord>> {
        let rows = self
            .backend
            .execute_select(Select::ByAccount {
                account: account.clone(),
            })
            .await?;
        let now = Utc::now();
        let mut records: Vec<WarningRecord> = decode_rows(&rows)
            .into_iter()
            .filter(|record| !record.is_expired_at(now))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Number of active warnings, served from cache when fresh
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails on a cache miss.
    pub async fn get_warning_count(&self, account: &AccountName) -> LedgerResult<u64> {
        let key = CountCache::count_key(account);
        if let Some(count) = self.cache.get(&key) {
            return Ok(count);
        }

        let _guard = self.locks.lock(account).await;
        if let Some(count) = self.cache.get(&key) {
            return Ok(count);
        }
        let count = self.get_warnings(account).await?.len() as u64;
        self.cache.set(key, count);
        debug!(target: LEDGER_TARGET, account = %account, count, "Warning count cached");
        Ok(count)
    }

    /// Replace a warning's reason; `false` if no such warning for the account
    ///
    /// # Errors
    /// Returns a validation error for a blank reason and a persistence error
    /// if the backend fails.
    pub async fn edit_reason(&self, id: u64, account: &AccountName, new_reason: &str) -> LedgerResult<bool> {
        let new_reason = record::require_text("reason", new_reason)?;

        let _guard = self.locks.lock(account).await;
        let event = {
            let Some(current) = self.fetch_one(id, account).await? else {
                return Ok(false);
            };
            let affected = self
                .backend
                .execute_change(Change::UpdateReason {
                    id,
                    account: account.clone(),
                    reason: new_reason.clone(),
                })
                .await?;
            if affected == 0 {
                return Ok(false);
            }
            self.cache.invalidate(&CountCache::count_key(account));

            let old = current.reason.clone();
            LedgerEvent::Edited {
                record: WarningRecord {
                    reason: new_reason.clone(),
                    ..current
                },
                field: EditField::Reason,
                old,
                new: new_reason,
            }
        };

        info!(target: LEDGER_TARGET, account = %account, warning_id = id, "Warning reason edited");
        self.observers.dispatch(&event);
        Ok(true)
    }

    /// Replace a warning's expiration; `None` makes it permanent
    ///
    /// A past expiration is accepted; the next sweep retires the warning.
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn edit_expiration(
        &self,
        id: u64,
        account: &AccountName,
        new_expiration: Option<DateTime<Utc>>,
    ) -> LedgerResult<bool> {
        let new_expiration = new_expiration.map(|at| at.trunc_subsecs(0));

        let _guard = self.locks.lock(account).await;
        let event = {
            let Some(current) = self.fetch_one(id, account).await? else {
                return Ok(false);
            };
            let affected = self
                .backend
                .execute_change(Change::UpdateExpiration {
                    id,
                    account: account.clone(),
                    expiration: new_expiration.map(record::format_timestamp),
                })
                .await?;
            if affected == 0 {
                return Ok(false);
            }
            self.cache.invalidate(&CountCache::count_key(account));

            let old = current.expiration_label();
            let new = record::format_expiration(new_expiration);
            LedgerEvent::Edited {
                record: WarningRecord {
                    expires_at: new_expiration,
                    ..current
                },
                field: EditField::Expiration,
                old,
                new,
            }
        };

        info!(target: LEDGER_TARGET, account = %account, warning_id = id, "Warning expiration edited");
        self.observers.dispatch(&event);
        Ok(true)
    }

    /// Every warning expired as of now, across all accounts
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn get_expired_warnings(&self) -> LedgerResult<Vec<WarningRecord>> {
        self.get_expired_warnings_at(Utc::now()).await
    }

    /// Every warning with an expiry at or before `cutoff`
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn get_expired_warnings_at(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<WarningRecord>> {
        let rows = self.backend.execute_select(Select::Expired { cutoff }).await?;
        Ok(decode_rows(&rows))
    }

    /// Delete every warning expired as of now
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn remove_expired_warnings(&self) -> LedgerResult<u64> {
        self.remove_expired_warnings_before(Utc::now()).await
    }

    /// Delete every warning with an expiry at or before `cutoff`
    ///
    /// Removing already-removed warnings is not an error; it affects zero rows.
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn remove_expired_warnings_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let removed = self.backend.execute_change(Change::DeleteExpired { cutoff }).await?;
        if removed > 0 {
            let invalidated = self.cache.invalidate_matching(COUNT_PATTERN);
            debug!(target: LEDGER_TARGET, removed, invalidated, "Expired warnings removed");
        }
        Ok(removed)
    }

    /// Delete exactly the given warnings, whatever their expiry now is
    ///
    /// Ids that are already gone are skipped, so repeating a removal affects
    /// zero rows.
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn remove_warnings_by_ids(&self, ids: &[u64]) -> LedgerResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self
            .backend
            .execute_change(Change::DeleteIds { ids: ids.to_vec() })
            .await?;
        if removed > 0 {
            let invalidated = self.cache.invalidate_matching(COUNT_PATTERN);
            debug!(target: LEDGER_TARGET, removed, invalidated, "Warnings removed by id");
        }
        Ok(removed)
    }

    /// Accounts with active warnings, most warned first then by name
    ///
    /// # Errors
    /// Returns a persistence error if the backend fails.
    pub async fn get_all_accounts_with_warnings(&self) -> LedgerResult<Vec<AccountSummary>> {
        let rows = self.backend.execute_select(Select::All).await?;
        let now = Utc::now();

        let mut grouped: BTreeMap<AccountName, AccountSummary> = BTreeMap::new();
        for record in decode_rows(&rows) {
            if record.is_expired_at(now) {
                continue;
            }
            let summary = grouped
                .entry(record.account.clone())
                .or_insert_with(|| AccountSummary {
                    account: record.account.clone(),
                    count: 0,
                    latest: record.created_at,
                    ids: Vec::new(),
                });
            summary.count += 1;
            summary.latest = summary.latest.max(record.created_at);
            summary.ids.push(record.id);
        }

        let mut summaries: Vec<AccountSummary> = grouped.into_values().collect();
        summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.account.cmp(&b.account)));
        Ok(summaries)
    }

    /// Drop the cache and close the backend
    pub fn close(&self) {
        self.cache.clear();
        self.backend.close();
        info!(target: LEDGER_TARGET, "Warning store closed");
    }

    async fn fetch_one(&self, id: u64, account: &AccountName) -> LedgerResult<Option<WarningRecord>> {
        let rows = self
            .backend
            .execute_select(Select::ById {
                id,
                account: account.clone(),
            })
            .await?;
        Ok(decode_rows(&rows).into_iter().next())
    }
}

/// Decode rows, logging and skipping the malformed ones
fn decode_rows(rows: &[StoredRow]) -> Vec<WarningRecord> {
    rows.iter()
        .filter_map(|row| match WarningRecord::from_row(row) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(target: LEDGER_TARGET, warning_id = row.id, "Skipping stored warning: {e}");
                None
            }
        })
        .collect()
}
