//! Persistent store backends
//!
//! The warning store talks to persistence through three primitives: insert,
//! select and change. Each query shape is a named variant so backends can
//! implement them without a query language. Two backends are provided: an
//! in-memory one and a YAML file backend that writes through on every change.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::record::{AccountName, NEVER, parse_timestamp};
use crate::LEDGER_TARGET;

/// Errors raised by a persistence backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend was closed and accepts no further queries
    #[error("Backend is closed")]
    Closed,
}

/// A warning row as persisted, fields kept in their stored text form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: u64,
    pub player_name: String,
    pub reason: String,
    pub source: String,
    #[serde(default)]
    pub expiration: Option<String>,
    pub timestamp: String,
}

impl StoredRow {
    /// Parsed expiry, or `None` when the row never expires or is unparseable
    fn expiry(&self) -> Option<DateTime<Utc>> {
        match self.expiration.as_deref() {
            None => None,
            Some(raw) if raw.eq_ignore_ascii_case(NEVER) => None,
            Some(raw) => parse_timestamp(raw),
        }
    }

    fn expired_by(&self, cutoff: DateTime<Utc>) -> bool {
        self.expiry().is_some_and(|at| at <= cutoff)
    }

    fn belongs_to(&self, account: &AccountName) -> bool {
        AccountName::new(&self.player_name) == *account
    }
}

/// Row contents for an insert; the backend assigns the id
#[derive(Debug, Clone)]
pub struct NewRow {
    pub player_name: AccountName,
    pub reason: String,
    pub source: String,
    pub expiration: Option<String>,
    pub timestamp: String,
}

impl NewRow {
    fn into_row(self, id: u64) -> StoredRow {
        StoredRow {
            id,
            player_name: self.player_name.to_string(),
            reason: self.reason,
            source: self.source,
            expiration: self.expiration,
            timestamp: self.timestamp,
        }
    }
}

/// Named select queries
#[derive(Debug, Clone)]
pub enum Select {
    /// Every row of one account
    ByAccount { account: AccountName },
    /// One row, only if it belongs to the account
    ById { id: u64, account: AccountName },
    /// Rows with an expiry at or before the cutoff
    Expired { cutoff: DateTime<Utc> },
    /// Every row
    All,
}

impl Select {
    fn matches(&self, row: &StoredRow) -> bool {
        match self {
            Self::ByAccount { account } => row.belongs_to(account),
            Self::ById { id, account } => row.id == *id && row.belongs_to(account),
            Self::Expired { cutoff } => row.expired_by(*cutoff),
            Self::All => true,
        }
    }
}

/// Named change statements
#[derive(Debug, Clone)]
pub enum Change {
    DeleteAccount { account: AccountName },
    DeleteById { id: u64, account: AccountName },
    DeleteExpired { cutoff: DateTime<Utc> },
    /// Delete these rows regardless of account or expiry
    DeleteIds { ids: Vec<u64> },
    UpdateReason { id: u64, account: AccountName, reason: String },
    UpdateExpiration { id: u64, account: AccountName, expiration: Option<String> },
}

impl Change {
    fn matches(&self, row: &StoredRow) -> bool {
        match self {
            Self::DeleteAccount { account } => row.belongs_to(account),
            Self::DeleteById { id, account }
            | Self::UpdateReason { id, account, .. }
            | Self::UpdateExpiration { id, account, .. } => row.id == *id && row.belongs_to(account),
            Self::DeleteExpired { cutoff } => row.expired_by(*cutoff),
            Self::DeleteIds { ids } => ids.contains(&row.id),
        }
    }

    fn is_delete(&self) -> bool {
        matches!(
            self,
            Self::DeleteAccount { .. }
                | Self::DeleteById { .. }
                | Self::DeleteExpired { .. }
                | Self::DeleteIds { .. }
        )
    }

    /// Apply an update to a matching row; deletes are handled by the caller
    fn update(&self, row: &mut StoredRow) {
        match self {
            Self::UpdateReason { reason, .. } => row.reason.clone_from(reason),
            Self::UpdateExpiration { expiration, .. } => row.expiration.clone_from(expiration),
            _ => {}
        }
    }
}

/// Capability set the warning store needs from persistence
#[async_trait]
pub trait WarningBackend: Send + Sync {
    /// Insert a row and return its freshly assigned id
    async fn execute_insert(&self, row: NewRow) -> Result<u64, BackendError>;

    /// Return matching rows ordered by id
    async fn execute_select(&self, query: Select) -> Result<Vec<StoredRow>, BackendError>;

    /// Apply a change and return the number of affected rows
    async fn execute_change(&self, change: Change) -> Result<u64, BackendError>;

    /// Stop accepting queries
    fn close(&self);
}

/// In-memory backend
pub struct MemoryBackend {
    rows: DashMap<u64, StoredRow>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl WarningBackend for MemoryBackend {
    async fn execute_insert(&self, row: NewRow) -> Result<u64, BackendError> {
        self.check_open()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.rows.insert(id, row.into_row(id));
        Ok(id)
    }

    async fn execute_select(&self, query: Select) -> Result<Vec<StoredRow>, BackendError> {
        self.check_open()?;
        let mut rows: Vec<StoredRow> = self
            .rows
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn execute_change(&self, change: Change) -> Result<u64, BackendError> {
        self.check_open()?;
        let ids: Vec<u64> = self
            .rows
            .iter()
            .filter(|entry| change.matches(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut affected = 0;
        for id in ids {
            if change.is_delete() {
                if self.rows.remove_if(&id, |_, row| change.matches(row)).is_some() {
                    affected += 1;
                }
            } else if let Some(mut row) = self.rows.get_mut(&id) {
                change.update(&mut row);
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// On-disk layout of the YAML data file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerFile {
    next_id: u64,
    #[serde(default)]
    rows: Vec<serde_yaml::Value>,
}

#[derive(Debug, Clone)]
struct LedgerState {
    next_id: u64,
    rows: BTreeMap<u64, StoredRow>,
}

/// File-backed backend writing the whole ledger as YAML after each change
///
/// A change is only committed in memory once the file write succeeds, so a
/// failed write leaves both the file and the in-memory state untouched.
pub struct YamlBackend {
    path: PathBuf,
    state: Mutex<LedgerState>,
    closed: AtomicBool,
}

impl YamlBackend {
    /// Open a YAML data file, starting empty if it does not exist
    ///
    /// Rows that fail to decode are logged and left out.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        let mut state = LedgerState {
            next_id: 1,
            rows: BTreeMap::new(),
        };

        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let file: LedgerFile = if content.trim().is_empty() {
                LedgerFile::default()
            } else {
                serde_yaml::from_str(&content)?
            };
            for value in file.rows {
                match serde_yaml::from_value::<StoredRow>(value) {
                    Ok(row) => {
                        state.rows.insert(row.id, row);
                    }
                    Err(e) => warn!(target: LEDGER_TARGET, "Skipping undecodable row in {}: {e}", path.display()),
                }
            }
            let highest = state.rows.keys().next_back().copied().unwrap_or(0);
            state.next_id = file.next_id.max(highest + 1).max(1);
            debug!(target: LEDGER_TARGET, rows = state.rows.len(), "Loaded ledger from {}", path.display());
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }

    async fn save(&self, state: &LedgerState) -> Result<(), BackendError> {
        let rows = state
            .rows
            .values()
            .map(serde_yaml::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let file = LedgerFile {
            next_id: state.next_id,
            rows,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let yaml = serde_yaml::to_string(&file)?;

        // Readers only ever see a complete file
        let staging = staging_path(&self.path);
        tokio::fs::write(&staging, yaml).await?;
        if let Err(e) = tokio::fs::rename(&staging, &self.path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                debug!(target: LEDGER_TARGET, "Could not remove {}: {cleanup}", staging.display());
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[async_trait]
impl WarningBackend for YamlBackend {
    async fn execute_insert(&self, row: NewRow) -> Result<u64, BackendError> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let id = next.next_id;
        next.next_id += 1;
        next.rows.insert(id, row.into_row(id));
        self.save(&next).await?;
        *state = next;
        Ok(id)
    }

    async fn execute_select(&self, query: Select) -> Result<Vec<StoredRow>, BackendError> {
        self.check_open()?;
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| query.matches(row))
            .cloned()
            .collect())
    }

    async fn execute_change(&self, change: Change) -> Result<u64, BackendError> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        let ids: Vec<u64> = state
            .rows
            .values()
            .filter(|row| change.matches(row))
            .map(|row| row.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut next = state.clone();
        for id in &ids {
            if change.is_delete() {
                next.rows.remove(id);
            } else if let Some(row) = next.rows.get_mut(id) {
                change.update(row);
            }
        }
        self.save(&next).await?;
        *state = next;
        Ok(ids.len() as u64)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
