//! Legacy JSON import
//!
//! Older installs kept warnings in one JSON file keyed by account name, each
//! value a list of `{player, reason, source, timestamp, expiration}` objects.
//! The import re-adds every entry through the store and then renames the file
//! with a `.migrated` suffix so it only runs once.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::backend::BackendError;
use super::record::{self, AccountName, NEVER};
use super::store::WarningStore;
use super::LedgerResult;
use crate::LEDGER_TARGET;

/// Suffix given to the legacy file after import
pub const MIGRATED_SUFFIX: &str = ".migrated";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    player: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

/// Import a legacy warnings file if it exists
///
/// Returns `None` when there is nothing to import. Entries that cannot be
/// imported are logged and skipped.
///
/// # Errors
/// Returns an error if the file cannot be read, is not valid JSON, or cannot
/// be renamed afterwards.
pub async fn migrate_legacy_file(store: &WarningStore, path: impl AsRef<Path>) -> LedgerResult<Option<MigrationReport>> {
    let path = path.as_ref();
    if !tokio::fs::try_exists(path).await.map_err(BackendError::from)? {
        return Ok(None);
    }

    info!(target: LEDGER_TARGET, "Migrating warnings from {}", path.display());
    let content = tokio::fs::read_to_string(path).await.map_err(BackendError::from)?;
    let root: Value = serde_json::from_str(&content).map_err(BackendError::from)?;

    let accounts = match root {
        Value::Object(mut map) => match map.remove("warns") {
            Some(Value::Object(warns)) => warns,
            Some(other) => {
                map.insert("warns".to_string(), other);
                map
            }
            None => map,
        },
        _ => return Err(super::LedgerError::validation("legacy warnings file must hold a JSON object")),
    };

    let mut report = MigrationReport::default();
    for (key, entries) in accounts {
        let Value::Array(entries) = entries else {
            warn!(target: LEDGER_TARGET, account = %key, "Skipping legacy account with a non-list value");
            report.skipped += 1;
            continue;
        };
        for value in entries {
            match import_entry(store, &key, value).await {
                Ok(()) => report.migrated += 1,
                Err(e) => {
                    warn!(target: LEDGER_TARGET, account = %key, "Failed to migrate a warning: {e}");
                    report.skipped += 1;
                }
            }
        }
    }

    let backup = migrated_path(path);
    tokio::fs::rename(path, &backup).await.map_err(BackendError::from)?;
    info!(
        target: LEDGER_TARGET,
        migrated = report.migrated,
        skipped = report.skipped,
        "Legacy warnings migrated, original kept at {}",
        backup.display()
    );
    Ok(Some(report))
}

async fn import_entry(store: &WarningStore, key: &str, value: Value) -> LedgerResult<()> {
    let entry: LegacyEntry = serde_json::from_value(value).map_err(BackendError::from)?;
    let account = AccountName::new(entry.player.as_deref().unwrap_or(key));
    let reason = entry.reason.unwrap_or_else(|| "Unknown".to_string());
    let source = entry.source.unwrap_or_else(|| "Console".to_string());

    match legacy_expiration(entry.expiration.as_deref())? {
        LegacyExpiry::Never => store.add_warning(&account, &reason, &source, None).await?,
        LegacyExpiry::At(at) => store.add_warning(&account, &reason, &source, Some(at)).await?,
        // Counted from the moment the warning is stored, however short
        LegacyExpiry::After(duration) => {
            store
                .add_warning_lasting(&account, &reason, &source, Some(duration))
                .await?
        }
    };
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacyExpiry {
    Never,
    At(DateTime<Utc>),
    After(Duration),
}

/// Legacy expirations are a timestamp, a duration string, or "Never"
fn legacy_expiration(raw: Option<&str>) -> LedgerResult<LegacyExpiry> {
    match raw.map(str::trim) {
        None | Some("") => Ok(LegacyExpiry::Never),
        Some(raw) if raw.eq_ignore_ascii_case(NEVER) => Ok(LegacyExpiry::Never),
        Some(raw) => match record::parse_timestamp(raw) {
            Some(at) => Ok(LegacyExpiry::At(at)),
            None => Ok(record::parse_duration(raw)?.map_or(LegacyExpiry::Never, LegacyExpiry::After)),
        },
    }
}

fn migrated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(MIGRATED_SUFFIX);
    PathBuf::from(name)
}
