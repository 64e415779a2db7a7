//! Warning records and account identity
//!
//! This module defines the warning record, the normalized account name it is
//! keyed by, and the text formats used for timestamps and durations.

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::backend::StoredRow;
use super::{LedgerError, LedgerResult};

/// Storage format for timestamps
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Label used for warnings that never expire
pub const NEVER: &str = "Never";

/// Case-insensitive account identity, always held in lowercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct AccountName(String);

impl AccountName {
    /// Normalize a raw account name
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for AccountName {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for AccountName {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<AccountName> for String {
    fn from(name: AccountName) -> Self {
        name.0
    }
}

/// A single persisted warning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningRecord {
    /// Store-assigned identifier, never reused
    pub id: u64,
    /// Account the warning was issued against
    pub account: AccountName,
    /// Why the warning was issued
    pub reason: String,
    /// Who issued it (an admin name or "Console")
    pub source: String,
    /// When the warning was created
    pub created_at: DateTime<Utc>,
    /// When the warning expires, if ever
    pub expires_at: Option<DateTime<Utc>>,
}

impl WarningRecord {
    /// Decode a stored row, rejecting rows with unusable fields
    ///
    /// # Errors
    /// Returns `LedgerError::MalformedRow` if any field fails to parse.
    pub fn from_row(row: &StoredRow) -> LedgerResult<Self> {
        let malformed = |reason: String| LedgerError::MalformedRow { id: row.id, reason };

        let account = AccountName::new(&row.player_name);
        if account.is_empty() {
            return Err(malformed("empty account name".to_string()));
        }
        if row.reason.trim().is_empty() {
            return Err(malformed("empty reason".to_string()));
        }
        if row.source.trim().is_empty() {
            return Err(malformed("empty source".to_string()));
        }

        let created_at = parse_timestamp(&row.timestamp)
            .ok_or_else(|| malformed(format!("invalid timestamp '{}'", row.timestamp)))?;

        let expires_at = match row.expiration.as_deref() {
            None => None,
            Some(raw) if raw.trim().eq_ignore_ascii_case(NEVER) => None,
            Some(raw) => Some(
                parse_timestamp(raw)
                    .ok_or_else(|| malformed(format!("invalid expiration '{raw}'")))?,
            ),
        };

        Ok(Self {
            id: row.id,
            account,
            reason: row.reason.clone(),
            source: row.source.clone(),
            created_at,
            expires_at,
        })
    }

    /// Check whether the warning has expired at the given instant
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Expiration rendered for messages and change notifications
    #[must_use]
    pub fn expiration_label(&self) -> String {
        format_expiration(self.expires_at)
    }
}

/// Current time at storage precision
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(DATE_TIME_FORMAT).to_string()
}

#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), DATE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[must_use]
pub fn format_expiration(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at.map_or_else(|| NEVER.to_string(), format_timestamp)
}

/// Trim a required text field, rejecting blank values
///
/// # Errors
/// Returns a validation error when the trimmed value is empty.
pub fn require_text(field: &str, value: &str) -> LedgerResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Check that an expiry lies strictly after the creation time
///
/// # Errors
/// Returns a validation error when the expiry is at or before `created_at`.
pub fn validate_expiry(
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
) -> LedgerResult<Option<DateTime<Utc>>> {
    match expires_at.map(|at| at.trunc_subsecs(0)) {
        Some(at) if at <= created_at => Err(LedgerError::validation(format!(
            "expiration {} must be after creation time {}",
            format_timestamp(at),
            format_timestamp(created_at)
        ))),
        other => Ok(other),
    }
}

const DURATION_UNITS: [(char, i64); 4] = [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)];

/// Parse a duration string such as `1d2h30m`
///
/// Units must appear in the order d, h, m, s and each at most once. A
/// duration whose components are all zero yields `None` (never expires).
///
/// # Errors
/// Returns a validation error for any other input shape.
pub fn parse_duration(input: &str) -> LedgerResult<Option<Duration>> {
    let invalid = || {
        LedgerError::validation(format!(
            "invalid duration '{input}': use digits followed by d, h, m or s, e.g. 1d2h30m"
        ))
    };

    let mut total: i64 = 0;
    let mut next_unit = 0;
    let mut digits = String::new();

    for ch in input.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let position = DURATION_UNITS[next_unit..]
            .iter()
            .position(|(unit, _)| ch.eq_ignore_ascii_case(unit))
            .ok_or_else(invalid)?;
        if digits.is_empty() {
            return Err(invalid());
        }
        let (_, seconds) = DURATION_UNITS[next_unit + position];
        let amount: i64 = digits.parse().map_err(|_| invalid())?;
        total = amount
            .checked_mul(seconds)
            .and_then(|part| total.checked_add(part))
            .ok_or_else(invalid)?;
        digits.clear();
        next_unit += position + 1;
    }

    if !digits.is_empty() {
        return Err(invalid());
    }
    if total == 0 {
        return Ok(None);
    }
    Duration::try_seconds(total).map(Some).ok_or_else(invalid)
}

/// Render a number of seconds as "1 day, 2 hours, and 30 minutes"
#[must_use]
pub fn format_duration(seconds: i64) -> String {
    const UNITS: [(&str, i64); 5] = [
        ("year", 31_536_000),
        ("day", 86_400),
        ("hour", 3_600),
        ("minute", 60),
        ("second", 1),
    ];

    let mut remaining = seconds.max(0);
    let mut parts = Vec::new();
    for (unit, size) in UNITS {
        if remaining >= size {
            let value = remaining / size;
            remaining -= value * size;
            let plural = if value > 1 { "s" } else { "" };
            parts.push(format!("{value} {unit}{plural}"));
        }
    }

    match parts.len() {
        0 => "0 seconds".to_string(),
        1 => parts.remove(0),
        2 => parts.join(" and "),
        _ => {
            let last = parts.pop().unwrap_or_default();
            format!("{}, and {last}", parts.join(", "))
        }
    }
}
