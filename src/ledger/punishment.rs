//! Punishment kinds
//!
//! `PunishmentKind` is what configuration selects, including the `none`
//! sentinel. `Sanction` is the subset that can actually be applied, so the
//! application path cannot be handed `none`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::LedgerError;
use super::record::AccountName;

/// Configured escalation punishment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PunishmentKind {
    /// Escalation disabled
    #[default]
    #[display("none")]
    None,
    #[display("kick")]
    Kick,
    #[display("ban")]
    Ban,
    #[display("ban-ip")]
    BanIp,
    #[display("tempban")]
    Tempban,
}

impl PunishmentKind {
    /// Applicable sanction, or `None` for the disabled sentinel
    #[must_use]
    pub fn sanction(self) -> Option<Sanction> {
        match self {
            Self::None => None,
            Self::Kick => Some(Sanction::Kick),
            Self::Ban => Some(Sanction::Ban),
            Self::BanIp => Some(Sanction::BanIp),
            Self::Tempban => Some(Sanction::Tempban),
        }
    }
}

impl FromStr for PunishmentKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "kick" => Ok(Self::Kick),
            "ban" => Ok(Self::Ban),
            "ban-ip" => Ok(Self::BanIp),
            "tempban" => Ok(Self::Tempban),
            other => Err(LedgerError::validation(format!(
                "unknown punishment type '{other}', expected one of none, kick, ban, ban-ip, tempban"
            ))),
        }
    }
}

/// A punishment that can be applied to an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sanction {
    #[display("kick")]
    Kick,
    #[display("ban")]
    Ban,
    #[display("ban-ip")]
    BanIp,
    #[display("tempban")]
    Tempban,
}

/// Everything needed to apply one punishment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentOrder {
    pub account: AccountName,
    pub sanction: Sanction,
    pub issuer: String,
    pub reason: String,
    /// Explicit end of a tempban; filled in at application time when absent
    pub until: Option<DateTime<Utc>>,
    /// Warning count that triggered the punishment, when known
    pub warning_count: Option<u64>,
}

impl PunishmentOrder {
    #[must_use]
    pub fn new(account: AccountName, sanction: Sanction, issuer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            account,
            sanction,
            issuer: issuer.into(),
            reason: reason.into(),
            until: None,
            warning_count: None,
        }
    }

    #[must_use]
    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn with_warning_count(mut self, count: u64) -> Self {
        self.warning_count = Some(count);
        self
    }
}
