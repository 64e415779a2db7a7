//! Hosting server capabilities
//!
//! The ledger never talks to player sessions or ban lists directly. It goes
//! through a [`SessionProvider`] supplied by the hosting server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use thiserror::Error;
use tracing::info;

use crate::CONSOLE_TARGET;
use crate::ledger::AccountName;

#[derive(Debug, Error)]
pub enum HostError {
    /// The account has no active session
    #[error("Account {0} is not reachable")]
    Unreachable(AccountName),

    /// The host refused or failed the request
    #[error("Host request failed: {0}")]
    Failed(String),
}

/// What a ban applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum BanTarget {
    #[display("account {_0}")]
    Account(AccountName),
    #[display("address {_0}")]
    Address(String),
}

/// A ban-list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub target: BanTarget,
    pub reason: String,
    /// `None` bans permanently
    pub expires_at: Option<DateTime<Utc>>,
    pub issuer: String,
}

/// Session, permission and ban-list access offered by the hosting server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Whether the account currently has a contactable session
    async fn is_reachable(&self, account: &AccountName) -> bool;

    /// Whether the account is exempt from punishment
    async fn has_bypass(&self, account: &AccountName) -> bool;

    async fn send_notice(&self, account: &AccountName, message: &str) -> Result<(), HostError>;

    /// End the account's session with a message
    async fn disconnect(&self, account: &AccountName, message: &str) -> Result<(), HostError>;

    /// Network address of the account's session
    async fn address_of(&self, account: &AccountName) -> Result<Option<String>, HostError>;

    async fn is_banned(&self, target: &BanTarget) -> Result<bool, HostError>;

    async fn add_ban(&self, entry: BanEntry) -> Result<(), HostError>;

    /// Refuse further connections from an address
    async fn block_address(&self, address: &str) -> Result<(), HostError>;
}

/// Host with no sessions, used when running the ledger standalone
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineHost;

#[async_trait]
impl SessionProvider for OfflineHost {
    async fn is_reachable(&self, _account: &AccountName) -> bool {
        false
    }

    async fn has_bypass(&self, _account: &AccountName) -> bool {
        false
    }

    async fn send_notice(&self, account: &AccountName, _message: &str) -> Result<(), HostError> {
        Err(HostError::Unreachable(account.clone()))
    }

    async fn disconnect(&self, account: &AccountName, _message: &str) -> Result<(), HostError> {
        Err(HostError::Unreachable(account.clone()))
    }

    async fn address_of(&self, _account: &AccountName) -> Result<Option<String>, HostError> {
        Ok(None)
    }

    async fn is_banned(&self, _target: &BanTarget) -> Result<bool, HostError> {
        Ok(false)
    }

    async fn add_ban(&self, entry: BanEntry) -> Result<(), HostError> {
        info!(target: CONSOLE_TARGET, "Ban for {} recorded without a host ban list", entry.target);
        Ok(())
    }

    async fn block_address(&self, _address: &str) -> Result<(), HostError> {
        Ok(())
    }
}
