//! Warning ledger
//!
//! This module owns warning records and their lifecycle, the cached warning
//! counts used for escalation, and the deferred and delayed punishment flow.

mod backend;
mod cache;
mod error;
mod escalation;
pub(crate) mod events;
mod migration;
mod pending;
mod punishment;
mod record;
mod scheduler;
mod service;
mod store;
mod sweeper;

pub use backend::{BackendError, Change, MemoryBackend, NewRow, Select, StoredRow, WarningBackend, YamlBackend};
pub use cache::{CountCache, DEFAULT_TTL_SECS, MAX_CACHED_COUNTS, MAX_TTL_SECS};
pub use error::{LedgerError, LedgerResult};
pub use escalation::{Decision, decide};
pub use events::{EditField, LedgerEvent, LedgerObserver, ObserverRegistry};
pub use migration::{MigrationReport, migrate_legacy_file};
pub use pending::{PendingPunishment, PendingPunishments, RETENTION_HOURS};
pub use punishment::{PunishmentKind, PunishmentOrder, Sanction};
pub use record::{
    AccountName, DATE_TIME_FORMAT, NEVER, WarningRecord, format_duration, format_expiration,
    format_timestamp, parse_duration, parse_timestamp,
};
pub use scheduler::{ApplyOutcome, PunishmentEvent, PunishmentListener, PunishmentScheduler, SchedulerSettings};
pub use service::{EscalationPolicy, IssueOutcome, JoinReport, LedgerService};
pub use store::{AccountGuard, AccountLocks, AccountSummary, WarningStore};
pub use sweeper::{DEFAULT_SWEEP_INTERVAL_SECS, ExpirationSweeper, SweepReport, SweeperHandle};

/// Request type for the expiration sweeper task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepRequest {
    /// Sweep immediately instead of waiting for the next tick
    SweepNow,
    /// Shut the sweeper task down
    Shutdown,
}
