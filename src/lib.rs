pub mod config;
pub mod host;
pub mod ledger;
pub mod logging;
pub mod messages;
pub mod notify;

pub const APP_NAME: &str = "player_warn";
pub const LEDGER_TARGET: &str = "player_warn::ledger";
pub const PUNISH_TARGET: &str = "player_warn::punish";
pub const WEBHOOK_TARGET: &str = "player_warn::webhook";
pub const CONSOLE_TARGET: &str = "player_warn";

pub use config::{ConfigError, LedgerConfig};
pub use host::{OfflineHost, SessionProvider};
pub use ledger::{LedgerService, WarningStore};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
