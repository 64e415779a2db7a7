use crate::{CONSOLE_TARGET, Error};
use std::path::Path;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Ledger log file name
pub const LEDGER_LOG_FILE: &str = "ledger";

/// Initialize the logging system with console and file outputs
///
/// # Errors
/// Returns an error if the log directory cannot be created or the default
/// filter directives do not parse.
pub fn init() -> Result<(), Error> {
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let ledger_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, LEDGER_LOG_FILE);

    // Human-readable console output
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // JSON lines for the ledger, punishment and webhook history
    let ledger_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(ledger_file);

    // Default to INFO, but keep the HTTP client quiet
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive("hyper=warn".parse()?)
            .add_directive("reqwest=warn".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(ledger_layer)
        .init();

    info!("Logging system initialized");
    Ok(())
}

pub fn log_console(message: impl AsRef<str>) {
    info!(
        target: CONSOLE_TARGET,
        message = %message.as_ref(),
        event = "console",
    );
}
