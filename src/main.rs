use std::env;
use std::sync::Arc;

use player_warn::config::DEFAULT_CONFIG_FILE;
use player_warn::ledger::{ObserverRegistry, YamlBackend, migrate_legacy_file};
use player_warn::logging::{self, log_console};
use player_warn::notify::{HttpWebhook, TemplateSet, WebhookNotifier};
use player_warn::{APP_NAME, Error, LedgerConfig, LedgerService, OfflineHost, SessionProvider, WarningStore};
use tracing::info;

/// Environment variable naming the configuration file
const CONFIG_ENV: &str = "PLAYER_WARN_CONFIG";

/// Main function to run the ledger
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = LedgerConfig::load(&config_path).await?;

    let backend = Arc::new(YamlBackend::open(&config.storage.path).await?);
    let observers = ObserverRegistry::new();
    let store = Arc::new(WarningStore::with_cache_ttl(
        backend,
        observers.clone(),
        config.warning.cache_ttl,
    )?);

    // Imported warnings are not mirrored to the webhook
    if let Some(report) = migrate_legacy_file(&store, &config.storage.legacy_path).await? {
        log_console(format!(
            "Imported {} legacy warnings ({} skipped)",
            report.migrated, report.skipped
        ));
    }

    if config.discord.enabled {
        let templates = Arc::new(TemplateSet::load(&config.discord.templates_dir).await?);
        let sink = Arc::new(HttpWebhook::new(&config.discord.webhook_url)?);
        log_console(format!("Webhook notifications enabled with {} templates", templates.len()));
        observers.register(Arc::new(WebhookNotifier::new(templates, sink).with_counts(&store)));
    }

    let host: Arc<dyn SessionProvider> = Arc::new(OfflineHost);
    let service = LedgerService::new(
        Arc::clone(&store),
        host,
        config.escalation_policy(),
        config.scheduler_settings()?,
    );
    service.start_sweeper(config.warning.sweep_interval).await;

    info!("Starting {APP_NAME}...");
    tokio::signal::ctrl_c().await?;

    log_console("Shutting down");
    service.shutdown().await;
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
