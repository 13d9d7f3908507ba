//! Wamux fleet daemon — Telegram-fronted WhatsApp session fleet controller.
//!
//! Wires the core fleet (session manager, disconnect router, health
//! monitor, web-takeover detector, batch workers) to its storage backends
//! and to the Telegram bot that provides the chat origination path and the
//! notification sink.

mod commands;
mod notify;
mod plugins;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tokio::task::JoinHandle;
use tracing_subscriber::prelude::*;

use wamux_core::config::StorageMode;
use wamux_core::dedup::MessageDedup;
use wamux_core::fleet::SessionOps;
use wamux_core::reconnect::ReconnectGuard;
use wamux_core::storage::cache::REFRESH_INTERVAL;
use wamux_core::{
    AuthStore, BroadcastScheduler, ChannelFollowQueue, Config, ConnectionRouter, EventDispatcher,
    FileAuthStore, HealthMonitor, Notifier, PrefixCache, SessionManager, SessionStore,
    SledAuthStore, SqliteSessionStore, WebSessionDetector, create_factory,
};

use notify::TelegramNotifier;

/// Wamux fleet daemon — WhatsApp session fleet controller
#[derive(Parser)]
#[command(name = "wamux-bot")]
struct Args {
    /// Path to a custom config file (overrides default search locations)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

/// Default tracing directives enabling info-level logs for this crate and wamux-core.
const DEFAULT_DIRECTIVES: &[&str] = &["wamux_bot=info", "wamux_core=info"];

/// Build the default `EnvFilter`: RUST_LOG (if set) plus our default directives.
fn default_env_filter() -> anyhow::Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Initialize the tracing subscriber.
///
/// When `config.logging` is `Some`, creates a layered subscriber with both
/// stdout and rolling file output. When `None`, uses stdout-only.
///
/// Returns the non-blocking writer guard that must be held for the process lifetime.
fn init_tracing(
    config: &Config,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    if let Some(ref lc) = config.logging {
        // Attempt to create the log directory; fall back to stdout-only on failure.
        if let Err(e) = std::fs::create_dir_all(&lc.directory) {
            eprintln!(
                "Warning: Failed to create log directory '{}': {}. Falling back to stdout-only.",
                lc.directory, e
            );
            tracing_subscriber::fmt()
                .with_env_filter(default_env_filter()?)
                .init();
            return Ok(None);
        }

        // Map rotation string to the tracing-appender rotation type.
        let rotation = match lc.rotation.as_str() {
            "daily" => tracing_appender::rolling::Rotation::DAILY,
            "hourly" => tracing_appender::rolling::Rotation::HOURLY,
            "never" => tracing_appender::rolling::Rotation::NEVER,
            other => {
                eprintln!(
                    "Warning: Unknown rotation '{}', falling back to daily",
                    other
                );
                tracing_appender::rolling::Rotation::DAILY
            }
        };

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix("wamux-bot")
            .filename_suffix("log")
            .max_log_files(lc.max_files)
            .build(&lc.directory)
            .context("Failed to create rolling file appender")?;

        // Wrap in a non-blocking writer; guard must be kept alive for the process lifetime.
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = default_env_filter()?;

        let stdout_layer = tracing_subscriber::fmt::layer();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .with(file_layer)
            .init();

        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(default_env_filter()?)
            .init();
        Ok(None)
    }
}

/// Everything the wired fleet exposes to the bot layer.
struct Fleet {
    manager: Arc<SessionManager>,
    prefixes: Arc<PrefixCache>,
    background: Vec<JoinHandle<()>>,
}

/// Build and wire the fleet: storage, factory, manager, router,
/// dispatcher, health, detector, and batch workers.
async fn build_fleet(config: &Config, bot: Bot) -> anyhow::Result<Fleet> {
    // Storage backends.
    let store: Arc<dyn SessionStore> = Arc::new(
        SqliteSessionStore::new(&config.storage.database_url)
            .await
            .context("Failed to initialize session metadata store")?,
    );
    let auth: Arc<dyn AuthStore> = match config.storage.mode {
        StorageMode::Sled => Arc::new(
            SledAuthStore::open(&config.storage.sled_path)
                .context("Failed to open sled auth store")?,
        ),
        StorageMode::File => Arc::new(
            FileAuthStore::new(&config.storage.sessions_dir)
                .context("Failed to open file auth store")?,
        ),
    };

    // Client-library driver.
    let factory =
        create_factory(&config.client.driver).context("Failed to create client driver")?;

    // The manager, then its collaborators, wired through the narrow ports.
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot));
    let manager = SessionManager::new(
        config.fleet.clone(),
        factory,
        auth,
        Arc::clone(&store),
        notifier,
    );
    manager
        .initialize()
        .await
        .context("Storage unreachable during fleet initialization")?;

    let router = ConnectionRouter::new(Arc::clone(&manager) as Arc<dyn SessionOps>);
    manager.set_router(Arc::clone(&router));

    let prefixes = Arc::new(PrefixCache::new(
        Arc::clone(&store),
        &config.ingress.default_prefix,
    ));
    match prefixes.load().await {
        Ok(count) => tracing::info!(users = count, "prefix cache loaded"),
        Err(e) => tracing::warn!(error = %e, "prefix cache load failed, serving defaults"),
    }

    let health = HealthMonitor::new(
        Arc::clone(&manager) as Arc<dyn SessionOps>,
        Arc::clone(&router) as Arc<dyn ReconnectGuard>,
        Arc::clone(&prefixes),
        config.health.clone(),
    );

    let dedup = Arc::new(MessageDedup::new(Duration::from_secs(
        config.ingress.dedup_ttl_secs,
    )));
    let registry = Arc::new(plugins::build_registry());

    let dispatcher = EventDispatcher::new(
        Arc::clone(&manager),
        Arc::clone(&router),
        Arc::clone(&health),
        dedup,
        registry,
        Arc::clone(&prefixes),
        config.ingress.clone(),
    );
    manager.set_dispatcher(Arc::clone(&dispatcher));

    let follow_queue = ChannelFollowQueue::new(config.batch.channel_jid.clone());
    dispatcher.set_follow_queue(Arc::clone(&follow_queue));

    let broadcast = BroadcastScheduler::new(
        Arc::clone(&manager) as Arc<dyn SessionOps>,
        &config.batch.announcement_path,
        Duration::from_secs(config.batch.broadcast_interval_secs),
        config.batch.pin_after_broadcast,
    );

    let detector = WebSessionDetector::new(Arc::clone(&manager) as Arc<dyn SessionOps>);

    // Background loops.
    let mut background = Vec::new();
    background.extend(manager.spawn_maintenance());
    background.extend(health.spawn());
    background.push(detector.spawn());
    background.push(follow_queue.spawn_worker());
    background.push(broadcast.spawn());
    background.push(prefixes.spawn_refresh(REFRESH_INTERVAL));

    Ok(Fleet {
        manager,
        prefixes,
        background,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 1. Load application configuration FIRST (tracing init depends on config).
    let config = Config::load(args.config.as_deref()).context("Failed to load config")?;

    // 2. Initialize tracing (stdout-only or stdout+file based on config).
    let _guard = init_tracing(&config)?;

    tracing::info!("Starting wamux fleet daemon");

    // 3. Resolve bot token (env var > config file). Token is never logged.
    let token = resolve_bot_token(&config).context("Failed to obtain bot token")?;

    // 4. Create the teloxide Bot instance.
    let bot = Bot::new(token);

    // 5. Wire the fleet.
    let fleet = build_fleet(&config, bot.clone()).await?;

    // 6. Rehydrate persisted sessions before serving commands.
    let report = fleet.manager.initialize_existing_sessions().await;
    tracing::info!(
        initialized = report.initialized,
        total = report.total,
        failed = report.failed,
        "session rehydration finished"
    );

    // 7. Register slash commands with Telegram (autocomplete UI). Non-fatal.
    if let Err(e) = bot.set_my_commands(commands::Command::bot_commands()).await {
        tracing::warn!("Failed to register bot commands: {}", e);
    }

    // 8. Command dispatcher.
    let config = Arc::new(config);
    let handler = dptree::entry().branch(
        Update::filter_message().branch(
            dptree::entry()
                .filter_command::<commands::Command>()
                .endpoint(commands::handle_command),
        ),
    );

    tracing::info!("Dispatcher ready — polling for updates");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![
            Arc::clone(&config),
            Arc::clone(&fleet.manager),
            Arc::clone(&fleet.prefixes)
        ])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    // 9. Graceful shutdown: stop background loops.
    tracing::info!("Dispatcher stopped — shutting down");
    for handle in fleet.background {
        handle.abort();
    }

    Ok(())
}

/// Resolve the bot token with the following priority:
///
/// 1. `TELEGRAM_BOT_TOKEN` environment variable (if set and non-empty).
/// 2. `telegram.token` in the config file.
///
/// The token is **never** passed to any tracing macro.
///
/// # Errors
///
/// Returns an error if neither source provides a token.
pub fn resolve_bot_token(config: &Config) -> anyhow::Result<String> {
    if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN")
        && !token.is_empty()
    {
        return Ok(token);
    }
    config
        .telegram
        .as_ref()
        .and_then(|t| t.token.clone())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Bot token required: set TELEGRAM_BOT_TOKEN env var or telegram.token in config"
            )
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use wamux_core::config::TelegramConfig;

    /// Guards tests that mutate environment variables to prevent race conditions.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_resolve_token_env_var() {
        let _guard = ENV_MUTEX.lock().unwrap();
        // SAFETY: guarded by mutex; single-threaded section.
        unsafe { std::env::set_var("TELEGRAM_BOT_TOKEN", "env-token-value") };

        let config = Config {
            telegram: Some(TelegramConfig {
                token: Some("config-token".to_string()),
            }),
            ..Config::default()
        };

        let result = resolve_bot_token(&config);
        assert_eq!(result.unwrap(), "env-token-value");

        // SAFETY: guarded by mutex.
        unsafe { std::env::remove_var("TELEGRAM_BOT_TOKEN") };
    }

    #[test]
    fn test_resolve_token_config() {
        let _guard = ENV_MUTEX.lock().unwrap();
        // SAFETY: guarded by mutex.
        unsafe { std::env::remove_var("TELEGRAM_BOT_TOKEN") };

        let config = Config {
            telegram: Some(TelegramConfig {
                token: Some("config-token".to_string()),
            }),
            ..Config::default()
        };

        let result = resolve_bot_token(&config);
        assert_eq!(result.unwrap(), "config-token");
    }

    #[test]
    fn test_resolve_token_none() {
        let _guard = ENV_MUTEX.lock().unwrap();
        // SAFETY: guarded by mutex.
        unsafe { std::env::remove_var("TELEGRAM_BOT_TOKEN") };

        let config = Config::default(); // No telegram config.
        let result = resolve_bot_token(&config);
        assert!(result.is_err());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn test_resolve_token_empty_env_var() {
        let _guard = ENV_MUTEX.lock().unwrap();
        // SAFETY: guarded by mutex.
        unsafe { std::env::set_var("TELEGRAM_BOT_TOKEN", "") };

        let config = Config {
            telegram: Some(TelegramConfig {
                token: Some("fallback-config-token".to_string()),
            }),
            ..Config::default()
        };

        let result = resolve_bot_token(&config);
        // Empty env var should fall through to config.
        assert_eq!(result.unwrap(), "fallback-config-token");

        // SAFETY: guarded by mutex.
        unsafe { std::env::remove_var("TELEGRAM_BOT_TOKEN") };
    }
}
