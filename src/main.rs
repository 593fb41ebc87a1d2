mod audit;
mod bot;
mod config;
mod platform;
mod server;
mod subscription;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use teloxide::Bot;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audit::{AuditSink, SupabaseAudit, TracingAudit};
use crate::bot::{Dispatcher, GuideContent};
use crate::config::Config;
use crate::platform::telegram::TelegramMessenger;
use crate::server::AppState;
use crate::subscription::ChannelMembershipOracle;

/// Upper bound for any single outbound HTTP call
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,guidebot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Channel: {}", config.channel.chat_ref());
    info!("  Webhook path: {}", config.server.webhook_path);
    info!("  Audit store: {}", if config.audit.is_some() { "supabase" } else { "log only" });

    // One client for every outbound call; teloxide, the membership lookup
    // and the audit sink all share its connection pool.
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let api_url = reqwest::Url::parse(&config.telegram.api_url)
        .with_context(|| format!("Invalid telegram.api_url: {}", config.telegram.api_url))?;
    let bot = Bot::with_client(&config.telegram.bot_token, client.clone()).set_api_url(api_url);

    let oracle = ChannelMembershipOracle::new(
        client.clone(),
        &config.telegram.api_url,
        &config.telegram.bot_token,
        config.channel.chat_ref(),
    );

    let audit: Arc<dyn AuditSink> = match &config.audit {
        Some(audit) => Arc::new(SupabaseAudit::new(client.clone(), audit)),
        None => Arc::new(TracingAudit),
    };

    let content = GuideContent {
        channel_name: config.channel.name().to_string(),
        channel_link: config.channel.link(),
        document_url: config.guide.document_url.clone(),
        pick_tour_url: config.pick_tour_url(),
    };

    let dispatcher = Dispatcher::new(
        Arc::new(TelegramMessenger::new(bot)),
        Arc::new(oracle),
        content,
    );

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        audit,
        webhook_secret: Arc::from(config.telegram.webhook_secret.as_str()),
    };
    let app = server::build_app(
        state,
        &config.server.webhook_path,
        config.server.request_timeout_secs,
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;

    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
