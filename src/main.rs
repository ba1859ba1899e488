//! LLM Gateway - Main entry point
//!
//! Builds the HTTP server with all configured routes and middleware. Runtime
//! records (upstreams, client keys, rules, prices) are loaded from the
//! database; the admin collaborator owns their CRUD lifecycle.

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::Local;
use llm_gateway_rust::{
    api::{auth::ClientKey, build_router, AppState, Upstream},
    core::{
        init_metrics, init_request_logger, rate_limiter::RateLimiter, secrets::PlainCipher,
        shutdown_request_logger, AppConfig, Database, DatabaseConfig,
    },
    services::{
        billing::PgPriceStore, circuit_breaker::PgCircuitStateStore, BillingService,
        CircuitBreaker, CompensationService, TrafficRecorder, UpstreamService,
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the upstream/key snapshots are refreshed from the directory.
const DIRECTORY_REFRESH_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    init_logging();
    init_metrics();

    let config = AppConfig::from_env();

    let db_config = DatabaseConfig::from_env()
        .map_err(|_| anyhow::anyhow!("DB_URL environment variable is required"))?;
    tracing::info!("Connecting to database...");
    let db = Database::connect(&db_config).await?;
    tracing::info!("Database connected successfully");

    if !db.check_migrations().await? {
        return Err(anyhow::anyhow!(
            "Database schema not present. Apply migrations first."
        ));
    }
    let db = Arc::new(db);

    init_request_logger(db.pool().clone());

    let upstreams = load_upstreams(&db).await?;
    tracing::info!(count = upstreams.len(), "Upstream directory loaded");

    let state = Arc::new(AppState {
        http_client: create_http_client(&config),
        upstreams: Arc::new(UpstreamService::new(
            upstreams,
            Duration::from_secs(config.session_affinity_ttl_secs),
        )),
        circuit: Arc::new(CircuitBreaker::new(Arc::new(PgCircuitStateStore::new(
            db.clone(),
        )))),
        compensation: Arc::new(CompensationService::new(
            db.clone(),
            Duration::from_secs(config.rule_cache_ttl_secs),
        )),
        billing: Arc::new(BillingService::new(Arc::new(PgPriceStore::new(
            db.clone(),
        )))),
        recorder: Arc::new(TrafficRecorder::new(config.recorder.clone())),
        rate_limiter: Arc::new(RateLimiter::new()),
        client_keys: ArcSwap::from_pointee(vec![]),
        config,
    });

    state.reload_client_keys(load_client_keys(&db).await?);
    spawn_directory_refresh(db.clone(), state.clone());

    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()?;
    tracing::info!("Starting LLM Gateway on {}", addr);
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/responses");
    tracing::info!("Claude API: /v1/messages");
    tracing::info!("Metrics endpoint: /metrics");

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_request_logger().await;
    Ok(())
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

fn init_logging() {
    let no_color = std::env::var("NO_COLOR").is_ok();

    // Always suppress noisy HTTP library logs regardless of RUST_LOG setting
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,llm_gateway_rust=debug".to_string());
    let filter_str = format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    );
    let filter = tracing_subscriber::EnvFilter::new(filter_str);

    if no_color {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
            .init();
    }
}

async fn load_upstreams(db: &Arc<Database>) -> Result<Vec<Upstream>> {
    use llm_gateway_rust::core::secrets::{decrypt_secret, SecretCipher};

    // The directory stores secrets through the admin collaborator's cipher;
    // deployments handing the gateway plaintext secrets use the pass-through
    let cipher: Arc<dyn SecretCipher> = Arc::new(PlainCipher);

    let rows = db.load_upstreams().await?;
    let mut upstreams = Vec::with_capacity(rows.len());
    for row in rows {
        let context = format!("upstream {}", row.id);
        // A record whose secret cannot be decrypted is skipped, not fatal to
        // the rest of the directory
        match decrypt_secret(cipher.as_ref(), &row.api_key, &context) {
            Ok(secret) => upstreams.push(Upstream::from_row(row, secret)),
            Err(err) => tracing::error!(error = %err, "Skipping upstream"),
        }
    }
    Ok(upstreams)
}

async fn load_client_keys(db: &Arc<Database>) -> Result<Vec<ClientKey>> {
    let rows = db.load_api_keys().await?;
    Ok(rows.into_iter().map(ClientKey::from_row).collect())
}

/// Periodic directory refresh: upstream records and client keys are
/// eventually consistent with the admin's edits.
fn spawn_directory_refresh(db: Arc<Database>, state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(DIRECTORY_REFRESH_SECS));
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            match load_upstreams(&db).await {
                Ok(upstreams) => state.upstreams.reload(upstreams),
                Err(err) => tracing::warn!(error = %err, "Upstream refresh failed"),
            }
            match load_client_keys(&db).await {
                Ok(keys) => state.reload_client_keys(keys),
                Err(err) => tracing::warn!(error = %err, "Client key refresh failed"),
            }
        }
    });
}

fn create_http_client(config: &AppConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.verify_ssl)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .http2_keep_alive_timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build HTTP client")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
