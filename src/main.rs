//! LLM Relay - main entry point.
//!
//! Builds the runtime, wires every subsystem explicitly (no ambient state),
//! spawns the background loops, and serves until shutdown, at which point
//! the queue drains by failing waiters with 503.

use anyhow::Result;
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use llm_relay_rust::api::{build_router, AppState};
use llm_relay_rust::core::{init_metrics, AppConfig, UserRateLimiter};
use llm_relay_rust::services::prompt_logger::PromptLogger;
use llm_relay_rust::services::user_store::UserStore;
use llm_relay_rust::services::{KeyPool, RequestQueue};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Timestamp formatter using local time (respects TZ).
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

async fn async_main() -> Result<()> {
    // Suppress noisy HTTP library logs regardless of RUST_LOG.
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,llm_relay_rust=debug".to_string());
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{},hyper=warn,h2=warn,reqwest=warn",
        base_filter
    ));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
        .init();

    init_metrics();

    let config = AppConfig::from_env()?;
    if config.key_count() == 0 {
        tracing::warn!("no upstream keys configured; every request will fail with 503");
    }

    let http_client = create_http_client();

    let key_pool = Arc::new(KeyPool::from_config(&config));
    let queue = RequestQueue::new(Arc::clone(&key_pool));
    queue.spawn_dispatcher();

    let backend = UserStore::backend_from_config(&config, http_client.clone());
    let user_store = UserStore::new(&config, backend);
    if let Err(e) = user_store.load().await {
        tracing::error!(error = %e, "failed to load users from gatekeeper store");
    }
    user_store.spawn_flush_loop(Duration::from_secs(config.user_flush_interval_secs));
    user_store.spawn_maintenance(config.quota_refresh_period.interval_secs());

    let prompt_logger = if config.prompt_logging {
        PromptLogger::start(config.prompt_log_path.clone())
    } else {
        PromptLogger::disabled()
    };

    let rate_limiter = Arc::new(UserRateLimiter::new(config.rate_limit_per_minute));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let state = Arc::new(AppState {
        config,
        key_pool,
        queue: Arc::clone(&queue),
        user_store,
        rate_limiter,
        prompt_logger,
        http_client,
    });

    let app = build_router(state);

    tracing::info!("LLM Relay listening on {}", addr);
    tracing::info!("OpenAI API:    /v1/chat/completions, /v1/completions, /v1/models");
    tracing::info!("Anthropic API: /v1/complete");
    tracing::info!("Shards:        /mistral-ai/v1/*, /google-palm/v1/*");
    tracing::info!("Admin API:     /admin/*");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(queue))
        .await?;

    Ok(())
}

/// On SIGINT/SIGTERM, stop admitting work and fail queued requests so
/// clients see a clean 503 instead of a dropped connection.
async fn shutdown_signal(queue: Arc<RequestQueue>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown requested, draining queue");
    queue.shutdown();
}

fn create_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("Failed to build HTTP client")
}
