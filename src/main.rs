//! Analytics relay - resilient query layer for a quota-limited analytics API

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use analytics_relay::buffer::CallLogBuffer;
use analytics_relay::cache::{ResultCache, SharedCache, TieredCache};
use analytics_relay::config::Config;
use analytics_relay::credentials::{CredentialBroker, OAuthRefresher, TokenCipher};
use analytics_relay::db::Database;
use analytics_relay::governor::Governor;
use analytics_relay::metadata::MetadataValidator;
use analytics_relay::normalize::Normalizer;
use analytics_relay::orchestrator::{LiveStrategy, MockStrategy, QueryOrchestrator, QueryStrategy};
use analytics_relay::provider::HttpProvider;
use analytics_relay::redis_backend::RedisBackend;
use analytics_relay::reliability::{CircuitTable, Executor, RedisCircuitTable};
use analytics_relay::routes::{health, metrics, query};
use analytics_relay::state::AppState;
use analytics_relay::store::{CredentialStore, MemoryCredentialStore, MemoryResultStore, ResultStore};
use analytics_relay::tasks::{flush, retention};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("Invalid configuration")?;
    let metrics = Arc::new(metrics::Metrics::new());

    // Connect to database
    let db = match Database::new(&config.database_url).await {
        Ok(db) => {
            db.migrate().await.context("Failed to run migrations")?;
            Some(db)
        }
        Err(e) if config.mock_mode => {
            warn!(error = %e, "Database unavailable, mock mode continues on in-memory stores");
            None
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            std::process::exit(1);
        }
    };

    // Shared backend (optional)
    let redis = match &config.redis_url {
        Some(url) => match RedisBackend::new(
            url,
            Some(config.redis_namespace.clone()),
            config.redis_pool_size,
        )
        .await
        {
            Ok(redis) => {
                info!("Redis connected, governor and cache are shared across instances");
                Some(redis)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, using in-process governor and cache");
                None
            }
        },
        None => {
            info!("REDIS_URL not set, using in-process governor and cache");
            None
        }
    };

    let call_logs = CallLogBuffer::new(config.call_log.buffer_capacity, metrics.clone());
    let normalizer = Normalizer::new(config.limits.clone());

    let (results, credential_store): (Arc<dyn ResultStore>, Arc<dyn CredentialStore>) = match &db
    {
        Some(db) => {
            let db = Arc::new(db.clone());
            (db.clone() as Arc<dyn ResultStore>, db as Arc<dyn CredentialStore>)
        }
        None => (
            Arc::new(MemoryResultStore::new()),
            Arc::new(MemoryCredentialStore::new()),
        ),
    };

    let strategy: Arc<dyn QueryStrategy> = if config.mock_mode {
        info!("MOCK_MODE enabled, provider calls are synthesized");
        Arc::new(MockStrategy::new())
    } else {
        Arc::new(live_strategy(
            &config,
            redis.clone(),
            results.clone(),
            credential_store,
            call_logs.clone(),
            metrics.clone(),
        )?)
    };

    let orchestrator = QueryOrchestrator::new(normalizer, strategy, metrics.clone());
    let state = AppState::new(db, redis, orchestrator, call_logs, metrics);

    // Spawn background tasks
    // 1. Flush task - drains call logs to the store every 5s
    let flush_buffer = state.call_logs.clone();
    let flush_store = results.clone();
    let flush_metrics = state.metrics.clone();
    tokio::spawn(async move {
        flush::flush_task(flush_buffer, flush_store, flush_metrics).await;
    });

    // 2. Retention task - prunes call logs and expired cache rows every 6h
    let retention_days = config.call_log.retention_days;
    tokio::spawn(async move {
        retention::retention_task(results, retention_days).await;
    });

    // Build router
    let app = Router::new()
        // Health and metrics (Kubernetes probes + Prometheus)
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::prometheus_metrics))
        // Queries
        .route("/api/v1/query", post(query::run_query))
        // State and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        );

    info!(
        "Analytics relay v{} starting on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr
    );
    info!(
        "Database: {}",
        config.database_url.split('@').next_back().unwrap_or("***")
    );
    info!("Call log buffer capacity: {}", config.call_log.buffer_capacity);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "analytics_relay=info,tower_http=info".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn live_strategy(
    config: &Config,
    redis: Option<RedisBackend>,
    results: Arc<dyn ResultStore>,
    credential_store: Arc<dyn CredentialStore>,
    call_logs: CallLogBuffer,
    metrics: Arc<metrics::Metrics>,
) -> anyhow::Result<LiveStrategy> {
    let cipher = if config.credentials.encryption_key.is_empty() {
        warn!("TOKEN_ENCRYPTION_KEY not set, using an ephemeral key; stored tokens will not decrypt after restart");
        TokenCipher::ephemeral()
    } else {
        TokenCipher::from_base64(&config.credentials.encryption_key)
            .context("Invalid TOKEN_ENCRYPTION_KEY")?
    };
    let refresher = OAuthRefresher::new(&config.credentials).context("Failed to build OAuth client")?;
    let credentials = Arc::new(CredentialBroker::new(
        &config.credentials,
        credential_store,
        cipher,
        Arc::new(refresher),
        metrics.clone(),
    ));

    let shared_cache: Option<Arc<dyn SharedCache>> = redis
        .clone()
        .map(|r| Arc::new(r) as Arc<dyn SharedCache>);
    let cache = Arc::new(ResultCache::new(
        TieredCache::new(&config.cache, shared_cache, metrics.clone()),
        results,
        metrics.clone(),
    ));
    let validator = Arc::new(MetadataValidator::new(
        cache.clone(),
        config.cache.metadata_ttl_ms,
    ));

    let circuit_table: Option<Arc<dyn CircuitTable>> = redis
        .clone()
        .map(|r| Arc::new(RedisCircuitTable::new(r)) as Arc<dyn CircuitTable>);
    let executor = Arc::new(Executor::new(
        config.reliability.clone(),
        circuit_table,
        metrics.clone(),
    ));

    let provider =
        HttpProvider::new(&config.provider_base_url).context("Failed to build provider client")?;

    Ok(LiveStrategy {
        credentials,
        validator,
        cache,
        governor: Arc::new(Governor::new(&config.governor, redis, metrics.clone())),
        executor,
        provider: Arc::new(provider),
        call_logs,
        cache_config: config.cache.clone(),
        limits: config.limits.clone(),
        call_log_config: config.call_log.clone(),
    })
}
