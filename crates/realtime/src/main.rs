// tandem-realtime: WebSocket sync server entry point.

use std::sync::Arc;

use anyhow::Context;
use tandem_realtime::{
    auth::JwtIdentityService,
    cache::{InMemoryCache, SharedCache},
    config::RealtimeConfig,
    service::RealtimeService,
    ws,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RealtimeConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set TANDEM_REALTIME_JWT_SECRET in production");
    }

    let verifier = Arc::new(
        JwtIdentityService::with_claims(
            &config.jwt_secret,
            config.jwt_issuer.clone(),
            config.jwt_audience.clone(),
        )
        .context("invalid realtime JWT configuration")?,
    );
    let cache = build_cache(&config).await?;
    let service = Arc::new(RealtimeService::new(config.service_settings(), verifier, cache));
    service.start_maintenance().await;

    let app = ws::router(service.clone(), config.max_frame_bytes);
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind realtime listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting realtime server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("realtime server exited unexpectedly");

    service.shutdown().await;
    served
}

fn init_tracing(config: &RealtimeConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(feature = "redis")]
async fn build_cache(config: &RealtimeConfig) -> anyhow::Result<Arc<dyn SharedCache>> {
    match &config.redis_url {
        Some(url) => {
            let cache = tandem_realtime::cache::RedisCache::connect(url)
                .await
                .context("failed to connect to redis")?;
            info!("using redis shared cache");
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(InMemoryCache::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn build_cache(config: &RealtimeConfig) -> anyhow::Result<Arc<dyn SharedCache>> {
    if config.redis_url.is_some() {
        warn!("TANDEM_REALTIME_REDIS_URL is set but the redis feature is disabled; using in-process cache");
    }
    Ok(Arc::new(InMemoryCache::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
