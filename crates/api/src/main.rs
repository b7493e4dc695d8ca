#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! CareBill API Server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderName, Method};
use carebill_api::{config::LogFormat, create_router, AppState, Config};
use carebill_billing::BillingService;
use carebill_shared::{create_pool, run_migrations};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!("Starting CareBill API Server v{}", env!("CARGO_PKG_VERSION"));

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let billing = if config.enable_billing {
        match BillingService::from_env(pool.clone(), config.redis_url.as_deref()).await {
            Ok(service) => {
                tracing::info!(
                    redis = config.redis_url.is_some(),
                    geoip = config.geoip_api_url.is_some(),
                    "Billing service initialized"
                );
                Some(Arc::new(service))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Billing service unavailable, billing routes will return 503");
                None
            }
        }
    } else {
        tracing::info!("Billing disabled by ENABLE_BILLING");
        None
    };

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(pool, config, billing);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-session-id"),
        ]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,carebill_api=debug,carebill_billing=debug".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}
