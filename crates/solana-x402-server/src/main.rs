use std::time::Duration;

use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::from_fn, middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use x402_server::{
    config::GateConfig, metrics::register_metrics, middleware::payment_gate, routes,
    spawn_purge_task, state::AppState,
};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GateConfig::from_env().map_err(|e| {
        tracing::error!("Failed to load configuration: {e}");
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    })?;
    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();
    let rate_limit_rpm = config.rate_limit_rpm;
    let content_dir = config.content_dir.clone();

    tracing::info!("Starting x402-server on port {}", port);
    tracing::info!(
        "Merchant: {}",
        config.merchant_address.as_deref().unwrap_or("(not configured)")
    );
    tracing::info!("Verification: {:?}", config.verification_mode);
    tracing::info!("Response mode: {:?}", config.response_mode);
    tracing::info!(
        "Storage: {}",
        config.db_path.as_deref().unwrap_or("in-memory")
    );

    let state = AppState::new(config).map_err(|e| {
        tracing::error!("Failed to initialize payment gate: {e}");
        std::io::Error::other(e)
    })?;

    register_metrics();
    spawn_purge_task(state.clone(), PURGE_INTERVAL);

    let state_data = web::Data::new(state);

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm as u64)
        .finish()
        .expect("failed to build rate limiter config");

    tracing::info!("Serving content from: {}", content_dir);

    HttpServer::new(move || {
        let cors = x402_server::cors::build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .wrap(from_fn(payment_gate))
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Governor::new(&governor_conf))
            .configure(routes::health::configure)
            .configure(routes::payment::configure)
            .service(actix_files::Files::new("/", &content_dir).index_file("index.html"))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
