use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use booking_cell::handlers::BookingState;
use booking_cell::services::orchestrator::BookingOrchestrator;
use ehr_cell::services::alerts::OperatorAlertService;
use ehr_cell::services::cache::AppointmentReadCache;
use ehr_cell::services::client::EhrApiClient;
use ehr_cell::services::gateway::RateLimitedGateway;
use ehr_cell::services::retry::TokioSleep;
use shared_config::AppConfig;
use shared_database::StoreClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting booking API server");

    let config = AppConfig::from_env();

    // Shared singletons: one store client, one gateway, one cache, one alert
    // registry for the whole process. Everything downstream gets handles.
    let store = Arc::new(StoreClient::new(&config));
    let gateway = Arc::new(RateLimitedGateway::from_config(&config));
    let ehr = Arc::new(
        EhrApiClient::new(&config, Arc::clone(&gateway))
            .context("EHR integration must be configured")?,
    );
    let cache = Arc::new(AppointmentReadCache::from_config(&config));
    let alerts = Arc::new(OperatorAlertService::new());

    let orchestrator = Arc::new(BookingOrchestrator::new(
        &config,
        store,
        ehr,
        cache,
        alerts,
        Arc::new(TokioSleep),
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router::create_router(BookingState { orchestrator })
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}
