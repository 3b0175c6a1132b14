use std::net::SocketAddr;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use realtime_cell::{
    ChangeFeedTransport, RegistrySettings, RowQueryService, SubscriptionRegistry,
    SupabaseRealtimeTransport, SupabaseRowQueryService,
};
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting clinic realtime API server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());
    if !config.is_configured() {
        warn!("Supabase is not fully configured; realtime and REST calls will fail");
    }

    // Polling reads bypass row level security only when the service key is set
    let supabase = SupabaseClient::service_role(&config).unwrap_or_else(|e| {
        warn!("{}, polling with the anon key", e);
        SupabaseClient::new(&config)
    });

    let transport: Arc<dyn ChangeFeedTransport> = Arc::new(SupabaseRealtimeTransport::new(&config));
    let query: Arc<dyn RowQueryService> = Arc::new(SupabaseRowQueryService::new(supabase));
    let registry = Arc::new(SubscriptionRegistry::new(
        transport,
        query,
        RegistrySettings::from_config(&config),
    ));

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(Arc::clone(&config), Arc::clone(&registry))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let port = std::env::var("PORT")
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    info!("Server stopped");

    Ok(())
}

/// Releases every subscription before the server drains connections, which
/// ends open change streams.
async fn shutdown_signal(registry: Arc<SubscriptionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");

    registry.cleanup().await;
}
