use std::{net::SocketAddr, sync::Arc};

use axum::{routing::get, Router};
use tokio::{signal, sync::mpsc};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use marketplace_api as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }

    let db_arc = Arc::new(db_pool);
    let cfg = Arc::new(cfg);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    // Gateway adapters from configured credentials
    let gateways = Arc::new(api::gateways::GatewayRegistry::from_config(&cfg));

    // Compose shared app state
    let app_state = api::AppState::build(
        db_arc.clone(),
        cfg.clone(),
        event_sender.clone(),
        gateways.clone(),
    );

    // Background jobs: reconciliation poller, payment expiry sweep,
    // unpaid-order auto-cancel sweep
    let workers = Arc::new(api::workers::Workers::new(
        db_arc,
        app_state.services.payments.clone(),
        app_state.services.orders.clone(),
        gateways,
        event_sender,
        cfg.clone(),
    ));
    let _worker_handles = workers.spawn_all();

    // CORS: permissive in development, none elsewhere (fronted by the API
    // gateway in production)
    let cors_layer = if cfg.is_development() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    let app = Router::<api::AppState>::new()
        .route("/", get(|| async { "marketplace-api up" }))
        .route("/healthz", get(|| async { "ok" }))
        .nest("/api/v1", api::api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors_layer)
        .with_state(app_state);

    // Bind and serve
    let addr = SocketAddr::new(cfg.host.parse()?, cfg.port);
    info!("marketplace-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
