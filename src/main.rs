use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

use codeverify::{api, config, database, keyvault, quota, ratelimit, secrets, sms, store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists
    if let Err(e) = dotenvy::dotenv() {
        println!("No .env file found, using environment variables: {}", e);
    }

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let settings = config::get_settings();
    info!("Starting {}...", settings.app_name);

    info!("Initializing database...");
    database::init_db().await?;

    info!("Initializing secret index...");
    secrets::init_secrets()?;

    info!("Initializing key vault...");
    keyvault::init_keyvault()?;
    keyvault::get_keyvault().prime(database::get_db()).await?;

    info!("Initializing code cache...");
    store::init_code_cache().await?;

    info!("Initializing rate limiter...");
    ratelimit::init_ratelimit().await?;

    info!("Initializing quota store...");
    quota::init_quota(database::get_db())?;

    info!("Initializing SMS adapter...");
    sms::init_sms()?;

    // Background key rotation and record sweeping.
    let rotation_tick = settings.key_rotation_tick_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(rotation_tick));
        loop {
            interval.tick().await;
            match keyvault::get_keyvault().rotation_tick(database::get_db()).await {
                Ok(rotated) if rotated > 0 => info!(rotated, "rotation tick complete"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "rotation tick failed"),
            }
        }
    });

    let sweep_interval = settings.sweep_interval_secs;
    let sweep_grace = settings.sweep_grace_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            if let Err(e) =
                store::sweep(database::get_db(), Utc::now().naive_utc(), sweep_grace).await
            {
                warn!(error = %e, "sweep failed");
            }
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(false);

    let app = Router::new()
        .route("/api/issue", post(api::issue::issue_handler))
        .route("/api/batch-issue", post(api::issue::batch_issue_handler))
        .route(
            "/api/checkcodestatus",
            post(api::codestatus::check_status_handler),
        )
        .route("/api/expirecode", post(api::codestatus::expire_handler))
        .route("/api/verify", post(api::verify::verify_handler))
        .route(
            "/api/certificate",
            post(api::certificate::certificate_handler),
        )
        .route("/health", get(api::health_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors);

    let addr: SocketAddr = settings.address().parse()?;
    info!("Code verification API started on http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
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
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutting down code verification API...");
        },
        _ = terminate => {
            info!("Shutting down code verification API...");
        },
    }
}
