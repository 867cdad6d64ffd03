use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use codex_hub::{
    activity::ActivityMap,
    http,
    observer::{spawn_observer, Observers},
    profiles::ProfileStore,
    stores::{analytics::AnalyticsStore, reviews::ReviewSessionStore, threads::ThreadIndexStore},
    supervisor::Supervisor,
    ws::{spawn_event_pump, ClientRegistry},
    AppState, HubConfig,
};

#[tokio::main]
async fn main() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = HubConfig::from_env();
    if config.token_generated {
        info!(token = %config.token, "generated access token (set CODEX_HUB_TOKEN to pin one)");
    }

    std::fs::create_dir_all(&config.data_dir).expect("failed to create data directory");

    let threads = ThreadIndexStore::open(&config.threads_path()).expect("failed to open thread index");
    let analytics =
        AnalyticsStore::open(&config.analytics_path()).expect("failed to open analytics store");
    let reviews =
        ReviewSessionStore::open(&config.reviews_path()).expect("failed to open review store");
    let profiles = Arc::new(
        ProfileStore::load(
            config.profiles_path(),
            config.profiles_dir.clone(),
            config.default_codex_home.clone(),
        )
        .expect("failed to load profile registry"),
    );

    let activity = Arc::new(ActivityMap::default());
    let observer = spawn_observer(Observers {
        activity: activity.clone(),
        threads: threads.clone(),
        analytics: analytics.clone(),
        reviews: reviews.clone(),
    });

    let (supervisor, supervisor_events) = Supervisor::new(config.launcher());
    let clients = ClientRegistry::default();
    spawn_event_pump(supervisor_events, clients.clone(), observer.clone());

    let bind_addr = config.bind_addr();
    let state = AppState {
        config: Arc::new(config),
        profiles,
        supervisor,
        clients,
        activity,
        threads,
        analytics,
        reviews,
        observer,
    };

    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "codex-hub listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("codex-hub shut down");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
