//! Luminous Hub
//!
//! Smart-home control backend: boards, relays, appliances and device check-in.

use luminous_hub::{api, bus, config, mqtt, notify, queue, store};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "luminous_hub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Luminous Hub v{} ({})",
        env!("LUMINOUS_VERSION"),
        env!("LUMINOUS_GIT_SHA")
    );

    let config = config::load_config()?;
    tracing::info!("Configuration loaded, port: {}", config.port);

    // Backing store, every call bounded by the configured timeout
    let backend: store::SharedStore = match config.store.backend {
        config::StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Arc::new(store::MemoryStore::new())
        }
        config::StoreBackend::File => {
            let data_dir = config::get_data_dir();
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
            Arc::new(store::JsonFileStore::open(data_dir)?)
        }
    };
    let store: store::SharedStore = Arc::new(store::TimeoutStore::new(
        backend,
        Duration::from_millis(config.store.timeout_ms),
    ));

    let bus = bus::create_bus();
    let queue: queue::SharedQueue = Arc::new(queue::MemoryCommandQueue::new());
    tracing::info!("Event bus and command queue initialized");

    if config.admin_token.is_none() {
        tracing::warn!("No admin token configured; admin routes are disabled");
    }

    let shutdown = CancellationToken::new();
    let notifier = notify::spawn_notifier(
        bus.clone(),
        Arc::new(notify::TracingDispatcher),
        shutdown.clone(),
    );

    let mqtt = config
        .mqtt
        .clone()
        .map(|mqtt_config| Arc::new(mqtt::MqttBridge::new(mqtt_config, bus.clone())));
    if let Some(ref bridge) = mqtt {
        if let Err(e) = bridge.start().await {
            tracing::warn!("Failed to start MQTT bridge: {}", e);
        } else {
            tracing::info!("MQTT bridge started");
        }
    }

    let state = api::AppState::new(
        store,
        queue,
        bus,
        config.boards,
        config.admin_token.clone(),
    );
    let app = api::router(state);

    // Start server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down background tasks...");
    if let Some(bridge) = mqtt {
        bridge.stop();
    }
    shutdown.cancel();
    if let Err(e) = notifier.await {
        tracing::warn!("Notifier task ended abnormally: {}", e);
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
