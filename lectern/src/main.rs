use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use lectern_api::{create_router, AppState, HttpLectureStore, LocalLectureStore};
use lectern_api::lecture::LectureStore;
use lectern_signal::engine::rtc::RtcEngine;
use lectern_signal::{logging, Config, SessionCoordinator};

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. LECTERN_CONFIG_PATH environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. Fall back to environment variables only
fn load_config() -> Config {
    let config_path = std::env::var("LECTERN_CONFIG_PATH")
        .ok()
        .filter(|p| std::path::Path::new(p).exists())
        .or_else(|| {
            let cwd = "config.yaml";
            if std::path::Path::new(cwd).exists() {
                Some(cwd.to_string())
            } else {
                None
            }
        });

    if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {path}: {e}");
                eprintln!("Falling back to environment variables");
                Config::from_env().unwrap_or_default()
            }
        }
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration (fail fast on misconfigurations)
    let config = load_config();
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Lectern signaling server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Initialize the media engine
    let engine = RtcEngine::new(config.engine.clone())?;

    // 4. Initialize the session coordinator (spawns its watchdog and engine
    // event listener)
    let coordinator = SessionCoordinator::new(engine, config.coordinator.clone());

    // 5. Wire the lecture record store boundary
    let lecture_store: Arc<dyn LectureStore> = if config.lecture_store.base_url.is_empty() {
        info!("No lecture store configured, minting room tokens locally");
        Arc::new(LocalLectureStore)
    } else {
        info!(
            base_url = %config.lecture_store.base_url,
            "Using upstream lecture record store"
        );
        Arc::new(HttpLectureStore::new(&config.lecture_store)?)
    };

    // 6. Serve
    let state = AppState::new(coordinator, lecture_store);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.http_address()).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
