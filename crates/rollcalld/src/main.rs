use anyhow::{Context, Result};
use rollcall_core::{AttendanceReconciler, FaceEngine, StoreIndex, StudentRegistrar};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        similarity_threshold = config.similarity_threshold,
        bus = ?config.bus,
        "configuration loaded"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );

    let paths = config.model_paths();
    let detection_threshold = config.detection_threshold;
    let engine = engine::spawn_engine(
        move || FaceEngine::load(&paths, detection_threshold),
        config.engine_queue,
    )
    .context("failed to spawn engine thread")?;

    // Serve even if the models are missing: requests then fail with the engine state.
    match engine.wait_ready().await {
        Ok(()) => tracing::info!("face engine ready"),
        Err(e) => tracing::error!(error = %e, "face engine unavailable, requests will be rejected"),
    }

    let extractor = Arc::new(engine.clone());
    let index = Arc::new(StoreIndex::new(store.clone()));
    let reconciler = Arc::new(AttendanceReconciler::new(
        extractor.clone(),
        index,
        store.clone(),
        config.similarity_threshold,
    ));
    let registrar = Arc::new(StudentRegistrar::new(extractor, store.clone()));
    let service = AttendanceService::new(reconciler, registrar, store.clone(), store, engine);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
