use anyhow::{Context, Result};
use presence_core::Pipeline;
use presence_store::{EmbeddingCipher, SqliteStore};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod source;

use config::{Config, DbusBus};
use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "presenced starting");

    let config = Config::load().context("invalid configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        threshold = config.similarity_threshold,
        exit_timeout_secs = config.exit_timeout_secs,
        checkout_policy = ?config.checkout_policy,
        "configuration loaded"
    );

    let cipher = match &config.key_file {
        Some(path) => Some(
            EmbeddingCipher::from_key_file(path)
                .with_context(|| format!("loading key file {}", path.display()))?,
        ),
        None => None,
    };
    let store = SqliteStore::open(&config.db_path, cipher)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let pipeline = Pipeline::new(store, &config.pipeline())?;
    tracing::info!(
        open_sessions = pipeline.tracker().open_count(),
        "attendance state restored"
    );

    let engine = engine::spawn_engine(pipeline, config.queue_capacity)?;

    // Held for the lifetime of the daemon; dropping it releases the bus name.
    let _connection = match config.dbus {
        DbusBus::Off => None,
        bus => match serve_dbus(bus, PresenceService::new(engine.clone())).await {
            Ok(conn) => {
                tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "D-Bus unavailable; continuing without control interface"
                );
                None
            }
        },
    };

    let sweeper = {
        let engine = engine.clone();
        let period = config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match engine.sweep().await {
                    Ok(events) if !events.is_empty() => {
                        tracing::debug!(closed = events.len(), "timeout sweep");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "timeout sweep failed"),
                }
            }
        })
    };

    let mut source = {
        let engine = engine.clone();
        let path = config.source.clone();
        let backpressure = config.backpressure;
        tokio::spawn(async move { source::run(path.as_deref(), engine, backpressure).await })
    };

    tracing::info!("presenced ready");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received");
            source.abort();
        }
        finished = &mut source => {
            match finished {
                Ok(Ok(frames)) => tracing::info!(frames, "frame source reached end of input"),
                Ok(Err(e)) => tracing::error!(error = %e, "frame source failed"),
                Err(e) => tracing::error!(error = %e, "frame source task panicked"),
            }
        }
    }

    sweeper.abort();
    match engine.sweep().await {
        Ok(events) => tracing::info!(closed = events.len(), "final sweep"),
        Err(e) => tracing::warn!(error = %e, "final sweep failed"),
    }
    if let Ok(status) = engine.status().await {
        tracing::info!(
            frames = status.frames_processed,
            dropped = status.frames_dropped,
            failed = status.failed_ticks,
            open_sessions = status.stats.open_sessions,
            "presenced shutting down"
        );
    }

    Ok(())
}

async fn serve_dbus(bus: DbusBus, service: PresenceService) -> zbus::Result<zbus::Connection> {
    let builder = match bus {
        DbusBus::System => zbus::connection::Builder::system()?,
        _ => zbus::connection::Builder::session()?,
    };
    builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
}
