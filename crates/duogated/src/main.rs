use anyhow::{Context, Result};
use config::{BusKind, Config};
use duogate_core::{Clock, CommandEmbedder, QrDecoder, SystemClock};
use duogate_hw::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod acquisition;
mod config;
mod dbus_interface;
mod enroll;
mod people;
mod pool;
mod publisher;
mod slot;
mod store;
mod worker;

use acquisition::AcquisitionLoop;
use dbus_interface::{ScannerService, BUS_NAME, OBJECT_PATH};
use enroll::Enroller;
use people::SqlitePersonStore;
use pool::EmbedPool;
use slot::TaskSlot;
use store::StateStore;
use worker::{WorkerContext, WorkerSupervisor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        device = %config.camera_device,
        db = %config.db_path.display(),
        threshold = config.similarity_threshold,
        "duogated starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = StateStore::new(clock, config.badge_timeout());

    let people = Arc::new(
        SqlitePersonStore::open(&config.db_path)
            .with_context(|| format!("opening person database {}", config.db_path.display()))?,
    );
    tracing::info!(people = people.count()?, "person database opened");

    let embedder = CommandEmbedder::new(config.embed_command.clone(), config.embed_args.clone())
        .with_scaled_width(config.embed_width);
    let pool = EmbedPool::new(
        Arc::new(embedder),
        tokio::runtime::Handle::current(),
        config.embed_workers,
    );

    // Open the camera up front so a missing device fails startup.
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let slot = Arc::new(TaskSlot::new());
    let ctx = WorkerContext {
        store: store.clone(),
        slot: Arc::clone(&slot),
        decoder: Arc::new(QrDecoder),
        lookup: people.clone(),
        pool: pool.clone(),
        settings: config.verifier_settings(),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut acquisition = AcquisitionLoop::new(
        store.clone(),
        slot,
        WorkerSupervisor::new(ctx),
        Arc::clone(&shutdown),
    );
    let acquisition_thread = std::thread::Builder::new()
        .name("duogate-acquisition".into())
        .spawn(move || match camera.stream() {
            Ok(mut stream) => acquisition.run(&mut stream),
            Err(e) => tracing::error!(error = %e, "failed to start capture stream"),
        })
        .context("spawning acquisition thread")?;

    publisher::spawn_log_subscriber(store.subscribe());

    let enroller = Enroller::new(
        store.clone(),
        pool,
        people,
        Duration::from_secs(config.enroll_timeout_secs),
    );
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, ScannerService::new(store.clone(), enroller))?
        .build()
        .await
        .context("registering on D-Bus")?;

    let signal_conn = conn.clone();
    publisher::spawn_subscriber(store.subscribe(), "dbus", move |snapshot| {
        let conn = signal_conn.clone();
        async move { dbus_interface::emit_status(&conn, &snapshot).await }
    });

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "duogated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("duogated shutting down");

    shutdown.store(true, Ordering::Relaxed);
    store.stop_session();
    tokio::task::spawn_blocking(move || {
        if acquisition_thread.join().is_err() {
            tracing::error!("acquisition thread panicked");
        }
    })
    .await?;

    Ok(())
}
