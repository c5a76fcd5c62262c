use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use facegate_core::{gallery, Gallery, Pipeline};
use facegate_hw::Camera;
use facegate_vision::{FaceDetector, FaceEmbedder, FaceLandmarker};

mod config;
mod dbus_interface;
mod kiosk;
mod store;

use config::Config;
use dbus_interface::KioskService;
use kiosk::LogSink;
use store::AttendanceStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::from_env();

    let store = AttendanceStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    tracing::info!(db = %config.db_path.display(), "store opened");

    if config.uses_manifest_models() {
        facegate_vision::verify_models_dir(&config.model_dir)
            .with_context(|| format!("verifying models in {}", config.model_dir.display()))?;
    } else {
        tracing::warn!("custom model filenames configured, skipping checksum verification");
    }

    let mut detector =
        FaceDetector::load(&config.detector_model_path()).context("loading face detector")?;
    let mut embedder =
        FaceEmbedder::load(&config.embedder_model_path()).context("loading face embedder")?;
    let landmarker =
        FaceLandmarker::load(&config.landmark_model_path()).context("loading landmark model")?;

    // First run: seed the store from reference images, one per employee,
    // file stem = name.
    if store.count_employees().await? == 0 && config.reference_dir.is_dir() {
        tracing::info!(dir = %config.reference_dir.display(), "importing reference images");
        let imported = gallery::load_reference_dir(&config.reference_dir, &mut detector, &mut embedder)
            .context("importing reference images")?;
        for entry in imported.entries() {
            store.enroll(&entry.name, &entry.embedding).await?;
        }
        tracing::info!(count = imported.len(), "reference import complete");
    }

    let initial_gallery: Gallery = store.gallery().await?;
    if initial_gallery.is_empty() {
        tracing::warn!("no employees enrolled; the kiosk will not verify anyone");
    } else {
        tracing::info!(entries = initial_gallery.len(), "gallery loaded");
    }

    let pipeline = Pipeline::new(
        detector,
        embedder,
        landmarker,
        initial_gallery,
        config.pipeline_config(),
    );

    let camera = Camera::open(&config.camera_device)
        .with_context(|| format!("opening camera {}", config.camera_device))?;

    let (mark_tx, mut mark_rx) = tokio::sync::mpsc::channel::<String>(16);

    let kiosk = kiosk::spawn_kiosk(
        camera,
        pipeline,
        Duration::from_millis(config.frame_interval_ms),
        config.warmup_frames,
        Box::new(LogSink::default()),
        mark_tx,
    )
    .context("starting kiosk loop")?;

    // Verified identities arrive here; marking happens off the frame loop.
    let mark_store = store.clone();
    tokio::spawn(async move {
        while let Some(identity) = mark_rx.recv().await {
            match mark_store.mark(&identity).await {
                Ok(event) => tracing::info!(
                    employee = %event.employee,
                    direction = %event.direction,
                    time = %event.time,
                    "attendance marked"
                ),
                Err(e) => tracing::error!(employee = %identity, error = %e, "attendance mark failed"),
            }
        }
    });

    let _conn = zbus::connection::Builder::session()
        .context("connecting to session bus")?
        .name("org.facegate.Kiosk1")?
        .serve_at(
            "/org/facegate/Kiosk1",
            KioskService {
                kiosk: kiosk.clone(),
                store: store.clone(),
            },
        )?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!("facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");
    kiosk.shutdown().await;

    Ok(())
}
