//! The kiosk session loop.
//!
//! Runs on a dedicated OS thread that owns the camera stream and the
//! recognition pipeline. Each tick: capture, mirror, enhance, feed the
//! pipeline, render the outcome, and hand verified identities to the
//! attendance marker over a channel. Control requests from the D-Bus
//! layer are polled between frames.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use facegate_core::{
    CapabilityError, Embedding, FrameOutcome, FrameView, Gallery, Pipeline,
};
use facegate_hw::{Camera, CameraError};
use facegate_vision::{FaceDetector, FaceEmbedder, FaceLandmarker};

/// Concrete pipeline the kiosk drives.
pub type KioskPipeline = Pipeline<FaceDetector, FaceEmbedder, FaceLandmarker>;

#[derive(Error, Debug)]
pub enum KioskError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("no face found in reference image")]
    NoFaceInImage,
    #[error("failed to read reference image: {0}")]
    ImageRead(String),
    #[error("kiosk thread exited")]
    ChannelClosed,
}

/// Where outcomes are shown. The kiosk itself has no window system; the
/// default sink logs transitions, and deployments wire in their own.
pub trait DisplaySink: Send {
    fn render(&mut self, outcome: &FrameOutcome);
    fn show_message(&mut self, severity: Severity, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Tracing-backed display sink. Repeated identical states are logged once.
#[derive(Default)]
pub struct LogSink {
    last: Option<String>,
}

impl DisplaySink for LogSink {
    fn render(&mut self, outcome: &FrameOutcome) {
        let line = match outcome {
            FrameOutcome::NoFace => "no face".to_string(),
            FrameOutcome::Holding { remaining_secs } => {
                format!("hold: {remaining_secs:.1}s remaining")
            }
            FrameOutcome::Unrecognized => "face not recognized".to_string(),
            FrameOutcome::ChallengeActive { prompt, .. } => prompt.clone(),
            FrameOutcome::Verified { identity, .. } => format!("verified: {identity}"),
            FrameOutcome::ChallengeTimedOut => "challenge timed out, try again".to_string(),
        };

        if self.last.as_deref() != Some(&line) {
            tracing::info!(display = %line, "kiosk state");
            self.last = Some(line);
        }
    }

    fn show_message(&mut self, severity: Severity, text: &str) {
        match severity {
            Severity::Info => tracing::info!(message = text, "kiosk message"),
            Severity::Warning => tracing::warn!(message = text, "kiosk message"),
            Severity::Error => tracing::error!(message = text, "kiosk message"),
        }
        self.last = None;
    }
}

/// Kiosk status snapshot for the D-Bus `status` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KioskStatus {
    pub frames_processed: u64,
    pub gallery_size: usize,
    pub challenge_active: bool,
    pub last_outcome: String,
}

/// Messages sent from D-Bus handlers to the kiosk thread.
enum KioskRequest {
    Status {
        reply: oneshot::Sender<KioskStatus>,
    },
    ReloadGallery {
        gallery: Gallery,
        reply: oneshot::Sender<usize>,
    },
    /// Encode the primary face of a still image (enrollment path).
    EncodeImage {
        path: PathBuf,
        reply: oneshot::Sender<Result<Embedding, KioskError>>,
    },
    CancelChallenge,
    Shutdown,
}

/// Clone-safe handle to the kiosk thread.
#[derive(Clone)]
pub struct KioskHandle {
    tx: mpsc::Sender<KioskRequest>,
}

impl KioskHandle {
    pub async fn status(&self) -> Result<KioskStatus, KioskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(KioskRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| KioskError::ChannelClosed)?;
        reply_rx.await.map_err(|_| KioskError::ChannelClosed)
    }

    /// Swap in a freshly built gallery; returns the new entry count.
    pub async fn reload_gallery(&self, gallery: Gallery) -> Result<usize, KioskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(KioskRequest::ReloadGallery {
                gallery,
                reply: reply_tx,
            })
            .await
            .map_err(|_| KioskError::ChannelClosed)?;
        reply_rx.await.map_err(|_| KioskError::ChannelClosed)
    }

    /// Extract an embedding from a reference image on disk.
    pub async fn encode_image(&self, path: PathBuf) -> Result<Embedding, KioskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(KioskRequest::EncodeImage {
                path,
                reply: reply_tx,
            })
            .await
            .map_err(|_| KioskError::ChannelClosed)?;
        reply_rx.await.map_err(|_| KioskError::ChannelClosed)?
    }

    pub async fn cancel_challenge(&self) -> Result<(), KioskError> {
        self.tx
            .send(KioskRequest::CancelChallenge)
            .await
            .map_err(|_| KioskError::ChannelClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(KioskRequest::Shutdown).await;
    }
}

/// Spawn the kiosk loop on a dedicated OS thread.
///
/// Verified identities are sent to `mark_tx`; the async side marks
/// attendance. Fails fast if the camera stream cannot start.
pub fn spawn_kiosk(
    camera: Camera,
    mut pipeline: KioskPipeline,
    frame_interval: Duration,
    warmup_frames: usize,
    mut display: Box<dyn DisplaySink>,
    mark_tx: mpsc::Sender<String>,
) -> Result<KioskHandle, KioskError> {
    // Fail fast: prove the device can stream before the thread detaches.
    drop(camera.stream(0)?);

    let (tx, mut rx) = mpsc::channel::<KioskRequest>(8);

    std::thread::Builder::new()
        .name("facegate-kiosk".into())
        .spawn(move || {
            let mut stream = match camera.stream(warmup_frames) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "kiosk: camera stream failed to start");
                    display.show_message(Severity::Error, "camera unavailable");
                    return;
                }
            };
            tracing::info!("kiosk thread started");

            let mut frames_processed: u64 = 0;
            let mut last_outcome = "starting".to_string();

            loop {
                // Drain control requests between frames.
                loop {
                    match rx.try_recv() {
                        Ok(KioskRequest::Status { reply }) => {
                            let _ = reply.send(KioskStatus {
                                frames_processed,
                                gallery_size: pipeline.gallery().len(),
                                challenge_active: pipeline.challenge_active(),
                                last_outcome: last_outcome.clone(),
                            });
                        }
                        Ok(KioskRequest::ReloadGallery { gallery, reply }) => {
                            let count = gallery.len();
                            pipeline.cancel_challenge();
                            pipeline.set_gallery(gallery);
                            let _ = reply.send(count);
                        }
                        Ok(KioskRequest::EncodeImage { path, reply }) => {
                            let _ = reply.send(encode_image(&mut pipeline, &path));
                        }
                        Ok(KioskRequest::CancelChallenge) => {
                            pipeline.cancel_challenge();
                        }
                        Ok(KioskRequest::Shutdown) => {
                            tracing::info!("kiosk thread shutting down");
                            return;
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            tracing::info!("kiosk control channel closed, exiting");
                            return;
                        }
                    }
                }

                let tick_start = Instant::now();

                let mut frame = match stream.next_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "frame capture failed, retrying");
                        display.show_message(Severity::Warning, "camera hiccup");
                        std::thread::sleep(frame_interval);
                        continue;
                    }
                };

                // Selfie view: mirror, then lift contrast and re-sharpen.
                facegate_hw::frame::mirror_horizontal(&mut frame.data, frame.width, frame.height);
                facegate_hw::frame::clahe_enhance(&mut frame.data, frame.width, frame.height, 8, 0.02);
                frame.data = facegate_hw::frame::sharpen(&frame.data, frame.width, frame.height);

                let view = FrameView::new(&frame.data, frame.width, frame.height);
                let outcome = pipeline.process_frame(view, Instant::now());
                frames_processed += 1;

                display.render(&outcome);
                last_outcome = outcome_label(&outcome).to_string();

                if let FrameOutcome::Verified { identity, .. } = &outcome {
                    if mark_tx.blocking_send(identity.clone()).is_err() {
                        tracing::error!("mark channel closed, exiting kiosk loop");
                        return;
                    }
                }

                let elapsed = tick_start.elapsed();
                if let Some(remaining) = frame_interval.checked_sub(elapsed) {
                    std::thread::sleep(remaining);
                }
            }
        })
        .expect("failed to spawn kiosk thread");

    Ok(KioskHandle { tx })
}

/// Decode a reference image to grayscale and encode its primary face.
fn encode_image(pipeline: &mut KioskPipeline, path: &std::path::Path) -> Result<Embedding, KioskError> {
    let img = image::open(path)
        .map_err(|e| KioskError::ImageRead(format!("{}: {e}", path.display())))?
        .to_luma8();
    let (width, height) = img.dimensions();
    let data = img.into_raw();
    let view = FrameView::new(&data, width, height);

    pipeline
        .encode_frame(view)?
        .ok_or(KioskError::NoFaceInImage)
}

fn outcome_label(outcome: &FrameOutcome) -> &'static str {
    match outcome {
        FrameOutcome::NoFace => "no-face",
        FrameOutcome::Holding { .. } => "holding",
        FrameOutcome::Unrecognized => "unrecognized",
        FrameOutcome::ChallengeActive { .. } => "challenge-active",
        FrameOutcome::Verified { .. } => "verified",
        FrameOutcome::ChallengeTimedOut => "challenge-timed-out",
    }
}
