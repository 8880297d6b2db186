use async_trait::async_trait;
use facecheckin_core::{DetectedFace, DetectorOptions, Embedding, FaceDetector, FaceRecognizer};
use facecheckin_hw::Camera;
use image::RgbImage;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] facecheckin_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] facecheckin_core::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] facecheckin_core::RecognizerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One detection pass over a live frame.
pub struct Scan {
    pub frame: RgbImage,
    pub faces: Vec<DetectedFace>,
}

/// Detection and description, as the checkin loop needs them.
#[async_trait]
pub trait Vision: Send + Sync {
    /// Capture a frame and describe every face in it.
    async fn scan(&self) -> Result<Scan, EngineError>;
    /// Describe the most confident face in a still image (an avatar).
    async fn describe(&self, image: RgbImage) -> Result<Embedding, EngineError>;
}

/// Messages sent to the engine thread.
enum EngineRequest {
    Scan {
        reply: oneshot::Sender<Result<Scan, EngineError>>,
    },
    Describe {
        image: RgbImage,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Resources the engine thread owns.
pub struct EngineConfig {
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    pub detector_model: PathBuf,
    pub recognizer_model: PathBuf,
    pub detector_options: DetectorOptions,
    pub warmup_frames: usize,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

#[async_trait]
impl Vision for EngineHandle {
    async fn scan(&self) -> Result<Scan, EngineError> {
        self.request(|reply| EngineRequest::Scan { reply }).await
    }

    async fn describe(&self, image: RgbImage) -> Result<Embedding, EngineError> {
        self.request(|reply| EngineRequest::Describe { image, reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the camera, loads both ONNX models, discards warmup frames,
/// then enters a request loop. Fails fast at startup if any resource
/// is unavailable.
pub fn spawn_engine(config: EngineConfig) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let mut detector = FaceDetector::load(&config.detector_model)?.with_options(config.detector_options);
    let mut recognizer = FaceRecognizer::load(&config.recognizer_model)?;

    // Discard warmup frames for camera AGC/AE stabilization
    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        for _ in 0..config.warmup_frames {
            if let Err(e) = camera.capture_frame() {
                tracing::debug!(error = %e, "warmup capture failed");
            }
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facecheckin-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Scan { reply } => {
                        let _ = reply.send(run_scan(&camera, &mut detector, &mut recognizer));
                    }
                    EngineRequest::Describe { image, reply } => {
                        let _ = reply.send(run_describe(&image, &mut detector, &mut recognizer));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

/// Capture one frame and describe every face in it.
///
/// Dark frames are returned without running the detector. A face whose
/// descriptor cannot be extracted is dropped from the scan, not the scan itself.
fn run_scan(
    camera: &Camera,
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
) -> Result<Scan, EngineError> {
    let frame = camera.capture_frame()?;
    if frame.is_dark {
        tracing::debug!(seq = frame.sequence, "dark frame, skipping detection");
        return Ok(Scan { frame: frame.image, faces: Vec::new() });
    }

    let boxes = detector.detect(&frame.image)?;
    let mut faces = Vec::with_capacity(boxes.len());
    for bbox in boxes {
        match recognizer.extract(&frame.image, &bbox) {
            Ok(descriptor) => faces.push(DetectedFace { bbox, descriptor }),
            Err(e) => tracing::debug!(error = %e, confidence = bbox.confidence, "descriptor extraction failed"),
        }
    }

    tracing::trace!(seq = frame.sequence, faces = faces.len(), "scan complete");
    Ok(Scan { frame: frame.image, faces })
}

/// Describe the most confident face in a still image.
fn run_describe(
    image: &RgbImage,
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
) -> Result<Embedding, EngineError> {
    let face = detector.detect_single(image)?;
    Ok(recognizer.extract(image, &face)?)
}
