//! facecheckin-core: face detection, recognition and matching.
//!
//! SCRFD finds faces and their five landmarks, ArcFace turns an aligned crop
//! into a descriptor, and [`FaceMatcher`] resolves a descriptor to the label
//! of the closest enrolled employee. Both networks run on ONNX Runtime (CPU).

pub mod alignment;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::{DetectorError, DetectorOptions, FaceDetector};
pub use matcher::{FaceMatch, FaceMatcher, LabeledDescriptors, UNKNOWN_LABEL};
pub use recognizer::{FaceRecognizer, RecognizerError};
pub use types::{BoundingBox, DetectedFace, Embedding};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default location of the ONNX model files.
///
/// `$XDG_DATA_HOME/facecheckin/models` when `XDG_DATA_HOME` is set,
/// otherwise the system-wide `/usr/share/facecheckin/models`.
pub fn default_model_dir() -> PathBuf {
    match std::env::var_os("XDG_DATA_HOME") {
        Some(data_home) => PathBuf::from(data_home).join("facecheckin/models"),
        None => PathBuf::from("/usr/share/facecheckin/models"),
    }
}
