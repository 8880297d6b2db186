//! facecheckin-hw: webcam capture for the check-in kiosk.
//!
//! Provides V4L2-based camera access, conversion of the negotiated pixel
//! format to RGB, and JPEG encoding of snapshots.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
