//! duogate-hw: camera capture and frame handling.
//!
//! Provides the pull-based [`FrameSource`] abstraction, a V4L2 camera
//! implementing it, region-of-interest cropping, and the status overlay
//! drawn on preview frames.

pub mod camera;
pub mod frame;
pub mod overlay;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError, Roi};
pub use overlay::{draw_roi, draw_status_bar, OverlayStatus};
