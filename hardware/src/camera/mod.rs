//! Capture-device management for the terminal's cameras.
//!
//! A vehicle carries one or two USB cameras whose device nodes move around
//! across reboots and re-plugs. This module maps a configured identifier to
//! an exclusively-held capture handle and keeps multiple managers in the
//! same process from fighting over one device:
//!
//! - [`DeviceTarget`] resolves identifiers (`"0"`, `"/dev/video2"`, custom
//!   udev aliases) to a concrete target.
//! - [`DeviceRegistry`] is the process-wide set of claimed devices; claim
//!   and release are atomic, so two managers can never hold the same node.
//! - [`CameraManager`] owns one device: connect with warm-up, scan and
//!   failover when the configured device is gone, capture with bounded
//!   reconnect, JPEG + base64 encoding.
//! - [`CaptureBackend`] is the hardware seam; the production implementation
//!   is V4L2 ([`V4l2Backend`], Linux only) and tests supply mocks.

pub mod backend;
pub mod device;
pub mod frame;
pub mod manager;
pub mod registry;

#[cfg(target_os = "linux")]
pub mod v4l2;

use std::sync::Arc;

use thiserror::Error;

pub use backend::{CaptureBackend, FrameGrabber, RawFrame};
pub use device::{scan_video_devices, DeviceTarget};
pub use frame::CaptureFrame;
pub use manager::{CameraHealth, CameraManager, CameraSettings, CaptureTestReport};
pub use registry::DeviceRegistry;

#[cfg(target_os = "linux")]
pub use v4l2::V4l2Backend;

/// Camera-layer errors.
#[derive(Error, Debug)]
pub enum CameraError {
    /// The device is held by another live manager in this process.
    #[error("device {0} is already claimed by another camera manager")]
    DeviceConflict(String),

    /// The device could not be opened or configured.
    #[error("failed to open {device}: {reason}")]
    OpenFailed { device: String, reason: String },

    /// Capture was requested while the camera is closed and auto-reconnect
    /// is disabled.
    #[error("camera is not open")]
    NotOpen,

    /// A frame read failed (device unplugged, driver hiccup, short frame).
    #[error("frame read failed: {0}")]
    ReadFailed(String),

    /// The driver refused the pixel format the grabber needs.
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    /// JPEG encoding of a grabbed frame failed.
    #[error("JPEG encoding failed: {0}")]
    EncodeFailed(String),

    /// Neither the configured device nor any scanned candidate connected.
    #[error("no usable capture device found")]
    NoDeviceAvailable,
}

pub type CameraResult<T> = Result<T, CameraError>;

/// The platform's production capture backend.
#[cfg(target_os = "linux")]
pub fn default_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(v4l2::V4l2Backend)
}

/// Stub for platforms without a capture backend; opening always fails.
#[cfg(not(target_os = "linux"))]
pub fn default_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(backend::UnsupportedBackend)
}
