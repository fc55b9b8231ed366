//! The hardware seam between the camera manager and a capture API.

use super::device::DeviceTarget;
use super::manager::CameraSettings;
use super::CameraResult;

/// One decoded frame: packed RGB8 pixels.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// An open capture handle that produces frames on demand.
pub trait FrameGrabber: Send {
    /// Grab one frame. Errors are transient from the manager's point of
    /// view and trigger its reconnect policy.
    fn grab(&mut self) -> CameraResult<RawFrame>;
}

/// Opens devices and enumerates candidates for scan/failover.
pub trait CaptureBackend: Send + Sync {
    /// Open `target` and apply the requested resolution and frame rate.
    fn open(
        &self,
        target: &DeviceTarget,
        settings: &CameraSettings,
    ) -> CameraResult<Box<dyn FrameGrabber>>;

    /// Candidate devices for failover, unordered; the manager sorts them.
    fn candidates(&self) -> Vec<DeviceTarget>;
}

/// Backend for platforms without capture support; every open fails.
#[cfg(not(target_os = "linux"))]
pub struct UnsupportedBackend;

#[cfg(not(target_os = "linux"))]
impl CaptureBackend for UnsupportedBackend {
    fn open(
        &self,
        target: &DeviceTarget,
        _settings: &CameraSettings,
    ) -> CameraResult<Box<dyn FrameGrabber>> {
        Err(super::CameraError::OpenFailed {
            device: target.key(),
            reason: "no capture backend on this platform".to_string(),
        })
    }

    fn candidates(&self) -> Vec<DeviceTarget> {
        Vec::new()
    }
}
