//! Camera manager: exclusive device ownership, failover, capture.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::{CaptureBackend, FrameGrabber};
use super::device::DeviceTarget;
use super::frame::{encode_frame, CaptureFrame};
use super::registry::DeviceRegistry;
use super::{CameraError, CameraResult};

/// Capture configuration applied at connect time.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// JPEG compression quality, 1-100.
    pub jpeg_quality: u8,
    /// Scan for an alternative device when the configured one fails, and
    /// reopen automatically on capture failures.
    pub auto_reconnect: bool,
    /// Frames read and discarded after connect. Sensors need a few frames
    /// to settle exposure, so the first reads are unusable.
    pub warmup_frames: u32,
    /// Reopen attempts per capture call on transient read failures.
    pub reconnect_attempts: u32,
    /// Pause before each reopen attempt.
    pub reconnect_delay: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            jpeg_quality: 85,
            auto_reconnect: true,
            warmup_frames: 5,
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(300),
        }
    }
}

/// Owns at most one capture device, coordinating with a [`DeviceRegistry`]
/// so no device is held by two managers at once.
pub struct CameraManager {
    /// Configured identifier; updated when failover settles on another
    /// device.
    device: String,
    settings: CameraSettings,
    backend: Arc<dyn CaptureBackend>,
    registry: Arc<DeviceRegistry>,
    grabber: Option<Box<dyn FrameGrabber>>,
    /// Registry key this manager currently holds.
    claimed: Option<String>,
}

impl CameraManager {
    pub fn new(
        device: impl Into<String>,
        settings: CameraSettings,
        backend: Arc<dyn CaptureBackend>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            device: device.into(),
            settings,
            backend,
            registry,
            grabber: None,
            claimed: None,
        }
    }

    /// Manager on the platform backend and the shared process registry.
    pub fn with_defaults(device: impl Into<String>, settings: CameraSettings) -> Self {
        Self::new(
            device,
            settings,
            super::default_backend(),
            DeviceRegistry::global(),
        )
    }

    /// The identifier this manager is (or will be) connected to.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_opened(&self) -> bool {
        self.grabber.is_some()
    }

    /// Open `identifier`, apply settings, flush warm-up frames and claim it.
    ///
    /// Refuses when the device is claimed by a different live manager. The
    /// claim swap (release previous, take new) is atomic in the registry.
    pub fn connect(&mut self, identifier: &str) -> CameraResult<()> {
        let target = DeviceTarget::resolve(identifier);
        let key = target.key();

        if self.claimed.as_deref() != Some(key.as_str()) && self.registry.is_claimed(&key) {
            return Err(CameraError::DeviceConflict(key));
        }

        let mut grabber = self.backend.open(&target, &self.settings)?;
        for _ in 0..self.settings.warmup_frames {
            // Warm-up failures are not conclusive; the real read decides.
            let _ = grabber.grab();
        }

        if !self.registry.reclaim(self.claimed.as_deref(), &key) {
            return Err(CameraError::DeviceConflict(key));
        }
        self.claimed = Some(key.clone());
        self.grabber = Some(grabber);
        info!(device = %key, "camera connected");
        Ok(())
    }

    /// Connect the configured device, falling back to a scan of unclaimed
    /// candidates when it is unavailable and auto-reconnect is enabled.
    /// The winning candidate becomes the configured device.
    pub fn initialize(&mut self) -> CameraResult<()> {
        let configured = self.device.clone();
        match self.connect(&configured) {
            Ok(()) => return Ok(()),
            Err(err) => {
                if !self.settings.auto_reconnect {
                    return Err(err);
                }
                warn!(device = %configured, %err, "configured camera unavailable, scanning");
            }
        }

        let mut candidates = self.backend.candidates();
        candidates.sort();
        for target in candidates {
            let key = target.key();
            if key == configured || self.registry.is_claimed(&key) {
                continue;
            }
            match self.connect(&key) {
                Ok(()) => {
                    info!(device = %key, "failover camera selected");
                    self.device = key;
                    return Ok(());
                }
                Err(err) => debug!(device = %key, %err, "candidate rejected"),
            }
        }

        Err(CameraError::NoDeviceAvailable)
    }

    /// Capture one frame, JPEG-compress it at the configured quality and
    /// base64-encode it.
    ///
    /// A closed camera is re-initialized first (when auto-reconnect is on).
    /// Transient read failures trigger up to `reconnect_attempts` reopen
    /// cycles, each preceded by `reconnect_delay`, before the call fails.
    pub fn capture(&mut self) -> CameraResult<CaptureFrame> {
        if self.grabber.is_none() {
            if !self.settings.auto_reconnect {
                return Err(CameraError::NotOpen);
            }
            debug!(device = %self.device, "camera closed, reconnecting");
            self.initialize()?;
        }

        let mut attempts_left = self.settings.reconnect_attempts;
        loop {
            let grabber = self.grabber.as_mut().ok_or(CameraError::NotOpen)?;
            match grabber.grab() {
                Ok(raw) => return encode_frame(&raw, self.settings.jpeg_quality),
                Err(err) => {
                    // Keep the registry claim while reconnecting so no
                    // other manager steals the device in between.
                    self.grabber = None;
                    if attempts_left == 0 || !self.settings.auto_reconnect {
                        return Err(err);
                    }
                    attempts_left -= 1;
                    warn!(device = %self.device, %err, "frame read failed, reopening");
                    thread::sleep(self.settings.reconnect_delay);
                    self.initialize()?;
                }
            }
        }
    }

    /// Release the device handle and the registry claim. Idempotent.
    pub fn close(&mut self) {
        self.grabber = None;
        if let Some(key) = self.claimed.take() {
            self.registry.release(&key);
            debug!(device = %key, "camera released");
        }
    }

    /// Capture `count` frames and tally the results. Used by the field
    /// diagnostic tool.
    pub fn test_capture(&mut self, count: u32) -> CaptureTestReport {
        let mut report = CaptureTestReport::default();
        for _ in 0..count {
            match self.capture() {
                Ok(frame) => {
                    report.success_count += 1;
                    report.total_bytes += frame.byte_size;
                }
                Err(err) => {
                    report.failure_count += 1;
                    report.errors.push(err.to_string());
                }
            }
        }
        report
    }

    /// Open state plus one test capture.
    pub fn health_check(&mut self) -> CameraHealth {
        let mut health = CameraHealth {
            device: self.device.clone(),
            opened: self.is_opened(),
            test_capture: false,
            resolution: None,
            problems: Vec::new(),
        };

        if !health.opened {
            health.problems.push("camera is not open".to_string());
            return health;
        }

        match self.capture() {
            Ok(frame) => {
                health.test_capture = true;
                health.resolution = Some((frame.width, frame.height));
            }
            Err(err) => health.problems.push(format!("test capture failed: {err}")),
        }
        health
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Result of [`CameraManager::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct CameraHealth {
    pub device: String,
    pub opened: bool,
    pub test_capture: bool,
    pub resolution: Option<(u32, u32)>,
    pub problems: Vec<String>,
}

impl CameraHealth {
    pub fn is_healthy(&self) -> bool {
        self.opened && self.test_capture
    }
}

/// Tally from [`CameraManager::test_capture`].
#[derive(Debug, Clone, Default)]
pub struct CaptureTestReport {
    pub success_count: u32,
    pub failure_count: u32,
    pub total_bytes: usize,
    pub errors: Vec<String>,
}

impl CaptureTestReport {
    pub fn average_bytes(&self) -> usize {
        if self.success_count == 0 {
            0
        } else {
            self.total_bytes / self.success_count as usize
        }
    }
}
