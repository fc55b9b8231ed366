//! Fixed-cadence capture controller.
//!
//! Ties the camera managers, the positioning client and the upload
//! pipeline together: one timer thread runs a capture cycle per configured
//! interval, with a compare-and-swap guard so cycles never overlap - an
//! overrunning cycle causes the next tick to be skipped, not queued.
//!
//! Within a cycle the order is fixed: capture a frame (round-robin across
//! cameras), read a positioning fix, derive speed, assemble the payload and
//! conditionally enqueue it. Stationary frames (speed unknown or exactly
//! zero) are not uploaded. A failed capture aborts the cycle before the
//! GPS is touched.
//!
//! Steady-state errors surface as statistics and health state, never as
//! panics or errors across the controller boundary.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use hardware::camera::{CameraHealth, CameraManager, CameraSettings, CaptureFrame};
use hardware::hs6602::{GpsHealth, Hs6602, PositionFix};

use crate::config::AgentConfig;
use crate::upload::{UploadHealth, UploadManager, UploadPayload, UploadStats};

/// Knots to km/h.
pub const KNOTS_TO_KMH: f64 = 1.852;

/// Granularity of the timer thread's sleep, bounding stop() latency.
const TIMER_SLEEP_STEP: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ControllerError {
    /// The startup health check could not talk to the GPS module.
    #[error("GPS communication failed: {0}")]
    GpsUnavailable(String),

    /// A camera failed its startup open/test-capture check.
    #[error("camera {device} failed its startup check: {problems}")]
    CameraUnhealthy { device: String, problems: String },

    #[error("no cameras are configured")]
    NoCameras,

    #[error("failed to start cycle timer: {0}")]
    Timer(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] hardware::hs6602::TransportError),

    #[error(transparent)]
    Camera(#[from] hardware::camera::CameraError),
}

/// Counters owned by the controller, one mutex for update and snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub total_captures: u64,
    pub successful_captures: u64,
    pub failed_captures: u64,
    pub gps_valid_count: u64,
    pub gps_invalid_count: u64,
    pub enqueued_count: u64,
    pub start_time: Option<NaiveDateTime>,
    pub last_capture_time: Option<NaiveDateTime>,
    pub last_error: Option<String>,
}

/// [`ControllerStats`] enriched with upload stats and derived rates.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub controller: ControllerStats,
    pub upload: UploadStats,
    pub uptime_secs: Option<f64>,
    pub capture_success_rate: Option<f64>,
    pub gps_valid_rate: Option<f64>,
}

/// Aggregate health across every subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub healthy: bool,
    pub gps: GpsHealth,
    pub cameras: Vec<CameraHealth>,
    pub upload: UploadHealth,
}

struct ControllerShared {
    device_code: String,
    gps: Mutex<Hs6602>,
    cameras: Vec<Mutex<CameraManager>>,
    uploader: UploadManager,
    paused: AtomicBool,
    /// Cycle guard: set while a cycle body runs, checked at tick time.
    cycle_busy: AtomicBool,
    camera_cursor: AtomicUsize,
    stats: Mutex<ControllerStats>,
}

impl ControllerShared {
    /// Tick entry: skipped while paused or while the previous cycle is
    /// still executing.
    fn cycle(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        if self.cycle_busy.swap(true, Ordering::SeqCst) {
            debug!("previous cycle still running, tick skipped");
            return;
        }
        self.run_cycle();
        self.cycle_busy.store(false, Ordering::SeqCst);
    }

    fn run_cycle(&self) {
        let cycle_start = Instant::now();

        // 1. Capture, round-robin across the configured cameras.
        let index = self.camera_cursor.fetch_add(1, Ordering::SeqCst) % self.cameras.len();
        let captured = self.cameras[index].lock().unwrap().capture();
        let frame = match captured {
            Ok(frame) => frame,
            Err(err) => {
                warn!(camera = index, %err, "capture failed, cycle aborted");
                let mut stats = self.stats.lock().unwrap();
                stats.total_captures += 1;
                stats.failed_captures += 1;
                stats.last_error = Some(err.to_string());
                return;
            }
        };

        // 2. Positioning fix.
        let fix = self.gps.lock().unwrap().read_fix();
        {
            let mut stats = self.stats.lock().unwrap();
            if fix.valid {
                stats.gps_valid_count += 1;
            } else {
                stats.gps_invalid_count += 1;
            }
        }

        // 3. Speed in km/h, only meaningful on a valid fix.
        let speed_kmh = if fix.valid {
            fix.speed_knots.map(|knots| knots * KNOTS_TO_KMH)
        } else {
            None
        };

        // 4. Assemble and conditionally enqueue. A stopped (or
        // speed-unknown) vehicle produces no upload.
        let stationary = speed_kmh.map_or(true, |speed| speed == 0.0);
        if stationary {
            debug!("speed unknown or zero, upload skipped");
        } else {
            let payload = build_payload(&self.device_code, &fix, frame, speed_kmh);
            if self.uploader.enqueue(payload) {
                self.stats.lock().unwrap().enqueued_count += 1;
            } else {
                self.stats.lock().unwrap().last_error = Some("upload queue full".to_string());
            }
        }

        // 5. Aggregate statistics.
        {
            let mut stats = self.stats.lock().unwrap();
            stats.total_captures += 1;
            stats.successful_captures += 1;
            stats.last_capture_time = Some(Local::now().naive_local());
        }

        debug!(
            elapsed_ms = cycle_start.elapsed().as_millis() as u64,
            camera = index,
            gps_valid = fix.valid,
            "cycle complete"
        );
    }
}

fn build_payload(
    device_code: &str,
    fix: &PositionFix,
    frame: CaptureFrame,
    speed_kmh: Option<f64>,
) -> UploadPayload {
    let coordinate = |value: Option<f64>| {
        if fix.valid {
            value.map(|v| format!("{v:.6}")).unwrap_or_default()
        } else {
            String::new()
        }
    };

    UploadPayload {
        device_code: device_code.to_string(),
        lng: coordinate(fix.longitude),
        lat: coordinate(fix.latitude),
        img: frame.base64,
        alg_time: frame.timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        speed: speed_kmh.map(|v| format!("{v:.2}")).unwrap_or_default(),
    }
}

fn timer_loop(shared: Arc<ControllerShared>, interval: Duration, stop: Arc<AtomicBool>) {
    let mut next_tick = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next_tick {
            thread::sleep((next_tick - now).min(TIMER_SLEEP_STEP));
            continue;
        }

        shared.cycle();

        // Drift-free schedule; overrun ticks are skipped, never bursted.
        next_tick += interval;
        let now = Instant::now();
        while next_tick <= now {
            next_tick += interval;
        }
    }
}

/// Top-level coordinator. State machine: stopped -> running <-> paused ->
/// stopped; `close` is terminal.
pub struct CaptureController {
    shared: Arc<ControllerShared>,
    interval: Duration,
    running: AtomicBool,
    timer_stop: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureController {
    /// Build every component from configuration: GPS client on the
    /// configured serial port, one camera manager per configured device
    /// (the secondary camera is optional - a failure there is logged and
    /// skipped), and the upload pipeline.
    pub fn from_config(config: &AgentConfig) -> Result<Self, ControllerError> {
        info!("initializing GPS client");
        let gps = Hs6602::open(
            &config.gps.serial_port,
            config.gps.baud_rate,
            config.gps.slave_address,
            config.gps.timeout(),
        )?;

        let settings = CameraSettings {
            width: config.camera.resolution.0,
            height: config.camera.resolution.1,
            fps: config.camera.fps,
            jpeg_quality: config.camera.jpeg_quality,
            ..CameraSettings::default()
        };

        info!(device = %config.camera.device, "initializing primary camera");
        let mut primary = CameraManager::with_defaults(&config.camera.device, settings.clone());
        primary.initialize()?;

        let mut cameras = vec![primary];
        if let Some(device2) = &config.camera.device2 {
            info!(device = %device2, "initializing secondary camera");
            let mut secondary = CameraManager::with_defaults(device2, settings);
            match secondary.initialize() {
                Ok(()) => cameras.push(secondary),
                Err(err) => {
                    warn!(device = %device2, %err, "secondary camera unavailable, continuing without it");
                }
            }
        }

        let uploader = UploadManager::new(&config.upload);

        Self::from_parts(
            &config.system.device_id,
            config.system.capture_interval(),
            gps,
            cameras,
            uploader,
        )
    }

    /// Assemble a controller from ready-made components. The seam used by
    /// tests and by diagnostics that bring their own transports.
    pub fn from_parts(
        device_code: &str,
        interval: Duration,
        gps: Hs6602,
        cameras: Vec<CameraManager>,
        uploader: UploadManager,
    ) -> Result<Self, ControllerError> {
        if cameras.is_empty() {
            return Err(ControllerError::NoCameras);
        }

        Ok(Self {
            shared: Arc::new(ControllerShared {
                device_code: device_code.to_string(),
                gps: Mutex::new(gps),
                cameras: cameras.into_iter().map(Mutex::new).collect(),
                uploader,
                paused: AtomicBool::new(false),
                cycle_busy: AtomicBool::new(false),
                camera_cursor: AtomicUsize::new(0),
                stats: Mutex::new(ControllerStats::default()),
            }),
            interval,
            running: AtomicBool::new(false),
            timer_stop: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        })
    }

    /// Aggregate health check: GPS communication, every camera's
    /// open/test-capture state, upload worker/queue/backend state.
    pub fn health_check(&self) -> SystemHealth {
        let gps = self.shared.gps.lock().unwrap().health_check();
        let cameras: Vec<CameraHealth> = self
            .shared
            .cameras
            .iter()
            .map(|camera| camera.lock().unwrap().health_check())
            .collect();
        let upload = self.shared.uploader.health_check();

        let healthy = gps.communication && cameras.iter().all(CameraHealth::is_healthy);
        SystemHealth {
            healthy,
            gps,
            cameras,
            upload,
        }
    }

    /// Run the startup health check, start the delivery workers and arm
    /// the cycle timer.
    ///
    /// Refuses when GPS communication fails or any camera cannot produce a
    /// test frame. Upload-side problems (unreachable backend, full queue)
    /// are warnings only - the queue absorbs them once running.
    pub fn start(&self) -> Result<(), ControllerError> {
        if self.running.load(Ordering::SeqCst) {
            debug!("controller already running");
            return Ok(());
        }

        info!("running startup health check");
        let health = self.health_check();
        if !health.gps.communication {
            return Err(ControllerError::GpsUnavailable(
                health.gps.problems.join("; "),
            ));
        }
        for camera in &health.cameras {
            if !camera.is_healthy() {
                return Err(ControllerError::CameraUnhealthy {
                    device: camera.device.clone(),
                    problems: camera.problems.join("; "),
                });
            }
        }
        if !health.upload.problems.is_empty() {
            warn!(problems = ?health.upload.problems, "upload pipeline reported problems at startup");
        }

        self.shared.uploader.start();

        self.timer_stop.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let stop = self.timer_stop.clone();
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("capture-cycle".to_string())
            .spawn(move || timer_loop(shared, interval, stop))?;
        *self.timer.lock().unwrap() = Some(handle);

        self.shared.paused.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.shared.stats.lock().unwrap().start_time = Some(Local::now().naive_local());
        info!(interval_secs = self.interval.as_secs_f64(), "controller started");
        Ok(())
    }

    /// Run one capture cycle immediately, honoring pause and the
    /// non-overlap guard. The timer thread calls this; tests and
    /// diagnostics may too.
    pub fn cycle(&self) {
        self.shared.cycle();
    }

    /// Pause cycle execution without tearing anything down.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        info!("controller paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        info!("controller resumed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Disarm the timer (an in-flight cycle finishes first), then drain
    /// and stop the delivery pipeline. Safe to call from any thread;
    /// idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.timer_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.timer.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.shared.uploader.stop(true);
        info!("controller stopped");
    }

    /// Stop if running, then close every camera (releasing its registry
    /// claim). The GPS serial port closes when the controller drops.
    pub fn close(&self) {
        self.stop();
        for camera in &self.shared.cameras {
            camera.lock().unwrap().close();
        }
        info!("controller closed");
    }

    pub fn stats(&self) -> StatsSnapshot {
        let controller = self.shared.stats.lock().unwrap().clone();
        let upload = self.shared.uploader.stats();

        let uptime_secs = controller
            .start_time
            .map(|start| ((Local::now().naive_local() - start).num_milliseconds() as f64) / 1000.0);
        let capture_success_rate = (controller.total_captures > 0)
            .then(|| controller.successful_captures as f64 / controller.total_captures as f64 * 100.0);
        let gps_valid_rate = (controller.total_captures > 0)
            .then(|| controller.gps_valid_count as f64 / controller.total_captures as f64 * 100.0);

        StatsSnapshot {
            controller,
            upload,
            uptime_secs,
            capture_success_rate,
            gps_valid_rate,
        }
    }
}
