//! Resilient HTTP delivery pipeline.
//!
//! Decouples payload production from network delivery: the capture cycle
//! drops payloads onto a bounded queue without ever blocking, and a fixed
//! pool of worker threads performs the actual POSTs with classification-
//! based retry and exponential backoff. A slow or absent backend costs
//! queued payloads, never capture cadence.
//!
//! Failure classification is data, not control flow: every delivery
//! attempt produces a [`DeliveryFailure`] value whose
//! [`is_retryable`](DeliveryFailure::is_retryable) drives the retry loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{RetryConfig, UploadConfig};

/// How long a worker waits on the queue before rechecking the running
/// flag. Bounds shutdown latency.
const WORKER_POLL: Duration = Duration::from_secs(1);

/// Upper bound on the drain wait in [`UploadManager::stop`].
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Quick retries for connection-establishment failures inside a single
/// send, below the application-level backoff loop.
const CONNECT_RETRY_ATTEMPTS: u32 = 2;
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Timeout for the health-probe request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The JSON body POSTed to the backend. Field names are the backend's.
#[derive(Debug, Clone, Serialize)]
pub struct UploadPayload {
    #[serde(rename = "deviceCode")]
    pub device_code: String,
    /// Longitude, 6 fractional digits, empty when unknown.
    pub lng: String,
    /// Latitude, 6 fractional digits, empty when unknown.
    pub lat: String,
    /// Base64 JPEG.
    pub img: String,
    /// Capture timestamp, `YYYY-MM-DD HH:MM:SS.ffffff`.
    #[serde(rename = "algTime")]
    pub alg_time: String,
    /// Speed in km/h, 2 fractional digits, empty when unknown.
    pub speed: String,
}

/// Why a delivery attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// 400/401/403/404 - the payload or credentials are wrong; retrying
    /// cannot help.
    #[error("client error: HTTP {status}")]
    Client { status: u16 },

    /// Any other non-200 status (5xx, 429, ...).
    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    /// Anything else; terminal without retry.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl DeliveryFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::Timeout | Self::Connection(_)
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Client { status } | Self::Server { status } => Some(*status),
            _ => None,
        }
    }
}

/// Classify a transport-level error from the HTTP client.
fn classify_transport(err: &ureq::Error) -> DeliveryFailure {
    match err {
        ureq::Error::Timeout(_) => DeliveryFailure::Timeout,
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound | ureq::Error::Io(_) => {
            DeliveryFailure::Connection(err.to_string())
        }
        other => DeliveryFailure::Unexpected(other.to_string()),
    }
}

/// Classify an HTTP status; `None` means success.
fn classify_status(status: u16) -> Option<DeliveryFailure> {
    match status {
        200 => None,
        400 | 401 | 403 | 404 => Some(DeliveryFailure::Client { status }),
        _ => Some(DeliveryFailure::Server { status }),
    }
}

/// Exponential-backoff schedule for retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl RetryPolicy {
    /// Delay before the retry following attempt `attempt` (0-based):
    /// `base * exponential_base^attempt`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs_f64(config.base_delay_secs),
            max_delay: Duration::from_secs_f64(config.max_delay_secs),
            exponential_base: config.exponential_base,
        }
    }
}

/// Result of one synchronous delivery (including its retries).
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    /// Response body, parsed as JSON when possible, wrapped raw otherwise.
    pub response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub upload_time: NaiveDateTime,
    /// Retries performed before this outcome.
    pub retry_count: u32,
}

/// Pipeline counters, guarded by one mutex.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadStats {
    pub total_uploaded: u64,
    pub total_failed: u64,
    pub queue_length: usize,
    pub last_upload_time: Option<NaiveDateTime>,
    pub last_error: Option<String>,
}

/// Queue occupancy classification for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Ok,
    Warning,
    Critical,
}

impl QueueStatus {
    pub fn classify(occupancy: usize, capacity: usize) -> Self {
        let fraction = occupancy as f64 / capacity.max(1) as f64;
        if fraction > 0.8 {
            Self::Critical
        } else if fraction >= 0.5 {
            Self::Warning
        } else {
            Self::Ok
        }
    }
}

/// Result of [`UploadManager::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct UploadHealth {
    pub backend_reachable: bool,
    pub queue_status: QueueStatus,
    pub queue_length: usize,
    pub workers_running: usize,
    pub problems: Vec<String>,
}

struct PipelineShared {
    agent: ureq::Agent,
    probe_agent: ureq::Agent,
    backend_url: String,
    policy: RetryPolicy,
    sender: Sender<UploadPayload>,
    receiver: Receiver<UploadPayload>,
    capacity: usize,
    worker_count: usize,
    running: AtomicBool,
    in_flight: AtomicUsize,
    stats: Mutex<UploadStats>,
}

impl PipelineShared {
    /// One POST, with quick retries for connection-establishment failures.
    /// Pooled connections and this low-level retry live below the
    /// application-level backoff loop.
    fn send(&self, payload: &UploadPayload) -> Result<ureq::http::Response<ureq::Body>, ureq::Error> {
        let mut attempt = 0;
        loop {
            match self.agent.post(&self.backend_url).send_json(payload) {
                Err(err)
                    if attempt < CONNECT_RETRY_ATTEMPTS
                        && matches!(
                            err,
                            ureq::Error::ConnectionFailed | ureq::Error::Io(_)
                        ) =>
                {
                    attempt += 1;
                    debug!(%err, attempt, "connection failed, quick retry");
                    thread::sleep(CONNECT_RETRY_PAUSE);
                }
                other => return other,
            }
        }
    }

    /// Deliver one payload synchronously, retrying per the policy.
    fn upload_sync(&self, payload: &UploadPayload) -> UploadOutcome {
        let mut attempt = 0u32;
        loop {
            let failure = match self.send(payload) {
                Ok(mut response) => {
                    let status = response.status().as_u16();
                    match classify_status(status) {
                        None => {
                            let body = read_response_body(&mut response);
                            let outcome = UploadOutcome {
                                success: true,
                                status_code: Some(status),
                                response: body,
                                error_message: None,
                                upload_time: Local::now().naive_local(),
                                retry_count: attempt,
                            };
                            let mut stats = self.stats.lock().unwrap();
                            stats.total_uploaded += 1;
                            stats.last_upload_time = Some(outcome.upload_time);
                            return outcome;
                        }
                        Some(failure) => failure,
                    }
                }
                Err(err) => classify_transport(&err),
            };

            if failure.is_retryable() && attempt + 1 < self.policy.max_attempts {
                let delay = self.policy.backoff_delay(attempt);
                debug!(
                    attempt = attempt + 1,
                    max_attempts = self.policy.max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    %failure,
                    "upload failed, backing off"
                );
                thread::sleep(delay);
                attempt += 1;
                continue;
            }

            let outcome = UploadOutcome {
                success: false,
                status_code: failure.status_code(),
                response: None,
                error_message: Some(failure.to_string()),
                upload_time: Local::now().naive_local(),
                retry_count: attempt,
            };
            let mut stats = self.stats.lock().unwrap();
            stats.total_failed += 1;
            stats.last_error = Some(failure.to_string());
            return outcome;
        }
    }
}

fn read_response_body(
    response: &mut ureq::http::Response<ureq::Body>,
) -> Option<serde_json::Value> {
    let text = response.body_mut().read_to_string().ok()?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(_) => Some(serde_json::json!({ "raw": text })),
    }
}

fn worker_loop(shared: Arc<PipelineShared>) {
    let name = thread::current()
        .name()
        .unwrap_or("upload-worker")
        .to_string();
    debug!(worker = %name, "upload worker started");

    while shared.running.load(Ordering::SeqCst) {
        match shared.receiver.recv_timeout(WORKER_POLL) {
            Ok(payload) => {
                shared.in_flight.fetch_add(1, Ordering::SeqCst);
                let outcome = shared.upload_sync(&payload);
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);

                if outcome.success {
                    debug!(
                        worker = %name,
                        status = outcome.status_code,
                        retries = outcome.retry_count,
                        "upload delivered"
                    );
                } else {
                    warn!(
                        worker = %name,
                        retries = outcome.retry_count,
                        error = outcome.error_message.as_deref().unwrap_or("unknown"),
                        "upload failed"
                    );
                }

                shared.stats.lock().unwrap().queue_length = shared.receiver.len();
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = %name, "upload worker stopped");
}

/// Bounded queue + worker pool + retrying HTTP delivery.
pub struct UploadManager {
    shared: Arc<PipelineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl UploadManager {
    pub fn new(config: &UploadConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout()))
            .http_status_as_error(false)
            .build()
            .into();
        let probe_agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(PROBE_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .into();

        let (sender, receiver) = crossbeam_channel::bounded(config.queue_max_size);

        Self {
            shared: Arc::new(PipelineShared {
                agent,
                probe_agent,
                backend_url: config.backend_url.clone(),
                policy: RetryPolicy::from(&config.retry),
                sender,
                receiver,
                capacity: config.queue_max_size,
                worker_count: config.workers,
                running: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                stats: Mutex::new(UploadStats::default()),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("upload manager already running");
            return;
        }

        let mut workers = self.workers.lock().unwrap();
        for index in 0..self.shared.worker_count {
            let shared = self.shared.clone();
            match thread::Builder::new()
                .name(format!("upload-worker-{index}"))
                .spawn(move || worker_loop(shared))
            {
                Ok(handle) => workers.push(handle),
                Err(err) => error!(%err, "failed to spawn upload worker"),
            }
        }
        info!(workers = workers.len(), "upload manager started");
    }

    /// Non-blocking enqueue. A full queue drops the payload and records
    /// the condition; it never blocks the caller and never grows.
    pub fn enqueue(&self, payload: UploadPayload) -> bool {
        match self.shared.sender.try_send(payload) {
            Ok(()) => {
                self.shared.stats.lock().unwrap().queue_length = self.shared.receiver.len();
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(capacity = self.shared.capacity, "upload queue full, payload dropped");
                self.shared.stats.lock().unwrap().last_error =
                    Some("upload queue full".to_string());
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Deliver one payload on the calling thread, with retries. Used by
    /// the workers and by tests/diagnostics.
    pub fn upload_sync(&self, payload: &UploadPayload) -> UploadOutcome {
        self.shared.upload_sync(payload)
    }

    pub fn stats(&self) -> UploadStats {
        let mut stats = self.shared.stats.lock().unwrap().clone();
        stats.queue_length = self.shared.receiver.len();
        stats
    }

    /// Worker liveness, queue occupancy classification and a best-effort
    /// reachability probe. Any HTTP response - including 4xx - proves the
    /// backend is reachable.
    pub fn health_check(&self) -> UploadHealth {
        let workers_running = self
            .workers
            .lock()
            .unwrap()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count();

        let queue_length = self.shared.receiver.len();
        let queue_status = QueueStatus::classify(queue_length, self.shared.capacity);

        let mut problems = Vec::new();
        if self.shared.running.load(Ordering::SeqCst)
            && workers_running < self.shared.worker_count
        {
            problems.push(format!(
                "only {workers_running}/{} workers running",
                self.shared.worker_count
            ));
        }
        if queue_status == QueueStatus::Critical {
            problems.push(format!(
                "queue nearly full: {queue_length}/{}",
                self.shared.capacity
            ));
        }

        let probe = serde_json::json!({
            "test": true,
            "timestamp": Local::now().naive_local().to_string(),
        });
        let backend_reachable = match self
            .shared
            .probe_agent
            .post(&self.shared.backend_url)
            .send_json(&probe)
        {
            Ok(_) => true,
            Err(err) => {
                problems.push(format!("backend unreachable: {err}"));
                false
            }
        };

        UploadHealth {
            backend_reachable,
            queue_status,
            queue_length,
            workers_running,
            problems,
        }
    }

    /// Stop the workers. With `wait_completion` the call first waits
    /// (bounded) for the queue to empty and in-flight deliveries to
    /// finish. Idempotent.
    pub fn stop(&self, wait_completion: bool) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }

        if wait_completion {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            while (!self.shared.receiver.is_empty()
                || self.shared.in_flight.load(Ordering::SeqCst) > 0)
                && Instant::now() < deadline
            {
                thread::sleep(Duration::from_millis(50));
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            // Workers notice the flag within one poll interval.
            let _ = handle.join();
        }
        info!("upload manager stopped");
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.stop(false);
    }
}
