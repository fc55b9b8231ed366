//! Road capture terminal entry point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};

use road_capture::config::AgentConfig;
use road_capture::controller::CaptureController;

#[derive(Parser, Debug)]
#[command(author, version, about = "Vehicle-mounted road photo capture agent")]
struct Args {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force debug-level logging regardless of the configured level.
    #[arg(long)]
    debug: bool,

    /// Run the aggregate health check and exit.
    #[arg(long)]
    health_check: bool,

    /// Run for 30 seconds, print statistics and exit.
    #[arg(long)]
    test: bool,
}

fn init_logging(configured_level: &str, debug: bool) {
    let level = if debug {
        Level::DEBUG
    } else {
        match configured_level.to_ascii_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn log_stats(controller: &CaptureController) {
    let stats = controller.stats();
    info!(
        captures = stats.controller.total_captures,
        ok = stats.controller.successful_captures,
        failed = stats.controller.failed_captures,
        gps_valid = stats.controller.gps_valid_count,
        gps_invalid = stats.controller.gps_invalid_count,
        enqueued = stats.controller.enqueued_count,
        uploaded = stats.upload.total_uploaded,
        upload_failed = stats.upload.total_failed,
        queue = stats.upload.queue_length,
        "statistics"
    );
    if let Some(error) = &stats.controller.last_error {
        info!(error = %error, "last error");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable, falling back to Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AgentConfig::load(args.config.as_deref())?;
    init_logging(&config.system.log_level, args.debug);

    info!(
        device_id = %config.system.device_id,
        gps_port = %config.gps.serial_port,
        camera = %config.camera.device,
        backend = %config.upload.backend_url,
        interval_secs = config.system.capture_interval_secs,
        "road capture terminal starting"
    );

    let controller = CaptureController::from_config(&config)?;

    if args.health_check {
        let health = controller.health_check();
        println!("{}", serde_json::to_string_pretty(&health)?);
        controller.close();
        if health.healthy {
            info!("all systems healthy");
            return Ok(());
        }
        anyhow::bail!("health check failed");
    }

    controller.start()?;
    info!("system running, Ctrl-C to stop");

    if args.test {
        tokio::time::sleep(Duration::from_secs(30)).await;
        info!("test window elapsed");
    } else {
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut stats_tick = tokio::time::interval(Duration::from_secs(60));
        stats_tick.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = stats_tick.tick() => log_stats(&controller),
            }
        }
        info!("shutdown requested");
    }

    log_stats(&controller);
    controller.close();
    info!("shutdown complete");
    Ok(())
}
