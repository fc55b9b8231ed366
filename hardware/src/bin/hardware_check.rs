//! Field diagnostic for the capture terminal's equipment.
//!
//! Probes the HS6602 positioning module and each configured camera, then
//! prints a readiness report. Exit code 0 means everything answered.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use hardware::camera::{CameraManager, CameraSettings, DeviceRegistry};
use hardware::hs6602::Hs6602;

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe the terminal's GPS module and cameras")]
struct Args {
    /// Serial port of the HS6602 module.
    #[arg(long, default_value = "/dev/ttyUSB0")]
    gps_port: String,

    /// Modbus slave address.
    #[arg(long, default_value_t = 1)]
    slave: u8,

    /// Serial baud rate.
    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Serial read timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,

    /// Camera device identifier; repeat for multiple cameras.
    #[arg(long = "camera", default_values_t = vec![String::from("/dev/video0")])]
    cameras: Vec<String>,

    /// Test frames to capture per camera.
    #[arg(long, default_value_t = 3)]
    frames: u32,

    /// Skip the GPS probe.
    #[arg(long)]
    no_gps: bool,

    /// Sample fixes to read after the GPS health check.
    #[arg(long, default_value_t = 3)]
    fixes: u32,
}

fn check_gps(args: &Args) -> bool {
    println!("== GPS module ({}) ==", args.gps_port);

    let mut gps = match Hs6602::open(
        &args.gps_port,
        args.baud,
        args.slave,
        Duration::from_millis(args.timeout_ms),
    ) {
        Ok(gps) => gps,
        Err(err) => {
            println!("  FAIL: cannot open serial port: {err}");
            return false;
        }
    };

    let health = gps.health_check();
    println!("  communication: {}", health.communication);
    if let Some(version) = &health.version {
        println!("  firmware: {version}");
    }
    println!("  positioning: {}", health.positioning);
    if let Some(antenna) = health.antenna {
        println!("  antenna: {antenna}");
    }
    for problem in &health.problems {
        println!("  problem: {problem}");
    }

    if health.communication {
        for n in 1..=args.fixes {
            let fix = gps.read_fix();
            if fix.valid {
                println!(
                    "  fix {n}: {:.5}{} {:.5}{} sats {}/{}",
                    fix.latitude.unwrap_or(0.0),
                    fix.lat_direction.unwrap_or('?'),
                    fix.longitude.unwrap_or(0.0),
                    fix.lon_direction.unwrap_or('?'),
                    fix.gps_satellites,
                    fix.bds_satellites,
                );
            } else {
                println!(
                    "  fix {n}: invalid ({})",
                    fix.error_message.as_deref().unwrap_or("unknown")
                );
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    health.communication
}

fn check_camera(device: &str, frames: u32) -> bool {
    println!("== Camera ({device}) ==");

    let mut cam = CameraManager::new(
        device,
        CameraSettings::default(),
        hardware::camera::default_backend(),
        DeviceRegistry::global(),
    );

    if let Err(err) = cam.initialize() {
        println!("  FAIL: {err}");
        return false;
    }
    if cam.device() != device {
        println!("  note: fell over to {}", cam.device());
    }

    let report = cam.test_capture(frames);
    println!(
        "  captures: {}/{} ok, avg {:.1} KB",
        report.success_count,
        frames,
        report.average_bytes() as f64 / 1024.0
    );
    for error in &report.errors {
        println!("  error: {error}");
    }

    cam.close();
    report.failure_count == 0 && report.success_count > 0
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut ready = true;

    if args.no_gps {
        warn!("skipping GPS probe");
    } else {
        ready &= check_gps(&args);
    }

    for device in &args.cameras {
        ready &= check_camera(device, args.frames);
    }

    println!();
    if ready {
        println!("All equipment answered.");
        Ok(())
    } else {
        anyhow::bail!("one or more checks failed");
    }
}
