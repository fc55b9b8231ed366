//! Local mock backend for manual testing.
//!
//! Accepts any POST, logs a summary of the received payload (sizes rather
//! than the base64 body) and answers `200 {"status":"ok"}`. Optionally
//! persists payloads and decoded images to disk so a field run can be
//! inspected afterwards.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Local;
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mock upload backend for the road capture agent")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Persist each payload as JSON under this directory.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Also decode and save the `img` field as a JPEG file.
    #[arg(long)]
    save_images: bool,

    /// Log only errors.
    #[arg(long)]
    quiet: bool,
}

struct ServerState {
    args: Args,
    received: AtomicU64,
}

fn persist(state: &ServerState, payload: &serde_json::Value) {
    let Some(dir) = &state.args.save_dir else {
        return;
    };
    if let Err(err) = std::fs::create_dir_all(dir) {
        warn!(%err, "cannot create save directory");
        return;
    }

    let sequence = state.received.load(Ordering::SeqCst);
    let prefix = format!("{}_{sequence:06}", Local::now().format("%Y%m%d_%H%M%S"));

    let json_path = dir.join(format!("{prefix}.json"));
    match serde_json::to_vec_pretty(payload) {
        Ok(bytes) => {
            if let Err(err) = std::fs::write(&json_path, bytes) {
                warn!(path = %json_path.display(), %err, "failed to save payload");
            }
        }
        Err(err) => warn!(%err, "failed to serialize payload"),
    }

    if state.args.save_images {
        if let Some(img) = payload.get("img").and_then(|v| v.as_str()) {
            match BASE64.decode(img) {
                Ok(bytes) => {
                    let image_path = dir.join(format!("{prefix}.jpg"));
                    if let Err(err) = std::fs::write(&image_path, bytes) {
                        warn!(path = %image_path.display(), %err, "failed to save image");
                    }
                }
                Err(err) => warn!(%err, "img field is not valid base64"),
            }
        }
    }
}

async fn handle_upload(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let sequence = state.received.fetch_add(1, Ordering::SeqCst) + 1;

    if !state.args.quiet {
        let device = payload
            .get("deviceCode")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let alg_time = payload
            .get("algTime")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let speed = payload.get("speed").and_then(|v| v.as_str()).unwrap_or("-");
        let img_bytes = payload
            .get("img")
            .and_then(|v| v.as_str())
            .map(str::len)
            .unwrap_or(0);
        info!(
            sequence,
            device,
            alg_time,
            speed,
            img_base64_len = img_bytes,
            "payload received"
        );
    }

    persist(&state, &payload);

    Json(serde_json::json!({
        "status": "ok",
        "received_at": Local::now().naive_local().to_string(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let state = Arc::new(ServerState {
        args,
        received: AtomicU64::new(0),
    });

    // Accept the configured path and anything else the agent might POST.
    let app = Router::new()
        .route("/api/upload", post(handle_upload))
        .fallback(handle_upload)
        .with_state(state);

    info!(%addr, "mock backend listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
