//! Fanout Router
//!
//! Reads newline-delimited JSON from stdin and fans each document out to a
//! keyed lane. Runs until stdin reaches EOF or a termination signal arrives,
//! then drains every lane and prints the per-lane job metrics as JSON.
//!
//! ## Configuration
//!
//! Optional TOML file (first CLI argument, `FANOUT_CONFIG`, or the default
//! search paths) with `FANOUT_*` environment overrides. With
//! `input.key_field` set, BY_KEY routing uses that top-level field of each
//! document as the lane key.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

use fanout_common::logging::init_logging;
use fanout_config::ConfigLoader;
use fanout_router::{DefaultWorker, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    let loader = match std::env::args().nth(1) {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    // Notices are held back until the subscriber exists
    let (config, notices) = loader.load_with_notices()?;

    init_logging(&config.logging);
    for notice in &notices {
        notice.log();
    }

    info!(
        strategy = %config.routing.strategy,
        fixed_lanes = config.routing.fixed_lanes,
        key_field = ?config.input.key_field,
        "Starting Fanout Router"
    );

    let mut builder = Pipeline::<Value>::builder(config.routing.clone())
        .worker(Arc::new(DefaultWorker));
    if let Some(field) = config.input.key_field.clone() {
        builder = builder.key_extractor(move |doc: &Value| key_from_field(doc, &field));
    }
    let pipeline = Arc::new(builder.build()?);

    pipeline.complete_on(shutdown_signal());

    tokio::select! {
        result = read_input(&pipeline) => {
            if let Err(e) = result {
                error!(error = %e, "Failed to read input");
            }
            info!("Input exhausted");
        }
        _ = pipeline.wait_completed() => {
            info!("Shutdown signal received, no longer reading input");
        }
    }

    let drain_timeout = Duration::from_secs(config.shutdown.drain_timeout_secs);
    match tokio::time::timeout(drain_timeout, pipeline.shutdown()).await {
        Ok(()) => info!("All lanes drained"),
        Err(_) => warn!(
            timeout_secs = config.shutdown.drain_timeout_secs,
            lane_count = pipeline.lane_count(),
            "Lanes did not drain within timeout"
        ),
    }

    let metrics = pipeline.metrics();
    for name in metrics.names() {
        let snapshot = serde_json::to_string(&metrics.get_metric(&name))?;
        println!("{} {}", name, snapshot);
    }

    info!("Fanout Router shutdown complete");
    Ok(())
}

/// Push every stdin line into the pipeline. Lines that are not valid JSON are
/// skipped; a literal `null` is pushed as an absent payload.
async fn read_input(pipeline: &Pipeline<Value>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Null) => pipeline.push_option(None),
            Ok(doc) => {
                if pipeline.try_push(doc).is_err() {
                    warn!(line = line_number, "Pipeline completed, discarding remaining input");
                    break;
                }
            }
            Err(e) => warn!(line = line_number, error = %e, "Skipping invalid JSON line"),
        }
    }

    Ok(())
}

/// Key for BY_KEY routing: the named top-level field, if it is a string or number
fn key_from_field(doc: &Value, field: &str) -> Option<String> {
    match doc.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
