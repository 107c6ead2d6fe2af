//! lmshim - Main Entry Point
//!
//! Reads a JSON predict request from the file named on the command line (or
//! from stdin), loads the model and prints either the completion as JSON or
//! the generated text as it streams in.

use anyhow::{Context, Result};
use lmshim_common::config::ObservabilityConfig;
use lmshim_common::{PredictorConfig, METRICS};
use lmshim_predictor::{Prediction, Predictor};
use lmshim_proto::PredictRequest;
use std::io::{Read, Write};
use tokio::signal;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "configs/predictor.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let print_config = args.iter().any(|arg| arg == "--print-config");
    let request_path = args.iter().find(|arg| !arg.starts_with("--")).cloned();

    let config = load_config()?;

    if print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    init_tracing(&config.observability);

    let request = read_request(request_path.as_deref())?;

    info!(
        "Loading model {} (revision {})",
        config.model.model_id, config.model.revision
    );
    let load_config = config.clone();
    let predictor = tokio::task::spawn_blocking(move || Predictor::load(&load_config))
        .await
        .context("Model loading task failed")??;

    let prepared = predictor.preprocess(request)?;
    let stream_buffer = predictor.stream_buffer();
    info!("Handling request {}", prepared.request_id);

    let prediction = tokio::task::spawn_blocking(move || predictor.predict(prepared))
        .await
        .context("Prediction task failed")??;

    let outcome = match prediction {
        Prediction::Complete(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Prediction::Stream(stream) => print_stream(stream.into_async(stream_buffer)).await,
    };

    write_metrics(&config.observability);
    outcome
}

/// Load configuration, requiring the file only when `LMSHIM_CONFIG` names one
fn load_config() -> Result<PredictorConfig> {
    let (path, required) = match std::env::var("LMSHIM_CONFIG") {
        Ok(path) => (path, true),
        Err(_) => (DEFAULT_CONFIG_PATH.to_string(), false),
    };

    PredictorConfig::load(&path, required)
        .with_context(|| format!("Failed to load configuration from {}", path))
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&observability.log_level));

    // stdout carries the prediction, logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    if observability.structured_logging {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn read_request(path: Option<&str>) -> Result<PredictRequest> {
    let body = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request from {}", path))?,
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("Failed to read request from stdin")?;
            body
        }
    };

    serde_json::from_str(&body).context("Request is not a valid predict request")
}

/// Print chunks as they arrive until the stream ends or Ctrl-C
async fn print_stream(mut chunks: ReceiverStream<lmshim_common::Result<String>>) -> Result<()> {
    let mut stdout = std::io::stdout();
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Received interrupt, stopping the stream");
                break;
            }
            chunk = chunks.next() => match chunk {
                Some(chunk) => {
                    write!(stdout, "{}", chunk?)?;
                    stdout.flush()?;
                }
                None => break,
            }
        }
    }

    writeln!(stdout)?;
    Ok(())
}

fn write_metrics(observability: &ObservabilityConfig) {
    if !observability.enable_metrics {
        return;
    }
    let Some(path) = &observability.metrics_file else {
        return;
    };

    match std::fs::write(path, METRICS.gather()) {
        Ok(()) => info!("Metrics written to {}", path.display()),
        Err(e) => error!("Failed to write metrics to {}: {}", path.display(), e),
    }
}
