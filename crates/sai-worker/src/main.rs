//! Camera safety evaluation worker binary.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sai_eval::{DetectorSet, EvaluationPreferences, YoloConfig, YoloDetector};
use sai_stream::{StreamConnector, StreamManager, StreamPreferences};
use sai_worker::{config_source, metrics, Worker, WorkerConfig};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("sai=info".parse().unwrap())
        .add_directive("ort=warn".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting sai-worker");

    if let Err(e) = run().await {
        error!("Worker error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();
    config.validate().context("invalid worker configuration")?;
    info!("Worker config: {:?}", config);

    let stream_prefs = StreamPreferences::from_env();
    stream_prefs.validate().context("invalid stream preferences")?;
    let eval_prefs = EvaluationPreferences::from_env();
    eval_prefs
        .validate()
        .context("invalid evaluation preferences")?;

    let metrics_handle = if config.metrics_enabled {
        Some(metrics::init_metrics()?)
    } else {
        None
    };

    let detectors = load_detectors(&config)?;
    let connector = connector(&stream_prefs)?;
    let streams = Arc::new(StreamManager::new(connector, stream_prefs));
    let source = config_source::from_settings(&config.config_source, config.api_timeout)?;

    let worker = Worker::new(
        config,
        streams,
        source,
        detectors,
        eval_prefs,
        metrics_handle,
    );

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown.trigger();
    });

    worker.run().await?;
    Ok(())
}

/// The pose model is required; the others are loaded when configured.
fn load_detectors(config: &WorkerConfig) -> anyhow::Result<DetectorSet> {
    fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    let mut detectors = DetectorSet::new();
    let pose = YoloDetector::new(YoloConfig::pose(path_str(&config.pose_model_path)))
        .context("loading pose model")?;
    detectors.insert(Arc::new(pose));

    if let Some(path) = &config.hardhat_model_path {
        let hardhat =
            YoloDetector::new(YoloConfig::hardhat(path_str(path))).context("loading hardhat model")?;
        detectors.insert(Arc::new(hardhat));
    }
    if let Some(path) = &config.forklift_model_path {
        let forklift = YoloDetector::new(YoloConfig::forklift(path_str(path)))
            .context("loading forklift model")?;
        detectors.insert(Arc::new(forklift));
    }

    info!(
        detectors = ?detectors.kinds().map(|k| k.as_str()).collect::<Vec<_>>(),
        "Detectors loaded"
    );
    Ok(detectors)
}

#[cfg(feature = "opencv")]
fn connector(prefs: &StreamPreferences) -> anyhow::Result<Arc<dyn StreamConnector>> {
    Ok(Arc::new(sai_stream::OpenCvConnector::new(
        prefs.connect_timeout,
        prefs.read_timeout,
    )))
}

#[cfg(not(feature = "opencv"))]
fn connector(_prefs: &StreamPreferences) -> anyhow::Result<Arc<dyn StreamConnector>> {
    anyhow::bail!("built without the opencv feature, no camera backend available")
}
