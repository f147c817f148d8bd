use std::sync::Arc;

use anyhow::Error;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

use thumbq::broker::Broker;
use thumbq::config::Config;
use thumbq::processor::{Processor, ProcessorConfig};
use thumbq::resize::ImageResizer;
use thumbq::store::S3Store;
use thumbq::telemetry;
use thumbq::worker::Worker;

#[instrument(skip_all)]
async fn setup(config: Config, cancel_token: CancellationToken) -> Result<(), Error> {
    let broker = Arc::new(Broker::new(config.broker.clone()));
    let store = Arc::new(S3Store::new(&config.store).await);

    let processor = Arc::new(Processor::new(
        store,
        ImageResizer::new(config.worker.jpeg_quality),
        ProcessorConfig::from_config(&config),
    ));
    let worker = Worker::new(broker.clone(), processor, config.worker.job_timeout());

    let result = worker
        .start(cancel_token)
        .instrument(info_span!("worker"))
        .await;

    broker.close().await;
    result?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    telemetry::init(config.jaeger_endpoint.as_deref())?;
    info!(queue = %config.broker.queue, bucket = %config.store.bucket, "Starting resize worker");

    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let app = tokio::spawn(setup(config, token.clone()));

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        token.cancel();
    });

    let result = app.await?;
    if let Err(err) = &result {
        error!(error = %err, "Resize worker failed");
    }

    info!("Shutting down.");
    telemetry::shutdown();

    result?;
    Ok(())
}
