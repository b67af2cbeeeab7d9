//! Task dispatch - producer API and worker pool in one process

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use taskdispatch::broker::{Broker, RedisBroker};
use taskdispatch::tasks::register_handlers;
use taskdispatch::{server, AppConfig, HandlerRegistry, TaskClient, Worker};

#[derive(Debug, Parser)]
#[command(name = "taskdispatch", version, about = "Background job dispatch over Redis")]
struct Args {
    /// Redis address (host:port or redis:// URL)
    #[arg(long, env = "REDIS_ADDR", default_value = "localhost:6379")]
    redis_addr: String,

    /// HTTP listen address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:3000")]
    http_addr: String,

    /// Maximum number of tasks running at once
    #[arg(long, env = "CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Queues to consume, comma separated
    #[arg(long, env = "QUEUES", value_delimiter = ',', default_value = "default")]
    queues: Vec<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(env_filter).init();

    let config = AppConfig::new(&args.redis_addr, &args.http_addr, args.concurrency)
        .with_queues(args.queues);
    config.validate().context("invalid configuration")?;

    info!(
        "Starting taskdispatch: redis={} http={} concurrency={} queues={:?}",
        config.broker.redis_url, config.server.addr, config.worker.concurrency, config.worker.queues
    );

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::new(config.broker.clone())
            .await
            .context("could not connect to Redis")?,
    );

    let client = TaskClient::with_config(broker.clone(), config.client.clone());

    let mut registry = HandlerRegistry::new();
    register_handlers(&mut registry);
    info!("Registered handlers: {:?}", registry.task_types());

    let shutdown = CancellationToken::new();
    let worker = Worker::new(config.worker.clone(), broker.clone(), registry, shutdown.clone());

    let worker_handle = tokio::spawn(async move { worker.run().await });
    let server_config = config.server.clone();
    let server_shutdown = shutdown.clone();
    let server_handle =
        tokio::spawn(async move { server::serve(&server_config, client, server_shutdown).await });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    // Either component failing takes the other down with it
    let (worker_result, server_result) = tokio::join!(
        async {
            let result = worker_handle.await;
            shutdown.cancel();
            result
        },
        async {
            let result = server_handle.await;
            shutdown.cancel();
            result
        }
    );

    if let Err(e) = broker.close().await {
        error!("Failed to close broker: {}", e);
    }

    worker_result.context("worker task failed")?.context("worker stopped with an error")?;
    server_result.context("server task failed")?.context("server stopped with an error")?;

    info!("Shutdown complete");
    Ok(())
}
