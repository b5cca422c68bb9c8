//! Worker process running the default and customized computation queues against Redis.
//!
//! Configured through the environment, see [`script_engine::config`]. Log output is controlled
//! with `RUST_LOG` and defaults to `info`.
use std::{error::Error, str::FromStr, sync::Arc};

use script_engine::{
    artifacts::ResultArtifactStore,
    config::Settings,
    data_management::HttpDataManagementClient,
    executors::{CustomizedComputationExecutor, DefaultComputationExecutor, ExecutorContext},
    plugin::process::ProcessPluginLoader,
    prelude::*,
    progress::FileProgressStore,
};
use script_engine_redis::RedisBackend;
use tracing_subscriber::EnvFilter;

const NAMESPACE: &str = "script-engine";
/// Pruner runs at the start of every hour.
const PRUNE_SCHEDULE: &str = "0 0 * * * *";

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    tracing::info!(?settings, "Starting script engine worker");

    let backend = RedisBackend::from_url(&settings.redis_url(), NAMESPACE).await?;

    let data_management = Arc::new(HttpDataManagementClient::new(
        reqwest::Client::new(),
        &settings.data_management_read_url,
        &settings.data_management_write_url,
    ));
    let plugins = Arc::new(ProcessPluginLoader::new(
        data_management.clone(),
        settings.plugin_directory(),
        &settings.plugin_interpreter,
        &settings.plugin_file_extension,
        settings.plugin_timeout,
    ));
    let context = ExecutorContext::new(
        data_management,
        plugins,
        Arc::new(FileProgressStore::new(settings.progress_directory())),
        ResultArtifactStore::new(settings.results_directory()),
    );

    let pruner = PrunerConfig::retention(
        cron::Schedule::from_str(PRUNE_SCHEDULE)?,
        settings.job_retention,
    );

    let runtime = WorkerRuntime::new(backend)
        .with_max_attempts(settings.job_max_attempts)
        .with_executor(DefaultComputationExecutor::new(context.clone()))
        .with_executor(CustomizedComputationExecutor::new(context))
        .with_job_pruner(pruner);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    runtime.graceful_shutdown().await?;
    Ok(())
}
