//! Asynchronous execution of indicator computation plugins over spatial hierarchies.
//!
//! Jobs are stored by a [`backend::Backend`] and processed by a [`WorkerRuntime`] running one
//! loop per registered [`executor::Executor`]. The two executors provided by
//! [`executors`] load a plugin for the job, drive it through the spatial unit hierarchy via
//! [`computation`] and report progress to a [`progress::ProgressStore`]. The
//! [`service::ScriptEngine`] facade enqueues jobs and answers status queries.
//!
//! # Example
//!
//! ```no_run
//! # use script_engine::prelude::*;
//! # use script_engine::backend::memory::InMemoryBackend;
//! # use script_engine::executors::{CustomizedComputationExecutor, ExecutorContext};
//! # async fn run(context: ExecutorContext) -> Result<(), RuntimeError> {
//! let runtime = WorkerRuntime::new(InMemoryBackend::new())
//!     .with_executor(CustomizedComputationExecutor::new(context));
//!
//! runtime.graceful_shutdown().await
//! # }
//! ```
use std::{sync::Arc, time::Duration};

pub mod aggregation;
pub mod artifacts;
pub mod backend;
pub mod backoff;
pub mod computation;
pub mod config;
pub mod data_management;
pub mod executor;
pub mod executors;
pub mod job;
pub mod model;
pub mod plugin;
pub mod prelude;
pub mod progress;
pub mod pruner;
pub mod service;
pub mod status;
pub mod testing;

use backend::{Backend, BackendError};
use executor::Executor;
use futures::StreamExt;
use job::runner::JobRunner;
use pruner::{runner::PrunerRunner, PrunerConfig};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay before polling the job stream again after it returned an error.
const STREAM_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Runs the executor loops and the job pruner against a backend.
#[derive(Debug)]
pub struct WorkerRuntime<B: Backend> {
    backend: B,
    handles: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
    max_attempts: Option<u16>,
}

impl<B> WorkerRuntime<B>
where
    B: Backend + Send + Sync + Clone + 'static,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            handles: Default::default(),
            cancellation_token: Default::default(),
            max_attempts: None,
        }
    }

    /// Give every job run by this worker `max_attempts` attempts, whatever it was enqueued with.
    ///
    /// Only applies to executors added after this call.
    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Start processing the jobs of the given executor.
    ///
    /// The executor is shared by every job it runs. Jobs of a single executor are run one at a
    /// time.
    pub fn with_executor<E>(mut self, executor: E) -> Self
    where
        E: Executor,
    {
        let handle = tokio::spawn({
            let backend = self.backend.clone();
            let cancellation_token = self.cancellation_token.clone();
            let executor = Arc::new(executor);
            let max_attempts = self.max_attempts;
            async move {
                let mut stream = backend.subscribe_ready_jobs(E::NAME.into()).await;
                let runner =
                    JobRunner::<B, E>::new(backend, executor).with_max_attempts(max_attempts);
                tracing::debug!("Started job runner for {}", E::NAME);
                loop {
                    tokio::select! {
                        message = stream.next() => {
                            match message {
                                Some(Ok(job)) => runner.run(job).await,
                                Some(Err(error)) => {
                                    tracing::warn!(?error, "Failed to get job from stream: {error}");
                                    tokio::time::sleep(STREAM_ERROR_DELAY).await;
                                }
                                None => {
                                    tracing::warn!("Job stream for {} ended", E::NAME);
                                    break;
                                }
                            }
                        },
                        _ = cancellation_token.cancelled() => {
                            break;
                        }
                    }
                }
                tracing::debug!("Shutting down job runner for {}", E::NAME);
            }
        });

        self.handles.push(handle);
        self
    }

    /// Periodically remove finished jobs as described by the config.
    pub fn with_job_pruner(mut self, config: PrunerConfig) -> Self {
        let handle = PrunerRunner::new(self.backend.clone(), config)
            .spawn(self.cancellation_token.clone());
        self.handles.push(handle);
        self
    }

    /// Stop claiming new jobs and wait for the running ones to finish.
    pub async fn graceful_shutdown(self) -> Result<(), RuntimeError> {
        tracing::debug!("Shutting down worker runtime tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .try_for_each(|result| {
                result.map_err(|error| {
                    tracing::error!(?error, "Worker task failed during shutdown: {error}");
                    RuntimeError::GracefulShutdownFailed
                })
            })
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the backend")]
    BackendError(#[from] BackendError),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
}
