//! Plugins executed as child processes.
//!
//! Each call spawns the configured interpreter with the plugin file as its last argument. The
//! request is written to stdin as JSON tagged with an `operation` field and the resulting
//! feature collection is read from stdout. The child runs with a cleared environment (only
//! `PATH` is kept) and is killed when it exceeds the timeout.
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    data_management::DataManagementApi,
    job::JobId,
    model::{FeatureCollection, JobKind, ProcessParameter},
};

use super::{IndicatorPlugin, LoadedPlugin, PluginArtifact, PluginError, PluginLoader};

#[derive(Serialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
enum PluginRequest<'a> {
    #[serde(rename_all = "camelCase")]
    ComputeIndicator {
        target_date: NaiveDate,
        target_spatial_unit_features: &'a FeatureCollection,
        base_indicators_by_id: &'a BTreeMap<String, FeatureCollection>,
        georesources_by_id: &'a BTreeMap<String, FeatureCollection>,
        process_parameters: &'a [ProcessParameter],
    },
    #[serde(rename_all = "camelCase")]
    AggregateIndicator {
        target_date: NaiveDate,
        target_spatial_unit_features: &'a FeatureCollection,
        lower_level_indicator_features: &'a FeatureCollection,
    },
    #[serde(rename_all = "camelCase")]
    DisaggregateIndicator {
        target_date: NaiveDate,
        target_spatial_unit_features: &'a FeatureCollection,
        higher_level_indicator_features: &'a FeatureCollection,
    },
}

/// A plugin file run by an interpreter.
#[derive(Debug, Clone)]
pub struct ProcessPlugin {
    program: String,
    args: Vec<String>,
    path: PathBuf,
    timeout: Duration,
}

impl ProcessPlugin {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            path: path.into(),
            timeout,
        }
    }

    async fn call(&self, request: &PluginRequest<'_>) -> Result<FeatureCollection, PluginError> {
        let input = serde_json::to_vec(request)?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&self.path)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
            }
            Ok::<_, std::io::Error>(())
        };

        // dropping the exchange on timeout kills the child
        let (written, output) = tokio::time::timeout(self.timeout, async {
            tokio::join!(write, child.wait_with_output())
        })
        .await
        .map_err(|_| PluginError::Timeout(self.timeout))?;
        match written {
            Err(error) if error.kind() != ErrorKind::BrokenPipe => return Err(error.into()),
            _ => {}
        }
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(PluginError::Failed {
                status: output.status,
                stderr,
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl IndicatorPlugin for ProcessPlugin {
    async fn compute_indicator(
        &self,
        target_date: NaiveDate,
        target_spatial_unit_features: &FeatureCollection,
        base_indicators_by_id: &BTreeMap<String, FeatureCollection>,
        georesources_by_id: &BTreeMap<String, FeatureCollection>,
        process_parameters: &[ProcessParameter],
    ) -> Result<FeatureCollection, PluginError> {
        self.call(&PluginRequest::ComputeIndicator {
            target_date,
            target_spatial_unit_features,
            base_indicators_by_id,
            georesources_by_id,
            process_parameters,
        })
        .await
    }

    async fn aggregate_indicator(
        &self,
        target_date: NaiveDate,
        target_spatial_unit_features: &FeatureCollection,
        lower_level_features: FeatureCollection,
    ) -> Result<FeatureCollection, PluginError> {
        self.call(&PluginRequest::AggregateIndicator {
            target_date,
            target_spatial_unit_features,
            lower_level_indicator_features: &lower_level_features,
        })
        .await
    }

    async fn disaggregate_indicator(
        &self,
        target_date: NaiveDate,
        target_spatial_unit_features: &FeatureCollection,
        higher_level_features: FeatureCollection,
    ) -> Result<FeatureCollection, PluginError> {
        self.call(&PluginRequest::DisaggregateIndicator {
            target_date,
            target_spatial_unit_features,
            higher_level_indicator_features: &higher_level_features,
        })
        .await
    }
}

/// Loads plugins by writing the script to a uniquely named file and running it as a
/// [`ProcessPlugin`].
#[derive(Clone)]
pub struct ProcessPluginLoader {
    api: Arc<dyn DataManagementApi>,
    directory: PathBuf,
    program: String,
    args: Vec<String>,
    extension: String,
    timeout: Duration,
}

impl ProcessPluginLoader {
    /// `interpreter` is the program followed by its arguments, e.g. `["node"]`.
    pub fn new(
        api: Arc<dyn DataManagementApi>,
        directory: impl Into<PathBuf>,
        interpreter: &[String],
        extension: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let (program, args) = match interpreter.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => ("node".to_owned(), Vec::new()),
        };
        Self {
            api,
            directory: directory.into(),
            program,
            args,
            extension: extension.into(),
            timeout,
        }
    }

    fn file_name(&self, kind: JobKind, job_id: JobId) -> String {
        format!(
            "{kind}_{job_id}_{:016x}.{}",
            rand::random::<u64>(),
            self.extension
        )
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[async_trait]
impl PluginLoader for ProcessPluginLoader {
    async fn load(
        &self,
        script_id: &str,
        kind: JobKind,
        job_id: JobId,
    ) -> Result<LoadedPlugin, PluginError> {
        let code = self.api.fetch_script_code(script_id).await?;
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.directory.join(self.file_name(kind, job_id));
        tokio::fs::write(&path, code).await?;
        tracing::debug!(%job_id, %kind, script_id, path = %path.display(), "Loaded plugin");

        let plugin = ProcessPlugin::new(self.program.clone(), self.args.clone(), &path, self.timeout);
        Ok(LoadedPlugin::new(
            Box::new(plugin),
            Some(PluginArtifact::new(path)),
        ))
    }
}
