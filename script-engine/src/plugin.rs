//! The indicator plugin contract and the loading of plugins for a single job.
//!
//! A plugin is loaded once per job through a [`PluginLoader`] and must be released with
//! [`LoadedPlugin::unload`] when the job is done. Anything materialised for the plugin is also
//! removed when the [`LoadedPlugin`] is dropped, so a panicking job does not leak files.
use std::{
    collections::BTreeMap,
    ops::Deref,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::{
    data_management::ApiError,
    job::JobId,
    model::{FeatureCollection, JobKind, ProcessParameter},
};

pub mod process;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Failed to fetch plugin script: {0}")]
    Fetch(#[from] ApiError),
    #[error("Failed to materialise plugin: {0}")]
    Io(#[from] std::io::Error),
    #[error("Plugin did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Plugin exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
    #[error("Plugin returned an invalid feature collection: {0}")]
    InvalidOutput(#[from] serde_json::Error),
    #[error("Plugin failed: {0}")]
    Other(String),
}

/// The three operations every indicator plugin provides.
#[async_trait]
pub trait IndicatorPlugin: Send + Sync {
    /// Compute the indicator for every feature of the target spatial unit.
    async fn compute_indicator(
        &self,
        target_date: NaiveDate,
        target_spatial_unit_features: &FeatureCollection,
        base_indicators_by_id: &BTreeMap<String, FeatureCollection>,
        georesources_by_id: &BTreeMap<String, FeatureCollection>,
        process_parameters: &[ProcessParameter],
    ) -> Result<FeatureCollection, PluginError>;

    /// Aggregate the indicator values of a lower spatial unit onto the target spatial unit.
    ///
    /// The lower level features are owned by the call and may be consumed.
    async fn aggregate_indicator(
        &self,
        target_date: NaiveDate,
        target_spatial_unit_features: &FeatureCollection,
        lower_level_features: FeatureCollection,
    ) -> Result<FeatureCollection, PluginError>;

    /// Distribute the indicator values of a higher spatial unit onto the target spatial unit.
    async fn disaggregate_indicator(
        &self,
        target_date: NaiveDate,
        target_spatial_unit_features: &FeatureCollection,
        higher_level_features: FeatureCollection,
    ) -> Result<FeatureCollection, PluginError>;
}

#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Fetch the script and make it available as a plugin for one job.
    async fn load(
        &self,
        script_id: &str,
        kind: JobKind,
        job_id: JobId,
    ) -> Result<LoadedPlugin, PluginError>;
}

/// A file created for a loaded plugin, removed when dropped.
#[derive(Debug)]
pub struct PluginArtifact {
    path: PathBuf,
    removed: bool,
}

impl PluginArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        self.removed = true;
        let _ = tokio::fs::remove_file(&self.path).await.inspect_err(|error| {
            tracing::warn!(?error, path = %self.path.display(), "Failed to remove plugin file")
        });
    }
}

impl Drop for PluginArtifact {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A plugin loaded for a single job.
pub struct LoadedPlugin {
    plugin: Box<dyn IndicatorPlugin>,
    artifact: Option<PluginArtifact>,
}

impl LoadedPlugin {
    pub fn new(plugin: Box<dyn IndicatorPlugin>, artifact: Option<PluginArtifact>) -> Self {
        Self { plugin, artifact }
    }

    pub fn artifact(&self) -> Option<&PluginArtifact> {
        self.artifact.as_ref()
    }

    /// Release the plugin and remove everything materialised for it.
    pub async fn unload(self) {
        if let Some(artifact) = self.artifact {
            artifact.remove().await;
        }
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("artifact", &self.artifact)
            .finish_non_exhaustive()
    }
}

impl Deref for LoadedPlugin {
    type Target = dyn IndicatorPlugin;

    fn deref(&self) -> &Self::Target {
        self.plugin.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unload_removes_artifact() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("plugin.js");
        std::fs::write(&path, "code").unwrap();

        let plugin = LoadedPlugin::new(
            Box::new(process::ProcessPlugin::new("sh", Vec::new(), &path, Duration::from_secs(1))),
            Some(PluginArtifact::new(&path)),
        );
        assert_eq!(plugin.artifact().map(PluginArtifact::path), Some(path.as_path()));
        assert!(format!("{plugin:?}").contains("plugin.js"));
        plugin.unload().await;

        assert!(!path.exists());
    }

    #[test]
    fn dropping_removes_artifact() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("plugin.js");
        std::fs::write(&path, "code").unwrap();

        drop(PluginArtifact::new(&path));

        assert!(!path.exists());
    }
}
