//! Helpers for testing.
//!
//! [`InMemoryDataManagement`] stands in for the data management API and [`StaticPluginLoader`]
//! hands out in process plugins, so executors can be run end to end without external services.
use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use tokio::sync::Mutex;

use crate::{
    data_management::{ApiError, DataManagementApi},
    job::JobId,
    model::{FeatureCollection, IndicatorMetadata, JobKind, SpatialUnitMetadata},
    plugin::{IndicatorPlugin, LoadedPlugin, PluginError, PluginLoader},
};

/// A write recorded by [`InMemoryDataManagement`].
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedIndicator {
    pub indicator_id: String,
    pub spatial_unit_id: String,
    pub features: FeatureCollection,
}

/// A [`DataManagementApi`] serving fixed data. Anything not configured is not found.
#[derive(Debug, Default)]
pub struct InMemoryDataManagement {
    scripts: HashMap<String, String>,
    indicators: HashMap<String, IndicatorMetadata>,
    spatial_units: Vec<SpatialUnitMetadata>,
    spatial_unit_features: HashMap<(String, NaiveDate), FeatureCollection>,
    georesources: HashMap<(String, NaiveDate), FeatureCollection>,
    indicator_features: HashMap<(String, String, NaiveDate), FeatureCollection>,
    rejected_writes: HashSet<String>,
    persisted: Mutex<Vec<PersistedIndicator>>,
}

impl InMemoryDataManagement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, script_id: &str, code: &str) -> Self {
        self.scripts.insert(script_id.to_owned(), code.to_owned());
        self
    }

    pub fn with_indicator(mut self, indicator: IndicatorMetadata) -> Self {
        self.indicators
            .insert(indicator.indicator_id.clone(), indicator);
        self
    }

    pub fn with_spatial_unit(mut self, spatial_unit: SpatialUnitMetadata) -> Self {
        self.spatial_units.push(spatial_unit);
        self
    }

    pub fn with_spatial_unit_features(
        mut self,
        spatial_unit_id: &str,
        date: NaiveDate,
        features: FeatureCollection,
    ) -> Self {
        self.spatial_unit_features
            .insert((spatial_unit_id.to_owned(), date), features);
        self
    }

    pub fn with_georesource(
        mut self,
        georesource_id: &str,
        date: NaiveDate,
        features: FeatureCollection,
    ) -> Self {
        self.georesources
            .insert((georesource_id.to_owned(), date), features);
        self
    }

    pub fn with_indicator_features(
        mut self,
        indicator_id: &str,
        spatial_unit_id: &str,
        date: NaiveDate,
        features: FeatureCollection,
    ) -> Self {
        self.indicator_features.insert(
            (indicator_id.to_owned(), spatial_unit_id.to_owned(), date),
            features,
        );
        self
    }

    /// Reject writes of indicator features for the given spatial unit.
    pub fn rejecting_writes_for(mut self, spatial_unit_id: &str) -> Self {
        self.rejected_writes.insert(spatial_unit_id.to_owned());
        self
    }

    /// All successful writes, in order.
    pub async fn persisted(&self) -> Vec<PersistedIndicator> {
        self.persisted.lock().await.clone()
    }

    fn find<K: Hash + Eq>(
        map: &HashMap<K, FeatureCollection>,
        key: &K,
        description: String,
    ) -> Result<FeatureCollection, ApiError> {
        map.get(key).cloned().ok_or(ApiError::NotFound(description))
    }
}

#[async_trait]
impl DataManagementApi for InMemoryDataManagement {
    async fn fetch_script_code(&self, script_id: &str) -> Result<String, ApiError> {
        self.scripts
            .get(script_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("process-scripts/{script_id}")))
    }

    async fn fetch_indicator_metadata(
        &self,
        indicator_id: &str,
    ) -> Result<IndicatorMetadata, ApiError> {
        self.indicators
            .get(indicator_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("indicators/{indicator_id}")))
    }

    async fn fetch_spatial_units_metadata(&self) -> Result<Vec<SpatialUnitMetadata>, ApiError> {
        Ok(self.spatial_units.clone())
    }

    async fn fetch_spatial_unit_features(
        &self,
        spatial_unit_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError> {
        Self::find(
            &self.spatial_unit_features,
            &(spatial_unit_id.to_owned(), date),
            format!("spatial-units/{spatial_unit_id}/{date}"),
        )
    }

    async fn fetch_georesource_features(
        &self,
        georesource_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError> {
        Self::find(
            &self.georesources,
            &(georesource_id.to_owned(), date),
            format!("georesources/{georesource_id}/{date}"),
        )
    }

    async fn fetch_indicator_features(
        &self,
        indicator_id: &str,
        spatial_unit_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError> {
        Self::find(
            &self.indicator_features,
            &(indicator_id.to_owned(), spatial_unit_id.to_owned(), date),
            format!("indicators/{indicator_id}/{spatial_unit_id}/{date}"),
        )
    }

    async fn put_indicator_features(
        &self,
        indicator_id: &str,
        spatial_unit: &SpatialUnitMetadata,
        features: &FeatureCollection,
    ) -> Result<String, ApiError> {
        let url = format!(
            "memory://indicators/{indicator_id}/{}",
            spatial_unit.spatial_unit_id
        );
        if self.rejected_writes.contains(&spatial_unit.spatial_unit_id) {
            return Err(ApiError::Remote {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                url,
                body: "write rejected".to_owned(),
            });
        }
        self.persisted.lock().await.push(PersistedIndicator {
            indicator_id: indicator_id.to_owned(),
            spatial_unit_id: spatial_unit.spatial_unit_id.clone(),
            features: features.clone(),
        });
        Ok(url)
    }
}

/// A [`PluginLoader`] creating in process plugins, nothing is materialised.
pub struct StaticPluginLoader<F> {
    factory: F,
    loads: AtomicUsize,
}

impl<F> StaticPluginLoader<F>
where
    F: Fn() -> Box<dyn IndicatorPlugin> + Send + Sync,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            loads: AtomicUsize::new(0),
        }
    }

    /// The number of plugins loaded so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> PluginLoader for StaticPluginLoader<F>
where
    F: Fn() -> Box<dyn IndicatorPlugin> + Send + Sync,
{
    async fn load(
        &self,
        script_id: &str,
        kind: JobKind,
        job_id: JobId,
    ) -> Result<LoadedPlugin, PluginError> {
        tracing::debug!(script_id, %kind, %job_id, "Loading static plugin");
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedPlugin::new((self.factory)(), None))
    }
}
