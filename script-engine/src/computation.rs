//! Computation of an indicator over the spatial unit hierarchy.
//!
//! The indicator is computed at the lowest spatial unit configured for it and then propagated to
//! every higher unit, either by aggregating the lowest result or by computing each unit on its
//! own. Results are merged per unit across all requested dates and persisted once per unit.
//!
//! Failures to fetch, compute or aggregate a single unit for a date are recorded as
//! [`FailedUnitRecord`]s and do not stop the computation. Fetching the metadata, building the
//! hierarchy and persisting the results are structural: failing any of them fails the job.
use std::{collections::BTreeMap, fmt::Display};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::{
    artifacts::ArtifactError,
    data_management::{ApiError, DataManagementApi},
    executor::ExecutionError,
    model::{DefaultComputationRequest, FailedUnitRecord, FeatureCollection, SpatialUnitMetadata},
    plugin::{IndicatorPlugin, PluginError},
    progress::ProgressReporter,
};

/// Reason recorded for the higher units of a date whose lowest unit could not be computed.
pub const LOWER_LEVEL_UNAVAILABLE: &str = "lower level result unavailable";

/// The result stored on a completed default computation job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DefaultComputationResult {
    pub result_urls: Vec<String>,
    pub failed_spatial_units: Vec<FailedUnitRecord>,
}

#[derive(Debug, Error)]
pub enum ComputationError {
    #[error("Failed to fetch indicator metadata: {0}")]
    IndicatorMetadata(#[source] ApiError),
    #[error("Failed to fetch spatial unit metadata: {0}")]
    SpatialUnits(#[source] ApiError),
    #[error("No spatial unit has the level {0}")]
    UnknownLowestLevel(String),
    #[error("Spatial unit hierarchy contains a cycle at level {0}")]
    HierarchyCycle(String),
    #[error("Failed to persist indicator for spatial unit {spatial_unit}: {source}")]
    Persist {
        spatial_unit: String,
        source: ApiError,
    },
    #[error("Failed to fetch computation input: {0}")]
    Fetch(#[from] ApiError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl ExecutionError for ComputationError {
    fn error_type(&self) -> &'static str {
        match self {
            Self::IndicatorMetadata(_) | Self::SpatialUnits(_) => "metadata",
            Self::UnknownLowestLevel(_) | Self::HierarchyCycle(_) => "hierarchy",
            Self::Persist { .. } => "persistence",
            Self::Fetch(_) => "fetch",
            Self::Plugin(_) => "plugin",
            Self::Artifact(_) => "artifact",
        }
    }
}

/// The spatial units the indicator is computed for, lowest level first.
///
/// Starts at the unit of `lowest_level` and follows the hierarchy upwards through the unit
/// naming the current level as its next lower level.
pub fn build_hierarchy(
    spatial_units: &[SpatialUnitMetadata],
    lowest_level: &str,
) -> Result<Vec<SpatialUnitMetadata>, ComputationError> {
    let mut current = spatial_units
        .iter()
        .find(|unit| unit.spatial_unit_level == lowest_level)
        .ok_or_else(|| ComputationError::UnknownLowestLevel(lowest_level.to_owned()))?;
    let mut hierarchy = vec![current.clone()];

    while let Some(upper) = spatial_units.iter().find(|unit| {
        unit.next_lower_hierarchy_level.as_deref() == Some(current.spatial_unit_level.as_str())
    }) {
        if hierarchy
            .iter()
            .any(|unit| unit.spatial_unit_level == upper.spatial_unit_level)
        {
            return Err(ComputationError::HierarchyCycle(
                upper.spatial_unit_level.clone(),
            ));
        }
        hierarchy.push(upper.clone());
        current = upper;
    }
    Ok(hierarchy)
}

#[derive(Debug, Clone)]
struct UnitFailure {
    reason: String,
    error: String,
}

impl UnitFailure {
    fn new(reason: impl Into<String>, error: impl Display) -> Self {
        Self {
            reason: reason.into(),
            error: error.to_string(),
        }
    }

    fn into_record(self, spatial_unit: &SpatialUnitMetadata, date: NaiveDate) -> FailedUnitRecord {
        FailedUnitRecord {
            spatial_unit: spatial_unit.clone(),
            target_date: date,
            reason: self.reason,
            error: self.error,
        }
    }
}

type UnitResult = Result<FeatureCollection, UnitFailure>;

/// Drives a loaded plugin through the spatial unit hierarchy for a default computation.
pub struct HierarchicalComputation<'a> {
    api: &'a dyn DataManagementApi,
    plugin: &'a dyn IndicatorPlugin,
    progress: &'a ProgressReporter,
}

impl<'a> HierarchicalComputation<'a> {
    pub fn new(
        api: &'a dyn DataManagementApi,
        plugin: &'a dyn IndicatorPlugin,
        progress: &'a ProgressReporter,
    ) -> Self {
        Self {
            api,
            plugin,
            progress,
        }
    }

    #[instrument(skip_all, fields(indicator_id = %request.target_indicator_id))]
    pub async fn run(
        &self,
        request: &DefaultComputationRequest,
    ) -> Result<DefaultComputationResult, ComputationError> {
        let indicator = self
            .api
            .fetch_indicator_metadata(&request.target_indicator_id)
            .await
            .map_err(ComputationError::IndicatorMetadata)?;
        self.progress.report(20).await;

        let spatial_units = self
            .api
            .fetch_spatial_units_metadata()
            .await
            .map_err(ComputationError::SpatialUnits)?;
        self.progress.report(40).await;

        let hierarchy =
            build_hierarchy(&spatial_units, &indicator.lowest_spatial_unit_for_computation)?;
        tracing::debug!(
            levels = ?hierarchy.iter().map(|unit| &unit.spatial_unit_level).collect::<Vec<_>>(),
            aggregate = request.use_aggregation_for_higher_spatial_units,
            "Computing indicator over spatial unit hierarchy"
        );

        let mut results: Vec<Option<FeatureCollection>> = vec![None; hierarchy.len()];
        let mut failed_spatial_units = Vec::new();
        let total = request.target_dates.len();

        for (index, &date) in request.target_dates.iter().enumerate() {
            let computed = match self.fetch_georesources(&request.georesource_ids, date).await {
                Ok(georesources) if request.use_aggregation_for_higher_spatial_units => {
                    self.compute_then_aggregate(date, &hierarchy, &georesources, request)
                        .await
                }
                Ok(georesources) => {
                    self.compute_per_unit(date, &hierarchy, &georesources, request)
                        .await
                }
                Err(failure) => vec![Err(failure); hierarchy.len()],
            };

            for ((unit, result), computed) in hierarchy.iter().zip(&mut results).zip(computed) {
                match computed {
                    Ok(features) => match result {
                        Some(existing) => existing.append_indicator_values_for_date(date, &features),
                        None => *result = Some(features),
                    },
                    Err(failure) => {
                        tracing::warn!(
                            spatial_unit = %unit.spatial_unit_id,
                            %date,
                            reason = %failure.reason,
                            error = %failure.error,
                            "Failed to compute indicator for spatial unit"
                        );
                        failed_spatial_units.push(failure.into_record(unit, date));
                    }
                }
            }
            self.progress.report(date_progress(index + 1, total)).await;
        }
        self.progress.report(80).await;

        let mut result_urls = Vec::new();
        for (unit, features) in hierarchy.iter().zip(results) {
            let Some(features) = features else {
                continue;
            };
            let url = self
                .api
                .put_indicator_features(&request.target_indicator_id, unit, &features)
                .await
                .map_err(|source| ComputationError::Persist {
                    spatial_unit: unit.spatial_unit_id.clone(),
                    source,
                })?;
            tracing::debug!(spatial_unit = %unit.spatial_unit_id, %url, "Persisted indicator");
            result_urls.push(url);
        }
        self.progress.report(90).await;

        Ok(DefaultComputationResult {
            result_urls,
            failed_spatial_units,
        })
    }

    async fn compute_then_aggregate(
        &self,
        date: NaiveDate,
        hierarchy: &[SpatialUnitMetadata],
        georesources: &BTreeMap<String, FeatureCollection>,
        request: &DefaultComputationRequest,
    ) -> Vec<UnitResult> {
        let Some((lowest, higher)) = hierarchy.split_first() else {
            return Vec::new();
        };
        let lowest_result = match self.compute_unit(date, lowest, georesources, request).await {
            Ok(features) => features,
            Err(failure) => {
                let unavailable = UnitFailure::new(LOWER_LEVEL_UNAVAILABLE, &failure.error);
                return std::iter::once(Err(failure))
                    .chain(higher.iter().map(|_| Err(unavailable.clone())))
                    .collect();
            }
        };

        let mut higher_results = Vec::with_capacity(higher.len());
        for unit in higher {
            higher_results.push(self.aggregate_unit(date, unit, &lowest_result).await);
        }
        std::iter::once(Ok(lowest_result))
            .chain(higher_results)
            .collect()
    }

    async fn compute_per_unit(
        &self,
        date: NaiveDate,
        hierarchy: &[SpatialUnitMetadata],
        georesources: &BTreeMap<String, FeatureCollection>,
        request: &DefaultComputationRequest,
    ) -> Vec<UnitResult> {
        let mut computed = Vec::with_capacity(hierarchy.len());
        for unit in hierarchy {
            computed.push(self.compute_unit(date, unit, georesources, request).await);
        }
        computed
    }

    async fn compute_unit(
        &self,
        date: NaiveDate,
        unit: &SpatialUnitMetadata,
        georesources: &BTreeMap<String, FeatureCollection>,
        request: &DefaultComputationRequest,
    ) -> UnitResult {
        let features = self.fetch_spatial_unit_features(date, unit).await?;
        let base_indicators = self
            .fetch_base_indicators(&request.base_indicator_ids, unit, date)
            .await?;
        let mut computed = self
            .plugin
            .compute_indicator(
                date,
                &features,
                &base_indicators,
                georesources,
                &request.default_process_properties,
            )
            .await
            .map_err(|error| UnitFailure::new("failed to compute indicator", error))?;
        computed.normalise_date(date);
        Ok(computed)
    }

    async fn aggregate_unit(
        &self,
        date: NaiveDate,
        unit: &SpatialUnitMetadata,
        lowest_result: &FeatureCollection,
    ) -> UnitResult {
        let features = self.fetch_spatial_unit_features(date, unit).await?;
        let mut aggregated = self
            .plugin
            .aggregate_indicator(date, &features, lowest_result.clone())
            .await
            .map_err(|error| UnitFailure::new("failed to aggregate indicator", error))?;
        aggregated.normalise_date(date);
        Ok(aggregated)
    }

    async fn fetch_spatial_unit_features(
        &self,
        date: NaiveDate,
        unit: &SpatialUnitMetadata,
    ) -> UnitResult {
        self.api
            .fetch_spatial_unit_features(&unit.spatial_unit_id, date)
            .await
            .map_err(|error| UnitFailure::new("failed to fetch spatial unit features", error))
    }

    async fn fetch_base_indicators(
        &self,
        indicator_ids: &[String],
        unit: &SpatialUnitMetadata,
        date: NaiveDate,
    ) -> Result<BTreeMap<String, FeatureCollection>, UnitFailure> {
        let mut base_indicators = BTreeMap::new();
        for indicator_id in indicator_ids {
            let features = self
                .api
                .fetch_indicator_features(indicator_id, &unit.spatial_unit_id, date)
                .await
                .map_err(|error| {
                    UnitFailure::new(format!("failed to fetch base indicator {indicator_id}"), error)
                })?;
            base_indicators.insert(indicator_id.clone(), features);
        }
        Ok(base_indicators)
    }

    async fn fetch_georesources(
        &self,
        georesource_ids: &[String],
        date: NaiveDate,
    ) -> Result<BTreeMap<String, FeatureCollection>, UnitFailure> {
        let mut georesources = BTreeMap::new();
        for georesource_id in georesource_ids {
            let features = self
                .api
                .fetch_georesource_features(georesource_id, date)
                .await
                .map_err(|error| {
                    UnitFailure::new(format!("failed to fetch georesource {georesource_id}"), error)
                })?;
            georesources.insert(georesource_id.clone(), features);
        }
        Ok(georesources)
    }
}

/// Progress after `done` of `total` dates, between 40 and 70.
fn date_progress(done: usize, total: usize) -> u8 {
    let progress = 40 + 30 * done / total.max(1);
    progress.min(70) as u8
}
