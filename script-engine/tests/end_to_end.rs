use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::NaiveDate;
use script_engine::{
    aggregation::{self, AggregationMethod},
    artifacts::{decode_result, ResultArtifactStore},
    backend::memory::InMemoryBackend,
    executors::{CustomizedComputationExecutor, DefaultComputationExecutor, ExecutorContext},
    job::JobId,
    model::{
        CustomizedComputationRequest, DefaultComputationRequest, Feature, FeatureCollection,
        IndicatorMetadata, ProcessParameter, SpatialUnitMetadata,
    },
    plugin::{IndicatorPlugin, PluginError},
    progress::InMemoryProgressStore,
    service::ScriptEngine,
    status::ExternalStatus,
    testing::{InMemoryDataManagement, StaticPluginLoader},
    WorkerRuntime,
};
use serde_json::{json, Map, Value};

/// Uses the `population` property as indicator value and sums it up onto the `district`.
struct PopulationPlugin;

#[async_trait]
impl IndicatorPlugin for PopulationPlugin {
    async fn compute_indicator(
        &self,
        target_date: NaiveDate,
        target_spatial_unit_features: &FeatureCollection,
        _base_indicators_by_id: &BTreeMap<String, FeatureCollection>,
        _georesources_by_id: &BTreeMap<String, FeatureCollection>,
        _process_parameters: &[ProcessParameter],
    ) -> Result<FeatureCollection, PluginError> {
        let mut computed = target_spatial_unit_features.clone();
        for feature in &mut computed.features {
            let population = feature
                .properties
                .get("population")
                .and_then(Value::as_f64);
            feature.set_date_value(target_date, population);
        }
        Ok(computed)
    }

    async fn aggregate_indicator(
        &self,
        target_date: NaiveDate,
        target_spatial_unit_features: &FeatureCollection,
        lower_level_features: FeatureCollection,
    ) -> Result<FeatureCollection, PluginError> {
        let aggregation = aggregation::aggregate(
            target_date,
            target_spatial_unit_features,
            lower_level_features,
            AggregationMethod::WeightedSum,
            |district, block| {
                block.properties.get("district").and_then(Value::as_str)
                    == district.feature_id().as_deref()
            },
        );
        Ok(aggregation.features)
    }

    async fn disaggregate_indicator(
        &self,
        _target_date: NaiveDate,
        _target_spatial_unit_features: &FeatureCollection,
        _higher_level_features: FeatureCollection,
    ) -> Result<FeatureCollection, PluginError> {
        Err(PluginError::Other("not supported".to_owned()))
    }
}

fn date(value: &str) -> NaiveDate {
    value.parse().unwrap()
}

fn feature(properties: Value) -> Feature {
    match properties {
        Value::Object(properties) => Feature::new(properties),
        _ => Feature::new(Map::new()),
    }
}

fn blocks(population: f64) -> FeatureCollection {
    FeatureCollection::new(vec![
        feature(json!({ "ID": "b1", "district": "d1", "population": population })),
        feature(json!({ "ID": "b2", "district": "d1", "population": 2.0 * population })),
        feature(json!({ "ID": "b3", "district": "d2", "population": 1 })),
    ])
}

fn districts() -> FeatureCollection {
    FeatureCollection::new(vec![
        feature(json!({ "ID": "d1" })),
        feature(json!({ "ID": "d2" })),
    ])
}

fn spatial_unit(id: &str, level: &str, lower: Option<&str>) -> SpatialUnitMetadata {
    SpatialUnitMetadata {
        spatial_unit_id: id.to_owned(),
        spatial_unit_level: level.to_owned(),
        next_lower_hierarchy_level: lower.map(ToOwned::to_owned),
        next_upper_hierarchy_level: None,
    }
}

/// Blocks (`U1`) below districts (`U2`), every unit has features for 2020 only.
fn data_management_2020() -> InMemoryDataManagement {
    InMemoryDataManagement::new()
        .with_indicator(IndicatorMetadata {
            indicator_id: "population".to_owned(),
            indicator_name: "Population".to_owned(),
            lowest_spatial_unit_for_computation: "Blocks".to_owned(),
        })
        .with_spatial_unit(spatial_unit("U1", "Blocks", None))
        .with_spatial_unit(spatial_unit("U2", "Districts", Some("Blocks")))
        .with_spatial_unit_features("U1", date("2020-01-01"), blocks(10.0))
        .with_spatial_unit_features("U2", date("2020-01-01"), districts())
}

fn data_management() -> InMemoryDataManagement {
    data_management_2020()
        .with_spatial_unit_features("U1", date("2021-01-01"), blocks(20.0))
        .with_spatial_unit_features("U2", date("2021-01-01"), districts())
}

struct Harness {
    engine: ScriptEngine<InMemoryBackend>,
    runtime: WorkerRuntime<InMemoryBackend>,
    data_management: Arc<InMemoryDataManagement>,
    _scratch: tempfile::TempDir,
}

impl Harness {
    fn new(data_management: InMemoryDataManagement) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let backend = InMemoryBackend::new();
        let data_management = Arc::new(data_management);
        let progress = Arc::new(InMemoryProgressStore::new());
        let artifacts = ResultArtifactStore::new(scratch.path().join("results"));
        let plugins = Arc::new(StaticPluginLoader::new(|| {
            Box::new(PopulationPlugin) as Box<dyn IndicatorPlugin>
        }));

        let context = ExecutorContext::new(
            data_management.clone(),
            plugins,
            progress.clone(),
            artifacts.clone(),
        );
        let runtime = WorkerRuntime::new(backend.clone())
            .with_executor(DefaultComputationExecutor::new(context.clone()))
            .with_executor(CustomizedComputationExecutor::new(context));
        let engine = ScriptEngine::new(backend, progress, artifacts).with_max_attempts(1);

        Self {
            engine,
            runtime,
            data_management,
            _scratch: scratch,
        }
    }

    async fn wait_for_default(&self, job_id: JobId) -> script_engine::status::DefaultJobStatus {
        for _ in 0..200 {
            let status = self.engine.get_default_indicator_computation(job_id).await;
            if matches!(status.status, Some(ExternalStatus::Succeeded | ExternalStatus::Failed)) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Default job {job_id} did not finish");
    }

    async fn wait_for_customized(
        &self,
        job_id: JobId,
    ) -> script_engine::status::CustomizedJobStatus {
        for _ in 0..200 {
            let status = self.engine.get_customizable_indicator_computation(job_id).await;
            if matches!(status.status, Some(ExternalStatus::Succeeded | ExternalStatus::Failed)) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Customized job {job_id} did not finish");
    }

    async fn shutdown(self) {
        self.runtime.graceful_shutdown().await.unwrap();
    }
}

fn default_request(dates: &[&str], aggregate: bool) -> DefaultComputationRequest {
    DefaultComputationRequest {
        script_id: "population-script".to_owned(),
        target_indicator_id: "population".to_owned(),
        target_dates: dates.iter().map(|day| date(day)).collect(),
        base_indicator_ids: Vec::new(),
        georesource_ids: Vec::new(),
        default_process_properties: Vec::new(),
        use_aggregation_for_higher_spatial_units: aggregate,
    }
}

#[tokio::test]
async fn customized_job_returns_encoded_plugin_result() {
    let harness = Harness::new(data_management());
    let job_id = harness
        .engine
        .post_customizable_indicator_computation(CustomizedComputationRequest {
            script_id: "population-script".to_owned(),
            target_date: date("2020-01-01"),
            base_indicator_ids: Vec::new(),
            georesource_ids: Vec::new(),
            target_spatial_unit_id: "U1".to_owned(),
            custom_process_properties: vec![ProcessParameter {
                name: "radius".to_owned(),
                value: json!(500),
            }],
        })
        .await
        .unwrap();

    let status = harness.wait_for_customized(job_id).await;

    assert_eq!(status.status, Some(ExternalStatus::Succeeded));
    assert_eq!(status.progress, Some(100));
    assert_eq!(status.error, None);
    let result = decode_result(&status.result_geojson_base64.unwrap()).unwrap();
    let mut expected = blocks(10.0);
    for feature in &mut expected.features {
        let population = feature.properties["population"].as_f64();
        feature.set_date_value(date("2020-01-01"), population);
    }
    assert_eq!(result, expected);

    let path = status.job_data.unwrap()["result"].as_str().unwrap().to_owned();
    assert!(path.ends_with(&format!("customized_{job_id}.b64")));
    harness.shutdown().await;
}

#[tokio::test]
async fn default_job_merges_dates_on_higher_unit() {
    let harness = Harness::new(data_management());
    let job_id = harness
        .engine
        .post_default_indicator_computation(default_request(&["2020-01-01", "2021-01-01"], true))
        .await
        .unwrap();

    let status = harness.wait_for_default(job_id).await;

    assert_eq!(status.status, Some(ExternalStatus::Succeeded));
    assert_eq!(status.progress, Some(100));
    assert_eq!(status.error, None);
    assert_eq!(
        status.result_urls.unwrap(),
        [
            "memory://indicators/population/U1",
            "memory://indicators/population/U2"
        ]
    );
    assert_eq!(status.failed_spatial_units, Some(Vec::new()));

    let persisted = harness.data_management.persisted().await;
    let districts = &persisted[1].features.features;
    assert_eq!(districts[0].date_value(date("2020-01-01")), Some(30.0));
    assert_eq!(districts[0].date_value(date("2021-01-01")), Some(60.0));
    assert_eq!(districts[1].date_value(date("2020-01-01")), Some(1.0));
    assert_eq!(districts[1].date_value(date("2021-01-01")), Some(1.0));

    let blocks = &persisted[0].features.features;
    assert_eq!(blocks[0].date_value(date("2020-01-01")), Some(10.0));
    assert_eq!(blocks[0].date_value(date("2021-01-01")), Some(20.0));
    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let harness = Harness::new(data_management());

    let status = harness
        .engine
        .get_default_indicator_computation(JobId::from(4711))
        .await;

    assert_eq!(status.status, None);
    assert_eq!(status.result_urls, None);
    assert!(status.error.unwrap().contains("was not found"));
    harness.shutdown().await;
}

#[tokio::test]
async fn failing_unit_does_not_fail_job() {
    let api = data_management_2020().with_spatial_unit_features("U1", date("2021-01-01"), blocks(20.0));
    let harness = Harness::new(api);
    let job_id = harness
        .engine
        .post_default_indicator_computation(default_request(&["2020-01-01", "2021-01-01"], false))
        .await
        .unwrap();

    let status = harness.wait_for_default(job_id).await;

    assert_eq!(status.status, Some(ExternalStatus::Succeeded));
    assert_eq!(status.error, None);
    let failures = status.failed_spatial_units.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].spatial_unit.spatial_unit_id, "U2");
    assert_eq!(failures[0].target_date, date("2021-01-01"));
    assert_eq!(status.result_urls.unwrap().len(), 2);

    let persisted = harness.data_management.persisted().await;
    let blocks = &persisted[0].features.features;
    assert_eq!(blocks[1].date_value(date("2020-01-01")), Some(20.0));
    assert_eq!(blocks[1].date_value(date("2021-01-01")), Some(40.0));
    harness.shutdown().await;
}

#[tokio::test]
async fn failed_job_reports_error_without_result() {
    let harness = Harness::new(data_management());
    let mut request = default_request(&["2020-01-01"], true);
    request.target_indicator_id = "unknown".to_owned();
    let job_id = harness
        .engine
        .post_default_indicator_computation(request)
        .await
        .unwrap();

    let status = harness.wait_for_default(job_id).await;

    assert_eq!(status.status, Some(ExternalStatus::Failed));
    assert!(status.error.unwrap().starts_with("metadata"));
    assert_eq!(status.result_urls, None);
    assert_eq!(status.failed_spatial_units, None);

    let overview = harness.engine.get_default_job_overview().await;
    assert_eq!(overview.len(), 1);
    assert_eq!(overview[0].status, Some(ExternalStatus::Failed));
    assert!(overview[0].job_data.as_ref().unwrap().get("error").is_none());
    harness.shutdown().await;
}
