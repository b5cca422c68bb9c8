//! The executors processing the default and customized computation queues.
//!
//! Both load the plugin named by the job, run it and always unload it again before reporting
//! the outcome, so no plugin file outlives its job.
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::{
    artifacts::ResultArtifactStore,
    computation::{ComputationError, DefaultComputationResult, HierarchicalComputation},
    data_management::DataManagementApi,
    executor::{ExecutionResult, Executor},
    job::Job,
    model::{CustomizedComputationRequest, DefaultComputationRequest, FeatureCollection, JobKind},
    plugin::{IndicatorPlugin, PluginLoader},
    progress::{ProgressReporter, ProgressStore},
};

/// The services shared by the computation executors.
#[derive(Clone)]
pub struct ExecutorContext {
    pub data_management: Arc<dyn DataManagementApi>,
    pub plugins: Arc<dyn PluginLoader>,
    pub progress: Arc<dyn ProgressStore>,
    pub artifacts: ResultArtifactStore,
}

impl ExecutorContext {
    pub fn new(
        data_management: Arc<dyn DataManagementApi>,
        plugins: Arc<dyn PluginLoader>,
        progress: Arc<dyn ProgressStore>,
        artifacts: ResultArtifactStore,
    ) -> Self {
        Self {
            data_management,
            plugins,
            progress,
            artifacts,
        }
    }

    fn reporter<D>(&self, job: &Job<D>, kind: JobKind) -> ProgressReporter {
        ProgressReporter::new(self.progress.clone(), job.id, kind)
    }
}

/// Computes an indicator over the whole spatial unit hierarchy and persists it per unit.
pub struct DefaultComputationExecutor {
    context: ExecutorContext,
}

impl DefaultComputationExecutor {
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }

    async fn compute(
        &self,
        job: &Job<DefaultComputationRequest>,
    ) -> Result<DefaultComputationResult, ComputationError> {
        let progress = self.context.reporter(job, JobKind::Default);
        let plugin = self
            .context
            .plugins
            .load(&job.data.script_id, JobKind::Default, job.id)
            .await?;
        progress.report(5).await;

        let result = HierarchicalComputation::new(
            self.context.data_management.as_ref(),
            &*plugin,
            &progress,
        )
        .run(&job.data)
        .await;
        plugin.unload().await;

        let result = result?;
        progress.report(100).await;
        Ok(result)
    }
}

#[async_trait]
impl Executor for DefaultComputationExecutor {
    type Data = DefaultComputationRequest;
    type Output = DefaultComputationResult;
    const NAME: &'static str = "default_computation";

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
        self.compute(&job).await.into()
    }
}

/// Computes an indicator for a single spatial unit and date.
///
/// The result is not persisted in the data management API but written as a base64 encoded
/// artifact, the job keeps the path of the artifact.
pub struct CustomizedComputationExecutor {
    context: ExecutorContext,
}

impl CustomizedComputationExecutor {
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }

    async fn compute(
        &self,
        job: &Job<CustomizedComputationRequest>,
    ) -> Result<PathBuf, ComputationError> {
        let progress = self.context.reporter(job, JobKind::Customized);
        progress.report(5).await;

        let plugin = self
            .context
            .plugins
            .load(&job.data.script_id, JobKind::Customized, job.id)
            .await?;
        progress.report(20).await;

        let result = self.run_plugin(&job.data, &*plugin, &progress).await;
        plugin.unload().await;

        let path = self.context.artifacts.write(job.id, &result?).await?;
        progress.report(90).await;
        progress.report(100).await;
        Ok(path)
    }

    async fn run_plugin(
        &self,
        request: &CustomizedComputationRequest,
        plugin: &dyn IndicatorPlugin,
        progress: &ProgressReporter,
    ) -> Result<FeatureCollection, ComputationError> {
        let api = self.context.data_management.as_ref();
        let date = request.target_date;
        let unit = request.target_spatial_unit_id.as_str();

        let mut georesources = BTreeMap::new();
        for georesource_id in &request.georesource_ids {
            let features = api.fetch_georesource_features(georesource_id, date).await?;
            georesources.insert(georesource_id.clone(), features);
        }
        let features = api.fetch_spatial_unit_features(unit, date).await?;
        let mut base_indicators = BTreeMap::new();
        for indicator_id in &request.base_indicator_ids {
            let indicator = api.fetch_indicator_features(indicator_id, unit, date).await?;
            base_indicators.insert(indicator_id.clone(), indicator);
        }
        progress.report(40).await;

        let mut computed = plugin
            .compute_indicator(
                date,
                &features,
                &base_indicators,
                &georesources,
                &request.custom_process_properties,
            )
            .await?;
        computed.normalise_date(date);
        progress.report(70).await;
        Ok(computed)
    }
}

#[async_trait]
impl Executor for CustomizedComputationExecutor {
    type Data = CustomizedComputationRequest;
    type Output = PathBuf;
    const NAME: &'static str = "customized_computation";

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output> {
        self.compute(&job).await.into()
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use base64::{engine::general_purpose::STANDARD, Engine};
    use chrono::Utc;
    use serde_json::json;

    use crate::{
        computation::test::PopulationPlugin,
        executor::ExecutionError,
        job::{JobId, JobStatus},
        model::{
            test::{date, feature},
            IndicatorMetadata,
        },
        plugin::{LoadedPlugin, PluginArtifact, PluginError},
        progress::InMemoryProgressStore,
        testing::{InMemoryDataManagement, StaticPluginLoader},
    };

    use super::*;

    fn job<D>(id: i32, data: D) -> Job<D> {
        Job {
            id: JobId::from(id),
            status: JobStatus::Executing,
            executor: "test".to_owned(),
            data,
            attempt: 1,
            max_attempts: 3,
            errors: Vec::new(),
            inserted_at: Utc::now(),
            scheduled_at: Utc::now(),
            attempted_at: Some(Utc::now()),
            completed_at: None,
            discarded_at: None,
        }
    }

    fn done<T>(result: ExecutionResult<T>) -> T {
        match result {
            ExecutionResult::Done { result } => result,
            ExecutionResult::Error { error } => panic!("Job failed: {error}"),
        }
    }

    fn failed<T>(result: ExecutionResult<T>) -> Box<dyn ExecutionError> {
        match result {
            ExecutionResult::Done { .. } => panic!("Job unexpectedly succeeded"),
            ExecutionResult::Error { error } => error,
        }
    }

    /// Loads the population plugin backed by a file, like a materialised script.
    struct FileBackedLoader {
        path: PathBuf,
    }

    #[async_trait]
    impl PluginLoader for FileBackedLoader {
        async fn load(&self, _: &str, _: JobKind, _: JobId) -> Result<LoadedPlugin, PluginError> {
            tokio::fs::write(&self.path, "code").await?;
            Ok(LoadedPlugin::new(
                Box::new(PopulationPlugin),
                Some(PluginArtifact::new(&self.path)),
            ))
        }
    }

    fn data_management() -> InMemoryDataManagement {
        let day = date("2020-01-01");
        InMemoryDataManagement::new()
            .with_indicator(IndicatorMetadata {
                indicator_id: "population".to_owned(),
                indicator_name: String::new(),
                lowest_spatial_unit_for_computation: "Blocks".to_owned(),
            })
            .with_spatial_unit(crate::computation::test::unit("U1", "Blocks", None, None))
            .with_spatial_unit_features(
                "U1",
                day,
                FeatureCollection::new(vec![feature("f1", json!({ "population": 3 }))]),
            )
    }

    fn customized_request() -> CustomizedComputationRequest {
        CustomizedComputationRequest {
            script_id: "script".to_owned(),
            target_date: date("2020-01-01"),
            base_indicator_ids: Vec::new(),
            georesource_ids: Vec::new(),
            target_spatial_unit_id: "U1".to_owned(),
            custom_process_properties: Vec::new(),
        }
    }

    fn context(
        directory: &Path,
        plugins: Arc<dyn PluginLoader>,
    ) -> (ExecutorContext, Arc<InMemoryProgressStore>) {
        let progress = Arc::new(InMemoryProgressStore::new());
        let context = ExecutorContext::new(
            Arc::new(data_management()),
            plugins,
            progress.clone(),
            ResultArtifactStore::new(directory.join("results")),
        );
        (context, progress)
    }

    #[tokio::test]
    async fn customized_result_is_written_as_artifact() {
        let directory = tempfile::tempdir().unwrap();
        let loader = Arc::new(StaticPluginLoader::new(|| Box::new(PopulationPlugin) as Box<dyn IndicatorPlugin>));
        let (context, progress) = context(directory.path(), loader.clone());
        let executor = CustomizedComputationExecutor::new(context);

        let path = done(executor.execute(job(4, customized_request())).await);

        assert_eq!(loader.loads(), 1);
        assert_eq!(path, directory.path().join("results").join("customized_4.b64"));
        let encoded = std::fs::read_to_string(&path).unwrap();
        let result: FeatureCollection = serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(result.features[0].date_value(date("2020-01-01")), Some(3.0));
        assert_eq!(progress.get(JobId::from(4), JobKind::Customized).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn customized_fetch_failure_fails_job() {
        let directory = tempfile::tempdir().unwrap();
        let loader = Arc::new(StaticPluginLoader::new(|| Box::new(PopulationPlugin) as Box<dyn IndicatorPlugin>));
        let (context, progress) = context(directory.path(), loader);
        let executor = CustomizedComputationExecutor::new(context);
        let mut request = customized_request();
        request.georesource_ids = vec!["missing".to_owned()];

        let error = failed(executor.execute(job(5, request)).await);

        assert_eq!(error.error_type(), "fetch");
        assert_eq!(progress.get(JobId::from(5), JobKind::Customized).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn plugin_is_unloaded_after_failure() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("customized_plugin.js");
        let loader = Arc::new(FileBackedLoader { path: path.clone() });
        let (context, _) = context(directory.path(), loader);
        let executor = CustomizedComputationExecutor::new(context);
        let mut request = customized_request();
        request.target_spatial_unit_id = "unknown".to_owned();

        failed(executor.execute(job(6, request)).await);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn default_computation_reports_completion() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("default_plugin.js");
        let loader = Arc::new(FileBackedLoader { path: path.clone() });
        let (context, progress) = context(directory.path(), loader);
        let executor = DefaultComputationExecutor::new(context);
        let request = DefaultComputationRequest {
            script_id: "script".to_owned(),
            target_indicator_id: "population".to_owned(),
            target_dates: vec![date("2020-01-01")],
            base_indicator_ids: Vec::new(),
            georesource_ids: Vec::new(),
            default_process_properties: Vec::new(),
            use_aggregation_for_higher_spatial_units: true,
        };

        let result = done(executor.execute(job(7, request)).await);

        assert_eq!(result.result_urls, ["memory://indicators/population/U1"]);
        assert!(result.failed_spatial_units.is_empty());
        assert_eq!(progress.get(JobId::from(7), JobKind::Default).await.unwrap(), 100);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn default_structural_failure_fails_job() {
        let directory = tempfile::tempdir().unwrap();
        let loader = Arc::new(StaticPluginLoader::new(|| Box::new(PopulationPlugin) as Box<dyn IndicatorPlugin>));
        let (context, _) = context(directory.path(), loader);
        let executor = DefaultComputationExecutor::new(context);
        let request = DefaultComputationRequest {
            script_id: "script".to_owned(),
            target_indicator_id: "unknown".to_owned(),
            target_dates: vec![date("2020-01-01")],
            base_indicator_ids: Vec::new(),
            georesource_ids: Vec::new(),
            default_process_properties: Vec::new(),
            use_aggregation_for_higher_spatial_units: false,
        };

        let error = failed(executor.execute(job(8, request)).await);

        assert_eq!(error.error_type(), "metadata");
    }
}
