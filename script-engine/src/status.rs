//! The status payloads returned to clients polling computation jobs.
//!
//! Jobs are reported with an external status derived from the backend status, the last recorded
//! progress and either their result or their error once they reached a terminal status. The job
//! data echoes the request together with the raw `result` and `error` of the job, overview
//! entries remove those two keys again.
use std::{path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    artifacts::ResultArtifactStore,
    backend::{self, Query},
    computation::DefaultComputationResult,
    job::{JobId, JobStatus},
    model::{FailedUnitRecord, JobKind},
    progress::{ProgressError, ProgressStore},
};

const RESULT_KEY: &str = "result";
const ERROR_KEY: &str = "error";

/// The status of a job as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalStatus {
    /// Scheduled or retryable and due.
    Waiting,
    /// Scheduled or retryable in the future.
    Delayed,
    Active,
    Succeeded,
    Failed,
}

impl ExternalStatus {
    /// The order in which the overview lists its buckets.
    pub const ALL: [ExternalStatus; 5] = [
        Self::Succeeded,
        Self::Failed,
        Self::Waiting,
        Self::Delayed,
        Self::Active,
    ];

    pub fn of(job: &backend::Job, now: DateTime<Utc>) -> Self {
        match job.status {
            JobStatus::Scheduled | JobStatus::Retryable if job.scheduled_at > now => Self::Delayed,
            JobStatus::Scheduled | JobStatus::Retryable => Self::Waiting,
            JobStatus::Executing => Self::Active,
            JobStatus::Complete => Self::Succeeded,
            JobStatus::Discarded => Self::Failed,
        }
    }

    /// The backend query selecting the jobs in this status at `now`.
    pub fn query<'a>(&self, now: DateTime<Utc>) -> Query<'a> {
        let pending = || {
            Query::Or(vec![
                Query::StatusEqual(JobStatus::Scheduled),
                Query::StatusEqual(JobStatus::Retryable),
            ])
        };
        match self {
            Self::Waiting => Query::And(vec![
                pending(),
                Query::Not(Box::new(Query::ScheduledAtAfter(now))),
            ]),
            Self::Delayed => Query::And(vec![pending(), Query::ScheduledAtAfter(now)]),
            Self::Active => Query::StatusEqual(JobStatus::Executing),
            Self::Succeeded => Query::StatusEqual(JobStatus::Complete),
            Self::Failed => Query::StatusEqual(JobStatus::Discarded),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomizedJobStatus {
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    pub status: Option<ExternalStatus>,
    pub progress: Option<u8>,
    #[serde(rename = "result_geoJSON_base64")]
    pub result_geojson_base64: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "jobData")]
    pub job_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultJobStatus {
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    pub status: Option<ExternalStatus>,
    pub progress: Option<u8>,
    pub result_urls: Option<Vec<String>>,
    pub failed_spatial_units: Option<Vec<FailedUnitRecord>>,
    pub error: Option<String>,
    #[serde(rename = "jobData")]
    pub job_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOverviewEntry {
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    pub status: Option<ExternalStatus>,
    pub progress: Option<u8>,
    pub error: Option<String>,
    #[serde(rename = "jobData")]
    pub job_data: Option<Value>,
}

fn not_found_message(job_id: JobId) -> String {
    format!("Job with id '{job_id}' was not found")
}

impl CustomizedJobStatus {
    /// Payload for a job that could not be loaded, carrying only the error.
    pub fn missing(job_id: JobId, error: Option<String>) -> Self {
        Self {
            job_id,
            status: None,
            progress: None,
            result_geojson_base64: None,
            error: Some(error.unwrap_or_else(|| not_found_message(job_id))),
            job_data: None,
        }
    }
}

impl DefaultJobStatus {
    /// Payload for a job that could not be loaded, carrying only the error.
    pub fn missing(job_id: JobId, error: Option<String>) -> Self {
        Self {
            job_id,
            status: None,
            progress: None,
            result_urls: None,
            failed_spatial_units: None,
            error: Some(error.unwrap_or_else(|| not_found_message(job_id))),
            job_data: None,
        }
    }
}

/// The error of a job that failed for good, retried errors are not reported.
fn terminal_error(job: &backend::Job) -> Option<String> {
    match job.status {
        JobStatus::Discarded => Some(
            job.errors
                .last()
                .map(|error| format!("{}: {}", error.error_type, error.details))
                .unwrap_or_else(|| "Job failed".to_owned()),
        ),
        _ => None,
    }
}

fn terminal_result(job: &backend::Job) -> Option<&Value> {
    match job.status {
        JobStatus::Complete => job.result.as_ref(),
        _ => None,
    }
}

/// The request of the job with its raw result and error.
fn job_data(job: &backend::Job) -> Value {
    let mut data = match &job.data {
        Value::Object(data) => data.clone(),
        other => Map::from_iter([("data".to_owned(), other.clone())]),
    };
    if let Some(result) = terminal_result(job) {
        data.insert(RESULT_KEY.to_owned(), result.clone());
    }
    if let Some(error) = terminal_error(job) {
        data.insert(ERROR_KEY.to_owned(), Value::String(error));
    }
    Value::Object(data)
}

/// Builds status payloads from backend jobs.
#[derive(Clone)]
pub struct StatusAssembler {
    progress: Arc<dyn ProgressStore>,
    artifacts: ResultArtifactStore,
}

impl StatusAssembler {
    pub fn new(progress: Arc<dyn ProgressStore>, artifacts: ResultArtifactStore) -> Self {
        Self {
            progress,
            artifacts,
        }
    }

    async fn progress(&self, job_id: JobId, kind: JobKind) -> Option<u8> {
        match self.progress.get(job_id, kind).await {
            Ok(progress) => Some(progress),
            Err(ProgressError::NotFound { .. }) => None,
            Err(error) => {
                tracing::warn!(?error, %job_id, %kind, "Failed to read progress");
                None
            }
        }
    }

    pub async fn customized(&self, job: &backend::Job, now: DateTime<Utc>) -> CustomizedJobStatus {
        let job_id = JobId::from(job.id);
        let mut error = terminal_error(job);
        let result_geojson_base64 = match terminal_result(job).and_then(Value::as_str) {
            Some(path) => match self.artifacts.read_encoded(Path::new(path)).await {
                Ok(encoded) => Some(encoded),
                Err(artifact_error) => {
                    tracing::warn!(error = ?artifact_error, %job_id, "Failed to read result artifact");
                    error = Some(format!("Failed to read result: {artifact_error}"));
                    None
                }
            },
            None => None,
        };

        CustomizedJobStatus {
            job_id,
            status: Some(ExternalStatus::of(job, now)),
            progress: self.progress(job_id, JobKind::Customized).await,
            result_geojson_base64,
            error,
            job_data: Some(job_data(job)),
        }
    }

    pub async fn default(&self, job: &backend::Job, now: DateTime<Utc>) -> DefaultJobStatus {
        let job_id = JobId::from(job.id);
        let mut error = terminal_error(job);
        let result = match terminal_result(job) {
            Some(result) => {
                match serde_json::from_value::<DefaultComputationResult>(result.clone()) {
                    Ok(result) => Some(result),
                    Err(decode_error) => {
                        tracing::warn!(error = ?decode_error, %job_id, "Failed to decode job result");
                        error = Some(format!("Failed to decode result: {decode_error}"));
                        None
                    }
                }
            }
            None => None,
        };
        let (result_urls, failed_spatial_units) = match result {
            Some(result) => (Some(result.result_urls), Some(result.failed_spatial_units)),
            None => (None, None),
        };

        DefaultJobStatus {
            job_id,
            status: Some(ExternalStatus::of(job, now)),
            progress: self.progress(job_id, JobKind::Default).await,
            result_urls,
            failed_spatial_units,
            error,
            job_data: Some(job_data(job)),
        }
    }

    pub async fn overview_entry(
        &self,
        job: &backend::Job,
        kind: JobKind,
        now: DateTime<Utc>,
    ) -> JobOverviewEntry {
        let job_id = JobId::from(job.id);
        let mut job_data = job_data(job);
        if let Value::Object(data) = &mut job_data {
            data.remove(RESULT_KEY);
            data.remove(ERROR_KEY);
        }
        JobOverviewEntry {
            job_id,
            status: Some(ExternalStatus::of(job, now)),
            progress: self.progress(job_id, kind).await,
            error: terminal_error(job),
            job_data: Some(job_data),
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;
    use serde_json::json;

    use crate::{
        artifacts::decode_result,
        backend::queryable::Queryable,
        job::{ErrorType, JobError},
        model::{test::feature, FeatureCollection},
        progress::InMemoryProgressStore,
    };

    use super::*;

    fn assembler(directory: &Path) -> (StatusAssembler, Arc<InMemoryProgressStore>) {
        let progress = Arc::new(InMemoryProgressStore::new());
        let assembler = StatusAssembler::new(progress.clone(), ResultArtifactStore::new(directory));
        (assembler, progress)
    }

    fn job_error(details: &str) -> JobError {
        JobError {
            attempt: 1,
            error_type: ErrorType::Other("plugin".to_owned()),
            details: details.to_owned(),
            recorded_at: Utc::now(),
        }
    }

    fn raw_job(status: JobStatus) -> backend::Job {
        let now = Utc::now();
        backend::Job {
            id: 3,
            status,
            executor: "default_computation".to_owned(),
            data: json!({ "scriptId": "s1" }),
            result: None,
            attempt: 1,
            max_attempts: 3,
            errors: Vec::new(),
            inserted_at: now,
            scheduled_at: now,
            attempted_at: None,
            completed_at: None,
            discarded_at: None,
        }
    }

    #[test]
    fn external_status_mapping() {
        let now = Utc::now();
        let mut job = raw_job(JobStatus::Scheduled);
        job.scheduled_at = now - TimeDelta::seconds(1);
        assert_eq!(ExternalStatus::of(&job, now), ExternalStatus::Waiting);
        job.status = JobStatus::Retryable;
        job.scheduled_at = now + TimeDelta::minutes(1);
        assert_eq!(ExternalStatus::of(&job, now), ExternalStatus::Delayed);

        for (status, external) in [
            (JobStatus::Executing, ExternalStatus::Active),
            (JobStatus::Complete, ExternalStatus::Succeeded),
            (JobStatus::Discarded, ExternalStatus::Failed),
        ] {
            assert_eq!(ExternalStatus::of(&raw_job(status), now), external);
        }
    }

    #[test]
    fn bucket_queries_agree_with_mapping() {
        let now = Utc::now();
        let mut jobs: Vec<_> = JobStatus::ALL.into_iter().map(raw_job).collect();
        let mut delayed = raw_job(JobStatus::Retryable);
        delayed.scheduled_at = now + TimeDelta::hours(1);
        jobs.push(delayed);

        for job in &jobs {
            let buckets: Vec<_> = ExternalStatus::ALL
                .into_iter()
                .filter(|bucket| bucket.query(now).matches(job))
                .collect();
            assert_eq!(buckets, [ExternalStatus::of(job, now)]);
        }
    }

    #[tokio::test]
    async fn result_and_error_are_exclusive() {
        let directory = tempfile::tempdir().unwrap();
        let (assembler, _) = assembler(directory.path());
        let now = Utc::now();

        let mut retryable = raw_job(JobStatus::Retryable);
        retryable.errors.push(job_error("first attempt"));
        let status = assembler.default(&retryable, now).await;
        assert_eq!((status.error, status.result_urls), (None, None));

        let mut discarded = raw_job(JobStatus::Discarded);
        discarded.errors.push(job_error("broken"));
        let status = assembler.default(&discarded, now).await;
        assert_eq!(status.error.as_deref(), Some("plugin: broken"));
        assert_eq!(status.result_urls, None);

        let mut complete = raw_job(JobStatus::Complete);
        complete.result = Some(json!({ "result_urls": ["url"], "failed_spatial_units": [] }));
        let status = assembler.default(&complete, now).await;
        assert_eq!(status.error, None);
        assert_eq!(status.result_urls, Some(vec!["url".to_owned()]));
        assert_eq!(status.failed_spatial_units, Some(Vec::new()));
    }

    #[tokio::test]
    async fn customized_result_is_read_back() {
        let directory = tempfile::tempdir().unwrap();
        let (assembler, progress) = assembler(directory.path());
        let result = FeatureCollection::new(vec![feature("U1", json!({ "DATE_2020-01-01": 1 }))]);
        let path = ResultArtifactStore::new(directory.path())
            .write(JobId::from(3), &result)
            .await
            .unwrap();
        progress.set(JobId::from(3), JobKind::Customized, 100).await.unwrap();

        let mut job = raw_job(JobStatus::Complete);
        job.executor = "customized_computation".to_owned();
        job.result = Some(json!(path));
        let status = assembler.customized(&job, Utc::now()).await;

        assert_eq!(status.status, Some(ExternalStatus::Succeeded));
        assert_eq!(status.progress, Some(100));
        assert_eq!(status.error, None);
        assert_eq!(decode_result(&status.result_geojson_base64.unwrap()).unwrap(), result);
    }

    #[tokio::test]
    async fn missing_artifact_is_reported_as_error() {
        let directory = tempfile::tempdir().unwrap();
        let (assembler, _) = assembler(directory.path());
        let mut job = raw_job(JobStatus::Complete);
        job.result = Some(json!(directory.path().join("gone.b64")));

        let status = assembler.customized(&job, Utc::now()).await;

        assert_eq!(status.result_geojson_base64, None);
        assert!(status.error.unwrap().starts_with("Failed to read result"));
    }

    #[tokio::test]
    async fn overview_redacts_result_and_error() {
        let directory = tempfile::tempdir().unwrap();
        let (assembler, _) = assembler(directory.path());
        let mut job = raw_job(JobStatus::Discarded);
        job.errors.push(job_error("broken"));

        let detail = assembler.default(&job, Utc::now()).await;
        assert_eq!(detail.job_data.unwrap()["error"], "plugin: broken");

        let entry = assembler.overview_entry(&job, JobKind::Default, Utc::now()).await;
        assert_eq!(entry.error.as_deref(), Some("plugin: broken"));
        assert_eq!(entry.progress, None);
        assert_eq!(entry.job_data, Some(json!({ "scriptId": "s1" })));
    }

    #[test]
    fn payload_field_names() {
        let payload = serde_json::to_value(CustomizedJobStatus::missing(JobId::from(9), None)).unwrap();
        assert_eq!(
            payload,
            json!({
                "jobId": 9,
                "status": null,
                "progress": null,
                "result_geoJSON_base64": null,
                "error": "Job with id '9' was not found",
                "jobData": null
            })
        );
        let payload = serde_json::to_value(DefaultJobStatus::missing(JobId::from(9), None)).unwrap();
        assert!(payload.get("result_urls").is_some());
        assert!(payload.get("failed_spatial_units").is_some());
    }
}
