//! Storage of customized computation results.
//!
//! A result is serialised to JSON and base64 encoded (standard alphabet) into
//! `<directory>/customized_<job id>.b64`. Jobs only keep the path of the artifact.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use crate::{job::JobId, model::FeatureCollection};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Result artifact {0} does not exist")]
    NotFound(PathBuf),
    #[error("Failed to access result artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode or decode result: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Result is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Clone)]
pub struct ResultArtifactStore {
    directory: PathBuf,
}

impl ResultArtifactStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path(&self, job_id: JobId) -> PathBuf {
        self.directory.join(format!("customized_{job_id}.b64"))
    }

    /// Encode the result of a job, returning the path it was written to.
    pub async fn write(
        &self,
        job_id: JobId,
        result: &FeatureCollection,
    ) -> Result<PathBuf, ArtifactError> {
        let encoded = STANDARD.encode(serde_json::to_vec(result)?);
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.path(job_id);
        tokio::fs::write(&path, encoded).await?;
        tracing::debug!(%job_id, path = %path.display(), "Wrote result artifact");
        Ok(path)
    }

    /// Read back the base64 encoded result stored at `path`.
    pub async fn read_encoded(&self, path: &Path) -> Result<String, ArtifactError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(content),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(path.to_owned()))
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Decode a result as returned by [`ResultArtifactStore::read_encoded`].
pub fn decode_result(encoded: &str) -> Result<FeatureCollection, ArtifactError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::model::test::feature;

    use super::*;

    #[tokio::test]
    async fn written_result_decodes_to_collection() {
        let directory = tempfile::tempdir().unwrap();
        let store = ResultArtifactStore::new(directory.path().join("results"));
        let result = FeatureCollection::new(vec![feature("U1", json!({ "DATE_2020-01-01": 4.2 }))]);

        let path = store.write(JobId::from(12), &result).await.unwrap();
        assert_eq!(path, directory.path().join("results").join("customized_12.b64"));

        let encoded = store.read_encoded(&path).await.unwrap();
        assert_eq!(decode_result(&encoded).unwrap(), result);
    }

    #[tokio::test]
    async fn missing_artifact() {
        let directory = tempfile::tempdir().unwrap();
        let store = ResultArtifactStore::new(directory.path());

        assert_matches!(
            store.read_encoded(&store.path(JobId::from(1))).await,
            Err(ArtifactError::NotFound(_))
        );
    }
}
