//! Access to the data management API holding scripts, spatial units, indicators and
//! georesources.
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::model::{FeatureCollection, IndicatorMetadata, SpatialUnitMetadata};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Resource {0} was not found")]
    NotFound(String),
    #[error("Data management API returned {status} for {url}: {body}")]
    Remote {
        status: StatusCode,
        url: String,
        body: String,
    },
    #[error("Persisting indicator {0} did not return a location")]
    MissingLocation(String),
}

/// The operations of the data management API needed to run computations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataManagementApi: Send + Sync {
    async fn fetch_script_code(&self, script_id: &str) -> Result<String, ApiError>;

    async fn fetch_indicator_metadata(
        &self,
        indicator_id: &str,
    ) -> Result<IndicatorMetadata, ApiError>;

    async fn fetch_spatial_units_metadata(&self) -> Result<Vec<SpatialUnitMetadata>, ApiError>;

    async fn fetch_spatial_unit_features(
        &self,
        spatial_unit_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError>;

    async fn fetch_georesource_features(
        &self,
        georesource_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError>;

    async fn fetch_indicator_features(
        &self,
        indicator_id: &str,
        spatial_unit_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError>;

    /// Store the computed features of an indicator for a spatial unit, returning their URL.
    async fn put_indicator_features(
        &self,
        indicator_id: &str,
        spatial_unit: &SpatialUnitMetadata,
        features: &FeatureCollection,
    ) -> Result<String, ApiError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutIndicatorRequest<'a> {
    applicable_spatial_unit: &'a str,
    indicator_values: &'a FeatureCollection,
}

/// [`DataManagementApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDataManagementClient {
    http_client: Client,
    read_url: String,
    write_url: String,
}

impl HttpDataManagementClient {
    pub fn new(http_client: Client, read_url: impl Into<String>, write_url: impl Into<String>) -> Self {
        Self {
            http_client,
            read_url: read_url.into().trim_end_matches('/').to_owned(),
            write_url: write_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn dated_path(date: NaiveDate) -> String {
        format!("{}/{:02}/{:02}", date.year(), date.month(), date.day())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}/{path}", self.read_url);
        tracing::debug!(%url, "Fetching from data management API");
        let response = Self::check(self.http_client.get(&url).send().await?, url).await?;
        Ok(response.json().await?)
    }

    async fn check(response: reqwest::Response, url: String) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(url));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Remote { status, url, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl DataManagementApi for HttpDataManagementClient {
    async fn fetch_script_code(&self, script_id: &str) -> Result<String, ApiError> {
        let url = format!("{}/process-scripts/{script_id}/scriptCode", self.read_url);
        let response = Self::check(self.http_client.get(&url).send().await?, url).await?;
        Ok(response.text().await?)
    }

    async fn fetch_indicator_metadata(
        &self,
        indicator_id: &str,
    ) -> Result<IndicatorMetadata, ApiError> {
        self.get_json(&format!("indicators/{indicator_id}")).await
    }

    async fn fetch_spatial_units_metadata(&self) -> Result<Vec<SpatialUnitMetadata>, ApiError> {
        self.get_json("spatial-units").await
    }

    async fn fetch_spatial_unit_features(
        &self,
        spatial_unit_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError> {
        self.get_json(&format!(
            "spatial-units/{spatial_unit_id}/{}",
            Self::dated_path(date)
        ))
        .await
    }

    async fn fetch_georesource_features(
        &self,
        georesource_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError> {
        self.get_json(&format!(
            "georesources/{georesource_id}/{}",
            Self::dated_path(date)
        ))
        .await
    }

    async fn fetch_indicator_features(
        &self,
        indicator_id: &str,
        spatial_unit_id: &str,
        date: NaiveDate,
    ) -> Result<FeatureCollection, ApiError> {
        self.get_json(&format!(
            "indicators/{indicator_id}/{spatial_unit_id}/{}",
            Self::dated_path(date)
        ))
        .await
    }

    async fn put_indicator_features(
        &self,
        indicator_id: &str,
        spatial_unit: &SpatialUnitMetadata,
        features: &FeatureCollection,
    ) -> Result<String, ApiError> {
        let url = format!("{}/indicators/{indicator_id}", self.write_url);
        tracing::debug!(%url, spatial_unit = %spatial_unit.spatial_unit_id, "Persisting indicator features");
        let response = self
            .http_client
            .put(&url)
            .json(&PutIndicatorRequest {
                applicable_spatial_unit: &spatial_unit.spatial_unit_id,
                indicator_values: features,
            })
            .send()
            .await?;
        let response = Self::check(response, url.clone()).await?;
        match response.headers().get(reqwest::header::LOCATION) {
            Some(location) => location
                .to_str()
                .map(ToOwned::to_owned)
                .map_err(|_| ApiError::MissingLocation(indicator_id.to_owned())),
            None => Ok(url),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dated_paths_are_zero_padded() {
        let date = NaiveDate::from_ymd_opt(2020, 3, 7).unwrap();
        assert_eq!(HttpDataManagementClient::dated_path(date), "2020/03/07");
    }

    #[test]
    fn trailing_slashes_are_trimmed() {
        let client = HttpDataManagementClient::new(Client::new(), "http://read/", "http://write");
        assert_eq!(client.read_url, "http://read");
        assert_eq!(client.write_url, "http://write");
    }

    #[test]
    fn put_request_names_spatial_unit() {
        let features = FeatureCollection::default();
        let body = serde_json::to_value(PutIndicatorRequest {
            applicable_spatial_unit: "districts",
            indicator_values: &features,
        })
        .unwrap();
        assert_eq!(body["applicableSpatialUnit"], "districts");
        assert_eq!(body["indicatorValues"]["type"], "FeatureCollection");
    }
}
