//! Feature collections, metadata and the computation requests exchanged with clients, plugins
//! and the data management API.
use std::{collections::HashMap, fmt::Display};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Property holding the stable id of a spatial unit feature.
pub const FEATURE_ID_PROPERTY: &str = "ID";
/// Property holding the weight of a feature during aggregation.
pub const AGGREGATION_WEIGHT_PROPERTY: &str = "aggregationWeight";
/// Prefix of the per date indicator value properties.
pub const DATE_PROPERTY_PREFIX: &str = "DATE_";

/// The name of the property holding the indicator value for `date`, e.g. `DATE_2020-01-01`.
pub fn date_property(date: NaiveDate) -> String {
    format!("{DATE_PROPERTY_PREFIX}{}", date.format("%Y-%m-%d"))
}

fn feature_collection_type() -> String {
    "FeatureCollection".to_owned()
}

fn feature_type() -> String {
    "Feature".to_owned()
}

/// A GeoJSON feature collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default = "feature_collection_type")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

/// A GeoJSON feature. The geometry is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub geometry: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Default for FeatureCollection {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: feature_collection_type(),
            features,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Ensure every feature carries a finite number or NoData for `date`.
    pub fn normalise_date(&mut self, date: NaiveDate) {
        let property = date_property(date);
        for feature in &mut self.features {
            let value = feature.properties.get(&property).and_then(finite_number);
            feature.set_value(&property, value);
        }
    }

    /// Merge the values for `date` from `computed` into this collection.
    ///
    /// Values are matched by feature id. Features of this collection missing from `computed` get
    /// NoData for the date, features of `computed` unknown to this collection are ignored.
    pub fn append_indicator_values_for_date(&mut self, date: NaiveDate, computed: &FeatureCollection) {
        let property = date_property(date);
        let values: HashMap<String, Option<f64>> = computed
            .features
            .iter()
            .filter_map(|feature| {
                let value = feature.properties.get(&property).and_then(finite_number);
                feature.feature_id().map(|id| (id, value))
            })
            .collect();

        for feature in &mut self.features {
            let value = feature
                .feature_id()
                .and_then(|id| values.get(&id).copied())
                .flatten();
            feature.set_value(&property, value);
        }
    }
}

impl Feature {
    pub fn new(properties: Map<String, Value>) -> Self {
        Self {
            kind: feature_type(),
            id: None,
            geometry: Value::Null,
            properties,
        }
    }

    /// The stable spatial unit feature id, numbers are read as their decimal representation.
    pub fn feature_id(&self) -> Option<String> {
        match self.properties.get(FEATURE_ID_PROPERTY)? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// The aggregation weight of the feature, defaults to `1`.
    pub fn weight(&self) -> f64 {
        self.properties
            .get(AGGREGATION_WEIGHT_PROPERTY)
            .and_then(finite_number)
            .unwrap_or(1.0)
    }

    /// The indicator value of the feature for `date`, [`None`] for NoData.
    pub fn date_value(&self, date: NaiveDate) -> Option<f64> {
        self.properties
            .get(&date_property(date))
            .and_then(finite_number)
    }

    pub fn set_date_value(&mut self, date: NaiveDate, value: Option<f64>) {
        self.set_value(&date_property(date), value);
    }

    fn set_value(&mut self, property: &str, value: Option<f64>) {
        let value = value
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number);
        self.properties.insert(property.to_owned(), value);
    }
}

fn finite_number(value: &Value) -> Option<f64> {
    value.as_f64().filter(|value| value.is_finite())
}

/// A named parameter passed through to the plugin untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessParameter {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialUnitMetadata {
    pub spatial_unit_id: String,
    pub spatial_unit_level: String,
    #[serde(default)]
    pub next_lower_hierarchy_level: Option<String>,
    #[serde(default)]
    pub next_upper_hierarchy_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorMetadata {
    pub indicator_id: String,
    #[serde(default)]
    pub indicator_name: String,
    pub lowest_spatial_unit_for_computation: String,
}

/// Request to compute an indicator over the whole spatial unit hierarchy and persist it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultComputationRequest {
    pub script_id: String,
    pub target_indicator_id: String,
    pub target_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub base_indicator_ids: Vec<String>,
    #[serde(default)]
    pub georesource_ids: Vec<String>,
    #[serde(default)]
    pub default_process_properties: Vec<ProcessParameter>,
    #[serde(default)]
    pub use_aggregation_for_higher_spatial_units: bool,
}

/// Request to compute an indicator for a single spatial unit and date without persisting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomizedComputationRequest {
    pub script_id: String,
    pub target_date: NaiveDate,
    #[serde(default)]
    pub base_indicator_ids: Vec<String>,
    #[serde(default)]
    pub georesource_ids: Vec<String>,
    pub target_spatial_unit_id: String,
    #[serde(default)]
    pub custom_process_properties: Vec<ProcessParameter>,
}

/// A spatial unit that could not be computed for a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUnitRecord {
    pub spatial_unit: SpatialUnitMetadata,
    pub target_date: NaiveDate,
    pub reason: String,
    pub error: String,
}

/// The two queues of computation jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Default,
    Customized,
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Default => "default",
            Self::Customized => "customized",
        };
        write!(f, "{kind}")
    }
}

#[cfg(test)]
pub(crate) mod test {
    use serde_json::json;

    use super::*;

    pub(crate) fn date(value: &str) -> NaiveDate {
        value.parse().unwrap()
    }

    pub(crate) fn feature(id: &str, properties: Value) -> Feature {
        let mut properties = match properties {
            Value::Object(properties) => properties,
            _ => Map::new(),
        };
        properties.insert(FEATURE_ID_PROPERTY.to_owned(), json!(id));
        Feature::new(properties)
    }

    #[test]
    fn date_property_is_zero_padded() {
        assert_eq!(date_property(date("2020-01-05")), "DATE_2020-01-05");
    }

    #[test]
    fn feature_id_accepts_numbers() {
        let feature = Feature::new(json!({ "ID": 17 }).as_object().unwrap().clone());
        assert_eq!(feature.feature_id().as_deref(), Some("17"));
        assert_eq!(feature.weight(), 1.0);
    }

    #[test]
    fn normalise_replaces_missing_and_non_numeric_values() {
        let day = date("2020-01-01");
        let mut collection = FeatureCollection::new(vec![
            feature("a", json!({ "DATE_2020-01-01": 3.5 })),
            feature("b", json!({ "DATE_2020-01-01": "n/a" })),
            feature("c", json!({})),
        ]);

        collection.normalise_date(day);

        assert_eq!(collection.features[0].date_value(day), Some(3.5));
        assert_eq!(collection.features[1].properties["DATE_2020-01-01"], Value::Null);
        assert_eq!(collection.features[2].properties["DATE_2020-01-01"], Value::Null);
    }

    #[test]
    fn append_matches_by_id_not_position() {
        let day = date("2020-02-01");
        let mut existing = FeatureCollection::new(vec![
            feature("a", json!({ "DATE_2020-01-01": 1 })),
            feature("b", json!({ "DATE_2020-01-01": 2 })),
            feature("c", json!({ "DATE_2020-01-01": 3 })),
        ]);
        let computed = FeatureCollection::new(vec![
            feature("b", json!({ "DATE_2020-02-01": 20 })),
            feature("a", json!({ "DATE_2020-02-01": 10 })),
            feature("z", json!({ "DATE_2020-02-01": 99 })),
        ]);

        existing.append_indicator_values_for_date(day, &computed);

        assert_eq!(existing.features.len(), 3);
        assert_eq!(existing.features[0].date_value(day), Some(10.0));
        assert_eq!(existing.features[1].date_value(day), Some(20.0));
        assert_eq!(existing.features[2].properties["DATE_2020-02-01"], Value::Null);
        assert_eq!(existing.features[2].date_value(date("2020-01-01")), Some(3.0));
    }

    #[test]
    fn append_is_idempotent() {
        let day = date("2020-02-01");
        let mut existing = FeatureCollection::new(vec![
            feature("a", json!({ "DATE_2020-01-01": 1 })),
            feature("b", json!({ "DATE_2020-01-01": 2 })),
        ]);
        let computed = FeatureCollection::new(vec![
            feature("a", json!({ "DATE_2020-02-01": 5 })),
        ]);

        existing.append_indicator_values_for_date(day, &computed);
        let once = existing.clone();
        existing.append_indicator_values_for_date(day, &computed);

        assert_eq!(existing, once);
    }

    #[test]
    fn requests_use_camel_case() {
        let request: DefaultComputationRequest = serde_json::from_value(json!({
            "scriptId": "s1",
            "targetIndicatorId": "i1",
            "targetDates": ["2020-01-01", "2021-01-01"],
            "baseIndicatorIds": ["b1"],
            "georesourceIds": [],
            "defaultProcessProperties": [{ "name": "radius", "value": 500 }],
            "useAggregationForHigherSpatialUnits": true
        }))
        .unwrap();

        assert_eq!(request.target_dates, [date("2020-01-01"), date("2021-01-01")]);
        assert_eq!(request.default_process_properties[0].value, json!(500));
        assert!(request.use_aggregation_for_higher_spatial_units);
        assert!(serde_json::from_value::<CustomizedComputationRequest>(json!({
            "scriptId": "s1"
        }))
        .is_err());
    }
}
