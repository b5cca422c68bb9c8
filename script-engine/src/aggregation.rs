//! Helpers for plugins aggregating lower level indicator values onto a higher spatial unit.
//!
//! Lower level features are assigned to at most one target feature. Assignment is tracked with
//! a [`RemainingSet`] instead of removing features from the input, features that no target
//! claimed are returned in [`Aggregation::unassigned`].
use chrono::NaiveDate;

use crate::model::{Feature, FeatureCollection, AGGREGATION_WEIGHT_PROPERTY};

/// Tombstone set over the indices `0..len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainingSet {
    taken: Vec<bool>,
    remaining: usize,
}

impl RemainingSet {
    pub fn new(len: usize) -> Self {
        Self {
            taken: vec![false; len],
            remaining: len,
        }
    }

    /// Mark `index` as taken, returning whether it was still remaining.
    pub fn take(&mut self, index: usize) -> bool {
        match self.taken.get_mut(index) {
            Some(taken) if !*taken => {
                *taken = true;
                self.remaining -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        matches!(self.taken.get(index), Some(false))
    }

    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.taken
            .iter()
            .enumerate()
            .filter(|(_, taken)| !**taken)
            .map(|(index, _)| index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    /// `sum(weight * value)`
    WeightedSum,
    /// `sum(weight * value) / sum(weight)`
    WeightedMean,
}

/// The outcome of [`aggregate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub features: FeatureCollection,
    pub unassigned: Vec<Feature>,
}

/// Assign every lower level feature to the first target feature it matches.
///
/// Returns the indices of the lower features assigned to each target, in target order, and the
/// set of lower features left unassigned.
pub fn assign<F>(
    targets: &FeatureCollection,
    lower: &FeatureCollection,
    matches: F,
) -> (Vec<Vec<usize>>, RemainingSet)
where
    F: Fn(&Feature, &Feature) -> bool,
{
    let mut remaining = RemainingSet::new(lower.features.len());
    let assignments = targets
        .features
        .iter()
        .map(|target| {
            let members: Vec<usize> = remaining
                .iter()
                .filter(|&index| matches(target, &lower.features[index]))
                .collect();
            members.iter().for_each(|&index| {
                remaining.take(index);
            });
            members
        })
        .collect();
    (assignments, remaining)
}

/// Aggregate the values for `date` of the lower level features onto the target features.
///
/// Targets without any valued member get NoData. The aggregation weight of the lower features
/// is consumed and never copied to the output.
pub fn aggregate<F>(
    date: NaiveDate,
    targets: &FeatureCollection,
    lower: FeatureCollection,
    method: AggregationMethod,
    matches: F,
) -> Aggregation
where
    F: Fn(&Feature, &Feature) -> bool,
{
    let (assignments, remaining) = assign(targets, &lower, matches);

    let features = targets
        .features
        .iter()
        .zip(assignments)
        .map(|(target, members)| {
            let values = members.iter().filter_map(|&index| {
                let feature = &lower.features[index];
                feature
                    .date_value(date)
                    .map(|value| (feature.weight(), value))
            });
            let mut feature = target.clone();
            feature.properties.remove(AGGREGATION_WEIGHT_PROPERTY);
            feature.set_date_value(date, combine(values, method));
            feature
        })
        .collect();

    let unassigned = lower
        .features
        .into_iter()
        .enumerate()
        .filter(|(index, _)| remaining.contains(*index))
        .map(|(_, feature)| feature)
        .collect();

    Aggregation {
        features: FeatureCollection::new(features),
        unassigned,
    }
}

fn combine(values: impl Iterator<Item = (f64, f64)>, method: AggregationMethod) -> Option<f64> {
    let (count, weights, sum) = values.fold((0usize, 0.0, 0.0), |(count, weights, sum), (weight, value)| {
        (count + 1, weights + weight, sum + weight * value)
    });
    match method {
        _ if count == 0 => None,
        AggregationMethod::WeightedSum => Some(sum),
        AggregationMethod::WeightedMean if weights != 0.0 => Some(sum / weights),
        AggregationMethod::WeightedMean => None,
    }
}
