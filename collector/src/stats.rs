//! Per-axis aggregation over the readings selected by a [`ReadingFilter`].
//!
//! Min, max, count and sum come from one aggregate read; the median needs the
//! raw values, fetched by a second read with the same filter.

use crate::errors::{Error, Result};
use crate::filter::ReadingFilter;
use crate::metrics::{STATISTICS_LATENCY_SECONDS, STATISTICS_QUERIES_TOTAL};
use crate::model::{AxisStatistics, Statistics};
use async_trait::async_trait;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisAggregate {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub count: i64,
    pub sum: Option<f64>,
}

impl AxisAggregate {
    pub fn over(values: impl IntoIterator<Item = f64>) -> Self {
        values.into_iter().fold(Self::default(), |acc, value| Self {
            min: Some(acc.min.map_or(value, |min| min.min(value))),
            max: Some(acc.max.map_or(value, |max| max.max(value))),
            count: acc.count + 1,
            sum: Some(acc.sum.unwrap_or(0.0) + value),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aggregates {
    pub x: AxisAggregate,
    pub y: AxisAggregate,
    pub z: AxisAggregate,
}

/// Raw axis values, column-wise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisSamples {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl FromIterator<(f64, f64, f64)> for AxisSamples {
    fn from_iter<I: IntoIterator<Item = (f64, f64, f64)>>(iter: I) -> Self {
        let mut samples = Self::default();
        for (x, y, z) in iter {
            samples.x.push(x);
            samples.y.push(y);
            samples.z.push(z);
        }
        samples
    }
}

/// Data-access handle the aggregation reads through. Both reads must apply
/// the filter identically.
#[async_trait]
pub trait ReadingSource: Send {
    async fn aggregate(&mut self, filter: &ReadingFilter) -> Result<Aggregates>;

    async fn axis_values(&mut self, filter: &ReadingFilter) -> Result<AxisSamples>;
}

pub async fn compute_statistics<S>(source: &mut S, filter: &ReadingFilter) -> Result<Statistics>
where
    S: ReadingSource + ?Sized,
{
    let _timer = STATISTICS_LATENCY_SECONDS.start_timer();
    STATISTICS_QUERIES_TOTAL.inc();

    let totals = source.aggregate(filter).await?;
    for (axis, aggregate) in [("x", totals.x), ("y", totals.y), ("z", totals.z)] {
        if aggregate.sum.is_some_and(|sum| !sum.is_finite()) {
            return Err(Error::Overflow(format!("sum of {} values out of range", axis)));
        }
    }
    let mut samples = source.axis_values(filter).await?;

    if totals.x.count != samples.x.len() as i64 {
        warn!(
            "Aggregate count {} differs from {} fetched values for {:?}",
            totals.x.count,
            samples.x.len(),
            filter
        );
    }
    debug!("Aggregated {} readings for {:?}", totals.x.count, filter);

    Ok(Statistics {
        x: summarize(totals.x, &mut samples.x),
        y: summarize(totals.y, &mut samples.y),
        z: summarize(totals.z, &mut samples.z),
    })
}

fn summarize(aggregate: AxisAggregate, values: &mut [f64]) -> AxisStatistics {
    if aggregate.count == 0 {
        return AxisStatistics::default();
    }

    AxisStatistics {
        min: aggregate.min,
        max: aggregate.max,
        count: aggregate.count,
        sum: aggregate.sum,
        median: median(values),
    }
}

/// Middle value after sorting, or the mean of the two middle values for an
/// even count. Sorts `values` in place.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some(values[mid - 1] / 2.0 + values[mid] / 2.0)
    }
}
