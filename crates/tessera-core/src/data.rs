//! Data collector: per-period time series.
//!
//! A raw series is fed by a reporter evaluated once per period. A derived
//! series is computed from an earlier series (its base) right after the
//! raw values of the period are in. Every series has exactly one entry per
//! collected period; a missing point is `None` and is exported as
//! [`MISSING_MARKER`].

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::model::Model;

/// Marker written to the export for missing points.
pub const MISSING_MARKER: &str = "NA";

/// Reporter callback producing one value per period.
pub type Reporter = dyn Fn(&Model) -> anyhow::Result<f64> + Send + Sync;

/// Errors raised by the data collector.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// A series with this name already exists.
    #[error("series already registered: {0}")]
    Duplicate(String),

    /// No series with this name.
    #[error("unknown series: {0}")]
    UnknownSeries(String),

    /// Rolling window of zero points.
    #[error("series {0}: window must be at least 1")]
    ZeroWindow(String),

    /// Smoothing factor outside `(0, 1]`.
    #[error("series {name}: smoothing factor {alpha} is outside (0, 1]")]
    InvalidAlpha {
        /// Series name.
        name: String,
        /// The rejected factor.
        alpha: f64,
    },

    /// Writing the export failed.
    #[error("csv export failed: {source}")]
    Csv {
        /// The underlying writer error.
        #[from]
        source: csv::Error,
    },

    /// Flushing the export failed.
    #[error("csv export failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },
}

/// How a derived series is computed from its base.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Derivation {
    /// Arithmetic mean of the last `window` points.
    RollingMean {
        /// Window length in periods.
        window: usize,
    },
    /// Population standard deviation of the last `window` points.
    RollingStd {
        /// Window length in periods.
        window: usize,
    },
    /// Exponential smoothing: `s = alpha * x + (1 - alpha) * s_prev`.
    Smooth {
        /// Weight of the newest point, in `(0, 1]`.
        alpha: f64,
    },
}

impl Derivation {
    fn validate(self, name: &str) -> Result<(), DataError> {
        match self {
            Self::RollingMean { window: 0 } | Self::RollingStd { window: 0 } => {
                Err(DataError::ZeroWindow(name.to_owned()))
            }
            Self::Smooth { alpha } if !(alpha > 0.0 && alpha <= 1.0) => {
                Err(DataError::InvalidAlpha {
                    name: name.to_owned(),
                    alpha,
                })
            }
            _ => Ok(()),
        }
    }

    /// Value at the last index of `base`, given the previous derived value.
    fn apply(self, base: &[Option<f64>], previous: Option<f64>) -> Option<f64> {
        match self {
            Self::RollingMean { window } => {
                let points = window_points(base, window);
                Stat::Mean.apply(&points)
            }
            Self::RollingStd { window } => {
                let points = window_points(base, window);
                population_std(&points)
            }
            Self::Smooth { alpha } => match (base.last().copied().flatten(), previous) {
                (Some(x), Some(s)) => Some(alpha.mul_add(x, (1.0 - alpha) * s)),
                (Some(x), None) => Some(x),
                (None, s) => s,
            },
        }
    }
}

fn window_points(base: &[Option<f64>], window: usize) -> Vec<f64> {
    let start = base.len().saturating_sub(window);
    base.get(start..)
        .unwrap_or_default()
        .iter()
        .filter_map(|v| *v)
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn population_std(points: &[f64]) -> Option<f64> {
    let mean = Stat::Mean.apply(points)?;
    let variance =
        points.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / points.len() as f64;
    Some(variance.sqrt())
}

// ---------------------------------------------------------------------------
// Summary Statistics
// ---------------------------------------------------------------------------

/// Summary of a set of values, typically an attribute across a primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    /// Sum; zero for an empty set.
    Sum,
    /// Arithmetic mean.
    Mean,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Number of values.
    Count,
    /// Linearly interpolated percentile, `p` in `[0, 100]`.
    Percentile(f64),
}

impl Stat {
    /// Apply the statistic. Returns `None` where it is undefined (mean of
    /// nothing, percentile outside `[0, 100]`).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        match self {
            Self::Sum => Some(values.iter().sum()),
            Self::Count => Some(values.len() as f64),
            Self::Mean => {
                if values.is_empty() {
                    None
                } else {
                    Some(values.iter().sum::<f64>() / values.len() as f64)
                }
            }
            Self::Min => values.iter().copied().reduce(f64::min),
            Self::Max => values.iter().copied().reduce(f64::max),
            Self::Percentile(p) => {
                if values.is_empty() || !(0.0..=100.0).contains(&p) {
                    return None;
                }
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let rank = p / 100.0 * (sorted.len().saturating_sub(1)) as f64;
                let lower = rank.floor() as usize;
                let upper = rank.ceil() as usize;
                let lo = *sorted.get(lower)?;
                let hi = *sorted.get(upper)?;
                Some((hi - lo).mul_add(rank - rank.floor(), lo))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Source {
    Reporter(Arc<Reporter>),
    Derived { base: usize, derivation: Derivation },
}

struct Series {
    name: String,
    source: Source,
    values: Vec<Option<f64>>,
}

/// Registered series and their collected values.
#[derive(Default)]
pub struct DataCollector {
    periods: Vec<u64>,
    series: Vec<Series>,
}

impl core::fmt::Debug for DataCollector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataCollector")
            .field("periods", &self.periods.len())
            .field("series", &self.names())
            .finish()
    }
}

impl DataCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw series fed by `reporter`. Periods already collected
    /// are filled with missing points.
    pub fn add_reporter<F>(&mut self, name: &str, reporter: F) -> Result<(), DataError>
    where
        F: Fn(&Model) -> anyhow::Result<f64> + Send + Sync + 'static,
    {
        self.ensure_new(name)?;
        debug!(series = name, "reporter registered");
        self.series.push(Series {
            name: name.to_owned(),
            source: Source::Reporter(Arc::new(reporter)),
            values: vec![None; self.periods.len()],
        });
        Ok(())
    }

    /// Register a series derived from `base`. Its history is computed from
    /// the base's history at once.
    pub fn add_series(
        &mut self,
        name: &str,
        base: &str,
        derivation: Derivation,
    ) -> Result<(), DataError> {
        self.ensure_new(name)?;
        derivation.validate(name)?;
        let base_index = self
            .position(base)
            .ok_or_else(|| DataError::UnknownSeries(base.to_owned()))?;
        let base_values = self
            .series
            .get(base_index)
            .map(|s| s.values.clone())
            .unwrap_or_default();

        let mut values: Vec<Option<f64>> = Vec::with_capacity(base_values.len());
        for end in 1..=base_values.len() {
            let previous = values.last().copied().flatten();
            let prefix = base_values.get(..end).unwrap_or_default();
            values.push(derivation.apply(prefix, previous));
        }

        debug!(series = name, base, derivation = ?derivation, "derived series registered");
        self.series.push(Series {
            name: name.to_owned(),
            source: Source::Derived {
                base: base_index,
                derivation,
            },
            values,
        });
        Ok(())
    }

    /// Values of a series, one per collected period.
    pub fn series(&self, name: &str) -> Option<&[Option<f64>]> {
        self.series
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.values.as_slice())
    }

    /// Most recent value of a series.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.series(name).and_then(|v| v.last().copied().flatten())
    }

    /// Value of a series at a collected period.
    pub fn at(&self, name: &str, period: u64) -> Option<f64> {
        let index = self.periods.iter().position(|p| *p == period)?;
        self.series(name)?.get(index).copied().flatten()
    }

    /// Collected periods, in order.
    pub fn periods(&self) -> &[u64] {
        &self.periods
    }

    /// Series names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.series.iter().map(|s| s.name.as_str()).collect()
    }

    /// Number of collected periods.
    pub fn len(&self) -> usize {
        self.periods.len()
    }

    /// Whether nothing has been collected yet.
    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// Write every series as CSV: a `period` column, then one column per
    /// series in registration order, one row per collected period.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), DataError> {
        let mut out = csv::Writer::from_writer(writer);
        let mut header = vec!["period"];
        header.extend(self.names());
        out.write_record(&header)?;

        for (row, period) in self.periods.iter().enumerate() {
            let mut record = Vec::with_capacity(self.series.len().saturating_add(1));
            record.push(period.to_string());
            for series in &self.series {
                record.push(match series.values.get(row).copied().flatten() {
                    Some(value) => value.to_string(),
                    None => MISSING_MARKER.to_owned(),
                });
            }
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write the CSV export to a file.
    pub fn export(&self, path: &Path) -> Result<(), DataError> {
        let file = std::fs::File::create(path)?;
        self.write_csv(file)?;
        info!(path = %path.display(), periods = self.periods.len(), "series exported");
        Ok(())
    }

    /// Reporters to evaluate this period, with their series index.
    pub(crate) fn reporters(&self) -> Vec<(usize, String, Arc<Reporter>)> {
        self.series
            .iter()
            .enumerate()
            .filter_map(|(index, s)| match &s.source {
                Source::Reporter(r) => Some((index, s.name.clone(), Arc::clone(r))),
                Source::Derived { .. } => None,
            })
            .collect()
    }

    /// Append one period: the raw values by series index, then every
    /// derived series in registration order.
    pub(crate) fn push_period(&mut self, period: u64, raw: &[(usize, Option<f64>)]) {
        self.periods.push(period);
        let len = self.periods.len();
        for index in 0..self.series.len() {
            let value = match self.series.get(index).map(|s| s.source.clone()) {
                Some(Source::Reporter(_)) => raw
                    .iter()
                    .find(|(i, _)| *i == index)
                    .and_then(|(_, v)| *v),
                Some(Source::Derived { base, derivation }) => {
                    let previous = self
                        .series
                        .get(index)
                        .and_then(|s| s.values.last().copied().flatten());
                    self.series
                        .get(base)
                        .and_then(|b| derivation.apply(b.values.get(..len)?, previous))
                }
                None => None,
            };
            if let Some(series) = self.series.get_mut(index) {
                series.values.push(value);
            }
        }
    }

    /// Drop every collected value. Registrations stay.
    pub fn clear(&mut self) {
        self.periods.clear();
        for series in &mut self.series {
            series.values.clear();
        }
    }

    fn ensure_new(&self, name: &str) -> Result<(), DataError> {
        if name == "period" || self.position(name).is_some() {
            return Err(DataError::Duplicate(name.to_owned()));
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.series.iter().position(|s| s.name == name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    fn collector_with_raw(values: &[Option<f64>]) -> DataCollector {
        let mut data = DataCollector::new();
        data.add_reporter("x", |_| Ok(0.0)).unwrap();
        for (period, value) in (0u64..).zip(values) {
            data.push_period(period, &[(0, *value)]);
        }
        data
    }

    #[test]
    fn rolling_mean_uses_available_points() {
        let mut data = collector_with_raw(&[Some(1.0), Some(2.0), Some(3.0), Some(6.0)]);
        data.add_series("avg", "x", Derivation::RollingMean { window: 3 })
            .unwrap();
        let avg = data.series("avg").unwrap();
        assert!(close(avg[0], 1.0));
        assert!(close(avg[1], 1.5));
        assert!(close(avg[2], 2.0));
        assert!(close(avg[3], 11.0 / 3.0));
    }

    #[test]
    fn rolling_std_is_population_std() {
        let mut data = collector_with_raw(&[Some(2.0), Some(4.0)]);
        data.add_series("sd", "x", Derivation::RollingStd { window: 5 })
            .unwrap();
        assert!(close(data.last("sd"), 1.0));
    }

    #[test]
    fn derived_series_follow_new_periods() {
        let mut data = collector_with_raw(&[Some(2.0)]);
        data.add_series("smooth", "x", Derivation::Smooth { alpha: 0.5 })
            .unwrap();
        data.push_period(1, &[(0, Some(4.0))]);
        data.push_period(2, &[(0, None)]);
        let smooth = data.series("smooth").unwrap();
        assert!(close(smooth[1], 3.0));
        assert!(close(smooth[2], 3.0));
    }

    #[test]
    fn missing_points_are_skipped_by_windows() {
        let mut data = collector_with_raw(&[Some(1.0), None, Some(3.0)]);
        data.add_series("avg", "x", Derivation::RollingMean { window: 2 })
            .unwrap();
        let avg = data.series("avg").unwrap();
        assert!(close(avg[1], 1.0));
        assert!(close(avg[2], 3.0));
    }

    #[test]
    fn late_series_are_padded() {
        let mut data = collector_with_raw(&[Some(1.0), Some(2.0)]);
        data.add_reporter("late", |_| Ok(1.0)).unwrap();
        assert_eq!(data.series("late").unwrap(), &[None, None]);
    }

    #[test]
    fn invalid_registrations_are_rejected() {
        let mut data = collector_with_raw(&[]);
        assert!(matches!(
            data.add_reporter("x", |_| Ok(0.0)),
            Err(DataError::Duplicate(_))
        ));
        assert!(matches!(
            data.add_series("y", "nope", Derivation::RollingMean { window: 2 }),
            Err(DataError::UnknownSeries(_))
        ));
        assert!(matches!(
            data.add_series("y", "x", Derivation::RollingMean { window: 0 }),
            Err(DataError::ZeroWindow(_))
        ));
        assert!(matches!(
            data.add_series("y", "x", Derivation::Smooth { alpha: 0.0 }),
            Err(DataError::InvalidAlpha { .. })
        ));
    }

    #[test]
    fn csv_export_marks_missing_points() {
        let data = collector_with_raw(&[Some(1.5), None]);
        let mut buffer = Vec::new();
        data.write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text, "period,x\n0,1.5\n1,NA\n");
    }

    #[test]
    fn stats() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert!(close(Stat::Sum.apply(&values), 10.0));
        assert!(close(Stat::Mean.apply(&values), 2.5));
        assert!(close(Stat::Min.apply(&values), 1.0));
        assert!(close(Stat::Max.apply(&values), 4.0));
        assert!(close(Stat::Count.apply(&values), 4.0));
        assert!(close(Stat::Percentile(50.0).apply(&values), 2.5));
        assert!(close(Stat::Percentile(100.0).apply(&values), 4.0));
        assert_eq!(Stat::Mean.apply(&[]), None);
        assert_eq!(Stat::Percentile(101.0).apply(&values), None);
    }
}
