//! Sample series with capacity-bounded storage
//!
//! A `SampleSeries` holds the numeric samples collected for one (entity, metric)
//! pair. `SeriesStore` owns every series of the agent, keyed by entity name and
//! metric family, and preserves creation order so reporting follows the roster.

use crate::error::SeriesError;
use crate::events::MetricKind;
use std::collections::VecDeque;

/// Ordered numeric samples for one watched entity and metric
///
/// When more than `capacity` samples are appended the oldest are dropped.
/// Once released, a series rejects further appends.
#[derive(Debug, Clone)]
pub struct SampleSeries {
    /// Entity the samples belong to, e.g. a process name
    name: String,
    metric: MetricKind,
    samples: VecDeque<f64>,
    capacity: usize,
    released: bool,
}

impl SampleSeries {
    /// Create an empty series
    ///
    /// # Examples
    ///
    /// ```
    /// use nodewatch::aggregator::SampleSeries;
    /// use nodewatch::events::MetricKind;
    ///
    /// let mut series = SampleSeries::new("gatewayd", MetricKind::Cpu, 100);
    /// series.append(10.0).unwrap();
    /// series.append(30.0).unwrap();
    /// assert_eq!(series.average(), Some(20.0));
    /// assert_eq!(series.peak(), Some(30.0));
    /// ```
    pub fn new(name: impl Into<String>, metric: MetricKind, capacity: usize) -> Self {
        Self {
            name: name.into(),
            metric,
            samples: VecDeque::new(),
            capacity: capacity.max(1),
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    /// Append a sample
    ///
    /// Values are not validated. Fails with `SeriesError::InvalidState` once the
    /// series has been released.
    pub fn append(&mut self, sample: f64) -> Result<(), SeriesError> {
        if self.released {
            return Err(SeriesError::InvalidState(format!(
                "append to released series {}/{}",
                self.name, self.metric
            )));
        }
        self.samples.push_back(sample);
        self.enforce_capacity();
        Ok(())
    }

    /// Samples in append order
    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Arithmetic mean of the current samples, `None` when there are none
    ///
    /// Samples are summed in ascending order so the result does not depend on
    /// the order they were appended in.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = sorted.iter().sum();
        Some(sum / sorted.len() as f64)
    }

    /// Largest current sample, `None` when there are none
    pub fn peak(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }

    /// Drop all samples; the series stays usable
    pub fn reset(&mut self) {
        self.samples.clear();
        self.samples.shrink_to_fit();
    }

    /// Drop all samples and refuse further appends
    pub fn release(&mut self) {
        self.reset();
        self.released = true;
    }

    /// Append every sample of `other`, in order
    pub fn extend_from(&mut self, other: &SampleSeries) -> Result<(), SeriesError> {
        for sample in other.samples() {
            self.append(sample)?;
        }
        Ok(())
    }

    fn enforce_capacity(&mut self) {
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }
}

/// Owner of every sample series, one per (entity, metric) pair
#[derive(Debug, Clone)]
pub struct SeriesStore {
    series: Vec<SampleSeries>,
    capacity: usize,
}

impl SeriesStore {
    /// Create an empty store whose series hold at most `capacity` samples each
    pub fn new(capacity: usize) -> Self {
        Self {
            series: Vec::new(),
            capacity,
        }
    }

    /// Create the series for `name`/`metric` if it does not exist yet
    pub fn ensure(&mut self, name: &str, metric: MetricKind) -> &mut SampleSeries {
        let index = match self.position(name, metric) {
            Some(index) => index,
            None => {
                self.series
                    .push(SampleSeries::new(name, metric, self.capacity));
                self.series.len() - 1
            }
        };
        &mut self.series[index]
    }

    /// Append a sample, creating the series on first use
    pub fn append(&mut self, name: &str, metric: MetricKind, value: f64) -> Result<(), SeriesError> {
        self.ensure(name, metric).append(value)
    }

    pub fn get(&self, name: &str, metric: MetricKind) -> Option<&SampleSeries> {
        self.position(name, metric).map(|i| &self.series[i])
    }

    /// All series of one metric family, in creation order
    pub fn family(&self, metric: MetricKind) -> impl Iterator<Item = &SampleSeries> {
        self.series.iter().filter(move |s| s.metric() == metric)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SampleSeries> {
        self.series.iter()
    }

    /// Number of series held
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Total samples across all series
    pub fn total_samples(&self) -> usize {
        self.series.iter().map(SampleSeries::len).sum()
    }

    /// Move every sample of `staged` into the matching series of this store
    pub fn merge_from(&mut self, staged: &SeriesStore) -> Result<(), SeriesError> {
        for series in &staged.series {
            self.ensure(series.name(), series.metric())
                .extend_from(series)?;
        }
        Ok(())
    }

    /// Release and drop every series
    ///
    /// Refused with `SeriesError::InvalidState` while an alarm is outstanding, since
    /// the retained samples are the trend context for that alarm.
    pub fn release_all(&mut self, alarm_outstanding: bool) -> Result<(), SeriesError> {
        if alarm_outstanding {
            return Err(SeriesError::InvalidState(
                "cannot release series while an alarm is outstanding".to_string(),
            ));
        }
        for series in &mut self.series {
            series.release();
        }
        self.series.clear();
        self.series.shrink_to_fit();
        Ok(())
    }

    fn position(&self, name: &str, metric: MetricKind) -> Option<usize> {
        self.series
            .iter()
            .position(|s| s.metric() == metric && s.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_series_has_no_data() {
        let series = SampleSeries::new("gatewayd", MetricKind::Cpu, 10);
        assert!(series.is_empty());
        assert_eq!(series.average(), None);
        assert_eq!(series.peak(), None);
    }

    #[test]
    fn test_average_and_peak() {
        let mut series = SampleSeries::new("gatewayd", MetricKind::Memory, 10);
        for v in [100.0, 300.0, 200.0] {
            series.append(v).unwrap();
        }
        assert_eq!(series.average(), Some(200.0));
        assert_eq!(series.peak(), Some(300.0));
        assert_eq!(series.samples().collect::<Vec<_>>(), vec![100.0, 300.0, 200.0]);
    }

    #[test]
    fn test_negative_values_are_accepted() {
        let mut series = SampleSeries::new("gatewayd", MetricKind::Cpu, 10);
        series.append(-1.0).unwrap();
        assert_eq!(series.average(), Some(-1.0));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut series = SampleSeries::new("gatewayd", MetricKind::Cpu, 3);
        for v in 1..=5 {
            series.append(v as f64).unwrap();
        }
        assert_eq!(series.samples().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_reset_keeps_series_usable() {
        let mut series = SampleSeries::new("gatewayd", MetricKind::Cpu, 10);
        series.append(5.0).unwrap();
        series.reset();
        assert!(series.is_empty());
        assert!(series.append(6.0).is_ok());
    }

    #[test]
    fn test_append_after_release_is_invalid_state() {
        let mut series = SampleSeries::new("gatewayd", MetricKind::DiskRead, 10);
        series.append(5.0).unwrap();
        series.release();

        assert!(series.is_released());
        assert!(series.is_empty());
        assert!(matches!(
            series.append(1.0),
            Err(SeriesError::InvalidState(_))
        ));
    }

    #[test]
    fn test_store_creates_series_lazily_in_order() {
        let mut store = SeriesStore::new(10);
        store.ensure("b", MetricKind::Cpu);
        store.ensure("a", MetricKind::Cpu);
        store.ensure("b", MetricKind::Cpu);
        store.append("a", MetricKind::Memory, 1.0).unwrap();

        assert_eq!(store.len(), 3);
        let names: Vec<_> = store.family(MetricKind::Cpu).map(|s| s.name()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(store.get("a", MetricKind::Memory).unwrap().len(), 1);
        assert!(store.get("a", MetricKind::DiskWrite).is_none());
    }

    #[test]
    fn test_merge_appends_staged_samples() {
        let mut retained = SeriesStore::new(10);
        retained.append("a", MetricKind::Cpu, 1.0).unwrap();

        let mut staged = SeriesStore::new(10);
        staged.append("a", MetricKind::Cpu, 2.0).unwrap();
        staged.append("b", MetricKind::Cpu, 3.0).unwrap();

        retained.merge_from(&staged).unwrap();
        assert_eq!(
            retained.get("a", MetricKind::Cpu).unwrap().samples().collect::<Vec<_>>(),
            vec![1.0, 2.0]
        );
        assert_eq!(retained.get("b", MetricKind::Cpu).unwrap().len(), 1);
        assert_eq!(retained.total_samples(), 3);
    }

    #[test]
    fn test_release_all_refused_while_alarm_outstanding() {
        let mut store = SeriesStore::new(10);
        store.append("a", MetricKind::Cpu, 95.0).unwrap();

        assert!(matches!(
            store.release_all(true),
            Err(SeriesError::InvalidState(_))
        ));
        assert_eq!(store.total_samples(), 1);

        store.release_all(false).unwrap();
        assert!(store.is_empty());
    }
}

// Property-based tests
#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    /// Non-empty list of finite, moderately sized samples
    #[derive(Debug, Clone)]
    struct Samples(Vec<f64>);

    impl Arbitrary for Samples {
        fn arbitrary(g: &mut Gen) -> Self {
            let size = usize::arbitrary(g) % 64 + 1;
            let samples = (0..size)
                .map(|_| (i32::arbitrary(g) % 100_000) as f64 / 8.0)
                .collect();
            Samples(samples)
        }
    }

    fn series_of(values: &[f64]) -> SampleSeries {
        let mut series = SampleSeries::new("proc", MetricKind::Cpu, values.len());
        for v in values {
            series.append(*v).unwrap();
        }
        series
    }

    #[quickcheck]
    fn prop_average_and_peak_are_order_independent(samples: Samples, rotate_by: usize) -> bool {
        let forward = series_of(&samples.0);

        let mut reversed_values = samples.0.clone();
        reversed_values.reverse();
        let reversed = series_of(&reversed_values);

        let mut rotated_values = samples.0.clone();
        let len = rotated_values.len();
        rotated_values.rotate_left(rotate_by % len);
        let rotated = series_of(&rotated_values);

        forward.average() == reversed.average()
            && forward.average() == rotated.average()
            && forward.peak() == reversed.peak()
            && forward.peak() == rotated.peak()
    }

    #[quickcheck]
    fn prop_average_is_arithmetic_mean_and_peak_is_max(samples: Samples) -> bool {
        let series = series_of(&samples.0);
        let mean = samples.0.iter().sum::<f64>() / samples.0.len() as f64;
        let max = samples.0.iter().copied().fold(f64::MIN, f64::max);

        let average = series.average().unwrap();
        (average - mean).abs() <= 1e-6 * mean.abs().max(1.0) && series.peak() == Some(max)
    }
}
