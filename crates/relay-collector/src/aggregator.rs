//! Collector-side aggregation.
//!
//! Observations from every connected process are folded into one entry per
//! `(name, labels)` pair. All observations merged under one metric name must share
//! the type of the first one accepted for that name; anything else is rejected with
//! [`MergeError::TypeMismatch`] and leaves the store untouched.
//!
//! Merges and snapshots take the same lock, so a snapshot never shows half of a merge.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;
use relay_protocol::is_valid_label_name;
use relay_protocol::is_valid_metric_name;
use relay_protocol::Action;
use relay_protocol::Labels;
use relay_protocol::MetricOptions;
use relay_protocol::MetricType;
use relay_protocol::Observation;

use crate::error::MergeError;

pub const DEFAULT_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
pub const DEFAULT_QUANTILES: [f64; 5] = [0.99, 0.9, 0.5, 0.1, 0.01];
pub const DEFAULT_MAX_SUMMARY_SAMPLES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// sample window kept per summary entry, oldest samples are evicted first
    pub max_summary_samples: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_summary_samples: DEFAULT_MAX_SUMMARY_SAMPLES,
        }
    }
}

/// Aggregated value of one entry as seen by a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    Counter(f64),
    Gauge(f64),
    /// `buckets` holds `(upper bound, cumulative count)` pairs, ascending
    Histogram {
        buckets: Vec<(f64, u64)>,
        sum: f64,
        count: u64,
    },
    /// `quantiles` holds `(quantile, estimate)` pairs in configured order
    Summary {
        quantiles: Vec<(f64, f64)>,
        sum: f64,
        count: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub name: String,
    pub labels: Labels,
    pub metric_type: MetricType,
    pub help: String,
    pub value: AggregateValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub merged: u64,
    pub rejected: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    name: String,
    labels: Labels,
}

#[derive(Debug)]
struct Histogram {
    bounds: Vec<f64>,
    cumulative: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(options: Option<&MetricOptions>) -> Self {
        let mut bounds: Vec<f64> = options
            .and_then(|options| options.buckets.as_ref())
            .map(|buckets| buckets.iter().copied().filter(|b| b.is_finite()).collect())
            .unwrap_or_default();
        if bounds.is_empty() {
            bounds = DEFAULT_BUCKETS.to_vec();
        }
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();

        Self {
            cumulative: vec![0; bounds.len()],
            bounds,
            sum: 0.0,
            count: 0,
        }
    }

    fn record(&mut self, value: f64) {
        for (bound, count) in self.bounds.iter().zip(self.cumulative.iter_mut()) {
            if value <= *bound {
                *count += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug)]
struct Summary {
    quantiles: Vec<f64>,
    samples: VecDeque<f64>,
    max_samples: usize,
    sum: f64,
    count: u64,
}

impl Summary {
    fn new(options: Option<&MetricOptions>, max_samples: usize) -> Self {
        let quantiles = match options.and_then(|options| options.quantiles.as_ref()) {
            Some(quantiles) => quantiles
                .iter()
                .copied()
                .filter(|q| (0.0..=1.0).contains(q))
                .collect(),
            None => DEFAULT_QUANTILES.to_vec(),
        };
        Self {
            quantiles,
            samples: VecDeque::new(),
            max_samples: max_samples.max(1),
            sum: 0.0,
            count: 0,
        }
    }

    fn record(&mut self, value: f64) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.sum += value;
        self.count += 1;
    }

    /// Nearest-rank estimates over the current sample window.
    fn estimates(&self) -> Vec<(f64, f64)> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        self.quantiles
            .iter()
            .map(|&q| {
                let estimate = if sorted.is_empty() {
                    f64::NAN
                } else {
                    let rank = (q * sorted.len() as f64).ceil() as usize;
                    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
                };
                (q, estimate)
            })
            .collect()
    }
}

#[derive(Debug)]
enum State {
    Counter(f64),
    Gauge(f64),
    Histogram(Histogram),
    Summary(Summary),
}

#[derive(Debug)]
struct Entry {
    metric_type: MetricType,
    state: State,
}

impl Entry {
    fn new(observation: &Observation, config: &AggregatorConfig) -> Self {
        let options = observation.opts.as_ref();
        let state = match observation.metric_type {
            MetricType::Counter => State::Counter(0.0),
            MetricType::Gauge => State::Gauge(0.0),
            MetricType::Histogram => State::Histogram(Histogram::new(options)),
            MetricType::Summary => State::Summary(Summary::new(options, config.max_summary_samples)),
        };
        Self {
            metric_type: observation.metric_type,
            state,
        }
    }

    fn apply(&mut self, action: Action, value: f64) {
        match (&mut self.state, action) {
            (State::Counter(total), _) => *total += value,
            (State::Gauge(current), Action::Observe) => *current = value,
            (State::Gauge(current), Action::Increment) => *current += value,
            (State::Gauge(current), Action::Decrement) => *current -= value,
            (State::Histogram(histogram), _) => histogram.record(value),
            (State::Summary(summary), _) => summary.record(value),
        }
    }

    fn value(&self) -> AggregateValue {
        match &self.state {
            State::Counter(total) => AggregateValue::Counter(*total),
            State::Gauge(current) => AggregateValue::Gauge(*current),
            State::Histogram(histogram) => AggregateValue::Histogram {
                buckets: histogram
                    .bounds
                    .iter()
                    .copied()
                    .zip(histogram.cumulative.iter().copied())
                    .collect(),
                sum: histogram.sum,
                count: histogram.count,
            },
            State::Summary(summary) => AggregateValue::Summary {
                quantiles: summary.estimates(),
                sum: summary.sum,
                count: summary.count,
            },
        }
    }
}

/// Type and help shared by every series of one metric name.
#[derive(Debug)]
struct Family {
    metric_type: MetricType,
    help: String,
}

#[derive(Debug, Default)]
struct Store {
    entries: BTreeMap<EntryKey, Entry>,
    families: HashMap<String, Family>,
}

impl Store {
    fn merge(&mut self, observation: Observation, config: &AggregatorConfig) -> Result<(), MergeError> {
        validate(&observation)?;
        match self.families.get_mut(&observation.name) {
            Some(family) if family.metric_type != observation.metric_type => {
                return Err(MergeError::TypeMismatch {
                    name: observation.name,
                    existing: family.metric_type,
                    received: observation.metric_type,
                });
            }
            Some(family) => {
                if family.help.is_empty() && !observation.help.is_empty() {
                    family.help = observation.help.clone();
                }
            }
            None => {
                self.families.insert(observation.name.clone(), Family {
                    metric_type: observation.metric_type,
                    help: observation.help.clone(),
                });
            }
        }

        let action = observation.action();
        let value = observation.value;
        let entry = self
            .entries
            .entry(EntryKey {
                name: observation.name.clone(),
                labels: observation.keys.clone(),
            })
            .or_insert_with(|| Entry::new(&observation, config));
        entry.apply(action, value);
        Ok(())
    }

    fn help(&self, name: &str) -> &str {
        self.families
            .get(name)
            .map_or("", |family| family.help.as_str())
    }
}

/// Checks everything that does not depend on stored state.
fn validate(observation: &Observation) -> Result<(), MergeError> {
    if !is_valid_metric_name(&observation.name) {
        return Err(MergeError::InvalidName(observation.name.clone()));
    }
    for label in observation.keys.keys() {
        let reason = if !is_valid_label_name(label) {
            "not a valid label name"
        } else if observation.metric_type == MetricType::Histogram && label == "le" {
            "`le` is reserved for histogram buckets"
        } else if observation.metric_type == MetricType::Summary && label == "quantile" {
            "`quantile` is reserved for summary quantiles"
        } else {
            continue;
        };
        return Err(MergeError::InvalidLabel {
            name: observation.name.clone(),
            label: label.clone(),
            reason,
        });
    }
    if !observation.value.is_finite() {
        return Err(MergeError::InvalidValue {
            name: observation.name.clone(),
            value: observation.value,
            reason: "value is not finite",
        });
    }

    let action = observation.action();
    let supported = match observation.metric_type {
        MetricType::Counter => action != Action::Decrement,
        MetricType::Gauge => true,
        MetricType::Histogram | MetricType::Summary => action == Action::Observe,
    };
    if !supported {
        return Err(MergeError::UnsupportedAction {
            name: observation.name.clone(),
            metric_type: observation.metric_type,
            action,
        });
    }

    if observation.metric_type == MetricType::Counter && observation.value < 0.0 {
        return Err(MergeError::InvalidValue {
            name: observation.name.clone(),
            value: observation.value,
            reason: "counters only go up",
        });
    }
    Ok(())
}

/// Shared aggregation store, one per collector.
#[derive(Debug, Default)]
pub struct Aggregator {
    config: AggregatorConfig,
    store: RwLock<Store>,
    merged: AtomicU64,
    rejected: AtomicU64,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Folds one observation into the aggregate.
    ///
    /// # Errors
    ///
    /// - [`MergeError::TypeMismatch`] if the name is already held by another type
    /// - [`MergeError::InvalidName`] if the name is not a valid metric name
    /// - [`MergeError::InvalidValue`] for non-finite values and negative counter increments
    /// - [`MergeError::UnsupportedAction`] for actions the metric type cannot apply
    pub fn merge(&self, observation: Observation) -> Result<(), MergeError> {
        let result = self.store.write().merge(observation, &self.config);
        let counter = if result.is_ok() {
            &self.merged
        } else {
            &self.rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Consistent copy of every entry, ordered by name then labels.
    pub fn snapshot(&self) -> Vec<AggregateEntry> {
        let store = self.store.read();
        store
            .entries
            .iter()
            .map(|(key, entry)| AggregateEntry {
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: entry.metric_type,
                help: store.help(&key.name).to_string(),
                value: entry.value(),
            })
            .collect()
    }

    pub fn get(&self, name: &str, labels: &Labels) -> Option<AggregateValue> {
        let key = EntryKey {
            name: name.to_string(),
            labels: labels.clone(),
        };
        self.store.read().entries.get(&key).map(Entry::value)
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            merged: self.merged.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().entries.is_empty()
    }
}
