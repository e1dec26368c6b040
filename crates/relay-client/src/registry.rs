//! Client-side metric registry.
//!
//! The registry enforces one descriptor per name. Registering a name again with an
//! identical descriptor hands back the existing metric; registering it with a
//! different type, help text or options fails with [`RegistryError::DuplicateMetric`].
//! The check and the insert happen under one write lock, so concurrent registrations
//! of the same name resolve to the first one.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_protocol::is_valid_metric_name;
use relay_protocol::Labels;
use relay_protocol::MetricDescriptor;
use relay_protocol::MetricOptions;
use relay_protocol::MetricType;
use tracing::debug;

use crate::error::RegistryError;
use crate::metric::RegisteredMetric;
use crate::ObservationSink;

/// Predicate over a descriptor. Every supplied criterion must match; omitted ones are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricFilter {
    metric_type: Option<MetricType>,
    help: Option<String>,
}

impl MetricFilter {
    /// Filter that accepts any descriptor.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = Some(metric_type);
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn matches(&self, descriptor: &MetricDescriptor) -> bool {
        let type_matches = self
            .metric_type
            .map_or(true, |metric_type| metric_type == descriptor.metric_type);
        let help_matches = self
            .help
            .as_deref()
            .map_or(true, |help| help == descriptor.help);
        type_matches && help_matches
    }
}

impl From<MetricType> for MetricFilter {
    fn from(metric_type: MetricType) -> Self {
        Self::any().with_type(metric_type)
    }
}

pub struct MetricRegistry {
    metrics: RwLock<HashMap<String, RegisteredMetric>>,
    custom_labels: Arc<Labels>,
    sink: Arc<dyn ObservationSink>,
}

impl MetricRegistry {
    pub fn new(sink: Arc<dyn ObservationSink>, custom_labels: Labels) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            custom_labels: Arc::new(custom_labels),
            sink,
        }
    }

    pub fn register(
        &self,
        metric_type: MetricType,
        name: impl Into<String>,
        help: impl Into<String>,
        options: MetricOptions,
    ) -> Result<RegisteredMetric, RegistryError> {
        let name = name.into();
        if !is_valid_metric_name(&name) {
            return Err(RegistryError::InvalidMetricName(name));
        }
        let descriptor = MetricDescriptor::new(metric_type, name.clone(), help, options);

        let mut metrics = self.metrics.write();
        match metrics.entry(name) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if *existing.descriptor() == descriptor {
                    debug!(name = %descriptor.name, "Metric already registered with identical parameters");
                    Ok(existing.clone())
                } else {
                    Err(RegistryError::DuplicateMetric {
                        name: descriptor.name,
                        existing: existing.metric_type(),
                    })
                }
            }
            Entry::Vacant(slot) => {
                debug!(name = %descriptor.name, metric_type = %descriptor.metric_type, "Metric registered");
                let metric = RegisteredMetric::new(
                    descriptor,
                    Arc::clone(&self.custom_labels),
                    Arc::clone(&self.sink),
                );
                Ok(slot.insert(metric).clone())
            }
        }
    }

    /// Looks a metric up by name, returning it only if `filter` accepts its descriptor.
    pub fn find(&self, name: &str, filter: &MetricFilter) -> Option<RegisteredMetric> {
        self.metrics
            .read()
            .get(name)
            .filter(|metric| filter.matches(metric.descriptor()))
            .cloned()
    }

    /// All registered descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<MetricDescriptor> {
        let mut descriptors: Vec<_> = self
            .metrics
            .read()
            .values()
            .map(|metric| metric.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::metric::tests::RecordingSink;

    fn registry() -> MetricRegistry {
        MetricRegistry::new(Arc::new(RecordingSink::default()), Labels::new())
    }

    #[test]
    fn find_applies_every_supplied_filter() {
        let registry = registry();
        let counter = registry
            .register(MetricType::Counter, "counter_metric", "helping", MetricOptions::default())
            .expect("should register");

        assert!(registry.find("not_registered", &MetricFilter::any()).is_none());
        assert_eq!(registry.find("counter_metric", &MetricFilter::any()), Some(counter.clone()));

        let wrong_type = MetricFilter::any().with_type(MetricType::Gauge);
        assert!(registry.find("counter_metric", &wrong_type).is_none());
        let right_type = MetricFilter::from(MetricType::Counter);
        assert_eq!(registry.find("counter_metric", &right_type), Some(counter.clone()));

        let wrong_help = MetricFilter::any().with_help("not helping");
        assert!(registry.find("counter_metric", &wrong_help).is_none());
        let right_help = MetricFilter::any().with_help("helping");
        assert_eq!(registry.find("counter_metric", &right_help), Some(counter.clone()));

        let both_wrong = MetricFilter::any()
            .with_type(MetricType::Gauge)
            .with_help("not helping");
        assert!(registry.find("counter_metric", &both_wrong).is_none());
        let type_right_help_wrong = MetricFilter::from(MetricType::Counter).with_help("not helping");
        assert!(registry.find("counter_metric", &type_right_help_wrong).is_none());
        let both_right = MetricFilter::from(MetricType::Counter).with_help("helping");
        assert_eq!(registry.find("counter_metric", &both_right), Some(counter));
    }

    #[test]
    fn identical_registration_returns_existing_metric() {
        let registry = registry();
        let options = MetricOptions::default().with_buckets([0.1, 1.0]);
        let first = registry
            .register(MetricType::Histogram, "latency", "request latency", options.clone())
            .expect("should register");
        let second = registry
            .register(MetricType::Histogram, "latency", "request latency", options)
            .expect("identical registration is idempotent");

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let registry = registry();
        registry
            .register(MetricType::Counter, "jobs", "helping", MetricOptions::default())
            .expect("should register");

        let err = registry
            .register(MetricType::Gauge, "jobs", "helping", MetricOptions::default())
            .expect_err("type differs");
        assert_eq!(err, RegistryError::DuplicateMetric {
            name: "jobs".to_string(),
            existing: MetricType::Counter,
        });

        registry
            .register(MetricType::Counter, "jobs", "other help", MetricOptions::default())
            .expect_err("help differs");
        registry
            .register(
                MetricType::Counter,
                "jobs",
                "helping",
                MetricOptions::default().with_quantiles([0.5]),
            )
            .expect_err("options differ");

        // the first descriptor is kept
        let stored = registry
            .find("jobs", &MetricFilter::any())
            .expect("still registered");
        assert_eq!(stored.metric_type(), MetricType::Counter);
        assert_eq!(stored.help(), "helping");
    }

    #[test]
    fn invalid_names_are_rejected() {
        let registry = registry();
        let err = registry
            .register(MetricType::Counter, "bad-name", "helping", MetricOptions::default())
            .expect_err("dash is not allowed");
        assert_eq!(err, RegistryError::InvalidMetricName("bad-name".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_registration_has_single_winner() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let metric_type = if i % 2 == 0 { MetricType::Counter } else { MetricType::Gauge };
                    registry
                        .register(metric_type, "contended", "helping", MetricOptions::default())
                        .map(|metric| metric.metric_type())
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should not panic"))
            .collect();
        let winner = registry
            .find("contended", &MetricFilter::any())
            .expect("one registration wins")
            .metric_type();

        for result in results {
            match result {
                Ok(metric_type) => assert_eq!(metric_type, winner),
                Err(RegistryError::DuplicateMetric { existing, .. }) => assert_eq!(existing, winner),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn descriptors_are_sorted_by_name() {
        let registry = registry();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .register(MetricType::Gauge, name, "helping", MetricOptions::default())
                .expect("should register");
        }

        let names: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "mid".to_string(), "zeta".to_string()]);
    }
}
