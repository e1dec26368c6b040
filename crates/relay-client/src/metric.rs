//! Handles returned by registration.

use std::fmt;
use std::sync::Arc;

use relay_protocol::Action;
use relay_protocol::Labels;
use relay_protocol::MetricDescriptor;
use relay_protocol::MetricType;
use relay_protocol::Observation;
use tracing::warn;

use crate::ObservationSink;

/// Empty label set for calls that carry no keys.
pub const NO_LABELS: [(&str, &str); 0] = [];

/// A registered metric. Cloning is cheap; every clone feeds the same delivery worker.
#[derive(Clone)]
pub struct RegisteredMetric {
    descriptor: Arc<MetricDescriptor>,
    custom_labels: Arc<Labels>,
    sink: Arc<dyn ObservationSink>,
}

impl RegisteredMetric {
    pub(crate) fn new(
        descriptor: MetricDescriptor,
        custom_labels: Arc<Labels>,
        sink: Arc<dyn ObservationSink>,
    ) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            custom_labels,
            sink,
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn metric_type(&self) -> MetricType {
        self.descriptor.metric_type
    }

    pub fn help(&self) -> &str {
        &self.descriptor.help
    }

    /// Canonical payload for one data point.
    ///
    /// Custom labels from the client config are merged first so the caller's keys win.
    /// The payload carries `opts` only when the metric was registered with options.
    pub fn standard_values<I, K, V>(&self, value: f64, keys: I) -> Observation
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels = (*self.custom_labels).clone();
        labels.extend(keys.into_iter().map(|(k, v)| (k.into(), v.into())));
        self.descriptor.observation(value, labels)
    }

    /// Counter: add `value`; gauge: set to `value`; histogram and summary: record a sample.
    pub fn observe<I, K, V>(&self, value: f64, keys: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.sink.submit(self.standard_values(value, keys));
    }

    pub fn increment<I, K, V>(&self, keys: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.increment_by(1.0, keys);
    }

    /// Add `value` to a counter or gauge.
    pub fn increment_by<I, K, V>(&self, value: f64, keys: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        match self.metric_type() {
            MetricType::Counter | MetricType::Gauge => self
                .sink
                .submit(self.standard_values(value, keys).with_action(Action::Increment)),
            other => warn!(name = %self.name(), metric_type = %other, "increment is not supported, dropping"),
        }
    }

    pub fn decrement<I, K, V>(&self, keys: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.decrement_by(1.0, keys);
    }

    /// Subtract `value` from a gauge. Other metric types drop the call.
    pub fn decrement_by<I, K, V>(&self, value: f64, keys: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        match self.metric_type() {
            MetricType::Gauge => self
                .sink
                .submit(self.standard_values(value, keys).with_action(Action::Decrement)),
            other => warn!(name = %self.name(), metric_type = %other, "decrement is only supported on gauges, dropping"),
        }
    }
}

impl PartialEq for RegisteredMetric {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor
    }
}

impl fmt::Debug for RegisteredMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMetric")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;
    use relay_protocol::MetricOptions;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    /// Sink that keeps everything it receives.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) received: Mutex<Vec<Observation>>,
    }

    impl ObservationSink for RecordingSink {
        fn submit(&self, observation: Observation) {
            self.received.lock().push(observation);
        }
    }

    fn metric(
        metric_type: MetricType,
        options: MetricOptions,
        custom_labels: Labels,
    ) -> (RegisteredMetric, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let descriptor = MetricDescriptor::new(metric_type, "jobs", "helping", options);
        let handle = RegisteredMetric::new(descriptor, Arc::new(custom_labels), sink.clone());
        (handle, sink)
    }

    #[test]
    fn standard_values_without_options_omit_opts() {
        let (counter, _) = metric(MetricType::Counter, MetricOptions::default(), Labels::new());
        let values = counter.standard_values(1.0, [("key", "value")]);

        assert!(values.opts.is_none());
        let json = serde_json::to_value(&values).expect("should serialize");
        assert!(json.get("opts").is_none());
    }

    #[test]
    fn standard_values_echo_options() {
        let expected = MetricOptions::default().with_quantiles([0.99, 9.0]);
        let (summary, _) = metric(MetricType::Summary, expected.clone(), Labels::new());

        assert_eq!(summary.standard_values(1.0, NO_LABELS).opts, Some(expected));
    }

    #[test]
    fn caller_keys_override_custom_labels() {
        let custom = Labels::from([
            ("service".to_string(), "web".to_string()),
            ("region".to_string(), "eu".to_string()),
        ]);
        let (counter, _) = metric(MetricType::Counter, MetricOptions::default(), custom);
        let values = counter.standard_values(1.0, [("region", "us")]);

        assert_eq!(values.keys.get("service").map(String::as_str), Some("web"));
        assert_eq!(values.keys.get("region").map(String::as_str), Some("us"));
    }

    #[test]
    fn increment_and_decrement_tag_actions() {
        let (gauge, sink) = metric(MetricType::Gauge, MetricOptions::default(), Labels::new());
        gauge.observe(3.0, NO_LABELS);
        gauge.increment(NO_LABELS);
        gauge.decrement_by(2.0, NO_LABELS);

        let received = sink.received.lock();
        let actions: Vec<_> = received.iter().map(|o| (o.action, o.value)).collect();
        assert_eq!(actions, vec![
            (None, 3.0),
            (Some(Action::Increment), 1.0),
            (Some(Action::Decrement), 2.0),
        ]);
    }

    #[test]
    fn unsupported_actions_are_dropped() {
        let (counter, sink) = metric(MetricType::Counter, MetricOptions::default(), Labels::new());
        counter.decrement(NO_LABELS);

        let (histogram, histogram_sink) =
            metric(MetricType::Histogram, MetricOptions::default(), Labels::new());
        histogram.increment(NO_LABELS);

        assert!(sink.received.lock().is_empty());
        assert!(histogram_sink.received.lock().is_empty());
    }
}
