use clap::Parser;
use relay_protocol::DEFAULT_MAX_FRAME_LENGTH;

use crate::aggregator::AggregatorConfig;
use crate::aggregator::DEFAULT_MAX_SUMMARY_SAMPLES;

#[derive(Parser, Debug, Clone)]
#[command(about = "Collects metric observations from local processes and serves them for scraping", version)]
pub struct CollectorArgs {
    #[arg(
        long,
        env = "METRICS_RELAY_BIND",
        default_value = "0.0.0.0",
        help = "Address the ingest listener binds to"
    )]
    pub bind: String,

    #[arg(
        long,
        short = 'p',
        env = "METRICS_RELAY_PORT",
        default_value_t = 9394,
        help = "Port client processes report observations to"
    )]
    pub port: u16,

    #[arg(
        long,
        env = "METRICS_RELAY_SCRAPE_ADDR",
        default_value = "0.0.0.0:9395",
        help = "Listen address of the /metrics endpoint"
    )]
    pub scrape_addr: String,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_FRAME_LENGTH,
        help = "Largest accepted record in bytes, connections sending more are closed"
    )]
    pub max_frame_length: usize,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_SUMMARY_SAMPLES,
        help = "Samples kept per summary series for quantile estimation"
    )]
    pub max_summary_samples: usize,
}

/// Collector config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// ingest listener address, `host:port`
    pub ingest_addr: String,
    /// scrape listener address, `host:port`
    pub scrape_addr: String,
    pub max_frame_length: usize,
    pub aggregator: AggregatorConfig,
}

impl CollectorConfig {
    pub fn new(ingest_addr: impl Into<String>) -> Self {
        Self {
            ingest_addr: ingest_addr.into(),
            scrape_addr: "0.0.0.0:9395".to_string(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            aggregator: AggregatorConfig::default(),
        }
    }

    pub fn with_scrape_addr(mut self, scrape_addr: impl Into<String>) -> Self {
        self.scrape_addr = scrape_addr.into();
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_max_summary_samples(mut self, max_summary_samples: usize) -> Self {
        self.aggregator.max_summary_samples = max_summary_samples;
        self
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self::new("0.0.0.0:9394")
    }
}

impl From<&CollectorArgs> for CollectorConfig {
    fn from(args: &CollectorArgs) -> Self {
        Self::new(format!("{}:{}", args.bind, args.port))
            .with_scrape_addr(args.scrape_addr.clone())
            .with_max_frame_length(args.max_frame_length)
            .with_max_summary_samples(args.max_summary_samples)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn args_map_onto_config() {
        let args = CollectorArgs::try_parse_from([
            "relay-collector",
            "--bind",
            "127.0.0.1",
            "--port",
            "9000",
            "--scrape-addr",
            "127.0.0.1:9001",
            "--max-summary-samples",
            "16",
        ])
        .expect("should parse");

        let config = CollectorConfig::from(&args);
        assert_eq!(config.ingest_addr, "127.0.0.1:9000");
        assert_eq!(config.scrape_addr, "127.0.0.1:9001");
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert_eq!(config.aggregator.max_summary_samples, 16);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        CollectorArgs::command().debug_assert();
    }
}
