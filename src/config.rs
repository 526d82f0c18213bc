use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use duration_string::DurationString;

/// The four workloads making up the search application
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Component {
    Collector,
    Indexer,
    Database,
    Api,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Database,
        Component::Indexer,
        Component::Collector,
        Component::Api,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Component::Collector => "search-collector",
            Component::Indexer => "search-indexer",
            Component::Database => "search-postgres",
            Component::Api => "search-api",
        }
    }
}

/// Default sizing of a component when the Search spec does not override it
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentDefaults {
    pub cpu_request: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl ComponentDefaults {
    fn new(cpu_request: &str, memory_request: &str, memory_limit: &str) -> Self {
        Self {
            cpu_request: cpu_request.to_string(),
            memory_request: memory_request.to_string(),
            memory_limit: memory_limit.to_string(),
        }
    }
}

/// Read-only table of default sizes, built once at start
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDefaults {
    table: BTreeMap<Component, ComponentDefaults>,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            table: BTreeMap::from([
                (Component::Collector, ComponentDefaults::new("25m", "128Mi", "2Gi")),
                (Component::Indexer, ComponentDefaults::new("10m", "32Mi", "4Gi")),
                (Component::Database, ComponentDefaults::new("25m", "1Gi", "16Gi")),
                (Component::Api, ComponentDefaults::new("10m", "512Mi", "2Gi")),
            ]),
        }
    }
}

impl ResourceDefaults {
    pub fn get(&self, component: Component) -> &ComponentDefaults {
        // every component is present in the table built by `default`
        &self.table[&component]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    s.parse::<DurationString>()
        .map(Into::into)
        .map_err(|e| format!("invalid duration `{s}`: {e:?}"))
}

/// Operator configuration, from flags or the environment
#[derive(Parser, Clone, Debug)]
#[command(version, about = "Operator for the search application", long_about = None)]
pub struct OperatorConfig {
    /// Image of the search-indexer and search-api
    #[arg(long, env = "SEARCH_IMAGE", default_value = "quay.io/stolostron/search-v2-api:latest")]
    pub api_image: String,

    #[arg(long, env = "INDEXER_IMAGE", default_value = "quay.io/stolostron/search-indexer:latest")]
    pub indexer_image: String,

    #[arg(long, env = "COLLECTOR_IMAGE", default_value = "quay.io/stolostron/search-collector:latest")]
    pub collector_image: String,

    #[arg(long, env = "POSTGRES_IMAGE", default_value = "quay.io/stolostron/postgresql-16:latest")]
    pub postgres_image: String,

    /// Delay before a successfully reconciled Search is looked at again
    #[arg(long, env = "REQUEUE_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub requeue_interval: Duration,

    /// Delay before a failed reconcile is retried
    #[arg(long, env = "ERROR_REQUEUE_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub error_requeue_interval: Duration,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Address of the health and diagnostics server
    #[arg(long, env = "PROBE_ADDR", default_value = "0.0.0.0:8080")]
    pub probe_address: String,

    #[arg(skip)]
    pub defaults: ResourceDefaults,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        // only fails on invalid defaults above
        OperatorConfig::parse_from(["search-operator"])
    }
}

impl OperatorConfig {
    pub fn image(&self, component: Component) -> &str {
        match component {
            Component::Collector => &self.collector_image,
            Component::Indexer => &self.indexer_image,
            Component::Database => &self.postgres_image,
            Component::Api => &self.api_image,
        }
    }
}
