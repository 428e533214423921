//! Configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use database::Conversation;
use message_bus::RoutingConfig;
use serde_json::{Map, Value};

/// Default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:campaign.db?mode=rwc";

/// Default interval between metric flushes.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between polls of the shared queues.
pub const DEFAULT_RELAY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default lease on a claimed queue row.
pub const DEFAULT_RELAY_LEASE: Duration = Duration::from_secs(30);

/// Application worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name of the worker; commands are consumed from `<worker_name>.control`.
    pub worker_name: String,
    /// Prefix for every metric name this worker publishes.
    pub metrics_prefix: String,
    /// SQLite database URL.
    pub database_url: String,
    /// Transport whose inbound and event queues this worker consumes.
    pub transport_name: Option<String>,
    /// Routing for commands. The control queue uses its exchange.
    pub api_routing: RoutingConfig,
    /// Routing for application events.
    pub app_event_routing: RoutingConfig,
    /// How often the metrics manager flushes.
    pub metrics_interval: Duration,
    /// Workers the control dispatcher forwards commands to. Empty disables it.
    pub dispatcher_workers: Vec<String>,
    /// How often the relay polls the shared queues.
    pub relay_poll_interval: Duration,
    /// How long a claimed queue row stays hidden from other consumers.
    pub relay_lease: Duration,
    /// Application defaults that conversation metadata may override.
    pub app_defaults: Map<String, Value>,
}

impl WorkerConfig {
    /// Config with default routing and no transport.
    pub fn new(worker_name: impl Into<String>, metrics_prefix: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            metrics_prefix: metrics_prefix.into(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            transport_name: None,
            api_routing: RoutingConfig::api_commands(),
            app_event_routing: RoutingConfig::app_events(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            dispatcher_workers: Vec::new(),
            relay_poll_interval: DEFAULT_RELAY_POLL_INTERVAL,
            relay_lease: DEFAULT_RELAY_LEASE,
            app_defaults: Map::new(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `WORKER_NAME` | Control queue name | (required) |
    /// | `METRICS_PREFIX` | Metric name prefix | (required) |
    /// | `DATABASE_URL` | SQLite database URL | `sqlite:campaign.db?mode=rwc` |
    /// | `TRANSPORT_NAME` | Transport to consume inbound messages and events from | (unset) |
    /// | `API_EXCHANGE` | Command exchange | `vumi` |
    /// | `API_ROUTING_KEY` | Command routing key | `vumi.api` |
    /// | `APP_EVENT_ROUTING_KEY` | Application event routing key | `vumi.event` |
    /// | `METRICS_INTERVAL_SECS` | Metric flush interval | `5` |
    /// | `DISPATCHER_WORKERS` | Comma-separated workers to forward commands to | (unset) |
    /// | `RELAY_POLL_MS` | Shared queue poll interval | `250` |
    /// | `RELAY_LEASE_SECS` | Lease on a claimed queue row | `30` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), with `overrides` consulted first.
    pub fn from_env_with(
        overrides: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| overrides(name).or_else(|| env::var(name).ok()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let worker_name = lookup("WORKER_NAME")
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::Missing("WORKER_NAME"))?;
        let metrics_prefix =
            lookup("METRICS_PREFIX").ok_or(ConfigError::Missing("METRICS_PREFIX"))?;

        let mut config = Self::new(worker_name, metrics_prefix);

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        config.transport_name = lookup("TRANSPORT_NAME").filter(|name| !name.is_empty());

        if let Some(exchange) = lookup("API_EXCHANGE") {
            config.api_routing = config.api_routing.with_exchange(exchange.clone());
            config.app_event_routing = config.app_event_routing.with_exchange(exchange);
        }
        if let Some(routing_key) = lookup("API_ROUTING_KEY") {
            config.api_routing = config.api_routing.with_routing_key(routing_key);
        }
        if let Some(routing_key) = lookup("APP_EVENT_ROUTING_KEY") {
            config.app_event_routing = config.app_event_routing.with_routing_key(routing_key);
        }

        if let Some(secs) = lookup("METRICS_INTERVAL_SECS") {
            config.metrics_interval = parse_duration("METRICS_INTERVAL_SECS", &secs, Duration::from_secs)?;
        }
        if let Some(millis) = lookup("RELAY_POLL_MS") {
            config.relay_poll_interval = parse_duration("RELAY_POLL_MS", &millis, Duration::from_millis)?;
        }
        if let Some(secs) = lookup("RELAY_LEASE_SECS") {
            config.relay_lease = parse_duration("RELAY_LEASE_SECS", &secs, Duration::from_secs)?;
        }
        if let Some(workers) = lookup("DISPATCHER_WORKERS") {
            config.dispatcher_workers = parse_worker_list(&workers);
        }

        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_transport_name(mut self, transport_name: impl Into<String>) -> Self {
        self.transport_name = Some(transport_name.into());
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn with_dispatcher_workers(mut self, workers: Vec<String>) -> Self {
        self.dispatcher_workers = workers;
        self
    }

    /// Set an application default.
    pub fn with_app_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.app_defaults.insert(key.into(), value);
        self
    }

    /// Routing for this worker's control queue, on the command exchange.
    pub fn control_routing(&self) -> RoutingConfig {
        RoutingConfig::control(&self.worker_name).with_exchange(self.api_routing.exchange.clone())
    }

    /// Queues consumed in this process: the control queue, the transport
    /// queues when a transport is set, and the command queue when the
    /// dispatcher runs.
    pub fn consumed_queues(&self) -> Vec<RoutingConfig> {
        let mut queues = vec![self.control_routing()];
        if let Some(transport) = self.transport_name.as_deref() {
            queues.push(RoutingConfig::transport_inbound(transport));
            queues.push(RoutingConfig::transport_events(transport));
        }
        if !self.dispatcher_workers.is_empty() {
            queues.push(self.api_routing.clone());
        }
        queues
    }

    /// Application config for one conversation.
    pub fn conversation_config<'a>(&'a self, conversation: &'a Conversation) -> ConversationConfig<'a> {
        ConversationConfig {
            defaults: &self.app_defaults,
            overrides: &conversation.metadata,
        }
    }
}

fn parse_duration(
    var: &'static str,
    value: &str,
    unit: fn(u64) -> Duration,
) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(unit(n)),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_worker_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// Application settings where conversation metadata overrides worker defaults.
#[derive(Debug, Clone, Copy)]
pub struct ConversationConfig<'a> {
    defaults: &'a Map<String, Value>,
    overrides: &'a Map<String, Value>,
}

impl<'a> ConversationConfig<'a> {
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.overrides.get(key).or_else(|| self.defaults.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&'a str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Boolean setting; missing or non-boolean values read as `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("WORKER_NAME", "bulk_message_application"), ("METRICS_PREFIX", "go.")])
            .unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.transport_name, None);
        assert_eq!(config.api_routing.routing_key, "vumi.api");
        assert_eq!(config.app_event_routing.routing_key, "vumi.event");
        assert_eq!(config.metrics_interval, Duration::from_secs(5));
        assert!(config.dispatcher_workers.is_empty());
        assert_eq!(config.control_routing().routing_key, "bulk_message_application.control");
    }

    #[test]
    fn test_required_vars() {
        assert!(matches!(
            load(&[("METRICS_PREFIX", "go.")]),
            Err(ConfigError::Missing("WORKER_NAME"))
        ));
        assert!(matches!(
            load(&[("WORKER_NAME", "w")]),
            Err(ConfigError::Missing("METRICS_PREFIX"))
        ));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("WORKER_NAME", "w"),
            ("METRICS_PREFIX", "go."),
            ("TRANSPORT_NAME", "sms_transport"),
            ("API_EXCHANGE", "go"),
            ("API_ROUTING_KEY", "go.api"),
            ("APP_EVENT_ROUTING_KEY", "go.event"),
            ("METRICS_INTERVAL_SECS", "30"),
            ("DISPATCHER_WORKERS", "bulk_message_application, survey_application,"),
        ])
        .unwrap();

        assert_eq!(config.transport_name.as_deref(), Some("sms_transport"));
        assert_eq!(config.api_routing.exchange, "go");
        assert_eq!(config.api_routing.routing_key, "go.api");
        assert_eq!(config.app_event_routing.exchange, "go");
        assert_eq!(config.app_event_routing.routing_key, "go.event");
        assert_eq!(config.control_routing().exchange, "go");
        assert_eq!(config.metrics_interval, Duration::from_secs(30));
        assert_eq!(
            config.dispatcher_workers,
            vec!["bulk_message_application", "survey_application"]
        );
    }

    #[test]
    fn test_invalid_interval() {
        let result = load(&[
            ("WORKER_NAME", "w"),
            ("METRICS_PREFIX", "go."),
            ("METRICS_INTERVAL_SECS", "0"),
        ]);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_relay_settings() {
        let config = load(&[("WORKER_NAME", "w"), ("METRICS_PREFIX", "go.")]).unwrap();
        assert_eq!(config.relay_poll_interval, DEFAULT_RELAY_POLL_INTERVAL);
        assert_eq!(config.relay_lease, DEFAULT_RELAY_LEASE);

        let config = load(&[
            ("WORKER_NAME", "w"),
            ("METRICS_PREFIX", "go."),
            ("RELAY_POLL_MS", "50"),
            ("RELAY_LEASE_SECS", "120"),
        ])
        .unwrap();
        assert_eq!(config.relay_poll_interval, Duration::from_millis(50));
        assert_eq!(config.relay_lease, Duration::from_secs(120));

        let result = load(&[("WORKER_NAME", "w"), ("METRICS_PREFIX", "go."), ("RELAY_POLL_MS", "x")]);
        assert!(matches!(result, Err(ConfigError::Invalid { var: "RELAY_POLL_MS", .. })));
    }

    #[test]
    fn test_consumed_queues() {
        let keys = |config: &WorkerConfig| -> Vec<String> {
            config
                .consumed_queues()
                .into_iter()
                .map(|routing| routing.routing_key)
                .collect()
        };

        let config = WorkerConfig::new("w", "go.");
        assert_eq!(keys(&config), vec!["w.control"]);

        let config = config
            .with_transport_name("sms")
            .with_dispatcher_workers(vec!["w".into()]);
        assert_eq!(keys(&config), vec!["w.control", "sms.inbound", "sms.event", "vumi.api"]);
    }

    #[test]
    fn test_conversation_metadata_overrides_defaults() {
        let config = WorkerConfig::new("w", "go.")
            .with_app_default("dedupe", json!(false))
            .with_app_default("greeting", json!("hi"));
        let mut metadata = Map::new();
        metadata.insert("dedupe".into(), json!(true));
        let conv = Conversation {
            key: "c".into(),
            account_key: "acc".into(),
            conversation_type: "bulk_message".into(),
            subject: "s".into(),
            message: "m".into(),
            delivery_class: None,
            delivery_tag_pool: None,
            delivery_tag: None,
            start_timestamp: Utc::now(),
            end_timestamp: None,
            created_at: Utc::now(),
            metadata,
            groups: vec![],
            batches: vec![],
        };

        let conv_config = config.conversation_config(&conv);
        assert!(conv_config.get_bool("dedupe", false));
        assert_eq!(conv_config.get_str("greeting"), Some("hi"));
        assert!(!conv_config.get_bool("missing", false));
    }
}
