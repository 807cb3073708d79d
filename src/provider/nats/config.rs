//! NATS provider configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Connection and stream settings for the NATS broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL (e.g. `nats://127.0.0.1:4222`)
    pub url: String,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Prefix for every JetStream stream the service creates
    pub stream_prefix: String,

    pub storage: StorageType,

    /// Maximum message age kept by the streams; 0 keeps forever
    pub max_age_secs: u64,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,

    /// Idle time after which an unused topic-bound consumer is removed
    pub topic_consumer_ttl_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            stream_prefix: "AUDIT".to_string(),
            storage: StorageType::File,
            max_age_secs: 7 * 24 * 3600,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            topic_consumer_ttl_secs: 3600,
        }
    }
}

impl NatsConfig {
    /// Stream holding a durable queue
    pub fn queue_stream(&self, queue: &str) -> String {
        format!("{}_{}", self.stream_prefix, stream_token(queue))
    }

    /// Stream holding everything published to a topic exchange
    pub fn exchange_stream(&self, exchange: &str) -> String {
        format!("{}_{}", self.stream_prefix, stream_token(exchange))
    }

    /// Subject a routing key is published on
    pub fn exchange_subject(&self, exchange: &str, routing_key: &str) -> String {
        format!("{}.{}", exchange, routing_key)
    }

    /// Consumer filter for a binding pattern (`#` becomes `>`)
    pub fn binding_filter(&self, exchange: &str, pattern: &str) -> String {
        let pattern = pattern
            .split('.')
            .map(|t| if t == "#" { ">" } else { t })
            .collect::<Vec<_>>()
            .join(".");
        format!("{}.{}", exchange, pattern)
    }
}

/// Uppercase a name into a valid stream-name token
fn stream_token(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Make a name valid as a durable consumer name
pub(crate) fn consumer_name(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '.' | '*' | '>' | ' ') { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names() {
        let config = NatsConfig::default();
        assert_eq!(config.queue_stream("audit_event"), "AUDIT_AUDIT_EVENT");
        assert_eq!(config.exchange_stream("quote.broadcast"), "AUDIT_QUOTE_BROADCAST");
    }

    #[test]
    fn test_binding_filter() {
        let config = NatsConfig::default();
        assert_eq!(
            config.binding_filter("quote_broadcast", "*.fresh"),
            "quote_broadcast.*.fresh"
        );
        assert_eq!(config.binding_filter("x", "a.#"), "x.a.>");
        assert_eq!(config.exchange_subject("x", "ABC.fresh"), "x.ABC.fresh");
    }

    #[test]
    fn test_consumer_name() {
        assert_eq!(consumer_name("quote.logger*1"), "quote_logger_1");
    }

    #[test]
    fn test_config_deserialize_partial() {
        let config: NatsConfig =
            toml::from_str("url = \"nats://nats:4222\"\nstorage = \"memory\"").unwrap();
        assert_eq!(config.url, "nats://nats:4222");
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.stream_prefix, "AUDIT");
    }
}
