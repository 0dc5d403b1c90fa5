//! Client configuration.
//!
//! Every field has a default, so a JSON config file only needs to name what
//! it changes. Durations are written as milliseconds.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Administrative endpoints, e.g. `http://10.0.0.1:8091`. Tried in order.
    pub bootstrap_urls: Vec<String>,
    pub bucket: String,
    pub password: String,

    /// Wall-clock budget for one operation, retries included.
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub max_retries: u32,
    /// On-demand refreshes a single command may trigger when its partition
    /// has no owner at all.
    pub max_route_refreshes: u32,
    #[serde(with = "millis")]
    pub retry_backoff_base: Duration,
    #[serde(with = "millis")]
    pub retry_backoff_max: Duration,

    /// Background topology polling; `None` refreshes only on demand.
    #[serde(with = "optional_millis")]
    pub topology_poll_interval: Option<Duration>,
    /// Passes over `bootstrap_urls` before a fetch is declared unavailable.
    pub topology_fetch_rounds: u32,
    #[serde(with = "millis")]
    pub topology_fetch_backoff: Duration,

    pub inbound_queue_depth: usize,
    /// Requests queued for one node's socket before senders wait.
    pub max_queued_per_node: usize,
    /// Commands sent to one node and not yet answered. Further commands
    /// for that node wait in the dispatcher.
    pub max_in_flight_per_node: usize,
    /// Commands waiting on busy nodes, across all nodes. Once reached the
    /// dispatcher stops taking submissions and `submit` waits.
    pub max_waiting_commands: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_urls: vec!["http://127.0.0.1:8091".to_string()],
            bucket: "default".to_string(),
            password: String::new(),
            operation_timeout: Duration::from_millis(2500),
            connect_timeout: Duration::from_secs(2),
            max_retries: 64,
            max_route_refreshes: 3,
            retry_backoff_base: Duration::from_millis(2),
            retry_backoff_max: Duration::from_millis(250),
            topology_poll_interval: Some(Duration::from_secs(10)),
            topology_fetch_rounds: 3,
            topology_fetch_backoff: Duration::from_millis(100),
            inbound_queue_depth: 4096,
            max_queued_per_node: 1024,
            max_in_flight_per_node: 1024,
            max_waiting_commands: 4096,
        }
    }
}

impl ClientConfig {
    pub fn new(bootstrap_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            bootstrap_urls: vec![bootstrap_url.into()],
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("read {}: {err}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| Error::Config(format!("parse {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(Error::Config(message.to_string()));
        if self.bucket.is_empty() {
            return fail("bucket name must not be empty");
        }
        if self.operation_timeout.is_zero() {
            return fail("operation_timeout must be positive");
        }
        if self.inbound_queue_depth == 0 || self.max_queued_per_node == 0 {
            return fail("queue depths must be positive");
        }
        if self.max_in_flight_per_node == 0 || self.max_waiting_commands == 0 {
            return fail("in-flight and waiting limits must be positive");
        }
        if self.retry_backoff_base > self.retry_backoff_max {
            return fail("retry_backoff_base exceeds retry_backoff_max");
        }
        if self.topology_poll_interval.is_some_and(|every| every.is_zero()) {
            return fail("topology_poll_interval must be positive when set");
        }
        Ok(())
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_topology_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.topology_poll_interval = interval;
        self
    }

    /// Exponential backoff for the `attempt`-th retry, capped at
    /// `retry_backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.retry_backoff_base
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"bucket": "travel", "operation_timeout": 750, "topology_poll_interval": null}"#,
        )
        .expect("valid json");

        assert_eq!(config.bucket, "travel");
        assert_eq!(config.operation_timeout, Duration::from_millis(750));
        assert_eq!(config.topology_poll_interval, None);
        assert_eq!(config.max_retries, ClientConfig::default().max_retries);
        config.validate().expect("valid config");
    }

    #[test]
    fn validate_rejects_nonsense() {
        let config = ClientConfig {
            bucket: String::new(),
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ClientConfig::default().with_operation_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ClientConfig {
            max_in_flight_per_node: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(2));
        assert_eq!(config.backoff(3), Duration::from_millis(16));
        assert_eq!(config.backoff(40), config.retry_backoff_max);
    }
}
