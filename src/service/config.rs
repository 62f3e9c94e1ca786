// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::identity::new_client_id;
use super::{AppError, AppResult};

/// Application configuration: an arbitrary number of proxies to different
/// Kafka / coordination clusters, keyed by alias.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Proxy used by calls that do not name an alias. When absent the
    /// alphabetically first alias is the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_proxy: Option<String>,
    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Unique id of this proxy instance in both Kafka and the coordination
    /// service. Generated by default; leave it that way unless several
    /// proxies share one process.
    pub client_id: String,
    pub kafka: KafkaConfig,
    pub zoo_keeper: ZooKeeperConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// seed peers used to resolve the cluster topology
    pub seed_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZooKeeperConfig {
    pub seed_peers: Vec<String>,
    /// root path that all group registrations live under
    pub chroot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// capacity of every per topic-partition buffer
    pub channel_buffer_size: usize,
    /// how long shutdown keeps trying to deliver buffered messages
    pub shutdown_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    Oldest,
    Newest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// capacity of every per-partition fetch buffer
    pub channel_buffer_size: usize,
    pub long_polling_timeout_ms: u64,
    /// how long a group/topic subscription survives without consume calls
    pub registration_timeout_ms: u64,
    /// must be less than the registration timeout
    pub ack_timeout_ms: u64,
    pub backoff_timeout_ms: u64,
    pub rebalance_delay_ms: u64,
    pub offsets_commit_interval_ms: u64,
    pub fetch_max_wait_ms: u64,
    /// where to start when a group has no committed offset for a partition
    pub initial_offset: InitialOffset,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            seed_peers: vec!["localhost:9092".to_string()],
        }
    }
}

impl Default for ZooKeeperConfig {
    fn default() -> Self {
        Self {
            seed_peers: vec!["localhost:2181".to_string()],
            chroot: String::new(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 4096,
            shutdown_timeout_ms: 30_000,
            max_retries: 5,
            retry_backoff_ms: 100,
            max_batch_size: 256,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 64,
            long_polling_timeout_ms: 3_000,
            registration_timeout_ms: 20_000,
            ack_timeout_ms: 15_000,
            backoff_timeout_ms: 500,
            rebalance_delay_ms: 250,
            offsets_commit_interval_ms: 500,
            fetch_max_wait_ms: 250,
            initial_offset: InitialOffset::Newest,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::with_client_id(new_client_id())
    }
}

impl ProducerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl ConsumerConfig {
    pub fn long_polling_timeout(&self) -> Duration {
        Duration::from_millis(self.long_polling_timeout_ms)
    }
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
    pub fn backoff_timeout(&self) -> Duration {
        Duration::from_millis(self.backoff_timeout_ms)
    }
    pub fn rebalance_delay(&self) -> Duration {
        Duration::from_millis(self.rebalance_delay_ms)
    }
    pub fn offsets_commit_interval(&self) -> Duration {
        Duration::from_millis(self.offsets_commit_interval_ms)
    }
    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }
}

impl ProxyConfig {
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            kafka: KafkaConfig::default(),
            zoo_keeper: ZooKeeperConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        let producer = &self.producer;
        let consumer = &self.consumer;
        let checks = [
            (self.client_id.is_empty(), "client_id must not be empty"),
            (self.kafka.seed_peers.is_empty(), "kafka.seed_peers must not be empty"),
            (
                self.zoo_keeper.seed_peers.is_empty(),
                "zoo_keeper.seed_peers must not be empty",
            ),
            (
                producer.channel_buffer_size == 0,
                "producer.channel_buffer_size must be > 0",
            ),
            (
                producer.max_batch_size == 0,
                "producer.max_batch_size must be > 0",
            ),
            (
                consumer.channel_buffer_size == 0,
                "consumer.channel_buffer_size must be > 0",
            ),
            (
                consumer.long_polling_timeout_ms == 0,
                "consumer.long_polling_timeout_ms must be > 0",
            ),
            (
                consumer.registration_timeout_ms == 0,
                "consumer.registration_timeout_ms must be > 0",
            ),
            (
                consumer.ack_timeout_ms >= consumer.registration_timeout_ms,
                "consumer.ack_timeout_ms must be < consumer.registration_timeout_ms",
            ),
            (
                consumer.backoff_timeout_ms == 0,
                "consumer.backoff_timeout_ms must be > 0",
            ),
            (
                consumer.rebalance_delay_ms == 0,
                "consumer.rebalance_delay_ms must be > 0",
            ),
            (
                consumer.offsets_commit_interval_ms == 0,
                "consumer.offsets_commit_interval_ms must be > 0",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(AppError::InvalidConfig(msg.to_string())),
            None => Ok(()),
        }
    }
}

impl AppConfig {
    /// Config holding a single default proxy under `alias`.
    pub fn with_default_proxy(alias: impl Into<String>, proxy: ProxyConfig) -> Self {
        let alias = alias.into();
        let mut proxies = BTreeMap::new();
        proxies.insert(alias.clone(), proxy);
        Self {
            default_proxy: Some(alias),
            proxies,
        }
    }

    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        Self::build(File::with_name(path_str))
    }

    pub fn from_yaml(data: &str) -> AppResult<AppConfig> {
        Self::build(File::from_str(data, FileFormat::Yaml))
    }

    /// Every proxy section is laid over a default proxy config, so only the
    /// fields present in the file override defaults. All proxies share one
    /// generated client id unless they set their own.
    fn build<S>(source: S) -> AppResult<AppConfig>
    where
        S: config::Source + Clone + Send + Sync + 'static,
    {
        let raw = config::Config::builder()
            .add_source(source.clone())
            .build()?;
        let aliases: Vec<String> = raw
            .get_table("proxies")
            .map(|table| table.into_keys().collect())
            .unwrap_or_default();

        let client_id = new_client_id();
        let defaults = AppConfig {
            default_proxy: None,
            proxies: aliases
                .iter()
                .map(|alias| (alias.clone(), ProxyConfig::with_client_id(&client_id)))
                .collect(),
        };

        let merged = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(source)
            .build()?;
        let app_config: AppConfig = merged.try_deserialize()?;
        app_config.validate()?;
        debug!("loaded config for proxies: {:?}", aliases);
        Ok(app_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.proxies.is_empty() {
            return Err(AppError::InvalidConfig(
                "at least one proxy must be configured".to_string(),
            ));
        }
        if let Some(alias) = &self.default_proxy {
            if !self.proxies.contains_key(alias) {
                return Err(AppError::InvalidConfig(format!(
                    "default_proxy {} is not configured",
                    alias
                )));
            }
        }
        for (alias, proxy) in &self.proxies {
            proxy.validate().map_err(|err| match err {
                AppError::InvalidConfig(msg) => {
                    AppError::InvalidConfig(format!("proxy={}: {}", alias, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// `default_proxy`, or else the alphabetically first alias. Aliases are
    /// kept sorted, so the order proxies are listed in the file plays no part;
    /// name `default_proxy` to pick one explicitly.
    pub fn default_alias(&self) -> Option<&str> {
        self.default_proxy
            .as_deref()
            .or_else(|| self.proxies.keys().next().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let proxy = ProxyConfig::with_client_id("pixy_test");
        proxy.validate().unwrap();
        assert_eq!(proxy.consumer.long_polling_timeout(), Duration::from_secs(3));
        assert_eq!(proxy.producer.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(proxy.consumer.initial_offset, InitialOffset::Newest);
    }

    #[test]
    fn test_overlay_keeps_defaults() {
        let yaml = r#"
proxies:
  prod:
    kafka:
      seed_peers: ["k1:9092", "k2:9092"]
    consumer:
      long_polling_timeout_ms: 1000
      initial_offset: oldest
"#;
        let app = AppConfig::from_yaml(yaml).unwrap();
        let prod = &app.proxies["prod"];
        assert_eq!(prod.kafka.seed_peers, vec!["k1:9092", "k2:9092"]);
        assert_eq!(prod.consumer.long_polling_timeout_ms, 1000);
        assert_eq!(prod.consumer.initial_offset, InitialOffset::Oldest);
        // untouched fields keep their defaults
        assert_eq!(prod.consumer.registration_timeout_ms, 20_000);
        assert_eq!(prod.producer.channel_buffer_size, 4096);
        assert_eq!(prod.zoo_keeper.seed_peers, vec!["localhost:2181"]);
        assert!(prod.client_id.starts_with("pixy_"));
        assert_eq!(app.default_alias(), Some("prod"));
    }

    #[test]
    fn test_proxies_share_generated_client_id() {
        let yaml = r#"
default_proxy: b
proxies:
  a:
    zoo_keeper:
      chroot: /a
  b:
    client_id: explicit
"#;
        let app = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(app.default_alias(), Some("b"));
        assert_eq!(app.proxies["a"].zoo_keeper.chroot, "/a");
        assert_eq!(app.proxies["b"].client_id, "explicit");
        assert!(app.proxies["a"].client_id.starts_with("pixy_"));
    }

    #[test]
    fn test_default_alias_falls_back_to_first_in_sort_order() {
        let yaml = r#"
proxies:
  zeta:
    client_id: z
  alpha:
    client_id: a
"#;
        let app = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(app.default_alias(), Some("alpha"));
        assert_eq!(app.proxies.keys().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
    }

    #[rstest]
    #[case("consumer:\n      ack_timeout_ms: 20000", "ack_timeout_ms")]
    #[case("consumer:\n      channel_buffer_size: 0", "consumer.channel_buffer_size")]
    #[case("producer:\n      channel_buffer_size: 0", "producer.channel_buffer_size")]
    #[case("consumer:\n      rebalance_delay_ms: 0", "rebalance_delay_ms")]
    #[case("consumer:\n      offsets_commit_interval_ms: 0", "offsets_commit_interval_ms")]
    fn test_invalid_proxy_config(#[case] section: &str, #[case] expected: &str) {
        let yaml = format!("proxies:\n  prod:\n    {}\n", section);
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)), "{:?}", err);
        assert!(err.to_string().contains(expected), "{}", err);
    }

    #[test]
    fn test_no_proxies_rejected() {
        let err = AppConfig::from_yaml("default_proxy: x\n").unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_default_proxy_rejected() {
        let yaml = "default_proxy: missing\nproxies:\n  prod:\n    client_id: a\n";
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
