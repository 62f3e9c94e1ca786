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
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::coordination::{CoordinationClient, MemoryEnsemble};
use crate::kafka::{KafkaClient, MemoryCluster};
use crate::service::{AppConfig, Proxy, ProxyConfig};
use crate::{AppError, AppResult};

/// Partition count of topics created on first use in standalone mode.
pub const STANDALONE_PARTITIONS: usize = 4;

/// Every configured proxy, addressable by alias.
#[derive(Debug)]
pub struct App {
    proxies: BTreeMap<String, Arc<Proxy>>,
    default_alias: String,
}

impl App {
    /// Starts one proxy per configured alias with the clients `connect`
    /// returns for it.
    pub fn start<F>(config: AppConfig, mut connect: F) -> AppResult<App>
    where
        F: FnMut(&str, &ProxyConfig) -> (Arc<dyn KafkaClient>, Arc<dyn CoordinationClient>),
    {
        config.validate()?;
        let default_alias = config
            .default_alias()
            .map(str::to_string)
            .ok_or_else(|| AppError::InvalidConfig("no default proxy".to_string()))?;

        let mut proxies = BTreeMap::new();
        for (alias, proxy_config) in config.proxies {
            let (kafka, coordination) = connect(&alias, &proxy_config);
            let proxy = Proxy::start(proxy_config, kafka, coordination)?;
            info!("proxy {} is {}", alias, proxy.client_id());
            proxies.insert(alias, Arc::new(proxy));
        }
        Ok(App {
            proxies,
            default_alias,
        })
    }

    /// Every proxy runs against its own in-process cluster and coordination
    /// ensemble.
    pub fn start_standalone(config: AppConfig) -> AppResult<App> {
        Self::start(config, |_, _| {
            let kafka: Arc<dyn KafkaClient> =
                Arc::new(MemoryCluster::with_auto_create(STANDALONE_PARTITIONS));
            let coordination: Arc<dyn CoordinationClient> =
                Arc::new(MemoryEnsemble::new().connect());
            (kafka, coordination)
        })
    }

    /// The proxy registered under `alias`, or the default one.
    pub fn proxy(&self, alias: Option<&str>) -> AppResult<Arc<Proxy>> {
        let alias = alias.unwrap_or(&self.default_alias);
        self.proxies
            .get(alias)
            .cloned()
            .ok_or_else(|| AppError::UnknownProxy(alias.to_string()))
    }

    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.proxies.keys().map(String::as_str)
    }

    /// Shuts all proxies down concurrently.
    pub async fn shutdown(&self) {
        let mut shutdowns = JoinSet::new();
        for proxy in self.proxies.values() {
            let proxy = proxy.clone();
            shutdowns.spawn(async move { proxy.shutdown().await });
        }
        while let Some(joined) = shutdowns.join_next().await {
            if let Err(e) = joined {
                error!("proxy shutdown failed: {}", e);
            }
        }
        info!("all proxies stopped");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn two_proxies() -> AppConfig {
        let mut config = AppConfig::with_default_proxy("b", ProxyConfig::with_client_id("pixy_b"));
        config
            .proxies
            .insert("a".to_string(), ProxyConfig::with_client_id("pixy_a"));
        config
    }

    #[tokio::test]
    async fn test_proxies_by_alias() {
        let app = App::start_standalone(two_proxies()).unwrap();
        assert_eq!(app.aliases().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(app.default_alias(), "b");
        assert_eq!(app.proxy(None).unwrap().client_id(), "pixy_b");
        assert_eq!(app.proxy(Some("a")).unwrap().client_id(), "pixy_a");
        assert!(matches!(
            app.proxy(Some("c")),
            Err(AppError::UnknownProxy(_))
        ));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_standalone_proxies_are_isolated() {
        let app = App::start_standalone(two_proxies()).unwrap();
        let a = app.proxy(Some("a")).unwrap();
        let b = app.proxy(Some("b")).unwrap();
        a.produce("events", None, Bytes::from_static(b"m"))
            .await
            .unwrap();
        assert_eq!(a.topic_partitions("events").await.unwrap().len(), STANDALONE_PARTITIONS);
        assert_eq!(a.list_topics().await.unwrap(), vec!["events"]);
        assert!(b.list_topics().await.unwrap().is_empty());
        app.shutdown().await;
    }

    #[test]
    fn test_invalid_config_fails_start() {
        let mut config = two_proxies();
        config.default_proxy = Some("missing".to_string());
        assert!(matches!(
            App::start(config, |_, _| unreachable!()),
            Err(AppError::InvalidConfig(_))
        ));
    }
}
