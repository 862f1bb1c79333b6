use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use strand_adapter::AdapterConfig;
use strand_core::OriginId;
use strand_log::Retention;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    Unbounded,
    Capped,
    Ttl,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    /// Simulated processes sharing the log.
    pub nodes: usize,
    pub namespace: String,
    /// Prefix for process uids; the node index is appended.
    pub uid_prefix: String,
    #[serde(with = "humantime_serde")]
    pub requests_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    pub retention: RetentionMode,
    pub max_records: usize,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub recovery: bool,
    #[serde(deserialize_with = "deserialize_list")]
    pub rooms: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_log_interval: Duration,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(|c| c == ',' || c == ';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

impl NodeConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("nodes", 3)?
            .set_default("namespace", "/")?
            .set_default("uid_prefix", "node")?
            .set_default("requests_timeout", "5s")?
            .set_default("heartbeat_interval", "5s")?
            .set_default("heartbeat_timeout", "10s")?
            .set_default("retention", "capped")?
            .set_default("max_records", 10_000)?
            .set_default("ttl", "1h")?
            .set_default("recovery", true)?
            .set_default("rooms", vec!["lobby".to_string()])?
            .set_default("tick_interval", "2s")?
            .set_default("health_log_interval", "30s")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the STRAND_ environment source below
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("STRAND").try_parsing(true));

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes == 0 {
            return Err(ConfigError::Message("nodes must be at least 1".into()));
        }
        if !self.namespace.starts_with('/') {
            return Err(ConfigError::Message("namespace must start with '/'".into()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Message(
                "heartbeat_timeout must exceed heartbeat_interval".into(),
            ));
        }
        Ok(())
    }

    pub fn log_retention(&self) -> Retention {
        match self.retention {
            RetentionMode::Unbounded => Retention::Unbounded,
            RetentionMode::Capped => Retention::Capped {
                max_records: self.max_records,
            },
            RetentionMode::Ttl => Retention::Ttl { ttl: self.ttl },
        }
    }

    pub fn adapter_config(&self, index: usize) -> AdapterConfig {
        AdapterConfig::default()
            .with_uid(OriginId::new(format!("{}-{index}", self.uid_prefix)))
            .with_requests_timeout(self.requests_timeout)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_heartbeat_timeout(self.heartbeat_timeout)
            .with_created_at_field(self.retention == RetentionMode::Ttl)
    }
}
