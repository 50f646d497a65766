use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub userdb: UserDbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    #[serde(deserialize_with = "deserialize_u16_from_any")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            db_path: "data/dbchat.sqlite3".to_string(),
            postgres: PostgresConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresConfig {
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub connect_timeout_s: u64,
    #[serde(default)]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub redis_url: String,
    pub name: String,
    pub worker_concurrency: usize,
    /// Per-job handler attempts before the job is dead-lettered.
    pub job_attempts: u32,
    /// Base for the exponential per-job retry backoff, in milliseconds.
    pub job_backoff_ms: u64,
    /// Enqueue attempts before add_job gives up.
    pub enqueue_retries: u32,
    /// Linear backoff step between enqueue attempts, in milliseconds.
    pub enqueue_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            name: "dbchat-jobs".to_string(),
            worker_concurrency: 5,
            job_attempts: 3,
            job_backoff_ms: 1000,
            enqueue_retries: 3,
            enqueue_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_s: u64,
    /// Row limit suggested to the model for generated queries.
    pub top_k: u32,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            api_key: String::new(),
            model: "qwen2.5-coder:14b".to_string(),
            temperature: 0.1,
            max_output_tokens: 2048,
            timeout_s: 120,
            top_k: 50,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserDbConfig {
    pub connect_timeout_s: u64,
    pub sweep_interval_s: u64,
    pub idle_timeout_s: u64,
}

impl Default for UserDbConfig {
    fn default() -> Self {
        Self {
            connect_timeout_s: 30,
            sweep_interval_s: 60,
            idle_timeout_s: 300,
        }
    }
}

pub fn load_config() -> Config {
    let path = env::var("DBCHAT_CONFIG_PATH").unwrap_or_else(|_| "config/dbchat.yaml".to_string());
    let mut config = if Path::new(&path).exists() {
        match fs::read_to_string(&path) {
            Ok(raw) => serde_yaml::from_str::<Config>(&raw).unwrap_or_else(|err| {
                warn!("failed to parse config {path}: {err}; using defaults");
                Config::default()
            }),
            Err(err) => {
                warn!("failed to read config {path}: {err}; using defaults");
                Config::default()
            }
        }
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    config
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(host) = env_value("DBCHAT_HOST") {
        config.server.host = host;
    }
    if let Some(port) = env_value("DBCHAT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.server.port = port;
    }
    if let Some(url) = env_value("DBCHAT_REDIS_URL") {
        config.queue.redis_url = url;
    }
    if let Some(key) = env_value("DBCHAT_GENERATOR_API_KEY") {
        config.generator.api_key = key;
    }
    if let Some(dsn) = env_value("DBCHAT_STORAGE_DSN") {
        config.storage.postgres.dsn = dsn;
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("u16 must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("u16 string is empty"));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.queue.worker_concurrency, 5);
        assert_eq!(config.queue.job_attempts, 3);
        assert_eq!(config.generator.top_k, 50);
        assert_eq!(config.generator.retry.max_attempts, 2);
        assert_eq!(config.userdb.connect_timeout_s, 30);
        assert_eq!(config.userdb.idle_timeout_s, 300);
    }

    #[test]
    fn parses_port_from_string() {
        let raw = "server:\n  host: 127.0.0.1\n  port: \"9001\"\n";
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9001);
    }

    #[test]
    fn partial_yaml_keeps_section_defaults() {
        let raw = "queue:\n  redis_url: redis://queue:6379\n";
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.queue.redis_url, "redis://queue:6379");
        assert_eq!(config.queue.worker_concurrency, 5);
        assert_eq!(config.storage.backend, "sqlite");
    }
}
