use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;

use crate::models::keys;
use crate::services::log_locator::{DEFAULT_LOG_DIR, DEFAULT_REMOTE_PORT, DEFAULT_REMOTE_TIMEOUT_MS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub lineage: LineageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Dispatcher sizing plus the server-wide default request properties
#[derive(Debug, Clone, Deserialize)]
pub struct LineageConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub target_platform: String,
    pub log_remote: bool,
    pub local_log_dir: String,
    pub remote_log_dir: String,
    #[serde(default)]
    pub remote_host: Option<String>,
    pub remote_port: u16,
    #[serde(default)]
    pub remote_user: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    pub host_key_policy: String,
    #[serde(default)]
    pub known_hosts: Option<String>,
    pub remote_timeout_ms: u64,
    #[serde(default)]
    pub default_catalog_id: Option<i32>,
}

/// Environment variable and config key of each default request property
const PROPERTY_ENV: [(&str, &str); 11] = [
    ("LZ_LINEAGE_LOG_REMOTE", "lineage.log_remote"),
    ("LZ_LINEAGE_LOG_DEFAULT_DIR", "lineage.local_log_dir"),
    ("LZ_REMOTE_LOG_DIR", "lineage.remote_log_dir"),
    ("LZ_REMOTE_MACHINE", "lineage.remote_host"),
    ("LZ_REMOTE_PORT", "lineage.remote_port"),
    ("LZ_REMOTE_USER", "lineage.remote_user"),
    ("LZ_PRIVATE_KEY_LOCATION", "lineage.private_key"),
    ("LZ_REMOTE_HOST_KEY_POLICY", "lineage.host_key_policy"),
    ("LZ_REMOTE_KNOWN_HOSTS", "lineage.known_hosts"),
    ("LZ_REMOTE_TIMEOUT_MS", "lineage.remote_timeout_ms"),
    ("LZ_DEFAULT_HADOOP_DATABASE_ID", "lineage.default_catalog_id"),
];

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("database.url", "./lineage.db")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("logging.level", "info")?
            .set_default("lineage.workers", num_cpus::get() as i64)?
            .set_default("lineage.queue_capacity", 256)?
            .set_default("lineage.target_platform", "hdfs")?
            .set_default("lineage.log_remote", false)?
            .set_default("lineage.local_log_dir", DEFAULT_LOG_DIR)?
            .set_default("lineage.remote_log_dir", DEFAULT_LOG_DIR)?
            .set_default("lineage.remote_port", DEFAULT_REMOTE_PORT as i64)?
            .set_default("lineage.host_key_policy", "permissive")?
            .set_default("lineage.remote_timeout_ms", DEFAULT_REMOTE_TIMEOUT_MS as i64)?;

        if let Ok(database_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", database_url)?;
        }

        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(3000))?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(workers) = env::var("LINEAGE_WORKERS") {
            if let Ok(workers) = workers.parse::<i64>() {
                builder = builder.set_override("lineage.workers", workers)?;
            }
        }

        if let Ok(capacity) = env::var("LINEAGE_QUEUE_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<i64>() {
                builder = builder.set_override("lineage.queue_capacity", capacity)?;
            }
        }

        if let Ok(platform) = env::var("LINEAGE_TARGET_PLATFORM") {
            builder = builder.set_override("lineage.target_platform", platform)?;
        }

        for (var, key) in PROPERTY_ENV {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl LineageConfig {
    /// Request properties applied under every request's own
    pub fn default_properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            properties.insert(key.to_string(), value);
        };

        set(keys::LOG_REMOTE, self.log_remote.to_string());
        set(keys::LOCAL_LOG_DIR, self.local_log_dir.clone());
        set(keys::REMOTE_LOG_DIR, self.remote_log_dir.clone());
        set(keys::REMOTE_PORT, self.remote_port.to_string());
        set(keys::HOST_KEY_POLICY, self.host_key_policy.clone());
        set(keys::REMOTE_TIMEOUT_MS, self.remote_timeout_ms.to_string());

        let optional = [
            (keys::REMOTE_HOST, &self.remote_host),
            (keys::REMOTE_USER, &self.remote_user),
            (keys::PRIVATE_KEY, &self.private_key),
            (keys::KNOWN_HOSTS, &self.known_hosts),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                set(key, value.clone());
            }
        }
        if let Some(catalog_id) = self.default_catalog_id {
            set(keys::DEFAULT_CATALOG_ID, catalog_id.to_string());
        }

        properties
    }
}
