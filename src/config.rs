// Configuration for the indexer
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority) -- this is how per-domain keys
//    are actually supplied in production, and the only source for secrets.
// 2. A TOML config file (~/.config/indexer/config.toml) for global, non-secret
//    defaults (buffer thresholds, step-day size, concurrency).
// 3. Built-in defaults.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Global (non-domain-scoped) configuration keys from spec.md §6.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub solr_url: String,
    pub db_func_get_event_notification_buffer: String,
    pub db_func_clean_event_notification_buffer: String,
    pub db_func_get_index_override: String,
    pub db_func_clean_index_override: String,
    pub db_field_index_override_source_ts: String,
    pub db_field_index_override_target_ts: String,
    pub idx_override_timestep_day_size: i64,
    pub idx_override_concurrent_thread_count: usize,
    pub idx_buffer_retry_seconds: u64,
    pub idx_event_fetch_key: String,

    pub database_name: String,
    pub database_host: String,
    pub database_port: u16,
    pub database_schema: String,

    pub logging_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            solr_url: "http://localhost:8983/solr".to_string(),
            db_func_get_event_notification_buffer: "get_event_notification_buffer".to_string(),
            db_func_clean_event_notification_buffer: "clean_event_notification_buffer"
                .to_string(),
            db_func_get_index_override: "get_index_override".to_string(),
            db_func_clean_index_override: "clean_index_override".to_string(),
            db_field_index_override_source_ts: "source_ts".to_string(),
            db_field_index_override_target_ts: "target_ts".to_string(),
            idx_override_timestep_day_size: 7,
            idx_override_concurrent_thread_count: 4,
            idx_buffer_retry_seconds: 10,
            idx_event_fetch_key: "event_fetch_key".to_string(),

            database_name: "postgres".to_string(),
            database_host: "localhost".to_string(),
            database_port: 5432,
            database_schema: "public".to_string(),

            logging_level: "info".to_string(),
        }
    }
}

/// Per-domain configuration bound via suffixing a global key with the
/// uppercase domain token, per spec.md §3/§6.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub domain: String,
    pub channel_name: String,
    pub get_all_procedure: String,
    pub get_by_id_procedure: String,
    pub fetch_key: String,
    pub collection_name: String,
    pub buffer_size: usize,
    pub buffer_duration_seconds: u64,
}

/// Secrets, read from environment only -- never from the TOML file, never
/// logged unredacted.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub database_user: String,
    pub database_password: String,
    pub solr_user: Option<String>,
    pub solr_password: Option<String>,
}

impl Secrets {
    fn from_env() -> Self {
        Self {
            database_user: env::var("DATABASE_USER").unwrap_or_default(),
            database_password: env::var("DATABASE_PASSWORD").unwrap_or_default(),
            solr_user: env::var("SOLR_USER").ok(),
            solr_password: env::var("SOLR_PASSWORD").ok(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("domain not specified: pass -d/--domain or set DOMAIN")]
    MissingDomain,
    #[error("missing configuration key {0} for domain {1}")]
    MissingKey(&'static str, String),
}

pub struct Config {
    pub global: GlobalConfig,
    pub secrets: Secrets,
    /// Raw environment snapshot used to resolve per-domain suffixed keys.
    env_overrides: HashMap<String, String>,
}

impl Config {
    /// Default path to the config file: `~/.config/indexer/config.toml`,
    /// overridable with `INDEXER_CONFIG_PATH`.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(p) = env::var("INDEXER_CONFIG_PATH") {
            return Some(PathBuf::from(p));
        }
        dirs::config_dir().map(|d| d.join("indexer").join("config.toml"))
    }

    /// Load configuration: file defaults, overlaid with environment
    /// variables, per the precedence documented at the top of this module.
    pub fn from_env() -> Self {
        let mut global = Self::config_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|text| toml::from_str::<GlobalConfig>(&text).ok())
            .unwrap_or_default();

        if let Ok(v) = env::var("SOLR_URL") {
            global.solr_url = v;
        }
        if let Ok(v) = env::var("DB_FUNC_GET_EVENT_NOTIFICATION_BUFFER") {
            global.db_func_get_event_notification_buffer = v;
        }
        if let Ok(v) = env::var("DB_FUNC_CLEAN_EVENT_NOTIFICATION_BUFFER") {
            global.db_func_clean_event_notification_buffer = v;
        }
        if let Ok(v) = env::var("DB_FUNC_GET_INDEX_OVERRIDE") {
            global.db_func_get_index_override = v;
        }
        if let Ok(v) = env::var("DB_FUNC_CLEAN_INDEX_OVERRIDE") {
            global.db_func_clean_index_override = v;
        }
        if let Ok(v) = env::var("DB_FIELD_INDEX_OVERRIDE_SOURCE_TS") {
            global.db_field_index_override_source_ts = v;
        }
        if let Ok(v) = env::var("DB_FIELD_INDEX_OVERRIDE_TARGET_TS") {
            global.db_field_index_override_target_ts = v;
        }
        if let Ok(v) = env::var("IDX_OVERRIDE_TIMESTEP_DAY_SIZE") {
            if let Ok(n) = v.parse() {
                global.idx_override_timestep_day_size = n;
            }
        }
        if let Ok(v) = env::var("IDX_OVERRIDE_CONCURRENT_THREAD_COUNT") {
            if let Ok(n) = v.parse() {
                global.idx_override_concurrent_thread_count = n;
            }
        }
        if let Ok(v) = env::var("IDX_BUFFER_RETRY_SECONDS") {
            if let Ok(n) = v.parse() {
                global.idx_buffer_retry_seconds = n;
            }
        }
        if let Ok(v) = env::var("IDX_EVENT_FETCH_KEY") {
            global.idx_event_fetch_key = v;
        }
        if let Ok(v) = env::var("DATABASE_NAME") {
            global.database_name = v;
        }
        if let Ok(v) = env::var("DATABASE_HOST") {
            global.database_host = v;
        }
        if let Ok(v) = env::var("DATABASE_PORT") {
            if let Ok(n) = v.parse() {
                global.database_port = n;
            }
        }
        if let Ok(v) = env::var("DATABASE_SCHEMA") {
            global.database_schema = v;
        }
        if let Ok(v) = env::var("RUST_LOG_LEVEL") {
            global.logging_level = v;
        }

        Self {
            global,
            secrets: Secrets::from_env(),
            env_overrides: env::vars().collect(),
        }
    }

    fn env_key(&self, suffix: &str, domain: &str) -> Option<String> {
        self.env_overrides
            .get(&format!("{suffix}_{domain}"))
            .cloned()
    }

    /// Resolve the domain token from the `-d` flag or `DOMAIN` env var,
    /// uppercasing and stripping stray quotes per spec.md §6/§8.
    pub fn resolve_domain(flag: Option<String>) -> Result<String, ConfigError> {
        let raw = env::var("DOMAIN").ok().or(flag).ok_or(ConfigError::MissingDomain)?;
        let cleaned = raw.trim().trim_matches('\'').trim_matches('"').to_uppercase();
        if cleaned.is_empty() {
            return Err(ConfigError::MissingDomain);
        }
        Ok(cleaned)
    }

    /// Bind the per-domain configuration set (spec.md §3).
    pub fn bind_domain(&self, domain: &str) -> Result<DomainConfig, ConfigError> {
        let get = |suffix: &'static str| -> Result<String, ConfigError> {
            self.env_key(suffix, domain)
                .ok_or_else(|| ConfigError::MissingKey(suffix, domain.to_string()))
        };

        let buffer_size: usize = get("IDX_BUFFER_SIZE")?
            .parse()
            .map_err(|_| ConfigError::MissingKey("IDX_BUFFER_SIZE", domain.to_string()))?;
        let buffer_duration_seconds: u64 = get("IDX_BUFFER_DURATION")?
            .parse()
            .map_err(|_| ConfigError::MissingKey("IDX_BUFFER_DURATION", domain.to_string()))?;

        Ok(DomainConfig {
            domain: domain.to_string(),
            channel_name: get("DB_CHANNEL")?,
            get_all_procedure: get("DB_FUNC_GET")?,
            get_by_id_procedure: get("DB_FUNC_GET_BY_ID")?,
            fetch_key: get("IDX_FETCH_KEY")?,
            collection_name: get("SOLR_COLLECTION")?,
            buffer_size,
            buffer_duration_seconds,
        })
    }

    /// Render the resolved configuration for `indexer config --show`, with
    /// secrets redacted.
    pub fn describe(&self, domain: &DomainConfig) -> String {
        format!(
            "domain: {}\n\
             channel_name: {}\n\
             get_all_procedure: {}\n\
             get_by_id_procedure: {}\n\
             fetch_key: {}\n\
             collection_name: {}\n\
             buffer_size: {}\n\
             buffer_duration_seconds: {}\n\
             solr_url: {}\n\
             database: {}@{}:{}/{} (user: ***, password: ***)",
            domain.domain,
            domain.channel_name,
            domain.get_all_procedure,
            domain.get_by_id_procedure,
            domain.fetch_key,
            domain.collection_name,
            domain.buffer_size,
            domain.buffer_duration_seconds,
            self.global.solr_url,
            self.global.database_name,
            self.global.database_host,
            self.global.database_port,
            self.global.database_schema,
        )
    }
}
