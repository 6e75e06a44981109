use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kestrel_dir_core::query::DEFAULT_MAX_FILTER_DEPTH;
use kestrel_dir_core::{AssociationPolicy, DirError, DirResult};

pub const DEFAULT_CONFIG_NAME: &str = "kestrel.json";
pub const DEFAULT_DB_NAME: &str = "kestrel.sqlite";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_page_size: Option<u32>,
    pub query_cache_capacity: Option<usize>,
    pub max_filter_depth: Option<usize>,
    pub lock_timeout_ms: Option<u64>,
}

impl LimitsConfig {
    pub fn with_defaults() -> Self {
        Self {
            max_page_size: Some(1_000),
            query_cache_capacity: Some(256),
            max_filter_depth: Some(DEFAULT_MAX_FILTER_DEPTH),
            lock_timeout_ms: Some(5_000),
        }
    }

    pub fn max_page_size(&self) -> u32 {
        self.max_page_size.unwrap_or(1_000).max(1)
    }

    pub fn query_cache_capacity(&self) -> usize {
        self.query_cache_capacity.unwrap_or(256)
    }

    pub fn max_filter_depth(&self) -> usize {
        self.max_filter_depth.unwrap_or(DEFAULT_MAX_FILTER_DEPTH)
    }
}

/// Pass-through settings of the directory served from this store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub suffix: String,
    pub root_dn: Option<String>,
    pub root_password: Option<String>,
    #[serde(default)]
    pub association_policy: AssociationPolicy,
    /// Extra RFC 4512 definition text appended to the built-in schema.
    #[serde(default)]
    pub schema_extensions: Vec<String>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            suffix: "dc=example,dc=com".to_string(),
            root_dn: Some("cn=admin,dc=example,dc=com".to_string()),
            root_password: None,
            association_policy: AssociationPolicy::TwoWay,
            schema_extensions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    #[serde(default)]
    pub directory: DirectoryConfig,
    pub limits: Option<LimitsConfig>,
}

impl DirConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            directory: DirectoryConfig::default(),
            limits: Some(LimitsConfig::with_defaults()),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.directory.suffix = suffix.into();
        self
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> DirResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| DirError::config(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| DirError::config(format!("read config: {err}")))?;
            let config: DirConfig =
                serde_json::from_str(&raw).map_err(|err| DirError::config(err.to_string()))?;
            return Ok(config);
        }
        let default = DirConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| DirError::config(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| DirError::config(format!("write config: {err}")))?;
        log::info!("wrote default config to {}", config_path.display());
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> DirResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| DEFAULT_DB_NAME.to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(DirError::config("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self) -> Option<&str> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => None,
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Some(url.as_str()),
        }
    }

    pub fn limits(&self) -> LimitsConfig {
        self.limits.clone().unwrap_or_else(LimitsConfig::with_defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_postgres_config() {
        let raw = r#"{
            "database": { "backend": "postgres", "url": "postgres://localhost/dir" },
            "directory": { "suffix": "dc=corp", "association_policy": "one_way" }
        }"#;
        let config: DirConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.backend_name(), "postgres");
        assert_eq!(config.connection_url(), Some("postgres://localhost/dir"));
        assert_eq!(
            config.directory.association_policy,
            AssociationPolicy::OneWay
        );
        assert!(config.directory.schema_extensions.is_empty());
        assert_eq!(config.limits().max_page_size(), 1_000);
    }

    #[test]
    fn relative_sqlite_path_resolves_against_base() {
        let config = DirConfig::default_sqlite("data/dir.sqlite");
        let path = config.sqlite_path(Path::new("/srv/kestrel")).expect("path");
        assert_eq!(path, PathBuf::from("/srv/kestrel/data/dir.sqlite"));
    }
}
