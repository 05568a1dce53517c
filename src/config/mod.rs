use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod logging;

pub use logging::init_tracing;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub reaper: ReaperConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Nested indirection hops allowed before resolution reports a cycle.
    pub max_indirection_depth: usize,
    /// Recursion limit for compare, copy and flatten walks.
    pub max_path_depth: usize,
    pub default_principal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Nodes visited between cooperative yields during the mark phase.
    pub yield_every: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_indirection_depth: 64,
            max_path_depth: 512,
            default_principal: "system".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 10000, ttl_seconds: 300 }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { enabled: true, interval_seconds: 60, yield_every: 1000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "strata=debug,info".to_string(), json: false }
    }
}

impl Config {
    /// Loads `strata.toml` from the working directory if present, then `STRATA_*` variables.
    pub fn load() -> anyhow::Result<Self> {
        Self::build(config::File::with_name("strata").required(false))
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::build(config::File::from(path.as_ref()).required(true))
    }

    fn build<S>(file: S) -> anyhow::Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("STRATA").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.engine.max_indirection_depth, 64);
        assert_eq!(config.engine.max_path_depth, 512);
        assert_eq!(config.engine.default_principal, "system");

        assert_eq!(config.cache.max_entries, 10000);
        assert_eq!(config.cache.ttl_seconds, 300);

        assert!(config.reaper.enabled);
        assert_eq!(config.reaper.interval_seconds, 60);

        assert_eq!(config.logging.filter, "strata=debug,info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_config_deserialization_fills_missing_sections() {
        let json = r#"{
            "engine": { "max_indirection_depth": 8 },
            "reaper": { "enabled": false }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.engine.max_indirection_depth, 8);
        assert_eq!(config.engine.max_path_depth, 512);
        assert!(!config.reaper.enabled);
        assert_eq!(config.reaper.interval_seconds, 60);
        assert_eq!(config.cache.max_entries, 10000);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config);
        assert!(json.is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nmax_indirection_depth = 16\ndefault_principal = \"admin\"\n\n[cache]\nmax_entries = 42"
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.engine.max_indirection_depth, 16);
        assert_eq!(config.engine.default_principal, "admin");
        assert_eq!(config.cache.max_entries, 42);
        assert_eq!(config.cache.ttl_seconds, 300);
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from(dir.path().join("absent.toml")).is_err());
    }
}
