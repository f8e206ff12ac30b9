use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkbenchConfig {
    /// Whether successful query results are cached per session.
    pub cache_enabled: bool,
    /// Time-to-live for cached query results, in milliseconds. Zero keeps
    /// entries until explicitly invalidated.
    pub cache_ttl_ms: u64,
    /// Engine extensions loaded on every new pooled connection, in order.
    pub extensions: Vec<String>,
    /// Session pragmas applied after extensions on every new connection.
    pub pragmas: Vec<String>,
    /// Statements executed once when the engine process starts.
    pub init_sql: Vec<String>,
    /// Idle connections older than this are evicted from the pool, in
    /// milliseconds. Zero disables eviction.
    pub idle_ttl_ms: u64,
    /// Maximum number of autocomplete suggestions returned per request.
    pub suggest_limit: usize,
    /// Number of recent query records retained in the metrics ring.
    pub history_size: usize,
}

impl Default for WorkbenchConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_ms: 60_000,
            extensions: Vec::new(),
            pragmas: Vec::new(),
            init_sql: Vec::new(),
            idle_ttl_ms: 300_000,
            suggest_limit: 40,
            history_size: 200,
        }
    }
}

impl WorkbenchConfig {
    /// Load configuration from defaults, an optional file named by
    /// `SQLDECK_CONFIG`, and `SQLDECK_`-prefixed environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = std::env::var("SQLDECK_CONFIG").ok();
        Self::load_layered(config_path.as_deref())
    }

    fn load_layered(config_path: Option<&str>) -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let mut builder = config::Config::builder().add_source(
            config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
        );
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("SQLDECK"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: WorkbenchConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Extension names are spliced into LOAD statements verbatim.
        for ext in &self.extensions {
            let well_formed = !ext.is_empty()
                && ext
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !well_formed {
                anyhow::bail!("invalid extension name: {ext:?}");
            }
        }
        if self.suggest_limit == 0 {
            anyhow::bail!("suggest_limit must be greater than 0");
        }
        if self.history_size == 0 {
            anyhow::bail!("history_size must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = WorkbenchConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.cache_enabled);
        assert_eq!(config.cache_ttl_ms, 60_000);
    }

    #[test]
    fn extension_names_are_checked() {
        let mut config = WorkbenchConfig::default();
        config.extensions = vec!["httpfs".to_string()];
        assert!(config.validate().is_ok());

        config.extensions = vec!["httpfs; DROP TABLE x".to_string()];
        assert!(config.validate().is_err());

        config.extensions = vec![String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = WorkbenchConfig::default();
        config.suggest_limit = 0;
        assert!(config.validate().is_err());

        let mut config = WorkbenchConfig::default();
        config.history_size = 0;
        assert!(config.validate().is_err());
    }
}
