/// Configuration management using figment
///
/// Loads configuration with this precedence (highest wins):
/// 1. Defaults (hardcoded)
/// 2. TOML file: recipe-alchemy.toml (in working directory)
/// 3. Environment variables: prefixed RECIPE_ALCHEMY_ (e.g., RECIPE_ALCHEMY_LOG_LEVEL=debug)

use figment::{
    Figment,
    providers::{Env, Format, Toml, Serialized},
};
use serde::{Deserialize, Serialize};
use crate::errors::RecipeError;

pub const CONFIG_FILE: &str = "recipe-alchemy.toml";
pub const ENV_PREFIX: &str = "RECIPE_ALCHEMY_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database URL. The scheme picks the backend:
    /// sqlite://path for SQLite, postgres://... for PostgreSQL.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Upper bound on pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Echo every SQL statement at debug level
    #[serde(default)]
    pub log_statements: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_url() -> String {
    "sqlite://recipe-alchemy.db".to_string()
}

fn default_max_connections() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            log_statements: false,
        }
    }
}

/// Storage backend selected by the database URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Config {
    /// Load configuration from defaults, TOML file, and environment variables
    ///
    /// Environment variables override TOML file values.
    /// Example: RECIPE_ALCHEMY_DATABASE_URL=postgres://localhost/recipes
    pub fn load() -> Result<Config, RecipeError> {
        Self::figment()
            .extract()
            .map_err(|e| RecipeError::Config(format!("Failed to load config: {}", e)))
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn backend(&self) -> Result<Backend, RecipeError> {
        let url = self.database_url.as_str();
        if url.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Backend::Postgres)
        } else {
            Err(RecipeError::Config(format!(
                "Unsupported database_url scheme in '{}': expected sqlite:// or postgres://",
                url
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.database_url, "sqlite://recipe-alchemy.db");
        assert_eq!(config.max_connections, 10);
        assert!(!config.log_statements);
    }

    #[test]
    fn test_backend_from_scheme() {
        let mut config = Config::default();
        assert_eq!(config.backend().unwrap(), Backend::Sqlite);

        config.database_url = "postgres://localhost/recipes".to_string();
        assert_eq!(config.backend().unwrap(), Backend::Postgres);

        config.database_url = "postgresql://localhost/recipes".to_string();
        assert_eq!(config.backend().unwrap(), Backend::Postgres);

        config.database_url = "mysql://localhost/recipes".to_string();
        assert!(matches!(config.backend(), Err(RecipeError::Config(_))));
    }

    #[test]
    fn test_env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(CONFIG_FILE, "log_level = \"debug\"\nmax_connections = 3")?;
            jail.set_env("RECIPE_ALCHEMY_LOG_LEVEL", "warn");
            jail.set_env("RECIPE_ALCHEMY_LOG_STATEMENTS", "true");

            let config = Config::load().expect("config should load");
            assert_eq!(config.log_level, "warn");
            assert_eq!(config.max_connections, 3);
            assert!(config.log_statements);
            Ok(())
        });
    }

    #[test]
    fn test_unknown_keys_do_not_break_loading() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(CONFIG_FILE, "log_file = \"/tmp/recipes.log\"\nlog_level = \"debug\"")?;

            let config = Config::load().expect("config should load");
            assert_eq!(config.log_level, "debug");
            assert_eq!(config.database_url, "sqlite://recipe-alchemy.db");
            Ok(())
        });
    }
}
