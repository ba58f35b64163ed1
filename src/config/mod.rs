/// Configuration management for the procflow engine
///
/// Handles server configuration, database location, engine limits and diagram
/// rendering. Every value can be overridden through `PROCFLOW_*` environment
/// variables; the struct is passed explicitly to whatever needs it.

use crate::runtime::expression::ExpressionLimits;
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Execution engine limits
    pub engine: EngineConfig,
    /// Diagram rendering
    pub diagram: DiagramConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite storage for deployments and history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the database file (default: "data")
    pub data_dir: String,
    /// sqlx connection url, e.g. "sqlite://data/procflow.db" or "sqlite::memory:"
    pub url: String,
}

impl DatabaseConfig {
    /// In-memory databases need no data directory
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on nodes entered by a single start/complete call
    pub max_advance_steps: usize,
    /// Lua instruction budget for one condition or assignee expression
    pub expression_max_instructions: u64,
    /// Memory cap for one expression sandbox, in bytes
    pub expression_max_memory_bytes: usize,
}

impl EngineConfig {
    pub fn expression_limits(&self) -> ExpressionLimits {
        ExpressionLimits {
            max_instructions: self.expression_max_instructions,
            max_memory_bytes: self.expression_max_memory_bytes,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let limits = ExpressionLimits::default();
        Self {
            max_advance_steps: DEFAULT_MAX_ADVANCE_STEPS,
            expression_max_instructions: limits.max_instructions,
            expression_max_memory_bytes: limits.max_memory_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramConfig {
    /// Font family used for labels in rendered diagrams
    pub font_family: String,
}

const DEFAULT_MAX_ADVANCE_STEPS: usize = 10_000;

fn positive_env<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .filter(|value| *value > T::default())
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let data_dir = std::env::var("PROCFLOW_DATA_DIR").unwrap_or_else(|_| "data".to_string());
        let url = std::env::var("PROCFLOW_DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/procflow.db", data_dir));

        let limits = ExpressionLimits::default();

        Self {
            server: ServerConfig {
                host: std::env::var("PROCFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("PROCFLOW_PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .unwrap_or(8080),
            },
            database: DatabaseConfig { data_dir, url },
            engine: EngineConfig {
                max_advance_steps: positive_env("PROCFLOW_MAX_ADVANCE_STEPS")
                    .unwrap_or(DEFAULT_MAX_ADVANCE_STEPS),
                expression_max_instructions: positive_env("PROCFLOW_EXPRESSION_MAX_INSTRUCTIONS")
                    .unwrap_or(limits.max_instructions),
                expression_max_memory_bytes: positive_env("PROCFLOW_EXPRESSION_MAX_MEMORY")
                    .unwrap_or(limits.max_memory_bytes),
            },
            diagram: DiagramConfig {
                font_family: std::env::var("PROCFLOW_DIAGRAM_FONT")
                    .unwrap_or_else(|_| "SimSun".to_string()),
            },
        }
    }
}

impl Config {
    /// Defaults with a private in-memory database
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.database.url = "sqlite::memory:".to_string();
        config
    }
}
