/// Configuration management for portero
///
/// The TOML file supplies the listener settings, the route schemes (static
/// routing table plus an optional default route) and logging. Route schemes
/// are compiled into an immutable `SchemeSet` at startup; the routing core
/// only ever sees shared references to it.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

/// Main portero configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Route schemes, matched against the client-requested database name
    #[serde(default)]
    pub routes: Vec<RouteSchemeConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Maximum number of concurrent client connections
    pub max_connections: usize,
    /// Timeout for establishing backend server connections, in seconds
    pub connect_timeout_sec: u64,
    /// Number of worker threads
    pub worker_threads: Option<usize>,
}

/// Pooling granularity for a route
///
/// Only `session` has defined behavior: the server connection is held for
/// the whole client session. `transaction` and `statement` are accepted by
/// the configuration surface but rejected at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingMode {
    Session,
    Transaction,
    Statement,
}

impl fmt::Display for PoolingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolingMode::Session => write!(f, "session"),
            PoolingMode::Transaction => write!(f, "transaction"),
            PoolingMode::Statement => write!(f, "statement"),
        }
    }
}

/// One route scheme as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSchemeConfig {
    /// Database name this scheme matches (exact match)
    pub database: String,
    /// Override the client-supplied database name when set
    pub forced_database: Option<String>,
    /// Override the client-supplied user name when set
    pub forced_user: Option<String>,
    /// Backend server address
    pub server_addr: String,
    /// Pooling granularity
    #[serde(default = "default_pooling_mode")]
    pub pooling_mode: PoolingMode,
    /// Cap on servers per route (idle + leased)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Use this scheme when no other matches
    #[serde(default)]
    pub default: bool,
}

fn default_pooling_mode() -> PoolingMode {
    PoolingMode::Session
}

fn default_pool_size() -> usize {
    20
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:6432".to_string(),
                max_connections: 10000,
                connect_timeout_sec: 5,
                worker_threads: None, // Use system default
            },
            routes: vec![RouteSchemeConfig {
                database: "postgres".to_string(),
                forced_database: None,
                forced_user: None,
                server_addr: "127.0.0.1:5432".to_string(),
                pooling_mode: PoolingMode::Session,
                pool_size: default_pool_size(),
                default: true,
            }],
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.server.connect_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_sec must be greater than 0".to_string(),
            ));
        }

        let mut defaults = 0;
        for route in &self.routes {
            if route.database.is_empty() {
                return Err(ConfigError::ValidationError(
                    "route database name cannot be empty".to_string(),
                ));
            }

            route.server_addr.parse::<SocketAddr>().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid server address for route '{}': {}",
                    route.database, route.server_addr
                ))
            })?;

            if route.pool_size == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "pool_size for route '{}' must be greater than 0",
                    route.database
                )));
            }

            if route.default {
                defaults += 1;
            }
        }

        if defaults > 1 {
            return Err(ConfigError::ValidationError(
                "at most one route may be marked as default".to_string(),
            ));
        }

        for (i, route) in self.routes.iter().enumerate() {
            if self.routes[..i].iter().any(|r| r.database == route.database) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate route for database '{}'",
                    route.database
                )));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Compile the route schemes into an immutable, shareable `SchemeSet`
    pub fn scheme_set(&self) -> Result<SchemeSet, ConfigError> {
        let mut schemes = Vec::with_capacity(self.routes.len());
        let mut default = None;

        for route in &self.routes {
            let target = route.server_addr.parse::<SocketAddr>().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid server address for route '{}': {}",
                    route.database, route.server_addr
                ))
            })?;

            let scheme = Arc::new(RouteScheme {
                matcher: route.database.clone(),
                forced_database: route.forced_database.clone(),
                forced_user: route.forced_user.clone(),
                target,
                pooling_mode: route.pooling_mode,
                pool_size: route.pool_size,
            });

            if route.default {
                default = Some(Arc::clone(&scheme));
            }
            schemes.push(scheme);
        }

        Ok(SchemeSet { schemes, default })
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            routes: vec![
                RouteSchemeConfig {
                    database: "app".to_string(),
                    forced_database: None,
                    forced_user: None,
                    server_addr: "10.0.1.10:5432".to_string(),
                    pooling_mode: PoolingMode::Session,
                    pool_size: 20,
                    default: false,
                },
                RouteSchemeConfig {
                    database: "reporting".to_string(),
                    forced_database: Some("analytics".to_string()),
                    forced_user: Some("report_worker".to_string()),
                    server_addr: "10.0.1.11:5432".to_string(),
                    pooling_mode: PoolingMode::Session,
                    pool_size: 8,
                    default: true,
                },
            ],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// A compiled route scheme: immutable once loaded, shared by reference
#[derive(Debug)]
pub struct RouteScheme {
    /// Database name this scheme matches
    pub matcher: String,
    /// Forced database override (substituted unconditionally)
    pub forced_database: Option<String>,
    /// Forced user override (substituted unconditionally)
    pub forced_user: Option<String>,
    /// Backend server address
    pub target: SocketAddr,
    /// Pooling granularity
    pub pooling_mode: PoolingMode,
    /// Cap on servers per route (idle + leased)
    pub pool_size: usize,
}

/// The full set of compiled route schemes plus the optional default
#[derive(Debug, Default)]
pub struct SchemeSet {
    schemes: Vec<Arc<RouteScheme>>,
    default: Option<Arc<RouteScheme>>,
}

impl SchemeSet {
    /// Match a scheme for the requested database name, falling back to the
    /// default route when nothing matches
    pub fn match_database(&self, database: &str) -> Option<Arc<RouteScheme>> {
        self.schemes
            .iter()
            .find(|scheme| scheme.matcher == database)
            .cloned()
            .or_else(|| self.default.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
