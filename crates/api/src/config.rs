use std::time::Duration;

use scriptbox_core::scripting::config::{
    clamp_timeout_ms, DispatcherConfig, SandboxLimits, DEFAULT_MAX_MEMORY_MB,
    DEFAULT_MAX_QUEUE_DEPTH, DEFAULT_MAX_STATEMENTS, DEFAULT_MAX_WORKERS, DEFAULT_TIMEOUT_MS,
};

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. In production,
/// override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// PostgreSQL connection string. Unset means in-memory collaborators.
    pub database_url: Option<String>,
    /// `json` switches log output to JSON lines.
    pub log_format: LogFormat,
    /// Default per-run deadline in milliseconds (default: `5000`).
    pub script_timeout_ms: u64,
    /// Statement ceiling per run (default: `10000`).
    pub script_max_statements: u64,
    /// Interpreter heap ceiling in MiB (default: `64`).
    pub script_max_memory_mb: usize,
    /// Reserved; scripts never get network access.
    pub script_allow_network: bool,
    /// Reserved; scripts never get file access.
    pub script_allow_file_access: bool,
    /// Concurrent sandbox runs (default: `8`).
    pub script_max_workers: usize,
    /// Calls allowed to wait for a worker (default: `64`).
    pub script_max_queue_depth: usize,
    /// How long shutdown waits for in-flight runs (default: `5`).
    pub script_shutdown_grace_secs: u64,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                 |
    /// |------------------------------|-------------------------|
    /// | `HOST`                       | `0.0.0.0`               |
    /// | `PORT`                       | `3000`                  |
    /// | `CORS_ORIGINS`               | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`       | `30`                    |
    /// | `DATABASE_URL`               | unset (in-memory)       |
    /// | `LOG_FORMAT`                 | `pretty`                |
    /// | `SCRIPT_TIMEOUT_MS`          | `5000`                  |
    /// | `SCRIPT_MAX_STATEMENTS`      | `10000`                 |
    /// | `SCRIPT_MAX_MEMORY_MB`       | `64`                    |
    /// | `SCRIPT_ALLOW_NETWORK`       | `false`                 |
    /// | `SCRIPT_ALLOW_FILE_ACCESS`   | `false`                 |
    /// | `SCRIPT_MAX_WORKERS`         | `8`                     |
    /// | `SCRIPT_MAX_QUEUE_DEPTH`     | `64`                    |
    /// | `SCRIPT_SHUTDOWN_GRACE_SECS` | `5`                     |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let log_format = match std::env::var("LOG_FORMAT") {
            Ok(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            database_url,
            log_format,
            script_timeout_ms: env_or("SCRIPT_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            script_max_statements: env_or("SCRIPT_MAX_STATEMENTS", DEFAULT_MAX_STATEMENTS),
            script_max_memory_mb: env_or("SCRIPT_MAX_MEMORY_MB", DEFAULT_MAX_MEMORY_MB),
            script_allow_network: env_or("SCRIPT_ALLOW_NETWORK", false),
            script_allow_file_access: env_or("SCRIPT_ALLOW_FILE_ACCESS", false),
            script_max_workers: env_or("SCRIPT_MAX_WORKERS", DEFAULT_MAX_WORKERS),
            script_max_queue_depth: env_or("SCRIPT_MAX_QUEUE_DEPTH", DEFAULT_MAX_QUEUE_DEPTH),
            script_shutdown_grace_secs: env_or("SCRIPT_SHUTDOWN_GRACE_SECS", 5),
        }
    }

    /// Dispatcher settings derived from the `SCRIPT_*` variables.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            limits: SandboxLimits {
                max_statements: self.script_max_statements.max(1),
                max_memory_mb: self.script_max_memory_mb.max(1),
                allow_network: self.script_allow_network,
                allow_file_access: self.script_allow_file_access,
            },
            default_timeout: clamp_timeout_ms(self.script_timeout_ms),
            max_workers: self.script_max_workers.max(1),
            max_queue_depth: self.script_max_queue_depth,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.script_shutdown_grace_secs)
    }
}

/// Parse an optional env var, panicking on a malformed value.
fn env_or<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{name} has an invalid value: {raw}")),
        Err(_) => default,
    }
}
