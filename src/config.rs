use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed to call the agent (reflected in CORS headers).
    pub allowed_origin: String,
    /// Idle time after which a session is evicted.
    pub session_ttl_seconds: u64,
    /// Session sweeper tick interval.
    pub session_sweep_interval_seconds: u64,
    /// Idle time after which a cursor is evicted.
    pub cursor_ttl_seconds: u64,
    /// Per-session cursor sweeper tick interval.
    pub cursor_sweep_interval_seconds: u64,
    /// Connectivity check timeout during login.
    pub login_ping_timeout_seconds: u64,
    /// Timeout for the standalone /ping endpoint.
    pub ping_timeout_seconds: u64,
    /// Maximum open connections per session pool.
    pub pool_max_open: usize,
    /// Connections kept warm when a pool is opened.
    pub pool_idle_at_start: usize,
    /// Log format: "compact" or "json".
    pub log_format: String,
    /// Directory for the rolling log file; derived from the home
    /// directory when unset.
    pub log_dir: Option<PathBuf>,
    /// Rotated log files kept on disk.
    pub log_max_files: usize,
    /// Directory CSV exports are written to; defaults to ~/Downloads.
    pub export_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 23890,
            allowed_origin: "*".to_string(),
            session_ttl_seconds: 1200,
            session_sweep_interval_seconds: 1200,
            cursor_ttl_seconds: 60,
            cursor_sweep_interval_seconds: 60,
            login_ping_timeout_seconds: 20,
            ping_timeout_seconds: 1,
            pool_max_open: 500,
            pool_idle_at_start: 10,
            log_format: "json".to_string(),
            log_dir: None,
            log_max_files: 28,
            export_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("SQLAGENT"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: AgentConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve bind address for {addr}"))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.session_ttl_seconds == 0 || self.cursor_ttl_seconds == 0 {
            anyhow::bail!("session and cursor TTLs must be non-zero");
        }
        if self.session_sweep_interval_seconds == 0 || self.cursor_sweep_interval_seconds == 0 {
            anyhow::bail!("sweep intervals must be non-zero");
        }
        if self.pool_max_open == 0 {
            anyhow::bail!("pool_max_open must be non-zero");
        }
        if self.pool_idle_at_start > self.pool_max_open {
            anyhow::bail!("pool_idle_at_start cannot exceed pool_max_open");
        }
        match self.log_format.as_str() {
            "compact" | "json" => Ok(()),
            other => anyhow::bail!("unsupported log format '{other}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AgentConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.port, 23890);
        assert_eq!(cfg.session_ttl_seconds, 1200);
        assert_eq!(cfg.cursor_ttl_seconds, 60);
    }

    #[test]
    fn bind_addr_resolves_loopback() {
        let cfg = AgentConfig::default();
        let addr = cfg.bind_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 23890);
    }

    #[test]
    fn rejects_unknown_log_format() {
        let cfg = AgentConfig {
            log_format: "yaml".to_string(),
            ..AgentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_warm_pool() {
        let cfg = AgentConfig {
            pool_max_open: 5,
            pool_idle_at_start: 10,
            ..AgentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
