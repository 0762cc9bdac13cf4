use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use grog_server::{KeepaliveConfig, ServerConfig, WindowConfig};
use grog_telemetry::{LogFormat, TelemetryConfig};
use sha2::{Digest, Sha256};
use tracing::Level;

/// Tail stdin into a throwaway store and stream it to browser viewers.
#[derive(Parser, Debug)]
#[command(name = "grog", version, about)]
pub struct Cli {
    /// Port for the HTTP/WebSocket listener.
    #[arg(long, env = "PORT")]
    pub port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Directory for the temporary database file (default: working directory).
    #[arg(long, env = "GROG_DB_DIR")]
    pub db_dir: Option<PathBuf>,

    /// Records before a viewer's cursor included in each window.
    #[arg(long, env = "GROG_LOOKBACK", default_value_t = 40)]
    pub lookback: u64,

    /// Maximum records per window.
    #[arg(long, env = "GROG_BATCH_SIZE", default_value_t = 80)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 10_000)]
    pub keepalive_interval_ms: u64,

    /// How long a keepalive ping may go unanswered.
    #[arg(long, default_value_t = 500)]
    pub keepalive_timeout_ms: u64,

    /// File or FIFO ingested as the secondary source; its lines are echoed to stderr.
    #[arg(long)]
    pub secondary: Option<PathBuf>,

    /// Default log level. RUST_LOG takes precedence.
    #[arg(long, env = "GROG_LOG", default_value = "info")]
    pub log_level: Level,

    /// Per-module level override as `target=level`, e.g.
    /// `--log-module grog_server=debug`. Repeatable.
    #[arg(long = "log-module", value_name = "TARGET=LEVEL", value_parser = parse_module_level)]
    pub log_modules: Vec<(String, Level)>,

    /// Log output format: pretty or json.
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            lookback: self.lookback,
            batch_size: self.batch_size,
        }
    }

    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_millis(self.keepalive_interval_ms),
            timeout: Duration::from_millis(self.keepalive_timeout_ms),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            window: self.window(),
            keepalive: self.keepalive(),
            ..Default::default()
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            module_levels: self.log_modules.clone(),
            format: self.log_format,
        }
    }

    /// Fresh database path for this run, under `--db-dir` or the working
    /// directory.
    pub fn database_path(&self, started_at: DateTime<Utc>) -> Result<PathBuf> {
        let cwd = std::env::current_dir().context("resolve working directory")?;
        let dir = self.db_dir.clone().unwrap_or_else(|| cwd.clone());
        Ok(dir.join(database_file_name(&cwd, self.port, started_at)))
    }
}

fn parse_module_level(s: &str) -> Result<(String, Level), String> {
    let (target, level) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TARGET=LEVEL, got `{s}`"))?;
    let target = target.trim();
    if target.is_empty() {
        return Err(format!("missing target in `{s}`"));
    }
    let level = level
        .trim()
        .parse::<Level>()
        .map_err(|_| format!("unknown level `{}`", level.trim()))?;
    Ok((target.to_owned(), level))
}

/// `tmp_grog_db_<sha256>` over the working directory, port and start time,
/// so concurrent instances never share a file.
pub fn database_file_name(cwd: &Path, port: u16, started_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cwd.as_os_str().as_encoded_bytes());
    hasher.update(port.to_be_bytes());
    hasher.update(started_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true));
    format!("tmp_grog_db_{:x}", hasher.finalize())
}
