use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rekindle_keys::KeyPolicy;

/// Rekindle key bundle daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "rekindle-keyserver")]
#[command(about = "Stores device prekeys and serves X3DH key bundles over a local socket")]
pub struct Args {
    /// Path of the key database (created if missing)
    #[arg(long = "db", env = "KEYSERVER_DB", default_value_t = default_data_path("keys.db"))]
    pub db_path: String,

    /// Unix socket the IPC listener binds to
    #[arg(long = "socket", env = "KEYSERVER_SOCKET", default_value_t = default_socket_path())]
    pub socket_path: String,

    /// Default log filter; `RUST_LOG` takes precedence when set
    #[arg(long, env = "KEYSERVER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "KEYSERVER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// JSON file overriding key policy limits
    #[arg(long = "policy", env = "KEYSERVER_POLICY")]
    pub policy_path: Option<PathBuf>,

    /// Do not run background key maintenance
    #[arg(long, env = "KEYSERVER_NO_SCHEDULER")]
    pub no_scheduler: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Args {
    /// Load the key policy from `--policy`, or the defaults when unset.
    pub fn load_policy(&self) -> anyhow::Result<KeyPolicy> {
        let Some(path) = &self.policy_path else {
            return Ok(KeyPolicy::default());
        };
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        KeyPolicy::from_json(&json)
            .with_context(|| format!("invalid policy file {}", path.display()))
    }
}

fn default_data_path(file: &str) -> String {
    let base = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{base}/.local/share/rekindle-keyserver/{file}")
}

fn default_socket_path() -> String {
    std::env::temp_dir()
        .join("rekindle-keyserver.sock")
        .to_string_lossy()
        .to_string()
}
