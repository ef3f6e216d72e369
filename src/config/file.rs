//! TOML configuration file parsing
//!
//! Repeated invocations against the same node pool usually share their
//! settings, so everything the CLI accepts (except one-shot flags like
//! --dry-run) can live in `swarm.toml`. CLI and environment values win
//! over file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file names probed when --config is not given.
const DEFAULT_FILES: &[&str] = &["swarm.toml"];
const HOME_FILE: &str = ".swarm.toml";

/// Settings readable from a TOML file. All optional; unset fields fall
/// back to CLI values or built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub testplan: Option<PathBuf>,
    pub node_list: Option<Vec<String>>,
    pub nodes: Option<i64>,
    pub processes: Option<usize>,
    pub port: Option<u16>,
    pub run_time: Option<String>,
    pub exit_timeout: Option<u64>,
    pub remote_master: Option<String>,
    pub extra_files: Option<Vec<PathBuf>>,
    pub iterations: Option<u64>,
    pub env: Option<Vec<String>>,
    pub lock_hold: Option<String>,
    pub loadgen_command: Option<String>,
    pub loglevel: Option<String>,
    pub master_args: Option<Vec<String>>,
}

/// Parse a TOML configuration file.
pub fn parse_file(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_str(&contents).with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from a string.
pub fn parse_str(contents: &str) -> Result<FileConfig> {
    let config: FileConfig =
        ::toml::from_str(contents).context("failed to parse TOML configuration")?;
    Ok(config)
}

/// Locate the default config file, if any exists.
pub fn find_default() -> Option<PathBuf> {
    for name in DEFAULT_FILES {
        let path = PathBuf::from(name);
        if path.is_file() {
            return Some(path);
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        let path = PathBuf::from(home).join(HOME_FILE);
        if path.is_file() {
            return Some(path);
        }
    }
    None
}
