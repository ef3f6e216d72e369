//! CLI argument parsing using clap
//!
//! Settings resolve in the usual precedence order: command line beats
//! environment variables, which beat the config file. Anything after the
//! named flags is forwarded to the master command line unmodified, so
//! things like `--users 50 --host https://example.com` just work.

use clap::Parser;
use std::path::PathBuf;

/// A tool for automating distributed load test runs over ssh.
///
/// Example: loadswarm -f test.py --node-list lg1.example.com,lg2.example.com -t 5m
#[derive(Parser, Debug, Default)]
#[command(name = "loadswarm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Test plan handed to the load generation tool (-f)
    #[arg(short = 'f', long, value_name = "FILE")]
    pub testplan: Option<PathBuf>,

    /// Comma-separated list of ssh servers on which to run workers
    #[arg(long, env = "SWARM_NODE_LIST", value_delimiter = ',')]
    pub node_list: Vec<String>,

    /// Number of nodes to lease; -1 means all of them
    #[arg(short = 'l', long = "nodes", allow_hyphen_values = true)]
    pub nodes: Option<i64>,

    /// Worker processes per node
    #[arg(short = 'p', long)]
    pub processes: Option<usize>,

    /// Starting master port; stepped by 2 while the local pair is busy
    #[arg(long)]
    pub port: Option<u16>,

    /// Run time budget, e.g. 300s, 20m or 1h30m (default: unlimited)
    #[arg(short = 't', long, env = "SWARM_RUN_TIME")]
    pub run_time: Option<String>,

    /// Seconds past the run time before the master is forcibly stopped
    #[arg(long)]
    pub exit_timeout: Option<u64>,

    /// An ssh server to run the master on instead of the local machine.
    /// Useful so the run survives the workstation going to sleep.
    #[arg(long)]
    pub remote_master: Option<String>,

    /// Extra files or directories to upload to every node before launch
    #[arg(long, num_args = 1..)]
    pub extra_files: Vec<PathBuf>,

    /// Total iteration budget, divided across all worker processes
    #[arg(short = 'i', long)]
    pub iterations: Option<u64>,

    /// KEY=VALUE environment pairs exported to master and workers
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// How long a lease placeholder holds a node (e.g. 10m). Defaults to
    /// run time + exit timeout so the hold outlives the run it protects.
    #[arg(long)]
    pub lock_hold: Option<String>,

    /// Load generation tool binary launched as master and workers
    #[arg(long)]
    pub loadgen_command: Option<String>,

    /// Log level; use DEBUG to trace every remote command
    #[arg(short = 'L', long)]
    pub loglevel: Option<String>,

    /// Config file (default: ./swarm.toml or ~/.swarm.toml when present)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Validate the configuration and exit without leasing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Arguments forwarded to the master unmodified
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "MASTER_ARGS")]
    pub master_args: Vec<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_list_is_comma_separated() {
        let cli = Cli::parse_from(["loadswarm", "--node-list", "lg1,lg2,lg3"]);
        assert_eq!(cli.node_list, vec!["lg1", "lg2", "lg3"]);
    }

    #[test]
    fn test_trailing_args_are_forwarded() {
        let cli = Cli::parse_from([
            "loadswarm",
            "--node-list",
            "lg1",
            "--users",
            "50",
            "--host",
            "https://example.com",
        ]);
        assert_eq!(
            cli.master_args,
            vec!["--users", "50", "--host", "https://example.com"]
        );
    }

    #[test]
    fn test_negative_node_count_parses() {
        let cli = Cli::parse_from(["loadswarm", "--node-list", "lg1", "-l", "-1"]);
        assert_eq!(cli.nodes, Some(-1));
    }
}
