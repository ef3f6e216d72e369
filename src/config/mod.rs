//! Run configuration
//!
//! One immutable [`Config`] is built at startup from CLI arguments merged
//! over an optional TOML file, validated once, and passed by reference into
//! every component. Nothing consults flags or environment variables after
//! this point.

pub mod cli;
pub mod file;

use crate::config::cli::Cli;
use crate::config::file::FileConfig;
use crate::util::time::parse_timespan;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default worker processes per node.
const DEFAULT_PROCESSES: usize = 4;
/// Default master port; stepped by 2 while the local pair is busy.
const DEFAULT_PORT: u16 = 5557;
/// Default grace past the run time before the master is stopped.
const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Placeholder hold when neither --lock-hold nor --run-time is given.
const DEFAULT_LOCK_HOLD: Duration = Duration::from_secs(300);

/// Lease acquisition tuning.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Backoff between probe rounds.
    pub check_interval: Duration,
    /// Retries beyond the first round before giving up.
    pub max_retries: u32,
    /// How long the placeholder process holds a node.
    pub lock_hold: Duration,
    /// Upper bound on a single probe answering.
    pub probe_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(25),
            max_retries: 5,
            lock_hold: DEFAULT_LOCK_HOLD,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

/// Supervision loop tuning.
#[derive(Debug, Clone)]
pub struct SuperviseConfig {
    /// Startup window in which any process exit is a launch failure.
    pub grace: Duration,
    /// Polling interval of the steady-state loop.
    pub tick: Duration,
    /// Grace past the run time before the master is stopped.
    pub exit_timeout: Duration,
}

impl Default for SuperviseConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            tick: Duration::from_secs(10),
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }
}

/// Cleanup tuning.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How long local children get to exit after SIGTERM before SIGKILL.
    pub kill_timeout: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            kill_timeout: Duration::from_secs(3),
        }
    }
}

/// Immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Test plan handed to the master (workers get theirs over the wire).
    pub testplan: PathBuf,
    /// Candidate node pool.
    pub nodes: Vec<String>,
    /// How many nodes to lease.
    pub node_count: usize,
    /// Worker processes per leased node.
    pub processes: usize,
    /// Starting master port.
    pub port: u16,
    /// Run time budget; `None` means unlimited.
    pub run_time: Option<Duration>,
    /// Run the master on this node instead of locally.
    pub remote_master: Option<String>,
    /// Extra files synced to every node before launch.
    pub extra_files: Vec<PathBuf>,
    /// Total iteration budget across all workers; 0 means unlimited.
    pub iterations: u64,
    /// Extra environment exported to master and workers.
    pub env: Vec<(String, String)>,
    /// Arguments forwarded to the master unmodified.
    pub master_args: Vec<String>,
    /// Load generation tool binary.
    pub loadgen_command: String,
    /// Log level forwarded to master and workers (-L).
    pub loglevel: Option<String>,
    pub lease: LeaseConfig,
    pub supervise: SuperviseConfig,
    pub cleanup: CleanupConfig,
}

impl Config {
    /// Build the configuration from parsed CLI arguments, merging in the
    /// config file (explicit --config, or the default file when present).
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => file::parse_file(path)?,
            None => match file::find_default() {
                Some(path) => file::parse_file(&path)?,
                None => FileConfig::default(),
            },
        };
        Self::merge(cli, file)
    }

    fn merge(cli: Cli, file: FileConfig) -> Result<Self> {
        let nodes = if !cli.node_list.is_empty() {
            cli.node_list
        } else {
            file.node_list.unwrap_or_default()
        };
        if nodes.is_empty() {
            bail!(
                "no load generators specified (use --node-list, SWARM_NODE_LIST or the config file)"
            );
        }

        let requested = cli.nodes.or(file.nodes).unwrap_or(-1);
        let node_count = if requested < 0 {
            nodes.len()
        } else {
            requested as usize
        };
        if node_count > nodes.len() {
            bail!(
                "asked for {} nodes but only {} are in the pool",
                node_count,
                nodes.len()
            );
        }

        let processes = cli.processes.or(file.processes).unwrap_or(DEFAULT_PROCESSES);
        if processes == 0 {
            bail!("--processes must be at least 1");
        }

        let run_time = cli
            .run_time
            .or(file.run_time)
            .map(|s| parse_timespan(&s).context("invalid --run-time"))
            .transpose()?;

        let exit_timeout = cli
            .exit_timeout
            .or(file.exit_timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_EXIT_TIMEOUT);

        // The placeholder should outlive the run it protects; without a run
        // time bound we fall back to a fixed hold.
        let lock_hold = match cli.lock_hold.or(file.lock_hold) {
            Some(s) => parse_timespan(&s).context("invalid --lock-hold")?,
            None => run_time
                .map(|rt| rt + exit_timeout)
                .unwrap_or(DEFAULT_LOCK_HOLD),
        };

        let mut env = Vec::new();
        let raw_env = if !cli.env.is_empty() {
            cli.env
        } else {
            file.env.unwrap_or_default()
        };
        for pair in raw_env {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("invalid --env '{}': expected KEY=VALUE", pair))?;
            env.push((key.to_string(), value.to_string()));
        }

        let master_args = if !cli.master_args.is_empty() {
            cli.master_args
        } else {
            file.master_args.unwrap_or_default()
        };

        let extra_files = if !cli.extra_files.is_empty() {
            cli.extra_files
        } else {
            file.extra_files.unwrap_or_default()
        };

        Ok(Self {
            testplan: cli
                .testplan
                .or(file.testplan)
                .unwrap_or_else(|| PathBuf::from("locustfile.py")),
            nodes,
            node_count,
            processes,
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            run_time,
            remote_master: cli.remote_master.or(file.remote_master),
            extra_files,
            iterations: cli.iterations.or(file.iterations).unwrap_or(0),
            env,
            master_args,
            loadgen_command: cli
                .loadgen_command
                .or(file.loadgen_command)
                .unwrap_or_else(|| "locust".to_string()),
            loglevel: cli.loglevel.or(file.loglevel),
            lease: LeaseConfig {
                lock_hold,
                ..LeaseConfig::default()
            },
            supervise: SuperviseConfig {
                exit_timeout,
                ..SuperviseConfig::default()
            },
            cleanup: CleanupConfig::default(),
        })
    }

    /// Total worker processes the master should expect.
    pub fn worker_process_count(&self) -> usize {
        self.node_count * self.processes
    }
}
