//! Remote execution boundary
//!
//! Pure I/O primitives for running commands on load generator nodes and
//! locally: short-lived commands with captured output, long-running spawned
//! processes with a pollable handle, file sync, and a pre-lease reachability
//! check. No orchestration policy lives here; the leasing, launch and
//! cleanup layers decide *what* to run.

pub mod mock;
pub mod ssh;

use crate::error::SwarmError;
use async_trait::async_trait;
use std::path::PathBuf;

pub use mock::{MockChild, MockExecutor};
pub use ssh::SshExecutor;

/// Output and exit status of a short-lived command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `-1` when the process was killed by a signal.
    pub status: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            status: 0,
        }
    }
}

/// Observed liveness of a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(i32),
}

/// Options for spawning a long-running remote process.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Reverse-forward these local ports into the node (`-R p:localhost:p`).
    pub forward_ports: Vec<u16>,
    /// Keep a stdin pipe open. Remote commands that end in `& read; kill -9 $!`
    /// use it as their control channel: when the orchestrator dies, stdin
    /// closes, `read` returns and the remote process is killed.
    pub hold_stdin: bool,
    /// Capture stdout so the caller can read verdict lines from it.
    pub capture_stdout: bool,
}

/// A handle to one spawned process (local or remote).
#[async_trait]
pub trait RemoteChild: Send {
    /// OS pid of the local end (the ssh client for remote processes).
    fn id(&self) -> Option<u32>;

    /// Human-readable description for log lines.
    fn describe(&self) -> &str;

    /// Non-blocking liveness check.
    fn poll(&mut self) -> crate::Result<Liveness>;

    /// Read the next captured stdout line, or `None` on EOF.
    async fn read_line(&mut self) -> crate::Result<Option<String>>;

    /// Ask the process to stop (SIGTERM). Best-effort.
    fn terminate(&mut self) -> crate::Result<()>;

    /// Force-kill the process and reap it. Best-effort.
    async fn kill(&mut self) -> crate::Result<()>;
}

/// Issues commands on nodes and spawns the processes the orchestrator owns.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a short-lived command on `node` and wait for its output.
    async fn exec(&self, node: &str, command: &str) -> crate::Result<ExecOutput>;

    /// Start a long-running command on `node`.
    fn spawn(
        &self,
        node: &str,
        command: &str,
        opts: SpawnOptions,
    ) -> crate::Result<Box<dyn RemoteChild>>;

    /// Start a local process from an argv, with extra environment variables.
    fn spawn_local(
        &self,
        argv: &[String],
        env: &[(String, String)],
    ) -> crate::Result<Box<dyn RemoteChild>>;

    /// Make the given local paths present on `node`.
    async fn sync_files(&self, node: &str, paths: &[PathBuf]) -> crate::Result<ExecOutput>;

    /// Verify the candidate nodes are reachable before leasing starts.
    async fn preflight(&self, nodes: &[String]) -> Result<(), SwarmError>;
}
