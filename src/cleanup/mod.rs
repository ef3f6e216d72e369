//! Guaranteed teardown
//!
//! One [`CleanupGuard`] is created as soon as nodes are leased and runs on
//! every exit path after that point: completion, timeout, interrupt, launch
//! failure, worker death. It never fails the run; teardown problems are
//! logged and swallowed so the exit code reflects the run, not the cleanup.

use crate::config::CleanupConfig;
use crate::remote::{Executor, Liveness, RemoteChild};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_STEP: Duration = Duration::from_millis(100);

/// Tears down everything a run started: local children (ssh sessions, a
/// local master) and any worker processes still alive on the leased nodes.
pub struct CleanupGuard {
    exec: Arc<dyn Executor>,
    nodes: Vec<String>,
    kill_timeout: Duration,
    /// pgrep/pkill pattern matching the workers on a node.
    worker_pattern: String,
    runs: usize,
}

impl CleanupGuard {
    pub fn new(
        exec: Arc<dyn Executor>,
        nodes: Vec<String>,
        settings: &CleanupConfig,
        worker_pattern: &str,
    ) -> Self {
        Self {
            exec,
            nodes,
            kill_timeout: settings.kill_timeout,
            worker_pattern: worker_pattern.to_string(),
            runs: 0,
        }
    }

    /// Tear everything down. Safe to call more than once; only the first
    /// call does work. Never returns an error.
    pub async fn run(&mut self, locals: Vec<Box<dyn RemoteChild>>) {
        if self.runs > 0 {
            debug!("cleanup already done, skipping");
            return;
        }
        self.runs += 1;

        info!(
            "cleaning up: {} local processes, {} nodes",
            locals.len(),
            self.nodes.len()
        );
        self.stop_locals(locals).await;
        self.sweep_nodes().await;
    }

    /// How many times teardown actually ran.
    pub fn invocations(&self) -> usize {
        self.runs
    }

    /// SIGTERM everything, give stragglers `kill_timeout` to exit, then
    /// SIGKILL whatever is left.
    async fn stop_locals(&self, mut locals: Vec<Box<dyn RemoteChild>>) {
        for child in locals.iter_mut() {
            if let Err(err) = child.terminate() {
                debug!("terminating {}: {}", child.describe(), err);
            }
        }

        let deadline = Instant::now() + self.kill_timeout;
        loop {
            locals.retain_mut(|child| !matches!(child.poll(), Ok(Liveness::Exited(_))));
            if locals.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_STEP).await;
        }

        for child in locals.iter_mut() {
            warn!("{} ignored the stop request, killing it", child.describe());
            if let Err(err) = child.kill().await {
                warn!("killing {}: {}", child.describe(), err);
            }
        }
    }

    /// Kill leftover workers on each node. The stdin control channels
    /// normally take workers down with the ssh sessions; this catches the
    /// ones that survived anyway.
    async fn sweep_nodes(&self) {
        for node in &self.nodes {
            let command = format!(
                "pkill -9 -u $USER -f \"{}\" 2>&1 | grep -v 'No such process' || true",
                self.worker_pattern
            );
            match self.exec.exec(node, &command).await {
                Ok(out) if !out.stdout.trim().is_empty() => {
                    debug!("sweep on {}: {}", node, out.stdout.trim());
                }
                Ok(_) => {}
                Err(err) => warn!("could not sweep {}: {}", node, err),
            }
        }
    }
}
