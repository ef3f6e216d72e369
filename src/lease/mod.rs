//! Node leasing
//!
//! The node pool is shared between orchestrators with no central
//! coordinator, so reservation is a cooperative convention: one combined
//! probe-and-lock command per node inspects it for running workers or an
//! existing placeholder, and, if clear, starts a time-bounded placeholder
//! in the same remote invocation. The placeholder is the lock: it is a
//! sleep with a distinctive two-operand syntax other probes pattern-match.
//!
//! This is advisory, not transactional. Two orchestrators racing on the
//! same node can both see "available" in the same window; the single
//! round-trip narrows that window and the retry loop is the mitigation.

use crate::config::LeaseConfig;
use crate::error::SwarmError;
use crate::remote::{Executor, RemoteChild, SpawnOptions};
use crate::supervise::Interrupt;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lease state of one candidate node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unknown,
    Probing,
    Available,
    Busy,
    Leased,
}

/// One candidate load generator.
#[derive(Debug, Clone)]
pub struct Node {
    pub addr: String,
    pub state: NodeState,
}

impl Node {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            state: NodeState::Unknown,
        }
    }
}

/// The set of nodes reserved for one run.
///
/// Holds the local ends of the placeholder processes; they keep the remote
/// markers alive and are handed to cleanup together with all other local
/// children.
pub struct Lease {
    nodes: Vec<String>,
    markers: Vec<Box<dyn RemoteChild>>,
}

impl Lease {
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            markers: Vec::new(),
        }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Hand the placeholder holders over to cleanup.
    pub fn take_markers(&mut self) -> Vec<Box<dyn RemoteChild>> {
        std::mem::take(&mut self.markers)
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("nodes", &self.nodes)
            .field("markers", &self.markers.len())
            .finish()
    }
}

/// Result of an acquisition attempt that did not fail outright.
#[derive(Debug)]
pub enum LeaseOutcome {
    Acquired(Lease),
    /// The operator interrupted the wait; nothing is held.
    Interrupted,
}

enum Probe {
    Available(Box<dyn RemoteChild>),
    Busy,
}

/// Acquires leases on free nodes via the probe-and-lock protocol.
pub struct LeaseManager {
    exec: Arc<dyn Executor>,
    candidates: Vec<Node>,
    settings: LeaseConfig,
    worker_pattern: String,
}

impl LeaseManager {
    /// `worker_pattern` is the pgrep pattern a running worker matches,
    /// e.g. `locust --worker`.
    pub fn new(
        exec: Arc<dyn Executor>,
        candidates: &[String],
        settings: LeaseConfig,
        worker_pattern: &str,
    ) -> Self {
        Self {
            exec,
            candidates: candidates.iter().map(Node::new).collect(),
            settings,
            worker_pattern: worker_pattern.to_string(),
        }
    }

    /// Lease exactly `count` free nodes, or fail with `LeaseExhausted` once
    /// the retry budget is spent. Partial leases are never returned, and an
    /// interrupted wait releases whatever the current round had collected.
    pub async fn acquire(
        &mut self,
        count: usize,
        interrupt: &mut Interrupt,
    ) -> Result<LeaseOutcome, SwarmError> {
        if count == 0 {
            return Ok(LeaseOutcome::Acquired(Lease::empty()));
        }

        let mut best = 0;
        for attempt in 0..=self.settings.max_retries {
            if interrupt.pending() {
                warn!("interrupted while waiting for free load generators");
                return Ok(LeaseOutcome::Interrupted);
            }

            let mut nodes = Vec::new();
            let mut markers = Vec::new();

            for i in 0..self.candidates.len() {
                let addr = self.candidates[i].addr.clone();
                self.candidates[i].state = NodeState::Probing;
                let verdict = match self.probe(&addr).await {
                    Ok(verdict) => verdict,
                    Err(err) => {
                        // an aborted round must not hold its nodes hostage
                        release_markers(markers).await;
                        return Err(err);
                    }
                };
                match verdict {
                    Probe::Available(marker) => {
                        debug!(node = %addr, "available load generator");
                        self.candidates[i].state = NodeState::Leased;
                        nodes.push(addr);
                        markers.push(marker);
                    }
                    Probe::Busy => {
                        debug!(node = %addr, "busy load generator");
                        self.candidates[i].state = NodeState::Busy;
                    }
                }
                if nodes.len() == count {
                    return Ok(LeaseOutcome::Acquired(Lease { nodes, markers }));
                }
            }

            best = best.max(nodes.len());
            info!(
                "only found {} available load generators, wanted {}",
                nodes.len(),
                count
            );

            // Give the partial round back so a concurrent orchestrator can
            // take those nodes during our backoff.
            release_markers(markers).await;
            for node in &mut self.candidates {
                node.state = NodeState::Unknown;
            }

            if attempt < self.settings.max_retries {
                info!(
                    "will try again in {} seconds...",
                    self.settings.check_interval.as_secs()
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.check_interval) => {}
                    _ = interrupt.recv() => {}
                }
            }
        }

        Err(SwarmError::LeaseExhausted {
            wanted: count,
            found: best,
        })
    }

    /// One combined probe-and-lock round trip. The placeholder sleep and the
    /// detection of it happen inside the same remote invocation.
    async fn probe(&self, node: &str) -> Result<Probe, SwarmError> {
        let command = self.probe_command();
        let mut child = self
            .exec
            .spawn(
                node,
                &command,
                SpawnOptions {
                    capture_stdout: true,
                    ..SpawnOptions::default()
                },
            )
            .map_err(|e| SwarmError::launch(format!("probe of {}", node), e))?;

        loop {
            let line = tokio::time::timeout(self.settings.probe_timeout, child.read_line()).await;
            match line {
                Ok(Ok(Some(line))) => match line.trim() {
                    // the child keeps running: it is the marker holder
                    "available" => return Ok(Probe::Available(child)),
                    "busy" => {
                        let _ = child.kill().await;
                        return Ok(Probe::Busy);
                    }
                    _ => continue,
                },
                // EOF, read error or timeout without a verdict
                _ => {
                    let _ = child.kill().await;
                    return Err(SwarmError::Probe {
                        node: node.to_string(),
                        command,
                    });
                }
            }
        }
    }

    /// A node is busy if it runs a worker or holds a placeholder. The
    /// bracketed first characters stop pgrep from matching the probing
    /// shell itself, whose command line contains these very patterns.
    fn probe_command(&self) -> String {
        format!(
            "pgrep -u $USER -f '^[s]leep 1 |{}' && echo busy || (echo available && sleep 1 {})",
            bracket_pattern(&self.worker_pattern),
            self.settings.lock_hold.as_secs(),
        )
    }
}

/// Kill the local holders; each one takes its remote placeholder with it.
async fn release_markers(markers: Vec<Box<dyn RemoteChild>>) {
    for mut marker in markers {
        let _ = marker.kill().await;
    }
}

/// Wrap the first character in a character class: `locust --worker`
/// becomes `[l]ocust --worker`.
fn bracket_pattern(pattern: &str) -> String {
    let mut chars = pattern.chars();
    match chars.next() {
        Some(first) => format!("[{}]{}", first, chars.as_str()),
        None => String::new(),
    }
}
