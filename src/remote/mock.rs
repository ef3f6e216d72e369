//! Mock executor for testing
//!
//! Simulates remote execution without touching ssh, making lifecycle tests
//! fast and deterministic. Tests script what each node answers (probe
//! verdict lines, exec outputs, child liveness sequences) and afterwards
//! inspect the full call log plus per-child kill/terminate flags.

use crate::error::SwarmError;
use crate::remote::{ExecOutput, Executor, Liveness, RemoteChild, SpawnOptions};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Record of one executor call, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exec { node: String, command: String },
    Spawn { node: String, command: String },
    SpawnLocal { argv: Vec<String> },
    Sync { node: String, paths: Vec<PathBuf> },
    Preflight,
}

/// Script for one spawned child: stdout lines plus a poll sequence.
#[derive(Debug, Clone, Default)]
pub struct ChildPlan {
    pub lines: Vec<String>,
    /// Liveness returned by successive polls; the last entry repeats.
    /// Empty means "runs forever".
    pub polls: Vec<Liveness>,
}

impl ChildPlan {
    /// A probe answer: the node reports itself available or busy.
    pub fn verdict(line: &str) -> Self {
        Self {
            lines: vec![line.to_string()],
            polls: vec![],
        }
    }

    /// A process that keeps running until killed.
    pub fn running() -> Self {
        Self::default()
    }

    /// A process that has already exited when first polled.
    pub fn exits(code: i32) -> Self {
        Self {
            lines: vec![],
            polls: vec![Liveness::Exited(code)],
        }
    }

    /// A process that survives `n` polls, then exits with `code`.
    pub fn exits_after(n: usize, code: i32) -> Self {
        let mut polls = vec![Liveness::Running; n];
        polls.push(Liveness::Exited(code));
        Self {
            lines: vec![],
            polls,
        }
    }
}

/// Flags shared between a [`MockChild`] and the test that scripted it.
#[derive(Debug, Default)]
pub struct ChildFlags {
    pub terminated: AtomicBool,
    pub killed: AtomicBool,
}

/// A scripted process handle.
pub struct MockChild {
    desc: String,
    lines: VecDeque<String>,
    polls: VecDeque<Liveness>,
    current: Liveness,
    flags: Arc<ChildFlags>,
}

impl MockChild {
    pub fn from_plan(desc: impl Into<String>, plan: &ChildPlan) -> Self {
        Self {
            desc: desc.into(),
            lines: plan.lines.iter().cloned().collect(),
            polls: plan.polls.iter().copied().collect(),
            current: Liveness::Running,
            flags: Arc::new(ChildFlags::default()),
        }
    }

    pub fn running() -> Self {
        Self::from_plan("mock child", &ChildPlan::running())
    }

    pub fn exits(code: i32) -> Self {
        Self::from_plan("mock child", &ChildPlan::exits(code))
    }

    pub fn exits_after(n: usize, code: i32) -> Self {
        Self::from_plan("mock child", &ChildPlan::exits_after(n, code))
    }

    /// Handle to the terminate/kill flags, kept by tests for assertions.
    pub fn flags(&self) -> Arc<ChildFlags> {
        Arc::clone(&self.flags)
    }
}

#[async_trait]
impl RemoteChild for MockChild {
    fn id(&self) -> Option<u32> {
        None
    }

    fn describe(&self) -> &str {
        &self.desc
    }

    fn poll(&mut self) -> Result<Liveness> {
        if self.flags.killed.load(Ordering::SeqCst) {
            return Ok(Liveness::Exited(137));
        }
        if self.flags.terminated.load(Ordering::SeqCst) {
            return Ok(Liveness::Exited(143));
        }
        if let Some(next) = self.polls.pop_front() {
            self.current = next;
        }
        Ok(self.current)
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.pop_front())
    }

    fn terminate(&mut self) -> Result<()> {
        self.flags.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.flags.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    exec_results: HashMap<String, VecDeque<ExecOutput>>,
    children: HashMap<String, VecDeque<ChildPlan>>,
    /// Used when a node's child queue runs dry (lease retry rounds).
    repeat: HashMap<String, ChildPlan>,
    local_children: VecDeque<ChildPlan>,
    fail_spawn_local: bool,
    fail_sync: Vec<String>,
    preflight_error: Option<(String, String)>,
    calls: Vec<Call>,
    spawned_flags: Vec<Arc<ChildFlags>>,
}

/// Mock implementation of [`Executor`].
#[derive(Default)]
pub struct MockExecutor {
    inner: Mutex<Inner>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next spawned child on `node`.
    pub fn script_child(&self, node: &str, plan: ChildPlan) {
        self.inner
            .lock()
            .unwrap()
            .children
            .entry(node.to_string())
            .or_default()
            .push_back(plan);
    }

    /// Make every spawn on `node` use `plan` once the queue is empty.
    pub fn script_child_repeating(&self, node: &str, plan: ChildPlan) {
        self.inner
            .lock()
            .unwrap()
            .repeat
            .insert(node.to_string(), plan);
    }

    /// Queue the next locally spawned child.
    pub fn script_local_child(&self, plan: ChildPlan) {
        self.inner.lock().unwrap().local_children.push_back(plan);
    }

    /// Queue the next `exec` result on `node`.
    pub fn script_exec(&self, node: &str, output: ExecOutput) {
        self.inner
            .lock()
            .unwrap()
            .exec_results
            .entry(node.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn fail_spawn_local(&self) {
        self.inner.lock().unwrap().fail_spawn_local = true;
    }

    pub fn fail_sync(&self, node: &str) {
        self.inner.lock().unwrap().fail_sync.push(node.to_string());
    }

    pub fn fail_preflight(&self, node: &str, reason: &str) {
        self.inner.lock().unwrap().preflight_error =
            Some((node.to_string(), reason.to_string()));
    }

    /// Everything the orchestration layers asked this executor to do.
    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Flags of every child this executor spawned, in spawn order.
    pub fn spawned_flags(&self) -> Vec<Arc<ChildFlags>> {
        self.inner.lock().unwrap().spawned_flags.clone()
    }

    pub fn exec_commands_for(&self, node: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Exec { node: n, command } if n == node => Some(command.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn exec(&self, node: &str, command: &str) -> Result<ExecOutput> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Exec {
            node: node.to_string(),
            command: command.to_string(),
        });
        let out = inner
            .exec_results
            .get_mut(node)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(ExecOutput::ok);
        Ok(out)
    }

    fn spawn(
        &self,
        node: &str,
        command: &str,
        _opts: SpawnOptions,
    ) -> Result<Box<dyn RemoteChild>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Spawn {
            node: node.to_string(),
            command: command.to_string(),
        });
        let plan = inner
            .children
            .get_mut(node)
            .and_then(|q| q.pop_front())
            .or_else(|| inner.repeat.get(node).cloned())
            .ok_or_else(|| anyhow!("no scripted child for node {}", node))?;
        let child = MockChild::from_plan(format!("mock ssh {} {}", node, command), &plan);
        inner.spawned_flags.push(child.flags());
        Ok(Box::new(child))
    }

    fn spawn_local(
        &self,
        argv: &[String],
        _env: &[(String, String)],
    ) -> Result<Box<dyn RemoteChild>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::SpawnLocal {
            argv: argv.to_vec(),
        });
        if inner.fail_spawn_local {
            return Err(anyhow!("scripted spawn failure"));
        }
        let plan = inner
            .local_children
            .pop_front()
            .unwrap_or_else(ChildPlan::running);
        let child = MockChild::from_plan(argv.join(" "), &plan);
        inner.spawned_flags.push(child.flags());
        Ok(Box::new(child))
    }

    async fn sync_files(&self, node: &str, paths: &[PathBuf]) -> Result<ExecOutput> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Sync {
            node: node.to_string(),
            paths: paths.to_vec(),
        });
        if inner.fail_sync.iter().any(|n| n == node) {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: "rsync: connection unexpectedly closed".to_string(),
                status: 12,
            });
        }
        Ok(ExecOutput::ok())
    }

    async fn preflight(&self, _nodes: &[String]) -> Result<(), SwarmError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Preflight);
        if let Some((node, reason)) = inner.preflight_error.clone() {
            return Err(SwarmError::Connectivity { node, reason });
        }
        Ok(())
    }
}
