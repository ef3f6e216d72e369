//! Process launch
//!
//! Starts the master and the per-node worker processes with the fail-fast
//! ordering the lifecycle demands: files are synced to a node before any
//! worker starts there, the first worker on a node establishes the reverse
//! tunnels, and launch failures identify node and replica.

pub mod command;

use crate::config::Config;
use crate::error::SwarmError;
use crate::remote::{Executor, Liveness, RemoteChild};
use std::sync::Arc;
use tracing::{debug, info};

/// What a handle is supervising.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

/// Observed lifecycle state of a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited(i32),
}

/// A reference to one spawned process the orchestrator owns.
pub struct ProcessHandle {
    pub role: Role,
    /// Node the process runs on; `None` for a purely local master.
    pub node: Option<String>,
    /// Launch order on its node; the first worker owns the tunnels.
    pub replica: usize,
    pub state: ProcessState,
    child: Box<dyn RemoteChild>,
}

impl ProcessHandle {
    pub fn new(role: Role, node: Option<String>, replica: usize, child: Box<dyn RemoteChild>) -> Self {
        Self {
            role,
            node,
            replica,
            state: ProcessState::Starting,
            child,
        }
    }

    /// Non-blocking liveness check; updates and returns the observed state.
    pub fn poll(&mut self) -> crate::Result<ProcessState> {
        self.state = match self.child.poll()? {
            Liveness::Running => ProcessState::Running,
            Liveness::Exited(code) => ProcessState::Exited(code),
        };
        Ok(self.state)
    }

    /// Ask the process to stop (SIGTERM). Best-effort.
    pub fn terminate(&mut self) -> crate::Result<()> {
        self.child.terminate()
    }

    /// "worker 2 on lg1" / "master on lg3" / "master"
    pub fn target(&self) -> String {
        match (self.role, &self.node) {
            (Role::Master, None) => "master".to_string(),
            (Role::Master, Some(node)) => format!("master on {}", node),
            (Role::Worker, Some(node)) => format!("worker {} on {}", self.replica, node),
            (Role::Worker, None) => format!("worker {}", self.replica),
        }
    }

    pub fn into_child(self) -> Box<dyn RemoteChild> {
        self.child
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("role", &self.role)
            .field("node", &self.node)
            .field("replica", &self.replica)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Everything launched for one run.
#[derive(Default)]
pub struct Fleet {
    pub master: Option<ProcessHandle>,
    pub workers: Vec<ProcessHandle>,
}

impl Fleet {
    pub fn split_mut(&mut self) -> Option<(&mut ProcessHandle, &mut [ProcessHandle])> {
        match self.master.as_mut() {
            Some(master) => Some((master, &mut self.workers)),
            None => None,
        }
    }

    /// Surrender every handle to cleanup.
    pub fn into_children(self) -> Vec<Box<dyn RemoteChild>> {
        let mut children = Vec::new();
        if let Some(master) = self.master {
            children.push(master.into_child());
        }
        children.extend(self.workers.into_iter().map(ProcessHandle::into_child));
        children
    }
}

/// Launches master and workers through the executor.
pub struct ProcessLauncher {
    exec: Arc<dyn Executor>,
    config: Arc<Config>,
}

impl ProcessLauncher {
    pub fn new(exec: Arc<dyn Executor>, config: Arc<Config>) -> Self {
        Self { exec, config }
    }

    /// Start the master coordinator, locally or on the remote master node.
    pub async fn start_master(
        &self,
        port: u16,
        expect_workers: usize,
    ) -> Result<ProcessHandle, SwarmError> {
        let argv = command::master_argv(&self.config, port, expect_workers);
        let run_id = chrono::Utc::now().to_rfc3339();

        match &self.config.remote_master {
            Some(host) => {
                // clear out stale masters from earlier runs, then sync the
                // test plan and extras the remote master will read
                let prekill = format!(
                    "pkill -9 -u $USER {} || true",
                    self.config.loadgen_command
                );
                self.exec
                    .exec(host, &prekill)
                    .await
                    .map_err(|e| SwarmError::launch(format!("master on {}", host), e))?;
                self.sync_to(host, true).await?;

                let mut env = self.config.env.clone();
                env.push(("SWARM_RUN_ID".to_string(), run_id));
                let remote = command::remote_master_command(&argv, &env);
                info!("launching master: ssh {} {}", host, remote);
                let child = self
                    .exec
                    .spawn(host, &remote, Default::default())
                    .map_err(|e| SwarmError::launch(format!("master on {}", host), e))?;
                Ok(ProcessHandle::new(
                    Role::Master,
                    Some(host.clone()),
                    0,
                    child,
                ))
            }
            None => {
                let mut env = self.config.env.clone();
                env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
                env.push(("SWARM_RUN_ID".to_string(), run_id));
                info!("launching master: {}", argv.join(" "));
                let child = self
                    .exec
                    .spawn_local(&argv, &env)
                    .map_err(|e| SwarmError::launch("master", e))?;
                Ok(ProcessHandle::new(Role::Master, None, 0, child))
            }
        }
    }

    /// Sync files to `node`, then start one worker process per replica.
    /// The first replica also establishes the reverse tunnels.
    pub async fn start_workers(
        &self,
        node: &str,
        port: u16,
    ) -> Result<Vec<ProcessHandle>, SwarmError> {
        self.sync_to(node, false).await?;

        let mut handles = Vec::with_capacity(self.config.processes);
        for replica in 0..self.config.processes {
            let launch = command::worker_launch(&self.config, port, replica == 0);
            if replica == 0 {
                info!("starting workers on {}: {}", node, launch.command);
            } else {
                debug!("worker {} on {}: {}", replica, node, launch.command);
            }
            let child = self
                .exec
                .spawn(node, &launch.command, launch.opts)
                .map_err(|e| {
                    SwarmError::launch(format!("worker {} on {}", replica, node), e)
                })?;
            handles.push(ProcessHandle::new(
                Role::Worker,
                Some(node.to_string()),
                replica,
                child,
            ));
        }
        Ok(handles)
    }

    /// Make the extra files (and, for the master, the test plan) present on
    /// `node`. Skipped when there is nothing to send.
    async fn sync_to(&self, node: &str, include_testplan: bool) -> Result<(), SwarmError> {
        let mut paths = self.config.extra_files.clone();
        if include_testplan {
            paths.push(self.config.testplan.clone());
        }
        if paths.is_empty() {
            return Ok(());
        }

        let out = self
            .exec
            .sync_files(node, &paths)
            .await
            .map_err(|e| SwarmError::launch(format!("file sync to {}", node), e))?;
        if !out.success() {
            return Err(SwarmError::launch(
                format!("file sync to {}", node),
                out.stderr.trim(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleanupConfig, LeaseConfig, SuperviseConfig};
    use crate::remote::mock::{Call, ChildPlan, MockExecutor};
    use crate::remote::MockChild;
    use std::path::PathBuf;

    fn config() -> Config {
        Config {
            testplan: PathBuf::from("locustfile.py"),
            nodes: vec!["lg1".into()],
            node_count: 1,
            processes: 3,
            port: 5557,
            run_time: None,
            remote_master: None,
            extra_files: vec![],
            iterations: 0,
            env: vec![],
            master_args: vec![],
            loadgen_command: "locust".into(),
            loglevel: None,
            lease: LeaseConfig::default(),
            supervise: SuperviseConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }

    fn launcher(exec: Arc<MockExecutor>, config: Config) -> ProcessLauncher {
        ProcessLauncher::new(exec, Arc::new(config))
    }

    #[tokio::test]
    async fn test_local_master_spawns_locally() {
        let exec = Arc::new(MockExecutor::new());
        let l = launcher(Arc::clone(&exec), config());

        let master = l.start_master(5557, 3).await.unwrap();
        assert_eq!(master.role, Role::Master);
        assert!(master.node.is_none());
        assert_eq!(master.state, ProcessState::Starting);

        match &exec.calls()[0] {
            Call::SpawnLocal { argv } => assert_eq!(argv[0], "locust"),
            other => panic!("expected local spawn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_master_prekills_and_syncs_testplan() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child("master-host", ChildPlan::running());
        let mut cfg = config();
        cfg.remote_master = Some("master-host".into());
        let l = launcher(Arc::clone(&exec), cfg);

        let master = l.start_master(5557, 3).await.unwrap();
        assert_eq!(master.node.as_deref(), Some("master-host"));

        let calls = exec.calls();
        assert!(matches!(&calls[0], Call::Exec { node, command }
            if node == "master-host" && command.contains("pkill")));
        assert!(matches!(&calls[1], Call::Sync { node, paths }
            if node == "master-host" && paths.contains(&PathBuf::from("locustfile.py"))));
        assert!(matches!(&calls[2], Call::Spawn { command, .. }
            if command.contains("nohup") && command.contains("--master")));
    }

    #[tokio::test]
    async fn test_workers_one_handle_per_replica() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child_repeating("lg1", ChildPlan::running());
        let l = launcher(Arc::clone(&exec), config());

        let workers = l.start_workers("lg1", 5557).await.unwrap();
        assert_eq!(workers.len(), 3);
        assert_eq!(workers[0].replica, 0);
        assert_eq!(workers[2].replica, 2);
        assert!(workers.iter().all(|w| w.node.as_deref() == Some("lg1")));
    }

    #[tokio::test]
    async fn test_extra_files_synced_before_workers() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child_repeating("lg1", ChildPlan::running());
        let mut cfg = config();
        cfg.extra_files = vec![PathBuf::from("testdata.csv")];
        let l = launcher(Arc::clone(&exec), cfg);

        l.start_workers("lg1", 5557).await.unwrap();

        let calls = exec.calls();
        assert!(matches!(&calls[0], Call::Sync { paths, .. }
            if paths == &vec![PathBuf::from("testdata.csv")]));
        assert!(matches!(&calls[1], Call::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_failed_sync_is_a_launch_error() {
        let exec = Arc::new(MockExecutor::new());
        exec.fail_sync("lg1");
        let mut cfg = config();
        cfg.extra_files = vec![PathBuf::from("testdata.csv")];
        let l = launcher(Arc::clone(&exec), cfg);

        let err = l.start_workers("lg1", 5557).await.unwrap_err();
        match err {
            SwarmError::Launch { target, .. } => assert_eq!(target, "file sync to lg1"),
            other => panic!("expected Launch, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_handle_poll_tracks_state() {
        let mut handle = ProcessHandle::new(
            Role::Worker,
            Some("lg1".into()),
            1,
            Box::new(MockChild::exits_after(1, 0)),
        );
        assert_eq!(handle.state, ProcessState::Starting);
        assert_eq!(handle.poll().unwrap(), ProcessState::Running);
        assert_eq!(handle.poll().unwrap(), ProcessState::Exited(0));
        assert_eq!(handle.target(), "worker 1 on lg1");
    }
}
