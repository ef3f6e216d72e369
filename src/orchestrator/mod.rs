//! Run orchestration
//!
//! Drives one run end to end: reachability preflight, local port selection,
//! node leasing, master and worker launch, supervision, and teardown. The
//! cleanup guard exists from the moment nodes are leased, so every exit
//! path after that point releases them exactly once.

use crate::cleanup::CleanupGuard;
use crate::config::Config;
use crate::error::{SwarmError, EXIT_INTERRUPTED, EXIT_TIMED_OUT};
use crate::launch::{Fleet, ProcessLauncher, ProcessState};
use crate::lease::{Lease, LeaseManager, LeaseOutcome};
use crate::remote::Executor;
use crate::supervise::{Interrupt, Outcome, Supervisor};
use crate::util::port::first_free_port_pair;
use anyhow::anyhow;
use std::sync::Arc;
use tracing::{error, info};

pub struct Orchestrator {
    config: Arc<Config>,
    exec: Arc<dyn Executor>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, exec: Arc<dyn Executor>) -> Self {
        Self { config, exec }
    }

    /// Run to completion and return the process exit code.
    pub async fn run(&self, interrupt: &mut Interrupt) -> i32 {
        match self.try_run(interrupt).await {
            Ok(Outcome::Completed(code)) => code,
            Ok(Outcome::TimedOut) => EXIT_TIMED_OUT,
            Ok(Outcome::Interrupted) => EXIT_INTERRUPTED,
            Err(err) => {
                error!("{err:#}");
                err.exit_code()
            }
        }
    }

    async fn try_run(&self, interrupt: &mut Interrupt) -> Result<Outcome, SwarmError> {
        if interrupt.pending() {
            return Ok(Outcome::Interrupted);
        }

        let mut reachable = self.config.nodes.clone();
        if let Some(host) = &self.config.remote_master {
            reachable.push(host.clone());
        }
        self.exec.preflight(&reachable).await?;

        let port = first_free_port_pair(self.config.port)?;
        if port != self.config.port {
            info!(
                "port {} is taken locally, using {} instead",
                self.config.port, port
            );
        }

        let worker_pattern = format!("{} --worker", self.config.loadgen_command);
        let mut manager = LeaseManager::new(
            Arc::clone(&self.exec),
            &self.config.nodes,
            self.config.lease.clone(),
            &worker_pattern,
        );
        let mut lease = match manager.acquire(self.config.node_count, interrupt).await? {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Interrupted => return Ok(Outcome::Interrupted),
        };
        info!("leased load generators: {}", lease.nodes().join(", "));

        // From here on, teardown is owed no matter how the run ends.
        let mut guard = CleanupGuard::new(
            Arc::clone(&self.exec),
            lease.nodes().to_vec(),
            &self.config.cleanup,
            &worker_pattern,
        );

        let mut fleet = Fleet::default();
        let result = self.drive(&lease, port, &mut fleet, interrupt).await;

        let mut children = fleet.into_children();
        children.extend(lease.take_markers());
        guard.run(children).await;

        result
    }

    /// Launch the fleet and supervise it. Handles stay in `fleet` so the
    /// caller can tear down whatever was started, even on error.
    async fn drive(
        &self,
        lease: &Lease,
        port: u16,
        fleet: &mut Fleet,
        interrupt: &mut Interrupt,
    ) -> Result<Outcome, SwarmError> {
        // an interrupt that arrived during leasing must not start anything;
        // the guard already exists, so the markers still get released
        if interrupt.pending() {
            return Ok(Outcome::Interrupted);
        }

        let launcher = ProcessLauncher::new(Arc::clone(&self.exec), Arc::clone(&self.config));

        let master = launcher
            .start_master(port, self.config.worker_process_count())
            .await?;
        fleet.master = Some(master);

        for node in lease.nodes() {
            // a master that died already will never accept these workers
            if let Some(master) = fleet.master.as_mut() {
                if let ProcessState::Exited(code) = master.poll()? {
                    return Err(SwarmError::launch(
                        master.target(),
                        format!("exited with code {} before all workers started", code),
                    ));
                }
            }
            let workers = launcher.start_workers(node, port).await?;
            fleet.workers.extend(workers);
        }

        let supervisor = Supervisor::new(&self.config.supervise, self.config.run_time);
        let (master, workers) = fleet
            .split_mut()
            .ok_or_else(|| SwarmError::Internal(anyhow!("master handle missing")))?;
        supervisor.run(master, workers, interrupt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleanupConfig, LeaseConfig, SuperviseConfig};
    use crate::remote::mock::{Call, ChildPlan, MockExecutor};
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn config(nodes: &[&str], processes: usize) -> Config {
        Config {
            testplan: PathBuf::from("locustfile.py"),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            node_count: nodes.len(),
            processes,
            port: 5557,
            run_time: None,
            remote_master: None,
            extra_files: vec![],
            iterations: 0,
            env: vec![],
            master_args: vec![],
            loadgen_command: "locust".into(),
            loglevel: None,
            lease: LeaseConfig {
                check_interval: Duration::from_millis(1),
                max_retries: 1,
                lock_hold: Duration::from_secs(60),
                probe_timeout: Duration::from_millis(50),
            },
            supervise: SuperviseConfig {
                grace: Duration::ZERO,
                tick: Duration::from_millis(1),
                exit_timeout: Duration::from_millis(10),
            },
            cleanup: CleanupConfig {
                kill_timeout: Duration::from_millis(20),
            },
        }
    }

    fn orchestrator(exec: Arc<MockExecutor>, config: Config) -> Orchestrator {
        Orchestrator::new(Arc::new(config), exec)
    }

    fn swept(exec: &MockExecutor, node: &str) -> bool {
        exec.exec_commands_for(node)
            .iter()
            .any(|c| c.contains("pkill -9"))
    }

    #[tokio::test]
    async fn test_completed_run_passes_through_master_exit_code() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child("lg1", ChildPlan::verdict("available"));
        exec.script_child_repeating("lg1", ChildPlan::running());
        // alive through the pre-worker and grace polls, exited in the loop
        exec.script_local_child(ChildPlan::exits_after(2, 7));
        let orch = orchestrator(Arc::clone(&exec), config(&["lg1"], 2));
        let mut interrupt = Interrupt::disarmed();

        assert_eq!(orch.run(&mut interrupt).await, 7);
        assert!(swept(&exec, "lg1"));

        // master, probe marker and two workers all went through teardown
        let dead = exec
            .spawned_flags()
            .iter()
            .filter(|f| {
                f.terminated.load(Ordering::SeqCst) || f.killed.load(Ordering::SeqCst)
            })
            .count();
        assert_eq!(dead, 4);
    }

    #[tokio::test]
    async fn test_launch_failure_still_releases_the_lease() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child("lg1", ChildPlan::verdict("available"));
        exec.fail_spawn_local();
        let orch = orchestrator(Arc::clone(&exec), config(&["lg1"], 2));
        let mut interrupt = Interrupt::disarmed();

        assert_eq!(orch.run(&mut interrupt).await, 5);
        assert!(swept(&exec, "lg1"));
    }

    #[tokio::test]
    async fn test_lease_exhaustion_skips_cleanup() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child_repeating("lg1", ChildPlan::verdict("busy"));
        let orch = orchestrator(Arc::clone(&exec), config(&["lg1"], 2));
        let mut interrupt = Interrupt::disarmed();

        assert_eq!(orch.run(&mut interrupt).await, 4);
        // nothing was launched and no node was swept
        assert!(!swept(&exec, "lg1"));
        assert!(!exec
            .calls()
            .iter()
            .any(|c| matches!(c, Call::SpawnLocal { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_pool_fails_before_any_probe() {
        let exec = Arc::new(MockExecutor::new());
        exec.fail_preflight("lg1", "permission denied");
        let orch = orchestrator(Arc::clone(&exec), config(&["lg1"], 2));
        let mut interrupt = Interrupt::disarmed();

        assert_eq!(orch.run(&mut interrupt).await, 7);
        assert_eq!(exec.calls(), vec![Call::Preflight]);
    }

    #[tokio::test]
    async fn test_pending_interrupt_stops_before_anything_starts() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child_repeating("lg1", ChildPlan::verdict("available"));
        let orch = orchestrator(Arc::clone(&exec), config(&["lg1"], 1));
        let mut interrupt = Interrupt::preset();

        assert_eq!(orch.run(&mut interrupt).await, 130);
        // no probe, no launch, nothing to sweep
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_mid_run_exits_130_after_cleanup() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child("lg1", ChildPlan::verdict("available"));
        exec.script_child_repeating("lg1", ChildPlan::running());
        let orch = orchestrator(Arc::clone(&exec), config(&["lg1"], 1));
        let (mut interrupt, trigger) = Interrupt::armed();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = trigger.send(()).await;
        });

        assert_eq!(orch.run(&mut interrupt).await, 130);
        assert!(swept(&exec, "lg1"));
    }

    #[tokio::test]
    async fn test_timed_out_run_exits_3_and_cleans_up() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child("lg1", ChildPlan::verdict("available"));
        exec.script_child_repeating("lg1", ChildPlan::running());
        let mut cfg = config(&["lg1"], 1);
        cfg.run_time = Some(Duration::from_millis(5));
        let orch = orchestrator(Arc::clone(&exec), cfg);
        let mut interrupt = Interrupt::disarmed();

        // neither the master nor the worker ever exits on its own
        assert_eq!(orch.run(&mut interrupt).await, 3);
        assert!(swept(&exec, "lg1"));

        // the whole fleet went through teardown
        let dead = exec
            .spawned_flags()
            .iter()
            .filter(|f| {
                f.terminated.load(Ordering::SeqCst) || f.killed.load(Ordering::SeqCst)
            })
            .count();
        assert_eq!(dead, 3);
    }

    #[tokio::test]
    async fn test_worker_death_exits_6_and_cleans_up() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_child("lg1", ChildPlan::verdict("available"));
        // first worker survives the grace poll, then dies
        exec.script_child("lg1", ChildPlan::exits_after(1, 3));
        exec.script_child_repeating("lg1", ChildPlan::running());
        let orch = orchestrator(Arc::clone(&exec), config(&["lg1"], 2));
        let mut interrupt = Interrupt::disarmed();

        assert_eq!(orch.run(&mut interrupt).await, 6);
        assert!(swept(&exec, "lg1"));
    }

    #[tokio::test]
    async fn test_master_only_run_probes_nothing() {
        let exec = Arc::new(MockExecutor::new());
        exec.script_local_child(ChildPlan::exits_after(1, 0));
        let mut cfg = config(&["lg1"], 2);
        cfg.node_count = 0;
        let orch = orchestrator(Arc::clone(&exec), cfg);
        let mut interrupt = Interrupt::disarmed();

        assert_eq!(orch.run(&mut interrupt).await, 0);
        let spawns = exec
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Spawn { .. }))
            .count();
        assert_eq!(spawns, 0);
    }
}
