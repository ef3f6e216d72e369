//! Load-generation tool command lines
//!
//! The orchestrator drives the tool purely through its CLI: master and
//! worker invocations are assembled here and nowhere else. The tool's own
//! exit code is authoritative for the run's outcome, so the master is told
//! to return zero even when individual samples failed.

use crate::config::Config;
use crate::remote::SpawnOptions;
use tracing::warn;

/// How long the master waits for all workers to connect.
const MASTER_CONNECT_WAIT: &str = "60";
/// How long a worker waits for the master before giving up.
const WORKER_CONNECT_WAIT: &str = "30";

/// A worker invocation: the remote command string plus spawn options.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub command: String,
    pub opts: SpawnOptions,
}

/// Argv for the master process.
pub fn master_argv(config: &Config, port: u16, expect_workers: usize) -> Vec<String> {
    let mut argv = vec![
        config.loadgen_command.clone(),
        "--master".to_string(),
        "--master-bind-port".to_string(),
        port.to_string(),
    ];
    if config.remote_master.is_none() {
        // ssh reverse tunnels terminate on localhost; binding only there
        // also avoids firewall popups on workstations
        argv.push("--master-bind-host=127.0.0.1".to_string());
    }
    argv.extend([
        "--expect-workers".to_string(),
        expect_workers.to_string(),
        "--expect-workers-max-wait".to_string(),
        MASTER_CONNECT_WAIT.to_string(),
        "--headless".to_string(),
        "-f".to_string(),
        config.testplan.display().to_string(),
    ]);
    if let Some(run_time) = config.run_time {
        argv.push(format!("--run-time={}s", run_time.as_secs()));
    }
    if config.iterations > 0 && expect_workers > 0 {
        let per_worker = config.iterations / expect_workers as u64;
        let remainder = config.iterations % expect_workers as u64;
        if remainder != 0 {
            warn!(
                "iteration budget not evenly divisible between workers, you will end up with {} fewer iterations than requested",
                remainder
            );
        }
        argv.push("-i".to_string());
        argv.push(per_worker.to_string());
    }
    if let Some(level) = &config.loglevel {
        argv.push("-L".to_string());
        argv.push(level.clone());
    }
    // failed samples are reported by the tool, not turned into a bad exit
    argv.extend(["--exit-code-on-error".to_string(), "0".to_string()]);
    argv.extend(config.master_args.iter().cloned());
    argv
}

/// Remote command string for a master running on another node.
pub fn remote_master_command(argv: &[String], env: &[(String, String)]) -> String {
    format!("{} nohup {}", env_prefix(env), argv.join(" "))
}

/// One worker invocation on `node`. Only the first replica per node sets up
/// the reverse tunnels; later replicas reuse them.
pub fn worker_launch(config: &Config, port: u16, first_on_node: bool) -> WorkerLaunch {
    let mut argv = vec![
        config.loadgen_command.clone(),
        "--worker".to_string(),
        "--master-port".to_string(),
        port.to_string(),
    ];
    if let Some(host) = &config.remote_master {
        argv.push(format!("--master-host={}", host));
    }
    if let Some(level) = &config.loglevel {
        argv.push("-L".to_string());
        argv.push(level.clone());
    }
    argv.extend([
        "--headless".to_string(),
        "--expect-workers-max-wait".to_string(),
        WORKER_CONNECT_WAIT.to_string(),
        // workers receive the plan from the master over the wire
        "-f".to_string(),
        "-".to_string(),
    ]);

    let env = env_prefix(&config.env);

    if config.remote_master.is_some() {
        // nothing tunnels back to this machine, so the worker may outlive
        // the orchestrator's ssh session
        WorkerLaunch {
            command: format!("{} nohup {}", env, argv.join(" ")),
            opts: SpawnOptions::default(),
        }
    } else {
        // `read` blocks on the ssh control channel: when the orchestrator
        // dies the channel closes and the worker is killed with it
        WorkerLaunch {
            command: format!("{} {} & read; kill -9 $!", env, argv.join(" ")),
            opts: SpawnOptions {
                forward_ports: if first_on_node {
                    vec![port, port + 1]
                } else {
                    vec![]
                },
                hold_stdin: true,
                capture_stdout: false,
            },
        }
    }
}

fn env_prefix(env: &[(String, String)]) -> String {
    let mut parts = vec!["PYTHONUNBUFFERED=1".to_string()];
    parts.extend(env.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleanupConfig, LeaseConfig, SuperviseConfig};
    use std::path::PathBuf;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            testplan: PathBuf::from("locustfile.py"),
            nodes: vec!["lg1".into(), "lg2".into()],
            node_count: 2,
            processes: 4,
            port: 5557,
            run_time: Some(Duration::from_secs(300)),
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

    #[test]
    fn test_master_argv_local() {
        let argv = master_argv(&config(), 5557, 8);
        let joined = argv.join(" ");
        assert!(joined.starts_with("locust --master --master-bind-port 5557"));
        assert!(joined.contains("--master-bind-host=127.0.0.1"));
        assert!(joined.contains("--expect-workers 8"));
        assert!(joined.contains("--run-time=300s"));
        assert!(joined.contains("--exit-code-on-error 0"));
        assert!(joined.contains("-f locustfile.py"));
    }

    #[test]
    fn test_master_argv_passthrough_goes_last() {
        let mut cfg = config();
        cfg.master_args = vec!["--users".into(), "50".into()];
        let argv = master_argv(&cfg, 5557, 8);
        assert_eq!(&argv[argv.len() - 2..], ["--users", "50"]);
    }

    #[test]
    fn test_master_argv_remote_does_not_bind_localhost() {
        let mut cfg = config();
        cfg.remote_master = Some("master-host".into());
        let argv = master_argv(&cfg, 5557, 8);
        assert!(!argv.join(" ").contains("--master-bind-host"));
    }

    #[test]
    fn test_iterations_divided_across_workers() {
        let mut cfg = config();
        cfg.iterations = 100;
        let argv = master_argv(&cfg, 5557, 8);
        let joined = argv.join(" ");
        assert!(joined.contains("-i 12")); // 100 / 8, remainder warned about
    }

    #[test]
    fn test_remote_master_command_uses_nohup() {
        let mut cfg = config();
        cfg.remote_master = Some("master-host".into());
        let argv = master_argv(&cfg, 5557, 8);
        let cmd = remote_master_command(&argv, &cfg.env);
        assert!(cmd.starts_with("PYTHONUNBUFFERED=1 nohup locust --master"));
    }

    #[test]
    fn test_first_worker_gets_tunnels() {
        let launch = worker_launch(&config(), 5557, true);
        assert_eq!(launch.opts.forward_ports, vec![5557, 5558]);
        assert!(launch.opts.hold_stdin);
        assert!(launch.command.ends_with("& read; kill -9 $!"));
        assert!(launch.command.contains("locust --worker --master-port 5557"));
        assert!(launch.command.contains("-f -"));
    }

    #[test]
    fn test_later_workers_skip_tunnels() {
        let launch = worker_launch(&config(), 5557, false);
        assert!(launch.opts.forward_ports.is_empty());
        assert!(launch.opts.hold_stdin);
    }

    #[test]
    fn test_remote_master_worker_is_detached() {
        let mut cfg = config();
        cfg.remote_master = Some("master-host".into());
        let launch = worker_launch(&cfg, 5557, true);
        assert!(launch.opts.forward_ports.is_empty());
        assert!(!launch.opts.hold_stdin);
        assert!(launch.command.contains("nohup"));
        assert!(launch.command.contains("--master-host=master-host"));
        assert!(!launch.command.contains("read; kill"));
    }

    #[test]
    fn test_env_pairs_are_exported() {
        let mut cfg = config();
        cfg.env = vec![("TEST_ENV".into(), "staging".into())];
        let launch = worker_launch(&cfg, 5557, true);
        assert!(launch
            .command
            .starts_with("PYTHONUNBUFFERED=1 TEST_ENV=\"staging\" locust --worker"));
    }
}
