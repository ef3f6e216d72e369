//! SSH-backed executor
//!
//! Runs remote commands through the system `ssh` client and file sync
//! through `rsync`. Node identity is whatever ssh can connect to (hostname,
//! alias from ~/.ssh/config, user@host). Authentication is the user's
//! problem: keys must work non-interactively (BatchMode), so passphrase keys
//! need ssh-agent.

use crate::error::SwarmError;
use crate::remote::{ExecOutput, Executor, Liveness, RemoteChild, SpawnOptions};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};
use tracing::debug;

/// How long a short-lived remote command may take before we give up.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);
/// Reachability checks fail fast; a wedged node should not stall the run.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Executor that shells out to `ssh` and `rsync`.
#[derive(Debug, Clone, Default)]
pub struct SshExecutor;

impl SshExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn run_local(mut cmd: Command, timeout: Duration, desc: &str) -> Result<ExecOutput> {
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .with_context(|| format!("{} timed out after {:?}", desc, timeout))?
            .with_context(|| format!("failed to run {}", desc))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: exit_code(&output.status),
        })
    }

    /// One reachability check against `node`.
    async fn reach(node: &str, accept_new: bool) -> Result<ExecOutput, SwarmError> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("LogLevel=error")
            .arg("-o")
            .arg("BatchMode=yes");
        if accept_new {
            cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        }
        cmd.arg(node).arg("true").stdin(Stdio::null());
        Self::run_local(cmd, PREFLIGHT_TIMEOUT, "ssh preflight")
            .await
            .map_err(|e| SwarmError::Connectivity {
                node: node.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn exec(&self, node: &str, command: &str) -> Result<ExecOutput> {
        debug!(node, command, "ssh exec");
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("LogLevel=error")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(node)
            .arg(command)
            .stdin(Stdio::null());
        Self::run_local(cmd, EXEC_TIMEOUT, "ssh").await
    }

    fn spawn(
        &self,
        node: &str,
        command: &str,
        opts: SpawnOptions,
    ) -> Result<Box<dyn RemoteChild>> {
        debug!(node, command, "ssh spawn");
        let mut cmd = Command::new("ssh");
        cmd.arg("-q");
        for port in &opts.forward_ports {
            cmd.arg("-R").arg(format!("{port}:localhost:{port}"));
        }
        cmd.arg(node).arg(command);

        cmd.stdin(if opts.hold_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(if opts.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        // Put the ssh client in its own process group so a terminal Ctrl-C
        // reaches the orchestrator only; workers are stopped via cleanup.
        cmd.process_group(0);
        cmd.kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn ssh to {}", node))?;
        let lines = child
            .stdout
            .take()
            .map(|out| BufReader::new(out).lines());

        Ok(Box::new(SshChild {
            desc: format!("ssh {} {}", node, command),
            child,
            lines,
        }))
    }

    fn spawn_local(
        &self,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<Box<dyn RemoteChild>> {
        let (program, args) = argv
            .split_first()
            .context("empty local command")?;
        debug!(command = argv.join(" "), "local spawn");

        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(false);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", program))?;

        Ok(Box::new(SshChild {
            desc: argv.join(" "),
            child,
            lines: None,
        }))
    }

    async fn sync_files(&self, node: &str, paths: &[PathBuf]) -> Result<ExecOutput> {
        debug!(node, ?paths, "rsync");
        let mut cmd = Command::new("rsync");
        cmd.arg("-qrtl")
            .arg("--exclude")
            .arg("__pycache__")
            .args(paths)
            .arg(format!("{}:", node))
            .stdin(Stdio::null());
        Self::run_local(cmd, EXEC_TIMEOUT, "rsync").await
    }

    async fn preflight(&self, nodes: &[String]) -> Result<(), SwarmError> {
        // Every node gets its own check: a pool where only the first node
        // answers would otherwise fail deep into the launch sequence. First
        // contact with freshly provisioned nodes is handled by retrying
        // with their host keys accepted.
        let mut accept_new = false;
        for node in nodes {
            let out = Self::reach(node, accept_new).await?;
            if out.success() {
                continue;
            }

            if !accept_new
                && (out.stderr.contains("Host key verification failed")
                    || out.stdout.contains("Host key verification failed"))
            {
                accept_new = true;
                let out = Self::reach(node, true).await?;
                if out.success() {
                    continue;
                }
                return Err(SwarmError::Connectivity {
                    node: node.clone(),
                    reason: out.stderr.trim().to_string(),
                });
            }

            return Err(SwarmError::Connectivity {
                node: node.clone(),
                reason: format!(
                    "{} (maybe you lack permission, or your key needs ssh-agent)",
                    out.stderr.trim()
                ),
            });
        }
        Ok(())
    }
}

/// Handle around a locally spawned process (ssh client or local master).
struct SshChild {
    desc: String,
    child: tokio::process::Child,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

#[async_trait]
impl RemoteChild for SshChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn describe(&self) -> &str {
        &self.desc
    }

    fn poll(&mut self) -> Result<Liveness> {
        match self.child.try_wait().context("try_wait failed")? {
            Some(status) => Ok(Liveness::Exited(exit_code(&status))),
            None => Ok(Liveness::Running),
        }
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        match self.lines.as_mut() {
            Some(lines) => Ok(lines.next_line().await.context("reading stdout")?),
            None => Ok(None),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain kill(2) on a pid we own; failure is tolerated.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        // Already-reaped children make start_kill fail; that is fine.
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        Ok(())
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_local_and_poll_to_exit() {
        let exec = SshExecutor::new();
        let argv = vec!["true".to_string()];
        let mut child = exec.spawn_local(&argv, &[]).unwrap();

        // poll until the process is reaped
        for _ in 0..50 {
            match child.poll().unwrap() {
                Liveness::Exited(code) => {
                    assert_eq!(code, 0);
                    return;
                }
                Liveness::Running => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        panic!("child never exited");
    }

    #[tokio::test]
    async fn test_spawn_local_nonzero_exit() {
        let exec = SshExecutor::new();
        let argv = vec!["false".to_string()];
        let mut child = exec.spawn_local(&argv, &[]).unwrap();

        loop {
            match child.poll().unwrap() {
                Liveness::Exited(code) => {
                    assert_eq!(code, 1);
                    break;
                }
                Liveness::Running => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    #[tokio::test]
    async fn test_kill_long_running_local_child() {
        let exec = SshExecutor::new();
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let mut child = exec.spawn_local(&argv, &[]).unwrap();

        assert_eq!(child.poll().unwrap(), Liveness::Running);
        child.kill().await.unwrap();
        assert!(matches!(child.poll().unwrap(), Liveness::Exited(_)));
    }

    #[tokio::test]
    async fn test_preflight_empty_node_list_is_ok() {
        let exec = SshExecutor::new();
        exec.preflight(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_preflight_names_the_unreachable_node() {
        let exec = SshExecutor::new();
        // .invalid never resolves, so this fails fast without a network
        let nodes = vec!["no-such-host.invalid".to_string()];
        let err = exec.preflight(&nodes).await.unwrap_err();
        match err {
            SwarmError::Connectivity { node, .. } => {
                assert_eq!(node, "no-such-host.invalid");
            }
            other => panic!("expected Connectivity, got {other}"),
        }
    }
}
