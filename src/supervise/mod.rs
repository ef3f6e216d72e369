//! Run supervision
//!
//! One loop watches the whole fleet: the master's exit ends the run and its
//! code is authoritative, a worker death while the master lives aborts the
//! run, and a single deadline derived from the run time bounds everything.
//! Interrupts are checked once per poll cycle so a finished master still
//! wins over a simultaneous Ctrl-C.

use crate::config::SuperviseConfig;
use crate::error::SwarmError;
use crate::launch::{ProcessHandle, ProcessState};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The master exited on its own; carries the master's exit code.
    Completed(i32),
    /// The deadline passed before the master finished.
    TimedOut,
    /// The operator interrupted the run.
    Interrupted,
}

/// Operator interrupt (SIGINT/SIGTERM), delivered at most once.
pub struct Interrupt {
    rx: mpsc::Receiver<()>,
    // keeps a disarmed channel open so recv() blocks instead of returning
    _tx: mpsc::Sender<()>,
    fired: bool,
}

impl Interrupt {
    /// Install signal handlers for SIGINT and SIGTERM.
    pub fn install() -> crate::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let (tx, rx) = mpsc::channel(1);
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let notify = tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            let _ = notify.send(()).await;
        });
        Ok(Self {
            rx,
            _tx: tx,
            fired: false,
        })
    }

    /// An interrupt source that never fires.
    pub fn disarmed() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            rx,
            _tx: tx,
            fired: false,
        }
    }

    /// An interrupt that has already been delivered.
    #[cfg(test)]
    pub fn preset() -> Self {
        let mut interrupt = Self::disarmed();
        interrupt.fired = true;
        interrupt
    }

    /// An interrupt a test can trigger by sending on the returned channel.
    #[cfg(test)]
    pub fn armed() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel(1);
        let interrupt = Self {
            rx,
            _tx: tx.clone(),
            fired: false,
        };
        (interrupt, tx)
    }

    /// Non-blocking check; sticky once delivered.
    pub fn pending(&mut self) -> bool {
        if self.fired {
            return true;
        }
        if self.rx.try_recv().is_ok() {
            self.fired = true;
        }
        self.fired
    }

    /// Wait for the interrupt. Returns immediately if already delivered.
    pub async fn recv(&mut self) {
        if self.fired {
            return;
        }
        let _ = self.rx.recv().await;
        self.fired = true;
    }
}

/// Watches the fleet until the run resolves one way or another.
pub struct Supervisor {
    grace: Duration,
    tick: Duration,
    /// Total budget from supervision start; `None` means unbounded.
    deadline: Option<Duration>,
}

impl Supervisor {
    pub fn new(settings: &SuperviseConfig, run_time: Option<Duration>) -> Self {
        Self {
            grace: settings.grace,
            tick: settings.tick,
            deadline: run_time.map(|rt| rt + settings.exit_timeout),
        }
    }

    /// Supervise until completion, deadline, interrupt or a fatal error.
    /// Does not clean anything up; the caller owns the handles throughout.
    pub async fn run(
        &self,
        master: &mut ProcessHandle,
        workers: &mut [ProcessHandle],
        interrupt: &mut Interrupt,
    ) -> Result<Outcome, SwarmError> {
        let start = Instant::now();

        // startup grace: any exit in this window is a failed launch
        pause(self.grace, interrupt).await;
        for handle in std::iter::once(&mut *master).chain(workers.iter_mut()) {
            if let ProcessState::Exited(code) = handle.poll()? {
                return Err(SwarmError::launch(
                    handle.target(),
                    format!("exited with code {} during startup", code),
                ));
            }
        }
        info!("all processes up, supervising");

        loop {
            // the master's own verdict always wins
            if let ProcessState::Exited(code) = master.poll()? {
                info!("master finished with exit code {}", code);
                return Ok(Outcome::Completed(code));
            }

            if interrupt.pending() {
                warn!("interrupted, stopping the run");
                return Ok(Outcome::Interrupted);
            }

            if let Some(deadline) = self.deadline {
                if start.elapsed() >= deadline {
                    warn!(
                        "run exceeded its {}s budget, stopping the master",
                        deadline.as_secs()
                    );
                    let _ = master.terminate();
                    return Ok(Outcome::TimedOut);
                }
            }

            for worker in workers.iter_mut() {
                if let ProcessState::Exited(code) = worker.poll()? {
                    // the master may have finished in the same instant and
                    // torn its workers down; that is a normal completion
                    if let ProcessState::Exited(master_code) = master.poll()? {
                        info!("master finished with exit code {}", master_code);
                        return Ok(Outcome::Completed(master_code));
                    }
                    let _ = master.terminate();
                    return Err(SwarmError::WorkerFailed {
                        node: worker.node.clone().unwrap_or_default(),
                        replica: worker.replica,
                        code,
                    });
                }
            }

            pause(self.tick, interrupt).await;
        }
    }
}

/// Sleep for `duration`, waking early when the interrupt arrives. The caller
/// re-checks `pending()` on its next cycle.
async fn pause(duration: Duration, interrupt: &mut Interrupt) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = interrupt.recv() => {}
    }
}
