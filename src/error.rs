//! Error taxonomy and exit-code mapping
//!
//! Every fatal failure category gets its own process exit code so that
//! wrapping scripts can tell "the test failed" apart from "the orchestration
//! failed". The master's own exit code is passed through on a completed run.

use thiserror::Error;

/// Exit code reported when the run exceeded its deadline.
pub const EXIT_TIMED_OUT: i32 = 3;
/// Exit code reported when the orchestrator was interrupted by the operator.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Fatal orchestration errors.
///
/// All of these short-circuit supervision; cleanup still runs for every
/// variant that can occur after the lease was taken.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// A candidate node could not be reached before leasing started.
    #[error("cannot ssh to load generator {node}: {reason}")]
    Connectivity { node: String, reason: String },

    /// Fewer than the required nodes became available within the retry budget.
    #[error("never found enough free load generators (wanted {wanted}, best round found {found})")]
    LeaseExhausted { wanted: usize, found: usize },

    /// A probe returned neither "available" nor "busy".
    #[error("could not determine whether load generator {node} is busy; probe command: {command}")]
    Probe { node: String, command: String },

    /// A process failed to start, or exited during the startup grace window.
    #[error("failed to launch {target}: {reason}")]
    Launch { target: String, reason: String },

    /// A worker exited while the master was confirmed still running.
    #[error("worker {replica} on {node} exited with code {code} while the master was still running")]
    WorkerFailed {
        node: String,
        replica: usize,
        code: i32,
    },

    /// Anything else (I/O failures while polling, runtime setup, ...).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SwarmError {
    /// Process exit code for this failure category.
    pub fn exit_code(&self) -> i32 {
        match self {
            SwarmError::LeaseExhausted { .. } => 4,
            SwarmError::Launch { .. } => 5,
            SwarmError::WorkerFailed { .. } => 6,
            SwarmError::Connectivity { .. } => 7,
            SwarmError::Probe { .. } => 8,
            SwarmError::Internal(_) => 1,
        }
    }

    /// Shorthand for wrapping launch failures with their target description.
    pub fn launch(target: impl Into<String>, reason: impl ToString) -> Self {
        SwarmError::Launch {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = vec![
            SwarmError::Connectivity {
                node: "lg1".into(),
                reason: "permission denied".into(),
            },
            SwarmError::LeaseExhausted {
                wanted: 2,
                found: 0,
            },
            SwarmError::Probe {
                node: "lg1".into(),
                command: "pgrep ...".into(),
            },
            SwarmError::launch("master", "spawn failed"),
            SwarmError::WorkerFailed {
                node: "lg1".into(),
                replica: 0,
                code: 1,
            },
            SwarmError::Internal(anyhow::anyhow!("boom")),
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        codes.push(EXIT_TIMED_OUT);
        codes.push(EXIT_INTERRUPTED);
        let unique: std::collections::HashSet<i32> = codes.iter().copied().collect();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn test_launch_error_display() {
        let err = SwarmError::launch("worker 2 on lg3", "exited with code 1 during startup");
        assert_eq!(
            err.to_string(),
            "failed to launch worker 2 on lg3: exited with code 1 during startup"
        );
    }
}
