//! Error types for launching and supervising a training job.

use std::fmt;

use thiserror::Error;

use crate::topology::Role;

/// Errors that can occur while building the topology or running the fleet.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The launch description is inconsistent. Raised before anything is spawned.
    #[error("configuration error: {0}")]
    Config(String),

    /// Free-port probing ran out of attempts.
    #[error("could not find {requested} free ports")]
    Allocation { requested: usize },

    /// One or more local role-processes exited with a non-zero status.
    #[error(
        "out of all {nranks} trainers, {} aborted; check their logs",
        join_failed(.failed)
    )]
    RoleProcessFailure {
        failed: Vec<FailedProcess>,
        nranks: usize,
    },

    /// Signalled processes did not exit within the termination budget.
    #[error("could not terminate local processes {pids:?}")]
    TerminationTimeout { pids: Vec<u32> },

    /// The operator asked the launcher to stop.
    #[error("interrupted")]
    Interrupted,

    /// Starting a child process failed.
    #[error("failed to spawn rank {rank}: {source}")]
    Spawn {
        rank: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code the launcher should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;

/// A local role-process that exited with a non-zero status. Ranks count per
/// role, so the role is part of its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedProcess {
    pub role: Role,
    pub rank: usize,
    pub code: i32,
}

impl fmt::Display for FailedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rank {} (exit code {})", self.role, self.rank, self.code)
    }
}

fn join_failed(failed: &[FailedProcess]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_names_role_and_rank() {
        let err = LaunchError::RoleProcessFailure {
            failed: vec![
                FailedProcess {
                    role: Role::Server,
                    rank: 0,
                    code: 2,
                },
                FailedProcess {
                    role: Role::Trainer,
                    rank: 0,
                    code: 1,
                },
            ],
            nranks: 3,
        };
        assert_eq!(
            err.to_string(),
            "out of all 3 trainers, PSERVER rank 0 (exit code 2), TRAINER rank 0 (exit code 1) \
             aborted; check their logs"
        );
        assert_eq!(err.exit_code(), 1);
        assert_eq!(LaunchError::Interrupted.exit_code(), 130);
    }
}
