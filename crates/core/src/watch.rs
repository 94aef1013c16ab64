//! Supervision of the local process set.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{FailedProcess, LaunchError, Result};
use crate::launch::RoleProcessHandle;
use crate::terminate::{terminate_local_procs, TerminationPolicy};
use crate::topology::Role;

/// Default pause between two passes.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(3);

/// Upper bound on log bytes forwarded per call. The rest is picked up by
/// later passes.
pub const MAX_LOG_CHUNK: u64 = 1 << 20;

/// Copy what the handle's log gained since the last call into `out`, at
/// most [`MAX_LOG_CHUNK`] bytes.
pub fn pull_worker_log(handle: &mut RoleProcessHandle, out: &mut dyn Write) -> io::Result<()> {
    let Some(path) = &handle.log_path else {
        return Ok(());
    };
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(handle.log_offset))?;
    let copied = io::copy(&mut file.take(MAX_LOG_CHUNK), out)?;
    out.flush()?;
    handle.log_offset += copied;
    Ok(())
}

/// Stop every handle and hand back `err`. A termination failure is logged
/// rather than replacing the error that triggered it.
fn abort(
    handles: &mut [RoleProcessHandle],
    policy: &TerminationPolicy,
    clock: &dyn Clock,
    err: LaunchError,
) -> LaunchError {
    if let Err(term) = terminate_local_procs(handles, policy, clock) {
        tracing::error!(error = %term, "failed to stop local processes");
    }
    err
}

/// One polling pass over every handle.
///
/// Forwards new output of local slot 0 to `out`, polls each process and, if
/// any exited non-zero, terminates all of them and returns
/// [`LaunchError::RoleProcessFailure`]. Returns whether a process whose role
/// satisfies `defines_liveness` is still running.
fn watch_pass(
    handles: &mut [RoleProcessHandle],
    nranks: usize,
    out: &mut dyn Write,
    defines_liveness: &dyn Fn(Role) -> bool,
) -> Result<bool> {
    let mut alive = false;
    let mut failed = Vec::new();
    for handle in handles.iter_mut() {
        if handle.local_rank == 0 && handle.role == Role::Trainer && handle.log.is_some() {
            if let Err(e) = pull_worker_log(handle, out) {
                tracing::warn!(error = %e, "failed to forward worker log");
            }
        }

        match handle.process.poll()? {
            None => alive |= defines_liveness(handle.role),
            Some(0) => {}
            Some(code) => {
                tracing::warn!(role = %handle.role, rank = handle.rank, code, "process exited with failure");
                failed.push(FailedProcess {
                    role: handle.role,
                    rank: handle.rank,
                    code,
                });
            }
        }
    }

    if !failed.is_empty() {
        return Err(LaunchError::RoleProcessFailure { failed, nranks });
    }
    Ok(alive)
}

/// One pass where every handle counts towards liveness.
pub fn watch_local_trainers(
    handles: &mut [RoleProcessHandle],
    nranks: usize,
    out: &mut dyn Write,
    policy: &TerminationPolicy,
    clock: &dyn Clock,
) -> Result<bool> {
    match watch_pass(handles, nranks, out, &|_| true) {
        Ok(alive) => Ok(alive),
        Err(e) => {
            tracing::error!("ABORT!!! {e}");
            Err(abort(handles, policy, clock, e))
        }
    }
}

/// Periodic supervision loop.
pub struct Watchdog<'a> {
    pub interval: Duration,
    pub termination: TerminationPolicy,
    clock: &'a dyn Clock,
    interrupted: Option<&'a AtomicBool>,
}

impl<'a> Watchdog<'a> {
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self {
            interval: WATCH_INTERVAL,
            termination: TerminationPolicy::default(),
            clock,
            interrupted: None,
        }
    }

    /// Stop the job once `flag` is set.
    pub fn with_interrupt(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupted = Some(flag);
        self
    }

    /// Run until every handle exited cleanly.
    pub fn run(
        &self,
        handles: &mut [RoleProcessHandle],
        nranks: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        self.run_until(handles, nranks, out, |_| true)
    }

    /// Run until no handle of a role accepted by `defines_liveness` is
    /// running. Failures of any role still abort the whole set.
    pub fn run_until(
        &self,
        handles: &mut [RoleProcessHandle],
        nranks: usize,
        out: &mut dyn Write,
        defines_liveness: impl Fn(Role) -> bool,
    ) -> Result<()> {
        loop {
            if self.interrupted.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                tracing::warn!("interrupted, stopping local processes");
                return Err(abort(
                    handles,
                    &self.termination,
                    self.clock,
                    LaunchError::Interrupted,
                ));
            }

            match watch_pass(handles, nranks, out, &defines_liveness) {
                Ok(true) => self.clock.sleep(self.interval),
                Ok(false) => return Ok(()),
                Err(e) => {
                    tracing::error!("ABORT!!! {e}");
                    return Err(abort(handles, &self.termination, self.clock, e));
                }
            }
        }
    }
}
