//! Graceful-then-forced teardown of local role-processes.

use std::time::Duration;

use crate::clock::Clock;
use crate::error::{LaunchError, Result};
use crate::launch::RoleProcessHandle;

/// Timing of [`terminate_local_procs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// Wait after SIGTERM before the first kill round.
    pub grace: Duration,
    /// Kill rounds before giving up.
    pub retries: usize,
    /// Wait between kill rounds.
    pub interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            retries: 50,
            interval: Duration::from_secs(3),
        }
    }
}

fn is_running(handle: &mut RoleProcessHandle) -> bool {
    match handle.process.poll() {
        Ok(status) => status.is_none(),
        Err(e) => {
            tracing::warn!(pid = handle.pid(), error = %e, "failed to poll process");
            true
        }
    }
}

/// Stop every still-running handle.
///
/// Running processes get SIGTERM and their logs are closed. After the grace
/// period survivors are killed, up to `policy.retries` rounds. Handles that
/// already exited are left alone, so calling this twice is harmless.
pub fn terminate_local_procs(
    handles: &mut [RoleProcessHandle],
    policy: &TerminationPolicy,
    clock: &dyn Clock,
) -> Result<()> {
    let mut signalled = 0;
    for handle in handles.iter_mut() {
        if is_running(handle) {
            if let Err(e) = handle.process.terminate() {
                tracing::warn!(pid = handle.pid(), error = %e, "failed to send SIGTERM");
            }
            signalled += 1;
            tracing::debug!(pid = handle.pid(), "terminate process");
        }
        handle.close_log();
    }
    if signalled == 0 {
        return Ok(());
    }

    clock.sleep(policy.grace);
    for _ in 0..policy.retries {
        let mut alive = false;
        for handle in handles.iter_mut() {
            if is_running(handle) {
                if let Err(e) = handle.process.kill() {
                    tracing::warn!(pid = handle.pid(), error = %e, "failed to send SIGKILL");
                }
                alive = true;
            }
        }

        if !alive {
            tracing::info!("terminated all local processes");
            return Ok(());
        }
        clock.sleep(policy.interval);
    }

    let pids: Vec<u32> = handles
        .iter_mut()
        .filter_map(|h| is_running(h).then(|| h.pid()))
        .collect();
    if pids.is_empty() {
        tracing::info!("terminated all local processes");
        return Ok(());
    }
    tracing::error!(pids = ?pids, "can't kill all processes");
    Err(LaunchError::TerminationTimeout { pids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvMap;
    use crate::launch::Launcher;
    use crate::process::LaunchCommand;
    use crate::testing::{FakeBehavior, FakeSpawner, ManualClock};
    use crate::topology::{Cluster, Endpoint, Pod, RoleProcess};

    fn start(spawner: &FakeSpawner, n: usize) -> Vec<RoleProcessHandle> {
        let mut pod = Pod::new(0, "127.0.0.1");
        pod.trainers = (0..n)
            .map(|i| RoleProcess {
                devices: vec![i as u32],
                endpoint: Endpoint::new("127.0.0.1", 6070 + i as u16),
                rank: i,
            })
            .collect();
        let cluster = Cluster::new(vec![pod]);
        let cmd = LaunchCommand::new(None, "train", Vec::<String>::new());
        Launcher::new(spawner, cmd, None, EnvMap::new())
            .start_local_trainers(&cluster, &cluster.pods[0], &EnvMap::new())
            .unwrap()
    }

    #[test]
    fn graceful_stop_needs_no_kill() {
        let spawner = FakeSpawner::new(FakeBehavior::runs_forever());
        let mut handles = start(&spawner, 3);
        let clock = ManualClock::new();

        terminate_local_procs(&mut handles, &TerminationPolicy::default(), &clock).unwrap();

        for proc in spawner.spawned() {
            assert_eq!(proc.terminate_calls(), 1);
            assert_eq!(proc.kill_calls(), 0);
        }
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(3)]);
    }

    #[test]
    fn stubborn_process_is_killed() {
        let spawner = FakeSpawner::scripted(
            [FakeBehavior::ignores_terminate()],
            FakeBehavior::runs_forever(),
        );
        let mut handles = start(&spawner, 2);
        let clock = ManualClock::new();

        terminate_local_procs(&mut handles, &TerminationPolicy::default(), &clock).unwrap();

        let spawned = spawner.spawned();
        assert_eq!(spawned[0].kill_calls(), 1);
        assert_eq!(spawned[0].exit_status(), Some(-9));
        assert_eq!(spawned[1].kill_calls(), 0);
        assert_eq!(clock.total_slept(), Duration::from_secs(6));
    }

    #[test]
    fn unkillable_process_times_out() {
        let spawner = FakeSpawner::new(FakeBehavior::unkillable());
        let mut handles = start(&spawner, 1);
        let clock = ManualClock::new();
        let policy = TerminationPolicy {
            retries: 4,
            ..TerminationPolicy::default()
        };

        let err = terminate_local_procs(&mut handles, &policy, &clock).unwrap_err();

        assert!(matches!(err, LaunchError::TerminationTimeout { ref pids } if pids == &vec![1000]));
        assert_eq!(spawner.spawned()[0].kill_calls(), 4);
        assert_eq!(clock.sleeps().len(), 5);
    }

    #[test]
    fn teardown_is_idempotent() {
        let spawner = FakeSpawner::scripted([FakeBehavior::exits(0, 0)], FakeBehavior::runs_forever());
        let mut handles = start(&spawner, 2);
        let clock = ManualClock::new();

        terminate_local_procs(&mut handles, &TerminationPolicy::default(), &clock).unwrap();
        terminate_local_procs(&mut handles, &TerminationPolicy::default(), &clock).unwrap();

        let spawned = spawner.spawned();
        assert_eq!(spawned[0].terminate_calls(), 0);
        assert_eq!(spawned[1].terminate_calls(), 1);
        assert!(spawned.iter().all(|p| p.kill_calls() == 0));
        // The second call finds nothing running and doesn't wait.
        assert_eq!(clock.sleeps().len(), 1);
        assert!(handles.iter().all(|h| h.log.is_none()));
    }
}
