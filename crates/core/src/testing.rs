//! Test doubles for process control and time.
//!
//! [`FakeSpawner`] hands out scripted [`FakeProcess`]es that record every
//! signal they receive, and [`ManualClock`] records sleeps instead of
//! performing them.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Clock;
use crate::env::EnvMap;
use crate::process::{LaunchCommand, Output, ProcessControl, Spawner};

const SIGTERM_CODE: i32 = -15;
const SIGKILL_CODE: i32 = -9;

/// How a fake process behaves once spawned.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Polls answered with "running" before the process exits by itself.
    /// `None` means it only exits when signalled.
    pub runs_for: Option<usize>,
    pub exit_code: i32,
    pub stops_on_terminate: bool,
    pub stops_on_kill: bool,
    /// Written to the log file at spawn time.
    pub output: Vec<u8>,
}

impl FakeBehavior {
    pub fn exits(code: i32, after_polls: usize) -> Self {
        Self {
            runs_for: Some(after_polls),
            exit_code: code,
            stops_on_terminate: true,
            stops_on_kill: true,
            output: Vec::new(),
        }
    }

    pub fn runs_forever() -> Self {
        Self {
            runs_for: None,
            exit_code: 0,
            stops_on_terminate: true,
            stops_on_kill: true,
            output: Vec::new(),
        }
    }

    /// Ignores SIGTERM, dies on SIGKILL.
    pub fn ignores_terminate() -> Self {
        Self {
            stops_on_terminate: false,
            ..Self::runs_forever()
        }
    }

    /// Survives every signal.
    pub fn unkillable() -> Self {
        Self {
            stops_on_terminate: false,
            stops_on_kill: false,
            ..Self::runs_forever()
        }
    }

    pub fn with_output(mut self, output: impl Into<Vec<u8>>) -> Self {
        self.output = output.into();
        self
    }
}

#[derive(Debug)]
struct FakeState {
    pid: u32,
    behavior: FakeBehavior,
    polls: usize,
    exited: Option<i32>,
    terminate_calls: usize,
    kill_calls: usize,
    cmd: LaunchCommand,
    env: EnvMap,
}

/// Shared handle to a scripted process; clones observe the same state.
#[derive(Debug, Clone)]
pub struct FakeProcess(Arc<Mutex<FakeState>>);

impl FakeProcess {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn terminate_calls(&self) -> usize {
        self.state().terminate_calls
    }

    pub fn kill_calls(&self) -> usize {
        self.state().kill_calls
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.state().exited
    }

    pub fn env(&self) -> EnvMap {
        self.state().env.clone()
    }

    pub fn cmd(&self) -> LaunchCommand {
        self.state().cmd.clone()
    }

    /// Make the process exit on its next poll.
    pub fn finish(&self, code: i32) {
        self.state().exited = Some(code);
    }
}

impl ProcessControl for FakeProcess {
    fn id(&self) -> u32 {
        self.state().pid
    }

    fn poll(&mut self) -> io::Result<Option<i32>> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.exited.is_none() {
            match state.behavior.runs_for {
                Some(n) if state.polls >= n => state.exited = Some(state.behavior.exit_code),
                _ => state.polls += 1,
            }
        }
        Ok(state.exited)
    }

    fn terminate(&mut self) -> io::Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.terminate_calls += 1;
        if state.behavior.stops_on_terminate && state.exited.is_none() {
            state.exited = Some(SIGTERM_CODE);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.kill_calls += 1;
        if state.behavior.stops_on_kill && state.exited.is_none() {
            state.exited = Some(SIGKILL_CODE);
        }
        Ok(())
    }

    fn wait(&mut self) -> io::Result<i32> {
        let mut guard = self.state();
        let state = &mut *guard;
        if let Some(code) = state.exited {
            return Ok(code);
        }
        if state.behavior.runs_for.is_some() {
            state.exited = Some(state.behavior.exit_code);
            return Ok(state.behavior.exit_code);
        }
        Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "fake process never exits on its own",
        ))
    }
}

/// [`Spawner`] that hands out [`FakeProcess`]es in spawn order.
#[derive(Debug)]
pub struct FakeSpawner {
    script: Mutex<VecDeque<FakeBehavior>>,
    default: FakeBehavior,
    spawned: Mutex<Vec<FakeProcess>>,
}

impl FakeSpawner {
    /// Every process gets `default`.
    pub fn new(default: FakeBehavior) -> Self {
        Self::scripted(Vec::new(), default)
    }

    /// The n-th spawned process follows the n-th behavior, then `default`.
    pub fn scripted(script: impl IntoIterator<Item = FakeBehavior>, default: FakeBehavior) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            default,
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn spawned(&self) -> Vec<FakeProcess> {
        self.spawned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(
        &self,
        cmd: &LaunchCommand,
        env: &EnvMap,
        output: Output,
    ) -> io::Result<Box<dyn ProcessControl>> {
        let behavior = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if let Output::File(mut file) = output {
            file.write_all(&behavior.output)?;
        }

        let mut spawned = self
            .spawned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let process = FakeProcess(Arc::new(Mutex::new(FakeState {
            pid: 1000 + spawned.len() as u32,
            behavior,
            polls: 0,
            exited: None,
            terminate_calls: 0,
            kill_calls: 0,
            cmd: cmd.clone(),
            env: env.clone(),
        })));
        spawned.push(process.clone());
        Ok(Box::new(process))
    }
}

/// [`Clock`] that records requested sleeps without waiting.
#[derive(Debug, Default)]
pub struct ManualClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}
