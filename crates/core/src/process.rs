//! OS process control behind a small interface.
//!
//! The monitor and termination logic only talk to [`ProcessControl`], so they
//! can be driven by [`crate::testing::FakeSpawner`] in tests.

use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::env::EnvMap;

/// Program and argument vector of one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl LaunchCommand {
    /// `[interpreter] script args...`
    pub fn new<S, A>(interpreter: Option<S>, script: S, script_args: A) -> Self
    where
        S: Into<OsString>,
        A: IntoIterator,
        A::Item: Into<OsString>,
    {
        let script = script.into();
        let script_args = script_args.into_iter().map(Into::into);
        match interpreter {
            Some(interp) => Self {
                program: interp.into(),
                args: std::iter::once(script).chain(script_args).collect(),
            },
            None => Self {
                program: script,
                args: script_args.collect(),
            },
        }
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Where a child's stdout and stderr go.
#[derive(Debug)]
pub enum Output {
    Inherit,
    File(File),
}

/// A running (or finished) child process.
pub trait ProcessControl: Send {
    fn id(&self) -> u32;

    /// Non-blocking status check. `Ok(None)` while the process is running,
    /// otherwise its exit code (negative signal number if it was killed).
    fn poll(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to stop.
    fn terminate(&mut self) -> io::Result<()>;

    /// Stop the process unconditionally.
    fn kill(&mut self) -> io::Result<()>;

    /// Block until the process exits.
    fn wait(&mut self) -> io::Result<i32>;
}

/// Starts child processes.
pub trait Spawner {
    fn spawn(
        &self,
        cmd: &LaunchCommand,
        env: &EnvMap,
        output: Output,
    ) -> io::Result<Box<dyn ProcessControl>>;
}

/// [`Spawner`] for real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSpawner;

impl Spawner for OsSpawner {
    fn spawn(
        &self,
        cmd: &LaunchCommand,
        env: &EnvMap,
        output: Output,
    ) -> io::Result<Box<dyn ProcessControl>> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args).env_clear().envs(env);
        if let Output::File(file) = output {
            command
                .stdout(Stdio::from(file.try_clone()?))
                .stderr(Stdio::from(file));
        }
        let child = command.spawn()?;
        Ok(Box::new(OsProcess { child }))
    }
}

struct OsProcess {
    child: Child,
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

impl ProcessControl for OsProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn poll(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let pid = libc::pid_t::try_from(self.child.id())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child we have not yet reaped.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<i32> {
        Ok(exit_code(self.child.wait()?))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchCommand {
        LaunchCommand::new(Some("/bin/sh"), "-c", [script])
    }

    #[test]
    fn command_with_interpreter() {
        let cmd = LaunchCommand::new(Some("python3"), "train.py", ["--epochs", "2"]);
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.to_string(), "python3 train.py --epochs 2");

        let bare = LaunchCommand::new(None, "./train", Vec::<String>::new());
        assert_eq!(bare.to_string(), "./train");
    }

    #[test]
    fn exit_codes_are_reported() {
        let mut ok = OsSpawner
            .spawn(&sh("exit 0"), &EnvMap::new(), Output::Inherit)
            .unwrap();
        assert_eq!(ok.wait().unwrap(), 0);

        let mut failed = OsSpawner
            .spawn(&sh("exit 3"), &EnvMap::new(), Output::Inherit)
            .unwrap();
        assert_eq!(failed.wait().unwrap(), 3);
        assert_eq!(failed.poll().unwrap(), Some(3));
    }

    #[test]
    fn terminate_stops_a_sleeping_child() {
        let mut child = OsSpawner
            .spawn(&sh("sleep 30"), &EnvMap::new(), Output::Inherit)
            .unwrap();
        assert_eq!(child.poll().unwrap(), None);
        child.terminate().unwrap();
        assert_eq!(child.wait().unwrap(), -libc::SIGTERM);
    }

    #[test]
    fn environment_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let file = File::create(&out).unwrap();
        let env = EnvMap::from([("FLEETRUN_PROBE".to_string(), "42".to_string())]);
        let mut child = OsSpawner
            .spawn(
                &sh("echo $FLEETRUN_PROBE; echo ${HOME:-unset} 1>&2"),
                &env,
                Output::File(file),
            )
            .unwrap();
        assert_eq!(child.wait().unwrap(), 0);
        assert_eq!(std::fs::read_to_string(out).unwrap(), "42\nunset\n");
    }
}
