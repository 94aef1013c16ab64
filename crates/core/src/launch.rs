//! Spawning the local pod's role-processes.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::env::{collective_env, format_env_table, strip_proxies, EnvMap, PsEnv};
use crate::error::{LaunchError, Result};
use crate::process::{LaunchCommand, Output, ProcessControl, Spawner};
use crate::topology::{join_endpoints, Cluster, Pod, Role, RoleProcess};

/// A spawned role-process and the bookkeeping the monitor needs for it.
pub struct RoleProcessHandle {
    pub process: Box<dyn ProcessControl>,
    /// Launcher-side handle on the log file; closed on teardown.
    pub log: Option<File>,
    pub log_path: Option<PathBuf>,
    /// Bytes of the log already forwarded to the observer.
    pub log_offset: u64,
    pub role: Role,
    pub rank: usize,
    pub local_rank: usize,
    pub cmd: LaunchCommand,
}

impl RoleProcessHandle {
    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    pub fn close_log(&mut self) {
        self.log = None;
    }
}

impl fmt::Debug for RoleProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleProcessHandle")
            .field("pid", &self.process.id())
            .field("role", &self.role)
            .field("rank", &self.rank)
            .field("local_rank", &self.local_rank)
            .field("log_path", &self.log_path)
            .field("log_offset", &self.log_offset)
            .finish()
    }
}

/// Starts role-processes of one training command.
pub struct Launcher<'a> {
    spawner: &'a dyn Spawner,
    cmd: LaunchCommand,
    log_dir: Option<PathBuf>,
    base_env: EnvMap,
}

impl<'a> Launcher<'a> {
    /// `base_env` is what every child inherits; proxy variables are removed.
    pub fn new(
        spawner: &'a dyn Spawner,
        cmd: LaunchCommand,
        log_dir: Option<PathBuf>,
        mut base_env: EnvMap,
    ) -> Self {
        strip_proxies(&mut base_env);
        Self {
            spawner,
            cmd,
            log_dir,
            base_env,
        }
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// One trainer per entry of `pod.trainers`, collective variables on top
    /// of `extra`.
    pub fn start_local_trainers(
        &self,
        cluster: &Cluster,
        pod: &Pod,
        extra: &EnvMap,
    ) -> Result<Vec<RoleProcessHandle>> {
        self.write_endpoints_log(cluster)?;
        if let Some(dir) = &self.log_dir {
            tracing::info!(
                "details about PADDLE_TRAINER_ENDPOINTS can be found in {}",
                dir.join("endpoints.log").display()
            );
        }

        let mut handles = Vec::with_capacity(pod.trainers.len());
        for (idx, trainer) in pod.trainers.iter().enumerate() {
            let mut env = extra.clone();
            env.extend(collective_env(cluster, trainer));
            let started = self.start_one(
                Role::Trainer,
                trainer,
                idx,
                pod.trainers.len(),
                env,
                &mut handles,
            );
            if let Err(e) = started {
                abort_started(&mut handles);
                return Err(e);
            }
        }
        Ok(handles)
    }

    /// Servers, then workers, then heter workers of `pod`. The returned
    /// handles keep that order.
    pub fn start_ps_roles(
        &self,
        cluster: &Cluster,
        pod: &Pod,
        ps_env: &PsEnv,
    ) -> Result<Vec<RoleProcessHandle>> {
        self.write_endpoints_log(cluster)?;

        let mut handles = Vec::new();
        for role in [Role::Server, Role::Trainer, Role::HeterWorker] {
            let procs = pod.role_processes(role);
            for (idx, proc) in procs.iter().enumerate() {
                let started = ps_env.role_env(role, proc, idx).and_then(|env| {
                    self.start_one(role, proc, idx, procs.len(), env, &mut handles)
                });
                if let Err(e) = started {
                    abort_started(&mut handles);
                    return Err(e);
                }
            }
        }

        if let Some(dir) = &self.log_dir {
            tracing::info!(
                "check server, worker and heter worker logs in {0}/serverlog.*, {0}/workerlog.* and {0}/heterlog.*",
                dir.display()
            );
        }
        Ok(handles)
    }

    fn start_one(
        &self,
        role: Role,
        proc: &RoleProcess,
        idx: usize,
        local_count: usize,
        role_env: EnvMap,
        handles: &mut Vec<RoleProcessHandle>,
    ) -> Result<()> {
        if idx == 0 {
            tracing::info!(
                "local {} starts {} processes; first process environment:{}",
                role,
                local_count,
                format_env_table(&role_env, ("Distributed Envs", "Value"))
            );
        }

        let mut env = self.base_env.clone();
        env.extend(role_env);
        tracing::debug!(role = %role, rank = proc.rank, cmd = %self.cmd, "starting process");

        let (log, log_path, output, log_offset) = match &self.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}.{idx}", role.log_stem()));
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                let offset = file.metadata()?.len();
                let output = Output::File(file.try_clone()?);
                (Some(file), Some(path), output, offset)
            }
            None => (None, None, Output::Inherit, 0),
        };

        let process = self
            .spawner
            .spawn(&self.cmd, &env, output)
            .map_err(|source| LaunchError::Spawn {
                rank: proc.rank,
                source,
            })?;
        tracing::debug!(role = %role, rank = proc.rank, pid = process.id(), "process started");

        handles.push(RoleProcessHandle {
            process,
            log,
            log_path,
            log_offset,
            role,
            rank: proc.rank,
            local_rank: idx,
            cmd: self.cmd.clone(),
        });
        Ok(())
    }

    /// Truncate and rewrite `endpoints.log` with every non-empty peer list.
    fn write_endpoints_log(&self, cluster: &Cluster) -> Result<()> {
        let Some(dir) = &self.log_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;

        let mut out = File::create(dir.join("endpoints.log"))?;
        let sections = [
            ("PADDLE_TRAINER_ENDPOINTS", cluster.trainers_endpoints()),
            ("PADDLE_PSERVERS_IP_PORT_LIST", cluster.servers_endpoints()),
            (
                "PADDLE_HETER_TRAINER_IP_PORT_LIST",
                cluster.heter_workers_endpoints(),
            ),
        ];
        for (name, endpoints) in sections {
            if endpoints.is_empty() {
                continue;
            }
            let listing = join_endpoints(endpoints).replace(',', "\n");
            writeln!(out, "{name}: \n{listing}")?;
        }
        Ok(())
    }
}

/// Kill whatever a failed launch already started.
fn abort_started(handles: &mut [RoleProcessHandle]) {
    for handle in handles.iter_mut() {
        if let Err(e) = handle.process.kill().and_then(|_| handle.process.wait()) {
            tracing::warn!(
                pid = handle.pid(),
                error = %e,
                "failed to stop process after launch error"
            );
        }
        handle.close_log();
    }
}
