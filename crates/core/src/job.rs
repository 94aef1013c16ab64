//! End-to-end job drivers.
//!
//! Each driver builds the topology, brackets the local process set with a
//! [`RendezvousDir`], starts the local role-processes and supervises them
//! until they finish, fail or are interrupted.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::clock::Clock;
use crate::cloud::{self, SchedulerEnv};
use crate::collective::CollectiveTopology;
use crate::config::{DistributedMode, JobKind, LaunchConfig};
use crate::devices::{detect_device_count, select_devices, DeviceKind};
use crate::env::{EnvMap, PsEnv, VarSource};
use crate::error::{LaunchError, Result};
use crate::launch::{Launcher, RoleProcessHandle};
use crate::net::IpResolver;
use crate::process::{Output, Spawner};
use crate::rendezvous::RendezvousDir;
use crate::terminate::{terminate_local_procs, TerminationPolicy};
use crate::topology::{Cluster, Role};
use crate::watch::{Watchdog, WATCH_INTERVAL};

/// Collaborators of a job run.
pub struct JobContext<'a> {
    pub spawner: &'a dyn Spawner,
    pub clock: &'a dyn Clock,
    pub resolver: &'a dyn IpResolver,
    /// Launcher environment, read for scheduler and device variables.
    pub vars: &'a dyn VarSource,
    /// Environment every child inherits.
    pub base_env: EnvMap,
    /// Receives the tail of local slot 0's log.
    pub observer: &'a mut dyn Write,
    pub interrupted: Option<&'a AtomicBool>,
    pub termination: TerminationPolicy,
    pub poll_interval: Duration,
}

impl<'a> JobContext<'a> {
    pub fn new(
        spawner: &'a dyn Spawner,
        clock: &'a dyn Clock,
        resolver: &'a dyn IpResolver,
        vars: &'a dyn VarSource,
        observer: &'a mut dyn Write,
    ) -> Self {
        Self {
            spawner,
            clock,
            resolver,
            vars,
            base_env: EnvMap::new(),
            observer,
            interrupted: None,
            termination: TerminationPolicy::default(),
            poll_interval: WATCH_INTERVAL,
        }
    }

    fn watchdog(&self) -> Watchdog<'a> {
        let mut watchdog = Watchdog::new(self.clock);
        watchdog.interval = self.poll_interval;
        watchdog.termination = self.termination;
        match self.interrupted {
            Some(flag) => watchdog.with_interrupt(flag),
            None => watchdog,
        }
    }
}

/// Run the job `config` describes.
pub fn launch(config: &LaunchConfig, ctx: &mut JobContext<'_>) -> Result<()> {
    match config.job_kind() {
        JobKind::Collective => launch_collective(config, ctx),
        JobKind::ParameterServer => launch_ps(config, ctx),
    }
}

/// The cluster `config` resolves to and the index of this node's pod,
/// without spawning anything.
pub fn build_topology(
    config: &LaunchConfig,
    vars: &dyn VarSource,
    resolver: &dyn IpResolver,
) -> Result<(Cluster, usize)> {
    match config.job_kind() {
        JobKind::Collective => collective_topology(config, vars, resolver),
        JobKind::ParameterServer => config.ps_topology().build(resolver),
    }
}

pub fn collective_topology(
    config: &LaunchConfig,
    vars: &dyn VarSource,
    resolver: &dyn IpResolver,
) -> Result<(Cluster, usize)> {
    let visible = vars.var(DeviceKind::Gpu.visible_devices_var());
    let devices = select_devices(
        config.gpus.as_deref(),
        visible.as_deref(),
        detect_device_count(DeviceKind::Gpu, vars),
    )?;
    let trainers_num = cloud::trainers_num(vars);
    let under_scheduler = cloud::use_scheduler(vars);
    tracing::debug!(trainers_num, devices = ?devices, "parsed collective arguments");

    if under_scheduler && trainers_num != 1 {
        let scheduler = SchedulerEnv::from_vars(vars)?;
        let (cluster, pod) =
            scheduler.build_collective(&config.node_ips(), &devices, config.start_port)?;
        tracing::debug!(%cluster, "cluster from scheduler environment");
        return Ok((cluster, pod));
    }

    let topology = CollectiveTopology {
        node_ips: config.node_ips(),
        node_ip: config.node_ip.clone(),
        devices,
        start_port: config.start_port,
        under_scheduler,
    };
    let (cluster, pod) = topology.build(resolver)?;
    tracing::debug!(%cluster, "cluster from arguments");
    Ok((cluster, pod))
}

/// One trainer per local device on every node.
pub fn launch_collective(config: &LaunchConfig, ctx: &mut JobContext<'_>) -> Result<()> {
    let (cluster, pod_index) = collective_topology(config, ctx.vars, ctx.resolver)?;
    let pod = &cluster.pods[pod_index];

    let rendezvous = RendezvousDir::create()?;
    let launcher = Launcher::new(
        ctx.spawner,
        config.command(),
        config.log_dir.clone(),
        ctx.base_env.clone(),
    );
    let mut handles = launcher.start_local_trainers(&cluster, pod, &rendezvous.env())?;

    ctx.watchdog()
        .run(&mut handles, cluster.trainers_nranks(), &mut *ctx.observer)?;
    tracing::info!("local processes completed");
    tracing::debug!(%pod, "pod info");

    drop(handles);
    rendezvous.close()
}

/// Servers, workers and heter workers of this node.
///
/// Workers define completion. Once they have all exited cleanly the servers
/// and heter workers are stopped. A node without workers runs until its
/// servers exit.
pub fn launch_ps(config: &LaunchConfig, ctx: &mut JobContext<'_>) -> Result<()> {
    if cloud::use_scheduler(ctx.vars)
        && matches!(config.mode, DistributedMode::Ps | DistributedMode::Unset)
    {
        return direct_start(config, ctx);
    }

    let (cluster, pod_index) = config.ps_topology().build(ctx.resolver)?;
    let pod = &cluster.pods[pod_index];

    let rendezvous = RendezvousDir::create()?;
    let device_count = detect_device_count(config.heter_worker_device, ctx.vars);
    let ps_env = PsEnv::new(
        &cluster,
        config.heter_worker_device,
        device_count,
        rendezvous.path(),
    );
    let launcher = Launcher::new(
        ctx.spawner,
        config.command(),
        config.log_dir.clone(),
        ctx.base_env.clone(),
    );
    let mut handles = launcher.start_ps_roles(&cluster, pod, &ps_env)?;

    let has_workers = !pod.trainers.is_empty();
    ctx.watchdog().run_until(
        &mut handles,
        cluster.trainers_nranks(),
        &mut *ctx.observer,
        |role| !has_workers || role == Role::Trainer,
    )?;

    tracing::info!("all workers exited, stopping servers and heter workers");
    terminate_local_procs(&mut handles, &ctx.termination, ctx.clock)?;
    tracing::info!("all servers and heter workers are stopped");

    drop(handles);
    rendezvous.close()
}

/// Run the training command once with the launcher's own environment, for
/// parameter-server jobs whose roles are already placed by a scheduler.
pub fn direct_start(config: &LaunchConfig, ctx: &mut JobContext<'_>) -> Result<()> {
    let cmd = config.command();
    tracing::info!(cmd = %cmd, "scheduler placed this role, starting it directly");
    let process = ctx
        .spawner
        .spawn(&cmd, &ctx.base_env, Output::Inherit)
        .map_err(|source| LaunchError::Spawn { rank: 0, source })?;

    let rank = ctx
        .vars
        .var("PADDLE_TRAINER_ID")
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    let mut handles = [RoleProcessHandle {
        process,
        log: None,
        log_path: None,
        log_offset: 0,
        role: Role::Trainer,
        rank,
        local_rank: 0,
        cmd,
    }];
    ctx.watchdog()
        .run(&mut handles, cloud::trainers_num(ctx.vars), &mut *ctx.observer)
}

