//! Resolved launch configuration.

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::devices::DeviceKind;
use crate::error::{LaunchError, Result};
use crate::net::split_ips;
use crate::process::LaunchCommand;
use crate::ps::{PsTopology, RoleSpec};

/// Value of `--distributed-mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedMode {
    /// Inferred from the other arguments.
    #[default]
    #[serde(rename = "")]
    Unset,
    Collective,
    Ps,
    PsHeter,
    PsGpu,
}

impl DistributedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DistributedMode::Unset => "",
            DistributedMode::Collective => "collective",
            DistributedMode::Ps => "ps",
            DistributedMode::PsHeter => "ps_heter",
            DistributedMode::PsGpu => "ps_gpu",
        }
    }

    pub fn is_ps(self) -> bool {
        matches!(
            self,
            DistributedMode::Ps | DistributedMode::PsHeter | DistributedMode::PsGpu
        )
    }
}

impl FromStr for DistributedMode {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Ok(DistributedMode::Unset),
            "collective" => Ok(DistributedMode::Collective),
            "ps" => Ok(DistributedMode::Ps),
            "ps_heter" => Ok(DistributedMode::PsHeter),
            "ps_gpu" => Ok(DistributedMode::PsGpu),
            other => Err(LaunchError::config(format!(
                "unknown distributed mode {other:?}, expected collective, ps, ps_heter or ps_gpu"
            ))),
        }
    }
}

/// Which launch path a configuration takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Collective,
    ParameterServer,
}

/// Everything the launcher needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub mode: DistributedMode,
    /// Per-process log directory; children inherit stdout/stderr without one.
    pub log_dir: Option<PathBuf>,
    /// Program that runs the training script, e.g. `python3 -u`.
    pub interpreter: Option<String>,
    pub training_script: String,
    #[serde(default)]
    pub training_script_args: Vec<String>,

    // collective
    /// Comma-separated node IPs.
    pub ips: Option<String>,
    /// Comma-separated device ids.
    pub gpus: Option<String>,
    /// This node's IP, when it can't be found from the network interfaces.
    pub node_ip: Option<String>,
    pub start_port: Option<u16>,

    // parameter server
    #[serde(default)]
    pub servers: RoleSpec,
    #[serde(default)]
    pub workers: RoleSpec,
    #[serde(default)]
    pub heter_workers: RoleSpec,
    #[serde(default)]
    pub heter_worker_device: DeviceKind,
}

impl LaunchConfig {
    pub fn new(training_script: impl Into<String>) -> Self {
        Self {
            mode: DistributedMode::Unset,
            log_dir: None,
            interpreter: None,
            training_script: training_script.into(),
            training_script_args: Vec::new(),
            ips: None,
            gpus: None,
            node_ip: None,
            start_port: None,
            servers: RoleSpec::default(),
            workers: RoleSpec::default(),
            heter_workers: RoleSpec::default(),
            heter_worker_device: DeviceKind::default(),
        }
    }

    pub fn has_ps_args(&self) -> bool {
        [&self.servers, &self.workers, &self.heter_workers]
            .iter()
            .any(|spec| spec.count.is_some() || spec.endpoints.is_some())
    }

    pub fn has_collective_args(&self) -> bool {
        self.ips.is_some() || self.gpus.is_some()
    }

    /// Parameter-server when any parameter-server argument is present or
    /// the mode asks for it, collective otherwise.
    pub fn job_kind(&self) -> JobKind {
        if self.has_ps_args() || self.mode.is_ps() {
            tracing::info!(mode = self.mode.as_str(), "run parameter-server mode");
            JobKind::ParameterServer
        } else if self.has_collective_args() || self.mode == DistributedMode::Collective {
            tracing::info!("run collective mode");
            JobKind::Collective
        } else {
            tracing::warn!("no mode-specific arguments found, defaulting to collective mode");
            JobKind::Collective
        }
    }

    /// Node IPs for collective mode; a lone `127.0.0.1` when unset.
    pub fn node_ips(&self) -> Vec<String> {
        match self.ips.as_deref().map(split_ips) {
            Some(ips) if !ips.is_empty() => ips,
            _ => vec!["127.0.0.1".to_string()],
        }
    }

    /// `[interpreter words...] script args...`
    pub fn command(&self) -> LaunchCommand {
        let mut words = self.interpreter.as_deref().unwrap_or("").split_whitespace();
        match words.next() {
            Some(program) => LaunchCommand {
                program: program.into(),
                args: words
                    .chain([self.training_script.as_str()])
                    .chain(self.training_script_args.iter().map(String::as_str))
                    .map(OsString::from)
                    .collect(),
            },
            None => LaunchCommand::new(
                None,
                self.training_script.as_str(),
                &self.training_script_args,
            ),
        }
    }

    pub fn ps_topology(&self) -> PsTopology {
        PsTopology {
            servers: self.servers.clone(),
            workers: self.workers.clone(),
            heter_workers: (self.mode == DistributedMode::PsHeter)
                .then(|| self.heter_workers.clone()),
            node_ip: self.node_ip.clone(),
            start_port: self.start_port,
        }
    }
}
