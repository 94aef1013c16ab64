//! Job topology: the cluster of pods and the role-processes placed on them.
//!
//! A [`Cluster`] is produced once by a topology builder (see
//! [`crate::collective`], [`crate::ps`] and [`crate::cloud`]) and never
//! mutated afterwards. Every node running the launcher derives the same
//! cluster from the same input, so the values here are plain data with
//! structural equality.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, Result};

/// Accelerator device ordinal as seen by a child process.
pub type DeviceId = u32;

/// A network endpoint, rendered as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a comma-separated `ip:port` list. Empty entries are rejected.
    pub fn parse_list(list: &str) -> Result<Vec<Endpoint>> {
        list.split(',').map(str::parse).collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| LaunchError::config(format!("endpoint {s:?} is not ip:port")))?;
        if host.is_empty() {
            return Err(LaunchError::config(format!("endpoint {s:?} has no host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| LaunchError::config(format!("endpoint {s:?} has a bad port: {e}")))?;
        Ok(Self::new(host, port))
    }
}

/// Join endpoints into the comma-separated form children expect.
pub fn join_endpoints<'a>(endpoints: impl IntoIterator<Item = &'a Endpoint>) -> String {
    endpoints
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Role class of a role-process. Ranks are numbered independently per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Trainer,
    Server,
    HeterWorker,
}

impl Role {
    /// Value of `TRAINING_ROLE` handed to the child.
    pub fn tag(self) -> &'static str {
        match self {
            Role::Trainer => "TRAINER",
            Role::Server => "PSERVER",
            Role::HeterWorker => "HETER_TRAINER",
        }
    }

    /// Stem of the per-slot log file (`<stem>.<local_index>`).
    pub fn log_stem(self) -> &'static str {
        match self {
            Role::Trainer => "workerlog",
            Role::Server => "serverlog",
            Role::HeterWorker => "heterlog",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One logical participant of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleProcess {
    /// Devices owned by the process. Exactly one in collective mode, none for
    /// parameter-server roles.
    pub devices: Vec<DeviceId>,
    pub endpoint: Endpoint,
    /// Global rank within the role class.
    pub rank: usize,
}

impl fmt::Display for RoleProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "devices:{:?} endpoint:{} rank:{}",
            self.devices, self.endpoint, self.rank
        )
    }
}

/// One physical node's slice of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub rank: usize,
    pub id: String,
    pub addr: String,
    pub port: Option<u16>,
    pub trainers: Vec<RoleProcess>,
    pub servers: Vec<RoleProcess>,
    pub heter_workers: Vec<RoleProcess>,
    pub devices: Vec<DeviceId>,
}

impl Pod {
    pub fn new(rank: usize, addr: impl Into<String>) -> Self {
        Self {
            rank,
            id: rank.to_string(),
            addr: addr.into(),
            port: None,
            trainers: Vec::new(),
            servers: Vec::new(),
            heter_workers: Vec::new(),
            devices: Vec::new(),
        }
    }

    /// Role-processes of one class placed on this pod.
    pub fn role_processes(&self, role: Role) -> &[RoleProcess] {
        match role {
            Role::Trainer => &self.trainers,
            Role::Server => &self.servers,
            Role::HeterWorker => &self.heter_workers,
        }
    }

    /// Devices visible to this pod as a comma-separated list.
    pub fn visible_devices(&self) -> Result<String> {
        if self.devices.is_empty() {
            return Err(LaunchError::config(format!(
                "pod {} ({}) can't see any devices",
                self.rank, self.addr
            )));
        }
        Ok(self
            .devices
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","))
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |procs: &[RoleProcess]| {
            procs
                .iter()
                .map(|p| format!("[{p}]"))
                .collect::<Vec<_>>()
                .join(" ")
        };
        write!(
            f,
            "rank:{} id:{} addr:{} port:{:?} visible_devices:{:?} trainers:{} servers:{} heter_workers:{}",
            self.rank,
            self.id,
            self.addr,
            self.port,
            self.devices,
            show(&self.trainers),
            show(&self.servers),
            show(&self.heter_workers),
        )
    }
}

/// Topology of one training job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cluster {
    /// Pods in node-rank order; `pods[i].rank == i`.
    pub pods: Vec<Pod>,
    /// Optional job coordination server. Not compared for equality.
    pub job_server: Option<Endpoint>,
    pub job_stage: Option<String>,
}

impl PartialEq for Cluster {
    fn eq(&self, other: &Self) -> bool {
        self.pods == other.pods && self.job_stage == other.job_stage
    }
}

impl Eq for Cluster {}

impl Cluster {
    pub fn new(pods: Vec<Pod>) -> Self {
        debug_assert!(pods.iter().enumerate().all(|(i, p)| p.rank == i));
        Self {
            pods,
            job_server: None,
            job_stage: None,
        }
    }

    pub fn trainers_nranks(&self) -> usize {
        self.pods.iter().map(|p| p.trainers.len()).sum()
    }

    pub fn pods_nranks(&self) -> usize {
        self.pods.len()
    }

    /// Endpoints of every role-process of one class, in global rank order.
    pub fn role_endpoints(&self, role: Role) -> Vec<&Endpoint> {
        let mut procs: Vec<&RoleProcess> = self
            .pods
            .iter()
            .flat_map(|p| p.role_processes(role))
            .collect();
        procs.sort_by_key(|r| r.rank);
        procs.into_iter().map(|r| &r.endpoint).collect()
    }

    pub fn trainers_endpoints(&self) -> Vec<&Endpoint> {
        self.role_endpoints(Role::Trainer)
    }

    pub fn servers_endpoints(&self) -> Vec<&Endpoint> {
        self.role_endpoints(Role::Server)
    }

    pub fn heter_workers_endpoints(&self) -> Vec<&Endpoint> {
        self.role_endpoints(Role::HeterWorker)
    }

    /// `addr:port` of every pod. Only valid once pods have listening ports.
    pub fn pods_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.pods
            .iter()
            .map(|pod| {
                pod.port
                    .map(|port| Endpoint::new(pod.addr.clone(), port))
                    .ok_or_else(|| {
                        LaunchError::config(format!("pod {} has no listening port", pod.rank))
                    })
            })
            .collect()
    }

    pub fn pod_by_id(&self, id: &str) -> Option<&Pod> {
        self.pods.iter().find(|p| p.id == id)
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job_server:{:?} job_stage:{:?} pods:",
            self.job_server.as_ref().map(ToString::to_string),
            self.job_stage
        )?;
        for pod in &self.pods {
            write!(f, " {{{pod}}}")?;
        }
        Ok(())
    }
}
