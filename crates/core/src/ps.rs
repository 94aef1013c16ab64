//! Parameter-server topology: servers, workers and heterogeneous workers.

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, Result};
use crate::net::{resolve_node_ip, IpResolver};
use crate::ports::{port_range, DEFAULT_START_PORT};
use crate::topology::{Cluster, Endpoint, Pod, Role, RoleProcess};

const LOCALHOST: &str = "127.0.0.1";

/// How many processes a role gets and, optionally, where they listen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub count: Option<usize>,
    /// Comma-separated `ip:port` list.
    pub endpoints: Option<String>,
}

impl RoleSpec {
    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            endpoints: None,
        }
    }

    pub fn endpoints(list: impl Into<String>) -> Self {
        Self {
            count: None,
            endpoints: Some(list.into()),
        }
    }

    /// Endpoints for this role. Synthesized on localhost when only a count is
    /// given, as the block at `offset` past the start port.
    fn resolve(&self, role: Role, offset: usize, start_port: Option<u16>) -> Result<Vec<Endpoint>> {
        let count = self.count.filter(|&n| n > 0);
        let list = self
            .endpoints
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        match (count, list) {
            (Some(n), Some(list)) => {
                let endpoints = Endpoint::parse_list(list)?;
                if endpoints.len() != n {
                    return Err(LaunchError::config(format!(
                        "{} count {n} doesn't match its endpoint list of {} entries",
                        role_name(role),
                        endpoints.len()
                    )));
                }
                Ok(endpoints)
            }
            (Some(n), None) => {
                let start = start_port.unwrap_or(DEFAULT_START_PORT);
                Ok(port_range(start, offset, n)?
                    .into_iter()
                    .map(|port| Endpoint::new(LOCALHOST, port))
                    .collect())
            }
            (None, Some(list)) => Endpoint::parse_list(list),
            (None, None) => Err(LaunchError::config(format!(
                "parameter-server mode needs a {0} count or a {0} endpoint list",
                role_name(role)
            ))),
        }
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Trainer => "worker",
        Role::Server => "server",
        Role::HeterWorker => "heter worker",
    }
}

/// Parameter-server job description.
#[derive(Debug, Clone, Default)]
pub struct PsTopology {
    pub servers: RoleSpec,
    pub workers: RoleSpec,
    /// Only present in `ps_heter` mode.
    pub heter_workers: Option<RoleSpec>,
    pub node_ip: Option<String>,
    pub start_port: Option<u16>,
}

/// Resolved endpoint lists, in listed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsEndpoints {
    pub servers: Vec<Endpoint>,
    pub workers: Vec<Endpoint>,
    pub heter_workers: Vec<Endpoint>,
}

impl PsEndpoints {
    /// Distinct hosts in first-appearance order across servers, workers and
    /// heter workers.
    pub fn node_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = Vec::new();
        for ep in self
            .servers
            .iter()
            .chain(&self.workers)
            .chain(&self.heter_workers)
        {
            if !ips.contains(&ep.host) {
                ips.push(ep.host.clone());
            }
        }
        ips
    }
}

impl PsTopology {
    pub fn endpoints(&self) -> Result<PsEndpoints> {
        let servers = self.servers.resolve(Role::Server, 0, self.start_port)?;
        let workers = self
            .workers
            .resolve(Role::Trainer, servers.len(), self.start_port)?;
        let heter_workers = match &self.heter_workers {
            Some(spec) => spec.resolve(
                Role::HeterWorker,
                servers.len() + workers.len(),
                self.start_port,
            )?,
            None => Vec::new(),
        };
        Ok(PsEndpoints {
            servers,
            workers,
            heter_workers,
        })
    }

    pub fn build<R: IpResolver + ?Sized>(&self, resolver: &R) -> Result<(Cluster, usize)> {
        let endpoints = self.endpoints()?;
        let node_ips = endpoints.node_ips();
        let (node_ip, node_rank) = resolve_node_ip(&node_ips, self.node_ip.as_deref(), resolver)?;
        tracing::debug!(
            node_ips = ?node_ips,
            node_ip = %node_ip,
            node_rank,
            "parsed parameter-server arguments"
        );
        Ok((build_cluster(&node_ips, &endpoints), node_rank))
    }
}

/// One pod per node IP holding every endpoint that lives on it, in listed
/// order. Each role class has its own rank counter that runs pod-major, so
/// concatenating the pods' lists yields the ranked sequence.
pub fn build_cluster(node_ips: &[String], endpoints: &PsEndpoints) -> Cluster {
    let mut next_rank = [0usize; 3];
    let mut place = |ip: &str, role: Role, list: &[Endpoint]| -> Vec<RoleProcess> {
        let counter = &mut next_rank[role as usize];
        list.iter()
            .filter(|ep| ep.host == ip)
            .map(|ep| {
                let rank = *counter;
                *counter += 1;
                RoleProcess {
                    devices: Vec::new(),
                    endpoint: ep.clone(),
                    rank,
                }
            })
            .collect()
    };

    let pods = node_ips
        .iter()
        .enumerate()
        .map(|(node_rank, ip)| {
            let mut pod = Pod::new(node_rank, ip.clone());
            pod.servers = place(ip, Role::Server, &endpoints.servers);
            pod.trainers = place(ip, Role::Trainer, &endpoints.workers);
            pod.heter_workers = place(ip, Role::HeterWorker, &endpoints.heter_workers);
            pod
        })
        .collect();
    Cluster::new(pods)
}
