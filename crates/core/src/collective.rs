//! Collective topology: one trainer per local device on every node.

use crate::error::{LaunchError, Result};
use crate::net::{resolve_node_ip, IpResolver};
use crate::ports::{allocate_ports, port_range, DEFAULT_START_PORT};
use crate::topology::{Cluster, DeviceId, Endpoint, Pod, RoleProcess};

/// Assemble a collective cluster from per-node endpoint lists.
///
/// Node `i` gets one trainer per device, bound to `endpoints_per_node[i][d]`.
/// Global ranks run node-major, device-minor. Returns the cluster and the
/// index of `node_ip`'s pod.
pub fn build_cluster(
    node_ips: &[String],
    node_ip: &str,
    endpoints_per_node: &[Vec<Endpoint>],
    devices: &[DeviceId],
) -> Result<(Cluster, usize)> {
    if endpoints_per_node.len() != node_ips.len() {
        return Err(LaunchError::config(format!(
            "got endpoints for {} nodes but {} node ips",
            endpoints_per_node.len(),
            node_ips.len()
        )));
    }

    let mut rank = 0;
    let mut pods = Vec::with_capacity(node_ips.len());
    for (node_rank, (ip, endpoints)) in node_ips.iter().zip(endpoints_per_node).enumerate() {
        if endpoints.len() < devices.len() {
            return Err(LaunchError::config(format!(
                "node {ip} has {} trainer endpoints but {} selected devices",
                endpoints.len(),
                devices.len()
            )));
        }

        let mut pod = Pod::new(node_rank, ip.clone());
        pod.devices = devices.to_vec();
        for (&device, endpoint) in devices.iter().zip(endpoints) {
            pod.trainers.push(RoleProcess {
                devices: vec![device],
                endpoint: endpoint.clone(),
                rank,
            });
            rank += 1;
        }
        pods.push(pod);
    }

    let pod_index = node_ips
        .iter()
        .position(|ip| ip == node_ip)
        .ok_or_else(|| {
            LaunchError::config(format!(
                "can't find your local ip {node_ip} in node_ips: {node_ips:?}"
            ))
        })?;
    Ok((Cluster::new(pods), pod_index))
}

/// Collective topology described by launcher arguments.
#[derive(Debug, Clone)]
pub struct CollectiveTopology {
    pub node_ips: Vec<String>,
    /// Explicit identity of this node; resolved from the network otherwise.
    pub node_ip: Option<String>,
    pub devices: Vec<DeviceId>,
    pub start_port: Option<u16>,
    /// Running under an external scheduler. Disables port probing.
    pub under_scheduler: bool,
}

impl CollectiveTopology {
    pub fn build<R: IpResolver + ?Sized>(&self, resolver: &R) -> Result<(Cluster, usize)> {
        let (node_ip, node_rank) =
            resolve_node_ip(&self.node_ips, self.node_ip.as_deref(), resolver)?;
        tracing::debug!(
            node_ips = ?self.node_ips,
            node_ip = %node_ip,
            node_rank,
            "parsed collective arguments"
        );

        let count = self.devices.len();
        let ports = if !self.under_scheduler && self.node_ips.len() <= 1 && self.start_port.is_none()
        {
            allocate_ports(count, 0, None)?
        } else {
            port_range(self.start_port.unwrap_or(DEFAULT_START_PORT), 0, count)?
        };

        let endpoints: Vec<Vec<Endpoint>> = self
            .node_ips
            .iter()
            .map(|ip| ports.iter().map(|&p| Endpoint::new(ip.clone(), p)).collect())
            .collect();
        build_cluster(&self.node_ips, &node_ip, &endpoints, &self.devices)
    }
}
