//! Topology handed down by an external job scheduler.
//!
//! A scheduler that places the launcher on its nodes describes the job
//! through environment variables:
//!
//! - `PADDLE_TRAINERS`: comma-separated node IPs
//! - `POD_IP`: this node's IP
//! - `PADDLE_TRAINER_ID`: this node's rank
//! - `PADDLE_TRAINERS_NUM`: global trainer count (default 1)
//! - `PADDLE_PORT` / `TRAINER_PORTS_NUM`: a port block reserved on each node
//! - `DISTRIBUTED_TRAINER_ENDPOINTS`: optional full endpoint list, node-major

use crate::collective;
use crate::env::VarSource;
use crate::error::{LaunchError, Result};
use crate::net::split_ips;
use crate::ports::port_range;
use crate::topology::{Cluster, DeviceId, Endpoint};

/// Start port for scheduler-managed collective jobs.
pub const SCHEDULER_START_PORT: u16 = 6170;

/// True when the scheduler variables that identify this node are all set.
pub fn use_scheduler(vars: &dyn VarSource) -> bool {
    ["PADDLE_TRAINERS", "POD_IP", "PADDLE_TRAINER_ID"]
        .iter()
        .all(|key| vars.var(key).is_some())
}

/// Global trainer count announced by the scheduler.
pub fn trainers_num(vars: &dyn VarSource) -> usize {
    vars.var("PADDLE_TRAINERS_NUM")
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(1)
}

/// Scheduler description of a collective job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerEnv {
    pub node_ips: Vec<String>,
    pub pod_ip: String,
    pub paddle_port: Option<u16>,
    pub ports_num: Option<usize>,
    pub trainer_endpoints: Option<String>,
}

impl SchedulerEnv {
    pub fn from_vars(vars: &dyn VarSource) -> Result<Self> {
        let node_ips = vars
            .var("PADDLE_TRAINERS")
            .map(|s| split_ips(&s))
            .filter(|ips| !ips.is_empty())
            .ok_or_else(|| LaunchError::config("PADDLE_TRAINERS is not set"))?;
        let pod_ip = vars
            .var("POD_IP")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LaunchError::config("POD_IP is not set"))?;

        Ok(Self {
            node_ips,
            pod_ip,
            paddle_port: vars.var("PADDLE_PORT").and_then(|s| s.trim().parse().ok()),
            ports_num: vars
                .var("TRAINER_PORTS_NUM")
                .and_then(|s| s.trim().parse().ok()),
            trainer_endpoints: vars
                .var("DISTRIBUTED_TRAINER_ENDPOINTS")
                .filter(|s| !s.trim().is_empty()),
        })
    }

    /// Per-node trainer endpoints for `device_count` local devices.
    fn endpoints_per_node(&self, device_count: usize, start_port: u16) -> Result<Vec<Vec<Endpoint>>> {
        if let Some(list) = &self.trainer_endpoints {
            let all = Endpoint::parse_list(list)?;
            let per_node = self.ports_num.unwrap_or(device_count);
            if per_node == 0 || all.len() != per_node * self.node_ips.len() {
                return Err(LaunchError::config(format!(
                    "DISTRIBUTED_TRAINER_ENDPOINTS has {} entries, expected {} nodes x {per_node}",
                    all.len(),
                    self.node_ips.len()
                )));
            }
            return Ok(all.chunks(per_node).map(<[Endpoint]>::to_vec).collect());
        }

        let mut started_port = start_port;
        if self.node_ips.len() > 1 {
            if let (Some(port), Some(num)) = (self.paddle_port, self.ports_num) {
                if num >= device_count && port != start_port {
                    tracing::warn!(port, "using the scheduler-assigned port block");
                    started_port = port;
                }
            }
        }

        let ports = port_range(started_port, 0, device_count)?;
        Ok(self
            .node_ips
            .iter()
            .map(|ip| ports.iter().map(|&p| Endpoint::new(ip.clone(), p)).collect())
            .collect())
    }

    /// Collective cluster for this scheduler placement.
    ///
    /// `args_ips` is only compared against the scheduler's list; the
    /// scheduler's list always wins.
    pub fn build_collective(
        &self,
        args_ips: &[String],
        devices: &[DeviceId],
        start_port: Option<u16>,
    ) -> Result<(Cluster, usize)> {
        let default_ips = args_ips.len() == 1 && args_ips[0] == "127.0.0.1";
        if !args_ips.is_empty() && !default_ips && args_ips != self.node_ips.as_slice() {
            tracing::warn!(
                args_ips = ?args_ips,
                scheduler_ips = ?self.node_ips,
                "node ips are taken from the scheduler environment and differ from --ips"
            );
        }

        let endpoints =
            self.endpoints_per_node(devices.len(), start_port.unwrap_or(SCHEDULER_START_PORT))?;
        collective::build_cluster(&self.node_ips, &self.pod_ip, &endpoints, devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvMap;
    use crate::topology::join_endpoints;

    fn vars(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn two_nodes() -> EnvMap {
        vars(&[
            ("PADDLE_TRAINERS", "10.0.0.1,10.0.0.2"),
            ("POD_IP", "10.0.0.2"),
            ("PADDLE_TRAINER_ID", "1"),
            ("PADDLE_TRAINERS_NUM", "2"),
        ])
    }

    #[test]
    fn detection_requires_all_variables() {
        assert!(use_scheduler(&two_nodes()));
        assert!(!use_scheduler(&vars(&[("PADDLE_TRAINERS", "10.0.0.1")])));
        assert_eq!(trainers_num(&two_nodes()), 2);
        assert_eq!(trainers_num(&EnvMap::new()), 1);
    }

    #[test]
    fn default_start_port() {
        let env = SchedulerEnv::from_vars(&two_nodes()).unwrap();
        let (cluster, pod) = env.build_collective(&[], &[0, 1], None).unwrap();
        assert_eq!(pod, 1);
        assert_eq!(
            join_endpoints(cluster.trainers_endpoints()),
            "10.0.0.1:6170,10.0.0.1:6171,10.0.0.2:6170,10.0.0.2:6171"
        );
        assert_eq!(cluster.pods[1].trainers[0].rank, 2);
    }

    #[test]
    fn scheduler_port_block_wins_when_large_enough() {
        let mut env = two_nodes();
        env.insert("PADDLE_PORT".into(), "36000".into());
        env.insert("TRAINER_PORTS_NUM".into(), "2".into());
        let sched = SchedulerEnv::from_vars(&env).unwrap();
        let (cluster, _) = sched.build_collective(&[], &[0, 1], None).unwrap();
        assert_eq!(cluster.pods[0].trainers[1].endpoint.port, 36001);

        // Block smaller than the local device count is ignored.
        let (cluster, _) = sched.build_collective(&[], &[0, 1, 2], None).unwrap();
        assert_eq!(cluster.pods[0].trainers[0].endpoint.port, 6170);
    }

    #[test]
    fn explicit_endpoint_list_is_chunked_per_node() {
        let mut env = two_nodes();
        env.insert("TRAINER_PORTS_NUM".into(), "2".into());
        env.insert(
            "DISTRIBUTED_TRAINER_ENDPOINTS".into(),
            "10.0.0.1:1,10.0.0.1:2,10.0.0.2:3,10.0.0.2:4".into(),
        );
        let sched = SchedulerEnv::from_vars(&env).unwrap();
        let (cluster, _) = sched.build_collective(&[], &[0, 1], None).unwrap();
        assert_eq!(cluster.pods[1].trainers[1].endpoint.to_string(), "10.0.0.2:4");

        // Fewer endpoints per node than devices.
        let err = sched.build_collective(&[], &[0, 1, 2], None).unwrap_err();
        assert!(matches!(err, LaunchError::Config(_)));
    }

    #[test]
    fn missing_pod_ip_is_config_error() {
        let env = vars(&[("PADDLE_TRAINERS", "10.0.0.1")]);
        assert!(SchedulerEnv::from_vars(&env).is_err());
    }

    #[test]
    fn pod_ip_outside_trainers_is_config_error() {
        let mut env = two_nodes();
        env.insert("POD_IP".into(), "10.9.9.9".into());
        let sched = SchedulerEnv::from_vars(&env).unwrap();
        assert!(sched.build_collective(&[], &[0], None).is_err());
    }
}
