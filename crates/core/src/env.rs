//! Child-process environment assembly.
//!
//! The variable names here are the contract with the training program and
//! must not change.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::devices::DeviceKind;
use crate::error::{LaunchError, Result};
use crate::topology::{join_endpoints, Cluster, Role, RoleProcess};

/// Environment handed to one child, ordered for stable logging.
pub type EnvMap = BTreeMap<String, String>;

/// Proxy settings that would route peer traffic away from the training network.
pub const PROXY_VARS: [&str; 4] = ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"];

/// Read-only view of environment variables.
pub trait VarSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The launcher's own process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl VarSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl VarSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl VarSource for EnvMap {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

pub fn strip_proxies(env: &mut EnvMap) {
    for key in PROXY_VARS {
        env.remove(key);
    }
}

/// Variables that point CPU collective bootstrap at the shared rendezvous directory.
pub fn gloo_env(rendezvous: &Path) -> EnvMap {
    EnvMap::from([
        ("PADDLE_WITH_GLOO".to_string(), "1".to_string()),
        ("PADDLE_GLOO_RENDEZVOUS".to_string(), "2".to_string()),
        (
            "PADDLE_GLOO_FS_PATH".to_string(),
            rendezvous.display().to_string(),
        ),
    ])
}

/// Variables for one collective trainer.
pub fn collective_env(cluster: &Cluster, trainer: &RoleProcess) -> EnvMap {
    let devices = trainer
        .devices
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    EnvMap::from([
        ("FLAGS_selected_gpus".to_string(), devices),
        ("PADDLE_TRAINER_ID".to_string(), trainer.rank.to_string()),
        (
            "PADDLE_CURRENT_ENDPOINT".to_string(),
            trainer.endpoint.to_string(),
        ),
        (
            "PADDLE_TRAINERS_NUM".to_string(),
            cluster.trainers_nranks().to_string(),
        ),
        (
            "PADDLE_TRAINER_ENDPOINTS".to_string(),
            join_endpoints(cluster.trainers_endpoints()),
        ),
        ("TRAINING_ROLE".to_string(), Role::Trainer.tag().to_string()),
    ])
}

/// Job-wide values shared by every parameter-server role.
#[derive(Debug, Clone)]
pub struct PsEnv {
    pub servers: String,
    pub workers: String,
    pub heter_workers: String,
    pub worker_num: usize,
    pub heter_device: DeviceKind,
    /// Local devices of `heter_device` kind, used for round-robin affinity.
    pub local_device_count: usize,
    pub gloo: EnvMap,
}

impl PsEnv {
    pub fn new(
        cluster: &Cluster,
        heter_device: DeviceKind,
        local_device_count: usize,
        rendezvous: &Path,
    ) -> Self {
        Self {
            servers: join_endpoints(cluster.servers_endpoints()),
            workers: join_endpoints(cluster.trainers_endpoints()),
            heter_workers: join_endpoints(cluster.heter_workers_endpoints()),
            worker_num: cluster.trainers_nranks(),
            heter_device,
            local_device_count,
            gloo: gloo_env(rendezvous),
        }
    }

    /// Variables for the role-process in local slot `local_index`.
    pub fn role_env(&self, role: Role, proc: &RoleProcess, local_index: usize) -> Result<EnvMap> {
        let mut env = EnvMap::from([
            ("PADDLE_PSERVERS_IP_PORT_LIST".to_string(), self.servers.clone()),
            ("PADDLE_TRAINER_ENDPOINTS".to_string(), self.workers.clone()),
            (
                "PADDLE_HETER_TRAINER_IP_PORT_LIST".to_string(),
                self.heter_workers.clone(),
            ),
            (
                "PADDLE_HETER_TRAINER_DEVICE".to_string(),
                self.heter_device.as_str().to_string(),
            ),
            ("PADDLE_TRAINERS_NUM".to_string(), self.worker_num.to_string()),
            ("TRAINING_ROLE".to_string(), role.tag().to_string()),
        ]);
        env.extend(self.gloo.clone());

        match role {
            Role::Trainer => {
                env.insert("PADDLE_TRAINER_ID".into(), proc.rank.to_string());
                if self.local_device_count > 0 {
                    env.extend(self.affinity(local_index));
                }
            }
            Role::Server => {
                env.insert("PADDLE_PORT".into(), proc.endpoint.port.to_string());
                env.insert("POD_IP".into(), proc.endpoint.host.clone());
            }
            Role::HeterWorker => {
                if self.local_device_count == 0 {
                    return Err(LaunchError::config(format!(
                        "heter worker rank {} needs a local {} device but none are visible",
                        proc.rank,
                        self.heter_device.as_str()
                    )));
                }
                env.insert("PADDLE_PORT".into(), proc.endpoint.port.to_string());
                env.insert("POD_IP".into(), proc.endpoint.host.clone());
                env.extend(self.affinity(local_index));
            }
        }
        Ok(env)
    }

    fn affinity(&self, local_index: usize) -> EnvMap {
        let device = (local_index % self.local_device_count).to_string();
        [
            "FLAGS_selected_gpus",
            "FLAGS_selected_xpus",
            "CUDA_VISIBLE_DEVICES",
            "XPU_VISIBLE_DEVICES",
        ]
        .into_iter()
        .map(|k| (k.to_string(), device.clone()))
        .collect()
    }
}

/// Render variables as a boxed two-column table for the launch log.
///
/// Long values are shortened to their tail so the table keeps its width.
pub fn format_env_table(envs: &EnvMap, header: (&str, &str)) -> String {
    const SPACING: usize = 2;
    let max_v: usize = 45;

    let max_k = envs.keys().map(String::len).max().unwrap_or(0).max(40);
    let width = max_k + max_v + SPACING;
    let border = format!("    +{}+", "=".repeat(width));
    let line = format!("    +{}+", "-".repeat(width));

    let mut out = String::new();
    out.push('\n');
    out.push_str(&border);
    out.push('\n');
    out.push_str(&format!(
        "    |{:>max_k$}{}{:^max_v$}|\n",
        header.0,
        " ".repeat(SPACING),
        header.1
    ));
    out.push_str(&line);
    out.push('\n');
    for (k, v) in envs {
        let shown = if v.chars().count() >= max_v {
            let tail: String = v.chars().skip(v.chars().count() - 41).collect();
            format!("... {tail}")
        } else {
            v.clone()
        };
        out.push_str(&format!(
            "    |{:>max_k$}{}{:^max_v$}|\n",
            k,
            " ".repeat(SPACING),
            shown
        ));
    }
    out.push_str(&border);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Endpoint, Pod};

    fn ps_cluster() -> Cluster {
        let mut pod = Pod::new(0, "127.0.0.1");
        let proc = |port, rank| RoleProcess {
            devices: vec![],
            endpoint: Endpoint::new("127.0.0.1", port),
            rank,
        };
        pod.servers = vec![proc(6000, 0), proc(6001, 1)];
        pod.trainers = vec![proc(6002, 0)];
        pod.heter_workers = vec![proc(6003, 0)];
        Cluster::new(vec![pod])
    }

    #[test]
    fn proxies_are_stripped() {
        let mut env = EnvMap::from([
            ("http_proxy".to_string(), "x".to_string()),
            ("HTTPS_PROXY".to_string(), "y".to_string()),
            ("PATH".to_string(), "/bin".to_string()),
        ]);
        strip_proxies(&mut env);
        assert_eq!(env.keys().collect::<Vec<_>>(), vec!["PATH"]);
    }

    #[test]
    fn collective_variables() {
        let mut pod = Pod::new(0, "127.0.0.1");
        pod.trainers = vec![
            RoleProcess {
                devices: vec![0],
                endpoint: Endpoint::new("127.0.0.1", 6070),
                rank: 0,
            },
            RoleProcess {
                devices: vec![1],
                endpoint: Endpoint::new("127.0.0.1", 6071),
                rank: 1,
            },
        ];
        let cluster = Cluster::new(vec![pod]);
        let env = collective_env(&cluster, &cluster.pods[0].trainers[1]);
        assert_eq!(env["FLAGS_selected_gpus"], "1");
        assert_eq!(env["PADDLE_TRAINER_ID"], "1");
        assert_eq!(env["PADDLE_CURRENT_ENDPOINT"], "127.0.0.1:6071");
        assert_eq!(env["PADDLE_TRAINERS_NUM"], "2");
        assert_eq!(env["PADDLE_TRAINER_ENDPOINTS"], "127.0.0.1:6070,127.0.0.1:6071");
    }

    #[test]
    fn server_variables() {
        let cluster = ps_cluster();
        let ps = PsEnv::new(&cluster, DeviceKind::Gpu, 0, Path::new("/tmp/rdv"));
        let env = ps
            .role_env(Role::Server, &cluster.pods[0].servers[1], 1)
            .unwrap();
        assert_eq!(env["TRAINING_ROLE"], "PSERVER");
        assert_eq!(env["PADDLE_PORT"], "6001");
        assert_eq!(env["POD_IP"], "127.0.0.1");
        assert_eq!(env["PADDLE_PSERVERS_IP_PORT_LIST"], "127.0.0.1:6000,127.0.0.1:6001");
        assert_eq!(env["PADDLE_TRAINERS_NUM"], "1");
        assert_eq!(env["PADDLE_GLOO_FS_PATH"], "/tmp/rdv");
        assert!(!env.contains_key("PADDLE_TRAINER_ID"));
    }

    #[test]
    fn heter_affinity_is_round_robin() {
        let cluster = ps_cluster();
        let ps = PsEnv::new(&cluster, DeviceKind::Xpu, 2, Path::new("/tmp/rdv"));
        let heter = &cluster.pods[0].heter_workers[0];
        let env = ps.role_env(Role::HeterWorker, heter, 3).unwrap();
        assert_eq!(env["TRAINING_ROLE"], "HETER_TRAINER");
        assert_eq!(env["PADDLE_HETER_TRAINER_DEVICE"], "xpu");
        for key in [
            "FLAGS_selected_gpus",
            "FLAGS_selected_xpus",
            "CUDA_VISIBLE_DEVICES",
            "XPU_VISIBLE_DEVICES",
        ] {
            assert_eq!(env[key], "1");
        }
    }

    #[test]
    fn heter_without_devices_is_rejected() {
        let cluster = ps_cluster();
        let ps = PsEnv::new(&cluster, DeviceKind::Gpu, 0, Path::new("/tmp/rdv"));
        let heter = &cluster.pods[0].heter_workers[0];
        assert!(ps.role_env(Role::HeterWorker, heter, 0).is_err());

        let worker = ps.role_env(Role::Trainer, &cluster.pods[0].trainers[0], 0).unwrap();
        assert_eq!(worker["PADDLE_TRAINER_ID"], "0");
        assert!(!worker.contains_key("CUDA_VISIBLE_DEVICES"));
    }

    #[test]
    fn env_table_truncates_long_values() {
        let envs = EnvMap::from([
            ("SHORT".to_string(), "v".to_string()),
            ("LONG".to_string(), "x".repeat(60)),
        ]);
        let table = format_env_table(&envs, ("Distributed Envs", "Value"));
        assert!(table.contains("Distributed Envs"));
        assert!(table.contains(&format!("... {}", "x".repeat(41))));
        let widths: Vec<usize> = table
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.chars().count())
            .collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }
}
