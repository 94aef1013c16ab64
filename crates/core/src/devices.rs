//! Local accelerator selection.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::env::VarSource;
use crate::error::{LaunchError, Result};
use crate::topology::DeviceId;

/// Accelerator family used by heterogeneous workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Gpu,
    Xpu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Gpu => "gpu",
            DeviceKind::Xpu => "xpu",
        }
    }

    /// Variable that masks which devices of this kind a process can see.
    pub fn visible_devices_var(self) -> &'static str {
        match self {
            DeviceKind::Gpu => "CUDA_VISIBLE_DEVICES",
            DeviceKind::Xpu => "XPU_VISIBLE_DEVICES",
        }
    }

    fn device_node_prefix(self) -> &'static str {
        match self {
            DeviceKind::Gpu => "nvidia",
            DeviceKind::Xpu => "xpu",
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gpu" => Ok(DeviceKind::Gpu),
            "xpu" => Ok(DeviceKind::Xpu),
            other => Err(LaunchError::config(format!("unknown device kind {other:?}"))),
        }
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Number of devices of `kind` this node can use.
///
/// The visible-devices mask wins when set; otherwise `/dev/<prefix><N>`
/// device nodes are counted.
pub fn detect_device_count(kind: DeviceKind, vars: &dyn VarSource) -> usize {
    if let Some(mask) = vars.var(kind.visible_devices_var()) {
        return split_list(&mask).len();
    }
    count_device_nodes(Path::new("/dev"), kind.device_node_prefix())
}

fn count_device_nodes(dev: &Path, prefix: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(dev) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(prefix))
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        })
        .count()
}

/// Resolve the device ids the local trainers are bound to.
///
/// Without an explicit list every detected device is used. With one, ids are
/// taken as-is unless `CUDA_VISIBLE_DEVICES` is set, in which case each
/// requested id must appear in the mask and is rewritten to its position in
/// it, since children only see the masked devices.
pub fn select_devices(
    requested: Option<&str>,
    visible: Option<&str>,
    detected_count: usize,
) -> Result<Vec<DeviceId>> {
    let devices = match requested {
        None => (0..detected_count as DeviceId).collect(),
        Some(requested) => {
            let requested = split_list(requested);
            let visible = visible.map(split_list).filter(|v| !v.is_empty());
            match visible {
                None => requested
                    .iter()
                    .map(|id| {
                        id.parse::<DeviceId>().map_err(|_| {
                            LaunchError::config(format!("device id {id:?} is not a number"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
                Some(visible) => {
                    let relative = requested
                        .iter()
                        .map(|id| {
                            visible
                                .iter()
                                .position(|v| v == id)
                                .map(|i| i as DeviceId)
                                .ok_or_else(|| {
                                    LaunchError::config(format!(
                                        "can't find your device {id} in CUDA_VISIBLE_DEVICES[{}]",
                                        visible.join(",")
                                    ))
                                })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    tracing::info!(
                        requested = %requested.join(","),
                        relative = ?relative,
                        visible = %visible.join(","),
                        "selected devices changed into relative values according to CUDA_VISIBLE_DEVICES"
                    );
                    relative
                }
            }
        }
    };

    if devices.is_empty() {
        return Err(LaunchError::config(
            "no accelerator devices are visible; pass --gpus explicitly",
        ));
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn all_detected_devices_by_default() {
        assert_eq!(select_devices(None, None, 4).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn explicit_list_without_mask() {
        assert_eq!(select_devices(Some("2, 3"), None, 0).unwrap(), vec![2, 3]);
        assert!(select_devices(Some("a"), None, 0).is_err());
    }

    #[test]
    fn explicit_list_is_made_relative_to_mask() {
        assert_eq!(
            select_devices(Some("5,7"), Some("4,5,6,7"), 4).unwrap(),
            vec![1, 3]
        );
        let err = select_devices(Some("1"), Some("4,5"), 2).unwrap_err();
        assert!(matches!(err, LaunchError::Config(msg) if msg.contains("CUDA_VISIBLE_DEVICES")));
    }

    #[test]
    fn no_devices_is_config_error() {
        assert!(select_devices(None, None, 0).is_err());
    }

    #[test]
    fn mask_drives_detection() {
        let vars = HashMap::from([("XPU_VISIBLE_DEVICES".to_string(), "0,1,2".to_string())]);
        assert_eq!(detect_device_count(DeviceKind::Xpu, &vars), 3);
    }

    #[test]
    fn counts_device_nodes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["nvidia0", "nvidia1", "nvidiactl", "nvidia-uvm"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(count_device_nodes(dir.path(), "nvidia"), 2);
    }

    #[test]
    fn device_kind_parse() {
        assert_eq!("XPU".parse::<DeviceKind>().unwrap(), DeviceKind::Xpu);
        assert!("tpu".parse::<DeviceKind>().is_err());
    }
}
