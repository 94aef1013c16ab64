//! Port allocation for role-process endpoints.
//!
//! Probing the OS for free ports is only safe when a single node picks its own
//! endpoints. Multi-node jobs must use [`port_range`] so every node derives the
//! same ports for the same logical endpoints without talking to each other.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};

use crate::error::{LaunchError, Result};

/// Start port used when nothing else is configured.
pub const DEFAULT_START_PORT: u16 = 6070;

/// Probe attempts before [`find_free_ports`] gives up.
const MAX_PROBES: usize = 100;

/// Collect `count` distinct ephemeral ports by binding and releasing sockets.
///
/// Returns `None` once the probe budget is exhausted.
pub fn find_free_ports(count: usize) -> Option<BTreeSet<u16>> {
    let mut ports = BTreeSet::new();
    if count == 0 {
        return Some(ports);
    }

    for _ in 0..MAX_PROBES {
        let port = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|listener| listener.local_addr())
        {
            Ok(addr) => addr.port(),
            Err(e) => {
                tracing::trace!(error = %e, "port probe failed");
                continue;
            }
        };
        ports.insert(port);
        if ports.len() >= count {
            return Some(ports);
        }
    }

    tracing::debug!(requested = count, found = ports.len(), "free port probing exhausted");
    None
}

/// The contiguous block `start + offset .. start + offset + count`.
pub fn port_range(start: u16, offset: usize, count: usize) -> Result<Vec<u16>> {
    let first = usize::from(start) + offset;
    let end = first + count;
    if end > usize::from(u16::MAX) + 1 {
        return Err(LaunchError::config(format!(
            "port block {first}..{end} (start port {start}) does not fit in the port space"
        )));
    }
    // Bounded by the check above.
    Ok((first..end).map(|p| p as u16).collect())
}

/// Ports for `count` role slots starting at `offset` within a role layout.
///
/// With a start port the result is deterministic. Without one the OS is
/// probed, falling back to [`DEFAULT_START_PORT`] if probing fails.
pub fn allocate_ports(count: usize, offset: usize, start_port: Option<u16>) -> Result<Vec<u16>> {
    if let Some(start) = start_port {
        return port_range(start, offset, count);
    }

    match find_free_ports(count) {
        Some(ports) => Ok(ports.into_iter().collect()),
        None => {
            let err = LaunchError::Allocation { requested: count };
            tracing::warn!(
                error = %err,
                start_port = DEFAULT_START_PORT,
                "can't find available ports, using the static port range"
            );
            port_range(DEFAULT_START_PORT, offset, count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_ports_are_distinct() {
        let ports = find_free_ports(4).expect("loopback probing should succeed");
        assert_eq!(ports.len(), 4);
        assert!(ports.iter().all(|&p| p != 0));
    }

    #[test]
    fn zero_ports_is_trivial() {
        assert_eq!(find_free_ports(0), Some(BTreeSet::new()));
    }

    #[test]
    fn range_is_offset_from_start() {
        assert_eq!(port_range(6170, 2, 3).unwrap(), vec![6172, 6173, 6174]);
        assert!(port_range(6170, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn range_overflow_is_config_error() {
        assert_eq!(port_range(65534, 0, 2).unwrap(), vec![65534, 65535]);
        let err = port_range(65534, 1, 2).unwrap_err();
        assert!(matches!(err, LaunchError::Config(_)));
    }

    #[test]
    fn start_port_is_deterministic() {
        let a = allocate_ports(3, 2, Some(7000)).unwrap();
        let b = allocate_ports(3, 2, Some(7000)).unwrap();
        assert_eq!(a, vec![7002, 7003, 7004]);
        assert_eq!(a, b);
    }

    #[test]
    fn probing_without_start_port() {
        let ports = allocate_ports(2, 0, None).unwrap();
        assert_eq!(ports.len(), 2);
        assert_ne!(ports[0], ports[1]);
    }
}
