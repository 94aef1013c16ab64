//! Resolution of "this node" within a list of node IPs.

use std::net::IpAddr;

use local_ip_address::Error;

use crate::error::{LaunchError, Result};

/// Source of the local machine's addresses.
pub trait IpResolver {
    /// Primary outbound address.
    fn local_ip(&self) -> std::result::Result<IpAddr, Error>;

    /// Addresses of every network interface.
    fn interface_ips(&self) -> std::result::Result<Vec<IpAddr>, Error>;
}

/// Resolver backed by the operating system's interface table.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIpResolver;

impl IpResolver for DefaultIpResolver {
    fn local_ip(&self) -> std::result::Result<IpAddr, Error> {
        local_ip_address::local_ip()
    }

    fn interface_ips(&self) -> std::result::Result<Vec<IpAddr>, Error> {
        Ok(local_ip_address::list_afinet_netifas()?
            .into_iter()
            .map(|(_, ip)| ip)
            .collect())
    }
}

/// Split a comma-separated IP list, dropping blanks.
pub fn split_ips(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Pick this node's IP out of `node_ips`.
///
/// A single-entry list is always "this node". Otherwise an explicit override
/// wins, then the resolver's primary address, then any interface address that
/// appears in the list. Returns the IP together with its node rank.
pub fn resolve_node_ip<R: IpResolver + ?Sized>(
    node_ips: &[String],
    override_ip: Option<&str>,
    resolver: &R,
) -> Result<(String, usize)> {
    let position = |ip: &str| node_ips.iter().position(|n| n == ip);

    if node_ips.is_empty() {
        return Err(LaunchError::config("the node ip list is empty"));
    }

    if node_ips.len() == 1 {
        if let Some(ip) = override_ip.filter(|ip| *ip != node_ips[0]) {
            return Err(LaunchError::config(format!(
                "can't find your local ip {ip} in node_ips: {node_ips:?}"
            )));
        }
        return Ok((node_ips[0].clone(), 0));
    }

    if let Some(ip) = override_ip {
        return position(ip)
            .map(|rank| (ip.to_string(), rank))
            .ok_or_else(|| {
                LaunchError::config(format!(
                    "can't find your local ip {ip} in node_ips: {node_ips:?}"
                ))
            });
    }

    let primary = resolver.local_ip().ok();
    if let Some(rank) = primary.and_then(|ip| position(&ip.to_string())) {
        return Ok((node_ips[rank].clone(), rank));
    }

    match resolver.interface_ips() {
        Ok(ips) => {
            if let Some(rank) = ips.iter().find_map(|ip| position(&ip.to_string())) {
                return Ok((node_ips[rank].clone(), rank));
            }
        }
        Err(e) => tracing::debug!(error = %e, "listing network interfaces failed"),
    }

    Err(LaunchError::config(format!(
        "can't find your local ip {} in node_ips: {node_ips:?}",
        primary.map_or_else(|| "<unresolved>".to_string(), |ip| ip.to_string())
    )))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct MockIpResolver {
        pub primary: Option<IpAddr>,
        pub interfaces: Vec<IpAddr>,
    }

    impl MockIpResolver {
        pub(crate) fn primary(ip: [u8; 4]) -> Self {
            Self {
                primary: Some(IpAddr::from(ip)),
                interfaces: Vec::new(),
            }
        }
    }

    impl IpResolver for MockIpResolver {
        fn local_ip(&self) -> std::result::Result<IpAddr, Error> {
            self.primary.ok_or(Error::LocalIpAddressNotFound)
        }

        fn interface_ips(&self) -> std::result::Result<Vec<IpAddr>, Error> {
            Ok(self.interfaces.clone())
        }
    }

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn split_ip_list() {
        assert_eq!(split_ips(" 10.0.0.1, 10.0.0.2 ,"), ips(&["10.0.0.1", "10.0.0.2"]));
        assert!(split_ips("").is_empty());
    }

    #[test]
    fn single_node_is_local() {
        let resolver = MockIpResolver::primary([192, 168, 0, 1]);
        let (ip, rank) = resolve_node_ip(&ips(&["127.0.0.1"]), None, &resolver).unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(rank, 0);
    }

    #[test]
    fn primary_ip_matched() {
        let resolver = MockIpResolver::primary([10, 0, 0, 2]);
        let (ip, rank) =
            resolve_node_ip(&ips(&["10.0.0.1", "10.0.0.2"]), None, &resolver).unwrap();
        assert_eq!(ip, "10.0.0.2");
        assert_eq!(rank, 1);
    }

    #[test]
    fn falls_back_to_interfaces() {
        let resolver = MockIpResolver {
            primary: Some(IpAddr::from([172, 17, 0, 1])),
            interfaces: vec![IpAddr::from([172, 17, 0, 1]), IpAddr::from([10, 0, 0, 1])],
        };
        let (_, rank) =
            resolve_node_ip(&ips(&["10.0.0.1", "10.0.0.2"]), None, &resolver).unwrap();
        assert_eq!(rank, 0);
    }

    #[test]
    fn override_wins() {
        let resolver = MockIpResolver::primary([10, 0, 0, 1]);
        let (ip, rank) =
            resolve_node_ip(&ips(&["10.0.0.1", "10.0.0.2"]), Some("10.0.0.2"), &resolver)
                .unwrap();
        assert_eq!((ip.as_str(), rank), ("10.0.0.2", 1));
    }

    #[test]
    fn unknown_local_ip_is_config_error() {
        let resolver = MockIpResolver::primary([192, 168, 9, 9]);
        let err = resolve_node_ip(&ips(&["10.0.0.1", "10.0.0.2"]), None, &resolver).unwrap_err();
        assert!(matches!(err, LaunchError::Config(msg) if msg.contains("192.168.9.9")));

        let err = resolve_node_ip(&ips(&["10.0.0.1"]), Some("10.0.0.5"), &resolver).unwrap_err();
        assert!(matches!(err, LaunchError::Config(_)));
    }
}
