use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{ipv4_mask_to_prefix, Ipv4Net};
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use thiserror::Error;
use tracing::{debug, warn};

/// Address used only to ask the OS which source address the default route
/// would pick. Nothing is sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Range scanned when the local network cannot be determined.
pub fn fallback_range() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(192, 168, 1, 0), 24).expect("/24 is always valid")
}

/// Range reported before the first cycle has run.
pub fn unknown_range() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("/0 is always valid")
}

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("no default route: {0}")]
    NoDefaultRoute(#[source] io::Error),

    #[error("default route source is not a usable IPv4 address: {0}")]
    UnusableSource(IpAddr),

    #[error("failed to list interfaces: {0}")]
    Interfaces(#[source] io::Error),

    #[error("no interface owns {0}")]
    NoInterface(Ipv4Addr),

    #[error("invalid netmask {mask} on {iface}")]
    BadNetmask { iface: String, mask: Ipv4Addr },
}

/// Decides which network range a cycle should sweep.
pub trait Locator: Send + Sync {
    fn locate(&self) -> Ipv4Net;
}

/// Reads the default-route interface and its address/mask from the OS.
#[derive(Debug, Clone)]
pub struct SystemLocator {
    fallback: Ipv4Net,
}

impl SystemLocator {
    pub fn new(fallback: Ipv4Net) -> Self {
        Self { fallback }
    }

    pub fn try_locate(&self) -> Result<Ipv4Net, LocateError> {
        let source = default_route_source()?;
        let ifaces = get_if_addrs().map_err(LocateError::Interfaces)?;
        let v4 = ifaces.iter().filter_map(|iface| match &iface.addr {
            IfAddr::V4(v4) => Some((iface.name.as_str(), v4.ip, v4.netmask)),
            IfAddr::V6(_) => None,
        });
        network_of_source(source, v4)
    }
}

impl Default for SystemLocator {
    fn default() -> Self {
        Self::new(fallback_range())
    }
}

impl Locator for SystemLocator {
    fn locate(&self) -> Ipv4Net {
        match self.try_locate() {
            Ok(net) => {
                debug!(%net, "located local network");
                net
            }
            Err(e) => {
                warn!(error = %e, fallback = %self.fallback, "network detection failed, using fallback");
                self.fallback
            }
        }
    }
}

/// Always returns the same range.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocator(pub Ipv4Net);

impl Locator for FixedLocator {
    fn locate(&self) -> Ipv4Net {
        self.0
    }
}

fn default_route_source() -> Result<Ipv4Addr, LocateError> {
    let sock = UdpSocket::bind("0.0.0.0:0").map_err(LocateError::NoDefaultRoute)?;
    sock.connect(ROUTE_PROBE_ADDR)
        .map_err(LocateError::NoDefaultRoute)?;
    let local = sock.local_addr().map_err(LocateError::NoDefaultRoute)?.ip();
    match local {
        IpAddr::V4(v4) if !v4.is_unspecified() && !v4.is_loopback() => Ok(v4),
        other => Err(LocateError::UnusableSource(other)),
    }
}

/// Find the interface owning `source` and return the network it sits on.
pub fn network_of_source<'a>(
    source: Ipv4Addr,
    ifaces: impl IntoIterator<Item = (&'a str, Ipv4Addr, Ipv4Addr)>,
) -> Result<Ipv4Net, LocateError> {
    let (name, ip, mask) = ifaces
        .into_iter()
        .find(|(_, ip, _)| *ip == source)
        .ok_or(LocateError::NoInterface(source))?;
    network_from_mask(ip, mask).ok_or_else(|| LocateError::BadNetmask {
        iface: name.to_string(),
        mask,
    })
}

/// `192.168.1.42` + `255.255.255.0` -> `192.168.1.0/24`.
/// Returns `None` for a non-contiguous mask.
pub fn network_from_mask(ip: Ipv4Addr, mask: Ipv4Addr) -> Option<Ipv4Net> {
    let prefix = ipv4_mask_to_prefix(mask).ok()?;
    Ipv4Net::new(ip, prefix).ok().map(|n| n.trunc())
}

/// Host addresses of `range` in ascending order, at most `max` of them.
///
/// Network and broadcast addresses are excluded except for /31 and /32.
pub fn expand_hosts(range: Ipv4Net, max: usize) -> Vec<IpAddr> {
    range.hosts().take(max).map(IpAddr::V4).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_to_network() {
        let net = network_from_mask(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 255, 0, 0)).unwrap();
        assert_eq!(net.to_string(), "10.1.0.0/16");
    }

    #[test]
    fn non_contiguous_mask_rejected() {
        assert!(network_from_mask(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 255, 0)).is_none());
    }

    #[test]
    fn expand_small_range_excludes_network_and_broadcast() {
        let net: Ipv4Net = "192.168.1.0/30".parse().unwrap();
        let hosts = expand_hosts(net, usize::MAX);
        assert_eq!(
            hosts,
            vec![
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
            ]
        );
    }

    #[test]
    fn expand_is_capped() {
        let net: Ipv4Net = "10.0.0.0/16".parse().unwrap();
        assert_eq!(expand_hosts(net, 100).len(), 100);
    }

    #[test]
    fn fixed_locator_returns_its_range() {
        let net: Ipv4Net = "172.16.5.0/24".parse().unwrap();
        assert_eq!(FixedLocator(net).locate(), net);
    }
}
