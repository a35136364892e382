use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnet::Ipv4Net;
use serde::Serialize;
use time::OffsetDateTime;

use crate::vulns::Finding;

/// Hardware identity learned from the neighbor table.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkIdentity {
    pub mac: Option<String>,
    pub vendor: Option<String>,
}

impl LinkIdentity {
    /// Field-by-field sticky merge: a field that is already known is kept,
    /// an unknown field is filled from `incoming`.
    pub fn merge(existing: &LinkIdentity, incoming: Option<&LinkIdentity>) -> LinkIdentity {
        let Some(incoming) = incoming else {
            return existing.clone();
        };
        LinkIdentity {
            mac: existing.mac.clone().or_else(|| incoming.mac.clone()),
            vendor: existing.vendor.clone().or_else(|| incoming.vendor.clone()),
        }
    }
}

/// What the probe learned about one live host in one cycle.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortScan {
    pub open_ports: BTreeSet<u16>,
    pub link: Option<LinkIdentity>,
}

/// One known device as held by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub address: IpAddr,
    pub link: LinkIdentity,
    pub open_ports: BTreeSet<u16>,
    pub findings: Vec<Finding>,
    pub last_seen: OffsetDateTime,
}

impl Device {
    pub fn is_vulnerable(&self) -> bool {
        !self.findings.is_empty()
    }
}

/// Everything one scheduler cycle hands to the registry.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub now: OffsetDateTime,
    pub range: Ipv4Net,
    pub live_hosts: BTreeSet<IpAddr>,
    pub per_host: BTreeMap<IpAddr, PortScan>,
}

/// Point-in-time copy of the registry, owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub range: Ipv4Net,
    pub devices: Vec<Device>,
    pub history: Vec<usize>,
    pub cycles: u64,
}
