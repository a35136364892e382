use std::collections::BTreeMap;

use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::types::{Device, Snapshot};

/// History samples included in a summary.
pub const HISTORY_WINDOW: usize = 60;

const UNKNOWN: &str = "Unknown";

/// One device as shown to the presentation layer.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    pub ip: String,
    pub mac: String,
    pub vendor: String,
    pub open_ports: Vec<u16>,
    pub vulns: Vec<String>,
    pub last_seen: String,
}

/// Read-only summary of a registry snapshot.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub network: String,
    pub total: usize,
    pub safe: usize,
    pub vulnerable: usize,
    pub history: Vec<usize>,
    /// Port -> number of devices with a finding on that port.
    pub vuln_ports: BTreeMap<u16, usize>,
    pub devices: Vec<DeviceRow>,
}

pub fn summarize(snapshot: &Snapshot) -> Summary {
    let total = snapshot.devices.len();
    let vulnerable = snapshot.devices.iter().filter(|d| d.is_vulnerable()).count();

    let mut vuln_ports = BTreeMap::new();
    for finding in snapshot.devices.iter().flat_map(|d| &d.findings) {
        *vuln_ports.entry(finding.port).or_insert(0) += 1;
    }

    let skip = snapshot.history.len().saturating_sub(HISTORY_WINDOW);

    Summary {
        network: snapshot.range.to_string(),
        total,
        safe: total - vulnerable,
        vulnerable,
        history: snapshot.history[skip..].to_vec(),
        vuln_ports,
        devices: snapshot.devices.iter().map(device_row).collect(),
    }
}

fn device_row(d: &Device) -> DeviceRow {
    DeviceRow {
        ip: d.address.to_string(),
        mac: d.link.mac.clone().unwrap_or_else(|| UNKNOWN.to_string()),
        vendor: d.link.vendor.clone().unwrap_or_else(|| UNKNOWN.to_string()),
        open_ports: d.open_ports.iter().copied().collect(),
        vulns: d.findings.iter().map(ToString::to_string).collect(),
        last_seen: format_last_seen(d.last_seen),
    }
}

/// `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn format_last_seen(t: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    t.to_offset(time::UtcOffset::UTC)
        .format(fmt)
        .unwrap_or_else(|_| String::from("1970-01-01 00:00:00"))
}
