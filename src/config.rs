use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;

use crate::netdetect::fallback_range;
use crate::ports::DEFAULT_PORTS;
use crate::vulns::VulnTable;

/// When a device counts as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// Fixed time between scan cycles.
    pub interval: Duration,

    /// Missed cycles after which a device is evicted.
    pub window_cycles: u32,

    /// Skip eviction for a cycle whose sweep found no host at all.
    pub hold_on_empty_sweep: bool,
}

impl StalenessPolicy {
    /// Age at which a device that was not seen this cycle is dropped.
    /// `None` when `interval * window_cycles` does not fit in a `Duration`.
    pub fn max_age(&self) -> Option<Duration> {
        self.interval.checked_mul(self.window_cycles)
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            window_cycles: 3,
            hold_on_empty_sweep: false,
        }
    }
}

/// Probe tuning for [`crate::scanner::TcpProber`].
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Max concurrent hosts probed at once.
    pub concurrency: usize,

    /// Timeout for a single TCP connect.
    pub connect_timeout: Duration,

    /// Cap on one host's whole port scan.
    pub host_timeout: Duration,

    /// Fall back to the system `ping` when no TCP port answered.
    pub use_icmp: bool,

    /// Upper bound on addresses swept per cycle.
    pub max_sweep_hosts: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: 256,
            connect_timeout: Duration::from_millis(400),
            host_timeout: Duration::from_secs(5),
            use_icmp: true,
            max_sweep_hosts: 1024,
        }
    }
}

/// Everything the core needs at startup.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub staleness: StalenessPolicy,

    /// History samples kept by the registry.
    pub history_capacity: usize,

    /// Candidate ports probed on every live host.
    pub ports: Vec<u16>,

    pub vuln_table: Arc<VulnTable>,

    pub probe: ProbeConfig,

    /// Used when the local network cannot be determined.
    pub fallback_range: Ipv4Net,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            staleness: StalenessPolicy::default(),
            history_capacity: 200,
            ports: DEFAULT_PORTS.to_vec(),
            vuln_table: Arc::new(VulnTable::default()),
            probe: ProbeConfig::default(),
            fallback_range: fallback_range(),
        }
    }
}
