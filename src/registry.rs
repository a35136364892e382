//! Authoritative set of currently known devices.
//!
//! [`Registry::new`] hands out exactly one [`RegistryWriter`] and a cloneable
//! [`RegistryReader`]. All state sits behind one `RwLock`: a merge (update,
//! evict, history append) is a single write section, a snapshot is a single
//! read section, so readers only ever see whole cycles.

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::StalenessPolicy;
use crate::netdetect::unknown_range;
use crate::types::{CycleReport, Device, LinkIdentity, Snapshot};
use crate::vulns::VulnTable;

#[derive(Debug)]
struct RegistryState {
    range: Ipv4Net,
    devices: BTreeMap<IpAddr, Device>,
    history: VecDeque<usize>,
    cycles: u64,
}

/// Result of one merge, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub evicted: usize,
    pub total: usize,
}

pub struct Registry;

impl Registry {
    pub fn new(
        policy: StalenessPolicy,
        history_capacity: usize,
        table: Arc<VulnTable>,
    ) -> (RegistryWriter, RegistryReader) {
        let inner = Arc::new(RwLock::new(RegistryState {
            range: unknown_range(),
            devices: BTreeMap::new(),
            history: VecDeque::with_capacity(history_capacity),
            cycles: 0,
        }));
        let writer = RegistryWriter {
            inner: inner.clone(),
            policy,
            history_capacity: history_capacity.max(1),
            table,
        };
        (writer, RegistryReader { inner })
    }
}

/// The only handle able to mutate the registry. Not `Clone`.
#[derive(Debug)]
pub struct RegistryWriter {
    inner: Arc<RwLock<RegistryState>>,
    policy: StalenessPolicy,
    history_capacity: usize,
    table: Arc<VulnTable>,
}

impl RegistryWriter {
    /// Apply one cycle's findings, evict stale devices and record the
    /// resulting device count, atomically with respect to readers.
    pub async fn merge_cycle(&mut self, report: CycleReport) -> MergeStats {
        let CycleReport {
            now,
            range,
            live_hosts,
            mut per_host,
        } = report;
        let mut stats = MergeStats::default();

        let mut guard = self.inner.write().await;
        let state = &mut *guard;
        state.range = range;

        for addr in &live_hosts {
            let scan = per_host.remove(addr).unwrap_or_default();
            let findings = self.table.findings_for(&scan.open_ports);
            match state.devices.get_mut(addr) {
                Some(dev) => {
                    dev.link = LinkIdentity::merge(&dev.link, scan.link.as_ref());
                    dev.open_ports = scan.open_ports;
                    dev.findings = findings;
                    dev.last_seen = now;
                    stats.updated += 1;
                }
                None => {
                    state.devices.insert(
                        *addr,
                        Device {
                            address: *addr,
                            link: LinkIdentity::merge(&LinkIdentity::default(), scan.link.as_ref()),
                            open_ports: scan.open_ports,
                            findings,
                            last_seen: now,
                        },
                    );
                    stats.added += 1;
                }
            }
        }

        let hold = live_hosts.is_empty() && self.policy.hold_on_empty_sweep;
        match eviction_cutoff(now, &self.policy) {
            Some(cutoff) if !hold => {
                let before = state.devices.len();
                state
                    .devices
                    .retain(|addr, dev| live_hosts.contains(addr) || !is_stale(dev.last_seen, cutoff));
                stats.evicted = before - state.devices.len();
            }
            Some(_) => {}
            None => warn!(
                interval_ms = self.policy.interval.as_millis() as u64,
                window_cycles = self.policy.window_cycles,
                "staleness window out of range, skipping eviction"
            ),
        }

        stats.total = state.devices.len();
        state.history.push_back(stats.total);
        while state.history.len() > self.history_capacity {
            state.history.pop_front();
        }
        state.cycles += 1;

        debug!(
            cycle = state.cycles,
            added = stats.added,
            updated = stats.updated,
            evicted = stats.evicted,
            total = stats.total,
            "merged scan cycle"
        );
        stats
    }
}

/// Read-only handle; cheap to clone and share with request handlers.
#[derive(Debug, Clone)]
pub struct RegistryReader {
    inner: Arc<RwLock<RegistryState>>,
}

impl RegistryReader {
    /// Owned copy of the full state as of the last completed cycle.
    pub async fn snapshot(&self) -> Snapshot {
        let state = self.inner.read().await;
        Snapshot {
            range: state.range,
            devices: state.devices.values().cloned().collect(),
            history: state.history.iter().copied().collect(),
            cycles: state.cycles,
        }
    }
}

/// `now` minus the staleness window, or `None` if that is not representable.
fn eviction_cutoff(now: OffsetDateTime, policy: &StalenessPolicy) -> Option<OffsetDateTime> {
    let age = time::Duration::try_from(policy.max_age()?).ok()?;
    now.checked_sub(age)
}

/// A device last seen at or before `cutoff` is stale.
fn is_stale(last_seen: OffsetDateTime, cutoff: OffsetDateTime) -> bool {
    last_seen <= cutoff
}
