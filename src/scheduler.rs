//! Fixed-interval discovery loop.
//!
//! One cycle locates the network, sweeps it for live hosts, scans each live
//! host's candidate ports and merges everything into the registry in a single
//! call. A failed cycle is logged and counted; the loop keeps going.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::Serialize;
use ::time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::WatchConfig;
use crate::netdetect::Locator;
use crate::registry::{MergeStats, RegistryWriter};
use crate::scanner::Prober;
use crate::types::CycleReport;

/// Shared cycle counters, updated by the scheduler and read by anyone.
#[derive(Debug, Default)]
pub struct CycleCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    last_duration_ms: AtomicU64,
    last_live_hosts: AtomicU64,
}

/// Plain copy of [`CycleCounters`].
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub completed: u64,
    pub failed: u64,
    pub last_duration_ms: u64,
    pub last_live_hosts: u64,
}

impl CycleCounters {
    pub fn stats(&self) -> CycleStats {
        CycleStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
            last_live_hosts: self.last_live_hosts.load(Ordering::Relaxed),
        }
    }
}

/// What one successful cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub range: Ipv4Net,
    pub live_hosts: usize,
    pub merge: MergeStats,
}

type Clock = Box<dyn Fn() -> OffsetDateTime + Send + Sync>;

pub struct Scheduler<L, P> {
    locator: L,
    prober: Arc<P>,
    writer: RegistryWriter,
    ports: Arc<[u16]>,
    interval: Duration,
    counters: Arc<CycleCounters>,
    clock: Clock,
}

impl<L: Locator, P: Prober> Scheduler<L, P> {
    pub fn new(locator: L, prober: Arc<P>, writer: RegistryWriter, config: &WatchConfig) -> Self {
        Self {
            locator,
            prober,
            writer,
            ports: config.ports.as_slice().into(),
            interval: config.staleness.interval.max(Duration::from_millis(1)),
            counters: Arc::new(CycleCounters::default()),
            clock: Box::new(OffsetDateTime::now_utc),
        }
    }

    /// Replace the wall clock used to stamp cycles.
    pub fn with_clock(mut self, clock: impl Fn() -> OffsetDateTime + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn counters(&self) -> Arc<CycleCounters> {
        self.counters.clone()
    }

    /// One full discovery cycle. Any error leaves the registry untouched.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let now = (self.clock)();
        let range = self.locator.locate();
        let live_hosts = self.prober.discover_live_hosts(range).await;
        debug!(%range, live = live_hosts.len(), "sweep finished, scanning ports");

        let mut set = JoinSet::new();
        for &addr in &live_hosts {
            let prober = self.prober.clone();
            let ports = self.ports.clone();
            set.spawn(async move { (addr, prober.scan_ports(addr, &ports).await) });
        }
        let mut per_host = BTreeMap::new();
        while let Some(res) = set.join_next().await {
            let (addr, scan) = res.context("port scan task failed")?;
            per_host.insert(addr, scan);
        }

        let live = live_hosts.len();
        let merge = self
            .writer
            .merge_cycle(CycleReport {
                now,
                range,
                live_hosts,
                per_host,
            })
            .await;

        Ok(CycleOutcome {
            range,
            live_hosts: live,
            merge,
        })
    }

    /// Run one cycle and record its outcome in the counters. Never fails.
    pub async fn tick(&mut self) -> Option<CycleOutcome> {
        let started = Instant::now();
        let result = self.run_cycle().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.counters
            .last_duration_ms
            .store(elapsed_ms, Ordering::Relaxed);

        match result {
            Ok(outcome) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .last_live_hosts
                    .store(outcome.live_hosts as u64, Ordering::Relaxed);
                info!(
                    range = %outcome.range,
                    live = outcome.live_hosts,
                    added = outcome.merge.added,
                    evicted = outcome.merge.evicted,
                    devices = outcome.merge.total,
                    elapsed_ms,
                    "scan cycle complete"
                );
                Some(outcome)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %format!("{e:#}"), elapsed_ms, "scan cycle failed");
                None
            }
        }
    }

    /// Run cycles every interval until `cancel` fires. The first cycle starts
    /// immediately; a cycle in progress always finishes.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, ports = ?self.ports, "scheduler starting");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
    }
}
