//! Host liveness and port probing.
//!
//! [`Prober`] is the seam the scheduler talks to. [`TcpProber`] is the real
//! implementation: plain TCP connects bounded by a semaphore, an optional
//! fallback to the system `ping`, and MAC/vendor lookup from the OS neighbor
//! table. Every failure degrades to an empty result.

use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use mac_oui::Oui;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::netdetect::expand_hosts;
use crate::types::{LinkIdentity, PortScan};

/// Host and port discovery capability.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Addresses in `range` that answered a liveness probe.
    async fn discover_live_hosts(&self, range: Ipv4Net) -> BTreeSet<IpAddr>;

    /// Which of `ports` are open on `addr`, plus link identity when known.
    async fn scan_ports(&self, addr: IpAddr, ports: &[u16]) -> PortScan;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    Open,
    Refused,
    Silent,
}

/// TCP connect based prober.
#[derive(Debug, Clone)]
pub struct TcpProber {
    cfg: ProbeConfig,
    liveness_ports: Arc<[u16]>,
    sem: Arc<Semaphore>,
}

impl TcpProber {
    /// `liveness_ports` are tried during the sweep; any answer, including
    /// a refused connection, marks the host as up.
    pub fn new(cfg: ProbeConfig, liveness_ports: &[u16]) -> Self {
        let sem = Arc::new(Semaphore::new(cfg.concurrency.clamp(1, 5_000)));
        Self {
            cfg,
            liveness_ports: liveness_ports.into(),
            sem,
        }
    }

    async fn is_alive(&self, ip: IpAddr) -> bool {
        if tcp_alive(ip, &self.liveness_ports, self.cfg.connect_timeout).await {
            return true;
        }
        self.cfg.use_icmp && ping_host(ip, self.cfg.connect_timeout).await
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn discover_live_hosts(&self, range: Ipv4Net) -> BTreeSet<IpAddr> {
        let targets = expand_hosts(range, self.cfg.max_sweep_hosts);
        if host_count(range) > targets.len() as u64 {
            warn!(%range, swept = targets.len(), "range larger than sweep limit, truncating");
        }

        let mut set = JoinSet::new();
        for ip in targets {
            let Ok(permit) = self.sem.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            set.spawn(async move {
                let _permit = permit;
                this.is_alive(ip).await.then_some(ip)
            });
        }

        let mut live = BTreeSet::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(Some(ip)) => {
                    live.insert(ip);
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "liveness task failed"),
            }
        }
        debug!(%range, live = live.len(), "liveness sweep done");
        live
    }

    async fn scan_ports(&self, addr: IpAddr, ports: &[u16]) -> PortScan {
        let Ok(_permit) = self.sem.acquire().await else {
            return PortScan::default();
        };

        let open_ports = match time::timeout(
            self.cfg.host_timeout,
            probe_open_ports(addr, ports, self.cfg.connect_timeout),
        )
        .await
        {
            Ok(open) => open,
            Err(_) => {
                debug!(%addr, "port scan hit host timeout");
                BTreeSet::new()
            }
        };

        let link = neighbor_table()
            .await
            .remove(&addr)
            .map(|mac| LinkIdentity {
                vendor: vendor_for_mac(&mac),
                mac: Some(mac),
            });

        PortScan { open_ports, link }
    }
}

/// Number of sweepable addresses in `range`.
fn host_count(range: Ipv4Net) -> u64 {
    match range.prefix_len() {
        31 => 2,
        32 => 1,
        p => (1u64 << (32 - p)) - 2,
    }
}

async fn connect_state(addr: SocketAddr, timeout: Duration) -> ConnectState {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ConnectState::Open,
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => ConnectState::Refused,
        _ => ConnectState::Silent,
    }
}

async fn tcp_alive(ip: IpAddr, ports: &[u16], timeout: Duration) -> bool {
    let mut set = JoinSet::new();
    for &port in ports {
        set.spawn(connect_state(SocketAddr::new(ip, port), timeout));
    }
    // Dropping the set aborts the remaining connects.
    while let Some(res) = set.join_next().await {
        if matches!(res, Ok(ConnectState::Open | ConnectState::Refused)) {
            return true;
        }
    }
    false
}

async fn probe_open_ports(ip: IpAddr, ports: &[u16], timeout: Duration) -> BTreeSet<u16> {
    let mut set = JoinSet::new();
    for &port in ports {
        set.spawn(async move {
            (connect_state(SocketAddr::new(ip, port), timeout).await == ConnectState::Open)
                .then_some(port)
        });
    }
    let mut open = BTreeSet::new();
    while let Some(res) = set.join_next().await {
        if let Ok(Some(port)) = res {
            open.insert(port);
        }
    }
    open
}

async fn ping_host(ip: IpAddr, timeout: Duration) -> bool {
    let windows = cfg!(target_os = "windows");
    // Linux ping takes whole seconds, the others milliseconds.
    let wait = if cfg!(any(target_os = "windows", target_os = "macos")) {
        timeout.as_millis().max(1).to_string()
    } else {
        timeout.as_secs().max(1).to_string()
    };
    let mut cmd = Command::new("ping");
    cmd.args([
        if windows { "-n" } else { "-c" },
        "1",
        if windows { "-w" } else { "-W" },
        wait.as_str(),
    ])
    .arg(ip.to_string())
    .kill_on_drop(true);

    // `ping` waits at least a whole second on some platforms.
    let budget = timeout.max(Duration::from_secs(1)) + Duration::from_millis(500);
    match time::timeout(budget, cmd.output()).await {
        Ok(Ok(out)) => out.status.success(),
        Ok(Err(e)) => {
            debug!(error = %e, "ping unavailable");
            false
        }
        Err(_) => false,
    }
}

/// Current IP -> MAC entries from the OS neighbor cache.
async fn neighbor_table() -> HashMap<IpAddr, String> {
    #[cfg(target_os = "linux")]
    {
        match tokio::fs::read_to_string("/proc/net/arp").await {
            Ok(s) => parse_proc_net_arp(&s),
            Err(e) => {
                debug!(error = %e, "cannot read /proc/net/arp");
                HashMap::new()
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        match Command::new("arp").arg("-a").output().await {
            Ok(out) => parse_arp_listing(&String::from_utf8_lossy(&out.stdout)),
            Err(e) => {
                debug!(error = %e, "cannot run arp -a");
                HashMap::new()
            }
        }
    }
}

/// Parse the Linux `/proc/net/arp` table. Incomplete entries (flags 0x0)
/// and unusable MACs are skipped.
pub fn parse_proc_net_arp(s: &str) -> HashMap<IpAddr, String> {
    s.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 || cols[2] == "0x0" {
                return None;
            }
            let ip: IpAddr = cols[0].parse().ok()?;
            Some((ip, normalize_mac(cols[3])?))
        })
        .collect()
}

/// Parse `arp -a` output from macOS, BSD or Windows.
pub fn parse_arp_listing(s: &str) -> HashMap<IpAddr, String> {
    let mut map = HashMap::new();
    for line in s.lines() {
        let mut ip = None;
        let mut mac = None;
        for tok in line.split_whitespace() {
            let tok = tok.trim_matches(|c| c == '(' || c == ')');
            if ip.is_none() {
                if let Ok(parsed) = tok.parse::<IpAddr>() {
                    ip = Some(parsed);
                    continue;
                }
            }
            if mac.is_none() {
                mac = normalize_mac(tok);
            }
        }
        if let (Some(ip), Some(mac)) = (ip, mac) {
            map.insert(ip, mac);
        }
    }
    map
}

/// Canonical `AA:BB:CC:DD:EE:FF` form. Accepts `:` or `-` separators and
/// unpadded octets (`a:b:c:d:e:f`). All-zero and broadcast MACs are rejected.
pub fn normalize_mac(s: &str) -> Option<String> {
    let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut octets = [0u8; 6];
    for (o, p) in octets.iter_mut().zip(&parts) {
        if p.is_empty() || p.len() > 2 {
            return None;
        }
        *o = u8::from_str_radix(p, 16).ok()?;
    }
    if octets == [0; 6] || octets == [0xff; 6] {
        return None;
    }
    Some(
        octets
            .iter()
            .map(|o| format!("{o:02X}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

static OUI_DB: OnceLock<Option<Oui>> = OnceLock::new();

fn oui_db() -> Option<&'static Oui> {
    OUI_DB
        .get_or_init(|| match Oui::default() {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(error = %e, "failed to load OUI database, vendors will be unknown");
                None
            }
        })
        .as_ref()
}

/// Manufacturer registered for the MAC's OUI prefix.
pub fn vendor_for_mac(mac: &str) -> Option<String> {
    match oui_db()?.lookup_by_mac(mac) {
        Ok(Some(entry)) => Some(entry.company_name.clone()),
        _ => None,
    }
}
