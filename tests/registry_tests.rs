use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use iot_watch::config::StalenessPolicy;
use iot_watch::registry::{Registry, RegistryReader, RegistryWriter};
use iot_watch::types::{CycleReport, LinkIdentity, PortScan};
use iot_watch::vulns::{Severity, VulnTable};
use time::{Duration, OffsetDateTime};

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
}

fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(secs)
}

fn new_registry(policy: StalenessPolicy, history: usize) -> (RegistryWriter, RegistryReader) {
    Registry::new(policy, history, Arc::new(VulnTable::default()))
}

fn host(last: u8, ports: &[u16]) -> (IpAddr, PortScan) {
    host_with_link(last, ports, None)
}

fn host_with_link(last: u8, ports: &[u16], link: Option<LinkIdentity>) -> (IpAddr, PortScan) {
    (
        ip(last),
        PortScan {
            open_ports: ports.iter().copied().collect(),
            link,
        },
    )
}

fn cycle(now: OffsetDateTime, hosts: Vec<(IpAddr, PortScan)>) -> CycleReport {
    let live = hosts.iter().map(|(addr, _)| *addr).collect();
    let per_host = hosts.into_iter().collect();
    CycleReport {
        now,
        range: "192.168.1.0/24".parse().unwrap(),
        live_hosts: live,
        per_host,
    }
}

fn link(mac: Option<&str>, vendor: Option<&str>) -> Option<LinkIdentity> {
    Some(LinkIdentity {
        mac: mac.map(str::to_string),
        vendor: vendor.map(str::to_string),
    })
}

#[tokio::test]
async fn live_hosts_get_current_timestamp() {
    let (mut w, r) = new_registry(StalenessPolicy::default(), 200);
    w.merge_cycle(cycle(at(0), vec![host(1, &[]), host(2, &[])])).await;
    w.merge_cycle(cycle(at(15), vec![host(2, &[80]), host(3, &[])])).await;

    let snap = r.snapshot().await;
    let by_ip: BTreeMap<_, _> = snap.devices.iter().map(|d| (d.address, d)).collect();
    assert_eq!(by_ip[&ip(1)].last_seen, at(0));
    assert_eq!(by_ip[&ip(2)].last_seen, at(15));
    assert_eq!(by_ip[&ip(3)].last_seen, at(15));
    assert_eq!(snap.range.to_string(), "192.168.1.0/24");
}

#[tokio::test]
async fn device_kept_for_two_missed_cycles_then_evicted_on_third() {
    let policy = StalenessPolicy {
        interval: StdDuration::from_secs(15),
        window_cycles: 3,
        hold_on_empty_sweep: false,
    };
    let (mut w, r) = new_registry(policy, 200);
    w.merge_cycle(cycle(at(0), vec![host(10, &[]), host(11, &[])])).await;

    w.merge_cycle(cycle(at(15), vec![host(11, &[])])).await;
    w.merge_cycle(cycle(at(30), vec![host(11, &[])])).await;
    let snap = r.snapshot().await;
    assert!(snap.devices.iter().any(|d| d.address == ip(10)), "still listed at t=30");

    w.merge_cycle(cycle(at(45), vec![host(11, &[])])).await;
    let snap = r.snapshot().await;
    assert!(snap.devices.iter().all(|d| d.address != ip(10)), "gone at t=45");

    w.merge_cycle(cycle(at(60), vec![host(11, &[])])).await;
    assert_eq!(r.snapshot().await.devices.len(), 1);
}

#[tokio::test]
async fn rediscovered_device_comes_back() {
    let (mut w, r) = new_registry(StalenessPolicy::default(), 200);
    w.merge_cycle(cycle(at(0), vec![host(5, &[22])])).await;
    w.merge_cycle(cycle(at(45), vec![])).await;
    assert!(r.snapshot().await.devices.is_empty());

    w.merge_cycle(cycle(at(60), vec![host(5, &[23])])).await;
    let snap = r.snapshot().await;
    assert_eq!(snap.devices.len(), 1);
    assert_eq!(snap.devices[0].open_ports, BTreeSet::from([23]));
}

#[tokio::test]
async fn live_host_is_never_evicted_even_with_old_timestamp() {
    let (mut w, r) = new_registry(StalenessPolicy::default(), 200);
    w.merge_cycle(cycle(at(100), vec![host(1, &[])])).await;
    // Clock went backwards: the host is live, so it stays.
    w.merge_cycle(cycle(at(0), vec![host(1, &[])])).await;
    let snap = r.snapshot().await;
    assert_eq!(snap.devices.len(), 1);
    assert_eq!(snap.devices[0].last_seen, at(0));
}

#[tokio::test]
async fn link_identity_is_sticky() {
    let (mut w, r) = new_registry(StalenessPolicy::default(), 200);
    w.merge_cycle(cycle(at(0), vec![host_with_link(1, &[], link(Some("AA:BB:CC:00:00:01"), None))]))
        .await;
    w.merge_cycle(cycle(at(15), vec![host(1, &[])])).await;
    w.merge_cycle(cycle(at(30), vec![host_with_link(1, &[], link(None, Some("Acme")))])).await;
    w.merge_cycle(cycle(
        at(45),
        vec![host_with_link(1, &[], link(Some("11:22:33:44:55:66"), Some("Other")))],
    ))
    .await;

    let snap = r.snapshot().await;
    let dev = &snap.devices[0];
    assert_eq!(dev.link.mac.as_deref(), Some("AA:BB:CC:00:00:01"));
    assert_eq!(dev.link.vendor.as_deref(), Some("Acme"));
}

#[tokio::test]
async fn port_closed_in_later_cycle_drops_its_finding() {
    let (mut w, r) = new_registry(StalenessPolicy::default(), 200);
    w.merge_cycle(cycle(at(0), vec![host(7, &[21, 80])])).await;
    let snap = r.snapshot().await;
    let sev: Vec<_> = snap.devices[0].findings.iter().map(|f| f.severity).collect();
    assert_eq!(sev, vec![Severity::High, Severity::Medium]);

    w.merge_cycle(cycle(at(15), vec![host(7, &[80])])).await;
    let snap = r.snapshot().await;
    let dev = &snap.devices[0];
    assert_eq!(dev.open_ports, BTreeSet::from([80]));
    assert_eq!(dev.findings.len(), 1);
    assert_eq!(dev.findings[0].port, 80);
    assert_eq!(dev.findings[0].severity, Severity::Medium);
}

#[tokio::test]
async fn history_is_bounded_and_keeps_newest() {
    let k = 200;
    let (mut w, r) = new_registry(StalenessPolicy::default(), k);
    // First cycle sees one host, every later cycle sees two.
    w.merge_cycle(cycle(at(0), vec![host(1, &[])])).await;
    for i in 1..=k as i64 {
        w.merge_cycle(cycle(at(i * 15), vec![host(1, &[]), host(2, &[])])).await;
    }
    let snap = r.snapshot().await;
    assert_eq!(snap.history.len(), k);
    assert!(snap.history.iter().all(|&c| c == 2), "oldest sample dropped");
    assert_eq!(snap.cycles, k as u64 + 1);
}

#[tokio::test]
async fn empty_cycle_still_records_history_and_applies_window() {
    let (mut w, r) = new_registry(StalenessPolicy::default(), 200);
    w.merge_cycle(cycle(at(0), vec![host(1, &[]), host(2, &[])])).await;

    // Probe failed entirely: nothing live, devices still inside the window.
    w.merge_cycle(cycle(at(15), vec![])).await;
    let snap = r.snapshot().await;
    assert_eq!(snap.devices.len(), 2);
    assert_eq!(snap.history, vec![2, 2]);

    // Outage persists past the window.
    w.merge_cycle(cycle(at(30), vec![])).await;
    w.merge_cycle(cycle(at(45), vec![])).await;
    let snap = r.snapshot().await;
    assert!(snap.devices.is_empty());
    assert_eq!(snap.history, vec![2, 2, 2, 0]);
}

#[tokio::test]
async fn hold_on_empty_sweep_keeps_devices_through_outage() {
    let policy = StalenessPolicy {
        hold_on_empty_sweep: true,
        ..StalenessPolicy::default()
    };
    let (mut w, r) = new_registry(policy, 200);
    w.merge_cycle(cycle(at(0), vec![host(1, &[]), host(2, &[])])).await;
    w.merge_cycle(cycle(at(60), vec![])).await;
    assert_eq!(r.snapshot().await.devices.len(), 2);

    // Any live host re-enables the window.
    w.merge_cycle(cycle(at(75), vec![host(2, &[])])).await;
    let snap = r.snapshot().await;
    assert_eq!(snap.devices.len(), 1);
    assert_eq!(snap.devices[0].address, ip(2));
}

#[tokio::test]
async fn snapshot_is_independent_of_later_merges() {
    let (mut w, r) = new_registry(StalenessPolicy::default(), 200);
    w.merge_cycle(cycle(at(0), vec![host(1, &[23])])).await;
    let before = r.snapshot().await;
    w.merge_cycle(cycle(at(15), vec![host(1, &[]), host(2, &[])])).await;

    assert_eq!(before.devices.len(), 1);
    assert_eq!(before.devices[0].open_ports, BTreeSet::from([23]));
    assert_eq!(before.history, vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_only_see_whole_cycles() {
    let (mut w, r) = new_registry(StalenessPolicy::default(), 1000);

    let mut readers = Vec::new();
    for _ in 0..4 {
        let r = r.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..200 {
                let snap = r.snapshot().await;
                // Every merge adds exactly one new host and never evicts, so a
                // whole-cycle view has as many devices as cycles and history samples.
                assert_eq!(snap.devices.len() as u64, snap.cycles);
                assert_eq!(snap.history.len() as u64, snap.cycles);
                if let Some(&last) = snap.history.last() {
                    assert_eq!(last, snap.devices.len());
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for i in 0..200u8 {
        let hosts = (0..=i).map(|n| host(n, &[])).collect();
        w.merge_cycle(cycle(at(i as i64), hosts)).await;
        tokio::task::yield_now().await;
    }

    for h in readers {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn oversized_staleness_window_keeps_devices_without_panicking() {
    for interval in [StdDuration::from_secs(1_000_000_000_000), StdDuration::from_secs(u64::MAX)] {
        let policy = StalenessPolicy {
            interval,
            window_cycles: 3,
            hold_on_empty_sweep: false,
        };
        let (mut w, r) = new_registry(policy, 200);
        w.merge_cycle(cycle(at(0), vec![host(1, &[]), host(2, &[])])).await;
        let stats = w.merge_cycle(cycle(at(3_600), vec![host(2, &[])])).await;
        assert_eq!(stats.evicted, 0);

        let snap = r.snapshot().await;
        assert_eq!(snap.devices.len(), 2);
        assert_eq!(snap.history, vec![2, 2]);
    }
}
