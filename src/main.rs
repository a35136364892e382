use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use iot_watch::config::{ProbeConfig, StalenessPolicy, WatchConfig};
use iot_watch::logging::{self, LogLevel};
use iot_watch::netdetect::{fallback_range, FixedLocator, Locator, SystemLocator};
use iot_watch::ports;
use iot_watch::registry::{Registry, RegistryReader};
use iot_watch::scanner::TcpProber;
use iot_watch::scheduler::Scheduler;
use iot_watch::server::{self, AppState};
use iot_watch::summary::{summarize, Summary};
use iot_watch::vulns::{load_vuln_table_from_path, VulnTable};

/// iot-watch: continuous LAN device discovery with open-port vulnerability hints.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "iot-watch",
    version,
    about = "Continuous LAN device discovery with open-port vulnerability hints.",
    long_about = None
)]
struct Cli {
    /// CIDR to watch (e.g., 192.168.1.0/24). If omitted, detected from the default route.
    #[arg(long)]
    range: Option<Ipv4Net>,

    /// Candidate ports: inline list (`21,22,8000-8010`) or `@path` to a ports file.
    #[arg(long)]
    ports: Option<String>,

    /// Vulnerability table file, one `PORT SEVERITY advisory` per line.
    #[arg(long = "vuln-table")]
    vuln_table: Option<PathBuf>,

    /// Seconds between scan cycles (at most one day).
    #[arg(long = "interval-secs", default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..=86_400))]
    interval_secs: u64,

    /// Missed cycles after which a device is dropped.
    #[arg(long = "stale-cycles", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..=10_000))]
    stale_cycles: u32,

    /// Device-count samples kept in history.
    #[arg(long, default_value_t = 200)]
    history: usize,

    /// Do not evict anything in a cycle whose sweep found no host at all.
    #[arg(long = "hold-on-empty-sweep", default_value_t = false)]
    hold_on_empty_sweep: bool,

    /// Max hosts probed concurrently.
    #[arg(long, default_value_t = 256)]
    concurrency: usize,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 400)]
    timeout_ms: u64,

    /// Cap on one host's port scan in milliseconds.
    #[arg(long = "host-timeout-ms", default_value_t = 5000)]
    host_timeout_ms: u64,

    /// Max addresses swept per cycle.
    #[arg(long = "max-hosts", default_value_t = 1024)]
    max_hosts: usize,

    /// Never fall back to the system `ping` for liveness.
    #[arg(long = "no-icmp", default_value_t = false)]
    no_icmp: bool,

    /// Serve the JSON API.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Address for the JSON API.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Run a single cycle, print the result and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// With --once, also write the summary as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Log verbosity. RUST_LOG overrides.
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

impl Cli {
    fn to_config(&self) -> Result<WatchConfig> {
        let vuln_table = match &self.vuln_table {
            Some(path) => load_vuln_table_from_path(path)?,
            None => VulnTable::default(),
        };
        Ok(WatchConfig {
            staleness: StalenessPolicy {
                interval: Duration::from_secs(self.interval_secs),
                window_cycles: self.stale_cycles,
                hold_on_empty_sweep: self.hold_on_empty_sweep,
            },
            history_capacity: self.history.max(1),
            ports: ports::resolve_ports_arg(self.ports.as_deref())?,
            vuln_table: Arc::new(vuln_table),
            probe: ProbeConfig {
                concurrency: self.concurrency,
                connect_timeout: Duration::from_millis(self.timeout_ms),
                host_timeout: Duration::from_millis(self.host_timeout_ms),
                use_icmp: !self.no_icmp,
                max_sweep_hosts: self.max_hosts,
            },
            fallback_range: fallback_range(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level)?;
    let config = cli.to_config()?;

    info!(
        range = %cli.range.map(|r| r.to_string()).unwrap_or_else(|| "<auto-detect>".into()),
        ports = ?config.ports,
        interval_secs = cli.interval_secs,
        stale_cycles = cli.stale_cycles,
        vuln_rules = config.vuln_table.len(),
        "iot-watch configuration"
    );

    match cli.range {
        Some(range) => run(&cli, config, FixedLocator(range)).await,
        None => {
            let locator = SystemLocator::new(config.fallback_range);
            run(&cli, config, locator).await
        }
    }
}

async fn run<L: Locator + 'static>(cli: &Cli, config: WatchConfig, locator: L) -> Result<()> {
    let (writer, reader) = Registry::new(
        config.staleness,
        config.history_capacity,
        config.vuln_table.clone(),
    );
    let prober = Arc::new(TcpProber::new(config.probe.clone(), &config.ports));
    let mut scheduler = Scheduler::new(locator, prober, writer, &config);

    if cli.once {
        if scheduler.tick().await.is_none() {
            bail!("scan cycle failed");
        }
        return report_once(&reader, cli.output.as_deref()).await;
    }

    let cancel = CancellationToken::new();
    let counters = scheduler.counters();
    let scan_task = tokio::spawn(scheduler.run(cancel.clone()));

    let server_task = if cli.serve {
        let state = AppState {
            registry: reader,
            counters,
        };
        let bind = cli.bind.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server::serve(&bind, state, cancel).await {
                error!(error = %format!("{e:#}"), "API server stopped");
            }
        }))
    } else {
        None
    };

    info!("running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    cancel.cancel();

    scan_task.await.context("scheduler task panicked")?;
    if let Some(task) = server_task {
        task.await.context("server task panicked")?;
    }
    Ok(())
}

async fn report_once(reader: &RegistryReader, output: Option<&Path>) -> Result<()> {
    let summary = summarize(&reader.snapshot().await);
    print_summary_table(&summary);
    if let Some(path) = output {
        write_summary_json(path, &summary)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON summary to {}", path.display());
    }
    Ok(())
}

fn print_summary_table(summary: &Summary) {
    let mut ip_w = "ip".len();
    let mut mac_w = "mac".len();
    let mut vendor_w = "vendor".len();
    let mut ports_w = "ports".len();
    let rows: Vec<(String, String)> = summary
        .devices
        .iter()
        .map(|d| {
            let ports = d
                .open_ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let ports = if ports.is_empty() { "-".to_string() } else { ports };
            let vulns = if d.vulns.is_empty() {
                "[OK] No risky ports detected".to_string()
            } else {
                d.vulns.join("; ")
            };
            (ports, vulns)
        })
        .collect();
    for (d, (ports, _)) in summary.devices.iter().zip(&rows) {
        ip_w = ip_w.max(d.ip.len());
        mac_w = mac_w.max(d.mac.len());
        vendor_w = vendor_w.max(d.vendor.len().min(30));
        ports_w = ports_w.max(ports.len());
    }

    println!(
        "\nNetwork: {}  total: {}  safe: {}  vulnerable: {}",
        summary.network, summary.total, summary.safe, summary.vulnerable
    );
    println!(
        "{:<ip_w$}  {:<mac_w$}  {:<vendor_w$}  {:<ports_w$}  findings",
        "ip", "mac", "vendor", "ports",
    );
    println!(
        "{:-<ip_w$}  {:-<mac_w$}  {:-<vendor_w$}  {:-<ports_w$}  --------",
        "", "", "", "",
    );
    for (d, (ports, vulns)) in summary.devices.iter().zip(&rows) {
        let mut vendor = d.vendor.clone();
        if vendor.len() > 30 {
            vendor = vendor.chars().take(30).collect();
        }
        println!(
            "{:<ip_w$}  {:<mac_w$}  {:<vendor_w$}  {:<ports_w$}  {}",
            d.ip, d.mac, vendor, ports, vulns,
        );
    }
}

fn write_summary_json(path: &Path, summary: &Summary) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
