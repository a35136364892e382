use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

/// Severity of an advisory. Ordered from least to most severe.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(anyhow!("unknown severity: {other}")),
        }
    }
}

/// An advisory attached to a device because one of its ports is open.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub port: u16,
    pub severity: Severity,
    pub text: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.text)
    }
}

/// Static port -> advisory lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulnTable {
    entries: BTreeMap<u16, (Severity, String)>,
}

impl VulnTable {
    pub fn new(entries: impl IntoIterator<Item = (u16, Severity, String)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(port, sev, text)| (port, (sev, text)))
                .collect(),
        }
    }

    /// Look up a single port. Ports outside the table yield `None`.
    pub fn classify(&self, port: u16) -> Option<Finding> {
        self.entries.get(&port).map(|(severity, text)| Finding {
            port,
            severity: *severity,
            text: text.clone(),
        })
    }

    /// Findings for a whole port set, in port order.
    pub fn findings_for(&self, ports: &BTreeSet<u16>) -> Vec<Finding> {
        ports.iter().filter_map(|&p| self.classify(p)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for VulnTable {
    fn default() -> Self {
        const DEFAULT: &[(u16, Severity, &str)] = &[
            (21, Severity::High, "FTP (21): plaintext auth; disable or enforce TLS."),
            (22, Severity::Info, "SSH (22): strong password/keys recommended."),
            (23, Severity::Critical, "Telnet (23): unencrypted; disable immediately."),
            (80, Severity::Medium, "HTTP (80): no TLS; prefer HTTPS."),
            (443, Severity::Info, "HTTPS (443): verify cert/TLS settings."),
            (554, Severity::Medium, "RTSP (554): ensure stream auth/firmware updated."),
            (8080, Severity::Medium, "Alt HTTP (8080): often admin UI; require auth."),
        ];
        Self::new(DEFAULT.iter().map(|&(p, s, t)| (p, s, t.to_string())))
    }
}

/// Parse a vulnerability table.
///
/// One entry per line: `PORT SEVERITY advisory text`. A `#` at the start of
/// a line or after whitespace begins a comment, so `#` inside a word (`C#`,
/// `issue#12`) stays part of the advisory. Blank lines are ignored. A later
/// line for the same port replaces the earlier one.
pub fn parse_vuln_table_str(s: &str) -> Result<VulnTable> {
    let mut entries = BTreeMap::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let (port, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let port: u16 = match port.parse() {
            Ok(p) if p > 0 => p,
            _ => bail!("line {line_no}: invalid port: {port}"),
        };
        let rest = rest.trim_start();
        if rest.is_empty() {
            bail!("line {line_no}: missing severity for port {port}");
        }
        let (severity, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let severity: Severity = severity
            .parse()
            .with_context(|| format!("line {line_no}: bad severity"))?;
        let text = text.trim();
        if text.is_empty() {
            bail!("line {line_no}: missing advisory text for port {port}");
        }
        entries.insert(port, (severity, text.to_string()));
    }
    Ok(VulnTable { entries })
}

fn strip_comment(line: &str) -> &str {
    let mut prev_ws = true;
    for (i, c) in line.char_indices() {
        if c == '#' && prev_ws {
            return &line[..i];
        }
        prev_ws = c.is_whitespace();
    }
    line
}

/// Load a vulnerability table from a file.
pub fn load_vuln_table_from_path(path: impl AsRef<Path>) -> Result<VulnTable> {
    let content = fs::read_to_string(path.as_ref()).with_context(|| {
        format!("failed to read vulnerability table: {}", path.as_ref().display())
    })?;
    parse_vuln_table_str(&content)
}
