use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Ports probed on every live host when nothing else is configured.
pub const DEFAULT_PORTS: &[u16] = &[21, 22, 23, 80, 443, 554, 8080];

/// Parse a candidate port list into deduplicated TCP ports (1..=65535),
/// keeping first-seen order.
///
/// Entries are separated by commas, whitespace or newlines. An entry is a
/// single port (`80`) or an inclusive range (`8000-8010`). Everything after
/// `#` on a line is a comment.
pub fn parse_port_list(s: &str) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");
        for token in line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let (start, end) = match token.split_once('-') {
                Some((a, b)) => (
                    parse_port(a).with_context(|| format!("line {line_no}: bad range start in {token}"))?,
                    parse_port(b).with_context(|| format!("line {line_no}: bad range end in {token}"))?,
                ),
                None => {
                    let p = parse_port(token)
                        .with_context(|| format!("line {line_no}: invalid port value: {token}"))?;
                    (p, p)
                }
            };
            if start > end {
                bail!("line {line_no}: invalid range {start}-{end} (start > end)");
            }
            out.extend((start..=end).filter(|p| seen.insert(*p)));
        }
    }

    Ok(out)
}

/// Load a port list from a file.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_port_list(&content)
}

/// Resolve a `--ports` argument: `@path` reads a file, anything else is an
/// inline list. An empty result falls back to [`DEFAULT_PORTS`].
pub fn resolve_ports_arg(arg: Option<&str>) -> Result<Vec<u16>> {
    let ports = match arg {
        None => Vec::new(),
        Some(a) => match a.strip_prefix('@') {
            Some(path) => load_ports_from_path(path)?,
            None => parse_port_list(a)?,
        },
    };
    if ports.is_empty() {
        return Ok(DEFAULT_PORTS.to_vec());
    }
    Ok(ports)
}

fn parse_port(s: &str) -> Result<u16> {
    let val: u32 = s.trim().parse()?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inline_list() {
        let ports = parse_port_list("21,22, 80 8080").unwrap();
        assert_eq!(ports, vec![21, 22, 80, 8080]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_list("8000-8002,80,8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn out_of_range_and_reversed_rejected() {
        assert!(parse_port_list("70000").is_err());
        assert!(parse_port_list("90-80").is_err());
    }

    #[test]
    fn missing_arg_uses_defaults() {
        assert_eq!(resolve_ports_arg(None).unwrap(), DEFAULT_PORTS.to_vec());
        assert_eq!(resolve_ports_arg(Some("  # nothing")).unwrap(), DEFAULT_PORTS.to_vec());
    }
}
