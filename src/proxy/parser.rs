//! Proxy list normalization and de-duplication

use crate::proxy::models::{Candidate, ProxyEntry};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Hostname with at least one dot, e.g. `proxy.example.com`
static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+$").expect("Invalid hostname regex")
});

/// Proxy list parser for the classifier input
pub struct ProxyParser;

impl ProxyParser {
    /// Normalize a single list line
    ///
    /// - blank lines are dropped
    /// - 4-field authenticated lines become `user:pass@ip:port`
    /// - everything else passes through unchanged
    ///
    /// `user:pass:ip:port` is assumed unless only the leading pair looks like
    /// a host and a port, in which case the line is read as
    /// `ip:port:user:pass`. A `|protocol` suffix is kept.
    pub fn normalize_line(line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (body, hint) = match line.rsplit_once('|') {
            Some((body, hint)) => (body, Some(hint)),
            None => (line, None),
        };
        let parts: Vec<&str> = body.split(':').collect();
        if parts.len() != 4 {
            return Some(line.to_string());
        }

        let leading = is_host(parts[0]) && is_port(parts[1]);
        let trailing = is_host(parts[2]) && is_port(parts[3]);
        let mut normalized = if leading && !trailing {
            format!("{}:{}@{}:{}", parts[2], parts[3], parts[0], parts[1])
        } else {
            format!("{}:{}@{}:{}", parts[0], parts[1], parts[2], parts[3])
        };
        if let Some(hint) = hint {
            normalized.push('|');
            normalized.push_str(hint);
        }
        Some(normalized)
    }

    /// Parse, normalize and de-duplicate a newline-delimited list
    pub fn parse_string(content: &str) -> Vec<ProxyEntry> {
        dedup_lines(content.lines().filter_map(Self::normalize_line))
            .into_iter()
            .map(ProxyEntry::from_line)
            .collect()
    }

    /// Parse proxies from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<ProxyEntry>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content))
    }

    /// Save entries one per line
    pub fn save_to_file<P: AsRef<Path>>(entries: &[ProxyEntry], path: P) -> Result<()> {
        let mut content = entries
            .iter()
            .map(|e| e.line.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        fs::write(path, content)?;
        Ok(())
    }
}

/// Keep the first occurrence of every line
pub fn dedup_lines<I>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    lines
        .into_iter()
        .filter(|line| !line.is_empty() && seen.insert(line.clone()))
        .collect()
}

/// Keep the first occurrence of every `(ip, port)` pair
pub fn dedup_candidates<I>(candidates: I) -> Vec<Candidate>
where
    I: IntoIterator<Item = Candidate>,
{
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| !c.ip.is_empty() && seen.insert(c.clone()))
        .collect()
}

fn is_host(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok() || HOSTNAME_REGEX.is_match(s)
}

fn is_port(s: &str) -> bool {
    s.parse::<u16>().map_or(false, |p| p != 0)
}
