//! Hot-reloading IP allowlist.
//!
//! The allowed set lives behind an `ArcSwap`: checks read it lock-free,
//! a reload builds a fresh set and swaps the pointer. A poller watches
//! the allowlist file's modification time and reloads on change.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::AccessConfig;
use crate::error::EngineError;

/// Headers consulted for the client address, in priority order.
pub const CANDIDATE_HEADERS: [&str; 5] = [
    "X-Forwarded-For",
    "Proxy-Client-IP",
    "WL-Proxy-Client-IP",
    "HTTP_CLIENT_IP",
    "HTTP_X_FORWARDED_FOR",
];

/// Read-only view of request headers.
pub trait HeaderSource {
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderSource for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Snapshot
// ═══════════════════════════════════════════════════════════════

/// Immutable set of admitted addresses.
#[derive(Debug, Clone, Default)]
pub struct AllowedIpSnapshot {
    ips: HashSet<IpAddr>,
}

impl AllowedIpSnapshot {
    /// Build from textual entries. Blank entries are ignored; entries
    /// that are not IP literals are returned alongside.
    pub fn build<'a>(
        entries: impl IntoIterator<Item = &'a str>,
        allow_localhost: bool,
    ) -> (Self, Vec<String>) {
        let mut ips = HashSet::new();
        let mut rejected = Vec::new();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match parse_ip(entry) {
                Some(ip) => {
                    ips.insert(ip);
                }
                None => rejected.push(entry.to_string()),
            }
        }
        if allow_localhost {
            ips.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
            ips.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));
        }
        (Self { ips }, rejected)
    }

    pub fn loopback_only(allow_localhost: bool) -> Self {
        Self::build(std::iter::empty(), allow_localhost).0
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.ips.contains(&ip.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}

/// Parse an address as a client would send it: plain, bracketed, or
/// with a port. IPv4-mapped IPv6 collapses to IPv4.
fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
        .or_else(|| {
            raw.strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .and_then(|r| r.parse().ok())
        })
        .map(|ip: IpAddr| ip.to_canonical())
}

// ═══════════════════════════════════════════════════════════════
//  Allowlist file
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct TomlAllowlist {
    #[serde(default)]
    ips: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonAllowlist {
    List(Vec<String>),
    Doc { ips: Vec<String> },
}

fn parse_allowlist(path: &Path, content: &str) -> Result<Vec<String>, EngineError> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        let doc: JsonAllowlist =
            serde_json::from_str(content).map_err(|e| EngineError::Allowlist(e.to_string()))?;
        Ok(match doc {
            JsonAllowlist::List(ips) | JsonAllowlist::Doc { ips } => ips,
        })
    } else {
        let doc: TomlAllowlist =
            toml::from_str(content).map_err(|e| EngineError::Allowlist(e.to_string()))?;
        Ok(doc.ips)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Decision
// ═══════════════════════════════════════════════════════════════

/// Body returned to a denied client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenyPayload {
    pub code: i32,
    pub message: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(DenyPayload),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }

    fn deny(ip: &str) -> Self {
        AccessDecision::Deny(DenyPayload {
            code: 0,
            message: "illegal ip address".into(),
            data: format!("IP: {ip}"),
        })
    }
}

/// First usable address from the forwarding headers, else `remote`.
pub fn candidate_ip(headers: &(impl HeaderSource + ?Sized), remote: &str) -> String {
    CANDIDATE_HEADERS
        .iter()
        .filter_map(|name| headers.header(name))
        .filter_map(|value| {
            let first = value.split(',').next().unwrap_or_default().trim();
            (!first.is_empty() && !first.eq_ignore_ascii_case("unknown")).then_some(first)
        })
        .next()
        .unwrap_or(remote)
        .to_string()
}

// ═══════════════════════════════════════════════════════════════
//  AccessGuard
// ═══════════════════════════════════════════════════════════════

pub struct AccessGuard {
    enabled: bool,
    config_path: PathBuf,
    allow_localhost: bool,
    poll_interval: Duration,
    snapshot: ArcSwap<AllowedIpSnapshot>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl AccessGuard {
    /// Build the guard and load the allowlist once. A failed initial
    /// load leaves only the loopback entries in place.
    pub fn new(config: &AccessConfig) -> Self {
        let guard = Self {
            enabled: config.enabled,
            config_path: config.config_path.clone(),
            allow_localhost: config.allow_localhost,
            poll_interval: config.poll_interval(),
            snapshot: ArcSwap::from_pointee(AllowedIpSnapshot::loopback_only(
                config.allow_localhost,
            )),
            last_modified: Mutex::new(None),
        };
        if !guard.enabled {
            tracing::info!("access guard disabled, all addresses allowed");
            return guard;
        }

        *guard.last_modified.lock() = modified_time(&guard.config_path);
        if let Err(e) = guard.reload() {
            tracing::error!(
                path = %guard.config_path.display(),
                error = %e,
                "initial allowlist load failed, admitting loopback only"
            );
        }
        guard
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn snapshot(&self) -> Arc<AllowedIpSnapshot> {
        self.snapshot.load_full()
    }

    /// Re-read the allowlist file and swap in a new snapshot. On error
    /// the current snapshot stays.
    pub fn reload(&self) -> Result<usize, EngineError> {
        let content = fs::read_to_string(&self.config_path)
            .map_err(|e| EngineError::from(e).with_context(self.config_path.display()))?;
        let entries = parse_allowlist(&self.config_path, &content)
            .map_err(|e| e.with_context(self.config_path.display()))?;

        let (snapshot, rejected) =
            AllowedIpSnapshot::build(entries.iter().map(String::as_str), self.allow_localhost);
        for entry in &rejected {
            tracing::warn!(entry = %entry, "ignoring allowlist entry that is not an IP address");
        }
        let count = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));
        tracing::info!(path = %self.config_path.display(), count, "allowlist loaded");
        Ok(count)
    }

    /// Reload if the file's modification time moved. Returns true when a
    /// new snapshot was installed.
    pub fn poll_once(&self) -> bool {
        let modified = modified_time(&self.config_path);
        let mut last = self.last_modified.lock();
        if modified == *last {
            return false;
        }
        *last = modified;
        if modified.is_none() {
            tracing::warn!(
                path = %self.config_path.display(),
                "allowlist file disappeared, keeping current entries"
            );
            return false;
        }
        match self.reload() {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, "allowlist reload failed, keeping current entries");
                false
            }
        }
    }

    /// Poll the allowlist file until `shutdown` fires. No-op when disabled.
    pub async fn run_poller(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.enabled {
            return;
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and the file was just loaded.
        ticker.tick().await;

        tracing::info!(
            path = %self.config_path.display(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "allowlist poller started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once();
                }
            }
        }
        tracing::debug!("allowlist poller stopped");
    }

    /// Decide whether a request may proceed. Pure over the current snapshot.
    pub fn check_ip(&self, headers: &(impl HeaderSource + ?Sized), remote: &str) -> AccessDecision {
        if !self.enabled {
            return AccessDecision::Allow;
        }
        let candidate = candidate_ip(headers, remote);
        let allowed = parse_ip(&candidate).is_some_and(|ip| self.snapshot.load().contains(&ip));
        if allowed {
            AccessDecision::Allow
        } else {
            tracing::warn!(ip = %candidate, "request from address not on the allowlist");
            AccessDecision::deny(&candidate)
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
