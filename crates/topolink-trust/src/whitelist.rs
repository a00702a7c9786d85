use ipnet::IpNet;
use regex::Regex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

/// Supplies a host name for a peer address, for wildcard entries.
pub trait PeerNameResolver: Send + Sync {
    fn peer_name(&self, addr: IpAddr) -> Option<String>;
}

/// No reverse lookups: wildcards only ever see the textual address.
pub struct NoPeerNames;

impl PeerNameResolver for NoPeerNames {
    fn peer_name(&self, _addr: IpAddr) -> Option<String> {
        None
    }
}

/// Fixed address-to-name table.
#[derive(Default)]
pub struct StaticPeerNames {
    names: HashMap<IpAddr, String>,
}

impl StaticPeerNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, addr: IpAddr, name: impl Into<String>) -> Self {
        self.names.insert(addr, name.into());
        self
    }
}

impl PeerNameResolver for StaticPeerNames {
    fn peer_name(&self, addr: IpAddr) -> Option<String> {
        self.names.get(&addr).cloned()
    }
}

struct ExactEntry {
    raw: String,
    addrs: Vec<IpAddr>,
}

/// Host/IP whitelist for inbound pings when HMAC is disabled.
///
/// Entries are classified once at construction:
/// - containing `/`: CIDR subnet (`10.0.0.0/8`)
/// - containing `*` or `?`: wildcard over host name or textual address
/// - otherwise: exact IP literal or host name (resolved forward here)
///
/// Lookup precedence is exact, then CIDR, then wildcard. First match wins,
/// and an address matching nothing is denied.
///
/// Construction does blocking DNS for host name entries; async callers
/// build it on the blocking pool.
pub struct Whitelist {
    exact: Vec<ExactEntry>,
    subnets: Vec<IpNet>,
    wildcards: Vec<Regex>,
}

impl Whitelist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut whitelist = Self {
            exact: Vec::new(),
            subnets: Vec::new(),
            wildcards: Vec::new(),
        };
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => whitelist.subnets.push(net),
                    Err(e) => tracing::warn!("Whitelist: ignoring invalid subnet {:?}: {}", entry, e),
                }
            } else if entry.contains('*') || entry.contains('?') {
                match wildcard_regex(entry) {
                    Ok(re) => whitelist.wildcards.push(re),
                    Err(e) => tracing::warn!("Whitelist: ignoring invalid pattern {:?}: {}", entry, e),
                }
            } else {
                whitelist.exact.push(ExactEntry {
                    raw: entry.to_ascii_lowercase(),
                    addrs: resolve(entry),
                });
            }
        }
        whitelist
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.subnets.is_empty() && self.wildcards.is_empty()
    }

    pub fn is_whitelisted(&self, addr: IpAddr, host: Option<&str>) -> bool {
        let addr = canonical(addr);
        let host = host.map(str::to_ascii_lowercase);

        let exact = self.exact.iter().any(|entry| {
            entry.addrs.contains(&addr) || host.as_deref() == Some(entry.raw.as_str())
        });
        if exact {
            return true;
        }
        if self.subnets.iter().any(|net| net.contains(&addr)) {
            return true;
        }
        let textual = addr.to_string();
        self.wildcards.iter().any(|re| {
            re.is_match(&textual) || host.as_deref().map_or(false, |h| re.is_match(h))
        })
    }
}

/// IPv4-mapped IPv6 peers are matched as their IPv4 address.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

fn resolve(entry: &str) -> Vec<IpAddr> {
    if let Ok(addr) = entry.parse::<IpAddr>() {
        return vec![canonical(addr)];
    }
    if entry.eq_ignore_ascii_case("localhost") {
        return vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)];
    }
    match (entry, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| canonical(a.ip())).collect(),
        Err(e) => {
            tracing::warn!("Whitelist: could not resolve {:?}: {}", entry, e);
            Vec::new()
        }
    }
}

fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}
