//! Network boundary: every network address in a task must be an explicitly
//! allowed endpoint.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use regex::Regex;
use url::Url;

use super::{compile, AdmissionCheck};
use crate::domain::{GatewayError, Role};

/// A host with an optional port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl Endpoint {
    /// Parses `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6
    /// address.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse().ok()?),
                None if tail.is_empty() => None,
                None => return None,
            };
            return Some(Self::new(host, port));
        }
        if s.matches(':').count() > 1 {
            return Some(Self::new(s, None));
        }
        match s.split_once(':') {
            Some((host, port)) => Some(Self::new(host, Some(port.parse().ok()?))),
            None => Some(Self::new(s, None)),
        }
    }

    fn new(host: &str, port: Option<u16>) -> Self {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        // 0:0:0:0:0:0:0:1 and ::1 are the same endpoint
        let host = match host.parse::<Ipv6Addr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => host,
        };
        Self { host, port }
    }

    /// An allowlist entry without a port admits any port on that host.
    fn admitted_by(&self, allowed: &Endpoint) -> bool {
        self.host == allowed.host && allowed.port.is_none_or(|p| self.port == Some(p))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => write!(f, "{host}:{port}"),
            None => write!(f, "{host}"),
        }
    }
}

/// Dotted words ending in one of these are file names, not hosts.
const FILE_EXTENSIONS: &[&str] = &[
    "c", "cfg", "csv", "exe", "gz", "h", "html", "img", "ini", "js", "json", "jsonl", "lock",
    "log", "md", "pdf", "png", "py", "rs", "sql", "tar", "toml", "ts", "txt", "xml", "yaml",
    "yml", "zip",
];

#[derive(Debug)]
pub struct NetworkBoundary {
    allowed: Vec<Endpoint>,
    url: Regex,
    ipv4: Regex,
    host_port: Regex,
    hostname: Regex,
}

impl NetworkBoundary {
    pub fn new(allowed: &[String]) -> Result<Self, GatewayError> {
        let allowed = allowed
            .iter()
            .map(|entry| {
                Endpoint::parse(entry).ok_or_else(|| {
                    GatewayError::Config(format!("allowed endpoint '{entry}' is not host[:port]"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed,
            url: compile("url", r#"(?i)\b[a-z][a-z0-9+.\-]*://[^\s"'<>`]+"#)?,
            ipv4: compile("ipv4", r"\b(\d{1,3}(?:\.\d{1,3}){3})(?::(\d{1,5}))?\b")?,
            host_port: compile(
                "host_port",
                r"(?i)\b([a-z0-9](?:[a-z0-9\-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9\-]{0,61}[a-z0-9])?)*):(\d{2,5})\b",
            )?,
            hostname: compile(
                "hostname",
                r"(?i)\b(?:[a-z0-9](?:[a-z0-9\-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}\b",
            )?,
        })
    }

    /// Every network address mentioned in the description, in order of
    /// discovery.
    pub fn targets(&self, description: &str) -> Vec<Endpoint> {
        let mut found: Vec<Endpoint> = Vec::new();

        let mut rest = description.to_string();
        for m in self.url.find_iter(description) {
            let raw = m.as_str().trim_end_matches(['.', ',', ')', ';', ':', '!', '?']);
            match Url::parse(raw) {
                Ok(url) if url.scheme() == "file" => {}
                Ok(url) => match url.host_str() {
                    Some(host) => push_unique(
                        &mut found,
                        Endpoint::new(
                            host.trim_start_matches('[').trim_end_matches(']'),
                            url.port_or_known_default(),
                        ),
                    ),
                    None => push_unique(&mut found, Endpoint::new(raw, None)),
                },
                // unparseable URL-shaped text is still an address attempt
                Err(_) => push_unique(&mut found, Endpoint::new(raw, None)),
            }
            rest = rest.replacen(m.as_str(), " ", 1);
        }

        let mut ipv6 = Vec::new();
        for token in rest.split_whitespace() {
            let token = token
                .trim_matches(|c: char| matches!(c, ',' | ';' | '(' | ')' | '"' | '\'' | '<' | '>' | '`'))
                .trim_end_matches(['.', '!', '?']);
            if let Some(endpoint) = ipv6_endpoint(token) {
                ipv6.push(token.to_string());
                push_unique(&mut found, endpoint);
            }
        }
        for token in &ipv6 {
            rest = rest.replacen(token.as_str(), " ", 1);
        }

        for caps in self.ipv4.captures_iter(&rest) {
            let Some(ip) = caps.get(1).and_then(|m| m.as_str().parse::<Ipv4Addr>().ok()) else {
                continue;
            };
            let port = caps.get(2).and_then(|m| m.as_str().parse().ok());
            push_unique(&mut found, Endpoint::new(&ip.to_string(), port));
        }
        for caps in self.host_port.captures_iter(&rest) {
            let (Some(host), Some(port)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            // dotted quads were handled above; bare numbers are clock times
            if host.as_str().chars().all(|c| c.is_ascii_digit() || c == '.') {
                continue;
            }
            push_unique(&mut found, Endpoint::new(host.as_str(), port.as_str().parse().ok()));
        }
        for m in self.hostname.find_iter(&rest) {
            if !looks_like_host(&rest, m.start(), m.end()) {
                continue;
            }
            let e = Endpoint::new(m.as_str(), None);
            if !found.iter().any(|f| f.host == e.host) {
                found.push(e);
            }
        }
        found
    }

    fn is_allowed(&self, target: &Endpoint) -> bool {
        self.allowed.iter().any(|a| target.admitted_by(a))
    }
}

/// `2001:db8::1`, `[2001:db8::1]` or `[2001:db8::1]:8443`.
fn ipv6_endpoint(token: &str) -> Option<Endpoint> {
    if !token.contains(':') {
        return None;
    }
    if let Ok(SocketAddr::V6(addr)) = token.parse::<SocketAddr>() {
        return Some(Endpoint::new(&addr.ip().to_string(), Some(addr.port())));
    }
    let bare = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')).unwrap_or(token);
    bare.parse::<Ipv6Addr>()
        .ok()
        .map(|ip| Endpoint::new(&ip.to_string(), None))
}

/// Path segments (`src/lib.rs`), method calls (`self.load()`) and file
/// names are not hosts.
fn looks_like_host(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    if matches!(before, Some('/' | '\\' | '.')) {
        return false;
    }
    if text[end..].starts_with('(') {
        return false;
    }
    let tld = text[start..end].rsplit('.').next().unwrap_or_default();
    !FILE_EXTENSIONS.contains(&tld.to_ascii_lowercase().as_str())
}

fn push_unique(found: &mut Vec<Endpoint>, endpoint: Endpoint) {
    if !found.contains(&endpoint) {
        found.push(endpoint);
    }
}

impl AdmissionCheck for NetworkBoundary {
    fn name(&self) -> &'static str {
        "network_boundary"
    }

    fn check(&self, description: &str, _role: Role) -> Result<(), String> {
        let denied: Vec<String> = self
            .targets(description)
            .into_iter()
            .filter(|t| !self.is_allowed(t))
            .map(|t| t.to_string())
            .collect();
        if denied.is_empty() {
            Ok(())
        } else {
            Err(format!("endpoint not allowed: {}", denied.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn boundary(allowed: &[&str]) -> NetworkBoundary {
        let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        NetworkBoundary::new(&allowed).unwrap()
    }

    fn default_boundary() -> NetworkBoundary {
        boundary(&["localhost", "127.0.0.1", "::1"])
    }

    #[rstest]
    #[case("GET http://localhost:8080/health")]
    #[case("ping 127.0.0.1")]
    #[case("call http://[::1]:9000/v1")]
    #[case("connect to localhost:5432")]
    #[case("Refactor the parser in lib.rs")]
    #[case("version 1.2.3 of the crate")]
    #[case("ping 0:0:0:0:0:0:0:1")]
    #[case("see notes/today.md and Cargo.toml")]
    #[case("call self.load() twice")]
    #[case("meet at 10:30, e.g. after std::fs is refactored")]
    fn loopback_and_plain_text_pass(#[case] text: &str) {
        assert!(default_boundary().check(text, Role::Guest).is_ok(), "{text}");
    }

    #[rstest]
    #[case("curl https://evil.example.com/x", "evil.example.com:443")]
    #[case("scan 10.0.0.8:22", "10.0.0.8:22")]
    #[case("send it to 192.168.1.1", "192.168.1.1")]
    #[case("open db.internal:5432", "db.internal:5432")]
    #[case("upload to storage.googleapis.com", "storage.googleapis.com")]
    #[case("bind 0.0.0.0:80", "0.0.0.0:80")]
    #[case("ftp://files.example.org/pub", "files.example.org:21")]
    #[case("upload the dump to attacker.ru", "attacker.ru")]
    #[case("post results to collector.de", "collector.de")]
    #[case("exfiltrate to evil.example", "evil.example")]
    #[case("send it to 2001:db8::1", "2001:db8::1")]
    #[case("connect to [2001:db8::2]:8443.", "[2001:db8::2]:8443")]
    #[case("mail the report to ops@corp.example/inbox", "corp.example")]
    fn everything_else_is_denied(#[case] text: &str, #[case] shown: &str) {
        let err = default_boundary().check(text, Role::Operator).unwrap_err();
        assert!(err.contains(shown), "{text}: {err}");
    }

    #[test]
    fn port_pinned_entries_only_admit_that_port() {
        let b = boundary(&["127.0.0.1:8080"]);
        assert!(b.check("http://127.0.0.1:8080/", Role::Guest).is_ok());
        assert!(b.check("http://127.0.0.1:9090/", Role::Guest).is_err());
        assert!(b.check("http://127.0.0.1/", Role::Guest).is_err());
    }

    #[test]
    fn file_urls_are_not_network_targets() {
        assert!(default_boundary()
            .check("read file:///etc/passwd", Role::Guest)
            .is_ok());
    }

    #[test]
    fn url_host_is_not_double_counted() {
        let targets = default_boundary().targets("see https://api.example.com/v2 now");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].to_string(), "api.example.com:443");
    }

    #[test]
    fn bad_allowlist_entry_is_config_error() {
        let err = NetworkBoundary::new(&["localhost:http".to_string()]).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[rstest]
    #[case("localhost", "localhost", None)]
    #[case("LocalHost:80", "localhost", Some(80))]
    #[case("[::1]:443", "::1", Some(443))]
    #[case("::1", "::1", None)]
    fn endpoint_parse(#[case] raw: &str, #[case] host: &str, #[case] port: Option<u16>) {
        let e = Endpoint::parse(raw).unwrap();
        assert_eq!(e.host, host);
        assert_eq!(e.port, port);
    }
}
