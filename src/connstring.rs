//! Connection string parsing:
//!
//! `scheme://host[:port][=mode][,host[:port][=mode]]*[/bucket][?key=value&...]`

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

/// Bootstrap mode requested by a `=mode` host suffix or inferred from scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    Cccp,
    Gcccp,
    Mcd,
    Http,
}

impl fmt::Display for BootstrapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapMode::Cccp => "cccp",
            BootstrapMode::Gcccp => "gcccp",
            BootstrapMode::Mcd => "mcd",
            BootstrapMode::Http => "http",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Couchbase,
    Couchbases,
    Http,
    Https,
}

impl Scheme {
    fn default_kv_port(self) -> u16 {
        match self {
            Scheme::Couchbase => 11210,
            Scheme::Couchbases => 11207,
            Scheme::Http => 8091,
            Scheme::Https => 18091,
        }
    }

    fn is_tls(self) -> bool {
        matches!(self, Scheme::Couchbases | Scheme::Https)
    }

    fn default_bootstrap_mode(self) -> BootstrapMode {
        match self {
            Scheme::Couchbase | Scheme::Couchbases => BootstrapMode::Gcccp,
            Scheme::Http | Scheme::Https => BootstrapMode::Http,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Scheme::Couchbase => "couchbase",
            Scheme::Couchbases => "couchbases",
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A single bootstrap host, honoring the per-host `=mode` suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub host_name: String,
    pub port: Option<u16>,
    pub mode: Option<BootstrapMode>,
}

/// Parsed, immutable connection-string options. Durations accept either
/// integer milliseconds or Go-style strings (`1500ms`, `2s`, `1m30s`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    raw: BTreeMap<String, String>,
}

impl ConnectionOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(|s| s.as_str())
    }

    pub fn duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.raw.get(key) {
            Some(v) => Ok(Some(parse_duration(v)?)),
            None => Ok(None),
        }
    }

    pub fn bool_flag(&self, key: &str) -> Result<Option<bool>> {
        match self.raw.get(key) {
            Some(v) => match v.as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                other => Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("invalid boolean value for '{key}': '{other}'"),
                )),
            },
            None => Ok(None),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub scheme: Scheme,
    pub tls: bool,
    pub mode: BootstrapMode,
    pub hosts: Vec<Host>,
    pub bucket: Option<String>,
    pub options: ConnectionOptions,
    /// True when a single DNS-name host was given with no explicit port,
    /// enabling DNS-SRV bootstrap.
    pub dns_srv_eligible: bool,
    pub warnings: Vec<String>,
}

/// Parses a duration value: an integer (milliseconds) or a Go-style string
/// such as `1500ms`, `2s`, `1m30s`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut saw_unit = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            i += 1;
            continue;
        }
        // unit: "ms", "s", "m", "h"
        let (unit_len, multiplier_ms): (usize, f64) = if s[i..].starts_with("ms") {
            (2, 1.0)
        } else if s[i..].starts_with('s') {
            (1, 1000.0)
        } else if s[i..].starts_with('m') {
            (1, 60_000.0)
        } else if s[i..].starts_with('h') {
            (1, 3_600_000.0)
        } else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid duration '{s}'"),
            ));
        };
        if num.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid duration '{s}'"),
            ));
        }
        let value: f64 = num.parse().map_err(|_| {
            Error::new(ErrorKind::InvalidArgument, format!("invalid duration '{s}'"))
        })?;
        total += Duration::from_millis((value * multiplier_ms) as u64);
        num.clear();
        saw_unit = true;
        i += unit_len;
    }
    if !num.is_empty() || !saw_unit {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("invalid duration '{s}'"),
        ));
    }
    Ok(total)
}

/// Parses a connection string against the grammar at the top of this module.
pub fn parse(input: &str) -> Result<ConnectionString> {
    if input.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArgument, "empty connection string"));
    }

    let (scheme_str, rest) = input
        .split_once("://")
        .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "missing scheme separator '://'"))?;

    let scheme = match scheme_str {
        "couchbase" => Scheme::Couchbase,
        "couchbases" => Scheme::Couchbases,
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("unrecognized scheme '{other}'"),
            ))
        }
    };

    // Split off the optional query string first so commas/colons inside
    // option values never get mistaken for host separators.
    let (hosts_and_bucket, query) = match rest.split_once('?') {
        Some((a, b)) => (a, Some(b)),
        None => (rest, None),
    };

    let (hosts_part, bucket) = match hosts_and_bucket.split_once('/') {
        Some((a, b)) if !b.is_empty() => (a, Some(b.to_string())),
        Some((a, _)) => (a, None),
        None => (hosts_and_bucket, None),
    };

    if hosts_part.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArgument, "missing host list"));
    }

    let mut hosts = Vec::new();
    for host_spec in hosts_part.split(',') {
        hosts.push(parse_host(host_spec)?);
    }

    let mut options = BTreeMap::new();
    if let Some(q) = query {
        for pair in q.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, format!("malformed query parameter '{pair}'")))?;
            options.insert(k.to_string(), v.to_string());
        }
    }

    let mut warnings = Vec::new();

    let requested_srv = options
        .get("enable_dns_srv")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let single_dns_host = hosts.len() == 1
        && hosts[0].port.is_none()
        && hosts[0].mode.is_none()
        && hosts[0].host_name.parse::<std::net::IpAddr>().is_err();

    let dns_srv_eligible = if requested_srv && hosts.len() > 1 {
        warnings.push(
            "enable_dns_srv=true with more than one host is not supported; disabling DNS-SRV"
                .to_string(),
        );
        false
    } else {
        requested_srv || single_dns_host
    };

    let mode = hosts
        .first()
        .and_then(|h| h.mode)
        .unwrap_or_else(|| scheme.default_bootstrap_mode());

    Ok(ConnectionString {
        scheme,
        tls: scheme.is_tls(),
        mode,
        hosts,
        bucket,
        options: ConnectionOptions { raw: options },
        dns_srv_eligible,
        warnings,
    })
}

fn parse_host(spec: &str) -> Result<Host> {
    // `=mode` suffix, if present, is stripped first.
    let (addr_part, mode) = match spec.rsplit_once('=') {
        Some((addr, mode_str)) if !addr.is_empty() => {
            let mode = match mode_str {
                "cccp" => BootstrapMode::Cccp,
                "gcccp" => BootstrapMode::Gcccp,
                "mcd" => BootstrapMode::Mcd,
                "http" => BootstrapMode::Http,
                other => {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        format!("unrecognized bootstrap mode '{other}'"),
                    ))
                }
            };
            (addr, Some(mode))
        }
        _ => (spec, None),
    };

    // Bracketed IPv6 literal: `[::1]:8091` or bare `[::1]`.
    if let Some(rest) = addr_part.strip_prefix('[') {
        let (host6, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, format!("unterminated IPv6 literal '{addr_part}'")))?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>().map_err(|_| {
                Error::new(ErrorKind::InvalidArgument, format!("invalid port in '{addr_part}'"))
            })?),
            None => None,
        };
        return Ok(Host {
            host_name: format!("[{host6}]"),
            port,
            mode,
        });
    }

    match addr_part.split_once(':') {
        Some((h, p)) => {
            let port = p
                .parse::<u16>()
                .map_err(|_| Error::new(ErrorKind::InvalidArgument, format!("invalid port in '{addr_part}'")))?;
            Ok(Host {
                host_name: h.to_string(),
                port: Some(port),
                mode,
            })
        }
        None => Ok(Host {
            host_name: addr_part.to_string(),
            port: None,
            mode,
        }),
    }
}

impl fmt::Display for ConnectionString {
    /// Canonicalizes back to the connection-string grammar;
    /// `parse(to_string(x))` is a fixed point for canonical inputs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme.as_str())?;
        for (i, host) in self.hosts.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", host.host_name)?;
            if let Some(port) = host.port {
                write!(f, ":{port}")?;
            }
            if let Some(mode) = host.mode {
                write!(f, "={mode}")?;
            }
        }
        if let Some(bucket) = &self.bucket {
            write!(f, "/{bucket}")?;
        }
        if !self.options.raw.is_empty() {
            write!(f, "?")?;
            for (i, (k, v)) in self.options.raw.iter().enumerate() {
                if i > 0 {
                    write!(f, "&")?;
                }
                write!(f, "{k}={v}")?;
            }
        }
        Ok(())
    }
}

impl ConnectionString {
    pub fn default_kv_port(&self) -> u16 {
        self.scheme.default_kv_port()
    }

    /// Effective hostname to bootstrap from, honoring DNS-SRV eligibility.
    pub fn bootstrap_host(&self) -> &Host {
        &self.hosts[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tls_host_with_query_options() {
        let parsed = parse("couchbases://db.example.com?kv_timeout=3s&tls_verify=none").unwrap();
        assert_eq!(parsed.scheme, Scheme::Couchbases);
        assert!(parsed.tls);
        assert_eq!(parsed.default_kv_port(), 11207);
        assert_eq!(parsed.mode, BootstrapMode::Gcccp);
        assert_eq!(parsed.hosts.len(), 1);
        assert_eq!(parsed.hosts[0].host_name, "db.example.com");
        assert_eq!(
            parsed.options.duration("kv_timeout").unwrap(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(parsed.options.get("tls_verify"), Some("none"));
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn empty_string_is_parse_error() {
        let err = parse("").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn dns_srv_with_multiple_hosts_warns_and_disables() {
        let parsed = parse("couchbase://a.example.com,b.example.com?enable_dns_srv=true").unwrap();
        assert!(!parsed.dns_srv_eligible);
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn single_dns_name_enables_srv_eligibility() {
        let parsed = parse("couchbase://db.example.com").unwrap();
        assert!(parsed.dns_srv_eligible);
    }

    #[test]
    fn ipv6_host_with_port() {
        let parsed = parse("couchbase://[::1]:11210").unwrap();
        assert_eq!(parsed.hosts[0].host_name, "[::1]");
        assert_eq!(parsed.hosts[0].port, Some(11210));
    }

    #[test]
    fn duration_parsing_variants() {
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(
            parse_duration("1m30s").unwrap(),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn roundtrip_is_a_fixed_point_on_canonical_form() {
        let parsed = parse("couchbase://a.example.com:11210=gcccp/my_bucket?kv_timeout=3000").unwrap();
        let printed = parsed.to_string();
        let reparsed = parse(&printed).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn host_mode_suffix_override() {
        let parsed = parse("couchbase://a.example.com=mcd").unwrap();
        assert_eq!(parsed.hosts[0].mode, Some(BootstrapMode::Mcd));
    }
}
