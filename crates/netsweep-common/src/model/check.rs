//! Discovery rules and service checks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::error::{NetsweepError, Result};

/// Unique identifier of a discovery rule.
pub type RuleId = u64;

/// Service check families supported by discovery rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Icmp,
    Agent,
    Tcp,
    Smtp,
    Ftp,
    Pop,
    Imap,
    Nntp,
    Http,
    Https,
    Ssh,
    Telnet,
    Ldap,
    SnmpV1,
    SnmpV2c,
    SnmpV3,
}

/// Timeout class a check resolves its global timeout from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Agent,
    Snmp,
    Simple,
}

impl CheckKind {
    /// Whether the check runs through the shared async batch driver.
    /// Only LDAP probes are executed as synchronous single checks.
    pub fn is_async(&self) -> bool {
        !matches!(self, CheckKind::Ldap)
    }

    pub fn is_snmpv3(&self) -> bool {
        matches!(self, CheckKind::SnmpV3)
    }

    pub fn is_snmp(&self) -> bool {
        matches!(self, CheckKind::SnmpV1 | CheckKind::SnmpV2c | CheckKind::SnmpV3)
    }

    /// ICMP checks ping addresses; they carry no port ranges.
    pub fn has_ports(&self) -> bool {
        !matches!(self, CheckKind::Icmp)
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            CheckKind::Agent => TimeoutClass::Agent,
            CheckKind::SnmpV1 | CheckKind::SnmpV2c | CheckKind::SnmpV3 => TimeoutClass::Snmp,
            _ => TimeoutClass::Simple,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::Icmp => "ICMP",
            CheckKind::Agent => "agent",
            CheckKind::Tcp => "TCP",
            CheckKind::Smtp => "SMTP",
            CheckKind::Ftp => "FTP",
            CheckKind::Pop => "POP",
            CheckKind::Imap => "IMAP",
            CheckKind::Nntp => "NNTP",
            CheckKind::Http => "HTTP",
            CheckKind::Https => "HTTPS",
            CheckKind::Ssh => "SSH",
            CheckKind::Telnet => "telnet",
            CheckKind::Ldap => "LDAP",
            CheckKind::SnmpV1 => "SNMPv1",
            CheckKind::SnmpV2c => "SNMPv2c",
            CheckKind::SnmpV3 => "SNMPv3",
        }
    }
}

/// Up/down state of a discovered service or host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Up,
    Down,
}

/// An inclusive port interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn len(&self) -> u64 {
        (self.to as u64) - (self.from as u64) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.from..=self.to
    }
}

/// Parses `"22,80-90,8080"` into port intervals.
pub fn parse_port_ranges(ports: &str) -> Result<Vec<PortRange>> {
    let mut ranges = Vec::new();
    for part in ports.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let range = match part.split_once('-') {
            Some((from, to)) => PortRange {
                from: from
                    .trim()
                    .parse()
                    .map_err(|_| NetsweepError::InvalidPortRange(part.to_string()))?,
                to: to
                    .trim()
                    .parse()
                    .map_err(|_| NetsweepError::InvalidPortRange(part.to_string()))?,
            },
            None => {
                let port: u16 = part
                    .parse()
                    .map_err(|_| NetsweepError::InvalidPortRange(part.to_string()))?;
                PortRange {
                    from: port,
                    to: port,
                }
            }
        };
        if range.to < range.from {
            return Err(NetsweepError::InvalidPortRange(part.to_string()));
        }
        ranges.push(range);
    }
    if ranges.is_empty() {
        return Err(NetsweepError::InvalidPortRange(ports.to_string()));
    }
    Ok(ranges)
}

/// One probe definition inside a discovery rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub check_id: u64,
    pub kind: CheckKind,
    /// Port range syntax, e.g. `"22,8000-8010"`. Ignored for ICMP.
    #[serde(default)]
    pub ports: String,
    /// Agent item key or SNMP OID, where applicable.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub snmp_community: String,
    /// Follow ICMP/HTTP redirects when the driver supports it.
    #[serde(default)]
    pub allow_redirect: bool,
    /// Marks the check whose results uniquely identify a device.
    #[serde(default)]
    pub unique: bool,
    /// Resolved by the scheduler from the global per-class timeouts.
    #[serde(skip, default = "default_check_timeout")]
    pub timeout: Duration,
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(3)
}

impl ServiceCheck {
    pub fn new(check_id: u64, kind: CheckKind, ports: &str) -> Self {
        Self {
            check_id,
            kind,
            ports: ports.to_string(),
            key: String::new(),
            snmp_community: String::new(),
            allow_redirect: false,
            unique: false,
            timeout: default_check_timeout(),
        }
    }

    /// Number of (ip, port) probes this check contributes per address.
    pub fn probes_per_ip(&self) -> Result<u64> {
        if !self.kind.has_ports() {
            return Ok(1);
        }
        Ok(parse_port_ranges(&self.ports)?
            .iter()
            .map(|r| r.len())
            .sum())
    }
}

/// A discovery rule: what address space to scan with which checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: RuleId,
    pub name: String,
    /// Update interval with time suffix (`"60s"`, `"1h"`); may contain a
    /// user macro resolved at scheduling time.
    pub delay: String,
    /// Comma-separated union of IP ranges.
    pub iprange: String,
    pub checks: Vec<ServiceCheck>,
    #[serde(default)]
    pub revision: u64,
    /// Maximum workers processing this rule concurrently; 0 = unlimited.
    #[serde(default)]
    pub concurrency_max: usize,
    /// Check id of the first check flagged unique; 0 when none.
    #[serde(skip)]
    pub unique_check_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_parsing() {
        let ranges = parse_port_ranges("22,80-90, 8080").unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], PortRange { from: 22, to: 22 });
        assert_eq!(ranges[1], PortRange { from: 80, to: 90 });
        assert_eq!(ranges[2], PortRange { from: 8080, to: 8080 });
    }

    #[test]
    fn test_port_range_rejects_garbage() {
        assert!(parse_port_ranges("80-22").is_err());
        assert!(parse_port_ranges("http").is_err());
        assert!(parse_port_ranges("").is_err());
    }

    #[test]
    fn test_only_ldap_is_synchronous() {
        assert!(!CheckKind::Ldap.is_async());
        for kind in [
            CheckKind::Icmp,
            CheckKind::Agent,
            CheckKind::Tcp,
            CheckKind::Http,
            CheckKind::SnmpV3,
        ] {
            assert!(kind.is_async());
        }
    }

    #[test]
    fn test_probes_per_ip_counts_ports() {
        let check = ServiceCheck::new(1, CheckKind::Tcp, "22,80-82");
        assert_eq!(check.probes_per_ip().unwrap(), 4);

        let icmp = ServiceCheck::new(2, CheckKind::Icmp, "");
        assert_eq!(icmp.probes_per_ip().unwrap(), 1);
    }

    #[test]
    fn test_timeout_classes() {
        assert_eq!(CheckKind::Agent.timeout_class(), TimeoutClass::Agent);
        assert_eq!(CheckKind::SnmpV2c.timeout_class(), TimeoutClass::Snmp);
        assert_eq!(CheckKind::Ftp.timeout_class(), TimeoutClass::Simple);
    }
}
