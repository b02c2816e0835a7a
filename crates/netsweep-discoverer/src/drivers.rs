//! Built-in probe drivers.
//!
//! Real deployments wire the checker seams to full protocol backends; the
//! built-ins cover what a bare host can do: TCP connect probes for the
//! TCP-family checks and HTTP(S) reachability, and batched ICMP through an
//! `fping` subprocess. SNMP and agent probes have no built-in backend and
//! report down until a driver is injected.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, trace};

use netsweep_common::model::{CheckKind, ServiceCheck};

use crate::checks::{DnsResolver, Drivers, PingDriver, ProbeDriver, ProbeOutcome};
use crate::config::DiscovererConfig;

/// TCP connect probe for the connection-oriented check kinds.
pub struct TcpProbeDriver;

#[async_trait]
impl ProbeDriver for TcpProbeDriver {
    async fn probe(&self, check: &ServiceCheck, ip: IpAddr, port: u16) -> ProbeOutcome {
        match check.kind {
            CheckKind::Tcp
            | CheckKind::Smtp
            | CheckKind::Ftp
            | CheckKind::Pop
            | CheckKind::Imap
            | CheckKind::Nntp
            | CheckKind::Http
            | CheckKind::Https
            | CheckKind::Ssh
            | CheckKind::Telnet
            | CheckKind::Ldap => {
                match tokio::time::timeout(check.timeout, TcpStream::connect((ip, port))).await {
                    Ok(Ok(_stream)) => ProbeOutcome::Up(String::new()),
                    Ok(Err(e)) => {
                        trace!("{} {}:{} refused: {}", check.kind.name(), ip, port, e);
                        ProbeOutcome::Down
                    }
                    Err(_) => {
                        trace!("{} {}:{} timed out", check.kind.name(), ip, port);
                        ProbeOutcome::Down
                    }
                }
            }
            CheckKind::Agent | CheckKind::SnmpV1 | CheckKind::SnmpV2c | CheckKind::SnmpV3 => {
                trace!("no built-in backend for {} checks", check.kind.name());
                ProbeOutcome::Down
            }
            CheckKind::Icmp => ProbeOutcome::Down,
        }
    }
}

/// Batched ICMP via an `fping` subprocess (`-a` prints alive targets).
pub struct FpingDriver {
    fping_path: PathBuf,
    source_ip: Option<String>,
}

impl FpingDriver {
    pub fn new(fping_path: impl Into<PathBuf>, source_ip: Option<String>) -> Self {
        Self {
            fping_path: fping_path.into(),
            source_ip,
        }
    }
}

#[async_trait]
impl PingDriver for FpingDriver {
    async fn ping(
        &self,
        hosts: &[IpAddr],
        _allow_redirect: bool,
    ) -> std::result::Result<Vec<bool>, String> {
        let mut cmd = Command::new(&self.fping_path);
        cmd.arg("-a").arg("-q");
        if let Some(source_ip) = &self.source_ip {
            cmd.arg("-S").arg(source_ip);
        }
        for host in hosts {
            cmd.arg(host.to_string());
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("cannot execute {}: {}", self.fping_path.display(), e))?;

        // exit code 1 just means some targets were unreachable
        if let Some(code) = output.status.code() {
            if code > 1 {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(format!("fping failed: {}", stderr.trim()));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let alive: std::collections::HashSet<IpAddr> = stdout
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        debug!("fping: {}/{} targets alive", alive.len(), hosts.len());

        Ok(hosts.iter().map(|h| alive.contains(h)).collect())
    }
}

/// DNS backend that never resolves; hosts are recorded by address only.
pub struct NoopDnsResolver;

#[async_trait]
impl DnsResolver for NoopDnsResolver {
    async fn reverse(&self, _ip: IpAddr) -> String {
        String::new()
    }
}

/// The driver set available without any injected protocol backends.
pub fn builtin_drivers(config: &DiscovererConfig) -> Drivers {
    Drivers {
        probe: std::sync::Arc::new(TcpProbeDriver),
        ping: std::sync::Arc::new(FpingDriver::new(
            config.fping_path.clone(),
            config.source_ip.clone(),
        )),
        dns: std::sync::Arc::new(NoopDnsResolver),
    }
}
