//! Typed IPC messages for the discoverer and proxy-group endpoints.
//!
//! Each message maps 1:1 to a wire code; payloads follow the codec rules in
//! [`crate::protocol::wire`]. The discoverer and proxy-group manager listen
//! on separate sockets, so their code spaces are independent.

use crate::protocol::error::{NetsweepError, Result};
use crate::protocol::wire::{WireReader, WireWriter};

/// Requests understood by the discoverer endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscovererRequest {
    /// Query the number of pending checks on the queue.
    Queue,
    /// Query per-worker busy fractions.
    UsageStats,
    /// Drop cached SNMP engine state (notification, no reply).
    SnmpCacheReload,
    /// Stop the service (notification, no reply).
    Shutdown,
}

impl DiscovererRequest {
    pub const QUEUE: u32 = 1;
    pub const USAGE_STATS: u32 = 2;
    pub const SNMP_CACHE_RELOAD: u32 = 3;
    pub const SHUTDOWN: u32 = 4;

    pub fn code(&self) -> u32 {
        match self {
            DiscovererRequest::Queue => Self::QUEUE,
            DiscovererRequest::UsageStats => Self::USAGE_STATS,
            DiscovererRequest::SnmpCacheReload => Self::SNMP_CACHE_RELOAD,
            DiscovererRequest::Shutdown => Self::SHUTDOWN,
        }
    }

    pub fn decode(code: u32, _data: &[u8]) -> Result<Self> {
        match code {
            Self::QUEUE => Ok(DiscovererRequest::Queue),
            Self::USAGE_STATS => Ok(DiscovererRequest::UsageStats),
            Self::SNMP_CACHE_RELOAD => Ok(DiscovererRequest::SnmpCacheReload),
            Self::SHUTDOWN => Ok(DiscovererRequest::Shutdown),
            other => Err(NetsweepError::InvalidCode(other)),
        }
    }
}

/// Reply to [`DiscovererRequest::Queue`]: pending checks on the queue.
pub fn encode_queue_reply(pending_checks: u64) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(8);
    w.put_u64(pending_checks);
    w.into_vec()
}

pub fn decode_queue_reply(data: &[u8]) -> Result<u64> {
    WireReader::new(data).get_u64()
}

/// Reply to [`DiscovererRequest::UsageStats`]: per-worker busy fractions
/// in the 0..1 range.
pub fn encode_usage_reply(usage: &[f64]) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(2 + usage.len() * 8);
    w.put_u16(usage.len() as u16);
    for v in usage {
        w.put_f64(*v);
    }
    w.into_vec()
}

pub fn decode_usage_reply(data: &[u8]) -> Result<Vec<f64>> {
    let mut r = WireReader::new(data);
    let n = r.get_u16()? as usize;
    let mut usage = Vec::with_capacity(n);
    for _ in 0..n {
        usage.push(r.get_f64()?);
    }
    Ok(usage)
}

/// One host relocation between proxy groups; a group id of 0 means "no
/// group" on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRelocation {
    pub hostid: u64,
    pub srcid: u64,
    pub dstid: u64,
}

/// Requests understood by the proxy-group manager endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum PgRequest {
    /// Move hosts between proxy groups (notification, no reply).
    HostPgroupUpdate(Vec<HostRelocation>),
    /// Request hostmap sync data for a proxy.
    GetProxySyncData {
        proxyid: u64,
        hostmap_revision: u64,
    },
    /// Request statistics for a named proxy group.
    GetStats { name: String },
    /// Update a proxy heartbeat (notification, no reply).
    ProxyLastaccess { proxyid: u64, lastaccess: i32 },
    /// Stop the service thread (notification, no reply).
    Stop,
}

impl PgRequest {
    pub const HOST_PGROUP_UPDATE: u32 = 1;
    pub const GET_PROXY_SYNC_DATA: u32 = 2;
    pub const GET_STATS: u32 = 3;
    pub const PROXY_LASTACCESS: u32 = 4;
    pub const STOP: u32 = 5;

    pub fn code(&self) -> u32 {
        match self {
            PgRequest::HostPgroupUpdate(_) => Self::HOST_PGROUP_UPDATE,
            PgRequest::GetProxySyncData { .. } => Self::GET_PROXY_SYNC_DATA,
            PgRequest::GetStats { .. } => Self::GET_STATS,
            PgRequest::ProxyLastaccess { .. } => Self::PROXY_LASTACCESS,
            PgRequest::Stop => Self::STOP,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            PgRequest::HostPgroupUpdate(moves) => {
                for m in moves {
                    w.put_u64(m.hostid);
                    w.put_u64(m.srcid);
                    w.put_u64(m.dstid);
                }
            }
            PgRequest::GetProxySyncData {
                proxyid,
                hostmap_revision,
            } => {
                w.put_u64(*proxyid);
                w.put_u64(*hostmap_revision);
            }
            PgRequest::GetStats { name } => {
                w.put_str(name);
            }
            PgRequest::ProxyLastaccess { proxyid, lastaccess } => {
                w.put_u64(*proxyid);
                w.put_i32(*lastaccess);
            }
            PgRequest::Stop => {}
        }
        w.into_vec()
    }

    pub fn decode(code: u32, data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        match code {
            Self::HOST_PGROUP_UPDATE => {
                let mut moves = Vec::new();
                while r.remaining() > 0 {
                    moves.push(HostRelocation {
                        hostid: r.get_u64()?,
                        srcid: r.get_u64()?,
                        dstid: r.get_u64()?,
                    });
                }
                Ok(PgRequest::HostPgroupUpdate(moves))
            }
            Self::GET_PROXY_SYNC_DATA => Ok(PgRequest::GetProxySyncData {
                proxyid: r.get_u64()?,
                hostmap_revision: r.get_u64()?,
            }),
            Self::GET_STATS => Ok(PgRequest::GetStats { name: r.get_str()? }),
            Self::PROXY_LASTACCESS => Ok(PgRequest::ProxyLastaccess {
                proxyid: r.get_u64()?,
                lastaccess: r.get_i32()?,
            }),
            Self::STOP => Ok(PgRequest::Stop),
            other => Err(NetsweepError::InvalidCode(other)),
        }
    }
}

/// Hostmap sync mode returned by `GetProxySyncData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxySyncMode {
    /// Proxy unknown or ungrouped; client resets on next poll.
    None = 0,
    /// Client must fetch the full hostmap.
    Full = 1,
    /// Client applies the attached deletions and fetches updates.
    Partial = 2,
}

impl TryFrom<u8> for ProxySyncMode {
    type Error = NetsweepError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ProxySyncMode::None),
            1 => Ok(ProxySyncMode::Full),
            2 => Ok(ProxySyncMode::Partial),
            other => Err(NetsweepError::Wire(format!("invalid sync mode {}", other))),
        }
    }
}

/// Reply to `GetProxySyncData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySyncReply {
    pub mode: ProxySyncMode,
    pub hostmap_revision: u64,
    pub failover_delay: String,
    /// Host deletions to apply; present only in partial mode.
    pub del_hostids: Vec<u64>,
}

impl ProxySyncReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(self.mode as u8);
        w.put_u64(self.hostmap_revision);
        w.put_str(&self.failover_delay);
        if self.mode == ProxySyncMode::Partial {
            w.put_u32(self.del_hostids.len() as u32);
            for hostid in &self.del_hostids {
                w.put_u64(*hostid);
            }
        }
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        let mode = ProxySyncMode::try_from(r.get_u8()?)?;
        let hostmap_revision = r.get_u64()?;
        let failover_delay = r.get_str()?;
        let mut del_hostids = Vec::new();
        if mode == ProxySyncMode::Partial {
            let n = r.get_u32()? as usize;
            for _ in 0..n {
                del_hostids.push(r.get_u64()?);
            }
        }
        Ok(Self {
            mode,
            hostmap_revision,
            failover_delay,
            del_hostids,
        })
    }
}

/// Reply to `GetStats`. An unknown group name encodes as state `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupStatsReply {
    NotFound,
    Found {
        state: i32,
        online_num: i32,
        proxyids: Vec<u64>,
    },
}

impl GroupStatsReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            GroupStatsReply::NotFound => w.put_i32(-1),
            GroupStatsReply::Found {
                state,
                online_num,
                proxyids,
            } => {
                w.put_i32(*state);
                w.put_i32(*online_num);
                w.put_i32(proxyids.len() as i32);
                for proxyid in proxyids {
                    w.put_u64(*proxyid);
                }
            }
        }
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(data);
        let state = r.get_i32()?;
        if state == -1 {
            return Ok(GroupStatsReply::NotFound);
        }
        let online_num = r.get_i32()?;
        let n = r.get_i32()?;
        let mut proxyids = Vec::with_capacity(n.max(0) as usize);
        for _ in 0..n {
            proxyids.push(r.get_u64()?);
        }
        Ok(GroupStatsReply::Found {
            state,
            online_num,
            proxyids,
        })
    }
}
