//! The runtime proxy-group cache.
//!
//! Keeps the live host→proxy assignment per group, the per-group hostmap
//! revision, proxy liveness and the per-proxy deletion log that backs
//! partial hostmap sync. Fed from [`crate::config::ConfigCache`] through
//! the incremental `fetch_*` diffs and mutated by the IPC handlers.

use std::collections::{HashMap, HashSet};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use netsweep_common::protocol::messages::{
    GroupStatsReply, HostRelocation, ProxySyncMode, ProxySyncReply,
};

use crate::config::{ConfigState, ObjMove};
use crate::{DEFAULT_FAILOVER_DELAY, FULL_SYNC_AGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Unknown,
    Offline,
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum GroupState {
    Unknown = 0,
    Offline = 1,
    Degrading = 2,
    Online = 3,
}

/// A host deletion recorded for one proxy, delivered to it by partial
/// sync until the proxy's hostmap revision catches up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedHost {
    pub hostid: u64,
    /// Hostmap revision at which the deletion took effect; 0 while the
    /// rebalance that will stamp it has not run yet.
    pub revision: u64,
}

#[derive(Debug)]
pub struct PgGroup {
    pub id: u64,
    pub name: String,
    pub failover_delay: i64,
    pub min_online: i32,
    pub state: GroupState,
    pub revision: u64,
    pub hostmap_revision: u64,
    pub proxies: Vec<u64>,
    /// Every host of the group, assigned or pending.
    pub hostids: HashSet<u64>,
    /// Hosts waiting for the next rebalance to pick a proxy.
    pub new_hostids: Vec<u64>,
    /// Membership changed since the last rebalance.
    updated: bool,
}

impl PgGroup {
    fn new(id: u64) -> Self {
        Self {
            id,
            name: String::new(),
            failover_delay: DEFAULT_FAILOVER_DELAY,
            min_online: 0,
            state: GroupState::Unknown,
            revision: 0,
            hostmap_revision: 0,
            proxies: Vec::new(),
            hostids: HashSet::new(),
            new_hostids: Vec::new(),
            updated: false,
        }
    }
}

#[derive(Debug)]
pub struct PgProxy {
    pub id: u64,
    pub name: String,
    /// 0 = not a group member.
    pub groupid: u64,
    pub lastaccess: i64,
    pub state: ProxyState,
    pub hosts: HashSet<u64>,
    pub deleted_group_hosts: Vec<DeletedHost>,
    pub sync_time: i64,
}

impl PgProxy {
    fn new(id: u64) -> Self {
        Self {
            id,
            name: String::new(),
            groupid: 0,
            lastaccess: 0,
            state: ProxyState::Unknown,
            hosts: HashSet::new(),
            deleted_group_hosts: Vec::new(),
            sync_time: 0,
        }
    }
}

#[derive(Default)]
pub struct PgState {
    pub groups: HashMap<u64, PgGroup>,
    pub proxies: HashMap<u64, PgProxy>,
    group_revision: u64,
    proxy_revision: u64,
}

impl PgState {
    /// Pulls group configuration changes out of the authoritative cache.
    /// Returns whether anything was updated.
    pub fn fetch_groups(&mut self, config: &ConfigState) -> bool {
        if self.group_revision >= config.group_revision {
            return false;
        }
        self.group_revision = config.group_revision;

        for cfg in config.proxy_groups.values() {
            let group = self
                .groups
                .entry(cfg.proxy_groupid)
                .or_insert_with(|| PgGroup::new(cfg.proxy_groupid));
            if cfg.revision > group.revision {
                group.revision = cfg.revision;
                group.failover_delay = cfg.failover_delay;
                group.min_online = cfg.min_online;
                if group.name != cfg.name {
                    group.name = cfg.name.clone();
                }
            }
        }
        self.groups
            .retain(|id, _| config.proxy_groups.contains_key(id));
        true
    }

    /// Pulls proxy changes out of the authoritative cache, reporting group
    /// membership changes through `reloc` (applied separately so callers
    /// control when hosts get redistributed).
    pub fn fetch_proxies(&mut self, config: &ConfigState, reloc: &mut Vec<ObjMove>) -> bool {
        if self.proxy_revision >= config.proxy_revision {
            return false;
        }
        self.proxy_revision = config.proxy_revision;

        for cfg in config.proxies.values() {
            if cfg.proxy_groupid == 0 {
                if let Some(proxy) = self.proxies.get(&cfg.proxyid) {
                    if proxy.groupid != 0 {
                        reloc.push(ObjMove {
                            objid: cfg.proxyid,
                            srcid: proxy.groupid,
                            dstid: 0,
                        });
                    }
                }
                continue;
            }

            let proxy = self
                .proxies
                .entry(cfg.proxyid)
                .or_insert_with(|| PgProxy::new(cfg.proxyid));
            proxy.lastaccess = cfg.lastaccess;
            if proxy.groupid != cfg.proxy_groupid {
                reloc.push(ObjMove {
                    objid: cfg.proxyid,
                    srcid: proxy.groupid,
                    dstid: cfg.proxy_groupid,
                });
            }
            if proxy.name != cfg.name {
                proxy.name = cfg.name.clone();
            }
        }
        true
    }

    /// Applies proxy group-membership moves produced by `fetch_proxies`.
    /// Hosts assigned to a proxy leaving a group go back to that group's
    /// pending list.
    pub fn apply_proxy_relocations(&mut self, reloc: &[ObjMove]) {
        for mv in reloc {
            if mv.srcid != 0 {
                let orphans: Vec<u64> = match self.proxies.get_mut(&mv.objid) {
                    Some(proxy) => proxy.hosts.drain().collect(),
                    None => Vec::new(),
                };
                if let Some(group) = self.groups.get_mut(&mv.srcid) {
                    group.proxies.retain(|id| *id != mv.objid);
                    if !orphans.is_empty() {
                        group.new_hostids.extend(orphans);
                        group.updated = true;
                    }
                }
            }
            if mv.dstid != 0 {
                if let Some(group) = self.groups.get_mut(&mv.dstid) {
                    if !group.proxies.contains(&mv.objid) {
                        group.proxies.push(mv.objid);
                    }
                }
            }
            if let Some(proxy) = self.proxies.get_mut(&mv.objid) {
                proxy.groupid = mv.dstid;
            }
        }
    }

    /// Moves hosts between groups per an IPC relocation batch. Pending
    /// state left by earlier batches is materialised first, as the
    /// original service does; the next [`PgState::update_groups`] call
    /// assigns the new arrivals.
    pub fn update_host_pgroup(&mut self, moves: &[HostRelocation], now: i64) {
        self.update_groups(now);

        for mv in moves {
            if mv.srcid != 0 && self.groups.contains_key(&mv.srcid) {
                self.group_remove_host(mv.srcid, mv.hostid);
            }
            if mv.dstid != 0 {
                if let Some(group) = self.groups.get_mut(&mv.dstid) {
                    if group.hostids.insert(mv.hostid) {
                        group.new_hostids.push(mv.hostid);
                        group.updated = true;
                    }
                }
            }
        }
    }

    fn group_remove_host(&mut self, groupid: u64, hostid: u64) {
        let Some(group) = self.groups.get_mut(&groupid) else {
            return;
        };
        let removed = group.hostids.remove(&hostid);
        group.new_hostids.retain(|id| *id != hostid);
        if !removed {
            return;
        }
        group.updated = true;

        for proxyid in group.proxies.clone() {
            if let Some(proxy) = self.proxies.get_mut(&proxyid) {
                if proxy.hosts.remove(&hostid) {
                    proxy.deleted_group_hosts.push(DeletedHost {
                        hostid,
                        revision: 0,
                    });
                    break;
                }
            }
        }
    }

    /// Rebalances every group: refreshes proxy liveness, redistributes
    /// hosts of offline proxies, assigns pending hosts to the least
    /// loaded online proxy, and bumps the group's hostmap revision iff
    /// its membership or assignment changed.
    pub fn update_groups(&mut self, now: i64) {
        let mut group_ids: Vec<u64> = self.groups.keys().copied().collect();
        group_ids.sort_unstable();

        for groupid in group_ids {
            let Some(group) = self.groups.get(&groupid) else {
                continue;
            };
            let failover_delay = group.failover_delay;
            let member_proxies = group.proxies.clone();
            let mut changed = false;

            // refresh liveness
            let mut online: Vec<u64> = Vec::new();
            for proxyid in &member_proxies {
                if let Some(proxy) = self.proxies.get_mut(proxyid) {
                    if now - proxy.lastaccess < failover_delay {
                        proxy.state = ProxyState::Online;
                        online.push(*proxyid);
                    } else {
                        proxy.state = ProxyState::Offline;
                    }
                }
            }

            // strip hosts off proxies that fell offline
            let mut orphans: Vec<u64> = Vec::new();
            for proxyid in &member_proxies {
                if online.contains(proxyid) {
                    continue;
                }
                if let Some(proxy) = self.proxies.get_mut(proxyid) {
                    for hostid in proxy.hosts.drain() {
                        proxy.deleted_group_hosts.push(DeletedHost {
                            hostid,
                            revision: 0,
                        });
                        orphans.push(hostid);
                    }
                }
            }
            if !orphans.is_empty() {
                changed = true;
            }

            // assign pending hosts to the least loaded online proxy
            let Some(group) = self.groups.get_mut(&groupid) else {
                continue;
            };
            let mut pending: Vec<u64> = group.new_hostids.drain(..).collect();
            pending.extend(orphans);
            let group_updated = std::mem::take(&mut group.updated);

            if online.is_empty() {
                // nothing can take them; keep pending for the next pass
                group.new_hostids = pending;
            } else {
                for hostid in pending {
                    let mut target: Option<(u64, usize)> = None;
                    for proxyid in &online {
                        if let Some(proxy) = self.proxies.get(proxyid) {
                            let load = proxy.hosts.len();
                            if target.map_or(true, |(_, best)| load < best) {
                                target = Some((*proxyid, load));
                            }
                        }
                    }
                    if let Some((proxyid, _)) = target {
                        if let Some(proxy) = self.proxies.get_mut(&proxyid) {
                            proxy.hosts.insert(hostid);
                            changed = true;
                        }
                    }
                }
            }

            if changed || group_updated {
                let Some(group) = self.groups.get_mut(&groupid) else {
                    continue;
                };
                group.hostmap_revision += 1;
                let revision = group.hostmap_revision;
                debug!("group {} hostmap revision -> {}", groupid, revision);
                for proxyid in &member_proxies {
                    if let Some(proxy) = self.proxies.get_mut(proxyid) {
                        for deleted in &mut proxy.deleted_group_hosts {
                            if deleted.revision == 0 {
                                deleted.revision = revision;
                            }
                        }
                    }
                }
            }

            // derive group state from the online share
            if let Some(group) = self.groups.get_mut(&groupid) {
                group.state = if online.len() >= group.min_online.max(0) as usize
                    && !member_proxies.is_empty()
                {
                    GroupState::Online
                } else if !online.is_empty() {
                    GroupState::Degrading
                } else {
                    GroupState::Offline
                };
            }
        }
    }

    /// Hostmap sync decision for one proxy (sync modes are documented on
    /// the protocol type). Stamps the proxy's sync time on every served
    /// request.
    pub fn get_proxy_sync_data(
        &mut self,
        proxyid: u64,
        client_revision: u64,
        now: i64,
    ) -> ProxySyncReply {
        let no_sync = ProxySyncReply {
            mode: ProxySyncMode::None,
            hostmap_revision: 0,
            failover_delay: format!("{}s", DEFAULT_FAILOVER_DELAY),
            del_hostids: Vec::new(),
        };

        let Some(proxy) = self.proxies.get_mut(&proxyid) else {
            return no_sync;
        };
        if proxy.groupid == 0 {
            return no_sync;
        }
        let Some(group) = self.groups.get(&proxy.groupid) else {
            return no_sync;
        };

        let hostmap_revision = group.hostmap_revision;
        let failover_delay = format!("{}s", group.failover_delay);

        let mut mode = ProxySyncMode::None;
        let mut del_hostids = Vec::new();

        if client_revision == 0
            || client_revision > hostmap_revision
            || now - proxy.sync_time >= FULL_SYNC_AGE
        {
            // proxy or server restarted, or too much time has passed
            mode = ProxySyncMode::Full;
            proxy.deleted_group_hosts.clear();
        } else if client_revision < hostmap_revision {
            proxy
                .deleted_group_hosts
                .retain(|d| d.revision > client_revision);
            del_hostids = proxy.deleted_group_hosts.iter().map(|d| d.hostid).collect();
            mode = ProxySyncMode::Partial;
        }
        proxy.sync_time = now;

        ProxySyncReply {
            mode,
            hostmap_revision,
            failover_delay,
            del_hostids,
        }
    }

    pub fn get_group_stats(&self, name: &str) -> GroupStatsReply {
        let Some(group) = self.groups.values().find(|g| g.name == name) else {
            return GroupStatsReply::NotFound;
        };

        let online_num = group
            .proxies
            .iter()
            .filter(|id| {
                self.proxies
                    .get(id)
                    .is_some_and(|p| p.state == ProxyState::Online)
            })
            .count() as i32;

        GroupStatsReply::Found {
            state: group.state as i32,
            online_num,
            proxyids: group.proxies.clone(),
        }
    }

    /// Updates a proxy heartbeat; stale (non-increasing) stamps are
    /// ignored so replayed notifications leave the cache unchanged.
    pub fn update_proxy_lastaccess(&mut self, proxyid: u64, lastaccess: i64) {
        if let Some(proxy) = self.proxies.get_mut(&proxyid) {
            if lastaccess > proxy.lastaccess {
                proxy.lastaccess = lastaccess;
            }
        }
    }

    /// Test/bootstrap helper: registers a group with its member proxies.
    pub fn insert_group(&mut self, mut group: PgGroup, proxies: Vec<PgProxy>) {
        for proxy in proxies {
            if !group.proxies.contains(&proxy.id) {
                group.proxies.push(proxy.id);
            }
            self.proxies.insert(proxy.id, proxy);
        }
        self.groups.insert(group.id, group);
    }
}

/// Builder-style constructors used by the service and tests.
impl PgGroup {
    pub fn with_name(id: u64, name: impl Into<String>, failover_delay: i64) -> Self {
        Self {
            name: name.into(),
            failover_delay,
            ..Self::new(id)
        }
    }
}

impl PgProxy {
    pub fn with_group(id: u64, name: impl Into<String>, groupid: u64, lastaccess: i64) -> Self {
        Self {
            name: name.into(),
            groupid,
            lastaccess,
            ..Self::new(id)
        }
    }
}

/// The runtime cache behind a reader/writer lock; IPC handlers take the
/// write side only for mutations.
#[derive(Default)]
pub struct PgCache {
    state: RwLock<PgState>,
}

impl PgCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, PgState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, PgState> {
        self.state.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_proxy_group(now: i64) -> PgState {
        let mut state = PgState::default();
        let group = PgGroup::with_name(1, "dc-east", 60);
        let p1 = PgProxy::with_group(11, "proxy-1", 1, now);
        let p2 = PgProxy::with_group(12, "proxy-2", 1, now);
        state.insert_group(group, vec![p1, p2]);
        state
    }

    #[test]
    fn test_rebalance_assigns_new_host_and_bumps_revision() {
        let now = 10_000;
        let mut state = two_proxy_group(now);

        // seed two assigned hosts
        state.update_host_pgroup(
            &[
                HostRelocation {
                    hostid: 101,
                    srcid: 0,
                    dstid: 1,
                },
                HostRelocation {
                    hostid: 102,
                    srcid: 0,
                    dstid: 1,
                },
            ],
            now,
        );
        state.update_groups(now);
        let rev_before = state.groups[&1].hostmap_revision;
        assert!(rev_before > 0);

        // one more host arrives
        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 103,
                srcid: 0,
                dstid: 1,
            }],
            now,
        );
        state.update_groups(now);

        assert_eq!(state.groups[&1].hostmap_revision, rev_before + 1);
        let owners: Vec<u64> = [11u64, 12]
            .iter()
            .filter(|id| state.proxies[id].hosts.contains(&103))
            .copied()
            .collect();
        assert_eq!(owners.len(), 1, "exactly one proxy owns the new host");
        // least-loaded assignment: the two seed hosts split 1/1, so total 2/1
        let total: usize = state.proxies[&11].hosts.len() + state.proxies[&12].hosts.len();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_rebalance_without_changes_keeps_revision() {
        let now = 10_000;
        let mut state = two_proxy_group(now);
        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 101,
                srcid: 0,
                dstid: 1,
            }],
            now,
        );
        state.update_groups(now);
        let revision = state.groups[&1].hostmap_revision;

        state.update_groups(now);
        assert_eq!(state.groups[&1].hostmap_revision, revision);
    }

    #[test]
    fn test_host_removal_records_deletion_for_owner() {
        let now = 10_000;
        let mut state = two_proxy_group(now);
        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 101,
                srcid: 0,
                dstid: 1,
            }],
            now,
        );
        state.update_groups(now);
        let owner = if state.proxies[&11].hosts.contains(&101) {
            11
        } else {
            12
        };

        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 101,
                srcid: 1,
                dstid: 0,
            }],
            now,
        );
        state.update_groups(now);

        let revision = state.groups[&1].hostmap_revision;
        let deletions = &state.proxies[&owner].deleted_group_hosts;
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].hostid, 101);
        assert_eq!(deletions[0].revision, revision);
    }

    #[test]
    fn test_sync_data_modes() {
        let now = 10_000;
        let mut state = two_proxy_group(now);
        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 101,
                srcid: 0,
                dstid: 1,
            }],
            now,
        );
        state.update_groups(now);
        let revision = state.groups[&1].hostmap_revision;

        // revision 0 client: full sync
        let reply = state.get_proxy_sync_data(11, 0, now);
        assert_eq!(reply.mode, ProxySyncMode::Full);
        assert_eq!(reply.hostmap_revision, revision);
        assert_eq!(reply.failover_delay, "60s");

        // up-to-date client: no sync needed
        let reply = state.get_proxy_sync_data(11, revision, now);
        assert_eq!(reply.mode, ProxySyncMode::None);
        assert_eq!(reply.hostmap_revision, revision);

        // behind client: partial with no deletions pending for this proxy
        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 102,
                srcid: 0,
                dstid: 1,
            }],
            now,
        );
        state.update_groups(now);
        let reply = state.get_proxy_sync_data(11, revision, now);
        assert_eq!(reply.mode, ProxySyncMode::Partial);
        assert!(reply.del_hostids.is_empty());

        // client ahead of server (server restarted): full sync
        let reply = state.get_proxy_sync_data(11, 999, now);
        assert_eq!(reply.mode, ProxySyncMode::Full);
    }

    #[test]
    fn test_sync_data_full_after_24h() {
        let now = 100_000;
        let mut state = two_proxy_group(now);
        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 101,
                srcid: 0,
                dstid: 1,
            }],
            now,
        );
        state.update_groups(now);
        let revision = state.groups[&1].hostmap_revision;

        let reply = state.get_proxy_sync_data(11, revision, now);
        assert_eq!(reply.mode, ProxySyncMode::None);

        let later = now + FULL_SYNC_AGE;
        let reply = state.get_proxy_sync_data(11, revision, later);
        assert_eq!(reply.mode, ProxySyncMode::Full);
    }

    #[test]
    fn test_sync_data_unknown_or_ungrouped_proxy() {
        let now = 10_000;
        let mut state = two_proxy_group(now);
        state.proxies.insert(99, PgProxy::with_group(99, "stray", 0, now));

        let reply = state.get_proxy_sync_data(42, 5, now);
        assert_eq!(reply.mode, ProxySyncMode::None);
        assert_eq!(reply.hostmap_revision, 0);

        let reply = state.get_proxy_sync_data(99, 5, now);
        assert_eq!(reply.mode, ProxySyncMode::None);
        assert_eq!(reply.hostmap_revision, 0);
    }

    #[test]
    fn test_partial_sync_prunes_acknowledged_deletions() {
        let now = 10_000;
        let mut state = two_proxy_group(now);
        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 101,
                srcid: 0,
                dstid: 1,
            }],
            now,
        );
        state.update_groups(now);
        let rev1 = state.groups[&1].hostmap_revision;
        let owner = if state.proxies[&11].hosts.contains(&101) {
            11
        } else {
            12
        };

        state.update_host_pgroup(
            &[HostRelocation {
                hostid: 101,
                srcid: 1,
                dstid: 0,
            }],
            now,
        );
        state.update_groups(now);
        let rev2 = state.groups[&1].hostmap_revision;

        // client at rev1 must see the deletion recorded at rev2
        let reply = state.get_proxy_sync_data(owner, rev1, now);
        assert_eq!(reply.mode, ProxySyncMode::Partial);
        assert_eq!(reply.del_hostids, vec![101]);

        // client already at rev2: deletion is pruned
        let reply = state.get_proxy_sync_data(owner, rev2, now);
        assert_eq!(reply.mode, ProxySyncMode::None);
        assert!(state.proxies[&owner].deleted_group_hosts.is_empty());
    }

    #[test]
    fn test_offline_proxy_hosts_are_redistributed() {
        let now = 10_000;
        let mut state = two_proxy_group(now);
        for hostid in [101, 102] {
            state.update_host_pgroup(
                &[HostRelocation {
                    hostid,
                    srcid: 0,
                    dstid: 1,
                }],
                now,
            );
        }
        state.update_groups(now);

        // proxy-1 goes silent past the failover delay
        if let Some(proxy) = state.proxies.get_mut(&11) {
            proxy.lastaccess = now - 120;
        }
        let before = state.groups[&1].hostmap_revision;
        state.update_groups(now);

        assert_eq!(state.proxies[&11].state, ProxyState::Offline);
        assert_eq!(state.proxies[&11].hosts.len(), 0);
        assert_eq!(state.proxies[&12].hosts.len(), 2);
        assert!(state.groups[&1].hostmap_revision > before);
    }

    #[test]
    fn test_group_stats() {
        let now = 10_000;
        let mut state = two_proxy_group(now);
        if let Some(proxy) = state.proxies.get_mut(&12) {
            proxy.lastaccess = now - 999;
        }
        state.update_groups(now);

        match state.get_group_stats("dc-east") {
            GroupStatsReply::Found {
                state: group_state,
                online_num,
                proxyids,
            } => {
                assert_eq!(online_num, 1);
                assert_eq!(proxyids.len(), 2);
                assert!(group_state >= GroupState::Degrading as i32);
            }
            GroupStatsReply::NotFound => panic!("group must exist"),
        }

        assert_eq!(state.get_group_stats("nope"), GroupStatsReply::NotFound);
    }

    #[test]
    fn test_lastaccess_is_monotonic() {
        let now = 10_000;
        let mut state = two_proxy_group(now);
        state.update_proxy_lastaccess(11, now + 50);
        assert_eq!(state.proxies[&11].lastaccess, now + 50);

        state.update_proxy_lastaccess(11, now + 20);
        assert_eq!(state.proxies[&11].lastaccess, now + 50, "stale stamp ignored");

        state.update_proxy_lastaccess(11, now + 50);
        assert_eq!(state.proxies[&11].lastaccess, now + 50);
    }
}
