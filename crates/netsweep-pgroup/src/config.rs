//! The authoritative proxy-group configuration cache.
//!
//! Configuration sync feeds three tables: proxy groups, proxies and
//! host↔proxy bindings (with a secondary index by host name used by
//! redirect queries). The runtime cache in [`crate::cache`] pulls
//! incremental diffs out of here via its `fetch_*` methods.

use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::warn;

use netsweep_common::time::parse_time_suffix;

use crate::DEFAULT_FAILOVER_DELAY;

/// One synced proxy-group row.
#[derive(Debug, Clone)]
pub struct ProxyGroupRow {
    pub proxy_groupid: u64,
    /// Fail-over delay with time suffix; invalid values fall back to 60s.
    pub failover_delay: String,
    pub min_online: i32,
    pub name: String,
    pub revision: u64,
}

/// One synced proxy row.
#[derive(Debug, Clone)]
pub struct ProxyRow {
    pub proxyid: u64,
    pub name: String,
    /// 0 = not a member of any group.
    pub proxy_groupid: u64,
    pub lastaccess: i64,
    pub local_address: String,
    /// May be a user macro resolved on demand by redirect queries.
    pub local_port: String,
}

/// One synced host↔proxy binding row.
#[derive(Debug, Clone)]
pub struct HostProxyRow {
    pub hostproxyid: u64,
    pub hostid: u64,
    pub host: String,
    pub proxyid: u64,
    pub revision: u64,
}

/// The authoritative binding used by redirect queries.
#[derive(Debug, Clone)]
pub struct HostProxyBinding {
    pub hostproxyid: u64,
    pub hostid: u64,
    pub host: String,
    pub proxyid: u64,
    pub revision: u64,
    /// Stamp of the last redirect reset issued for this host, suppressing
    /// repeated resets within the fail-over delay.
    pub lastreset: i64,
}

/// An object moving between groups: `(objid, src_groupid, dst_groupid)`,
/// 0 meaning "no group" on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjMove {
    pub objid: u64,
    pub srcid: u64,
    pub dstid: u64,
}

/// Redirect decision for an agent connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The queried host is bound to this very proxy, which is failing
    /// over: tell the caller to re-resolve.
    Reset,
    /// Send the caller to the bound proxy at this address.
    Address { address: String, revision: u64 },
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub proxy_groupid: u64,
    pub failover_delay: i64,
    pub min_online: i32,
    pub name: String,
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub proxyid: u64,
    pub name: String,
    pub proxy_groupid: u64,
    pub lastaccess: i64,
    pub local_address: String,
    pub local_port: String,
}

#[derive(Default)]
pub struct ConfigState {
    pub proxy_groups: HashMap<u64, GroupConfig>,
    pub proxies: HashMap<u64, ProxyConfig>,
    pub host_proxy: HashMap<u64, HostProxyBinding>,
    host_index: HashMap<String, u64>,
    pub group_revision: u64,
    pub proxy_revision: u64,
    /// Identity of the local proxy when this cache runs on one.
    local_proxy_name: Option<String>,
    proxy_lastonline: i64,
    proxy_failover_delay: i64,
}

impl ConfigState {
    fn register_host_proxy(&mut self, hostproxyid: u64, host: &str) {
        self.host_index.insert(host.to_string(), hostproxyid);
    }

    fn deregister_host_proxy(&mut self, host: &str) {
        self.host_index.remove(host);
    }

    pub fn binding_by_host(&self, host: &str) -> Option<&HostProxyBinding> {
        let hostproxyid = self.host_index.get(host)?;
        self.host_proxy.get(hostproxyid)
    }
}

/// Reader/writer-locked configuration cache.
#[derive(Default)]
pub struct ConfigCache {
    state: RwLock<ConfigState>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ConfigState> {
        self.state.read().await
    }

    /// Syncs proxy groups: upserts first, removals second, exactly like
    /// the database sync delivers them.
    pub async fn sync_proxy_groups(
        &self,
        upserts: &[ProxyGroupRow],
        removed: &[u64],
        revision: u64,
    ) {
        let mut state = self.state.write().await;
        for row in upserts {
            let failover_delay = match parse_time_suffix(&row.failover_delay) {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    warn!(
                        "invalid proxy group '{}' failover delay '{}', using {} seconds default value",
                        row.proxy_groupid, row.failover_delay, DEFAULT_FAILOVER_DELAY
                    );
                    DEFAULT_FAILOVER_DELAY
                }
            };
            state.proxy_groups.insert(
                row.proxy_groupid,
                GroupConfig {
                    proxy_groupid: row.proxy_groupid,
                    failover_delay,
                    min_online: row.min_online,
                    name: row.name.clone(),
                    revision: row.revision,
                },
            );
        }
        for proxy_groupid in removed {
            state.proxy_groups.remove(proxy_groupid);
        }
        if !upserts.is_empty() || !removed.is_empty() {
            state.group_revision = revision;
        }
    }

    pub async fn sync_proxies(&self, upserts: &[ProxyRow], removed: &[u64], revision: u64) {
        let mut state = self.state.write().await;
        for row in upserts {
            state.proxies.insert(
                row.proxyid,
                ProxyConfig {
                    proxyid: row.proxyid,
                    name: row.name.clone(),
                    proxy_groupid: row.proxy_groupid,
                    lastaccess: row.lastaccess,
                    local_address: row.local_address.clone(),
                    local_port: row.local_port.clone(),
                },
            );
        }
        for proxyid in removed {
            state.proxies.remove(proxyid);
        }
        if !upserts.is_empty() || !removed.is_empty() {
            state.proxy_revision = revision;
        }
    }

    /// Syncs host↔proxy bindings. When a binding changes host name, the
    /// old name leaves the index and the new one is registered. Returns
    /// the host ids whose interface availability must be reset by the
    /// embedding system.
    pub async fn sync_host_proxy(&self, upserts: &[HostProxyRow], removed: &[u64]) -> Vec<u64> {
        let mut state = self.state.write().await;
        let mut affected_hosts = Vec::new();

        for row in upserts {
            if let Some((old_host, old_proxyid)) = state
                .host_proxy
                .get(&row.hostproxyid)
                .map(|old| (old.host.clone(), old.proxyid))
            {
                if old_host != row.host {
                    state.deregister_host_proxy(&old_host);
                }
                if old_proxyid != row.proxyid {
                    affected_hosts.push(row.hostid);
                }
            }
            state.host_proxy.insert(
                row.hostproxyid,
                HostProxyBinding {
                    hostproxyid: row.hostproxyid,
                    hostid: row.hostid,
                    host: row.host.clone(),
                    proxyid: row.proxyid,
                    revision: row.revision,
                    lastreset: 0,
                },
            );
            state.register_host_proxy(row.hostproxyid, &row.host);
        }

        // removals look up the binding table by hostproxyid
        for hostproxyid in removed {
            if let Some(binding) = state.host_proxy.remove(hostproxyid) {
                state.deregister_host_proxy(&binding.host);
                affected_hosts.push(binding.hostid);
            }
        }

        affected_hosts
    }

    pub async fn set_local_proxy(&self, name: impl Into<String>) {
        self.state.write().await.local_proxy_name = Some(name.into());
    }

    pub async fn set_proxy_lastonline(&self, lastonline: i64) {
        self.state.write().await.proxy_lastonline = lastonline;
    }

    pub async fn set_proxy_failover_delay(&self, failover_delay: i64) {
        let mut state = self.state.write().await;
        if state.proxy_failover_delay != failover_delay {
            state.proxy_failover_delay = failover_delay;
        }
    }

    /// Answers "where should this host connect?".
    ///
    /// `None` when the host is unknown, its proxy is unknown, or the host
    /// is bound to the local proxy which is not failing over. When the
    /// local proxy is failing over (last online and last reset both older
    /// than the fail-over delay) the caller gets a [`Redirect::Reset`] and
    /// the reset stamp is refreshed. `resolve` expands a macro in the
    /// target proxy's local port.
    pub async fn get_host_redirect(
        &self,
        host: &str,
        now: i64,
        resolve: impl Fn(&str) -> String,
    ) -> Option<Redirect> {
        let mut state = self.state.write().await;

        let hostproxyid = *state.host_index.get(host)?;
        let (proxyid, revision) = {
            let binding = state.host_proxy.get(&hostproxyid)?;
            (binding.proxyid, binding.revision)
        };
        let proxy = state.proxies.get(&proxyid)?.clone();

        if let Some(local_name) = state.local_proxy_name.clone() {
            if proxy.name == local_name {
                let failover_delay = state.proxy_failover_delay;
                if now - state.proxy_lastonline < failover_delay {
                    return None;
                }
                let binding = state.host_proxy.get_mut(&hostproxyid)?;
                if now - binding.lastreset < failover_delay {
                    return None;
                }
                binding.lastreset = now;
                return Some(Redirect::Reset);
            }
        }

        let mut local_port = proxy.local_port.clone();
        if local_port.starts_with('{') {
            local_port = resolve(&local_port);
        }

        let address = if local_port.is_empty() {
            proxy.local_address.clone()
        } else {
            format!("{}:{}", proxy.local_address, local_port)
        };
        Some(Redirect::Address { address, revision })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_row(id: u64, failover_delay: &str) -> ProxyGroupRow {
        ProxyGroupRow {
            proxy_groupid: id,
            failover_delay: failover_delay.to_string(),
            min_online: 1,
            name: format!("group-{}", id),
            revision: 1,
        }
    }

    fn proxy_row(id: u64, name: &str, groupid: u64) -> ProxyRow {
        ProxyRow {
            proxyid: id,
            name: name.to_string(),
            proxy_groupid: groupid,
            lastaccess: 0,
            local_address: format!("10.1.0.{}", id),
            local_port: "10051".to_string(),
        }
    }

    fn binding_row(hostproxyid: u64, host: &str, proxyid: u64, revision: u64) -> HostProxyRow {
        HostProxyRow {
            hostproxyid,
            hostid: hostproxyid + 100,
            host: host.to_string(),
            proxyid,
            revision,
        }
    }

    #[tokio::test]
    async fn test_invalid_failover_delay_defaults_to_60s() {
        let cache = ConfigCache::new();
        cache
            .sync_proxy_groups(&[group_row(1, "banana")], &[], 5)
            .await;
        let state = cache.read().await;
        assert_eq!(state.proxy_groups[&1].failover_delay, 60);
        assert_eq!(state.group_revision, 5);
    }

    #[tokio::test]
    async fn test_host_index_follows_renames() {
        let cache = ConfigCache::new();
        cache
            .sync_host_proxy(&[binding_row(1, "web-01", 7, 1)], &[])
            .await;
        cache
            .sync_host_proxy(&[binding_row(1, "web-01-renamed", 7, 2)], &[])
            .await;

        let state = cache.read().await;
        assert!(state.binding_by_host("web-01").is_none());
        assert_eq!(state.binding_by_host("web-01-renamed").map(|b| b.proxyid), Some(7));
    }

    #[tokio::test]
    async fn test_binding_removal_deregisters_host() {
        let cache = ConfigCache::new();
        cache
            .sync_host_proxy(&[binding_row(1, "web-01", 7, 1)], &[])
            .await;
        let affected = cache.sync_host_proxy(&[], &[1]).await;

        assert_eq!(affected, vec![101]);
        assert!(cache.read().await.binding_by_host("web-01").is_none());
    }

    #[tokio::test]
    async fn test_redirect_to_remote_proxy() {
        let cache = ConfigCache::new();
        cache.sync_proxies(&[proxy_row(7, "proxy-b", 1)], &[], 1).await;
        cache
            .sync_host_proxy(&[binding_row(1, "web-01", 7, 4)], &[])
            .await;
        cache.set_local_proxy("proxy-a").await;

        let redirect = cache
            .get_host_redirect("web-01", 1000, |s| s.to_string())
            .await;
        assert_eq!(
            redirect,
            Some(Redirect::Address {
                address: "10.1.0.7:10051".to_string(),
                revision: 4,
            })
        );
    }

    #[tokio::test]
    async fn test_redirect_port_macro_is_resolved() {
        let cache = ConfigCache::new();
        let mut row = proxy_row(7, "proxy-b", 1);
        row.local_port = "{$PROXY_PORT}".to_string();
        cache.sync_proxies(&[row], &[], 1).await;
        cache
            .sync_host_proxy(&[binding_row(1, "web-01", 7, 1)], &[])
            .await;
        cache.set_local_proxy("proxy-a").await;

        let redirect = cache
            .get_host_redirect("web-01", 1000, |port| {
                assert_eq!(port, "{$PROXY_PORT}");
                "10099".to_string()
            })
            .await;
        assert_eq!(
            redirect,
            Some(Redirect::Address {
                address: "10.1.0.7:10099".to_string(),
                revision: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_failover_reset_and_suppression() {
        let failover_delay = 60;
        let cache = ConfigCache::new();
        cache.sync_proxies(&[proxy_row(7, "proxy-a", 1)], &[], 1).await;
        cache
            .sync_host_proxy(&[binding_row(1, "web-01", 7, 1)], &[])
            .await;
        cache.set_local_proxy("proxy-a").await;
        cache.set_proxy_failover_delay(failover_delay).await;

        // local proxy went silent 120s ago with a 60s failover delay
        let now = 1000;
        cache.set_proxy_lastonline(now - 120).await;

        let first = cache.get_host_redirect("web-01", now, |s| s.to_string()).await;
        assert_eq!(first, Some(Redirect::Reset));

        // a second query within the failover delay is suppressed
        let second = cache
            .get_host_redirect("web-01", now + 10, |s| s.to_string())
            .await;
        assert_eq!(second, None);

        // and fires again once the reset stamp ages out
        let third = cache
            .get_host_redirect("web-01", now + failover_delay + 1, |s| s.to_string())
            .await;
        assert_eq!(third, Some(Redirect::Reset));
    }

    #[tokio::test]
    async fn test_no_redirect_while_local_proxy_recently_online() {
        let cache = ConfigCache::new();
        cache.sync_proxies(&[proxy_row(7, "proxy-a", 1)], &[], 1).await;
        cache
            .sync_host_proxy(&[binding_row(1, "web-01", 7, 1)], &[])
            .await;
        cache.set_local_proxy("proxy-a").await;
        cache.set_proxy_failover_delay(60).await;
        cache.set_proxy_lastonline(990).await;

        let redirect = cache.get_host_redirect("web-01", 1000, |s| s.to_string()).await;
        assert_eq!(redirect, None);
    }

    #[tokio::test]
    async fn test_unknown_host_has_no_redirect() {
        let cache = ConfigCache::new();
        let redirect = cache.get_host_redirect("ghost", 1000, |s| s.to_string()).await;
        assert_eq!(redirect, None);
    }
}
