//! The proxy-group manager IPC service.
//!
//! A single task owns the endpoint: it answers relocation, heartbeat,
//! sync-data and stats requests against the runtime cache, and on every
//! idle poll pulls configuration diffs and rebalances the groups. `Stop`
//! ends the loop; [`PgService::stop`] delivers it through a local client
//! connection and joins the task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use netsweep_common::ipc::{IpcServer, IpcSocket};
use netsweep_common::protocol::PgRequest;
use netsweep_common::time::now_unix;
use netsweep_common::{NetsweepError, Result};

use crate::cache::PgCache;
use crate::config::ConfigCache;

/// Socket path of the proxy-group manager endpoint.
pub fn pgroup_socket_path(socket_dir: &Path) -> PathBuf {
    socket_dir.join("pgroup.sock")
}

pub struct PgService {
    socket_path: PathBuf,
    handle: JoinHandle<()>,
}

impl PgService {
    /// Binds the endpoint and spawns the service loop.
    pub fn start(
        socket_dir: &Path,
        cache: Arc<PgCache>,
        config: Arc<ConfigCache>,
    ) -> Result<Self> {
        let socket_path = pgroup_socket_path(socket_dir);
        let ipc = IpcServer::bind(&socket_path)?;
        let handle = tokio::spawn(service_loop(ipc, cache, config));
        Ok(Self {
            socket_path,
            handle,
        })
    }

    /// Delivers `Stop` over a local connection and joins the loop.
    pub async fn stop(self) -> Result<()> {
        let mut sock = IpcSocket::connect(&self.socket_path).await?;
        sock.send(PgRequest::STOP, &[]).await?;
        self.handle
            .await
            .map_err(|e| NetsweepError::ServiceUnavailable(format!("service join failed: {}", e)))
    }
}

async fn service_loop(mut ipc: IpcServer, cache: Arc<PgCache>, config: Arc<ConfigCache>) {
    debug!("proxy group service started");
    loop {
        match ipc.recv(Duration::from_secs(1)).await {
            None => {
                // idle poll: sync from configuration and rebalance
                let now = now_unix();
                let mut reloc = Vec::new();
                let mut state = cache.write().await;
                {
                    let cfg = config.read().await;
                    state.fetch_groups(&cfg);
                    state.fetch_proxies(&cfg, &mut reloc);
                }
                state.apply_proxy_relocations(&reloc);
                state.update_groups(now);
            }
            Some((peer, message)) => {
                let request = match PgRequest::decode(message.code, &message.data) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("unexpected proxy group request: {}", e);
                        continue;
                    }
                };
                match request {
                    PgRequest::HostPgroupUpdate(moves) => {
                        let mut state = cache.write().await;
                        state.update_host_pgroup(&moves, now_unix());
                    }
                    PgRequest::GetProxySyncData {
                        proxyid,
                        hostmap_revision,
                    } => {
                        let reply = {
                            let mut state = cache.write().await;
                            state.get_proxy_sync_data(proxyid, hostmap_revision, now_unix())
                        };
                        if let Err(e) = peer
                            .send(PgRequest::GET_PROXY_SYNC_DATA, &reply.encode())
                            .await
                        {
                            warn!("cannot reply with proxy sync data: {}", e);
                        }
                    }
                    PgRequest::GetStats { name } => {
                        let reply = {
                            let state = cache.read().await;
                            state.get_group_stats(&name)
                        };
                        if let Err(e) = peer.send(PgRequest::GET_STATS, &reply.encode()).await {
                            warn!("cannot reply with proxy group stats: {}", e);
                        }
                    }
                    PgRequest::ProxyLastaccess { proxyid, lastaccess } => {
                        let mut state = cache.write().await;
                        state.update_proxy_lastaccess(proxyid, lastaccess as i64);
                    }
                    PgRequest::Stop => break,
                }
            }
        }
    }
    debug!("proxy group service stopped");
}
