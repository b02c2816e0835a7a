//! Discoverer service configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Runtime configuration handed down by the supervising daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscovererConfig {
    /// Size of the worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Source address for outgoing probes, when the backend supports it.
    #[serde(default)]
    pub source_ip: Option<String>,
    /// Directory holding the service sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Path of the fping binary used by the built-in ICMP driver.
    #[serde(default = "default_fping_path")]
    pub fping_path: PathBuf,
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/netsweep")
}

fn default_fping_path() -> PathBuf {
    PathBuf::from("/usr/bin/fping")
}

impl Default for DiscovererConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            source_ip: None,
            socket_dir: default_socket_dir(),
            fping_path: default_fping_path(),
        }
    }
}

/// Socket path of the discoverer IPC endpoint.
pub fn discoverer_socket_path(socket_dir: &Path) -> PathBuf {
    socket_dir.join("discoverer.sock")
}
