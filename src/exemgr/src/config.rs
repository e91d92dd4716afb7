//! Manager settings, loadable from a TOML file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;

/// What to do when a client that already holds an executor requests another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondAllocationPolicy {
    /// Accrue the current executor's time, drop its handle and spawn a new
    /// one. The old process is left to finish on its own.
    Replace,
    /// Refuse the request and keep the current executor.
    Deny,
}

impl Default for SecondAllocationPolicy {
    fn default() -> Self {
        SecondAllocationPolicy::Replace
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceManagerSettings {
    pub address: String,
    pub port: u16,
    pub secret: u32,
}

/// Parameters passed through to every spawned executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Path of the executor binary.
    pub path: PathBuf,
    pub repetitions: u32,
    pub warmup_iters: u32,
    pub recv_buffer_size: u32,
    pub max_inline_data: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Address of the RDMA device the manager listens on; executors dial
    /// back to it.
    pub device_address: String,
    pub device_port: u16,
    /// Receive slots primed per client connection.
    pub receive_buffer_size: usize,
    /// Registry capacity; new clients wait in the control queue beyond it.
    pub max_clients: usize,
    pub node_name: String,
    pub resource_manager: ResourceManagerSettings,
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub second_allocation: SecondAllocationPolicy,
}

impl Settings {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        let settings = toml::from_str(&content)?;
        Ok(settings)
    }
}
