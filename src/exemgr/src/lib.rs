//! Executor manager for a serverless function-execution platform over RDMA.
//!
//! The manager accepts client connections, spawns executor processes sized
//! to each client's allocation request, wires the executors back into their
//! client's RDMA flow, accounts their resource usage and reclaims them on
//! exit or disconnect. Three worker threads cooperate:
//!
//! - the [`listener::Listener`] drains connection-management events and
//!   classifies them into control messages,
//! - the [`poller::RdmaPoller`] consumes those messages, owns the client
//!   registry, reaps allocation requests and drives executor lifecycles,
//! - the [`resmgr::ResourceManagerPoller`] holds the connection to the
//!   upstream resource manager and reaps lease grants.
//!
//! They communicate over the bounded [`queue`] and never share the registry:
//! only the poller thread mutates it.

#[macro_use]
extern crate log;

use thiserror::Error;

pub mod client;
pub mod config;
pub mod executor;
pub mod listener;
pub mod manager;
pub mod poller;
pub mod queue;
pub mod resmgr;
pub mod wire;

pub use config::{SecondAllocationPolicy, Settings};
pub use manager::{Manager, ManagerHandle, POLLING_TIMEOUT, POLLING_TIMEOUT_MS};

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("rdma: {0}")]
    Rdma(#[from] rdma::Error),
}
