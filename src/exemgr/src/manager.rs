//! The manager top level: owns the components, runs the three worker
//! threads, orchestrates shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rdma::{EventWaker, RdmaCm};

use crate::config::Settings;
use crate::executor::ExecutorLauncher;
use crate::listener::Listener;
use crate::poller::RdmaPoller;
use crate::queue::{control_queue, CONTROL_QUEUE_DEPTH};
use crate::resmgr::{ResourceManagerConnection, ResourceManagerPoller};
use crate::Error;

pub const POLLING_TIMEOUT_MS: u64 = 100;
pub const POLLING_TIMEOUT: Duration = Duration::from_millis(POLLING_TIMEOUT_MS);

pub struct Manager {
    device_address: String,
    device_port: u16,
    listener: Listener,
    poller: RdmaPoller,
    res_mgr: Option<ResourceManagerPoller>,
    shutdown: Arc<AtomicBool>,
    res_mgr_waker: Option<Arc<dyn EventWaker>>,
}

/// Cloneable handle for requesting shutdown from another thread.
#[derive(Clone)]
pub struct ManagerHandle {
    shutdown: Arc<AtomicBool>,
    res_mgr_waker: Option<Arc<dyn EventWaker>>,
}

impl ManagerHandle {
    /// Ask every worker loop to exit. The resource-manager poller is woken
    /// out of its blocking wait; the other loops notice the flag within one
    /// polling timeout.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(waker) = &self.res_mgr_waker {
            waker.wake();
        }
    }
}

impl Manager {
    /// Build the manager. With `skip_rm` the resource manager is not dialed
    /// and no lease poller runs.
    pub fn new(
        settings: Settings,
        cm: Arc<dyn RdmaCm>,
        launcher: Box<dyn ExecutorLauncher>,
        skip_rm: bool,
    ) -> Result<Manager, Error> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = control_queue(CONTROL_QUEUE_DEPTH);

        let res_mgr = if skip_rm {
            None
        } else {
            let connection = ResourceManagerConnection::connect(
                &*cm,
                &settings.resource_manager,
                &settings.node_name,
                settings.receive_buffer_size,
            )?;
            Some(ResourceManagerPoller::new(connection, shutdown.clone()))
        };
        let res_mgr_waker = res_mgr.as_ref().map(|poller| Arc::from(poller.waker()));

        let listener = Listener::new(
            cm.clone(),
            control_tx,
            settings.receive_buffer_size,
            shutdown.clone(),
        );
        let device_address = settings.device_address.clone();
        let device_port = settings.device_port;
        let poller = RdmaPoller::new(cm, control_rx, launcher, settings, shutdown.clone());

        Ok(Manager {
            device_address,
            device_port,
            listener,
            poller,
            res_mgr,
            shutdown,
            res_mgr_waker,
        })
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            shutdown: self.shutdown.clone(),
            res_mgr_waker: self.res_mgr_waker.clone(),
        }
    }

    /// Run the three worker threads until a handle requests shutdown, then
    /// join them. Join order matters: the resource manager first, then the
    /// listener so its in-flight connect messages are delivered before the
    /// poller exits.
    pub fn start(self) {
        info!(
            "begin listening at {}:{} and processing events",
            self.device_address, self.device_port
        );
        let Manager {
            listener,
            mut poller,
            res_mgr,
            ..
        } = self;

        let res_mgr_thread = res_mgr.map(|mut res_mgr| {
            thread::Builder::new()
                .name("res-mgr-poller".to_string())
                .spawn(move || res_mgr.run())
                .unwrap_or_else(|e| panic!("failed to spawn res-mgr-poller: {}", e))
        });
        let listener_thread = thread::Builder::new()
            .name("listener".to_string())
            .spawn(move || listener.run())
            .unwrap_or_else(|e| panic!("failed to spawn listener: {}", e));
        let poller_thread = thread::Builder::new()
            .name("rdma-poller".to_string())
            .spawn(move || poller.run())
            .unwrap_or_else(|e| panic!("failed to spawn rdma-poller: {}", e));

        if let Some(thread) = res_mgr_thread {
            if thread.join().is_err() {
                error!("resource manager poller panicked");
            }
        }
        if listener_thread.join().is_err() {
            error!("listener panicked");
        }
        if poller_thread.join().is_err() {
            error!("rdma poller panicked");
        }
    }
}
