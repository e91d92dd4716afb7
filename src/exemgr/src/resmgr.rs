//! Resource-manager poller: one long-lived connection to the upstream
//! resource manager, drained with event-driven completion notification
//! instead of spinning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rdma::{
    AccessFlags, Buffer, Connection, EventWaker, RdmaCm, RecvWr, RegisteredBuffer, WaitEvent,
    WorkCompletion,
};

use crate::config::ResourceManagerSettings;
use crate::wire::LeaseGrant;
use crate::Error;

/// The dial-out connection to the resource manager with its registered
/// lease-grant receive slots.
pub struct ResourceManagerConnection {
    connection: Box<dyn Connection>,
    grants: RegisteredBuffer,
    spent_slots: Vec<u64>,
    recv_slots: usize,
}

impl ResourceManagerConnection {
    pub fn connect(
        cm: &dyn RdmaCm,
        settings: &ResourceManagerSettings,
        node_name: &str,
        recv_slots: usize,
    ) -> Result<Self, Error> {
        assert!(recv_slots > 0);
        info!(
            "connecting to resource manager at {}:{} as node {} with secret {}",
            settings.address, settings.port, node_name, settings.secret
        );
        let mut connection = cm.connect(&settings.address, settings.port, settings.secret)?;

        let grants = RegisteredBuffer::register(
            Buffer::zeroed(recv_slots * LeaseGrant::WIRE_SIZE),
            cm,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        )?;
        let wrs: Vec<RecvWr> = (0..recv_slots)
            .map(|i| RecvWr {
                wr_id: i as u64,
                addr: grants.addr() + (i * LeaseGrant::WIRE_SIZE) as u64,
                length: LeaseGrant::WIRE_SIZE as u32,
                lkey: grants.lkey(),
            })
            .collect();
        connection.post_recv(&wrs)?;

        Ok(ResourceManagerConnection {
            connection,
            grants,
            spent_slots: Vec::with_capacity(recv_slots),
            recv_slots,
        })
    }

    /// A handle that can unblock a concurrent event wait, for shutdown.
    pub fn waker(&self) -> Box<dyn EventWaker> {
        self.connection.waker()
    }

    fn decode_slot(&self, wr_id: u64) -> Option<LeaseGrant> {
        let idx = usize::try_from(wr_id).ok()?;
        if idx >= self.recv_slots {
            return None;
        }
        let offset = idx * LeaseGrant::WIRE_SIZE;
        let slot = &self.grants.as_slice()[offset..offset + LeaseGrant::WIRE_SIZE];
        Some(LeaseGrant::decode_from(slot))
    }

    fn release_slot(&mut self, wr_id: u64) {
        self.spent_slots.push(wr_id);
    }

    fn refill(&mut self) -> rdma::Result<()> {
        if self.spent_slots.is_empty() {
            return Ok(());
        }
        let wrs: Vec<RecvWr> = self
            .spent_slots
            .iter()
            .map(|&wr_id| RecvWr {
                wr_id,
                addr: self.grants.addr() + wr_id * LeaseGrant::WIRE_SIZE as u64,
                length: LeaseGrant::WIRE_SIZE as u32,
                lkey: self.grants.lkey(),
            })
            .collect();
        self.connection.post_recv(&wrs)?;
        self.spent_slots.clear();
        Ok(())
    }
}

pub struct ResourceManagerPoller {
    connection: ResourceManagerConnection,
    shutdown: Arc<AtomicBool>,
    completions: Vec<WorkCompletion>,
}

impl ResourceManagerPoller {
    pub fn new(connection: ResourceManagerConnection, shutdown: Arc<AtomicBool>) -> Self {
        ResourceManagerPoller {
            connection,
            shutdown,
            completions: Vec::with_capacity(16),
        }
    }

    pub fn waker(&self) -> Box<dyn EventWaker> {
        self.connection.waker()
    }

    pub fn run(&mut self) {
        if let Err(e) = self.connection.connection.notify_events() {
            error!("arming the resource manager completion channel failed: {}", e);
            return;
        }
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.connection.connection.wait_events() {
                Ok(WaitEvent::Ready) => {
                    if let Err(e) = self.drain_once() {
                        error!("draining lease grants failed: {}", e);
                    }
                }
                // A waker fired; the loop condition re-checks shutdown.
                Ok(WaitEvent::Interrupted) => continue,
                Err(rdma::Error::ChannelClosed) => {
                    debug!("resource manager completion channel closed");
                    break;
                }
                Err(e) => {
                    error!("waiting for resource manager events failed: {}", e);
                    break;
                }
            }
        }
        info!("resource manager poller stops waiting for events");
    }

    /// Acknowledge the event, reap every ready lease grant, refill the
    /// receive slots and re-arm the channel.
    pub fn drain_once(&mut self) -> rdma::Result<()> {
        self.connection.connection.ack_events(1)?;

        self.completions.clear();
        self.connection
            .connection
            .poll_recv(&mut self.completions)?;
        for i in 0..self.completions.len() {
            let wc = self.completions[i];
            if wc.status != 0 {
                error!("lease grant completion failed with status {}", wc.status);
                self.connection.release_slot(wc.wr_id);
                continue;
            }
            // The grants are recorded in the log only; routing them into
            // scheduling decisions is a hook that is not wired up yet.
            match self.connection.decode_slot(wc.wr_id) {
                Some(grant) => info!(
                    "received lease {}: {} cores, {} memory",
                    grant.lease_id, grant.cores, grant.memory
                ),
                None => error!(
                    "lease grant completion with out-of-range work request id {}",
                    wc.wr_id
                ),
            }
            self.connection.release_slot(wc.wr_id);
        }

        self.connection.refill()?;
        self.connection.connection.notify_events()?;
        Ok(())
    }
}
