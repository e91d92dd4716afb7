//! Connection listener: drains connection-management events and turns them
//! into control messages for the RDMA poller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdma::{CmEvent, ConnectionStatus, RdmaCm};

use crate::client::Client;
use crate::manager::POLLING_TIMEOUT;
use crate::queue::{ControlMessage, ControlSender, Operation, Payload, SendTimeoutError};

pub struct Listener {
    cm: Arc<dyn RdmaCm>,
    queue: ControlSender,
    recv_slots: usize,
    shutdown: Arc<AtomicBool>,
}

impl Listener {
    pub fn new(
        cm: Arc<dyn RdmaCm>,
        queue: ControlSender,
        recv_slots: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Listener {
            cm,
            queue,
            recv_slots,
            shutdown,
        }
    }

    pub fn run(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.poll_once(POLLING_TIMEOUT);
        }
        info!("listener stops waiting for connection events");
    }

    /// Process at most one connection-management event.
    pub fn poll_once(&self, timeout: Duration) {
        let event = match self.cm.poll_cm_event(timeout) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                error!("polling connection events failed: {}", e);
                return;
            }
        };
        self.handle_event(event);
    }

    fn handle_event(&self, event: CmEvent) {
        match event.status {
            ConnectionStatus::Disconnected => {
                debug!("disconnect on connection {}", event.connection.qp_num());
                self.enqueue(ControlMessage::new(
                    Operation::Disconnect,
                    Payload::Connection(event.connection),
                ));
            }
            ConnectionStatus::Requested => self.handle_request(event.connection),
            ConnectionStatus::Established => {
                // Nothing to do: the transition is driven by the poller's
                // accept.
                debug!(
                    "connection {} established, private data {}",
                    event.connection.qp_num(),
                    event.connection.private_data()
                );
            }
        }
    }

    fn handle_request(&self, connection: Box<dyn rdma::Connection>) {
        let secret = connection.private_data();
        if secret != 0 {
            // An executor dialing back; the poller resolves the secret
            // against the registry and accepts or rejects.
            debug!(
                "connection request {} with secret {}",
                connection.qp_num(),
                secret
            );
            self.enqueue(ControlMessage::new(
                Operation::Connect,
                Payload::Connection(connection),
            ));
            return;
        }

        // A brand-new client. The receive queue is primed here, before the
        // poller accepts: the client may send the moment it observes the
        // connection as established.
        match Client::new(connection, &*self.cm, self.recv_slots) {
            Ok(client) => {
                debug!("new client request, qp_num {}", client.qp_num());
                self.enqueue(ControlMessage::new(
                    Operation::Connect,
                    Payload::NewClient(Box::new(client)),
                ));
            }
            Err(e) => {
                error!("{}", e);
                if let Err(reject_err) = self.cm.reject(e.connection) {
                    error!("rejecting failed client connection: {}", reject_err);
                }
            }
        }
    }

    /// Enqueue a control message, blocking in bounded steps so shutdown
    /// stays prompt even when the queue is full.
    fn enqueue(&self, msg: ControlMessage) {
        let mut msg = msg;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("dropping control message at shutdown: {:?}", msg);
                return;
            }
            match self.queue.send_timeout(msg, POLLING_TIMEOUT) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(m)) => msg = m,
                Err(SendTimeoutError::Disconnected(m)) => {
                    warn!("control queue consumer is gone, dropping {:?}", m);
                    return;
                }
            }
        }
    }
}
