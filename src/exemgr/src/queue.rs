//! Bounded control channel between the connection listener and the RDMA
//! poller.
//!
//! Producers block when the queue is full (in bounded steps, so they can
//! re-check a shutdown flag). The single consumer can look at the head
//! message without committing to it, which lets the poller defer a message
//! it cannot act on yet, such as a new client arriving while the registry is
//! at capacity.

use std::fmt;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use rdma::Connection;

use crate::client::Client;

/// Default depth of the control queue.
pub const CONTROL_QUEUE_DEPTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
}

pub enum Payload {
    /// A fully prepared client record for a brand-new front connection.
    NewClient(Box<Client>),
    /// A bare connection: an executor back-channel on `Connect`, the
    /// affected connection on `Disconnect`.
    Connection(Box<dyn Connection>),
}

pub struct ControlMessage {
    pub op: Operation,
    pub payload: Payload,
}

impl ControlMessage {
    pub fn new(op: Operation, payload: Payload) -> Self {
        ControlMessage { op, payload }
    }
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::NewClient(client) => {
                write!(f, "{:?}/NewClient(qp {})", self.op, client.qp_num())
            }
            Payload::Connection(conn) => {
                write!(f, "{:?}/Connection(qp {})", self.op, conn.qp_num())
            }
        }
    }
}

/// Error from [`ControlSender::send_timeout`].
#[derive(Debug)]
pub enum SendTimeoutError {
    /// The queue stayed full for the whole timeout; the message is returned.
    Timeout(ControlMessage),
    /// The consumer is gone; the message is returned.
    Disconnected(ControlMessage),
}

pub fn control_queue(capacity: usize) -> (ControlSender, ControlReceiver) {
    let (tx, rx) = channel::bounded(capacity);
    (
        ControlSender { tx },
        ControlReceiver { rx, peeked: None },
    )
}

#[derive(Clone)]
pub struct ControlSender {
    tx: Sender<ControlMessage>,
}

impl ControlSender {
    /// Enqueue, blocking for at most `timeout` if the queue is full.
    pub fn send_timeout(
        &self,
        msg: ControlMessage,
        timeout: Duration,
    ) -> Result<(), SendTimeoutError> {
        self.tx.send_timeout(msg, timeout).map_err(|e| match e {
            channel::SendTimeoutError::Timeout(m) => SendTimeoutError::Timeout(m),
            channel::SendTimeoutError::Disconnected(m) => SendTimeoutError::Disconnected(m),
        })
    }
}

pub struct ControlReceiver {
    rx: Receiver<ControlMessage>,
    // Single-consumer stash backing `peek`: a message pulled out of the
    // channel but not yet consumed.
    peeked: Option<ControlMessage>,
}

impl ControlReceiver {
    /// Look at the head message without consuming it.
    pub fn peek(&mut self) -> Option<&ControlMessage> {
        if self.peeked.is_none() {
            self.peeked = self.rx.try_recv().ok();
        }
        self.peeked.as_ref()
    }

    /// Consume the head message, if any.
    pub fn pop(&mut self) -> Option<ControlMessage> {
        self.peeked.take().or_else(|| self.rx.try_recv().ok())
    }

    /// Block for at most `timeout` until a message is available. The message
    /// stays at the head (observable via `peek`, consumable via `pop`).
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        if self.peeked.is_some() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => {
                self.peeked = Some(msg);
                true
            }
            Err(_) => false,
        }
    }

    /// Messages currently queued, including a peeked one.
    pub fn len(&self) -> usize {
        self.rx.len() + usize::from(self.peeked.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
