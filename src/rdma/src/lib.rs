//! Contract between the executor manager and the RDMA substrate.
//!
//! The manager consumes connection-management events, per-queue-pair receive
//! operations and memory registration from an underlying RDMA library. This
//! crate pins that boundary down as object-safe traits so the manager moves
//! owned connection handles between its threads without knowing which binding
//! produced them. The production binding wraps librdmacm/libibverbs and lives
//! with the rest of the platform; the manager's test suite provides a
//! deterministic in-process implementation.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub mod mr;

pub use mr::{AccessFlags, Buffer, RegisteredBuffer, RegisteredMemory};

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection management: {0}")]
    Cm(#[source] io::Error),
    #[error("verbs: {0}")]
    Verbs(#[source] io::Error),
    #[error("memory registration: {0}")]
    Registration(#[source] io::Error),
    #[error("completion channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// State reported by the connection-management event pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Requested,
    Established,
    Disconnected,
}

/// A connection-management event together with the connection it concerns.
///
/// For `Requested` the handle is freshly created by the substrate and the
/// receiver takes ownership. For `Disconnected` the substrate hands out an
/// alias of a handle it produced earlier; only the identifying accessors are
/// meaningful on it.
pub struct CmEvent {
    pub connection: Box<dyn Connection>,
    pub status: ConnectionStatus,
}

/// A receive work request: one fixed-size slot of registered memory.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: u64,
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// A reaped work completion. `status` is zero on success.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: u32,
    pub byte_len: u32,
}

/// Outcome of a blocking completion-channel wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// The completion channel fired; completions are ready to be reaped.
    Ready,
    /// A [`EventWaker`] unblocked the wait. The caller should re-check its
    /// shutdown condition before waiting again.
    Interrupted,
}

/// Thread-safe handle that unblocks a concurrent [`Connection::wait_events`].
pub trait EventWaker: Send + Sync {
    fn wake(&self);
}

/// One RDMA connection, owned by whoever currently drives it.
pub trait Connection: Send {
    /// Queue-pair number of this connection. Valid from the moment the
    /// connection request surfaces, before any accept.
    fn qp_num(&self) -> u32;

    /// The 32 bits of application private data carried in the connection
    /// request.
    fn private_data(&self) -> u32;

    /// Post a batch of receive work requests.
    fn post_recv(&mut self, wrs: &[RecvWr]) -> Result<()>;

    /// Drain ready receive completions without blocking, appending them to
    /// `completions`.
    fn poll_recv(&mut self, completions: &mut Vec<WorkCompletion>) -> Result<()>;

    /// Arm the completion channel so the next completion produces an event.
    fn notify_events(&mut self) -> Result<()>;

    /// Block until the completion channel fires or a waker interrupts the
    /// wait. Returns [`Error::ChannelClosed`] once the channel is gone.
    fn wait_events(&mut self) -> Result<WaitEvent>;

    /// Acknowledge `count` completion-channel events.
    fn ack_events(&mut self, count: u32) -> Result<()>;

    /// A handle other threads can use to unblock [`Connection::wait_events`].
    fn waker(&self) -> Box<dyn EventWaker>;

    /// Initiate a disconnect of the remote peer.
    fn disconnect(&mut self) -> Result<()>;
}

/// The passive (listening) side of the substrate plus the operations that are
/// documented thread-safe: accept, reject, outbound connect and memory
/// registration.
pub trait RdmaCm: Send + Sync {
    /// Wait up to `timeout` for the next connection-management event.
    /// `Ok(None)` means the timeout elapsed without an event.
    fn poll_cm_event(&self, timeout: Duration) -> Result<Option<CmEvent>>;

    /// Accept a requested connection. Thread-safe.
    fn accept(&self, conn: &mut dyn Connection) -> Result<()>;

    /// Reject and dispose of a requested connection. Thread-safe.
    fn reject(&self, conn: Box<dyn Connection>) -> Result<()>;

    /// Dial out to a remote listener, carrying `private_data` in the
    /// connection request.
    fn connect(&self, addr: &str, port: u16, private_data: u32) -> Result<Box<dyn Connection>>;

    /// Register `buf` with the protection domain of this listener.
    fn register(&self, buf: &mut Buffer, access: AccessFlags) -> Result<Box<dyn RegisteredMemory>>;
}
