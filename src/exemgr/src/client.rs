//! Per-client state and the registry the RDMA poller owns.

use std::fmt;

use fnv::FnvHashMap;
use minstant::Instant;

use rdma::{AccessFlags, Buffer, Connection, RdmaCm, RecvWr, RegisteredBuffer, WorkCompletion};

use crate::executor::ActiveExecutor;
use crate::wire::{Accounting, AllocationRequest};

/// Why a client is being disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    /// The client sent a tear-down allocation request.
    ClientRequested,
    /// The manager is shutting down.
    Shutdown,
}

/// Error from [`Client::new`]. Hands the connection back so the caller can
/// reject it.
pub struct ClientSetupError {
    pub connection: Box<dyn Connection>,
    pub source: rdma::Error,
}

impl fmt::Debug for ClientSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSetupError")
            .field("qp_num", &self.connection.qp_num())
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for ClientSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to set up client resources: {}", self.source)
    }
}

impl std::error::Error for ClientSetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// The authoritative record for one connected tenant.
///
/// Field order is deliberate: the executor handle (and any back-channel it
/// owns) drops before the front connection, and both drop before the
/// remotely writable regions they may still reference.
pub struct Client {
    qp_num: u32,
    executor: Option<Box<dyn ActiveExecutor>>,
    connection: Option<Box<dyn Connection>>,
    allocation_requests: RegisteredBuffer,
    accounting: RegisteredBuffer,
    // Receive slots consumed since the last refill, by work-request id.
    spent_slots: Vec<u64>,
    recv_slots: usize,
    allocation_time_us: u64,
}

impl Client {
    /// Prepare a client for a requested front connection: register the
    /// allocation-request slots and the accounting region, then prime the
    /// receive queue. Priming must complete before the connection is
    /// accepted, otherwise an eager client could send into an empty queue.
    pub fn new(
        mut connection: Box<dyn Connection>,
        cm: &dyn RdmaCm,
        recv_slots: usize,
    ) -> Result<Client, ClientSetupError> {
        assert!(recv_slots > 0);

        let requests = Buffer::zeroed(recv_slots * AllocationRequest::WIRE_SIZE);
        let allocation_requests = match RegisteredBuffer::register(
            requests,
            cm,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        ) {
            Ok(buf) => buf,
            Err(source) => return Err(ClientSetupError { connection, source }),
        };

        let accounting = match RegisteredBuffer::register(
            Buffer::zeroed(Accounting::WIRE_SIZE),
            cm,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC,
        ) {
            Ok(buf) => buf,
            Err(source) => return Err(ClientSetupError { connection, source }),
        };

        let wrs: Vec<RecvWr> = (0..recv_slots)
            .map(|i| RecvWr {
                wr_id: i as u64,
                addr: allocation_requests.addr() + (i * AllocationRequest::WIRE_SIZE) as u64,
                length: AllocationRequest::WIRE_SIZE as u32,
                lkey: allocation_requests.lkey(),
            })
            .collect();
        if let Err(source) = connection.post_recv(&wrs) {
            return Err(ClientSetupError { connection, source });
        }

        Ok(Client {
            qp_num: connection.qp_num(),
            executor: None,
            connection: Some(connection),
            allocation_requests,
            accounting,
            spent_slots: Vec::with_capacity(recv_slots),
            recv_slots,
            allocation_time_us: 0,
        })
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// A client is active while it still holds its front connection.
    #[inline]
    pub fn active(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_mut(&mut self) -> Option<&mut dyn Connection> {
        match self.connection {
            Some(ref mut c) => Some(c.as_mut()),
            None => None,
        }
    }

    /// Drain receive completions from the front connection, appending to
    /// `completions`.
    pub fn poll_recv(&mut self, completions: &mut Vec<WorkCompletion>) -> rdma::Result<()> {
        match self.connection.as_deref_mut() {
            Some(conn) => conn.poll_recv(completions),
            None => Ok(()),
        }
    }

    /// Decode the allocation-request slot a completion points at. `None` if
    /// the work-request id is outside the slot range.
    pub fn decode_slot(&self, wr_id: u64) -> Option<AllocationRequest> {
        let idx = usize::try_from(wr_id).ok()?;
        if idx >= self.recv_slots {
            return None;
        }
        let offset = idx * AllocationRequest::WIRE_SIZE;
        let slot = &self.allocation_requests.as_slice()[offset..offset + AllocationRequest::WIRE_SIZE];
        Some(AllocationRequest::decode_from(slot))
    }

    /// Mark a receive slot as consumed; it is reposted on the next refill.
    pub fn release_slot(&mut self, wr_id: u64) {
        self.spent_slots.push(wr_id);
    }

    /// Repost every consumed receive slot.
    pub fn refill(&mut self) -> rdma::Result<()> {
        if self.spent_slots.is_empty() {
            return Ok(());
        }
        let conn = match self.connection.as_deref_mut() {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let wrs: Vec<RecvWr> = self
            .spent_slots
            .iter()
            .map(|&wr_id| RecvWr {
                wr_id,
                addr: self.allocation_requests.addr()
                    + wr_id * AllocationRequest::WIRE_SIZE as u64,
                length: AllocationRequest::WIRE_SIZE as u32,
                lkey: self.allocation_requests.lkey(),
            })
            .collect();
        conn.post_recv(&wrs)?;
        self.spent_slots.clear();
        Ok(())
    }

    #[inline]
    pub fn has_executor(&self) -> bool {
        self.executor.is_some()
    }

    pub fn executor_mut(&mut self) -> Option<&mut Box<dyn ActiveExecutor>> {
        self.executor.as_mut()
    }

    pub fn set_executor(&mut self, executor: Box<dyn ActiveExecutor>) {
        self.executor = Some(executor);
    }

    pub fn clear_executor(&mut self) -> Option<Box<dyn ActiveExecutor>> {
        self.executor.take()
    }

    /// Add the current executor's wall time since its allocation finished to
    /// this client's total. Called before the handle is replaced, reaped or
    /// torn down.
    pub fn accrue_executor_time(&mut self, now: Instant) {
        if let Some(executor) = &self.executor {
            let spent = now.duration_since(executor.allocation_finished());
            self.allocation_time_us += spent.as_micros() as u64;
        }
    }

    #[inline]
    pub fn allocation_time_us(&self) -> u64 {
        self.allocation_time_us
    }

    /// Read the executor-written accounting counters.
    pub fn accounting(&self) -> Accounting {
        Accounting::load_from(self.accounting.as_slice())
    }

    /// Address and remote key of the accounting region, as handed to a
    /// spawned executor.
    pub fn accounting_remote(&self) -> (u64, u32) {
        (self.accounting.addr(), self.accounting.rkey())
    }

    /// Disconnect the front connection and deactivate the client. The
    /// executor handle, if any, is left to be dropped with the record; the
    /// process is never killed.
    pub fn disable(&mut self, reason: DisableReason) {
        debug!("disabling client {} ({:?})", self.qp_num, reason);
        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = conn.disconnect() {
                warn!("disconnect of client {} failed: {}", self.qp_num, e);
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("qp_num", &self.qp_num)
            .field("active", &self.active())
            .field("executor", &self.executor.is_some())
            .field("allocation_time_us", &self.allocation_time_us)
            .finish()
    }
}

/// Queue-pair-number-keyed map of clients. Only the RDMA poller inserts or
/// erases; no other thread holds a reference.
#[derive(Default)]
pub struct ClientRegistry {
    clients: FnvHashMap<u32, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, qp_num: u32) -> bool {
        self.clients.contains_key(&qp_num)
    }

    /// Insert a client under its queue-pair number, returning a displaced
    /// record if the key was already present.
    pub fn insert(&mut self, client: Client) -> Option<Client> {
        self.clients.insert(client.qp_num(), client)
    }

    pub fn get(&self, qp_num: u32) -> Option<&Client> {
        self.clients.get(&qp_num)
    }

    pub fn get_mut(&mut self, qp_num: u32) -> Option<&mut Client> {
        self.clients.get_mut(&qp_num)
    }

    pub fn remove(&mut self, qp_num: u32) -> Option<Client> {
        self.clients.remove(&qp_num)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.clients.values_mut()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }
}
