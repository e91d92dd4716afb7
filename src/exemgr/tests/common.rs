//! Shared harness for the manager integration tests: a scripted in-process
//! substrate and a recording executor launcher, so the event flow of the
//! manager can be driven deterministically without RDMA hardware.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use minstant::Instant;

use exemgr::config::{ExecutorSettings, ResourceManagerSettings, Settings};
use exemgr::executor::{ActiveExecutor, ExecutorLauncher, ExecutorStatus, ManagerConnection};
use exemgr::wire::{Accounting, AllocationRequest, LeaseGrant};
use rdma::{
    AccessFlags, Buffer, CmEvent, Connection, ConnectionStatus, EventWaker, RdmaCm,
    RegisteredMemory, RecvWr, WaitEvent, WorkCompletion,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_settings() -> Settings {
    Settings {
        device_address: "192.168.0.1".into(),
        device_port: 10000,
        receive_buffer_size: 4,
        max_clients: 8,
        node_name: "node-0".into(),
        resource_manager: ResourceManagerSettings {
            address: "192.168.0.100".into(),
            port: 10005,
            secret: 0x1234,
        },
        executor: ExecutorSettings {
            path: "bin/executor".into(),
            repetitions: 100,
            warmup_iters: 10,
            recv_buffer_size: 32,
            max_inline_data: 128,
        },
        second_allocation: Default::default(),
    }
}

pub fn request(cores: i16) -> AllocationRequest {
    AllocationRequest {
        listen_address: AllocationRequest::pack_address("10.0.0.2"),
        listen_port: 9000,
        input_buf_size: 4096,
        func_buf_size: 4096,
        hot_timeout: 10,
        cores,
    }
}

struct WaitState {
    ready: usize,
    woken: bool,
    closed: bool,
}

/// State shared between a fake connection, the scripted substrate and the
/// test body.
pub struct ConnState {
    pub qp_num: u32,
    pub private_data: u32,
    posted: Mutex<Vec<RecvWr>>,
    completions: Mutex<VecDeque<WorkCompletion>>,
    posted_at_accept: AtomicUsize,
    disconnected: AtomicBool,
    notified: AtomicUsize,
    acked: AtomicUsize,
    wait: Mutex<WaitState>,
    wait_cv: Condvar,
}

impl ConnState {
    fn new(qp_num: u32, private_data: u32) -> Arc<Self> {
        Arc::new(ConnState {
            qp_num,
            private_data,
            posted: Mutex::new(Vec::new()),
            completions: Mutex::new(VecDeque::new()),
            posted_at_accept: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
            notified: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
            wait: Mutex::new(WaitState {
                ready: 0,
                woken: false,
                closed: false,
            }),
            wait_cv: Condvar::new(),
        })
    }

    pub fn posted_count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }

    /// Receive work requests that had been posted when the connection was
    /// accepted.
    pub fn posted_at_accept(&self) -> usize {
        self.posted_at_accept.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn notified(&self) -> usize {
        self.notified.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    fn posted_wr(&self, wr_id: u64) -> RecvWr {
        let posted = self.posted.lock().unwrap();
        *posted
            .iter()
            .rev()
            .find(|wr| wr.wr_id == wr_id)
            .unwrap_or_else(|| panic!("no receive posted for slot {}", wr_id))
    }

    /// Simulate the peer's send landing in a posted receive slot, followed
    /// by its completion.
    pub fn deliver_request(&self, slot: u64, request: &AllocationRequest) {
        let wr = self.posted_wr(slot);
        assert!(wr.length as usize >= AllocationRequest::WIRE_SIZE);
        let mut bytes = [0u8; AllocationRequest::WIRE_SIZE];
        request.encode_to(&mut bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), wr.addr as *mut u8, bytes.len());
        }
        self.complete(slot, 0, AllocationRequest::WIRE_SIZE as u32);
    }

    pub fn deliver_lease(&self, slot: u64, grant: &LeaseGrant) {
        let wr = self.posted_wr(slot);
        assert!(wr.length as usize >= LeaseGrant::WIRE_SIZE);
        let mut bytes = [0u8; LeaseGrant::WIRE_SIZE];
        grant.encode_to(&mut bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), wr.addr as *mut u8, bytes.len());
        }
        self.complete(slot, 0, LeaseGrant::WIRE_SIZE as u32);
    }

    /// Queue a bare completion, optionally failed.
    pub fn complete(&self, wr_id: u64, status: u32, byte_len: u32) {
        self.completions.lock().unwrap().push_back(WorkCompletion {
            wr_id,
            status,
            byte_len,
        });
    }

    /// Make the next completion-channel wait return ready.
    pub fn fire_event(&self) {
        let mut wait = self.wait.lock().unwrap();
        wait.ready += 1;
        self.wait_cv.notify_all();
    }

    /// Close the completion channel; pending and future waits fail.
    pub fn close_events(&self) {
        let mut wait = self.wait.lock().unwrap();
        wait.closed = true;
        self.wait_cv.notify_all();
    }
}

pub struct FakeConnection {
    state: Arc<ConnState>,
}

impl Connection for FakeConnection {
    fn qp_num(&self) -> u32 {
        self.state.qp_num
    }

    fn private_data(&self) -> u32 {
        self.state.private_data
    }

    fn post_recv(&mut self, wrs: &[RecvWr]) -> rdma::Result<()> {
        self.state.posted.lock().unwrap().extend_from_slice(wrs);
        Ok(())
    }

    fn poll_recv(&mut self, completions: &mut Vec<WorkCompletion>) -> rdma::Result<()> {
        completions.extend(self.state.completions.lock().unwrap().drain(..));
        Ok(())
    }

    fn notify_events(&mut self) -> rdma::Result<()> {
        self.state.notified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_events(&mut self) -> rdma::Result<WaitEvent> {
        let mut wait = self.state.wait.lock().unwrap();
        loop {
            if wait.closed {
                return Err(rdma::Error::ChannelClosed);
            }
            if wait.woken {
                wait.woken = false;
                return Ok(WaitEvent::Interrupted);
            }
            if wait.ready > 0 {
                wait.ready -= 1;
                return Ok(WaitEvent::Ready);
            }
            wait = self.state.wait_cv.wait(wait).unwrap();
        }
    }

    fn ack_events(&mut self, count: u32) -> rdma::Result<()> {
        self.state.acked.fetch_add(count as usize, Ordering::SeqCst);
        Ok(())
    }

    fn waker(&self) -> Box<dyn EventWaker> {
        Box::new(FakeWaker {
            state: self.state.clone(),
        })
    }

    fn disconnect(&mut self) -> rdma::Result<()> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeWaker {
    state: Arc<ConnState>,
}

impl EventWaker for FakeWaker {
    fn wake(&self) {
        let mut wait = self.state.wait.lock().unwrap();
        wait.woken = true;
        self.state.wait_cv.notify_all();
    }
}

struct FakeMr {
    addr: u64,
    key: u32,
}

impl RegisteredMemory for FakeMr {
    fn addr(&self) -> u64 {
        self.addr
    }
    fn lkey(&self) -> u32 {
        self.key
    }
    fn rkey(&self) -> u32 {
        self.key
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Registration {
    pub addr: u64,
    pub len: usize,
    pub rkey: u32,
    pub access: AccessFlags,
}

/// The scripted substrate: tests queue connection-management events and
/// observe accepts, rejects and registrations.
pub struct ScriptedCm {
    events: Mutex<VecDeque<CmEvent>>,
    states: Mutex<HashMap<u32, Arc<ConnState>>>,
    accepted: Mutex<Vec<u32>>,
    rejected: Mutex<Vec<u32>>,
    registrations: Mutex<Vec<Registration>>,
    next_key: AtomicU32,
    next_qp: AtomicU32,
}

impl ScriptedCm {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedCm {
            events: Mutex::new(VecDeque::new()),
            states: Mutex::new(HashMap::new()),
            accepted: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            next_key: AtomicU32::new(0),
            next_qp: AtomicU32::new(0x9000),
        })
    }

    /// Create the shared state for a connection the test will script.
    pub fn add_connection(&self, qp_num: u32, private_data: u32) -> Arc<ConnState> {
        let state = ConnState::new(qp_num, private_data);
        self.states.lock().unwrap().insert(qp_num, state.clone());
        state
    }

    fn push_event(&self, state: &Arc<ConnState>, status: ConnectionStatus) {
        self.events.lock().unwrap().push_back(CmEvent {
            connection: Box::new(FakeConnection {
                state: state.clone(),
            }),
            status,
        });
    }

    pub fn push_request(&self, state: &Arc<ConnState>) {
        self.push_event(state, ConnectionStatus::Requested);
    }

    pub fn push_established(&self, state: &Arc<ConnState>) {
        self.push_event(state, ConnectionStatus::Established);
    }

    pub fn push_disconnect(&self, state: &Arc<ConnState>) {
        self.push_event(state, ConnectionStatus::Disconnected);
    }

    pub fn accepted_qps(&self) -> Vec<u32> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn rejected_qps(&self) -> Vec<u32> {
        self.rejected.lock().unwrap().clone()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().unwrap().clone()
    }

    /// The state of the connection produced by the last dial-out.
    pub fn last_outbound(&self) -> Arc<ConnState> {
        let qp = self.next_qp.load(Ordering::SeqCst) - 1;
        self.states.lock().unwrap()[&qp].clone()
    }
}

impl RdmaCm for ScriptedCm {
    fn poll_cm_event(&self, timeout: Duration) -> rdma::Result<Option<CmEvent>> {
        if let Some(event) = self.events.lock().unwrap().pop_front() {
            return Ok(Some(event));
        }
        std::thread::sleep(timeout);
        Ok(self.events.lock().unwrap().pop_front())
    }

    fn accept(&self, conn: &mut dyn Connection) -> rdma::Result<()> {
        let qp_num = conn.qp_num();
        if let Some(state) = self.states.lock().unwrap().get(&qp_num) {
            state
                .posted_at_accept
                .store(state.posted_count(), Ordering::SeqCst);
        }
        self.accepted.lock().unwrap().push(qp_num);
        Ok(())
    }

    fn reject(&self, conn: Box<dyn Connection>) -> rdma::Result<()> {
        self.rejected.lock().unwrap().push(conn.qp_num());
        Ok(())
    }

    fn connect(
        &self,
        _addr: &str,
        _port: u16,
        private_data: u32,
    ) -> rdma::Result<Box<dyn Connection>> {
        let qp_num = self.next_qp.fetch_add(1, Ordering::SeqCst);
        let state = self.add_connection(qp_num, private_data);
        Ok(Box::new(FakeConnection { state }))
    }

    fn register(
        &self,
        buf: &mut Buffer,
        access: AccessFlags,
    ) -> rdma::Result<Box<dyn RegisteredMemory>> {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst) + 1;
        self.registrations.lock().unwrap().push(Registration {
            addr: buf.addr(),
            len: buf.len(),
            rkey: key,
            access,
        });
        Ok(Box::new(FakeMr {
            addr: buf.addr(),
            key,
        }))
    }
}

/// Writes accounting counters into the region an executor was handed,
/// release-fenced the way a remote write would become visible.
pub fn write_accounting(addr: u64, accounting: &Accounting) {
    let mut bytes = [0u8; Accounting::WIRE_SIZE];
    accounting.store_to(&mut bytes);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }
    std::sync::atomic::fence(Ordering::Release);
}

#[derive(Clone)]
pub struct FakeExecutorHandle {
    status: Arc<Mutex<ExecutorStatus>>,
    attached: Arc<AtomicBool>,
}

impl FakeExecutorHandle {
    pub fn set_status(&self, status: ExecutorStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn status(&self) -> ExecutorStatus {
        *self.status.lock().unwrap()
    }

    pub fn attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

struct FakeExecutor {
    id: i32,
    status: Arc<Mutex<ExecutorStatus>>,
    attached: Arc<AtomicBool>,
    allocation_begin: Instant,
    allocation_finished: Instant,
}

impl ActiveExecutor for FakeExecutor {
    fn id(&self) -> i32 {
        self.id
    }

    fn check(&mut self) -> ExecutorStatus {
        *self.status.lock().unwrap()
    }

    fn attach_back_channel(&mut self, _conn: Box<dyn Connection>) {
        self.attached.store(true, Ordering::SeqCst);
        self.allocation_finished = Instant::now();
    }

    fn allocation_begin(&self) -> Instant {
        self.allocation_begin
    }

    fn allocation_finished(&self) -> Instant {
        self.allocation_finished
    }
}

pub struct SpawnRecord {
    pub request: AllocationRequest,
    pub mgr: ManagerConnection,
    pub handle: FakeExecutorHandle,
}

#[derive(Default)]
struct LauncherInner {
    spawns: Mutex<Vec<SpawnRecord>>,
    fail_next: AtomicBool,
}

/// Launcher that records every spawn and hands back controllable fakes.
#[derive(Clone, Default)]
pub struct RecordingLauncher {
    inner: Arc<LauncherInner>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_spawn(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.spawns.lock().unwrap().len()
    }

    pub fn recorded(&self, index: usize) -> SpawnRecord {
        let spawns = self.inner.spawns.lock().unwrap();
        let record = &spawns[index];
        SpawnRecord {
            request: record.request.clone(),
            mgr: record.mgr.clone(),
            handle: record.handle.clone(),
        }
    }
}

impl ExecutorLauncher for RecordingLauncher {
    fn spawn(
        &self,
        request: &AllocationRequest,
        mgr: &ManagerConnection,
    ) -> io::Result<Box<dyn ActiveExecutor>> {
        if self.inner.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "fork failed"));
        }
        let mut spawns = self.inner.spawns.lock().unwrap();
        let id = 1000 + spawns.len() as i32;
        let handle = FakeExecutorHandle {
            status: Arc::new(Mutex::new(ExecutorStatus::Running)),
            attached: Arc::new(AtomicBool::new(false)),
        };
        spawns.push(SpawnRecord {
            request: request.clone(),
            mgr: mgr.clone(),
            handle: handle.clone(),
        });
        let now = Instant::now();
        Ok(Box::new(FakeExecutor {
            id,
            status: handle.status.clone(),
            attached: handle.attached.clone(),
            allocation_begin: now,
            allocation_finished: now,
        }))
    }
}
