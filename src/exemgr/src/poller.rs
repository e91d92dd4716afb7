//! The RDMA poller: the single writer of the client registry.
//!
//! One iteration takes control messages from the listener, drains every
//! client's receive completions, spawns or tears down executors, refills the
//! receive queues and reaps exited executors. All registry mutation happens
//! on this thread, so the registry itself needs no lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use minstant::Instant;

use rdma::{Connection, RdmaCm, WorkCompletion};

use crate::client::{Client, ClientRegistry, DisableReason};
use crate::config::{SecondAllocationPolicy, Settings};
use crate::executor::{ExecutorLauncher, ManagerConnection};
use crate::manager::POLLING_TIMEOUT;
use crate::queue::{ControlReceiver, Operation, Payload};

pub struct RdmaPoller {
    cm: Arc<dyn RdmaCm>,
    control: ControlReceiver,
    registry: ClientRegistry,
    launcher: Box<dyn ExecutorLauncher>,
    settings: Settings,
    shutdown: Arc<AtomicBool>,
    // Scratch space reused across iterations.
    completions: Vec<WorkCompletion>,
    removals: Vec<u32>,
}

impl RdmaPoller {
    pub fn new(
        cm: Arc<dyn RdmaCm>,
        control: ControlReceiver,
        launcher: Box<dyn ExecutorLauncher>,
        settings: Settings,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        RdmaPoller {
            cm,
            control,
            registry: ClientRegistry::new(),
            launcher,
            settings,
            shutdown,
            completions: Vec::with_capacity(64),
            removals: Vec::new(),
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            self.poll_once();
        }
        info!("rdma poller stops processing events");
        for client in self.registry.iter_mut() {
            client.disable(DisableReason::Shutdown);
        }
        self.registry.clear();
    }

    /// One full iteration: control intake, then the per-client scan.
    pub fn poll_once(&mut self) {
        self.control_intake();
        self.drain_clients();
    }

    /// Consume at most one control message. With an empty registry there is
    /// nothing to scan, so this blocks with a timeout instead of spinning;
    /// otherwise it only glances at the queue. The head message is inspected
    /// before it is taken: a new client stays queued while the registry is
    /// at capacity.
    fn control_intake(&mut self) {
        let available = if self.registry.is_empty() {
            self.control.wait_timeout(POLLING_TIMEOUT)
        } else {
            self.control.peek().is_some()
        };
        if !available {
            return;
        }

        if let Some(msg) = self.control.peek() {
            if msg.op == Operation::Connect
                && matches!(msg.payload, Payload::NewClient(_))
                && self.registry.len() >= self.settings.max_clients
            {
                debug!(
                    "registry at capacity ({}), new client stays queued",
                    self.registry.len()
                );
                return;
            }
        }

        let msg = match self.control.pop() {
            Some(msg) => msg,
            None => return,
        };
        match (msg.op, msg.payload) {
            (Operation::Connect, Payload::NewClient(client)) => self.connect_client(*client),
            (Operation::Connect, Payload::Connection(conn)) => self.connect_executor(conn),
            (Operation::Disconnect, Payload::Connection(conn)) => self.disconnect(conn),
            (Operation::Disconnect, Payload::NewClient(client)) => {
                warn!(
                    "unexpected disconnect payload for new client {}",
                    client.qp_num()
                );
            }
        }
    }

    fn connect_client(&mut self, mut client: Client) {
        let qp_num = client.qp_num();
        match client.connection_mut() {
            Some(conn) => {
                if let Err(e) = self.cm.accept(conn) {
                    error!("accepting client {} failed: {}", qp_num, e);
                    return;
                }
            }
            None => {
                warn!("new client {} arrived without a connection", qp_num);
                return;
            }
        }
        debug!("accepted a new client, qp_num {}", qp_num);
        if let Some(displaced) = self.registry.insert(client) {
            warn!(
                "client {} displaced an existing registry entry",
                displaced.qp_num()
            );
        }
    }

    /// An executor dialed back; its private data names the client it serves.
    fn connect_executor(&mut self, mut conn: Box<dyn Connection>) {
        let target = conn.private_data();
        let client = match self.registry.get_mut(target) {
            Some(client) => client,
            None => {
                debug!("rejecting executor for unknown client {}", target);
                if let Err(e) = self.cm.reject(conn) {
                    error!("rejecting executor connection failed: {}", e);
                }
                return;
            }
        };
        if let Err(e) = self.cm.accept(conn.as_mut()) {
            error!("accepting executor for client {} failed: {}", target, e);
            return;
        }
        debug!("accepted a new executor for client {}", target);
        match client.executor_mut() {
            Some(executor) => executor.attach_back_channel(conn),
            None => warn!(
                "executor back-channel for client {} without a pending executor",
                target
            ),
        }
    }

    fn disconnect(&mut self, conn: Box<dyn Connection>) {
        let qp_num = conn.qp_num();
        if self.registry.remove(qp_num).is_some() {
            debug!("disconnecting client {}", qp_num);
        } else {
            debug!("disconnect for unknown client {}", qp_num);
        }
    }

    fn drain_clients(&mut self) {
        for client in self.registry.iter_mut() {
            let qp_num = client.qp_num();

            self.completions.clear();
            if let Err(e) = client.poll_recv(&mut self.completions) {
                error!("polling receives of client {} failed: {}", qp_num, e);
            }

            for i in 0..self.completions.len() {
                let wc = self.completions[i];
                if wc.status != 0 {
                    error!(
                        "receive completion failed with status {} at client {}",
                        wc.status, qp_num
                    );
                    client.release_slot(wc.wr_id);
                    continue;
                }
                let request = match client.decode_slot(wc.wr_id) {
                    Some(request) => request,
                    None => {
                        error!(
                            "completion with out-of-range work request id {} at client {}",
                            wc.wr_id, qp_num
                        );
                        continue;
                    }
                };
                client.release_slot(wc.wr_id);

                if request.cores > 0 {
                    info!(
                        "client {} requests an executor with {} cores, it should connect to \
                         {}:{}, buffer of size {}, function buffer {}, hot timeout {}",
                        qp_num,
                        request.cores,
                        request.listen_address_str(),
                        request.listen_port,
                        request.input_buf_size,
                        request.func_buf_size,
                        request.hot_timeout
                    );

                    if client.has_executor() {
                        match self.settings.second_allocation {
                            SecondAllocationPolicy::Deny => {
                                warn!(
                                    "client {} already has an executor, request denied",
                                    qp_num
                                );
                                continue;
                            }
                            SecondAllocationPolicy::Replace => {
                                client.accrue_executor_time(Instant::now());
                                client.clear_executor();
                            }
                        }
                    }

                    let (accounting_addr, accounting_rkey) = client.accounting_remote();
                    let mgr = ManagerConnection {
                        address: self.settings.device_address.clone(),
                        port: self.settings.device_port,
                        secret: qp_num,
                        accounting_addr,
                        accounting_rkey,
                    };
                    let begin = Instant::now();
                    match self.launcher.spawn(&request, &mgr) {
                        Ok(executor) => {
                            info!(
                                "client {} at {}:{} has executor with {} ID and {} cores, \
                                 time {} us",
                                qp_num,
                                request.listen_address_str(),
                                request.listen_port,
                                executor.id(),
                                request.cores,
                                begin.elapsed().as_micros()
                            );
                            client.set_executor(executor);
                        }
                        Err(e) => {
                            error!("spawning executor for client {} failed: {}", qp_num, e);
                        }
                    }
                } else {
                    info!("client {} disconnects", qp_num);
                    client.accrue_executor_time(Instant::now());
                    client.disable(DisableReason::ClientRequested);
                    self.removals.push(qp_num);
                    break;
                }
            }

            if !client.active() {
                continue;
            }

            if let Err(e) = client.refill() {
                error!("refilling receive queue of client {} failed: {}", qp_num, e);
            }

            let status = match client.executor_mut() {
                Some(executor) => executor.check(),
                None => continue,
            };
            if status.is_running() {
                continue;
            }
            client.accrue_executor_time(Instant::now());
            let accounting = client.accounting();
            info!(
                "executor at client {} exited, status {}, time allocated {} us, \
                 polling {} us, execution {} us",
                qp_num,
                status.code(),
                client.allocation_time_us(),
                accounting.hot_polling_ns as f64 / 1000.0,
                accounting.execution_ns as f64 / 1000.0
            );
            client.clear_executor();
        }

        for qp_num in self.removals.drain(..) {
            debug!("removing client {}", qp_num);
            self.registry.remove(qp_num);
        }
    }
}
