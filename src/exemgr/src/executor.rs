//! Executor processes: the polymorphic handle the poller tracks, and the
//! fork/exec launcher that creates them.

use std::ffi::CString;
use std::io;
use std::process;

use minstant::Instant;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execv, fork, getpid, ForkResult, Pid};

use rdma::Connection;

use crate::config::ExecutorSettings;
use crate::wire::AllocationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStatus {
    Running,
    /// The process exited on its own; carries the exit code.
    Finished(i32),
    /// The process was killed or could not be observed; carries the signal
    /// number, or -1 when the cause is unknown.
    FinishedFail(i32),
}

impl ExecutorStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ExecutorStatus::Running)
    }

    /// The exit code or signal number, for logging.
    pub fn code(&self) -> i32 {
        match *self {
            ExecutorStatus::Running => 0,
            ExecutorStatus::Finished(code) => code,
            ExecutorStatus::FinishedFail(code) => code,
        }
    }
}

/// Manager-side connection parameters handed to a spawned executor so it can
/// dial back and account its usage remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConnection {
    pub address: String,
    pub port: u16,
    /// The target client's queue-pair number; the executor echoes it in the
    /// private data of its back-connection.
    pub secret: u32,
    pub accounting_addr: u64,
    pub accounting_rkey: u32,
}

/// A live executor owned by exactly one client record.
pub trait ActiveExecutor: Send {
    /// Opaque identifier, the child pid for process executors.
    fn id(&self) -> i32;

    /// Non-blocking status probe. Terminal results are sticky.
    fn check(&mut self) -> ExecutorStatus;

    /// Hand over the executor's accepted back-connection and stamp the end
    /// of the allocation phase.
    fn attach_back_channel(&mut self, conn: Box<dyn Connection>);

    fn allocation_begin(&self) -> Instant;

    fn allocation_finished(&self) -> Instant;
}

/// Spawns executors for allocation requests.
pub trait ExecutorLauncher: Send + Sync {
    fn spawn(
        &self,
        request: &AllocationRequest,
        mgr: &ManagerConnection,
    ) -> io::Result<Box<dyn ActiveExecutor>>;
}

/// Builds the executor argument vector, `argv[0]` included.
pub fn executor_argv(
    request: &AllocationRequest,
    exec: &ExecutorSettings,
    mgr: &ManagerConnection,
) -> io::Result<Vec<CString>> {
    let path = exec.path.to_string_lossy().into_owned();
    let args = [
        path,
        "-a".into(),
        request.listen_address_str().into(),
        "-p".into(),
        request.listen_port.to_string(),
        "--polling-mgr".into(),
        "thread".into(),
        "-r".into(),
        exec.repetitions.to_string(),
        "-x".into(),
        exec.recv_buffer_size.to_string(),
        "-s".into(),
        request.input_buf_size.to_string(),
        "--fast".into(),
        request.cores.to_string(),
        "--warmup-iters".into(),
        exec.warmup_iters.to_string(),
        "--max-inline-data".into(),
        exec.max_inline_data.to_string(),
        "--func-size".into(),
        request.func_buf_size.to_string(),
        "--timeout".into(),
        request.hot_timeout.to_string(),
        "--mgr-address".into(),
        mgr.address.clone(),
        "--mgr-port".into(),
        mgr.port.to_string(),
        "--mgr-secret".into(),
        mgr.secret.to_string(),
        "--mgr-buf-addr".into(),
        mgr.accounting_addr.to_string(),
        "--mgr-buf-rkey".into(),
        mgr.accounting_rkey.to_string(),
    ];
    args.into_iter()
        .map(|arg| {
            CString::new(arg).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
        })
        .collect()
}

/// An executor running as a forked child process.
pub struct ProcessExecutor {
    pid: Pid,
    allocation_begin: Instant,
    allocation_finished: Instant,
    back_channel: Option<Box<dyn Connection>>,
    exit_status: Option<ExecutorStatus>,
}

impl ProcessExecutor {
    /// Fork and exec the executor binary. The child's stdout and stderr go
    /// to `executor_<pid>` in the current working directory.
    pub fn spawn(
        request: &AllocationRequest,
        exec: &ExecutorSettings,
        mgr: &ManagerConnection,
    ) -> io::Result<ProcessExecutor> {
        let argv = executor_argv(request, exec, mgr)?;
        let begin = Instant::now();
        // Safety: the child only redirects its output and execs.
        match unsafe { fork() }.map_err(io::Error::from)? {
            ForkResult::Child => Self::exec_child(&argv),
            ForkResult::Parent { child } => Ok(ProcessExecutor {
                pid: child,
                allocation_begin: begin,
                // Updated when the back-channel is attached.
                allocation_finished: begin,
                back_channel: None,
                exit_status: None,
            }),
        }
    }

    fn exec_child(argv: &[CString]) -> ! {
        let out_file = format!("executor_{}", getpid());
        match open(
            out_file.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => {
                let _ = dup2(fd, 1);
                let _ = dup2(fd, 2);
            }
            Err(e) => {
                error!("failed to open executor output file {}: {}", out_file, e);
            }
        }
        // execv only returns on failure
        let err = execv(&argv[0], argv);
        error!(
            "executor process failed to start: {:?}",
            err.expect_err("execv returned without error")
        );
        process::exit(1);
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the executor's back-connection has been attached. The handle
    /// keeps the connection alive for as long as it owns it.
    pub fn back_channel_attached(&self) -> bool {
        self.back_channel.is_some()
    }
}

impl ActiveExecutor for ProcessExecutor {
    fn id(&self) -> i32 {
        self.pid.as_raw()
    }

    fn check(&mut self) -> ExecutorStatus {
        if let Some(status) = self.exit_status {
            return status;
        }
        let status = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return ExecutorStatus::Running,
            Ok(WaitStatus::Exited(_, code)) => ExecutorStatus::Finished(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ExecutorStatus::FinishedFail(signal as i32),
            Ok(_) | Err(_) => ExecutorStatus::FinishedFail(-1),
        };
        self.exit_status = Some(status);
        status
    }

    fn attach_back_channel(&mut self, conn: Box<dyn Connection>) {
        self.back_channel = Some(conn);
        self.allocation_finished = Instant::now();
    }

    fn allocation_begin(&self) -> Instant {
        self.allocation_begin
    }

    fn allocation_finished(&self) -> Instant {
        self.allocation_finished
    }
}

/// The process-backed launcher used in production.
pub struct ProcessLauncher {
    exec: ExecutorSettings,
}

impl ProcessLauncher {
    pub fn new(exec: ExecutorSettings) -> Self {
        ProcessLauncher { exec }
    }
}

impl ExecutorLauncher for ProcessLauncher {
    fn spawn(
        &self,
        request: &AllocationRequest,
        mgr: &ManagerConnection,
    ) -> io::Result<Box<dyn ActiveExecutor>> {
        Ok(Box::new(ProcessExecutor::spawn(request, &self.exec, mgr)?))
    }
}
