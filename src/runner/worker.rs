//! Worker-side runtime: receives `Work` frames, runs the target callable,
//! traps failures, and reports the coverage signal back to the manager.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::protocol::{self, ManagerMessage, WorkerMessage};
use crate::runner::coverage;
use crate::runner::process::{WORKER_READ_FD, WORKER_WRITE_FD};
use crate::targets::{self, TargetFn};

/// How often an idle worker polls the cooperative-termination flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

static SIGINT_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    SIGINT_FLAG.store(true, Ordering::SeqCst);
}

fn sigint_received() -> bool {
    SIGINT_FLAG.load(Ordering::SeqCst)
}

#[derive(Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Cooperative-termination flag was set; exited without executing.
    Interrupted,
    /// Manager closed the channel.
    Disconnected,
    /// Target callable panicked or returned an error.
    Crashed,
}

enum Next {
    Msg(ManagerMessage),
    Disconnected,
    Interrupted,
}

/// One worker runtime bound to a message channel and a target callable.
/// Generic over the streams so tests can drive it with in-memory buffers.
pub struct Worker<R: Read, W: Write> {
    rx: R,
    tx: W,
    target: TargetFn,
    shutdown: fn() -> bool,
}

impl<R: Read, W: Write> Worker<R, W> {
    pub fn new(rx: R, tx: W, target: TargetFn, shutdown: fn() -> bool) -> Self {
        Self {
            rx,
            tx,
            target,
            shutdown,
        }
    }

    pub fn run(&mut self) -> io::Result<WorkerOutcome> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        loop {
            let buf = match self.read_message()? {
                Next::Msg(ManagerMessage::Work { buf }) => buf,
                Next::Disconnected => return Ok(WorkerOutcome::Disconnected),
                Next::Interrupted => return Ok(WorkerOutcome::Interrupted),
            };
            if (self.shutdown)() {
                return Ok(WorkerOutcome::Interrupted);
            }
            let target = self.target;
            let result = catch_unwind(AssertUnwindSafe(|| target.invoke(&buf, &rt)));
            match result {
                Ok(Ok(())) => {
                    let coverage = coverage::observed();
                    protocol::write_frame(&mut self.tx, &WorkerMessage::Result { coverage })?;
                }
                Ok(Err(err)) => {
                    narrate_crash(&format!("{err:?}"));
                    protocol::write_frame(&mut self.tx, &WorkerMessage::Crash)?;
                    return Ok(WorkerOutcome::Crashed);
                }
                Err(panic) => {
                    narrate_crash(&panic_message(panic.as_ref()));
                    protocol::write_frame(&mut self.tx, &WorkerMessage::Crash)?;
                    return Ok(WorkerOutcome::Crashed);
                }
            }
        }
    }

    fn read_message(&mut self) -> io::Result<Next> {
        let mut header = [0u8; 4];
        // Waiting for a frame header is the idle point: the flag is polled
        // here on a fixed interval even when no work arrives.
        match self.read_exact_interruptible(&mut header, true)? {
            ReadState::Complete => {}
            ReadState::Eof => return Ok(Next::Disconnected),
            ReadState::Interrupted => return Ok(Next::Interrupted),
        }
        let len = u32::from_be_bytes(header);
        protocol::check_len(len)?;
        let mut payload = vec![0u8; len as usize];
        match self.read_exact_interruptible(&mut payload, false)? {
            ReadState::Complete => Ok(Next::Msg(protocol::decode(&payload)?)),
            ReadState::Eof => Err(io::ErrorKind::UnexpectedEof.into()),
            // Mid-frame the read runs to completion; unreachable in practice.
            ReadState::Interrupted => Ok(Next::Interrupted),
        }
    }

    fn read_exact_interruptible(&mut self, buf: &mut [u8], idle: bool) -> io::Result<ReadState> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.rx.read(&mut buf[offset..]) {
                Ok(0) => {
                    if offset == 0 {
                        return Ok(ReadState::Eof);
                    }
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(n) => offset += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    if idle && offset == 0 && (self.shutdown)() {
                        return Ok(ReadState::Interrupted);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if idle && offset == 0 && (self.shutdown)() {
                        return Ok(ReadState::Interrupted);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ReadState::Complete)
    }
}

enum ReadState {
    Complete,
    Eof,
    Interrupted,
}

fn narrate_crash(message: &str) {
    println!("=================================================================");
    println!("{message}");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "target panicked".to_string()
    }
}

/// Entry point for the hidden `worker` subcommand. Returns the process
/// exit code: 0 for cooperative/clean exits, nonzero for crashes.
pub fn run(target_name: &str) -> i32 {
    let Some(target) = targets::get_target(target_name) else {
        eprintln!("unknown fuzz target `{target_name}`");
        return 2;
    };
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    if let Err(err) = set_nonblocking(WORKER_READ_FD) {
        eprintln!("worker channel setup failed: {err}");
        return 1;
    }
    let rx = unsafe { File::from_raw_fd(WORKER_READ_FD) };
    let tx = unsafe { File::from_raw_fd(WORKER_WRITE_FD) };
    let mut worker = Worker::new(rx, tx, target, sigint_received);
    match worker.run() {
        Ok(WorkerOutcome::Interrupted) => {
            println!("received SIGINT. shutting down gracefully");
            0
        }
        Ok(WorkerOutcome::Disconnected) => 0,
        Ok(WorkerOutcome::Crashed) => 1,
        Err(err) => {
            eprintln!("worker channel error: {err}");
            1
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
