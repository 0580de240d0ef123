//! Manager-side worker process supervision: spawn, channel plumbing,
//! cooperative and forced termination, exit classification.

use std::fs::File;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::manager::{ExitKind, WorkerControl, WorkerLink};
use crate::protocol::{self, ManagerMessage, WorkerMessage};
use crate::runner::monitor;

// Channel fds inside the worker process.
pub const WORKER_READ_FD: RawFd = 100;
pub const WORKER_WRITE_FD: RawFd = 101;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to dispatch work item: {0}")]
    Dispatch(#[source] io::Error),
}

/// Control half of a spawned worker. Replies arrive on the event half of
/// the [`WorkerLink`], fed by a dedicated reader thread.
pub struct WorkerProcess {
    child: Child,
    work_tx: File,
    reader: Option<thread::JoinHandle<()>>,
}

/// Spawns the worker as a child of the current executable (hidden `worker`
/// subcommand) with the message channel dup'd onto fixed fds. The memory
/// ceiling is also enforced at spawn via `RLIMIT_AS`.
pub fn spawn_worker(
    target: &str,
    config: &Config,
) -> Result<WorkerLink<WorkerProcess>, WorkerError> {
    let exe = std::env::current_exe().map_err(WorkerError::Spawn)?;
    let (work_r, work_w) = pipe().map_err(WorkerError::Spawn)?;
    let (reply_r, reply_w) = pipe().map_err(WorkerError::Spawn)?;

    let mut cmd = Command::new(exe);
    cmd.arg("worker").arg(target).stdin(Stdio::null());

    // Address space runs ahead of resident set, so the hard rlimit gets
    // headroom; the sampling loop enforces the exact ceiling.
    let rlimit_bytes = config.rss_limit_bytes().map(|b| b.saturating_mul(2));
    unsafe {
        cmd.pre_exec(move || {
            dup_to(work_r, WORKER_READ_FD)?;
            dup_to(reply_w, WORKER_WRITE_FD)?;
            if let Some(limit) = rlimit_bytes {
                let rl = libc::rlimit {
                    rlim_cur: limit,
                    rlim_max: limit,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &rl) == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(WorkerError::Spawn)?;
    unsafe {
        libc::close(work_r);
        libc::close(reply_w);
    }
    let work_tx = unsafe { File::from_raw_fd(work_w) };
    let mut reply_rx = unsafe { File::from_raw_fd(reply_r) };

    let (events_tx, events) = mpsc::channel(64);
    let reader = thread::spawn(move || {
        // EOF or a torn frame ends the stream; dropping the sender tells
        // the manager the worker is gone.
        while let Ok(msg) = protocol::read_frame::<_, WorkerMessage>(&mut reply_rx) {
            if events_tx.blocking_send(msg).is_err() {
                break;
            }
        }
    });

    Ok(WorkerLink {
        events,
        control: WorkerProcess {
            child,
            work_tx,
            reader: Some(reader),
        },
    })
}

impl WorkerControl for WorkerProcess {
    fn dispatch(&mut self, buf: &[u8]) -> Result<(), WorkerError> {
        protocol::write_frame(
            &mut self.work_tx,
            &ManagerMessage::Work { buf: buf.to_vec() },
        )
        .map_err(WorkerError::Dispatch)
    }

    fn request_stop(&mut self) {
        unsafe {
            libc::kill(self.child.id() as libc::c_int, libc::SIGINT);
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
    }

    fn sample_rss(&mut self) -> Option<u64> {
        monitor::rss_bytes(self.child.id())
    }

    fn wait_exit(&mut self) -> ExitKind {
        match self.child.wait() {
            Ok(status) => classify_exit(status),
            Err(err) => {
                log::warn!("failed to reap worker: {err}");
                ExitKind::Code(-1)
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn classify_exit(status: ExitStatus) -> ExitKind {
    if let Some(signal) = status.signal() {
        return ExitKind::Signal(signal);
    }
    match status.code() {
        Some(0) => ExitKind::Clean,
        Some(code) => ExitKind::Code(code),
        None => ExitKind::Code(-1),
    }
}

fn dup_to(fd: RawFd, target: RawFd) -> io::Result<()> {
    unsafe {
        if libc::dup2(fd, target) == -1 {
            return Err(io::Error::last_os_error());
        }
        libc::close(fd);
    }
    make_inheritable(target)
}

fn make_inheritable(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}
