// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process supervision for a broker cluster: one scheduler process first,
// then N worker processes, all children of the supervisor. Termination
// fans SIGTERM out to every child and escalates to SIGKILL after a grace
// period. There is no respawn: a dead worker's in-flight requests surface
// as client timeouts and operators decide what to do.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};

/// How often supervision loops re-probe child state.
const PROBE_INTERVAL: Duration = Duration::from_millis(25);

/// How long [`Cluster::start`] waits for the scheduler socket to appear.
const SOCKET_WAIT: Duration = Duration::from_secs(5);

/// Reap window granted after a SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Deadline polling
// ---------------------------------------------------------------------------

/// Outcome of one supervision probe.
enum Probe<T> {
    Ready(T),
    Pending,
    Failed,
}

/// Re-run `probe` every `interval` until it settles or `timeout` elapses.
/// Returns `None` when the probe failed or never became ready in time.
fn poll_within<T>(
    timeout: Duration,
    interval: Duration,
    mut probe: impl FnMut() -> Probe<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match probe() {
            Probe::Ready(v) => return Some(v),
            Probe::Failed => return None,
            Probe::Pending => {}
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(interval);
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// Handle to a spawned child process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Logical name for logs (`scheduler`, `worker-3`, ...).
    pub name: String,
}

impl ProcessHandle {
    pub fn is_alive(&self) -> bool {
        if self.pid == 0 {
            return false;
        }
        let ret = unsafe { libc::kill(self.pid as libc::pid_t, 0) };
        ret == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

/// How a child left the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited on its own with this code.
    Code(i32),
    /// Terminated by this signal.
    Signal(i32),
    /// Not reaped: still running when the wait gave up, or not this
    /// process's child.
    Running,
}

/// Spawn a child process via `posix_spawn`, inheriting the environment.
pub fn spawn(name: &str, executable: &str, args: &[&str]) -> io::Result<ProcessHandle> {
    use std::ffi::CString;

    extern "C" {
        static mut environ: *mut *mut libc::c_char;
    }

    let exe = CString::new(executable)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut argv: Vec<CString> = Vec::with_capacity(args.len() + 1);
    argv.push(exe.clone());
    for a in args {
        argv.push(CString::new(*a).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?);
    }

    let mut argv_ptrs: Vec<*mut libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr() as *mut libc::c_char)
        .collect();
    argv_ptrs.push(std::ptr::null_mut());

    let mut pid: libc::pid_t = -1;
    let err = unsafe {
        libc::posix_spawn(
            &mut pid,
            exe.as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            argv_ptrs.as_mut_ptr(),
            environ,
        )
    };
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(ProcessHandle {
        pid: pid as u32,
        name: name.to_owned(),
    })
}

/// Send SIGTERM to request graceful shutdown.
pub fn request_shutdown(h: &ProcessHandle) -> bool {
    h.pid != 0 && unsafe { libc::kill(h.pid as libc::pid_t, libc::SIGTERM) == 0 }
}

/// Send SIGKILL.
pub fn force_kill(h: &ProcessHandle) -> bool {
    h.pid != 0 && unsafe { libc::kill(h.pid as libc::pid_t, libc::SIGKILL) == 0 }
}

/// Try to reap `h` once, without blocking.
fn try_reap(h: &ProcessHandle) -> Probe<ExitStatus> {
    let mut code: libc::c_int = 0;
    let ret = unsafe { libc::waitpid(h.pid as libc::pid_t, &mut code, libc::WNOHANG) };
    if ret == 0 {
        return Probe::Pending;
    }
    if ret != h.pid as libc::pid_t {
        // ECHILD: never our child, or already reaped elsewhere.
        return Probe::Failed;
    }
    if libc::WIFSIGNALED(code) {
        Probe::Ready(ExitStatus::Signal(libc::WTERMSIG(code)))
    } else {
        Probe::Ready(ExitStatus::Code(libc::WEXITSTATUS(code)))
    }
}

/// Reap a child, polling for up to `timeout`.
/// [`ExitStatus::Running`] means it had not exited when the wait gave up.
pub fn wait_for_exit(h: &ProcessHandle, timeout: Duration) -> ExitStatus {
    if h.pid == 0 {
        return ExitStatus::Running;
    }
    poll_within(timeout, PROBE_INTERVAL, || try_reap(h)).unwrap_or(ExitStatus::Running)
}

/// Graceful stop: SIGTERM, wait out the grace period, SIGKILL whatever is
/// left.
pub fn shutdown(h: &ProcessHandle, grace: Duration) -> ExitStatus {
    if h.pid == 0 {
        return ExitStatus::Running;
    }
    request_shutdown(h);
    match wait_for_exit(h, grace) {
        ExitStatus::Running => {
            force_kill(h);
            wait_for_exit(h, KILL_WAIT)
        }
        done => done,
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// How many workers to start at a given parallel hint.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPlan {
    pub parallel: u32,
    pub count: usize,
}

/// A running broker cluster: the scheduler plus its workers, all children
/// of this process.
pub struct Cluster {
    endpoint: PathBuf,
    procs: Vec<ProcessHandle>,
}

impl Cluster {
    /// Start the scheduler, wait for its socket to appear, then start the
    /// workers described by `plan`. `executable` is re-executed with
    /// `scheduler` / `worker` subcommands — normally the current binary.
    pub fn start(executable: &str, endpoint: &Path, plan: &[WorkerPlan]) -> io::Result<Self> {
        let ep = endpoint.to_string_lossy().into_owned();

        let sched = spawn("scheduler", executable, &["scheduler", &ep])?;
        info!("scheduler spawned (pid {})", sched.pid);
        let mut procs = vec![sched];

        // Workers can only connect once the socket exists; give the
        // scheduler a bounded head start.
        let bound = poll_within(SOCKET_WAIT, Duration::from_millis(20), || {
            if endpoint.exists() {
                Probe::Ready(())
            } else if procs[0].is_alive() {
                Probe::Pending
            } else {
                Probe::Failed
            }
        });
        if bound.is_none() {
            let reason = if procs[0].is_alive() {
                "scheduler socket never appeared"
            } else {
                "scheduler died before binding its socket"
            };
            return Err(io::Error::new(io::ErrorKind::TimedOut, reason));
        }

        let mut index = 0usize;
        for p in plan {
            info!("spawning {} workers with parallel={}", p.count, p.parallel);
            for _ in 0..p.count {
                let name = format!("worker-{index}");
                let idx = index.to_string();
                let par = p.parallel.to_string();
                let h = spawn(&name, executable, &["worker", &ep, &idx, &par])?;
                procs.push(h);
                index += 1;
            }
        }
        info!("cluster up: 1 scheduler + {index} workers on {ep}");

        Ok(Self {
            endpoint: endpoint.to_path_buf(),
            procs,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn procs(&self) -> &[ProcessHandle] {
        &self.procs
    }

    pub fn alive_count(&self) -> usize {
        self.procs.iter().filter(|p| p.is_alive()).count()
    }

    /// Log newly dead children. Returns the number of dead processes.
    /// No respawn happens here.
    pub fn check(&self) -> usize {
        let mut dead = 0;
        for p in &self.procs {
            if !p.is_alive() {
                dead += 1;
                warn!("{} (pid {}) is dead", p.name, p.pid);
            }
        }
        dead
    }

    /// Tear the whole cluster down: SIGTERM fan-out, grace, SIGKILL.
    pub fn stop(&mut self, grace: Duration) {
        info!("shutting down cluster");
        for p in &self.procs {
            if p.is_alive() {
                shutdown(p, grace);
            }
        }
        self.procs.clear();
    }
}
