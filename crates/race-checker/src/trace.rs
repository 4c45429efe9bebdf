// SPDX-License-Identifier: Apache-2.0

//! Instruction-level tracing of a forked child over `ptrace(2)`
//!
//! Every wait is bounded: the checker keeps `SIGCHLD` blocked and sleeps in
//! `sigtimedwait(2)` between non-blocking `waitpid(2)` polls, so a child that
//! never stops again is reported as [`Event::Timeout`] instead of hanging the
//! checker.

use std::io::Error;
use std::mem::MaybeUninit;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::null_mut;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use libc::{c_int, c_long, c_void, pid_t};
use log::{debug, trace};

/// Exit code of a child whose preparation failed.
pub const EXIT_SETUP: c_int = 125;

/// Exit code of a child which panicked.
pub const EXIT_PANIC: c_int = 126;

/// Longest sleep between two `waitpid(2)` polls.
///
/// `SIGCHLD` is discarded if some other thread of the tracer leaves it
/// unblocked, so waits must not rely on it alone.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a traced child did while it was waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Stopped with the given signal.
    Stopped(c_int),
    /// Exited with the given code.
    Exited(c_int),
    /// Terminated by the given signal.
    Killed(c_int),
    /// Nothing happened before the timeout.
    Timeout,
}

fn check(ret: c_long, what: &str) -> Result<c_long> {
    if ret < 0 {
        return Err(Error::last_os_error()).with_context(|| format!("{} failed", what));
    }
    Ok(ret)
}

fn sigchld_set() -> libc::sigset_t {
    let mut set = MaybeUninit::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGCHLD);
        set.assume_init()
    }
}

fn sigchld_mask(how: c_int) -> Result<()> {
    let set = sigchld_set();
    match unsafe { libc::pthread_sigmask(how, &set, null_mut()) } {
        0 => Ok(()),
        e => Err(Error::from_raw_os_error(e)).context("pthread_sigmask failed"),
    }
}

/// Blocks `SIGCHLD` in the calling thread so waits can be bounded.
///
/// This must be called before the first [`Tracee::spawn`].
pub fn block_sigchld() -> Result<()> {
    sigchld_mask(libc::SIG_BLOCK)
}

/// Sleeps until a `SIGCHLD` is pending or `timeout` elapses.
fn sigchld_wait(timeout: Duration) -> Result<()> {
    let set = sigchld_set();
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as _,
        tv_nsec: timeout.subsec_nanos() as _,
    };

    if unsafe { libc::sigtimedwait(&set, null_mut(), &ts) } < 0 {
        let err = Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => {}
            _ => return Err(err).context("sigtimedwait failed"),
        }
    }
    Ok(())
}

/// A traced child process.
///
/// The child is killed and reaped when this is dropped.
#[derive(Debug)]
pub struct Tracee {
    pid: pid_t,
    alive: bool,
}

impl Tracee {
    /// Forks a traced child.
    ///
    /// The child runs `prepare`, stops itself with `SIGSTOP` as a marker
    /// for the tracer, and then exits with the code returned by `run`. On
    /// return the child is stopped at the marker.
    pub fn spawn(
        prepare: impl FnOnce() -> Result<()>,
        run: impl FnOnce() -> c_int,
        timeout: Duration,
    ) -> Result<Self> {
        let pid = check(unsafe { libc::fork() }.into(), "fork")? as pid_t;

        if pid == 0 {
            let code = catch_unwind(AssertUnwindSafe(|| child(prepare, run)));
            unsafe { libc::_exit(code.unwrap_or(EXIT_PANIC)) };
        }

        let mut tracee = Self { pid, alive: true };
        match tracee.wait(timeout)? {
            Event::Stopped(libc::SIGSTOP) => {}
            Event::Exited(EXIT_SETUP) => bail!("child {} failed to prepare", pid),
            event => bail!("child {} did not reach its marker: {:?}", pid, event),
        }

        tracee.ptrace(
            libc::PTRACE_SETOPTIONS,
            libc::PTRACE_O_EXITKILL as usize,
            "ptrace(PTRACE_SETOPTIONS)",
        )?;

        trace!("spawned tracee {}", pid);
        Ok(tracee)
    }

    /// The child's process id.
    pub fn pid(&self) -> pid_t {
        self.pid
    }

    fn ptrace(&self, request: libc::c_uint, data: usize, what: &str) -> Result<()> {
        check(
            unsafe {
                libc::ptrace(
                    request,
                    self.pid,
                    null_mut::<c_void>(),
                    data as *mut c_void,
                )
            },
            what,
        )?;
        Ok(())
    }

    /// Executes one instruction. Wait for the resulting trap.
    pub fn step(&mut self) -> Result<()> {
        self.ptrace(libc::PTRACE_SINGLESTEP, 0, "ptrace(PTRACE_SINGLESTEP)")
    }

    /// Resumes the child, delivering `signal` if it is non-zero.
    pub fn cont(&mut self, signal: c_int) -> Result<()> {
        self.ptrace(libc::PTRACE_CONT, signal as usize, "ptrace(PTRACE_CONT)")
    }

    /// The address of the next instruction the stopped child will execute.
    pub fn rip(&self) -> Result<usize> {
        let mut regs = MaybeUninit::<libc::user_regs_struct>::uninit();
        self.ptrace(
            libc::PTRACE_GETREGS,
            regs.as_mut_ptr() as usize,
            "ptrace(PTRACE_GETREGS)",
        )?;
        Ok(unsafe { regs.assume_init() }.rip as usize)
    }

    /// Sends `signal` to the running child.
    pub fn kill(&mut self, signal: c_int) -> Result<()> {
        check(unsafe { libc::kill(self.pid, signal) }.into(), "kill")?;
        Ok(())
    }

    /// Waits up to `timeout` for the child to stop or end.
    pub fn wait(&mut self, timeout: Duration) -> Result<Event> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut status = 0;
            match unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) } {
                0 => {}
                ret => {
                    check(ret.into(), "waitpid")?;
                    return Ok(self.decode(status));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Event::Timeout);
            }
            sigchld_wait((deadline - now).min(POLL_INTERVAL))?;
        }
    }

    /// Waits for a resumed child to end or for `timeout` to elapse.
    ///
    /// The child must already be running: a child still held at a stop is
    /// reported as [`Event::Timeout`]. Traps are swallowed and any other
    /// signal is passed through.
    pub fn finish(&mut self, timeout: Duration) -> Result<Event> {
        let deadline = Instant::now() + timeout;

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.wait(left)? {
                Event::Stopped(libc::SIGTRAP) => self.cont(0)?,
                Event::Stopped(signal) => self.cont(signal)?,
                event => return Ok(event),
            }
        }
    }

    fn decode(&mut self, status: c_int) -> Event {
        let event = if libc::WIFEXITED(status) {
            self.alive = false;
            Event::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            self.alive = false;
            Event::Killed(libc::WTERMSIG(status))
        } else {
            Event::Stopped(libc::WSTOPSIG(status))
        };

        trace!("tracee {}: {:?}", self.pid, event);
        event
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }

        debug!("killing tracee {}", self.pid);
        unsafe { libc::kill(self.pid, libc::SIGKILL) };

        loop {
            let mut status = 0;
            if unsafe { libc::waitpid(self.pid, &mut status, 0) } < 0 {
                break;
            }
            if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
                break;
            }
        }
    }
}

fn child(prepare: impl FnOnce() -> Result<()>, run: impl FnOnce() -> c_int) -> c_int {
    if sigchld_mask(libc::SIG_UNBLOCK).is_err() || prepare().is_err() {
        return EXIT_SETUP;
    }

    unsafe {
        if libc::ptrace(
            libc::PTRACE_TRACEME,
            0,
            null_mut::<c_void>(),
            null_mut::<c_void>(),
        ) < 0
        {
            return EXIT_SETUP;
        }

        libc::raise(libc::SIGSTOP);
    }

    run()
}
