// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::null;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Once;

use libc::{c_int, siginfo_t};
use sigsafe::Context;

pub const EINTR: isize = -(libc::EINTR as isize);

/// Handled without a user handler.
pub const PLAIN: c_int = libc::SIGUSR1;

/// Handled with [`note`] as user handler.
pub const NOTED: c_int = libc::SIGUSR2;

/// Installs the safe signals once per test binary.
pub fn install_handlers() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        sigsafe::install_handler(PLAIN, None).unwrap();
        sigsafe::install_handler(NOTED, Some(note)).unwrap();
    });
}

/// What [`note`] saw of the last signal it handled.
#[derive(Debug, Default)]
pub struct Notes {
    pub signum: AtomicI32,
    pub si_signo: AtomicI32,
    pub flag_was_set: AtomicBool,
    pub plain_blocked: AtomicBool,
    pub resume_address: AtomicUsize,
    pub count: AtomicUsize,
}

impl Notes {
    /// The notes as thread user data.
    pub fn as_user_data(&self) -> usize {
        self as *const Self as usize
    }
}

fn note(signum: c_int, info: &siginfo_t, ctx: &mut Context<'_>, user_data: usize) {
    if user_data == 0 {
        return;
    }

    // SAFETY: threads handling this signal install a `Notes` as user data.
    let notes = unsafe { &*(user_data as *const Notes) };
    notes.signum.store(signum, Ordering::SeqCst);
    notes.si_signo.store(info.si_signo, Ordering::SeqCst);
    notes
        .flag_was_set
        .store(sigsafe::signal_received() == Some(true), Ordering::SeqCst);
    notes
        .resume_address
        .store(ctx.resume_address(), Ordering::SeqCst);
    notes
        .plain_blocked
        .store(blocked(PLAIN), Ordering::SeqCst);
    notes.count.fetch_add(1, Ordering::SeqCst);
}

/// Whether `signum` is in the calling thread's current signal mask.
pub fn blocked(signum: c_int) -> bool {
    let mut cur = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        assert_eq!(
            libc::pthread_sigmask(libc::SIG_BLOCK, null(), cur.as_mut_ptr()),
            0
        );
        libc::sigismember(cur.as_ptr(), signum) == 1
    }
}

/// The mask `signum`'s installed action blocks during delivery.
pub fn action_mask(signum: c_int) -> libc::sigset_t {
    let mut old = MaybeUninit::<libc::sigaction>::uninit();
    unsafe {
        assert_eq!(libc::sigaction(signum, null(), old.as_mut_ptr()), 0);
        old.assume_init().sa_mask
    }
}

/// Delivers `signum` to the calling thread before returning.
pub fn raise_here(signum: c_int) {
    assert_eq!(unsafe { libc::pthread_kill(libc::pthread_self(), signum) }, 0);
}

/// Delivers `signum` to `thread`.
pub fn signal_thread(thread: libc::pthread_t, signum: c_int) {
    assert_eq!(unsafe { libc::pthread_kill(thread, signum) }, 0);
}

pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
    let [rx, tx] = fds.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
    (rx, tx)
}

pub fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let ty = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, ty, 0, fds.as_mut_ptr()) },
        0
    );
    let [a, b] = fds.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
    (a, b)
}

/// Writes all of `buf` with plain `write(2)`.
pub fn write_all(fd: &OwnedFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        let ret = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        assert!(ret > 0, "write failed: {}", std::io::Error::last_os_error());
        buf = &buf[ret as usize..];
    }
}
