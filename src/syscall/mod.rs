// SPDX-License-Identifier: Apache-2.0

//! Signal-safe system call wrappers
//!
//! These return `-EINTR` immediately if a safe signal was delivered to the
//! calling thread before the call or before the transition into the kernel,
//! and on receipt of a safe signal in the kernel. They return errors as
//! negated errno values instead of through `errno`. Otherwise they behave like
//! the standard wrappers of the same names.
//!
//! On a thread without [installed state](crate::install_tsd) they are plain
//! system calls.
//!
//! ```no_run
//! use sigsafe::syscall;
//!
//! # let (fd, mut buf) = (0, [0u8; 16]);
//! let ret = loop {
//!     match syscall::read(fd, &mut buf) {
//!         ret if ret == -(libc::EINTR as isize) => {
//!             sigsafe::clear_received();
//!         }
//!         ret => break ret,
//!     }
//! };
//!
//! if ret < 0 {
//!     eprintln!("read error {}", -ret);
//! } else if ret == 0 {
//!     eprintln!("stream end");
//! } else {
//!     eprintln!("read {} bytes", ret);
//! }
//! ```

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
pub(crate) mod arch;

use crate::tsd;
use arch::{Args, Trampoline};

use core::ffi::{c_int, c_long, c_uint};
use core::mem::size_of;
use core::ptr::{null, null_mut};
use std::io::{IoSlice, IoSliceMut};

use libc::{
    epoll_event, fd_set, msghdr, pid_t, pollfd, rusage, sigset_t, sockaddr, socklen_t, timespec,
    timeval,
};

/// Size of the kernel's signal set, as expected by `rt_sigsuspend`.
const KERNEL_SIGSET_SIZE: usize = size_of::<u64>();

#[inline(always)]
fn call(trampoline: Trampoline, args: Args) -> c_long {
    // SAFETY: the trampoline only dereferences the state pointer when it is
    // non-null, and the state outlives every call made on this thread. The
    // arguments are checked by the wrapper or the caller.
    unsafe { trampoline(tsd::current().cast(), &args) }
}

#[inline(always)]
fn opt_mut<T>(value: Option<&mut T>) -> usize {
    value.map_or(null_mut(), |v| v as *mut T) as usize
}

/// Signal-safe [`read(2)`](https://man7.org/linux/man-pages/man2/read.2.html).
pub fn read(fd: c_int, buf: &mut [u8]) -> isize {
    call(
        arch::sigsafe_read,
        [fd as _, buf.as_mut_ptr() as _, buf.len(), 0, 0, 0],
    ) as _
}

/// Signal-safe [`readv(2)`](https://man7.org/linux/man-pages/man2/readv.2.html).
pub fn readv(fd: c_int, iov: &mut [IoSliceMut<'_>]) -> isize {
    call(
        arch::sigsafe_readv,
        [fd as _, iov.as_mut_ptr() as _, iov.len(), 0, 0, 0],
    ) as _
}

/// Signal-safe [`write(2)`](https://man7.org/linux/man-pages/man2/write.2.html).
pub fn write(fd: c_int, buf: &[u8]) -> isize {
    call(
        arch::sigsafe_write,
        [fd as _, buf.as_ptr() as _, buf.len(), 0, 0, 0],
    ) as _
}

/// Signal-safe [`writev(2)`](https://man7.org/linux/man-pages/man2/writev.2.html).
pub fn writev(fd: c_int, iov: &[IoSlice<'_>]) -> isize {
    call(
        arch::sigsafe_writev,
        [fd as _, iov.as_ptr() as _, iov.len(), 0, 0, 0],
    ) as _
}

/// Signal-safe [`nanosleep(2)`](https://man7.org/linux/man-pages/man2/nanosleep.2.html).
pub fn nanosleep(req: &timespec, rem: Option<&mut timespec>) -> c_int {
    call(
        arch::sigsafe_nanosleep,
        [req as *const timespec as _, opt_mut(rem), 0, 0, 0, 0],
    ) as _
}

/// Signal-safe [`pause(2)`](https://man7.org/linux/man-pages/man2/pause.2.html).
pub fn pause() -> c_int {
    call(arch::sigsafe_pause, [0; 6]) as _
}

/// Signal-safe [`sigsuspend(2)`](https://man7.org/linux/man-pages/man2/sigsuspend.2.html).
pub fn sigsuspend(mask: &sigset_t) -> c_int {
    call(
        arch::sigsafe_sigsuspend,
        [mask as *const sigset_t as _, KERNEL_SIGSET_SIZE, 0, 0, 0, 0],
    ) as _
}

/// Signal-safe [`poll(2)`](https://man7.org/linux/man-pages/man2/poll.2.html).
pub fn poll(fds: &mut [pollfd], timeout: c_int) -> c_int {
    call(
        arch::sigsafe_poll,
        [fds.as_mut_ptr() as _, fds.len(), timeout as _, 0, 0, 0],
    ) as _
}

/// Signal-safe [`epoll_wait(2)`](https://man7.org/linux/man-pages/man2/epoll_wait.2.html).
pub fn epoll_wait(epfd: c_int, events: &mut [epoll_event], timeout: c_int) -> c_int {
    call(
        arch::sigsafe_epoll_wait,
        [
            epfd as _,
            events.as_mut_ptr() as _,
            events.len(),
            timeout as _,
            0,
            0,
        ],
    ) as _
}

/// Signal-safe [`select(2)`](https://man7.org/linux/man-pages/man2/select.2.html).
pub fn select(
    nfds: c_int,
    readfds: Option<&mut fd_set>,
    writefds: Option<&mut fd_set>,
    exceptfds: Option<&mut fd_set>,
    timeout: Option<&mut timeval>,
) -> c_int {
    call(
        arch::sigsafe_select,
        [
            nfds as _,
            opt_mut(readfds),
            opt_mut(writefds),
            opt_mut(exceptfds),
            opt_mut(timeout),
            0,
        ],
    ) as _
}

/// Signal-safe [`wait4(2)`](https://man7.org/linux/man-pages/man2/wait4.2.html).
pub fn wait4(
    pid: pid_t,
    status: Option<&mut c_int>,
    options: c_int,
    rusage: Option<&mut rusage>,
) -> pid_t {
    call(
        arch::sigsafe_wait4,
        [pid as _, opt_mut(status), options as _, opt_mut(rusage), 0, 0],
    ) as _
}

/// Signal-safe [`accept(2)`](https://man7.org/linux/man-pages/man2/accept.2.html).
///
/// # Safety
///
/// `addr` and `addrlen` must be null or describe writable memory as required
/// by `accept(2)`.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    call(
        arch::sigsafe_accept,
        [fd as _, addr as _, addrlen as _, 0, 0, 0],
    ) as _
}

/// Signal-safe [`connect(2)`](https://man7.org/linux/man-pages/man2/connect.2.html).
///
/// # Safety
///
/// `addr` must point to a socket address of `addrlen` bytes.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    call(
        arch::sigsafe_connect,
        [fd as _, addr as _, addrlen as _, 0, 0, 0],
    ) as _
}

/// Signal-safe [`recvfrom(2)`](https://man7.org/linux/man-pages/man2/recvfrom.2.html).
///
/// # Safety
///
/// `addr` and `addrlen` must be null or describe writable memory as required
/// by `recvfrom(2)`.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: &mut [u8],
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    call(
        arch::sigsafe_recvfrom,
        [
            fd as _,
            buf.as_mut_ptr() as _,
            buf.len(),
            flags as _,
            addr as _,
            addrlen as _,
        ],
    ) as _
}

/// Signal-safe [`recv(2)`](https://man7.org/linux/man-pages/man2/recv.2.html).
///
/// This is [`recvfrom`] without a source address.
pub fn recv(fd: c_int, buf: &mut [u8], flags: c_int) -> isize {
    // SAFETY: no address is requested.
    unsafe { recvfrom(fd, buf, flags, null_mut(), null_mut()) }
}

/// Signal-safe [`sendto(2)`](https://man7.org/linux/man-pages/man2/sendto.2.html).
///
/// # Safety
///
/// `addr` must be null or point to a socket address of `addrlen` bytes.
pub unsafe fn sendto(
    fd: c_int,
    buf: &[u8],
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> isize {
    call(
        arch::sigsafe_sendto,
        [
            fd as _,
            buf.as_ptr() as _,
            buf.len(),
            flags as _,
            addr as _,
            addrlen as _,
        ],
    ) as _
}

/// Signal-safe [`send(2)`](https://man7.org/linux/man-pages/man2/send.2.html).
///
/// This is [`sendto`] without a destination address.
pub fn send(fd: c_int, buf: &[u8], flags: c_int) -> isize {
    // SAFETY: no address is passed.
    unsafe { sendto(fd, buf, flags, null(), 0) }
}

/// Signal-safe [`recvmsg(2)`](https://man7.org/linux/man-pages/man2/recvmsg.2.html).
///
/// # Safety
///
/// `msg` must describe valid buffers as required by `recvmsg(2)`.
pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> isize {
    call(
        arch::sigsafe_recvmsg,
        [fd as _, msg as _, flags as c_uint as _, 0, 0, 0],
    ) as _
}

/// Signal-safe [`sendmsg(2)`](https://man7.org/linux/man-pages/man2/sendmsg.2.html).
///
/// # Safety
///
/// `msg` must describe valid buffers as required by `sendmsg(2)`.
pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> isize {
    call(
        arch::sigsafe_sendmsg,
        [fd as _, msg as _, flags as c_uint as _, 0, 0, 0],
    ) as _
}
