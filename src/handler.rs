// SPDX-License-Identifier: Apache-2.0

//! The signal dispatcher
//!
//! A single `SA_SIGINFO` handler is installed for every safe signal. It runs
//! on whichever thread the signal is delivered to and:
//!
//! 1. ignores the signal if that thread has no installed state,
//! 2. runs the user handler registered for the signal, if any,
//! 3. sets the thread's "signal received" flag,
//! 4. redirects the thread to a trampoline's resume target if it was
//!    interrupted inside that trampoline's jump region.

use crate::context::Context;
use crate::registry;
use crate::tsd;
use crate::{Result, NSIG};

use core::ffi::{c_int, c_void};
use core::mem::MaybeUninit;
use core::ptr::null_mut;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, OnceLock};

use libc::{sigaction, siginfo_t, SA_RESTART, SA_SIGINFO};
use log::debug;

/// User-supplied signal handler.
///
/// It is passed the signal number, the `sigaction(2)`-style signal
/// information, the interrupted context and the user data supplied to
/// [`install_tsd`](crate::install_tsd) on the receiving thread.
///
/// It runs in signal context, before the dispatcher's redirection decision,
/// so it must be async-signal-safe. It is strongly suggested that it do
/// nothing more than copy what it needs from the signal information to the
/// location described by the user data; the dispatcher itself records only
/// that *a* signal arrived, not which one.
pub type UserHandler = fn(c_int, &siginfo_t, &mut Context<'_>, usize);

#[derive(Debug)]
struct Registration {
    handler: Option<UserHandler>,
}

static REGISTRATIONS: [OnceLock<Registration>; NSIG] = [const { OnceLock::new() }; NSIG];

/// Safe signals installed so far, in registration order.
static SAFE: Mutex<Vec<c_int>> = Mutex::new(Vec::new());

/// Installs a safe signal handler.
///
/// The handler is global to the process. Nothing happens on delivery to a
/// thread which has not called [`install_tsd`](crate::install_tsd).
///
/// The optional `handler` runs asynchronously for every delivery of `signum`
/// to a thread with installed state; see [`UserHandler`].
///
/// While any safe signal is being dispatched, all safe signals are blocked.
/// Handlers installed through other means should mask the safe signals too.
///
/// Returns the `sigaction(2)` errno on failure (`EINVAL` for signals which
/// cannot be caught).
///
/// # Panics
///
/// Panics if `signum` is out of range or already registered.
pub fn install_handler(signum: c_int, handler: Option<UserHandler>) -> Result<()> {
    assert!(
        0 < signum && (signum as usize) < NSIG,
        "signal number {} out of range",
        signum
    );

    let mut safe = SAFE.lock().unwrap_or_else(|e| e.into_inner());

    assert!(
        REGISTRATIONS[signum as usize]
            .set(Registration { handler })
            .is_ok(),
        "signal {} registered twice",
        signum
    );

    let mut mask = empty_sigset();
    for sig in safe.iter().copied().chain([signum]) {
        // SAFETY: `sig` is in range and `mask` is initialized.
        unsafe { libc::sigaddset(&mut mask, sig) };
    }

    // SAFETY: an all-zero `sigaction` is a valid starting point.
    let mut sa: sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
    sa.sa_sigaction = dispatch as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as usize;
    sa.sa_mask = mask;
    sa.sa_flags = SA_SIGINFO | SA_RESTART;

    set_action(signum, &sa)?;
    safe.push(signum);

    // Every safe signal must block every other one during dispatch.
    for &sig in safe.iter().filter(|&&sig| sig != signum) {
        set_action(sig, &sa)?;
    }

    debug!(
        "installed safe handler for signal {} (user handler: {}, safe signals: {:?})",
        signum,
        handler.is_some(),
        *safe
    );
    Ok(())
}

fn empty_sigset() -> libc::sigset_t {
    let mut set = MaybeUninit::uninit();
    // SAFETY: `sigemptyset` initializes the set.
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

fn set_action(signum: c_int, sa: &sigaction) -> Result<()> {
    // SAFETY: `sa` is a fully initialized action.
    if unsafe { libc::sigaction(signum, sa, null_mut()) } != 0 {
        return Err(std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL));
    }
    Ok(())
}

/// Redirects a thread interrupted inside a jump region to its resume target.
///
/// Returns whether the context was modified. A thread interrupted anywhere
/// else resumes where it was: either before its trampoline's flag check,
/// which will then observe the flag, or after the system call completed,
/// whose result must be delivered untouched.
///
/// This is async-signal-safe.
pub fn redirect(ctx: &mut Context<'_>) -> bool {
    match registry::find(ctx.resume_address()) {
        Some(syscall) => {
            ctx.set_resume_address(syscall.resume_target());
            true
        }
        None => false,
    }
}

extern "C" fn dispatch(signum: c_int, info: *mut siginfo_t, uc: *mut c_void) {
    let tsd = tsd::current();
    if tsd.is_null() {
        return;
    }

    if signum <= 0 || signum as usize >= NSIG {
        // SAFETY: abort is async-signal-safe.
        unsafe { libc::abort() };
    }

    // SAFETY: the state is owned by the interrupted thread, which cannot run
    // until this handler returns, and the kernel passes a valid context.
    let (tsd, mut ctx) = unsafe { (&*tsd, Context::from_raw(uc)) };

    if let Some(handler) = REGISTRATIONS[signum as usize]
        .get()
        .and_then(|r| r.handler)
    {
        // SAFETY: the kernel passes valid signal information.
        handler(signum, unsafe { &*info }, &mut ctx, tsd.user_data);
    }

    tsd.signal_received.store(true, Ordering::SeqCst);
    redirect(&mut ctx);
}
