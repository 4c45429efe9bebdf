// SPDX-License-Identifier: Apache-2.0

//! Per-thread signal state
//!
//! Every thread which wants safe signals delivered to it installs a
//! [`ThreadSignalState`]. The state is reachable from two places: the
//! trampolines (which read the flag) and the dispatcher (which sets it). Both
//! reach it through a destructor-free thread-local pointer, which is a plain
//! `fs`-relative load and therefore usable from signal context.

use crate::Result;

use std::alloc::{alloc, Layout};
use std::cell::Cell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::ENOMEM;
use log::trace;

/// Destructor for the user data supplied to [`install_tsd`].
///
/// It is run once, at thread exit, after the thread's state has been detached.
pub type Destructor = fn(usize);

/// Thread-specific data.
///
/// The trampolines read `signal_received` directly, so it must stay the first
/// field.
#[repr(C)]
#[derive(Debug)]
pub struct ThreadSignalState {
    /// Set iff a signal was received since the last [`clear_received`].
    pub(crate) signal_received: AtomicBool,
    pub(crate) user_data: usize,
    destructor: Option<Destructor>,
}

thread_local! {
    static CURRENT: Cell<*mut ThreadSignalState> = const { Cell::new(null_mut()) };
    static TEARDOWN: Teardown = const { Teardown };
}

/// Releases the calling thread's state when the thread exits.
struct Teardown;

impl Drop for Teardown {
    fn drop(&mut self) {
        let tsd = CURRENT.with(|current| current.replace(null_mut()));
        if tsd.is_null() {
            return;
        }

        // SAFETY: the pointer was produced by `install_tsd` from the global
        // allocator with the layout of `ThreadSignalState` and is no longer
        // reachable from this thread.
        let tsd = unsafe { Box::from_raw(tsd) };
        if let Some(destructor) = tsd.destructor {
            destructor(tsd.user_data);
        }
    }
}

/// Returns the calling thread's state, or null if none is installed.
///
/// This is async-signal-safe.
#[inline(always)]
pub(crate) fn current() -> *const ThreadSignalState {
    CURRENT.with(Cell::get)
}

/// Installs thread-specific data.
///
/// Before this is called for a given thread, safe signals delivered to that
/// thread are silently ignored. If signals may arrive during thread startup,
/// start the thread with them blocked.
///
/// `user_data` is passed to the handler registered with
/// [`install_handler`](crate::install_handler) for every signal delivered to
/// this thread, and returned by [`clear_received`]. The optional
/// `destructor` is run with `user_data` when the thread exits. Whether it runs
/// for the last thread of an exiting process is unspecified.
///
/// Returns `Err(ENOMEM)` if the state cannot be allocated.
///
/// # Panics
///
/// Panics if the calling thread already has state installed.
pub fn install_tsd(user_data: usize, destructor: Option<Destructor>) -> Result<()> {
    assert!(
        current().is_null(),
        "thread signal state installed twice on this thread"
    );

    let layout = Layout::new::<ThreadSignalState>();
    // SAFETY: `ThreadSignalState` is not zero-sized.
    let tsd = unsafe { alloc(layout) }.cast::<ThreadSignalState>();
    if tsd.is_null() {
        return Err(ENOMEM);
    }

    // SAFETY: `tsd` is a fresh, properly aligned allocation for this type.
    unsafe {
        tsd.write(ThreadSignalState {
            signal_received: AtomicBool::new(false),
            user_data,
            destructor,
        })
    };

    // Register the teardown guard before publishing the state, so it can
    // never be skipped.
    TEARDOWN.with(|_| ());
    CURRENT.with(|current| current.set(tsd));

    trace!("installed thread signal state {:p}", tsd);
    Ok(())
}

/// Clears the "signal received" flag and returns the thread's user data.
///
/// Signals arriving after the flag is cleared but before the caller inspects
/// the user data are not excluded; callers which need that ordering must
/// block the safe signals around this call and their processing.
///
/// # Panics
///
/// Panics if the calling thread has no state installed.
pub fn clear_received() -> usize {
    let tsd = current();
    assert!(
        !tsd.is_null(),
        "clear_received() called without installed thread signal state"
    );

    // SAFETY: the state is owned by this thread and lives until thread exit.
    let tsd = unsafe { &*tsd };
    tsd.signal_received.store(false, Ordering::SeqCst);
    tsd.user_data
}

/// Returns whether a safe signal was received since the last
/// [`clear_received`], or `None` if the calling thread has no state installed.
pub fn signal_received() -> Option<bool> {
    let tsd = current();
    if tsd.is_null() {
        return None;
    }

    // SAFETY: the state is owned by this thread and lives until thread exit.
    Some(unsafe { &*tsd }.signal_received.load(Ordering::SeqCst))
}
