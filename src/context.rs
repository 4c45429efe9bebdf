// SPDX-License-Identifier: Apache-2.0

//! Access to an interrupted thread's saved machine context
//!
//! The dispatcher only ever needs two pieces of the saved state: the address
//! execution resumes at, and the signal mask restored by `sigreturn`. This
//! module hides the per-architecture register layout behind those accessors.

use core::ffi::c_void;
use core::fmt;

use libc::{sigset_t, ucontext_t};

/// The saved machine context of a thread interrupted by a signal.
pub struct Context<'a> {
    uc: &'a mut ucontext_t,
}

impl<'a> Context<'a> {
    /// Wraps the third argument of an `SA_SIGINFO` signal handler.
    ///
    /// # Safety
    ///
    /// `uc` must point to a valid `ucontext_t` which outlives `'a` and is not
    /// accessed through any other path meanwhile.
    #[inline]
    pub unsafe fn from_raw(uc: *mut c_void) -> Self {
        Self {
            uc: &mut *uc.cast::<ucontext_t>(),
        }
    }

    /// Wraps a `ucontext_t`.
    #[inline]
    pub fn new(uc: &'a mut ucontext_t) -> Self {
        Self { uc }
    }

    /// The address execution resumes at when the handler returns.
    #[inline]
    pub fn resume_address(&self) -> usize {
        self.uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }

    /// Makes execution resume at `addr` when the handler returns.
    #[inline]
    pub fn set_resume_address(&mut self, addr: usize) {
        self.uc.uc_mcontext.gregs[libc::REG_RIP as usize] = addr as libc::greg_t;
    }

    /// The signal mask restored when the handler returns.
    #[inline]
    pub fn signal_mask(&self) -> &sigset_t {
        &self.uc.uc_sigmask
    }

    /// Replaces the signal mask restored when the handler returns.
    #[inline]
    pub fn set_signal_mask(&mut self, mask: &sigset_t) {
        self.uc.uc_sigmask = *mask;
    }

    /// The raw context, for architecture-specific inspection.
    #[inline]
    pub fn as_raw(&self) -> &ucontext_t {
        self.uc
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("resume_address", &format_args!("{:#x}", self.resume_address()))
            .finish()
    }
}
