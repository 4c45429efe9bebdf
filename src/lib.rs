// SPDX-License-Identifier: Apache-2.0

//! Race-free delivery of thread-directed signals to blocking system calls
//!
//! `sigsafe` lets a thread learn, without races, whether a signal arrived
//! before, during or after a blocking system call. It replaces the usual
//! patterns (checking a flag and then calling, jumping out of the signal
//! handler, or polling a self-pipe before every call) with alternate system
//! call wrappers whose only visible differences from the standard ones are:
//!
//! * they return `-EINTR` immediately if a "safe" signal was delivered to the
//!   calling thread before the call, or before the transition into the kernel;
//! * they return `-EINTR` when a safe signal interrupts them in the kernel,
//!   even though the handler is installed with `SA_RESTART`;
//! * they report errors as negated errno values instead of through `errno`.
//!
//! Like the standard wrappers, they never report `-EINTR` for a call that has
//! already completed.
//!
//! # Mechanism of action
//!
//! Every wrapper is a small assembly trampoline which checks the calling
//! thread's "signal received" flag and then issues the `syscall` instruction.
//! The addresses between the flag check and the `syscall` instruction form
//! the trampoline's *jump region* and are published in a table of
//! [`SyscallDescriptor`](registry::SyscallDescriptor)s. When a safe signal
//! arrives, the dispatcher sets the flag and, if the interrupted instruction
//! lies inside a jump region, rewrites the saved instruction pointer to the
//! trampoline's *resume target*, which returns `-EINTR`.
//!
//! # Usage
//!
//! ```no_run
//! use sigsafe::syscall;
//!
//! sigsafe::install_handler(libc::SIGUSR1, None).unwrap();
//! sigsafe::install_tsd(0, None).unwrap();
//!
//! let mut buf = [0u8; 64];
//! let ret = loop {
//!     match syscall::read(libc::STDIN_FILENO, &mut buf) {
//!         ret if ret == -(libc::EINTR as isize) => {
//!             sigsafe::clear_received();
//!             // handle the signal
//!         }
//!         ret => break ret,
//!     }
//! };
//! # let _ = ret;
//! ```
//!
//! # Caveats
//!
//! Signals delivered to a thread which has not called [`install_tsd`] are
//! ignored by the dispatcher. Handlers installed through other means should
//! mask the safe signals.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("sigsafe trampolines are only implemented for x86_64 Linux");

pub mod context;
pub mod handler;
pub mod registry;
pub mod syscall;
pub mod tsd;

pub use context::Context;
pub use handler::{install_handler, redirect, UserHandler};
pub use tsd::{clear_received, install_tsd, signal_received, Destructor};

/// Error type used within this crate: a positive errno value.
pub type Error = libc::c_int;

/// Result type returned by functionality exposed by this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// One past the highest signal number this crate accepts.
pub const NSIG: usize = 65;
