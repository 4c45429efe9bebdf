// SPDX-License-Identifier: Apache-2.0

//! Table of trampoline jump regions
//!
//! The table is emitted by the assembler alongside the trampolines, so every
//! address in it is fixed at link time and the table is never written after
//! relocation. It may be read from any thread and from signal context.

use crate::syscall::arch;

use core::ffi::{c_char, CStr};
use core::fmt;

/// Describes the jump region of one trampoline.
#[repr(C)]
pub struct SyscallDescriptor {
    name: *const c_char,
    entry: usize,
    min_jump: usize,
    max_jump: usize,
    resume_target: usize,
}

// SAFETY: descriptors are immutable and `name` points to static data.
unsafe impl Sync for SyscallDescriptor {}

impl SyscallDescriptor {
    /// The name of the wrapped system call.
    pub fn name(&self) -> &'static str {
        // SAFETY: `name` points to a NUL-terminated ASCII string emitted with
        // the trampoline.
        unsafe { CStr::from_ptr(self.name) }
            .to_str()
            .unwrap_or("?")
    }

    /// The trampoline's entry point.
    #[inline]
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// The first instruction after the thread's flag has been loaded.
    ///
    /// A signal arriving before this point is seen by the trampoline's own
    /// flag check.
    #[inline]
    pub fn min_jump(&self) -> usize {
        self.min_jump
    }

    /// The instruction which enters the kernel; the last redirectable one.
    #[inline]
    pub fn max_jump(&self) -> usize {
        self.max_jump
    }

    /// Where redirected execution resumes. It always yields `-EINTR`.
    #[inline]
    pub fn resume_target(&self) -> usize {
        self.resume_target
    }

    /// Whether `addr` lies within the inclusive jump region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.min_jump <= addr && addr <= self.max_jump
    }
}

impl fmt::Debug for SyscallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallDescriptor")
            .field("name", &self.name())
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("min_jump", &format_args!("{:#x}", self.min_jump))
            .field("max_jump", &format_args!("{:#x}", self.max_jump))
            .field("resume_target", &format_args!("{:#x}", self.resume_target))
            .finish()
    }
}

/// All trampoline descriptors.
#[inline]
pub fn syscalls() -> &'static [SyscallDescriptor] {
    arch::descriptors()
}

/// Finds the descriptor whose jump region contains `addr`.
///
/// This is async-signal-safe.
#[inline]
pub fn find(addr: usize) -> Option<&'static SyscallDescriptor> {
    syscalls().iter().find(|s| s.contains(addr))
}

/// Finds the descriptor of the trampoline wrapping the system call `name`.
pub fn lookup(name: &str) -> Option<&'static SyscallDescriptor> {
    syscalls().iter().find(|s| s.name() == name)
}
