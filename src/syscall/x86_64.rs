// SPDX-License-Identifier: Apache-2.0

//! Trampolines for x86_64 Linux
//!
//! Every trampoline has the same shape:
//!
//! ```text
//! sigsafe_NAME:
//!         mov     r11, rdi                ; r11 = thread signal state
//!         ...                             ; load the syscall arguments
//!         mov     eax, NR
//!         test    r11, r11
//!         jz      sigsafe_NAME_maxjmp     ; unregistered thread: plain call
//!         cmp     BYTE PTR [r11], 0       ; load the flag
//! sigsafe_NAME_minjmp:
//!         jne     sigsafe_NAME_jmpto
//! sigsafe_NAME_maxjmp:
//!         syscall
//!         ret
//! sigsafe_NAME_jmpto:
//!         mov     rax, -EINTR
//!         ret
//! ```
//!
//! Nothing is pushed onto the stack, so `ret` is correct from the resume
//! target no matter where execution was redirected from.

use crate::registry::SyscallDescriptor;
use crate::tsd::ThreadSignalState;

use core::arch::global_asm;
use core::ffi::{c_long, c_void};
use core::mem::offset_of;
use core::ptr::addr_of;

use paste::paste;

/// The raw system call argument vector.
pub(crate) type Args = [usize; 6];

/// The internal calling convention of every trampoline.
///
/// `tsd` points at the caller's [`ThreadSignalState`] or is null.
pub(crate) type Trampoline =
    unsafe extern "sysv64" fn(tsd: *const c_void, args: *const Args) -> c_long;

const RECEIVED: usize = offset_of!(ThreadSignalState, signal_received);
const EINTR: i64 = -(libc::EINTR as i64);

macro_rules! trampolines {
    ($($name:ident => $nr:path),+ $(,)?) => {
        paste! {
            extern "sysv64" {
                $(
                    #[doc = concat!("Signal-safe `", stringify!($name), "` trampoline")]
                    pub(crate) fn [<sigsafe_ $name>](
                        tsd: *const c_void,
                        args: *const Args,
                    ) -> c_long;
                )+
            }

            $(
                global_asm!(
                    ".pushsection .rodata.sigsafe_names,\"a\",@progbits",
                    concat!(".global sigsafe_", stringify!($name), "_name"),
                    concat!(".hidden sigsafe_", stringify!($name), "_name"),
                    concat!("sigsafe_", stringify!($name), "_name:"),
                    concat!(".asciz \"", stringify!($name), "\""),
                    ".popsection",

                    ".pushsection .text.sigsafe,\"ax\",@progbits",
                    ".p2align 4",
                    concat!(".global sigsafe_", stringify!($name)),
                    concat!(".hidden sigsafe_", stringify!($name)),
                    concat!(".type sigsafe_", stringify!($name), ",@function"),
                    concat!("sigsafe_", stringify!($name), ":"),

                    "mov    r11,    rdi                 ",  // r11 = thread signal state
                    "mov    rax,    rsi                 ",  // rax = argument vector
                    "mov    rdi,    QWORD PTR [rax]     ",
                    "mov    rsi,    QWORD PTR [rax + 8] ",
                    "mov    rdx,    QWORD PTR [rax + 16]",
                    "mov    r10,    QWORD PTR [rax + 24]",
                    "mov    r8,     QWORD PTR [rax + 32]",
                    "mov    r9,     QWORD PTR [rax + 40]",
                    "mov    eax,    {NR}                ",  // rax = syscall number
                    "test   r11,    r11                 ",  // If no state is installed...
                    concat!("jz     sigsafe_", stringify!($name), "_maxjmp"),  // ... just call

                    "cmp    BYTE PTR [r11 + {RECEIVED}], 0",  // Load the flag

                    concat!(".global sigsafe_", stringify!($name), "_minjmp"),
                    concat!(".hidden sigsafe_", stringify!($name), "_minjmp"),
                    concat!("sigsafe_", stringify!($name), "_minjmp:"),
                    concat!("jne    sigsafe_", stringify!($name), "_jmpto"),  // Signal received: bail

                    concat!(".global sigsafe_", stringify!($name), "_maxjmp"),
                    concat!(".hidden sigsafe_", stringify!($name), "_maxjmp"),
                    concat!("sigsafe_", stringify!($name), "_maxjmp:"),
                    "syscall",
                    "ret",

                    concat!(".global sigsafe_", stringify!($name), "_jmpto"),
                    concat!(".hidden sigsafe_", stringify!($name), "_jmpto"),
                    concat!("sigsafe_", stringify!($name), "_jmpto:"),
                    "mov    rax,    {EINTR}             ",
                    "ret",

                    concat!(".size sigsafe_", stringify!($name), ", . - sigsafe_", stringify!($name)),
                    ".popsection",

                    NR = const $nr,
                    RECEIVED = const RECEIVED,
                    EINTR = const EINTR,
                );
            )+

            const COUNT: usize = [$(stringify!($name)),+].len();

            global_asm!(
                ".pushsection .data.rel.ro.sigsafe_syscalls,\"aw\",@progbits",
                ".p2align 3",
                ".global sigsafe_syscalls",
                ".hidden sigsafe_syscalls",
                "sigsafe_syscalls:",
                $(
                    concat!(".quad sigsafe_", stringify!($name), "_name"),
                    concat!(".quad sigsafe_", stringify!($name)),
                    concat!(".quad sigsafe_", stringify!($name), "_minjmp"),
                    concat!(".quad sigsafe_", stringify!($name), "_maxjmp"),
                    concat!(".quad sigsafe_", stringify!($name), "_jmpto"),
                )+
                ".popsection",
            );

            extern "C" {
                #[allow(non_upper_case_globals)]
                static sigsafe_syscalls: [SyscallDescriptor; COUNT];
            }
        }
    };
}

trampolines! {
    accept => libc::SYS_accept,
    connect => libc::SYS_connect,
    epoll_wait => libc::SYS_epoll_wait,
    nanosleep => libc::SYS_nanosleep,
    pause => libc::SYS_pause,
    poll => libc::SYS_poll,
    read => libc::SYS_read,
    readv => libc::SYS_readv,
    recvfrom => libc::SYS_recvfrom,
    recvmsg => libc::SYS_recvmsg,
    select => libc::SYS_select,
    sendmsg => libc::SYS_sendmsg,
    sendto => libc::SYS_sendto,
    sigsuspend => libc::SYS_rt_sigsuspend,
    wait4 => libc::SYS_wait4,
    write => libc::SYS_write,
    writev => libc::SYS_writev,
}

/// The descriptor table emitted with the trampolines.
#[inline]
pub(crate) fn descriptors() -> &'static [SyscallDescriptor] {
    // SAFETY: the table is fully initialized by the assembler and linker and
    // never written afterwards.
    unsafe { &*addr_of!(sigsafe_syscalls) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_offset() {
        assert_eq!(RECEIVED, 0);
    }

    #[test]
    fn entries() {
        let entries = descriptors().iter().map(|s| s.entry()).collect::<Vec<_>>();
        assert!(entries.contains(&(sigsafe_read as *const () as usize)));
        assert!(entries.contains(&(sigsafe_pause as *const () as usize)));
    }
}
