// SPDX-License-Identifier: Apache-2.0

//! The races: one blocking trampoline call each, waiting on one event
//!
//! A race's fixture is built by the checker before forking, so both the
//! checker and the traced child share its descriptors. The checker supplies
//! the event (the "nudge"); the child makes the call and reports how it
//! returned through its exit code.

use std::cell::RefCell;
use std::fmt;
use std::io::{Error, IoSliceMut};
use std::mem::zeroed;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::null_mut;

use anyhow::{Context, Result};
use libc::c_int;
use sigsafe::syscall;

/// How a traced call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call returned `-EINTR`.
    Interrupted {
        /// Whether the event was still available afterwards.
        pending: bool,
    },
    /// The call returned its normal result.
    Normal {
        /// Whether the event was still available afterwards.
        pending: bool,
    },
    /// Anything else.
    Weird,
}

impl Outcome {
    fn classify(ret: isize, pending: bool) -> Self {
        match ret {
            ret if ret == -(libc::EINTR as isize) => Self::Interrupted { pending },
            ret if ret > 0 => Self::Normal { pending },
            _ => Self::Weird,
        }
    }

    /// The exit code a child reports this outcome with.
    pub fn code(self) -> c_int {
        match self {
            Self::Interrupted { pending: false } => 10,
            Self::Interrupted { pending: true } => 11,
            Self::Normal { pending: false } => 12,
            Self::Normal { pending: true } => 13,
            Self::Weird => 14,
        }
    }

    /// Decodes a child's exit code.
    pub fn from_code(code: c_int) -> Option<Self> {
        Some(match code {
            10 => Self::Interrupted { pending: false },
            11 => Self::Interrupted { pending: true },
            12 => Self::Normal { pending: false },
            13 => Self::Normal { pending: true },
            14 => Self::Weird,
            _ => return None,
        })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted { pending: true } => write!(f, "interrupted, event pending"),
            Self::Interrupted { pending: false } => write!(f, "interrupted"),
            Self::Normal { pending: true } => write!(f, "normal, event pending"),
            Self::Normal { pending: false } => write!(f, "normal"),
            Self::Weird => write!(f, "weird"),
        }
    }
}

/// Where the event comes from.
#[derive(Debug)]
enum Source {
    /// A byte written to the other end of a pipe or socket pair.
    Stream(OwnedFd),
    /// A connection to a listening socket.
    Listener {
        addr: SocketAddr,
        clients: RefCell<Vec<TcpStream>>,
    },
}

/// The descriptors one traced call waits on.
#[derive(Debug)]
pub struct Fixture {
    rx: OwnedFd,
    source: Source,
    poller: Option<OwnedFd>,
}

impl Fixture {
    fn new(rx: OwnedFd, source: Source) -> Self {
        Self {
            rx,
            source,
            poller: None,
        }
    }

    fn pipe() -> Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(Error::last_os_error()).context("pipe2 failed");
        }

        let [rx, tx] = fds.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(Self::new(rx, Source::Stream(tx)))
    }

    fn socketpair() -> Result<Self> {
        let mut fds = [0; 2];
        let ty = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
        if unsafe { libc::socketpair(libc::AF_UNIX, ty, 0, fds.as_mut_ptr()) } < 0 {
            return Err(Error::last_os_error()).context("socketpair failed");
        }

        let [rx, tx] = fds.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(Self::new(rx, Source::Stream(tx)))
    }

    fn listener() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("failed to bind listener")?;
        let addr = listener.local_addr()?;
        let source = Source::Listener {
            addr,
            clients: RefCell::default(),
        };
        Ok(Self::new(listener.into(), source))
    }

    fn epoll() -> Result<Self> {
        let mut fixture = Self::pipe()?;

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::last_os_error()).context("epoll_create1 failed");
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fixture.rx() as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(
                epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fixture.rx(),
                &mut event,
            )
        };
        if ret < 0 {
            return Err(Error::last_os_error()).context("epoll_ctl failed");
        }

        fixture.poller = Some(epfd);
        Ok(fixture)
    }

    fn rx(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    fn poller(&self) -> RawFd {
        self.poller.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    /// Supplies the event the call waits on.
    pub fn nudge(&self) -> Result<()> {
        match &self.source {
            Source::Stream(tx) => {
                let byte = 26u8;
                let ret = unsafe { libc::write(tx.as_raw_fd(), (&byte as *const u8).cast(), 1) };
                if ret != 1 {
                    return Err(Error::last_os_error()).context("failed to write nudge");
                }
            }
            Source::Listener { addr, clients } => {
                let client = TcpStream::connect(addr).context("failed to connect nudge")?;
                clients.borrow_mut().push(client);
            }
        }
        Ok(())
    }

    /// Whether the event is available without blocking.
    pub fn pending(&self) -> bool {
        let mut fds = [libc::pollfd {
            fd: self.rx(),
            events: libc::POLLIN,
            revents: 0,
        }];
        unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) > 0 }
    }
}

fn do_read(fx: &Fixture) -> isize {
    let mut buf = [0u8; 1];
    syscall::read(fx.rx(), &mut buf)
}

fn do_readv(fx: &Fixture) -> isize {
    let mut buf = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut buf)];
    syscall::readv(fx.rx(), &mut iov)
}

fn do_recv(fx: &Fixture) -> isize {
    let mut buf = [0u8; 1];
    syscall::recv(fx.rx(), &mut buf, 0)
}

fn do_recvmsg(fx: &Fixture) -> isize {
    let mut buf = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut buf)];

    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = iov.as_mut_ptr().cast();
    msg.msg_iovlen = iov.len();

    unsafe { syscall::recvmsg(fx.rx(), &mut msg, 0) }
}

fn do_poll(fx: &Fixture) -> isize {
    let mut fds = [libc::pollfd {
        fd: fx.rx(),
        events: libc::POLLIN,
        revents: 0,
    }];
    syscall::poll(&mut fds, -1) as isize
}

fn do_select(fx: &Fixture) -> isize {
    let mut readfds: libc::fd_set = unsafe { zeroed() };
    unsafe {
        libc::FD_ZERO(&mut readfds);
        libc::FD_SET(fx.rx(), &mut readfds);
    }
    syscall::select(fx.rx() + 1, Some(&mut readfds), None, None, None) as isize
}

fn do_epoll_wait(fx: &Fixture) -> isize {
    let mut events = [libc::epoll_event { events: 0, u64: 0 }];
    syscall::epoll_wait(fx.poller(), &mut events, -1) as isize
}

fn do_accept(fx: &Fixture) -> isize {
    let fd = unsafe { syscall::accept(fx.rx(), null_mut(), null_mut()) };
    if fd < 0 {
        return fd as isize;
    }

    unsafe { libc::close(fd) };
    1
}

/// One blocking call to check.
#[derive(Debug)]
pub struct Race {
    /// The race's name on the command line.
    pub name: &'static str,
    /// The trampoline it calls.
    pub syscall: &'static str,
    /// Whether a completed call consumes the event.
    pub consumes: bool,
    /// What the call waits on.
    pub description: &'static str,
    setup: fn() -> Result<Fixture>,
    call: fn(&Fixture) -> isize,
}

impl Race {
    /// Builds a fresh fixture.
    pub fn setup(&self) -> Result<Fixture> {
        (self.setup)().with_context(|| format!("failed to set up race {}", self.name))
    }

    /// Makes the call and encodes its outcome as an exit code.
    ///
    /// This runs in the traced child.
    pub fn run(&self, fixture: &Fixture) -> c_int {
        let ret = (self.call)(fixture);
        Outcome::classify(ret, fixture.pending()).code()
    }
}

/// Every race, in the order they are run.
pub static RACES: &[Race] = &[
    Race {
        name: "read",
        syscall: "read",
        consumes: true,
        description: "one byte from a pipe",
        setup: Fixture::pipe,
        call: do_read,
    },
    Race {
        name: "readv",
        syscall: "readv",
        consumes: true,
        description: "one byte from a pipe into an iovec",
        setup: Fixture::pipe,
        call: do_readv,
    },
    Race {
        name: "recv",
        syscall: "recvfrom",
        consumes: true,
        description: "one byte from a socket pair",
        setup: Fixture::socketpair,
        call: do_recv,
    },
    Race {
        name: "recvmsg",
        syscall: "recvmsg",
        consumes: true,
        description: "one byte from a socket pair into a message",
        setup: Fixture::socketpair,
        call: do_recvmsg,
    },
    Race {
        name: "poll",
        syscall: "poll",
        consumes: false,
        description: "readability of a pipe",
        setup: Fixture::pipe,
        call: do_poll,
    },
    Race {
        name: "select",
        syscall: "select",
        consumes: false,
        description: "readability of a pipe",
        setup: Fixture::pipe,
        call: do_select,
    },
    Race {
        name: "epoll_wait",
        syscall: "epoll_wait",
        consumes: false,
        description: "level-triggered readability of a pipe",
        setup: Fixture::epoll,
        call: do_epoll_wait,
    },
    Race {
        name: "accept",
        syscall: "accept",
        consumes: true,
        description: "a loopback TCP connection",
        setup: Fixture::listener,
        call: do_accept,
    },
];

/// Looks up races by name; no names selects all of them.
pub fn select(names: &[String]) -> Result<Vec<&'static Race>> {
    if names.is_empty() {
        return Ok(RACES.iter().collect());
    }

    names
        .iter()
        .map(|name| {
            RACES
                .iter()
                .find(|race| race.name == name.as_str())
                .with_context(|| format!("unknown race {:?}", name))
        })
        .collect()
}
