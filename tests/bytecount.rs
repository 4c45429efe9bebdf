// SPDX-License-Identifier: Apache-2.0

//! A reader interrupted by a stream of signals must never lose a byte.

mod common;

use common::*;

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use libc::c_int;
use serial_test::serial;
use sigsafe::syscall;

const TOTAL: usize = 4 << 20;
const CHUNK: usize = 4096;

#[test]
#[serial]
fn pipe_bytecount() {
    let (rx, tx) = pipe();
    bytecount(rx, tx, syscall::read);
}

#[test]
#[serial]
fn socket_bytecount() {
    let (rx, tx) = socketpair();
    bytecount(rx, tx, |fd, buf| syscall::recv(fd, buf, 0));
}

/// Streams `TOTAL` bytes from `tx` to a signal-safe reader of `rx` while
/// the reader is signalled as often as possible.
fn bytecount(rx: OwnedFd, tx: OwnedFd, read: fn(c_int, &mut [u8]) -> isize) {
    install_handlers();

    let done = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();

    let reader = thread::spawn({
        let done = done.clone();
        move || {
            sigsafe::install_tsd(0, None).unwrap();
            ready_tx.send(unsafe { libc::pthread_self() }).unwrap();

            let mut buf = [0u8; CHUNK];
            let (mut bytes, mut interrupts) = (0usize, 0usize);
            loop {
                match read(rx.as_raw_fd(), &mut buf) {
                    0 => break,
                    EINTR => {
                        sigsafe::clear_received();
                        interrupts += 1;
                    }
                    ret if ret < 0 => panic!("read failed: {}", -ret),
                    ret => {
                        let ret = ret as usize;
                        assert!(buf[..ret].iter().all(|&b| b == 0xa5));
                        bytes += ret;
                    }
                }
            }

            done.store(true, Ordering::SeqCst);
            (bytes, interrupts)
        }
    });

    let target = ready_rx.recv().unwrap();

    let signaler = thread::spawn({
        let done = done.clone();
        move || {
            let mut sent = 0usize;
            while !done.load(Ordering::SeqCst) {
                // The reader is not joined before this thread, so its
                // pthread_t stays valid even once it has returned.
                unsafe { libc::pthread_kill(target, PLAIN) };
                sent += 1;
                thread::sleep(Duration::from_micros(50));
            }
            sent
        }
    });

    let writer = thread::spawn(move || {
        let chunk = [0xa5u8; CHUNK];
        for _ in 0..TOTAL / CHUNK {
            write_all(&tx, &chunk);
        }
    });

    writer.join().unwrap();
    let sent = signaler.join().unwrap();
    let (bytes, interrupts) = reader.join().unwrap();

    assert_eq!(bytes, TOTAL);
    assert!(interrupts <= sent, "{} interrupts from {} signals", interrupts, sent);
}
