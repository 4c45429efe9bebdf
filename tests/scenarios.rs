// SPDX-License-Identifier: Apache-2.0

mod common;

use common::*;

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serial_test::serial;
use sigsafe::syscall;

#[test]
#[serial]
fn signal_before_call() {
    install_handlers();

    thread::spawn(|| {
        sigsafe::install_tsd(0, None).unwrap();
        let (rx, tx) = pipe();
        write_all(&tx, b"asdf");

        raise_here(PLAIN);
        assert_eq!(sigsafe::signal_received(), Some(true));

        let mut buf = [0u8; 4];
        assert_eq!(syscall::read(rx.as_raw_fd(), &mut buf), EINTR);
        assert_eq!(buf, [0; 4]);

        sigsafe::clear_received();
        assert_eq!(syscall::read(rx.as_raw_fd(), &mut buf), 4);
        assert_eq!(&buf, b"asdf");
    })
    .join()
    .unwrap();
}

#[test]
#[serial]
fn flag_persists_until_cleared() {
    install_handlers();

    thread::spawn(|| {
        sigsafe::install_tsd(0x5afe, None).unwrap();
        let (rx, tx) = pipe();
        write_all(&tx, b"x");
        let mut buf = [0u8; 1];

        for _ in 0..3 {
            raise_here(PLAIN);
        }

        for _ in 0..3 {
            assert_eq!(sigsafe::signal_received(), Some(true));
            assert_eq!(syscall::read(rx.as_raw_fd(), &mut buf), EINTR);
        }

        // Deliveries coalesce: one clear accounts for all of them.
        assert_eq!(sigsafe::clear_received(), 0x5afe);
        assert_eq!(sigsafe::signal_received(), Some(false));
        assert_eq!(syscall::read(rx.as_raw_fd(), &mut buf), 1);
    })
    .join()
    .unwrap();
}

#[test]
#[serial]
fn unregistered_thread_is_inert() {
    install_handlers();

    let (registered_tx, registered_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let registered = thread::spawn(move || {
        sigsafe::install_tsd(0, None).unwrap();
        registered_tx.send(()).unwrap();
        done_rx.recv().unwrap();
        sigsafe::signal_received()
    });
    registered_rx.recv().unwrap();

    thread::spawn(|| {
        let (rx, tx) = pipe();
        write_all(&tx, b"z");

        raise_here(PLAIN);
        assert_eq!(sigsafe::signal_received(), None);

        let mut buf = [0u8; 1];
        assert_eq!(syscall::read(rx.as_raw_fd(), &mut buf), 1);
        assert_eq!(&buf, b"z");
    })
    .join()
    .unwrap();

    done_tx.send(()).unwrap();
    assert_eq!(registered.join().unwrap(), Some(false));
}

#[test]
#[serial]
fn blocked_call_interrupted() {
    install_handlers();

    let (rx, tx) = pipe();
    let (ready_tx, ready_rx) = mpsc::channel();

    let reader = thread::spawn(move || {
        sigsafe::install_tsd(0, None).unwrap();
        ready_tx.send(unsafe { libc::pthread_self() }).unwrap();

        let mut buf = [0u8; 1];
        let ret = syscall::read(rx.as_raw_fd(), &mut buf);
        (ret, sigsafe::signal_received(), rx)
    });

    let target = ready_rx.recv().unwrap();
    // Wherever the reader is by now, a single signal must end the call.
    thread::sleep(Duration::from_millis(50));
    signal_thread(target, PLAIN);

    let (ret, received, rx) = reader.join().unwrap();
    assert_eq!(ret, EINTR);
    assert_eq!(received, Some(true));

    // Nothing was consumed.
    write_all(&tx, b"q");
    let mut buf = [0u8; 2];
    assert_eq!(syscall::read(rx.as_raw_fd(), &mut buf), 1);
    assert_eq!(buf[0], b'q');
}

#[test]
#[serial]
fn blocked_pause_interrupted() {
    install_handlers();

    let (ready_tx, ready_rx) = mpsc::channel();
    let sleeper = thread::spawn(move || {
        sigsafe::install_tsd(0, None).unwrap();
        ready_tx.send(unsafe { libc::pthread_self() }).unwrap();
        syscall::pause()
    });

    let target = ready_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    signal_thread(target, PLAIN);

    assert_eq!(sleeper.join().unwrap(), -libc::EINTR);
}

#[test]
#[serial]
fn completed_call_keeps_result() {
    install_handlers();

    thread::spawn(|| {
        sigsafe::install_tsd(0, None).unwrap();
        let (rx, tx) = pipe();
        write_all(&tx, b"done");

        let mut buf = [0u8; 4];
        assert_eq!(syscall::read(rx.as_raw_fd(), &mut buf), 4);

        // A signal after the call is only seen by the next one.
        raise_here(PLAIN);
        assert_eq!(&buf, b"done");
        assert_eq!(syscall::read(rx.as_raw_fd(), &mut buf), EINTR);
    })
    .join()
    .unwrap();
}

#[test]
#[serial]
fn user_handler_runs_before_flag() {
    install_handlers();

    thread::spawn(|| {
        let notes = Box::new(Notes::default());
        sigsafe::install_tsd(notes.as_user_data(), None).unwrap();

        raise_here(NOTED);
        assert_eq!(notes.count.load(Ordering::SeqCst), 1);
        assert_eq!(notes.signum.load(Ordering::SeqCst), NOTED);
        assert_eq!(notes.si_signo.load(Ordering::SeqCst), NOTED);
        assert!(!notes.flag_was_set.load(Ordering::SeqCst));
        assert_ne!(notes.resume_address.load(Ordering::SeqCst), 0);
        assert_eq!(sigsafe::signal_received(), Some(true));

        raise_here(NOTED);
        assert_eq!(notes.count.load(Ordering::SeqCst), 2);
        assert!(notes.flag_was_set.load(Ordering::SeqCst));

        // Signals without a user handler leave the notes alone.
        raise_here(PLAIN);
        assert_eq!(notes.count.load(Ordering::SeqCst), 2);

        let user_data = sigsafe::clear_received();
        assert_eq!(user_data, notes.as_user_data());
        assert_eq!(sigsafe::signal_received(), Some(false));
    })
    .join()
    .unwrap();
}

#[test]
#[serial]
fn safe_signals_mask_each_other() {
    install_handlers();

    // NOTED is registered after PLAIN: its own action blocks PLAIN, and
    // registering it widened the action of PLAIN to block NOTED.
    for (signum, other) in [(PLAIN, NOTED), (NOTED, PLAIN)] {
        let mask = action_mask(signum);
        assert_eq!(unsafe { libc::sigismember(&mask, other) }, 1);
        assert_eq!(unsafe { libc::sigismember(&mask, signum) }, 1);
    }

    thread::spawn(|| {
        let notes = Box::new(Notes::default());
        sigsafe::install_tsd(notes.as_user_data(), None).unwrap();
        assert!(!blocked(PLAIN));

        raise_here(NOTED);
        assert_eq!(notes.count.load(Ordering::SeqCst), 1);
        assert!(notes.plain_blocked.load(Ordering::SeqCst));

        // The mask is restored once the handler returns.
        assert!(!blocked(PLAIN));
        assert!(!blocked(NOTED));
        sigsafe::clear_received();
    })
    .join()
    .unwrap();
}

#[test]
#[serial]
fn destructor_sees_user_data() {
    static RUNS: AtomicUsize = AtomicUsize::new(0);
    static SIGNUM: AtomicUsize = AtomicUsize::new(0);

    fn destructor(user_data: usize) {
        RUNS.fetch_add(1, Ordering::SeqCst);
        let notes = unsafe { Box::from_raw(user_data as *mut Notes) };
        SIGNUM.store(notes.signum.load(Ordering::SeqCst) as usize, Ordering::SeqCst);
    }

    install_handlers();

    thread::spawn(|| {
        let notes = Box::into_raw(Box::<Notes>::default()) as usize;
        sigsafe::install_tsd(notes, Some(destructor)).unwrap();
        raise_here(NOTED);
        // Exit without clearing.
    })
    .join()
    .unwrap();

    assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(SIGNUM.load(Ordering::SeqCst), NOTED as usize);
}

#[test]
#[serial]
fn install_unknown_signal() {
    assert_eq!(sigsafe::install_handler(libc::SIGKILL, None), Err(libc::EINVAL));
}
