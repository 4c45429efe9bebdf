// SPDX-License-Identifier: Apache-2.0

use std::ffi::c_void;
use std::process::{Command, Stdio};
use std::ptr::null_mut;
use std::time::Duration;

use process_control::{ChildExt, Control, Output};

const CHECKER_BIN: &str = env!("CARGO_BIN_EXE_race-checker");
const TIMEOUT_SECS: u64 = 120;

fn run(args: &[&str]) -> Output {
    let child = Command::new(CHECKER_BIN)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("failed to run `{:?}`: {:#?}", args, e));

    let output = child
        .controlled_with_output()
        .time_limit(Duration::from_secs(TIMEOUT_SECS))
        .terminate_for_timeout()
        .wait()
        .unwrap_or_else(|e| panic!("failed to run `{:?}`: {:#?}", args, e))
        .unwrap_or_else(|| panic!("process `{:?}` timed out", args));

    assert!(
        output.status.code().is_some(),
        "process `{:?}` terminated by signal {:?}",
        args,
        output.status.signal()
    );

    output
}

/// Whether this environment lets a child be traced by its parent.
fn traceable() -> bool {
    unsafe {
        match libc::fork() {
            -1 => false,
            0 => {
                let ret = libc::ptrace(
                    libc::PTRACE_TRACEME,
                    0,
                    null_mut::<c_void>(),
                    null_mut::<c_void>(),
                );
                libc::_exit(if ret < 0 { 1 } else { 0 })
            }
            pid => {
                let mut status = 0;
                libc::waitpid(pid, &mut status, 0) == pid
                    && libc::WIFEXITED(status)
                    && libc::WEXITSTATUS(status) == 0
            }
        }
    }
}

#[test]
fn list() {
    let output = run(&["list"]);
    assert!(output.status.success(), "{:?}", output);

    let stdout = String::from_utf8(output.stdout).unwrap();
    let names = stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        ["read", "readv", "recv", "recvmsg", "poll", "select", "epoll_wait", "accept"]
    );
}

#[test]
fn unknown_race() {
    let output = run(&["quick", "open"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("unknown race"), "{}", stderr);
}

#[test]
fn bad_signal() {
    let output = run(&["quick", "--signal", "SIGKILL", "read"]);
    assert!(!output.status.success());
}

#[test]
fn quick_read() {
    if !traceable() {
        eprintln!("ptrace is not permitted here; skipping");
        return;
    }

    let output = run(&["quick", "--radius", "4", "read"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );

    let row = stdout
        .lines()
        .find(|line| line.starts_with("read "))
        .expect("no result row for read");
    let columns = row.split_whitespace().collect::<Vec<_>>();
    assert_eq!(columns.len(), 3, "{}", row);
    assert_eq!(columns[2], "0", "{}", row);
}
