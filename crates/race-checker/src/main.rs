// SPDX-License-Identifier: Apache-2.0

//! Checks every `sigsafe` trampoline for signal races.
//!
//! Each race forks a child which calls one trampoline while being
//! single-stepped over `ptrace(2)`. The safe signal is injected after every
//! instruction in turn, and the child's result is compared against what the
//! jump region protocol demands at that instruction.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

mod checker;
mod cli;
mod race;
mod trace;

use clap::Parser;

fn main() -> anyhow::Result<()> {
    let app = cli::Options::parse();
    app.execute()
}
