// SPDX-License-Identifier: Apache-2.0

use crate::checker::{Checker, Config, Mode};
use crate::race::{self, RACES};

use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use libc::c_int;
use log::info;

/// Checks sigsafe trampolines for signal races.
///
/// Each race forks a child which makes one blocking call through a sigsafe
/// trampoline under ptrace. The safe signal is injected after each traced
/// instruction in turn, and the call's result is compared against the
/// outcome the trampoline must produce at that instruction.
#[derive(Parser, Debug)]
#[clap(version)]
pub struct Options {
    /// Logging options
    #[clap(flatten)]
    logger: LogOptions,

    /// Subcommands (with their own options)
    #[clap(subcommand)]
    cmd: Subcommands,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        self.logger.init();

        info!("logging initialized!");
        info!("CLI opts: {:?}", self);

        self.cmd.dispatch()
    }
}

/// `race-checker` subcommands and their options/arguments.
#[derive(Subcommand, Debug)]
enum Subcommands {
    /// List the available races
    List,
    /// Sweep the instructions around each jump region
    Quick(RunOptions),
    /// Sweep every traced instruction
    Full(RunOptions),
}

impl Subcommands {
    fn dispatch(self) -> anyhow::Result<()> {
        match self {
            Self::List => {
                for race in RACES {
                    println!("{:<12} {:<12} {}", race.name, race.syscall, race.description);
                }
                Ok(())
            }
            Self::Quick(opts) => {
                let radius = opts.check.radius;
                opts.execute(Mode::Quick { radius })
            }
            Self::Full(opts) => opts.execute(Mode::Full),
        }
    }
}

/// Options of a sweep
#[derive(Args, Debug)]
struct RunOptions {
    #[clap(flatten)]
    check: CheckOptions,

    /// Races to run (all of them if none are given)
    names: Vec<String>,
}

impl RunOptions {
    fn execute(self, mode: Mode) -> anyhow::Result<()> {
        let races = race::select(&self.names)?;
        let checker = Checker::new(self.check.config(mode))?;
        checker.run(&races)
    }
}

/// Tracing and timing options
#[derive(Args, Debug)]
struct CheckOptions {
    /// A single step that does not trap within this many milliseconds is
    /// treated as blocked in the kernel.
    #[clap(long, env = "SIGSAFE_STEP_TIMEOUT_MS", default_value_t = 250)]
    step_timeout_ms: u64,

    /// A resumed child that does not exit within this many milliseconds is
    /// considered hung.
    #[clap(long, env = "SIGSAFE_HANG_TIMEOUT_MS", default_value_t = 2000)]
    hang_timeout_ms: u64,

    /// The safe signal to inject ("SIGUSR1", "usr2", "10", ...)
    #[clap(long, default_value = "SIGUSR1")]
    signal: Signal,

    /// Instructions swept on each side of the jump region (quick only)
    #[clap(long, default_value_t = 8)]
    radius: usize,

    /// Give up discovery after this many steps
    #[clap(long, default_value_t = 100_000)]
    max_steps: usize,
}

impl CheckOptions {
    fn config(&self, mode: Mode) -> Config {
        Config {
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            hang_timeout: Duration::from_millis(self.hang_timeout_ms),
            signal: self.signal.0,
            max_steps: self.max_steps,
            mode,
        }
    }
}

/// A catchable signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signal(c_int);

const SIGNALS: &[(&str, c_int)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("PIPE", libc::SIGPIPE),
    ("ALRM", libc::SIGALRM),
    ("TERM", libc::SIGTERM),
    ("WINCH", libc::SIGWINCH),
];

/// Convert a str to a Signal. This is how Clap parses CLI args.
impl FromStr for Signal {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);

        let signum = match SIGNALS.iter().find(|(n, _)| *n == name) {
            Some(&(_, signum)) => signum,
            None => name
                .parse::<c_int>()
                .map_err(|_| anyhow!("unknown signal {:?}", s))?,
        };

        let usable = 0 < signum
            && signum < sigsafe::NSIG as c_int
            && ![libc::SIGKILL, libc::SIGSTOP, libc::SIGCHLD, libc::SIGTRAP].contains(&signum);
        if !usable {
            return Err(anyhow!("signal {:?} cannot be used for checking", s));
        }
        Ok(Self(signum))
    }
}

/// Where the checker logs, and how much.
#[derive(Args, Debug)]
struct LogOptions {
    /// More log output: `-v` for info, `-vv` for debug, `-vvv` for every
    /// traced stop. Warnings and errors are always shown.
    #[clap(long = "verbose", short = 'v', action = ArgAction::Count)]
    verbosity: u8,

    /// `env_logger` filter directives applied on top of `-v`, e.g.
    /// `race_checker::trace=trace`.
    #[clap(long = "log-filter", env = "SIGSAFE_LOG")]
    log_filter: Option<String>,

    /// Stream the log is written to.
    #[clap(long, value_enum, default_value_t = LogTarget::Stderr)]
    log_target: LogTarget,
}

impl LogOptions {
    /// Installs the global logger. Must be called at most once.
    fn init(&self) {
        let target = match self.log_target {
            LogTarget::Stdout => env_logger::Target::Stdout,
            LogTarget::Stderr => env_logger::Target::Stderr,
        };

        env_logger::Builder::new()
            .filter_level(self.level())
            .parse_filters(self.log_filter.as_deref().unwrap_or_default())
            .target(target)
            .init();
    }

    fn level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogTarget {
    Stdout,
    Stderr,
}
