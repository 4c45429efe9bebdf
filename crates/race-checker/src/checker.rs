// SPDX-License-Identifier: Apache-2.0

//! Discovery, sweep and classification
//!
//! A race is first traced once with its event already available, recording
//! the address of every instruction the child executes and the trace indices
//! of its trampoline's jump region. Every case then replays the race up to
//! some trace index, injects the safe signal and lets the child finish.

use crate::race::{Fixture, Outcome, Race};
use crate::trace::{Event, Tracee};

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use libc::c_int;
use log::{debug, info, warn};
use sigsafe::registry::{self, SyscallDescriptor};

/// How much of each trace to sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A few instructions on each side of the jump region.
    Quick {
        /// Instructions swept on each side.
        radius: usize,
    },
    /// Every traced instruction.
    Full,
}

/// Checker settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// A step that does not trap within this is blocked in the kernel.
    pub step_timeout: Duration,
    /// A running child that does not exit within this is hung.
    pub hang_timeout: Duration,
    /// The safe signal to inject.
    pub signal: c_int,
    /// Discovery gives up after this many steps.
    pub max_steps: usize,
    /// How much to sweep.
    pub mode: Mode,
}

/// When the event is supplied, relative to the injected signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Before the child starts.
    Ready,
    /// Only once the child has gone a hang timeout without returning.
    Late,
    /// As `Late`, but the signal is sent while the call blocks in the kernel.
    Blocked,
}

/// One signal injection to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Case {
    /// When the event is supplied.
    pub placement: Placement,
    /// The trace index the signal is injected at.
    pub offset: usize,
    /// The only acceptable result.
    pub expected: Outcome,
}

impl fmt::Display for Case {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.placement {
            Placement::Ready => write!(f, "ready@{}", self.offset),
            Placement::Late => write!(f, "late@{}", self.offset),
            Placement::Blocked => write!(f, "blocked@{}", self.offset),
        }
    }
}

/// What a case actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The child reported an outcome.
    Returned(Outcome),
    /// The child reported an outcome only after the late event.
    ReturnedLate(Outcome),
    /// The child was terminated by a signal.
    Crashed(c_int),
    /// The child exited with a code no outcome maps to.
    Exited(c_int),
    /// The child did not return, even after the event was supplied.
    Hung,
    /// The step expected to block in the kernel completed.
    NotBlocked,
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned(outcome) => write!(f, "{}", outcome),
            Self::ReturnedLate(outcome) => write!(f, "{} after late event", outcome),
            Self::Crashed(signal) => write!(f, "killed by signal {}", signal),
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Hung => write!(f, "hung"),
            Self::NotBlocked => write!(f, "did not block"),
        }
    }
}

impl From<Event> for Observation {
    fn from(event: Event) -> Self {
        match event {
            Event::Exited(code) => {
                Outcome::from_code(code).map_or(Self::Exited(code), Self::Returned)
            }
            Event::Killed(signal) => Self::Crashed(signal),
            Event::Stopped(_) | Event::Timeout => Self::Hung,
        }
    }
}

/// The traced run of a race without any signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// The address of the next instruction at every stop.
    pub trace: Vec<usize>,
    /// Trace index at which the next instruction is `min_jump`.
    pub min_jump: usize,
    /// Trace index at which the next instruction is `max_jump`.
    pub max_jump: usize,
}

impl Discovery {
    fn new(trace: Vec<usize>, syscall: &SyscallDescriptor) -> Result<Self> {
        let index = |addr: usize, what: &str| {
            trace
                .iter()
                .position(|&rip| rip == addr)
                .with_context(|| format!("trace never reached {} of {}", what, syscall.name()))
        };

        Ok(Self {
            min_jump: index(syscall.min_jump(), "min_jump")?,
            max_jump: index(syscall.max_jump(), "max_jump")?,
            trace,
        })
    }

    /// The trace indices to inject at.
    pub fn range(&self, mode: Mode) -> Range<usize> {
        match mode {
            Mode::Full => 0..self.trace.len(),
            Mode::Quick { radius } => {
                let start = self.min_jump.saturating_sub(radius);
                let end = self.max_jump.saturating_add(radius).saturating_add(1);
                let end = end.min(self.trace.len());
                start..end
            }
        }
    }

    /// Every case for a race whose completed call consumes the event iff
    /// `consumes`.
    pub fn cases(&self, mode: Mode, consumes: bool) -> Vec<Case> {
        let range = self.range(mode);
        let mut cases = Vec::new();

        for offset in range.clone() {
            let expected = if offset <= self.max_jump {
                Outcome::Interrupted { pending: true }
            } else {
                Outcome::Normal {
                    pending: !consumes,
                }
            };

            cases.push(Case {
                placement: Placement::Ready,
                offset,
                expected,
            });
        }

        for offset in range.filter(|&offset| offset <= self.max_jump) {
            cases.push(Case {
                placement: Placement::Late,
                offset,
                expected: Outcome::Interrupted { pending: false },
            });
        }

        cases.push(Case {
            placement: Placement::Blocked,
            offset: self.max_jump,
            expected: Outcome::Interrupted { pending: false },
        });

        cases
    }
}

/// A case whose observation differed from its expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    /// The failing case.
    pub case: Case,
    /// What it did instead.
    pub observed: Observation,
}

/// The result of checking one race.
#[derive(Debug)]
pub struct Report {
    /// The race's name.
    pub name: &'static str,
    /// How many cases ran.
    pub cases: usize,
    /// The cases that failed.
    pub failures: Vec<Failure>,
}

/// Prints the reports as a table, followed by one row per failed case.
pub fn print(reports: &[Report]) {
    println!("{:<12} {:>6} {:>7}", "TEST", "CASES", "FAILED");
    for report in reports {
        println!(
            "{:<12} {:>6} {:>7}",
            report.name,
            report.cases,
            report.failures.len()
        );
    }

    if reports.iter().all(|r| r.failures.is_empty()) {
        return;
    }

    println!();
    println!("{:<12} {:<12} {:<32} EXPECTED", "TEST", "CASE", "OBSERVED");
    for report in reports {
        for failure in &report.failures {
            println!(
                "{:<12} {:<12} {:<32} {}",
                report.name,
                failure.case.to_string(),
                failure.observed.to_string(),
                failure.case.expected
            );
        }
    }
}

/// Drives the races.
#[derive(Debug)]
pub struct Checker {
    config: Config,
}

impl Checker {
    /// Creates a checker. `SIGCHLD` is blocked in the calling thread.
    pub fn new(config: Config) -> Result<Self> {
        crate::trace::block_sigchld()?;
        Ok(Self { config })
    }

    /// Checks each race, printing a table of results.
    ///
    /// Fails if any case of any race failed.
    pub fn run(&self, races: &[&'static Race]) -> Result<()> {
        let mut reports = Vec::new();
        for race in races {
            reports.push(self.check(race)?);
        }

        print(&reports);

        let failed = reports.iter().filter(|r| !r.failures.is_empty()).count();
        if failed > 0 {
            bail!("{} of {} races failed", failed, reports.len());
        }
        Ok(())
    }

    /// Checks every case of one race.
    pub fn check(&self, race: &'static Race) -> Result<Report> {
        let syscall = registry::lookup(race.syscall)
            .with_context(|| format!("no trampoline named {}", race.syscall))?;

        let discovery = self.discover(race, syscall)?;
        info!(
            "{}: {} instructions traced, jump region at [{}, {}]",
            race.name,
            discovery.trace.len(),
            discovery.min_jump,
            discovery.max_jump
        );

        let cases = discovery.cases(self.config.mode, race.consumes);
        let mut failures = Vec::new();
        for case in &cases {
            let observed = self.run_case(race, &discovery, case)?;
            debug!("{}: {} observed {}", race.name, case, observed);

            if observed != Observation::Returned(case.expected) {
                warn!(
                    "{}: {} observed {}, expected {}",
                    race.name, case, observed, case.expected
                );
                failures.push(Failure {
                    case: *case,
                    observed,
                });
            }
        }

        Ok(Report {
            name: race.name,
            cases: cases.len(),
            failures,
        })
    }

    fn spawn(&self, race: &'static Race, fixture: &Fixture) -> Result<Tracee> {
        let signal = self.config.signal;
        Tracee::spawn(
            || {
                sigsafe::install_handler(signal, None)
                    .map_err(std::io::Error::from_raw_os_error)
                    .context("failed to install handler")?;
                sigsafe::install_tsd(0, None)
                    .map_err(std::io::Error::from_raw_os_error)
                    .context("failed to install thread state")
            },
            || race.run(fixture),
            self.config.hang_timeout,
        )
    }

    fn discover(&self, race: &'static Race, syscall: &SyscallDescriptor) -> Result<Discovery> {
        let fixture = race.setup()?;
        fixture.nudge()?;

        let mut child = self.spawn(race, &fixture)?;
        let mut trace = vec![child.rip()?];

        loop {
            if trace.len() > self.config.max_steps {
                bail!("{}: gave up after {} steps", race.name, self.config.max_steps);
            }

            child.step()?;
            match child.wait(self.config.step_timeout)? {
                Event::Stopped(libc::SIGTRAP) => trace.push(child.rip()?),
                Event::Exited(code) => {
                    let outcome = Outcome::from_code(code);
                    let expected = Outcome::Normal {
                        pending: !race.consumes,
                    };
                    if outcome != Some(expected) {
                        bail!("{}: untraced run exited with code {}", race.name, code);
                    }
                    break;
                }
                event => bail!("{}: untraced run did not complete: {:?}", race.name, event),
            }
        }

        Discovery::new(trace, syscall)
    }

    /// Single-steps to `offset`. Returns an observation if the child ended
    /// or hung on the way.
    fn advance(
        &self,
        child: &mut Tracee,
        discovery: &Discovery,
        offset: usize,
    ) -> Result<Option<Observation>> {
        for _ in 0..offset {
            child.step()?;
            match child.wait(self.config.step_timeout)? {
                Event::Stopped(libc::SIGTRAP) => {}
                event => return Ok(Some(event.into())),
            }
        }

        let rip = child.rip()?;
        if rip != discovery.trace[offset] {
            warn!(
                "tracee {} diverged at {}: {:#x} instead of {:#x}",
                child.pid(),
                offset,
                rip,
                discovery.trace[offset]
            );
        }
        Ok(None)
    }

    /// Lets the child finish, supplying the event if it does not return on
    /// its own.
    fn settle(&self, child: &mut Tracee, fixture: &Fixture) -> Result<Observation> {
        match child.finish(self.config.hang_timeout)? {
            Event::Timeout => {}
            event => return Ok(event.into()),
        }

        fixture.nudge()?;
        Ok(match child.finish(self.config.hang_timeout)? {
            Event::Exited(code) => match Outcome::from_code(code) {
                Some(outcome) => Observation::ReturnedLate(outcome),
                None => Observation::Exited(code),
            },
            event => event.into(),
        })
    }

    fn run_case(
        &self,
        race: &'static Race,
        discovery: &Discovery,
        case: &Case,
    ) -> Result<Observation> {
        let signal = self.config.signal;
        let fixture = race.setup()?;
        if case.placement == Placement::Ready {
            fixture.nudge()?;
        }

        let mut child = self.spawn(race, &fixture)?;
        if let Some(observed) = self.advance(&mut child, discovery, case.offset)? {
            return Ok(observed);
        }

        match case.placement {
            Placement::Ready => {
                child.cont(signal)?;
                Ok(child.finish(self.config.hang_timeout)?.into())
            }

            Placement::Late => {
                child.cont(signal)?;
                self.settle(&mut child, &fixture)
            }

            Placement::Blocked => {
                child.step()?;
                match child.wait(self.config.step_timeout)? {
                    Event::Timeout => {}
                    Event::Stopped(_) => return Ok(Observation::NotBlocked),
                    event => return Ok(event.into()),
                }

                child.kill(signal)?;

                // The interrupted step may report its trap before the signal.
                loop {
                    match child.wait(self.config.hang_timeout)? {
                        Event::Stopped(sig) if sig == signal => break,
                        Event::Stopped(_) => child.cont(0)?,
                        event => return Ok(event.into()),
                    }
                }

                child.cont(signal)?;
                self.settle(&mut child, &fixture)
            }
        }
    }
}
