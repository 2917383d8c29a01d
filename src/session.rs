//! One diagnostic session: parse the command, acquire the buffer, loop over
//! the tests and report.
//!
//! A session runs on one thread and never blocks on its client. Stopping is
//! cooperative: the abort monitor raises a shared flag and the session checks
//! it before every loop, every test and every output line. A test that is
//! already running finishes its passes first; nothing it finds is reported
//! once the flag is up.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::{self, MemorySource};
use crate::config::{Environment, SessionConfig, USAGE};
use crate::error::{Fault, SetupError};
use crate::logger::{log_debug, log_success};
use crate::memory::{TestRegion, WORD_BITS};
use crate::patterns::{self, Applicability, TestDescriptor, STUCK_ADDRESS};
use crate::report::Reporter;
use crate::stuck_address::test_stuck_address;

bitflags! {
    /// Aggregate result of a session, used as the process exit status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExitStatus: u8 {
        const NON_STARTER = 0x01;
        const ADDRESS_LINES = 0x02;
        const OTHER_TEST = 0x04;
    }
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        i32::from(self.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    Looping(u64),
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Completed(ExitStatus),
    /// Stopped by the abort monitor before finishing.
    Aborted,
}

impl SessionEnd {
    /// Status bits to exit with; an aborted session exits cleanly.
    pub fn exit_code(self) -> i32 {
        match self {
            SessionEnd::Completed(status) => status.code(),
            SessionEnd::Aborted => 0,
        }
    }
}

pub struct Session<W: Write> {
    reporter: Reporter<W>,
    abort: Arc<AtomicBool>,
    state: SessionState,
}

impl<W: Write> Session<W> {
    pub fn new(out: W, abort: Arc<AtomicBool>) -> Self {
        Session {
            reporter: Reporter::new(out),
            abort,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn into_inner(self) -> W {
        self.reporter.into_inner()
    }

    fn enter(&mut self, next: SessionState) {
        log_debug(&format!("session {:?} -> {:?}", self.state, next));
        self.state = next;
    }

    fn aborted(&mut self) -> bool {
        if self.abort.load(Ordering::SeqCst) {
            if self.state != SessionState::Aborted {
                self.enter(SessionState::Aborted);
            }
            return true;
        }
        false
    }

    /// Emits a line unless the session has been told to stop.
    ///
    /// Returns `false` once aborted so callers can bail out.
    fn say(&mut self, text: &str) -> bool {
        if self.aborted() {
            return false;
        }
        self.reporter.line(text);
        true
    }

    fn non_starter(&mut self, error: &SetupError) -> SessionEnd {
        crate::log_error_fmt!("session not started: {error}");
        self.say(&format!("error: {error}"));
        if matches!(error, SetupError::Usage(_)) {
            self.say(USAGE);
        }
        self.enter(SessionState::Completed);
        SessionEnd::Completed(ExitStatus::NON_STARTER)
    }

    /// Runs the session described by `command` against memory from `source`.
    pub fn run<S>(&mut self, command: &str, env: &Environment, source: &mut S) -> SessionEnd
    where
        S: MemorySource + ?Sized,
    {
        self.say(&format!(
            "memtesterd version {} ({}-bit)",
            env!("CARGO_PKG_VERSION"),
            WORD_BITS
        ));
        self.say("Copyright (C) 2001-2012 Charles Cazabon.");
        self.say("Licensed under the GNU General Public License version 2 (only).");
        self.say("");

        let config = match SessionConfig::from_command(command, env) {
            Ok(config) => config,
            Err(e) => return self.non_starter(&e),
        };

        self.say(&format!("pagesizemask is 0x{:x}", !(config.page_size - 1)));
        if config.test_mask.is_filtering() {
            self.say(&format!("using testmask 0x{:x}", config.test_mask.0));
        }
        self.say(&format!(
            "want {}MB ({} bytes)",
            config.requested_bytes >> 20,
            config.requested_bytes
        ));

        if self.aborted() {
            return SessionEnd::Aborted;
        }
        self.enter(SessionState::Acquiring);
        let mut buffer = match buffer::acquire(source, &config, &mut self.reporter) {
            Ok(buffer) => buffer,
            Err(e) => return self.non_starter(&e),
        };

        let end = self.run_loops(&config, buffer.words());
        // Unlocked before the final line.
        buffer.release();
        if matches!(end, SessionEnd::Completed(status) if !status.contains(ExitStatus::NON_STARTER)) {
            self.say("Done.");
        }
        end
    }

    /// Runs the configured loops over an already acquired region.
    ///
    /// Every loop starts with the stuck-address test over the whole region and
    /// then runs the masked paired tests over its two halves. Faults set a
    /// status bit and the loop carries on; only the abort flag cuts it short.
    pub fn run_loops<T>(&mut self, config: &SessionConfig, region: &mut T) -> SessionEnd
    where
        T: TestRegion + ?Sized,
    {
        let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
        log_debug(&format!("pattern seed {seed}"));
        let mut rng = StdRng::seed_from_u64(seed);
        let mut status = ExitStatus::empty();

        let mut iteration: u64 = 1;
        while config.loops == 0 || iteration <= config.loops {
            if self.aborted() {
                return SessionEnd::Aborted;
            }
            self.enter(SessionState::Looping(iteration));
            if config.loops == 0 {
                self.say(&format!("Loop {iteration}:"));
            } else {
                self.say(&format!("Loop {iteration}/{}:", config.loops));
            }

            let selected = config.test_mask.selected().map(|(_, test)| test);
            for test in std::iter::once(&STUCK_ADDRESS).chain(selected) {
                if self.aborted() {
                    return SessionEnd::Aborted;
                }
                let Some(outcome) = run_test(test, &mut *region, &mut rng) else {
                    return self.non_starter(&SetupError::OutOfMemory);
                };
                if let Err(fault) = &outcome {
                    log_debug(&format!("{}: {fault}", test.name));
                    status |= match test.applicability {
                        Applicability::SingleRegion => ExitStatus::ADDRESS_LINES,
                        Applicability::Paired(_) => ExitStatus::OTHER_TEST,
                    };
                }
                if !self.report_result(test, outcome.is_ok()) {
                    return SessionEnd::Aborted;
                }
            }
            self.say("");
            iteration = iteration.saturating_add(1);
        }

        self.enter(SessionState::Completed);
        if status.is_empty() {
            log_success(&format!("all tests passed over {} loop(s)", iteration - 1));
        } else {
            crate::log_warn_fmt!("session finished with status {:#x}", status.bits());
        }
        SessionEnd::Completed(status)
    }

    fn report_result(&mut self, test: &TestDescriptor, ok: bool) -> bool {
        let verdict = if ok { "ok!" } else { "FAILED!" };
        self.say(&format!("  {:<20}: {verdict}", test.name))
    }
}

/// Runs `test` over `region`: the whole of it for the stuck-address test,
/// the two halves for paired tests.
///
/// `None` when the region is too small to split.
fn run_test<T, R>(test: &TestDescriptor, region: &mut T, rng: &mut R) -> Option<Result<(), Fault>>
where
    T: TestRegion + ?Sized,
    R: Rng + ?Sized,
{
    match test.applicability {
        Applicability::SingleRegion => Some(test_stuck_address(region.whole())),
        Applicability::Paired(kind) => {
            let (a, b) = region.halves()?;
            Some(patterns::run_paired(kind, a, b, rng))
        }
    }
}
