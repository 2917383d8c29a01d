//! Watches the client connection for the stop command while a session runs.

use std::io::{BufRead, ErrorKind};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::logger::{log_debug, log_info, log_warn};

pub const STOP_TOKEN: &[u8] = b"stop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The client asked to stop.
    Stop,
    /// The connection failed while a session was still running.
    ConnectionLost,
}

/// What ends the process once an abort is decided.
pub trait Terminate: Sync {
    fn terminate(&self, reason: AbortReason);
}

impl<F> Terminate for F
where
    F: Fn(AbortReason) + Sync,
{
    fn terminate(&self, reason: AbortReason) {
        self(reason)
    }
}

/// Exits the process: 0 on a stop request, 255 when the client vanished.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl Terminate for ProcessExit {
    fn terminate(&self, reason: AbortReason) {
        match reason {
            AbortReason::Stop => {
                log_info("receive stop memory test message, exiting");
                process::exit(0);
            }
            AbortReason::ConnectionLost => {
                log_warn("client connection lost during session, exiting");
                process::exit(255);
            }
        }
    }
}

/// What to do when the abort channel closes or fails mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupPolicy {
    Terminate,
    /// Keep the session running (a local terminal closing stdin).
    Ignore,
}

pub struct AbortMonitor<'t, R, T: ?Sized> {
    reader: R,
    abort: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    terminate: &'t T,
    hangup: HangupPolicy,
}

impl<'t, R, T> AbortMonitor<'t, R, T>
where
    R: BufRead,
    T: Terminate + ?Sized,
{
    /// `abort` is raised before terminating; `finished` is set by the owner
    /// once the session is over, after which hangups are expected.
    pub fn new(
        reader: R,
        abort: Arc<AtomicBool>,
        finished: Arc<AtomicBool>,
        terminate: &'t T,
    ) -> Self {
        AbortMonitor {
            reader,
            abort,
            finished,
            terminate,
            hangup: HangupPolicy::Terminate,
        }
    }

    pub fn with_hangup_policy(mut self, hangup: HangupPolicy) -> Self {
        self.hangup = hangup;
        self
    }

    /// Reads lines until a stop command or the end of the stream. Returns the
    /// reason passed to the terminator, if it was invoked.
    pub fn run(mut self) -> Option<AbortReason> {
        let mut line = Vec::new();
        loop {
            line.clear();
            match self.reader.read_until(b'\n', &mut line) {
                Ok(0) => return self.hang_up("connection closed"),
                Ok(_) => {
                    let message = trim_line_end(&line);
                    log_debug(&format!(
                        "receive message: {}",
                        String::from_utf8_lossy(message)
                    ));
                    if message == STOP_TOKEN {
                        if self.finished.load(Ordering::SeqCst) {
                            return None;
                        }
                        return Some(self.fire(AbortReason::Stop));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.hang_up(&e.to_string()),
            }
        }
    }

    fn hang_up(&self, why: &str) -> Option<AbortReason> {
        if self.finished.load(Ordering::SeqCst) {
            log_debug(&format!("abort channel closed after session: {why}"));
            return None;
        }
        match self.hangup {
            HangupPolicy::Terminate => {
                log_warn(&format!("abort channel failed: {why}"));
                Some(self.fire(AbortReason::ConnectionLost))
            }
            HangupPolicy::Ignore => {
                log_debug(&format!("abort channel closed, session continues: {why}"));
                None
            }
        }
    }

    fn fire(&self, reason: AbortReason) -> AbortReason {
        self.abort.store(true, Ordering::SeqCst);
        self.terminate.terminate(reason);
        reason
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}
