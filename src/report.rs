use std::io::Write;

use crate::logger::{log_debug, log_info};

/// Line-oriented progress stream sent to the client.
///
/// Each line goes out in a single `write_all` so it cannot interleave with
/// output from another thread sharing the connection. Every line is also
/// recorded in the log. A client that went away does not stop the session;
/// write errors are logged and otherwise ignored.
pub struct Reporter<W: Write> {
    out: W,
    lines: usize,
    broken: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Reporter {
            out,
            lines: 0,
            broken: false,
        }
    }

    pub fn line(&mut self, text: &str) {
        log_info(text);
        self.lines += 1;
        if self.broken {
            return;
        }

        let mut record = String::with_capacity(text.len() + 1);
        record.push_str(text);
        record.push('\n');
        let sent = self
            .out
            .write_all(record.as_bytes())
            .and_then(|_| self.out.flush());
        if let Err(e) = sent {
            log_debug(&format!("client stream closed: {e}"));
            self.broken = true;
        }
    }

    /// Number of lines emitted so far, including ones a closed stream dropped.
    pub fn lines_emitted(&self) -> usize {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
