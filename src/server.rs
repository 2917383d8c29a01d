//! Local control socket.
//!
//! Connections are served one at a time. Each gets a session thread that
//! streams progress back and an abort thread that reads the same
//! connection for the stop command.

use std::env;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::net::Shutdown;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::abort::{AbortMonitor, Terminate};
use crate::buffer::MemorySource;
use crate::config::Environment;
use crate::logger::{log_debug, log_info, log_warn};
use crate::session::{Session, SessionEnd};

pub const SOCKET_NAME: &str = "memorytester";
pub const DEFAULT_SOCKET_PATH: &str = "/dev/socket/memorytester";

/// Longest command accepted in one read.
const MAX_COMMAND_BYTES: usize = 1024;

pub struct ControlServer {
    listener: UnixListener,
}

impl ControlServer {
    pub fn from_listener(listener: UnixListener) -> Self {
        ControlServer { listener }
    }

    /// Binds `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        log_info(&format!("listening on {}", path.display()));
        Ok(ControlServer { listener })
    }

    /// Adopts a listening socket passed down by init as `ANDROID_SOCKET_<name>`.
    pub fn inherited(name: &str) -> io::Result<Option<Self>> {
        let var = format!("ANDROID_SOCKET_{name}");
        let Ok(value) = env::var(&var) else {
            return Ok(None);
        };
        let fd: RawFd = value.trim().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{var}={value} is not a descriptor"),
            )
        })?;

        // The descriptor is owned by this process from here on.
        let listener = unsafe { UnixListener::from_raw_fd(fd) };
        if unsafe { libc::listen(fd, 1) } != 0 {
            return Err(io::Error::last_os_error());
        }
        log_info(&format!("using inherited socket {name} (fd {fd})"));
        Ok(Some(ControlServer { listener }))
    }

    /// Accepts one connection and runs its session to the end.
    pub fn serve_one<S, T>(&self, source: &mut S, terminate: &T) -> io::Result<SessionEnd>
    where
        S: MemorySource + Send + ?Sized,
        T: Terminate + ?Sized,
    {
        let (stream, _) = self.listener.accept()?;
        log_debug("accepted control connection");
        serve_connection(stream, source, terminate)
    }

    /// Serves connections until one fails to be accepted, or after the first
    /// session unless `keep_serving`.
    pub fn serve<S, T>(&self, source: &mut S, terminate: &T, keep_serving: bool) -> io::Result<SessionEnd>
    where
        S: MemorySource + Send + ?Sized,
        T: Terminate + ?Sized,
    {
        loop {
            let end = match self.serve_one(source, terminate) {
                Ok(end) => end,
                Err(e) if keep_serving => {
                    log_warn(&format!("connection failed: {e}"));
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !keep_serving {
                return Ok(end);
            }
            log_info(&format!("session finished ({end:?}), waiting for next client"));
        }
    }
}

/// Runs one session over an accepted connection.
pub fn serve_connection<S, T>(stream: UnixStream, source: &mut S, terminate: &T) -> io::Result<SessionEnd>
where
    S: MemorySource + Send + ?Sized,
    T: Terminate + ?Sized,
{
    let mut reader = BufReader::with_capacity(MAX_COMMAND_BYTES, stream.try_clone()?);
    let command = read_command(&mut reader)?;
    log_info(&format!("receive command, do memory test: {}", command.trim()));

    let abort = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let writer = stream.try_clone()?;
    let env = Environment::capture();

    let end = thread::scope(|scope| {
        let monitor = AbortMonitor::new(reader, abort.clone(), finished.clone(), terminate);
        let watcher = scope.spawn(move || monitor.run());

        let session = scope.spawn(|| Session::new(writer, abort.clone()).run(&command, &env, source));
        let end = session.join();

        finished.store(true, Ordering::SeqCst);
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            log_debug(&format!("shutdown after session: {e}"));
        }
        if let Ok(Some(reason)) = watcher.join() {
            log_debug(&format!("abort monitor fired: {reason:?}"));
        }
        end
    });

    log_info("memory test is finished, closing connection");
    end.map_err(|_| io::Error::new(io::ErrorKind::Other, "session thread panicked"))
}

/// Takes the command from the first read on the connection: up to the first
/// newline, or everything that arrived. Anything after the newline stays
/// buffered for the abort monitor.
pub fn read_command<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let available = reader.fill_buf()?;
    let (line, used) = match available.iter().position(|&b| b == b'\n') {
        Some(pos) => (&available[..pos], pos + 1),
        None => (available, available.len()),
    };
    let command = String::from_utf8_lossy(line).into_owned();
    reader.consume(used);
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn command_is_first_line_of_first_read() {
        let mut reader = Cursor::new(b"-p 1M 1\nstop\n".to_vec());
        assert_eq!(read_command(&mut reader).unwrap(), "-p 1M 1");
        let mut rest = String::new();
        reader.read_line(&mut rest).unwrap();
        assert_eq!(rest, "stop\n");
    }

    #[test]
    fn command_without_newline_and_empty_command() {
        let mut reader = Cursor::new(b"-p 10M".to_vec());
        assert_eq!(read_command(&mut reader).unwrap(), "-p 10M");
        let mut reader = Cursor::new(Vec::new());
        assert_eq!(read_command(&mut reader).unwrap(), "");
    }

    #[test]
    fn bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket").join(SOCKET_NAME);
        drop(ControlServer::bind(&path).unwrap());
        assert!(path.exists());
        ControlServer::bind(&path).unwrap();
    }

    #[test]
    fn no_inherited_socket_without_variable() {
        assert!(ControlServer::inherited("memtesterd-test-none").unwrap().is_none());
    }
}
