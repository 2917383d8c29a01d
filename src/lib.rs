//! User-space memory tester driven over a local control socket.
//!
//! A client connects, sends one memtester-style command line and receives the
//! progress of the session as text lines. Sending `stop` on the same
//! connection ends the run.

pub mod logger;

pub mod abort;
pub mod buffer;
pub mod config;
pub mod error;
pub mod memory;
pub mod patterns;
pub mod report;
pub mod server;
pub mod session;
pub mod stuck_address;

pub use abort::{AbortMonitor, AbortReason, HangupPolicy, ProcessExit, Terminate};
pub use buffer::{HostMemory, MemorySource};
pub use config::{Environment, SessionConfig};
pub use error::{Fault, SetupError};
pub use server::ControlServer;
pub use session::{ExitStatus, Session, SessionEnd, SessionState};
