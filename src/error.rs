use std::path::PathBuf;

/// Conditions that stop a session before any test runs.
///
/// Each one ends the session with the non-starter status bit after a
/// human-readable line has been streamed to the client.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("get page size failed: {0}")]
    PageSize(String),

    #[error("{0}")]
    Usage(String),

    #[error("failed to parse physaddrbase arg; should be hex address (0x123...): {0}")]
    PhysicalAddress(String),

    #[error("bad physaddrbase arg; does not start on page boundary: {0:#x}")]
    UnalignedPhysicalAddress(u64),

    #[error("can not use {path} as device: {reason}")]
    DeviceStat { path: PathBuf, reason: String },

    #[error("can not mmap non-char device {0}")]
    NotCharDevice(PathBuf),

    #[error("for mem device, physaddrbase (-p) must be specified")]
    DeviceWithoutAddress,

    #[error("failed to parse memory argument: {0}")]
    MemoryArgument(String),

    #[error("this system can only address {max_mb} MB")]
    TooLarge { max_mb: u64 },

    #[error("bytes {bytes} < minimum {minimum} ({pages} pages of {page_size}) -- memory argument too small")]
    TooSmall {
        bytes: usize,
        minimum: usize,
        pages: usize,
        page_size: usize,
    },

    #[error("failed to parse number of loops: {0}")]
    Loops(String),

    #[error("error parsing MEMTESTER_TEST_MASK {value}: {reason}")]
    TestMask { value: String, reason: String },

    #[error("error parsing MEMTESTER_SEED {0}")]
    Seed(String),

    #[error("failed to open {path} for physical memory: {reason}")]
    DeviceOpen { path: PathBuf, reason: String },

    #[error("failed to mmap {path} for physical memory: {reason}")]
    DeviceMap { path: PathBuf, reason: String },

    #[error("failed to allocate any memory")]
    OutOfMemory,
}

/// A detected memory fault. Not an error of the tester itself: sessions record
/// it in the exit status and keep looping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{mismatches} mismatched words, first at offset {first_offset:#x}")]
pub struct Fault {
    pub mismatches: usize,
    pub first_offset: usize,
}

impl Fault {
    /// Folds the outcome of another pass into an accumulated result.
    pub fn merge(acc: Option<Fault>, next: Option<Fault>) -> Option<Fault> {
        match (acc, next) {
            (None, next) => next,
            (acc, None) => acc,
            (Some(a), Some(b)) => Some(Fault {
                mismatches: a.mismatches + b.mismatches,
                first_offset: a.first_offset,
            }),
        }
    }
}
