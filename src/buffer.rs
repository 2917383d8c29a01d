// Test buffer acquisition.
//
// Heap mode asks for the requested size and walks down one page at a time
// until an allocation succeeds and, if possible, can be locked into RAM.
// Physical mode maps a fixed window of a memory device and never shrinks.
//
// Heap allocations are zero-filled by the allocator, so large requests come
// back as untouched pages. A failed attempt on the ladder therefore costs one
// allocation and one `mlock` call, not a pass over the whole buffer. When the
// lock limit is known the first attempt starts at that limit instead of
// walking down to it page by page.

use std::alloc::{self, Layout};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::ops::Range;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::slice;

use crate::config::{PhysicalTarget, SessionConfig};
use crate::error::SetupError;
use crate::logger::log_debug;
use crate::memory::{Word, WORD_BYTES};
use crate::report::Reporter;

/// Why a region could not be locked, classified from `errno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// `EAGAIN`: over the system or per-process lock limit.
    OverLimit,
    /// `ENOMEM`: too many pages for the process.
    TooManyPages,
    /// `EPERM`: the process may not lock memory at all.
    Permission,
    Unknown(i32),
}

impl LockError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => LockError::OverLimit,
            libc::ENOMEM => LockError::TooManyPages,
            libc::EPERM => LockError::Permission,
            other => LockError::Unknown(other),
        }
    }

    fn last_os_error() -> Self {
        LockError::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

/// Memory handed out by a [`MemorySource`].
pub trait Allocation: Send {
    /// Start address, used for page alignment.
    fn address(&self) -> usize;

    fn words(&mut self) -> &mut [Word];

    fn lock(&mut self, words: Range<usize>) -> Result<(), LockError>;

    fn unlock(&mut self, words: Range<usize>);
}

/// Operating-system memory primitives the acquisition ladder is built on.
pub trait MemorySource {
    /// Best-effort allocation of `bytes`; `None` when the request cannot be met.
    fn allocate(&mut self, bytes: usize) -> Option<Box<dyn Allocation>>;

    /// Largest number of bytes this process may lock, when bounded.
    ///
    /// `None` means no known limit: unlimited, privileged or not reported.
    fn lock_limit(&self) -> Option<usize> {
        None
    }

    /// Maps `bytes` of `target.device` starting at `target.base`.
    fn map_device(
        &mut self,
        target: &PhysicalTarget,
        bytes: usize,
    ) -> Result<Box<dyn Allocation>, SetupError>;
}

/// The real thing: heap allocations, `mmap` of a device and `mlock`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMemory;

impl MemorySource for HostMemory {
    fn allocate(&mut self, bytes: usize) -> Option<Box<dyn Allocation>> {
        let count = bytes / WORD_BYTES;
        if count == 0 {
            return None;
        }
        let layout = Layout::array::<Word>(count).ok()?;
        // Zeroed allocations this large are fresh anonymous pages; nothing is
        // written until a test stores into them.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr.cast::<Word>())?;
        Some(Box::new(HeapAllocation { ptr, layout, count }))
    }

    fn lock_limit(&self) -> Option<usize> {
        // Privileged processes are not held to RLIMIT_MEMLOCK.
        if unsafe { libc::geteuid() } == 0 {
            return None;
        }
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut limit) } != 0 {
            return None;
        }
        if limit.rlim_cur == libc::RLIM_INFINITY {
            return None;
        }
        usize::try_from(limit.rlim_cur).ok()
    }

    fn map_device(
        &mut self,
        target: &PhysicalTarget,
        bytes: usize,
    ) -> Result<Box<dyn Allocation>, SetupError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&target.device)
            .map_err(|e| SetupError::DeviceOpen {
                path: target.device.clone(),
                reason: e.to_string(),
            })?;

        let map_error = |reason: String| SetupError::DeviceMap {
            path: target.device.clone(),
            reason,
        };
        let offset = libc::off_t::try_from(target.base)
            .map_err(|_| map_error(format!("offset {:#x} out of range", target.base)))?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED,
                file.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(map_error(io::Error::last_os_error().to_string()));
        }
        let ptr = NonNull::new(ptr.cast::<Word>())
            .ok_or_else(|| map_error("mmap returned a null mapping".to_string()))?;

        // The mapping stays valid after the descriptor is closed.
        Ok(Box::new(DeviceMapping {
            ptr,
            bytes,
            count: bytes / WORD_BYTES,
        }))
    }
}

/// A zero-filled heap block of `count` words, freed on drop.
struct HeapAllocation {
    ptr: NonNull<Word>,
    layout: Layout,
    count: usize,
}

// The block is owned exclusively by this value.
unsafe impl Send for HeapAllocation {}

impl Allocation for HeapAllocation {
    fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn words(&mut self) -> &mut [Word] {
        // Valid for `count` words until `drop`; `&mut self` keeps the view unique.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.count) }
    }

    fn lock(&mut self, words: Range<usize>) -> Result<(), LockError> {
        lock_span(&self.words()[words])
    }

    fn unlock(&mut self, words: Range<usize>) {
        unlock_span(&self.words()[words]);
    }
}

impl Drop for HeapAllocation {
    fn drop(&mut self) {
        // `AcquiredBuffer` unlocks its range before the block is freed.
        unsafe { alloc::dealloc(self.ptr.as_ptr().cast(), self.layout) }
    }
}

struct DeviceMapping {
    ptr: NonNull<Word>,
    bytes: usize,
    count: usize,
}

// The mapping is owned exclusively by this value.
unsafe impl Send for DeviceMapping {}

impl Allocation for DeviceMapping {
    fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn words(&mut self) -> &mut [Word] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.count) }
    }

    fn lock(&mut self, words: Range<usize>) -> Result<(), LockError> {
        lock_span(&self.words()[words])
    }

    fn unlock(&mut self, words: Range<usize>) {
        unlock_span(&self.words()[words]);
    }
}

impl Drop for DeviceMapping {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::munmap(self.ptr.as_ptr().cast(), self.bytes);
        }
    }
}

fn lock_span(words: &[Word]) -> Result<(), LockError> {
    if words.is_empty() {
        return Ok(());
    }
    let rc = unsafe { libc::mlock(words.as_ptr().cast(), words.len() * WORD_BYTES) };
    if rc == 0 {
        Ok(())
    } else {
        Err(LockError::last_os_error())
    }
}

fn unlock_span(words: &[Word]) {
    if words.is_empty() {
        return;
    }
    let rc = unsafe { libc::munlock(words.as_ptr().cast(), words.len() * WORD_BYTES) };
    if rc != 0 {
        log_debug(&format!("munlock failed: {}", io::Error::last_os_error()));
    }
}

/// The page-aligned test region of an allocation.
///
/// Unlocked on [`release`](AcquiredBuffer::release) or drop.
pub struct AcquiredBuffer {
    allocation: Box<dyn Allocation>,
    range: Range<usize>,
    locked: bool,
}

impl AcquiredBuffer {
    pub fn words(&mut self) -> &mut [Word] {
        let range = self.range.clone();
        &mut self.allocation.words()[range]
    }

    pub fn len_bytes(&self) -> usize {
        self.range.len() * WORD_BYTES
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if self.locked {
            self.allocation.unlock(self.range.clone());
            self.locked = false;
        }
    }
}

impl Drop for AcquiredBuffer {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Word range of `allocation` that starts on a page boundary, covering at
/// most `bytes`.
///
/// The allocator only guarantees word alignment. Skipping up to the next page
/// boundary costs at most one page of the request, which is why the smallest
/// accepted size is three pages.
fn aligned_range(allocation: &mut dyn Allocation, bytes: usize, page_size: usize) -> Range<usize> {
    let misalignment = allocation.address() % page_size;
    let skip = if misalignment == 0 {
        0
    } else {
        page_size - misalignment
    };
    let end = allocation.words().len().min(bytes / WORD_BYTES);
    let start = (skip / WORD_BYTES).min(end);
    start..end
}

fn got_line(bytes: usize) -> String {
    format!("got  {}MB ({} bytes)", bytes >> 20, bytes)
}

/// Obtains the test buffer for `config`, streaming each step to `report`.
pub fn acquire<S, W>(
    source: &mut S,
    config: &SessionConfig,
    report: &mut Reporter<W>,
) -> Result<AcquiredBuffer, SetupError>
where
    S: MemorySource + ?Sized,
    W: Write,
{
    let buffer = match &config.physical {
        Some(target) => acquire_physical(source, target, config.requested_bytes, report)?,
        None => acquire_heap(source, config.requested_bytes, config.page_size, report)?,
    };

    if buffer.range.len() < 2 {
        return Err(SetupError::OutOfMemory);
    }
    if !buffer.locked {
        report.line("Continuing with unlocked memory; testing will be slower and less reliable.");
    }
    Ok(buffer)
}

fn acquire_physical<S, W>(
    source: &mut S,
    target: &PhysicalTarget,
    bytes: usize,
    report: &mut Reporter<W>,
) -> Result<AcquiredBuffer, SetupError>
where
    S: MemorySource + ?Sized,
    W: Write,
{
    let mut allocation = source.map_device(target, bytes)?;
    let end = allocation.words().len().min(bytes / WORD_BYTES);
    let range = 0..end;

    report.line(&format!(
        "{} from {} at 0x{:x}, trying mlock ...",
        got_line(bytes),
        target.device.display(),
        target.base
    ));
    let locked = match allocation.lock(range.clone()) {
        Ok(()) => {
            report.line("locked.");
            true
        }
        Err(e) => {
            log_debug(&format!("mlock of device mapping failed: {e:?}"));
            report.line("failed to mlock mmap'ed space");
            false
        }
    };

    Ok(AcquiredBuffer {
        allocation,
        range,
        locked,
    })
}

fn acquire_heap<S, W>(
    source: &mut S,
    requested: usize,
    page_size: usize,
    report: &mut Reporter<W>,
) -> Result<AcquiredBuffer, SetupError>
where
    S: MemorySource + ?Sized,
    W: Write,
{
    let mut want = requested;
    let mut try_lock = true;

    // Start at the lock limit rather than discovering it one page at a time.
    if let Some(limit) = source.lock_limit() {
        let limit = limit - limit % page_size;
        if limit > 0 && limit < want {
            crate::log_warn_fmt!(
                "requested {requested} bytes is over the {limit} byte lock limit, starting there"
            );
            want = limit;
        }
    }

    // Each round allocates, then tries to lock:
    // - EAGAIN / ENOMEM: free, shrink by a page, go again;
    // - EPERM: start over at the full size and stop locking;
    // - anything else: keep this allocation unlocked.
    // Running out of pages to shrink is a non-starter.
    loop {
        let mut allocation = loop {
            if want == 0 {
                return Err(SetupError::OutOfMemory);
            }
            match source.allocate(want) {
                Some(allocation) => break allocation,
                None => want = want.saturating_sub(page_size),
            }
        };
        let range = aligned_range(allocation.as_mut(), want, page_size);

        if !try_lock {
            report.line(&got_line(want));
            return Ok(AcquiredBuffer {
                allocation,
                range,
                locked: false,
            });
        }

        report.line(&format!("{}, trying mlock ...", got_line(want)));
        match allocation.lock(range.clone()) {
            Ok(()) => {
                report.line("locked.");
                return Ok(AcquiredBuffer {
                    allocation,
                    range,
                    locked: true,
                });
            }
            Err(LockError::OverLimit) => {
                report.line("over system/pre-process limit, reducing...");
                want = want.saturating_sub(page_size);
            }
            Err(LockError::TooManyPages) => {
                report.line("too many pages, reducing...");
                want = want.saturating_sub(page_size);
            }
            Err(LockError::Permission) => {
                report.line("insufficient permission.");
                report.line("Trying again, unlocked:");
                try_lock = false;
                want = requested;
            }
            Err(LockError::Unknown(errno)) => {
                log_debug(&format!("mlock failed with errno {errno}"));
                report.line("failed for unknown reason.");
                return Ok(AcquiredBuffer {
                    allocation,
                    range,
                    locked: false,
                });
            }
        }
        // `allocation` is freed here, before the next attempt.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const PAGE: usize = 4096;

    #[derive(Default, Clone)]
    struct Script {
        lock_results: Arc<Mutex<VecDeque<Result<(), LockError>>>>,
        unlocks: Arc<AtomicUsize>,
    }

    struct FakeAllocation {
        words: Vec<Word>,
        address: usize,
        script: Script,
    }

    impl Allocation for FakeAllocation {
        fn address(&self) -> usize {
            self.address
        }
        fn words(&mut self) -> &mut [Word] {
            &mut self.words
        }
        fn lock(&mut self, _words: Range<usize>) -> Result<(), LockError> {
            self.script
                .lock_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
        fn unlock(&mut self, _words: Range<usize>) {
            self.script.unlocks.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeSource {
        largest: usize,
        address: usize,
        script: Script,
        requests: Vec<usize>,
        limit: Option<usize>,
    }

    impl FakeSource {
        fn new(largest: usize, lock_results: Vec<Result<(), LockError>>) -> Self {
            let script = Script::default();
            script.lock_results.lock().unwrap().extend(lock_results);
            FakeSource {
                largest,
                address: 0,
                script,
                requests: Vec::new(),
                limit: None,
            }
        }
    }

    impl MemorySource for FakeSource {
        fn allocate(&mut self, bytes: usize) -> Option<Box<dyn Allocation>> {
            self.requests.push(bytes);
            if bytes > self.largest {
                return None;
            }
            Some(Box::new(FakeAllocation {
                words: vec![0; bytes / WORD_BYTES],
                address: self.address,
                script: self.script.clone(),
            }))
        }

        fn lock_limit(&self) -> Option<usize> {
            self.limit
        }

        fn map_device(
            &mut self,
            target: &PhysicalTarget,
            bytes: usize,
        ) -> Result<Box<dyn Allocation>, SetupError> {
            if target.device == PathBuf::from("/missing") {
                return Err(SetupError::DeviceOpen {
                    path: target.device.clone(),
                    reason: "No such file or directory".to_string(),
                });
            }
            Ok(Box::new(FakeAllocation {
                words: vec![0; bytes / WORD_BYTES],
                address: target.base as usize,
                script: self.script.clone(),
            }))
        }
    }

    fn config(command: &str) -> SessionConfig {
        SessionConfig::from_command(command, &Environment::with_page_size(PAGE)).unwrap()
    }

    fn output(reporter: Reporter<Vec<u8>>) -> Vec<String> {
        String::from_utf8(reporter.into_inner())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn locks_requested_size_when_possible() {
        let mut source = FakeSource::new(usize::MAX, vec![]);
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("64K"), &mut report).unwrap();
        assert!(buffer.is_locked());
        assert_eq!(buffer.len_bytes(), 64 << 10);
        assert_eq!(source.requests, vec![64 << 10]);

        buffer.release();
        assert_eq!(source.script.unlocks.load(Ordering::SeqCst), 1);
        assert_eq!(
            output(report),
            vec!["got  0MB (65536 bytes), trying mlock ...", "locked."]
        );
    }

    #[test]
    fn allocation_failures_shrink_by_one_page() {
        let mut source = FakeSource::new(60 << 10, vec![]);
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("64K"), &mut report).unwrap();
        assert_eq!(buffer.len_bytes(), 60 << 10);
        assert_eq!(source.requests, vec![64 << 10, 60 << 10]);
    }

    #[test]
    fn lock_limits_shrink_monotonically() {
        let mut source = FakeSource::new(
            usize::MAX,
            vec![
                Err(LockError::OverLimit),
                Err(LockError::TooManyPages),
                Err(LockError::OverLimit),
            ],
        );
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("64K"), &mut report).unwrap();
        assert!(buffer.is_locked());
        assert!(source.requests.windows(2).all(|w| w[1] == w[0] - PAGE));
        assert_eq!(buffer.len_bytes(), (64 << 10) - 3 * PAGE);

        let lines = output(report);
        assert_eq!(lines[1], "over system/pre-process limit, reducing...");
        assert_eq!(lines[3], "too many pages, reducing...");
        assert_eq!(lines.last().unwrap(), "locked.");
    }

    #[test]
    fn ladder_ends_at_zero() {
        let mut source = FakeSource::new(usize::MAX, vec![Err(LockError::OverLimit); 64]);
        let mut report = Reporter::new(Vec::new());
        let result = acquire(&mut source, &config("16K"), &mut report);
        assert!(matches!(result, Err(SetupError::OutOfMemory)));
        assert_eq!(source.requests, vec![16 << 10, 12 << 10, 8 << 10, 4 << 10]);
    }

    #[test]
    fn permission_denied_retries_full_size_unlocked() {
        let mut source = FakeSource::new(usize::MAX, vec![Err(LockError::Permission)]);
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("64K"), &mut report).unwrap();
        assert!(!buffer.is_locked());
        assert_eq!(buffer.len_bytes(), 64 << 10);
        assert_eq!(source.requests, vec![64 << 10, 64 << 10]);

        drop(buffer);
        assert_eq!(source.script.unlocks.load(Ordering::SeqCst), 0);
        let lines = output(report);
        assert_eq!(lines[1], "insufficient permission.");
        assert_eq!(lines[2], "Trying again, unlocked:");
        assert_eq!(lines[3], "got  0MB (65536 bytes)");
        assert!(lines[4].starts_with("Continuing with unlocked memory"));
    }

    #[test]
    fn unknown_lock_failure_keeps_current_allocation() {
        let mut source = FakeSource::new(usize::MAX, vec![Err(LockError::Unknown(libc::EINVAL))]);
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("64K"), &mut report).unwrap();
        assert!(!buffer.is_locked());
        assert_eq!(source.requests.len(), 1);
        assert_eq!(output(report)[1], "failed for unknown reason.");
    }

    #[test]
    fn unaligned_allocation_skips_to_next_page() {
        let mut source = FakeSource::new(usize::MAX, vec![]);
        source.address = PAGE - 2 * WORD_BYTES;
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("64K"), &mut report).unwrap();
        assert_eq!(buffer.len_bytes(), (64 << 10) - 2 * WORD_BYTES);
    }

    #[test]
    fn physical_mode_never_shrinks() {
        let mut source = FakeSource::new(0, vec![Err(LockError::OverLimit)]);
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("-p 0x10000 64K"), &mut report).unwrap();
        assert!(!buffer.is_locked());
        assert_eq!(buffer.len_bytes(), 64 << 10);
        assert!(source.requests.is_empty());
        let lines = output(report);
        assert!(lines[0].contains("from /dev/mem at 0x10000"));
        assert_eq!(lines[1], "failed to mlock mmap'ed space");
    }

    #[test]
    fn host_memory_allocation_is_usable() {
        let mut source = HostMemory;
        let mut report = Reporter::new(Vec::new());
        // Locking may be refused in a sandbox; the ladder still yields a buffer.
        let mut buffer = acquire(&mut source, &config("16K"), &mut report).unwrap();
        let words = buffer.words();
        assert_eq!(words.as_ptr() as usize % PAGE, 0);
        words[0] = 0xA5;
        assert_eq!(words[0], 0xA5);
    }

    #[test]
    fn first_attempt_starts_at_lock_limit() {
        let mut source = FakeSource::new(usize::MAX, vec![]);
        // Not a page multiple: rounded down to 8 KiB.
        source.limit = Some(8 * PAGE + 100);
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("32M"), &mut report).unwrap();
        assert!(buffer.is_locked());
        assert_eq!(source.requests, vec![8 * PAGE]);
        assert_eq!(buffer.len_bytes(), 8 * PAGE);
    }

    #[test]
    fn lock_limit_above_request_changes_nothing() {
        let mut source = FakeSource::new(usize::MAX, vec![]);
        source.limit = Some(1 << 30);
        let mut report = Reporter::new(Vec::new());
        acquire(&mut source, &config("64K"), &mut report).unwrap();
        assert_eq!(source.requests, vec![64 << 10]);
    }

    #[test]
    fn permission_retry_ignores_lock_limit() {
        let mut source = FakeSource::new(usize::MAX, vec![Err(LockError::Permission)]);
        source.limit = Some(4 * PAGE);
        let mut report = Reporter::new(Vec::new());
        let buffer = acquire(&mut source, &config("64K"), &mut report).unwrap();
        assert!(!buffer.is_locked());
        assert_eq!(source.requests, vec![4 * PAGE, 64 << 10]);
        assert_eq!(buffer.len_bytes(), 64 << 10);
    }

    fn resident_bytes() -> usize {
        let status = std::fs::read_to_string("/proc/self/status").unwrap();
        let line = status.lines().find(|l| l.starts_with("VmRSS:")).unwrap();
        let kib: usize = line.split_whitespace().nth(1).unwrap().parse().unwrap();
        kib << 10
    }

    #[test]
    fn host_allocation_leaves_pages_untouched() {
        const REQUEST: usize = 256 << 20;
        let before = resident_bytes();
        let mut allocation = HostMemory.allocate(REQUEST).unwrap();
        let after = resident_bytes();
        assert_eq!(allocation.words().len(), REQUEST / WORD_BYTES);
        // Other tests run concurrently, so only require far less than the request.
        assert!(
            after.saturating_sub(before) < REQUEST / 4,
            "resident set grew by {} bytes",
            after.saturating_sub(before)
        );
        assert_eq!(allocation.words()[REQUEST / WORD_BYTES - 1], 0);
    }

    #[test]
    fn empty_host_allocation_is_refused() {
        assert!(HostMemory.allocate(WORD_BYTES - 1).is_none());
    }

    #[test]
    fn errno_classes() {
        assert_eq!(LockError::from_errno(libc::EAGAIN), LockError::OverLimit);
        assert_eq!(LockError::from_errno(libc::ENOMEM), LockError::TooManyPages);
        assert_eq!(LockError::from_errno(libc::EPERM), LockError::Permission);
        assert_eq!(LockError::from_errno(libc::EIO), LockError::Unknown(libc::EIO));
    }
}
