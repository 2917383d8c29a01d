//! Word-level access to the memory under test.
//!
//! Every read and write goes through [`Cells`] so that stores really reach the
//! memory cells instead of being folded away by the optimiser, and so tests can
//! substitute a faulty memory model.

use std::mem::size_of;

/// Native machine word used for every pattern read and write.
pub type Word = usize;

pub const WORD_BYTES: usize = size_of::<Word>();
pub const WORD_BITS: usize = Word::BITS as usize;

#[cfg(target_pointer_width = "32")]
mod constants {
    pub const ONE_BITS: usize = 0xFFFF_FFFF;
    pub const CHECKERBOARD1: usize = 0x5555_5555;
    pub const CHECKERBOARD2: usize = 0xAAAA_AAAA;
    pub const ONE_PER_BYTE: usize = 0x0101_0101;
}

#[cfg(target_pointer_width = "64")]
mod constants {
    pub const ONE_BITS: usize = 0xFFFF_FFFF_FFFF_FFFF;
    pub const CHECKERBOARD1: usize = 0x5555_5555_5555_5555;
    pub const CHECKERBOARD2: usize = 0xAAAA_AAAA_AAAA_AAAA;
    pub const ONE_PER_BYTE: usize = 0x0101_0101_0101_0101;
}
pub use self::constants::*;

pub const ONE: Word = 1;

/// A word-addressable span of memory.
///
/// Tests only ever talk to memory through this trait. Each `write` must be a
/// real store and each `read` a real load, in program order: a test writes a
/// pattern and reads it straight back, which an optimiser would otherwise turn
/// into a comparison of the value with itself.
pub trait Cells {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, index: usize) -> Word;

    fn write(&mut self, index: usize, value: Word);

    /// Stores one byte lane of word `index` (lanes in native memory order).
    fn write_u8(&mut self, index: usize, lane: usize, value: u8) {
        let mut bytes = self.read(index).to_ne_bytes();
        bytes[lane] = value;
        self.write(index, Word::from_ne_bytes(bytes));
    }

    /// Stores one 16-bit lane of word `index`.
    fn write_u16(&mut self, index: usize, lane: usize, value: u16) {
        let mut bytes = self.read(index).to_ne_bytes();
        bytes[lane * 2..lane * 2 + 2].copy_from_slice(&value.to_ne_bytes());
        self.write(index, Word::from_ne_bytes(bytes));
    }
}

// Plain slices are the real memory. Volatile accesses keep every load and
// store, and keep them word sized, so a bad cell is actually exercised.
// Indexing still bounds-checks before the raw access.
impl Cells for [Word] {
    fn len(&self) -> usize {
        <[Word]>::len(self)
    }

    #[inline]
    fn read(&self, index: usize) -> Word {
        let cell = &self[index];
        unsafe { std::ptr::read_volatile(cell) }
    }

    #[inline]
    fn write(&mut self, index: usize, value: Word) {
        let cell = &mut self[index];
        unsafe { std::ptr::write_volatile(cell, value) }
    }

    // Narrow lanes are stored through a byte or halfword pointer into the word,
    // so the memory sees a narrow bus write rather than a read-modify-write.
    fn write_u8(&mut self, index: usize, lane: usize, value: u8) {
        assert!(lane < WORD_BYTES, "byte lane {lane} out of range");
        let cell: *mut Word = &mut self[index];
        // In bounds: lane < WORD_BYTES and the word itself is in the slice.
        unsafe { cell.cast::<u8>().add(lane).write_volatile(value) }
    }

    fn write_u16(&mut self, index: usize, lane: usize, value: u16) {
        assert!(lane < WORD_BYTES / 2, "halfword lane {lane} out of range");
        let cell: *mut Word = &mut self[index];
        // Word alignment implies halfword alignment.
        unsafe { cell.cast::<u16>().add(lane).write_volatile(value) }
    }
}

/// Splits a region into two equal, non-overlapping halves of `len / 2` words.
/// A trailing odd word belongs to neither half.
pub fn split_halves(region: &mut [Word]) -> Option<(&mut [Word], &mut [Word])> {
    let count = region.len() / 2;
    if count == 0 {
        return None;
    }
    let (a, rest) = region.split_at_mut(count);
    Some((a, &mut rest[..count]))
}

/// Memory a session can run over: the whole span for the stuck-address test
/// and two disjoint halves for the paired tests.
pub trait TestRegion {
    type Whole: Cells + ?Sized;
    type Half: Cells + ?Sized;

    fn whole(&mut self) -> &mut Self::Whole;

    fn halves(&mut self) -> Option<(&mut Self::Half, &mut Self::Half)>;
}

impl TestRegion for [Word] {
    type Whole = [Word];
    type Half = [Word];

    fn whole(&mut self) -> &mut [Word] {
        self
    }

    fn halves(&mut self) -> Option<(&mut [Word], &mut [Word])> {
        split_halves(self)
    }
}
