//! Paired-region pattern tests.
//!
//! Each test writes the same (or a related) pattern into two halves of the
//! buffer and compares them word by word. A word that differs from its partner
//! means one of the two cells did not hold what was written.
//!
//! Faults never stop a test early: every pass compares the whole half-pair and
//! the mismatches of all passes are folded into one [`Fault`].

use rand::Rng;

use crate::config::parse_c_number;
use crate::error::{Fault, SetupError};
use crate::memory::{
    Cells, Word, CHECKERBOARD1, CHECKERBOARD2, ONE, ONE_BITS, ONE_PER_BYTE, WORD_BITS, WORD_BYTES,
};

/// Mismatch records logged per comparison pass before going quiet.
const MAX_REPORTED_MISMATCHES: usize = 16;

const SOLID_BITS_PASSES: usize = 64;
const CHECKERBOARD_PASSES: usize = 64;
const BLOCK_SEQUENTIAL_PASSES: usize = 256;
const SEQUENTIAL_INCREMENT_PASSES: usize = 4;
const BIT_FLIP_ROUNDS: usize = 8;
const NARROW_WRITE_PASSES: usize = 2;

/// Algorithms that run over a pair of halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    RandomValue,
    XorComparison,
    SubComparison,
    MulComparison,
    DivComparison,
    OrComparison,
    AndComparison,
    SeqIncComparison,
    SolidBitsComparison,
    BlockSeqComparison,
    CheckerboardComparison,
    BitSpreadComparison,
    BitFlipComparison,
    WalkingOnesComparison,
    WalkingZeroesComparison,
    Bit8WideRandom,
    Bit16WideRandom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applicability {
    /// Runs `TestKind` over the two halves A and B.
    Paired(TestKind),
    /// Runs the stuck-address test over the whole region.
    SingleRegion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestDescriptor {
    pub name: &'static str,
    pub applicability: Applicability,
}

const fn paired(name: &'static str, kind: TestKind) -> TestDescriptor {
    TestDescriptor {
        name,
        applicability: Applicability::Paired(kind),
    }
}

/// Runs at the start of every loop, outside the selection mask.
pub const STUCK_ADDRESS: TestDescriptor = TestDescriptor {
    name: "Stuck Address",
    applicability: Applicability::SingleRegion,
};

/// Ordered test registry. Position `i` is bit `i` of the selection mask, so
/// entries are only ever appended.
pub static TESTS: &[TestDescriptor] = &[
    paired("Random Value", TestKind::RandomValue),
    paired("Compare XOR", TestKind::XorComparison),
    paired("Compare SUB", TestKind::SubComparison),
    paired("Compare MUL", TestKind::MulComparison),
    paired("Compare DIV", TestKind::DivComparison),
    paired("Compare OR", TestKind::OrComparison),
    paired("Compare AND", TestKind::AndComparison),
    paired("Sequential Increment", TestKind::SeqIncComparison),
    paired("Solid Bits", TestKind::SolidBitsComparison),
    paired("Block Sequential", TestKind::BlockSeqComparison),
    paired("Checkerboard", TestKind::CheckerboardComparison),
    paired("Bit Spread", TestKind::BitSpreadComparison),
    paired("Bit Flip", TestKind::BitFlipComparison),
    paired("Walking Ones", TestKind::WalkingOnesComparison),
    paired("Walking Zeroes", TestKind::WalkingZeroesComparison),
    #[cfg(feature = "narrow-writes")]
    paired("8-bit Writes", TestKind::Bit8WideRandom),
    #[cfg(feature = "narrow-writes")]
    paired("16-bit Writes", TestKind::Bit16WideRandom),
];

/// Selection of registry entries. Zero means no filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestMask(pub u64);

impl TestMask {
    pub const ALL: TestMask = TestMask(0);

    /// Parses a `MEMTESTER_TEST_MASK` value (decimal, `0x` hex or `0` octal).
    pub fn from_env_value(value: &str) -> Result<Self, SetupError> {
        parse_c_number(value.trim())
            .map(TestMask)
            .ok_or_else(|| SetupError::TestMask {
                value: value.to_string(),
                reason: "not an unsigned number".to_string(),
            })
    }

    pub fn is_filtering(&self) -> bool {
        self.0 != 0
    }

    pub fn selects(&self, index: usize) -> bool {
        !self.is_filtering() || (index < 64 && self.0 & (1u64 << index) != 0)
    }

    /// Registry entries this mask enables, with their ordinal.
    pub fn selected(self) -> impl Iterator<Item = (usize, &'static TestDescriptor)> {
        TESTS.iter().enumerate().filter(move |(i, _)| self.selects(*i))
    }
}

/// Lines describing the registry, for `--list-tests`.
pub fn test_mask_help() -> Vec<String> {
    let mut lines = vec!["Test masks (MEMTESTER_TEST_MASK):".to_string()];
    let mut all = 0u64;
    for (i, test) in TESTS.iter().enumerate() {
        lines.push(format!("    {:20}|0x{:08X}", test.name, 1u64 << i));
        all |= 1u64 << i;
    }
    lines.push(format!("Combine with a bitwise OR; all tests: 0x{all:08X} (or 0)"));
    lines
}

/// Runs one paired test over halves `a` and `b`.
///
/// Both halves must have the same length. Returns the accumulated fault when
/// any pass observed a mismatch.
pub fn run_paired<M, R>(kind: TestKind, a: &mut M, b: &mut M, rng: &mut R) -> Result<(), Fault>
where
    M: Cells + ?Sized,
    R: Rng + ?Sized,
{
    assert_eq!(a.len(), b.len(), "halves must be the same length");
    let fault = match kind {
        TestKind::RandomValue => test_random_value(a, b, rng),
        TestKind::XorComparison => test_comparison(a, b, rng, Operator::Xor),
        TestKind::SubComparison => test_comparison(a, b, rng, Operator::Sub),
        TestKind::MulComparison => test_comparison(a, b, rng, Operator::Mul),
        TestKind::DivComparison => test_comparison(a, b, rng, Operator::Div),
        TestKind::OrComparison => test_comparison(a, b, rng, Operator::Or),
        TestKind::AndComparison => test_comparison(a, b, rng, Operator::And),
        TestKind::SeqIncComparison => test_seqinc_comparison(a, b, rng),
        TestKind::SolidBitsComparison => test_solidbits_comparison(a, b),
        TestKind::BlockSeqComparison => test_blockseq_comparison(a, b),
        TestKind::CheckerboardComparison => test_checkerboard_comparison(a, b),
        TestKind::BitSpreadComparison => test_bitspread_comparison(a, b),
        TestKind::BitFlipComparison => test_bitflip_comparison(a, b),
        TestKind::WalkingOnesComparison => test_walkbits_comparison(a, b, |k| ONE << k),
        TestKind::WalkingZeroesComparison => {
            test_walkbits_comparison(a, b, |k| ONE_BITS ^ (ONE << k))
        }
        TestKind::Bit8WideRandom => test_8bit_wide_random(a, b, rng),
        TestKind::Bit16WideRandom => test_16bit_wide_random(a, b, rng),
    };
    match fault {
        Some(fault) => Err(fault),
        None => Ok(()),
    }
}

/// Reads every pair back and checks `B[i] == expected(A[i])`.
fn verify<M, F>(a: &M, b: &M, expected: F) -> Option<Fault>
where
    M: Cells + ?Sized,
    F: Fn(Word) -> Word,
{
    let mut fault: Option<Fault> = None;
    for i in 0..a.len() {
        let va = a.read(i);
        let vb = b.read(i);
        let want = expected(va);
        if vb != want {
            let offset = i * WORD_BYTES;
            let reported = fault.as_ref().map_or(0, |f| f.mismatches);
            if reported < MAX_REPORTED_MISMATCHES {
                crate::log_error_fmt!(
                    "FAILURE: 0x{want:0width$x} != 0x{vb:0width$x} at offset 0x{offset:08x}",
                    width = WORD_BYTES * 2
                );
            }
            match fault.as_mut() {
                Some(f) => f.mismatches += 1,
                None => {
                    fault = Some(Fault {
                        mismatches: 1,
                        first_offset: offset,
                    })
                }
            }
        }
    }
    fault
}

fn compare_regions<M: Cells + ?Sized>(a: &M, b: &M) -> Option<Fault> {
    verify(a, b, |v| v)
}

/// Writes `pattern(i)` to both halves, then compares them.
fn fill_and_compare<M, F>(a: &mut M, b: &mut M, pattern: F) -> Option<Fault>
where
    M: Cells + ?Sized,
    F: Fn(usize) -> Word,
{
    for i in 0..a.len() {
        let value = pattern(i);
        a.write(i, value);
        b.write(i, value);
    }
    compare_regions(a, b)
}

fn alternate(i: usize, q: Word) -> Word {
    if i % 2 == 0 {
        q
    } else {
        !q
    }
}

/// Bit position for pass `j` of a walk up from bit 0 and back down.
fn walk_position(j: usize) -> usize {
    if j < WORD_BITS {
        j
    } else {
        WORD_BITS * 2 - j - 1
    }
}

fn test_random_value<M, R>(a: &mut M, b: &mut M, rng: &mut R) -> Option<Fault>
where
    M: Cells + ?Sized,
    R: Rng + ?Sized,
{
    for i in 0..a.len() {
        let value: Word = rng.gen();
        a.write(i, value);
        b.write(i, value);
    }
    compare_regions(a, b)
}

#[derive(Debug, Clone, Copy)]
enum Operator {
    Xor,
    Sub,
    Mul,
    Div,
    Or,
    And,
}

impl Operator {
    fn apply(self, base: Word, q: Word) -> Word {
        match self {
            Operator::Xor => base ^ q,
            Operator::Sub => base.wrapping_sub(q),
            Operator::Mul => base.wrapping_mul(q),
            Operator::Div => base / q,
            Operator::Or => base | q,
            Operator::And => base & q,
        }
    }

    fn operand<R: Rng + ?Sized>(self, rng: &mut R) -> Word {
        match self {
            // A small divisor keeps most of the dividend in the quotient.
            Operator::Div => rng.gen_range(1..=0xFFFF),
            Operator::Mul => loop {
                let q: Word = rng.gen();
                if q != 0 {
                    break q;
                }
            },
            _ => rng.gen(),
        }
    }
}

/// Writes a random base to A and `op(base, q)` to B, then re-reads both and
/// checks the relation still holds.
fn test_comparison<M, R>(a: &mut M, b: &mut M, rng: &mut R, op: Operator) -> Option<Fault>
where
    M: Cells + ?Sized,
    R: Rng + ?Sized,
{
    let q = op.operand(rng);
    for i in 0..a.len() {
        let base: Word = rng.gen();
        a.write(i, base);
        b.write(i, op.apply(base, q));
    }
    verify(a, b, |base| op.apply(base, q))
}

fn test_seqinc_comparison<M, R>(a: &mut M, b: &mut M, rng: &mut R) -> Option<Fault>
where
    M: Cells + ?Sized,
    R: Rng + ?Sized,
{
    let q: Word = rng.gen();
    let count = a.len();
    let mut fault = None;
    for pass in 0..SEQUENTIAL_INCREMENT_PASSES {
        let base = q.wrapping_add(pass.wrapping_mul(count));
        let found = fill_and_compare(a, b, |i| base.wrapping_add(i));
        fault = Fault::merge(fault, found);
    }
    fault
}

fn test_solidbits_comparison<M: Cells + ?Sized>(a: &mut M, b: &mut M) -> Option<Fault> {
    let mut fault = None;
    for j in 0..SOLID_BITS_PASSES {
        let q = if j % 2 == 0 { ONE_BITS } else { 0 };
        fault = Fault::merge(fault, fill_and_compare(a, b, |i| alternate(i, q)));
    }
    fault
}

fn test_checkerboard_comparison<M: Cells + ?Sized>(a: &mut M, b: &mut M) -> Option<Fault> {
    let mut fault = None;
    for j in 0..CHECKERBOARD_PASSES {
        let q = if j % 2 == 0 { CHECKERBOARD1 } else { CHECKERBOARD2 };
        fault = Fault::merge(fault, fill_and_compare(a, b, |i| alternate(i, q)));
    }
    fault
}

fn test_blockseq_comparison<M: Cells + ?Sized>(a: &mut M, b: &mut M) -> Option<Fault> {
    let mut fault = None;
    for j in 0..BLOCK_SEQUENTIAL_PASSES {
        // Byte j in every byte of the word.
        let q = (j as Word).wrapping_mul(ONE_PER_BYTE);
        fault = Fault::merge(fault, fill_and_compare(a, b, |_| q));
    }
    fault
}

fn test_walkbits_comparison<M, F>(a: &mut M, b: &mut M, pattern: F) -> Option<Fault>
where
    M: Cells + ?Sized,
    F: Fn(usize) -> Word,
{
    let mut fault = None;
    for j in 0..WORD_BITS * 2 {
        let q = pattern(walk_position(j));
        fault = Fault::merge(fault, fill_and_compare(a, b, |_| q));
    }
    fault
}

fn test_bitspread_comparison<M: Cells + ?Sized>(a: &mut M, b: &mut M) -> Option<Fault> {
    let mut fault = None;
    for j in 0..WORD_BITS * 2 {
        let k = walk_position(j);
        // Bits k and k + 2; the upper one falls off the top of the word near the MSB.
        let q = (ONE << k) | ONE.checked_shl((k + 2) as u32).unwrap_or(0);
        fault = Fault::merge(
            fault,
            fill_and_compare(a, b, |i| if i % 2 == 0 { q } else { ONE_BITS ^ q }),
        );
    }
    fault
}

fn test_bitflip_comparison<M: Cells + ?Sized>(a: &mut M, b: &mut M) -> Option<Fault> {
    let mut fault = None;
    for k in 0..WORD_BITS {
        let mut q = ONE << k;
        for _ in 0..BIT_FLIP_ROUNDS {
            q = !q;
            fault = Fault::merge(fault, fill_and_compare(a, b, |i| alternate(i, q)));
        }
    }
    fault
}

/// Writes the reference copy with full-word stores and its partner through
/// byte lanes, swapping roles on the second pass.
fn test_8bit_wide_random<M, R>(a: &mut M, b: &mut M, rng: &mut R) -> Option<Fault>
where
    M: Cells + ?Sized,
    R: Rng + ?Sized,
{
    let mut fault = None;
    for attempt in 0..NARROW_WRITE_PASSES {
        for i in 0..a.len() {
            let value: Word = rng.gen();
            let (wide, narrow) = if attempt % 2 == 1 {
                (&mut *b, &mut *a)
            } else {
                (&mut *a, &mut *b)
            };
            wide.write(i, value);
            for (lane, byte) in value.to_ne_bytes().into_iter().enumerate() {
                narrow.write_u8(i, lane, byte);
            }
        }
        fault = Fault::merge(fault, compare_regions(a, b));
    }
    fault
}

fn test_16bit_wide_random<M, R>(a: &mut M, b: &mut M, rng: &mut R) -> Option<Fault>
where
    M: Cells + ?Sized,
    R: Rng + ?Sized,
{
    let mut fault = None;
    for attempt in 0..NARROW_WRITE_PASSES {
        for i in 0..a.len() {
            let value: Word = rng.gen();
            let (wide, narrow) = if attempt % 2 == 1 {
                (&mut *b, &mut *a)
            } else {
                (&mut *a, &mut *b)
            };
            wide.write(i, value);
            let bytes = value.to_ne_bytes();
            for (lane, pair) in bytes.chunks_exact(2).enumerate() {
                narrow.write_u16(i, lane, u16::from_ne_bytes([pair[0], pair[1]]));
            }
        }
        fault = Fault::merge(fault, compare_regions(a, b));
    }
    fault
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::split_halves;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const ALL_PAIRED: &[TestKind] = &[
        TestKind::RandomValue,
        TestKind::XorComparison,
        TestKind::SubComparison,
        TestKind::MulComparison,
        TestKind::DivComparison,
        TestKind::OrComparison,
        TestKind::AndComparison,
        TestKind::SeqIncComparison,
        TestKind::SolidBitsComparison,
        TestKind::BlockSeqComparison,
        TestKind::CheckerboardComparison,
        TestKind::BitSpreadComparison,
        TestKind::BitFlipComparison,
        TestKind::WalkingOnesComparison,
        TestKind::WalkingZeroesComparison,
        TestKind::Bit8WideRandom,
        TestKind::Bit16WideRandom,
    ];

    /// Memory whose cell `stuck` always reads back `value`.
    struct StuckCell {
        words: Vec<Word>,
        stuck: usize,
        value: Word,
    }

    impl Cells for StuckCell {
        fn len(&self) -> usize {
            self.words.len()
        }
        fn read(&self, index: usize) -> Word {
            if index == self.stuck {
                self.value
            } else {
                self.words[index]
            }
        }
        fn write(&mut self, index: usize, value: Word) {
            self.words[index] = value;
        }
    }

    /// Memory where every write is recorded, for checking what tests store.
    struct Recording {
        words: Vec<Word>,
        writes: Vec<(usize, Word)>,
    }

    impl Cells for Recording {
        fn len(&self) -> usize {
            self.words.len()
        }
        fn read(&self, index: usize) -> Word {
            self.words[index]
        }
        fn write(&mut self, index: usize, value: Word) {
            self.writes.push((index, value));
            self.words[index] = value;
        }
    }

    #[test]
    fn every_test_passes_on_fault_free_memory() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut region = vec![0 as Word; 256];
        let (a, b) = split_halves(&mut region).unwrap();
        for kind in ALL_PAIRED {
            assert_eq!(run_paired(*kind, a, b, &mut rng), Ok(()), "{kind:?}");
        }
    }

    #[test]
    fn every_test_catches_a_stuck_cell() {
        let mut rng = StdRng::seed_from_u64(11);
        for kind in ALL_PAIRED {
            let mut a = StuckCell {
                words: vec![0; 64],
                stuck: 17,
                value: 0x5A,
            };
            let mut b = StuckCell {
                words: vec![0; 64],
                stuck: usize::MAX,
                value: 0,
            };
            let fault = run_paired(*kind, &mut a, &mut b, &mut rng).unwrap_err();
            assert_eq!(fault.first_offset, 17 * WORD_BYTES, "{kind:?}");
        }
    }

    #[test]
    fn faults_aggregate_across_passes() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut a = StuckCell {
            words: vec![0; 8],
            stuck: 2,
            value: 0x1234,
        };
        let mut b = StuckCell {
            words: vec![0; 8],
            stuck: usize::MAX,
            value: 0,
        };
        let fault = run_paired(TestKind::SolidBitsComparison, &mut a, &mut b, &mut rng).unwrap_err();
        // The stuck word disagrees with its partner on every one of the passes.
        assert_eq!(fault.mismatches, SOLID_BITS_PASSES);
    }

    #[test]
    fn same_seed_writes_same_patterns() {
        let run = |kind, seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut a = Recording {
                words: vec![0; 16],
                writes: Vec::new(),
            };
            let mut b = Recording {
                words: vec![0; 16],
                writes: Vec::new(),
            };
            run_paired(kind, &mut a, &mut b, &mut rng).unwrap();
            (a.writes, b.writes)
        };
        for kind in ALL_PAIRED {
            assert_eq!(run(*kind, 42), run(*kind, 42), "{kind:?}");
        }
    }

    #[test]
    fn random_tests_depend_on_the_seed() {
        let run = |kind, seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut a = Recording {
                words: vec![0; 16],
                writes: Vec::new(),
            };
            let mut b = Recording {
                words: vec![0; 16],
                writes: Vec::new(),
            };
            run_paired(kind, &mut a, &mut b, &mut rng).unwrap();
            a.writes
        };
        let seeded = [
            TestKind::RandomValue,
            TestKind::XorComparison,
            TestKind::SubComparison,
            TestKind::MulComparison,
            TestKind::DivComparison,
            TestKind::OrComparison,
            TestKind::AndComparison,
            TestKind::SeqIncComparison,
            TestKind::Bit8WideRandom,
            TestKind::Bit16WideRandom,
        ];
        for kind in seeded {
            assert_ne!(run(kind, 42), run(kind, 43), "{kind:?}");
        }
    }

    #[test]
    fn walking_patterns_set_or_clear_exactly_one_bit() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut a = Recording {
            words: vec![0; 2],
            writes: Vec::new(),
        };
        let mut b = Recording {
            words: vec![0; 2],
            writes: Vec::new(),
        };
        run_paired(TestKind::WalkingOnesComparison, &mut a, &mut b, &mut rng).unwrap();
        assert_eq!(a.writes.len(), WORD_BITS * 2 * 2);
        assert!(a.writes.iter().all(|(_, v)| v.count_ones() == 1));
        // Walks up to the top bit and back down to bit 0.
        assert_eq!(a.writes[0].1, 1);
        assert_eq!(a.writes[(WORD_BITS - 1) * 2].1, ONE << (WORD_BITS - 1));
        assert_eq!(a.writes.last().unwrap().1, 1);

        a.writes.clear();
        run_paired(TestKind::WalkingZeroesComparison, &mut a, &mut b, &mut rng).unwrap();
        assert!(a.writes.iter().all(|(_, v)| v.count_zeros() == 1));
    }

    #[test]
    fn comparison_halves_hold_the_operator_relation() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut region = vec![0 as Word; 64];
        let (a, b) = split_halves(&mut region).unwrap();
        run_paired(TestKind::XorComparison, a, b, &mut rng).unwrap();
        // One operand per test: a ^ b is the same for every pair.
        let q = a[0] ^ b[0];
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x ^ y == q));
    }

    #[test]
    fn mask_zero_selects_everything() {
        assert_eq!(TestMask::ALL.selected().count(), TESTS.len());
        let only_checkerboard = TestMask(1 << 10);
        let picked: Vec<_> = only_checkerboard.selected().collect();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].1.name, "Checkerboard");
    }

    #[test]
    fn mask_parses_c_style_numbers() {
        assert_eq!(TestMask::from_env_value("0x3").unwrap(), TestMask(3));
        assert_eq!(TestMask::from_env_value("010").unwrap(), TestMask(8));
        assert_eq!(TestMask::from_env_value("12").unwrap(), TestMask(12));
        assert!(TestMask::from_env_value("0xZZ").is_err());
        assert!(TestMask::from_env_value("").is_err());
    }

    #[test]
    fn registry_is_in_mask_order() {
        assert_eq!(TESTS[0].name, "Random Value");
        assert_eq!(TESTS[14].name, "Walking Zeroes");
        #[cfg(not(feature = "narrow-writes"))]
        assert_eq!(TESTS.len(), 15);
        #[cfg(feature = "narrow-writes")]
        assert_eq!(TESTS.len(), 17);
        assert!(TESTS
            .iter()
            .all(|t| matches!(t.applicability, Applicability::Paired(_))));
        assert_eq!(test_mask_help().len(), TESTS.len() + 2);
    }

    #[test]
    fn stuck_address_is_never_a_paired_test() {
        assert_eq!(STUCK_ADDRESS.applicability, Applicability::SingleRegion);
        assert!(TESTS.iter().all(|t| t.name != STUCK_ADDRESS.name));
    }
}
