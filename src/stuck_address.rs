//! Address-line test over the whole region.
//!
//! Every word receives a value derived from its own index. If two addresses
//! decode to the same cell, the later write clobbers the earlier one and the
//! read-back no longer matches.

use crate::error::Fault;
use crate::memory::{Cells, Word, WORD_BYTES};

const STUCK_ADDRESS_PASSES: usize = 16;
const MAX_REPORTED_MISMATCHES: usize = 16;

/// Runs the full stuck-address sequence: even passes walk ascending, odd
/// passes descending, and the stored value alternates between the index and
/// its complement.
pub fn test_stuck_address<M: Cells + ?Sized>(region: &mut M) -> Result<(), Fault> {
    match scan(region) {
        Some(fault) => Err(fault),
        None => Ok(()),
    }
}

fn expected(i: usize, pass: usize) -> Word {
    let tag = i as Word;
    if (i + pass) % 2 == 0 {
        tag
    } else {
        !tag
    }
}

fn scan<M: Cells + ?Sized>(region: &mut M) -> Option<Fault> {
    let count = region.len();
    let mut fault: Option<Fault> = None;

    for pass in 0..STUCK_ADDRESS_PASSES {
        let ascending = pass % 2 == 0;
        let order = |step: usize| if ascending { step } else { count - 1 - step };

        for step in 0..count {
            let i = order(step);
            region.write(i, expected(i, pass));
        }

        for step in 0..count {
            let i = order(step);
            let actual = region.read(i);
            if actual != expected(i, pass) {
                let offset = i * WORD_BYTES;
                let reported = fault.as_ref().map_or(0, |f| f.mismatches);
                if reported < MAX_REPORTED_MISMATCHES {
                    crate::log_error_fmt!(
                        "FAILURE: possible bad address line at offset 0x{offset:08x}"
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
    }
    fault
}
