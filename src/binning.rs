//! UCSC-style hierarchical binning of genomic intervals.
//!
//! Intervals are assigned the smallest bin that fully contains them. Bins
//! come in six levels; the smallest spans 128 kb and each level above grows
//! by a factor of eight. Interval-overlap queries enumerate every bin that
//! can intersect the query range and probe `field_position` with
//! `WHERE bin IN (...)`, so insert and query must use the same arithmetic.

use crate::err::{Error, Result};

/// First bin id of each level, smallest (128 kb) to largest.
const LEVEL_OFFSETS: [i64; 6] = [4681, 585, 73, 9, 1, 0];

/// log2 of the extent of the smallest bin (128 kb).
const FIRST_SHIFT: u32 = 17;

/// log2 of the level-to-level growth factor.
const NEXT_SHIFT: u32 = 3;

/// One past the largest position the scheme can represent.
const MAX_POSITION: i64 = 1 << (FIRST_SHIFT + (LEVEL_OFFSETS.len() as u32 - 1) * NEXT_SHIFT);

fn check_interval(start: i64, end: i64) -> Result<()> {
    if start < 0 || end <= start {
        return Err(Error::Input(format!("invalid interval [{}, {})", start, end)));
    }
    if end > MAX_POSITION {
        return Err(Error::Input(format!(
            "interval [{}, {}) beyond binnable range {}",
            start, end, MAX_POSITION
        )));
    }
    Ok(())
}

/// Smallest bin containing the 0-based half-open interval `[start, end)`.
pub fn bin_from_range(start: i64, end: i64) -> Result<i64> {
    check_interval(start, end)?;
    let mut start_bin = start >> FIRST_SHIFT;
    let mut end_bin = (end - 1) >> FIRST_SHIFT;
    for offset in LEVEL_OFFSETS {
        if start_bin == end_bin {
            return Ok(offset + start_bin);
        }
        start_bin >>= NEXT_SHIFT;
        end_bin >>= NEXT_SHIFT;
    }
    unreachable!("interval bounds checked against MAX_POSITION");
}

/// All bins, at every level, that may overlap `[start, end)`.
pub fn overlapping_bins(start: i64, end: i64) -> Result<Vec<i64>> {
    check_interval(start, end)?;
    let mut bins = Vec::new();
    let mut start_bin = start >> FIRST_SHIFT;
    let mut end_bin = (end - 1) >> FIRST_SHIFT;
    for offset in LEVEL_OFFSETS {
        for bin in start_bin..=end_bin {
            bins.push(offset + bin);
        }
        start_bin >>= NEXT_SHIFT;
        end_bin >>= NEXT_SHIFT;
    }
    Ok(bins)
}
