//! Contiguous, order-preserving split of a training set across workers.

use std::ops::Range;

use crate::error::FlError;

/// Half-open index range owned by worker `index` (1-based) out of `workers`.
/// The last worker absorbs the remainder.
pub fn partition(total: usize, workers: usize, index: usize) -> Result<Range<usize>, FlError> {
    if workers == 0 || index == 0 || index > workers || total < workers {
        return Err(FlError::InvalidPartition { total, workers, index });
    }
    let size = total / workers;
    let start = (index - 1) * size;
    let end = if index == workers { total } else { start + size };
    Ok(start..end)
}
