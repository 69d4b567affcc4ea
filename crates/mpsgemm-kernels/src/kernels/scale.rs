//! Power-of-two rescaling of a matrix in place.

use super::StridedMatrix;
use crate::element::Element;
use mpsgemm_common::{MpsgemmError, Result};
use rayon::prelude::*;

/// Multiply every element of `matrix` by `2^exponent`.
pub fn run_scale<T: Element>(matrix: &StridedMatrix<T>, exponent: i32) -> Result<()> {
    let span = matrix
        .span()
        .ok_or_else(|| MpsgemmError::LaunchFailed("matrix span overflows the address space".into()))?;
    let factor = 2f32.powi(exponent.clamp(-126, 127));
    let mut data = matrix.ptr.buffer().write();
    let base = matrix.ptr.offset();
    let region = &mut data[base..base + span];

    // Columns of one item are `ld` apart and items `stride` apart, so walk
    // the region column by column and only touch the first `rows` entries.
    let starts: Vec<usize> = (0..matrix.batch_count)
        .flat_map(|item| (0..matrix.cols).map(move |col| item * matrix.stride + col * matrix.ld))
        .collect();
    let mut mask = vec![false; span];
    for start in starts {
        mask[start..start + matrix.rows].fill(true);
    }
    region.par_iter_mut().zip(mask.par_iter()).for_each(|(v, &hit)| {
        if hit {
            *v = v.scale(factor);
        }
    });
    Ok(())
}
