//! Stand-alone exponent statistics over an existing matrix.

use super::{StatsTarget, StridedMatrix};
use crate::element::Element;
use crate::primitive::RiskPredicate;
use crate::stats::LocalStats;
use mpsgemm_common::{MpsgemmError, Result};
use rayon::prelude::*;

/// Classify every element of `matrix` and accumulate into `stats`.
pub fn run_exp_stats<T: Element>(
    predicate: &dyn RiskPredicate,
    matrix: &StridedMatrix<T>,
    stats: &StatsTarget,
) -> Result<()> {
    let span = matrix
        .span()
        .ok_or_else(|| MpsgemmError::LaunchFailed("matrix span overflows the address space".into()))?;
    let data = matrix.ptr.read_span(span);

    (0..matrix.batch_count * matrix.cols).into_par_iter().for_each(|index| {
        let item = index / matrix.cols;
        let col = index % matrix.cols;
        let start = item * matrix.stride + col * matrix.ld;
        let mut local = LocalStats::default();
        for v in &data[start..start + matrix.rows] {
            local.record(predicate, v.magnitude());
        }
        if let Some(cell) = stats.cell_for(item) {
            cell.accumulate(&local);
        }
    });
    Ok(())
}
