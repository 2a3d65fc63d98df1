use crate::block::BlockMeta;
use crate::error::{BlockwardenError, Error};
use crate::grouper::range_start;

/// Last check on a job's blocks before they are handed to the block compactor.
pub trait Planner: Send + Sync {
    /// Returns the blocks to compact, which must be `metas` unchanged.
    fn plan<'a>(&self, metas: &'a [BlockMeta]) -> Result<&'a [BlockMeta], Error>;
}

/// Verifies that every block of a split-and-merge job fits in the window of the
/// largest configured range that starts at the first block's `min_time`.
#[derive(Debug, Clone)]
pub struct SplitAndMergePlanner {
    ranges: Vec<i64>,
}

impl SplitAndMergePlanner {
    /// `ranges` are milliseconds, sorted ascending.
    pub fn new(ranges: Vec<i64>) -> Self {
        Self { ranges }
    }
}

impl Planner for SplitAndMergePlanner {
    fn plan<'a>(&self, metas: &'a [BlockMeta]) -> Result<&'a [BlockMeta], Error> {
        let (Some(first), Some(&largest_range)) = (metas.first(), self.ranges.last()) else {
            return Ok(metas);
        };
        let range_start = range_start(first, largest_range);
        let range_end = range_start + largest_range;

        for meta in metas {
            if meta.min_time < range_start || meta.max_time > range_end {
                return Err(BlockwardenError::BlockOutsideRange {
                    block_id: meta.id,
                    min_time: meta.min_time,
                    max_time: meta.max_time,
                    range_start,
                    range_end,
                }
                .into());
            }
        }
        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::rstest;
    use ulid::Ulid;

    fn blocks(times: &[(i64, i64)]) -> Vec<BlockMeta> {
        times
            .iter()
            .enumerate()
            .map(|(i, (min, max))| BlockMeta::new(Ulid::from_parts(i as u64 + 1, 1), *min, *max))
            .collect()
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::single_block_in_range(&[(10, 20)])]
    #[case::blocks_fill_the_largest_range(&[(0, 20), (20, 40), (40, 80)])]
    #[case::negative_times(&[(-80, -60), (-20, 0)])]
    fn test_plan_returns_blocks_unchanged(#[case] times: &[(i64, i64)]) {
        let metas = blocks(times);
        let planner = SplitAndMergePlanner::new(vec![20, 40, 80]);
        let planned = planner.plan(&metas).unwrap();
        assert_eq!(planned, metas.as_slice());
    }

    #[test]
    fn test_plan_without_ranges_is_a_noop() {
        let metas = blocks(&[(0, 1_000)]);
        let planner = SplitAndMergePlanner::new(vec![]);
        assert_eq!(planner.plan(&metas).unwrap().len(), 1);
    }

    #[rstest]
    #[case::ends_after_range(&[(0, 20), (70, 90)], 1)]
    #[case::starts_before_range(&[(80, 100), (60, 100)], 1)]
    #[case::first_block_crosses_range(&[(60, 100)], 0)]
    fn test_plan_rejects_block_outside_largest_range(
        #[case] times: &[(i64, i64)],
        #[case] bad_block: usize,
    ) {
        let metas = blocks(times);
        let planner = SplitAndMergePlanner::new(vec![20, 40, 80]);
        let err = planner.plan(&metas).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains(&metas[bad_block].id.to_string()));
    }
}
