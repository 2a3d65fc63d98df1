use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BlockwardenError, Error};
use crate::job::Job;

/// Priority in which a tenant's compaction jobs are executed.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobsOrder {
    /// Split jobs first, oldest first. Then merge jobs, smallest range first and
    /// oldest first within a range.
    #[default]
    SmallestRangeOldestBlocksFirst,
    /// Jobs with the most recent blocks first.
    NewestBlocksFirst,
}

impl JobsOrder {
    pub const ALL: [JobsOrder; 2] = [
        JobsOrder::SmallestRangeOldestBlocksFirst,
        JobsOrder::NewestBlocksFirst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobsOrder::SmallestRangeOldestBlocksFirst => "smallest-range-oldest-blocks-first",
            JobsOrder::NewestBlocksFirst => "newest-blocks-first",
        }
    }

    /// Sorts jobs in place. The sort is stable and ends with the job key, so the
    /// order is fully determined by the jobs themselves.
    pub fn sort(&self, jobs: &mut [Job]) {
        match self {
            JobsOrder::SmallestRangeOldestBlocksFirst => {
                sort_smallest_range_oldest_blocks_first(jobs)
            }
            JobsOrder::NewestBlocksFirst => sort_newest_blocks_first(jobs),
        }
    }
}

impl fmt::Display for JobsOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobsOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobsOrder::ALL
            .into_iter()
            .find(|order| order.as_str() == s)
            .ok_or_else(|| BlockwardenError::InvalidJobsOrder(s.to_string()).into())
    }
}

fn sort_smallest_range_oldest_blocks_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        // split jobs go first whatever their length, so a big old split job is
        // not starved by small merges
        b.use_splitting()
            .cmp(&a.use_splitting())
            .then_with(|| {
                if a.use_splitting() {
                    a.min_time().cmp(&b.min_time())
                } else {
                    span(a)
                        .cmp(&span(b))
                        .then_with(|| a.min_time().cmp(&b.min_time()))
                }
            })
            .then_with(|| a.key().cmp(b.key()))
    });
}

fn sort_newest_blocks_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.max_time()
            .cmp(&a.max_time())
            .then_with(|| span(a).cmp(&span(b)))
            .then_with(|| a.key().cmp(b.key()))
    });
}

fn span(job: &Job) -> i64 {
    job.max_time().saturating_sub(job.min_time())
}
