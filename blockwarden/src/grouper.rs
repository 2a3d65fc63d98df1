//! Split-and-merge grouping of a tenant's blocks into compaction jobs.
//!
//! Blocks are first grouped by resolution and external labels (ignoring the
//! shard and hostname labels). Within each group, every configured range is
//! visited from the smallest to the largest, and blocks are bucketed into
//! aligned windows of that range:
//!
//! - In the smallest range, unsharded blocks are split into `shard_count`
//!   shards. Source blocks of a window are spread over `split_groups` split
//!   jobs by the hash of their id.
//! - Otherwise, blocks of a window sharing a shard id are merged, provided at
//!   least two of them exist.
//!
//! A job is accepted only if it does not conflict with an already accepted job
//! of a smaller range, so each block is claimed at most once per cycle.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::block::{BlockMeta, HOSTNAME_LABEL};
use crate::error::{BlockwardenError, Error};
use crate::hash::HashVersion;
use crate::job::Job;
use crate::sharding::{format_shard_id, COMPACTOR_SHARD_ID_LABEL};

/// Turns the full set of a tenant's blocks into compaction jobs.
pub trait Grouper: Send + Sync {
    fn groups(&self, blocks: &[BlockMeta]) -> Result<Vec<Job>, Error>;
}

/// The split-and-merge [Grouper].
#[derive(Debug, Clone)]
pub struct SplitAndMergeGrouper {
    tenant: String,
    ranges: Vec<i64>,
    shard_count: u32,
    split_stage_size: u32,
    split_groups: u32,
    hash: HashVersion,
}

impl SplitAndMergeGrouper {
    /// `ranges` are milliseconds, sorted ascending, each one a multiple of the
    /// previous. A `shard_count` of zero disables splitting.
    pub fn new(
        tenant: &str,
        ranges: Vec<i64>,
        shard_count: u32,
        split_stage_size: u32,
        split_groups: u32,
    ) -> Self {
        Self {
            tenant: tenant.to_string(),
            ranges,
            shard_count,
            split_stage_size,
            split_groups,
            hash: HashVersion::default(),
        }
    }

    fn build_job(&self, planned: &PlannedJob<'_>) -> Result<Option<Job>, Error> {
        let Some(first) = planned.blocks.first() else {
            return Ok(None);
        };
        if planned.stage == Stage::Split && self.shard_count == 0 {
            return Err(BlockwardenError::UnexpectedSplitJob(planned.sharding_key()).into());
        }
        let key = format!(
            "{}-{}-{}-{}-{}",
            first.default_group_key(self.hash),
            planned.stage,
            planned.shard_id,
            planned.range_start,
            planned.range_end
        );
        debug!(
            "grouper found a compactable blocks group [tenant={}, group_key={}, blocks={}]",
            self.tenant,
            key,
            planned.blocks.len()
        );
        let mut job = Job::new(
            &self.tenant,
            &key,
            first.labels.clone(),
            first.downsample_resolution,
            planned.stage == Stage::Split,
            self.shard_count,
            self.split_stage_size,
            &planned.sharding_key(),
        );
        for &meta in &planned.blocks {
            job.append_meta(meta.clone())?;
        }
        Ok(Some(job))
    }
}

impl Grouper for SplitAndMergeGrouper {
    fn groups(&self, blocks: &[BlockMeta]) -> Result<Vec<Job>, Error> {
        let planned = plan_compaction(
            &self.tenant,
            blocks,
            &self.ranges,
            self.shard_count,
            self.split_groups,
            self.hash,
        );
        let mut jobs = Vec::with_capacity(planned.len());
        for p in &planned {
            if let Some(job) = self.build_job(p)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Split,
    Merge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Split => write!(f, "split"),
            Stage::Merge => write!(f, "merge"),
        }
    }
}

#[derive(Debug)]
struct BlocksGroup<'a> {
    range_start: i64,
    range_end: i64,
    blocks: Vec<&'a BlockMeta>,
}

#[derive(Debug)]
pub(crate) struct PlannedJob<'a> {
    tenant: &'a str,
    pub(crate) stage: Stage,
    pub(crate) shard_id: String,
    pub(crate) range_start: i64,
    pub(crate) range_end: i64,
    pub(crate) blocks: Vec<&'a BlockMeta>,
}

impl PlannedJob<'_> {
    fn min_time(&self) -> i64 {
        self.blocks
            .iter()
            .map(|b| b.min_time)
            .min()
            .unwrap_or(i64::MAX)
    }

    fn max_time(&self) -> i64 {
        self.blocks
            .iter()
            .map(|b| b.max_time)
            .max()
            .unwrap_or(i64::MIN)
    }

    fn range_length(&self) -> i64 {
        self.range_end - self.range_start
    }

    pub(crate) fn sharding_key(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.tenant, self.stage, self.range_start, self.range_end, self.shard_id
        )
    }

    fn conflicts(&self, other: &PlannedJob<'_>) -> bool {
        if self.tenant != other.tenant {
            return false;
        }
        if self.range_end <= other.range_start || other.range_end <= self.range_start {
            return false;
        }
        let (Some(a), Some(b)) = (self.blocks.first(), other.blocks.first()) else {
            return false;
        };
        if a.downsample_resolution != b.downsample_resolution
            || grouping_labels(a) != grouping_labels(b)
        {
            return false;
        }
        // all splitting of a range happens before any merging that overlaps it
        if self.stage == Stage::Split || other.stage == Stage::Split {
            return true;
        }
        self.shard_id == other.shard_id
    }
}

fn grouping_labels(meta: &BlockMeta) -> BTreeMap<String, String> {
    meta.labels_without(&[COMPACTOR_SHARD_ID_LABEL, HOSTNAME_LABEL])
}

/// Plans the jobs for one tenant. Pure: the same input always produces the
/// same jobs in the same order.
pub(crate) fn plan_compaction<'a>(
    tenant: &'a str,
    blocks: &'a [BlockMeta],
    ranges: &[i64],
    shard_count: u32,
    split_groups: u32,
    hash: HashVersion,
) -> Vec<PlannedJob<'a>> {
    let Some(&smallest_range) = ranges.first() else {
        return Vec::new();
    };
    if blocks.is_empty() {
        return Vec::new();
    }

    let mut main_groups: BTreeMap<String, Vec<&BlockMeta>> = BTreeMap::new();
    for block in blocks {
        main_groups
            .entry(block.default_group_key(hash))
            .or_default()
            .push(block);
    }

    let mut jobs: Vec<PlannedJob<'a>> = Vec::new();
    for mut group in main_groups.into_values() {
        sort_by_min_time(&mut group);
        for &range in ranges {
            let candidates = plan_compaction_by_range(
                tenant,
                &group,
                range,
                range == smallest_range,
                shard_count,
                split_groups,
                hash,
            );
            for candidate in candidates {
                if jobs.iter().any(|accepted| candidate.conflicts(accepted)) {
                    continue;
                }
                jobs.push(candidate);
            }
        }
    }

    // Leave the most recent range alone until it is complete: a job is kept only
    // if its range ends before the newest block does, or if it already spans the
    // whole range.
    let highest_max_time = blocks.iter().map(|b| b.max_time).max().unwrap_or(i64::MIN);
    let mut jobs: Vec<PlannedJob<'a>> = jobs
        .into_iter()
        .filter(|job| {
            job.range_end <= highest_max_time
                || job.max_time() - job.min_time() == job.range_length()
        })
        .collect();

    jobs.sort_by_cached_key(|job| {
        let group_key = job
            .blocks
            .first()
            .map(|b| b.default_group_key(hash))
            .unwrap_or_default();
        (job.sharding_key(), group_key)
    });
    jobs
}

fn plan_compaction_by_range<'a>(
    tenant: &'a str,
    blocks: &[&'a BlockMeta],
    range: i64,
    is_smallest_range: bool,
    shard_count: u32,
    split_groups: u32,
    hash: HashVersion,
) -> Vec<PlannedJob<'a>> {
    let mut jobs = Vec::new();
    for group in group_blocks_by_range(blocks, range) {
        if shard_count > 0 && is_smallest_range {
            let split_jobs = plan_splitting(tenant, &group, split_groups, hash);
            if !split_jobs.is_empty() {
                jobs.extend(split_jobs);
                continue;
            }
        }

        // Everything in this window is already split, or splitting is off.
        for (shard_id, shard_blocks) in group_blocks_by_shard_id(&group.blocks) {
            if shard_blocks.len() < 2 {
                continue;
            }
            jobs.push(PlannedJob {
                tenant,
                stage: Stage::Merge,
                shard_id,
                range_start: group.range_start,
                range_end: group.range_end,
                blocks: shard_blocks,
            });
        }
    }
    jobs
}

fn plan_splitting<'a>(
    tenant: &'a str,
    group: &BlocksGroup<'a>,
    split_groups: u32,
    hash: HashVersion,
) -> Vec<PlannedJob<'a>> {
    let split_groups = split_groups.max(1);
    let mut jobs: BTreeMap<u32, PlannedJob<'a>> = BTreeMap::new();
    for &block in group.blocks.iter().filter(|b| b.shard_id().is_none()) {
        let split_group = hash.block_id(&block.id) % split_groups;
        jobs.entry(split_group)
            .or_insert_with(|| PlannedJob {
                tenant,
                stage: Stage::Split,
                shard_id: format_shard_id(u64::from(split_group), u64::from(split_groups)),
                range_start: group.range_start,
                range_end: group.range_end,
                blocks: Vec::new(),
            })
            .blocks
            .push(block);
    }
    jobs.into_values().collect()
}

/// Buckets blocks sorted by `min_time` into aligned windows of `range`. A block
/// crossing its window's end is left out.
fn group_blocks_by_range<'a>(blocks: &[&'a BlockMeta], range: i64) -> Vec<BlocksGroup<'a>> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < blocks.len() {
        let range_start = range_start(blocks[i], range);
        let range_end = range_start + range;
        if blocks[i].max_time > range_end {
            i += 1;
            continue;
        }

        let mut group = BlocksGroup {
            range_start,
            range_end,
            blocks: Vec::new(),
        };
        while i < blocks.len() {
            let block = blocks[i];
            if block.min_time >= range_end {
                break;
            }
            i += 1;
            if block.max_time > range_end {
                continue;
            }
            group.blocks.push(block);
        }
        if !group.blocks.is_empty() {
            groups.push(group);
        }
    }
    groups
}

fn group_blocks_by_shard_id<'a>(blocks: &[&'a BlockMeta]) -> BTreeMap<String, Vec<&'a BlockMeta>> {
    let mut groups: BTreeMap<String, Vec<&'a BlockMeta>> = BTreeMap::new();
    for &block in blocks {
        groups
            .entry(block.shard_id().unwrap_or_default().to_string())
            .or_default()
            .push(block);
    }
    groups
}

/// Start of the aligned window of `range` containing the block's `min_time`.
/// Floors towards negative infinity for negative timestamps.
pub(crate) fn range_start(meta: &BlockMeta, range: i64) -> i64 {
    meta.min_time.div_euclid(range) * range
}

fn sort_by_min_time(blocks: &mut [&BlockMeta]) {
    blocks.sort_by(|a, b| match a.min_time.cmp(&b.min_time) {
        Ordering::Equal => a.labels.cmp(&b.labels).then_with(|| a.id.cmp(&b.id)),
        other => other,
    });
}
