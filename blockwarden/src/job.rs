use std::collections::BTreeMap;
use std::fmt;

use ulid::Ulid;

use crate::block::{BlockMeta, HOSTNAME_LABEL};
use crate::error::{BlockwardenError, Error};
use crate::sharding::COMPACTOR_SHARD_ID_LABEL;

/// A set of blocks that one compactor executes together: either a split of
/// unsharded blocks into `shard_count` shards, or a merge of same-shard blocks.
#[derive(Debug, Clone)]
pub struct Job {
    tenant: String,
    key: String,
    labels: BTreeMap<String, String>,
    resolution: i64,
    metas: Vec<BlockMeta>,
    use_splitting: bool,
    shard_count: u32,
    split_stage_size: u32,
    sharding_key: String,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant: &str,
        key: &str,
        labels: BTreeMap<String, String>,
        resolution: i64,
        use_splitting: bool,
        shard_count: u32,
        split_stage_size: u32,
        sharding_key: &str,
    ) -> Self {
        Self {
            tenant: tenant.to_string(),
            key: key.to_string(),
            labels,
            resolution,
            metas: Vec::new(),
            use_splitting,
            shard_count,
            split_stage_size,
            sharding_key: sharding_key.to_string(),
        }
    }

    /// Adds a block to the job. Fails if the block's external labels or
    /// downsample resolution differ from the job's.
    pub fn append_meta(&mut self, meta: BlockMeta) -> Result<(), Error> {
        self.check_compatible(&meta)?;
        self.metas.push(meta);
        Ok(())
    }

    fn check_compatible(&self, meta: &BlockMeta) -> Result<(), BlockwardenError> {
        let incompatible = |reason: &str| BlockwardenError::IncompatibleBlock {
            block_id: meta.id,
            job_key: self.key.clone(),
            reason: reason.to_string(),
        };
        if normalized_labels(&meta.labels) != normalized_labels(&self.labels) {
            return Err(incompatible("block and job labels do not match"));
        }
        if meta.downsample_resolution != self.resolution {
            return Err(incompatible("block and job resolution do not match"));
        }
        Ok(())
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Stable identifier of the job within a planning cycle.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn resolution(&self) -> i64 {
        self.resolution
    }

    /// Source block ids in the order they were appended.
    pub fn ids(&self) -> Vec<Ulid> {
        self.metas.iter().map(|m| m.id).collect()
    }

    pub fn metas(&self) -> &[BlockMeta] {
        &self.metas
    }

    /// Smallest `min_time` of the source blocks, or `i64::MAX` for an empty job.
    pub fn min_time(&self) -> i64 {
        self.metas
            .iter()
            .map(|m| m.min_time)
            .min()
            .unwrap_or(i64::MAX)
    }

    /// Largest `max_time` of the source blocks, or `i64::MIN` for an empty job.
    pub fn max_time(&self) -> i64 {
        self.metas
            .iter()
            .map(|m| m.max_time)
            .max()
            .unwrap_or(i64::MIN)
    }

    pub fn min_compaction_level(&self) -> u32 {
        self.metas
            .iter()
            .map(|m| m.compaction_level)
            .min()
            .unwrap_or(0)
    }

    pub fn use_splitting(&self) -> bool {
        self.use_splitting
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn split_stage_size(&self) -> u32 {
        self.split_stage_size
    }

    /// Key hashed against the ring to pick the single replica running this job.
    pub fn sharding_key(&self) -> &str {
        &self.sharding_key
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (min time: {}, max time: {})",
            self.key,
            self.min_time(),
            self.max_time()
        )
    }
}

/// Drops the hostname label, and the shard label when it is empty, so that an
/// unset and an empty shard compare equal.
fn normalized_labels(labels: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    labels
        .iter()
        .filter(|(name, value)| {
            name.as_str() != HOSTNAME_LABEL
                && !(name.as_str() == COMPACTOR_SHARD_ID_LABEL && value.is_empty())
        })
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn job_for(meta: &BlockMeta) -> Job {
        Job::new(
            "tenant-a",
            "0@123-merge--0-20",
            meta.labels.clone(),
            meta.downsample_resolution,
            false,
            0,
            0,
            "tenant-a-merge-0-20-",
        )
    }

    #[test]
    fn test_append_meta_tracks_time_bounds_and_ids() {
        let first = BlockMeta::new(Ulid::from_parts(1, 1), 0, 10);
        let second = BlockMeta::new(Ulid::from_parts(2, 2), 5, 20);
        let mut job = job_for(&first);

        job.append_meta(first.clone()).unwrap();
        job.append_meta(second.clone()).unwrap();

        assert_eq!(job.ids(), vec![first.id, second.id]);
        assert_eq!(job.min_time(), 0);
        assert_eq!(job.max_time(), 20);
        assert_eq!(job.min_compaction_level(), 1);
    }

    #[test]
    fn test_append_meta_rejects_different_labels() {
        let first = BlockMeta::new(Ulid::from_parts(1, 1), 0, 10)
            .with_label(COMPACTOR_SHARD_ID_LABEL, "1_of_2");
        let other_shard = BlockMeta::new(Ulid::from_parts(2, 2), 10, 20)
            .with_label(COMPACTOR_SHARD_ID_LABEL, "2_of_2");
        let mut job = job_for(&first);

        job.append_meta(first).unwrap();
        let err = job.append_meta(other_shard).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(job.metas().len(), 1);
    }

    #[test]
    fn test_append_meta_ignores_hostname_label() {
        let first = BlockMeta::new(Ulid::from_parts(1, 1), 0, 10).with_label(HOSTNAME_LABEL, "a");
        let second =
            BlockMeta::new(Ulid::from_parts(2, 2), 10, 20).with_label(HOSTNAME_LABEL, "b");
        let mut job = job_for(&first);
        job.append_meta(first).unwrap();
        job.append_meta(second).unwrap();
    }

    #[test]
    fn test_append_meta_treats_empty_shard_label_as_unset() {
        let first = BlockMeta::new(Ulid::from_parts(1, 1), 0, 10);
        let second = BlockMeta::new(Ulid::from_parts(2, 2), 10, 20)
            .with_label(COMPACTOR_SHARD_ID_LABEL, "");
        let mut job = job_for(&first);
        job.append_meta(first).unwrap();
        job.append_meta(second).unwrap();
    }

    #[test]
    fn test_append_meta_rejects_different_resolution() {
        let first = BlockMeta::new(Ulid::from_parts(1, 1), 0, 10);
        let mut second = BlockMeta::new(Ulid::from_parts(2, 2), 10, 20);
        second.downsample_resolution = 300_000;
        let mut job = job_for(&first);
        job.append_meta(first).unwrap();
        assert!(job.append_meta(second).is_err());
    }
}
