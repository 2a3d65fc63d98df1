//! Block metadata as stored in `<tenant>/<block-id>/meta.json`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::hash::HashVersion;
use crate::sharding::COMPACTOR_SHARD_ID_LABEL;

/// Name of the metadata object inside a block directory. It is uploaded last,
/// so a block directory without it is partial.
pub const META_FILENAME: &str = "meta.json";

/// External label set by ingesters. Ignored when grouping blocks for compaction.
pub const HOSTNAME_LABEL: &str = "__hostname__";

/// A file belonging to a block, relative to the block directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFile {
    pub rel_path: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Metadata of an immutable block.
///
/// `min_time` and `max_time` are milliseconds since the Unix epoch and describe
/// the half-open interval `[min_time, max_time)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: Ulid,
    pub min_time: i64,
    pub max_time: i64,
    #[serde(default = "default_compaction_level")]
    pub compaction_level: u32,
    #[serde(default)]
    pub sources: Vec<Ulid>,
    #[serde(default)]
    pub downsample_resolution: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<BlockFile>,
}

fn default_compaction_level() -> u32 {
    1
}

impl BlockMeta {
    /// A freshly written level-1 block whose only source is itself.
    pub fn new(id: Ulid, min_time: i64, max_time: i64) -> Self {
        Self {
            id,
            min_time,
            max_time,
            compaction_level: 1,
            sources: vec![id],
            downsample_resolution: 0,
            labels: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    pub fn with_label(mut self, name: &str, value: &str) -> Self {
        self.labels.insert(name.to_string(), value.to_string());
        self
    }

    /// Value of the compactor shard label, if set and non-empty.
    pub fn shard_id(&self) -> Option<&str> {
        self.labels
            .get(COMPACTOR_SHARD_ID_LABEL)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The block's external labels minus the named ones.
    pub fn labels_without(&self, names: &[&str]) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .filter(|(name, _)| !names.contains(&name.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Key shared by blocks that may be compacted together regardless of their
    /// current shard: `"{resolution}@{labels hash}"` where the hash skips the
    /// shard and hostname labels.
    pub fn default_group_key(&self, hash: HashVersion) -> String {
        let labels = self.labels_without(&[COMPACTOR_SHARD_ID_LABEL, HOSTNAME_LABEL]);
        format!("{}@{}", self.downsample_resolution, hash.labels(&labels))
    }
}

/// Parses the name of a top-level entry in a tenant bucket as a block id.
/// Accepts both `"<ulid>"` and `"<ulid>/"`.
pub fn parse_block_dir(name: &str) -> Option<Ulid> {
    Ulid::from_string(name.trim_end_matches('/')).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_group_key_ignores_shard_and_hostname() {
        let id = Ulid::from_parts(1, 1);
        let plain = BlockMeta::new(id, 0, 10).with_label("env", "prod");
        let sharded = plain
            .clone()
            .with_label(COMPACTOR_SHARD_ID_LABEL, "1_of_2")
            .with_label(HOSTNAME_LABEL, "ingester-1");

        assert_eq!(
            plain.default_group_key(HashVersion::V1),
            sharded.default_group_key(HashVersion::V1)
        );

        let other = plain.clone().with_label("env", "dev");
        assert_ne!(
            plain.default_group_key(HashVersion::V1),
            other.default_group_key(HashVersion::V1)
        );
    }

    #[test]
    fn test_shard_id_treats_empty_label_as_unsharded() {
        let id = Ulid::from_parts(1, 1);
        let meta = BlockMeta::new(id, 0, 10).with_label(COMPACTOR_SHARD_ID_LABEL, "");
        assert_eq!(meta.shard_id(), None);
        let meta = meta.with_label(COMPACTOR_SHARD_ID_LABEL, "2_of_4");
        assert_eq!(meta.shard_id(), Some("2_of_4"));
    }

    #[test]
    fn test_meta_json_defaults() {
        let id = Ulid::from_parts(1_700_000_000_000, 7);
        let json = format!(r#"{{"id":"{}","min_time":5,"max_time":9}}"#, id);
        let meta: BlockMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta.compaction_level, 1);
        assert!(meta.sources.is_empty());
        assert!(meta.labels.is_empty());
    }

    #[test]
    fn test_parse_block_dir() {
        let id = Ulid::from_parts(1_700_000_000_000, 7);
        assert_eq!(parse_block_dir(&format!("{}/", id)), Some(id));
        assert_eq!(parse_block_dir(&id.to_string()), Some(id));
        assert_eq!(parse_block_dir("markers"), None);
        assert_eq!(parse_block_dir("bucket-index.json.gz"), None);
    }
}
