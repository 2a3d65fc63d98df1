//! Filters out blocks that are fully included in other blocks.
//!
//! After a compaction uploads its output and before the sources are marked for
//! deletion, both the sources and the output are visible. Planning on such a
//! set would compact the same data twice, so blocks whose sources are all part
//! of a successor block are dropped first.
//!
//! Shards make this more subtle. A sharded block is only replaced by a
//! successor with the same shard. An unsharded block is replaced by an
//! unsharded successor, or by sharded successors covering every shard.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::debug;
use ulid::Ulid;

use crate::block::BlockMeta;
use crate::sharding::parse_shard_id;

#[derive(Debug, Default)]
pub struct ShardAwareDeduplicateFilter {
    duplicate_ids: Vec<Ulid>,
}

impl ShardAwareDeduplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes duplicate blocks from `metas`. Blocks of different downsample
    /// resolutions are never duplicates of each other.
    pub fn filter(&mut self, metas: &mut BTreeMap<Ulid, BlockMeta>) {
        self.duplicate_ids.clear();

        let mut by_resolution: BTreeMap<i64, Vec<&BlockMeta>> = BTreeMap::new();
        for meta in metas.values() {
            by_resolution
                .entry(meta.downsample_resolution)
                .or_default()
                .push(meta);
        }

        let mut duplicates = BTreeSet::new();
        for blocks in by_resolution.into_values() {
            duplicates.extend(find_duplicates(blocks));
        }

        for id in duplicates {
            if metas.remove(&id).is_some() {
                debug!("filtered out duplicate block [block_id={}]", id);
                self.duplicate_ids.push(id);
            }
        }
    }

    /// Ids removed by the last [ShardAwareDeduplicateFilter::filter] call.
    pub fn duplicate_ids(&self) -> &[Ulid] {
        &self.duplicate_ids
    }
}

/// Node of the successor tree. Index 0 is the root and carries no block.
#[derive(Debug)]
struct Node<'a> {
    meta: Option<&'a BlockMeta>,
    shard_id: &'a str,
    sources: HashSet<Ulid>,
    successors: Vec<usize>,
}

impl<'a> Node<'a> {
    fn new(meta: Option<&'a BlockMeta>) -> Self {
        Self {
            meta,
            shard_id: meta.and_then(|m| m.shard_id()).unwrap_or_default(),
            sources: meta
                .map(|m| m.sources.iter().copied().collect())
                .unwrap_or_default(),
            successors: Vec::new(),
        }
    }

    /// True if `self` is included in `other`: every source of `self` is a
    /// source of `other`, and a sharded `self` requires the same shard.
    fn is_included_in(&self, other: &Node<'_>) -> bool {
        if !self.shard_id.is_empty() && self.shard_id != other.shard_id {
            return false;
        }
        self.sources.is_subset(&other.sources)
    }
}

struct SuccessorTree<'a> {
    nodes: Vec<Node<'a>>,
}

impl<'a> SuccessorTree<'a> {
    const ROOT: usize = 0;

    fn new() -> Self {
        Self {
            nodes: vec![Node::new(None)],
        }
    }

    fn insert(&mut self, meta: &'a BlockMeta) {
        let idx = self.nodes.len();
        self.nodes.push(Node::new(Some(meta)));
        self.add_successor_if_possible(Self::ROOT, idx);
    }

    /// Adds `other` under `at`, or under every successor of `at` that includes
    /// it. A node may therefore end up with several parents.
    fn add_successor_if_possible(&mut self, at: usize, other: usize) -> bool {
        if self.nodes[at].meta.is_some() && !self.nodes[at].is_included_in(&self.nodes[other]) {
            return false;
        }
        let successors = self.nodes[at].successors.clone();
        let mut added = false;
        for successor in successors {
            if self.add_successor_if_possible(successor, other) {
                added = true;
            }
        }
        if !added {
            self.nodes[at].successors.push(other);
        }
        true
    }

    fn duplicates(&self) -> HashSet<Ulid> {
        let mut out = HashSet::new();
        for node in &self.nodes {
            if let Some(meta) = node.meta {
                if self.is_fully_included_in_successors(node) {
                    out.insert(meta.id);
                }
            }
        }
        out
    }

    fn is_fully_included_in_successors(&self, node: &Node<'_>) -> bool {
        if node.successors.is_empty() {
            return false;
        }
        let successors: Vec<&Node<'_>> = node.successors.iter().map(|&i| &self.nodes[i]).collect();

        // A successor with the same shard covers this block entirely. For an
        // unsharded block that means an unsharded successor.
        if successors.iter().any(|s| s.shard_id == node.shard_id) {
            return true;
        }
        if !node.shard_id.is_empty() {
            return false;
        }

        // Unsharded block with only sharded successors: all shards must be there,
        // and all successors must agree on the shard count.
        let mut shard_count = None;
        let mut shards = HashSet::new();
        for successor in successors {
            let Ok((index, count)) = parse_shard_id(successor.shard_id) else {
                return false;
            };
            if *shard_count.get_or_insert(count) != count {
                return false;
            }
            shards.insert(index);
        }
        shard_count.is_some_and(|count| (0..count).all(|ix| shards.contains(&ix)))
    }
}

fn find_duplicates(mut blocks: Vec<&BlockMeta>) -> HashSet<Ulid> {
    // blocks with fewer sources go first so successors are inserted after the
    // blocks they include
    blocks.sort_by(|a, b| {
        a.sources
            .len()
            .cmp(&b.sources.len())
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut tree = SuccessorTree::new();
    for meta in blocks {
        tree.insert(meta);
    }
    tree.duplicates()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::COMPACTOR_SHARD_ID_LABEL;

    fn id(n: u64) -> Ulid {
        Ulid::from_parts(n, u128::from(n))
    }

    fn meta(n: u64, sources: &[u64], shard: Option<&str>) -> BlockMeta {
        let mut meta = BlockMeta::new(id(n), 0, 10);
        meta.sources = sources.iter().map(|s| id(*s)).collect();
        if let Some(shard) = shard {
            meta = meta.with_label(COMPACTOR_SHARD_ID_LABEL, shard);
        }
        meta
    }

    fn run(metas: Vec<BlockMeta>) -> Vec<Ulid> {
        let mut input: BTreeMap<Ulid, BlockMeta> = metas.into_iter().map(|m| (m.id, m)).collect();
        let mut filter = ShardAwareDeduplicateFilter::new();
        filter.filter(&mut input);
        let mut removed = filter.duplicate_ids().to_vec();
        removed.sort();
        for id in &removed {
            assert!(!input.contains_key(id));
        }
        removed
    }

    #[test]
    fn test_no_duplicates() {
        let removed = run(vec![meta(1, &[1], None), meta(2, &[2], None)]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_merged_sources_are_duplicates() {
        let removed = run(vec![
            meta(1, &[1], None),
            meta(2, &[2], None),
            meta(3, &[1, 2], None),
        ]);
        assert_eq!(removed, vec![id(1), id(2)]);
    }

    #[test]
    fn test_partial_overlap_is_not_duplicate() {
        let removed = run(vec![
            meta(1, &[1], None),
            meta(2, &[2], None),
            meta(3, &[2, 4], None),
        ]);
        assert_eq!(removed, vec![id(2)]);
    }

    #[test]
    fn test_unsharded_block_needs_all_shards() {
        let source = meta(1, &[1], None);
        let removed = run(vec![source.clone(), meta(2, &[1], Some("1_of_2"))]);
        assert!(removed.is_empty());

        let removed = run(vec![
            source,
            meta(2, &[1], Some("1_of_2")),
            meta(3, &[1], Some("2_of_2")),
        ]);
        assert_eq!(removed, vec![id(1)]);
    }

    #[test]
    fn test_unsharded_block_with_mixed_shard_counts_is_kept() {
        let removed = run(vec![
            meta(1, &[1], None),
            meta(2, &[1], Some("1_of_2")),
            meta(3, &[1], Some("2_of_3")),
            meta(4, &[1], Some("3_of_3")),
        ]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_sharded_block_requires_same_shard_successor() {
        let removed = run(vec![
            meta(1, &[1], Some("1_of_2")),
            meta(2, &[2], Some("1_of_2")),
            meta(3, &[1, 2], Some("2_of_2")),
        ]);
        assert!(removed.is_empty());

        let removed = run(vec![
            meta(1, &[1], Some("1_of_2")),
            meta(2, &[2], Some("1_of_2")),
            meta(3, &[1, 2], Some("1_of_2")),
        ]);
        assert_eq!(removed, vec![id(1), id(2)]);
    }

    #[test]
    fn test_different_resolutions_are_not_duplicates() {
        let mut downsampled = meta(3, &[1, 2], None);
        downsampled.downsample_resolution = 300_000;
        let removed = run(vec![meta(1, &[1], None), meta(2, &[2], None), downsampled]);
        assert!(removed.is_empty());
    }
}
