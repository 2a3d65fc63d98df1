//! Per-tenant bucket index.
//!
//! The index caches the metadata of every live block of a tenant plus their
//! deletion marks, so that readers and the compactor do not need to list the
//! bucket. It is stored as gzip-compressed JSON at
//! `<tenant>/bucket-index.json.gz` and is always replaced with a single `put`.
//! The blocks cleaner is its only writer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::block::{BlockMeta, META_FILENAME};
use crate::bucket::TenantBucket;
use crate::error::{BlockwardenError, Error};
use crate::markers::{
    parse_global_deletion_mark, read_block_deletion_mark, BlockDeletionMark, MARKERS_DIR,
};

pub const INDEX_FILENAME: &str = "bucket-index.json.gz";
pub const INDEX_VERSION: u32 = 3;

const META_FETCH_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketIndex {
    pub version: u32,
    pub blocks: Vec<BlockMeta>,
    pub block_deletion_marks: Vec<BlockDeletionMark>,
    /// Unix seconds.
    pub updated_at: i64,
}

impl BucketIndex {
    pub fn new(updated_at: DateTime<Utc>) -> Self {
        Self {
            version: INDEX_VERSION,
            blocks: Vec::new(),
            block_deletion_marks: Vec::new(),
            updated_at: updated_at.timestamp(),
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.updated_at, 0).unwrap_or_default()
    }

    pub fn block(&self, id: Ulid) -> Option<&BlockMeta> {
        self.blocks.iter().find(|meta| meta.id == id)
    }

    pub fn deletion_mark(&self, id: Ulid) -> Option<&BlockDeletionMark> {
        self.block_deletion_marks.iter().find(|mark| mark.id == id)
    }

    /// Ids of the blocks carrying a deletion mark.
    pub fn marked_block_ids(&self) -> HashSet<Ulid> {
        self.block_deletion_marks.iter().map(|mark| mark.id).collect()
    }

    /// Live blocks without a deletion mark.
    pub fn unmarked_blocks(&self) -> Vec<BlockMeta> {
        let marked = self.marked_block_ids();
        self.blocks
            .iter()
            .filter(|meta| !marked.contains(&meta.id))
            .cloned()
            .collect()
    }

    /// Removes a block and its deletion mark.
    pub(crate) fn remove_block(&mut self, id: Ulid) {
        self.blocks.retain(|meta| meta.id != id);
        self.block_deletion_marks.retain(|mark| mark.id != id);
    }
}

/// Reads the index of a tenant.
pub async fn read_index(bucket: &TenantBucket) -> Result<BucketIndex, Error> {
    Ok(read(bucket).await?)
}

pub(crate) async fn read(bucket: &TenantBucket) -> Result<BucketIndex, BlockwardenError> {
    let compressed = match bucket.get(INDEX_FILENAME).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => {
            return Err(BlockwardenError::IndexNotFound(bucket.tenant().to_string()))
        }
        Err(e) => return Err(e),
    };
    let corrupted = || BlockwardenError::IndexCorrupted(bucket.tenant().to_string());

    let mut json = Vec::new();
    GzDecoder::new(compressed.as_ref())
        .read_to_end(&mut json)
        .map_err(|_| corrupted())?;
    serde_json::from_slice(&json).map_err(|_| corrupted())
}

pub(crate) async fn write(bucket: &TenantBucket, index: &BucketIndex) -> Result<(), BlockwardenError> {
    let json = serde_json::to_vec(index)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    bucket.put(INDEX_FILENAME, Bytes::from(compressed)).await
}

pub(crate) async fn delete(bucket: &TenantBucket) -> Result<(), BlockwardenError> {
    bucket.delete(INDEX_FILENAME).await
}

/// Rebuilds a tenant's index from the bucket, reusing what an older index
/// already knows.
pub(crate) struct Updater<'a> {
    bucket: &'a TenantBucket,
}

impl<'a> Updater<'a> {
    pub(crate) fn new(bucket: &'a TenantBucket) -> Self {
        Self { bucket }
    }

    /// Returns the new index and the partial blocks found while listing. Each
    /// partial block maps to [BlockwardenError::BlockMetaNotFound] or
    /// [BlockwardenError::BlockMetaCorrupted]. A block is never both live and
    /// partial.
    pub(crate) async fn update_index(
        &self,
        old: Option<&BucketIndex>,
        now: DateTime<Utc>,
    ) -> Result<(BucketIndex, BTreeMap<Ulid, BlockwardenError>), BlockwardenError> {
        let (blocks, partials) = self.update_blocks(old).await?;
        let live: HashSet<Ulid> = blocks.iter().map(|meta| meta.id).collect();
        let mut block_deletion_marks = self.update_deletion_marks(old).await?;
        block_deletion_marks.retain(|mark| live.contains(&mark.id));

        Ok((
            BucketIndex {
                version: INDEX_VERSION,
                blocks,
                block_deletion_marks,
                updated_at: now.timestamp(),
            },
            partials,
        ))
    }

    async fn update_blocks(
        &self,
        old: Option<&BucketIndex>,
    ) -> Result<(Vec<BlockMeta>, BTreeMap<Ulid, BlockwardenError>), BlockwardenError> {
        let known: HashMap<Ulid, &BlockMeta> = old
            .map(|idx| idx.blocks.iter().map(|meta| (meta.id, meta)).collect())
            .unwrap_or_default();

        let mut blocks = Vec::new();
        let mut discovered = Vec::new();
        for id in self.bucket.list_block_ids().await? {
            match known.get(&id) {
                Some(meta) => blocks.push((*meta).clone()),
                None => discovered.push(id),
            }
        }

        let fetched: Vec<(Ulid, Result<BlockMeta, BlockwardenError>)> = stream::iter(discovered)
            .map(|id| async move { (id, self.read_block_meta(id).await) })
            .buffer_unordered(META_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut partials = BTreeMap::new();
        for (id, result) in fetched {
            match result {
                Ok(meta) => {
                    debug!(tenant = self.bucket.tenant(), block_id = %id, "loaded new block");
                    blocks.push(meta);
                }
                Err(
                    e @ (BlockwardenError::BlockMetaNotFound(_)
                    | BlockwardenError::BlockMetaCorrupted(_)),
                ) => {
                    partials.insert(id, e);
                }
                Err(e) => return Err(e),
            }
        }

        blocks.sort_by_key(|meta| meta.id);
        Ok((blocks, partials))
    }

    async fn read_block_meta(&self, id: Ulid) -> Result<BlockMeta, BlockwardenError> {
        let bytes = match self.bucket.get(&format!("{}/{}", id, META_FILENAME)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Err(BlockwardenError::BlockMetaNotFound(id)),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes).map_err(|_| BlockwardenError::BlockMetaCorrupted(id))
    }

    async fn update_deletion_marks(
        &self,
        old: Option<&BucketIndex>,
    ) -> Result<Vec<BlockDeletionMark>, BlockwardenError> {
        let known: HashMap<Ulid, &BlockDeletionMark> = old
            .map(|idx| {
                idx.block_deletion_marks
                    .iter()
                    .map(|mark| (mark.id, mark))
                    .collect()
            })
            .unwrap_or_default();

        let objects = self.bucket.list_objects(MARKERS_DIR).await?;
        let ids: Vec<Ulid> = objects
            .iter()
            .filter_map(|object| object.location.filename())
            .filter_map(parse_global_deletion_mark)
            .collect();

        let mut marks = Vec::with_capacity(ids.len());
        let mut discovered = Vec::new();
        for id in ids {
            match known.get(&id) {
                Some(mark) => marks.push((*mark).clone()),
                None => discovered.push(id),
            }
        }

        let fetched: Vec<Option<BlockDeletionMark>> = stream::iter(discovered)
            .map(|id| async move {
                let path = crate::markers::global_deletion_mark_path(id);
                match read_block_deletion_mark(self.bucket, &path).await {
                    Ok(mark) => Ok(Some(mark)),
                    Err(BlockwardenError::MarkerNotFound(_)) => Ok(None),
                    Err(BlockwardenError::Json(_)) => {
                        warn!(
                            tenant = self.bucket.tenant(),
                            block_id = %id,
                            "skipped corrupted block deletion mark"
                        );
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(META_FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        marks.extend(fetched.into_iter().flatten());
        marks.sort_by_key(|mark| mark.id);
        Ok(marks)
    }
}
