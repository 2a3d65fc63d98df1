//! Block and tenant deletion marks.
//!
//! A block scheduled for deletion carries `<block-id>/deletion-mark.json`.
//! The same mark is also written to `markers/<block-id>-deletion-mark.json` so
//! that all marks of a tenant can be listed without walking every block.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ulid::Ulid;

use crate::bucket::TenantBucket;
use crate::error::{BlockwardenError, Error};
use crate::stats::Counter;
use blockwarden_common::SystemClock;

pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";
pub const MARKERS_DIR: &str = "markers";
pub const TENANT_DELETION_MARK_PATH: &str = "markers/tenant-deletion-mark.json";

const GLOBAL_DELETION_MARK_SUFFIX: &str = "-deletion-mark.json";
const DELETION_MARK_VERSION_1: u32 = 1;

fn deletion_mark_version() -> u32 {
    DELETION_MARK_VERSION_1
}

/// Schedules a block for deletion once `deletion_time` is older than the
/// configured deletion delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeletionMark {
    pub id: Ulid,
    /// Unix seconds.
    pub deletion_time: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default = "deletion_mark_version")]
    pub version: u32,
}

impl BlockDeletionMark {
    pub fn new(id: Ulid, deletion_time: DateTime<Utc>, details: &str) -> Self {
        Self {
            id,
            deletion_time: deletion_time.timestamp(),
            details: details.to_string(),
            version: DELETION_MARK_VERSION_1,
        }
    }

    pub fn deletion_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.deletion_time, 0).unwrap_or_default()
    }
}

/// Requests the removal of every object of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDeletionMark {
    /// Unix seconds.
    pub deletion_time: i64,
    /// Unix seconds at which all blocks were found deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_time: Option<i64>,
}

impl TenantDeletionMark {
    pub fn new(deletion_time: DateTime<Utc>) -> Self {
        Self {
            deletion_time: deletion_time.timestamp(),
            finished_time: None,
        }
    }

    pub fn finished_time(&self) -> Option<DateTime<Utc>> {
        self.finished_time
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

pub(crate) fn block_deletion_mark_path(id: Ulid) -> String {
    format!("{}/{}", id, DELETION_MARK_FILENAME)
}

pub(crate) fn global_deletion_mark_path(id: Ulid) -> String {
    format!("{}/{}{}", MARKERS_DIR, id, GLOBAL_DELETION_MARK_SUFFIX)
}

/// Returns the block id of a global marker object name, e.g.
/// `01H...-deletion-mark.json`.
pub(crate) fn parse_global_deletion_mark(filename: &str) -> Option<Ulid> {
    filename
        .strip_suffix(GLOBAL_DELETION_MARK_SUFFIX)
        .and_then(|id| Ulid::from_string(id).ok())
}

pub(crate) async fn read_block_deletion_mark(
    bucket: &TenantBucket,
    rel: &str,
) -> Result<BlockDeletionMark, BlockwardenError> {
    let bytes = match bucket.get(rel).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => {
            return Err(BlockwardenError::MarkerNotFound(rel.to_string()))
        }
        Err(e) => return Err(e),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

/// Writes the deletion mark of a block and its global copy. An existing mark
/// is left untouched, but its global copy is restored when missing.
pub(crate) async fn mark_for_deletion(
    bucket: &TenantBucket,
    id: Ulid,
    details: &str,
    now: DateTime<Utc>,
    marked: &Counter,
) -> Result<(), BlockwardenError> {
    let local = block_deletion_mark_path(id);
    let global = global_deletion_mark_path(id);
    match bucket.get(&local).await {
        Ok(existing) => {
            warn!(
                tenant = bucket.tenant(),
                block_id = %id,
                "requested to mark block for deletion, but a deletion mark already exists"
            );
            if !bucket.exists(&global).await? {
                info!(
                    tenant = bucket.tenant(),
                    block_id = %id,
                    "restoring missing global deletion mark"
                );
                bucket.put(&global, existing).await?;
            }
            return Ok(());
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let mark = BlockDeletionMark::new(id, now, details);
    let data = Bytes::from(serde_json::to_vec(&mark)?);
    bucket.put(&local, data.clone()).await?;
    bucket.put(&global, data).await?;
    marked.inc();
    Ok(())
}

pub(crate) async fn read_tenant_deletion_mark(
    bucket: &TenantBucket,
) -> Result<Option<TenantDeletionMark>, BlockwardenError> {
    match bucket.get(TENANT_DELETION_MARK_PATH).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) async fn write_tenant_deletion_mark(
    bucket: &TenantBucket,
    mark: &TenantDeletionMark,
) -> Result<(), BlockwardenError> {
    let data = Bytes::from(serde_json::to_vec(mark)?);
    bucket.put(TENANT_DELETION_MARK_PATH, data).await
}

/// Requests the deletion of every block of `tenant`. The blocks cleaner owning
/// the tenant carries it out.
pub async fn mark_tenant_for_deletion(
    bucket: &TenantBucket,
    clock: &dyn SystemClock,
) -> Result<(), Error> {
    if read_tenant_deletion_mark(bucket).await?.is_some() {
        return Ok(());
    }
    write_tenant_deletion_mark(bucket, &TenantDeletionMark::new(clock.now())).await?;
    Ok(())
}
