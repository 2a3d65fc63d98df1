//! Access to a single tenant's objects.
//!
//! Every object of a tenant lives under `<tenant>/`. Block directories are
//! named after the block id; the `markers/` directory holds a flat copy of all
//! block deletion marks plus the tenant deletion mark.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, warn};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use ulid::Ulid;

use crate::block::{parse_block_dir, META_FILENAME};
use crate::error::BlockwardenError;
use crate::markers::{
    block_deletion_mark_path, global_deletion_mark_path, DELETION_MARK_FILENAME,
};

#[derive(Clone, Debug)]
pub struct TenantBucket {
    store: Arc<dyn ObjectStore>,
    tenant: String,
}

impl TenantBucket {
    pub fn new(store: Arc<dyn ObjectStore>, tenant: &str) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub(crate) fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Full object path of `rel`, a `/`-separated path relative to the tenant.
    pub(crate) fn path(&self, rel: &str) -> Path {
        Path::from(format!("{}/{}", self.tenant, rel))
    }

    fn root(&self) -> Path {
        Path::from(self.tenant.as_str())
    }

    pub(crate) async fn get(&self, rel: &str) -> Result<Bytes, BlockwardenError> {
        let result = self.store.get(&self.path(rel)).await?;
        Ok(result.bytes().await?)
    }

    pub(crate) async fn put(&self, rel: &str, data: Bytes) -> Result<(), BlockwardenError> {
        self.store
            .put(&self.path(rel), PutPayload::from_bytes(data))
            .await?;
        Ok(())
    }

    pub(crate) async fn exists(&self, rel: &str) -> Result<bool, BlockwardenError> {
        match self.store.head(&self.path(rel)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes an object. A missing object is not an error.
    pub(crate) async fn delete(&self, rel: &str) -> Result<(), BlockwardenError> {
        match self.store.delete(&self.path(rel)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all block directories of the tenant, whether complete or not.
    pub(crate) async fn list_block_ids(&self) -> Result<Vec<Ulid>, BlockwardenError> {
        let listing = self.store.list_with_delimiter(Some(&self.root())).await?;
        let mut ids: Vec<Ulid> = listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| prefix.filename().and_then(parse_block_dir))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// All objects under `rel`, recursively.
    pub(crate) async fn list_objects(&self, rel: &str) -> Result<Vec<ObjectMeta>, BlockwardenError> {
        let prefix = self.path(rel);
        let mut stream = self.store.list(Some(&prefix));
        let mut objects = Vec::new();
        while let Some(meta) = stream.next().await {
            objects.push(meta?);
        }
        Ok(objects)
    }

    /// Deletes every object under `rel`. Returns the number of deleted objects.
    pub(crate) async fn delete_prefix(&self, rel: &str) -> Result<usize, BlockwardenError> {
        let objects = self.list_objects(rel).await?;
        for object in &objects {
            match self.store.delete(&object.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(objects.len())
    }

    /// Returns the most recent modification time of the objects of a partial
    /// block, or `None` if any of them was modified after `cutoff` or the
    /// block has no objects. Stops listing at the first recent object.
    pub(crate) async fn stale_partial_block_last_modified(
        &self,
        id: Ulid,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BlockwardenError> {
        let prefix = self.path(&id.to_string());
        let mut stream = self.store.list(Some(&prefix));
        let mut last_modified: Option<DateTime<Utc>> = None;
        while let Some(meta) = stream.next().await {
            let meta = meta?;
            if meta.last_modified > cutoff {
                return Ok(None);
            }
            last_modified = last_modified.max(Some(meta.last_modified));
        }
        Ok(last_modified)
    }
}

/// Deletes a block: its `meta.json` first, so that readers see it as partial,
/// then its other files, then its deletion mark, then the global marker.
pub(crate) async fn delete_block(bucket: &TenantBucket, id: Ulid) -> Result<(), BlockwardenError> {
    let meta_file = format!("{}/{}", id, META_FILENAME);
    let deletion_mark_file = block_deletion_mark_path(id);

    if bucket.exists(&meta_file).await? {
        bucket.delete(&meta_file).await?;
        debug!(
            "deleted block meta [tenant={}, block_id={}]",
            bucket.tenant(),
            id
        );
    }

    for object in bucket.list_objects(&id.to_string()).await? {
        let name = object.location.filename().unwrap_or_default();
        if name == META_FILENAME || name == DELETION_MARK_FILENAME {
            continue;
        }
        match bucket.store().delete(&object.location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => {
                warn!(
                    "failed to delete block object [tenant={}, block_id={}, location={}]",
                    bucket.tenant(),
                    id,
                    object.location
                );
                return Err(e.into());
            }
        }
    }

    bucket.delete(&deletion_mark_file).await?;
    bucket.delete(&global_deletion_mark_path(id)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{put_block, put_partial_block};
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_list_block_ids_ignores_other_entries() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let bucket = TenantBucket::new(store.clone(), "tenant-a");
        let complete = put_block(&bucket, 1, 0, 10).await;
        let partial = put_partial_block(&bucket, 2).await;
        bucket
            .put("markers/tenant-deletion-mark.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        bucket
            .put("bucket-index.json.gz", Bytes::from_static(b""))
            .await
            .unwrap();

        let mut expected = vec![complete.id, partial];
        expected.sort();
        assert_eq!(bucket.list_block_ids().await.unwrap(), expected);

        let other = TenantBucket::new(store, "tenant-b");
        assert!(other.list_block_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_block_removes_every_object() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let bucket = TenantBucket::new(store, "tenant-a");
        let meta = put_block(&bucket, 1, 0, 10).await;
        let kept = put_block(&bucket, 2, 10, 20).await;
        bucket
            .put(&block_deletion_mark_path(meta.id), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        bucket
            .put(&global_deletion_mark_path(meta.id), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        delete_block(&bucket, meta.id).await.unwrap();

        assert!(bucket.list_objects(&meta.id.to_string()).await.unwrap().is_empty());
        assert!(!bucket.exists(&global_deletion_mark_path(meta.id)).await.unwrap());
        assert_eq!(bucket.list_block_ids().await.unwrap(), vec![kept.id]);
    }

    #[tokio::test]
    async fn test_delete_missing_block_is_ok() {
        let bucket = TenantBucket::new(Arc::new(InMemory::new()), "tenant-a");
        delete_block(&bucket, Ulid::from_parts(1, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_partial_block_last_modified() {
        let bucket = TenantBucket::new(Arc::new(InMemory::new()), "tenant-a");
        let id = put_partial_block(&bucket, 1).await;
        let now = Utc::now();

        let past = now - chrono::Duration::hours(1);
        assert_eq!(
            bucket.stale_partial_block_last_modified(id, past).await.unwrap(),
            None
        );

        let future = now + chrono::Duration::hours(1);
        let last_modified = bucket
            .stale_partial_block_last_modified(id, future)
            .await
            .unwrap()
            .unwrap();
        assert!(last_modified <= future);

        let missing = Ulid::from_parts(9, 9);
        assert_eq!(
            bucket
                .stale_partial_block_last_modified(missing, future)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_delete_prefix_counts_objects() {
        let bucket = TenantBucket::new(Arc::new(InMemory::new()), "tenant-a");
        bucket.put("markers/a", Bytes::from_static(b"a")).await.unwrap();
        bucket.put("markers/b", Bytes::from_static(b"b")).await.unwrap();
        bucket.put("other", Bytes::from_static(b"c")).await.unwrap();

        assert_eq!(bucket.delete_prefix("markers").await.unwrap(), 2);
        assert!(bucket.exists("other").await.unwrap());
        assert!(!bucket.exists("markers/a").await.unwrap());
    }
}
