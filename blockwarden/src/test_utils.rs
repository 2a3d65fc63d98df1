use bytes::Bytes;
use ulid::Ulid;

use crate::block::{BlockFile, BlockMeta, META_FILENAME};
use crate::bucket::TenantBucket;

/// Id whose timestamp part and random part are both `seq`.
pub(crate) fn block_id(seq: u64) -> Ulid {
    Ulid::from_parts(seq, u128::from(seq))
}

/// Uploads a complete block: one data file, then `meta.json`.
pub(crate) async fn put_block(
    bucket: &TenantBucket,
    seq: u64,
    min_time: i64,
    max_time: i64,
) -> BlockMeta {
    let mut meta = BlockMeta::new(block_id(seq), min_time, max_time);
    meta.files.push(BlockFile {
        rel_path: "profiles.parquet".to_string(),
        size_bytes: 4,
    });
    put_block_meta(bucket, &meta).await;
    meta
}

/// Uploads the data file of `meta` and the metadata itself.
pub(crate) async fn put_block_meta(bucket: &TenantBucket, meta: &BlockMeta) {
    bucket
        .put(
            &format!("{}/profiles.parquet", meta.id),
            Bytes::from_static(b"data"),
        )
        .await
        .expect("failed to upload block data");
    bucket
        .put(
            &format!("{}/{}", meta.id, META_FILENAME),
            Bytes::from(serde_json::to_vec(meta).expect("failed to encode block meta")),
        )
        .await
        .expect("failed to upload block meta");
}

/// Uploads a block directory without `meta.json`.
pub(crate) async fn put_partial_block(bucket: &TenantBucket, seq: u64) -> Ulid {
    let id = block_id(seq);
    bucket
        .put(&format!("{}/profiles.parquet", id), Bytes::from_static(b"data"))
        .await
        .expect("failed to upload partial block");
    id
}
