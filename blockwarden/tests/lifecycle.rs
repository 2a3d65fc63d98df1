use std::sync::Arc;

use blockwarden::block::BlockMeta;
use blockwarden::bucket::TenantBucket;
use blockwarden::bucket_index::read_index;
use blockwarden::config::{BlocksCleanerOptions, CompactorOptions, TenantLimits};
use blockwarden::job::Job;
use blockwarden::object_store::memory::InMemory;
use blockwarden::object_store::path::Path;
use blockwarden::object_store::{ObjectStore, PutPayload};
use blockwarden::ring::{ReadRing, TokenRing};
use blockwarden::sharding_strategy::{ShardingStrategy, SplitAndMergeShardingStrategy};
use blockwarden::stats::StatRegistry;
use blockwarden::tenants::AllowedTenants;
use blockwarden::{BlockCompactor, BlocksCleaner, Compactor, Error};
use blockwarden_common::MockSystemClock;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

const TENANT: &str = "tenant-1";
const HOUR_MS: i64 = 3_600_000;
const NOW_MS: i64 = 1_700_000_000_000;

async fn put_meta(store: &Arc<dyn ObjectStore>, meta: &BlockMeta) {
    let path = Path::from(format!("{}/{}/meta.json", TENANT, meta.id));
    let json = serde_json::to_vec(meta).unwrap();
    store.put(&path, PutPayload::from(json)).await.unwrap();
}

/// Merges the job's blocks into a single block covering the same range.
struct MergingBlockCompactor {
    store: Arc<dyn ObjectStore>,
}

#[async_trait::async_trait]
impl BlockCompactor for MergingBlockCompactor {
    async fn compact_with_splitting(
        &self,
        job: &Job,
        _shard_count: u32,
        _split_stage_size: u32,
    ) -> Result<Vec<Ulid>, Error> {
        let mut meta = BlockMeta::new(Ulid::from_parts(100, 100), job.min_time(), job.max_time());
        meta.compaction_level = job.min_compaction_level() + 1;
        meta.sources = job.metas().iter().flat_map(|m| m.sources.clone()).collect();
        put_meta(&self.store, &meta).await;
        Ok(vec![meta.id])
    }
}

#[tokio::test]
async fn test_compacted_sources_are_deleted_after_deletion_delay() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let clock = Arc::new(MockSystemClock::with_time(NOW_MS));
    let first = BlockMeta::new(Ulid::from_parts(1, 1), 0, HOUR_MS);
    let second = BlockMeta::new(Ulid::from_parts(2, 2), HOUR_MS, 2 * HOUR_MS);
    put_meta(&store, &first).await;
    put_meta(&store, &second).await;

    let ring: Arc<dyn ReadRing> = Arc::new(TokenRing::single("compactor-1", "127.0.0.1:9095"));
    let limits = Arc::new(TenantLimits::default());
    let sharding: Arc<dyn ShardingStrategy> = Arc::new(SplitAndMergeShardingStrategy::new(
        AllowedTenants::default(),
        ring,
        "compactor-1",
        "127.0.0.1:9095",
        limits.clone(),
    ));
    let registry = Arc::new(StatRegistry::new());

    let compactor = Compactor::new(
        CompactorOptions::default(),
        store.clone(),
        sharding.clone(),
        limits.clone(),
        Arc::new(MergingBlockCompactor {
            store: store.clone(),
        }),
        clock.clone(),
        registry.clone(),
    )
    .unwrap();
    compactor
        .compact_tenants(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(compactor.stats().jobs_completed.value(), 1);

    let cleaner = BlocksCleaner::new(
        BlocksCleanerOptions::default(),
        store.clone(),
        sharding,
        limits,
        clock.clone(),
        registry.clone(),
    );

    // marks are younger than the deletion delay: the sources stay
    cleaner.run_cleanup(&CancellationToken::new()).await.unwrap();
    let bucket = TenantBucket::new(store.clone(), TENANT);
    let index = read_index(&bucket).await.unwrap();
    assert_eq!(index.blocks.len(), 3);
    assert_eq!(index.block_deletion_marks.len(), 2);

    clock.set(NOW_MS + 13 * HOUR_MS);
    cleaner.run_cleanup(&CancellationToken::new()).await.unwrap();
    let index = read_index(&bucket).await.unwrap();
    let ids: Vec<Ulid> = index.blocks.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![Ulid::from_parts(100, 100)]);
    assert!(index.block_deletion_marks.is_empty());

    for source in [first.id, second.id] {
        let path = Path::from(format!("{}/{}/meta.json", TENANT, source));
        assert!(store.head(&path).await.is_err());
    }
    assert_eq!(cleaner.stats().blocks_cleaned.value(), 2);
    assert!(registry.lookup("compactor/jobs_completed").is_some());
    assert!(registry.lookup("blocks_cleaner/blocks_cleaned").is_some());

    // nothing left to compact
    compactor
        .compact_tenants(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(compactor.stats().jobs_completed.value(), 1);
}
