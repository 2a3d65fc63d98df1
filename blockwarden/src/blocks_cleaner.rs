//! # Blocks cleaner
//!
//! Each instance periodically cleans up the tenants it owns (see
//! [ShardingStrategy::blocks_cleaner_owns_tenant]). For every tenant a
//! cleanup:
//!
//! 1. reads the bucket index, rebuilding it from scratch when missing or
//!    corrupted,
//! 2. marks blocks past the tenant's retention period for deletion,
//! 3. refreshes the index from the bucket,
//! 4. deletes blocks whose deletion mark is older than the deletion delay,
//! 5. deletes partial blocks carrying a deletion mark, and marks stale partial
//!    blocks for deletion,
//! 6. writes the index back, or deletes it when the tenant has no blocks left
//!    and `no_blocks_file_cleanup_enabled` is set.
//!
//! Tenants carrying a tenant deletion mark have all their blocks deleted
//! instead.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use futures::{future, stream, StreamExt};
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::blocks_cleaner::stats::{CleanerStats, TenantBlockStats};
use crate::bucket::{delete_block, TenantBucket};
use crate::bucket_index::{self, BucketIndex, Updater};
use crate::concurrency::LimitedConcurrencySingleFlight;
use crate::config::{BlocksCleanerOptions, TenantConfigProvider};
use crate::error::{BlockwardenError, Error};
use crate::markers::{
    block_deletion_mark_path, mark_for_deletion, read_block_deletion_mark,
    read_tenant_deletion_mark, write_tenant_deletion_mark, MARKERS_DIR,
};
use crate::sharding_strategy::ShardingStrategy;
use crate::stats::StatRegistry;
use crate::tenants::{ScannedTenants, TenantsScanner};
use blockwarden_common::SystemClock;

pub mod stats;

const RETENTION_DETAILS: &str = "block exceeding retention period";
const STALE_PARTIAL_DETAILS: &str = "stale partial block";

pub struct BlocksCleaner {
    options: BlocksCleanerOptions,
    store: Arc<dyn ObjectStore>,
    sharding: Arc<dyn ShardingStrategy>,
    limits: Arc<dyn TenantConfigProvider>,
    clock: Arc<dyn SystemClock>,
    stats: Arc<CleanerStats>,
    single_flight: LimitedConcurrencySingleFlight,
}

impl BlocksCleaner {
    pub fn new(
        options: BlocksCleanerOptions,
        store: Arc<dyn ObjectStore>,
        sharding: Arc<dyn ShardingStrategy>,
        limits: Arc<dyn TenantConfigProvider>,
        clock: Arc<dyn SystemClock>,
        stat_registry: Arc<StatRegistry>,
    ) -> Self {
        let single_flight = LimitedConcurrencySingleFlight::new(options.cleanup_concurrency);
        Self {
            options,
            store,
            sharding,
            limits,
            clock,
            stats: Arc::new(CleanerStats::new(stat_registry)),
            single_flight,
        }
    }

    pub fn stats(&self) -> Arc<CleanerStats> {
        self.stats.clone()
    }

    /// Runs a cleanup right away, then every `cleanup_interval`, until the
    /// token is cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            "starting blocks cleaner [cleanup_interval={:?}, cleanup_concurrency={}, deletion_delay={:?}]",
            self.options.cleanup_interval,
            self.options.cleanup_concurrency,
            self.options.deletion_delay
        );
        let mut ticker = self.clock.ticker(self.options.cleanup_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("blocks cleaner received shutdown signal... shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cleanup(&cancellation_token).await {
                        if !e.is_canceled() {
                            warn!(error = %e, "blocks cleanup failed, retrying on next tick");
                        }
                    }
                }
            }
        }
        self.single_flight.wait().await;
    }

    /// Cleans up every owned tenant once.
    pub async fn run_cleanup(&self, cancellation_token: &CancellationToken) -> Result<(), Error> {
        self.stats.runs_started.inc();
        info!("started blocks cleanup and maintenance");

        let result = match self.refresh_owned_tenants().await {
            Ok(scanned) => self.cleanup_tenants(scanned, cancellation_token).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                self.stats.runs_completed.inc();
                self.stats
                    .last_run_successful_timestamp
                    .set(self.clock.now().timestamp());
                info!("successfully completed blocks cleanup and maintenance");
            }
            Err(_) if cancellation_token.is_cancelled() => {
                info!("canceled blocks cleanup and maintenance");
            }
            Err(e) => {
                self.stats.runs_failed.inc();
                warn!(error = %e, "failed to run blocks cleanup and maintenance");
            }
        }
        result
    }

    async fn refresh_owned_tenants(&self) -> Result<ScannedTenants, Error> {
        let sharding = self.sharding.clone();
        let scanner = TenantsScanner::new(
            self.store.clone(),
            Arc::new(move |tenant: &str| sharding.blocks_cleaner_owns_tenant(tenant)),
        );
        let scanned = (|| async { scanner.scan().await })
            .retry(discovery_retry_builder())
            .notify(|err: &BlockwardenError, duration: Duration| {
                warn!(error = %err, "retrying tenant discovery [duration={:?}]", duration);
            })
            .await?;

        let owned: HashSet<String> = scanned
            .active
            .iter()
            .chain(scanned.deleted.iter())
            .cloned()
            .collect();
        self.stats.retain_tenants(&owned);
        Ok(scanned)
    }

    async fn cleanup_tenants(
        &self,
        scanned: ScannedTenants,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Error> {
        let deleted: HashSet<String> = scanned.deleted.iter().cloned().collect();
        let mut tenants = scanned.active;
        tenants.extend(scanned.deleted);

        let deleted = &deleted;
        let this = self;
        this.single_flight
            .for_each_not_in_flight(tenants, move |tenant| async move {
                if cancellation_token.is_cancelled() {
                    return Err(BlockwardenError::Canceled.into());
                }
                // ownership may have moved since the scan
                match this.sharding.blocks_cleaner_owns_tenant(&tenant) {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(e) => {
                        warn!(tenant = %tenant, error = %e, "unable to check tenant ownership, skipping");
                        return Ok(());
                    }
                }
                let result = if deleted.contains(&tenant) {
                    this.delete_tenant_marked_for_deletion(&tenant, cancellation_token)
                        .await
                } else {
                    this.cleanup_tenant(&tenant, cancellation_token).await
                };
                result.map_err(|e| {
                    if !e.is_canceled() {
                        warn!(tenant = %tenant, error = %e, "failed to clean up tenant");
                    }
                    Error::from(e)
                })
            })
            .await
    }

    async fn cleanup_tenant(
        &self,
        tenant: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<(), BlockwardenError> {
        let bucket = TenantBucket::new(self.store.clone(), tenant);
        let started = self.clock.now();
        info!(tenant, "started blocks cleanup and maintenance for tenant");

        let old = match bucket_index::read(&bucket).await {
            Ok(index) => Some(index),
            Err(BlockwardenError::IndexNotFound(_)) => None,
            Err(BlockwardenError::IndexCorrupted(_)) => {
                warn!(tenant, "found a corrupted bucket index, recreating it");
                None
            }
            Err(e) => return Err(e),
        };

        // applied before refreshing the index so that new marks are picked up
        // right away
        if let Some(old) = &old {
            self.apply_retention(&bucket, old).await;
        }
        check_canceled(cancellation_token)?;

        let (mut index, mut partials) = Updater::new(&bucket)
            .update_index(old.as_ref(), self.clock.now())
            .await?;
        check_canceled(cancellation_token)?;

        self.delete_blocks_marked_for_deletion(&bucket, &mut index, cancellation_token)
            .await;
        check_canceled(cancellation_token)?;

        if !partials.is_empty() {
            let cutoff = self.partial_deletion_cutoff(tenant);
            self.cleanup_partial_blocks(&bucket, &mut partials, &mut index, cutoff, cancellation_token)
                .await;
        }
        check_canceled(cancellation_token)?;

        let index_last_updated = if self.options.no_blocks_file_cleanup_enabled && index.blocks.is_empty() {
            self.delete_remaining_data(&bucket).await?;
            0
        } else {
            bucket_index::write(&bucket, &index).await?;
            index.updated_at
        };

        let mut by_level = BTreeMap::new();
        for meta in &index.blocks {
            *by_level.entry(meta.compaction_level).or_insert(0) += 1;
        }
        self.stats.set_tenant(
            tenant,
            TenantBlockStats {
                blocks: index.blocks.len() as u64,
                blocks_by_compaction_level: by_level,
                blocks_marked_for_deletion: index.block_deletion_marks.len() as u64,
                partial_blocks: partials.len() as u64,
                index_last_updated,
            },
        );
        info!(
            tenant,
            "completed blocks cleanup and maintenance for tenant [duration={:?}]",
            (self.clock.now() - started).to_std().unwrap_or_default()
        );
        Ok(())
    }

    /// Marks blocks past the retention period. Failures are logged and retried
    /// on the next cleanup.
    async fn apply_retention(&self, bucket: &TenantBucket, index: &BucketIndex) {
        let retention = self.limits.retention_period(bucket.tenant());
        if retention.is_zero() {
            return;
        }
        let now = self.clock.now();
        for id in blocks_outside_retention(index, now, retention) {
            info!(
                tenant = bucket.tenant(),
                block_id = %id,
                "applied retention: marking block for deletion"
            );
            if let Err(e) = mark_for_deletion(
                bucket,
                id,
                RETENTION_DETAILS,
                now,
                &self.stats.blocks_marked_for_deletion,
            )
            .await
            {
                warn!(
                    tenant = bucket.tenant(),
                    block_id = %id,
                    error = %e,
                    "failed to mark block for deletion"
                );
            }
        }
    }

    async fn delete_blocks_marked_for_deletion(
        &self,
        bucket: &TenantBucket,
        index: &mut BucketIndex,
        cancellation_token: &CancellationToken,
    ) {
        let now = self.clock.now().timestamp();
        let delay = self.options.deletion_delay.as_secs() as i64;
        let to_delete: Vec<Ulid> = index
            .block_deletion_marks
            .iter()
            .filter(|mark| now - mark.deletion_time > delay)
            .map(|mark| mark.id)
            .collect();

        let deleted = self
            .delete_blocks(bucket, to_delete, cancellation_token, "deleted block marked for deletion")
            .await;
        for id in deleted {
            index.remove_block(id);
        }
    }

    /// Deletes blocks concurrently and returns the ids that were deleted. A
    /// block failing to delete is counted and left for the next cleanup.
    async fn delete_blocks(
        &self,
        bucket: &TenantBucket,
        ids: Vec<Ulid>,
        cancellation_token: &CancellationToken,
        message: &'static str,
    ) -> Vec<Ulid> {
        stream::iter(ids)
            .map(|id| async move {
                if cancellation_token.is_cancelled() {
                    return None;
                }
                match delete_block(bucket, id).await {
                    Ok(()) => {
                        self.stats.blocks_cleaned.inc();
                        info!(tenant = bucket.tenant(), block_id = %id, "{}", message);
                        Some(id)
                    }
                    Err(e) => {
                        self.stats.blocks_failed.inc();
                        warn!(
                            tenant = bucket.tenant(),
                            block_id = %id,
                            error = %e,
                            "failed to delete block"
                        );
                        None
                    }
                }
            })
            .buffer_unordered(self.options.delete_blocks_concurrency.max(1))
            .filter_map(future::ready)
            .collect()
            .await
    }

    fn partial_deletion_cutoff(&self, tenant: &str) -> Option<DateTime<Utc>> {
        let (delay, valid) = self.limits.partial_block_deletion_delay(tenant);
        if !valid {
            warn!(
                tenant,
                "partial blocks deletion has been disabled for tenant because the delay has been set lower than the minimum value allowed [minimum={:?}]",
                crate::config::MIN_PARTIAL_BLOCK_DELETION_DELAY
            );
            return None;
        }
        if delay.is_zero() {
            return None;
        }
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.clock.now().checked_sub_signed(delay))
    }

    /// Deletes partial blocks carrying a deletion mark and marks the ones
    /// untouched since `cutoff`. Deleted blocks leave `partials` and `index`.
    /// Blocks with a corrupted `meta.json` are left alone.
    async fn cleanup_partial_blocks(
        &self,
        bucket: &TenantBucket,
        partials: &mut BTreeMap<Ulid, BlockwardenError>,
        index: &mut BucketIndex,
        cutoff: Option<DateTime<Utc>>,
        cancellation_token: &CancellationToken,
    ) {
        let ids: Vec<Ulid> = partials
            .iter()
            .filter(|(_, e)| matches!(e, BlockwardenError::BlockMetaNotFound(_)))
            .map(|(id, _)| *id)
            .collect();
        let marked: Vec<Ulid> = stream::iter(ids)
            .map(|id| async move {
                if cancellation_token.is_cancelled() {
                    return None;
                }
                match read_block_deletion_mark(bucket, &block_deletion_mark_path(id)).await {
                    Ok(_) => Some(id),
                    Err(BlockwardenError::MarkerNotFound(_)) => {
                        if let Some(cutoff) = cutoff {
                            self.mark_stale_partial_block(bucket, id, cutoff).await;
                        }
                        None
                    }
                    Err(e) => {
                        warn!(
                            tenant = bucket.tenant(),
                            block_id = %id,
                            error = %e,
                            "error reading partial block deletion mark"
                        );
                        None
                    }
                }
            })
            .buffer_unordered(self.options.delete_blocks_concurrency.max(1))
            .filter_map(future::ready)
            .collect()
            .await;
        if cancellation_token.is_cancelled() {
            return;
        }

        let deleted = self
            .delete_blocks(bucket, marked, cancellation_token, "deleted partial block marked for deletion")
            .await;
        for id in deleted {
            index.remove_block(id);
            partials.remove(&id);
        }
    }

    async fn mark_stale_partial_block(&self, bucket: &TenantBucket, id: Ulid, cutoff: DateTime<Utc>) {
        let last_modified = match bucket.stale_partial_block_last_modified(id, cutoff).await {
            Ok(Some(last_modified)) => last_modified,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    tenant = bucket.tenant(),
                    block_id = %id,
                    error = %e,
                    "failed while determining if partial block should be marked for deletion"
                );
                return;
            }
        };
        info!(
            tenant = bucket.tenant(),
            block_id = %id,
            last_modified = %last_modified,
            "stale partial block found: marking block for deletion"
        );
        if let Err(e) = mark_for_deletion(
            bucket,
            id,
            STALE_PARTIAL_DETAILS,
            self.clock.now(),
            &self.stats.blocks_marked_for_deletion,
        )
        .await
        {
            warn!(
                tenant = bucket.tenant(),
                block_id = %id,
                error = %e,
                "failed to mark partial block for deletion"
            );
        }
    }

    async fn delete_remaining_data(&self, bucket: &TenantBucket) -> Result<(), BlockwardenError> {
        bucket_index::delete(bucket).await?;
        info!(tenant = bucket.tenant(), "deleted bucket index for tenant with no blocks remaining");
        let deleted = bucket.delete_prefix(MARKERS_DIR).await?;
        if deleted > 0 {
            info!(
                tenant = bucket.tenant(),
                count = deleted,
                "deleted marker files for tenant with no blocks remaining"
            );
        }
        Ok(())
    }

    async fn delete_tenant_marked_for_deletion(
        &self,
        tenant: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<(), BlockwardenError> {
        let bucket = TenantBucket::new(self.store.clone(), tenant);

        // readers see "no blocks" as soon as the index is gone
        bucket_index::delete(&bucket).await?;

        let mut deleted_blocks = 0usize;
        let mut failed = 0usize;
        for id in bucket.list_block_ids().await? {
            check_canceled(cancellation_token)?;
            match delete_block(&bucket, id).await {
                Ok(()) => {
                    deleted_blocks += 1;
                    self.stats.blocks_cleaned.inc();
                    info!(tenant, block_id = %id, "deleted block");
                }
                Err(e) => {
                    failed += 1;
                    self.stats.blocks_failed.inc();
                    warn!(tenant, block_id = %id, error = %e, "failed to delete block");
                }
            }
        }

        if failed > 0 {
            // the next run retries the blocks left, so they all count as marked
            self.stats.set_tenant(
                tenant,
                TenantBlockStats {
                    blocks: failed as u64,
                    blocks_marked_for_deletion: failed as u64,
                    ..Default::default()
                },
            );
            return Err(BlockwardenError::DeleteBlocksFailed(failed));
        }
        self.stats.remove_tenant(tenant);
        if deleted_blocks > 0 {
            info!(
                tenant,
                deleted_blocks, "deleted blocks for tenant marked for deletion"
            );
        }

        let Some(mut mark) = read_tenant_deletion_mark(&bucket).await? else {
            return Err(BlockwardenError::TenantDeletionMarkMissing(tenant.to_string()));
        };

        let now = self.clock.now();
        if deleted_blocks > 0 || mark.finished_time.is_none() {
            debug!(tenant, "updating finished time in tenant deletion mark");
            mark.finished_time = Some(now.timestamp());
            return write_tenant_deletion_mark(&bucket, &mark).await;
        }

        let finished = mark.finished_time.unwrap_or_default();
        if now.timestamp() - finished < self.options.tenant_cleanup_delay.as_secs() as i64 {
            return Ok(());
        }

        info!(tenant, "cleaning up remaining data for tenant marked for deletion");
        let deleted = bucket.delete_prefix(MARKERS_DIR).await?;
        if deleted > 0 {
            info!(
                tenant,
                count = deleted,
                "deleted marker files for tenant marked for deletion"
            );
        }
        Ok(())
    }
}

fn discovery_retry_builder() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(3)
}

fn check_canceled(cancellation_token: &CancellationToken) -> Result<(), BlockwardenError> {
    if cancellation_token.is_cancelled() {
        return Err(BlockwardenError::Canceled);
    }
    Ok(())
}

/// Ids of unmarked blocks whose data ends before `now - retention`.
fn blocks_outside_retention(index: &BucketIndex, now: DateTime<Utc>, retention: Duration) -> Vec<Ulid> {
    let threshold = now
        .timestamp_millis()
        .saturating_sub(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX));
    let marked = index.marked_block_ids();
    index
        .blocks
        .iter()
        .filter(|meta| meta.max_time < threshold && !marked.contains(&meta.id))
        .map(|meta| meta.id)
        .collect()
}
