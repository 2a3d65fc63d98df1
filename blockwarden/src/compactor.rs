//! # Compactor
//!
//! The compactor periodically discovers the tenants it owns and compacts each
//! of them in turn. Compacting a tenant repeats until a pass runs no job:
//!
//! 1. refresh the tenant's block list from the bucket,
//! 2. drop blocks marked for deletion and blocks whose data is already
//!    included in another block,
//! 3. group the remaining blocks into split and merge jobs,
//! 4. keep the jobs this instance owns whose level-1 blocks are older than
//!    `compaction_wait_period`, in `jobs_order`,
//! 5. run every job through the [BlockCompactor] and mark its source blocks
//!    for deletion.
//!
//! The compactor never writes the bucket index; the blocks cleaner owning the
//! tenant does.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::block::BlockMeta;
use crate::bucket::TenantBucket;
use crate::bucket_index::{self, BucketIndex, Updater};
use crate::compactor::stats::CompactorStats;
use crate::config::{CompactorOptions, TenantConfigProvider};
use crate::dedup_filter::ShardAwareDeduplicateFilter;
use crate::error::{BlockwardenError, Error};
use crate::grouper::{Grouper, SplitAndMergeGrouper};
use crate::job::Job;
use crate::markers::{mark_for_deletion, read_tenant_deletion_mark};
use crate::planner::{Planner, SplitAndMergePlanner};
use crate::sharding_strategy::ShardingStrategy;
use crate::stats::StatRegistry;
use crate::tenants::TenantsScanner;
use blockwarden_common::SystemClock;

const SOURCE_BLOCK_DETAILS: &str = "source of compacted block";

/// Executes a compaction job: reads the job's blocks, writes the compacted
/// blocks to the tenant's bucket and returns their ids.
#[async_trait::async_trait]
pub trait BlockCompactor: Send + Sync {
    /// With a `shard_count` above one, the output is split into that many
    /// blocks, each labeled with its shard id. `split_stage_size` bounds how
    /// many shards are produced per stage; zero means all at once.
    async fn compact_with_splitting(
        &self,
        job: &Job,
        shard_count: u32,
        split_stage_size: u32,
    ) -> Result<Vec<Ulid>, Error>;
}

pub mod stats {
    use std::sync::Arc;

    use crate::stats::{Counter, Gauge, StatRegistry};

    macro_rules! compactor_stat_name {
        ($suffix:expr) => {
            crate::stat_name!("compactor", $suffix)
        };
    }

    pub const RUNS_STARTED: &str = compactor_stat_name!("runs_started");
    pub const RUNS_COMPLETED: &str = compactor_stat_name!("runs_completed");
    pub const RUNS_FAILED: &str = compactor_stat_name!("runs_failed");
    pub const LAST_RUN_SUCCESSFUL_TIMESTAMP: &str =
        compactor_stat_name!("last_run_successful_timestamp");
    pub const TENANTS_DISCOVERED: &str = compactor_stat_name!("tenants_discovered");
    pub const TENANTS_SKIPPED: &str = compactor_stat_name!("tenants_skipped");
    pub const TENANTS_SUCCEEDED: &str = compactor_stat_name!("tenants_succeeded");
    pub const TENANTS_FAILED: &str = compactor_stat_name!("tenants_failed");
    pub const RUNNING_JOBS: &str = compactor_stat_name!("running_jobs");
    pub const JOBS_COMPLETED: &str = compactor_stat_name!("jobs_completed");
    pub const JOBS_FAILED: &str = compactor_stat_name!("jobs_failed");
    pub const BLOCKS_MARKED_FOR_DELETION: &str =
        compactor_stat_name!("blocks_marked_for_deletion");

    pub struct CompactorStats {
        pub runs_started: Arc<Counter>,
        pub runs_completed: Arc<Counter>,
        pub runs_failed: Arc<Counter>,
        pub last_run_successful_timestamp: Arc<Gauge<i64>>,
        pub tenants_discovered: Arc<Gauge<u64>>,
        pub tenants_skipped: Arc<Counter>,
        pub tenants_succeeded: Arc<Counter>,
        pub tenants_failed: Arc<Counter>,
        pub running_jobs: Arc<Gauge<i64>>,
        pub jobs_completed: Arc<Counter>,
        pub jobs_failed: Arc<Counter>,
        pub blocks_marked_for_deletion: Arc<Counter>,
    }

    impl CompactorStats {
        pub fn new(registry: Arc<StatRegistry>) -> Self {
            let stats = Self {
                runs_started: Arc::new(Counter::default()),
                runs_completed: Arc::new(Counter::default()),
                runs_failed: Arc::new(Counter::default()),
                last_run_successful_timestamp: Arc::new(Gauge::default()),
                tenants_discovered: Arc::new(Gauge::default()),
                tenants_skipped: Arc::new(Counter::default()),
                tenants_succeeded: Arc::new(Counter::default()),
                tenants_failed: Arc::new(Counter::default()),
                running_jobs: Arc::new(Gauge::default()),
                jobs_completed: Arc::new(Counter::default()),
                jobs_failed: Arc::new(Counter::default()),
                blocks_marked_for_deletion: Arc::new(Counter::default()),
            };
            registry.register(RUNS_STARTED, stats.runs_started.clone());
            registry.register(RUNS_COMPLETED, stats.runs_completed.clone());
            registry.register(RUNS_FAILED, stats.runs_failed.clone());
            registry.register(
                LAST_RUN_SUCCESSFUL_TIMESTAMP,
                stats.last_run_successful_timestamp.clone(),
            );
            registry.register(TENANTS_DISCOVERED, stats.tenants_discovered.clone());
            registry.register(TENANTS_SKIPPED, stats.tenants_skipped.clone());
            registry.register(TENANTS_SUCCEEDED, stats.tenants_succeeded.clone());
            registry.register(TENANTS_FAILED, stats.tenants_failed.clone());
            registry.register(RUNNING_JOBS, stats.running_jobs.clone());
            registry.register(JOBS_COMPLETED, stats.jobs_completed.clone());
            registry.register(JOBS_FAILED, stats.jobs_failed.clone());
            registry.register(
                BLOCKS_MARKED_FOR_DELETION,
                stats.blocks_marked_for_deletion.clone(),
            );
            stats
        }
    }
}

pub struct Compactor {
    options: CompactorOptions,
    store: Arc<dyn ObjectStore>,
    sharding: Arc<dyn ShardingStrategy>,
    limits: Arc<dyn TenantConfigProvider>,
    block_compactor: Arc<dyn BlockCompactor>,
    planner: SplitAndMergePlanner,
    clock: Arc<dyn SystemClock>,
    stats: Arc<CompactorStats>,
}

impl Compactor {
    /// Fails if the configured block ranges are invalid.
    pub fn new(
        options: CompactorOptions,
        store: Arc<dyn ObjectStore>,
        sharding: Arc<dyn ShardingStrategy>,
        limits: Arc<dyn TenantConfigProvider>,
        block_compactor: Arc<dyn BlockCompactor>,
        clock: Arc<dyn SystemClock>,
        stat_registry: Arc<StatRegistry>,
    ) -> Result<Self, Error> {
        options.validate()?;
        let planner = SplitAndMergePlanner::new(options.block_ranges_millis());
        Ok(Self {
            options,
            store,
            sharding,
            limits,
            block_compactor,
            planner,
            clock,
            stats: Arc::new(CompactorStats::new(stat_registry)),
        })
    }

    pub fn stats(&self) -> Arc<CompactorStats> {
        self.stats.clone()
    }

    /// Compacts every owned tenant right away, then every
    /// `compaction_interval`, until the token is cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            "starting compactor [compaction_interval={:?}, block_ranges={:?}, jobs_order={}]",
            self.options.compaction_interval,
            self.options.block_ranges,
            self.options.jobs_order
        );
        let mut ticker = self.clock.ticker(self.options.compaction_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("compactor received shutdown signal... shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // failures are counted in compact_tenants and retried next tick
                    let _ = self.compact_tenants(&cancellation_token).await;
                }
            }
        }
    }

    /// Compacts every owned tenant once. Tenants are compacted one after the
    /// other; a tenant failing does not stop the others.
    pub async fn compact_tenants(&self, cancellation_token: &CancellationToken) -> Result<(), Error> {
        self.stats.runs_started.inc();
        info!("discovering tenants to compact");

        let sharding = self.sharding.clone();
        let scanner = TenantsScanner::new(
            self.store.clone(),
            Arc::new(move |tenant: &str| sharding.compactor_owns_tenant(tenant)),
        );
        let scanned = match (|| async { scanner.scan().await })
            .retry(discovery_retry_builder())
            .notify(|err: &BlockwardenError, duration: Duration| {
                warn!(error = %err, "retrying tenant discovery [duration={:?}]", duration);
            })
            .await
        {
            Ok(scanned) => scanned,
            Err(e) => {
                self.stats.runs_failed.inc();
                warn!(error = %e, "failed to discover tenants");
                return Err(e.into());
            }
        };

        self.stats
            .tenants_discovered
            .set((scanned.active.len() + scanned.deleted.len()) as u64);
        self.stats.tenants_skipped.add(scanned.deleted.len() as u64);
        for tenant in &scanned.deleted {
            debug!(tenant = %tenant, "skipping tenant marked for deletion");
        }
        info!(
            "discovered tenants to compact [tenants={}, skipped={}]",
            scanned.active.len(),
            scanned.deleted.len()
        );

        let mut failed = 0usize;
        for tenant in &scanned.active {
            if cancellation_token.is_cancelled() {
                info!("interrupting compaction of remaining tenants");
                return Err(BlockwardenError::Canceled.into());
            }
            match self
                .compact_tenant_with_retries(tenant, cancellation_token)
                .await
            {
                Ok(()) => {
                    self.stats.tenants_succeeded.inc();
                    info!(tenant = %tenant, "successfully compacted tenant");
                }
                Err(e) if e.is_canceled() => {
                    info!(tenant = %tenant, "compaction of tenant canceled");
                    return Err(e);
                }
                Err(e) => {
                    failed += 1;
                    self.stats.tenants_failed.inc();
                    warn!(tenant = %tenant, error = %e, "failed to compact tenant");
                }
            }
        }

        if failed > 0 {
            self.stats.runs_failed.inc();
            return Err(BlockwardenError::CompactTenantsFailed(failed).into());
        }
        self.stats.runs_completed.inc();
        self.stats
            .last_run_successful_timestamp
            .set(self.clock.now().timestamp());
        info!("compaction iteration completed");
        Ok(())
    }

    /// Plans the jobs of `tenant` in execution order, regardless of which
    /// instance owns them, without running any of them.
    pub async fn plan_tenant(&self, tenant: &str) -> Result<Vec<Job>, Error> {
        let bucket = TenantBucket::new(self.store.clone(), tenant);
        let mut index = read_index_or_none(&bucket).await?;
        self.plan_jobs(&bucket, &mut index).await
    }

    async fn compact_tenant_with_retries(
        &self,
        tenant: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Error> {
        let retries = self.options.compaction_retries.saturating_sub(1);
        (|| async { self.compact_tenant(tenant, cancellation_token).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(self.options.retry_min_backoff)
                    .with_max_delay(self.options.retry_max_backoff)
                    .with_max_times(retries),
            )
            .when(|e: &Error| !e.is_canceled())
            .notify(|e: &Error, duration: Duration| {
                warn!(
                    tenant,
                    error = %e,
                    "retrying tenant compaction [duration={:?}]",
                    duration
                );
            })
            .await
    }

    #[instrument(level = "debug", skip_all, fields(tenant = tenant))]
    async fn compact_tenant(
        &self,
        tenant: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Error> {
        let bucket = TenantBucket::new(self.store.clone(), tenant);
        if read_tenant_deletion_mark(&bucket).await?.is_some() {
            info!(tenant, "skipping compaction of tenant marked for deletion");
            return Ok(());
        }

        let started = self.clock.now();
        let mut index = read_index_or_none(&bucket).await?;
        loop {
            check_canceled(cancellation_token)?;
            let jobs = self.plan_jobs(&bucket, &mut index).await?;
            let now = self.clock.now();
            let jobs: Vec<Job> = jobs
                .into_iter()
                .filter(|job| self.owns_job(job))
                .filter(|job| self.wait_period_elapsed(job, now))
                .collect();
            if jobs.is_empty() {
                debug!(tenant, "no compaction job to run");
                return Ok(());
            }

            let mut ran = 0usize;
            for job in &jobs {
                check_canceled(cancellation_token)?;
                if self.compaction_time_exceeded(started) {
                    info!(
                        tenant,
                        "max compaction time reached, no more compactions will be started [max_compaction_time={:?}]",
                        self.options.max_compaction_time
                    );
                    return Ok(());
                }
                // the ring may have changed while previous jobs ran
                if !self.owns_job(job) {
                    continue;
                }
                self.run_job(&bucket, job).await?;
                ran += 1;
            }
            if ran == 0 {
                return Ok(());
            }
        }
    }

    /// Refreshes the tenant's block list into `index` and groups the live
    /// blocks into jobs, sorted by `jobs_order`.
    async fn plan_jobs(
        &self,
        bucket: &TenantBucket,
        index: &mut Option<BucketIndex>,
    ) -> Result<Vec<Job>, Error> {
        let tenant = bucket.tenant();
        let (fresh, partials) = Updater::new(bucket)
            .update_index(index.as_ref(), self.clock.now())
            .await?;
        if !partials.is_empty() {
            debug!(tenant, partials = partials.len(), "ignoring partial blocks");
        }

        let mut metas: BTreeMap<Ulid, BlockMeta> = fresh
            .unmarked_blocks()
            .into_iter()
            .map(|meta| (meta.id, meta))
            .collect();
        let mut dedup = ShardAwareDeduplicateFilter::new();
        dedup.filter(&mut metas);
        if !dedup.duplicate_ids().is_empty() {
            debug!(
                tenant,
                duplicates = dedup.duplicate_ids().len(),
                "filtered out blocks included in other blocks"
            );
        }
        *index = Some(fresh);

        let blocks: Vec<BlockMeta> = metas.into_values().collect();
        let grouper = SplitAndMergeGrouper::new(
            tenant,
            self.options.block_ranges_millis(),
            self.limits.split_and_merge_shards(tenant),
            self.limits.split_and_merge_stage_size(tenant),
            self.limits.split_groups(tenant),
        );
        let mut jobs = grouper.groups(&blocks)?;
        self.options.jobs_order.sort(&mut jobs);
        Ok(jobs)
    }

    fn owns_job(&self, job: &Job) -> bool {
        match self.sharding.owns_job(job) {
            Ok(owned) => owned,
            Err(e) => {
                warn!(
                    tenant = job.tenant(),
                    job_key = job.key(),
                    error = %e,
                    "unable to check if job is owned by this instance, skipping"
                );
                false
            }
        }
    }

    /// Level-1 blocks get `compaction_wait_period` after upload, so that
    /// blocks still being written for the same range can join the job.
    fn wait_period_elapsed(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if job.min_compaction_level() > 1 || self.options.compaction_wait_period.is_zero() {
            return true;
        }
        let wait_ms = i64::try_from(self.options.compaction_wait_period.as_millis()).unwrap_or(i64::MAX);
        let now_ms = now.timestamp_millis();
        let waiting = job
            .metas()
            .iter()
            .find(|meta| now_ms.saturating_sub(meta.id.timestamp_ms() as i64) < wait_ms);
        match waiting {
            Some(meta) => {
                info!(
                    tenant = job.tenant(),
                    job_key = job.key(),
                    block_id = %meta.id,
                    "skipping compaction job because a block was uploaded within the wait period"
                );
                false
            }
            None => true,
        }
    }

    fn compaction_time_exceeded(&self, started: DateTime<Utc>) -> bool {
        let max = self.options.max_compaction_time;
        if max.is_zero() {
            return false;
        }
        (self.clock.now() - started)
            .to_std()
            .map(|elapsed| elapsed >= max)
            .unwrap_or(false)
    }

    async fn run_job(&self, bucket: &TenantBucket, job: &Job) -> Result<(), Error> {
        let to_compact = self.planner.plan(job.metas())?;
        if to_compact.is_empty() {
            return Ok(());
        }
        let (shard_count, split_stage_size) = if job.use_splitting() {
            (job.shard_count(), job.split_stage_size())
        } else {
            (1, 0)
        };
        info!(
            tenant = job.tenant(),
            job_key = job.key(),
            blocks = to_compact.len(),
            use_splitting = job.use_splitting(),
            "compaction job started [job={}]",
            job
        );

        self.stats.running_jobs.add(1);
        let result = self
            .block_compactor
            .compact_with_splitting(job, shard_count, split_stage_size)
            .await;
        self.stats.running_jobs.sub(1);
        let compacted = result.inspect_err(|e| {
            self.stats.jobs_failed.inc();
            warn!(tenant = job.tenant(), job_key = job.key(), error = %e, "compaction job failed");
        })?;
        info!(
            tenant = job.tenant(),
            job_key = job.key(),
            "compaction job succeeded [compacted={:?}]",
            compacted
        );

        let now = self.clock.now();
        for meta in to_compact {
            mark_for_deletion(
                bucket,
                meta.id,
                SOURCE_BLOCK_DETAILS,
                now,
                &self.stats.blocks_marked_for_deletion,
            )
            .await?;
        }
        self.stats.jobs_completed.inc();
        Ok(())
    }
}

async fn read_index_or_none(bucket: &TenantBucket) -> Result<Option<BucketIndex>, BlockwardenError> {
    match bucket_index::read(bucket).await {
        Ok(index) => Ok(Some(index)),
        Err(BlockwardenError::IndexNotFound(_)) | Err(BlockwardenError::IndexCorrupted(_)) => Ok(None),
        Err(e) => Err(e),
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
