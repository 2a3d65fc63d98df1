use crate::args::{parse_args, CliArgs, CliCommands};
use blockwarden::bucket::TenantBucket;
use blockwarden::bucket_index::read_index;
use blockwarden::config::{Settings, TenantConfigProvider};
use blockwarden::job::Job;
use blockwarden::markers::mark_tenant_for_deletion;
use blockwarden::ring::{ReadRing, TokenRing};
use blockwarden::sharding_strategy::{ShardingStrategy, SplitAndMergeShardingStrategy};
use blockwarden::stats::StatRegistry;
use blockwarden::tenants::{AllowedTenants, TenantsScanner};
use blockwarden::{BlockCompactor, BlocksCleaner, Compactor};
use blockwarden_common::{DefaultSystemClock, SystemClock};
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

mod args;

/// Lets the compactor plan jobs without being able to run them.
struct PlanOnlyBlockCompactor;

#[async_trait::async_trait]
impl BlockCompactor for PlanOnlyBlockCompactor {
    async fn compact_with_splitting(
        &self,
        job: &Job,
        _shard_count: u32,
        _split_stage_size: u32,
    ) -> Result<Vec<Ulid>, blockwarden::Error> {
        Err(blockwarden::Error::invalid(format!(
            "the cli only plans compaction jobs. job_key=`{}`",
            job.key()
        )))
    }
}

struct Context {
    settings: Settings,
    store: Arc<dyn ObjectStore>,
    sharding: Arc<dyn ShardingStrategy>,
    limits: Arc<dyn TenantConfigProvider>,
    clock: Arc<dyn SystemClock>,
}

impl Context {
    fn new(args: &CliArgs) -> Result<Self, Box<dyn Error>> {
        let settings = match &args.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::load()?,
        };
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(&args.path)?);
        let limits: Arc<dyn TenantConfigProvider> = Arc::new(settings.limits.clone());
        let ring: Arc<dyn ReadRing> =
            Arc::new(TokenRing::single(&args.instance_id, &args.instance_addr));
        let sharding: Arc<dyn ShardingStrategy> = Arc::new(SplitAndMergeShardingStrategy::new(
            AllowedTenants::new(
                &settings.compactor.enabled_tenants,
                &settings.compactor.disabled_tenants,
            ),
            ring,
            &args.instance_id,
            &args.instance_addr,
            limits.clone(),
        ));
        Ok(Self {
            settings,
            store,
            sharding,
            limits,
            clock: Arc::new(DefaultSystemClock::new()),
        })
    }

    fn cleaner(&self) -> BlocksCleaner {
        BlocksCleaner::new(
            self.settings.blocks_cleaner.clone(),
            self.store.clone(),
            self.sharding.clone(),
            self.limits.clone(),
            self.clock.clone(),
            Arc::new(StatRegistry::new()),
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .init();

    let args: CliArgs = parse_args();
    let ctx = Context::new(&args)?;
    let cancellation_token = CancellationToken::new();

    let ct = cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("intercepted SIGINT ... shutting down background processes");
            ct.cancel();
        }
    });

    match args.command {
        CliCommands::ListTenants {} => exec_list_tenants(&ctx).await?,
        CliCommands::ReadIndex { tenant } => exec_read_index(&ctx, &tenant).await?,
        CliCommands::Plan { tenant } => exec_plan(&ctx, &tenant).await?,
        CliCommands::Cleanup { timeout } => exec_cleanup(&ctx, timeout, &cancellation_token).await?,
        CliCommands::RunCleaner { interval } => {
            exec_run_cleaner(ctx, interval, cancellation_token).await
        }
        CliCommands::MarkTenantForDeletion { tenant } => {
            exec_mark_tenant_for_deletion(&ctx, &tenant).await?
        }
    }

    Ok(())
}

async fn exec_list_tenants(ctx: &Context) -> Result<(), Box<dyn Error>> {
    let scanner = TenantsScanner::new(
        ctx.store.clone(),
        Arc::new(|_: &str| Ok::<_, blockwarden::Error>(true)),
    );
    let scanned = scanner.scan_tenants().await?;
    for tenant in scanned.active {
        println!("{}", tenant);
    }
    for tenant in scanned.deleted {
        println!("{} (marked for deletion)", tenant);
    }
    Ok(())
}

async fn exec_read_index(ctx: &Context, tenant: &str) -> Result<(), Box<dyn Error>> {
    let bucket = TenantBucket::new(ctx.store.clone(), tenant);
    let index = read_index(&bucket).await?;
    println!("{}", serde_json::to_string_pretty(&index)?);
    Ok(())
}

async fn exec_plan(ctx: &Context, tenant: &str) -> Result<(), Box<dyn Error>> {
    let compactor = Compactor::new(
        ctx.settings.compactor.clone(),
        ctx.store.clone(),
        ctx.sharding.clone(),
        ctx.limits.clone(),
        Arc::new(PlanOnlyBlockCompactor),
        ctx.clock.clone(),
        Arc::new(StatRegistry::new()),
    )?;
    let jobs = compactor.plan_tenant(tenant).await?;
    if jobs.is_empty() {
        println!("no compaction job planned");
    }
    for job in jobs {
        let owned = ctx.sharding.owns_job(&job).unwrap_or(false);
        println!(
            "{} blocks={} split={} owned={}",
            job,
            job.metas().len(),
            job.use_splitting(),
            owned
        );
    }
    Ok(())
}

async fn exec_cleanup(
    ctx: &Context,
    timeout: Option<Duration>,
    cancellation_token: &CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let cleaner = ctx.cleaner();
    match timeout {
        Some(duration) => {
            blockwarden_common::timeout(
                ctx.clock.clone(),
                duration,
                || blockwarden::Error::unavailable(format!("cleanup did not finish within {:?}", duration)),
                cleaner.run_cleanup(cancellation_token),
            )
            .await?
        }
        None => cleaner.run_cleanup(cancellation_token).await?,
    }
    let stats = cleaner.stats();
    println!(
        "cleaned {} blocks, marked {} blocks for deletion, {} failures",
        stats.blocks_cleaned.value(),
        stats.blocks_marked_for_deletion.value(),
        stats.blocks_failed.value()
    );
    Ok(())
}

async fn exec_run_cleaner(
    mut ctx: Context,
    interval: Option<Duration>,
    cancellation_token: CancellationToken,
) {
    if let Some(interval) = interval {
        ctx.settings.blocks_cleaner.cleanup_interval = interval;
    }
    ctx.cleaner().run(cancellation_token).await;
}

async fn exec_mark_tenant_for_deletion(ctx: &Context, tenant: &str) -> Result<(), Box<dyn Error>> {
    let bucket = TenantBucket::new(ctx.store.clone(), tenant);
    mark_tenant_for_deletion(&bucket, ctx.clock.as_ref()).await?;
    println!("tenant {} marked for deletion", tenant);
    Ok(())
}
