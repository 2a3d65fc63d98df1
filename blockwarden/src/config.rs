//! # Configuration
//!
//! [Settings] gathers everything a blockwarden process needs: how the compactor
//! plans and retries, how the blocks cleaner deletes, and per-tenant limits.
//!
//! Settings are layered with `figment`. Defaults come first, then an optional
//! `Blockwarden.json`, `Blockwarden.toml`, `Blockwarden.yaml` or
//! `Blockwarden.yml`, then environment variables prefixed with `BLOCKWARDEN_`.
//! Nested keys are separated by a dot, e.g.
//! `BLOCKWARDEN_BLOCKS_CLEANER.DELETION_DELAY=6h`.
//!
//! Durations accept human-friendly strings such as `"90s"`, `"15m"` or `"7d"`.
//!
//! ```
//! use blockwarden::config::Settings;
//!
//! let settings = Settings::default();
//! assert_eq!(settings.blocks_cleaner.cleanup_concurrency, 20);
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use duration_str::{deserialize_duration, deserialize_option_duration};
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::{Figment, Metadata, Provider};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BlockwardenError, Error};
use crate::jobs_order::JobsOrder;

/// Smallest non-zero partial block deletion delay. Smaller values disable
/// stale partial block marking for the tenant.
pub const MIN_PARTIAL_BLOCK_DELETION_DELAY: Duration = Duration::from_secs(4 * 3600);

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub compactor: CompactorOptions,
    pub blocks_cleaner: BlocksCleanerOptions,
    pub limits: TenantLimits,
}

impl Settings {
    /// Converts the Settings to a JSON string representation
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Loads Settings from a file. The format is picked from the extension:
    /// `.json`, `.toml`, `.yaml` or `.yml`.
    ///
    /// ```no_run
    /// use blockwarden::config::Settings;
    ///
    /// let settings = Settings::from_file("blockwarden.toml").expect("failed to load settings");
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings, Error> {
        let path = path.as_ref();
        let Some(ext) = path.extension() else {
            return Err(BlockwardenError::UnknownConfigurationFormat(path.into()).into());
        };

        let mut builder = Figment::from(Settings::default());
        match ext.to_str().unwrap_or_default() {
            "json" => builder = builder.merge(Json::file(path)),
            "toml" => builder = builder.merge(Toml::file(path)),
            "yaml" | "yml" => builder = builder.merge(Yaml::file(path)),
            _ => return Err(BlockwardenError::UnknownConfigurationFormat(path.into()).into()),
        }
        let settings: Settings = builder
            .extract()
            .map_err(|e| BlockwardenError::InvalidConfigurationFormat(Box::new(e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads Settings from environment variables starting with `prefix`.
    pub fn from_env(prefix: &str) -> Result<Settings, Error> {
        let settings: Settings = Figment::from(Settings::default())
            .merge(Env::prefixed(prefix))
            .extract()
            .map_err(|e| BlockwardenError::InvalidConfigurationFormat(Box::new(e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads Settings from the default locations, later sources overriding
    /// earlier ones:
    /// 1. Defaults
    /// 2. `Blockwarden.json`
    /// 3. `Blockwarden.toml`
    /// 4. `Blockwarden.yaml` and `Blockwarden.yml`
    /// 5. Environment variables prefixed with `BLOCKWARDEN_`
    pub fn load() -> Result<Settings, Error> {
        let settings: Settings = Figment::from(Settings::default())
            .merge(Json::file("Blockwarden.json"))
            .merge(Toml::file("Blockwarden.toml"))
            .merge(Yaml::file("Blockwarden.yaml"))
            .merge(Yaml::file("Blockwarden.yml"))
            .admerge(Env::prefixed("BLOCKWARDEN_"))
            .extract()
            .map_err(|e| BlockwardenError::InvalidConfigurationFormat(Box::new(e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.compactor.validate()
    }
}

impl Provider for Settings {
    fn metadata(&self) -> Metadata {
        Metadata::named("Blockwarden configuration options")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        figment::providers::Serialized::defaults(self).data()
    }
}

/// Options for planning and running compaction jobs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompactorOptions {
    /// Nested compaction ranges, ascending. Each must be a multiple of the
    /// previous one. The smallest is the split range.
    #[serde(
        deserialize_with = "deserialize_durations",
        serialize_with = "serialize_durations"
    )]
    pub block_ranges: Vec<Duration>,

    /// How often the compactor discovers tenants and plans jobs.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub compaction_interval: Duration,

    /// How many times a tenant's compaction is attempted per cycle.
    pub compaction_retries: usize,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_min_backoff: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_max_backoff: Duration,

    /// Level-1 blocks younger than this are not compacted yet, giving other
    /// writers time to upload blocks for the same range.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub compaction_wait_period: Duration,

    pub jobs_order: JobsOrder,

    /// When not empty, only these tenants are compacted and cleaned.
    pub enabled_tenants: Vec<String>,

    /// Tenants never compacted or cleaned. Takes precedence over `enabled_tenants`.
    pub disabled_tenants: Vec<String>,

    /// No new job is started for a tenant once its compaction has been running
    /// this long. Zero disables the limit.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_compaction_time: Duration,
}

impl Default for CompactorOptions {
    fn default() -> Self {
        Self {
            block_ranges: vec![
                Duration::from_secs(3600),
                Duration::from_secs(2 * 3600),
                Duration::from_secs(8 * 3600),
            ],
            compaction_interval: Duration::from_secs(30 * 60),
            compaction_retries: 3,
            retry_min_backoff: Duration::from_secs(10),
            retry_max_backoff: Duration::from_secs(60),
            compaction_wait_period: Duration::from_secs(25 * 60),
            jobs_order: JobsOrder::default(),
            enabled_tenants: Vec::new(),
            disabled_tenants: Vec::new(),
            max_compaction_time: Duration::from_secs(3600),
        }
    }
}

impl CompactorOptions {
    /// Checks that the block ranges form a ladder: non-empty, non-zero, and
    /// each range a multiple of its predecessor.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| -> Error { BlockwardenError::InvalidBlockRanges(msg).into() };
        let ranges = self.block_ranges_millis();
        if ranges.is_empty() {
            return Err(invalid("at least one block range is required".to_string()));
        }
        for (i, range) in ranges.iter().enumerate() {
            if *range <= 0 {
                return Err(invalid(format!("block range {} must be at least 1ms", i)));
            }
            if i > 0 && range % ranges[i - 1] != 0 {
                return Err(invalid(format!(
                    "block range {:?} is not divisible by previous range {:?}",
                    self.block_ranges[i],
                    self.block_ranges[i - 1]
                )));
            }
        }
        Ok(())
    }

    /// Block ranges in milliseconds.
    pub fn block_ranges_millis(&self) -> Vec<i64> {
        self.block_ranges
            .iter()
            .map(|d| d.as_millis() as i64)
            .collect()
    }
}

/// Options for the blocks cleaner.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlocksCleanerOptions {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub cleanup_interval: Duration,

    /// Tenants cleaned concurrently.
    pub cleanup_concurrency: usize,

    /// Time between a block's deletion mark and its hard deletion.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub deletion_delay: Duration,

    /// Time after all blocks of a deleted tenant are gone before its remaining
    /// markers are removed.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub tenant_cleanup_delay: Duration,

    /// Blocks deleted concurrently within one tenant.
    pub delete_blocks_concurrency: usize,

    /// Delete the bucket index and markers of tenants without blocks instead of
    /// writing an empty index.
    pub no_blocks_file_cleanup_enabled: bool,
}

impl Default for BlocksCleanerOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(15 * 60),
            cleanup_concurrency: 20,
            deletion_delay: Duration::from_secs(12 * 3600),
            tenant_cleanup_delay: Duration::from_secs(6 * 3600),
            delete_blocks_concurrency: 16,
            no_blocks_file_cleanup_enabled: false,
        }
    }
}

/// Per-tenant configuration consumed by the compactor and blocks cleaner.
pub trait TenantConfigProvider: Debug + Send + Sync {
    /// Blocks whose data ends before `now - retention` are deleted. Zero
    /// disables retention.
    fn retention_period(&self, tenant: &str) -> Duration;

    /// Number of shards blocks are split into. Zero disables splitting.
    fn split_and_merge_shards(&self, tenant: &str) -> u32;

    fn split_and_merge_stage_size(&self, tenant: &str) -> u32;

    /// Number of split jobs per window of the smallest range.
    fn split_groups(&self, tenant: &str) -> u32;

    /// Size of the tenant's compactor subring. Zero means every compactor.
    fn tenant_shard_size(&self, tenant: &str) -> usize;

    /// Age after which a partial block without a deletion mark gets marked.
    /// Zero disables marking. The flag is false when the configured delay is
    /// below [MIN_PARTIAL_BLOCK_DELETION_DELAY].
    fn partial_block_deletion_delay(&self, tenant: &str) -> (Duration, bool);
}

/// Limit values for a tenant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retention_period: Duration,
    pub split_and_merge_shards: u32,
    pub split_and_merge_stage_size: u32,
    pub split_groups: u32,
    pub tenant_shard_size: usize,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub partial_block_deletion_delay: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            retention_period: Duration::ZERO,
            split_and_merge_shards: 0,
            split_and_merge_stage_size: 0,
            split_groups: 1,
            tenant_shard_size: 0,
            partial_block_deletion_delay: Duration::from_secs(24 * 3600),
        }
    }
}

/// Per-tenant overrides. Unset fields fall back to [TenantLimits::defaults].
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TenantOverrides {
    #[serde(
        deserialize_with = "deserialize_option_duration",
        serialize_with = "serialize_option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub retention_period: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_and_merge_shards: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_and_merge_stage_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_groups: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_shard_size: Option<usize>,
    #[serde(
        deserialize_with = "deserialize_option_duration",
        serialize_with = "serialize_option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub partial_block_deletion_delay: Option<Duration>,
}

/// Default limits plus per-tenant overrides, keyed by tenant id.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TenantLimits {
    pub defaults: Limits,
    pub overrides: BTreeMap<String, TenantOverrides>,
}

impl TenantLimits {
    fn get<T>(
        &self,
        tenant: &str,
        overridden: impl Fn(&TenantOverrides) -> Option<T>,
        default: impl Fn(&Limits) -> T,
    ) -> T {
        self.overrides
            .get(tenant)
            .and_then(overridden)
            .unwrap_or_else(|| default(&self.defaults))
    }
}

impl TenantConfigProvider for TenantLimits {
    fn retention_period(&self, tenant: &str) -> Duration {
        self.get(tenant, |o| o.retention_period, |d| d.retention_period)
    }

    fn split_and_merge_shards(&self, tenant: &str) -> u32 {
        self.get(tenant, |o| o.split_and_merge_shards, |d| d.split_and_merge_shards)
    }

    fn split_and_merge_stage_size(&self, tenant: &str) -> u32 {
        self.get(
            tenant,
            |o| o.split_and_merge_stage_size,
            |d| d.split_and_merge_stage_size,
        )
    }

    fn split_groups(&self, tenant: &str) -> u32 {
        self.get(tenant, |o| o.split_groups, |d| d.split_groups)
    }

    fn tenant_shard_size(&self, tenant: &str) -> usize {
        self.get(tenant, |o| o.tenant_shard_size, |d| d.tenant_shard_size)
    }

    fn partial_block_deletion_delay(&self, tenant: &str) -> (Duration, bool) {
        let delay = self.get(
            tenant,
            |o| o.partial_block_deletion_delay,
            |d| d.partial_block_deletion_delay,
        );
        if delay > Duration::ZERO && delay < MIN_PARTIAL_BLOCK_DELETION_DELAY {
            return (Duration::ZERO, false);
        }
        (delay, true)
    }
}

fn deserialize_durations<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    raw.iter()
        .map(|s| duration_str::parse(s.as_str()).map_err(serde::de::Error::custom))
        .collect()
}

fn serialize_durations<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let formatted: Vec<String> = durations.iter().map(format_duration).collect();
    formatted.serialize(serializer)
}

fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    if secs > 0 && millis > 0 {
        format!("{secs}s+{millis:03}ms")
    } else if millis > 0 {
        format!("{millis:03}ms")
    } else {
        format!("{secs}s")
    }
}

// Custom serializer for Duration
fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(duration))
}

// Custom serializer for Option<Duration>
fn serialize_option_duration<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serialize_duration(d, serializer),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::rstest;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_settings_load_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BLOCKWARDEN_BLOCKS_CLEANER.DELETION_DELAY", "1h");
            jail.set_env("BLOCKWARDEN_COMPACTOR.JOBS_ORDER", "newest-blocks-first");

            let settings = Settings::from_env("BLOCKWARDEN_")
                .expect("failed to load settings from environment");
            assert_eq!(settings.blocks_cleaner.deletion_delay, HOUR);
            assert_eq!(settings.compactor.jobs_order, JobsOrder::NewestBlocksFirst);
            Ok(())
        });
    }

    #[test]
    fn test_settings_load_from_toml_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
[compactor]
block_ranges = ["2h", "12h", "24h"]

[blocks_cleaner]
cleanup_concurrency = 4

[limits.defaults]
retention_period = "30d"

[limits.overrides.tenant-a]
retention_period = "7d"
split_and_merge_shards = 4
"#,
            )
            .expect("failed to create config file");

            let settings =
                Settings::from_file("config.toml").expect("failed to load settings from file");
            assert_eq!(
                settings.compactor.block_ranges,
                vec![2 * HOUR, 12 * HOUR, 24 * HOUR]
            );
            assert_eq!(settings.blocks_cleaner.cleanup_concurrency, 4);
            // untouched values keep their defaults
            assert_eq!(settings.blocks_cleaner.deletion_delay, 12 * HOUR);
            assert_eq!(settings.limits.retention_period("tenant-a"), 7 * 24 * HOUR);
            assert_eq!(settings.limits.retention_period("tenant-b"), 30 * 24 * HOUR);
            assert_eq!(settings.limits.split_and_merge_shards("tenant-a"), 4);
            assert_eq!(settings.limits.split_and_merge_shards("tenant-b"), 0);
            Ok(())
        });
    }

    #[test]
    fn test_settings_load_from_yaml_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
compactor:
  compaction_interval: "5m"
  disabled_tenants: ["noisy"]
"#,
            )
            .expect("failed to create config file");

            let settings =
                Settings::from_file("config.yaml").expect("failed to load settings from file");
            assert_eq!(settings.compactor.compaction_interval, Duration::from_secs(300));
            assert_eq!(settings.compactor.disabled_tenants, vec!["noisy".to_string()]);
            Ok(())
        });
    }

    #[test]
    fn test_settings_load_with_default_locations() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BLOCKWARDEN_BLOCKS_CLEANER.CLEANUP_INTERVAL", "1m");
            jail.create_file(
                "Blockwarden.json",
                r#"{"blocks_cleaner": {"no_blocks_file_cleanup_enabled": true}}"#,
            )
            .expect("failed to create config file");

            let settings = Settings::load().expect("failed to load settings");
            assert_eq!(
                settings.blocks_cleaner.cleanup_interval,
                Duration::from_secs(60)
            );
            assert!(settings.blocks_cleaner.no_blocks_file_cleanup_enabled);
            Ok(())
        });
    }

    #[test]
    fn test_settings_unknown_file_format() {
        let err = Settings::from_file("config.ini").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_settings_json_round_trip_uses_duration_strings() {
        let json = Settings::default().to_json_string().unwrap();
        assert!(json.contains(r#""deletion_delay":"43200s""#));
        assert!(json.contains(r#""block_ranges":["3600s","7200s","28800s"]"#));
    }

    #[rstest]
    #[case::default_ladder(&[1, 2, 8], true)]
    #[case::single_range(&[2], true)]
    #[case::not_divisible(&[2, 3], false)]
    #[case::descending(&[4, 2], false)]
    #[case::empty(&[], false)]
    fn test_validate_block_ranges(#[case] hours: &[u64], #[case] valid: bool) {
        let options = CompactorOptions {
            block_ranges: hours.iter().map(|h| *h as u32 * HOUR).collect(),
            ..CompactorOptions::default()
        };
        assert_eq!(options.validate().is_ok(), valid);
    }

    #[test]
    fn test_validate_rejects_zero_range() {
        let options = CompactorOptions {
            block_ranges: vec![Duration::ZERO, HOUR],
            ..CompactorOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[rstest]
    #[case::disabled(Duration::ZERO, (Duration::ZERO, true))]
    #[case::too_small(HOUR, (Duration::ZERO, false))]
    #[case::minimum(4 * HOUR, (4 * HOUR, true))]
    #[case::large(48 * HOUR, (48 * HOUR, true))]
    fn test_partial_block_deletion_delay(
        #[case] configured: Duration,
        #[case] expected: (Duration, bool),
    ) {
        let limits = TenantLimits {
            overrides: BTreeMap::from([(
                "tenant-a".to_string(),
                TenantOverrides {
                    partial_block_deletion_delay: Some(configured),
                    ..TenantOverrides::default()
                },
            )]),
            ..TenantLimits::default()
        };
        assert_eq!(limits.partial_block_deletion_delay("tenant-a"), expected);
        assert_eq!(
            limits.partial_block_deletion_delay("tenant-b"),
            (24 * HOUR, true)
        );
    }
}
