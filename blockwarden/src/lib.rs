#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic))]
#![allow(clippy::result_large_err)]

//! Decision engine for the lifecycle of tenant blocks in object storage.
//!
//! The [Compactor] plans split and merge jobs over a tenant's blocks and hands
//! them to a [BlockCompactor]. The [BlocksCleaner] applies retention, deletes
//! blocks marked for deletion and maintains each tenant's bucket index. Work
//! is spread across instances through a token ring (see
//! [sharding_strategy::SplitAndMergeShardingStrategy]).

/// Re-export the bytes crate.
///
/// This is useful for users of the crate who want to use blockwarden
/// without having to depend on the bytes crate directly.
pub use bytes;

/// Re-export the object store crate.
///
/// This is useful for users of the crate who want to use blockwarden
/// without having to depend on the object store crate directly.
pub use object_store;

pub use blocks_cleaner::stats as blocks_cleaner_stats;
pub use blocks_cleaner::BlocksCleaner;
pub use compactor::stats as compactor_stats;
pub use compactor::{BlockCompactor, Compactor};
pub use concurrency::LimitedConcurrencySingleFlight;
pub use config::Settings;
pub use error::{Error, ErrorKind};

pub mod block;
pub mod bucket;
pub mod bucket_index;
pub mod config;
pub mod dedup_filter;
pub mod grouper;
pub mod hash;
pub mod job;
pub mod jobs_order;
pub mod markers;
pub mod planner;
pub mod ring;
pub mod sharding;
pub mod sharding_strategy;
pub mod stats;
pub mod tenants;

mod blocks_cleaner;
mod compactor;
mod concurrency;
mod error;
#[cfg(test)]
mod test_utils;
