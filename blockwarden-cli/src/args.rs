use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "blockwarden")]
#[command(version = "0.1.0")]
#[command(about, long_about = None)]
pub(crate) struct CliArgs {
    #[arg(
        short,
        long,
        help = "The local directory acting as the object store bucket. Each top-level directory is a tenant"
    )]
    pub(crate) path: String,

    #[arg(
        short,
        long,
        help = "A .json, .toml or .yaml settings file. Defaults and BLOCKWARDEN_ environment variables are used when omitted"
    )]
    pub(crate) config: Option<String>,

    #[arg(long, default_value = "blockwarden-0", help = "The id of this instance in the ring")]
    pub(crate) instance_id: String,

    #[arg(
        long,
        default_value = "127.0.0.1:9095",
        help = "The address of this instance in the ring"
    )]
    pub(crate) instance_addr: String,

    #[command(subcommand)]
    pub(crate) command: CliCommands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommands {
    /// Lists the tenants found in the bucket, and those marked for deletion
    ListTenants {},

    /// Prints the bucket index of a tenant as JSON
    ReadIndex {
        #[arg(short, long)]
        tenant: String,
    },

    /// Plans the compaction jobs of a tenant in execution order, without
    /// running them
    Plan {
        #[arg(short, long)]
        tenant: String,
    },

    /// Runs a single cleanup pass over every tenant
    Cleanup {
        /// Optionally abort the pass after this long, e.g. "10min"
        #[arg(short, long)]
        #[clap(value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Runs the blocks cleaner until interrupted
    RunCleaner {
        /// Optionally override the configured cleanup interval, e.g. "5min"
        #[arg(short, long)]
        #[clap(value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },

    /// Writes a tenant deletion mark. The cleaner then deletes all the
    /// tenant's blocks.
    MarkTenantForDeletion {
        #[arg(short, long)]
        tenant: String,
    },
}

pub(crate) fn parse_args() -> CliArgs {
    CliArgs::parse()
}
