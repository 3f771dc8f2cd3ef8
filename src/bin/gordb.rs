//! Table maintenance tool.
//!
//! ```bash
//! gordb bucketize variants.gord --pack-level consolidate --bucket-size 50
//! gordb needs-bucketizing variants.gord
//! gordb --lock-timeout 10s readlock variants.gord export 30s
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gordb::config::parse_duration;
use gordb::{BucketConfig, EngineConfig, LockConfig, PackLevel, Result, Session};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gordb")]
#[command(about = "Maintenance commands for genomic dictionary tables")]
struct Args {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// How long to wait for a table lock, e.g. 500ms, 30s, PT1M
    #[arg(long, global = true, value_parser = parse_duration)]
    lock_timeout: Option<Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hold a read lock on a table for a while, then release it
    Readlock {
        dict: PathBuf,
        lock_name: String,
        /// Milliseconds, or a duration with a unit
        #[arg(value_parser = parse_duration)]
        period: Duration,
    },

    /// Pack unbucketed entries into bucket files
    Bucketize {
        dict: PathBuf,
        /// nopacking, consolidate or full
        #[arg(long, default_value = "nopacking")]
        pack_level: PackLevel,
        /// Buckets to create in this run, 0 for no limit
        #[arg(long, default_value_t = 0)]
        max_buckets: usize,
        #[arg(long)]
        bucket_size: Option<usize>,
    },

    /// List entries not yet assigned to a bucket
    NeedsBucketizing { dict: PathBuf },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "gordb=debug" } else { "gordb=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn session(args: &Args, bucket_size: Option<usize>) -> Result<Session> {
    let mut lock = LockConfig::default();
    if let Some(timeout) = args.lock_timeout {
        lock = lock.timeout(timeout);
    }
    let mut bucket = BucketConfig::default();
    if let Some(size) = bucket_size {
        bucket = bucket.bucket_size(size);
    }
    Session::new(EngineConfig::new().lock(lock).bucket(bucket))
}

fn run(args: &Args) -> Result<()> {
    match &args.command {
        Command::Readlock {
            dict,
            lock_name,
            period,
        } => {
            let session = session(args, None)?;
            let timeout = session.config().lock.timeout;
            let mut lock = session.locks(dict).acquire_read(lock_name, timeout)?;
            info!(table = %dict.display(), lock = lock_name, holder = lock.holder(), ?period, "holding read lock");
            lock.hold(*period)?;
            lock.release()?;
            info!(table = %dict.display(), lock = lock_name, "released read lock");
        }
        Command::Bucketize {
            dict,
            pack_level,
            max_buckets,
            bucket_size,
        } => {
            let session = session(args, *bucket_size)?;
            let created = session
                .bucket_manager()
                .bucketize(dict, *pack_level, *max_buckets)?;
            println!("{}", created);
        }
        Command::NeedsBucketizing { dict } => {
            let session = session(args, None)?;
            for entry in session.bucket_manager().needs_bucketizing(dict)? {
                println!("{}\t{}", entry.path.display(), entry.source_name());
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}
