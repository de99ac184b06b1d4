//! ShardIO Bench
//!
//! Drives a synthetic operation mix through the object context loader of a
//! single shard backed by an in-memory store, optionally resizes the
//! registry half way through, then plans recovery of the whole data set and
//! reports what it saw.

mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use shardio_common::config::OBC_LRU_SIZE;
use shardio_common::{Config, ConfigProxy};
use shardio_obc::{
    InterruptCondition, MemBackend, ObjectContextLoader, ObjectContextRegistry, PgBackend,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::workload::{OpStats, RecoveryStats, Workload, WorkloadSpec, merge_stats};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "shardio-bench")]
#[command(about = "ShardIO object context cache and recovery planning bench")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "SHARDIO_CONFIG")]
    config: Option<PathBuf>,

    /// Number of head objects
    #[arg(long, default_value_t = 256)]
    objects: usize,

    /// Clones per head
    #[arg(long, default_value_t = 3)]
    clones: u64,

    /// Operations to run
    #[arg(long, default_value_t = 10_000)]
    ops: usize,

    /// Operations in flight at once
    #[arg(long, default_value_t = 64)]
    concurrency: usize,

    /// Backend metadata load latency in microseconds
    #[arg(long, default_value_t = 50)]
    latency_us: u64,

    /// Share of head operations that write
    #[arg(long, default_value_t = 0.2, value_parser = parse_ratio)]
    write_ratio: f64,

    /// Share of operations that read a snapshot
    #[arg(long, default_value_t = 0.2, value_parser = parse_ratio)]
    snap_read_ratio: f64,

    /// Share of clones missing on the recovering replica
    #[arg(long, default_value_t = 0.3, value_parser = parse_ratio)]
    missing_ratio: f64,

    /// Share of the namespace backfill has passed before recovery is planned
    #[arg(long, default_value_t = 1.0, value_parser = parse_ratio)]
    backfill_progress: f64,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Resize the registry to this many entries after half the operations
    #[arg(long)]
    resize_to: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// A probability in `[0, 1]`
fn parse_ratio(s: &str) -> std::result::Result<f64, String> {
    let ratio: f64 = s.parse().map_err(|e| format!("`{s}` is not a number: {e}"))?;
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(format!("{ratio} is not between 0.0 and 1.0"))
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RegistryReport {
    target_size: usize,
    cached: usize,
    live: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    hit_ratio: f64,
}

#[derive(Debug, Serialize)]
struct Report {
    ops: OpStats,
    elapsed_ms: u64,
    ops_per_sec: f64,
    backend_loads: u64,
    registry: RegistryReport,
    recovery: RecoveryStats,
}

impl Report {
    fn print(&self) {
        println!(
            "operations:   {} ({} ok, {} not found, {} corrupted, {} shutdown, {} failed)",
            self.ops.total(),
            self.ops.ok,
            self.ops.not_found,
            self.ops.corrupted,
            self.ops.shutdown,
            self.ops.failed
        );
        println!(
            "elapsed:      {} ms ({:.0} ops/s)",
            self.elapsed_ms, self.ops_per_sec
        );
        println!("backend:      {} metadata loads", self.backend_loads);
        println!(
            "registry:     {} cached / {} target, {} live, hit ratio {:.3} ({} hits, {} misses, {} evictions)",
            self.registry.cached,
            self.registry.target_size,
            self.registry.live,
            self.registry.hit_ratio,
            self.registry.hits,
            self.registry.misses,
            self.registry.evictions
        );
        println!(
            "recovery:     {} objects behind backfill; {} objects, {} bytes: {} pushed, {} cloned",
            self.recovery.backfilled,
            self.recovery.objects,
            self.recovery.full_bytes,
            self.recovery.pushed_bytes,
            self.recovery.cloned_bytes
        );
    }
}

fn registry_report(registry: &ObjectContextRegistry) -> RegistryReport {
    let stats = registry.stats();
    RegistryReport {
        target_size: registry.target_size(),
        cached: registry.len(),
        live: registry.live(),
        hits: stats.hits.load(Ordering::Relaxed),
        misses: stats.misses.load(Ordering::Relaxed),
        evictions: stats.evictions.load(Ordering::Relaxed),
        hit_ratio: stats.hit_ratio(),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting ShardIO bench");

    let config = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("load config {}", path.display()))?
        }
        None => Config::default(),
    };
    info!(
        "obc lru size {}, clone overlap recovery {} (limit {})",
        config.obc.crimson_osd_obc_lru_size,
        config.recovery.osd_recover_clone_overlap,
        config.recovery.osd_recover_clone_overlap_limit
    );
    let conf = ConfigProxy::new(config);

    // ── Data set ──────────────────────────────────────────────────────────────
    let backend = Arc::new(MemBackend::with_latency(Duration::from_micros(
        args.latency_us,
    )));
    let mut workload = Workload::new(WorkloadSpec {
        objects: args.objects,
        clones: args.clones,
        concurrency: args.concurrency,
        write_ratio: args.write_ratio,
        snap_read_ratio: args.snap_read_ratio,
        missing_ratio: args.missing_ratio,
        backfill_progress: args.backfill_progress,
        seed: args.seed,
    });
    workload.populate(&backend).context("populate backend")?;
    info!(
        "{} objects with {} clones each in the backend",
        args.objects, args.clones
    );

    // ── Loader ────────────────────────────────────────────────────────────────
    let registry = ObjectContextRegistry::new(&conf);
    let loader = ObjectContextLoader::new(
        Arc::clone(&registry),
        Arc::clone(&backend) as Arc<dyn PgBackend>,
        InterruptCondition::never(),
    );

    // ── Operations ────────────────────────────────────────────────────────────
    let started = Instant::now();
    let mut phases = Vec::new();
    match args.resize_to {
        Some(size) => {
            let first = args.ops / 2;
            let ops = workload.operations(first);
            phases.push(workload.run(&loader, ops).await);

            conf.set_val(OBC_LRU_SIZE, &size.to_string())
                .context("resize registry")?;
            info!("registry resized to {} ({} cached)", size, registry.len());

            let ops = workload.operations(args.ops - first);
            phases.push(workload.run(&loader, ops).await);
        }
        None => {
            let ops = workload.operations(args.ops);
            phases.push(workload.run(&loader, ops).await);
        }
    }
    let elapsed = started.elapsed();

    loader.stop();
    loader.accessing().wait_drained().await;

    // ── Recovery planning ─────────────────────────────────────────────────────
    let recovery = workload
        .recovery_pass(&conf.recovery())
        .context("plan recovery")?;

    let ops = merge_stats(&phases);
    let ops_per_sec = if elapsed.is_zero() {
        0.0
    } else {
        ops.total() as f64 / elapsed.as_secs_f64()
    };
    let report = Report {
        ops,
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        ops_per_sec,
        backend_loads: backend.total_loads(),
        registry: registry_report(&registry),
        recovery,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["shardio-bench"]).unwrap();
        assert!(args.config.is_none());
        assert_eq!(args.objects, 256);
        assert_eq!(args.concurrency, 64);
        assert!(args.resize_to.is_none());
        assert!((args.backfill_progress - 1.0).abs() < f64::EPSILON);
        assert!(!args.json);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::try_parse_from([
            "shardio-bench",
            "--objects",
            "16",
            "--resize-to",
            "8",
            "--write-ratio",
            "0.5",
            "--json",
        ])
        .unwrap();
        assert_eq!(args.objects, 16);
        assert_eq!(args.resize_to, Some(8));
        assert!((args.write_ratio - 0.5).abs() < f64::EPSILON);
        assert!(args.json);
    }

    #[test]
    fn test_ratios_must_be_probabilities() {
        for arg in [
            "--write-ratio=1.5",
            "--snap-read-ratio=-0.1",
            "--missing-ratio=NaN",
            "--missing-ratio=half",
            "--backfill-progress=2",
        ] {
            let parsed = Args::try_parse_from(["shardio-bench", arg]);
            assert!(parsed.is_err(), "{arg} accepted");
        }
        assert!(parse_ratio("-0.1").is_err());
        assert!(parse_ratio("0.25").is_ok_and(|r| (r - 0.25).abs() < f64::EPSILON));

        let args =
            Args::try_parse_from(["shardio-bench", "--write-ratio", "0", "--missing-ratio", "1"])
                .unwrap();
        assert!(args.write_ratio.abs() < f64::EPSILON);
        assert!((args.missing_ratio - 1.0).abs() < f64::EPSILON);
    }
}
