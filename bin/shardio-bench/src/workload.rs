//! Synthetic data set and operation mix

use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use shardio_common::{
    CleanRegions, Error, Eversion, IntervalSet, MissingSet, ObjectId, RecoveryConfig, SnapId,
    SnapSet,
};
use shardio_obc::{MemBackend, ObjectContextLoader, OpInfo};
use shardio_recovery::{
    BackfillInterval, ObjectRecoveryInfo, calc_clone_subsets, calc_head_subsets, set_subsets,
};
use tracing::{debug, warn};

const POOL: i64 = 1;
const BLOCK: u64 = 4096;

#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub objects: usize,
    pub clones: u64,
    pub concurrency: usize,
    pub write_ratio: f64,
    pub snap_read_ratio: f64,
    pub missing_ratio: f64,
    /// Share of the namespace backfill has already passed
    pub backfill_progress: f64,
    pub seed: u64,
}

/// One head and the snapshot history written to the backend for it
#[derive(Debug, Clone)]
pub struct ObjectFamily {
    pub head: ObjectId,
    pub size: u64,
    pub snapset: SnapSet,
}

pub struct Workload {
    spec: WorkloadSpec,
    rng: StdRng,
    families: Vec<ObjectFamily>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct OpStats {
    pub ok: u64,
    pub not_found: u64,
    pub corrupted: u64,
    pub shutdown: u64,
    pub failed: u64,
}

impl OpStats {
    fn record(&mut self, result: &Result<u64, Error>) {
        match result {
            Ok(_) => self.ok += 1,
            Err(Error::ObjectNotFound(_)) => self.not_found += 1,
            Err(Error::ObjectCorrupted(_)) => self.corrupted += 1,
            Err(Error::SystemShutdown) => self.shutdown += 1,
            Err(e) => {
                warn!("operation failed: {}", e);
                self.failed += 1;
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        self.ok += other.ok;
        self.not_found += other.not_found;
        self.corrupted += other.corrupted;
        self.shutdown += other.shutdown;
        self.failed += other.failed;
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.ok + self.not_found + self.corrupted + self.shutdown + self.failed
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryStats {
    /// Objects behind the backfill boundary
    pub backfilled: u64,
    pub objects: u64,
    pub full_bytes: u64,
    pub pushed_bytes: u64,
    /// Bytes cloned from at least one donor
    pub cloned_bytes: u64,
}

impl Workload {
    #[must_use]
    pub fn new(spec: WorkloadSpec) -> Self {
        Self {
            rng: StdRng::seed_from_u64(spec.seed),
            spec,
            families: Vec::new(),
        }
    }

    #[must_use]
    pub fn families(&self) -> &[ObjectFamily] {
        &self.families
    }

    /// Write every head and clone of the data set to `backend`
    pub fn populate(&mut self, backend: &MemBackend) -> anyhow::Result<()> {
        for i in 0..self.spec.objects {
            let head = ObjectId::head_of(POOL, format!("bench_obj_{i:05}"));
            let mut snapset = SnapSet::new(SnapId::new(0));

            // Clone snaps 2, 4, 6...; each also covers the odd snap below it
            for j in 1..=self.spec.clones {
                let snap = SnapId::new(j * 2);
                let size = self.rng.gen_range(1..=16) * BLOCK;
                let overlap = self.random_overlap(size);
                snapset.add_clone(snap, size, overlap, vec![snap, SnapId::new(j * 2 - 1)])?;
                backend.put_clone(&head.with_snap(snap), size);
            }

            let size = self.rng.gen_range(1..=16) * BLOCK;
            backend.put_head(&head, size, snapset.clone());
            self.families.push(ObjectFamily {
                head,
                size,
                snapset,
            });
        }
        debug!("populated {} objects", self.families.len());
        Ok(())
    }

    /// A few block-aligned extents within `[0, size)`
    fn random_overlap(&mut self, size: u64) -> IntervalSet {
        let blocks = size / BLOCK;
        let mut overlap = IntervalSet::new();
        for _ in 0..self.rng.gen_range(0..=4) {
            let start = self.rng.gen_range(0..blocks);
            let len = self.rng.gen_range(1..=blocks - start);
            overlap.insert(start * BLOCK, len * BLOCK);
        }
        overlap
    }

    /// Draw `count` operations against the populated data set
    pub fn operations(&mut self, count: usize) -> Vec<(ObjectId, OpInfo)> {
        let mut ops = Vec::with_capacity(count);
        if self.families.is_empty() {
            return ops;
        }
        for _ in 0..count {
            let family = &self.families[self.rng.gen_range(0..self.families.len())];
            let max_snap = family.snapset.seq.as_u64() + 2;
            let op = if self.rng.gen_bool(self.spec.snap_read_ratio) {
                let snap = SnapId::new(self.rng.gen_range(1..=max_snap));
                (family.head.with_snap(snap), OpInfo::read())
            } else if self.rng.gen_bool(self.spec.write_ratio) {
                let info = if self.rng.gen_bool(0.5) {
                    OpInfo::write()
                } else {
                    OpInfo::read_modify_write()
                };
                (family.head.clone(), info)
            } else {
                (family.head.clone(), OpInfo::read())
            };
            ops.push(op);
        }
        ops
    }

    /// Run `ops` through the loader, at most `concurrency` at a time
    pub async fn run(
        &self,
        loader: &ObjectContextLoader,
        ops: Vec<(ObjectId, OpInfo)>,
    ) -> OpStats {
        futures::stream::iter(ops)
            .map(|(oid, info)| async move {
                loader
                    .with_locked_obc(&oid, info, |obc| async move {
                        tokio::task::yield_now().await;
                        Ok(obc.size())
                    })
                    .await
            })
            .buffer_unordered(self.spec.concurrency.max(1))
            .fold(OpStats::default(), |mut stats, result| async move {
                stats.record(&result);
                stats
            })
            .await
    }

    /// Scan every object of the data set, in backfill order
    #[must_use]
    pub fn scan(&self) -> BackfillInterval {
        let mut interval = BackfillInterval::with_end(ObjectId::min(), ObjectId::max());
        for family in &self.families {
            interval.objects.insert(family.head.clone(), Eversion::new(1, 2));
            for &snap in &family.snapset.clones {
                interval
                    .objects
                    .insert(family.head.with_snap(snap), Eversion::new(1, 1));
            }
        }
        interval.version = Eversion::new(1, 2);
        interval.populated = true;
        interval.trim();
        interval
    }

    /// Plan recovery of every family, with a random part of each family
    /// missing on the recovering replica. Backfill is advanced through the
    /// scanned namespace first; only clones it has passed can donate.
    pub fn recovery_pass(&mut self, config: &RecoveryConfig) -> anyhow::Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        let mut backfill = self.scan();
        let scanned = backfill.objects.len();
        let passed = ((scanned as f64) * self.spec.backfill_progress).round() as usize;
        for _ in 0..passed.min(scanned) {
            if backfill.pop_front().is_some() {
                stats.backfilled += 1;
            }
        }
        let last_backfill = backfill.begin.clone();
        debug!(
            "backfill passed {} of {} objects, last_backfill {}",
            stats.backfilled, scanned, last_backfill
        );

        for family in &self.families {
            let mut missing = MissingSet::new();
            let mut dirty = CleanRegions::default();
            dirty.mark_data_region_dirty(0, family.size);
            missing.add(
                family.head.clone(),
                Eversion::new(1, 2),
                Eversion::new(1, 1),
                dirty,
            );
            for &snap in &family.snapset.clones {
                if self.rng.gen_bool(self.spec.missing_ratio) {
                    missing.add(
                        family.head.with_snap(snap),
                        Eversion::new(1, 1),
                        Eversion::default(),
                        CleanRegions::fully_dirty(),
                    );
                }
            }

            for oid in missing.get_items().keys() {
                let (size, subsets) = if oid.is_head() {
                    let subsets = calc_head_subsets(
                        family.size,
                        &family.snapset,
                        oid,
                        &missing,
                        &last_backfill,
                        config,
                    )?;
                    (family.size, subsets)
                } else {
                    let subsets =
                        calc_clone_subsets(&family.snapset, oid, &missing, &last_backfill, config);
                    (family.snapset.clone_size_of(oid.snap), subsets)
                };

                let mut info = ObjectRecoveryInfo::new(oid.clone(), Eversion::new(1, 2), size);
                set_subsets(&subsets, &mut info);
                debug!("{}", info);

                stats.objects += 1;
                stats.full_bytes += size;
                stats.pushed_bytes += info.copy_subset.size();
                let mut cloned = IntervalSet::new();
                for subset in info.clone_subset.values() {
                    cloned.union_of(subset);
                }
                stats.cloned_bytes += cloned.size();
            }
        }
        Ok(stats)
    }
}

/// Merge per-phase operation statistics
#[must_use]
pub fn merge_stats(phases: &[OpStats]) -> OpStats {
    let mut total = OpStats::default();
    for phase in phases {
        total.merge(phase);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardio_common::Config;
    use shardio_obc::{InterruptCondition, ObjectContextRegistry, PgBackend};
    use std::sync::Arc;

    fn spec() -> WorkloadSpec {
        WorkloadSpec {
            objects: 8,
            clones: 3,
            concurrency: 16,
            write_ratio: 0.3,
            snap_read_ratio: 0.3,
            missing_ratio: 0.5,
            backfill_progress: 1.0,
            seed: 7,
        }
    }

    #[test]
    fn test_populate() {
        let backend = MemBackend::new();
        let mut workload = Workload::new(spec());
        workload.populate(&backend).unwrap();

        assert_eq!(workload.families().len(), 8);
        // Each head plus its three clones
        assert_eq!(backend.len(), 8 * 4);
        for family in workload.families() {
            family.snapset.validate().unwrap();
            assert_eq!(family.snapset.seq, SnapId::new(6));
        }
    }

    #[tokio::test]
    async fn test_run_workload() {
        let backend = Arc::new(MemBackend::new());
        let mut workload = Workload::new(spec());
        workload.populate(&backend).unwrap();

        let registry = Arc::new(ObjectContextRegistry::with_target_size(4));
        let loader = ObjectContextLoader::new(
            Arc::clone(&registry),
            Arc::clone(&backend) as Arc<dyn PgBackend>,
            InterruptCondition::never(),
        );
        let ops = workload.operations(200);
        let stats = workload.run(&loader, ops).await;

        // Every snap up to seq + 2 resolves to a clone or the head
        assert_eq!(stats.ok, 200);
        assert_eq!(stats.total(), 200);
        assert!(registry.len() <= 4);
        assert!(loader.accessing().is_empty());
    }

    #[test]
    fn test_recovery_pass_accounts_every_byte() {
        let backend = MemBackend::new();
        let mut workload = Workload::new(spec());
        workload.populate(&backend).unwrap();

        let stats = workload
            .recovery_pass(&Config::default().recovery)
            .unwrap();
        assert!(stats.objects >= 8);
        assert_eq!(stats.full_bytes, stats.pushed_bytes + stats.cloned_bytes);
    }

    #[test]
    fn test_recovery_pass_without_overlap_pushes_everything() {
        let backend = MemBackend::new();
        let mut workload = Workload::new(spec());
        workload.populate(&backend).unwrap();

        let config = RecoveryConfig {
            osd_recover_clone_overlap: false,
            ..RecoveryConfig::default()
        };
        let stats = workload.recovery_pass(&config).unwrap();
        assert_eq!(stats.cloned_bytes, 0);
        assert_eq!(stats.pushed_bytes, stats.full_bytes);
    }

    #[test]
    fn test_scan_orders_whole_namespace() {
        let backend = MemBackend::new();
        let mut workload = Workload::new(spec());
        workload.populate(&backend).unwrap();

        let mut scan = workload.scan();
        assert!(scan.populated);
        assert!(scan.extends_to_end());
        assert_eq!(scan.objects.len(), backend.len());
        assert_eq!(&scan.begin, scan.objects.keys().next().unwrap());

        // Clones sort before their head
        let (first, _) = scan.pop_front().unwrap();
        assert!(!first.is_head());
        assert!(first < scan.begin);
    }

    #[test]
    fn test_recovery_pass_respects_backfill_boundary() {
        let backend = MemBackend::new();
        let mut done = Workload::new(WorkloadSpec {
            missing_ratio: 0.0,
            ..spec()
        });
        done.populate(&backend).unwrap();
        let finished = done.recovery_pass(&Config::default().recovery).unwrap();
        assert_eq!(finished.backfilled, backend.len() as u64);
        assert!(finished.cloned_bytes > 0);

        // Backfill has not started: no clone is available as a donor
        let backend = MemBackend::new();
        let mut fresh = Workload::new(WorkloadSpec {
            missing_ratio: 0.0,
            backfill_progress: 0.0,
            ..spec()
        });
        fresh.populate(&backend).unwrap();
        let stats = fresh.recovery_pass(&Config::default().recovery).unwrap();
        assert_eq!(stats.backfilled, 0);
        assert_eq!(stats.cloned_bytes, 0);
        assert_eq!(stats.pushed_bytes, stats.full_bytes);
        assert_eq!(stats.full_bytes, finished.full_bytes);
    }
}
