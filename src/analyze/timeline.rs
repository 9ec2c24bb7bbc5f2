//! Fixed-width buckets over the analyzed time range.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{AnalysisError, TempChannel};
use crate::graph::{OptimizationKind, ProcessBranch};
use crate::metrics::SystemMetrics;

/// `[start, finish]` cut into `interval_us` wide buckets. The bucket count is
/// the rounded number of whole intervals plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    pub start: u64,
    pub finish: u64,
    pub interval_us: u64,
    pub intervals: usize,
}

impl Timeline {
    pub fn new(start: u64, finish: u64, interval_us: u64) -> Self {
        let duration = finish.saturating_sub(start) as f64;
        let intervals = (duration / interval_us as f64).round() as usize + 1;
        Self {
            start,
            finish,
            interval_us,
            intervals,
        }
    }

    /// `[lo, hi)` of bucket `index`, cut off at `finish`. Buckets past the
    /// end are empty.
    pub fn bounds(&self, index: usize) -> (u64, u64) {
        let lo = self.start + index as u64 * self.interval_us;
        let hi = (lo + self.interval_us).min(self.finish);
        (lo, hi.max(lo))
    }

    pub fn bucket_of(&self, ts: u64) -> usize {
        let idx = ts.saturating_sub(self.start) / self.interval_us;
        (idx as usize).min(self.intervals - 1)
    }

    fn offset_s(&self, index: usize) -> f64 {
        (index as u64 * self.interval_us) as f64 * 1e-6
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationBucket {
    pub ts: u64,
    pub offset_s: f64,
    pub dvfs: u64,
    pub realloc: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizationTimeline {
    pub buckets: Vec<OptimizationBucket>,
    pub total_dvfs: u64,
    pub total_realloc: u64,
    pub total: u64,
}

/// Tasks with findings, bucketed by start time. A task counts at most once
/// per column.
pub fn optimization_timeline(
    timeline: &Timeline,
    branches: &BTreeMap<u32, ProcessBranch>,
) -> OptimizationTimeline {
    let mut buckets: Vec<OptimizationBucket> = (0..timeline.intervals)
        .map(|i| OptimizationBucket {
            ts: timeline.bounds(i).0,
            offset_s: timeline.offset_s(i),
            dvfs: 0,
            realloc: 0,
            total: 0,
        })
        .collect();

    for task in branches.values().flat_map(|b| b.tasks()) {
        let info = &task.optimization;
        if info.is_empty() {
            continue;
        }
        let bucket = &mut buckets[timeline.bucket_of(task.start)];
        if info.tags.iter().any(|t| t.is_realloc()) {
            bucket.realloc += 1;
        }
        if info.has(OptimizationKind::Dvfs) || info.has(OptimizationKind::DvfsAfterRealloc) {
            bucket.dvfs += 1;
        }
    }

    let mut out = OptimizationTimeline::default();
    for bucket in &mut buckets {
        bucket.total = bucket.dvfs + bucket.realloc;
        out.total_dvfs += bucket.dvfs;
        out.total_realloc += bucket.realloc;
    }
    out.total = out.total_dvfs + out.total_realloc;
    out.buckets = buckets;
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyBucket {
    pub ts: u64,
    pub offset_s: f64,
    /// Thread energy per CPU cluster.
    pub cluster_energy: Vec<f64>,
    pub thread_energy: f64,
    pub gpu_energy: f64,
    pub total_energy: f64,
    pub temp_big: Option<u32>,
    pub temp_little: Option<u32>,
    pub temp_gpu: Option<u32>,
    pub gpu_util: f64,
    pub gpu_freq: u64,
}

pub fn energy_timeline(
    timeline: &Timeline,
    branches: &BTreeMap<u32, ProcessBranch>,
    metrics: &SystemMetrics,
) -> Result<Vec<EnergyBucket>, AnalysisError> {
    let clusters = metrics.topology().clusters;
    let big_core = metrics.topology().big_cluster * metrics.topology().cores_per_cluster;
    let temps = metrics.temps();
    let gpu = metrics.gpu();

    let mut out = Vec::with_capacity(timeline.intervals);
    for i in 0..timeline.intervals {
        let (lo, hi) = timeline.bounds(i);

        let mut cluster_energy = vec![0.0; clusters];
        for branch in branches.values() {
            for (sum, e) in cluster_energy
                .iter_mut()
                .zip(branch.energy_between(lo, hi, clusters))
            {
                *sum += e;
            }
        }
        let thread_energy: f64 = cluster_energy.iter().sum();
        let gpu_energy = if hi > lo {
            gpu.energy(lo, hi, temps, &metrics.profile().gpu)?
        } else {
            0.0
        };

        out.push(EnergyBucket {
            ts: lo,
            offset_s: timeline.offset_s(i),
            cluster_energy,
            thread_energy,
            gpu_energy,
            total_energy: thread_energy + gpu_energy,
            temp_big: temps.get(lo, TempChannel::Big(big_core)),
            temp_little: temps.get(lo, TempChannel::Little),
            temp_gpu: temps.get(lo, TempChannel::Gpu),
            gpu_util: gpu.get_util(lo),
            gpu_freq: gpu.get_freq(lo),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_count_rounds_then_adds_one() {
        assert_eq!(Timeline::new(0, 0, 50_000).intervals, 1);
        assert_eq!(Timeline::new(0, 100_000, 50_000).intervals, 3);
        // 2.4 intervals round down
        assert_eq!(Timeline::new(0, 120_000, 50_000).intervals, 3);
        // 2.6 intervals round up
        assert_eq!(Timeline::new(0, 130_000, 50_000).intervals, 4);
    }

    #[test]
    fn test_bounds_are_cut_at_finish() {
        let t = Timeline::new(1_000, 131_000, 50_000);
        assert_eq!(t.bounds(0), (1_000, 51_000));
        assert_eq!(t.bounds(2), (101_000, 131_000));
        assert_eq!(t.bounds(3), (151_000, 151_000));
    }

    #[test]
    fn test_bucket_of_clamps() {
        let t = Timeline::new(1_000, 101_000, 50_000);
        assert_eq!(t.bucket_of(0), 0);
        assert_eq!(t.bucket_of(51_000), 1);
        assert_eq!(t.bucket_of(10_000_000), t.intervals - 1);
    }
}
