//! Device state tracked while a trace is replayed.
//!
//! [`SystemMetrics`] is the per-run engine context: it knows the current
//! frequency and load of every core and of the GPU, and owns every timeline
//! built from the trace (per-core utilization, GPU intervals, temperatures).
//! One instance belongs to exactly one analysis run.

pub mod cpu_util;
pub mod gpu;
pub mod profile;
pub mod temp;

use std::sync::mpsc::channel;

use tracing::debug;
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

use crate::config::{Config, Topology};
use crate::error::AnalysisError;
use crate::events::{CpuIdle, FreqChange, GpuUtil, Temperature};

pub use cpu_util::{compile_slices, CompiledUtil, CoreUtilTable, UtilSlice};
pub use gpu::{GpuInterval, GpuUtilTable};
pub use profile::{DomainProfile, EnergyProfile, Regression};
pub use temp::TempTable;

pub struct SystemMetrics {
    topology: Topology,
    profile: EnergyProfile,
    core_freqs: Vec<u64>,
    core_utils: Vec<f64>,
    gpu_freq: u64,
    gpu_util: f64,
    cores: Vec<CoreUtilTable>,
    gpu: GpuUtilTable,
    temps: TempTable,
    start: Option<u64>,
    end: u64,
}

impl SystemMetrics {
    pub fn new(config: &Config) -> Self {
        let topology = config.topology.clone();
        let profile = config.profile.clone();
        let cores = topology.core_count();

        let core_freqs = if config.initial.core_freqs.is_empty() {
            (0..cores)
                .map(|cpu| {
                    profile
                        .clusters
                        .get(topology.cluster_of(cpu))
                        .map_or(0, |c| c.max_freq())
                })
                .collect()
        } else {
            config.initial.core_freqs.clone()
        };
        let core_utils = if config.initial.core_utils.is_empty() {
            vec![0.0; cores]
        } else {
            config.initial.core_utils.clone()
        };
        let gpu_freq = if config.initial.gpu_freq == 0 {
            profile.gpu.min_freq()
        } else {
            config.initial.gpu_freq
        };
        let gpu_util = config.initial.gpu_util;

        Self {
            cores: (0..cores)
                .map(|cpu| CoreUtilTable::new(cpu, config.util_window_us))
                .collect(),
            gpu: GpuUtilTable::new(gpu_freq, gpu_util),
            temps: TempTable::new(),
            topology,
            profile,
            core_freqs,
            core_utils,
            gpu_freq,
            gpu_util,
            start: None,
            end: 0,
        }
    }

    /// Extend the observed time range to cover `ts`.
    pub fn observe(&mut self, ts: u64) {
        if self.start.is_none() {
            self.start = Some(ts);
            self.gpu.set_origin(ts);
        }
        self.end = self.end.max(ts);
    }

    /// A frequency change applies to every core of the target's cluster.
    pub fn on_freq_change(&mut self, event: &FreqChange) {
        let cluster = self.topology.cluster_of(event.target_cpu as usize);
        for cpu in self.topology.cores_of(cluster) {
            if let Some(freq) = self.core_freqs.get_mut(cpu) {
                *freq = event.freq;
            }
            if let Some(util) = self.core_utils.get_mut(cpu) {
                *util = event.util;
            }
        }
    }

    pub fn on_idle(&mut self, event: &CpuIdle) {
        let cpu = event.cpu as usize;
        let freq = self.core_freq(cpu);
        match self.cores.get_mut(cpu) {
            Some(table) => table.add_idle_event(event, freq),
            None => debug!("Ignoring idle event for unknown cpu {}", cpu),
        }
    }

    pub fn on_gpu_util(&mut self, event: &GpuUtil) {
        self.gpu_freq = event.freq;
        self.gpu_util = event.util;
        self.gpu.add_sample(event.ts, event.freq, event.util);
    }

    pub fn on_temperature(&mut self, event: &Temperature) {
        self.temps.push(*event);
    }

    pub fn core_freq(&self, cpu: usize) -> u64 {
        self.core_freqs.get(cpu).copied().unwrap_or(0)
    }

    pub fn core_util(&self, cpu: usize) -> f64 {
        self.core_utils.get(cpu).copied().unwrap_or(0.0)
    }

    /// Current frequency of every cluster, indexed by cluster.
    pub fn cluster_freqs(&self) -> Vec<u64> {
        (0..self.topology.clusters)
            .map(|cluster| self.core_freq(cluster * self.topology.cores_per_cluster))
            .collect()
    }

    pub fn gpu_freq(&self) -> u64 {
        self.gpu_freq
    }

    pub fn gpu_util(&self) -> f64 {
        self.gpu_util
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn profile(&self) -> &EnergyProfile {
        &self.profile
    }

    pub fn cores(&self) -> &[CoreUtilTable] {
        &self.cores
    }

    /// Compiled utilization of `cpu` at `ts`.
    pub fn util_at(&self, cpu: usize, ts: u64) -> f64 {
        self.cores.get(cpu).map_or(0.0, |c| c.get_util(ts))
    }

    pub fn gpu(&self) -> &GpuUtilTable {
        &self.gpu
    }

    pub fn temps(&self) -> &TempTable {
        &self.temps
    }

    /// First and last timestamps seen, if any event was observed.
    pub fn time_range(&self) -> Option<(u64, u64)> {
        self.start.map(|start| (start, self.end))
    }

    /// Close the GPU timeline and build the dense per-core utilization
    /// tables. Cores are compiled in parallel on `threads` workers; the result
    /// does not depend on the thread count.
    pub fn finish(&mut self, threads: usize) -> Result<(), AnalysisError> {
        let Some((start, end)) = self.time_range() else {
            return Ok(());
        };
        self.gpu.finish(end)?;

        let pool = Pool::<ThunkWorker<CompiledUtil>>::new(threads.max(1));
        let (tx, rx) = channel();
        for table in &self.cores {
            let core = table.core();
            let slices = table.slices().to_vec();
            pool.execute_to(
                tx.clone(),
                Thunk::of(move || compile_slices(core, &slices, start, end)),
            );
        }
        drop(tx);

        let mut compiled: Vec<CompiledUtil> = rx.iter().take(self.cores.len()).collect();
        compiled.sort_by_key(|c| c.core);
        for table in compiled {
            let core = table.core;
            if let Some(slot) = self.cores.get_mut(core) {
                slot.set_compiled(table);
            }
        }
        debug!(
            "Compiled {} utilization tables over {}us",
            self.cores.len(),
            end - start
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IDLE_EXIT_STATE;

    fn idle(ts: u64, cpu: u32, exit: bool) -> CpuIdle {
        CpuIdle {
            ts,
            cpu,
            state: if exit { IDLE_EXIT_STATE } else { 2 },
        }
    }

    #[test]
    fn test_initial_freqs_default_to_cluster_max() {
        let metrics = SystemMetrics::new(&Config::default());
        assert_eq!(metrics.core_freq(0), 1_400_000_000);
        assert_eq!(metrics.core_freq(7), 2_000_000_000);
        assert_eq!(metrics.cluster_freqs(), vec![1_400_000_000, 2_000_000_000]);
        assert_eq!(metrics.gpu_freq(), 177_000_000);
    }

    #[test]
    fn test_freq_change_updates_whole_cluster() {
        let mut metrics = SystemMetrics::new(&Config::default());
        metrics.on_freq_change(&FreqChange {
            ts: 10,
            cpu: 0,
            target_cpu: 5,
            freq: 800_000_000,
            util: 42.0,
        });
        for cpu in 4..8 {
            assert_eq!(metrics.core_freq(cpu), 800_000_000);
            assert_eq!(metrics.core_util(cpu), 42.0);
        }
        assert_eq!(metrics.core_freq(0), 1_400_000_000);
    }

    #[test]
    fn test_parallel_compile_matches_sequential() {
        let mut metrics = SystemMetrics::new(&Config::default());
        metrics.observe(0);
        for cpu in 0..8u32 {
            let offset = u64::from(cpu) * 50;
            metrics.on_idle(&idle(100 + offset, cpu, true));
            metrics.on_idle(&idle(400 + offset, cpu, false));
            metrics.on_idle(&idle(900, cpu, true));
        }
        metrics.observe(1_000);

        let mut sequential: Vec<CoreUtilTable> = metrics.cores().to_vec();
        for table in &mut sequential {
            table.compile(0, 1_000);
        }
        metrics.finish(3).unwrap();

        for (cpu, table) in sequential.iter().enumerate() {
            assert_eq!(metrics.cores()[cpu].compiled(), table.compiled());
        }
        assert!(metrics.util_at(0, 200) > 0.0);
    }

    #[test]
    fn test_finish_rejects_duplicate_gpu_samples() {
        let mut metrics = SystemMetrics::new(&Config::default());
        metrics.observe(0);
        for ts in [400, 400] {
            metrics.observe(ts);
            metrics.on_gpu_util(&GpuUtil {
                ts,
                freq: 600_000_000,
                util: 50.0,
            });
        }
        metrics.observe(1_000);
        assert_eq!(metrics.finish(2), Err(AnalysisError::ZeroDuration { ts: 400 }));
    }

    #[test]
    fn test_finish_without_events_is_noop() {
        let mut metrics = SystemMetrics::new(&Config::default());
        metrics.finish(2).unwrap();
        assert_eq!(metrics.time_range(), None);
        assert_eq!(metrics.util_at(0, 10), 0.0);
    }
}
