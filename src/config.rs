//! Run configuration.
//!
//! A [`Config`] is built once per analysis run, either with defaults that
//! describe an Exynos 5422 board or from the command line, and is then handed
//! to [`crate::analyze::analyze`].

use std::ops::Range;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::metrics::EnergyProfile;

/// Default bucket width for the optimization and energy timelines.
pub const DEFAULT_TIMELINE_INTERVAL_US: u64 = 50_000;

/// Default trailing window used to smooth per-core utilization.
pub const DEFAULT_UTIL_WINDOW_US: u64 = 25_000;

/// CPU layout: `clusters` clusters of `cores_per_cluster` cores each, numbered
/// contiguously from cluster 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub clusters: usize,
    pub cores_per_cluster: usize,
    /// Cluster index of the low-power cluster.
    pub little_cluster: usize,
    /// Cluster index of the high-performance cluster.
    pub big_cluster: usize,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            clusters: 2,
            cores_per_cluster: 4,
            little_cluster: 0,
            big_cluster: 1,
        }
    }
}

impl Topology {
    pub fn core_count(&self) -> usize {
        self.clusters * self.cores_per_cluster
    }

    pub fn cluster_of(&self, cpu: usize) -> usize {
        cpu / self.cores_per_cluster
    }

    pub fn cores_of(&self, cluster: usize) -> Range<usize> {
        let first = cluster * self.cores_per_cluster;
        first..first + self.cores_per_cluster
    }

    pub fn is_big(&self, cpu: usize) -> bool {
        self.cluster_of(cpu) == self.big_cluster
    }

    pub fn validate(&self) -> Result<()> {
        if self.clusters == 0 || self.cores_per_cluster == 0 {
            bail!("topology needs at least one cluster with at least one core");
        }
        if self.little_cluster >= self.clusters || self.big_cluster >= self.clusters {
            bail!(
                "little cluster {} / big cluster {} out of range for {} clusters",
                self.little_cluster,
                self.big_cluster,
                self.clusters
            );
        }
        if self.little_cluster == self.big_cluster {
            bail!("little and big cluster must differ");
        }
        Ok(())
    }
}

/// Bounds on how long unmatched binder halves are kept around.
///
/// Both queues drop their oldest entry once full; entries older than
/// `max_age_us` (relative to the event being handled) are dropped as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_pending: usize,
    pub max_completed: usize,
    pub max_age_us: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_pending: 4096,
            max_completed: 4096,
            max_age_us: Some(10_000_000),
        }
    }
}

/// Device state at the moment tracing started.
///
/// Frequencies are in Hz. Empty vectors mean "unknown": every core then starts
/// at its cluster's highest frequency with zero load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    #[serde(default)]
    pub core_freqs: Vec<u64>,
    #[serde(default)]
    pub core_utils: Vec<f64>,
    #[serde(default)]
    pub gpu_freq: u64,
    #[serde(default)]
    pub gpu_util: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub topology: Topology,
    /// Timeline bucket width in microseconds
    pub timeline_interval_us: u64,
    /// Trailing utilization window in microseconds
    pub util_window_us: u64,
    pub retention: RetentionPolicy,
    pub profile: EnergyProfile,
    pub initial: InitialState,
    /// Worker threads used to compile per-core utilization tables
    pub compile_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            topology: Topology::default(),
            timeline_interval_us: DEFAULT_TIMELINE_INTERVAL_US,
            util_window_us: DEFAULT_UTIL_WINDOW_US,
            retention: RetentionPolicy::default(),
            profile: EnergyProfile::default(),
            initial: InitialState::default(),
            compile_threads: 4,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.topology.validate()?;
        if self.profile.clusters.len() != self.topology.clusters {
            bail!(
                "energy profile describes {} clusters but the topology has {}",
                self.profile.clusters.len(),
                self.topology.clusters
            );
        }
        self.profile.validate()?;
        if self.timeline_interval_us == 0 {
            bail!("timeline interval must be non-zero");
        }
        if self.util_window_us == 0 {
            bail!("utilization window must be non-zero");
        }
        let cores = self.topology.core_count();
        if !self.initial.core_freqs.is_empty() && self.initial.core_freqs.len() != cores {
            bail!(
                "initial state lists {} core frequencies, expected {cores}",
                self.initial.core_freqs.len()
            );
        }
        if !self.initial.core_utils.is_empty() && self.initial.core_utils.len() != cores {
            bail!(
                "initial state lists {} core utilizations, expected {cores}",
                self.initial.core_utils.len()
            );
        }
        Ok(())
    }
}
