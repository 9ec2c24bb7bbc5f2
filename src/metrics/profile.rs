//! Hardware energy model.
//!
//! Every frequency domain (each CPU cluster and the GPU) is described by its
//! operating points and a three-term regression fitted against measured power:
//!
//! ```text
//! E_cycle = V * (a1 * V * f * util + a2 * T + a3) / f
//! ```
//!
//! with `V` in volts, `f` in Hz, `util` in percent and `T` in degrees Celsius.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Fitted coefficients of the per-cycle energy regression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
}

impl Regression {
    /// Energy in joules spent by a single cycle.
    pub fn cycle_energy(&self, voltage: f64, freq: f64, util: f64, temp: f64) -> f64 {
        voltage * (self.a1 * voltage * freq * util + self.a2 * temp + self.a3) / freq
    }
}

/// Operating points and regression for one frequency domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainProfile {
    pub name: String,
    /// Available frequencies in Hz, ascending.
    pub freqs: Vec<u64>,
    /// Supply voltage for each entry of `freqs`.
    pub voltages: Vec<f64>,
    pub regression: Regression,
}

impl DomainProfile {
    pub fn min_freq(&self) -> u64 {
        self.freqs.first().copied().unwrap_or(0)
    }

    pub fn max_freq(&self) -> u64 {
        self.freqs.last().copied().unwrap_or(0)
    }

    /// Operating points strictly below `freq`, ascending.
    pub fn freqs_below(&self, freq: u64) -> &[u64] {
        let idx = self.freqs.partition_point(|&f| f < freq);
        &self.freqs[..idx]
    }

    /// Voltage of the lowest operating point that is at least `freq`.
    ///
    /// Governors occasionally report a frequency between two table entries;
    /// the part then runs at the next higher point's voltage.
    pub fn voltage(&self, freq: u64) -> Result<f64, AnalysisError> {
        let idx = self.freqs.partition_point(|&f| f < freq);
        if freq == 0 || idx == self.freqs.len() {
            return Err(AnalysisError::UnknownFrequency {
                freq,
                domain: self.name.clone(),
            });
        }
        Ok(self.voltages[idx])
    }

    /// Energy of one cycle at `freq` with `util` percent load and temperature `temp`.
    pub fn cycle_energy(&self, freq: u64, util: f64, temp: f64) -> Result<f64, AnalysisError> {
        let voltage = self.voltage(freq)?;
        Ok(self
            .regression
            .cycle_energy(voltage, freq as f64, util, temp))
    }

    fn validate(&self) -> Result<()> {
        if self.freqs.is_empty() {
            bail!("{}: no operating points", self.name);
        }
        if self.freqs.len() != self.voltages.len() {
            bail!(
                "{}: {} frequencies but {} voltages",
                self.name,
                self.freqs.len(),
                self.voltages.len()
            );
        }
        if self.freqs[0] == 0 {
            bail!("{}: zero frequency in operating points", self.name);
        }
        if self.freqs.windows(2).any(|w| w[0] >= w[1]) {
            bail!("{}: frequencies must be strictly ascending", self.name);
        }
        Ok(())
    }
}

/// Complete energy model of a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyProfile {
    /// One entry per CPU cluster, indexed like [`crate::config::Topology`].
    pub clusters: Vec<DomainProfile>,
    pub gpu: DomainProfile,
    /// Extra cycles a task needs after moving from a big to a little core.
    pub migration_factor: f64,
}

fn mhz(freqs: &[u64]) -> Vec<u64> {
    freqs.iter().map(|f| f * 1_000_000).collect()
}

/// Voltages rising by `step_mv` from `start_mv`, in volts.
fn ramp(start_mv: u32, step_mv: u32, n: usize) -> Vec<f64> {
    (0..n as u32)
        .map(|i| f64::from(start_mv + step_mv * i) / 1000.0)
        .collect()
}

impl EnergyProfile {
    /// Odroid XU3 (Exynos 5422): Cortex-A7 little cluster, Cortex-A15 big
    /// cluster and a Mali-T628 GPU.
    pub fn xu3() -> Self {
        let little: Vec<u64> = (2..=14).map(|x| x * 100).collect();
        let big: Vec<u64> = (2..=20).map(|x| x * 100).collect();
        Self {
            clusters: vec![
                DomainProfile {
                    name: "little".to_string(),
                    voltages: ramp(900, 25, little.len()),
                    freqs: mhz(&little),
                    regression: Regression {
                        a1: 1.0e-12,
                        a2: 3.0e-4,
                        a3: 0.01,
                    },
                },
                DomainProfile {
                    name: "big".to_string(),
                    voltages: ramp(900, 25, big.len()),
                    freqs: mhz(&big),
                    regression: Regression {
                        a1: 3.3e-12,
                        a2: 2.0e-3,
                        a3: 0.05,
                    },
                },
            ],
            gpu: DomainProfile {
                name: "gpu".to_string(),
                freqs: mhz(&[177, 266, 350, 420, 480, 543, 600]),
                voltages: vec![0.8125, 0.8625, 0.9125, 0.9625, 1.0, 1.0375, 1.075],
                regression: Regression {
                    a1: 1.15e-11,
                    a2: 1.0e-3,
                    a3: 0.03,
                },
            },
            migration_factor: 1.3,
        }
    }

    /// Load a profile from a JSON file.
    pub fn from_json(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read energy profile {}", path.display()))?;
        let profile: EnergyProfile = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse energy profile {}", path.display()))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        for cluster in &self.clusters {
            cluster.validate()?;
        }
        self.gpu.validate()?;
        if self.migration_factor <= 0.0 {
            bail!("migration factor must be positive");
        }
        Ok(())
    }
}

impl Default for EnergyProfile {
    fn default() -> Self {
        Self::xu3()
    }
}
