//! GPU frequency/utilization timeline and GPU energy integration.

use serde::Serialize;

use crate::error::{AnalysisError, TempChannel};
use crate::metrics::{DomainProfile, TempTable};

/// Microseconds to seconds.
const US_TO_S: f64 = 1e-6;

/// A span of time during which the GPU ran at one frequency and load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpuInterval {
    pub start: u64,
    pub end: u64,
    pub freq: u64,
    pub util: f64,
}

impl GpuInterval {
    pub fn duration(&self) -> u64 {
        self.end - self.start
    }
}

/// GPU state over the trace, built from utilization samples.
///
/// Every sample closes the interval that began at the previous sample (or at
/// the trace origin) with the state that was current until then.
#[derive(Debug, Clone, Serialize)]
pub struct GpuUtilTable {
    origin: Option<u64>,
    last_ts: u64,
    current_freq: u64,
    current_util: f64,
    intervals: Vec<GpuInterval>,
}

impl GpuUtilTable {
    pub fn new(freq: u64, util: f64) -> Self {
        Self {
            origin: None,
            last_ts: 0,
            current_freq: freq,
            current_util: util,
            intervals: Vec::new(),
        }
    }

    /// Anchor the table at the first timestamp of the trace.
    pub fn set_origin(&mut self, ts: u64) {
        if self.origin.is_none() {
            self.origin = Some(ts);
            self.last_ts = ts;
        }
    }

    pub fn add_sample(&mut self, ts: u64, freq: u64, util: f64) {
        match self.origin {
            None => self.set_origin(ts),
            Some(origin) if ts == origin && self.intervals.is_empty() => {}
            Some(_) => self.intervals.push(GpuInterval {
                start: self.last_ts,
                end: ts,
                freq: self.current_freq,
                util: self.current_util,
            }),
        }
        self.last_ts = ts;
        self.current_freq = freq;
        self.current_util = util;
    }

    /// Close the open interval at the end of the trace. Two samples at the
    /// same timestamp leave a zero-length interval behind, which makes the
    /// whole table unusable for integration.
    pub fn finish(&mut self, end: u64) -> Result<(), AnalysisError> {
        if self.origin.is_some() && end > self.last_ts {
            self.intervals.push(GpuInterval {
                start: self.last_ts,
                end,
                freq: self.current_freq,
                util: self.current_util,
            });
            self.last_ts = end;
        }
        match self.intervals.iter().find(|iv| iv.start == iv.end) {
            Some(iv) => Err(AnalysisError::ZeroDuration { ts: iv.start }),
            None => Ok(()),
        }
    }

    pub fn intervals(&self) -> &[GpuInterval] {
        &self.intervals
    }

    fn interval_at(&self, ts: u64) -> Option<&GpuInterval> {
        let idx = self.intervals.partition_point(|iv| iv.end <= ts);
        self.intervals
            .get(idx)
            .or_else(|| self.intervals.last())
    }

    /// GPU load at `ts`, clamped to the recorded range.
    pub fn get_util(&self, ts: u64) -> f64 {
        self.interval_at(ts)
            .map(|iv| iv.util)
            .unwrap_or(self.current_util)
    }

    /// GPU frequency at `ts`, clamped to the recorded range.
    pub fn get_freq(&self, ts: u64) -> u64 {
        self.interval_at(ts)
            .map(|iv| iv.freq)
            .unwrap_or(self.current_freq)
    }

    /// Energy in joules consumed by the GPU in `[start, end)`.
    ///
    /// Intervals that straddle a boundary contribute only their overlapping
    /// part, so the integral over a range equals the sum over any split of it.
    pub fn energy(
        &self,
        start: u64,
        end: u64,
        temps: &TempTable,
        profile: &DomainProfile,
    ) -> Result<f64, AnalysisError> {
        let mut energy = 0.0;
        for iv in &self.intervals {
            if iv.start >= end {
                break;
            }
            let lo = iv.start.max(start);
            let hi = iv.end.min(end);
            if hi <= lo {
                continue;
            }
            if iv.freq == 0 {
                return Err(AnalysisError::ZeroFrequency { ts: iv.start });
            }

            let temp = temps.require(iv.start, TempChannel::Gpu)?;
            let cycle_energy = profile.cycle_energy(iv.freq, iv.util, temp)?;
            let cycles = (hi - lo) as f64 * US_TO_S * iv.freq as f64;
            energy += cycle_energy * cycles;
        }
        Ok(energy)
    }
}
