//! Per-core utilization reconstructed from `cpu_idle` toggles.
//!
//! While the trace is consumed every idle toggle closes a [`UtilSlice`] whose
//! utilization is the active share of a trailing window ending at that slice.
//! After the trace is complete the slices are expanded into a dense
//! per-microsecond array ([`CompiledUtil`]) for constant-time lookups.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::CpuIdle;

/// A span between two idle toggles on one core.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilSlice {
    pub start: u64,
    pub end: u64,
    /// Core frequency when the slice was closed.
    pub freq: u64,
    /// Whether the core was running (not idle) during the slice.
    pub active: bool,
    /// Trailing-window utilization in percent, rounded to two decimals.
    pub util: f64,
}

impl UtilSlice {
    pub fn duration(&self) -> u64 {
        self.end - self.start
    }
}

/// Dense utilization lookup for one core.
///
/// `values[i]` is the utilization at `start + i` microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledUtil {
    pub core: usize,
    pub start: u64,
    pub values: Vec<f32>,
}

impl CompiledUtil {
    /// Utilization at `ts`. Timestamps outside the compiled range read the
    /// nearest boundary value; an empty table reads 0.
    pub fn get_util(&self, ts: u64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let idx = ts.saturating_sub(self.start) as usize;
        let idx = idx.min(self.values.len() - 1);
        f64::from(self.values[idx])
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), self)
            .with_context(|| format!("Failed to write utilization table {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let table = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse utilization table {}", path.display()))?;
        Ok(table)
    }
}

/// Expand `slices` into a dense table covering `[start, end]`.
///
/// Cells before the first slice take the first slice's value and cells after
/// the last slice take the last slice's value.
pub fn compile_slices(core: usize, slices: &[UtilSlice], start: u64, end: u64) -> CompiledUtil {
    let (Some(first), Some(last)) = (slices.first(), slices.last()) else {
        return CompiledUtil {
            core,
            start,
            values: Vec::new(),
        };
    };

    let len = (end.saturating_sub(start) + 1) as usize;
    let offset = |ts: u64| (ts.saturating_sub(start) as usize).min(len);

    let mut values = vec![first.util as f32; len];
    for slice in slices {
        values[offset(slice.start)..offset(slice.end)].fill(slice.util as f32);
    }
    values[offset(last.end)..].fill(last.util as f32);

    CompiledUtil {
        core,
        start,
        values,
    }
}

/// Utilization history of a single core.
#[derive(Debug, Clone)]
pub struct CoreUtilTable {
    core: usize,
    window_us: u64,
    last_event: Option<u64>,
    active: bool,
    slices: Vec<UtilSlice>,
    compiled: CompiledUtil,
}

impl CoreUtilTable {
    pub fn new(core: usize, window_us: u64) -> Self {
        Self {
            core,
            window_us,
            last_event: None,
            active: false,
            slices: Vec::new(),
            compiled: CompiledUtil {
                core,
                ..CompiledUtil::default()
            },
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn slices(&self) -> &[UtilSlice] {
        &self.slices
    }

    /// Timestamp of the first idle toggle seen on this core.
    pub fn first_event(&self) -> Option<u64> {
        self.slices.first().map(|s| s.start).or(self.last_event)
    }

    /// End of the last closed slice.
    pub fn last_event(&self) -> Option<u64> {
        self.last_event
    }

    /// Record an idle toggle. `freq` is the core frequency at the toggle.
    pub fn add_idle_event(&mut self, event: &CpuIdle, freq: u64) {
        let Some(last) = self.last_event else {
            self.last_event = Some(event.ts);
            self.active = event.exits_idle();
            return;
        };

        self.slices.push(UtilSlice {
            start: last,
            end: event.ts,
            freq,
            active: self.active,
            util: 0.0,
        });
        self.calc_util_last_slice();

        self.last_event = Some(event.ts);
        self.active = event.exits_idle();
    }

    /// Walk back from the newest slice until the window is covered (or history
    /// runs out) and store the active share on the newest slice.
    fn calc_util_last_slice(&mut self) {
        let mut total = 0u64;
        let mut active = 0u64;
        for slice in self.slices.iter().rev() {
            total += slice.duration();
            if slice.active {
                active += slice.duration();
            }
            if total >= self.window_us {
                break;
            }
        }

        let prev = self
            .slices
            .len()
            .checked_sub(2)
            .map(|idx| self.slices[idx].util)
            .unwrap_or(0.0);
        let util = if total == 0 {
            prev
        } else {
            let pct = active as f64 / total as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };
        if let Some(slice) = self.slices.last_mut() {
            slice.util = util;
        }
    }

    pub fn compile(&mut self, start: u64, end: u64) {
        self.compiled = compile_slices(self.core, &self.slices, start, end);
    }

    pub fn set_compiled(&mut self, compiled: CompiledUtil) {
        self.compiled = compiled;
    }

    pub fn compiled(&self) -> &CompiledUtil {
        &self.compiled
    }

    pub fn get_util(&self, ts: u64) -> f64 {
        self.compiled.get_util(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::IDLE_EXIT_STATE;

    const FREQ: u64 = 1_000_000_000;

    fn enter(ts: u64) -> CpuIdle {
        CpuIdle {
            ts,
            cpu: 0,
            state: 1,
        }
    }

    fn exit(ts: u64) -> CpuIdle {
        CpuIdle {
            ts,
            cpu: 0,
            state: IDLE_EXIT_STATE,
        }
    }

    #[test]
    fn test_first_event_only_sets_state() {
        let mut table = CoreUtilTable::new(0, 25_000);
        table.add_idle_event(&enter(1_000), FREQ);
        assert!(table.slices().is_empty());
        assert_eq!(table.first_event(), Some(1_000));
    }

    #[test]
    fn test_single_prior_interval_drives_util() {
        // Idle for 300ms then wake up: the only history is one idle interval,
        // longer than the window, so the sample is 0%.
        let mut table = CoreUtilTable::new(0, 25_000);
        table.add_idle_event(&enter(1_000), FREQ);
        table.add_idle_event(&exit(301_000), FREQ);
        assert_eq!(table.slices().len(), 1);
        assert!(!table.slices()[0].active);
        assert_eq!(table.slices()[0].util, 0.0);

        // Run for 100ms: window covered by the active slice alone
        table.add_idle_event(&enter(401_000), FREQ);
        assert!(table.slices()[1].active);
        assert_eq!(table.slices()[1].util, 100.0);
    }

    #[test]
    fn test_short_history_uses_everything_available() {
        let mut table = CoreUtilTable::new(0, 25_000);
        table.add_idle_event(&exit(0), FREQ);
        table.add_idle_event(&enter(3_000), FREQ); // active 3ms
        table.add_idle_event(&exit(4_000), FREQ); // idle 1ms
        // 3000 active out of 4000 total
        assert_eq!(table.slices()[1].util, 75.0);
    }

    #[test]
    fn test_window_stops_once_covered() {
        let mut table = CoreUtilTable::new(0, 25_000);
        table.add_idle_event(&exit(0), FREQ);
        table.add_idle_event(&enter(100_000), FREQ); // active 100ms
        table.add_idle_event(&exit(110_000), FREQ); // idle 10ms
        table.add_idle_event(&enter(130_000), FREQ); // active 20ms
        // 20ms + 10ms covers the 25ms window; the 100ms slice is not visited
        let util = table.slices()[2].util;
        assert_eq!(util, 66.67);
    }

    #[test]
    fn test_compile_and_clamp() {
        let mut table = CoreUtilTable::new(0, 25_000);
        table.add_idle_event(&exit(100), FREQ);
        table.add_idle_event(&enter(200), FREQ); // [100, 200) active -> 100%
        table.add_idle_event(&exit(300), FREQ); // [200, 300) idle -> 50%
        table.compile(50, 400);

        assert_eq!(table.get_util(0), 100.0);
        assert_eq!(table.get_util(50), 100.0);
        assert_eq!(table.get_util(150), 100.0);
        assert_eq!(table.get_util(199), 100.0);
        assert_eq!(table.get_util(200), 50.0);
        assert_eq!(table.get_util(299), 50.0);
        assert_eq!(table.get_util(350), 50.0);
        assert_eq!(table.get_util(1_000_000), 50.0);
    }

    #[test]
    fn test_empty_table_reads_zero() {
        let mut table = CoreUtilTable::new(3, 25_000);
        table.compile(0, 100);
        assert_eq!(table.get_util(10), 0.0);
        assert_eq!(table.compiled().core, 3);
    }

    #[test]
    fn test_compiled_json_roundtrip() {
        let mut table = CoreUtilTable::new(1, 25_000);
        table.add_idle_event(&exit(10), FREQ);
        table.add_idle_event(&enter(40), FREQ);
        table.add_idle_event(&exit(100), FREQ);
        table.add_idle_event(&enter(130), FREQ);
        table.compile(0, 150);

        let json = serde_json::to_string(table.compiled()).unwrap();
        let reloaded: CompiledUtil = serde_json::from_str(&json).unwrap();
        for ts in 0..200 {
            assert_eq!(reloaded.get_util(ts), table.get_util(ts), "ts {ts}");
        }
    }
}
