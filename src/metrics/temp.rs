//! Temperature timeline.

use serde::Serialize;

use crate::error::{AnalysisError, TempChannel};
use crate::events::Temperature;

/// Step-function timeline of thermal samples.
///
/// A sample holds from its timestamp until the next sample. Lookups before the
/// first sample return the first sample and lookups after the last sample return
/// the last one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TempTable {
    samples: Vec<Temperature>,
}

impl TempTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Samples must arrive in timestamp order.
    pub fn push(&mut self, sample: Temperature) {
        self.samples.push(sample);
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    fn sample_at(&self, ts: u64) -> Option<&Temperature> {
        let idx = self.samples.partition_point(|s| s.ts <= ts);
        self.samples.get(idx.saturating_sub(1))
    }

    /// Raw reading of `channel` at `ts`, or `None` with no samples.
    pub fn get(&self, ts: u64, channel: TempChannel) -> Option<u32> {
        let sample = self.sample_at(ts)?;
        Some(match channel {
            TempChannel::Little => sample.little(),
            TempChannel::Big(idx) => sample.big[idx % sample.big.len()],
            TempChannel::Gpu => sample.gpu,
        })
    }

    /// Reading used for energy integration; an absent or zero reading means the
    /// trace is broken.
    pub fn require(&self, ts: u64, channel: TempChannel) -> Result<f64, AnalysisError> {
        match self.get(ts, channel) {
            None => Err(AnalysisError::MissingTemperature { ts }),
            Some(0) => Err(AnalysisError::ZeroTemperature { ts, channel }),
            Some(temp) => Ok(f64::from(temp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64, big: u32, gpu: u32) -> Temperature {
        Temperature {
            ts,
            big: [big, big + 1, big + 2, big + 3],
            gpu,
        }
    }

    #[test]
    fn test_lookup_clamps_to_boundaries() {
        let mut table = TempTable::new();
        table.push(sample(100, 40, 30));
        table.push(sample(200, 50, 35));

        assert_eq!(table.get(0, TempChannel::Gpu), Some(30));
        assert_eq!(table.get(100, TempChannel::Gpu), Some(30));
        assert_eq!(table.get(199, TempChannel::Gpu), Some(30));
        assert_eq!(table.get(200, TempChannel::Gpu), Some(35));
        assert_eq!(table.get(10_000, TempChannel::Gpu), Some(35));
    }

    #[test]
    fn test_channels() {
        let mut table = TempTable::new();
        table.push(sample(0, 40, 30));
        assert_eq!(table.get(0, TempChannel::Big(0)), Some(40));
        assert_eq!(table.get(0, TempChannel::Big(3)), Some(43));
        // Big core 5 wraps onto sensor 1
        assert_eq!(table.get(0, TempChannel::Big(5)), Some(41));
        // (40 + 41 + 42 + 43) / 4
        assert_eq!(table.get(0, TempChannel::Little), Some(41));
    }

    #[test]
    fn test_require_rejects_missing_and_zero() {
        let mut table = TempTable::new();
        assert_eq!(
            table.require(5, TempChannel::Gpu),
            Err(AnalysisError::MissingTemperature { ts: 5 })
        );
        table.push(sample(0, 40, 0));
        assert_eq!(
            table.require(5, TempChannel::Gpu),
            Err(AnalysisError::ZeroTemperature {
                ts: 5,
                channel: TempChannel::Gpu
            })
        );
        assert_eq!(table.require(5, TempChannel::Big(0)), Ok(40.0));
    }
}
