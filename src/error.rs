//! Failure classes raised while building and evaluating a task graph.
//!
//! Two kinds of problems can show up in a trace:
//!
//! - Integrity violations ([`AnalysisError`]) mean the input itself is broken
//!   (events out of order, a zero temperature or frequency where energy has to
//!   be integrated). They abort the run.
//! - Anomalies ([`Diagnostics`]) are things a real capture routinely contains,
//!   such as a binder reply whose call happened before tracing started. They are
//!   counted and reported, and processing carries on.

use std::fmt;

use serde::Serialize;

/// Temperature sensor a lookup was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TempChannel {
    /// Mean of the big cluster sensors, used for the little cluster.
    Little,
    /// One of the big core sensors.
    Big(usize),
    Gpu,
}

impl fmt::Display for TempChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TempChannel::Little => write!(f, "little"),
            TempChannel::Big(idx) => write!(f, "big{idx}"),
            TempChannel::Gpu => write!(f, "gpu"),
        }
    }
}

/// Unrecoverable input errors.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// An event arrived with a timestamp earlier than the one before it.
    OutOfOrder { ts: u64, previous: u64 },
    /// An event names a CPU the configured topology does not have.
    UnknownCpu { ts: u64, cpu: u32 },
    /// A temperature sample of zero was hit while integrating energy.
    ZeroTemperature { ts: u64, channel: TempChannel },
    /// An interval with a frequency of zero was hit while integrating energy.
    ZeroFrequency { ts: u64 },
    /// Two GPU samples share a timestamp, leaving a zero-length interval.
    ZeroDuration { ts: u64 },
    /// Energy was requested but the trace carried no temperature samples.
    MissingTemperature { ts: u64 },
    /// The energy profile has no voltage for this frequency.
    UnknownFrequency { freq: u64, domain: String },
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::OutOfOrder { ts, previous } => {
                write!(
                    f,
                    "event at {ts}us arrived after an event at {previous}us; trace is not ordered"
                )
            }
            AnalysisError::UnknownCpu { ts, cpu } => {
                write!(f, "cpu {cpu} at {ts}us is outside the configured topology")
            }
            AnalysisError::ZeroTemperature { ts, channel } => {
                write!(f, "{channel} temperature is zero at {ts}us")
            }
            AnalysisError::ZeroFrequency { ts } => {
                write!(f, "frequency is zero for the interval starting at {ts}us")
            }
            AnalysisError::ZeroDuration { ts } => {
                write!(f, "GPU interval starting at {ts}us has zero duration")
            }
            AnalysisError::MissingTemperature { ts } => {
                write!(f, "no temperature samples recorded (queried at {ts}us)")
            }
            AnalysisError::UnknownFrequency { freq, domain } => {
                write!(f, "{domain}: no voltage known for {freq}Hz")
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Counters for anomalies that were recovered from locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Completed transactions dropped because a PID could not be resolved.
    pub unresolved_pids: u64,
    /// Replies that matched no pending call.
    pub unmatched_replies: u64,
    /// Pending calls evicted by the retention policy.
    pub evicted_pending: u64,
    /// Completed transactions evicted by the retention policy.
    pub evicted_completed: u64,
    /// Switch-ins that closed a task which had never been switched out.
    pub implicit_closes: u64,
}

impl Diagnostics {
    /// Sum of every anomaly counter.
    pub fn total(&self) -> u64 {
        self.unresolved_pids
            + self.unmatched_replies
            + self.evicted_pending
            + self.evicted_completed
            + self.implicit_closes
    }
}
