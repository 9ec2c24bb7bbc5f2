//! Typed trace events consumed by the task graph engine.
//!
//! Events are produced in timestamp order by an ingestion stage (see
//! [`crate::ingest`]) and dispatched by [`crate::graph::ProcessTree::handle`].
//! All timestamps are microseconds on the trace clock.

use serde::{Deserialize, Serialize};

/// `cpu_idle` state value the kernel reports when a core leaves idle
/// (`PWR_EVENT_EXIT`).
pub const IDLE_EXIT_STATE: u32 = u32::MAX;

/// Binder transaction flag marking a one-way (asynchronous) call.
pub const TF_ONE_WAY: u32 = 0x01;

/// The three halves a binder transaction can show up as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinderKind {
    /// Synchronous call; a reply is expected later.
    Call,
    /// One-way call; no reply will follow.
    Async,
    /// Second half of a synchronous call.
    Reply,
}

impl BinderKind {
    /// Decode the kind from the raw `reply` and `flags` fields of a
    /// `binder_transaction` tracepoint.
    pub fn from_raw(reply: u32, flags: u32) -> Self {
        if reply != 0 {
            BinderKind::Reply
        } else if flags & TF_ONE_WAY != 0 {
            BinderKind::Async
        } else {
            BinderKind::Call
        }
    }
}

/// `sched_switch`: `pid` leaves the CPU and `next_pid` takes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedSwitch {
    pub ts: u64,
    pub cpu: u32,
    pub pid: u32,
    pub next_pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_state: Option<String>,
}

/// `cpu_idle`: a core enters an idle state or leaves idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuIdle {
    pub ts: u64,
    pub cpu: u32,
    pub state: u32,
}

impl CpuIdle {
    /// True when the core becomes active after this event.
    pub fn exits_idle(&self) -> bool {
        self.state == IDLE_EXIT_STATE
    }
}

/// `cpu_freq`: the cluster containing `target_cpu` changed frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreqChange {
    pub ts: u64,
    pub cpu: u32,
    pub target_cpu: u32,
    /// New frequency in Hz.
    pub freq: u64,
    #[serde(default)]
    pub util: f64,
}

/// `binder_transaction`, already classified into a [`BinderKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinderTransaction {
    pub ts: u64,
    pub cpu: u32,
    /// Sending thread.
    pub pid: u32,
    /// Destination thread, or destination process when no thread was named.
    pub target_pid: u32,
    pub kind: BinderKind,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub code: u32,
}

impl BinderTransaction {
    /// Build a transaction from raw tracepoint fields. `to_thread` is zero
    /// when the kernel has not picked a thread yet, in which case the target
    /// falls back to the destination process.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw(
        ts: u64,
        cpu: u32,
        pid: u32,
        reply: u32,
        flags: u32,
        code: u32,
        to_thread: u32,
        to_proc: u32,
    ) -> Self {
        let target_pid = if to_thread == 0 { to_proc } else { to_thread };
        Self {
            ts,
            cpu,
            pid,
            target_pid,
            kind: BinderKind::from_raw(reply, flags),
            flags,
            code,
        }
    }
}

/// `binder_transaction` with the tracepoint's own fields, before the kind and
/// destination are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBinderTransaction {
    pub ts: u64,
    pub cpu: u32,
    pub pid: u32,
    pub reply: u32,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub code: u32,
    pub to_proc: u32,
    #[serde(default)]
    pub to_thread: u32,
}

impl From<RawBinderTransaction> for BinderTransaction {
    fn from(raw: RawBinderTransaction) -> Self {
        BinderTransaction::from_raw(
            raw.ts,
            raw.cpu,
            raw.pid,
            raw.reply,
            raw.flags,
            raw.code,
            raw.to_thread,
            raw.to_proc,
        )
    }
}

/// Mali GPU utilization sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuUtil {
    pub ts: u64,
    /// GPU frequency in Hz.
    pub freq: u64,
    /// Load in percent.
    pub util: f64,
}

/// Exynos thermal sample: four big core sensors plus the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Temperature {
    pub ts: u64,
    pub big: [u32; 4],
    pub gpu: u32,
}

impl Temperature {
    /// The little cluster has no sensor of its own; it reads as the mean of
    /// the big sensors.
    pub fn little(&self) -> u32 {
        let sum: u64 = self.big.iter().map(|&t| u64::from(t)).sum();
        (sum / self.big.len() as u64) as u32
    }
}

/// One event of the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    SchedSwitch(SchedSwitch),
    CpuIdle(CpuIdle),
    FreqChange(FreqChange),
    Binder(BinderTransaction),
    GpuUtil(GpuUtil),
    Temperature(Temperature),
}

impl TraceEvent {
    pub fn ts(&self) -> u64 {
        match self {
            TraceEvent::SchedSwitch(e) => e.ts,
            TraceEvent::CpuIdle(e) => e.ts,
            TraceEvent::FreqChange(e) => e.ts,
            TraceEvent::Binder(e) => e.ts,
            TraceEvent::GpuUtil(e) => e.ts,
            TraceEvent::Temperature(e) => e.ts,
        }
    }
}

/// Number of events seen per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub sched_switch: u64,
    pub cpu_idle: u64,
    pub freq_change: u64,
    pub binder_transaction: u64,
    pub gpu_util: u64,
    pub temperature: u64,
}

impl EventCounts {
    pub fn record(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::SchedSwitch(_) => self.sched_switch += 1,
            TraceEvent::CpuIdle(_) => self.cpu_idle += 1,
            TraceEvent::FreqChange(_) => self.freq_change += 1,
            TraceEvent::Binder(_) => self.binder_transaction += 1,
            TraceEvent::GpuUtil(_) => self.gpu_util += 1,
            TraceEvent::Temperature(_) => self.temperature += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.sched_switch
            + self.cpu_idle
            + self.freq_change
            + self.binder_transaction
            + self.gpu_util
            + self.temperature
    }
}
