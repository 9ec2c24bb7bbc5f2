//! Tasks and the links between them.

use std::fmt;

use serde::Serialize;

/// Microseconds to seconds.
pub(crate) const US_TO_S: f64 = 1e-6;

/// Address of a task: the branch it lives on and its position there.
///
/// Links between tasks are always expressed as `TaskRef`s and resolved through
/// the owning branch, so a link never keeps a task alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskRef {
    pub pid: u32,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    None,
    /// The task started because it was the destination of a binder transaction.
    Binder,
    /// The task continues the previous task of the same thread.
    Cyclic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub kind: DependencyKind,
    /// Task whose output this task consumes.
    pub prev: Option<TaskRef>,
    /// First task that consumes this task's output.
    pub next: Option<TaskRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A scheduled-in interval of the branch's thread.
    Execution,
    /// First half of a binder transaction, recorded on a binder thread branch.
    BinderSend,
    /// Second half of a binder transaction, recorded on a binder thread branch.
    BinderReceive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreEventKind {
    SwitchIn,
    SwitchOut,
    Binder,
}

/// A scheduling sample attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreEvent {
    pub kind: CoreEventKind,
    pub ts: u64,
    pub cpu: u32,
    pub cluster: usize,
    /// Estimated cycles spent; filled in on the switch-in sample when the task closes.
    pub cycles: f64,
    /// Frequency of every cluster when the sample was taken.
    pub cluster_freqs: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum OptimizationKind {
    #[serde(rename = "B2L_REALLOC")]
    B2lRealloc,
    #[serde(rename = "DVFS")]
    Dvfs,
    #[serde(rename = "SAME_CLUSTER_REALLOC")]
    SameClusterRealloc,
    #[serde(rename = "DVFS_AFTER_REALLOC")]
    DvfsAfterRealloc,
}

impl OptimizationKind {
    pub const ALL: [OptimizationKind; 4] = [
        OptimizationKind::B2lRealloc,
        OptimizationKind::Dvfs,
        OptimizationKind::SameClusterRealloc,
        OptimizationKind::DvfsAfterRealloc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationKind::B2lRealloc => "B2L_REALLOC",
            OptimizationKind::Dvfs => "DVFS",
            OptimizationKind::SameClusterRealloc => "SAME_CLUSTER_REALLOC",
            OptimizationKind::DvfsAfterRealloc => "DVFS_AFTER_REALLOC",
        }
    }

    /// Moves work to another core.
    pub fn is_realloc(&self) -> bool {
        matches!(
            self,
            OptimizationKind::B2lRealloc | OptimizationKind::SameClusterRealloc
        )
    }
}

impl fmt::Display for OptimizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationInfo {
    pub tags: Vec<OptimizationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OptimizationInfo {
    pub fn add(&mut self, kind: OptimizationKind) {
        if !self.tags.contains(&kind) {
            self.tags.push(kind);
        }
    }

    pub fn has(&self, kind: OptimizationKind) -> bool {
        self.tags.contains(&kind)
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl fmt::Display for OptimizationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.tags.iter().map(|t| t.as_str()).collect();
        write!(f, "{}", tags.join("|"))
    }
}

/// One contiguous interval of a thread on a CPU.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: u64,
    pub pid: u32,
    pub kind: TaskKind,
    pub start: u64,
    pub duration: u64,
    #[serde(skip)]
    pub open: bool,
    pub events: Vec<CoreEvent>,
    pub cycles: f64,
    /// Energy in joules per cluster.
    pub energy: Vec<f64>,
    pub optimization: OptimizationInfo,
    pub dependency: Dependency,
}

impl Task {
    pub fn new(id: u64, pid: u32, kind: TaskKind, first: CoreEvent) -> Self {
        let clusters = first.cluster_freqs.len();
        Self {
            id,
            pid,
            kind,
            start: first.ts,
            duration: 0,
            open: kind == TaskKind::Execution,
            events: vec![first],
            cycles: 0.0,
            energy: vec![0.0; clusters],
            optimization: OptimizationInfo::default(),
            dependency: Dependency::default(),
        }
    }

    pub fn finish(&self) -> u64 {
        self.start + self.duration
    }

    /// The sample the task started with.
    pub fn first_event(&self) -> &CoreEvent {
        &self.events[0]
    }

    pub fn cpu(&self) -> usize {
        self.first_event().cpu as usize
    }

    pub fn cluster(&self) -> usize {
        self.first_event().cluster
    }

    /// Frequency of `cluster` when the task started.
    pub fn start_freq(&self, cluster: usize) -> u64 {
        self.first_event()
            .cluster_freqs
            .get(cluster)
            .copied()
            .unwrap_or(0)
    }

    /// Finalize the task at `ts` and estimate its cycles from the frequency
    /// its cluster ran at when the task started.
    pub fn close(&mut self, ts: u64) {
        self.duration = ts.saturating_sub(self.start);
        self.open = false;
        let freq = self.start_freq(self.cluster());
        self.cycles = self.duration as f64 * US_TO_S * freq as f64;
        self.events[0].cycles = self.cycles;
    }

    pub fn total_energy(&self) -> f64 {
        self.energy.iter().sum()
    }
}
