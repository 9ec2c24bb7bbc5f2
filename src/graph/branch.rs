//! Execution history of a single thread.

use serde::Serialize;
use tracing::trace;

use crate::error::{AnalysisError, TempChannel};
use crate::graph::task::{CoreEvent, CoreEventKind, Task, TaskKind};
use crate::metrics::SystemMetrics;
use crate::pid::PidRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchRole {
    App,
    System,
    Binder,
}

/// Ordered tasks of one PID. Task start times never decrease.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessBranch {
    pub record: PidRecord,
    pub role: BranchRole,
    tasks: Vec<Task>,
}

impl ProcessBranch {
    pub fn new(record: PidRecord, role: BranchRole) -> Self {
        Self {
            record,
            role,
            tasks: Vec::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.record.pid
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn task_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.tasks.get_mut(index)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Index of the newest task.
    pub fn last_index(&self) -> Option<usize> {
        self.tasks.len().checked_sub(1)
    }

    /// Start a new task. An open task is closed at `event.ts` first; the
    /// return value tells whether that happened.
    pub fn switch_in(&mut self, id: u64, event: CoreEvent) -> (usize, bool) {
        let implicit = match self.tasks.last_mut() {
            Some(last) if last.open => {
                last.close(event.ts);
                true
            }
            _ => false,
        };
        if implicit {
            trace!("pid {}: switch-in at {} closed an open task", self.pid(), event.ts);
        }
        let pid = self.pid();
        self.tasks
            .push(Task::new(id, pid, TaskKind::Execution, event));
        (self.tasks.len() - 1, implicit)
    }

    /// Close the running task, if any.
    pub fn switch_out(&mut self, event: CoreEvent) -> bool {
        match self.tasks.last_mut() {
            Some(last) if last.open => {
                last.close(event.ts);
                last.events.push(CoreEvent {
                    kind: CoreEventKind::SwitchOut,
                    ..event
                });
                true
            }
            _ => false,
        }
    }

    /// Record one half of a binder transaction. The zero-length task is placed
    /// after every task that started at or before it.
    pub fn add_binder_task(&mut self, id: u64, kind: TaskKind, event: CoreEvent) -> usize {
        let idx = self.tasks.partition_point(|t| t.start <= event.ts);
        let event = CoreEvent {
            kind: CoreEventKind::Binder,
            ..event
        };
        let pid = self.pid();
        self.tasks.insert(idx, Task::new(id, pid, kind, event));
        idx
    }

    /// Compute the energy of every closed execution task and return the
    /// branch total per cluster.
    pub fn compute_energy(&mut self, metrics: &SystemMetrics) -> Result<Vec<f64>, AnalysisError> {
        let clusters = metrics.topology().clusters;
        let mut total = vec![0.0; clusters];
        for task in &mut self.tasks {
            if task.kind != TaskKind::Execution || task.duration == 0 {
                continue;
            }
            let energy = task_energy(task, metrics)?;
            let cluster = task.cluster();
            task.energy = vec![0.0; clusters];
            if let Some(slot) = task.energy.get_mut(cluster) {
                *slot = energy;
            }
            for (sum, e) in total.iter_mut().zip(&task.energy) {
                *sum += e;
            }
        }
        Ok(total)
    }

    /// Time spent in execution tasks.
    pub fn busy_time(&self) -> u64 {
        self.tasks.iter().map(|t| t.duration).sum()
    }

    /// Energy per cluster of the tasks in `[lo, hi)`, prorated by overlap.
    pub fn energy_between(&self, lo: u64, hi: u64, clusters: usize) -> Vec<f64> {
        let mut out = vec![0.0; clusters];
        for task in &self.tasks {
            if task.duration == 0 || task.start >= hi {
                continue;
            }
            let overlap_lo = task.start.max(lo);
            let overlap_hi = task.finish().min(hi);
            if overlap_hi <= overlap_lo {
                continue;
            }
            let share = (overlap_hi - overlap_lo) as f64 / task.duration as f64;
            for (sum, e) in out.iter_mut().zip(&task.energy) {
                *sum += e * share;
            }
        }
        out
    }
}

/// Energy of one task: cycles times the per-cycle energy of its cluster at
/// the frequency, load and temperature it started with.
fn task_energy(task: &Task, metrics: &SystemMetrics) -> Result<f64, AnalysisError> {
    let topology = metrics.topology();
    let cluster = task.cluster();
    let freq = task.start_freq(cluster);
    if freq == 0 {
        return Err(AnalysisError::ZeroFrequency { ts: task.start });
    }
    let Some(domain) = metrics.profile().clusters.get(cluster) else {
        return Err(AnalysisError::UnknownFrequency {
            freq,
            domain: format!("cluster{cluster}"),
        });
    };

    let channel = if cluster == topology.little_cluster {
        TempChannel::Little
    } else {
        TempChannel::Big(task.cpu() % topology.cores_per_cluster)
    };
    let temp = metrics.temps().require(task.start, channel)?;
    let util = metrics.util_at(task.cpu(), task.start);

    Ok(domain.cycle_energy(freq, util, temp)? * task.cycles)
}
