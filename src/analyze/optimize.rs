//! Per-task search for cheaper placements.
//!
//! Two independent checks run on every task that did measurable work:
//!
//! - big to little: could the task have run on the least loaded little core,
//!   at some little frequency, without overloading the little cluster and
//!   still finish before the task that depends on it starts?
//! - same cluster: could the task's own cluster have run at a lower
//!   frequency, possibly after moving the task to the least loaded sibling?
//!
//! Frequencies are tried lowest first and the first feasible one is taken.

use serde::Serialize;
use tracing::trace;

use crate::graph::{OptimizationInfo, OptimizationKind, Task, TaskGraph, TaskKind, TaskRef};
use crate::metrics::SystemMetrics;

/// Number of findings per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationCounts {
    pub b2l_realloc: u64,
    pub dvfs: u64,
    pub same_cluster_realloc: u64,
    pub dvfs_after_realloc: u64,
}

impl OptimizationCounts {
    pub fn add(&mut self, kind: OptimizationKind) {
        match kind {
            OptimizationKind::B2lRealloc => self.b2l_realloc += 1,
            OptimizationKind::Dvfs => self.dvfs += 1,
            OptimizationKind::SameClusterRealloc => self.same_cluster_realloc += 1,
            OptimizationKind::DvfsAfterRealloc => self.dvfs_after_realloc += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.b2l_realloc + self.dvfs + self.same_cluster_realloc + self.dvfs_after_realloc
    }
}

/// One feasible change found for a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRecord {
    pub op_id: u64,
    pub task_id: u64,
    pub pid: u32,
    pub name: String,
    pub ts: u64,
    pub duration: u64,
    pub core: usize,
    pub freq: u64,
    pub new_core: usize,
    pub new_core_old_freq: u64,
    pub new_freq: u64,
    pub core_util: f64,
    pub new_core_prev_util: f64,
    pub new_core_new_util: f64,
    pub tags: Vec<OptimizationKind>,
}

#[derive(Debug, Default)]
pub struct Evaluation {
    pub info: OptimizationInfo,
    pub records: Vec<OptimizationRecord>,
}

/// Index of the first smallest value.
fn argmin(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b <= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

fn blank_record(task: &Task, name: &str) -> OptimizationRecord {
    OptimizationRecord {
        op_id: 0,
        task_id: task.id,
        pid: task.pid,
        name: name.to_string(),
        ts: task.start,
        duration: task.duration,
        core: task.cpu(),
        freq: task.start_freq(task.cluster()),
        new_core: task.cpu(),
        new_core_old_freq: 0,
        new_freq: 0,
        core_util: 0.0,
        new_core_prev_util: 0.0,
        new_core_new_util: 0.0,
        tags: Vec::new(),
    }
}

/// Run both checks on `task`. `deadline` is the start of the first task that
/// depends on this one, and `window_us` the utilization window used to turn a
/// duration into a load percentage.
pub fn evaluate(
    task: &Task,
    name: &str,
    deadline: Option<u64>,
    metrics: &SystemMetrics,
    window_us: u64,
) -> Evaluation {
    let mut eval = Evaluation::default();
    let topology = metrics.topology();
    if task.cpu() >= topology.core_count() || task.cycles <= 0.0 {
        return eval;
    }

    let mut utils: Vec<f64> = (0..topology.core_count())
        .map(|cpu| metrics.util_at(cpu, task.finish()))
        .collect();

    if topology.is_big(task.cpu()) {
        if let Some(deadline) = deadline {
            if let Some(mut record) = big_to_little(task, name, deadline, &utils, metrics, window_us)
            {
                eval.info.add(OptimizationKind::B2lRealloc);
                if record.new_freq != record.new_core_old_freq {
                    eval.info.add(OptimizationKind::DvfsAfterRealloc);
                }
                eval.info.set_message("Task can be reallocated");
                record.tags = eval.info.tags.clone();
                eval.records.push(record);
            }
        }
    }

    same_cluster(task, name, &mut utils, metrics, window_us, &mut eval);
    eval
}

fn big_to_little(
    task: &Task,
    name: &str,
    deadline: u64,
    utils: &[f64],
    metrics: &SystemMetrics,
    window_us: u64,
) -> Option<OptimizationRecord> {
    let topology = metrics.topology();
    let profile = metrics.profile();
    let little = topology.little_cluster;
    let domain = profile.clusters.get(little)?;
    let cores = topology.cores_of(little);
    let little_utils = utils.get(cores.clone())?;
    let target = argmin(little_utils)?;

    let cur_freq = task.start_freq(little);
    if cur_freq == 0 {
        return None;
    }
    let cycles = (task.cycles * profile.migration_factor).round();

    for &freq in &domain.freqs {
        let f = freq as f64;
        let scaled: Vec<f64> = little_utils
            .iter()
            .map(|u| u * cur_freq as f64 / f)
            .collect();
        let added = cycles / f * 1e6 / window_us as f64 * 100.0;
        let new_util = scaled[target] + added;
        if new_util > 100.0 || scaled.iter().any(|u| *u > 100.0) {
            continue;
        }

        let available = (1.0 - scaled[target] / 100.0) * f;
        if available <= 0.0 {
            continue;
        }
        let finish = task.start + (cycles / available * 1e6).round() as u64;
        if finish >= deadline {
            trace!(
                "task {}: little core {} at {} finishes at {} after deadline {}",
                task.id,
                cores.start + target,
                freq,
                finish,
                deadline
            );
            continue;
        }

        return Some(OptimizationRecord {
            new_core: cores.start + target,
            new_core_old_freq: cur_freq,
            new_freq: freq,
            core_util: utils[task.cpu()],
            new_core_prev_util: little_utils[target],
            new_core_new_util: new_util,
            ..blank_record(task, name)
        });
    }
    None
}

fn same_cluster(
    task: &Task,
    name: &str,
    utils: &mut [f64],
    metrics: &SystemMetrics,
    window_us: u64,
    eval: &mut Evaluation,
) {
    let topology = metrics.topology();
    let cluster = task.cluster();
    let Some(domain) = metrics.profile().clusters.get(cluster) else {
        return;
    };
    let cur_freq = task.start_freq(cluster);
    if cur_freq == 0 || cur_freq == domain.min_freq() {
        return;
    }

    let cores = topology.cores_of(cluster);
    let cpu = task.cpu();
    let Some(lowest) = utils.get(cores.clone()).and_then(argmin) else {
        return;
    };
    let lowest = cores.start + lowest;

    let cur_util = utils[cpu];
    let mut target_util = cur_util;
    if lowest != cpu {
        target_util = utils[lowest];
        let load = task.duration as f64 / window_us as f64 * 100.0;
        if cur_util - load > target_util + load {
            utils[cpu] -= load;
            utils[lowest] += load;
            eval.info.add(OptimizationKind::SameClusterRealloc);
        }
    }

    for &freq in domain.freqs_below(cur_freq) {
        let scale = cur_freq as f64 / freq as f64;
        let scaled: Vec<f64> = utils[cores.clone()].iter().map(|u| u * scale).collect();
        if scaled.iter().all(|u| *u <= 100.0) {
            eval.info.set_message("DVFS optimization possible");
            eval.info.add(OptimizationKind::Dvfs);
            eval.records.push(OptimizationRecord {
                new_core: lowest,
                new_core_old_freq: cur_freq,
                new_freq: freq,
                core_util: cur_util,
                new_core_prev_util: target_util,
                new_core_new_util: scaled[lowest - cores.start],
                tags: eval.info.tags.clone(),
                ..blank_record(task, name)
            });
            break;
        }
    }
}

/// Evaluate every execution task of the graph, store the findings on the
/// tasks and return the totals plus one record per finding.
pub fn optimize(graph: &mut TaskGraph, window_us: u64) -> (OptimizationCounts, Vec<OptimizationRecord>) {
    let mut found: Vec<(TaskRef, Evaluation)> = Vec::new();
    for (pid, branch) in &graph.branches {
        for (index, task) in branch.tasks().iter().enumerate() {
            if task.kind != TaskKind::Execution || task.cycles <= 0.0 {
                continue;
            }
            let deadline = task
                .dependency
                .next
                .and_then(|next| graph.task(next))
                .map(|next| next.start);
            let eval = evaluate(
                task,
                &branch.record.thread_name,
                deadline,
                &graph.metrics,
                window_us,
            );
            if !eval.info.is_empty() {
                found.push((TaskRef { pid: *pid, index }, eval));
            }
        }
    }

    let mut counts = OptimizationCounts::default();
    let mut records = Vec::new();
    for (r, eval) in found {
        for kind in &eval.info.tags {
            counts.add(*kind);
        }
        for mut record in eval.records {
            record.op_id = records.len() as u64;
            records.push(record);
        }
        if let Some(task) = graph.branches.get_mut(&r.pid).and_then(|b| b.task_mut(r.index)) {
            task.optimization = eval.info;
        }
    }
    (counts, records)
}
