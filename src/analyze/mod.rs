//! Post-pass over a replayed trace.
//!
//! [`analyze`] feeds every event through a [`ProcessTree`], compiles the
//! lookup tables, then computes task energy, searches for optimizations and
//! buckets everything into timelines. The result is a serializable [`Report`].

pub mod optimize;
pub mod timeline;

pub use optimize::{evaluate, optimize, OptimizationCounts, OptimizationRecord};
pub use timeline::{
    energy_timeline, optimization_timeline, EnergyBucket, OptimizationBucket,
    OptimizationTimeline, Timeline,
};

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Diagnostics;
use crate::events::{EventCounts, TraceEvent};
use crate::graph::{BranchRole, ProcessBranch, ProcessTree, QueueStats, Task, TaskGraph};
use crate::pid::PidClassifier;

/// One non-empty branch of the final graph.
#[derive(Debug, Serialize)]
pub struct BranchSummary {
    pub pid: u32,
    pub process_name: String,
    pub thread_name: String,
    pub role: BranchRole,
    pub task_count: usize,
    /// Energy per cluster in joules.
    pub energy: Vec<f64>,
    pub total_energy: f64,
    pub busy_us: u64,
    pub tasks: Vec<Task>,
}

impl BranchSummary {
    fn new(branch: &ProcessBranch, energy: Vec<f64>) -> Self {
        Self {
            pid: branch.pid(),
            process_name: branch.record.process_name.clone(),
            thread_name: branch.record.thread_name.clone(),
            role: branch.role,
            task_count: branch.len(),
            total_energy: energy.iter().sum(),
            energy,
            busy_us: branch.busy_time(),
            tasks: branch.tasks().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    pub start: u64,
    pub finish: u64,
    pub duration_s: f64,
    pub branches: Vec<BranchSummary>,
    pub binder_branches: Vec<BranchSummary>,
    /// Thread energy per CPU cluster.
    pub cpu_energy: Vec<f64>,
    pub gpu_energy: f64,
    pub total_energy: f64,
    /// Mean power in watts, absent for an empty time range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_power: Option<f64>,
    pub optimizations: OptimizationCounts,
    pub optimization_records: Vec<OptimizationRecord>,
    pub optimization_timeline: OptimizationTimeline,
    pub energy_timeline: Vec<EnergyBucket>,
    pub diagnostics: Diagnostics,
    pub events: EventCounts,
    /// Binder halves still queued when the trace ended.
    pub queues_at_end: QueueStats,
}

/// Replay `events` and build the report.
///
/// Integrity failures ([`crate::error::AnalysisError`]) abort the run and can be
/// recovered from the returned error with `downcast_ref`.
pub fn analyze<I>(config: &Config, classifier: Box<dyn PidClassifier>, events: I) -> Result<Report>
where
    I: IntoIterator<Item = Result<TraceEvent>>,
{
    config.validate()?;
    let mut tree = ProcessTree::new(config, classifier);
    for event in events {
        let event = event?;
        tree.handle(&event)?;
    }
    info!(
        "Processed {} events, {} branches",
        tree.counts().total(),
        tree.branches().len()
    );

    let graph = tree.finish(config.compile_threads)?;
    report(config, graph)
}

/// Energy, optimization and timeline pass over a finished graph.
pub fn report(config: &Config, mut graph: TaskGraph) -> Result<Report> {
    let clusters = graph.metrics.topology().clusters;

    let mut cpu_energy = vec![0.0; clusters];
    let mut branch_energy: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for (pid, branch) in graph.branches.iter_mut() {
        let energy = branch
            .compute_energy(&graph.metrics)
            .with_context(|| format!("Energy accounting failed for pid {pid}"))?;
        for (sum, e) in cpu_energy.iter_mut().zip(&energy) {
            *sum += e;
        }
        branch_energy.insert(*pid, energy);
    }

    let (optimizations, optimization_records) = optimize(&mut graph, config.util_window_us);

    let (start, finish) = time_bounds(&graph);
    let timeline = Timeline::new(start, finish, config.timeline_interval_us);
    let optimization_timeline = optimization_timeline(&timeline, &graph.branches);
    let energy_timeline = energy_timeline(&timeline, &graph.branches, &graph.metrics)?;

    let gpu_energy = if finish > start {
        graph.metrics.gpu().energy(
            start,
            finish,
            graph.metrics.temps(),
            &graph.metrics.profile().gpu,
        )?
    } else {
        0.0
    };

    let thread_energy: f64 = cpu_energy.iter().sum();
    let total_energy = thread_energy + gpu_energy;
    let duration_s = (finish - start) as f64 * 1e-6;
    let average_power = (duration_s > 0.0).then(|| total_energy / duration_s);

    let summarize = |branches: &BTreeMap<u32, ProcessBranch>| -> Vec<BranchSummary> {
        branches
            .values()
            .filter(|b| !b.is_empty())
            .map(|b| {
                let energy = branch_energy
                    .get(&b.pid())
                    .cloned()
                    .unwrap_or_else(|| vec![0.0; clusters]);
                BranchSummary::new(b, energy)
            })
            .collect()
    };
    let branches = summarize(&graph.branches);
    let binder_branches = summarize(&graph.binder_branches);

    let application = graph
        .branches
        .values()
        .find(|b| b.role == BranchRole::App)
        .map(|b| b.record.process_name.clone());

    info!(
        "{} branches over {:.3}s: {:.6}J cpu, {:.6}J gpu, {} optimizations",
        branches.len(),
        duration_s,
        thread_energy,
        gpu_energy,
        optimizations.total()
    );
    if graph.diagnostics.total() > 0 {
        warn!("Recovered from trace anomalies: {:?}", graph.diagnostics);
    }

    Ok(Report {
        application,
        start,
        finish,
        duration_s,
        branches,
        binder_branches,
        cpu_energy,
        gpu_energy,
        total_energy,
        average_power,
        optimizations,
        optimization_records,
        optimization_timeline,
        energy_timeline,
        diagnostics: graph.diagnostics,
        events: graph.counts,
        queues_at_end: graph.queues,
    })
}

/// First task start to last task finish over the process branches, or the
/// observed event range when no task was recorded.
fn time_bounds(graph: &TaskGraph) -> (u64, u64) {
    let tasks = graph.branches.values().flat_map(|b| b.tasks());
    let bounds = tasks.fold(None, |acc: Option<(u64, u64)>, t| {
        Some(match acc {
            Some((lo, hi)) => (lo.min(t.start), hi.max(t.finish())),
            None => (t.start, t.finish()),
        })
    });
    bounds
        .or_else(|| graph.metrics.time_range())
        .unwrap_or((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SchedSwitch, Temperature};
    use crate::pid::{PidClassification, PidRecord, StaticClassifier};

    fn classifier() -> Box<dyn PidClassifier> {
        let mut classes = PidClassification::default();
        classes
            .app
            .insert(100, PidRecord::new(100, "com.example", "main"));
        Box::new(StaticClassifier::new(classes))
    }

    fn switch(ts: u64, cpu: u32, pid: u32, next_pid: u32) -> Result<TraceEvent> {
        Ok(TraceEvent::SchedSwitch(SchedSwitch {
            ts,
            cpu,
            pid,
            next_pid,
            prev_state: None,
        }))
    }

    fn temp(ts: u64) -> Result<TraceEvent> {
        Ok(TraceEvent::Temperature(Temperature {
            ts,
            big: [50, 52, 54, 56],
            gpu: 45,
        }))
    }

    #[test]
    fn test_report_totals() {
        let events = vec![
            temp(0),
            switch(1_000, 5, 0, 100),
            switch(11_000, 5, 100, 0),
            switch(20_000, 1, 0, 100),
            switch(30_000, 1, 100, 0),
        ];
        let report = analyze(&Config::default(), classifier(), events).unwrap();

        assert_eq!(report.application.as_deref(), Some("com.example"));
        assert_eq!(report.start, 1_000);
        assert_eq!(report.finish, 30_000);
        assert_eq!(report.branches.len(), 1);
        assert_eq!(report.branches[0].task_count, 2);
        assert_eq!(report.branches[0].busy_us, 20_000);
        assert!(report.cpu_energy[0] > 0.0);
        assert!(report.cpu_energy[1] > 0.0);
        assert!(report.average_power.is_some());
        assert_eq!(report.events.sched_switch, 4);
        assert_eq!(report.diagnostics.total(), 0);

        let timeline_energy: f64 = report.energy_timeline.iter().map(|b| b.thread_energy).sum();
        let cpu: f64 = report.cpu_energy.iter().sum();
        assert!((timeline_energy - cpu).abs() < 1e-9 * cpu.max(1.0));
    }

    #[test]
    fn test_empty_trace_has_no_power() {
        let report = analyze(&Config::default(), classifier(), Vec::new()).unwrap();
        assert!(report.branches.is_empty());
        assert_eq!(report.average_power, None);
        assert_eq!(report.total_energy, 0.0);
        assert_eq!(report.energy_timeline.len(), 1);
    }

    #[test]
    fn test_missing_temperature_aborts() {
        let events = vec![switch(1_000, 5, 0, 100), switch(11_000, 5, 100, 0)];
        let err = analyze(&Config::default(), classifier(), events).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::AnalysisError>(),
            Some(crate::error::AnalysisError::MissingTemperature { .. })
        ));
    }
}
