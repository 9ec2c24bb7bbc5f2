//! The event dispatcher that grows the task graph.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{AnalysisError, Diagnostics};
use crate::events::{BinderKind, BinderTransaction, EventCounts, SchedSwitch, TraceEvent};
use crate::graph::binder::{BinderQueues, CompletedTransaction, PendingCall, QueueStats};
use crate::graph::branch::{BranchRole, ProcessBranch};
use crate::graph::task::{CoreEvent, CoreEventKind, DependencyKind, Task, TaskKind, TaskRef};
use crate::metrics::SystemMetrics;
use crate::pid::{PidClassification, PidClassifier};

/// PID of the per-CPU idle task.
const IDLE_PID: u32 = 0;

/// Everything the dispatcher built, handed to the post-pass.
pub struct TaskGraph {
    pub branches: BTreeMap<u32, ProcessBranch>,
    pub binder_branches: BTreeMap<u32, ProcessBranch>,
    pub metrics: SystemMetrics,
    pub counts: EventCounts,
    pub diagnostics: Diagnostics,
    pub queues: QueueStats,
}

impl TaskGraph {
    pub fn task(&self, r: TaskRef) -> Option<&Task> {
        self.branches.get(&r.pid)?.task(r.index)
    }
}

pub struct ProcessTree {
    classifier: Box<dyn PidClassifier>,
    classes: PidClassification,
    metrics: SystemMetrics,
    branches: BTreeMap<u32, ProcessBranch>,
    binder_branches: BTreeMap<u32, ProcessBranch>,
    queues: BinderQueues,
    next_task_id: u64,
    last_ts: Option<u64>,
    counts: EventCounts,
    diagnostics: Diagnostics,
}

impl ProcessTree {
    pub fn new(config: &Config, classifier: Box<dyn PidClassifier>) -> Self {
        let classes = classifier.classify();

        let mut branches = BTreeMap::new();
        for (pid, record) in &classes.app {
            branches.insert(*pid, ProcessBranch::new(record.clone(), BranchRole::App));
        }
        for (pid, record) in &classes.system {
            branches
                .entry(*pid)
                .or_insert_with(|| ProcessBranch::new(record.clone(), BranchRole::System));
        }
        let binder_branches = classes
            .binder
            .iter()
            .map(|(pid, record)| (*pid, ProcessBranch::new(record.clone(), BranchRole::Binder)))
            .collect();
        branches.remove(&IDLE_PID);

        debug!(
            "Tracking {} app, {} system and {} binder threads",
            classes.app.len(),
            classes.system.len(),
            classes.binder.len()
        );

        Self {
            classifier,
            classes,
            metrics: SystemMetrics::new(config),
            branches,
            binder_branches,
            queues: BinderQueues::new(config.retention.clone()),
            next_task_id: 0,
            last_ts: None,
            counts: EventCounts::default(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn branches(&self) -> &BTreeMap<u32, ProcessBranch> {
        &self.branches
    }

    pub fn binder_branches(&self) -> &BTreeMap<u32, ProcessBranch> {
        &self.binder_branches
    }

    pub fn metrics(&self) -> &SystemMetrics {
        &self.metrics
    }

    pub fn counts(&self) -> &EventCounts {
        &self.counts
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queues.stats()
    }

    /// Feed one event. Events must arrive in timestamp order.
    pub fn handle(&mut self, event: &TraceEvent) -> Result<(), AnalysisError> {
        let ts = event.ts();
        if let Some(previous) = self.last_ts {
            if ts < previous {
                return Err(AnalysisError::OutOfOrder { ts, previous });
            }
        }
        self.last_ts = Some(ts);
        self.check_cpus(event)?;
        self.counts.record(event);
        self.metrics.observe(ts);
        self.queues.expire(ts, &mut self.diagnostics);

        match event {
            TraceEvent::SchedSwitch(e) => self.on_sched_switch(e),
            TraceEvent::CpuIdle(e) => self.metrics.on_idle(e),
            TraceEvent::FreqChange(e) => self.metrics.on_freq_change(e),
            TraceEvent::Binder(e) => self.on_binder(e),
            TraceEvent::GpuUtil(e) => self.metrics.on_gpu_util(e),
            TraceEvent::Temperature(e) => self.metrics.on_temperature(e),
        }
        Ok(())
    }

    /// Stop consuming events and compile the lookup tables.
    pub fn finish(mut self, threads: usize) -> Result<TaskGraph, AnalysisError> {
        self.metrics.finish(threads)?;
        Ok(TaskGraph {
            queues: self.queues.stats(),
            branches: self.branches,
            binder_branches: self.binder_branches,
            metrics: self.metrics,
            counts: self.counts,
            diagnostics: self.diagnostics,
        })
    }

    /// Every CPU an event names must exist in the topology.
    fn check_cpus(&self, event: &TraceEvent) -> Result<(), AnalysisError> {
        let (cpu, target) = match event {
            TraceEvent::SchedSwitch(e) => (Some(e.cpu), None),
            TraceEvent::CpuIdle(e) => (Some(e.cpu), None),
            TraceEvent::FreqChange(e) => (Some(e.cpu), Some(e.target_cpu)),
            TraceEvent::Binder(e) => (Some(e.cpu), None),
            TraceEvent::GpuUtil(_) | TraceEvent::Temperature(_) => (None, None),
        };
        let cores = self.metrics.topology().core_count();
        match [cpu, target].into_iter().flatten().find(|&c| c as usize >= cores) {
            Some(cpu) => Err(AnalysisError::UnknownCpu { ts: event.ts(), cpu }),
            None => Ok(()),
        }
    }

    fn is_tracked(&self, pid: u32) -> bool {
        pid != IDLE_PID && self.classes.get(pid).is_some()
    }

    fn core_event(&self, kind: CoreEventKind, ts: u64, cpu: u32) -> CoreEvent {
        CoreEvent {
            kind,
            ts,
            cpu,
            cluster: self.metrics.topology().cluster_of(cpu as usize),
            cycles: 0.0,
            cluster_freqs: self.metrics.cluster_freqs(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    fn on_sched_switch(&mut self, e: &SchedSwitch) {
        if e.pid != IDLE_PID {
            let sample = self.core_event(CoreEventKind::SwitchOut, e.ts, e.cpu);
            if let Some(branch) = self.branches.get_mut(&e.pid) {
                branch.switch_out(sample);
            }
        }

        if !self.is_tracked(e.next_pid) {
            return;
        }

        // Newest completed transaction aimed at the incoming thread, if any.
        let mut cursor = self.queues.completed_len();
        while let Some(idx) = self.queues.rfind_completed(e.next_pid, cursor) {
            cursor = idx;
            let Some(tx) = self.queues.remove_completed(idx) else {
                break;
            };
            if self.resolve_transaction(&tx) {
                self.start_binder_task(e, &tx);
                return;
            }
            debug!(
                "Dropping binder transaction {} -> {} via {}: unresolved pid",
                tx.caller, tx.target, tx.binder_thread
            );
            self.diagnostics.unresolved_pids += 1;
        }

        self.start_cyclic_task(e);
    }

    /// Make sure the branches a transaction touches exist.
    fn resolve_transaction(&mut self, tx: &CompletedTransaction) -> bool {
        if !self.binder_branches.contains_key(&tx.binder_thread) {
            let Some(record) = self.classifier.resolve(tx.binder_thread) else {
                return false;
            };
            trace!("Resolved binder thread {} ({})", record.pid, record.thread_name);
            self.classes.binder.insert(record.pid, record.clone());
            self.binder_branches
                .insert(tx.binder_thread, ProcessBranch::new(record, BranchRole::Binder));
        }

        if !self.branches.contains_key(&tx.target) {
            let Some(record) = self.classifier.resolve(tx.target) else {
                return false;
            };
            trace!("Resolved binder target {} ({})", record.pid, record.thread_name);
            self.classes.app.insert(record.pid, record.clone());
            self.branches
                .insert(tx.target, ProcessBranch::new(record, BranchRole::App));
        }
        true
    }

    fn start_binder_task(&mut self, e: &SchedSwitch, tx: &CompletedTransaction) {
        let send = self.core_event(CoreEventKind::Binder, tx.send.ts, tx.send.cpu);
        let recv = tx.receive();
        let recv = self.core_event(CoreEventKind::Binder, recv.ts, recv.cpu);
        let send_id = self.next_id();
        let recv_id = self.next_id();
        if let Some(binder) = self.binder_branches.get_mut(&tx.binder_thread) {
            binder.add_binder_task(send_id, TaskKind::BinderSend, send);
            binder.add_binder_task(recv_id, TaskKind::BinderReceive, recv);
        }

        let Some(new_ref) = self.switch_in(e) else {
            return;
        };
        if let Some(task) = self.task_mut(new_ref) {
            task.dependency.kind = DependencyKind::Binder;
        }

        // A thread signalling itself links to the task before the one just
        // started.
        let caller_task = self.branches.get(&tx.caller).and_then(|caller| {
            let last = caller.last_index()?;
            if tx.caller == tx.target {
                last.checked_sub(1)
            } else {
                Some(last)
            }
        });
        match caller_task {
            Some(index) => self.link(
                TaskRef {
                    pid: tx.caller,
                    index,
                },
                new_ref,
            ),
            None => trace!(
                "Binder caller {} has no task to link to pid {}",
                tx.caller,
                tx.target
            ),
        }
    }

    fn start_cyclic_task(&mut self, e: &SchedSwitch) {
        if !self.branches.contains_key(&e.next_pid) {
            return;
        }
        let Some(new_ref) = self.switch_in(e) else {
            return;
        };
        if let Some(task) = self.task_mut(new_ref) {
            task.dependency.kind = DependencyKind::Cyclic;
        }
        if let Some(index) = new_ref.index.checked_sub(1) {
            self.link(
                TaskRef {
                    pid: new_ref.pid,
                    index,
                },
                new_ref,
            );
        }
    }

    fn switch_in(&mut self, e: &SchedSwitch) -> Option<TaskRef> {
        let sample = self.core_event(CoreEventKind::SwitchIn, e.ts, e.cpu);
        let id = self.next_id();
        let branch = self.branches.get_mut(&e.next_pid)?;
        let (index, implicit) = branch.switch_in(id, sample);
        if implicit {
            self.diagnostics.implicit_closes += 1;
        }
        Some(TaskRef {
            pid: e.next_pid,
            index,
        })
    }

    fn task_mut(&mut self, r: TaskRef) -> Option<&mut Task> {
        self.branches.get_mut(&r.pid)?.task_mut(r.index)
    }

    /// Record that `next` depends on `prev`. The forward link keeps the first
    /// successor only.
    fn link(&mut self, prev: TaskRef, next: TaskRef) {
        if let Some(task) = self.task_mut(next) {
            task.dependency.prev = Some(prev);
        }
        if let Some(task) = self.task_mut(prev) {
            if task.dependency.next.is_none() {
                task.dependency.next = Some(next);
            }
        }
    }

    fn on_binder(&mut self, e: &BinderTransaction) {
        match e.kind {
            BinderKind::Call => {
                if !self.branches.contains_key(&e.pid) {
                    return;
                }
                let children = self.classifier.child_binder_threads(e.target_pid);
                self.queues
                    .push_pending(PendingCall::new(e.clone(), children), &mut self.diagnostics);
            }
            BinderKind::Async => {
                if !self.branches.contains_key(&e.pid) {
                    return;
                }
                self.queues.push_completed(
                    CompletedTransaction::from_async(e.clone()),
                    &mut self.diagnostics,
                );
            }
            BinderKind::Reply => {
                if self.classes.system.contains_key(&e.pid) || self.classes.binder.contains_key(&e.pid)
                {
                    self.queues.match_reply(e, &mut self.diagnostics);
                }
            }
        }
    }
}
