//! Integration tests for the energy report.

mod common;

use binderflow::events::{BinderKind, IDLE_EXIT_STATE};
use binderflow::graph::OptimizationKind;
use binderflow::metrics::CompiledUtil;
use binderflow::{analyze, AnalysisError, Config, EventReader, ProcessTree, TempChannel};
use tempfile::TempDir;

use common::*;

const F177: u64 = 177_000_000;
const F600: u64 = 600_000_000;

fn run(events: Vec<binderflow::TraceEvent>) -> anyhow::Result<binderflow::Report> {
    analyze(&Config::default(), Box::new(classifier()), stream(events))
}

#[test]
fn test_out_of_order_aborts_run() {
    let err = run(vec![
        temperature(0, 50),
        switch(2_000, 0, 0, APP),
        switch(1_000, 0, APP, 0),
    ])
    .unwrap_err();
    assert_eq!(
        err.downcast_ref::<AnalysisError>(),
        Some(&AnalysisError::OutOfOrder {
            ts: 1_000,
            previous: 2_000
        })
    );
}

#[test]
fn test_zero_temperature_aborts_run() {
    let err = run(vec![
        temperature(0, 0),
        switch(1_000, 0, 0, APP),
        switch(2_000, 0, APP, 0),
    ])
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AnalysisError>(),
        Some(AnalysisError::ZeroTemperature {
            channel: TempChannel::Little,
            ..
        })
    ));
}

#[test]
fn test_cpu_outside_topology_names_the_cpu() {
    let err = run(vec![
        temperature(0, 50),
        switch(1_000, 9, 0, APP),
        switch(2_000, 9, APP, 0),
    ])
    .unwrap_err();
    assert_eq!(
        err.downcast_ref::<AnalysisError>(),
        Some(&AnalysisError::UnknownCpu { ts: 1_000, cpu: 9 })
    );
}

#[test]
fn test_duplicate_gpu_sample_aborts_whole_run() {
    // The empty interval lies in the last timeline bucket only
    let err = run(vec![
        temperature(0, 50),
        gpu(0, F177, 10.0),
        switch(1_000, 0, 0, APP),
        switch(2_000, 0, APP, 0),
        gpu(110_000, F600, 40.0),
        gpu(110_000, F177, 20.0),
        switch(120_000, 0, 0, APP),
        switch(121_000, 0, APP, 0),
    ])
    .unwrap_err();
    assert_eq!(
        err.downcast_ref::<AnalysisError>(),
        Some(&AnalysisError::ZeroDuration { ts: 110_000 })
    );
}

#[test]
fn test_big_task_with_slack_moves_to_little() {
    let report = run(vec![
        temperature(0, 50),
        switch(1_000, 4, 0, APP),
        switch(2_000, 4, APP, 0),
        switch(50_000, 4, 0, APP),
        switch(51_000, 4, APP, 0),
    ])
    .unwrap();

    // 2M cycles at 2GHz become 2.6M on a little core: 13ms at 200MHz, well
    // before the next task starts.
    assert_eq!(report.optimizations.b2l_realloc, 1);
    assert_eq!(report.optimizations.dvfs_after_realloc, 1);
    // No load anywhere, so both tasks could run slower on the big cluster
    assert_eq!(report.optimizations.dvfs, 2);
    assert_eq!(report.optimizations.same_cluster_realloc, 0);

    let tasks = &report.branches[0].tasks;
    assert!(tasks[0].optimization.has(OptimizationKind::B2lRealloc));
    assert_eq!(tasks[0].optimization.message.as_deref(), Some("DVFS optimization possible"));
    assert!(!tasks[1].optimization.has(OptimizationKind::B2lRealloc));

    let b2l = &report.optimization_records[0];
    assert_eq!(b2l.new_core, 0);
    assert_eq!(b2l.new_freq, 200_000_000);
    assert_eq!(b2l.new_core_old_freq, 1_400_000_000);
    assert_eq!(report.optimization_records.len(), 3);
    assert_eq!(
        report
            .optimization_records
            .iter()
            .map(|r| r.op_id)
            .collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let timeline = &report.optimization_timeline;
    assert_eq!(timeline.buckets.len(), 2);
    assert_eq!(timeline.buckets[0].realloc, 1);
    assert_eq!(timeline.buckets[0].dvfs, 2);
    assert_eq!(timeline.total, 3);
}

#[test]
fn test_busy_little_cluster_keeps_task_on_big() {
    let mut events = vec![temperature(0, 50)];
    // Little cores run flat out for the whole trace
    for cpu in 0..4 {
        events.push(idle(0, cpu, IDLE_EXIT_STATE));
    }
    events.push(switch(1_000, 4, 0, APP));
    events.push(switch(2_000, 4, APP, 0));
    events.push(switch(50_000, 4, 0, APP));
    events.push(switch(51_000, 4, APP, 0));
    for cpu in 0..4 {
        events.push(idle(60_000, cpu, 1));
    }

    let report = run(events).unwrap();
    assert_eq!(report.optimizations.b2l_realloc, 0);
    assert_eq!(report.optimizations.dvfs_after_realloc, 0);
}

#[test]
fn test_report_from_event_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let events = vec![
        temperature(0, 50),
        gpu(0, F177, 10.0),
        switch(1_000, 0, 0, APP),
        binder(1_500, APP, SERVICE, BinderKind::Call),
        switch(2_000, 0, APP, 0),
        binder(2_500, SERVICE_BINDER, 0, BinderKind::Reply),
        switch(3_000, 5, 0, SERVICE),
        gpu(20_000, F600, 50.0),
        switch(40_000, 5, SERVICE, 0),
        temperature(60_000, 55),
        switch(70_000, 0, 0, APP),
        switch(120_000, 0, APP, 0),
    ];
    let path = write_events(dir.path(), "events.jsonl", &events);

    let reader = EventReader::open(&path).unwrap();
    let report = analyze(&Config::default(), Box::new(classifier()), reader).unwrap();

    assert_eq!(report.application.as_deref(), Some("com.example.app"));
    assert_eq!(report.start, 1_000);
    assert_eq!(report.finish, 120_000);
    assert_eq!(report.events.total(), events.len() as u64);
    assert_eq!(report.events.binder_transaction, 2);

    // The idle worker and binder-free threads are dropped
    let pids: Vec<u32> = report.branches.iter().map(|b| b.pid).collect();
    assert_eq!(pids, vec![APP, SERVICE]);
    assert_eq!(report.binder_branches.len(), 1);
    assert_eq!(report.binder_branches[0].pid, SERVICE_BINDER);
    assert_eq!(report.binder_branches[0].total_energy, 0.0);

    // The service ran on a big core only
    let service = &report.branches[1];
    assert_eq!(service.energy[0], 0.0);
    assert!(service.energy[1] > 0.0);
    assert_eq!(service.busy_us, 37_000);

    assert!(report.gpu_energy > 0.0);
    let cpu: f64 = report.cpu_energy.iter().sum();
    assert!((report.total_energy - cpu - report.gpu_energy).abs() < 1e-12);
    let power = report.average_power.unwrap();
    assert!((power - report.total_energy / report.duration_s).abs() < 1e-9);

    // Buckets split the same totals
    let bucket_cpu: f64 = report.energy_timeline.iter().map(|b| b.thread_energy).sum();
    let bucket_gpu: f64 = report.energy_timeline.iter().map(|b| b.gpu_energy).sum();
    assert!((bucket_cpu - cpu).abs() < 1e-9 * cpu);
    assert!((bucket_gpu - report.gpu_energy).abs() < 1e-9 * report.gpu_energy);
    assert_eq!(report.energy_timeline[0].temp_gpu, Some(50));
    assert_eq!(report.energy_timeline[2].temp_gpu, Some(55));
    assert_eq!(report.energy_timeline[0].gpu_freq, F177);
    assert_eq!(report.energy_timeline[1].gpu_freq, F600);

    let json = serde_json::to_value(&report).unwrap();
    assert!(json["branches"][1]["tasks"][0]["dependency"]["prev"].is_object());
    assert_eq!(json["queues_at_end"]["pending"], 0);
}

#[test]
fn test_compiled_util_survives_disk_roundtrip() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Config::default();
    let mut tree = ProcessTree::new(&config, Box::new(classifier()));
    let events = [
        idle(0, 2, IDLE_EXIT_STATE),
        idle(10_000, 2, 1),
        idle(15_000, 2, IDLE_EXIT_STATE),
        idle(40_000, 2, 1),
        idle(45_000, 2, IDLE_EXIT_STATE),
    ];
    for event in &events {
        tree.handle(event).unwrap();
    }
    let graph = tree.finish(4).unwrap();

    let table = graph.metrics.cores()[2].compiled();
    let path = dir.path().join("core2.json");
    table.save(&path).unwrap();
    let reloaded = CompiledUtil::load(&path).unwrap();

    assert_eq!(&reloaded, table);
    for ts in (0..50_000).step_by(250) {
        assert_eq!(reloaded.get_util(ts), graph.metrics.util_at(2, ts));
    }
    // 25ms active in the last 30ms
    assert!((graph.metrics.util_at(2, 44_000) - 83.33).abs() < 0.01);
}
