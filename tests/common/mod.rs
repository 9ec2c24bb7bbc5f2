//! Common test utilities for binderflow integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use binderflow::events::{BinderKind, BinderTransaction, CpuIdle, GpuUtil, SchedSwitch, Temperature};
use binderflow::pid::PidClassification;
use binderflow::{PidRecord, StaticClassifier, TraceEvent};

pub const APP: u32 = 100;
pub const APP_WORKER: u32 = 101;
pub const SERVICE: u32 = 200;
pub const SERVICE_BINDER: u32 = 201;

/// One app with two threads and a system service with one binder thread.
pub fn classifier() -> StaticClassifier {
    let mut classes = PidClassification::default();
    classes
        .app
        .insert(APP, PidRecord::new(APP, "com.example.app", "main"));
    classes
        .app
        .insert(APP_WORKER, PidRecord::new(APP_WORKER, "com.example.app", "RenderThread"));
    classes.system.insert(
        SERVICE,
        PidRecord::new(SERVICE, "/system/bin/surfaceflinger", "surfaceflinger"),
    );
    classes.binder.insert(
        SERVICE_BINDER,
        PidRecord::new(SERVICE_BINDER, "/system/bin/surfaceflinger", "Binder:200_1"),
    );
    StaticClassifier::new(classes).with_children(SERVICE, vec![SERVICE_BINDER])
}

pub fn switch(ts: u64, cpu: u32, pid: u32, next_pid: u32) -> TraceEvent {
    TraceEvent::SchedSwitch(SchedSwitch {
        ts,
        cpu,
        pid,
        next_pid,
        prev_state: None,
    })
}

pub fn binder(ts: u64, pid: u32, target_pid: u32, kind: BinderKind) -> TraceEvent {
    TraceEvent::Binder(BinderTransaction {
        ts,
        cpu: 0,
        pid,
        target_pid,
        kind,
        flags: 0,
        code: 0,
    })
}

pub fn idle(ts: u64, cpu: u32, state: u32) -> TraceEvent {
    TraceEvent::CpuIdle(CpuIdle { ts, cpu, state })
}

pub fn gpu(ts: u64, freq: u64, util: f64) -> TraceEvent {
    TraceEvent::GpuUtil(GpuUtil { ts, freq, util })
}

pub fn temperature(ts: u64, celsius: u32) -> TraceEvent {
    TraceEvent::Temperature(Temperature {
        ts,
        big: [celsius; 4],
        gpu: celsius,
    })
}

/// Wrap events the way [`binderflow::EventReader`] yields them.
pub fn stream(events: Vec<TraceEvent>) -> Vec<anyhow::Result<TraceEvent>> {
    events.into_iter().map(Ok).collect()
}

/// Write `events` as JSON lines to `dir/name`.
pub fn write_events(dir: &Path, name: &str, events: &[TraceEvent]) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).expect("Failed to create event file");
    for event in events {
        let line = serde_json::to_string(event).expect("Failed to encode event");
        writeln!(file, "{line}").expect("Failed to write event");
    }
    path
}
