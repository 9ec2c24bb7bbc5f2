//! Process identification.
//!
//! The task graph only follows threads that matter to the application under
//! test: the application's own threads, the system services it talks to and the
//! binder threads that carry transactions between them. A [`PidClassifier`]
//! supplies those three partitions up front and answers on-demand lookups for
//! PIDs that show up later in the trace.

pub mod ps;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::InitialState;

pub use ps::PsSnapshot;

/// A thread seen on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    pub pid: u32,
    pub process_name: String,
    pub thread_name: String,
}

impl PidRecord {
    pub fn new(pid: u32, process_name: impl Into<String>, thread_name: impl Into<String>) -> Self {
        Self {
            pid,
            process_name: process_name.into(),
            thread_name: thread_name.into(),
        }
    }
}

/// The three partitions of relevant PIDs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PidClassification {
    #[serde(default)]
    pub app: BTreeMap<u32, PidRecord>,
    #[serde(default)]
    pub system: BTreeMap<u32, PidRecord>,
    #[serde(default)]
    pub binder: BTreeMap<u32, PidRecord>,
}

impl PidClassification {
    pub fn get(&self, pid: u32) -> Option<&PidRecord> {
        self.app
            .get(&pid)
            .or_else(|| self.system.get(&pid))
            .or_else(|| self.binder.get(&pid))
    }

    pub fn len(&self) -> usize {
        self.app.len() + self.system.len() + self.binder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of PID information for one analysis run.
pub trait PidClassifier {
    /// Initial partitions of application, system service and binder PIDs.
    fn classify(&self) -> PidClassification;

    /// Look up a PID that was not part of the initial classification.
    fn resolve(&self, pid: u32) -> Option<PidRecord>;

    /// Binder threads owned by process `pid`.
    fn child_binder_threads(&self, pid: u32) -> Vec<u32>;
}

/// A classifier backed by a fixed table, usually loaded from a capture file.
///
/// `known` holds threads that are not initially relevant but can be resolved
/// on demand; `children` maps a process to its binder threads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticClassifier {
    #[serde(default)]
    pub app: BTreeMap<u32, PidRecord>,
    #[serde(default)]
    pub system: BTreeMap<u32, PidRecord>,
    #[serde(default)]
    pub binder: BTreeMap<u32, PidRecord>,
    #[serde(default)]
    pub known: BTreeMap<u32, PidRecord>,
    #[serde(default)]
    pub children: BTreeMap<u32, Vec<u32>>,
}

impl StaticClassifier {
    pub fn new(classification: PidClassification) -> Self {
        Self {
            app: classification.app,
            system: classification.system,
            binder: classification.binder,
            ..Self::default()
        }
    }

    pub fn with_known(mut self, record: PidRecord) -> Self {
        self.known.insert(record.pid, record);
        self
    }

    pub fn with_children(mut self, pid: u32, children: Vec<u32>) -> Self {
        self.children.insert(pid, children);
        self
    }
}

impl PidClassifier for StaticClassifier {
    fn classify(&self) -> PidClassification {
        PidClassification {
            app: self.app.clone(),
            system: self.system.clone(),
            binder: self.binder.clone(),
        }
    }

    fn resolve(&self, pid: u32) -> Option<PidRecord> {
        self.app
            .get(&pid)
            .or_else(|| self.system.get(&pid))
            .or_else(|| self.binder.get(&pid))
            .or_else(|| self.known.get(&pid))
            .cloned()
    }

    fn child_binder_threads(&self, pid: u32) -> Vec<u32> {
        self.children.get(&pid).cloned().unwrap_or_default()
    }
}

/// Everything recorded about the device alongside a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub governor: String,
    pub pids: StaticClassifier,
    #[serde(default)]
    pub initial: InitialState,
}

impl Capture {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read capture {}", path.display()))?;
        let capture: Capture = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse capture {}", path.display()))?;
        Ok(capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> StaticClassifier {
        let mut classification = PidClassification::default();
        classification
            .app
            .insert(100, PidRecord::new(100, "com.example", "main"));
        classification
            .system
            .insert(200, PidRecord::new(200, "/system/bin/surfaceflinger", "surfaceflinger"));
        classification
            .binder
            .insert(201, PidRecord::new(201, "/system/bin/surfaceflinger", "Binder:200_1"));
        StaticClassifier::new(classification)
            .with_known(PidRecord::new(300, "/vendor/bin/hw", "hw"))
            .with_children(200, vec![201])
    }

    #[test]
    fn test_resolve_checks_partitions_then_known() {
        let c = classifier();
        assert_eq!(c.resolve(100).unwrap().thread_name, "main");
        assert_eq!(c.resolve(201).unwrap().thread_name, "Binder:200_1");
        assert_eq!(c.resolve(300).unwrap().process_name, "/vendor/bin/hw");
        assert!(c.resolve(999).is_none());
    }

    #[test]
    fn test_child_binder_threads() {
        let c = classifier();
        assert_eq!(c.child_binder_threads(200), vec![201]);
        assert!(c.child_binder_threads(100).is_empty());
    }

    #[test]
    fn test_capture_json() {
        let json = r#"{
            "application": "com.example",
            "pids": {
                "app": {"100": {"pid": 100, "process_name": "com.example", "thread_name": "main"}},
                "children": {"200": [201, 202]}
            },
            "initial": {"gpu_freq": 177000000}
        }"#;
        let capture: Capture = serde_json::from_str(json).unwrap();
        assert_eq!(capture.pids.classify().app.len(), 1);
        assert!(capture.pids.classify().system.is_empty());
        assert_eq!(capture.pids.child_binder_threads(200), vec![201, 202]);
        assert_eq!(capture.initial.gpu_freq, 177_000_000);
    }

    #[test]
    fn test_capture_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(&path, "not json").unwrap();
        let err = Capture::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("capture.json"));
    }
}
