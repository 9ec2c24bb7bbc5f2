//! Classification from a saved `busybox ps -T` listing.
//!
//! Each thread shows up on its own line; threads other than a process' main
//! thread carry their name in braces:
//!
//! ```text
//!   PID USER       TIME COMMAND
//!  1234 u0_a55     0:05 com.example.app
//!  1240 u0_a55     0:00 {RenderThread} com.example.app
//!   301 1000       0:00 {Binder:300_1} /system/bin/surfaceflinger
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::debug;

use super::{PidRecord, StaticClassifier};

static PS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+\S+\s+\d+:\d+\s+(?:\{([^}]*)\}\s+)?(.+?)\s*$")
        .expect("valid ps regex")
});

static BINDER_THREAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Binder:(\d+)_").expect("valid binder regex"));

const SYSTEM_BIN: &str = "/system/bin";

/// One thread of the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsEntry {
    pub pid: u32,
    /// Thread name, absent for a process' main thread.
    pub thread: Option<String>,
    pub command: String,
}

impl PsEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let caps = PS_LINE.captures(line)?;
        Some(Self {
            pid: caps[1].parse().ok()?,
            thread: caps.get(2).map(|m| m.as_str().to_string()),
            command: caps[3].to_string(),
        })
    }

    pub fn record(&self) -> PidRecord {
        let thread = self.thread.as_deref().unwrap_or(&self.command);
        PidRecord::new(self.pid, self.command.clone(), thread)
    }

    /// Owning process of a `Binder:<pid>_<n>` thread.
    pub fn binder_parent(&self) -> Option<u32> {
        let caps = BINDER_THREAD.captures(self.thread.as_deref()?)?;
        caps[1].parse().ok()
    }

    fn is_binder(&self) -> bool {
        self.binder_parent().is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PsSnapshot {
    entries: Vec<PsEntry>,
}

impl PsSnapshot {
    /// Parse a listing. The header and anything else that is not a thread
    /// line are skipped.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let entry = PsEntry::parse(line);
                if entry.is_none() {
                    debug!("Skipping ps line: {}", line.trim());
                }
                entry
            })
            .collect();
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read ps listing {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn entries(&self) -> &[PsEntry] {
        &self.entries
    }

    fn find(&self, pid: u32) -> Option<&PsEntry> {
        self.entries.iter().find(|e| e.pid == pid)
    }

    /// Binder threads belonging to process `pid`.
    pub fn child_binder_threads(&self, pid: u32) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|e| e.binder_parent() == Some(pid))
            .map(|e| e.pid)
            .collect()
    }

    /// Split the listing into application, system service and binder threads
    /// for the application whose command line contains `app`.
    ///
    /// Every binder thread is kept, since it is not known up front which
    /// services the application will call. A binder thread's owning process
    /// is promoted to a system service when it is not already tracked.
    pub fn classify(&self, app: &str) -> Result<StaticClassifier> {
        if !self
            .entries
            .iter()
            .any(|e| e.thread.is_none() && e.command.contains(app))
        {
            bail!("No process matching '{}' in ps listing", app);
        }

        let mut classifier = StaticClassifier::default();
        for entry in &self.entries {
            if entry.is_binder() {
                classifier.binder.insert(entry.pid, entry.record());
            } else if entry.command.contains(app) {
                classifier.app.insert(entry.pid, entry.record());
            } else if entry.command.starts_with(SYSTEM_BIN) {
                classifier.system.insert(entry.pid, entry.record());
            } else {
                classifier.known.insert(entry.pid, entry.record());
            }
        }

        let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for entry in &self.entries {
            let Some(parent) = entry.binder_parent() else {
                continue;
            };
            children.entry(parent).or_default().push(entry.pid);

            if classifier.app.contains_key(&parent) || classifier.system.contains_key(&parent) {
                continue;
            }
            if let Some(owner) = self.find(parent) {
                debug!("Promoting binder owner {} ({}) to system", parent, owner.command);
                classifier.known.remove(&parent);
                classifier.system.insert(parent, owner.record());
            }
        }
        classifier.children = children;

        Ok(classifier)
    }
}
