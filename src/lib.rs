//! binderflow - energy and DVFS analysis of Android binder traffic.
//!
//! The library replays a kernel trace of a big.LITTLE Android device and
//! rebuilds, for one application and the services it talks to, a graph of
//! execution intervals linked by binder transactions. Every interval is then
//! costed with a per-cluster energy model and checked for a cheaper placement.
//!
//! # Modules
//!
//! - [`events`] - Typed trace records and the JSON-lines event format
//! - [`ingest`] - Reading event streams from disk
//! - [`pid`] - Classification of relevant PIDs and the `ps -T` snapshot parser
//! - [`metrics`] - Per-core and GPU state, utilization tables and the energy model
//! - [`graph`] - Tasks, branches, binder matching and the event dispatcher
//! - [`analyze`] - Energy accounting, optimization search and the final report
//!
//! # Example
//!
//! ```no_run
//! use binderflow::{analyze, Capture, Config, EventReader};
//! use std::path::Path;
//!
//! let capture = Capture::load(Path::new("capture.json"))?;
//! let config = Config {
//!     initial: capture.initial.clone(),
//!     ..Config::default()
//! };
//! let events = EventReader::open(Path::new("events.jsonl"))?;
//! let report = analyze(&config, Box::new(capture.pids), events)?;
//! println!("{:.3}J", report.total_energy);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod analyze;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod ingest;
pub mod metrics;
pub mod pid;

pub use analyze::{analyze, Report};
pub use config::{Config, InitialState, RetentionPolicy, Topology};
pub use error::{AnalysisError, Diagnostics, TempChannel};
pub use events::TraceEvent;
pub use graph::{ProcessTree, TaskGraph};
pub use ingest::EventReader;
pub use metrics::{EnergyProfile, SystemMetrics};
pub use pid::{Capture, PidClassifier, PidRecord, PsSnapshot, StaticClassifier};
