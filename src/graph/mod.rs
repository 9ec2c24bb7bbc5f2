//! Per-thread task histories and the causal links between them.

pub mod binder;
pub mod branch;
pub mod task;
pub mod tree;

pub use binder::{BinderQueues, CompletedTransaction, PendingCall, QueueStats};
pub use branch::{BranchRole, ProcessBranch};
pub use task::{
    CoreEvent, CoreEventKind, Dependency, DependencyKind, OptimizationInfo, OptimizationKind,
    Task, TaskKind, TaskRef,
};
pub use tree::{ProcessTree, TaskGraph};
