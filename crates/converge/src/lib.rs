//! # converge
//!
//! Declarative task engine: every task describes the state it wants, the
//! engine finds what is there, diffs the two and asks a target to close
//! the gap.
//!
//! ## Core Concepts
//!
//! - **Delta**: a task type with named comparable fields, a `find` for the
//!   actual state and one render method per target
//! - **TaskMap**: every task of a run keyed by `kind/name`
//! - **Target**: where renders go (the local machine, a cloud-init
//!   document, a dry-run report or an inventory)
//! - **Executor**: runs tasks once their dependencies are done, retrying
//!   failures while other tasks still make progress
//!
//! ## Example
//!
//! ```ignore
//! use converge::{DryRunTarget, ExecuteOptions, NoProgress, Services, Target, TaskMap, run_tasks};
//!
//! let mut tasks = TaskMap::default();
//! tasks.insert(my_file_task)?;
//! let target = Target::DryRun(DryRunTarget::new());
//! let opts = ExecuteOptions::default();
//! let summary = run_tasks(&tasks, &target, &Services::default(), &opts, &mut NoProgress)?;
//! target.finish(&tasks)?;
//! ```

pub mod context;
pub mod dependencies;
pub mod error;
pub mod executor;
pub mod reconcile;
pub mod target;
pub mod task;
pub mod types;
pub mod value;

pub use context::{
    Cloud, CloudProviderId, Context, Services, TAG_DEBIAN_FAMILY, TAG_REDHAT_FAMILY, TAG_SYSTEMD,
};
pub use dependencies::{find_task_dependencies, plan, topological_sort};
pub use error::{CommandError, EngineError, ErrorKind, classify};
pub use executor::{NoProgress, ProgressCallback, run_tasks};
pub use reconcile::{build_changes, run_delta};
pub use target::{
    CloudConfig, CloudConfigFile, CloudInitTarget, Deletion, DryRunTarget, InventoryTarget,
    LocalTarget, Mode, Target,
};
pub use task::{Delta, Lifecycle, Task, TaskKey, TaskMap};
pub use types::{ApplyResult, ExecuteOptions, ExecuteSummary};
pub use value::{Changes, Field, FieldChange, TaskRef, Value, values_equal};
