//! Execution Module
//!
//! Per-subject stage execution: file resolution, prerequisite checks,
//! output invalidation, snapshot/rollback and tool dispatch.

pub mod commands;
pub mod executor;
pub mod invalidation;
pub mod prerequisites;
pub mod resolver;
pub mod snapshot;
pub mod stage;

pub use executor::{ExecutionError, OperationExecutor, OperationOutcome, WorkdirGuard};
pub use invalidation::{InvalidationError, InvalidationPlan, InvalidationReport, OutputInvalidator};
pub use prerequisites::{PrerequisiteError, PrerequisiteReport, PrerequisiteValidator};
pub use resolver::{FileResolver, Resolution};
pub use snapshot::{DirectorySnapshot, RollbackError, RollbackReport};
pub use stage::{StageReport, StageRunner, StageState};
