pub mod engine;
pub mod guard;

pub use engine::{Orchestrator, PhaseRun, StatusReport, run_executors};
pub use guard::{ExecutionGuard, ExecutionPermit};
