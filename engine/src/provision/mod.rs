//! Provisioning workflow: context assembly, subprocess supervision and the
//! five-phase deployment body

pub mod context;
pub mod runner;
pub mod workflow;

pub use context::{ContextBuilder, ExecutionContext, InvocationKind};
pub use runner::{ProcessHandle, ProcessRunner, RunnerEvent};
pub use workflow::Provisioner;
