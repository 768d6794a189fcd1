/*!
 * Process Execution
 * Subprocess spawning, ordered output streaming, and escalating shutdown
 */

pub mod control;
pub mod invoker;
pub mod types;

pub use control::{default_control, kill_tree, ProcessControl, ProcessEntry, SignalKind};
pub use invoker::ProcessInvoker;
pub use types::{
    EscalationState, ExecutionConfig, OutputLine, OutputStream, ProcessError, ProcessResult,
    ProcessState,
};
