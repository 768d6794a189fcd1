/*!
 * Fleet Agent Library
 * Queue-driven job execution agent with per-job worker processes
 */

pub mod config;
pub mod core;
pub mod dispatch;
pub mod ipc;
pub mod process;
pub mod runloop;
pub mod session;
pub mod update;
pub mod worker;

// Re-exports
pub use config::AgentConfig;
pub use dispatch::{JobCancel, JobDispatcher, JobRequest};
pub use process::{ExecutionConfig, ProcessInvoker};
pub use runloop::{ExitCode, RunLoop};
pub use session::{HttpQueueService, MessageListener, QueueService};
pub use update::{SelfUpdater, Updater};
pub use worker::run_worker;
