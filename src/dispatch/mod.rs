/*!
 * Job Dispatch
 * Job-to-worker registry, launch, cancellation, and drain
 */

pub mod dispatcher;
pub mod types;

pub use dispatcher::JobDispatcher;
pub use types::{JobCancel, JobRequest, WorkerState};
