/*!
 * Worker
 * The worker-process side of job execution
 */

pub mod worker;

pub use worker::run_worker;
