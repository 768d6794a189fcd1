/*!
 * Dispatch Types
 * Job payloads and worker lifecycle state
 */

use crate::core::JobId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A job to run, as carried by a `job-request` queue message and by the
/// `new-job` channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub display_name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A cancellation request for a previously dispatched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCancel {
    pub job_id: JobId,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Lifecycle of one worker registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    New,
    Starting,
    Running,
    Finished,
}
