/*!
 * Session Types
 * Queue message envelope and session errors
 */

use crate::core::MessageId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session operation result
pub type SessionResult<T> = Result<T, SessionError>;

/// Queue protocol errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The server no longer knows this agent; retrying cannot help.
    #[error("Agent is not registered with the server")]
    AgentNotFound,

    /// The session handle is no longer valid. Terminal for the run loop.
    #[error("Session expired")]
    SessionExpired,

    #[error("No session established")]
    NoSession,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Server rejected the request: {0}")]
    Server(String),

    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Queue message types the run loop understands
pub const MSG_JOB_REQUEST: &str = "job-request";
pub const MSG_JOB_CANCEL: &str = "job-cancel";
pub const MSG_REFRESH: &str = "refresh";

/// One message pulled off the agent's queue. The body is an opaque JSON
/// payload whose schema depends on the message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub message_type: String,
    pub body: String,
}
