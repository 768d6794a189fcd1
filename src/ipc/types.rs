/*!
 * Channel Types
 * Framed messages exchanged between the agent and its worker processes
 */

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Channel operation result
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel setup failed: {0}")]
    Setup(String),

    #[error("Channel send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel closed by peer")]
    Closed,

    #[error("Malformed channel frame: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame kinds carried over a worker channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    NewJob,
    CancelJob,
    Shutdown,
}

/// One line-delimited JSON frame. The body is an opaque payload string;
/// its schema is agreed between sender and receiver per message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub message_type: MessageType,
    pub body: String,
}

impl ChannelMessage {
    pub fn new(message_type: MessageType, body: impl Into<String>) -> Self {
        Self {
            message_type,
            body: body.into(),
        }
    }
}
