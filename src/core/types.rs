/*!
 * Core Types
 * Identifier types shared across the agent
 */

use uuid::Uuid;

/// Job identifier, unique and stable for the job's lifetime
pub type JobId = Uuid;

/// Queue message identifier assigned by the server
pub type MessageId = i64;

/// Server-issued session handle bound to this agent instance
pub type SessionId = Uuid;
