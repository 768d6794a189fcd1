/*!
 * Session
 * Queue protocol client and message listener
 */

pub mod client;
pub mod listener;
pub mod types;

pub use client::{HttpQueueService, QueueService};
pub use listener::MessageListener;
pub use types::{
    Message, SessionError, SessionResult, MSG_JOB_CANCEL, MSG_JOB_REQUEST, MSG_REFRESH,
};
