/*!
 * Message Listener
 * Session lifecycle and message polling over a queue service
 */

use super::client::QueueService;
use super::types::{Message, SessionError, SessionResult};
use crate::core::{MessageId, SessionId};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CREATE_SESSION_ATTEMPTS: u32 = 10;
const CREATE_SESSION_BACKOFF: Duration = Duration::from_secs(30);
const DELETE_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the agent's queue session and the last-seen message cursor.
pub struct MessageListener {
    service: Arc<dyn QueueService>,
    session: Mutex<Option<SessionId>>,
    last_message_id: Mutex<Option<MessageId>>,
}

impl MessageListener {
    pub fn new(service: Arc<dyn QueueService>) -> Self {
        Self {
            service,
            session: Mutex::new(None),
            last_message_id: Mutex::new(None),
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        *self.session.lock()
    }

    /// Establish a session, retrying transient failures with a fixed
    /// backoff. Gives up immediately when the server reports the agent
    /// as unregistered: no amount of retrying can recover from that.
    pub async fn create_session(&self, cancel: &CancellationToken) -> SessionResult<()> {
        for attempt in 1..=CREATE_SESSION_ATTEMPTS {
            match self.service.create_session().await {
                Ok(session) => {
                    info!("Session {session} established (attempt {attempt})");
                    *self.session.lock() = Some(session);
                    *self.last_message_id.lock() = None;
                    return Ok(());
                }
                Err(SessionError::AgentNotFound) => {
                    error!("Agent is no longer registered with the server, giving up");
                    return Err(SessionError::AgentNotFound);
                }
                Err(e) if attempt == CREATE_SESSION_ATTEMPTS => {
                    error!("Session creation failed on final attempt {attempt}: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Session creation attempt {attempt}/{CREATE_SESSION_ATTEMPTS} failed: {e}, \
                         retrying in {CREATE_SESSION_BACKOFF:?}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                        _ = tokio::time::sleep(CREATE_SESSION_BACKOFF) => {}
                    }
                }
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }

    /// Long poll until a message arrives. A server-side poll window that
    /// elapses empty (`None` from the service) is looped over silently.
    /// Advances the message cursor on receipt.
    pub async fn get_next_message(&self, cancel: &CancellationToken) -> SessionResult<Message> {
        let session = self.session().ok_or(SessionError::NoSession)?;
        loop {
            let last = *self.last_message_id.lock();
            let poll = self.service.get_next_message(session, last);
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                result = poll => result,
            };

            match result {
                Ok(Some(message)) => {
                    *self.last_message_id.lock() = Some(message.message_id);
                    return Ok(message);
                }
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort message acknowledgement. Failures are logged, never
    /// escalated: the message reappears and is handled again.
    pub async fn delete_message(&self, message_id: MessageId) {
        let Some(session) = self.session() else {
            return;
        };
        if let Err(e) = self.service.delete_message(session, message_id).await {
            warn!("Failed to delete message {message_id}: {e}");
        }
    }

    /// Best-effort, bounded session teardown.
    pub async fn delete_session(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        info!("Deleting session {session}");
        match tokio::time::timeout(
            DELETE_SESSION_TIMEOUT,
            self.service.delete_session(session),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Session deletion failed: {e}"),
            Err(_) => warn!("Session deletion timed out after {DELETE_SESSION_TIMEOUT:?}"),
        }
    }
}
