/*!
 * Queue Client
 * HTTP implementation of the work-distribution queue protocol
 */

use super::types::{Message, SessionError, SessionResult};
use crate::core::{MessageId, SessionId};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::time::Duration;

/// The remote queue surface the agent depends on. A trait seam so the
/// run loop and listener are testable against scripted queues.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn create_session(&self) -> SessionResult<SessionId>;

    /// Long poll for the next message after `last_message_id`. `None`
    /// means the server-side poll window elapsed without a message.
    async fn get_next_message(
        &self,
        session: SessionId,
        last_message_id: Option<MessageId>,
    ) -> SessionResult<Option<Message>>;

    async fn delete_message(&self, session: SessionId, message_id: MessageId)
        -> SessionResult<()>;

    async fn delete_session(&self, session: SessionId) -> SessionResult<()>;
}

/// JSON-over-HTTP queue client.
pub struct HttpQueueService {
    client: reqwest::Client,
    base_url: String,
    agent_id: String,
}

#[derive(Deserialize)]
struct SessionEnvelope {
    session_id: SessionId,
}

impl HttpQueueService {
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>) -> SessionResult<Self> {
        // No global request timeout: the message poll is a long poll and
        // the server owns its window. Connect timeout still applies.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
        })
    }

    fn sessions_url(&self) -> String {
        format!("{}/agents/{}/sessions", self.base_url, self.agent_id)
    }

    fn session_url(&self, session: SessionId) -> String {
        format!("{}/{}", self.sessions_url(), session)
    }
}

fn transport(e: reqwest::Error) -> SessionError {
    SessionError::Transport(e.to_string())
}

#[async_trait]
impl QueueService for HttpQueueService {
    async fn create_session(&self) -> SessionResult<SessionId> {
        let response = self
            .client
            .post(self.sessions_url())
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            s if s.is_success() => {
                let envelope: SessionEnvelope = response.json().await.map_err(transport)?;
                Ok(envelope.session_id)
            }
            reqwest::StatusCode::NOT_FOUND => Err(SessionError::AgentNotFound),
            s => Err(SessionError::Server(format!("create session: {s}"))),
        }
    }

    async fn get_next_message(
        &self,
        session: SessionId,
        last_message_id: Option<MessageId>,
    ) -> SessionResult<Option<Message>> {
        let mut request = self
            .client
            .get(format!("{}/messages", self.session_url(session)));
        if let Some(last) = last_message_id {
            request = request.query(&[("last_message_id", last)]);
        }

        let response = request.send().await.map_err(transport)?;
        match response.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(None),
            s if s.is_success() => {
                let message: Message = response.json().await.map_err(transport)?;
                debug!(
                    "Received message {} of type '{}'",
                    message.message_id, message.message_type
                );
                Ok(Some(message))
            }
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => {
                Err(SessionError::SessionExpired)
            }
            s => Err(SessionError::Server(format!("get message: {s}"))),
        }
    }

    async fn delete_message(
        &self,
        session: SessionId,
        message_id: MessageId,
    ) -> SessionResult<()> {
        let response = self
            .client
            .delete(format!("{}/messages/{}", self.session_url(session), message_id))
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => {
                Err(SessionError::SessionExpired)
            }
            s => Err(SessionError::Server(format!("delete message: {s}"))),
        }
    }

    async fn delete_session(&self, session: SessionId) -> SessionResult<()> {
        let response = self
            .client
            .delete(self.session_url(session))
            .send()
            .await
            .map_err(transport)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SessionError::Server(format!(
                "delete session: {}",
                response.status()
            )))
        }
    }
}
