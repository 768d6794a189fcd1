/*!
 * Run Loop
 * Polls the queue, classifies messages, and coordinates self-update
 */

use crate::dispatch::{JobCancel, JobDispatcher, JobRequest};
use crate::session::{
    Message, MessageListener, SessionError, MSG_JOB_CANCEL, MSG_JOB_REQUEST, MSG_REFRESH,
};
use crate::update::{UpdateResult, Updater};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Final disposition of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Clean shutdown, no restart wanted
    Success,
    /// Unrecoverable error; the supervisor should not blindly restart
    TerminatedError,
    /// A newer version is staged; the supervisor should restart into it
    AgentUpdating,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::TerminatedError => 1,
            ExitCode::AgentUpdating => 3,
        }
    }
}

/// Bound on draining workers during shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

type UpdateTask = JoinHandle<UpdateResult<bool>>;

pub struct RunLoop {
    listener: Arc<MessageListener>,
    dispatcher: Arc<JobDispatcher>,
    updater: Arc<dyn Updater>,
    update_disabled: bool,
}

impl RunLoop {
    pub fn new(
        listener: Arc<MessageListener>,
        dispatcher: Arc<JobDispatcher>,
        updater: Arc<dyn Updater>,
        update_disabled: bool,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            updater,
            update_disabled,
        }
    }

    /// Run until shutdown, a terminal error, or a staged update.
    /// Always drains the dispatcher and deletes the session on the way
    /// out, whatever the outcome.
    pub async fn run(&self, shutdown: CancellationToken) -> ExitCode {
        if self.listener.create_session(&shutdown).await.is_err() {
            return ExitCode::TerminatedError;
        }

        let exit = self.message_loop(&shutdown).await;

        self.dispatcher.shutdown(SHUTDOWN_DRAIN_TIMEOUT).await;
        self.listener.delete_session().await;
        exit
    }

    async fn message_loop(&self, shutdown: &CancellationToken) -> ExitCode {
        // At most one update in flight; its task is raced against the
        // message poll so neither starves the other.
        let mut update_task: Option<UpdateTask> = None;

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, leaving message loop");
                return ExitCode::Success;
            }

            let poll_token = shutdown.child_token();
            let poll = self.listener.get_next_message(&poll_token);
            tokio::pin!(poll);

            let result = loop {
                if let Some(mut task) = update_task.take() {
                    tokio::select! {
                        joined = &mut task => {
                            if update_staged(joined) {
                                info!("Update staged; stopping message polling");
                                poll_token.cancel();
                                // The outstanding poll must settle before
                                // the session goes away.
                                if let Err(e) = (&mut poll).await {
                                    debug!("Outstanding poll ended: {e}");
                                }
                                return ExitCode::AgentUpdating;
                            }
                        }
                        result = &mut poll => {
                            update_task = Some(task);
                            break result;
                        }
                    }
                } else {
                    break (&mut poll).await;
                }
            };

            let message = match result {
                Ok(message) => message,
                Err(SessionError::Cancelled) => {
                    info!("Message poll cancelled by shutdown");
                    return ExitCode::Success;
                }
                Err(SessionError::SessionExpired) => {
                    error!("Session expired; cannot continue without a valid session");
                    return ExitCode::TerminatedError;
                }
                Err(e) => {
                    error!("Message poll failed: {e}");
                    return ExitCode::TerminatedError;
                }
            };

            self.process_message(message, &mut update_task, shutdown)
                .await;
        }
    }

    /// Classify and act on one message, then acknowledge it. Deletion is
    /// deliberately skipped in two cases so the message redelivers after
    /// restart: a job request while an update is in flight, and a cancel
    /// that found no worker while an update is in flight (its job may
    /// redeliver too). At-least-once beats losing work.
    async fn process_message(
        &self,
        message: Message,
        update_task: &mut Option<UpdateTask>,
        shutdown: &CancellationToken,
    ) {
        let update_in_flight = update_task.is_some();
        let mut skip_deletion = false;

        match message.message_type.as_str() {
            MSG_JOB_REQUEST => {
                if update_in_flight {
                    info!(
                        "Deferring job request (message {}) until after the update",
                        message.message_id
                    );
                    skip_deletion = true;
                } else {
                    match serde_json::from_str::<JobRequest>(&message.body) {
                        Ok(job) => self.dispatcher.run(job),
                        Err(e) => error!("Malformed job request payload: {e}"),
                    }
                }
            }
            MSG_JOB_CANCEL => match serde_json::from_str::<JobCancel>(&message.body) {
                Ok(cancel) => {
                    let found = self.dispatcher.cancel(cancel);
                    if update_in_flight && !found {
                        // The matching job request was deferred; the
                        // cancel must survive alongside it.
                        skip_deletion = true;
                    }
                }
                Err(e) => error!("Malformed job cancel payload: {e}"),
            },
            MSG_REFRESH => {
                if self.update_disabled {
                    info!("Updates are disabled, ignoring refresh message");
                } else if update_in_flight || self.updater.busy() {
                    info!("Update already in progress, ignoring refresh message");
                } else {
                    let updater = Arc::clone(&self.updater);
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let body = message.body.clone();
                    let cancel = shutdown.clone();
                    *update_task = Some(tokio::spawn(async move {
                        updater.self_update(&body, &dispatcher, &cancel).await
                    }));
                }
            }
            other => {
                warn!(
                    "Unsupported message type '{other}' (message {}), dropping",
                    message.message_id
                );
            }
        }

        if skip_deletion {
            debug!("Keeping message {} on the queue", message.message_id);
        } else {
            self.listener.delete_message(message.message_id).await;
        }
    }
}

fn update_staged(joined: Result<UpdateResult<bool>, tokio::task::JoinError>) -> bool {
    match joined {
        Ok(Ok(staged)) => staged,
        Ok(Err(e)) => {
            warn!("Self-update failed: {e}");
            false
        }
        Err(e) => {
            error!("Self-update task panicked: {e}");
            false
        }
    }
}
