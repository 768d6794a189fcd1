/*!
 * Run Loop Tests
 * Full agent loop against a scripted queue and a gated updater
 */

use async_trait::async_trait;
use fleet_agent::core::{MessageId, SessionId};
use fleet_agent::dispatch::{JobDispatcher, JobRequest};
use fleet_agent::runloop::{ExitCode, RunLoop};
use fleet_agent::session::{Message, MessageListener, QueueService, SessionError, SessionResult};
use fleet_agent::update::{UpdateResult, Updater};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One scripted poll outcome.
enum Step {
    Deliver(Message),
    Expired,
}

/// In-memory queue: serves scripted steps in order, then pends forever
/// like a real long poll with nothing to say.
struct ScriptedQueue {
    steps: Mutex<VecDeque<Step>>,
    deleted: Mutex<Vec<MessageId>>,
    session_deleted: AtomicBool,
    agent_unregistered: bool,
}

impl ScriptedQueue {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            deleted: Mutex::new(vec![]),
            session_deleted: AtomicBool::new(false),
            agent_unregistered: false,
        }
    }
}

#[async_trait]
impl QueueService for ScriptedQueue {
    async fn create_session(&self) -> SessionResult<SessionId> {
        if self.agent_unregistered {
            return Err(SessionError::AgentNotFound);
        }
        Ok(Uuid::new_v4())
    }

    async fn get_next_message(
        &self,
        _session: SessionId,
        _last_message_id: Option<MessageId>,
    ) -> SessionResult<Option<Message>> {
        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Deliver(message)) => Ok(Some(message)),
            Some(Step::Expired) => Err(SessionError::SessionExpired),
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn delete_message(
        &self,
        _session: SessionId,
        message_id: MessageId,
    ) -> SessionResult<()> {
        self.deleted.lock().push(message_id);
        Ok(())
    }

    async fn delete_session(&self, _session: SessionId) -> SessionResult<()> {
        self.session_deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Updater that blocks until the test releases it, then reports whether
/// a new version was staged.
struct GatedUpdater {
    release: Notify,
    staged: bool,
    busy: AtomicBool,
    calls: AtomicUsize,
}

impl GatedUpdater {
    fn new(staged: bool) -> Self {
        Self {
            release: Notify::new(),
            staged,
            busy: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Updater for GatedUpdater {
    async fn self_update(
        &self,
        _refresh_body: &str,
        _dispatcher: &JobDispatcher,
        _cancel: &CancellationToken,
    ) -> UpdateResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.busy.store(true, Ordering::SeqCst);
        self.release.notified().await;
        self.busy.store(false, Ordering::SeqCst);
        Ok(self.staged)
    }

    fn busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Stand-in worker executable: reads one channel frame and exits.
fn fake_worker(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("fake-worker.sh");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "head -n1 \"$2\" >/dev/null").unwrap();
    writeln!(file, "exit 0").unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn job_message(message_id: MessageId, job_id: Uuid) -> Message {
    let body = serde_json::to_string(&JobRequest {
        job_id,
        display_name: format!("job-{job_id}"),
        command: "true".into(),
        args: vec![],
        working_dir: None,
        env: HashMap::new(),
    })
    .unwrap();
    Message {
        message_id,
        message_type: "job-request".into(),
        body,
    }
}

struct Harness {
    queue: Arc<ScriptedQueue>,
    updater: Arc<GatedUpdater>,
    dispatcher: Arc<JobDispatcher>,
    run_loop: RunLoop,
    _dir: tempfile::TempDir,
}

fn harness(steps: Vec<Step>, staged: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(ScriptedQueue::new(steps));
    let updater = Arc::new(GatedUpdater::new(staged));
    let dispatcher = Arc::new(JobDispatcher::new(fake_worker(&dir), Duration::from_secs(30)));
    let listener = Arc::new(MessageListener::new(
        Arc::clone(&queue) as Arc<dyn QueueService>
    ));
    let run_loop = RunLoop::new(
        listener,
        Arc::clone(&dispatcher),
        Arc::clone(&updater) as Arc<dyn Updater>,
        false,
    );
    Harness {
        queue,
        updater,
        dispatcher,
        run_loop,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_jobs_around_a_stalled_update() {
    // job J1, then a refresh whose update stalls, then job J2 arriving
    // mid-update. J1 runs and its message is deleted; the refresh is
    // deleted once the update task starts; J2 is deferred and its
    // message survives for redelivery after the restart.
    let j1 = Uuid::new_v4();
    let j2 = Uuid::new_v4();
    let steps = vec![
        Step::Deliver(job_message(1, j1)),
        Step::Deliver(Message {
            message_id: 2,
            message_type: "refresh".into(),
            body: "{}".into(),
        }),
        Step::Deliver(job_message(3, j2)),
    ];
    let h = harness(steps, true);

    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        let run_loop = h.run_loop;
        tokio::spawn(async move { run_loop.run(shutdown).await })
    };

    // Let the loop chew through all three messages, then finish the
    // stalled update.
    tokio::time::sleep(Duration::from_millis(600)).await;
    h.updater.release.notify_one();

    let exit = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run loop should finish once the update stages")
        .unwrap();
    assert_eq!(exit, ExitCode::AgentUpdating);

    assert_eq!(h.updater.calls.load(Ordering::SeqCst), 1);
    let deleted = h.queue.deleted.lock().clone();
    assert_eq!(deleted, vec![1, 2], "J2's message must survive");
    assert!(h.queue.session_deleted.load(Ordering::SeqCst));
    assert!(h.dispatcher.is_empty());
}

#[tokio::test]
async fn test_unsupported_message_is_dropped_and_loop_continues() {
    let steps = vec![Step::Deliver(Message {
        message_id: 1,
        message_type: "telemetry".into(),
        body: "{}".into(),
    })];
    let h = harness(steps, false);

    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        let run_loop = h.run_loop;
        tokio::spawn(async move { run_loop.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();

    let exit = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, ExitCode::Success);
    assert_eq!(h.queue.deleted.lock().clone(), vec![1]);
    assert!(h.queue.session_deleted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancel_without_matching_worker_is_acknowledged() {
    // No update in flight: the cancel finds nothing and the message is
    // still deleted, matching at-most-once handling for stale cancels.
    let body = serde_json::json!({ "job_id": Uuid::new_v4() }).to_string();
    let steps = vec![Step::Deliver(Message {
        message_id: 5,
        message_type: "job-cancel".into(),
        body,
    })];
    let h = harness(steps, false);

    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        let run_loop = h.run_loop;
        tokio::spawn(async move { run_loop.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();

    let exit = run.await.unwrap();
    assert_eq!(exit, ExitCode::Success);
    assert_eq!(h.queue.deleted.lock().clone(), vec![5]);
}

#[tokio::test]
async fn test_unregistered_agent_terminates_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut scripted = ScriptedQueue::new(vec![]);
    scripted.agent_unregistered = true;
    let queue = Arc::new(scripted);

    let dispatcher = Arc::new(JobDispatcher::new(fake_worker(&dir), Duration::from_secs(30)));
    let listener = Arc::new(MessageListener::new(
        Arc::clone(&queue) as Arc<dyn QueueService>
    ));
    let run_loop = RunLoop::new(
        listener,
        dispatcher,
        Arc::new(GatedUpdater::new(false)) as Arc<dyn Updater>,
        false,
    );

    let exit = run_loop.run(CancellationToken::new()).await;
    assert_eq!(exit, ExitCode::TerminatedError);
    assert!(!queue.session_deleted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_session_expiry_is_terminal() {
    let h = harness(vec![Step::Expired], false);

    let exit = h.run_loop.run(CancellationToken::new()).await;
    assert_eq!(exit, ExitCode::TerminatedError);
    // Teardown still runs: the (expired) session delete is attempted.
    assert!(h.queue.session_deleted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_refresh_ignored_when_updates_disabled() {
    let j1 = Uuid::new_v4();
    let steps = vec![
        Step::Deliver(Message {
            message_id: 1,
            message_type: "refresh".into(),
            body: "{}".into(),
        }),
        Step::Deliver(job_message(2, j1)),
    ];

    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(ScriptedQueue::new(steps));
    let updater = Arc::new(GatedUpdater::new(true));
    let dispatcher = Arc::new(JobDispatcher::new(fake_worker(&dir), Duration::from_secs(30)));
    let listener = Arc::new(MessageListener::new(
        Arc::clone(&queue) as Arc<dyn QueueService>
    ));
    let run_loop = RunLoop::new(
        listener,
        Arc::clone(&dispatcher),
        Arc::clone(&updater) as Arc<dyn Updater>,
        true,
    );

    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_loop.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();

    let exit = run.await.unwrap();
    assert_eq!(exit, ExitCode::Success);
    // The refresh never started an update, and the job after it ran.
    assert_eq!(updater.calls.load(Ordering::SeqCst), 0);
    assert_eq!(queue.deleted.lock().clone(), vec![1, 2]);
}
