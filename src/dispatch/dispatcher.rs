/*!
 * Job Dispatcher
 * One worker process per job, with channel-based cancellation
 */

use super::types::{JobCancel, JobRequest, WorkerState};
use crate::core::JobId;
use crate::ipc::{cancel_frame, ChannelMessage, MessageType, WorkerChannel};
use crate::process::{ExecutionConfig, ProcessInvoker};
use ahash::RandomState;
use dashmap::DashMap;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One in-flight worker. The channel and kill token are owned by exactly
/// one registry entry and released when the reaper removes it.
struct WorkerEntry {
    state: WorkerState,
    channel: Arc<WorkerChannel>,
    kill: CancellationToken,
}

/// Owns the job-id to worker mapping.
///
/// Entries leave the registry through exactly one path: the dispatch task
/// reports the worker's termination over the done channel, and the reaper
/// task removes the entry. Cancellation is forwarded over the worker's
/// own channel; the dispatcher only fires a worker's kill token when that
/// channel has failed.
pub struct JobDispatcher {
    workers: Arc<DashMap<JobId, WorkerEntry, RandomState>>,
    done_tx: flume::Sender<JobId>,
    drained: Arc<Notify>,
    channel_timeout: Duration,
    worker_exe: PathBuf,
}

impl JobDispatcher {
    /// `worker_exe` is the program launched per job (normally the agent
    /// binary itself, re-entered in worker mode).
    pub fn new(worker_exe: PathBuf, channel_timeout: Duration) -> Self {
        let workers: Arc<DashMap<JobId, WorkerEntry, RandomState>> =
            Arc::new(DashMap::with_hasher(RandomState::new()));
        let drained = Arc::new(Notify::new());
        let (done_tx, done_rx) = flume::unbounded::<JobId>();

        // Reaper: the only code that removes registry entries. Removal is
        // idempotent; a second notification for the same id is a no-op.
        {
            let workers = Arc::clone(&workers);
            let drained = Arc::clone(&drained);
            tokio::spawn(async move {
                while let Ok(job_id) = done_rx.recv_async().await {
                    if workers.remove(&job_id).is_some() {
                        info!("Worker for job {job_id} finished, entry released");
                    }
                    if workers.is_empty() {
                        drained.notify_waiters();
                    }
                }
            });
        }

        Self {
            workers,
            done_tx,
            drained,
            channel_timeout,
            worker_exe,
        }
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Launch a worker for `job`. Fire-and-forget: failures are logged,
    /// never surfaced, and the registry stays consistent either way. A
    /// job id that already has a live worker is ignored.
    pub fn run(&self, job: JobRequest) {
        let job_id = job.job_id;
        if self.workers.contains_key(&job_id) {
            warn!("Job {job_id} already has a live worker, ignoring duplicate request");
            return;
        }

        let payload = match serde_json::to_string(&job) {
            Ok(p) => p,
            Err(e) => {
                error!("Job {job_id} payload failed to serialize: {e}");
                return;
            }
        };

        let channel = match WorkerChannel::create(self.channel_timeout) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!("Channel setup for job {job_id} failed: {e}");
                return;
            }
        };

        let kill = CancellationToken::new();
        self.workers.insert(
            job_id,
            WorkerEntry {
                state: WorkerState::New,
                channel: Arc::clone(&channel),
                kill: kill.clone(),
            },
        );
        info!("Dispatching job {job_id} ({})", job.display_name);

        let workers = Arc::clone(&self.workers);
        let done_tx = self.done_tx.clone();
        let worker_exe = self.worker_exe.display().to_string();
        tokio::spawn(async move {
            if let Some(mut entry) = workers.get_mut(&job_id) {
                entry.state = WorkerState::Starting;
            }
            let (handle_out, handle_in) = channel.handles();
            let config = ExecutionConfig::new(worker_exe)
                .with_args(vec!["worker".into(), handle_out, handle_in])
                .with_kill_on_cancel(true);
            let invoker = ProcessInvoker::new();

            let launch = {
                let kill = kill.clone();
                tokio::spawn(async move { invoker.execute(config, kill).await })
            };

            match channel
                .send(&ChannelMessage::new(MessageType::NewJob, payload))
                .await
            {
                Ok(()) => {
                    if let Some(mut entry) = workers.get_mut(&job_id) {
                        entry.state = WorkerState::Running;
                    }
                }
                Err(e) => {
                    // The worker never took the job; kill it and fall
                    // through to await the launch so nothing leaks.
                    error!("Job {job_id} payload delivery failed: {e}; killing worker");
                    kill.cancel();
                }
            }

            match launch.await {
                Ok(Ok(code)) => info!("Worker for job {job_id} exited with code {code}"),
                Ok(Err(e)) => warn!("Worker for job {job_id} ended abnormally: {e}"),
                Err(e) => error!("Worker task for job {job_id} panicked: {e}"),
            }

            if let Some(mut entry) = workers.get_mut(&job_id) {
                entry.state = WorkerState::Finished;
            }
            let _ = done_tx.send_async(job_id).await;
        });
    }

    /// Forward a cancel to the job's worker. Returns whether a live
    /// worker was found; delivery itself is best-effort and asynchronous.
    /// Unknown job ids are a logged no-op, re-cancelling is harmless.
    pub fn cancel(&self, msg: JobCancel) -> bool {
        let (channel, kill) = match self.workers.get(&msg.job_id) {
            Some(entry) => (Arc::clone(&entry.channel), entry.kill.clone()),
            None => {
                info!(
                    "Cancel for job {} matched no live worker, ignoring",
                    msg.job_id
                );
                return false;
            }
        };

        let job_id = msg.job_id;
        let body = serde_json::to_string(&msg).unwrap_or_default();
        tokio::spawn(async move {
            if let Err(e) = channel.send(&cancel_frame(body)).await {
                warn!("Cancel delivery for job {job_id} failed: {e}; killing worker");
                kill.cancel();
            }
        });
        true
    }

    /// Wait until every worker has finished or `timeout` elapses.
    /// Returns true when the registry drained in time. Safe to call
    /// concurrently with arriving `run` calls.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.workers.is_empty() {
                return true;
            }
            let notified = self.drained.notified();
            // Recheck after arming so a removal between the check and
            // the subscription cannot be missed.
            if self.workers.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.workers.is_empty();
            }
        }
    }

    /// Ask every worker to stop and wait for the registry to drain.
    /// Workers still alive at the deadline are force-killed.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Dispatcher shutdown: {} live workers", self.workers.len());
        for entry in self.workers.iter() {
            let channel = Arc::clone(&entry.channel);
            let kill = entry.kill.clone();
            tokio::spawn(async move {
                if channel
                    .send(&ChannelMessage::new(MessageType::Shutdown, ""))
                    .await
                    .is_err()
                {
                    kill.cancel();
                }
            });
        }

        if !self.wait_all(timeout).await {
            warn!("Workers still running at the shutdown deadline, killing them");
            for entry in self.workers.iter() {
                entry.kill.cancel();
            }
            let _ = self.wait_all(Duration::from_secs(15)).await;
        }
    }

    /// Lifecycle state of one worker, when it exists.
    pub fn worker_state(&self, job_id: &JobId) -> Option<WorkerState> {
        self.workers.get(job_id).map(|e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use uuid::Uuid;

    /// A stand-in worker executable: a shell script that reads `lines`
    /// frames from its outbound FIFO handle and exits.
    fn fake_worker(dir: &tempfile::TempDir, lines: u32) -> PathBuf {
        let path = dir.path().join("fake-worker.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "head -n{lines} \"$2\" >/dev/null").unwrap();
        writeln!(file, "exit 0").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn job(id: JobId) -> JobRequest {
        JobRequest {
            job_id: id,
            display_name: "test job".into(),
            command: "true".into(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn worker_entry_is_released_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = JobDispatcher::new(fake_worker(&dir, 1), Duration::from_secs(5));

        dispatcher.run(job(Uuid::new_v4()));
        assert!(dispatcher.wait_all(Duration::from_secs(10)).await);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn duplicate_job_id_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = JobDispatcher::new(fake_worker(&dir, 2), Duration::from_secs(5));

        let id = Uuid::new_v4();
        dispatcher.run(job(id));
        dispatcher.run(job(id));
        assert_eq!(dispatcher.len(), 1);

        // Unblock the single worker with its second expected frame.
        assert!(dispatcher.cancel(JobCancel {
            job_id: id,
            reason: None,
        }));
        assert!(dispatcher.wait_all(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn cancel_reaches_the_worker_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = JobDispatcher::new(fake_worker(&dir, 2), Duration::from_secs(5));

        let id = Uuid::new_v4();
        dispatcher.run(job(id));

        let cancel = JobCancel {
            job_id: id,
            reason: Some("test".into()),
        };
        assert!(dispatcher.cancel(cancel.clone()));
        assert!(dispatcher.wait_all(Duration::from_secs(10)).await);

        // The worker is gone; a repeat cancel is a no-op.
        assert!(!dispatcher.cancel(cancel));
    }

    #[tokio::test]
    async fn cancel_for_unknown_job_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = JobDispatcher::new(fake_worker(&dir, 1), Duration::from_secs(5));
        assert!(!dispatcher.cancel(JobCancel {
            job_id: Uuid::new_v4(),
            reason: None,
        }));
    }

    #[tokio::test]
    async fn shutdown_drains_all_workers() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = JobDispatcher::new(fake_worker(&dir, 2), Duration::from_secs(5));

        dispatcher.run(job(Uuid::new_v4()));
        dispatcher.run(job(Uuid::new_v4()));

        dispatcher.shutdown(Duration::from_secs(10)).await;
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn wait_all_times_out_with_a_stuck_worker() {
        let dir = tempfile::tempdir().unwrap();
        // Expects three frames but only ever receives one, so it lingers.
        let dispatcher = JobDispatcher::new(fake_worker(&dir, 3), Duration::from_secs(5));

        let id = Uuid::new_v4();
        dispatcher.run(job(id));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(dispatcher.worker_state(&id), Some(WorkerState::Running));
        assert!(!dispatcher.wait_all(Duration::from_millis(500)).await);

        dispatcher.shutdown(Duration::from_secs(1)).await;
        assert!(dispatcher.is_empty());
    }
}
