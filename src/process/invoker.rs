/*!
 * Process Invoker
 * Spawns one subprocess, streams its output in order, and escalates
 * cancellation through SIGINT -> SIGTERM -> kill-tree
 */

use super::control::{default_control, kill_tree, ProcessControl, SignalKind};
use super::types::{
    EscalationState, ExecutionConfig, OutputLine, ProcessError, ProcessResult, ProcessState,
    SIGINT_TIMEOUT, SIGTERM_TIMEOUT, STREAM_DRAIN_GRACE,
};
use crate::core::sync::ResetEvent;
use crossbeam_queue::SegQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shared state between the coordinating loop and the background tasks of
/// one execution.
struct Inner {
    control: Arc<dyn ProcessControl>,
    /// Lines pulled off the raw pipes by the two reader tasks
    queue: SegQueue<OutputLine>,
    /// Level-triggered wake for the drain loop, reset after each drain
    wake: ResetEvent,
    /// Reader tasks still pulling from a stream (starts at 2)
    readers: AtomicUsize,
    /// Process exited while readers were still active
    waiting_on_streams: AtomicBool,
    /// Completion: exit observed AND both streams drained (or forced)
    done: watch::Sender<bool>,
    exit_status: Mutex<Option<ExitStatus>>,
    escalation: Arc<Mutex<EscalationState>>,
}

impl Inner {
    fn complete(&self) {
        let _ = self.done.send(true);
    }

    async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Single-use subprocess handle.
///
/// The reader/coordinator split avoids per-line event callbacks from the
/// platform: under heavy output those degrade badly, so two dedicated
/// tasks pull raw lines into a lock-free queue and one drain loop re-emits
/// them, preserving per-stream order.
pub struct ProcessInvoker {
    control: Arc<dyn ProcessControl>,
    state: Arc<Mutex<ProcessState>>,
    escalation: Arc<Mutex<EscalationState>>,
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::with_control(default_control())
    }

    pub fn with_control(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            control,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            escalation: Arc::new(Mutex::new(EscalationState::Running)),
        }
    }

    /// Current lifecycle state of the subprocess handle.
    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// How far cancellation escalation has progressed.
    pub fn escalation(&self) -> EscalationState {
        *self.escalation.lock()
    }

    /// Run the configured command to completion and return its exit code.
    ///
    /// Returns `ProcessError::Cancelled` when `cancel` fired during the
    /// run (after the escalation sequence has fully settled), and
    /// `ProcessError::NonZeroExit` when `require_zero` is set and the
    /// process exited non-zero. A killed process is reported through
    /// `state()`, not as an exit-code failure.
    pub async fn execute(
        &self,
        config: ExecutionConfig,
        cancel: CancellationToken,
    ) -> ProcessResult<i32> {
        {
            let mut state = self.state.lock();
            if *state != ProcessState::NotStarted {
                return Err(ProcessError::InvalidStateTransition {
                    from: *state,
                    to: ProcessState::Running,
                });
            }
            *state = ProcessState::Running;
        }

        info!(
            "Starting process: program='{}' args={:?} working_dir={:?} kill_on_cancel={}",
            config.program, config.args, config.working_dir, config.kill_on_cancel
        );

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);
        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env_vars {
            cmd.env(key, value);
        }
        // Mark the child as agent-driven; CI=true only when nothing else
        // claimed it already.
        if !config.env_vars.iter().any(|(k, _)| k == "FLEET_AGENT") {
            cmd.env("FLEET_AGENT", "true");
        }
        if !config.env_vars.iter().any(|(k, _)| k == "CI") && std::env::var_os("CI").is_none() {
            cmd.env("CI", "true");
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{}: {}", config.program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::SpawnFailed(format!("{}: no pid", config.program)))?;
        let started = Instant::now();

        let (done_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            control: Arc::clone(&self.control),
            queue: SegQueue::new(),
            wake: ResetEvent::new(),
            readers: AtomicUsize::new(2),
            waiting_on_streams: AtomicBool::new(false),
            done: done_tx,
            exit_status: Mutex::new(None),
            escalation: Arc::clone(&self.escalation),
        });
        // Subscribed before any task can complete the run, so the
        // coordinating loop never misses the done edge.
        let mut done_rx = inner.done.subscribe();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::Io("stdout pipe unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::Io("stderr pipe unavailable".into()))?;
        tokio::spawn(read_stream(stdout, true, Arc::clone(&inner)));
        tokio::spawn(read_stream(stderr, false, Arc::clone(&inner)));

        let stdin = child.stdin.take();
        match (&config.stdin_rx, stdin) {
            (Some(feed), Some(pipe)) => {
                tokio::spawn(feed_stdin(
                    pipe,
                    feed.clone(),
                    config.keep_stdin_open,
                    Arc::clone(&inner),
                ));
            }
            // Close stdin so a child that unexpectedly reads it cannot
            // hang the pipeline.
            (None, stdin) => drop(stdin),
            _ => {}
        }

        // Exit watcher: stream completion is decoupled from process exit.
        // If the process exits while a detached grandchild still holds
        // the pipes open, a grace timer force-kills the tree to unblock
        // the readers.
        tokio::spawn(watch_exit(child, pid, Arc::clone(&inner)));

        // Cancellation escalation, armed for the lifetime of the run.
        let (cancel_finished_tx, mut cancel_finished_rx) = watch::channel(false);
        {
            let inner = Arc::clone(&inner);
            let cancel = cancel.clone();
            let kill_on_cancel = config.kill_on_cancel;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        cancel_and_kill_tree(&inner, pid, kill_on_cancel).await;
                        let _ = cancel_finished_tx.send(true);
                    }
                    _ = inner.wait_done() => {}
                }
            });
        }

        debug!("Process started with pid {pid}, waiting for process exit");

        // Coordinating loop: drain output bursts until completion.
        loop {
            tokio::select! {
                _ = inner.wake.wait() => {
                    drain_output(&inner, &config);
                }
                res = done_rx.changed() => {
                    if res.is_err() || *done_rx.borrow() {
                        break;
                    }
                }
            }
        }
        // One last sweep for lines enqueued right before completion.
        drain_output(&inner, &config);

        if cancel.is_cancelled() {
            // Let the escalation routine settle before reporting.
            while !*cancel_finished_rx.borrow() {
                if cancel_finished_rx.changed().await.is_err() {
                    break;
                }
            }
            debug!("Process cancellation finished");
        }

        let killed = *self.escalation.lock() == EscalationState::Killed;
        {
            let mut state = self.state.lock();
            *state = if killed {
                ProcessState::Killed
            } else {
                ProcessState::Exited
            };
        }

        let status = inner.exit_status.lock().take();
        let exit_code = status.map(exit_code_of).unwrap_or(-1);
        info!(
            "Finished process {} with exit code {} in {:?}",
            pid,
            exit_code,
            started.elapsed()
        );

        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        if config.require_zero && exit_code != 0 && !killed {
            return Err(ProcessError::NonZeroExit {
                exit_code,
                program: config.program,
            });
        }
        Ok(exit_code)
    }
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull raw lines from one pipe into the shared queue. Decoding is lossy
/// UTF-8 so a stray byte never fails the run.
async fn read_stream<R: AsyncRead + Unpin>(stream: R, is_stdout: bool, inner: Arc<Inner>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                inner.queue.push(if is_stdout {
                    OutputLine::stdout(line)
                } else {
                    OutputLine::stderr(line)
                });
                inner.wake.set();
            }
        }
    }

    debug!("stream read finished (stdout={is_stdout})");
    if inner.readers.fetch_sub(1, Ordering::SeqCst) == 1
        && inner.waiting_on_streams.load(Ordering::SeqCst)
    {
        inner.complete();
    }
}

/// Re-emit queued lines in enqueue order. The wake event is reset before
/// draining so a push racing the sweep re-arms it.
fn drain_output(inner: &Inner, config: &ExecutionConfig) {
    inner.wake.reset();
    while let Some(line) = inner.queue.pop() {
        if let Some(ref tx) = config.output_tx {
            let _ = tx.send(line);
        }
    }
}

async fn watch_exit(mut child: tokio::process::Child, pid: u32, inner: Arc<Inner>) {
    match child.wait().await {
        Ok(status) => {
            *inner.exit_status.lock() = Some(status);
        }
        Err(e) => warn!("wait for process {pid} failed: {e}"),
    }

    if inner.readers.load(Ordering::SeqCst) > 0 {
        inner.waiting_on_streams.store(true, Ordering::SeqCst);
        tokio::select! {
            _ = inner.wait_done() => {}
            _ = tokio::time::sleep(STREAM_DRAIN_GRACE) => {
                warn!(
                    "Process {pid} exited but its output streams are still open; \
                     force killing the process tree to unblock them"
                );
                kill_tree(inner.control.as_ref(), pid);
                inner.complete();
            }
        }
    } else {
        inner.complete();
    }
}

async fn feed_stdin(
    mut pipe: tokio::process::ChildStdin,
    feed: flume::Receiver<String>,
    keep_open: bool,
    inner: Arc<Inner>,
) {
    loop {
        tokio::select! {
            input = feed.recv_async() => match input {
                Ok(line) => {
                    if pipe.write_all(line.as_bytes()).await.is_err()
                        || pipe.write_all(b"\n").await.is_err()
                    {
                        break;
                    }
                    let _ = pipe.flush().await;
                    if !keep_open {
                        debug!("Close stdin after the first feed");
                        break;
                    }
                }
                Err(_) => break,
            },
            _ = inner.wait_done() => break,
        }
    }
    debug!("stdin stream write finished");
}

/// Graceful-then-forceful stop of the whole process tree. Never errors:
/// this runs on paths that are already shutting down.
async fn cancel_and_kill_tree(inner: &Inner, pid: u32, kill_on_cancel: bool) {
    if !kill_on_cancel {
        if send_signal(inner, pid, SignalKind::Interrupt, SIGINT_TIMEOUT).await {
            info!("Process {pid} cancelled through SIGINT");
            return;
        }
        if send_signal(inner, pid, SignalKind::Terminate, SIGTERM_TIMEOUT).await {
            info!("Process {pid} terminated through SIGTERM");
            return;
        }
        info!("Process {pid} ignored both cancel and terminate signals, killing the tree");
    }

    *inner.escalation.lock() = EscalationState::Killed;
    kill_tree(inner.control.as_ref(), pid);
}

/// Deliver one signal and wait up to `timeout` for natural exit. Returns
/// true when the process completed within the window.
async fn send_signal(inner: &Inner, pid: u32, kind: SignalKind, timeout: Duration) -> bool {
    {
        let mut escalation = inner.escalation.lock();
        *escalation = match kind {
            SignalKind::Interrupt => EscalationState::SigintSent,
            SignalKind::Terminate => EscalationState::SigtermSent,
            SignalKind::Kill => EscalationState::Killed,
        };
    }

    debug!("Sending {kind:?} to process {pid}");
    if let Err(e) = inner.control.signal(pid, kind) {
        debug!("{kind:?} delivery to {pid} failed: {e}");
        return false;
    }

    tokio::select! {
        _ = inner.wait_done() => true,
        _ = tokio::time::sleep(timeout) => {
            debug!("Process {pid} did not honor {kind:?} within {timeout:?}");
            false
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // Conventional shell mapping for signal deaths: 128 + signal.
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
