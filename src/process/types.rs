/*!
 * Process Types
 * Common types for subprocess execution
 */

use std::time::Duration;
use thiserror::Error;

/// Process operation result
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Process errors
#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Exit code {exit_code} returned from process: '{program}'")]
    NonZeroExit { exit_code: i32, program: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: ProcessState,
        to: ProcessState,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::Io(err.to_string())
    }
}

/// Subprocess handle state. Terminal states are exclusive and final;
/// the invoker is single-use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited,
    Killed,
}

/// Cancellation-escalation progress for one subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    Running,
    SigintSent,
    SigtermSent,
    Killed,
}

/// Which stream produced an output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single line of subprocess output tagged with its source stream
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

impl OutputLine {
    pub fn stdout(line: String) -> Self {
        Self {
            stream: OutputStream::Stdout,
            line,
        }
    }

    pub fn stderr(line: String) -> Self {
        Self {
            stream: OutputStream::Stderr,
            line,
        }
    }
}

/// Wait after SIGINT before escalating to SIGTERM
pub const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// Wait after SIGTERM before force-killing the process tree
pub const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);
/// Grace period between process exit and force-killing descendants that
/// still hold the output handles open
pub const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for one subprocess execution
#[derive(Clone)]
pub struct ExecutionConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env_vars: Vec<(String, String)>,
    /// Fail with `NonZeroExit` when the process exits non-zero
    pub require_zero: bool,
    /// Skip graceful escalation and kill the tree immediately on cancel
    pub kill_on_cancel: bool,
    /// Ordered stream of decoded output lines, both streams interleaved
    pub output_tx: Option<flume::Sender<OutputLine>>,
    /// Lines fed to the child's stdin; stdin is closed right after spawn
    /// when absent so a child that unexpectedly reads stdin cannot hang
    pub stdin_rx: Option<flume::Receiver<String>>,
    /// Keep stdin open after the first fed line
    pub keep_stdin_open: bool,
}

impl ExecutionConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            working_dir: None,
            env_vars: vec![],
            require_zero: false,
            kill_on_cancel: false,
            output_tx: None,
            stdin_rx: None,
            keep_stdin_open: false,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env_vars: Vec<(String, String)>) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn with_require_zero(mut self, require: bool) -> Self {
        self.require_zero = require;
        self
    }

    pub fn with_kill_on_cancel(mut self, kill: bool) -> Self {
        self.kill_on_cancel = kill;
        self
    }

    pub fn with_output(mut self, tx: flume::Sender<OutputLine>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    pub fn with_stdin(mut self, rx: flume::Receiver<String>) -> Self {
        self.stdin_rx = Some(rx);
        self
    }
}
