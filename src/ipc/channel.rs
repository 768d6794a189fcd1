/*!
 * Worker Channel
 * FIFO pair connecting the agent to one worker process
 */

use super::types::{ChannelError, ChannelMessage, ChannelResult, MessageType};
use log::debug;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Host end of a worker channel.
///
/// Two FIFOs live in a private temp dir: one the host writes and the
/// worker reads, one reserved for the reverse direction. The two paths
/// are handed to the worker as positional arguments so the job payload
/// never touches argv or the environment. The temp dir (and both FIFOs)
/// is removed when the channel is dropped, which happens exactly once,
/// when the owning registry entry is released.
pub struct WorkerChannel {
    dir: tempfile::TempDir,
    out_path: PathBuf,
    in_path: PathBuf,
    /// Write end of the outbound FIFO, opened on first send. The open
    /// itself blocks until the worker opens its read end, so it lives
    /// under the same timeout as the send.
    writer: Mutex<Option<File>>,
    timeout: Duration,
}

impl WorkerChannel {
    /// Create the FIFO pair. `timeout` bounds every subsequent `send`.
    pub fn create(timeout: Duration) -> ChannelResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("fleet-agent-channel-")
            .tempdir()
            .map_err(|e| ChannelError::Setup(format!("temp dir: {e}")))?;

        let out_path = dir.path().join("host-out");
        let in_path = dir.path().join("host-in");
        for path in [&out_path, &in_path] {
            nix::unistd::mkfifo(
                path.as_path(),
                nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR,
            )
            .map_err(|e| ChannelError::Setup(format!("mkfifo {}: {e}", path.display())))?;
        }

        debug!("Worker channel created at {}", dir.path().display());
        Ok(Self {
            dir,
            out_path,
            in_path,
            writer: Mutex::new(None),
            timeout,
        })
    }

    /// The two handle strings passed to the worker as positional args,
    /// in (out, in) order from the host's perspective.
    pub fn handles(&self) -> (String, String) {
        (
            self.out_path.display().to_string(),
            self.in_path.display().to_string(),
        )
    }

    /// Send one frame, bounded by the channel timeout. A worker that
    /// never connects or never drains its end surfaces here as
    /// `ChannelError::Timeout` rather than a silent stall.
    pub async fn send(&self, msg: &ChannelMessage) -> ChannelResult<()> {
        tokio::time::timeout(self.timeout, self.send_inner(msg))
            .await
            .map_err(|_| ChannelError::Timeout(self.timeout))?
    }

    async fn send_inner(&self, msg: &ChannelMessage) -> ChannelResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.out_path)
                .await?;
            *writer = Some(file);
        }

        let file = writer.as_mut().ok_or(ChannelError::Closed)?;
        let mut frame = serde_json::to_vec(msg)
            .map_err(|e| ChannelError::Malformed(e.to_string()))?;
        frame.push(b'\n');
        file.write_all(&frame).await?;
        file.flush().await?;
        debug!(
            "Sent {:?} frame over channel {}",
            msg.message_type,
            self.dir.path().display()
        );
        Ok(())
    }
}

/// Worker end of a channel.
///
/// The worker reads frames from the host's outbound FIFO. The inbound
/// handle completes the pair; job results travel back through the worker
/// exit status, so no frames flow that way and the FIFO stays unopened.
pub struct WorkerConnection {
    reader: BufReader<File>,
}

impl WorkerConnection {
    /// Connect from the two handle strings received on the command line.
    /// Blocks until the host opens its write end, so callers bound it
    /// with a timeout.
    pub async fn connect(handle_out: &str, handle_in: &str) -> ChannelResult<Self> {
        let in_path = PathBuf::from(handle_in);
        if !in_path.exists() {
            return Err(ChannelError::Setup(format!(
                "missing channel handle: {handle_in}"
            )));
        }

        // A FIFO read-open waits for the host's write end, which the
        // host opens on its first send.
        let read = File::open(handle_out).await?;
        Ok(Self {
            reader: BufReader::new(read),
        })
    }

    /// Receive the next frame. `Ok(None)` means the host closed its end.
    pub async fn recv(&mut self) -> ChannelResult<Option<ChannelMessage>> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line).await {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let msg: ChannelMessage = serde_json::from_str(trimmed)
                        .map_err(|e| ChannelError::Malformed(e.to_string()))?;
                    return Ok(Some(msg));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Convenience constructor for the standard cancel frame.
pub fn cancel_frame(body: impl Into<String>) -> ChannelMessage {
    ChannelMessage::new(MessageType::CancelJob, body)
}
