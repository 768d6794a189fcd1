/*!
 * Self Update
 * Downloads and stages a newer agent version while jobs drain
 */

use crate::dispatch::JobDispatcher;
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Update operation result
pub type UpdateResult<T> = Result<T, UpdateError>;

/// Update errors
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Malformed refresh payload: {0}")]
    Malformed(String),

    #[error("Package download failed: {0}")]
    Download(String),

    #[error("Package staging failed: {0}")]
    Staging(String),

    #[error("Update cancelled")]
    Cancelled,
}

/// Body of a `refresh` queue message.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshPayload {
    pub target_version: String,
    pub download_url: String,
}

/// Seam for the run loop; lets tests substitute a scripted updater.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Returns `true` iff a newer version was downloaded and staged and
    /// the agent should restart into it.
    async fn self_update(
        &self,
        refresh_body: &str,
        dispatcher: &JobDispatcher,
        cancel: &CancellationToken,
    ) -> UpdateResult<bool>;

    /// Whether an update is currently in flight.
    fn busy(&self) -> bool;
}

/// Bound on waiting for running jobs to vacate before staging completes.
const JOB_DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SelfUpdater {
    client: reqwest::Client,
    current_version: String,
    staging_dir: PathBuf,
    busy: AtomicBool,
}

impl SelfUpdater {
    pub fn new(current_version: impl Into<String>, staging_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            current_version: current_version.into(),
            staging_dir,
            busy: AtomicBool::new(false),
        }
    }

    async fn download(&self, payload: &RefreshPayload) -> UpdateResult<PathBuf> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| UpdateError::Staging(e.to_string()))?;

        let response = self
            .client
            .get(&payload.download_url)
            .send()
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(UpdateError::Download(format!(
                "server returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;

        let staged = self
            .staging_dir
            .join(format!("fleet-agent-{}.pkg", payload.target_version));
        tokio::fs::write(&staged, &bytes)
            .await
            .map_err(|e| UpdateError::Staging(e.to_string()))?;
        Ok(staged)
    }
}

#[async_trait]
impl Updater for SelfUpdater {
    async fn self_update(
        &self,
        refresh_body: &str,
        dispatcher: &JobDispatcher,
        cancel: &CancellationToken,
    ) -> UpdateResult<bool> {
        if self.busy.swap(true, Ordering::SeqCst) {
            warn!("Update already in flight, ignoring refresh");
            return Ok(false);
        }
        let _reset = BusyGuard(&self.busy);

        let payload: RefreshPayload = serde_json::from_str(refresh_body)
            .map_err(|e| UpdateError::Malformed(e.to_string()))?;

        if !version_newer(&payload.target_version, &self.current_version) {
            info!(
                "Already on version {} (target {}), nothing to do",
                self.current_version, payload.target_version
            );
            return Ok(false);
        }

        info!(
            "Updating from {} to {}",
            self.current_version, payload.target_version
        );
        let staged = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            result = self.download(&payload) => result?,
        };
        info!("Package staged at {}", staged.display());

        // Running jobs vacate before the restart is reported as ready.
        info!("Waiting for running jobs to finish before restarting");
        if !dispatcher.wait_all(JOB_DRAIN_TIMEOUT).await {
            warn!(
                "Jobs still running after {JOB_DRAIN_TIMEOUT:?}, restarting with workers alive"
            );
        }

        Ok(true)
    }

    fn busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Dot-separated numeric version comparison; non-numeric segments fall
/// back to lexical order.
fn version_newer(target: &str, current: &str) -> bool {
    let mut t = target.split('.');
    let mut c = current.split('.');
    loop {
        match (t.next(), c.next()) {
            (None, None) => return false,
            (Some(_), None) => return true,
            (None, Some(_)) => return false,
            (Some(a), Some(b)) => {
                let ordering = match (a.parse::<u64>(), b.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => a.cmp(b),
                };
                match ordering {
                    std::cmp::Ordering::Greater => return true,
                    std::cmp::Ordering::Less => return false,
                    std::cmp::Ordering::Equal => continue,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison() {
        assert!(version_newer("2.0.0", "1.9.9"));
        assert!(version_newer("1.10.0", "1.9.0"));
        assert!(version_newer("1.2.3.1", "1.2.3"));
        assert!(!version_newer("1.2.3", "1.2.3"));
        assert!(!version_newer("1.2.2", "1.2.3"));
        assert!(!version_newer("1.2", "1.2.0"));
    }

    #[tokio::test]
    async fn malformed_refresh_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let updater = SelfUpdater::new("1.0.0", dir.path().to_path_buf());
        let dispatcher = JobDispatcher::new("true".into(), Duration::from_secs(30));

        let result = updater
            .self_update("not json", &dispatcher, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(UpdateError::Malformed(_))));
        assert!(!updater.busy());
    }

    #[tokio::test]
    async fn same_version_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let updater = SelfUpdater::new("1.2.3", dir.path().to_path_buf());
        let dispatcher = JobDispatcher::new("true".into(), Duration::from_secs(30));

        let body = r#"{"target_version":"1.2.3","download_url":"http://unused.invalid/pkg"}"#;
        let updated = updater
            .self_update(body, &dispatcher, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!updated);
        assert!(!updater.busy());
    }
}
