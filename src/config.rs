/*!
 * Configuration
 * Environment-driven agent settings
 */

use log::warn;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const ENV_SERVER_URL: &str = "FLEET_AGENT_SERVER_URL";
pub const ENV_AGENT_ID: &str = "FLEET_AGENT_ID";
pub const ENV_CHANNEL_TIMEOUT: &str = "FLEET_AGENT_CHANNEL_TIMEOUT";
pub const ENV_DISABLE_UPDATE: &str = "FLEET_AGENT_DISABLE_UPDATE";
pub const ENV_STAGING_DIR: &str = "FLEET_AGENT_STAGING_DIR";

const CHANNEL_TIMEOUT_DEFAULT_SECS: u64 = 30;
const CHANNEL_TIMEOUT_MIN_SECS: u64 = 30;
const CHANNEL_TIMEOUT_MAX_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub agent_id: String,
    pub channel_timeout: Duration,
    pub update_disabled: bool,
    pub staging_dir: PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url =
            std::env::var(ENV_SERVER_URL).map_err(|_| ConfigError::Missing(ENV_SERVER_URL))?;
        let agent_id =
            std::env::var(ENV_AGENT_ID).map_err(|_| ConfigError::Missing(ENV_AGENT_ID))?;

        let channel_timeout = channel_timeout_from(std::env::var(ENV_CHANNEL_TIMEOUT).ok());
        let update_disabled = std::env::var_os(ENV_DISABLE_UPDATE).is_some();
        let staging_dir = std::env::var_os(ENV_STAGING_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("fleet-agent-staging"));

        Ok(Self {
            server_url,
            agent_id,
            channel_timeout,
            update_disabled,
            staging_dir,
        })
    }
}

/// Parse the channel timeout override, clamped to [30, 300] seconds.
/// Unparseable values fall back to the default.
fn channel_timeout_from(raw: Option<String>) -> Duration {
    let secs = match raw {
        None => CHANNEL_TIMEOUT_DEFAULT_SECS,
        Some(value) => match value.trim().parse::<u64>() {
            Ok(secs) => secs.clamp(CHANNEL_TIMEOUT_MIN_SECS, CHANNEL_TIMEOUT_MAX_SECS),
            Err(_) => {
                warn!("Ignoring unparseable {ENV_CHANNEL_TIMEOUT} value '{value}'");
                CHANNEL_TIMEOUT_DEFAULT_SECS
            }
        },
    };
    Duration::from_secs(secs)
}
