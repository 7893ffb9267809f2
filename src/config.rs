use crate::{
    connection::ReconnectPolicy,
    constants::{DEFAULT_SAMPLE_RATE, RECONNECT_DELAY, SUPPORTED_SAMPLE_RATES},
    output::OutputKind,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{io::ErrorKind, path::Path, time::Duration};
use tokio::fs::read_to_string;

pub const CONFIG_FILE: &str = "Config.toml";
pub const ORIGINATION_URL_ENV: &str = "CALL_LISTEN_ORIGINATION_URL";
pub const DEFAULT_ORIGINATION_URL: &str = "http://localhost:5000/api/vapi_call";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Endpoint that places the outbound call
    pub origination_url: String,

    /// Sample rate of the listen stream, negotiated with the provider
    pub sample_rate: u32,

    /// Retry once after an abnormal close. Disabling this gives a simple
    /// fire-and-forget listener.
    pub reconnect: bool,

    pub reconnect_delay_ms: u64,

    pub output: OutputKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origination_url: DEFAULT_ORIGINATION_URL.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            reconnect: true,
            reconnect_delay_ms: RECONNECT_DELAY.as_millis() as u64,
            output: OutputKind::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            bail!(
                "Unsupported sample rate {} Hz, expected one of {:?}",
                self.sample_rate,
                SUPPORTED_SAMPLE_RATES
            );
        }

        if self.origination_url.trim().is_empty() {
            bail!("origination_url must not be empty");
        }

        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.reconnect,
            delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

/// Loads [CONFIG_FILE] from the working directory.
pub async fn load() -> Result<Config> {
    load_from(CONFIG_FILE).await
}

/// Loads config from `path`, falling back to defaults when the file does not
/// exist. The origination URL can be overridden from the environment.
pub async fn load_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();

    let mut config = match read_to_string(path).await {
        Ok(contents) => toml::from_str::<Config>(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("{} not found, using defaults", path.display());
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    if let Ok(url) = std::env::var(ORIGINATION_URL_ENV) {
        if !url.trim().is_empty() {
            config.origination_url = url;
        }
    }

    config.validate()?;

    Ok(config)
}
