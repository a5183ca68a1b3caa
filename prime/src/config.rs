//! Prime link-endpoint configuration, loaded from the environment.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the link endpoint listens on.
    pub listen_addr: String,
    /// Pre-shared secret daemons must present at registration.
    pub registration_key: String,
    /// Default deadline for `send_command` awaiters.
    pub command_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let timeout_secs = vars
            .get("PRIME_COMMAND_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);

        let config = Self {
            listen_addr: vars
                .get("PRIME_LISTEN_ADDR")
                .cloned()
                .unwrap_or_else(|| format!("0.0.0.0:{}", alfred_protocol::DEFAULT_PRIME_PORT)),
            registration_key: vars
                .get("DAEMON_REGISTRATION_KEY")
                .cloned()
                .unwrap_or_default(),
            command_timeout: Duration::from_secs(timeout_secs),
        };
        anyhow::ensure!(
            !config.registration_key.is_empty(),
            "DAEMON_REGISTRATION_KEY is required"
        );
        Ok(config)
    }
}
