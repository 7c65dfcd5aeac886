use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the bridge module (`modules.bridge`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// How long one HTTP call waits for the broker reply.
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    /// Largest accepted request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_sec: default_request_timeout_sec(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl BridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout_sec == 0 {
            anyhow::bail!("request_timeout_sec must be greater than zero");
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("max_body_bytes must be greater than zero");
        }
        Ok(())
    }
}

fn default_request_timeout_sec() -> u64 {
    15
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}
