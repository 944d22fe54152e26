// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session configuration.
//!
//! Settings are plain serde structs so they can be built in code or loaded
//! from a YAML file:
//!
//! ```yaml
//! keepalive_interval: 30
//! poll_interval_ms: 250
//! proxy:
//!   type: socks5
//!   host: proxy.internal
//!   port: 1080
//! ```

mod utils;

pub use utils::{default_config_path, expand_tilde};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Default keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL: u64 = 60;

/// Default number of unanswered keepalives before the transport gives up.
pub const DEFAULT_KEEPALIVE_MAX: usize = 3;

/// Default bounded wait of the session loop on transport readiness.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default cap on bytes buffered per channel while the remote window is closed.
pub const DEFAULT_WRITE_BUFFER_LIMIT: usize = 1024 * 1024;

/// Default capacity of the delegate notification queue.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Proxy protocols supported for the outbound TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// Connect directly.
    #[default]
    None,
    Socks4,
    Socks4a,
    Socks5,
    /// HTTP CONNECT. `https` is accepted as an alias.
    #[serde(alias = "https")]
    Http,
}

/// Proxy used to reach the SSH server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(rename = "type")]
    pub kind: ProxyType,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn is_direct(&self) -> bool {
        self.kind == ProxyType::None
    }

    /// Proxy port, falling back to the conventional port of the protocol.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.kind {
            ProxyType::Http => 8080,
            _ => 1080,
        })
    }
}

/// Settings for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub proxy: ProxyConfig,
    /// Command whose stdin/stdout carry the SSH stream. `%h` and `%p` expand
    /// to the target host and port.
    pub proxy_command: Option<String>,
    /// Keepalive interval in seconds. 0 disables keepalives.
    pub keepalive_interval: u64,
    pub keepalive_max: usize,
    pub poll_interval_ms: u64,
    pub write_buffer_limit: usize,
    pub notification_capacity: usize,
    /// Client identification string sent during banner exchange.
    pub client_id: String,
    /// Offer zlib compression ahead of `none` during key exchange.
    pub compression: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            proxy_command: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_max: DEFAULT_KEEPALIVE_MAX,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            write_buffer_limit: DEFAULT_WRITE_BUFFER_LIMIT,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            client_id: format!("SSH-2.0-sshkit_{}", env!("CARGO_PKG_VERSION")),
            compression: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a YAML file, returning defaults if it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        let expanded_path = expand_tilde(path);

        if !expanded_path.exists() {
            tracing::debug!(
                "Config file not found at {:?}, using defaults",
                expanded_path
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&expanded_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to read configuration file at {}",
                    expanded_path.display()
                )
            })?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid configuration in {}", expanded_path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.proxy.is_direct() && self.proxy.host.as_deref().unwrap_or("").is_empty() {
            bail!("proxy type {:?} requires a proxy host", self.proxy.kind);
        }
        if self.proxy.password.is_some() && self.proxy.username.is_none() {
            bail!("proxy password given without a proxy username");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.notification_capacity == 0 {
            bail!("notification_capacity must be greater than zero");
        }
        if !self.client_id.starts_with("SSH-2.0-") {
            bail!("client_id must start with \"SSH-2.0-\"");
        }
        Ok(())
    }

    /// Keepalive period, or `None` when keepalives are disabled.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_interval > 0).then(|| Duration::from_secs(self.keepalive_interval))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
