//! Config schema types (gateway, whatsapp session, bridge, restart policy).

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PairgateConfig {
    pub gateway: GatewayConfig,
    pub whatsapp: WhatsAppConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
        }
    }
}

/// Settings for the single WhatsApp session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Identifier the transport stores credentials under.
    pub client_id: String,

    /// Credential directory. Defaults to `<data_dir>/whatsapp_auth`.
    pub auth_dir: Option<PathBuf>,

    /// Start the session as soon as the gateway boots.
    pub auto_start: bool,

    /// Maximum number of messages held while the session is not ready.
    /// `None` keeps the queue unbounded.
    pub queue_capacity: Option<usize>,

    /// Buffer size of the status event broadcast channel.
    pub event_capacity: usize,

    /// Upper bound on a single outbound send, in milliseconds.
    pub send_timeout_ms: u64,

    /// Upper bound on tearing down a transport handle, in milliseconds.
    pub destroy_timeout_ms: u64,

    pub restart: RestartConfig,

    pub bridge: BridgeConfig,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            client_id: "pairgate-session".into(),
            auth_dir: None,
            auto_start: true,
            queue_capacity: None,
            event_capacity: 64,
            send_timeout_ms: 30_000,
            destroy_timeout_ms: 5_000,
            restart: RestartConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl WhatsAppConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    /// Resolve the credential directory, falling back to `data_root/whatsapp_auth`.
    pub fn resolved_auth_dir(&self, data_root: &std::path::Path) -> PathBuf {
        self.auth_dir
            .clone()
            .unwrap_or_else(|| data_root.join("whatsapp_auth"))
    }
}

/// Restart supervisor policy.
///
/// The defaults reproduce a fixed 3 second cool-down with no attempt limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub cooldown_ms: u64,
    /// Multiplier applied to the delay after each consecutive failed attempt.
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Give up after this many consecutive attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 3_000,
            backoff_factor: 1.0,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

/// External bridge process that speaks to the chat network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "pairgate-wa-bridge".into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}
