use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// How much of the log a refresh delivers around a viewer's cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowConfig {
    /// Records before the cursor included in a window.
    pub lookback: u64,
    /// Maximum records per window.
    pub batch_size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            lookback: 40,
            batch_size: 80,
        }
    }
}

impl WindowConfig {
    /// A window must always be able to reach the cursor itself.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch size must be at least 1".into());
        }
        if self.batch_size as u64 <= self.lookback {
            return Err(format!(
                "batch size ({}) must exceed lookback ({})",
                self.batch_size, self.lookback
            ));
        }
        Ok(())
    }
}

/// Liveness probing of viewer connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    /// How long a ping may go unanswered.
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_millis(500),
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// 0 picks a free port.
    pub port: u16,
    /// Outbound frames buffered per viewer before refreshes are dropped.
    pub max_send_queue: usize,
    /// Largest accepted viewer message, in bytes.
    pub max_inbound_message: usize,
    pub window: WindowConfig,
    pub keepalive: KeepaliveConfig,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_send_queue: 64,
            max_inbound_message: 1024,
            window: WindowConfig::default(),
            keepalive: KeepaliveConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}
