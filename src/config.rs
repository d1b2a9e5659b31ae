//! Build-time tunables and the on-disk connection configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::rmp::ReliableMessageProtocolConfig;

/// Number of counters tracked behind the highest accepted peer counter.
pub const MESSAGE_COUNTER_WINDOW_SIZE: usize = 32;

/// Size of the counter synchronization challenge in bytes.
pub const MESSAGE_COUNTER_SYNC_CHALLENGE_SIZE: usize = 8;

/// How long a counter synchronization may stay unanswered before it is abandoned.
pub const MESSAGE_COUNTER_SYNC_TIMEOUT: Duration = Duration::from_millis(500);

/// Messages kept while waiting for counter synchronization to finish.
pub const MESSAGE_COUNTER_SYNC_QUEUE_SIZE: usize = 10;

pub const RMP_DEFAULT_INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(300);
pub const RMP_DEFAULT_ACTIVE_RETRY_INTERVAL: Duration = Duration::from_millis(300);
pub const RMP_DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(200);
pub const RMP_DEFAULT_MAX_RETRANS: u8 = 4;

/// Upper bound accepted for retry intervals advertised by peers.
pub const RMP_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

pub const RMP_BACKOFF_MARGIN: f64 = 1.1;
pub const RMP_BACKOFF_BASE: f64 = 1.6;
pub const RMP_BACKOFF_JITTER: f64 = 0.25;
pub const RMP_BACKOFF_THRESHOLD: u32 = 1;

/// Granularity of the connection read loop timers.
pub const RECEIVE_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub local_address: String,
    #[serde(default)]
    pub rmp: ReliableMessageProtocolConfig,
}

pub fn load_config(path: &str) -> Result<ConnectionConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    serde_json::from_str(&data).context(format!("parsing {}", path))
}

pub fn save_config(path: &str, config: &ConnectionConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmp_defaults_when_missing() {
        let c: ConnectionConfig = serde_json::from_str(r#"{"local_address":"0.0.0.0:5555"}"#).unwrap();
        assert_eq!(c.local_address, "0.0.0.0:5555");
        assert_eq!(c.rmp, ReliableMessageProtocolConfig::DEFAULT);
    }

    #[test]
    fn test_save_load() {
        let path = std::env::temp_dir().join(format!("matc-mrp-config-{}.json", std::process::id()));
        let path = path.to_str().unwrap();
        let config = ConnectionConfig {
            local_address: "127.0.0.1:5540".to_owned(),
            rmp: ReliableMessageProtocolConfig::DEFAULT
                .with_max_retrans(2)
                .with_ack_timeout(Duration::from_millis(50)),
        };
        save_config(path, &config).unwrap();
        let loaded = load_config(path).unwrap();
        std::fs::remove_file(path).unwrap();
        assert_eq!(loaded.local_address, config.local_address);
        assert_eq!(loaded.rmp, config.rmp);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_config("/nonexistent/matc-mrp.json").is_err());
    }
}
