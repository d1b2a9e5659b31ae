//! Reliable Message Protocol timing parameters.
//!
//! [ReliableMessageProtocolConfig::DEFAULT] is the process wide default. Per peer
//! values (for example intervals advertised by a sleepy device in its DNS-SD TXT
//! record) are built as copies using the `with_*` methods and never modify the default.

use std::{collections::HashMap, io::Cursor, io::Read, time::Duration};

use anyhow::Result;
use byteorder::ReadBytesExt;
use serde::{Deserialize, Serialize};

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableMessageProtocolConfig {
    /// Wait before the first retransmission of a reliable message
    #[serde(with = "crate::util::serde_ms")]
    pub initial_retrans_timeout: Duration,
    /// Wait before each subsequent retransmission
    #[serde(with = "crate::util::serde_ms")]
    pub active_retrans_timeout: Duration,
    /// How long an ack may be held back waiting for a message to piggyback on
    #[serde(with = "crate::util::serde_ms")]
    pub ack_timeout: Duration,
    /// Retransmissions attempted before the peer is considered unreachable
    pub max_retrans: u8,
}

impl ReliableMessageProtocolConfig {
    pub const DEFAULT: Self = Self {
        initial_retrans_timeout: config::RMP_DEFAULT_INITIAL_RETRY_INTERVAL,
        active_retrans_timeout: config::RMP_DEFAULT_ACTIVE_RETRY_INTERVAL,
        ack_timeout: config::RMP_DEFAULT_ACK_TIMEOUT,
        max_retrans: config::RMP_DEFAULT_MAX_RETRANS,
    };

    pub const TXT_KEY_IDLE_INTERVAL: &'static str = "SII";
    pub const TXT_KEY_ACTIVE_INTERVAL: &'static str = "SAI";
    pub const TXT_KEY_LEGACY_IDLE_INTERVAL: &'static str = "CRI";
    pub const TXT_KEY_LEGACY_ACTIVE_INTERVAL: &'static str = "CRA";

    pub const fn with_initial_retrans_timeout(self, timeout: Duration) -> Self {
        Self {
            initial_retrans_timeout: timeout,
            ..self
        }
    }

    pub const fn with_active_retrans_timeout(self, timeout: Duration) -> Self {
        Self {
            active_retrans_timeout: timeout,
            ..self
        }
    }

    pub const fn with_ack_timeout(self, timeout: Duration) -> Self {
        Self {
            ack_timeout: timeout,
            ..self
        }
    }

    pub const fn with_max_retrans(self, max_retrans: u8) -> Self {
        Self { max_retrans, ..self }
    }

    /// Apply retry intervals advertised in DNS-SD TXT records.
    ///
    /// Recognizes `SII`/`SAI` and the older `CRI`/`CRA` keys, values in milliseconds.
    /// Values which are not a number, zero or longer than one hour are ignored.
    pub fn with_txt_overrides(self, txt: &HashMap<String, String>) -> Self {
        let mut out = self;
        let idle = txt
            .get(Self::TXT_KEY_IDLE_INTERVAL)
            .or_else(|| txt.get(Self::TXT_KEY_LEGACY_IDLE_INTERVAL));
        if let Some(interval) = idle.and_then(|v| parse_interval(v)) {
            out.initial_retrans_timeout = interval;
        }
        let active = txt
            .get(Self::TXT_KEY_ACTIVE_INTERVAL)
            .or_else(|| txt.get(Self::TXT_KEY_LEGACY_ACTIVE_INTERVAL));
        if let Some(interval) = active.and_then(|v| parse_interval(v)) {
            out.active_retrans_timeout = interval;
        }
        out
    }

    /// Time to wait for an ack after a message was sent `send_count` times before.
    ///
    /// `jitter` is expected in range 0..1 and spreads retransmissions of
    /// different nodes apart. Values outside are clamped, NaN counts as 0.
    /// Result never exceeds [config::RMP_MAX_RETRY_INTERVAL].
    pub fn retransmit_timeout(&self, send_count: u32, jitter: f64) -> Duration {
        let base = if send_count == 0 {
            self.initial_retrans_timeout
        } else {
            self.active_retrans_timeout
        };
        if base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = send_count.saturating_sub(config::RMP_BACKOFF_THRESHOLD);
        let backoff = config::RMP_BACKOFF_BASE.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        let factor = config::RMP_BACKOFF_MARGIN * backoff * (1.0 + jitter * config::RMP_BACKOFF_JITTER);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .map_or(config::RMP_MAX_RETRY_INTERVAL, |d| d.min(config::RMP_MAX_RETRY_INTERVAL))
    }

    pub fn retransmit_timeout_random(&self, send_count: u32) -> Duration {
        self.retransmit_timeout(send_count, rand::random::<f64>())
    }
}

impl Default for ReliableMessageProtocolConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_interval(value: &str) -> Option<Duration> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 && Duration::from_millis(ms) <= config::RMP_MAX_RETRY_INTERVAL => {
            Some(Duration::from_millis(ms))
        }
        _ => {
            log::debug!("ignoring advertised retry interval {:?}", value);
            None
        }
    }
}

/// Decode raw TXT record data (sequence of length prefixed `key=value` strings).
pub fn parse_txt_records(data: &[u8]) -> Result<HashMap<String, String>> {
    let mut cursor = Cursor::new(data);
    let mut out = HashMap::new();
    while (cursor.position() as usize) < data.len() {
        let len = cursor.read_u8()?;
        let mut buf = vec![0; len as usize];
        cursor.read_exact(buf.as_mut_slice())?;
        let entry = std::str::from_utf8(&buf)?;
        if let Some((key, value)) = entry.split_once('=') {
            out.insert(key.to_owned(), value.to_owned());
        }
    }
    Ok(out)
}
