//! Serde helpers storing [Duration] values as integer milliseconds
//!
//! Used with `#[serde(with = "crate::util::serde_ms")]` so that configuration
//! files carry plain numbers like `"ack_timeout": 200`.

use std::time::Duration;

use serde::Deserialize;

/// Serialize Duration as number of milliseconds
///
/// # Arguments
/// * `value` - Duration to serialize
/// * `serializer` - Serde serializer
pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let ms = u64::try_from(value.as_millis()).map_err(serde::ser::Error::custom)?;
    serializer.serialize_u64(ms)
}

/// Deserialize Duration from number of milliseconds
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}
