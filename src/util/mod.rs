pub mod cryptoutil;
pub mod serde_ms;
