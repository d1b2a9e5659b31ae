use thiserror::Error;

/// Errors reported by the message counter state machines.
///
/// Both are expected outcomes on a live network. A replayed or forged message
/// ends up as [CounterError::InvalidArgument] and must simply be dropped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    /// Operation is not allowed in the current synchronization status
    #[error("incorrect state")]
    IncorrectState,
    /// Challenge mismatch, counter too old or counter already seen
    #[error("invalid argument")]
    InvalidArgument,
}
