use core_identity::IdentifyError;
use core_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Source {source_kind} unavailable: {reason}")]
    AdapterUnavailable {
        source_kind: String,
        reason: String,
    },

    #[error("Source {source_kind} does not accept playlist writes")]
    WriteUnsupported { source_kind: String },

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("{scope} timed out after {secs} seconds")]
    Timeout { scope: String, secs: u64 },

    #[error("Gave up on playlist {playlist_id} after {attempts} version conflicts")]
    RetriesExhausted { playlist_id: String, attempts: u32 },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Sync pass cancelled")]
    Cancelled,

    #[error("Identification error: {0}")]
    Identify(#[from] IdentifyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether this error is confined to one source and should skip that
    /// source rather than fail the whole pass.
    pub fn is_source_failure(&self) -> bool {
        matches!(
            self,
            SyncError::AdapterUnavailable { .. }
                | SyncError::Adapter(_)
                | SyncError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
