use core_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error("Candidate carries no hash, fingerprint, or path")]
    CorruptCandidate,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, IdentifyError>;
