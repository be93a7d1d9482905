use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Content hash {hash} already claimed by identity {identity_id}")]
    DuplicateIdentity { hash: String, identity_id: String },

    #[error("Identity {id} is already superseded")]
    AlreadySuperseded { id: String },

    #[error("Version conflict on playlist {playlist_id}: expected {expected}, stored {actual}")]
    VersionConflict {
        playlist_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Forwarding chain for identity {id} exceeds depth limit")]
    ForwardingDepthExceeded { id: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
