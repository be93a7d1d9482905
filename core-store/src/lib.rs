//! # Core Store
//!
//! SQLite persistence for the track identity store, the playlist store,
//! and per-source sync state.

pub mod db;
pub mod error;
pub mod models;
pub mod repositories;

pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use error::{Result, StoreError};
pub use models::{
    now_ts, Confidence, Fingerprint, LocationRecord, Playlist, PlaylistItem, SourceKind,
    SyncState, SyncStatus, TrackIdentity,
};
pub use repositories::{
    IdentityStore, PlaylistStore, SqliteIdentityStore, SqlitePlaylistStore,
    SqliteSyncStateRepository, SyncStateRepository,
};
