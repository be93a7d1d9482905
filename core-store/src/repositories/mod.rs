//! Repository traits and SQLite implementations.

pub mod identity;
pub mod playlist;
pub mod sync_state;

pub use identity::{IdentityStore, SqliteIdentityStore};
pub use playlist::{PlaylistStore, SqlitePlaylistStore};
pub use sync_state::{SqliteSyncStateRepository, SyncStateRepository};
