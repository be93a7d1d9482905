//! Playlist store: versioned persistent storage of playlists and their
//! ordered items.
//!
//! Every mutating call takes `expected_version` and fails with
//! `VersionConflict` when the stored version has moved on. This version
//! check, not a lock, is what makes concurrent sync passes safe: both
//! writers read, one write wins, the loser re-reads and retries.

use crate::error::{Result, StoreError};
use crate::models::{now_ts, Playlist, PlaylistItem, SourceKind};
use async_trait::async_trait;
use sqlx::{query, query_as, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::debug;

/// Playlist store interface for data access operations
#[async_trait]
pub trait PlaylistStore: Send + Sync {
    /// Insert a new playlist (items start empty)
    async fn create(&self, playlist: &Playlist) -> Result<()>;

    /// Find a playlist by its id
    async fn get(&self, id: &str) -> Result<Option<Playlist>>;

    /// All playlists originating from `source`
    async fn list_by_source(&self, source: SourceKind) -> Result<Vec<Playlist>>;

    /// All active playlists, regardless of source
    async fn list_active(&self) -> Result<Vec<Playlist>>;

    /// Find a source playlist by its external identifier
    async fn find_by_external_id(
        &self,
        source: SourceKind,
        external_id: &str,
    ) -> Result<Option<Playlist>>;

    /// Find a source playlist by case-insensitive name
    ///
    /// Fallback for adapters whose native format carries no stable ids.
    async fn find_by_name(&self, source: SourceKind, name: &str) -> Result<Option<Playlist>>;

    /// Update playlist metadata, bumping the version
    ///
    /// # Errors
    ///
    /// Fails with `VersionConflict` if the stored version differs from
    /// `expected_version`. Returns the playlist as stored after the update.
    async fn update(&self, playlist: &Playlist, expected_version: i64) -> Result<Playlist>;

    /// Atomically replace the full ordered item list, bumping the version
    ///
    /// Item positions must be strictly increasing. Superseded track
    /// identities are re-pointed to their forwarding target before the
    /// items are written. Returns the new version.
    ///
    /// # Errors
    ///
    /// Fails with `VersionConflict` on a stale `expected_version`.
    async fn set_items(
        &self,
        playlist_id: &str,
        items: &[PlaylistItem],
        expected_version: i64,
    ) -> Result<i64>;

    /// Items of a playlist in stored order
    async fn items(&self, playlist_id: &str) -> Result<Vec<PlaylistItem>>;
}

/// SQLite implementation of PlaylistStore
pub struct SqlitePlaylistStore {
    pool: SqlitePool,
}

type PlaylistRow = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    i64,
    i64,
    i64,
);

const SELECT_PLAYLIST: &str = "SELECT id, name, description, source, external_id, version, \
     modified_at, is_active FROM playlists";

impl SqlitePlaylistStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_playlist(row: PlaylistRow) -> Result<Playlist> {
        Ok(Playlist {
            id: row.0,
            name: row.1,
            description: row.2,
            source: SourceKind::from_str(&row.3)?,
            external_id: row.4,
            version: row.5,
            modified_at: row.6,
            is_active: row.7 != 0,
        })
    }

    /// Read the stored version inside a transaction and check it against
    /// the caller's expectation.
    async fn check_version(
        tx: &mut Transaction<'_, Sqlite>,
        playlist_id: &str,
        expected_version: i64,
    ) -> Result<()> {
        let stored = query_as::<_, (i64,)>("SELECT version FROM playlists WHERE id = ?")
            .bind(playlist_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity_type: "Playlist".to_string(),
                id: playlist_id.to_string(),
            })?;

        if stored.0 != expected_version {
            return Err(StoreError::VersionConflict {
                playlist_id: playlist_id.to_string(),
                expected: expected_version,
                actual: stored.0,
            });
        }

        Ok(())
    }

    /// Follow forwarding references for an item's identity inside a
    /// transaction so superseded identities are never written into items.
    async fn live_identity_id(
        tx: &mut Transaction<'_, Sqlite>,
        identity_id: &str,
    ) -> Result<String> {
        let mut current = identity_id.to_string();
        for _ in 0..16 {
            let row = query_as::<_, (Option<String>,)>(
                "SELECT superseded_by FROM track_identities WHERE id = ?",
            )
            .bind(&current)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity_type: "TrackIdentity".to_string(),
                id: current.clone(),
            })?;

            match row.0 {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }

        Err(StoreError::ForwardingDepthExceeded {
            id: identity_id.to_string(),
        })
    }
}

#[async_trait]
impl PlaylistStore for SqlitePlaylistStore {
    async fn create(&self, playlist: &Playlist) -> Result<()> {
        playlist.validate().map_err(|e| StoreError::InvalidInput {
            field: "Playlist".to_string(),
            message: e,
        })?;

        query(
            "INSERT INTO playlists (id, name, description, source, external_id, version, \
             modified_at, is_active) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&playlist.id)
        .bind(&playlist.name)
        .bind(&playlist.description)
        .bind(playlist.source.as_str())
        .bind(&playlist.external_id)
        .bind(playlist.version)
        .bind(playlist.modified_at)
        .bind(playlist.is_active as i64)
        .execute(&self.pool)
        .await?;

        debug!(playlist_id = %playlist.id, name = %playlist.name, "Created playlist");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Playlist>> {
        let row = query_as::<_, PlaylistRow>(&format!("{} WHERE id = ?", SELECT_PLAYLIST))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_playlist).transpose()
    }

    async fn list_by_source(&self, source: SourceKind) -> Result<Vec<Playlist>> {
        let rows = query_as::<_, PlaylistRow>(&format!(
            "{} WHERE source = ? ORDER BY name ASC",
            SELECT_PLAYLIST
        ))
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_playlist).collect()
    }

    async fn list_active(&self) -> Result<Vec<Playlist>> {
        let rows = query_as::<_, PlaylistRow>(&format!(
            "{} WHERE is_active = 1 ORDER BY name ASC",
            SELECT_PLAYLIST
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_playlist).collect()
    }

    async fn find_by_external_id(
        &self,
        source: SourceKind,
        external_id: &str,
    ) -> Result<Option<Playlist>> {
        let row = query_as::<_, PlaylistRow>(&format!(
            "{} WHERE source = ? AND external_id = ?",
            SELECT_PLAYLIST
        ))
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_playlist).transpose()
    }

    async fn find_by_name(&self, source: SourceKind, name: &str) -> Result<Option<Playlist>> {
        let row = query_as::<_, PlaylistRow>(&format!(
            "{} WHERE source = ? AND name = ? COLLATE NOCASE",
            SELECT_PLAYLIST
        ))
        .bind(source.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_playlist).transpose()
    }

    async fn update(&self, playlist: &Playlist, expected_version: i64) -> Result<Playlist> {
        playlist.validate().map_err(|e| StoreError::InvalidInput {
            field: "Playlist".to_string(),
            message: e,
        })?;

        let mut tx = self.pool.begin().await?;
        Self::check_version(&mut tx, &playlist.id, expected_version).await?;

        let new_version = expected_version + 1;
        let modified_at = now_ts();

        query(
            "UPDATE playlists SET name = ?, description = ?, external_id = ?, version = ?, \
             modified_at = ?, is_active = ? WHERE id = ?",
        )
        .bind(&playlist.name)
        .bind(&playlist.description)
        .bind(&playlist.external_id)
        .bind(new_version)
        .bind(modified_at)
        .bind(playlist.is_active as i64)
        .bind(&playlist.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut updated = playlist.clone();
        updated.version = new_version;
        updated.modified_at = modified_at;
        Ok(updated)
    }

    async fn set_items(
        &self,
        playlist_id: &str,
        items: &[PlaylistItem],
        expected_version: i64,
    ) -> Result<i64> {
        for pair in items.windows(2) {
            if pair[1].position <= pair[0].position {
                return Err(StoreError::InvalidInput {
                    field: "items".to_string(),
                    message: format!(
                        "positions must be strictly increasing ({} then {})",
                        pair[0].position, pair[1].position
                    ),
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        Self::check_version(&mut tx, playlist_id, expected_version).await?;

        query("DELETE FROM playlist_items WHERE playlist_id = ?")
            .bind(playlist_id)
            .execute(&mut *tx)
            .await?;

        for item in items {
            let identity_id = Self::live_identity_id(&mut tx, &item.identity_id).await?;

            query(
                "INSERT INTO playlist_items (playlist_id, identity_id, position, external_id, \
                 added_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(playlist_id)
            .bind(&identity_id)
            .bind(item.position)
            .bind(&item.external_id)
            .bind(item.added_at)
            .execute(&mut *tx)
            .await?;
        }

        let new_version = expected_version + 1;
        query("UPDATE playlists SET version = ?, modified_at = ? WHERE id = ?")
            .bind(new_version)
            .bind(now_ts())
            .bind(playlist_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(playlist_id, items = items.len(), new_version, "Replaced playlist items");
        Ok(new_version)
    }

    async fn items(&self, playlist_id: &str) -> Result<Vec<PlaylistItem>> {
        let rows = query_as::<_, (String, String, i64, Option<String>, i64)>(
            "SELECT playlist_id, identity_id, position, external_id, added_at \
             FROM playlist_items WHERE playlist_id = ? ORDER BY position ASC",
        )
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(playlist_id, identity_id, position, external_id, added_at)| PlaylistItem {
                    playlist_id,
                    identity_id,
                    position,
                    external_id,
                    added_at,
                },
            )
            .collect())
    }
}
