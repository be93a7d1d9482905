//! Per (playlist, source) sync state persistence.

use crate::error::Result;
use crate::models::{SourceKind, SyncState, SyncStatus};
use async_trait::async_trait;
use sqlx::{query, query_as, SqlitePool};
use std::str::FromStr;

/// Repository trait for sync state persistence
#[async_trait]
pub trait SyncStateRepository: Send + Sync {
    /// Get the sync state for a playlist against one source, if recorded
    async fn get(&self, playlist_id: &str, source: SourceKind) -> Result<Option<SyncState>>;

    /// All recorded sync states for a playlist
    async fn for_playlist(&self, playlist_id: &str) -> Result<Vec<SyncState>>;

    /// Insert or replace a sync state row
    async fn upsert(&self, state: &SyncState) -> Result<()>;

    /// Update only the status of an existing (or new) row
    async fn set_status(
        &self,
        playlist_id: &str,
        source: SourceKind,
        status: SyncStatus,
    ) -> Result<()>;

    /// Playlists currently marked as conflicted for any source
    async fn conflicted_playlists(&self) -> Result<Vec<String>>;
}

/// SQLite implementation of SyncStateRepository
pub struct SqliteSyncStateRepository {
    pool: SqlitePool,
}

type SyncStateRow = (String, String, i64, i64, Option<i64>, String);

impl SqliteSyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_state(row: SyncStateRow) -> Result<SyncState> {
        Ok(SyncState {
            playlist_id: row.0,
            source: SourceKind::from_str(&row.1)?,
            last_source_version: row.2,
            last_store_version: row.3,
            last_synced_at: row.4,
            status: SyncStatus::from_str(&row.5)?,
        })
    }
}

#[async_trait]
impl SyncStateRepository for SqliteSyncStateRepository {
    async fn get(&self, playlist_id: &str, source: SourceKind) -> Result<Option<SyncState>> {
        let row = query_as::<_, SyncStateRow>(
            "SELECT playlist_id, source, last_source_version, last_store_version, \
             last_synced_at, status FROM sync_state WHERE playlist_id = ? AND source = ?",
        )
        .bind(playlist_id)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_state).transpose()
    }

    async fn for_playlist(&self, playlist_id: &str) -> Result<Vec<SyncState>> {
        let rows = query_as::<_, SyncStateRow>(
            "SELECT playlist_id, source, last_source_version, last_store_version, \
             last_synced_at, status FROM sync_state WHERE playlist_id = ?",
        )
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_state).collect()
    }

    async fn upsert(&self, state: &SyncState) -> Result<()> {
        query(
            "INSERT INTO sync_state (playlist_id, source, last_source_version, \
             last_store_version, last_synced_at, status) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(playlist_id, source) DO UPDATE SET \
             last_source_version = excluded.last_source_version, \
             last_store_version = excluded.last_store_version, \
             last_synced_at = excluded.last_synced_at, \
             status = excluded.status",
        )
        .bind(&state.playlist_id)
        .bind(state.source.as_str())
        .bind(state.last_source_version)
        .bind(state.last_store_version)
        .bind(state.last_synced_at)
        .bind(state.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_status(
        &self,
        playlist_id: &str,
        source: SourceKind,
        status: SyncStatus,
    ) -> Result<()> {
        query(
            "INSERT INTO sync_state (playlist_id, source, status) VALUES (?, ?, ?) \
             ON CONFLICT(playlist_id, source) DO UPDATE SET status = excluded.status",
        )
        .bind(playlist_id)
        .bind(source.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn conflicted_playlists(&self) -> Result<Vec<String>> {
        let rows = query_as::<_, (String,)>(
            "SELECT DISTINCT playlist_id FROM sync_state WHERE status = 'conflict'",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
