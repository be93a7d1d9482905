//! Identity store: persistent record of track identities and their
//! historical file locations.
//!
//! Content hashes, fingerprints, and locations each map to at most one
//! identity. Identities are never deleted; `merge` supersedes the loser and
//! leaves a forwarding reference behind.

use crate::error::{Result, StoreError};
use crate::models::{now_ts, Confidence, Fingerprint, LocationRecord, TrackIdentity};
use async_trait::async_trait;
use sqlx::{query, query_as, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// Forwarding chains longer than this indicate corrupt data.
const MAX_FORWARDING_DEPTH: usize = 16;

/// Identity store interface for data access operations
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up an identity by its id
    async fn get(&self, id: &str) -> Result<Option<TrackIdentity>>;

    /// Exact lookup by content hash
    ///
    /// Returns the live identity the hash maps to, following forwarding
    /// references if the original owner has been merged away.
    async fn find_by_hash(&self, hash: &str) -> Result<Option<TrackIdentity>>;

    /// Nearest-neighbor lookup among known fingerprints
    ///
    /// Returns the best match and its similarity score if the score is at
    /// least `threshold`, else `None`.
    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        threshold: f64,
    ) -> Result<Option<(TrackIdentity, f64)>>;

    /// Look up an identity whose most recent active location is `path`
    async fn find_by_last_known_path(&self, path: &str) -> Result<Option<TrackIdentity>>;

    /// Look up an identity by a synthetic `<source>:<externalId>` key
    async fn find_by_external_key(&self, key: &str) -> Result<Option<TrackIdentity>>;

    /// Allocate a new identity
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateIdentity` if `hash` is already claimed.
    async fn create(
        &self,
        hash: Option<&str>,
        fingerprint: Option<&Fingerprint>,
        path: Option<&str>,
    ) -> Result<TrackIdentity>;

    /// Append a location record for an identity
    ///
    /// Idempotent if `path` matches the current active location. Otherwise
    /// the previous active record is deactivated and a new one appended.
    async fn record_location(&self, identity_id: &str, path: &str) -> Result<()>;

    /// Mark the identity's current location as no longer valid (file gone)
    async fn invalidate_location(&self, identity_id: &str) -> Result<()>;

    /// Associate a synthetic external key with an identity
    async fn record_external_key(&self, identity_id: &str, key: &str) -> Result<()>;

    /// Merge `secondary` into `primary`
    ///
    /// Re-points the secondary's hashes, fingerprints, external keys, and
    /// location records to the primary, then marks the secondary superseded
    /// with a forwarding reference.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadySuperseded` if either side already forwards.
    async fn merge(&self, primary_id: &str, secondary_id: &str) -> Result<TrackIdentity>;

    /// Follow forwarding references to the live identity
    async fn resolve_forwarding(&self, id: &str) -> Result<TrackIdentity>;

    /// The current active location of an identity, if any
    async fn current_location(&self, identity_id: &str) -> Result<Option<LocationRecord>>;

    /// Full ordered location history of an identity, oldest first
    async fn location_history(&self, identity_id: &str) -> Result<Vec<LocationRecord>>;

    /// Update the identity's stored confidence and `last_seen` timestamp
    async fn touch(&self, identity_id: &str, confidence: Confidence) -> Result<()>;
}

/// SQLite implementation of IdentityStore
pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_identity(
        row: (String, Option<String>, String, i64, i64),
    ) -> Result<TrackIdentity> {
        Ok(TrackIdentity {
            id: row.0,
            superseded_by: row.1,
            confidence: Confidence::from_str(&row.2)?,
            created_at: row.3,
            last_seen: row.4,
        })
    }

    async fn fetch_identity(&self, id: &str) -> Result<Option<TrackIdentity>> {
        let row = query_as::<_, (String, Option<String>, String, i64, i64)>(
            "SELECT id, superseded_by, confidence, created_at, last_seen \
             FROM track_identities WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_identity).transpose()
    }

    async fn follow_forwarding(&self, identity: TrackIdentity) -> Result<TrackIdentity> {
        let mut current = identity;
        let mut depth = 0;

        while let Some(next_id) = current.superseded_by.clone() {
            depth += 1;
            if depth > MAX_FORWARDING_DEPTH {
                return Err(StoreError::ForwardingDepthExceeded { id: current.id });
            }
            current = self
                .fetch_identity(&next_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity_type: "TrackIdentity".to_string(),
                    id: next_id,
                })?;
        }

        Ok(current)
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn get(&self, id: &str) -> Result<Option<TrackIdentity>> {
        self.fetch_identity(id).await
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<TrackIdentity>> {
        let identity_id = query_as::<_, (String,)>(
            "SELECT identity_id FROM content_hashes WHERE hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        match identity_id {
            Some((id,)) => {
                let identity =
                    self.fetch_identity(&id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound {
                            entity_type: "TrackIdentity".to_string(),
                            id,
                        })?;
                Ok(Some(self.follow_forwarding(identity).await?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        threshold: f64,
    ) -> Result<Option<(TrackIdentity, f64)>> {
        // Linear scan over stored vectors; the collection is personal-sized.
        let rows = query_as::<_, (String, String)>(
            "SELECT identity_id, vector FROM fingerprints",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut best: Option<(String, f64)> = None;
        for (identity_id, vector) in rows {
            let stored = Fingerprint::from_json(&vector)?;
            let score = fingerprint.similarity(&stored);
            if score >= threshold && best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((identity_id, score));
            }
        }

        match best {
            Some((id, score)) => {
                let identity =
                    self.fetch_identity(&id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound {
                            entity_type: "TrackIdentity".to_string(),
                            id,
                        })?;
                let identity = self.follow_forwarding(identity).await?;
                Ok(Some((identity, score)))
            }
            None => Ok(None),
        }
    }

    async fn find_by_last_known_path(&self, path: &str) -> Result<Option<TrackIdentity>> {
        let identity_id = query_as::<_, (String,)>(
            "SELECT identity_id FROM location_records \
             WHERE file_path = ? AND active = 1 \
             ORDER BY observed_at DESC, id DESC LIMIT 1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        match identity_id {
            Some((id,)) => {
                let identity =
                    self.fetch_identity(&id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound {
                            entity_type: "TrackIdentity".to_string(),
                            id,
                        })?;
                Ok(Some(self.follow_forwarding(identity).await?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_external_key(&self, key: &str) -> Result<Option<TrackIdentity>> {
        let identity_id =
            query_as::<_, (String,)>("SELECT identity_id FROM external_keys WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match identity_id {
            Some((id,)) => {
                let identity =
                    self.fetch_identity(&id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound {
                            entity_type: "TrackIdentity".to_string(),
                            id,
                        })?;
                Ok(Some(self.follow_forwarding(identity).await?))
            }
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        hash: Option<&str>,
        fingerprint: Option<&Fingerprint>,
        path: Option<&str>,
    ) -> Result<TrackIdentity> {
        let mut tx = self.pool.begin().await?;

        if let Some(hash) = hash {
            let claimed = query_as::<_, (String,)>(
                "SELECT identity_id FROM content_hashes WHERE hash = ?",
            )
            .bind(hash)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((identity_id,)) = claimed {
                return Err(StoreError::DuplicateIdentity {
                    hash: hash.to_string(),
                    identity_id,
                });
            }
        }

        let identity = TrackIdentity::new();

        query(
            "INSERT INTO track_identities (id, superseded_by, confidence, created_at, last_seen) \
             VALUES (?, NULL, ?, ?, ?)",
        )
        .bind(&identity.id)
        .bind(identity.confidence.as_str())
        .bind(identity.created_at)
        .bind(identity.last_seen)
        .execute(&mut *tx)
        .await?;

        if let Some(hash) = hash {
            query("INSERT INTO content_hashes (hash, identity_id) VALUES (?, ?)")
                .bind(hash)
                .bind(&identity.id)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(fingerprint) = fingerprint {
            query("INSERT INTO fingerprints (identity_id, vector) VALUES (?, ?)")
                .bind(&identity.id)
                .bind(fingerprint.to_json())
                .execute(&mut *tx)
                .await?;
        }

        if let Some(path) = path {
            query(
                "INSERT INTO location_records (identity_id, file_path, observed_at, active) \
                 VALUES (?, ?, ?, 1)",
            )
            .bind(&identity.id)
            .bind(path)
            .bind(identity.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(identity_id = %identity.id, "Created track identity");
        Ok(identity)
    }

    async fn record_location(&self, identity_id: &str, path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current = query_as::<_, (String,)>(
            "SELECT file_path FROM location_records \
             WHERE identity_id = ? AND active = 1 \
             ORDER BY observed_at DESC, id DESC LIMIT 1",
        )
        .bind(identity_id)
        .fetch_optional(&mut *tx)
        .await?;

        if current.as_ref().map(|(p,)| p.as_str()) == Some(path) {
            // Path unchanged since last observation.
            return Ok(());
        }

        query("UPDATE location_records SET active = 0 WHERE identity_id = ? AND active = 1")
            .bind(identity_id)
            .execute(&mut *tx)
            .await?;

        query(
            "INSERT INTO location_records (identity_id, file_path, observed_at, active) \
             VALUES (?, ?, ?, 1)",
        )
        .bind(identity_id)
        .bind(path)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(identity_id, path, "Recorded new location");
        Ok(())
    }

    async fn invalidate_location(&self, identity_id: &str) -> Result<()> {
        query("UPDATE location_records SET active = 0 WHERE identity_id = ? AND active = 1")
            .bind(identity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_external_key(&self, identity_id: &str, key: &str) -> Result<()> {
        query("INSERT OR IGNORE INTO external_keys (key, identity_id) VALUES (?, ?)")
            .bind(key)
            .bind(identity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge(&self, primary_id: &str, secondary_id: &str) -> Result<TrackIdentity> {
        if primary_id == secondary_id {
            return Err(StoreError::InvalidInput {
                field: "merge".to_string(),
                message: "cannot merge an identity into itself".to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        let primary = query_as::<_, (String, Option<String>, String, i64, i64)>(
            "SELECT id, superseded_by, confidence, created_at, last_seen \
             FROM track_identities WHERE id = ?",
        )
        .bind(primary_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity_type: "TrackIdentity".to_string(),
            id: primary_id.to_string(),
        })?;

        let secondary = query_as::<_, (String, Option<String>, String, i64, i64)>(
            "SELECT id, superseded_by, confidence, created_at, last_seen \
             FROM track_identities WHERE id = ?",
        )
        .bind(secondary_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity_type: "TrackIdentity".to_string(),
            id: secondary_id.to_string(),
        })?;

        if primary.1.is_some() {
            return Err(StoreError::AlreadySuperseded {
                id: primary_id.to_string(),
            });
        }
        if secondary.1.is_some() {
            return Err(StoreError::AlreadySuperseded {
                id: secondary_id.to_string(),
            });
        }

        // The secondary's active location becomes history of the primary.
        query("UPDATE location_records SET active = 0 WHERE identity_id = ? AND active = 1")
            .bind(secondary_id)
            .execute(&mut *tx)
            .await?;

        for table in ["content_hashes", "fingerprints", "external_keys", "location_records"] {
            query(&format!(
                "UPDATE {} SET identity_id = ? WHERE identity_id = ?",
                table
            ))
            .bind(primary_id)
            .bind(secondary_id)
            .execute(&mut *tx)
            .await?;
        }

        let now = now_ts();
        query("UPDATE track_identities SET superseded_by = ?, last_seen = ? WHERE id = ?")
            .bind(primary_id)
            .bind(now)
            .bind(secondary_id)
            .execute(&mut *tx)
            .await?;

        query("UPDATE track_identities SET last_seen = ? WHERE id = ?")
            .bind(now)
            .bind(primary_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(primary_id, secondary_id, "Merged track identities");

        let mut merged = Self::row_to_identity(primary)?;
        merged.last_seen = now;
        Ok(merged)
    }

    async fn resolve_forwarding(&self, id: &str) -> Result<TrackIdentity> {
        let identity = self
            .fetch_identity(id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity_type: "TrackIdentity".to_string(),
                id: id.to_string(),
            })?;
        self.follow_forwarding(identity).await
    }

    async fn current_location(&self, identity_id: &str) -> Result<Option<LocationRecord>> {
        let row = query_as::<_, (i64, String, String, i64, i64)>(
            "SELECT id, identity_id, file_path, observed_at, active \
             FROM location_records \
             WHERE identity_id = ? AND active = 1 \
             ORDER BY observed_at DESC, id DESC LIMIT 1",
        )
        .bind(identity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, identity_id, file_path, observed_at, active)| LocationRecord {
            id,
            identity_id,
            file_path,
            observed_at,
            active: active != 0,
        }))
    }

    async fn location_history(&self, identity_id: &str) -> Result<Vec<LocationRecord>> {
        let rows = query_as::<_, (i64, String, String, i64, i64)>(
            "SELECT id, identity_id, file_path, observed_at, active \
             FROM location_records WHERE identity_id = ? \
             ORDER BY observed_at ASC, id ASC",
        )
        .bind(identity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, identity_id, file_path, observed_at, active)| LocationRecord {
                id,
                identity_id,
                file_path,
                observed_at,
                active: active != 0,
            })
            .collect())
    }

    async fn touch(&self, identity_id: &str, confidence: Confidence) -> Result<()> {
        let result = query("UPDATE track_identities SET confidence = ?, last_seen = ? WHERE id = ?")
            .bind(confidence.as_str())
            .bind(now_ts())
            .bind(identity_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity_type: "TrackIdentity".to_string(),
                id: identity_id.to_string(),
            });
        }

        Ok(())
    }
}
