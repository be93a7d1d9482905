//! Domain models for track identities, playlists, and sync state.

use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current Unix timestamp in seconds
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Closed enums
// =============================================================================

/// Confidence assigned to the most recent resolution of an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Exact content hash match
    Exact,
    /// Fingerprint match above the high similarity threshold
    High,
    /// Fingerprint match above the lower similarity threshold
    Medium,
    /// Path-only match against the last known location
    Low,
    /// Freshly created identity, nothing matched
    New,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Exact => "exact",
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
            Confidence::New => "new",
        }
    }
}

impl FromStr for Confidence {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(Confidence::Exact),
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            "new" => Ok(Confidence::New),
            _ => Err(StoreError::InvalidInput {
                field: "confidence".to_string(),
                message: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Originating source of a playlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Media-server library (Plex-style)
    MediaServer,
    /// DJ application's file-based catalog (Rekordbox-style)
    DjCatalog,
    /// Created locally, belongs to no external source
    Native,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::MediaServer => "media_server",
            SourceKind::DjCatalog => "dj_catalog",
            SourceKind::Native => "native",
        }
    }
}

impl FromStr for SourceKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "media_server" => Ok(SourceKind::MediaServer),
            "dj_catalog" => Ok(SourceKind::DjCatalog),
            "native" => Ok(SourceKind::Native),
            _ => Err(StoreError::InvalidInput {
                field: "source".to_string(),
                message: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Synchronization status of a playlist against one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Never synced, or changes are waiting to be pushed
    Pending,
    /// Store and source agreed at the last pass
    Synced,
    /// Both sides advanced independently; export is suspended
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            _ => Err(StoreError::InvalidInput {
                field: "sync_status".to_string(),
                message: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Fingerprints
// =============================================================================

/// Acoustic fingerprint: a vector of integer chroma frames
///
/// The extraction itself is external; this type only carries the vector and
/// knows how to compare two of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub frames: Vec<i32>,
}

impl Fingerprint {
    pub fn new(frames: Vec<i32>) -> Self {
        Self { frames }
    }

    /// Similarity between two fingerprints in `[0.0, 1.0]`
    ///
    /// One minus the normalized elementwise Hamming distance; the shorter
    /// vector is zero-padded to the longer one's length.
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        let max_len = self.frames.len().max(other.frames.len());
        if max_len == 0 {
            return 0.0;
        }

        let differences = (0..max_len)
            .filter(|&i| {
                self.frames.get(i).copied().unwrap_or(0) != other.frames.get(i).copied().unwrap_or(0)
            })
            .count();

        1.0 - (differences as f64 / max_len as f64)
    }

    /// Serialize to the JSON form stored in the `fingerprints.vector` column
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.frames).unwrap_or_else(|_| "[]".to_string())
    }

    /// Parse from the stored JSON column value
    pub fn from_json(s: &str) -> Result<Self> {
        let frames = serde_json::from_str(s).map_err(|e| StoreError::InvalidInput {
            field: "fingerprint".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { frames })
    }
}

// =============================================================================
// Identity models
// =============================================================================

/// Stable logical identifier for one piece of recorded audio
///
/// Identities are never deleted. When two identities are proven to be the
/// same recording the loser is superseded and keeps a forwarding reference
/// to the winner in `superseded_by`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackIdentity {
    pub id: String,
    pub superseded_by: Option<String>,
    pub confidence: Confidence,
    pub created_at: i64,
    pub last_seen: i64,
}

impl TrackIdentity {
    pub fn new() -> Self {
        let now = now_ts();
        Self {
            id: Uuid::new_v4().to_string(),
            superseded_by: None,
            confidence: Confidence::New,
            created_at: now,
            last_seen: now,
        }
    }

    /// Whether this identity forwards to another one
    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }
}

impl Default for TrackIdentity {
    fn default() -> Self {
        Self::new()
    }
}

/// One observation of an identity at a file path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub id: i64,
    pub identity_id: String,
    pub file_path: String,
    pub observed_at: i64,
    pub active: bool,
}

// =============================================================================
// Playlist models
// =============================================================================

/// A playlist, versioned for optimistic concurrency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub source: SourceKind,
    pub external_id: Option<String>,
    pub version: i64,
    pub modified_at: i64,
    pub is_active: bool,
}

impl Playlist {
    pub fn new(name: impl Into<String>, source: SourceKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            source,
            external_id: None,
            version: 1,
            modified_at: now_ts(),
            is_active: true,
        }
    }

    /// Validate playlist data before persistence
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Playlist name cannot be empty".to_string());
        }
        if self.version < 1 {
            return Err("Playlist version must be at least 1".to_string());
        }
        Ok(())
    }
}

/// One ordered entry in a playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub playlist_id: String,
    pub identity_id: String,
    pub position: i64,
    pub external_id: Option<String>,
    pub added_at: i64,
}

impl PlaylistItem {
    pub fn new(playlist_id: impl Into<String>, identity_id: impl Into<String>, position: i64) -> Self {
        Self {
            playlist_id: playlist_id.into(),
            identity_id: identity_id.into(),
            position,
            external_id: None,
            added_at: now_ts(),
        }
    }
}

// =============================================================================
// Sync state
// =============================================================================

/// Per (playlist, source) synchronization bookkeeping
///
/// Records both the source version and the store version observed at the
/// last successful sync, which is what makes the three-way comparison in
/// the orchestrator possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub playlist_id: String,
    pub source: SourceKind,
    pub last_source_version: i64,
    pub last_store_version: i64,
    pub last_synced_at: Option<i64>,
    pub status: SyncStatus,
}

impl SyncState {
    pub fn new(playlist_id: impl Into<String>, source: SourceKind) -> Self {
        Self {
            playlist_id: playlist_id.into(),
            source,
            last_source_version: 0,
            last_store_version: 0,
            last_synced_at: None,
            status: SyncStatus::Pending,
        }
    }
}
