//! Source adapter interface.
//!
//! An adapter wraps one external playlist source (the media server's
//! library, the DJ application's catalog) behind a uniform async surface.
//! The orchestrator never talks to a source directly; everything flows
//! through this trait, which is what lets a single unreachable source be
//! skipped without disturbing the others.

use crate::Result;
use async_trait::async_trait;
use core_store::{Fingerprint, SourceKind};

/// One ordered entry of a playlist as reported by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    /// The source's own identifier for the track (rating key, database id,
    /// or a file path for path-keyed formats)
    pub external_track_ref: String,

    /// Position within the playlist as the source orders it
    pub position: i64,
}

/// A playlist snapshot as reported by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePlaylist {
    /// The source's stable identifier for this playlist
    pub external_id: String,

    pub name: String,

    /// The source's version counter for this playlist
    pub version: i64,

    /// Last modification time at the source, when the source exposes one
    pub modified_at: Option<i64>,

    pub items: Vec<SourceItem>,
}

/// Everything a source can tell us about one of its track references
///
/// All fields are optional; a reference with none of them set is treated
/// as corrupt by the resolver.
#[derive(Debug, Clone, Default)]
pub struct TrackHints {
    pub path: Option<String>,
    pub hash: Option<String>,
    pub fingerprint: Option<Fingerprint>,
}

/// What the source reports back after accepting a playlist write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// The source's identifier for the playlist, assigned on first write
    pub external_id: String,

    /// The source's version counter after the write
    pub version: i64,
}

/// Uniform interface to an external playlist source
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Which source this adapter fronts
    fn source_kind(&self) -> SourceKind;

    /// Whether the source accepts playlist writes
    ///
    /// Import-only sources still participate in import and reconciliation;
    /// their playlists are simply reported as unsynced after export.
    fn supports_write(&self) -> bool;

    /// List playlists, paginated
    ///
    /// Returns a page of playlists plus an opaque continuation cursor;
    /// `None` means the listing is complete.
    async fn list_playlists(
        &self,
        cursor: Option<String>,
    ) -> Result<(Vec<SourcePlaylist>, Option<String>)>;

    /// Resolve a source track reference to identification hints
    async fn resolve_track_ref(&self, external_track_ref: &str) -> Result<TrackHints>;

    /// Write a playlist back to the source
    ///
    /// The receipt carries the source's id and version counter after the
    /// write, so the next pass neither duplicates the playlist nor
    /// mistakes our own write for an upstream change.
    ///
    /// # Errors
    ///
    /// Returns `WriteUnsupported` when `supports_write` is false.
    async fn write_playlist(&self, playlist: &SourcePlaylist) -> Result<WriteReceipt>;
}
