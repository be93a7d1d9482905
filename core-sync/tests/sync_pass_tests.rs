//! Integration tests for full synchronization passes
//!
//! These tests drive the orchestrator end to end against real SQLite
//! stores and stateful fake sources, covering:
//! - First import of a source's playlists, including identity resolution
//! - Idempotent re-runs when nothing changed
//! - Source-side reorders flowing into the store
//! - Store-side edits flowing back out to writable sources
//! - Conflict detection when both sides changed, last-writer-wins, and
//!   conflicts clearing after a source-side rollback
//! - Import-only sources staying unsynced
//! - One unreachable source not blocking the others

use async_trait::async_trait;
use core_identity::{ResolverConfig, TrackResolver};
use core_store::{
    create_test_pool, IdentityStore, Playlist, PlaylistItem, PlaylistStore, SourceKind,
    SqliteIdentityStore, SqlitePlaylistStore, SqliteSyncStateRepository, SyncStateRepository,
    SyncStatus,
};
use core_sync::{
    SourceAdapter, SourceItem, SourcePlaylist, SyncConfig, SyncError, SyncOrchestrator, SyncPass,
    TrackHints, WriteReceipt,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fake Source
// ============================================================================

/// Stateful fake source whose playlists and tracks tests mutate between
/// passes
struct FakeSource {
    kind: SourceKind,
    writable: bool,
    playlists: Arc<AsyncMutex<Vec<SourcePlaylist>>>,
    tracks: Arc<AsyncMutex<HashMap<String, TrackHints>>>,
    written: Arc<AsyncMutex<Vec<SourcePlaylist>>>,
    unreachable: Arc<AsyncMutex<bool>>,
    next_write_version: Arc<AsyncMutex<i64>>,
}

impl FakeSource {
    fn new(kind: SourceKind, writable: bool) -> Self {
        Self {
            kind,
            writable,
            playlists: Arc::new(AsyncMutex::new(Vec::new())),
            tracks: Arc::new(AsyncMutex::new(HashMap::new())),
            written: Arc::new(AsyncMutex::new(Vec::new())),
            unreachable: Arc::new(AsyncMutex::new(false)),
            next_write_version: Arc::new(AsyncMutex::new(100)),
        }
    }

    async fn set_playlists(&self, playlists: Vec<SourcePlaylist>) {
        *self.playlists.lock().await = playlists;
    }

    async fn add_track(&self, track_ref: &str, path: &str, hash: &str) {
        self.tracks.lock().await.insert(
            track_ref.to_string(),
            TrackHints {
                path: Some(path.to_string()),
                hash: Some(hash.to_string()),
                fingerprint: None,
            },
        );
    }

    async fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().await = unreachable;
    }

    async fn written(&self) -> Vec<SourcePlaylist> {
        self.written.lock().await.clone()
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    fn source_kind(&self) -> SourceKind {
        self.kind
    }

    fn supports_write(&self) -> bool {
        self.writable
    }

    async fn list_playlists(
        &self,
        _cursor: Option<String>,
    ) -> core_sync::Result<(Vec<SourcePlaylist>, Option<String>)> {
        if *self.unreachable.lock().await {
            return Err(SyncError::AdapterUnavailable {
                source_kind: self.kind.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok((self.playlists.lock().await.clone(), None))
    }

    async fn resolve_track_ref(&self, external_track_ref: &str) -> core_sync::Result<TrackHints> {
        Ok(self
            .tracks
            .lock()
            .await
            .get(external_track_ref)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_playlist(&self, playlist: &SourcePlaylist) -> core_sync::Result<WriteReceipt> {
        if !self.writable {
            return Err(SyncError::WriteUnsupported {
                source_kind: self.kind.to_string(),
            });
        }
        self.written.lock().await.push(playlist.clone());
        let mut version = self.next_write_version.lock().await;
        *version += 1;

        // Known playlists keep their id; unknown ones get a fresh one,
        // the way a real source assigns ids on first write.
        let known = self
            .playlists
            .lock()
            .await
            .iter()
            .any(|p| p.external_id == playlist.external_id);
        let external_id = if known {
            playlist.external_id.clone()
        } else {
            format!("fake-{}", *version)
        };
        Ok(WriteReceipt {
            external_id,
            version: *version,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    identities: Arc<SqliteIdentityStore>,
    playlists: Arc<SqlitePlaylistStore>,
    states: Arc<SqliteSyncStateRepository>,
    orchestrator: SyncOrchestrator,
}

impl Harness {
    async fn new(adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        let pool = create_test_pool().await.unwrap();
        let identities = Arc::new(SqliteIdentityStore::new(pool.clone()));
        let playlists = Arc::new(SqlitePlaylistStore::new(pool.clone()));
        let states = Arc::new(SqliteSyncStateRepository::new(pool));
        let resolver = Arc::new(TrackResolver::new(
            identities.clone(),
            ResolverConfig::default(),
        ));
        let orchestrator = SyncOrchestrator::new(
            SyncConfig::default(),
            identities.clone(),
            playlists.clone(),
            states.clone(),
            resolver,
            adapters,
        );
        Self {
            identities,
            playlists,
            states,
            orchestrator,
        }
    }

    async fn run(&self) -> SyncPass {
        self.orchestrator
            .run_pass(CancellationToken::new())
            .await
            .unwrap()
    }
}

fn playlist(external_id: &str, name: &str, version: i64, refs: &[&str]) -> SourcePlaylist {
    SourcePlaylist {
        external_id: external_id.to_string(),
        name: name.to_string(),
        version,
        modified_at: None,
        items: refs
            .iter()
            .enumerate()
            .map(|(i, track_ref)| SourceItem {
                external_track_ref: track_ref.to_string(),
                position: i as i64,
            })
            .collect(),
    }
}

async fn seeded_source(kind: SourceKind, writable: bool) -> Arc<FakeSource> {
    let source = Arc::new(FakeSource::new(kind, writable));
    source.add_track("t-1", "/music/one.mp3", "hash-1").await;
    source.add_track("t-2", "/music/two.mp3", "hash-2").await;
    source.add_track("t-3", "/music/three.mp3", "hash-3").await;
    source
        .set_playlists(vec![playlist("pl-1", "Warmup", 1, &["t-1", "t-2", "t-3"])])
        .await;
    source
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_first_pass_imports_source_playlists() {
    let source = seeded_source(SourceKind::DjCatalog, true).await;
    let harness = Harness::new(vec![source.clone()]).await;

    let pass = harness.run().await;
    assert_eq!(pass.report.playlists_created, 1);
    assert_eq!(pass.report.tracks_resolved, 3);
    assert_eq!(pass.report.identities_created, 3);
    assert_eq!(pass.report.conflicts_detected, 0);

    let stored = harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "pl-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.name, "Warmup");

    let items = harness.playlists.items(&stored.id).await.unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].external_id.as_deref(), Some("t-1"));
    assert_eq!(items[2].external_id.as_deref(), Some("t-3"));

    let state = harness
        .states
        .get(&stored.id, SourceKind::DjCatalog)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.last_source_version, 1);
    assert_eq!(state.last_store_version, stored.version);
    assert_eq!(state.status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_unchanged_source_is_a_no_op() {
    let source = seeded_source(SourceKind::DjCatalog, true).await;
    let harness = Harness::new(vec![source.clone()]).await;

    harness.run().await;
    let second = harness.run().await;

    assert_eq!(second.report.playlists_created, 0);
    assert_eq!(second.report.playlists_imported, 0);
    assert_eq!(second.report.playlists_exported, 0);
    assert!(source.written().await.is_empty());
}

#[tokio::test]
async fn test_source_reorder_flows_into_store() {
    let source = seeded_source(SourceKind::DjCatalog, true).await;
    let harness = Harness::new(vec![source.clone()]).await;
    harness.run().await;

    source
        .set_playlists(vec![playlist("pl-1", "Warmup", 2, &["t-3", "t-1", "t-2"])])
        .await;
    let pass = harness.run().await;
    assert_eq!(pass.report.playlists_imported, 1);
    // Every track was already known.
    assert_eq!(pass.report.identities_created, 0);

    let stored = harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "pl-1")
        .await
        .unwrap()
        .unwrap();
    let items = harness.playlists.items(&stored.id).await.unwrap();
    let refs: Vec<_> = items.iter().map(|i| i.external_id.as_deref()).collect();
    assert_eq!(refs, vec![Some("t-3"), Some("t-1"), Some("t-2")]);
}

#[tokio::test]
async fn test_store_edit_flows_back_to_writable_source() {
    let source = seeded_source(SourceKind::DjCatalog, true).await;
    let harness = Harness::new(vec![source.clone()]).await;
    harness.run().await;

    let stored = harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "pl-1")
        .await
        .unwrap()
        .unwrap();
    let mut items = harness.playlists.items(&stored.id).await.unwrap();
    items.truncate(2);
    for (i, item) in items.iter_mut().enumerate() {
        item.position = i as i64;
    }
    harness
        .playlists
        .set_items(&stored.id, &items, stored.version)
        .await
        .unwrap();

    let pass = harness.run().await;
    assert_eq!(pass.report.playlists_exported, 1);
    assert_eq!(pass.report.playlists_imported, 0);

    let written = source.written().await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].items.len(), 2);
    assert_eq!(written[0].items[0].external_track_ref, "t-1");

    let state = harness
        .states
        .get(&stored.id, SourceKind::DjCatalog)
        .await
        .unwrap()
        .unwrap();
    // The recorded source version is what the source reported after our
    // write, so the next pass does not mistake it for an upstream edit.
    assert_eq!(state.last_source_version, 101);
    assert_eq!(state.status, SyncStatus::Synced);

    let third = harness.run().await;
    assert_eq!(third.report.playlists_exported, 0);
    assert_eq!(source.written().await.len(), 1);
}

#[tokio::test]
async fn test_both_sides_changed_without_timestamps_is_a_conflict() {
    let source = seeded_source(SourceKind::DjCatalog, true).await;
    let harness = Harness::new(vec![source.clone()]).await;
    harness.run().await;

    // Store side: drop a track.
    let stored = harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "pl-1")
        .await
        .unwrap()
        .unwrap();
    let mut items = harness.playlists.items(&stored.id).await.unwrap();
    items.truncate(1);
    harness
        .playlists
        .set_items(&stored.id, &items, stored.version)
        .await
        .unwrap();

    // Source side: reorder, no modification times anywhere.
    source
        .set_playlists(vec![playlist("pl-1", "Warmup", 2, &["t-2", "t-1", "t-3"])])
        .await;

    let pass = harness.run().await;
    assert_eq!(pass.report.conflicts_detected, 1);
    assert_eq!(pass.report.playlists_imported, 0);
    assert_eq!(pass.report.playlists_exported, 0);

    // Neither side was touched.
    let items = harness.playlists.items(&stored.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert!(source.written().await.is_empty());

    let state = harness
        .states
        .get(&stored.id, SourceKind::DjCatalog)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, SyncStatus::Conflict);

    let conflicted = harness.states.conflicted_playlists().await.unwrap();
    assert_eq!(conflicted, vec![stored.id.clone()]);
}

#[tokio::test]
async fn test_conflict_clears_when_source_rolls_back() {
    let source = seeded_source(SourceKind::DjCatalog, true).await;
    let harness = Harness::new(vec![source.clone()]).await;
    harness.run().await;

    let stored = harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "pl-1")
        .await
        .unwrap()
        .unwrap();
    let mut items = harness.playlists.items(&stored.id).await.unwrap();
    items.truncate(1);
    harness
        .playlists
        .set_items(&stored.id, &items, stored.version)
        .await
        .unwrap();
    source
        .set_playlists(vec![playlist("pl-1", "Warmup", 2, &["t-2", "t-1", "t-3"])])
        .await;

    let second = harness.run().await;
    assert_eq!(second.report.conflicts_detected, 1);

    // The source edit is undone upstream: the listing is back at the
    // last-synced version. The store edit must no longer be stranded.
    source
        .set_playlists(vec![playlist("pl-1", "Warmup", 1, &["t-1", "t-2", "t-3"])])
        .await;

    let third = harness.run().await;
    assert_eq!(third.report.conflicts_detected, 0);
    assert_eq!(third.report.playlists_exported, 1);

    let written = source.written().await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].items.len(), 1);

    let state = harness
        .states
        .get(&stored.id, SourceKind::DjCatalog)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
    assert!(harness.states.conflicted_playlists().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_newer_source_copy_wins_when_timestamps_differ() {
    let source = seeded_source(SourceKind::DjCatalog, true).await;
    let harness = Harness::new(vec![source.clone()]).await;
    harness.run().await;

    let stored = harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "pl-1")
        .await
        .unwrap()
        .unwrap();
    let mut items = harness.playlists.items(&stored.id).await.unwrap();
    items.truncate(1);
    harness
        .playlists
        .set_items(&stored.id, &items, stored.version)
        .await
        .unwrap();

    // Source edit carries a modification time well past the store's.
    let mut upstream = playlist("pl-1", "Warmup", 2, &["t-3", "t-2", "t-1"]);
    upstream.modified_at = Some(stored.modified_at + 3600);
    source.set_playlists(vec![upstream]).await;

    let pass = harness.run().await;
    assert_eq!(pass.report.conflicts_auto_resolved, 1);
    assert_eq!(pass.report.conflicts_detected, 0);
    assert_eq!(pass.report.playlists_imported, 1);

    let items = harness.playlists.items(&stored.id).await.unwrap();
    let refs: Vec<_> = items.iter().map(|i| i.external_id.as_deref()).collect();
    assert_eq!(refs, vec![Some("t-3"), Some("t-2"), Some("t-1")]);
}

#[tokio::test]
async fn test_import_only_source_leaves_playlist_unsynced() {
    let source = seeded_source(SourceKind::MediaServer, false).await;
    let harness = Harness::new(vec![source.clone()]).await;
    harness.run().await;

    let stored = harness
        .playlists
        .find_by_external_id(SourceKind::MediaServer, "pl-1")
        .await
        .unwrap()
        .unwrap();
    let mut items = harness.playlists.items(&stored.id).await.unwrap();
    items.truncate(1);
    harness
        .playlists
        .set_items(&stored.id, &items, stored.version)
        .await
        .unwrap();

    let pass = harness.run().await;
    assert_eq!(pass.report.playlists_unsynced, 1);
    assert_eq!(pass.report.playlists_exported, 0);
    assert!(source.written().await.is_empty());

    let state = harness
        .states
        .get(&stored.id, SourceKind::MediaServer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, SyncStatus::Pending);
}

#[tokio::test]
async fn test_unreachable_source_does_not_block_others() {
    let server = seeded_source(SourceKind::MediaServer, false).await;
    server.set_unreachable(true).await;

    let catalog = Arc::new(FakeSource::new(SourceKind::DjCatalog, true));
    catalog.add_track("t-9", "/music/nine.mp3", "hash-9").await;
    catalog
        .set_playlists(vec![playlist("pl-9", "Peak Time", 1, &["t-9"])])
        .await;

    let harness = Harness::new(vec![server.clone(), catalog.clone()]).await;
    let pass = harness.run().await;

    assert_eq!(pass.report.sources_skipped, 1);
    assert_eq!(pass.report.playlists_created, 1);

    assert!(harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "pl-9")
        .await
        .unwrap()
        .is_some());

    // Next pass with the source back picks it up where nothing was lost.
    server.set_unreachable(false).await;
    let second = harness.run().await;
    assert_eq!(second.report.sources_skipped, 0);
    assert_eq!(second.report.playlists_created, 1);
}

#[tokio::test]
async fn test_corrupt_track_reference_is_skipped_not_fatal() {
    let source = Arc::new(FakeSource::new(SourceKind::DjCatalog, true));
    source.add_track("t-1", "/music/one.mp3", "hash-1").await;
    // "t-ghost" resolves to no hints at all.
    source
        .set_playlists(vec![playlist("pl-1", "Warmup", 1, &["t-1", "t-ghost"])])
        .await;

    let harness = Harness::new(vec![source.clone()]).await;
    let pass = harness.run().await;

    assert_eq!(pass.report.corrupt_candidates, 1);
    assert_eq!(pass.report.tracks_resolved, 1);

    let stored = harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "pl-1")
        .await
        .unwrap()
        .unwrap();
    let items = harness.playlists.items(&stored.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].external_id.as_deref(), Some("t-1"));
}

#[tokio::test]
async fn test_exported_native_playlist_is_not_reimported_as_duplicate() {
    let source = Arc::new(FakeSource::new(SourceKind::DjCatalog, true));
    let harness = Harness::new(vec![source.clone()]).await;

    let identity = harness
        .identities
        .create(Some("hash-n"), None, Some("/music/n.mp3"))
        .await
        .unwrap();
    let playlist = Playlist::new("Native Mix", SourceKind::Native);
    harness.playlists.create(&playlist).await.unwrap();
    harness
        .playlists
        .set_items(
            &playlist.id,
            &[PlaylistItem::new(&playlist.id, &identity.id, 0)],
            playlist.version,
        )
        .await
        .unwrap();

    let pass = harness.run().await;
    assert_eq!(pass.report.playlists_exported, 1);

    // The store copy adopted the id the source assigned.
    let stored = harness.playlists.get(&playlist.id).await.unwrap().unwrap();
    let adopted = stored.external_id.clone().unwrap();
    assert_eq!(adopted, "fake-101");

    // Next pass the source lists the playlist it accepted. It must match
    // the existing native playlist, not spawn a copy.
    source.add_track("t-n", "/music/n.mp3", "hash-n").await;
    source
        .set_playlists(vec![SourcePlaylist {
            external_id: adopted,
            name: "Native Mix".to_string(),
            version: 101,
            modified_at: None,
            items: vec![SourceItem {
                external_track_ref: "t-n".to_string(),
                position: 0,
            }],
        }])
        .await;

    let second = harness.run().await;
    assert_eq!(second.report.playlists_created, 0);
    assert_eq!(second.report.playlists_imported, 0);
    assert_eq!(second.report.playlists_exported, 0);
    assert_eq!(harness.playlists.list_active().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_same_track_across_sources_resolves_to_one_identity() {
    let server = Arc::new(FakeSource::new(SourceKind::MediaServer, false));
    server
        .add_track("rating-key-7", "/library/song.mp3", "hash-s")
        .await;
    server
        .set_playlists(vec![playlist("srv-1", "Favorites", 1, &["rating-key-7"])])
        .await;

    let catalog = Arc::new(FakeSource::new(SourceKind::DjCatalog, true));
    catalog
        .add_track("row-42", "/export/song.aiff", "hash-s")
        .await;
    catalog
        .set_playlists(vec![playlist("cat-1", "Crate", 1, &["row-42"])])
        .await;

    let harness = Harness::new(vec![server, catalog]).await;
    let pass = harness.run().await;

    // Same content hash from both sources: one identity, not two.
    assert_eq!(pass.report.tracks_resolved, 2);
    assert_eq!(pass.report.identities_created, 1);

    let favorites = harness
        .playlists
        .find_by_external_id(SourceKind::MediaServer, "srv-1")
        .await
        .unwrap()
        .unwrap();
    let crate_list = harness
        .playlists
        .find_by_external_id(SourceKind::DjCatalog, "cat-1")
        .await
        .unwrap()
        .unwrap();
    let a = harness.playlists.items(&favorites.id).await.unwrap();
    let b = harness.playlists.items(&crate_list.id).await.unwrap();
    assert_eq!(a[0].identity_id, b[0].identity_id);
}
