//! # Sync Orchestrator
//!
//! Drives one full synchronization pass across every configured source.
//!
//! ## Workflow
//!
//! 1. Import: list playlists from each source in turn. An unreachable or
//!    timed-out source is skipped; the others proceed.
//! 2. For each source playlist, compare three versions: the source's
//!    version, the store's version, and the pair recorded at the last
//!    successful sync. Only the side that actually moved flows.
//! 3. When both sides moved, apply last-writer-wins if both carry distinct
//!    modification times; otherwise mark the playlist conflicted and touch
//!    nothing. The conflict clears once a later pass sees the source back
//!    at the last-synced state.
//! 4. Reconcile: collect store playlists whose version advanced past the
//!    recorded baseline for each source.
//! 5. Export: push those playlists to sources that accept writes. Writes
//!    to import-only sources are counted as unsynced and retried next pass.
//!
//! Store writes race with concurrent passes through optimistic versioning;
//! a `VersionConflict` is retried a bounded number of times with a fresh
//! read before the pass gives up.

use crate::{
    adapter::{SourceAdapter, SourceItem, SourcePlaylist},
    pass::SyncPass,
    Result, SyncError,
};
use core_identity::{Candidate, IdentifyError, TrackResolver};
use core_store::{
    now_ts, IdentityStore, Playlist, PlaylistItem, PlaylistStore, SourceKind, StoreError,
    SyncState, SyncStateRepository, SyncStatus,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Sync orchestrator configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Timeout for an individual adapter call (seconds)
    pub adapter_timeout_secs: u64,

    /// Timeout for the entire pass (seconds)
    pub pass_timeout_secs: u64,

    /// How many times a store write is retried after a version conflict
    pub max_version_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_secs: 30,
            pass_timeout_secs: 600,
            max_version_retries: 3,
        }
    }
}

/// A playlist that reconciliation decided must flow out to one source
struct ExportTask {
    adapter: Arc<dyn SourceAdapter>,
    playlist: Playlist,
}

/// Orchestrates import, reconciliation, and export across all sources
pub struct SyncOrchestrator {
    config: SyncConfig,
    identity_store: Arc<dyn IdentityStore>,
    playlist_store: Arc<dyn PlaylistStore>,
    sync_states: Arc<dyn SyncStateRepository>,
    resolver: Arc<TrackResolver>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        identity_store: Arc<dyn IdentityStore>,
        playlist_store: Arc<dyn PlaylistStore>,
        sync_states: Arc<dyn SyncStateRepository>,
        resolver: Arc<TrackResolver>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
    ) -> Self {
        Self {
            config,
            identity_store,
            playlist_store,
            sync_states,
            resolver,
            adapters,
        }
    }

    /// Run one complete sync pass
    ///
    /// Returns the completed pass with its report. A single unreachable
    /// source does not fail the pass; store errors, cancellation, and the
    /// overall pass timeout do.
    #[instrument(skip(self, cancellation_token))]
    pub async fn run_pass(&self, cancellation_token: CancellationToken) -> Result<SyncPass> {
        let mut pass = SyncPass::new();
        info!(pass_id = %pass.id, sources = self.adapters.len(), "Starting sync pass");

        let outcome = timeout(
            Duration::from_secs(self.config.pass_timeout_secs),
            self.execute(&mut pass, &cancellation_token),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                info!(
                    pass_id = %pass.id,
                    imported = pass.report.playlists_imported,
                    created = pass.report.playlists_created,
                    exported = pass.report.playlists_exported,
                    conflicts = pass.report.conflicts_detected,
                    skipped_sources = pass.report.sources_skipped,
                    "Sync pass completed"
                );
                Ok(pass)
            }
            Ok(Err(e)) => {
                error!(pass_id = %pass.id, error = %e, "Sync pass failed");
                pass.fail(e.to_string())?;
                Err(e)
            }
            Err(_) => {
                let e = SyncError::Timeout {
                    scope: "Sync pass".to_string(),
                    secs: self.config.pass_timeout_secs,
                };
                error!(pass_id = %pass.id, error = %e, "Sync pass timed out");
                pass.fail(e.to_string())?;
                Err(e)
            }
        }
    }

    async fn execute(&self, pass: &mut SyncPass, token: &CancellationToken) -> Result<()> {
        for adapter in &self.adapters {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            pass.begin_import(adapter.source_kind())?;
            if let Err(e) = self.import_source(adapter.as_ref(), pass, token).await {
                if e.is_source_failure() {
                    warn!(
                        source = %adapter.source_kind(),
                        error = %e,
                        "Source unavailable, skipping for this pass"
                    );
                    pass.report.sources_skipped += 1;
                } else {
                    return Err(e);
                }
            }
        }

        pass.begin_reconcile()?;
        let exports = self.reconcile().await?;
        debug!(pending_exports = exports.len(), "Reconciliation complete");

        pass.begin_export()?;
        self.export(exports, pass, token).await?;

        pass.finish()
    }

    /// Pull every playlist page from one source and sync each playlist
    #[instrument(skip(self, adapter, pass, token), fields(source = %adapter.source_kind()))]
    async fn import_source(
        &self,
        adapter: &dyn SourceAdapter,
        pass: &mut SyncPass,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut cursor = None;
        loop {
            let (page, next) = self
                .adapter_call(adapter.source_kind(), adapter.list_playlists(cursor))
                .await?;

            for source_playlist in &page {
                if token.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                self.sync_source_playlist(adapter, source_playlist, pass)
                    .await?;
            }

            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(())
    }

    /// Decide, for one source playlist, which direction (if any) flows
    async fn sync_source_playlist(
        &self,
        adapter: &dyn SourceAdapter,
        source_playlist: &SourcePlaylist,
        pass: &mut SyncPass,
    ) -> Result<()> {
        let kind = adapter.source_kind();

        let existing = self.match_store_playlist(kind, source_playlist).await?;
        let Some(playlist) = existing else {
            return self.import_new_playlist(adapter, source_playlist, pass).await;
        };

        let state = self.sync_states.get(&playlist.id, kind).await?;
        let (last_source, last_store) = state
            .as_ref()
            .map(|s| (s.last_source_version, s.last_store_version))
            .unwrap_or((0, 0));
        let was_conflict = state.as_ref().map(|s| s.status) == Some(SyncStatus::Conflict);

        let source_changed = source_playlist.version != last_source;
        let store_changed = playlist.version != last_store;

        match (source_changed, store_changed) {
            (false, _) => {
                // Nothing inbound. Outbound changes are the export
                // phase's business. A recorded conflict no longer holds
                // once the source is back at the last-synced state;
                // clear it so reconciliation can move the store copy out.
                if was_conflict {
                    info!(
                        playlist_id = %playlist.id,
                        source = %kind,
                        "Source back at last-synced state, clearing conflict"
                    );
                    let status = if store_changed {
                        SyncStatus::Pending
                    } else {
                        SyncStatus::Synced
                    };
                    self.sync_states
                        .set_status(&playlist.id, kind, status)
                        .await?;
                } else {
                    debug!(playlist_id = %playlist.id, "Source unchanged");
                }
            }
            (true, false) => {
                self.import_into(adapter, source_playlist, &playlist, pass)
                    .await?;
                pass.report.playlists_imported += 1;
            }
            (true, true) => {
                self.handle_conflict(adapter, source_playlist, &playlist, pass)
                    .await?;
            }
        }
        Ok(())
    }

    /// Find the store playlist a source playlist corresponds to
    ///
    /// External id first, then case-insensitive name. Each key is also
    /// checked against native playlists, which adopt a source id when they
    /// are first exported; without that check a re-listed export would be
    /// imported as a duplicate.
    async fn match_store_playlist(
        &self,
        kind: SourceKind,
        source_playlist: &SourcePlaylist,
    ) -> Result<Option<Playlist>> {
        if let Some(p) = self
            .playlist_store
            .find_by_external_id(kind, &source_playlist.external_id)
            .await?
        {
            return Ok(Some(p));
        }
        if let Some(p) = self
            .playlist_store
            .find_by_external_id(SourceKind::Native, &source_playlist.external_id)
            .await?
        {
            return Ok(Some(p));
        }
        // Some source formats carry no stable playlist ids across
        // rebuilds; names are the only durable key.
        if let Some(p) = self
            .playlist_store
            .find_by_name(kind, &source_playlist.name)
            .await?
        {
            return Ok(Some(p));
        }
        Ok(self
            .playlist_store
            .find_by_name(SourceKind::Native, &source_playlist.name)
            .await?)
    }

    /// Both sides moved since the last sync. Last-writer-wins applies only
    /// when both modification times are known and differ; anything less
    /// certain stays conflicted until a human decides.
    async fn handle_conflict(
        &self,
        adapter: &dyn SourceAdapter,
        source_playlist: &SourcePlaylist,
        playlist: &Playlist,
        pass: &mut SyncPass,
    ) -> Result<()> {
        let kind = adapter.source_kind();

        match source_playlist.modified_at {
            Some(source_ts) if source_ts > playlist.modified_at => {
                info!(
                    playlist_id = %playlist.id,
                    "Both sides changed, source copy is newer, importing"
                );
                self.import_into(adapter, source_playlist, playlist, pass)
                    .await?;
                pass.report.playlists_imported += 1;
                pass.report.conflicts_auto_resolved += 1;
            }
            Some(source_ts) if source_ts < playlist.modified_at => {
                info!(
                    playlist_id = %playlist.id,
                    "Both sides changed, store copy is newer, leaving for export"
                );
                // Export sees the advanced store version and pushes it.
                pass.report.conflicts_auto_resolved += 1;
            }
            _ => {
                warn!(
                    playlist_id = %playlist.id,
                    source = %kind,
                    "Both sides changed with no usable timestamps, marking conflict"
                );
                self.sync_states
                    .set_status(&playlist.id, kind, SyncStatus::Conflict)
                    .await?;
                pass.report.conflicts_detected += 1;
            }
        }
        Ok(())
    }

    /// First sighting of a source playlist: create the store copy whole
    async fn import_new_playlist(
        &self,
        adapter: &dyn SourceAdapter,
        source_playlist: &SourcePlaylist,
        pass: &mut SyncPass,
    ) -> Result<()> {
        let kind = adapter.source_kind();

        let mut playlist = Playlist::new(&source_playlist.name, kind);
        playlist.external_id = Some(source_playlist.external_id.clone());
        if let Some(ts) = source_playlist.modified_at {
            playlist.modified_at = ts;
        }
        self.playlist_store.create(&playlist).await?;

        let items = self
            .resolve_items(adapter, &playlist.id, &source_playlist.items, pass)
            .await?;
        let new_version = self
            .set_items_with_retry(&playlist.id, items, playlist.version)
            .await?;

        self.record_synced(&playlist.id, kind, source_playlist.version, new_version)
            .await?;

        info!(playlist_id = %playlist.id, name = %playlist.name, source = %kind, "Created playlist from source");
        pass.report.playlists_created += 1;
        Ok(())
    }

    /// Replace the store copy's items with the source's current ordering
    async fn import_into(
        &self,
        adapter: &dyn SourceAdapter,
        source_playlist: &SourcePlaylist,
        playlist: &Playlist,
        pass: &mut SyncPass,
    ) -> Result<()> {
        let kind = adapter.source_kind();

        let items = self
            .resolve_items(adapter, &playlist.id, &source_playlist.items, pass)
            .await?;
        let mut new_version = self
            .set_items_with_retry(&playlist.id, items, playlist.version)
            .await?;

        // Carry a source-side rename over.
        if playlist.name != source_playlist.name {
            let mut renamed = playlist.clone();
            renamed.name = source_playlist.name.clone();
            renamed.version = new_version;
            let updated = self.playlist_store.update(&renamed, new_version).await?;
            new_version = updated.version;
        }

        self.record_synced(&playlist.id, kind, source_playlist.version, new_version)
            .await
    }

    /// Resolve each source item to a track identity, in source order
    ///
    /// Corrupt references are skipped and counted; they never abort the
    /// playlist.
    async fn resolve_items(
        &self,
        adapter: &dyn SourceAdapter,
        playlist_id: &str,
        source_items: &[SourceItem],
        pass: &mut SyncPass,
    ) -> Result<Vec<PlaylistItem>> {
        let kind = adapter.source_kind();

        let mut ordered: Vec<&SourceItem> = source_items.iter().collect();
        ordered.sort_by_key(|item| item.position);

        let mut items = Vec::with_capacity(ordered.len());
        for source_item in ordered {
            let hints = self
                .adapter_call(
                    kind,
                    adapter.resolve_track_ref(&source_item.external_track_ref),
                )
                .await?;

            let mut candidate = Candidate::new()
                .with_external_ref(format!("{}:{}", kind, source_item.external_track_ref));
            if let Some(path) = hints.path {
                candidate = candidate.with_path(path);
            }
            if let Some(hash) = hints.hash {
                candidate = candidate.with_hash(hash);
            }
            if let Some(fingerprint) = hints.fingerprint {
                candidate = candidate.with_fingerprint(fingerprint);
            }

            match self.resolver.resolve(&candidate).await {
                Ok(resolution) => {
                    pass.report.tracks_resolved += 1;
                    if resolution.is_new {
                        pass.report.identities_created += 1;
                    }
                    let position = items.len() as i64;
                    let mut item =
                        PlaylistItem::new(playlist_id, &resolution.identity.id, position);
                    item.external_id = Some(source_item.external_track_ref.clone());
                    items.push(item);
                }
                Err(IdentifyError::CorruptCandidate) => {
                    warn!(
                        source = %kind,
                        track_ref = %source_item.external_track_ref,
                        "Track reference carries nothing identifiable, skipping"
                    );
                    pass.report.corrupt_candidates += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(items)
    }

    /// Write items, re-reading and retrying on a stale version
    async fn set_items_with_retry(
        &self,
        playlist_id: &str,
        items: Vec<PlaylistItem>,
        mut expected_version: i64,
    ) -> Result<i64> {
        let mut attempts = 0;
        loop {
            match self
                .playlist_store
                .set_items(playlist_id, &items, expected_version)
                .await
            {
                Ok(version) => return Ok(version),
                Err(StoreError::VersionConflict { actual, .. }) => {
                    attempts += 1;
                    if attempts > self.config.max_version_retries {
                        return Err(SyncError::RetriesExhausted {
                            playlist_id: playlist_id.to_string(),
                            attempts,
                        });
                    }
                    debug!(
                        playlist_id,
                        attempt = attempts,
                        actual_version = actual,
                        "Version conflict, retrying with fresh version"
                    );
                    expected_version = actual;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Collect store playlists whose version moved past the recorded
    /// baseline for each source
    async fn reconcile(&self) -> Result<Vec<ExportTask>> {
        let mut tasks = Vec::new();
        for adapter in &self.adapters {
            let kind = adapter.source_kind();

            // A source receives its own playlists back, plus every
            // playlist authored natively in the store.
            let mut candidates = self.playlist_store.list_by_source(kind).await?;
            candidates.extend(self.playlist_store.list_by_source(SourceKind::Native).await?);

            for playlist in candidates {
                if !playlist.is_active {
                    continue;
                }
                let state = self.sync_states.get(&playlist.id, kind).await?;
                if let Some(state) = &state {
                    if state.status == SyncStatus::Conflict {
                        continue;
                    }
                }
                let last_store = state.map(|s| s.last_store_version).unwrap_or(0);
                if playlist.version != last_store {
                    tasks.push(ExportTask {
                        adapter: adapter.clone(),
                        playlist,
                    });
                }
            }
        }
        Ok(tasks)
    }

    /// Push reconciled playlists out to their sources
    async fn export(
        &self,
        tasks: Vec<ExportTask>,
        pass: &mut SyncPass,
        token: &CancellationToken,
    ) -> Result<()> {
        for task in tasks {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let kind = task.adapter.source_kind();
            if !task.adapter.supports_write() {
                debug!(
                    playlist_id = %task.playlist.id,
                    source = %kind,
                    "Source is import-only, playlist stays unsynced"
                );
                self.sync_states
                    .set_status(&task.playlist.id, kind, SyncStatus::Pending)
                    .await?;
                pass.report.playlists_unsynced += 1;
                continue;
            }

            let outbound = self.build_source_playlist(&task.playlist).await?;
            match self
                .adapter_call(kind, task.adapter.write_playlist(&outbound))
                .await
            {
                Ok(receipt) => {
                    // A playlist with no source id yet adopts the one the
                    // source assigned, so future imports match it.
                    let mut store_version = task.playlist.version;
                    if task.playlist.external_id.is_none() {
                        let mut adopted = task.playlist.clone();
                        adopted.external_id = Some(receipt.external_id.clone());
                        let updated = self
                            .playlist_store
                            .update(&adopted, store_version)
                            .await?;
                        store_version = updated.version;
                    }
                    self.record_synced(&task.playlist.id, kind, receipt.version, store_version)
                        .await?;
                    pass.report.playlists_exported += 1;
                }
                Err(e) if e.is_source_failure() => {
                    warn!(
                        playlist_id = %task.playlist.id,
                        source = %kind,
                        error = %e,
                        "Export failed, playlist stays unsynced"
                    );
                    pass.report.playlists_unsynced += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Assemble the outbound snapshot of a store playlist
    ///
    /// Items are addressed by the external reference the source originally
    /// gave us, falling back to the track's current file path. Items with
    /// neither are dropped from the snapshot; the source has no way to
    /// name them.
    async fn build_source_playlist(&self, playlist: &Playlist) -> Result<SourcePlaylist> {
        let stored = self.playlist_store.items(&playlist.id).await?;

        let mut items = Vec::with_capacity(stored.len());
        for item in stored {
            let track_ref = match item.external_id {
                Some(external_id) => Some(external_id),
                None => self
                    .identity_store
                    .current_location(&item.identity_id)
                    .await?
                    .map(|location| location.file_path),
            };
            match track_ref {
                Some(external_track_ref) => items.push(SourceItem {
                    external_track_ref,
                    position: items.len() as i64,
                }),
                None => {
                    warn!(
                        playlist_id = %playlist.id,
                        identity_id = %item.identity_id,
                        "Track has no external reference or known path, dropping from export"
                    );
                }
            }
        }

        Ok(SourcePlaylist {
            external_id: playlist
                .external_id
                .clone()
                .unwrap_or_else(|| playlist.id.clone()),
            name: playlist.name.clone(),
            version: playlist.version,
            modified_at: Some(playlist.modified_at),
            items,
        })
    }

    /// Record a successful sync of one playlist against one source
    async fn record_synced(
        &self,
        playlist_id: &str,
        source: SourceKind,
        source_version: i64,
        store_version: i64,
    ) -> Result<()> {
        let state = SyncState {
            playlist_id: playlist_id.to_string(),
            source,
            last_source_version: source_version,
            last_store_version: store_version,
            last_synced_at: Some(now_ts()),
            status: SyncStatus::Synced,
        };
        self.sync_states.upsert(&state).await?;
        Ok(())
    }

    /// Run an adapter future under the per-call timeout
    async fn adapter_call<T>(
        &self,
        kind: SourceKind,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(Duration::from_secs(self.config.adapter_timeout_secs), call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                scope: format!("Source {}", kind),
                secs: self.config.adapter_timeout_secs,
            }),
        }
    }
}
