//! # Sync Pass State Machine
//!
//! Tracks the lifecycle of one synchronization pass with validated phase
//! transitions.
//!
//! ## State Machine
//!
//! ```text
//! Idle → Importing → Reconciling → Exporting → Idle
//!   │    (per source, repeats)
//!   └──────────┴────────────┴──────────┴────→ Failed
//! ```
//!
//! `Importing` repeats once per configured source. A pass can fail from
//! any non-failed phase; a failed pass is reset to `Idle` before the next
//! one starts.

use crate::{Result, SyncError};
use core_store::SourceKind;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PassId(Uuid);

impl PassId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PassId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The phase a sync pass is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassPhase {
    /// No work in flight
    Idle,
    /// Pulling playlists from one source
    Importing(SourceKind),
    /// Comparing versions and deciding what must flow where
    Reconciling,
    /// Pushing changed playlists back to writable sources
    Exporting,
    /// The pass aborted with an error
    Failed,
}

impl PassPhase {
    /// Phase name without the importing source qualifier
    pub fn as_str(&self) -> &'static str {
        match self {
            PassPhase::Idle => "idle",
            PassPhase::Importing(_) => "importing",
            PassPhase::Reconciling => "reconciling",
            PassPhase::Exporting => "exporting",
            PassPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PassPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassPhase::Importing(kind) => write!(f, "importing({})", kind),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Counters collected over one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// Source playlists whose changes were pulled into the store
    pub playlists_imported: u64,
    /// Playlists newly created in the store from a source
    pub playlists_created: u64,
    /// Track references resolved to an identity
    pub tracks_resolved: u64,
    /// Identities newly allocated during resolution
    pub identities_created: u64,
    /// Track references skipped because they carried nothing identifiable
    pub corrupt_candidates: u64,
    /// Playlists left in conflict for a human to resolve
    pub conflicts_detected: u64,
    /// Conflicts settled automatically by last-writer-wins
    pub conflicts_auto_resolved: u64,
    /// Playlists pushed back to a source
    pub playlists_exported: u64,
    /// Playlists with pending changes that could not be written out
    pub playlists_unsynced: u64,
    /// Sources skipped because they were unreachable
    pub sources_skipped: u64,
}

impl PassReport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One synchronization pass with state machine semantics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPass {
    pub id: PassId,
    pub phase: PassPhase,
    pub report: PassReport,
    /// Error message if the pass failed
    pub error_message: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

impl SyncPass {
    /// Create a new pass in the idle phase
    pub fn new() -> Self {
        Self {
            id: PassId::new(),
            phase: PassPhase::Idle,
            report: PassReport::new(),
            error_message: None,
            started_at: current_timestamp(),
            completed_at: None,
        }
    }

    /// Enter the import phase for one source
    ///
    /// # Errors
    ///
    /// Returns an error unless the pass is idle or already importing.
    pub fn begin_import(&mut self, source: SourceKind) -> Result<()> {
        self.transition(PassPhase::Importing(source))
    }

    /// Enter the reconciliation phase
    pub fn begin_reconcile(&mut self) -> Result<()> {
        self.transition(PassPhase::Reconciling)
    }

    /// Enter the export phase
    pub fn begin_export(&mut self) -> Result<()> {
        self.transition(PassPhase::Exporting)
    }

    /// Complete the pass, returning to idle
    pub fn finish(&mut self) -> Result<()> {
        self.transition(PassPhase::Idle)?;
        self.completed_at = Some(current_timestamp());
        Ok(())
    }

    /// Mark the pass as failed with an error message
    ///
    /// Valid from every phase except an already-failed one.
    pub fn fail(&mut self, error_message: impl Into<String>) -> Result<()> {
        self.transition(PassPhase::Failed)?;
        self.error_message = Some(error_message.into());
        self.completed_at = Some(current_timestamp());
        Ok(())
    }

    /// Duration of the pass in seconds, once completed
    pub fn duration_secs(&self) -> Option<u64> {
        self.completed_at
            .map(|end| (end - self.started_at).max(0) as u64)
    }

    fn transition(&mut self, to: PassPhase) -> Result<()> {
        let valid = match (self.phase, to) {
            (PassPhase::Idle, PassPhase::Importing(_)) => true,
            // A pass with no configured sources goes straight to reconciling.
            (PassPhase::Idle, PassPhase::Reconciling) => true,

            // One import phase per source.
            (PassPhase::Importing(_), PassPhase::Importing(_)) => true,
            (PassPhase::Importing(_), PassPhase::Reconciling) => true,

            (PassPhase::Reconciling, PassPhase::Exporting) => true,
            (PassPhase::Exporting, PassPhase::Idle) => true,

            // Failure is reachable from any live phase, and never twice.
            (PassPhase::Failed, _) => false,
            (_, PassPhase::Failed) => true,

            _ => false,
        };

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
                reason: format!("Cannot transition from {} to {}", self.phase, to),
            });
        }

        self.phase = to;
        Ok(())
    }
}

impl Default for SyncPass {
    fn default() -> Self {
        Self::new()
    }
}

/// Get current Unix timestamp
fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time before UNIX epoch")
        .as_secs() as i64
}
