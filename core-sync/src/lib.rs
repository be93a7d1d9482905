//! # Core Sync
//!
//! Playlist synchronization between the persistent store and external
//! sources: import, three-way reconciliation, and export, driven by one
//! orchestrated pass at a time.

pub mod adapter;
pub mod error;
pub mod orchestrator;
pub mod pass;

pub use adapter::{SourceAdapter, SourceItem, SourcePlaylist, TrackHints, WriteReceipt};
pub use error::{Result, SyncError};
pub use orchestrator::{SyncConfig, SyncOrchestrator};
pub use pass::{PassId, PassPhase, PassReport, SyncPass};
