//! Track identity resolution.
//!
//! Resolves a candidate file reference to a stable `TrackIdentity` by
//! cascading through matching strategies in strict priority order:
//!
//! 1. Exact content hash match → `Exact`
//! 2. Fingerprint above the high similarity threshold → `High`
//! 3. Fingerprint above the lower similarity threshold → `Medium`
//! 4. Last-known path match → `Low` (content may have changed silently)
//! 5. Synthetic external key match → `Low`
//! 6. Nothing matched → create a new identity → `New`
//!
//! Creation of new identities is serialized per distinct content hash so
//! that concurrent resolutions of the same unseen file never allocate two
//! identities.

use crate::error::{IdentifyError, Result};
use core_store::{Confidence, Fingerprint, IdentityStore, TrackIdentity};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// A track reference awaiting resolution
///
/// Any subset of fields may be present; a candidate with none of hash,
/// fingerprint, or path is rejected as corrupt.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub hash: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub path: Option<String>,
    pub external_ref: Option<String>,
}

impl Candidate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    fn is_corrupt(&self) -> bool {
        self.hash.is_none() && self.fingerprint.is_none() && self.path.is_none()
    }

    /// Key under which creation of a new identity for this candidate is
    /// serialized: the content hash when present, else the path, else the
    /// external reference.
    fn lock_key(&self) -> String {
        if let Some(hash) = &self.hash {
            hash.clone()
        } else if let Some(path) = &self.path {
            format!("path:{}", path)
        } else if let Some(external_ref) = &self.external_ref {
            format!("ref:{}", external_ref)
        } else {
            // Unreachable for non-corrupt candidates.
            String::new()
        }
    }
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Fingerprint similarity at or above this resolves with `High` confidence
    pub high_threshold: f64,

    /// Fingerprint similarity at or above this resolves with `Medium` confidence
    pub low_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.95,
            low_threshold: 0.85,
        }
    }
}

/// Outcome of a resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The live identity the candidate resolved to
    pub identity: TrackIdentity,
    /// Confidence of this resolution
    pub confidence: Confidence,
    /// Whether a new identity was allocated
    pub is_new: bool,
    /// Fingerprint similarity score, when the fingerprint strategy matched
    pub score: Option<f64>,
}

/// Cascading track identity resolver
pub struct TrackResolver {
    store: Arc<dyn IdentityStore>,
    config: ResolverConfig,

    /// One mutex per in-flight creation key; lookups never take these.
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TrackResolver {
    pub fn new(store: Arc<dyn IdentityStore>, config: ResolverConfig) -> Self {
        Self {
            store,
            config,
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a candidate to a stable identity
    ///
    /// Never fails on an ordinary non-match (a new identity is created);
    /// fails with `CorruptCandidate` when the candidate carries none of
    /// hash, fingerprint, or path.
    #[instrument(skip(self, candidate), fields(hash = candidate.hash.as_deref(), path = candidate.path.as_deref()))]
    pub async fn resolve(&self, candidate: &Candidate) -> Result<Resolution> {
        if candidate.is_corrupt() {
            return Err(IdentifyError::CorruptCandidate);
        }

        if let Some(resolution) = self.try_match(candidate).await? {
            return self.finalize(candidate, resolution).await;
        }

        // Nothing matched: serialize creation for this candidate's key so
        // two concurrent resolutions of the same new track cannot both
        // allocate an identity.
        let key = candidate.lock_key();
        let lock = {
            let mut locks = self.creation_locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let outcome = {
            let _guard = lock.lock().await;
            self.match_or_create(candidate).await
        };

        // Evict the entry once creation settles; waiters hold their own
        // `Arc` to the mutex, and any later arrival re-checks the store
        // before creating.
        self.creation_locks.lock().await.remove(&key);

        outcome
    }

    /// Re-run the cascade and create a new identity if it still misses.
    /// The caller holds the creation lock for this candidate's key.
    async fn match_or_create(&self, candidate: &Candidate) -> Result<Resolution> {
        // Another task may have created the identity while we waited.
        if let Some(resolution) = self.try_match(candidate).await? {
            return self.finalize(candidate, resolution).await;
        }

        let identity = self
            .store
            .create(
                candidate.hash.as_deref(),
                candidate.fingerprint.as_ref(),
                candidate.path.as_deref(),
            )
            .await?;

        if let Some(external_ref) = &candidate.external_ref {
            self.store.record_external_key(&identity.id, external_ref).await?;
        }

        debug!(identity_id = %identity.id, "No strategy matched, created new identity");

        Ok(Resolution {
            identity,
            confidence: Confidence::New,
            is_new: true,
            score: None,
        })
    }

    /// Run the lookup cascade without side effects
    async fn try_match(&self, candidate: &Candidate) -> Result<Option<Resolution>> {
        if let Some(hash) = &candidate.hash {
            if let Some(identity) = self.store.find_by_hash(hash).await? {
                return Ok(Some(Resolution {
                    identity,
                    confidence: Confidence::Exact,
                    is_new: false,
                    score: None,
                }));
            }
        }

        if let Some(fingerprint) = &candidate.fingerprint {
            if let Some((identity, score)) = self
                .store
                .find_by_fingerprint(fingerprint, self.config.high_threshold)
                .await?
            {
                return Ok(Some(Resolution {
                    identity,
                    confidence: Confidence::High,
                    is_new: false,
                    score: Some(score),
                }));
            }

            if let Some((identity, score)) = self
                .store
                .find_by_fingerprint(fingerprint, self.config.low_threshold)
                .await?
            {
                return Ok(Some(Resolution {
                    identity,
                    confidence: Confidence::Medium,
                    is_new: false,
                    score: Some(score),
                }));
            }
        }

        if let Some(path) = &candidate.path {
            if let Some(identity) = self.store.find_by_last_known_path(path).await? {
                return Ok(Some(Resolution {
                    identity,
                    confidence: Confidence::Low,
                    is_new: false,
                    score: None,
                }));
            }
        }

        if let Some(external_ref) = &candidate.external_ref {
            if let Some(identity) = self.store.find_by_external_key(external_ref).await? {
                return Ok(Some(Resolution {
                    identity,
                    confidence: Confidence::Low,
                    is_new: false,
                    score: None,
                }));
            }
        }

        Ok(None)
    }

    /// Record side effects of a successful match: moved files get a fresh
    /// location record, the identity's confidence and `last_seen` are
    /// updated, and any external reference is associated for future passes.
    async fn finalize(&self, candidate: &Candidate, resolution: Resolution) -> Result<Resolution> {
        if let Some(path) = &candidate.path {
            // record_location is a no-op when the path is unchanged.
            self.store.record_location(&resolution.identity.id, path).await?;
        }

        self.store
            .touch(&resolution.identity.id, resolution.confidence)
            .await?;

        if let Some(external_ref) = &candidate.external_ref {
            self.store
                .record_external_key(&resolution.identity.id, external_ref)
                .await?;
        }

        let Resolution {
            mut identity,
            confidence,
            is_new,
            score,
        } = resolution;
        identity.confidence = confidence;

        Ok(Resolution {
            identity,
            confidence,
            is_new,
            score,
        })
    }
}
