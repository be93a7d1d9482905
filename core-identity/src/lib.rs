//! Track identification: content hashing and cascading identity resolution.

pub mod error;
pub mod hash;
pub mod resolver;

pub use error::{IdentifyError, Result};
pub use hash::{hash_bytes, hash_file};
pub use resolver::{Candidate, Resolution, ResolverConfig, TrackResolver};
