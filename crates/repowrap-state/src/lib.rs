//! repowrap-state: artifact persistence for pipeline runs
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only, per-run records that can be retrieved independently
//! by (run id, stage, attempt).
//!
//! ## Key Components
//!
//! - `ArtifactStore`: the async storage contract
//! - `FsArtifactStore`: filesystem backend with write-once files
//! - `fakes::MemoryArtifactStore`: in-memory backend for tests

mod error;
pub mod fakes;
pub mod fs_store;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::FsArtifactStore;
pub use storage_traits::{
    encode_report, ArtifactStore, AttemptKey, AttemptRecord, ContentDigest, RunId, RunRecord,
    StorageResult, TransitionRecord,
};
