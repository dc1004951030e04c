//! An incremental, encrypted, deduplicating backup engine that mirrors a
//! local file tree into an S3-compatible or WebDAV object store.
//!
//! The core: [`fingerprint`] computes per-file checksums, [`index`] models
//! one snapshot, [`diff`] compares two of them, [`codec`] compresses and
//! authenticate-encrypts payloads, [`store`] is the object-store contract
//! those payloads and indexes live behind, [`pipeline`] drives a backup
//! end-to-end, [`restore`] rebuilds a tree from a snapshot, and
//! [`retention`] expires old snapshots without orphaning live data.
//! [`engine`] wires all of it into the three calls an external front-end
//! actually needs: backup, restore, prune.

pub mod codec;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod pipeline;
pub mod restore;
pub mod retention;
pub mod store;

pub use config::Config;
pub use engine::Engine;
pub use error::{BackupError, Result};
pub use index::{FileEntry, SnapshotIndex};
pub use pipeline::{BackupReport, Pipeline};
pub use restore::{RestoreReport, Restorer};
pub use retention::{Retention, RetentionPlan};
