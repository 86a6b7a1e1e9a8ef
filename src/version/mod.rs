//! Copy-on-write metadata for the live table set.
//!
//! A [`Version`] is an immutable per-level list of table metadata; a
//! [`VersionEdit`] is the only way state changes, applied atomically by the
//! [`VersionSet`] and persisted to the manifest before publication.

pub mod edit;
pub mod meta;
pub mod set;
#[allow(clippy::module_inception)]
pub mod version;

pub use edit::VersionEdit;
pub use meta::RemoteTableMeta;
pub use set::{VersionBuilder, VersionSet};
pub use version::{Version, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
