//! Artifact and cache persistence for Gantry.
//!
//! Everything here sits behind the `BlobStore` port from `gantry-core`;
//! the artifact and cache stores add keying, expiry, and lookup semantics
//! on top of whichever backend is wired in.

pub mod artifacts;
pub mod blob;
pub mod cache;

pub use artifacts::ArtifactStore;
pub use blob::{FilesystemBlobStore, MemoryBlobStore};
pub use cache::{CacheHit, CacheStore};
