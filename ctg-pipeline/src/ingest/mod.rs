//! Two-phase file discovery
//!
//! Phase A ([`walker`]) enumerates candidate files and enqueues lightweight
//! `{path, size}` rows; Phase B ([`batcher`]) reads contents, counts tokens,
//! and packs size-bounded analysis batches. The phases are decoupled by the
//! `files-to-batch` queue so batching scales horizontally while the walk
//! stays single-writer under the discovery lease.

pub mod batcher;
pub mod walker;

pub use batcher::{AnalysisBatch, BatchEntry, BatchPacker, Batcher};
pub use walker::{DiscoveredFile, ScanError, SourceWalker};
