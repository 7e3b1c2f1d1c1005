//! Detection orchestration engine.
//!
//! Everything between the HTTP surface and the detector backends lives here:
//! chunking long inputs, fanning detection across backends, filtering spans
//! against the per-request policy, resolving multi-label conflicts, merging
//! across detectors, and rendering masked output — unary or streamed.

/// Chunked execution over long inputs.
pub mod chunked;
/// Token-bounded chunking strategies.
pub mod chunking;
/// Deterministic multi-label conflict resolution.
pub mod conflict;
/// Placeholder substitution.
pub mod mask;
/// Cross-detector span merging.
pub mod merger;
/// The composite orchestrator.
pub mod service;
/// Core span and result types.
pub mod types;

pub use chunked::{ChunkedRunner, RunnerSettings};
pub use conflict::ConflictResolver;
pub use merger::DetectionMerger;
pub use service::{DetectionApi, DetectionService, DetectorSet, ScanOptions};
pub use types::{
    Chunk, ChunkFrame, ChunkingError, DetectionError, DetectionResult, DetectorError,
    DetectorSource, PiiType, Span,
};
