//! Detector port and the backends that implement it.
//!
//! Every backend — statistical NER, regex tables, keyword rules — obeys the
//! same two-operation contract so the orchestrator can treat them uniformly:
//! an idempotent `load` that prepares whatever the backend needs, and a
//! `detect` that scans one text and returns spans with offsets relative to
//! that text. Backends are leaves; there is no hierarchy between them.
//!
//! Benign failures (nothing matched, degraded resources) surface as an empty
//! span list so a scan never fails because one backend misbehaved. Hard
//! failures return [`DetectorError`] and abort the surrounding request.

/// Detector construction registry keyed by backend name.
pub mod factory;
/// Statistical NER backend.
pub mod ner;
/// Regex pattern backend.
pub mod regex;
/// Keyword/context rule backend.
pub mod rules;

use crate::detection::chunking::TokenCounter;
use crate::detection::types::{DetectorError, DetectorSource, Span};
use crate::policy::PolicySnapshot;
use async_trait::async_trait;

/// Capability contract implemented by every detection backend.
///
/// Implementations are shared process-wide behind `Arc` and must tolerate
/// concurrent `detect` calls on disjoint inputs; any shared state is treated
/// as read-only after `load` completes.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Stable identifier of the backing model or engine.
    fn model_id(&self) -> &str;

    /// Which provenance tag this backend stamps on its spans.
    fn source(&self) -> DetectorSource;

    /// Token counter matching the backend's tokenizer, when it has one.
    ///
    /// Used by the chunker to cut token-aware windows; `None` selects the
    /// character-approximation strategy.
    fn token_counter(&self) -> Option<TokenCounter> {
        None
    }

    /// Prepare the backend for detection. Idempotent; may block.
    async fn load(&self) -> Result<(), DetectorError>;

    /// Scan `text` and return spans with offsets relative to `text`.
    ///
    /// `threshold` is the request-level confidence floor; per-type policy
    /// thresholds are applied later by the orchestrator.
    async fn detect(
        &self,
        text: &str,
        threshold: f32,
        policy: &PolicySnapshot,
    ) -> Result<Vec<Span>, DetectorError>;
}

/// Strip surrounding whitespace from a detected span, adjusting offsets.
///
/// Model outputs occasionally include the separators around a match; the wire
/// contract requires `text == input[start..end]` with no padding.
pub(crate) fn trim_span_whitespace(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let trimmed_front = slice.len() - slice.trim_start().len();
    let trimmed_back = slice.len() - slice.trim_end().len();
    let new_start = start + trimmed_front;
    let new_end = end - trimmed_back;
    if new_start >= new_end {
        (start, start)
    } else {
        (new_start, new_end)
    }
}
