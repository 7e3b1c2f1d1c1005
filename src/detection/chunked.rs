//! Chunked execution of detectors over long inputs.
//!
//! When an input exceeds the long-text threshold (or a backend cannot take
//! the full text in one call), the runner splits it with the chunker, fans
//! the chunks out over a bounded worker pool, and reconciles the returned
//! offsets back into the original input's coordinate space. Spans produced
//! twice by adjacent overlapping chunks collapse on their
//! `(start, end, type, text)` key.
//!
//! Submission blocks on pool capacity and results flow through a bounded
//! channel, so a slow consumer slows the producers instead of growing an
//! unbounded queue.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};

use super::chunking::{self, TokenCounter};
use super::types::{Chunk, ChunkingError, DetectionError, Span, SpanKey};
use crate::detectors::Detector;
use crate::policy::PolicySnapshot;

/// Tuning knobs for the chunked runner.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Input length in bytes above which chunking engages.
    pub long_text_threshold: usize,
    /// Token budget per chunk.
    pub chunk_size_tokens: usize,
    /// Token overlap between adjacent chunks.
    pub chunk_overlap_tokens: usize,
    /// Concurrent chunk tasks per detector run.
    pub max_workers: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            long_text_threshold: 10_000,
            chunk_size_tokens: chunking::DEFAULT_CHUNK_TOKENS,
            chunk_overlap_tokens: chunking::DEFAULT_OVERLAP_TOKENS,
            max_workers: default_worker_count(),
        }
    }
}

/// Pool size used when the configuration does not pin one.
pub fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 4)
}

/// Fans chunked detection across a bounded worker pool.
pub struct ChunkedRunner {
    settings: RunnerSettings,
}

impl ChunkedRunner {
    /// Build a runner with the given settings.
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    /// The runner's tuning knobs.
    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Whether `text` is long enough to engage chunked processing.
    pub fn should_chunk(&self, text: &str) -> bool {
        text.len() > self.settings.long_text_threshold
    }

    /// Split `text` with the configured budget and the supplied counter.
    pub fn chunk_input(
        &self,
        text: &str,
        token_counter: Option<&TokenCounter>,
    ) -> Result<Vec<Chunk>, ChunkingError> {
        chunking::chunk_text(
            text,
            self.settings.chunk_size_tokens,
            self.settings.chunk_overlap_tokens,
            token_counter,
        )
    }

    /// Number of chunks a scan of `text` will use, without materializing them.
    pub fn chunk_count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        if !self.should_chunk(text) {
            return 1;
        }
        let window = self.settings.chunk_size_tokens * 3;
        let step = window.saturating_sub(self.settings.chunk_overlap_tokens * 3).max(1);
        if text.len() <= window {
            1
        } else {
            1 + (text.len() - window).div_ceil(step)
        }
    }

    /// Run one detector over the whole input, chunking when needed.
    ///
    /// Per-chunk backend failures degrade to an empty contribution for that
    /// chunk with a WARN; only the single-call (unchunked) path propagates
    /// backend errors to the caller.
    pub async fn run(
        &self,
        detector: Arc<dyn Detector>,
        text: &str,
        threshold: f32,
        policy: Arc<PolicySnapshot>,
    ) -> Result<Vec<Span>, DetectionError> {
        if !self.should_chunk(text) {
            return Ok(detector.detect(text, threshold, &policy).await?);
        }

        let chunks = self.chunk_input(text, detector.token_counter().as_ref())?;
        match chunks.len() {
            0 => Ok(Vec::new()),
            1 => {
                // Single-chunk fast path: run inline, no pool. Translation is
                // skipped when the chunk starts at the origin.
                let chunk = &chunks[0];
                let spans = detector.detect(&chunk.text, threshold, &policy).await?;
                if chunk.start == 0 {
                    Ok(spans)
                } else {
                    Ok(translate_spans(chunk, text, spans))
                }
            }
            total => {
                tracing::debug!(
                    model_id = detector.model_id(),
                    input_bytes = text.len(),
                    chunks = total,
                    workers = self.settings.max_workers,
                    "Dispatching chunked detection"
                );
                let model_id = detector.model_id().to_string();
                let mut receiver = self.dispatch(chunks, move |index, chunk| {
                    let detector = detector.clone();
                    let policy = policy.clone();
                    async move {
                        match detector.detect(&chunk.text, threshold, &policy).await {
                            Ok(spans) => (chunk, spans),
                            Err(error) => {
                                tracing::warn!(
                                    model_id = detector.model_id(),
                                    chunk_index = index,
                                    error = %error,
                                    "Chunk detection failed; dropping its spans"
                                );
                                (chunk, Vec::new())
                            }
                        }
                    }
                });

                let mut seen: HashSet<SpanKey> = HashSet::new();
                let mut collected = Vec::new();
                while let Some((_, (chunk, spans))) = receiver.recv().await {
                    for span in translate_spans(&chunk, text, spans) {
                        if seen.insert(span.key()) {
                            collected.push(span);
                        }
                    }
                }
                collected.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
                tracing::debug!(
                    model_id = %model_id,
                    spans = collected.len(),
                    "Chunked detection complete"
                );
                Ok(collected)
            }
        }
    }

    /// Submit one task per chunk onto a bounded pool, yielding `(index, T)`
    /// completions in whatever order tasks finish.
    ///
    /// Submission acquires a pool permit before the task is even created,
    /// and tasks hold their permit until their result has been accepted by
    /// the (bounded) result channel, so neither submission nor completion
    /// can queue unboundedly.
    pub(crate) fn dispatch<F, Fut, T>(&self, chunks: Vec<Chunk>, job: F) -> mpsc::Receiver<(usize, T)>
    where
        F: Fn(usize, Chunk) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(self.settings.max_workers.max(1));
        let workers = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));

        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(chunks.len());
            for (index, chunk) in chunks.into_iter().enumerate() {
                let Ok(permit) = workers.clone().acquire_owned().await else {
                    break;
                };
                let sender = sender.clone();
                let future = job(index, chunk);
                handles.push(tokio::spawn(async move {
                    let result = future.await;
                    let _ = sender.send((index, result)).await;
                    drop(permit);
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        });

        receiver
    }
}

/// Rebase chunk-relative spans onto the original input.
///
/// Each span's offsets are shifted by the chunk origin and verified
/// byte-for-byte against the original text. A mismatch (the chunker
/// normalized whitespace, for instance) triggers one relocation attempt by
/// forward search inside the chunk; spans that still do not line up are
/// dropped with a WARN rather than shipped with lying offsets.
pub(crate) fn translate_spans(chunk: &Chunk, original: &str, spans: Vec<Span>) -> Vec<Span> {
    let mut translated = Vec::with_capacity(spans.len());
    for mut span in spans {
        let start = span.start + chunk.start;
        let end = span.end + chunk.start;
        if slice_matches(original, start, end, &span.text) {
            span.start = start;
            span.end = end;
            translated.push(span);
            continue;
        }

        if let Some(relative) = chunk.text.find(span.text.as_str()) {
            let start = chunk.start + relative;
            let end = start + span.text.len();
            if slice_matches(original, start, end, &span.text) {
                span.start = start;
                span.end = end;
                translated.push(span);
                continue;
            }
        }

        tracing::warn!(
            chunk_start = chunk.start,
            span_start = span.start,
            span_end = span.end,
            pii_type = span.pii_type.name(),
            "Dropping span with unreconcilable offsets"
        );
    }
    translated
}

fn slice_matches(text: &str, start: usize, end: usize, expected: &str) -> bool {
    start < end
        && end <= text.len()
        && text.is_char_boundary(start)
        && text.is_char_boundary(end)
        && &text[start..end] == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{DetectorSource, PiiType};
    use crate::detectors::regex::RegexDetector;
    use crate::policy::PolicySnapshot;

    fn runner(long_text_threshold: usize, chunk_size: usize, overlap: usize) -> ChunkedRunner {
        ChunkedRunner::new(RunnerSettings {
            long_text_threshold,
            chunk_size_tokens: chunk_size,
            chunk_overlap_tokens: overlap,
            max_workers: 4,
        })
    }

    fn regex_detector() -> Arc<dyn Detector> {
        Arc::new(RegexDetector::new("regex-detector").expect("patterns compile"))
    }

    #[tokio::test]
    async fn finds_span_deep_inside_long_input_with_original_offsets() {
        // 30_000 bytes of filler, then a known email, then more filler.
        let mut text = "word ".repeat(6_000);
        assert_eq!(text.len(), 30_000);
        text.push_str("user@example.com");
        text.push(' ');
        text.push_str(&"word ".repeat(1_900));

        let runner = runner(10_000, 378, 50);
        assert!(runner.chunk_count(&text) >= 4);

        let spans = runner
            .run(regex_detector(), &text, 0.5, Arc::new(PolicySnapshot::permissive()))
            .await
            .expect("chunked run succeeds");

        let emails: Vec<&Span> = spans.iter().filter(|s| s.pii_type == PiiType::Email).collect();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].start, 30_000);
        assert_eq!(emails[0].text, "user@example.com");
        assert_eq!(&text[emails[0].start..emails[0].end], "user@example.com");
    }

    #[tokio::test]
    async fn overlap_region_produces_no_duplicate_spans() {
        // 20-token chunks (60 bytes), 10-token overlap (30-byte step): the
        // email at byte 35 sits fully inside two adjacent windows.
        let mut text = String::new();
        text.push_str(&"x ".repeat(17));
        text.push('y');
        text.push(' ');
        text.push_str("user@example.com");
        text.push(' ');
        text.push_str(&"x ".repeat(20));

        let runner = runner(50, 20, 10);
        let chunks = runner.chunk_input(&text, None).expect("chunks");
        let containing = chunks
            .iter()
            .filter(|chunk| chunk.start <= 36 && chunk.end >= 52)
            .count();
        assert!(containing >= 2, "email should sit in an overlap region");

        let spans = runner
            .run(regex_detector(), &text, 0.5, Arc::new(PolicySnapshot::permissive()))
            .await
            .expect("chunked run succeeds");
        let emails: Vec<&Span> = spans.iter().filter(|s| s.pii_type == PiiType::Email).collect();
        assert_eq!(emails.len(), 1);
        assert_eq!(&text[emails[0].start..emails[0].end], "user@example.com");
    }

    #[tokio::test]
    async fn short_input_skips_chunking() {
        let runner = runner(10_000, 378, 50);
        let text = "Contact john.doe@example.com";
        let spans = runner
            .run(regex_detector(), text, 0.5, Arc::new(PolicySnapshot::permissive()))
            .await
            .expect("direct run succeeds");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 8);
        assert_eq!(runner.chunk_count(text), 1);
    }

    #[tokio::test]
    async fn input_at_threshold_takes_the_fast_path() {
        let text = "a".repeat(10_000);
        let runner = runner(10_000, 378, 50);
        assert!(!runner.should_chunk(&text));
        assert!(runner.should_chunk(&(text.clone() + "b")));
    }

    #[test]
    fn chunk_count_matches_materialized_chunks() {
        let runner = runner(100, 40, 10);
        let text = "z".repeat(1_000);
        let chunks = runner.chunk_input(&text, None).expect("chunks");
        assert_eq!(runner.chunk_count(&text), chunks.len());
    }

    #[test]
    fn translation_shifts_offsets_by_chunk_origin() {
        let original = "0123456789abc email x";
        let chunk = Chunk {
            text: "abc email x".to_string(),
            start: 10,
            end: 21,
            token_count: None,
        };
        let span = Span::new("email", PiiType::Email, "email", 4, 9, 0.9, DetectorSource::Ml);
        let translated = translate_spans(&chunk, original, vec![span]);
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0].start, 14);
        assert_eq!(translated[0].end, 19);
        assert_eq!(&original[14..19], "email");
    }

    #[test]
    fn translation_relocates_misaligned_spans_by_forward_search() {
        let original = "0123456789abc email x";
        let chunk = Chunk {
            text: "abc email x".to_string(),
            start: 10,
            end: 21,
            token_count: None,
        };
        // Off-by-one offsets, as produced by a normalizing tokenizer.
        let span = Span::new("email", PiiType::Email, "email", 3, 8, 0.9, DetectorSource::Ml);
        let translated = translate_spans(&chunk, original, vec![span]);
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0].start, 14);
    }

    #[test]
    fn translation_drops_unreconcilable_spans() {
        let original = "0123456789abc email x";
        let chunk = Chunk {
            text: "abc email x".to_string(),
            start: 10,
            end: 21,
            token_count: None,
        };
        let span = Span::new("zzz", PiiType::Email, "email", 0, 3, 0.9, DetectorSource::Ml);
        assert!(translate_spans(&chunk, original, vec![span]).is_empty());
    }

    #[tokio::test]
    async fn dispatch_delivers_every_chunk_exactly_once() {
        let runner = runner(10, 4, 0);
        let chunks: Vec<Chunk> = (0..20)
            .map(|i| Chunk {
                text: format!("chunk-{i}"),
                start: i * 10,
                end: i * 10 + 7,
                token_count: None,
            })
            .collect();
        let mut receiver = runner.dispatch(chunks, |index, chunk| async move {
            (index, chunk.start)
        });
        let mut seen = Vec::new();
        while let Some((index, (echoed, start))) = receiver.recv().await {
            assert_eq!(index, echoed);
            assert_eq!(start, index * 10);
            seen.push(index);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }
}
