//! Composite detection orchestrator.
//!
//! `DetectionService` owns the process-global detector instances, the policy
//! store adapter, and the chunked runner, and drives one scan end to end:
//! fetch the policy snapshot, fan the enabled detectors out concurrently,
//! filter their raw spans against detector-scoped policy, resolve
//! multi-label conflicts, merge across detectors, and render the masked
//! output.
//!
//! Every known detector is instantiated at startup regardless of the on-disk
//! defaults; the defaults only seed the snapshot's enabled flags. That is
//! what lets an operator enable a backend in the store and have the very
//! next request use it, without a restart.

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use super::chunked::{ChunkedRunner, RunnerSettings, translate_spans};
use super::conflict::ConflictResolver;
use super::mask::mask_spans;
use super::merger::DetectionMerger;
use super::types::{
    ChunkFrame, DetectionError, DetectionResult, Span, SpanKey, summarize,
};
use crate::detectors::Detector;
use crate::metrics::{ScanMetrics, ScanMetricsSnapshot};
use crate::policy::PolicySnapshot;
use crate::policy::store::PolicyStoreAdapter;

/// Per-request detector overrides carried on the wire.
///
/// Effective enablement is the AND of these flags with the snapshot's global
/// toggles, so a request can narrow the policy but never widen it.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Run the ML backend.
    pub enable_ml: bool,
    /// Run the regex backend.
    pub enable_regex: bool,
    /// Run the rule backend.
    pub enable_rule: bool,
    /// Consult the policy store for this scan (otherwise the on-disk
    /// baseline governs).
    pub fetch_policy_from_store: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            enable_ml: true,
            enable_regex: true,
            enable_rule: true,
            fetch_policy_from_store: true,
        }
    }
}

/// The process-global detector instances, one slot per backend.
///
/// Slots are null-safe: a deployment may genuinely lack a backend, and the
/// orchestrator simply skips absent ones.
#[derive(Default, Clone)]
pub struct DetectorSet {
    /// Statistical NER backend.
    pub ml: Option<Arc<dyn Detector>>,
    /// Regex pattern backend.
    pub regex: Option<Arc<dyn Detector>>,
    /// Keyword/context rule backend.
    pub rule: Option<Arc<dyn Detector>>,
}

impl DetectorSet {
    fn all(&self) -> Vec<Arc<dyn Detector>> {
        [&self.ml, &self.regex, &self.rule]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Abstraction over the scan pipeline used by external surfaces.
#[async_trait]
pub trait DetectionApi: Send + Sync {
    /// Run a full scan and return the consolidated result.
    async fn detect(
        &self,
        content: String,
        threshold: Option<f32>,
        options: ScanOptions,
    ) -> Result<DetectionResult, DetectionError>;

    /// Run a chunked scan, streaming one frame per completed chunk in
    /// ascending chunk order, then a terminal summary frame.
    async fn detect_streaming(
        &self,
        content: String,
        threshold: Option<f32>,
        options: ScanOptions,
        deadline: Option<Instant>,
    ) -> Result<BoxStream<'static, ChunkFrame>, DetectionError>;

    /// Current scan counters.
    fn metrics_snapshot(&self) -> ScanMetricsSnapshot;

    /// Largest request body the surface should accept.
    fn max_content_bytes(&self) -> usize;
}

/// Coordinates detectors, policy, merging, and masking for every scan.
pub struct DetectionService {
    detectors: DetectorSet,
    policy_store: Arc<PolicyStoreAdapter>,
    runner: ChunkedRunner,
    resolver: Arc<ConflictResolver>,
    metrics: Arc<ScanMetrics>,
    max_content_bytes: usize,
}

impl DetectionService {
    /// Build a service around instantiated detectors and a policy adapter.
    pub fn new(
        detectors: DetectorSet,
        policy_store: PolicyStoreAdapter,
        runner_settings: RunnerSettings,
        max_content_bytes: usize,
    ) -> Self {
        Self {
            detectors,
            policy_store: Arc::new(policy_store),
            runner: ChunkedRunner::new(runner_settings),
            resolver: Arc::new(ConflictResolver::new()),
            metrics: Arc::new(ScanMetrics::new()),
            max_content_bytes,
        }
    }

    /// Load every instantiated detector. Called once during bootstrap; a
    /// failure here is fatal for the process.
    pub async fn load_detectors(&self) -> Result<(), DetectionError> {
        for detector in self.detectors.all() {
            detector.load().await?;
            tracing::info!(model_id = detector.model_id(), "Detector loaded");
        }
        Ok(())
    }

    async fn snapshot_for(&self, options: &ScanOptions) -> Arc<PolicySnapshot> {
        if options.fetch_policy_from_store {
            Arc::new(self.policy_store.fetch_snapshot().await)
        } else {
            Arc::new(self.policy_store.baseline().clone())
        }
    }

    fn enabled_detectors(
        &self,
        snapshot: &PolicySnapshot,
        options: &ScanOptions,
    ) -> Vec<Arc<dyn Detector>> {
        let mut enabled = Vec::new();
        if snapshot.ml_enabled
            && options.enable_ml
            && let Some(detector) = &self.detectors.ml
        {
            enabled.push(detector.clone());
        }
        if snapshot.regex_enabled
            && options.enable_regex
            && let Some(detector) = &self.detectors.regex
        {
            enabled.push(detector.clone());
        }
        if snapshot.rule_enabled
            && options.enable_rule
            && let Some(detector) = &self.detectors.rule
        {
            enabled.push(detector.clone());
        }
        enabled
    }

    /// Policy filter + conflict resolution for one detector's contribution.
    fn refine(&self, snapshot: &PolicySnapshot, spans: Vec<Span>) -> Vec<Span> {
        let filtered: Vec<Span> = spans
            .into_iter()
            .filter(|span| snapshot.keeps(span))
            .collect();
        self.resolver.resolve_conflicts(filtered)
    }

    /// Run a full scan and return the consolidated result.
    pub async fn scan(
        &self,
        content: &str,
        threshold: Option<f32>,
        options: ScanOptions,
    ) -> Result<DetectionResult, DetectionError> {
        let request_id = Uuid::new_v4();
        let snapshot = self.snapshot_for(&options).await;
        let threshold = threshold
            .unwrap_or(snapshot.default_threshold)
            .clamp(0.0, 1.0);

        let detectors = self.enabled_detectors(&snapshot, &options);
        tracing::info!(
            %request_id,
            content_bytes = content.len(),
            threshold,
            detectors = detectors.len(),
            "Scan started"
        );
        if detectors.is_empty() {
            tracing::warn!(%request_id, "No detectors available");
            return Ok(DetectionResult {
                spans: Vec::new(),
                summary: BTreeMap::new(),
                masked_content: content.to_string(),
                chunk_count: 0,
            });
        }

        let runs = detectors.iter().map(|detector| {
            let detector = detector.clone();
            let snapshot = snapshot.clone();
            async move {
                let model_id = detector.model_id().to_string();
                let outcome = self.runner.run(detector, content, threshold, snapshot).await;
                (model_id, outcome)
            }
        });

        let mut contributions: Vec<(String, Vec<Span>)> = Vec::new();
        let mut failures = 0usize;
        for (model_id, outcome) in join_all(runs).await {
            match outcome {
                Ok(spans) => {
                    tracing::debug!(%request_id, model_id = %model_id, spans = spans.len(), "Detector finished");
                    contributions.push((model_id, spans));
                }
                Err(error) => {
                    failures += 1;
                    tracing::warn!(
                        %request_id,
                        model_id = %model_id,
                        error = %error,
                        "Detector failed; dropping its contribution"
                    );
                }
            }
        }
        if contributions.is_empty() && failures > 0 {
            tracing::warn!(%request_id, failures, "All detectors failed; returning empty result");
        }

        let refined: Vec<(String, Vec<Span>)> = contributions
            .into_iter()
            .map(|(model_id, spans)| {
                let refined = self.refine(&snapshot, spans);
                (model_id, refined)
            })
            .collect();

        let merger = DetectionMerger::new(snapshot.log_provenance);
        let spans = merger.merge(refined);
        let masked_content = mask_spans(content, &spans);
        let summary = summarize(&spans);
        let chunk_count = self.runner.chunk_count(content);

        self.metrics.record_scan(spans.len() as u64, chunk_count as u64);
        tracing::info!(
            %request_id,
            spans = spans.len(),
            chunk_count,
            "Scan completed"
        );

        Ok(DetectionResult {
            spans,
            summary,
            masked_content,
            chunk_count,
        })
    }

    /// Run a chunked scan, emitting one frame per completed chunk.
    ///
    /// Frames are released strictly in ascending chunk order; completions
    /// arriving early are held back until their turn. Spans duplicated by
    /// chunk overlap are attributed to the earliest chunk that produced
    /// them. A terminal frame repeats the chunk total and carries the
    /// aggregate summary. When the deadline expires mid-stream the remaining
    /// chunk results are abandoned.
    pub async fn scan_streaming(
        &self,
        content: String,
        threshold: Option<f32>,
        options: ScanOptions,
        deadline: Option<Instant>,
    ) -> Result<impl futures_core::Stream<Item = ChunkFrame> + Send + 'static, DetectionError>
    {
        let request_id = Uuid::new_v4();
        let snapshot = self.snapshot_for(&options).await;
        let threshold = threshold
            .unwrap_or(snapshot.default_threshold)
            .clamp(0.0, 1.0);
        let detectors = self.enabled_detectors(&snapshot, &options);

        let token_counter = detectors.iter().find_map(|detector| detector.token_counter());
        let chunks = self.runner.chunk_input(&content, token_counter.as_ref())?;
        let total = chunks.len();
        tracing::info!(
            %request_id,
            content_bytes = content.len(),
            chunks = total,
            detectors = detectors.len(),
            "Streaming scan started"
        );

        let original: Arc<str> = Arc::from(content);
        let resolver = self.resolver.clone();
        let policy = snapshot.clone();
        let log_provenance = snapshot.log_provenance;
        let job_detectors = detectors.clone();
        let job_original = original.clone();
        let receiver = self.runner.dispatch(chunks, move |index, chunk| {
            let detectors = job_detectors.clone();
            let policy = policy.clone();
            let resolver = resolver.clone();
            let original = job_original.clone();
            async move {
                let runs = detectors.iter().map(|detector| {
                    let detector = detector.clone();
                    let policy = policy.clone();
                    let text = chunk.text.clone();
                    async move {
                        let model_id = detector.model_id().to_string();
                        match detector.detect(&text, threshold, &policy).await {
                            Ok(spans) => (model_id, spans),
                            Err(error) => {
                                tracing::warn!(
                                    model_id = %model_id,
                                    chunk_index = index,
                                    error = %error,
                                    "Chunk detection failed; dropping its spans"
                                );
                                (model_id, Vec::new())
                            }
                        }
                    }
                });
                let contributions: Vec<(String, Vec<Span>)> = join_all(runs)
                    .await
                    .into_iter()
                    .map(|(model_id, spans)| {
                        let filtered: Vec<Span> =
                            spans.into_iter().filter(|span| policy.keeps(span)).collect();
                        (model_id, resolver.resolve_conflicts(filtered))
                    })
                    .collect();
                let merged = DetectionMerger::new(log_provenance).merge(contributions);
                translate_spans(&chunk, &original, merged)
            }
        });

        let metrics = self.metrics.clone();
        let stream = async_stream::stream! {
            let mut receiver = receiver;
            let mut pending: BTreeMap<usize, Vec<Span>> = BTreeMap::new();
            let mut seen: HashSet<SpanKey> = HashSet::new();
            let mut all_spans: Vec<Span> = Vec::new();
            let mut next = 0usize;

            'collect: while next < total {
                let message = match deadline {
                    Some(deadline) => tokio::select! {
                        biased;
                        _ = tokio::time::sleep_until(deadline) => {
                            tracing::warn!(
                                %request_id,
                                emitted = next,
                                total,
                                "Deadline expired mid-stream; abandoning remaining chunks"
                            );
                            break 'collect;
                        }
                        message = receiver.recv() => message,
                    },
                    None => receiver.recv().await,
                };
                let Some((index, spans)) = message else {
                    break;
                };
                pending.insert(index, spans);
                while let Some(spans) = pending.remove(&next) {
                    let fresh: Vec<Span> = spans
                        .into_iter()
                        .filter(|span| seen.insert(span.key()))
                        .collect();
                    all_spans.extend(fresh.iter().cloned());
                    yield ChunkFrame {
                        chunk_index: next,
                        total_chunks: total,
                        spans: fresh,
                        summary: None,
                    };
                    next += 1;
                }
            }

            metrics.record_scan(all_spans.len() as u64, total as u64);
            tracing::info!(
                %request_id,
                spans = all_spans.len(),
                chunks = total,
                "Streaming scan completed"
            );
            yield ChunkFrame {
                chunk_index: total,
                total_chunks: total,
                spans: Vec::new(),
                summary: Some(summarize(&all_spans)),
            };
        };

        Ok(stream)
    }
}

#[async_trait]
impl DetectionApi for DetectionService {
    async fn detect(
        &self,
        content: String,
        threshold: Option<f32>,
        options: ScanOptions,
    ) -> Result<DetectionResult, DetectionError> {
        self.scan(&content, threshold, options).await
    }

    async fn detect_streaming(
        &self,
        content: String,
        threshold: Option<f32>,
        options: ScanOptions,
        deadline: Option<Instant>,
    ) -> Result<BoxStream<'static, ChunkFrame>, DetectionError> {
        Ok(self
            .scan_streaming(content, threshold, options, deadline)
            .await?
            .boxed())
    }

    fn metrics_snapshot(&self) -> ScanMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn max_content_bytes(&self) -> usize {
        self.max_content_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::{DetectorError, DetectorSource, PiiType};
    use crate::detectors::factory::{DetectorSettings, default_registry};
    use crate::policy::{DetectorScope, TypeRule};

    fn full_detector_set() -> DetectorSet {
        let registry = default_registry().expect("registry");
        DetectorSet {
            ml: Some(
                registry
                    .create("gliner-pii", &DetectorSettings::for_model("gliner-pii"))
                    .expect("ml detector"),
            ),
            regex: Some(
                registry
                    .create("regex-detector", &DetectorSettings::for_model("regex-detector"))
                    .expect("regex detector"),
            ),
            rule: Some(
                registry
                    .create("rule-engine", &DetectorSettings::for_model("rule-engine"))
                    .expect("rule detector"),
            ),
        }
    }

    fn service_with(baseline: PolicySnapshot, detectors: DetectorSet) -> DetectionService {
        let adapter = PolicyStoreAdapter::new("http://127.0.0.1:1", "pii", "postgres", None, baseline)
            .expect("adapter");
        DetectionService::new(detectors, adapter, RunnerSettings::default(), 1_048_576)
    }

    fn offline() -> ScanOptions {
        ScanOptions {
            fetch_policy_from_store: false,
            ..ScanOptions::default()
        }
    }

    #[tokio::test]
    async fn finds_email_and_masks_it() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let result = service
            .scan("Contact john.doe@example.com", Some(0.5), offline())
            .await
            .expect("scan succeeds");

        assert_eq!(result.spans.len(), 1);
        let span = &result.spans[0];
        assert_eq!(span.pii_type, PiiType::Email);
        assert_eq!(span.start, 8);
        assert_eq!(span.end, 28);
        assert_eq!(span.text, "john.doe@example.com");
        assert_eq!(result.masked_content, "Contact [EMAIL]");
        assert_eq!(result.summary.get("EMAIL"), Some(&1));
    }

    #[tokio::test]
    async fn scoped_disable_keeps_other_detectors_findings() {
        let mut baseline = PolicySnapshot::permissive();
        baseline.types.insert(
            PiiType::Email,
            TypeRule::for_type(PiiType::Email, false, 0.3, DetectorScope::Regex),
        );
        let service = service_with(baseline, full_detector_set());
        let result = service
            .scan("Contact john.doe@example.com", Some(0.5), offline())
            .await
            .expect("scan succeeds");

        // The regex backend's EMAIL is suppressed; the ML backend's survives.
        assert_eq!(result.spans.len(), 1);
        assert_eq!(result.spans[0].pii_type, PiiType::Email);
        assert_eq!(result.spans[0].source, DetectorSource::Ml);
    }

    #[tokio::test]
    async fn global_disable_suppresses_every_source() {
        let mut baseline = PolicySnapshot::permissive();
        baseline.types.insert(
            PiiType::Email,
            TypeRule::for_type(PiiType::Email, false, 0.3, DetectorScope::All),
        );
        let service = service_with(baseline, full_detector_set());
        let result = service
            .scan("Contact john.doe@example.com", Some(0.5), offline())
            .await
            .expect("scan succeeds");
        assert!(result.spans.is_empty());
        assert_eq!(result.masked_content, "Contact john.doe@example.com");
    }

    #[tokio::test]
    async fn request_overrides_narrow_the_policy() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let options = ScanOptions {
            enable_ml: false,
            enable_regex: false,
            enable_rule: false,
            fetch_policy_from_store: false,
        };
        let result = service
            .scan("Contact john.doe@example.com", Some(0.5), options)
            .await
            .expect("scan succeeds");
        assert!(result.spans.is_empty());
    }

    #[tokio::test]
    async fn snapshot_toggle_gates_an_instantiated_detector() {
        let mut baseline = PolicySnapshot::permissive();
        baseline.regex_enabled = false;
        baseline.ml_enabled = false;
        baseline.rule_enabled = false;
        let service = service_with(baseline, full_detector_set());
        let result = service
            .scan("Contact john.doe@example.com", Some(0.5), offline())
            .await
            .expect("scan succeeds");
        // Detectors exist but the snapshot disables them all.
        assert!(result.spans.is_empty());
    }

    #[tokio::test]
    async fn empty_detector_set_yields_empty_result() {
        let service = service_with(PolicySnapshot::permissive(), DetectorSet::default());
        let result = service
            .scan("Contact john.doe@example.com", Some(0.5), offline())
            .await
            .expect("scan succeeds");
        assert!(result.spans.is_empty());
        assert_eq!(result.masked_content, "Contact john.doe@example.com");
    }

    #[tokio::test]
    async fn swiss_ssn_and_card_are_reported_at_their_offsets() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let text = "756.1234.5678.97 and 4532015112830366";
        let result = service
            .scan(text, Some(0.5), offline())
            .await
            .expect("scan succeeds");

        let ssn = result
            .spans
            .iter()
            .find(|s| s.pii_type == PiiType::SocialNum)
            .expect("social security span");
        assert_eq!(ssn.start, 0);
        let card = result
            .spans
            .iter()
            .find(|s| s.pii_type == PiiType::CreditCard)
            .expect("credit card span");
        assert_eq!(card.start, 21);
    }

    #[tokio::test]
    async fn invalid_luhn_yields_no_card_span() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let result = service
            .scan("4532015112830367", Some(0.5), offline())
            .await
            .expect("scan succeeds");
        assert!(result.spans.iter().all(|s| s.pii_type != PiiType::CreditCard));
    }

    #[tokio::test]
    async fn ambiguous_numeric_run_collapses_to_one_type() {
        let set = DetectorSet {
            ml: full_detector_set().ml,
            regex: None,
            rule: None,
        };
        let service = service_with(PolicySnapshot::permissive(), set);
        let result = service
            .scan("reference 0791234567 noted", Some(0.5), offline())
            .await
            .expect("scan succeeds");
        assert_eq!(result.spans.len(), 1);
        assert_eq!(result.spans[0].pii_type, PiiType::Telephone);
    }

    #[tokio::test]
    async fn scans_are_deterministic() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let text = "Contact marie.dupont@example.com, Marie Dupont, Geneva, 756.1234.5678.97";
        let first = service.scan(text, Some(0.5), offline()).await.expect("scan");
        let second = service.scan(text, Some(0.5), offline()).await.expect("scan");
        assert_eq!(first.spans, second.spans);
        assert_eq!(first.masked_content, second.masked_content);
    }

    #[tokio::test]
    async fn result_invariants_hold() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let text = "Contact marie.dupont@example.com or call 079 123 45 67, Marie Dupont, Geneva";
        let result = service.scan(text, Some(0.5), offline()).await.expect("scan");

        let mut keys = HashSet::new();
        for span in &result.spans {
            assert_eq!(&text[span.start..span.end], span.text);
            assert!(span.score >= 0.0 && span.score <= 1.0);
            assert!(keys.insert(span.key()), "duplicate span key");
        }
        for pair in result.spans.windows(2) {
            assert!(
                (pair[0].start, pair[0].end) <= (pair[1].start, pair[1].end),
                "spans must be sorted"
            );
        }
    }

    #[tokio::test]
    async fn masking_is_idempotent() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let text = "Contact john.doe@example.com and 756.1234.5678.97";
        let first = service.scan(text, Some(0.5), offline()).await.expect("scan");
        let second = service
            .scan(&first.masked_content, Some(0.5), offline())
            .await
            .expect("scan");
        assert_eq!(second.masked_content, first.masked_content);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_result() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let result = service.scan("", Some(0.5), offline()).await.expect("scan");
        assert!(result.spans.is_empty());
        assert!(result.masked_content.is_empty());
        assert!(result.summary.is_empty());
    }

    #[tokio::test]
    async fn failing_detector_degrades_to_other_contributions() {
        struct FailingDetector;

        #[async_trait]
        impl Detector for FailingDetector {
            fn model_id(&self) -> &str {
                "failing-model"
            }
            fn source(&self) -> DetectorSource {
                DetectorSource::Ml
            }
            async fn load(&self) -> Result<(), DetectorError> {
                Ok(())
            }
            async fn detect(
                &self,
                _text: &str,
                _threshold: f32,
                _policy: &PolicySnapshot,
            ) -> Result<Vec<Span>, DetectorError> {
                Err(DetectorError::Backend {
                    model_id: "failing-model".into(),
                    message: "corrupt weights".into(),
                })
            }
        }

        let set = DetectorSet {
            ml: Some(Arc::new(FailingDetector)),
            regex: full_detector_set().regex,
            rule: None,
        };
        let service = service_with(PolicySnapshot::permissive(), set);
        let result = service
            .scan("Contact john.doe@example.com", Some(0.5), offline())
            .await
            .expect("scan still succeeds");
        assert_eq!(result.spans.len(), 1);
        assert_eq!(result.spans[0].source, DetectorSource::Regex);
    }

    #[tokio::test]
    async fn all_detectors_failing_yields_empty_result() {
        struct FailingDetector;

        #[async_trait]
        impl Detector for FailingDetector {
            fn model_id(&self) -> &str {
                "failing-model"
            }
            fn source(&self) -> DetectorSource {
                DetectorSource::Ml
            }
            async fn load(&self) -> Result<(), DetectorError> {
                Ok(())
            }
            async fn detect(
                &self,
                _text: &str,
                _threshold: f32,
                _policy: &PolicySnapshot,
            ) -> Result<Vec<Span>, DetectorError> {
                Err(DetectorError::Backend {
                    model_id: "failing-model".into(),
                    message: "oom".into(),
                })
            }
        }

        let set = DetectorSet {
            ml: Some(Arc::new(FailingDetector)),
            regex: None,
            rule: None,
        };
        let service = service_with(PolicySnapshot::permissive(), set);
        let result = service
            .scan("Contact john.doe@example.com", Some(0.5), offline())
            .await
            .expect("scan degrades to empty");
        assert!(result.spans.is_empty());
    }

    #[tokio::test]
    async fn streamed_frames_reassemble_into_the_unary_result() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let text = "Contact john.doe@example.com".to_string();

        let unary = service
            .scan(&text, Some(0.5), offline())
            .await
            .expect("unary scan");
        let stream = service
            .scan_streaming(text, Some(0.5), offline(), None)
            .await
            .expect("stream starts");
        let frames: Vec<ChunkFrame> = stream.collect().await;

        let last = frames.last().expect("terminal frame");
        assert_eq!(last.chunk_index, last.total_chunks);
        assert!(last.spans.is_empty());
        assert_eq!(last.summary.as_ref(), Some(&unary.summary));

        let streamed: Vec<Span> = frames.iter().flat_map(|f| f.spans.clone()).collect();
        assert_eq!(streamed, unary.spans);
    }

    #[tokio::test]
    async fn expired_deadline_stops_the_stream_early() {
        let service = service_with(PolicySnapshot::permissive(), full_detector_set());
        let text = "word ".repeat(5_000);
        let stream = service
            .scan_streaming(
                text,
                Some(0.5),
                offline(),
                Some(Instant::now() - std::time::Duration::from_millis(1)),
            )
            .await
            .expect("stream starts");
        let frames: Vec<ChunkFrame> = stream.collect().await;
        // Only the terminal frame survives an already-expired deadline.
        assert_eq!(frames.len(), 1);
        assert!(frames[0].spans.is_empty());
    }
}
