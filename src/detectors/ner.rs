//! Statistical NER backend.
//!
//! A deterministic token-shape and gazetteer scorer standing behind the same
//! port a transformer NER would occupy. Confidence comes from shape features
//! plus context cues in the preceding tokens, so scores vary with the
//! surrounding text the way model logits do and never reach 1.0. The model's
//! sentence window tops out near 400 tokens; long inputs are expected to
//! arrive pre-chunked by the runner.
//!
//! Ambiguous numeric runs are deliberately emitted with dual labels
//! (TELEPHONENUM and SOCIALNUM at the same position) and handed downstream to
//! the conflict resolver, mirroring the multi-pass behavior of the real
//! model.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::detection::chunking::{self, TokenCounter};
use crate::detection::types::{DetectorError, DetectorSource, PiiType, Span};
use crate::detectors::{Detector, trim_span_whitespace};
use crate::policy::PolicySnapshot;

const MAX_SCORE: f32 = 0.99;

const GIVEN_NAMES: &[&str] = &[
    "alice", "amelia", "anna", "antoine", "bob", "carlos", "catherine", "charles", "claire",
    "daniel", "david", "elena", "emma", "eric", "fatima", "francois", "george", "hans", "helen",
    "isabelle", "jacques", "james", "jean", "john", "julia", "julie", "laura", "linda", "louis",
    "luc", "lucas", "marc", "marco", "maria", "marie", "michael", "nicolas", "nina", "olivier",
    "paul", "peter", "pierre", "robert", "sara", "sophie", "thomas",
];

const SURNAMES: &[&str] = &[
    "bernard", "dubois", "dupont", "durand", "favre", "fischer", "garcia", "johnson", "keller",
    "lambert", "martin", "meier", "mercier", "moreau", "muller", "petit", "rochat", "rossi",
    "roux", "schmid", "smith", "weber", "williams",
];

const CITIES: &[&str] = &[
    "basel", "berlin", "bern", "geneva", "genève", "lausanne", "london", "lyon", "madrid",
    "marseille", "milan", "montreal", "munich", "neuchatel", "paris", "rome", "sion", "vienna",
    "zurich", "zürich",
];

const EMAIL_CUES: &[&str] = &["contact", "email", "e-mail", "mail", "at", "reach", "write"];
const NAME_CUES: &[&str] = &[
    "mr", "mrs", "ms", "dr", "name", "dear", "monsieur", "madame", "contact", "m", "mme",
];
const CITY_CUES: &[&str] = &["in", "at", "from", "near", "to", "city", "lives"];
const PHONE_CUES: &[&str] = &["call", "phone", "tel", "mobile", "fax", "dial"];
const SSN_CUES: &[&str] = &["ssn", "social", "avs", "insurance"];

struct NerResources {
    given_names: HashSet<&'static str>,
    surnames: HashSet<&'static str>,
    cities: HashSet<&'static str>,
    token_counter: TokenCounter,
}

/// Gazetteer/feature NER detector stamping [`DetectorSource::Ml`] provenance.
pub struct NerDetector {
    model_id: String,
    max_length: usize,
    score_floor: Option<f32>,
    resources: OnceLock<NerResources>,
}

impl NerDetector {
    /// Create a detector for the given model id; resources are prepared by
    /// [`Detector::load`].
    pub fn new(model_id: impl Into<String>, max_length: usize) -> Self {
        Self {
            model_id: model_id.into(),
            max_length,
            score_floor: None,
            resources: OnceLock::new(),
        }
    }

    /// Set the model's own minimum confidence; a request threshold below it
    /// is raised to the floor.
    pub fn with_score_floor(mut self, floor: Option<f32>) -> Self {
        self.score_floor = floor;
        self
    }

    /// Token budget of the underlying model's sentence window.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn resources(&self) -> &NerResources {
        self.resources.get_or_init(|| {
            let token_counter = match chunking::build_token_counter(&self.model_id) {
                Ok(counter) => counter,
                Err(error) => {
                    tracing::warn!(
                        model_id = %self.model_id,
                        error = %error,
                        "Tokenizer unavailable; falling back to whitespace counting"
                    );
                    chunking::whitespace_token_counter()
                }
            };
            NerResources {
                given_names: GIVEN_NAMES.iter().copied().collect(),
                surnames: SURNAMES.iter().copied().collect(),
                cities: CITIES.iter().copied().collect(),
                token_counter,
            }
        })
    }
}

#[async_trait]
impl Detector for NerDetector {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn source(&self) -> DetectorSource {
        DetectorSource::Ml
    }

    fn token_counter(&self) -> Option<TokenCounter> {
        Some(self.resources().token_counter.clone())
    }

    async fn load(&self) -> Result<(), DetectorError> {
        let resources = self.resources();
        tracing::info!(
            model_id = %self.model_id,
            max_length = self.max_length,
            gazetteer_entries =
                resources.given_names.len() + resources.surnames.len() + resources.cities.len(),
            "NER model ready"
        );
        Ok(())
    }

    async fn detect(
        &self,
        text: &str,
        threshold: f32,
        _policy: &PolicySnapshot,
    ) -> Result<Vec<Span>, DetectorError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let threshold = threshold.max(self.score_floor.unwrap_or(0.0));
        let resources = self.resources();
        let tokens = word_tokens(text);

        let mut spans = Vec::new();
        scan_emails(text, &tokens, &mut spans);
        scan_names(text, &tokens, resources, &mut spans);
        scan_numeric_runs(text, &mut spans);

        let mut spans: Vec<Span> = spans
            .into_iter()
            .filter_map(|span| finalize(text, span))
            .filter(|span| span.score >= threshold)
            .collect();
        spans.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
        Ok(spans)
    }
}

/// A whitespace-delimited token with its raw byte range.
#[derive(Debug, Clone, Copy)]
struct WordToken {
    start: usize,
    end: usize,
}

fn word_tokens(text: &str) -> Vec<WordToken> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(token_start) = start.take() {
                tokens.push(WordToken {
                    start: token_start,
                    end: index,
                });
            }
        } else if start.is_none() {
            start = Some(index);
        }
    }
    if let Some(token_start) = start {
        tokens.push(WordToken {
            start: token_start,
            end: text.len(),
        });
    }
    tokens
}

/// Strip wrapping punctuation from a token, returning the tightened range.
fn strip_punctuation(text: &str, token: WordToken) -> (usize, usize) {
    const EDGE: &[char] = &[
        '.', ',', ';', ':', '!', '?', '(', ')', '<', '>', '"', '\'', '[', ']', '{', '}',
    ];
    let slice = &text[token.start..token.end];
    let trimmed = slice.trim_matches(EDGE);
    if trimmed.is_empty() {
        return (token.start, token.start);
    }
    let front = slice.len() - slice.trim_start_matches(EDGE).len();
    (token.start + front, token.start + front + trimmed.len())
}

/// Lowercased view of the token at `index`, punctuation stripped.
fn cue_word(text: &str, tokens: &[WordToken], index: usize) -> Option<String> {
    let token = tokens.get(index)?;
    let (start, end) = strip_punctuation(text, *token);
    if start >= end {
        return None;
    }
    Some(text[start..end].to_lowercase())
}

/// True when one of the two preceding tokens is in the cue set.
fn has_cue(text: &str, tokens: &[WordToken], index: usize, cues: &[&str]) -> bool {
    for back in 1..=2usize {
        let Some(previous) = index.checked_sub(back) else {
            break;
        };
        if let Some(word) = cue_word(text, tokens, previous)
            && cues.contains(&word.as_str())
        {
            return true;
        }
    }
    false
}

fn scan_emails(text: &str, tokens: &[WordToken], spans: &mut Vec<Span>) {
    for (index, token) in tokens.iter().enumerate() {
        let (start, end) = strip_punctuation(text, *token);
        if start >= end {
            continue;
        }
        let candidate = &text[start..end];
        if !email_shape(candidate) {
            continue;
        }
        let mut score = 0.93;
        if has_cue(text, tokens, index, EMAIL_CUES) {
            score += 0.05;
        }
        spans.push(Span::new(
            candidate,
            PiiType::Email,
            "email",
            start,
            end,
            score,
            DetectorSource::Ml,
        ));
    }
}

fn email_shape(token: &str) -> bool {
    let Some(at) = token.find('@') else {
        return false;
    };
    if at == 0 || token[at + 1..].contains('@') {
        return false;
    }
    let local = &token[..at];
    let domain = &token[at + 1..];
    let Some(dot) = domain.rfind('.') else {
        return false;
    };
    if dot == 0 || dot + 1 >= domain.len() {
        return false;
    }
    let tld = &domain[dot + 1..];
    local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

fn scan_names(text: &str, tokens: &[WordToken], resources: &NerResources, spans: &mut Vec<Span>) {
    let mut previous_was_given_name = false;
    for (index, token) in tokens.iter().enumerate() {
        let (start, end) = strip_punctuation(text, *token);
        if start >= end {
            previous_was_given_name = false;
            continue;
        }
        let word = &text[start..end];
        if !capitalized(word) {
            previous_was_given_name = false;
            continue;
        }
        let lowered = word.to_lowercase();

        if resources.given_names.contains(lowered.as_str()) {
            let mut score = 0.82;
            if has_cue(text, tokens, index, NAME_CUES) {
                score += 0.08;
            }
            spans.push(Span::new(
                word,
                PiiType::GivenName,
                "given name",
                start,
                end,
                score,
                DetectorSource::Ml,
            ));
            previous_was_given_name = true;
            continue;
        }

        if previous_was_given_name && !resources.cities.contains(lowered.as_str()) {
            let score = if resources.surnames.contains(lowered.as_str()) {
                0.88
            } else {
                0.8
            };
            spans.push(Span::new(
                word,
                PiiType::Surname,
                "surname",
                start,
                end,
                score,
                DetectorSource::Ml,
            ));
            previous_was_given_name = false;
            continue;
        }
        previous_was_given_name = false;

        if resources.cities.contains(lowered.as_str()) {
            let mut score = 0.75;
            if has_cue(text, tokens, index, CITY_CUES) {
                score += 0.10;
            }
            spans.push(Span::new(
                word,
                PiiType::City,
                "city",
                start,
                end,
                score,
                DetectorSource::Ml,
            ));
        }
    }
}

fn capitalized(word: &str) -> bool {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_uppercase() && chars.all(|c| c.is_alphabetic() || c == '-' || c == '\'')
}

/// Scan for separator-tolerant digit runs and classify them by context.
fn scan_numeric_runs(text: &str, spans: &mut Vec<Span>) {
    for run in digit_runs(text) {
        let run_text = &text[run.start..run.end];
        let context = context_before(text, run.start, 24);
        let ssn_cue = SSN_CUES.iter().any(|cue| context.contains(cue));
        let phone_cue = PHONE_CUES.iter().any(|cue| context.contains(cue));
        let leading_plus = run_text.starts_with('+');

        if ssn_cue {
            spans.push(numeric_span(run_text, PiiType::SocialNum, "social security number", run, 0.85));
        }
        if phone_cue || leading_plus {
            let score = if phone_cue { 0.86 } else { 0.8 };
            spans.push(numeric_span(run_text, PiiType::Telephone, "phone", run, score));
        }
        if !ssn_cue && !phone_cue && !leading_plus && (10..=14).contains(&run.digits) {
            // No discriminating context: emit both labels and let the
            // conflict resolver pick one.
            spans.push(numeric_span(run_text, PiiType::Telephone, "phone", run, 0.62));
            spans.push(numeric_span(
                run_text,
                PiiType::SocialNum,
                "social security number",
                run,
                0.58,
            ));
        }
    }
}

fn numeric_span(text: &str, pii_type: PiiType, label: &str, run: DigitRun, score: f32) -> Span {
    Span::new(text, pii_type, label, run.start, run.end, score, DetectorSource::Ml)
}

#[derive(Debug, Clone, Copy)]
struct DigitRun {
    start: usize,
    end: usize,
    digits: usize,
}

fn digit_runs(text: &str) -> Vec<DigitRun> {
    const SEPARATORS: &str = " .-()/";
    let bytes = text.as_bytes();
    let mut runs = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        let ch = bytes[index] as char;
        let starts_run = ch.is_ascii_digit()
            || (ch == '+' && index + 1 < bytes.len() && (bytes[index + 1] as char).is_ascii_digit());
        if !starts_run {
            index += 1;
            continue;
        }
        let start = index;
        let mut end = index;
        let mut digits = 0;
        let mut cursor = index;
        while cursor < bytes.len() {
            let current = bytes[cursor] as char;
            if current.is_ascii_digit() {
                digits += 1;
                cursor += 1;
                end = cursor;
            } else if (current == '+' && cursor == start) || SEPARATORS.contains(current) {
                cursor += 1;
            } else {
                break;
            }
        }
        if digits >= 7 {
            runs.push(DigitRun { start, end, digits });
        }
        index = cursor.max(index + 1);
    }
    runs
}

/// Lowercased context window ending at `position`.
fn context_before(text: &str, position: usize, width: usize) -> String {
    let mut start = position.saturating_sub(width);
    while start < position && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..position].to_lowercase()
}

/// Trim whitespace, clamp the score, and drop degenerate spans.
fn finalize(text: &str, mut span: Span) -> Option<Span> {
    let (start, end) = trim_span_whitespace(text, span.start, span.end);
    if start >= end {
        return None;
    }
    span.start = start;
    span.end = end;
    span.text = text[start..end].to_string();
    span.score = span.score.min(MAX_SCORE);
    Some(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySnapshot;

    fn detector() -> NerDetector {
        NerDetector::new("gliner-pii", 378)
    }

    async fn detect(text: &str, threshold: f32) -> Vec<Span> {
        detector()
            .detect(text, threshold, &PolicySnapshot::permissive())
            .await
            .expect("ner detection succeeds")
    }

    #[tokio::test]
    async fn detects_email_with_exact_offsets() {
        let text = "Contact john.doe@example.com";
        let spans = detect(text, 0.5).await;
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.pii_type, PiiType::Email);
        assert_eq!(span.start, 8);
        assert_eq!(span.end, 28);
        assert_eq!(span.text, "john.doe@example.com");
        assert_eq!(span.source, DetectorSource::Ml);
        // "Contact" is an email cue, so the score gets a context boost.
        assert!(span.score > 0.93);
    }

    #[tokio::test]
    async fn email_without_cue_scores_lower() {
        let cued = detect("Contact john.doe@example.com", 0.5).await;
        let bare = detect("xyzzy john.doe@example.com", 0.5).await;
        assert!(cued[0].score > bare[0].score);
    }

    #[tokio::test]
    async fn detects_given_name_and_surname() {
        let text = "My name is Marie Dupont";
        let spans = detect(text, 0.5).await;
        let given: Vec<&Span> = spans
            .iter()
            .filter(|s| s.pii_type == PiiType::GivenName)
            .collect();
        let surname: Vec<&Span> = spans
            .iter()
            .filter(|s| s.pii_type == PiiType::Surname)
            .collect();
        assert_eq!(given.len(), 1);
        assert_eq!(given[0].text, "Marie");
        assert_eq!(&text[given[0].start..given[0].end], "Marie");
        assert_eq!(surname.len(), 1);
        assert_eq!(surname[0].text, "Dupont");
    }

    #[tokio::test]
    async fn detects_city_with_context_cue() {
        let spans = detect("She lives in Geneva", 0.5).await;
        let cities: Vec<&Span> = spans.iter().filter(|s| s.pii_type == PiiType::City).collect();
        assert_eq!(cities.len(), 1);
        assert_eq!(cities[0].text, "Geneva");
        assert!(cities[0].score > 0.8);
    }

    #[tokio::test]
    async fn phone_cue_yields_single_phone_label() {
        let text = "Call +41 79 123 45 67";
        let spans = detect(text, 0.5).await;
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].pii_type, PiiType::Telephone);
        assert_eq!(spans[0].text, "+41 79 123 45 67");
    }

    #[tokio::test]
    async fn ambiguous_numeric_run_emits_dual_labels() {
        let spans = detect("reference 0791234567 noted", 0.5).await;
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start, spans[1].start);
        assert_eq!(spans[0].end, spans[1].end);
        let types: Vec<PiiType> = spans.iter().map(|s| s.pii_type).collect();
        assert!(types.contains(&PiiType::Telephone));
        assert!(types.contains(&PiiType::SocialNum));
    }

    #[tokio::test]
    async fn threshold_filters_all_labels() {
        let spans = detect("Contact john.doe@example.com", 0.995).await;
        assert!(spans.is_empty());
    }

    #[tokio::test]
    async fn model_score_floor_raises_a_permissive_request_threshold() {
        let detector = NerDetector::new("gliner-pii", 378).with_score_floor(Some(0.95));
        let spans = detector
            .detect("My name is Marie Dupont", 0.1, &PolicySnapshot::permissive())
            .await
            .expect("ner detection succeeds");
        assert!(spans.is_empty());
    }

    #[tokio::test]
    async fn scores_stay_in_range() {
        let spans = detect(
            "Contact marie.dupont@example.com or call 079 123 45 67, Marie Dupont, Geneva",
            0.1,
        )
        .await;
        assert!(!spans.is_empty());
        for span in &spans {
            assert!(span.score > 0.0 && span.score <= MAX_SCORE);
        }
    }

    #[tokio::test]
    async fn detection_is_deterministic() {
        let text = "Contact marie.dupont@example.com, Marie Dupont lives in Geneva";
        let first = detect(text, 0.5).await;
        let second = detect(text, 0.5).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_text_detects_nothing() {
        assert!(detect("", 0.5).await.is_empty());
        assert!(detect("   ", 0.5).await.is_empty());
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let detector = detector();
        detector.load().await.expect("first load");
        detector.load().await.expect("second load");
        assert!(detector.token_counter().is_some());
    }

    #[test]
    fn digit_runs_require_seven_digits() {
        let runs = digit_runs("order 123 and 0791234567 done");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].digits, 10);
    }

    #[test]
    fn word_tokens_report_byte_ranges() {
        let text = "a bb  ccc";
        let tokens = word_tokens(text);
        let words: Vec<&str> = tokens.iter().map(|t| &text[t.start..t.end]).collect();
        assert_eq!(words, vec!["a", "bb", "ccc"]);
    }
}
