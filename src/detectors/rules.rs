//! Keyword/context rule backend.
//!
//! Declarative rules pair a trigger keyword with a value pattern that must
//! appear within a bounded window after the trigger ("passport" followed by
//! an id-shaped token). Anchoring on the keyword keeps precision high for
//! formats that are meaningless without context, like dates of birth or
//! license numbers.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;

use crate::detection::types::{DetectorError, DetectorSource, PiiType, Span};
use crate::detectors::Detector;
use crate::policy::PolicySnapshot;

struct RuleSpec {
    name: &'static str,
    pii_type: PiiType,
    label: &'static str,
    triggers: &'static [&'static str],
    value_pattern: &'static str,
    window: usize,
    score: f32,
}

const RULE_TABLE: &[RuleSpec] = &[
    RuleSpec {
        name: "date_of_birth",
        pii_type: PiiType::DateOfBirth,
        label: "date of birth",
        triggers: &["born on", "date of birth", "birth date", "dob", "né le", "née le"],
        value_pattern: r"\b\d{1,2}[/.\-]\d{1,2}[/.\-]\d{2,4}\b",
        window: 48,
        score: 0.85,
    },
    RuleSpec {
        name: "passport_number",
        pii_type: PiiType::PassportNum,
        label: "passport number",
        triggers: &["passport"],
        value_pattern: r"\b[A-Z]\d{7,8}\b",
        window: 40,
        score: 0.85,
    },
    RuleSpec {
        name: "driver_license",
        pii_type: PiiType::DriverLicense,
        label: "driver license",
        triggers: &["driver license", "driving licence", "license no", "licence no", "permit"],
        value_pattern: r"\b[A-Z]{1,2}\d{5,9}\b",
        window: 40,
        score: 0.8,
    },
    RuleSpec {
        name: "iban",
        pii_type: PiiType::Iban,
        label: "iban",
        triggers: &["iban", "account"],
        value_pattern: r"\b[A-Z]{2}\d{2}[A-Z0-9]{11,30}\b",
        window: 48,
        score: 0.9,
    },
    RuleSpec {
        name: "social_security",
        pii_type: PiiType::SocialNum,
        label: "social security number",
        triggers: &["ssn", "avs no", "social security"],
        value_pattern: r"\b756\.\d{4}\.\d{4}\.\d{2}\b|\b\d{3}-\d{2}-\d{4}\b",
        window: 32,
        score: 0.9,
    },
    RuleSpec {
        name: "postal_code",
        pii_type: PiiType::ZipCode,
        label: "postal code",
        triggers: &["zip", "postal code", "postcode"],
        value_pattern: r"\b\d{4,5}\b",
        window: 24,
        score: 0.75,
    },
];

struct CompiledRule {
    pii_type: PiiType,
    label: &'static str,
    trigger: Regex,
    value: Regex,
    window: usize,
    score: f32,
}

/// Context-rule detector stamping [`DetectorSource::Rule`] provenance.
pub struct RuleDetector {
    model_id: String,
    rules: Vec<CompiledRule>,
}

impl RuleDetector {
    /// Compile the built-in rule table.
    pub fn new(model_id: impl Into<String>) -> Result<Self, DetectorError> {
        let mut rules = Vec::with_capacity(RULE_TABLE.len());
        for spec in RULE_TABLE {
            let alternatives: Vec<String> =
                spec.triggers.iter().map(|t| regex::escape(t)).collect();
            let trigger_pattern = format!(r"(?i)(?:{})", alternatives.join("|"));
            let trigger =
                Regex::new(&trigger_pattern).map_err(|source| DetectorError::InvalidPattern {
                    name: spec.name.to_string(),
                    source,
                })?;
            let value =
                Regex::new(spec.value_pattern).map_err(|source| DetectorError::InvalidPattern {
                    name: spec.name.to_string(),
                    source,
                })?;
            rules.push(CompiledRule {
                pii_type: spec.pii_type,
                label: spec.label,
                trigger,
                value,
                window: spec.window,
                score: spec.score,
            });
        }
        Ok(Self {
            model_id: model_id.into(),
            rules,
        })
    }
}

#[async_trait]
impl Detector for RuleDetector {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn source(&self) -> DetectorSource {
        DetectorSource::Rule
    }

    async fn load(&self) -> Result<(), DetectorError> {
        tracing::debug!(model_id = %self.model_id, rules = self.rules.len(), "Rule tables ready");
        Ok(())
    }

    async fn detect(
        &self,
        text: &str,
        threshold: f32,
        _policy: &PolicySnapshot,
    ) -> Result<Vec<Span>, DetectorError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen: HashSet<(usize, usize, PiiType)> = HashSet::new();
        let mut spans = Vec::new();
        for rule in &self.rules {
            if rule.score < threshold {
                continue;
            }
            for trigger in rule.trigger.find_iter(text) {
                let window_start = trigger.end();
                let window_end = floor_char_boundary(text, (window_start + rule.window).min(text.len()));
                if window_start >= window_end {
                    continue;
                }
                let Some(found) = rule.value.find(&text[window_start..window_end]) else {
                    continue;
                };
                let start = window_start + found.start();
                let end = window_start + found.end();
                if !seen.insert((start, end, rule.pii_type)) {
                    continue;
                }
                spans.push(Span::new(
                    found.as_str(),
                    rule.pii_type,
                    rule.label,
                    start,
                    end,
                    rule.score,
                    DetectorSource::Rule,
                ));
            }
        }

        spans.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
        Ok(spans)
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
