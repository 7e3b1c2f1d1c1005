//! Per-request detection policy.
//!
//! A [`PolicySnapshot`] is assembled at the start of every scan — from the
//! external policy store when reachable, otherwise from the on-disk TOML
//! baseline — and stays immutable for the lifetime of the request. Workers
//! share it by reference; nothing mutates it mid-scan, which is what makes
//! policy changes apply between requests without a restart.

/// On-disk TOML baseline.
pub mod defaults;
/// External policy store adapter.
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::detection::types::{DetectorSource, PiiType, Span};

/// Restricts a per-type rule to one backend or to all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorScope {
    /// Rule applies only to the ML backend's spans.
    #[serde(rename = "ML")]
    Ml,
    /// Rule applies only to the regex backend's spans.
    #[serde(rename = "REGEX")]
    Regex,
    /// Rule applies only to the rule backend's spans.
    #[serde(rename = "RULE")]
    Rule,
    /// Rule applies to every backend.
    #[serde(rename = "ALL")]
    All,
}

impl DetectorScope {
    /// Parse a store row's `detector` column.
    ///
    /// An empty value reads as `All` — the most permissive interpretation —
    /// and unknown values do the same after a warning, so a schema drift in
    /// the store can widen a rule but never silently narrow one.
    pub fn from_row(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "ML" => DetectorScope::Ml,
            "REGEX" => DetectorScope::Regex,
            "RULE" => DetectorScope::Rule,
            "ALL" | "" => DetectorScope::All,
            other => {
                tracing::warn!(value = other, "Unknown detector scope; treating as ALL");
                DetectorScope::All
            }
        }
    }

    /// Whether a rule with this scope governs spans from `source`.
    pub fn applies_to(&self, source: DetectorSource) -> bool {
        matches!(
            (self, source),
            (DetectorScope::All, _)
                | (DetectorScope::Ml, DetectorSource::Ml)
                | (DetectorScope::Regex, DetectorSource::Regex)
                | (DetectorScope::Rule, DetectorSource::Rule)
        )
    }
}

/// Policy row governing one PII type.
#[derive(Debug, Clone)]
pub struct TypeRule {
    /// Whether spans of this type are reported at all (within the scope).
    pub enabled: bool,
    /// Confidence floor for this type.
    pub threshold: f32,
    /// Which backend(s) the rule governs.
    pub scope: DetectorScope,
    /// Human-readable name surfaced to policy UIs.
    pub display_name: String,
    /// Label the detectors use for this type.
    pub detector_label: String,
}

impl TypeRule {
    /// Rule with per-type defaults derived from the type itself.
    pub fn for_type(pii_type: PiiType, enabled: bool, threshold: f32, scope: DetectorScope) -> Self {
        Self {
            enabled,
            threshold,
            scope,
            display_name: pii_type.display_label().to_string(),
            detector_label: pii_type.name().to_lowercase(),
        }
    }
}

/// Immutable per-request policy bundle.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    /// Global toggle for the ML backend.
    pub ml_enabled: bool,
    /// Global toggle for the regex backend.
    pub regex_enabled: bool,
    /// Global toggle for the rule backend.
    pub rule_enabled: bool,
    /// Confidence floor applied when the request carries no threshold and a
    /// type has no rule of its own.
    pub default_threshold: f32,
    /// Whether merge decisions record discarded rivals.
    pub log_provenance: bool,
    /// Per-type rules keyed by category.
    pub types: HashMap<PiiType, TypeRule>,
}

impl PolicySnapshot {
    /// Snapshot with every backend enabled and no per-type rules.
    ///
    /// The ultimate fallback when neither the store nor the on-disk baseline
    /// is available, and the usual starting point in tests.
    pub fn permissive() -> Self {
        Self {
            ml_enabled: true,
            regex_enabled: true,
            rule_enabled: true,
            default_threshold: 0.5,
            log_provenance: false,
            types: HashMap::new(),
        }
    }

    /// Rule governing `pii_type`, if the policy has one.
    pub fn rule_for(&self, pii_type: PiiType) -> Option<&TypeRule> {
        self.types.get(&pii_type)
    }

    /// Detector-scoped filter applied to every raw span.
    ///
    /// A span is kept unless a rule exists for its type, the rule's scope
    /// covers the span's producing backend, and the rule either disables the
    /// type or sets a floor above the span's score. Types without a matching
    /// rule pass through — the request-level threshold already applied inside
    /// the detectors. Disabling EMAIL for the regex backend therefore never
    /// suppresses an EMAIL found by the ML backend.
    pub fn keeps(&self, span: &Span) -> bool {
        match self.types.get(&span.pii_type) {
            Some(rule) if rule.scope.applies_to(span.source) => {
                rule.enabled && span.score >= rule.threshold
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(pii_type: PiiType, score: f32, source: DetectorSource) -> Span {
        Span::new("x", pii_type, pii_type.name(), 0, 1, score, source)
    }

    #[test]
    fn empty_scope_reads_as_all() {
        assert_eq!(DetectorScope::from_row(""), DetectorScope::All);
        assert_eq!(DetectorScope::from_row("  "), DetectorScope::All);
        assert_eq!(DetectorScope::from_row("ALL"), DetectorScope::All);
        assert_eq!(DetectorScope::from_row("ml"), DetectorScope::Ml);
        assert_eq!(DetectorScope::from_row("REGEX"), DetectorScope::Regex);
        assert_eq!(DetectorScope::from_row("bogus"), DetectorScope::All);
    }

    #[test]
    fn scope_applies_only_to_matching_source() {
        assert!(DetectorScope::Regex.applies_to(DetectorSource::Regex));
        assert!(!DetectorScope::Regex.applies_to(DetectorSource::Ml));
        assert!(DetectorScope::All.applies_to(DetectorSource::Rule));
    }

    #[test]
    fn disabled_type_with_all_scope_drops_every_source() {
        let mut policy = PolicySnapshot::permissive();
        policy.types.insert(
            PiiType::Email,
            TypeRule::for_type(PiiType::Email, false, 0.3, DetectorScope::All),
        );
        assert!(!policy.keeps(&span(PiiType::Email, 0.9, DetectorSource::Ml)));
        assert!(!policy.keeps(&span(PiiType::Email, 1.0, DetectorSource::Regex)));
        assert!(!policy.keeps(&span(PiiType::Email, 0.8, DetectorSource::Rule)));
    }

    #[test]
    fn scoped_disable_spares_other_detectors() {
        let mut policy = PolicySnapshot::permissive();
        policy.types.insert(
            PiiType::Email,
            TypeRule::for_type(PiiType::Email, false, 0.3, DetectorScope::Regex),
        );
        assert!(!policy.keeps(&span(PiiType::Email, 1.0, DetectorSource::Regex)));
        assert!(policy.keeps(&span(PiiType::Email, 0.95, DetectorSource::Ml)));
    }

    #[test]
    fn per_type_threshold_filters_within_scope() {
        let mut policy = PolicySnapshot::permissive();
        policy.types.insert(
            PiiType::Telephone,
            TypeRule::for_type(PiiType::Telephone, true, 0.9, DetectorScope::All),
        );
        assert!(policy.keeps(&span(PiiType::Telephone, 0.95, DetectorSource::Ml)));
        assert!(!policy.keeps(&span(PiiType::Telephone, 0.85, DetectorSource::Ml)));
    }

    #[test]
    fn types_without_rules_pass_through() {
        let policy = PolicySnapshot::permissive();
        assert!(policy.keeps(&span(PiiType::Iban, 0.51, DetectorSource::Regex)));
        assert!(policy.keeps(&span(PiiType::Unknown, 0.99, DetectorSource::Ml)));
    }
}
