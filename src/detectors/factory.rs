//! Detector construction registry.
//!
//! Maps backend type names to builder functions so the set of detectors a
//! deployment instantiates is driven by configuration, not code. The
//! registry is populated once during bootstrap and read-only afterwards;
//! every model id requested at startup must resolve to a registered builder
//! or the process refuses to start.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::detection::types::DetectorError;
use crate::detectors::Detector;
use crate::detectors::ner::NerDetector;
use crate::detectors::regex::RegexDetector;
use crate::detectors::rules::RuleDetector;

/// Construction parameters passed to detector builders.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Model or engine identifier to instantiate.
    pub model_id: String,
    /// Token budget of the backend's context window.
    pub max_length: usize,
    /// Optional model-specific confidence floor.
    pub threshold: Option<f32>,
}

impl DetectorSettings {
    /// Settings for a model id with defaults taken from the NER window.
    pub fn for_model(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            max_length: crate::detection::chunking::DEFAULT_CHUNK_TOKENS,
            threshold: None,
        }
    }
}

/// Builder function constructing one detector instance.
pub type DetectorBuilder = fn(&DetectorSettings) -> Result<Arc<dyn Detector>, DetectorError>;

/// Errors raised while registering or resolving detector builders.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// A builder is already registered under this type name.
    #[error("detector type '{0}' is already registered")]
    DuplicateType(String),
    /// No builder matches the requested model id.
    #[error("no detector registered for type '{kind}' (model '{model_id}'); available: {available:?}")]
    UnknownType {
        /// Resolved type name that was missing.
        kind: String,
        /// Model id that triggered the lookup.
        model_id: String,
        /// Type names currently registered.
        available: Vec<String>,
    },
    /// The builder itself failed.
    #[error(transparent)]
    Build(#[from] DetectorError),
}

/// Name → builder map, write-once during bootstrap.
pub struct DetectorRegistry {
    builders: HashMap<String, DetectorBuilder>,
}

impl DetectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register a builder under a type name; duplicates are rejected.
    pub fn register(&mut self, kind: &str, builder: DetectorBuilder) -> Result<(), FactoryError> {
        if self.builders.contains_key(kind) {
            return Err(FactoryError::DuplicateType(kind.to_string()));
        }
        self.builders.insert(kind.to_string(), builder);
        tracing::debug!(kind, "Registered detector type");
        Ok(())
    }

    /// Instantiate a detector for `model_id`.
    ///
    /// The builder is chosen by substring rule against the id: "gliner"
    /// selects the ML backend, "regex" the pattern backend, "rule" the
    /// context-rule backend, and anything else falls back to the default ML
    /// backend.
    pub fn create(
        &self,
        model_id: &str,
        settings: &DetectorSettings,
    ) -> Result<Arc<dyn Detector>, FactoryError> {
        let kind = determine_type(model_id);
        let Some(builder) = self.builders.get(kind) else {
            return Err(FactoryError::UnknownType {
                kind: kind.to_string(),
                model_id: model_id.to_string(),
                available: self.registered_types(),
            });
        };
        tracing::debug!(kind, model_id, "Creating detector");
        Ok(builder(settings)?)
    }

    /// Whether a builder exists for the given type name.
    pub fn is_registered(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    /// Sorted list of registered type names.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.builders.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn determine_type(model_id: &str) -> &'static str {
    let lowered = model_id.to_lowercase();
    if lowered.contains("gliner") {
        "ml"
    } else if lowered.contains("regex") {
        "regex"
    } else if lowered.contains("rule") {
        "rule"
    } else {
        "ml"
    }
}

fn build_ml(settings: &DetectorSettings) -> Result<Arc<dyn Detector>, DetectorError> {
    Ok(Arc::new(
        NerDetector::new(settings.model_id.clone(), settings.max_length)
            .with_score_floor(settings.threshold),
    ))
}

fn build_regex(settings: &DetectorSettings) -> Result<Arc<dyn Detector>, DetectorError> {
    Ok(Arc::new(RegexDetector::new(settings.model_id.clone())?))
}

fn build_rule(settings: &DetectorSettings) -> Result<Arc<dyn Detector>, DetectorError> {
    Ok(Arc::new(RuleDetector::new(settings.model_id.clone())?))
}

/// Registry with the built-in backend types registered.
pub fn default_registry() -> Result<DetectorRegistry, FactoryError> {
    let mut registry = DetectorRegistry::new();
    registry.register("ml", build_ml)?;
    registry.register("regex", build_regex)?;
    registry.register("rule", build_rule)?;
    tracing::info!(
        types = ?registry.registered_types(),
        "Detector registry initialized"
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::DetectorSource;

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = DetectorRegistry::new();
        registry.register("ml", build_ml).expect("first registration");
        let error = registry.register("ml", build_ml).unwrap_err();
        assert!(matches!(error, FactoryError::DuplicateType(kind) if kind == "ml"));
    }

    #[test]
    fn model_id_substring_selects_backend() {
        let registry = default_registry().expect("default registry");

        let ml = registry
            .create("gliner-pii-v2", &DetectorSettings::for_model("gliner-pii-v2"))
            .expect("ml detector");
        assert_eq!(ml.source(), DetectorSource::Ml);

        let regex = registry
            .create("regex-detector", &DetectorSettings::for_model("regex-detector"))
            .expect("regex detector");
        assert_eq!(regex.source(), DetectorSource::Regex);

        let rule = registry
            .create("rule-engine", &DetectorSettings::for_model("rule-engine"))
            .expect("rule detector");
        assert_eq!(rule.source(), DetectorSource::Rule);
    }

    #[test]
    fn unrecognized_model_id_falls_back_to_ml() {
        let registry = default_registry().expect("default registry");
        let detector = registry
            .create("acme-ner-base", &DetectorSettings::for_model("acme-ner-base"))
            .expect("fallback detector");
        assert_eq!(detector.source(), DetectorSource::Ml);
    }

    #[test]
    fn missing_builder_is_a_configuration_error() {
        let registry = DetectorRegistry::new();
        let error = match registry.create("gliner-pii", &DetectorSettings::for_model("gliner-pii")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(error, FactoryError::UnknownType { kind, .. } if kind == "ml"));
    }

    #[test]
    fn registered_types_are_sorted() {
        let registry = default_registry().expect("default registry");
        assert_eq!(registry.registered_types(), vec!["ml", "regex", "rule"]);
    }
}
