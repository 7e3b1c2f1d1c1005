//! On-disk baseline policy loaded from TOML.
//!
//! Two sources merge into the baseline [`PolicySnapshot`] and the static
//! detection settings:
//!
//! - `detection.toml` — global toggles, thresholds, chunking and worker-pool
//!   parameters, plus `[types.<NAME>]` rules mirroring the store schema.
//! - `models/*.toml` — one file per candidate ML model (id, token window,
//!   priority, enabled flag). The highest-priority enabled model supplies
//!   the NER backend's identity and chunk budget.
//!
//! Missing or malformed files are fatal at startup; the server never guesses
//! at a policy it cannot read.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

use super::{DetectorScope, PolicySnapshot, TypeRule};
use crate::detection::chunking::{DEFAULT_CHUNK_TOKENS, DEFAULT_OVERLAP_TOKENS};
use crate::detection::types::PiiType;

/// Errors raised while loading the on-disk baseline.
#[derive(Debug, Error)]
pub enum DefaultsError {
    /// A required file or directory is absent.
    #[error("configuration not found: {0}")]
    Missing(String),
    /// Filesystem read failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
    /// TOML payload failed to parse.
    #[error("malformed TOML in {path}: {source}")]
    Parse {
        /// Path of the malformed file.
        path: String,
        /// Parser diagnostics.
        #[source]
        source: toml::de::Error,
    },
    /// Every backend is disabled, which would make the service inert.
    #[error(
        "no enabled detection backends: enable at least one model under {0} \
         or set regex_enabled / rule_enabled in detection.toml"
    )]
    NoBackends(String),
}

/// Global detection settings from `detection.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionSettings {
    /// Default enabled state of the ML backend.
    #[serde(default = "default_true")]
    pub ml_enabled: bool,
    /// Default enabled state of the regex backend.
    #[serde(default = "default_true")]
    pub regex_enabled: bool,
    /// Default enabled state of the rule backend.
    #[serde(default = "default_true")]
    pub rule_enabled: bool,
    /// Confidence floor when a request carries no threshold.
    #[serde(default = "default_threshold")]
    pub default_threshold: f32,
    /// Input length (bytes) above which the chunked runner engages.
    #[serde(default = "default_long_text_threshold")]
    pub long_text_threshold: usize,
    /// Token budget per chunk.
    #[serde(default = "default_chunk_tokens")]
    pub chunk_size_tokens: usize,
    /// Token overlap between adjacent chunks.
    #[serde(default = "default_overlap_tokens")]
    pub chunk_overlap_tokens: usize,
    /// Chunk worker pool size; absent means `min(cores, 4)`.
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Record discarded rivals on merge winners.
    #[serde(default)]
    pub log_provenance: bool,
    /// Largest request body the scan surface accepts.
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

fn default_true() -> bool {
    true
}
fn default_threshold() -> f32 {
    0.5
}
fn default_long_text_threshold() -> usize {
    10_000
}
fn default_chunk_tokens() -> usize {
    DEFAULT_CHUNK_TOKENS
}
fn default_overlap_tokens() -> usize {
    DEFAULT_OVERLAP_TOKENS
}
fn default_max_content_bytes() -> usize {
    1_048_576
}

#[derive(Debug, Deserialize)]
struct DetectionFile {
    detection: DetectionSettings,
    #[serde(default)]
    types: HashMap<String, TypeRuleRow>,
}

#[derive(Debug, Deserialize)]
struct TypeRuleRow {
    #[serde(default = "default_true")]
    enabled: bool,
    threshold: Option<f32>,
    #[serde(default)]
    detector: String,
    display_name: Option<String>,
    detector_label: Option<String>,
}

/// One candidate model definition from `models/*.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Model identifier; routed through the detector factory.
    pub model_id: String,
    /// Whether this model participates at startup.
    #[serde(default)]
    pub enabled: bool,
    /// Selection priority; lower wins.
    #[serde(default = "default_model_priority")]
    pub priority: u32,
    /// Token window of the model.
    #[serde(default = "default_chunk_tokens")]
    pub max_length: usize,
    /// Optional model-specific confidence floor.
    #[serde(default)]
    pub threshold: Option<f32>,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

fn default_model_priority() -> u32 {
    999
}

/// Parsed baseline: settings, snapshot, and the enabled model list.
#[derive(Debug, Clone)]
pub struct PolicyDefaults {
    /// Global detection settings.
    pub settings: DetectionSettings,
    /// Baseline snapshot used when the store is unreachable.
    pub baseline: PolicySnapshot,
    /// Enabled models sorted by ascending priority.
    pub models: Vec<ModelConfig>,
}

impl PolicyDefaults {
    /// Highest-priority enabled model, if any.
    pub fn primary_model(&self) -> Option<&ModelConfig> {
        self.models.first()
    }
}

/// Load the baseline from `config_dir`.
pub fn load(config_dir: &Path) -> Result<PolicyDefaults, DefaultsError> {
    let detection_path = config_dir.join("detection.toml");
    if !detection_path.exists() {
        return Err(DefaultsError::Missing(detection_path.display().to_string()));
    }
    let file: DetectionFile = parse_toml(&detection_path)?;

    let models_dir = config_dir.join("models");
    if !models_dir.is_dir() {
        return Err(DefaultsError::Missing(models_dir.display().to_string()));
    }
    let mut models = load_models(&models_dir)?;
    models.retain(|model| model.enabled);
    models.sort_by_key(|model| model.priority);

    if models.is_empty() && !file.detection.regex_enabled && !file.detection.rule_enabled {
        return Err(DefaultsError::NoBackends(models_dir.display().to_string()));
    }

    let baseline = snapshot_from(&file.detection, &file.types);
    tracing::debug!(
        models = models.len(),
        type_rules = baseline.types.len(),
        default_threshold = baseline.default_threshold,
        "Loaded on-disk policy baseline"
    );

    Ok(PolicyDefaults {
        settings: file.detection,
        baseline,
        models,
    })
}

fn load_models(models_dir: &Path) -> Result<Vec<ModelConfig>, DefaultsError> {
    let mut models = Vec::new();
    for entry in WalkDir::new(models_dir).max_depth(1).into_iter() {
        let entry = entry.map_err(|error| DefaultsError::Missing(error.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let model: ModelConfig = parse_toml(entry.path())?;
        models.push(model);
    }
    if models.is_empty() {
        return Err(DefaultsError::Missing(format!(
            "{} contains no model configuration files",
            models_dir.display()
        )));
    }
    Ok(models)
}

fn parse_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DefaultsError> {
    let raw = fs::read_to_string(path).map_err(|source| DefaultsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| DefaultsError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn snapshot_from(
    settings: &DetectionSettings,
    rows: &HashMap<String, TypeRuleRow>,
) -> PolicySnapshot {
    let mut types = HashMap::new();
    for (name, row) in rows {
        let pii_type = PiiType::from_label(name);
        if pii_type == PiiType::Unknown {
            tracing::warn!(name, "Ignoring rule for unknown PII type");
            continue;
        }
        let mut rule = TypeRule::for_type(
            pii_type,
            row.enabled,
            row.threshold.unwrap_or(settings.default_threshold),
            DetectorScope::from_row(&row.detector),
        );
        if let Some(display_name) = &row.display_name {
            rule.display_name = display_name.clone();
        }
        if let Some(detector_label) = &row.detector_label {
            rule.detector_label = detector_label.clone();
        }
        types.insert(pii_type, rule);
    }

    PolicySnapshot {
        ml_enabled: settings.ml_enabled,
        regex_enabled: settings.regex_enabled,
        rule_enabled: settings.rule_enabled,
        default_threshold: settings.default_threshold,
        log_provenance: settings.log_provenance,
        types,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("piiscan-defaults-{tag}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(dir.join("models")).expect("create scratch config dir");
        dir
    }

    fn write(dir: &Path, relative: &str, contents: &str) {
        fs::write(dir.join(relative), contents).expect("write config file");
    }

    const DETECTION_TOML: &str = r#"
[detection]
default_threshold = 0.4
long_text_threshold = 9000
chunk_size_tokens = 300
chunk_overlap_tokens = 40
regex_enabled = true
rule_enabled = false

[types.EMAIL]
enabled = true
threshold = 0.6
detector = "ALL"
display_name = "Email Address"
detector_label = "email"

[types.TELEPHONENUM]
enabled = false
detector = ""
"#;

    const MODEL_TOML: &str = r#"
model_id = "gliner-pii"
enabled = true
priority = 10
max_length = 378
threshold = 0.35
description = "primary NER model"
"#;

    #[test]
    fn loads_settings_types_and_models() {
        let dir = scratch_dir("ok");
        write(&dir, "detection.toml", DETECTION_TOML);
        write(&dir, "models/gliner-pii.toml", MODEL_TOML);
        write(
            &dir,
            "models/disabled.toml",
            "model_id = \"gliner-alt\"\nenabled = false\n",
        );

        let defaults = load(&dir).expect("baseline loads");
        assert_eq!(defaults.settings.default_threshold, 0.4);
        assert_eq!(defaults.settings.long_text_threshold, 9000);
        assert_eq!(defaults.settings.chunk_size_tokens, 300);
        assert!(!defaults.settings.rule_enabled);

        assert_eq!(defaults.models.len(), 1);
        let primary = defaults.primary_model().expect("primary model");
        assert_eq!(primary.model_id, "gliner-pii");
        assert_eq!(primary.threshold, Some(0.35));

        let email = defaults
            .baseline
            .rule_for(PiiType::Email)
            .expect("email rule");
        assert!(email.enabled);
        assert_eq!(email.threshold, 0.6);
        assert_eq!(email.scope, DetectorScope::All);

        // Empty detector column reads as ALL, and the missing threshold
        // inherits the global default.
        let phone = defaults
            .baseline
            .rule_for(PiiType::Telephone)
            .expect("phone rule");
        assert!(!phone.enabled);
        assert_eq!(phone.scope, DetectorScope::All);
        assert_eq!(phone.threshold, 0.4);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_detection_file_is_fatal() {
        let dir = scratch_dir("missing");
        write(&dir, "models/gliner-pii.toml", MODEL_TOML);
        assert!(matches!(load(&dir), Err(DefaultsError::Missing(_))));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_toml_is_fatal() {
        let dir = scratch_dir("malformed");
        write(&dir, "detection.toml", "[detection\nbroken");
        write(&dir, "models/gliner-pii.toml", MODEL_TOML);
        assert!(matches!(load(&dir), Err(DefaultsError::Parse { .. })));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn all_backends_disabled_is_fatal() {
        let dir = scratch_dir("nobackends");
        write(
            &dir,
            "detection.toml",
            "[detection]\nregex_enabled = false\nrule_enabled = false\n",
        );
        write(
            &dir,
            "models/gliner-pii.toml",
            "model_id = \"gliner-pii\"\nenabled = false\n",
        );
        assert!(matches!(load(&dir), Err(DefaultsError::NoBackends(_))));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_type_rules_are_ignored() {
        let dir = scratch_dir("unknown-type");
        write(
            &dir,
            "detection.toml",
            "[detection]\n\n[types.NOT_A_TYPE]\nenabled = false\n",
        );
        write(&dir, "models/gliner-pii.toml", MODEL_TOML);
        let defaults = load(&dir).expect("baseline loads");
        assert!(defaults.baseline.types.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }
}
