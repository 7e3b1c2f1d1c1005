//! Policy store adapter.
//!
//! Fetches the dynamic detection policy from the shared configuration store
//! at the start of every scan — never cached across requests, which is the
//! contract that lets operators flip detectors and thresholds without a
//! restart. The store exposes its two relational tables as JSON rows over
//! HTTP: a singleton global row (`pii_detection_config`, id=1) and per-type
//! rows (`pii_type_rules`, unique on type × detector).
//!
//! The adapter never fails the caller: any transport or shape problem logs a
//! WARN and falls back to the on-disk baseline.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use super::{DetectorScope, PolicySnapshot, TypeRule};
use crate::config::Config;
use crate::detection::types::PiiType;

/// Errors observed while talking to the policy store.
///
/// These never propagate out of [`PolicyStoreAdapter::fetch_snapshot`]; they
/// exist to make the fallback log lines precise.
#[derive(Debug, Error)]
pub enum PolicyStoreError {
    /// HTTP layer failed before a response arrived.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Store answered with an unexpected status.
    #[error("unexpected store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the store.
        status: StatusCode,
        /// Response body for diagnostics.
        body: String,
    },
    /// The singleton global configuration row is absent.
    #[error("store returned no global configuration row (id=1)")]
    MissingGlobalRow,
}

#[derive(Debug, Deserialize)]
struct GlobalConfigRow {
    ml_enabled: bool,
    regex_enabled: bool,
    rule_enabled: bool,
    default_threshold: f32,
}

#[derive(Debug, Deserialize)]
struct TypeRuleRow {
    #[serde(rename = "type")]
    pii_type: String,
    #[serde(default)]
    detector: String,
    enabled: bool,
    threshold: Option<f32>,
    display_name: Option<String>,
    detector_label: Option<String>,
}

/// HTTP client for the policy store with baseline fallback.
pub struct PolicyStoreAdapter {
    client: Client,
    base_url: String,
    database: String,
    user: String,
    password: Option<String>,
    baseline: PolicySnapshot,
}

impl PolicyStoreAdapter {
    /// Build an adapter against an explicit base URL.
    pub fn new(
        base_url: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: Option<String>,
        baseline: PolicySnapshot,
    ) -> Result<Self, PolicyStoreError> {
        let client = Client::builder()
            .user_agent("piiscan/0.2")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            database: database.into(),
            user: user.into(),
            password,
            baseline,
        })
    }

    /// Build an adapter from the `DB_*` environment configuration.
    pub fn from_config(config: &Config, baseline: PolicySnapshot) -> Result<Self, PolicyStoreError> {
        let base_url = format!("http://{}:{}", config.db_host, config.db_port);
        tracing::debug!(
            url = %base_url,
            database = %config.db_name,
            "Initialized policy store client"
        );
        Self::new(
            base_url,
            config.db_name.clone(),
            config.db_user.clone(),
            config.db_password.clone(),
            baseline,
        )
    }

    /// The on-disk baseline the adapter falls back to.
    pub fn baseline(&self) -> &PolicySnapshot {
        &self.baseline
    }

    /// Fetch the current policy, falling back to the baseline on any failure.
    pub async fn fetch_snapshot(&self) -> PolicySnapshot {
        match self.fetch_rows().await {
            Ok((global, rows)) => {
                let snapshot = self.merge_rows(global, rows);
                tracing::debug!(
                    ml_enabled = snapshot.ml_enabled,
                    regex_enabled = snapshot.regex_enabled,
                    rule_enabled = snapshot.rule_enabled,
                    default_threshold = snapshot.default_threshold,
                    type_rules = snapshot.types.len(),
                    "Fetched policy snapshot from store"
                );
                snapshot
            }
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    "Policy store unavailable; using on-disk defaults"
                );
                self.baseline.clone()
            }
        }
    }

    async fn fetch_rows(&self) -> Result<(GlobalConfigRow, Vec<TypeRuleRow>), PolicyStoreError> {
        let globals: Vec<GlobalConfigRow> = self
            .get_json(&format!("{}/pii_detection_config?id=eq.1", self.database))
            .await?;
        let global = globals
            .into_iter()
            .next()
            .ok_or(PolicyStoreError::MissingGlobalRow)?;
        let rows: Vec<TypeRuleRow> = self
            .get_json(&format!("{}/pii_type_rules", self.database))
            .await?;
        Ok((global, rows))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, PolicyStoreError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(url)
            .basic_auth(&self.user, self.password.as_deref())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PolicyStoreError::UnexpectedStatus { status, body });
        }
        Ok(response.json().await?)
    }

    fn merge_rows(&self, global: GlobalConfigRow, rows: Vec<TypeRuleRow>) -> PolicySnapshot {
        let mut snapshot = self.baseline.clone();
        snapshot.ml_enabled = global.ml_enabled;
        snapshot.regex_enabled = global.regex_enabled;
        snapshot.rule_enabled = global.rule_enabled;
        snapshot.default_threshold = global.default_threshold;

        // Rows arrive keyed on (type, detector); the last row for a type
        // wins, which matches the store's single-rule-per-type usage.
        for row in rows {
            let pii_type = PiiType::from_label(&row.pii_type);
            if pii_type == PiiType::Unknown {
                tracing::warn!(pii_type = %row.pii_type, "Ignoring store rule for unknown PII type");
                continue;
            }
            let mut rule = TypeRule::for_type(
                pii_type,
                row.enabled,
                row.threshold.unwrap_or(snapshot.default_threshold),
                DetectorScope::from_row(&row.detector),
            );
            if let Some(display_name) = row.display_name {
                rule.display_name = display_name;
            }
            if let Some(detector_label) = row.detector_label {
                rule.detector_label = detector_label;
            }
            snapshot.types.insert(pii_type, rule);
        }
        snapshot
    }
}
