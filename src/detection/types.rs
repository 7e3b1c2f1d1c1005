//! Core data types and error definitions for the detection pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Closed set of PII categories understood by the service.
///
/// Detectors emit free-form labels; [`PiiType::from_label`] normalizes them onto
/// this enum with [`PiiType::Unknown`] as the fallback so the wire always
/// carries a stable category name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PiiType {
    /// Email address.
    #[serde(rename = "EMAIL")]
    Email,
    /// Telephone number in any national or international format.
    #[serde(rename = "TELEPHONENUM")]
    Telephone,
    /// Given (first) name of a natural person.
    #[serde(rename = "GIVENNAME")]
    GivenName,
    /// Family (last) name of a natural person.
    #[serde(rename = "SURNAME")]
    Surname,
    /// City or locality name.
    #[serde(rename = "CITY")]
    City,
    /// Street-level address fragment.
    #[serde(rename = "STREET_ADDRESS")]
    StreetAddress,
    /// Postal or ZIP code.
    #[serde(rename = "ZIPCODE")]
    ZipCode,
    /// Government-issued social security / insurance number.
    #[serde(rename = "SOCIALNUM")]
    SocialNum,
    /// Payment card number.
    #[serde(rename = "CREDITCARD")]
    CreditCard,
    /// International bank account number.
    #[serde(rename = "IBAN")]
    Iban,
    /// IPv4 address.
    #[serde(rename = "IP_ADDRESS")]
    IpAddress,
    /// Hardware MAC address.
    #[serde(rename = "MAC_ADDRESS")]
    MacAddress,
    /// API keys, bearer tokens, and similar secrets.
    #[serde(rename = "API_KEY")]
    ApiKey,
    /// Date of birth.
    #[serde(rename = "DATE_OF_BIRTH")]
    DateOfBirth,
    /// Passport number.
    #[serde(rename = "PASSPORT_NUM")]
    PassportNum,
    /// Driver license number.
    #[serde(rename = "DRIVER_LICENSE")]
    DriverLicense,
    /// Fallback for labels outside the closed set.
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl PiiType {
    /// All known categories, used to build label maps.
    pub const ALL: [PiiType; 17] = [
        PiiType::Email,
        PiiType::Telephone,
        PiiType::GivenName,
        PiiType::Surname,
        PiiType::City,
        PiiType::StreetAddress,
        PiiType::ZipCode,
        PiiType::SocialNum,
        PiiType::CreditCard,
        PiiType::Iban,
        PiiType::IpAddress,
        PiiType::MacAddress,
        PiiType::ApiKey,
        PiiType::DateOfBirth,
        PiiType::PassportNum,
        PiiType::DriverLicense,
        PiiType::Unknown,
    ];

    /// Stable wire name of the category (`EMAIL`, not `PiiType::Email`).
    pub fn name(&self) -> &'static str {
        match self {
            PiiType::Email => "EMAIL",
            PiiType::Telephone => "TELEPHONENUM",
            PiiType::GivenName => "GIVENNAME",
            PiiType::Surname => "SURNAME",
            PiiType::City => "CITY",
            PiiType::StreetAddress => "STREET_ADDRESS",
            PiiType::ZipCode => "ZIPCODE",
            PiiType::SocialNum => "SOCIALNUM",
            PiiType::CreditCard => "CREDITCARD",
            PiiType::Iban => "IBAN",
            PiiType::IpAddress => "IP_ADDRESS",
            PiiType::MacAddress => "MAC_ADDRESS",
            PiiType::ApiKey => "API_KEY",
            PiiType::DateOfBirth => "DATE_OF_BIRTH",
            PiiType::PassportNum => "PASSPORT_NUM",
            PiiType::DriverLicense => "DRIVER_LICENSE",
            PiiType::Unknown => "UNKNOWN",
        }
    }

    /// Human-readable label surfaced in policy UIs and masked placeholders.
    pub fn display_label(&self) -> &'static str {
        match self {
            PiiType::Email => "Email Address",
            PiiType::Telephone => "Phone Number",
            PiiType::GivenName => "Given Name",
            PiiType::Surname => "Surname",
            PiiType::City => "City",
            PiiType::StreetAddress => "Street Address",
            PiiType::ZipCode => "Postal Code",
            PiiType::SocialNum => "Social Security Number",
            PiiType::CreditCard => "Credit Card Number",
            PiiType::Iban => "IBAN",
            PiiType::IpAddress => "IP Address",
            PiiType::MacAddress => "MAC Address",
            PiiType::ApiKey => "API Key",
            PiiType::DateOfBirth => "Date of Birth",
            PiiType::PassportNum => "Passport Number",
            PiiType::DriverLicense => "Driver License",
            PiiType::Unknown => "Unknown",
        }
    }

    /// Normalize a raw detector label onto the closed set.
    ///
    /// Accepts wire names (`EMAIL`), lowercase model labels (`email`,
    /// `given name`), and a handful of common aliases. Anything unrecognized
    /// maps to [`PiiType::Unknown`].
    pub fn from_label(label: &str) -> PiiType {
        let normalized = label.trim().to_uppercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "EMAIL" | "EMAIL_ADDRESS" => PiiType::Email,
            "TELEPHONENUM" | "PHONE" | "PHONE_NUMBER" | "TELEPHONE" => PiiType::Telephone,
            "GIVENNAME" | "GIVEN_NAME" | "FIRST_NAME" => PiiType::GivenName,
            "SURNAME" | "LAST_NAME" | "FAMILY_NAME" => PiiType::Surname,
            "CITY" | "LOCALITY" => PiiType::City,
            "STREET_ADDRESS" | "ADDRESS" => PiiType::StreetAddress,
            "ZIPCODE" | "ZIP" | "POSTAL_CODE" => PiiType::ZipCode,
            "SOCIALNUM" | "SSN" | "SOCIAL_SECURITY_NUMBER" | "AVS" => PiiType::SocialNum,
            "CREDITCARD" | "CREDIT_CARD" | "CREDIT_CARD_NUMBER" => PiiType::CreditCard,
            "IBAN" => PiiType::Iban,
            "IP_ADDRESS" | "IP" => PiiType::IpAddress,
            "MAC_ADDRESS" | "MAC" => PiiType::MacAddress,
            "API_KEY" | "TOKEN" | "SECRET" => PiiType::ApiKey,
            "DATE_OF_BIRTH" | "DOB" | "BIRTHDATE" => PiiType::DateOfBirth,
            "PASSPORT_NUM" | "PASSPORT" | "PASSPORT_NUMBER" => PiiType::PassportNum,
            "DRIVER_LICENSE" | "DRIVERS_LICENSE" | "DRIVING_LICENCE" => PiiType::DriverLicense,
            _ => PiiType::Unknown,
        }
    }
}

/// Identifies which backend produced a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DetectorSource {
    /// Statistical NER backend.
    #[serde(rename = "ML")]
    Ml,
    /// Regex pattern backend.
    #[serde(rename = "REGEX")]
    Regex,
    /// Keyword/context rule backend.
    #[serde(rename = "RULE")]
    Rule,
    /// Provenance unavailable.
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl DetectorSource {
    /// Stable wire name of the source.
    pub fn name(&self) -> &'static str {
        match self {
            DetectorSource::Ml => "ML",
            DetectorSource::Regex => "REGEX",
            DetectorSource::Rule => "RULE",
            DetectorSource::Unknown => "UNKNOWN",
        }
    }
}

/// Dedup key identifying a span across detectors and overlapping chunks.
pub type SpanKey = (usize, usize, PiiType, String);

/// A single detected PII occurrence.
///
/// Offsets are half-open byte offsets into the original request input; `text`
/// is an owned copy of the matched substring so spans outlive the chunks that
/// produced them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    /// Exact substring matched, byte-for-byte equal to `input[start..end]`.
    pub text: String,
    /// Normalized PII category.
    #[serde(rename = "type")]
    pub pii_type: PiiType,
    /// Raw label emitted by the producing detector.
    pub detector_label: String,
    /// Inclusive start byte offset into the original input.
    pub start: usize,
    /// Exclusive end byte offset into the original input.
    pub end: usize,
    /// Confidence in `[0.0, 1.0]`.
    pub score: f32,
    /// Backend that produced the span.
    pub source: DetectorSource,
    /// Model ids of detectors whose duplicate or overlapped spans were
    /// discarded in favour of this one. Populated only when provenance
    /// logging is enabled.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<String>,
}

impl Span {
    /// Build a span with empty provenance.
    pub fn new(
        text: impl Into<String>,
        pii_type: PiiType,
        detector_label: impl Into<String>,
        start: usize,
        end: usize,
        score: f32,
        source: DetectorSource,
    ) -> Self {
        Self {
            text: text.into(),
            pii_type,
            detector_label: detector_label.into(),
            start,
            end,
            score,
            source,
            provenance: Vec::new(),
        }
    }

    /// Dedup key `(start, end, type, text)`.
    pub fn key(&self) -> SpanKey {
        (self.start, self.end, self.pii_type, self.text.clone())
    }
}

/// A bounded window of input text handed to a detector.
///
/// `start` is the absolute byte offset of the window in the original input;
/// chunks never rewrite offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Window contents; `end - start == text.len()`.
    pub text: String,
    /// Absolute start offset in the original input.
    pub start: usize,
    /// Absolute end offset in the original input.
    pub end: usize,
    /// Advisory token count when the producing strategy knows it.
    pub token_count: Option<usize>,
}

/// Consolidated outcome of a scan.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Merged spans sorted by `(start, end)`.
    pub spans: Vec<Span>,
    /// Count of surviving spans per wire type name.
    pub summary: BTreeMap<String, u32>,
    /// Input with every span replaced by its `[<TYPE>]` placeholder.
    pub masked_content: String,
    /// Number of chunks the input was split into (1 for the fast path).
    pub chunk_count: usize,
}

/// Partial result for one completed chunk in streaming mode.
///
/// Frames are emitted in ascending `chunk_index` order; the terminal frame
/// carries no spans, repeats `total_chunks` in both index fields, and holds
/// the aggregate summary.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    /// Zero-based index of the completed chunk; `total_chunks` on the
    /// terminal frame.
    pub chunk_index: usize,
    /// Total number of chunks produced for the request.
    pub total_chunks: usize,
    /// Spans found in this chunk, already offset-translated.
    pub spans: Vec<Span>,
    /// Aggregate type counts, present only on the terminal frame.
    pub summary: Option<BTreeMap<String, u32>>,
}

/// Count surviving spans per wire type name.
pub fn summarize(spans: &[Span]) -> BTreeMap<String, u32> {
    let mut summary = BTreeMap::new();
    for span in spans {
        *summary.entry(span.pii_type.name().to_string()).or_insert(0) += 1;
    }
    summary
}

/// Errors produced while splitting input into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Token budget does not leave room for forward progress.
    #[error("chunk size ({chunk_size}) must be greater than overlap ({overlap})")]
    InvalidBudget {
        /// Requested chunk size in tokens.
        chunk_size: usize,
        /// Requested overlap in tokens.
        overlap: usize,
    },
    /// Tokenizer resources were unavailable for the configured model.
    #[error("failed to initialize tokenizer for model '{model}': {source}")]
    Tokenizer {
        /// Model whose tokenizer failed to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised by detector backends.
///
/// Benign detection failures are not errors: backends return an empty span
/// list and the scan degrades. These variants cover hard failures only.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// A pattern in the backend's table failed to compile.
    #[error("invalid pattern '{name}': {source}")]
    InvalidPattern {
        /// Name of the offending pattern.
        name: String,
        /// Compile error from the regex engine.
        #[source]
        source: regex::Error,
    },
    /// Backend failed in a way that invalidates the whole request.
    #[error("detector '{model_id}' failed: {message}")]
    Backend {
        /// Model id of the failing backend.
        model_id: String,
        /// Diagnostic message.
        message: String,
    },
}

/// Errors emitted by the detection orchestration pipeline.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// Chunking rejected the configured budget.
    #[error("failed to chunk input: {0}")]
    Chunking(#[from] ChunkingError),
    /// A backend failed hard while scanning.
    #[error(transparent)]
    Detector(#[from] DetectorError),
}
