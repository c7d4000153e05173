//! Core domain model for job-ad deduplication and enrichment.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adstack-core";

/// Identifier of an ingested advertisement (one per chat message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdId(pub u64);

impl fmt::Display for AdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ad-{}", self.0)
    }
}

/// Identifier of a duplicate cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(pub Uuid);

impl StackId {
    /// Deterministic identifier for a stack founded with `founder` as canonical member.
    pub fn for_founder(founder: AdId) -> Self {
        Self::derive(founder, 0)
    }

    /// Same as [`StackId::for_founder`] but salted, for when the plain id is already taken.
    pub fn derive(founder: AdId, salt: u32) -> Self {
        let name = if salt == 0 {
            format!("adstack:stack:{}", founder.0)
        } else {
            format!("adstack:stack:{}:{}", founder.0, salt)
        };
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack-{}", self.0)
    }
}

/// Pointer back to the chat message an ad was scraped from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel: String,
    pub message_id: i64,
}

/// Handoff contract from ingestion into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdDraft {
    pub id: AdId,
    pub posted_at: DateTime<Utc>,
    pub source: MessageRef,
    /// Normalized text: lower-cased, whitespace collapsed.
    pub text: String,
    /// Salary snippet cut out of the message by ingestion, if any.
    #[serde(default)]
    pub salary_text: Option<String>,
}

/// An advertisement as tracked by the pipeline.
///
/// `is_unique` and `stack_id` are written only by the duplicate clusterer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ad {
    pub id: AdId,
    pub posted_at: DateTime<Utc>,
    pub source: MessageRef,
    pub text: String,
    pub is_unique: bool,
    pub stack_id: Option<StackId>,
}

impl Ad {
    pub fn from_draft(draft: &AdDraft) -> Self {
        Self {
            id: draft.id,
            posted_at: draft.posted_at,
            source: draft.source.clone(),
            text: draft.text.clone(),
            is_unique: true,
            stack_id: None,
        }
    }
}

/// A cluster of near-duplicate ads with exactly one canonical member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub members: BTreeSet<AdId>,
    pub canonical: AdId,
}

impl Stack {
    pub fn contains(&self, ad: AdId) -> bool {
        self.members.contains(&ad)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl ProcessingStatus {
    /// Records in these states are picked up again by the next run.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::NotStarted | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Seniority tier returned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionLevel {
    Intern,
    Junior,
    Middle,
    Senior,
    Lead,
    Head,
    /// The classifier answered but could not place the role.
    Unknown,
}

impl PositionLevel {
    pub const ALL: [PositionLevel; 7] = [
        Self::Intern,
        Self::Junior,
        Self::Middle,
        Self::Senior,
        Self::Lead,
        Self::Head,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intern => "intern",
            Self::Junior => "junior",
            Self::Middle => "middle",
            Self::Senior => "senior",
            Self::Lead => "lead",
            Self::Head => "head",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(label))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Rub,
    Kzt,
    Uah,
    Byn,
}

impl Currency {
    pub const ALL: [Currency; 7] = [
        Currency::Usd,
        Currency::Eur,
        Currency::Gbp,
        Currency::Rub,
        Currency::Kzt,
        Currency::Uah,
        Currency::Byn,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Rub => "RUB",
            Currency::Kzt => "KZT",
            Currency::Uah => "UAH",
            Currency::Byn => "BYN",
        }
    }

    /// ISO 4217 code lookup, case-insensitive.
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|currency| currency.code().eq_ignore_ascii_case(code))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayPeriod {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl PayPeriod {
    /// Fixed factor that scales an amount in this period to a monthly amount.
    ///
    /// Hours and days assume a 40-hour, 5-day week over 52 weeks.
    pub fn monthly_factor(self) -> f64 {
        match self {
            Self::Hour => 2080.0 / 12.0,
            Self::Day => 260.0 / 12.0,
            Self::Week => 52.0 / 12.0,
            Self::Month => 1.0,
            Self::Year => 1.0 / 12.0,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" => Some(Self::Hour),
            "day" | "daily" => Some(Self::Day),
            "week" | "weekly" => Some(Self::Week),
            "month" | "monthly" => Some(Self::Month),
            "year" | "yearly" | "annual" => Some(Self::Year),
            _ => None,
        }
    }
}

/// Bounds, currency and period as read from the salary text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSalary {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub currency: Option<Currency>,
    pub period: Option<PayPeriod>,
}

impl RawSalary {
    pub fn has_bounds(&self) -> bool {
        self.lower.is_some() || self.upper.is_some()
    }
}

/// Salary converted to the reporting currency and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSalary {
    pub lower: f64,
    pub upper: f64,
    pub currency: Currency,
    pub period: PayPeriod,
}

/// Version of the classification prompt/model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassifierVersion(pub u32);

/// Enrichment state of one ad. Owned one-to-one by the ad.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalaryRecord {
    pub ad_id: AdId,
    pub raw_text: Option<String>,
    pub raw: Option<RawSalary>,
    pub normalized: Option<NormalizedSalary>,
    pub normalization_status: ProcessingStatus,
    pub classification_status: ProcessingStatus,
    pub position_level: Option<PositionLevel>,
    pub classifier_version: Option<ClassifierVersion>,
    pub classification_attempts: u32,
    /// Why the last normalization failed. Cleared when it completes.
    pub normalization_error: Option<String>,
    /// Why the last classification failed. Cleared when it completes.
    pub classification_error: Option<String>,
}

impl SalaryRecord {
    pub fn new(ad_id: AdId, raw_text: Option<String>) -> Self {
        Self {
            ad_id,
            raw_text,
            raw: None,
            normalized: None,
            normalization_status: ProcessingStatus::NotStarted,
            classification_status: ProcessingStatus::NotStarted,
            position_level: None,
            classifier_version: None,
            classification_attempts: 0,
            normalization_error: None,
            classification_error: None,
        }
    }
}

/// Version of the vectorization parameters. Bumped whenever any parameter changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelVersion(pub u32);

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShingleUnit {
    #[default]
    Chars,
    Tokens,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("hash_function_count {hashes} is not divisible by lsh_band_count {bands}")]
    UnevenBands { hashes: usize, bands: usize },
}

/// Immutable vectorization configuration every MinHash/LSH/TF-IDF artifact is tagged with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorizationModelParams {
    pub version: ModelVersion,
    pub shingle_size: usize,
    pub shingle_unit: ShingleUnit,
    pub hash_function_count: usize,
    pub minhash_seed: u64,
    pub lsh_band_count: usize,
    pub vocabulary_size: usize,
}

impl Default for VectorizationModelParams {
    fn default() -> Self {
        Self {
            version: ModelVersion(1),
            shingle_size: 5,
            shingle_unit: ShingleUnit::Chars,
            hash_function_count: 100,
            minhash_seed: 0x5EED_0AD5,
            lsh_band_count: 20,
            vocabulary_size: 50_000,
        }
    }
}

impl VectorizationModelParams {
    pub fn rows_per_band(&self) -> usize {
        self.hash_function_count / self.lsh_band_count.max(1)
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.shingle_size == 0 {
            return Err(ParamsError::Zero("shingle_size"));
        }
        if self.hash_function_count == 0 {
            return Err(ParamsError::Zero("hash_function_count"));
        }
        if self.lsh_band_count == 0 {
            return Err(ParamsError::Zero("lsh_band_count"));
        }
        if self.vocabulary_size == 0 {
            return Err(ParamsError::Zero("vocabulary_size"));
        }
        if self.hash_function_count % self.lsh_band_count != 0 {
            return Err(ParamsError::UnevenBands {
                hashes: self.hash_function_count,
                bands: self.lsh_band_count,
            });
        }
        Ok(())
    }
}

/// A derived artifact stamped with the model version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: ModelVersion,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn new(version: ModelVersion, value: T) -> Self {
        Self { version, value }
    }

    pub fn is_current(&self, params: &VectorizationModelParams) -> bool {
        self.version == params.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid_and_band_evenly() {
        let params = VectorizationModelParams::default();
        assert_eq!(params.validate(), Ok(()));
        assert_eq!(params.rows_per_band(), 5);
        assert_eq!(params.minhash_seed, 0x5EED_0AD5);
    }

    #[test]
    fn uneven_bands_are_rejected() {
        let params = VectorizationModelParams {
            hash_function_count: 100,
            lsh_band_count: 30,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(ParamsError::UnevenBands { hashes: 100, bands: 30 })
        );
    }

    #[test]
    fn currency_codes_map_both_ways() {
        for currency in Currency::ALL {
            let code = currency.code();
            assert_eq!(serde_json::to_string(&currency).unwrap(), format!("\"{code}\""));
            assert_eq!(Currency::from_code(&code.to_ascii_lowercase()), Some(currency));
        }
        assert_eq!(Currency::from_code("XYZ"), None);
        assert_eq!(serde_json::to_string(&Currency::Rub).unwrap(), "\"RUB\"");
    }

    #[test]
    fn stack_ids_are_deterministic_per_founder() {
        assert_eq!(StackId::for_founder(AdId(7)), StackId::for_founder(AdId(7)));
        assert_ne!(StackId::for_founder(AdId(7)), StackId::for_founder(AdId(8)));
        assert_ne!(StackId::for_founder(AdId(7)), StackId::derive(AdId(7), 1));
    }

    #[test]
    fn only_not_started_and_failed_are_pending() {
        assert!(ProcessingStatus::NotStarted.is_pending());
        assert!(ProcessingStatus::Failed.is_pending());
        assert!(!ProcessingStatus::InProgress.is_pending());
        assert!(!ProcessingStatus::Completed.is_pending());
    }

    #[test]
    fn versioned_artifacts_compare_against_active_params() {
        let params = VectorizationModelParams::default();
        assert!(Versioned::new(ModelVersion(1), ()).is_current(&params));
        assert!(!Versioned::new(ModelVersion(0), ()).is_current(&params));
    }
}
