//! Salary text parsing and normalization to a reporting currency and monthly period.

use std::collections::BTreeMap;
use std::path::Path;

use adstack_core::{
    Currency, NormalizedSalary, PayPeriod, ProcessingStatus, RawSalary, SalaryRecord,
};
use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "adstack-salary";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SalaryError {
    #[error("no amount found in salary text {0:?}")]
    Unparseable(String),
    #[error("salary has neither a lower nor an upper bound")]
    NoBounds,
    #[error("salary currency is missing or unrecognized")]
    MissingCurrency,
    #[error("salary period is missing or unrecognized")]
    MissingPeriod,
    #[error("no {currency} rate available for {on}")]
    NoRate { currency: Currency, on: NaiveDate },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
struct Amount {
    value: f64,
    multiplier: f64,
    start: usize,
}

impl Amount {
    fn scaled(&self) -> f64 {
        self.value * self.multiplier
    }
}

fn is_group_separator(c: char) -> bool {
    matches!(c, ',' | '.' | ' ' | '\'' | '\u{a0}' | '\u{202f}')
}

/// Exactly three digits start at `at`, not followed by a fourth.
fn is_digit_group(chars: &[char], at: usize) -> bool {
    let group = chars.get(at..at + 3);
    group.is_some_and(|g| g.iter().all(char::is_ascii_digit))
        && !chars.get(at + 3).is_some_and(char::is_ascii_digit)
}

fn word_at(chars: &[char], mut at: usize) -> String {
    if chars.get(at).is_some_and(|c| *c == ' ' || *c == '\u{a0}') {
        at += 1;
    }
    chars[at.min(chars.len())..]
        .iter()
        .take_while(|c| c.is_alphabetic())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn multiplier_for(word: &str) -> f64 {
    match word {
        "k" | "к" | "тыс" | "thousand" | "тысяч" | "тысячи" => 1_000.0,
        "mln" | "млн" | "million" => 1_000_000.0,
        _ => 1.0,
    }
}

fn extract_amounts(chars: &[char]) -> Vec<Amount> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        // Digits glued to letters ("b2", "5g") are not amounts.
        if i > 0 && chars[i - 1].is_alphabetic() {
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            continue;
        }

        let start = i;
        let mut digits = String::new();
        let mut fraction = String::new();
        while i < chars.len() {
            let c = chars[i];
            if c.is_ascii_digit() {
                digits.push(c);
                i += 1;
            } else if is_group_separator(c) && is_digit_group(chars, i + 1) {
                i += 1;
            } else if (c == '.' || c == ',') && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    fraction.push(chars[i]);
                    i += 1;
                }
                break;
            } else {
                break;
            }
        }

        let literal = if fraction.is_empty() {
            digits
        } else {
            format!("{digits}.{fraction}")
        };
        if let Ok(value) = literal.parse::<f64>() {
            out.push(Amount {
                value,
                multiplier: multiplier_for(&word_at(chars, i)),
                start,
            });
        }
    }
    out
}

/// Alphabetic words (lower-cased) and currency symbols, in reading order.
fn lexemes(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut word = String::new();
    for c in text.chars() {
        if c.is_alphabetic() {
            word.extend(c.to_lowercase());
            continue;
        }
        if !word.is_empty() {
            out.push(std::mem::take(&mut word));
        }
        if matches!(c, '$' | '€' | '£' | '₽' | '₸' | '₴') {
            out.push(c.to_string());
        }
    }
    if !word.is_empty() {
        out.push(word);
    }
    out
}

fn currency_for(lexeme: &str) -> Option<Currency> {
    let currency = match lexeme {
        "$" | "usd" | "dollar" | "dollars" | "долл" | "доллар" | "долларов" | "доллара" => {
            Currency::Usd
        }
        "€" | "eur" | "euro" | "euros" | "евро" => Currency::Eur,
        "£" | "gbp" | "pound" | "pounds" => Currency::Gbp,
        "₽" | "rub" | "rur" | "р" | "руб" | "рубль" | "рублей" | "рубля" => Currency::Rub,
        "₸" | "kzt" | "tenge" | "тенге" | "тг" => Currency::Kzt,
        "₴" | "uah" | "hryvnia" | "грн" | "гривна" | "гривен" => Currency::Uah,
        "byn" | "бел" => Currency::Byn,
        _ => return None,
    };
    Some(currency)
}

fn period_for(lexeme: &str) -> Option<PayPeriod> {
    let period = match lexeme {
        "h" | "hr" | "hrs" | "hour" | "hourly" | "ч" | "час" | "часа" => PayPeriod::Hour,
        "day" | "daily" | "день" | "дн" | "сутки" | "смена" | "смену" => PayPeriod::Day,
        "wk" | "week" | "weekly" | "нед" | "неделя" | "неделю" => PayPeriod::Week,
        "mo" | "mon" | "mth" | "month" | "monthly" | "мес" | "месяц" | "месяца" => {
            PayPeriod::Month
        }
        "yr" | "year" | "yearly" | "annual" | "annually" | "annum" | "год" | "года"
        | "годовых" => PayPeriod::Year,
        _ => return None,
    };
    Some(period)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qualifier {
    From,
    UpTo,
}

fn qualifier_before(chars: &[char], at: usize) -> Option<Qualifier> {
    let prefix: String = chars[..at].iter().collect();
    let last = lexemes(&prefix)
        .into_iter()
        .rev()
        .find(|l| l.chars().all(char::is_alphabetic))?;
    match last.as_str() {
        "от" | "from" | "starting" | "min" | "minimum" => Some(Qualifier::From),
        "до" | "to" | "upto" | "max" | "maximum" => Some(Qualifier::UpTo),
        _ => None,
    }
}

/// Reads `(lower?, upper?, currency?, period?)` out of a salary snippet.
///
/// A single unqualified amount is a point (both bounds); "from X" / "up to X"
/// set only the matching bound. A shared suffix such as `80-100k` scales both.
pub fn parse_salary(text: &str) -> Result<RawSalary, SalaryError> {
    let chars: Vec<char> = text.chars().collect();
    let amounts = extract_amounts(&chars);

    let (lower, upper) = match amounts.as_slice() {
        [] => return Err(SalaryError::Unparseable(text.to_string())),
        [single] => {
            let value = single.scaled();
            match qualifier_before(&chars, single.start) {
                Some(Qualifier::From) => (Some(value), None),
                Some(Qualifier::UpTo) => (None, Some(value)),
                None => (Some(value), Some(value)),
            }
        }
        [first, second, ..] => {
            let mut a = first.scaled();
            let b = second.scaled();
            if first.multiplier == 1.0
                && second.multiplier > 1.0
                && first.value * second.multiplier <= b
            {
                a = first.value * second.multiplier;
            }
            (Some(a.min(b)), Some(a.max(b)))
        }
    };

    let lexemes = lexemes(text);
    Ok(RawSalary {
        lower,
        upper,
        currency: lexemes.iter().find_map(|l| currency_for(l)),
        period: lexemes.iter().find_map(|l| period_for(l)),
    })
}

// ---------------------------------------------------------------------------
// Rates
// ---------------------------------------------------------------------------

/// Conversion rates into the reporting currency: reporting units per one unit of `currency`.
pub trait RateTable: Send + Sync {
    fn rate(&self, currency: Currency, on: NaiveDate) -> Option<f64>;
}

#[derive(Debug, Clone, Deserialize)]
struct RatesFile {
    reporting_currency: Currency,
    #[serde(default)]
    rates: Vec<RateEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct RateEntry {
    currency: Currency,
    from: NaiveDate,
    rate: f64,
}

/// Rate table loaded from YAML; each rate applies from its date until the next one.
#[derive(Debug, Clone, Default)]
pub struct StaticRateTable {
    reporting: Option<Currency>,
    rates: BTreeMap<Currency, BTreeMap<NaiveDate, f64>>,
}

impl StaticRateTable {
    pub fn new(reporting: Currency) -> Self {
        Self {
            reporting: Some(reporting),
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, currency: Currency, from: NaiveDate, rate: f64) -> Self {
        self.rates.entry(currency).or_default().insert(from, rate);
        self
    }

    pub fn reporting_currency(&self) -> Option<Currency> {
        self.reporting
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: RatesFile = serde_yaml::from_str(text).context("parsing rate table")?;
        let mut table = Self::new(file.reporting_currency);
        for entry in file.rates {
            anyhow::ensure!(
                entry.rate.is_finite() && entry.rate > 0.0,
                "rate for {} from {} must be positive",
                entry.currency,
                entry.from
            );
            table = table.with_rate(entry.currency, entry.from, entry.rate);
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

impl RateTable for StaticRateTable {
    fn rate(&self, currency: Currency, on: NaiveDate) -> Option<f64> {
        if self.reporting == Some(currency) {
            return Some(1.0);
        }
        self.rates
            .get(&currency)?
            .range(..=on)
            .next_back()
            .map(|(_, rate)| *rate)
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerConfig {
    pub reporting_currency: Currency,
    /// Period assumed when the text names none or one the parser does not
    /// know. Unset by default, so such records fail.
    pub default_period: Option<PayPeriod>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            reporting_currency: Currency::Usd,
            default_period: None,
        }
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct SalaryNormalizer<R> {
    config: NormalizerConfig,
    rates: R,
}

impl<R: RateTable> SalaryNormalizer<R> {
    pub fn new(config: NormalizerConfig, rates: R) -> Self {
        Self { config, rates }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Converts parsed bounds into monthly amounts in the reporting currency.
    ///
    /// A missing bound takes the value of the present one.
    pub fn normalize(&self, raw: &RawSalary, on: NaiveDate) -> Result<NormalizedSalary, SalaryError> {
        let (lower, upper) = match (raw.lower, raw.upper) {
            (Some(lower), Some(upper)) => (lower, upper),
            (Some(point), None) | (None, Some(point)) => (point, point),
            (None, None) => return Err(SalaryError::NoBounds),
        };
        let currency = raw.currency.ok_or(SalaryError::MissingCurrency)?;
        let period = raw
            .period
            .or(self.config.default_period)
            .ok_or(SalaryError::MissingPeriod)?;
        let rate = if currency == self.config.reporting_currency {
            1.0
        } else {
            self.rates
                .rate(currency, on)
                .ok_or(SalaryError::NoRate { currency, on })?
        };
        let factor = rate * period.monthly_factor();
        Ok(NormalizedSalary {
            lower: round_cents(lower * factor),
            upper: round_cents(upper * factor),
            currency: self.config.reporting_currency,
            period: PayPeriod::Month,
        })
    }

    /// Parses and normalizes one record, committing all fields together.
    ///
    /// Records without salary text complete with no normalized value.
    pub fn process(&self, record: &mut SalaryRecord, on: NaiveDate) -> ProcessingStatus {
        let outcome = match record.raw_text.as_deref() {
            None => Ok((None, None)),
            Some(text) => match parse_salary(text) {
                Ok(raw) => match self.normalize(&raw, on) {
                    Ok(normalized) => Ok((Some(raw), Some(normalized))),
                    Err(err) => Err((Some(raw), err)),
                },
                Err(err) => Err((None, err)),
            },
        };

        match outcome {
            Ok((raw, normalized)) => {
                record.raw = raw;
                record.normalized = normalized;
                record.normalization_status = ProcessingStatus::Completed;
                record.normalization_error = None;
            }
            Err((raw, err)) => {
                debug!(ad_id = %record.ad_id, error = %err, "salary normalization failed");
                record.raw = raw;
                record.normalized = None;
                record.normalization_status = ProcessingStatus::Failed;
                record.normalization_error = Some(err.to_string());
            }
        }
        record.normalization_status
    }
}
