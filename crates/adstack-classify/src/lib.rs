//! Position-level classification: a bounded worker pool around an external
//! classifier, with per-call timeouts, exponential backoff and a per-record
//! status machine (`NotStarted -> InProgress -> Completed | Failed`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adstack_core::{AdId, ClassifierVersion, PositionLevel, ProcessingStatus, SalaryRecord};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "adstack-classify";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("classifier call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient classifier failure: {0}")]
    Transient(String),
    #[error("classifier rejected the request: {0}")]
    Rejected(String),
    #[error("worker pool closed")]
    PoolClosed,
}

impl ClassifyError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout(_) | Self::Transient(_) => RetryDisposition::Retryable,
            Self::Rejected(_) | Self::PoolClosed => RetryDisposition::NonRetryable,
        }
    }
}

/// External classification collaborator: `(ad text) -> PositionLevel | failure`.
#[async_trait]
pub trait PositionClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<PositionLevel, ClassifyError>;
}

#[async_trait]
impl<T: PositionClassifier + ?Sized> PositionClassifier for Arc<T> {
    async fn classify(&self, text: &str) -> Result<PositionLevel, ClassifyError> {
        (**self).classify(text).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub version: ClassifierVersion,
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            version: ClassifierVersion(1),
            concurrency: 4,
            call_timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Whether a record must be (re-)submitted under the `current` classifier version.
///
/// `InProgress` only survives an interrupted process, so it is picked up again too.
pub fn needs_classification(record: &SalaryRecord, current: ClassifierVersion) -> bool {
    match record.classification_status {
        ProcessingStatus::NotStarted | ProcessingStatus::Failed | ProcessingStatus::InProgress => {
            true
        }
        ProcessingStatus::Completed => record.classifier_version != Some(current),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationSummary {
    pub eligible: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
    pub calls: u32,
    pub cancelled: bool,
}

#[derive(Debug)]
struct Outcome {
    ad_id: AdId,
    result: Result<PositionLevel, ClassifyError>,
    attempts: u32,
}

async fn classify_with_retry<C: PositionClassifier + ?Sized>(
    classifier: &C,
    text: &str,
    call_timeout: Duration,
    backoff: BackoffPolicy,
) -> (Result<PositionLevel, ClassifyError>, u32) {
    let max_attempts = backoff.max_attempts.max(1);
    let mut last_error = ClassifyError::Transient("no attempt made".to_string());

    for attempt in 0..max_attempts {
        let result = match tokio::time::timeout(call_timeout, classifier.classify(text)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifyError::Timeout(call_timeout)),
        };
        match result {
            Ok(level) => return (Ok(level), attempt + 1),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt + 1 < max_attempts =>
            {
                warn!(attempt = attempt + 1, error = %err, "classifier call failed; backing off");
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                last_error = err;
            }
            Err(err) => return (Err(err), attempt + 1),
        }
    }
    (Err(last_error), max_attempts)
}

/// Drives classification for a batch of records.
///
/// Calls run on a `JoinSet` capped by a semaphore; completed outcomes advance
/// each record's status. Cancellation aborts outstanding calls and restores
/// their records to the status they had before the run.
pub struct ClassificationOrchestrator<C> {
    classifier: Arc<C>,
    config: ClassifierConfig,
}

impl<C: PositionClassifier + 'static> ClassificationOrchestrator<C> {
    pub fn new(classifier: Arc<C>, config: ClassifierConfig) -> Self {
        Self { classifier, config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub async fn run(
        &self,
        work: Vec<(&mut SalaryRecord, &str)>,
        cancel: &CancellationToken,
    ) -> ClassificationSummary {
        let mut summary = ClassificationSummary::default();
        let version = self.config.version;

        let mut pending: Vec<(&mut SalaryRecord, &str)> = Vec::with_capacity(work.len());
        for (record, text) in work {
            if needs_classification(record, version) {
                pending.push((record, text));
            } else {
                summary.skipped += 1;
            }
        }
        summary.eligible = pending.len();

        let mut prior: HashMap<AdId, ProcessingStatus> = HashMap::new();
        let mut position: HashMap<AdId, usize> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, (record, text)) in pending.iter_mut().enumerate() {
            let ad_id = record.ad_id;
            let previous = match record.classification_status {
                ProcessingStatus::InProgress => ProcessingStatus::NotStarted,
                status => status,
            };
            prior.insert(ad_id, previous);
            position.insert(ad_id, index);
            record.classification_status = ProcessingStatus::InProgress;

            let classifier = Arc::clone(&self.classifier);
            let semaphore = Arc::clone(&semaphore);
            let text = text.to_string();
            let call_timeout = self.config.call_timeout;
            let backoff = self.config.backoff;
            tasks.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Outcome {
                            ad_id,
                            result: Err(ClassifyError::PoolClosed),
                            attempts: 0,
                        };
                    };
                    let (result, attempts) =
                        classify_with_retry(classifier.as_ref(), &text, call_timeout, backoff)
                            .await;
                    Outcome {
                        ad_id,
                        result,
                        attempts,
                    }
                }
                .instrument(info_span!("classify", %ad_id, version = version.0)),
            );
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    summary.cancelled = true;
                    break;
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            warn!(error = %err, "classification task did not finish");
                            continue;
                        }
                    };
                    let Some(&index) = position.get(&outcome.ad_id) else { continue };
                    let record = &mut *pending[index].0;
                    summary.calls += outcome.attempts;
                    record.classification_attempts += outcome.attempts;
                    match outcome.result {
                        Ok(level) => {
                            record.classification_status = ProcessingStatus::Completed;
                            record.position_level = Some(level);
                            record.classifier_version = Some(version);
                            record.classification_error = None;
                            summary.completed += 1;
                        }
                        Err(err) => {
                            warn!(ad_id = %outcome.ad_id, error = %err, "classification failed");
                            record.classification_status = ProcessingStatus::Failed;
                            record.classification_error = Some(err.to_string());
                            summary.failed += 1;
                        }
                    }
                }
            }
        }

        // Anything still in flight goes back to where it was.
        for (record, _) in pending.iter_mut() {
            if record.classification_status == ProcessingStatus::InProgress {
                record.classification_status = prior
                    .get(&record.ad_id)
                    .copied()
                    .unwrap_or(ProcessingStatus::NotStarted);
            }
        }

        info!(
            eligible = summary.eligible,
            skipped = summary.skipped,
            completed = summary.completed,
            failed = summary.failed,
            calls = summary.calls,
            cancelled = summary.cancelled,
            "classification run finished"
        );
        summary
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LevelRulesFile {
    version: u32,
    #[serde(default)]
    rules: Vec<LevelRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelRule {
    pub level: PositionLevel,
    pub contains_any: Vec<String>,
}

/// Offline keyword classifier. The first rule with a matching needle wins;
/// no match answers [`PositionLevel::Unknown`].
///
/// Needles match whole words, so `intern` does not fire on `international`.
/// A trailing `*` lets the last word of a needle match as a prefix, which
/// covers inflected forms such as `стажёр*` for `стажёра`.
#[derive(Debug, Clone)]
pub struct RuleBasedClassifier {
    version: ClassifierVersion,
    rules: Vec<LevelRule>,
}

impl Default for RuleBasedClassifier {
    fn default() -> Self {
        let rule = |level, needles: &[&str]| LevelRule {
            level,
            contains_any: needles.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            version: ClassifierVersion(1),
            rules: vec![
                rule(PositionLevel::Head, &["head of", "cto", "vp of", "director", "руководител*"]),
                rule(PositionLevel::Lead, &["team lead", "teamlead", "tech lead", "тимлид*", "лид"]),
                rule(PositionLevel::Senior, &["senior", "сеньор*", "синьор*", "ведущ*"]),
                rule(PositionLevel::Middle, &["middle", "мидл*"]),
                rule(PositionLevel::Junior, &["junior", "джун*", "младш*"]),
                rule(
                    PositionLevel::Intern,
                    &["intern", "interns", "internship", "стажер*", "стажёр*", "стажировк*"],
                ),
            ],
        }
    }
}

impl RuleBasedClassifier {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: LevelRulesFile = serde_yaml::from_str(text).context("parsing level rules")?;
        Ok(Self {
            version: ClassifierVersion(file.version),
            rules: file.rules,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Rule files carry their own version so edits trigger reclassification.
    pub fn version(&self) -> ClassifierVersion {
        self.version
    }

    pub fn level_for(&self, text: &str) -> PositionLevel {
        let words = words(text);
        self.rules
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| needle_matches(&words, needle))
            })
            .map(|rule| rule.level)
            .unwrap_or(PositionLevel::Unknown)
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn needle_matches(haystack: &[String], needle: &str) -> bool {
    let needle = needle.trim();
    let (body, prefix) = match needle.strip_suffix('*') {
        Some(body) => (body, true),
        None => (needle, false),
    };
    let parts = words(body);
    if parts.is_empty() || parts.len() > haystack.len() {
        return false;
    }
    let last = parts.len() - 1;
    haystack.windows(parts.len()).any(|window| {
        window.iter().zip(&parts).enumerate().all(|(i, (word, part))| {
            if prefix && i == last {
                word.starts_with(part.as_str())
            } else {
                word == part
            }
        })
    })
}

#[async_trait]
impl PositionClassifier for RuleBasedClassifier {
    async fn classify(&self, text: &str) -> Result<PositionLevel, ClassifyError> {
        Ok(self.level_for(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Hangs for the first `hang_for` calls, then answers `level`.
    struct ScriptedClassifier {
        hang_for: u32,
        level: PositionLevel,
        calls: AtomicU32,
        texts: Mutex<Vec<String>>,
    }

    impl ScriptedClassifier {
        fn new(hang_for: u32, level: PositionLevel) -> Arc<Self> {
            Arc::new(Self {
                hang_for,
                level,
                calls: AtomicU32::new(0),
                texts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PositionClassifier for ScriptedClassifier {
        async fn classify(&self, text: &str) -> Result<PositionLevel, ClassifyError> {
            self.texts.lock().unwrap().push(text.to_string());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.hang_for {
                std::future::pending::<()>().await;
            }
            if text.contains("reject") {
                return Err(ClassifyError::Rejected("unsupported".into()));
            }
            Ok(self.level)
        }
    }

    fn config(version: u32) -> ClassifierConfig {
        ClassifierConfig {
            version: ClassifierVersion(version),
            concurrency: 2,
            call_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            },
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn eligibility_follows_status_and_version() {
        let mut record = SalaryRecord::new(AdId(1), None);
        assert!(needs_classification(&record, ClassifierVersion(1)));
        record.classification_status = ProcessingStatus::Completed;
        record.classifier_version = Some(ClassifierVersion(1));
        assert!(!needs_classification(&record, ClassifierVersion(1)));
        assert!(needs_classification(&record, ClassifierVersion(2)));
        record.classification_status = ProcessingStatus::Failed;
        assert!(needs_classification(&record, ClassifierVersion(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn three_timeouts_fail_then_next_run_completes() {
        let mut stuck = SalaryRecord::new(AdId(1), None);
        let mut done = SalaryRecord::new(AdId(2), None);
        done.classification_status = ProcessingStatus::Completed;
        done.classifier_version = Some(ClassifierVersion(1));
        done.position_level = Some(PositionLevel::Senior);
        let cancel = CancellationToken::new();

        let hanging = ScriptedClassifier::new(3, PositionLevel::Middle);
        let orchestrator = ClassificationOrchestrator::new(hanging.clone(), config(1));
        let summary = orchestrator
            .run(vec![(&mut stuck, "middle dev"), (&mut done, "senior dev")], &cancel)
            .await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.calls, 3);
        assert_eq!(stuck.classification_status, ProcessingStatus::Failed);
        assert_eq!(stuck.classification_attempts, 3);
        assert!(stuck.classification_error.as_deref().unwrap().contains("timed out"));
        assert!(stuck.normalization_error.is_none());

        let healthy = ScriptedClassifier::new(0, PositionLevel::Middle);
        let orchestrator = ClassificationOrchestrator::new(healthy.clone(), config(1));
        let summary = orchestrator
            .run(vec![(&mut stuck, "middle dev"), (&mut done, "senior dev")], &cancel)
            .await;
        assert_eq!(summary.completed, 1);
        assert_eq!(stuck.classification_status, ProcessingStatus::Completed);
        assert_eq!(stuck.position_level, Some(PositionLevel::Middle));
        assert_eq!(stuck.classifier_version, Some(ClassifierVersion(1)));
        assert_eq!(stuck.classification_error, None);
        assert_eq!(*healthy.texts.lock().unwrap(), vec!["middle dev".to_string()]);
        assert_eq!(done.position_level, Some(PositionLevel::Senior));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_calls_are_not_retried() {
        let mut record = SalaryRecord::new(AdId(1), None);
        let classifier = ScriptedClassifier::new(0, PositionLevel::Junior);
        let orchestrator = ClassificationOrchestrator::new(classifier.clone(), config(1));
        let summary = orchestrator
            .run(vec![(&mut record, "please reject")], &CancellationToken::new())
            .await;
        assert_eq!(summary.calls, 1);
        assert_eq!(record.classification_status, ProcessingStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn version_bump_resubmits_completed_records() {
        let mut record = SalaryRecord::new(AdId(1), None);
        record.classification_status = ProcessingStatus::Completed;
        record.classifier_version = Some(ClassifierVersion(1));
        record.position_level = Some(PositionLevel::Junior);

        let classifier = ScriptedClassifier::new(0, PositionLevel::Middle);
        let orchestrator = ClassificationOrchestrator::new(classifier, config(2));
        let summary = orchestrator
            .run(vec![(&mut record, "middle dev")], &CancellationToken::new())
            .await;
        assert_eq!(summary.completed, 1);
        assert_eq!(record.position_level, Some(PositionLevel::Middle));
        assert_eq!(record.classifier_version, Some(ClassifierVersion(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_restores_prior_status() {
        let mut fresh = SalaryRecord::new(AdId(1), None);
        let mut retried = SalaryRecord::new(AdId(2), None);
        retried.classification_status = ProcessingStatus::Failed;

        let classifier = ScriptedClassifier::new(u32::MAX, PositionLevel::Lead);
        let orchestrator = ClassificationOrchestrator::new(classifier, config(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = orchestrator
            .run(vec![(&mut fresh, "a"), (&mut retried, "b")], &cancel)
            .await;
        assert!(summary.cancelled);
        assert_eq!(fresh.classification_status, ProcessingStatus::NotStarted);
        assert_eq!(retried.classification_status, ProcessingStatus::Failed);
        assert!(fresh.position_level.is_none());
    }

    #[tokio::test]
    async fn rule_classifier_picks_first_matching_level() {
        let classifier = RuleBasedClassifier::default();
        assert_eq!(
            classifier.classify("Senior Rust developer, team lead role").await,
            Ok(PositionLevel::Lead)
        );
        assert_eq!(classifier.classify("ищем стажёра в отдел").await, Ok(PositionLevel::Intern));
        assert_eq!(classifier.classify("barista wanted").await, Ok(PositionLevel::Unknown));

        let custom = RuleBasedClassifier::from_yaml_str(
            "version: 3\nrules:\n  - level: junior\n    contains_any: [\"graduate\"]\n",
        )
        .unwrap();
        assert_eq!(custom.version(), ClassifierVersion(3));
        assert_eq!(custom.level_for("Graduate programme"), PositionLevel::Junior);
    }

    #[test]
    fn rule_needles_match_whole_words() {
        let classifier = RuleBasedClassifier::default();
        assert_eq!(
            classifier.level_for("python contractor for data pipelines"),
            PositionLevel::Unknown
        );
        assert_eq!(
            classifier.level_for("international logistics company hiring a dispatcher"),
            PositionLevel::Unknown
        );
        assert_eq!(classifier.level_for("internal tools developer"), PositionLevel::Unknown);
        assert_eq!(classifier.level_for("summer internship, interns welcome"), PositionLevel::Intern);
        assert_eq!(classifier.level_for("CTO / co-founder"), PositionLevel::Head);
        assert_eq!(classifier.level_for("Head of Data"), PositionLevel::Head);
        assert_eq!(classifier.level_for("ищем руководителя отдела"), PositionLevel::Head);
        assert_eq!(classifier.level_for("мидлы и сеньоры"), PositionLevel::Senior);
    }
}
