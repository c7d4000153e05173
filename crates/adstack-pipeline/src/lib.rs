//! Batch pipeline over job ads.
//!
//! One run ingests new drafts, clusters them into stacks of near-duplicates,
//! normalizes salaries and classifies positions for the unique ads. The
//! [`ModelVersionManager`] owns the active vectorization parameters; every
//! stored signature is stamped with the version that produced it and is
//! recomputed on access once that version goes stale.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use adstack_classify::{
    BackoffPolicy, ClassificationOrchestrator, ClassificationSummary, ClassifierConfig,
    PositionClassifier,
};
use adstack_core::{
    Ad, AdDraft, AdId, ClassifierVersion, Currency, ModelVersion, ParamsError, PayPeriod,
    ProcessingStatus, SalaryRecord, ShingleUnit, Stack, VectorizationModelParams, Versioned,
};
use adstack_dedup::{
    verify_stacks, ClusterError, ClusterMember, DuplicateClusterer, MinHashSignature,
    MinHashSigner, Shingler,
};
use adstack_salary::{NormalizerConfig, RateTable, SalaryNormalizer};
use adstack_tfidf::{DocumentFrequency, IdfTable, TermFrequency, TfIdfScorer};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adstack-pipeline";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub params: VectorizationModelParams,
    /// Relative corpus growth after which the IDF table is rebuilt.
    pub idf_drift: f64,
    pub normalizer: NormalizerConfig,
    pub classifier: ClassifierConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            params: VectorizationModelParams::default(),
            idf_drift: 0.10,
            normalizer: NormalizerConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Decimal, or hex with a `0x` prefix. Underscores are ignored.
fn parse_seed(value: &str) -> Option<u64> {
    let value = value.trim().replace('_', "");
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] over an arbitrary key lookup.
    /// Unset or unparseable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let base = defaults.params;

        let shingle_unit = match lookup("ADSTACK_SHINGLE_UNIT") {
            Some(unit) => match unit.trim().to_ascii_lowercase().as_str() {
                "tokens" | "token" | "words" => ShingleUnit::Tokens,
                "chars" | "char" | "characters" => ShingleUnit::Chars,
                _ => base.shingle_unit,
            },
            None => base.shingle_unit,
        };
        let params = VectorizationModelParams {
            version: ModelVersion(parse_or(&lookup, "ADSTACK_MODEL_VERSION", base.version.0)),
            shingle_size: parse_or(&lookup, "ADSTACK_SHINGLE_SIZE", base.shingle_size),
            shingle_unit,
            hash_function_count: parse_or(
                &lookup,
                "ADSTACK_HASH_FUNCTIONS",
                base.hash_function_count,
            ),
            minhash_seed: lookup("ADSTACK_MINHASH_SEED")
                .and_then(|seed| parse_seed(&seed))
                .unwrap_or(base.minhash_seed),
            lsh_band_count: parse_or(&lookup, "ADSTACK_LSH_BANDS", base.lsh_band_count),
            vocabulary_size: parse_or(&lookup, "ADSTACK_VOCABULARY_SIZE", base.vocabulary_size),
        };

        let default_period = match lookup("ADSTACK_DEFAULT_PERIOD") {
            Some(period) if period.trim().eq_ignore_ascii_case("none") => None,
            Some(period) => PayPeriod::from_label(&period).or(defaults.normalizer.default_period),
            None => defaults.normalizer.default_period,
        };
        let normalizer = NormalizerConfig {
            reporting_currency: lookup("ADSTACK_REPORTING_CURRENCY")
                .and_then(|code| Currency::from_code(&code))
                .unwrap_or(defaults.normalizer.reporting_currency),
            default_period,
        };

        let classifier = ClassifierConfig {
            version: ClassifierVersion(parse_or(
                &lookup,
                "ADSTACK_CLASSIFIER_VERSION",
                defaults.classifier.version.0,
            )),
            concurrency: parse_or(
                &lookup,
                "ADSTACK_CLASSIFIER_CONCURRENCY",
                defaults.classifier.concurrency,
            ),
            call_timeout: Duration::from_secs(parse_or(
                &lookup,
                "ADSTACK_CLASSIFIER_TIMEOUT_SECS",
                defaults.classifier.call_timeout.as_secs(),
            )),
            backoff: BackoffPolicy {
                max_attempts: parse_or(
                    &lookup,
                    "ADSTACK_CLASSIFIER_MAX_ATTEMPTS",
                    defaults.classifier.backoff.max_attempts,
                ),
                ..defaults.classifier.backoff
            },
        };

        Self {
            params,
            idf_drift: parse_or(&lookup, "ADSTACK_IDF_DRIFT", defaults.idf_drift),
            normalizer,
            classifier,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid vectorization parameters: {0}")]
    Params(#[from] ParamsError),
    #[error("vectorization parameters changed but the model version stayed at {0}")]
    UnbumpedParams(ModelVersion),
    #[error("clustering state is inconsistent: {0}")]
    Cluster(#[from] ClusterError),
}

// ---------------------------------------------------------------------------
// Model versions and derived artifacts
// ---------------------------------------------------------------------------

/// Holds the active [`VectorizationModelParams`] and the primitives built from them.
#[derive(Debug, Clone)]
pub struct ModelVersionManager {
    params: VectorizationModelParams,
    shingler: Shingler,
    signer: MinHashSigner,
}

impl ModelVersionManager {
    pub fn new(params: VectorizationModelParams) -> Result<Self, ParamsError> {
        params.validate()?;
        Ok(Self {
            shingler: Shingler::from_params(&params),
            signer: MinHashSigner::from_params(&params),
            params,
        })
    }

    pub fn params(&self) -> &VectorizationModelParams {
        &self.params
    }

    pub fn version(&self) -> ModelVersion {
        self.params.version
    }

    pub fn stamp<T>(&self, value: T) -> Versioned<T> {
        Versioned::new(self.params.version, value)
    }

    pub fn is_stale<T>(&self, artifact: &Versioned<T>) -> bool {
        !artifact.is_current(&self.params)
    }

    pub fn signature(&self, text: &str) -> Versioned<MinHashSignature> {
        self.stamp(self.signer.sign(&self.shingler.shingle(text)))
    }

    /// Switches to `params`. Returns whether the active version changed.
    ///
    /// Any parameter change must come with a new version, or artifacts built
    /// under the old values would pass as current.
    pub fn activate(&mut self, params: VectorizationModelParams) -> Result<bool, PipelineError> {
        params.validate()?;
        if params == self.params {
            return Ok(false);
        }
        if params.version == self.params.version {
            return Err(PipelineError::UnbumpedParams(params.version));
        }
        info!(
            from = %self.params.version,
            to = %params.version,
            "activating vectorization parameters"
        );
        *self = Self::new(params)?;
        Ok(true)
    }
}

/// Signature store keyed by ad. Entries under a stale version stay until
/// they are next needed, and are recomputed then.
#[derive(Debug, Clone, Default)]
pub struct ArtifactCache {
    signatures: HashMap<AdId, Versioned<MinHashSignature>>,
    recomputed: usize,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn insert(&mut self, ad: AdId, signature: Versioned<MinHashSignature>) {
        self.signatures.insert(ad, signature);
    }

    /// Stored signature, whatever its version.
    pub fn stored(&self, ad: AdId) -> Option<&Versioned<MinHashSignature>> {
        self.signatures.get(&ad)
    }

    pub fn stale(&self, manager: &ModelVersionManager) -> usize {
        self.signatures
            .values()
            .filter(|signature| manager.is_stale(signature))
            .count()
    }

    /// Stale signatures replaced over the cache's lifetime.
    pub fn recomputed(&self) -> usize {
        self.recomputed
    }

    /// Signature of `ad` under the active version, computed on access when missing or stale.
    pub fn current(
        &mut self,
        ad: &Ad,
        manager: &ModelVersionManager,
    ) -> &Versioned<MinHashSignature> {
        match self.signatures.entry(ad.id) {
            Entry::Occupied(mut entry) => {
                if manager.is_stale(entry.get()) {
                    debug!(ad_id = %ad.id, stale = %entry.get().version, "recomputing signature");
                    entry.insert(manager.signature(&ad.text));
                    self.recomputed += 1;
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(manager.signature(&ad.text)),
        }
    }

    /// Fills in missing or stale signatures for `ads` on the rayon pool.
    /// Returns how many stale signatures were replaced.
    pub fn prefetch<'a>(
        &mut self,
        ads: impl IntoIterator<Item = &'a Ad>,
        manager: &ModelVersionManager,
    ) -> usize {
        let todo: Vec<(&Ad, bool)> = ads
            .into_iter()
            .filter_map(|ad| match self.signatures.get(&ad.id) {
                Some(signature) if !manager.is_stale(signature) => None,
                Some(_) => Some((ad, true)),
                None => Some((ad, false)),
            })
            .collect();
        let computed: Vec<(AdId, bool, Versioned<MinHashSignature>)> = todo
            .par_iter()
            .map(|(ad, stale)| (ad.id, *stale, manager.signature(&ad.text)))
            .collect();

        let mut recomputed = 0usize;
        for (ad, stale, signature) in computed {
            if stale {
                recomputed += 1;
            }
            self.signatures.insert(ad, signature);
        }
        self.recomputed += recomputed;
        recomputed
    }

    pub fn entries(&self) -> impl Iterator<Item = (AdId, &Versioned<MinHashSignature>)> {
        self.signatures.iter().map(|(ad, signature)| (*ad, signature))
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignature {
    pub ad_id: AdId,
    pub signature: Versioned<MinHashSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenRichness {
    pub ad_id: AdId,
    pub richness: f64,
}

/// Persisted pipeline state: what ingestion and reporting layers read back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub model_version: ModelVersion,
    pub classifier_version: ClassifierVersion,
    pub ads: Vec<Ad>,
    pub stacks: Vec<Stack>,
    pub salary_records: Vec<SalaryRecord>,
    #[serde(default)]
    pub signatures: Vec<StoredSignature>,
    #[serde(default)]
    pub richness: Vec<FrozenRichness>,
}

impl PipelineSnapshot {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing snapshot {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing snapshot {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub not_started: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally(statuses: impl IntoIterator<Item = ProcessingStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                ProcessingStatus::NotStarted => counts.not_started += 1,
                ProcessingStatus::InProgress => counts.in_progress += 1,
                ProcessingStatus::Completed => counts.completed += 1,
                ProcessingStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.not_started + self.in_progress + self.completed + self.failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub model_version: ModelVersion,
    pub classifier_version: ClassifierVersion,
    pub ingested: usize,
    /// Drafts whose id was already known.
    pub skipped: usize,
    /// Whether every ad was re-clustered, after a version change or a restore.
    pub rebuilt: bool,
    pub signatures_recomputed: usize,
    pub idf_rebuilt: bool,
    pub new_stacks: usize,
    pub retired_stacks: usize,
    pub canonical_changes: usize,
    pub stacks_total: usize,
    pub unique_ads: usize,
    pub salary_processed: usize,
    pub salary: StatusCounts,
    pub classification: StatusCounts,
    pub classification_calls: u32,
    pub cancelled: bool,
}

impl BatchSummary {
    fn start(model_version: ModelVersion, classifier_version: ClassifierVersion) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            model_version,
            classifier_version,
            ingested: 0,
            skipped: 0,
            rebuilt: false,
            signatures_recomputed: 0,
            idf_rebuilt: false,
            new_stacks: 0,
            retired_stacks: 0,
            canonical_changes: 0,
            stacks_total: 0,
            unique_ads: 0,
            salary_processed: 0,
            salary: StatusCounts::default(),
            classification: StatusCounts::default(),
            classification_calls: 0,
            cancelled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn fatal(err: ClusterError) -> PipelineError {
    error!(error = %err, "aborting batch: stack invariants violated");
    PipelineError::Cluster(err)
}

pub struct AdPipeline<C, R> {
    config: PipelineConfig,
    manager: ModelVersionManager,
    cache: ArtifactCache,
    ads: BTreeMap<AdId, Ad>,
    records: BTreeMap<AdId, SalaryRecord>,
    terms: HashMap<AdId, TermFrequency>,
    df: DocumentFrequency,
    scorer: Option<TfIdfScorer>,
    /// Richness used for canonical election, fixed when the ad is first clustered.
    richness: HashMap<AdId, f64>,
    clusterer: DuplicateClusterer,
    rebuild_pending: bool,
    normalizer: SalaryNormalizer<R>,
    classifier: Arc<C>,
    orchestrator: ClassificationOrchestrator<C>,
}

impl<C, R> AdPipeline<C, R>
where
    C: PositionClassifier + 'static,
    R: RateTable,
{
    pub fn new(config: PipelineConfig, rates: R, classifier: Arc<C>) -> Result<Self, PipelineError> {
        let manager = ModelVersionManager::new(config.params.clone())?;
        let clusterer = DuplicateClusterer::new(manager.params());
        let normalizer = SalaryNormalizer::new(config.normalizer, rates);
        let orchestrator =
            ClassificationOrchestrator::new(Arc::clone(&classifier), config.classifier.clone());
        Ok(Self {
            config,
            manager,
            cache: ArtifactCache::new(),
            ads: BTreeMap::new(),
            records: BTreeMap::new(),
            terms: HashMap::new(),
            df: DocumentFrequency::default(),
            scorer: None,
            richness: HashMap::new(),
            clusterer,
            rebuild_pending: false,
            normalizer,
            classifier,
            orchestrator,
        })
    }

    /// Restores persisted state. Signatures are kept as stored; the next run
    /// re-clusters every ad and recomputes only the stale ones.
    pub fn from_snapshot(
        config: PipelineConfig,
        rates: R,
        classifier: Arc<C>,
        snapshot: PipelineSnapshot,
    ) -> Result<Self, PipelineError> {
        let mut pipeline = Self::new(config, rates, classifier)?;
        if snapshot.model_version != pipeline.manager.version() {
            info!(
                stored = %snapshot.model_version,
                active = %pipeline.manager.version(),
                "snapshot predates the active model version"
            );
        }

        let tfs: Vec<TermFrequency> = snapshot
            .ads
            .par_iter()
            .map(|ad| TermFrequency::from_text(&ad.text))
            .collect();
        pipeline.df = DocumentFrequency::from_batch(&tfs);
        for (ad, tf) in snapshot.ads.into_iter().zip(tfs) {
            pipeline.terms.insert(ad.id, tf);
            pipeline.ads.insert(ad.id, ad);
        }
        for record in snapshot.salary_records {
            pipeline.records.insert(record.ad_id, record);
        }
        for id in pipeline.ads.keys() {
            pipeline
                .records
                .entry(*id)
                .or_insert_with(|| SalaryRecord::new(*id, None));
        }
        for stored in snapshot.signatures {
            pipeline.cache.insert(stored.ad_id, stored.signature);
        }
        for frozen in snapshot.richness {
            pipeline.richness.insert(frozen.ad_id, frozen.richness);
        }
        pipeline.clusterer =
            DuplicateClusterer::new(pipeline.manager.params()).with_previous_stacks(snapshot.stacks);
        pipeline.rebuild_pending = !pipeline.ads.is_empty();
        Ok(pipeline)
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let mut signatures: Vec<StoredSignature> = self
            .cache
            .entries()
            .map(|(ad_id, signature)| StoredSignature {
                ad_id,
                signature: signature.clone(),
            })
            .collect();
        signatures.sort_by_key(|stored| stored.ad_id);
        let mut richness: Vec<FrozenRichness> = self
            .richness
            .iter()
            .map(|(ad_id, richness)| FrozenRichness {
                ad_id: *ad_id,
                richness: *richness,
            })
            .collect();
        richness.sort_by_key(|frozen| frozen.ad_id);

        PipelineSnapshot {
            model_version: self.manager.version(),
            classifier_version: self.config.classifier.version,
            ads: self.ads.values().cloned().collect(),
            stacks: self.clusterer.stacks().cloned().collect(),
            salary_records: self.records.values().cloned().collect(),
            signatures,
            richness,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn manager(&self) -> &ModelVersionManager {
        &self.manager
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn ads(&self) -> impl Iterator<Item = &Ad> {
        self.ads.values()
    }

    pub fn ad(&self, id: AdId) -> Option<&Ad> {
        self.ads.get(&id)
    }

    pub fn stacks(&self) -> impl Iterator<Item = &Stack> {
        self.clusterer.stacks()
    }

    pub fn stack_of(&self, id: AdId) -> Option<&Stack> {
        let stack_id = self.ads.get(&id)?.stack_id?;
        self.clusterer.stack(stack_id)
    }

    pub fn salary_records(&self) -> impl Iterator<Item = &SalaryRecord> {
        self.records.values()
    }

    pub fn salary_record(&self, id: AdId) -> Option<&SalaryRecord> {
        self.records.get(&id)
    }

    /// TF-IDF cosine between two ingested ads under the current IDF table.
    pub fn similarity(&self, a: AdId, b: AdId) -> Option<f64> {
        let scorer = self.scorer.as_ref()?;
        Some(scorer.cosine(self.terms.get(&a)?, self.terms.get(&b)?))
    }

    /// Switches vectorization parameters. On a version change the next run
    /// re-clusters every ad, keeping stack identifiers where groups survive.
    pub fn activate_params(&mut self, params: VectorizationModelParams) -> Result<bool, PipelineError> {
        if !self.manager.activate(params)? {
            return Ok(false);
        }
        self.config.params = self.manager.params().clone();
        let previous: Vec<Stack> = self.clusterer.stacks().cloned().collect();
        self.clusterer = DuplicateClusterer::new(self.manager.params()).with_previous_stacks(previous);
        self.rebuild_pending = !self.ads.is_empty();
        Ok(true)
    }

    /// Completed classifications under another version become eligible again.
    pub fn set_classifier_version(&mut self, version: ClassifierVersion) {
        if self.config.classifier.version == version {
            return;
        }
        info!(from = self.config.classifier.version.0, to = version.0, "switching classifier version");
        self.config.classifier.version = version;
        self.orchestrator = ClassificationOrchestrator::new(
            Arc::clone(&self.classifier),
            self.config.classifier.clone(),
        );
    }

    /// Runs one batch. Only a clustering invariant violation is an error;
    /// per-record salary and classification failures land on the records.
    ///
    /// Cancellation is observed between stages, per salary record and per
    /// classification call. Clustering is never interrupted half way.
    pub async fn run_batch(
        &mut self,
        drafts: Vec<AdDraft>,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, PipelineError> {
        let mut summary =
            BatchSummary::start(self.manager.version(), self.config.classifier.version);
        let span = info_span!(
            "batch",
            run_id = %summary.run_id,
            version = %summary.model_version,
            drafts = drafts.len()
        );

        if cancel.is_cancelled() {
            warn!(parent: &span, "batch cancelled before ingestion");
            summary.cancelled = true;
            return Ok(self.finish(summary, &span));
        }

        {
            let _entered = span.enter();
            let fresh = self.ingest(drafts, &mut summary);
            summary.idf_rebuilt = self.refresh_idf();
            self.cluster(&fresh, &mut summary)?;
        }

        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(self.finish(summary, &span));
        }
        {
            let _entered = span.enter();
            summary.salary_processed = self.normalize_salaries(cancel);
        }

        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(self.finish(summary, &span));
        }
        let classification = self.classify(cancel).instrument(span.clone()).await;
        summary.classification_calls = classification.calls;
        summary.cancelled = classification.cancelled;

        Ok(self.finish(summary, &span))
    }

    fn ingest(&mut self, drafts: Vec<AdDraft>, summary: &mut BatchSummary) -> Vec<AdId> {
        let mut seen: HashSet<AdId> = HashSet::new();
        let mut fresh: Vec<AdDraft> = Vec::with_capacity(drafts.len());
        for draft in drafts {
            if self.ads.contains_key(&draft.id) || !seen.insert(draft.id) {
                debug!(ad_id = %draft.id, "ad already ingested");
                summary.skipped += 1;
                continue;
            }
            fresh.push(draft);
        }

        let tfs: Vec<TermFrequency> = fresh
            .par_iter()
            .map(|draft| TermFrequency::from_text(&draft.text))
            .collect();
        self.df = std::mem::take(&mut self.df).merge(DocumentFrequency::from_batch(&tfs));

        let mut ids = Vec::with_capacity(fresh.len());
        for (draft, tf) in fresh.into_iter().zip(tfs) {
            let id = draft.id;
            self.ads.insert(id, Ad::from_draft(&draft));
            self.records.insert(id, SalaryRecord::new(id, draft.salary_text));
            self.terms.insert(id, tf);
            ids.push(id);
        }
        summary.ingested = ids.len();
        info!(ingested = summary.ingested, skipped = summary.skipped, "ingested drafts");
        ids
    }

    fn refresh_idf(&mut self) -> bool {
        let corpus = self.df.documents();
        let due = match &self.scorer {
            Some(scorer) => scorer.needs_rebuild(corpus, self.manager.params()),
            None => corpus > 0,
        };
        if due {
            let table = IdfTable::build(&self.df, self.manager.params());
            self.scorer = Some(TfIdfScorer::new(table, self.config.idf_drift));
        }
        due
    }

    fn freeze_richness(&mut self, ids: &[AdId]) {
        let Some(scorer) = self.scorer.as_ref() else {
            return;
        };
        for id in ids {
            if let Some(tf) = self.terms.get(id) {
                self.richness
                    .entry(*id)
                    .or_insert_with(|| scorer.richness(tf));
            }
        }
    }

    fn cluster(&mut self, fresh: &[AdId], summary: &mut BatchSummary) -> Result<(), PipelineError> {
        let targets: Vec<AdId> = if self.rebuild_pending {
            self.ads.keys().copied().collect()
        } else {
            fresh.to_vec()
        };
        summary.rebuilt = self.rebuild_pending;
        self.freeze_richness(&targets);
        summary.signatures_recomputed = self
            .cache
            .prefetch(targets.iter().filter_map(|id| self.ads.get(id)), &self.manager);

        for id in &targets {
            let Some(ad) = self.ads.get(id) else {
                continue;
            };
            let member = ClusterMember {
                ad_id: ad.id,
                posted_at: ad.posted_at,
                richness: self.richness.get(id).copied().unwrap_or(0.0),
            };
            let signature = self.cache.current(ad, &self.manager);
            self.clusterer.insert(member, signature).map_err(fatal)?;
        }
        self.rebuild_pending = false;

        let resolution = self.clusterer.resolve().map_err(fatal)?;
        let changed = self.clusterer.apply_to(self.ads.values_mut());
        verify_stacks(self.clusterer.stacks(), self.ads.values()).map_err(fatal)?;

        summary.new_stacks = resolution.created.len();
        summary.retired_stacks = resolution.retired.len();
        summary.canonical_changes = resolution.canonical_changes.len();
        for change in &resolution.canonical_changes {
            debug!(stack = %change.stack, from = %change.from, to = %change.to, "canonical member changed");
        }
        info!(
            clustered = targets.len(),
            rebuilt = summary.rebuilt,
            recomputed = summary.signatures_recomputed,
            ads_changed = changed,
            stacks = resolution.stacks,
            "clustered ads"
        );
        Ok(())
    }

    /// Normalizes pending salary records of unique ads on the rayon pool.
    fn normalize_salaries(&mut self, cancel: &CancellationToken) -> usize {
        let ads = &self.ads;
        let normalizer = &self.normalizer;
        let work: Vec<(&mut SalaryRecord, NaiveDate)> = self
            .records
            .values_mut()
            .filter(|record| record.normalization_status.is_pending())
            .filter_map(|record| {
                let ad = ads.get(&record.ad_id)?;
                let on = ad.posted_at.date_naive();
                ad.is_unique.then_some((record, on))
            })
            .collect();

        let statuses: Vec<ProcessingStatus> = work
            .into_par_iter()
            .filter(|_| !cancel.is_cancelled())
            .map(|(record, on)| normalizer.process(record, on))
            .collect();
        let counts = StatusCounts::tally(statuses.iter().copied());
        info!(
            processed = statuses.len(),
            completed = counts.completed,
            failed = counts.failed,
            "normalized salaries"
        );
        statuses.len()
    }

    async fn classify(&mut self, cancel: &CancellationToken) -> ClassificationSummary {
        let ads = &self.ads;
        let work: Vec<(&mut SalaryRecord, &str)> = self
            .records
            .values_mut()
            .filter_map(|record| {
                let ad = ads.get(&record.ad_id)?;
                ad.is_unique.then_some((record, ad.text.as_str()))
            })
            .collect();
        self.orchestrator.run(work, cancel).await
    }

    fn finish(&self, mut summary: BatchSummary, span: &tracing::Span) -> BatchSummary {
        summary.stacks_total = self.clusterer.stacks().count();
        summary.unique_ads = self.ads.values().filter(|ad| ad.is_unique).count();
        summary.salary = StatusCounts::tally(self.records.values().map(|r| r.normalization_status));
        summary.classification =
            StatusCounts::tally(self.records.values().map(|r| r.classification_status));
        summary.finished_at = Utc::now();
        info!(
            parent: span,
            ingested = summary.ingested,
            skipped = summary.skipped,
            stacks = summary.stacks_total,
            unique = summary.unique_ads,
            salary_failed = summary.salary.failed,
            classification_failed = summary.classification.failed,
            cancelled = summary.cancelled,
            "batch finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn ad(id: u64, text: &str) -> Ad {
        Ad {
            id: AdId(id),
            posted_at: Utc::now(),
            source: adstack_core::MessageRef {
                channel: "jobs".into(),
                message_id: id as i64,
            },
            text: text.into(),
            is_unique: true,
            stack_id: None,
        }
    }

    #[test]
    fn config_defaults_when_nothing_is_set() {
        let config = PipelineConfig::from_lookup(|_| None);
        assert_eq!(config.params, VectorizationModelParams::default());
        assert_eq!(config.idf_drift, 0.10);
        assert_eq!(config.normalizer.reporting_currency, Currency::Usd);
        assert_eq!(config.normalizer.default_period, None);
        assert_eq!(config.classifier.backoff.max_attempts, 3);
        assert_eq!(config.classifier.call_timeout, Duration::from_secs(20));
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("ADSTACK_MODEL_VERSION", "4"),
            ("ADSTACK_SHINGLE_UNIT", "tokens"),
            ("ADSTACK_SHINGLE_SIZE", "3"),
            ("ADSTACK_MINHASH_SEED", "0xFF"),
            ("ADSTACK_LSH_BANDS", "not-a-number"),
            ("ADSTACK_REPORTING_CURRENCY", "eur"),
            ("ADSTACK_DEFAULT_PERIOD", "month"),
            ("ADSTACK_CLASSIFIER_CONCURRENCY", "8"),
            ("ADSTACK_CLASSIFIER_MAX_ATTEMPTS", "5"),
        ]));
        assert_eq!(config.params.version, ModelVersion(4));
        assert_eq!(config.params.shingle_unit, ShingleUnit::Tokens);
        assert_eq!(config.params.shingle_size, 3);
        assert_eq!(config.params.minhash_seed, 255);
        assert_eq!(config.params.lsh_band_count, 20);
        assert_eq!(config.normalizer.reporting_currency, Currency::Eur);
        assert_eq!(config.normalizer.default_period, Some(PayPeriod::Month));
        assert_eq!(config.classifier.concurrency, 8);

        let explicit = PipelineConfig::from_lookup(lookup(&[("ADSTACK_DEFAULT_PERIOD", "none")]));
        assert_eq!(explicit.normalizer.default_period, None);
        assert_eq!(config.classifier.backoff.max_attempts, 5);
    }

    #[test]
    fn activation_requires_a_version_bump() {
        let mut manager = ModelVersionManager::new(VectorizationModelParams::default()).unwrap();
        assert!(!manager.activate(VectorizationModelParams::default()).unwrap());

        let reseeded = VectorizationModelParams {
            minhash_seed: 7,
            ..Default::default()
        };
        assert!(matches!(
            manager.activate(reseeded.clone()),
            Err(PipelineError::UnbumpedParams(ModelVersion(1)))
        ));
        assert!(manager
            .activate(VectorizationModelParams {
                version: ModelVersion(2),
                ..reseeded
            })
            .unwrap());
        assert_eq!(manager.version(), ModelVersion(2));
    }

    #[test]
    fn invalid_params_are_rejected() {
        let params = VectorizationModelParams {
            lsh_band_count: 0,
            ..Default::default()
        };
        assert!(ModelVersionManager::new(params).is_err());
    }

    #[test]
    fn stale_signatures_are_recomputed_on_access_only() {
        let v1 = ModelVersionManager::new(VectorizationModelParams::default()).unwrap();
        let mut cache = ArtifactCache::new();
        let first = ad(1, "senior rust engineer, remote, full time");
        let second = ad(2, "office manager wanted in almaty");
        assert_eq!(cache.prefetch([&first, &second], &v1), 0);
        assert_eq!(cache.len(), 2);

        let mut v2 = v1.clone();
        v2.activate(VectorizationModelParams {
            version: ModelVersion(2),
            minhash_seed: 42,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cache.stale(&v2), 2);

        let refreshed = cache.current(&first, &v2).clone();
        assert_eq!(refreshed.version, ModelVersion(2));
        assert_eq!(refreshed, v2.signature(&first.text));
        assert_eq!(cache.stale(&v2), 1);
        assert_eq!(cache.recomputed(), 1);

        assert_eq!(cache.prefetch([&first, &second], &v2), 1);
        assert_eq!(cache.stale(&v2), 0);
        assert_eq!(cache.recomputed(), 2);
    }

    #[test]
    fn status_counts_tally_every_state() {
        let counts = StatusCounts::tally([
            ProcessingStatus::Completed,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
            ProcessingStatus::NotStarted,
        ]);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.not_started, 1);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn snapshots_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/snapshot.json");
        let snapshot = PipelineSnapshot {
            model_version: ModelVersion(3),
            classifier_version: ClassifierVersion(1),
            ads: vec![ad(1, "rust developer")],
            stacks: Vec::new(),
            salary_records: vec![SalaryRecord::new(AdId(1), Some("$5000".into()))],
            signatures: Vec::new(),
            richness: vec![FrozenRichness {
                ad_id: AdId(1),
                richness: 1.5,
            }],
        };
        snapshot.save(&path).unwrap();
        let loaded = PipelineSnapshot::load(&path).unwrap();
        assert_eq!(loaded.model_version, ModelVersion(3));
        assert_eq!(loaded.ads, snapshot.ads);
        assert_eq!(loaded.salary_records, snapshot.salary_records);
        assert_eq!(loaded.richness[0].richness, 1.5);
    }
}
