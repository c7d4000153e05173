//! Near-duplicate detection for job ads: shingling, MinHash signing, LSH banding
//! and union-find clustering into stacks with one canonical member each.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use adstack_core::{
    Ad, AdId, ModelVersion, ShingleUnit, Stack, StackId, VectorizationModelParams, Versioned,
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "adstack-dedup";

/// Mersenne prime 2^61 - 1, modulus of the seeded permutation family.
const MERSENNE_61: u64 = (1 << 61) - 1;

/// Signature slot value for an empty shingle set. Never produced by a real hash (< 2^61).
const EMPTY_SLOT: u64 = u64::MAX;

fn stable_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ---------------------------------------------------------------------------
// Shingling
// ---------------------------------------------------------------------------

/// Set of overlapping n-grams of one ad.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShingleSet(BTreeSet<String>);

impl ShingleSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, shingle: &str) -> bool {
        self.0.contains(shingle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Exact Jaccard similarity. Two empty sets are not similar.
    pub fn jaccard(&self, other: &Self) -> f64 {
        let union = self.0.union(&other.0).count();
        if union == 0 {
            return 0.0;
        }
        self.0.intersection(&other.0).count() as f64 / union as f64
    }
}

impl FromIterator<String> for ShingleSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shingler {
    size: usize,
    unit: ShingleUnit,
}

impl Shingler {
    pub fn new(size: usize, unit: ShingleUnit) -> Self {
        Self {
            size: size.max(1),
            unit,
        }
    }

    pub fn from_params(params: &VectorizationModelParams) -> Self {
        Self::new(params.shingle_size, params.shingle_unit)
    }

    /// Sliding-window shingles over already-normalized text.
    ///
    /// Text shorter than the window yields one shingle holding the whole text.
    pub fn shingle(&self, text: &str) -> ShingleSet {
        let text = text.trim();
        if text.is_empty() {
            return ShingleSet::default();
        }
        match self.unit {
            ShingleUnit::Chars => {
                let chars: Vec<char> = text.chars().collect();
                if chars.len() <= self.size {
                    return std::iter::once(text.to_string()).collect();
                }
                chars
                    .windows(self.size)
                    .map(|window| window.iter().collect::<String>())
                    .collect()
            }
            ShingleUnit::Tokens => {
                let tokens: Vec<&str> = text.split_whitespace().collect();
                if tokens.len() <= self.size {
                    return std::iter::once(tokens.join(" ")).collect();
                }
                tokens.windows(self.size).map(|window| window.join(" ")).collect()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MinHash
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinHashSignature {
    pub values: Vec<u64>,
}

impl MinHashSignature {
    /// True for the signature of an empty shingle set, which matches nothing.
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|&v| v == EMPTY_SLOT)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Fraction of agreeing components; estimates Jaccard similarity of the shingle sets.
    pub fn estimated_jaccard(&self, other: &Self) -> f64 {
        if self.values.len() != other.values.len()
            || self.values.is_empty()
            || self.is_empty()
            || other.is_empty()
        {
            return 0.0;
        }
        let agreeing = self
            .values
            .iter()
            .zip(&other.values)
            .filter(|(a, b)| a == b)
            .count();
        agreeing as f64 / self.values.len() as f64
    }
}

/// Signs shingle sets with `h_i(x) = (a_i * x + b_i) mod p`, coefficients derived from the seed.
#[derive(Debug, Clone)]
pub struct MinHashSigner {
    coefficients: Vec<(u64, u64)>,
}

impl MinHashSigner {
    pub fn new(hash_function_count: usize, seed: u64) -> Self {
        let mut state = seed;
        let coefficients = (0..hash_function_count)
            .map(|_| {
                let a = 1 + splitmix64(&mut state) % (MERSENNE_61 - 1);
                let b = splitmix64(&mut state) % MERSENNE_61;
                (a, b)
            })
            .collect();
        Self { coefficients }
    }

    pub fn from_params(params: &VectorizationModelParams) -> Self {
        Self::new(params.hash_function_count, params.minhash_seed)
    }

    pub fn hash_function_count(&self) -> usize {
        self.coefficients.len()
    }

    pub fn sign(&self, shingles: &ShingleSet) -> MinHashSignature {
        if shingles.is_empty() {
            return MinHashSignature {
                values: vec![EMPTY_SLOT; self.coefficients.len()],
            };
        }
        let bases: Vec<u128> = shingles
            .iter()
            .map(|s| (stable_hash(s.as_bytes()) % MERSENNE_61) as u128)
            .collect();
        let values = self
            .coefficients
            .iter()
            .map(|&(a, b)| {
                bases
                    .iter()
                    .map(|&x| ((a as u128 * x + b as u128) % MERSENNE_61 as u128) as u64)
                    .min()
                    .unwrap_or(EMPTY_SLOT)
            })
            .collect();
        MinHashSignature { values }
    }

    /// Signs independent shingle sets on the rayon pool.
    pub fn sign_batch(&self, sets: &[ShingleSet]) -> Vec<MinHashSignature> {
        sets.par_iter().map(|set| self.sign(set)).collect()
    }
}

// ---------------------------------------------------------------------------
// LSH banding
// ---------------------------------------------------------------------------

/// Bucket key of one signature band. The band index is mixed in, so equal
/// values in different bands never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BandKey(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshBander {
    bands: usize,
    rows_per_band: usize,
}

impl LshBander {
    pub fn new(bands: usize, rows_per_band: usize) -> Self {
        Self {
            bands: bands.max(1),
            rows_per_band: rows_per_band.max(1),
        }
    }

    pub fn from_params(params: &VectorizationModelParams) -> Self {
        Self::new(params.lsh_band_count, params.rows_per_band())
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn rows_per_band(&self) -> usize {
        self.rows_per_band
    }

    /// Similarity at which the collision probability curve is steepest, `(1/b)^(1/r)`.
    pub fn threshold(&self) -> f64 {
        (1.0 / self.bands as f64).powf(1.0 / self.rows_per_band as f64)
    }

    /// Probability that two sets with Jaccard similarity `s` share a band: `1 - (1 - s^r)^b`.
    pub fn candidate_probability(&self, s: f64) -> f64 {
        1.0 - (1.0 - s.powi(self.rows_per_band as i32)).powi(self.bands as i32)
    }

    pub fn band_keys(&self, signature: &MinHashSignature) -> Vec<BandKey> {
        if signature.is_empty() {
            return Vec::new();
        }
        signature
            .values
            .chunks(self.rows_per_band)
            .take(self.bands)
            .enumerate()
            .map(|(band, rows)| {
                let mut hasher = Sha256::new();
                hasher.update((band as u32).to_le_bytes());
                for value in rows {
                    hasher.update(value.to_le_bytes());
                }
                let digest = hasher.finalize();
                let mut head = [0u8; 8];
                head.copy_from_slice(&digest[..8]);
                BandKey(u64::from_le_bytes(head))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Union-find
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Node {
    parent: usize,
    rank: u8,
}

/// Disjoint sets over dense slot indices. Parent and rank live side by side.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    nodes: Vec<Node>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a singleton set and returns its index.
    pub fn push(&mut self) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            parent: index,
            rank: 0,
        });
        index
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.nodes[root].parent != root {
            root = self.nodes[root].parent;
        }
        let mut cursor = x;
        while self.nodes[cursor].parent != root {
            let next = self.nodes[cursor].parent;
            self.nodes[cursor].parent = root;
            cursor = next;
        }
        root
    }

    /// Merges the sets of `a` and `b`. Returns false if they were already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.nodes[ra].rank.cmp(&self.nodes[rb].rank) {
            Ordering::Less => self.nodes[ra].parent = rb,
            Ordering::Greater => self.nodes[rb].parent = ra,
            Ordering::Equal => {
                self.nodes[rb].parent = ra;
                self.nodes[ra].rank = self.nodes[ra].rank.saturating_add(1);
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("{ad} belongs to two stacks: {first} and {second}")]
    InvariantViolation {
        ad: AdId,
        first: StackId,
        second: StackId,
    },
    #[error("{stack} has {count} canonical members")]
    CanonicalCount { stack: StackId, count: usize },
    #[error("{stack} names {canonical} as canonical but does not contain it")]
    CanonicalNotMember { stack: StackId, canonical: AdId },
    #[error("{ad} is a member of {expected} but points at {found:?}")]
    MembershipMismatch {
        ad: AdId,
        expected: StackId,
        found: Option<StackId>,
    },
    #[error("{ad} points at {stack}, which does not list it")]
    DanglingReference { ad: AdId, stack: StackId },
    #[error("signature version {found} does not match clusterer version {expected}")]
    VersionMismatch {
        expected: ModelVersion,
        found: ModelVersion,
    },
}

/// What the clusterer needs to know about an ad to elect canonical members.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMember {
    pub ad_id: AdId,
    pub posted_at: DateTime<Utc>,
    /// TF-IDF weighted term total, frozen when the ad is inserted.
    pub richness: f64,
}

/// Total order used for canonical election: earliest date, then highest
/// richness, then lowest id. `Less` means `a` wins.
pub fn canonical_order(a: &ClusterMember, b: &ClusterMember) -> Ordering {
    a.posted_at
        .cmp(&b.posted_at)
        .then_with(|| b.richness.total_cmp(&a.richness))
        .then_with(|| a.ad_id.cmp(&b.ad_id))
}

#[derive(Debug, Clone)]
struct Slot {
    member: ClusterMember,
    stack: Option<StackId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub stack_id: Option<StackId>,
    pub is_unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalChange {
    pub stack: StackId,
    pub from: AdId,
    pub to: AdId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub stacks: usize,
    pub created: Vec<StackId>,
    pub retired: Vec<StackId>,
    pub canonical_changes: Vec<CanonicalChange>,
}

/// Incremental near-duplicate clusterer.
///
/// New ads are only checked against the band keys already registered; every
/// ad sharing a key is unioned with the first ad that registered it, which
/// keeps the grouping transitive and independent of arrival order.
#[derive(Debug, Clone)]
pub struct DuplicateClusterer {
    version: ModelVersion,
    bander: LshBander,
    buckets: HashMap<BandKey, usize>,
    slots: Vec<Slot>,
    slot_of: HashMap<AdId, usize>,
    uf: UnionFind,
    stacks: BTreeMap<StackId, Stack>,
    inherited: HashMap<AdId, StackId>,
}

impl DuplicateClusterer {
    pub fn new(params: &VectorizationModelParams) -> Self {
        Self {
            version: params.version,
            bander: LshBander::from_params(params),
            buckets: HashMap::new(),
            slots: Vec::new(),
            slot_of: HashMap::new(),
            uf: UnionFind::new(),
            stacks: BTreeMap::new(),
            inherited: HashMap::new(),
        }
    }

    /// Seeds stacks from an earlier clustering so their identifiers survive a rebuild.
    pub fn with_previous_stacks(mut self, stacks: impl IntoIterator<Item = Stack>) -> Self {
        for stack in stacks {
            for member in &stack.members {
                self.inherited.insert(*member, stack.id);
            }
            self.stacks.insert(stack.id, stack);
        }
        self
    }

    pub fn version(&self) -> ModelVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, ad: AdId) -> bool {
        self.slot_of.contains_key(&ad)
    }

    /// Registers an ad and unions it with every ad sharing a band key.
    ///
    /// Returns `Ok(false)` if the ad was already registered.
    pub fn insert(
        &mut self,
        member: ClusterMember,
        signature: &Versioned<MinHashSignature>,
    ) -> Result<bool, ClusterError> {
        if signature.version != self.version {
            return Err(ClusterError::VersionMismatch {
                expected: self.version,
                found: signature.version,
            });
        }
        if self.slot_of.contains_key(&member.ad_id) {
            return Ok(false);
        }

        let slot = self.uf.push();
        let ad_id = member.ad_id;
        let stack = self.inherited.remove(&ad_id);
        self.slots.push(Slot { member, stack });
        self.slot_of.insert(ad_id, slot);

        let mut collisions = 0usize;
        for key in self.bander.band_keys(&signature.value) {
            match self.buckets.get(&key) {
                Some(&first) => {
                    if self.uf.union(slot, first) {
                        collisions += 1;
                    }
                }
                None => {
                    self.buckets.insert(key, slot);
                }
            }
        }
        debug!(%ad_id, collisions, "registered ad band keys");
        Ok(true)
    }

    fn rank(&self, a: usize, b: usize) -> Ordering {
        canonical_order(&self.slots[a].member, &self.slots[b].member)
    }

    fn fresh_id(&self, founder: AdId, claimed: &HashSet<StackId>) -> StackId {
        let mut salt = 0u32;
        loop {
            let id = StackId::derive(founder, salt);
            if !claimed.contains(&id) && !self.stacks.contains_key(&id) {
                return id;
            }
            salt += 1;
        }
    }

    /// Turns the current disjoint sets into stacks and elects canonical members.
    pub fn resolve(&mut self) -> Result<Resolution, ClusterError> {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for slot in 0..self.slots.len() {
            let root = self.uf.find(slot);
            groups.entry(root).or_default().push(slot);
        }

        let mut multi: Vec<(usize, Vec<usize>)> = groups
            .into_values()
            .filter(|group| group.len() > 1)
            .filter_map(|group| {
                let canonical = group.iter().copied().min_by(|&a, &b| self.rank(a, b))?;
                Some((canonical, group))
            })
            .collect();
        multi.sort_by(|a, b| self.rank(a.0, b.0));

        let mut claimed: HashSet<StackId> = HashSet::new();
        let mut next_stacks: BTreeMap<StackId, Stack> = BTreeMap::new();
        let mut assignment: HashMap<AdId, StackId> = HashMap::new();
        let mut resolution = Resolution::default();

        for (canonical_slot, group) in &multi {
            let canonical = self.slots[*canonical_slot].member.ad_id;

            let mut inherited: Vec<StackId> =
                group.iter().filter_map(|&s| self.slots[s].stack).collect();
            inherited.sort();
            inherited.dedup();

            let mut best: Option<(StackId, usize)> = None;
            for id in &inherited {
                if claimed.contains(id) {
                    continue;
                }
                let Some(previous) = self.stacks.get(id) else {
                    continue;
                };
                let Some(&previous_slot) = self.slot_of.get(&previous.canonical) else {
                    continue;
                };
                let better = match best {
                    Some((_, current)) => self.rank(previous_slot, current) == Ordering::Less,
                    None => true,
                };
                if better {
                    best = Some((*id, previous_slot));
                }
            }

            let stack_id = match best {
                Some((id, _)) => id,
                None => {
                    let id = self.fresh_id(canonical, &claimed);
                    resolution.created.push(id);
                    id
                }
            };
            claimed.insert(stack_id);

            if let Some(previous) = self.stacks.get(&stack_id) {
                if previous.canonical != canonical {
                    resolution.canonical_changes.push(CanonicalChange {
                        stack: stack_id,
                        from: previous.canonical,
                        to: canonical,
                    });
                }
            }

            let mut members = BTreeSet::new();
            for &slot in group {
                let ad = self.slots[slot].member.ad_id;
                if let Some(first) = assignment.insert(ad, stack_id) {
                    if first != stack_id {
                        return Err(ClusterError::InvariantViolation {
                            ad,
                            first,
                            second: stack_id,
                        });
                    }
                }
                members.insert(ad);
            }
            next_stacks.insert(
                stack_id,
                Stack {
                    id: stack_id,
                    members,
                    canonical,
                },
            );
        }

        resolution.retired = self
            .stacks
            .keys()
            .filter(|id| !next_stacks.contains_key(id))
            .copied()
            .collect();

        for slot in &mut self.slots {
            slot.stack = assignment.get(&slot.member.ad_id).copied();
        }
        self.stacks = next_stacks;
        resolution.stacks = self.stacks.len();

        info!(
            version = %self.version,
            ads = self.slots.len(),
            stacks = resolution.stacks,
            created = resolution.created.len(),
            retired = resolution.retired.len(),
            canonical_changes = resolution.canonical_changes.len(),
            "resolved duplicate stacks"
        );
        Ok(resolution)
    }

    pub fn membership(&self, ad: AdId) -> Option<Membership> {
        let slot = self.slot_of.get(&ad)?;
        let stack_id = self.slots[*slot].stack;
        let is_unique = match stack_id {
            Some(id) => self.stacks.get(&id).is_some_and(|s| s.canonical == ad),
            None => true,
        };
        Some(Membership {
            stack_id,
            is_unique,
        })
    }

    /// Writes `is_unique` / `stack_id` onto ad records. Returns how many changed.
    pub fn apply_to<'a>(&self, ads: impl IntoIterator<Item = &'a mut Ad>) -> usize {
        let mut changed = 0usize;
        for ad in ads {
            let Some(membership) = self.membership(ad.id) else {
                continue;
            };
            if ad.is_unique != membership.is_unique || ad.stack_id != membership.stack_id {
                ad.is_unique = membership.is_unique;
                ad.stack_id = membership.stack_id;
                changed += 1;
            }
        }
        changed
    }

    pub fn stacks(&self) -> impl Iterator<Item = &Stack> {
        self.stacks.values()
    }

    pub fn stack(&self, id: StackId) -> Option<&Stack> {
        self.stacks.get(&id)
    }

    pub fn into_stacks(self) -> Vec<Stack> {
        self.stacks.into_values().collect()
    }
}

/// Checks stack invariants against ad records: disjoint stacks, matching
/// back-references, and exactly one unique member per stack.
pub fn verify_stacks<'a>(
    stacks: impl IntoIterator<Item = &'a Stack>,
    ads: impl IntoIterator<Item = &'a Ad>,
) -> Result<(), ClusterError> {
    let ads: HashMap<AdId, &Ad> = ads.into_iter().map(|ad| (ad.id, ad)).collect();
    let mut owner: HashMap<AdId, StackId> = HashMap::new();

    for stack in stacks {
        if !stack.members.contains(&stack.canonical) {
            return Err(ClusterError::CanonicalNotMember {
                stack: stack.id,
                canonical: stack.canonical,
            });
        }
        let mut unique = 0usize;
        for &member in &stack.members {
            if let Some(first) = owner.insert(member, stack.id) {
                return Err(ClusterError::InvariantViolation {
                    ad: member,
                    first,
                    second: stack.id,
                });
            }
            if let Some(ad) = ads.get(&member) {
                if ad.stack_id != Some(stack.id) {
                    return Err(ClusterError::MembershipMismatch {
                        ad: member,
                        expected: stack.id,
                        found: ad.stack_id,
                    });
                }
                if ad.is_unique {
                    unique += 1;
                }
            }
        }
        if unique != 1 {
            return Err(ClusterError::CanonicalCount {
                stack: stack.id,
                count: unique,
            });
        }
    }

    for ad in ads.values() {
        if let Some(stack) = ad.stack_id {
            if owner.get(&ad.id) != Some(&stack) {
                return Err(ClusterError::DanglingReference { ad: ad.id, stack });
            }
        }
    }
    Ok(())
}
