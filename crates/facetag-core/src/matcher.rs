//! Incremental identity clustering.
//!
//! Each new face is compared against every stored face of every identity and
//! either joins the best identity or founds a new placeholder one. Merge,
//! rename and quality recompute run under the same store lock as matching.

use crate::quality::{face_quality, identity_quality};
use crate::store::{FaceKey, FaceRecord, IdentityId, IdentityMutation, IdentityStore, PersonIdentity, StoreError};
use crate::types::{DetectedFace, Embedding};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Name prefix of identities nobody has named yet.
pub const PLACEHOLDER_PREFIX: &str = "Unknown ";

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("unknown identity {0}")]
    UnknownIdentity(IdentityId),
    #[error("identity {0} cannot be merged into itself")]
    SelfMerge(IdentityId),
    #[error("merge redirect cycle starting at identity {0}")]
    RedirectCycle(IdentityId),
    #[error("identity name is empty")]
    EmptyName,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Similarity at which a face joins an identity outright.
    pub match_threshold: f32,
    /// Lower bar for placeholder identities when the face is good enough.
    pub relaxed_threshold: f32,
    pub relaxed_min_quality: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.50,
            relaxed_threshold: 0.45,
            relaxed_min_quality: 0.60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    pub identity: IdentityId,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchDecision {
    Assign {
        identity: IdentityId,
        similarity: f32,
        relaxed: bool,
    },
    CreateNew,
}

impl MatcherConfig {
    /// Decide where a face with the given best match and quality belongs.
    pub fn decide(&self, best: Option<(BestMatch, &str)>, quality: f32) -> MatchDecision {
        if let Some((best, name)) = best {
            if best.similarity >= self.match_threshold {
                return MatchDecision::Assign {
                    identity: best.identity,
                    similarity: best.similarity,
                    relaxed: false,
                };
            }
            if is_placeholder(name) && quality >= self.relaxed_min_quality && best.similarity >= self.relaxed_threshold {
                return MatchDecision::Assign {
                    identity: best.identity,
                    similarity: best.similarity,
                    relaxed: true,
                };
            }
        }
        MatchDecision::CreateNew
    }
}

/// One face of a media item, ready for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub face_index: u32,
    pub face: DetectedFace,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub identity_id: IdentityId,
    pub name: String,
    /// Best similarity seen; 0 when a new identity was created with no candidates.
    pub similarity: f32,
    pub face_index: u32,
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignmentReport {
    pub matches: Vec<FaceMatch>,
    pub mutations: Vec<IdentityMutation>,
}

/// Result of an identity edit: the surviving identity and what was written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationOutcome {
    pub identity_id: IdentityId,
    pub mutations: Vec<IdentityMutation>,
}

/// Numeric suffix of a placeholder name, if `name` is one.
pub fn placeholder_number(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(PLACEHOLDER_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn is_placeholder(name: &str) -> bool {
    placeholder_number(name).is_some()
}

/// `"Unknown N"` with N one past the highest placeholder suffix in use.
pub fn next_placeholder_name<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let highest = names.into_iter().filter_map(placeholder_number).max().unwrap_or(0);
    format!("{PLACEHOLDER_PREFIX}{}", highest.saturating_add(1))
}

/// Mutations applied so far inside one locked operation.
struct Ledger<'a, S> {
    store: &'a mut S,
    mutations: Vec<IdentityMutation>,
}

impl<'a, S: IdentityStore> Ledger<'a, S> {
    fn new(store: &'a mut S) -> Self {
        Self {
            store,
            mutations: Vec::new(),
        }
    }

    fn apply(&mut self, mutation: IdentityMutation) -> Result<(), StoreError> {
        self.store.apply(&mutation)?;
        self.mutations.push(mutation);
        Ok(())
    }
}

type IdentityMap = HashMap<IdentityId, PersonIdentity>;

fn identity_map<S: IdentityStore>(store: &S) -> Result<IdentityMap, StoreError> {
    Ok(store.identities()?.into_iter().map(|i| (i.id, i)).collect())
}

/// Follow `merged_into` redirects to the live identity.
fn resolve_in(identities: &IdentityMap, id: IdentityId) -> Result<IdentityId, MatcherError> {
    let mut current = id;
    for _ in 0..=identities.len() {
        let identity = identities.get(&current).ok_or(MatcherError::UnknownIdentity(current))?;
        match identity.merged_into {
            None => return Ok(current),
            Some(next) => current = next,
        }
    }
    Err(MatcherError::RedirectCycle(id))
}

/// Highest similarity against any comparable known embedding.
///
/// Ties keep the earliest entry.
fn best_match(known: &[(IdentityId, Embedding)], probe: &Embedding) -> Option<BestMatch> {
    let mut best: Option<BestMatch> = None;
    for (identity, embedding) in known {
        if !embedding.is_comparable(probe) {
            continue;
        }
        let similarity = embedding.similarity(probe);
        if similarity.is_nan() {
            continue;
        }
        if best.map_or(true, |b| similarity > b.similarity) {
            best = Some(BestMatch {
                identity: *identity,
                similarity,
            });
        }
    }
    best
}

fn quality_update<S: IdentityStore>(store: &S, id: IdentityId) -> Result<IdentityMutation, StoreError> {
    let faces: Vec<FaceRecord> = store.faces()?.into_iter().filter(|f| f.identity == Some(id)).collect();
    let qualities: Vec<f32> = faces.iter().map(|f| f.quality).collect();
    let primary_face = faces
        .iter()
        .reduce(|best, f| if f.quality > best.quality { f } else { best })
        .map(|f| f.key.clone());

    Ok(IdentityMutation::UpdateQuality {
        id,
        quality: identity_quality(&qualities),
        primary_face,
    })
}

fn merge_in<S: IdentityStore>(
    ledger: &mut Ledger<'_, S>,
    source: IdentityId,
    target: IdentityId,
) -> Result<IdentityId, MatcherError> {
    let identities = identity_map(ledger.store)?;
    let source = resolve_in(&identities, source)?;
    let target = resolve_in(&identities, target)?;
    if source == target {
        return Err(MatcherError::SelfMerge(source));
    }

    let mut moved = 0usize;
    for face in ledger.store.faces()? {
        let Some(owner) = face.identity else { continue };
        if owner == source || resolve_in(&identities, owner).ok() == Some(source) {
            ledger.apply(IdentityMutation::AssignFace {
                key: face.key,
                identity: target,
            })?;
            moved += 1;
        }
    }

    ledger.apply(IdentityMutation::MarkMerged { source, target })?;
    ledger.apply(IdentityMutation::UpdateQuality {
        id: source,
        quality: 0.0,
        primary_face: None,
    })?;
    let update = quality_update(ledger.store, target)?;
    ledger.apply(update)?;

    tracing::info!(source = source.0, target = target.0, faces = moved, "merged identities");
    Ok(target)
}

/// Identity matcher over an [`IdentityStore`].
///
/// Every operation holds the store lock for its whole read-decide-write cycle.
pub struct IdentityMatcher<S> {
    store: Mutex<S>,
    config: MatcherConfig,
}

impl<S: IdentityStore> IdentityMatcher<S> {
    pub fn new(store: S, config: MatcherConfig) -> Self {
        Self {
            store: Mutex::new(store),
            config,
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one operation's mutations under the store lock. The store commits
    /// them together, or rolls back on the first error.
    fn transact<T>(
        &self,
        op: impl FnOnce(&mut Ledger<'_, S>) -> Result<T, MatcherError>,
    ) -> Result<(T, Vec<IdentityMutation>), MatcherError> {
        let mut guard = self.lock();
        let mut ledger = Ledger::new(&mut *guard);
        match op(&mut ledger) {
            Ok(value) => {
                ledger.store.commit()?;
                Ok((value, ledger.mutations))
            }
            Err(e) => {
                if let Err(rollback) = ledger.store.rollback() {
                    tracing::error!(error = %rollback, "store rollback failed");
                }
                Err(e)
            }
        }
    }

    pub fn into_store(self) -> S {
        self.store.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every identity, merged ones included.
    pub fn identities(&self) -> Result<Vec<PersonIdentity>, MatcherError> {
        Ok(self.lock().identities()?)
    }

    /// Replace the faces of `media_id` with `observations` and assign each one.
    ///
    /// Faces are matched in order, so later faces of the same media item can
    /// match identities created for earlier ones. Records from another
    /// detector model are left out of matching.
    pub fn assign_faces(
        &self,
        media_id: &str,
        detector_model_id: &str,
        observations: &[FaceObservation],
    ) -> Result<AssignmentReport, MatcherError> {
        let (matches, mutations) = self.transact(|ledger| {
            let mut touched: BTreeSet<IdentityId> = ledger
                .store
                .faces()?
                .iter()
                .filter(|f| f.key.media_id == media_id)
                .filter_map(|f| f.identity)
                .collect();
            ledger.apply(IdentityMutation::ClearMedia {
                media_id: media_id.to_string(),
            })?;

            let mut identities = identity_map(ledger.store)?;
            let mut known: Vec<(IdentityId, Embedding)> = Vec::new();
            for face in ledger.store.faces()? {
                if face.detector_model_id != detector_model_id {
                    continue;
                }
                let Some(owner) = face.identity else { continue };
                match resolve_in(&identities, owner) {
                    Ok(live) => known.push((live, face.embedding)),
                    Err(e) => tracing::warn!(face = %face.key, error = %e, "skipping face with unresolvable identity"),
                }
            }

            let mut matches = Vec::with_capacity(observations.len());
            for obs in observations {
                let quality = face_quality(obs.face.confidence, &obs.face.bbox);
                let best = best_match(&known, &obs.embedding);
                let named = best.and_then(|b| identities.get(&b.identity).map(|i| (b, i.name.as_str())));

                let (identity_id, similarity, created) = match self.config.decide(named, quality) {
                    MatchDecision::Assign {
                        identity,
                        similarity,
                        relaxed,
                    } => {
                        tracing::debug!(media_id, face = obs.face_index, identity = identity.0, similarity, relaxed, "face matched");
                        (identity, similarity, false)
                    }
                    MatchDecision::CreateNew => {
                        let id = ledger.store.allocate_identity_id()?;
                        let name = next_placeholder_name(identities.values().map(|i| i.name.as_str()));
                        ledger.apply(IdentityMutation::CreateIdentity { id, name: name.clone() })?;
                        tracing::debug!(media_id, face = obs.face_index, identity = id.0, name = %name, "created identity");
                        identities.insert(
                            id,
                            PersonIdentity {
                                id,
                                name,
                                quality: 0.0,
                                primary_face: None,
                                merged_into: None,
                                ignored: false,
                            },
                        );
                        (id, best.map_or(0.0, |b| b.similarity), true)
                    }
                };

                ledger.apply(IdentityMutation::UpsertFace {
                    record: FaceRecord {
                        key: FaceKey::new(media_id, obs.face_index),
                        bbox: obs.face.bbox,
                        quality,
                        embedding: obs.embedding.clone(),
                        identity: Some(identity_id),
                        detector_model_id: detector_model_id.to_string(),
                    },
                })?;
                known.push((identity_id, obs.embedding.clone()));
                touched.insert(identity_id);

                matches.push(FaceMatch {
                    identity_id,
                    name: identities.get(&identity_id).map(|i| i.name.clone()).unwrap_or_default(),
                    similarity,
                    face_index: obs.face_index,
                    created,
                });
            }

            for id in touched {
                if identities.contains_key(&id) {
                    let update = quality_update(ledger.store, id)?;
                    ledger.apply(update)?;
                }
            }

            Ok(matches)
        })?;

        Ok(AssignmentReport { matches, mutations })
    }

    /// Merge `source` into `target`, both resolved through redirects first.
    pub fn merge(&self, source: IdentityId, target: IdentityId) -> Result<MutationOutcome, MatcherError> {
        let (identity_id, mutations) = self.transact(|ledger| merge_in(ledger, source, target))?;

        Ok(MutationOutcome { identity_id, mutations })
    }

    /// Rename an identity. Taking the name of another live identity
    /// (case-insensitively) merges into that identity instead.
    pub fn rename(&self, id: IdentityId, name: &str) -> Result<MutationOutcome, MatcherError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MatcherError::EmptyName);
        }

        let (identity_id, mutations) = self.transact(|ledger| {
            let identities = identity_map(ledger.store)?;
            let id = resolve_in(&identities, id)?;

            let wanted = name.to_lowercase();
            let existing = identities
                .values()
                .filter(|i| i.is_live() && i.id != id && i.name.to_lowercase() == wanted)
                .map(|i| i.id)
                .min();

            let identity_id = match existing {
                Some(other) => merge_in(ledger, id, other)?,
                None => {
                    ledger.apply(IdentityMutation::Rename {
                        id,
                        name: name.to_string(),
                    })?;
                    id
                }
            };

            Ok(identity_id)
        })?;

        Ok(MutationOutcome { identity_id, mutations })
    }

    /// Live identity that `id` redirects to.
    pub fn resolve(&self, id: IdentityId) -> Result<IdentityId, MatcherError> {
        let guard = self.lock();
        resolve_in(&identity_map(&*guard)?, id)
    }

    /// Ignored identities keep matching; the flag is for callers to hide them.
    pub fn set_ignored(&self, id: IdentityId, ignored: bool) -> Result<MutationOutcome, MatcherError> {
        let (identity_id, mutations) = self.transact(|ledger| {
            let id = resolve_in(&identity_map(ledger.store)?, id)?;
            ledger.apply(IdentityMutation::SetIgnored { id, ignored })?;
            Ok(id)
        })?;

        Ok(MutationOutcome { identity_id, mutations })
    }

    pub fn recompute_quality(&self, id: IdentityId) -> Result<MutationOutcome, MatcherError> {
        let (identity_id, mutations) = self.transact(|ledger| {
            let id = resolve_in(&identity_map(ledger.store)?, id)?;
            let update = quality_update(ledger.store, id)?;
            ledger.apply(update)?;
            Ok(id)
        })?;

        Ok(MutationOutcome { identity_id, mutations })
    }

    /// Faces produced by other models than the given ones, for re-embedding.
    pub fn stale_faces(&self, detector_model_id: &str, embedder_model_id: &str) -> Result<Vec<FaceKey>, MatcherError> {
        let guard = self.lock();
        Ok(guard
            .faces()?
            .into_iter()
            .filter(|f| f.is_stale(detector_model_id, embedder_model_id))
            .map(|f| f.key)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::FaceBox;

    const DET: &str = "det";
    const EMB: &str = "emb";

    fn unit(x: f32) -> Vec<f32> {
        vec![x, (1.0 - x * x).max(0.0).sqrt()]
    }

    fn observation(index: u32, values: Vec<f32>, confidence: f32, side: f32) -> FaceObservation {
        FaceObservation {
            face_index: index,
            face: DetectedFace {
                bbox: FaceBox::new(10.0, 10.0, side, side),
                landmarks: [(0.0, 0.0); 5],
                confidence,
            },
            embedding: Embedding::new(values, EMB),
        }
    }

    fn good(index: u32, values: Vec<f32>) -> FaceObservation {
        observation(index, values, 0.95, 150.0)
    }

    fn matcher() -> IdentityMatcher<MemoryStore> {
        IdentityMatcher::new(MemoryStore::new(), MatcherConfig::default())
    }

    /// Store with identities "Unknown 1".."Unknown 3"; only the last has a face, embedding [1, 0].
    fn store_with_unknown_three(third_name: &str) -> MemoryStore {
        let mut store = MemoryStore::new();
        for n in 1..=3 {
            let id = store.allocate_identity_id().unwrap();
            let name = if n == 3 { third_name.to_string() } else { format!("Unknown {n}") };
            store.apply(&IdentityMutation::CreateIdentity { id, name }).unwrap();
        }
        store
            .apply(&IdentityMutation::UpsertFace {
                record: FaceRecord {
                    key: FaceKey::new("seed.jpg", 0),
                    bbox: FaceBox::new(0.0, 0.0, 120.0, 120.0),
                    quality: 0.9,
                    embedding: Embedding::new(vec![1.0, 0.0], EMB),
                    identity: Some(IdentityId(3)),
                    detector_model_id: DET.into(),
                },
            })
            .unwrap();
        store
    }

    #[test]
    fn test_placeholder_names() {
        assert!(is_placeholder("Unknown 7"));
        assert!(!is_placeholder("Unknown"));
        assert!(!is_placeholder("Unknown x"));
        assert!(!is_placeholder("Unknown -1"));
        assert!(!is_placeholder("Ann"));
        assert_eq!(next_placeholder_name(["Ann", "Unknown 2", "Unknown x", "Unknown 10"]), "Unknown 11");
        assert_eq!(next_placeholder_name(Vec::<&str>::new()), "Unknown 1");
    }

    #[test]
    fn test_similar_faces_share_identity() {
        let m = matcher();
        let first = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap();
        assert!(first.matches[0].created);
        assert_eq!(first.matches[0].name, "Unknown 1");

        let second = m.assign_faces("b.jpg", DET, &[good(0, vec![0.8, 0.6])]).unwrap();
        let hit = &second.matches[0];
        assert!(!hit.created);
        assert_eq!(hit.identity_id, first.matches[0].identity_id);
        assert!((hit.similarity - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_dissimilar_faces_get_two_identities() {
        let m = matcher();
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap();
        let b = m.assign_faces("b.jpg", DET, &[good(0, unit(0.1))]).unwrap();
        assert!(b.matches[0].created);
        assert_ne!(a.matches[0].identity_id, b.matches[0].identity_id);
        assert_eq!(b.matches[0].name, "Unknown 2");
        assert_eq!(m.identities().unwrap().len(), 2);
    }

    #[test]
    fn test_low_quality_face_not_relaxed() {
        let m = IdentityMatcher::new(store_with_unknown_three("Unknown 3"), MatcherConfig::default());
        // confidence 0.5 and a degenerate box: quality 0.3
        let report = m.assign_faces("c.jpg", DET, &[observation(0, unit(0.47), 0.5, 0.0)]).unwrap();
        let hit = &report.matches[0];
        assert!(hit.created);
        assert_eq!(hit.name, "Unknown 4");
    }

    #[test]
    fn test_good_face_relaxed_onto_placeholder() {
        let m = IdentityMatcher::new(store_with_unknown_three("Unknown 3"), MatcherConfig::default());
        let report = m.assign_faces("c.jpg", DET, &[observation(0, unit(0.47), 1.0, 112.0)]).unwrap();
        let hit = &report.matches[0];
        assert!(!hit.created);
        assert_eq!(hit.identity_id, IdentityId(3));
    }

    #[test]
    fn test_named_identity_gets_no_relaxed_match() {
        let m = IdentityMatcher::new(store_with_unknown_three("Ann"), MatcherConfig::default());
        let report = m.assign_faces("c.jpg", DET, &[observation(0, unit(0.47), 1.0, 112.0)]).unwrap();
        assert!(report.matches[0].created);
        assert_eq!(report.matches[0].name, "Unknown 3");
    }

    #[test]
    fn test_other_model_never_compared() {
        let m = IdentityMatcher::new(store_with_unknown_three("Ann"), MatcherConfig::default());
        let mut obs = good(0, vec![1.0, 0.0]);
        obs.embedding.model_id = "other".into();
        let report = m.assign_faces("c.jpg", DET, &[obs]).unwrap();
        assert!(report.matches[0].created);
        assert_eq!(report.matches[0].similarity, 0.0);
    }

    #[test]
    fn test_faces_in_one_image_match_each_other() {
        let m = matcher();
        let report = m
            .assign_faces("group.jpg", DET, &[good(0, vec![1.0, 0.0]), good(1, unit(0.9)), good(2, unit(0.0))])
            .unwrap();
        let ids: Vec<IdentityId> = report.matches.iter().map(|f| f.identity_id).collect();
        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let run = || {
            let m = matcher();
            let mut names = Vec::new();
            for (i, x) in [1.0, 0.2, 0.85, 0.6, 0.05, 0.3].iter().enumerate() {
                let report = m.assign_faces(&format!("{i}.jpg"), DET, &[good(0, unit(*x))]).unwrap();
                names.push(report.matches[0].name.clone());
            }
            names
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_reassign_replaces_media_faces() {
        let m = matcher();
        m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0]), good(1, unit(0.0))]).unwrap();
        m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap();
        assert_eq!(m.into_store().face_count(), 1);
    }

    #[test]
    fn test_quality_recomputed_after_assign() {
        let m = matcher();
        let report = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap();
        let id = report.matches[0].identity_id;
        let update = report
            .mutations
            .iter()
            .find(|mutation| matches!(mutation, IdentityMutation::UpdateQuality { id: q, .. } if *q == id));
        assert!(update.is_some());
        let store = m.into_store();
        let identity = store.identity(id).unwrap();
        assert!(identity.quality > 0.9);
        assert_eq!(identity.primary_face, Some(FaceKey::new("a.jpg", 0)));
    }

    #[test]
    fn test_merge_preserves_faces() {
        let m = matcher();
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap().matches[0].identity_id;
        let b = m.assign_faces("b.jpg", DET, &[good(0, unit(0.0))]).unwrap().matches[0].identity_id;
        m.assign_faces("c.jpg", DET, &[good(0, unit(0.05))]).unwrap();

        let outcome = m.merge(b, a).unwrap();
        assert_eq!(outcome.identity_id, a);

        assert!(outcome.mutations.contains(&IdentityMutation::UpdateQuality {
            id: b,
            quality: 0.0,
            primary_face: None,
        }));

        let store = m.into_store();
        assert_eq!(store.face_count(), 3);
        let source = store.identity(b).unwrap();
        assert_eq!(source.merged_into, Some(a));
        assert_eq!(source.quality, 0.0);
        assert_eq!(source.primary_face, None);
        let target = store.identity(a).unwrap();
        assert!(target.quality > 0.0);
        assert!(target.primary_face.is_some());
        for key in [FaceKey::new("a.jpg", 0), FaceKey::new("b.jpg", 0), FaceKey::new("c.jpg", 0)] {
            let owner = store.face(&key).unwrap().identity.unwrap();
            assert!(store.identity(owner).unwrap().is_live(), "{key} points at merged identity");
        }
    }

    /// Delegates to a [`MemoryStore`] but refuses every `MarkMerged`.
    struct NoMergeStore(MemoryStore);

    impl IdentityStore for NoMergeStore {
        fn identities(&self) -> Result<Vec<PersonIdentity>, StoreError> {
            self.0.identities()
        }

        fn faces(&self) -> Result<Vec<FaceRecord>, StoreError> {
            self.0.faces()
        }

        fn allocate_identity_id(&mut self) -> Result<IdentityId, StoreError> {
            self.0.allocate_identity_id()
        }

        fn apply(&mut self, mutation: &IdentityMutation) -> Result<(), StoreError> {
            if matches!(mutation, IdentityMutation::MarkMerged { .. }) {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.0.apply(mutation)
        }

        fn commit(&mut self) -> Result<(), StoreError> {
            self.0.commit()
        }

        fn rollback(&mut self) -> Result<(), StoreError> {
            self.0.rollback()
        }
    }

    #[test]
    fn test_failed_merge_leaves_faces_in_place() {
        let m = IdentityMatcher::new(NoMergeStore(MemoryStore::new()), MatcherConfig::default());
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap().matches[0].identity_id;
        let b = m.assign_faces("b.jpg", DET, &[good(0, vec![0.0, 1.0])]).unwrap().matches[0].identity_id;
        assert_ne!(a, b);

        let err = m.merge(b, a).unwrap_err();
        assert!(matches!(err, MatcherError::Store(StoreError::Backend(_))));

        let store = m.into_store().0;
        assert_eq!(store.face(&FaceKey::new("b.jpg", 0)).unwrap().identity, Some(b));
        assert!(store.identity(b).unwrap().is_live());
        assert!(store.identity(b).unwrap().quality > 0.0);
    }

    #[test]
    fn test_merged_faces_match_target() {
        let m = matcher();
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap().matches[0].identity_id;
        let b = m.assign_faces("b.jpg", DET, &[good(0, unit(0.0))]).unwrap().matches[0].identity_id;
        m.merge(b, a).unwrap();
        let report = m.assign_faces("c.jpg", DET, &[good(0, unit(0.02))]).unwrap();
        assert_eq!(report.matches[0].identity_id, a);
    }

    #[test]
    fn test_self_merge_rejected_through_redirect() {
        let m = matcher();
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap().matches[0].identity_id;
        let b = m.assign_faces("b.jpg", DET, &[good(0, unit(0.0))]).unwrap().matches[0].identity_id;
        assert!(matches!(m.merge(a, a), Err(MatcherError::SelfMerge(_))));
        m.merge(a, b).unwrap();
        assert!(matches!(m.merge(a, b), Err(MatcherError::SelfMerge(id)) if id == b));
        assert_eq!(m.resolve(a).unwrap(), b);
    }

    #[test]
    fn test_placeholder_numbering_counts_merged() {
        let m = matcher();
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap().matches[0].identity_id;
        let b = m.assign_faces("b.jpg", DET, &[good(0, unit(0.0))]).unwrap().matches[0].identity_id;
        m.merge(b, a).unwrap();
        let report = m.assign_faces("c.jpg", DET, &[good(0, vec![-1.0, 0.0])]).unwrap();
        assert_eq!(report.matches[0].name, "Unknown 3");
    }

    #[test]
    fn test_rename() {
        let m = matcher();
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap().matches[0].identity_id;
        let outcome = m.rename(a, "  Ann ").unwrap();
        assert_eq!(outcome.identity_id, a);
        let names: Vec<String> = m.identities().unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["Ann".to_string()]);
        assert!(matches!(m.rename(a, "   "), Err(MatcherError::EmptyName)));
    }

    #[test]
    fn test_rename_to_existing_name_merges() {
        let m = matcher();
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap().matches[0].identity_id;
        let b = m.assign_faces("b.jpg", DET, &[good(0, unit(0.0))]).unwrap().matches[0].identity_id;
        m.rename(a, "Ann").unwrap();
        let outcome = m.rename(b, "ann").unwrap();
        assert_eq!(outcome.identity_id, a);
        assert!(outcome.mutations.contains(&IdentityMutation::MarkMerged { source: b, target: a }));
        assert_eq!(m.resolve(b).unwrap(), a);
    }

    #[test]
    fn test_redirect_cycle_detected() {
        let mut store = MemoryStore::new();
        for name in ["A", "B"] {
            let id = store.allocate_identity_id().unwrap();
            store
                .apply(&IdentityMutation::CreateIdentity { id, name: name.into() })
                .unwrap();
        }
        store
            .apply(&IdentityMutation::MarkMerged {
                source: IdentityId(1),
                target: IdentityId(2),
            })
            .unwrap();
        store
            .apply(&IdentityMutation::MarkMerged {
                source: IdentityId(2),
                target: IdentityId(1),
            })
            .unwrap();
        let m = IdentityMatcher::new(store, MatcherConfig::default());
        assert!(matches!(m.resolve(IdentityId(1)), Err(MatcherError::RedirectCycle(_))));
        assert!(matches!(m.resolve(IdentityId(9)), Err(MatcherError::UnknownIdentity(_))));
    }

    #[test]
    fn test_ignored_identity_still_matches() {
        let m = matcher();
        let a = m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap().matches[0].identity_id;
        m.set_ignored(a, true).unwrap();
        let report = m.assign_faces("b.jpg", DET, &[good(0, unit(0.9))]).unwrap();
        assert_eq!(report.matches[0].identity_id, a);
        assert!(m.identities().unwrap()[0].ignored);
    }

    #[test]
    fn test_stale_faces_and_detector_change() {
        let m = matcher();
        m.assign_faces("a.jpg", DET, &[good(0, vec![1.0, 0.0])]).unwrap();
        assert!(m.stale_faces(DET, EMB).unwrap().is_empty());
        assert_eq!(m.stale_faces("det-v2", EMB).unwrap(), vec![FaceKey::new("a.jpg", 0)]);

        // Records from the old detector are not matched against.
        let report = m.assign_faces("b.jpg", "det-v2", &[good(0, vec![1.0, 0.0])]).unwrap();
        assert!(report.matches[0].created);
    }

    #[test]
    fn test_decide_order() {
        let config = MatcherConfig::default();
        let best = BestMatch {
            identity: IdentityId(1),
            similarity: 0.5,
        };
        assert!(matches!(config.decide(Some((best, "Ann")), 0.0), MatchDecision::Assign { relaxed: false, .. }));
        assert_eq!(config.decide(None, 1.0), MatchDecision::CreateNew);
    }
}
