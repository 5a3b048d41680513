//! Identity storage seam.
//!
//! The matcher reads identities and faces through [`IdentityStore`] and writes
//! back only through explicit [`IdentityMutation`]s, so a durable backend can
//! replay exactly what the matcher decided. [`MemoryStore`] is the in-process
//! implementation.

use crate::types::{Embedding, FaceBox};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A face is addressed by the media item it came from and its index within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FaceKey {
    pub media_id: String,
    pub face_index: u32,
}

impl FaceKey {
    pub fn new(media_id: impl Into<String>, face_index: u32) -> Self {
        Self {
            media_id: media_id.into(),
            face_index,
        }
    }
}

impl fmt::Display for FaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.media_id, self.face_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub key: FaceKey,
    pub bbox: FaceBox,
    pub quality: f32,
    /// Carries the embedder model id.
    pub embedding: Embedding,
    pub identity: Option<IdentityId>,
    pub detector_model_id: String,
}

impl FaceRecord {
    /// Whether this record was produced by different models than the current ones.
    pub fn is_stale(&self, detector_model_id: &str, embedder_model_id: &str) -> bool {
        self.detector_model_id != detector_model_id || self.embedding.model_id != embedder_model_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonIdentity {
    pub id: IdentityId,
    pub name: String,
    pub quality: f32,
    pub primary_face: Option<FaceKey>,
    /// Redirect set when this identity was merged away.
    pub merged_into: Option<IdentityId>,
    pub ignored: bool,
}

impl PersonIdentity {
    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }
}

/// One explicit change to identity state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IdentityMutation {
    CreateIdentity {
        id: IdentityId,
        name: String,
    },
    /// Drop every face recorded for a media item before it is re-processed.
    ClearMedia {
        media_id: String,
    },
    UpsertFace {
        record: FaceRecord,
    },
    AssignFace {
        key: FaceKey,
        identity: IdentityId,
    },
    MarkMerged {
        source: IdentityId,
        target: IdentityId,
    },
    Rename {
        id: IdentityId,
        name: String,
    },
    SetIgnored {
        id: IdentityId,
        ignored: bool,
    },
    UpdateQuality {
        id: IdentityId,
        quality: f32,
        primary_face: Option<FaceKey>,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("unknown identity {0}")]
    UnknownIdentity(IdentityId),
    #[error("identity {0} already exists")]
    DuplicateIdentity(IdentityId),
    #[error("unknown face {0}")]
    UnknownFace(FaceKey),
    #[error("store backend: {0}")]
    Backend(String),
}

/// Identity persistence as seen by the matcher.
///
/// Reads return snapshots; writes go through [`IdentityStore::apply`] only.
pub trait IdentityStore: Send {
    /// Every identity, merged ones included.
    fn identities(&self) -> Result<Vec<PersonIdentity>, StoreError>;

    fn faces(&self) -> Result<Vec<FaceRecord>, StoreError>;

    fn allocate_identity_id(&mut self) -> Result<IdentityId, StoreError>;

    /// Apply one mutation. The mutations of one matcher operation arrive back
    /// to back and end in [`IdentityStore::commit`] or [`IdentityStore::rollback`],
    /// so backends should batch them into one transaction.
    fn apply(&mut self, mutation: &IdentityMutation) -> Result<(), StoreError>;

    /// Make every mutation since the last commit or rollback permanent.
    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Discard every mutation since the last commit or rollback.
    fn rollback(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Flat, serializable copy of a store's contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub identities: Vec<PersonIdentity>,
    pub faces: Vec<FaceRecord>,
}

/// In-memory store. Ordered maps keep snapshots deterministic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    identities: BTreeMap<IdentityId, PersonIdentity>,
    faces: BTreeMap<FaceKey, FaceRecord>,
    next_id: i64,
    /// State before the first uncommitted mutation.
    checkpoint: Option<Box<Checkpoint>>,
}

#[derive(Debug, Clone)]
struct Checkpoint {
    identities: BTreeMap<IdentityId, PersonIdentity>,
    faces: BTreeMap<FaceKey, FaceRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let next_id = snapshot.identities.iter().map(|i| i.id.0).max().unwrap_or(0);
        Self {
            identities: snapshot.identities.into_iter().map(|i| (i.id, i)).collect(),
            faces: snapshot.faces.into_iter().map(|f| (f.key.clone(), f)).collect(),
            next_id,
            checkpoint: None,
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            identities: self.identities.values().cloned().collect(),
            faces: self.faces.values().cloned().collect(),
        }
    }

    pub fn identity(&self, id: IdentityId) -> Option<&PersonIdentity> {
        self.identities.get(&id)
    }

    pub fn face(&self, key: &FaceKey) -> Option<&FaceRecord> {
        self.faces.get(key)
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    fn identity_mut(&mut self, id: IdentityId) -> Result<&mut PersonIdentity, StoreError> {
        self.identities.get_mut(&id).ok_or(StoreError::UnknownIdentity(id))
    }
}

impl IdentityStore for MemoryStore {
    fn identities(&self) -> Result<Vec<PersonIdentity>, StoreError> {
        Ok(self.identities.values().cloned().collect())
    }

    fn faces(&self) -> Result<Vec<FaceRecord>, StoreError> {
        Ok(self.faces.values().cloned().collect())
    }

    fn allocate_identity_id(&mut self) -> Result<IdentityId, StoreError> {
        let highest = self.identities.keys().next_back().map_or(0, |id| id.0);
        self.next_id = self.next_id.max(highest) + 1;
        Ok(IdentityId(self.next_id))
    }

    fn apply(&mut self, mutation: &IdentityMutation) -> Result<(), StoreError> {
        if self.checkpoint.is_none() {
            self.checkpoint = Some(Box::new(Checkpoint {
                identities: self.identities.clone(),
                faces: self.faces.clone(),
            }));
        }
        match mutation {
            IdentityMutation::CreateIdentity { id, name } => {
                if self.identities.contains_key(id) {
                    return Err(StoreError::DuplicateIdentity(*id));
                }
                self.identities.insert(
                    *id,
                    PersonIdentity {
                        id: *id,
                        name: name.clone(),
                        quality: 0.0,
                        primary_face: None,
                        merged_into: None,
                        ignored: false,
                    },
                );
            }
            IdentityMutation::ClearMedia { media_id } => {
                self.faces.retain(|key, _| &key.media_id != media_id);
            }
            IdentityMutation::UpsertFace { record } => {
                if let Some(id) = record.identity {
                    if !self.identities.contains_key(&id) {
                        return Err(StoreError::UnknownIdentity(id));
                    }
                }
                self.faces.insert(record.key.clone(), record.clone());
            }
            IdentityMutation::AssignFace { key, identity } => {
                if !self.identities.contains_key(identity) {
                    return Err(StoreError::UnknownIdentity(*identity));
                }
                let face = self.faces.get_mut(key).ok_or_else(|| StoreError::UnknownFace(key.clone()))?;
                face.identity = Some(*identity);
            }
            IdentityMutation::MarkMerged { source, target } => {
                if !self.identities.contains_key(target) {
                    return Err(StoreError::UnknownIdentity(*target));
                }
                self.identity_mut(*source)?.merged_into = Some(*target);
            }
            IdentityMutation::Rename { id, name } => {
                self.identity_mut(*id)?.name = name.clone();
            }
            IdentityMutation::SetIgnored { id, ignored } => {
                self.identity_mut(*id)?.ignored = *ignored;
            }
            IdentityMutation::UpdateQuality {
                id,
                quality,
                primary_face,
            } => {
                let identity = self.identity_mut(*id)?;
                identity.quality = *quality;
                identity.primary_face = primary_face.clone();
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.checkpoint = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(checkpoint) = self.checkpoint.take() {
            self.identities = checkpoint.identities;
            self.faces = checkpoint.faces;
        }
        Ok(())
    }
}
