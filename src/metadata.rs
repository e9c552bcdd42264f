// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! The Metadata Store collaborator (spec §2.2, §3, §6) and the three-layer
//! node data model it persists.
//!
//! This module specifies the *interface* the edit driver programs against
//! ([`MetadataStore`]) plus the value types that make up a node's state. An
//! in-memory reference implementation ([`InMemoryMetadataStore`]) is provided
//! for this crate's own tests and for the `testutils` scenario builder; a
//! fuller disk-backed implementation is out of scope (spec §1: "the
//! persistent working-copy metadata database (specified only as an
//! interface)").

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use thiserror::Error;

use crate::checksum::Md5Checksum;
use crate::checksum::Sha1Checksum;
use crate::repo_path::RepoPath;
use crate::repo_path::RepoPathBuf;

pub type Revision = u64;
pub type PropertyMap = IndexMap<String, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Dir,
    File,
    Symlink,
    Unknown,
}

/// Requested/recorded subtree depth (spec §3, §4.2 depth propagation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Depth {
    Empty,
    Files,
    Immediates,
    Infinity,
    Unknown,
}

impl Depth {
    /// Normalizes `Unknown` to `Infinity`, per spec §4.2 `add_directory` depth
    /// propagation.
    pub fn normalized(self) -> Self {
        match self {
            Self::Unknown => Self::Infinity,
            other => other,
        }
    }

    pub fn dominates(self, other: Self) -> bool {
        self.normalized() >= other.normalized()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseStatus {
    Normal,
    Absent,
    Excluded,
    NotPresent,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastChange {
    pub revision: Revision,
    pub date: DateTime<Utc>,
    pub author: String,
}

/// What the server last told us about this node (spec §3 BASE).
#[derive(Debug, Clone, PartialEq)]
pub struct BaseState {
    pub status: BaseStatus,
    pub kind: NodeKind,
    pub revision: Revision,
    pub repos_relpath: RepoPathBuf,
    pub repos_root: String,
    pub repos_uuid: String,
    pub checksum: Option<(Md5Checksum, Sha1Checksum)>,
    pub recorded_mtime_millis: i64,
    pub recorded_size: u64,
    pub depth: Option<Depth>,
    pub last_change: Option<LastChange>,
    pub properties: PropertyMap,
    /// The DAV/ra-layer wire cache (spec §4.2 `close_directory`/`close_file`:
    /// "update the wire-cache from wire props"), kept separate from
    /// `properties` since it is never part of a three-way property merge
    /// and is opaque to everything except the transport layer that wrote it.
    pub wire_cache_properties: PropertyMap,
}

/// A scheduled, not-yet-committed local structural change overlaid on BASE
/// (spec §3 WORKING).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkingSchedule {
    Add,
    AddWithHistory {
        copyfrom_repos_relpath: RepoPathBuf,
        copyfrom_revision: Revision,
    },
    Delete,
    Replace,
    BaseDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingState {
    pub schedule: WorkingSchedule,
}

/// Why an incoming structural change collides with a local one (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    Added,
    Replaced,
    Deleted,
    Edited,
    Obstructed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingAction {
    Edit,
    Add,
    Delete,
    Replace,
}

/// One side of a tree-conflict version pair (spec §4.1 "Conflict-version
/// records").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedNodeVersion {
    pub repos_root: String,
    pub repos_relpath: RepoPathBuf,
    pub revision: Revision,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConflict {
    pub reason: ConflictReason,
    pub action: IncomingAction,
    /// `None` only when `reason == Added` (no pre-existing identity).
    pub source_left: Option<ConflictedNodeVersion>,
    pub source_right: ConflictedNodeVersion,
}

/// Conflict/changelist overlay (spec §3 ACTUAL).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActualState {
    pub text_conflicted: bool,
    pub prop_conflicted: bool,
    pub tree_conflict: Option<TreeConflict>,
    pub changelist: Option<String>,
    /// Present only when locally-edited properties differ from BASE
    /// (spec §4.2 close_directory/close_file: "If actual props differ from
    /// base, write them; else record 'no ACTUAL row'").
    pub properties: Option<PropertyMap>,
    /// Whether the working file's text differs from its recorded BASE
    /// (spec §4.1 classifier input "text_modified"), independent of whether
    /// that difference has risen to a recorded text conflict.
    pub text_modified: bool,
}

impl ActualState {
    pub fn is_conflicted(&self) -> bool {
        self.text_conflicted || self.prop_conflicted || self.tree_conflict.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.is_conflicted() && self.changelist.is_none() && self.properties.is_none() && !self.text_modified
    }
}

/// The full three-layer state of one node, as read from the metadata store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeState {
    pub base: Option<BaseState>,
    pub working: Option<WorkingState>,
    pub actual: ActualState,
}

impl NodeState {
    pub fn is_shadowed(&self) -> bool {
        self.working.is_some()
    }
}

/// The derived status the classifier and callers reason about (spec §3
/// "Derived statuses").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedStatus {
    Normal,
    Added,
    Copied,
    MovedHere,
    Deleted,
    BaseDeleted,
    Incomplete,
    Absent,
    Excluded,
    NotPresent,
    Obstructed,
    ObstructedAdd,
    ObstructedDelete,
}

/// Computes the derived status of a node from its layered state and, when
/// known, the kind actually found on disk (spec §3 "Derived statuses", §4.1
/// input alphabet).
pub fn derive_status(node: &NodeState, on_disk_kind: Option<NodeKind>) -> DerivedStatus {
    let obstructed = match (&node.base, on_disk_kind) {
        (Some(base), Some(disk_kind)) => disk_kind != base.kind,
        _ => false,
    };

    if let Some(working) = &node.working {
        return match &working.schedule {
            WorkingSchedule::Add => {
                if obstructed {
                    DerivedStatus::ObstructedAdd
                } else {
                    DerivedStatus::Added
                }
            }
            WorkingSchedule::AddWithHistory { .. } => DerivedStatus::Copied,
            WorkingSchedule::Delete => {
                if obstructed {
                    DerivedStatus::ObstructedDelete
                } else {
                    DerivedStatus::Deleted
                }
            }
            WorkingSchedule::Replace => {
                if obstructed {
                    DerivedStatus::ObstructedAdd
                } else {
                    DerivedStatus::Added
                }
            }
            WorkingSchedule::BaseDeleted => DerivedStatus::BaseDeleted,
        };
    }

    match &node.base {
        None => DerivedStatus::NotPresent,
        Some(base) => match base.status {
            BaseStatus::Absent => DerivedStatus::Absent,
            BaseStatus::Excluded => DerivedStatus::Excluded,
            BaseStatus::NotPresent => DerivedStatus::NotPresent,
            BaseStatus::Incomplete => DerivedStatus::Incomplete,
            BaseStatus::Normal if obstructed => DerivedStatus::Obstructed,
            BaseStatus::Normal => DerivedStatus::Normal,
        },
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{path} is not under version control")]
    NotUnderVersionControl { path: RepoPathBuf },
    #[error("write lock already held elsewhere for {path}")]
    LockContention { path: RepoPathBuf },
    #[error("no write lock held for {path}")]
    NotLocked { path: RepoPathBuf },
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// The interface the edit driver programs against for all persistent node
/// state (spec §2.2, §6 "Metadata-store interface"). A single node-close is
/// meant to bundle {BASE row write, ACTUAL row write, work-queue append} as
/// one transaction (spec §9); this trait exposes the three writes
/// separately and leaves transactional bundling as an implementation detail
/// of the concrete store, flagged in DESIGN.md per spec §9.
pub trait MetadataStore {
    fn read_node(&self, path: &RepoPath) -> Result<NodeState, MetadataError>;

    fn write_base(&mut self, path: &RepoPath, base: BaseState) -> Result<(), MetadataError>;

    fn write_working(
        &mut self,
        path: &RepoPath,
        working: Option<WorkingState>,
    ) -> Result<(), MetadataError>;

    fn write_actual(&mut self, path: &RepoPath, actual: ActualState) -> Result<(), MetadataError>;

    fn remove_node(&mut self, path: &RepoPath) -> Result<(), MetadataError>;

    /// Lists the repository-relative paths of `dir`'s immediate versioned
    /// children (BASE or WORKING-add present), in unspecified order.
    fn children(&self, dir: &RepoPath) -> Result<Vec<RepoPathBuf>, MetadataError>;

    fn acquire_write_lock(&mut self, dir: &RepoPath) -> Result<(), MetadataError>;
    fn release_write_lock(&mut self, dir: &RepoPath) -> Result<(), MetadataError>;
    fn holds_write_lock(&self, dir: &RepoPath) -> bool;
}

/// In-memory reference [`MetadataStore`], used by this crate's own unit and
/// integration tests. A richer scenario-building wrapper lives in the
/// `testutils` dev-dependency crate.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    nodes: HashMap<RepoPathBuf, NodeState>,
    locks: BTreeMap<RepoPathBuf, ()>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/scenario-setup helper: seeds a node's BASE layer directly.
    pub fn seed_base(&mut self, path: &RepoPath, base: BaseState) {
        self.nodes.entry(path.to_owned()).or_default().base = Some(base);
    }

    pub fn seed_working(&mut self, path: &RepoPath, working: WorkingState) {
        self.nodes.entry(path.to_owned()).or_default().working = Some(working);
    }

    pub fn seed_actual(&mut self, path: &RepoPath, actual: ActualState) {
        self.nodes.entry(path.to_owned()).or_default().actual = actual;
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn read_node(&self, path: &RepoPath) -> Result<NodeState, MetadataError> {
        Ok(self.nodes.get(&path.to_owned()).cloned().unwrap_or_default())
    }

    fn write_base(&mut self, path: &RepoPath, base: BaseState) -> Result<(), MetadataError> {
        self.nodes.entry(path.to_owned()).or_default().base = Some(base);
        Ok(())
    }

    fn write_working(
        &mut self,
        path: &RepoPath,
        working: Option<WorkingState>,
    ) -> Result<(), MetadataError> {
        self.nodes.entry(path.to_owned()).or_default().working = working;
        Ok(())
    }

    fn write_actual(&mut self, path: &RepoPath, actual: ActualState) -> Result<(), MetadataError> {
        self.nodes.entry(path.to_owned()).or_default().actual = actual;
        Ok(())
    }

    fn remove_node(&mut self, path: &RepoPath) -> Result<(), MetadataError> {
        self.nodes.remove(&path.to_owned());
        Ok(())
    }

    fn children(&self, dir: &RepoPath) -> Result<Vec<RepoPathBuf>, MetadataError> {
        Ok(self
            .nodes
            .keys()
            .filter(|p| p.as_repo_path().parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn acquire_write_lock(&mut self, dir: &RepoPath) -> Result<(), MetadataError> {
        if self.locks.contains_key(&dir.to_owned()) {
            return Err(MetadataError::LockContention { path: dir.to_owned() });
        }
        self.locks.insert(dir.to_owned(), ());
        Ok(())
    }

    fn release_write_lock(&mut self, dir: &RepoPath) -> Result<(), MetadataError> {
        self.locks.remove(&dir.to_owned());
        Ok(())
    }

    fn holds_write_lock(&self, dir: &RepoPath) -> bool {
        self.locks.contains_key(&dir.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(status: BaseStatus, kind: NodeKind) -> BaseState {
        BaseState {
            status,
            kind,
            revision: 1,
            repos_relpath: RepoPathBuf::from_internal_string("a"),
            repos_root: "root".to_string(),
            repos_uuid: "uuid".to_string(),
            checksum: None,
            recorded_mtime_millis: 0,
            recorded_size: 0,
            depth: None,
            last_change: None,
            properties: PropertyMap::new(),
            wire_cache_properties: PropertyMap::new(),
        }
    }

    #[test]
    fn test_derive_status_normal_and_obstructed() {
        let node = NodeState {
            base: Some(base(BaseStatus::Normal, NodeKind::File)),
            working: None,
            actual: ActualState::default(),
        };
        assert_eq!(derive_status(&node, Some(NodeKind::File)), DerivedStatus::Normal);
        assert_eq!(derive_status(&node, Some(NodeKind::Dir)), DerivedStatus::Obstructed);
    }

    #[test]
    fn test_derive_status_scheduled_delete() {
        let node = NodeState {
            base: Some(base(BaseStatus::Normal, NodeKind::File)),
            working: Some(WorkingState { schedule: WorkingSchedule::Delete }),
            actual: ActualState::default(),
        };
        assert_eq!(derive_status(&node, Some(NodeKind::File)), DerivedStatus::Deleted);
    }

    #[test]
    fn test_derive_status_not_present() {
        let node = NodeState::default();
        assert_eq!(derive_status(&node, None), DerivedStatus::NotPresent);
    }

    #[test]
    fn test_in_memory_store_lock_contention() {
        let mut store = InMemoryMetadataStore::new();
        let dir = RepoPath::from_internal_string("sub").unwrap();
        store.acquire_write_lock(dir).unwrap();
        assert!(store.acquire_write_lock(dir).is_err());
        store.release_write_lock(dir).unwrap();
        store.acquire_write_lock(dir).unwrap();
    }
}
