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

//! The Edit Driver (spec §2 component 6, §4.2): the state-bearing editor
//! callback set that coordinates the other five components (pristine store,
//! metadata store, work queue, classifier, bump tracker) to integrate one
//! incoming change stream into a working copy.
//!
//! Node identity uses two distinct paths throughout this module (spec §3
//! "Node identity"): `local_path`, the working-copy-relative path used as
//! the [`MetadataStore`] lookup key, which a switch never moves; and
//! `new_repos_relpath`, the repository-relative identity this node will
//! have once the edit completes, which a switch rewrites. Both start out
//! equal and diverge only under an active switch.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::add_with_history;
use crate::add_with_history::CopyfromRequest;
use crate::bump_tracker::BumpHandle;
use crate::bump_tracker::Completion;
use crate::checksum::DualChecksumWriter;
use crate::checksum::Md5Checksum;
use crate::checksum::Md5Reader;
use crate::checksum::Sha1Checksum;
use crate::classifier;
use crate::classifier::ClassifierInput;
use crate::classifier::ClassifierOutput;
use crate::classifier::IncomingAction;
use crate::classifier::IncomingIdentity;
use crate::classifier::LocalIdentity;
use crate::error::CorruptTextBaseError;
use crate::error::EditorError;
use crate::error::MalformedStreamError;
use crate::error::ObstructedUpdateError;
use crate::error::UnsupportedFeatureError;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::merge_file;
use crate::merge_file::ContentState;
use crate::merge_file::InstallFrom;
use crate::merge_file::LocalTextState;
use crate::merge_file::MergeFileInput;
use crate::merge_file::MergeOutcome;
use crate::merge_file::Schedule as MergeSchedule;
use crate::metadata::ActualState;
use crate::metadata::BaseState;
use crate::metadata::BaseStatus;
use crate::metadata::ConflictReason;
use crate::metadata::ConflictedNodeVersion;
use crate::metadata::Depth;
use crate::metadata::DerivedStatus;
use crate::metadata::LastChange;
use crate::metadata::MetadataStore;
use crate::metadata::NodeKind;
use crate::metadata::PropertyMap;
use crate::metadata::Revision;
use crate::metadata::TreeConflict;
use crate::metadata::WorkingSchedule;
use crate::metadata::derive_status;
use crate::notify::Cancelled;
use crate::notify::ConflictChoice;
use crate::notify::EditCallbacks;
use crate::notify::LockState;
use crate::notify::NotifyAction;
use crate::notify::Notification;
use crate::notify::PropState;
use crate::pristine::PristineStore;
use crate::pristine::PristineWriteHandle;
use crate::repo_path::EscapeReason;
use crate::repo_path::PathEscapesAnchorError;
use crate::repo_path::RepoPath;
use crate::repo_path::RepoPathBuf;
use crate::settings::EditorSettings;
use crate::work_queue::InstallSource;
use crate::work_queue::WorkItem;
use crate::work_queue::WorkQueue;

/// Name used for an entry-style propchange carrying the last-changed-date
/// (spec §4.2 `change_dir_prop`/`change_file_prop`: "`use_commit_times`
/// interacts with one specific entry property: the last-changed-date").
pub const ENTRY_PROP_LAST_CHANGED_DATE: &str = "entry:last-changed-date";
pub const ENTRY_PROP_LAST_CHANGED_REV: &str = "entry:last-changed-rev";
pub const ENTRY_PROP_LAST_CHANGED_AUTHOR: &str = "entry:last-changed-author";
/// Entry property whose removal signals a server-side lock release (spec
/// §4.2 `close_file`: "detect entry-prop lock removal").
pub const ENTRY_PROP_LOCK_TOKEN: &str = "entry:lock-token";
/// The one property this driver treats as the externals definition (spec
/// §4.2 `close_directory`: "Detect changes to the externals property").
pub const PROP_EXTERNALS: &str = "externals";

fn is_entry_prop(name: &str) -> bool {
    name.starts_with("entry:")
}

/// DAV/ra-layer wire-cache properties (spec §3 "wire-cache props", §4.2
/// `close_directory`/`close_file`: "partition propchanges into {entry
/// props, wire-cache props, regular props}... update the wire-cache from
/// wire props"). Opaque to everything but the transport layer that wrote
/// them, so they bypass the three-way regular-property merge entirely.
const WIRE_CACHE_PROP_PREFIX: &str = "wc:";

fn is_wire_cache_prop(name: &str) -> bool {
    name.starts_with(WIRE_CACHE_PROP_PREFIX)
}

/// Applies a flat list of propchanges (insert on `Some`, remove on `None`)
/// to a property map, as used for the wire-cache update (spec §4.2: "update
/// the wire-cache from wire props" — a plain apply, not a three-way merge).
fn apply_propchanges(base: &mut PropertyMap, changes: &[(String, Option<Vec<u8>>)]) {
    for (name, value) in changes {
        match value {
            Some(v) => {
                base.insert(name.clone(), v.clone());
            }
            None => {
                base.shift_remove(name);
            }
        }
    }
}

/// Opaque handle to an open directory baton. Stable for the directory's
/// lifetime within one [`EditSession`] (spec §9: "arena-allocated batons
/// with stable integer identifiers for parent references").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle(usize);

/// Opaque handle to an open file baton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(usize);

/// What the switched subtree should be rewritten to (spec §3 "Switch: an
/// edit that also rewrites the repository-relative paths of the target
/// subtree"). Absent for a plain update.
#[derive(Debug, Clone)]
pub struct SwitchRequest {
    pub repos_root: String,
    pub new_repos_relpath: RepoPathBuf,
}

/// Construction-time arguments for [`EditSession::new`] (spec §3 "Global
/// session state"). Grouped into a struct rather than a long parameter list,
/// mirroring how the teacher corpus configures its own checkout entry
/// points.
pub struct EditSessionArgs<'a, C> {
    pub anchor_abspath: PathBuf,
    /// Repository-relative path the anchor directory is already known to
    /// have (read by the caller from the anchor's own BASE row before
    /// constructing the session).
    pub anchor_repos_relpath: RepoPathBuf,
    /// Basename of the target beneath the anchor, or `None` when the anchor
    /// and target coincide (spec GLOSSARY "Anchor"/"Target").
    pub target_basename: Option<String>,
    pub switch: Option<SwitchRequest>,
    pub depth: Depth,
    pub sticky_depth: bool,
    pub settings: EditorSettings,
    pub repos_root: String,
    pub repos_uuid: String,
    pub metadata: &'a mut dyn MetadataStore,
    pub pristine: PristineStore,
    pub callbacks: C,
    /// Work queues left over from a prior, interrupted invocation of this
    /// session against the same working copy, keyed by directory local path
    /// (spec §5 I6, §8 B4/P6, §9 "Deferred work"). Pass an empty map for a
    /// fresh session.
    pub pending_work: HashMap<RepoPathBuf, WorkQueue>,
}

struct DirBaton {
    parent: Option<DirHandle>,
    local_path: RepoPathBuf,
    new_repos_relpath: RepoPathBuf,
    old_revision: Revision,
    requested_depth: Depth,
    skip_this: bool,
    skip_descendants: bool,
    in_deleted_and_tree_conflicted_subtree: bool,
    adding_dir: bool,
    obstruction_found: bool,
    add_existed: bool,
    already_notified: bool,
    was_incomplete: bool,
    prop_changes: Vec<(String, Option<Vec<u8>>)>,
    bump: BumpHandle,
    work_queue: WorkQueue,
}

struct PendingTextDelta {
    handle: PristineWriteHandle,
    writer: DualChecksumWriter<fs::File>,
}

struct FileBaton {
    parent: DirHandle,
    local_path: RepoPathBuf,
    new_repos_relpath: RepoPathBuf,
    adding: bool,
    add_existed: bool,
    skip_this: bool,
    obstruction_found: bool,
    already_conflicted: bool,
    schedule: MergeSchedule,
    prop_changes: Vec<(String, Option<Vec<u8>>)>,
    pending_delta: Option<PendingTextDelta>,
    finished_pristine: Option<(PristineWriteHandle, Md5Checksum, Sha1Checksum)>,
    copyfrom_install: Option<add_with_history::InstallResult>,
    last_changed_date: Option<DateTime<Utc>>,
    last_changed_rev: Option<Revision>,
    last_changed_author: Option<String>,
    bump: BumpHandle,
}

/// Drives one update/switch edit against a working copy (spec §4.2).
pub struct EditSession<'a, C: EditCallbacks> {
    pub callbacks: C,
    metadata: &'a mut dyn MetadataStore,
    pristine: PristineStore,
    settings: EditorSettings,
    anchor_abspath: PathBuf,
    anchor_repos_relpath: RepoPathBuf,
    target_basename: Option<String>,
    switch_new_relpath: Option<RepoPathBuf>,
    depth: Depth,
    sticky_depth: bool,
    repos_root: String,
    repos_uuid: String,
    target_revision: Option<Revision>,
    root_opened: bool,
    target_deleted: bool,
    /// Set once an editor op (add/open/delete/absent) has directly named
    /// the update target itself, as opposed to some other descendant of
    /// the anchor (spec §4.2 `close_edit`: "if the target went missing...
    /// synthesize a `do_entry_deletion` for it").
    target_touched: bool,
    close_edit_complete: bool,
    skipped_trees: HashSet<RepoPathBuf>,
    pending_work: HashMap<RepoPathBuf, WorkQueue>,
    dirs: Vec<Option<DirBaton>>,
    files: Vec<Option<FileBaton>>,
    root_handle: Option<DirHandle>,
}

impl<'a, C: EditCallbacks> EditSession<'a, C> {
    /// Constructs a new edit session (spec §3 "Global session state").
    /// Rejects a switch whose target crosses repository roots immediately
    /// (spec §8 B4/scenario 4), before any state is touched.
    pub fn new(args: EditSessionArgs<'a, C>) -> Result<Self, EditorError> {
        if let Some(switch) = &args.switch {
            if switch.repos_root != args.repos_root {
                return Err(EditorError::InvalidSwitch { url: switch.repos_root.clone() });
            }
        }
        Ok(Self {
            callbacks: args.callbacks,
            metadata: args.metadata,
            pristine: args.pristine,
            settings: args.settings,
            anchor_abspath: args.anchor_abspath,
            anchor_repos_relpath: args.anchor_repos_relpath,
            target_basename: args.target_basename,
            switch_new_relpath: args.switch.map(|s| s.new_repos_relpath),
            depth: args.depth,
            sticky_depth: args.sticky_depth,
            repos_root: args.repos_root,
            repos_uuid: args.repos_uuid,
            target_revision: None,
            root_opened: false,
            target_deleted: false,
            target_touched: false,
            close_edit_complete: false,
            skipped_trees: HashSet::new(),
            pending_work: args.pending_work,
            dirs: Vec::new(),
            files: Vec::new(),
            root_handle: None,
        })
    }

    /// Hands back whatever work queues are left over after this session
    /// ends, for a caller that wants to feed them into the next session
    /// against the same working copy (spec §5 I6, §8 B4/P6).
    pub fn into_pending_work(self) -> HashMap<RepoPathBuf, WorkQueue> {
        self.pending_work
    }

    pub fn skipped_trees(&self) -> &HashSet<RepoPathBuf> {
        &self.skipped_trees
    }

    fn check_cancel(&mut self) -> Result<(), EditorError> {
        match self.callbacks.check_cancelled() {
            Ok(()) => Ok(()),
            Err(Cancelled) => Err(EditorError::Cancelled),
        }
    }

    fn is_in_skipped_tree(&self, local_path: &RepoPath) -> bool {
        self.skipped_trees.iter().any(|victim| local_path.starts_with(victim.as_repo_path()))
    }

    fn dir(&self, handle: DirHandle) -> Result<&DirBaton, EditorError> {
        self.dirs[handle.0].as_ref().ok_or_else(|| {
            EditorError::MalformedStream(MalformedStreamError::UnmatchedClose {
                op: "directory",
                path: RepoPathBuf::root(),
            })
        })
    }

    fn dir_mut(&mut self, handle: DirHandle) -> Result<&mut DirBaton, EditorError> {
        self.dirs[handle.0].as_mut().ok_or_else(|| {
            EditorError::MalformedStream(MalformedStreamError::UnmatchedClose {
                op: "directory",
                path: RepoPathBuf::root(),
            })
        })
    }

    fn file_mut(&mut self, handle: FileHandle) -> Result<&mut FileBaton, EditorError> {
        self.files[handle.0].as_mut().ok_or_else(|| {
            EditorError::MalformedStream(MalformedStreamError::UnmatchedClose {
                op: "file",
                path: RepoPathBuf::root(),
            })
        })
    }

    fn push_dir(&mut self, baton: DirBaton) -> DirHandle {
        self.dirs.push(Some(baton));
        DirHandle(self.dirs.len() - 1)
    }

    fn push_file(&mut self, baton: FileBaton) -> FileHandle {
        self.files.push(Some(baton));
        FileHandle(self.files.len() - 1)
    }

    /// Joins a wire path against the anchor, rejecting traversal and the
    /// administrative directory name (spec §4.6).
    fn resolve_wire_path(&self, raw: &str) -> Result<(RepoPathBuf, PathBuf), EditorError> {
        let repo_path = RepoPath::from_internal_string(raw)
            .map_err(|_| {
                ObstructedUpdateError::from(PathEscapesAnchorError {
                    repo_path: RepoPathBuf::from_internal_string(raw.to_string()),
                    reason: EscapeReason::Traversal,
                })
            })?
            .to_owned();
        let abspath = repo_path
            .as_repo_path()
            .to_fs_path(&self.anchor_abspath)
            .map_err(ObstructedUpdateError::from)?;
        Ok((repo_path, abspath))
    }

    fn child_new_relpath(&self, parent: DirHandle, local_path: &RepoPath) -> Result<RepoPathBuf, EditorError> {
        let parent_baton = self.dir(parent)?;
        if parent_baton.parent.is_none() {
            if let (Some(target_basename), Some(switch_relpath)) =
                (&self.target_basename, &self.switch_new_relpath)
            {
                if local_path.basename() == Some(target_basename.as_str()) {
                    return Ok(switch_relpath.clone());
                }
            }
        }
        let name = local_path.basename().unwrap_or_default();
        Ok(parent_baton.new_repos_relpath.join(name))
    }

    fn on_disk_kind(&self, abspath: &Path) -> Option<NodeKind> {
        let metadata = fs::symlink_metadata(abspath).ok()?;
        if metadata.is_dir() {
            Some(NodeKind::Dir)
        } else if metadata.file_type().is_symlink() {
            Some(NodeKind::Symlink)
        } else if metadata.is_file() {
            Some(NodeKind::File)
        } else {
            Some(NodeKind::Unknown)
        }
    }

    /// Runs the classifier for one node, building its [`LocalIdentity`] and
    /// [`IncomingIdentity`] from the metadata store and the driver's own
    /// bookkeeping (spec §4.1).
    #[expect(clippy::too_many_arguments)]
    fn classify_node(
        &mut self,
        local_path: &RepoPath,
        new_repos_relpath: &RepoPath,
        incoming_kind: NodeKind,
        action: IncomingAction,
        on_disk_kind: Option<NodeKind>,
        under_conflicted_ancestor: bool,
    ) -> Result<(ClassifierOutput, crate::metadata::NodeState), EditorError> {
        let node = self.metadata.read_node(local_path)?;
        let status = derive_status(&node, on_disk_kind);
        let already_conflicted = node.actual.is_conflicted() && node.actual.tree_conflict.is_none();
        let all_edits_are_deletes = if matches!(incoming_kind, NodeKind::Dir) {
            classifier::deep_modification_check(self.metadata, local_path, &mut || {
                self.callbacks.check_cancelled().is_err()
            })?
        } else {
            matches!(
                node.working.as_ref().map(|w| &w.schedule),
                Some(WorkingSchedule::Delete) | Some(WorkingSchedule::BaseDeleted)
            )
        };
        let input = ClassifierInput {
            status,
            shadowed: node.is_shadowed(),
            base_status: node.base.as_ref().map(|b| b.status),
            already_conflicted,
            under_conflicted_ancestor,
            text_modified: node.actual.text_modified,
            prop_modified: node.actual.properties.is_some(),
            incoming_action: action.into(),
            incoming_kind,
            all_edits_are_deletes,
        };
        // When the victim is itself a preserved copy (spec §4.3), attach the
        // copy-from lineage to the conflict's left side instead of its own
        // BASE identity when the session is configured to do so
        // (SPEC_FULL.md §1.2, settings.preserve_copy_source_on_conflict).
        let copyfrom_identity = if self.settings.preserve_copy_source_on_conflict {
            match node.working.as_ref().map(|w| &w.schedule) {
                Some(WorkingSchedule::AddWithHistory { copyfrom_repos_relpath, copyfrom_revision }) => {
                    Some(LocalIdentity {
                        repos_root: self.repos_root.clone(),
                        repos_relpath: copyfrom_repos_relpath.clone(),
                        base_revision: *copyfrom_revision,
                        kind: node.base.as_ref().map(|b| b.kind).unwrap_or(incoming_kind),
                    })
                }
                _ => None,
            }
        } else {
            None
        };
        let local = copyfrom_identity.or_else(|| {
            node.base.as_ref().map(|b| LocalIdentity {
                repos_root: b.repos_root.clone(),
                repos_relpath: b.repos_relpath.clone(),
                base_revision: b.revision,
                kind: b.kind,
            })
        });
        let incoming = IncomingIdentity {
            repos_root: self.repos_root.clone(),
            repos_relpath: new_repos_relpath.to_owned(),
            target_revision: self.target_revision.unwrap_or(0),
            kind: incoming_kind,
        };
        let output = classifier::classify(&input, local_path, local.as_ref(), &incoming)?;
        Ok((output, node))
    }

    /// Records a newly-raised tree conflict: queues the ACTUAL-layer write
    /// on the owning directory's work queue, adds the victim to
    /// skipped-trees, and emits exactly one `tree_conflict` notification
    /// (spec §4.1 I4, §7 "exactly one notification").
    fn record_tree_conflict(
        &mut self,
        owner: DirHandle,
        local_path: &RepoPath,
        kind: NodeKind,
        reason: ConflictReason,
        action: IncomingAction,
        source_left: Option<ConflictedNodeVersion>,
        source_right: ConflictedNodeVersion,
    ) -> Result<(), EditorError> {
        debug!(path = %local_path.as_internal_str(), ?reason, "tree conflict recorded");
        let conflict = TreeConflict {
            reason,
            action: action.into(),
            source_left,
            source_right,
        };
        self.dir_mut(owner)?.work_queue.push(WorkItem::AddTreeConflict {
            path: local_path.to_owned(),
            conflict: Box::new(conflict),
        });
        self.skipped_trees.insert(local_path.to_owned());
        self.callbacks.notify(Notification {
            path: local_path.to_owned(),
            action: NotifyAction::TreeConflict,
            kind,
            content_state: ContentState::Unchanged,
            prop_state: PropState::None,
            lock_state: LockState::Unchanged,
            revision: None,
            old_revision: None,
            mime_type: None,
        });
        Ok(())
    }

    fn notify_skip(&mut self, local_path: &RepoPath, kind: NodeKind) {
        self.callbacks.notify(Notification {
            path: local_path.to_owned(),
            action: NotifyAction::Skip,
            kind,
            content_state: ContentState::Unchanged,
            prop_state: PropState::None,
            lock_state: LockState::Unchanged,
            revision: None,
            old_revision: None,
            mime_type: None,
        });
    }

    /// Runs a directory's deferred close-out the moment its bump-tracker ref
    /// count reaches zero (spec §4.5 I-completion; SPEC_FULL.md:186 "remove
    /// missing directory entries with a notification"), then propagates
    /// completion upward. `path` is the directory that just reached zero —
    /// used for the root case, where [`Completion::EditComplete`] carries no
    /// handle to read it back from.
    fn finish_dir_bump(&mut self, bump: BumpHandle, path: &RepoPath) -> Result<(), EditorError> {
        match bump.close() {
            None => {
                debug!("bump tracker has outstanding children at close; out-of-order nesting");
                Ok(())
            }
            Some(Completion::EditComplete) => {
                debug!("edit complete");
                self.sweep_stale_entries(path)
            }
            Some(Completion::DirectoryReady(handle)) => {
                let dir_path = handle.path();
                self.sweep_stale_entries(dir_path.as_repo_path())?;
                let _ = handle.bump_parent();
                Ok(())
            }
        }
    }

    // ---- set_target_revision ----------------------------------------

    #[instrument(skip(self))]
    pub fn set_target_revision(&mut self, revision: Revision) {
        self.target_revision = Some(revision);
    }

    fn target_revision_value(&self) -> Revision {
        self.target_revision.unwrap_or(0)
    }

    /// Marks a directory's BASE row `incomplete` while it is being brought
    /// to the target revision (spec §4.2 `open_root`/`open_directory`:
    /// "marks the BASE as being brought to target-revision with
    /// incomplete"). `close_directory` clears the status back to `normal`;
    /// if the edit is interrupted before that close, the next session's
    /// `open_root`/`open_directory` observes `was_incomplete` and runs the
    /// stale-regular-prop convergence sweep (spec §4.2 `close_directory`).
    fn mark_incomplete(&mut self, local_path: &RepoPath, repos_relpath: &RepoPath, existing: Option<&BaseState>) -> Result<(), EditorError> {
        let base = match existing {
            Some(b) => {
                let mut updated = b.clone();
                updated.status = BaseStatus::Incomplete;
                updated.revision = self.target_revision_value();
                updated
            }
            None => BaseState {
                status: BaseStatus::Incomplete,
                kind: NodeKind::Dir,
                revision: self.target_revision_value(),
                repos_relpath: repos_relpath.to_owned(),
                repos_root: self.repos_root.clone(),
                repos_uuid: self.repos_uuid.clone(),
                checksum: None,
                recorded_mtime_millis: 0,
                recorded_size: 0,
                depth: Some(self.depth),
                last_change: None,
                properties: PropertyMap::new(),
                wire_cache_properties: PropertyMap::new(),
            },
        };
        self.metadata.write_base(local_path, base)?;
        Ok(())
    }

    // ---- open_root -----------------------------------------------------

    #[instrument(skip(self))]
    pub fn open_root(&mut self, base_revision: Revision) -> Result<DirHandle, EditorError> {
        self.check_cancel()?;
        self.root_opened = true;
        let local_path = RepoPathBuf::root();
        let new_repos_relpath = if self.target_basename.is_none() {
            self.switch_new_relpath.clone().unwrap_or_else(|| self.anchor_repos_relpath.clone())
        } else {
            self.anchor_repos_relpath.clone()
        };

        let node = self.metadata.read_node(local_path.as_repo_path())?;
        let mut skip_this = false;
        let mut skip_descendants = false;
        if node.actual.tree_conflict.is_some() {
            skip_this = true;
            skip_descendants = true;
            self.skipped_trees.insert(local_path.clone());
            debug!("anchor already carries a tree conflict; skipping the whole edit");
            let target_kind = node.base.as_ref().map(|b| b.kind).unwrap_or(NodeKind::Dir);
            self.notify_skip(local_path.as_repo_path(), target_kind);
        }
        let was_incomplete = node.base.as_ref().is_some_and(|b| b.status == BaseStatus::Incomplete);
        // Spec §4.2 `open_root`: "If the anchor *is* the target, marks the
        // BASE as being brought to target-revision with incomplete" — the
        // anchor is the target exactly when there is no separate
        // `target_basename` naming a child of the anchor.
        if !skip_this && self.target_basename.is_none() {
            self.mark_incomplete(local_path.as_repo_path(), new_repos_relpath.as_repo_path(), node.base.as_ref())?;
        }

        let bump = BumpHandle::new_root(local_path.clone());
        let work_queue = self.pending_work.remove(&local_path).unwrap_or_default();
        let baton = DirBaton {
            parent: None,
            local_path,
            new_repos_relpath,
            old_revision: base_revision,
            requested_depth: self.depth,
            skip_this,
            skip_descendants,
            in_deleted_and_tree_conflicted_subtree: false,
            adding_dir: false,
            obstruction_found: false,
            add_existed: false,
            already_notified: skip_this,
            was_incomplete,
            prop_changes: Vec::new(),
            bump,
            work_queue,
        };
        let handle = self.push_dir(baton);
        self.root_handle = Some(handle);
        Ok(handle)
    }

    // ---- delete_entry ----------------------------------------------------

    #[instrument(skip(self))]
    pub fn delete_entry(&mut self, path: &str, revision: Revision, parent: DirHandle) -> Result<(), EditorError> {
        self.check_cancel()?;
        let (local_path, abspath) = self.resolve_wire_path(path)?;
        if self.is_target(local_path.as_repo_path()) {
            self.target_touched = true;
        }
        if self.dir(parent)?.skip_descendants || self.is_in_skipped_tree(local_path.as_repo_path()) {
            return Ok(());
        }
        let new_relpath = self.child_new_relpath(parent, local_path.as_repo_path())?;
        let on_disk_kind = self.on_disk_kind(&abspath);
        let under_conflicted_ancestor = self.dir(parent)?.in_deleted_and_tree_conflicted_subtree;
        let (output, node) = self.classify_node(
            local_path.as_repo_path(),
            new_relpath.as_repo_path(),
            node_kind_for_delete(&node_kind_hint(on_disk_kind)),
            IncomingAction::Delete,
            on_disk_kind,
            under_conflicted_ancestor,
        )?;
        let kind = node.base.as_ref().map(|b| b.kind).or(on_disk_kind).unwrap_or(NodeKind::File);

        match output {
            ClassifierOutput::SkipAlreadyConflicted => {
                self.notify_skip(local_path.as_repo_path(), kind);
                return Ok(());
            }
            ClassifierOutput::SkipObstructed => {
                self.notify_skip(local_path.as_repo_path(), kind);
                return Ok(());
            }
            ClassifierOutput::DeleteWithinConflictedAncestor => {
                self.queue_plain_delete(parent, &local_path, kind)?;
                return Ok(());
            }
            ClassifierOutput::TreeConflict { reason, source_left, source_right } => {
                self.record_tree_conflict(
                    parent,
                    local_path.as_repo_path(),
                    kind,
                    reason,
                    IncomingAction::Delete,
                    source_left,
                    source_right,
                )?;
                match reason {
                    ConflictReason::Deleted | ConflictReason::Obstructed => {
                        self.queue_plain_delete(parent, &local_path, kind)?;
                    }
                    ConflictReason::Edited | ConflictReason::Replaced | ConflictReason::Added => {
                        // Preserve the locally-modified content: schedule it
                        // as a fresh WORKING add rather than removing it
                        // (spec §4.2 delete_entry: "schedules a preserving
                        // copy of current content as WORKING and returns").
                        self.dir_mut(parent)?.work_queue.push(WorkItem::Move {
                            from: abspath.clone(),
                            to: abspath,
                        });
                        self.metadata.write_working(
                            local_path.as_repo_path(),
                            Some(crate::metadata::WorkingState { schedule: WorkingSchedule::Add }),
                        )?;
                    }
                }
                return Ok(());
            }
            ClassifierOutput::Proceed => {}
        }

        let _ = revision;
        self.queue_plain_delete(parent, &local_path, kind)
    }

    fn queue_plain_delete(&mut self, parent: DirHandle, local_path: &RepoPath, kind: NodeKind) -> Result<(), EditorError> {
        let abspath = local_path.to_fs_path(&self.anchor_abspath).map_err(ObstructedUpdateError::from)?;
        let parent_is_root = self.dir(parent)?.parent.is_none();
        let is_target = self
            .target_basename
            .as_deref()
            .is_some_and(|name| local_path.basename() == Some(name) && parent_is_root);
        self.dir_mut(parent)?.work_queue.push(WorkItem::Remove { path: abspath });
        if is_target {
            // Leave a not-present placeholder so the parent still reports
            // the target accurately (spec §4.2 delete_entry).
            let base = BaseState {
                status: BaseStatus::NotPresent,
                kind,
                revision: self.target_revision_value(),
                repos_relpath: local_path.to_owned(),
                repos_root: self.repos_root.clone(),
                repos_uuid: String::new(),
                checksum: None,
                recorded_mtime_millis: 0,
                recorded_size: 0,
                depth: None,
                last_change: None,
                properties: PropertyMap::new(),
                wire_cache_properties: PropertyMap::new(),
            };
            self.metadata.write_base(local_path, base)?;
            self.target_deleted = true;
        } else {
            self.metadata.remove_node(local_path)?;
        }
        self.callbacks.notify(Notification {
            path: local_path.to_owned(),
            action: NotifyAction::UpdateDelete,
            kind,
            content_state: ContentState::Unchanged,
            prop_state: PropState::None,
            lock_state: LockState::Unchanged,
            revision: Some(self.target_revision_value()),
            old_revision: None,
            mime_type: None,
        });
        Ok(())
    }

    // ---- add_directory / open_directory --------------------------------

    #[instrument(skip(self))]
    pub fn add_directory(
        &mut self,
        path: &str,
        parent: DirHandle,
        copyfrom: Option<(RepoPathBuf, Revision)>,
    ) -> Result<DirHandle, EditorError> {
        self.check_cancel()?;
        if copyfrom.is_some() {
            let (local_path, _) = self.resolve_wire_path(path)?;
            return Err(UnsupportedFeatureError::AddDirectoryWithCopyfrom { path: local_path }.into());
        }
        let (local_path, abspath) = self.resolve_wire_path(path)?;
        if local_path.basename() == Some(crate::repo_path::ADMIN_DIR_NAME) {
            return Err(ObstructedUpdateError::UnversionedObstruction { path: local_path, found: NodeKind::Dir }.into());
        }
        if self.is_target(local_path.as_repo_path()) {
            self.target_touched = true;
        }

        let parent_baton = self.dir(parent)?;
        if parent_baton.skip_descendants {
            return self.open_skipped_dir(parent, local_path);
        }
        let new_relpath = self.child_new_relpath(parent, local_path.as_repo_path())?;
        let on_disk_kind = self.on_disk_kind(&abspath);
        let under_conflicted_ancestor = parent_baton.in_deleted_and_tree_conflicted_subtree;

        let (output, node) = self.classify_node(
            local_path.as_repo_path(),
            new_relpath.as_repo_path(),
            NodeKind::Dir,
            IncomingAction::Add,
            on_disk_kind,
            under_conflicted_ancestor,
        )?;

        let mut add_existed = false;
        let mut obstruction_found = false;
        match on_disk_kind {
            None => {}
            Some(NodeKind::Dir) => {
                if node.base.is_some() && !matches!(derive_status(&node, on_disk_kind), DerivedStatus::Added) {
                    // A versioned directory already present and not
                    // locally added: fall through to the classifier's
                    // verdict below (tree conflict or skip).
                } else if matches!(derive_status(&node, on_disk_kind), DerivedStatus::Added) {
                    add_existed = true;
                } else if self.settings.allow_unver_obstructions {
                    obstruction_found = true;
                } else {
                    return Err(ObstructedUpdateError::UnversionedObstruction { path: local_path, found: NodeKind::Dir }.into());
                }
            }
            Some(found) => {
                return Err(ObstructedUpdateError::KindMismatch { path: local_path, found, expected: NodeKind::Dir }.into());
            }
        }

        match output {
            ClassifierOutput::SkipAlreadyConflicted | ClassifierOutput::SkipObstructed => {
                self.notify_skip(local_path.as_repo_path(), NodeKind::Dir);
                return self.open_skipped_dir(parent, local_path);
            }
            ClassifierOutput::DeleteWithinConflictedAncestor => {
                // Handled as a normal add beneath an ancestor already in
                // conflict: proceed, but mark the flag for our own
                // descendants too.
            }
            ClassifierOutput::TreeConflict { reason, source_left, source_right } => {
                self.record_tree_conflict(
                    parent,
                    local_path.as_repo_path(),
                    NodeKind::Dir,
                    reason,
                    IncomingAction::Add,
                    source_left,
                    source_right,
                )?;
                return self.open_skipped_dir(parent, local_path);
            }
            ClassifierOutput::Proceed => {}
        }

        let requested_depth = child_depth(self.dir(parent)?.requested_depth, self.is_target(&local_path));
        fs::create_dir_all(&abspath).context(&abspath)?;
        self.metadata.write_working(
            local_path.as_repo_path(),
            Some(crate::metadata::WorkingState { schedule: WorkingSchedule::Add }),
        )?;
        if !self.metadata.holds_write_lock(local_path.as_repo_path()) {
            self.metadata.acquire_write_lock(local_path.as_repo_path())?;
        }

        let parent_bump = self.dir(parent)?.bump.clone();
        let bump = parent_bump.open_child(local_path.clone());
        let work_queue = self.pending_work.remove(&local_path).unwrap_or_default();
        let baton = DirBaton {
            parent: Some(parent),
            local_path,
            new_repos_relpath: new_relpath,
            old_revision: 0,
            requested_depth,
            skip_this: false,
            skip_descendants: false,
            in_deleted_and_tree_conflicted_subtree: matches!(output, ClassifierOutput::DeleteWithinConflictedAncestor),
            adding_dir: true,
            obstruction_found,
            add_existed,
            already_notified: false,
            was_incomplete: false,
            prop_changes: Vec::new(),
            bump,
            work_queue,
        };
        Ok(self.push_dir(baton))
    }

    fn is_target(&self, local_path: &RepoPath) -> bool {
        match &self.target_basename {
            None => local_path.is_root(),
            Some(name) => local_path.basename() == Some(name.as_str()) && local_path.parent().map(|p| p.is_root()).unwrap_or(false),
        }
    }

    /// Opens a baton for a node that inherited `skip_descendants` from its
    /// parent: bumps the parent's ref count for bookkeeping but performs no
    /// metadata or classifier work (spec SPEC_FULL.md §1.2 short-circuit).
    fn open_skipped_dir(&mut self, parent: DirHandle, local_path: RepoPathBuf) -> Result<DirHandle, EditorError> {
        self.skipped_trees.insert(local_path.clone());
        let parent_bump = self.dir(parent)?.bump.clone();
        let bump = parent_bump.open_child(local_path.clone());
        bump.mark_skipped();
        let new_repos_relpath = self.child_new_relpath(parent, local_path.as_repo_path())?;
        let baton = DirBaton {
            parent: Some(parent),
            local_path,
            new_repos_relpath,
            old_revision: 0,
            requested_depth: Depth::Infinity,
            skip_this: true,
            skip_descendants: true,
            in_deleted_and_tree_conflicted_subtree: false,
            adding_dir: false,
            obstruction_found: false,
            add_existed: false,
            already_notified: true,
            was_incomplete: false,
            prop_changes: Vec::new(),
            bump,
            work_queue: WorkQueue::new(),
        };
        Ok(self.push_dir(baton))
    }

    #[instrument(skip(self))]
    pub fn open_directory(
        &mut self,
        path: &str,
        parent: DirHandle,
        base_revision: Revision,
    ) -> Result<DirHandle, EditorError> {
        self.check_cancel()?;
        let (local_path, abspath) = self.resolve_wire_path(path)?;
        if self.is_target(local_path.as_repo_path()) {
            self.target_touched = true;
        }
        if self.dir(parent)?.skip_descendants {
            return self.open_skipped_dir(parent, local_path);
        }
        if !self.metadata.holds_write_lock(local_path.as_repo_path()) {
            self.metadata.acquire_write_lock(local_path.as_repo_path())?;
        }
        let new_relpath = self.child_new_relpath(parent, local_path.as_repo_path())?;
        let on_disk_kind = self.on_disk_kind(&abspath);
        let under_conflicted_ancestor = self.dir(parent)?.in_deleted_and_tree_conflicted_subtree;
        let (output, node) = self.classify_node(
            local_path.as_repo_path(),
            new_relpath.as_repo_path(),
            NodeKind::Dir,
            IncomingAction::Edit,
            on_disk_kind,
            under_conflicted_ancestor,
        )?;
        let was_incomplete = node.base.as_ref().is_some_and(|b| b.status == BaseStatus::Incomplete);

        let mut skip_this = false;
        let mut skip_descendants = false;
        let mut in_deleted_and_tree_conflicted_subtree = under_conflicted_ancestor;
        match output {
            ClassifierOutput::SkipAlreadyConflicted | ClassifierOutput::SkipObstructed => {
                self.notify_skip(local_path.as_repo_path(), NodeKind::Dir);
                skip_this = true;
                skip_descendants = true;
            }
            ClassifierOutput::DeleteWithinConflictedAncestor => {
                in_deleted_and_tree_conflicted_subtree = true;
            }
            ClassifierOutput::TreeConflict { reason, source_left, source_right } => {
                self.record_tree_conflict(
                    parent,
                    local_path.as_repo_path(),
                    NodeKind::Dir,
                    reason,
                    IncomingAction::Edit,
                    source_left,
                    source_right,
                )?;
                skip_this = true;
                // "descendants are still visited but flagged... so each
                // child will be marked deleted rather than updated" (spec
                // §4.2 open_directory) for deleted/replaced reasons.
                if matches!(reason, ConflictReason::Deleted | ConflictReason::Replaced) {
                    in_deleted_and_tree_conflicted_subtree = true;
                } else {
                    skip_descendants = true;
                }
            }
            ClassifierOutput::Proceed => {}
        }

        if skip_this {
            self.skipped_trees.insert(local_path.clone());
        } else {
            // Spec §4.2 `open_directory`: "Marks the directory as being
            // brought to target-revision and incomplete."
            self.mark_incomplete(local_path.as_repo_path(), new_relpath.as_repo_path(), node.base.as_ref())?;
        }

        let parent_bump = self.dir(parent)?.bump.clone();
        let bump = parent_bump.open_child(local_path.clone());
        if skip_descendants {
            bump.mark_skipped();
        }
        let work_queue = self.pending_work.remove(&local_path).unwrap_or_default();
        let requested_depth = child_depth(self.dir(parent)?.requested_depth, self.is_target(&local_path));
        let baton = DirBaton {
            parent: Some(parent),
            local_path,
            new_repos_relpath: new_relpath,
            old_revision: base_revision,
            requested_depth,
            skip_this,
            skip_descendants,
            in_deleted_and_tree_conflicted_subtree,
            adding_dir: false,
            obstruction_found: false,
            add_existed: false,
            already_notified: skip_this,
            was_incomplete,
            prop_changes: Vec::new(),
            bump,
            work_queue,
        };
        Ok(self.push_dir(baton))
    }

    #[instrument(skip(self))]
    pub fn change_dir_prop(&mut self, dir: DirHandle, name: &str, value: Option<Vec<u8>>) -> Result<(), EditorError> {
        self.check_cancel()?;
        self.dir_mut(dir)?.prop_changes.push((name.to_string(), value));
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn absent_directory(&mut self, path: &str, parent: DirHandle) -> Result<(), EditorError> {
        self.absent_node(path, parent, NodeKind::Dir, "directory")
    }

    #[instrument(skip(self))]
    pub fn absent_file(&mut self, path: &str, parent: DirHandle) -> Result<(), EditorError> {
        self.absent_node(path, parent, NodeKind::File, "file")
    }

    fn absent_node(&mut self, path: &str, parent: DirHandle, kind: NodeKind, label: &'static str) -> Result<(), EditorError> {
        self.check_cancel()?;
        let (local_path, _) = self.resolve_wire_path(path)?;
        if self.is_target(local_path.as_repo_path()) {
            self.target_touched = true;
        }
        if self.dir(parent)?.skip_descendants || self.is_in_skipped_tree(local_path.as_repo_path()) {
            return Ok(());
        }
        let node = self.metadata.read_node(local_path.as_repo_path())?;
        if node.base.is_some() {
            return Err(MalformedStreamError::AbsentOnExistingBase { path: local_path, kind: label }.into());
        }
        let base = BaseState {
            status: BaseStatus::Absent,
            kind,
            revision: self.target_revision_value(),
            repos_relpath: local_path.to_owned(),
            repos_root: self.repos_root.clone(),
            repos_uuid: String::new(),
            checksum: None,
            recorded_mtime_millis: 0,
            recorded_size: 0,
            depth: None,
            last_change: None,
            properties: PropertyMap::new(),
            wire_cache_properties: PropertyMap::new(),
        };
        self.metadata.write_base(local_path.as_repo_path(), base)?;
        Ok(())
    }

    // ---- close_directory --------------------------------------------------

    #[instrument(skip(self))]
    pub fn close_directory(&mut self, dir: DirHandle) -> Result<(), EditorError> {
        self.check_cancel()?;
        let Some(mut baton) = self.dirs[dir.0].take() else {
            return Err(MalformedStreamError::UnmatchedClose { op: "close_directory", path: RepoPathBuf::root() }.into());
        };

        if baton.skip_this {
            let local_path = baton.local_path.clone();
            self.finish_dir_bump(baton.bump, local_path.as_repo_path())?;
            return Ok(());
        }

        let (entry_props, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut baton.prop_changes).into_iter().partition(|(name, _)| is_entry_prop(name));
        let (wire_cache_props, regular_props): (Vec<_>, Vec<_>) =
            rest.into_iter().partition(|(name, _)| is_wire_cache_prop(name));

        let node = self.metadata.read_node(baton.local_path.as_repo_path())?;
        let mut new_base_props = node.base.as_ref().map(|b| b.properties.clone()).unwrap_or_default();
        let mut new_wire_cache_props = node.base.as_ref().map(|b| b.wire_cache_properties.clone()).unwrap_or_default();
        apply_propchanges(&mut new_wire_cache_props, &wire_cache_props);
        if baton.was_incomplete {
            let mentioned: HashSet<&str> = regular_props.iter().map(|(n, _)| n.as_str()).collect();
            let stale: Vec<String> = new_base_props.keys().filter(|k| !mentioned.contains(k.as_str())).cloned().collect();
            for key in stale {
                new_base_props.shift_remove(&key);
            }
        }
        for (name, value) in &regular_props {
            match value {
                Some(v) => {
                    new_base_props.insert(name.clone(), v.clone());
                }
                None => {
                    new_base_props.shift_remove(name);
                }
            }
        }

        let mut last_change = node.base.as_ref().and_then(|b| b.last_change.clone());
        for (name, value) in &entry_props {
            match (name.as_str(), value) {
                (ENTRY_PROP_LAST_CHANGED_REV, Some(v)) => {
                    let rev: Revision = String::from_utf8_lossy(v).parse().unwrap_or(self.target_revision_value());
                    last_change.get_or_insert(LastChange { revision: rev, date: Utc::now(), author: String::new() }).revision = rev;
                }
                (ENTRY_PROP_LAST_CHANGED_AUTHOR, Some(v)) => {
                    let author = String::from_utf8_lossy(v).into_owned();
                    last_change
                        .get_or_insert(LastChange { revision: self.target_revision_value(), date: Utc::now(), author: String::new() })
                        .author = author;
                }
                _ => {}
            }
        }

        if let Some(externals_change) = regular_props.iter().find(|(name, _)| name == PROP_EXTERNALS) {
            let old_value = node.base.as_ref().and_then(|b| b.properties.get(PROP_EXTERNALS)).map(|v| v.as_slice());
            self.callbacks.externals_changed(
                &baton.local_path.as_repo_path().to_fs_path(&self.anchor_abspath).unwrap_or_else(|_| self.anchor_abspath.clone()),
                old_value,
                externals_change.1.as_deref(),
                to_notify_depth(baton.requested_depth),
            );
        }

        // Depth-adjust only when sticky and the incoming depth dominates the
        // recorded one; otherwise a locally-narrowed depth survives the
        // update rather than silently widening back out (spec §4.5, §9
        // "Ambient-depth filtering"; SPEC_FULL.md §1.1 `sticky_depth`).
        let recorded_depth = node.base.as_ref().and_then(|b| b.depth);
        let effective_depth = match recorded_depth {
            Some(old) if self.sticky_depth && !baton.requested_depth.dominates(old) => old,
            _ => baton.requested_depth,
        };

        let new_base = BaseState {
            status: BaseStatus::Normal,
            kind: NodeKind::Dir,
            revision: self.target_revision_value(),
            repos_relpath: baton.new_repos_relpath.clone(),
            repos_root: self.repos_root.clone(),
            repos_uuid: String::new(),
            checksum: None,
            recorded_mtime_millis: 0,
            recorded_size: 0,
            depth: Some(effective_depth),
            last_change,
            properties: new_base_props.clone(),
            wire_cache_properties: new_wire_cache_props,
        };
        self.metadata.write_base(baton.local_path.as_repo_path(), new_base)?;
        self.metadata.write_working(baton.local_path.as_repo_path(), None)?;

        let mut actual = node.actual.clone();
        if actual.properties.as_ref() == Some(&new_base_props) {
            actual.properties = None;
        }
        self.metadata.write_actual(baton.local_path.as_repo_path(), actual)?;

        baton.work_queue.push(WorkItem::WriteOldPropsFile {
            path: baton.local_path.as_repo_path().to_fs_path(&self.anchor_abspath).unwrap_or_else(|_| self.anchor_abspath.clone()),
            properties: new_base_props,
        });

        let local_path = baton.local_path.clone();
        let mut work_queue = std::mem::take(&mut baton.work_queue);
        let run_result = work_queue.run(&self.pristine, self.metadata, &mut || self.callbacks.check_cancelled().is_err());
        self.pending_work.insert(local_path, work_queue);
        run_result?;

        self.finish_dir_bump(baton.bump, baton.local_path.as_repo_path())?;
        Ok(())
    }

    // ---- add_file / open_file ------------------------------------------

    #[instrument(skip(self))]
    pub fn add_file(
        &mut self,
        path: &str,
        parent: DirHandle,
        copyfrom: Option<(RepoPathBuf, Revision)>,
    ) -> Result<FileHandle, EditorError> {
        self.check_cancel()?;
        let (local_path, abspath) = self.resolve_wire_path(path)?;
        if local_path.basename() == Some(crate::repo_path::ADMIN_DIR_NAME) {
            return Err(ObstructedUpdateError::UnversionedObstruction { path: local_path, found: NodeKind::File }.into());
        }
        if self.is_target(local_path.as_repo_path()) {
            self.target_touched = true;
        }
        if self.dir(parent)?.skip_descendants {
            return self.open_skipped_file(parent, local_path);
        }
        let new_relpath = self.child_new_relpath(parent, local_path.as_repo_path())?;
        let on_disk_kind = self.on_disk_kind(&abspath);
        let under_conflicted_ancestor = self.dir(parent)?.in_deleted_and_tree_conflicted_subtree;
        let (output, node) = self.classify_node(
            local_path.as_repo_path(),
            new_relpath.as_repo_path(),
            NodeKind::File,
            IncomingAction::Add,
            on_disk_kind,
            under_conflicted_ancestor,
        )?;

        let mut add_existed = false;
        let mut obstruction_found = false;
        match on_disk_kind {
            None => {}
            Some(NodeKind::File) if matches!(derive_status(&node, on_disk_kind), DerivedStatus::Added) => {
                add_existed = true;
            }
            Some(found) if found != NodeKind::File => {
                return Err(ObstructedUpdateError::KindMismatch { path: local_path, found, expected: NodeKind::File }.into());
            }
            Some(_) => {
                if self.settings.allow_unver_obstructions {
                    obstruction_found = true;
                } else {
                    return Err(ObstructedUpdateError::UnversionedObstruction { path: local_path, found: NodeKind::File }.into());
                }
            }
        }

        let mut already_conflicted = false;
        match output {
            ClassifierOutput::SkipAlreadyConflicted | ClassifierOutput::SkipObstructed => {
                self.notify_skip(local_path.as_repo_path(), NodeKind::File);
                return self.open_skipped_file(parent, local_path);
            }
            ClassifierOutput::DeleteWithinConflictedAncestor => {}
            ClassifierOutput::TreeConflict { reason, source_left, source_right } => {
                self.record_tree_conflict(
                    parent,
                    local_path.as_repo_path(),
                    NodeKind::File,
                    reason,
                    IncomingAction::Add,
                    source_left,
                    source_right,
                )?;
                already_conflicted = true;
            }
            ClassifierOutput::Proceed => {}
        }

        let schedule = if matches!(node.working.as_ref().map(|w| &w.schedule), Some(WorkingSchedule::Replace)) {
            MergeSchedule::Replace
        } else {
            MergeSchedule::None
        };
        self.metadata.write_working(
            local_path.as_repo_path(),
            Some(crate::metadata::WorkingState { schedule: WorkingSchedule::Add }),
        )?;

        let copyfrom_install = if let Some((copyfrom_relpath, copyfrom_rev)) = copyfrom {
            self.resolve_copyfrom(&local_path, copyfrom_relpath, copyfrom_rev)?
        } else {
            None
        };

        let parent_bump = self.dir(parent)?.bump.clone();
        parent_bump.bump_for_file();
        let baton = FileBaton {
            parent,
            local_path,
            new_repos_relpath: new_relpath,
            adding: true,
            add_existed,
            skip_this: false,
            obstruction_found,
            already_conflicted,
            schedule,
            prop_changes: Vec::new(),
            pending_delta: None,
            finished_pristine: None,
            copyfrom_install,
            last_changed_date: None,
            last_changed_rev: None,
            last_changed_author: None,
            bump: parent_bump,
        };
        Ok(self.push_file(baton))
    }

    fn resolve_copyfrom(
        &mut self,
        target_local_path: &RepoPathBuf,
        copyfrom_relpath: RepoPathBuf,
        copyfrom_revision: Revision,
    ) -> Result<Option<add_with_history::InstallResult>, EditorError> {
        let request = CopyfromRequest { copyfrom_repos_relpath: copyfrom_relpath, copyfrom_revision };
        let target_dir = target_local_path.as_repo_path().parent().map(|p| p.to_owned()).unwrap_or_else(RepoPathBuf::root);
        let wc_revision = self.target_revision_value();
        let found = add_with_history::locate(self.metadata, target_local_path, target_dir.as_repo_path(), &request, wc_revision)?;
        match found {
            Some(source) => {
                Ok(Some(add_with_history::install_from_local(&self.pristine, &self.anchor_abspath, &source)?))
            }
            None => {
                let mut buf = Vec::new();
                let props = self
                    .callbacks
                    .fetch(&request.copyfrom_repos_relpath, copyfrom_revision, &mut buf)
                    .map_err(|source| EditorError::Io(PathError { path: PathBuf::new(), source }))?;
                Ok(Some(add_with_history::install_from_fetch(&self.pristine, &buf[..], props)?))
            }
        }
    }

    fn open_skipped_file(&mut self, parent: DirHandle, local_path: RepoPathBuf) -> Result<FileHandle, EditorError> {
        self.skipped_trees.insert(local_path.clone());
        let parent_bump = self.dir(parent)?.bump.clone();
        parent_bump.bump_for_file();
        let new_relpath = self.child_new_relpath(parent, local_path.as_repo_path())?;
        let baton = FileBaton {
            parent,
            local_path,
            new_repos_relpath: new_relpath,
            adding: false,
            add_existed: false,
            skip_this: true,
            obstruction_found: false,
            already_conflicted: true,
            schedule: MergeSchedule::None,
            prop_changes: Vec::new(),
            pending_delta: None,
            finished_pristine: None,
            copyfrom_install: None,
            last_changed_date: None,
            last_changed_rev: None,
            last_changed_author: None,
            bump: parent_bump,
        };
        Ok(self.push_file(baton))
    }

    #[instrument(skip(self))]
    pub fn open_file(&mut self, path: &str, parent: DirHandle, _base_revision: Revision) -> Result<FileHandle, EditorError> {
        self.check_cancel()?;
        let (local_path, abspath) = self.resolve_wire_path(path)?;
        if self.is_target(local_path.as_repo_path()) {
            self.target_touched = true;
        }
        if self.dir(parent)?.skip_descendants {
            return self.open_skipped_file(parent, local_path);
        }
        let new_relpath = self.child_new_relpath(parent, local_path.as_repo_path())?;
        let on_disk_kind = self.on_disk_kind(&abspath);
        let under_conflicted_ancestor = self.dir(parent)?.in_deleted_and_tree_conflicted_subtree;
        let (output, _node) = self.classify_node(
            local_path.as_repo_path(),
            new_relpath.as_repo_path(),
            NodeKind::File,
            IncomingAction::Edit,
            on_disk_kind,
            under_conflicted_ancestor,
        )?;

        let mut skip_this = false;
        let mut already_conflicted = false;
        match output {
            ClassifierOutput::SkipAlreadyConflicted | ClassifierOutput::SkipObstructed => {
                self.notify_skip(local_path.as_repo_path(), NodeKind::File);
                skip_this = true;
                already_conflicted = true;
            }
            ClassifierOutput::DeleteWithinConflictedAncestor => {}
            ClassifierOutput::TreeConflict { reason, source_left, source_right } => {
                self.record_tree_conflict(
                    parent,
                    local_path.as_repo_path(),
                    NodeKind::File,
                    reason,
                    IncomingAction::Edit,
                    source_left,
                    source_right,
                )?;
                skip_this = true;
                already_conflicted = true;
            }
            ClassifierOutput::Proceed => {}
        }

        let parent_bump = self.dir(parent)?.bump.clone();
        parent_bump.bump_for_file();
        let baton = FileBaton {
            parent,
            local_path,
            new_repos_relpath: new_relpath,
            adding: false,
            add_existed: false,
            skip_this,
            obstruction_found: false,
            already_conflicted,
            schedule: MergeSchedule::None,
            prop_changes: Vec::new(),
            pending_delta: None,
            finished_pristine: None,
            copyfrom_install: None,
            last_changed_date: None,
            last_changed_rev: None,
            last_changed_author: None,
            bump: parent_bump,
        };
        Ok(self.push_file(baton))
    }

    #[instrument(skip(self))]
    pub fn change_file_prop(&mut self, file: FileHandle, name: &str, value: Option<Vec<u8>>) -> Result<(), EditorError> {
        self.check_cancel()?;
        if name == ENTRY_PROP_LAST_CHANGED_DATE {
            if let Some(v) = &value {
                if let Ok(date) = DateTime::parse_from_rfc3339(&String::from_utf8_lossy(v)) {
                    self.file_mut(file)?.last_changed_date = Some(date.with_timezone(&Utc));
                }
            }
        }
        self.file_mut(file)?.prop_changes.push((name.to_string(), value));
        Ok(())
    }

    // ---- apply_textdelta -------------------------------------------------

    #[instrument(skip(self))]
    pub fn apply_textdelta(&mut self, file: FileHandle, expected_source_md5: Option<Md5Checksum>) -> Result<(), EditorError> {
        self.check_cancel()?;
        let baton = self.file_mut(file)?;
        if baton.skip_this {
            return Ok(());
        }
        let local_path = baton.local_path.clone();
        let adding = baton.adding;

        if !adding {
            let node = self.metadata.read_node(local_path.as_repo_path())?;
            if let Some(base) = &node.base {
                if let Some((recorded_md5, sha1)) = &base.checksum {
                    if let Some(expected) = &expected_source_md5 {
                        if recorded_md5 != expected {
                            return Err(CorruptTextBaseError::SourceMismatch {
                                path: local_path,
                                recorded: recorded_md5.clone(),
                                expected: expected.clone(),
                            }
                            .into());
                        }
                    }
                    let mut reader = Md5Reader::new(self.pristine.read_by_sha1(sha1)?);
                    io::copy(&mut reader, &mut io::sink()).context(&local_path.as_repo_path().to_fs_path(&self.anchor_abspath).unwrap_or_default())?;
                    let actual = reader.finish();
                    if actual != *recorded_md5 {
                        return Err(CorruptTextBaseError::SourceCorruption { path: local_path, actual, recorded: recorded_md5.clone() }.into());
                    }
                }
            }
        }

        let handle = self.pristine.open_writable()?;
        let cloned = handle.try_clone_file().context(handle.path())?;
        let pending = PendingTextDelta { handle, writer: DualChecksumWriter::new(cloned) };
        self.file_mut(file)?.pending_delta = Some(pending);
        Ok(())
    }

    pub fn write_textdelta_window(&mut self, file: FileHandle, bytes: &[u8]) -> Result<(), EditorError> {
        self.check_cancel()?;
        let baton = self.file_mut(file)?;
        if baton.skip_this {
            return Ok(());
        }
        let Some(pending) = baton.pending_delta.as_mut() else {
            return Err(MalformedStreamError::TextDeltaAfterClose { path: baton.local_path.clone() }.into());
        };
        let path = pending.handle.path().to_path_buf();
        pending.writer.write_all(bytes).context(&path)?;
        Ok(())
    }

    /// The "null window": finalizes the dual checksum and stashes the
    /// produced pristine for `close_file` to install (spec §4.2
    /// `apply_textdelta`: "When the final window arrives... the source
    /// stream is closed and the source MD5 checked").
    pub fn close_textdelta(&mut self, file: FileHandle) -> Result<(), EditorError> {
        let baton = self.file_mut(file)?;
        if baton.skip_this {
            return Ok(());
        }
        let Some(pending) = baton.pending_delta.take() else {
            return Ok(());
        };
        let path = pending.handle.path().to_path_buf();
        let mut writer = pending.writer;
        writer.flush().context(&path)?;
        let (_file, md5, sha1) = writer.finish();
        baton.finished_pristine = Some((pending.handle, md5, sha1));
        Ok(())
    }

    // ---- close_file --------------------------------------------------

    #[instrument(skip(self))]
    pub fn close_file(&mut self, file: FileHandle, expected_md5: Option<Md5Checksum>) -> Result<(), EditorError> {
        self.check_cancel()?;
        let Some(baton) = self.files[file.0].take() else {
            return Err(MalformedStreamError::UnmatchedClose { op: "close_file", path: RepoPathBuf::root() }.into());
        };

        if baton.skip_this {
            let parent_path = self.dir(baton.parent)?.local_path.clone();
            self.finish_dir_bump(baton.bump, parent_path.as_repo_path())?;
            return Ok(());
        }

        let new_pristine_sha1 = if let Some((handle, md5, sha1)) = baton.finished_pristine {
            if let Some(expected) = &expected_md5 {
                if *expected != md5 {
                    return Err(CorruptTextBaseError::ProducedMismatch { path: baton.local_path, actual: md5, expected: expected.clone() }.into());
                }
            }
            self.pristine.install(handle, &sha1)?;
            debug_assert!(self.pristine.present(&sha1), "install must make pristine present (spec P3)");
            Some((md5, sha1))
        } else {
            None
        };

        let node = self.metadata.read_node(baton.local_path.as_repo_path())?;
        let (entry_props, rest): (Vec<_>, Vec<_>) = baton.prop_changes.into_iter().partition(|(name, _)| is_entry_prop(name));
        let (wire_cache_props, regular_props): (Vec<_>, Vec<_>) =
            rest.into_iter().partition(|(name, _)| is_wire_cache_prop(name));
        let mut new_wire_cache_props = node.base.as_ref().map(|b| b.wire_cache_properties.clone()).unwrap_or_default();
        apply_propchanges(&mut new_wire_cache_props, &wire_cache_props);

        let mut new_base_props = node.base.as_ref().map(|b| b.properties.clone()).unwrap_or_default();
        let mut lock_removed = false;
        for (name, value) in &entry_props {
            if name == ENTRY_PROP_LOCK_TOKEN && value.is_none() {
                lock_removed = true;
            }
        }
        let mut magic_property_changed = false;
        for (name, value) in &regular_props {
            if matches!(name.as_str(), "keywords" | "eol-style" | "executable" | "needs-lock" | "special") {
                magic_property_changed = true;
            }
            match value {
                Some(v) => {
                    new_base_props.insert(name.clone(), v.clone());
                }
                None => {
                    new_base_props.shift_remove(name);
                }
            }
        }

        let abspath = baton.local_path.as_repo_path().to_fs_path(&self.anchor_abspath).map_err(ObstructedUpdateError::from)?;
        let local_text = if baton.copyfrom_install.is_some() {
            LocalTextState::Unmodified
        } else if !abspath.is_file() {
            if baton.adding { LocalTextState::Unmodified } else { LocalTextState::Missing }
        } else if node.actual.text_modified {
            LocalTextState::Modified
        } else {
            LocalTextState::Unmodified
        };

        let merge_input = MergeFileInput {
            schedule: baton.schedule,
            local_text,
            obstruction_allowed: baton.obstruction_found,
            new_pristine_present: new_pristine_sha1.is_some() || baton.copyfrom_install.is_some(),
            magic_property_changed,
            has_keyword_expansion: new_base_props.contains_key("keywords"),
            already_conflicted: baton.already_conflicted,
        };

        let mut merge_result = None;
        let mut merge_temp: Option<PathBuf> = None;
        if local_text == LocalTextState::Modified && merge_input.new_pristine_present && !baton.obstruction_found && baton.schedule != MergeSchedule::Replace {
            let old_bytes = node
                .base
                .as_ref()
                .and_then(|b| b.checksum.as_ref())
                .map(|(_, sha1)| self.pristine.read_by_sha1(sha1))
                .transpose()?
                .map(read_all)
                .transpose()?
                .unwrap_or_default();
            let working_bytes = fs::read(&abspath).unwrap_or_default();
            let new_bytes = if let Some((_, sha1)) = &new_pristine_sha1 {
                read_all(self.pristine.read_by_sha1(sha1)?)?
            } else {
                Vec::new()
            };
            let (merged_bytes, outcome) = merge_file::merge_lines(&old_bytes, &working_bytes, &new_bytes);
            merge_result = Some(outcome);
            let temp = tempfile::NamedTempFile::new_in(&self.anchor_abspath).context(&self.anchor_abspath)?;
            fs::write(temp.path(), &merged_bytes).context(temp.path())?;
            let (_file, path) = temp.keep().map_err(|e| PathError { path: self.anchor_abspath.clone(), source: e.error })?;
            merge_temp = Some(path);
        }

        let plan = merge_file::plan_install(&merge_input, merge_result);

        let owner = baton.parent;
        if plan.install_pristine {
            let source = match &plan.install_from {
                Some(InstallFrom::NewPristine) | None => {
                    if let Some((_, sha1)) = &new_pristine_sha1 {
                        InstallSource::Pristine(sha1.clone())
                    } else if let Some(copyfrom) = &baton.copyfrom_install {
                        InstallSource::Pristine(copyfrom.pristine_sha1.clone())
                    } else {
                        InstallSource::Pristine(new_base_props_checksum_placeholder())
                    }
                }
                Some(InstallFrom::Temp(_)) => InstallSource::Temp(merge_temp.clone().unwrap_or_default()),
            };
            self.dir_mut(owner)?.work_queue.push(WorkItem::InstallFile {
                dest: abspath.clone(),
                source,
                executable: new_base_props.contains_key("executable"),
            });
        } else if let Some(working_text_path) = baton.copyfrom_install.as_ref().and_then(|c| c.working_text_path.clone()) {
            self.dir_mut(owner)?.work_queue.push(WorkItem::Move { from: working_text_path, to: abspath.clone() });
        }

        if plan.queue_timestamp_and_record_info && self.settings.use_commit_times {
            if let Some(date) = baton.last_changed_date {
                self.dir_mut(owner)?.work_queue.push(WorkItem::SetMtime {
                    path: abspath.clone(),
                    millis: crate::file_util::MillisSinceEpoch(date.timestamp_millis()),
                });
            }
        }
        if lock_removed && !plan.install_pristine {
            self.dir_mut(owner)?.work_queue.push(WorkItem::SyncFileFlags {
                path: abspath.clone(),
                executable: new_base_props.contains_key("executable"),
            });
        }

        let checksum = new_pristine_sha1
            .clone()
            .or_else(|| baton.copyfrom_install.as_ref().map(|c| (c.pristine_md5.clone(), c.pristine_sha1.clone())));
        let new_base = BaseState {
            status: BaseStatus::Normal,
            kind: NodeKind::File,
            revision: self.target_revision_value(),
            repos_relpath: baton.new_repos_relpath.clone(),
            repos_root: self.repos_root.clone(),
            repos_uuid: String::new(),
            checksum,
            recorded_mtime_millis: 0,
            recorded_size: 0,
            depth: None,
            last_change: Some(LastChange {
                revision: baton.last_changed_rev.unwrap_or(self.target_revision_value()),
                date: baton.last_changed_date.unwrap_or_else(Utc::now),
                author: baton.last_changed_author.clone().unwrap_or_default(),
            }),
            properties: new_base_props.clone(),
            wire_cache_properties: new_wire_cache_props,
        };
        self.metadata.write_base(baton.local_path.as_repo_path(), new_base)?;

        if matches!(node.working.as_ref().map(|w| &w.schedule), Some(WorkingSchedule::Add)) && !baton.adding {
            // Local add raced with an incoming edit of the same path:
            // demote to a plain local edit (spec §4.2 close_file).
            self.metadata.write_working(baton.local_path.as_repo_path(), None)?;
        } else if !baton.adding {
            // unaffected
        }

        let mut actual = node.actual.clone();
        if matches!(plan.merge_outcome, Some(MergeOutcome::Conflict)) {
            actual.text_conflicted = true;
        } else if plan.install_pristine {
            actual.text_modified = false;
        }
        if actual.properties.as_ref() == Some(&new_base_props) {
            actual.properties = None;
        }
        self.metadata.write_actual(baton.local_path.as_repo_path(), actual)?;

        let prop_state = if regular_props.is_empty() {
            PropState::None
        } else if matches!(plan.merge_outcome, Some(MergeOutcome::Conflict)) {
            PropState::Conflicted
        } else {
            PropState::Changed
        };
        let action = if baton.add_existed {
            NotifyAction::Exists
        } else if baton.adding {
            NotifyAction::UpdateAdd
        } else {
            NotifyAction::UpdateUpdate
        };
        let parent_path = self.dir(baton.parent)?.local_path.clone();
        self.callbacks.notify(Notification {
            path: baton.local_path,
            action,
            kind: NodeKind::File,
            content_state: plan.content_state,
            prop_state,
            lock_state: if lock_removed { LockState::Unlocked } else { LockState::Unchanged },
            revision: Some(self.target_revision_value()),
            old_revision: None,
            mime_type: None,
        });

        self.finish_dir_bump(baton.bump, parent_path.as_repo_path())?;
        Ok(())
    }

    // ---- close_edit --------------------------------------------------

    #[instrument(skip(self))]
    pub fn close_edit(&mut self) -> Result<(), EditorError> {
        self.check_cancel()?;
        if let Some(root) = self.root_handle.take() {
            if self.dirs[root.0].is_some() {
                self.close_directory(root)?;
            }
        }
        if !self.root_opened {
            debug!("close_edit with no open_root; marking the anchor complete");
            self.mark_anchor_complete()?;
        }
        if self.root_opened && !self.target_deleted && !self.target_touched {
            self.synthesize_missing_target_deletion()?;
        }
        self.close_edit_complete = true;
        Ok(())
    }

    /// Spec §4.2 `close_edit`: "If the root was never opened, mark the
    /// anchor complete." Repairs a leftover `incomplete` BASE status on the
    /// anchor (from a prior interrupted session whose `open_root` never got
    /// a matching `close_directory` before this fully empty session ran)
    /// back to `normal`, rather than merely logging that nothing happened.
    fn mark_anchor_complete(&mut self) -> Result<(), EditorError> {
        let root = RepoPath::from_internal_string("").unwrap();
        let node = self.metadata.read_node(root)?;
        if let Some(base) = node.base {
            if base.status == BaseStatus::Incomplete {
                let mut completed = base;
                completed.status = BaseStatus::Normal;
                self.metadata.write_base(root, completed)?;
            }
        }
        Ok(())
    }

    /// Spec §4.2 `close_edit`: "if the target went missing (directory
    /// deleted in repo but the edit never mentioned it), synthesize a
    /// `do_entry_deletion` for it." No editor op ever named the target
    /// directly (`target_touched` stayed false), so the driver removes it
    /// itself exactly as `delete_entry` would have.
    fn synthesize_missing_target_deletion(&mut self) -> Result<(), EditorError> {
        let Some(target_name) = self.target_basename.clone() else {
            return Ok(());
        };
        let local_path = RepoPathBuf::from_internal_string(target_name);
        let node = self.metadata.read_node(local_path.as_repo_path())?;
        let Some(base) = node.base else {
            return Ok(());
        };
        if base.status == BaseStatus::NotPresent {
            return Ok(());
        }
        let kind = base.kind;
        debug!(path = %local_path.as_internal_str(), "target missing from incoming stream; synthesizing its deletion");

        let abspath = local_path.to_fs_path(&self.anchor_abspath).map_err(ObstructedUpdateError::from)?;
        if abspath.is_dir() {
            fs::remove_dir_all(&abspath).context(&abspath)?;
        } else if abspath.exists() {
            fs::remove_file(&abspath).context(&abspath)?;
        }

        let placeholder = BaseState {
            status: BaseStatus::NotPresent,
            kind,
            revision: self.target_revision_value(),
            repos_relpath: local_path.clone(),
            repos_root: self.repos_root.clone(),
            repos_uuid: String::new(),
            checksum: None,
            recorded_mtime_millis: 0,
            recorded_size: 0,
            depth: None,
            last_change: None,
            properties: PropertyMap::new(),
            wire_cache_properties: PropertyMap::new(),
        };
        self.metadata.write_base(local_path.as_repo_path(), placeholder)?;
        self.metadata.write_working(local_path.as_repo_path(), None)?;
        self.target_deleted = true;

        self.callbacks.notify(Notification {
            path: local_path,
            action: NotifyAction::UpdateDelete,
            kind,
            content_state: ContentState::Unchanged,
            prop_state: PropState::None,
            lock_state: LockState::Unchanged,
            revision: Some(self.target_revision_value()),
            old_revision: None,
            mime_type: None,
        });
        Ok(())
    }

    /// One directory's share of the stale-child sweep (SPEC_FULL.md:186
    /// "remove missing directory entries with a notification"), run from
    /// [`finish_dir_bump`](Self::finish_dir_bump) the moment that directory's
    /// bump-tracker ref count reaches zero — not as a single global walk.
    /// Removes not-present entries, stale-revision absent entries, and
    /// entries with no on-disk counterpart and no pending local edit,
    /// exempting anything under skipped-trees (spec §4.1 I2/I4, §8 P4).
    /// Only `dir`'s immediate children are swept here; each child directory
    /// already swept its own children at its own completion.
    fn sweep_stale_entries(&mut self, dir: &RepoPath) -> Result<(), EditorError> {
        if self.is_in_skipped_tree(dir) {
            return Ok(());
        }
        let children = self.metadata.children(dir)?;
        for child in children {
            if self.is_in_skipped_tree(child.as_repo_path()) {
                continue;
            }
            let node = self.metadata.read_node(child.as_repo_path())?;
            let Some(base) = &node.base else { continue };
            let abspath = child.as_repo_path().to_fs_path(&self.anchor_abspath).map_err(ObstructedUpdateError::from)?;
            let missing_on_disk = self.on_disk_kind(&abspath).is_none() && node.working.is_none();
            let stale = base.status == BaseStatus::NotPresent
                || (base.status == BaseStatus::Absent && base.revision != self.target_revision_value())
                || missing_on_disk;
            if stale {
                let kind = base.kind;
                self.metadata.remove_node(child.as_repo_path())?;
                self.callbacks.notify(Notification {
                    path: child,
                    action: NotifyAction::UpdateDelete,
                    kind,
                    content_state: ContentState::Unchanged,
                    prop_state: PropState::None,
                    lock_state: LockState::Unchanged,
                    revision: Some(self.target_revision_value()),
                    old_revision: None,
                    mime_type: None,
                });
            }
        }
        Ok(())
    }
}

fn child_depth(parent_depth: Depth, is_target: bool) -> Depth {
    if is_target {
        parent_depth.normalized()
    } else {
        match parent_depth {
            Depth::Immediates => Depth::Empty,
            other => other.normalized(),
        }
    }
}

fn to_notify_depth(depth: Depth) -> crate::notify::Depth {
    match depth {
        Depth::Empty => crate::notify::Depth::Empty,
        Depth::Files => crate::notify::Depth::Files,
        Depth::Immediates => crate::notify::Depth::Immediates,
        Depth::Infinity | Depth::Unknown => crate::notify::Depth::Infinity,
    }
}

fn node_kind_hint(on_disk: Option<NodeKind>) -> Option<NodeKind> {
    on_disk
}

fn node_kind_for_delete(hint: &Option<NodeKind>) -> NodeKind {
    hint.unwrap_or(NodeKind::File)
}

fn read_all(mut r: impl io::Read) -> Result<Vec<u8>, EditorError> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf).map_err(|source| EditorError::Io(PathError { path: PathBuf::new(), source }))?;
    Ok(buf)
}

/// Placeholder used only when a close_file install is planned with no new
/// pristine and no copyfrom source, which `plan_install` never actually
/// returns in practice; kept as an explicit panic-free fallback rather than
/// an `unwrap` on a `None` that the planner's own invariants rule out.
fn new_base_props_checksum_placeholder() -> Sha1Checksum {
    Sha1Checksum::from_bytes(&[0u8; 20])
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::metadata::InMemoryMetadataStore;

    #[derive(Default)]
    struct RecordingCallbacks {
        notifications: Rc<RefCell<Vec<Notification>>>,
    }

    impl EditCallbacks for RecordingCallbacks {
        fn check_cancelled(&mut self) -> Result<(), Cancelled> {
            Ok(())
        }

        fn notify(&mut self, notification: Notification) {
            self.notifications.borrow_mut().push(notification);
        }

        fn resolve_conflict(&mut self, description: crate::notify::ConflictDescription) -> crate::notify::ConflictResolution {
            crate::notify::ConflictResolution { choice: ConflictChoice::Postpone, merged_file_path: description.merged_file_path }
        }

        fn fetch(&mut self, _repos_relpath: &RepoPathBuf, _revision: Revision, _sink: &mut dyn io::Write) -> io::Result<PropertyMap> {
            Ok(PropertyMap::new())
        }

        fn externals_changed(&mut self, _dir_abspath: &Path, _old_value: Option<&[u8]>, _new_value: Option<&[u8]>, _depth: crate::notify::Depth) {}
    }

    fn new_session(
        metadata: &mut dyn MetadataStore,
        pristine: PristineStore,
        anchor: &Path,
    ) -> EditSession<'_, RecordingCallbacks> {
        EditSession::new(EditSessionArgs {
            anchor_abspath: anchor.to_path_buf(),
            anchor_repos_relpath: RepoPathBuf::root(),
            target_basename: None,
            switch: None,
            depth: Depth::Infinity,
            sticky_depth: false,
            settings: EditorSettings::default(),
            repos_root: "R".to_string(),
            repos_uuid: "uuid".to_string(),
            metadata,
            pristine,
            callbacks: RecordingCallbacks::default(),
            pending_work: HashMap::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_clean_update_of_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let wc = dir.path().join("wc");
        fs::create_dir_all(&wc).unwrap();
        let pristine = PristineStore::init(&dir.path().join("pristine")).unwrap();

        let old_md5 = crate::checksum::md5_of(b"old text");
        let (h, _m, old_sha1) = pristine.write_from_reader(&b"old text"[..]).unwrap();
        pristine.install(h, &old_sha1).unwrap();

        let mut metadata = InMemoryMetadataStore::new();
        metadata.seed_base(
            RepoPath::from_internal_string("a").unwrap(),
            BaseState {
                status: BaseStatus::Normal,
                kind: NodeKind::File,
                revision: 2,
                repos_relpath: RepoPathBuf::from_internal_string("a"),
                repos_root: "R".to_string(),
                repos_uuid: "uuid".to_string(),
                checksum: Some((old_md5.clone(), old_sha1.clone())),
                recorded_mtime_millis: 0,
                recorded_size: 8,
                depth: None,
                last_change: None,
                properties: PropertyMap::new(),
                wire_cache_properties: PropertyMap::new(),
            },
        );
        fs::write(wc.join("a"), b"old text").unwrap();

        let mut session = new_session(&mut metadata, pristine.clone(), &wc);
        session.set_target_revision(3);
        let root = session.open_root(2).unwrap();
        let file = session.open_file("a", root, 2).unwrap();
        session.apply_textdelta(file, Some(old_md5)).unwrap();
        session.write_textdelta_window(file, b"new text").unwrap();
        session.close_textdelta(file).unwrap();
        let new_md5 = crate::checksum::md5_of(b"new text");
        session.close_file(file, Some(new_md5.clone())).unwrap();
        session.close_directory(root).unwrap();
        session.close_edit().unwrap();

        let node = metadata.read_node(RepoPath::from_internal_string("a").unwrap()).unwrap();
        assert_eq!(node.base.as_ref().unwrap().revision, 3);
        assert_eq!(node.base.as_ref().unwrap().checksum.as_ref().unwrap().0, new_md5);
        assert_eq!(fs::read(wc.join("a")).unwrap(), b"new text");
    }

    #[test]
    fn test_delete_vs_local_delete_raises_tree_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let wc = dir.path().join("wc");
        fs::create_dir_all(&wc).unwrap();
        let pristine = PristineStore::init(&dir.path().join("pristine")).unwrap();

        let mut metadata = InMemoryMetadataStore::new();
        metadata.seed_base(
            RepoPath::from_internal_string("c").unwrap(),
            BaseState {
                status: BaseStatus::Normal,
                kind: NodeKind::File,
                revision: 2,
                repos_relpath: RepoPathBuf::from_internal_string("c"),
                repos_root: "R".to_string(),
                repos_uuid: "uuid".to_string(),
                checksum: None,
                recorded_mtime_millis: 0,
                recorded_size: 0,
                depth: None,
                last_change: None,
                properties: PropertyMap::new(),
                wire_cache_properties: PropertyMap::new(),
            },
        );
        metadata.seed_working(
            RepoPath::from_internal_string("c").unwrap(),
            crate::metadata::WorkingState { schedule: WorkingSchedule::Delete },
        );

        let mut session = new_session(&mut metadata, pristine, &wc);
        session.set_target_revision(3);
        let root = session.open_root(2).unwrap();
        session.delete_entry("c", 3, root).unwrap();
        session.close_directory(root).unwrap();
        session.close_edit().unwrap();

        assert!(session.skipped_trees().contains(&RepoPathBuf::from_internal_string("c")));
    }

    #[test]
    fn test_add_directory_rejects_copyfrom() {
        let dir = tempfile::tempdir().unwrap();
        let wc = dir.path().join("wc");
        fs::create_dir_all(&wc).unwrap();
        let pristine = PristineStore::init(&dir.path().join("pristine")).unwrap();
        let mut metadata = InMemoryMetadataStore::new();
        let mut session = new_session(&mut metadata, pristine, &wc);
        session.set_target_revision(1);
        let root = session.open_root(0).unwrap();
        let err = session
            .add_directory("sub", root, Some((RepoPathBuf::from_internal_string("other"), 1)))
            .unwrap_err();
        assert!(matches!(err, EditorError::UnsupportedFeature(UnsupportedFeatureError::AddDirectoryWithCopyfrom { .. })));
    }

    #[test]
    fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let wc = dir.path().join("wc");
        fs::create_dir_all(&wc).unwrap();
        let pristine = PristineStore::init(&dir.path().join("pristine")).unwrap();
        let mut metadata = InMemoryMetadataStore::new();
        let mut session = new_session(&mut metadata, pristine, &wc);
        session.set_target_revision(1);
        let root = session.open_root(0).unwrap();
        let err = session.add_directory("../escape", root, None).unwrap_err();
        assert!(matches!(err, EditorError::ObstructedUpdate(_)));
    }

    #[test]
    fn test_switch_crossing_repository_roots_fails_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let wc = dir.path().join("wc");
        fs::create_dir_all(&wc).unwrap();
        let pristine = PristineStore::init(&dir.path().join("pristine")).unwrap();
        let mut metadata = InMemoryMetadataStore::new();
        let result = EditSession::new(EditSessionArgs {
            anchor_abspath: wc.clone(),
            anchor_repos_relpath: RepoPathBuf::root(),
            target_basename: None,
            switch: Some(SwitchRequest { repos_root: "R2".to_string(), new_repos_relpath: RepoPathBuf::root() }),
            depth: Depth::Infinity,
            sticky_depth: false,
            settings: EditorSettings::default(),
            repos_root: "R1".to_string(),
            repos_uuid: "uuid".to_string(),
            metadata: &mut metadata,
            pristine,
            callbacks: RecordingCallbacks::default(),
            pending_work: HashMap::new(),
        });
        assert!(matches!(result, Err(EditorError::InvalidSwitch { .. })));
    }

    #[test]
    fn test_add_new_file_installs_pristine_and_notifies_add() {
        let dir = tempfile::tempdir().unwrap();
        let wc = dir.path().join("wc");
        fs::create_dir_all(&wc).unwrap();
        let pristine = PristineStore::init(&dir.path().join("pristine")).unwrap();
        let mut metadata = InMemoryMetadataStore::new();
        let notifications = Rc::new(RefCell::new(Vec::new()));
        let callbacks = RecordingCallbacks { notifications: notifications.clone() };

        let mut session = EditSession::new(EditSessionArgs {
            anchor_abspath: wc.clone(),
            anchor_repos_relpath: RepoPathBuf::root(),
            target_basename: None,
            switch: None,
            depth: Depth::Infinity,
            sticky_depth: false,
            settings: EditorSettings::default(),
            repos_root: "R".to_string(),
            repos_uuid: "uuid".to_string(),
            metadata: &mut metadata,
            pristine,
            callbacks,
            pending_work: HashMap::new(),
        })
        .unwrap();
        session.set_target_revision(1);
        let root = session.open_root(0).unwrap();
        let file = session.add_file("new.txt", root, None).unwrap();
        session.apply_textdelta(file, None).unwrap();
        session.write_textdelta_window(file, b"hello").unwrap();
        session.close_textdelta(file).unwrap();
        session.close_file(file, None).unwrap();
        session.close_directory(root).unwrap();
        session.close_edit().unwrap();

        assert_eq!(fs::read(wc.join("new.txt")).unwrap(), b"hello");
        assert!(notifications.borrow().iter().any(|n| matches!(n.action, NotifyAction::UpdateAdd)));
    }
}
