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

//! The node-state classifier (spec §2 component 4, §4.1).
//!
//! A pure function from a node's existing derived state plus the incoming
//! editor action to one of four verdicts: proceed, skip (already conflicted
//! or obstructed), or raise a tree conflict. [`classify`] takes every input
//! it needs as plain values so it can be unit-tested without a metadata
//! store; [`deep_modification_check`] is the separate subtree walk the
//! driver runs first to compute the `all_edits_are_deletes` input for
//! directories (spec §4.1 "Deep modification check").

use crate::error::EditorError;
use crate::metadata::BaseStatus;
use crate::metadata::ConflictReason;
use crate::metadata::ConflictedNodeVersion;
use crate::metadata::DerivedStatus;
use crate::metadata::MetadataStore;
use crate::metadata::NodeKind;
use crate::metadata::Revision;
use crate::repo_path::RepoPath;
use crate::repo_path::RepoPathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingAction {
    Edit,
    Add,
    Delete,
    Replace,
}

impl From<IncomingAction> for crate::metadata::IncomingAction {
    fn from(value: IncomingAction) -> Self {
        match value {
            IncomingAction::Edit => Self::Edit,
            IncomingAction::Add => Self::Add,
            IncomingAction::Delete => Self::Delete,
            IncomingAction::Replace => Self::Replace,
        }
    }
}

/// Everything [`classify`] needs to decide one node, already resolved by the
/// caller (no I/O happens inside this function).
#[derive(Debug, Clone)]
pub struct ClassifierInput {
    pub status: DerivedStatus,
    /// `true` iff the node has a WORKING overlay (its BASE identity is
    /// shadowed by a scheduled local change).
    pub shadowed: bool,
    /// The node's BASE status, when a BASE row exists at all. Used to
    /// distinguish "added over nothing" from "added over a not-present
    /// placeholder", both of which take `reason=added` rather than
    /// `replaced` (spec §4.1).
    pub base_status: Option<BaseStatus>,
    /// Whether the node already carries a text, property, or tree conflict
    /// (spec output `SkipAlreadyConflicted`, I4).
    pub already_conflicted: bool,
    /// Whether this node sits beneath a directory flagged
    /// `in_deleted_and_tree_conflicted_subtree` (spec §4.2 `open_directory`):
    /// such descendants are marked deleted rather than reclassified.
    pub under_conflicted_ancestor: bool,
    pub text_modified: bool,
    pub prop_modified: bool,
    pub incoming_action: IncomingAction,
    pub incoming_kind: NodeKind,
    /// For a directory under a destructive action, whether every locally
    /// modified descendant is itself scheduled for deletion (spec §4.1
    /// "Deep modification check"). For a file, this is simply whether the
    /// file's own WORKING schedule is a delete.
    pub all_edits_are_deletes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierOutput {
    Proceed,
    SkipAlreadyConflicted,
    SkipObstructed,
    TreeConflict {
        reason: ConflictReason,
        source_left: Option<ConflictedNodeVersion>,
        source_right: ConflictedNodeVersion,
    },
    /// No new conflict is raised for this node because an enclosing
    /// directory already carries one; it is deleted rather than updated
    /// (spec §4.2 `open_directory`, `in_deleted_and_tree_conflicted_subtree`).
    DeleteWithinConflictedAncestor,
}

/// Identity of one side of a conflict-version pair, as known locally before
/// the incoming action is applied (spec §4.1 "Conflict-version records").
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub repos_root: String,
    pub repos_relpath: RepoPathBuf,
    pub base_revision: Revision,
    pub kind: NodeKind,
}

/// Identity the incoming editor operation describes (spec §4.1
/// "source-right").
#[derive(Debug, Clone)]
pub struct IncomingIdentity {
    pub repos_root: String,
    pub repos_relpath: RepoPathBuf,
    pub target_revision: Revision,
    pub kind: NodeKind,
}

fn source_right(
    incoming: &IncomingIdentity,
    local: Option<&LocalIdentity>,
    action: IncomingAction,
) -> ConflictedNodeVersion {
    // "when the incoming operation is a delete, the right-side kind is
    // taken from the left side" (spec §4.1).
    let kind = if action == IncomingAction::Delete {
        local.map(|l| l.kind).unwrap_or(incoming.kind)
    } else {
        incoming.kind
    };
    ConflictedNodeVersion {
        repos_root: incoming.repos_root.clone(),
        repos_relpath: incoming.repos_relpath.clone(),
        revision: incoming.target_revision,
        kind,
    }
}

fn source_left(local: Option<&LocalIdentity>) -> Option<ConflictedNodeVersion> {
    local.map(|l| ConflictedNodeVersion {
        repos_root: l.repos_root.clone(),
        repos_relpath: l.repos_relpath.clone(),
        revision: l.base_revision,
        kind: l.kind,
    })
}

/// Classifies one node against one incoming editor action. Returns a
/// [`crate::error::MalformedStreamError`]-carrying error when the editor
/// stream itself is inconsistent (e.g. a non-add action targeting a node
/// whose only local identity is a scheduled add).
pub fn classify(
    input: &ClassifierInput,
    path: &RepoPath,
    local: Option<&LocalIdentity>,
    incoming: &IncomingIdentity,
) -> Result<ClassifierOutput, EditorError> {
    if input.already_conflicted {
        return Ok(ClassifierOutput::SkipAlreadyConflicted);
    }
    if input.under_conflicted_ancestor {
        return Ok(ClassifierOutput::DeleteWithinConflictedAncestor);
    }

    use DerivedStatus as S;
    match input.status {
        S::Added | S::Copied | S::MovedHere | S::ObstructedAdd => {
            if input.incoming_action != IncomingAction::Add {
                return Err(EditorError::MalformedStream(
                    crate::error::MalformedStreamError::UnmatchedClose {
                        op: "add",
                        path: path.to_owned(),
                    },
                ));
            }
            if input.status == S::ObstructedAdd {
                return Ok(ClassifierOutput::TreeConflict {
                    reason: ConflictReason::Obstructed,
                    source_left: source_left(local),
                    source_right: source_right(incoming, local, input.incoming_action),
                });
            }
            let over_nothing = !input.shadowed || matches!(input.base_status, Some(BaseStatus::NotPresent));
            let reason = if over_nothing { ConflictReason::Added } else { ConflictReason::Replaced };
            Ok(ClassifierOutput::TreeConflict {
                reason,
                source_left: if matches!(reason, ConflictReason::Added) { None } else { source_left(local) },
                source_right: source_right(incoming, local, input.incoming_action),
            })
        }
        S::Deleted | S::BaseDeleted | S::ObstructedDelete => {
            let reason = if input.status == S::ObstructedDelete {
                ConflictReason::Obstructed
            } else {
                ConflictReason::Deleted
            };
            Ok(ClassifierOutput::TreeConflict {
                reason,
                source_left: source_left(local),
                source_right: source_right(incoming, local, input.incoming_action),
            })
        }
        S::Normal | S::Incomplete | S::Obstructed => {
            match input.incoming_action {
                IncomingAction::Edit => Ok(ClassifierOutput::Proceed),
                IncomingAction::Delete | IncomingAction::Replace => {
                    if !input.text_modified && !input.prop_modified {
                        return Ok(ClassifierOutput::Proceed);
                    }
                    let reason = if input.all_edits_are_deletes {
                        ConflictReason::Deleted
                    } else {
                        ConflictReason::Edited
                    };
                    Ok(ClassifierOutput::TreeConflict {
                        reason,
                        source_left: source_left(local),
                        source_right: source_right(incoming, local, input.incoming_action),
                    })
                }
                IncomingAction::Add => {
                    if input.status == S::Obstructed {
                        Ok(ClassifierOutput::SkipObstructed)
                    } else {
                        Err(EditorError::MalformedStream(
                            crate::error::MalformedStreamError::UnmatchedClose {
                                op: "add",
                                path: path.to_owned(),
                            },
                        ))
                    }
                }
            }
        }
        S::Absent | S::Excluded | S::NotPresent => Ok(ClassifierOutput::Proceed),
    }
}

/// Walks a directory's subtree to determine whether every locally modified
/// descendant is itself scheduled for deletion (spec §4.1 "Deep modification
/// check"). Respects cancellation between entries (spec §5).
pub fn deep_modification_check(
    store: &dyn MetadataStore,
    dir: &RepoPath,
    should_cancel: &mut dyn FnMut() -> bool,
) -> Result<bool, EditorError> {
    let mut all_deletes = true;
    let mut stack = vec![dir.to_owned()];
    while let Some(current) = stack.pop() {
        if should_cancel() {
            return Err(EditorError::Cancelled);
        }
        for child in store.children(current.as_repo_path())? {
            let node = store.read_node(child.as_repo_path())?;
            let is_scheduled_delete = matches!(
                node.working.as_ref().map(|w| &w.schedule),
                Some(crate::metadata::WorkingSchedule::Delete)
                    | Some(crate::metadata::WorkingSchedule::BaseDeleted)
            );
            let modified = node.actual.text_modified
                || node.actual.text_conflicted
                || node.actual.prop_conflicted
                || node.actual.properties.is_some()
                || node.working.is_some();
            if modified && !is_scheduled_delete {
                all_deletes = false;
            }
            let is_dir = node
                .base
                .as_ref()
                .map(|b| b.kind == NodeKind::Dir)
                .unwrap_or(false);
            if is_dir {
                stack.push(child);
            }
        }
    }
    Ok(all_deletes)
}
