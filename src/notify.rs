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

//! The callback set an edit session is driven with (spec §6 "Callbacks
//! consumed from the caller").
//!
//! The driver is generic over this trait rather than a concrete struct of
//! function pointers, the same shape the teacher corpus uses for its own
//! checkout/merge callback seams.

use std::io;
use std::path::Path;

use crate::merge_file::ContentState;
use crate::metadata::NodeKind;
use crate::metadata::PropertyMap;
use crate::metadata::Revision;
use crate::metadata::TreeConflict;
use crate::repo_path::RepoPathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    UpdateAdd,
    UpdateUpdate,
    UpdateDelete,
    UpdateAddDeleted,
    UpdateObstruction,
    Skip,
    TreeConflict,
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropState {
    Conflicted,
    Merged,
    Changed,
    Unchanged,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unchanged,
    Locked,
    Unlocked,
}

/// One notification event (spec §6 `notify`). Emitted exactly once per node
/// per edit (spec §7 "exactly one notification of kind `skip`/`tree_conflict`
/// ... or `update_*`/`exists`").
#[derive(Debug, Clone)]
pub struct Notification {
    pub path: RepoPathBuf,
    pub action: NotifyAction,
    pub kind: NodeKind,
    pub content_state: ContentState,
    pub prop_state: PropState,
    pub lock_state: LockState,
    pub revision: Option<Revision>,
    pub old_revision: Option<Revision>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    Postpone,
    UseMine,
    UseTheirs,
    UseMerged,
}

/// A conflict description passed to [`EditCallbacks::resolve_conflict`].
#[derive(Debug, Clone)]
pub struct ConflictDescription {
    pub path: RepoPathBuf,
    pub tree_conflict: Option<TreeConflict>,
    pub merged_file_path: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub choice: ConflictChoice,
    pub merged_file_path: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Empty,
    Files,
    Immediates,
    Infinity,
}

/// The capability set an edit session is driven with (spec §6). The driver
/// (`src/driver.rs`) holds a `&mut dyn EditCallbacks` for the session's
/// lifetime; none of these calls may themselves re-enter the editor
/// operations (spec §5: "callbacks into the driver do not suspend").
pub trait EditCallbacks {
    /// Returns `Err` to signal cancellation (spec §5, polled at the start of
    /// every editor callback and between work-queue items / delta windows).
    fn check_cancelled(&mut self) -> Result<(), Cancelled>;

    fn notify(&mut self, notification: Notification);

    fn resolve_conflict(&mut self, description: ConflictDescription) -> ConflictResolution;

    /// Streams pristine content for `(repos_relpath, revision)` into `sink`,
    /// returning the fetched base properties (spec §4.3 fetch branch).
    fn fetch(&mut self, repos_relpath: &RepoPathBuf, revision: Revision, sink: &mut dyn io::Write) -> io::Result<PropertyMap>;

    /// Invoked when the `svn:externals`-equivalent property changes on a
    /// directory (spec §4.2 `close_directory`).
    fn externals_changed(&mut self, dir_abspath: &Path, old_value: Option<&[u8]>, new_value: Option<&[u8]>, depth: Depth);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;
