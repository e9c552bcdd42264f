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

//! Scenario-building helpers for the editor core's integration tests
//! (SPEC_FULL.md §1.1 "Test tooling"): a disk-backed working copy paired
//! with the crate's in-memory [`wc_update_engine::metadata::MetadataStore`]
//! double and a real [`PristineStore`], plus a recording [`EditCallbacks`]
//! implementation, so the end-to-end scenarios of spec §8 can be expressed
//! as plain `tests/*.rs` integration tests instead of re-deriving this
//! scaffolding in every test module.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use tempfile::TempDir;
use wc_update_engine::checksum::Md5Checksum;
use wc_update_engine::checksum::Sha1Checksum;
use wc_update_engine::driver::EditSession;
use wc_update_engine::driver::EditSessionArgs;
use wc_update_engine::driver::SwitchRequest;
use wc_update_engine::metadata::BaseState;
use wc_update_engine::metadata::BaseStatus;
use wc_update_engine::metadata::Depth;
use wc_update_engine::metadata::InMemoryMetadataStore;
use wc_update_engine::metadata::NodeKind;
use wc_update_engine::metadata::PropertyMap;
use wc_update_engine::metadata::Revision;
use wc_update_engine::notify::Cancelled;
use wc_update_engine::notify::ConflictChoice;
use wc_update_engine::notify::ConflictDescription;
use wc_update_engine::notify::ConflictResolution;
use wc_update_engine::notify::Depth as NotifyDepth;
use wc_update_engine::notify::EditCallbacks;
use wc_update_engine::notify::Notification;
use wc_update_engine::pristine::PristineStore;
use wc_update_engine::repo_path::RepoPath;
use wc_update_engine::repo_path::RepoPathBuf;
use wc_update_engine::settings::EditorSettings;

/// Shorthand for building a [`RepoPathBuf`] from a test literal.
pub fn path(s: &str) -> RepoPathBuf {
    RepoPathBuf::from_internal_string(s)
}

pub fn repo_path(s: &str) -> &RepoPath {
    RepoPath::from_internal_string(s).expect("valid test path")
}

/// A disk-backed working copy plus its in-memory metadata store and a real
/// pristine store under the same temp directory, torn down together when
/// dropped (mirrors the teacher corpus's `TestWorkspace`/`TestRepo` pairing
/// of an on-disk tree with its backing store).
pub struct TestWorkingCopy {
    _root: TempDir,
    pub wc_path: PathBuf,
    pub metadata: InMemoryMetadataStore,
    pub pristine: PristineStore,
    pub repos_root: String,
    pub repos_uuid: String,
}

impl TestWorkingCopy {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let wc_path = root.path().join("wc");
        fs::create_dir_all(&wc_path).expect("create wc dir");
        let pristine = PristineStore::init(&root.path().join("pristine")).expect("init pristine");
        Self {
            _root: root,
            wc_path,
            metadata: InMemoryMetadataStore::new(),
            pristine,
            repos_root: "file:///repo".to_string(),
            repos_uuid: "11111111-1111-1111-1111-111111111111".to_string(),
        }
    }

    /// Seeds a versioned file at `relpath` with BASE content `contents` at
    /// `revision`, writing matching bytes to disk and installing the
    /// pristine so the working copy starts in a clean, up-to-date state.
    pub fn seed_file(&mut self, relpath: &str, revision: Revision, contents: &[u8]) -> (Md5Checksum, Sha1Checksum) {
        let (handle, md5, sha1) = self.pristine.write_from_reader(contents).expect("write pristine");
        self.pristine.install(handle, &sha1).expect("install pristine");
        let repo_path = path(relpath);
        self.metadata.seed_base(
            repo_path.as_repo_path(),
            BaseState {
                status: BaseStatus::Normal,
                kind: NodeKind::File,
                revision,
                repos_relpath: repo_path.clone(),
                repos_root: self.repos_root.clone(),
                repos_uuid: self.repos_uuid.clone(),
                checksum: Some((md5.clone(), sha1.clone())),
                recorded_mtime_millis: 0,
                recorded_size: contents.len() as u64,
                depth: None,
                last_change: None,
                properties: PropertyMap::new(),
                wire_cache_properties: PropertyMap::new(),
            },
        );
        if let Some(parent) = Path::new(relpath).parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(self.wc_path.join(parent)).expect("create parent dirs");
        }
        fs::write(self.wc_path.join(relpath), contents).expect("write working file");
        (md5, sha1)
    }

    /// Seeds a versioned directory's BASE row (without creating children).
    pub fn seed_dir(&mut self, relpath: &str, revision: Revision) {
        let repo_path = path(relpath);
        fs::create_dir_all(self.wc_path.join(relpath)).expect("create dir");
        self.metadata.seed_base(
            repo_path.as_repo_path(),
            BaseState {
                status: BaseStatus::Normal,
                kind: NodeKind::Dir,
                revision,
                repos_relpath: repo_path.clone(),
                repos_root: self.repos_root.clone(),
                repos_uuid: self.repos_uuid.clone(),
                checksum: None,
                recorded_mtime_millis: 0,
                recorded_size: 0,
                depth: Some(Depth::Infinity),
                last_change: None,
                properties: PropertyMap::new(),
                wire_cache_properties: PropertyMap::new(),
            },
        );
    }

    pub fn read_working_file(&self, relpath: &str) -> Vec<u8> {
        fs::read(self.wc_path.join(relpath)).unwrap_or_else(|e| panic!("read {relpath}: {e}"))
    }

    /// Opens an update session (no switch) rooted at this working copy,
    /// with default settings and a fresh [`RecordingCallbacks`].
    pub fn update_session(&mut self, depth: Depth) -> (EditSession<'_, RecordingCallbacks>, Rc<RefCell<Vec<Notification>>>) {
        self.session(depth, None, EditorSettings::default())
    }

    pub fn session(
        &mut self,
        depth: Depth,
        switch: Option<SwitchRequest>,
        settings: EditorSettings,
    ) -> (EditSession<'_, RecordingCallbacks>, Rc<RefCell<Vec<Notification>>>) {
        let notifications = Rc::new(RefCell::new(Vec::new()));
        let callbacks = RecordingCallbacks::new(notifications.clone());
        let session = EditSession::new(EditSessionArgs {
            anchor_abspath: self.wc_path.clone(),
            anchor_repos_relpath: RepoPathBuf::root(),
            target_basename: None,
            switch,
            depth,
            sticky_depth: false,
            settings,
            repos_root: self.repos_root.clone(),
            repos_uuid: self.repos_uuid.clone(),
            metadata: &mut self.metadata,
            pristine: self.pristine.clone(),
            callbacks,
            pending_work: HashMap::new(),
        })
        .expect("construct edit session");
        (session, notifications)
    }
}

impl Default for TestWorkingCopy {
    fn default() -> Self {
        Self::new()
    }
}

/// A callback implementation that records every [`Notification`] it
/// receives, never cancels, always postpones conflicts, and serves `fetch`
/// from a caller-supplied in-memory map keyed by `(repos_relpath, revision)`
/// (scenario 5's "no fetch callback invoked" assertion needs to observe
/// whether it was called at all, so tests typically leave this map empty
/// and assert `fetch_calls` stayed empty).
pub struct RecordingCallbacks {
    notifications: Rc<RefCell<Vec<Notification>>>,
    pub fetch_calls: Rc<RefCell<Vec<(RepoPathBuf, Revision)>>>,
    pub fetch_sources: HashMap<(RepoPathBuf, Revision), Vec<u8>>,
}

impl RecordingCallbacks {
    pub fn new(notifications: Rc<RefCell<Vec<Notification>>>) -> Self {
        Self {
            notifications,
            fetch_calls: Rc::new(RefCell::new(Vec::new())),
            fetch_sources: HashMap::new(),
        }
    }
}

impl EditCallbacks for RecordingCallbacks {
    fn check_cancelled(&mut self) -> Result<(), Cancelled> {
        Ok(())
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.borrow_mut().push(notification);
    }

    fn resolve_conflict(&mut self, description: ConflictDescription) -> ConflictResolution {
        ConflictResolution { choice: ConflictChoice::Postpone, merged_file_path: description.merged_file_path }
    }

    fn fetch(&mut self, repos_relpath: &RepoPathBuf, revision: Revision, sink: &mut dyn io::Write) -> io::Result<PropertyMap> {
        self.fetch_calls.borrow_mut().push((repos_relpath.clone(), revision));
        let bytes = self.fetch_sources.get(&(repos_relpath.clone(), revision)).cloned().unwrap_or_default();
        sink.write_all(&bytes)?;
        Ok(PropertyMap::new())
    }

    fn externals_changed(&mut self, _dir_abspath: &Path, _old_value: Option<&[u8]>, _new_value: Option<&[u8]>, _depth: NotifyDepth) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_file_round_trips_through_the_working_copy() {
        let mut wc = TestWorkingCopy::new();
        wc.seed_file("a", 2, b"hello");
        assert_eq!(wc.read_working_file("a"), b"hello");
    }
}
