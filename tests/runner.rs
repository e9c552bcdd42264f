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

//! End-to-end scenarios from SPEC_FULL.md §8, driven through `testutils`'s
//! `TestWorkingCopy` exactly the way a real caller drives a checkout or
//! switch: open the root, walk the tree, close the edit.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::rc::Rc;

use assert_matches::assert_matches;
use testutils::path;
use testutils::repo_path;
use testutils::RecordingCallbacks;
use wc_update_engine::checksum::md5_of;
use wc_update_engine::driver::EditSession;
use wc_update_engine::driver::EditSessionArgs;
use wc_update_engine::error::EditorError;
use wc_update_engine::error::ObstructedUpdateError;
use wc_update_engine::metadata::ConflictReason;
use wc_update_engine::metadata::Depth;
use wc_update_engine::metadata::MetadataStore;
use wc_update_engine::metadata::PropertyMap;
use wc_update_engine::metadata::Revision;
use wc_update_engine::notify::Cancelled;
use wc_update_engine::notify::ConflictChoice;
use wc_update_engine::notify::ConflictDescription;
use wc_update_engine::notify::ConflictResolution;
use wc_update_engine::notify::Depth as NotifyDepth;
use wc_update_engine::notify::EditCallbacks;
use wc_update_engine::notify::Notification;
use wc_update_engine::notify::NotifyAction;
use wc_update_engine::repo_path::RepoPathBuf;
use wc_update_engine::settings::EditorSettings;

// Scenario 1: clean update of one file with no local modifications.
#[test]
fn clean_update_of_unmodified_file_rewrites_base_and_working_text() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_file("a.txt", 2, b"hello");

    let (mut session, notifications) = wc.update_session(Depth::Infinity);
    session.set_target_revision(3);
    let root = session.open_root(2).unwrap();
    let file = session.open_file("a.txt", root, 2).unwrap();
    session.apply_textdelta(file, Some(md5_of(b"hello"))).unwrap();
    session.write_textdelta_window(file, b"hello, world").unwrap();
    session.close_textdelta(file).unwrap();
    session.close_file(file, Some(md5_of(b"hello, world"))).unwrap();
    session.close_directory(root).unwrap();
    session.close_edit().unwrap();

    assert_eq!(wc.read_working_file("a.txt"), b"hello, world");
    let node = wc.metadata.read_node(repo_path("a.txt")).unwrap();
    assert_eq!(node.base.unwrap().revision, 3);
    assert!(notifications.borrow().iter().any(|n| n.path == path("a.txt") && n.action == NotifyAction::UpdateUpdate));
}

// Scenario: update of a file locally modified but not conflicting merges
// the server's delta with the local edit via merge_file's three-way plan.
#[test]
fn update_of_locally_modified_file_merges_instead_of_overwriting() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_file("a.txt", 2, b"line one\nline two\nline three\n");
    std::fs::write(wc.wc_path.join("a.txt"), b"line one\nline two EDITED\nline three\n").unwrap();

    let (mut session, _) = wc.update_session(Depth::Infinity);
    session.set_target_revision(3);
    let root = session.open_root(2).unwrap();
    let file = session.open_file("a.txt", root, 2).unwrap();
    session.apply_textdelta(file, Some(md5_of(b"line one\nline two\nline three\n"))).unwrap();
    let new_base = b"line one UPDATED\nline two\nline three\n";
    session.write_textdelta_window(file, new_base).unwrap();
    session.close_textdelta(file).unwrap();
    session.close_file(file, Some(md5_of(new_base))).unwrap();
    session.close_directory(root).unwrap();
    session.close_edit().unwrap();

    let merged = wc.read_working_file("a.txt");
    let merged = String::from_utf8(merged).unwrap();
    assert!(merged.contains("line one UPDATED"));
    assert!(merged.contains("line two EDITED"));
}

// Scenario: the server deletes a node the working copy has locally deleted.
// Per §4.2 "delete vs local delete", this is reported as a tree conflict
// rather than applied silently, and the subtree is skipped.
#[test]
fn delete_racing_a_local_delete_raises_a_tree_conflict() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_file("gone.txt", 2, b"bye");
    wc.metadata.write_working(repo_path("gone.txt"), Some(wc_update_engine::metadata::WorkingState {
        schedule: wc_update_engine::metadata::WorkingSchedule::Delete,
    })).unwrap();

    let (mut session, notifications) = wc.update_session(Depth::Infinity);
    session.set_target_revision(3);
    let root = session.open_root(2).unwrap();
    session.delete_entry("gone.txt", 3, root).unwrap();
    session.close_directory(root).unwrap();
    session.close_edit().unwrap();

    assert!(session.skipped_trees().contains(&path("gone.txt")));
    assert!(notifications.borrow().iter().any(|n| n.path == path("gone.txt") && n.action == NotifyAction::TreeConflict));
    let node = wc.metadata.read_node(repo_path("gone.txt")).unwrap();
    let conflict = node.actual.tree_conflict.expect("tree conflict recorded");
    assert_eq!(conflict.reason, ConflictReason::Deleted);
}

// Scenario: a switch whose incoming repository root differs from the
// session's own is rejected at construction (spec §4.5, §7 InvalidSwitch),
// before a single editor operation is driven.
#[test]
fn switch_crossing_repository_roots_fails_before_any_editor_call() {
    let mut wc = testutils::TestWorkingCopy::new();
    let notifications = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let outcome = wc_update_engine::driver::EditSession::new(wc_update_engine::driver::EditSessionArgs {
        anchor_abspath: wc.wc_path.clone(),
        anchor_repos_relpath: wc_update_engine::repo_path::RepoPathBuf::root(),
        target_basename: None,
        switch: Some(wc_update_engine::driver::SwitchRequest {
            repos_root: "file:///some/other/repo".to_string(),
            new_repos_relpath: path("trunk"),
        }),
        depth: Depth::Infinity,
        sticky_depth: false,
        settings: wc_update_engine::settings::EditorSettings::default(),
        repos_root: wc.repos_root.clone(),
        repos_uuid: wc.repos_uuid.clone(),
        metadata: &mut wc.metadata,
        pristine: wc.pristine.clone(),
        callbacks: testutils::RecordingCallbacks::new(notifications),
        pending_work: std::collections::HashMap::new(),
    });
    assert_matches!(outcome, Err(EditorError::InvalidSwitch { .. }));
}

// Scenario: adding a new file installs its pristine copy and the working
// text, and emits exactly one `update_add` notification.
#[test]
fn add_new_file_installs_pristine_and_notifies_add() {
    let mut wc = testutils::TestWorkingCopy::new();
    let (mut session, notifications) = wc.update_session(Depth::Infinity);
    session.set_target_revision(1);
    let root = session.open_root(0).unwrap();
    let file = session.add_file("new.txt", root, None).unwrap();
    session.apply_textdelta(file, None).unwrap();
    session.write_textdelta_window(file, b"brand new").unwrap();
    session.close_textdelta(file).unwrap();
    session.close_file(file, Some(md5_of(b"brand new"))).unwrap();
    session.close_directory(root).unwrap();
    session.close_edit().unwrap();

    assert_eq!(wc.read_working_file("new.txt"), b"brand new");
    let notes = notifications.borrow();
    assert_eq!(notes.iter().filter(|n| n.path == path("new.txt")).count(), 1);
    assert_eq!(notes.iter().find(|n| n.path == path("new.txt")).unwrap().action, NotifyAction::UpdateAdd);
}

// Boundary B3: `apply_textdelta` rejects a mismatched expected source MD5
// before any delta window is processed, and leaves BASE untouched.
#[test]
fn apply_textdelta_with_wrong_expected_source_md5_fails_before_any_window() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_file("a.txt", 2, b"hello");

    let (mut session, _) = wc.update_session(Depth::Infinity);
    session.set_target_revision(3);
    let root = session.open_root(2).unwrap();
    let file = session.open_file("a.txt", root, 2).unwrap();
    let err = session.apply_textdelta(file, Some(md5_of(b"not hello"))).unwrap_err();
    assert_matches!(err, EditorError::CorruptTextBase(wc_update_engine::error::CorruptTextBaseError::SourceMismatch { .. }));

    // BASE is untouched; the working file on disk is untouched too.
    let node = wc.metadata.read_node(repo_path("a.txt")).unwrap();
    assert_eq!(node.base.unwrap().revision, 2);
    assert_eq!(wc.read_working_file("a.txt"), b"hello");
}

// Round-trip R1: an empty edit (open_root; close_edit) whose target
// revision equals the working copy's current BASE revision changes neither
// metadata nor the filesystem.
#[test]
fn empty_edit_at_current_revision_is_a_no_op() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_file("a.txt", 2, b"hello");

    let (mut session, _) = wc.update_session(Depth::Infinity);
    session.set_target_revision(2);
    let root = session.open_root(2).unwrap();
    session.close_directory(root).unwrap();
    session.close_edit().unwrap();

    let node = wc.metadata.read_node(repo_path("a.txt")).unwrap();
    assert_eq!(node.base.unwrap().revision, 2);
    assert_eq!(wc.read_working_file("a.txt"), b"hello");
}

// Round-trip R2: applying an update to revision 3, then applying a second
// update session that goes from (the now-current) revision 3 to 3 again,
// is equivalent to applying the first update once.
#[test]
fn applying_the_same_update_twice_converges_to_the_same_state() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_file("a.txt", 2, b"hello");

    {
        let (mut session, _) = wc.update_session(Depth::Infinity);
        session.set_target_revision(3);
        let root = session.open_root(2).unwrap();
        let file = session.open_file("a.txt", root, 2).unwrap();
        session.apply_textdelta(file, Some(md5_of(b"hello"))).unwrap();
        session.write_textdelta_window(file, b"hello, world").unwrap();
        session.close_textdelta(file).unwrap();
        session.close_file(file, Some(md5_of(b"hello, world"))).unwrap();
        session.close_directory(root).unwrap();
        session.close_edit().unwrap();
    }

    // Re-running the update to the same target revision, now that BASE
    // already reflects it, is a no-op identical to the first run's result.
    {
        let (mut session, _) = wc.update_session(Depth::Infinity);
        session.set_target_revision(3);
        let root = session.open_root(3).unwrap();
        session.close_directory(root).unwrap();
        session.close_edit().unwrap();
    }

    let node = wc.metadata.read_node(repo_path("a.txt")).unwrap();
    assert_eq!(node.base.unwrap().revision, 3);
    assert_eq!(wc.read_working_file("a.txt"), b"hello, world");
}

// Scenario: `add_directory` is never driven with a `copyfrom` pair (spec
// §4.2's resolution table has no add-with-history row for directories);
// the editor rejects it as unsupported rather than silently ignoring it.
#[test]
fn add_directory_with_copyfrom_is_rejected_as_unsupported() {
    let mut wc = testutils::TestWorkingCopy::new();
    let (mut session, _) = wc.update_session(Depth::Infinity);
    session.set_target_revision(1);
    let root = session.open_root(0).unwrap();
    let err = session.add_directory("sub", root, Some((path("other"), 1))).unwrap_err();
    assert_matches!(err, EditorError::UnsupportedFeature(_));
}

// Scenario: an incoming add is obstructed by an unversioned file of the
// wrong kind on disk; default settings reject rather than silently replace.
#[test]
fn add_obstructed_by_unversioned_node_of_wrong_kind_fails() {
    let mut wc = testutils::TestWorkingCopy::new();
    std::fs::write(wc.wc_path.join("obstacle"), b"unversioned").unwrap();

    let (mut session, _) = wc.update_session(Depth::Infinity);
    session.set_target_revision(1);
    let root = session.open_root(0).unwrap();
    let err = session.add_directory("obstacle", root, None).unwrap_err();
    assert_matches!(err, EditorError::ObstructedUpdate(ObstructedUpdateError::UnversionedObstruction { .. }));
}

// Scenario: a wire path containing a `..` segment is rejected before it
// ever reaches the filesystem (spec §6 "resolve_wire_path").
#[test]
fn wire_path_escaping_the_anchor_is_rejected() {
    let mut wc = testutils::TestWorkingCopy::new();
    let (mut session, _) = wc.update_session(Depth::Infinity);
    session.set_target_revision(1);
    let root = session.open_root(0).unwrap();
    let err = session.add_directory("../escape", root, None).unwrap_err();
    assert_matches!(err, EditorError::ObstructedUpdate(_));
}

// Boundary: a shallow (depth=empty) update does not descend into a
// directory's children at all; the edit still closes cleanly.
#[test]
fn empty_depth_update_does_not_descend_into_children() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_dir("d", 2);
    wc.seed_file("d/child.txt", 2, b"seed");

    let (mut session, _) = wc.update_session(Depth::Empty);
    session.set_target_revision(3);
    let root = session.open_root(2).unwrap();
    session.close_directory(root).unwrap();
    session.close_edit().unwrap();

    assert_eq!(wc.read_working_file("d/child.txt"), b"seed");
}

// Scenario 5: add-with-history whose copyfrom source is a file already
// present in this same working copy. The locate step must find it and
// install from it directly, so the session's fetch callback is never
// invoked (spec §4.3 "Locate step").
#[test]
fn add_with_history_from_a_local_source_skips_the_fetch_callback() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_file("x/e", 2, b"copied content");

    let notifications = Rc::new(RefCell::new(Vec::new()));
    let callbacks = RecordingCallbacks::new(notifications.clone());
    let fetch_calls = callbacks.fetch_calls.clone();
    let mut session = EditSession::new(EditSessionArgs {
        anchor_abspath: wc.wc_path.clone(),
        anchor_repos_relpath: RepoPathBuf::root(),
        target_basename: None,
        switch: None,
        depth: Depth::Infinity,
        sticky_depth: false,
        settings: EditorSettings::default(),
        repos_root: wc.repos_root.clone(),
        repos_uuid: wc.repos_uuid.clone(),
        metadata: &mut wc.metadata,
        pristine: wc.pristine.clone(),
        callbacks,
        pending_work: HashMap::new(),
    })
    .unwrap();
    session.set_target_revision(3);
    let root = session.open_root(0).unwrap();
    let file = session.add_file("d", root, Some((path("x/e"), 2))).unwrap();
    session.close_file(file, None).unwrap();
    session.close_directory(root).unwrap();
    session.close_edit().unwrap();

    assert!(fetch_calls.borrow().is_empty(), "copyfrom source was local; fetch must not run");
    assert_eq!(wc.read_working_file("d"), b"copied content");
    let node = wc.metadata.read_node(repo_path("d")).unwrap();
    assert_eq!(node.base.unwrap().revision, 3);
    assert!(notifications.borrow().iter().any(|n| n.path == path("d") && n.action == NotifyAction::UpdateAdd));
}

/// Callbacks identical to [`RecordingCallbacks`] except `check_cancelled`
/// consults a shared flag, so a test can simulate cancellation arriving
/// mid-`close_directory` (inside the work-queue's own cancellation probe)
/// without predicting how many other call sites check for cancellation
/// first (spec §8 scenario 6).
struct CancelOnDemandCallbacks {
    notifications: Rc<RefCell<Vec<Notification>>>,
    cancel_now: Rc<Cell<bool>>,
}

impl EditCallbacks for CancelOnDemandCallbacks {
    fn check_cancelled(&mut self) -> Result<(), Cancelled> {
        if self.cancel_now.get() { Err(Cancelled) } else { Ok(()) }
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.borrow_mut().push(notification);
    }

    fn resolve_conflict(&mut self, description: ConflictDescription) -> ConflictResolution {
        ConflictResolution { choice: ConflictChoice::Postpone, merged_file_path: description.merged_file_path }
    }

    fn fetch(&mut self, _repos_relpath: &RepoPathBuf, _revision: Revision, _sink: &mut dyn io::Write) -> io::Result<PropertyMap> {
        Ok(PropertyMap::new())
    }

    fn externals_changed(&mut self, _dir_abspath: &Path, _old_value: Option<&[u8]>, _new_value: Option<&[u8]>, _depth: NotifyDepth) {}
}

// Scenario 6: an edit is cancelled between `close_file` and
// `close_directory` on the same directory. The parent directory's deferred
// file-install work item survives in the returned pending-work map; handing
// that map to a fresh session on the same working copy resumes and
// completes the install, reaching the same state a single uninterrupted
// run would have.
#[test]
fn interrupted_update_resumes_pending_work_on_a_fresh_session() {
    let mut wc = testutils::TestWorkingCopy::new();
    wc.seed_dir("sub", 2);
    wc.seed_file("sub/f", 2, b"hello");

    let cancel_now = Rc::new(Cell::new(false));
    let notifications = Rc::new(RefCell::new(Vec::new()));
    let callbacks = CancelOnDemandCallbacks { notifications: notifications.clone(), cancel_now: cancel_now.clone() };
    let mut session = EditSession::new(EditSessionArgs {
        anchor_abspath: wc.wc_path.clone(),
        anchor_repos_relpath: RepoPathBuf::root(),
        target_basename: None,
        switch: None,
        depth: Depth::Infinity,
        sticky_depth: false,
        settings: EditorSettings::default(),
        repos_root: wc.repos_root.clone(),
        repos_uuid: wc.repos_uuid.clone(),
        metadata: &mut wc.metadata,
        pristine: wc.pristine.clone(),
        callbacks,
        pending_work: HashMap::new(),
    })
    .unwrap();
    session.set_target_revision(3);
    let root = session.open_root(2).unwrap();
    let sub = session.open_directory("sub", root, 2).unwrap();
    let file = session.open_file("sub/f", sub, 2).unwrap();
    session.apply_textdelta(file, Some(md5_of(b"hello"))).unwrap();
    session.write_textdelta_window(file, b"hello, world").unwrap();
    session.close_textdelta(file).unwrap();
    session.close_file(file, Some(md5_of(b"hello, world"))).unwrap();

    // Cancellation arrives once "sub/f"'s install item is queued but before
    // "sub" itself closes; its work queue (the file install) is preserved.
    cancel_now.set(true);
    let err = session.close_directory(sub).unwrap_err();
    assert_matches!(err, EditorError::Cancelled);

    let pending_work = session.into_pending_work();
    assert!(
        pending_work.get(&path("sub")).is_some_and(|q| !q.is_empty()),
        "the interrupted directory's work queue must survive for resume"
    );

    // A fresh session over the same metadata/pristine stores, seeded with
    // the prior session's leftover work, picks the pending item back up.
    let cancel_now2 = Rc::new(Cell::new(false));
    let notifications2 = Rc::new(RefCell::new(Vec::new()));
    let callbacks2 = CancelOnDemandCallbacks { notifications: notifications2, cancel_now: cancel_now2 };
    let mut resumed = EditSession::new(EditSessionArgs {
        anchor_abspath: wc.wc_path.clone(),
        anchor_repos_relpath: RepoPathBuf::root(),
        target_basename: None,
        switch: None,
        depth: Depth::Infinity,
        sticky_depth: false,
        settings: EditorSettings::default(),
        repos_root: wc.repos_root.clone(),
        repos_uuid: wc.repos_uuid.clone(),
        metadata: &mut wc.metadata,
        pristine: wc.pristine.clone(),
        callbacks: callbacks2,
        pending_work,
    })
    .unwrap();
    resumed.set_target_revision(3);
    let root2 = resumed.open_root(2).unwrap();
    let sub2 = resumed.open_directory("sub", root2, 2).unwrap();
    resumed.close_directory(sub2).unwrap();
    resumed.close_directory(root2).unwrap();
    resumed.close_edit().unwrap();

    assert_eq!(wc.read_working_file("sub/f"), b"hello, world");
}
