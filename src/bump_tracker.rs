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

//! The directory-completion (bump) tracker (spec §2 component 5, §4.5).
//!
//! Every directory baton the edit driver hands out is matched by one
//! [`BumpTracker`] node: a reference count of the open children (plus one
//! for the directory's own still-open state), a pointer to the parent
//! node, and a `skipped` flag. The count is bumped on every child-baton
//! creation and dropped on every child close, whether or not the child was
//! itself skipped; reaching zero fires directory completion, which
//! propagates one bump-drop to the parent. The root directory's own
//! completion is the edit's last event (spec §4.5 I-completion,
//! §5 "closing the edit").

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use tracing::trace;

use crate::repo_path::RepoPathBuf;

/// What to do once a directory node's ref count reaches zero.
pub enum Completion {
    /// This was the root; the whole edit is done.
    EditComplete,
    /// A non-root directory completed; the caller should run the
    /// directory's deferred close-out (depth adjustment, stale-child sweep,
    /// work-queue drain) and then bump the parent.
    DirectoryReady(BumpHandle),
}

struct Node {
    parent: Option<BumpHandle>,
    path: RepoPathBuf,
    ref_count: u32,
    /// Set once this directory's `add_directory`/`open_directory` callback
    /// determined the whole subtree can be skipped (spec §4.1 "skipped
    /// trees"): children are still tracked for ref-counting purposes, but
    /// their close-out work is a no-op.
    skipped: bool,
}

/// A reference-counted handle to one directory's bump-tracker node. Cloning
/// is cheap (an `Rc` clone) and is how a child baton captures a link back to
/// its parent.
#[derive(Clone)]
pub struct BumpHandle(Rc<RefCell<Node>>);

impl BumpHandle {
    /// Creates the root node. The root starts at ref count 1, representing
    /// the directory's own not-yet-closed state; every `add`/`open`
    /// callback for an immediate child bumps it further.
    pub fn new_root(path: RepoPathBuf) -> Self {
        Self(Rc::new(RefCell::new(Node {
            parent: None,
            path,
            ref_count: 1,
            skipped: false,
        })))
    }

    /// Opens a child directory under `self`, bumping `self`'s ref count and
    /// returning the child's own handle (itself starting at ref count 1 for
    /// its own open state).
    pub fn open_child(&self, child_path: RepoPathBuf) -> Self {
        self.0.borrow_mut().ref_count += 1;
        trace!(path = %self.0.borrow().path.as_internal_str(), count = self.0.borrow().ref_count, "bump: child opened");
        Self(Rc::new(RefCell::new(Node {
            parent: Some(self.clone()),
            path: child_path,
            ref_count: 1,
            skipped: self.0.borrow().skipped,
        })))
    }

    /// Bumps the ref count for a non-directory child (a file baton) opened
    /// under this directory, without creating a tracked node of its own.
    pub fn bump_for_file(&self) {
        self.0.borrow_mut().ref_count += 1;
    }

    pub fn path(&self) -> RepoPathBuf {
        self.0.borrow().path.clone()
    }

    pub fn is_skipped(&self) -> bool {
        self.0.borrow().skipped
    }

    pub fn mark_skipped(&self) {
        self.0.borrow_mut().skipped = true;
    }

    /// Drops one reference, as when a child file or directory baton closes.
    /// Returns `Some` exactly when the count reaches zero.
    pub fn close(self) -> Option<Completion> {
        let reached_zero = {
            let mut node = self.0.borrow_mut();
            debug_assert!(node.ref_count > 0, "bump tracker underflow for {}", node.path.as_internal_str());
            node.ref_count -= 1;
            node.ref_count == 0
        };
        if !reached_zero {
            return None;
        }
        trace!(path = %self.0.borrow().path.as_internal_str(), "bump: directory complete");
        let parent = self.0.borrow().parent.clone();
        match parent {
            None => Some(Completion::EditComplete),
            Some(_) => Some(Completion::DirectoryReady(self)),
        }
    }

    /// Called after a `DirectoryReady` completion has had its close-out work
    /// run: propagates one bump-drop to the parent, which may itself now be
    /// ready to complete.
    pub fn bump_parent(self) -> Option<Completion> {
        let parent = self.0.borrow().parent.clone()?;
        parent.close()
    }

    pub fn downgrade(&self) -> WeakBumpHandle {
        WeakBumpHandle(Rc::downgrade(&self.0))
    }
}

/// A non-owning reference to a bump-tracker node, held by records (like
/// work-queue items) that must not themselves keep a directory alive.
#[derive(Clone)]
pub struct WeakBumpHandle(Weak<RefCell<Node>>);

impl WeakBumpHandle {
    pub fn upgrade(&self) -> Option<BumpHandle> {
        self.0.upgrade().map(BumpHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RepoPathBuf {
        RepoPathBuf::from_internal_string(s)
    }

    #[test]
    fn test_root_completes_when_last_reference_drops() {
        let root = BumpHandle::new_root(path(""));
        // The single owning reference (the directory's own open state)
        // closing should complete the edit.
        assert!(matches!(root.close(), Some(Completion::EditComplete)));
    }

    #[test]
    fn test_open_child_keeps_root_alive() {
        let root = BumpHandle::new_root(path(""));
        let _child = root.open_child(path("a"));
        // root now has ref_count 2 (its own open state + the child), so
        // closing once must not complete it.
        assert!(root.close().is_none());
    }

    #[test]
    fn test_child_completion_propagates_to_parent() {
        let root = BumpHandle::new_root(path(""));
        let child = root.open_child(path("a"));
        // Child has ref_count 1 (its own open state). Closing it reaches
        // zero and is ready (non-root).
        let handle = match child.close() {
            Some(Completion::DirectoryReady(handle)) => handle,
            _ => panic!("expected DirectoryReady"),
        };
        // Bumping the parent drops root's remaining reference (the child's
        // slot), completing the edit.
        assert!(matches!(handle.bump_parent(), Some(Completion::EditComplete)));
    }

    #[test]
    fn test_skipped_flag_inherited_by_children() {
        let root = BumpHandle::new_root(path(""));
        root.mark_skipped();
        let child = root.open_child(path("a"));
        assert!(child.is_skipped());
    }
}
