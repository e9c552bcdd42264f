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

//! Repository-relative paths and the anchor-escape safety check (spec §4.6).

use std::fmt;
use std::fmt::Debug;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use itertools::Itertools as _;
use ref_cast::RefCastCustom;
use ref_cast::ref_cast_custom;
use thiserror::Error;

/// Name of the per-directory administrative metadata directory. Names equal
/// to this are rejected everywhere a path component is validated (§4.6).
pub const ADMIN_DIR_NAME: &str = ".wc-admin";

/// Owned repository-relative path, using `/` as the internal separator
/// regardless of platform.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RepoPathBuf {
    value: String,
}

impl RepoPathBuf {
    pub fn root() -> Self {
        Self { value: String::new() }
    }

    /// Builds a path from a `/`-separated internal string. Does not validate
    /// component syntax; use [`RepoPath::from_internal_string`] for that.
    pub fn from_internal_string(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    pub fn as_repo_path(&self) -> &RepoPath {
        RepoPath::from_internal_string_unchecked(&self.value)
    }

    pub fn join(&self, component: &str) -> Self {
        let mut value = self.value.clone();
        if !value.is_empty() {
            value.push('/');
        }
        value.push_str(component);
        Self { value }
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

impl fmt::Display for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl Debug for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoPathBuf({:?})", self.value)
    }
}

impl std::ops::Deref for RepoPathBuf {
    type Target = RepoPath;

    fn deref(&self) -> &RepoPath {
        self.as_repo_path()
    }
}

impl std::borrow::Borrow<RepoPath> for RepoPathBuf {
    fn borrow(&self) -> &RepoPath {
        self.as_repo_path()
    }
}

/// Borrowed repository-relative path.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, RefCastCustom)]
#[repr(transparent)]
pub struct RepoPath {
    value: str,
}

impl RepoPath {
    #[ref_cast_custom]
    fn from_internal_string_unchecked(value: &str) -> &Self;

    pub fn from_internal_string(value: &str) -> Result<&Self, InvalidRepoPathError> {
        if is_valid_repo_path_str(value) {
            Ok(Self::from_internal_string_unchecked(value))
        } else {
            Err(InvalidRepoPathError { value: value.to_owned() })
        }
    }

    pub fn is_root(&self) -> bool {
        self.value.is_empty()
    }

    pub fn as_internal_str(&self) -> &str {
        &self.value
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.value.split('/').filter(|c| !c.is_empty())
    }

    pub fn basename(&self) -> Option<&str> {
        self.components().next_back()
    }

    pub fn parent(&self) -> Option<&Self> {
        let (parent, _) = self.value.rsplit_once('/')?;
        Some(Self::from_internal_string_unchecked(parent))
    }

    pub fn starts_with(&self, base: &Self) -> bool {
        if base.is_root() {
            return true;
        }
        self.value == base.value || self.value.starts_with(&format!("{}/", base.value))
    }

    pub fn to_owned(&self) -> RepoPathBuf {
        RepoPathBuf::from_internal_string(self.value.to_owned())
    }

    /// Converts this repository-relative path to a filesystem path under
    /// `base`, rejecting any component that would let the result escape
    /// `base` (spec §4.6 / §8 B1) and any component matching the
    /// administrative directory name.
    pub fn to_fs_path(&self, base: &Path) -> Result<PathBuf, PathEscapesAnchorError> {
        let mut result = base.to_path_buf();
        for component in self.components() {
            if component == ADMIN_DIR_NAME {
                return Err(PathEscapesAnchorError {
                    repo_path: self.to_owned(),
                    reason: EscapeReason::AdministrativeDirectory,
                });
            }
            match Path::new(component).components().exactly_one() {
                Ok(Component::Normal(name)) => result.push(name),
                _ => {
                    return Err(PathEscapesAnchorError {
                        repo_path: self.to_owned(),
                        reason: EscapeReason::Traversal,
                    });
                }
            }
        }
        Ok(result)
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl Debug for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoPath({:?})", &self.value)
    }
}

impl ToOwned for RepoPath {
    type Owned = RepoPathBuf;

    fn to_owned(&self) -> RepoPathBuf {
        RepoPath::to_owned(self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{value:?} is not a valid repository path")]
pub struct InvalidRepoPathError {
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeReason {
    /// A component was `..`, a root, a prefix, or otherwise not a plain name.
    Traversal,
    /// A component matched the administrative directory name.
    AdministrativeDirectory,
}

/// Raised when a path derived from the incoming editor stream would resolve
/// outside the anchor, or names the administrative directory (spec §4.6,
/// surfaces as `ObstructedUpdate` per §7).
#[derive(Debug, Error, PartialEq, Eq)]
#[error("path '{repo_path}' is not in the working copy ({reason:?})")]
pub struct PathEscapesAnchorError {
    pub repo_path: RepoPathBuf,
    pub reason: EscapeReason,
}

fn is_valid_repo_path_str(value: &str) -> bool {
    !value.starts_with('/')
        && !value.ends_with('/')
        && !value.split('/').any(|c| c.is_empty() || c == "." || c == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_and_basename() {
        let p = RepoPath::from_internal_string("a/b/c").unwrap();
        assert_eq!(p.basename(), Some("c"));
        assert_eq!(p.parent().unwrap().as_internal_str(), "a/b");
        assert!(RepoPath::from_internal_string("").unwrap().is_root());
    }

    #[test]
    fn test_starts_with() {
        let root = RepoPath::from_internal_string("").unwrap();
        let a = RepoPath::from_internal_string("a").unwrap();
        let ab = RepoPath::from_internal_string("a/b").unwrap();
        let ac = RepoPath::from_internal_string("ac").unwrap();
        assert!(ab.starts_with(root));
        assert!(ab.starts_with(a));
        assert!(!ac.starts_with(a));
    }

    #[test]
    fn test_to_fs_path_escape_rejected() {
        let base = Path::new("/wc");
        let ok = RepoPath::from_internal_string("a/b.txt").unwrap();
        assert_eq!(ok.to_fs_path(base).unwrap(), base.join("a").join("b.txt"));

        // `from_internal_string` already rejects ".." components, so
        // construct the unchecked form to simulate a hostile wire path.
        let evil = RepoPath::from_internal_string_unchecked("a/../../etc/passwd");
        let err = evil.to_fs_path(base).unwrap_err();
        assert_eq!(err.reason, EscapeReason::Traversal);

        let admin = RepoPath::from_internal_string_unchecked("a/.wc-admin/x");
        let err = admin.to_fs_path(base).unwrap_err();
        assert_eq!(err.reason, EscapeReason::AdministrativeDirectory);
    }
}
