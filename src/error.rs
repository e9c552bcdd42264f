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

//! Typed editor errors (spec §7).

use crate::checksum::Md5Checksum;
use crate::checksum::Sha1Checksum;
use crate::file_util::PathError;
use crate::metadata::MetadataError;
use crate::pristine::PristineError;
use crate::repo_path::PathEscapesAnchorError;
use crate::repo_path::RepoPathBuf;

/// The recorded base checksum disagreed with an expected value, either on
/// the delta's source side or on its produced fulltext (spec §7, §8 B3).
#[derive(Debug, thiserror::Error)]
pub enum CorruptTextBaseError {
    #[error("recorded base checksum {recorded} does not match expected {expected} for {path}")]
    SourceMismatch {
        path: RepoPathBuf,
        recorded: Md5Checksum,
        expected: Md5Checksum,
    },
    #[error("produced fulltext checksum {actual} does not match expected {expected} for {path}")]
    ProducedMismatch {
        path: RepoPathBuf,
        actual: Md5Checksum,
        expected: Md5Checksum,
    },
    #[error("consumed delta source checksum {actual} does not match recorded base {recorded} for {path}")]
    SourceCorruption {
        path: RepoPathBuf,
        actual: Md5Checksum,
        recorded: Md5Checksum,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ObstructedUpdateError {
    #[error("{path} exists on disk as {found:?}, expected {expected:?}")]
    KindMismatch {
        path: RepoPathBuf,
        found: crate::metadata::NodeKind,
        expected: crate::metadata::NodeKind,
    },
    #[error("{path} is obstructed by an unversioned {found:?} and obstructions are not allowed")]
    UnversionedObstruction {
        path: RepoPathBuf,
        found: crate::metadata::NodeKind,
    },
    #[error(transparent)]
    PathEscapesAnchor(#[from] PathEscapesAnchorError),
}

#[derive(Debug, thiserror::Error)]
pub enum UnsupportedFeatureError {
    #[error("add_directory with copyfrom is not supported (path: {path})")]
    AddDirectoryWithCopyfrom { path: RepoPathBuf },
    #[error("switch target {path} crosses repository roots ({from} -> {to})")]
    SwitchCrossesRepositoryRoots { path: RepoPathBuf, from: String, to: String },
}

/// Sequencing violation in the incoming editor-operation stream (spec §7
/// `MalformedStream`).
#[derive(Debug, thiserror::Error)]
pub enum MalformedStreamError {
    #[error("apply_textdelta called on {path} after close_file")]
    TextDeltaAfterClose { path: RepoPathBuf },
    #[error("absent_{kind} called on {path} which already has a BASE entry")]
    AbsentOnExistingBase { path: RepoPathBuf, kind: &'static str },
    #[error("{op} called with no matching open baton for {path}")]
    UnmatchedClose { op: &'static str, path: RepoPathBuf },
}

/// Top-level editor error (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error(transparent)]
    CorruptTextBase(#[from] CorruptTextBaseError),
    #[error(transparent)]
    ObstructedUpdate(#[from] ObstructedUpdateError),
    #[error(transparent)]
    UnsupportedFeature(#[from] UnsupportedFeatureError),
    #[error(transparent)]
    MalformedStream(#[from] MalformedStreamError),
    #[error("{path} not found")]
    PathNotFound { path: RepoPathBuf },
    #[error("not a working copy")]
    NotWorkingCopy,
    #[error("{path} is not under version control")]
    NotUnderVersionControl { path: RepoPathBuf },
    #[error("switch URL is outside the known repository root ({url})")]
    InvalidSwitch { url: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Pristine(#[from] PristineError),
    #[error(transparent)]
    Io(#[from] PathError),
}

/// A chained cause specifically looked for on the delete path (spec §7,
/// §9): when deleting a node whose subtree still has local text
/// modifications, the classifier's tree-conflict path is taken instead of
/// erroring, so "left local modification" is caught and turned into a
/// successful tree-conflict recording rather than a hard failure.
#[derive(Debug, thiserror::Error)]
#[error("local modifications were left behind under {path}")]
pub struct LeftLocalModificationError {
    pub path: RepoPathBuf,
}
