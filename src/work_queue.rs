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

//! The per-directory Work Queue (spec §2 component 3, §9 "Deferred work").
//!
//! An ordered, durable list of filesystem operations deferred from the
//! editor callback that discovered them to a controlled run point
//! (directory/file close). The queue is re-entrant: on cancellation or error
//! (spec §5 "Cancellation", §8 P6/B4) the unrun suffix stays on the
//! directory and is replayed the next time this directory is opened.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::instrument;

use crate::checksum::Sha1Checksum;
use crate::error::EditorError;
use crate::file_util::IoResultExt as _;
use crate::file_util::MillisSinceEpoch;
use crate::file_util::persist_temp_file;
use crate::file_util::try_symlink;
use crate::metadata::MetadataStore;
use crate::metadata::PropertyMap;
use crate::metadata::TreeConflict;
use crate::pristine::PristineStore;
use crate::repo_path::RepoPathBuf;

/// Where an `InstallFile` item's bytes come from.
#[derive(Debug, Clone)]
pub enum InstallSource {
    /// Install from the pristine store, keyed by SHA1.
    Pristine(Sha1Checksum),
    /// Install from a named on-disk temporary (spec §4.4: retranslation,
    /// or the add-with-history working-text preservation path).
    Temp(PathBuf),
    /// Write a symlink pointing at `target`.
    Symlink { target: String },
}

#[derive(Debug, Clone)]
pub enum WorkItem {
    InstallFile {
        dest: PathBuf,
        source: InstallSource,
        executable: bool,
    },
    Move {
        from: PathBuf,
        to: PathBuf,
    },
    Remove {
        path: PathBuf,
    },
    SetMtime {
        path: PathBuf,
        millis: MillisSinceEpoch,
    },
    SyncFileFlags {
        path: PathBuf,
        executable: bool,
    },
    /// Records a newly-detected tree conflict into the victim's ACTUAL
    /// layer (spec §4.1 I4: recorded at most once per victim).
    AddTreeConflict {
        path: RepoPathBuf,
        conflict: Box<TreeConflict>,
    },
    /// Persists the merged base properties as a standalone file, for
    /// compatibility with older readers that expect a props sidecar rather
    /// than an inline BASE field (spec §4.2 close_directory/close_file).
    WriteOldPropsFile {
        path: PathBuf,
        properties: PropertyMap,
    },
    /// Removes any temporaries left over from a (possibly partial) prior
    /// run of this item set.
    CleanupTemp {
        path: PathBuf,
    },
}

/// An ordered, per-directory list of deferred work.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Runs every queued item in order, removing each one only after it has
    /// executed successfully. If `should_cancel` signals cancellation
    /// between items, the remaining items are left queued so a later
    /// re-invocation on the same directory resumes from there (spec §5,
    /// §8 B4, I6).
    #[instrument(skip_all)]
    pub fn run(
        &mut self,
        pristine: &PristineStore,
        metadata: &mut dyn MetadataStore,
        should_cancel: &mut dyn FnMut() -> bool,
    ) -> Result<(), EditorError> {
        while let Some(item) = self.items.front() {
            if should_cancel() {
                debug!(remaining = self.items.len(), "work queue cancelled, items preserved");
                return Err(EditorError::Cancelled);
            }
            run_one(item, pristine, metadata)?;
            self.items.pop_front();
        }
        Ok(())
    }
}

fn run_one(
    item: &WorkItem,
    pristine: &PristineStore,
    metadata: &mut dyn MetadataStore,
) -> Result<(), EditorError> {
    match item {
        WorkItem::InstallFile { dest, source, executable } => {
            install_file(dest, source, *executable, pristine)?;
        }
        WorkItem::Move { from, to } => {
            fs::rename(from, to).context(from)?;
        }
        WorkItem::Remove { path } => match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(EditorError::Io(crate::file_util::PathError { path: path.clone(), source: err })),
        },
        WorkItem::SetMtime { path, millis } => {
            set_mtime(path, *millis).context(path)?;
        }
        WorkItem::SyncFileFlags { path, executable } => {
            set_executable_bit(path, *executable).context(path)?;
        }
        WorkItem::AddTreeConflict { path, conflict } => {
            let path = path.as_repo_path();
            let mut node = metadata.read_node(path)?;
            node.actual.tree_conflict = Some((**conflict).clone());
            metadata.write_actual(path, node.actual)?;
        }
        WorkItem::WriteOldPropsFile { path, properties } => {
            write_props_sidecar(path, properties).context(path)?;
        }
        WorkItem::CleanupTemp { path } => match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(EditorError::Io(crate::file_util::PathError { path: path.clone(), source: err })),
        },
    }
    Ok(())
}

fn install_file(
    dest: &Path,
    source: &InstallSource,
    executable: bool,
    pristine: &PristineStore,
) -> Result<(), EditorError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context(parent)?;
    }
    match source {
        InstallSource::Pristine(sha1) => {
            let mut reader = pristine.read_by_sha1(sha1)?;
            let mut out = fs::File::create(dest).context(dest)?;
            io_copy(&mut reader, &mut out).context(dest)?;
        }
        InstallSource::Temp(temp_path) => {
            fs::copy(temp_path, dest).context(dest)?;
        }
        InstallSource::Symlink { target } => {
            let _ = fs::remove_file(dest);
            try_symlink(target, dest).context(dest)?;
            return Ok(());
        }
    }
    set_executable_bit(dest, executable).context(dest)?;
    Ok(())
}

fn io_copy(reader: &mut impl io::Read, writer: &mut impl io::Write) -> io::Result<u64> {
    io::copy(reader, writer)
}

#[cfg(unix)]
fn set_executable_bit(path: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable_bit(_path: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}

fn set_mtime(path: &Path, millis: MillisSinceEpoch) -> io::Result<()> {
    let time = std::time::UNIX_EPOCH + std::time::Duration::from_millis(millis.0.max(0) as u64);
    let file = fs::File::options().write(true).open(path)?;
    file.set_modified(time)
}

fn write_props_sidecar(path: &Path, properties: &PropertyMap) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = Vec::new();
    for (name, value) in properties {
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'\0');
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
    }
    let temp = tempfile::NamedTempFile::new_in(path.parent().unwrap_or(Path::new(".")))?;
    {
        use io::Write as _;
        let mut f = temp.as_file();
        f.write_all(&buf)?;
    }
    persist_temp_file(temp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadataStore;

    #[test]
    fn test_replay_stops_at_cancellation_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let pristine = PristineStore::init(dir.path()).unwrap();
        let mut metadata = InMemoryMetadataStore::new();

        let mut queue = WorkQueue::new();
        queue.push(WorkItem::SetMtime {
            path: dir.path().join("nonexistent-a"),
            millis: MillisSinceEpoch(0),
        });
        queue.push(WorkItem::SetMtime {
            path: dir.path().join("nonexistent-b"),
            millis: MillisSinceEpoch(0),
        });

        // First run: cancel immediately, nothing executes, queue intact.
        let mut cancelled = true;
        let err = queue
            .run(&pristine, &mut metadata, &mut || cancelled)
            .unwrap_err();
        assert!(matches!(err, EditorError::Cancelled));
        assert_eq!(queue.len(), 2);

        // Both items reference paths that don't exist as real files, so
        // SetMtime would fail; swap in Remove on a missing file instead,
        // which is defined to be a silent no-op, to test successful drain.
        let mut queue = WorkQueue::new();
        queue.push(WorkItem::Remove { path: dir.path().join("nonexistent-a") });
        queue.push(WorkItem::Remove { path: dir.path().join("nonexistent-b") });
        cancelled = false;
        queue.run(&pristine, &mut metadata, &mut || cancelled).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_install_file_from_pristine() {
        let dir = tempfile::tempdir().unwrap();
        let pristine = PristineStore::init(dir.path().join("pristine").as_path()).unwrap();
        let (handle, _md5, sha1) = pristine.write_from_reader(&b"hello world"[..]).unwrap();
        pristine.install(handle, &sha1).unwrap();

        let mut metadata = InMemoryMetadataStore::new();
        let mut queue = WorkQueue::new();
        let dest = dir.path().join("wc").join("a.txt");
        queue.push(WorkItem::InstallFile {
            dest: dest.clone(),
            source: InstallSource::Pristine(sha1),
            executable: false,
        });
        queue.run(&pristine, &mut metadata, &mut || false).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }
}
