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

//! Filesystem helpers shared by the pristine store and the edit driver:
//! path-annotated I/O errors, mtime/executable-bit probing, and durable
//! temp-file installation.

use std::fs;
use std::fs::File;
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use tempfile::NamedTempFile;
use tempfile::PersistError;
use thiserror::Error;

#[cfg(unix)]
pub use self::platform::check_executable_bit_support;
pub use self::platform::check_symlink_support;
pub use self::platform::try_symlink;

#[derive(Debug, Error)]
#[error("Cannot access {path}", path = path.display())]
pub struct PathError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            source: error,
        })
    }
}

/// Creates a directory or does nothing if it already exists. Intermediate
/// directories on the path must already exist.
pub fn create_or_reuse_dir(dirname: &Path) -> io::Result<()> {
    match fs::create_dir(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes all files in `dirname`, but not the directory itself. `dirname`
/// must exist and must not contain subdirectories.
pub fn remove_dir_contents(dirname: &Path) -> Result<(), PathError> {
    for entry in dirname.read_dir().context(dirname)? {
        let entry = entry.context(dirname)?;
        let path = entry.path();
        fs::remove_file(&path).context(&path)?;
    }
    Ok(())
}

/// Milliseconds since the Unix epoch, as recorded on `BASE.recorded_mtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MillisSinceEpoch(pub i64);

pub fn mtime_from_metadata(metadata: &Metadata) -> MillisSinceEpoch {
    let time = metadata.modified().unwrap_or(UNIX_EPOCH);
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(i64::MAX))
        .unwrap_or(0);
    MillisSinceEpoch(millis)
}

/// Persists a temp file after synchronizing its content, so that after a
/// crash the persisted file has valid content if it exists at all (spec §9
/// work-queue durability). Overwrites any existing file at `new_path`.
pub fn persist_temp_file<P: AsRef<Path>>(temp_file: NamedTempFile, new_path: P) -> io::Result<File> {
    temp_file.as_file().sync_data()?;
    temp_file
        .persist(new_path)
        .map_err(|PersistError { error, file: _ }| error)
}

/// Like [`persist_temp_file`], but never clobbers an existing file at the
/// destination: pristine installs are content-addressed, so if the target
/// already exists it necessarily has identical content (spec §4.2 I5).
pub fn persist_content_addressed_temp_file<P: AsRef<Path>>(
    temp_file: NamedTempFile,
    new_path: P,
) -> io::Result<()> {
    temp_file.as_file().sync_data()?;
    match temp_file.persist_noclobber(&new_path) {
        Ok(_file) => Ok(()),
        Err(PersistError { error, .. }) if new_path.as_ref().is_file() => {
            // Another install (or a previous interrupted run) already wrote
            // the same content under the same hash.
            let _ = error;
            Ok(())
        }
        Err(PersistError { error, .. }) => Err(error),
    }
}

#[cfg(unix)]
mod platform {
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::fs::symlink;
    use std::path::Path;

    /// Whether changing executable bits is permitted and observable on the
    /// filesystem backing `path`.
    pub fn check_executable_bit_support(path: impl AsRef<Path>) -> io::Result<bool> {
        let temp_file = tempfile::tempfile_in(path)?;
        let old_mode = temp_file.metadata()?.permissions().mode();
        let new_mode = old_mode ^ 0o100;
        match temp_file.set_permissions(PermissionsExt::from_mode(new_mode)) {
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Ok(false),
            Err(err) => Err(err),
            Ok(()) => {
                let mode = temp_file.metadata()?.permissions().mode();
                Ok(mode == new_mode)
            }
        }
    }

    pub fn check_symlink_support() -> io::Result<bool> {
        Ok(true)
    }

    pub fn try_symlink<P: AsRef<Path>, Q: AsRef<Path>>(original: P, link: Q) -> io::Result<()> {
        symlink(original, link)
    }
}

#[cfg(windows)]
mod platform {
    use std::io;
    use std::os::windows::fs::symlink_file;
    use std::path::Path;

    /// Symlink support on Windows requires Developer Mode; rather than probe
    /// the registry (out of scope here), report unsupported and let callers
    /// fall back to plain-file materialization.
    pub fn check_symlink_support() -> io::Result<bool> {
        Ok(false)
    }

    pub fn try_symlink<P: AsRef<Path>, Q: AsRef<Path>>(original: P, link: Q) -> io::Result<()> {
        symlink_file(original, link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_exec_bit_support_in_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_executable_bit_support(dir.path()).unwrap());
    }

    #[test]
    fn test_remove_dir_contents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"x").unwrap();
        fs::write(dir.path().join("b"), b"y").unwrap();
        remove_dir_contents(dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_persist_content_addressed_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deadbeef");
        let t1 = NamedTempFile::new_in(dir.path()).unwrap();
        persist_content_addressed_temp_file(t1, &target).unwrap();
        let t2 = NamedTempFile::new_in(dir.path()).unwrap();
        persist_content_addressed_temp_file(t2, &target).unwrap();
        assert!(target.is_file());
    }
}
