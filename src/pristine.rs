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

//! The Pristine Store collaborator (spec §2.1, §6 "Pristine-store interface").
//!
//! Out of scope per spec §1: this is deliberately a thin, content-addressed
//! blob store. The editor only needs to materialize a new fulltext as a
//! temporary, install it by its SHA1 once verified, and read an old fulltext
//! back out. Everything about how blobs are actually laid out on disk is an
//! implementation choice the spec leaves to us.

use std::fs;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::checksum::DualChecksumWriter;
use crate::checksum::Md5Checksum;
use crate::checksum::Sha1Checksum;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::file_util::persist_content_addressed_temp_file;
use crate::object_id::ObjectId as _;

#[derive(Debug, Error)]
pub enum PristineError {
    #[error(transparent)]
    Io(#[from] PathError),
    #[error("pristine text {sha1} not found")]
    NotFound { sha1: Sha1Checksum },
}

/// A handle to a pristine text being written. Everything written through
/// [`PristineWriteHandle::writer`] is hashed with both MD5 and SHA1 so the
/// caller can install the result by content hash (spec §4.2 `apply_textdelta`,
/// I5) without a second read pass.
pub struct PristineWriteHandle {
    temp_file: NamedTempFile,
}

impl PristineWriteHandle {
    pub fn writer(&self) -> DualChecksumWriter<&File> {
        DualChecksumWriter::new(self.temp_file.as_file())
    }

    /// Duplicates the underlying file descriptor so a caller can hold a
    /// long-lived owned [`DualChecksumWriter`] across repeated
    /// `apply_textdelta` window writes without holding a borrow of `self`
    /// (spec §4.2 `apply_textdelta`: the window handler accumulates state
    /// across calls until the null window).
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.temp_file.as_file().try_clone()
    }

    pub fn path(&self) -> &Path {
        self.temp_file.path()
    }
}

/// Content-addressed blob store, keyed by SHA1 of the fulltext. One instance
/// is shared across edit sessions against the same working copy.
#[derive(Debug, Clone)]
pub struct PristineStore {
    root: PathBuf,
}

impl PristineStore {
    pub fn init(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self { root: root.to_path_buf() })
    }

    pub fn load(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    fn path_for(&self, sha1: &Sha1Checksum) -> PathBuf {
        let hex = sha1.hex();
        // Shard by the first two hex digits to keep directories small, a
        // common content-addressed store layout.
        self.root.join(&hex[0..2]).join(&hex[2..])
    }

    /// Opens a new temporary to receive a not-yet-hashed fulltext.
    pub fn open_writable(&self) -> Result<PristineWriteHandle, PristineError> {
        let temp_file = NamedTempFile::new_in(&self.root).context(&self.root)?;
        Ok(PristineWriteHandle { temp_file })
    }

    /// Streams `data` into a new temporary, returning its handle plus the
    /// dual checksum of what was written. Used by the add-with-history local
    /// copy path (spec §4.3) and by tests.
    pub fn write_from_reader(
        &self,
        mut data: impl Read,
    ) -> Result<(PristineWriteHandle, Md5Checksum, Sha1Checksum), PristineError> {
        let handle = self.open_writable()?;
        let (md5, sha1) = {
            let mut writer = handle.writer();
            io::copy(&mut data, &mut writer).context(&self.root)?;
            use io::Write as _;
            writer.flush().context(&self.root)?;
            let (_file, md5, sha1) = writer.finish();
            (md5, sha1)
        };
        Ok((handle, md5, sha1))
    }

    /// Installs the temporary as the pristine content addressed by `sha1`.
    /// Idempotent: if the blob is already present, the install is a no-op
    /// (spec §3 I5, §8 P3).
    pub fn install(&self, handle: PristineWriteHandle, sha1: &Sha1Checksum) -> Result<(), PristineError> {
        let dest = self.path_for(sha1);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context(parent)?;
        }
        persist_content_addressed_temp_file(handle.temp_file, &dest).context(&dest)?;
        Ok(())
    }

    pub fn present(&self, sha1: &Sha1Checksum) -> bool {
        self.path_for(sha1).is_file()
    }

    pub fn read_by_sha1(&self, sha1: &Sha1Checksum) -> Result<File, PristineError> {
        let path = self.path_for(sha1);
        File::open(&path).map_err(|source| PristineError::Io(PathError { path, source }))
    }

    /// Removes an orphaned temporary that was never installed (spec §7: a
    /// checksum mismatch during delta application deletes the partial
    /// pristine temporary before failing). Dropping the [`PristineWriteHandle`]
    /// already does this via `NamedTempFile`'s `Drop`; this is for the
    /// explicit-cleanup call sites that want it to read as intentional.
    pub fn discard(&self, _handle: PristineWriteHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent_and_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = PristineStore::init(dir.path()).unwrap();
        let (h1, _md5, sha1) = store.write_from_reader(&b"hello"[..]).unwrap();
        store.install(h1, &sha1).unwrap();
        assert!(store.present(&sha1));

        let (h2, _md5, sha1_again) = store.write_from_reader(&b"hello"[..]).unwrap();
        assert_eq!(sha1, sha1_again);
        store.install(h2, &sha1_again).unwrap(); // idempotent re-install

        let mut buf = Vec::new();
        store.read_by_sha1(&sha1).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_not_present_until_installed() {
        let dir = tempfile::tempdir().unwrap();
        let store = PristineStore::init(dir.path()).unwrap();
        let (_h, _md5, sha1) = store.write_from_reader(&b"x"[..]).unwrap();
        assert!(!store.present(&sha1));
    }
}
