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

//! Checksum id types and the dual-hashing writer used while materializing a
//! new text base (spec §3 BASE.checksum, §4.2 `apply_textdelta`/I5).

use std::io;
use std::io::Write as _;

use digest::Digest as _;

use crate::object_id::id_type;

id_type!(
    /// MD5 checksum of a file's fulltext. Recorded on BASE for compatibility
    /// with callers that still compare against the legacy source checksum;
    /// new installs are keyed by [`Sha1Checksum`].
    pub Md5Checksum
);
id_type!(
    /// SHA1 checksum of a file's fulltext; the key under which the pristine
    /// store addresses text-base blobs.
    pub Sha1Checksum
);

/// A writer that forwards bytes to an inner writer while incrementally
/// computing both the MD5 and SHA1 digest of everything written through it.
///
/// Used at `apply_textdelta` time (spec §4.2) to produce the new pristine's
/// dual checksum without a second pass over the fulltext, and on the delta's
/// source side to detect text-base corruption (§7 `CorruptTextBase`).
pub struct DualChecksumWriter<W> {
    inner: W,
    md5: md5::Md5,
    sha1: sha1::Sha1,
}

impl<W: io::Write> DualChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            md5: md5::Md5::new(),
            sha1: sha1::Sha1::new(),
        }
    }

    pub fn finish(self) -> (W, Md5Checksum, Sha1Checksum) {
        let md5 = Md5Checksum::new(self.md5.finalize().to_vec());
        let sha1 = Sha1Checksum::new(self.sha1.finalize().to_vec());
        (self.inner, md5, sha1)
    }
}

impl<W: io::Write> io::Write for DualChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.md5.update(&buf[..n]);
        self.sha1.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Computes the MD5 checksum of a complete in-memory buffer. Used to verify a
/// delta's consumed source against the recorded base checksum before any
/// window is processed (§8 B3).
pub fn md5_of(data: &[u8]) -> Md5Checksum {
    let mut hasher = md5::Md5::new();
    hasher.update(data);
    Md5Checksum::new(hasher.finalize().to_vec())
}

/// A writer that only tracks an MD5 digest, used on the read side of a
/// text-delta source stream (the recorded base text, not the newly produced
/// one).
pub struct Md5Reader<R> {
    inner: R,
    md5: md5::Md5,
}

impl<R: io::Read> Md5Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            md5: md5::Md5::new(),
        }
    }

    pub fn finish(self) -> Md5Checksum {
        Md5Checksum::new(self.md5.finalize().to_vec())
    }
}

impl<R: io::Read> io::Read for Md5Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.md5.update(&buf[..n]);
        Ok(n)
    }
}

/// Writes `data` through a [`DualChecksumWriter`] in one call; a convenience
/// for tests and for the add-with-history local-copy path (§4.3), which
/// streams an existing pristine into a new temporary.
pub fn copy_with_dual_checksum<R: io::Read, W: io::Write>(
    mut src: R,
    dst: W,
) -> io::Result<(Md5Checksum, Sha1Checksum)> {
    let mut writer = DualChecksumWriter::new(dst);
    io::copy(&mut src, &mut writer)?;
    writer.flush()?;
    let (_, md5, sha1) = writer.finish();
    Ok((md5, sha1))
}
