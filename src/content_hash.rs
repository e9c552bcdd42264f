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

//! A minimal, stable content-hashing trait used to key checksum id types.
//!
//! Node checksums (`Md5Checksum`, `Sha1Checksum`) are themselves raw digest
//! output, so they don't need `ContentHash` to *produce* a hash; the trait
//! exists so the `id_type!` macro in [`crate::object_id`] has a single,
//! uniform bound to derive `Hash`-compatible byte comparisons from, mirroring
//! how id types elsewhere in this lineage are defined.

pub trait DigestUpdate {
    fn update(&mut self, data: &[u8]);
}

pub trait ContentHash {
    /// Feeds a stable, order-dependent byte representation of `self` into
    /// `digest`.
    fn hash(&self, digest: &mut impl DigestUpdate);
}

impl ContentHash for Vec<u8> {
    fn hash(&self, digest: &mut impl DigestUpdate) {
        digest.update(&(self.len() as u64).to_le_bytes());
        digest.update(self);
    }
}

impl ContentHash for str {
    fn hash(&self, digest: &mut impl DigestUpdate) {
        self.as_bytes().to_vec().hash(digest);
    }
}

impl ContentHash for String {
    fn hash(&self, digest: &mut impl DigestUpdate) {
        self.as_str().hash(digest);
    }
}

impl ContentHash for i64 {
    fn hash(&self, digest: &mut impl DigestUpdate) {
        digest.update(&self.to_le_bytes());
    }
}

impl ContentHash for u64 {
    fn hash(&self, digest: &mut impl DigestUpdate) {
        digest.update(&self.to_le_bytes());
    }
}

impl ContentHash for u32 {
    fn hash(&self, digest: &mut impl DigestUpdate) {
        digest.update(&self.to_le_bytes());
    }
}

impl<T: ContentHash> ContentHash for Option<T> {
    fn hash(&self, digest: &mut impl DigestUpdate) {
        match self {
            None => digest.update(&[0]),
            Some(x) => {
                digest.update(&[1]);
                x.hash(digest);
            }
        }
    }
}
