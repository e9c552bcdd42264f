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

pub trait ObjectId {
    fn object_type(&self) -> String;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    fn hex(&self) -> String;
}

/// Defines a new struct type containing a single `Vec<u8>` used to store a
/// checksum or pristine key (the output of a hash function) as bytes. Types
/// defined using this macro automatically implement the [`ObjectId`] trait.
///
/// ```ignore
/// id_type!(pub Sha1Checksum);
/// ```
macro_rules! id_type {
    ($(#[$attr:meta])* $vis:vis $name:ident) => {
        $(#[$attr])*
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
        $vis struct $name(Vec<u8>);

        impl $name {
            pub fn new(value: Vec<u8>) -> Self {
                Self(value)
            }

            pub fn from_bytes(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            /// Parses the given hex string into an id. Panics on malformed
            /// input; use [`Self::try_from_hex`] when the input isn't trusted.
            pub fn from_hex(hex: &str) -> Self {
                Self::try_from_hex(hex).expect("malformed hex id")
            }

            pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
                $crate::hex_util::decode_hex(hex).map(Self)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.hex()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(&self.hex())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                self.hex().serialize(serializer)
            }
        }

        impl $crate::object_id::ObjectId for $name {
            fn object_type(&self) -> String {
                stringify!($name).to_ascii_lowercase()
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.clone()
            }

            fn hex(&self) -> String {
                $crate::hex_util::encode_hex(&self.0)
            }
        }
    };
}

pub(crate) use id_type;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Md5Checksum;

    #[test]
    fn test_display_object_id() {
        let sum = Md5Checksum::from_hex("deadbeef0123");
        assert_eq!(format!("{sum}"), "deadbeef0123");
        assert_eq!(format!("{sum:.6}"), "deadbe");
    }
}
