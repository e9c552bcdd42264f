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

//! Editor-wide settings (SPEC_FULL.md §1.1 "Ambient stack").
//!
//! Deserialized the way the teacher corpus layers its own user-facing
//! settings: a plain `serde`-derived struct with `#[serde(default)]` field
//! defaults, loadable from a TOML document via `toml_edit`'s serde bridge.

use serde::Deserialize;
use serde::Serialize;

/// Per-session editor settings (spec §3 "Global session state";
/// SPEC_FULL.md §1.1 adds the last two fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorSettings {
    /// When set, a file with no local text modifications gets its mtime set
    /// to its last-changed-date rather than the time of installation (spec
    /// §4.4 "queue a timestamp-set (to last-changed-date when
    /// `use_commit_times`)").
    pub use_commit_times: bool,

    /// When set, `add_directory`/`add_file` may proceed over an
    /// unversioned on-disk obstruction instead of failing with
    /// `ObstructedUpdate` (spec §4.2 `add_directory` resolution table).
    pub allow_unver_obstructions: bool,

    /// When a tree conflict is raised on a locally-modified file, keep the
    /// pre-conflict working file's copy-from lineage attached to the
    /// recorded conflict version rather than discarding it (SPEC_FULL.md
    /// §1.1: supplements the spec's tree-conflict recording with a detail
    /// original_source preserves but spec.md's distillation is silent on).
    pub preserve_copy_source_on_conflict: bool,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            use_commit_times: false,
            allow_unver_obstructions: false,
            preserve_copy_source_on_conflict: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_conservative_behavior() {
        let settings = EditorSettings::default();
        assert!(!settings.use_commit_times);
        assert!(!settings.allow_unver_obstructions);
    }

    #[test]
    fn test_round_trips_through_toml() {
        let settings = EditorSettings {
            use_commit_times: true,
            ..EditorSettings::default()
        };
        let doc = toml_edit::ser::to_string(&settings).unwrap();
        let parsed: EditorSettings = toml_edit::de::from_str(&doc).unwrap();
        assert_eq!(parsed, settings);
    }
}
