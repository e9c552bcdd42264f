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

//! The text-installation planner run at `close_file` (spec §4.4
//! `merge_file`), plus the line-based three-way merge it calls when the
//! working file has local text modifications.

use bstr::ByteSlice as _;

use crate::repo_path::RepoPathBuf;

/// Whether the working file differs from its recorded BASE (spec §4.4
/// "local state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTextState {
    Unmodified,
    Modified,
    /// The working file is absent from disk even though it is not an
    /// add-with-history in progress (spec §4.4 "working file missing").
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    None,
    Replace,
}

/// Inputs to [`plan_install`], gathered by the driver from the file baton
/// and metadata store before calling it.
#[derive(Debug, Clone)]
pub struct MergeFileInput {
    pub schedule: Schedule,
    pub local_text: LocalTextState,
    /// Whether an on-disk obstruction is present and obstructions are
    /// allowed (spec §4.4 "locally modified, obstruction allowed").
    pub obstruction_allowed: bool,
    /// Whether a new pristine text was actually produced by this close
    /// (false when the editor sent property changes only).
    pub new_pristine_present: bool,
    /// A "magic" property (keywords/eol-style/executable/needs-lock/
    /// special) changed on this close.
    pub magic_property_changed: bool,
    /// The file has keyword-expansion markers in its content.
    pub has_keyword_expansion: bool,
    /// Whether a tree conflict has already been raised for this node; when
    /// true, the working file plan leaves the file untouched even if a
    /// replace is scheduled (spec §4.4 "leave working alone if conflict
    /// already raised").
    pub already_conflicted: bool,
}

/// Where [`InstallPlan::install_from`] a file when `install_pristine` is
/// set but the source isn't the new pristine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallFrom {
    /// Install straight from the new pristine (by SHA1, looked up by the
    /// caller).
    NewPristine,
    /// Install from a named temporary: either a merge result or a
    /// detranslated-for-retranslation copy.
    Temp(RepoPathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Unchanged,
    Merged,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    Conflicted,
    Merged,
    Changed,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub install_pristine: bool,
    pub install_from: Option<InstallFrom>,
    pub merge_outcome: Option<MergeOutcome>,
    /// No install is planned, but the file is unmodified and either being
    /// added or in normal state: queue a timestamp-set and a
    /// record-file-info (spec §4.4 final paragraph).
    pub queue_timestamp_and_record_info: bool,
    pub content_state: ContentState,
}

/// Decides what (if anything) must be written to the working file at
/// `close_file` (spec §4.4 decision matrix).
pub fn plan_install(input: &MergeFileInput, merge_result: Option<MergeOutcome>) -> InstallPlan {
    if input.new_pristine_present {
        let (install_pristine, install_from, merge_outcome, content_state) = match input.schedule {
            Schedule::Replace => (true, Some(InstallFrom::NewPristine), None, ContentState::Changed),
            _ if input.local_text == LocalTextState::Unmodified => {
                (true, Some(InstallFrom::NewPristine), None, ContentState::Changed)
            }
            _ if input.local_text == LocalTextState::Missing => {
                (true, Some(InstallFrom::NewPristine), None, ContentState::Changed)
            }
            _ if input.obstruction_allowed => (true, Some(InstallFrom::NewPristine), None, ContentState::Changed),
            _ => {
                // Locally modified, no obstruction: three-way merge.
                let outcome = merge_result.unwrap_or(MergeOutcome::Unchanged);
                let content_state = match outcome {
                    MergeOutcome::Conflict => ContentState::Conflicted,
                    MergeOutcome::Merged => ContentState::Merged,
                    MergeOutcome::Unchanged => ContentState::Changed,
                };
                (
                    true,
                    Some(InstallFrom::Temp(RepoPathBuf::from_internal_string("merge-result"))),
                    Some(outcome),
                    content_state,
                )
            }
        };
        let install_pristine = install_pristine && !(input.already_conflicted && input.schedule == Schedule::Replace);
        return InstallPlan {
            install_pristine,
            install_from: if install_pristine { install_from } else { None },
            merge_outcome,
            queue_timestamp_and_record_info: false,
            content_state,
        };
    }

    if input.magic_property_changed || input.has_keyword_expansion {
        return InstallPlan {
            install_pristine: true,
            install_from: Some(InstallFrom::Temp(RepoPathBuf::from_internal_string("retranslated"))),
            merge_outcome: None,
            queue_timestamp_and_record_info: false,
            content_state: ContentState::Changed,
        };
    }

    let queue_timestamp_and_record_info = input.local_text == LocalTextState::Unmodified
        && matches!(input.schedule, Schedule::None);
    InstallPlan {
        install_pristine: false,
        install_from: None,
        merge_outcome: None,
        queue_timestamp_and_record_info,
        content_state: ContentState::Unchanged,
    }
}

/// Line-based three-way merge (diff3-style), used to compute the
/// [`MergeOutcome`] that [`plan_install`] packages into a work-queue `merge`
/// item. Operates on whole lines (including terminators) so binary-safe
/// byte content round-trips unchanged when there is no conflict.
///
/// Anchors the merge on base lines that are matched, unchanged, by *both*
/// sides (a longest-common-subsequence alignment against each side), then
/// walks the hunks between consecutive anchors: a hunk that one side left
/// equal to base is resolved to the other side's hunk; equal hunks on both
/// sides collapse to one copy; otherwise the hunk is a conflict, rendered
/// with both sides bracketed by markers.
pub fn merge_lines(base: &[u8], ours: &[u8], theirs: &[u8]) -> (Vec<u8>, MergeOutcome) {
    let base_lines = split_lines(base);
    let our_lines = split_lines(ours);
    let their_lines = split_lines(theirs);

    let our_matches = lcs_matches(&base_lines, &our_lines);
    let their_matches = lcs_matches(&base_lines, &their_lines);

    let their_by_base: std::collections::HashMap<usize, usize> = their_matches.iter().copied().collect();
    // Anchors: base indices matched identically on both sides, in order.
    let anchors: Vec<(usize, usize, usize)> = our_matches
        .iter()
        .filter_map(|&(bi, oi)| their_by_base.get(&bi).map(|&ti| (bi, oi, ti)))
        .collect();

    let mut result = Vec::new();
    let mut conflicted = false;
    let mut changed = false;

    let mut prev = (None::<usize>, None::<usize>, None::<usize>);
    let mut emit_hunk = |prev: (Option<usize>, Option<usize>, Option<usize>), anchor: (usize, usize, usize)| {
        let base_hunk = &base_lines[prev.0.map(|i| i + 1).unwrap_or(0)..anchor.0];
        let our_hunk = &our_lines[prev.1.map(|i| i + 1).unwrap_or(0)..anchor.1];
        let their_hunk = &their_lines[prev.2.map(|i| i + 1).unwrap_or(0)..anchor.2];

        if our_hunk == their_hunk {
            if our_hunk != base_hunk {
                changed = true;
            }
            for line in our_hunk {
                result.extend_from_slice(line);
            }
        } else if our_hunk == base_hunk {
            changed = true;
            for line in their_hunk {
                result.extend_from_slice(line);
            }
        } else if their_hunk == base_hunk {
            changed = true;
            for line in our_hunk {
                result.extend_from_slice(line);
            }
        } else {
            conflicted = true;
            result.extend_from_slice(CONFLICT_START);
            for line in our_hunk {
                result.extend_from_slice(line);
            }
            result.extend_from_slice(CONFLICT_MID);
            for line in their_hunk {
                result.extend_from_slice(line);
            }
            result.extend_from_slice(CONFLICT_END);
        }
    };

    for &anchor in &anchors {
        emit_hunk(prev, anchor);
        result.extend_from_slice(base_lines[anchor.0]);
        prev = (Some(anchor.0), Some(anchor.1), Some(anchor.2));
    }
    emit_hunk(
        prev,
        (base_lines.len(), our_lines.len(), their_lines.len()),
    );

    let outcome = if conflicted {
        MergeOutcome::Conflict
    } else if changed {
        MergeOutcome::Merged
    } else {
        MergeOutcome::Unchanged
    };
    (result, outcome)
}

/// Splits into lines, each slice retaining its trailing `\n` (or none, for a
/// final unterminated line), the same convention `bstr` uses for byte-safe
/// line-oriented diffing.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    data.lines_with_terminator().collect()
}

/// Conflict marker labels, matching the "generated conflict filenames using
/// preserved extensions" convention from spec §4.4: markers delimit hunks
/// rather than naming files, since this planner operates purely on byte
/// content and leaves file-extension bookkeeping to the driver.
const CONFLICT_START: &[u8] = b"<<<<<<< working\n";
const CONFLICT_MID: &[u8] = b"=======\n";
const CONFLICT_END: &[u8] = b">>>>>>> incoming\n";

/// Longest-common-subsequence alignment of `changed` against `base`,
/// returning matched `(base_index, changed_index)` pairs in increasing
/// order of both indices.
fn lcs_matches(base: &[&[u8]], changed: &[&[u8]]) -> Vec<(usize, usize)> {
    let n = base.len();
    let m = changed.len();
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if base[i] == changed[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut matches = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if base[i] == changed[j] {
            matches.push((i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_non_overlapping_edits() {
        let base = b"one\ntwo\nthree\n".to_vec();
        let ours = b"one-mine\ntwo\nthree\n".to_vec();
        let theirs = b"one\ntwo\nthree-theirs\n".to_vec();
        let (result, outcome) = merge_lines(&base, &ours, &theirs);
        assert_eq!(outcome, MergeOutcome::Merged);
        assert_eq!(result, b"one-mine\ntwo\nthree-theirs\n".to_vec());
    }

    #[test]
    fn test_merge_identical_sides_is_unchanged() {
        let base = b"a\nb\n".to_vec();
        let (result, outcome) = merge_lines(&base, &base, &base);
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert_eq!(result, base);
    }

    #[test]
    fn test_merge_overlapping_edits_conflicts() {
        let base = b"line\n".to_vec();
        let ours = b"mine\n".to_vec();
        let theirs = b"theirs\n".to_vec();
        let (result, outcome) = merge_lines(&base, &ours, &theirs);
        assert_eq!(outcome, MergeOutcome::Conflict);
        assert!(result.starts_with(CONFLICT_START));
    }

    #[test]
    fn test_plan_unmodified_installs_pristine_as_changed() {
        let input = MergeFileInput {
            schedule: Schedule::None,
            local_text: LocalTextState::Unmodified,
            obstruction_allowed: false,
            new_pristine_present: true,
            magic_property_changed: false,
            has_keyword_expansion: false,
            already_conflicted: false,
        };
        let plan = plan_install(&input, None);
        assert!(plan.install_pristine);
        assert_eq!(plan.content_state, ContentState::Changed);
    }

    #[test]
    fn test_plan_locally_modified_merges() {
        let input = MergeFileInput {
            schedule: Schedule::None,
            local_text: LocalTextState::Modified,
            obstruction_allowed: false,
            new_pristine_present: true,
            magic_property_changed: false,
            has_keyword_expansion: false,
            already_conflicted: false,
        };
        let plan = plan_install(&input, Some(MergeOutcome::Merged));
        assert_eq!(plan.content_state, ContentState::Merged);
        assert_eq!(plan.merge_outcome, Some(MergeOutcome::Merged));
    }

    #[test]
    fn test_plan_no_pristine_no_magic_prop_queues_record_info() {
        let input = MergeFileInput {
            schedule: Schedule::None,
            local_text: LocalTextState::Unmodified,
            obstruction_allowed: false,
            new_pristine_present: false,
            magic_property_changed: false,
            has_keyword_expansion: false,
            already_conflicted: false,
        };
        let plan = plan_install(&input, None);
        assert!(!plan.install_pristine);
        assert!(plan.queue_timestamp_and_record_info);
    }
}
