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

//! The update/switch editor core of a working-copy layer (see `DESIGN.md`
//! for the grounding ledger and `SPEC_FULL.md` for the full requirements).
//!
//! A caller drives one [`driver::EditSession`] with the well-formed editor
//! operations of an incoming change stream (`set_target_revision`,
//! `open_root`, `open_directory`/`add_directory`/`close_directory`,
//! `open_file`/`add_file`/`apply_textdelta`/`close_file`, `delete_entry`,
//! `absent_file`/`absent_directory`, `close_edit`). The session coordinates
//! five collaborating components:
//!
//! - [`classifier`]: the pure node-state classifier (proceed / skip / raise
//!   a tree conflict) a node's incoming action is run through.
//! - [`metadata`]: the three-layer (BASE/WORKING/ACTUAL) node-state store
//!   interface, plus an in-memory reference implementation.
//! - [`pristine`]: the content-addressed text-base blob store interface.
//! - [`work_queue`]: the per-directory deferred-filesystem-operation queue
//!   that gives the editor its cancellation-safe, replay-on-resume
//!   discipline.
//! - [`bump_tracker`]: the reference-counted per-directory completion
//!   tracker that fires "directory complete" exactly once.
//!
//! [`add_with_history`] and [`merge_file`] implement the two largest pieces
//! of `close_file`'s and `add_file`'s internal logic: resolving a
//! `copyfrom`-style add against local sources, and planning how a file's
//! working text should be installed given local modifications. [`notify`]
//! defines the callback surface a session is driven through, and
//! [`repo_path`] the path type and anchor-escape safety check every
//! incoming wire path is run through before it touches the filesystem.

pub mod add_with_history;
pub mod bump_tracker;
pub mod checksum;
pub mod classifier;
pub mod content_hash;
pub mod driver;
pub mod error;
pub mod file_util;
pub mod hex_util;
pub mod merge_file;
pub mod metadata;
pub mod notify;
pub mod object_id;
pub mod pristine;
pub mod repo_path;
pub mod settings;
pub mod work_queue;

pub use driver::EditSession;
pub use driver::EditSessionArgs;
pub use error::EditorError;
pub use settings::EditorSettings;
