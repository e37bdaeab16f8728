// Copyright 2025 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use pika_err::*;

/// Allocation figures of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Path-oriented operations every mounted filesystem offers. Handle-based
/// file access stays on the concrete volume type, since handles borrow it.
///
/// Paths are `/`-separated and absolute; empty segments are ignored.
/// `list_dir` and `size_of` answer `None` for paths that do not resolve.
pub trait FileSystem {
    /// Names of the entries of a directory; subdirectory names carry a
    /// trailing `/`.
    fn list_dir(&mut self, path: &str) -> Result<Option<Vec<String>>>;

    /// Byte size of a file, 0 for directories.
    fn size_of(&mut self, path: &str) -> Result<Option<u64>>;

    /// Creates an empty file. `false` when the path already exists.
    fn create(&mut self, path: &str) -> Result<bool>;

    /// Removes a file or an empty directory.
    fn delete(&mut self, path: &str) -> Result<()>;

    /// Moves an entry, possibly across directories.
    fn rename(&mut self, path: &str, new_path: &str) -> Result<()>;

    /// Creates an empty directory.
    fn mkdir(&mut self, path: &str) -> Result<()>;

    fn stats(&mut self) -> Result<Stats>;

    /// Makes every buffered mutation durable.
    fn flush(&mut self) -> Result<()>;
}
