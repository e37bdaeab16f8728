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

//! The in-memory directory tree. Directories live in an arena and refer
//! to each other by index, never by reference; children are materialized
//! lazily and mutated in place, with the volume tracking which
//! directories diverge from disk.

use zerocopy::{FromBytes, IntoBytes};

use crate::layout::{
    DirEntryRecord, ATTR_DIRECTORY, ATTR_VOLUME_ID, DIR_ENTRY_SIZE, ENTRY_DELETED, ENTRY_END,
};
use crate::name;

/// Index of a directory in the volume's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirId(pub(crate) usize);

pub const ROOT: DirId = DirId(0);

/// A directory's child: either a plain 32-byte record (regular files, but
/// also `.`/`..` and the volume label, which are kept verbatim) or a
/// nested directory in the arena.
#[derive(Debug, Clone)]
pub enum Child {
    File(FileEntry),
    Dir(DirId),
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub record: DirEntryRecord,
    /// Long-name slots that preceded this record on disk; dropped when
    /// the entry is rewritten or removed.
    pub lfn_slots: u32,
}

#[derive(Debug)]
pub struct DirNode {
    /// First cluster of the directory body, or `chain::FIXED_ROOT` for
    /// the FAT12/16 root region.
    pub first_cluster: i64,
    /// This directory's record in its parent; `None` for the root.
    pub record: Option<DirEntryRecord>,
    pub lfn_slots: u32,
    pub parent: Option<DirId>,
    /// `None` until materialized from disk.
    pub children: Option<Vec<Child>>,
}

pub struct DirTree {
    nodes: Vec<DirNode>,
}

impl DirTree {
    pub fn new(root_first_cluster: i64) -> Self {
        Self {
            nodes: vec![DirNode {
                first_cluster: root_first_cluster,
                record: None,
                lfn_slots: 0,
                parent: None,
                children: None,
            }],
        }
    }

    pub fn push(&mut self, node: DirNode) -> DirId {
        self.nodes.push(node);
        DirId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: DirId) -> &DirNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: DirId) -> &mut DirNode {
        &mut self.nodes[id.0]
    }
}

/// Walks 32-byte records until the terminator, folding long-name slots
/// into a counter that is attached to the next real record.
pub fn parse_records(buffer: &[u8], include_deleted: bool) -> Vec<(DirEntryRecord, u32)> {
    let mut records = Vec::new();
    let mut lfn_slots = 0;
    for raw in buffer.chunks_exact(DIR_ENTRY_SIZE) {
        if raw[0] == ENTRY_END {
            break;
        }
        let Ok(record) = DirEntryRecord::read_from_bytes(raw) else {
            break;
        };
        if record.is_long_name() {
            lfn_slots += 1;
            continue;
        }
        let slots = std::mem::take(&mut lfn_slots);
        if raw[0] == ENTRY_DELETED && !include_deleted {
            continue;
        }
        records.push((record, slots));
    }
    records
}

/// Name of a child as recorded on disk.
fn raw_name<'t>(tree: &'t DirTree, child: &'t Child) -> Option<&'t [u8; 11]> {
    match child {
        Child::File(entry) => Some(&entry.record.name),
        Child::Dir(id) => tree.node(*id).record.as_ref().map(|record| &record.name),
    }
}

/// Case-insensitive 8.3 lookup. File children carrying directory or
/// volume-label attributes (`.`/`..`, the label) never match.
pub fn find_child(tree: &DirTree, children: &[Child], target: &str) -> Option<usize> {
    children.iter().position(|child| {
        if let Child::File(entry) = child {
            if entry.record.attributes & (ATTR_DIRECTORY | ATTR_VOLUME_ID) != 0 {
                return false;
            }
        }
        raw_name(tree, child).is_some_and(|raw| name::matches(raw, target))
    })
}

/// Index of the child referring to directory `id`.
pub fn position_of_dir(children: &[Child], id: DirId) -> Option<usize> {
    children
        .iter()
        .position(|child| matches!(child, Child::Dir(child_id) if *child_id == id))
}

/// Projection for directory listings: dot and volume-label entries are
/// dropped, subdirectories get a `/` suffix.
pub fn list_names(tree: &DirTree, children: &[Child]) -> Vec<String> {
    children
        .iter()
        .filter_map(|child| match child {
            Child::File(entry) => {
                if entry.record.attributes & (ATTR_DIRECTORY | ATTR_VOLUME_ID) != 0 {
                    None
                } else {
                    Some(name::decode_short_name(&entry.record.name))
                }
            }
            Child::Dir(id) => tree
                .node(*id)
                .record
                .as_ref()
                .map(|record| name::decode_short_name(&record.name) + "/"),
        })
        .collect()
}

/// The on-disk image of a children vector, in order, without terminator.
pub fn serialize(tree: &DirTree, children: &[Child]) -> Vec<u8> {
    let mut out = Vec::with_capacity(children.len() * DIR_ENTRY_SIZE);
    for child in children {
        match child {
            Child::File(entry) => out.extend_from_slice(entry.record.as_bytes()),
            Child::Dir(id) => {
                if let Some(record) = &tree.node(*id).record {
                    out.extend_from_slice(record.as_bytes());
                }
            }
        }
    }
    out
}
