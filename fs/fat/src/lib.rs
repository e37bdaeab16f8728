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

//! FAT12/16/32 driver over a sector-granular block device.
//!
//! A mounted volume keeps FAT copy 0 and the directory tree in memory and
//! buffers every mutation there; `FileSystem::flush` writes dirtied FAT
//! sectors to every redundant copy first and rewrites altered directory
//! bodies second, so an interrupted flush can leak clusters but never
//! leaves a directory pointing at unlinked ones.

use std::collections::{BTreeSet, HashSet};

use log::{error, warn};
use zerocopy::{FromBytes, IntoBytes};

use pika_blk::BlockDevice;

use crate::alloc::Allocator;
use crate::chain::{Chain, Link, LinkStore, FIXED_ROOT};
use crate::dir::{Child, DirId, DirNode, DirTree, FileEntry};
use crate::layout::{
    BiosParameterBlock, DirEntryRecord, ExtendedBootInfo, Fat32Extension, FsInfoSector,
    ATTR_ARCHIVE, ATTR_DIRECTORY, DIR_ENTRY_SIZE, EXTENDED_INFO_OFFSET_FAT16,
    EXTENDED_INFO_OFFSET_FAT32, EXT_SIGNATURE_FULL, EXT_SIGNATURE_SHORT, FAT32_EXTENSION_OFFSET,
    FS_INFO_UNKNOWN,
};
use crate::table::{FatTable, ENTRY_FREE};

mod alloc;
mod chain;
mod dir;
pub mod layout;
mod name;
mod table;

pub use std::io::SeekFrom;

pub use pika_err::{Error, Result};
pub use pika_fs::{FileSystem, Stats};
pub use table::FatType;

#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Forces the FAT width instead of deriving it from the boot sector,
    /// which cannot tell FAT12 from FAT16 by itself.
    pub fat_type: Option<FatType>,
    /// Mounts even when the redundant FAT copies disagree; copy 0 wins.
    pub bypass_coherency_check: bool,
}

/// Sector arithmetic fixed at mount time.
struct Geometry {
    sector_size: u32,
    sectors_per_cluster: u32,
    cluster_size: u32,
    reserved_sectors: u32,
    fat_count: u32,
    sectors_per_fat: u32,
    root_region_start: u32,
    root_region_sectors: u32,
    data_region_start: u32,
    cluster_count: u32,
}

pub struct FatVolume<D> {
    dev: D,
    writable: bool,
    geom: Geometry,
    volume_label: [u8; 11],
    fs_type_label: [u8; 8],
    volume_serial: u32,
    /// FAT32 FS information sector, when its signatures checked out at
    /// mount; rewritten with fresh hints on flush.
    fs_info_sector: Option<u32>,
    table: FatTable,
    allocator: Allocator,
    tree: DirTree,
    altered_dirs: BTreeSet<DirId>,
}

impl<D: BlockDevice> FatVolume<D> {
    pub fn mount(dev: D) -> Result<Self> {
        Self::mount_with(dev, MountOptions::default())
    }

    pub fn mount_with(mut dev: D, options: MountOptions) -> Result<Self> {
        let sector_size = dev.sector_size();
        let sector0 = dev.read(0, 1)?;
        let Ok((bpb, _)) = BiosParameterBlock::read_from_prefix(&sector0) else {
            error!("Boot sector shorter than a BIOS parameter block");
            return Err(Error::CorruptFilesystem);
        };

        let mut kind = if bpb.sectors_per_fat_16.get() == 0 {
            FatType::Fat32
        } else {
            FatType::Fat16
        };
        if let Some(forced) = options.fat_type {
            kind = forced;
        }

        let bytes_per_sector = bpb.bytes_per_sector.get() as u32;
        if bytes_per_sector != sector_size {
            error!("Bytes per sector ({bytes_per_sector}) shall match the device sector size ({sector_size})");
            return Err(Error::CorruptFilesystem);
        }
        if bytes_per_sector == 0 || bytes_per_sector % 128 != 0 {
            error!("Bytes per sector ({bytes_per_sector}) shall be a multiple of 128");
            return Err(Error::CorruptFilesystem);
        }
        let sectors_per_cluster = bpb.sectors_per_cluster as u32;
        if !sectors_per_cluster.is_power_of_two() {
            error!("Sectors per cluster ({sectors_per_cluster}) shall be a power of two");
            return Err(Error::CorruptFilesystem);
        }
        let fat_count = bpb.fat_count as u32;
        if fat_count == 0 {
            error!("FAT count shall not be zero");
            return Err(Error::CorruptFilesystem);
        }

        let (sectors_per_fat, root_cluster, fs_info_sector, info_offset) =
            if kind == FatType::Fat32 {
                let Ok((extension, _)) =
                    Fat32Extension::read_from_prefix(&sector0[FAT32_EXTENSION_OFFSET..])
                else {
                    error!("Boot sector shorter than the FAT32 extension");
                    return Err(Error::CorruptFilesystem);
                };
                (
                    extension.sectors_per_fat_32.get(),
                    extension.root_cluster.get(),
                    Some(extension.fs_info_sector.get() as u32),
                    EXTENDED_INFO_OFFSET_FAT32,
                )
            } else {
                (
                    bpb.sectors_per_fat_16.get() as u32,
                    0,
                    None,
                    EXTENDED_INFO_OFFSET_FAT16,
                )
            };
        if sectors_per_fat == 0 {
            error!("Sectors per FAT shall not be zero");
            return Err(Error::CorruptFilesystem);
        }

        let Ok((info, _)) = ExtendedBootInfo::read_from_prefix(&sector0[info_offset..]) else {
            error!("Boot sector shorter than the extended boot info");
            return Err(Error::CorruptFilesystem);
        };
        let (volume_label, fs_type_label) = match info.ext_signature {
            EXT_SIGNATURE_FULL => (info.volume_label, info.fs_type),
            EXT_SIGNATURE_SHORT => (*b"NO NAME    ", *b"FAT16   "),
            signature => {
                warn!("Unknown extended boot signature {signature:#04X}");
                (info.volume_label, info.fs_type)
            }
        };

        let total_sectors = if bpb.total_sectors_16.get() != 0 {
            bpb.total_sectors_16.get() as u32
        } else {
            bpb.total_sectors_32.get()
        };
        if total_sectors > dev.sector_count() {
            error!(
                "Volume claims {total_sectors} sectors but the device has {}",
                dev.sector_count()
            );
            return Err(Error::CorruptFilesystem);
        }

        let reserved_sectors = bpb.reserved_sectors.get() as u32;
        let root_region_start = reserved_sectors + fat_count * sectors_per_fat;
        let root_region_sectors = if kind == FatType::Fat32 {
            0
        } else {
            (bpb.max_root_entries.get() as u32 * DIR_ENTRY_SIZE as u32)
                .div_ceil(bytes_per_sector)
        };
        let data_region_start = root_region_start + root_region_sectors;
        if data_region_start >= total_sectors {
            error!("Data region starts past the end of the volume");
            return Err(Error::CorruptFilesystem);
        }
        let cluster_count =
            ((total_sectors - data_region_start) / sectors_per_cluster).min(0x0FFF_FFF7);

        let fs_info_sector = match fs_info_sector {
            Some(sector) if sector != 0 && sector < total_sectors && bytes_per_sector >= 512 => {
                let raw = dev.read(sector, 1)?;
                let valid = FsInfoSector::read_from_prefix(&raw)
                    .is_ok_and(|(fs_info, _)| fs_info.signatures_valid());
                if !valid {
                    warn!("FS information sector signatures mismatch; free-space hints unavailable");
                }
                valid.then_some(sector)
            }
            Some(_) => {
                warn!("FS information sector unreadable; free-space hints unavailable");
                None
            }
            None => None,
        };

        let fat_bytes = dev.read(reserved_sectors, sectors_per_fat)?;
        if !options.bypass_coherency_check {
            for copy in 1..fat_count {
                let other = dev.read(reserved_sectors + copy * sectors_per_fat, sectors_per_fat)?;
                if other != fat_bytes {
                    error!("FAT copy {copy} differs from copy 0");
                    return Err(Error::CorruptFilesystem);
                }
            }
        }
        let entry_count = (cluster_count + 2).min(kind.entries_in(fat_bytes.len()));
        let table = FatTable::new(kind, bytes_per_sector as usize, entry_count, fat_bytes);
        let allocator = Allocator::new(&table)?;

        let root_first_cluster = if kind == FatType::Fat32 {
            if root_cluster < 2 || root_cluster >= entry_count {
                error!("Root cluster {root_cluster} outside the valid range");
                return Err(Error::CorruptFilesystem);
            }
            root_cluster as i64
        } else {
            FIXED_ROOT
        };

        let writable = dev.writable();
        let mut volume = Self {
            dev,
            writable,
            geom: Geometry {
                sector_size: bytes_per_sector,
                sectors_per_cluster,
                cluster_size: bytes_per_sector * sectors_per_cluster,
                reserved_sectors,
                fat_count,
                sectors_per_fat,
                root_region_start,
                root_region_sectors,
                data_region_start,
                cluster_count,
            },
            volume_label,
            fs_type_label,
            volume_serial: info.volume_serial.get(),
            fs_info_sector,
            table,
            allocator,
            tree: DirTree::new(root_first_cluster),
            altered_dirs: BTreeSet::new(),
        };
        volume.load_children(dir::ROOT)?;
        Ok(volume)
    }

    pub fn fat_type(&self) -> FatType {
        self.table.kind()
    }

    pub fn cluster_size(&self) -> u32 {
        self.geom.cluster_size
    }

    pub fn volume_label(&self) -> String {
        name::decode_short_name(&self.volume_label)
    }

    pub fn fs_type_label(&self) -> String {
        self.fs_type_label
            .iter()
            .map(|&byte| byte as char)
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    pub fn volume_serial(&self) -> u32 {
        self.volume_serial
    }

    /// The cycle-free cluster list of a chain; empty for `first == 0`.
    pub fn cluster_chain(&self, first: u32) -> Result<Vec<u32>> {
        self.table.chain(first)
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    /// Opens a file. `None` when the path does not resolve to a file.
    pub fn open(&mut self, path: &str, writable: bool) -> Result<Option<File<'_, D>>> {
        if writable && !self.writable {
            return Err(Error::ReadOnly);
        }
        let Some(Located::File { dir, slot }) = self.traverse(path)? else {
            return Ok(None);
        };
        let record = {
            let Some(children) = &self.tree.node(dir).children else {
                return Err(Error::InvalidState);
            };
            match &children[slot] {
                Child::File(entry) => entry.record,
                Child::Dir(_) => return Ok(None),
            }
        };
        let chain = self.content_chain(&record)?;
        Ok(Some(File {
            volume: self,
            dir,
            slot,
            chain,
            writable,
        }))
    }

    /// Creates an empty file and opens it for writing. `None` when the
    /// path already exists.
    pub fn create(&mut self, path: &str) -> Result<Option<File<'_, D>>> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let Some((dir, leaf)) = self.locate_parent(path)? else {
            return Err(Error::NotFound);
        };
        let short = name::encode_short_name(leaf)?;
        if self.find_entry(dir, leaf)?.is_some() {
            return Ok(None);
        }
        self.ensure_capacity(dir, 1)?;

        let record = DirEntryRecord::new(short, ATTR_ARCHIVE);
        let slot = {
            let Some(children) = self.tree.node_mut(dir).children.as_mut() else {
                return Err(Error::InvalidState);
            };
            children.push(Child::File(FileEntry {
                record,
                lfn_slots: 0,
            }));
            children.len() - 1
        };
        self.altered_dirs.insert(dir);

        let chain = Chain::new(Vec::new(), self.geom.cluster_size as usize, Some(0));
        Ok(Some(File {
            volume: self,
            dir,
            slot,
            chain,
            writable: true,
        }))
    }

    fn store(&mut self, allocate: bool) -> ClusterStore<'_, D> {
        ClusterStore {
            dev: &mut self.dev,
            geom: &self.geom,
            table: &mut self.table,
            allocator: if allocate {
                Some(&mut self.allocator)
            } else {
                None
            },
        }
    }

    /// The fixed FAT12/16 root cannot grow; inserts are refused once its
    /// region is full.
    fn ensure_capacity(&mut self, dir: DirId, additional: usize) -> Result<()> {
        if self.tree.node(dir).first_cluster != FIXED_ROOT {
            return Ok(());
        }
        let capacity = self.geom.root_region_sectors as usize * self.geom.sector_size as usize
            / DIR_ENTRY_SIZE;
        let Some(children) = &self.tree.node(dir).children else {
            return Err(Error::InvalidState);
        };
        if children.len() + additional > capacity {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Chain over a file body, read-capped at the recorded size.
    fn content_chain(&self, record: &DirEntryRecord) -> Result<Chain> {
        let links = self
            .table
            .chain(record.first_cluster())?
            .into_iter()
            .map(|cluster| Link {
                index: cluster as i64,
            })
            .collect();
        Ok(Chain::new(
            links,
            self.geom.cluster_size as usize,
            Some(record.size.get() as u64),
        ))
    }

    fn load_children(&mut self, id: DirId) -> Result<()> {
        if self.tree.node(id).children.is_some() {
            return Ok(());
        }
        let first_cluster = self.tree.node(id).first_cluster;

        let raw = if first_cluster == FIXED_ROOT {
            self.dev
                .read(self.geom.root_region_start, self.geom.root_region_sectors)?
        } else {
            let links = self
                .table
                .chain(first_cluster as u32)?
                .into_iter()
                .map(|cluster| Link {
                    index: cluster as i64,
                })
                .collect();
            let mut body = Chain::new(links, self.geom.cluster_size as usize, None);
            body.read_all(&mut self.store(false))?
        };

        let mut children = Vec::new();
        for (record, lfn_slots) in dir::parse_records(&raw, false) {
            if record.is_directory() && !record.is_dot() {
                let child = self.tree.push(DirNode {
                    first_cluster: record.first_cluster() as i64,
                    record: Some(record),
                    lfn_slots,
                    parent: Some(id),
                    children: None,
                });
                children.push(Child::Dir(child));
            } else {
                children.push(Child::File(FileEntry { record, lfn_slots }));
            }
        }
        self.tree.node_mut(id).children = Some(children);
        Ok(())
    }

    fn find_entry(&mut self, id: DirId, target: &str) -> Result<Option<usize>> {
        self.load_children(id)?;
        let Some(children) = &self.tree.node(id).children else {
            return Err(Error::InvalidState);
        };
        Ok(dir::find_child(&self.tree, children, target))
    }

    /// Resolves a path to the list of everything on it, root first. A
    /// non-terminal file segment resolves to nothing.
    fn traverse_entries(&mut self, path: &str) -> Result<Option<Vec<Located>>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut entries = vec![Located::Dir(dir::ROOT)];
        let mut current = dir::ROOT;
        for (index, segment) in segments.iter().enumerate() {
            let Some(slot) = self.find_entry(current, segment)? else {
                return Ok(None);
            };
            let Some(children) = &self.tree.node(current).children else {
                return Err(Error::InvalidState);
            };
            match children[slot] {
                Child::Dir(id) => {
                    entries.push(Located::Dir(id));
                    current = id;
                }
                Child::File(_) => {
                    if index + 1 != segments.len() {
                        return Ok(None);
                    }
                    entries.push(Located::File { dir: current, slot });
                }
            }
        }
        Ok(Some(entries))
    }

    fn traverse(&mut self, path: &str) -> Result<Option<Located>> {
        Ok(self
            .traverse_entries(path)?
            .and_then(|mut entries| entries.pop()))
    }

    /// Resolves everything but the last segment, yielding the would-be
    /// parent directory and the leaf name.
    fn locate_parent<'p>(&mut self, path: &'p str) -> Result<Option<(DirId, &'p str)>> {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some(leaf) = segments.pop() else {
            return Ok(None);
        };
        let mut current = dir::ROOT;
        for segment in segments {
            let Some(slot) = self.find_entry(current, segment)? else {
                return Ok(None);
            };
            let Some(children) = &self.tree.node(current).children else {
                return Err(Error::InvalidState);
            };
            match children[slot] {
                Child::Dir(id) => current = id,
                Child::File(_) => return Ok(None),
            }
        }
        Ok(Some((current, leaf)))
    }

    /// Zeroes a chain's FAT entries and returns its clusters to the
    /// freemap.
    fn free_chain(&mut self, first: u32) -> Result<()> {
        let clusters = self.table.chain(first)?;
        for &cluster in &clusters {
            self.table.set_entry(cluster, ENTRY_FREE)?;
        }
        self.allocator.mark_free(&clusters);
        Ok(())
    }

    /// Rewrites the chain starting at `old_first` to consist of exactly
    /// `new`: clusters leaving it are freed, clusters joining it are
    /// claimed, and the links are rewritten in order.
    fn redefine_chain(&mut self, old_first: u32, new: &[u32]) -> Result<()> {
        let old = self.table.chain(old_first)?;
        let old_set: HashSet<u32> = old.iter().copied().collect();
        let new_set: HashSet<u32> = new.iter().copied().collect();
        let freed: Vec<u32> = old
            .iter()
            .copied()
            .filter(|cluster| !new_set.contains(cluster))
            .collect();
        let claimed: Vec<u32> = new
            .iter()
            .copied()
            .filter(|cluster| !old_set.contains(cluster))
            .collect();

        for &cluster in &freed {
            self.table.set_entry(cluster, ENTRY_FREE)?;
        }
        for pair in new.windows(2) {
            self.table.set_entry(pair[0], pair[1])?;
        }
        if let Some(&tail) = new.last() {
            self.table.set_entry(tail, self.table.kind().end_of_chain())?;
        }
        self.allocator.mark_free(&freed);
        self.allocator.mark_allocated(&claimed);
        Ok(())
    }

    fn flush_fat(&mut self) -> Result<()> {
        if !self.table.altered() {
            return Ok(());
        }
        let geom = &self.geom;
        for copy in 0..geom.fat_count {
            let base = geom.reserved_sectors + copy * geom.sectors_per_fat;
            for &sector in self.table.altered_sectors() {
                let offset = sector as usize * geom.sector_size as usize;
                self.dev.write(
                    base + sector,
                    &self.table.bytes()[offset..offset + geom.sector_size as usize],
                )?;
            }
        }
        self.table.clear_altered();
        Ok(())
    }

    fn flush_fs_info(&mut self) -> Result<()> {
        let Some(sector) = self.fs_info_sector else {
            return Ok(());
        };
        let fs_info = FsInfoSector::with_hints(
            self.allocator.free_clusters(),
            self.allocator.next_free().unwrap_or(FS_INFO_UNKNOWN),
        );
        let mut raw = fs_info.as_bytes().to_vec();
        raw.resize(self.geom.sector_size as usize, 0);
        self.dev.write(sector, &raw)
    }

    fn flush_dir(&mut self, id: DirId) -> Result<()> {
        let (first_cluster, mut buffer) = {
            let node = self.tree.node(id);
            let Some(children) = &node.children else {
                return Ok(());
            };
            (node.first_cluster, dir::serialize(&self.tree, children))
        };

        if first_cluster == FIXED_ROOT {
            let region = self.geom.root_region_sectors as usize * self.geom.sector_size as usize;
            if buffer.len() > region {
                error!("Root directory overflows its fixed region");
                return Err(Error::NoSpace);
            }
            buffer.resize(region, 0);
            let mut body = Chain::new(vec![Link { index: FIXED_ROOT }], region, None);
            let mut store = FixedRootStore {
                dev: &mut self.dev,
                geom: &self.geom,
            };
            body.write(&mut store, &buffer)?;
            body.flush(&mut store)?;
        } else {
            let first = first_cluster as u32;
            let cluster_size = self.geom.cluster_size as usize;
            let keep = buffer.len().div_ceil(cluster_size).max(1);
            buffer.resize(keep * cluster_size, 0);

            let links = self
                .table
                .chain(first)?
                .into_iter()
                .map(|cluster| Link {
                    index: cluster as i64,
                })
                .collect();
            let mut body = Chain::new(links, cluster_size, None);
            let mut store = self.store(true);
            body.write(&mut store, &buffer)?;
            body.flush(&mut store)?;

            // trim allocation the rewritten body no longer needs
            let clusters: Vec<u32> = body
                .links()
                .iter()
                .map(|link| link.index as u32)
                .collect();
            if clusters.len() > keep {
                self.redefine_chain(first, &clusters[..keep])?;
            }
        }
        Ok(())
    }
}

/// A resolved path: a directory in the arena, or a file slot within one.
enum Located {
    Dir(DirId),
    File { dir: DirId, slot: usize },
}

impl<D: BlockDevice> FileSystem for FatVolume<D> {
    fn list_dir(&mut self, path: &str) -> Result<Option<Vec<String>>> {
        let Some(Located::Dir(id)) = self.traverse(path)? else {
            return Ok(None);
        };
        self.load_children(id)?;
        let Some(children) = &self.tree.node(id).children else {
            return Err(Error::InvalidState);
        };
        Ok(Some(dir::list_names(&self.tree, children)))
    }

    fn size_of(&mut self, path: &str) -> Result<Option<u64>> {
        Ok(match self.traverse(path)? {
            Some(Located::File { dir, slot }) => {
                let Some(children) = &self.tree.node(dir).children else {
                    return Err(Error::InvalidState);
                };
                match &children[slot] {
                    Child::File(entry) => Some(entry.record.size.get() as u64),
                    Child::Dir(_) => Some(0),
                }
            }
            Some(Located::Dir(_)) => Some(0),
            None => None,
        })
    }

    fn create(&mut self, path: &str) -> Result<bool> {
        Ok(FatVolume::create(self, path)?.is_some())
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        match self.traverse(path)?.ok_or(Error::NotFound)? {
            Located::File { dir, slot } => {
                let first = {
                    let Some(children) = &self.tree.node(dir).children else {
                        return Err(Error::InvalidState);
                    };
                    match &children[slot] {
                        Child::File(entry) => entry.record.first_cluster(),
                        Child::Dir(_) => return Err(Error::InvalidState),
                    }
                };
                if first != 0 {
                    self.free_chain(first)?;
                }
                let Some(children) = self.tree.node_mut(dir).children.as_mut() else {
                    return Err(Error::InvalidState);
                };
                children.remove(slot);
                self.altered_dirs.insert(dir);
            }
            Located::Dir(id) => {
                let Some(parent) = self.tree.node(id).parent else {
                    // the root itself
                    return Err(Error::InvalidArgument);
                };
                self.load_children(id)?;
                let occupied = {
                    let Some(children) = &self.tree.node(id).children else {
                        return Err(Error::InvalidState);
                    };
                    children.iter().any(|child| match child {
                        Child::Dir(_) => true,
                        Child::File(entry) => !entry.record.is_dot(),
                    })
                };
                if occupied {
                    return Err(Error::InvalidArgument);
                }
                let first = self.tree.node(id).first_cluster;
                if first >= 2 {
                    self.free_chain(first as u32)?;
                }
                let Some(children) = self.tree.node_mut(parent).children.as_mut() else {
                    return Err(Error::InvalidState);
                };
                let Some(slot) = dir::position_of_dir(children, id) else {
                    return Err(Error::InvalidState);
                };
                children.remove(slot);
                self.altered_dirs.insert(parent);
                self.altered_dirs.remove(&id);
            }
        }
        Ok(())
    }

    fn rename(&mut self, path: &str, new_path: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let source = self.traverse(path)?.ok_or(Error::NotFound)?;
        let Some((new_dir, leaf)) = self.locate_parent(new_path)? else {
            return Err(Error::NotFound);
        };
        let short = name::encode_short_name(leaf)?;
        if self.find_entry(new_dir, leaf)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let source_dir = match &source {
            Located::File { dir, .. } => Some(*dir),
            Located::Dir(id) => self.tree.node(*id).parent,
        };
        if source_dir != Some(new_dir) {
            self.ensure_capacity(new_dir, 1)?;
        }

        match source {
            Located::File { dir, slot } => {
                let Some(children) = self.tree.node_mut(dir).children.as_mut() else {
                    return Err(Error::InvalidState);
                };
                let Child::File(mut entry) = children.remove(slot) else {
                    return Err(Error::InvalidState);
                };
                entry.record.name = short;
                entry.lfn_slots = 0;
                let Some(children) = self.tree.node_mut(new_dir).children.as_mut() else {
                    return Err(Error::InvalidState);
                };
                children.push(Child::File(entry));
                self.altered_dirs.insert(dir);
                self.altered_dirs.insert(new_dir);
            }
            Located::Dir(id) => {
                let Some(old_parent) = self.tree.node(id).parent else {
                    return Err(Error::InvalidArgument);
                };
                // a directory cannot move under itself
                let mut walk = Some(new_dir);
                while let Some(current) = walk {
                    if current == id {
                        return Err(Error::InvalidArgument);
                    }
                    walk = self.tree.node(current).parent;
                }

                let Some(children) = self.tree.node_mut(old_parent).children.as_mut() else {
                    return Err(Error::InvalidState);
                };
                let Some(slot) = dir::position_of_dir(children, id) else {
                    return Err(Error::InvalidState);
                };
                children.remove(slot);

                {
                    let node = self.tree.node_mut(id);
                    if let Some(record) = node.record.as_mut() {
                        record.name = short;
                    }
                    node.lfn_slots = 0;
                    node.parent = Some(new_dir);
                }
                let Some(children) = self.tree.node_mut(new_dir).children.as_mut() else {
                    return Err(Error::InvalidState);
                };
                children.push(Child::Dir(id));

                // keep the moved directory's `..` pointing at its parent
                self.load_children(id)?;
                let dotdot_cluster = if new_dir == dir::ROOT {
                    0
                } else {
                    self.tree.node(new_dir).first_cluster as u32
                };
                if let Some(children) = self.tree.node_mut(id).children.as_mut() {
                    for child in children {
                        if let Child::File(entry) = child {
                            if entry.record.name == *b"..         " {
                                entry.record.set_first_cluster(dotdot_cluster);
                            }
                        }
                    }
                }
                self.altered_dirs.insert(old_parent);
                self.altered_dirs.insert(new_dir);
                self.altered_dirs.insert(id);
            }
        }
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let Some((parent, leaf)) = self.locate_parent(path)? else {
            return Err(Error::NotFound);
        };
        let short = name::encode_short_name(leaf)?;
        if self.find_entry(parent, leaf)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        self.ensure_capacity(parent, 1)?;

        let clusters =
            self.allocator
                .allocate(&mut self.table, None, 1, self.geom.cluster_size as u64)?;
        let Some(&first) = clusters.first() else {
            return Err(Error::NoSpace);
        };

        let mut record = DirEntryRecord::new(short, ATTR_DIRECTORY);
        record.set_first_cluster(first);
        let mut dot = DirEntryRecord::new(*b".          ", ATTR_DIRECTORY);
        dot.set_first_cluster(first);
        let mut dotdot = DirEntryRecord::new(*b"..         ", ATTR_DIRECTORY);
        let parent_first = self.tree.node(parent).first_cluster;
        dotdot.set_first_cluster(if parent == dir::ROOT {
            0
        } else {
            parent_first as u32
        });

        let id = self.tree.push(DirNode {
            first_cluster: first as i64,
            record: Some(record),
            lfn_slots: 0,
            parent: Some(parent),
            children: Some(vec![
                Child::File(FileEntry {
                    record: dot,
                    lfn_slots: 0,
                }),
                Child::File(FileEntry {
                    record: dotdot,
                    lfn_slots: 0,
                }),
            ]),
        });
        let Some(children) = self.tree.node_mut(parent).children.as_mut() else {
            return Err(Error::InvalidState);
        };
        children.push(Child::Dir(id));
        self.altered_dirs.insert(parent);
        self.altered_dirs.insert(id);
        Ok(())
    }

    fn stats(&mut self) -> Result<Stats> {
        let cluster_size = self.geom.cluster_size as u64;
        Ok(Stats {
            total_clusters: self.allocator.total_clusters(),
            free_clusters: self.allocator.free_clusters(),
            total_bytes: self.allocator.total_clusters() as u64 * cluster_size,
            free_bytes: self.allocator.free_clusters() as u64 * cluster_size,
        })
    }

    fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.flush_fat()?;
        while let Some(id) = self.altered_dirs.pop_first() {
            if let Err(error) = self.flush_dir(id) {
                self.altered_dirs.insert(id);
                return Err(error);
            }
        }
        // directory growth or trimming during phase 2 dirties the FAT again
        self.flush_fat()?;
        self.flush_fs_info()
    }
}

/// Open handle to one file. Borrows the volume, so volume-level
/// operations wait until it is dropped; drop flushes a best effort.
pub struct File<'v, D: BlockDevice> {
    volume: &'v mut FatVolume<D>,
    dir: DirId,
    slot: usize,
    chain: Chain,
    writable: bool,
}

impl<D: BlockDevice> File<'_, D> {
    pub fn size(&self) -> u64 {
        self.chain.total_length()
    }

    /// First cluster of the body, 0 while the file is empty.
    pub fn first_cluster(&self) -> u32 {
        self.chain
            .links()
            .first()
            .map_or(0, |link| link.index as u32)
    }

    pub fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        let mut store = self.volume.store(false);
        self.chain.seek(&mut store, from)
    }

    pub fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut store = self.volume.store(false);
        self.chain.read(&mut store, length)
    }

    /// Reads from the cursor to the end of the file.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut store = self.volume.store(false);
        self.chain.read_all(&mut store)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        {
            let mut store = self.volume.store(true);
            self.chain.write(&mut store, data)?;
        }
        self.update_entry();
        Ok(())
    }

    /// Writes the buffered tail of the body out. Metadata still reaches
    /// the disk only through the volume's flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let mut store = self.volume.store(false);
        self.chain.flush(&mut store)
    }

    fn update_entry(&mut self) {
        let first = self
            .chain
            .links()
            .first()
            .map_or(0, |link| link.index as u32);
        let size = self.chain.total_length();
        if let Some(children) = self.volume.tree.node_mut(self.dir).children.as_mut() {
            if let Some(Child::File(entry)) = children.get_mut(self.slot) {
                entry.record.set_first_cluster(first);
                entry.record.size.set(size as u32);
            }
        }
        self.volume.altered_dirs.insert(self.dir);
    }
}

impl<D: BlockDevice> Drop for File<'_, D> {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            error!("Dropping a file with an unflushed buffer: {error}");
        }
    }
}

struct ClusterStore<'a, D> {
    dev: &'a mut D,
    geom: &'a Geometry,
    table: &'a mut FatTable,
    allocator: Option<&'a mut Allocator>,
}

fn cluster_of(link: Link) -> Result<u32> {
    if link.index < 2 {
        return Err(Error::InvalidState);
    }
    Ok(link.index as u32)
}

fn cluster_first_sector(geom: &Geometry, cluster: u32) -> Result<u32> {
    if cluster < 2 || cluster - 2 >= geom.cluster_count {
        error!("Cluster {cluster} outside the data region");
        return Err(Error::CorruptFilesystem);
    }
    Ok(geom.data_region_start + (cluster - 2) * geom.sectors_per_cluster)
}

impl<D: BlockDevice> LinkStore for ClusterStore<'_, D> {
    fn read_link(&mut self, link: Link, buffer: &mut [u8]) -> Result<()> {
        let first = cluster_first_sector(self.geom, cluster_of(link)?)?;
        let data = self.dev.read(first, self.geom.sectors_per_cluster)?;
        buffer.copy_from_slice(&data);
        Ok(())
    }

    fn write_link(&mut self, link: Link, buffer: &[u8]) -> Result<()> {
        let first = cluster_first_sector(self.geom, cluster_of(link)?)?;
        self.dev.write(first, buffer)
    }

    fn grow(&mut self, last: Option<Link>, bytes: u64) -> Result<Vec<Link>> {
        let Some(allocator) = self.allocator.as_deref_mut() else {
            return Err(Error::NoSpace);
        };
        let last = match last {
            Some(link) => Some(cluster_of(link)?),
            None => None,
        };
        let clusters =
            allocator.allocate(self.table, last, bytes, self.geom.cluster_size as u64)?;
        Ok(clusters
            .into_iter()
            .map(|cluster| Link {
                index: cluster as i64,
            })
            .collect())
    }
}

/// Store for the FAT12/16 fixed root region: a single link covering the
/// whole region, written in place. Reads yield zeros so a rewrite starts
/// from a clean slate, and growth is impossible.
struct FixedRootStore<'a, D> {
    dev: &'a mut D,
    geom: &'a Geometry,
}

impl<D: BlockDevice> LinkStore for FixedRootStore<'_, D> {
    fn read_link(&mut self, _link: Link, buffer: &mut [u8]) -> Result<()> {
        buffer.fill(0);
        Ok(())
    }

    fn write_link(&mut self, _link: Link, buffer: &[u8]) -> Result<()> {
        self.dev.write(self.geom.root_region_start, buffer)
    }
}
