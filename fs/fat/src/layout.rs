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

//! On-disk structures shared by all three FAT variants. Everything is
//! little-endian and packed; records are decoded with `read_from_prefix`
//! and re-encoded with `as_bytes` where the driver writes them back.

use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
};

pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
/// Read-only | hidden | system | volume-id marks a long-file-name slot.
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// First name byte of the record that terminates a directory.
pub const ENTRY_END: u8 = 0x00;
/// First name byte of a deleted record.
pub const ENTRY_DELETED: u8 = 0xE5;

/// Extended boot signature announcing that only the serial number is valid.
pub const EXT_SIGNATURE_SHORT: u8 = 0x28;
/// Extended boot signature announcing serial, label and type fields.
pub const EXT_SIGNATURE_FULL: u8 = 0x29;

/// Byte offset of the FAT32 extension within the boot sector.
pub const FAT32_EXTENSION_OFFSET: usize = 0x24;
/// Byte offset of the extended boot info on FAT12/16 volumes.
pub const EXTENDED_INFO_OFFSET_FAT16: usize = 0x24;
/// Byte offset of the extended boot info on FAT32 volumes, past the
/// FAT32 extension.
pub const EXTENDED_INFO_OFFSET_FAT32: usize = 0x40;

/// DOS 3.31 BIOS parameter block, boot-sector bytes 0..36.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BiosParameterBlock {
    /// x86 jump to the boot code; not interpreted.
    pub jump: [u8; 3],
    /// Name of the system that formatted the volume.
    pub oem_name: [u8; 8],
    /// Bytes per sector. Must match the underlying device and be a
    /// multiple of 128.
    pub bytes_per_sector: U16,
    /// Sectors per allocation unit, a power of two.
    pub sectors_per_cluster: u8,
    /// Sectors preceding the first FAT, including this boot sector.
    pub reserved_sectors: U16,
    /// Number of redundant FAT copies, typically 2.
    pub fat_count: u8,
    /// Capacity of the fixed root directory in 32-byte entries. Zero on
    /// FAT32, whose root directory is an ordinary cluster chain.
    pub max_root_entries: U16,
    /// Total sector count if it fits 16 bits, else zero and
    /// `total_sectors_32` holds it.
    pub total_sectors_16: U16,
    /// Media descriptor; not interpreted.
    pub media: u8,
    /// Sectors per FAT copy. Zero on FAT32, which moved the field into
    /// its boot-sector extension.
    pub sectors_per_fat_16: U16,
    pub sectors_per_track: U16,
    pub heads: U16,
    /// Sectors preceding this volume on partitioned media.
    pub hidden_sectors: U32,
    pub total_sectors_32: U32,
}

/// FAT32 addition to the parameter block, boot-sector bytes 36..64.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Fat32Extension {
    pub sectors_per_fat_32: U32,
    /// Bit 7 disables FAT mirroring; bits 0-3 then select the active copy.
    pub ext_flags: U16,
    pub fs_version: U16,
    /// First cluster of the root directory, usually 2.
    pub root_cluster: U32,
    /// Sector number of the FS information sector, usually 1.
    pub fs_info_sector: U16,
    /// Sector number of the boot-sector backup, 0 when absent.
    pub backup_boot_sector: U16,
    pub reserved: [u8; 12],
}

/// Extended boot info: at offset 36 on FAT12/16 and 64 on FAT32.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExtendedBootInfo {
    pub drive_number: u8,
    pub reserved: u8,
    /// `EXT_SIGNATURE_SHORT` or `EXT_SIGNATURE_FULL`; anything else means
    /// the following fields are unreliable.
    pub ext_signature: u8,
    pub volume_serial: U32,
    /// Space-padded volume label, `"NO NAME    "` when unset.
    pub volume_label: [u8; 11],
    /// Informational filesystem name, e.g. `"FAT16   "`. Does not
    /// determine the FAT type.
    pub fs_type: [u8; 8],
}

pub const FS_INFO_LEAD_SIGNATURE: [u8; 4] = *b"RRaA";
pub const FS_INFO_STRUCT_SIGNATURE: [u8; 4] = *b"rrAa";
pub const FS_INFO_TRAIL_SIGNATURE: [u8; 4] = [0x00, 0x00, 0x55, 0xAA];

/// Value of the FS information hints when they are unknown.
pub const FS_INFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// FAT32 FS information sector. Carries advisory free-space hints between
/// mounts; a driver must tolerate stale or missing values.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FsInfoSector {
    pub lead_signature: [u8; 4],
    pub reserved1: [u8; 480],
    pub struct_signature: [u8; 4],
    /// Count of free clusters, or `FS_INFO_UNKNOWN`.
    pub free_count: U32,
    /// Cluster number at which to start searching for free clusters, or
    /// `FS_INFO_UNKNOWN`.
    pub next_free: U32,
    pub reserved2: [u8; 12],
    pub trail_signature: [u8; 4],
}

impl FsInfoSector {
    pub fn signatures_valid(&self) -> bool {
        self.lead_signature == FS_INFO_LEAD_SIGNATURE
            && self.struct_signature == FS_INFO_STRUCT_SIGNATURE
            && self.trail_signature == FS_INFO_TRAIL_SIGNATURE
    }

    pub fn with_hints(free_count: u32, next_free: u32) -> Self {
        Self {
            lead_signature: FS_INFO_LEAD_SIGNATURE,
            reserved1: [0; 480],
            struct_signature: FS_INFO_STRUCT_SIGNATURE,
            free_count: U32::new(free_count),
            next_free: U32::new(next_free),
            reserved2: [0; 12],
            trail_signature: FS_INFO_TRAIL_SIGNATURE,
        }
    }
}

/// One 32-byte directory record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DirEntryRecord {
    /// Space-padded 8.3 name; the first byte doubles as the end/deleted
    /// marker (`ENTRY_END`, `ENTRY_DELETED`).
    pub name: [u8; 11],
    pub attributes: u8,
    pub reserved: u8,
    pub created_tenths: u8,
    pub created_time: U16,
    pub created_date: U16,
    pub accessed_date: U16,
    /// High half of the first cluster number; zero on FAT12/16.
    pub first_cluster_high: U16,
    pub modified_time: U16,
    pub modified_date: U16,
    pub first_cluster_low: U16,
    /// File size in bytes; zero for directories.
    pub size: U32,
}

impl DirEntryRecord {
    pub fn new(name: [u8; 11], attributes: u8) -> Self {
        let mut record = Self::new_zeroed();
        record.name = name;
        record.attributes = attributes;
        record
    }

    pub fn first_cluster(&self) -> u32 {
        (self.first_cluster_high.get() as u32) << 16 | self.first_cluster_low.get() as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_high.set((cluster >> 16) as u16);
        self.first_cluster_low.set(cluster as u16);
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes & ATTR_VOLUME_ID != 0
    }

    pub fn is_long_name(&self) -> bool {
        self.attributes == ATTR_LONG_NAME
    }

    /// `.` and `..` are plain records with the directory attribute; they
    /// are kept verbatim and never descended into.
    pub fn is_dot(&self) -> bool {
        self.name[0] == b'.'
    }
}
