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

//! Hand-built volume images for the integration tests.

use pika_blk::RamDisk;
use pika_fs_fat::layout::{
    BiosParameterBlock, DirEntryRecord, ExtendedBootInfo, Fat32Extension, FsInfoSector,
    EXT_SIGNATURE_FULL,
};
use pika_fs_fat::FatType;
use zerocopy::{
    little_endian::{U16, U32},
    FromZeros, IntoBytes,
};

pub const SECTOR: usize = 512;

pub struct TestImage {
    pub kind: FatType,
    pub data: Vec<u8>,
    pub fat_start: usize,
    pub fat_bytes: usize,
    pub fat_count: usize,
    pub root_start: usize,
    pub data_start: usize,
    pub cluster_size: usize,
}

impl TestImage {
    /// Writes a FAT entry into every redundant copy.
    pub fn fat(&mut self, cluster: u32, value: u32) {
        for copy in 0..self.fat_count {
            let base = self.fat_start + copy * self.fat_bytes;
            match self.kind {
                FatType::Fat12 => {
                    let offset = base + cluster as usize / 2 * 3;
                    let mut group = self.data[offset] as u32
                        | (self.data[offset + 1] as u32) << 8
                        | (self.data[offset + 2] as u32) << 16;
                    if cluster & 1 == 1 {
                        group = group & 0x000FFF | (value & 0xFFF) << 12;
                    } else {
                        group = group & 0xFFF000 | value & 0xFFF;
                    }
                    self.data[offset] = group as u8;
                    self.data[offset + 1] = (group >> 8) as u8;
                    self.data[offset + 2] = (group >> 16) as u8;
                }
                FatType::Fat16 => {
                    let offset = base + cluster as usize * 2;
                    self.data[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
                }
                FatType::Fat32 => {
                    let offset = base + cluster as usize * 4;
                    self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }

    /// Places a record into the root directory.
    pub fn root_entry(&mut self, index: usize, record: &DirEntryRecord) {
        let offset = self.root_start + index * 32;
        self.data[offset..offset + 32].copy_from_slice(record.as_bytes());
    }

    pub fn cluster_offset(&self, cluster: u32) -> usize {
        self.data_start + (cluster as usize - 2) * self.cluster_size
    }

    pub fn cluster_data(&mut self, cluster: u32, content: &[u8]) {
        let offset = self.cluster_offset(cluster);
        self.data[offset..offset + content.len()].copy_from_slice(content);
    }

    pub fn ram_disk(self) -> RamDisk {
        RamDisk::from_vec(SECTOR as u32, self.data).unwrap()
    }
}

pub fn file_record(name: &[u8; 11], first_cluster: u32, size: u32) -> DirEntryRecord {
    let mut record = DirEntryRecord::new(*name, 0x20);
    record.set_first_cluster(first_cluster);
    record.size = U32::new(size);
    record
}

fn extended_info(fs_type: &[u8; 8]) -> ExtendedBootInfo {
    let mut info = ExtendedBootInfo::new_zeroed();
    info.drive_number = 0x80;
    info.ext_signature = EXT_SIGNATURE_FULL;
    info.volume_serial = U32::new(0x1234_5678);
    info.volume_label = *b"PIKA VOL   ";
    info.fs_type = *fs_type;
    info
}

/// FAT16: 512-byte sectors, 1 sector per cluster, 2 FATs of 16 sectors,
/// 512 root entries.
pub fn fat16(total_sectors: u32) -> TestImage {
    let mut data = vec![0; total_sectors as usize * SECTOR];

    let mut bpb = BiosParameterBlock::new_zeroed();
    bpb.jump = [0xEB, 0x3C, 0x90];
    bpb.oem_name = *b"PIKA    ";
    bpb.bytes_per_sector = U16::new(512);
    bpb.sectors_per_cluster = 1;
    bpb.reserved_sectors = U16::new(1);
    bpb.fat_count = 2;
    bpb.max_root_entries = U16::new(512);
    bpb.total_sectors_16 = U16::new(total_sectors as u16);
    bpb.media = 0xF8;
    bpb.sectors_per_fat_16 = U16::new(16);
    data[..36].copy_from_slice(bpb.as_bytes());
    data[36..62].copy_from_slice(extended_info(b"FAT16   ").as_bytes());
    data[510] = 0x55;
    data[511] = 0xAA;

    let mut image = TestImage {
        kind: FatType::Fat16,
        data,
        fat_start: SECTOR,
        fat_bytes: 16 * SECTOR,
        fat_count: 2,
        root_start: 33 * SECTOR,
        data_start: (33 + 32) * SECTOR,
        cluster_size: SECTOR,
    };
    image.fat(0, 0xFFF8);
    image.fat(1, 0xFFFF);
    image
}

/// FAT12: 512-byte sectors, 1 sector per cluster, 2 FATs of 2 sectors,
/// 224 root entries. Mount with the FAT12 override.
pub fn fat12(total_sectors: u32) -> TestImage {
    let mut data = vec![0; total_sectors as usize * SECTOR];

    let mut bpb = BiosParameterBlock::new_zeroed();
    bpb.jump = [0xEB, 0x3C, 0x90];
    bpb.oem_name = *b"PIKA    ";
    bpb.bytes_per_sector = U16::new(512);
    bpb.sectors_per_cluster = 1;
    bpb.reserved_sectors = U16::new(1);
    bpb.fat_count = 2;
    bpb.max_root_entries = U16::new(224);
    bpb.total_sectors_16 = U16::new(total_sectors as u16);
    bpb.media = 0xF0;
    bpb.sectors_per_fat_16 = U16::new(2);
    data[..36].copy_from_slice(bpb.as_bytes());
    data[36..62].copy_from_slice(extended_info(b"FAT12   ").as_bytes());
    data[510] = 0x55;
    data[511] = 0xAA;

    let mut image = TestImage {
        kind: FatType::Fat12,
        data,
        fat_start: SECTOR,
        fat_bytes: 2 * SECTOR,
        fat_count: 2,
        root_start: 5 * SECTOR,
        data_start: (5 + 14) * SECTOR,
        cluster_size: SECTOR,
    };
    image.fat(0, 0xFF0);
    image.fat(1, 0xFFF);
    image
}

/// FAT32: 512-byte sectors, 2 sectors per cluster, 2 FATs of 8 sectors,
/// root chain at cluster 2, FS information sector at 1.
pub fn fat32(total_sectors: u32) -> TestImage {
    let mut data = vec![0; total_sectors as usize * SECTOR];

    let mut bpb = BiosParameterBlock::new_zeroed();
    bpb.jump = [0xEB, 0x58, 0x90];
    bpb.oem_name = *b"PIKA    ";
    bpb.bytes_per_sector = U16::new(512);
    bpb.sectors_per_cluster = 2;
    bpb.reserved_sectors = U16::new(4);
    bpb.fat_count = 2;
    bpb.media = 0xF8;
    bpb.total_sectors_32 = U32::new(total_sectors);
    data[..36].copy_from_slice(bpb.as_bytes());

    let mut extension = Fat32Extension::new_zeroed();
    extension.sectors_per_fat_32 = U32::new(8);
    extension.root_cluster = U32::new(2);
    extension.fs_info_sector = U16::new(1);
    data[36..64].copy_from_slice(extension.as_bytes());
    data[64..90].copy_from_slice(extended_info(b"FAT32   ").as_bytes());
    data[510] = 0x55;
    data[511] = 0xAA;

    let fs_info = FsInfoSector::with_hints(0xFFFF_FFFF, 0xFFFF_FFFF);
    data[SECTOR..SECTOR + 512].copy_from_slice(fs_info.as_bytes());

    let mut image = TestImage {
        kind: FatType::Fat32,
        data,
        fat_start: 4 * SECTOR,
        fat_bytes: 8 * SECTOR,
        fat_count: 2,
        root_start: (4 + 16) * SECTOR,
        data_start: (4 + 16) * SECTOR,
        cluster_size: 2 * SECTOR,
    };
    image.fat(0, 0x0FFF_FFF8);
    image.fat(1, 0x0FFF_FFFF);
    image.fat(2, 0x0FFF_FFFF); // root directory
    image
}
