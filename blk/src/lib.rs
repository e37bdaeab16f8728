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

use std::collections::BTreeMap;

use log::error;
use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub use pika_err::{Error, Result};

/// Sector-granular storage.
///
/// A device exposes `sector_count` sectors of `sector_size` bytes each.
/// Whether the device accepts writes is fixed for its lifetime and reported
/// by `writable`, so a consumer can decide once, at mount time, instead of
/// probing every mutation.
pub trait BlockDevice {
    /// Sector size in bytes. Power of two, at least 128.
    fn sector_size(&self) -> u32;

    /// Total number of sectors.
    fn sector_count(&self) -> u32;

    /// Whether `write` is expected to succeed at all.
    fn writable(&self) -> bool;

    /// Read `count` sectors starting at `first`. The result is exactly
    /// `count * sector_size` bytes.
    fn read(&mut self, first: u32, count: u32) -> Result<Vec<u8>>;

    /// Write whole sectors starting at `first`. `data.len()` must be a
    /// multiple of the sector size.
    fn write(&mut self, first: u32, data: &[u8]) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn sector_count(&self) -> u32 {
        (**self).sector_count()
    }

    fn writable(&self) -> bool {
        (**self).writable()
    }

    fn read(&mut self, first: u32, count: u32) -> Result<Vec<u8>> {
        (**self).read(first, count)
    }

    fn write(&mut self, first: u32, data: &[u8]) -> Result<()> {
        (**self).write(first, data)
    }
}

impl BlockDevice for Box<dyn BlockDevice> {
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn sector_count(&self) -> u32 {
        (**self).sector_count()
    }

    fn writable(&self) -> bool {
        (**self).writable()
    }

    fn read(&mut self, first: u32, count: u32) -> Result<Vec<u8>> {
        (**self).read(first, count)
    }

    fn write(&mut self, first: u32, data: &[u8]) -> Result<()> {
        (**self).write(first, data)
    }
}

/// Validates a sector range against a device's geometry. Requests reaching
/// past the last sector indicate a structure describing more storage than
/// the device has, which is corruption, not a caller bug.
pub fn check_range(sector_count: u32, first: u32, count: u32) -> Result<()> {
    match first.checked_add(count) {
        Some(end) if end <= sector_count => Ok(()),
        _ => {
            error!("Sector range {first}+{count} reaches past the device end ({sector_count})");
            Err(Error::CorruptFilesystem)
        }
    }
}

fn check_write(sector_size: u32, data: &[u8]) -> Result<u32> {
    if data.len() % sector_size as usize != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok((data.len() / sector_size as usize) as u32)
}

/// Memory-backed device.
pub struct RamDisk {
    sector_size: u32,
    data: Vec<u8>,
    writable: bool,
}

impl RamDisk {
    pub fn new(sector_size: u32, sector_count: u32) -> Self {
        Self {
            sector_size,
            data: vec![0; sector_size as usize * sector_count as usize],
            writable: true,
        }
    }

    /// Wraps an existing image. The buffer length must be a multiple of the
    /// sector size.
    pub fn from_vec(sector_size: u32, data: Vec<u8>) -> Result<Self> {
        if sector_size == 0 || data.len() % sector_size as usize != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            sector_size,
            data,
            writable: true,
        })
    }

    /// Turns the disk into one that refuses every write.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for RamDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        (self.data.len() / self.sector_size as usize) as u32
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read(&mut self, first: u32, count: u32) -> Result<Vec<u8>> {
        check_range(self.sector_count(), first, count)?;
        let offset = first as usize * self.sector_size as usize;
        let length = count as usize * self.sector_size as usize;
        Ok(self.data[offset..offset + length].to_vec())
    }

    fn write(&mut self, first: u32, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let count = check_write(self.sector_size, data)?;
        check_range(self.sector_count(), first, count)?;
        let offset = first as usize * self.sector_size as usize;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// One of the four 16-byte records of the MBR partition table, located at
/// byte `0x01BE + 0x10 * n` of sector 0.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct MbrPartitionRecord {
    /// 0x80 marks the bootable partition; anything else is non-bootable.
    status: u8,
    /// Legacy cylinder/head/sector address of the first sector; superseded
    /// by the LBA fields and ignored here.
    chs_first: [u8; 3],
    /// Partition type tag.
    kind: u8,
    /// Legacy cylinder/head/sector address of the last sector.
    chs_last: [u8; 3],
    /// LBA of the first sector of the partition.
    first_lba: U32,
    /// Number of sectors in the partition.
    sector_count: U32,
}

const MBR_PARTITION_TABLE_OFFSET: usize = 0x01BE;
const MBR_SIGNATURE_OFFSET: usize = 0x01FE;

/// Window over a contiguous sector range of an inner device.
pub struct Partition<D> {
    inner: D,
    first: u32,
    count: u32,
}

impl<D: BlockDevice> Partition<D> {
    /// A window over sectors `[first, first + count)`.
    pub fn new(inner: D, first: u32, count: u32) -> Result<Self> {
        check_range(inner.sector_count(), first, count)?;
        Ok(Self {
            inner,
            first,
            count,
        })
    }

    /// A window over partition `index` of an MBR-partitioned device. Fails
    /// with `NotFound` when the table slot is empty.
    pub fn from_mbr(mut inner: D, index: usize) -> Result<Self> {
        if index >= 4 {
            return Err(Error::InvalidArgument);
        }
        let sector_size = inner.sector_size() as usize;
        let sectors = 512usize.div_ceil(sector_size) as u32;
        let sector0 = inner.read(0, sectors)?;
        if sector0[MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2] != [0x55, 0xAA] {
            error!("Master boot record signature missing");
            return Err(Error::CorruptFilesystem);
        }
        let offset = MBR_PARTITION_TABLE_OFFSET + index * size_of::<MbrPartitionRecord>();
        let (record, _) = MbrPartitionRecord::read_from_prefix(&sector0[offset..])
            .map_err(|_| Error::CorruptFilesystem)?;
        if record.sector_count.get() == 0 {
            return Err(Error::NotFound);
        }
        Self::new(inner, record.first_lba.get(), record.sector_count.get())
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: BlockDevice> BlockDevice for Partition<D> {
    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn sector_count(&self) -> u32 {
        self.count
    }

    fn writable(&self) -> bool {
        self.inner.writable()
    }

    fn read(&mut self, first: u32, count: u32) -> Result<Vec<u8>> {
        check_range(self.count, first, count)?;
        self.inner.read(self.first + first, count)
    }

    fn write(&mut self, first: u32, data: &[u8]) -> Result<()> {
        let count = check_write(self.sector_size(), data)?;
        check_range(self.count, first, count)?;
        self.inner.write(self.first + first, data)
    }
}

/// Splits oversized requests into chunks of at most `max_sectors`, for
/// devices with a bounded transfer size.
pub struct Chunked<D> {
    inner: D,
    max_sectors: u32,
}

impl<D: BlockDevice> Chunked<D> {
    pub fn new(inner: D, max_sectors: u32) -> Result<Self> {
        if max_sectors == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self { inner, max_sectors })
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: BlockDevice> BlockDevice for Chunked<D> {
    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn sector_count(&self) -> u32 {
        self.inner.sector_count()
    }

    fn writable(&self) -> bool {
        self.inner.writable()
    }

    fn read(&mut self, first: u32, count: u32) -> Result<Vec<u8>> {
        check_range(self.sector_count(), first, count)?;
        let mut out = Vec::with_capacity(count as usize * self.sector_size() as usize);
        let mut done = 0;
        while done < count {
            let take = self.max_sectors.min(count - done);
            out.extend_from_slice(&self.inner.read(first + done, take)?);
            done += take;
        }
        Ok(out)
    }

    fn write(&mut self, first: u32, data: &[u8]) -> Result<()> {
        let sector_size = self.sector_size() as usize;
        let count = check_write(self.sector_size(), data)?;
        check_range(self.sector_count(), first, count)?;
        let mut done = 0;
        while done < count {
            let take = self.max_sectors.min(count - done);
            let offset = done as usize * sector_size;
            self.inner
                .write(first + done, &data[offset..offset + take as usize * sector_size])?;
            done += take;
        }
        Ok(())
    }
}

/// Copy-on-write view: writes land in an in-memory delta map and shadow the
/// base on subsequent reads, so a read-only base can be mutated for a dry
/// run and the deltas inspected afterwards.
pub struct Overlay<D> {
    inner: D,
    deltas: BTreeMap<u32, Vec<u8>>,
}

impl<D: BlockDevice> Overlay<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            deltas: BTreeMap::new(),
        }
    }

    /// The captured writes, keyed by sector.
    pub fn deltas(&self) -> &BTreeMap<u32, Vec<u8>> {
        &self.deltas
    }

    pub fn into_deltas(self) -> BTreeMap<u32, Vec<u8>> {
        self.deltas
    }
}

impl<D: BlockDevice> BlockDevice for Overlay<D> {
    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn sector_count(&self) -> u32 {
        self.inner.sector_count()
    }

    fn writable(&self) -> bool {
        true
    }

    fn read(&mut self, first: u32, count: u32) -> Result<Vec<u8>> {
        let sector_size = self.sector_size() as usize;
        let mut out = self.inner.read(first, count)?;
        for sector in first..first + count {
            if let Some(delta) = self.deltas.get(&sector) {
                let offset = (sector - first) as usize * sector_size;
                out[offset..offset + sector_size].copy_from_slice(delta);
            }
        }
        Ok(out)
    }

    fn write(&mut self, first: u32, data: &[u8]) -> Result<()> {
        let sector_size = self.sector_size() as usize;
        let count = check_write(self.sector_size(), data)?;
        check_range(self.sector_count(), first, count)?;
        for (index, chunk) in data.chunks_exact(sector_size).enumerate() {
            self.deltas.insert(first + index as u32, chunk.to_vec());
        }
        Ok(())
    }
}
