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

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use pika_blk::{check_range, BlockDevice};
use pika_err::{Error, Result};

const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Block device backed by a regular file, typically a filesystem image.
pub struct FileDisk {
    file: File,
    sector_size: u32,
    sector_count: u32,
    writable: bool,
}

impl FileDisk {
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        Self::open_with_sector_size(path, writable, DEFAULT_SECTOR_SIZE)
    }

    /// Opens with a non-standard sector size. Trailing bytes that do not
    /// fill a whole sector are not addressable.
    pub fn open_with_sector_size(
        path: impl AsRef<Path>,
        writable: bool,
        sector_size: u32,
    ) -> Result<Self> {
        if sector_size < 128 || !sector_size.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let sector_count = (file.metadata()?.len() / sector_size as u64) as u32;
        Ok(Self {
            file,
            sector_size,
            sector_count,
            writable,
        })
    }
}

impl BlockDevice for FileDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read(&mut self, first: u32, count: u32) -> Result<Vec<u8>> {
        check_range(self.sector_count, first, count)?;
        let mut buffer = vec![0; count as usize * self.sector_size as usize];
        self.file
            .read_exact_at(&mut buffer, first as u64 * self.sector_size as u64)?;
        Ok(buffer)
    }

    fn write(&mut self, first: u32, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if data.len() % self.sector_size as usize != 0 {
            return Err(Error::InvalidArgument);
        }
        check_range(
            self.sector_count,
            first,
            (data.len() / self.sector_size as usize) as u32,
        )?;
        self.file
            .write_all_at(data, first as u64 * self.sector_size as u64)?;
        Ok(())
    }
}
