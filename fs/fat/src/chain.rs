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

//! A byte cursor over a sequence of equally-sized links. Writes are
//! coalesced into a single pending link-sized buffer and only hit the
//! store when the cursor leaves the link, on an explicit flush, or before
//! a read; bytes the caller never touched are overlaid from the original
//! link content first. Growing past the last link is delegated to the
//! store, which may refuse.

use std::io::SeekFrom;

use pika_err::{Error, Result};

/// One element of a chain. For cluster-backed chains the index is the
/// cluster number; `FIXED_ROOT` stands for the FAT12/16 root region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub index: i64,
}

pub const FIXED_ROOT: i64 = -1;

/// Storage capability a chain operates through. Passed per call so the
/// chain itself stays plain data and never holds a volume borrow.
pub trait LinkStore {
    fn read_link(&mut self, link: Link, buffer: &mut [u8]) -> Result<()>;

    fn write_link(&mut self, link: Link, buffer: &[u8]) -> Result<()>;

    /// Provides links covering at least `bytes` more, chained after
    /// `last`. Stores without an allocator refuse.
    fn grow(&mut self, last: Option<Link>, bytes: u64) -> Result<Vec<Link>> {
        let _ = (last, bytes);
        Err(Error::NoSpace)
    }
}

struct Pending {
    link: usize,
    buffer: Vec<u8>,
    fresh: Vec<bool>,
}

pub struct Chain {
    links: Vec<Link>,
    link_length: usize,
    limit: Option<u64>,
    position: u64,
    pending: Option<Pending>,
}

impl Chain {
    /// `limit` caps reads for content shorter than its allocation (a file
    /// whose size is not a whole number of clusters); without it the
    /// chain's byte length is the allocation itself.
    pub fn new(links: Vec<Link>, link_length: usize, limit: Option<u64>) -> Self {
        Self {
            links,
            link_length,
            limit,
            position: 0,
            pending: None,
        }
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Allocated length in bytes.
    pub fn length(&self) -> u64 {
        self.links.len() as u64 * self.link_length as u64
    }

    /// Content length in bytes; never shrinks, grows as writes pass it.
    pub fn total_length(&self) -> u64 {
        self.limit.unwrap_or_else(|| self.length())
    }

    pub fn seek(&mut self, store: &mut dyn LinkStore, from: SeekFrom) -> Result<u64> {
        self.flush(store)?;
        let position = match from {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.total_length().checked_add_signed(delta),
        };
        let Some(position) = position else {
            return Err(Error::InvalidArgument);
        };
        self.position = position;
        Ok(position)
    }

    pub fn read(&mut self, store: &mut dyn LinkStore, length: usize) -> Result<Vec<u8>> {
        self.flush(store)?;
        let end = self.total_length().min(self.length());
        if self.position >= end {
            return Ok(Vec::new());
        }
        let length = (length as u64).min(end - self.position) as usize;

        let mut out = Vec::with_capacity(length);
        let mut scratch = vec![0; self.link_length];
        while out.len() < length {
            let link = (self.position / self.link_length as u64) as usize;
            let offset = (self.position % self.link_length as u64) as usize;
            let take = (self.link_length - offset).min(length - out.len());
            store.read_link(self.links[link], &mut scratch)?;
            out.extend_from_slice(&scratch[offset..offset + take]);
            self.position += take as u64;
        }
        Ok(out)
    }

    /// Reads from the cursor to the end of the content.
    pub fn read_all(&mut self, store: &mut dyn LinkStore) -> Result<Vec<u8>> {
        let end = self.total_length().min(self.length());
        let remaining = end.saturating_sub(self.position) as usize;
        self.read(store, remaining)
    }

    pub fn write(&mut self, store: &mut dyn LinkStore, data: &[u8]) -> Result<()> {
        let mut data = data;
        while !data.is_empty() {
            if self.position >= self.length() {
                let needed = self.position - self.length() + data.len() as u64;
                let grown = store.grow(self.links.last().copied(), needed)?;
                if grown.is_empty() {
                    return Err(Error::NoSpace);
                }
                self.links.extend(grown);
                continue;
            }

            let link = (self.position / self.link_length as u64) as usize;
            let offset = (self.position % self.link_length as u64) as usize;
            match &self.pending {
                Some(pending) if pending.link == link => {}
                Some(_) => self.flush_pending(store)?,
                None => {}
            }
            let link_length = self.link_length;
            let pending = self.pending.get_or_insert_with(|| Pending {
                link,
                buffer: vec![0; link_length],
                fresh: vec![false; link_length],
            });

            let take = (self.link_length - offset).min(data.len());
            pending.buffer[offset..offset + take].copy_from_slice(&data[..take]);
            pending.fresh[offset..offset + take].fill(true);
            self.position += take as u64;
            data = &data[take..];
        }

        if let Some(limit) = self.limit {
            self.limit = Some(limit.max(self.position));
        }
        Ok(())
    }

    /// Writes the pending buffer out, overlaying untouched bytes from the
    /// original link content first.
    pub fn flush(&mut self, store: &mut dyn LinkStore) -> Result<()> {
        self.flush_pending(store)
    }

    fn flush_pending(&mut self, store: &mut dyn LinkStore) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let Some(&link) = self.links.get(pending.link) else {
            return Err(Error::InvalidState);
        };

        let mut buffer = pending.buffer;
        if pending.fresh.contains(&false) {
            let mut original = vec![0; self.link_length];
            store.read_link(link, &mut original)?;
            for (index, fresh) in pending.fresh.iter().enumerate() {
                if !fresh {
                    buffer[index] = original[index];
                }
            }
        }
        store.write_link(link, &buffer)
    }
}
