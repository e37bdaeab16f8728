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

//! Cluster allocation. The freemap mirrors the FAT (true exactly where the
//! entry is free); the freelist is its run-length encoding, recomputed
//! after every change and consulted for locality-aware placement.

use pika_err::{Error, Result};

use crate::table::{FatTable, ENTRY_FREE};

/// A maximal run of free clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: u32,
    pub length: u32,
}

pub struct Allocator {
    freemap: Vec<bool>,
    freelist: Vec<Run>,
}

impl Allocator {
    /// Derives the freemap from the FAT. Clusters 0 and 1 are reserved and
    /// never free.
    pub fn new(table: &FatTable) -> Result<Self> {
        let mut freemap = vec![false; table.entry_count() as usize];
        for cluster in 2..table.entry_count() {
            freemap[cluster as usize] = table.entry(cluster)? == ENTRY_FREE;
        }
        let mut allocator = Self {
            freemap,
            freelist: Vec::new(),
        };
        allocator.rebuild_freelist();
        Ok(allocator)
    }

    pub fn total_clusters(&self) -> u32 {
        self.freemap.len().saturating_sub(2) as u32
    }

    pub fn free_clusters(&self) -> u32 {
        self.freelist.iter().map(|run| run.length).sum()
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        self.freemap.get(cluster as usize).copied().unwrap_or(false)
    }

    /// First free cluster, for the FAT32 FS information hint.
    pub fn next_free(&self) -> Option<u32> {
        self.freelist.first().map(|run| run.start)
    }

    pub fn mark_allocated(&mut self, clusters: &[u32]) {
        for &cluster in clusters {
            if let Some(slot) = self.freemap.get_mut(cluster as usize) {
                *slot = false;
            }
        }
        self.rebuild_freelist();
    }

    pub fn mark_free(&mut self, clusters: &[u32]) {
        for &cluster in clusters {
            if cluster >= 2 {
                if let Some(slot) = self.freemap.get_mut(cluster as usize) {
                    *slot = true;
                }
            }
        }
        self.rebuild_freelist();
    }

    fn rebuild_freelist(&mut self) {
        self.freelist.clear();
        let mut run: Option<Run> = None;
        for (cluster, &free) in self.freemap.iter().enumerate() {
            if free {
                match &mut run {
                    Some(run) => run.length += 1,
                    None => {
                        run = Some(Run {
                            start: cluster as u32,
                            length: 1,
                        })
                    }
                }
            } else if let Some(done) = run.take() {
                self.freelist.push(done);
            }
        }
        if let Some(done) = run {
            self.freelist.push(done);
        }
    }

    /// Allocates enough clusters for `bytes` and links them into the FAT:
    /// each new cluster points at its successor, the last one carries the
    /// end-of-chain marker, and when `last` names the tail of an existing
    /// chain it is re-pointed at the first new cluster.
    ///
    /// Placement prefers the single run nearest to `last` that covers the
    /// whole request, and otherwise carves nearest runs until the request
    /// is covered. Fails with `NoSpace` without touching any state when
    /// the volume cannot supply the full amount.
    pub fn allocate(
        &mut self,
        table: &mut FatTable,
        last: Option<u32>,
        bytes: u64,
        cluster_size: u64,
    ) -> Result<Vec<u32>> {
        let mut wanted = bytes.div_ceil(cluster_size).max(1) as u32;
        if self.free_clusters() < wanted {
            return Err(Error::NoSpace);
        }
        let hint = last.unwrap_or(2);

        let mut runs = self.freelist.clone();
        let mut clusters = Vec::with_capacity(wanted as usize);
        while wanted > 0 {
            let candidate = runs
                .iter()
                .enumerate()
                .filter(|(_, run)| run.length >= wanted)
                .min_by_key(|(_, run)| run.start.abs_diff(hint))
                .or_else(|| {
                    runs.iter()
                        .enumerate()
                        .min_by_key(|(_, run)| run.start.abs_diff(hint))
                })
                .map(|(index, _)| index);
            let Some(index) = candidate else {
                return Err(Error::NoSpace);
            };

            let run = &mut runs[index];
            let take = run.length.min(wanted);
            clusters.extend(run.start..run.start + take);
            run.start += take;
            run.length -= take;
            if run.length == 0 {
                runs.remove(index);
            }
            wanted -= take;
        }

        for pair in clusters.windows(2) {
            table.set_entry(pair[0], pair[1])?;
        }
        if let Some(&tail) = clusters.last() {
            table.set_entry(tail, table.kind().end_of_chain())?;
        }
        if let Some(last) = last {
            if let Some(&head) = clusters.first() {
                table.set_entry(last, head)?;
            }
        }

        self.mark_allocated(&clusters);
        Ok(clusters)
    }
}
