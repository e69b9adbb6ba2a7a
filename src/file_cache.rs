//! File-data I/O on top of the cluster chain.
//!
//! The host's page-level caching sits above this layer; here a read or
//! write walks the chain once to the starting cluster and then streams
//! through the block cache cluster by cluster. `file_map` hands the host
//! the (LBA, length) runs backing a byte range so page fetches can bypass
//! the driver entirely.
//!
//! The truncation protocol leans on one rule here: while a node's
//! `resizing` flag is up, writes past the pre-resize end of file are
//! acknowledged but not performed. The resizer owns that window; whatever
//! lands there before the zero fill would be overwritten anyway.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::fat::Cluster;
use crate::fs::Volume;
use crate::node::Node;

/// One contiguous device run backing part of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMapRun {
    pub lba: u64,
    pub sectors: u32,
}

impl Volume {
    /// Walk to the cluster covering byte `pos` of the chain.
    fn cluster_at(&self, start: u32, pos: u64) -> Result<u32> {
        let bpc = self.io.bytes_per_cluster() as u64;
        let mut cluster = start;
        for _ in 0..pos / bpc {
            match self.fat.next(cluster)? {
                Cluster::Data(c) => cluster = c,
                _ => {
                    self.mark_corrupt("file chain shorter than file size");
                    return Err(Error::Corrupt);
                }
            }
        }
        Ok(cluster)
    }

    /// Read file bytes at `pos`, clamped to the file size. Returns the
    /// number of bytes delivered.
    pub fn file_read_at(&self, node: &Node, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let (start, size) = {
            let state = node.state().read();
            (state.chain.start, state.size as u64)
        };
        if pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - pos) as usize);
        if start == 0 {
            return Ok(0);
        }

        let bpc = self.io.bytes_per_cluster() as u64;
        let mut cluster = self.cluster_at(start, pos)?;
        let mut done = 0usize;
        let mut at = pos;
        while done < want {
            let in_cluster = (at % bpc) as u32;
            let len = ((bpc - in_cluster as u64) as usize).min(want - done);
            self.io
                .read_at(cluster, in_cluster, &mut buf[done..done + len])?;
            done += len;
            at += len as u64;
            if done < want {
                match self.fat.next(cluster)? {
                    Cluster::Data(c) => cluster = c,
                    _ => {
                        self.mark_corrupt("file chain shorter than file size");
                        return Err(Error::Corrupt);
                    }
                }
            }
        }
        Ok(done)
    }

    /// Write file bytes at `pos`. The chain and size must already cover the
    /// range; the operations layer extends before writing.
    ///
    /// During another thread's resize window, the portion beyond the old
    /// end of file is suppressed: reported as written, not stored.
    pub fn file_write_at(&self, node: &Node, pos: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (start, size) = {
            let state = node.state().read();
            (state.chain.start, state.size as u64)
        };

        let mut limit = buf.len();
        if node.is_resizing() {
            let writable = size.saturating_sub(pos).min(buf.len() as u64) as usize;
            limit = writable;
        }
        if start == 0 {
            // Nothing allocated; only possible for a fully suppressed write.
            return Ok(buf.len());
        }

        let bpc = self.io.bytes_per_cluster() as u64;
        let mut cluster = self.cluster_at(start, pos)?;
        let mut done = 0usize;
        let mut at = pos;
        while done < limit {
            let in_cluster = (at % bpc) as u32;
            let len = ((bpc - in_cluster as u64) as usize).min(limit - done);
            self.io.write_at(cluster, in_cluster, &buf[done..done + len])?;
            done += len;
            at += len as u64;
            if done < limit {
                match self.fat.next(cluster)? {
                    Cluster::Data(c) => cluster = c,
                    _ => {
                        self.mark_corrupt("file chain shorter than file size");
                        return Err(Error::Corrupt);
                    }
                }
            }
        }
        Ok(buf.len())
    }

    /// Zero `[from, to)`; the backing clusters must already exist.
    pub(crate) fn file_zero_range(&self, node: &Node, from: u64, to: u64) -> Result<()> {
        if to <= from {
            return Ok(());
        }
        let start = node.state().read().chain.start;
        if start == 0 {
            return Ok(());
        }
        let bpc = self.io.bytes_per_cluster() as u64;
        let zeros = alloc::vec![0u8; bpc as usize];
        let mut cluster = self.cluster_at(start, from)?;
        let mut at = from;
        while at < to {
            let in_cluster = (at % bpc) as u32;
            let len = ((bpc - in_cluster as u64).min(to - at)) as usize;
            self.io.write_at(cluster, in_cluster, &zeros[..len])?;
            at += len as u64;
            if at < to {
                match self.fat.next(cluster)? {
                    Cluster::Data(c) => cluster = c,
                    _ => return Err(Error::Corrupt),
                }
            }
        }
        Ok(())
    }

    /// Device runs backing `[offset, offset + size)`, merged across
    /// physically adjacent clusters.
    pub fn file_map(&self, node: &Node, offset: u64, size: u64) -> Result<Vec<FileMapRun>> {
        let mut out = Vec::new();
        if size == 0 {
            return Ok(out);
        }
        let start = node.state().read().chain.start;
        if start == 0 {
            return Ok(out);
        }
        let bpc = self.io.bytes_per_cluster() as u64;
        let spc = self.io.sectors_per_cluster();
        let end = offset + size;
        let mut cluster = self.cluster_at(start, offset)?;
        let mut at = offset - offset % bpc;
        loop {
            let lba = self.io.lba(cluster, 0)?;
            match out.last_mut() {
                Some(run) if run.lba + run.sectors as u64 == lba => run.sectors += spc,
                _ => out.push(FileMapRun { lba, sectors: spc }),
            }
            at += bpc;
            if at >= end {
                break;
            }
            match self.fat.next(cluster)? {
                Cluster::Data(c) => cluster = c,
                _ => break,
            }
        }
        Ok(out)
    }

    /// Flush every cluster of the node's chain.
    pub(crate) fn file_sync(&self, node: &Node) -> Result<()> {
        let start = node.state().read().chain.start;
        if start == 0 {
            return Ok(());
        }
        let mut cluster = start;
        let mut steps = 0u32;
        loop {
            self.io.sync_cluster(cluster)?;
            steps += 1;
            if steps > self.fat.max_cluster() {
                return Err(Error::Corrupt);
            }
            match self.fat.next(cluster)? {
                Cluster::Data(c) => cluster = c,
                _ => return Ok(()),
            }
        }
    }
}
