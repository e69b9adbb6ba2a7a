//! The directory engine.
//!
//! A directory is an append-only array of 32-byte slots: the FAT12/16 root
//! occupies its fixed sector range, every other directory is the
//! concatenation of its cluster chain. Slots never straddle a sector, so
//! each one is a single cached-sector access.
//!
//! Iteration snapshots each slot into a local buffer before anything is
//! decoded, so a concurrent extension of the same directory can never
//! invalidate a half-read entry.
//!
//! Long-name handling follows the on-disk convention: a run of long-name
//! slots in decreasing sequence order directly before a short entry, all
//! carrying the short name's checksum. Any damage to the run (deleted slot,
//! order gap, checksum mismatch) silently degrades the file to its short
//! name; iteration never aborts because of an orphaned run.

use alloc::string::String;
use alloc::vec::Vec;

use crate::entry::{classify_raw, DosTimestamp, LongDirEntry, RawKind, ShortDirEntry};
use crate::error::{Error, Result};
use crate::fat::{Chain, Cluster};
use crate::fs::Volume;
use crate::name;
use crate::{
    lfn_slot_count, ATTR_DIRECTORY, ATTR_VOLUME_ID, DIRENT_SIZE, DIR_ENTRY_DELETED, LAST_LONG_ENTRY,
    LFN_NAME_MAX, SECTOR_SIZE,
};

const SLOTS_PER_SECTOR: u32 = (SECTOR_SIZE / DIRENT_SIZE) as u32;

/// Where a slot lives, for rewriting it after a scan.
#[derive(Debug, Clone, Copy)]
pub struct SlotRef {
    /// Slot index from the start of the directory.
    pub index: u32,
    /// Cluster holding the slot ([`crate::cluster_io::FIXED_ROOT`] included).
    pub cluster: u32,
    /// Byte offset within that cluster (or root range).
    pub offset: u32,
}

/// A resolved name: the short entry plus the extent of its slot run.
#[derive(Debug, Clone)]
pub struct LookupHit {
    pub entry: ShortDirEntry,
    /// Slot of the short entry itself.
    pub slot: u32,
    /// First slot of the long-name run, when one is attached and intact.
    pub first_slot: u32,
    /// The name as it should be presented.
    pub display_name: String,
}

/// Snapshot iterator over a directory's slots.
pub(crate) struct DirStream<'v> {
    vol: &'v Volume,
    fixed_root: bool,
    cluster: u32,
    index: u32,
    slot_in_cluster: u32,
    slots_per_cluster: u32,
}

impl<'v> DirStream<'v> {
    pub(crate) fn new(vol: &'v Volume, dir: u32) -> Self {
        let fixed_root = dir == crate::cluster_io::FIXED_ROOT;
        let slots_per_cluster = if fixed_root {
            vol.io.root_dir_sectors() * SLOTS_PER_SECTOR
        } else {
            vol.io.sectors_per_cluster() * SLOTS_PER_SECTOR
        };
        Self {
            vol,
            fixed_root,
            cluster: dir,
            index: 0,
            slot_in_cluster: 0,
            slots_per_cluster,
        }
    }

    /// The next slot, or `None` at the end of the directory.
    pub(crate) fn next_slot(&mut self) -> Result<Option<(SlotRef, [u8; DIRENT_SIZE])>> {
        if self.slot_in_cluster == self.slots_per_cluster {
            if self.fixed_root {
                return Ok(None);
            }
            match self.vol.fat.next(self.cluster)? {
                Cluster::Data(c) => {
                    self.cluster = c;
                    self.slot_in_cluster = 0;
                }
                Cluster::Eof => return Ok(None),
                _ => return Err(Error::Corrupt),
            }
        }
        let offset = self.slot_in_cluster * DIRENT_SIZE as u32;
        let raw = self.vol.io.read_sector(
            self.cluster,
            offset / SECTOR_SIZE as u32,
            (offset % SECTOR_SIZE as u32) as usize,
            |r: &[u8; DIRENT_SIZE]| *r,
        )?;
        let slot = SlotRef {
            index: self.index,
            cluster: self.cluster,
            offset,
        };
        self.index += 1;
        self.slot_in_cluster += 1;
        Ok(Some((slot, raw)))
    }
}

/// Accumulates a long-name run while scanning towards its short entry.
struct LfnAssembly {
    checksum: u8,
    /// Sequence number the next slot must carry.
    expect: u8,
    first_slot: u32,
    /// Fragments in on-disk order (highest sequence first).
    fragments: Vec<[u16; crate::LFN_CHARS_PER_SLOT]>,
}

impl LfnAssembly {
    fn push(state: &mut Option<LfnAssembly>, slot: u32, raw: &[u8; DIRENT_SIZE]) {
        let lde = LongDirEntry::from_bytes(raw);
        if lde.is_last() {
            *state = Some(LfnAssembly {
                checksum: lde.checksum(),
                expect: lde.order_index(),
                first_slot: slot,
                fragments: alloc::vec![lde.fragment()],
            });
            return;
        }
        match state {
            Some(acc)
                if acc.checksum == lde.checksum()
                    && acc.expect == lde.order_index() + 1 =>
            {
                acc.expect = lde.order_index();
                acc.fragments.push(lde.fragment());
            }
            _ => *state = None,
        }
    }

    /// The assembled name, if the run ran down to sequence 1 and matches
    /// the short entry that follows it.
    fn finish(self, entry: &ShortDirEntry) -> Option<String> {
        if self.expect != 1 || self.checksum != entry.checksum() {
            return None;
        }
        let mut units: Vec<u16> = Vec::with_capacity(self.fragments.len() * 13);
        for fragment in self.fragments.iter().rev() {
            units.extend_from_slice(fragment);
        }
        let end = units
            .iter()
            .position(|&u| u == 0 || u == 0xFFFF)
            .unwrap_or(units.len());
        Some(String::from_utf16_lossy(&units[..end]))
    }
}

impl Volume {
    /// Total slots the directory can hold without growing.
    fn dir_capacity(&self, dir: u32) -> Result<u32> {
        if dir == crate::cluster_io::FIXED_ROOT {
            return Ok(self.io.root_dir_sectors() * SLOTS_PER_SECTOR);
        }
        let clusters = self.fat.count_chain(dir)?;
        if clusters == 0 {
            return Err(Error::Corrupt);
        }
        Ok(clusters * self.io.sectors_per_cluster() * SLOTS_PER_SECTOR)
    }

    /// (cluster, offset-in-cluster) of a slot index.
    pub(crate) fn locate_slot(&self, dir: u32, index: u32) -> Result<SlotRef> {
        if dir == crate::cluster_io::FIXED_ROOT {
            return Ok(SlotRef {
                index,
                cluster: dir,
                offset: index * DIRENT_SIZE as u32,
            });
        }
        let per_cluster = self.io.sectors_per_cluster() * SLOTS_PER_SECTOR;
        let mut cluster = dir;
        for _ in 0..index / per_cluster {
            match self.fat.next(cluster)? {
                Cluster::Data(c) => cluster = c,
                _ => return Err(Error::Corrupt),
            }
        }
        Ok(SlotRef {
            index,
            cluster,
            offset: (index % per_cluster) * DIRENT_SIZE as u32,
        })
    }

    pub(crate) fn read_raw_slot(&self, slot: &SlotRef) -> Result<[u8; DIRENT_SIZE]> {
        self.io.read_sector(
            slot.cluster,
            slot.offset / SECTOR_SIZE as u32,
            (slot.offset % SECTOR_SIZE as u32) as usize,
            |r: &[u8; DIRENT_SIZE]| *r,
        )
    }

    pub(crate) fn write_raw_slot(&self, slot: &SlotRef, raw: &[u8; DIRENT_SIZE]) -> Result<()> {
        self.io.modify_sector(
            slot.cluster,
            slot.offset / SECTOR_SIZE as u32,
            (slot.offset % SECTOR_SIZE as u32) as usize,
            |r: &mut [u8; DIRENT_SIZE]| r.copy_from_slice(raw),
        )
    }

    /// Rewrite the short entry at `(dir, index)` in place.
    pub(crate) fn modify_short_entry(
        &self,
        dir: u32,
        index: u32,
        f: impl FnOnce(&mut ShortDirEntry),
    ) -> Result<()> {
        let slot = self.locate_slot(dir, index)?;
        let mut raw = self.read_raw_slot(&slot)?;
        let mut entry = ShortDirEntry::from_bytes(&raw);
        f(&mut entry);
        raw = entry.to_bytes();
        self.write_raw_slot(&slot, &raw)
    }

    /// Case-insensitive lookup of `name`. `.` and `..` never reach this
    /// point; the operations layer resolves them against the node graph.
    pub(crate) fn dir_lookup(&self, dir: u32, name: &str) -> Result<Option<LookupHit>> {
        let mut stream = DirStream::new(self, dir);
        let mut lfn: Option<LfnAssembly> = None;

        while let Some((slot, raw)) = stream.next_slot()? {
            match classify_raw(&raw) {
                RawKind::Free => break,
                RawKind::Deleted | RawKind::VolumeLabel => lfn = None,
                RawKind::LongName => LfnAssembly::push(&mut lfn, slot.index, &raw),
                RawKind::Short => {
                    let entry = ShortDirEntry::from_bytes(&raw);
                    let run = lfn.take();
                    let first_slot = run.as_ref().map(|a| a.first_slot);
                    let long_name = run.and_then(|a| a.finish(&entry));
                    let short_name =
                        name::short_display(&entry.raw_name(), entry.case_flags(), self.cp);

                    let long_matches = long_name
                        .as_deref()
                        .map_or(false, |l| l.eq_ignore_ascii_case(name));
                    if long_matches || short_name.eq_ignore_ascii_case(name) {
                        let display_name = long_name.unwrap_or(short_name);
                        return Ok(Some(LookupHit {
                            entry,
                            slot: slot.index,
                            first_slot: first_slot.unwrap_or(slot.index),
                            display_name,
                        }));
                    }
                }
            }
        }
        Ok(None)
    }

    /// The logical entry at or after slot `cookie`, reassembled. Returns the
    /// cookie to continue from. Deleted slots and the volume label are
    /// skipped; damaged long-name runs degrade to the short name.
    pub(crate) fn dir_next_entry(
        &self,
        dir: u32,
        cookie: u32,
    ) -> Result<Option<(u32, LookupHit)>> {
        let mut stream = DirStream::new(self, dir);
        let mut lfn: Option<LfnAssembly> = None;

        while let Some((slot, raw)) = stream.next_slot()? {
            if slot.index < cookie {
                continue;
            }
            match classify_raw(&raw) {
                RawKind::Free => break,
                RawKind::Deleted | RawKind::VolumeLabel => lfn = None,
                RawKind::LongName => LfnAssembly::push(&mut lfn, slot.index, &raw),
                RawKind::Short => {
                    let entry = ShortDirEntry::from_bytes(&raw);
                    let run = lfn.take();
                    let first_slot = run.as_ref().map(|a| a.first_slot).unwrap_or(slot.index);
                    let display_name = run
                        .and_then(|a| a.finish(&entry))
                        .unwrap_or_else(|| {
                            name::short_display(&entry.raw_name(), entry.case_flags(), self.cp)
                        });
                    return Ok(Some((
                        slot.index + 1,
                        LookupHit {
                            entry,
                            slot: slot.index,
                            first_slot,
                            display_name,
                        },
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Whether a raw short name is already present in `dir`.
    pub(crate) fn short_name_exists(&self, dir: u32, raw_name: &[u8; 11]) -> Result<bool> {
        let mut stream = DirStream::new(self, dir);
        while let Some((_, raw)) = stream.next_slot()? {
            match classify_raw(&raw) {
                RawKind::Free => break,
                RawKind::Short => {
                    if ShortDirEntry::from_bytes(&raw).raw_name() == *raw_name {
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    /// Find `count` consecutive reusable slots, growing the directory by a
    /// zeroed cluster when the chain runs out. The fixed root cannot grow.
    pub(crate) fn allocate_slots(&self, dir: u32, count: u32) -> Result<u32> {
        let mut stream = DirStream::new(self, dir);
        let mut run_start = 0u32;
        let mut run_len = 0u32;

        loop {
            match stream.next_slot()? {
                Some((slot, raw)) => match classify_raw(&raw) {
                    RawKind::Free => {
                        // Everything from here on is free; a deleted run
                        // butting up against it extends into it.
                        if run_len == 0 || run_start + run_len != slot.index {
                            run_start = slot.index;
                        }
                        break;
                    }
                    RawKind::Deleted => {
                        if run_len == 0 {
                            run_start = slot.index;
                        }
                        run_len += 1;
                        if run_len == count {
                            return Ok(run_start);
                        }
                    }
                    _ => run_len = 0,
                },
                None => {
                    let end = stream.index;
                    if run_len == 0 || run_start + run_len != end {
                        run_start = end;
                    }
                    break;
                }
            }
        }

        let needed_end = run_start + count;
        let capacity = self.dir_capacity(dir)?;
        if needed_end > capacity {
            if dir == crate::cluster_io::FIXED_ROOT {
                return Err(Error::NoSpace);
            }
            let per_cluster = self.io.sectors_per_cluster() * SLOTS_PER_SECTOR;
            let have = capacity / per_cluster;
            let want = (needed_end + per_cluster - 1) / per_cluster;
            let mut chain = Chain::new(dir);
            self.fat.set_chain_length(&mut chain, want, have, |_| {})?;
            // Fresh directory clusters must read as all-free slots.
            let mut cluster = chain.end.unwrap_or(dir);
            if want == have + 1 {
                self.io.zero_cluster(cluster)?;
            } else {
                // Walk the new suffix and zero each cluster.
                cluster = dir;
                let mut index = 0;
                loop {
                    if index >= have {
                        self.io.zero_cluster(cluster)?;
                    }
                    match self.fat.next(cluster)? {
                        Cluster::Data(c) => {
                            cluster = c;
                            index += 1;
                        }
                        _ => break,
                    }
                }
            }
        }
        Ok(run_start)
    }

    /// Write a logical entry: the long-name run in reverse order, then the
    /// short entry. Returns the short entry's slot index.
    pub(crate) fn dir_insert(
        &self,
        dir: u32,
        long_name: &str,
        entry: &ShortDirEntry,
    ) -> Result<u32> {
        let slots = lfn_slot_count(long_name) as u32;
        let first = self.allocate_slots(dir, slots + 1)?;

        let checksum = entry.checksum();
        let fragments = crate::entry::lfn_fragments(long_name);
        debug_assert_eq!(fragments.len() as u32, slots);

        for (i, fragment) in fragments.iter().enumerate().rev() {
            let mut order = (i + 1) as u8;
            if i + 1 == fragments.len() {
                order |= LAST_LONG_ENTRY;
            }
            let lde = LongDirEntry::new(order, checksum, fragment);
            let at = first + (fragments.len() - 1 - i) as u32;
            let slot = self.locate_slot(dir, at)?;
            self.write_raw_slot(&slot, &lde.to_bytes())?;
        }

        let short_slot = first + slots;
        let slot = self.locate_slot(dir, short_slot)?;
        self.write_raw_slot(&slot, &entry.to_bytes())?;
        Ok(short_slot)
    }

    /// Delete the logical entry whose short entry sits at `short_slot`:
    /// the short slot itself and the long-name run directly above it, as
    /// far as the checksums agree.
    pub(crate) fn dir_remove(&self, dir: u32, short_slot: u32) -> Result<()> {
        let slot = self.locate_slot(dir, short_slot)?;
        let raw = self.read_raw_slot(&slot)?;
        let checksum = ShortDirEntry::from_bytes(&raw).checksum();

        let mut deleted = raw;
        deleted[0] = DIR_ENTRY_DELETED;
        self.write_raw_slot(&slot, &deleted)?;

        let mut index = short_slot;
        let mut expect = 1u8;
        while index > 0 {
            index -= 1;
            let slot = self.locate_slot(dir, index)?;
            let raw = self.read_raw_slot(&slot)?;
            if classify_raw(&raw) != RawKind::LongName {
                break;
            }
            let lde = LongDirEntry::from_bytes(&raw);
            if lde.checksum() != checksum || lde.order_index() != expect {
                break;
            }
            let was_last = lde.is_last();
            let mut deleted = raw;
            deleted[0] = DIR_ENTRY_DELETED;
            self.write_raw_slot(&slot, &deleted)?;
            if was_last {
                break;
            }
            expect += 1;
        }
        Ok(())
    }

    /// Drop trailing all-free clusters from a directory chain. Best effort:
    /// failures are logged and swallowed.
    pub(crate) fn dir_compact(&self, dir: u32) {
        if dir == crate::cluster_io::FIXED_ROOT {
            return;
        }
        let result = (|| -> Result<()> {
            let mut stream = DirStream::new(self, dir);
            let mut last_used = 0u32;
            let mut any_used = false;
            while let Some((slot, raw)) = stream.next_slot()? {
                match classify_raw(&raw) {
                    RawKind::Free => break,
                    RawKind::Deleted => {}
                    _ => {
                        last_used = slot.index;
                        any_used = true;
                    }
                }
            }
            let per_cluster = self.io.sectors_per_cluster() * SLOTS_PER_SECTOR;
            let needed = if any_used {
                (last_used / per_cluster) + 1
            } else {
                1
            };
            let have = self.fat.count_chain(dir)?;
            if have > needed {
                let mut chain = Chain::new(dir);
                self.fat.set_chain_length(&mut chain, needed, have, |c| {
                    self.io.discard_cluster(c)
                })?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            log::warn!("dir: compaction of {} failed: {}", dir, e);
        }
    }

    /// Lay out `.` and `..` in a brand new directory cluster. `parent` is
    /// the parent's start cluster, with the root spelled 0 whatever the FAT
    /// width.
    pub(crate) fn make_empty_dir(
        &self,
        new_cluster: u32,
        parent: u32,
        now: DosTimestamp,
    ) -> Result<()> {
        self.io.zero_cluster(new_cluster)?;

        let mut dot = ShortDirEntry::new(b".          ", ATTR_DIRECTORY, new_cluster);
        dot.set_created(now);
        dot.set_modified(now);
        dot.set_accessed_date(now.date);
        let mut dotdot = ShortDirEntry::new(b"..         ", ATTR_DIRECTORY, parent);
        dotdot.set_created(now);
        dotdot.set_modified(now);
        dotdot.set_accessed_date(now.date);

        self.io.modify_sector(new_cluster, 0, 0, |r: &mut [u8; DIRENT_SIZE]| {
            r.copy_from_slice(&dot.to_bytes())
        })?;
        self.io
            .modify_sector(new_cluster, 0, DIRENT_SIZE, |r: &mut [u8; DIRENT_SIZE]| {
                r.copy_from_slice(&dotdot.to_bytes())
            })
    }

    /// Point an existing directory's `..` entry at a new parent (rename
    /// across directories). Root parents are written as cluster 0.
    pub(crate) fn update_dotdot(&self, dir: u32, parent: u32) -> Result<()> {
        self.io
            .modify_sector(dir, 0, DIRENT_SIZE, |r: &mut [u8; DIRENT_SIZE]| {
                let mut entry = ShortDirEntry::from_bytes(r);
                if entry.raw_name() == *b"..         " {
                    entry.set_first_cluster(parent);
                    r.copy_from_slice(&entry.to_bytes());
                    Ok(())
                } else {
                    Err(Error::Corrupt)
                }
            })?
    }

    /// True when only `.`, `..`, deleted slots and the terminator remain.
    pub(crate) fn dir_is_empty(&self, dir: u32) -> Result<bool> {
        let mut stream = DirStream::new(self, dir);
        while let Some((_, raw)) = stream.next_slot()? {
            match classify_raw(&raw) {
                RawKind::Free => break,
                RawKind::Deleted | RawKind::LongName | RawKind::VolumeLabel => {}
                RawKind::Short => {
                    let name = ShortDirEntry::from_bytes(&raw).raw_name();
                    if name != *b".          " && name != *b"..         " {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// The root directory's volume-label entry, if any.
    pub(crate) fn find_label_entry(&self) -> Result<Option<(u32, [u8; 11])>> {
        let root = self.root_dir_cluster();
        let mut stream = DirStream::new(self, root);
        while let Some((slot, raw)) = stream.next_slot()? {
            match classify_raw(&raw) {
                RawKind::Free => break,
                RawKind::VolumeLabel => {
                    return Ok(Some((slot.index, ShortDirEntry::from_bytes(&raw).raw_name())));
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Install or rewrite the unique volume-label entry in the root.
    pub(crate) fn write_label_entry(&self, label: &[u8; 11]) -> Result<()> {
        let root = self.root_dir_cluster();
        let index = match self.find_label_entry()? {
            Some((index, _)) => index,
            None => self.allocate_slots(root, 1)?,
        };
        let slot = self.locate_slot(root, index)?;
        let mut entry = ShortDirEntry::new(label, ATTR_VOLUME_ID, 0);
        let now = self.now();
        entry.set_modified(now);
        // Labels are raw bytes; undo the constructor's KANJI escape only
        // applied to real names.
        let mut raw = entry.to_bytes();
        raw[0] = label[0];
        self.write_raw_slot(&slot, &raw)
    }
}

/// Validate a caller-supplied name before any directory work happens.
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BadName);
    }
    if name.encode_utf16().count() > LFN_NAME_MAX {
        return Err(Error::NameTooLong);
    }
    if !name::legal_long(name) {
        return Err(Error::BadName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests_support::MemDisk;
    use crate::mkfs::{mkfs, MkfsParams};
    use crate::vfs::{MountOptions, NullHooks};
    use alloc::sync::Arc;

    fn vol() -> Arc<Volume> {
        let disk: Arc<dyn crate::device::BlockDevice> = Arc::new(MemDisk::new(131_072));
        mkfs(Arc::clone(&disk), &MkfsParams::default()).unwrap();
        Volume::mount(disk, MountOptions::default(), Arc::new(NullHooks)).unwrap()
    }

    #[test]
    fn deleted_slot_runs_are_reused_lowest_first() {
        let vol = vol();
        let root = vol.root_ino();
        vol.create(root, "aaaa", false, false).unwrap();
        vol.create(root, "bbbb", false, false).unwrap();
        let root_key = vol.root_dir_cluster();
        let b_slot = vol.dir_lookup(root_key, "bbbb").unwrap().unwrap().slot;

        vol.unlink(root, "aaaa").unwrap();
        vol.create(root, "cccc", false, false).unwrap();
        let c = vol.dir_lookup(root_key, "cccc").unwrap().unwrap();
        // The replacement landed in the freed run, before b.
        assert!(c.slot < b_slot);
    }

    #[test]
    fn damaged_lfn_run_degrades_to_short_name() {
        let vol = vol();
        let root = vol.root_ino();
        vol.create(root, "Mixed Case Name.txt", false, false).unwrap();
        let root_key = vol.root_dir_cluster();

        let hit = vol.dir_lookup(root_key, "Mixed Case Name.txt").unwrap().unwrap();
        assert_eq!(&hit.entry.raw_name()[..8], b"MIXEDC~1");
        assert!(hit.first_slot < hit.slot);

        // Corrupt the checksum of the first long-name slot.
        let slot = vol.locate_slot(root_key, hit.first_slot).unwrap();
        let mut raw = vol.read_raw_slot(&slot).unwrap();
        raw[13] ^= 0xFF;
        vol.write_raw_slot(&slot, &raw).unwrap();

        // The long name is gone, the alias still resolves.
        assert!(vol
            .dir_lookup(root_key, "Mixed Case Name.txt")
            .unwrap()
            .is_none());
        let alias = vol.dir_lookup(root_key, "MIXEDC~1.TXT").unwrap().unwrap();
        assert_eq!(alias.slot, hit.slot);
        assert_eq!(alias.display_name, "MIXEDC~1.TXT");
    }

    #[test]
    fn emptied_directory_compacts_to_one_cluster() {
        let vol = vol();
        let root = vol.root_ino();
        let d = vol.mkdir(root, "busy").unwrap();
        // Two slots per file; push the directory past its first cluster.
        for i in 0..40 {
            vol.create(d, &alloc::format!("file{:02}", i), false, false)
                .unwrap();
        }
        let d_key = {
            let node = vol.get_vnode(d).unwrap();
            let c = node.state().read().chain.start;
            vol.put_vnode(d);
            c
        };
        assert!(vol.fat.count_chain(d_key).unwrap() > 1);

        for i in 0..40 {
            vol.unlink(d, &alloc::format!("file{:02}", i)).unwrap();
        }
        assert_eq!(vol.fat.count_chain(d_key).unwrap(), 1);
        assert!(vol.dir_is_empty(d_key).unwrap());
    }

    #[test]
    fn is_empty_sees_through_deleted_slots() {
        let vol = vol();
        let root = vol.root_ino();
        let d = vol.mkdir(root, "dir").unwrap();
        vol.create(d, "transient", false, false).unwrap();
        let d_key = {
            let node = vol.get_vnode(d).unwrap();
            let c = node.state().read().chain.start;
            vol.put_vnode(d);
            c
        };
        assert!(!vol.dir_is_empty(d_key).unwrap());
        vol.unlink(d, "transient").unwrap();
        assert!(vol.dir_is_empty(d_key).unwrap());
    }
}
