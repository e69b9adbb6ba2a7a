//! The mounted volume and its operations.
//!
//! Every host entry point lands on a method here, which acquires what the
//! operation needs in the canonical order (volume mutex, checkpath lock,
//! vcache, parent node, child node, FAT) and then drives the directory
//! engine, the FAT and the node store. Two nodes at the same depth are
//! taken in ascending inode order; rename serializes on the volume mutex
//! outright.
//!
//! Corruption handling is deliberately blunt: whoever trips over an
//! inconsistency calls [`Volume::mark_corrupt`], which flips the volume
//! read-only, tells the host once, and leaves repair to an offline tool.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, RwLock};

use crate::bpb::{classify, Bpb, FsInfo};
use crate::cache::BlockCacheManager;
use crate::cluster_io::{ClusterIo, FIXED_ROOT};
use crate::device::BlockDevice;
use crate::dir::check_name;
use crate::entry::{DosTimestamp, ShortDirEntry};
use crate::error::{Error, Result};
use crate::fat::{FatTable, FatType};
use crate::name::{self, OemCodepage};
use crate::node::{Node, NodeStore};
use crate::vcache::{dir_cluster_loc, dir_index_loc, VCache};
use crate::vfs::{Dirent, FsStat, HostHooks, MountFlags, MountOptions, Stat, SyncMode};
use crate::{Ino, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_READ_ONLY, DIRENT_SIZE, SECTOR_SIZE};

pub struct Volume {
    device: Arc<dyn BlockDevice>,
    pub(crate) cache: Arc<BlockCacheManager>,
    pub(crate) bpb: Bpb,
    pub(crate) kind: FatType,
    pub(crate) fat: FatTable,
    pub(crate) io: ClusterIo,
    pub(crate) vcache: VCache,
    pub(crate) nodes: NodeStore,
    pub(crate) hooks: Arc<dyn HostHooks>,
    pub(crate) opts: MountOptions,
    pub(crate) cp: OemCodepage,
    root_ino: Ino,
    read_only: AtomicBool,
    corruption_reported: AtomicBool,
    fsinfo_dirty: AtomicBool,
    device_locked: bool,
    label: Mutex<[u8; 11]>,
    /// Serializes rename, label changes and the mount/unmount edges.
    vol_lock: Mutex<()>,
    /// Write-held across the rename ancestry walk.
    checkpath: RwLock<()>,
}

impl Volume {
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        opts: MountOptions,
        hooks: Arc<dyn HostHooks>,
    ) -> Result<Arc<Volume>> {
        let mut device_locked = false;
        if opts.flags.contains(MountFlags::LOCK_DEVICE) {
            device.lock_exclusive()?;
            device_locked = true;
        }
        let result = Self::mount_locked(Arc::clone(&device), opts, hooks, device_locked);
        if result.is_err() && device_locked {
            device.unlock_exclusive();
        }
        result
    }

    fn mount_locked(
        device: Arc<dyn BlockDevice>,
        opts: MountOptions,
        hooks: Arc<dyn HostHooks>,
        device_locked: bool,
    ) -> Result<Arc<Volume>> {
        let cache = Arc::new(BlockCacheManager::new(Arc::clone(&device)));
        let sector0 = cache.read_sector(0, 0, |s: &[u8; SECTOR_SIZE]| *s)?;
        let (kind, bpb) = classify(&sector0)?;

        if bpb.bytes_per_sector as usize != SECTOR_SIZE {
            log::error!(
                "mount: {}-byte sectors not supported by this host build",
                bpb.bytes_per_sector
            );
            return Err(Error::Unsupported);
        }
        if bpb.total_sectors as u64 > device.sector_count() {
            log::error!(
                "mount: volume claims {} sectors, device has {}",
                bpb.total_sectors,
                device.sector_count()
            );
            return Err(Error::Unsupported);
        }

        let read_only = opts.flags.contains(MountFlags::READ_ONLY) || device.is_read_only();

        let fat = FatTable::new(
            Arc::clone(&cache),
            kind,
            bpb.bytes_per_sector as u32,
            bpb.reserved_sectors as u32,
            bpb.sectors_per_fat,
            bpb.fat_count as u32,
            bpb.active_fat(),
            bpb.fat_mirrored(),
            bpb.max_cluster(),
        );

        let io = ClusterIo::new(
            Arc::clone(&cache),
            bpb.sectors_per_cluster as u32,
            bpb.first_data_sector(),
            bpb.root_dir_start_sector(),
            bpb.root_dir_sectors(),
        );

        // Some formatters write a FAT[0] media byte that disagrees with the
        // BPB; tolerated, the BPB wins.
        match fat.media_byte() {
            Ok(media) if media != bpb.media => {
                log::warn!(
                    "mount: FAT media byte {:#04x} != BPB {:#04x}",
                    media,
                    bpb.media
                );
            }
            Ok(_) => {}
            Err(_) => return Err(Error::Io),
        }

        let was_clean = fat.is_clean_shutdown().unwrap_or(false);
        if !was_clean {
            log::warn!("mount: volume was not unmounted cleanly");
        }

        let cp = opts
            .oem_codepage
            .as_deref()
            .map(OemCodepage::by_name)
            .unwrap_or(OemCodepage::Cp850);

        let root_cluster = if kind == FatType::Fat32 {
            bpb.root_cluster
        } else {
            FIXED_ROOT
        };
        let root_ino: Ino = root_cluster as Ino;

        let volume = Arc::new(Volume {
            device,
            cache,
            bpb,
            kind,
            fat,
            io,
            vcache: VCache::new(),
            nodes: NodeStore::new(),
            hooks,
            opts,
            cp,
            root_ino,
            read_only: AtomicBool::new(read_only),
            corruption_reported: AtomicBool::new(false),
            fsinfo_dirty: AtomicBool::new(false),
            device_locked,
            label: Mutex::new([crate::SPACE; 11]),
            vol_lock: Mutex::new(()),
            checkpath: RwLock::new(()),
        });

        // Free counters: the FAT32 fsinfo copy is trusted only after a
        // clean shutdown and when the count is plausible, otherwise scan.
        let mut seeded = false;
        if kind == FatType::Fat32 && bpb.fsinfo_sector != 0 {
            let raw = volume
                .cache
                .read_sector(bpb.fsinfo_sector as u64, 0, |s: &[u8; SECTOR_SIZE]| *s)?;
            match FsInfo::parse(&raw) {
                Some(info)
                    if was_clean
                        && info.free_count != FsInfo::UNKNOWN
                        && info.free_count <= bpb.cluster_count() =>
                {
                    volume.fat.seed_counters(info.free_count, info.next_free);
                    seeded = true;
                }
                Some(_) => log::warn!("mount: stale fsinfo counters, rescanning"),
                None => log::warn!("mount: corrupt fsinfo sector, rescanning"),
            }
        }
        if !seeded {
            let free = volume.fat.recount_free()?;
            volume.fat.seed_counters(free, volume.fat.next_free_hint());
            volume.fsinfo_dirty.store(true, Ordering::Relaxed);
        }

        // The root node lives as long as the mount.
        volume
            .nodes
            .publish(Arc::new(Node::root(root_ino, root_cluster)));

        // Label: BPB copy as the fallback, superseded by the root entry.
        {
            let mut label = volume.label.lock();
            if bpb.boot_signature == crate::bpb::EXT_BOOT_SIGNATURE {
                *label = bpb.volume_label;
            }
            if let Ok(Some((_, entry_label))) = volume.find_label_entry() {
                *label = entry_label;
            }
        }

        if !read_only {
            volume.fat.set_clean_shutdown(false)?;
        }

        log::info!(
            "mount: {:?}, {} clusters of {} bytes, {} free",
            kind,
            volume.bpb.cluster_count(),
            volume.io.bytes_per_cluster(),
            volume.fat.free_count()
        );
        Ok(volume)
    }

    /// Final sync and clean-shutdown handshake. Open files must have been
    /// quiesced by the host before this is called.
    pub fn unmount(&self) -> Result<()> {
        let _guard = self.vol_lock.lock();
        self.sync()?;
        let _ = self.nodes.release(self.root_ino);
        if !self.is_read_only() {
            self.fat.set_clean_shutdown(true)?;
            self.cache.sync_all()?;
        }
        if self.device_locked {
            self.device.unlock_exclusive();
        }
        log::info!("unmount: done");
        Ok(())
    }

    pub fn root_ino(&self) -> Ino {
        self.root_ino
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Corruption tripwire: force read-only and tell the host, once.
    pub(crate) fn mark_corrupt(&self, what: &str) {
        log::error!("volume corrupt: {}; remounting read-only", what);
        self.read_only.store(true, Ordering::Release);
        if !self.corruption_reported.swap(true, Ordering::AcqRel) {
            self.hooks.remount_read_only();
        }
    }

    fn escalate<T>(&self, result: Result<T>, what: &str) -> Result<T> {
        if let Err(Error::Corrupt) = &result {
            self.mark_corrupt(what);
        }
        result
    }

    pub(crate) fn root_dir_cluster(&self) -> u32 {
        if self.kind == FatType::Fat32 {
            self.bpb.root_cluster
        } else {
            FIXED_ROOT
        }
    }

    pub(crate) fn now(&self) -> DosTimestamp {
        DosTimestamp::from_unix(self.hooks.now_unix(), self.hooks.tz_offset_secs())
    }

    fn write_through(&self) -> bool {
        match self.opts.sync {
            SyncMode::Always => true,
            SyncMode::IfRemovable => self.opts.removable,
            SyncMode::Never => false,
        }
    }

    fn natural_loc(&self, dir_key: u32, start_cluster: u32, slot: u32) -> u64 {
        if start_cluster != 0 {
            dir_cluster_loc(dir_key, start_cluster)
        } else {
            dir_index_loc(dir_key, slot)
        }
    }

    // ----- vnode lifecycle ---------------------------------------------

    /// Reference a node, constructing it from its directory entry if it is
    /// not live (the host's `read_vnode` path).
    pub fn get_vnode(&self, ino: Ino) -> Result<Arc<Node>> {
        if let Some(node) = self.nodes.acquire(ino) {
            return Ok(node);
        }
        let loc = self.vcache.lookup(ino).ok_or(Error::NotFound)?;
        let node = self.read_vnode(ino, loc)?;
        let node = self.nodes.publish(Arc::new(node));
        self.vcache.mark_constructed(ino, true);
        Ok(node)
    }

    /// Drop one reference; the last one flushes (or reclaims a deleted
    /// node's chain).
    pub fn put_vnode(&self, ino: Ino) {
        let Some(node) = self.nodes.release(ino) else {
            return;
        };
        if node.is_removed() {
            let start = node.state().read().chain.start;
            if start != 0 && !self.is_read_only() {
                let result = self.fat.free_chain(start, |c| self.io.discard_cluster(c));
                if let Err(e) = result {
                    log::warn!("release: reclaiming chain {} failed: {}", start, e);
                }
            }
            self.vcache.forget(node.ino());
        } else {
            if let Err(e) = self.flush_node(&node) {
                log::warn!("release: flushing node {:#x} failed: {}", node.ino(), e);
            }
            self.vcache.mark_constructed(node.ino(), false);
        }
    }

    /// Extra reference on an already-live node; never constructs.
    pub fn acquire_vnode(&self, ino: Ino) -> Result<Arc<Node>> {
        self.nodes.acquire(ino).ok_or(Error::NotFound)
    }

    /// Host-side delete notification: the node is gone from the namespace
    /// and its chain is reclaimed when the last reference drops.
    pub fn remove_vnode(&self, ino: Ino) -> Result<()> {
        let node = self.nodes.peek(ino).ok_or(Error::NotFound)?;
        node.mark_removed();
        Ok(())
    }

    /// Whether `read_vnode` has completed for this inode; the host uses it
    /// to avoid racing duplicate constructions.
    pub fn is_vnode_constructed(&self, ino: Ino) -> bool {
        self.vcache.is_constructed(ino)
    }

    fn with_node<T>(&self, ino: Ino, f: impl FnOnce(&Arc<Node>) -> Result<T>) -> Result<T> {
        let node = self.get_vnode(ino)?;
        let result = f(&node);
        self.put_vnode(node.ino());
        result
    }

    /// Rebuild a node from the directory identified by its location.
    fn read_vnode(&self, ino: Ino, loc: u64) -> Result<Node> {
        let dir_cluster = (loc >> 32) as u32;
        let low = loc as u32;

        let mut stream = crate::dir::DirStream::new(self, dir_cluster);
        while let Some((slot, raw)) = stream.next_slot()? {
            match crate::entry::classify_raw(&raw) {
                crate::entry::RawKind::Free => break,
                crate::entry::RawKind::Short => {
                    let entry = ShortDirEntry::from_bytes(&raw);
                    let raw_name = entry.raw_name();
                    if raw_name == *b".          " || raw_name == *b"..         " {
                        continue;
                    }
                    let start = entry.first_cluster();
                    let hit = if start != 0 {
                        start == low
                    } else {
                        slot.index == low
                    };
                    if hit {
                        let parent = if dir_cluster == self.root_dir_cluster() {
                            self.root_ino
                        } else {
                            0 // resolved lazily through `..`
                        };
                        return Ok(Node::from_direntry(
                            ino,
                            parent,
                            dir_cluster,
                            slot.index,
                            &entry,
                        ));
                    }
                }
                _ => {}
            }
        }
        Err(Error::NotFound)
    }

    /// The inode of `node`'s parent directory, resolved through `..` on
    /// first use and cached on the node afterwards.
    pub(crate) fn parent_of(&self, node: &Node) -> Result<Ino> {
        let cached = node.parent_ino();
        if cached != 0 {
            return Ok(cached);
        }
        let dir_cluster = node.state().read().dir_cluster;
        let root = self.root_dir_cluster();
        let ino = if dir_cluster == root || dir_cluster == 0 {
            self.root_ino
        } else {
            // `..` of the parent directory names the grandparent, which is
            // what the parent's own location encoding needs.
            let dotdot = self.io.read_sector(
                dir_cluster,
                0,
                DIRENT_SIZE,
                |r: &[u8; DIRENT_SIZE]| ShortDirEntry::from_bytes(r),
            )?;
            let grandparent = match dotdot.first_cluster() {
                0 => root,
                c => c,
            };
            self.vcache
                .assign_ino(dir_cluster_loc(grandparent, dir_cluster))
        };
        node.set_parent_ino(ino);
        Ok(ino)
    }

    // ----- operations ---------------------------------------------------

    pub fn lookup(&self, dir_ino: Ino, name: &str) -> Result<Ino> {
        self.with_node(dir_ino, |dir| {
            if !dir.is_directory() {
                return Err(Error::NotDirectory);
            }
            if name == "." {
                return Ok(dir.ino());
            }
            if name == ".." {
                return self.parent_of(dir);
            }
            let dir_key = dir.state().read().chain.start;
            let hit = self
                .escalate(self.dir_lookup(dir_key, name), "directory scan")?
                .ok_or(Error::NotFound)?;
            let loc = self.natural_loc(dir_key, hit.entry.first_cluster(), hit.slot);
            let ino = self.vcache.assign_ino(loc);
            if let Some(node) = self.nodes.peek(ino) {
                node.set_parent_ino(dir.ino());
            }
            Ok(ino)
        })
    }

    pub fn create(&self, dir_ino: Ino, name: &str, excl: bool, trunc: bool) -> Result<Ino> {
        self.check_writable()?;
        check_name(name)?;
        self.with_node(dir_ino, |dir| {
            if !dir.is_directory() {
                return Err(Error::NotDirectory);
            }
            if dir.is_removed() {
                return Err(Error::NotFound);
            }
            // Serialize mutations of this directory.
            let dir_state = dir.state().write();
            let dir_key = dir_state.chain.start;

            if let Some(hit) = self.escalate(self.dir_lookup(dir_key, name), "directory scan")? {
                drop(dir_state);
                if excl {
                    return Err(Error::NameTaken);
                }
                if hit.entry.is_directory() {
                    return Err(Error::IsDirectory);
                }
                let loc = self.natural_loc(dir_key, hit.entry.first_cluster(), hit.slot);
                let ino = self.vcache.assign_ino(loc);
                if trunc {
                    self.with_node(ino, |node| self.truncate_node(node, 0))?;
                    self.hooks.notify_stat_changed(ino);
                }
                return Ok(ino);
            }

            let short = name::long_to_short(name, self.cp, |raw| {
                self.short_name_exists(dir_key, raw)
            })?;
            let now = self.now();
            let mut entry = ShortDirEntry::new(&short, ATTR_ARCHIVE, 0);
            entry.set_created(now);
            entry.set_modified(now);
            entry.set_accessed_date(now.date);

            let slot = self.escalate(self.dir_insert(dir_key, name, &entry), "entry insert")?;
            drop(dir_state);

            let ino = self.vcache.assign_ino(dir_index_loc(dir_key, slot));
            if self.write_through() {
                self.cache.sync_all()?;
            }
            self.hooks.notify_entry_created(dir_ino, name, ino);
            Ok(ino)
        })
    }

    pub fn mkdir(&self, dir_ino: Ino, name: &str) -> Result<Ino> {
        self.check_writable()?;
        check_name(name)?;
        self.with_node(dir_ino, |dir| {
            if !dir.is_directory() {
                return Err(Error::NotDirectory);
            }
            if dir.is_removed() {
                return Err(Error::NotFound);
            }
            let dir_state = dir.state().write();
            let dir_key = dir_state.chain.start;

            if self
                .escalate(self.dir_lookup(dir_key, name), "directory scan")?
                .is_some()
            {
                return Err(Error::NameTaken);
            }

            let cluster = self.fat.allocate_chain(1, self.fat.next_free_hint())?;
            let now = self.now();
            // `..` spells the root as cluster 0 whatever the FAT width.
            let dotdot = if dir_key == self.root_dir_cluster() {
                0
            } else {
                dir_key
            };
            if let Err(e) = self.make_empty_dir(cluster, dotdot, now) {
                let _ = self.fat.free_chain(cluster, |c| self.io.discard_cluster(c));
                return Err(e);
            }

            let short = name::long_to_short(name, self.cp, |raw| {
                self.short_name_exists(dir_key, raw)
            })?;
            let mut entry = ShortDirEntry::new(&short, ATTR_DIRECTORY, cluster);
            entry.set_created(now);
            entry.set_modified(now);
            entry.set_accessed_date(now.date);

            let insert = self.escalate(self.dir_insert(dir_key, name, &entry), "entry insert");
            let _slot = match insert {
                Ok(slot) => slot,
                Err(e) => {
                    let _ = self.fat.free_chain(cluster, |c| self.io.discard_cluster(c));
                    return Err(e);
                }
            };
            drop(dir_state);

            let ino = self.vcache.assign_ino(dir_cluster_loc(dir_key, cluster));
            if self.write_through() {
                self.cache.sync_all()?;
            }
            self.hooks.notify_entry_created(dir_ino, name, ino);
            Ok(ino)
        })
    }

    /// Shared tail of unlink/rmdir once the entry is gone from the
    /// directory: detach or reclaim the node and its chain.
    fn reap_entry(&self, dir_key: u32, entry: &ShortDirEntry, slot: u32) {
        let loc = self.natural_loc(dir_key, entry.first_cluster(), slot);
        let ino = match self.vcache.loc_to_ino(loc) {
            Some(ino) => ino,
            None => {
                // Nobody ever referenced it; reclaim immediately.
                let start = entry.first_cluster();
                if start != 0 {
                    if let Err(e) = self.fat.free_chain(start, |c| self.io.discard_cluster(c)) {
                        log::warn!("unlink: freeing chain {} failed: {}", start, e);
                    }
                }
                return;
            }
        };
        if let Some(node) = self.nodes.peek(ino) {
            // Still open somewhere: the chain survives until the last
            // reference goes, but the location must become reusable now.
            node.mark_removed();
            let ghost = self.vcache.new_artificial();
            if self.vcache.set_location(ino, ghost).is_err() {
                log::warn!("unlink: could not move {:#x} to artificial space", ino);
            }
        } else {
            let start = entry.first_cluster();
            if start != 0 {
                if let Err(e) = self.fat.free_chain(start, |c| self.io.discard_cluster(c)) {
                    log::warn!("unlink: freeing chain {} failed: {}", start, e);
                }
            }
            self.vcache.forget(ino);
        }
    }

    pub fn unlink(&self, dir_ino: Ino, name: &str) -> Result<()> {
        self.check_writable()?;
        if name == "." || name == ".." {
            return Err(Error::InvalidArg);
        }
        self.with_node(dir_ino, |dir| {
            if !dir.is_directory() {
                return Err(Error::NotDirectory);
            }
            let dir_state = dir.state().write();
            let dir_key = dir_state.chain.start;

            let hit = self
                .escalate(self.dir_lookup(dir_key, name), "directory scan")?
                .ok_or(Error::NotFound)?;
            if hit.entry.is_directory() {
                return Err(Error::IsDirectory);
            }
            let removed_ino = self
                .vcache
                .loc_to_ino(self.natural_loc(dir_key, hit.entry.first_cluster(), hit.slot))
                .unwrap_or(0);
            self.escalate(self.dir_remove(dir_key, hit.slot), "entry removal")?;
            drop(dir_state);

            self.reap_entry(dir_key, &hit.entry, hit.slot);
            self.dir_compact(dir_key);
            if self.write_through() {
                self.cache.sync_all()?;
            }
            self.hooks.notify_entry_removed(dir_ino, name, removed_ino);
            Ok(())
        })
    }

    pub fn rmdir(&self, dir_ino: Ino, name: &str) -> Result<()> {
        self.check_writable()?;
        if name == "." || name == ".." {
            return Err(Error::InvalidArg);
        }
        self.with_node(dir_ino, |dir| {
            if !dir.is_directory() {
                return Err(Error::NotDirectory);
            }
            let dir_state = dir.state().write();
            let dir_key = dir_state.chain.start;

            let hit = self
                .escalate(self.dir_lookup(dir_key, name), "directory scan")?
                .ok_or(Error::NotFound)?;
            if !hit.entry.is_directory() {
                return Err(Error::NotDirectory);
            }
            let child = hit.entry.first_cluster();
            if !self.escalate(self.dir_is_empty(child), "empty check")? {
                return Err(Error::NotEmpty);
            }
            self.escalate(self.dir_remove(dir_key, hit.slot), "entry removal")?;
            drop(dir_state);

            self.reap_entry(dir_key, &hit.entry, hit.slot);
            self.dir_compact(dir_key);
            if self.write_through() {
                self.cache.sync_all()?;
            }
            self.hooks.notify_entry_removed(dir_ino, name, 0);
            Ok(())
        })
    }

    pub fn rename(
        &self,
        old_dir_ino: Ino,
        old_name: &str,
        new_dir_ino: Ino,
        new_name: &str,
    ) -> Result<()> {
        self.check_writable()?;
        check_name(new_name)?;
        if old_name == "." || old_name == ".." {
            return Err(Error::InvalidArg);
        }
        if name::is_reserved_device_name(new_name) {
            return Err(Error::BadName);
        }
        // One rename at a time per volume.
        let _vol = self.vol_lock.lock();

        if old_dir_ino == new_dir_ino && old_name == new_name {
            return Ok(());
        }

        self.with_node(old_dir_ino, |old_dir| {
            self.with_node(new_dir_ino, |new_dir| {
                if !old_dir.is_directory() || !new_dir.is_directory() {
                    return Err(Error::NotDirectory);
                }
                if new_dir.is_removed() {
                    return Err(Error::NotFound);
                }
                let old_key = old_dir.state().read().chain.start;
                let new_key = new_dir.state().read().chain.start;

                let hit = self
                    .escalate(self.dir_lookup(old_key, old_name), "directory scan")?
                    .ok_or(Error::NotFound)?;
                let moving_dir = hit.entry.is_directory();
                let start = hit.entry.first_cluster();

                // Moving a directory under itself would orphan the subtree.
                if moving_dir && old_key != new_key {
                    let _walk = self.checkpath.write();
                    if start == new_key || self.is_ancestor(start, new_key)? {
                        return Err(Error::InvalidArg);
                    }
                }

                let ino = self
                    .vcache
                    .loc_to_ino(self.natural_loc(old_key, start, hit.slot))
                    .unwrap_or_else(|| {
                        self.vcache
                            .assign_ino(self.natural_loc(old_key, start, hit.slot))
                    });

                let case_only = old_dir_ino == new_dir_ino
                    && old_name.eq_ignore_ascii_case(new_name)
                    && old_name != new_name;

                let mut entry = hit.entry;
                entry.set_modified(self.now());

                let new_slot;
                if case_only {
                    // Delete first so the duplicate scan cannot see the old
                    // spelling of the same file.
                    self.escalate(self.dir_remove(old_key, hit.slot), "entry removal")?;
                    let short = name::long_to_short(new_name, self.cp, |raw| {
                        self.short_name_exists(new_key, raw)
                    })?;
                    let mut renamed = entry;
                    renamed.set_name_bytes(&short);
                    new_slot =
                        self.escalate(self.dir_insert(new_key, new_name, &renamed), "insert")?;
                } else {
                    if let Some(existing) =
                        self.escalate(self.dir_lookup(new_key, new_name), "directory scan")?
                    {
                        // Replace semantics, with the usual guards.
                        if existing.entry.is_directory() {
                            if !moving_dir {
                                return Err(Error::IsDirectory);
                            }
                            if !self
                                .escalate(self.dir_is_empty(existing.entry.first_cluster()), "empty check")?
                            {
                                return Err(Error::NotEmpty);
                            }
                        } else if moving_dir {
                            return Err(Error::NotDirectory);
                        }
                        self.escalate(self.dir_remove(new_key, existing.slot), "entry removal")?;
                        self.reap_entry(new_key, &existing.entry, existing.slot);
                    }
                    let short = name::long_to_short(new_name, self.cp, |raw| {
                        self.short_name_exists(new_key, raw)
                    })?;
                    let mut renamed = entry;
                    renamed.set_name_bytes(&short);
                    new_slot =
                        self.escalate(self.dir_insert(new_key, new_name, &renamed), "insert")?;
                    self.escalate(self.dir_remove(old_key, hit.slot), "entry removal")?;
                }

                // A moved directory's `..` follows it.
                if moving_dir && old_key != new_key {
                    let dotdot = if new_key == self.root_dir_cluster() {
                        0
                    } else {
                        new_key
                    };
                    self.escalate(self.update_dotdot(start, dotdot), "dotdot update")?;
                }

                // The inode keeps its number; only its location moves. If
                // the new natural location is squatted by a ghost, evict
                // the ghost into artificial space first.
                let new_loc = self.natural_loc(new_key, start, new_slot);
                if let Some(squatter) = self.vcache.loc_to_ino(new_loc) {
                    if squatter != ino {
                        let ghost_loc = self.vcache.new_artificial();
                        if self.vcache.set_location(squatter, ghost_loc).is_err() {
                            log::warn!("rename: ghost eviction failed for {:#x}", squatter);
                        }
                    }
                }
                if self.vcache.set_location(ino, new_loc).is_err() {
                    log::warn!("rename: location update failed for {:#x}", ino);
                }

                if let Some(node) = self.nodes.peek(ino) {
                    let mut state = node.state().write();
                    state.dir_cluster = new_key;
                    state.slot = new_slot;
                    drop(state);
                    node.set_parent_ino(new_dir_ino);
                }

                self.dir_compact(old_key);
                if self.write_through() {
                    self.cache.sync_all()?;
                }
                self.hooks
                    .notify_entry_moved(old_dir_ino, old_name, new_dir_ino, new_name, ino);
                Ok(())
            })
        })
    }

    /// Whether `ancestor` appears on the `..` path from `below` to the
    /// root. Called with the checkpath lock write-held.
    fn is_ancestor(&self, ancestor: u32, below: u32) -> Result<bool> {
        let root = self.root_dir_cluster();
        let mut cluster = below;
        let mut steps = 0u32;
        while cluster != root {
            if cluster == ancestor {
                return Ok(true);
            }
            if steps > self.fat.max_cluster() {
                self.mark_corrupt("directory tree cycle");
                return Err(Error::Corrupt);
            }
            let dotdot = self.io.read_sector(
                cluster,
                0,
                DIRENT_SIZE,
                |r: &[u8; DIRENT_SIZE]| ShortDirEntry::from_bytes(r),
            )?;
            cluster = match dotdot.first_cluster() {
                0 => root,
                c => c,
            };
            steps += 1;
        }
        Ok(false)
    }

    pub fn read(&self, ino: Ino, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.with_node(ino, |node| {
            if node.is_directory() {
                return Err(Error::IsDirectory);
            }
            let read = self.escalate(self.file_read_at(node, pos, buf), "file read")?;
            if !self.is_read_only() {
                let today = self.now().date;
                let mut state = node.state().write();
                if state.accessed_date != today {
                    state.accessed_date = today;
                    state.dirty = true;
                }
            }
            Ok(read)
        })
    }

    pub fn write(&self, ino: Ino, pos: u64, buf: &[u8]) -> Result<usize> {
        self.check_writable()?;
        self.with_node(ino, |node| {
            if node.is_directory() {
                return Err(Error::IsDirectory);
            }
            let end = pos
                .checked_add(buf.len() as u64)
                .filter(|&e| e <= u32::MAX as u64)
                .ok_or(Error::NoSpace)?;
            let size = node.state().read().size as u64;
            if end > size && !buf.is_empty() {
                self.escalate(self.truncate_node(node, end as u32), "file extension")?;
            }
            let written = self.escalate(self.file_write_at(node, pos, buf), "file write")?;

            {
                let mut state = node.state().write();
                state.modified = self.now();
                state.attr |= ATTR_ARCHIVE;
                state.dirty = true;
            }
            if self.write_through() {
                self.flush_node(node)?;
                self.file_sync(node)?;
            }
            if node.should_notify(self.hooks.now_unix()) {
                self.hooks.notify_stat_changed(node.ino());
            }
            Ok(written)
        })
    }

    pub fn truncate(&self, ino: Ino, size: u64) -> Result<()> {
        self.check_writable()?;
        if size > u32::MAX as u64 {
            return Err(Error::NoSpace);
        }
        self.with_node(ino, |node| {
            if node.is_directory() {
                return Err(Error::IsDirectory);
            }
            self.escalate(self.truncate_node(node, size as u32), "truncate")?;
            self.hooks.notify_stat_changed(node.ino());
            Ok(())
        })
    }

    /// Bring a file to `new_size` bytes.
    ///
    /// The FAT work happens with the node write-locked and the `resizing`
    /// flag up; the zero fill of a grown tail happens after both are
    /// dropped, through the ordinary write path, so the file cache's
    /// re-entrant page fetches cannot deadlock against us.
    pub(crate) fn truncate_node(&self, node: &Arc<Node>, new_size: u32) -> Result<()> {
        let bpc = self.io.bytes_per_cluster();

        let mut state = node.state().write();
        let old_size = state.size;
        if new_size == old_size {
            return Ok(());
        }
        node.set_resizing(true);

        let old_start = state.chain.start;
        let current_clusters = ((old_size as u64 + bpc as u64 - 1) / bpc as u64) as u32;
        let new_clusters = (new_size as u64 + bpc as u64 - 1) / bpc as u64;

        let result = self.fat.set_chain_length(
            &mut state.chain,
            new_clusters as u32,
            current_clusters,
            |c| self.io.discard_cluster(c),
        );
        if let Err(e) = result {
            node.set_resizing(false);
            return Err(e);
        }
        state.size = new_size;
        state.modified = self.now();
        state.dirty = true;
        let new_start = state.chain.start;
        let dir_key = state.dir_cluster;
        let slot = state.slot;
        drop(state);

        // An empty<->nonempty transition changes the location encoding.
        if new_start != old_start && !node.is_removed() {
            let new_loc = self.natural_loc(dir_key, new_start, slot);
            if let Some(squatter) = self.vcache.loc_to_ino(new_loc) {
                if squatter != node.ino() {
                    let ghost = self.vcache.new_artificial();
                    let _ = self.vcache.set_location(squatter, ghost);
                }
            }
            if self.vcache.set_location(node.ino(), new_loc).is_err() {
                log::warn!("truncate: location update failed for {:#x}", node.ino());
            }
        }

        // Entry on disk next, so enumeration sees a consistent start
        // cluster even before the next sync.
        self.flush_node(node)?;

        node.set_resizing(false);
        if new_size > old_size {
            self.file_zero_range(node, old_size as u64, new_size as u64)?;
        }
        Ok(())
    }

    /// Write back the node's directory entry if any cached field changed.
    pub(crate) fn flush_node(&self, node: &Arc<Node>) -> Result<()> {
        if node.is_removed() || node.ino() == self.root_ino {
            return Ok(());
        }
        let state = node.state().read();
        if !state.dirty {
            return Ok(());
        }
        let (dir_key, slot) = (state.dir_cluster, state.slot);
        let chain_start = state.chain.start;
        let size = state.size;
        let attr = state.attr;
        let created = state.created;
        let modified = state.modified;
        let accessed = state.accessed_date;
        drop(state);

        self.modify_short_entry(dir_key, slot, |entry| {
            entry.set_first_cluster(chain_start);
            if attr & ATTR_DIRECTORY == 0 {
                entry.set_file_size(size);
            }
            entry.set_attr(attr);
            entry.set_created(created);
            entry.set_modified(modified);
            entry.set_accessed_date(accessed);
        })?;
        node.state().write().dirty = false;
        Ok(())
    }

    pub fn readdir(&self, ino: Ino, cookie: u32) -> Result<Option<(u32, Dirent)>> {
        self.with_node(ino, |dir| {
            if !dir.is_directory() {
                return Err(Error::NotDirectory);
            }
            // `.` and `..` are synthesized so every directory, the root
            // included, enumerates them first.
            if cookie == 0 {
                return Ok(Some((
                    1,
                    Dirent {
                        ino: dir.ino(),
                        name: ".".into(),
                        is_directory: true,
                    },
                )));
            }
            if cookie == 1 {
                return Ok(Some((
                    2,
                    Dirent {
                        ino: self.parent_of(dir)?,
                        name: "..".into(),
                        is_directory: true,
                    },
                )));
            }
            let dir_key = dir.state().read().chain.start;
            let mut at = cookie - 2;
            loop {
                let next = self.escalate(self.dir_next_entry(dir_key, at), "directory scan")?;
                let Some((next_slot, hit)) = next else {
                    return Ok(None);
                };
                at = next_slot;
                let raw_name = hit.entry.raw_name();
                if raw_name == *b".          " || raw_name == *b"..         " {
                    continue;
                }
                let loc = self.natural_loc(dir_key, hit.entry.first_cluster(), hit.slot);
                let ino = self.vcache.assign_ino(loc);
                return Ok(Some((
                    next_slot + 2,
                    Dirent {
                        ino,
                        name: hit.display_name,
                        is_directory: hit.entry.is_directory(),
                    },
                )));
            }
        })
    }

    pub fn stat(&self, ino: Ino) -> Result<Stat> {
        self.with_node(ino, |node| {
            let tz = self.hooks.tz_offset_secs();
            let bpc = self.io.bytes_per_cluster();
            let spc = self.io.sectors_per_cluster();
            let state = node.state().read();
            let clusters = if state.chain.start == 0 {
                0
            } else {
                self.fat.count_chain(state.chain.start)?
            };
            let is_dir = state.attr & ATTR_DIRECTORY != 0;
            let size = if is_dir {
                clusters as u64 * bpc as u64
            } else {
                state.size as u64
            };
            let mut mode = if is_dir { 0o40755 } else { 0o100644 };
            if state.attr & ATTR_READ_ONLY != 0 || self.is_read_only() {
                mode &= !0o222;
            }
            let accessed = DosTimestamp {
                date: state.accessed_date,
                time: 0,
                tenths: 0,
            };
            let stat = Stat {
                ino: node.ino(),
                parent_ino: node.parent_ino(),
                size,
                block_size: bpc,
                blocks: clusters as u64 * spc as u64,
                is_directory: is_dir,
                mode,
                uid: self.opts.uid,
                gid: self.opts.gid,
                created_unix: state.created.to_unix(tz),
                modified_unix: state.modified.to_unix(tz),
                accessed_unix: accessed.to_unix(tz),
                mime: state.mime.clone(),
            };
            Ok(stat)
        })
    }

    /// Attach a sniffed media type to a live node. Best effort by design.
    pub fn set_mime(&self, ino: Ino, mime: Option<String>) {
        if let Some(node) = self.nodes.peek(ino) {
            node.state().write().mime = mime;
            self.hooks.notify_attribute_changed(ino);
        }
    }

    pub fn fsync(&self, ino: Ino) -> Result<()> {
        self.with_node(ino, |node| {
            self.file_sync(node)?;
            self.flush_node(node)?;
            self.fat.sync()?;
            // And the sectors holding the directory entry itself.
            let dir_key = node.state().read().dir_cluster;
            if dir_key != 0 {
                self.io.sync_cluster(dir_key)?;
            }
            Ok(())
        })
    }

    pub fn sync(&self) -> Result<()> {
        for node in self.nodes.live_nodes() {
            if let Err(e) = self.flush_node(&node) {
                log::warn!("sync: node {:#x} flush failed: {}", node.ino(), e);
            }
        }
        self.write_fsinfo()?;
        self.cache.sync_all()?;
        for node in self.nodes.live_nodes() {
            if !node.is_directory() {
                self.file_sync(&node)?;
            }
        }
        Ok(())
    }

    fn write_fsinfo(&self) -> Result<()> {
        if self.kind != FatType::Fat32 || self.bpb.fsinfo_sector == 0 || self.is_read_only() {
            return Ok(());
        }
        let info = FsInfo {
            free_count: self.fat.free_count(),
            next_free: self.fat.next_free_hint(),
        };
        self.cache
            .modify_sector(self.bpb.fsinfo_sector as u64, 0, |s: &mut [u8; SECTOR_SIZE]| {
                info.encode(s)
            })?;
        self.fsinfo_dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub fn read_fs_stat(&self) -> FsStat {
        let spc = self.io.sectors_per_cluster();
        let total =
            (self.bpb.total_sectors - self.bpb.first_data_sector()) as u64 / spc as u64;
        FsStat {
            block_size: self.io.bytes_per_cluster(),
            total_blocks: total,
            free_blocks: self.fat.free_count() as u64,
            volume_name: name::label_display(&self.label.lock(), self.cp),
            read_only: self.is_read_only(),
        }
    }

    /// Rewrite the volume label: the unique root entry, the BPB copy, and
    /// the in-memory copy, under the volume mutex.
    pub fn set_volume_label(&self, new_label: &str) -> Result<()> {
        self.check_writable()?;
        let raw = name::label_from_str(new_label, self.cp)?;
        let _vol = self.vol_lock.lock();
        self.write_label_entry(&raw)?;
        if self.bpb.boot_signature == crate::bpb::EXT_BOOT_SIGNATURE {
            let offset = if self.kind == FatType::Fat32 { 0x47 } else { 0x2B };
            self.cache
                .modify_sector(0, offset, |l: &mut [u8; 11]| l.copy_from_slice(&raw))?;
        }
        *self.label.lock() = raw;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests_support::MemDisk;
    use crate::entry::{classify_raw, LongDirEntry, RawKind};
    use crate::fat::Cluster;
    use crate::mkfs::{mkfs, MkfsParams};
    use crate::vfs::NullHooks;

    fn mounted(sectors: u64, fat_bits: Option<u8>, label: Option<&str>) -> Arc<Volume> {
        let disk: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(sectors));
        mkfs(
            Arc::clone(&disk),
            &MkfsParams {
                fat_bits,
                label: label.map(|l| l.into()),
                volume_id: 0xDEAD_BEEF,
            },
        )
        .unwrap();
        Volume::mount(disk, MountOptions::default(), Arc::new(NullHooks)).unwrap()
    }

    fn list_root(vol: &Volume) -> alloc::vec::Vec<String> {
        let mut names = alloc::vec::Vec::new();
        let mut cookie = 0;
        while let Some((next, dirent)) = vol.readdir(vol.root_ino(), cookie).unwrap() {
            names.push(dirent.name);
            cookie = next;
        }
        names
    }

    #[test]
    fn mounted_fat12_image_stats_and_empty_root() {
        let vol = mounted(2048, None, Some("TESTVOL"));
        assert_eq!(vol.kind, FatType::Fat12);

        let stat = vol.read_fs_stat();
        assert!(stat.volume_name.eq_ignore_ascii_case("TESTVOL"));
        assert_eq!(
            stat.block_size,
            SECTOR_SIZE as u32 * vol.bpb.sectors_per_cluster as u32
        );
        assert_eq!(
            stat.total_blocks,
            ((vol.bpb.total_sectors - vol.bpb.first_data_sector())
                / vol.bpb.sectors_per_cluster as u32) as u64
        );

        // Only the synthesized dot entries; the label entry is not a file.
        assert_eq!(list_root(&vol), alloc::vec![".", ".."]);
    }

    #[test]
    fn create_write_read_unlink_restores_free_count() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let baseline = vol.fat.free_count();

        let ino = vol.create(root, "a.txt", false, false).unwrap();
        assert_eq!(vol.write(ino, 0, b"hello").unwrap(), 5);

        let found = vol.lookup(root, "a.txt").unwrap();
        assert_eq!(found, ino);
        let mut buf = [0u8; 16];
        assert_eq!(vol.read(found, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        vol.unlink(root, "a.txt").unwrap();
        assert_eq!(vol.lookup(root, "a.txt"), Err(Error::NotFound));
        assert_eq!(vol.fat.free_count(), baseline);
    }

    #[test]
    fn long_name_round_trip_and_on_disk_shape() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let ino = vol
            .create(root, "A file with a long name.txt", false, false)
            .unwrap();

        // Case-insensitive lookup resolves to the same inode.
        let found = vol
            .lookup(root, "A FILE WITH A LONG NAME.TXT")
            .unwrap();
        assert_eq!(found, ino);

        // On disk: three long-name slots directly before the short entry,
        // every one carrying the short name's checksum, and the alias ends
        // in ~1.
        let mut stream = crate::dir::DirStream::new(&vol, vol.root_dir_cluster());
        let mut lfn_run: alloc::vec::Vec<LongDirEntry> = alloc::vec::Vec::new();
        let mut checked = false;
        while let Some((_, raw)) = stream.next_slot().unwrap() {
            match classify_raw(&raw) {
                RawKind::Free => break,
                RawKind::LongName => lfn_run.push(LongDirEntry::from_bytes(&raw)),
                RawKind::Short => {
                    let entry = ShortDirEntry::from_bytes(&raw);
                    let name = entry.raw_name();
                    if &name[..8] == b"AFILEW~1" {
                        assert_eq!(lfn_run.len(), 3);
                        for lde in &lfn_run {
                            assert_eq!(lde.checksum(), entry.checksum());
                        }
                        assert!(lfn_run[0].is_last());
                        checked = true;
                    }
                    lfn_run.clear();
                }
                _ => lfn_run.clear(),
            }
        }
        assert!(checked);
    }

    #[test]
    fn rename_within_and_across_directories() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let d1 = vol.mkdir(root, "d1").unwrap();
        let d2 = vol.mkdir(root, "d2").unwrap();

        let x = vol.create(d1, "x", false, false).unwrap();
        vol.write(x, 0, b"payload").unwrap();
        let x = vol.lookup(d1, "x").unwrap();

        // Same-name rename is a no-op that succeeds.
        vol.rename(d1, "x", d1, "x").unwrap();

        vol.rename(d1, "x", d2, "x").unwrap();
        assert_eq!(vol.lookup(d1, "x"), Err(Error::NotFound));
        assert_eq!(vol.lookup(d2, "x").unwrap(), x);

        // Directory move updates the child's `..`.
        let sub = vol.mkdir(d1, "sub").unwrap();
        vol.rename(d1, "sub", d2, "sub").unwrap();
        assert_eq!(vol.lookup(d2, "sub").unwrap(), sub);
        let d2_cluster = {
            let node = vol.get_vnode(d2).unwrap();
            let c = node.state().read().chain.start;
            vol.put_vnode(d2);
            c
        };
        let sub_cluster = {
            let node = vol.get_vnode(sub).unwrap();
            let c = node.state().read().chain.start;
            vol.put_vnode(sub);
            c
        };
        let dotdot = vol
            .io
            .read_sector(sub_cluster, 0, DIRENT_SIZE, |r: &[u8; DIRENT_SIZE]| {
                ShortDirEntry::from_bytes(r)
            })
            .unwrap();
        assert_eq!(dotdot.first_cluster(), d2_cluster);

        // And the parent resolves through the moved `..`.
        assert_eq!(vol.lookup(sub, "..").unwrap(), d2);
    }

    #[test]
    fn rename_into_own_subtree_is_rejected() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let a = vol.mkdir(root, "a").unwrap();
        let b = vol.mkdir(a, "b").unwrap();
        let _ = b;
        assert_eq!(vol.rename(root, "a", b, "a"), Err(Error::InvalidArg));
    }

    #[test]
    fn case_only_rename_preserves_inode() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        vol.create(root, "Readme.txt", false, false).unwrap();
        let before = vol.lookup(root, "Readme.txt").unwrap();
        vol.rename(root, "Readme.txt", root, "README.TXT").unwrap();
        let after = vol.lookup(root, "README.TXT").unwrap();
        assert_eq!(before, after);
        // The new spelling is what enumeration shows.
        assert!(list_root(&vol).contains(&String::from("README.TXT")));
    }

    #[test]
    fn truncate_extension_zero_fills() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let ino = vol.create(root, "grow.bin", false, false).unwrap();
        vol.write(ino, 0, b"0123456789").unwrap();
        vol.truncate(ino, 20).unwrap();

        let mut buf = [0xAAu8; 20];
        assert_eq!(vol.read(ino, 0, &mut buf).unwrap(), 20);
        assert_eq!(&buf[..10], b"0123456789");
        assert_eq!(&buf[10..], &[0u8; 10]);
    }

    #[test]
    fn cluster_boundary_allocation() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let bpc = vol.io.bytes_per_cluster() as usize;
        let ino = vol.create(root, "edge.bin", false, false).unwrap();
        vol.write(ino, 0, &alloc::vec![7u8; bpc]).unwrap();
        let after_fill = vol.fat.free_count();

        // Rewriting the last byte stays within the cluster.
        vol.write(ino, bpc as u64 - 1, b"x").unwrap();
        assert_eq!(vol.fat.free_count(), after_fill);

        // One byte past the boundary costs exactly one cluster.
        vol.write(ino, bpc as u64, b"y").unwrap();
        assert_eq!(vol.fat.free_count(), after_fill - 1);

        // A zero-length write allocates nothing.
        let before = vol.fat.free_count();
        assert_eq!(vol.write(ino, 10 * bpc as u64, b"").unwrap(), 0);
        assert_eq!(vol.fat.free_count(), before);
    }

    #[test]
    fn unlink_of_open_file_defers_reclaim() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let ino = vol.create(root, "held.bin", false, false).unwrap();
        vol.write(ino, 0, b"keep me around").unwrap();
        let baseline = vol.fat.free_count();

        // Hold a reference across the unlink.
        let node = vol.get_vnode(ino).unwrap();
        vol.unlink(root, "held.bin").unwrap();
        assert_eq!(vol.lookup(root, "held.bin"), Err(Error::NotFound));
        // Chain still allocated while the node is referenced.
        assert_eq!(vol.fat.free_count(), baseline);
        // Reads still work on the open node.
        let mut buf = [0u8; 14];
        assert_eq!(vol.file_read_at(&node, 0, &mut buf).unwrap(), 14);

        vol.put_vnode(ino);
        assert_eq!(vol.fat.free_count(), baseline + 1);
    }

    #[test]
    fn excl_and_trunc_flags() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let ino = vol.create(root, "file", false, false).unwrap();
        vol.write(ino, 0, b"contents").unwrap();

        assert_eq!(vol.create(root, "file", true, false), Err(Error::NameTaken));

        let again = vol.create(root, "file", false, true).unwrap();
        assert_eq!(again, ino);
        let mut buf = [0u8; 8];
        assert_eq!(vol.read(ino, 0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn mkdir_rmdir_and_empty_check() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let d = vol.mkdir(root, "dir").unwrap();
        let _f = vol.create(d, "inner", false, false).unwrap();

        assert_eq!(vol.rmdir(root, "dir"), Err(Error::NotEmpty));
        vol.unlink(d, "inner").unwrap();
        vol.rmdir(root, "dir").unwrap();
        assert_eq!(vol.lookup(root, "dir"), Err(Error::NotFound));

        // Creating inside it afterwards is impossible; the name is gone.
        assert_eq!(vol.lookup(root, "dir"), Err(Error::NotFound));
    }

    #[test]
    fn fat12_root_directory_fills_up() {
        let vol = mounted(2048, None, None);
        let root = vol.root_ino();
        let mut made = 0u32;
        let result = loop {
            let name = alloc::format!("f{}", made);
            match vol.create(root, &name, false, false) {
                Ok(_) => made += 1,
                Err(e) => break e,
            }
            if made > 200 {
                panic!("fixed root never filled");
            }
        };
        assert_eq!(result, Error::NoSpace);
        assert!(made > 0);
    }

    #[test]
    fn fat_cycle_forces_read_only() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        let ino = vol.create(root, "victim.bin", false, false).unwrap();
        vol.write(ino, 0, b"data").unwrap();

        let start = {
            let node = vol.get_vnode(ino).unwrap();
            let c = node.state().read().chain.start;
            vol.put_vnode(ino);
            c
        };
        // Tamper: the chain now points at itself.
        vol.fat.set(start, Cluster::Data(start)).unwrap();

        // The next operation that must walk the chain trips over it...
        let bpc = vol.io.bytes_per_cluster() as u64;
        let err = vol.write(ino, 2 * bpc, b"more").unwrap_err();
        assert!(matches!(err, Error::Corrupt | Error::Io));

        // ...and everything else on the volume is read-only from then on.
        assert!(vol.is_read_only());
        assert_eq!(
            vol.create(root, "other.txt", false, false),
            Err(Error::ReadOnly)
        );
    }

    #[test]
    fn stat_reports_synthesized_ownership() {
        let disk: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(131_072));
        mkfs(Arc::clone(&disk), &MkfsParams::default()).unwrap();
        let vol = Volume::mount(
            disk,
            MountOptions {
                uid: 501,
                gid: 20,
                ..Default::default()
            },
            Arc::new(NullHooks),
        )
        .unwrap();
        let root = vol.root_ino();
        let ino = vol.create(root, "owned", false, false).unwrap();
        vol.write(ino, 0, b"abc").unwrap();

        let stat = vol.stat(ino).unwrap();
        assert_eq!(stat.uid, 501);
        assert_eq!(stat.gid, 20);
        assert_eq!(stat.size, 3);
        assert!(!stat.is_directory);
        assert_eq!(stat.mode & 0o170000, 0o100000);

        let dstat = vol.stat(root).unwrap();
        assert!(dstat.is_directory);
    }

    #[test]
    fn fat32_volume_end_to_end_with_fsinfo() {
        let disk: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(600_000));
        mkfs(
            Arc::clone(&disk),
            &MkfsParams {
                fat_bits: Some(32),
                label: Some("BIGVOL".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let vol = Volume::mount(
            Arc::clone(&disk),
            MountOptions::default(),
            Arc::new(NullHooks),
        )
        .unwrap();
        assert_eq!(vol.kind, FatType::Fat32);
        let root = vol.root_ino();

        let ino = vol.create(root, "hello.txt", false, false).unwrap();
        vol.write(ino, 0, b"fat32").unwrap();
        let free_after = vol.fat.free_count();
        vol.unmount().unwrap();

        // The fsinfo counters were written back on unmount.
        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_blocks(&mut sector, SECTOR_SIZE).unwrap();
        let info = FsInfo::parse(&sector).unwrap();
        assert_eq!(info.free_count, free_after);

        // And the clean-shutdown flag is set again.
        let disk2: Arc<dyn BlockDevice> = disk;
        let vol2 = Volume::mount(disk2, MountOptions::default(), Arc::new(NullHooks)).unwrap();
        let found = vol2.lookup(vol2.root_ino(), "HELLO.TXT").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(vol2.read(found, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"fat32");
    }

    #[test]
    fn read_only_mount_rejects_writes() {
        let disk: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(131_072));
        mkfs(Arc::clone(&disk), &MkfsParams::default()).unwrap();
        let vol = Volume::mount(
            disk,
            MountOptions {
                flags: MountFlags::READ_ONLY,
                ..Default::default()
            },
            Arc::new(NullHooks),
        )
        .unwrap();
        let root = vol.root_ino();
        assert_eq!(vol.create(root, "nope", false, false), Err(Error::ReadOnly));
        assert_eq!(vol.unlink(root, "nope"), Err(Error::ReadOnly));
        assert_eq!(vol.mkdir(root, "nope"), Err(Error::ReadOnly));
    }

    #[test]
    fn volume_label_rewrite() {
        let vol = mounted(131_072, None, Some("OLDLABEL"));
        vol.set_volume_label("NewLabel").unwrap();
        assert_eq!(vol.read_fs_stat().volume_name, "newlabel");
        // Exactly one label entry in the root.
        let (_, raw) = vol.find_label_entry().unwrap().unwrap();
        assert_eq!(&raw, b"NEWLABEL   ");
    }

    #[test]
    fn readdir_enumerates_created_files() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        vol.create(root, "alpha.txt", false, false).unwrap();
        vol.create(root, "a quite long file name.dat", false, false)
            .unwrap();
        vol.mkdir(root, "subdir").unwrap();

        let names = list_root(&vol);
        assert_eq!(names[0], ".");
        assert_eq!(names[1], "..");
        assert!(names.contains(&String::from("alpha.txt")));
        assert!(names.contains(&String::from("a quite long file name.dat")));
        assert!(names.contains(&String::from("subdir")));
    }

    #[test]
    fn bad_names_are_rejected() {
        let vol = mounted(131_072, None, None);
        let root = vol.root_ino();
        assert_eq!(vol.create(root, "a*b", false, false), Err(Error::BadName));
        assert_eq!(vol.create(root, ".", false, false), Err(Error::BadName));
        assert_eq!(vol.create(root, "", false, false), Err(Error::BadName));
        let long: String = core::iter::repeat('x').take(300).collect();
        assert_eq!(
            vol.create(root, &long, false, false),
            Err(Error::NameTooLong)
        );
        // Renaming onto a reserved device name fails outright.
        vol.create(root, "ok.txt", false, false).unwrap();
        assert_eq!(
            vol.rename(root, "ok.txt", root, "aux.txt"),
            Err(Error::BadName)
        );
    }
}
