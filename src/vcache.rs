//! Stable inode numbers for a format that has none.
//!
//! FAT gives a file no persistent identity: the obvious candidate, the
//! starting cluster, does not exist for zero-byte files, and a directory
//! entry's position moves under rename. Inode numbers are therefore derived
//! from the entry's current location and then pinned for the life of the
//! mount by this cache, which maps inode numbers to current locations and
//! back.
//!
//! An inode number is one of:
//!
//! 1. parent-directory start cluster combined with the file's start cluster
//!    (files with data),
//! 2. parent-directory start cluster combined with the slot index of the
//!    entry (zero-byte files),
//! 3. an opaque counter value from the artificial range, used when the
//!    derived number is already taken by some other node (a renamed or
//!    deleted file that is still open).
//!
//! The top four bits partition the 63-bit space: both derived forms have
//! them clear, artificial numbers carry `0b0110`, and `0b1001` patterns are
//! invalid by construction.
//!
//! Buckets are power-of-two sized and chains are kept sorted so misses
//! abort early, the same shape the double hash has always had.

use alloc::vec::Vec;
use spin::RwLock;

use crate::error::{Error, Result};
use crate::Ino;

/// Lower limit of the artificial inode range.
pub const ARTIFICIAL_INO_BITS: u64 = 0x6 << 60;
const INVALID_INO_MASK: u64 = 0x9 << 60;

const BUCKET_COUNT: usize = 512; // must be a power of 2

pub fn is_dir_derived(ino: Ino) -> bool {
    ino & ARTIFICIAL_INO_BITS == 0
}

pub fn is_artificial(ino: Ino) -> bool {
    ino & ARTIFICIAL_INO_BITS == ARTIFICIAL_INO_BITS
}

pub fn is_invalid(ino: Ino) -> bool {
    (!is_dir_derived(ino) && !is_artificial(ino)) || ino & INVALID_INO_MASK != 0
}

/// Location form for a file that owns at least one cluster.
pub fn dir_cluster_loc(dir_cluster: u32, start_cluster: u32) -> u64 {
    ((dir_cluster as u64) << 32) | start_cluster as u64
}

/// Location form for a zero-byte file: directory plus slot index.
pub fn dir_index_loc(dir_cluster: u32, slot: u32) -> u64 {
    ((dir_cluster as u64) << 32) | slot as u64
}

#[derive(Clone, Copy)]
struct VCacheEntry {
    ino: Ino,
    loc: u64,
    constructed: bool,
}

struct Inner {
    by_ino: Vec<Vec<VCacheEntry>>,
    /// (location, inode) pairs, sorted by location.
    by_loc: Vec<Vec<(u64, Ino)>>,
    next_artificial: u64,
}

fn hash(v: u64) -> usize {
    v as usize & (BUCKET_COUNT - 1)
}

impl Inner {
    fn find_ino(&self, ino: Ino) -> Option<VCacheEntry> {
        for e in &self.by_ino[hash(ino)] {
            if e.ino == ino {
                return Some(*e);
            }
            if e.ino > ino {
                break;
            }
        }
        None
    }

    fn find_loc(&self, loc: u64) -> Option<Ino> {
        for &(l, ino) in &self.by_loc[hash(loc)] {
            if l == loc {
                return Some(ino);
            }
            if l > loc {
                break;
            }
        }
        None
    }

    fn insert(&mut self, entry: VCacheEntry) {
        let bucket = &mut self.by_ino[hash(entry.ino)];
        let at = bucket
            .iter()
            .position(|e| e.ino > entry.ino)
            .unwrap_or(bucket.len());
        bucket.insert(at, entry);

        let bucket = &mut self.by_loc[hash(entry.loc)];
        let at = bucket
            .iter()
            .position(|&(l, _)| l > entry.loc)
            .unwrap_or(bucket.len());
        bucket.insert(at, (entry.loc, entry.ino));
    }

    fn remove(&mut self, ino: Ino) -> Option<VCacheEntry> {
        let bucket = &mut self.by_ino[hash(ino)];
        let at = bucket.iter().position(|e| e.ino == ino)?;
        let entry = bucket.remove(at);

        let bucket = &mut self.by_loc[hash(entry.loc)];
        if let Some(at) = bucket.iter().position(|&(_, i)| i == ino) {
            bucket.remove(at);
        }
        Some(entry)
    }
}

pub struct VCache {
    inner: RwLock<Inner>,
}

impl Default for VCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VCache {
    pub fn new() -> Self {
        let mut by_ino = Vec::with_capacity(BUCKET_COUNT);
        let mut by_loc = Vec::with_capacity(BUCKET_COUNT);
        by_ino.resize_with(BUCKET_COUNT, Vec::new);
        by_loc.resize_with(BUCKET_COUNT, Vec::new);
        Self {
            inner: RwLock::new(Inner {
                by_ino,
                by_loc,
                next_artificial: ARTIFICIAL_INO_BITS,
            }),
        }
    }

    /// The inode for a directory-entry location, minting one if needed.
    ///
    /// The natural choice is the location value itself. If some other node
    /// already answers to that number (a ghost of a rename or delete), the
    /// new node gets an artificial number instead so the two never alias.
    pub fn assign_ino(&self, loc: u64) -> Ino {
        let mut inner = self.inner.write();
        if let Some(ino) = inner.find_loc(loc) {
            return ino;
        }
        let ino = if inner.find_ino(loc).is_some() {
            let ino = inner.next_artificial;
            inner.next_artificial += 1;
            ino
        } else {
            loc
        };
        inner.insert(VCacheEntry {
            ino,
            loc,
            constructed: false,
        });
        ino
    }

    /// Next value from the artificial counter, with no mapping installed.
    pub fn new_artificial(&self) -> Ino {
        let mut inner = self.inner.write();
        let ino = inner.next_artificial;
        inner.next_artificial += 1;
        ino
    }

    /// Current location of `ino`.
    pub fn lookup(&self, ino: Ino) -> Option<u64> {
        self.inner.read().find_ino(ino).map(|e| e.loc)
    }

    pub fn loc_to_ino(&self, loc: u64) -> Option<Ino> {
        self.inner.read().find_loc(loc)
    }

    /// Move `ino` to a new location, after a rename or a start-cluster
    /// change. Fails if another inode already claims that location.
    pub fn set_location(&self, ino: Ino, new_loc: u64) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.find_loc(new_loc) {
            Some(existing) if existing != ino => return Err(Error::InvalidArg),
            Some(_) => return Ok(()),
            None => {}
        }
        let entry = inner.remove(ino);
        let constructed = entry.map(|e| e.constructed).unwrap_or(false);
        inner.insert(VCacheEntry {
            ino,
            loc: new_loc,
            constructed,
        });
        Ok(())
    }

    /// Drop the mapping entirely (final release of a deleted node).
    pub fn forget(&self, ino: Ino) {
        self.inner.write().remove(ino);
    }

    pub fn mark_constructed(&self, ino: Ino, constructed: bool) {
        let mut inner = self.inner.write();
        let bucket_index = hash(ino);
        for e in &mut inner.by_ino[bucket_index] {
            if e.ino == ino {
                e.constructed = constructed;
                return;
            }
            if e.ino > ino {
                break;
            }
        }
    }

    pub fn is_constructed(&self, ino: Ino) -> bool {
        self.inner
            .read()
            .find_ino(ino)
            .map(|e| e.constructed)
            .unwrap_or(false)
    }

    /// Every inode currently flagged constructed.
    pub fn constructed_inos(&self) -> Vec<Ino> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for bucket in &inner.by_ino {
            for e in bucket {
                if e.constructed {
                    out.push(e.ino);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ino_space_partitioning() {
        let derived = dir_cluster_loc(9, 1234);
        assert!(is_dir_derived(derived));
        assert!(!is_invalid(derived));
        assert!(is_artificial(ARTIFICIAL_INO_BITS));
        assert!(!is_invalid(ARTIFICIAL_INO_BITS + 7));
        assert!(is_invalid(0x9 << 60));
        assert_ne!(dir_cluster_loc(9, 1234), dir_index_loc(9, 5));
    }

    #[test]
    fn natural_assignment_is_identity() {
        let cache = VCache::new();
        let loc = dir_cluster_loc(2, 55);
        let ino = cache.assign_ino(loc);
        assert_eq!(ino, loc);
        // Idempotent.
        assert_eq!(cache.assign_ino(loc), ino);
        assert_eq!(cache.lookup(ino), Some(loc));
        assert_eq!(cache.loc_to_ino(loc), Some(ino));
    }

    #[test]
    fn occupied_location_yields_artificial_ino() {
        let cache = VCache::new();
        let loc_a = dir_cluster_loc(2, 55);
        let ino_a = cache.assign_ino(loc_a);
        // The node moves away but keeps its number.
        let loc_b = dir_cluster_loc(3, 55);
        cache.set_location(ino_a, loc_b).unwrap();
        // A new file lands on the old location, which is still in use as
        // ino_a's number.
        let ino_c = cache.assign_ino(loc_a);
        assert!(is_artificial(ino_c));
        assert_eq!(cache.lookup(ino_c), Some(loc_a));
        assert_eq!(cache.lookup(ino_a), Some(loc_b));
    }

    #[test]
    fn set_location_refuses_collisions() {
        let cache = VCache::new();
        let a = cache.assign_ino(dir_cluster_loc(2, 10));
        let b = cache.assign_ino(dir_cluster_loc(2, 11));
        assert!(cache.set_location(a, dir_cluster_loc(2, 11)).is_err());
        assert_eq!(cache.lookup(b), Some(dir_cluster_loc(2, 11)));
    }

    #[test]
    fn constructed_flag_tracks() {
        let cache = VCache::new();
        let ino = cache.assign_ino(dir_index_loc(2, 4));
        assert!(!cache.is_constructed(ino));
        cache.mark_constructed(ino, true);
        assert!(cache.is_constructed(ino));
        assert_eq!(cache.constructed_inos(), alloc::vec![ino]);
        cache.mark_constructed(ino, false);
        assert!(!cache.is_constructed(ino));
    }

    #[test]
    fn artificial_counter_is_monotonic() {
        let cache = VCache::new();
        let a = cache.new_artificial();
        let b = cache.new_artificial();
        assert!(b > a);
        assert!(is_artificial(a) && is_artificial(b));
    }

    #[test]
    fn colliding_buckets_stay_sorted() {
        let cache = VCache::new();
        // Same bucket (multiples of 512 apart), inserted out of order.
        let locs = [
            dir_index_loc(3, 512 * 4),
            dir_index_loc(3, 0),
            dir_index_loc(3, 512 * 2),
        ];
        for &loc in &locs {
            cache.assign_ino(loc);
        }
        for &loc in &locs {
            assert_eq!(cache.loc_to_ino(loc), Some(loc));
        }
    }
}
