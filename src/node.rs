//! In-memory state for currently referenced files and directories.
//!
//! A [`Node`] exists from the first `get_vnode` until the host drops the
//! last reference. It mirrors the interesting fields of the on-disk entry
//! (start cluster, size, attributes, times) plus bookkeeping the disk does
//! not carry: the entry's current position in its parent, the cached chain
//! tail, the parent inode, and the transient `resizing` window used by the
//! truncation protocol.
//!
//! Directories resolve their parent lazily through `..` the first time it
//! is needed; only the parent's inode number is stored, never a reference,
//! so renames cannot leave dangling pointers behind.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use spin::RwLock;

use crate::entry::{DosTimestamp, ShortDirEntry};
use crate::fat::Chain;
use crate::{Ino, ATTR_DIRECTORY};

/// Mutable node fields, guarded by the node's rw-lock.
#[derive(Clone)]
pub struct NodeState {
    pub chain: Chain,
    pub attr: u8,
    pub case_flags: u8,
    /// Byte size; 0 for directories.
    pub size: u32,
    pub created: DosTimestamp,
    pub modified: DosTimestamp,
    pub accessed_date: u16,
    /// Start cluster of the parent directory holding our entry.
    pub dir_cluster: u32,
    /// Slot index of our short entry within that directory.
    pub slot: u32,
    /// Sniffed media type, carried in memory only.
    pub mime: Option<String>,
    /// Entry fields changed since the last flush.
    pub dirty: bool,
}

pub struct Node {
    ino: AtomicU64,
    parent: AtomicU64,
    state: RwLock<NodeState>,
    /// True only inside the truncate/extend window; write paths beyond the
    /// pre-resize end must back off while set.
    resizing: AtomicBool,
    /// Unlinked while still open; the chain goes when the last ref does.
    removed: AtomicBool,
    /// Unix time of the last streamed stat notification.
    last_notify: AtomicI64,
}

impl Node {
    pub fn from_direntry(
        ino: Ino,
        parent: Ino,
        dir_cluster: u32,
        slot: u32,
        entry: &ShortDirEntry,
    ) -> Self {
        let start = entry.first_cluster();
        Self {
            ino: AtomicU64::new(ino),
            parent: AtomicU64::new(parent),
            state: RwLock::new(NodeState {
                chain: if start == 0 {
                    Chain::empty()
                } else {
                    Chain::new(start)
                },
                attr: entry.attr(),
                case_flags: entry.case_flags(),
                size: if entry.is_directory() {
                    0
                } else {
                    entry.file_size()
                },
                created: entry.created(),
                modified: entry.modified(),
                accessed_date: entry.accessed_date(),
                dir_cluster,
                slot,
                mime: None,
                dirty: false,
            }),
            resizing: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            last_notify: AtomicI64::new(0),
        }
    }

    /// Synthetic node for the root directory, which has no entry of its own.
    pub fn root(ino: Ino, root_cluster: u32) -> Self {
        Self {
            ino: AtomicU64::new(ino),
            parent: AtomicU64::new(ino),
            state: RwLock::new(NodeState {
                chain: Chain::new(root_cluster),
                attr: ATTR_DIRECTORY,
                case_flags: 0,
                size: 0,
                created: DosTimestamp::default(),
                modified: DosTimestamp::default(),
                accessed_date: 0,
                dir_cluster: 0,
                slot: 0,
                mime: None,
                dirty: false,
            }),
            resizing: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            last_notify: AtomicI64::new(0),
        }
    }

    pub fn ino(&self) -> Ino {
        self.ino.load(Ordering::Acquire)
    }

    /// Rebadge with an artificial number (unlink of an open file, or a
    /// rename landing on our natural number).
    pub fn set_ino(&self, ino: Ino) {
        self.ino.store(ino, Ordering::Release);
    }

    pub fn parent_ino(&self) -> Ino {
        self.parent.load(Ordering::Acquire)
    }

    pub fn set_parent_ino(&self, parent: Ino) {
        self.parent.store(parent, Ordering::Release);
    }

    pub fn state(&self) -> &RwLock<NodeState> {
        &self.state
    }

    pub fn is_directory(&self) -> bool {
        self.state.read().attr & ATTR_DIRECTORY != 0
    }

    pub fn is_resizing(&self) -> bool {
        self.resizing.load(Ordering::Acquire)
    }

    pub fn set_resizing(&self, resizing: bool) {
        self.resizing.store(resizing, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// At most one streamed stat notification per second; returns whether
    /// this caller should fire one.
    pub fn should_notify(&self, now_unix: i64) -> bool {
        let last = self.last_notify.load(Ordering::Relaxed);
        if now_unix > last {
            self.last_notify
                .compare_exchange(last, now_unix, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }
}

struct NodeRef {
    node: Arc<Node>,
    refs: u32,
}

/// Inode-keyed table of live nodes, standing in for the host VFS's vnode
/// table. Reference counts decide when `release` tears a node down.
#[derive(Default)]
pub struct NodeStore {
    map: RwLock<BTreeMap<Ino, NodeRef>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    /// Install a freshly constructed node with one reference.
    pub fn publish(&self, node: Arc<Node>) -> Arc<Node> {
        let mut map = self.map.write();
        let ino = node.ino();
        match map.get_mut(&ino) {
            Some(existing) => {
                existing.refs += 1;
                Arc::clone(&existing.node)
            }
            None => {
                map.insert(
                    ino,
                    NodeRef {
                        node: Arc::clone(&node),
                        refs: 1,
                    },
                );
                node
            }
        }
    }

    /// Take another reference to a live node.
    pub fn acquire(&self, ino: Ino) -> Option<Arc<Node>> {
        let mut map = self.map.write();
        let entry = map.get_mut(&ino)?;
        entry.refs += 1;
        Some(Arc::clone(&entry.node))
    }

    /// Peek without touching the reference count.
    pub fn peek(&self, ino: Ino) -> Option<Arc<Node>> {
        self.map.read().get(&ino).map(|e| Arc::clone(&e.node))
    }

    /// Drop one reference. Returns the node if that was the last one, at
    /// which point the caller finishes teardown (flush, chain reclaim).
    pub fn release(&self, ino: Ino) -> Option<Arc<Node>> {
        let mut map = self.map.write();
        let entry = map.get_mut(&ino)?;
        entry.refs -= 1;
        if entry.refs == 0 {
            return map.remove(&ino).map(|e| e.node);
        }
        None
    }

    /// Rekey a node that moved to an artificial inode number.
    pub fn rekey(&self, old: Ino, new: Ino) {
        let mut map = self.map.write();
        if let Some(entry) = map.remove(&old) {
            entry.node.set_ino(new);
            map.insert(new, entry);
        }
    }

    pub fn live_nodes(&self) -> alloc::vec::Vec<Arc<Node>> {
        self.map
            .read()
            .values()
            .map(|e| Arc::clone(&e.node))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ATTR_ARCHIVE;

    fn sample_node() -> Node {
        let entry = ShortDirEntry::new(b"X       TXT", ATTR_ARCHIVE, 7);
        Node::from_direntry(42, 1, 2, 3, &entry)
    }

    #[test]
    fn node_mirrors_its_entry() {
        let entry = ShortDirEntry::new(b"X       TXT", ATTR_ARCHIVE, 7);
        let node = Node::from_direntry(42, 1, 2, 3, &entry);
        let state = node.state().read();
        assert_eq!(state.chain.start, 7);
        assert_eq!(state.dir_cluster, 2);
        assert_eq!(state.slot, 3);
        assert!(!node.is_directory());
    }

    #[test]
    fn store_refcounts() {
        let store = NodeStore::new();
        let node = store.publish(Arc::new(sample_node()));
        assert!(store.acquire(42).is_some());
        assert!(store.release(42).is_none()); // still one ref
        let last = store.release(42).unwrap();
        assert_eq!(last.ino(), node.ino());
        assert!(store.peek(42).is_none());
    }

    #[test]
    fn rekey_moves_the_node() {
        let store = NodeStore::new();
        store.publish(Arc::new(sample_node()));
        store.rekey(42, crate::vcache::ARTIFICIAL_INO_BITS);
        assert!(store.peek(42).is_none());
        let node = store.peek(crate::vcache::ARTIFICIAL_INO_BITS).unwrap();
        assert_eq!(node.ino(), crate::vcache::ARTIFICIAL_INO_BITS);
    }

    #[test]
    fn notify_throttle() {
        let node = sample_node();
        assert!(node.should_notify(100));
        assert!(!node.should_notify(100));
        assert!(node.should_notify(101));
    }
}
