//! The host-facing rim of the driver.
//!
//! The driver proper never talks to a kernel directly; everything it needs
//! from its surroundings comes through [`HostHooks`] (clock, timezone,
//! change notifications, the read-only trampoline), and everything it hands
//! back goes through the plain data types here. A host embeds the driver by
//! implementing `HostHooks`, wiring its VFS entry points to the methods on
//! [`crate::Volume`], and mapping [`crate::Error`] onto its own status
//! codes.

use alloc::string::String;
use bitflags::bitflags;

use crate::Ino;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Force read-only regardless of the device.
        const READ_ONLY = 0x01;
        /// Request exclusive access to the device (best effort).
        const LOCK_DEVICE = 0x02;
    }
}

/// Write-through policy for data changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Never,
    IfRemovable,
    Always,
}

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub flags: MountFlags,
    pub sync: SyncMode,
    /// OEM code page name for short names; `None` picks the built-in
    /// default (CP850).
    pub oem_codepage: Option<String>,
    /// Ownership reported by `stat`; FAT stores none of its own.
    pub uid: u32,
    pub gid: u32,
    /// Whether the device counts as removable for [`SyncMode::IfRemovable`].
    pub removable: bool,
}

impl Default for MountFlags {
    fn default() -> Self {
        MountFlags::empty()
    }
}

/// Services and notifications supplied by the host.
///
/// The notification defaults are no-ops so tests and simple embeddings can
/// implement just the clock.
pub trait HostHooks: Send + Sync {
    /// Wall-clock seconds since the Unix epoch, UTC.
    fn now_unix(&self) -> i64;

    /// Seconds east of UTC; on-disk timestamps are local time.
    fn tz_offset_secs(&self) -> i32 {
        0
    }

    fn notify_entry_created(&self, parent: Ino, name: &str, ino: Ino) {
        let _ = (parent, name, ino);
    }

    fn notify_entry_removed(&self, parent: Ino, name: &str, ino: Ino) {
        let _ = (parent, name, ino);
    }

    fn notify_entry_moved(
        &self,
        from_parent: Ino,
        from_name: &str,
        to_parent: Ino,
        to_name: &str,
        ino: Ino,
    ) {
        let _ = (from_parent, from_name, to_parent, to_name, ino);
    }

    fn notify_stat_changed(&self, ino: Ino) {
        let _ = ino;
    }

    fn notify_attribute_changed(&self, ino: Ino) {
        let _ = ino;
    }

    /// One-shot escalation after corruption; the volume has already flipped
    /// its own read-only flag when this fires.
    fn remount_read_only(&self) {}
}

/// Hooks with a frozen clock; good enough for tests and tools.
pub struct NullHooks;

impl HostHooks for NullHooks {
    fn now_unix(&self) -> i64 {
        // 2020-01-01T00:00:00Z, safely inside the DOS range.
        1_577_836_800
    }
}

/// `stat` output. Mode and ownership are synthesized: FAT has no owners,
/// and the only permission it can express is the read-only attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub ino: Ino,
    pub parent_ino: Ino,
    pub size: u64,
    pub block_size: u32,
    pub blocks: u64,
    pub is_directory: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub created_unix: i64,
    pub modified_unix: i64,
    pub accessed_unix: i64,
    pub mime: Option<String>,
}

/// One `readdir` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: Ino,
    pub name: String,
    pub is_directory: bool,
}

/// Volume-level statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStat {
    /// Allocation unit in bytes (one cluster).
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub volume_name: String,
    pub read_only: bool,
}
