//! Block device interface.

use crate::error::Result;
use core::any::Any;

/// A sector-addressed device. Offsets and lengths are in bytes but must be
/// multiples of [`crate::SECTOR_SIZE`]; the cache layer guarantees this.
pub trait BlockDevice: Send + Sync + Any {
    /// Read `buf.len() / SECTOR_SIZE` sectors starting at byte `offset`.
    fn read_blocks(&self, buf: &mut [u8], offset: usize) -> Result<()>;

    /// Write `buf.len() / SECTOR_SIZE` sectors starting at byte `offset`.
    fn write_blocks(&self, buf: &[u8], offset: usize) -> Result<()>;

    /// Total capacity in sectors.
    fn sector_count(&self) -> u64;

    /// Whether the medium refuses writes. A read-only device forces a
    /// read-only mount regardless of mount flags.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Best-effort exclusive access. Returns `Err(Busy)` when another holder
    /// already locked the device, `Ok(())` where unsupported.
    fn lock_exclusive(&self) -> Result<()> {
        Ok(())
    }

    fn unlock_exclusive(&self) {}
}
