//! Volume initialization.
//!
//! Parameter selection is a fixed table keyed by partition size (with an
//! optional explicit FAT width), so the same size always yields the same
//! geometry: cluster sizes step up with capacity, reserved sectors and root
//! entry counts follow the width, and the FAT size comes from the rounded
//! division the format specification recommends.
//!
//! Layout written: boot sector (BPB, stub boot code, 0x55AA), on FAT32 the
//! fsinfo sector at 1 and a boot backup at 6, zeroed FATs with the
//! reserved entries seeded, the root directory (fixed range or one zeroed
//! cluster), and a volume-label entry when a label is given.

use alloc::sync::Arc;

use crate::bpb::{Bpb, FsInfo, EXT_BOOT_SIGNATURE};
use crate::device::BlockDevice;
use crate::entry::ShortDirEntry;
use crate::error::{Error, Result};
use crate::fat::FatType;
use crate::name::{label_from_str, OemCodepage};
use crate::{ATTR_VOLUME_ID, SECTOR_SIZE};

pub const FSINFO_SECTOR: u16 = 1;
pub const BACKUP_BOOT_SECTOR: u16 = 6;
pub const FAT32_ROOT_CLUSTER: u32 = 2;

#[derive(Debug, Clone, Default)]
pub struct MkfsParams {
    /// Explicit FAT width (12, 16 or 32); `None` picks by size.
    pub fat_bits: Option<u8>,
    pub label: Option<alloc::string::String>,
    /// Volume serial; a formatter normally feeds the clock in here.
    pub volume_id: u32,
}

/// Deterministic geometry for a given size, before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkfsLayout {
    pub kind: FatType,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub root_entry_count: u16,
    pub sectors_per_fat: u32,
    pub total_sectors: u32,
}

fn pick_fat_bits(bytes: u64) -> Result<u8> {
    const CLUSTER_MAX: u64 = 32 * 1024;
    if bytes / CLUSTER_MAX < 65_525 {
        // Small media: prefer FAT12 while it fits with 2-sector clusters.
        if bytes <= 4_182_016 {
            return Ok(12);
        }
        Ok(16)
    } else if bytes / CLUSTER_MAX < 0x0FFF_FFF5 {
        Ok(32)
    } else {
        Err(Error::Unsupported)
    }
}

fn pick_sectors_per_cluster(fat_bits: u8, bytes: u64) -> Result<u8> {
    let spc: u8 = match fat_bits {
        12 => {
            if bytes <= 2_091_008 {
                1
            } else if bytes <= 4_182_016 {
                2
            } else {
                0
            }
        }
        16 => {
            if bytes <= 4_182_016 {
                0 // small enough that only FAT12 makes sense
            } else if bytes <= 16 << 20 {
                2
            } else if bytes <= 128 << 20 {
                4
            } else if bytes <= 256 << 20 {
                8
            } else if bytes <= 512 << 20 {
                16
            } else if bytes <= 1 << 30 {
                32
            } else if bytes <= 2 << 30 {
                64
            } else {
                0
            }
        }
        32 => {
            if bytes <= 66_600 * 512 {
                0 // below the FAT32 floor
            } else if bytes <= 532_480 * 512 {
                1
            } else if bytes <= 8 << 30 {
                8
            } else if bytes <= 16 << 30 {
                16
            } else if bytes <= 32 << 30 {
                32
            } else {
                64
            }
        }
        _ => return Err(Error::InvalidArg),
    };
    if spc == 0 {
        return Err(Error::Unsupported);
    }
    Ok(spc)
}

/// Compute the geometry the formatter would use for `total_sectors`.
pub fn plan(total_sectors: u64, params: &MkfsParams) -> Result<MkfsLayout> {
    let bytes = total_sectors * SECTOR_SIZE as u64;
    let fat_bits = match params.fat_bits {
        Some(b @ (12 | 16 | 32)) => b,
        Some(_) => return Err(Error::InvalidArg),
        None => pick_fat_bits(bytes)?,
    };
    let sectors_per_cluster = pick_sectors_per_cluster(fat_bits, bytes)?;
    let kind = match fat_bits {
        12 => FatType::Fat12,
        16 => FatType::Fat16,
        _ => FatType::Fat32,
    };

    let reserved_sectors: u16 = if kind == FatType::Fat32 { 32 } else { 1 };
    let root_entry_count: u16 = match kind {
        FatType::Fat12 => 128,
        FatType::Fat16 => 512,
        FatType::Fat32 => 0,
    };

    // FAT sizing as the format specification recommends: round up against
    // 256 clusters-per-sector-pair, halved for the 32-bit width.
    let root_dir_sectors =
        (root_entry_count as u64 * 32 + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64;
    let tmp1 = total_sectors - reserved_sectors as u64 - root_dir_sectors;
    let mut tmp2 = 256 * sectors_per_cluster as u64 + 2;
    if kind == FatType::Fat32 {
        tmp2 /= 2;
    }
    let sectors_per_fat = ((tmp1 + tmp2 - 1) / tmp2) as u32;

    if total_sectors > u32::MAX as u64 {
        return Err(Error::Unsupported);
    }

    Ok(MkfsLayout {
        kind,
        sectors_per_cluster,
        reserved_sectors,
        root_entry_count,
        sectors_per_fat,
        total_sectors: total_sectors as u32,
    })
}

fn layout_to_bpb(layout: &MkfsLayout, params: &MkfsParams) -> Bpb {
    let fat32 = layout.kind == FatType::Fat32;
    let label = params
        .label
        .as_deref()
        .and_then(|l| label_from_str(l, OemCodepage::Cp850).ok())
        .unwrap_or(*b"NO NAME    ");
    Bpb {
        oem_name: *b"DOSFS1.0",
        bytes_per_sector: SECTOR_SIZE as u16,
        sectors_per_cluster: layout.sectors_per_cluster,
        reserved_sectors: layout.reserved_sectors,
        fat_count: 2,
        root_entry_count: layout.root_entry_count,
        total_sectors: layout.total_sectors,
        media: 0xF8,
        sectors_per_fat: layout.sectors_per_fat,
        sectors_per_track: 63,
        heads: 255,
        hidden_sectors: 0,
        ext_flags: 0,
        fs_version: 0,
        root_cluster: if fat32 { FAT32_ROOT_CLUSTER } else { 0 },
        fsinfo_sector: if fat32 { FSINFO_SECTOR } else { 0 },
        backup_boot_sector: if fat32 { BACKUP_BOOT_SECTOR } else { 0 },
        boot_signature: EXT_BOOT_SIGNATURE,
        drive_number: 0x80,
        volume_id: params.volume_id,
        volume_label: label,
        fs_type_label: match layout.kind {
            FatType::Fat12 => *b"FAT12   ",
            FatType::Fat16 => *b"FAT16   ",
            FatType::Fat32 => *b"FAT32   ",
        },
    }
}

fn write_sector(device: &Arc<dyn BlockDevice>, sector: u64, data: &[u8; SECTOR_SIZE]) -> Result<()> {
    device.write_blocks(data, sector as usize * SECTOR_SIZE)
}

/// Format the device in place.
pub fn mkfs(device: Arc<dyn BlockDevice>, params: &MkfsParams) -> Result<()> {
    if device.is_read_only() {
        return Err(Error::ReadOnly);
    }
    let layout = plan(device.sector_count(), params)?;
    let bpb = layout_to_bpb(&layout, params);
    let fat32 = layout.kind == FatType::Fat32;

    // Zero the metadata region first: reserved sectors, FATs, fixed root.
    let root_dir_sectors = bpb.root_dir_sectors();
    let meta_sectors = layout.reserved_sectors as u64
        + 2 * layout.sectors_per_fat as u64
        + root_dir_sectors as u64;
    let zero = [0u8; SECTOR_SIZE];
    for sector in 0..meta_sectors {
        write_sector(&device, sector, &zero)?;
    }

    // Boot sector, plus the backup copy on FAT32. The boot jump in the BPB
    // lands on a stub that just halts; the volume is not expected to boot,
    // the bytes only have to be present and harmless.
    let mut boot = bpb.encode();
    let stub_at = if fat32 { 0x5A } else { 0x3E };
    boot[stub_at..stub_at + 3].copy_from_slice(&[0xF4, 0xEB, 0xFD]);
    write_sector(&device, 0, &boot)?;
    if fat32 {
        write_sector(&device, BACKUP_BOOT_SECTOR as u64, &boot)?;
    }

    // Reserved FAT entries: media byte with all high bits set, then the
    // end marker; FAT32 adds a third entry terminating the root directory.
    let mut fat0 = [0u8; SECTOR_SIZE];
    match layout.kind {
        FatType::Fat12 => {
            fat0[0] = 0xF8;
            fat0[1] = 0xFF;
            fat0[2] = 0xFF;
        }
        FatType::Fat16 => {
            fat0[0..4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
        }
        FatType::Fat32 => {
            fat0[0..4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0x0F]);
            fat0[4..8].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0x0F]);
            fat0[8..12].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0x0F]);
        }
    }
    let fat1_start = layout.reserved_sectors as u64;
    write_sector(&device, fat1_start, &fat0)?;
    write_sector(&device, fat1_start + layout.sectors_per_fat as u64, &fat0)?;

    // Root directory: already-zeroed fixed range, or one zeroed cluster.
    let first_data_sector = bpb.first_data_sector() as u64;
    if fat32 {
        for s in 0..layout.sectors_per_cluster as u64 {
            write_sector(&device, first_data_sector + s, &zero)?;
        }
    }

    // fsinfo: everything free except the root cluster, allocate from 3.
    if fat32 {
        let free = bpb.cluster_count() - 1;
        let mut sector = [0u8; SECTOR_SIZE];
        FsInfo {
            free_count: free,
            next_free: 3,
        }
        .encode(&mut sector);
        write_sector(&device, FSINFO_SECTOR as u64, &sector)?;
    }

    // Volume label entry at the first root slot.
    if let Some(label) = params.label.as_deref() {
        let raw = label_from_str(label, OemCodepage::Cp850)?;
        let entry = ShortDirEntry::new(&raw, ATTR_VOLUME_ID, 0);
        let root_start = if fat32 {
            first_data_sector
        } else {
            bpb.root_dir_start_sector() as u64
        };
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..32].copy_from_slice(&entry.to_bytes());
        write_sector(&device, root_start, &sector)?;
    }

    log::info!(
        "mkfs: {:?}, {} sectors, {} sectors/cluster, fat {} sectors",
        layout.kind,
        layout.total_sectors,
        layout.sectors_per_cluster,
        layout.sectors_per_fat
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpb::classify;
    use crate::device::tests_support::MemDisk;

    #[test]
    fn plan_is_deterministic_and_sized_sanely() {
        // 1 MiB floppy-ish image: FAT12, 1-sector clusters.
        let layout = plan(2048, &MkfsParams::default()).unwrap();
        assert_eq!(layout.kind, FatType::Fat12);
        assert_eq!(layout.sectors_per_cluster, 1);

        // 64 MiB: FAT16 with 2k clusters.
        let layout = plan(131_072, &MkfsParams::default()).unwrap();
        assert_eq!(layout.kind, FatType::Fat16);
        assert_eq!(layout.sectors_per_cluster, 4);

        // 1 GiB, explicit FAT32.
        let layout = plan(
            2_097_152,
            &MkfsParams {
                fat_bits: Some(32),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(layout.kind, FatType::Fat32);
        assert_eq!(layout.sectors_per_cluster, 8);

        // Same inputs, same plan.
        assert_eq!(
            plan(131_072, &MkfsParams::default()).unwrap(),
            plan(131_072, &MkfsParams::default()).unwrap()
        );
    }

    #[test]
    fn formatted_volume_classifies_back() {
        for (sectors, fat_bits, expect) in [
            (2048u64, None, FatType::Fat12),
            (131_072, None, FatType::Fat16),
            (600_000, Some(32u8), FatType::Fat32),
        ] {
            let disk: Arc<dyn crate::device::BlockDevice> = Arc::new(MemDisk::new(sectors));
            mkfs(
                Arc::clone(&disk),
                &MkfsParams {
                    fat_bits,
                    label: Some("TESTVOL".into()),
                    ..Default::default()
                },
            )
            .unwrap();
            let mut sector0 = [0u8; SECTOR_SIZE];
            disk.read_blocks(&mut sector0, 0).unwrap();
            let (kind, bpb) = classify(&sector0).unwrap();
            assert_eq!(kind, expect, "{} sectors", sectors);
            assert_eq!(bpb.volume_label, *b"TESTVOL    ");
            // The classifier's cluster count must agree with the planner's
            // width choice, which is the round-trip that matters.
            assert!(bpb.cluster_count() >= 2);
        }
    }

    #[test]
    fn fat32_has_fsinfo_and_backup() {
        let disk: Arc<dyn crate::device::BlockDevice> = Arc::new(MemDisk::new(600_000));
        mkfs(
            Arc::clone(&disk),
            &MkfsParams {
                fat_bits: Some(32),
                ..Default::default()
            },
        )
        .unwrap();

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_blocks(&mut sector, FSINFO_SECTOR as usize * SECTOR_SIZE)
            .unwrap();
        let info = FsInfo::parse(&sector).unwrap();
        assert_eq!(info.next_free, 3);
        assert!(info.free_count > 0);

        let mut backup = [0u8; SECTOR_SIZE];
        disk.read_blocks(&mut backup, BACKUP_BOOT_SECTOR as usize * SECTOR_SIZE)
            .unwrap();
        let mut primary = [0u8; SECTOR_SIZE];
        disk.read_blocks(&mut primary, 0).unwrap();
        assert_eq!(primary, backup);
    }

    #[test]
    fn reserved_fat_entries_seeded() {
        let disk: Arc<dyn crate::device::BlockDevice> = Arc::new(MemDisk::new(131_072));
        mkfs(Arc::clone(&disk), &MkfsParams::default()).unwrap();
        let mut fat = [0u8; SECTOR_SIZE];
        disk.read_blocks(&mut fat, SECTOR_SIZE).unwrap(); // reserved = 1
        assert_eq!(&fat[0..4], &[0xF8, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn too_small_for_fat32_fails() {
        assert_eq!(
            plan(
                1000,
                &MkfsParams {
                    fat_bits: Some(32),
                    ..Default::default()
                }
            ),
            Err(Error::Unsupported)
        );
    }
}
