//! Boot sector and BIOS Parameter Block.
//!
//! The BPB occupies the first sector of the volume. Its common fields sit at
//! fixed offsets from 0x0B; FAT32 volumes carry an extension block at 0x24
//! and push the extended boot signature fields (volume id, label, fs type)
//! from 0x26 out to 0x42.
//!
//! FAT type is decided by the count of data clusters and by nothing else:
//! fewer than 4085 clusters is FAT12, fewer than 65525 is FAT16, anything
//! larger is FAT32. The "FAT32" string at 0x52 is informational only and is
//! deliberately ignored here.
//!
//! FAT32 volumes additionally keep an fsinfo sector (usually sector 1) with
//! a cached free-cluster count and a next-free hint. A corrupt fsinfo is not
//! fatal; the counts are rebuilt from a FAT scan instead.

use crate::error::{Error, Result};
use crate::fat::FatType;
use crate::{read_le_u16, read_le_u32, write_le_u16, write_le_u32, SECTOR_SIZE};

pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
/// Extended boot signature value announcing the volume id/label/type fields.
pub const EXT_BOOT_SIGNATURE: u8 = 0x29;

pub const FSINFO_LEAD_SIG: &[u8; 4] = b"RRaA";
pub const FSINFO_STRUCT_SIG: &[u8; 4] = b"rrAa";

/// Parsed boot-sector parameters, unified across the three FAT widths.
///
/// `total_sectors` and `sectors_per_fat` fold the 16- and 32-bit on-disk
/// forms into one field each; [`Bpb::encode`] re-splits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bpb {
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    /// Root directory entry capacity; 0 on FAT32.
    pub root_entry_count: u16,
    pub total_sectors: u32,
    pub media: u8,
    pub sectors_per_fat: u32,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,

    // FAT32 extension block; zero elsewhere.
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,

    /// 0x29 when the id/label/type fields below were present on disk.
    pub boot_signature: u8,
    pub drive_number: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type_label: [u8; 8],
}

impl Bpb {
    /// Sectors holding the FAT12/16 fixed root directory (0 on FAT32).
    pub fn root_dir_sectors(&self) -> u32 {
        let bps = self.bytes_per_sector as u32;
        (self.root_entry_count as u32 * 32 + bps - 1) / bps
    }

    /// First sector of the data region, i.e. of cluster 2.
    pub fn first_data_sector(&self) -> u32 {
        self.reserved_sectors as u32
            + self.fat_count as u32 * self.sectors_per_fat
            + self.root_dir_sectors()
    }

    /// First sector of the fixed root directory (meaningless on FAT32).
    pub fn root_dir_start_sector(&self) -> u32 {
        self.reserved_sectors as u32 + self.fat_count as u32 * self.sectors_per_fat
    }

    pub fn data_sectors(&self) -> u32 {
        self.total_sectors - self.first_data_sector()
    }

    /// Count of data clusters, starting at cluster 2. Rounds down.
    pub fn cluster_count(&self) -> u32 {
        self.data_sectors() / self.sectors_per_cluster as u32
    }

    /// Highest valid cluster index.
    pub fn max_cluster(&self) -> u32 {
        self.cluster_count() + 1
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    pub fn fat_type(&self) -> FatType {
        let n = self.cluster_count();
        if n < crate::MAX_CLUSTERS_FAT12 {
            FatType::Fat12
        } else if n < crate::MAX_CLUSTERS_FAT16 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Zero-based index of the active FAT. With mirroring on, writes fan out
    /// to every copy but reads still use this one.
    pub fn active_fat(&self) -> u32 {
        if self.fat_type() == FatType::Fat32 && self.ext_flags & 0x0080 != 0 {
            (self.ext_flags & 0x000F) as u32
        } else {
            0
        }
    }

    pub fn fat_mirrored(&self) -> bool {
        self.fat_type() != FatType::Fat32 || self.ext_flags & 0x0080 == 0
    }

    /// Serialize back into a boot sector. Inverse of [`classify`] for every
    /// parameter set that passes validation.
    pub fn encode(&self) -> [u8; SECTOR_SIZE] {
        let mut s = [0u8; SECTOR_SIZE];
        let fat32 = self.fat_type() == FatType::Fat32;

        s[0..3].copy_from_slice(&[0xEB, if fat32 { 0x58 } else { 0x3C }, 0x90]);
        s[3..11].copy_from_slice(&self.oem_name);
        write_le_u16(&mut s[0x0B..], self.bytes_per_sector);
        s[0x0D] = self.sectors_per_cluster;
        write_le_u16(&mut s[0x0E..], self.reserved_sectors);
        s[0x10] = self.fat_count;
        write_le_u16(&mut s[0x11..], self.root_entry_count);
        if !fat32 && self.total_sectors <= u16::MAX as u32 {
            write_le_u16(&mut s[0x13..], self.total_sectors as u16);
        } else {
            write_le_u32(&mut s[0x20..], self.total_sectors);
        }
        s[0x15] = self.media;
        if fat32 {
            write_le_u32(&mut s[0x24..], self.sectors_per_fat);
        } else {
            write_le_u16(&mut s[0x16..], self.sectors_per_fat as u16);
        }
        write_le_u16(&mut s[0x18..], self.sectors_per_track);
        write_le_u16(&mut s[0x1A..], self.heads);
        write_le_u32(&mut s[0x1C..], self.hidden_sectors);

        let ext = if fat32 {
            write_le_u16(&mut s[0x28..], self.ext_flags);
            write_le_u16(&mut s[0x2A..], self.fs_version);
            write_le_u32(&mut s[0x2C..], self.root_cluster);
            write_le_u16(&mut s[0x30..], self.fsinfo_sector);
            write_le_u16(&mut s[0x32..], self.backup_boot_sector);
            0x40
        } else {
            0x24
        };

        s[ext] = self.drive_number;
        s[ext + 2] = self.boot_signature;
        if self.boot_signature == EXT_BOOT_SIGNATURE {
            write_le_u32(&mut s[ext + 3..], self.volume_id);
            s[ext + 7..ext + 18].copy_from_slice(&self.volume_label);
            s[ext + 18..ext + 26].copy_from_slice(&self.fs_type_label);
        }

        s[0x1FE..0x200].copy_from_slice(&BOOT_SIGNATURE);
        s
    }
}

/// Validate sector 0 and classify the volume.
///
/// `Error::NotFat` means the sector does not look like a FAT boot sector at
/// all (bad signature, NTFS/HPFS, nonsense jump). `Error::Unsupported` means
/// it is FAT-shaped but with parameters outside the supported ranges.
pub fn classify(sector0: &[u8; SECTOR_SIZE]) -> Result<(FatType, Bpb)> {
    if sector0[0x1FE..0x200] != BOOT_SIGNATURE {
        return Err(Error::NotFat);
    }
    // Common boot jump encodings; anything else is not a PC boot sector.
    if !(sector0[0] == 0xEB && sector0[2] == 0x90) && sector0[0] != 0xE9 {
        return Err(Error::NotFat);
    }
    if &sector0[3..11] == b"NTFS    " || &sector0[3..11] == b"HPFS    " {
        return Err(Error::NotFat);
    }

    let mut bpb = Bpb {
        oem_name: sector0[3..11].try_into().unwrap(),
        bytes_per_sector: read_le_u16(&sector0[0x0B..]),
        sectors_per_cluster: sector0[0x0D],
        reserved_sectors: read_le_u16(&sector0[0x0E..]),
        fat_count: sector0[0x10],
        root_entry_count: read_le_u16(&sector0[0x11..]),
        total_sectors: 0,
        media: sector0[0x15],
        sectors_per_fat: 0,
        sectors_per_track: read_le_u16(&sector0[0x18..]),
        heads: read_le_u16(&sector0[0x1A..]),
        hidden_sectors: read_le_u32(&sector0[0x1C..]),
        ext_flags: 0,
        fs_version: 0,
        root_cluster: 0,
        fsinfo_sector: 0,
        backup_boot_sector: 0,
        boot_signature: 0,
        drive_number: 0,
        volume_id: 0,
        volume_label: [crate::SPACE; 11],
        fs_type_label: [crate::SPACE; 8],
    };

    if !matches!(bpb.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(Error::Unsupported);
    }
    if !bpb.sectors_per_cluster.is_power_of_two() {
        return Err(Error::Unsupported);
    }
    if bpb.reserved_sectors == 0 {
        return Err(Error::Unsupported);
    }
    if bpb.fat_count == 0 || bpb.fat_count > 8 {
        return Err(Error::Unsupported);
    }
    if bpb.media != 0xF0 && bpb.media < 0xF8 {
        return Err(Error::Unsupported);
    }

    let total16 = read_le_u16(&sector0[0x13..]);
    bpb.total_sectors = if total16 != 0 {
        total16 as u32
    } else {
        read_le_u32(&sector0[0x20..])
    };
    if bpb.total_sectors == 0 {
        return Err(Error::Unsupported);
    }

    let fat_size16 = read_le_u16(&sector0[0x16..]);
    let fat32_layout = fat_size16 == 0;
    bpb.sectors_per_fat = if fat32_layout {
        read_le_u32(&sector0[0x24..])
    } else {
        fat_size16 as u32
    };
    if bpb.sectors_per_fat == 0 {
        return Err(Error::Unsupported);
    }

    let meta = bpb.reserved_sectors as u32
        + bpb.fat_count as u32 * bpb.sectors_per_fat
        + bpb.root_dir_sectors();
    if meta >= bpb.total_sectors {
        return Err(Error::Unsupported);
    }

    if fat32_layout {
        bpb.ext_flags = read_le_u16(&sector0[0x28..]);
        bpb.fs_version = read_le_u16(&sector0[0x2A..]);
        bpb.root_cluster = read_le_u32(&sector0[0x2C..]);
        bpb.fsinfo_sector = read_le_u16(&sector0[0x30..]);
        bpb.backup_boot_sector = read_le_u16(&sector0[0x32..]);
        if bpb.fs_version != 0 {
            return Err(Error::Unsupported);
        }
        if bpb.root_cluster < 2 {
            return Err(Error::Unsupported);
        }
        if bpb.root_entry_count != 0 {
            return Err(Error::Unsupported);
        }
    }

    let kind = bpb.fat_type();
    if fat32_layout != (kind == FatType::Fat32) {
        // Cluster count and layout disagree; refuse rather than guess.
        return Err(Error::Unsupported);
    }

    // The extended boot signature moved with the FAT32 block. Pre-DOS 4
    // volumes (the "DOS 3.3 legacy" layout) lack it entirely, in which case
    // the label and id fields simply do not exist.
    let ext = if fat32_layout { 0x40 } else { 0x24 };
    if sector0[ext + 2] == EXT_BOOT_SIGNATURE {
        bpb.boot_signature = EXT_BOOT_SIGNATURE;
        bpb.drive_number = sector0[ext];
        bpb.volume_id = read_le_u32(&sector0[ext + 3..]);
        bpb.volume_label
            .copy_from_slice(&sector0[ext + 7..ext + 18]);
        bpb.fs_type_label
            .copy_from_slice(&sector0[ext + 18..ext + 26]);
    }

    Ok((kind, bpb))
}

/// The FAT32 fsinfo payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

impl FsInfo {
    /// Free count value meaning "unknown, recompute".
    pub const UNKNOWN: u32 = 0xFFFF_FFFF;

    /// Validate the three signatures and pull out the counters. `None` for a
    /// corrupt sector; the caller rebuilds the counts from the FAT.
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Option<FsInfo> {
        if &sector[0..4] != FSINFO_LEAD_SIG {
            return None;
        }
        if &sector[0x1E4..0x1E8] != FSINFO_STRUCT_SIG {
            return None;
        }
        if sector[0x1FC..0x200] != [0x00, 0x00, 0x55, 0xAA] {
            return None;
        }
        Some(FsInfo {
            free_count: read_le_u32(&sector[0x1E8..]),
            next_free: read_le_u32(&sector[0x1EC..]),
        })
    }

    /// Write signatures and counters into `sector`, zeroing the rest.
    pub fn encode(&self, sector: &mut [u8; SECTOR_SIZE]) {
        sector.fill(0);
        sector[0..4].copy_from_slice(FSINFO_LEAD_SIG);
        sector[0x1E4..0x1E8].copy_from_slice(FSINFO_STRUCT_SIG);
        write_le_u32(&mut sector[0x1E8..], self.free_count);
        write_le_u32(&mut sector[0x1EC..], self.next_free);
        sector[0x1FC..0x200].copy_from_slice(&[0x00, 0x00, 0x55, 0xAA]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fat16() -> Bpb {
        Bpb {
            oem_name: *b"DOSFS   ",
            bytes_per_sector: 512,
            sectors_per_cluster: 4,
            reserved_sectors: 1,
            fat_count: 2,
            root_entry_count: 512,
            total_sectors: 65_000,
            media: 0xF8,
            sectors_per_fat: 64,
            sectors_per_track: 63,
            heads: 255,
            hidden_sectors: 0,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 0,
            fsinfo_sector: 0,
            backup_boot_sector: 0,
            boot_signature: EXT_BOOT_SIGNATURE,
            drive_number: 0x80,
            volume_id: 0x1234_5678,
            volume_label: *b"TESTVOL    ",
            fs_type_label: *b"FAT16   ",
        }
    }

    #[test]
    fn bpb_round_trips() {
        let bpb = sample_fat16();
        let (kind, parsed) = classify(&bpb.encode()).unwrap();
        assert_eq!(kind, FatType::Fat16);
        assert_eq!(parsed, bpb);
    }

    #[test]
    fn fat32_round_trips() {
        let bpb = Bpb {
            sectors_per_cluster: 1,
            root_entry_count: 0,
            total_sectors: 140_000,
            sectors_per_fat: 1100,
            root_cluster: 2,
            fsinfo_sector: 1,
            backup_boot_sector: 6,
            reserved_sectors: 32,
            fs_type_label: *b"FAT32   ",
            ..sample_fat16()
        };
        let (kind, parsed) = classify(&bpb.encode()).unwrap();
        assert_eq!(kind, FatType::Fat32);
        assert_eq!(parsed, bpb);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut s = sample_fat16().encode();
        s[0x1FE] = 0;
        assert_eq!(classify(&s), Err(Error::NotFat));
    }

    #[test]
    fn rejects_ntfs() {
        let mut s = sample_fat16().encode();
        s[3..11].copy_from_slice(b"NTFS    ");
        assert_eq!(classify(&s), Err(Error::NotFat));
    }

    #[test]
    fn rejects_silly_geometry() {
        let mut bpb = sample_fat16();
        bpb.sectors_per_cluster = 3;
        assert_eq!(classify(&bpb.encode()), Err(Error::Unsupported));

        let mut bpb = sample_fat16();
        bpb.media = 0x42;
        assert_eq!(classify(&bpb.encode()), Err(Error::Unsupported));
    }

    #[test]
    fn legacy_layout_has_no_label_fields() {
        let mut bpb = sample_fat16();
        bpb.boot_signature = 0;
        let mut s = bpb.encode();
        // No 0x29 byte, so whatever sits in the label area is ignored.
        s[0x2B..0x36].copy_from_slice(b"GARBAGEGARB");
        let (_, parsed) = classify(&s).unwrap();
        assert_eq!(parsed.boot_signature, 0);
        assert_eq!(parsed.volume_label, [crate::SPACE; 11]);
    }

    #[test]
    fn fsinfo_round_trips_and_validates() {
        let info = FsInfo {
            free_count: 1000,
            next_free: 17,
        };
        let mut sector = [0u8; SECTOR_SIZE];
        info.encode(&mut sector);
        assert_eq!(FsInfo::parse(&sector), Some(info));

        sector[2] = b'x';
        assert_eq!(FsInfo::parse(&sector), None);
    }
}
