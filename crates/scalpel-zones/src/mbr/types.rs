//! MBR layouts and partition type codes

use scalpel_layout::{Member, StructSpec};

/// Boot signature expected at offset 0x1FE
pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// Offset of the first partition entry
pub const PARTITION_TABLE_OFFSET: u64 = 0x1BE;

/// Offset of the optional disk signature
pub const DISK_SIGNATURE_OFFSET: u64 = 0x1B8;

/// Size of the MBR sector
pub const MBR_SIZE: u64 = 512;

/// Size of each partition entry
pub const PARTITION_ENTRY_SIZE: u64 = 16;

/// Number of primary partition entries
pub const NUM_PARTITIONS: u64 = 4;

/// One 16-byte primary partition entry
///
/// ```text
/// 0x00  status        0x80 = bootable, 0x00 = inactive
/// 0x01  chs_start     3 bytes
/// 0x04  partition_type
/// 0x05  chs_end       3 bytes
/// 0x08  lba_start     u32
/// 0x0C  lba_length    u32
/// ```
pub fn entry_layout() -> StructSpec {
    StructSpec::little("mbr_partition_entry")
        .field("status", Member::u8())
        .field("chs_start", Member::bytes(3u64))
        .field("partition_type", Member::u8())
        .field("chs_end", Member::bytes(3u64))
        .field("lba_start", Member::u32())
        .field("lba_length", Member::u32())
}

/// The whole MBR sector; bootstrap code before the disk signature is skipped
pub fn mbr_layout() -> StructSpec {
    StructSpec::little("mbr")
        .field_at("disk_signature", DISK_SIGNATURE_OFFSET, Member::u32())
        .field_at(
            "entries",
            PARTITION_TABLE_OFFSET,
            Member::array(entry_layout(), NUM_PARTITIONS),
        )
        .field("boot_signature", Member::u16())
}

/// Human-readable name of a partition type code
pub fn partition_type_name(code: u8) -> &'static str {
    match code {
        0x00 => "Empty",
        0x01 => "FAT12",
        0x04 => "FAT16 (<32MB)",
        0x05 => "Extended",
        0x06 => "FAT16",
        0x07 => "NTFS/exFAT",
        0x0B => "FAT32 (CHS)",
        0x0C => "FAT32 (LBA)",
        0x0E => "FAT16 (LBA)",
        0x0F => "Extended (LBA)",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0x8E => "Linux LVM",
        0xEE => "GPT Protective",
        0xEF => "EFI System",
        _ => "Unknown",
    }
}

/// Extended partitions hold a chain of EBRs rather than a filesystem
pub fn is_extended(code: u8) -> bool {
    matches!(code, 0x05 | 0x0F | 0x85)
}
