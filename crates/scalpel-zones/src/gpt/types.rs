//! GPT layouts, partition type GUIDs and the typed entry view

use scalpel_core::{DissectError, ValueTree};
use scalpel_layout::{Member, StructSpec};
use uuid::Uuid;

/// GPT header signature
pub const SIGNATURE: &[u8; 8] = b"EFI PART";

/// Size of the header fields defined by UEFI
pub const HEADER_SIZE: u64 = 92;

/// Smallest partition entry size allowed by UEFI
pub const MIN_ENTRY_SIZE: u64 = 128;

/// Largest partition entry size accepted
pub const MAX_ENTRY_SIZE: u64 = 4096;

/// Byte range of the header CRC within the header
pub const HEADER_CRC_RANGE: std::ops::Range<usize> = 16..20;

/// Well-known partition type GUIDs
pub const EFI_SYSTEM: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
pub const MICROSOFT_BASIC_DATA: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);
pub const MICROSOFT_RESERVED: Uuid = Uuid::from_u128(0xE3C9E316_0B5C_4DB8_817D_F92DF00215AE);
pub const LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);
pub const LINUX_SWAP: Uuid = Uuid::from_u128(0x0657FD6D_A4AB_43C4_84E5_0933C84B4F4F);
pub const BIOS_BOOT: Uuid = Uuid::from_u128(0x21686148_6449_6E6F_744E_656564454649);

const KNOWN_TYPES: &[(Uuid, &str)] = &[
    (EFI_SYSTEM, "EFI System"),
    (MICROSOFT_BASIC_DATA, "Microsoft Basic Data"),
    (MICROSOFT_RESERVED, "Microsoft Reserved"),
    (LINUX_FILESYSTEM, "Linux filesystem"),
    (LINUX_SWAP, "Linux swap"),
    (BIOS_BOOT, "BIOS boot"),
];

/// Human-readable name of a partition type GUID
pub fn partition_type_name(guid: &Uuid) -> &'static str {
    if guid.is_nil() {
        return "Unused";
    }
    KNOWN_TYPES
        .iter()
        .find(|(known, _)| known == guid)
        .map_or("Unknown", |&(_, name)| name)
}

/// GPT header at LBA 1
///
/// ```text
/// 0x00  signature                "EFI PART"
/// 0x08  revision                 u32
/// 0x0C  header_size              u32
/// 0x10  header_crc32             u32, computed with this field zeroed
/// 0x14  reserved                 u32
/// 0x18  current_lba              u64
/// 0x20  backup_lba               u64
/// 0x28  first_usable_lba         u64
/// 0x30  last_usable_lba          u64
/// 0x38  disk_guid                16 bytes, mixed endian
/// 0x48  partition_entries_lba    u64
/// 0x50  num_partition_entries    u32
/// 0x54  partition_entry_size     u32
/// 0x58  partition_entries_crc32  u32
/// ```
pub fn header_layout() -> StructSpec {
    StructSpec::little("gpt_header")
        .field("signature", Member::bytes(8u64))
        .field("revision", Member::u32())
        .field("header_size", Member::u32())
        .field("header_crc32", Member::u32())
        .field("reserved", Member::u32())
        .field("current_lba", Member::u64())
        .field("backup_lba", Member::u64())
        .field("first_usable_lba", Member::u64())
        .field("last_usable_lba", Member::u64())
        .field("disk_guid", Member::bytes(16u64))
        .field("partition_entries_lba", Member::u64())
        .field("num_partition_entries", Member::u32())
        .field("partition_entry_size", Member::u32())
        .field("partition_entries_crc32", Member::u32())
}

/// One partition entry; `stride` covers vendor data past the standard fields
pub fn entry_layout(stride: u64) -> StructSpec {
    StructSpec::little("gpt_partition_entry")
        .field("type_guid", Member::bytes(16u64))
        .field("unique_guid", Member::bytes(16u64))
        .field("first_lba", Member::u64())
        .field("last_lba", Member::u64())
        .field("attributes", Member::u64())
        .field("name", Member::bytes(72u64))
        .sized(stride)
}

/// The partition entry array
pub fn entries_layout(stride: u64, count: u64) -> StructSpec {
    StructSpec::little("gpt_partition_entries")
        .field("entries", Member::array(entry_layout(stride), count))
}

/// Typed view over a decoded partition entry
#[derive(Debug, Clone, PartialEq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn from_tree(tree: &ValueTree) -> Result<Self, DissectError> {
        let number = |name: &str| {
            tree.get_u64(name)
                .ok_or_else(|| DissectError::malformed(format!("partition entry lacks {}", name)))
        };
        let bytes = |name: &str| {
            tree.get_bytes(name)
                .ok_or_else(|| DissectError::malformed(format!("partition entry lacks {}", name)))
        };

        Ok(Self {
            type_guid: guid(bytes("type_guid")?)?,
            unique_guid: guid(bytes("unique_guid")?)?,
            first_lba: number("first_lba")?,
            last_lba: number("last_lba")?,
            attributes: number("attributes")?,
            name: utf16le_name(bytes("name")?),
        })
    }

    /// Unused entries have a nil type GUID
    pub fn is_unused(&self) -> bool {
        self.type_guid.is_nil()
    }

    /// Size in sectors, or `None` when the range is inverted
    pub fn size_lba(&self) -> Option<u64> {
        self.last_lba
            .checked_sub(self.first_lba)
            .and_then(|span| span.checked_add(1))
    }

    pub fn type_name(&self) -> &'static str {
        partition_type_name(&self.type_guid)
    }
}

/// GPT stores GUIDs with the first three groups little-endian
pub fn guid(bytes: &[u8]) -> Result<Uuid, DissectError> {
    let raw: [u8; 16] = bytes
        .try_into()
        .map_err(|_| DissectError::malformed(format!("GUID must be 16 bytes, got {}", bytes.len())))?;
    Ok(Uuid::from_bytes_le(raw))
}

/// Decode a NUL-terminated UTF-16LE partition name
pub fn utf16le_name(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(header_layout().static_size(), Some(HEADER_SIZE));
        assert_eq!(entry_layout(128).static_size(), Some(128));
        assert_eq!(entry_layout(256).static_size(), Some(256));
    }

    #[test]
    fn test_guid_is_mixed_endian() {
        let on_disk = [
            0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9,
            0x3b,
        ];
        let parsed = guid(&on_disk).unwrap();
        assert_eq!(parsed, EFI_SYSTEM);
        assert_eq!(parsed.to_string(), "c12a7328-f81f-11d2-ba4b-00a0c93ec93b");
        assert_eq!(partition_type_name(&parsed), "EFI System");
        assert!(guid(&on_disk[..8]).is_err());
    }

    #[test]
    fn test_utf16le_name() {
        let mut raw = [0u8; 72];
        for (i, unit) in "Basic data".encode_utf16().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(utf16le_name(&raw), "Basic data");
        assert_eq!(utf16le_name(&[0u8; 72]), "");
    }

    #[test]
    fn test_entry_size_lba() {
        let entry = GptEntry {
            type_guid: LINUX_FILESYSTEM,
            unique_guid: Uuid::nil(),
            first_lba: 34,
            last_lba: 33,
            attributes: 0,
            name: String::new(),
        };
        assert_eq!(entry.size_lba(), None);
        assert_eq!(GptEntry { last_lba: 34, ..entry }.size_lba(), Some(1));
    }
}
