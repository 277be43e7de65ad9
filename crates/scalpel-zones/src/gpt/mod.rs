//! GPT (GUID Partition Table) dissector

pub mod types;

use crate::mbr::SECTOR_SIZE;
use scalpel_core::security::{checked_multiply_u64, MAX_PARTITION_COUNT};
use scalpel_core::{DissectError, Value, ValueTree};
use scalpel_engine::{Confidence, DissectionOutput, Dissector, DissectorInfo};
use scalpel_layout::StructSpec;
use scalpel_pipeline::Container;
use types::{GptEntry, HEADER_CRC_RANGE, HEADER_SIZE, MAX_ENTRY_SIZE, MIN_ENTRY_SIZE, SIGNATURE};

/// Media type claimed by [`GptDissector`]
pub const MEDIA_TYPE: &str = "application/x-gpt";

/// GPT partition table
///
/// The GUID Partition Table is the modern partitioning scheme used by UEFI-based systems.
/// It supports up to 128 partitions by default and uses GUIDs for partition identification.
///
/// # Structure
///
/// ```text
/// LBA 0:    Protective MBR (for backward compatibility)
/// LBA 1:    Primary GPT header
/// LBA 2-33: Partition entries array (typically 128 entries)
/// LBA 34+:  Usable disk space
/// ...
/// Last 33:  Backup partition entries array
/// Last 1:   Backup GPT header
/// ```
///
/// Priority is above [`MbrDissector`](crate::MbrDissector) so the protective
/// MBR never shadows the real table. CRC mismatches and entries that run
/// past the disk make the result partial; the backup header is not read.
pub struct GptDissector {
    info: DissectorInfo,
    header: StructSpec,
}

impl GptDissector {
    pub fn new() -> Self {
        Self {
            info: DissectorInfo::new("gpt", "GUID Partition Table")
                .media_type(MEDIA_TYPE)
                .priority(20),
            header: types::header_layout(),
        }
    }
}

impl Default for GptDissector {
    fn default() -> Self {
        Self::new()
    }
}

fn header_u64(header: &ValueTree, name: &str) -> Result<u64, DissectError> {
    header
        .get_u64(name)
        .ok_or_else(|| DissectError::malformed(format!("GPT header lacks {}", name)))
}

impl Dissector for GptDissector {
    fn info(&self) -> &DissectorInfo {
        &self.info
    }

    fn matches(&self, container: &Container) -> Confidence {
        match container.read(SECTOR_SIZE, SIGNATURE.len() as u64) {
            Ok(magic) if magic[..] == SIGNATURE[..] => Confidence::CERTAIN,
            _ => Confidence::NONE,
        }
    }

    fn dissect(&self, container: &Container) -> Result<DissectionOutput, DissectError> {
        let header = self.header.decode(container, SECTOR_SIZE)?;
        if header.get_bytes("signature") != Some(SIGNATURE.as_slice()) {
            return Err(DissectError::malformed("invalid GPT header signature"));
        }

        let header_size = header_u64(&header, "header_size")?;
        if !(HEADER_SIZE..=SECTOR_SIZE).contains(&header_size) {
            return Err(DissectError::malformed(format!(
                "GPT header size {} outside {}..={}",
                header_size, HEADER_SIZE, SECTOR_SIZE
            )));
        }

        let mut output = DissectionOutput::new();

        // The header CRC covers header_size bytes with the CRC field zeroed.
        let mut raw_header = container.read(SECTOR_SIZE, header_size)?.to_vec();
        raw_header[HEADER_CRC_RANGE].fill(0);
        let stored = header_u64(&header, "header_crc32")?;
        let computed = crc32fast::hash(&raw_header) as u64;
        if stored != computed {
            output.issue(format!(
                "GPT header CRC32 mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            ));
        }

        let count = header_u64(&header, "num_partition_entries")?;
        if count > MAX_PARTITION_COUNT {
            return Err(DissectError::malformed(format!(
                "GPT partition count {} exceeds limit {}",
                count, MAX_PARTITION_COUNT
            )));
        }
        let stride = header_u64(&header, "partition_entry_size")?;
        if !(MIN_ENTRY_SIZE..=MAX_ENTRY_SIZE).contains(&stride) || stride % 8 != 0 {
            return Err(DissectError::malformed(format!(
                "invalid GPT partition entry size {}",
                stride
            )));
        }

        let entries_offset = checked_multiply_u64(
            header_u64(&header, "partition_entries_lba")?,
            SECTOR_SIZE,
            "partition entries offset",
        )?;
        let array_size = checked_multiply_u64(count, stride, "partition entries size")?;

        let raw_entries = container.read(entries_offset, array_size)?;
        let stored = header_u64(&header, "partition_entries_crc32")?;
        let computed = crc32fast::hash(&raw_entries) as u64;
        if stored != computed {
            output.issue(format!(
                "GPT partition entries CRC32 mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            ));
        }

        let entries = types::entries_layout(stride, count).decode(container, entries_offset)?;
        let decoded = entries
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| DissectError::malformed("partition entry array missing"))?;

        let disk_guid = types::guid(header.get_bytes("disk_guid").unwrap_or_default())?;
        tracing::debug!(
            %disk_guid,
            entries = count,
            stride,
            "Decoded GPT header"
        );

        for (index, tree) in decoded.iter().enumerate() {
            let entry = GptEntry::from_tree(tree)?;
            if entry.is_unused() {
                continue;
            }

            let Some(sectors) = entry.size_lba() else {
                output.issue(format!(
                    "partition {} has inverted range {}..{}",
                    index + 1,
                    entry.first_lba,
                    entry.last_lba
                ));
                continue;
            };
            let offset = checked_multiply_u64(entry.first_lba, SECTOR_SIZE, "partition offset")?;
            let length = checked_multiply_u64(sectors, SECTOR_SIZE, "partition length")?;

            let name = if entry.name.is_empty() {
                format!("{}/p{}", container.name(), index + 1)
            } else {
                format!("{}/{}", container.name(), entry.name)
            };

            match container.window_named(name, offset, length) {
                Ok(child) => {
                    tracing::debug!(
                        partition = index + 1,
                        kind = entry.type_name(),
                        type_guid = %entry.type_guid,
                        unique_guid = %entry.unique_guid,
                        offset,
                        length,
                        "Exposing GPT partition"
                    );
                    output.children.push(child);
                }
                Err(e) => output.issue(format!(
                    "partition {} ({}) exceeds the disk: {}",
                    index + 1,
                    entry.type_name(),
                    e
                )),
            }
        }

        let mut fields = ValueTree::new(header.offset);
        fields.size = entries.end().max(header.end()) - header.offset;
        fields.push("header", Value::Struct(header));
        fields.push("partition_entries", Value::Struct(entries));
        Ok(output.with_fields(fields))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use types::{EFI_SYSTEM, LINUX_FILESYSTEM};
    use uuid::Uuid;

    pub(crate) struct TestPartition {
        pub type_guid: Uuid,
        pub first_lba: u64,
        pub last_lba: u64,
        pub name: &'static str,
    }

    /// Disk with a protective MBR, a primary header at LBA 1 and entries at LBA 2
    pub(crate) fn create_test_gpt(sectors: usize, stride: usize, partitions: &[TestPartition]) -> Vec<u8> {
        let mut disk = vec![0u8; sectors * 512];

        // Protective MBR
        disk[0x1BE + 4] = 0xEE;
        disk[0x1BE + 8..0x1BE + 12].copy_from_slice(&1u32.to_le_bytes());
        disk[0x1BE + 12..0x1BE + 16].copy_from_slice(&(sectors as u32 - 1).to_le_bytes());
        disk[0x1FE] = 0x55;
        disk[0x1FF] = 0xAA;

        let count = 4usize;
        let entries_at = 1024;
        for (i, partition) in partitions.iter().enumerate() {
            let at = entries_at + i * stride;
            disk[at..at + 16].copy_from_slice(&partition.type_guid.to_bytes_le());
            disk[at + 16..at + 32].copy_from_slice(&Uuid::from_u128(i as u128 + 1).to_bytes_le());
            disk[at + 32..at + 40].copy_from_slice(&partition.first_lba.to_le_bytes());
            disk[at + 40..at + 48].copy_from_slice(&partition.last_lba.to_le_bytes());
            for (j, unit) in partition.name.encode_utf16().enumerate() {
                disk[at + 56 + j * 2..at + 58 + j * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }
        let entries_crc = crc32fast::hash(&disk[entries_at..entries_at + count * stride]);

        let h = 512;
        disk[h..h + 8].copy_from_slice(SIGNATURE);
        disk[h + 8..h + 12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        disk[h + 12..h + 16].copy_from_slice(&92u32.to_le_bytes());
        disk[h + 24..h + 32].copy_from_slice(&1u64.to_le_bytes());
        disk[h + 32..h + 40].copy_from_slice(&(sectors as u64 - 1).to_le_bytes());
        disk[h + 40..h + 48].copy_from_slice(&34u64.to_le_bytes());
        disk[h + 48..h + 56].copy_from_slice(&(sectors as u64 - 34).to_le_bytes());
        disk[h + 56..h + 72].copy_from_slice(&Uuid::from_u128(0xABCD).to_bytes_le());
        disk[h + 72..h + 80].copy_from_slice(&2u64.to_le_bytes());
        disk[h + 80..h + 84].copy_from_slice(&(count as u32).to_le_bytes());
        disk[h + 84..h + 88].copy_from_slice(&(stride as u32).to_le_bytes());
        disk[h + 88..h + 92].copy_from_slice(&entries_crc.to_le_bytes());
        let header_crc = crc32fast::hash(&disk[h..h + 92]);
        disk[h + 16..h + 20].copy_from_slice(&header_crc.to_le_bytes());

        disk
    }

    pub(crate) fn two_partitions() -> Vec<TestPartition> {
        vec![
            TestPartition {
                type_guid: EFI_SYSTEM,
                first_lba: 34,
                last_lba: 49,
                name: "EFI",
            },
            TestPartition {
                type_guid: LINUX_FILESYSTEM,
                first_lba: 50,
                last_lba: 89,
                name: "",
            },
        ]
    }

    #[test]
    fn test_matches_signature() {
        let dissector = GptDissector::new();
        let disk = Container::from_bytes("disk", create_test_gpt(128, 128, &[]));
        assert_eq!(dissector.matches(&disk), Confidence::CERTAIN);

        let blank = Container::from_bytes("blank", vec![0u8; 4096]);
        assert_eq!(dissector.matches(&blank), Confidence::NONE);
    }

    #[test]
    fn test_dissect_partitions() {
        let disk = create_test_gpt(128, 128, &two_partitions());
        let container = Container::from_bytes("disk.img", disk);
        let output = GptDissector::new().dissect(&container).unwrap();

        assert!(!output.partial, "issues: {:?}", output.issues);
        assert_eq!(output.children.len(), 2);
        assert_eq!(output.children[0].name(), "disk.img/EFI");
        assert_eq!(output.children[0].absolute_offset(), Some(34 * 512));
        assert_eq!(output.children[0].len(), 16 * 512);
        assert_eq!(output.children[1].name(), "disk.img/p2");
        assert_eq!(output.children[1].len(), 40 * 512);

        let fields = output.fields.unwrap();
        assert_eq!(fields.lookup("header.num_partition_entries").and_then(Value::as_u64), Some(4));
        let entries = fields
            .lookup("partition_entries.entries")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].offset, 1024 + 128);
    }

    #[test]
    fn test_honours_entry_stride() {
        let disk = create_test_gpt(128, 256, &two_partitions());
        let container = Container::from_bytes("disk", disk);
        let output = GptDissector::new().dissect(&container).unwrap();

        assert!(!output.partial);
        assert_eq!(output.children.len(), 2);
        assert_eq!(output.children[1].absolute_offset(), Some(50 * 512));
        let fields = output.fields.unwrap();
        let entries = fields
            .lookup("partition_entries.entries")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(entries[1].offset, 1024 + 256);
        assert_eq!(entries[1].size, 256);
    }

    #[test]
    fn test_crc_mismatch_is_partial() {
        let mut disk = create_test_gpt(128, 128, &two_partitions());
        // Corrupt an entry name without fixing the entries CRC
        disk[1024 + 56] = b'X';
        let container = Container::from_bytes("disk", disk);
        let output = GptDissector::new().dissect(&container).unwrap();

        assert!(output.partial);
        assert_eq!(output.issues.len(), 1);
        assert!(output.issues[0].contains("entries CRC32"));
        assert_eq!(output.children.len(), 2);
    }

    #[test]
    fn test_partition_past_end_is_skipped() {
        let partitions = vec![TestPartition {
            type_guid: LINUX_FILESYSTEM,
            first_lba: 100,
            last_lba: 400,
            name: "big",
        }];
        let container = Container::from_bytes("disk", create_test_gpt(128, 128, &partitions));
        let output = GptDissector::new().dissect(&container).unwrap();

        assert!(output.partial);
        assert!(output.children.is_empty());
        assert!(output.issues[0].contains("exceeds the disk"));
    }

    #[test]
    fn test_hostile_entry_count_fails() {
        let mut disk = create_test_gpt(128, 128, &[]);
        disk[512 + 80..512 + 84].copy_from_slice(&u32::MAX.to_le_bytes());
        let container = Container::from_bytes("disk", disk);
        assert!(matches!(
            GptDissector::new().dissect(&container),
            Err(DissectError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_entry_array_fails() {
        let disk = create_test_gpt(128, 128, &two_partitions());
        let container = Container::from_bytes("disk", disk[..1100].to_vec());
        assert!(matches!(
            GptDissector::new().dissect(&container),
            Err(DissectError::Bounds(_))
        ));
    }
}
