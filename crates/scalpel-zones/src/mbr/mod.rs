//! MBR (Master Boot Record) partition table dissector

pub mod types;

use scalpel_core::security::checked_multiply_u64;
use scalpel_core::{DissectError, ValueTree};
use scalpel_engine::{Confidence, DissectionOutput, Dissector, DissectorInfo};
use scalpel_layout::StructSpec;
use scalpel_pipeline::Container;
use types::{BOOT_SIGNATURE, MBR_SIZE, NUM_PARTITIONS, PARTITION_ENTRY_SIZE, PARTITION_TABLE_OFFSET};

/// Media type claimed by [`MbrDissector`]
pub const MEDIA_TYPE: &str = "application/x-mbr";

/// Sector size used to convert LBAs to byte offsets
pub const SECTOR_SIZE: u64 = 512;

/// MBR partition table
///
/// The Master Boot Record is the traditional partitioning scheme used by BIOS-based systems.
/// It supports up to 4 primary partitions, or 3 primary partitions and 1 extended partition.
///
/// # Structure
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0x000   446   Bootstrap code
/// 0x1BE   16    Partition entry 1
/// 0x1CE   16    Partition entry 2
/// 0x1DE   16    Partition entry 3
/// 0x1EE   16    Partition entry 4
/// 0x1FE   2     Boot signature (0xAA55)
/// ```
///
/// Each used entry becomes a window child. Extended partitions are exposed
/// like any other entry; their EBR chain is not walked.
pub struct MbrDissector {
    info: DissectorInfo,
    layout: StructSpec,
}

impl MbrDissector {
    pub fn new() -> Self {
        Self {
            info: DissectorInfo::new("mbr", "Master Boot Record partition table")
                .media_type(MEDIA_TYPE)
                .priority(10),
            layout: types::mbr_layout(),
        }
    }

    fn expose(
        &self,
        container: &Container,
        index: usize,
        entry: &ValueTree,
        output: &mut DissectionOutput,
    ) -> Result<(), DissectError> {
        let field = |name: &str| {
            entry
                .get_u64(name)
                .ok_or_else(|| DissectError::malformed(format!("entry {} lacks {}", index + 1, name)))
        };

        let partition_type = field("partition_type")? as u8;
        let lba_start = field("lba_start")?;
        let lba_length = field("lba_length")?;

        if partition_type == 0 || lba_length == 0 {
            return Ok(());
        }

        let offset = checked_multiply_u64(lba_start, SECTOR_SIZE, "partition offset")?;
        let length = checked_multiply_u64(lba_length, SECTOR_SIZE, "partition length")?;
        let name = format!("{}/p{}", container.name(), index + 1);

        match container.window_named(name, offset, length) {
            Ok(child) => {
                tracing::debug!(
                    partition = index + 1,
                    kind = types::partition_type_name(partition_type),
                    offset,
                    length,
                    "Exposing MBR partition"
                );
                output.children.push(child);
            }
            Err(e) => output.issue(format!(
                "partition {} ({}) exceeds the disk: {}",
                index + 1,
                types::partition_type_name(partition_type),
                e
            )),
        }
        Ok(())
    }
}

impl Default for MbrDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for MbrDissector {
    fn info(&self) -> &DissectorInfo {
        &self.info
    }

    fn matches(&self, container: &Container) -> Confidence {
        if container.len() < MBR_SIZE {
            return Confidence::NONE;
        }
        let Ok(table) = container.read(PARTITION_TABLE_OFFSET, MBR_SIZE - PARTITION_TABLE_OFFSET) else {
            return Confidence::NONE;
        };

        let signature_at = (NUM_PARTITIONS * PARTITION_ENTRY_SIZE) as usize;
        let signature = u16::from_le_bytes([table[signature_at], table[signature_at + 1]]);
        if signature != BOOT_SIGNATURE {
            return Confidence::NONE;
        }

        // Volume boot records share the signature; their "entries" are code.
        let statuses_valid = (0..NUM_PARTITIONS as usize)
            .map(|i| table[i * PARTITION_ENTRY_SIZE as usize])
            .all(|status| status == 0x00 || status == 0x80);
        if statuses_valid {
            Confidence::HIGH
        } else {
            Confidence::NONE
        }
    }

    fn dissect(&self, container: &Container) -> Result<DissectionOutput, DissectError> {
        let tree = self.layout.decode(container, 0)?;

        let signature = tree.get_u64("boot_signature").unwrap_or_default();
        if signature != BOOT_SIGNATURE as u64 {
            return Err(DissectError::malformed(format!(
                "invalid boot signature: expected 0x{:04X}, got 0x{:04X}",
                BOOT_SIGNATURE, signature
            )));
        }

        let entries = tree
            .get("entries")
            .and_then(|v| v.as_array())
            .ok_or_else(|| DissectError::malformed("partition table missing"))?;

        let mut output = DissectionOutput::new();
        for (index, entry) in entries.iter().enumerate() {
            self.expose(container, index, entry, &mut output)?;
        }

        Ok(output.with_fields(tree))
    }
}
