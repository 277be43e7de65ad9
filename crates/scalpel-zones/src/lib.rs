//! # Scalpel Zones
//!
//! Partition table dissectors built on the layout engine.
//!
//! - **MBR**: Master Boot Record (BIOS/legacy partitioning)
//! - **GPT**: GUID Partition Table (UEFI/modern partitioning)
//!
//! Each used partition entry is exposed as a window child of the disk, so the
//! engine carries on into whatever the partition holds.
//!
//! ## Example
//!
//! ```rust
//! use scalpel_engine::DissectorRegistry;
//!
//! let registry = DissectorRegistry::builder()
//!     .register_all(scalpel_zones::dissectors())
//!     .unwrap()
//!     .build();
//! assert_eq!(registry.len(), 2);
//! ```

pub mod gpt;
pub mod mbr;

pub use gpt::GptDissector;
pub use mbr::MbrDissector;

use scalpel_engine::Dissector;
use std::sync::Arc;

/// Every dissector this crate provides
pub fn dissectors() -> Vec<Arc<dyn Dissector>> {
    vec![Arc::new(MbrDissector::new()), Arc::new(GptDissector::new())]
}
