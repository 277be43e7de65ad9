//! # Scalpel Engine
//!
//! Recursive dissection of nested binary containers.
//!
//! - [`Dissector`]: the contract format handlers implement
//! - [`DissectorRegistry`]: the fixed, priority-ordered set of handlers
//! - [`DissectionEngine`]: walks a root container, guarding against cycles,
//!   runaway depth and fan-out, and persisting results
//! - [`WorkerPool`]: runs independent jobs with bounded parallelism
//!
//! ## Example
//!
//! ```rust
//! use scalpel_engine::{
//!     Confidence, DissectionEngine, DissectionOutput, Dissector, DissectorInfo,
//!     DissectorRegistry, EngineConfig,
//! };
//! use scalpel_core::{DissectError, Outcome};
//! use scalpel_pipeline::Container;
//! use std::sync::Arc;
//!
//! struct Zeroes(DissectorInfo);
//!
//! impl Dissector for Zeroes {
//!     fn info(&self) -> &DissectorInfo {
//!         &self.0
//!     }
//!
//!     fn matches(&self, container: &Container) -> Confidence {
//!         container.read(0, 1).map(|b| b[0] == 0).unwrap_or(false).into()
//!     }
//!
//!     fn dissect(&self, _container: &Container) -> Result<DissectionOutput, DissectError> {
//!         Ok(DissectionOutput::new())
//!     }
//! }
//!
//! let registry = DissectorRegistry::builder()
//!     .register(Zeroes(DissectorInfo::new("zeroes", "all-zero blocks")))
//!     .unwrap()
//!     .build();
//! let engine = DissectionEngine::new(Arc::new(registry), EngineConfig::default());
//!
//! let node = engine.dissect(&Container::from_bytes("blank", vec![0u8; 512])).unwrap();
//! assert_eq!(node.outcome, Outcome::Ok);
//! assert_eq!(node.dissector.as_deref(), Some("zeroes"));
//! ```

pub mod dissector;
pub mod engine;
pub mod node;
pub mod pool;
pub mod registry;

pub use dissector::{Confidence, DissectionOutput, Dissector, DissectorInfo};
pub use engine::{CancellationToken, DissectionEngine, EngineConfig, PROVENANCE};
pub use node::{DissectionNode, Walk};
pub use pool::{JobHandle, JobResult, PoolConfig, WorkerPool};
pub use registry::{DissectorRegistry, RegistryBuilder, RegistryError};
