//! Recursive dissection with cycle, depth and budget guards
//!
//! Each node moves through `Matching` (cancellation check, guards, hash
//! lookup, cache lookup, dissector selection) and then either `Decoding`
//! into `ok`/`partial`, or ends `unrecognized`/`failed`. Errors stay local
//! to the node that raised them; only cancellation ends a traversal early.

use crate::dissector::DissectionOutput;
use crate::node::DissectionNode;
use crate::registry::DissectorRegistry;
use scalpel_core::{
    DissectError, DissectionDatabase, DissectionRecord, Fingerprint, HashRecord, JobError, Outcome,
    StopReason,
};
use scalpel_pipeline::Container;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Reverse;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provenance written into every record
pub const PROVENANCE: &str = concat!("scalpel/", env!("CARGO_PKG_VERSION"));

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deepest nesting level dissected; the root is level 0
    pub max_depth: usize,
    /// Serve stored `ok`/`partial` records instead of dissecting again
    pub use_cache: bool,
    /// Store records and hash labels after dissecting
    pub persist: bool,
    /// Do not dissect fingerprints that already carry hash labels
    pub skip_classified: bool,
    /// Children kept per node; extra children are dropped
    pub max_children: usize,
    /// Nodes visited per job
    pub max_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 16,
            use_cache: true,
            persist: true,
            skip_classified: false,
            max_children: 1024,
            max_nodes: 65_536,
        }
    }
}

/// Cooperative cancellation flag shared between a job and its owner
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fingerprints on the path from the root to the current node
///
/// Lives on the stack of the recursion, so sibling branches never observe
/// each other's entries.
struct Lineage<'a> {
    fingerprint: Fingerprint,
    parent: Option<&'a Lineage<'a>>,
}

fn on_path(lineage: Option<&Lineage<'_>>, fingerprint: &Fingerprint) -> bool {
    let mut current = lineage;
    while let Some(entry) = current {
        if entry.fingerprint == *fingerprint {
            return true;
        }
        current = entry.parent;
    }
    false
}

enum Selection {
    Claimed {
        dissector: String,
        output: DissectionOutput,
        errors: Vec<String>,
    },
    Failed(Vec<String>),
    Unclaimed,
}

/// Drives dissectors recursively over a root container
pub struct DissectionEngine {
    registry: Arc<DissectorRegistry>,
    database: Option<Arc<dyn DissectionDatabase>>,
    config: EngineConfig,
}

impl DissectionEngine {
    pub fn new(registry: Arc<DissectorRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            database: None,
            config,
        }
    }

    /// Attach the hash/dissection database
    pub fn with_database(mut self, database: Arc<dyn DissectionDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn registry(&self) -> &DissectorRegistry {
        &self.registry
    }

    pub fn database(&self) -> Option<&Arc<dyn DissectionDatabase>> {
        self.database.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dissect a root container to completion
    pub fn dissect(&self, root: &Container) -> Result<DissectionNode, JobError> {
        self.dissect_with(root, &CancellationToken::new())
    }

    /// Dissect a root container, checking `cancel` before every node
    ///
    /// # Errors
    ///
    /// Only [`JobError::Cancelled`]; every other failure is recorded in the
    /// node that raised it.
    pub fn dissect_with(
        &self,
        root: &Container,
        cancel: &CancellationToken,
    ) -> Result<DissectionNode, JobError> {
        info!(container = %root.name(), length = root.len(), "Starting dissection");

        let mut traversal = Traversal {
            engine: self,
            cancel,
            visited: 0,
        };
        let result = traversal.visit(root, None, 0);
        self.flush_database();
        let node = result?;

        info!(
            container = %root.name(),
            outcome = %node.outcome,
            nodes = traversal.visited,
            "Dissection finished"
        );
        Ok(node)
    }

    /// Make the root's records durable, whether or not it completed
    fn flush_database(&self) {
        if !self.config.persist {
            return;
        }
        if let Some(database) = &self.database {
            if let Err(e) = database.flush() {
                warn!(ledger = database.identify(), error = %e, "Failed to flush ledger");
            }
        }
    }
}

struct Traversal<'e> {
    engine: &'e DissectionEngine,
    cancel: &'e CancellationToken,
    visited: usize,
}

impl Traversal<'_> {
    fn visit(
        &mut self,
        container: &Container,
        lineage: Option<&Lineage<'_>>,
        depth: usize,
    ) -> Result<DissectionNode, JobError> {
        self.check_cancelled()?;

        let engine = self.engine;
        let config = &engine.config;
        let fingerprint = container.fingerprint();
        let mut node = DissectionNode::new(container, fingerprint);

        if let Some(reason) = self.guard(container.name(), &fingerprint, lineage, depth) {
            node.stop(reason);
            return Ok(node);
        }
        self.visited += 1;

        if let Some(hash) = self.lookup_hash(&fingerprint) {
            node.labels = hash.labels;
        }
        if config.skip_classified && !node.labels.is_empty() {
            debug!(container = %node.name, labels = ?node.labels, "Skipping classified content");
            node.stop(StopReason::KnownContent);
            return Ok(node);
        }

        if config.use_cache {
            if let Some(record) = self.lookup_dissection(&fingerprint) {
                if record.outcome.is_reusable() {
                    debug!(container = %node.name, fingerprint = %fingerprint.short(), "Cache hit");
                    let mut cached = self.replay(&record, lineage, depth)?;
                    cached.name = node.name;
                    cached.length = node.length;
                    cached.media_type = node.media_type;
                    cached.labels = node.labels;
                    return Ok(cached);
                }
            }
        }

        match self.select(container) {
            Selection::Unclaimed => {
                debug!(container = %node.name, "No dissector claimed container");
            }
            Selection::Failed(errors) => {
                node.outcome = Outcome::Failed;
                node.errors = errors;
            }
            Selection::Claimed {
                dissector,
                output,
                errors,
            } => {
                node.dissector = Some(dissector);
                node.errors = errors;
                node.fields = output.fields;
                node.outcome = if output.partial {
                    Outcome::Partial
                } else {
                    Outcome::Ok
                };
                node.errors.extend(output.issues);

                let mut children = output.children;
                if children.len() > config.max_children {
                    warn!(
                        container = %node.name,
                        exposed = children.len(),
                        limit = config.max_children,
                        "Dropping children beyond limit"
                    );
                    node.errors.push(format!(
                        "{} children dropped beyond limit of {}",
                        children.len() - config.max_children,
                        config.max_children
                    ));
                    children.truncate(config.max_children);
                    node.outcome = Outcome::Partial;
                }

                let lineage = Lineage {
                    fingerprint,
                    parent: lineage,
                };
                for child in &children {
                    let child_node = self.visit(child, Some(&lineage), depth + 1)?;
                    node.children.push(child_node);
                }
            }
        }

        self.persist(&node);
        Ok(node)
    }

    /// Rebuild a subtree from stored records
    fn replay(
        &mut self,
        record: &DissectionRecord,
        lineage: Option<&Lineage<'_>>,
        depth: usize,
    ) -> Result<DissectionNode, JobError> {
        let mut node = DissectionNode::from_record(record);
        let lineage = Lineage {
            fingerprint: record.fingerprint,
            parent: lineage,
        };

        for fingerprint in &record.children {
            self.check_cancelled()?;

            let stored = self.lookup_dissection(fingerprint);
            let (name, length) = stored
                .as_ref()
                .map_or_else(|| (fingerprint.short(), 0), |r| (r.name.clone(), r.length));

            let child = match self.guard(&name, fingerprint, Some(&lineage), depth + 1) {
                Some(reason) => {
                    let mut child = DissectionNode::unresolved(*fingerprint, name, length);
                    child.stop(reason);
                    child
                }
                None => {
                    self.visited += 1;
                    match stored {
                        Some(r) if r.outcome.is_reusable() => {
                            self.replay(&r, Some(&lineage), depth + 1)?
                        }
                        Some(r) => DissectionNode::from_record(&r),
                        None => {
                            let mut child = DissectionNode::unresolved(*fingerprint, name, length);
                            child.stop(StopReason::NotRecorded);
                            child
                        }
                    }
                }
            };
            node.children.push(child);
        }

        Ok(node)
    }

    fn check_cancelled(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            info!(nodes = self.visited, "Dissection cancelled");
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    fn guard(
        &self,
        name: &str,
        fingerprint: &Fingerprint,
        lineage: Option<&Lineage<'_>>,
        depth: usize,
    ) -> Option<StopReason> {
        let config = &self.engine.config;
        if on_path(lineage, fingerprint) {
            warn!(container = %name, fingerprint = %fingerprint.short(), "Cycle detected");
            return Some(StopReason::CycleDetected);
        }
        if depth > config.max_depth {
            warn!(container = %name, depth, limit = config.max_depth, "Maximum depth exceeded");
            return Some(StopReason::DepthExceeded);
        }
        if self.visited >= config.max_nodes {
            warn!(container = %name, limit = config.max_nodes, "Node budget exhausted");
            return Some(StopReason::NodeBudgetExhausted);
        }
        None
    }

    /// Try claimants until one completes
    ///
    /// Every candidate's `matches` runs first; claimants are then tried by
    /// descending priority, higher confidence first among equal priorities,
    /// and registration order after that.
    fn select(&self, container: &Container) -> Selection {
        let mut errors = Vec::new();
        let mut claims = Vec::new();

        for dissector in self.engine.registry.candidates(container.media_type()) {
            match isolate(|| dissector.matches(container)) {
                Ok(confidence) if confidence.is_claim() => claims.push((dissector, confidence)),
                Ok(_) => {}
                Err(e) => {
                    let name = &dissector.info().name;
                    warn!(dissector = %name, container = %container.name(), error = %e, "Match failed");
                    errors.push(format!("{name}: {e}"));
                }
            }
        }
        claims.sort_by_key(|(dissector, confidence)| {
            (Reverse(dissector.info().priority), Reverse(*confidence))
        });

        for (dissector, confidence) in claims {
            let name = &dissector.info().name;
            debug!(
                dissector = %name,
                container = %container.name(),
                confidence = confidence.0,
                "Dissector claimed container"
            );
            match isolate(|| dissector.dissect(container)).and_then(|result| result) {
                Ok(output) => {
                    return Selection::Claimed {
                        dissector: name.clone(),
                        output,
                        errors,
                    }
                }
                Err(e) => {
                    warn!(dissector = %name, container = %container.name(), error = %e, "Dissection failed");
                    errors.push(format!("{name}: {e}"));
                }
            }
        }

        if errors.is_empty() {
            Selection::Unclaimed
        } else {
            Selection::Failed(errors)
        }
    }

    fn lookup_hash(&self, fingerprint: &Fingerprint) -> Option<HashRecord> {
        let database = self.engine.database.as_ref()?;
        match database.lookup_hash(fingerprint) {
            Ok(record) => record,
            Err(e) => {
                warn!(ledger = database.identify(), error = %e, "Hash lookup failed");
                None
            }
        }
    }

    fn lookup_dissection(&self, fingerprint: &Fingerprint) -> Option<DissectionRecord> {
        let database = self.engine.database.as_ref()?;
        match database.lookup_dissection(fingerprint) {
            Ok(record) => record,
            Err(e) => {
                warn!(ledger = database.identify(), error = %e, "Dissection lookup failed");
                None
            }
        }
    }

    /// Best-effort write of the node's record and hash label
    fn persist(&self, node: &DissectionNode) {
        if !self.engine.config.persist {
            return;
        }
        let Some(database) = self.engine.database.as_ref() else {
            return;
        };

        let record = node.to_record(PROVENANCE);
        if let Err(e) = database.store(&node.fingerprint, &record) {
            warn!(ledger = database.identify(), container = %node.name, error = %e, "Failed to store dissection record");
        }

        if !node.outcome.is_reusable() {
            return;
        }
        if let Some(dissector) = &node.dissector {
            let hash = HashRecord::new(node.fingerprint, [dissector.as_str()]);
            if let Err(e) = database.store_hash(&hash) {
                warn!(ledger = database.identify(), container = %node.name, error = %e, "Failed to store hash label");
            }
        }
    }
}

/// Run dissector code, turning a panic into [`DissectError::Panicked`]
fn isolate<T>(f: impl FnOnce() -> T) -> Result<T, DissectError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| DissectError::Panicked(panic_message(payload.as_ref())))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
