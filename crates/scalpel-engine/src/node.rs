//! Dissection result tree

use chrono::Utc;
use scalpel_core::{DissectionRecord, Fingerprint, Outcome, StopReason, ValueTree};
use scalpel_pipeline::Container;
use serde::{Deserialize, Serialize};

/// One dissected (or deliberately skipped) container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DissectionNode {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Dissector that produced this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dissector: Option<String>,
    pub outcome: Outcome,
    /// Why recursion stopped here, for skipped nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<ValueTree>,
    /// Classifications known for the fingerprint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Failures and damage encountered at this node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DissectionNode>,
    /// Rebuilt from a stored record instead of dissected
    #[serde(default)]
    pub cached: bool,
}

impl DissectionNode {
    /// A fresh node for a container, before any dissector ran
    pub fn new(container: &Container, fingerprint: Fingerprint) -> Self {
        Self {
            name: container.name().to_string(),
            fingerprint,
            length: container.len(),
            media_type: container.media_type().map(str::to_string),
            dissector: None,
            outcome: Outcome::Unrecognized,
            reason: None,
            fields: None,
            labels: Vec::new(),
            errors: Vec::new(),
            children: Vec::new(),
            cached: false,
        }
    }

    /// A node rebuilt from a stored record, without children
    pub fn from_record(record: &DissectionRecord) -> Self {
        Self {
            name: record.name.clone(),
            fingerprint: record.fingerprint,
            length: record.length,
            media_type: None,
            dissector: record.dissector.clone(),
            outcome: record.outcome,
            reason: None,
            fields: record.fields.clone(),
            labels: record.labels.clone(),
            errors: Vec::new(),
            children: Vec::new(),
            cached: true,
        }
    }

    /// A cached child whose record is missing or was never consulted
    pub fn unresolved(fingerprint: Fingerprint, name: String, length: u64) -> Self {
        Self {
            name,
            fingerprint,
            length,
            media_type: None,
            dissector: None,
            outcome: Outcome::Unrecognized,
            reason: None,
            fields: None,
            labels: Vec::new(),
            errors: Vec::new(),
            children: Vec::new(),
            cached: true,
        }
    }

    /// Stop recursion at this node
    pub fn stop(&mut self, reason: StopReason) {
        self.outcome = Outcome::Unrecognized;
        self.reason = Some(reason);
    }

    /// Depth-first, pre-order traversal of this node and its descendants
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    /// Number of nodes in this subtree
    pub fn count(&self) -> usize {
        self.walk().count()
    }

    /// First node in the subtree with the given fingerprint
    pub fn find(&self, fingerprint: &Fingerprint) -> Option<&DissectionNode> {
        self.walk().find(|n| &n.fingerprint == fingerprint)
    }

    /// Nodes in the subtree with the given outcome
    pub fn with_outcome(&self, outcome: Outcome) -> impl Iterator<Item = &DissectionNode> {
        self.walk().filter(move |n| n.outcome == outcome)
    }

    /// Persistable summary of this node
    pub fn to_record(&self, provenance: &str) -> DissectionRecord {
        DissectionRecord {
            fingerprint: self.fingerprint,
            name: self.name.clone(),
            length: self.length,
            outcome: self.outcome,
            dissector: self.dissector.clone(),
            fields: self.fields.clone(),
            children: self.children.iter().map(|c| c.fingerprint).collect(),
            labels: self.labels.clone(),
            recorded_at: Utc::now(),
            provenance: provenance.to_string(),
        }
    }
}

/// Iterator returned by [`DissectionNode::walk`]
pub struct Walk<'a> {
    stack: Vec<&'a DissectionNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a DissectionNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}
