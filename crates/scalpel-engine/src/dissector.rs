//! The contract format handlers implement

use scalpel_core::{DissectError, ValueTree};
use scalpel_pipeline::Container;
use serde::{Deserialize, Serialize};

/// Static metadata describing a dissector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DissectorInfo {
    /// Unique dissector name, also stored as a hash label
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Media types this dissector declares; empty means "any"
    #[serde(default)]
    pub media_types: Vec<String>,
    /// Higher priorities are tried first
    #[serde(default)]
    pub priority: i32,
}

impl DissectorInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            media_types: Vec::new(),
            priority: 0,
        }
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_types.push(media_type.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether a container hinted as `media_type` is a candidate for this dissector
    pub fn accepts(&self, media_type: &str) -> bool {
        self.media_types.is_empty() || self.media_types.iter().any(|m| m == media_type)
    }
}

/// How strongly a dissector claims a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Confidence(pub u8);

impl Confidence {
    pub const NONE: Confidence = Confidence(0);
    pub const LOW: Confidence = Confidence(25);
    pub const HIGH: Confidence = Confidence(75);
    pub const CERTAIN: Confidence = Confidence(100);

    /// Any confidence above [`NONE`](Self::NONE) is a claim
    pub fn is_claim(self) -> bool {
        self > Self::NONE
    }
}

impl From<bool> for Confidence {
    fn from(matched: bool) -> Self {
        if matched {
            Confidence::CERTAIN
        } else {
            Confidence::NONE
        }
    }
}

/// What a successful dissection produced
#[derive(Debug, Clone, Default)]
pub struct DissectionOutput {
    /// Decoded structure of the container, if any
    pub fields: Option<ValueTree>,
    /// Derived containers to dissect next, in exposure order
    pub children: Vec<Container>,
    /// Some structures were damaged or skipped
    pub partial: bool,
    /// Descriptions of the damage behind `partial`
    pub issues: Vec<String>,
}

impl DissectionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields(mut self, fields: ValueTree) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn child(mut self, child: Container) -> Self {
        self.children.push(child);
        self
    }

    /// Record damage and mark the output partial
    pub fn issue(&mut self, issue: impl Into<String>) {
        self.partial = true;
        self.issues.push(issue.into());
    }
}

/// A pluggable format handler
///
/// Implementations must tolerate truncated and adversarial input: every
/// failure is reported as a [`DissectError`]. The engine also catches
/// panics, but a panicking dissector is a bug.
pub trait Dissector: Send + Sync {
    /// Static metadata
    fn info(&self) -> &DissectorInfo;

    /// Cheap signature check; must not decode the whole container
    fn matches(&self, container: &Container) -> Confidence;

    /// Decode the container and expose child containers
    fn dissect(&self, container: &Container) -> Result<DissectionOutput, DissectError>;
}
