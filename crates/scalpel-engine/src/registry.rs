//! Dissector registry, fixed before any job runs

use crate::dissector::{Dissector, DissectorInfo};
use std::cmp::Reverse;
use std::sync::Arc;
use thiserror::Error;

/// Registry construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two dissectors share a name
    #[error("Dissector already registered: {0}")]
    AlreadyRegistered(String),

    /// A dissector declared an empty name
    #[error("Dissector name must not be empty")]
    EmptyName,
}

/// Collects dissectors before freezing them into a [`DissectorRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    dissectors: Vec<Arc<dyn Dissector>>,
}

impl RegistryBuilder {
    /// Register a dissector
    pub fn register(self, dissector: impl Dissector + 'static) -> Result<Self, RegistryError> {
        self.register_shared(Arc::new(dissector))
    }

    /// Register an already shared dissector
    pub fn register_shared(mut self, dissector: Arc<dyn Dissector>) -> Result<Self, RegistryError> {
        let name = &dissector.info().name;
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.dissectors.iter().any(|d| &d.info().name == name) {
            return Err(RegistryError::AlreadyRegistered(name.clone()));
        }

        tracing::debug!(
            dissector = %name,
            priority = dissector.info().priority,
            "Registering dissector"
        );
        self.dissectors.push(dissector);
        Ok(self)
    }

    /// Register every dissector of a capability set
    pub fn register_all<I>(self, dissectors: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = Arc<dyn Dissector>>,
    {
        dissectors
            .into_iter()
            .try_fold(self, |builder, d| builder.register_shared(d))
    }

    /// Freeze into priority order: descending priority, then registration order
    pub fn build(mut self) -> DissectorRegistry {
        // Stable sort keeps registration order among equal priorities.
        self.dissectors.sort_by_key(|d| Reverse(d.info().priority));
        DissectorRegistry {
            dissectors: self.dissectors,
        }
    }
}

/// Immutable, priority-ordered set of dissectors
#[derive(Default)]
pub struct DissectorRegistry {
    dissectors: Vec<Arc<dyn Dissector>>,
}

impl DissectorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Dissectors eligible for a container, in the order they are tried
    ///
    /// With a media-type hint, only dissectors declaring that type or
    /// declaring no types at all are candidates.
    pub fn candidates<'a>(
        &'a self,
        media_type: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Arc<dyn Dissector>> + 'a {
        self.dissectors
            .iter()
            .filter(move |d| media_type.map_or(true, |m| d.info().accepts(m)))
    }

    /// Get a dissector by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Dissector>> {
        self.dissectors.iter().find(|d| d.info().name == name)
    }

    /// Metadata of every dissector, in priority order
    pub fn infos(&self) -> impl Iterator<Item = &DissectorInfo> {
        self.dissectors.iter().map(|d| d.info())
    }

    pub fn len(&self) -> usize {
        self.dissectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dissectors.is_empty()
    }
}

impl std::fmt::Debug for DissectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.dissectors.iter().map(|d| &d.info().name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissector::{Confidence, DissectionOutput};
    use scalpel_core::DissectError;
    use scalpel_pipeline::Container;

    struct Named(DissectorInfo);

    impl Dissector for Named {
        fn info(&self) -> &DissectorInfo {
            &self.0
        }

        fn matches(&self, _container: &Container) -> Confidence {
            Confidence::NONE
        }

        fn dissect(&self, _container: &Container) -> Result<DissectionOutput, DissectError> {
            Ok(DissectionOutput::new())
        }
    }

    fn named(name: &str, priority: i32) -> Named {
        Named(DissectorInfo::new(name, "test").priority(priority))
    }

    fn order(registry: &DissectorRegistry, media_type: Option<&str>) -> Vec<String> {
        registry
            .candidates(media_type)
            .map(|d| d.info().name.clone())
            .collect()
    }

    #[test]
    fn test_priority_then_registration_order() {
        let registry = DissectorRegistry::builder()
            .register(named("low", 1))
            .unwrap()
            .register(named("first-high", 10))
            .unwrap()
            .register(named("second-high", 10))
            .unwrap()
            .build();

        assert_eq!(order(&registry, None), vec!["first-high", "second-high", "low"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.get("low").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = DissectorRegistry::builder()
            .register(named("mbr", 1))
            .unwrap()
            .register(named("mbr", 2));
        assert_eq!(
            result.err(),
            Some(RegistryError::AlreadyRegistered("mbr".to_string()))
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = DissectorRegistry::builder().register(named("", 1));
        assert_eq!(result.err(), Some(RegistryError::EmptyName));
    }

    #[test]
    fn test_media_type_filter() {
        let registry = DissectorRegistry::builder()
            .register(Named(
                DissectorInfo::new("mbr", "test").media_type("application/x-mbr"),
            ))
            .unwrap()
            .register(Named(
                DissectorInfo::new("gpt", "test").media_type("application/x-gpt"),
            ))
            .unwrap()
            .register(named("generic", 0))
            .unwrap()
            .build();

        assert_eq!(order(&registry, Some("application/x-gpt")), vec!["gpt", "generic"]);
        assert_eq!(order(&registry, None).len(), 3);
    }

    #[test]
    fn test_register_all() {
        let set: Vec<Arc<dyn Dissector>> = vec![Arc::new(named("a", 0)), Arc::new(named("b", 0))];
        let registry = DissectorRegistry::builder().register_all(set).unwrap().build();
        assert_eq!(order(&registry, None), vec!["a", "b"]);
    }
}
