use std::collections::HashMap;

use crate::error::X402Error;
use crate::policy::{PolicyEntry, ProtectedPaths};

/// Supplies the policy entries attached to a resource.
pub trait ResourceCatalog: Send + Sync {
    fn policies_for(&self, resource_id: &str) -> Vec<PolicyEntry>;
}

/// Catalog built from configuration.
///
/// A resource listed explicitly uses exactly its own entries, so listing it
/// with only disabled entries opts it out of a matching path pattern.
/// Unlisted resources matching a protected pattern get one global entry.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    resources: HashMap<String, Vec<PolicyEntry>>,
    protected: ProtectedPaths,
}

impl StaticCatalog {
    pub fn new(protected: ProtectedPaths) -> Self {
        Self {
            resources: HashMap::new(),
            protected,
        }
    }

    /// Parse a JSON object mapping resource ids to entry lists.
    pub fn from_json(json: &str, protected: ProtectedPaths) -> Result<Self, X402Error> {
        let resources: HashMap<String, Vec<PolicyEntry>> = serde_json::from_str(json)?;
        Ok(Self {
            resources,
            protected,
        })
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>, entries: Vec<PolicyEntry>) -> Self {
        self.resources.insert(resource_id.into(), entries);
        self
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.protected.is_empty()
    }
}

impl ResourceCatalog for StaticCatalog {
    fn policies_for(&self, resource_id: &str) -> Vec<PolicyEntry> {
        if let Some(entries) = self.resources.get(resource_id) {
            return entries.clone();
        }
        if self.protected.matches(resource_id) {
            return vec![PolicyEntry::global()];
        }
        Vec::new()
    }
}
