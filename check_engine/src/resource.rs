//! The fetched-data side of the resource model: [`Resource`], its
//! [`ResourceCollection`] container, and the connector-level [`InfoData`]
//! envelope, grounded in the dynamic-model shape the schema compiler
//! (`schema.rs`) describes.
//!
//! Field values are held as a [`serde_json::Value`] map rather than a
//! generated struct per resource type — the compiled schema (`CompiledSchema`)
//! describes the *shape* a resource's `data` is expected to have, and the
//! Field-Path Engine walks `data` directly rather than through typed Rust
//! accessors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single fetched item, e.g. one GitHub repository or one IAM role.
///
/// `resource_type` is the compiled schema's fully-qualified name (see
/// [`crate::schema::SchemaRegistry::fully_qualified_name`]) — Checks bind to
/// it by string comparison, never by reflecting over `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub source_connector: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// The schema-shaped field data, keyed by declared field name.
    #[serde(default)]
    pub data: Value,
}

impl Resource {
    #[must_use]
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>, source_connector: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            source_connector: source_connector.into(),
            created_at: None,
            updated_at: None,
            tags: Vec::new(),
            data,
        }
    }

    /// Look up a top-level declared field on this resource's `data`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }
}

/// The result of one connector fetch: every resource of a given type plus
/// bookkeeping about the fetch itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCollection {
    pub resource_type: String,
    pub source_connector: String,
    pub total_count: usize,
    pub fetched_at: DateTime<Utc>,
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub metadata: Value,
}

impl ResourceCollection {
    #[must_use]
    pub fn new(resource_type: impl Into<String>, source_connector: impl Into<String>, resources: Vec<Resource>) -> Self {
        let total_count = resources.len();
        Self {
            resource_type: resource_type.into(),
            source_connector: source_connector.into(),
            total_count,
            fetched_at: Utc::now(),
            resources,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn push(&mut self, resource: Resource) {
        self.resources.push(resource);
        self.total_count = self.resources.len();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }
}

/// Connector-level envelope returned alongside a [`ResourceCollection`] by a
/// `ConnectorService::fetch` call — provider-scoped metadata that doesn't
/// belong to any one resource (account identity, fetch window, rate-limit
/// state reported by the provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoData {
    pub provider: String,
    #[serde(default)]
    pub account_id: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub extra: Value,
}

impl InfoData {
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            account_id: None,
            fetched_at: Utc::now(),
            extra: Value::Object(serde_json::Map::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_field_lookup() {
        let data = serde_json::json!({"private": true, "name": "infra"});
        let resource = Resource::new("r1", "con_mon_v2.mappings.github.GithubResource", "github", data);
        assert_eq!(resource.field("private"), Some(&Value::Bool(true)));
        assert_eq!(resource.field("missing"), None);
    }

    #[test]
    fn test_collection_push_updates_count() {
        let mut collection = ResourceCollection::new("con_mon_v2.mappings.github.GithubResource", "github", Vec::new());
        assert_eq!(collection.total_count, 0);
        collection.push(Resource::new("r1", "X", "github", Value::Null));
        assert_eq!(collection.total_count, 1);
        assert!(!collection.is_empty());
    }

    #[test]
    fn test_add_tag_deduplicates() {
        let mut resource = Resource::new("r1", "X", "github", Value::Null);
        resource.add_tag("prod");
        resource.add_tag("prod");
        assert_eq!(resource.tags, vec!["prod".to_owned()]);
    }
}
