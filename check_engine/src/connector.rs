//! `ConnectorService`: the boundary between a cloud/SaaS provider and the
//! resource model (§3, §6). A connector turns a credential bag into an
//! [`InfoData`] envelope plus a [`ResourceCollection`] of a single resource
//! type; the kernel never speaks to a provider API directly.
//!
//! Fetching, pagination, and provider auth all live on the other side of
//! this trait, in the embedding host — this crate only defines the contract
//! and a deterministic in-memory double for tests.

use std::collections::HashMap;

use crate::resource::{InfoData, ResourceCollection};
use crate::types::ConnectionType;

/// A provider-side data source bound to one `ConnectionType` and one
/// resource model.
///
/// Implementations are expected to be cheap to construct per fetch and safe
/// to call from multiple worker threads concurrently — the batch
/// orchestrator (§4.7) may invoke `fetch` from several `rayon` workers at
/// once against distinct `(provider, resource_type)` pairs.
pub trait ConnectorService: Send + Sync {
    /// Which provider this connector speaks to.
    fn connection_type(&self) -> ConnectionType;

    /// Fully-qualified resource type this connector fetches (see
    /// [`crate::schema::SchemaRegistry::fully_qualified_name`]).
    fn resource_type(&self) -> &str;

    /// Fetch the current set of resources using the supplied credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError`] for authentication failures, rate limits,
    /// or any other condition that prevents a complete fetch.
    fn fetch(&self, credentials: &HashMap<String, String>) -> Result<(InfoData, ResourceCollection), ConnectorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector authentication failed: {0}")]
    AuthFailed(String),

    #[error("connector rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("connector request failed: {0}")]
    RequestFailed(String),

    #[error("connector returned malformed data: {0}")]
    Malformed(String),
}

/// An in-memory [`ConnectorService`] double that returns a fixed collection,
/// for generator and orchestrator tests — never performs network I/O.
pub struct MockConnectorService {
    connection_type: ConnectionType,
    resource_type: String,
    info: InfoData,
    collection: ResourceCollection,
}

impl MockConnectorService {
    #[must_use]
    pub fn new(connection_type: ConnectionType, info: InfoData, collection: ResourceCollection) -> Self {
        Self {
            connection_type,
            resource_type: collection.resource_type.clone(),
            info,
            collection,
        }
    }
}

impl ConnectorService for MockConnectorService {
    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn fetch(&self, _credentials: &HashMap<String, String>) -> Result<(InfoData, ResourceCollection), ConnectorError> {
        Ok((self.info.clone(), self.collection.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use serde_json::json;

    #[test]
    fn test_mock_connector_returns_fixed_collection() {
        let info = InfoData::new("github");
        let resource = Resource::new("r1", "con_mon_v2.mappings.github.GithubResource", "github", json!({"private": true}));
        let collection = ResourceCollection::new("con_mon_v2.mappings.github.GithubResource", "github", vec![resource]);
        let connector = MockConnectorService::new(ConnectionType::Github, info, collection);

        let (info_out, collection_out) = connector.fetch(&HashMap::new()).unwrap();
        assert_eq!(info_out.provider, "github");
        assert_eq!(collection_out.total_count, 1);
        assert_eq!(connector.connection_type(), ConnectionType::Github);
    }
}
