//! Provider adapter boundary
//!
//! The core talks to real infrastructure through [`Provider`] only; it
//! has no compile-time dependency on any cloud SDK or CLI. Adapters are
//! registered by name in a [`ProviderRegistry`] and every
//! [`ResourceSpec`](crate::resource::ResourceSpec) names the provider
//! that owns it.

use crate::resource::{Attributes, ResourceKind, ResourceSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Opaque adapter failure. Adapters map their own error enums into
/// this; the executor attaches the resource identity.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ProviderError(String);

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for ProviderError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Identifiers and attributes returned by a successful create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatedResource {
    /// Provider-assigned identifier.
    pub id: String,

    /// Provider-resolved attributes (assigned IPs, hostnames, ...).
    pub attributes: Attributes,
}

impl CreatedResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Capability interface every adapter implements.
///
/// `create` must be idempotent: re-invoking it for a resource that
/// already exists returns the existing identifiers instead of erroring,
/// so a re-run after a partial apply converges without duplicating
/// resources.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name (e.g. "proxmox", "linode").
    fn name(&self) -> &str;

    /// Create the resource, or return its existing identifiers if it is
    /// already there.
    async fn create(&self, spec: &ResourceSpec) -> Result<CreatedResource, ProviderError>;

    /// Read the current attributes of a resource, `None` if it does not
    /// exist.
    async fn read(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<Attributes>, ProviderError>;

    /// Apply the given attribute changes in place.
    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        changes: &Attributes,
    ) -> Result<(), ProviderError>;

    /// Delete the resource. Deleting a resource that is already gone is
    /// not an error.
    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ProviderError>;
}

/// Routes resources to the adapter that owns them. The fleet needs two:
/// a compute provider for the VMs and a network provider for the edge
/// load balancer, but any number can be registered.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(|k| k.as_str())
    }
}
