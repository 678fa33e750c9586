//! Registry collaborator — where the endpoint publishes itself so the
//! rest of the mesh can discover it.
//!
//! The mesh registry protocol is external; this module fixes the trait
//! surface the orchestrator calls once at the end of startup, and a
//! process-local implementation used by the binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors from registry calls. Registration failure is fatal at startup:
/// an endpoint the mesh cannot reach is useless.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    /// The registry refused the descriptor.
    #[error("registration rejected: {0}")]
    Rejected(String),
}

/// What the endpoint publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint name, unique within the mesh.
    pub name: String,
    /// Service names this endpoint serves.
    pub services: Vec<String>,
    /// Labels advertised per served service.
    pub labels: BTreeMap<String, BTreeMap<String, String>>,
    /// URL at which this endpoint listens.
    pub url: String,
    /// When the descriptor was built.
    pub registered_at: DateTime<Utc>,
}

/// A live registration, closed during shutdown cleanup.
#[async_trait]
pub trait Registration: Send + Sync {
    /// Withdraw the registration. Best effort; callers log failures.
    async fn close(&self) -> Result<(), RegistryError>;
}

/// Registry client surface.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publish the descriptor. Called once at the end of startup.
    async fn register(
        &self,
        cancel: &CancellationToken,
        descriptor: EndpointDescriptor,
    ) -> Result<Box<dyn Registration>, RegistryError>;
}

/// Process-local registry keeping descriptors in memory.
#[derive(Default)]
pub struct LocalRegistry {
    entries: Mutex<HashMap<String, EndpointDescriptor>>,
}

impl LocalRegistry {
    /// An empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up a registered descriptor by endpoint name (test helper).
    pub fn lookup(&self, name: &str) -> Option<EndpointDescriptor> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, EndpointDescriptor>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct LocalRegistration {
    registry: Arc<LocalRegistry>,
    name: String,
}

#[async_trait]
impl Registration for LocalRegistration {
    async fn close(&self) -> Result<(), RegistryError> {
        self.registry.lock().remove(&self.name);
        info!(name = %self.name, "registration withdrawn");
        Ok(())
    }
}

#[async_trait]
impl Registry for Arc<LocalRegistry> {
    async fn register(
        &self,
        cancel: &CancellationToken,
        descriptor: EndpointDescriptor,
    ) -> Result<Box<dyn Registration>, RegistryError> {
        if cancel.is_cancelled() {
            return Err(RegistryError::Unavailable("shutting down".to_owned()));
        }
        if descriptor.name.is_empty() {
            return Err(RegistryError::Rejected("empty endpoint name".to_owned()));
        }
        let name = descriptor.name.clone();
        info!(name = %name, url = %descriptor.url, "endpoint registered");
        self.lock().insert(name.clone(), descriptor);
        Ok(Box::new(LocalRegistration {
            registry: Arc::clone(self),
            name,
        }))
    }
}
