//! Transport collaborator — authenticated listen/dial primitives and the
//! per-call credential generator.
//!
//! Mutual-TLS identity and the wire protocol are external; the core only
//! needs cancellable, context-scoped calls. [`LoopbackTransport`] is the
//! in-crate implementation: it connects endpoints served in the same
//! process, which is what the integration tests and the standalone
//! binary use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::chain::{ChainError, StageContext};
use crate::endpoint::Endpoint;
use crate::types::Connection;

/// Errors from transport calls. All fatal at startup.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Workload identity could not be obtained.
    #[error("identity: {0}")]
    Identity(String),
    /// The listen address could not be bound.
    #[error("listen: {0}")]
    Listen(String),
    /// The upstream address could not be dialed.
    #[error("dial: {0}")]
    Dial(String),
}

/// A per-call credential with a bounded lifetime.
#[derive(Debug, Clone)]
pub struct Token {
    /// Opaque credential value.
    pub value: String,
    /// Expiry instant.
    pub expires_at: chrono::DateTime<Utc>,
}

/// Generates a fresh credential for each outbound call.
pub trait TokenSource: Send + Sync {
    /// Issue a token valid for at most the source's configured lifetime.
    fn token(&self) -> Result<Token, TransportError>;
}

/// Token source backed by the process identity, bounded by
/// `max_lifetime`.
pub struct IdentityTokenSource {
    name: String,
    max_lifetime: Duration,
}

impl IdentityTokenSource {
    /// Token source issuing credentials for the named identity.
    pub fn new(name: impl Into<String>, max_lifetime: Duration) -> Self {
        Self {
            name: name.into(),
            max_lifetime,
        }
    }
}

impl TokenSource for IdentityTokenSource {
    fn token(&self) -> Result<Token, TransportError> {
        let lifetime = chrono::Duration::from_std(self.max_lifetime)
            .map_err(|e| TransportError::Identity(format!("token lifetime: {e}")))?;
        Ok(Token {
            value: format!("{}:{}", self.name, Uuid::new_v4()),
            expires_at: Utc::now() + lifetime,
        })
    }
}

/// The next hop a request is forwarded to.
///
/// Forwarding failures propagate exactly like any other stage failure:
/// the server pipeline rolls back and reports to its caller.
#[async_trait]
pub trait NextHop: Send + Sync {
    /// Forward the (possibly mutated) request upstream.
    async fn request(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError>;

    /// Propagate a close upstream.
    async fn close(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError>;
}

/// Listen/dial surface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Serve an endpoint at the given URL.
    ///
    /// Returns the channel on which asynchronous listener failures are
    /// reported; any value on it is fatal to the process.
    async fn serve(
        &self,
        url: &Url,
        endpoint: Arc<Endpoint>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportError>, TransportError>;

    /// Dial the upstream endpoint at the given URL.
    async fn dial(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn NextHop>, TransportError>;
}

struct Served {
    endpoint: Arc<Endpoint>,
    // Keeps the listener's error channel open while served.
    _errors: mpsc::Sender<TransportError>,
}

/// Transport connecting endpoints inside one process.
#[derive(Default)]
pub struct LoopbackTransport {
    served: Mutex<HashMap<String, Served>>,
}

impl LoopbackTransport {
    /// A transport with no endpoints served yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Served>> {
        self.served.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn serve(
        &self,
        url: &Url,
        endpoint: Arc<Endpoint>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportError>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Listen("shutting down".to_owned()));
        }
        let (tx, rx) = mpsc::channel(1);
        let mut served = self.lock();
        if served.contains_key(url.as_str()) {
            return Err(TransportError::Listen(format!("{url} already bound")));
        }
        served.insert(
            url.as_str().to_owned(),
            Served {
                endpoint,
                _errors: tx,
            },
        );
        info!(%url, "listening");
        Ok(rx)
    }

    async fn dial(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn NextHop>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Dial("shutting down".to_owned()));
        }
        let peer = self.lock().get(url.as_str()).map(|s| Arc::clone(&s.endpoint));
        debug!(%url, reachable = peer.is_some(), "dialed upstream");
        Ok(Arc::new(LoopbackNextHop {
            url: url.clone(),
            peer,
        }))
    }
}

/// Next hop delivering into a locally served endpoint.
struct LoopbackNextHop {
    url: Url,
    peer: Option<Arc<Endpoint>>,
}

#[async_trait]
impl NextHop for LoopbackNextHop {
    async fn request(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        match &self.peer {
            Some(endpoint) => endpoint
                .request(ctx, conn)
                .await
                .map_err(|e| ChainError::stage("next-hop", e.to_string())),
            None => Err(ChainError::stage(
                "next-hop",
                format!("next hop unreachable: {}", self.url),
            )),
        }
    }

    async fn close(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        match &self.peer {
            Some(endpoint) => endpoint
                .close(ctx, conn)
                .await
                .map_err(|e| ChainError::stage("next-hop", e.to_string())),
            // Nothing was established upstream; releasing is a no-op.
            None => Ok(()),
        }
    }
}
