//! The firewall endpoint — one server-side pipeline composed with one
//! client-side pipeline.
//!
//! The client chain is the terminal stage of the server chain, so a
//! forwarding failure unwinds everything the server side established,
//! and a close travels back through the exact inverse order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};

use crate::acl::AclStore;
use crate::chain::{Chain, ChainError, StageContext};
use crate::dataplane::Dataplane;
use crate::stages::aclfilter::AclFilterStage;
use crate::stages::authorize::AuthorizeStage;
use crate::stages::forward::NextHopStage;
use crate::stages::mechanisms::{memif_chain, MechanismsStage};
use crate::stages::meta::MetadataStage;
use crate::stages::passfd::{RecvFdStage, SendFdStage};
use crate::stages::relabel::RelabelStage;
use crate::stages::translate::TranslateStage;
use crate::stages::up::UpStage;
use crate::stages::xconnect::XconnectStage;
use crate::transport::{NextHop, TokenSource};
use crate::types::{Connection, ConnectionId, ConnectionState, MechanismKind};

/// Errors returned to the caller of a lifecycle event.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Another Open or Close for the same connection is still running.
    #[error("connection {0}: another lifecycle event is in flight")]
    Busy(ConnectionId),
    /// The pipeline failed; see the chain error for the stage.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Everything the endpoint pipeline depends on.
pub struct EndpointDeps {
    /// Endpoint name, used in logs, provenance, and path segments.
    pub name: String,
    /// The forwarding engine to program.
    pub dataplane: Arc<dyn Dataplane>,
    /// The immutable ACL rule set.
    pub acl: Arc<AclStore>,
    /// Labels rewritten onto outbound requests.
    pub labels: BTreeMap<String, String>,
    /// Per-call credential generator.
    pub token_source: Arc<dyn TokenSource>,
    /// The dialed upstream.
    pub next_hop: Arc<dyn NextHop>,
    /// Directory for per-connection sockets.
    pub runtime_dir: PathBuf,
}

/// A firewall network-service endpoint.
pub struct Endpoint {
    name: String,
    chain: Chain,
    inflight: Mutex<HashSet<ConnectionId>>,
}

impl Endpoint {
    /// Build the endpoint's composed pipeline.
    ///
    /// Server side: authorize → recvfd → sendfd → up → acl-filter →
    /// mechanisms → client chain. Client side: translate → relabel →
    /// metadata → xconnect → sendfd → recvfd → forward. Relabel runs
    /// before metadata so the provenance stamp survives the label
    /// rewrite.
    pub fn new(deps: EndpointDeps) -> Self {
        let memif_dir = deps.runtime_dir.join("memif");
        let mut mechanisms = HashMap::new();
        mechanisms.insert(MechanismKind::Memif, Arc::new(memif_chain(memif_dir)));

        let client_chain = Chain::builder("client")
            .stage(TranslateStage::new())
            .stage(RelabelStage::new(deps.labels))
            .stage(MetadataStage::new(&deps.name))
            .stage(XconnectStage::new(Arc::clone(&deps.dataplane)))
            .stage(SendFdStage::new())
            .stage(RecvFdStage::new(deps.runtime_dir.join("client")))
            .stage(NextHopStage::new(
                &deps.name,
                deps.token_source,
                deps.next_hop,
            ))
            .build();

        let chain = Chain::builder("server")
            .stage(AuthorizeStage)
            .stage(RecvFdStage::new(deps.runtime_dir.join("server")))
            .stage(SendFdStage::new())
            .stage(UpStage::new(Arc::clone(&deps.dataplane)))
            .stage(AclFilterStage::new(deps.dataplane, deps.acl))
            .stage(MechanismsStage::new(mechanisms))
            .stage(client_chain)
            .build();

        info!(name = %deps.name, stages = chain.len(), "endpoint pipeline built");
        Self {
            name: deps.name,
            chain,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Establish (or refresh) a connection through the full pipeline.
    ///
    /// On success the connection is `Established`. On failure every
    /// stage that opened has been closed again and the connection is
    /// left as the caller passed it, minus any best-effort rollback.
    pub async fn request(
        &self,
        ctx: &StageContext,
        conn: &mut Connection,
    ) -> Result<(), EndpointError> {
        let _guard = InflightGuard::acquire(&self.inflight, conn.id)?;
        debug!(endpoint = %self.name, conn_id = %conn.id, "open traversal starting");
        self.chain.open(ctx, conn).await?;
        conn.state = ConnectionState::Established;
        Ok(())
    }

    /// Tear a connection down through the full pipeline in reverse.
    ///
    /// Closing an already-closed connection is a no-op success. The
    /// traversal never short-circuits; the connection is marked `Closed`
    /// even when some stages failed to release cleanly, and the
    /// aggregate error is returned.
    pub async fn close(
        &self,
        ctx: &StageContext,
        conn: &mut Connection,
    ) -> Result<(), EndpointError> {
        if conn.state == ConnectionState::Closed {
            debug!(endpoint = %self.name, conn_id = %conn.id, "connection already closed");
            return Ok(());
        }
        let _guard = InflightGuard::acquire(&self.inflight, conn.id)?;
        let result = self.chain.close(ctx, conn).await;
        conn.state = ConnectionState::Closed;
        result.map_err(EndpointError::from)
    }
}

/// Marks a connection id as having an in-flight lifecycle event for the
/// duration of the traversal.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashSet<ConnectionId>>,
    id: ConnectionId,
}

impl<'a> InflightGuard<'a> {
    fn acquire(
        inflight: &'a Mutex<HashSet<ConnectionId>>,
        id: ConnectionId,
    ) -> Result<Self, EndpointError> {
        let mut set = inflight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id) {
            return Err(EndpointError::Busy(id));
        }
        Ok(Self { inflight, id })
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
