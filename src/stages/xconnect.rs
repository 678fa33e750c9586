//! Cross-connect stage — client side.
//!
//! Creates the upstream-facing interface and wires it to the server-side
//! interface brought up earlier in the same Open traversal, completing
//! the data-plane path through this endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::metadata::MetadataMap;
use crate::chain::{ChainError, Stage, StageContext};
use crate::dataplane::Dataplane;
use crate::types::{Connection, InterfaceHandle, Mechanism, MechanismKind};

/// Programs the cross-connect between the server-side and the
/// upstream-facing interface. Requires the server-side interface to
/// exist (ordering dependency on the bring-up stage).
pub struct XconnectStage {
    dataplane: Arc<dyn Dataplane>,
    peers: MetadataMap<InterfaceHandle>,
}

impl XconnectStage {
    /// Cross-connect stage backed by the given dataplane.
    pub fn new(dataplane: Arc<dyn Dataplane>) -> Self {
        Self {
            dataplane,
            peers: MetadataMap::new(),
        }
    }
}

#[async_trait]
impl Stage for XconnectStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        // Refresh: the cross-connect from the first traversal is still wired.
        if self.peers.contains(conn.id) {
            return Ok(());
        }
        let Some(server_iface) = conn.interface else {
            return Err(ChainError::MissingInterface(self.name().to_owned()));
        };

        let mechanism = conn
            .mechanism
            .clone()
            .unwrap_or_else(|| Mechanism::new(MechanismKind::Memif));
        let peer = self.dataplane.create_interface(&mechanism).await?;
        if let Err(err) = self.dataplane.up(peer).await {
            let _ = self.dataplane.delete_interface(peer).await;
            return Err(err.into());
        }
        if let Err(err) = self.dataplane.cross_connect(server_iface, peer).await {
            let _ = self.dataplane.delete_interface(peer).await;
            return Err(err.into());
        }
        self.peers.insert(conn.id, peer);
        debug!(conn_id = %conn.id, %server_iface, %peer, "cross-connect up");
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        let Some(peer) = self.peers.take(conn.id) else {
            return Ok(());
        };
        if let Some(server_iface) = conn.interface {
            self.dataplane.disconnect(server_iface, peer).await?;
        }
        self.dataplane.delete_interface(peer).await?;
        debug!(conn_id = %conn.id, %peer, "cross-connect removed");
        Ok(())
    }

    fn name(&self) -> &str {
        "xconnect"
    }
}
