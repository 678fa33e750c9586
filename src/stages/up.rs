//! Interface bring-up stage — creates and ups the server-side dataplane
//! interface for the connection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::metadata::MetadataMap;
use crate::chain::{ChainError, Stage, StageContext};
use crate::dataplane::Dataplane;
use crate::types::{Connection, InterfaceHandle};

/// Brings up the interface later stages (ACL programming, cross-connect)
/// attach to. Must run before them in the server chain.
///
/// A refresh (second open for the same connection) reuses the interface
/// created by the first traversal instead of leaking it. The previous
/// `conn.interface` value is saved and restored on close, so a
/// downstream hop's handle survives a traversal through this one.
pub struct UpStage {
    dataplane: Arc<dyn Dataplane>,
    brought_up: MetadataMap<BroughtUp>,
}

#[derive(Debug, Clone, Copy)]
struct BroughtUp {
    own: InterfaceHandle,
    prior: Option<InterfaceHandle>,
}

impl UpStage {
    /// Bring-up stage backed by the given dataplane.
    pub fn new(dataplane: Arc<dyn Dataplane>) -> Self {
        Self {
            dataplane,
            brought_up: MetadataMap::new(),
        }
    }
}

#[async_trait]
impl Stage for UpStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        if let Some(existing) = self.brought_up.get(conn.id) {
            conn.interface = Some(existing.own);
            debug!(conn_id = %conn.id, iface = %existing.own, "interface reused on refresh");
            return Ok(());
        }
        let Some(mechanism) = conn.mechanism.clone() else {
            return Err(ChainError::stage(self.name(), "no mechanism selected"));
        };

        let iface = self.dataplane.create_interface(&mechanism).await?;
        if let Err(err) = self.dataplane.up(iface).await {
            // Don't leave the half-created interface behind.
            let _ = self.dataplane.delete_interface(iface).await;
            return Err(err.into());
        }
        self.brought_up.insert(
            conn.id,
            BroughtUp {
                own: iface,
                prior: conn.interface.replace(iface),
            },
        );
        debug!(conn_id = %conn.id, %iface, "interface up");
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        let Some(entry) = self.brought_up.take(conn.id) else {
            return Ok(());
        };
        conn.interface = entry.prior;
        self.dataplane.delete_interface(entry.own).await?;
        debug!(conn_id = %conn.id, iface = %entry.own, "interface deleted");
        Ok(())
    }

    fn name(&self) -> &str {
        "up"
    }
}
