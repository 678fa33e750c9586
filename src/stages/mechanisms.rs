//! Mechanism dispatch — selects the sub-chain registered for the
//! connection's requested mechanism type.
//!
//! The registry is a tagged-variant map built once at construction time;
//! lookups are read-only. A request for an unregistered mechanism fails
//! with [`ChainError::UnsupportedMechanism`] and no sub-chain stage runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::metadata::MetadataMap;
use crate::chain::{Chain, ChainError, Stage, StageContext};
use crate::types::{Connection, MechanismKind};

use super::passfd::SOCKET_FILE_PARAM;

/// Dispatches Open/Close to exactly one registered sub-chain.
pub struct MechanismsStage {
    registry: HashMap<MechanismKind, Arc<Chain>>,
}

impl MechanismsStage {
    /// A dispatcher over the given mechanism registry.
    pub fn new(registry: HashMap<MechanismKind, Arc<Chain>>) -> Self {
        Self { registry }
    }

    fn lookup(&self, conn: &Connection) -> Result<&Arc<Chain>, ChainError> {
        let kind = conn
            .mechanism_kind()
            .ok_or_else(|| ChainError::UnsupportedMechanism("none requested".to_owned()))?;
        self.registry
            .get(kind)
            .ok_or_else(|| ChainError::UnsupportedMechanism(kind.to_string()))
    }
}

#[async_trait]
impl Stage for MechanismsStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        let sub_chain = self.lookup(conn)?;
        debug!(conn_id = %conn.id, chain = sub_chain.name(), "mechanism dispatched");
        sub_chain.open(ctx, conn).await
    }

    async fn close(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        // A mechanism that was never dispatchable holds no resources.
        match self.lookup(conn) {
            Ok(sub_chain) => sub_chain.close(ctx, conn).await,
            Err(_) => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "mechanisms"
    }
}

/// Build the memif sub-chain — the built-in local IPC mechanism.
pub fn memif_chain(runtime_dir: impl Into<PathBuf>) -> Chain {
    Chain::builder("memif")
        .stage(MemifStage::new(runtime_dir))
        .build()
}

/// Wires the shared-memory interface parameters for a memif connection.
pub struct MemifStage {
    runtime_dir: PathBuf,
    assigned: MetadataMap<String>,
}

impl MemifStage {
    fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            assigned: MetadataMap::new(),
        }
    }
}

#[async_trait]
impl Stage for MemifStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        let id = conn.id;
        let Some(mechanism) = conn.mechanism.as_mut() else {
            return Err(ChainError::stage(self.name(), "no mechanism selected"));
        };
        if mechanism.kind != MechanismKind::Memif {
            return Err(ChainError::stage(
                self.name(),
                format!("cannot wire mechanism {}", mechanism.kind),
            ));
        }
        if !mechanism.params.contains_key(SOCKET_FILE_PARAM) {
            let socket = format!(
                "unix://{}",
                self.runtime_dir.join(format!("memif-{id}.sock")).display()
            );
            mechanism
                .params
                .insert(SOCKET_FILE_PARAM.to_owned(), socket.clone());
            self.assigned.insert(id, socket);
            debug!(conn_id = %id, "memif socket assigned");
        }
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        if self.assigned.take(conn.id).is_some() {
            if let Some(mechanism) = conn.mechanism.as_mut() {
                mechanism.params.remove(SOCKET_FILE_PARAM);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memif"
    }
}
