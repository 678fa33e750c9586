//! Label rewriting stage — client side.
//!
//! The request leaves this endpoint carrying the endpoint's configured
//! labels instead of the caller's; the caller's labels are restored on
//! the way back.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::chain::metadata::MetadataMap;
use crate::chain::{ChainError, Stage, StageContext};
use crate::types::Connection;

/// Replaces connection labels with the configured endpoint labels.
pub struct RelabelStage {
    labels: BTreeMap<String, String>,
    saved: MetadataMap<BTreeMap<String, String>>,
}

impl RelabelStage {
    /// Rewriting stage applying `labels` to every outbound request.
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            saved: MetadataMap::new(),
        }
    }
}

#[async_trait]
impl Stage for RelabelStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        let original = std::mem::replace(&mut conn.labels, self.labels.clone());
        // On a refresh the first traversal's originals are the ones to
        // restore.
        if !self.saved.contains(conn.id) {
            self.saved.insert(conn.id, original);
        }
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        if let Some(original) = self.saved.take(conn.id) {
            conn.labels = original;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "relabel"
    }
}
