//! ACL filtering stage — programs the loaded rule set onto the
//! connection's interface.
//!
//! Ordering dependency: runs after interface bring-up and before
//! mechanism-specific wiring. Within the stage the rule set is applied
//! all-or-nothing: a rejection mid-set removes the rules already applied
//! before the error is returned, so nothing is left dangling.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::acl::AclStore;
use crate::chain::metadata::MetadataMap;
use crate::chain::{ChainError, Stage, StageContext};
use crate::dataplane::Dataplane;
use crate::types::Connection;

/// Applies the immutable ACL rule set to the server-side interface.
pub struct AclFilterStage {
    dataplane: Arc<dyn Dataplane>,
    store: Arc<AclStore>,
    applied: MetadataMap<Vec<u32>>,
}

impl AclFilterStage {
    /// Filtering stage programming `store`'s rules via `dataplane`.
    pub fn new(dataplane: Arc<dyn Dataplane>, store: Arc<AclStore>) -> Self {
        Self {
            dataplane,
            store,
            applied: MetadataMap::new(),
        }
    }
}

#[async_trait]
impl Stage for AclFilterStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        // Refresh: the rule set from the first traversal is still applied.
        if self.applied.contains(conn.id) {
            return Ok(());
        }
        if self.store.is_empty() {
            debug!(conn_id = %conn.id, "no ACL rules loaded, filtering disabled");
            return Ok(());
        }
        let Some(iface) = conn.interface else {
            return Err(ChainError::MissingInterface(self.name().to_owned()));
        };

        let mut handles = Vec::with_capacity(self.store.len());
        for rule in self.store.rules() {
            match self.dataplane.program_acl(iface, rule).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Commit nothing: remove what this stage already applied.
                    for handle in handles {
                        if let Err(remove_err) =
                            self.dataplane.remove_acl_rule(iface, handle).await
                        {
                            warn!(
                                conn_id = %conn.id,
                                %iface,
                                handle,
                                error = %remove_err,
                                "failed to remove partially applied ACL rule"
                            );
                        }
                    }
                    return Err(err.into());
                }
            }
        }
        debug!(conn_id = %conn.id, %iface, rules = handles.len(), "ACL filtering active");
        self.applied.insert(conn.id, handles);
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        if self.applied.take(conn.id).is_none() {
            return Ok(());
        }
        let Some(iface) = conn.interface else {
            return Ok(());
        };
        self.dataplane.clear_acl(iface).await?;
        debug!(conn_id = %conn.id, %iface, "ACL filtering removed");
        Ok(())
    }

    fn name(&self) -> &str {
        "acl-filter"
    }
}
