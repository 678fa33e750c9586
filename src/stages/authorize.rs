//! Authorization stage — rejects requests carrying expired credentials.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::chain::{ChainError, Stage, StageContext};
use crate::types::Connection;

/// Checks every path segment's per-call credential before any resource
/// is touched. Runs first in the server chain.
pub struct AuthorizeStage;

#[async_trait]
impl Stage for AuthorizeStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        let now = Utc::now();
        for segment in &conn.path {
            if segment.token.is_empty() {
                return Err(ChainError::stage(
                    self.name(),
                    format!("empty credential from {}", segment.name),
                ));
            }
            if segment.expires_at <= now {
                return Err(ChainError::stage(
                    self.name(),
                    format!("expired credential from {}", segment.name),
                ));
            }
        }
        debug!(conn_id = %conn.id, hops = conn.path.len(), "request authorized");
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, _conn: &mut Connection) -> Result<(), ChainError> {
        // Authorization holds no resources.
        Ok(())
    }

    fn name(&self) -> &str {
        "authorize"
    }
}
