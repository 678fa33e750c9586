//! Mechanism translation stage — client side.
//!
//! The mechanism negotiated with the downstream peer is local to this
//! hop. Before forwarding, the stage replaces it with a clean proposal
//! of the same kind so the upstream can negotiate its own parameters;
//! the original is restored when the response/close travels back.

use async_trait::async_trait;
use tracing::debug;

use crate::chain::metadata::MetadataMap;
use crate::chain::{ChainError, Stage, StageContext};
use crate::types::{Connection, Mechanism};

/// Swaps the per-hop mechanism for a parameterless upstream proposal.
pub struct TranslateStage {
    saved: MetadataMap<Mechanism>,
}

impl TranslateStage {
    /// A translation stage with nothing saved yet.
    pub fn new() -> Self {
        Self {
            saved: MetadataMap::new(),
        }
    }
}

impl Default for TranslateStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for TranslateStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        let Some(current) = conn.mechanism.take() else {
            return Ok(());
        };
        conn.mechanism = Some(Mechanism::new(current.kind.clone()));
        // On a refresh the first traversal's original is the one to restore.
        if !self.saved.contains(conn.id) {
            self.saved.insert(conn.id, current);
            debug!(conn_id = %conn.id, "mechanism translated for upstream");
        }
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        if let Some(original) = self.saved.take(conn.id) {
            conn.mechanism = Some(original);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "translate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MechanismKind;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> StageContext {
        StageContext::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn open_clears_params_close_restores_them() {
        let stage = TranslateStage::new();
        let mut mechanism = Mechanism::new(MechanismKind::Memif);
        mechanism
            .params
            .insert("socket_file".to_owned(), "unix:///local.sock".to_owned());
        let mut conn = Connection::new(mechanism.clone());

        stage.open(&ctx(), &mut conn).await.expect("open");
        let proposed = conn.mechanism.as_ref().expect("proposal");
        assert_eq!(proposed.kind, MechanismKind::Memif);
        assert!(proposed.params.is_empty(), "upstream negotiates fresh");

        stage.close(&ctx(), &mut conn).await.expect("close");
        assert_eq!(conn.mechanism.as_ref(), Some(&mechanism));
    }

    #[tokio::test]
    async fn refresh_restores_the_first_original() {
        let stage = TranslateStage::new();
        let mut mechanism = Mechanism::new(MechanismKind::Memif);
        mechanism
            .params
            .insert("socket_file".to_owned(), "unix:///local.sock".to_owned());
        let mut conn = Connection::new(mechanism.clone());

        stage.open(&ctx(), &mut conn).await.expect("open");
        stage.open(&ctx(), &mut conn).await.expect("refresh");

        stage.close(&ctx(), &mut conn).await.expect("close");
        assert_eq!(conn.mechanism.as_ref(), Some(&mechanism));
    }

    #[tokio::test]
    async fn no_mechanism_is_a_noop() {
        let stage = TranslateStage::new();
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));
        conn.mechanism = None;

        stage.open(&ctx(), &mut conn).await.expect("open");
        assert!(conn.mechanism.is_none());
        stage.close(&ctx(), &mut conn).await.expect("close");
        assert!(conn.mechanism.is_none());
    }
}
