//! Next-hop forwarding — the terminal stage of the client chain.
//!
//! Appends this endpoint's path segment with a fresh per-call credential
//! and hands the request to the dialed upstream. A forwarding failure
//! propagates exactly like any other stage failure, so the server chain
//! rolls back everything it established.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::{ChainError, Stage, StageContext};
use crate::transport::{NextHop, TokenSource};
use crate::types::{Connection, PathSegment};

/// Forwards the (possibly mutated) request to the next hop.
pub struct NextHopStage {
    endpoint_name: String,
    token_source: Arc<dyn TokenSource>,
    next: Arc<dyn NextHop>,
}

impl NextHopStage {
    /// Forwarding stage for the named endpoint.
    pub fn new(
        endpoint_name: impl Into<String>,
        token_source: Arc<dyn TokenSource>,
        next: Arc<dyn NextHop>,
    ) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            token_source,
            next,
        }
    }
}

#[async_trait]
impl Stage for NextHopStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        let token = self
            .token_source
            .token()
            .map_err(|e| ChainError::stage(self.name(), e.to_string()))?;
        let segment = PathSegment {
            name: self.endpoint_name.clone(),
            token: token.value,
            expires_at: token.expires_at,
        };
        // A refresh updates the segment from the first traversal in place
        // with a fresh credential instead of appending a duplicate.
        let replaced = match conn.path.iter().rposition(|s| s.name == self.endpoint_name) {
            Some(idx) => Some((idx, std::mem::replace(&mut conn.path[idx], segment))),
            None => {
                conn.path.push(segment);
                None
            }
        };

        if let Err(err) = self.next.request(ctx, conn).await {
            // Roll back our own mutation before reporting.
            match replaced {
                Some((idx, previous)) => conn.path[idx] = previous,
                None => {
                    conn.path.pop();
                }
            }
            return Err(err);
        }
        debug!(conn_id = %conn.id, "request forwarded upstream");
        Ok(())
    }

    async fn close(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        let result = self.next.close(ctx, conn).await;
        if conn
            .path
            .last()
            .is_some_and(|segment| segment.name == self.endpoint_name)
        {
            conn.path.pop();
        }
        result
    }

    fn name(&self) -> &str {
        "forward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{IdentityTokenSource, TransportError};
    use crate::types::{Mechanism, MechanismKind};

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> StageContext {
        StageContext::new(CancellationToken::new())
    }

    struct FakeHop {
        fail: AtomicBool,
        requests: AtomicUsize,
        closes: AtomicUsize,
    }

    impl FakeHop {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(fail),
                requests: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NextHop for FakeHop {
        async fn request(
            &self,
            _ctx: &StageContext,
            _conn: &mut Connection,
        ) -> Result<(), ChainError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChainError::stage("next-hop", "unreachable"));
            }
            Ok(())
        }

        async fn close(
            &self,
            _ctx: &StageContext,
            _conn: &mut Connection,
        ) -> Result<(), ChainError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stage(next: Arc<FakeHop>) -> NextHopStage {
        NextHopStage::new(
            "fw-1",
            Arc::new(IdentityTokenSource::new("fw-1", Duration::from_secs(60))),
            next,
        )
    }

    #[tokio::test]
    async fn open_appends_path_segment_and_forwards() {
        let hop = FakeHop::new(false);
        let stage = stage(Arc::clone(&hop));
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));

        stage.open(&ctx(), &mut conn).await.expect("forward");
        assert_eq!(hop.requests.load(Ordering::SeqCst), 1);
        assert_eq!(conn.path.len(), 1);
        assert_eq!(conn.path[0].name, "fw-1");
        assert!(!conn.path[0].token.is_empty());
    }

    #[tokio::test]
    async fn failed_forward_removes_own_path_segment() {
        let hop = FakeHop::new(true);
        let stage = stage(Arc::clone(&hop));
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));

        stage
            .open(&ctx(), &mut conn)
            .await
            .expect_err("forward must fail");
        assert!(conn.path.is_empty(), "own segment rolled back");
    }

    #[tokio::test]
    async fn refresh_updates_the_segment_in_place() {
        let hop = FakeHop::new(false);
        let stage = stage(Arc::clone(&hop));
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));

        stage.open(&ctx(), &mut conn).await.expect("open");
        let first_token = conn.path[0].token.clone();

        stage.open(&ctx(), &mut conn).await.expect("refresh");
        assert_eq!(conn.path.len(), 1, "no duplicate segment");
        assert_ne!(conn.path[0].token, first_token, "credential refreshed");

        stage.close(&ctx(), &mut conn).await.expect("close");
        assert!(conn.path.is_empty());
    }

    #[tokio::test]
    async fn close_propagates_upstream_and_pops_own_segment() {
        let hop = FakeHop::new(false);
        let stage = stage(Arc::clone(&hop));
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));

        stage.open(&ctx(), &mut conn).await.expect("forward");
        stage.close(&ctx(), &mut conn).await.expect("close");
        assert_eq!(hop.closes.load(Ordering::SeqCst), 1);
        assert!(conn.path.is_empty());
    }

    #[tokio::test]
    async fn token_failures_surface_as_stage_errors() {
        struct BrokenTokens;
        impl TokenSource for BrokenTokens {
            fn token(&self) -> Result<crate::transport::Token, TransportError> {
                Err(TransportError::Identity("no identity".to_owned()))
            }
        }

        let stage = NextHopStage::new("fw-1", Arc::new(BrokenTokens), FakeHop::new(false));
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));
        let err = stage
            .open(&ctx(), &mut conn)
            .await
            .expect_err("token failure");
        assert!(err.to_string().contains("no identity"));
        assert!(conn.path.is_empty());
    }
}
