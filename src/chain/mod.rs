//! Request pipeline core — the ordered chain of stages applied to every
//! connection lifecycle event.
//!
//! A [`Chain`] executes its stages in a fixed forward order on Open and in
//! the exact inverse order on Close. An Open failure at stage *k* unwinds
//! stages `0..k-1` (best effort) before reporting the failure; a Close
//! always traverses the full list and aggregates per-stage failures.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dataplane::DataplaneError;
use crate::types::Connection;

pub mod metadata;

/// Errors produced by pipeline stages and chain traversal.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A stage rejected the connection or failed an external call.
    #[error("stage {stage}: {message}")]
    Stage {
        /// Name of the failing stage.
        stage: String,
        /// What went wrong.
        message: String,
    },
    /// No sub-chain is registered for the requested mechanism.
    #[error("unsupported mechanism: {0}")]
    UnsupportedMechanism(String),
    /// A dataplane call failed.
    #[error("dataplane: {0}")]
    Dataplane(#[from] DataplaneError),
    /// A stage that requires a programmed interface ran before bring-up.
    #[error("stage {0}: connection has no dataplane interface")]
    MissingInterface(String),
    /// The lifecycle event was cancelled or its deadline passed.
    #[error("operation cancelled")]
    Cancelled,
    /// One or more stages failed during a Close traversal.
    #[error("close failed in {0}")]
    CloseAggregate(CloseFailures),
}

impl ChainError {
    /// Convenience constructor for per-stage failures.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// One stage's failure recorded during a Close traversal.
#[derive(Debug)]
pub struct StageFailure {
    /// Name of the failing stage.
    pub stage: String,
    /// Rendered error.
    pub error: String,
}

/// All failures collected by one Close traversal.
#[derive(Debug)]
pub struct CloseFailures(pub Vec<StageFailure>);

impl fmt::Display for CloseFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage(s):", self.0.len())?;
        for failure in &self.0 {
            write!(f, " {}({})", failure.stage, failure.error)?;
        }
        Ok(())
    }
}

/// Cancellation and deadline context threaded through every stage call.
///
/// Stages must observe cancellation before blocking calls and fail
/// promptly rather than block indefinitely.
#[derive(Debug, Clone)]
pub struct StageContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl StageContext {
    /// Context scoped to the given cancellation token, no deadline.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Derive a context that additionally expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// The process-level cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with [`ChainError::Cancelled`] if the token fired or the
    /// deadline passed. Stages call this before external calls.
    pub fn ensure_active(&self) -> Result<(), ChainError> {
        if self.cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ChainError::Cancelled);
            }
        }
        Ok(())
    }
}

/// One step of the request pipeline.
///
/// Stages are created once at pipeline-build time and shared read-only
/// across all connections; per-connection state lives in a
/// [`metadata::MetadataMap`] keyed by connection id, never in the stage
/// itself. Stages must be safe for concurrent invocation across distinct
/// connections; the pipeline serializes events on the same connection.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Establish or refresh this stage's part of the connection.
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError>;

    /// Release this stage's part of the connection.
    ///
    /// Called in reverse of open order; also called during rollback of a
    /// failed Open, so it must tolerate a partially-established
    /// connection.
    async fn close(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError>;

    /// Stage name used in logs and errors.
    fn name(&self) -> &str;
}

/// An ordered, immutable sequence of stages.
///
/// The same ordering is used for every connection; reverse traversal on
/// Close uses the exact inverse of the forward order on Open. A `Chain`
/// is itself a [`Stage`], so chains nest (mechanism sub-chains, the
/// client-side chain as the terminal server stage).
pub struct Chain {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl Chain {
    /// Start building a chain with the given name.
    pub fn builder(name: impl Into<String>) -> ChainBuilder {
        ChainBuilder {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Number of stages in this chain.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether this chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage's open handler in forward order.
    ///
    /// On failure at stage *k*, the close handlers of stages `0..k-1` run
    /// in reverse order on the partially-established connection (best
    /// effort, unwind errors are logged) and the original error is
    /// returned. No stage is asked to close a connection it never opened.
    pub async fn open(
        &self,
        ctx: &StageContext,
        conn: &mut Connection,
    ) -> Result<(), ChainError> {
        for (k, stage) in self.stages.iter().enumerate() {
            if let Err(err) = stage.open(ctx, conn).await {
                warn!(
                    chain = %self.name,
                    stage = stage.name(),
                    conn_id = %conn.id,
                    error = %err,
                    "open failed, unwinding earlier stages"
                );
                self.unwind(ctx, conn, k).await;
                return Err(err);
            }
            debug!(chain = %self.name, stage = stage.name(), conn_id = %conn.id, "stage opened");
        }
        Ok(())
    }

    /// Run every stage's close handler in reverse of open order.
    ///
    /// Never short-circuits: every stage gets a chance to release its
    /// resources even when an earlier close failed. Returns an aggregate
    /// error naming all failing stages, or `Ok` if none failed.
    pub async fn close(
        &self,
        ctx: &StageContext,
        conn: &mut Connection,
    ) -> Result<(), ChainError> {
        let mut failures = Vec::new();
        for stage in self.stages.iter().rev() {
            if let Err(err) = stage.close(ctx, conn).await {
                warn!(
                    chain = %self.name,
                    stage = stage.name(),
                    conn_id = %conn.id,
                    error = %err,
                    "close failed, continuing traversal"
                );
                failures.push(StageFailure {
                    stage: stage.name().to_owned(),
                    error: err.to_string(),
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChainError::CloseAggregate(CloseFailures(failures)))
        }
    }

    /// Best-effort rollback of the first `opened` stages, in reverse.
    async fn unwind(&self, ctx: &StageContext, conn: &mut Connection, opened: usize) {
        for stage in self.stages[..opened].iter().rev() {
            if let Err(err) = stage.close(ctx, conn).await {
                warn!(
                    chain = %self.name,
                    stage = stage.name(),
                    conn_id = %conn.id,
                    error = %err,
                    "rollback close failed"
                );
            }
        }
    }
}

#[async_trait]
impl Stage for Chain {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        Chain::open(self, ctx, conn).await
    }

    async fn close(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        Chain::close(self, ctx, conn).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Builds a [`Chain`] from an explicit ordered list of stages.
pub struct ChainBuilder {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl ChainBuilder {
    /// Append a stage to the end of the chain.
    #[must_use]
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append an already-shared stage to the end of the chain.
    #[must_use]
    pub fn stage_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Finish the chain.
    pub fn build(self) -> Chain {
        Chain {
            name: self.name,
            stages: self.stages,
        }
    }
}
