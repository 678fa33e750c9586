//! File-descriptor passthrough stages.
//!
//! Socket-file mechanism parameters never cross a privilege boundary as
//! raw paths: the sending side swaps a `unix://` path for a granted
//! descriptor reference (`fd://N`), and the receiving side materializes
//! a received descriptor back into a concrete local path. Both rewrites
//! are reversed on close.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::chain::metadata::MetadataMap;
use crate::chain::{ChainError, Stage, StageContext};
use crate::types::Connection;

/// Mechanism parameter carrying the IPC socket location.
pub const SOCKET_FILE_PARAM: &str = "socket_file";

const UNIX_SCHEME: &str = "unix://";
const FD_SCHEME: &str = "fd://";

/// Sending side: replaces a `unix://` socket path with an `fd://`
/// descriptor grant.
pub struct SendFdStage {
    next_fd: AtomicU32,
    granted: MetadataMap<String>,
}

impl SendFdStage {
    /// A sender with no grants outstanding.
    pub fn new() -> Self {
        Self {
            next_fd: AtomicU32::new(3),
            granted: MetadataMap::new(),
        }
    }
}

impl Default for SendFdStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for SendFdStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        let Some(mechanism) = conn.mechanism.as_mut() else {
            return Ok(());
        };
        let Some(value) = mechanism.params.get(SOCKET_FILE_PARAM) else {
            return Ok(());
        };
        if !value.starts_with(UNIX_SCHEME) {
            return Ok(());
        }
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        let original = mechanism
            .params
            .insert(SOCKET_FILE_PARAM.to_owned(), format!("{FD_SCHEME}{fd}"))
            .unwrap_or_default();
        self.granted.insert(conn.id, original);
        debug!(conn_id = %conn.id, fd, "socket path granted as descriptor");
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        if let Some(original) = self.granted.take(conn.id) {
            if let Some(mechanism) = conn.mechanism.as_mut() {
                mechanism.params.insert(SOCKET_FILE_PARAM.to_owned(), original);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "sendfd"
    }
}

/// Receiving side: replaces an `fd://` descriptor reference with a
/// concrete local socket path under the runtime directory.
pub struct RecvFdStage {
    runtime_dir: PathBuf,
    received: MetadataMap<String>,
}

impl RecvFdStage {
    /// A receiver materializing sockets under `runtime_dir`.
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            received: MetadataMap::new(),
        }
    }
}

#[async_trait]
impl Stage for RecvFdStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        let id = conn.id;
        let Some(mechanism) = conn.mechanism.as_mut() else {
            return Ok(());
        };
        let Some(value) = mechanism.params.get(SOCKET_FILE_PARAM) else {
            return Ok(());
        };
        if !value.starts_with(FD_SCHEME) {
            return Ok(());
        }
        let local = format!(
            "{UNIX_SCHEME}{}",
            self.runtime_dir.join(format!("{id}.sock")).display()
        );
        let original = mechanism
            .params
            .insert(SOCKET_FILE_PARAM.to_owned(), local)
            .unwrap_or_default();
        self.received.insert(id, original);
        debug!(conn_id = %id, "descriptor materialized as local socket");
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        if let Some(original) = self.received.take(conn.id) {
            if let Some(mechanism) = conn.mechanism.as_mut() {
                mechanism.params.insert(SOCKET_FILE_PARAM.to_owned(), original);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recvfd"
    }
}
