//! Dataplane collaborator — the user-space forwarding engine this
//! endpoint programs.
//!
//! The engine itself is external; this module fixes the interface the
//! pipeline calls (interface creation, cross-connects, ACL programming)
//! and the fatal-error channel the lifecycle orchestrator monitors. Every
//! operation must be internally safe for concurrent callers.
//!
//! [`LocalDataplane`] is the in-crate binding used by the binary and the
//! tests: it performs the bookkeeping side of the engine contract
//! (handles, state tracking, validation) without a real packet path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::acl::AclRule;
use crate::types::{InterfaceHandle, Mechanism};

/// Capacity of the fatal-error channel. One value is enough; the
/// orchestrator consumes the first and shuts the process down.
const ERROR_CHANNEL_CAPACITY: usize = 1;

/// Errors surfaced by dataplane calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataplaneError {
    /// Interface creation, bring-up, or deletion failed.
    #[error("interface: {0}")]
    Interface(String),
    /// ACL programming was rejected (malformed match, exhaustion).
    #[error("acl: {0}")]
    Acl(String),
    /// Cross-connect programming failed.
    #[error("cross-connect: {0}")]
    CrossConnect(String),
    /// The engine subprocess died or became unusable.
    #[error("dataplane fatal: {0}")]
    Fatal(String),
}

/// Programming surface of the forwarding engine.
///
/// All calls are synchronous from the pipeline's perspective and may
/// block on engine I/O; callers thread a cancellable context around
/// them. Implementations must tolerate concurrent callers.
#[async_trait]
pub trait Dataplane: Send + Sync {
    /// Create an interface realizing the given mechanism.
    async fn create_interface(&self, mechanism: &Mechanism)
        -> Result<InterfaceHandle, DataplaneError>;

    /// Bring an interface up.
    async fn up(&self, iface: InterfaceHandle) -> Result<(), DataplaneError>;

    /// Cross-connect two interfaces.
    async fn cross_connect(
        &self,
        a: InterfaceHandle,
        b: InterfaceHandle,
    ) -> Result<(), DataplaneError>;

    /// Remove a cross-connect between two interfaces.
    async fn disconnect(
        &self,
        a: InterfaceHandle,
        b: InterfaceHandle,
    ) -> Result<(), DataplaneError>;

    /// Apply one filter rule to an interface; returns the rule handle.
    async fn program_acl(
        &self,
        iface: InterfaceHandle,
        rule: &AclRule,
    ) -> Result<u32, DataplaneError>;

    /// Remove one previously applied rule.
    async fn remove_acl_rule(&self, iface: InterfaceHandle, rule: u32)
        -> Result<(), DataplaneError>;

    /// Remove all filtering state attached to an interface.
    async fn clear_acl(&self, iface: InterfaceHandle) -> Result<(), DataplaneError>;

    /// Delete an interface and everything attached to it.
    async fn delete_interface(&self, iface: InterfaceHandle) -> Result<(), DataplaneError>;
}

#[derive(Debug, Default)]
struct IfaceState {
    up: bool,
    acl_rules: HashMap<u32, AclRule>,
    xconnect: Option<InterfaceHandle>,
}

/// In-process binding to the forwarding engine.
pub struct LocalDataplane {
    interfaces: Mutex<HashMap<InterfaceHandle, IfaceState>>,
    next_iface: AtomicU32,
    next_rule: AtomicU32,
    // Held so the fatal channel stays open for the engine's lifetime.
    fatal_tx: mpsc::Sender<DataplaneError>,
}

impl LocalDataplane {
    /// Start the engine binding.
    ///
    /// Returns the shared handle and the single-consumer fatal-error
    /// channel. Any value received on the channel means the engine is
    /// unusable and the process must shut down.
    pub fn start() -> (Arc<Self>, mpsc::Receiver<DataplaneError>) {
        let (fatal_tx, fatal_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let dataplane = Arc::new(Self {
            interfaces: Mutex::new(HashMap::new()),
            next_iface: AtomicU32::new(1),
            next_rule: AtomicU32::new(1),
            fatal_tx,
        });
        (dataplane, fatal_rx)
    }

    /// Report an unrecoverable engine fault to the lifecycle monitor.
    pub async fn report_fatal(&self, err: DataplaneError) {
        let _ = self.fatal_tx.send(err).await;
    }

    /// Number of live interfaces (diagnostics and test helper).
    pub fn interface_count(&self) -> usize {
        self.lock().len()
    }

    /// Rule handles currently applied to an interface (test helper).
    pub fn acl_rule_count(&self, iface: InterfaceHandle) -> usize {
        self.lock().get(&iface).map_or(0, |s| s.acl_rules.len())
    }

    /// Current cross-connect peer of an interface (test helper).
    pub fn xconnect_peer(&self, iface: InterfaceHandle) -> Option<InterfaceHandle> {
        self.lock().get(&iface).and_then(|s| s.xconnect)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InterfaceHandle, IfaceState>> {
        self.interfaces.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Dataplane for LocalDataplane {
    async fn create_interface(
        &self,
        mechanism: &Mechanism,
    ) -> Result<InterfaceHandle, DataplaneError> {
        let iface = InterfaceHandle(self.next_iface.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(iface, IfaceState::default());
        debug!(%iface, mechanism = %mechanism.kind, "interface created");
        Ok(iface)
    }

    async fn up(&self, iface: InterfaceHandle) -> Result<(), DataplaneError> {
        let mut interfaces = self.lock();
        let state = interfaces
            .get_mut(&iface)
            .ok_or_else(|| DataplaneError::Interface(format!("{iface} does not exist")))?;
        state.up = true;
        Ok(())
    }

    async fn cross_connect(
        &self,
        a: InterfaceHandle,
        b: InterfaceHandle,
    ) -> Result<(), DataplaneError> {
        let mut interfaces = self.lock();
        if !interfaces.contains_key(&a) || !interfaces.contains_key(&b) {
            return Err(DataplaneError::CrossConnect(format!(
                "{a} or {b} does not exist"
            )));
        }
        if let Some(state) = interfaces.get_mut(&a) {
            state.xconnect = Some(b);
        }
        if let Some(state) = interfaces.get_mut(&b) {
            state.xconnect = Some(a);
        }
        debug!(%a, %b, "cross-connect programmed");
        Ok(())
    }

    async fn disconnect(
        &self,
        a: InterfaceHandle,
        b: InterfaceHandle,
    ) -> Result<(), DataplaneError> {
        let mut interfaces = self.lock();
        if let Some(state) = interfaces.get_mut(&a) {
            state.xconnect = None;
        }
        if let Some(state) = interfaces.get_mut(&b) {
            state.xconnect = None;
        }
        Ok(())
    }

    async fn program_acl(
        &self,
        iface: InterfaceHandle,
        rule: &AclRule,
    ) -> Result<u32, DataplaneError> {
        let mut interfaces = self.lock();
        let state = interfaces
            .get_mut(&iface)
            .ok_or_else(|| DataplaneError::Acl(format!("{iface} does not exist")))?;
        let handle = self.next_rule.fetch_add(1, Ordering::Relaxed);
        state.acl_rules.insert(handle, rule.clone());
        Ok(handle)
    }

    async fn remove_acl_rule(
        &self,
        iface: InterfaceHandle,
        rule: u32,
    ) -> Result<(), DataplaneError> {
        let mut interfaces = self.lock();
        let state = interfaces
            .get_mut(&iface)
            .ok_or_else(|| DataplaneError::Acl(format!("{iface} does not exist")))?;
        state.acl_rules.remove(&rule);
        Ok(())
    }

    async fn clear_acl(&self, iface: InterfaceHandle) -> Result<(), DataplaneError> {
        let mut interfaces = self.lock();
        if let Some(state) = interfaces.get_mut(&iface) {
            state.acl_rules.clear();
        }
        Ok(())
    }

    async fn delete_interface(&self, iface: InterfaceHandle) -> Result<(), DataplaneError> {
        self.lock().remove(&iface);
        debug!(%iface, "interface deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MechanismKind;

    fn mech() -> Mechanism {
        Mechanism::new(MechanismKind::Memif)
    }

    #[tokio::test]
    async fn interface_lifecycle() {
        let (dp, _fatal) = LocalDataplane::start();
        let iface = dp.create_interface(&mech()).await.expect("create");
        dp.up(iface).await.expect("up");
        assert_eq!(dp.interface_count(), 1);

        dp.delete_interface(iface).await.expect("delete");
        assert_eq!(dp.interface_count(), 0);
        assert!(dp.up(iface).await.is_err(), "up on deleted interface fails");
    }

    #[tokio::test]
    async fn acl_program_and_remove() {
        let (dp, _fatal) = LocalDataplane::start();
        let iface = dp.create_interface(&mech()).await.expect("create");

        let rule = AclRule(serde_yaml::Value::String("deny-all".to_owned()));
        let handle = dp.program_acl(iface, &rule).await.expect("program");
        assert_eq!(dp.acl_rule_count(iface), 1);

        dp.remove_acl_rule(iface, handle).await.expect("remove");
        assert_eq!(dp.acl_rule_count(iface), 0);
    }

    #[tokio::test]
    async fn cross_connect_requires_both_interfaces() {
        let (dp, _fatal) = LocalDataplane::start();
        let a = dp.create_interface(&mech()).await.expect("create a");
        let missing = InterfaceHandle(999);
        assert!(dp.cross_connect(a, missing).await.is_err());

        let b = dp.create_interface(&mech()).await.expect("create b");
        dp.cross_connect(a, b).await.expect("xconnect");
        assert_eq!(dp.xconnect_peer(a), Some(b));
        assert_eq!(dp.xconnect_peer(b), Some(a));

        dp.disconnect(a, b).await.expect("disconnect");
        assert_eq!(dp.xconnect_peer(a), None);
    }

    #[tokio::test]
    async fn fatal_reports_reach_the_channel() {
        let (dp, mut fatal) = LocalDataplane::start();
        dp.report_fatal(DataplaneError::Fatal("engine died".to_owned()))
            .await;
        let err = fatal.recv().await.expect("fatal value");
        assert!(matches!(err, DataplaneError::Fatal(_)));
    }
}
