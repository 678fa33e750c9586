//! Lifecycle orchestration — startup phases, fatal-error propagation,
//! and shutdown.
//!
//! Startup is fail-fast: any phase error is fatal to the whole process.
//! Once the dataplane is dialed, its fatal-error channel is monitored
//! for the rest of the process lifetime; the first value received (or
//! the channel closing) cancels the shared token and becomes the
//! process's reported fault. Cleanup during `Terminating → Stopped` is
//! best-effort: errors are logged, never re-raised.

use std::fmt::Display;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Startup/shutdown phases, strictly forward except the jump to
/// `Terminating`, reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Process started, configuration being read.
    Init,
    /// Workload identity obtained.
    Identity,
    /// Transport credentials and dial options ready.
    TransportReady,
    /// Endpoint pipeline constructed.
    PipelineBuilt,
    /// Listener bound and serving.
    Listening,
    /// Endpoint published to the mesh registry.
    Registered,
    /// Serving traffic.
    Running,
    /// Shutting down: signal, phase error, or dataplane fault.
    Terminating,
    /// Cleanup finished.
    Stopped,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Identity => "identity",
            Self::TransportReady => "transport-ready",
            Self::PipelineBuilt => "pipeline-built",
            Self::Listening => "listening",
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Sequences startup phases and owns the process-level cancellation.
pub struct Orchestrator {
    phase: Mutex<Phase>,
    fault: Mutex<Option<String>>,
    cancel: CancellationToken,
    started_at: Instant,
}

impl Orchestrator {
    /// An orchestrator in `Init`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            phase: Mutex::new(Phase::Init),
            fault: Mutex::new(None),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    /// The shared token cancelled on shutdown. In-flight opens observe
    /// it and fail promptly; in-flight closes run to completion.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The fault that triggered termination, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Move to the next startup phase. Transitions are strictly forward;
    /// a non-forward request is logged and ignored.
    pub fn advance(&self, next: Phase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if next <= *phase {
            warn!(current = %phase, requested = %next, "ignoring non-forward phase transition");
            return;
        }
        info!(from = %phase, to = %next, "phase transition");
        *phase = next;
        if next == Phase::Running {
            info!(elapsed = ?self.started_at.elapsed(), "startup completed");
        }
    }

    /// Enter `Terminating` with an optional fault, cancelling the shared
    /// token. Only the first fault is kept; later calls are no-ops
    /// beyond the (idempotent) cancellation.
    pub fn terminate(&self, fault: Option<String>) {
        if let Some(message) = fault {
            let mut slot = self.fault.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                error!(fault = %message, "terminating");
                *slot = Some(message);
            }
        } else {
            info!("terminating");
        }
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase < Phase::Terminating {
            *phase = Phase::Terminating;
        }
        drop(phase);
        self.cancel.cancel();
    }

    /// Mark cleanup finished.
    pub fn finish(&self) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        *phase = Phase::Stopped;
        info!("stopped");
    }

    /// Monitor an asynchronous fatal-error channel for the process
    /// lifetime.
    ///
    /// The first value received triggers immediate termination with the
    /// error as the process's fault. The channel closing means the
    /// producer is gone, which is equally fatal.
    pub fn watch_fatal<E>(self: Arc<Self>, mut errors: mpsc::Receiver<E>, source: &'static str)
    where
        E: Display + Send + 'static,
    {
        let orchestrator = self;
        tokio::spawn(async move {
            match errors.recv().await {
                Some(err) => orchestrator.terminate(Some(format!("{source}: {err}"))),
                None => {
                    // Producer dropped without reporting; if the process
                    // is already shutting down this is expected.
                    if !orchestrator.cancel.is_cancelled() {
                        orchestrator.terminate(Some(format!("{source}: error channel closed")));
                    }
                }
            }
        });
    }

    /// Check a fatal-error channel once, without blocking, then hand it
    /// to [`Self::watch_fatal`]. Mirrors the startup pattern of failing
    /// immediately when the producer died before we started watching.
    pub fn check_then_watch<E>(
        self: Arc<Self>,
        mut errors: mpsc::Receiver<E>,
        source: &'static str,
    ) -> Result<(), String>
    where
        E: Display + Send + 'static,
    {
        match errors.try_recv() {
            Ok(err) => return Err(format!("{source}: {err}")),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Err(format!("{source}: error channel closed"));
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        self.watch_fatal(errors, source);
        Ok(())
    }

    /// Wait until a termination signal arrives or the token is
    /// cancelled by a fault watcher.
    pub async fn wait_for_shutdown(&self) {
        let signal = wait_for_signal();
        tokio::select! {
            name = signal => {
                info!(signal = name, "received termination signal");
                self.terminate(None);
            }
            () = self.cancel.cancelled() => {}
        }
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase < Phase::Terminating {
            *phase = Phase::Terminating;
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGINT handler");
            std::future::pending().await
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            std::future::pending().await
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGHUP handler");
            std::future::pending().await
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGQUIT handler");
            std::future::pending().await
        }
    };

    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "interrupt",
        Err(e) => {
            error!(error = %e, "cannot install interrupt handler");
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::DataplaneError;
    use std::time::Duration;

    #[tokio::test]
    async fn phases_advance_forward_only() {
        let orchestrator = Orchestrator::new();
        assert_eq!(orchestrator.phase(), Phase::Init);

        orchestrator.advance(Phase::Identity);
        orchestrator.advance(Phase::TransportReady);
        assert_eq!(orchestrator.phase(), Phase::TransportReady);

        // Backward request is ignored.
        orchestrator.advance(Phase::Identity);
        assert_eq!(orchestrator.phase(), Phase::TransportReady);
    }

    /// A value on the dataplane error channel cancels the shared token
    /// promptly and becomes the reported fault.
    #[tokio::test]
    async fn dataplane_fault_triggers_termination() {
        let orchestrator = Orchestrator::new();
        orchestrator.advance(Phase::TransportReady);

        let (tx, rx) = mpsc::channel(1);
        Arc::clone(&orchestrator).watch_fatal(rx, "dataplane");

        tx.send(DataplaneError::Fatal("engine crashed".to_owned()))
            .await
            .expect("send fault");

        let token = orchestrator.cancel_token();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("token cancelled promptly");

        assert_eq!(orchestrator.phase(), Phase::Terminating);
        let fault = orchestrator.fault().expect("fault recorded");
        assert!(fault.contains("engine crashed"));
    }

    #[tokio::test]
    async fn closed_error_channel_is_fatal() {
        let orchestrator = Orchestrator::new();
        let (tx, rx) = mpsc::channel::<DataplaneError>(1);
        Arc::clone(&orchestrator).watch_fatal(rx, "dataplane");
        drop(tx);

        let token = orchestrator.cancel_token();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("token cancelled promptly");
        assert!(orchestrator
            .fault()
            .expect("fault recorded")
            .contains("error channel closed"));
    }

    #[tokio::test]
    async fn check_then_watch_fails_on_pre_existing_error() {
        let orchestrator = Orchestrator::new();
        let (tx, rx) = mpsc::channel(1);
        tx.send(DataplaneError::Fatal("died at startup".to_owned()))
            .await
            .expect("send");

        let err = Arc::clone(&orchestrator)
            .check_then_watch(rx, "dataplane")
            .expect_err("startup error must surface synchronously");
        assert!(err.contains("died at startup"));
    }

    #[tokio::test]
    async fn first_fault_wins() {
        let orchestrator = Orchestrator::new();
        orchestrator.terminate(Some("first".to_owned()));
        orchestrator.terminate(Some("second".to_owned()));
        assert_eq!(orchestrator.fault().as_deref(), Some("first"));
        assert_eq!(orchestrator.phase(), Phase::Terminating);
    }

    #[tokio::test]
    async fn signal_free_termination_has_no_fault() {
        let orchestrator = Orchestrator::new();
        orchestrator.terminate(None);
        assert!(orchestrator.fault().is_none());
        assert_eq!(orchestrator.phase(), Phase::Terminating);
    }
}
