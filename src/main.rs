//! Firewall endpoint binary.
//!
//! Startup runs through numbered phases, fail-fast: configuration,
//! identity, transport, pipeline construction, listening, registration.
//! After that the process serves until a termination signal or a fatal
//! dataplane/listener error, then cleans up best-effort.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info};

use flowgate::acl::AclStore;
use flowgate::config::Config;
use flowgate::dataplane::LocalDataplane;
use flowgate::endpoint::{Endpoint, EndpointDeps};
use flowgate::lifecycle::{Orchestrator, Phase};
use flowgate::registry::{EndpointDescriptor, LocalRegistry, Registry};
use flowgate::transport::{IdentityTokenSource, LoopbackTransport, Transport};
use flowgate::{logging, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let orchestrator = Orchestrator::new();

    // Phase 1: configuration and logging.
    let config = Config::load()?;
    let _level_handle = logging::init(&config.log_level)?;
    info!("there are 6 phases which will be executed followed by a success message");
    info!("executing phase 1: get config from environment");
    info!(name = %config.name, version = VERSION, "starting firewall endpoint");

    // Phase 2: workload identity.
    info!("executing phase 2: obtain workload identity");
    let token_source = Arc::new(IdentityTokenSource::new(
        config.name.clone(),
        config.max_token_lifetime,
    ));
    orchestrator.advance(Phase::Identity);

    // Phase 3: transport and the forwarding engine.
    info!("executing phase 3: prepare transport and dial dataplane");
    let cancel = orchestrator.cancel_token();
    let transport = LoopbackTransport::new();
    let (dataplane, dataplane_errors) = LocalDataplane::start();
    Arc::clone(&orchestrator)
        .check_then_watch(dataplane_errors, "dataplane")
        .map_err(|fault| anyhow!(fault))?;
    let next_hop = transport
        .dial(&config.connect_to, &cancel)
        .await
        .context("failed to dial upstream")?;
    orchestrator.advance(Phase::TransportReady);

    // Phase 4: build the endpoint pipeline.
    info!("executing phase 4: create firewall endpoint");
    let acl = Arc::new(AclStore::load(&config.acl_config_path));
    let endpoint = Arc::new(Endpoint::new(EndpointDeps {
        name: config.name.clone(),
        dataplane,
        acl,
        labels: config.labels.clone(),
        token_source,
        next_hop,
        runtime_dir: std::env::temp_dir().join("flowgate-runtime"),
    }));
    orchestrator.advance(Phase::PipelineBuilt);

    // Phase 5: listen on a per-process socket under a temp dir.
    info!("executing phase 5: create and listen on the endpoint socket");
    let listen_dir = tempfile::TempDir::new().context("failed to create listen directory")?;
    let listen_url = url::Url::parse(&format!(
        "unix://{}/{}",
        listen_dir.path().display(),
        config.listen_on
    ))
    .context("listen socket path is not a valid URL")?;
    let listener_errors = transport
        .serve(&listen_url, Arc::clone(&endpoint), cancel.clone())
        .await
        .context("failed to listen")?;
    Arc::clone(&orchestrator)
        .check_then_watch(listener_errors, "listener")
        .map_err(|fault| anyhow!(fault))?;
    orchestrator.advance(Phase::Listening);

    // Phase 6: publish to the registry.
    info!("executing phase 6: register with the registry");
    let registry = LocalRegistry::new();
    let mut labels = std::collections::BTreeMap::new();
    if !config.service_name.is_empty() {
        labels.insert(config.service_name.clone(), config.labels.clone());
    }
    let registration = registry
        .register(
            &cancel,
            EndpointDescriptor {
                name: config.name.clone(),
                services: vec![config.service_name.clone()],
                labels,
                url: listen_url.to_string(),
                registered_at: chrono::Utc::now(),
            },
        )
        .await
        .context("registration failed")?;
    orchestrator.advance(Phase::Registered);

    orchestrator.advance(Phase::Running);
    orchestrator.wait_for_shutdown().await;

    // Cleanup is best-effort: log failures, never re-raise.
    if let Err(e) = registration.close().await {
        error!(error = %e, "failed to withdraw registration");
    }
    if let Err(e) = listen_dir.close() {
        error!(error = %e, "failed to remove listen directory");
    }
    orchestrator.finish();

    match orchestrator.fault() {
        Some(fault) => Err(anyhow!(fault)),
        None => Ok(()),
    }
}
