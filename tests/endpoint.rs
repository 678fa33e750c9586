//! End-to-end tests: endpoints composed over the in-process transport,
//! exercising the full open/close traversal across two hops.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use flowgate::acl::AclStore;
use flowgate::chain::{ChainError, StageContext};
use flowgate::dataplane::LocalDataplane;
use flowgate::endpoint::{Endpoint, EndpointDeps};
use flowgate::transport::{IdentityTokenSource, LoopbackTransport, NextHop, Transport};
use flowgate::types::{Connection, ConnectionState, Mechanism, MechanismKind};

/// A next hop at the end of the mesh: accepts everything.
struct TerminalHop;

#[async_trait]
impl NextHop for TerminalHop {
    async fn request(&self, _ctx: &StageContext, _conn: &mut Connection) -> Result<(), ChainError> {
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, _conn: &mut Connection) -> Result<(), ChainError> {
        Ok(())
    }
}

fn ctx() -> StageContext {
    StageContext::new(CancellationToken::new())
}

fn endpoint(
    name: &str,
    dataplane: Arc<LocalDataplane>,
    acl: Arc<AclStore>,
    labels: BTreeMap<String, String>,
    next_hop: Arc<dyn NextHop>,
) -> Arc<Endpoint> {
    Arc::new(Endpoint::new(EndpointDeps {
        name: name.to_owned(),
        dataplane,
        acl,
        labels,
        token_source: Arc::new(IdentityTokenSource::new(name, Duration::from_secs(60))),
        next_hop,
        runtime_dir: PathBuf::from(format!("/run/flowgate-test/{name}")),
    }))
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[tokio::test]
async fn two_hop_open_then_close() {
    let transport = LoopbackTransport::new();
    let cancel = CancellationToken::new();
    let url = Url::parse("unix:///tmp/fw-upstream.sock").expect("url");

    let (dp_up, _fatal_up) = LocalDataplane::start();
    let upstream = endpoint(
        "fw-upstream",
        dp_up.clone(),
        Arc::new(AclStore::default()),
        labels(&[("tier", "upstream")]),
        Arc::new(TerminalHop),
    );
    let _errors = transport
        .serve(&url, Arc::clone(&upstream), cancel.clone())
        .await
        .expect("serve upstream");

    let (dp_edge, _fatal_edge) = LocalDataplane::start();
    let next_hop = transport.dial(&url, &cancel).await.expect("dial");
    let edge = endpoint(
        "fw-edge",
        dp_edge.clone(),
        Arc::new(AclStore::default()),
        labels(&[("zone", "edge")]),
        next_hop,
    );

    let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));
    edge.request(&ctx(), &mut conn).await.expect("open");

    assert_eq!(conn.state, ConnectionState::Established);
    let hops: Vec<&str> = conn.path.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(hops, ["fw-edge", "fw-upstream"]);
    assert!(conn.path.iter().all(|s| !s.token.is_empty()));
    assert_eq!(
        conn.labels.get("tier").map(String::as_str),
        Some("upstream"),
        "labels rewritten by the last hop"
    );
    assert_eq!(
        conn.labels.get("flowgate/via").map(String::as_str),
        Some("fw-upstream")
    );
    assert_eq!(dp_edge.interface_count(), 2, "edge: server iface + peer");
    assert_eq!(dp_up.interface_count(), 2, "upstream: server iface + peer");

    edge.close(&ctx(), &mut conn).await.expect("close");

    assert_eq!(conn.state, ConnectionState::Closed);
    assert!(conn.path.is_empty(), "both hops withdrew their segments");
    assert!(conn.labels.is_empty(), "original labels restored");
    assert!(
        conn.mechanism
            .as_ref()
            .is_some_and(|m| m.params.is_empty()),
        "assigned socket parameters released"
    );
    assert_eq!(dp_edge.interface_count(), 0);
    assert_eq!(dp_up.interface_count(), 0);
}

#[tokio::test]
async fn unreachable_upstream_rolls_everything_back() {
    let transport = LoopbackTransport::new();
    let cancel = CancellationToken::new();
    let url = Url::parse("unix:///tmp/nobody-home.sock").expect("url");

    let (dp, _fatal) = LocalDataplane::start();
    let next_hop = transport.dial(&url, &cancel).await.expect("dial");
    let edge = endpoint(
        "fw-edge",
        dp.clone(),
        Arc::new(AclStore::default()),
        labels(&[("zone", "edge")]),
        next_hop,
    );

    let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));
    let err = edge
        .request(&ctx(), &mut conn)
        .await
        .expect_err("upstream is not served");
    assert!(err.to_string().contains("next hop unreachable"));

    assert_eq!(conn.state, ConnectionState::Pending);
    assert!(conn.path.is_empty());
    assert!(conn.labels.is_empty(), "label rewrite rolled back");
    assert_eq!(dp.interface_count(), 0, "interfaces released");
}

#[tokio::test]
async fn acl_rules_from_file_are_programmed_and_cleared() {
    // Two distinct rules plus a duplicate body under a different name:
    // the duplicate collapses, the names are discarded.
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        "ACLRules:\n  allow-icmp: \"action: permit\\nproto: icmp\"\n  deny-all: \"action: deny\"\n  allow-ping: \"action: permit\\nproto: icmp\"\n"
    )
    .expect("write rules");

    let acl = Arc::new(AclStore::load(file.path()));
    assert_eq!(acl.len(), 2);

    let (dp, _fatal) = LocalDataplane::start();
    let edge = endpoint(
        "fw-edge",
        dp.clone(),
        acl,
        BTreeMap::new(),
        Arc::new(TerminalHop),
    );

    let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));
    edge.request(&ctx(), &mut conn).await.expect("open");
    let iface = conn.interface.expect("server interface");
    assert_eq!(dp.acl_rule_count(iface), 2);

    edge.close(&ctx(), &mut conn).await.expect("close");
    assert_eq!(dp.acl_rule_count(iface), 0);
    assert_eq!(dp.interface_count(), 0);
}

#[tokio::test]
async fn duplicate_bind_is_rejected() {
    let transport = LoopbackTransport::new();
    let cancel = CancellationToken::new();
    let url = Url::parse("unix:///tmp/fw.sock").expect("url");

    let (dp, _fatal) = LocalDataplane::start();
    let ep = endpoint(
        "fw-1",
        dp,
        Arc::new(AclStore::default()),
        BTreeMap::new(),
        Arc::new(TerminalHop),
    );

    let _errors = transport
        .serve(&url, Arc::clone(&ep), cancel.clone())
        .await
        .expect("first bind");
    let err = transport
        .serve(&url, ep, cancel)
        .await
        .expect_err("second bind must fail");
    assert!(err.to_string().contains("already bound"));
}
