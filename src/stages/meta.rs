//! Metadata propagation stage — stamps the outbound request with this
//! endpoint's provenance before it leaves for the next hop.

use async_trait::async_trait;

use crate::chain::metadata::MetadataMap;
use crate::chain::{ChainError, Stage, StageContext};
use crate::types::Connection;

/// Label recording which endpoints a request passed through.
pub const VIA_LABEL: &str = "flowgate/via";

/// Adds this endpoint's name to the `flowgate/via` label on open and
/// removes its own addition on close. Entries set by someone else are
/// left alone, including other hops that share this endpoint's name:
/// close removes only the last matching entry.
pub struct MetadataStage {
    endpoint_name: String,
    stamped: MetadataMap<()>,
}

impl MetadataStage {
    /// Provenance stage for the named endpoint.
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            stamped: MetadataMap::new(),
        }
    }
}

#[async_trait]
impl Stage for MetadataStage {
    async fn open(&self, ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        ctx.ensure_active()?;
        // Refresh: this traversal already stamped the connection.
        if self.stamped.contains(conn.id) {
            return Ok(());
        }
        let via = match conn.labels.get(VIA_LABEL) {
            Some(existing) => format!("{existing},{}", self.endpoint_name),
            None => self.endpoint_name.clone(),
        };
        conn.labels.insert(VIA_LABEL.to_owned(), via);
        self.stamped.insert(conn.id, ());
        Ok(())
    }

    async fn close(&self, _ctx: &StageContext, conn: &mut Connection) -> Result<(), ChainError> {
        if self.stamped.take(conn.id).is_none() {
            return Ok(());
        }
        if let Some(via) = conn.labels.get(VIA_LABEL).cloned() {
            let mut hops: Vec<&str> = via.split(',').collect();
            if let Some(pos) = hops.iter().rposition(|hop| *hop == self.endpoint_name) {
                hops.remove(pos);
            }
            if hops.is_empty() {
                conn.labels.remove(VIA_LABEL);
            } else {
                conn.labels.insert(VIA_LABEL.to_owned(), hops.join(","));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "metadata"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mechanism, MechanismKind};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> StageContext {
        StageContext::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn stamps_and_unstamps_provenance() {
        let stage = MetadataStage::new("fw-1");
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));

        stage.open(&ctx(), &mut conn).await.expect("open");
        assert_eq!(conn.labels.get(VIA_LABEL).map(String::as_str), Some("fw-1"));

        stage.close(&ctx(), &mut conn).await.expect("close");
        assert!(!conn.labels.contains_key(VIA_LABEL));
    }

    #[tokio::test]
    async fn appends_to_existing_via_chain() {
        let stage = MetadataStage::new("fw-2");
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));
        conn.labels.insert(VIA_LABEL.to_owned(), "fw-1".to_owned());

        stage.open(&ctx(), &mut conn).await.expect("open");
        assert_eq!(
            conn.labels.get(VIA_LABEL).map(String::as_str),
            Some("fw-1,fw-2")
        );

        stage.close(&ctx(), &mut conn).await.expect("close");
        assert_eq!(conn.labels.get(VIA_LABEL).map(String::as_str), Some("fw-1"));
    }

    /// A path may legitimately traverse two hops sharing one name; each
    /// close removes only its own (the last matching) entry.
    #[tokio::test]
    async fn close_removes_only_the_last_matching_hop() {
        let stage = MetadataStage::new("fw-1");
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));
        conn.labels
            .insert(VIA_LABEL.to_owned(), "fw-1,fw-2".to_owned());

        stage.open(&ctx(), &mut conn).await.expect("open");
        assert_eq!(
            conn.labels.get(VIA_LABEL).map(String::as_str),
            Some("fw-1,fw-2,fw-1")
        );

        stage.close(&ctx(), &mut conn).await.expect("close");
        assert_eq!(
            conn.labels.get(VIA_LABEL).map(String::as_str),
            Some("fw-1,fw-2")
        );
    }

    #[tokio::test]
    async fn refresh_stamps_only_once() {
        let stage = MetadataStage::new("fw-1");
        let mut conn = Connection::new(Mechanism::new(MechanismKind::Memif));

        stage.open(&ctx(), &mut conn).await.expect("open");
        stage.open(&ctx(), &mut conn).await.expect("refresh");
        assert_eq!(conn.labels.get(VIA_LABEL).map(String::as_str), Some("fw-1"));

        stage.close(&ctx(), &mut conn).await.expect("close");
        assert!(!conn.labels.contains_key(VIA_LABEL));
    }
}
