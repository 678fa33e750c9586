//! ACL rule store — declarative packet-filter policy ingestion.
//!
//! Rules are loaded once at startup from a YAML file shaped
//! `acl_rules: { <name>: <rule body> }` (the legacy `ACLRules` key is
//! accepted). Names exist only for the config author; the store discards
//! them and keeps a deduplicated set of rule bodies, so two differently
//! named but identical rules collapse to one.
//!
//! Loading is fail-open: an unreadable or unparsable file yields an
//! empty rule set and a diagnostic, and the endpoint starts with
//! filtering disabled rather than refusing to start.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// A single filter directive (match criteria + action).
///
/// Rule bodies are opaque to this endpoint beyond being forwarded
/// verbatim to the dataplane; only the dataplane validates the match
/// criteria inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AclRule(pub serde_yaml::Value);

impl AclRule {
    /// Canonical textual form used to collapse duplicate bodies.
    pub fn canonical(&self) -> String {
        serde_yaml::to_string(&self.0).unwrap_or_else(|_| format!("{:?}", self.0))
    }
}

#[derive(Debug, Default, Deserialize)]
struct AclFile {
    #[serde(default, alias = "ACLRules")]
    acl_rules: BTreeMap<String, AclRule>,
}

/// The immutable rule set applied to every connection's interface.
#[derive(Debug, Default)]
pub struct AclStore {
    rules: Vec<AclRule>,
}

impl AclStore {
    /// Load the rule set from a YAML file.
    ///
    /// Missing file or parse error produces an empty store; the error is
    /// logged, never raised. Order among rules is not semantically
    /// significant; identical bodies are collapsed to one.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                error!(path = %path.display(), error = %err, "cannot read ACL config, filtering disabled");
                return Self::default();
            }
        };

        let file: AclFile = match serde_yaml::from_str(&raw) {
            Ok(file) => file,
            Err(err) => {
                error!(path = %path.display(), error = %err, "cannot parse ACL config, filtering disabled");
                return Self::default();
            }
        };

        let store = Self::from_named_rules(file.acl_rules);
        info!(path = %path.display(), rules = store.len(), "loaded ACL rules");
        store
    }

    /// Build a store from named rules, discarding names and duplicates.
    pub fn from_named_rules(named: BTreeMap<String, AclRule>) -> Self {
        let mut seen = HashSet::new();
        let mut rules = Vec::new();
        for rule in named.into_values() {
            if seen.insert(rule.canonical()) {
                rules.push(rule);
            }
        }
        Self { rules }
    }

    /// Build a store directly from rule bodies (test helper).
    pub fn from_rules(rules: Vec<AclRule>) -> Self {
        let named = rules
            .into_iter()
            .enumerate()
            .map(|(i, r)| (format!("rule-{i}"), r))
            .collect();
        Self::from_named_rules(named)
    }

    /// The deduplicated rule bodies.
    pub fn rules(&self) -> &[AclRule] {
        &self.rules
    }

    /// Number of distinct rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether filtering is effectively disabled.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
