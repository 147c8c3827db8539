//! Authorization statements and policy documents.
//!
//! A [`Grant`] is one declarative statement; a [`PolicyDocument`] is the set of
//! statements attached to a key. Both order canonically so that two documents
//! with the same statements serialize to the same bytes regardless of the
//! order an external service returned them in. Conditions are carried but never
//! evaluated here: the key-management service does that at request time.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use super::id::{DomainId, SecretPath};
use crate::replication::error::ReplicationError;

/// Action granting full administrative control over a key.
pub const ADMIN_ACTION: &str = "key:*";

/// Actions a consumer needs to read a replicated secret and decrypt it.
pub const CONSUMER_ACTIONS: [&str; 4] = [
    "key:Decrypt",
    "key:DescribeKey",
    "secret:DescribeSecret",
    "secret:GetSecretValue",
];

/// Resource scope used by key policies (the key the policy is attached to).
pub const KEY_RESOURCE_SCOPE: &str = "*";

/// Resource scope narrowing a grant to one replicated secret.
pub fn replica_scope(path: &SecretPath) -> String {
    format!("secret:{}", path)
}

/// Principal for a domain's own root identity.
pub fn root_principal(domain: &DomainId) -> String {
    format!("domain/{}:root", domain)
}

/// Principal matching any identity inside a domain.
pub fn domain_principal(domain: &DomainId) -> String {
    format!("domain/{}:*", domain)
}

/// Tag condition attached to a grant: the request principal must carry
/// `tag_key` with one of `tag_values`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantCondition {
    pub tag_key: String,
    pub tag_values: BTreeSet<String>,
}

impl GrantCondition {
    pub fn new<I, S>(tag_key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { tag_key: tag_key.into(), tag_values: values.into_iter().map(Into::into).collect() }
    }
}

/// A single authorization statement.
///
/// Field order matters: the derived `Ord` is the canonical ordering key
/// (principal, sorted actions, resource scope, condition).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Grant {
    pub principal: String,
    pub actions: BTreeSet<String>,
    pub resource_scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<GrantCondition>,
}

impl Grant {
    pub fn new<I, S>(
        principal: impl Into<String>,
        actions: I,
        resource_scope: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principal: principal.into(),
            actions: actions.into_iter().map(Into::into).collect(),
            resource_scope: resource_scope.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: GrantCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Administrative grant for a domain's root identity.
    pub fn admin_root(domain: &DomainId) -> Self {
        Self::new(root_principal(domain), [ADMIN_ACTION], KEY_RESOURCE_SCOPE)
    }

    /// Whether this statement is a root identity's administrative grant.
    /// These are never removed by the drift comparator.
    pub fn is_admin_root(&self) -> bool {
        self.condition.is_none()
            && self.principal.ends_with(":root")
            && self.actions.contains(ADMIN_ACTION)
    }

    /// Identity of the statement without its actions. Two grants in one
    /// document must not share an identity while differing in actions.
    pub fn identity(&self) -> (&str, &str, Option<&GrantCondition>) {
        (&self.principal, &self.resource_scope, self.condition.as_ref())
    }
}

/// Ordered set of grants for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub statements: Vec<Grant>,
}

impl PolicyDocument {
    /// Build a canonical document from any collection of grants.
    pub fn from_grants<I: IntoIterator<Item = Grant>>(grants: I) -> Self {
        let mut document = Self { statements: grants.into_iter().collect() };
        document.canonicalize();
        document
    }

    /// Sort statements canonically and drop exact duplicates.
    pub fn canonicalize(&mut self) {
        self.statements.sort();
        self.statements.dedup();
    }

    /// Returns a canonical copy of the document.
    pub fn canonical(&self) -> Self {
        let mut copy = self.clone();
        copy.canonicalize();
        copy
    }

    /// Check the one-action-set-per-identity invariant.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        let mut seen: BTreeMap<(&str, &str, Option<&GrantCondition>), &BTreeSet<String>> =
            BTreeMap::new();

        for grant in &self.statements {
            if grant.actions.is_empty() {
                return Err(ReplicationError::invariant_violation(format!(
                    "grant for principal '{}' has an empty action set",
                    grant.principal
                )));
            }

            if let Some(existing) = seen.insert(grant.identity(), &grant.actions) {
                if existing != &grant.actions {
                    return Err(ReplicationError::invariant_violation(format!(
                        "conflicting action sets for principal '{}' on scope '{}'",
                        grant.principal, grant.resource_scope
                    )));
                }
            }
        }

        Ok(())
    }

    /// Canonical JSON bytes. Statement order in `self` does not affect the output.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.canonical())
    }

    /// Hex SHA-256 of the canonical JSON form.
    pub fn policy_hash(&self) -> String {
        // Serializing plain strings and sets cannot fail.
        let bytes = self.to_canonical_json().unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn contains(&self, grant: &Grant) -> bool {
        self.statements.contains(grant)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Grant> {
        self.statements.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_grant(tag: &str) -> Grant {
        Grant::new("domain/dest:*", CONSUMER_ACTIONS, KEY_RESOURCE_SCOPE)
            .with_condition(GrantCondition::new("consumer", [tag]))
    }

    #[test]
    fn test_statement_order_does_not_matter() {
        let admin = Grant::admin_root(&DomainId::new("dest"));
        let a = PolicyDocument::from_grants(vec![consumer_grant("svc-a"), admin.clone()]);
        let b = PolicyDocument::from_grants(vec![admin, consumer_grant("svc-a")]);

        assert_eq!(a, b);
        assert_eq!(a.to_canonical_json().unwrap(), b.to_canonical_json().unwrap());
        assert_eq!(a.policy_hash(), b.policy_hash());
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let doc =
            PolicyDocument::from_grants(vec![consumer_grant("svc-a"), consumer_grant("svc-a")]);
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_conflicting_actions_violate_invariant() {
        let narrow = Grant::new("domain/dest:*", ["key:Decrypt"], KEY_RESOURCE_SCOPE)
            .with_condition(GrantCondition::new("consumer", ["svc-a"]));
        let doc = PolicyDocument::from_grants(vec![narrow, consumer_grant("svc-a")]);

        let err = doc.validate().unwrap_err();
        assert!(matches!(err, ReplicationError::InvariantViolation { .. }));
    }

    #[test]
    fn test_admin_root_detection() {
        let admin = Grant::admin_root(&DomainId::new("dest"));
        assert!(admin.is_admin_root());
        assert!(!consumer_grant("svc-a").is_admin_root());

        let conditioned = admin.clone().with_condition(GrantCondition::new("consumer", ["x"]));
        assert!(!conditioned.is_admin_root());
    }

    #[test]
    fn test_condition_is_omitted_from_json_when_absent() {
        let json = serde_json::to_string(&Grant::admin_root(&DomainId::new("dest"))).unwrap();
        assert!(!json.contains("condition"));
    }
}
