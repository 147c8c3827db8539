//! Policy planner: consumer tags in, desired key policy out.
//!
//! The planned document always contains the destination domain's root admin
//! grant plus one read grant per consumer tag, conditioned on the request
//! principal carrying that tag under the managed tag key. A consumer grant
//! covers both decrypting with the key and reading the secret value. Planning
//! is pure: the same tags always produce byte-identical canonical output.

use super::error::{ReplicationError, Result};
use crate::domain::{
    domain_principal, replica_scope, DomainId, Grant, GrantCondition, PolicyDocument,
    SecretRef, CONSUMER_ACTIONS, KEY_RESOURCE_SCOPE,
};

/// Default tag key consumers are identified by.
pub const DEFAULT_CONSUMER_TAG_KEY: &str = "consumer";

#[derive(Debug, Clone)]
pub struct PolicyPlanner {
    tag_key: String,
}

impl Default for PolicyPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_CONSUMER_TAG_KEY)
    }
}

impl PolicyPlanner {
    pub fn new(tag_key: impl Into<String>) -> Self {
        Self { tag_key: tag_key.into() }
    }

    pub fn tag_key(&self) -> &str {
        &self.tag_key
    }

    /// Compute the desired policy for the destination key.
    ///
    /// Tags are trimmed; duplicates collapse to one grant. An empty tag is an
    /// `InvariantViolation`. Consumer grants apply to the whole key.
    pub fn plan<I, S>(&self, consumer_tags: I, dest_domain: &DomainId) -> Result<PolicyDocument>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.plan_scoped(consumer_tags, dest_domain, KEY_RESOURCE_SCOPE)
    }

    /// Like [`plan`](Self::plan), with consumer grants narrowed to one replica.
    ///
    /// Several replicas can share a destination key; each one's consumers
    /// only get to read the replica they were declared for.
    pub fn plan_for_replica<I, S>(
        &self,
        consumer_tags: I,
        replica: &SecretRef,
    ) -> Result<PolicyDocument>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.plan_scoped(consumer_tags, &replica.domain, &replica_scope(&replica.path))
    }

    fn plan_scoped<I, S>(
        &self,
        consumer_tags: I,
        dest_domain: &DomainId,
        scope: &str,
    ) -> Result<PolicyDocument>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut grants = vec![Grant::admin_root(dest_domain)];

        for tag in consumer_tags {
            let tag = tag.as_ref().trim();
            if tag.is_empty() {
                return Err(ReplicationError::invariant_violation(
                    "consumer tags must not be empty",
                ));
            }
            grants.push(self.consumer_grant(tag, dest_domain, scope));
        }

        let document = PolicyDocument::from_grants(grants);
        document.validate()?;
        Ok(document)
    }

    fn consumer_grant(&self, tag: &str, dest_domain: &DomainId, scope: &str) -> Grant {
        Grant::new(domain_principal(dest_domain), CONSUMER_ACTIONS, scope)
            .with_condition(GrantCondition::new(self.tag_key.clone(), [tag]))
    }

    /// Whether a grant was produced by a planner using the same tag key.
    pub fn manages(&self, grant: &Grant) -> bool {
        grant.condition.as_ref().is_some_and(|c| c.tag_key == self.tag_key)
    }
}
