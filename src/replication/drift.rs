//! Drift comparator: minimal patch between an observed and a desired policy.
//!
//! Grants are matched by identity (principal, resource scope, condition). A
//! desired grant whose identity is already on the key replaces the observed
//! statement, so the written document never carries two action sets for one
//! identity. Admin root grants are never scheduled for removal: when the
//! desired root grant differs, the observed one is widened instead.
//!
//! Observed grants whose identity is absent from the desired document are
//! removed only when they carry the managed consumer tag key and the removal
//! policy is [`GrantRemovalPolicy::RevokeManaged`]. Anything else an operator
//! attached to the key stays where it is.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Grant, PolicyDocument, SecretVersion, KEY_RESOURCE_SCOPE};

/// What to do with observed grants that are no longer desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantRemovalPolicy {
    /// Revoke stale grants that this engine manages (tagged with the managed key).
    #[default]
    RevokeManaged,
    /// Never remove grants; only add.
    Retain,
}

/// Changes that take an observed policy to the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPatch {
    pub to_add: Vec<Grant>,
    pub to_remove: Vec<Grant>,
}

impl PolicyPatch {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Whether the destination value has to be (re)written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueDrift {
    Unchanged,
    NeedsUpdate,
}

#[derive(Debug, Clone)]
pub struct DriftComparator {
    removal_policy: GrantRemovalPolicy,
    managed_tag_key: String,
}

impl DriftComparator {
    pub fn new(removal_policy: GrantRemovalPolicy, managed_tag_key: impl Into<String>) -> Self {
        Self { removal_policy, managed_tag_key: managed_tag_key.into() }
    }

    fn is_managed(&self, grant: &Grant) -> bool {
        grant.condition.as_ref().is_some_and(|c| c.tag_key == self.managed_tag_key)
    }

    /// Compute the patch from `observed` to `desired`.
    pub fn diff(&self, observed: &PolicyDocument, desired: &PolicyDocument) -> PolicyPatch {
        self.diff_scoped(observed, desired, None)
    }

    /// Like [`diff`](Self::diff) for a key shared by several replicas: stale
    /// managed grants are only revoked when they are scoped to `replica_scope`
    /// or to the whole key.
    pub fn diff_within(
        &self,
        observed: &PolicyDocument,
        desired: &PolicyDocument,
        replica_scope: &str,
    ) -> PolicyPatch {
        self.diff_scoped(observed, desired, Some(replica_scope))
    }

    fn diff_scoped(
        &self,
        observed: &PolicyDocument,
        desired: &PolicyDocument,
        replica_scope: Option<&str>,
    ) -> PolicyPatch {
        let current: BTreeMap<_, &Grant> = observed.iter().map(|g| (g.identity(), g)).collect();
        let wanted: BTreeSet<_> = desired.iter().map(Grant::identity).collect();

        let mut patch = PolicyPatch::default();
        for grant in desired.iter() {
            match current.get(&grant.identity()) {
                Some(existing) if *existing == grant => {}
                Some(existing) if existing.is_admin_root() || grant.is_admin_root() => {
                    if !grant.actions.is_subset(&existing.actions) {
                        let mut widened = (*existing).clone();
                        widened.actions.extend(grant.actions.iter().cloned());
                        patch.to_add.push(widened);
                    }
                }
                Some(existing) => {
                    tracing::info!(
                        principal = %grant.principal,
                        scope = %grant.resource_scope,
                        "Replacing grant whose actions differ from the desired policy"
                    );
                    patch.to_remove.push((*existing).clone());
                    patch.to_add.push(grant.clone());
                }
                None => patch.to_add.push(grant.clone()),
            }
        }

        for grant in observed.iter().filter(|g| !wanted.contains(&g.identity())) {
            if grant.is_admin_root() {
                tracing::warn!(
                    principal = %grant.principal,
                    "Administrative root grant is not desired; leaving it in place"
                );
                continue;
            }

            let in_scope = replica_scope.map_or(true, |scope| {
                grant.resource_scope == scope || grant.resource_scope == KEY_RESOURCE_SCOPE
            });

            match self.removal_policy {
                GrantRemovalPolicy::RevokeManaged if self.is_managed(grant) && in_scope => {
                    patch.to_remove.push(grant.clone());
                }
                GrantRemovalPolicy::RevokeManaged if self.is_managed(grant) => {
                    tracing::debug!(
                        scope = %grant.resource_scope,
                        "Leaving grant for another replica in place"
                    );
                }
                GrantRemovalPolicy::RevokeManaged => {
                    tracing::info!(
                        principal = %grant.principal,
                        "Leaving unmanaged grant in place"
                    );
                }
                GrantRemovalPolicy::Retain => {
                    tracing::info!(principal = %grant.principal, "Retaining stale grant");
                }
            }
        }

        patch
    }

    /// Apply `patch` to `observed`, producing the document to write back.
    ///
    /// An added grant supersedes any observed grant with the same identity.
    pub fn apply(observed: &PolicyDocument, patch: &PolicyPatch) -> PolicyDocument {
        let remove: BTreeSet<&Grant> = patch.to_remove.iter().collect();
        let replaced: BTreeSet<_> = patch.to_add.iter().map(Grant::identity).collect();
        PolicyDocument::from_grants(
            observed
                .iter()
                .filter(|g| !remove.contains(g) && !replaced.contains(&g.identity()))
                .cloned()
                .chain(patch.to_add.iter().cloned()),
        )
    }

    /// Compare the last replicated source version with the current one.
    pub fn diff_value(observed: Option<&SecretVersion>, desired: &SecretVersion) -> ValueDrift {
        match observed {
            Some(version) if version == desired => ValueDrift::Unchanged,
            _ => ValueDrift::NeedsUpdate,
        }
    }
}

impl Default for DriftComparator {
    fn default() -> Self {
        Self::new(GrantRemovalPolicy::default(), super::planner::DEFAULT_CONSUMER_TAG_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainId, GrantCondition, SecretRef, ADMIN_ACTION};
    use crate::replication::planner::PolicyPlanner;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn dest() -> DomainId {
        DomainId::new("dest")
    }

    fn plan(tags: &[&str]) -> PolicyDocument {
        PolicyPlanner::default().plan(tags, &dest()).unwrap()
    }

    fn operator_grant() -> Grant {
        Grant::new("domain/audit:role/reader", ["key:DescribeKey"], KEY_RESOURCE_SCOPE)
    }

    #[test]
    fn test_identical_documents_produce_empty_patch() {
        let doc = plan(&["svc-a", "svc-b"]);
        assert!(DriftComparator::default().diff(&doc, &doc).is_empty());
    }

    #[test]
    fn test_added_consumer() {
        let patch = DriftComparator::default().diff(&plan(&["svc-a"]), &plan(&["svc-a", "svc-b"]));

        assert_eq!(patch.to_add.len(), 1);
        assert!(patch.to_remove.is_empty());
        let condition = patch.to_add[0].condition.as_ref().unwrap();
        assert!(condition.tag_values.contains("svc-b"));
    }

    #[test]
    fn test_removed_consumer_is_revoked() {
        let patch = DriftComparator::default().diff(&plan(&["svc-a", "svc-b"]), &plan(&["svc-a"]));

        assert!(patch.to_add.is_empty());
        assert_eq!(patch.to_remove.len(), 1);
    }

    #[test]
    fn test_retain_policy_never_removes() {
        let comparator = DriftComparator::new(GrantRemovalPolicy::Retain, "consumer");
        let patch = comparator.diff(&plan(&["svc-a", "svc-b"]), &plan(&["svc-a"]));
        assert!(patch.is_empty());
    }

    #[test]
    fn test_unmanaged_grants_are_left_alone() {
        let mut observed = plan(&["svc-a"]);
        observed.statements.push(operator_grant());
        observed.statements.push(
            Grant::new("domain/dest:*", ["key:Decrypt"], KEY_RESOURCE_SCOPE)
                .with_condition(GrantCondition::new("team", ["ops"])),
        );
        observed.canonicalize();

        let patch = DriftComparator::default().diff(&observed, &plan(&["svc-a"]));
        assert!(patch.is_empty());
    }

    #[traced_test]
    #[test]
    fn test_admin_root_is_never_removed() {
        let observed = plan(&["svc-a"]);
        let desired = PolicyDocument::default();

        let patch = DriftComparator::default().diff(&observed, &desired);
        assert!(patch.to_remove.iter().all(|g| !g.is_admin_root()));
        assert_eq!(patch.to_remove.len(), 1);
        assert!(logs_contain("Administrative root grant"));
    }

    #[test]
    fn test_apply_reaches_desired_for_managed_grants() {
        let observed = plan(&["svc-a", "svc-old"]);
        let desired = plan(&["svc-a", "svc-new"]);

        let patch = DriftComparator::default().diff(&observed, &desired);
        let updated = DriftComparator::apply(&observed, &patch);

        assert_eq!(updated, desired);
        assert!(DriftComparator::default().diff(&updated, &desired).is_empty());
    }

    #[test]
    fn test_apply_keeps_unmanaged_grants() {
        let mut observed = plan(&[]);
        observed.statements.push(operator_grant());

        let desired = plan(&["svc-a"]);
        let patch = DriftComparator::default().diff(&observed, &desired);
        let updated = DriftComparator::apply(&observed, &patch);

        assert!(updated.contains(&operator_grant()));
        assert_eq!(updated.len(), 3);
    }

    fn narrowed_consumer(tag: &str) -> Grant {
        Grant::new("domain/dest:*", ["key:Decrypt"], KEY_RESOURCE_SCOPE)
            .with_condition(GrantCondition::new("consumer", [tag]))
    }

    #[test]
    fn test_narrowed_consumer_is_replaced_under_retain() {
        let observed = PolicyDocument::from_grants(vec![
            Grant::admin_root(&dest()),
            narrowed_consumer("svc-a"),
        ]);
        let desired = plan(&["svc-a"]);
        let comparator = DriftComparator::new(GrantRemovalPolicy::Retain, "consumer");

        let patch = comparator.diff(&observed, &desired);
        assert_eq!(patch.to_remove, vec![narrowed_consumer("svc-a")]);
        assert_eq!(patch.to_add.len(), 1);

        let updated = DriftComparator::apply(&observed, &patch);
        assert!(updated.validate().is_ok());
        assert_eq!(updated, desired);
    }

    #[test]
    fn test_admin_root_with_extra_actions_is_kept() {
        let root = Grant::new("domain/dest:root", [ADMIN_ACTION, "key:TagResource"], "*");
        let mut observed = plan(&["svc-a"]);
        observed.statements.retain(|g| !g.is_admin_root());
        observed.statements.push(root.clone());
        observed.canonicalize();

        let patch = DriftComparator::default().diff(&observed, &plan(&["svc-a"]));
        assert!(patch.is_empty());

        let patch = DriftComparator::default().diff(&observed, &plan(&["svc-a", "svc-b"]));
        let updated = DriftComparator::apply(&observed, &patch);
        assert!(updated.validate().is_ok());
        assert!(updated.contains(&root));
        assert_eq!(updated.len(), 3);
    }

    #[test]
    fn test_narrow_root_grant_is_widened_not_removed() {
        let narrow = Grant::new("domain/dest:root", ["key:DescribeKey"], "*");
        let observed = PolicyDocument::from_grants(vec![narrow.clone()]);

        let patch = DriftComparator::default().diff(&observed, &plan(&[]));
        assert!(patch.to_remove.is_empty());
        assert_eq!(patch.to_add.len(), 1);
        assert!(patch.to_add[0].actions.is_superset(&narrow.actions));

        let updated = DriftComparator::apply(&observed, &patch);
        assert!(updated.validate().is_ok());
        assert_eq!(updated.len(), 1);
        assert!(updated.statements[0].is_admin_root());
    }

    #[test]
    fn test_diff_within_leaves_other_replicas_alone() {
        let planner = PolicyPlanner::default();
        let a = SecretRef::new("dest", "/a");
        let b = SecretRef::new("dest", "/b");
        let observed = PolicyDocument::from_grants(
            planner
                .plan_for_replica(["svc-a"], &a)
                .unwrap()
                .iter()
                .chain(planner.plan_for_replica(["svc-b"], &b).unwrap().iter())
                .cloned(),
        );
        let desired = planner.plan_for_replica(Vec::<String>::new(), &a).unwrap();

        let patch = DriftComparator::default().diff_within(&observed, &desired, "secret:/a");
        assert!(patch.to_add.is_empty());
        assert_eq!(patch.to_remove.len(), 1);
        assert_eq!(patch.to_remove[0].resource_scope, "secret:/a");

        // Without a scope every stale managed grant goes.
        assert_eq!(DriftComparator::default().diff(&observed, &desired).to_remove.len(), 2);
    }

    #[test]
    fn test_diff_value() {
        let v1 = SecretVersion::new("v1");
        let v2 = SecretVersion::new("v2");

        assert_eq!(DriftComparator::diff_value(Some(&v1), &v1), ValueDrift::Unchanged);
        assert_eq!(DriftComparator::diff_value(Some(&v1), &v2), ValueDrift::NeedsUpdate);
        assert_eq!(DriftComparator::diff_value(None, &v1), ValueDrift::NeedsUpdate);
    }

    fn arb_grant() -> impl Strategy<Value = Grant> {
        prop_oneof![
            "[a-z]{1,6}".prop_map(|d| Grant::admin_root(&DomainId::new(d))),
            ("[a-z]{1,6}", "[a-z]{1,6}").prop_map(|(d, tag)| {
                PolicyPlanner::default()
                    .plan([tag], &DomainId::new(d))
                    .unwrap()
                    .statements
                    .into_iter()
                    .find(|g| g.condition.is_some())
                    .unwrap()
            }),
            "[a-z]{1,6}".prop_map(|p| Grant::new(format!("domain/x:{}", p), ["key:Encrypt"], "*")),
            "[a-z]{1,6}".prop_map(|tag| {
                Grant::new("domain/dest:*", ["key:Decrypt"], "*")
                    .with_condition(GrantCondition::new("consumer", [tag]))
            }),
            Just(Grant::new("domain/dest:root", [ADMIN_ACTION, "key:TagResource"], "*")),
        ]
    }

    fn arb_document() -> impl Strategy<Value = PolicyDocument> {
        proptest::collection::vec(arb_grant(), 0..8).prop_map(PolicyDocument::from_grants)
    }

    proptest! {
        #[test]
        fn prop_admin_root_never_removed(observed in arb_document(), desired in arb_document()) {
            for policy in [GrantRemovalPolicy::RevokeManaged, GrantRemovalPolicy::Retain] {
                let patch = DriftComparator::new(policy, "consumer").diff(&observed, &desired);
                prop_assert!(patch.to_remove.iter().all(|g| !g.is_admin_root()));
            }
        }

        #[test]
        fn prop_apply_covers_desired(observed in arb_document(), desired in arb_document()) {
            prop_assume!(observed.validate().is_ok() && desired.validate().is_ok());

            for policy in [GrantRemovalPolicy::RevokeManaged, GrantRemovalPolicy::Retain] {
                let comparator = DriftComparator::new(policy, "consumer");
                let patch = comparator.diff(&observed, &desired);
                let updated = DriftComparator::apply(&observed, &patch);

                prop_assert!(updated.validate().is_ok());
                for wanted in desired.iter() {
                    let covered = updated.iter().any(|g| {
                        g.identity() == wanted.identity() && g.actions.is_superset(&wanted.actions)
                    });
                    prop_assert!(covered);
                }
                prop_assert!(comparator.diff(&updated, &desired).is_empty());
            }
        }
    }
}
