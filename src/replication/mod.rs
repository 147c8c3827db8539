//! # Replication Engine
//!
//! Components that take one declared target from its source domain to its
//! destination domain:
//!
//! - [`broker`]: scoped, cached credentials per (domain, purpose)
//! - [`reader`]: version-consistent source reads
//! - [`planner`]: desired key policy from consumer tags
//! - [`drift`]: minimal patch between observed and desired state
//! - [`reconciler`]: the per-target state machine tying them together
//!
//! Retry timing lives in [`backoff`], per-target mutual exclusion in [`lease`].

pub mod backoff;
pub mod broker;
pub mod drift;
pub mod error;
pub mod lease;
pub mod planner;
pub mod reader;
pub mod reconciler;

pub use backoff::RetryPolicy;
pub use broker::CredentialBroker;
pub use drift::{DriftComparator, GrantRemovalPolicy, PolicyPatch, ValueDrift};
pub use error::{FailureKind, ReplicationError};
pub use lease::{KeyLeases, LeaseMode, TargetLease};
pub use planner::{PolicyPlanner, DEFAULT_CONSUMER_TAG_KEY};
pub use reader::SecretReader;
pub use reconciler::{
    PassOutcome, ReconcileReport, ReconcileState, Reconciler, ReconcilerSettings, WriteSummary,
    REPLICA_SOURCE_TAG,
};
