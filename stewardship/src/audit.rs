//! Append-only audit log.
//!
//! Every trigger, commit, status change, review, appeal transition and
//! non-allow decision is written here. Entries are keyed by a monotonic id
//! from the embedded store and are never rewritten; erasure requests purge
//! relationship data but leave the audit trail intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::warn;

use crate::error::Result;
use crate::registry::{AuthorityBasis, Capability};
use crate::trigger::Contribution;
use crate::types::{AgentId, AppealId, CommitAuthority, Decision, GrantId, PolicyId, PolicyStatus};

const AUDIT_TREE: &str = "audit";

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEventKind {
    TriggerFired {
        case_id: String,
        total_weight: f64,
        threshold: f64,
        contributors: Vec<Contribution>,
    },
    PolicyCommitted {
        policy_id: PolicyId,
        version: u64,
        steward_id: AgentId,
        basis: AuthorityBasis,
        committed_by: CommitAuthority,
        supersedes: Option<PolicyId>,
    },
    StatusChanged {
        policy_id: PolicyId,
        version: u64,
        from: PolicyStatus,
        to: PolicyStatus,
        reason: String,
    },
    ReviewCompleted {
        policy_id: PolicyId,
        outcome: String,
        successor: Option<PolicyId>,
        appeal_id: Option<AppealId>,
    },
    AppealTransition {
        appeal_id: AppealId,
        policy_id: PolicyId,
        from: String,
        to: String,
    },
    DecisionLogged {
        capability: Capability,
        decision: Decision,
    },
    GrantChanged {
        grant_id: GrantId,
        steward_id: AgentId,
        action: String,
    },
    Disconnection {
        policies_revoked: usize,
        grants_revoked: usize,
    },
    ErasureRequested {
        edges_removed: usize,
    },
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TriggerFired { .. } => "trigger_fired",
            Self::PolicyCommitted { .. } => "policy_committed",
            Self::StatusChanged { .. } => "status_changed",
            Self::ReviewCompleted { .. } => "review_completed",
            Self::AppealTransition { .. } => "appeal_transition",
            Self::DecisionLogged { .. } => "decision_logged",
            Self::GrantChanged { .. } => "grant_changed",
            Self::Disconnection { .. } => "disconnection",
            Self::ErasureRequested { .. } => "erasure_requested",
        }
    }
}

/// A single audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic sequence number
    pub seq: u64,
    pub subject_id: AgentId,
    pub at: DateTime<Utc>,
    pub event: AuditEventKind,
}

/// Durable audit log backed by its own tree.
#[derive(Clone)]
pub struct AuditLog {
    db: Db,
    tree: Tree,
}

impl AuditLog {
    pub fn open(db: &Db) -> Result<Self> {
        let tree = db.open_tree(AUDIT_TREE)?;
        Ok(Self {
            db: db.clone(),
            tree,
        })
    }

    /// Append an event.
    pub fn record(
        &self,
        subject_id: &str,
        at: DateTime<Utc>,
        event: AuditEventKind,
    ) -> Result<AuditEvent> {
        let seq = self.db.generate_id()?;
        let entry = AuditEvent {
            seq,
            subject_id: subject_id.to_string(),
            at,
            event,
        };
        self.tree
            .insert(seq.to_be_bytes(), rmp_serde::to_vec_named(&entry)?)?;
        Ok(entry)
    }

    /// Append an event where a failed write must not change the caller's result.
    pub fn record_or_warn(&self, subject_id: &str, at: DateTime<Utc>, event: AuditEventKind) {
        let kind = event.as_str();
        if let Err(e) = self.record(subject_id, at, event) {
            warn!(subject = %subject_id, event = kind, error = %e, "Failed to write audit event");
        }
    }

    /// All events for one subject, in append order.
    pub fn for_subject(&self, subject_id: &str) -> Result<Vec<AuditEvent>> {
        Ok(self
            .iter()?
            .into_iter()
            .filter(|e| e.subject_id == subject_id)
            .collect())
    }

    /// Flat, timestamp-ordered export. Ties keep append order.
    pub fn export(&self) -> Result<Vec<AuditEvent>> {
        let mut events = self.iter()?;
        events.sort_by(|a, b| a.at.cmp(&b.at).then(a.seq.cmp(&b.seq)));
        Ok(events)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn iter(&self) -> Result<Vec<AuditEvent>> {
        let mut events = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            events.push(rmp_serde::from_slice(&value)?);
        }
        Ok(events)
    }
}
