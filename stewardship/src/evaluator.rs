//! Live capability checks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::audit::AuditEventKind;
use crate::error::Result;
use crate::registry::Capability;
use crate::restrictions::{
    decide_content, decide_session, ComputedRestrictions, ContentCheck, SessionUsage,
};
use crate::store::PolicyStore;
use crate::types::{decide_against, CapabilityPolicy, Decision, LimitParams};

/// Answers allow / deny / limited for a subject's capability.
///
/// Inalienable capabilities are allowed before any policy is read. A policy
/// whose review date has passed without a review no longer binds; it is moved
/// to `expired` on a best-effort basis, which never changes the answer. A
/// version committed to start later does not bind before its start; the
/// version it supersedes is enforced until then.
pub struct CapabilityEvaluator {
    store: Arc<PolicyStore>,
}

impl CapabilityEvaluator {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    /// Check a capability by its registry name.
    pub fn check(
        &self,
        subject_id: &str,
        capability_id: &str,
        requested: &LimitParams,
    ) -> Result<Decision> {
        let capability: Capability = capability_id.parse()?;
        self.check_capability(subject_id, capability, requested)
    }

    pub fn check_capability(
        &self,
        subject_id: &str,
        capability: Capability,
        requested: &LimitParams,
    ) -> Result<Decision> {
        if capability.is_inalienable() {
            return Ok(Decision::Allow);
        }

        let now = self.store.clock().now();
        let binding = self.binding(subject_id, now)?;
        let decision = decide_against(binding.as_ref(), capability, requested, now);
        self.record_restricted(subject_id, capability, &decision, now);
        Ok(decision)
    }

    /// Check content against the subject's merged content restrictions.
    pub fn check_content(&self, subject_id: &str, check: &ContentCheck) -> Result<Decision> {
        let now = self.store.clock().now();
        let binding = self.binding(subject_id, now)?;
        let decision = decide_content(binding.as_ref(), check, now);
        self.record_restricted(subject_id, Capability::ContentAccess, &decision, now);
        Ok(decision)
    }

    /// Check whether a session may go on, and how long for.
    ///
    /// Only the `session_time` capability is gated here; inalienable
    /// capabilities stay reachable outside permitted hours.
    pub fn check_session(&self, subject_id: &str, usage: &SessionUsage) -> Result<Decision> {
        let now = self.store.clock().now();
        let binding = self.binding(subject_id, now)?;
        let decision = decide_session(binding.as_ref(), usage, now);
        if decision.is_deny() {
            self.record_restricted(subject_id, Capability::SessionTime, &decision, now);
        }
        Ok(decision)
    }

    /// Merged content, time and monitoring restrictions binding the subject.
    pub fn computed(&self, subject_id: &str) -> Result<ComputedRestrictions> {
        let now = self.store.clock().now();
        let binding = self.binding(subject_id, now)?;
        Ok(ComputedRestrictions::for_policy(binding.as_ref(), now))
    }

    fn binding(&self, subject_id: &str, now: DateTime<Utc>) -> Result<Option<CapabilityPolicy>> {
        let binding = self.store.binding_policy(subject_id, now)?;
        if let Some(policy) = binding.as_ref().filter(|p| p.has_lapsed(now)) {
            if let Err(e) = self.store.expire_if_lapsed(&policy.id) {
                warn!(policy = %policy.id, error = %e, "Lazy expiry failed");
            }
        }
        Ok(binding)
    }

    fn record_restricted(
        &self,
        subject_id: &str,
        capability: Capability,
        decision: &Decision,
        now: DateTime<Utc>,
    ) {
        let Some(policy) = decision.policy() else {
            return;
        };
        info!(
            subject = %subject_id,
            capability = %capability,
            policy = %policy.policy_id,
            version = policy.version,
            denied = decision.is_deny(),
            "Capability restricted"
        );
        self.store.audit().record_or_warn(
            subject_id,
            now,
            AuditEventKind::DecisionLogged {
                capability,
                decision: decision.clone(),
            },
        );
    }
}
