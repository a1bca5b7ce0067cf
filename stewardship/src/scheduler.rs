//! Scheduled re-review of capability policies.
//!
//! Every restriction must be re-justified when its review date comes round.
//! A review needs fresh evidence that still meets the basis's minimum tier,
//! except when it lets the policy expire. Once a basis's exit condition has
//! been crossed, expiry is the only outcome a review may reach.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::appeal::AppealWorkflow;
use crate::audit::AuditEventKind;
use crate::config::AppealConfig;
use crate::error::{Result, StewardshipError};
use crate::registry::{Capability, EvidenceTier};
use crate::store::PolicyStore;
use crate::types::{
    check_inalienable, resolve_rule, CapabilityPolicy, CommitAuthority, Evidence, LimitParams,
    PolicyId, PolicyRule, PolicyStatus, ReviewOutcome, ReviewRecord, RuleEffect,
};

pub struct ReviewScheduler {
    store: Arc<PolicyStore>,
    appeals: Arc<AppealWorkflow>,
    appeal_config: AppealConfig,
}

impl ReviewScheduler {
    pub fn new(store: Arc<PolicyStore>, appeals: Arc<AppealWorkflow>, appeal_config: AppealConfig) -> Self {
        Self {
            store,
            appeals,
            appeal_config,
        }
    }

    /// Policies whose review date (or end) has arrived, earliest first.
    ///
    /// Includes policies that already lapsed without a review.
    pub fn due_reviews(&self, as_of: DateTime<Utc>) -> Result<Vec<PolicyId>> {
        let mut due: Vec<(DateTime<Utc>, PolicyId)> = Vec::new();
        for subject in self.store.subjects_with_policies()? {
            let Some(policy) = self.store.current(&subject)? else {
                continue;
            };
            let lapsed_unreviewed = policy.status == PolicyStatus::Expired
                && self.store.reviews_for(&policy.id)?.is_empty();
            if policy.status != PolicyStatus::Active && !lapsed_unreviewed {
                continue;
            }
            if let Some(at) = policy.lapse_at().filter(|at| *at <= as_of) {
                due.push((at, policy.id));
            }
        }
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    /// Record the outcome of a review and carry it out.
    ///
    /// Returns the successor policy for renewed, tightened and loosened
    /// outcomes, otherwise the reviewed policy in its new state.
    pub fn complete_review(
        &self,
        policy_id: &str,
        outcome: ReviewOutcome,
        evidence: Option<Evidence>,
    ) -> Result<CapabilityPolicy> {
        let policy = self.store.require(policy_id)?;
        let now = self.store.clock().now();
        self.ensure_reviewable(&policy)?;

        if outcome != ReviewOutcome::Expired {
            self.ensure_authority_holds(&policy, now)?;
            self.ensure_fresh_evidence(&policy, evidence.as_ref())?;
        }
        let evidence_for_successor = || evidence.clone().unwrap_or_else(|| policy.evidence.clone());

        let mut appeal_id = None;
        let result = match &outcome {
            ReviewOutcome::Renewed => self.successor(&policy, policy.rules.clone(), evidence_for_successor())?,
            ReviewOutcome::Tightened { rules } => {
                check_inalienable(rules)?;
                if let Some(capability) = first_loosened(&policy.rules, rules) {
                    return Err(StewardshipError::InvalidDraft(format!(
                        "a tightening review cannot lift the restriction on '{}'",
                        capability
                    )));
                }
                self.successor(&policy, rules.clone(), evidence_for_successor())?
            }
            ReviewOutcome::Loosened { rules } => {
                check_inalienable(rules)?;
                if let Some(capability) = first_loosened(rules, &policy.rules) {
                    return Err(StewardshipError::InvalidDraft(format!(
                        "a loosening review cannot add a restriction on '{}'",
                        capability
                    )));
                }
                self.successor(&policy, rules.clone(), evidence_for_successor())?
            }
            ReviewOutcome::Expired => match policy.status {
                PolicyStatus::Expired => policy.clone(),
                _ => self
                    .store
                    .transition(&policy.id, PolicyStatus::Expired, None, "expired at review")?,
            },
            ReviewOutcome::EscalatedToAppeal { grounds } => {
                if policy.status != PolicyStatus::Active {
                    return Err(StewardshipError::InvalidTransition(format!(
                        "policy {} has lapsed and cannot be escalated",
                        policy.id
                    )));
                }
                let hold_until = now + self.appeal_config.decision_deadline();
                let held = self.store.transition(
                    &policy.id,
                    PolicyStatus::UnderReview,
                    Some(hold_until),
                    "review escalated to appeal",
                )?;
                appeal_id = Some(self.appeals.file_review_escalation(&held, grounds));
                held
            }
        };

        let successor = (result.id != policy.id).then(|| result.id.clone());
        let record = ReviewRecord {
            policy_id: policy.id.clone(),
            due: policy.review_due,
            completed_at: now,
            outcome: outcome.clone(),
            evidence,
            successor: successor.clone(),
            appeal_id: appeal_id.clone(),
        };
        self.store.record_review(&record)?;
        self.store.audit().record_or_warn(
            &policy.subject_id,
            now,
            AuditEventKind::ReviewCompleted {
                policy_id: policy.id.clone(),
                outcome: outcome.as_str().to_string(),
                successor,
                appeal_id,
            },
        );
        info!(
            policy = %policy.id,
            subject = %policy.subject_id,
            outcome = outcome.as_str(),
            result = %result.id,
            "Review completed"
        );
        Ok(result)
    }

    pub fn reviews_for(&self, policy_id: &str) -> Result<Vec<ReviewRecord>> {
        self.store.reviews_for(policy_id)
    }

    fn ensure_reviewable(&self, policy: &CapabilityPolicy) -> Result<()> {
        let head = self.store.current(&policy.subject_id)?;
        if head.as_ref().map(|h| h.id.as_str()) != Some(policy.id.as_str()) {
            return Err(StewardshipError::InvalidTransition(format!(
                "policy {} has been superseded",
                policy.id
            )));
        }
        match policy.status {
            PolicyStatus::Active => Ok(()),
            // Lapsed without review; a late review may still act on it once
            PolicyStatus::Expired if self.store.reviews_for(&policy.id)?.is_empty() => Ok(()),
            PolicyStatus::UnderReview => Err(StewardshipError::InvalidTransition(format!(
                "policy {} is under appeal",
                policy.id
            ))),
            status => Err(StewardshipError::InvalidTransition(format!(
                "policy {} is {:?}",
                policy.id, status
            ))),
        }
    }

    fn ensure_authority_holds(&self, policy: &CapabilityPolicy, now: DateTime<Utc>) -> Result<()> {
        let date_of_birth = self
            .store
            .subject(&policy.subject_id)?
            .and_then(|s| s.date_of_birth);
        match policy.authority_basis.exit_reached(date_of_birth, now) {
            Some(false) => Ok(()),
            Some(true) => Err(StewardshipError::AuthorityLapsed(format!(
                "{} no longer applies to {}; only expiry is possible",
                policy.authority_basis, policy.subject_id
            ))),
            None => Err(StewardshipError::AuthorityLapsed(format!(
                "{} cannot be verified for {}",
                policy.authority_basis, policy.subject_id
            ))),
        }
    }

    fn ensure_fresh_evidence(&self, policy: &CapabilityPolicy, evidence: Option<&Evidence>) -> Result<()> {
        let required = policy.authority_basis.rules().minimum_evidence;
        let Some(evidence) = evidence else {
            return Err(StewardshipError::EvidenceInsufficient {
                basis: policy.authority_basis.to_string(),
                required,
                provided: EvidenceTier::None,
            });
        };
        if !evidence.tier.satisfies(required) {
            return Err(StewardshipError::EvidenceInsufficient {
                basis: policy.authority_basis.to_string(),
                required,
                provided: evidence.tier,
            });
        }
        if evidence.recorded_at < policy.effective_start {
            return Err(StewardshipError::InvalidDraft(format!(
                "evidence '{}' predates the policy under review",
                evidence.reference
            )));
        }
        Ok(())
    }

    fn successor(
        &self,
        policy: &CapabilityPolicy,
        rules: Vec<PolicyRule>,
        evidence: Evidence,
    ) -> Result<CapabilityPolicy> {
        let draft = self.store.successor_draft(policy, rules, evidence, false);
        self.store.commit_as(draft, CommitAuthority::ReviewScheduler)
    }
}

/// 0 = unrestricted, 1 = limited, 2 = disabled.
fn severity(rules: &[PolicyRule], capability: Capability) -> (u8, Option<&LimitParams>) {
    match resolve_rule(rules, capability).map(|r| &r.effect) {
        None | Some(RuleEffect::Enabled) => (0, None),
        Some(RuleEffect::Limited(params)) => (1, Some(params)),
        Some(RuleEffect::Disabled) => (2, None),
    }
}

/// First capability that `after` restricts less than `before` does.
fn first_loosened(before: &[PolicyRule], after: &[PolicyRule]) -> Option<Capability> {
    Capability::all()
        .into_iter()
        .filter(|c| !c.is_inalienable())
        .find(|c| {
            let (old, old_limit) = severity(before, *c);
            let (new, new_limit) = severity(after, *c);
            if new != old {
                return new < old;
            }
            match (old_limit, new_limit) {
                (Some(old_limit), Some(new_limit)) => old_limit
                    .0
                    .iter()
                    .any(|(key, value)| new_limit.get(key).map_or(true, |v| v > *value)),
                _ => false,
            }
        })
}
