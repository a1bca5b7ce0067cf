//! Due-process appeal workflow.
//!
//! ```text
//! Filed -> Notified -> ResponseWindow -> Arbitration -> Decision
//!       -> MandatoryAppealWindow -> Resolved
//! ```
//!
//! `Withdrawn` is reachable from any state before a decision. Filing never
//! fails. `advance` moves an appeal through every gate whose time has come
//! and is a no-op otherwise, so the sweep can call it as often as it likes.
//! A respondent who lets the response window run out is recorded as having
//! submitted an empty rebuttal; the appeal still goes to arbitration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::Tree;
use tracing::{debug, info, warn};

#[cfg(feature = "typescript")]
use ts_rs::TS;

use crate::audit::AuditEventKind;
use crate::config::AppealConfig;
use crate::error::{Result, StewardshipError};
use crate::registry::Capability;
use crate::reviewer::{AppealOutcome, ProportionalityReviewer, ReviewEvidence, Ruling};
use crate::store::PolicyStore;
use crate::trigger::TriggerCase;
use crate::types::{
    AgentId, AppealId, CapabilityPolicy, CommitAuthority, Evidence, PolicyId, PolicyRule,
    PolicyStatus,
};

/// What the appellant contests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum AppealKind {
    /// Restriction reaches beyond what the basis justifies
    #[default]
    Scope,
    /// Restriction is heavier than the concern warrants
    Excessive,
    /// The evidence behind the policy is wrong or stale
    InvalidEvidence,
    /// Request to have specific capabilities back
    CapabilityRequest,
}

/// How the appeal came to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppealOrigin {
    Subject,
    ReviewEscalation,
    ConsensusTrigger {
        case_id: String,
        total_weight: f64,
        supporters: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum AppealState {
    Filed,
    Notified,
    ResponseWindow,
    Arbitration,
    Decision,
    MandatoryAppealWindow,
    Resolved,
    Withdrawn,
}

impl AppealState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filed => "filed",
            Self::Notified => "notified",
            Self::ResponseWindow => "response_window",
            Self::Arbitration => "arbitration",
            Self::Decision => "decision",
            Self::MandatoryAppealWindow => "mandatory_appeal_window",
            Self::Resolved => "resolved",
            Self::Withdrawn => "withdrawn",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Withdrawn)
    }

    /// States from which the appellant may still withdraw.
    pub fn is_withdrawable(&self) -> bool {
        matches!(
            self,
            Self::Filed | Self::Notified | Self::ResponseWindow | Self::Arbitration
        )
    }
}

/// The respondent's answer to an appeal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rebuttal {
    pub submitted_by: Option<AgentId>,
    pub statement: String,
    pub evidence: Option<Evidence>,
    pub submitted_at: DateTime<Utc>,
    /// Recorded because the response window closed without a submission
    pub defaulted: bool,
}

impl Rebuttal {
    fn defaulted(at: DateTime<Utc>) -> Self {
        Self {
            submitted_by: None,
            statement: String::new(),
            evidence: None,
            submitted_at: at,
            defaulted: true,
        }
    }

    pub fn is_substantive(&self) -> bool {
        !self.defaulted && !self.statement.trim().is_empty()
    }
}

/// Recorded outcome of arbitration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppealDecision {
    pub reviewer_id: String,
    pub outcome: AppealOutcome,
    pub reasoning: String,
    pub decided_at: DateTime<Utc>,
    /// Policy committed to carry out a modified or upheld ruling
    pub successor_policy: Option<PolicyId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appeal {
    pub id: AppealId,
    /// Contested policy; consensus cases have none yet
    pub policy_id: Option<PolicyId>,
    pub subject_id: AgentId,
    pub filed_by: AgentId,
    pub filed_at: DateTime<Utc>,
    pub kind: AppealKind,
    pub origin: AppealOrigin,
    pub respondent: Option<AgentId>,
    pub advocate: Option<AgentId>,
    pub grounds: String,
    pub requested_capabilities: Vec<Capability>,
    pub evidence: Option<Evidence>,
    pub rebuttal: Option<Rebuttal>,
    pub state: AppealState,
    pub state_changed_at: DateTime<Utc>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub appeal_window_ends: Option<DateTime<Utc>>,
    pub decision: Option<AppealDecision>,
    /// Set on a re-appeal
    pub prior_appeal: Option<AppealId>,
    /// Set on an appeal that has been re-appealed
    pub re_appealed_by: Option<AppealId>,
}

impl Appeal {
    /// Whether the single re-appeal is still open to the parties.
    pub fn re_appeal_available(&self, now: DateTime<Utc>) -> bool {
        self.state == AppealState::MandatoryAppealWindow
            && self.prior_appeal.is_none()
            && self.re_appealed_by.is_none()
            && self.appeal_window_ends.map_or(false, |end| now < end)
    }

    fn is_party(&self, agent: &str) -> bool {
        agent == self.subject_id
            || agent == self.filed_by
            || self.advocate.as_deref() == Some(agent)
            || self.respondent.as_deref() == Some(agent)
    }
}

/// An appeal as submitted by a subject or their advocate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppealFiling {
    pub subject_id: AgentId,
    #[serde(default)]
    pub policy_id: Option<PolicyId>,
    /// Defaults to the subject
    #[serde(default)]
    pub filed_by: Option<AgentId>,
    #[serde(default)]
    pub kind: AppealKind,
    pub grounds: String,
    #[serde(default)]
    pub requested_capabilities: Vec<Capability>,
    #[serde(default)]
    pub evidence: Option<Evidence>,
    #[serde(default)]
    pub advocate: Option<AgentId>,
}

pub struct AppealWorkflow {
    store: Arc<PolicyStore>,
    reviewer: Arc<dyn ProportionalityReviewer>,
    config: AppealConfig,
    appeals: DashMap<AppealId, Appeal>,
    tree: Tree,
}

impl AppealWorkflow {
    pub fn new(
        store: Arc<PolicyStore>,
        reviewer: Arc<dyn ProportionalityReviewer>,
        config: AppealConfig,
    ) -> Result<Self> {
        let tree = store.db().open_tree("appeals")?;
        let appeals = DashMap::new();
        for item in tree.iter() {
            let (key, value) = item?;
            match rmp_serde::from_slice::<Appeal>(&value) {
                Ok(appeal) => {
                    appeals.insert(appeal.id.clone(), appeal);
                }
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "Skipping unreadable appeal record"
                ),
            }
        }
        debug!(count = appeals.len(), "Loaded appeals");
        Ok(Self {
            store,
            reviewer,
            config,
            appeals,
            tree,
        })
    }

    pub fn reviewer_id(&self) -> &str {
        self.reviewer.id()
    }

    // =========================================================================
    // Filing
    // =========================================================================

    /// File an appeal against a policy.
    pub fn file_appeal(&self, subject_id: &str, policy_id: &str, grounds: &str) -> AppealId {
        self.file(AppealFiling {
            subject_id: subject_id.to_string(),
            policy_id: Some(policy_id.to_string()),
            filed_by: None,
            kind: AppealKind::default(),
            grounds: grounds.to_string(),
            requested_capabilities: Vec::new(),
            evidence: None,
            advocate: None,
        })
    }

    /// File a subject appeal. Always accepted.
    pub fn file(&self, filing: AppealFiling) -> AppealId {
        let respondent = self.steward_of(filing.policy_id.as_deref());
        let filed_by = filing.filed_by.unwrap_or_else(|| filing.subject_id.clone());
        let now = self.store.clock().now();
        self.insert_new(Appeal {
            id: format!("appeal-{}", uuid::Uuid::new_v4()),
            policy_id: filing.policy_id,
            subject_id: filing.subject_id,
            filed_by,
            filed_at: now,
            kind: filing.kind,
            origin: AppealOrigin::Subject,
            respondent,
            advocate: filing.advocate,
            grounds: filing.grounds,
            requested_capabilities: filing.requested_capabilities,
            evidence: filing.evidence,
            rebuttal: None,
            state: AppealState::Filed,
            state_changed_at: now,
            response_deadline: None,
            appeal_window_ends: None,
            decision: None,
            prior_appeal: None,
            re_appealed_by: None,
        })
    }

    /// Appeal opened on the subject's behalf when a review escalates.
    pub(crate) fn file_review_escalation(&self, policy: &CapabilityPolicy, grounds: &str) -> AppealId {
        let now = self.store.clock().now();
        self.insert_new(Appeal {
            id: format!("appeal-{}", uuid::Uuid::new_v4()),
            policy_id: Some(policy.id.clone()),
            subject_id: policy.subject_id.clone(),
            filed_by: policy.subject_id.clone(),
            filed_at: now,
            kind: AppealKind::Scope,
            origin: AppealOrigin::ReviewEscalation,
            respondent: Some(policy.steward_id.clone()),
            advocate: None,
            grounds: grounds.to_string(),
            requested_capabilities: Vec::new(),
            evidence: None,
            rebuttal: None,
            state: AppealState::Filed,
            state_changed_at: now,
            response_deadline: None,
            appeal_window_ends: None,
            decision: None,
            prior_appeal: None,
            re_appealed_by: None,
        })
    }

    /// Open due process for a consensus case; the subject answers it.
    ///
    /// Idempotent per case, and a subject already answering an unresolved
    /// consensus appeal is not served a second one.
    pub fn open_consensus_case(&self, case: &TriggerCase) -> AppealId {
        let existing = self.appeals.iter().find_map(|entry| match &entry.origin {
            AppealOrigin::ConsensusTrigger { case_id, .. }
                if *case_id == case.case_id
                    || (entry.subject_id == case.subject_id && !entry.state.is_terminal()) =>
            {
                Some(entry.id.clone())
            }
            _ => None,
        });
        if let Some(id) = existing {
            return id;
        }

        let now = self.store.clock().now();
        self.insert_new(Appeal {
            id: format!("appeal-{}", uuid::Uuid::new_v4()),
            policy_id: None,
            subject_id: case.subject_id.clone(),
            filed_by: format!("community:{}", case.case_id),
            filed_at: now,
            kind: AppealKind::Scope,
            origin: AppealOrigin::ConsensusTrigger {
                case_id: case.case_id.clone(),
                total_weight: case.total_weight,
                supporters: case.contributors.len(),
            },
            respondent: Some(case.subject_id.clone()),
            advocate: None,
            grounds: format!(
                "weighted concern {:.1} reached threshold {:.1}",
                case.total_weight, case.threshold
            ),
            requested_capabilities: Vec::new(),
            evidence: None,
            rebuttal: None,
            state: AppealState::Filed,
            state_changed_at: now,
            response_deadline: None,
            appeal_window_ends: None,
            decision: None,
            prior_appeal: None,
            re_appealed_by: None,
        })
    }

    fn insert_new(&self, appeal: Appeal) -> AppealId {
        let id = appeal.id.clone();
        self.persist(&appeal);
        self.audit_transition(&appeal, "none", AppealState::Filed);
        info!(
            appeal = %id,
            subject = %appeal.subject_id,
            policy = ?appeal.policy_id,
            origin = ?appeal.origin,
            "Appeal filed"
        );
        self.appeals.insert(id.clone(), appeal);
        id
    }

    fn steward_of(&self, policy_id: Option<&str>) -> Option<AgentId> {
        let policy_id = policy_id?;
        match self.store.get(policy_id) {
            Ok(policy) => policy.map(|p| p.steward_id),
            Err(e) => {
                warn!(policy = %policy_id, error = %e, "Could not look up respondent");
                None
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, id: &str) -> Option<Appeal> {
        self.appeals.get(id).map(|a| a.clone())
    }

    pub fn require(&self, id: &str) -> Result<Appeal> {
        self.get(id)
            .ok_or_else(|| StewardshipError::NotFound(format!("appeal {}", id)))
    }

    pub fn appeals_for_subject(&self, subject_id: &str) -> Vec<Appeal> {
        let mut out: Vec<Appeal> = self
            .appeals
            .iter()
            .filter(|a| a.subject_id == subject_id)
            .map(|a| a.clone())
            .collect();
        out.sort_by(|a, b| a.filed_at.cmp(&b.filed_at));
        out
    }

    pub fn open_appeals(&self) -> Vec<Appeal> {
        let mut out: Vec<Appeal> = self
            .appeals
            .iter()
            .filter(|a| !a.state.is_terminal())
            .map(|a| a.clone())
            .collect();
        out.sort_by(|a, b| a.filed_at.cmp(&b.filed_at));
        out
    }

    // =========================================================================
    // Party actions
    // =========================================================================

    /// Record the respondent's answer. Accepted until arbitration starts.
    pub fn submit_rebuttal(
        &self,
        id: &str,
        submitted_by: &str,
        statement: &str,
        evidence: Option<Evidence>,
    ) -> Result<Appeal> {
        let now = self.store.clock().now();
        let updated = {
            let mut appeal = self
                .appeals
                .get_mut(id)
                .ok_or_else(|| StewardshipError::NotFound(format!("appeal {}", id)))?;
            if !matches!(
                appeal.state,
                AppealState::Filed | AppealState::Notified | AppealState::ResponseWindow
            ) {
                return Err(StewardshipError::InvalidTransition(format!(
                    "appeal {} no longer accepts a rebuttal ({})",
                    id,
                    appeal.state.as_str()
                )));
            }
            if appeal.respondent.as_deref().map_or(false, |r| r != submitted_by) {
                return Err(StewardshipError::UnauthorizedSteward {
                    steward: submitted_by.to_string(),
                    reason: format!("is not the respondent to appeal {}", id),
                });
            }
            appeal.rebuttal = Some(Rebuttal {
                submitted_by: Some(submitted_by.to_string()),
                statement: statement.to_string(),
                evidence,
                submitted_at: now,
                defaulted: false,
            });
            appeal.clone()
        };
        self.persist(&updated);
        info!(appeal = %id, respondent = %submitted_by, "Rebuttal submitted");
        Ok(updated)
    }

    /// Withdraw an appeal before it is decided.
    pub fn withdraw(&self, id: &str, by: &str) -> Result<Appeal> {
        let now = self.store.clock().now();
        let (from, updated) = {
            let mut appeal = self
                .appeals
                .get_mut(id)
                .ok_or_else(|| StewardshipError::NotFound(format!("appeal {}", id)))?;
            let permitted = by == appeal.filed_by
                || appeal.advocate.as_deref() == Some(by)
                || (appeal.origin == AppealOrigin::Subject && by == appeal.subject_id);
            if !permitted {
                return Err(StewardshipError::UnauthorizedSteward {
                    steward: by.to_string(),
                    reason: format!("may not withdraw appeal {}", id),
                });
            }
            if !appeal.state.is_withdrawable() {
                return Err(StewardshipError::InvalidTransition(format!(
                    "appeal {} cannot be withdrawn from {}",
                    id,
                    appeal.state.as_str()
                )));
            }
            let from = appeal.state;
            appeal.state = AppealState::Withdrawn;
            appeal.state_changed_at = now;
            (from, appeal.clone())
        };
        self.persist(&updated);
        self.audit_transition(&updated, from.as_str(), AppealState::Withdrawn);
        info!(appeal = %id, by = %by, "Appeal withdrawn");
        Ok(updated)
    }

    /// Use the single re-appeal during the mandatory appeal window.
    pub fn re_appeal(&self, id: &str, filed_by: &str, grounds: &str) -> Result<AppealId> {
        let now = self.store.clock().now();
        let new_id = format!("appeal-{}", uuid::Uuid::new_v4());

        let (prior, successor) = {
            let mut appeal = self
                .appeals
                .get_mut(id)
                .ok_or_else(|| StewardshipError::NotFound(format!("appeal {}", id)))?;
            if !appeal.is_party(filed_by) {
                return Err(StewardshipError::UnauthorizedSteward {
                    steward: filed_by.to_string(),
                    reason: format!("is not a party to appeal {}", id),
                });
            }
            if !appeal.re_appeal_available(now) {
                return Err(StewardshipError::InvalidTransition(format!(
                    "appeal {} has no re-appeal available",
                    id
                )));
            }

            let policy_id = appeal
                .decision
                .as_ref()
                .and_then(|d| d.successor_policy.clone())
                .or_else(|| appeal.policy_id.clone());
            let successor = Appeal {
                id: new_id.clone(),
                policy_id,
                subject_id: appeal.subject_id.clone(),
                filed_by: filed_by.to_string(),
                filed_at: now,
                kind: appeal.kind,
                origin: appeal.origin.clone(),
                respondent: appeal.respondent.clone(),
                advocate: appeal.advocate.clone(),
                grounds: grounds.to_string(),
                requested_capabilities: appeal.requested_capabilities.clone(),
                evidence: appeal.evidence.clone(),
                rebuttal: None,
                state: AppealState::Filed,
                state_changed_at: now,
                response_deadline: None,
                appeal_window_ends: None,
                decision: None,
                prior_appeal: Some(appeal.id.clone()),
                re_appealed_by: None,
            };

            appeal.re_appealed_by = Some(new_id.clone());
            appeal.state = AppealState::Resolved;
            appeal.state_changed_at = now;
            (appeal.clone(), successor)
        };

        self.persist(&prior);
        self.audit_transition(&prior, AppealState::MandatoryAppealWindow.as_str(), AppealState::Resolved);
        info!(appeal = %id, re_appeal = %new_id, by = %filed_by, "Decision re-appealed");
        Ok(self.insert_new(successor))
    }

    // =========================================================================
    // Progression
    // =========================================================================

    /// Move an appeal through every gate that is due.
    pub async fn advance(&self, id: &str) -> Result<Appeal> {
        // Bounded: the longest run is Filed through MandatoryAppealWindow
        for _ in 0..8 {
            let appeal = self.require(id)?;
            let now = self.store.clock().now();
            let next = match appeal.state {
                AppealState::Filed => Some(AppealState::Notified),
                AppealState::Notified => Some(AppealState::ResponseWindow),
                AppealState::ResponseWindow => {
                    let expired = appeal.response_deadline.map_or(true, |d| now >= d);
                    (appeal.rebuttal.is_some() || expired).then_some(AppealState::Arbitration)
                }
                AppealState::Arbitration => {
                    if !self.arbitrate(&appeal).await? {
                        return Ok(appeal);
                    }
                    continue;
                }
                AppealState::Decision => Some(AppealState::MandatoryAppealWindow),
                AppealState::MandatoryAppealWindow => {
                    let closed = appeal.appeal_window_ends.map_or(true, |end| now >= end);
                    closed.then_some(AppealState::Resolved)
                }
                AppealState::Resolved | AppealState::Withdrawn => None,
            };
            match next {
                Some(to) => self.move_state(id, appeal.state, to, now)?,
                None => return Ok(appeal),
            }
        }
        self.require(id)
    }

    /// Advance every open appeal. Returns how many changed state.
    pub async fn advance_all(&self) -> usize {
        let mut changed = 0;
        for appeal in self.open_appeals() {
            match self.advance(&appeal.id).await {
                Ok(after) if after.state != appeal.state => changed += 1,
                Ok(_) => {}
                Err(e) => warn!(appeal = %appeal.id, error = %e, "Failed to advance appeal"),
            }
        }
        changed
    }

    /// Ask the reviewer for a ruling. Returns whether the appeal moved on.
    async fn arbitrate(&self, appeal: &Appeal) -> Result<bool> {
        let evidence = self.review_evidence(appeal)?;
        match self.reviewer.review(appeal, &evidence).await {
            Ok(Some(ruling)) => match self.decide(&appeal.id, self.reviewer.id(), ruling) {
                Ok(_) => Ok(true),
                // Decided concurrently
                Err(StewardshipError::InvalidTransition(_)) => Ok(true),
                Err(e) => {
                    warn!(appeal = %appeal.id, error = %e, "Could not apply ruling; staying in arbitration");
                    Ok(false)
                }
            },
            Ok(None) => {
                debug!(appeal = %appeal.id, "Ruling pending");
                Ok(false)
            }
            Err(e) => {
                warn!(appeal = %appeal.id, error = %e, "Reviewer failed; staying in arbitration");
                Ok(false)
            }
        }
    }

    fn review_evidence(&self, appeal: &Appeal) -> Result<ReviewEvidence> {
        let policy = match &appeal.policy_id {
            Some(id) => self.store.get(id)?,
            None => None,
        };
        Ok(ReviewEvidence {
            policy,
            subject: self.store.subject(&appeal.subject_id)?,
        })
    }

    fn move_state(
        &self,
        id: &str,
        from: AppealState,
        to: AppealState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = {
            let mut appeal = self
                .appeals
                .get_mut(id)
                .ok_or_else(|| StewardshipError::NotFound(format!("appeal {}", id)))?;
            if appeal.state != from {
                // Lost a race; the caller re-reads
                return Ok(());
            }
            match to {
                AppealState::ResponseWindow => {
                    appeal.response_deadline = Some(now + self.config.response_window());
                }
                AppealState::Arbitration if appeal.rebuttal.is_none() => {
                    let at = appeal.response_deadline.unwrap_or(now);
                    appeal.rebuttal = Some(Rebuttal::defaulted(at));
                    info!(appeal = %id, "Response window closed without a rebuttal");
                }
                AppealState::MandatoryAppealWindow => {
                    appeal.appeal_window_ends = Some(now + self.config.appeal_window());
                }
                _ => {}
            }
            appeal.state = to;
            appeal.state_changed_at = now;
            appeal.clone()
        };
        self.persist(&updated);
        self.audit_transition(&updated, from.as_str(), to);
        debug!(appeal = %id, from = from.as_str(), to = to.as_str(), "Appeal advanced");
        Ok(())
    }

    /// Record a ruling and carry it out.
    ///
    /// Only the configured reviewer may decide.
    pub fn decide(&self, id: &str, reviewer_id: &str, ruling: Ruling) -> Result<Appeal> {
        if reviewer_id != self.reviewer.id() {
            return Err(StewardshipError::UnauthorizedSteward {
                steward: reviewer_id.to_string(),
                reason: "is not the configured proportionality reviewer".to_string(),
            });
        }
        let now = self.store.clock().now();

        // Claim the decision before touching any policy
        let (claimed, arbitration_since) = {
            let mut appeal = self
                .appeals
                .get_mut(id)
                .ok_or_else(|| StewardshipError::NotFound(format!("appeal {}", id)))?;
            if appeal.state != AppealState::Arbitration {
                return Err(StewardshipError::InvalidTransition(format!(
                    "appeal {} is not in arbitration ({})",
                    id,
                    appeal.state.as_str()
                )));
            }
            let arbitration_since = appeal.state_changed_at;
            appeal.state = AppealState::Decision;
            appeal.state_changed_at = now;
            appeal.decision = Some(AppealDecision {
                reviewer_id: reviewer_id.to_string(),
                outcome: ruling.outcome.clone(),
                reasoning: ruling.reasoning.clone(),
                decided_at: now,
                successor_policy: None,
            });
            (appeal.clone(), arbitration_since)
        };

        let successor = match self.apply_outcome(&claimed, &ruling.outcome) {
            Ok(successor) => successor,
            Err(e) => {
                // Release the claim; nothing was persisted
                if let Some(mut appeal) = self.appeals.get_mut(id) {
                    appeal.state = AppealState::Arbitration;
                    appeal.state_changed_at = arbitration_since;
                    appeal.decision = None;
                }
                warn!(appeal = %id, error = %e, "Ruling could not be applied; back in arbitration");
                return Err(e);
            }
        };

        let updated = {
            let mut appeal = self
                .appeals
                .get_mut(id)
                .ok_or_else(|| StewardshipError::NotFound(format!("appeal {}", id)))?;
            if let Some(decision) = appeal.decision.as_mut() {
                decision.successor_policy = successor.clone();
            }
            appeal.clone()
        };
        self.persist(&updated);
        self.audit_transition(&updated, AppealState::Arbitration.as_str(), AppealState::Decision);
        info!(
            appeal = %id,
            outcome = ruling.outcome.as_str(),
            successor = ?successor,
            reasoning = %ruling.reasoning,
            "Appeal decided"
        );
        Ok(updated)
    }

    /// Apply a ruling to the contested policy. Returns any successor policy.
    fn apply_outcome(&self, appeal: &Appeal, outcome: &AppealOutcome) -> Result<Option<PolicyId>> {
        let Some(policy_id) = appeal.policy_id.as_deref() else {
            return Ok(None);
        };
        let Some(policy) = self.store.get(policy_id)? else {
            return Ok(None);
        };
        if !policy.status.is_enforceable() {
            debug!(policy = %policy.id, status = ?policy.status, "Contested policy no longer binds");
            return Ok(None);
        }

        let result = match outcome {
            AppealOutcome::Upheld if policy.status == PolicyStatus::UnderReview => {
                self.reaffirm(&policy)
            }
            AppealOutcome::Upheld => Ok(None),
            AppealOutcome::Modified { reinstated } => {
                let mut rules = policy.rules.clone();
                rules.extend(
                    reinstated
                        .iter()
                        .filter(|c| !c.is_inalienable())
                        .map(|c| PolicyRule::enable(*c)),
                );
                let draft = self.store.successor_draft(&policy, rules, policy.evidence.clone(), true);
                self.store
                    .commit_as(draft, CommitAuthority::AppealWorkflow)
                    .map(|p| Some(p.id))
            }
            AppealOutcome::Overturned => self
                .store
                .transition(&policy.id, PolicyStatus::Revoked, None, "overturned on appeal")
                .map(|_| None),
        };
        match result {
            Err(StewardshipError::InvalidTransition(reason)) => {
                debug!(policy = %policy.id, reason = %reason, "Policy moved on before the ruling applied");
                Ok(None)
            }
            other => other,
        }
    }

    /// Confirm an escalated policy with a fresh review period.
    fn reaffirm(&self, policy: &CapabilityPolicy) -> Result<Option<PolicyId>> {
        let draft = self
            .store
            .successor_draft(policy, policy.rules.clone(), policy.evidence.clone(), false);
        match self.store.commit_as(draft, CommitAuthority::AppealWorkflow) {
            Ok(successor) => Ok(Some(successor.id)),
            Err(StewardshipError::AuthorityLapsed(reason)) => {
                info!(policy = %policy.id, reason = %reason, "Upheld policy's authority has lapsed");
                self.store
                    .transition(&policy.id, PolicyStatus::Expired, None, &reason)
                    .map(|_| None)
            }
            Err(e) => Err(e),
        }
    }

    fn persist(&self, appeal: &Appeal) {
        let result = rmp_serde::to_vec_named(appeal)
            .map_err(StewardshipError::from)
            .and_then(|bytes| Ok(self.tree.insert(appeal.id.as_bytes(), bytes)?));
        if let Err(e) = result {
            warn!(appeal = %appeal.id, error = %e, "Failed to persist appeal");
        }
    }

    fn audit_transition(&self, appeal: &Appeal, from: &str, to: AppealState) {
        self.store.audit().record_or_warn(
            &appeal.subject_id,
            self.store.clock().now(),
            AuditEventKind::AppealTransition {
                appeal_id: appeal.id.clone(),
                policy_id: appeal.policy_id.clone().unwrap_or_default(),
                from: from.to_string(),
                to: to.as_str().to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{ReviewConfig, ReviewerConfig};
    use crate::grant::{GrantRequest, GrantScope};
    use crate::registry::{AuthorityBasis, EvidenceTier, StewardTier};
    use crate::reviewer::RuleBasedReviewer;
    use crate::types::PolicyDraft;
    use async_trait::async_trait;
    use chrono::{Duration, Months, NaiveDate};
    use tempfile::TempDir;

    /// Leaves every appeal in arbitration until decided by hand.
    struct PanelReviewer;

    #[async_trait]
    impl ProportionalityReviewer for PanelReviewer {
        fn id(&self) -> &str {
            "panel"
        }

        async fn review(&self, _appeal: &Appeal, _evidence: &ReviewEvidence) -> Result<Option<Ruling>> {
            Ok(None)
        }
    }

    fn setup(
        reviewer: Arc<dyn ProportionalityReviewer>,
    ) -> (TempDir, Arc<ManualClock>, Arc<PolicyStore>, AppealWorkflow) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(
            PolicyStore::open(dir.path(), ReviewConfig::default(), clock.clone()).unwrap(),
        );
        let workflow = AppealWorkflow::new(store.clone(), reviewer, AppealConfig::default()).unwrap();
        (dir, clock, store, workflow)
    }

    fn org_policy(store: &PolicyStore, subject: &str) -> CapabilityPolicy {
        let now = store.clock().now();
        store
            .grant(GrantRequest {
                steward_id: "coop-board".to_string(),
                subject_id: subject.to_string(),
                basis: AuthorityBasis::OrganizationalRole,
                evidence: Evidence::new(EvidenceTier::SelfAssertion, "membership", now),
                scope: GrantScope::All,
                tier: StewardTier::Coordinator,
                delegatable: false,
                expires_at: None,
            })
            .unwrap();
        store
            .commit(PolicyDraft {
                subject_id: subject.to_string(),
                steward_id: "coop-board".to_string(),
                authority_basis: AuthorityBasis::OrganizationalRole,
                rules: vec![PolicyRule::disable(Capability::Post)],
                evidence: Evidence::new(EvidenceTier::SelfAssertion, "conduct-report", now),
                effective_start: None,
                review_due: None,
                effective_end: None,
                expected_version: 0,
                restrictions: Default::default(),
            })
            .unwrap()
    }

    /// Drive an appeal past its response window into arbitration.
    async fn into_arbitration(clock: &ManualClock, workflow: &AppealWorkflow, id: &str) -> Appeal {
        workflow.advance(id).await.unwrap();
        clock.advance(Duration::days(8));
        workflow.advance(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_appeal_against_revoked_policy_is_heard() {
        let (_dir, clock, store, workflow) = setup(Arc::new(PanelReviewer));
        let policy = org_policy(&store, "ola");
        store.revoke(&policy.id, "coop-board").unwrap();

        let id = workflow.file_appeal("ola", &policy.id, "restriction was never justified");
        let appeal = workflow.require(&id).unwrap();
        assert_eq!(appeal.state, AppealState::Filed);
        assert_eq!(appeal.respondent.as_deref(), Some("coop-board"));

        let appeal = into_arbitration(&clock, &workflow, &id).await;
        assert_eq!(appeal.state, AppealState::Arbitration);
        let decided = workflow
            .decide(&id, "panel", Ruling::new(AppealOutcome::Overturned, "no basis"))
            .unwrap();
        assert_eq!(decided.state, AppealState::Decision);
        assert_eq!(decided.decision.unwrap().successor_policy, None);
        assert_eq!(store.require(&policy.id).unwrap().status, PolicyStatus::Revoked);
        assert_eq!(store.history("ola").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_appeal_against_expired_policy_is_heard() {
        let (_dir, clock, store, workflow) = setup(Arc::new(RuleBasedReviewer::new(
            "reviewer",
            ReviewerConfig::default(),
        )));
        let policy = org_policy(&store, "ola");
        clock.advance(Duration::days(366));
        assert!(store.expire_if_lapsed(&policy.id).unwrap());

        let id = workflow.file_appeal("ola", &policy.id, "lapsed restriction");
        workflow.advance(&id).await.unwrap();
        clock.advance(Duration::days(8));
        let appeal = workflow.advance(&id).await.unwrap();
        assert_eq!(appeal.state, AppealState::MandatoryAppealWindow);
        assert_eq!(appeal.decision.unwrap().successor_policy, None);
        assert_eq!(store.require(&policy.id).unwrap().status, PolicyStatus::Expired);
    }

    #[tokio::test]
    async fn test_withdraw() {
        let (_dir, _clock, store, workflow) = setup(Arc::new(PanelReviewer));
        let policy = org_policy(&store, "ola");
        let id = workflow.file(AppealFiling {
            subject_id: "ola".to_string(),
            policy_id: Some(policy.id.clone()),
            filed_by: None,
            kind: AppealKind::Excessive,
            grounds: "too broad".to_string(),
            requested_capabilities: Vec::new(),
            evidence: None,
            advocate: Some("advocate-jo".to_string()),
        });

        assert!(matches!(
            workflow.withdraw(&id, "coop-board"),
            Err(StewardshipError::UnauthorizedSteward { .. })
        ));
        let withdrawn = workflow.withdraw(&id, "advocate-jo").unwrap();
        assert_eq!(withdrawn.state, AppealState::Withdrawn);
        assert!(matches!(
            workflow.withdraw(&id, "ola"),
            Err(StewardshipError::InvalidTransition(_))
        ));

        // Withdrawn appeals no longer move
        assert_eq!(workflow.advance(&id).await.unwrap().state, AppealState::Withdrawn);
        assert!(workflow.open_appeals().is_empty());
    }

    #[tokio::test]
    async fn test_rebuttal_closes_at_arbitration() {
        let (_dir, clock, store, workflow) = setup(Arc::new(PanelReviewer));
        let policy = org_policy(&store, "ola");
        let id = workflow.file_appeal("ola", &policy.id, "too broad");

        assert!(matches!(
            workflow.submit_rebuttal(&id, "ola", "not me", None),
            Err(StewardshipError::UnauthorizedSteward { .. })
        ));

        let appeal = into_arbitration(&clock, &workflow, &id).await;
        assert_eq!(appeal.state, AppealState::Arbitration);
        assert!(appeal.rebuttal.as_ref().unwrap().defaulted);

        assert!(matches!(
            workflow.submit_rebuttal(&id, "coop-board", "late answer", None),
            Err(StewardshipError::InvalidTransition(_))
        ));
        assert!(workflow.require(&id).unwrap().rebuttal.unwrap().defaulted);
    }

    #[tokio::test]
    async fn test_failed_ruling_returns_to_arbitration() {
        let (_dir, clock, store, workflow) = setup(Arc::new(PanelReviewer));
        let now = clock.now();
        // Turns eighteen a few days from now
        let date_of_birth: NaiveDate = (now.date_naive() - Months::new(18 * 12)) + Duration::days(5);
        store.register_subject("ola", Some(date_of_birth)).unwrap();
        store
            .grant(GrantRequest {
                steward_id: "parent".to_string(),
                subject_id: "ola".to_string(),
                basis: AuthorityBasis::MinorGuardianship,
                evidence: Evidence::new(EvidenceTier::ProfessionalAttestation, "birth-record", now),
                scope: GrantScope::All,
                tier: StewardTier::Guardian,
                delegatable: false,
                expires_at: None,
            })
            .unwrap();
        let policy = store
            .commit(PolicyDraft {
                subject_id: "ola".to_string(),
                steward_id: "parent".to_string(),
                authority_basis: AuthorityBasis::MinorGuardianship,
                rules: vec![PolicyRule::disable(Capability::Transfer)],
                evidence: Evidence::new(EvidenceTier::ProfessionalAttestation, "school-report", now),
                effective_start: None,
                review_due: None,
                effective_end: None,
                expected_version: 0,
                restrictions: Default::default(),
            })
            .unwrap();

        let id = workflow.file_appeal("ola", &policy.id, "give me transfers back");
        let id = id.as_str();
        let before = into_arbitration(&clock, &workflow, id).await;
        assert_eq!(before.state, AppealState::Arbitration);

        let err = workflow
            .decide(
                id,
                "panel",
                Ruling::new(
                    AppealOutcome::Modified {
                        reinstated: vec![Capability::Transfer],
                    },
                    "reinstate",
                ),
            )
            .unwrap_err();
        assert!(matches!(err, StewardshipError::AuthorityLapsed(_)));

        let after = workflow.require(id).unwrap();
        assert_eq!(after.state, AppealState::Arbitration);
        assert_eq!(after.state_changed_at, before.state_changed_at);
        assert!(after.decision.is_none());
        assert_eq!(store.history("ola").unwrap().len(), 1);

        // A ruling that can be carried out still lands
        let decided = workflow
            .decide(id, "panel", Ruling::new(AppealOutcome::Overturned, "authority ended"))
            .unwrap();
        assert_eq!(decided.state, AppealState::Decision);
        assert_eq!(store.require(&policy.id).unwrap().status, PolicyStatus::Revoked);
    }
}
