//! Core types for stewardship policies.
//!
//! A `CapabilityPolicy` is immutable once committed except for its lifecycle
//! fields (`status`, `status_changed_at`, `hold_until`). Changing the rules or
//! the effective window always means committing a superseding version; the
//! only window change a commit makes is closing the prior version's
//! `effective_end` at its successor's start.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "typescript")]
use ts_rs::TS;

use crate::error::StewardshipError;
use crate::registry::{AuthorityBasis, Capability, CapabilityCategory, EvidenceTier};
use crate::restrictions::{Restrictions, StewardLayer};

pub type PolicyId = String;
pub type AppealId = String;
pub type GrantId = String;
pub type AgentId = String;

// =============================================================================
// Subjects and evidence
// =============================================================================

/// An agent whose capabilities may be restricted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Subject {
    pub id: AgentId,
    /// Used by bases with an age-based exit condition
    pub date_of_birth: Option<NaiveDate>,
    /// Version of the latest committed policy (0 = never restricted)
    #[serde(default)]
    pub policy_version: u64,
    pub registered_at: DateTime<Utc>,
    /// Set when the subject exercised their right to disconnect
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Evidence backing a policy, a grant or a review outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Evidence {
    pub tier: EvidenceTier,
    /// Content hash or external document reference
    pub reference: String,
    pub attested_by: Option<AgentId>,
    pub recorded_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(tier: EvidenceTier, reference: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            tier,
            reference: reference.into(),
            attested_by: None,
            recorded_at,
        }
    }

    pub fn attested_by(mut self, agent: impl Into<String>) -> Self {
        self.attested_by = Some(agent.into());
        self
    }
}

// =============================================================================
// Rules
// =============================================================================

/// Numeric limits attached to a `limited` capability (e.g. `daily_minutes`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(transparent)]
pub struct LimitParams(pub BTreeMap<String, u64>);

impl LimitParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: u64) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.0.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Combine a limit with what the caller asked for.
    ///
    /// Every limited key resolves to the smaller of the two values; keys the
    /// limit does not mention pass through unchanged.
    pub fn narrow(&self, requested: &LimitParams) -> LimitParams {
        let mut out = requested.0.clone();
        for (key, limit) in &self.0 {
            let value = requested.get(key).map_or(*limit, |r| r.min(*limit));
            out.insert(key.clone(), value);
        }
        LimitParams(out)
    }
}

/// Which capabilities a rule applies to.
///
/// `All` and `Category` only ever expand to restrictable capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Selector {
    All,
    Category(CapabilityCategory),
    Capability(Capability),
}

impl Selector {
    pub fn matches(&self, capability: Capability) -> bool {
        if capability.is_inalienable() {
            return matches!(self, Selector::Capability(c) if *c == capability);
        }
        match self {
            Selector::All => true,
            Selector::Category(category) => capability.category() == *category,
            Selector::Capability(c) => *c == capability,
        }
    }

    /// Higher is more specific.
    pub fn specificity(&self) -> u8 {
        match self {
            Selector::All => 0,
            Selector::Category(_) => 1,
            Selector::Capability(_) => 2,
        }
    }

    /// The inalienable capability this selector names, if any.
    pub fn inalienable_target(&self) -> Option<Capability> {
        match self {
            Selector::Capability(c) if c.is_inalienable() => Some(*c),
            Selector::Category(CapabilityCategory::Safety) => Some(Capability::ContactRelationships),
            _ => None,
        }
    }
}

/// Effect of a rule on the capabilities it selects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    Enabled,
    Disabled,
    Limited(LimitParams),
}

impl RuleEffect {
    pub fn is_restrictive(&self) -> bool {
        !matches!(self, RuleEffect::Enabled)
    }
}

/// One entry in a policy's ordered rule list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct PolicyRule {
    pub selector: Selector,
    pub effect: RuleEffect,
}

impl PolicyRule {
    pub fn disable(capability: Capability) -> Self {
        Self {
            selector: Selector::Capability(capability),
            effect: RuleEffect::Disabled,
        }
    }

    pub fn enable(capability: Capability) -> Self {
        Self {
            selector: Selector::Capability(capability),
            effect: RuleEffect::Enabled,
        }
    }

    pub fn limit(capability: Capability, params: LimitParams) -> Self {
        Self {
            selector: Selector::Capability(capability),
            effect: RuleEffect::Limited(params),
        }
    }

    pub fn disable_category(category: CapabilityCategory) -> Self {
        Self {
            selector: Selector::Category(category),
            effect: RuleEffect::Disabled,
        }
    }
}

/// Resolve the rule that governs a capability: most specific selector wins,
/// later entries win ties.
pub fn resolve_rule(rules: &[PolicyRule], capability: Capability) -> Option<&PolicyRule> {
    let mut best: Option<&PolicyRule> = None;
    for rule in rules.iter().filter(|r| r.selector.matches(capability)) {
        match best {
            Some(b) if b.selector.specificity() > rule.selector.specificity() => {}
            _ => best = Some(rule),
        }
    }
    best
}

/// Reject any rule that would disable or limit an inalienable capability.
pub fn check_inalienable(rules: &[PolicyRule]) -> Result<(), StewardshipError> {
    for rule in rules {
        if !rule.effect.is_restrictive() {
            continue;
        }
        if let Some(capability) = rule.selector.inalienable_target() {
            return Err(StewardshipError::InalienableViolation(capability));
        }
    }
    Ok(())
}

// =============================================================================
// Policies
// =============================================================================

/// Lifecycle status of a committed policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Draft,
    Active,
    UnderReview,
    Expired,
    Revoked,
    Superseded,
}

impl PolicyStatus {
    pub fn is_enforceable(&self) -> bool {
        matches!(self, Self::Active | Self::UnderReview)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Revoked | Self::Superseded)
    }
}

/// Which component committed a policy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum CommitAuthority {
    Steward,
    ReviewScheduler,
    AppealWorkflow,
}

/// Proposed policy, validated by `PolicyStore::commit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct PolicyDraft {
    pub subject_id: AgentId,
    pub steward_id: AgentId,
    pub authority_basis: AuthorityBasis,
    pub rules: Vec<PolicyRule>,
    pub evidence: Evidence,
    /// Defaults to commit time
    #[serde(default)]
    pub effective_start: Option<DateTime<Utc>>,
    /// Required for court orders; otherwise capped at the basis period
    #[serde(default)]
    pub review_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub effective_end: Option<DateTime<Utc>>,
    /// Version the caller last read for this subject (0 = none)
    #[serde(default)]
    pub expected_version: u64,
    /// Content, time and monitoring restrictions from this steward
    #[serde(default)]
    pub restrictions: Restrictions,
}

/// A committed, versioned capability policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct CapabilityPolicy {
    pub id: PolicyId,
    pub subject_id: AgentId,
    pub steward_id: AgentId,
    /// Per-subject, strictly increasing from 1
    pub version: u64,
    pub authority_basis: AuthorityBasis,
    pub effective_start: DateTime<Utc>,
    pub review_due: Option<DateTime<Utc>>,
    /// Closed at the successor's start once superseded
    pub effective_end: Option<DateTime<Utc>>,
    pub rules: Vec<PolicyRule>,
    pub evidence: Evidence,
    pub supersedes: Option<PolicyId>,
    pub committed_at: DateTime<Utc>,
    pub committed_by: CommitAuthority,
    /// Restrictions per steward, merged when content or sessions are checked
    #[serde(default)]
    pub layers: Vec<StewardLayer>,

    // === LIFECYCLE ===
    pub status: PolicyStatus,
    pub status_changed_at: DateTime<Utc>,
    /// Enforcement deadline while `under_review`
    pub hold_until: Option<DateTime<Utc>>,
}

impl CapabilityPolicy {
    pub fn reference(&self) -> PolicyRef {
        PolicyRef {
            policy_id: self.id.clone(),
            version: self.version,
        }
    }

    pub fn rule_for(&self, capability: Capability) -> Option<&PolicyRule> {
        resolve_rule(&self.rules, capability)
    }

    /// Capabilities this policy disables or limits.
    pub fn restricted_capabilities(&self) -> Vec<Capability> {
        Capability::all()
            .into_iter()
            .filter(|c| {
                self.rule_for(*c)
                    .map(|r| r.effect.is_restrictive())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// The point after which the policy no longer binds, ignoring status.
    pub fn lapse_at(&self) -> Option<DateTime<Utc>> {
        let deadline = match self.status {
            PolicyStatus::UnderReview => self.hold_until,
            _ => self.review_due,
        };
        match (deadline, self.effective_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether a review or end date has passed without the policy being renewed.
    pub fn has_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status.is_enforceable() && self.lapse_at().map_or(false, |at| now >= at)
    }

    /// Whether the policy binds the subject at `now`.
    ///
    /// A superseded version keeps binding until its successor starts, which
    /// is where its effective end was closed.
    pub fn in_effect(&self, now: DateTime<Utc>) -> bool {
        let binding = match self.status {
            PolicyStatus::Active | PolicyStatus::UnderReview => true,
            PolicyStatus::Superseded => self.effective_end.map_or(false, |end| now < end),
            _ => false,
        };
        binding && now >= self.effective_start && self.lapse_at().map_or(true, |at| now < at)
    }

    /// Whether a successor has been committed but has not started yet.
    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        self.effective_start > now
            && !matches!(self.status, PolicyStatus::Expired | PolicyStatus::Revoked)
    }

    /// Floor for a steward successor's effective start.
    ///
    /// A revoked or expired version stopped binding when its status changed,
    /// so its floor is the earlier of that moment and its end.
    pub fn effective_floor(&self) -> DateTime<Utc> {
        let end = match self.status {
            PolicyStatus::Expired | PolicyStatus::Revoked => Some(
                self.effective_end
                    .map_or(self.status_changed_at, |end| end.min(self.status_changed_at)),
            ),
            _ => self.effective_end,
        };
        end.map_or(self.effective_start, |end| end.max(self.effective_start))
    }
}

/// Policy identity carried with every non-allow decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct PolicyRef {
    pub policy_id: PolicyId,
    pub version: u64,
}

/// Result of a capability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny { reason: String, policy: PolicyRef },
    Limited {
        params: LimitParams,
        reason: String,
        policy: PolicyRef,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Decision::Deny { .. })
    }

    pub fn policy(&self) -> Option<&PolicyRef> {
        match self {
            Decision::Allow => None,
            Decision::Deny { policy, .. } | Decision::Limited { policy, .. } => Some(policy),
        }
    }
}

/// Decide a capability against a single policy snapshot.
///
/// Shared by the live evaluator and the offline cache so both resolve rules
/// identically.
pub fn decide_against(
    policy: Option<&CapabilityPolicy>,
    capability: Capability,
    requested: &LimitParams,
    now: DateTime<Utc>,
) -> Decision {
    if capability.is_inalienable() {
        return Decision::Allow;
    }
    let Some(policy) = policy.filter(|p| p.in_effect(now)) else {
        return Decision::Allow;
    };
    match policy.rule_for(capability).map(|r| &r.effect) {
        None | Some(RuleEffect::Enabled) => Decision::Allow,
        Some(RuleEffect::Disabled) => Decision::Deny {
            reason: format!(
                "'{}' is disabled by a {} policy (version {}) until review on {}",
                capability,
                policy.authority_basis,
                policy.version,
                describe_deadline(policy.lapse_at()),
            ),
            policy: policy.reference(),
        },
        Some(RuleEffect::Limited(limit)) => Decision::Limited {
            params: limit.narrow(requested),
            reason: format!(
                "'{}' is limited by a {} policy (version {}) until review on {}",
                capability,
                policy.authority_basis,
                policy.version,
                describe_deadline(policy.lapse_at()),
            ),
            policy: policy.reference(),
        },
    }
}

fn describe_deadline(at: Option<DateTime<Utc>>) -> String {
    at.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "revocation".to_string())
}

// =============================================================================
// Reviews
// =============================================================================

/// Outcome of a scheduled re-review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Renewed,
    Tightened { rules: Vec<PolicyRule> },
    Loosened { rules: Vec<PolicyRule> },
    Expired,
    EscalatedToAppeal { grounds: String },
}

impl ReviewOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Renewed => "renewed",
            Self::Tightened { .. } => "tightened",
            Self::Loosened { .. } => "loosened",
            Self::Expired => "expired",
            Self::EscalatedToAppeal { .. } => "escalated_to_appeal",
        }
    }
}

/// Record of a completed review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ReviewRecord {
    pub policy_id: PolicyId,
    pub due: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub outcome: ReviewOutcome,
    pub evidence: Option<Evidence>,
    /// Successor policy for renewed/tightened/loosened
    pub successor: Option<PolicyId>,
    /// Appeal opened for escalated reviews
    pub appeal_id: Option<AppealId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn policy(rules: Vec<PolicyRule>, now: DateTime<Utc>) -> CapabilityPolicy {
        CapabilityPolicy {
            id: "policy-1".to_string(),
            subject_id: "subject".to_string(),
            steward_id: "steward".to_string(),
            version: 1,
            authority_basis: AuthorityBasis::MedicalNecessity,
            effective_start: now - Duration::days(1),
            review_due: Some(now + Duration::days(30)),
            effective_end: None,
            rules,
            evidence: Evidence::new(EvidenceTier::ProfessionalAttestation, "doc", now),
            supersedes: None,
            committed_at: now,
            committed_by: CommitAuthority::Steward,
            status: PolicyStatus::Active,
            status_changed_at: now,
            hold_until: None,
            layers: Vec::new(),
        }
    }

    #[test]
    fn test_most_specific_rule_wins() {
        let rules = vec![
            PolicyRule::enable(Capability::Post),
            PolicyRule::disable_category(CapabilityCategory::Content),
            PolicyRule {
                selector: Selector::All,
                effect: RuleEffect::Enabled,
            },
        ];
        let post = resolve_rule(&rules, Capability::Post).unwrap();
        assert_eq!(post.effect, RuleEffect::Enabled);
        let share = resolve_rule(&rules, Capability::Share).unwrap();
        assert_eq!(share.effect, RuleEffect::Disabled);
        let vote = resolve_rule(&rules, Capability::Vote).unwrap();
        assert_eq!(vote.effect, RuleEffect::Enabled);
    }

    #[test]
    fn test_later_rule_wins_tie() {
        let rules = vec![
            PolicyRule::disable(Capability::Transfer),
            PolicyRule::enable(Capability::Transfer),
        ];
        assert_eq!(
            resolve_rule(&rules, Capability::Transfer).unwrap().effect,
            RuleEffect::Enabled
        );
    }

    #[test]
    fn test_broad_selectors_never_reach_inalienable() {
        let all = Selector::All;
        assert!(!all.matches(Capability::FileAppeal));
        assert!(all.matches(Capability::Vote));
        assert!(Selector::Capability(Capability::FileAppeal).matches(Capability::FileAppeal));
    }

    #[test]
    fn test_check_inalienable_rejects_protected_rules() {
        let rules = vec![PolicyRule::disable(Capability::EmergencyContact)];
        assert!(matches!(
            check_inalienable(&rules),
            Err(StewardshipError::InalienableViolation(Capability::EmergencyContact))
        ));

        let rules = vec![PolicyRule::disable_category(CapabilityCategory::Safety)];
        assert!(check_inalienable(&rules).is_err());

        // Enabling a protected capability is harmless
        let rules = vec![PolicyRule::enable(Capability::FileAppeal)];
        assert!(check_inalienable(&rules).is_ok());
    }

    #[test]
    fn test_limit_narrowing() {
        let limit = LimitParams::new().with("daily_minutes", 60);
        let requested = LimitParams::new().with("daily_minutes", 90).with("sessions", 2);
        let narrowed = limit.narrow(&requested);
        assert_eq!(narrowed.get("daily_minutes"), Some(60));
        assert_eq!(narrowed.get("sessions"), Some(2));

        let narrowed = limit.narrow(&LimitParams::new().with("daily_minutes", 30));
        assert_eq!(narrowed.get("daily_minutes"), Some(30));
    }

    #[test]
    fn test_decide_against_lapsed_policy_allows() {
        let now = Utc::now();
        let mut p = policy(vec![PolicyRule::disable(Capability::Post)], now);
        assert!(decide_against(Some(&p), Capability::Post, &LimitParams::new(), now).is_deny());

        p.review_due = Some(now - Duration::hours(1));
        assert!(decide_against(Some(&p), Capability::Post, &LimitParams::new(), now).is_allow());
    }

    #[test]
    fn test_decide_against_carries_policy_reference() {
        let now = Utc::now();
        let p = policy(
            vec![PolicyRule::limit(
                Capability::SessionTime,
                LimitParams::new().with("daily_minutes", 45),
            )],
            now,
        );
        match decide_against(Some(&p), Capability::SessionTime, &LimitParams::new(), now) {
            Decision::Limited { params, policy, reason } => {
                assert_eq!(params.get("daily_minutes"), Some(45));
                assert_eq!(policy.version, 1);
                assert!(reason.contains("session_time"));
            }
            other => panic!("expected limited, got {:?}", other),
        }
    }
}
