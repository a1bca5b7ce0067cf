//! Proportionality review.
//!
//! An appeal in arbitration is handed to a `ProportionalityReviewer`, which
//! judges whether the restriction's severity matches its evidentiary and
//! relational justification. The reviewer is a seam: a rule engine, a human
//! queue or an external service can sit behind it. `RuleBasedReviewer` is the
//! deterministic reference implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::appeal::{Appeal, AppealKind, AppealOrigin};
use crate::config::ReviewerConfig;
use crate::error::StewardshipError;
use crate::registry::Capability;
use crate::types::{CapabilityPolicy, Subject};

/// Result of arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppealOutcome {
    /// Restriction stands unchanged
    Upheld,
    /// Restriction stands minus the reinstated capabilities
    Modified { reinstated: Vec<Capability> },
    /// Restriction is revoked
    Overturned,
}

impl AppealOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upheld => "upheld",
            Self::Modified { .. } => "modified",
            Self::Overturned => "overturned",
        }
    }
}

/// A reviewer's judgement with its reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruling {
    pub outcome: AppealOutcome,
    pub reasoning: String,
}

impl Ruling {
    pub fn new(outcome: AppealOutcome, reasoning: impl Into<String>) -> Self {
        Self {
            outcome,
            reasoning: reasoning.into(),
        }
    }
}

/// What the reviewer gets to look at besides the appeal itself.
#[derive(Debug, Clone, Default)]
pub struct ReviewEvidence {
    /// Policy under appeal as currently stored
    pub policy: Option<CapabilityPolicy>,
    pub subject: Option<Subject>,
}

/// Pluggable proportionality judgement.
#[async_trait]
pub trait ProportionalityReviewer: Send + Sync {
    /// Identity recorded on decisions; only this reviewer may decide.
    fn id(&self) -> &str;

    /// Judge an appeal. `Ok(None)` means the ruling is not ready yet.
    async fn review(
        &self,
        appeal: &Appeal,
        evidence: &ReviewEvidence,
    ) -> Result<Option<Ruling>, StewardshipError>;
}

/// Deterministic reviewer applying fixed proportionality rules.
pub struct RuleBasedReviewer {
    id: String,
    config: ReviewerConfig,
}

impl RuleBasedReviewer {
    pub fn new(id: impl Into<String>, config: ReviewerConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }

    fn judge(&self, appeal: &Appeal, evidence: &ReviewEvidence) -> Ruling {
        if let AppealOrigin::ConsensusTrigger { supporters, .. } = &appeal.origin {
            let contested = appeal.rebuttal.as_ref().map_or(false, |r| r.is_substantive());
            if contested && *supporters < self.config.min_consensus_supporters {
                return Ruling::new(
                    AppealOutcome::Overturned,
                    format!(
                        "contested concern from {} supporters is below the {} required",
                        supporters, self.config.min_consensus_supporters
                    ),
                );
            }
            return Ruling::new(
                AppealOutcome::Upheld,
                format!("concern from {} supporters warrants a stewardship case", supporters),
            );
        }

        let Some(policy) = evidence.policy.as_ref() else {
            return Ruling::new(
                AppealOutcome::Overturned,
                "no policy on record supports the restriction",
            );
        };

        let required = policy.authority_basis.rules().minimum_evidence;
        if !policy.evidence.tier.satisfies(required) {
            return Ruling::new(
                AppealOutcome::Overturned,
                format!(
                    "{} requires {} evidence but the policy rests on {}",
                    policy.authority_basis, required, policy.evidence.tier
                ),
            );
        }

        let restricted = policy.restricted_capabilities();
        match appeal.kind {
            AppealKind::CapabilityRequest => {
                let reinstated: Vec<Capability> = appeal
                    .requested_capabilities
                    .iter()
                    .copied()
                    .filter(|c| restricted.contains(c))
                    .collect();
                if reinstated.is_empty() {
                    Ruling::new(
                        AppealOutcome::Upheld,
                        "none of the requested capabilities are restricted",
                    )
                } else {
                    Ruling::new(
                        AppealOutcome::Modified {
                            reinstated: reinstated.clone(),
                        },
                        format!("reinstating {} requested capabilities", reinstated.len()),
                    )
                }
            }
            AppealKind::InvalidEvidence => {
                if appeal
                    .evidence
                    .as_ref()
                    .map_or(false, |e| e.tier > policy.evidence.tier)
                {
                    Ruling::new(
                        AppealOutcome::Overturned,
                        format!(
                            "appellant's {} evidence outweighs the policy's {}",
                            appeal.evidence.as_ref().map(|e| e.tier).unwrap_or(policy.evidence.tier),
                            policy.evidence.tier
                        ),
                    )
                } else {
                    Ruling::new(AppealOutcome::Upheld, "policy evidence meets its basis")
                }
            }
            AppealKind::Scope | AppealKind::Excessive => {
                if restricted.len() > self.config.max_restrictions {
                    let reinstated = restricted[self.config.max_restrictions..].to_vec();
                    Ruling::new(
                        AppealOutcome::Modified { reinstated },
                        format!(
                            "{} restrictions exceed the proportionate maximum of {}",
                            restricted.len(),
                            self.config.max_restrictions
                        ),
                    )
                } else {
                    Ruling::new(
                        AppealOutcome::Upheld,
                        format!("{} restrictions are proportionate", restricted.len()),
                    )
                }
            }
        }
    }
}

#[async_trait]
impl ProportionalityReviewer for RuleBasedReviewer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn review(
        &self,
        appeal: &Appeal,
        evidence: &ReviewEvidence,
    ) -> Result<Option<Ruling>, StewardshipError> {
        let ruling = self.judge(appeal, evidence);
        debug!(
            appeal = %appeal.id,
            outcome = ruling.outcome.as_str(),
            reasoning = %ruling.reasoning,
            "Rule-based review"
        );
        Ok(Some(ruling))
    }
}
