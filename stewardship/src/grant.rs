//! Steward grants and delegation.
//!
//! A grant records that a steward holds authority over a subject on a given
//! basis, within a scope and at a tier. Grants may be delegated down a chain
//! of at most `MAX_DELEGATION_DEPTH` links; each link can only narrow the
//! scope and tier of its parent.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "typescript")]
use ts_rs::TS;

use crate::error::{Result, StewardshipError};
use crate::registry::{
    AuthorityBasis, Capability, CapabilityCategory, StewardTier, MAX_DELEGATION_DEPTH,
};
use crate::types::{AgentId, Evidence, GrantId, Selector};

/// Which capabilities a grant lets its steward restrict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GrantScope {
    All,
    Categories(BTreeSet<CapabilityCategory>),
    Capabilities(BTreeSet<Capability>),
}

impl GrantScope {
    pub fn covers_capability(&self, capability: Capability) -> bool {
        match self {
            GrantScope::All => true,
            GrantScope::Categories(categories) => categories.contains(&capability.category()),
            GrantScope::Capabilities(capabilities) => capabilities.contains(&capability),
        }
    }

    /// Whether every capability a rule selector reaches lies inside this scope.
    pub fn covers(&self, selector: &Selector) -> bool {
        match selector {
            Selector::All => matches!(self, GrantScope::All),
            Selector::Category(category) => match self {
                GrantScope::All => true,
                GrantScope::Categories(categories) => categories.contains(category),
                GrantScope::Capabilities(_) => restrictable_in(*category)
                    .into_iter()
                    .all(|c| self.covers_capability(c)),
            },
            Selector::Capability(capability) => self.covers_capability(*capability),
        }
    }

    pub fn is_subset_of(&self, parent: &GrantScope) -> bool {
        match (self, parent) {
            (_, GrantScope::All) => true,
            (GrantScope::All, _) => false,
            (GrantScope::Categories(mine), GrantScope::Categories(theirs)) => {
                mine.is_subset(theirs)
            }
            (GrantScope::Categories(mine), GrantScope::Capabilities(_)) => mine
                .iter()
                .all(|category| parent.covers(&Selector::Category(*category))),
            (GrantScope::Capabilities(mine), _) => {
                mine.iter().all(|c| parent.covers_capability(*c))
            }
        }
    }
}

fn restrictable_in(category: CapabilityCategory) -> Vec<Capability> {
    Capability::all()
        .into_iter()
        .filter(|c| !c.is_inalienable() && c.category() == category)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Suspended,
    Expired,
    Revoked,
}

/// Authority held by one steward over one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct StewardshipGrant {
    pub id: GrantId,
    pub steward_id: AgentId,
    pub subject_id: AgentId,
    pub basis: AuthorityBasis,
    pub evidence: Evidence,
    pub scope: GrantScope,
    pub tier: StewardTier,
    pub delegatable: bool,
    /// Parent grant for delegated authority
    pub delegated_from: Option<GrantId>,
    /// 0 for a root grant
    pub depth: u32,
    pub status: GrantStatus,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StewardshipGrant {
    /// Active and not past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == GrantStatus::Active && self.expires_at.map_or(true, |at| now < at)
    }
}

/// Request for a root grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct GrantRequest {
    pub steward_id: AgentId,
    pub subject_id: AgentId,
    pub basis: AuthorityBasis,
    pub evidence: Evidence,
    pub scope: GrantScope,
    pub tier: StewardTier,
    #[serde(default)]
    pub delegatable: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request to pass part of a grant on to another steward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct DelegationRequest {
    pub steward_id: AgentId,
    pub scope: GrantScope,
    pub tier: StewardTier,
    #[serde(default)]
    pub delegatable: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Check a root grant request against the basis rules.
pub fn validate_grant(request: &GrantRequest) -> Result<()> {
    if request.steward_id == request.subject_id {
        return Err(StewardshipError::UnauthorizedSteward {
            steward: request.steward_id.clone(),
            reason: "a steward cannot steward themself".to_string(),
        });
    }
    if request.tier == StewardTier::SelfOnly {
        return Err(StewardshipError::InvalidDraft(
            "a self-only tier cannot hold authority over another agent".to_string(),
        ));
    }
    let required = request.basis.rules().minimum_evidence;
    if !request.evidence.tier.satisfies(required) {
        return Err(StewardshipError::EvidenceInsufficient {
            basis: request.basis.to_string(),
            required,
            provided: request.evidence.tier,
        });
    }
    if request.delegatable && !request.basis.rules().delegation_permitted {
        return Err(StewardshipError::InvalidDraft(format!(
            "{} authority cannot be delegated",
            request.basis
        )));
    }
    Ok(())
}

/// Check a delegation against its parent grant.
pub fn validate_delegation(
    parent: &StewardshipGrant,
    request: &DelegationRequest,
    now: DateTime<Utc>,
) -> Result<()> {
    let refuse = |reason: String| StewardshipError::UnauthorizedSteward {
        steward: parent.steward_id.clone(),
        reason,
    };

    if !parent.is_live(now) {
        return Err(refuse(format!("grant {} is not active", parent.id)));
    }
    if !parent.basis.rules().delegation_permitted {
        return Err(refuse(format!("{} authority cannot be delegated", parent.basis)));
    }
    if !parent.delegatable {
        return Err(refuse(format!("grant {} is not delegatable", parent.id)));
    }
    if parent.depth + 1 > MAX_DELEGATION_DEPTH {
        return Err(refuse(format!(
            "delegation depth would exceed {}",
            MAX_DELEGATION_DEPTH
        )));
    }
    if request.steward_id == parent.subject_id {
        return Err(refuse("a steward cannot steward themself".to_string()));
    }
    if !request.scope.is_subset_of(&parent.scope) {
        return Err(refuse("delegated scope exceeds the parent grant".to_string()));
    }
    if request.tier > parent.tier {
        return Err(refuse("delegated tier exceeds the parent grant".to_string()));
    }
    if let (Some(parent_end), child_end) = (parent.expires_at, request.expires_at) {
        if child_end.map_or(true, |end| end > parent_end) {
            return Err(refuse("delegation outlives the parent grant".to_string()));
        }
    }
    Ok(())
}
