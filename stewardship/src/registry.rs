//! Closed registry of stewardship vocabulary.
//!
//! Authority bases, evidence tiers, steward tiers and capabilities are defined
//! once here and consumed by the policy store, the evaluator and the review
//! scheduler. Nothing else in the crate keeps its own list of valid values.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "typescript")]
use ts_rs::TS;

use crate::error::StewardshipError;

/// Age at which minor guardianship ends.
pub const AGE_OF_MAJORITY: u32 = 18;

/// Maximum number of delegation hops below a root grant.
pub const MAX_DELEGATION_DEPTH: u32 = 3;

/// Capabilities that no policy may disable or limit.
pub const INALIENABLE_CAPABILITIES: [Capability; 8] = [
    Capability::ContactRelationships,
    Capability::EmergencyContact,
    Capability::ViewRestrictions,
    Capability::FileAppeal,
    Capability::ReachAdvocate,
    Capability::ViewTimeRemaining,
    Capability::RequestDisconnection,
    Capability::RequestErasure,
];

// =============================================================================
// Evidence
// =============================================================================

/// Strength of evidence backing an authority basis.
///
/// Ordered from weakest to strongest; a requirement is met by any tier at or
/// above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum EvidenceTier {
    None = 0,
    SelfAssertion = 1,
    ProfessionalAttestation = 2,
    DocumentedPattern = 3,
    JudicialOrder = 4,
}

impl EvidenceTier {
    pub fn satisfies(&self, required: EvidenceTier) -> bool {
        *self >= required
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SelfAssertion => "self_assertion",
            Self::ProfessionalAttestation => "professional_attestation",
            Self::DocumentedPattern => "documented_pattern",
            Self::JudicialOrder => "judicial_order",
        }
    }
}

impl fmt::Display for EvidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Authority basis
// =============================================================================

/// Who may end a restriction outside of review or appeal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationInitiator {
    /// The subject may revoke on demand
    Subject,
    /// Only the steward or an oversight board may revoke
    StewardOrBoard,
}

/// How long a basis holds before it must be re-justified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "days")]
pub enum ReviewPeriod {
    /// Fixed number of days from the effective start
    Days(u32),
    /// No fixed period; ends when revoked
    OnDemand,
    /// Supplied explicitly by the order that established the basis
    PerOrder,
}

/// Condition under which a basis no longer applies at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCondition {
    /// Subject reaches the given age
    AgeOfMajority(u32),
    /// No intrinsic exit; review and appeal govern the end
    None,
}

/// Legal or relational justification for holding authority over a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum AuthorityBasis {
    MinorGuardianship,
    OrganizationalRole,
    MedicalNecessity,
    MutualConsent,
    CommunityConsensus,
    CourtOrder,
}

/// Fixed rules attached to an authority basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasisRules {
    pub default_review: ReviewPeriod,
    pub delegation_permitted: bool,
    pub minimum_evidence: EvidenceTier,
    pub revoked_by: RevocationInitiator,
    pub exit: ExitCondition,
}

impl AuthorityBasis {
    pub fn all() -> [AuthorityBasis; 6] {
        [
            Self::MinorGuardianship,
            Self::OrganizationalRole,
            Self::MedicalNecessity,
            Self::MutualConsent,
            Self::CommunityConsensus,
            Self::CourtOrder,
        ]
    }

    pub fn rules(&self) -> BasisRules {
        match self {
            Self::MinorGuardianship => BasisRules {
                default_review: ReviewPeriod::Days(365),
                delegation_permitted: true,
                minimum_evidence: EvidenceTier::ProfessionalAttestation,
                revoked_by: RevocationInitiator::StewardOrBoard,
                exit: ExitCondition::AgeOfMajority(AGE_OF_MAJORITY),
            },
            Self::OrganizationalRole => BasisRules {
                default_review: ReviewPeriod::Days(365),
                delegation_permitted: true,
                minimum_evidence: EvidenceTier::SelfAssertion,
                revoked_by: RevocationInitiator::StewardOrBoard,
                exit: ExitCondition::None,
            },
            Self::MedicalNecessity => BasisRules {
                default_review: ReviewPeriod::Days(90),
                delegation_permitted: true,
                minimum_evidence: EvidenceTier::ProfessionalAttestation,
                revoked_by: RevocationInitiator::StewardOrBoard,
                exit: ExitCondition::None,
            },
            Self::MutualConsent => BasisRules {
                default_review: ReviewPeriod::OnDemand,
                delegation_permitted: false,
                minimum_evidence: EvidenceTier::SelfAssertion,
                revoked_by: RevocationInitiator::Subject,
                exit: ExitCondition::None,
            },
            Self::CommunityConsensus => BasisRules {
                default_review: ReviewPeriod::Days(30),
                delegation_permitted: false,
                minimum_evidence: EvidenceTier::DocumentedPattern,
                revoked_by: RevocationInitiator::StewardOrBoard,
                exit: ExitCondition::None,
            },
            Self::CourtOrder => BasisRules {
                default_review: ReviewPeriod::PerOrder,
                delegation_permitted: true,
                minimum_evidence: EvidenceTier::JudicialOrder,
                revoked_by: RevocationInitiator::StewardOrBoard,
                exit: ExitCondition::None,
            },
        }
    }

    /// Whether the basis's exit condition has been crossed for a subject.
    ///
    /// `None` means the condition cannot be evaluated (e.g. no birth date on
    /// record for a minor guardianship).
    pub fn exit_reached(&self, date_of_birth: Option<NaiveDate>, now: DateTime<Utc>) -> Option<bool> {
        match self.rules().exit {
            ExitCondition::None => Some(false),
            ExitCondition::AgeOfMajority(age) => {
                date_of_birth.map(|dob| age_in_years(dob, now.date_naive()) >= age)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinorGuardianship => "minor_guardianship",
            Self::OrganizationalRole => "organizational_role",
            Self::MedicalNecessity => "medical_necessity",
            Self::MutualConsent => "mutual_consent",
            Self::CommunityConsensus => "community_consensus",
            Self::CourtOrder => "court_order",
        }
    }
}

impl fmt::Display for AuthorityBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthorityBasis {
    type Err = StewardshipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| StewardshipError::InvalidDraft(format!("unknown authority basis '{}'", s)))
    }
}

fn age_in_years(dob: NaiveDate, today: NaiveDate) -> u32 {
    let mut years = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

// =============================================================================
// Steward tiers
// =============================================================================

/// Graduated steward tiers. Power scales with demonstrated responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum StewardTier {
    /// Manage own settings only
    SelfOnly = 0,
    /// Advisory; may not commit restrictions
    Guide = 1,
    /// Manage settings for verified dependents
    Guardian = 2,
    /// Manage settings across an organization or community
    Coordinator = 3,
    /// Constitutional oversight
    Constitutional = 4,
}

impl StewardTier {
    /// Whether this tier may commit restrictions on another agent.
    pub fn can_restrict(&self) -> bool {
        *self >= StewardTier::Guardian
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Grouping used by category-wide policy rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    Safety,
    Content,
    Social,
    Economic,
    Governance,
    Profile,
    Usage,
}

/// A discrete, named feature whose access can be granted, restricted or limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    // Inalienable
    ContactRelationships,
    EmergencyContact,
    ViewRestrictions,
    FileAppeal,
    ReachAdvocate,
    ViewTimeRemaining,
    RequestDisconnection,
    RequestErasure,
    // Restrictable
    Post,
    Share,
    Comment,
    Download,
    ContentAccess,
    ExternalLinks,
    DirectMessage,
    GroupCreate,
    Transfer,
    Vote,
    ProfileEdit,
    SessionTime,
}

impl Capability {
    pub fn all() -> [Capability; 20] {
        [
            Self::ContactRelationships,
            Self::EmergencyContact,
            Self::ViewRestrictions,
            Self::FileAppeal,
            Self::ReachAdvocate,
            Self::ViewTimeRemaining,
            Self::RequestDisconnection,
            Self::RequestErasure,
            Self::Post,
            Self::Share,
            Self::Comment,
            Self::Download,
            Self::ContentAccess,
            Self::ExternalLinks,
            Self::DirectMessage,
            Self::GroupCreate,
            Self::Transfer,
            Self::Vote,
            Self::ProfileEdit,
            Self::SessionTime,
        ]
    }

    pub fn is_inalienable(&self) -> bool {
        INALIENABLE_CAPABILITIES.contains(self)
    }

    pub fn category(&self) -> CapabilityCategory {
        match self {
            Self::ContactRelationships
            | Self::EmergencyContact
            | Self::ViewRestrictions
            | Self::FileAppeal
            | Self::ReachAdvocate
            | Self::ViewTimeRemaining
            | Self::RequestDisconnection
            | Self::RequestErasure => CapabilityCategory::Safety,
            Self::Post
            | Self::Share
            | Self::Comment
            | Self::Download
            | Self::ContentAccess
            | Self::ExternalLinks => CapabilityCategory::Content,
            Self::DirectMessage | Self::GroupCreate => CapabilityCategory::Social,
            Self::Transfer => CapabilityCategory::Economic,
            Self::Vote => CapabilityCategory::Governance,
            Self::ProfileEdit => CapabilityCategory::Profile,
            Self::SessionTime => CapabilityCategory::Usage,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContactRelationships => "contact_relationships",
            Self::EmergencyContact => "emergency_contact",
            Self::ViewRestrictions => "view_restrictions",
            Self::FileAppeal => "file_appeal",
            Self::ReachAdvocate => "reach_advocate",
            Self::ViewTimeRemaining => "view_time_remaining",
            Self::RequestDisconnection => "request_disconnection",
            Self::RequestErasure => "request_erasure",
            Self::Post => "post",
            Self::Share => "share",
            Self::Comment => "comment",
            Self::Download => "download",
            Self::ContentAccess => "content_access",
            Self::ExternalLinks => "external_links",
            Self::DirectMessage => "direct_message",
            Self::GroupCreate => "group_create",
            Self::Transfer => "transfer",
            Self::Vote => "vote",
            Self::ProfileEdit => "profile_edit",
            Self::SessionTime => "session_time",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = StewardshipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| StewardshipError::UnknownCapability(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_inalienable_set_is_safety_category() {
        for cap in INALIENABLE_CAPABILITIES {
            assert_eq!(cap.category(), CapabilityCategory::Safety);
            assert!(cap.is_inalienable());
        }
        assert!(!Capability::Post.is_inalienable());
    }

    #[test]
    fn test_every_capability_parses_from_its_name() {
        for cap in Capability::all() {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!(matches!(
            "teleport".parse::<Capability>(),
            Err(StewardshipError::UnknownCapability(_))
        ));
    }

    #[test]
    fn test_basis_rules() {
        assert_eq!(
            AuthorityBasis::CommunityConsensus.rules().default_review,
            ReviewPeriod::Days(30)
        );
        assert_eq!(
            AuthorityBasis::MedicalNecessity.rules().default_review,
            ReviewPeriod::Days(90)
        );
        assert_eq!(
            AuthorityBasis::MutualConsent.rules().revoked_by,
            RevocationInitiator::Subject
        );
        assert!(!AuthorityBasis::CommunityConsensus.rules().delegation_permitted);
        assert_eq!(
            AuthorityBasis::CourtOrder.rules().minimum_evidence,
            EvidenceTier::JudicialOrder
        );
    }

    #[test]
    fn test_evidence_tier_ordering() {
        assert!(EvidenceTier::JudicialOrder.satisfies(EvidenceTier::DocumentedPattern));
        assert!(!EvidenceTier::SelfAssertion.satisfies(EvidenceTier::ProfessionalAttestation));
        assert!(EvidenceTier::None.satisfies(EvidenceTier::None));
    }

    #[test]
    fn test_minor_exit_condition() {
        let dob = NaiveDate::from_ymd_opt(2008, 6, 15).unwrap();
        let before = Utc.with_ymd_and_hms(2026, 6, 14, 12, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap();

        let basis = AuthorityBasis::MinorGuardianship;
        assert_eq!(basis.exit_reached(Some(dob), before), Some(false));
        assert_eq!(basis.exit_reached(Some(dob), after), Some(true));
        assert_eq!(basis.exit_reached(None, after), None);
        assert_eq!(AuthorityBasis::MedicalNecessity.exit_reached(None, after), Some(false));
    }
}
