//! Error types for the stewardship engine.

use thiserror::Error;

use crate::registry::{Capability, EvidenceTier};

/// Errors raised by stewardship operations.
///
/// Validation errors from `PolicyStore::commit` are returned before anything
/// is written; a rejected draft never leaves partial state behind.
#[derive(Error, Debug)]
pub enum StewardshipError {
    #[error("Evidence insufficient: {basis} requires {required}, got {provided}")]
    EvidenceInsufficient {
        basis: String,
        required: EvidenceTier,
        provided: EvidenceTier,
    },

    #[error("Inalienable capability '{0}' cannot be disabled or limited")]
    InalienableViolation(Capability),

    #[error("Version conflict for subject {subject}: expected {expected}, current {actual}")]
    VersionConflict {
        subject: String,
        expected: u64,
        actual: u64,
    },

    #[error("Unauthorized steward {steward}: {reason}")]
    UnauthorizedSteward { steward: String, reason: String },

    #[error("Relationship data unavailable: {0}")]
    TriggerDataUnavailable(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Authority lapsed: {0}")]
    AuthorityLapsed(String),

    #[error("Retroactive restriction: {0}")]
    RetroactiveRestriction(String),

    #[error("Invalid draft: {0}")]
    InvalidDraft(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync failed: {0}")]
    SyncFailed(String),

    #[error("Monitoring disabled for subject {0}")]
    MonitoringDisabled(String),

    #[error("Database error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl StewardshipError {
    /// Stable machine-readable kind for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EvidenceInsufficient { .. } => "evidence_insufficient",
            Self::InalienableViolation(_) => "inalienable_violation",
            Self::VersionConflict { .. } => "version_conflict",
            Self::UnauthorizedSteward { .. } => "unauthorized_steward",
            Self::TriggerDataUnavailable(_) => "trigger_data_unavailable",
            Self::UnknownCapability(_) => "unknown_capability",
            Self::AuthorityLapsed(_) => "authority_lapsed",
            Self::RetroactiveRestriction(_) => "retroactive_restriction",
            Self::InvalidDraft(_) => "invalid_draft",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::SyncFailed(_) => "sync_failed",
            Self::MonitoringDisabled(_) => "monitoring_disabled",
            Self::Storage(_) => "storage",
            Self::Encoding(_) => "encoding",
        }
    }

    /// Whether the caller sent something invalid (as opposed to a server fault).
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::Storage(_) | Self::Encoding(_) | Self::SyncFailed(_) | Self::TriggerDataUnavailable(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for StewardshipError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StewardshipError::Encoding(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StewardshipError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StewardshipError::Encoding(e.to_string())
    }
}

impl From<sled::transaction::TransactionError<StewardshipError>> for StewardshipError {
    fn from(e: sled::transaction::TransactionError<StewardshipError>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => StewardshipError::Storage(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, StewardshipError>;
