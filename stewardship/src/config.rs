//! Deployment configuration for the stewardship engine.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::registry::{AuthorityBasis, ReviewPeriod};

/// Top-level engine configuration.
///
/// Every field has a default so a partial TOML file only overrides what it
/// names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardshipConfig {
    pub trigger: TriggerConfig,
    pub review: ReviewConfig,
    pub appeal: AppealConfig,
    pub cache: CacheConfig,
    pub reviewer: ReviewerConfig,
    pub sweep: SweepConfig,
}

/// Consensus trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Weighted support required to open a case
    pub threshold: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { threshold: 10.0 }
    }
}

/// Review periods per authority basis, in days.
///
/// Mutual consent has no fixed period and court orders carry their own, so
/// neither is configurable here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub minor_guardianship_days: u32,
    pub organizational_role_days: u32,
    pub medical_necessity_days: u32,
    pub community_consensus_days: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            minor_guardianship_days: 365,
            organizational_role_days: 365,
            medical_necessity_days: 90,
            community_consensus_days: 30,
        }
    }
}

impl ReviewConfig {
    pub fn period(&self, basis: AuthorityBasis) -> ReviewPeriod {
        match basis {
            AuthorityBasis::MinorGuardianship => ReviewPeriod::Days(self.minor_guardianship_days),
            AuthorityBasis::OrganizationalRole => ReviewPeriod::Days(self.organizational_role_days),
            AuthorityBasis::MedicalNecessity => ReviewPeriod::Days(self.medical_necessity_days),
            AuthorityBasis::CommunityConsensus => ReviewPeriod::Days(self.community_consensus_days),
            AuthorityBasis::MutualConsent | AuthorityBasis::CourtOrder => {
                basis.rules().default_review
            }
        }
    }
}

/// Appeal workflow windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppealConfig {
    /// Time the respondent has to submit a rebuttal
    pub response_window_days: u32,
    /// Time the appellant has to re-appeal after a decision
    pub appeal_window_days: u32,
    /// How long an escalated policy stays enforced awaiting a decision
    pub decision_deadline_days: u32,
}

impl Default for AppealConfig {
    fn default() -> Self {
        Self {
            response_window_days: 7,
            appeal_window_days: 7,
            decision_deadline_days: 30,
        }
    }
}

impl AppealConfig {
    pub fn response_window(&self) -> Duration {
        Duration::days(self.response_window_days as i64)
    }

    pub fn appeal_window(&self) -> Duration {
        Duration::days(self.appeal_window_days as i64)
    }

    pub fn decision_deadline(&self) -> Duration {
        Duration::days(self.decision_deadline_days as i64)
    }
}

/// Offline cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Snapshot age after which local decisions carry a stale warning
    pub stale_after_secs: u64,
    /// Sync attempts before giving up until the next round
    pub sync_max_attempts: u32,
    /// First retry delay; doubles on each failure
    pub sync_initial_backoff_ms: u64,
    /// Upper bound for the retry delay
    pub sync_max_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 24 * 3600,
            sync_max_attempts: 5,
            sync_initial_backoff_ms: 500,
            sync_max_backoff_ms: 30_000,
        }
    }
}

/// Rule-based proportionality reviewer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewerConfig {
    /// Restrictions beyond this count are considered disproportionate
    pub max_restrictions: usize,
    /// Distinct supporters needed to uphold a contested consensus case
    pub min_consensus_supporters: usize,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            max_restrictions: 6,
            min_consensus_supporters: 3,
        }
    }
}

/// Background sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}
