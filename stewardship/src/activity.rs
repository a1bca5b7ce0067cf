//! Monitored subject activity.
//!
//! A device reports what a subject did; only the parts the binding policy's
//! monitoring rules ask for are kept, and each entry carries the retention
//! deadline in force when it was written. Stewards with a live grant over
//! the subject can read the log. The subject can too, unless a monitoring
//! layer has turned that off.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, info};

use crate::error::{Result, StewardshipError};
use crate::restrictions::{ComputedRestrictions, MonitoringRules};
use crate::store::PolicyStore;
use crate::types::AgentId;

const ACTIVITY_TREE: &str = "activity";

/// Retention used when monitoring is on but no layer sets one.
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// What a device observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityReport {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub session_minutes: Option<u32>,
    /// Category -> number of items opened
    pub categories_accessed: BTreeMap<String, u32>,
    pub policy_events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub seq: u64,
    pub subject_id: AgentId,
    pub recorded_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub session_minutes: Option<u32>,
    pub categories_accessed: BTreeMap<String, u32>,
    pub policy_events: Vec<String>,
    pub retention_expires_at: DateTime<Utc>,
}

impl ActivityEntry {
    fn from_report(
        seq: u64,
        subject_id: &str,
        report: ActivityReport,
        monitoring: &MonitoringRules,
        now: DateTime<Utc>,
    ) -> Self {
        let retention_days = match monitoring.retention_days {
            0 => DEFAULT_RETENTION_DAYS,
            days => days,
        };
        Self {
            seq,
            subject_id: subject_id.to_string(),
            recorded_at: now,
            session_id: report.session_id,
            device_id: report.device_id,
            session_minutes: report.session_minutes.filter(|_| monitoring.log_sessions),
            categories_accessed: if monitoring.log_categories {
                report.categories_accessed
            } else {
                BTreeMap::new()
            },
            policy_events: if monitoring.log_policy_events {
                report.policy_events
            } else {
                Vec::new()
            },
            retention_expires_at: now + Duration::days(i64::from(retention_days)),
        }
    }

    pub fn is_retained(&self, now: DateTime<Utc>) -> bool {
        now < self.retention_expires_at
    }
}

/// Durable activity log, keyed by subject then sequence.
pub struct ActivityLog {
    db: Db,
    tree: Tree,
    store: Arc<PolicyStore>,
}

impl ActivityLog {
    pub fn open(store: Arc<PolicyStore>) -> Result<Self> {
        let db = store.db().clone();
        let tree = db.open_tree(ACTIVITY_TREE)?;
        Ok(Self { db, tree, store })
    }

    fn prefix(subject_id: &str) -> Vec<u8> {
        let mut key = subject_id.as_bytes().to_vec();
        key.push(0);
        key
    }

    fn monitoring(&self, subject_id: &str, now: DateTime<Utc>) -> Result<MonitoringRules> {
        let binding = self.store.binding_policy(subject_id, now)?;
        Ok(ComputedRestrictions::for_policy(binding.as_ref(), now).monitoring)
    }

    /// Record a report under the subject's current monitoring rules.
    ///
    /// Fails with `MonitoringDisabled` when no binding layer asks for any
    /// logging.
    pub fn record(&self, subject_id: &str, report: ActivityReport) -> Result<ActivityEntry> {
        let now = self.store.clock().now();
        let monitoring = self.monitoring(subject_id, now)?;
        if !monitoring.is_enabled() {
            return Err(StewardshipError::MonitoringDisabled(subject_id.to_string()));
        }

        let seq = self.db.generate_id()?;
        let entry = ActivityEntry::from_report(seq, subject_id, report, &monitoring, now);
        let mut key = Self::prefix(subject_id);
        key.extend_from_slice(&seq.to_be_bytes());
        self.tree.insert(key, rmp_serde::to_vec_named(&entry)?)?;

        debug!(subject = %subject_id, seq, expires = %entry.retention_expires_at, "Activity recorded");
        Ok(entry)
    }

    /// Retained entries for a subject, oldest first, as seen by `viewer_id`.
    pub fn activity_for(&self, subject_id: &str, viewer_id: &str) -> Result<Vec<ActivityEntry>> {
        let now = self.store.clock().now();
        if viewer_id == subject_id {
            if !self.monitoring(subject_id, now)?.subject_can_view {
                return Err(StewardshipError::UnauthorizedSteward {
                    steward: viewer_id.to_string(),
                    reason: "the monitoring policy does not let the subject view this log"
                        .to_string(),
                });
            }
        } else {
            let stewarded = self
                .store
                .grants_for_subject(subject_id)?
                .iter()
                .any(|g| g.steward_id == viewer_id && g.is_live(now));
            if !stewarded {
                return Err(StewardshipError::UnauthorizedSteward {
                    steward: viewer_id.to_string(),
                    reason: format!("no live grant over {}", subject_id),
                });
            }
        }

        let mut out = Vec::new();
        for item in self.tree.scan_prefix(Self::prefix(subject_id)) {
            let (_, value) = item?;
            let entry: ActivityEntry = rmp_serde::from_slice(&value)?;
            if entry.is_retained(now) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Delete entries past their retention deadline.
    pub fn prune_expired(&self) -> Result<usize> {
        let now = self.store.clock().now();
        let mut removed = 0;
        for item in self.tree.iter() {
            let (key, value) = item?;
            let entry: ActivityEntry = rmp_serde::from_slice(&value)?;
            if !entry.is_retained(now) {
                self.tree.remove(key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Pruned expired activity");
        }
        Ok(removed)
    }

    /// Delete everything recorded for a subject.
    pub fn purge_subject(&self, subject_id: &str) -> Result<usize> {
        let mut removed = 0;
        for item in self.tree.scan_prefix(Self::prefix(subject_id)) {
            let (key, _) = item?;
            self.tree.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }
}
