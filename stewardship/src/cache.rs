//! Offline enforcement cache.
//!
//! Devices keep the latest policy per tracked subject so capability checks
//! keep working without a connection to the store. Sync pulls deltas through a
//! `PolicySource`; enforcement only ever reads the local snapshot and never
//! waits on a sync in progress.
//!
//! Conflicts resolve by version: the highest committed version wins and an
//! older version arriving late is ignored. The same version arriving again can
//! only carry a newer lifecycle status, since rules are immutable once
//! committed. The version a newer one replaced is kept alongside it, so a
//! successor committed to start later does not take over early offline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{Result, StewardshipError};
use crate::registry::Capability;
use crate::restrictions::{decide_content, decide_session, ContentCheck, SessionUsage};
use crate::store::PolicyStore;
use crate::types::{decide_against, AgentId, CapabilityPolicy, Decision, LimitParams, PolicyStatus};

/// Where the cache pulls policy changes from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Policies newer than `since_version`, plus the policy at `since_version`
    /// when its lifecycle status may have moved on.
    async fn fetch(&self, subject_id: &str, since_version: u64) -> Result<Vec<CapabilityPolicy>>;
}

#[async_trait]
impl PolicySource for PolicyStore {
    async fn fetch(&self, subject_id: &str, since_version: u64) -> Result<Vec<CapabilityPolicy>> {
        let mut policies = self.delta(subject_id, since_version)?;
        if policies.is_empty() && since_version > 0 {
            // Nothing newer; send the head back so status changes propagate
            if let Some(head) = self.current(subject_id)? {
                policies.push(head);
            }
        }
        Ok(policies)
    }
}

/// Locally held view of one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub subject_id: AgentId,
    pub policy: Option<CapabilityPolicy>,
    /// Version `policy` superseded, held while `policy` has not started
    #[serde(default)]
    pub previous: Option<CapabilityPolicy>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    fn empty(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            policy: None,
            previous: None,
            synced_at: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.policy.as_ref().map_or(0, |p| p.version)
    }

    /// The held version that binds at `now`.
    pub fn binding(&self, now: DateTime<Utc>) -> Option<&CapabilityPolicy> {
        match (&self.policy, &self.previous) {
            (Some(policy), Some(previous)) if policy.is_pending(now) => Some(previous),
            (policy, _) => policy.as_ref(),
        }
    }
}

/// Warning attached to decisions served from an old snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleCache {
    pub last_synced: Option<DateTime<Utc>>,
    pub threshold_secs: u64,
}

/// A decision made from the local snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDecision {
    pub decision: Decision,
    pub stale: Option<StaleCache>,
}

/// Outcome of one sync round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub subjects: usize,
    pub applied: usize,
    pub failed: Vec<AgentId>,
}

pub struct OfflineEnforcementCache {
    snapshots: DashMap<AgentId, Snapshot>,
    tree: Tree,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl OfflineEnforcementCache {
    /// Open the cache, restoring persisted snapshots.
    pub fn open(db: &Db, clock: Arc<dyn Clock>, config: CacheConfig) -> Result<Self> {
        let tree = db.open_tree("offline_cache")?;
        let snapshots = DashMap::new();
        for item in tree.iter() {
            let (_, value) = item?;
            let snapshot: Snapshot = rmp_serde::from_slice(&value)?;
            snapshots.insert(snapshot.subject_id.clone(), snapshot);
        }
        debug!(subjects = snapshots.len(), "Restored offline cache");
        Ok(Self {
            snapshots,
            tree,
            clock,
            config,
        })
    }

    /// Start holding a snapshot for a subject.
    pub fn track(&self, subject_id: &str) {
        if !self.snapshots.contains_key(subject_id) {
            let snapshot = Snapshot::empty(subject_id);
            self.persist(&snapshot);
            self.snapshots.insert(subject_id.to_string(), snapshot);
        }
    }

    pub fn tracked(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.snapshots.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self, subject_id: &str) -> Option<Snapshot> {
        self.snapshots.get(subject_id).map(|s| s.clone())
    }

    pub fn local_version(&self, subject_id: &str) -> u64 {
        self.snapshots.get(subject_id).map_or(0, |s| s.version())
    }

    /// Merge a policy into the local snapshot. Returns whether it changed.
    pub fn apply(&self, policy: CapabilityPolicy) -> bool {
        let updated = {
            let mut entry = self
                .snapshots
                .entry(policy.subject_id.clone())
                .or_insert_with(|| Snapshot::empty(&policy.subject_id));
            let snapshot: &mut Snapshot = &mut entry;
            let accepted = match snapshot.policy.as_mut() {
                None => {
                    snapshot.policy = Some(policy);
                    true
                }
                Some(held) if policy.version > held.version => {
                    let mut previous = std::mem::replace(held, policy);
                    if !previous.status.is_terminal() {
                        previous.status = PolicyStatus::Superseded;
                    }
                    let start = held.effective_start;
                    previous.effective_end =
                        Some(previous.effective_end.map_or(start, |end| end.min(start)));
                    snapshot.previous = Some(previous);
                    true
                }
                Some(held)
                    if policy.version == held.version
                        && policy.status_changed_at > held.status_changed_at =>
                {
                    held.status = policy.status;
                    held.status_changed_at = policy.status_changed_at;
                    held.hold_until = policy.hold_until;
                    held.effective_end = policy.effective_end;
                    true
                }
                Some(held) => {
                    debug!(
                        subject = %held.subject_id,
                        held = held.version,
                        incoming = policy.version,
                        "Ignoring older policy version"
                    );
                    false
                }
            };
            accepted.then(|| snapshot.clone())
        };
        match updated {
            Some(snapshot) => {
                self.persist(&snapshot);
                true
            }
            None => false,
        }
    }

    /// Pull changes for every tracked subject.
    ///
    /// A subject whose source keeps failing is reported and skipped; the rest
    /// still sync.
    pub async fn sync(&self, source: &dyn PolicySource) -> SyncReport {
        let mut report = SyncReport::default();
        for subject in self.tracked() {
            report.subjects += 1;
            match self.sync_subject(source, &subject).await {
                Ok(applied) => report.applied += applied,
                Err(e) => {
                    warn!(subject = %subject, error = %e, "Sync failed; serving last snapshot");
                    report.failed.push(subject);
                }
            }
        }
        info!(
            subjects = report.subjects,
            applied = report.applied,
            failed = report.failed.len(),
            "Offline cache sync complete"
        );
        report
    }

    /// Pull changes for one subject, retrying with exponential backoff.
    pub async fn sync_subject(&self, source: &dyn PolicySource, subject_id: &str) -> Result<usize> {
        let max_attempts = self.config.sync_max_attempts.max(1);
        let max_delay = Duration::from_millis(self.config.sync_max_backoff_ms);
        let mut delay = Duration::from_millis(self.config.sync_initial_backoff_ms);
        let mut attempt = 0;

        let policies = loop {
            attempt += 1;
            let since = self.local_version(subject_id);
            match source.fetch(subject_id, since).await {
                Ok(policies) => break policies,
                Err(e) if attempt >= max_attempts => {
                    return Err(StewardshipError::SyncFailed(format!(
                        "{} after {} attempts: {}",
                        subject_id, attempt, e
                    )));
                }
                Err(e) => {
                    warn!(
                        subject = %subject_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Policy fetch failed, retrying..."
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, max_delay);
                }
            }
        };

        let applied = policies.into_iter().filter(|p| self.apply(p.clone())).count();
        self.mark_synced(subject_id);
        Ok(applied)
    }

    fn mark_synced(&self, subject_id: &str) {
        let now = self.clock.now();
        let snapshot = {
            let mut snapshot = self
                .snapshots
                .entry(subject_id.to_string())
                .or_insert_with(|| Snapshot::empty(subject_id));
            snapshot.synced_at = Some(now);
            snapshot.clone()
        };
        self.persist(&snapshot);
    }

    /// Decide a capability from the local snapshot alone.
    pub fn enforce_local(
        &self,
        subject_id: &str,
        capability_id: &str,
        requested: &LimitParams,
    ) -> Result<LocalDecision> {
        let capability: Capability = capability_id.parse()?;
        Ok(self.decide_local(subject_id, capability, |policy, now| {
            decide_against(policy, capability, requested, now)
        }))
    }

    /// Check content against the locally held restrictions.
    pub fn check_content_local(&self, subject_id: &str, check: &ContentCheck) -> LocalDecision {
        self.decide_local(subject_id, Capability::ContentAccess, |policy, now| {
            decide_content(policy, check, now)
        })
    }

    pub fn check_session_local(&self, subject_id: &str, usage: &SessionUsage) -> LocalDecision {
        self.decide_local(subject_id, Capability::SessionTime, |policy, now| {
            decide_session(policy, usage, now)
        })
    }

    fn decide_local(
        &self,
        subject_id: &str,
        capability: Capability,
        decide: impl FnOnce(Option<&CapabilityPolicy>, DateTime<Utc>) -> Decision,
    ) -> LocalDecision {
        let now = self.clock.now();
        let snapshot = self.snapshot(subject_id);
        let decision = decide(snapshot.as_ref().and_then(|s| s.binding(now)), now);

        let last_synced = snapshot.as_ref().and_then(|s| s.synced_at);
        let threshold = chrono::Duration::seconds(self.config.stale_after_secs as i64);
        let stale = match last_synced {
            Some(at) if now - at <= threshold => None,
            _ => Some(StaleCache {
                last_synced,
                threshold_secs: self.config.stale_after_secs,
            }),
        };
        if stale.is_some() {
            debug!(subject = %subject_id, capability = %capability, "Serving decision from stale cache");
        }
        LocalDecision { decision, stale }
    }

    /// Drop everything held for a subject.
    pub fn forget(&self, subject_id: &str) -> bool {
        if let Err(e) = self.tree.remove(subject_id.as_bytes()) {
            warn!(subject = %subject_id, error = %e, "Failed to remove cached snapshot");
        }
        self.snapshots.remove(subject_id).is_some()
    }

    fn persist(&self, snapshot: &Snapshot) {
        let result = rmp_serde::to_vec_named(snapshot)
            .map_err(StewardshipError::from)
            .and_then(|bytes| Ok(self.tree.insert(snapshot.subject_id.as_bytes(), bytes)?));
        if let Err(e) = result {
            warn!(subject = %snapshot.subject_id, error = %e, "Failed to persist cache snapshot");
        }
    }
}
