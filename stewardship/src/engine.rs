//! Engine wiring and the periodic sweep.
//!
//! `StewardshipEngine` owns one instance of every component and passes the
//! shared handles (store, clock, graph, reviewer) through their constructors.
//! The sweep opens due process for consensus cases, reports due reviews and
//! advances appeals, and prunes activity past its retention. Each step is idempotent, so a failed tick is simply
//! retried on the next one.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{ActivityEntry, ActivityLog, ActivityReport};
use crate::appeal::{AppealOrigin, AppealState, AppealWorkflow};
use crate::audit::AuditEventKind;
use crate::cache::{LocalDecision, OfflineEnforcementCache, SyncReport};
use crate::clock::Clock;
use crate::config::StewardshipConfig;
use crate::error::Result;
use crate::evaluator::CapabilityEvaluator;
use crate::graph::RelationshipGraph;
use crate::restrictions::{ComputedRestrictions, ContentCheck, SessionUsage};
use crate::reviewer::{AppealOutcome, ProportionalityReviewer};
use crate::scheduler::ReviewScheduler;
use crate::store::{DisconnectReport, PolicyStore};
use crate::trigger::{TriggerAggregator, TriggerCase};
use crate::types::{Decision, LimitParams, PolicyId};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Consensus cases with an open appeal after this tick
    pub consensus_cases: usize,
    pub reviews_due: Vec<PolicyId>,
    pub appeals_advanced: usize,
    pub cases_closed: usize,
    pub activity_pruned: usize,
    pub errors: usize,
}

/// What an erasure request removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureReport {
    pub edges_removed: usize,
    pub cache_cleared: bool,
    pub case_closed: bool,
    pub activity_removed: usize,
}

/// How a consensus case's due process ended.
enum CaseResolution {
    Dismissed,
    Sustained,
}

pub struct StewardshipEngine {
    config: StewardshipConfig,
    store: Arc<PolicyStore>,
    graph: Arc<dyn RelationshipGraph>,
    triggers: TriggerAggregator,
    evaluator: CapabilityEvaluator,
    appeals: Arc<AppealWorkflow>,
    scheduler: ReviewScheduler,
    cache: OfflineEnforcementCache,
    activity: ActivityLog,
}

impl StewardshipEngine {
    /// Open the engine over an on-disk store at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: StewardshipConfig,
        clock: Arc<dyn Clock>,
        graph: Arc<dyn RelationshipGraph>,
        reviewer: Arc<dyn ProportionalityReviewer>,
    ) -> Result<Self> {
        let store = PolicyStore::open(path, config.review.clone(), clock)?;
        Self::with_store(Arc::new(store), config, graph, reviewer)
    }

    /// Wire the engine around an existing store.
    pub fn with_store(
        store: Arc<PolicyStore>,
        config: StewardshipConfig,
        graph: Arc<dyn RelationshipGraph>,
        reviewer: Arc<dyn ProportionalityReviewer>,
    ) -> Result<Self> {
        let clock = store.clock();
        let triggers = TriggerAggregator::open(
            store.db(),
            graph.clone(),
            store.audit().clone(),
            clock.clone(),
            config.trigger.threshold,
        )?;
        let evaluator = CapabilityEvaluator::new(store.clone());
        let appeals = Arc::new(AppealWorkflow::new(
            store.clone(),
            reviewer,
            config.appeal.clone(),
        )?);
        let scheduler = ReviewScheduler::new(store.clone(), appeals.clone(), config.appeal.clone());
        let cache = OfflineEnforcementCache::open(store.db(), clock, config.cache.clone())?;
        let activity = ActivityLog::open(store.clone())?;

        info!(
            threshold = config.trigger.threshold,
            reviewer = %appeals.reviewer_id(),
            "Stewardship engine ready"
        );

        Ok(Self {
            config,
            store,
            graph,
            triggers,
            evaluator,
            appeals,
            scheduler,
            cache,
            activity,
        })
    }

    pub fn config(&self) -> &StewardshipConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn graph(&self) -> &Arc<dyn RelationshipGraph> {
        &self.graph
    }

    pub fn triggers(&self) -> &TriggerAggregator {
        &self.triggers
    }

    pub fn evaluator(&self) -> &CapabilityEvaluator {
        &self.evaluator
    }

    pub fn appeals(&self) -> &Arc<AppealWorkflow> {
        &self.appeals
    }

    pub fn scheduler(&self) -> &ReviewScheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &OfflineEnforcementCache {
        &self.cache
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Online capability check against the store.
    pub fn check(&self, subject_id: &str, capability_id: &str, requested: &LimitParams) -> Result<Decision> {
        self.evaluator.check(subject_id, capability_id, requested)
    }

    /// Offline capability check against the local snapshot.
    pub fn check_local(
        &self,
        subject_id: &str,
        capability_id: &str,
        requested: &LimitParams,
    ) -> Result<LocalDecision> {
        self.cache.enforce_local(subject_id, capability_id, requested)
    }

    pub fn check_content(&self, subject_id: &str, check: &ContentCheck) -> Result<Decision> {
        self.evaluator.check_content(subject_id, check)
    }

    pub fn check_session(&self, subject_id: &str, usage: &SessionUsage) -> Result<Decision> {
        self.evaluator.check_session(subject_id, usage)
    }

    /// Restrictions currently binding a subject, merged across stewards.
    pub fn computed_restrictions(&self, subject_id: &str) -> Result<ComputedRestrictions> {
        self.evaluator.computed(subject_id)
    }

    pub fn log_activity(&self, subject_id: &str, report: ActivityReport) -> Result<ActivityEntry> {
        self.activity.record(subject_id, report)
    }

    pub fn activity_for(&self, subject_id: &str, viewer_id: &str) -> Result<Vec<ActivityEntry>> {
        self.activity.activity_for(subject_id, viewer_id)
    }

    /// Refresh the offline cache from the store.
    pub async fn sync_cache(&self) -> SyncReport {
        self.cache.sync(self.store.as_ref()).await
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Run one sweep.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let now = self.store.clock().now();

        match self.triggers.evaluate_all().await {
            Ok(cases) => {
                for case in &cases {
                    let appeal_id = self.appeals.open_consensus_case(case);
                    debug!(case = %case.case_id, appeal = %appeal_id, "Consensus case in due process");
                }
                report.consensus_cases = cases.len();
            }
            Err(e) => {
                warn!(error = %e, "Trigger evaluation failed; retrying next tick");
                report.errors += 1;
            }
        }

        match self.scheduler.due_reviews(now) {
            Ok(due) => {
                for policy_id in &due {
                    info!(policy = %policy_id, "Review due");
                }
                report.reviews_due = due;
            }
            Err(e) => {
                warn!(error = %e, "Could not list due reviews");
                report.errors += 1;
            }
        }

        report.appeals_advanced = self.appeals.advance_all().await;
        report.cases_closed = self.close_settled_cases(&mut report).await;

        match self.activity.prune_expired() {
            Ok(pruned) => report.activity_pruned = pruned,
            Err(e) => {
                warn!(error = %e, "Activity pruning failed");
                report.errors += 1;
            }
        }

        debug!(
            consensus_cases = report.consensus_cases,
            reviews_due = report.reviews_due.len(),
            appeals_advanced = report.appeals_advanced,
            cases_closed = report.cases_closed,
            activity_pruned = report.activity_pruned,
            errors = report.errors,
            "Sweep complete"
        );
        report
    }

    /// Close consensus cases whose due process has finished, so the subject's
    /// concern can be weighed afresh.
    ///
    /// A withdrawn or overturned case closes at once. An upheld case stays
    /// open while the weighted concern behind it still meets the threshold;
    /// otherwise the same supporters would open a new case on every tick.
    async fn close_settled_cases(&self, report: &mut TickReport) -> usize {
        let mut closed = 0;
        for case in self.triggers.open_cases() {
            let close = match self.case_resolution(&case) {
                Some(CaseResolution::Dismissed) => true,
                Some(CaseResolution::Sustained) => {
                    match self.triggers.current_weight(&case.subject_id).await {
                        Ok(weight) => weight < self.triggers.threshold(),
                        Err(e) => {
                            debug!(subject = %case.subject_id, error = %e, "Concern unavailable; case stays open");
                            false
                        }
                    }
                }
                None => false,
            };
            if !close {
                continue;
            }
            match self.triggers.close_case(&case.subject_id) {
                Ok(Some(_)) => {
                    info!(subject = %case.subject_id, case = %case.case_id, "Consensus case closed");
                    closed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(subject = %case.subject_id, error = %e, "Failed to close consensus case");
                    report.errors += 1;
                }
            }
        }
        closed
    }

    fn case_resolution(&self, case: &TriggerCase) -> Option<CaseResolution> {
        self.appeals
            .appeals_for_subject(&case.subject_id)
            .into_iter()
            .filter(|a| a.re_appealed_by.is_none())
            .filter(|a| {
                matches!(&a.origin, AppealOrigin::ConsensusTrigger { case_id, .. } if *case_id == case.case_id)
            })
            .find_map(|a| match a.state {
                AppealState::Withdrawn => Some(CaseResolution::Dismissed),
                AppealState::Resolved => match a.decision.as_ref().map(|d| &d.outcome) {
                    Some(AppealOutcome::Overturned) => Some(CaseResolution::Dismissed),
                    Some(_) => Some(CaseResolution::Sustained),
                    None => None,
                },
                _ => None,
            })
    }

    /// Run the sweep on the configured interval until the task is dropped.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.sweep.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let report = self.tick().await;
                if report.errors > 0 {
                    warn!(errors = report.errors, "Sweep finished with errors");
                }
            }
        })
    }

    // =========================================================================
    // Inalienable requests
    // =========================================================================

    /// Leave stewardship: every policy and grant over the subject is revoked.
    pub fn request_disconnection(&self, subject_id: &str) -> Result<DisconnectReport> {
        let report = self.store.disconnect(subject_id)?;
        if self.cache.snapshot(subject_id).is_some() {
            if let Some(head) = self.store.current(subject_id)? {
                self.cache.apply(head);
            }
        }
        Ok(report)
    }

    /// Erase the subject's relationship data, monitored activity and local copies.
    ///
    /// Policy history and the audit trail are kept; they are the record of
    /// what authority was exercised over the subject.
    pub async fn request_erasure(&self, subject_id: &str) -> Result<ErasureReport> {
        let edges_removed = self.graph.erase_agent(subject_id).await?;
        let cache_cleared = self.cache.forget(subject_id);
        let case_closed = self.triggers.close_case(subject_id)?.is_some();
        let activity_removed = self.activity.purge_subject(subject_id)?;

        self.store.audit().record(
            subject_id,
            self.store.clock().now(),
            AuditEventKind::ErasureRequested { edges_removed },
        )?;
        info!(
            subject = %subject_id,
            edges_removed,
            cache_cleared,
            case_closed,
            activity_removed,
            "Erasure carried out"
        );

        Ok(ErasureReport {
            edges_removed,
            cache_cleared,
            case_closed,
            activity_removed,
        })
    }
}
