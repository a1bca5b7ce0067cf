//! Versioned policy store.
//!
//! Policies are kept as an append-only chain per subject on top of sled:
//!
//! - `policies`: policy id -> `CapabilityPolicy`
//! - `chain`: `{subject}\0{version:020}` -> policy id
//! - `heads`: subject -> latest committed version (big-endian u64)
//! - `grants`: grant id -> `StewardshipGrant`
//! - `subjects`: subject id -> `Subject`
//! - `reviews`: `{policy}\0{seq:020}` -> `ReviewRecord`
//!
//! Committing a policy supersedes its predecessor and appends the new
//! version in one multi-tree transaction. The version a caller last saw is
//! re-checked inside that transaction, so two stewards racing on the same
//! subject cannot both win.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Transactional, Tree};
use tracing::{debug, info, warn};

use crate::audit::{AuditEventKind, AuditLog};
use crate::clock::Clock;
use crate::config::ReviewConfig;
use crate::error::{Result, StewardshipError};
use crate::grant::{
    validate_delegation, validate_grant, DelegationRequest, GrantRequest, GrantStatus,
    StewardshipGrant,
};
use crate::registry::{
    AuthorityBasis, ExitCondition, ReviewPeriod, RevocationInitiator, StewardTier,
};
use crate::restrictions::{Restrictions, StewardLayer};
use crate::types::{
    check_inalienable, AgentId, CapabilityPolicy, CommitAuthority, Evidence, PolicyDraft,
    PolicyRule, PolicyStatus, ReviewRecord, Subject,
};

/// Counts returned by a subject's disconnection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReport {
    pub policies_revoked: usize,
    pub grants_revoked: usize,
}

/// Durable store for policies, grants and subjects.
pub struct PolicyStore {
    db: Db,
    policies: Tree,
    chain: Tree,
    heads: Tree,
    grants: Tree,
    subjects: Tree,
    reviews: Tree,
    audit: AuditLog,
    review: ReviewConfig,
    clock: Arc<dyn Clock>,
}

impl PolicyStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        review: ReviewConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = sled::Config::new().path(path.as_ref()).open()?;
        info!(path = %path.as_ref().display(), "Opened policy store");
        Self::with_db(db, review, clock)
    }

    /// Build a store over an already opened database.
    pub fn with_db(db: Db, review: ReviewConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            policies: db.open_tree("policies")?,
            chain: db.open_tree("chain")?,
            heads: db.open_tree("heads")?,
            grants: db.open_tree("grants")?,
            subjects: db.open_tree("subjects")?,
            reviews: db.open_tree("reviews")?,
            audit: AuditLog::open(&db)?,
            db,
            review,
            clock,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn review_config(&self) -> &ReviewConfig {
        &self.review
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // =========================================================================
    // Subjects
    // =========================================================================

    /// Register a subject, or record their date of birth.
    ///
    /// A date of birth already on record is never overwritten.
    pub fn register_subject(&self, id: &str, date_of_birth: Option<NaiveDate>) -> Result<Subject> {
        let mut subject = match self.load_subject(id)? {
            Some(existing) => existing,
            None => Subject {
                id: id.to_string(),
                date_of_birth: None,
                policy_version: 0,
                registered_at: self.clock.now(),
                disconnected_at: None,
            },
        };
        if subject.date_of_birth.is_none() {
            subject.date_of_birth = date_of_birth;
        }
        self.subjects
            .insert(id.as_bytes(), rmp_serde::to_vec_named(&subject)?)?;
        subject.policy_version = self.head_version(id)?;
        debug!(subject = %id, "Registered subject");
        Ok(subject)
    }

    pub fn subject(&self, id: &str) -> Result<Option<Subject>> {
        let Some(mut subject) = self.load_subject(id)? else {
            return Ok(None);
        };
        subject.policy_version = self.head_version(id)?;
        Ok(Some(subject))
    }

    fn load_subject(&self, id: &str) -> Result<Option<Subject>> {
        match self.subjects.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Subjects that have at least one committed policy.
    pub fn subjects_with_policies(&self) -> Result<Vec<AgentId>> {
        let mut ids = Vec::new();
        for item in self.heads.iter() {
            let (key, _) = item?;
            if let Ok(id) = String::from_utf8(key.to_vec()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    // =========================================================================
    // Grants
    // =========================================================================

    /// Record a root grant of authority.
    pub fn grant(&self, request: GrantRequest) -> Result<StewardshipGrant> {
        validate_grant(&request)?;
        let subject = self.register_subject(&request.subject_id, None)?;
        if subject.disconnected_at.is_some() {
            return Err(StewardshipError::UnauthorizedSteward {
                steward: request.steward_id,
                reason: format!("subject {} has disconnected", subject.id),
            });
        }

        let grant = StewardshipGrant {
            id: format!("grant-{}", uuid::Uuid::new_v4()),
            steward_id: request.steward_id,
            subject_id: request.subject_id,
            basis: request.basis,
            evidence: request.evidence,
            scope: request.scope,
            tier: request.tier,
            delegatable: request.delegatable,
            delegated_from: None,
            depth: 0,
            status: GrantStatus::Active,
            granted_at: self.clock.now(),
            expires_at: request.expires_at,
        };
        self.put_grant(&grant)?;
        self.audit_grant(&grant, "granted");
        info!(
            grant = %grant.id,
            steward = %grant.steward_id,
            subject = %grant.subject_id,
            basis = %grant.basis,
            "Granted stewardship"
        );
        Ok(grant)
    }

    /// Pass part of an existing grant on to another steward.
    pub fn delegate(&self, parent_id: &str, request: DelegationRequest) -> Result<StewardshipGrant> {
        let parent = self.require_grant(parent_id)?;
        let now = self.clock.now();
        self.ensure_chain_live(&parent, now)?;
        validate_delegation(&parent, &request, now)?;

        let grant = StewardshipGrant {
            id: format!("grant-{}", uuid::Uuid::new_v4()),
            steward_id: request.steward_id,
            subject_id: parent.subject_id.clone(),
            basis: parent.basis,
            evidence: parent.evidence.clone(),
            scope: request.scope,
            tier: request.tier,
            delegatable: request.delegatable,
            delegated_from: Some(parent.id.clone()),
            depth: parent.depth + 1,
            status: GrantStatus::Active,
            granted_at: now,
            expires_at: request.expires_at,
        };
        self.put_grant(&grant)?;
        self.audit_grant(&grant, "delegated");
        info!(
            grant = %grant.id,
            parent = %parent.id,
            steward = %grant.steward_id,
            depth = grant.depth,
            "Delegated stewardship"
        );
        Ok(grant)
    }

    /// Revoke a grant and everything delegated from it.
    pub fn revoke_grant(&self, grant_id: &str) -> Result<Vec<StewardshipGrant>> {
        let root = self.require_grant(grant_id)?;
        let all = self.grants_for_subject(&root.subject_id)?;

        let mut pending = vec![root.id.clone()];
        let mut revoked = Vec::new();
        while let Some(id) = pending.pop() {
            let Some(mut grant) = all.iter().find(|g| g.id == id).cloned() else {
                continue;
            };
            pending.extend(
                all.iter()
                    .filter(|g| g.delegated_from.as_deref() == Some(id.as_str()))
                    .map(|g| g.id.clone()),
            );
            if grant.status == GrantStatus::Revoked {
                continue;
            }
            grant.status = GrantStatus::Revoked;
            self.put_grant(&grant)?;
            self.audit_grant(&grant, "revoked");
            revoked.push(grant);
        }
        info!(grant = %grant_id, revoked = revoked.len(), "Revoked stewardship grant");
        Ok(revoked)
    }

    pub fn get_grant(&self, id: &str) -> Result<Option<StewardshipGrant>> {
        match self.grants.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_grant(&self, id: &str) -> Result<StewardshipGrant> {
        self.get_grant(id)?
            .ok_or_else(|| StewardshipError::NotFound(format!("grant {}", id)))
    }

    pub fn grants_for_subject(&self, subject_id: &str) -> Result<Vec<StewardshipGrant>> {
        self.scan_grants(|g| g.subject_id == subject_id)
    }

    pub fn grants_for_steward(&self, steward_id: &str) -> Result<Vec<StewardshipGrant>> {
        self.scan_grants(|g| g.steward_id == steward_id)
    }

    fn scan_grants(&self, keep: impl Fn(&StewardshipGrant) -> bool) -> Result<Vec<StewardshipGrant>> {
        let mut out = Vec::new();
        for item in self.grants.iter() {
            let (_, value) = item?;
            let grant: StewardshipGrant = rmp_serde::from_slice(&value)?;
            if keep(&grant) {
                out.push(grant);
            }
        }
        out.sort_by(|a, b| a.granted_at.cmp(&b.granted_at));
        Ok(out)
    }

    fn put_grant(&self, grant: &StewardshipGrant) -> Result<()> {
        self.grants
            .insert(grant.id.as_bytes(), rmp_serde::to_vec_named(grant)?)?;
        Ok(())
    }

    fn audit_grant(&self, grant: &StewardshipGrant, action: &str) {
        self.audit.record_or_warn(
            &grant.subject_id,
            self.clock.now(),
            AuditEventKind::GrantChanged {
                grant_id: grant.id.clone(),
                steward_id: grant.steward_id.clone(),
                action: action.to_string(),
            },
        );
    }

    /// Grants from the root down to `grant_id`.
    pub fn delegation_chain(&self, grant_id: &str) -> Result<Vec<StewardshipGrant>> {
        let mut chain = Vec::new();
        let mut next = Some(grant_id.to_string());
        while let Some(id) = next {
            let grant = self.require_grant(&id)?;
            next = grant.delegated_from.clone();
            chain.push(grant);
            if chain.len() as u32 > crate::registry::MAX_DELEGATION_DEPTH + 1 {
                return Err(StewardshipError::UnauthorizedSteward {
                    steward: chain[0].steward_id.clone(),
                    reason: "delegation chain is too deep".to_string(),
                });
            }
        }
        chain.reverse();
        Ok(chain)
    }

    fn ensure_chain_live(&self, grant: &StewardshipGrant, now: DateTime<Utc>) -> Result<()> {
        for link in self.delegation_chain(&grant.id)? {
            if !link.is_live(now) {
                return Err(StewardshipError::UnauthorizedSteward {
                    steward: grant.steward_id.clone(),
                    reason: format!("grant {} in the delegation chain is not active", link.id),
                });
            }
        }
        Ok(())
    }

    /// Find a grant that lets `steward` commit `rules` for `subject` on `basis`.
    pub fn authorize(
        &self,
        steward: &str,
        subject: &str,
        basis: AuthorityBasis,
        rules: &[PolicyRule],
        now: DateTime<Utc>,
    ) -> Result<StewardshipGrant> {
        let refuse = |reason: String| StewardshipError::UnauthorizedSteward {
            steward: steward.to_string(),
            reason,
        };
        if steward == subject {
            return Err(refuse("a steward cannot steward themself".to_string()));
        }

        let grants: Vec<StewardshipGrant> = self
            .grants_for_subject(subject)?
            .into_iter()
            .filter(|g| g.steward_id == steward)
            .collect();
        if grants.is_empty() {
            return Err(refuse(format!("holds no grant over {}", subject)));
        }

        let mut reason = format!("no {} grant over {}", basis, subject);
        for grant in grants {
            if grant.basis != basis {
                continue;
            }
            if !grant.tier.can_restrict() {
                reason = format!("tier {:?} may not commit restrictions", grant.tier);
                continue;
            }
            if let Err(e) = self.ensure_chain_live(&grant, now) {
                reason = e.to_string();
                continue;
            }
            if let Some(rule) = rules.iter().find(|r| !grant.scope.covers(&r.selector)) {
                reason = format!("grant {} does not cover {:?}", grant.id, rule.selector);
                continue;
            }
            return Ok(grant);
        }
        Err(refuse(reason))
    }

    fn holds_constitutional_grant(&self, agent: &str, subject: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.grants_for_subject(subject)?.into_iter().any(|g| {
            g.steward_id == agent && g.tier == StewardTier::Constitutional && g.is_live(now)
        }))
    }

    // =========================================================================
    // Policies
    // =========================================================================

    /// Validate and commit a steward's draft.
    pub fn commit(&self, draft: PolicyDraft) -> Result<CapabilityPolicy> {
        self.commit_as(draft, CommitAuthority::Steward)
    }

    /// Commit on behalf of a lifecycle component.
    ///
    /// Review and appeal successors skip the grant check; every other rule
    /// still applies.
    pub(crate) fn commit_as(
        &self,
        draft: PolicyDraft,
        authority: CommitAuthority,
    ) -> Result<CapabilityPolicy> {
        let now = self.clock.now();
        let basis = draft.authority_basis;
        let rules = basis.rules();

        // Evidence
        if !draft.evidence.tier.satisfies(rules.minimum_evidence) {
            return Err(StewardshipError::EvidenceInsufficient {
                basis: basis.to_string(),
                required: rules.minimum_evidence,
                provided: draft.evidence.tier,
            });
        }

        // Inalienable rights
        check_inalienable(&draft.rules)?;

        // Delegation chain
        let grant = if authority == CommitAuthority::Steward {
            let mut scoped = draft.rules.clone();
            scoped.extend(draft.restrictions.scope_rules());
            Some(self.authorize(&draft.steward_id, &draft.subject_id, basis, &scoped, now)?)
        } else {
            None
        };

        let subject = self.load_subject(&draft.subject_id)?;
        if let Some(s) = subject.as_ref().filter(|s| s.disconnected_at.is_some()) {
            return Err(StewardshipError::UnauthorizedSteward {
                steward: draft.steward_id.clone(),
                reason: format!("subject {} has disconnected", s.id),
            });
        }
        let date_of_birth = subject.as_ref().and_then(|s| s.date_of_birth);

        // Effective window
        let actual = self.head_version(&draft.subject_id)?;
        let prior = if actual > 0 {
            self.policy_at(&draft.subject_id, actual)?
        } else {
            None
        };
        if let Some(prior) = prior.as_ref().filter(|p| p.status == PolicyStatus::UnderReview) {
            if authority == CommitAuthority::Steward {
                return Err(StewardshipError::InvalidTransition(format!(
                    "version {} for {} is under appeal",
                    prior.version, prior.subject_id
                )));
            }
        }
        let effective_start = draft.effective_start.unwrap_or(now);
        if let Some(prior) = &prior {
            let floor = match authority {
                CommitAuthority::Steward => prior.effective_floor(),
                _ => prior.effective_start,
            };
            if effective_start < floor {
                return Err(StewardshipError::RetroactiveRestriction(format!(
                    "start {} precedes {} of version {}",
                    effective_start, floor, prior.version
                )));
            }
        }

        // Optimistic version
        if draft.expected_version != actual {
            return Err(StewardshipError::VersionConflict {
                subject: draft.subject_id.clone(),
                expected: draft.expected_version,
                actual,
            });
        }

        // Exit condition
        match basis.exit_reached(date_of_birth, effective_start.max(now)) {
            Some(false) => {}
            Some(true) => {
                return Err(StewardshipError::AuthorityLapsed(format!(
                    "{} no longer applies to {}",
                    basis, draft.subject_id
                )))
            }
            None => {
                return Err(StewardshipError::AuthorityLapsed(format!(
                    "{} cannot be verified for {}: no date of birth on record",
                    basis, draft.subject_id
                )))
            }
        }

        let review_due = self.review_due_for(basis, effective_start, draft.review_due, date_of_birth)?;
        if let Some(end) = draft.effective_end {
            if end <= effective_start {
                return Err(StewardshipError::InvalidDraft(
                    "effective end must follow effective start".to_string(),
                ));
            }
        }

        let layers = match &grant {
            Some(grant) => self.steward_layers(
                prior.as_ref(),
                &draft.steward_id,
                grant.tier,
                &draft.restrictions,
                now,
            )?,
            None => prior.as_ref().map(|p| p.layers.clone()).unwrap_or_default(),
        };

        let policy = CapabilityPolicy {
            id: format!("policy-{}", uuid::Uuid::new_v4()),
            subject_id: draft.subject_id,
            steward_id: draft.steward_id,
            version: actual + 1,
            authority_basis: basis,
            effective_start,
            review_due,
            effective_end: draft.effective_end,
            rules: draft.rules,
            evidence: draft.evidence,
            supersedes: prior.as_ref().map(|p| p.id.clone()),
            committed_at: now,
            committed_by: authority,
            status: PolicyStatus::Active,
            status_changed_at: now,
            hold_until: None,
            layers,
        };

        let superseded = self.append(&policy, actual, now)?;

        if let Some(prior) = superseded {
            self.audit.record_or_warn(
                &policy.subject_id,
                now,
                AuditEventKind::StatusChanged {
                    policy_id: prior.id.clone(),
                    version: prior.version,
                    from: prior.status,
                    to: PolicyStatus::Superseded,
                    reason: format!("superseded by version {}", policy.version),
                },
            );
        }
        self.audit.record_or_warn(
            &policy.subject_id,
            now,
            AuditEventKind::PolicyCommitted {
                policy_id: policy.id.clone(),
                version: policy.version,
                steward_id: policy.steward_id.clone(),
                basis,
                committed_by: authority,
                supersedes: policy.supersedes.clone(),
            },
        );
        info!(
            subject = %policy.subject_id,
            policy = %policy.id,
            version = policy.version,
            basis = %basis,
            committed_by = ?authority,
            "Committed capability policy"
        );
        Ok(policy)
    }

    /// Restriction layers for a steward's commit.
    ///
    /// The committer's restrictions replace whatever layer they held before.
    /// Other stewards' layers carry over from a live prior for as long as
    /// those stewards still hold a live grant over the subject.
    fn steward_layers(
        &self,
        prior: Option<&CapabilityPolicy>,
        steward: &str,
        tier: StewardTier,
        restrictions: &Restrictions,
        now: DateTime<Utc>,
    ) -> Result<Vec<StewardLayer>> {
        let mut layers = Vec::new();
        if let Some(prior) = prior.filter(|p| p.status.is_enforceable()) {
            let grants = self.grants_for_subject(&prior.subject_id)?;
            for layer in prior.layers.iter().filter(|l| l.steward_id != steward) {
                if grants
                    .iter()
                    .any(|g| g.steward_id == layer.steward_id && g.is_live(now))
                {
                    layers.push(layer.clone());
                } else {
                    debug!(
                        subject = %prior.subject_id,
                        steward = %layer.steward_id,
                        "Dropping restrictions of a steward without a live grant"
                    );
                }
            }
        }
        if !restrictions.is_empty() {
            layers.push(StewardLayer {
                steward_id: steward.to_string(),
                tier,
                restrictions: restrictions.clone(),
            });
        }
        Ok(layers)
    }

    /// Supersede the head and append `policy` in one transaction.
    ///
    /// The prior head's window is closed at `policy`'s start, so versions
    /// never overlap. Returns the prior head as it was before it was
    /// superseded, if it was still live.
    fn append(
        &self,
        policy: &CapabilityPolicy,
        expected: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<CapabilityPolicy>> {
        let subject = policy.subject_id.clone();
        let encoded = rmp_serde::to_vec_named(policy)?;

        let result = (&self.policies, &self.chain, &self.heads).transaction(
            |(policies, chain, heads)| -> ConflictableTransactionResult<Option<CapabilityPolicy>, StewardshipError> {
                let actual = heads
                    .get(subject.as_bytes())?
                    .map(|v| decode_version(&v))
                    .unwrap_or(0);
                if actual != expected {
                    return Err(ConflictableTransactionError::Abort(
                        StewardshipError::VersionConflict {
                            subject: subject.clone(),
                            expected,
                            actual,
                        },
                    ));
                }

                let mut superseded = None;
                if let Some(prior_id) = &policy.supersedes {
                    let bytes = policies.get(prior_id.as_bytes())?.ok_or_else(|| {
                        ConflictableTransactionError::Abort(StewardshipError::NotFound(format!(
                            "policy {}",
                            prior_id
                        )))
                    })?;
                    let mut prior: CapabilityPolicy =
                        rmp_serde::from_slice(&bytes).map_err(abort)?;
                    let closed_at = prior
                        .effective_end
                        .map_or(policy.effective_start, |end| end.min(policy.effective_start));
                    let live = !prior.status.is_terminal();
                    if live || prior.effective_end != Some(closed_at) {
                        if live {
                            superseded = Some(prior.clone());
                            prior.status = PolicyStatus::Superseded;
                            prior.status_changed_at = now;
                        }
                        prior.effective_end = Some(closed_at);
                        policies.insert(
                            prior.id.as_bytes().to_vec(),
                            rmp_serde::to_vec_named(&prior).map_err(abort)?,
                        )?;
                    }
                }

                policies.insert(policy.id.as_bytes().to_vec(), encoded.clone())?;
                chain.insert(
                    chain_key(&subject, policy.version),
                    policy.id.as_bytes().to_vec(),
                )?;
                heads.insert(
                    subject.as_bytes().to_vec(),
                    policy.version.to_be_bytes().to_vec(),
                )?;
                Ok(superseded)
            },
        );
        Ok(result?)
    }

    /// Draft for a lifecycle successor of `policy` carrying `rules`.
    ///
    /// With `keep_review_due` the successor keeps a review date that is still
    /// ahead; otherwise it starts a fresh period. Court orders keep the length
    /// of the original order.
    pub(crate) fn successor_draft(
        &self,
        policy: &CapabilityPolicy,
        rules: Vec<PolicyRule>,
        evidence: Evidence,
        keep_review_due: bool,
    ) -> PolicyDraft {
        let now = self.clock.now();
        let mut review_due = if keep_review_due {
            policy.review_due.filter(|due| *due > now)
        } else {
            None
        };
        if review_due.is_none() && self.review.period(policy.authority_basis) == ReviewPeriod::PerOrder {
            review_due = policy
                .review_due
                .map(|due| now + (due - policy.effective_start));
        }
        let start = policy.effective_start.max(now);
        PolicyDraft {
            subject_id: policy.subject_id.clone(),
            steward_id: policy.steward_id.clone(),
            authority_basis: policy.authority_basis,
            rules,
            evidence,
            effective_start: Some(start),
            review_due,
            effective_end: policy.effective_end.filter(|end| *end > start),
            expected_version: policy.version,
            restrictions: Restrictions::default(),
        }
    }

    fn review_due_for(
        &self,
        basis: AuthorityBasis,
        start: DateTime<Utc>,
        requested: Option<DateTime<Utc>>,
        date_of_birth: Option<NaiveDate>,
    ) -> Result<Option<DateTime<Utc>>> {
        if let Some(due) = requested {
            if due <= start {
                return Err(StewardshipError::InvalidDraft(
                    "review date must follow effective start".to_string(),
                ));
            }
        }
        let due = match self.review.period(basis) {
            ReviewPeriod::Days(days) => {
                let cap = start + Duration::days(days as i64);
                Some(requested.map_or(cap, |r| r.min(cap)))
            }
            ReviewPeriod::OnDemand => requested,
            ReviewPeriod::PerOrder => Some(requested.ok_or_else(|| {
                StewardshipError::InvalidDraft(format!("{} policies must carry a review date", basis))
            })?),
        };

        // Age-based authority lapses no later than the subject's majority
        if let (ExitCondition::AgeOfMajority(age), Some(dob)) = (basis.rules().exit, date_of_birth) {
            if let Some(majority) = birthday(dob, age) {
                return Ok(Some(due.map_or(majority, |d| d.min(majority))));
            }
        }
        Ok(due)
    }

    pub fn get(&self, policy_id: &str) -> Result<Option<CapabilityPolicy>> {
        match self.policies.get(policy_id.as_bytes())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require(&self, policy_id: &str) -> Result<CapabilityPolicy> {
        self.get(policy_id)?
            .ok_or_else(|| StewardshipError::NotFound(format!("policy {}", policy_id)))
    }

    pub fn head_version(&self, subject_id: &str) -> Result<u64> {
        Ok(self
            .heads
            .get(subject_id.as_bytes())?
            .map(|v| decode_version(&v))
            .unwrap_or(0))
    }

    fn policy_at(&self, subject_id: &str, version: u64) -> Result<Option<CapabilityPolicy>> {
        match self.chain.get(chain_key(subject_id, version))? {
            Some(id) => self.get(&String::from_utf8_lossy(&id)),
            None => Ok(None),
        }
    }

    /// The latest committed version for a subject, whatever its status.
    pub fn current(&self, subject_id: &str) -> Result<Option<CapabilityPolicy>> {
        match self.head_version(subject_id)? {
            0 => Ok(None),
            version => self.policy_at(subject_id, version),
        }
    }

    /// Full chain for a subject in version order.
    pub fn history(&self, subject_id: &str) -> Result<Vec<CapabilityPolicy>> {
        self.delta(subject_id, 0)
    }

    /// Policies committed after `since_version`, in version order.
    pub fn delta(&self, subject_id: &str, since_version: u64) -> Result<Vec<CapabilityPolicy>> {
        let mut out = Vec::new();
        let start = chain_key(subject_id, since_version + 1);
        let prefix = format!("{}\0", subject_id);
        for item in self.chain.range(start..) {
            let (key, id) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            if let Some(policy) = self.get(&String::from_utf8_lossy(&id))? {
                out.push(policy);
            }
        }
        Ok(out)
    }

    /// The version binding a subject at `now`.
    ///
    /// This is the head unless the head was committed with a start still
    /// ahead, in which case the versions it superseded keep binding until
    /// then. A revoked or expired head ends the chain.
    pub fn binding_policy(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CapabilityPolicy>> {
        let Some(mut policy) = self.current(subject_id)? else {
            return Ok(None);
        };
        while policy.is_pending(now) {
            let Some(prior) = policy.supersedes.as_deref().map(|id| self.get(id)).transpose()?.flatten() else {
                break;
            };
            policy = prior;
        }
        Ok(Some(policy))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Move a policy to a new lifecycle status.
    pub(crate) fn transition(
        &self,
        policy_id: &str,
        to: PolicyStatus,
        hold_until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<CapabilityPolicy> {
        let now = self.clock.now();
        let id = policy_id.to_string();

        let (before, after) = self.policies.transaction(
            |policies| -> ConflictableTransactionResult<(CapabilityPolicy, CapabilityPolicy), StewardshipError> {
                let bytes = policies.get(id.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(StewardshipError::NotFound(format!(
                        "policy {}",
                        id
                    )))
                })?;
                let before: CapabilityPolicy = rmp_serde::from_slice(&bytes).map_err(abort)?;
                if !transition_allowed(before.status, to) {
                    return Err(ConflictableTransactionError::Abort(
                        StewardshipError::InvalidTransition(format!(
                            "policy {} cannot move from {:?} to {:?}",
                            id, before.status, to
                        )),
                    ));
                }
                let mut after = before.clone();
                after.status = to;
                after.status_changed_at = now;
                after.hold_until = hold_until;
                policies.insert(
                    id.as_bytes().to_vec(),
                    rmp_serde::to_vec_named(&after).map_err(abort)?,
                )?;
                Ok((before, after))
            },
        )?;

        self.audit.record_or_warn(
            &after.subject_id,
            now,
            AuditEventKind::StatusChanged {
                policy_id: after.id.clone(),
                version: after.version,
                from: before.status,
                to,
                reason: reason.to_string(),
            },
        );
        info!(
            policy = %after.id,
            subject = %after.subject_id,
            from = ?before.status,
            to = ?to,
            reason = %reason,
            "Policy status changed"
        );
        Ok(after)
    }

    /// Mark a lapsed policy expired. Returns whether anything changed.
    pub fn expire_if_lapsed(&self, policy_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let policy = self.require(policy_id)?;
        if !policy.has_lapsed(now) {
            return Ok(false);
        }
        match self.transition(policy_id, PolicyStatus::Expired, None, "lapsed without review") {
            Ok(_) => Ok(true),
            // Someone else already moved it on
            Err(StewardshipError::InvalidTransition(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Revoke a policy at the request of `actor`.
    ///
    /// The committing steward and constitutional-tier stewards may always
    /// revoke. The subject may revoke only where the basis lets them.
    pub fn revoke(&self, policy_id: &str, actor: &str) -> Result<CapabilityPolicy> {
        let policy = self.require(policy_id)?;
        let now = self.clock.now();

        let permitted = if actor == policy.subject_id {
            policy.authority_basis.rules().revoked_by == RevocationInitiator::Subject
        } else {
            actor == policy.steward_id
                || self.holds_constitutional_grant(actor, &policy.subject_id, now)?
        };
        if !permitted {
            return Err(StewardshipError::UnauthorizedSteward {
                steward: actor.to_string(),
                reason: format!(
                    "may not revoke a {} policy for {}",
                    policy.authority_basis, policy.subject_id
                ),
            });
        }
        self.transition(policy_id, PolicyStatus::Revoked, None, &format!("revoked by {}", actor))
    }

    /// Revoke every live policy and grant held over a subject.
    pub fn disconnect(&self, subject_id: &str) -> Result<DisconnectReport> {
        let now = self.clock.now();
        let mut report = DisconnectReport::default();

        for policy in self.history(subject_id)? {
            if policy.status.is_enforceable() {
                match self.transition(&policy.id, PolicyStatus::Revoked, None, "subject disconnected") {
                    Ok(_) => report.policies_revoked += 1,
                    Err(StewardshipError::InvalidTransition(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        for grant in self.grants_for_subject(subject_id)? {
            if grant.delegated_from.is_none() && grant.status != GrantStatus::Revoked {
                report.grants_revoked += self.revoke_grant(&grant.id)?.len();
            }
        }

        let mut subject = self.register_subject(subject_id, None)?;
        subject.disconnected_at = Some(now);
        self.subjects
            .insert(subject_id.as_bytes(), rmp_serde::to_vec_named(&subject)?)?;

        self.audit.record_or_warn(
            subject_id,
            now,
            AuditEventKind::Disconnection {
                policies_revoked: report.policies_revoked,
                grants_revoked: report.grants_revoked,
            },
        );
        warn!(
            subject = %subject_id,
            policies = report.policies_revoked,
            grants = report.grants_revoked,
            "Subject disconnected from stewardship"
        );
        Ok(report)
    }

    // =========================================================================
    // Reviews
    // =========================================================================

    pub(crate) fn record_review(&self, record: &ReviewRecord) -> Result<()> {
        let seq = self.db.generate_id()?;
        let key = format!("{}\0{:020}", record.policy_id, seq);
        self.reviews
            .insert(key.as_bytes(), rmp_serde::to_vec_named(record)?)?;
        Ok(())
    }

    pub fn reviews_for(&self, policy_id: &str) -> Result<Vec<ReviewRecord>> {
        let prefix = format!("{}\0", policy_id);
        let mut out = Vec::new();
        for item in self.reviews.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            out.push(rmp_serde::from_slice(&value)?);
        }
        Ok(out)
    }
}

fn transition_allowed(from: PolicyStatus, to: PolicyStatus) -> bool {
    use PolicyStatus::*;
    matches!(
        (from, to),
        (Draft, Active)
            | (Active, UnderReview)
            | (Active, Expired)
            | (Active, Revoked)
            | (UnderReview, Active)
            | (UnderReview, Expired)
            | (UnderReview, Revoked)
    )
}

fn chain_key(subject_id: &str, version: u64) -> Vec<u8> {
    format!("{}\0{:020}", subject_id, version).into_bytes()
}

fn decode_version(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(buf)
}

fn abort<E: Into<StewardshipError>>(e: E) -> ConflictableTransactionError<StewardshipError> {
    ConflictableTransactionError::Abort(e.into())
}

/// Midnight UTC on the subject's `age`th birthday. Feb 29 births roll to Mar 1.
fn birthday(dob: NaiveDate, age: u32) -> Option<DateTime<Utc>> {
    let year = dob.year() + age as i32;
    let date = dob
        .with_year(year)
        .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1))?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}
