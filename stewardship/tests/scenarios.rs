//! End-to-end stewardship scenarios through the engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Months, Utc};
use tempfile::TempDir;

use stewardship::config::ReviewerConfig;
use stewardship::reviewer::ReviewEvidence;
use stewardship::{
    Appeal, AppealOrigin, AppealOutcome, AppealState, AuthorityBasis, Capability, Clock, EvidenceTier,
    Evidence, GrantRequest, GrantScope, InMemoryRelationshipGraph, LimitParams, ManualClock,
    PolicyDraft, PolicyRule, PolicyStatus, ProportionalityReviewer, RelationshipEdge,
    ReviewOutcome, RuleBasedReviewer, Ruling, StewardTier, StewardshipConfig, StewardshipEngine,
    StewardshipError, WeightClass,
};

struct Harness {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    graph: Arc<InMemoryRelationshipGraph>,
    engine: StewardshipEngine,
}

fn harness_with(reviewer: Arc<dyn ProportionalityReviewer>) -> Harness {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let graph = Arc::new(InMemoryRelationshipGraph::new());
    let engine = StewardshipEngine::open(
        dir.path(),
        StewardshipConfig::default(),
        clock.clone(),
        graph.clone(),
        reviewer,
    )
    .unwrap();
    Harness {
        _dir: dir,
        clock,
        graph,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(RuleBasedReviewer::new(
        "reference-reviewer",
        ReviewerConfig::default(),
    )))
}

/// Leaves every appeal in arbitration until decided by hand.
struct PanelReviewer;

#[async_trait]
impl ProportionalityReviewer for PanelReviewer {
    fn id(&self) -> &str {
        "panel"
    }

    async fn review(
        &self,
        _appeal: &Appeal,
        _evidence: &ReviewEvidence,
    ) -> Result<Option<Ruling>, StewardshipError> {
        Ok(None)
    }
}

fn org_policy(h: &Harness, subject: &str, rules: Vec<PolicyRule>) -> stewardship::CapabilityPolicy {
    let now = h.clock.now();
    h.engine
        .store()
        .grant(GrantRequest {
            steward_id: "coop-board".to_string(),
            subject_id: subject.to_string(),
            basis: AuthorityBasis::OrganizationalRole,
            evidence: Evidence::new(EvidenceTier::SelfAssertion, "membership", now),
            scope: GrantScope::All,
            tier: StewardTier::Coordinator,
            delegatable: false,
            expires_at: None,
        })
        .unwrap();
    h.engine
        .store()
        .commit(PolicyDraft {
            subject_id: subject.to_string(),
            steward_id: "coop-board".to_string(),
            authority_basis: AuthorityBasis::OrganizationalRole,
            rules,
            evidence: Evidence::new(EvidenceTier::SelfAssertion, "conduct-report", now),
            effective_start: None,
            review_due: None,
            effective_end: None,
            expected_version: 0,
            restrictions: Default::default(),
        })
        .unwrap()
}

fn concern(subject: &str, supporter: &str, class: WeightClass) -> RelationshipEdge {
    RelationshipEdge {
        subject_id: subject.to_string(),
        supporter_id: supporter.to_string(),
        weight_class: class,
        flagging_concern: true,
        flagged_at: Some(Utc::now()),
    }
}

#[tokio::test]
async fn community_trigger_fires_at_eleven() {
    let h = harness();
    for (supporter, class) in [
        ("ana", WeightClass::Intimate),
        ("ben", WeightClass::Intimate),
        ("cy", WeightClass::Trusted),
        ("dee", WeightClass::Trusted),
        ("eli", WeightClass::Familiar),
    ] {
        h.graph.record(concern("quinn", supporter, class));
    }

    let case = h.engine.triggers().evaluate_trigger("quinn").await.unwrap().unwrap();
    assert!((case.total_weight - 11.0).abs() < 1e-9);
    assert_eq!(case.contributors.len(), 5);

    h.engine.tick().await;
    let appeals = h.engine.appeals().appeals_for_subject("quinn");
    assert_eq!(appeals.len(), 1);
    assert_eq!(appeals[0].respondent.as_deref(), Some("quinn"));
    assert!(matches!(
        appeals[0].origin,
        AppealOrigin::ConsensusTrigger { supporters: 5, .. }
    ));
}

#[tokio::test]
async fn community_trigger_holds_at_six_and_a_half() {
    let h = harness();
    for (supporter, class) in [
        ("ana", WeightClass::Trusted),
        ("ben", WeightClass::Trusted),
        ("cy", WeightClass::Familiar),
        ("dee", WeightClass::Familiar),
        ("eli", WeightClass::Acquaintance),
    ] {
        h.graph.record(concern("quinn", supporter, class));
    }

    assert!(h.engine.triggers().evaluate_trigger("quinn").await.unwrap().is_none());
    let report = h.engine.tick().await;
    assert_eq!(report.consensus_cases, 0);
    assert!(h.engine.appeals().appeals_for_subject("quinn").is_empty());
}

#[tokio::test]
async fn consensus_case_survives_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let graph = Arc::new(InMemoryRelationshipGraph::new());
    for supporter in ["ana", "ben", "cy", "dee"] {
        graph.record(concern("quinn", supporter, WeightClass::Intimate));
    }
    let open = || {
        StewardshipEngine::open(
            dir.path(),
            StewardshipConfig::default(),
            clock.clone(),
            graph.clone(),
            Arc::new(RuleBasedReviewer::new("reference-reviewer", ReviewerConfig::default())),
        )
        .unwrap()
    };

    {
        let engine = open();
        assert_eq!(engine.tick().await.consensus_cases, 1);
        engine.store().db().flush().unwrap();
    }

    let engine = open();
    engine.tick().await;
    assert_eq!(engine.appeals().appeals_for_subject("quinn").len(), 1);
    let fired = engine
        .store()
        .audit()
        .for_subject("quinn")
        .unwrap()
        .into_iter()
        .filter(|e| e.event.as_str() == "trigger_fired")
        .count();
    assert_eq!(fired, 1);
}

#[tokio::test]
async fn upheld_case_does_not_refire_while_concern_stands() {
    let h = harness();
    for supporter in ["ana", "ben", "cy", "dee"] {
        h.graph.record(concern("quinn", supporter, WeightClass::Intimate));
    }
    h.engine.tick().await;
    h.clock.advance(Duration::days(8));
    h.engine.tick().await;
    h.clock.advance(Duration::days(8));
    h.engine.tick().await;

    let appeals = h.engine.appeals().appeals_for_subject("quinn");
    assert_eq!(appeals.len(), 1);
    assert_eq!(appeals[0].state, AppealState::Resolved);
    assert_eq!(appeals[0].decision.as_ref().unwrap().outcome, AppealOutcome::Upheld);

    let report = h.engine.tick().await;
    assert_eq!(report.cases_closed, 0);
    assert_eq!(h.engine.appeals().appeals_for_subject("quinn").len(), 1);

    // Concern withdrawn: the settled case closes
    h.graph.remove_agent("ana");
    h.graph.remove_agent("ben");
    let report = h.engine.tick().await;
    assert_eq!(report.cases_closed, 1);
    assert!(h.engine.triggers().open_case("quinn").is_none());
}

#[tokio::test]
async fn minor_ages_into_autonomy() {
    let h = harness();
    let now = h.clock.now();
    // Turns eighteen in about a month
    let dob = now.date_naive().checked_sub_months(Months::new(18 * 12)).unwrap() + Duration::days(30);
    let store = h.engine.store();
    store.register_subject("mika", Some(dob)).unwrap();
    store
        .grant(GrantRequest {
            steward_id: "parent".to_string(),
            subject_id: "mika".to_string(),
            basis: AuthorityBasis::MinorGuardianship,
            evidence: Evidence::new(EvidenceTier::ProfessionalAttestation, "birth-record", now),
            scope: GrantScope::All,
            tier: StewardTier::Guardian,
            delegatable: false,
            expires_at: None,
        })
        .unwrap();

    let draft = PolicyDraft {
        subject_id: "mika".to_string(),
        steward_id: "parent".to_string(),
        authority_basis: AuthorityBasis::MinorGuardianship,
        rules: vec![PolicyRule::disable(Capability::DirectMessage)],
        evidence: Evidence::new(EvidenceTier::ProfessionalAttestation, "school-report", now),
        effective_start: None,
        review_due: None,
        effective_end: None,
        expected_version: 0,
        restrictions: Default::default(),
    };
    let policy = store.commit(draft.clone()).unwrap();
    assert!(policy.review_due.unwrap() <= now + Duration::days(31));
    assert!(h
        .engine
        .check("mika", "direct_message", &LimitParams::new())
        .unwrap()
        .is_deny());

    h.clock.advance(Duration::days(40));

    assert!(h
        .engine
        .check("mika", "direct_message", &LimitParams::new())
        .unwrap()
        .is_allow());
    assert_eq!(store.current("mika").unwrap().unwrap().status, PolicyStatus::Expired);

    let mut again = draft;
    again.expected_version = 1;
    again.evidence.recorded_at = h.clock.now();
    assert!(matches!(
        store.commit(again),
        Err(StewardshipError::AuthorityLapsed(_))
    ));

    let fresh = Evidence::new(EvidenceTier::ProfessionalAttestation, "late-review", h.clock.now());
    assert!(matches!(
        h.engine
            .scheduler()
            .complete_review(&policy.id, ReviewOutcome::Renewed, Some(fresh)),
        Err(StewardshipError::AuthorityLapsed(_))
    ));
    let expired = h
        .engine
        .scheduler()
        .complete_review(&policy.id, ReviewOutcome::Expired, None)
        .unwrap();
    assert_eq!(expired.status, PolicyStatus::Expired);
}

#[tokio::test]
async fn missed_rebuttal_goes_to_arbitration() {
    let h = harness_with(Arc::new(PanelReviewer));
    let policy = org_policy(&h, "sol", vec![PolicyRule::disable(Capability::Post)]);
    let appeals = h.engine.appeals();

    let id = appeals.file_appeal("sol", &policy.id, "one complaint is not a pattern");
    let appeal = appeals.advance(&id).await.unwrap();
    assert_eq!(appeal.state, AppealState::ResponseWindow);
    assert!(appeal.response_deadline.is_some());

    // Window still open: nothing moves
    h.clock.advance(Duration::days(3));
    assert_eq!(appeals.advance(&id).await.unwrap().state, AppealState::ResponseWindow);

    h.clock.advance(Duration::days(5));
    let appeal = appeals.advance(&id).await.unwrap();
    assert_eq!(appeal.state, AppealState::Arbitration);
    let rebuttal = appeal.rebuttal.unwrap();
    assert!(rebuttal.defaulted);
    assert!(rebuttal.submitted_by.is_none());

    // The restriction still binds while arbitration is pending
    assert!(h.engine.check("sol", "post", &LimitParams::new()).unwrap().is_deny());

    let decided = appeals
        .decide(&id, "panel", Ruling::new(AppealOutcome::Overturned, "no rebuttal offered"))
        .unwrap();
    assert_eq!(decided.state, AppealState::Decision);
    assert_eq!(
        h.engine.store().require(&policy.id).unwrap().status,
        PolicyStatus::Revoked
    );
    assert!(h.engine.check("sol", "post", &LimitParams::new()).unwrap().is_allow());
}

#[tokio::test]
async fn only_the_configured_reviewer_decides() {
    let h = harness_with(Arc::new(PanelReviewer));
    let policy = org_policy(&h, "sol", vec![PolicyRule::disable(Capability::Post)]);
    let appeals = h.engine.appeals();
    let id = appeals.file_appeal("sol", &policy.id, "too broad");
    appeals.advance(&id).await.unwrap();
    h.clock.advance(Duration::days(8));
    assert_eq!(appeals.advance(&id).await.unwrap().state, AppealState::Arbitration);

    assert!(matches!(
        appeals.decide(&id, "coop-board", Ruling::new(AppealOutcome::Upheld, "fine")),
        Err(StewardshipError::UnauthorizedSteward { .. })
    ));
}

#[tokio::test]
async fn single_re_appeal() {
    let h = harness_with(Arc::new(PanelReviewer));
    let policy = org_policy(
        &h,
        "sol",
        vec![
            PolicyRule::disable(Capability::Post),
            PolicyRule::disable(Capability::Comment),
        ],
    );
    let appeals = h.engine.appeals();
    let first = appeals.file_appeal("sol", &policy.id, "too broad");

    appeals.advance(&first).await.unwrap();
    appeals
        .submit_rebuttal(&first, "coop-board", "repeated harassment in threads", None)
        .unwrap();
    assert_eq!(appeals.advance(&first).await.unwrap().state, AppealState::Arbitration);

    let decided = appeals
        .decide(
            &first,
            "panel",
            Ruling::new(
                AppealOutcome::Modified {
                    reinstated: vec![Capability::Comment],
                },
                "commenting was never the problem",
            ),
        )
        .unwrap();
    let successor = decided.decision.unwrap().successor_policy.unwrap();
    assert!(h.engine.check("sol", "comment", &LimitParams::new()).unwrap().is_allow());
    assert!(h.engine.check("sol", "post", &LimitParams::new()).unwrap().is_deny());

    let windowed = appeals.advance(&first).await.unwrap();
    assert_eq!(windowed.state, AppealState::MandatoryAppealWindow);
    assert!(windowed.re_appeal_available(h.clock.now()));

    let second = appeals.re_appeal(&first, "sol", "posting too").unwrap();
    let reappeal = appeals.require(&second).unwrap();
    assert_eq!(reappeal.policy_id.as_deref(), Some(successor.as_str()));
    assert_eq!(reappeal.prior_appeal.as_deref(), Some(first.as_str()));
    assert_eq!(appeals.require(&first).unwrap().state, AppealState::Resolved);

    // The original cannot be re-appealed twice
    assert!(matches!(
        appeals.re_appeal(&first, "sol", "again"),
        Err(StewardshipError::InvalidTransition(_))
    ));

    // Nor can the re-appeal itself
    appeals.advance(&second).await.unwrap();
    h.clock.advance(Duration::days(8));
    assert_eq!(appeals.advance(&second).await.unwrap().state, AppealState::Arbitration);
    appeals
        .decide(&second, "panel", Ruling::new(AppealOutcome::Upheld, "posting stays off"))
        .unwrap();
    assert_eq!(
        appeals.advance(&second).await.unwrap().state,
        AppealState::MandatoryAppealWindow
    );
    assert!(matches!(
        appeals.re_appeal(&second, "sol", "one more time"),
        Err(StewardshipError::InvalidTransition(_))
    ));

    h.clock.advance(Duration::days(8));
    assert_eq!(appeals.advance(&second).await.unwrap().state, AppealState::Resolved);
}

#[tokio::test]
async fn missed_review_fails_open() {
    let h = harness();
    org_policy(&h, "sol", vec![PolicyRule::disable(Capability::Vote)]);
    assert!(h.engine.check("sol", "vote", &LimitParams::new()).unwrap().is_deny());

    h.clock.advance(Duration::days(366));
    let due = h.engine.tick().await.reviews_due;
    assert_eq!(due.len(), 1);
    assert!(h.engine.check("sol", "vote", &LimitParams::new()).unwrap().is_allow());
}

#[tokio::test]
async fn two_stewards_racing_conflict() {
    let h = harness();
    org_policy(&h, "sol", vec![PolicyRule::disable(Capability::Post)]);
    let store = h.engine.store();
    store
        .grant(GrantRequest {
            steward_id: "moderator".to_string(),
            subject_id: "sol".to_string(),
            basis: AuthorityBasis::OrganizationalRole,
            evidence: Evidence::new(EvidenceTier::SelfAssertion, "moderator-role", h.clock.now()),
            scope: GrantScope::All,
            tier: StewardTier::Guardian,
            delegatable: false,
            expires_at: None,
        })
        .unwrap();

    let draft = |steward: &str, capability| PolicyDraft {
        subject_id: "sol".to_string(),
        steward_id: steward.to_string(),
        authority_basis: AuthorityBasis::OrganizationalRole,
        rules: vec![PolicyRule::disable(capability)],
        evidence: Evidence::new(EvidenceTier::SelfAssertion, "report", h.clock.now()),
        effective_start: None,
        review_due: None,
        effective_end: None,
        expected_version: 1,
        restrictions: Default::default(),
    };

    store.commit(draft("coop-board", Capability::Share)).unwrap();
    assert!(matches!(
        store.commit(draft("moderator", Capability::Download)),
        Err(StewardshipError::VersionConflict { expected: 1, actual: 2, .. })
    ));
    assert_eq!(store.history("sol").unwrap().len(), 2);
}

#[tokio::test]
async fn offline_cache_highest_version_wins() {
    let h = harness();
    let v1 = org_policy(&h, "sol", vec![PolicyRule::disable(Capability::Post)]);
    let cache = h.engine.cache();
    cache.track("sol");

    let report = h.engine.sync_cache().await;
    assert_eq!(report.applied, 1);
    assert_eq!(cache.local_version("sol"), 1);

    let v2 = h
        .engine
        .store()
        .commit(PolicyDraft {
            subject_id: "sol".to_string(),
            steward_id: "coop-board".to_string(),
            authority_basis: AuthorityBasis::OrganizationalRole,
            rules: vec![PolicyRule::disable(Capability::Share)],
            evidence: Evidence::new(EvidenceTier::SelfAssertion, "follow-up", h.clock.now()),
            effective_start: None,
            review_due: None,
            effective_end: None,
            expected_version: 1,
            restrictions: Default::default(),
        })
        .unwrap();
    h.engine.sync_cache().await;
    assert_eq!(cache.local_version("sol"), 2);

    // A second device pushes the stale copy it still holds
    assert!(!cache.apply(v1));
    assert_eq!(cache.local_version("sol"), v2.version);

    let post = h.engine.check_local("sol", "post", &LimitParams::new()).unwrap();
    assert!(post.decision.is_allow());
    let share = h.engine.check_local("sol", "share", &LimitParams::new()).unwrap();
    assert!(share.decision.is_deny());
    assert!(share.stale.is_none());
}

#[tokio::test]
async fn stale_cache_still_allows_inalienable() {
    let h = harness();
    org_policy(&h, "sol", vec![PolicyRule::disable(Capability::Post)]);
    h.engine.cache().track("sol");
    h.engine.sync_cache().await;

    h.clock.advance(Duration::days(2));
    let appeal = h
        .engine
        .check_local("sol", "file_appeal", &LimitParams::new())
        .unwrap();
    assert!(appeal.decision.is_allow());
    assert!(appeal.stale.is_some());

    let post = h.engine.check_local("sol", "post", &LimitParams::new()).unwrap();
    assert!(post.decision.is_deny());
    assert!(post.stale.is_some());
}

#[tokio::test]
async fn disconnection_revokes_everything_immediately() {
    let h = harness();
    org_policy(&h, "sol", vec![PolicyRule::disable(Capability::Post)]);
    h.engine.cache().track("sol");
    h.engine.sync_cache().await;

    let report = h.engine.request_disconnection("sol").unwrap();
    assert_eq!(report.policies_revoked, 1);
    assert_eq!(report.grants_revoked, 1);

    assert!(h.engine.check("sol", "post", &LimitParams::new()).unwrap().is_allow());
    assert!(h
        .engine
        .check_local("sol", "post", &LimitParams::new())
        .unwrap()
        .decision
        .is_allow());
}

#[tokio::test]
async fn audit_export_is_time_ordered() {
    let h = harness();
    let policy = org_policy(&h, "sol", vec![PolicyRule::disable(Capability::Post)]);
    h.clock.advance(Duration::minutes(5));
    h.engine.appeals().file_appeal("sol", &policy.id, "too broad");
    h.clock.advance(Duration::minutes(5));
    h.engine.check("sol", "post", &LimitParams::new()).unwrap();

    let events = h.engine.store().audit().export().unwrap();
    assert!(events.len() >= 3);
    assert!(events.windows(2).all(|w| w[0].at <= w[1].at));
}
