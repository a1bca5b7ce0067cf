//! Stewardship - Graduated capability policies for Elohim agents
//!
//! One party (a *steward*) holds bounded, time-limited and reviewable
//! authority over another party's (a *subject's*) feature access. A fixed set
//! of capabilities can never be restricted, every restriction is open to
//! appeal, and every restriction must be re-justified when its review date
//! comes round.
//!
//! ## Architecture
//!
//! ```text
//! steward action ──┐
//!                  ├──▶ PolicyStore ──▶ CapabilityEvaluator (online checks)
//! TriggerAggregator┘        │      └──▶ OfflineEnforcementCache (device checks)
//!   (consensus)             │
//!                           ├── ReviewScheduler (periodic re-justification)
//!                           └── AppealWorkflow ──▶ ProportionalityReviewer
//! ```
//!
//! | Component | Role |
//! |-----------|------|
//! | `registry` | Closed set of bases, evidence tiers, capabilities |
//! | `store` | Append-only policy chain, grants, subjects (sled) |
//! | `trigger` | Weighted community concern over the relationship graph |
//! | `evaluator` | allow / deny / limited per capability |
//! | `restrictions` | Content, time and monitoring layers merged across stewards |
//! | `scheduler` | Review outcomes: renew, tighten, loosen, expire, escalate |
//! | `appeal` | Due-process state machine |
//! | `cache` | Offline snapshot with highest-version-wins sync |
//! | `audit` | Append-only event log, exported in time order |
//! | `activity` | Monitored subject activity with retention |
//! | `engine` | Wiring plus the periodic sweep |
//!
//! ## Storage Layout
//!
//! ```text
//! <data_dir>/
//! ├── policies        # policy id -> CapabilityPolicy
//! ├── chain           # subject/version -> policy id
//! ├── heads           # subject -> latest version
//! ├── grants          # grant id -> StewardshipGrant
//! ├── subjects        # subject id -> Subject
//! ├── reviews         # policy id/seq -> ReviewRecord
//! ├── appeals         # appeal id -> Appeal
//! ├── trigger_cases   # subject id -> open TriggerCase
//! ├── offline_cache   # subject id -> Snapshot
//! ├── activity        # subject/seq -> ActivityEntry
//! └── audit           # seq -> AuditEvent
//! ```
//!
//! ## Features
//!
//! - `typescript` - Export wire types through ts-rs

pub mod registry;
pub mod error;
pub mod types;
pub mod clock;
pub mod config;
pub mod audit;
pub mod grant;
pub mod store;
pub mod graph;
pub mod trigger;
pub mod restrictions;
pub mod evaluator;
pub mod reviewer;
pub mod appeal;
pub mod scheduler;
pub mod cache;
pub mod activity;
pub mod engine;

// Re-exports
pub use activity::{ActivityEntry, ActivityLog, ActivityReport};
pub use appeal::{Appeal, AppealFiling, AppealKind, AppealOrigin, AppealState, AppealWorkflow, Rebuttal};
pub use audit::{AuditEvent, AuditEventKind, AuditLog};
pub use cache::{LocalDecision, OfflineEnforcementCache, PolicySource, StaleCache, SyncReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StewardshipConfig;
pub use engine::{ErasureReport, StewardshipEngine, TickReport};
pub use error::{Result, StewardshipError};
pub use evaluator::CapabilityEvaluator;
pub use grant::{DelegationRequest, GrantRequest, GrantScope, GrantStatus, StewardshipGrant};
pub use graph::{InMemoryRelationshipGraph, RelationshipEdge, RelationshipGraph, WeightClass};
pub use registry::{
    AuthorityBasis, Capability, CapabilityCategory, EvidenceTier, StewardTier,
    INALIENABLE_CAPABILITIES,
};
pub use restrictions::{
    AgeRating, ComputedRestrictions, ContentCheck, ContentRules, MonitoringRules, Restrictions,
    SessionUsage, StewardLayer, TimeRules, TimeWindow,
};
pub use reviewer::{AppealOutcome, ProportionalityReviewer, RuleBasedReviewer, Ruling};
pub use scheduler::ReviewScheduler;
pub use store::{DisconnectReport, PolicyStore};
pub use trigger::{TriggerAggregator, TriggerCase};
pub use types::{
    CapabilityPolicy, Decision, Evidence, LimitParams, PolicyDraft, PolicyRule, PolicyStatus,
    ReviewOutcome, RuleEffect, Selector, Subject,
};
