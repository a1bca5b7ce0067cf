//! Content, time and monitoring restrictions.
//!
//! Alongside capability rules a steward may attach a `Restrictions` block to
//! a policy: blocked content, usage time limits and activity monitoring. A
//! committed policy carries one `StewardLayer` per steward that currently
//! restricts the subject, and the layers are merged into a single
//! `ComputedRestrictions` whenever content or session access is checked.
//!
//! Merging only ever adds restriction. Blocked sets are unioned, maximums
//! take the lowest value, every layer's time windows must admit a moment for
//! it to be allowed, the longest cooldown applies, any layer can turn a log
//! on, retention is the longest asked for, and the subject sees their logs
//! only if every layer lets them.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[cfg(feature = "typescript")]
use ts_rs::TS;

use crate::registry::{Capability, CapabilityCategory, StewardTier};
use crate::types::{
    decide_against, AgentId, CapabilityPolicy, Decision, LimitParams, PolicyRule,
};

// =============================================================================
// Rules
// =============================================================================

/// Film-style content rating, least to most mature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub enum AgeRating {
    #[serde(rename = "G")]
    G,
    #[serde(rename = "PG")]
    Pg,
    #[serde(rename = "PG-13")]
    Pg13,
    #[serde(rename = "R")]
    R,
    #[serde(rename = "NC-17")]
    Nc17,
}

impl AgeRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::G => "G",
            Self::Pg => "PG",
            Self::Pg13 => "PG-13",
            Self::R => "R",
            Self::Nc17 => "NC-17",
        }
    }
}

impl fmt::Display for AgeRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(default)]
pub struct ContentRules {
    pub blocked_categories: BTreeSet<String>,
    /// Content hashes blocked outright
    pub blocked_hashes: BTreeSet<String>,
    pub age_rating_max: Option<AgeRating>,
    pub reach_level_max: Option<u8>,
}

impl ContentRules {
    pub fn is_empty(&self) -> bool {
        self.blocked_categories.is_empty()
            && self.blocked_hashes.is_empty()
            && self.age_rating_max.is_none()
            && self.reach_level_max.is_none()
    }

    fn merge(&mut self, other: &ContentRules) {
        self.blocked_categories
            .extend(other.blocked_categories.iter().cloned());
        self.blocked_hashes.extend(other.blocked_hashes.iter().cloned());
        self.age_rating_max = min_of(self.age_rating_max, other.age_rating_max);
        self.reach_level_max = min_of(self.reach_level_max, other.reach_level_max);
    }
}

/// A recurring span of the day in which use is allowed, in UTC.
///
/// A window whose end is before its start runs past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct TimeWindow {
    #[cfg_attr(feature = "typescript", ts(type = "string"))]
    pub start: NaiveTime,
    #[cfg_attr(feature = "typescript", ts(type = "string"))]
    pub end: NaiveTime,
    /// Days the window opens on; empty means every day
    #[serde(default)]
    #[cfg_attr(feature = "typescript", ts(type = "string[]"))]
    pub days: Vec<Weekday>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let time = at.time();
        let (in_window, opened_on) = if self.start <= self.end {
            (self.start <= time && time < self.end, at.weekday())
        } else if time >= self.start {
            (true, at.weekday())
        } else {
            // Early-morning tail of a window opened the day before
            (time < self.end, at.weekday().pred())
        };
        in_window && (self.days.is_empty() || self.days.contains(&opened_on))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(default)]
pub struct TimeRules {
    pub session_max_minutes: Option<u32>,
    pub daily_max_minutes: Option<u32>,
    /// Use is allowed only inside one of these, when any are given
    pub time_windows: Vec<TimeWindow>,
    /// Minimum break between sessions
    pub cooldown_minutes: Option<u32>,
}

impl TimeRules {
    pub fn is_empty(&self) -> bool {
        self.session_max_minutes.is_none()
            && self.daily_max_minutes.is_none()
            && self.time_windows.is_empty()
            && self.cooldown_minutes.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(default)]
pub struct MonitoringRules {
    pub log_sessions: bool,
    /// Aggregated categories, never individual items
    pub log_categories: bool,
    /// Blocks and other policy events
    pub log_policy_events: bool,
    pub retention_days: u32,
    pub subject_can_view: bool,
}

impl Default for MonitoringRules {
    fn default() -> Self {
        Self {
            log_sessions: false,
            log_categories: false,
            log_policy_events: false,
            retention_days: 0,
            subject_can_view: true,
        }
    }
}

impl MonitoringRules {
    /// Whether any kind of activity is logged.
    pub fn is_enabled(&self) -> bool {
        self.log_sessions || self.log_categories || self.log_policy_events
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn merge(&mut self, other: &MonitoringRules) {
        self.log_sessions |= other.log_sessions;
        self.log_categories |= other.log_categories;
        self.log_policy_events |= other.log_policy_events;
        self.retention_days = self.retention_days.max(other.retention_days);
        self.subject_can_view &= other.subject_can_view;
    }
}

/// Restrictions one steward places on a subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(default)]
pub struct Restrictions {
    pub content: ContentRules,
    pub time: TimeRules,
    pub monitoring: MonitoringRules,
}

impl Restrictions {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.time.is_empty() && self.monitoring.is_empty()
    }

    /// Rules standing in for these restrictions when checking a grant's scope.
    ///
    /// Content rules need authority over the content category and time rules
    /// over session time. Monitoring needs only a restricting tier.
    pub fn scope_rules(&self) -> Vec<PolicyRule> {
        let mut rules = Vec::new();
        if !self.content.is_empty() {
            rules.push(PolicyRule::disable_category(CapabilityCategory::Content));
        }
        if !self.time.is_empty() {
            rules.push(PolicyRule::disable(Capability::SessionTime));
        }
        rules
    }
}

/// One steward's restrictions as carried by a committed policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct StewardLayer {
    pub steward_id: AgentId,
    pub tier: StewardTier,
    #[serde(flatten)]
    pub restrictions: Restrictions,
}

// =============================================================================
// Merge
// =============================================================================

/// Every layer's restrictions folded into one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ComputedRestrictions {
    /// Contributing stewards, highest tier first
    pub stewards: Vec<AgentId>,
    pub content: ContentRules,
    pub session_max_minutes: Option<u32>,
    pub daily_max_minutes: Option<u32>,
    /// One set per layer that restricts hours; a moment must fall in every set
    pub window_sets: Vec<Vec<TimeWindow>>,
    pub cooldown_minutes: Option<u32>,
    pub monitoring: MonitoringRules,
}

impl ComputedRestrictions {
    pub fn merge(layers: &[StewardLayer]) -> Self {
        let mut ordered: Vec<&StewardLayer> = layers.iter().collect();
        ordered.sort_by(|a, b| {
            b.tier
                .cmp(&a.tier)
                .then_with(|| a.steward_id.cmp(&b.steward_id))
        });

        let mut merged = Self::default();
        for layer in ordered {
            let r = &layer.restrictions;
            merged.stewards.push(layer.steward_id.clone());
            merged.content.merge(&r.content);
            merged.session_max_minutes =
                min_of(merged.session_max_minutes, r.time.session_max_minutes);
            merged.daily_max_minutes = min_of(merged.daily_max_minutes, r.time.daily_max_minutes);
            if !r.time.time_windows.is_empty() {
                merged.window_sets.push(r.time.time_windows.clone());
            }
            merged.cooldown_minutes = merged.cooldown_minutes.max(r.time.cooldown_minutes);
            merged.monitoring.merge(&r.monitoring);
        }
        merged
    }

    /// Merged restrictions of the policy, or none when it does not bind.
    pub fn for_policy(policy: Option<&CapabilityPolicy>, now: DateTime<Utc>) -> Self {
        match policy.filter(|p| p.in_effect(now)) {
            Some(policy) => Self::merge(&policy.layers),
            None => Self::default(),
        }
    }

    pub fn within_hours(&self, at: DateTime<Utc>) -> bool {
        self.window_sets
            .iter()
            .all(|set| set.iter().any(|w| w.contains(at)))
    }

    /// Why this content is blocked, if it is.
    pub fn content_block(&self, check: &ContentCheck) -> Option<String> {
        let content = &self.content;
        if content.blocked_hashes.contains(&check.content_hash) {
            return Some("content is blocked".to_string());
        }
        if let Some(category) = check
            .categories
            .iter()
            .find(|c| content.blocked_categories.contains(*c))
        {
            return Some(format!("category '{}' is blocked", category));
        }
        if let (Some(max), Some(rating)) = (content.age_rating_max, check.age_rating) {
            if rating > max {
                return Some(format!("content rating '{}' exceeds allowed '{}'", rating, max));
            }
        }
        if let (Some(max), Some(reach)) = (content.reach_level_max, check.reach_level) {
            if reach > max {
                return Some(format!("content reach level {} exceeds allowed {}", reach, max));
            }
        }
        None
    }
}

fn min_of<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

// =============================================================================
// Checks
// =============================================================================

/// Content the subject is about to open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ContentCheck {
    pub content_hash: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub age_rating: Option<AgeRating>,
    #[serde(default)]
    pub reach_level: Option<u8>,
}

/// Usage so far, as reported by the subject's device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(default)]
pub struct SessionUsage {
    pub session_minutes: u32,
    pub daily_minutes: u32,
    /// None when there was no earlier session today
    pub minutes_since_last_session: Option<u32>,
}

/// Decide whether content may be opened under a policy.
///
/// A disabled `content_access` capability blocks everything before the
/// content rules are consulted.
pub fn decide_content(
    policy: Option<&CapabilityPolicy>,
    check: &ContentCheck,
    now: DateTime<Utc>,
) -> Decision {
    let access = decide_against(policy, Capability::ContentAccess, &LimitParams::new(), now);
    if access.is_deny() {
        return access;
    }
    let Some(policy) = policy.filter(|p| p.in_effect(now)) else {
        return Decision::Allow;
    };
    match ComputedRestrictions::merge(&policy.layers).content_block(check) {
        Some(reason) => Decision::Deny {
            reason,
            policy: policy.reference(),
        },
        None => access,
    }
}

/// Decide whether a session may continue under a policy.
///
/// Allowed sessions under a time limit come back `limited` with the minutes
/// left, so the subject can always see how much time remains.
pub fn decide_session(
    policy: Option<&CapabilityPolicy>,
    usage: &SessionUsage,
    now: DateTime<Utc>,
) -> Decision {
    let capability = decide_against(policy, Capability::SessionTime, &LimitParams::new(), now);
    if capability.is_deny() {
        return capability;
    }
    let Some(policy) = policy.filter(|p| p.in_effect(now)) else {
        return Decision::Allow;
    };
    let merged = ComputedRestrictions::merge(&policy.layers);
    let deny = |reason: String| Decision::Deny {
        reason,
        policy: policy.reference(),
    };

    if !merged.within_hours(now) {
        return deny(format!("outside permitted hours at {}", now.format("%H:%M")));
    }
    if let (Some(cooldown), Some(since)) =
        (merged.cooldown_minutes, usage.minutes_since_last_session)
    {
        if since < cooldown {
            return deny(format!("cooldown: {} minutes until the next session", cooldown - since));
        }
    }

    let mut params = match capability {
        Decision::Limited { params, .. } => params,
        _ => LimitParams::new(),
    };
    if let Some(max) = merged.session_max_minutes {
        if usage.session_minutes >= max {
            return deny(format!("session limit of {} minutes reached", max));
        }
        params = params.with("session_minutes_remaining", (max - usage.session_minutes) as u64);
    }
    if let Some(max) = merged.daily_max_minutes {
        if usage.daily_minutes >= max {
            return deny(format!("daily limit of {} minutes reached", max));
        }
        params = params.with("daily_minutes_remaining", (max - usage.daily_minutes) as u64);
    }
    if params.is_empty() {
        return Decision::Allow;
    }
    Decision::Limited {
        params,
        reason: format!(
            "session time is limited by a {} policy (version {})",
            policy.authority_basis, policy.version
        ),
        policy: policy.reference(),
    }
}

/// When a session allowed now will next be cut off by the time windows.
pub fn next_window_close(
    merged: &ComputedRestrictions,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if merged.window_sets.is_empty() || !merged.within_hours(now) {
        return None;
    }
    // Minute resolution over the coming day
    (1..=24 * 60)
        .map(|m| now + Duration::minutes(m))
        .find(|at| !merged.within_hours(*at))
}
