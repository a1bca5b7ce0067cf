//! Relationship graph used by the consensus trigger.
//!
//! The graph itself lives outside this crate; `RelationshipGraph` is the
//! read boundary the trigger consumes. `InMemoryRelationshipGraph` backs the
//! node's `/relationships` endpoint and the tests.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[cfg(feature = "typescript")]
use ts_rs::TS;

use crate::error::StewardshipError;
use crate::types::AgentId;

/// Closeness of a supporter to the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum WeightClass {
    Public,
    Acquaintance,
    Familiar,
    Trusted,
    Intimate,
}

impl WeightClass {
    pub fn weight(&self) -> f64 {
        match self {
            Self::Intimate => 3.0,
            Self::Trusted => 2.0,
            Self::Familiar => 1.0,
            Self::Acquaintance => 0.5,
            Self::Public => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intimate => "intimate",
            Self::Trusted => "trusted",
            Self::Familiar => "familiar",
            Self::Acquaintance => "acquaintance",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for WeightClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeightClass {
    type Err = StewardshipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intimate" => Ok(Self::Intimate),
            "trusted" => Ok(Self::Trusted),
            "familiar" => Ok(Self::Familiar),
            "acquaintance" => Ok(Self::Acquaintance),
            "public" => Ok(Self::Public),
            other => Err(StewardshipError::InvalidDraft(format!(
                "unknown weight class '{}'",
                other
            ))),
        }
    }
}

/// A supporter's relationship to a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct RelationshipEdge {
    pub subject_id: AgentId,
    pub supporter_id: AgentId,
    pub weight_class: WeightClass,
    /// Whether the supporter currently flags concern about the subject
    pub flagging_concern: bool,
    pub flagged_at: Option<DateTime<Utc>>,
}

/// Read access to relationship data.
#[async_trait]
pub trait RelationshipGraph: Send + Sync {
    /// Edges currently flagging concern about `subject_id`.
    async fn concern_edges(&self, subject_id: &str) -> Result<Vec<RelationshipEdge>, StewardshipError>;

    /// Subjects with at least one concern flag.
    async fn flagged_subjects(&self) -> Result<Vec<AgentId>, StewardshipError>;

    /// Check if the graph can be read.
    async fn is_available(&self) -> bool;

    /// Remove every edge touching `agent_id`. Returns the number removed.
    async fn erase_agent(&self, agent_id: &str) -> Result<usize, StewardshipError>;
}

/// In-process relationship graph.
#[derive(Default)]
pub struct InMemoryRelationshipGraph {
    /// subject -> supporter -> edge
    edges: DashMap<AgentId, DashMap<AgentId, RelationshipEdge>>,
    unavailable: AtomicBool,
}

impl InMemoryRelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the edge between `supporter_id` and `subject_id`.
    pub fn record(&self, edge: RelationshipEdge) {
        self.edges
            .entry(edge.subject_id.clone())
            .or_default()
            .insert(edge.supporter_id.clone(), edge);
    }

    /// Set or clear a supporter's concern flag. Returns false if no edge exists.
    pub fn flag(&self, subject_id: &str, supporter_id: &str, concern: bool, at: DateTime<Utc>) -> bool {
        let Some(supporters) = self.edges.get(subject_id) else {
            return false;
        };
        let Some(mut edge) = supporters.get_mut(supporter_id) else {
            return false;
        };
        edge.flagging_concern = concern;
        edge.flagged_at = concern.then_some(at);
        true
    }

    /// Drop every edge touching `agent_id`. Returns the number removed.
    pub fn remove_agent(&self, agent_id: &str) -> usize {
        let mut removed = self
            .edges
            .remove(agent_id)
            .map(|(_, supporters)| supporters.len())
            .unwrap_or(0);
        for supporters in self.edges.iter() {
            if supporters.remove(agent_id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Simulate the backing graph going away.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelationshipGraph for InMemoryRelationshipGraph {
    async fn concern_edges(&self, subject_id: &str) -> Result<Vec<RelationshipEdge>, StewardshipError> {
        if !self.is_available().await {
            return Err(StewardshipError::TriggerDataUnavailable(
                "relationship graph is offline".to_string(),
            ));
        }
        Ok(self
            .edges
            .get(subject_id)
            .map(|supporters| {
                supporters
                    .iter()
                    .filter(|e| e.flagging_concern)
                    .map(|e| e.value().clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn flagged_subjects(&self) -> Result<Vec<AgentId>, StewardshipError> {
        if !self.is_available().await {
            return Err(StewardshipError::TriggerDataUnavailable(
                "relationship graph is offline".to_string(),
            ));
        }
        let mut subjects: Vec<AgentId> = self
            .edges
            .iter()
            .filter(|entry| entry.value().iter().any(|e| e.flagging_concern))
            .map(|entry| entry.key().clone())
            .collect();
        subjects.sort();
        Ok(subjects)
    }

    async fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn erase_agent(&self, agent_id: &str) -> Result<usize, StewardshipError> {
        Ok(self.remove_agent(agent_id))
    }
}
