//! Weighted consensus trigger.
//!
//! Community-initiated stewardship starts only once enough weighted concern
//! has accumulated around a subject. Each supporter counts once, at the
//! heaviest class they hold, so a crowd of distant accounts cannot stand in
//! for a handful of close relationships.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, info};

use crate::audit::{AuditEventKind, AuditLog};
use crate::clock::Clock;
use crate::error::{Result, StewardshipError};
use crate::graph::{RelationshipEdge, RelationshipGraph, WeightClass};
use crate::types::AgentId;

/// One supporter's share of a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub supporter_id: AgentId,
    pub weight_class: WeightClass,
    pub weight: f64,
}

/// A stewardship case opened by consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCase {
    pub case_id: String,
    pub subject_id: AgentId,
    pub total_weight: f64,
    pub threshold: f64,
    pub contributors: Vec<Contribution>,
    pub opened_at: DateTime<Utc>,
}

/// Sum of weights, one contribution per supporter.
pub fn weigh(subject_id: &str, edges: &[RelationshipEdge]) -> (f64, Vec<Contribution>) {
    let mut strongest: BTreeMap<&str, WeightClass> = BTreeMap::new();
    for edge in edges.iter().filter(|e| e.flagging_concern && e.supporter_id != subject_id) {
        strongest
            .entry(edge.supporter_id.as_str())
            .and_modify(|class| *class = (*class).max(edge.weight_class))
            .or_insert(edge.weight_class);
    }
    let contributors: Vec<Contribution> = strongest
        .into_iter()
        .map(|(supporter, class)| Contribution {
            supporter_id: supporter.to_string(),
            weight_class: class,
            weight: class.weight(),
        })
        .collect();
    let total: f64 = contributors.iter().map(|c| c.weight).sum();
    (total, contributors)
}

/// Opens consensus cases. Open cases are persisted per subject so a restart
/// does not fire the same concern twice.
pub struct TriggerAggregator {
    graph: Arc<dyn RelationshipGraph>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    threshold: f64,
    open: DashMap<AgentId, TriggerCase>,
    tree: Tree,
}

impl TriggerAggregator {
    /// Open the aggregator, restoring cases still open from a previous run.
    pub fn open(
        db: &Db,
        graph: Arc<dyn RelationshipGraph>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        threshold: f64,
    ) -> Result<Self> {
        let tree = db.open_tree("trigger_cases")?;
        let open = DashMap::new();
        for item in tree.iter() {
            let (_, value) = item?;
            let case: TriggerCase = rmp_serde::from_slice(&value)?;
            open.insert(case.subject_id.clone(), case);
        }
        debug!(cases = open.len(), "Restored open trigger cases");
        Ok(Self {
            graph,
            audit,
            clock,
            threshold,
            open,
            tree,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Evaluate accumulated concern for a subject.
    ///
    /// Fails closed: without graph data no case is opened.
    pub async fn evaluate_trigger(&self, subject_id: &str) -> Result<Option<TriggerCase>> {
        if let Some(case) = self.open.get(subject_id) {
            return Ok(Some(case.clone()));
        }

        let edges = self.graph.concern_edges(subject_id).await.map_err(|e| match e {
            StewardshipError::TriggerDataUnavailable(_) => e,
            other => StewardshipError::TriggerDataUnavailable(other.to_string()),
        })?;
        let (total, contributors) = weigh(subject_id, &edges);
        debug!(subject = %subject_id, total, threshold = self.threshold, "Evaluated consensus");

        if total < self.threshold {
            return Ok(None);
        }

        match self.open.entry(subject_id.to_string()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                let now = self.clock.now();
                let case = TriggerCase {
                    case_id: format!("case-{}", uuid::Uuid::new_v4()),
                    subject_id: subject_id.to_string(),
                    total_weight: total,
                    threshold: self.threshold,
                    contributors,
                    opened_at: now,
                };
                self.tree
                    .insert(subject_id.as_bytes(), rmp_serde::to_vec_named(&case)?)?;
                self.audit.record(
                    subject_id,
                    now,
                    AuditEventKind::TriggerFired {
                        case_id: case.case_id.clone(),
                        total_weight: total,
                        threshold: self.threshold,
                        contributors: case.contributors.clone(),
                    },
                )?;
                info!(
                    subject = %subject_id,
                    case = %case.case_id,
                    total,
                    supporters = case.contributors.len(),
                    "Consensus threshold crossed"
                );
                slot.insert(case.clone());
                Ok(Some(case))
            }
        }
    }

    /// Evaluate every subject the graph reports as flagged.
    pub async fn evaluate_all(&self) -> Result<Vec<TriggerCase>> {
        let mut cases = Vec::new();
        for subject in self.graph.flagged_subjects().await? {
            if let Some(case) = self.evaluate_trigger(&subject).await? {
                cases.push(case);
            }
        }
        Ok(cases)
    }

    /// Weighted concern currently standing against a subject.
    pub async fn current_weight(&self, subject_id: &str) -> Result<f64> {
        let edges = self.graph.concern_edges(subject_id).await?;
        Ok(weigh(subject_id, &edges).0)
    }

    pub fn open_case(&self, subject_id: &str) -> Option<TriggerCase> {
        self.open.get(subject_id).map(|c| c.clone())
    }

    pub fn open_cases(&self) -> Vec<TriggerCase> {
        let mut cases: Vec<TriggerCase> = self.open.iter().map(|c| c.clone()).collect();
        cases.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        cases
    }

    /// Close a subject's case so concern can be evaluated afresh.
    pub fn close_case(&self, subject_id: &str) -> Result<Option<TriggerCase>> {
        self.tree.remove(subject_id.as_bytes())?;
        Ok(self.open.remove(subject_id).map(|(_, case)| case))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::graph::InMemoryRelationshipGraph;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<InMemoryRelationshipGraph>, AuditLog, TriggerAggregator) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let audit = AuditLog::open(&db).unwrap();
        let graph = Arc::new(InMemoryRelationshipGraph::new());
        let aggregator =
            TriggerAggregator::open(&db, graph.clone(), audit.clone(), Arc::new(SystemClock), 10.0).unwrap();
        (dir, graph, audit, aggregator)
    }

    fn flag(graph: &InMemoryRelationshipGraph, supporter: &str, class: WeightClass) {
        graph.record(RelationshipEdge {
            subject_id: "sam".to_string(),
            supporter_id: supporter.to_string(),
            weight_class: class,
            flagging_concern: true,
            flagged_at: Some(Utc::now()),
        });
    }

    #[tokio::test]
    async fn test_fires_at_eleven() {
        let (_dir, graph, audit, aggregator) = setup();
        flag(&graph, "a", WeightClass::Intimate);
        flag(&graph, "b", WeightClass::Intimate);
        flag(&graph, "c", WeightClass::Intimate);
        flag(&graph, "d", WeightClass::Trusted);

        let case = aggregator.evaluate_trigger("sam").await.unwrap().unwrap();
        assert_eq!(case.total_weight, 11.0);
        assert_eq!(case.contributors.len(), 4);
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_does_not_fire_at_six_and_a_half() {
        let (_dir, graph, audit, aggregator) = setup();
        flag(&graph, "a", WeightClass::Trusted);
        flag(&graph, "b", WeightClass::Trusted);
        for s in ["c", "d", "e", "f", "g"] {
            flag(&graph, s, WeightClass::Acquaintance);
        }
        assert!(aggregator.evaluate_trigger("sam").await.unwrap().is_none());
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_public_crowd_cannot_substitute() {
        let (_dir, graph, _audit, aggregator) = setup();
        for i in 0..99 {
            flag(&graph, &format!("stranger-{}", i), WeightClass::Public);
        }
        assert!(aggregator.evaluate_trigger("sam").await.unwrap().is_none());
    }

    #[test]
    fn test_supporter_counted_once_at_strongest_class() {
        let edge = |class| RelationshipEdge {
            subject_id: "sam".to_string(),
            supporter_id: "a".to_string(),
            weight_class: class,
            flagging_concern: true,
            flagged_at: None,
        };
        let (total, contributors) = weigh("sam", &[edge(WeightClass::Familiar), edge(WeightClass::Intimate)]);
        assert_eq!(total, 3.0);
        assert_eq!(contributors.len(), 1);
    }

    #[tokio::test]
    async fn test_open_case_is_idempotent() {
        let (_dir, graph, audit, aggregator) = setup();
        for s in ["a", "b", "c", "d"] {
            flag(&graph, s, WeightClass::Intimate);
        }
        let first = aggregator.evaluate_trigger("sam").await.unwrap().unwrap();
        let second = aggregator.evaluate_trigger("sam").await.unwrap().unwrap();
        assert_eq!(first.case_id, second.case_id);
        assert_eq!(audit.len(), 1);

        aggregator.close_case("sam").unwrap();
        let third = aggregator.evaluate_trigger("sam").await.unwrap().unwrap();
        assert_ne!(first.case_id, third.case_id);
        assert_eq!(audit.len(), 2);
    }

    #[tokio::test]
    async fn test_open_case_survives_restart() {
        let dir = TempDir::new().unwrap();
        let graph = Arc::new(InMemoryRelationshipGraph::new());
        for s in ["a", "b", "c", "d"] {
            flag(&graph, s, WeightClass::Intimate);
        }
        let first = {
            let db = sled::open(dir.path()).unwrap();
            let audit = AuditLog::open(&db).unwrap();
            let aggregator =
                TriggerAggregator::open(&db, graph.clone(), audit, Arc::new(SystemClock), 10.0).unwrap();
            let case = aggregator.evaluate_trigger("sam").await.unwrap().unwrap();
            db.flush().unwrap();
            case
        };

        let db = sled::open(dir.path()).unwrap();
        let audit = AuditLog::open(&db).unwrap();
        let aggregator =
            TriggerAggregator::open(&db, graph.clone(), audit.clone(), Arc::new(SystemClock), 10.0).unwrap();
        assert_eq!(aggregator.open_case("sam").unwrap().case_id, first.case_id);
        let again = aggregator.evaluate_trigger("sam").await.unwrap().unwrap();
        assert_eq!(again.case_id, first.case_id);
        assert_eq!(audit.len(), 1);

        aggregator.close_case("sam").unwrap();
        assert!(aggregator.open_case("sam").is_none());
        assert_eq!(aggregator.current_weight("sam").await.unwrap(), 12.0);
    }

    #[tokio::test]
    async fn test_fails_closed_without_graph() {
        let (_dir, graph, _audit, aggregator) = setup();
        flag(&graph, "a", WeightClass::Intimate);
        graph.set_available(false);
        assert!(matches!(
            aggregator.evaluate_trigger("sam").await,
            Err(StewardshipError::TriggerDataUnavailable(_))
        ));
    }
}
