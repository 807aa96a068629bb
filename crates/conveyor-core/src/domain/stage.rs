//! Stage tree: progress-bearing phases of a task run.
//!
//! Stages are stored as flat rows with a parent pointer. Reads materialize
//! the rows of one task into a [`StageTree`] once, then aggregate progress
//! over it in memory.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::domain::ids::{StageId, TaskId};

/// Stored stage row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: StageId,
    pub task_id: TaskId,

    /// `None` for the root stage.
    pub parent: Option<StageId>,

    pub name: String,

    /// Last reported status label.
    pub status: Option<String>,

    /// Self-reported progress, 0..=100.
    pub progress: f64,

    /// Expected number of sub-units; aggregation divisor.
    pub total: u32,
}

/// Clamp a reported progress value into `[0, 100]`. NaN counts as 0.
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// In-memory materialization of one task's stages.
#[derive(Debug, Clone, Default)]
pub struct StageTree {
    stages: HashMap<StageId, StageRecord>,
    children: HashMap<StageId, Vec<StageId>>,
    roots: Vec<StageId>,
}

impl StageTree {
    pub fn new(rows: impl IntoIterator<Item = StageRecord>) -> Self {
        let mut rows: Vec<StageRecord> = rows.into_iter().collect();
        // creation order
        rows.sort_by_key(|s| s.id);

        let mut tree = Self::default();
        for row in &rows {
            match row.parent {
                Some(parent) => tree.children.entry(parent).or_default().push(row.id),
                None => tree.roots.push(row.id),
            }
        }
        tree.stages = rows.into_iter().map(|s| (s.id, s)).collect();
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn get(&self, id: StageId) -> Option<&StageRecord> {
        self.stages.get(&id)
    }

    /// The root stage (the oldest one, should a stale root survive).
    pub fn root(&self) -> Option<&StageRecord> {
        self.roots.first().and_then(|id| self.stages.get(id))
    }

    pub fn children(&self, id: StageId) -> &[StageId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Aggregated progress of a stage, in `[0, 100]`.
    ///
    /// A stage at 100 short-circuits; otherwise its own progress is added to
    /// the sum of its children's aggregates divided by
    /// `max(total, child count, 1)`. Returns 0 for unknown ids.
    pub fn compute_progress(&self, id: StageId) -> f64 {
        let mut memo = HashMap::new();
        let mut path = HashSet::new();
        self.progress_of(id, &mut memo, &mut path)
    }

    /// Aggregated progress of the root stage, 0 without stages.
    pub fn root_progress(&self) -> f64 {
        self.root()
            .map(|root| self.compute_progress(root.id))
            .unwrap_or(0.0)
    }

    fn progress_of(
        &self,
        id: StageId,
        memo: &mut HashMap<StageId, f64>,
        path: &mut HashSet<StageId>,
    ) -> f64 {
        if let Some(done) = memo.get(&id) {
            return *done;
        }
        let Some(stage) = self.stages.get(&id) else {
            return 0.0;
        };
        let own = clamp_progress(stage.progress);
        if own >= 100.0 {
            memo.insert(id, 100.0);
            return 100.0;
        }
        // corrupt parent pointers must not recurse forever
        if !path.insert(id) {
            return 0.0;
        }

        let children = self.children(id);
        let divisor = (stage.total as usize).max(children.len()).max(1) as f64;
        let sum: f64 = children
            .iter()
            .map(|child| self.progress_of(*child, memo, path))
            .sum();
        path.remove(&id);

        let result = (own + sum / divisor).round_ties_even().clamp(0.0, 100.0);
        memo.insert(id, result);
        result
    }

    /// Path label "Root / Phase / Step" of a stage.
    pub fn complete_name(&self, id: StageId, exclude_root: bool) -> String {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.stages.get(&id);
        while let Some(stage) = cursor {
            if !seen.insert(stage.id) {
                break;
            }
            if exclude_root && stage.parent.is_none() {
                break;
            }
            names.push(stage.name.as_str());
            cursor = stage.parent.and_then(|p| self.stages.get(&p));
        }
        names.reverse();
        names.join(" / ")
    }

    /// Pre-order walk from the root: `(depth, stage)`.
    pub fn walk(&self) -> Vec<(usize, &StageRecord)> {
        let mut out = Vec::with_capacity(self.stages.len());
        let mut seen = HashSet::new();
        let mut stack: Vec<(usize, StageId)> =
            self.roots.iter().rev().map(|id| (0, *id)).collect();
        while let Some((depth, id)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(stage) = self.stages.get(&id) {
                out.push((depth, stage));
                for child in self.children(id).iter().rev() {
                    stack.push((depth + 1, *child));
                }
            }
        }
        out
    }
}
