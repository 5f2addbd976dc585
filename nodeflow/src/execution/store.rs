//! Persistence boundary for node execution records.

use super::NodeExecution;
use crate::core::Status;
use crate::errors::NodeflowError;
use crate::utils::now_millis;
use dashmap::DashMap;
use std::collections::HashSet;

/// Mutation applied to a node record inside the store.
pub type NodeOps<'a> = &'a mut (dyn FnMut(&mut NodeExecution) + Send);

/// Stores node execution records keyed by runtime id.
///
/// Records are indexed by plan execution, parent and status. Every update
/// bumps the record's `version`.
pub trait NodeExecutionStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if a record with the same runtime id exists.
    fn save(&self, node: NodeExecution) -> Result<(), NodeflowError>;

    /// Returns a record by runtime id.
    fn get(&self, runtime_id: &str) -> Option<NodeExecution>;

    /// Applies `ops` to a record without touching its status.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for an unknown runtime id.
    fn update(&self, runtime_id: &str, ops: NodeOps<'_>) -> Result<NodeExecution, NodeflowError>;

    /// Transitions a record to `status` and applies `ops` atomically.
    ///
    /// Returns `None`, leaving the record untouched, when the node is
    /// unknown or terminal, when the transition is illegal, or when
    /// `allowed_from` is non-empty and does not contain the current status.
    fn update_status_with_ops(
        &self,
        runtime_id: &str,
        status: Status,
        allowed_from: &[Status],
        ops: NodeOps<'_>,
    ) -> Option<NodeExecution>;

    /// Returns every record of a plan execution.
    fn fetch_by_plan_execution(&self, plan_execution_id: &str) -> Vec<NodeExecution>;

    /// Returns the records of a plan execution in one of `statuses`.
    fn fetch_by_status(&self, plan_execution_id: &str, statuses: &[Status]) -> Vec<NodeExecution>;

    /// Returns the direct children of a node.
    fn fetch_children(&self, parent_id: &str) -> Vec<NodeExecution>;

    /// Moves the given nodes to `DISCONTINUING`. Returns how many moved.
    fn mark_leaves_discontinuing(&self, runtime_ids: &[String]) -> usize;

    /// Moves every queued node, and every node in `statuses` with no
    /// unfinished child, to `DISCONTINUING`. Returns how many moved.
    fn mark_all_leaves_and_queued_discontinuing(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
    ) -> usize;

    /// Returns nodes that are neither flowing nor terminal (paused ones).
    fn fetch_non_flowing_and_non_final_statuses(&self, plan_execution_id: &str)
        -> Vec<NodeExecution>;

    /// Flags a node as replaced by a newer attempt.
    fn mark_retried(&self, runtime_id: &str) -> bool;
}

/// In-memory [`NodeExecutionStore`] on `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryNodeExecutionStore {
    nodes: DashMap<String, NodeExecution>,
    by_plan: DashMap<String, Vec<String>>,
    by_parent: DashMap<String, Vec<String>>,
    by_status: DashMap<Status, HashSet<String>>,
}

impl InMemoryNodeExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn reindex_status(&self, runtime_id: &str, from: Status, to: Status) {
        if from == to {
            return;
        }
        if let Some(mut ids) = self.by_status.get_mut(&from) {
            ids.remove(runtime_id);
        }
        self.by_status
            .entry(to)
            .or_default()
            .insert(runtime_id.to_string());
    }

    fn collect(&self, ids: &[String]) -> Vec<NodeExecution> {
        ids.iter()
            .filter_map(|id| self.nodes.get(id).map(|n| n.clone()))
            .collect()
    }

    fn has_unfinished_child(&self, runtime_id: &str) -> bool {
        self.by_parent.get(runtime_id).is_some_and(|children| {
            children.iter().any(|child| {
                self.nodes
                    .get(child)
                    .is_some_and(|c| !c.status.is_final() && !c.old_retry)
            })
        })
    }
}

impl NodeExecutionStore for InMemoryNodeExecutionStore {
    fn save(&self, node: NodeExecution) -> Result<(), NodeflowError> {
        let runtime_id = node.runtime_id.clone();
        let plan_execution_id = node.plan_execution_id.clone();
        let parent_id = node.parent_id.clone();
        let status = node.status;

        match self.nodes.entry(runtime_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NodeflowError::invalid_request(format!(
                    "Node execution '{runtime_id}' already exists"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(node);
            }
        }

        self.by_plan
            .entry(plan_execution_id)
            .or_default()
            .push(runtime_id.clone());
        if let Some(parent_id) = parent_id {
            self.by_parent
                .entry(parent_id)
                .or_default()
                .push(runtime_id.clone());
        }
        self.by_status.entry(status).or_default().insert(runtime_id);
        Ok(())
    }

    fn get(&self, runtime_id: &str) -> Option<NodeExecution> {
        self.nodes.get(runtime_id).map(|n| n.clone())
    }

    fn update(&self, runtime_id: &str, ops: NodeOps<'_>) -> Result<NodeExecution, NodeflowError> {
        let mut node = self
            .nodes
            .get_mut(runtime_id)
            .ok_or_else(|| NodeflowError::NodeNotFound(runtime_id.to_string()))?;
        let status = node.status;
        ops(&mut node);
        node.status = status;
        node.version += 1;
        node.updated_at = now_millis();
        Ok(node.clone())
    }

    fn update_status_with_ops(
        &self,
        runtime_id: &str,
        status: Status,
        allowed_from: &[Status],
        ops: NodeOps<'_>,
    ) -> Option<NodeExecution> {
        let (from, updated) = {
            let mut node = self.nodes.get_mut(runtime_id)?;
            let from = node.status;
            if !from.can_transition_to(status)
                || (!allowed_from.is_empty() && !allowed_from.contains(&from))
            {
                tracing::debug!(
                    runtime_id,
                    from = %from,
                    to = %status,
                    "Rejected status transition"
                );
                return None;
            }
            ops(&mut node);
            let now = now_millis();
            node.status = status;
            if status == Status::Running && node.start_ts.is_none() {
                node.start_ts = Some(now);
            }
            if status.is_final() {
                node.end_ts = Some(now);
            }
            node.version += 1;
            node.updated_at = now;
            (from, node.clone())
        };
        self.reindex_status(runtime_id, from, status);
        Some(updated)
    }

    fn fetch_by_plan_execution(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        let ids = self
            .by_plan
            .get(plan_execution_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        self.collect(&ids)
    }

    fn fetch_by_status(&self, plan_execution_id: &str, statuses: &[Status]) -> Vec<NodeExecution> {
        let ids: Vec<String> = statuses
            .iter()
            .filter_map(|s| self.by_status.get(s).map(|ids| ids.iter().cloned().collect::<Vec<_>>()))
            .flatten()
            .collect();
        self.collect(&ids)
            .into_iter()
            .filter(|n| n.plan_execution_id == plan_execution_id && statuses.contains(&n.status))
            .collect()
    }

    fn fetch_children(&self, parent_id: &str) -> Vec<NodeExecution> {
        let ids = self
            .by_parent
            .get(parent_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        self.collect(&ids)
    }

    fn mark_leaves_discontinuing(&self, runtime_ids: &[String]) -> usize {
        runtime_ids
            .iter()
            .filter(|id| {
                self.update_status_with_ops(id, Status::Discontinuing, &[], &mut |_| {})
                    .is_some()
            })
            .count()
    }

    fn mark_all_leaves_and_queued_discontinuing(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
    ) -> usize {
        let mut targets: Vec<String> = self
            .fetch_by_status(plan_execution_id, statuses)
            .into_iter()
            .filter(|n| !self.has_unfinished_child(&n.runtime_id))
            .map(|n| n.runtime_id)
            .collect();
        targets.extend(
            self.fetch_by_status(plan_execution_id, &[Status::Queued])
                .into_iter()
                .map(|n| n.runtime_id),
        );
        targets.sort();
        targets.dedup();
        self.mark_leaves_discontinuing(&targets)
    }

    fn fetch_non_flowing_and_non_final_statuses(
        &self,
        plan_execution_id: &str,
    ) -> Vec<NodeExecution> {
        self.fetch_by_plan_execution(plan_execution_id)
            .into_iter()
            .filter(|n| !n.status.is_flowing() && !n.status.is_final())
            .collect()
    }

    fn mark_retried(&self, runtime_id: &str) -> bool {
        self.update(runtime_id, &mut |node| node.old_retry = true)
            .is_ok()
    }
}
