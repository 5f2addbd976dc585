//! Wait-id registration and barrier delivery.

use crate::core::{ResponseData, ResponseMap};
use crate::utils::now_millis;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The kind of response a wait-id expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    /// Result of an external task.
    Task,
    /// Callback of an async step.
    Async,
    /// Terminal outcome of a child node.
    Child,
}

/// A registered correlation between a wait-id and its owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEntry {
    /// The wait-id.
    pub wait_id: String,
    /// Runtime id of the suspended node.
    pub node_runtime_id: String,
    /// Expected response kind.
    pub expected: ResponseKind,
    /// Registration time in epoch milliseconds.
    pub registered_at: i64,
}

/// The outcome of delivering a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// No node waits on the id yet; the response is buffered.
    Unknown,
    /// The id was already delivered, consumed or released.
    Duplicate,
    /// The node still waits on other ids.
    Pending {
        /// Runtime id of the suspended node.
        node_runtime_id: String,
        /// Number of ids still outstanding.
        remaining: usize,
    },
    /// Every id of the node's barrier has delivered. Returned once per barrier.
    Ready {
        /// Runtime id of the node to resume.
        node_runtime_id: String,
        /// Response kind of the barrier.
        kind: ResponseKind,
        /// All delivered responses keyed by wait-id.
        responses: ResponseMap,
    },
}

#[derive(Debug)]
enum Slot {
    Waiting(WaitEntry),
    Orphan {
        response: ResponseData,
        received_at: i64,
    },
    Consumed {
        node_runtime_id: Option<String>,
    },
}

#[derive(Debug)]
struct WaitGroup {
    kind: ResponseKind,
    pending: BTreeSet<String>,
    received: ResponseMap,
}

/// Correlates wait-ids with suspended nodes.
///
/// Each node has at most one barrier group at a time. Consumed ids stay
/// tombstoned so a late or repeated delivery is always reported as
/// [`Delivery::Duplicate`].
#[derive(Debug, Default)]
pub struct WaitRegistry {
    entries: DashMap<String, Slot>,
    groups: DashMap<String, WaitGroup>,
}

impl WaitRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the barrier a node suspends on.
    ///
    /// Must be called before control is relinquished. Responses that arrived
    /// early are absorbed. Returns [`Delivery::Ready`] when nothing is left
    /// to wait for, including when `wait_ids` is empty.
    pub fn register<I, S>(&self, node_runtime_id: &str, kind: ResponseKind, wait_ids: I) -> Delivery
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = wait_ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Delivery::Ready {
                node_runtime_id: node_runtime_id.to_string(),
                kind,
                responses: ResponseMap::new(),
            };
        }

        self.groups.insert(
            node_runtime_id.to_string(),
            WaitGroup {
                kind,
                pending: ids.clone(),
                received: ResponseMap::new(),
            },
        );

        let registered_at = now_millis();
        let mut early = Vec::new();
        for wait_id in &ids {
            match self.entries.entry(wait_id.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot::Waiting(WaitEntry {
                        wait_id: wait_id.clone(),
                        node_runtime_id: node_runtime_id.to_string(),
                        expected: kind,
                        registered_at,
                    }));
                }
                Entry::Occupied(mut occupied) => {
                    if matches!(occupied.get(), Slot::Orphan { .. }) {
                        let previous = occupied.insert(Slot::Consumed {
                            node_runtime_id: Some(node_runtime_id.to_string()),
                        });
                        if let Slot::Orphan { response, .. } = previous {
                            early.push((wait_id.clone(), response));
                        }
                    } else {
                        tracing::warn!(wait_id = %wait_id, "Wait-id registered twice");
                    }
                }
            }
        }

        tracing::debug!(
            runtime_id = node_runtime_id,
            wait_ids = ids.len(),
            early = early.len(),
            "Registered wait-ids"
        );

        let mut outcome = Delivery::Pending {
            node_runtime_id: node_runtime_id.to_string(),
            remaining: ids.len(),
        };
        for (wait_id, response) in early {
            outcome = self.settle(node_runtime_id, wait_id, response);
        }
        outcome
    }

    /// Delivers a response keyed by wait-id.
    pub fn deliver(&self, wait_id: &str, response: ResponseData) -> Delivery {
        let node_runtime_id = match self.entries.entry(wait_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Orphan {
                    response,
                    received_at: now_millis(),
                });
                tracing::debug!(wait_id, "Buffered response for unregistered wait-id");
                return Delivery::Unknown;
            }
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Waiting(entry) => {
                    let node_runtime_id = entry.node_runtime_id.clone();
                    occupied.insert(Slot::Consumed {
                        node_runtime_id: Some(node_runtime_id.clone()),
                    });
                    node_runtime_id
                }
                Slot::Orphan { .. } | Slot::Consumed { .. } => {
                    tracing::debug!(wait_id, "Ignoring duplicate response");
                    return Delivery::Duplicate;
                }
            },
        };
        self.settle(&node_runtime_id, wait_id.to_string(), response)
    }

    fn settle(&self, node_runtime_id: &str, wait_id: String, response: ResponseData) -> Delivery {
        match self.groups.entry(node_runtime_id.to_string()) {
            Entry::Vacant(_) => Delivery::Duplicate,
            Entry::Occupied(mut occupied) => {
                let group = occupied.get_mut();
                if !group.pending.remove(&wait_id) {
                    return Delivery::Duplicate;
                }
                group.received.insert(wait_id, response);
                if group.pending.is_empty() {
                    let group = occupied.remove();
                    Delivery::Ready {
                        node_runtime_id: node_runtime_id.to_string(),
                        kind: group.kind,
                        responses: group.received,
                    }
                } else {
                    Delivery::Pending {
                        node_runtime_id: node_runtime_id.to_string(),
                        remaining: group.pending.len(),
                    }
                }
            }
        }
    }

    /// Drops the node's barrier on abort or expiry.
    ///
    /// Returns the ids that never delivered. They are tombstoned, so late
    /// responses are ignored.
    pub fn release_node(&self, node_runtime_id: &str) -> Vec<String> {
        let Some((_, group)) = self.groups.remove(node_runtime_id) else {
            return Vec::new();
        };
        let released: Vec<String> = group.pending.into_iter().collect();
        for wait_id in &released {
            self.entries.insert(
                wait_id.clone(),
                Slot::Consumed {
                    node_runtime_id: Some(node_runtime_id.to_string()),
                },
            );
        }
        for wait_id in group.received.into_keys() {
            self.entries.insert(
                wait_id,
                Slot::Consumed {
                    node_runtime_id: Some(node_runtime_id.to_string()),
                },
            );
        }
        if !released.is_empty() {
            tracing::debug!(
                runtime_id = node_runtime_id,
                released = released.len(),
                "Released wait-ids"
            );
        }
        released
    }

    /// Returns the ids the node still waits on.
    #[must_use]
    pub fn pending_for(&self, node_runtime_id: &str) -> Vec<String> {
        self.groups
            .get(node_runtime_id)
            .map(|g| g.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the registration of a wait-id still being waited on.
    #[must_use]
    pub fn entry(&self, wait_id: &str) -> Option<WaitEntry> {
        match self.entries.get(wait_id)?.value() {
            Slot::Waiting(entry) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Returns the node a wait-id belongs or belonged to.
    #[must_use]
    pub fn owner_of(&self, wait_id: &str) -> Option<String> {
        match self.entries.get(wait_id)?.value() {
            Slot::Waiting(entry) => Some(entry.node_runtime_id.clone()),
            Slot::Consumed { node_runtime_id } => node_runtime_id.clone(),
            Slot::Orphan { .. } => None,
        }
    }

    /// Drops buffered responses older than `max_age_ms`. Returns the count.
    pub fn purge_orphans(&self, max_age_ms: i64) -> usize {
        let cutoff = now_millis() - max_age_ms;
        let before = self.entries.len();
        self.entries.retain(|_, slot| match slot {
            Slot::Orphan { received_at, .. } => *received_at >= cutoff,
            _ => true,
        });
        before - self.entries.len()
    }
}
