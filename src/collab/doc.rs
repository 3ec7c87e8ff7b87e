//! Shared diagram replica.
//!
//! A [`DiagramDoc`] wraps a `yrs` document. Every node field lives in its own
//! root map keyed by node id, and edges live in one more map keyed by edge
//! id. Values are JSON strings.
//!
//! | root map        | value                              |
//! |-----------------|------------------------------------|
//! | `nodes`         | creation rank; presence = liveness |
//! | `node_body`     | [`NodeBody`]                       |
//! | `node_position` | [`Position`]                       |
//! | `node_measured` | `Option<Size>`                     |
//! | `node_mark`     | [`EditMark`]                       |
//! | `edges`         | creation rank and [`Edge`]         |
//!
//! ## Conflict policy
//!
//! - Every map key is a register. Concurrent writes to one key settle on the
//!   same value on every replica; `yrs` breaks the tie by client id.
//! - Writes to different fields of a node never conflict.
//! - A node is live while its `nodes` entry exists. A field write that races
//!   a removal does not bring the node back.
//! - An edge is visible only while it and both of its endpoints are live.
//! - Nodes and edges are ordered by creation rank, then id.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::models::{
    validate_label, DiagramContent, Edge, Node, NodeBody, Position, Size, ValidationError,
};

/// A lock older than this may be taken over by another user.
pub const LOCK_STALE_AFTER: Duration = Duration::seconds(30);

const NODES: &str = "nodes";
const BODIES: &str = "node_body";
const POSITIONS: &str = "node_position";
const MEASURED: &str = "node_measured";
const MARKS: &str = "node_mark";
const EDGES: &str = "edges";

/// Who is editing a node, and since when. Doubles as the node lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditMark {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

impl EditMark {
    pub fn held_by(user: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            by: Some(user.into()),
            at: Some(at),
        }
    }

    pub fn is_set(&self) -> bool {
        self.by.is_some()
    }

    /// Whether the mark keeps `user` off the node at `now`. Marks without a
    /// timestamp came from stored content and never block.
    pub fn blocks(&self, user: &str, now: DateTime<Utc>) -> bool {
        match (&self.by, self.at) {
            (Some(holder), Some(at)) => holder != user && now - at < LOCK_STALE_AFTER,
            _ => false,
        }
    }

    fn from_node(node: &Node) -> Self {
        match (&node.edited_by, node.is_being_edited) {
            (Some(by), true) => Self {
                by: Some(by.clone()),
                at: None,
            },
            _ => Self::default(),
        }
    }
}

/// One operation on the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    AddNode { node: Node },
    SetBody { id: String, body: NodeBody },
    MoveNode { id: String, position: Position },
    SetMeasured { id: String, measured: Option<Size> },
    SetEditMark { id: String, mark: EditMark },
    RemoveNode { id: String },
    AddEdge { edge: Edge },
    RemoveEdge { id: String },
}

/// A change or update the replica refuses.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChangeError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("unknown edge: {0}")]
    UnknownEdge(String),
    #[error("edge {edge} references node {node}, which is not live")]
    EndpointNotLive { edge: String, node: String },
    #[error("node {node} is being edited by {holder}")]
    Locked { node: String, holder: String },
    #[error("edit mark on {node} names another user: {by}")]
    ForeignMark { node: String, by: String },
    #[error("malformed update: {0}")]
    Malformed(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct NodeEntry {
    rank: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EdgeEntry {
    rank: u64,
    edge: Edge,
}

/// A diagram replica. See the module docs for the conflict policy.
pub struct DiagramDoc {
    doc: Doc,
    nodes: MapRef,
    bodies: MapRef,
    positions: MapRef,
    measured: MapRef,
    marks: MapRef,
    edges: MapRef,
}

impl fmt::Debug for DiagramDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagramDoc")
            .field("client_id", &self.doc.client_id())
            .field("content", &self.content())
            .finish()
    }
}

impl Default for DiagramDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagramDoc {
    pub fn new() -> Self {
        Self::wrap(Doc::new())
    }

    pub fn with_client_id(client_id: u64) -> Self {
        Self::wrap(Doc::with_client_id(client_id))
    }

    fn wrap(doc: Doc) -> Self {
        Self {
            nodes: doc.get_or_insert_map(NODES),
            bodies: doc.get_or_insert_map(BODIES),
            positions: doc.get_or_insert_map(POSITIONS),
            measured: doc.get_or_insert_map(MEASURED),
            marks: doc.get_or_insert_map(MARKS),
            edges: doc.get_or_insert_map(EDGES),
            doc,
        }
    }

    /// Builds a replica from stored content, keeping the stored order.
    pub fn from_content(content: &DiagramContent) -> Self {
        let mut doc = Self::new();
        let mut changes: Vec<Change> = content
            .nodes
            .iter()
            .map(|node| Change::AddNode { node: node.clone() })
            .collect();
        changes.extend(
            content
                .edges
                .iter()
                .map(|edge| Change::AddEdge { edge: edge.clone() }),
        );
        doc.write(&changes);
        doc
    }

    /// Builds a replica from an encoded state.
    pub fn from_update(update: &[u8]) -> Result<Self, ChangeError> {
        let mut doc = Self::new();
        doc.apply_update(update)?;
        Ok(doc)
    }

    /// Independent copy with its own client id.
    pub fn fork(&self) -> Result<Self, ChangeError> {
        Self::from_update(&self.encode_state())
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Merges a v1-encoded update.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), ChangeError> {
        let update = Update::decode_v1(update).map_err(|e| ChangeError::Malformed(e.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| ChangeError::Malformed(e.to_string()))
    }

    /// Whole replica state as a v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.encode_since(&StateVector::default())
    }

    /// What this replica has beyond `since`, as a v1 update.
    pub fn encode_since(&self, since: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(since)
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn is_node_live(&self, id: &str) -> bool {
        let txn = self.doc.transact();
        self.nodes.get(&txn, id).is_some()
    }

    pub fn is_edge_visible(&self, id: &str) -> bool {
        self.edges().iter().any(|e| e.id == id)
    }

    /// Live node by id.
    pub fn node(&self, id: &str) -> Option<Node> {
        let txn = self.doc.transact();
        self.node_in(&txn, id).map(|(_, node)| node)
    }

    pub fn edit_mark(&self, id: &str) -> Option<EditMark> {
        let txn = self.doc.transact();
        self.nodes.get(&txn, id)?;
        Some(read(&self.marks, &txn, id).unwrap_or_default())
    }

    pub fn nodes(&self) -> Vec<Node> {
        let txn = self.doc.transact();
        self.nodes_in(&txn)
    }

    pub fn edges(&self) -> Vec<Edge> {
        let txn = self.doc.transact();
        self.edges_in(&txn)
    }

    /// Materialized view of the replica.
    pub fn content(&self) -> DiagramContent {
        let txn = self.doc.transact();
        DiagramContent {
            nodes: self.nodes_in(&txn),
            edges: self.edges_in(&txn),
        }
    }

    fn node_in<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<(u64, Node)> {
        let entry: NodeEntry = read(&self.nodes, txn, id)?;
        let body: NodeBody = read(&self.bodies, txn, id)?;
        let mark: EditMark = read(&self.marks, txn, id).unwrap_or_default();
        let node = Node {
            id: id.to_string(),
            body,
            position: read(&self.positions, txn, id).unwrap_or_default(),
            measured: read::<Option<Size>, _>(&self.measured, txn, id).flatten(),
            is_being_edited: mark.is_set(),
            edited_by: mark.by,
        };
        Some((entry.rank, node))
    }

    fn nodes_in<T: ReadTxn>(&self, txn: &T) -> Vec<Node> {
        let ids: Vec<String> = self.nodes.iter(txn).map(|(id, _)| id.to_string()).collect();
        let mut live: Vec<(u64, Node)> = ids
            .iter()
            .filter_map(|id| self.node_in(txn, id))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        live.into_iter().map(|(_, node)| node).collect()
    }

    fn edges_in<T: ReadTxn>(&self, txn: &T) -> Vec<Edge> {
        let mut visible: Vec<EdgeEntry> = self
            .edges
            .iter(txn)
            .filter_map(|(_, value)| parse::<EdgeEntry>(value))
            .filter(|e| {
                self.nodes.get(txn, &e.edge.source).is_some()
                    && self.nodes.get(txn, &e.edge.target).is_some()
            })
            .collect();
        visible.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.edge.id.cmp(&b.edge.id)));
        visible.into_iter().map(|e| e.edge).collect()
    }

    /// Checks a change against the current state without applying it.
    pub fn check(&self, change: &Change) -> Result<(), ChangeError> {
        match change {
            Change::AddNode { node } => {
                if node.id.trim().is_empty() {
                    return Err(ValidationError::EmptyId.into());
                }
                validate_label(&node.id, node.label())?;
            }
            Change::SetBody { id, body } => {
                self.require_node(id)?;
                validate_label(id, body.label())?;
            }
            Change::MoveNode { id, .. }
            | Change::SetMeasured { id, .. }
            | Change::SetEditMark { id, .. }
            | Change::RemoveNode { id } => {
                self.require_node(id)?;
            }
            Change::AddEdge { edge } => {
                if edge.id.trim().is_empty() {
                    return Err(ValidationError::EmptyId.into());
                }
                for endpoint in [&edge.source, &edge.target] {
                    if !self.is_node_live(endpoint) {
                        return Err(ChangeError::EndpointNotLive {
                            edge: edge.id.clone(),
                            node: endpoint.clone(),
                        });
                    }
                }
            }
            Change::RemoveEdge { id } => {
                let txn = self.doc.transact();
                if self.edges.get(&txn, id).is_none() {
                    return Err(ChangeError::UnknownEdge(id.clone()));
                }
            }
        }
        Ok(())
    }

    fn require_node(&self, id: &str) -> Result<(), ChangeError> {
        if self.is_node_live(id) {
            Ok(())
        } else {
            Err(ChangeError::UnknownNode(id.to_string()))
        }
    }

    /// Fails when someone other than `user` holds a fresh lock on `id`.
    pub fn ensure_unlocked(&self, id: &str, user: &str, now: DateTime<Utc>) -> Result<(), ChangeError> {
        match self.edit_mark(id) {
            Some(mark) if mark.blocks(user, now) => Err(ChangeError::Locked {
                node: id.to_string(),
                holder: mark.by.unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    /// Checks every change against the state before the batch, then writes
    /// them. Nothing is written when a check fails.
    pub fn try_write(&mut self, changes: &[Change]) -> Result<Vec<u8>, ChangeError> {
        for change in changes {
            self.check(change)?;
        }
        Ok(self.write(changes))
    }

    /// Writes `changes` in one transaction and returns the resulting update.
    pub fn write(&mut self, changes: &[Change]) -> Vec<u8> {
        let before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let mut node_rank = next_rank::<NodeEntry, _>(&self.nodes, &txn, |e| e.rank);
            let mut edge_rank = next_rank::<EdgeEntry, _>(&self.edges, &txn, |e| e.rank);

            for change in changes {
                match change {
                    Change::AddNode { node } => {
                        let rank = match read::<NodeEntry, _>(&self.nodes, &txn, &node.id) {
                            Some(entry) => entry.rank,
                            None => {
                                node_rank += 1;
                                node_rank - 1
                            }
                        };
                        put(&self.nodes, &mut txn, &node.id, &NodeEntry { rank });
                        put(&self.bodies, &mut txn, &node.id, &node.body);
                        put(&self.positions, &mut txn, &node.id, &node.position);
                        put(&self.measured, &mut txn, &node.id, &node.measured);
                        put(&self.marks, &mut txn, &node.id, &EditMark::from_node(node));
                    }
                    Change::SetBody { id, body } => put(&self.bodies, &mut txn, id, body),
                    Change::MoveNode { id, position } => {
                        put(&self.positions, &mut txn, id, position)
                    }
                    Change::SetMeasured { id, measured } => {
                        put(&self.measured, &mut txn, id, measured)
                    }
                    Change::SetEditMark { id, mark } => put(&self.marks, &mut txn, id, mark),
                    Change::RemoveNode { id } => {
                        for map in self.node_maps() {
                            map.remove(&mut txn, id);
                        }
                    }
                    Change::AddEdge { edge } => {
                        let rank = match read::<EdgeEntry, _>(&self.edges, &txn, &edge.id) {
                            Some(entry) => entry.rank,
                            None => {
                                edge_rank += 1;
                                edge_rank - 1
                            }
                        };
                        let entry = EdgeEntry {
                            rank,
                            edge: edge.clone(),
                        };
                        put(&self.edges, &mut txn, &edge.id, &entry);
                    }
                    Change::RemoveEdge { id } => {
                        self.edges.remove(&mut txn, id);
                    }
                }
            }
        }
        self.encode_since(&before)
    }

    fn node_maps(&self) -> [&MapRef; 5] {
        [
            &self.nodes,
            &self.bodies,
            &self.positions,
            &self.measured,
            &self.marks,
        ]
    }

    /// Changes that turn this replica's entries into `next`'s.
    ///
    /// Fails when `next` holds an entry that cannot be read, or a field write
    /// for a node that neither replica has.
    pub fn diff(&self, next: &DiagramDoc) -> Result<Vec<Change>, ChangeError> {
        let old_txn = self.doc.transact();
        let new_txn = next.doc.transact();
        let old_ids = raw_entries(&self.nodes, &old_txn);
        let new_ids = raw_entries(&next.nodes, &new_txn);
        let mut changes = Vec::new();

        for (map_name, old_map, new_map) in [
            (BODIES, &self.bodies, &next.bodies),
            (POSITIONS, &self.positions, &next.positions),
            (MEASURED, &self.measured, &next.measured),
            (MARKS, &self.marks, &next.marks),
        ] {
            let old = raw_entries(old_map, &old_txn);
            let new = raw_entries(new_map, &new_txn);
            for key in changed_keys(&old, &new) {
                if !old_ids.contains_key(&key) && !new_ids.contains_key(&key) {
                    tracing::debug!(map = map_name, node_id = %key, "Field write for unknown node");
                    return Err(ChangeError::UnknownNode(key));
                }
            }
        }

        for id in changed_keys(&old_ids, &new_ids) {
            if !new_ids.contains_key(&id) {
                changes.push(Change::RemoveNode { id });
                continue;
            }
            if !old_ids.contains_key(&id) {
                let (_, node) = next
                    .node_in(&new_txn, &id)
                    .ok_or_else(|| ChangeError::Malformed(format!("node {}", id)))?;
                changes.push(Change::AddNode { node });
            }
        }

        let mut new_marks = raw_entries(&next.marks, &new_txn);
        for id in new_ids.keys().filter(|id| old_ids.contains_key(*id)) {
            let (_, before) = self
                .node_in(&old_txn, id)
                .ok_or_else(|| ChangeError::Malformed(format!("node {}", id)))?;
            let (_, after) = next
                .node_in(&new_txn, id)
                .ok_or_else(|| ChangeError::Malformed(format!("node {}", id)))?;
            if before.body != after.body {
                changes.push(Change::SetBody {
                    id: id.clone(),
                    body: after.body,
                });
            }
            if before.position != after.position {
                changes.push(Change::MoveNode {
                    id: id.clone(),
                    position: after.position,
                });
            }
            if before.measured != after.measured {
                changes.push(Change::SetMeasured {
                    id: id.clone(),
                    measured: after.measured,
                });
            }
            let old_mark: EditMark = read(&self.marks, &old_txn, id).unwrap_or_default();
            let new_mark = match new_marks.remove(id) {
                None => EditMark::default(),
                Some(Some(json)) => serde_json::from_str(&json)
                    .map_err(|_| ChangeError::Malformed(format!("edit mark of {}", id)))?,
                Some(None) => return Err(ChangeError::Malformed(format!("edit mark of {}", id))),
            };
            if old_mark != new_mark {
                changes.push(Change::SetEditMark {
                    id: id.clone(),
                    mark: new_mark,
                });
            }
        }

        let old_edges = raw_entries(&self.edges, &old_txn);
        let new_edges = raw_entries(&next.edges, &new_txn);
        for id in changed_keys(&old_edges, &new_edges) {
            match new_edges.get(&id) {
                None => changes.push(Change::RemoveEdge { id }),
                Some(raw) => {
                    let entry = raw
                        .as_deref()
                        .and_then(|json| serde_json::from_str::<EdgeEntry>(json).ok())
                        .filter(|entry| entry.edge.id == id)
                        .ok_or_else(|| ChangeError::Malformed(format!("edge {}", id)))?;
                    changes.push(Change::AddEdge { edge: entry.edge });
                }
            }
        }

        Ok(changes)
    }

    /// Changes `next` makes on top of this replica, checked as edits by
    /// `user` at `now`.
    ///
    /// Beyond the checks of [`DiagramDoc::check`]: edit marks may only name
    /// `user`, and a node someone else holds a fresh lock on cannot be
    /// relabeled, removed, or have its mark changed.
    pub fn admit(
        &self,
        next: &DiagramDoc,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, ChangeError> {
        let changes = self.diff(next)?;
        for change in &changes {
            match change {
                Change::AddNode { node } => {
                    if node.id.trim().is_empty() {
                        return Err(ValidationError::EmptyId.into());
                    }
                    validate_label(&node.id, node.label())?;
                    ensure_own_mark(&node.id, node.edited_by.as_deref(), user)?;
                }
                Change::SetBody { id, body } => {
                    validate_label(id, body.label())?;
                    self.ensure_unlocked(id, user, now)?;
                }
                Change::RemoveNode { id } => self.ensure_unlocked(id, user, now)?,
                Change::SetEditMark { id, mark } => {
                    ensure_own_mark(id, mark.by.as_deref(), user)?;
                    self.ensure_unlocked(id, user, now)?;
                }
                Change::AddEdge { edge } => {
                    if edge.id.trim().is_empty() {
                        return Err(ValidationError::EmptyId.into());
                    }
                    for endpoint in [&edge.source, &edge.target] {
                        if !next.is_node_live(endpoint) {
                            return Err(ChangeError::EndpointNotLive {
                                edge: edge.id.clone(),
                                node: endpoint.clone(),
                            });
                        }
                    }
                }
                Change::MoveNode { .. } | Change::SetMeasured { .. } | Change::RemoveEdge { .. } => {}
            }
        }
        Ok(changes)
    }

    /// Changes that turn the current view into `target`. They are not
    /// applied.
    pub fn changes_toward(&self, target: &DiagramContent) -> Vec<Change> {
        let mut changes = Vec::new();

        for node in &target.nodes {
            match self.node(&node.id) {
                None => changes.push(Change::AddNode { node: node.clone() }),
                Some(current) => {
                    if current.body != node.body {
                        changes.push(Change::SetBody {
                            id: node.id.clone(),
                            body: node.body.clone(),
                        });
                    }
                    if current.position != node.position {
                        changes.push(Change::MoveNode {
                            id: node.id.clone(),
                            position: node.position,
                        });
                    }
                    if current.measured != node.measured {
                        changes.push(Change::SetMeasured {
                            id: node.id.clone(),
                            measured: node.measured,
                        });
                    }
                }
            }
        }

        for node in self.nodes() {
            if !target.nodes.iter().any(|n| n.id == node.id) {
                changes.push(Change::RemoveNode { id: node.id });
            }
        }

        let current_edges = self.edges();
        for edge in &target.edges {
            if !current_edges.contains(edge) {
                changes.push(Change::AddEdge { edge: edge.clone() });
            }
        }
        for edge in current_edges {
            if !target.edges.iter().any(|e| e.id == edge.id) {
                changes.push(Change::RemoveEdge { id: edge.id });
            }
        }

        changes
    }

    /// Changes that clear every edit mark held by `user`.
    pub fn release_marks_of(&self, user: &str) -> Vec<Change> {
        self.nodes()
            .into_iter()
            .filter(|n| n.edited_by.as_deref() == Some(user))
            .map(|n| Change::SetEditMark {
                id: n.id,
                mark: EditMark::default(),
            })
            .collect()
    }
}

fn ensure_own_mark(node: &str, by: Option<&str>, user: &str) -> Result<(), ChangeError> {
    match by {
        Some(by) if by != user => Err(ChangeError::ForeignMark {
            node: node.to_string(),
            by: by.to_string(),
        }),
        _ => Ok(()),
    }
}

fn parse<T: DeserializeOwned>(value: Out) -> Option<T> {
    match value {
        Out::Any(Any::String(json)) => serde_json::from_str(&json).ok(),
        _ => None,
    }
}

fn read<T: DeserializeOwned, Txn: ReadTxn>(map: &MapRef, txn: &Txn, key: &str) -> Option<T> {
    map.get(txn, key).and_then(parse)
}

fn put<T: Serialize>(map: &MapRef, txn: &mut TransactionMut<'_>, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => {
            map.insert(txn, key, json);
        }
        Err(e) => tracing::error!(key = %key, error = %e, "Failed to encode replica value"),
    }
}

fn next_rank<T: DeserializeOwned, Txn: ReadTxn>(
    map: &MapRef,
    txn: &Txn,
    rank: impl Fn(&T) -> u64,
) -> u64 {
    map.iter(txn)
        .filter_map(|(_, value)| parse::<T>(value))
        .map(|entry| rank(&entry).saturating_add(1))
        .max()
        .unwrap_or(0)
}

/// Raw map contents. Values that are not strings map to `None`.
fn raw_entries<Txn: ReadTxn>(map: &MapRef, txn: &Txn) -> BTreeMap<String, Option<String>> {
    map.iter(txn)
        .map(|(key, value)| {
            let json = match value {
                Out::Any(Any::String(json)) => Some(json.to_string()),
                _ => None,
            };
            (key.to_string(), json)
        })
        .collect()
}

fn changed_keys(
    old: &BTreeMap<String, Option<String>>,
    new: &BTreeMap<String, Option<String>>,
) -> BTreeSet<String> {
    old.keys()
        .chain(new.keys())
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect()
}
