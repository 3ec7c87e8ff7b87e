use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;
use yrs::StateVector;

use super::placement;
use crate::collab::{
    Change, ChangeError, ClientFrame, DiagramDoc, EditMark, Participant, ServerFrame,
};
use crate::models::{
    validate_label, DiagramContent, Edge, Node, NodeBody, NodeKind, Position, Side,
};

/// What a [`DiagramStore`] is built from.
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub user: Participant,
    pub view_only: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("diagram is open in view-only mode")]
    ViewOnly,
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("unknown edge: {0}")]
    UnknownEdge(String),
    #[error("node {node} is being edited by {holder}")]
    Locked { node: String, holder: String },
    #[error(transparent)]
    Rejected(ChangeError),
}

impl From<ChangeError> for ClientError {
    fn from(e: ChangeError) -> Self {
        match e {
            ChangeError::Locked { node, holder } => Self::Locked { node, holder },
            ChangeError::UnknownNode(id) => Self::UnknownNode(id),
            ChangeError::UnknownEdge(id) => Self::UnknownEdge(id),
            other => Self::Rejected(other),
        }
    }
}

/// A node someone else is editing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditingIndicator {
    pub node_id: String,
    pub user_id: String,
}

/// Client-side mirror of a document replica.
///
/// Mutations apply to the local replica synchronously; the integration
/// layer sends what they produced with [`DiagramStore::take_outbox`] and
/// feeds server frames back through [`DiagramStore::apply_server_frame`].
#[derive(Debug)]
pub struct DiagramStore {
    doc: DiagramDoc,
    user: Participant,
    view_only: bool,
    /// Replica state before the first unsent local change.
    unsent_since: Option<StateVector>,
    pending: Vec<Change>,
    peers: Vec<Participant>,
    last_rejection: Option<String>,
}

impl DiagramStore {
    pub fn new(ctx: StoreContext) -> Self {
        Self::with_doc(ctx, DiagramDoc::new())
    }

    pub fn with_doc(ctx: StoreContext, doc: DiagramDoc) -> Self {
        Self {
            doc,
            user: ctx.user,
            view_only: ctx.view_only,
            unsent_since: None,
            pending: Vec::new(),
            peers: Vec::new(),
            last_rejection: None,
        }
    }

    pub fn is_view_only(&self) -> bool {
        self.view_only
    }

    pub fn set_view_only(&mut self, view_only: bool) {
        self.view_only = view_only;
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.doc.nodes()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.doc.edges()
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.doc.node(id)
    }

    pub fn content(&self) -> DiagramContent {
        self.doc.content()
    }

    pub fn peers(&self) -> &[Participant] {
        &self.peers
    }

    /// Reason of the last update the server refused, if any.
    pub fn last_rejection(&self) -> Option<&str> {
        self.last_rejection.as_deref()
    }

    /// Changes applied locally but not yet handed to the connection.
    pub fn pending(&self) -> &[Change] {
        &self.pending
    }

    /// Drains unsent local changes into one update frame.
    pub fn take_outbox(&mut self) -> Option<ClientFrame> {
        let since = self.unsent_since.take()?;
        self.pending.clear();
        Some(ClientFrame::Update(self.doc.encode_since(&since)))
    }

    fn ensure_writable(&self) -> Result<(), ClientError> {
        if self.view_only {
            Err(ClientError::ViewOnly)
        } else {
            Ok(())
        }
    }

    fn require_node(&self, id: &str) -> Result<Node, ClientError> {
        self.doc
            .node(id)
            .ok_or_else(|| ClientError::UnknownNode(id.to_string()))
    }

    fn ensure_unlocked(&self, id: &str, now: DateTime<Utc>) -> Result<(), ClientError> {
        Ok(self.doc.ensure_unlocked(id, &self.user.user_id, now)?)
    }

    /// Writes `changes` as one batch. Nothing is written if any of them
    /// fails its check.
    fn commit(&mut self, changes: Vec<Change>) -> Result<(), ClientError> {
        let before = self.doc.state_vector();
        self.doc.try_write(&changes)?;
        self.unsent_since.get_or_insert(before);
        self.pending.extend(changes);
        Ok(())
    }

    /// Adds a node of `kind`. Without a position it is placed automatically
    /// relative to the existing nodes.
    pub fn add_node(&mut self, kind: NodeKind, position: Option<Position>) -> Result<Node, ClientError> {
        self.ensure_writable()?;
        let position = position.unwrap_or_else(|| placement::next_position(kind, &self.doc.nodes()));
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", kind, &simple[..8]);
        let node = Node::new(id, NodeBody::template(kind, position), position);

        self.commit(vec![Change::AddNode { node: node.clone() }])?;
        Ok(node)
    }

    /// Moves a node. Topics and subtopics also switch side when they cross
    /// the spine.
    pub fn move_node(&mut self, id: &str, position: Position) -> Result<(), ClientError> {
        self.ensure_writable()?;
        let node = self.require_node(id)?;

        let mut changes = vec![Change::MoveNode {
            id: id.to_string(),
            position,
        }];
        let side = Side::for_x(position.x);
        if node.body.side().is_some_and(|current| current != side) {
            let mut body = node.body;
            body.set_side(side);
            changes.push(Change::SetBody {
                id: id.to_string(),
                body,
            });
        }
        self.commit(changes)
    }

    pub fn set_label(&mut self, id: &str, label: &str) -> Result<(), ClientError> {
        self.ensure_writable()?;
        let node = self.require_node(id)?;
        self.ensure_unlocked(id, Utc::now())?;
        validate_label(id, label).map_err(ChangeError::from)?;

        let mut body = node.body;
        body.set_label(label);
        self.commit(vec![Change::SetBody {
            id: id.to_string(),
            body,
        }])
    }

    /// Replaces a node's payload.
    pub fn update_node_data(&mut self, id: &str, body: NodeBody) -> Result<(), ClientError> {
        self.ensure_writable()?;
        self.require_node(id)?;
        self.ensure_unlocked(id, Utc::now())?;

        self.commit(vec![Change::SetBody {
            id: id.to_string(),
            body,
        }])
    }

    /// Removes a node together with every edge attached to it.
    pub fn delete_node(&mut self, id: &str) -> Result<(), ClientError> {
        self.ensure_writable()?;
        self.require_node(id)?;
        self.ensure_unlocked(id, Utc::now())?;

        let mut changes: Vec<Change> = self
            .doc
            .edges()
            .into_iter()
            .filter(|e| e.source == id || e.target == id)
            .map(|e| Change::RemoveEdge { id: e.id })
            .collect();
        changes.push(Change::RemoveNode { id: id.to_string() });
        self.commit(changes)
    }

    /// Removes every node and edge, or nothing when another user holds a
    /// fresh lock on any node.
    pub fn delete_all_nodes(&mut self) -> Result<(), ClientError> {
        self.ensure_writable()?;
        let now = Utc::now();
        let nodes = self.doc.nodes();
        for node in &nodes {
            self.ensure_unlocked(&node.id, now)?;
        }

        let mut changes: Vec<Change> = self
            .doc
            .edges()
            .into_iter()
            .map(|e| Change::RemoveEdge { id: e.id })
            .collect();
        changes.extend(nodes.into_iter().map(|n| Change::RemoveNode { id: n.id }));
        if changes.is_empty() {
            return Ok(());
        }
        self.commit(changes)
    }

    /// Connects two nodes. Connecting the same handles twice returns the
    /// existing edge.
    pub fn connect(
        &mut self,
        source: &str,
        source_handle: Option<&str>,
        target: &str,
        target_handle: Option<&str>,
    ) -> Result<Edge, ClientError> {
        self.ensure_writable()?;
        self.require_node(source)?;
        self.require_node(target)?;

        let id = Edge::connection_id(source, source_handle, target, target_handle);
        if let Some(existing) = self.doc.edges().into_iter().find(|e| e.id == id) {
            return Ok(existing);
        }

        let edge = Edge {
            id,
            source: source.to_string(),
            target: target.to_string(),
            source_handle: source_handle.map(str::to_string),
            target_handle: target_handle.map(str::to_string),
        };
        self.commit(vec![Change::AddEdge { edge: edge.clone() }])?;
        Ok(edge)
    }

    pub fn remove_edge(&mut self, id: &str) -> Result<(), ClientError> {
        self.ensure_writable()?;
        if !self.doc.is_edge_visible(id) {
            return Err(ClientError::UnknownEdge(id.to_string()));
        }
        self.commit(vec![Change::RemoveEdge { id: id.to_string() }])
    }

    /// Marks or unmarks a node as being edited by the current user.
    pub fn set_node_being_edited(&mut self, id: &str, editing: bool) -> Result<(), ClientError> {
        if editing {
            self.acquire_lock(id)
        } else {
            self.release_lock(id)
        }
    }

    pub fn acquire_lock(&mut self, id: &str) -> Result<(), ClientError> {
        self.acquire_lock_at(id, Utc::now())
    }

    /// Takes the edit lock on `id` as of `now`. A lock held by someone else
    /// can only be taken once it is stale.
    pub fn acquire_lock_at(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), ClientError> {
        self.ensure_writable()?;
        self.require_node(id)?;
        self.ensure_unlocked(id, now)?;

        self.commit(vec![Change::SetEditMark {
            id: id.to_string(),
            mark: EditMark::held_by(self.user.user_id.clone(), now),
        }])
    }

    /// Releases the lock on `id` if the current user holds it.
    pub fn release_lock(&mut self, id: &str) -> Result<(), ClientError> {
        self.ensure_writable()?;
        let held_by_me = self
            .doc
            .edit_mark(id)
            .and_then(|m| m.by)
            .is_some_and(|by| by == self.user.user_id);
        if !held_by_me {
            return Ok(());
        }

        self.commit(vec![Change::SetEditMark {
            id: id.to_string(),
            mark: Default::default(),
        }])
    }

    /// User holding the edit lock on `id`, stale or not.
    pub fn lock_holder(&self, id: &str) -> Option<String> {
        self.doc.edit_mark(id).and_then(|m| m.by)
    }

    /// Nodes other users are editing.
    pub fn editing_indicators(&self) -> Vec<EditingIndicator> {
        self.doc
            .nodes()
            .into_iter()
            .filter_map(|n| match n.edited_by {
                Some(user_id) if n.is_being_edited && user_id != self.user.user_id => {
                    Some(EditingIndicator {
                        node_id: n.id,
                        user_id,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Merges a frame from the server.
    ///
    /// A snapshot replaces the replica; local changes not yet taken from the
    /// outbox are re-applied on top so they are not lost.
    pub fn apply_server_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Snapshot(state) => {
                let unsent = self
                    .unsent_since
                    .as_ref()
                    .map(|since| self.doc.encode_since(since));
                match rebuild(&state, unsent.as_deref()) {
                    Ok((doc, base)) => {
                        if unsent.is_some() {
                            self.unsent_since = Some(base);
                        }
                        self.doc = doc;
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring unreadable snapshot"),
                }
            }
            ServerFrame::Update(update) => {
                if let Err(e) = self.doc.apply_update(&update) {
                    tracing::warn!(error = %e, "Ignoring unreadable update");
                }
            }
            ServerFrame::Rejected { reason } => {
                tracing::warn!(reason = %reason, "Server rejected update");
                self.last_rejection = Some(reason);
            }
            ServerFrame::Peers { participants } => self.peers = participants,
            ServerFrame::Pong => {}
        }
    }
}

/// Replica from a snapshot with `unsent` local changes on top, and the
/// snapshot's own state vector.
fn rebuild(state: &[u8], unsent: Option<&[u8]>) -> Result<(DiagramDoc, StateVector), ChangeError> {
    let mut doc = DiagramDoc::from_update(state)?;
    let base = doc.state_vector();
    if let Some(unsent) = unsent {
        doc.apply_update(unsent)?;
    }
    Ok((doc, base))
}
