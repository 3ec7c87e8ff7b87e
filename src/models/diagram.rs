use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::node::{Edge, Node, NodeBody, NodeKind, Position, MAX_LABEL_LEN};

/// A learning path's graph: an ordered list of nodes and the edges between
/// them.
///
/// Each learning path owns at most one diagram, and diagram names are unique
/// across the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagram {
    pub id: Uuid,
    pub learning_path_id: String,
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Diagram {
    pub fn content(&self) -> DiagramContent {
        DiagramContent {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }
}

/// Listing row for `GET /api/diagrams`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramSummary {
    pub id: Uuid,
    pub learning_path_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The graph part of a diagram, which is what collaborative sessions read
/// and write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagramContent {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl DiagramContent {
    /// Starter graph for a newly created learning path: a start node wired
    /// to a first topic.
    pub fn template() -> Self {
        let start_pos = Position::new(0.0, 0.0);
        let topic_pos = Position::new(0.0, 200.0);
        let nodes = vec![
            Node::new(
                "start",
                NodeBody::template(NodeKind::Start, start_pos),
                start_pos,
            ),
            Node::new(
                "topic-1",
                NodeBody::template(NodeKind::Topic, topic_pos),
                topic_pos,
            ),
        ];
        let edges = vec![Edge {
            id: Edge::connection_id("start", None, "topic-1", None),
            source: "start".to_string(),
            target: "topic-1".to_string(),
            source_handle: None,
            target_handle: None,
        }];
        Self { nodes, edges }
    }

    /// Checks the graph invariants: ids are non-empty and unique, labels are
    /// present and bounded, and every edge endpoint names a node in this
    /// diagram.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut node_ids = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(ValidationError::EmptyId);
            }
            if !node_ids.insert(node.id.as_str()) {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
            validate_label(&node.id, node.label())?;
        }

        let mut edge_ids = HashSet::with_capacity(self.edges.len());
        for edge in &self.edges {
            if edge.id.trim().is_empty() {
                return Err(ValidationError::EmptyId);
            }
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(ValidationError::DuplicateEdge(edge.id.clone()));
            }
            for endpoint in [&edge.source, &edge.target] {
                if !node_ids.contains(endpoint.as_str()) {
                    return Err(ValidationError::DanglingEdge {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Drops the per-session editing annotations before the content is
    /// persisted.
    pub fn strip_session_marks(&mut self) {
        for node in &mut self.nodes {
            node.is_being_edited = false;
            node.edited_by = None;
        }
    }
}

pub fn validate_label(node_id: &str, label: &str) -> Result<(), ValidationError> {
    if label.trim().is_empty() {
        return Err(ValidationError::EmptyLabel(node_id.to_string()));
    }
    if label.chars().count() > MAX_LABEL_LEN {
        return Err(ValidationError::LabelTooLong(node_id.to_string()));
    }
    Ok(())
}

/// A diagram or learning path payload that breaks a model invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("ids must not be empty")]
    EmptyId,
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("duplicate edge id: {0}")]
    DuplicateEdge(String),
    #[error("edge {edge} references unknown node {node}")]
    DanglingEdge { edge: String, node: String },
    #[error("node {0} has an empty label")]
    EmptyLabel(String),
    #[error("node {0} label exceeds {max} characters", max = MAX_LABEL_LEN)]
    LabelTooLong(String),
}

/// Input for `POST /api/diagrams`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDiagramInput {
    pub name: String,
    #[serde(default)]
    pub learning_path_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Input for `POST /api/diagrams/by-lp`.
///
/// `learning_path_id` is optional at the type level so a missing value is
/// reported as a validation error rather than a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDiagramByLpInput {
    #[serde(default)]
    pub learning_path_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Input for `PATCH /api/diagrams/by-lp/{lpId}`. All fields are optional for
/// partial updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDiagramInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Option<Vec<Node>>,
    #[serde(default)]
    pub edges: Option<Vec<Edge>>,
}

/// Whether `create_diagram_for_learning_path` inserted a row or found the
/// existing one.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Diagram),
    Existing(Diagram),
}

impl CreateOutcome {
    pub fn diagram(&self) -> &Diagram {
        match self {
            Self::Created(d) | Self::Existing(d) => d,
        }
    }

    pub fn into_diagram(self) -> Diagram {
        match self {
            Self::Created(d) | Self::Existing(d) => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(id: &str, source: &str, target: &str) -> Edge {
        Edge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: None,
            target_handle: None,
        }
    }

    #[test]
    fn template_is_valid_and_non_empty() {
        let content = DiagramContent::template();
        assert!(!content.nodes.is_empty());
        assert!(!content.edges.is_empty());
        assert_eq!(content.validate(), Ok(()));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut content = DiagramContent::template();
        content.edges.push(edge("e-bad", "start", "ghost"));
        assert_eq!(
            content.validate(),
            Err(ValidationError::DanglingEdge {
                edge: "e-bad".to_string(),
                node: "ghost".to_string()
            })
        );
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let mut content = DiagramContent::template();
        let dup = content.nodes[0].clone();
        content.nodes.push(dup);
        assert_eq!(
            content.validate(),
            Err(ValidationError::DuplicateNode("start".to_string()))
        );
    }

    #[test]
    fn blank_label_is_rejected() {
        let mut content = DiagramContent::template();
        content.nodes[1].body.set_label("   ");
        assert_eq!(
            content.validate(),
            Err(ValidationError::EmptyLabel("topic-1".to_string()))
        );
    }

    #[test]
    fn strip_session_marks_clears_edit_state() {
        let mut content = DiagramContent::template();
        content.nodes[0].is_being_edited = true;
        content.nodes[0].edited_by = Some("ada".to_string());

        content.strip_session_marks();

        assert!(!content.nodes[0].is_being_edited);
        assert!(content.nodes[0].edited_by.is_none());
    }
}
