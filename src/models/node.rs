use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest label accepted for any node.
pub const MAX_LABEL_LEN: usize = 200;

/// Canvas coordinates of a node's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Rendered size reported back by the editor canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// Which side of the learning path spine a node hangs off.
///
/// Serialized as the numeric codes the editor uses: `0` center, `1` right,
/// `2` left, `3` unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Side {
    Center,
    Right,
    Left,
    #[default]
    Unspecified,
}

impl Side {
    /// Side implied by a horizontal position: the spine sits at `x = 0`.
    pub fn for_x(x: f64) -> Self {
        if x >= 0.0 {
            Self::Right
        } else {
            Self::Left
        }
    }
}

impl From<Side> for u8 {
    fn from(side: Side) -> Self {
        match side {
            Side::Center => 0,
            Side::Right => 1,
            Side::Left => 2,
            Side::Unspecified => 3,
        }
    }
}

impl TryFrom<u8> for Side {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Center),
            1 => Ok(Self::Right),
            2 => Ok(Self::Left),
            3 => Ok(Self::Unspecified),
            other => Err(format!("invalid side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Article,
    Video,
}

/// External learning material linked from a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartData {
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicData {
    pub label: String,
    #[serde(default)]
    pub side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtopicData {
    pub label: String,
    #[serde(default)]
    pub side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomData {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

/// The node kind tag, as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    Topic,
    Subtopic,
    Custom,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Topic => "topic",
            Self::Subtopic => "subtopic",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "topic" => Ok(Self::Topic),
            "subtopic" => Ok(Self::Subtopic),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown node type: {}", other)),
        }
    }
}

/// A node's `type` tag together with its payload.
///
/// Each node type has a fixed `data` schema; an unknown `type` or a payload
/// that does not match its type is rejected during deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum NodeBody {
    Start(StartData),
    Topic(TopicData),
    Subtopic(SubtopicData),
    Custom(CustomData),
}

impl NodeBody {
    /// Fresh payload for a node added from the editor toolbar.
    pub fn template(kind: NodeKind, position: Position) -> Self {
        let label = match kind {
            NodeKind::Start => "Start",
            NodeKind::Topic => "Topic",
            NodeKind::Subtopic => "Subtopic",
            NodeKind::Custom => "Custom",
        }
        .to_string();
        let side = Side::for_x(position.x);

        match kind {
            NodeKind::Start => Self::Start(StartData { label }),
            NodeKind::Topic => Self::Topic(TopicData {
                label,
                side,
                description: None,
                resources: Vec::new(),
            }),
            NodeKind::Subtopic => Self::Subtopic(SubtopicData {
                label,
                side,
                parent_id: None,
                description: None,
                resources: Vec::new(),
            }),
            NodeKind::Custom => Self::Custom(CustomData {
                label,
                description: None,
                level: None,
            }),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Start(_) => NodeKind::Start,
            Self::Topic(_) => NodeKind::Topic,
            Self::Subtopic(_) => NodeKind::Subtopic,
            Self::Custom(_) => NodeKind::Custom,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Start(d) => &d.label,
            Self::Topic(d) => &d.label,
            Self::Subtopic(d) => &d.label,
            Self::Custom(d) => &d.label,
        }
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        let label = label.into();
        match self {
            Self::Start(d) => d.label = label,
            Self::Topic(d) => d.label = label,
            Self::Subtopic(d) => d.label = label,
            Self::Custom(d) => d.label = label,
        }
    }

    /// The side annotation, for the node types that carry one.
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::Topic(d) => Some(d.side),
            Self::Subtopic(d) => Some(d.side),
            Self::Start(_) | Self::Custom(_) => None,
        }
    }

    /// Sets the side annotation. Returns `false` for node types without one.
    pub fn set_side(&mut self, side: Side) -> bool {
        match self {
            Self::Topic(d) => d.side = side,
            Self::Subtopic(d) => d.side = side,
            Self::Start(_) | Self::Custom(_) => return false,
        }
        true
    }
}

/// A diagram node.
///
/// `is_being_edited` and `edited_by` are collaborative annotations owned by
/// the live session; they are never written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub body: NodeBody,
    #[serde(default)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured: Option<Size>,
    #[serde(default)]
    pub is_being_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_by: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, body: NodeBody, position: Position) -> Self {
        Self {
            id: id.into(),
            body,
            position,
            measured: None,
            is_being_edited: false,
            edited_by: None,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.body.kind()
    }

    pub fn label(&self) -> &str {
        self.body.label()
    }
}

/// A directed connection between two nodes.
///
/// Handles name the connection point on each endpoint, so a node can expose
/// several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    /// Edge id derived from its endpoints, matching what the editor generates
    /// on connect.
    pub fn connection_id(
        source: &str,
        source_handle: Option<&str>,
        target: &str,
        target_handle: Option<&str>,
    ) -> String {
        format!(
            "e{}{}-{}{}",
            source,
            source_handle.unwrap_or(""),
            target,
            target_handle.unwrap_or("")
        )
    }
}
