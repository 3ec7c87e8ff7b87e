use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A course-like aggregate that owns one diagram.
///
/// The learning path is created first; its diagram is then created and
/// linked through the diagram's `learning_path_id`. `diagram_id` is `None`
/// until that second step succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningPath {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub is_public: bool,
    pub thumbnail: Option<String>,
    pub skills: Vec<String>,
    /// Community that owns this path. `None` for unscoped paths.
    pub community: Option<String>,
    pub diagram_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a learning path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLearningPathInput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub community: Option<String>,
}

/// Input for updating a learning path. All fields are optional for partial
/// updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLearningPathInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
    pub thumbnail: Option<String>,
    pub skills: Option<Vec<String>>,
}

/// A user's bookmark on a learning path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Favorite {
    pub user_id: String,
    pub learning_path_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Query string for listing learning paths.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListLearningPathsQuery {
    pub community: Option<String>,
}
