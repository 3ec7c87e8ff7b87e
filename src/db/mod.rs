mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::collab::DocumentStore;
use crate::models::*;

/// A write that collides with a uniqueness rule in the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreConflict {
    #[error("Diagram with name '{0}' already exists")]
    DiagramNameTaken(String),
    #[error("Diagram for learning path '{0}' already exists")]
    LearningPathHasDiagram(String),
}

const DIAGRAM_COLUMNS: &str =
    "id, learning_path_id, name, nodes, edges, created_at, updated_at";

const LEARNING_PATH_SELECT: &str =
    "SELECT lp.id, lp.title, lp.description, lp.is_public, lp.thumbnail, lp.community,
            lp.created_at, lp.updated_at, d.id
     FROM learning_paths lp
     LEFT JOIN diagrams d ON d.learning_path_id = lp.id";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens and migrates the store, retrying a bounded number of times with
    /// a fixed delay between attempts.
    pub async fn open_with_retry(path: PathBuf, attempts: u32, delay: Duration) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = Self::open(path.clone()).and_then(|db| {
                db.migrate()?;
                Ok(db)
            });
            match result {
                Ok(db) => {
                    tracing::info!(path = %path.display(), "Connected to store");
                    return Ok(db);
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Failed to open store, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "Failed to open store after {} attempts",
                        attempts
                    )))
                }
            }
        }
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    /// Cheap round trip used by the detailed health check.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?;
        Ok(())
    }

    // ============================================================
    // Diagram operations
    // ============================================================

    pub fn get_all_diagrams(&self) -> Result<Vec<DiagramSummary>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, learning_path_id, name, created_at, updated_at
             FROM diagrams ORDER BY name",
        )?;

        let diagrams = stmt
            .query_map([], |row| {
                Ok(DiagramSummary {
                    id: parse_uuid(row.get::<_, String>(0)?),
                    learning_path_id: row.get(1)?,
                    name: row.get(2)?,
                    created_at: parse_datetime(row.get::<_, String>(3)?),
                    updated_at: parse_datetime(row.get::<_, String>(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(diagrams)
    }

    pub fn get_diagram_by_name(&self, name: &str) -> Result<Option<Diagram>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        diagram_by_name(&conn, name)
    }

    pub fn get_diagram_by_learning_path(&self, learning_path_id: &str) -> Result<Option<Diagram>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        diagram_by_learning_path(&conn, learning_path_id)
    }

    /// Creates a diagram from explicit content. Fails with
    /// [`StoreConflict`] when the name or learning path is already taken.
    pub fn create_diagram(&self, input: CreateDiagramInput) -> Result<Diagram> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::Missing("name").into());
        }
        let mut content = DiagramContent {
            nodes: input.nodes,
            edges: input.edges,
        };
        content.validate()?;
        content.strip_session_marks();

        let learning_path_id = input
            .learning_path_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| name.clone());

        let conn = self.conn.lock().expect("database lock poisoned");
        if diagram_by_learning_path(&conn, &learning_path_id)?.is_some() {
            return Err(StoreConflict::LearningPathHasDiagram(learning_path_id).into());
        }
        if diagram_by_name(&conn, &name)?.is_some() {
            return Err(StoreConflict::DiagramNameTaken(name).into());
        }

        insert_diagram(&conn, &learning_path_id, &name, content)
    }

    /// Creates the diagram for a learning path from the default template.
    ///
    /// Idempotent per learning path: when a diagram already exists it is
    /// returned unchanged as [`CreateOutcome::Existing`]. An empty or absent
    /// name falls back to the learning-path id.
    pub fn create_diagram_for_learning_path(
        &self,
        learning_path_id: &str,
        name: Option<&str>,
    ) -> Result<CreateOutcome> {
        let learning_path_id = learning_path_id.trim();
        if learning_path_id.is_empty() {
            return Err(ValidationError::Missing("learningPathId").into());
        }
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(learning_path_id)
            .to_string();

        let conn = self.conn.lock().expect("database lock poisoned");
        if let Some(existing) = diagram_by_learning_path(&conn, learning_path_id)? {
            return Ok(CreateOutcome::Existing(existing));
        }
        if diagram_by_name(&conn, &name)?.is_some() {
            return Err(StoreConflict::DiagramNameTaken(name).into());
        }

        insert_diagram(&conn, learning_path_id, &name, DiagramContent::template())
            .map(CreateOutcome::Created)
    }

    /// Replaces the nodes and edges of the diagram with the given name.
    pub fn replace_diagram_content(
        &self,
        name: &str,
        mut content: DiagramContent,
    ) -> Result<Option<Diagram>> {
        content.validate()?;
        content.strip_session_marks();

        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(existing) = diagram_by_name(&conn, name)? else {
            return Ok(None);
        };

        let now = Utc::now();
        conn.execute(
            "UPDATE diagrams SET nodes = ?, edges = ?, updated_at = ? WHERE id = ?",
            (
                serde_json::to_string(&content.nodes)?,
                serde_json::to_string(&content.edges)?,
                now.to_rfc3339(),
                existing.id.to_string(),
            ),
        )?;

        Ok(Some(Diagram {
            nodes: content.nodes,
            edges: content.edges,
            updated_at: now,
            ..existing
        }))
    }

    /// Partially updates the diagram of a learning path. Returns `None` when
    /// the learning path has no diagram.
    pub fn update_diagram_for_learning_path(
        &self,
        learning_path_id: &str,
        input: UpdateDiagramInput,
    ) -> Result<Option<Diagram>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(existing) = diagram_by_learning_path(&conn, learning_path_id)? else {
            return Ok(None);
        };

        let name = match input.name {
            Some(name) => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(ValidationError::Missing("name").into());
                }
                if name != existing.name && diagram_by_name(&conn, &name)?.is_some() {
                    return Err(StoreConflict::DiagramNameTaken(name).into());
                }
                name
            }
            None => existing.name.clone(),
        };

        let mut content = DiagramContent {
            nodes: input.nodes.unwrap_or_else(|| existing.nodes.clone()),
            edges: input.edges.unwrap_or_else(|| existing.edges.clone()),
        };
        content.validate()?;
        content.strip_session_marks();

        let now = Utc::now();
        conn.execute(
            "UPDATE diagrams SET name = ?, nodes = ?, edges = ?, updated_at = ? WHERE id = ?",
            (
                &name,
                serde_json::to_string(&content.nodes)?,
                serde_json::to_string(&content.edges)?,
                now.to_rfc3339(),
                existing.id.to_string(),
            ),
        )?;

        Ok(Some(Diagram {
            name,
            nodes: content.nodes,
            edges: content.edges,
            updated_at: now,
            ..existing
        }))
    }

    pub fn delete_diagram_for_learning_path(&self, learning_path_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "DELETE FROM diagrams WHERE learning_path_id = ?",
            [learning_path_id],
        )?;
        Ok(rows > 0)
    }

    /// Graph of a learning path's diagram, if one exists.
    pub fn get_diagram_content(&self, learning_path_id: &str) -> Result<Option<DiagramContent>> {
        Ok(self
            .get_diagram_by_learning_path(learning_path_id)?
            .map(|d| d.content()))
    }

    /// Writes session content for a learning path, creating the diagram when
    /// none exists yet. A new diagram is named after the learning path, with
    /// a ` (2)`, ` (3)`, ... suffix when that name is taken.
    pub fn save_diagram_content(
        &self,
        learning_path_id: &str,
        mut content: DiagramContent,
    ) -> Result<()> {
        content.strip_session_marks();
        content.validate()?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE diagrams SET nodes = ?, edges = ?, updated_at = ? WHERE learning_path_id = ?",
            (
                serde_json::to_string(&content.nodes)?,
                serde_json::to_string(&content.edges)?,
                &now,
                learning_path_id,
            ),
        )?;

        if rows == 0 {
            let base = Uuid::parse_str(learning_path_id)
                .ok()
                .map(|id| learning_path_by_id(&conn, id))
                .transpose()?
                .flatten()
                .map(|path| path.title)
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| learning_path_id.to_string());
            let name = free_diagram_name(&conn, base.trim())?;
            insert_diagram(&conn, learning_path_id, &name, content)?;
        }
        Ok(())
    }

    /// Whether `key` names an existing learning path.
    pub fn learning_path_exists(&self, key: &str) -> Result<bool> {
        let Ok(id) = Uuid::parse_str(key) else {
            return Ok(false);
        };
        let conn = self.conn.lock().expect("database lock poisoned");
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM learning_paths WHERE id = ?", [id.to_string()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    // ============================================================
    // Learning path operations
    // ============================================================

    pub fn get_learning_paths(&self, community: Option<&str>) -> Result<Vec<LearningPath>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let (sql, params): (String, Vec<String>) = match community {
            Some(c) => (
                format!("{} WHERE lp.community = ? ORDER BY lp.title", LEARNING_PATH_SELECT),
                vec![c.to_string()],
            ),
            None => (format!("{} ORDER BY lp.title", LEARNING_PATH_SELECT), vec![]),
        };

        let mut stmt = conn.prepare(&sql)?;
        let mut paths = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), learning_path_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        for path in &mut paths {
            path.skills = load_skills(&conn, path.id)?;
        }
        Ok(paths)
    }

    pub fn get_learning_path(&self, id: Uuid) -> Result<Option<LearningPath>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        learning_path_by_id(&conn, id)
    }

    pub fn create_learning_path(&self, input: CreateLearningPathInput) -> Result<LearningPath> {
        let title = input
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ValidationError::Missing("title"))?
            .to_string();
        let skills = normalize_skills(input.skills);

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();
        let is_public = input.is_public.unwrap_or(true);

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO learning_paths (id, title, description, is_public, thumbnail, community, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &title,
                &input.description,
                if is_public { 1 } else { 0 },
                &input.thumbnail,
                &input.community,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;
        write_skills(&tx, id, &skills)?;
        tx.commit()?;

        Ok(LearningPath {
            id,
            title,
            description: input.description,
            is_public,
            thumbnail: input.thumbnail,
            skills,
            community: input.community,
            diagram_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_learning_path(
        &self,
        id: Uuid,
        input: UpdateLearningPathInput,
    ) -> Result<Option<LearningPath>> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let Some(existing) = learning_path_by_id(&conn, id)? else {
            return Ok(None);
        };

        let title = match input.title {
            Some(t) if t.trim().is_empty() => return Err(ValidationError::Missing("title").into()),
            Some(t) => t.trim().to_string(),
            None => existing.title.clone(),
        };
        let description = input.description.or(existing.description.clone());
        let is_public = input.is_public.unwrap_or(existing.is_public);
        let thumbnail = input.thumbnail.or(existing.thumbnail.clone());
        let now = Utc::now();

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE learning_paths SET title = ?, description = ?, is_public = ?, thumbnail = ?, updated_at = ?
             WHERE id = ?",
            (
                &title,
                &description,
                if is_public { 1 } else { 0 },
                &thumbnail,
                now.to_rfc3339(),
                id.to_string(),
            ),
        )?;
        let skills = match input.skills {
            Some(skills) => {
                let skills = normalize_skills(skills);
                tx.execute(
                    "DELETE FROM learning_path_skills WHERE learning_path_id = ?",
                    [id.to_string()],
                )?;
                write_skills(&tx, id, &skills)?;
                skills
            }
            None => existing.skills.clone(),
        };
        tx.commit()?;

        Ok(Some(LearningPath {
            title,
            description,
            is_public,
            thumbnail,
            skills,
            updated_at: now,
            ..existing
        }))
    }

    /// Deletes a learning path together with its diagram, skills and
    /// favorites. Returns `false` when nothing was deleted.
    pub fn delete_learning_path(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let id = id.to_string();

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM learning_path_skills WHERE learning_path_id = ?", [&id])?;
        tx.execute("DELETE FROM favorites WHERE learning_path_id = ?", [&id])?;
        tx.execute("DELETE FROM diagrams WHERE learning_path_id = ?", [&id])?;
        let rows = tx.execute("DELETE FROM learning_paths WHERE id = ?", [&id])?;
        tx.commit()?;

        Ok(rows > 0)
    }

    // ============================================================
    // Favorite operations
    // ============================================================

    /// Marks a learning path as a favorite of `user_id`. Returns `None` when
    /// the learning path does not exist. Adding twice keeps the first
    /// timestamp.
    pub fn add_favorite(&self, user_id: &str, learning_path_id: Uuid) -> Result<Option<Favorite>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM learning_paths WHERE id = ?)",
            [learning_path_id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(None);
        }

        conn.execute(
            "INSERT OR IGNORE INTO favorites (user_id, learning_path_id, created_at) VALUES (?, ?, ?)",
            (user_id, learning_path_id.to_string(), Utc::now().to_rfc3339()),
        )?;

        let created_at: String = conn.query_row(
            "SELECT created_at FROM favorites WHERE user_id = ? AND learning_path_id = ?",
            (user_id, learning_path_id.to_string()),
            |row| row.get(0),
        )?;

        Ok(Some(Favorite {
            user_id: user_id.to_string(),
            learning_path_id,
            created_at: parse_datetime(created_at),
        }))
    }

    pub fn remove_favorite(&self, user_id: &str, learning_path_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "DELETE FROM favorites WHERE user_id = ? AND learning_path_id = ?",
            (user_id, learning_path_id.to_string()),
        )?;
        Ok(rows > 0)
    }

    pub fn get_favorites(&self, user_id: &str) -> Result<Vec<LearningPath>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let sql = format!(
            "{} JOIN favorites f ON f.learning_path_id = lp.id
             WHERE f.user_id = ? ORDER BY f.created_at, lp.title",
            LEARNING_PATH_SELECT
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut paths = stmt
            .query_map([user_id], learning_path_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        for path in &mut paths {
            path.skills = load_skills(&conn, path.id)?;
        }
        Ok(paths)
    }
}

impl DocumentStore for Database {
    fn load_document(&self, key: &str) -> Result<Option<DiagramContent>> {
        self.get_diagram_content(key)
    }

    fn save_document(&self, key: &str, content: &DiagramContent) -> Result<()> {
        self.save_diagram_content(key, content.clone())
    }

    fn can_create(&self, key: &str) -> Result<bool> {
        self.learning_path_exists(key)
    }
}

// ============================================================
// Row helpers
// ============================================================

fn diagram_by_name(conn: &Connection, name: &str) -> Result<Option<Diagram>> {
    let sql = format!("SELECT {} FROM diagrams WHERE name = ?", DIAGRAM_COLUMNS);
    Ok(conn.query_row(&sql, [name], diagram_from_row).optional()?)
}

/// `base`, or `base (n)` with the smallest `n >= 2` no diagram uses.
fn free_diagram_name(conn: &Connection, base: &str) -> Result<String> {
    if diagram_by_name(conn, base)?.is_none() {
        return Ok(base.to_string());
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{} ({})", base, n);
        if diagram_by_name(conn, &candidate)?.is_none() {
            return Ok(candidate);
        }
        n += 1;
    }
}

fn diagram_by_learning_path(conn: &Connection, learning_path_id: &str) -> Result<Option<Diagram>> {
    let sql = format!(
        "SELECT {} FROM diagrams WHERE learning_path_id = ?",
        DIAGRAM_COLUMNS
    );
    Ok(conn
        .query_row(&sql, [learning_path_id], diagram_from_row)
        .optional()?)
}

fn insert_diagram(
    conn: &Connection,
    learning_path_id: &str,
    name: &str,
    content: DiagramContent,
) -> Result<Diagram> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    conn.execute(
        "INSERT INTO diagrams (id, learning_path_id, name, nodes, edges, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        (
            id.to_string(),
            learning_path_id,
            name,
            serde_json::to_string(&content.nodes)?,
            serde_json::to_string(&content.edges)?,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ),
    )?;

    Ok(Diagram {
        id,
        learning_path_id: learning_path_id.to_string(),
        name: name.to_string(),
        nodes: content.nodes,
        edges: content.edges,
        created_at: now,
        updated_at: now,
    })
}

fn diagram_from_row(row: &Row<'_>) -> rusqlite::Result<Diagram> {
    Ok(Diagram {
        id: parse_uuid(row.get::<_, String>(0)?),
        learning_path_id: row.get(1)?,
        name: row.get(2)?,
        nodes: parse_json_column(row, 3)?,
        edges: parse_json_column(row, 4)?,
        created_at: parse_datetime(row.get::<_, String>(5)?),
        updated_at: parse_datetime(row.get::<_, String>(6)?),
    })
}

fn learning_path_by_id(conn: &Connection, id: Uuid) -> Result<Option<LearningPath>> {
    let sql = format!("{} WHERE lp.id = ?", LEARNING_PATH_SELECT);
    let path = conn
        .query_row(&sql, [id.to_string()], learning_path_from_row)
        .optional()?;

    match path {
        Some(mut path) => {
            path.skills = load_skills(conn, id)?;
            Ok(Some(path))
        }
        None => Ok(None),
    }
}

fn learning_path_from_row(row: &Row<'_>) -> rusqlite::Result<LearningPath> {
    Ok(LearningPath {
        id: parse_uuid(row.get::<_, String>(0)?),
        title: row.get(1)?,
        description: row.get(2)?,
        is_public: row.get::<_, i32>(3)? != 0,
        thumbnail: row.get(4)?,
        community: row.get(5)?,
        created_at: parse_datetime(row.get::<_, String>(6)?),
        updated_at: parse_datetime(row.get::<_, String>(7)?),
        diagram_id: row.get::<_, Option<String>>(8)?.map(parse_uuid),
        skills: Vec::new(),
    })
}

fn load_skills(conn: &Connection, learning_path_id: Uuid) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT skill FROM learning_path_skills WHERE learning_path_id = ? ORDER BY position",
    )?;
    let skills = stmt
        .query_map([learning_path_id.to_string()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(skills)
}

fn write_skills(conn: &Connection, learning_path_id: Uuid, skills: &[String]) -> Result<()> {
    for (position, skill) in skills.iter().enumerate() {
        conn.execute(
            "INSERT INTO learning_path_skills (learning_path_id, position, skill) VALUES (?, ?, ?)",
            (learning_path_id.to_string(), position as i64, skill),
        )?;
    }
    Ok(())
}

/// Trims, drops blanks and removes duplicates while keeping first-seen order.
fn normalize_skills(skills: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(skills.len());
    for skill in skills {
        let skill = skill.trim();
        if !skill.is_empty() && !out.iter().any(|s| s == skill) {
            out.push(skill.to_string());
        }
    }
    out
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_skills_trims_and_dedupes() {
        let skills = normalize_skills(vec![
            " rust ".to_string(),
            "".to_string(),
            "tokio".to_string(),
            "rust".to_string(),
        ]);
        assert_eq!(skills, vec!["rust", "tokio"]);
    }
}
