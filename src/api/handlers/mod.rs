mod diagrams;
mod favorites;
mod health;
mod learning_paths;

pub use diagrams::*;
pub use favorites::*;
pub use health::*;
pub use learning_paths::*;

use crate::api::ApiError;
use crate::db::Database;

/// Runs a store call on the blocking pool and maps its error for the API.
async fn blocking<T, F>(db: &Database, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
        .map_err(ApiError::from)
}
