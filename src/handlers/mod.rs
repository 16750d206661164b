pub mod file_handlers;
pub mod health_handlers;

use crate::services::dedup_engine::DedupStorageEngine;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: DedupStorageEngine,
    pub db: Arc<SqlitePool>,
    pub storage_dir: PathBuf,
}
