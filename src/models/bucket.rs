//! Represents a logical bucket — a per-account namespace for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A storage bucket in the local blob store.
///
/// Buckets scope object names: two accounts may both hold `report.pdf`
/// because their object keys differ by bucket.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Bucket name (must conform to DNS naming rules).
    pub name: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
