//! Core data models for the deduplicating file store.
//!
//! `bucket` and `object` map rows of the local blob catalog via
//! `sqlx::FromRow`; `file_record` is the document shape kept in the
//! metadata index and serializes as JSON via `serde`.

pub mod bucket;
pub mod file_record;
pub mod object;
