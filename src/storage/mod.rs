//! Series persistence
//!
//! - `series`: the rolling in-memory store every session writes to
//! - `backend`: trait for durable storage behind it
//! - `sqlite` (feature `storage-sqlite`) and `memory`: backend implementations

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
pub mod series;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use schema::{MetricKind, SeriesData, SeriesKey, SeriesPoint};
pub use series::SeriesStore;
