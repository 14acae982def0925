//! Database module: entity models and SQL repositories.
//!
//! Split into three submodules:
//! - `model`: typed rows and insert payloads used by the pipeline.
//! - `query`: dynamic SELECT construction for the listing filter surface.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `rental_digest::db`; the repository
//! API and commonly used models are re-exported here.

pub mod model;
pub mod query;
pub mod repo;

pub use repo::*;

pub use model::{SendRecordInsert, SentListingInsert, SentListingSnapshot};
