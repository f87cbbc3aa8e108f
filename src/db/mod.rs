//! Database module: view models and SQL repositories.
//!
//! - `model`: typed view structs returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `channel_syncbot::db`; the repository
//! API and commonly used view models are re-exported here.

pub mod model;
pub mod repo;

pub use model::{BindingBrief, BindingForSync};
pub use repo::*;
