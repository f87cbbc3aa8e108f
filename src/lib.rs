//! Catalog→channel synchronization connector.
//!
//! Decides which products belong on each configured channel account,
//! keeps their exported representation up to date, and reconciles
//! create/update/delete operations against the platform's bulk API.

pub mod config;
pub mod db;
pub mod domain;
pub mod mapping;
pub mod membership;
pub mod model;
pub mod remote;
pub mod scheduler;
pub mod sync;
