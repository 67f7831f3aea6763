//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed entities returned by repositories.
//! - `repo`: SQL-only functions for instances, the effect log and the archive.
//!
//! External modules should import from `sar_watchbot::db`; the repository
//! API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{Instance, InstanceState};
