//! Session management module.
//!
//! This module provides:
//! - `DbSession`: The workbench session facade tying engine, pool, cache,
//!   executor, and autocomplete together
//! - `SessionId`: Unique identifier for one engine session

pub mod db;
pub mod id;

pub use db::DbSession;
pub use id::SessionId;
