//! Data layer module
//!
//! Handles all data persistence:
//! - Local accounts
//! - Posts
//! - Server-side sessions

mod database;
mod models;

pub use database::Database;
pub use models::*;
