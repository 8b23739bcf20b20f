//! Data layer module
//!
//! Handles all data persistence and caching:
//! - SQLite database operations behind the `Store` trait
//! - Remote actor cache (volatile)

mod cache;
mod database;
mod models;
mod store;

pub use cache::ActorCache;
pub use database::SqliteStore;
pub use models::*;
pub use store::Store;
