//! Civicline storage crate - SQLite persistence and the file-backed catalog.
//!
//! Provides a WAL-mode SQLite database with migrations, the
//! [`SqliteStore`] implementation of `ConversationStore`, and a
//! [`FileCatalog`] that serves the materialized resource catalog.

pub mod catalog;
pub mod db;
pub mod migrations;
pub mod repository;

pub use catalog::FileCatalog;
pub use db::Database;
pub use repository::SqliteStore;
