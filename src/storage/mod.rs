//! Local persistence for the auto-sync core.

pub mod db;

pub use db::SqliteStore;
