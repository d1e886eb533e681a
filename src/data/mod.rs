//! Data layer module
//!
//! Persists follow relationships in SQLite.

mod database;
mod models;

pub use database::Database;
pub use models::*;

#[cfg(test)]
mod database_test;
