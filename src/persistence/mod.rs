//! Persistence - Settings, instance records and history in SQLite

mod database;

pub use database::{Database, InstanceEvent};
