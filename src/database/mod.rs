// Database module
// SQLite holds the entity/position mapping, the index file registry and the consumed source tables

pub mod sqlite;

pub use sqlite::*;
