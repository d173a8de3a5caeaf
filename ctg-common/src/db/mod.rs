//! Database models and queries

pub mod directories;
pub mod evidence;
pub mod files;
pub mod init;
pub mod models;
pub mod outbox;
pub mod pois;
pub mod relationships;
pub mod runs;

pub use init::init_database;
pub use models::*;
