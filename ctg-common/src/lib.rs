//! Shared foundation for CTG modules
//!
//! Owns the pieces every CTG process needs: the common error type, the
//! environment-driven configuration, the SQLite schema and access modules,
//! and the in-process event bus used for pipeline progress reporting.

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
