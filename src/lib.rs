//! Persistence layer for user identity: accounts, the audit trail and
//! password reset tokens, with Postgres and in-memory backends.

pub mod audit;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod reset;
pub mod services;
pub mod users;

pub use error::{Error, Result};
