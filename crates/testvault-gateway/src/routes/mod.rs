//! HTTP route handlers.

pub mod backup;
pub mod health;
pub mod migration;
pub mod restore;
pub mod scheduler;
