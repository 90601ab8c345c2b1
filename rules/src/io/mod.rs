//! Side-effecting helpers: configuration, rule discovery, input documents.

pub mod config;
pub mod init;
pub mod input;
pub mod locator;
