//! Deterministic, pure logic shared by the rule runner.
//!
//! Core modules must be free of I/O and interpreter state. They operate on
//! plain data and return deterministic outputs suitable for tests.

pub mod chain;
pub mod types;
