//! Sandboxed execution of tenant-authored authentication rules.
//!
//! Rules are Lua functions loaded from a directory. For every simulated
//! login the [`RulesRunner`] threads one `(user, context)` pair through all
//! of them in file order, each inside a fresh interpreter that only exposes
//! a curated capability set. The crate is split the usual way:
//!
//! - **[`core`]**: Pure, deterministic logic (data model, chain state machine).
//!   No I/O, no interpreter.
//! - **[`io`]**: Configuration, rule discovery and input documents.
//! - **[`sandbox`]**: The per-invocation Lua host and its capabilities.
//!
//! [`registry`] and [`executor`] tie these together.

pub mod core;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod registry;
pub mod sandbox;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::core::types::{
    Claims, DiagnosticKind, ErrorPolicy, Redirect, RuleContext, RuleDiagnostic, RuleSignal,
    RuleSource, RuleUser,
};
pub use error::RulesError;
pub use executor::{RulesRunner, RunOutcome};
pub use registry::{CompiledRule, Registry};
