//! Stable exit codes for rules CLI commands.

/// Command succeeded; for `rules run`, every rule completed.
pub const OK: i32 = 0;
/// Invalid config, rules, or input documents, or any other error.
pub const INVALID: i32 = 1;
/// `rules run` was denied by a rule.
pub const DENIED: i32 = 2;
/// `rules run` was redirected by a rule.
pub const REDIRECTED: i32 = 3;
