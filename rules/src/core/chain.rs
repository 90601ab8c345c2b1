//! Rule chain state machine.
//!
//! `Idle -> Running(i) -> Completed | Aborted`. The runner owns a
//! [`ChainState`] per invocation and feeds it one [`TurnOutcome`] per rule;
//! [`resolve_turn`] decides whether the chain advances, stops on a rule
//! signal, or aborts.

use crate::core::types::{DiagnosticKind, ErrorPolicy, RuleDiagnostic, RuleSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    Running(usize),
    Completed,
    Aborted,
}

impl ChainState {
    /// Leave `Idle`. An empty chain completes immediately; any other state
    /// is returned as is.
    pub fn start(self, rule_count: usize) -> Self {
        match self {
            Self::Idle if rule_count == 0 => Self::Completed,
            Self::Idle => Self::Running(0),
            other => other,
        }
    }

    /// Move past the current rule.
    pub fn advance(self, rule_count: usize) -> Self {
        match self {
            Self::Running(index) if index + 1 < rule_count => Self::Running(index + 1),
            Self::Running(_) => Self::Completed,
            other => other,
        }
    }

    /// Stop a running chain because a rule failed under the abort policy.
    pub fn abort(self) -> Self {
        match self {
            Self::Running(_) => Self::Aborted,
            other => other,
        }
    }

    pub fn current_rule(self) -> Option<usize> {
        match self {
            Self::Running(index) => Some(index),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// How a single rule's turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// `callback(nil, ...)` without a redirect.
    Completed,
    /// `callback(nil, ...)` after setting `context.redirect`.
    Redirected { url: String },
    /// `callback(err)`.
    Denied { message: String },
    Threw { message: String },
    Stalled,
    TimedOut,
}

/// What the runner does after a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResolution {
    /// Run the next rule, recording a diagnostic if the turn failed.
    Advance(Option<RuleDiagnostic>),
    /// End the chain successfully and hand the signal to the caller.
    Stop(RuleSignal),
    /// Fail the invocation.
    Abort { message: String },
}

pub fn resolve_turn(rule: &str, outcome: TurnOutcome, policy: ErrorPolicy) -> TurnResolution {
    let (kind, message) = match outcome {
        TurnOutcome::Completed => return TurnResolution::Advance(None),
        TurnOutcome::Redirected { url } => {
            return TurnResolution::Stop(RuleSignal::Redirect {
                rule: rule.to_string(),
                url,
            });
        }
        TurnOutcome::Denied { message } => {
            return TurnResolution::Stop(RuleSignal::Denied {
                rule: rule.to_string(),
                message,
            });
        }
        TurnOutcome::Threw { message } => (DiagnosticKind::Threw, message),
        TurnOutcome::Stalled => (
            DiagnosticKind::Stalled,
            "returned without calling back and nothing is scheduled".to_string(),
        ),
        TurnOutcome::TimedOut => (
            DiagnosticKind::TimedOut,
            "did not call back within its time budget".to_string(),
        ),
    };

    match policy {
        ErrorPolicy::Continue => TurnResolution::Advance(Some(RuleDiagnostic {
            rule: rule.to_string(),
            kind,
            message,
        })),
        ErrorPolicy::Abort => TurnResolution::Abort { message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_completes_without_running() {
        assert_eq!(ChainState::Idle.start(0), ChainState::Completed);
        assert_eq!(ChainState::Idle.start(2), ChainState::Running(0));
        assert!(ChainState::Idle.start(0).is_terminal());
    }

    #[test]
    fn advance_walks_every_rule_then_completes() {
        let mut state = ChainState::Idle.start(3);
        let mut visited = Vec::new();
        while let Some(index) = state.current_rule() {
            visited.push(index);
            state = state.advance(3);
        }
        assert_eq!(visited, vec![0, 1, 2]);
        assert_eq!(state, ChainState::Completed);
    }

    #[test]
    fn terminal_states_do_not_advance() {
        assert_eq!(ChainState::Completed.advance(3), ChainState::Completed);
        assert_eq!(ChainState::Aborted.advance(3), ChainState::Aborted);
        assert!(ChainState::Aborted.is_terminal());
        assert!(!ChainState::Idle.is_terminal());
        assert_eq!(ChainState::Running(1).start(3), ChainState::Running(1));
    }

    #[test]
    fn abort_only_leaves_a_running_chain() {
        let state = ChainState::Idle.start(2).abort();
        assert_eq!(state, ChainState::Aborted);
        assert!(state.is_terminal());
        assert_eq!(state.current_rule(), None);
        assert_eq!(ChainState::Completed.abort(), ChainState::Completed);
        assert_eq!(ChainState::Idle.abort(), ChainState::Idle);
    }

    #[test]
    fn thrown_error_is_absorbed_under_continue_policy() {
        let resolution = resolve_turn(
            "b.lua",
            TurnOutcome::Threw {
                message: "boom".to_string(),
            },
            ErrorPolicy::Continue,
        );
        let TurnResolution::Advance(Some(diagnostic)) = resolution else {
            panic!("expected diagnostic, got {resolution:?}");
        };
        assert_eq!(diagnostic.rule, "b.lua");
        assert_eq!(diagnostic.kind, DiagnosticKind::Threw);
        assert_eq!(diagnostic.message, "boom");
    }

    #[test]
    fn timeout_aborts_under_abort_policy() {
        let resolution = resolve_turn("slow.lua", TurnOutcome::TimedOut, ErrorPolicy::Abort);
        assert!(matches!(resolution, TurnResolution::Abort { .. }));
    }

    #[test]
    fn denial_stops_regardless_of_policy() {
        for policy in [ErrorPolicy::Continue, ErrorPolicy::Abort] {
            let resolution = resolve_turn(
                "deny.lua",
                TurnOutcome::Denied {
                    message: "blocked".to_string(),
                },
                policy,
            );
            assert_eq!(
                resolution,
                TurnResolution::Stop(RuleSignal::Denied {
                    rule: "deny.lua".to_string(),
                    message: "blocked".to_string(),
                })
            );
        }
    }

    #[test]
    fn completed_turn_advances_cleanly() {
        assert_eq!(
            resolve_turn("a.lua", TurnOutcome::Completed, ErrorPolicy::Abort),
            TurnResolution::Advance(None)
        );
    }
}
