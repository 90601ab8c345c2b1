//! Runs the rule chain for one simulated authentication request.
//!
//! [`RulesRunner`] is cheap to clone and safe to share: the compiled
//! [`Registry`] sits behind an `Arc` and every [`RulesRunner::run`] call gets
//! its own sandbox invocation, so concurrent requests never observe each
//! other's state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::chain::{ChainState, TurnOutcome, TurnResolution, resolve_turn};
use crate::core::types::{Claims, RuleContext, RuleDiagnostic, RuleSignal, RuleUser};
use crate::error::{Result, RulesError};
use crate::io::config::RulesConfig;
use crate::io::locator::locate_rules;
use crate::registry::Registry;
use crate::sandbox::{ModuleTable, SandboxHost, SandboxSettings};

/// Final state of one runner call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "A: Serialize, I: Serialize",
    deserialize = "A: DeserializeOwned + Default, I: DeserializeOwned + Default"
))]
pub struct RunOutcome<A = Claims, I = Claims> {
    pub user: RuleUser,
    pub context: RuleContext<A, I>,
    /// Set when a rule ended the chain early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<RuleSignal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<RuleDiagnostic>,
}

impl<A, I> RunOutcome<A, I> {
    /// The input handed back untouched.
    pub fn unchanged(user: RuleUser, context: RuleContext<A, I>) -> Self {
        Self {
            user,
            context,
            signal: None,
            diagnostics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Origin {
    config: RulesConfig,
    cwd: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RulesRunner {
    registry: Arc<Registry>,
    host: SandboxHost,
    origin: Option<Origin>,
}

impl Default for RulesRunner {
    fn default() -> Self {
        Self::noop()
    }
}

impl RulesRunner {
    /// Runner without rules. `run` returns its input unchanged.
    pub fn noop() -> Self {
        Self::new(Registry::empty(), SandboxHost::default())
    }

    pub fn new(registry: Registry, host: SandboxHost) -> Self {
        Self {
            registry: Arc::new(registry),
            host,
            origin: None,
        }
    }

    /// Load and compile everything `config` points at, resolving relative
    /// paths against `cwd`.
    #[instrument(skip_all, fields(cwd = %cwd.display()))]
    pub fn from_config(config: &RulesConfig, cwd: &Path) -> Result<Self> {
        config
            .validate()
            .map_err(|err| RulesError::configuration(format!("{err:#}")))?;
        let settings = config.sandbox_settings();
        let Some(rules_dir) = config.rules_dir(cwd) else {
            debug!("no rules_path configured; runner is a no-op");
            return Ok(Self {
                origin: Some(Origin {
                    config: config.clone(),
                    cwd: cwd.to_path_buf(),
                }),
                ..Self::new(Registry::empty(), SandboxHost::new(settings, None))
            });
        };

        let pattern = config.file_regex()?;
        let sources = locate_rules(&rules_dir, &pattern)?;
        let modules = match config.modules_dir(cwd) {
            Some(dir) => Some(Arc::new(ModuleTable::load(&dir, &pattern)?)),
            None => None,
        };
        let host = SandboxHost::new(settings, modules);
        let registry = Registry::build(sources, &host)?;
        info!(
            rules = registry.len(),
            modules = host.modules().map_or(0, |table| table.names().len()),
            "loaded rules"
        );

        Ok(Self {
            registry: Arc::new(registry),
            host,
            origin: Some(Origin {
                config: config.clone(),
                cwd: cwd.to_path_buf(),
            }),
        })
    }

    /// Rules from `dir` with default settings.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        Self::from_config(&RulesConfig::for_rules_path(dir), Path::new("."))
    }

    pub fn rule_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &SandboxSettings {
        self.host.settings()
    }

    /// Re-read the rules from disk. Invocations already running keep the
    /// registry they started with.
    pub fn reload(&mut self) -> Result<()> {
        let Some(origin) = self.origin.clone() else {
            return Ok(());
        };
        *self = Self::from_config(&origin.config, &origin.cwd)?;
        Ok(())
    }

    /// Run every rule in order against `user` and `context`.
    #[instrument(skip_all, fields(rules = self.registry.len()))]
    pub async fn run<A, I>(
        &self,
        user: RuleUser,
        context: RuleContext<A, I>,
    ) -> Result<RunOutcome<A, I>>
    where
        A: Serialize + DeserializeOwned + Default,
        I: Serialize + DeserializeOwned + Default,
    {
        let rules = self.registry.rules();
        let mut state = ChainState::Idle.start(rules.len());
        if state.is_terminal() {
            return Ok(RunOutcome::unchanged(user, context));
        }

        let policy = self.host.settings().error_policy;
        let mut invocation = self.host.create_invocation(&user, &context)?;
        // Typed user/context as of the last turn that left them representable.
        let mut resolved = (user, context);

        let mut diagnostics = Vec::new();
        let mut signal = None;
        let mut failure = None;
        while let Some(index) = state.current_rule() {
            let rule = &rules[index];
            let mut outcome = invocation.run_rule(rule).await;
            match invocation.snapshot::<A, I>() {
                Ok(snapshot) => resolved = snapshot,
                Err(err) => {
                    warn!(
                        rule = %rule.identifier(),
                        error = %err,
                        "restoring user/context from before the rule"
                    );
                    invocation.restore(&resolved.0, &resolved.1)?;
                    if matches!(outcome, TurnOutcome::Completed | TurnOutcome::Redirected { .. }) {
                        outcome = TurnOutcome::Threw {
                            message: err.to_string(),
                        };
                    }
                }
            }
            debug!(rule = %rule.identifier(), ?outcome, "rule turn finished");
            match resolve_turn(rule.identifier(), outcome, policy) {
                TurnResolution::Advance(diagnostic) => {
                    if let Some(diagnostic) = diagnostic {
                        warn!(
                            rule = %diagnostic.rule,
                            kind = ?diagnostic.kind,
                            message = %diagnostic.message,
                            "rule failed; continuing"
                        );
                        diagnostics.push(diagnostic);
                    }
                    state = state.advance(rules.len());
                }
                TurnResolution::Stop(stop) => {
                    info!(rule = %stop.rule(), "rule ended the chain early");
                    signal = Some(stop);
                    state = ChainState::Completed;
                }
                TurnResolution::Abort { message } => {
                    warn!(rule = %rule.identifier(), %message, "rule failed; aborting");
                    failure = Some(RulesError::RuleRuntime {
                        rule: rule.identifier().to_string(),
                        message,
                    });
                    state = state.abort();
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        let (user, context) = resolved;
        Ok(RunOutcome {
            user,
            context,
            signal,
            diagnostics,
        })
    }
}
