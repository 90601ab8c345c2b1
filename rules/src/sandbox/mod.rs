//! Per-invocation interpreter host.
//!
//! A [`SandboxHost`] is built once from configuration. Every runner call asks
//! it for a fresh [`Invocation`]: a new Lua state opened with only the safe
//! standard libraries, holding the live `user`/`context` tables that rules
//! mutate in turn. Nothing survives the invocation.

mod buffer;
mod capabilities;
mod console;
pub mod modules;
mod timers;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mlua::{
    DeserializeOptions, Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, SerializeOptions,
    StdLib, Table, Value, VmState,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::core::chain::TurnOutcome;
use crate::core::types::{ErrorPolicy, RuleContext, RuleUser};
use crate::error::{Result, RulesError};
use crate::io::config::RulesConfig;
use crate::registry::CompiledRule;

pub use modules::ModuleTable;

use capabilities::CapabilityScope;
use modules::ModuleScope;
use timers::SharedTimers;

/// Instructions between deadline checks.
const HOOK_INTERVAL: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxSettings {
    /// Budget for one rule to call back, timers included.
    pub rule_timeout: Duration,
    pub memory_limit_bytes: usize,
    pub error_policy: ErrorPolicy,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        RulesConfig::default().sandbox_settings()
    }
}

/// Deadline of the turn currently running in a state. The instruction hook
/// reads it, the runner moves it forward at the start of every turn.
pub(crate) type Deadline = Arc<Mutex<Instant>>;

fn deadline_of(deadline: &Deadline) -> Instant {
    *deadline.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_deadline(deadline: &Deadline, at: Instant) {
    *deadline.lock().unwrap_or_else(PoisonError::into_inner) = at;
}

/// Fresh Lua state with the safe libraries, a memory ceiling and the
/// deadline hook installed.
pub(crate) fn new_state(settings: &SandboxSettings, deadline: &Deadline) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(settings.memory_limit_bytes)?;

    let hook_deadline = Arc::clone(deadline);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline_of(&hook_deadline) {
                return Err(mlua::Error::RuntimeError(
                    "rule exceeded its time budget".to_string(),
                ));
            }
            Ok(VmState::Continue)
        },
    );

    // Reachable through the string metatable even without the global.
    let string: Table = lua.globals().raw_get("string")?;
    string.raw_set("dump", Value::Nil)?;
    Ok(lua)
}

/// Builds one [`Invocation`] per runner call.
#[derive(Debug, Clone, Default)]
pub struct SandboxHost {
    settings: SandboxSettings,
    modules: Option<Arc<ModuleTable>>,
}

impl SandboxHost {
    pub fn new(settings: SandboxSettings, modules: Option<Arc<ModuleTable>>) -> Self {
        Self { settings, modules }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn modules(&self) -> Option<&ModuleTable> {
        self.modules.as_deref()
    }

    pub fn create_invocation<U, C>(&self, user: &U, context: &C) -> Result<Invocation>
    where
        U: Serialize,
        C: Serialize,
    {
        let deadline: Deadline = Arc::new(Mutex::new(Instant::now() + self.settings.rule_timeout));
        let lua = new_state(&self.settings, &deadline).map_err(RulesError::sandbox)?;
        let timers: SharedTimers = Arc::default();
        let modules = match &self.modules {
            Some(table) => {
                Some(ModuleScope::new(&lua, Arc::clone(table)).map_err(RulesError::sandbox)?)
            }
            None => None,
        };
        let user = to_table(&lua, "user", user)?;
        let context = to_table(&lua, "context", context)?;
        let redirect_baseline = redirect_url(&context);

        Ok(Invocation {
            scope: CapabilityScope::new(Arc::clone(&timers), modules),
            timers,
            deadline,
            rule_timeout: self.settings.rule_timeout,
            redirect_baseline,
            user,
            context,
            lua,
        })
    }

    /// State for evaluating rule chunks at build time. Chunks see the same
    /// capabilities as at run time, `require` included, but no user/context.
    pub(crate) fn compile_sandbox(&self) -> Result<CompileSandbox> {
        let deadline: Deadline = Arc::new(Mutex::new(Instant::now() + self.settings.rule_timeout));
        let lua = new_state(&self.settings, &deadline).map_err(RulesError::sandbox)?;
        let timers: SharedTimers = Arc::default();
        let modules = match &self.modules {
            Some(table) => {
                Some(ModuleScope::new(&lua, Arc::clone(table)).map_err(RulesError::sandbox)?)
            }
            None => None,
        };
        Ok(CompileSandbox {
            scope: CapabilityScope::new(Arc::clone(&timers), modules),
            timers,
            deadline,
            rule_timeout: self.settings.rule_timeout,
            lua,
        })
    }
}

/// Build-time counterpart of [`Invocation`], shared by every source of one
/// registry build.
pub(crate) struct CompileSandbox {
    scope: CapabilityScope,
    timers: SharedTimers,
    deadline: Deadline,
    rule_timeout: Duration,
    lua: Lua,
}

impl CompileSandbox {
    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Evaluate `chunk` under a fresh time budget. Timers scheduled by
    /// top-level code never fire.
    pub(crate) fn evaluate(&self, identifier: &str, chunk: &str) -> mlua::Result<Value> {
        set_deadline(&self.deadline, Instant::now() + self.rule_timeout);
        let result = self.scope.environment(&self.lua, identifier).and_then(|env| {
            self.lua
                .load(chunk)
                .set_name(format!("@{identifier}"))
                .set_environment(env)
                .eval::<Value>()
        });
        timers::lock(&self.timers).clear();
        result
    }
}

fn to_table<T: Serialize>(lua: &Lua, what: &str, value: &T) -> Result<Table> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    match lua.to_value_with(value, options) {
        Ok(Value::Table(table)) => Ok(table),
        Ok(other) => Err(RulesError::SandboxConstruction {
            message: format!("{what} must be an object, got {}", other.type_name()),
        }),
        Err(err) => Err(RulesError::SandboxConstruction {
            message: format!("cannot marshal {what}: {err}"),
        }),
    }
}

fn from_table<T: DeserializeOwned>(lua: &Lua, what: &str, table: &Table) -> Result<T> {
    let options = DeserializeOptions::new().deny_unsupported_types(false);
    lua.from_value_with(Value::Table(table.clone()), options)
        .map_err(|err| RulesError::Marshal {
            message: format!("{what}: {err}"),
        })
}

/// How a rule's `callback` was invoked.
enum Completion {
    Continue {
        user: Option<Table>,
        context: Option<Table>,
    },
    Error(String),
}

/// The completion signal of one rule turn. The write half is the `callback`
/// handed to the rule and fires at most once.
struct Turn {
    receiver: oneshot::Receiver<Completion>,
}

impl Turn {
    fn open(lua: &Lua, identifier: &str) -> mlua::Result<(Self, Function)> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let rule: Arc<str> = Arc::from(identifier);
        let callback = lua.create_function(
            move |lua, (err, user, context): (Value, Value, Value)| {
                let Some(sender) = sender.lock().unwrap_or_else(PoisonError::into_inner).take()
                else {
                    warn!(rule = %rule, "callback invoked more than once; ignoring");
                    return Ok(());
                };
                let completion = match error_message(lua, &err) {
                    Some(message) => Completion::Error(message),
                    None => Completion::Continue {
                        user: into_table(user),
                        context: into_table(context),
                    },
                };
                // The receiver only goes away once the turn is over.
                let _ = sender.send(completion);
                Ok(())
            },
        )?;
        Ok((Self { receiver }, callback))
    }

    fn try_settle(&mut self) -> Option<Completion> {
        self.receiver.try_recv().ok()
    }
}

fn into_table(value: Value) -> Option<Table> {
    match value {
        Value::Table(table) => Some(table),
        _ => None,
    }
}

/// `None` when `err` is falsy.
fn error_message(lua: &Lua, err: &Value) -> Option<String> {
    match err {
        Value::Nil | Value::Boolean(false) => None,
        Value::LightUserData(ud) if ud.0.is_null() => None,
        Value::String(text) => Some(text.to_string_lossy()),
        Value::Table(table) => match table.raw_get::<Value>("message") {
            Ok(Value::String(text)) => Some(text.to_string_lossy()),
            _ => Some(console::render(lua, err)),
        },
        other => Some(console::render(lua, other)),
    }
}

/// One runner call's interpreter state. Single use.
pub struct Invocation {
    scope: CapabilityScope,
    timers: SharedTimers,
    deadline: Deadline,
    rule_timeout: Duration,
    /// Redirect already present in the input. Only a different url signals.
    redirect_baseline: Option<String>,
    user: Table,
    context: Table,
    lua: Lua,
}

impl Invocation {
    /// Run one rule until it calls back, fails, stalls, or runs out of time.
    /// Timers it left behind are dropped before returning.
    pub async fn run_rule(&mut self, rule: &CompiledRule) -> TurnOutcome {
        let identifier = rule.identifier().to_string();
        set_deadline(&self.deadline, Instant::now() + self.rule_timeout);
        let outcome = self.run_turn(rule).await;
        self.end_turn(&identifier);
        outcome
    }

    async fn run_turn(&mut self, rule: &CompiledRule) -> TurnOutcome {
        let identifier = rule.identifier();

        let (mut turn, called) = match self.start(rule) {
            Ok(started) => started,
            Err(err) => return self.failure(err),
        };
        if let Err(err) = called {
            let Some(completion) = turn.try_settle() else {
                return self.failure(err);
            };
            warn!(rule = %identifier, error = %err, "rule raised after calling back");
            return self.settle(completion);
        }

        loop {
            if let Some(completion) = turn.try_settle() {
                return self.settle(completion);
            }
            let deadline = deadline_of(&self.deadline);
            let next_due = timers::lock(&self.timers).next_due();
            let Some(due) = next_due else {
                debug!(rule = %identifier, "rule returned without calling back");
                return TurnOutcome::Stalled;
            };
            if due >= deadline {
                sleep_until(deadline).await;
                return TurnOutcome::TimedOut;
            }
            sleep_until(due).await;
            if let Err(err) = self.fire_next_timer() {
                if let Some(completion) = turn.try_settle() {
                    warn!(rule = %identifier, error = %err, "timer failed after callback");
                    return self.settle(completion);
                }
                return self.failure(err);
            }
        }
    }

    /// Load the rule chunk in its own environment and call it. The outer
    /// error means the rule never started; the inner one is what the call
    /// raised.
    fn start(&self, rule: &CompiledRule) -> mlua::Result<(Turn, mlua::Result<()>)> {
        let identifier = rule.identifier();
        let (turn, callback) = Turn::open(&self.lua, identifier)?;
        let env = self.scope.environment(&self.lua, identifier)?;
        let function: Function = self
            .lua
            .load(rule.chunk())
            .set_name(rule.chunk_name())
            .set_environment(env)
            .eval()?;
        let called = function.call::<()>((self.user.clone(), self.context.clone(), callback));
        Ok((turn, called))
    }

    fn fire_next_timer(&self) -> mlua::Result<()> {
        let next = timers::lock(&self.timers).take_next();
        let Some((id, callback)) = next else {
            return Ok(());
        };
        callback.call::<()>(())?;
        timers::lock(&self.timers).rearm(id);
        Ok(())
    }

    fn failure(&self, err: mlua::Error) -> TurnOutcome {
        if Instant::now() >= deadline_of(&self.deadline) {
            TurnOutcome::TimedOut
        } else {
            TurnOutcome::Threw {
                message: err.to_string(),
            }
        }
    }

    fn settle(&mut self, completion: Completion) -> TurnOutcome {
        match completion {
            Completion::Error(message) => TurnOutcome::Denied { message },
            Completion::Continue { user, context } => {
                if let Some(user) = user {
                    self.user = user;
                }
                if let Some(context) = context {
                    self.context = context;
                }
                match redirect_url(&self.context) {
                    Some(url) if Some(&url) != self.redirect_baseline.as_ref() => {
                        TurnOutcome::Redirected { url }
                    }
                    _ => TurnOutcome::Completed,
                }
            }
        }
    }

    fn end_turn(&self, identifier: &str) {
        let dropped = timers::lock(&self.timers).clear();
        if dropped > 0 {
            debug!(rule = %identifier, dropped, "dropped timers left pending by rule");
        }
    }

    /// Convert the live tables into typed user/context. Fails with
    /// `Marshal` when a rule left a value the types cannot hold or a cyclic
    /// table.
    pub fn snapshot<A, I>(&self) -> Result<(RuleUser, RuleContext<A, I>)>
    where
        A: DeserializeOwned + Default,
        I: DeserializeOwned + Default,
    {
        let user = from_table(&self.lua, "user", &self.user)?;
        let context = from_table(&self.lua, "context", &self.context)?;
        Ok((user, context))
    }

    /// Replace the live tables with fresh ones built from `user`/`context`.
    pub fn restore<A, I>(&mut self, user: &RuleUser, context: &RuleContext<A, I>) -> Result<()>
    where
        A: Serialize,
        I: Serialize,
    {
        self.user = to_table(&self.lua, "user", user)?;
        self.context = to_table(&self.lua, "context", context)?;
        Ok(())
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        timers::lock(&self.timers).clear();
    }
}

fn redirect_url(context: &Table) -> Option<String> {
    match context.raw_get::<Value>("redirect").ok()? {
        Value::Table(redirect) => redirect.raw_get::<Option<String>>("url").ok().flatten(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Claims, RuleSource};
    use crate::registry::Registry;

    fn compile(identifier: &str, source: &str) -> CompiledRule {
        let registry = Registry::build(
            vec![RuleSource::new(identifier, source)],
            &SandboxHost::default(),
        )
        .expect("build");
        registry.rules()[0].clone()
    }

    fn invocation(settings: SandboxSettings) -> Invocation {
        let context = RuleContext::<Claims, Claims>::with_scope("openid");
        SandboxHost::new(settings, None)
            .create_invocation(&RuleUser::default(), &context)
            .expect("invocation")
    }

    #[tokio::test]
    async fn callback_completes_turn() {
        let mut invocation = invocation(SandboxSettings::default());
        let rule = compile(
            "a.lua",
            "function(user, context, callback) context.scope = context.scope .. ':a'; callback(nil, user, context) end",
        );
        assert_eq!(invocation.run_rule(&rule).await, TurnOutcome::Completed);
        let (_, context) = invocation.snapshot::<Claims, Claims>().expect("snapshot");
        assert_eq!(context.scope, "openid:a");
    }

    #[tokio::test]
    async fn returning_without_callback_stalls() {
        let mut invocation = invocation(SandboxSettings::default());
        let rule = compile("idle.lua", "function(user, context, callback) end");
        assert_eq!(invocation.run_rule(&rule).await, TurnOutcome::Stalled);
    }

    #[tokio::test]
    async fn busy_loop_times_out() {
        let mut invocation = invocation(SandboxSettings {
            rule_timeout: Duration::from_millis(50),
            ..SandboxSettings::default()
        });
        let rule = compile("spin.lua", "function(user, context, callback) while true do end end");
        assert_eq!(invocation.run_rule(&rule).await, TurnOutcome::TimedOut);
    }

    #[tokio::test]
    async fn timer_calls_back_later() {
        let mut invocation = invocation(SandboxSettings::default());
        let rule = compile(
            "later.lua",
            "function(user, context, callback) setTimeout(function() callback(nil, user, context) end, 5) end",
        );
        assert_eq!(invocation.run_rule(&rule).await, TurnOutcome::Completed);
    }

    #[tokio::test]
    async fn error_table_uses_message_field() {
        let mut invocation = invocation(SandboxSettings::default());
        let rule = compile(
            "deny.lua",
            "function(user, context, callback) callback({ message = 'no access' }) end",
        );
        assert_eq!(
            invocation.run_rule(&rule).await,
            TurnOutcome::Denied {
                message: "no access".to_string()
            }
        );
    }

    #[tokio::test]
    async fn raise_after_callback_keeps_completion() {
        let mut invocation = invocation(SandboxSettings::default());
        let rule = compile(
            "late.lua",
            "function(user, context, callback) callback(nil, user, context); error('late') end",
        );
        assert_eq!(invocation.run_rule(&rule).await, TurnOutcome::Completed);
    }

    #[test]
    fn compile_budget_restarts_for_each_chunk() {
        let host = SandboxHost::new(
            SandboxSettings {
                rule_timeout: Duration::from_millis(50),
                ..SandboxSettings::default()
            },
            None,
        );
        let sandbox = host.compile_sandbox().expect("compile sandbox");
        let counting = "local n = 0\nfor i = 1, 100000 do n = n + i end\nreturn n";
        sandbox.evaluate("a.lua", counting).expect("first chunk");
        std::thread::sleep(Duration::from_millis(80));
        sandbox.evaluate("b.lua", counting).expect("second chunk");
    }

    #[test]
    fn compile_budget_still_stops_runaway_chunks() {
        let host = SandboxHost::new(
            SandboxSettings {
                rule_timeout: Duration::from_millis(50),
                ..SandboxSettings::default()
            },
            None,
        );
        let sandbox = host.compile_sandbox().expect("compile sandbox");
        let err = sandbox
            .evaluate("spin.lua", "while true do end")
            .expect_err("should time out");
        assert!(err.to_string().contains("time budget"), "{err}");
    }

    #[test]
    fn falsy_errors_mean_success() {
        let lua = Lua::new();
        assert_eq!(error_message(&lua, &Value::Nil), None);
        assert_eq!(error_message(&lua, &Value::Boolean(false)), None);
        assert_eq!(error_message(&lua, &Value::NULL), None);
        assert_eq!(
            error_message(&lua, &Value::Boolean(true)).as_deref(),
            Some("true")
        );
    }
}
