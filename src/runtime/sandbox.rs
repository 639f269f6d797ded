//! Sandboxed Lua runtime for Code nodes and `{{ }}` expressions
//!
//! Every call gets a fresh interpreter on the blocking pool with only the
//! `table`, `string`, `math` and `utf8` libraries loaded. There is no `io`,
//! `os`, `package`, `require`, `load` or `debug`. A VM hook checks the wall-clock
//! deadline and the cancel flag every thousand instructions and aborts the script
//! from inside the interpreter, so the blocking thread is reclaimed too.
//!
//! The hook cannot fire inside C library calls, so the pattern functions of
//! `string` (`find`, `match`, `gmatch`, `gsub`) estimate their worst-case
//! backtracking up front and refuse to start when it would outlast the
//! remaining budget. `string.rep` is capped by the memory limit.
//!
//! Globals visible to scripts:
//!
//! | name | content |
//! |------|---------|
//! | `items` | all input items |
//! | `json`, `item` | the current item (per-item mode and expressions) |
//! | `itemIndex` | 0-based index of the current item |
//! | `node`, `workflow`, `execution` | metadata tables |
//! | `vars` | resolved variables |
//! | `staticData` | workflow static data, changes are persisted |
//! | `JSON.encode/decode` | JSON helpers |
//! | `console.log/info/warn/error` | captured log lines |
//! | `now()`, `today()`, `time()`, `date(fmt [, ts])`, `parseDate(s)` | time helpers |

use mlua::{HookTriggers, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, VmState};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_EXPRESSION_TIMEOUT_MS: u64 = 5_000;
const VALIDATE_TIMEOUT_MS: u64 = 1_000;
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;
/// Extra wait on the blocking thread after the budget, before giving up on it
const BACKSTOP_GRACE: Duration = Duration::from_millis(250);
const MAX_CONVERSION_DEPTH: usize = 64;
/// Pattern-matching steps granted per millisecond of remaining budget
const PATTERN_STEPS_PER_MS: f64 = 1_000_000.0;

const RUNNING: u8 = 0;
const TIMED_OUT: u8 = 1;
const CANCELED: u8 = 2;

/// Values a script can see
#[derive(Debug, Clone, Default)]
pub struct ScriptBindings {
    pub items: Vec<Value>,
    /// Current item, exposed as `json` and `item`
    pub item: Option<Value>,
    pub item_index: Option<usize>,
    pub node: Value,
    pub workflow: Value,
    pub execution: Value,
    pub variables: Map<String, Value>,
    pub static_data: Map<String, Value>,
    /// Additional globals by name
    pub extra: Map<String, Value>,
}

/// Result of a script run
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    pub result: Value,
    pub logs: Vec<String>,
    /// `staticData` as the script left it
    pub static_data: Map<String, Value>,
    pub elapsed: Duration,
}

/// Lua sandbox with per-call time budgets
#[derive(Debug, Clone)]
pub struct Sandbox {
    script_timeout: Duration,
    expression_timeout: Duration,
    memory_limit: usize,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            script_timeout: Duration::from_millis(DEFAULT_SCRIPT_TIMEOUT_MS),
            expression_timeout: Duration::from_millis(DEFAULT_EXPRESSION_TIMEOUT_MS),
            memory_limit: 64 * 1024 * 1024,
        }
    }
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            script_timeout: Duration::from_millis(config.script_timeout_ms),
            expression_timeout: Duration::from_millis(config.expression_timeout_ms),
            memory_limit: config.memory_limit_bytes,
        }
    }

    /// Runs a script. `timeout_ms` overrides the configured script budget.
    pub async fn execute_script(
        &self,
        code: &str,
        bindings: ScriptBindings,
        timeout_ms: Option<u64>,
    ) -> Result<ScriptOutput, SandboxError> {
        let budget = timeout_ms.map(Duration::from_millis).unwrap_or(self.script_timeout);
        self.run(code.to_string(), bindings, budget, None).await
    }

    /// Like [`Sandbox::execute_script`], but also stops when `cancel` fires.
    pub async fn execute_script_cancellable(
        &self,
        code: &str,
        bindings: ScriptBindings,
        timeout_ms: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<ScriptOutput, SandboxError> {
        let budget = timeout_ms.map(Duration::from_millis).unwrap_or(self.script_timeout);
        self.run(code.to_string(), bindings, budget, Some(cancel.clone()))
            .await
    }

    /// Evaluates a single expression against `data`, which becomes `json`.
    ///
    /// `$json`-style references are accepted and an implicit `return` is added
    /// when the text has none.
    pub async fn execute_expression(
        &self,
        expression: &str,
        data: &Value,
        extra: Map<String, Value>,
    ) -> Result<Value, SandboxError> {
        let code = with_implicit_return(&strip_dollar_prefix(expression));
        let variables = extra
            .get("vars")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let bindings = ScriptBindings {
            items: vec![data.clone()],
            item: Some(data.clone()),
            item_index: Some(0),
            variables,
            extra,
            ..Default::default()
        };
        self.run(code, bindings, self.expression_timeout, None)
            .await
            .map(|output| output.result)
    }

    /// Compiles without running. Reports the failing line when Lua names one.
    pub async fn validate(&self, code: &str) -> Result<(), SandboxError> {
        let code = code.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            let lua = new_state()?;
            lua.load(code.as_str())
                .set_name("script")
                .into_function()
                .map(|_| ())
                .map_err(|e| classify_error(e, None))
        });
        match tokio::time::timeout(Duration::from_millis(VALIDATE_TIMEOUT_MS), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SandboxError::Setup(format!("Validation thread failed: {join_err}"))),
            Err(_) => Err(SandboxError::Timeout {
                timeout_ms: VALIDATE_TIMEOUT_MS,
            }),
        }
    }

    async fn run(
        &self,
        code: String,
        bindings: ScriptBindings,
        budget: Duration,
        cancel: Option<CancellationToken>,
    ) -> Result<ScriptOutput, SandboxError> {
        let state = Arc::new(AtomicU8::new(RUNNING));
        let timeout_ms = budget.as_millis() as u64;

        // Cancellation flips the same flag the VM hook polls
        let watcher = cancel.map(|token| {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                token.cancelled().await;
                let _ = state.compare_exchange(RUNNING, CANCELED, Ordering::SeqCst, Ordering::SeqCst);
            })
        });

        let started = Instant::now();
        let deadline = started + budget;
        let memory_limit = self.memory_limit;
        let thread_state = Arc::clone(&state);
        let handle = tokio::task::spawn_blocking(move || {
            run_blocking(&code, bindings, deadline, memory_limit, thread_state)
        });

        let outcome = tokio::time::timeout(budget + BACKSTOP_GRACE, handle).await;
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SandboxError::Runtime {
                message: format!("Sandbox thread failed: {join_err}"),
                line: None,
            }),
            Err(_) => {
                // The hook sees this on its next check and unwinds the thread
                state.store(TIMED_OUT, Ordering::SeqCst);
                tracing::warn!(timeout_ms, "⏱️ Script exceeded budget, backstop fired");
                return Err(SandboxError::Timeout { timeout_ms });
            }
        };

        match state.load(Ordering::SeqCst) {
            TIMED_OUT => Err(SandboxError::Timeout { timeout_ms }),
            CANCELED => Err(SandboxError::Canceled),
            _ => result.map(|mut output| {
                output.elapsed = started.elapsed();
                output
            }),
        }
    }
}

fn new_state() -> Result<mlua::Lua, SandboxError> {
    let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8;
    let lua = mlua::Lua::new_with(libs, LuaOptions::default()).map_err(setup_error)?;

    // The base library is always present; strip what can load code or touch the host
    let globals = lua.globals();
    for name in [
        "dofile",
        "loadfile",
        "load",
        "loadstring",
        "require",
        "collectgarbage",
        "print",
    ] {
        globals.set(name, mlua::Nil).map_err(setup_error)?;
    }
    let string: mlua::Result<mlua::Table> = globals.get("string");
    if let Ok(string) = string {
        string.set("dump", mlua::Nil).map_err(setup_error)?;
    }
    Ok(lua)
}

fn run_blocking(
    code: &str,
    bindings: ScriptBindings,
    deadline: Instant,
    memory_limit: usize,
    state: Arc<AtomicU8>,
) -> Result<ScriptOutput, SandboxError> {
    let lua = new_state()?;
    lua.set_memory_limit(memory_limit).map_err(setup_error)?;

    let hook_state = Arc::clone(&state);
    let _ = lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if hook_state.load(Ordering::Relaxed) != RUNNING {
                return Err(mlua::Error::runtime("script interrupted"));
            }
            if Instant::now() >= deadline {
                let _ = hook_state.compare_exchange(RUNNING, TIMED_OUT, Ordering::SeqCst, Ordering::SeqCst);
                return Err(mlua::Error::runtime("script time budget exceeded"));
            }
            Ok(VmState::Continue)
        },
    );

    guard_string_library(&lua, deadline, memory_limit, Arc::clone(&state)).map_err(setup_error)?;
    let logs = Arc::new(Mutex::new(Vec::new()));
    install_globals(&lua, &bindings, Arc::clone(&logs)).map_err(setup_error)?;

    let result: mlua::Value = lua
        .load(code)
        .set_name("script")
        .call(())
        .map_err(|e| classify_error(e, Some(&state)))?;
    let result = lua_to_json(result, 0).map_err(|e| classify_error(e, Some(&state)))?;

    let static_data: mlua::Result<mlua::Value> = lua.globals().get("staticData");
    let static_data = match static_data {
        Ok(value) => match lua_to_json(value, 0) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        Err(_) => Map::new(),
    };

    let logs = std::mem::take(&mut *logs.lock());
    Ok(ScriptOutput {
        result,
        logs,
        static_data,
        elapsed: Duration::ZERO,
    })
}

/// Wraps the C string functions the instruction hook cannot preempt.
///
/// The originals move to the registry; the wrappers check the cost of the
/// call against what is left of the budget before delegating.
fn guard_string_library(lua: &mlua::Lua, deadline: Instant, memory_limit: usize, state: Arc<AtomicU8>) -> mlua::Result<()> {
    let string: mlua::Table = lua.globals().get("string")?;

    for name in ["find", "match", "gmatch", "gsub"] {
        let key = format!("sandbox.string.{name}");
        let original: mlua::Function = string.get(name)?;
        lua.set_named_registry_value(&key, original)?;

        let state = Arc::clone(&state);
        let guarded = lua.create_function(move |lua, args: mlua::MultiValue| {
            let plain = name == "find" && args.get(3).is_some_and(is_truthy);
            if let (false, Some(mlua::Value::String(subject)), Some(mlua::Value::String(pattern))) =
                (plain, args.front(), args.get(1))
            {
                let pattern = pattern.as_bytes();
                let cost = pattern_cost(&pattern, subject.as_bytes().len(), name != "gmatch");
                let remaining = deadline.saturating_duration_since(Instant::now());
                if cost > remaining.as_millis() as f64 * PATTERN_STEPS_PER_MS {
                    let _ = state.compare_exchange(RUNNING, TIMED_OUT, Ordering::SeqCst, Ordering::SeqCst);
                    return Err(mlua::Error::runtime(format!(
                        "string.{name}: pattern would exceed the script time budget"
                    )));
                }
            }
            let original: mlua::Function = lua.named_registry_value(&key)?;
            original.call::<mlua::MultiValue>(args)
        })?;
        string.set(name, guarded)?;
    }

    lua.set_named_registry_value("sandbox.string.rep", string.get::<mlua::Function>("rep")?)?;
    string.set(
        "rep",
        lua.create_function(move |lua, args: mlua::MultiValue| {
            let piece = match args.front() {
                Some(mlua::Value::String(s)) => s.as_bytes().len(),
                Some(mlua::Value::Integer(_) | mlua::Value::Number(_)) => 24,
                _ => 0,
            };
            let times = match args.get(1) {
                Some(mlua::Value::Integer(n)) => (*n).max(0) as f64,
                Some(mlua::Value::Number(n)) => n.max(0.0),
                _ => 0.0,
            };
            let separator = match args.get(2) {
                Some(mlua::Value::String(s)) => s.as_bytes().len(),
                _ => 0,
            };
            if (piece + separator) as f64 * times > memory_limit as f64 {
                return Err(mlua::Error::runtime("string.rep: result would exceed the memory limit"));
            }
            let original: mlua::Function = lua.named_registry_value("sandbox.string.rep")?;
            original.call::<mlua::MultiValue>(args)
        })?,
    )?;
    Ok(())
}

fn is_truthy(value: &mlua::Value) -> bool {
    !matches!(value, mlua::Value::Nil | mlua::Value::Boolean(false))
}

/// Upper bound on the steps Lua's backtracking matcher may take.
///
/// Every quantified item (`*`, `+`, `-`) or `%b` that is followed by more
/// pattern can be retried once per subject position, and an unanchored
/// pattern is tried from every start position.
fn pattern_cost(pattern: &[u8], subject_len: usize, honors_anchor: bool) -> f64 {
    let anchored = honors_anchor && pattern.first() == Some(&b'^');
    let mut i = usize::from(pattern.first() == Some(&b'^'));
    let mut backtracking = 0i32;
    let mut open_quantifier = false;

    while i < pattern.len() {
        let item_len = match pattern[i] {
            b'(' | b')' => {
                i += 1;
                continue;
            }
            b'$' if i + 1 == pattern.len() => break,
            b'%' => match pattern.get(i + 1) {
                Some(b'b') => 4,
                Some(b'f') => 2 + set_len(pattern, i + 2),
                _ => 2,
            },
            b'[' => set_len(pattern, i),
            _ => 1,
        };
        let balance = pattern[i] == b'%' && pattern.get(i + 1) == Some(&b'b');
        i += item_len;

        if open_quantifier {
            backtracking += 1;
        }
        let quantified = matches!(pattern.get(i), Some(b'*' | b'+' | b'-'));
        if quantified {
            i += 1;
        }
        open_quantifier = quantified || balance;
    }

    let positions = subject_len as f64 + 1.0;
    let starts = if anchored { 1.0 } else { positions };
    starts * positions.powi(backtracking)
}

/// Length of the `[...]` set starting at `start`, following Lua's own scan.
fn set_len(pattern: &[u8], start: usize) -> usize {
    let mut j = start + 1;
    if pattern.get(j) == Some(&b'^') {
        j += 1;
    }
    loop {
        match pattern.get(j) {
            None => return pattern.len().saturating_sub(start).max(1),
            Some(b'%') => j += 2,
            Some(_) => j += 1,
        }
        if pattern.get(j) == Some(&b']') {
            return j + 1 - start;
        }
    }
}

fn install_globals(lua: &mlua::Lua, bindings: &ScriptBindings, logs: Arc<Mutex<Vec<String>>>) -> mlua::Result<()> {
    let globals = lua.globals();
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    let to_lua = |value: &Value| lua.to_value_with(value, options);

    globals.set("items", to_lua(&Value::Array(bindings.items.clone()))?)?;
    if let Some(item) = &bindings.item {
        let item = to_lua(item)?;
        globals.set("json", item.clone())?;
        globals.set("item", item)?;
    }
    if let Some(index) = bindings.item_index {
        globals.set("itemIndex", index)?;
    }
    globals.set("node", to_lua(&bindings.node)?)?;
    globals.set("workflow", to_lua(&bindings.workflow)?)?;
    globals.set("execution", to_lua(&bindings.execution)?)?;
    globals.set("vars", to_lua(&Value::Object(bindings.variables.clone()))?)?;
    globals.set("staticData", to_lua(&Value::Object(bindings.static_data.clone()))?)?;
    for (name, value) in &bindings.extra {
        globals.set(name.as_str(), to_lua(value)?)?;
    }

    // JSON helpers
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|_, value: mlua::Value| {
            let value = lua_to_json(value, 0)?;
            serde_json::to_string(&value).map_err(mlua::Error::external)
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(move |lua, text: String| {
            let value: Value = serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value_with(&value, options)
        })?,
    )?;
    globals.set("JSON", json)?;

    // console.* appends to the per-call log buffer
    let console = lua.create_table()?;
    for level in ["log", "info", "warn", "error"] {
        let logs = Arc::clone(&logs);
        console.set(
            level,
            lua.create_function(move |_, args: mlua::Variadic<mlua::Value>| {
                let mut parts = Vec::with_capacity(args.len());
                for arg in args.iter() {
                    parts.push(match lua_to_json(arg.clone(), 0)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    });
                }
                let line = parts.join(" ");
                if level == "log" {
                    logs.lock().push(line);
                } else {
                    logs.lock().push(format!("[{level}] {line}"));
                }
                Ok(())
            })?,
        )?;
    }
    globals.set("console", console)?;

    // Safe time functions in place of os.date / os.time
    globals.set(
        "now",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?,
    )?;
    globals.set(
        "today",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().format("%Y-%m-%d").to_string()))?,
    )?;
    globals.set(
        "time",
        lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))?,
    )?;
    globals.set(
        "date",
        lua.create_function(|_, (format, timestamp): (String, Option<i64>)| {
            let at = match timestamp {
                Some(ts) => chrono::DateTime::from_timestamp(ts, 0)
                    .ok_or_else(|| mlua::Error::runtime(format!("invalid timestamp {ts}")))?,
                None => chrono::Utc::now(),
            };
            Ok(at.format(&format).to_string())
        })?,
    )?;
    globals.set(
        "parseDate",
        lua.create_function(|_, text: String| {
            Ok(chrono::DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.timestamp())
                .ok())
        })?,
    )?;

    Ok(())
}

/// Converts a Lua value to JSON. Sequences become arrays, other tables objects.
fn lua_to_json(value: mlua::Value, depth: usize) -> mlua::Result<Value> {
    if depth > MAX_CONVERSION_DEPTH {
        return Err(mlua::Error::runtime("value is nested too deeply"));
    }
    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(i.into())),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        mlua::Value::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        mlua::Value::Table(table) => {
            let mut max_index = 0usize;
            let mut count = 0usize;
            let mut is_array = true;
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => is_array = false,
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut array = Vec::with_capacity(count);
                for i in 1..=max_index {
                    let element: mlua::Value = table.raw_get(i)?;
                    array.push(lua_to_json(element, depth + 1)?);
                }
                return Ok(Value::Array(array));
            }

            let mut object = Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, element) = pair?;
                let key = match key {
                    mlua::Value::String(s) => s.to_str()?.to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    _ => continue,
                };
                object.insert(key, lua_to_json(element, depth + 1)?);
            }
            Ok(Value::Object(object))
        }
        // Functions, userdata, threads and light userdata (null sentinels) have no JSON form
        _ => Ok(Value::Null),
    }
}

fn setup_error(err: mlua::Error) -> SandboxError {
    SandboxError::Setup(err.to_string())
}

fn classify_error(err: mlua::Error, state: Option<&AtomicU8>) -> SandboxError {
    match state.map(|s| s.load(Ordering::SeqCst)) {
        Some(TIMED_OUT) => {
            return SandboxError::Timeout { timeout_ms: 0 };
        }
        Some(CANCELED) => return SandboxError::Canceled,
        _ => {}
    }
    match err {
        mlua::Error::SyntaxError { message, .. } => SandboxError::Compile {
            line: error_line(&message),
            message,
        },
        mlua::Error::MemoryError(message) => SandboxError::Runtime {
            message: format!("memory limit exceeded: {message}"),
            line: None,
        },
        other => {
            let message = other.to_string();
            SandboxError::Runtime {
                line: error_line(&message),
                message,
            }
        }
    }
}

/// Extracts `N` from Lua's `[string "script"]:N:` location prefix.
fn error_line(message: &str) -> Option<u32> {
    let start = message.find("\"]:")? + 3;
    let digits: String = message[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Prepends `return` unless the expression already returns.
///
/// `return` is a reserved word, so it counts as a statement only when it
/// appears outside string literals and comments.
fn with_implicit_return(expression: &str) -> String {
    let trimmed = expression.trim();
    let has_return = code_only(trimmed)
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word == "return");
    if has_return {
        trimmed.to_string()
    } else {
        format!("return {trimmed}")
    }
}

/// Blanks out string literals and comments, keeping the code around them.
fn code_only(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                while let Some(inner) = chars.next() {
                    if inner == '\\' {
                        chars.next();
                    } else if inner == c {
                        break;
                    }
                }
                out.push(' ');
            }
            '[' if chars.peek() == Some(&'[') => {
                let mut previous = ' ';
                for inner in chars.by_ref() {
                    if previous == ']' && inner == ']' {
                        break;
                    }
                    previous = inner;
                }
                out.push(' ');
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
                out.push('\n');
            }
            other => out.push(other),
        }
    }
    out
}

/// Turns `$json.a` into `json.a` outside of string literals.
fn strip_dollar_prefix(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut quote: Option<char> = None;
    let mut chars = expression.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                    out.push(c);
                } else if c == '$' && chars.peek().is_some_and(|n| n.is_alphabetic() || *n == '_') {
                    continue;
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}
