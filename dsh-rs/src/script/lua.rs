//! Lua 5.4 execution of script units via the `mlua` crate.
//!
//! # Isolation
//!
//! Every unit runs with a fresh environment table whose `__index` falls back
//! to the Lua globals.  Globals a unit defines land in its own environment,
//! so nothing leaks into the next unit.
//!
//! # Lua API
//!
//! The `shell` table is bound in every unit:
//!
//! | Lua function                          | Effect                                  |
//! |---------------------------------------|-----------------------------------------|
//! | `shell.get(key)` / `shell.has(key)`   | Read the variable store                 |
//! | `shell.set(key, value)`               | Write a plain variable                  |
//! | `shell.declare(key, value [,protect])`| Publish a variable to later units       |
//! | `shell.unset(key)`                    | Remove a variable → bool                |
//! | `shell.path(value)`                   | Resolve a virtual path                  |
//! | `shell.field(key)`                    | Read a feature field                    |
//! | `shell.load(path)` / `shell.save(path, value)` | TOML / JSON / text documents   |
//! | `shell.handler(verb, noun, fn)`       | Register a handler (queued)             |
//! | `shell.handlers{verb = {noun = fn}}`  | Register many handlers (queued)         |
//! | `shell.macro(name, fn)`               | Register a macro (queued)               |
//! | `shell.format(name, fn)`              | Register a format handler (queued)      |
//! | `shell.processor(name, fn)`           | Register a processor (queued)           |
//! | `shell.invoke(name [,data [,members]])` | Run a processor (queued)              |
//! | `shell.execute(line)`                 | Execute a command line (queued)         |
//! | `shell.exit()`                        | Stop the input loop (queued)            |
//! | `shell.debug/info/warn/error(msg)`    | Log through `tracing`                   |
//! | `shell.fail(msg)`                     | Raise an error                          |
//!
//! Queued requests are handed to the shell through a channel and applied as
//! soon as the Lua call that issued them returns.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, Sender};

use mlua::prelude::*;

use super::{ScriptUnit, UnitCompiler, API_NAME, LIFECYCLE_HOOK};
use crate::command::Command;
use crate::dispatch::{Context, Requirement};
use crate::document::{self, Document};
use crate::error::{Result, ShellError};
use crate::paths::VirtualPaths;
use crate::shell::MAX_DEPTH;
use crate::value::Value;
use crate::var::VarStore;

// ── Value conversion ──────────────────────────────────────────────────────────

impl IntoLua for Value {
    fn into_lua(self, lua: &Lua) -> LuaResult<LuaValue> {
        match self {
            Value::Null => Ok(LuaValue::Nil),
            Value::Bool(b) => Ok(LuaValue::Boolean(b)),
            Value::Int(n) => Ok(LuaValue::Integer(n)),
            Value::Float(x) => Ok(LuaValue::Number(x)),
            Value::Str(s) => lua.create_string(&s).map(LuaValue::String),
            Value::List(items) => lua.create_sequence_from(items).map(LuaValue::Table),
            Value::Map(map) => lua.create_table_from(map).map(LuaValue::Table),
        }
    }
}

impl FromLua for Value {
    fn from_lua(value: LuaValue, _lua: &Lua) -> LuaResult<Self> {
        lua_to_value(value, &mut Vec::new())
    }
}

/// Convert `value`; `open` holds the tables currently being converted.
fn lua_to_value(value: LuaValue, open: &mut Vec<*const c_void>) -> LuaResult<Value> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(b)),
        LuaValue::Integer(n) => Ok(Value::Int(n)),
        LuaValue::Number(x) => Ok(Value::Float(x)),
        LuaValue::String(s) => Ok(Value::Str(s.to_str()?.to_string())),
        LuaValue::Table(t) => table_to_value(&t, open),
        other => Err(LuaError::RuntimeError(format!(
            "cannot convert a Lua {} to a shell value",
            other.type_name()
        ))),
    }
}

/// A table with keys `1..n` and nothing else becomes a list; any other
/// table becomes a map with string keys.  Cycles and nesting past
/// [`MAX_DEPTH`] are errors.
fn table_to_value(table: &LuaTable, open: &mut Vec<*const c_void>) -> LuaResult<Value> {
    let ptr = table.to_pointer();
    if open.contains(&ptr) {
        return Err(LuaError::RuntimeError(
            "cannot convert a table that contains itself".into(),
        ));
    }
    if open.len() >= MAX_DEPTH {
        return Err(LuaError::RuntimeError(format!(
            "tables nested deeper than {MAX_DEPTH} levels"
        )));
    }
    open.push(ptr);
    let value = table_entries(table, open);
    open.pop();
    value
}

fn table_entries(table: &LuaTable, open: &mut Vec<*const c_void>) -> LuaResult<Value> {
    let len = table.raw_len();
    let mut entries = Vec::new();
    for pair in table.pairs::<LuaValue, LuaValue>() {
        entries.push(pair?);
    }
    if len > 0 && entries.len() == len {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            items.push(lua_to_value(table.raw_get::<LuaValue>(i)?, open)?);
        }
        return Ok(Value::List(items));
    }
    let mut map = BTreeMap::new();
    for (key, value) in entries {
        let key = match key {
            LuaValue::String(s) => s.to_str()?.to_string(),
            LuaValue::Integer(n) => n.to_string(),
            other => {
                return Err(LuaError::RuntimeError(format!(
                    "table keys must be strings or integers, found {}",
                    other.type_name()
                )))
            }
        };
        map.insert(key, lua_to_value(value, open)?);
    }
    Ok(Value::Map(map))
}

// ── ScriptRequest ─────────────────────────────────────────────────────────────

/// Work produced by a Lua API call and applied by the shell afterwards.
pub enum ScriptRequest {
    Handler { verb: String, noun: String, func: LuaFunction },
    Macro { name: String, func: LuaFunction },
    Format { name: String, func: LuaFunction },
    Processor { name: String, func: LuaFunction },
    Invoke { name: String, data: Vec<Value>, members: BTreeMap<String, Value> },
    Execute { line: String },
    Exit,
}

fn send(tx: &Sender<ScriptRequest>, request: ScriptRequest) -> LuaResult<()> {
    tx.send(request)
        .map_err(|_| LuaError::RuntimeError("the shell is no longer accepting requests".into()))
}

fn non_empty(what: &str, arg: usize, value: &str) -> LuaResult<()> {
    if value.is_empty() {
        return Err(LuaError::RuntimeError(format!(
            "bad argument #{arg} to '{what}' (must not be empty)"
        )));
    }
    Ok(())
}

// ── LuaEngine ─────────────────────────────────────────────────────────────────

/// A Lua interpreter with the shell API registered, plus the unit compiler.
pub struct LuaEngine {
    lua: Lua,
    api: LuaTable,
    tx: Sender<ScriptRequest>,
    rx: Receiver<ScriptRequest>,
    compiler: UnitCompiler,
}

impl LuaEngine {
    /// Create the interpreter.  `vars`, `paths` and `fields` are shared with
    /// the shell and read or written directly by the API.
    pub fn new(
        vars: Rc<RefCell<VarStore>>,
        paths: Rc<RefCell<VirtualPaths>>,
        fields: Rc<RefCell<Document>>,
    ) -> Result<Self> {
        let lua = Lua::new();
        let api = lua.create_table()?;
        let (tx, rx) = channel();
        Self::register_api(&lua, &api, vars, paths, fields, tx.clone())?;
        Ok(Self { lua, api, tx, rx, compiler: UnitCompiler::new() })
    }

    // ── Shell API registration ────────────────────────────────────────────────

    fn register_api(
        lua: &Lua,
        api: &LuaTable,
        vars: Rc<RefCell<VarStore>>,
        paths: Rc<RefCell<VirtualPaths>>,
        fields: Rc<RefCell<Document>>,
        tx: Sender<ScriptRequest>,
    ) -> LuaResult<()> {
        // variables
        {
            let vars = Rc::clone(&vars);
            api.set(
                "get",
                lua.create_function(move |_, key: String| {
                    Ok(vars.borrow().get(&key).cloned().unwrap_or_default())
                })?,
            )?;
        }
        {
            let vars = Rc::clone(&vars);
            api.set(
                "has",
                lua.create_function(move |_, key: String| Ok(vars.borrow().contains(&key)))?,
            )?;
        }
        {
            let vars = Rc::clone(&vars);
            api.set(
                "set",
                lua.create_function(move |_, (key, value): (String, Value)| {
                    non_empty("set", 1, &key)?;
                    vars.borrow_mut().set(key, value)?;
                    Ok(())
                })?,
            )?;
        }
        {
            let vars = Rc::clone(&vars);
            api.set(
                "declare",
                lua.create_function(move |_, (key, value, protect): (String, Value, Option<bool>)| {
                    non_empty("declare", 1, &key)?;
                    vars.borrow_mut().declare(key, value, protect.unwrap_or(false))?;
                    Ok(())
                })?,
            )?;
        }
        {
            let vars = Rc::clone(&vars);
            api.set(
                "unset",
                lua.create_function(move |_, key: String| Ok(vars.borrow_mut().unset(&key)?))?,
            )?;
        }

        // paths, fields and documents
        {
            let paths = Rc::clone(&paths);
            api.set(
                "path",
                lua.create_function(move |_, value: String| Ok(paths.borrow().resolve(&value)))?,
            )?;
        }
        api.set(
            "field",
            lua.create_function(move |_, key: String| {
                Ok(fields.borrow().get(&key).cloned().unwrap_or_default())
            })?,
        )?;
        {
            let paths = Rc::clone(&paths);
            api.set(
                "load",
                lua.create_function(move |_, path: String| {
                    let path = paths.borrow().resolve(&path);
                    Ok(document::load(path)?)
                })?,
            )?;
        }
        api.set(
            "save",
            lua.create_function(move |_, (path, value): (String, Value)| {
                let path = paths.borrow().resolve(&path);
                Ok(document::save(path, &value)?)
            })?,
        )?;

        // registrations
        {
            let tx = tx.clone();
            api.set(
                "handler",
                lua.create_function(move |_, (verb, noun, func): (String, String, LuaFunction)| {
                    non_empty("handler", 1, &verb)?;
                    non_empty("handler", 2, &noun)?;
                    send(&tx, ScriptRequest::Handler { verb, noun, func })
                })?,
            )?;
        }
        {
            let tx = tx.clone();
            api.set(
                "handlers",
                lua.create_function(move |_, table: LuaTable| {
                    for verb in table.pairs::<String, LuaTable>() {
                        let (verb, nouns) = verb?;
                        for noun in nouns.pairs::<String, LuaFunction>() {
                            let (noun, func) = noun?;
                            send(&tx, ScriptRequest::Handler { verb: verb.clone(), noun, func })?;
                        }
                    }
                    Ok(())
                })?,
            )?;
        }
        {
            let tx = tx.clone();
            api.set(
                "macro",
                lua.create_function(move |_, (name, func): (String, LuaFunction)| {
                    non_empty("macro", 1, &name)?;
                    send(&tx, ScriptRequest::Macro { name, func })
                })?,
            )?;
        }
        {
            let tx = tx.clone();
            api.set(
                "format",
                lua.create_function(move |_, (name, func): (String, LuaFunction)| {
                    non_empty("format", 1, &name)?;
                    send(&tx, ScriptRequest::Format { name, func })
                })?,
            )?;
        }
        {
            let tx = tx.clone();
            api.set(
                "processor",
                lua.create_function(move |_, (name, func): (String, LuaFunction)| {
                    non_empty("processor", 1, &name)?;
                    send(&tx, ScriptRequest::Processor { name, func })
                })?,
            )?;
        }
        {
            let tx = tx.clone();
            api.set(
                "invoke",
                lua.create_function(
                    move |_, (name, data, members): (String, Option<Vec<Value>>, Option<BTreeMap<String, Value>>)| {
                        send(
                            &tx,
                            ScriptRequest::Invoke {
                                name,
                                data: data.unwrap_or_default(),
                                members: members.unwrap_or_default(),
                            },
                        )
                    },
                )?,
            )?;
        }
        {
            let tx = tx.clone();
            api.set(
                "execute",
                lua.create_function(move |_, line: String| send(&tx, ScriptRequest::Execute { line }))?,
            )?;
        }
        api.set(
            "exit",
            lua.create_function(move |_, ()| send(&tx, ScriptRequest::Exit))?,
        )?;

        // logging
        api.set(
            "debug",
            lua.create_function(|_, msg: String| {
                tracing::debug!(target: "dsh::script", "{msg}");
                Ok(())
            })?,
        )?;
        api.set(
            "info",
            lua.create_function(|_, msg: String| {
                tracing::info!(target: "dsh::script", "{msg}");
                Ok(())
            })?,
        )?;
        api.set(
            "warn",
            lua.create_function(|_, msg: String| {
                tracing::warn!(target: "dsh::script", "{msg}");
                Ok(())
            })?,
        )?;
        api.set(
            "error",
            lua.create_function(|_, msg: String| {
                tracing::error!(target: "dsh::script", "{msg}");
                Ok(())
            })?,
        )?;
        api.set(
            "fail",
            lua.create_function(|_, msg: String| -> LuaResult<()> { Err(LuaError::RuntimeError(msg)) })?,
        )?;

        Ok(())
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Take every request queued since the last call.
    pub fn take_requests(&self) -> Vec<ScriptRequest> {
        self.rx.try_iter().collect()
    }

    // ── Units ─────────────────────────────────────────────────────────────────

    pub fn compile(
        &mut self,
        source: &str,
        label: &str,
        include: Option<&str>,
        declared: Vec<(String, Value)>,
    ) -> ScriptUnit {
        self.compiler.compile(source, label, include, declared)
    }

    /// Run `unit` in a fresh environment, then its lifecycle hook if it
    /// defined one.  Returns whether the hook ran.
    pub fn run(&self, unit: &ScriptUnit) -> Result<bool> {
        self.run_unit(unit)
            .map_err(|e| ShellError::runtime(format!("{} ({}): {e}", unit.label(), unit.name())))
    }

    fn run_unit(&self, unit: &ScriptUnit) -> LuaResult<bool> {
        let env: LuaTable = self
            .lua
            .load("return setmetatable({}, { __index = _G })")
            .set_name("=environment")
            .eval()?;
        env.set(API_NAME, self.api.clone())?;
        env.set(
            "__declared",
            self.lua.create_table_from(unit.bindings().iter().cloned())?,
        )?;

        self.lua
            .load(unit.text())
            .set_name(unit.label())
            .set_environment(env.clone())
            .exec()?;

        let LuaValue::Function(hook) = env.raw_get::<LuaValue>(LIFECYCLE_HOOK)? else {
            return Ok(false);
        };
        let info = self.lua.create_table()?;
        info.set("id", unit.id())?;
        info.set("name", unit.name())?;
        info.set("label", unit.label())?;
        info.set("env", env)?;
        hook.call::<()>((self.api.clone(), info))?;
        Ok(true)
    }

    /// Prepend `dir/?.lua` to `package.path`.
    pub fn add_module_dir(&self, dir: &str) -> Result<()> {
        let package: LuaTable = self.lua.globals().get("package")?;
        let current: String = package.get("path")?;
        package.set("path", format!("{dir}/?.lua;{dir}/?/init.lua;{current}"))?;
        Ok(())
    }

    // ── Callbacks registered from Lua ─────────────────────────────────────────

    /// `fn(verb, noun, command)`; any value but `nil`/`false` means handled.
    pub fn call_handler(&self, func: &LuaFunction, verb: &str, noun: &str, cmd: &Command) -> Result<bool> {
        let cmd = Value::from(cmd).into_lua(&self.lua)?;
        let handled: LuaValue = func.call((verb, noun, cmd))?;
        Ok(!matches!(handled, LuaValue::Nil | LuaValue::Boolean(false)))
    }

    /// `fn(command)` → body text or `nil`.
    pub fn call_macro(&self, func: &LuaFunction, cmd: &Command) -> Result<Option<String>> {
        let cmd = Value::from(cmd).into_lua(&self.lua)?;
        Ok(func.call::<Option<String>>(cmd)?)
    }

    /// `fn(text)` → replacement text.
    pub fn call_format(&self, func: &LuaFunction, text: &str) -> Result<String> {
        Ok(func.call::<String>(text)?)
    }

    /// `fn(ctx)`; the context table operates on `ctx` for the duration of
    /// the call.
    pub fn call_processor(&self, func: &LuaFunction, ctx: &mut Context) -> Result<()> {
        let shared = Rc::new(RefCell::new(std::mem::take(ctx)));
        let table = self.context_table(&shared)?;
        let result = func.call::<()>(table);
        *ctx = shared.take();
        Ok(result?)
    }

    fn context_table(&self, shared: &Rc<RefCell<Context>>) -> LuaResult<LuaTable> {
        let lua = &self.lua;
        let table = lua.create_table()?;
        {
            let ctx = Rc::clone(shared);
            table.set(
                "name",
                lua.create_function(move |_, ()| Ok(ctx.borrow().name().to_owned()))?,
            )?;
        }
        {
            let ctx = Rc::clone(shared);
            table.set(
                "shift",
                lua.create_function(move |_, ()| Ok(ctx.borrow_mut().shift().unwrap_or_default()))?,
            )?;
        }
        {
            let ctx = Rc::clone(shared);
            table.set(
                "data",
                lua.create_function(move |_, ()| {
                    Ok(Value::List(ctx.borrow().data().iter().cloned().collect()))
                })?,
            )?;
        }
        {
            let ctx = Rc::clone(shared);
            table.set(
                "get",
                lua.create_function(move |_, key: String| {
                    Ok(ctx.borrow().get(&key).cloned().unwrap_or_default())
                })?,
            )?;
        }
        {
            let ctx = Rc::clone(shared);
            table.set(
                "set",
                lua.create_function(move |_, (key, value): (String, Value)| {
                    ctx.borrow_mut().set(key, value);
                    Ok(())
                })?,
            )?;
        }
        {
            let ctx = Rc::clone(shared);
            table.set(
                "has",
                lua.create_function(move |_, key: String| Ok(ctx.borrow().has(&key)))?,
            )?;
        }
        {
            let ctx = Rc::clone(shared);
            table.set(
                "render",
                lua.create_function(move |_, text: String| Ok(ctx.borrow().render(&text)?))?,
            )?;
        }
        {
            let ctx = Rc::clone(shared);
            table.set(
                "report",
                lua.create_function(move |_, text: String| Ok(ctx.borrow().report(&text)?))?,
            )?;
        }
        {
            // require(key [, default [, { shift = true, one_of = {...} }]])
            let ctx = Rc::clone(shared);
            table.set(
                "require",
                lua.create_function(
                    move |_, (key, default, options): (String, Value, Option<LuaTable>)| {
                        let mut requirement = Requirement::new(default);
                        if let Some(options) = options {
                            if options.get::<Option<bool>>("shift")?.unwrap_or(false) {
                                requirement = requirement.shift();
                            }
                            if let Some(choices) = options.get::<Option<Vec<Value>>>("one_of")? {
                                requirement = requirement.one_of(choices);
                            }
                        }
                        let mut ctx = ctx.borrow_mut();
                        Ok(ctx.require(&key, requirement)?.clone())
                    },
                )?,
            )?;
        }
        {
            let ctx = Rc::clone(shared);
            let tx = self.tx.clone();
            table.set(
                "invoke",
                lua.create_function(move |_, (name, data): (String, Option<Vec<Value>>)| {
                    let members = ctx.borrow().members().clone();
                    send(&tx, ScriptRequest::Invoke { name, data: data.unwrap_or_default(), members })
                })?,
            )?;
        }
        Ok(table)
    }

    // ── Direct evaluation ─────────────────────────────────────────────────────

    /// Execute a chunk in the global environment.
    pub fn exec(&self, chunk: &str) -> Result<()> {
        Ok(self.lua.load(chunk).exec()?)
    }

    /// Evaluate an expression in the global environment.
    pub fn eval<R: FromLuaMulti>(&self, expr: &str) -> Result<R> {
        Ok(self.lua.load(expr).eval()?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_engine() -> (LuaEngine, Rc<RefCell<VarStore>>) {
        let vars = Rc::new(RefCell::new(VarStore::new()));
        let mut paths = VirtualPaths::new();
        paths.register("data", "/srv/data");
        let engine = LuaEngine::new(
            Rc::clone(&vars),
            Rc::new(RefCell::new(paths)),
            Rc::new(RefCell::new(Document::new())),
        )
        .unwrap();
        (engine, vars)
    }

    fn run(engine: &mut LuaEngine, source: &str, declared: Vec<(String, Value)>) -> Result<bool> {
        let unit = engine.compile(source, "test", None, declared);
        engine.run(&unit)
    }

    // ── Conversion ────────────────────────────────────────────────────────────

    #[test]
    fn values_round_trip_through_lua() {
        let (engine, _) = make_engine();
        let mut map = BTreeMap::new();
        map.insert("n".to_owned(), Value::Int(3));
        map.insert("list".to_owned(), Value::List(vec![Value::from("a"), Value::Float(1.5)]));
        let original = Value::Map(map);

        let lua_value = original.clone().into_lua(&engine.lua).unwrap();
        let back = Value::from_lua(lua_value, &engine.lua).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn empty_table_is_a_map() {
        let (engine, _) = make_engine();
        let v: Value = engine.eval("{}").unwrap();
        assert_eq!(v, Value::Map(BTreeMap::new()));
    }

    #[test]
    fn cyclic_table_is_an_error() {
        let (engine, _) = make_engine();
        let err = engine.eval::<Value>("(function() local t = {} t.t = t return t end)()");
        assert!(err.unwrap_err().to_string().contains("contains itself"));
    }

    #[test]
    fn shared_table_is_not_a_cycle() {
        let (engine, _) = make_engine();
        let v: Value = engine
            .eval("(function() local s = {1} return { a = s, b = s } end)()")
            .unwrap();
        let list = Value::List(vec![Value::Int(1)]);
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), list.clone());
        map.insert("b".to_owned(), list);
        assert_eq!(v, Value::Map(map));
    }

    #[test]
    fn deep_nesting_is_an_error() {
        let (engine, _) = make_engine();
        let err = engine
            .eval::<Value>("(function() local t = {} for _ = 1, 200 do t = { t } end return t end)()")
            .unwrap_err();
        assert!(err.to_string().contains("nested deeper"));
    }

    #[test]
    fn storing_a_cyclic_table_fails_the_unit() {
        let (mut engine, vars) = make_engine();
        let result = run(&mut engine, "local t = {}\nt.t = t\nshell.set('x', t)", vec![]);
        assert!(matches!(result, Err(ShellError::Runtime(_))));
        assert!(!vars.borrow().contains("x"));
    }

    // ── Units ─────────────────────────────────────────────────────────────────

    #[test]
    fn declared_bindings_are_visible() {
        let (mut engine, vars) = make_engine();
        run(
            &mut engine,
            "shell.set('seen', greeting .. '!')",
            vec![("greeting".to_owned(), Value::from("hi"))],
        )
        .unwrap();
        assert_eq!(vars.borrow().get("seen"), Some(&Value::from("hi!")));
    }

    #[test]
    fn declared_shell_does_not_hide_the_api() {
        let (mut engine, vars) = make_engine();
        run(
            &mut engine,
            "shell.set('api', type(shell) == 'table')",
            vec![("shell".to_owned(), Value::from("shadow"))],
        )
        .unwrap();
        assert_eq!(vars.borrow().get("api"), Some(&Value::Bool(true)));
    }

    #[test]
    fn units_do_not_share_globals() {
        let (mut engine, vars) = make_engine();
        run(&mut engine, "leaked = 42", Vec::new()).unwrap();
        run(&mut engine, "shell.set('seen_leak', leaked == nil)", Vec::new()).unwrap();
        assert_eq!(vars.borrow().get("seen_leak"), Some(&Value::Bool(true)));
        let global: LuaValue = engine.eval("leaked").unwrap();
        assert!(global.is_nil());

        engine.exec("leaked = 1").unwrap();
        run(&mut engine, "shell.set('seen_leak', leaked)", Vec::new()).unwrap();
        assert_eq!(vars.borrow().get("seen_leak"), Some(&Value::Int(1)));
    }

    #[test]
    fn lifecycle_hook_runs_once_with_unit_info() {
        let (mut engine, vars) = make_engine();
        let ran = run(
            &mut engine,
            "function on_load(sh, unit)\n\
               sh.set('hooks', (sh.get('hooks') or 0) + 1)\n\
               sh.set('unit', unit.name)\n\
             end",
            Vec::new(),
        )
        .unwrap();
        assert!(ran);
        assert_eq!(vars.borrow().get("hooks"), Some(&Value::Int(1)));
        assert_eq!(vars.borrow().get("unit"), Some(&Value::from("script100")));
        assert!(!run(&mut engine, "local x = 1", Vec::new()).unwrap());
    }

    #[test]
    fn runtime_error_carries_label() {
        let (mut engine, _) = make_engine();
        let err = run(&mut engine, "error('boom')", Vec::new()).unwrap_err();
        match err {
            ShellError::Runtime(msg) => {
                assert!(msg.contains("boom"));
                assert!(msg.contains("test"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn syntax_error_is_runtime_failure() {
        let (mut engine, _) = make_engine();
        assert!(matches!(
            run(&mut engine, "this is not lua", Vec::new()),
            Err(ShellError::Runtime(_))
        ));
    }

    // ── API ───────────────────────────────────────────────────────────────────

    #[test]
    fn protected_variable_rejects_script_writes() {
        let (mut engine, vars) = make_engine();
        vars.borrow_mut().declare("config", "fixed", true).unwrap();
        let err = run(&mut engine, "shell.set('config', 'changed')", Vec::new());
        assert!(err.is_err());
        assert_eq!(vars.borrow().get("config"), Some(&Value::from("fixed")));
    }

    #[test]
    fn path_resolves_namespaces() {
        let (mut engine, vars) = make_engine();
        run(&mut engine, "shell.set('p', shell.path('data:/x.toml'))", Vec::new()).unwrap();
        assert_eq!(vars.borrow().get("p"), Some(&Value::from("/srv/data/x.toml")));
    }

    #[test]
    fn registrations_are_queued() {
        let (mut engine, _) = make_engine();
        run(
            &mut engine,
            "shell.handler('net', 'connect', function() return true end)\n\
             shell.handlers{ disk = { mount = function() end, ['*'] = function() end } }\n\
             shell.macro('m', function() return 'x' end)\n\
             shell.execute('greet bob')\n\
             shell.exit()",
            Vec::new(),
        )
        .unwrap();
        let requests = engine.take_requests();
        let handlers = requests
            .iter()
            .filter(|r| matches!(r, ScriptRequest::Handler { .. }))
            .count();
        assert_eq!(handlers, 3);
        assert!(requests
            .iter()
            .any(|r| matches!(r, ScriptRequest::Execute { line } if line == "greet bob")));
        assert!(requests.iter().any(|r| matches!(r, ScriptRequest::Exit)));
        assert!(engine.take_requests().is_empty());
    }

    #[test]
    fn empty_names_are_rejected() {
        let (mut engine, _) = make_engine();
        assert!(run(&mut engine, "shell.macro('', function() end)", Vec::new()).is_err());
        assert!(run(&mut engine, "shell.set('', 1)", Vec::new()).is_err());
    }

    // ── Callbacks ─────────────────────────────────────────────────────────────

    #[test]
    fn handler_callback_truthiness() {
        let (engine, _) = make_engine();
        let cmd = Command::parse("net connect host").unwrap();
        let yes: LuaFunction = engine.eval("function(v, n, c) return c.data[1] == 'host' end").unwrap();
        let no: LuaFunction = engine.eval("function() end").unwrap();
        assert!(engine.call_handler(&yes, "net", "connect", &cmd).unwrap());
        assert!(!engine.call_handler(&no, "net", "connect", &cmd).unwrap());
    }

    #[test]
    fn processor_callback_edits_context() {
        let (engine, _) = make_engine();
        let mut settings = BTreeMap::new();
        settings.insert("root".to_owned(), Value::from("/srv"));
        let cmd = Command::parse("copy a.txt mode=fast").unwrap();
        let mut ctx = Context::from_command(&cmd, settings).unwrap();

        let func: LuaFunction = engine
            .eval(
                "function(ctx)\n\
                   local src = ctx.require('src', nil, { shift = true })\n\
                   ctx.set('dest', ctx.render('{root}/' .. src))\n\
                   ctx.require('mode', 'slow', { one_of = { 'fast', 'slow' } })\n\
                 end",
            )
            .unwrap();
        engine.call_processor(&func, &mut ctx).unwrap();

        assert_eq!(ctx.get("src"), Some(&Value::from("a.txt")));
        assert_eq!(ctx.get("dest"), Some(&Value::from("/srv/a.txt")));
        assert!(ctx.is_empty());
    }

    #[test]
    fn module_dirs_extend_require() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("helpers.lua"), "return { answer = 42 }").unwrap();
        let (mut engine, vars) = make_engine();
        engine
            .add_module_dir(&crate::fsutil::slashed_path(dir.path()))
            .unwrap();
        run(&mut engine, "shell.set('a', require('helpers').answer)", Vec::new()).unwrap();
        assert_eq!(vars.borrow().get("a"), Some(&Value::Int(42)));
    }
}
