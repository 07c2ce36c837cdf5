//! Dispatch registries: verb/noun handlers and named processors.
//!
//! ## Handlers
//!
//! A handler is registered for a `(verb, noun)` pair; noun [`WILDCARD`]
//! catches any noun.  For a command `net connect host`:
//!
//! 1. an exact `("net", "connect")` handler consumes `connect` and runs;
//! 2. otherwise a `("net", "*")` handler runs without consuming anything.
//!
//! Exact matches always beat the wildcard, whatever the registration order.
//! A handler must return `Ok(true)`; anything else is a contract violation.
//!
//! ## Processors
//!
//! A processor is registered under a bare command name and receives a
//! [`Context`] built from the command's positional data and named values.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use crate::command::Command;
use crate::error::{Result, ShellError};
use crate::shell::Shell;
use crate::value::Value;

/// Noun that matches any noun of its verb.
pub const WILDCARD: &str = "*";

/// `handler(shell, verb, noun, command)` → `Ok(true)` when handled.
pub type Handler = Rc<dyn Fn(&mut Shell, &str, &str, &mut Command) -> Result<bool>>;

/// `processor(shell, context)`.
pub type Processor = Rc<dyn Fn(&mut Shell, &mut Context) -> Result<()>>;

// ── HandlerRegistry ───────────────────────────────────────────────────────────

/// Outcome of a handler lookup.
pub enum Route {
    /// The next data word named this noun; consume it before calling.
    Exact(String, Handler),
    Wildcard(Handler),
}

#[derive(Default)]
pub struct HandlerRegistry {
    verbs: HashMap<String, HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`.  Returns `true` if it replaced an existing one.
    pub fn register(&mut self, verb: impl Into<String>, noun: impl Into<String>, handler: Handler) -> bool {
        self.verbs
            .entry(verb.into())
            .or_default()
            .insert(noun.into(), handler)
            .is_some()
    }

    /// Pick the handler for `cmd` without touching its data.
    pub fn route(&self, cmd: &Command) -> Option<Route> {
        let nouns = self.verbs.get(&cmd.name)?;
        if let Some(noun) = cmd.peek().filter(|n| *n != WILDCARD) {
            if let Some(handler) = nouns.get(noun) {
                return Some(Route::Exact(noun.to_owned(), Rc::clone(handler)));
            }
        }
        nouns.get(WILDCARD).map(|h| Route::Wildcard(Rc::clone(h)))
    }

    pub fn has_verb(&self, verb: &str) -> bool {
        self.verbs.contains_key(verb)
    }

    /// Registered nouns of `verb`, sorted.
    pub fn nouns(&self, verb: &str) -> Vec<&str> {
        let mut nouns: Vec<&str> = self
            .verbs
            .get(verb)
            .map(|n| n.keys().map(String::as_str).collect())
            .unwrap_or_default();
        nouns.sort_unstable();
        nouns
    }

    pub fn len(&self) -> usize {
        self.verbs.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Route `cmd` through the shell's handlers and run the chosen one.
///
/// Returns `Ok(false)` when no handler applies.
pub fn dispatch_handler(shell: &mut Shell, cmd: &mut Command) -> Result<bool> {
    let Some(route) = shell.handlers().route(cmd) else {
        return Ok(false);
    };
    let verb = cmd.name.clone();
    let (noun, handler) = match route {
        Route::Exact(noun, handler) => {
            cmd.pop();
            (noun, handler)
        }
        Route::Wildcard(handler) => (WILDCARD.to_owned(), handler),
    };
    if handler(shell, &verb, &noun, cmd)? {
        Ok(true)
    } else {
        Err(ShellError::contract(format!("handler '{verb} {noun}' did not handle the command")))
    }
}

// ── ProcessorRegistry ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Processor>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor`.  Returns `true` if it replaced an existing one.
    pub fn register(&mut self, name: impl Into<String>, processor: Processor) -> bool {
        self.processors.insert(name.into(), processor).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Processor> {
        self.processors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ── Templates ─────────────────────────────────────────────────────────────────

static PLACEHOLDER: OnceLock<Result<Regex, String>> = OnceLock::new();

fn placeholder() -> Result<&'static Regex> {
    PLACEHOLDER
        .get_or_init(|| {
            Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| ShellError::runtime(format!("placeholder pattern: {e}")))
}

/// Substitute `{name}` placeholders using `lookup`.
///
/// In strict mode `{{`/`}}` become literal braces and unknown names fail;
/// otherwise both are left untouched.
fn substitute(template: &str, lookup: impl Fn(&str) -> Option<String>, strict: bool) -> Result<String> {
    let re = placeholder()?;
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        match caps.get(1) {
            None if strict => out.push_str(&whole.as_str()[..1]),
            None => out.push_str(whole.as_str()),
            Some(name) => match lookup(name.as_str()) {
                Some(text) => out.push_str(&text),
                None if strict => {
                    return Err(ShellError::lookup(format!(
                        "no value for '{{{}}}' in template",
                        name.as_str()
                    )))
                }
                None => out.push_str(whole.as_str()),
            },
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

// ── Requirement ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Check {
    Shift,
    OneOf(Vec<Value>),
}

/// What [`Context::require`] does for one member: a default plus checks
/// applied in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirement {
    default: Value,
    checks: Vec<Check>,
}

impl Requirement {
    pub fn new(default: impl Into<Value>) -> Self {
        Self { default: default.into(), checks: Vec::new() }
    }

    /// No default: the member must come from the command.
    pub fn required() -> Self {
        Self::default()
    }

    /// When still unset, take the next positional data item.
    pub fn shift(mut self) -> Self {
        self.checks.push(Check::Shift);
        self
    }

    /// The value must be one of `choices`.
    pub fn one_of<V: Into<Value>>(mut self, choices: impl IntoIterator<Item = V>) -> Self {
        self.checks
            .push(Check::OneOf(choices.into_iter().map(Into::into).collect()));
        self
    }
}

impl From<Value> for Requirement {
    fn from(default: Value) -> Self {
        Requirement::new(default)
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Arguments handed to a processor.
#[derive(Debug, Clone, Default)]
pub struct Context {
    name: String,
    data: VecDeque<Value>,
    members: BTreeMap<String, Value>,
    settings: BTreeMap<String, Value>,
}

impl Context {
    /// Build a context.  String members are pre-rendered against the member
    /// set; placeholders without a member stay for a later [`render`](Self::render).
    pub fn new(
        name: impl Into<String>,
        data: impl IntoIterator<Item = Value>,
        members: BTreeMap<String, Value>,
        settings: BTreeMap<String, Value>,
    ) -> Result<Self> {
        let mut rendered = BTreeMap::new();
        for (key, value) in &members {
            let value = match value {
                Value::Str(text) => Value::Str(substitute(text, |k| members.get(k).map(Value::to_string), false)?),
                other => other.clone(),
            };
            rendered.insert(key.clone(), value);
        }
        Ok(Self {
            name: name.into(),
            data: data.into_iter().collect(),
            members: rendered,
            settings,
        })
    }

    pub fn from_command(cmd: &Command, settings: BTreeMap<String, Value>) -> Result<Self> {
        Self::new(
            cmd.name.clone(),
            cmd.data.iter().map(|w| Value::from(w.as_str())),
            cmd.value.clone(),
            settings,
        )
    }

    /// Processor name this context was built for.
    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Positional data ───────────────────────────────────────────────────────

    pub fn shift(&mut self) -> Option<Value> {
        self.data.pop_front()
    }

    pub fn data(&self) -> &VecDeque<Value> {
        &self.data
    }

    /// `true` when no positional data remains.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // ── Members ───────────────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.members.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.members.insert(key.into(), value.into());
    }

    /// Present and not null.
    pub fn has(&self, key: &str) -> bool {
        self.members.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn members(&self) -> &BTreeMap<String, Value> {
        &self.members
    }

    pub fn settings(&self) -> &BTreeMap<String, Value> {
        &self.settings
    }

    /// Render `value` (if text) and store it.
    pub fn assign(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let value = self.render_value(value.into())?;
        self.members.insert(key.into(), value);
        Ok(())
    }

    /// Resolve member `key` from the command, the requirement's checks and
    /// its default.  Fails when the member is still null afterwards.
    pub fn require(&mut self, key: &str, requirement: impl Into<Requirement>) -> Result<&Value> {
        let requirement = requirement.into();
        let mut value = self
            .members
            .get(key)
            .cloned()
            .unwrap_or_else(|| requirement.default.clone());
        for check in &requirement.checks {
            match check {
                Check::Shift => {
                    if value.is_null() {
                        value = self.shift().unwrap_or_default();
                    }
                }
                Check::OneOf(choices) => {
                    if !value.is_null() && !choices.contains(&value) {
                        let listed: Vec<String> = choices.iter().map(Value::to_string).collect();
                        return Err(ShellError::contract(format!(
                            "{}: {key}={value} is not one of [{}]",
                            self.name,
                            listed.join(", ")
                        )));
                    }
                }
            }
        }
        let value = self.render_value(value)?;
        if value.is_null() {
            return Err(ShellError::contract(format!(
                "{}: required value '{key}' is missing",
                self.name
            )));
        }
        self.members.insert(key.to_owned(), value);
        Ok(&self.members[key])
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    /// Substitute `{name}` from members, then settings.  `{{` and `}}` are
    /// literal braces.
    pub fn render(&self, template: &str) -> Result<String> {
        substitute(
            template,
            |key| {
                self.members
                    .get(key)
                    .or_else(|| self.settings.get(key))
                    .map(Value::to_string)
            },
            true,
        )
    }

    pub fn render_value(&self, value: Value) -> Result<Value> {
        match value {
            Value::Str(text) => Ok(Value::Str(self.render(&text)?)),
            other => Ok(other),
        }
    }

    /// Render `text` and log it.
    pub fn report(&self, text: &str) -> Result<()> {
        let line = self.render(text)?;
        info!(processor = %self.name, "{line}");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
