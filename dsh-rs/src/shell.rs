//! The shell orchestrator.
//!
//! A [`Shell`] owns every registry, the variable store, the virtual path
//! table and the Lua engine.  Its life is linear:
//!
//! ```text
//! Initializing ──build()──▶ Running ──shutdown()──▶ ShuttingDown ──▶ Stopped
//! ```
//!
//! [`ShellBuilder::build`] performs the whole of initialization; a failure
//! there is returned and no shell exists.  [`Shell::run`] reads lines until
//! the source ends, `exit` is read or the termination switch is flipped,
//! then shuts down.  Shutdown runs at most once, also when the shell is
//! dropped.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::{self, SettingsEntry, ShellConfig};
use crate::dispatch::{Context, Handler, HandlerRegistry, Processor, ProcessorRegistry};
use crate::document::{self, Document};
use crate::embedded::{self, BUNDLE};
use crate::error::{Result, ShellError};
use crate::feature::{default_features, ExecutorStage, Feature, ParserStage};
use crate::fsutil;
use crate::macros::{Format, FormatTable, Macro, MacroTable};
use crate::paths::VirtualPaths;
use crate::reader::{self, Interruptible, LineQueue, LineSource, Prompt, Reader, StdinLines};
use crate::script::{LuaEngine, ScriptRequest, ScriptUnit};
use crate::value::Value;
use crate::var::VarStore;

/// Deepest allowed nesting of macro expansion and scripted commands.
pub const MAX_DEPTH: usize = 64;

/// Script run from every source root at startup.
pub const STARTUP_SCRIPT: &str = "STARTUP";

/// Script run from every source root at shutdown.
pub const SHUTDOWN_SCRIPT: &str = "SHUTDOWN";

/// Input line that stops the loop.
pub const EXIT: &str = "exit";

/// Lines starting with this are ignored by the loop.
pub const COMMENT: char = '#';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

// ── Active guard ──────────────────────────────────────────────────────────────

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Marks the thread's one active shell.
struct ActiveGuard;

impl ActiveGuard {
    fn acquire() -> Result<Self> {
        if ACTIVE.with(|active| active.replace(true)) {
            return Err(ShellError::contract("another shell is already active on this thread"));
        }
        Ok(ActiveGuard)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(false));
    }
}

// ── ShellBuilder ──────────────────────────────────────────────────────────────

/// Collects startup input, then runs initialization.
pub struct ShellBuilder {
    startup: String,
    config: Option<Value>,
    config_dir: Option<PathBuf>,
    features: Vec<Rc<dyn Feature>>,
}

impl ShellBuilder {
    /// `startup` is the process command line, e.g. `dsh --config=site.toml`.
    pub fn new(startup: impl Into<String>) -> Self {
        Self { startup: startup.into(), config: None, config_dir: None, features: Vec::new() }
    }

    /// Use `config` instead of reading a configuration file.
    pub fn config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Root of the `shell:` namespace, overriding the configuration file's
    /// directory.
    pub fn config_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Install `feature` after the built-in ones.
    pub fn feature(mut self, feature: Rc<dyn Feature>) -> Self {
        self.features.push(feature);
        self
    }

    pub fn build(self) -> Result<Shell> {
        let guard = ActiveGuard::acquire()?;
        let startup = Command::parse(&self.startup)?;

        // configuration
        let (config_value, file_dir) = match self.config {
            Some(value) => (value, None),
            None => {
                let (value, dir) = config::load_config(&startup)?;
                (value, Some(dir))
            }
        };
        let cwd = std::env::current_dir().map_err(|e| ShellError::io(".", e))?;
        let config_dir = self.config_dir.or(file_dir).unwrap_or_else(|| cwd.clone());
        let shell_config = ShellConfig::from_value(&config_value)?;
        let config = Document::from_value(config_value)?;

        // virtual paths
        let mut paths = VirtualPaths::new();
        paths.register("cwd", &fsutil::slashed_path(&cwd));
        paths.register("shell", &fsutil::slashed_path(&config_dir));
        if !shell_config.paths.contains_key("temp") {
            paths.register("temp", "shell:/temp");
        }
        paths.register_all(shell_config.paths.clone());
        for (name, dir) in paths.iter() {
            debug!(namespace = name, dir, "path registered");
        }

        // settings
        let settings = load_settings(&shell_config, &paths)?;

        // variables
        let mut vars = VarStore::new();
        vars.declare("startup", Value::from(&startup), true)?;
        vars.declare("config", config.to_value(), true)?;
        vars.declare("settings", settings.to_value(), true)?;

        let vars = Rc::new(RefCell::new(vars));
        let paths = Rc::new(RefCell::new(paths));
        let fields = Rc::new(RefCell::new(Document::new()));
        let engine = LuaEngine::new(Rc::clone(&vars), Rc::clone(&paths), Rc::clone(&fields))?;

        let mut shell = Shell {
            state: ShellState::Initializing,
            running: false,
            startup,
            config,
            shell_config,
            settings,
            vars,
            paths,
            fields,
            handlers: HandlerRegistry::new(),
            processors: ProcessorRegistry::new(),
            macros: MacroTable::new(),
            formats: FormatTable::new(),
            parser_stages: Vec::new(),
            executor_stages: Vec::new(),
            features: Vec::new(),
            sources: Vec::new(),
            engine,
            depth: 0,
            terminate: Arc::new(AtomicBool::new(false)),
            _guard: guard,
        };

        for feature in default_features().into_iter().chain(self.features) {
            shell.install(feature)?;
        }
        shell.prepare_roots()?;
        shell.run_startup()?;

        shell.config.lock();
        shell.settings.lock();
        shell.running = true;
        shell.state = ShellState::Running;
        info!(features = ?shell.features, sources = ?shell.sources, "shell running");
        Ok(shell)
    }
}

/// Bundled defaults for this platform, then the configured entries in order.
fn load_settings(config: &ShellConfig, paths: &VirtualPaths) -> Result<Document> {
    let bundled = match embedded::load_resource(Some(BUNDLE), "settings.toml")? {
        Value::Map(map) => embedded::platform_settings(&map),
        _ => BTreeMap::new(),
    };
    let mut settings = Document::from_value(Value::Map(bundled))?;
    for item in &config.settings {
        match SettingsEntry::parse(item) {
            SettingsEntry::Assign(key, value) => settings.set(&key, value)?,
            SettingsEntry::Document(path) => {
                let path = paths.resolve(&path);
                match document::load(&path)? {
                    Value::Map(map) => settings.merge(&embedded::platform_settings(&map))?,
                    other => {
                        return Err(ShellError::runtime(format!(
                            "{path}: settings must be a table, found {}",
                            other.type_name()
                        )))
                    }
                }
            }
        }
    }
    if let Some(prompt) = &config.prompt {
        settings.set("prompt", prompt.as_str())?;
    }
    Ok(settings)
}

// ── Shell ─────────────────────────────────────────────────────────────────────

pub struct Shell {
    state: ShellState,
    running: bool,
    startup: Command,
    config: Document,
    shell_config: ShellConfig,
    settings: Document,
    vars: Rc<RefCell<VarStore>>,
    paths: Rc<RefCell<VirtualPaths>>,
    fields: Rc<RefCell<Document>>,
    handlers: HandlerRegistry,
    processors: ProcessorRegistry,
    macros: MacroTable,
    formats: FormatTable,
    parser_stages: Vec<Rc<dyn ParserStage>>,
    executor_stages: Vec<Rc<dyn ExecutorStage>>,
    features: Vec<String>,
    sources: Vec<String>,
    engine: LuaEngine,
    depth: usize,
    terminate: Arc<AtomicBool>,
    _guard: ActiveGuard,
}

impl Shell {
    // ── Initialization ────────────────────────────────────────────────────────

    fn install(&mut self, feature: Rc<dyn Feature>) -> Result<()> {
        let name = feature.name().to_owned();
        for (key, value) in feature.fields() {
            let mut fields = self.fields.borrow_mut();
            if fields.has(&key) {
                return Err(ShellError::contract(format!(
                    "feature '{name}': field '{key}' is already defined"
                )));
            }
            fields.set(&key, value)?;
        }
        for (processor, func) in feature.processors() {
            self.register_processor(processor, func);
        }
        if let Some(stage) = Rc::clone(&feature).parser_stage() {
            self.parser_stages.push(stage);
        }
        if let Some(stage) = Rc::clone(&feature).executor_stage() {
            self.executor_stages.push(stage);
        }
        feature.install(self)?;
        debug!(feature = %name, "feature installed");
        self.features.push(name);
        Ok(())
    }

    /// Empty the temp root, then register module and source roots.
    fn prepare_roots(&mut self) -> Result<()> {
        let temp = self.temp_dir()?;
        fsutil::reset_path(&temp)?;

        for module in self.shell_config.modules.clone() {
            let dir = fsutil::slashed_path(self.path(&module));
            if !fsutil::dir_exists(&dir) {
                warn!(dir = %dir, "module directory does not exist");
            }
            self.engine.add_module_dir(&dir)?;
        }
        self.engine.add_module_dir(&temp)?;

        for root in self.shell_config.sources.clone() {
            let root = self.path(&root);
            self.add_source_root(&root);
        }
        Ok(())
    }

    fn run_startup(&mut self) -> Result<()> {
        let delay = self.script_delay();
        for root in self.sources.clone() {
            let path = format!("{root}/{STARTUP_SCRIPT}");
            if !fsutil::file_exists(&path) {
                continue;
            }
            pause(delay);
            info!(script = %path, "startup");
            let source = fsutil::load_file(&path)?;
            self.dynaload(&source, STARTUP_SCRIPT)?;
        }
        for line in self.shell_config.startup.clone() {
            pause(delay);
            self.execute_line(&line);
        }
        Ok(())
    }

    fn temp_dir(&self) -> Result<String> {
        self.paths
            .borrow()
            .get("temp")
            .map(str::to_owned)
            .ok_or_else(|| ShellError::lookup("no 'temp' namespace registered"))
    }

    fn script_delay(&self) -> Option<Duration> {
        self.settings
            .get("script_delay")
            .and_then(Value::as_f64)
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> ShellState {
        self.state
    }

    /// Parsed process command line.
    pub fn startup(&self) -> &Command {
        &self.startup
    }

    pub fn config(&self) -> &Document {
        &self.config
    }

    pub fn settings(&self) -> &Document {
        &self.settings
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn processors(&self) -> &ProcessorRegistry {
        &self.processors
    }

    pub fn macros(&self) -> &MacroTable {
        &self.macros
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    /// Names of installed features, in install order.
    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn field(&self, key: &str) -> Option<Value> {
        self.fields.borrow().get(key).cloned()
    }

    /// Script source roots, in search order.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn engine(&self) -> &LuaEngine {
        &self.engine
    }

    /// Flipping the switch stops the loop before its next read.
    pub fn terminate_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    // ── Variables and paths ───────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<Value> {
        self.vars.borrow().get(key).cloned()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.vars.borrow_mut().set(key, value)
    }

    pub fn declare(&mut self, key: impl Into<String>, value: impl Into<Value>, protect: bool) -> Result<()> {
        self.vars.borrow_mut().declare(key, value, protect)
    }

    pub fn unset(&mut self, key: &str) -> Result<bool> {
        self.vars.borrow_mut().unset(key)
    }

    /// Resolve a virtual path.
    pub fn path(&self, value: &str) -> String {
        self.paths.borrow().resolve(value)
    }

    pub fn add_source_root(&mut self, root: &str) {
        let root = fsutil::slashed_path(root);
        if !fsutil::dir_exists(&root) {
            warn!(root = %root, "source root does not exist");
        }
        if !self.sources.contains(&root) {
            self.sources.push(root);
        }
    }

    // ── Registration ──────────────────────────────────────────────────────────

    pub fn register_handler(&mut self, verb: &str, noun: &str, handler: Handler) {
        if self.handlers.register(verb, noun, handler) {
            warn!("handler '{verb} {noun}' replaced");
        }
    }

    pub fn register_processor(&mut self, name: impl Into<String>, processor: Processor) {
        let name = name.into();
        if self.processors.register(name.clone(), processor) {
            warn!("processor '{name}' replaced");
        }
    }

    pub fn register_macro(&mut self, name: impl Into<String>, mac: Macro) {
        let name = name.into();
        if self.macros.add(name.clone(), mac) {
            warn!("macro '@{name}' replaced");
        }
    }

    pub fn register_format(&mut self, name: impl Into<String>, format: Format) {
        let name = name.into();
        if self.formats.add(name.clone(), format) {
            warn!("format '#!{name}' replaced");
        }
    }

    // ── Sources and units ─────────────────────────────────────────────────────

    /// Run `f` one level deeper, failing past [`MAX_DEPTH`].
    pub fn nested<R>(&mut self, f: impl FnOnce(&mut Shell) -> Result<R>) -> Result<R> {
        if self.depth >= MAX_DEPTH {
            return Err(ShellError::runtime(format!(
                "nesting deeper than {MAX_DEPTH} levels"
            )));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// Run `src` through every parser stage in install order.
    pub fn parse(&mut self, src: &str) -> Result<String> {
        let stages = self.parser_stages.clone();
        let mut text = src.to_owned();
        for stage in stages {
            text = stage.parse(self, text)?;
        }
        Ok(text)
    }

    /// File holding script `name`.  A name with a namespace is checked at
    /// that one location; a bare name is searched in the source roots.
    pub fn locate(&self, name: &str) -> Option<String> {
        if name.contains(':') {
            let path = self.path(name);
            return fsutil::file_exists(&path).then_some(path);
        }
        self.sources
            .iter()
            .map(|root| format!("{root}/{name}"))
            .find(|path| fsutil::file_exists(path))
    }

    /// Source text of script `name`, `None` when there is no such script.
    pub fn try_source(&self, name: &str) -> Result<Option<String>> {
        self.locate(name).map(fsutil::load_file).transpose()
    }

    pub fn source(&self, name: &str) -> Result<String> {
        self.try_source(name)?
            .ok_or_else(|| ShellError::lookup(format!("no script named '{name}'")))
    }

    /// Wrap already-parsed `source` into a unit with the current declared
    /// variables bound.
    pub fn compile(&mut self, source: &str, label: &str) -> Result<ScriptUnit> {
        let declared: Vec<(String, Value)> = self
            .vars
            .borrow()
            .declared()
            .map(|(key, value)| (key.to_owned(), value.clone()))
            .collect();
        let include = self.shell_config.include.clone();
        let unit = self.engine.compile(source, label, include.as_deref(), declared);

        let path = format!("{}/{}", self.temp_dir()?, unit.file_name());
        if let Err(e) = fsutil::save_file(&path, unit.text()) {
            warn!(unit = %unit.name(), "cannot keep unit text: {e}");
        }
        debug!(unit = %unit.name(), label, "compiled");
        Ok(unit)
    }

    /// Run a compiled unit.  Returns whether its lifecycle hook ran.
    pub fn run_unit(&mut self, unit: &ScriptUnit) -> Result<bool> {
        self.with_engine(|engine| engine.run(unit))
    }

    /// Parse, compile and run `source`.
    pub fn dynaload(&mut self, source: &str, label: &str) -> Result<bool> {
        let parsed = self.parse(source)?;
        let unit = self.compile(&parsed, label)?;
        self.run_unit(&unit)
    }

    // ── Lua requests ──────────────────────────────────────────────────────────

    /// Call into Lua, then apply whatever the call queued.
    fn with_engine<R>(&mut self, f: impl FnOnce(&LuaEngine) -> Result<R>) -> Result<R> {
        let result = f(&self.engine);
        let applied = self.drain_requests();
        let value = result?;
        applied?;
        Ok(value)
    }

    fn drain_requests(&mut self) -> Result<()> {
        loop {
            let requests = self.engine.take_requests();
            if requests.is_empty() {
                return Ok(());
            }
            for request in requests {
                self.apply(request)?;
            }
        }
    }

    fn apply(&mut self, request: ScriptRequest) -> Result<()> {
        match request {
            ScriptRequest::Handler { verb, noun, func } => {
                let handler: Handler = Rc::new(move |shell: &mut Shell, verb: &str, noun: &str, cmd: &mut Command| {
                    shell.with_engine(|engine| engine.call_handler(&func, verb, noun, cmd))
                });
                self.register_handler(&verb, &noun, handler);
            }
            ScriptRequest::Macro { name, func } => {
                let mac: Macro = Rc::new(move |shell: &mut Shell, cmd: &mut Command| {
                    shell.with_engine(|engine| engine.call_macro(&func, cmd))
                });
                self.register_macro(name, mac);
            }
            ScriptRequest::Format { name, func } => {
                let format: Format = Rc::new(move |shell: &mut Shell, text: &str| {
                    shell.with_engine(|engine| engine.call_format(&func, text))
                });
                self.register_format(name, format);
            }
            ScriptRequest::Processor { name, func } => {
                let processor: Processor = Rc::new(move |shell: &mut Shell, ctx: &mut Context| {
                    shell.with_engine(|engine| engine.call_processor(&func, ctx))
                });
                self.register_processor(name, processor);
            }
            ScriptRequest::Invoke { name, data, members } => {
                self.invoke_processor(&name, data, members)?;
            }
            ScriptRequest::Execute { line } => {
                self.nested(|shell| shell.dispatch(Command::parse(&line)?))?;
            }
            ScriptRequest::Exit => {
                info!("exit requested by script");
                self.terminate.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Run processor `name` with a context built from `data` and `members`.
    pub fn invoke_processor(
        &mut self,
        name: &str,
        data: Vec<Value>,
        members: BTreeMap<String, Value>,
    ) -> Result<()> {
        let processor = self
            .processors
            .get(name)
            .ok_or_else(|| ShellError::lookup(format!("no processor named '{name}'")))?;
        let mut ctx = Context::new(name, data, members, self.settings.root().clone())?;
        self.nested(|shell| processor(shell, &mut ctx))
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Offer `cmd` to every executor stage in order, then fall back to the
    /// script of the same name.
    pub fn dispatch(&mut self, mut cmd: Command) -> Result<()> {
        self.vars.borrow_mut().redeclare("command", Value::from(&cmd));
        let stages = self.executor_stages.clone();
        for stage in stages {
            if stage.execute(self, &mut cmd)? {
                return Ok(());
            }
        }
        let source = self.source(&cmd.name)?;
        self.dynaload(&source, &cmd.name)?;
        Ok(())
    }

    /// Dispatch `cmd`, logging and swallowing any failure.  Returns whether
    /// the command succeeded.
    pub fn execute(&mut self, cmd: Command) -> bool {
        if self.state == ShellState::Stopped {
            warn!(command = %cmd.name, "shell is stopped, command ignored");
            return false;
        }
        let name = cmd.name.clone();
        match self.dispatch(cmd) {
            Ok(()) => true,
            Err(e) => {
                error!(command = %name, class = e.class(), "{e}");
                false
            }
        }
    }

    /// Parse and execute one line.
    pub fn execute_line(&mut self, line: &str) -> bool {
        match Command::parse(line) {
            Ok(cmd) => self.execute(cmd),
            Err(e) => {
                error!(line, class = e.class(), "{e}");
                false
            }
        }
    }

    // ── Loop and shutdown ─────────────────────────────────────────────────────

    /// Read and execute lines until the source ends, `exit` is read or the
    /// termination switch is set.  Shuts the shell down afterwards.
    pub fn run(&mut self, source: &mut dyn LineSource) {
        while !self.terminate.load(Ordering::SeqCst) {
            let Some(line) = source.read_line() else { break };
            let line = line.trim();
            if line.is_empty() || line.starts_with(COMMENT) {
                continue;
            }
            if line == EXIT {
                break;
            }
            self.execute_line(line);
        }
        self.shutdown();
    }

    /// Run the configured shutdown lines, then every `SHUTDOWN` script.
    /// Only the first call does anything.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.state = ShellState::ShuttingDown;
        info!("shutting down");

        let delay = self.script_delay();
        for line in self.shell_config.shutdown.clone() {
            pause(delay);
            self.execute_line(&line);
        }
        for root in self.sources.clone() {
            let path = format!("{root}/{SHUTDOWN_SCRIPT}");
            if !fsutil::file_exists(&path) {
                continue;
            }
            pause(delay);
            let result = fsutil::load_file(&path).and_then(|source| self.dynaload(&source, SHUTDOWN_SCRIPT));
            if let Err(e) = result {
                error!(script = %path, class = e.class(), "{e}");
            }
        }
        self.state = ShellState::Stopped;
        info!("stopped");
    }

    // ── Input ─────────────────────────────────────────────────────────────────

    /// Line source for [`run`](Self::run): the positional startup arguments,
    /// then the prompt (or plain stdin when it is not a terminal) unless
    /// `--stdin=false` was given.
    pub fn reader(&self) -> Reader {
        let queue: LineQueue = self.startup.data.iter().cloned().collect();
        if matches!(self.startup.flag("stdin"), Some(v) if !v.as_bool()) {
            return Reader::queued(queue);
        }
        if !reader::stdin_is_tty() {
            return Reader::with_fallback(queue, self.interruptible(Box::new(StdinLines)));
        }
        let prompt = self.settings.get_str("prompt").unwrap_or("> ").to_owned();
        let history = match &self.shell_config.history {
            Some(path) => Some(PathBuf::from(self.path(path))),
            None => Prompt::default_history(),
        };
        let size = self
            .settings
            .get("history_size")
            .and_then(Value::as_f64)
            .map_or(1000, |n| n.max(0.0) as usize);
        let fallback: Box<dyn LineSource + Send> = match Prompt::new(prompt, history, size) {
            Some(prompt) => Box::new(prompt),
            None => Box::new(StdinLines),
        };
        Reader::with_fallback(queue, self.interruptible(fallback))
    }

    fn interruptible(&self, source: Box<dyn LineSource + Send>) -> Box<dyn LineSource> {
        Box::new(Interruptible::spawn(source, self.terminate_switch()))
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        std::thread::sleep(delay);
    }
}

// ── Test support ──────────────────────────────────────────────────────────────


// ── Tests ─────────────────────────────────────────────────────────────────────
