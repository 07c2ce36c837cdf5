//! Line sources for the input loop.
//!
//! [`Reader`] hands out queued lines first (command-line arguments, test
//! input) and then falls back to an interactive [`Prompt`] or, when stdin is
//! not a terminal, to [`StdinLines`].  The fallback runs behind an
//! [`Interruptible`] so a termination signal ends a blocked read.

use std::collections::VecDeque;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use rustyline::error::ReadlineError;
use rustyline::{Config, DefaultEditor};
use tracing::{debug, warn};

/// Where the input loop reads from.  `None` ends the loop.
pub trait LineSource {
    fn read_line(&mut self) -> Option<String>;
}

// ── LineQueue ─────────────────────────────────────────────────────────────────

/// Pre-loaded lines.
#[derive(Debug, Default, Clone)]
pub struct LineQueue {
    lines: VecDeque<String>,
}

impl LineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue every line of `text`.
    pub fn append(&mut self, text: &str) {
        self.lines.extend(text.lines().map(str::to_owned));
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for LineQueue {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self { lines: iter.into_iter().map(Into::into).collect() }
    }
}

impl LineSource for LineQueue {
    fn read_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }
}

// ── Prompt ────────────────────────────────────────────────────────────────────

/// Interactive line editor with persisted history.
pub struct Prompt {
    editor: DefaultEditor,
    prompt: String,
    history: Option<PathBuf>,
}

impl Prompt {
    pub fn new(prompt: impl Into<String>, history: Option<PathBuf>, history_size: usize) -> Option<Self> {
        let config = Config::builder()
            .max_history_size(history_size)
            .ok()?
            .auto_add_history(true)
            .build();
        let mut editor = match DefaultEditor::with_config(config) {
            Ok(editor) => editor,
            Err(e) => {
                warn!("cannot start the line editor: {e}");
                return None;
            }
        };
        if let Some(path) = &history {
            match editor.load_history(path) {
                Ok(()) => debug!(path = %path.display(), "history loaded"),
                Err(ReadlineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "cannot load history: {e}"),
            }
        }
        Some(Self { editor, prompt: prompt.into(), history })
    }

    /// Platform data directory history file.
    pub fn default_history() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", crate::embedded::BUNDLE)
            .map(|dirs| dirs.data_dir().join("history.txt"))
    }

    fn save_history(&mut self) {
        let Some(path) = &self.history else { return };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), "cannot create history directory: {e}");
                return;
            }
        }
        if let Err(e) = self.editor.save_history(path) {
            warn!(path = %path.display(), "cannot save history: {e}");
        }
    }
}

impl LineSource for Prompt {
    fn read_line(&mut self) -> Option<String> {
        match self.editor.readline(&self.prompt) {
            Ok(line) => {
                // the input thread may never be joined
                self.save_history();
                Some(line)
            }
            // ^C abandons the current line only
            Err(ReadlineError::Interrupted) => Some(String::new()),
            Err(ReadlineError::Eof) => None,
            Err(e) => {
                warn!("input error: {e}");
                None
            }
        }
    }
}

impl Drop for Prompt {
    fn drop(&mut self) {
        self.save_history();
    }
}

// ── StdinLines ────────────────────────────────────────────────────────────────

/// Plain buffered stdin, for piped input.
#[derive(Debug, Default)]
pub struct StdinLines;

impl LineSource for StdinLines {
    fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\n', '\r']).to_owned()),
            Err(e) => {
                warn!("cannot read stdin: {e}");
                None
            }
        }
    }
}

/// `true` when stdin is a terminal.
pub fn stdin_is_tty() -> bool {
    // SAFETY: isatty only inspects the descriptor.
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

// ── Interruptible ───────────────────────────────────────────────────────────

/// How often a waiting [`Interruptible`] checks its switch.
const POLL: Duration = Duration::from_millis(50);

/// A blocking source read on its own thread.  [`read_line`] returns `None`
/// as soon as `terminate` is set, even while the thread is still blocked.
///
/// [`read_line`]: LineSource::read_line
pub struct Interruptible {
    want: Sender<()>,
    lines: Receiver<Option<String>>,
    pending: bool,
    terminate: Arc<AtomicBool>,
}

impl Interruptible {
    pub fn spawn(mut source: Box<dyn LineSource + Send>, terminate: Arc<AtomicBool>) -> Self {
        let (want, wanted) = channel::<()>();
        let (tx, lines) = channel();
        let spawned = std::thread::Builder::new()
            .name("dsh-input".into())
            .spawn(move || {
                // one line per request, so a prompt never shows early
                while wanted.recv().is_ok() {
                    let line = source.read_line();
                    let done = line.is_none();
                    if tx.send(line).is_err() || done {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("cannot start the input thread: {e}");
        }
        Self { want, lines, pending: false, terminate }
    }
}

impl LineSource for Interruptible {
    fn read_line(&mut self) -> Option<String> {
        if !self.pending {
            self.want.send(()).ok()?;
            self.pending = true;
        }
        loop {
            if self.terminate.load(Ordering::SeqCst) {
                return None;
            }
            match self.lines.recv_timeout(POLL) {
                Ok(line) => {
                    self.pending = false;
                    return line;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Queued lines, then an optional fallback source.
#[derive(Default)]
pub struct Reader {
    queue: LineQueue,
    fallback: Option<Box<dyn LineSource>>,
}

impl Reader {
    /// Reader over queued lines only.
    pub fn queued(queue: LineQueue) -> Self {
        Self { queue, fallback: None }
    }

    pub fn with_fallback(queue: LineQueue, fallback: Box<dyn LineSource>) -> Self {
        Self { queue, fallback: Some(fallback) }
    }

    pub fn queue_mut(&mut self) -> &mut LineQueue {
        &mut self.queue
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl LineSource for Reader {
    fn read_line(&mut self) -> Option<String> {
        if let Some(line) = self.queue.read_line() {
            return Some(line);
        }
        self.fallback.as_mut()?.read_line()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
