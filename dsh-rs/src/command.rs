//! Command-line tokenizer and the typed [`Command`] model.
//!
//! ## Grammar
//!
//! ```text
//! line  ::= word (word | value | flag)*
//! word  ::= '"' ... '"' | "'" ... "'" | bare
//! value ::= key '=' literal
//! flag  ::= '--' key ['=' literal]
//! ```
//!
//! Leading whitespace is skipped before every token.  A `--` prefix always
//! wins over word parsing.  Quoted strings run verbatim to the matching quote
//! with no escape processing.  Bare words stop at whitespace or `=` and must
//! be non-empty.
//!
//! Values and flag values go through [`coerce`]; positional data stays text.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::error::{Result, ShellError};
use crate::value::Value;

// ── Literal coercion ──────────────────────────────────────────────────────────

/// Coerce literal text into a typed [`Value`].
///
/// Tried in order: `null`/`None`, `true`/`True`, `false`/`False`, integer,
/// finite float, one layer of matching surrounding quotes, plain text.
pub fn coerce(text: &str) -> Value {
    let text = text.trim();
    match text {
        "null" | "None" => return Value::Null,
        "true" | "True" => return Value::Bool(true),
        "false" | "False" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return Value::Int(n);
    }
    // `inf` and `nan` stay text
    if let Some(x) = text.parse::<f64>().ok().filter(|x| x.is_finite()) {
        return Value::Float(x);
    }
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return Value::Str(text[1..text.len() - 1].to_owned());
        }
    }
    Value::Str(text.to_owned())
}

// ── Tokens ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Positional word.
    Data,
    /// `key=literal`.
    Value,
    /// `--key` or `--key=literal`.
    Flag,
}

/// One lexical item.  `value` is raw text except for a bare flag, which
/// carries `true`.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub key: Option<String>,
    pub value: Value,
}

impl Token {
    fn data(text: String) -> Self {
        Token { kind: TokenKind::Data, key: None, value: Value::Str(text) }
    }

    fn value(key: String, text: String) -> Self {
        Token { kind: TokenKind::Value, key: Some(key), value: Value::Str(text) }
    }

    fn flag(key: String, value: Value) -> Self {
        Token { kind: TokenKind::Flag, key: Some(key), value }
    }

    /// The token value after literal coercion.  Data stays text.
    pub fn coerced(&self) -> Value {
        match (&self.kind, &self.value) {
            (TokenKind::Data, v) => v.clone(),
            (_, Value::Str(text)) => coerce(text),
            (_, v) => v.clone(),
        }
    }
}

// ── Tokenizer ─────────────────────────────────────────────────────────────────

/// Character-level scanner over one command line.
pub struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    pub fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    /// Scan the whole line.
    pub fn tokens(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        while !self.done() {
            out.push(self.read()?);
        }
        Ok(out)
    }

    fn done(&self) -> bool {
        self.rest.trim().is_empty()
    }

    /// Skip whitespace, then consume `lit` if it comes next.
    fn scan(&mut self, lit: &str) -> bool {
        self.rest = self.rest.trim_start();
        match self.rest.strip_prefix(lit) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn read(&mut self) -> Result<Token> {
        if self.scan("--") {
            let key = self.read_word()?;
            let value = if self.scan("=") {
                Value::Str(self.read_value()?)
            } else {
                Value::Bool(true)
            };
            return Ok(Token::flag(key, value));
        }
        for quote in ["\"", "'"] {
            if self.scan(quote) {
                return Ok(Token::data(self.read_string(quote)?));
            }
        }
        let word = self.read_word()?;
        if self.scan("=") {
            return Ok(Token::value(word, self.read_value()?));
        }
        Ok(Token::data(word))
    }

    fn read_word(&mut self) -> Result<String> {
        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(self.rest.len());
        if end == 0 {
            return Err(ShellError::parse(format!(
                "expected a word at '{}'",
                self.rest.trim_end()
            )));
        }
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(word.to_owned())
    }

    fn read_value(&mut self) -> Result<String> {
        for quote in ["\"", "'"] {
            if self.scan(quote) {
                return self.read_string(quote);
            }
        }
        let end = self.rest.find(char::is_whitespace).unwrap_or(self.rest.len());
        let (text, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(text.to_owned())
    }

    fn read_string(&mut self, quote: &str) -> Result<String> {
        let end = self
            .rest
            .find(quote)
            .ok_or_else(|| ShellError::parse(format!("unmatched {quote} in command line")))?;
        let text = self.rest[..end].to_owned();
        self.rest = &self.rest[end + quote.len()..];
        Ok(text)
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

/// One parsed input line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    /// First data word.
    pub name: String,
    /// The line after the name and one separator, trimmed.
    pub text: String,
    /// Positional words after the name, in order.
    pub data: VecDeque<String>,
    /// `key=literal` pairs; later duplicates win.
    pub value: BTreeMap<String, Value>,
    /// `--key[=literal]` pairs; a bare flag is `true`.
    pub flag: BTreeMap<String, Value>,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let mut data = VecDeque::new();
        let mut value = BTreeMap::new();
        let mut flag = BTreeMap::new();

        for token in Tokenizer::new(line).tokens()? {
            let coerced = token.coerced();
            match (token.kind, token.key) {
                (TokenKind::Value, Some(key)) => {
                    value.insert(key, coerced);
                }
                (TokenKind::Flag, Some(key)) => {
                    flag.insert(key, coerced);
                }
                _ => {
                    if let Value::Str(word) = token.value {
                        data.push_back(word);
                    }
                }
            }
        }

        let name = data
            .pop_front()
            .ok_or_else(|| ShellError::parse(format!("no command name in '{line}'")))?;
        let text = line.get(name.len() + 1..).unwrap_or("").trim().to_owned();

        Ok(Command { name, text, data, value, flag })
    }

    // ── Positional data ───────────────────────────────────────────────────────

    /// Next positional word, not consumed.
    pub fn peek(&self) -> Option<&str> {
        self.data.front().map(String::as_str)
    }

    /// Consume the next positional word.
    pub fn pop(&mut self) -> Option<String> {
        self.data.pop_front()
    }

    /// Consume the next word, which must equal `word`.
    pub fn expect(&mut self, word: &str) -> Result<()> {
        match self.peek() {
            Some(next) if next == word => {
                self.data.pop_front();
                Ok(())
            }
            Some(next) => Err(ShellError::parse(format!(
                "{}: expected '{word}', found '{next}'",
                self.name
            ))),
            None => Err(ShellError::parse(format!(
                "{}: expected '{word}' at end of line",
                self.name
            ))),
        }
    }

    /// Consume the next word if it equals `word`.
    pub fn see(&mut self, word: &str) -> bool {
        if self.peek() == Some(word) {
            self.data.pop_front();
            true
        } else {
            false
        }
    }

    /// Put a word back at the front.
    pub fn push_front(&mut self, word: impl Into<String>) {
        self.data.push_front(word.into());
    }

    /// Move the next positional word into the named value `into`.
    pub fn shift(&mut self, into: &str) -> Option<&Value> {
        let word = self.data.pop_front()?;
        self.value.insert(into.to_owned(), Value::Str(word));
        self.value.get(into)
    }

    /// `true` when no positional words remain.
    pub fn done(&self) -> bool {
        self.data.is_empty()
    }

    // ── Named values and flags ────────────────────────────────────────────────

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    pub fn flag(&self, key: &str) -> Option<&Value> {
        self.flag.get(key)
    }

    /// `true` when the flag is present and truthy.
    pub fn is_set(&self, key: &str) -> bool {
        self.flag.get(key).is_some_and(Value::as_bool)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for word in &self.data {
            write!(f, " {word:?}")?;
        }
        for (key, value) in &self.value {
            write!(f, " {key}={value}")?;
        }
        for (key, value) in &self.flag {
            write!(f, " --{key}={value}")?;
        }
        Ok(())
    }
}

impl From<&Command> for Value {
    fn from(cmd: &Command) -> Self {
        let mut map = BTreeMap::new();
        map.insert("name".to_owned(), Value::from(cmd.name.as_str()));
        map.insert("text".to_owned(), Value::from(cmd.text.as_str()));
        map.insert(
            "data".to_owned(),
            Value::List(cmd.data.iter().map(|w| Value::from(w.as_str())).collect()),
        );
        map.insert("value".to_owned(), Value::Map(cmd.value.clone()));
        map.insert("flag".to_owned(), Value::Map(cmd.flag.clone()));
        Value::Map(map)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
