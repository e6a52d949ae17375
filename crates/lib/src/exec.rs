//! Command allowlist: a command runs only if one configured regex matches its start.
//! List-form commands are joined into a shell-quoted line first, so both forms match identically.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A command as sent by the client: one shell line, or an argument list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

/// Argument contains a NUL byte and cannot be quoted for the shell.
#[derive(Debug, thiserror::Error)]
#[error("command cannot be quoted: {0}")]
pub struct QuoteError(String);

impl CommandLine {
    /// The shell command line: the string as-is, or each argument quoted and joined by spaces.
    pub fn joined(&self) -> Result<String, QuoteError> {
        match self {
            CommandLine::Line(s) => Ok(s.clone()),
            CommandLine::Argv(args) => shlex::try_join(args.iter().map(String::as_str))
                .map_err(|e| QuoteError(e.to_string())),
        }
    }

    /// First word of the command, used as a selector by variable queries.
    pub fn first(&self) -> Option<&str> {
        match self {
            CommandLine::Line(s) => s.split_whitespace().next(),
            CommandLine::Argv(args) => args.first().map(String::as_str),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(s: &str) -> Self {
        CommandLine::Line(s.to_string())
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.joined() {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Compiled allowlist. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    /// Each rule anchored at the start of the command line.
    rules: Vec<Regex>,
}

impl Allowlist {
    /// Compile the configured patterns; fails on the first invalid one.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let rules = patterns
            .iter()
            .map(|p| Regex::new(&format!("^(?:{})", p.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// True iff at least one rule matches a prefix of the joined command line.
    pub fn is_allowed(&self, command: &CommandLine) -> bool {
        match command.joined() {
            Ok(line) => self.is_allowed_line(&line),
            Err(_) => false,
        }
    }

    pub fn is_allowed_line(&self, line: &str) -> bool {
        self.rules.iter().any(|r| r.is_match(line))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
