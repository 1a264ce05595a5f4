//! Job conditions: a small boolean predicate language
//!
//! Conditions are parsed once, at pipeline load time, into a [`Predicate`]
//! tree and evaluated against a [`RunContext`] by a tiny interpreter.
//!
//! ```text
//! event == push && ref == refs/heads/main
//! !paths.only('docs/**', '*.md')
//! (event == pull-request || event == merge-queue) && repository != acme/fork
//! outputs.version.changed == 'true'
//! ```
//!
//! Anything that parses but is not understood (an unknown field, an unknown
//! event name, an unknown function) evaluates to `false`. Only malformed
//! syntax is an error.

use crate::core::{
    context::{EventKind, RunContext},
    error::ConditionSyntaxError,
    policy::PathFilterPolicy,
};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashMap};
use std::iter::Peekable;
use std::str::CharIndices;

/// Structured outputs of finished jobs: job name -> key -> value
pub type OutputMap = BTreeMap<String, BTreeMap<String, String>>;

/// Parsed condition
#[derive(Debug, Clone)]
pub enum Predicate {
    Const(bool),
    Atom(Atom),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

/// Leaf test of a predicate
#[derive(Debug, Clone)]
pub enum Atom {
    Compare {
        field: Field,
        negated: bool,
        value: String,
    },
    /// True when any changed path matches one of the patterns
    PathsAny(PathPatterns),
    /// True when every changed path matches one of the patterns
    PathsOnly(PathPatterns),
    /// Parsed but not understood; always false
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Event(EventKind),
    Ref,
    Repository,
    Tag,
    Output { job: String, key: String },
}

/// Compiled glob set plus its source patterns
#[derive(Debug, Clone)]
pub struct PathPatterns {
    pub patterns: Vec<String>,
    set: GlobSet,
}

impl PathPatterns {
    fn compile(patterns: Vec<String>, position: usize) -> Result<Self, ConditionSyntaxError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| ConditionSyntaxError::new(position, format!("invalid glob '{}': {}", pattern, e)))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| ConditionSyntaxError::new(position, e.to_string()))?;
        Ok(Self { patterns, set })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.set.is_match(path)
    }
}

/// What a predicate is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct EvalScope<'a> {
    pub context: &'a RunContext,
    pub empty_paths: PathFilterPolicy,
    pub outputs: Option<&'a OutputMap>,
}

impl<'a> EvalScope<'a> {
    pub fn new(context: &'a RunContext, empty_paths: PathFilterPolicy) -> Self {
        Self {
            context,
            empty_paths,
            outputs: None,
        }
    }

    pub fn with_outputs(mut self, outputs: &'a OutputMap) -> Self {
        self.outputs = Some(outputs);
        self
    }
}

impl Predicate {
    /// Parse a condition string
    pub fn parse(source: &str) -> Result<Self, ConditionSyntaxError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            len: source.len(),
        };
        let predicate = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(ConditionSyntaxError::new(
                tok.position,
                format!("unexpected {}", tok.kind.describe()),
            ));
        }
        Ok(predicate)
    }

    /// Evaluate against a run. Pure: same scope, same answer.
    pub fn evaluate(&self, scope: &EvalScope<'_>) -> bool {
        match self {
            Predicate::Const(b) => *b,
            Predicate::Atom(atom) => atom.evaluate(scope),
            Predicate::Not(inner) => !inner.evaluate(scope),
            Predicate::And(a, b) => a.evaluate(scope) && b.evaluate(scope),
            Predicate::Or(a, b) => a.evaluate(scope) || b.evaluate(scope),
        }
    }

    /// Whether the predicate reads job outputs and so must wait for dependencies
    pub fn references_outputs(&self) -> bool {
        match self {
            Predicate::Const(_) => false,
            Predicate::Atom(Atom::Compare { field, .. }) => matches!(field, Field::Output { .. }),
            Predicate::Atom(_) => false,
            Predicate::Not(inner) => inner.references_outputs(),
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.references_outputs() || b.references_outputs()
            }
        }
    }
}

impl Atom {
    fn evaluate(&self, scope: &EvalScope<'_>) -> bool {
        let ctx = scope.context;
        match self {
            Atom::Compare { field, negated, value } => {
                let actual: Option<&str> = match field {
                    Field::Event(kind) => {
                        let equal = ctx.event == *kind;
                        return equal != *negated;
                    }
                    Field::Ref => Some(ctx.git_ref.as_str()),
                    Field::Repository => Some(ctx.repository.as_str()),
                    Field::Tag => ctx.release_tag.as_deref(),
                    Field::Output { job, key } => scope
                        .outputs
                        .and_then(|o| o.get(job))
                        .and_then(|o| o.get(key))
                        .map(String::as_str),
                };
                // A missing value is an unknown, and unknowns fail closed
                match actual {
                    Some(actual) => (actual == value) != *negated,
                    None => false,
                }
            }
            Atom::PathsAny(patterns) => {
                if ctx.changed_paths.is_empty() {
                    return scope.empty_paths == PathFilterPolicy::AssumeAllChanged;
                }
                ctx.changed_paths.iter().any(|p| patterns.is_match(p))
            }
            Atom::PathsOnly(patterns) => {
                if ctx.changed_paths.is_empty() {
                    return scope.empty_paths == PathFilterPolicy::AssumeNoneChanged;
                }
                ctx.changed_paths.iter().all(|p| patterns.is_match(p))
            }
            Atom::Unknown(_) => false,
        }
    }
}

/// Context-only condition results, computed once per run and keyed by job name
#[derive(Debug, Clone, Default)]
pub struct ConditionCache {
    results: HashMap<String, bool>,
}

impl ConditionCache {
    /// Evaluate every condition that does not depend on job outputs
    pub fn precompute<'a, I>(conditions: I, scope: &EvalScope<'_>) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a Predicate>)>,
    {
        let results = conditions
            .into_iter()
            .filter_map(|(job, predicate)| match predicate {
                None => Some((job.to_string(), true)),
                Some(p) if !p.references_outputs() => Some((job.to_string(), p.evaluate(scope))),
                Some(_) => None,
            })
            .collect();
        Self { results }
    }

    /// `None` when the job's condition is deferred until its dependencies finish
    pub fn get(&self, job: &str) -> Option<bool> {
        self.results.get(job).copied()
    }
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Word(String),
    Str(String),
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::LParen => "'('".into(),
            TokenKind::RParen => "')'".into(),
            TokenKind::Comma => "','".into(),
            TokenKind::Not => "'!'".into(),
            TokenKind::And => "'&&'".into(),
            TokenKind::Or => "'||'".into(),
            TokenKind::Eq => "'=='".into(),
            TokenKind::Ne => "'!='".into(),
            TokenKind::Word(w) => format!("'{}'", w),
            TokenKind::Str(s) => format!("string '{}'", s),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '*' | '@' | '+' | ':')
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionSyntaxError> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<CharIndices<'_>> = source.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let kind = match c {
            c if c.is_whitespace() => continue,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            '!' => {
                if chars.next_if(|(_, c)| *c == '=').is_some() {
                    TokenKind::Ne
                } else {
                    TokenKind::Not
                }
            }
            '=' => {
                if chars.next_if(|(_, c)| *c == '=').is_none() {
                    return Err(ConditionSyntaxError::new(pos, "expected '=='"));
                }
                TokenKind::Eq
            }
            '&' => {
                if chars.next_if(|(_, c)| *c == '&').is_none() {
                    return Err(ConditionSyntaxError::new(pos, "expected '&&'"));
                }
                TokenKind::And
            }
            '|' => {
                if chars.next_if(|(_, c)| *c == '|').is_none() {
                    return Err(ConditionSyntaxError::new(pos, "expected '||'"));
                }
                TokenKind::Or
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(ConditionSyntaxError::new(pos, "unterminated string"));
                }
                TokenKind::Str(value)
            }
            c if is_word_char(c) => {
                let mut word = c.to_string();
                while let Some((_, c)) = chars.next_if(|(_, c)| is_word_char(*c)) {
                    word.push(c);
                }
                TokenKind::Word(word)
            }
            other => {
                return Err(ConditionSyntaxError::new(
                    pos,
                    format!("unexpected character '{}'", other),
                ))
            }
        };
        tokens.push(Token { kind, position: pos });
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| &t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: &str) -> ConditionSyntaxError {
        let position = self.peek().map(|t| t.position).unwrap_or(self.len);
        ConditionSyntaxError::new(position, message)
    }

    fn parse_or(&mut self) -> Result<Predicate, ConditionSyntaxError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, ConditionSyntaxError> {
        let mut left = self.parse_unary()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate, ConditionSyntaxError> {
        if self.eat(&TokenKind::Not) {
            let inner = self.parse_unary()?;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate, ConditionSyntaxError> {
        let Some(token) = self.next() else {
            return Err(self.error_here("unexpected end of condition"));
        };

        match token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&TokenKind::RParen) {
                    return Err(self.error_here("expected ')'"));
                }
                Ok(inner)
            }
            TokenKind::Word(word) => self.parse_word(word, token.position),
            other => Err(ConditionSyntaxError::new(
                token.position,
                format!("unexpected {}", other.describe()),
            )),
        }
    }

    fn parse_word(&mut self, word: String, position: usize) -> Result<Predicate, ConditionSyntaxError> {
        match word.as_str() {
            "true" => return Ok(Predicate::Const(true)),
            "false" => return Ok(Predicate::Const(false)),
            _ => {}
        }

        if self.eat(&TokenKind::LParen) {
            let args = self.parse_args()?;
            let atom = match word.as_str() {
                "paths.any" | "paths.only" => {
                    if args.is_empty() {
                        return Err(ConditionSyntaxError::new(
                            position,
                            format!("{} needs at least one pattern", word),
                        ));
                    }
                    let patterns = PathPatterns::compile(args, position)?;
                    if word == "paths.any" {
                        Atom::PathsAny(patterns)
                    } else {
                        Atom::PathsOnly(patterns)
                    }
                }
                _ => Atom::Unknown(format!("{}(..)", word)),
            };
            return Ok(Predicate::Atom(atom));
        }

        let negated = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Eq) => false,
            Some(TokenKind::Ne) => true,
            _ => return Ok(Predicate::Atom(Atom::Unknown(word))),
        };
        self.pos += 1;
        let value = self.parse_value()?;

        let field = match word.as_str() {
            "event" => match value.parse::<EventKind>() {
                Ok(kind) => Field::Event(kind),
                Err(_) => {
                    return Ok(Predicate::Atom(Atom::Unknown(format!("event == {}", value))));
                }
            },
            "ref" => Field::Ref,
            "repository" => Field::Repository,
            "tag" => Field::Tag,
            other => {
                let parts: Vec<&str> = other.split('.').collect();
                match parts.as_slice() {
                    ["outputs", job, key] if !job.is_empty() && !key.is_empty() => Field::Output {
                        job: job.to_string(),
                        key: key.to_string(),
                    },
                    _ => return Ok(Predicate::Atom(Atom::Unknown(other.to_string()))),
                }
            }
        };

        Ok(Predicate::Atom(Atom::Compare { field, negated, value }))
    }

    fn parse_value(&mut self) -> Result<String, ConditionSyntaxError> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Word(w)) | Some(TokenKind::Str(w)) => {
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.error_here("expected a value")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<String>, ConditionSyntaxError> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_value()?);
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            if self.eat(&TokenKind::RParen) {
                return Ok(args);
            }
            return Err(self.error_here("expected ',' or ')'"));
        }
    }
}
