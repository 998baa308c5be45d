//! In-process host compiler for transpiled source
//!
//! Accepts exactly the Rust subset the emitter writes: a `use` of the
//! prelude, factory functions, and the `program` entry point built from
//! `check_cancelled`, `let`, `Object::new`/`insert`, `invoke` and `cast`.
//! Loading runs in two passes (parse, then name resolution) and reports
//! every diagnostic it finds; a unit is only produced when there are none.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

use super::prelude::{check_cancelled, invoke};
use super::{ENTRY_POINT, HostCompiler, LoadedUnit};
use crate::api::ApiSurface;
use crate::error::{Diagnostic, RuntimeError};
use crate::program::{Location, PathSegment};
use crate::value::{Object, Value};

/// Units kept by [`SourceLoader::new`]
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Loads generated source without an external toolchain
///
/// Loaded units are cached by a hash of their source text, so loading the
/// same program twice parses it once. The cache holds at most `capacity`
/// units and evicts the least recently used one first; a capacity of zero
/// disables caching.
pub struct SourceLoader {
    capacity: usize,
    cache: Mutex<UnitCache>,
}

#[derive(Default)]
struct UnitCache {
    units: HashMap<blake3::Hash, Arc<Module>>,
    order: VecDeque<blake3::Hash>,
}

impl UnitCache {
    fn touch(&mut self, key: blake3::Hash) {
        if let Some(pos) = self.order.iter().position(|existing| *existing == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key);
    }

    fn get(&mut self, key: blake3::Hash) -> Option<Arc<Module>> {
        let hit = self.units.get(&key).cloned();
        if hit.is_some() {
            self.touch(key);
        }
        hit
    }

    fn put(&mut self, key: blake3::Hash, module: Arc<Module>, capacity: usize) {
        self.units.insert(key, module);
        self.touch(key);
        while self.units.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.units.remove(&oldest);
            tracing::trace!(hash = %oldest, "evicted loaded unit");
        }
    }
}

impl SourceLoader {
    /// Loader caching up to [`DEFAULT_CACHE_CAPACITY`] units
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Loader caching up to `capacity` units
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            cache: Mutex::new(UnitCache::default()),
        }
    }

    /// Maximum number of cached units
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached units
    pub fn cached(&self) -> usize {
        self.cache.lock().units.len()
    }
}

impl Default for SourceLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCompiler for SourceLoader {
    fn compile(&self, source: &str) -> Result<Arc<dyn LoadedUnit>, Vec<Diagnostic>> {
        let key = blake3::hash(source.as_bytes());
        if let Some(module) = self.cache.lock().get(key) {
            tracing::trace!(hash = %key, "loader cache hit");
            return Ok(module);
        }

        let module = Arc::new(load_module(source)?);
        tracing::debug!(hash = %key, factories = module.factories.len(), "loaded unit");
        if self.capacity > 0 {
            self.cache.lock().put(key, module.clone(), self.capacity);
        }
        Ok(module)
    }
}

impl fmt::Debug for SourceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceLoader")
            .field("capacity", &self.capacity)
            .field("cached", &self.cached())
            .finish()
    }
}

fn load_module(source: &str) -> Result<Module, Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    let tokens = tokenize(source, &mut diagnostics);
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        diagnostics,
    };
    let functions = parser.module();
    let mut diagnostics = parser.diagnostics;
    let module = if diagnostics.is_empty() {
        resolve(functions, &mut diagnostics)
    } else {
        None
    };
    match module {
        Some(module) if diagnostics.is_empty() => Ok(module),
        _ => {
            tracing::warn!(count = diagnostics.len(), "rejected generated source");
            Err(diagnostics)
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    line: usize,
    column: usize,
}

impl Pos {
    fn diagnostic(self, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(char),
    PathSep,
    Arrow,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(name) => write!(f, "`{}`", name),
            Tok::Str(text) => write!(f, "string {:?}", text),
            Tok::Num(num) => write!(f, "number {}", num),
            Tok::Punct(ch) => write!(f, "`{}`", ch),
            Tok::PathSep => f.write_str("`::`"),
            Tok::Arrow => f.write_str("`->`"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: Pos,
}

struct Cursor<'s> {
    chars: Peekable<Chars<'s>>,
    line: usize,
    column: usize,
}

impl Cursor<'_> {
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }
}

fn tokenize(source: &str, diagnostics: &mut Vec<Diagnostic>) -> Vec<Token> {
    let mut cursor = Cursor {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();

    while let Some(ch) = cursor.peek() {
        let pos = cursor.pos();
        if ch.is_whitespace() {
            cursor.bump();
            continue;
        }
        let tok = match ch {
            '/' => {
                cursor.bump();
                if cursor.peek() == Some('/') {
                    while cursor.peek().is_some_and(|ch| ch != '\n') {
                        cursor.bump();
                    }
                    continue;
                }
                Tok::Punct('/')
            }
            '"' => {
                cursor.bump();
                match string_body(&mut cursor) {
                    Ok(text) => Tok::Str(text),
                    Err(message) => {
                        diagnostics.push(pos.diagnostic(message));
                        continue;
                    }
                }
            }
            ':' => {
                cursor.bump();
                if cursor.peek() == Some(':') {
                    cursor.bump();
                    Tok::PathSep
                } else {
                    Tok::Punct(':')
                }
            }
            '-' => {
                cursor.bump();
                if cursor.peek() == Some('>') {
                    cursor.bump();
                    Tok::Arrow
                } else {
                    Tok::Punct('-')
                }
            }
            '0'..='9' => {
                let text = number_body(&mut cursor);
                match text.parse::<f64>() {
                    Ok(num) => Tok::Num(num),
                    Err(_) => {
                        diagnostics.push(pos.diagnostic(format!("invalid number `{}`", text)));
                        continue;
                    }
                }
            }
            ch if ch == '_' || ch.is_alphabetic() => {
                let mut ident = String::new();
                while let Some(ch) = cursor.peek().filter(|ch| *ch == '_' || ch.is_alphanumeric()) {
                    ident.push(ch);
                    cursor.bump();
                }
                Tok::Ident(ident)
            }
            '(' | ')' | '[' | ']' | '{' | '}' | '<' | '>' | ',' | ';' | '&' | '!' | '?' | '.'
            | '=' | '*' => {
                cursor.bump();
                Tok::Punct(ch)
            }
            other => {
                cursor.bump();
                diagnostics.push(pos.diagnostic(format!("unexpected character `{}`", other)));
                continue;
            }
        };
        tokens.push(Token { tok, pos });
    }
    tokens
}

fn string_body(cursor: &mut Cursor<'_>) -> Result<String, String> {
    let mut text = String::new();
    loop {
        match cursor.bump() {
            None => return Err("unterminated string literal".to_string()),
            Some('"') => return Ok(text),
            Some('\\') => match cursor.bump() {
                Some('n') => text.push('\n'),
                Some('r') => text.push('\r'),
                Some('t') => text.push('\t'),
                Some('0') => text.push('\0'),
                Some(ch @ ('\\' | '"' | '\'')) => text.push(ch),
                Some('u') => text.push(unicode_escape(cursor)?),
                Some(other) => return Err(format!("unknown character escape `\\{}`", other)),
                None => return Err("unterminated string literal".to_string()),
            },
            Some(ch) => text.push(ch),
        }
    }
}

fn unicode_escape(cursor: &mut Cursor<'_>) -> Result<char, String> {
    if cursor.bump() != Some('{') {
        return Err("expected `{` in unicode escape".to_string());
    }
    let mut digits = String::new();
    loop {
        match cursor.bump() {
            Some('}') => break,
            Some(ch) if ch.is_ascii_hexdigit() => digits.push(ch),
            _ => return Err("invalid unicode escape".to_string()),
        }
    }
    u32::from_str_radix(&digits, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| format!("invalid unicode escape `\\u{{{}}}`", digits))
}

fn number_body(cursor: &mut Cursor<'_>) -> String {
    let mut text = String::new();
    let digits = |cursor: &mut Cursor<'_>, text: &mut String| {
        while let Some(ch) = cursor.peek().filter(char::is_ascii_digit) {
            text.push(ch);
            cursor.bump();
        }
    };
    digits(cursor, &mut text);
    if cursor.peek() == Some('.') {
        text.push('.');
        cursor.bump();
        digits(cursor, &mut text);
    }
    if let Some(exp @ ('e' | 'E')) = cursor.peek() {
        text.push(exp);
        cursor.bump();
        if let Some(sign @ ('+' | '-')) = cursor.peek() {
            text.push(sign);
            cursor.bump();
        }
        digits(cursor, &mut text);
    }
    text
}

// ---------------------------------------------------------------------------
// Syntax

#[derive(Debug, Clone, PartialEq)]
enum HostType {
    F64,
    Bool,
    Str,
    Value,
    Object,
    Vec(Box<HostType>),
    Record(String),
}

impl HostType {
    fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (HostType::Value, _) => true,
            (HostType::F64, Value::Number(_)) => true,
            (HostType::Bool, Value::Bool(_)) => true,
            (HostType::Str, Value::String(_)) => true,
            (HostType::Object, Value::Object(_)) => true,
            (HostType::Record(_), Value::Object(_) | Value::Null) => true,
            (HostType::Vec(element), Value::Array(items)) => {
                items.iter().all(|item| element.admits(item))
            }
            _ => false,
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::F64 => f.write_str("f64"),
            HostType::Bool => f.write_str("bool"),
            HostType::Str => f.write_str("String"),
            HostType::Value => f.write_str("Value"),
            HostType::Object => f.write_str("Object"),
            HostType::Vec(element) => write!(f, "Vec<{}>", element),
            HostType::Record(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone)]
enum HostExpr {
    Const(Value),
    Local { name: String, pos: Pos },
    Array(Vec<HostExpr>),
    ObjectVar { name: String, pos: Pos },
    Invoke {
        location: Location,
        function: String,
        args: Box<HostExpr>,
    },
    Cast {
        ty: HostType,
        location: Location,
        value: Box<HostExpr>,
    },
    Factory {
        name: String,
        args: Vec<(String, Pos)>,
        pos: Pos,
    },
}

#[derive(Debug, Clone)]
enum Stmt {
    CheckCancelled(usize),
    Let { name: String, value: HostExpr },
    NewObject(String),
    Insert {
        object: String,
        key: String,
        value: HostExpr,
        pos: Pos,
    },
}

#[derive(Debug, Clone)]
struct Function {
    name: String,
    params: Vec<String>,
    body: Vec<Stmt>,
    result: HostExpr,
    pos: Pos,
}

type Parsed<T> = Result<T, Diagnostic>;

const PRELUDE_IMPORT: [&str; 4] = ["stepwise", "transpile", "prelude", "*"];

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    diagnostics: Vec<Diagnostic>,
}

impl Parser<'_> {
    fn module(&mut self) -> Vec<Function> {
        let mut functions = Vec::new();
        while self.pos < self.tokens.len() {
            if self.at_ident("use") {
                if let Err(diagnostic) = self.use_item() {
                    self.diagnostics.push(diagnostic);
                    self.recover();
                }
                continue;
            }
            match self.function() {
                Ok(function) => functions.push(function),
                Err(diagnostic) => {
                    self.diagnostics.push(diagnostic);
                    self.recover();
                }
            }
        }
        functions
    }

    /// Skip to the start of the next item
    fn recover(&mut self) {
        self.pos += 1;
        while self.pos < self.tokens.len()
            && !(self.at_ident("fn") || self.at_ident("pub") || self.at_ident("use"))
        {
            self.pos += 1;
        }
    }

    /// Only the prelude glob import is in scope for generated code
    fn use_item(&mut self) -> Parsed<()> {
        let pos = self.here();
        self.keyword("use")?;
        let mut path = vec![self.ident()?];
        while self.at_path_sep() {
            self.pos += 1;
            if self.eat_punct('*') {
                path.push("*".to_string());
                break;
            }
            path.push(self.ident()?);
        }
        self.punct(';')?;
        if path != PRELUDE_IMPORT {
            self.diagnostics
                .push(pos.diagnostic(format!("unresolved import `{}`", path.join("::"))));
        }
        Ok(())
    }

    fn function(&mut self) -> Parsed<Function> {
        if self.at_ident("pub") {
            self.pos += 1;
        }
        let pos = self.here();
        self.keyword("fn")?;
        let name = self.ident()?;
        self.punct('(')?;
        self.keyword("api")?;
        self.punct(':')?;
        self.punct('&')?;
        self.keyword("dyn")?;
        self.keyword("ApiSurface")?;
        let mut params = Vec::new();
        while self.eat_punct(',') {
            if self.at_punct(')') {
                break;
            }
            params.push(self.ident()?);
            self.punct(':')?;
            self.punct('&')?;
            self.host_type()?;
        }
        self.punct(')')?;
        self.expect(Tok::Arrow)?;
        self.keyword("Result")?;
        self.punct('<')?;
        self.keyword("Value")?;
        self.punct(',')?;
        self.keyword("RuntimeError")?;
        self.punct('>')?;
        self.punct('{')?;

        let mut body = Vec::new();
        while !self.at_ident("Ok") {
            body.push(self.statement()?);
        }
        self.keyword("Ok")?;
        self.punct('(')?;
        let result = self.expr()?;
        self.punct(')')?;
        self.punct('}')?;
        Ok(Function {
            name,
            params,
            body,
            result,
            pos,
        })
    }

    fn host_type(&mut self) -> Parsed<HostType> {
        let pos = self.here();
        let name = self.ident()?;
        Ok(match name.as_str() {
            "f64" => HostType::F64,
            "bool" => HostType::Bool,
            "String" => HostType::Str,
            "Value" => HostType::Value,
            "Object" => HostType::Object,
            "Vec" => {
                self.punct('<')?;
                let element = self.host_type()?;
                self.punct('>')?;
                HostType::Vec(Box::new(element))
            }
            _ if name.starts_with(|ch: char| ch.is_ascii_uppercase()) && !self.at_punct('<') => {
                HostType::Record(name)
            }
            _ => return Err(pos.diagnostic(format!("unsupported type `{}`", name))),
        })
    }

    fn statement(&mut self) -> Parsed<Stmt> {
        let pos = self.here();
        if self.eat_ident("check_cancelled") {
            self.punct('(')?;
            self.keyword("api")?;
            self.punct(',')?;
            let step = self.index()?;
            self.punct(')')?;
            self.punct('?')?;
            self.punct(';')?;
            return Ok(Stmt::CheckCancelled(step));
        }
        if self.eat_ident("let") {
            if self.eat_ident("mut") {
                let name = self.ident()?;
                self.punct('=')?;
                self.keyword("Object")?;
                self.expect(Tok::PathSep)?;
                self.keyword("new")?;
                self.punct('(')?;
                self.punct(')')?;
                self.punct(';')?;
                return Ok(Stmt::NewObject(name));
            }
            let name = self.ident()?;
            self.punct(':')?;
            self.host_type()?;
            self.punct('=')?;
            let value = self.expr()?;
            self.punct(';')?;
            return Ok(Stmt::Let { name, value });
        }
        if matches!(self.peek(), Some(Tok::Ident(_))) && self.peek_at(1) == Some(&Tok::Punct('.')) {
            let object = self.ident()?;
            self.punct('.')?;
            self.keyword("insert")?;
            self.punct('(')?;
            let key = self.owned_string()?;
            self.punct(',')?;
            let value = self.expr()?;
            self.punct(')')?;
            self.punct(';')?;
            return Ok(Stmt::Insert {
                object,
                key,
                value,
                pos,
            });
        }
        Err(self.unexpected("a statement"))
    }

    fn expr(&mut self) -> Parsed<HostExpr> {
        let pos = self.here();
        let name = self.ident()?;
        match name.as_str() {
            "Value" => {
                self.expect(Tok::PathSep)?;
                self.value_constructor()
            }
            "vec" => Ok(HostExpr::Array(self.vec_macro()?)),
            "invoke" => {
                self.punct('(')?;
                self.keyword("api")?;
                self.punct(',')?;
                let location = self.location()?;
                self.punct(',')?;
                let function = self.string()?;
                self.punct(',')?;
                let args = self.expr()?;
                self.punct(')')?;
                self.punct('?')?;
                Ok(HostExpr::Invoke {
                    location,
                    function,
                    args: Box::new(args),
                })
            }
            "cast" => {
                self.expect(Tok::PathSep)?;
                self.punct('<')?;
                let ty = self.host_type()?;
                self.punct('>')?;
                self.punct('(')?;
                let location = self.location()?;
                self.punct(',')?;
                let value = self.expr()?;
                self.punct(')')?;
                self.punct('?')?;
                Ok(HostExpr::Cast {
                    ty,
                    location,
                    value: Box::new(value),
                })
            }
            _ if self.eat_punct('.') => {
                self.keyword("clone")?;
                self.punct('(')?;
                self.punct(')')?;
                Ok(HostExpr::Local { name, pos })
            }
            _ if self.eat_punct('(') => {
                self.keyword("api")?;
                let mut args = Vec::new();
                while self.eat_punct(',') {
                    self.punct('&')?;
                    let arg_pos = self.here();
                    args.push((self.ident()?, arg_pos));
                }
                self.punct(')')?;
                self.punct('?')?;
                Ok(HostExpr::Factory { name, args, pos })
            }
            _ => Ok(HostExpr::Local { name, pos }),
        }
    }

    fn value_constructor(&mut self) -> Parsed<HostExpr> {
        let pos = self.here();
        let variant = self.ident()?;
        let expr = match variant.as_str() {
            "Undefined" => return Ok(HostExpr::Const(Value::Undefined)),
            "Null" => return Ok(HostExpr::Const(Value::Null)),
            "Bool" => {
                self.punct('(')?;
                let flag = match self.ident()?.as_str() {
                    "true" => true,
                    "false" => false,
                    _ => return Err(pos.diagnostic("expected `true` or `false`")),
                };
                HostExpr::Const(Value::Bool(flag))
            }
            "Number" => {
                self.punct('(')?;
                HostExpr::Const(Value::Number(self.number()?))
            }
            "String" => {
                self.punct('(')?;
                HostExpr::Const(Value::String(self.owned_string()?))
            }
            "Array" => {
                self.punct('(')?;
                self.keyword("vec")?;
                HostExpr::Array(self.vec_macro()?)
            }
            "Object" => {
                self.punct('(')?;
                let object_pos = self.here();
                HostExpr::ObjectVar {
                    name: self.ident()?,
                    pos: object_pos,
                }
            }
            "from" => {
                self.punct('(')?;
                self.expr()?
            }
            _ => return Err(pos.diagnostic(format!("no variant `Value::{}`", variant))),
        };
        self.punct(')')?;
        Ok(expr)
    }

    /// `![a, b, ...]` following a `vec` identifier
    fn vec_macro(&mut self) -> Parsed<Vec<HostExpr>> {
        self.punct('!')?;
        self.punct('[')?;
        let mut items = Vec::new();
        while !self.eat_punct(']') {
            items.push(self.expr()?);
            if !self.eat_punct(',') {
                self.punct(']')?;
                break;
            }
        }
        Ok(items)
    }

    fn location(&mut self) -> Parsed<Location> {
        self.keyword("loc")?;
        self.punct('(')?;
        let step = self.index()?;
        self.punct(',')?;
        self.punct('&')?;
        self.punct('[')?;
        let mut path = Vec::new();
        while !self.eat_punct(']') {
            let pos = self.here();
            let segment = self.ident()?;
            self.punct('(')?;
            path.push(match segment.as_str() {
                "arg" => PathSegment::Argument(self.index()?),
                "elem" => PathSegment::Element(self.index()?),
                "prop" => PathSegment::Property(self.string()?),
                _ => return Err(pos.diagnostic(format!("unknown path segment `{}`", segment))),
            });
            self.punct(')')?;
            if !self.eat_punct(',') {
                self.punct(']')?;
                break;
            }
        }
        self.punct(')')?;
        Ok(Location { step, path })
    }

    /// `"text".to_string()`
    fn owned_string(&mut self) -> Parsed<String> {
        let text = self.string()?;
        self.punct('.')?;
        self.keyword("to_string")?;
        self.punct('(')?;
        self.punct(')')?;
        Ok(text)
    }

    fn number(&mut self) -> Parsed<f64> {
        let negative = self.eat_punct('-');
        let num = if self.eat_ident("f64") {
            self.expect(Tok::PathSep)?;
            let pos = self.here();
            match self.ident()?.as_str() {
                "NAN" => f64::NAN,
                "INFINITY" => f64::INFINITY,
                "NEG_INFINITY" => f64::NEG_INFINITY,
                other => return Err(pos.diagnostic(format!("unknown constant `f64::{}`", other))),
            }
        } else {
            match self.peek() {
                Some(Tok::Num(num)) => {
                    let num = *num;
                    self.pos += 1;
                    num
                }
                _ => return Err(self.unexpected("a number")),
            }
        };
        Ok(if negative { -num } else { num })
    }

    fn index(&mut self) -> Parsed<usize> {
        let pos = self.here();
        let num = self.number()?;
        if num < 0.0 || num.fract() != 0.0 {
            return Err(pos.diagnostic(format!("expected an index, found {}", num)));
        }
        Ok(num as usize)
    }

    fn string(&mut self) -> Parsed<String> {
        match self.peek() {
            Some(Tok::Str(text)) => {
                let text = text.clone();
                self.pos += 1;
                Ok(text)
            }
            _ => Err(self.unexpected("a string literal")),
        }
    }

    fn ident(&mut self) -> Parsed<String> {
        match self.peek() {
            Some(Tok::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn keyword(&mut self, word: &str) -> Parsed<()> {
        if self.eat_ident(word) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{}`", word)))
        }
    }

    fn punct(&mut self, ch: char) -> Parsed<()> {
        self.expect(Tok::Punct(ch))
    }

    fn expect(&mut self, tok: Tok) -> Parsed<()> {
        if self.peek() == Some(&tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&tok.to_string()))
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        let hit = self.at_ident(word);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn eat_punct(&mut self, ch: char) -> bool {
        let hit = self.at_punct(ch);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn at_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(name)) if name == word)
    }

    fn at_path_sep(&self) -> bool {
        self.peek() == Some(&Tok::PathSep)
    }

    fn at_punct(&self, ch: char) -> bool {
        self.peek() == Some(&Tok::Punct(ch))
    }

    fn peek(&self) -> Option<&Tok> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|token| &token.tok)
    }

    fn here(&self) -> Pos {
        match self.tokens.get(self.pos).or(self.tokens.last()) {
            Some(token) => token.pos,
            None => Pos { line: 1, column: 1 },
        }
    }

    fn unexpected(&self, expected: &str) -> Diagnostic {
        let found = match self.peek() {
            Some(tok) => tok.to_string(),
            None => "end of input".to_string(),
        };
        self.here()
            .diagnostic(format!("expected {}, found {}", expected, found))
    }
}

// ---------------------------------------------------------------------------
// Name resolution

fn resolve(functions: Vec<Function>, diagnostics: &mut Vec<Diagnostic>) -> Option<Module> {
    let mut arity: HashMap<String, usize> = HashMap::new();
    for function in &functions {
        if arity
            .insert(function.name.clone(), function.params.len())
            .is_some()
        {
            diagnostics.push(
                function
                    .pos
                    .diagnostic(format!("function `{}` is defined twice", function.name)),
            );
        }
    }

    for function in &functions {
        let mut scope = Scope {
            arity: &arity,
            locals: function.params.iter().cloned().collect(),
            objects: HashSet::new(),
            diagnostics: &mut *diagnostics,
        };
        for stmt in &function.body {
            match stmt {
                Stmt::CheckCancelled(_) => {}
                Stmt::Let { name, value } => {
                    scope.expr(value);
                    scope.locals.insert(name.clone());
                }
                Stmt::NewObject(name) => {
                    scope.objects.insert(name.clone());
                }
                Stmt::Insert {
                    object, value, pos, ..
                } => {
                    if !scope.objects.contains(object) {
                        scope
                            .diagnostics
                            .push(pos.diagnostic(format!("cannot find object `{}`", object)));
                    }
                    scope.expr(value);
                }
            }
        }
        scope.expr(&function.result);
    }

    let mut factories = HashMap::new();
    let mut entry = None;
    for function in functions {
        if function.name == ENTRY_POINT {
            if !function.params.is_empty() {
                diagnostics.push(
                    function
                        .pos
                        .diagnostic(format!("`{}` must only take `api`", ENTRY_POINT)),
                );
            }
            entry = Some(function);
        } else {
            factories.insert(function.name.clone(), function);
        }
    }
    match entry {
        Some(entry) => Some(Module { entry, factories }),
        None => {
            diagnostics.push(Pos { line: 1, column: 1 }.diagnostic(format!(
                "no `{}` entry point",
                ENTRY_POINT
            )));
            None
        }
    }
}

struct Scope<'a> {
    arity: &'a HashMap<String, usize>,
    locals: HashSet<String>,
    objects: HashSet<String>,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl Scope<'_> {
    fn expr(&mut self, expr: &HostExpr) {
        match expr {
            HostExpr::Const(_) => {}
            HostExpr::Local { name, pos } => self.local(name, *pos),
            HostExpr::Array(items) => items.iter().for_each(|item| self.expr(item)),
            HostExpr::ObjectVar { name, pos } => {
                if !self.objects.contains(name) {
                    self.diagnostics
                        .push(pos.diagnostic(format!("cannot find object `{}`", name)));
                }
            }
            HostExpr::Invoke { args, .. } => self.expr(args),
            HostExpr::Cast { value, .. } => self.expr(value),
            HostExpr::Factory { name, args, pos } => {
                match self.arity.get(name) {
                    None => self
                        .diagnostics
                        .push(pos.diagnostic(format!("cannot find function `{}`", name))),
                    Some(expected) if *expected != args.len() => {
                        self.diagnostics.push(pos.diagnostic(format!(
                            "function `{}` takes {} step argument(s), {} supplied",
                            name,
                            expected,
                            args.len()
                        )))
                    }
                    Some(_) => {}
                }
                for (arg, pos) in args {
                    self.local(arg, *pos);
                }
            }
        }
    }

    fn local(&mut self, name: &str, pos: Pos) {
        if !self.locals.contains(name) {
            self.diagnostics.push(pos.diagnostic(format!(
                "cannot find value `{}` in this scope",
                name
            )));
        }
    }
}

// ---------------------------------------------------------------------------
// Execution

struct Module {
    entry: Function,
    factories: HashMap<String, Function>,
}

impl LoadedUnit for Module {
    fn invoke(&self, api: &dyn ApiSurface) -> Result<Value, RuntimeError> {
        self.run(&self.entry, api, HashMap::new())
    }
}

impl Module {
    fn run(
        &self,
        function: &Function,
        api: &dyn ApiSurface,
        mut locals: HashMap<String, Value>,
    ) -> Result<Value, RuntimeError> {
        let mut objects: HashMap<&str, Object> = HashMap::new();
        for stmt in &function.body {
            match stmt {
                Stmt::CheckCancelled(step) => check_cancelled(api, *step)?,
                Stmt::Let { name, value } => {
                    let value = self.eval(value, api, &locals, &objects)?;
                    locals.insert(name.clone(), value);
                }
                Stmt::NewObject(name) => {
                    objects.insert(name, Object::new());
                }
                Stmt::Insert {
                    object, key, value, ..
                } => {
                    let value = self.eval(value, api, &locals, &objects)?;
                    if let Some(object) = objects.get_mut(object.as_str()) {
                        object.insert(key.clone(), value);
                    }
                }
            }
        }
        self.eval(&function.result, api, &locals, &objects)
    }

    fn eval(
        &self,
        expr: &HostExpr,
        api: &dyn ApiSurface,
        locals: &HashMap<String, Value>,
        objects: &HashMap<&str, Object>,
    ) -> Result<Value, RuntimeError> {
        match expr {
            HostExpr::Const(value) => Ok(value.clone()),
            HostExpr::Local { name, .. } => Ok(locals.get(name).cloned().unwrap_or_default()),
            HostExpr::Array(items) => items
                .iter()
                .map(|item| self.eval(item, api, locals, objects))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            HostExpr::ObjectVar { name, .. } => Ok(objects
                .get(name.as_str())
                .cloned()
                .map(Value::Object)
                .unwrap_or_default()),
            HostExpr::Invoke {
                location,
                function,
                args,
            } => {
                let args = match self.eval(args, api, locals, objects)? {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                invoke(api, location.clone(), function, args)
            }
            HostExpr::Cast {
                ty,
                location,
                value,
            } => {
                let value = self.eval(value, api, locals, objects)?;
                if ty.admits(&value) {
                    Ok(value)
                } else {
                    Err(RuntimeError::Cast {
                        location: location.clone(),
                        expected: ty.to_string(),
                        found: value.kind().to_string(),
                    })
                }
            }
            HostExpr::Factory { name, args, .. } => {
                let Some(factory) = self.factories.get(name) else {
                    return Ok(Value::Undefined);
                };
                let bound = factory
                    .params
                    .iter()
                    .zip(args)
                    .map(|(param, (arg, _))| {
                        (param.clone(), locals.get(arg).cloned().unwrap_or_default())
                    })
                    .collect();
                self.run(factory, api, bound)
            }
        }
    }
}
