//! Lexer and parser for architecture descriptions.
//!
//! The canonical form chains `Block(kind, {key: value, ...})` entries with `->`, as in
//!
//! ```text
//! Block(conv, {'out_channels': 32, 'kernel_size': 3}) -> Block(relu, {})
//! ```
//!
//! A compact form, `conv(out_channels=32, kernel_size=3) -> relu`, is accepted as well.
//! `#` starts a comment which runs to the end of the line.

use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// One operator invocation as written in a description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: String,
    pub params: IndexMap<String, ParamValue>,
}

/// An ordered chain of [Block]s. Order is execution order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub blocks: Vec<Block>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}, column {column}: expected {expected}, found {found}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub found: String,
    pub expected: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Lexeme {
    Word(String),
    Int(i64),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Equals,
    Arrow,
    Eof,
}

#[derive(Debug)]
struct Token {
    lexeme: Lexeme,
    offset: usize,
}

struct Lexer<'src> {
    text: &'src str,
    source: &'src [u8],
    pos: usize,
}

struct Parser<'src> {
    text: &'src str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Block {
    pub fn new(kind: impl Into<String>) -> Self {
        Block {
            kind: kind.into(),
            params: IndexMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl Architecture {
    pub fn new(blocks: Vec<Block>) -> Self {
        Architecture { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "integer",
            ParamValue::Str(_) => "string",
            ParamValue::Bool(_) => "boolean",
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_owned())
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Str(s) => write!(f, "'{s}'"),
            ParamValue::Bool(true) => write!(f, "True"),
            ParamValue::Bool(false) => write!(f, "False"),
        }
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({}, {{{}}})",
            self.kind,
            self.params
                .iter()
                .map(|(k, v)| format!("'{k}': {v}"))
                .join(", ")
        )
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.blocks.iter().join(" -> "))
    }
}

impl FromStr for Architecture {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse an architecture description.
pub fn parse(text: &str) -> Result<Architecture, SyntaxError> {
    let tokens = Lexer::new(text).tokenize()?;
    Parser {
        text,
        tokens,
        pos: 0,
    }
    .architecture()
}

impl Display for Lexeme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lexeme::Word(w) => write!(f, "`{w}`"),
            Lexeme::Int(v) => write!(f, "`{v}`"),
            Lexeme::Str(s) => write!(f, "'{s}'"),
            Lexeme::LParen => write!(f, "`(`"),
            Lexeme::RParen => write!(f, "`)`"),
            Lexeme::LBrace => write!(f, "`{{`"),
            Lexeme::RBrace => write!(f, "`}}`"),
            Lexeme::Comma => write!(f, "`,`"),
            Lexeme::Colon => write!(f, "`:`"),
            Lexeme::Equals => write!(f, "`=`"),
            Lexeme::Arrow => write!(f, "`->`"),
            Lexeme::Eof => write!(f, "end of input"),
        }
    }
}

/// Translate a byte offset into a 1-based (line, column) pair.
fn line_column(text: &str, offset: usize) -> (usize, usize) {
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map_or(before.chars().count(), |nl| before[nl + 1..].chars().count())
        + 1;
    (line, column)
}

fn syntax_error(text: &str, offset: usize, found: String, expected: &str) -> SyntaxError {
    let (line, column) = line_column(text, offset);
    SyntaxError {
        line,
        column,
        found,
        expected: expected.to_owned(),
    }
}

fn is_word_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_'
}

impl<'src> Lexer<'src> {
    fn new(text: &'src str) -> Self {
        Lexer {
            text,
            source: text.as_bytes(),
            pos: 0,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.lexeme == Lexeme::Eof;
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, SyntaxError> {
        self.skip_whitespace_and_comments();
        let offset = self.pos;
        let Some(&ch) = self.source.get(self.pos) else {
            return Ok(Token {
                lexeme: Lexeme::Eof,
                offset,
            });
        };

        let lexeme = match ch {
            b'(' => self.single(Lexeme::LParen),
            b')' => self.single(Lexeme::RParen),
            b'{' => self.single(Lexeme::LBrace),
            b'}' => self.single(Lexeme::RBrace),
            b',' => self.single(Lexeme::Comma),
            b':' => self.single(Lexeme::Colon),
            b'=' => self.single(Lexeme::Equals),
            b'\'' | b'"' => self.scan_string(ch)?,
            b'-' if self.source.get(self.pos + 1) == Some(&b'>') => {
                self.pos += 2;
                Lexeme::Arrow
            }
            b'-' if self
                .source
                .get(self.pos + 1)
                .is_some_and(|c| c.is_ascii_digit()) =>
            {
                self.pos += 1;
                match self.scan_word() {
                    Lexeme::Int(v) => Lexeme::Int(-v),
                    _ => return Err(self.error_at(offset, "an integer")),
                }
            }
            c if is_word_char(c) => self.scan_word(),
            _ => return Err(self.error_at(offset, "a token")),
        };
        Ok(Token { lexeme, offset })
    }

    fn single(&mut self, lexeme: Lexeme) -> Lexeme {
        self.pos += 1;
        lexeme
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(&ch) = self.source.get(self.pos) {
            if ch.is_ascii_whitespace() {
                self.pos += 1;
            } else if ch == b'#' {
                while self.pos < self.source.len() && self.source[self.pos] != b'\n' {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    /// Scans identifiers and integers. Identifiers may start with a digit (`5x5_conv`).
    fn scan_word(&mut self) -> Lexeme {
        let start = self.pos;
        while self.pos < self.source.len() && is_word_char(self.source[self.pos]) {
            self.pos += 1;
        }
        let word = &self.text[start..self.pos];
        match word.parse::<i64>() {
            Ok(v) if word.bytes().all(|b| b.is_ascii_digit()) => Lexeme::Int(v),
            _ => Lexeme::Word(word.to_owned()),
        }
    }

    fn scan_string(&mut self, quote: u8) -> Result<Lexeme, SyntaxError> {
        let start = self.pos;
        self.pos += 1;
        while self.pos < self.source.len() && self.source[self.pos] != quote {
            if self.source[self.pos] == b'\n' {
                break;
            }
            self.pos += 1;
        }
        if self.source.get(self.pos) != Some(&quote) {
            return Err(syntax_error(
                self.text,
                start,
                "an unterminated string".to_owned(),
                "a closing quote",
            ));
        }
        let body = self.text[start + 1..self.pos].to_owned();
        self.pos += 1;
        Ok(Lexeme::Str(body))
    }

    fn error_at(&self, offset: usize, expected: &str) -> SyntaxError {
        let found = self.text[offset..]
            .chars()
            .next()
            .map_or_else(|| "end of input".to_owned(), |c| format!("`{c}`"));
        syntax_error(self.text, offset, found, expected)
    }
}

impl Parser<'_> {
    fn architecture(mut self) -> Result<Architecture, SyntaxError> {
        let mut blocks = vec![];
        if self.peek() == &Lexeme::Eof {
            return Ok(Architecture::new(blocks));
        }
        blocks.push(self.block()?);
        while self.peek() == &Lexeme::Arrow {
            self.advance();
            blocks.push(self.block()?);
        }
        self.expect(&Lexeme::Eof, "`->` or end of input")?;
        Ok(Architecture::new(blocks))
    }

    fn block(&mut self) -> Result<Block, SyntaxError> {
        match self.peek().clone() {
            Lexeme::Word(w) if w == "Block" => {
                self.advance();
                self.expect(&Lexeme::LParen, "`(`")?;
                let kind = self.name("an operator kind")?;
                let mut block = Block::new(kind);
                if self.peek() == &Lexeme::Comma {
                    self.advance();
                    self.mapping(&mut block)?;
                }
                self.expect(&Lexeme::RParen, "`)`")?;
                Ok(block)
            }
            Lexeme::Word(_) | Lexeme::Str(_) => {
                let mut block = Block::new(self.name("an operator kind")?);
                if self.peek() == &Lexeme::LParen {
                    self.advance();
                    self.keyword_args(&mut block)?;
                }
                Ok(block)
            }
            _ => Err(self.error("a block")),
        }
    }

    fn mapping(&mut self, block: &mut Block) -> Result<(), SyntaxError> {
        self.expect(&Lexeme::LBrace, "`{`")?;
        while self.peek() != &Lexeme::RBrace {
            let offset = self.tokens[self.pos].offset;
            let key = self.name("a parameter name")?;
            self.expect(&Lexeme::Colon, "`:`")?;
            let value = self.value()?;
            self.insert_param(block, offset, key, value)?;
            if self.peek() == &Lexeme::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Lexeme::RBrace, "`,` or `}`")
    }

    fn keyword_args(&mut self, block: &mut Block) -> Result<(), SyntaxError> {
        while self.peek() != &Lexeme::RParen {
            let offset = self.tokens[self.pos].offset;
            let key = self.name("a parameter name")?;
            self.expect(&Lexeme::Equals, "`=`")?;
            let value = self.value()?;
            self.insert_param(block, offset, key, value)?;
            if self.peek() == &Lexeme::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Lexeme::RParen, "`,` or `)`")
    }

    /// Add a parameter to `block`, rejecting a key written twice. `offset` locates the key.
    fn insert_param(
        &self,
        block: &mut Block,
        offset: usize,
        key: String,
        value: ParamValue,
    ) -> Result<(), SyntaxError> {
        if block.params.contains_key(&key) {
            let found = format!("a second `{key}`");
            return Err(syntax_error(self.text, offset, found, "each parameter at most once"));
        }
        block.params.insert(key, value);
        Ok(())
    }

    fn name(&mut self, expected: &str) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Lexeme::Word(w) => {
                self.advance();
                Ok(w)
            }
            Lexeme::Str(s) => {
                self.advance();
                Ok(s)
            }
            _ => Err(self.error(expected)),
        }
    }

    fn value(&mut self) -> Result<ParamValue, SyntaxError> {
        let value = match self.peek().clone() {
            Lexeme::Int(v) => ParamValue::Int(v),
            Lexeme::Str(s) => ParamValue::Str(s),
            Lexeme::Word(w) if w == "True" || w == "true" => ParamValue::Bool(true),
            Lexeme::Word(w) if w == "False" || w == "false" => ParamValue::Bool(false),
            Lexeme::Word(w) => ParamValue::Str(w),
            _ => return Err(self.error("a parameter value")),
        };
        self.advance();
        Ok(value)
    }

    fn peek(&self) -> &Lexeme {
        &self.tokens[self.pos].lexeme
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, lexeme: &Lexeme, expected: &str) -> Result<(), SyntaxError> {
        if self.peek() != lexeme {
            return Err(self.error(expected));
        }
        self.advance();
        Ok(())
    }

    fn error(&self, expected: &str) -> SyntaxError {
        let token = &self.tokens[self.pos];
        syntax_error(self.text, token.offset, token.lexeme.to_string(), expected)
    }
}
