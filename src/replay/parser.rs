//! GDB/MI output parser
//!
//! Turns one line of debugger output into at most one [`ResponseRecord`].
//! The parser holds no state between lines, so a malformed line can never
//! affect how the next one is read.

use crate::replay::types::*;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{trace, warn};

/// `[token]<marker><class>[,<results>]` for result and async records
static RECORD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d*)([\^*+=])([A-Za-z_][A-Za-z0-9_-]*)(?:,(.*))?$")
        .expect("record pattern is a valid regex")
});

/// `~"..."`, `@"..."`, `&"..."`
static STREAM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^([~@&])(".*)$"#).expect("stream pattern is a valid regex")
});

/// `(gdb)` or `(rr)` prompt, trailing blanks allowed
static PROMPT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\((?:gdb|rr)\)\s*$").expect("prompt pattern is a valid regex")
});

/// Nesting beyond this is rejected instead of risking the reader's stack
const MAX_DEPTH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MiParseError {
    #[error("line matches no known record marker")]
    UnknownMarker,
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),
    #[error("expected {expected} at offset {at}, found {found:?}")]
    Unexpected {
        expected: &'static str,
        found: char,
        at: usize,
    },
    #[error("trailing input at offset {0}")]
    TrailingInput(usize),
    #[error("nesting deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

/// GDB/MI line parser
#[derive(Debug, Clone, Copy, Default)]
pub struct MiParser;

impl MiParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a line, logging and dropping anything malformed
    pub fn feed(&self, line: &str) -> Option<ResponseRecord> {
        match self.parse_line(line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Dropping unparseable debugger output ({}): {:?}", e, line);
                None
            }
        }
    }

    /// Parse a single line of GDB/MI output. Blank lines yield `Ok(None)`.
    pub fn parse_line(&self, line: &str) -> Result<Option<ResponseRecord>, MiParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }

        if PROMPT_PATTERN.is_match(line) {
            return Ok(Some(ResponseRecord::Prompt));
        }

        if let Some(caps) = RECORD_PATTERN.captures(line) {
            let token = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
            let marker = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let class = caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default();
            let payload = match caps.get(4) {
                Some(m) => {
                    let mut cursor = Cursor::new(m.as_str());
                    let results = cursor.results_until_end()?;
                    MiTuple(results)
                }
                None => MiTuple::new(),
            };
            let record = match marker {
                "^" => ResponseRecord::Result { token, class, payload },
                "*" => ResponseRecord::ExecAsync { token, class, payload },
                "+" => ResponseRecord::StatusAsync { token, class, payload },
                _ => ResponseRecord::NotifyAsync { token, class, payload },
            };
            trace!("Parsed {} record", record.kind());
            return Ok(Some(record));
        }

        if let Some(caps) = STREAM_PATTERN.captures(line) {
            let marker = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let mut cursor = Cursor::new(body);
            let text = cursor.c_string()?;
            cursor.expect_end()?;
            let record = match marker {
                "~" => ResponseRecord::Console { text },
                "@" => ResponseRecord::Target { text },
                _ => ResponseRecord::Log { text },
            };
            return Ok(Some(record));
        }

        Err(MiParseError::UnknownMarker)
    }
}

/// Parse a standalone value such as `{a="1",b=["x"]}`
#[cfg(test)]
pub fn parse_value(input: &str) -> Result<MiValue, MiParseError> {
    let mut cursor = Cursor::new(input);
    let value = cursor.value(0)?;
    cursor.expect_end()?;
    Ok(value)
}

/// Recursive descent over the MI value grammar
struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char, what: &'static str) -> Result<(), MiParseError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(found) => Err(MiParseError::Unexpected {
                expected: what,
                found,
                at: self.pos - found.len_utf8(),
            }),
            None => Err(MiParseError::UnexpectedEnd(self.pos)),
        }
    }

    fn expect_end(&self) -> Result<(), MiParseError> {
        if self.pos == self.input.len() {
            Ok(())
        } else {
            Err(MiParseError::TrailingInput(self.pos))
        }
    }

    /// `result ("," result)*` consuming the whole input
    fn results_until_end(&mut self) -> Result<Vec<MiResult>, MiParseError> {
        let mut results = vec![self.result(0)?];
        while self.peek() == Some(',') {
            self.bump();
            results.push(self.result(0)?);
        }
        self.expect_end()?;
        Ok(results)
    }

    fn result(&mut self, depth: usize) -> Result<MiResult, MiParseError> {
        let variable = self.variable()?;
        self.eat('=', "'='")?;
        let value = self.value(depth)?;
        Ok(MiResult { variable, value })
    }

    fn variable(&mut self) -> Result<String, MiParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                self.bump();
            } else {
                break;
            }
        }
        if self.pos == start {
            return match self.peek() {
                Some(found) => Err(MiParseError::Unexpected {
                    expected: "variable name",
                    found,
                    at: self.pos,
                }),
                None => Err(MiParseError::UnexpectedEnd(self.pos)),
            };
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn value(&mut self, depth: usize) -> Result<MiValue, MiParseError> {
        if depth > MAX_DEPTH {
            return Err(MiParseError::TooDeep);
        }
        match self.peek() {
            Some('"') => Ok(MiValue::Const(self.c_string()?)),
            Some('{') => self.tuple(depth + 1),
            Some('[') => self.list(depth + 1),
            Some(found) => Err(MiParseError::Unexpected {
                expected: "value",
                found,
                at: self.pos,
            }),
            None => Err(MiParseError::UnexpectedEnd(self.pos)),
        }
    }

    fn tuple(&mut self, depth: usize) -> Result<MiValue, MiParseError> {
        self.eat('{', "'{'")?;
        let mut tuple = MiTuple::new();
        if self.peek() == Some('}') {
            self.bump();
            return Ok(MiValue::Tuple(tuple));
        }
        loop {
            tuple.push(self.result(depth)?);
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(MiValue::Tuple(tuple)),
                Some(found) => {
                    return Err(MiParseError::Unexpected {
                        expected: "',' or '}'",
                        found,
                        at: self.pos - found.len_utf8(),
                    })
                }
                None => return Err(MiParseError::UnexpectedEnd(self.pos)),
            }
        }
    }

    fn list(&mut self, depth: usize) -> Result<MiValue, MiParseError> {
        self.eat('[', "'['")?;
        if self.peek() == Some(']') {
            self.bump();
            return Ok(MiValue::List(Vec::new()));
        }

        // A list holds either bare values or variable=value results, never both
        let holds_values = matches!(self.peek(), Some('"' | '{' | '['));
        let mut values = Vec::new();
        let mut results = Vec::new();
        loop {
            if holds_values {
                values.push(self.value(depth)?);
            } else {
                results.push(self.result(depth)?);
            }
            match self.bump() {
                Some(',') => continue,
                Some(']') => break,
                Some(found) => {
                    return Err(MiParseError::Unexpected {
                        expected: "',' or ']'",
                        found,
                        at: self.pos - found.len_utf8(),
                    })
                }
                None => return Err(MiParseError::UnexpectedEnd(self.pos)),
            }
        }

        if holds_values {
            Ok(MiValue::List(values))
        } else {
            Ok(MiValue::ResultList(results))
        }
    }

    /// Quoted C string. Octal escapes are raw bytes, so multibyte UTF-8
    /// arrives split across several of them.
    fn c_string(&mut self) -> Result<String, MiParseError> {
        self.eat('"', "'\"'")?;
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            let c = self.bump().ok_or(MiParseError::UnexpectedEnd(self.pos))?;
            match c {
                '"' => break,
                '\\' => {
                    let escaped = self.bump().ok_or(MiParseError::UnexpectedEnd(self.pos))?;
                    match escaped {
                        'n' => bytes.push(b'\n'),
                        't' => bytes.push(b'\t'),
                        'r' => bytes.push(b'\r'),
                        'e' => bytes.push(0x1b),
                        'a' => bytes.push(0x07),
                        'b' => bytes.push(0x08),
                        'f' => bytes.push(0x0c),
                        'v' => bytes.push(0x0b),
                        '0'..='7' => {
                            let mut code = escaped.to_digit(8).unwrap_or(0);
                            for _ in 0..2 {
                                match self.peek().and_then(|d| d.to_digit(8)) {
                                    Some(d) => {
                                        code = code * 8 + d;
                                        self.bump();
                                    }
                                    None => break,
                                }
                            }
                            bytes.push((code & 0xff) as u8);
                        }
                        other => {
                            let mut buf = [0u8; 4];
                            bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                        }
                    }
                }
                other => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
