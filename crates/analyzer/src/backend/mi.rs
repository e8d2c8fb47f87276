#![forbid(unsafe_code)]

//! Parser for GDB/MI output records.
//!
//! Only the record layer is modelled: one line in, one [`Record`] out. The
//! grammar is the one documented in the "GDB/MI Output Syntax" section of
//! the GDB manual.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Const(String),
    Tuple(Results),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Const(s) => Some(s),
            _ => None,
        }
    }
}

/// Ordered `name=value` pairs. Names may repeat inside lists of results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Results(pub Vec<(String, Value)>);

impl Results {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    Exec,
    Status,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Results,
    },
    Async {
        token: Option<u64>,
        kind: AsyncKind,
        class: String,
        results: Results,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed MI record at byte {at}: {reason}")]
pub struct ParseError {
    pub at: usize,
    pub reason: &'static str,
}

/// Parse a single line of MI output, without its trailing newline.
pub fn parse_record(line: &str) -> Result<Record, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim_end() == "(gdb)" {
        return Ok(Record::Prompt);
    }
    let mut parser = Parser {
        input: line.as_bytes(),
        pos: 0,
    };
    let record = parser.record()?;
    if parser.pos != parser.input.len() {
        return Err(parser.error("trailing bytes"));
    }
    Ok(record)
}

/// Quote `text` as an MI c-string, suitable as a command argument.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                out.push_str(&format!("\\{:03o}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &'static str) -> ParseError {
        ParseError {
            at: self.pos,
            reason,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn expect(&mut self, byte: u8, reason: &'static str) -> Result<(), ParseError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(reason))
        }
    }

    fn record(&mut self) -> Result<Record, ParseError> {
        let token = self.token()?;
        let sigil = self.bump().ok_or_else(|| self.error("empty record"))?;
        match sigil {
            b'^' => {
                let class = match self.word().to_owned().as_str() {
                    "done" => ResultClass::Done,
                    "running" => ResultClass::Running,
                    "connected" => ResultClass::Connected,
                    "error" => ResultClass::Error,
                    "exit" => ResultClass::Exit,
                    _ => return Err(self.error("unknown result class")),
                };
                let results = self.trailing_results()?;
                Ok(Record::Result {
                    token,
                    class,
                    results,
                })
            }
            b'*' | b'+' | b'=' => {
                let kind = match sigil {
                    b'*' => AsyncKind::Exec,
                    b'+' => AsyncKind::Status,
                    _ => AsyncKind::Notify,
                };
                let class = self.word().to_owned();
                if class.is_empty() {
                    return Err(self.error("missing async class"));
                }
                let results = self.trailing_results()?;
                Ok(Record::Async {
                    token,
                    kind,
                    class,
                    results,
                })
            }
            b'~' | b'@' | b'&' if token.is_none() => {
                let kind = match sigil {
                    b'~' => StreamKind::Console,
                    b'@' => StreamKind::Target,
                    _ => StreamKind::Log,
                };
                let text = self.c_string()?;
                Ok(Record::Stream { kind, text })
            }
            _ => {
                self.pos -= 1;
                Err(self.error("unknown record type"))
            }
        }
    }

    fn token(&mut self) -> Result<Option<u64>, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .map(Some)
            .ok_or_else(|| self.error("token out of range"))
    }

    fn word(&mut self) -> &str {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            self.pos += 1;
        }
        // Only ASCII was consumed.
        std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default()
    }

    fn trailing_results(&mut self) -> Result<Results, ParseError> {
        let mut results = Vec::new();
        while self.peek() == Some(b',') {
            self.pos += 1;
            results.push(self.result()?);
        }
        Ok(Results(results))
    }

    fn result(&mut self) -> Result<(String, Value), ParseError> {
        let name = self.word().to_owned();
        if name.is_empty() {
            return Err(self.error("missing variable name"));
        }
        self.expect(b'=', "expected '='")?;
        Ok((name, self.value()?))
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some(b'"') => Ok(Value::Const(self.c_string()?)),
            Some(b'{') => {
                self.pos += 1;
                let mut results = Vec::new();
                if self.peek() != Some(b'}') {
                    loop {
                        results.push(self.result()?);
                        if self.peek() == Some(b',') {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(b'}', "unterminated tuple")?;
                Ok(Value::Tuple(Results(results)))
            }
            Some(b'[') => {
                self.pos += 1;
                let mut items = Vec::new();
                if self.peek() != Some(b']') {
                    loop {
                        let item = if self.peek().is_some_and(|b| b.is_ascii_alphabetic()) {
                            let (name, value) = self.result()?;
                            Value::Tuple(Results(vec![(name, value)]))
                        } else {
                            self.value()?
                        };
                        items.push(item);
                        if self.peek() == Some(b',') {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(b']', "unterminated list")?;
                Ok(Value::List(items))
            }
            _ => Err(self.error("expected a value")),
        }
    }

    fn c_string(&mut self) -> Result<String, ParseError> {
        self.expect(b'"', "expected '\"'")?;
        let mut bytes = Vec::new();
        loop {
            let byte = self.bump().ok_or_else(|| self.error("unterminated string"))?;
            match byte {
                b'"' => break,
                b'\\' => {
                    let escaped = self.bump().ok_or_else(|| self.error("dangling escape"))?;
                    match escaped {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'a' => bytes.push(0x07),
                        b'b' => bytes.push(0x08),
                        b'f' => bytes.push(0x0c),
                        b'v' => bytes.push(0x0b),
                        b'e' => bytes.push(0x1b),
                        b'0'..=b'7' => {
                            let mut code = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'7') => {
                                        code = code * 8 + u32::from(d - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            bytes.push((code & 0xff) as u8);
                        }
                        other => bytes.push(other),
                    }
                }
                other => bytes.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Display for ResultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultClass::Done => "done",
            ResultClass::Running => "running",
            ResultClass::Connected => "connected",
            ResultClass::Error => "error",
            ResultClass::Exit => "exit",
        };
        f.write_str(name)
    }
}
