//! Lua tokenizer used by static analysis.
//!
//! Produces names, keywords, string and number literals and symbols with
//! 1-based positions. Comments and whitespace are dropped. The lexer never
//! evaluates anything and runs in time linear in the input.

use std::fmt;

const KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

const SYMBOLS: &[&str] = &[
    "...", "..", "==", "~=", "<=", ">=", "//", "::", "<<", ">>", "+", "-", "*", "/", "%", "^", "#",
    "&", "~", "|", "<", ">", "=", "(", ")", "{", "}", "[", "]", ";", ":", ",", ".",
];

/// Whether a word is a reserved Lua keyword.
pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Keyword,
    /// String literal; `text` holds the raw content between delimiters.
    Str,
    Number,
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
    /// Long-bracket string: `text` is the literal value, no escapes.
    pub long: bool,
}

impl Token {
    pub fn is_name(&self) -> bool {
        self.kind == TokenKind::Name
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text == word
    }

    pub fn is_symbol(&self, symbol: &str) -> bool {
        self.kind == TokenKind::Symbol && self.text == symbol
    }

    /// Value of a string literal with escapes decoded.
    pub fn string_value(&self) -> Option<String> {
        match (self.kind, self.long) {
            (TokenKind::Str, true) => Some(self.text.clone()),
            (TokenKind::Str, false) => Some(unescape(&self.text)),
            _ => None,
        }
    }
}

/// Decode the escape sequences of a short string's raw content. Invalid
/// sequences are kept as written; Lua rejects them at compile time anyway.
pub fn unescape(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out: Vec<u8> = Vec::with_capacity(raw.len());
    let mut buf = [0u8; 4];
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '\\' || i >= chars.len() {
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let e = chars[i];
        i += 1;
        let simple = match e {
            'a' => Some(0x07),
            'b' => Some(0x08),
            'f' => Some(0x0c),
            'n' | '\n' => Some(b'\n'),
            'r' => Some(b'\r'),
            't' => Some(b'\t'),
            'v' => Some(0x0b),
            '\\' | '"' | '\'' => Some(e as u8),
            _ => None,
        };
        if let Some(byte) = simple {
            out.push(byte);
            continue;
        }
        match e {
            'z' => {
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
            }
            'x' if i + 2 <= chars.len() => {
                let hex: String = chars[i..i + 2].iter().collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    Err(_) => out.extend_from_slice(b"\\x"),
                }
            }
            'u' if chars.get(i) == Some(&'{') => {
                let close = chars[i..].iter().position(|&c| c == '}').map(|p| i + p);
                let decoded = close.and_then(|close| {
                    let hex: String = chars[i + 1..close].iter().collect();
                    u32::from_str_radix(&hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .map(|ch| (ch, close))
                });
                match decoded {
                    Some((ch, close)) => {
                        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                        i = close + 1;
                    }
                    None => out.extend_from_slice(b"\\u"),
                }
            }
            d if d.is_ascii_digit() => {
                let mut value = u32::from(d as u8 - b'0');
                let mut digits = 1;
                while digits < 3 && i < chars.len() && chars[i].is_ascii_digit() {
                    value = value * 10 + u32::from(chars[i] as u8 - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push(u8::try_from(value).unwrap_or(u8::MAX));
            }
            other => {
                out.push(b'\\');
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for LexError {}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>, line: u32, column: u32) -> LexError {
        LexError {
            message: message.into(),
            line,
            column,
        }
    }

    /// Level of a long bracket opening at the cursor (`[[` is 0, `[==[` is
    /// 2), without consuming it.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek(0) != Some('[') {
            return None;
        }
        let mut level = 0;
        while self.peek(1 + level) == Some('=') {
            level += 1;
        }
        (self.peek(1 + level) == Some('[')).then_some(level)
    }

    fn long_bracket(&mut self, level: usize, line: u32, column: u32) -> Result<String, LexError> {
        for _ in 0..level + 2 {
            self.bump();
        }
        let mut content = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated long bracket", line, column)),
                Some(']') => {
                    let mut eq = 0;
                    while self.peek(eq) == Some('=') {
                        eq += 1;
                    }
                    if eq == level && self.peek(eq) == Some(']') {
                        for _ in 0..=eq {
                            self.bump();
                        }
                        return Ok(content);
                    }
                    content.push(']');
                }
                Some(c) => content.push(c),
            }
        }
    }

    fn short_string(&mut self, quote: char, line: u32, column: u32) -> Result<String, LexError> {
        self.bump();
        let mut content = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string", line, column)),
                Some('\\') => match self.bump() {
                    None => return Err(self.error("unterminated string", line, column)),
                    Some(c) => {
                        content.push('\\');
                        content.push(c);
                        if c == 'z' {
                            // `\z` skips the following whitespace, newlines included.
                            while let Some(ws) = self.peek(0).filter(|ws| ws.is_whitespace()) {
                                content.push(ws);
                                self.bump();
                            }
                        }
                    }
                },
                Some(c) if c == quote => return Ok(content),
                Some(c) => content.push(c),
            }
        }
    }

    fn number(&mut self) -> String {
        let mut text = String::new();
        let hex = self.peek(0) == Some('0') && matches!(self.peek(1), Some('x' | 'X'));
        while let Some(c) = self.peek(0) {
            let exponent = if hex {
                matches!(c, 'p' | 'P')
            } else {
                matches!(c, 'e' | 'E')
            };
            if exponent && matches!(self.peek(1), Some('+' | '-')) {
                text.push(c);
                self.bump();
                if let Some(sign) = self.bump() {
                    text.push(sign);
                }
            } else if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        if self.peek(0) == Some('#') {
            while let Some(c) = self.peek(0) {
                if c == '\n' {
                    break;
                }
                self.bump();
            }
        }

        while let Some(c) = self.peek(0) {
            let (line, column) = (self.line, self.column);

            if c.is_whitespace() {
                self.bump();
                continue;
            }

            if c == '-' && self.peek(1) == Some('-') {
                self.bump();
                self.bump();
                if let Some(level) = self.long_bracket_level() {
                    self.long_bracket(level, line, column)
                        .map_err(|_| self.error("unterminated comment", line, column))?;
                } else {
                    while let Some(c) = self.peek(0) {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                continue;
            }

            let long = self.long_bracket_level().is_some();
            let (kind, text) = if c.is_alphabetic() || c == '_' {
                let mut word = String::new();
                while let Some(c) = self.peek(0) {
                    if c.is_alphanumeric() || c == '_' {
                        word.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                let kind = if is_keyword(&word) {
                    TokenKind::Keyword
                } else {
                    TokenKind::Name
                };
                (kind, word)
            } else if c.is_ascii_digit()
                || (c == '.' && self.peek(1).is_some_and(|d| d.is_ascii_digit()))
            {
                (TokenKind::Number, self.number())
            } else if c == '"' || c == '\'' {
                (TokenKind::Str, self.short_string(c, line, column)?)
            } else if let Some(level) = self.long_bracket_level() {
                (TokenKind::Str, self.long_bracket(level, line, column)?)
            } else {
                let symbol = SYMBOLS.iter().find(|s| {
                    s.chars()
                        .enumerate()
                        .all(|(i, sc)| self.peek(i) == Some(sc))
                });
                match symbol {
                    Some(s) => {
                        for _ in 0..s.len() {
                            self.bump();
                        }
                        (TokenKind::Symbol, s.to_string())
                    }
                    None => {
                        return Err(self.error(format!("unexpected character {:?}", c), line, column))
                    }
                }
            };

            tokens.push(Token {
                kind,
                text,
                line,
                column,
                long: long && kind == TokenKind::Str,
            });
        }

        Ok(tokens)
    }
}

/// Tokenize Lua source.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        column: 1,
    }
    .run()
}
