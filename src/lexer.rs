//! Lua tokenizer

use crate::{ProtectError, ProtectResult};
use std::fmt;

/// A token with the line it starts on
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    And,
    Break,
    Do,
    Else,
    ElseIf,
    End,
    False,
    For,
    Function,
    Goto,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    // Literals
    Integer(i64),
    Float(f64),
    String(Vec<u8>),
    Name(String),

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Caret,
    Hash,
    Ampersand,
    Tilde,
    Pipe,
    ShiftLeft,
    ShiftRight,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equal,
    NotEqual,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    DoubleColon,
    Semi,
    Colon,
    Comma,
    Dot,
    DotDot,
    DotDotDot,

    Eof,
}

impl Token {
    fn keyword(s: &str) -> Option<Token> {
        let token = match s {
            "and" => Token::And,
            "break" => Token::Break,
            "do" => Token::Do,
            "else" => Token::Else,
            "elseif" => Token::ElseIf,
            "end" => Token::End,
            "false" => Token::False,
            "for" => Token::For,
            "function" => Token::Function,
            "goto" => Token::Goto,
            "if" => Token::If,
            "in" => Token::In,
            "local" => Token::Local,
            "nil" => Token::Nil,
            "not" => Token::Not,
            "or" => Token::Or,
            "repeat" => Token::Repeat,
            "return" => Token::Return,
            "then" => Token::Then,
            "true" => Token::True,
            "until" => Token::Until,
            "while" => Token::While,
            _ => return None,
        };
        Some(token)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::And => "and",
            Token::Break => "break",
            Token::Do => "do",
            Token::Else => "else",
            Token::ElseIf => "elseif",
            Token::End => "end",
            Token::False => "false",
            Token::For => "for",
            Token::Function => "function",
            Token::Goto => "goto",
            Token::If => "if",
            Token::In => "in",
            Token::Local => "local",
            Token::Nil => "nil",
            Token::Not => "not",
            Token::Or => "or",
            Token::Repeat => "repeat",
            Token::Return => "return",
            Token::Then => "then",
            Token::True => "true",
            Token::Until => "until",
            Token::While => "while",
            Token::Integer(i) => return write!(f, "{i}"),
            Token::Float(v) => return write!(f, "{v}"),
            Token::String(_) => "<string>",
            Token::Name(name) => return write!(f, "{name}"),
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::DoubleSlash => "//",
            Token::Percent => "%",
            Token::Caret => "^",
            Token::Hash => "#",
            Token::Ampersand => "&",
            Token::Tilde => "~",
            Token::Pipe => "|",
            Token::ShiftLeft => "<<",
            Token::ShiftRight => ">>",
            Token::Less => "<",
            Token::LessEq => "<=",
            Token::Greater => ">",
            Token::GreaterEq => ">=",
            Token::Equal => "==",
            Token::NotEqual => "~=",
            Token::Assign => "=",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::DoubleColon => "::",
            Token::Semi => ";",
            Token::Colon => ":",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::DotDot => "..",
            Token::DotDotDot => "...",
            Token::Eof => "<eof>",
        };
        f.write_str(text)
    }
}

/// Tokenize a whole source text
pub fn tokenize(source: &str) -> ProtectResult<Vec<SpannedToken>> {
    let mut lexer = Lexer::new(source.as_bytes());
    let mut tokens = Vec::new();
    loop {
        let tok = lexer.next_token()?;
        let done = tok.token == Token::Eof;
        tokens.push(tok);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a [u8]) -> Self {
        let mut lexer = Self {
            source,
            pos: 0,
            line: 1,
        };
        // Skip shebang line
        if lexer.source.starts_with(b"#") {
            while let Some(ch) = lexer.peek() {
                if ch == b'\n' {
                    break;
                }
                lexer.pos += 1;
            }
        }
        lexer
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == b'\n' || ch == b'\r' {
            // \r\n and \n\r count as one line break
            if let Some(next) = self.peek() {
                if (next == b'\n' || next == b'\r') && next != ch {
                    self.pos += 1;
                }
            }
            self.line += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> ProtectError {
        ProtectError::parse(self.line, message)
    }

    fn skip_trivia(&mut self) -> ProtectResult<()> {
        loop {
            while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r' | 0x0B | 0x0C)) {
                self.bump();
            }
            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                self.pos += 2;
                if let Some(level) = self.long_bracket_level() {
                    self.long_string(level)?;
                    continue;
                }
                while !matches!(self.peek(), None | Some(b'\n' | b'\r')) {
                    self.pos += 1;
                }
                continue;
            }
            return Ok(());
        }
    }

    /// Level of a `[==[` opener at the cursor, if any
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek_at(level + 1) == Some(b'=') {
            level += 1;
        }
        (self.peek_at(level + 1) == Some(b'[')).then_some(level)
    }

    fn next_token(&mut self) -> ProtectResult<SpannedToken> {
        self.skip_trivia()?;
        let line = self.line;
        let token = self.scan()?;
        Ok(SpannedToken { token, line })
    }

    fn scan(&mut self) -> ProtectResult<Token> {
        let Some(ch) = self.peek() else {
            return Ok(Token::Eof);
        };

        if ch.is_ascii_alphabetic() || ch == b'_' {
            let start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
                self.pos += 1;
            }
            let word = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
            return Ok(Token::keyword(&word).unwrap_or(Token::Name(word)));
        }

        if ch.is_ascii_digit() || (ch == b'.' && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit()))
        {
            return self.number();
        }

        if ch == b'"' || ch == b'\'' {
            return self.short_string(ch);
        }

        if let Some(level) = self.long_bracket_level() {
            return Ok(Token::String(self.long_string(level)?));
        }

        self.pos += 1;
        let next = self.peek();
        let two = |lexer: &mut Self, token: Token| {
            lexer.pos += 1;
            Ok(token)
        };
        match (ch, next) {
            (b'+', _) => Ok(Token::Plus),
            (b'-', _) => Ok(Token::Minus),
            (b'*', _) => Ok(Token::Star),
            (b'/', Some(b'/')) => two(self, Token::DoubleSlash),
            (b'/', _) => Ok(Token::Slash),
            (b'%', _) => Ok(Token::Percent),
            (b'^', _) => Ok(Token::Caret),
            (b'#', _) => Ok(Token::Hash),
            (b'&', _) => Ok(Token::Ampersand),
            (b'~', Some(b'=')) => two(self, Token::NotEqual),
            (b'~', _) => Ok(Token::Tilde),
            (b'|', _) => Ok(Token::Pipe),
            (b'<', Some(b'<')) => two(self, Token::ShiftLeft),
            (b'<', Some(b'=')) => two(self, Token::LessEq),
            (b'<', _) => Ok(Token::Less),
            (b'>', Some(b'>')) => two(self, Token::ShiftRight),
            (b'>', Some(b'=')) => two(self, Token::GreaterEq),
            (b'>', _) => Ok(Token::Greater),
            (b'=', Some(b'=')) => two(self, Token::Equal),
            (b'=', _) => Ok(Token::Assign),
            (b'(', _) => Ok(Token::LParen),
            (b')', _) => Ok(Token::RParen),
            (b'{', _) => Ok(Token::LBrace),
            (b'}', _) => Ok(Token::RBrace),
            (b'[', _) => Ok(Token::LBracket),
            (b']', _) => Ok(Token::RBracket),
            (b':', Some(b':')) => two(self, Token::DoubleColon),
            (b':', _) => Ok(Token::Colon),
            (b';', _) => Ok(Token::Semi),
            (b',', _) => Ok(Token::Comma),
            (b'.', Some(b'.')) => {
                self.pos += 1;
                if self.peek() == Some(b'.') {
                    self.pos += 1;
                    Ok(Token::DotDotDot)
                } else {
                    Ok(Token::DotDot)
                }
            }
            (b'.', _) => Ok(Token::Dot),
            _ => Err(self.error(format!("unexpected symbol near '{}'", ch as char))),
        }
    }

    fn number(&mut self) -> ProtectResult<Token> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            if matches!(self.peek(), Some(b'.' | b'p' | b'P')) {
                return Err(self.error("hexadecimal float literals are not supported"));
            }
            let digits = std::str::from_utf8(&self.source[digits_start..self.pos])
                .map_err(|e| self.error(e.to_string()))?;
            if digits.is_empty() {
                return Err(self.error("malformed number near '0x'"));
            }
            // Hex integers wrap around like the reference implementation
            let value = digits.bytes().fold(0i64, |acc, d| {
                acc.wrapping_mul(16)
                    .wrapping_add((d as char).to_digit(16).unwrap_or(0) as i64)
            });
            return self.finish_number(Token::Integer(value), start);
        }

        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => self.pos += 1,
                b'.' if !is_float => {
                    is_float = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'+' | b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.source[start..self.pos])
            .map_err(|e| self.error(e.to_string()))?;
        let token = if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(format!("malformed number near '{text}'")))?;
            Token::Float(value)
        } else {
            match text.parse::<i64>() {
                Ok(value) => Token::Integer(value),
                // Decimal integers that overflow become floats
                Err(_) => Token::Float(
                    text.parse()
                        .map_err(|_| self.error(format!("malformed number near '{text}'")))?,
                ),
            }
        };
        self.finish_number(token, start)
    }

    fn finish_number(&self, token: Token, start: usize) -> ProtectResult<Token> {
        if matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            let text = String::from_utf8_lossy(&self.source[start..=self.pos]);
            return Err(self.error(format!("malformed number near '{text}'")));
        }
        Ok(token)
    }

    fn short_string(&mut self, quote: u8) -> ProtectResult<Token> {
        self.pos += 1;
        let mut buf = Vec::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(self.error("unfinished string"));
            };
            match ch {
                b'\n' | b'\r' => return Err(self.error("unfinished string")),
                b'\\' => {
                    self.pos += 1;
                    self.escape(&mut buf)?;
                }
                c if c == quote => {
                    self.pos += 1;
                    return Ok(Token::String(buf));
                }
                c => {
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn escape(&mut self, buf: &mut Vec<u8>) -> ProtectResult<()> {
        let Some(ch) = self.peek() else {
            return Err(self.error("unfinished string"));
        };
        match ch {
            b'n' => buf.push(b'\n'),
            b't' => buf.push(b'\t'),
            b'r' => buf.push(b'\r'),
            b'a' => buf.push(0x07),
            b'b' => buf.push(0x08),
            b'f' => buf.push(0x0C),
            b'v' => buf.push(0x0B),
            b'\\' | b'"' | b'\'' => buf.push(ch),
            b'\n' | b'\r' => {
                self.bump();
                buf.push(b'\n');
                return Ok(());
            }
            b'x' => {
                self.pos += 1;
                let mut value = 0u8;
                for _ in 0..2 {
                    let digit = self
                        .peek()
                        .and_then(|c| (c as char).to_digit(16))
                        .ok_or_else(|| self.error("hexadecimal digit expected"))?;
                    value = value * 16 + digit as u8;
                    self.pos += 1;
                }
                buf.push(value);
                return Ok(());
            }
            b'z' => {
                self.pos += 1;
                while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
                    self.bump();
                }
                return Ok(());
            }
            b'u' => {
                self.pos += 1;
                if self.peek() != Some(b'{') {
                    return Err(self.error("missing '{' in \\u{xxxx}"));
                }
                self.pos += 1;
                let mut code: u32 = 0;
                while let Some(digit) = self.peek().and_then(|c| (c as char).to_digit(16)) {
                    code = code
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(digit))
                        .ok_or_else(|| self.error("UTF-8 value too large"))?;
                    self.pos += 1;
                }
                if self.peek() != Some(b'}') {
                    return Err(self.error("missing '}' in \\u{xxxx}"));
                }
                self.pos += 1;
                let ch = char::from_u32(code).ok_or_else(|| self.error("invalid UTF-8 value"))?;
                let mut tmp = [0u8; 4];
                buf.extend_from_slice(ch.encode_utf8(&mut tmp).as_bytes());
                return Ok(());
            }
            b'0'..=b'9' => {
                let mut value: u32 = 0;
                for _ in 0..3 {
                    match self.peek() {
                        Some(d @ b'0'..=b'9') => {
                            value = value * 10 + (d - b'0') as u32;
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                let byte = u8::try_from(value).map_err(|_| self.error("decimal escape too large"))?;
                buf.push(byte);
                return Ok(());
            }
            other => {
                return Err(self.error(format!("invalid escape sequence '\\{}'", other as char)))
            }
        }
        self.pos += 1;
        Ok(())
    }

    /// Scan a long string or long comment body; the cursor is on the opening `[`
    fn long_string(&mut self, level: usize) -> ProtectResult<Vec<u8>> {
        self.pos += level + 2;
        // A newline right after the opener is skipped
        if matches!(self.peek(), Some(b'\n' | b'\r')) {
            self.bump();
        }
        let mut buf = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unfinished long string or comment")),
                Some(b']') if self.closes_long_bracket(level) => {
                    self.pos += level + 2;
                    return Ok(buf);
                }
                Some(b'\n' | b'\r') => {
                    self.bump();
                    buf.push(b'\n');
                }
                Some(c) => {
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn closes_long_bracket(&self, level: usize) -> bool {
        (1..=level).all(|i| self.peek_at(i) == Some(b'=')) && self.peek_at(level + 1) == Some(b']')
    }
}
