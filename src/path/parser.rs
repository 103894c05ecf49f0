//! Selector expression parser.

use serde_json::Value;
use thiserror::Error;

use super::{CompareOp, FilterExpr, JsonPath, Operand, PathSegment, Selector};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PathError {
    #[error("Expected root identifier '$' at start")]
    ExpectedRoot,
    #[error("Unexpected character {0:?} in selector")]
    UnexpectedChar(char),
    #[error("Unexpected end of selector")]
    UnexpectedEnd,
    #[error("Unclosed string literal")]
    UnclosedString,
    #[error("Invalid number")]
    InvalidNumber,
    #[error("Invalid filter expression")]
    InvalidFilter,
    #[error("Invalid regex in filter: {0}")]
    InvalidRegex(String),
}

pub(crate) fn parse(input: &str) -> Result<JsonPath, PathError> {
    let mut parser = Parser { input, pos: 0 };
    let path = parser.parse_path()?;
    if !parser.is_at_end() {
        return Err(PathError::UnexpectedChar(parser.peek().unwrap_or('\0')));
    }
    Ok(path)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_path(&mut self) -> Result<JsonPath, PathError> {
        if self.peek() != Some('$') {
            return Err(PathError::ExpectedRoot);
        }
        self.advance();
        self.parse_segments()
    }

    /// Segments after the root (`$`) or current-node (`@`) identifier.
    fn parse_segments(&mut self) -> Result<JsonPath, PathError> {
        let mut segments = Vec::new();

        loop {
            match self.peek() {
                Some('.') => {
                    self.advance();
                    if self.peek() == Some('.') {
                        // Recursive descent: ..name, ..*, ..[...]
                        self.advance();
                        let selectors = match self.peek() {
                            Some('*') => {
                                self.advance();
                                vec![Selector::Wildcard]
                            }
                            Some('[') => self.parse_bracket()?,
                            _ => vec![Selector::Name(self.parse_identifier()?)],
                        };
                        segments.push(PathSegment {
                            selectors,
                            recursive: true,
                        });
                    } else if self.peek() == Some('*') {
                        self.advance();
                        segments.push(PathSegment {
                            selectors: vec![Selector::Wildcard],
                            recursive: false,
                        });
                    } else {
                        let name = self.parse_identifier()?;
                        segments.push(PathSegment {
                            selectors: vec![Selector::Name(name)],
                            recursive: false,
                        });
                    }
                }
                Some('[') => {
                    let selectors = self.parse_bracket()?;
                    segments.push(PathSegment {
                        selectors,
                        recursive: false,
                    });
                }
                _ => break,
            }
        }

        Ok(JsonPath { segments })
    }

    fn parse_bracket(&mut self) -> Result<Vec<Selector>, PathError> {
        self.expect('[')?;
        let mut selectors = Vec::new();

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(']') => {
                    self.advance();
                    break;
                }
                Some('\'') | Some('"') => {
                    selectors.push(Selector::Name(self.parse_string()?));
                }
                Some('*') => {
                    self.advance();
                    selectors.push(Selector::Wildcard);
                }
                Some('-') | Some('0'..='9') => {
                    selectors.push(Selector::Index(self.parse_number()?));
                }
                Some('?') => {
                    self.advance();
                    self.skip_whitespace();
                    self.expect('(')?;
                    let expr = self.parse_filter_or()?;
                    self.skip_whitespace();
                    self.expect(')')?;
                    selectors.push(Selector::Filter(expr));
                }
                Some(c) => return Err(PathError::UnexpectedChar(c)),
                None => return Err(PathError::UnexpectedEnd),
            }

            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(']') => {
                    self.advance();
                    break;
                }
                Some(c) => return Err(PathError::UnexpectedChar(c)),
                None => return Err(PathError::UnexpectedEnd),
            }
        }

        if selectors.is_empty() {
            return Err(PathError::UnexpectedEnd);
        }
        Ok(selectors)
    }

    // -----------------------------------------------------------------------
    // Filter expressions
    // -----------------------------------------------------------------------

    fn parse_filter_or(&mut self) -> Result<FilterExpr, PathError> {
        let mut left = self.parse_filter_and()?;
        loop {
            self.skip_whitespace();
            if self.consume_str("||") {
                let right = self.parse_filter_and()?;
                left = FilterExpr::Or(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_filter_and(&mut self) -> Result<FilterExpr, PathError> {
        let mut left = self.parse_filter_unary()?;
        loop {
            self.skip_whitespace();
            if self.consume_str("&&") {
                let right = self.parse_filter_unary()?;
                left = FilterExpr::And(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_filter_unary(&mut self) -> Result<FilterExpr, PathError> {
        self.skip_whitespace();
        match self.peek() {
            Some('!') => {
                self.advance();
                Ok(FilterExpr::Not(Box::new(self.parse_filter_unary()?)))
            }
            Some('(') => {
                self.advance();
                let expr = self.parse_filter_or()?;
                self.skip_whitespace();
                self.expect(')')?;
                Ok(expr)
            }
            _ => self.parse_filter_primary(),
        }
    }

    /// An operand, optionally followed by `.match(/re/)` or a comparison.
    fn parse_filter_primary(&mut self) -> Result<FilterExpr, PathError> {
        let operand = self.parse_operand()?;

        self.skip_whitespace();
        if self.consume_str(".match(") {
            let regex = self.parse_regex()?;
            self.skip_whitespace();
            self.expect(')')?;
            return Ok(FilterExpr::Match { operand, regex });
        }

        if let Some(op) = self.parse_compare_op() {
            let right = self.parse_operand()?;
            return Ok(FilterExpr::Compare {
                op,
                left: operand,
                right,
            });
        }

        // Bare operand: an existence test. Only meaningful for paths.
        match operand {
            Operand::Current(path) => Ok(FilterExpr::Exists(path)),
            _ => Err(PathError::InvalidFilter),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, PathError> {
        self.skip_whitespace();
        match self.peek() {
            Some('@') => {
                self.advance();
                if self.consume_word("property") {
                    Ok(Operand::Property)
                } else {
                    Ok(Operand::Current(self.parse_segments()?))
                }
            }
            Some('\'') | Some('"') => Ok(Operand::Literal(Value::String(self.parse_string()?))),
            Some('-') | Some('0'..='9') => {
                let start = self.pos;
                if self.peek() == Some('-') {
                    self.advance();
                }
                while matches!(self.peek(), Some('0'..='9') | Some('.')) {
                    self.advance();
                }
                let text = &self.input[start..self.pos];
                let number: f64 = text.parse().map_err(|_| PathError::InvalidNumber)?;
                let value = serde_json::Number::from_f64(number)
                    .map(Value::Number)
                    .ok_or(PathError::InvalidNumber)?;
                Ok(Operand::Literal(value))
            }
            _ => {
                if self.consume_word("true") {
                    Ok(Operand::Literal(Value::Bool(true)))
                } else if self.consume_word("false") {
                    Ok(Operand::Literal(Value::Bool(false)))
                } else if self.consume_word("null") {
                    Ok(Operand::Literal(Value::Null))
                } else {
                    Err(PathError::InvalidFilter)
                }
            }
        }
    }

    fn parse_compare_op(&mut self) -> Option<CompareOp> {
        self.skip_whitespace();
        for (text, op) in [
            ("==", CompareOp::Eq),
            ("!=", CompareOp::Ne),
            ("<=", CompareOp::Le),
            (">=", CompareOp::Ge),
            ("<", CompareOp::Lt),
            (">", CompareOp::Gt),
        ] {
            if self.consume_str(text) {
                return Some(op);
            }
        }
        None
    }

    /// A `/pattern/flags` regex literal. Only the `i` flag is honored.
    fn parse_regex(&mut self) -> Result<regex::Regex, PathError> {
        self.skip_whitespace();
        self.expect('/')?;

        let mut pattern = String::new();
        loop {
            match self.peek() {
                None => return Err(PathError::UnclosedString),
                Some('/') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.peek() {
                        // `\/` escapes the delimiter; everything else stays
                        // an escape for the regex engine.
                        Some('/') => pattern.push('/'),
                        Some(c) => {
                            pattern.push('\\');
                            pattern.push(c);
                        }
                        None => return Err(PathError::UnclosedString),
                    }
                    self.advance();
                }
                Some(c) => {
                    pattern.push(c);
                    self.advance();
                }
            }
        }

        let mut case_insensitive = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() {
                if c == 'i' {
                    case_insensitive = true;
                }
                self.advance();
            } else {
                break;
            }
        }

        regex::RegexBuilder::new(&pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| PathError::InvalidRegex(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Lexing helpers
    // -----------------------------------------------------------------------

    fn parse_identifier(&mut self) -> Result<String, PathError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                self.advance();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(PathError::UnexpectedEnd);
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<String, PathError> {
        let quote = self.peek().ok_or(PathError::UnexpectedEnd)?;
        self.advance();

        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(PathError::UnclosedString),
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(out);
                }
                Some('\\') => {
                    self.advance();
                    match self.peek() {
                        Some('n') => out.push('\n'),
                        Some('t') => out.push('\t'),
                        Some('r') => out.push('\r'),
                        Some('\\') => out.push('\\'),
                        Some('\'') => out.push('\''),
                        Some('"') => out.push('"'),
                        _ => return Err(PathError::UnclosedString),
                    }
                    self.advance();
                }
                Some(c) => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<isize, PathError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.advance();
        }
        while matches!(self.peek(), Some('0'..='9')) {
            self.advance();
        }
        self.input[start..self.pos]
            .parse()
            .map_err(|_| PathError::InvalidNumber)
    }

    fn consume_str(&mut self, text: &str) -> bool {
        if self.input[self.pos..].starts_with(text) {
            self.pos += text.len();
            true
        } else {
            false
        }
    }

    /// Consume `word` only when it is not followed by an identifier char.
    fn consume_word(&mut self, word: &str) -> bool {
        let rest = &self.input[self.pos..];
        if !rest.starts_with(word) {
            return false;
        }
        let boundary = rest[word.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric() && c != '_');
        if boundary {
            self.pos += word.len();
        }
        boundary
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), PathError> {
        if self.peek() == Some(expected) {
            self.advance();
            Ok(())
        } else {
            Err(match self.peek() {
                Some(c) => PathError::UnexpectedChar(c),
                None => PathError::UnexpectedEnd,
            })
        }
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }
}
