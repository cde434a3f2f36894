// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Token stream for Python source
//!
//! Enough structure for static checks: names, literals, punctuation and
//! logical line breaks, with comments dropped and string literals kept
//! whole so their contents can never be mistaken for code. The replacement
//! fields of f-strings are code, so they are tokenized as well.
//!
//! Identifiers are ASCII only. Python folds other identifiers through NFKC
//! before lookup, so a fullwidth `ｏｐｅｎ` would name `open`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    Str,
    Op,
    Newline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
}

impl Token {
    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.text == name
    }

    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }

    /// Ends a simple statement
    pub fn ends_statement(&self) -> bool {
        self.kind == TokenKind::Newline || self.is_op(";")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

const STRING_PREFIXES: &[&str] = &["r", "u", "b", "f", "br", "rb", "fr", "rf"];

fn closing(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = tokenize_from(source, 1)?;
    let line = 1 + source.matches('\n').count();
    tokens.push(Token {
        kind: TokenKind::Newline,
        text: String::new(),
        line,
    });
    Ok(tokens)
}

/// Replacement fields of an f-string body, each with the line it starts on
fn replacement_fields(body: &[char], first_line: usize) -> Result<Vec<(String, usize)>, LexError> {
    let mut fields = Vec::new();
    let mut line = first_line;
    let mut i = 0;

    while i < body.len() {
        match body[i] {
            '\n' => {
                line += 1;
                i += 1;
            }
            '{' if body.get(i + 1) == Some(&'{') => i += 2,
            '{' => {
                let start_line = line;
                let start = i + 1;
                let mut depth = 1;
                let mut quote: Option<char> = None;
                i += 1;
                while depth > 0 {
                    let c = *body.get(i).ok_or_else(|| LexError {
                        message: "f-string: expecting '}'".to_string(),
                        line: start_line,
                    })?;
                    match (quote, c) {
                        (_, '\n') => line += 1,
                        (Some(q), c) if c == q => quote = None,
                        (Some(_), _) => {}
                        (None, '\'') | (None, '"') => quote = Some(c),
                        (None, '{') | (None, '(') | (None, '[') => depth += 1,
                        (None, '}') | (None, ')') | (None, ']') => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
                fields.push((body[start..i - 1].iter().collect(), start_line));
            }
            _ => i += 1,
        }
    }
    Ok(fields)
}

fn tokenize_from(source: &str, first_line: usize) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut brackets: Vec<(char, usize)> = Vec::new();
    let mut line = first_line;
    let mut fstring = false;
    let mut i = 0;

    let err = |message: &str, line: usize| LexError {
        message: message.to_string(),
        line,
    };

    while i < chars.len() {
        let c = chars[i];

        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c == '\n' {
            // Line breaks inside brackets do not end a statement
            if brackets.is_empty() {
                tokens.push(Token {
                    kind: TokenKind::Newline,
                    text: String::new(),
                    line,
                });
            }
            line += 1;
            i += 1;
            continue;
        }

        if c == '\\' && chars.get(i + 1) == Some(&'\n') {
            line += 1;
            i += 2;
            continue;
        }

        if !c.is_ascii() {
            return Err(err(&format!("non-ASCII character {:?} outside a string", c), line));
        }

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let quote_follows = matches!(chars.get(i), Some('\'') | Some('"'));
            let prefix = word.to_ascii_lowercase();
            if quote_follows && STRING_PREFIXES.contains(&prefix.as_str()) {
                fstring = prefix.contains('f');
                continue;
            }
            tokens.push(Token {
                kind: TokenKind::Name,
                text: word,
                line,
            });
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Number,
                text: chars[start..i].iter().collect(),
                line,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            let start_line = line;
            let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
            let delimiter = if triple { 3 } else { 1 };
            i += delimiter;
            let content_start = i;
            loop {
                match chars.get(i) {
                    None => return Err(err("unterminated string literal", start_line)),
                    Some('\\') => {
                        if chars.get(i + 1) == Some(&'\n') {
                            line += 1;
                        }
                        i += 2;
                    }
                    Some('\n') if !triple => {
                        return Err(err("unterminated string literal", start_line));
                    }
                    Some('\n') => {
                        line += 1;
                        i += 1;
                    }
                    Some(&q) if q == c => {
                        if !triple {
                            break;
                        }
                        if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                            break;
                        }
                        i += 1;
                    }
                    Some(_) => i += 1,
                }
            }
            let content_end = i.min(chars.len());
            let body = &chars[content_start..content_end];
            tokens.push(Token {
                kind: TokenKind::Str,
                text: body.iter().collect(),
                line: start_line,
            });
            if std::mem::take(&mut fstring) {
                for (field, field_line) in replacement_fields(body, start_line)? {
                    tokens.push(Token {
                        kind: TokenKind::Op,
                        text: "(".to_string(),
                        line: field_line,
                    });
                    tokens.extend(tokenize_from(&field, field_line)?);
                    tokens.push(Token {
                        kind: TokenKind::Op,
                        text: ")".to_string(),
                        line: field_line,
                    });
                }
            }
            i += delimiter;
            continue;
        }

        match c {
            '(' | '[' | '{' => brackets.push((c, line)),
            ')' | ']' | '}' => match brackets.pop() {
                Some((open, _)) if closing(open) == c => {}
                Some((open, open_line)) => {
                    return Err(err(
                        &format!("'{}' does not match '{}' opened on line {}", c, open, open_line),
                        line,
                    ))
                }
                None => return Err(err(&format!("unmatched '{}'", c), line)),
            },
            _ => {}
        }
        tokens.push(Token {
            kind: TokenKind::Op,
            text: c.to_string(),
            line,
        });
        i += 1;
    }

    if let Some((open, open_line)) = brackets.pop() {
        return Err(err(&format!("'{}' was never closed", open), open_line));
    }
    Ok(tokens)
}
