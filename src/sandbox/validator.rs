// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Static pre-execution checks for user code
//!
//! Source is tokenized and scanned for denied constructs before anything
//! runs. Nothing here intercepts calls at runtime.

use serde::Serialize;
use std::fmt;

use super::lexer::{tokenize, Token, TokenKind};

/// Modules whose import is rejected (matched on the top-level package)
const DENIED_MODULES: &[&str] = &[
    "os",
    "subprocess",
    "sys",
    "importlib",
    "socket",
    "urllib",
    "requests",
    "http",
    "ftplib",
    "smtplib",
    "telnetlib",
    "webbrowser",
    "ctypes",
    "multiprocessing",
    "threading",
    "asyncio",
    "concurrent",
    "shutil",
    "tempfile",
    "pickle",
    "builtins",
    "pathlib",
    "io",
    "signal",
    "pty",
    "marshal",
    "inspect",
];

/// Builtins rejected wherever they are referenced, called or not
const DENIED_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "__import__",
    "__builtins__",
    "globals",
    "locals",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
];

/// Builtins rejected only when called; the names are common identifiers
const DENIED_CALLS: &[&str] = &["vars", "dir", "hasattr", "input"];

/// Introspection attributes used to climb out of the restricted namespace
const DENIED_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__bases__",
    "__subclasses__",
    "__mro__",
    "__globals__",
    "__locals__",
    "__dict__",
    "__code__",
    "__func__",
    "__self__",
    "__module__",
    "__builtins__",
    "__loader__",
    "__spec__",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    DeniedImport { module: String, line: usize },
    DeniedBuiltin { name: String, line: usize },
    DeniedAttribute { name: String, line: usize },
    UnboundedLoop { line: usize },
    Syntax { message: String, line: usize },
    TooLarge { bytes: usize, limit: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DeniedImport { module, line } => {
                write!(f, "line {}: import of restricted module '{}'", line, module)
            }
            Violation::DeniedBuiltin { name, line } => {
                write!(f, "line {}: use of restricted builtin '{}'", line, name)
            }
            Violation::DeniedAttribute { name, line } => {
                write!(f, "line {}: access to restricted attribute '{}'", line, name)
            }
            Violation::UnboundedLoop { line } => {
                write!(f, "line {}: 'while True' loop without a break", line)
            }
            Violation::Syntax { message, line } => write!(f, "line {}: syntax error: {}", line, message),
            Violation::TooLarge { bytes, limit } => {
                write!(f, "source is {} bytes, limit is {}", bytes, limit)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeValidator {
    max_source_bytes: usize,
}

impl CodeValidator {
    pub fn new(max_source_bytes: usize) -> Self {
        Self { max_source_bytes }
    }

    /// Every violation found; empty means the source may run
    pub fn validate(&self, source: &str) -> Vec<Violation> {
        if source.len() > self.max_source_bytes {
            return vec![Violation::TooLarge {
                bytes: source.len(),
                limit: self.max_source_bytes,
            }];
        }

        let tokens = match tokenize(source) {
            Ok(tokens) => tokens,
            Err(e) => {
                return vec![Violation::Syntax {
                    message: e.message,
                    line: e.line,
                }]
            }
        };

        let mut violations = Vec::new();
        let has_break = tokens.iter().any(|t| t.is_name("break"));

        for (i, token) in tokens.iter().enumerate() {
            let prev = i.checked_sub(1).map(|p| &tokens[p]);
            let next = tokens.get(i + 1);
            let after_dot = prev.map_or(false, |p| p.is_op("."));

            if token.kind != TokenKind::Name {
                continue;
            }

            match token.text.as_str() {
                "import" if !after_dot => check_import(&tokens[i + 1..], &mut violations),
                "from" if !after_dot => check_from(&tokens[i + 1..], &mut violations),
                "while" if !has_break => {
                    let forever = next.map_or(false, |n| {
                        n.is_name("True") || (n.kind == TokenKind::Number && n.text == "1")
                    });
                    if forever && tokens.get(i + 2).map_or(false, |t| t.is_op(":")) {
                        violations.push(Violation::UnboundedLoop { line: token.line });
                    }
                }
                name if after_dot && DENIED_ATTRIBUTES.contains(&name) => {
                    violations.push(Violation::DeniedAttribute {
                        name: name.to_string(),
                        line: token.line,
                    });
                }
                name if !after_dot && DENIED_BUILTINS.contains(&name) => {
                    violations.push(Violation::DeniedBuiltin {
                        name: name.to_string(),
                        line: token.line,
                    });
                }
                name if !after_dot
                    && DENIED_CALLS.contains(&name)
                    && next.map_or(false, |n| n.is_op("(")) =>
                {
                    violations.push(Violation::DeniedBuiltin {
                        name: name.to_string(),
                        line: token.line,
                    });
                }
                _ => {}
            }
        }

        violations
    }
}

fn deny_module(root: &Token, violations: &mut Vec<Violation>) {
    if DENIED_MODULES.contains(&root.text.as_str()) {
        violations.push(Violation::DeniedImport {
            module: root.text.clone(),
            line: root.line,
        });
    }
}

/// `import a.b, c as d`
fn check_import(rest: &[Token], violations: &mut Vec<Violation>) {
    let mut expect_module = true;
    let mut after_as = false;
    for token in rest.iter().take_while(|t| !t.ends_statement()) {
        if token.is_op(",") {
            expect_module = true;
        } else if token.is_name("as") {
            after_as = true;
        } else if token.kind == TokenKind::Name {
            if expect_module && !after_as {
                deny_module(token, violations);
            }
            expect_module = false;
            after_as = false;
        }
    }
}

/// `from a.b import c`; relative imports have no top-level package
fn check_from(rest: &[Token], violations: &mut Vec<Violation>) {
    if let Some(first) = rest.first() {
        if first.kind == TokenKind::Name && first.text != "import" {
            deny_module(first, violations);
        }
    }
}
