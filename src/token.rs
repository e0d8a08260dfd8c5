//! Flat token model shared by the tokenizer, evaluator, and compile-time
//! macros.
//!
//! Token arrays are published as `Rc<[Token]>`: once an array is handed to
//! the environment it can never grow or move, so `(array, index)` pairs
//! remain valid for the whole translation. Macro expansions produce fresh
//! arrays for the same reason.

use std::fmt;
use std::rc::Rc;

use crate::diagnostics::{error_at_token, CinderError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    OpenParen,
    CloseParen,
    Symbol,
    String,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::OpenParen => "open-paren",
            TokenKind::CloseParen => "close-paren",
            TokenKind::Symbol => "symbol",
            TokenKind::String => "string",
        }
    }
}

/// Byte range into the registered source text, for diagnostic rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub contents: String,
    /// Name of the file (or expansion) this token came from.
    pub source: Rc<str>,
    pub line: u32,
    pub column_start: u32,
    pub column_end: u32,
    pub span: Span,
}

/// An immutable, published token array. Never reallocated.
pub type TokenSlice = Rc<[Token]>;

/// Stable handle to one token: the owning array plus an index into it.
#[derive(Clone)]
pub struct TokenRef {
    pub tokens: TokenSlice,
    pub index: usize,
}

impl TokenRef {
    pub fn new(tokens: &TokenSlice, index: usize) -> Self {
        Self {
            tokens: tokens.clone(),
            index,
        }
    }

    pub fn token(&self) -> &Token {
        &self.tokens[self.index]
    }

    pub fn contents(&self) -> &str {
        &self.token().contents
    }
}

impl fmt::Debug for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = self.token();
        write!(
            f,
            "TokenRef({:?} {}:{})",
            token.contents, token.source, token.line
        )
    }
}

/// Index of the close paren matching the open paren at `open_index`.
///
/// The array must already have passed [`validate_parentheses`]; this trusts
/// its input blindly.
pub fn find_close_paren(tokens: &[Token], open_index: usize) -> usize {
    debug_assert_eq!(tokens[open_index].kind, TokenKind::OpenParen);
    let mut depth = 0i32;
    for (index, token) in tokens.iter().enumerate().skip(open_index) {
        match token.kind {
            TokenKind::OpenParen => depth += 1,
            TokenKind::CloseParen => {
                depth -= 1;
                if depth == 0 {
                    return index;
                }
            }
            _ => {}
        }
    }
    // Unreachable on validated input; point at the end rather than panic.
    tokens.len() - 1
}

/// Checks that parentheses pair up. Run on every token array before it is
/// evaluated; the evaluator itself never re-checks.
pub fn validate_parentheses(tokens: &[Token]) -> Result<(), CinderError> {
    let mut depth = 0i32;
    let mut last_open: Option<&Token> = None;
    for token in tokens {
        match token.kind {
            TokenKind::OpenParen => {
                depth += 1;
                last_open = Some(token);
            }
            TokenKind::CloseParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(error_at_token(
                        ErrorKind::Tokenize {
                            message: "close paren without matching open paren".into(),
                        },
                        token,
                    ));
                }
            }
            _ => {}
        }
    }
    if depth > 0 {
        let token = last_open.expect("positive depth implies an open paren");
        return Err(error_at_token(
            ErrorKind::Tokenize {
                message: format!("{depth} unclosed paren(s)"),
            },
            token,
        ));
    }
    Ok(())
}

/// Reconstructs S-expression text from a token array, one top-level form per
/// line. Used for macro expansion dumps in diagnostics.
pub fn pretty_print_tokens(tokens: &[Token]) -> String {
    let mut text = String::new();
    let mut depth = 0i32;
    let mut needs_space = false;
    for token in tokens {
        match token.kind {
            TokenKind::OpenParen => {
                if needs_space {
                    text.push(' ');
                }
                text.push('(');
                depth += 1;
                needs_space = false;
            }
            TokenKind::CloseParen => {
                text.push(')');
                depth -= 1;
                if depth == 0 {
                    text.push('\n');
                    needs_space = false;
                } else {
                    needs_space = true;
                }
            }
            TokenKind::Symbol => {
                if needs_space {
                    text.push(' ');
                }
                text.push_str(&token.contents);
                needs_space = true;
            }
            TokenKind::String => {
                if needs_space {
                    text.push(' ');
                }
                text.push('"');
                text.push_str(&token.contents);
                text.push('"');
                needs_space = true;
            }
        }
    }
    text
}
