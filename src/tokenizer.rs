//! Source text to token array conversion.
//!
//! Purely lexical: grouping stays encoded as paren tokens and literal
//! classification is left to the evaluator. The returned array is published
//! as an immutable `Rc<[Token]>` and has already passed paren validation, so
//! downstream evaluation never re-checks balance.

use std::rc::Rc;

use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::diagnostics::{CinderError, ErrorKind, SourceLoc};
use crate::token::{validate_parentheses, Span, Token, TokenKind, TokenSlice};

#[derive(Parser)]
#[grammar = "grammar.pest"]
struct TokenParser;

/// Tokenizes one source file. The resulting array is frozen and balanced.
pub fn tokenize(file_name: &str, source_text: &str) -> Result<TokenSlice, CinderError> {
    let pairs = TokenParser::parse(Rule::token_stream, source_text)
        .map_err(|error| convert_parse_error(error, file_name))?;

    let stream = pairs.peek().expect("grammar guarantees a token_stream");

    let file: Rc<str> = Rc::from(file_name);
    let mut tokens = Vec::new();
    for pair in stream.into_inner() {
        if pair.as_rule() == Rule::EOI {
            continue;
        }
        tokens.push(build_token(pair, &file)?);
    }

    let tokens: TokenSlice = Rc::from(tokens);
    validate_parentheses(&tokens)?;
    Ok(tokens)
}

fn build_token(pair: Pair<Rule>, file: &Rc<str>) -> Result<Token, CinderError> {
    let span = pair.as_span();
    let (line, column_start) = span.start_pos().line_col();
    let (_, column_end) = span.end_pos().line_col();
    let byte_span = Span {
        start: span.start(),
        end: span.end(),
    };

    let (kind, contents) = match pair.as_rule() {
        Rule::open_paren => (TokenKind::OpenParen, String::new()),
        Rule::close_paren => (TokenKind::CloseParen, String::new()),
        Rule::symbol => (TokenKind::Symbol, pair.as_str().to_string()),
        Rule::string => (TokenKind::String, unescape_string(pair.as_str())),
        rule => {
            let mut error = CinderError::new(ErrorKind::Tokenize {
                message: format!("unexpected rule {rule:?}"),
            });
            error.location = Some(SourceLoc {
                file: file.to_string(),
                line: line as u32,
                column: column_start as u32,
            });
            return Err(error);
        }
    };

    Ok(Token {
        kind,
        contents,
        source: file.clone(),
        line: line as u32,
        column_start: column_start as u32,
        column_end: column_end as u32,
        span: byte_span,
    })
}

fn unescape_string(text: &str) -> String {
    // Strip the surrounding quotes the grammar guarantees.
    let inner = &text[1..text.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut characters = inner.chars();
    while let Some(character) = characters.next() {
        if character == '\\' {
            match characters.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('\\') => result.push('\\'),
                Some('"') => result.push('"'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(character);
        }
    }
    result
}

fn convert_parse_error(error: pest::error::Error<Rule>, file_name: &str) -> CinderError {
    let (line, column) = match error.line_col {
        LineColLocation::Pos((line, column)) => (line, column),
        LineColLocation::Span((line, column), _) => (line, column),
    };
    let byte_span = match error.location {
        pest::error::InputLocation::Pos(position) => Span {
            start: position,
            end: position,
        },
        pest::error::InputLocation::Span((start, end)) => Span { start, end },
    };

    let message = if error.to_string().contains("expected \"\\\"\"") {
        "unterminated string".to_string()
    } else {
        "unrecognized input".to_string()
    };

    let mut converted = CinderError::new(ErrorKind::Tokenize { message });
    converted.location = Some(SourceLoc {
        file: file_name.to_string(),
        line: line as u32,
        column: column as u32,
    });
    converted.span = Some(byte_span);
    converted
}
