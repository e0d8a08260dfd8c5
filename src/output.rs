//! Typed output fragments produced by evaluation.
//!
//! A [`GeneratorOutput`] holds independent source and header streams of
//! [`StringOutput`] fragments. Formatting is deferred to the writer: each
//! fragment carries the modifier flags that tell the writer how to lay it
//! out, and a back-pointer to the token it was generated from so build
//! failures in generated code can be traced to source.
//!
//! Splice fragments reserve a position for content that arrives later. The
//! fragment stores a [`SpliceId`] into the environment's splice arena; at
//! write time the child buffer's contents replace the sentinel without
//! moving any surrounding fragment.

use bitflags::bitflags;

use crate::token::TokenRef;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OutputMod: u16 {
        const SPACE_AFTER = 1 << 0;
        const NEWLINE_AFTER = 1 << 1;
        const SURROUND_WITH_QUOTES = 1 << 2;
        const CONVERT_VARIABLE_NAME = 1 << 3;
        const OPEN_PAREN = 1 << 4;
        const CLOSE_PAREN = 1 << 5;
        const END_STATEMENT = 1 << 6;
        /// Sentinel: the fragment's `splice` buffer replaces it at write time.
        const SPLICE = 1 << 7;
    }
}

/// Handle to a splice buffer in the environment's splice arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpliceId(pub usize);

#[derive(Debug, Clone)]
pub struct StringOutput {
    pub contents: String,
    pub modifiers: OutputMod,
    /// Originating token, kept for diagnostics.
    pub origin: Option<TokenRef>,
    pub splice: Option<SpliceId>,
}

impl StringOutput {
    /// A bare delimiter fragment, cloned between siblings by the evaluator.
    pub fn delimiter(contents: &str, modifiers: OutputMod) -> Self {
        Self {
            contents: contents.into(),
            modifiers,
            origin: None,
            splice: None,
        }
    }
}

/// Per-definition output buffer with independent source and header streams.
#[derive(Debug, Default)]
pub struct GeneratorOutput {
    pub source: Vec<StringOutput>,
    pub header: Vec<StringOutput>,
}

impl GeneratorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.header.is_empty()
    }

    /// Drops all fragments from both streams. Used when a speculative
    /// emission must be replaced by the definitive one.
    pub fn clear(&mut self) {
        self.source.clear();
        self.header.clear();
    }
}

pub fn add_string_output(
    stream: &mut Vec<StringOutput>,
    contents: impl Into<String>,
    modifiers: OutputMod,
    origin: &TokenRef,
) {
    stream.push(StringOutput {
        contents: contents.into(),
        modifiers,
        origin: Some(origin.clone()),
        splice: None,
    });
}

/// Adds a fragment whose text is implied by its modifiers (parens,
/// statement terminators, and similar language punctuation).
pub fn add_lang_token_output(stream: &mut Vec<StringOutput>, modifiers: OutputMod, origin: &TokenRef) {
    stream.push(StringOutput {
        contents: String::new(),
        modifiers,
        origin: Some(origin.clone()),
        splice: None,
    });
}

/// Installs a splice sentinel at the current position. The sentinel holds
/// the stream position open so later fills of the splice buffer appear in
/// installation order.
pub fn add_splice_output(stream: &mut Vec<StringOutput>, splice: SpliceId, origin: &TokenRef) {
    stream.push(StringOutput {
        contents: String::new(),
        modifiers: OutputMod::SPLICE,
        origin: Some(origin.clone()),
        splice: Some(splice),
    });
}
