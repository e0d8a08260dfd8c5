//! C ABI surface exported to loaded compile-time code.
//!
//! Compile-time macros and generators are compiled as C++ shared libraries
//! and dlopen'd into this process; everything they know about the evaluator
//! goes through these functions. The handle types are opaque on the C++
//! side: a token array handle is a `*const TokenSlice`, a token vector
//! handle is a `*mut Vec<Token>`, and an output handle is a
//! `*mut GeneratorOutput`, exactly as passed by the entry-point invocations
//! in the environment module.
//!
//! The prototypes (and the token kind / modifier constants) are mirrored in
//! the generated source heading in the comptime module; the two must be
//! kept in sync.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int, c_uint};

use crate::output::{GeneratorOutput, OutputMod, StringOutput};
use crate::token::{find_close_paren, Token, TokenKind, TokenRef, TokenSlice};

const TOKEN_KIND_OPEN_PAREN: c_int = 0;
const TOKEN_KIND_CLOSE_PAREN: c_int = 1;
const TOKEN_KIND_SYMBOL: c_int = 2;
const TOKEN_KIND_STRING: c_int = 3;

/// Keeps every bridge function in the final binary. Nothing in the
/// transpiler itself calls these through normal paths, so without an anchor
/// the linker would be free to drop the object and loaded libraries would
/// fail symbol resolution.
struct BridgeApi([*const (); 12]);

// The table holds function addresses only; nothing is ever read or written
// through them from Rust.
unsafe impl Sync for BridgeApi {}

#[used]
static EXPORTED_BRIDGE_API: BridgeApi = BridgeApi([
    cinder_token_count as *const (),
    cinder_token_kind as *const (),
    cinder_token_contents as *const (),
    cinder_token_matches as *const (),
    cinder_find_close_paren as *const (),
    cinder_tokens_push_open as *const (),
    cinder_tokens_push_close as *const (),
    cinder_tokens_push_symbol as *const (),
    cinder_tokens_push_string as *const (),
    cinder_tokens_copy as *const (),
    cinder_output_add_string as *const (),
    cinder_output_add_header_string as *const (),
]);

/// Called at environment construction so this module is always linked into
/// binaries that embed the evaluator.
pub(crate) fn ensure_linked() {}

unsafe fn token_slice<'a>(handle: *const c_void) -> &'a TokenSlice {
    &*(handle as *const TokenSlice)
}

unsafe fn token_vec<'a>(handle: *mut c_void) -> &'a mut Vec<Token> {
    &mut *(handle as *mut Vec<Token>)
}

unsafe fn generator_output<'a>(handle: *mut c_void) -> &'a mut GeneratorOutput {
    &mut *(handle as *mut GeneratorOutput)
}

unsafe fn owned_c_string(contents: *const c_char) -> String {
    if contents.is_null() {
        String::new()
    } else {
        CStr::from_ptr(contents).to_string_lossy().into_owned()
    }
}

/// Builds a token carrying the source position of `origin_index`, so
/// diagnostics in macro-generated code still point somewhere useful.
fn synthesized_token(
    kind: TokenKind,
    contents: String,
    source: &TokenSlice,
    origin_index: c_int,
) -> Token {
    let clamped = (origin_index.max(0) as usize).min(source.len().saturating_sub(1));
    let origin = &source[clamped];
    Token {
        kind,
        contents,
        source: origin.source.clone(),
        line: origin.line,
        column_start: origin.column_start,
        column_end: origin.column_end,
        span: origin.span,
    }
}

// ============================================================================
// TOKEN ARRAY INSPECTION
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn cinder_token_count(tokens: *const c_void) -> c_int {
    token_slice(tokens).len() as c_int
}

#[no_mangle]
pub unsafe extern "C" fn cinder_token_kind(tokens: *const c_void, index: c_int) -> c_int {
    let tokens = token_slice(tokens);
    if index < 0 || index as usize >= tokens.len() {
        return -1;
    }
    match tokens[index as usize].kind {
        TokenKind::OpenParen => TOKEN_KIND_OPEN_PAREN,
        TokenKind::CloseParen => TOKEN_KIND_CLOSE_PAREN,
        TokenKind::Symbol => TOKEN_KIND_SYMBOL,
        TokenKind::String => TOKEN_KIND_STRING,
    }
}

/// Returns a pointer to the token's contents bytes and writes their length
/// to `out_length`. The bytes are NOT nul terminated; use
/// [`cinder_token_matches`] for comparisons.
#[no_mangle]
pub unsafe extern "C" fn cinder_token_contents(
    tokens: *const c_void,
    index: c_int,
    out_length: *mut c_int,
) -> *const c_char {
    let tokens = token_slice(tokens);
    if index < 0 || index as usize >= tokens.len() {
        if !out_length.is_null() {
            *out_length = 0;
        }
        return std::ptr::null();
    }
    let contents = &tokens[index as usize].contents;
    if !out_length.is_null() {
        *out_length = contents.len() as c_int;
    }
    contents.as_ptr() as *const c_char
}

#[no_mangle]
pub unsafe extern "C" fn cinder_token_matches(
    tokens: *const c_void,
    index: c_int,
    contents: *const c_char,
) -> bool {
    let tokens = token_slice(tokens);
    if index < 0 || index as usize >= tokens.len() || contents.is_null() {
        return false;
    }
    CStr::from_ptr(contents).to_bytes() == tokens[index as usize].contents.as_bytes()
}

#[no_mangle]
pub unsafe extern "C" fn cinder_find_close_paren(
    tokens: *const c_void,
    open_index: c_int,
) -> c_int {
    let tokens = token_slice(tokens);
    if open_index < 0
        || open_index as usize >= tokens.len()
        || tokens[open_index as usize].kind != TokenKind::OpenParen
    {
        return -1;
    }
    find_close_paren(tokens, open_index as usize) as c_int
}

// ============================================================================
// TOKEN VECTOR APPEND (macro output)
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn cinder_tokens_push_open(
    output: *mut c_void,
    source: *const c_void,
    origin_index: c_int,
) {
    let source = token_slice(source);
    token_vec(output).push(synthesized_token(
        TokenKind::OpenParen,
        String::new(),
        source,
        origin_index,
    ));
}

#[no_mangle]
pub unsafe extern "C" fn cinder_tokens_push_close(
    output: *mut c_void,
    source: *const c_void,
    origin_index: c_int,
) {
    let source = token_slice(source);
    token_vec(output).push(synthesized_token(
        TokenKind::CloseParen,
        String::new(),
        source,
        origin_index,
    ));
}

#[no_mangle]
pub unsafe extern "C" fn cinder_tokens_push_symbol(
    output: *mut c_void,
    contents: *const c_char,
    source: *const c_void,
    origin_index: c_int,
) {
    let source = token_slice(source);
    let contents = owned_c_string(contents);
    token_vec(output).push(synthesized_token(
        TokenKind::Symbol,
        contents,
        source,
        origin_index,
    ));
}

#[no_mangle]
pub unsafe extern "C" fn cinder_tokens_push_string(
    output: *mut c_void,
    contents: *const c_char,
    source: *const c_void,
    origin_index: c_int,
) {
    let source = token_slice(source);
    let contents = owned_c_string(contents);
    token_vec(output).push(synthesized_token(
        TokenKind::String,
        contents,
        source,
        origin_index,
    ));
}

/// Copies `source[start_index..end_index]` (end exclusive) into the output
/// vector. The usual way for a macro to forward one of its arguments.
#[no_mangle]
pub unsafe extern "C" fn cinder_tokens_copy(
    output: *mut c_void,
    source: *const c_void,
    start_index: c_int,
    end_index: c_int,
) {
    let source = token_slice(source);
    let output = token_vec(output);
    if start_index < 0 || end_index < start_index {
        return;
    }
    let start = start_index as usize;
    let end = (end_index as usize).min(source.len());
    for token in &source[start.min(source.len())..end] {
        output.push(token.clone());
    }
}

// ============================================================================
// OUTPUT FRAGMENT APPEND (generator output)
// ============================================================================

unsafe fn push_output_fragment(
    stream: &mut Vec<StringOutput>,
    contents: *const c_char,
    modifiers: c_uint,
    source: *const c_void,
    origin_index: c_int,
) {
    let source = token_slice(source);
    let clamped = (origin_index.max(0) as usize).min(source.len().saturating_sub(1));
    let origin = TokenRef::new(source, clamped);
    stream.push(StringOutput {
        contents: owned_c_string(contents),
        modifiers: OutputMod::from_bits_truncate(modifiers as u16),
        origin: Some(origin),
        splice: None,
    });
}

#[no_mangle]
pub unsafe extern "C" fn cinder_output_add_string(
    output: *mut c_void,
    contents: *const c_char,
    modifiers: c_uint,
    source: *const c_void,
    origin_index: c_int,
) {
    let output = generator_output(output);
    push_output_fragment(&mut output.source, contents, modifiers, source, origin_index);
}

#[no_mangle]
pub unsafe extern "C" fn cinder_output_add_header_string(
    output: *mut c_void,
    contents: *const c_char,
    modifiers: c_uint,
    source: *const c_void,
    origin_index: c_int,
) {
    let output = generator_output(output);
    push_output_fragment(&mut output.header, contents, modifiers, source, origin_index);
}
