//! Evaluator and dispatcher behavior over complete modules, driven through
//! the public pipeline without touching a C++ toolchain.

use cinder::builder::evaluate_resolve_references;
use cinder::cli::evaluate_module_tokens;
use cinder::environment::{
    BuildOptions, EvaluatorEnvironment, GuessState, MacroEntry, ObjectKind,
    GLOBAL_DEFINITION_NAME,
};
use cinder::token::{Token, TokenKind, TokenSlice};
use cinder::tokenizer::tokenize;
use cinder::writer::write_module_output;
use pretty_assertions::assert_eq;

fn test_environment() -> (EvaluatorEnvironment, tempfile::TempDir) {
    let cache = tempfile::tempdir().expect("temp cache dir");
    let mut options = BuildOptions::default();
    options.cache_dir = cache.path().to_path_buf();
    (EvaluatorEnvironment::new(options), cache)
}

/// Tokenizes and evaluates `source`, returning the evaluation error count.
fn evaluate_source(environment: &mut EvaluatorEnvironment, source: &str) -> usize {
    environment.register_source("test.cnd", source);
    let tokens = tokenize("test.cnd", source).expect("test source should tokenize");
    evaluate_module_tokens(environment, &tokens)
}

fn module_source_text(environment: &EvaluatorEnvironment) -> String {
    write_module_output(environment, "test.cnd", "test.hpp").0
}

// ============================================================================
// S1: literal module
// ============================================================================

#[test]
fn defun_produces_one_required_function_with_no_references() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(
        &mut environment,
        "(defun add (a int b int &return int) (return (+ a b)))",
    );
    assert_eq!(errors, 0);
    assert!(evaluate_resolve_references(&mut environment));

    let definition = &environment.definitions["add"];
    assert_eq!(definition.kind, ObjectKind::Function);
    assert!(definition.is_required);
    assert!(definition.references.is_empty());

    let (source_text, header_text) = write_module_output(&environment, "test.cnd", "test.hpp");
    assert!(header_text.contains("int add(int a, int b);"));
    assert!(source_text.contains("int add(int a, int b)"));
    assert!(source_text.contains("return (a + b);"));

    environment.destroy_expansions_invalidating_tokens();
}

// ============================================================================
// S4: unknown function becomes a guess, not an error
// ============================================================================

#[test]
fn unknown_call_is_guessed_as_plain_c_invocation() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(&mut environment, "(printf \"hello\")");
    assert_eq!(errors, 0);
    assert!(evaluate_resolve_references(&mut environment));
    assert_eq!(environment.error_count(), 0);

    let status = &environment.definitions[GLOBAL_DEFINITION_NAME].references["printf"];
    assert_eq!(status.guess_state, GuessState::Guessed);

    let source_text = module_source_text(&environment);
    assert!(source_text.contains("printf(\"hello\")"));

    environment.destroy_expansions_invalidating_tokens();
}

#[test]
fn splice_order_follows_source_order_of_call_sites() {
    let (mut environment, _cache) = test_environment();
    evaluate_source(&mut environment, "(alpha 1)\n(beta 2)");
    assert!(evaluate_resolve_references(&mut environment));

    let source_text = module_source_text(&environment);
    let alpha_at = source_text.find("alpha(1)").expect("alpha emitted");
    let beta_at = source_text.find("beta(2)").expect("beta emitted");
    assert!(alpha_at < beta_at);

    environment.destroy_expansions_invalidating_tokens();
}

// ============================================================================
// Late-defined functions resolve without speculation surviving
// ============================================================================

#[test]
fn call_before_function_definition_resolves_to_invocation() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(
        &mut environment,
        "(defun caller () (callee 1))\n(defun callee (x int))",
    );
    assert_eq!(errors, 0);
    assert!(evaluate_resolve_references(&mut environment));

    let status = &environment.definitions["caller"].references["callee"];
    assert_eq!(status.guess_state, GuessState::Resolved);

    let source_text = module_source_text(&environment);
    assert!(source_text.contains("callee(1);"));

    environment.destroy_expansions_invalidating_tokens();
}

// ============================================================================
// Scope and duplicate diagnostics
// ============================================================================

#[test]
fn bare_symbol_at_module_scope_is_an_error() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(&mut environment, "loose-symbol");
    assert_eq!(errors, 1);
    assert_eq!(environment.error_count(), 1);
}

#[test]
fn duplicate_definitions_are_reported_with_first_location() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(&mut environment, "(defun twice ())\n(defun twice ())");
    assert_eq!(errors, 1);
    let rendered = environment.errors[0].render();
    assert!(rendered.contains("multiple definitions of 'twice'"));
    assert!(rendered.contains("first defined here"));
}

// ============================================================================
// Native macro expansion
// ============================================================================

fn copy_of(token: &Token, kind: TokenKind, contents: &str) -> Token {
    Token {
        kind,
        contents: contents.to_string(),
        source: token.source.clone(),
        line: token.line,
        column_start: token.column_start,
        column_end: token.column_end,
        span: token.span,
    }
}

/// `(square x)` expands to `(* x x)`.
fn square_macro(
    _environment: &mut EvaluatorEnvironment,
    _context: &cinder::environment::EvaluatorContext,
    tokens: &TokenSlice,
    start_index: usize,
    output: &mut Vec<Token>,
) -> bool {
    let argument = &tokens[start_index + 2];
    output.push(copy_of(argument, TokenKind::OpenParen, ""));
    output.push(copy_of(argument, TokenKind::Symbol, "*"));
    output.push(argument.clone());
    output.push(argument.clone());
    output.push(copy_of(argument, TokenKind::CloseParen, ""));
    true
}

fn failing_macro(
    _environment: &mut EvaluatorEnvironment,
    _context: &cinder::environment::EvaluatorContext,
    _tokens: &TokenSlice,
    _start_index: usize,
    _output: &mut Vec<Token>,
) -> bool {
    false
}

/// Produces a lone open paren, which must be rejected.
fn unbalanced_macro(
    _environment: &mut EvaluatorEnvironment,
    _context: &cinder::environment::EvaluatorContext,
    tokens: &TokenSlice,
    start_index: usize,
    output: &mut Vec<Token>,
) -> bool {
    output.push(copy_of(&tokens[start_index], TokenKind::OpenParen, ""));
    true
}

#[test]
fn macro_expansion_is_evaluated_in_place_and_arena_retained() {
    let (mut environment, _cache) = test_environment();
    environment
        .macros
        .insert("square".into(), MacroEntry::Native(square_macro));

    let errors = evaluate_source(
        &mut environment,
        "(defun f (&return int) (return (square 5)))",
    );
    assert_eq!(errors, 0);
    assert!(evaluate_resolve_references(&mut environment));

    let source_text = module_source_text(&environment);
    assert!(source_text.contains("return (5 * 5);"));
    assert_eq!(environment.macro_expansions.len(), 1);

    environment.destroy_expansions_invalidating_tokens();
    assert!(environment.macro_expansions.is_empty());
}

#[test]
fn macro_returning_failure_is_reported() {
    let (mut environment, _cache) = test_environment();
    environment
        .macros
        .insert("broken".into(), MacroEntry::Native(failing_macro));

    let errors = evaluate_source(&mut environment, "(defun f () (broken))");
    assert_eq!(errors, 1);
    assert!(environment.errors.iter().any(|error| error
        .render()
        .contains("macro 'broken' returned failure")));
}

#[test]
fn unbalanced_macro_expansion_is_rejected_with_dump() {
    let (mut environment, _cache) = test_environment();
    environment
        .macros
        .insert("lopsided".into(), MacroEntry::Native(unbalanced_macro));

    let errors = evaluate_source(&mut environment, "(defun f () (lopsided))");
    assert_eq!(errors, 1);
    assert!(environment.errors.iter().any(|error| error
        .render()
        .contains("produced unbalanced parentheses")));
    // The failed expansion must still be discarded, not retained.
    assert!(environment.macro_expansions.is_empty());
}

// ============================================================================
// Token immutability across the whole pipeline
// ============================================================================

#[test]
fn published_token_arrays_are_unchanged_at_teardown() {
    let (mut environment, _cache) = test_environment();
    environment
        .macros
        .insert("square".into(), MacroEntry::Native(square_macro));

    let source = "(defun f (&return int) (return (square 4)))\n(printf \"x\")";
    environment.register_source("test.cnd", source);
    let tokens = tokenize("test.cnd", source).expect("tokenize");
    let snapshot: Vec<Token> = tokens.iter().cloned().collect();

    let errors = evaluate_module_tokens(&mut environment, &tokens);
    assert_eq!(errors, 0);
    assert!(evaluate_resolve_references(&mut environment));

    assert_eq!(tokens.len(), snapshot.len());
    for (token, original) in tokens.iter().zip(snapshot.iter()) {
        assert_eq!(token, original);
    }

    environment.destroy_expansions_invalidating_tokens();
    // The caller-owned array is not freed by teardown.
    assert_eq!(tokens.len(), snapshot.len());
}

// ============================================================================
// Hot reload rewrites state variable access
// ============================================================================

#[test]
fn hot_reload_dereferences_module_state_variables() {
    let cache = tempfile::tempdir().expect("temp cache dir");
    let mut options = BuildOptions::default();
    options.cache_dir = cache.path().to_path_buf();
    options.enable_hot_reloading = true;
    let mut environment = EvaluatorEnvironment::new(options);

    let errors = evaluate_source(
        &mut environment,
        "(var counter int 0)\n(defun tick () (set counter (+ counter 1)))",
    );
    assert_eq!(errors, 0);
    assert!(evaluate_resolve_references(&mut environment));

    let (source_text, header_text) = write_module_output(&environment, "test.cnd", "test.hpp");
    assert!(header_text.contains("extern int counter;"));
    assert!(source_text.contains("int counter = 0;"));
    assert!(source_text.contains("(*counter) = ((*counter) + 1);"));

    environment.destroy_expansions_invalidating_tokens();
}
