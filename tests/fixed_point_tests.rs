//! Requirement propagation and fixed-point loop behavior, including the
//! cyclic compile-time case. None of these tests spawn a compiler: every
//! scenario here either resolves without building or refuses to build.

use cinder::builder::{evaluate_resolve_references, propagate_required_to_references};
use cinder::cli::evaluate_module_tokens;
use cinder::environment::{BuildOptions, EvaluatorEnvironment, GuessState, ObjectKind};
use cinder::tokenizer::tokenize;
use pretty_assertions::assert_eq;

fn test_environment() -> (EvaluatorEnvironment, tempfile::TempDir) {
    let cache = tempfile::tempdir().expect("temp cache dir");
    let mut options = BuildOptions::default();
    options.cache_dir = cache.path().to_path_buf();
    (EvaluatorEnvironment::new(options), cache)
}

fn evaluate_source(environment: &mut EvaluatorEnvironment, source: &str) -> usize {
    environment.register_source("test.cnd", source);
    let tokens = tokenize("test.cnd", source).expect("test source should tokenize");
    evaluate_module_tokens(environment, &tokens)
}

// ============================================================================
// Requirement closure
// ============================================================================

#[test]
fn requirement_propagates_transitively_to_invoked_macros() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(
        &mut environment,
        "(defmacro used-helper (return true))\n\
         (defmacro unused-helper (return true))\n\
         (defun entry () (used-helper))",
    );
    assert_eq!(errors, 0);

    // Before propagation, compile-time definitions start out not required.
    assert!(!environment.definitions["used-helper"].is_required);
    assert!(!environment.definitions["unused-helper"].is_required);
    assert!(environment.definitions["entry"].is_required);

    propagate_required_to_references(&mut environment);

    assert!(environment.definitions["used-helper"].is_required);
    assert!(!environment.definitions["unused-helper"].is_required);
}

#[test]
fn propagation_reaches_a_fixed_point_over_chains() {
    let (mut environment, _cache) = test_environment();
    // entry -> a -> b, where a and b are macros referencing each other in a
    // chain; requirement must cross both edges.
    let errors = evaluate_source(
        &mut environment,
        "(defmacro chain-b (return true))\n\
         (defmacro chain-a (chain-b))\n\
         (defun entry () (chain-a))",
    );
    assert_eq!(errors, 0);

    propagate_required_to_references(&mut environment);

    assert!(environment.definitions["chain-a"].is_required);
    assert!(environment.definitions["chain-b"].is_required);
}

#[test]
fn unreachable_compile_time_definition_is_noted_as_omitted() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(
        &mut environment,
        "(defmacro never-used (return true))\n(defun entry ())",
    );
    assert_eq!(errors, 0);
    assert!(evaluate_resolve_references(&mut environment));

    // The omitted flag is a note, not an error.
    assert_eq!(environment.error_count(), 0);
    assert!(environment.errors.iter().any(|diagnostic| diagnostic
        .render()
        .contains("never-used omitted (not required by module)")));
}

// ============================================================================
// S5: cyclic compile-time definitions cannot build
// ============================================================================

#[test]
fn cyclic_macros_are_refused_and_reported() {
    let (mut environment, cache) = test_environment();
    let errors = evaluate_source(
        &mut environment,
        "(defmacro cycle-a (cycle-b))\n\
         (defmacro cycle-b (cycle-a))\n\
         (defun entry () (cycle-a))",
    );
    assert_eq!(errors, 0);

    assert!(!evaluate_resolve_references(&mut environment));

    // Both sides of the cycle are waiting on the other; neither may guess.
    assert_eq!(
        environment.definitions["cycle-a"].references["cycle-b"].guess_state,
        GuessState::WaitingForLoad
    );
    assert_eq!(
        environment.definitions["cycle-b"].references["cycle-a"].guess_state,
        GuessState::WaitingForLoad
    );

    // Both are reported as failed builds, with their locations.
    for name in ["cycle-a", "cycle-b"] {
        assert!(environment.errors.iter().any(|diagnostic| {
            let rendered = diagnostic.render();
            rendered.contains(&format!("failed to build '{name}'"))
                && rendered.contains("test.cnd:")
        }));
    }

    // Nothing was queued, so the build driver never wrote any artifacts.
    let cache_entries = std::fs::read_dir(cache.path())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(cache_entries, 0);

    environment.destroy_expansions_invalidating_tokens();
}

// ============================================================================
// Termination and guess stability
// ============================================================================

#[test]
fn loop_terminates_when_only_guesses_remain() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(
        &mut environment,
        "(defun entry () (mystery-one) (mystery-two 3))",
    );
    assert_eq!(errors, 0);
    assert!(evaluate_resolve_references(&mut environment));
    assert_eq!(environment.error_count(), 0);

    let references = &environment.definitions["entry"].references;
    assert_eq!(references["mystery-one"].guess_state, GuessState::Guessed);
    assert_eq!(references["mystery-two"].guess_state, GuessState::Guessed);

    environment.destroy_expansions_invalidating_tokens();
}

#[test]
fn compile_time_definitions_keep_their_kind_through_the_pipeline() {
    let (mut environment, _cache) = test_environment();
    let errors = evaluate_source(
        &mut environment,
        "(defmacro some-macro (return true))\n\
         (defgenerator some-generator (return true))\n\
         (defun entry ())",
    );
    assert_eq!(errors, 0);
    assert_eq!(
        environment.definitions["some-macro"].kind,
        ObjectKind::CompileTimeMacro
    );
    assert_eq!(
        environment.definitions["some-generator"].kind,
        ObjectKind::CompileTimeGenerator
    );
}
