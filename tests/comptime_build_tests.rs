//! End-to-end compile-time builds: macros written in the source language,
//! compiled to shared libraries, loaded into this process, and invoked to
//! produce output.
//!
//! These tests spawn a real C++ compiler and dlopen the result, so they are
//! ignored by default; run them with `cargo test -- --ignored` on a machine
//! with `c++` on PATH.

use std::path::{Path, PathBuf};

use cinder::builder::evaluate_resolve_references;
use cinder::cli::evaluate_module_tokens;
use cinder::environment::{BuildOptions, EvaluatorEnvironment, GuessState};
use cinder::tokenizer::tokenize;
use cinder::writer::write_module_output;

const DOUBLE_IT_MODULE: &str = "\
(defun caller (&return int) (return (double-it 21)))
(defmacro double-it
  (cinder-tokens-push-open output tokens start-token-index)
  (cinder-tokens-push-symbol output \"*\" tokens start-token-index)
  (cinder-tokens-copy output tokens (+ start-token-index 2) (+ start-token-index 3))
  (cinder-tokens-push-symbol output \"2\" tokens start-token-index)
  (cinder-tokens-push-close output tokens start-token-index)
  (return true))
";

fn run_with_cache(source: &str, cache_dir: &Path) -> (EvaluatorEnvironment, bool) {
    let mut options = BuildOptions::default();
    options.cache_dir = cache_dir.to_path_buf();
    options.compiler = PathBuf::from("c++");
    let mut environment = EvaluatorEnvironment::new(options);

    environment.register_source("test.cnd", source);
    let tokens = tokenize("test.cnd", source).expect("test source should tokenize");
    let evaluation_errors = evaluate_module_tokens(&mut environment, &tokens);
    assert_eq!(evaluation_errors, 0, "module evaluation should be clean");

    let success = evaluate_resolve_references(&mut environment);
    (environment, success)
}

fn render_failures(environment: &EvaluatorEnvironment) -> String {
    environment
        .errors
        .iter()
        .map(|error| error.render())
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// S2: macro defined before use
// ============================================================================

#[test]
#[ignore = "requires a C++ toolchain on PATH"]
fn macro_before_use_builds_once_and_never_guesses() {
    let cache = tempfile::tempdir().expect("temp cache dir");
    let source = "\
(defmacro forty-two
  (cinder-tokens-push-symbol output \"42\" tokens start-token-index)
  (return true))
(defun answer (&return int)
  (return (forty-two)))
";
    let (mut environment, success) = run_with_cache(source, cache.path());
    assert!(success, "translation failed:\n{}", render_failures(&environment));

    // Loaded exactly once, and the call site went straight from
    // waiting-for-load to resolved without a speculative guess.
    assert!(environment.macros.contains_key("forty-two"));
    assert_eq!(
        environment.definitions["answer"].references["forty-two"].guess_state,
        GuessState::Resolved
    );

    let (source_text, _header_text) = write_module_output(&environment, "test.cnd", "test.hpp");
    assert!(
        source_text.contains("return 42;"),
        "expansion missing from output:\n{source_text}"
    );

    let compiled: Vec<_> = std::fs::read_dir(cache.path())
        .expect("cache dir readable")
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "cpp"))
        .collect();
    assert_eq!(compiled.len(), 1, "exactly one compile-time source expected");

    environment.destroy_expansions_invalidating_tokens();
}

// ============================================================================
// S3: use before macro definition
// ============================================================================

#[test]
#[ignore = "requires a C++ toolchain on PATH"]
fn use_before_macro_resolves_on_a_later_iteration() {
    let cache = tempfile::tempdir().expect("temp cache dir");
    let (mut environment, success) = run_with_cache(DOUBLE_IT_MODULE, cache.path());
    assert!(success, "translation failed:\n{}", render_failures(&environment));

    assert_eq!(
        environment.definitions["caller"].references["double-it"].guess_state,
        GuessState::Resolved
    );

    let (source_text, _header_text) = write_module_output(&environment, "test.cnd", "test.hpp");
    assert!(
        source_text.contains("return (21 * 2);"),
        "definitive expansion missing from output:\n{source_text}"
    );
    // The speculative emission must not survive next to the real one.
    assert_eq!(source_text.matches("double_it").count(), 0);

    environment.destroy_expansions_invalidating_tokens();
}

// ============================================================================
// S6: cache reuse and staleness
// ============================================================================

#[test]
#[ignore = "requires a C++ toolchain on PATH"]
fn identical_rerun_reuses_the_cached_library() {
    let cache = tempfile::tempdir().expect("temp cache dir");

    let (mut first_environment, success) = run_with_cache(DOUBLE_IT_MODULE, cache.path());
    assert!(
        success,
        "first translation failed:\n{}",
        render_failures(&first_environment)
    );
    first_environment.destroy_expansions_invalidating_tokens();
    drop(first_environment);

    let library_path = cache.path().join(format!(
        "{}comptime_double_it{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    ));
    let first_mtime = std::fs::metadata(&library_path)
        .expect("library built on first run")
        .modified()
        .expect("mtime available");

    // Identical rerun: generated source matches byte for byte, so neither
    // compile nor link runs and the library is untouched.
    let (mut second_environment, success) = run_with_cache(DOUBLE_IT_MODULE, cache.path());
    assert!(
        success,
        "second translation failed:\n{}",
        render_failures(&second_environment)
    );
    second_environment.destroy_expansions_invalidating_tokens();
    drop(second_environment);

    let second_mtime = std::fs::metadata(&library_path)
        .expect("library still present")
        .modified()
        .expect("mtime available");
    assert_eq!(first_mtime, second_mtime, "cached library was rebuilt");

    // Deleting the library forces exactly that definition to rebuild.
    std::fs::remove_file(&library_path).expect("remove library");
    let (mut third_environment, success) = run_with_cache(DOUBLE_IT_MODULE, cache.path());
    assert!(
        success,
        "third translation failed:\n{}",
        render_failures(&third_environment)
    );
    assert!(library_path.exists(), "library was not rebuilt");
    third_environment.destroy_expansions_invalidating_tokens();
}
