//! Requirement propagation, the staged build driver, and the outer
//! fixed-point loop.
//!
//! The driver's job is ordering: a macro or generator must be compiled,
//! linked, and loaded before the code it transforms can be emitted, while
//! definitions may refer to each other cyclically and out of order. Each
//! pass checks every required-but-unloaded definition's references, guesses
//! plain C/C++ calls for names nothing defines, refuses to queue definitions
//! still waiting on unloaded compile-time code, and builds what it can. The
//! outer loop alternates propagation and build passes until a pass resolves
//! nothing (or fails), then reports what never settled.

use std::fs;
use std::process::Command;

use tracing::{debug, trace};

use crate::comptime::{
    comptime_artifacts, file_more_recently_modified, generator_source_footer,
    generator_source_heading, load_compile_time_library, macro_source_footer,
    macro_source_heading, resolve_generator_entry, resolve_macro_entry, ComptimeArtifacts,
};
use crate::converters::lisp_name_to_c_name;
use crate::diagnostics::{error_at_token, note_at_token, note_for_token, ErrorKind};
use crate::environment::{
    EvaluatorEnvironment, GeneratorEntry, GuessState, MacroEntry, ObjectKind, ReferenceId,
};
use crate::evaluator::{evaluate_generate, invoke_function_generator_for_reference};
use crate::process::run_capped;
use crate::token::TokenRef;
use crate::writer::{write_comptime_source, write_if_contents_differ};

/// Bound on readiness re-scans per definition per pass. Guess emission can
/// synthesize new references, which re-scanning picks up; growth beyond this
/// means the reference list is not converging and something is wrong
/// internally.
const GUESS_RESCAN_LIMIT: usize = 100;

// ============================================================================
// REQUIREMENT PROPAGATION
// ============================================================================

/// Transitively marks definitions required, seeded by the module root's
/// `<global>` definition and anything created required at module scope.
pub fn propagate_required_to_references(environment: &mut EvaluatorEnvironment) {
    loop {
        let mut num_requires_changed = 0;

        let required_reference_names: Vec<String> = environment
            .definitions
            .values()
            .filter(|definition| definition.is_required)
            .flat_map(|definition| definition.references.keys().cloned())
            .collect();

        for referenced_name in required_reference_names {
            if let Some(definition) = environment.definitions.get_mut(&referenced_name) {
                if !definition.is_required {
                    trace!(
                        target: "dependency_propagation",
                        definition = %referenced_name,
                        "marking required"
                    );
                    definition.is_required = true;
                    num_requires_changed += 1;
                }
            }
        }

        if num_requires_changed == 0 {
            break;
        }
    }
}

// ============================================================================
// BUILD DRIVER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildStage {
    None,
    Compiling,
    Linking,
    Loading,
    ResolvingReferences,
    Finished,
}

struct BuildObject {
    #[allow(dead_code)]
    build_id: u32,
    status: Option<i32>,
    stage: BuildStage,
    artifacts: ComptimeArtifacts,
    definition_name: String,
    name_token: TokenRef,
    kind: ObjectKind,
}

/// Outcome of one definition's readiness check.
struct Readiness {
    can_build: bool,
    has_guessed_refs: bool,
    has_relevant_change: bool,
}

fn reference_status_state(
    environment: &EvaluatorEnvironment,
    definition_name: &str,
    reference_name: &str,
) -> Option<GuessState> {
    environment
        .definitions
        .get(definition_name)?
        .references
        .get(reference_name)
        .map(|status| status.guess_state)
}

fn transition_reference_status(
    environment: &mut EvaluatorEnvironment,
    definition_name: &str,
    reference_name: &str,
    next: GuessState,
) -> bool {
    environment
        .definitions
        .get_mut(definition_name)
        .and_then(|definition| definition.references.get_mut(reference_name))
        .map(|status| status.transition(next))
        .unwrap_or(false)
}

/// Runs the function-invocation generator over every site of one reference
/// status. The site list can grow while this runs (guess emission may
/// synthesize new references), so iteration is by index against a fresh
/// lookup each time.
fn generate_invocations_for_status(
    environment: &mut EvaluatorEnvironment,
    definition_name: &str,
    reference_name: &str,
) -> bool {
    let mut all_succeeded = true;
    let mut site_index = 0;
    loop {
        let reference_id = {
            let Some(status) = environment
                .definitions
                .get(definition_name)
                .and_then(|definition| definition.references.get(reference_name))
            else {
                break;
            };
            if site_index >= status.references.len() {
                break;
            }
            status.references[site_index]
        };
        if !invoke_function_generator_for_reference(environment, reference_id) {
            all_succeeded = false;
        }
        site_index += 1;
    }
    all_succeeded
}

/// Decides whether `definition_name` can enter the build queue, resolving
/// and guessing its references along the way.
fn check_definition_readiness(
    environment: &mut EvaluatorEnvironment,
    definition_name: &str,
    name_token: &TokenRef,
) -> Readiness {
    let mut readiness = Readiness {
        can_build: true,
        has_guessed_refs: false,
        has_relevant_change: false,
    };

    let mut rescan_count = 0;
    loop {
        let mut guess_maybe_dirtied_references = false;

        let reference_names: Vec<String> = match environment.definitions.get(definition_name) {
            Some(definition) => definition.references.keys().cloned().collect(),
            None => return readiness,
        };

        for reference_name in reference_names {
            let referenced = environment
                .definitions
                .get(&reference_name)
                .map(|definition| (definition.kind, definition.is_loaded));

            match referenced {
                Some((kind, is_loaded)) if kind.is_compile_time() => {
                    if is_loaded {
                        // Built objects resolve their references as they
                        // load; react if the last thing done here was an
                        // incorrect C call guess.
                        let prior =
                            reference_status_state(environment, definition_name, &reference_name);
                        if prior != Some(GuessState::Resolved) {
                            debug!(
                                target: "build_reasons",
                                reference = %reference_name,
                                "required compile-time code has been loaded"
                            );
                            readiness.has_relevant_change = true;
                        }
                        transition_reference_status(
                            environment,
                            definition_name,
                            &reference_name,
                            GuessState::Resolved,
                        );
                    } else {
                        // A compile-time function is known to be missing;
                        // guessing is not permitted.
                        debug!(
                            target: "build_reasons",
                            reference = %reference_name,
                            "cannot build until reference is loaded"
                        );
                        transition_reference_status(
                            environment,
                            definition_name,
                            &reference_name,
                            GuessState::WaitingForLoad,
                        );
                        readiness.can_build = false;
                    }
                }
                Some((ObjectKind::Function, _)) => {
                    // A known function written in this language; emit the
                    // invocation at every site.
                    let prior =
                        reference_status_state(environment, definition_name, &reference_name);
                    if prior != Some(GuessState::Resolved) {
                        if !generate_invocations_for_status(
                            environment,
                            definition_name,
                            &reference_name,
                        ) {
                            readiness.can_build = false;
                        }
                        transition_reference_status(
                            environment,
                            definition_name,
                            &reference_name,
                            GuessState::Resolved,
                        );
                    }
                }
                Some(_) => {}
                None => {
                    match reference_status_state(environment, definition_name, &reference_name) {
                        Some(GuessState::None) => {
                            debug!(
                                target: "build_reasons",
                                reference = %reference_name,
                                "unknown reference; guessing C/C++ function call"
                            );
                            if !generate_invocations_for_status(
                                environment,
                                definition_name,
                                &reference_name,
                            ) {
                                readiness.can_build = false;
                            }
                            transition_reference_status(
                                environment,
                                definition_name,
                                &reference_name,
                                GuessState::Guessed,
                            );
                            readiness.has_relevant_change = true;
                            readiness.has_guessed_refs = true;
                            guess_maybe_dirtied_references = true;
                        }
                        Some(GuessState::Guessed) => {
                            // Still guessed, still not in definitions.
                            readiness.has_guessed_refs = true;
                        }
                        _ => {}
                    }
                }
            }
        }

        if !guess_maybe_dirtied_references {
            break;
        }
        rescan_count += 1;
        if rescan_count > GUESS_RESCAN_LIMIT {
            environment.push_error(error_at_token(
                ErrorKind::InternalInconsistency {
                    message: format!(
                        "reference list of '{definition_name}' kept growing during guess \
                         emission; refusing to queue it"
                    ),
                },
                name_token.token(),
            ));
            readiness.can_build = false;
            break;
        }
    }

    readiness
}

/// One build pass: checks every required-but-unloaded definition, then runs
/// the staged sub-passes (write source, compile, link, load-and-resolve)
/// over everything that qualified. Returns the number of references
/// resolved; errors land in the environment's diagnostics.
pub fn build_evaluate_references(environment: &mut EvaluatorEnvironment) -> usize {
    let mut num_references_resolved = 0;

    let definitions_to_check: Vec<(String, TokenRef)> = environment
        .definition_order
        .iter()
        .filter_map(|name| {
            let definition = environment.definitions.get(name)?;
            if definition.is_required && !definition.is_loaded {
                Some((name.clone(), definition.name.clone()))
            } else {
                None
            }
        })
        .collect();

    let mut definitions_to_build: Vec<BuildObject> = Vec::new();
    for (definition_name, name_token) in definitions_to_check {
        debug!(target: "build_reasons", definition = %definition_name, "checking to build");

        let readiness = check_definition_readiness(environment, &definition_name, &name_token);

        let Some(definition) = environment.definitions.get(&definition_name) else {
            continue;
        };
        // Rebuilding a definition whose only changes are still-missing
        // references gains nothing; a resolved or newly guessed reference
        // does. Normal functions go through the readiness check too (their
        // references need resolving) but only compile-time objects build.
        if readiness.can_build
            && (!readiness.has_guessed_refs || readiness.has_relevant_change)
            && definition.kind.is_compile_time()
        {
            let artifacts = comptime_artifacts(
                &environment.options.cache_dir,
                crate::converters::NameStyleMode::Underscores,
                &definition_name,
            );
            let kind = definition.kind;
            definitions_to_build.push(BuildObject {
                build_id: environment.next_build_id(),
                status: None,
                stage: BuildStage::None,
                artifacts,
                definition_name,
                name_token,
                kind,
            });
        }
    }

    if definitions_to_build.is_empty() {
        return 0;
    }

    if let Err(io_error) = fs::create_dir_all(&environment.options.cache_dir) {
        environment.push_error(crate::diagnostics::CinderError::new(ErrorKind::Io {
            message: format!(
                "could not create cache directory {}: {io_error}",
                environment.options.cache_dir.display()
            ),
        }));
        return 0;
    }

    // --- Write sources, then compile as one capped wave. --------------------
    let mut compile_commands: Vec<(usize, Command)> = Vec::new();
    for build_index in 0..definitions_to_build.len() {
        let build_object = &definitions_to_build[build_index];
        debug!(target: "build_process", definition = %build_object.definition_name, "building");

        let source_text = {
            let Some(definition) = environment.definitions.get(&build_object.definition_name)
            else {
                continue;
            };
            let (heading, footer) = match definition.kind {
                ObjectKind::CompileTimeGenerator => {
                    (generator_source_heading(), generator_source_footer())
                }
                _ => (macro_source_heading(), macro_source_footer()),
            };
            write_comptime_source(environment, &definition.output, &heading, footer)
        };

        if let Err(io_error) =
            write_if_contents_differ(&build_object.artifacts.source_path, &source_text)
        {
            let error = error_at_token(
                ErrorKind::BuildFailure {
                    name: build_object.definition_name.clone(),
                    message: format!("could not write compile-time source: {io_error}"),
                },
                build_object.name_token.token(),
            );
            environment.push_error(error);
            continue;
        }

        let build_object = &mut definitions_to_build[build_index];
        build_object.stage = BuildStage::Compiling;

        if !file_more_recently_modified(
            &build_object.artifacts.source_path,
            &build_object.artifacts.library_path,
        ) {
            debug!(
                target: "build_process",
                definition = %build_object.definition_name,
                "skipping compile and link (cached library is current)"
            );
            build_object.stage = BuildStage::Linking;
            build_object.status = Some(0);
            continue;
        }

        let mut command = Command::new(&environment.options.compiler);
        command
            .arg("-g")
            .arg("-c")
            .arg(&build_object.artifacts.source_path)
            .arg("-o")
            .arg(&build_object.artifacts.object_path)
            .arg("-fPIC");
        if let Some(include_dir) = &environment.options.include_dir {
            command.arg(format!("-I{}", include_dir.display()));
        }
        compile_commands.push((build_index, command));
    }

    let compile_results = run_capped(compile_commands, environment.options.max_processes);
    for (build_index, status) in compile_results {
        match status {
            Ok(code) => definitions_to_build[build_index].status = Some(code),
            Err(process_error) => {
                let build_object = &mut definitions_to_build[build_index];
                build_object.status = Some(-1);
                let error = error_at_token(
                    ErrorKind::BuildFailure {
                        name: build_object.definition_name.clone(),
                        message: process_error.to_string(),
                    },
                    build_object.name_token.token(),
                );
                environment.push_error(error);
            }
        }
    }

    // --- Link wave. ---------------------------------------------------------
    let mut link_commands: Vec<(usize, Command)> = Vec::new();
    for build_index in 0..definitions_to_build.len() {
        let build_object = &mut definitions_to_build[build_index];
        if build_object.stage != BuildStage::Compiling {
            continue;
        }
        if build_object.status != Some(0) {
            let error = error_at_token(
                ErrorKind::BuildFailure {
                    name: build_object.definition_name.clone(),
                    message: format!(
                        "compile exited with status {}",
                        build_object.status.unwrap_or(-1)
                    ),
                },
                build_object.name_token.token(),
            );
            environment.push_error(error);
            continue;
        }
        build_object.stage = BuildStage::Linking;
        debug!(
            target: "build_process",
            definition = %build_object.definition_name,
            "compiled successfully"
        );

        let mut command = Command::new(&environment.options.compiler);
        command
            .arg("-shared")
            .arg("-o")
            .arg(&build_object.artifacts.library_path)
            .arg(&build_object.artifacts.object_path);
        link_commands.push((build_index, command));
    }

    // Cache-hit objects sit in the Linking stage with status 0 already and
    // spawn nothing here.
    let link_results = run_capped(link_commands, environment.options.max_processes);
    for (build_index, status) in link_results {
        match status {
            Ok(code) => definitions_to_build[build_index].status = Some(code),
            Err(process_error) => {
                let build_object = &mut definitions_to_build[build_index];
                build_object.status = Some(-1);
                let error = error_at_token(
                    ErrorKind::BuildFailure {
                        name: build_object.definition_name.clone(),
                        message: process_error.to_string(),
                    },
                    build_object.name_token.token(),
                );
                environment.push_error(error);
            }
        }
    }

    // --- Load and resolve. ---------------------------------------------------
    for build_index in 0..definitions_to_build.len() {
        if definitions_to_build[build_index].stage != BuildStage::Linking {
            continue;
        }
        if definitions_to_build[build_index].status != Some(0) {
            let build_object = &definitions_to_build[build_index];
            let error = error_at_token(
                ErrorKind::BuildFailure {
                    name: build_object.definition_name.clone(),
                    message: format!(
                        "link exited with status {}",
                        build_object.status.unwrap_or(-1)
                    ),
                },
                build_object.name_token.token(),
            );
            environment.push_error(error);
            continue;
        }
        definitions_to_build[build_index].stage = BuildStage::Loading;

        let definition_name = definitions_to_build[build_index].definition_name.clone();
        let name_token = definitions_to_build[build_index].name_token.clone();
        let artifacts = definitions_to_build[build_index].artifacts.clone();
        let kind = definitions_to_build[build_index].kind;
        debug!(target: "build_process", definition = %definition_name, "linked successfully");

        let library = match load_compile_time_library(&artifacts.library_path) {
            Ok(library) => library,
            Err(load_error) => {
                environment.push_error(error_at_token(
                    ErrorKind::BuildFailure {
                        name: definition_name,
                        message: load_error.to_string(),
                    },
                    name_token.token(),
                ));
                continue;
            }
        };

        // The entry symbol uses the same conversion the signature was
        // emitted with.
        let entry_symbol =
            lisp_name_to_c_name(environment.options.function_name_mode, &definition_name);
        let install_result = match kind {
            ObjectKind::CompileTimeMacro => resolve_macro_entry(&library, &entry_symbol)
                .map(|entry| {
                    environment
                        .macros
                        .insert(definition_name.clone(), MacroEntry::Loaded(entry));
                }),
            ObjectKind::CompileTimeGenerator => resolve_generator_entry(&library, &entry_symbol)
                .map(|entry| {
                    environment
                        .generators
                        .insert(definition_name.clone(), GeneratorEntry::Loaded(entry));
                }),
            ObjectKind::Function => {
                debug!(target: "build_process", "runtime function reached the load stage; skipping");
                continue;
            }
        };
        if let Err(load_error) = install_result {
            environment.push_error(error_at_token(
                ErrorKind::BuildFailure {
                    name: definition_name,
                    message: load_error.to_string(),
                },
                name_token.token(),
            ));
            continue;
        }
        environment.loaded_libraries.push(library);
        definitions_to_build[build_index].stage = BuildStage::ResolvingReferences;

        // Every site naming this definition can now be evaluated
        // definitively.
        let pool: Vec<ReferenceId> = match environment.reference_pools.get(&definition_name) {
            Some(pool) => pool.clone(),
            None => {
                environment.push_error(error_at_token(
                    ErrorKind::InternalInconsistency {
                        message: format!(
                            "built '{definition_name}', which has no references; it should not \
                             have been required"
                        ),
                    },
                    name_token.token(),
                ));
                continue;
            }
        };

        for reference_id in pool {
            if environment.references[reference_id.0].is_resolved {
                continue;
            }
            let (tokens, start_index, context, splice) = {
                let reference = &environment.references[reference_id.0];
                (
                    reference.tokens.clone(),
                    reference.start_index,
                    reference.context.clone(),
                    reference.splice,
                )
            };
            trace!(
                target: "build_process",
                reference = %definition_name,
                "resolving reference"
            );

            // A prior pass may have guessed this site as a plain C/C++
            // call; the definitive evaluation starts from a clean buffer.
            let mut splice_output = environment.take_splice(splice);
            splice_output.clear();
            evaluate_generate(environment, &context, &tokens, start_index, &mut splice_output);
            environment.restore_splice(splice, splice_output);

            // Resolved as far as the driver cares, whatever evaluation
            // turned up; retrying would not change the error count. New
            // references to this definition are recognized on sight now
            // that it is loaded.
            environment.references[reference_id.0].is_resolved = true;
            num_references_resolved += 1;
        }

        if let Some(definition) = environment.definitions.get_mut(&definition_name) {
            definition.is_loaded = true;
        }
        definitions_to_build[build_index].stage = BuildStage::Finished;
        debug!(
            target: "build_process",
            definition = %definition_name,
            resolved = num_references_resolved,
            "successfully built, loaded, and executed"
        );
    }

    num_references_resolved
}

// ============================================================================
// FIXED-POINT LOOP
// ============================================================================

/// Alternates requirement propagation and build passes until a pass resolves
/// zero references or reports an error, then checks that everything
/// required actually settled. A reference that ends guessed-and-still-
/// unknown is a success: the guess becomes the final emission, validated by
/// the downstream C/C++ compiler.
pub fn evaluate_resolve_references(environment: &mut EvaluatorEnvironment) -> bool {
    crate::evaluator::debug_print_references(environment);

    loop {
        propagate_required_to_references(environment);
        let errors_before_pass = environment.error_count();
        let num_resolved = build_evaluate_references(environment);
        if environment.error_count() > errors_before_pass {
            break;
        }
        if num_resolved == 0 {
            break;
        }
    }

    // Final report.
    for definition_name in environment.definition_order.clone() {
        let Some(definition) = environment.definitions.get(&definition_name) else {
            continue;
        };

        if !definition.is_required {
            let note = note_at_token(
                format!("{definition_name} omitted (not required by module)"),
                definition.name.token(),
            );
            environment.push_error(note);
            continue;
        }

        if definition.kind.is_compile_time() {
            if !environment.is_compile_time_code_loaded(definition) {
                let error = error_at_token(
                    ErrorKind::BuildFailure {
                        name: definition_name.clone(),
                        message: "required object was never built and loaded".into(),
                    },
                    definition.name.token(),
                );
                environment.push_error(error);
            }
            continue;
        }

        // Runtime definitions need every reference resolved or guessed.
        let mut unresolved: Vec<(String, TokenRef)> = Vec::new();
        let mut missing_compile_time: Vec<TokenRef> = Vec::new();
        for (reference_name, status) in &definition.references {
            if let Some(referenced) = environment.definitions.get(reference_name) {
                if referenced.kind.is_compile_time()
                    && !environment.is_compile_time_code_loaded(referenced)
                {
                    missing_compile_time.push(referenced.name.clone());
                }
            }
            if status.guess_state == GuessState::None {
                unresolved.push((reference_name.clone(), status.name.clone()));
            }
        }
        let definition_name_token = definition.name.clone();

        for (reference_name, reference_token) in unresolved {
            let error = error_at_token(
                ErrorKind::UnresolvedReference {
                    name: reference_name,
                },
                reference_token.token(),
            );
            environment.push_error(error);
        }
        if !missing_compile_time.is_empty() {
            let mut error = error_at_token(
                ErrorKind::BuildFailure {
                    name: definition_name.clone(),
                    message: "definition depends on compile-time code that never loaded".into(),
                },
                definition_name_token.token(),
            );
            for missing in &missing_compile_time {
                error = error.with_note(note_for_token(
                    "missing compile-time function defined here",
                    missing.token(),
                ));
            }
            environment.push_error(error);
        }
    }

    environment.error_count() == 0
}
