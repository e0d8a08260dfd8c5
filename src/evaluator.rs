//! Recursive evaluator and invocation dispatcher.
//!
//! [`evaluate_generate`] walks one token position: literals and symbols are
//! emitted directly, invocations are routed by [`handle_invocation`] to a
//! macro, a generator, a known function, or deferred as an unresolved
//! reference for the build driver to come back to. Only the build driver
//! decides whether an unresolved reference becomes a plain C/C++ call.
//!
//! Error posture: evaluation continues past errors, accumulating a count, so
//! one pass reports as many diagnostics as possible. Token arrays are
//! paren-validated before they get here and are trusted blindly.

use tracing::debug;

use crate::diagnostics::{error_at_token, note_at_token, DiagnosticNote, ErrorKind};
use crate::environment::{
    EvaluatorContext, EvaluatorEnvironment, EvaluatorScope, ObjectReference, ReferenceId,
    GuessState,
};
use crate::generators;
use crate::output::{
    add_lang_token_output, add_splice_output, add_string_output, GeneratorOutput, OutputMod,
    StringOutput,
};
use crate::token::{
    find_close_paren, pretty_print_tokens, validate_parentheses, TokenKind, TokenRef, TokenSlice,
};

/// Dispatches a generator, expands a macro and evaluates its output
/// recursively, or records an unresolved reference for the build driver.
fn handle_invocation(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    let invocation_start = TokenRef::new(tokens, invocation_start_index);
    let invocation_name = TokenRef::new(tokens, invocation_start_index + 1);
    if invocation_name.token().kind != TokenKind::Symbol {
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: format!(
                    "expected symbol at invocation head, found {}",
                    invocation_name.token().kind.as_str()
                ),
            },
            invocation_name.token(),
        ));
        return false;
    }
    let name = invocation_name.contents().to_string();

    if let Some(invoked_macro) = environment.find_macro(&name) {
        // Each expansion gets a fresh vector: token arrays must stay
        // immutable once anything points into them.
        let mut expansion_tokens: Vec<crate::token::Token> = Vec::new();
        let succeeded = invoked_macro.invoke(
            environment,
            context,
            tokens,
            invocation_start_index,
            &mut expansion_tokens,
        );

        if !succeeded {
            environment.push_error(error_at_token(
                ErrorKind::MacroFailure {
                    name,
                    message: "returned failure".into(),
                },
                invocation_name.token(),
            ));
            return false;
        }

        // No output is fine; nothing to evaluate.
        if expansion_tokens.is_empty() {
            return true;
        }

        if let Err(imbalance) = validate_parentheses(&expansion_tokens) {
            let dump = pretty_print_tokens(&expansion_tokens);
            environment.push_error(imbalance);
            environment.push_error(
                error_at_token(
                    ErrorKind::MacroFailure {
                        name,
                        message: "produced unbalanced parentheses".into(),
                    },
                    invocation_name.token(),
                )
                .with_note(DiagnosticNote {
                    message: format!("erroneous macro expansion:\n{dump}"),
                    location: None,
                }),
            );
            return false;
        }

        // The expansion now lives as long as the environment: output
        // fragments and reference statuses may hold pointers into it even
        // if evaluation below fails.
        let expansion: TokenSlice = expansion_tokens.into();
        environment.macro_expansions.push(expansion.clone());

        // Macros inherit the current context, unlike bodies.
        let expansion_errors =
            evaluate_generate_all(environment, context, &expansion, 0, None, output);
        if expansion_errors != 0 {
            let dump = pretty_print_tokens(&expansion);
            environment.push_error(
                note_at_token(
                    format!("code was generated from macro. See macro expansion below:\n{dump}"),
                    invocation_start.token(),
                ),
            );
            return false;
        }

        return true;
    }

    if let Some(invoked_generator) = environment.find_generator(&name) {
        return invoked_generator.invoke(
            environment,
            context,
            tokens,
            invocation_start_index,
            output,
        );
    }

    // Known functions written in this language can be emitted immediately.
    if environment
        .definitions
        .get(&name)
        .is_some_and(|definition| !definition.kind.is_compile_time())
    {
        return generators::function_invocation(
            environment,
            context,
            tokens,
            invocation_start_index,
            output,
        );
    }

    // Unknown. This could be a macro or generator that has not been defined
    // yet, so no C/C++ guess is made here. Reserve the site's position with
    // a splice sentinel and leave a note for the build driver.
    let splice = environment.new_splice();
    add_splice_output(&mut output.source, splice, &invocation_start);

    let reference = ObjectReference {
        tokens: tokens.clone(),
        start_index: invocation_start_index,
        context: context.clone(),
        splice,
        is_resolved: false,
    };
    let Some((reference_id, prior_guess)) =
        environment.add_object_reference(&invocation_name, reference)
    else {
        environment.push_error(error_at_token(
            ErrorKind::InternalInconsistency {
                message: "failed to create reference status".into(),
            },
            invocation_start.token(),
        ));
        return false;
    };

    // The build driver believes it has already guessed every site for this
    // status; match the speculation for the site it has not seen yet.
    if prior_guess == GuessState::Guessed {
        debug!(target: "references", reference = %name, "duplicating prior guess at new site");
        if !invoke_function_generator_for_reference(environment, reference_id) {
            return false;
        }
    }

    // Evaluation is not complete, but the reference bookkeeping is; the
    // build driver finishes the job once the name is understood.
    true
}

/// Runs the built-in function-invocation generator into a reference's splice
/// buffer. Used for speculative guesses and for references to known
/// functions.
pub(crate) fn invoke_function_generator_for_reference(
    environment: &mut EvaluatorEnvironment,
    reference_id: ReferenceId,
) -> bool {
    let (tokens, start_index, context, splice) = {
        let reference = &environment.references[reference_id.0];
        (
            reference.tokens.clone(),
            reference.start_index,
            reference.context.clone(),
            reference.splice,
        )
    };
    let mut splice_output = environment.take_splice(splice);
    let succeeded = generators::function_invocation(
        environment,
        &context,
        &tokens,
        start_index,
        &mut splice_output,
    );
    environment.restore_splice(splice, splice_output);
    succeeded
}

/// Evaluates the single token position at `start_token_index`, returning the
/// number of errors encountered.
pub fn evaluate_generate(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    start_token_index: usize,
    output: &mut GeneratorOutput,
) -> usize {
    let token = &tokens[start_token_index];

    match token.kind {
        TokenKind::OpenParen => {
            // Invocation of a macro, generator, or function.
            let succeeded =
                handle_invocation(environment, context, tokens, start_token_index, output);
            usize::from(!succeeded)
        }
        TokenKind::CloseParen => {
            // End of the enclosing body or file; entirely normal on
            // validated input.
            0
        }
        TokenKind::Symbol | TokenKind::String => {
            if context.scope != EvaluatorScope::ExpressionsOnly {
                environment.push_error(error_at_token(
                    ErrorKind::InvalidScope {
                        what: format!("evaluated constant or symbol '{}'", token.contents),
                        expected: EvaluatorScope::ExpressionsOnly.as_str(),
                    },
                    token,
                ));
                return 1;
            }

            let origin = TokenRef::new(tokens, start_token_index);
            if token.kind == TokenKind::String {
                add_string_output(
                    &mut output.source,
                    token.contents.clone(),
                    OutputMod::SURROUND_WITH_QUOTES,
                    &origin,
                );
                return 0;
            }

            let mut characters = token.contents.chars();
            let first = characters.next().unwrap_or('\0');
            let second = characters.next().unwrap_or('\0');
            let is_literal = first == '\''
                || first.is_ascii_digit()
                || (first == '-' && (second == '.' || second.is_ascii_digit()));
            if is_literal {
                // Character, integer, and floating constants pass through.
                add_string_output(
                    &mut output.source,
                    token.contents.clone(),
                    OutputMod::empty(),
                    &origin,
                );
            } else if environment.options.enable_hot_reloading
                && context.module_environment.as_ref().is_some_and(|module| {
                    module
                        .borrow()
                        .state_variables
                        .contains_key(&token.contents)
                })
            {
                // State variables are stored behind pointers when hot reload
                // is on; every access goes through a dereference.
                add_lang_token_output(&mut output.source, OutputMod::OPEN_PAREN, &origin);
                add_string_output(&mut output.source, "*", OutputMod::empty(), &origin);
                add_string_output(
                    &mut output.source,
                    token.contents.clone(),
                    OutputMod::CONVERT_VARIABLE_NAME,
                    &origin,
                );
                add_lang_token_output(&mut output.source, OutputMod::CLOSE_PAREN, &origin);
            } else {
                add_string_output(
                    &mut output.source,
                    token.contents.clone(),
                    OutputMod::CONVERT_VARIABLE_NAME,
                    &origin,
                );
            }
            0
        }
    }
}

/// Evaluates sibling positions from `start_token_index` until the enclosing
/// close paren (or the end of the array, for modules), inserting
/// `delimiter_template` between siblings. Returns the error count.
pub fn evaluate_generate_all(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    start_token_index: usize,
    delimiter_template: Option<&StringOutput>,
    output: &mut GeneratorOutput,
) -> usize {
    let mut num_errors = 0;

    let mut current_token_index = start_token_index;
    while current_token_index < tokens.len() {
        if tokens[current_token_index].kind == TokenKind::CloseParen {
            // End of an argument list or body; only modules reach the end of
            // the array.
            break;
        }

        if let Some(template) = delimiter_template {
            if current_token_index != start_token_index {
                let mut delimiter = template.clone();
                delimiter.origin = Some(TokenRef::new(tokens, current_token_index));
                output.source.push(delimiter);
            }
        }

        num_errors +=
            evaluate_generate(environment, context, tokens, current_token_index, output);

        if tokens[current_token_index].kind == TokenKind::OpenParen {
            // Skip the invocation body, including its close paren.
            current_token_index = find_close_paren(tokens, current_token_index);
        }
        current_token_index += 1;
    }

    num_errors
}

/// Prints a short description of every definition and its references, for
/// `--verbose` style debugging.
pub fn debug_print_references(environment: &EvaluatorEnvironment) {
    for name in &environment.definition_order {
        let Some(definition) = environment.definitions.get(name) else {
            continue;
        };
        debug!(
            target: "references",
            kind = definition.kind.as_str(),
            definition = %name,
            references = ?definition.references.keys().collect::<Vec<_>>(),
        );
    }
}
