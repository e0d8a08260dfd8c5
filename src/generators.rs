//! Built-in generators for language constructs.
//!
//! Everything the evaluator can emit without compile-time code lives here:
//! definition forms (`defun`, `defmacro`, `defgenerator`, `var`), statement
//! forms (`return`, `set`, `if`, `while`), expression operators, `c-import`,
//! and the function-invocation generator the dispatcher and build driver use
//! for known functions and speculative guesses.

use crate::diagnostics::{error_at_token, ErrorKind};
use crate::environment::{
    EvaluatorContext, EvaluatorEnvironment, EvaluatorScope, GeneratorEntry, ObjectDefinition,
    ObjectKind,
};
use crate::evaluator::{evaluate_generate, evaluate_generate_all};
use crate::output::{
    add_lang_token_output, add_string_output, GeneratorOutput, OutputMod, StringOutput,
};
use crate::token::{find_close_paren, TokenKind, TokenRef, TokenSlice};

/// Installs every built-in generator. Called once at environment
/// construction.
pub fn register_builtins(environment: &mut EvaluatorEnvironment) {
    let table = &mut environment.generators;
    table.insert("defun".into(), GeneratorEntry::Native(defun_generator));
    table.insert("defmacro".into(), GeneratorEntry::Native(defmacro_generator));
    table.insert(
        "defgenerator".into(),
        GeneratorEntry::Native(defgenerator_generator),
    );
    table.insert("var".into(), GeneratorEntry::Native(variable_generator));
    table.insert("return".into(), GeneratorEntry::Native(return_generator));
    table.insert("set".into(), GeneratorEntry::Native(set_generator));
    table.insert("if".into(), GeneratorEntry::Native(if_generator));
    table.insert("while".into(), GeneratorEntry::Native(while_generator));
    table.insert("c-import".into(), GeneratorEntry::Native(c_import_generator));

    for operator in ["+", "-", "*", "/", "%", "=", "!=", "<", "<=", ">", ">="] {
        table.insert(
            operator.into(),
            GeneratorEntry::Native(binary_operator_generator),
        );
    }
}

// ============================================================================
// ARGUMENT HELPERS
// ============================================================================

fn expect_symbol(
    environment: &mut EvaluatorEnvironment,
    tokens: &TokenSlice,
    index: usize,
    end_index: usize,
    what: &str,
) -> bool {
    if index >= end_index {
        let token = &tokens[end_index];
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: format!("expected {what}"),
            },
            token,
        ));
        return false;
    }
    if tokens[index].kind != TokenKind::Symbol {
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: format!(
                    "expected {what}, found {}",
                    tokens[index].kind.as_str()
                ),
            },
            &tokens[index],
        ));
        return false;
    }
    true
}

fn argument_delimiter() -> StringOutput {
    StringOutput::delimiter(",", OutputMod::SPACE_AFTER)
}

// ============================================================================
// DEFINITION FORMS
// ============================================================================

/// `(defun name (arg type ... &return type) statements...)`
///
/// Emits the signature to both streams of the definition's own output, the
/// body to the source stream, and registers a `Function` definition.
fn defun_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    _output: &mut GeneratorOutput,
) -> bool {
    let invocation_end = find_close_paren(tokens, invocation_start_index);
    let name_index = invocation_start_index + 2;
    if !expect_symbol(environment, tokens, name_index, invocation_end, "function name") {
        return false;
    }
    let name = TokenRef::new(tokens, name_index);

    let argument_list_index = name_index + 1;
    if argument_list_index >= invocation_end
        || tokens[argument_list_index].kind != TokenKind::OpenParen
    {
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: "expected argument list".into(),
            },
            &tokens[name_index],
        ));
        return false;
    }
    let argument_list_end = find_close_paren(tokens, argument_list_index);

    // Arguments are (name type) pairs; `&return type` ends the list.
    let mut parameters: Vec<(TokenRef, TokenRef)> = Vec::new();
    let mut return_type: Option<TokenRef> = None;
    let mut argument_index = argument_list_index + 1;
    while argument_index < argument_list_end {
        if !expect_symbol(
            environment,
            tokens,
            argument_index,
            argument_list_end,
            "argument name, type, or &return",
        ) {
            return false;
        }
        if tokens[argument_index].contents == "&return" {
            if !expect_symbol(
                environment,
                tokens,
                argument_index + 1,
                argument_list_end,
                "return type after &return",
            ) {
                return false;
            }
            return_type = Some(TokenRef::new(tokens, argument_index + 1));
            argument_index += 2;
            continue;
        }
        if !expect_symbol(
            environment,
            tokens,
            argument_index + 1,
            argument_list_end,
            "argument type",
        ) {
            return false;
        }
        parameters.push((
            TokenRef::new(tokens, argument_index),
            TokenRef::new(tokens, argument_index + 1),
        ));
        argument_index += 2;
    }

    // The definition must exist before the body is evaluated so references
    // made by the body are attributed to it.
    let definition = ObjectDefinition::new(name.clone(), ObjectKind::Function, context.is_required);
    if !environment.add_object_definition(definition) {
        return false;
    }

    let mut function_output = GeneratorOutput::new();
    for stream_is_header in [true, false] {
        let stream = if stream_is_header {
            &mut function_output.header
        } else {
            &mut function_output.source
        };
        match &return_type {
            Some(type_token) => add_string_output(
                stream,
                type_token.contents(),
                OutputMod::CONVERT_VARIABLE_NAME | OutputMod::SPACE_AFTER,
                type_token,
            ),
            None => add_string_output(stream, "void", OutputMod::SPACE_AFTER, &name),
        }
        add_string_output(stream, name.contents(), OutputMod::CONVERT_VARIABLE_NAME, &name);
        add_lang_token_output(stream, OutputMod::OPEN_PAREN, &name);
        for (parameter_index, (parameter_name, parameter_type)) in parameters.iter().enumerate() {
            if parameter_index != 0 {
                stream.push(argument_delimiter());
            }
            add_string_output(
                stream,
                parameter_type.contents(),
                OutputMod::CONVERT_VARIABLE_NAME | OutputMod::SPACE_AFTER,
                parameter_type,
            );
            add_string_output(
                stream,
                parameter_name.contents(),
                OutputMod::CONVERT_VARIABLE_NAME,
                parameter_name,
            );
        }
        add_lang_token_output(stream, OutputMod::CLOSE_PAREN, &name);
        if stream_is_header {
            add_lang_token_output(stream, OutputMod::END_STATEMENT, &name);
        }
    }

    add_string_output(&mut function_output.source, "{", OutputMod::NEWLINE_AFTER, &name);
    let body_context = context.for_definition(name.clone(), EvaluatorScope::Body);
    let body_errors = evaluate_generate_all(
        environment,
        &body_context,
        tokens,
        argument_list_end + 1,
        None,
        &mut function_output,
    );
    add_string_output(&mut function_output.source, "}", OutputMod::NEWLINE_AFTER, &name);

    environment
        .definitions
        .get_mut(name.contents())
        .expect("definition was just added")
        .output = function_output;

    body_errors == 0
}

/// Shared body of `defmacro` and `defgenerator`. The emitted entry point
/// follows the compile-time ABI: the heading template (see the comptime
/// module) declares the handle types and bridge prototypes this signature
/// uses.
fn compile_time_definition(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    kind: ObjectKind,
    output_parameter: &str,
) -> bool {
    let invocation_end = find_close_paren(tokens, invocation_start_index);
    let name_index = invocation_start_index + 2;
    if !expect_symbol(
        environment,
        tokens,
        name_index,
        invocation_end,
        "compile-time definition name",
    ) {
        return false;
    }
    let name = TokenRef::new(tokens, name_index);

    // Compile-time definitions start out not required; requirement
    // propagates from whichever definitions invoke them.
    let definition = ObjectDefinition::new(name.clone(), kind, false);
    if !environment.add_object_definition(definition) {
        return false;
    }

    let mut definition_output = GeneratorOutput::new();
    add_string_output(
        &mut definition_output.source,
        "extern \"C\" bool ",
        OutputMod::empty(),
        &name,
    );
    add_string_output(
        &mut definition_output.source,
        name.contents(),
        OutputMod::CONVERT_VARIABLE_NAME,
        &name,
    );
    add_string_output(
        &mut definition_output.source,
        format!(
            "(EnvironmentHandle environment, ContextHandle context, \
             TokenArrayHandle tokens, int start_token_index, {output_parameter} output)"
        ),
        OutputMod::NEWLINE_AFTER,
        &name,
    );
    add_string_output(&mut definition_output.source, "{", OutputMod::NEWLINE_AFTER, &name);

    let body_context = context.for_definition(name.clone(), EvaluatorScope::Body);
    let body_errors = evaluate_generate_all(
        environment,
        &body_context,
        tokens,
        name_index + 1,
        None,
        &mut definition_output,
    );

    add_string_output(&mut definition_output.source, "}", OutputMod::NEWLINE_AFTER, &name);

    environment
        .definitions
        .get_mut(name.contents())
        .expect("definition was just added")
        .output = definition_output;

    body_errors == 0
}

/// `(defmacro name statements...)`. The body appends tokens to `output`
/// through the bridge and must `(return true)` on success.
fn defmacro_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    _output: &mut GeneratorOutput,
) -> bool {
    compile_time_definition(
        environment,
        context,
        tokens,
        invocation_start_index,
        ObjectKind::CompileTimeMacro,
        "TokenVecHandle",
    )
}

/// `(defgenerator name statements...)`. Like `defmacro`, but the body
/// appends output fragments instead of tokens.
fn defgenerator_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    _output: &mut GeneratorOutput,
) -> bool {
    compile_time_definition(
        environment,
        context,
        tokens,
        invocation_start_index,
        ObjectKind::CompileTimeGenerator,
        "OutputHandle",
    )
}

/// `(var name type initializer?)` at module scope. Declares in the header,
/// defines in the source, and registers a module state variable so hot
/// reload can rewrite accesses.
fn variable_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    if context.scope != EvaluatorScope::Module {
        environment.push_error(error_at_token(
            ErrorKind::InvalidScope {
                what: "var".into(),
                expected: EvaluatorScope::Module.as_str(),
            },
            &tokens[invocation_start_index],
        ));
        return false;
    }

    let invocation_end = find_close_paren(tokens, invocation_start_index);
    let name_index = invocation_start_index + 2;
    let type_index = name_index + 1;
    if !expect_symbol(environment, tokens, name_index, invocation_end, "variable name")
        || !expect_symbol(environment, tokens, type_index, invocation_end, "variable type")
    {
        return false;
    }
    let name = TokenRef::new(tokens, name_index);
    let variable_type = TokenRef::new(tokens, type_index);

    add_string_output(&mut output.header, "extern", OutputMod::SPACE_AFTER, &name);
    add_string_output(
        &mut output.header,
        variable_type.contents(),
        OutputMod::CONVERT_VARIABLE_NAME | OutputMod::SPACE_AFTER,
        &variable_type,
    );
    add_string_output(
        &mut output.header,
        name.contents(),
        OutputMod::CONVERT_VARIABLE_NAME,
        &name,
    );
    add_lang_token_output(&mut output.header, OutputMod::END_STATEMENT, &name);

    add_string_output(
        &mut output.source,
        variable_type.contents(),
        OutputMod::CONVERT_VARIABLE_NAME | OutputMod::SPACE_AFTER,
        &variable_type,
    );
    add_string_output(
        &mut output.source,
        name.contents(),
        OutputMod::CONVERT_VARIABLE_NAME,
        &name,
    );

    let mut num_errors = 0;
    if type_index + 1 < invocation_end {
        add_string_output(&mut output.source, " = ", OutputMod::empty(), &name);
        let expression_context = context.with_scope(EvaluatorScope::ExpressionsOnly);
        num_errors += evaluate_generate(
            environment,
            &expression_context,
            tokens,
            type_index + 1,
            output,
        );
    }
    add_lang_token_output(&mut output.source, OutputMod::END_STATEMENT, &name);

    if let Some(module_environment) = &context.module_environment {
        module_environment.borrow_mut().state_variables.insert(
            name.contents().to_string(),
            crate::environment::StateVariable { name: name.clone() },
        );
    }

    num_errors == 0
}

// ============================================================================
// STATEMENT FORMS
// ============================================================================

fn expect_body_scope(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    what: &str,
) -> bool {
    if context.scope != EvaluatorScope::Body {
        environment.push_error(error_at_token(
            ErrorKind::InvalidScope {
                what: what.into(),
                expected: EvaluatorScope::Body.as_str(),
            },
            &tokens[invocation_start_index + 1],
        ));
        return false;
    }
    true
}

/// `(return expr?)`
fn return_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    if !expect_body_scope(environment, context, tokens, invocation_start_index, "return") {
        return false;
    }
    let invocation_end = find_close_paren(tokens, invocation_start_index);
    let origin = TokenRef::new(tokens, invocation_start_index + 1);

    let mut num_errors = 0;
    if invocation_start_index + 2 < invocation_end {
        add_string_output(&mut output.source, "return", OutputMod::SPACE_AFTER, &origin);
        let expression_context = context.with_scope(EvaluatorScope::ExpressionsOnly);
        num_errors += evaluate_generate(
            environment,
            &expression_context,
            tokens,
            invocation_start_index + 2,
            output,
        );
    } else {
        add_string_output(&mut output.source, "return", OutputMod::empty(), &origin);
    }
    add_lang_token_output(&mut output.source, OutputMod::END_STATEMENT, &origin);
    num_errors == 0
}

/// `(set destination expr)`
fn set_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    if !expect_body_scope(environment, context, tokens, invocation_start_index, "set") {
        return false;
    }
    let invocation_end = find_close_paren(tokens, invocation_start_index);
    let destination_index = invocation_start_index + 2;
    if !expect_symbol(
        environment,
        tokens,
        destination_index,
        invocation_end,
        "destination to set",
    ) {
        return false;
    }
    if destination_index + 1 >= invocation_end {
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: "expected value to set".into(),
            },
            &tokens[destination_index],
        ));
        return false;
    }

    let origin = TokenRef::new(tokens, invocation_start_index + 1);
    let expression_context = context.with_scope(EvaluatorScope::ExpressionsOnly);
    // The destination goes through the evaluator too, so state variables
    // pick up their hot-reload dereference.
    let mut num_errors = evaluate_generate(
        environment,
        &expression_context,
        tokens,
        destination_index,
        output,
    );
    add_string_output(&mut output.source, " = ", OutputMod::empty(), &origin);
    num_errors += evaluate_generate(
        environment,
        &expression_context,
        tokens,
        destination_index + 1,
        output,
    );
    add_lang_token_output(&mut output.source, OutputMod::END_STATEMENT, &origin);
    num_errors == 0
}

/// `(if condition then-statement else-statement?)`
fn if_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    if !expect_body_scope(environment, context, tokens, invocation_start_index, "if") {
        return false;
    }
    let invocation_end = find_close_paren(tokens, invocation_start_index);
    let condition_index = invocation_start_index + 2;
    if condition_index >= invocation_end {
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: "expected condition".into(),
            },
            &tokens[invocation_start_index + 1],
        ));
        return false;
    }
    let origin = TokenRef::new(tokens, invocation_start_index + 1);

    add_string_output(&mut output.source, "if ", OutputMod::empty(), &origin);
    add_lang_token_output(&mut output.source, OutputMod::OPEN_PAREN, &origin);
    let expression_context = context.with_scope(EvaluatorScope::ExpressionsOnly);
    let mut num_errors = evaluate_generate(
        environment,
        &expression_context,
        tokens,
        condition_index,
        output,
    );
    add_lang_token_output(&mut output.source, OutputMod::CLOSE_PAREN, &origin);

    let then_index = next_sibling(tokens, condition_index);
    if then_index >= invocation_end {
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: "expected statement after condition".into(),
            },
            &tokens[invocation_start_index + 1],
        ));
        return false;
    }
    add_string_output(&mut output.source, " {", OutputMod::NEWLINE_AFTER, &origin);
    num_errors += evaluate_generate(environment, context, tokens, then_index, output);
    add_string_output(&mut output.source, "}", OutputMod::NEWLINE_AFTER, &origin);

    let else_index = next_sibling(tokens, then_index);
    if else_index < invocation_end {
        add_string_output(&mut output.source, "else {", OutputMod::NEWLINE_AFTER, &origin);
        num_errors += evaluate_generate(environment, context, tokens, else_index, output);
        add_string_output(&mut output.source, "}", OutputMod::NEWLINE_AFTER, &origin);
    }
    num_errors == 0
}

/// `(while condition statements...)`
fn while_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    if !expect_body_scope(environment, context, tokens, invocation_start_index, "while") {
        return false;
    }
    let invocation_end = find_close_paren(tokens, invocation_start_index);
    let condition_index = invocation_start_index + 2;
    if condition_index >= invocation_end {
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: "expected condition".into(),
            },
            &tokens[invocation_start_index + 1],
        ));
        return false;
    }
    let origin = TokenRef::new(tokens, invocation_start_index + 1);

    add_string_output(&mut output.source, "while ", OutputMod::empty(), &origin);
    add_lang_token_output(&mut output.source, OutputMod::OPEN_PAREN, &origin);
    let expression_context = context.with_scope(EvaluatorScope::ExpressionsOnly);
    let mut num_errors = evaluate_generate(
        environment,
        &expression_context,
        tokens,
        condition_index,
        output,
    );
    add_lang_token_output(&mut output.source, OutputMod::CLOSE_PAREN, &origin);

    add_string_output(&mut output.source, " {", OutputMod::NEWLINE_AFTER, &origin);
    num_errors += evaluate_generate_all(
        environment,
        context,
        tokens,
        next_sibling(tokens, condition_index),
        None,
        output,
    );
    add_string_output(&mut output.source, "}", OutputMod::NEWLINE_AFTER, &origin);
    num_errors == 0
}

/// `(c-import "header.h" "<vector>" ...)` at module scope.
fn c_import_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    if context.scope != EvaluatorScope::Module {
        environment.push_error(error_at_token(
            ErrorKind::InvalidScope {
                what: "c-import".into(),
                expected: EvaluatorScope::Module.as_str(),
            },
            &tokens[invocation_start_index],
        ));
        return false;
    }

    let invocation_end = find_close_paren(tokens, invocation_start_index);
    let mut import_index = invocation_start_index + 2;
    let mut succeeded = true;
    while import_index < invocation_end {
        let token = &tokens[import_index];
        if token.kind != TokenKind::String {
            environment.push_error(error_at_token(
                ErrorKind::InvalidInvocation {
                    message: "c-import expects string arguments".into(),
                },
                token,
            ));
            succeeded = false;
            import_index = next_sibling(tokens, import_index);
            continue;
        }
        let include = if token.contents.starts_with('<') {
            format!("#include {}", token.contents)
        } else {
            format!("#include \"{}\"", token.contents)
        };
        let origin = TokenRef::new(tokens, import_index);
        add_string_output(&mut output.header, include, OutputMod::NEWLINE_AFTER, &origin);
        import_index += 1;
    }
    succeeded
}

// ============================================================================
// EXPRESSIONS
// ============================================================================

/// Shared generator behind every arithmetic and comparison operator. The
/// operator's spelling comes from the invocation head, so a single function
/// pointer serves the whole table.
fn binary_operator_generator(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    let operator_name = tokens[invocation_start_index + 1].contents.as_str();
    let spelling = match operator_name {
        "=" => "==",
        other => other,
    };
    let origin = TokenRef::new(tokens, invocation_start_index + 1);
    let invocation_end = find_close_paren(tokens, invocation_start_index);

    let first_operand = invocation_start_index + 2;
    if first_operand >= invocation_end || next_sibling(tokens, first_operand) >= invocation_end {
        environment.push_error(error_at_token(
            ErrorKind::InvalidInvocation {
                message: format!("operator '{operator_name}' expects at least two operands"),
            },
            origin.token(),
        ));
        return false;
    }

    let delimiter = StringOutput::delimiter(&format!(" {spelling} "), OutputMod::empty());
    add_lang_token_output(&mut output.source, OutputMod::OPEN_PAREN, &origin);
    let expression_context = context.with_scope(EvaluatorScope::ExpressionsOnly);
    let num_errors = evaluate_generate_all(
        environment,
        &expression_context,
        tokens,
        first_operand,
        Some(&delimiter),
        output,
    );
    add_lang_token_output(&mut output.source, OutputMod::CLOSE_PAREN, &origin);
    num_errors == 0
}

/// Emits `name(arg, ...)` for a function call, terminated as a statement in
/// body scope. This is the built-in the dispatcher uses for known functions
/// and the build driver uses for speculative guesses, so its output shape is
/// exactly what an unknown reference turns into.
pub fn function_invocation(
    environment: &mut EvaluatorEnvironment,
    context: &EvaluatorContext,
    tokens: &TokenSlice,
    invocation_start_index: usize,
    output: &mut GeneratorOutput,
) -> bool {
    let name = TokenRef::new(tokens, invocation_start_index + 1);

    add_string_output(
        &mut output.source,
        name.contents(),
        OutputMod::CONVERT_VARIABLE_NAME,
        &name,
    );
    add_lang_token_output(&mut output.source, OutputMod::OPEN_PAREN, &name);
    let expression_context = context.with_scope(EvaluatorScope::ExpressionsOnly);
    let delimiter = argument_delimiter();
    let num_errors = evaluate_generate_all(
        environment,
        &expression_context,
        tokens,
        invocation_start_index + 2,
        Some(&delimiter),
        output,
    );
    add_lang_token_output(&mut output.source, OutputMod::CLOSE_PAREN, &name);
    if context.scope == EvaluatorScope::Body {
        add_lang_token_output(&mut output.source, OutputMod::END_STATEMENT, &name);
    }
    num_errors == 0
}

/// Index of the sibling after the element at `index` (skipping a whole
/// invocation when the element is a list).
fn next_sibling(tokens: &TokenSlice, index: usize) -> usize {
    if tokens[index].kind == TokenKind::OpenParen {
        find_close_paren(tokens, index) + 1
    } else {
        index + 1
    }
}
