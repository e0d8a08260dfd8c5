//! Serializes output fragments to C/C++ text.
//!
//! The writer is the only consumer of formatting modifiers. Splice sentinels
//! are expanded in place from the environment's splice arena, which is what
//! keeps late-resolved references in their original textual position.

use std::fs;
use std::io;
use std::path::Path;

use crate::converters::lisp_name_to_c_name;
use crate::environment::{EvaluatorEnvironment, GLOBAL_DEFINITION_NAME};
use crate::output::{GeneratorOutput, OutputMod, StringOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Source,
    Header,
}

fn select_stream(output: &GeneratorOutput, kind: StreamKind) -> &[StringOutput] {
    match kind {
        StreamKind::Source => &output.source,
        StreamKind::Header => &output.header,
    }
}

/// Appends one fragment stream to `text`, recursively expanding splices.
pub fn append_stream(
    environment: &EvaluatorEnvironment,
    fragments: &[StringOutput],
    kind: StreamKind,
    text: &mut String,
) {
    for fragment in fragments {
        if fragment.modifiers.contains(OutputMod::SPLICE) {
            if let Some(splice) = fragment.splice {
                let child = environment.splice(splice);
                append_stream(environment, select_stream(child, kind), kind, text);
            }
            continue;
        }

        if fragment.modifiers.contains(OutputMod::SURROUND_WITH_QUOTES) {
            text.push('"');
            text.push_str(&escape_c_string(&fragment.contents));
            text.push('"');
        } else if fragment.modifiers.contains(OutputMod::CONVERT_VARIABLE_NAME) {
            text.push_str(&lisp_name_to_c_name(
                environment.options.function_name_mode,
                &fragment.contents,
            ));
        } else {
            text.push_str(&fragment.contents);
        }

        if fragment.modifiers.contains(OutputMod::OPEN_PAREN) {
            text.push('(');
        }
        if fragment.modifiers.contains(OutputMod::CLOSE_PAREN) {
            text.push(')');
        }
        if fragment.modifiers.contains(OutputMod::END_STATEMENT) {
            text.push_str(";\n");
        }
        if fragment.modifiers.contains(OutputMod::SPACE_AFTER) {
            text.push(' ');
        }
        if fragment.modifiers.contains(OutputMod::NEWLINE_AFTER) {
            text.push('\n');
        }
    }
}

fn escape_c_string(contents: &str) -> String {
    let mut escaped = String::with_capacity(contents.len());
    for character in contents.chars() {
        match character {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Serializes the whole module: the `<global>` definition's output followed
/// by every required runtime definition in creation order. Compile-time
/// definitions and definitions not required by the module are not written.
///
/// Returns `(source_text, header_text)`.
pub fn write_module_output(
    environment: &EvaluatorEnvironment,
    module_source_name: &str,
    header_file_name: &str,
) -> (String, String) {
    let mut header_text = String::new();
    header_text.push_str("#pragma once\n\n");

    let mut source_text = String::new();
    source_text.push_str(&format!("// Generated by cinder from {module_source_name}\n"));
    source_text.push_str(&format!("#include \"{header_file_name}\"\n\n"));

    if let Some(global) = environment.definitions.get(GLOBAL_DEFINITION_NAME) {
        append_stream(environment, &global.output.header, StreamKind::Header, &mut header_text);
        append_stream(environment, &global.output.source, StreamKind::Source, &mut source_text);
    }

    for definition_name in &environment.definition_order {
        if definition_name == GLOBAL_DEFINITION_NAME {
            continue;
        }
        let Some(definition) = environment.definitions.get(definition_name) else {
            continue;
        };
        if definition.kind.is_compile_time() || !definition.is_required {
            continue;
        }
        append_stream(
            environment,
            &definition.output.header,
            StreamKind::Header,
            &mut header_text,
        );
        append_stream(
            environment,
            &definition.output.source,
            StreamKind::Source,
            &mut source_text,
        );
        source_text.push('\n');
    }

    (source_text, header_text)
}

/// Serializes one compile-time definition between its heading and footer
/// templates.
pub fn write_comptime_source(
    environment: &EvaluatorEnvironment,
    output: &GeneratorOutput,
    heading: &str,
    footer: &str,
) -> String {
    let mut text = String::new();
    text.push_str(heading);
    append_stream(environment, &output.header, StreamKind::Header, &mut text);
    append_stream(environment, &output.source, StreamKind::Source, &mut text);
    text.push_str(footer);
    text
}

/// Writes `contents` to `path` only when it differs from what is already
/// there. Preserving the modification time of identical files is what lets
/// the build driver skip compiling cached compile-time artifacts.
pub fn write_if_contents_differ(path: &Path, contents: &str) -> io::Result<bool> {
    if let Ok(existing) = fs::read_to_string(path) {
        if existing == contents {
            return Ok(false);
        }
    }
    fs::write(path, contents)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{BuildOptions, EvaluatorEnvironment};
    use crate::output::{add_splice_output, add_string_output};
    use crate::token::TokenRef;

    fn test_origin() -> TokenRef {
        let tokens = crate::environment::make_internal_token_slice("origin");
        TokenRef::new(&tokens, 0)
    }

    #[test]
    fn modifiers_control_layout() {
        let environment = EvaluatorEnvironment::new(BuildOptions::default());
        let origin = test_origin();
        let mut stream = Vec::new();
        add_string_output(&mut stream, "int", OutputMod::SPACE_AFTER, &origin);
        add_string_output(&mut stream, "do-thing", OutputMod::CONVERT_VARIABLE_NAME, &origin);
        add_string_output(
            &mut stream,
            "",
            OutputMod::OPEN_PAREN | OutputMod::CLOSE_PAREN | OutputMod::END_STATEMENT,
            &origin,
        );

        let mut text = String::new();
        append_stream(&environment, &stream, StreamKind::Source, &mut text);
        assert_eq!(text, "int do_thing();\n");
    }

    #[test]
    fn strings_are_quoted_and_escaped() {
        let environment = EvaluatorEnvironment::new(BuildOptions::default());
        let origin = test_origin();
        let mut stream = Vec::new();
        add_string_output(
            &mut stream,
            "say \"hi\"\n",
            OutputMod::SURROUND_WITH_QUOTES,
            &origin,
        );
        let mut text = String::new();
        append_stream(&environment, &stream, StreamKind::Source, &mut text);
        assert_eq!(text, "\"say \\\"hi\\\"\\n\"");
    }

    #[test]
    fn splice_fills_appear_at_installation_position_regardless_of_fill_order() {
        let mut environment = EvaluatorEnvironment::new(BuildOptions::default());
        let origin = test_origin();

        let mut stream = Vec::new();
        add_string_output(&mut stream, "before ", OutputMod::empty(), &origin);
        let first = environment.new_splice();
        add_splice_output(&mut stream, first, &origin);
        add_string_output(&mut stream, " middle ", OutputMod::empty(), &origin);
        let second = environment.new_splice();
        add_splice_output(&mut stream, second, &origin);
        add_string_output(&mut stream, " after", OutputMod::empty(), &origin);

        // Fill in reverse installation order.
        let mut second_output = environment.take_splice(second);
        add_string_output(&mut second_output.source, "TWO", OutputMod::empty(), &origin);
        environment.restore_splice(second, second_output);

        let mut first_output = environment.take_splice(first);
        add_string_output(&mut first_output.source, "ONE", OutputMod::empty(), &origin);
        environment.restore_splice(first, first_output);

        let mut text = String::new();
        append_stream(&environment, &stream, StreamKind::Source, &mut text);
        assert_eq!(text, "before ONE middle TWO after");
    }

    #[test]
    fn identical_file_contents_are_not_rewritten() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("out.cpp");
        assert!(write_if_contents_differ(&path, "int x;\n").unwrap());
        assert!(!write_if_contents_differ(&path, "int x;\n").unwrap());
        assert!(write_if_contents_differ(&path, "int y;\n").unwrap());
    }
}
