//! Name-style conversion from lisp-style symbols to C identifiers.
//!
//! The evaluator emits symbols carrying the `CONVERT_VARIABLE_NAME`
//! modifier; the writer funnels them through here. The build driver uses the
//! same conversion for compile-time artifact names and entry-point symbols,
//! so a definition's generated `extern "C"` signature and the symbol looked
//! up after `dlopen` always agree.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameStyleMode {
    /// `make-thing!` becomes `make_thing_`.
    #[default]
    Underscores,
    /// `make-thing` becomes `makeThing`.
    CamelCase,
    /// `make-thing` becomes `MakeThing`.
    PascalCase,
}

/// Converts a lisp-style name to a C-compatible identifier.
///
/// Alphanumerics and underscores pass through. `-` separates words: it maps
/// to `_` in underscore mode and capitalizes the next character in the camel
/// modes. Any other character becomes `_`. A leading digit is prefixed with
/// `_` so the result is always a valid identifier.
pub fn lisp_name_to_c_name(mode: NameStyleMode, name: &str) -> String {
    let mut converted = String::with_capacity(name.len() + 1);
    let mut capitalize_next = matches!(mode, NameStyleMode::PascalCase);

    for (position, character) in name.chars().enumerate() {
        if character.is_ascii_alphanumeric() || character == '_' {
            if position == 0 && character.is_ascii_digit() {
                converted.push('_');
            }
            if capitalize_next {
                converted.extend(character.to_uppercase());
                capitalize_next = false;
            } else {
                converted.push(character);
            }
        } else if character == '-' && position != 0 {
            match mode {
                NameStyleMode::Underscores => converted.push('_'),
                NameStyleMode::CamelCase | NameStyleMode::PascalCase => capitalize_next = true,
            }
        } else {
            // '?', '!', '*', a leading '-', and friends have no C spelling.
            converted.push('_');
        }
    }

    converted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscore_mode_flattens_hyphens() {
        assert_eq!(
            lisp_name_to_c_name(NameStyleMode::Underscores, "make-thing"),
            "make_thing"
        );
        assert_eq!(
            lisp_name_to_c_name(NameStyleMode::Underscores, "set-value!"),
            "set_value_"
        );
        assert_eq!(lisp_name_to_c_name(NameStyleMode::Underscores, "plain"), "plain");
    }

    #[test]
    fn camel_modes_capitalize_word_starts() {
        assert_eq!(
            lisp_name_to_c_name(NameStyleMode::CamelCase, "make-thing"),
            "makeThing"
        );
        assert_eq!(
            lisp_name_to_c_name(NameStyleMode::PascalCase, "make-thing"),
            "MakeThing"
        );
    }

    #[test]
    fn awkward_leading_characters_are_sanitized() {
        assert_eq!(lisp_name_to_c_name(NameStyleMode::Underscores, "2d"), "_2d");
        assert_eq!(lisp_name_to_c_name(NameStyleMode::Underscores, "-x"), "_x");
    }
}
