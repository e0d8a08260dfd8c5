//! Compile-time artifact handling: cache naming, freshness, source
//! templates, and shared-library loading.
//!
//! Each compile-time definition `name` produces three cache files:
//! `comptime_<name>.cpp`, `comptime_<name>.o`, and the platform's shared
//! library spelling of `lib<name>.so`. Freshness is mtime-based: when the
//! generated source is no newer than the existing library, compile and link
//! are skipped entirely.

use std::ffi::c_void;
use std::fs;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};

use libloading::Library;
use thiserror::Error;

use crate::converters::{lisp_name_to_c_name, NameStyleMode};

/// Entry point of a loaded compile-time macro. Appends tokens to the output
/// vector through the bridge; returns false on failure.
pub type LoadedMacroFunc = unsafe extern "C" fn(
    environment: *mut c_void,
    context: *const c_void,
    tokens: *const c_void,
    start_token_index: c_int,
    output: *mut c_void,
) -> bool;

/// Entry point of a loaded compile-time generator. Appends output fragments
/// through the bridge; returns false on failure.
pub type LoadedGeneratorFunc = unsafe extern "C" fn(
    environment: *mut c_void,
    context: *const c_void,
    tokens: *const c_void,
    start_token_index: c_int,
    output: *mut c_void,
) -> bool;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to load library: {0}")]
    Open(String),
    #[error("failed to find symbol '{symbol}': {message}")]
    Symbol { symbol: String, message: String },
}

/// Cache file locations for one compile-time definition.
#[derive(Debug, Clone)]
pub struct ComptimeArtifacts {
    pub base_name: String,
    pub source_path: PathBuf,
    pub object_path: PathBuf,
    pub library_path: PathBuf,
}

pub fn comptime_artifacts(
    cache_dir: &Path,
    mode: NameStyleMode,
    definition_name: &str,
) -> ComptimeArtifacts {
    let base_name = format!("comptime_{}", lisp_name_to_c_name(mode, definition_name));
    ComptimeArtifacts {
        source_path: cache_dir.join(format!("{base_name}.cpp")),
        object_path: cache_dir.join(format!("{base_name}.o")),
        library_path: cache_dir.join(format!(
            "{}{base_name}{}",
            std::env::consts::DLL_PREFIX,
            std::env::consts::DLL_SUFFIX
        )),
        base_name,
    }
}

/// True when `file` was modified after `reference`, or when `reference`
/// does not exist. Missing `file` is never more recent.
pub fn file_more_recently_modified(file: &Path, reference: &Path) -> bool {
    let Ok(file_metadata) = fs::metadata(file) else {
        return false;
    };
    let Ok(reference_metadata) = fs::metadata(reference) else {
        return true;
    };
    match (file_metadata.modified(), reference_metadata.modified()) {
        (Ok(file_time), Ok(reference_time)) => file_time > reference_time,
        _ => true,
    }
}

pub fn load_compile_time_library(path: &Path) -> Result<Library, LoadError> {
    unsafe { Library::new(path) }.map_err(|error| LoadError::Open(error.to_string()))
}

/// Resolves the macro entry point. The caller guarantees the symbol was
/// emitted with [`LoadedMacroFunc`]'s signature by the defmacro generator.
pub fn resolve_macro_entry(library: &Library, symbol: &str) -> Result<LoadedMacroFunc, LoadError> {
    let entry = unsafe { library.get::<LoadedMacroFunc>(symbol.as_bytes()) }.map_err(|error| {
        LoadError::Symbol {
            symbol: symbol.to_string(),
            message: error.to_string(),
        }
    })?;
    Ok(*entry)
}

pub fn resolve_generator_entry(
    library: &Library,
    symbol: &str,
) -> Result<LoadedGeneratorFunc, LoadError> {
    let entry =
        unsafe { library.get::<LoadedGeneratorFunc>(symbol.as_bytes()) }.map_err(|error| {
            LoadError::Symbol {
                symbol: symbol.to_string(),
                message: error.to_string(),
            }
        })?;
    Ok(*entry)
}

// ============================================================================
// SOURCE TEMPLATES
// ============================================================================

/// Shared prelude for generated compile-time sources: the opaque handle
/// types of the entry signature, the bridge API resolved against the running
/// transpiler process at load time, and the output modifier bits.
const COMPTIME_COMMON_HEADING: &str = r#"// Generated by cinder. Do not edit.
typedef void* EnvironmentHandle;
typedef const void* ContextHandle;
typedef const void* TokenArrayHandle;
typedef void* TokenVecHandle;
typedef void* OutputHandle;

enum
{
    cinder_token_open_paren = 0,
    cinder_token_close_paren = 1,
    cinder_token_symbol = 2,
    cinder_token_string = 3,
};

enum
{
    cinder_mod_space_after = 1 << 0,
    cinder_mod_newline_after = 1 << 1,
    cinder_mod_surround_with_quotes = 1 << 2,
    cinder_mod_convert_variable_name = 1 << 3,
    cinder_mod_open_paren = 1 << 4,
    cinder_mod_close_paren = 1 << 5,
    cinder_mod_end_statement = 1 << 6,
};

extern "C"
{
    int cinder_token_count(TokenArrayHandle tokens);
    int cinder_token_kind(TokenArrayHandle tokens, int index);
    const char* cinder_token_contents(TokenArrayHandle tokens, int index, int* out_length);
    bool cinder_token_matches(TokenArrayHandle tokens, int index, const char* contents);
    int cinder_find_close_paren(TokenArrayHandle tokens, int open_index);
    void cinder_tokens_push_open(TokenVecHandle output, TokenArrayHandle source, int origin_index);
    void cinder_tokens_push_close(TokenVecHandle output, TokenArrayHandle source, int origin_index);
    void cinder_tokens_push_symbol(TokenVecHandle output, const char* contents,
                                   TokenArrayHandle source, int origin_index);
    void cinder_tokens_push_string(TokenVecHandle output, const char* contents,
                                   TokenArrayHandle source, int origin_index);
    void cinder_tokens_copy(TokenVecHandle output, TokenArrayHandle source, int start_index,
                            int end_index);
    void cinder_output_add_string(OutputHandle output, const char* contents,
                                  unsigned int modifiers, TokenArrayHandle source,
                                  int origin_index);
    void cinder_output_add_header_string(OutputHandle output, const char* contents,
                                         unsigned int modifiers, TokenArrayHandle source,
                                         int origin_index);
}

"#;

pub fn macro_source_heading() -> String {
    format!("{COMPTIME_COMMON_HEADING}// Compile-time macro entry follows.\n")
}

pub fn macro_source_footer() -> &'static str {
    "\n// End of generated macro.\n"
}

pub fn generator_source_heading() -> String {
    format!("{COMPTIME_COMMON_HEADING}// Compile-time generator entry follows.\n")
}

pub fn generator_source_footer() -> &'static str {
    "\n// End of generated generator.\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    #[test]
    fn artifact_names_derive_from_converted_definition_names() {
        let artifacts = comptime_artifacts(
            Path::new("cakelisp_cache"),
            NameStyleMode::Underscores,
            "square-all",
        );
        assert_eq!(artifacts.base_name, "comptime_square_all");
        assert!(artifacts
            .source_path
            .ends_with("comptime_square_all.cpp"));
        assert!(artifacts.object_path.ends_with("comptime_square_all.o"));
        let library_name = artifacts.library_path.file_name().unwrap().to_string_lossy();
        assert!(library_name.starts_with("lib") || cfg!(windows));
        assert!(library_name.contains("comptime_square_all"));
    }

    #[test]
    fn freshness_tracks_modification_times() {
        let directory = tempfile::tempdir().unwrap();
        let source = directory.path().join("a.cpp");
        let library = directory.path().join("liba.so");

        // Missing library means the source always counts as newer.
        std::fs::write(&source, "x").unwrap();
        assert!(file_more_recently_modified(&source, &library));

        std::fs::write(&library, "y").unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(base)
            .unwrap();
        File::options()
            .write(true)
            .open(&library)
            .unwrap()
            .set_modified(base + Duration::from_secs(60))
            .unwrap();
        assert!(!file_more_recently_modified(&source, &library));

        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(base + Duration::from_secs(120))
            .unwrap();
        assert!(file_more_recently_modified(&source, &library));
    }
}
