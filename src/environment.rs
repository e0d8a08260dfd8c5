//! Process-scoped evaluator state: definitions, references, reference pools,
//! macro and generator tables, and macro-expansion token arenas.
//!
//! The environment is a single owned aggregate passed by mutable reference
//! through the evaluator; there is no hidden singleton. Teardown is an
//! explicit operation with a documented ordering (pools and splices, then
//! definition outputs, then expansion arenas) because splice buffers
//! referenced from the pools live in the environment's arena.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use miette::NamedSource;
use tracing::{debug, warn};

use crate::comptime::{LoadedGeneratorFunc, LoadedMacroFunc};
use crate::converters::NameStyleMode;
use crate::diagnostics::{
    error_at_token, note_for_token, CinderError, ErrorKind, Severity,
};
use crate::generators;
use crate::output::{GeneratorOutput, SpliceId};
use crate::token::{Span, Token, TokenKind, TokenRef, TokenSlice};

/// Name of the implicit definition that owns module-scope code and seeds
/// requirement propagation.
pub const GLOBAL_DEFINITION_NAME: &str = "<global>";

/// Default cache directory for compile-time artifacts.
pub const DEFAULT_CACHE_DIR: &str = "cakelisp_cache";

// ============================================================================
// DEFINITIONS AND REFERENCES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Function,
    CompileTimeMacro,
    CompileTimeGenerator,
}

impl ObjectKind {
    pub fn is_compile_time(self) -> bool {
        matches!(
            self,
            ObjectKind::CompileTimeMacro | ObjectKind::CompileTimeGenerator
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Function => "function",
            ObjectKind::CompileTimeMacro => "macro",
            ObjectKind::CompileTimeGenerator => "generator",
        }
    }
}

/// Speculation state of all references a definition makes to one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessState {
    /// Discovered; no action taken yet.
    None,
    /// No matching definition existed, so the sites were speculatively
    /// emitted as plain target-language function calls.
    Guessed,
    /// A definition was found or loaded and the sites were regenerated
    /// definitively.
    Resolved,
    /// A compile-time definition exists but is not built yet; guessing is
    /// not permitted.
    WaitingForLoad,
}

/// Handle into the environment's reference arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceId(pub usize);

/// One textual call site naming a symbol that was unknown when evaluated.
#[derive(Debug)]
pub struct ObjectReference {
    pub tokens: TokenSlice,
    /// Index of the invocation's open paren.
    pub start_index: usize,
    /// Evaluator context snapshot at capture time.
    pub context: EvaluatorContext,
    /// Splice buffer filled when the reference resolves.
    pub splice: SpliceId,
    pub is_resolved: bool,
}

/// Aggregates every site within one definition that mentions one name.
#[derive(Debug)]
pub struct ReferenceStatus {
    /// Name token of the first occurrence.
    pub name: TokenRef,
    pub references: Vec<ReferenceId>,
    pub guess_state: GuessState,
}

impl ReferenceStatus {
    /// Applies a guess-state transition if it is legal, returning whether
    /// the state changed. The legal moves never regress: `None` may go to
    /// any state, and `Guessed`/`WaitingForLoad` may only advance to
    /// `Resolved`. Illegal moves are ignored.
    pub fn transition(&mut self, next: GuessState) -> bool {
        use GuessState::*;
        if self.guess_state == next {
            return false;
        }
        let legal = matches!(
            (self.guess_state, next),
            (None, Guessed)
                | (None, WaitingForLoad)
                | (None, Resolved)
                | (Guessed, Resolved)
                | (WaitingForLoad, Resolved)
        );
        if legal {
            self.guess_state = next;
        }
        legal
    }
}

/// A top-level named form: a function, macro, or generator.
#[derive(Debug)]
pub struct ObjectDefinition {
    pub name: TokenRef,
    pub kind: ObjectKind,
    pub output: GeneratorOutput,
    pub is_required: bool,
    pub is_loaded: bool,
    /// Referenced-symbol name to the status of all sites naming it.
    pub references: HashMap<String, ReferenceStatus>,
}

impl ObjectDefinition {
    pub fn new(name: TokenRef, kind: ObjectKind, is_required: bool) -> Self {
        Self {
            name,
            kind,
            output: GeneratorOutput::new(),
            is_required,
            is_loaded: false,
            references: HashMap::new(),
        }
    }
}

// ============================================================================
// MACRO AND GENERATOR TABLES
// ============================================================================

/// Compile-time macro implemented in Rust. Appends tokens to `output`;
/// returns false on failure.
pub type NativeMacroFunc = fn(
    &mut EvaluatorEnvironment,
    &EvaluatorContext,
    &TokenSlice,
    usize,
    &mut Vec<Token>,
) -> bool;

/// Generator implemented in Rust. Appends fragments to `output` directly.
pub type NativeGeneratorFunc = fn(
    &mut EvaluatorEnvironment,
    &EvaluatorContext,
    &TokenSlice,
    usize,
    &mut GeneratorOutput,
) -> bool;

/// A macro table entry: either a built-in or a pointer resolved from a
/// loaded compile-time library. Loading installs the pointer; unloading is
/// not supported.
#[derive(Clone, Copy)]
pub enum MacroEntry {
    Native(NativeMacroFunc),
    Loaded(LoadedMacroFunc),
}

impl MacroEntry {
    pub fn invoke(
        self,
        environment: &mut EvaluatorEnvironment,
        context: &EvaluatorContext,
        tokens: &TokenSlice,
        start_index: usize,
        output: &mut Vec<Token>,
    ) -> bool {
        match self {
            MacroEntry::Native(function) => {
                function(environment, context, tokens, start_index, output)
            }
            // The loaded side only touches the evaluator through the bridge
            // functions, which cast these handles straight back.
            MacroEntry::Loaded(function) => unsafe {
                function(
                    environment as *mut EvaluatorEnvironment as *mut c_void,
                    context as *const EvaluatorContext as *const c_void,
                    tokens as *const TokenSlice as *const c_void,
                    start_index as c_int,
                    output as *mut Vec<Token> as *mut c_void,
                )
            },
        }
    }
}

#[derive(Clone, Copy)]
pub enum GeneratorEntry {
    Native(NativeGeneratorFunc),
    Loaded(LoadedGeneratorFunc),
}

impl GeneratorEntry {
    pub fn invoke(
        self,
        environment: &mut EvaluatorEnvironment,
        context: &EvaluatorContext,
        tokens: &TokenSlice,
        start_index: usize,
        output: &mut GeneratorOutput,
    ) -> bool {
        match self {
            GeneratorEntry::Native(function) => {
                function(environment, context, tokens, start_index, output)
            }
            GeneratorEntry::Loaded(function) => unsafe {
                function(
                    environment as *mut EvaluatorEnvironment as *mut c_void,
                    context as *const EvaluatorContext as *const c_void,
                    tokens as *const TokenSlice as *const c_void,
                    start_index as c_int,
                    output as *mut GeneratorOutput as *mut c_void,
                )
            },
        }
    }
}

// ============================================================================
// EVALUATOR CONTEXT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorScope {
    Module,
    Body,
    ExpressionsOnly,
}

impl EvaluatorScope {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluatorScope::Module => "module",
            EvaluatorScope::Body => "body",
            EvaluatorScope::ExpressionsOnly => "expressions-only",
        }
    }
}

/// Module-level state shared with the evaluator for hot reload support.
#[derive(Debug, Default)]
pub struct ModuleEnvironment {
    pub state_variables: HashMap<String, StateVariable>,
}

#[derive(Debug)]
pub struct StateVariable {
    pub name: TokenRef,
}

/// The scope evaluation proceeds in. Passed by value so nested evaluation
/// cannot mutate the caller's scope.
#[derive(Debug, Clone)]
pub struct EvaluatorContext {
    pub scope: EvaluatorScope,
    /// Enclosing definition, for attributing new references. `None` at
    /// module scope, where references fall to the `<global>` definition.
    pub definition_name: Option<TokenRef>,
    pub module_environment: Option<Rc<RefCell<ModuleEnvironment>>>,
    /// Definitions created in this context start out required.
    pub is_required: bool,
}

impl EvaluatorContext {
    pub fn module(module_environment: Rc<RefCell<ModuleEnvironment>>) -> Self {
        Self {
            scope: EvaluatorScope::Module,
            definition_name: None,
            module_environment: Some(module_environment),
            is_required: true,
        }
    }

    pub fn with_scope(&self, scope: EvaluatorScope) -> Self {
        Self {
            scope,
            ..self.clone()
        }
    }

    /// Context for evaluating the body of `definition_name`.
    pub fn for_definition(&self, definition_name: TokenRef, scope: EvaluatorScope) -> Self {
        Self {
            scope,
            definition_name: Some(definition_name),
            ..self.clone()
        }
    }
}

// ============================================================================
// BUILD OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub cache_dir: PathBuf,
    pub compiler: PathBuf,
    pub max_processes: usize,
    pub include_dir: Option<PathBuf>,
    pub enable_hot_reloading: bool,
    pub function_name_mode: NameStyleMode,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            compiler: PathBuf::from("/usr/bin/clang++"),
            max_processes: 8,
            include_dir: None,
            enable_hot_reloading: false,
            function_name_mode: NameStyleMode::Underscores,
        }
    }
}

// ============================================================================
// ENVIRONMENT
// ============================================================================

pub struct EvaluatorEnvironment {
    pub definitions: HashMap<String, ObjectDefinition>,
    /// Definition names in creation order, so module output is
    /// deterministic.
    pub definition_order: Vec<String>,
    /// Arena of reference records; statuses and pools index into it.
    pub references: Vec<ObjectReference>,
    /// Arena of splice buffers.
    splices: Vec<GeneratorOutput>,
    /// Symbol name to every reference naming it, across all definitions.
    pub reference_pools: HashMap<String, Vec<ReferenceId>>,
    pub macros: HashMap<String, MacroEntry>,
    pub generators: HashMap<String, GeneratorEntry>,
    /// Token arrays produced by macro expansion. They outlive every output
    /// fragment and reference that may still point into them, so they are
    /// freed only by explicit teardown.
    pub macro_expansions: Vec<TokenSlice>,
    /// Loaded compile-time libraries, retained for the life of the
    /// environment; their function pointers live in the tables above.
    pub loaded_libraries: Vec<libloading::Library>,
    pub errors: Vec<CinderError>,
    sources: HashMap<String, Arc<NamedSource<String>>>,
    pub options: BuildOptions,
    pub module_environment: Rc<RefCell<ModuleEnvironment>>,
    next_build_id: u32,
}

impl EvaluatorEnvironment {
    pub fn new(options: BuildOptions) -> Self {
        let mut environment = Self {
            definitions: HashMap::new(),
            definition_order: Vec::new(),
            references: Vec::new(),
            splices: Vec::new(),
            reference_pools: HashMap::new(),
            macros: HashMap::new(),
            generators: HashMap::new(),
            macro_expansions: Vec::new(),
            loaded_libraries: Vec::new(),
            errors: Vec::new(),
            sources: HashMap::new(),
            options,
            module_environment: Rc::new(RefCell::new(ModuleEnvironment::default())),
            next_build_id: 0,
        };
        generators::register_builtins(&mut environment);
        crate::bridge::ensure_linked();
        environment
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn find_macro(&self, name: &str) -> Option<MacroEntry> {
        self.macros.get(name).copied()
    }

    pub fn find_generator(&self, name: &str) -> Option<GeneratorEntry> {
        self.generators.get(name).copied()
    }

    /// Whether the compile-time code behind `definition` is installed in the
    /// corresponding table.
    pub fn is_compile_time_code_loaded(&self, definition: &ObjectDefinition) -> bool {
        match definition.kind {
            ObjectKind::CompileTimeMacro => self.macros.contains_key(definition.name.contents()),
            ObjectKind::CompileTimeGenerator => {
                self.generators.contains_key(definition.name.contents())
            }
            ObjectKind::Function => false,
        }
    }

    pub fn next_build_id(&mut self) -> u32 {
        self.next_build_id += 1;
        self.next_build_id
    }

    // ------------------------------------------------------------------
    // Definitions and references
    // ------------------------------------------------------------------

    /// Registers a definition. Reports a duplicate-definition error (with a
    /// note at the first definition) and returns false when the name is
    /// already taken by a definition, built-in macro, or generator.
    pub fn add_object_definition(&mut self, definition: ObjectDefinition) -> bool {
        let name = definition.name.contents().to_string();
        if let Some(existing) = self.definitions.get(&name) {
            let error = error_at_token(
                ErrorKind::DuplicateDefinition { name },
                definition.name.token(),
            )
            .with_note(note_for_token("first defined here", existing.name.token()));
            self.push_error(error);
            return false;
        }
        if self.macros.contains_key(&name) || self.generators.contains_key(&name) {
            let error = error_at_token(
                ErrorKind::DuplicateDefinition { name: name.clone() },
                definition.name.token(),
            )
            .with_note(crate::diagnostics::DiagnosticNote {
                message: "name conflicts with a built-in macro or generator".into(),
                location: None,
            });
            self.push_error(error);
            return false;
        }
        self.definition_order.push(name.clone());
        self.definitions.insert(name, definition);
        true
    }

    /// Records a reference in both the enclosing definition's status map and
    /// the global reference pool. Returns the reference's arena id and the
    /// status's guess state as of after insertion.
    pub fn add_object_reference(
        &mut self,
        name_token: &TokenRef,
        reference: ObjectReference,
    ) -> Option<(ReferenceId, GuessState)> {
        // Top-level references default to the module's catch-all definition.
        let definition_name = match &reference.context.definition_name {
            Some(enclosing) => enclosing.contents().to_string(),
            None => {
                if reference.context.scope != EvaluatorScope::Module {
                    self.push_error(error_at_token(
                        ErrorKind::InternalInconsistency {
                            message: "reference below module scope has no enclosing definition"
                                .into(),
                        },
                        name_token.token(),
                    ));
                }
                GLOBAL_DEFINITION_NAME.to_string()
            }
        };

        let referenced_name = name_token.contents().to_string();
        debug!(
            target: "references",
            reference = %referenced_name,
            definition = %definition_name,
            "adding reference"
        );

        let id = ReferenceId(self.references.len());
        self.references.push(reference);

        let guess_state = match self.definitions.get_mut(&definition_name) {
            Some(definition) => {
                let status = definition
                    .references
                    .entry(referenced_name.clone())
                    .or_insert_with(|| ReferenceStatus {
                        name: name_token.clone(),
                        references: Vec::new(),
                        guess_state: GuessState::None,
                    });
                status.references.push(id);
                status.guess_state
            }
            None => {
                let message = if definition_name == GLOBAL_DEFINITION_NAME {
                    format!("expected {GLOBAL_DEFINITION_NAME} definition to exist as a top-level catch-all")
                } else {
                    format!("expected definition {definition_name} to already exist")
                };
                self.push_error(error_at_token(
                    ErrorKind::InternalInconsistency { message },
                    name_token.token(),
                ));
                return None;
            }
        };

        self.reference_pools
            .entry(referenced_name)
            .or_default()
            .push(id);

        Some((id, guess_state))
    }

    // ------------------------------------------------------------------
    // Splice arena
    // ------------------------------------------------------------------

    pub fn new_splice(&mut self) -> SpliceId {
        self.splices.push(GeneratorOutput::new());
        SpliceId(self.splices.len() - 1)
    }

    pub fn splice(&self, id: SpliceId) -> &GeneratorOutput {
        &self.splices[id.0]
    }

    /// Removes a splice buffer from the arena for filling. Evaluation into
    /// the buffer needs `&mut self` at the same time, so the buffer is taken
    /// out and must be put back with [`Self::restore_splice`].
    pub fn take_splice(&mut self, id: SpliceId) -> GeneratorOutput {
        mem::take(&mut self.splices[id.0])
    }

    pub fn restore_splice(&mut self, id: SpliceId, output: GeneratorOutput) {
        self.splices[id.0] = output;
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Registers a source file's content so diagnostics pointing into it can
    /// render labeled spans.
    pub fn register_source(&mut self, name: &str, content: &str) {
        self.sources.insert(
            name.to_string(),
            Arc::new(NamedSource::new(name, content.to_string())),
        );
    }

    pub fn push_error(&mut self, mut error: CinderError) {
        if error.source_code.is_none() {
            if let Some(location) = &error.location {
                error.source_code = self.sources.get(&location.file).cloned();
            }
        }
        self.errors.push(error);
    }

    pub fn error_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|error| error.severity == Severity::Error)
            .count()
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Explicit teardown. Call once no caller retains pointers into macro
    /// expansions. Release order: reference pools and splice buffers, then
    /// definition outputs, then the expansion arenas themselves. Token
    /// arrays owned outside the environment are untouched.
    pub fn destroy_expansions_invalidating_tokens(&mut self) {
        self.reference_pools.clear();
        self.references.clear();
        self.splices.clear();
        for definition in self.definitions.values_mut() {
            definition.output.clear();
        }
        self.definitions.clear();
        self.definition_order.clear();
        self.macro_expansions.clear();
    }
}

impl Drop for EvaluatorEnvironment {
    fn drop(&mut self) {
        // A warning only; the class invariant is that explicit teardown runs
        // once the caller can guarantee nobody points into the expansions.
        if !self.macro_expansions.is_empty() {
            warn!(
                expansions = self.macro_expansions.len(),
                "environment dropped without destroy_expansions_invalidating_tokens()"
            );
        }
    }
}

/// Builds a single-symbol token array for internally synthesized names such
/// as the module's `<global>` definition.
pub fn make_internal_token_slice(contents: &str) -> TokenSlice {
    let token = Token {
        kind: TokenKind::Symbol,
        contents: contents.to_string(),
        source: "<internal>".into(),
        line: 0,
        column_start: 0,
        column_end: 0,
        span: Span::default(),
    };
    Rc::from(vec![token])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_ref(contents: &str) -> TokenRef {
        let tokens = make_internal_token_slice(contents);
        TokenRef::new(&tokens, 0)
    }

    #[test]
    fn duplicate_definitions_are_reported_once_with_note() {
        let mut environment = EvaluatorEnvironment::new(BuildOptions::default());
        let first = ObjectDefinition::new(name_ref("thing"), ObjectKind::Function, true);
        let second = ObjectDefinition::new(name_ref("thing"), ObjectKind::Function, true);
        assert!(environment.add_object_definition(first));
        assert!(!environment.add_object_definition(second));
        assert_eq!(environment.error_count(), 1);
        assert!(environment.errors[0].render().contains("first defined here"));
    }

    #[test]
    fn definition_name_conflicting_with_builtin_is_rejected() {
        let mut environment = EvaluatorEnvironment::new(BuildOptions::default());
        let clash = ObjectDefinition::new(name_ref("defun"), ObjectKind::Function, true);
        assert!(!environment.add_object_definition(clash));
        assert_eq!(environment.error_count(), 1);
    }

    #[test]
    fn guess_state_never_regresses() {
        let mut status = ReferenceStatus {
            name: name_ref("x"),
            references: Vec::new(),
            guess_state: GuessState::None,
        };
        assert!(status.transition(GuessState::Guessed));
        // Guessed may not fall back to WaitingForLoad.
        assert!(!status.transition(GuessState::WaitingForLoad));
        assert_eq!(status.guess_state, GuessState::Guessed);
        assert!(status.transition(GuessState::Resolved));
        assert!(!status.transition(GuessState::None));
        assert_eq!(status.guess_state, GuessState::Resolved);
    }

    #[test]
    fn references_land_in_status_and_pool() {
        let mut environment = EvaluatorEnvironment::new(BuildOptions::default());
        let global_name = name_ref(GLOBAL_DEFINITION_NAME);
        environment.add_object_definition(ObjectDefinition::new(
            global_name,
            ObjectKind::Function,
            true,
        ));

        let call_site = make_internal_token_slice("callee");
        let splice = environment.new_splice();
        let context = EvaluatorContext::module(environment.module_environment.clone());
        let reference = ObjectReference {
            tokens: call_site.clone(),
            start_index: 0,
            context,
            splice,
            is_resolved: false,
        };
        let (id, state) = environment
            .add_object_reference(&TokenRef::new(&call_site, 0), reference)
            .expect("reference should register");
        assert_eq!(state, GuessState::None);
        assert_eq!(environment.reference_pools["callee"], vec![id]);
        let status = &environment.definitions[GLOBAL_DEFINITION_NAME].references["callee"];
        assert_eq!(status.references, vec![id]);
    }
}
