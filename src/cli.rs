//! Command-line entry point and translation pipeline orchestration.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Args, Parser, Subcommand};

use crate::builder;
use crate::diagnostics::{print_error, CinderError, ErrorKind};
use crate::environment::{
    make_internal_token_slice, BuildOptions, EvaluatorContext, EvaluatorEnvironment,
    ObjectDefinition, ObjectKind, GLOBAL_DEFINITION_NAME,
};
use crate::evaluator::evaluate_generate_all;
use crate::output::{GeneratorOutput, OutputMod, StringOutput};
use crate::token::{pretty_print_tokens, TokenRef, TokenSlice};
use crate::tokenizer::tokenize;
use crate::writer::write_module_output;

#[derive(Debug, Parser)]
#[command(
    name = "cinder",
    version,
    about = "S-expression to C/C++ transpiler with natively-compiled compile-time macros"
)]
pub struct CinderArgs {
    #[command(subcommand)]
    pub command: ArgsCommand,
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Directory for compile-time build artifacts.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// C++ compiler used for compile-time macros and generators.
    #[arg(long)]
    pub compiler: Option<PathBuf>,
    /// Maximum concurrent compiler/linker subprocesses.
    #[arg(long, default_value_t = 8)]
    pub max_processes: usize,
    /// Route module state variable access through pointers.
    #[arg(long)]
    pub hot_reload: bool,
}

impl BuildArgs {
    fn to_options(&self, input_file: &Path) -> BuildOptions {
        let mut options = BuildOptions::default();
        if let Some(cache_dir) = &self.cache_dir {
            options.cache_dir = cache_dir.clone();
        }
        if let Some(compiler) = &self.compiler {
            options.compiler = compiler.clone();
        }
        options.max_processes = self.max_processes.max(1);
        options.enable_hot_reloading = self.hot_reload;
        options.include_dir = input_file.parent().map(Path::to_path_buf);
        options
    }
}

#[derive(Debug, Subcommand)]
pub enum ArgsCommand {
    /// Full pipeline: tokenize, evaluate, build compile-time code, resolve,
    /// and write the generated source and header.
    Translate {
        /// The module to translate.
        file: PathBuf,
        /// Where to write the generated files (defaults beside the input).
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Dump the token array.
    Tokens { file: PathBuf },
    /// Run the pipeline and print every macro expansion it produced.
    Expand {
        file: PathBuf,
        #[command(flatten)]
        build: BuildArgs,
    },
}

/// The main entry point for the CLI.
pub fn run() {
    let args = CinderArgs::parse();

    match args.command {
        ArgsCommand::Translate {
            file,
            output_dir,
            build,
        } => {
            let options = build.to_options(&file);
            process::exit(translate_command(&file, output_dir.as_deref(), options));
        }

        ArgsCommand::Tokens { file } => {
            let source_text = read_file_or_exit(&file);
            match tokenize(&file.display().to_string(), &source_text) {
                Ok(tokens) => {
                    for token in tokens.iter() {
                        println!(
                            "{}\tline {}, chars {}-{}\t{}",
                            token.kind.as_str(),
                            token.line,
                            token.column_start,
                            token.column_end,
                            token.contents
                        );
                    }
                }
                Err(error) => {
                    print_error(error);
                    process::exit(1);
                }
            }
        }

        ArgsCommand::Expand { file, build } => {
            let options = build.to_options(&file);
            let mut environment = EvaluatorEnvironment::new(options);
            let exit_code = match run_translation(&mut environment, &file) {
                Ok(()) => {
                    for expansion in &environment.macro_expansions {
                        print!("{}", pretty_print_tokens(expansion));
                    }
                    0
                }
                Err(()) => 1,
            };
            environment.destroy_expansions_invalidating_tokens();
            process::exit(exit_code);
        }
    }
}

fn translate_command(file: &Path, output_dir: Option<&Path>, options: BuildOptions) -> i32 {
    let mut environment = EvaluatorEnvironment::new(options);
    let exit_code = match run_translation(&mut environment, file) {
        Ok(()) => {
            let stem = file
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "module".into());
            let directory = output_dir
                .map(Path::to_path_buf)
                .or_else(|| file.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."));
            let header_name = format!("{stem}.hpp");
            let (source_text, header_text) =
                write_module_output(&environment, &file.display().to_string(), &header_name);

            let write_result = fs::write(directory.join(format!("{stem}.cpp")), source_text)
                .and_then(|_| fs::write(directory.join(&header_name), header_text));
            match write_result {
                Ok(()) => 0,
                Err(io_error) => {
                    eprintln!("error: could not write output: {io_error}");
                    1
                }
            }
        }
        Err(()) => 1,
    };
    environment.destroy_expansions_invalidating_tokens();
    exit_code
}

/// Tokenizes and evaluates the module, runs the fixed-point loop, and prints
/// every collected diagnostic. `Err` means no output may be written.
pub fn run_translation(environment: &mut EvaluatorEnvironment, file: &Path) -> Result<(), ()> {
    let file_name = file.display().to_string();
    let source_text = match fs::read_to_string(file) {
        Ok(source_text) => source_text,
        Err(io_error) => {
            print_error(CinderError::new(ErrorKind::Io {
                message: format!("could not read {file_name}: {io_error}"),
            }));
            return Err(());
        }
    };
    environment.register_source(&file_name, &source_text);

    let tokens = match tokenize(&file_name, &source_text) {
        Ok(tokens) => tokens,
        Err(error) => {
            environment.push_error(error);
            print_diagnostics(environment);
            return Err(());
        }
    };

    let evaluation_errors = evaluate_module_tokens(environment, &tokens);
    if evaluation_errors != 0 || environment.error_count() != 0 {
        print_diagnostics(environment);
        return Err(());
    }

    let resolved = builder::evaluate_resolve_references(environment);
    print_diagnostics(environment);
    if resolved {
        Ok(())
    } else {
        Err(())
    }
}

/// Evaluates a module's top-level tokens into the `<global>` definition,
/// creating it if needed. Returns the evaluation error count.
pub fn evaluate_module_tokens(
    environment: &mut EvaluatorEnvironment,
    tokens: &TokenSlice,
) -> usize {
    if !environment.definitions.contains_key(GLOBAL_DEFINITION_NAME) {
        let global_name = make_internal_token_slice(GLOBAL_DEFINITION_NAME);
        let global = ObjectDefinition::new(
            TokenRef::new(&global_name, 0),
            ObjectKind::Function,
            true,
        );
        environment.add_object_definition(global);
    }

    let module_context = EvaluatorContext::module(environment.module_environment.clone());
    let body_delimiter = StringOutput::delimiter("", OutputMod::NEWLINE_AFTER);
    let mut module_output = GeneratorOutput::new();
    let num_errors = evaluate_generate_all(
        environment,
        &module_context,
        tokens,
        0,
        Some(&body_delimiter),
        &mut module_output,
    );

    if let Some(global) = environment.definitions.get_mut(GLOBAL_DEFINITION_NAME) {
        global.output = module_output;
    }
    num_errors
}

fn print_diagnostics(environment: &EvaluatorEnvironment) {
    for error in &environment.errors {
        eprintln!("{}", error.render());
    }
}

fn read_file_or_exit(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(io_error) => {
            eprintln!("error: could not read {}: {io_error}", path.display());
            process::exit(1);
        }
    }
}
