use relift::*;

use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;

use relift::entity_lifter::EntityLifter;
use relift::options::{LifterOptions, StateInitProcedure};
use relift::program::Program;
use relift::providers::{ControlFlowProvider, MemoryProvider, TypeProvider};

/// Lift machine code described by a JSON specification into IR
#[derive(Parser, Debug)]
#[command(about, version, author)]
enum Args {
    /// Lift every function declared in a JSON specification
    FromSpec {
        /// Path to the JSON specification of code to lift
        spec: PathBuf,
        /// Architecture name; overrides the spec's `arch` field
        /// (supported: mini32, mini32-sparc)
        #[arg(long)]
        arch: Option<String>,
        /// Path to write the textual IR of the lifted module; stdout if
        /// not given
        #[arg(long)]
        ir_out: Option<PathBuf>,
        /// How to initialize the emulated state structure
        #[arg(long, value_enum, default_value = "zeroes")]
        state_init: StateInitProcedure,
        /// Seed the program counter with a concrete integer instead of a
        /// relocatable symbolic expression
        #[arg(long)]
        concrete_program_counter: bool,
        /// Seed the stack pointer with whatever the state initialization
        /// left there instead of a symbolic stack base
        #[arg(long)]
        concrete_stack_pointer: bool,
        /// Store the real return address of the current frame instead of a
        /// symbolic return-address marker
        #[arg(long)]
        concrete_return_address: bool,
        /// Ignore per-instruction register type hints
        #[arg(long)]
        no_register_type_hints: bool,
        /// Do not write provider-supplied concrete register values into the
        /// state
        #[arg(long)]
        no_inferred_register_values: bool,
        /// Disable terminal logging, even for high severity alerts. Strongly
        /// discouraged for normal use.
        #[arg(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging instead of dropping messages
        /// under load
        #[arg(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        #[arg(long = "log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[arg(short, long, action = clap::ArgAction::Count)]
        debug: u8,
    },
}

fn arch_by_name(name: &str) -> Option<Rc<dyn arch::Arch>> {
    match name {
        "mini32" => Some(Rc::new(tests::MiniArch::new())),
        "mini32-sparc" => Some(Rc::new(tests::MiniArch::sparc_like())),
        _ => None,
    }
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromSpec {
            spec,
            arch,
            ir_out,
            state_init,
            concrete_program_counter,
            concrete_stack_pointer,
            concrete_return_address,
            no_register_type_hints,
            no_inferred_register_values,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug as usize,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            let text = match std::fs::read_to_string(&spec) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("Unable to read spec file {}: {}", spec.display(), e);
                    std::process::exit(1);
                }
            };

            let arch_name = arch.or_else(|| spec::peek_arch_name(&text).ok().flatten());
            let Some(arch_name) = arch_name else {
                eprintln!("No architecture given; pass --arch or add an `arch` field to the spec");
                std::process::exit(1);
            };
            let Some(arch) = arch_by_name(&arch_name) else {
                eprintln!("Unknown architecture `{}`", arch_name);
                std::process::exit(1);
            };

            let program = match spec::parse_spec(arch.as_ref(), &text) {
                Ok(program) => Rc::new(program),
                Err(e) => {
                    eprintln!("Unable to parse spec file {}: {}", spec.display(), e);
                    std::process::exit(1);
                }
            };

            let mut options = LifterOptions::new(
                arch,
                Rc::clone(&program) as Rc<dyn ControlFlowProvider>,
            );
            options.state_init = state_init;
            options.symbolic_pc = !concrete_program_counter;
            options.symbolic_sp = !concrete_stack_pointer;
            options.symbolic_ra = !concrete_return_address;
            options.symbolic_register_types = !no_register_type_hints;
            options.store_inferred_register_values = !no_inferred_register_values;

            let mut lifter = EntityLifter::new(
                options,
                Rc::clone(&program) as Rc<dyn MemoryProvider>,
                Rc::clone(&program) as Rc<dyn TypeProvider>,
            );

            for var in program.variables() {
                lifter.declare_variable(var);
            }
            for decl in program.functions() {
                let _ = lifter.lift_entity(decl);
            }

            apply_symbol_names(&mut lifter, &program);

            let output = lifter.module().to_string();
            match ir_out {
                Some(path) => {
                    if let Err(e) = std::fs::write(&path, output) {
                        eprintln!("Could not save IR to {}: {}", path.display(), e);
                        std::process::exit(1);
                    }
                }
                None => print!("{}", output),
            }
        }
    }
}

/// Give lifted entities the names the spec's symbol table assigns to their
/// addresses.
fn apply_symbol_names(lifter: &mut EntityLifter, program: &Program) {
    let symbols: Vec<(u64, String)> = program
        .symbols()
        .map(|(a, n)| (a, n.to_string()))
        .collect();
    for (addr, name) in symbols {
        if lifter.module().function_named(&name).is_some()
            || lifter.module().global_named(&name).is_some()
        {
            continue;
        }
        if let Some(decl) = program.function_at(addr) {
            let decl = decl.clone();
            if let Some(f) = lifter.declare_entity(&decl) {
                lifter.module_mut().set_func_name(f, &name);
            }
        } else if let Some(var) = program.variable_at(addr) {
            let var = var.clone();
            let g = lifter.declare_variable(&var);
            lifter.module_mut().set_global_name(g, &name);
        }
    }
}
