//! Options that shape how functions are lifted.

use crate::arch::Arch;
use crate::providers::ControlFlowProvider;
use std::rc::Rc;

/// How the emulated state structure is filled in before the lifted body
/// runs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, clap::ValueEnum)]
pub enum StateInitProcedure {
    /// Leave the freshly allocated state uninitialized.
    None,
    /// Zero the whole structure.
    Zeroes,
    /// Store an undefined value over the whole structure.
    Undef,
    /// Copy one external global per top-level register into the state, so
    /// unmodelled dependencies surface as uses of those globals.
    RegGlobals,
    /// Zero the structure, then copy the register globals over it.
    RegGlobalsOverZeroes,
    /// Store undef over the structure, then copy the register globals.
    RegGlobalsOverUndef,
}

/// The configuration of one function lifter. Plain data; every lift made
/// through a lifter sees the same options.
#[derive(Clone)]
pub struct LifterOptions {
    pub arch: Rc<dyn Arch>,
    pub ctrl_flow_provider: Rc<dyn ControlFlowProvider>,
    pub state_init: StateInitProcedure,
    /// Seed the program counter with a relocatable `&__lift_pc + address`
    /// expression rather than a plain integer, so anything derived from it
    /// can be recognized as a cross-reference later.
    pub symbolic_pc: bool,
    /// Seed the stack pointer with the address of `__lift_sp`, which makes
    /// stack frame slots recoverable as offsets from that symbol.
    pub symbolic_sp: bool,
    /// Store the address of `__lift_ra` into the declared return-address
    /// location. When disabled, the current frame's actual return address
    /// is fetched through a compiler intrinsic instead.
    pub symbolic_ra: bool,
    /// When a type provider supplies a concrete register value alongside a
    /// hint, write that value into the state.
    pub store_inferred_register_values: bool,
    /// Ask the type provider for per-instruction register type hints and
    /// inject taint calls for pointer-typed ones.
    pub symbolic_register_types: bool,
}

impl LifterOptions {
    pub fn new(arch: Rc<dyn Arch>, ctrl_flow_provider: Rc<dyn ControlFlowProvider>) -> Self {
        Self {
            arch,
            ctrl_flow_provider,
            state_init: StateInitProcedure::Zeroes,
            symbolic_pc: true,
            symbolic_sp: true,
            symbolic_ra: true,
            store_inferred_register_values: true,
            symbolic_register_types: true,
        }
    }
}
