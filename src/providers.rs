//! Interfaces through which the lifter observes the program being lifted.
//!
//! All three providers must be reentrant for read-only queries; the lifter
//! calls them synchronously while it holds its own state mutably.

use crate::ir::Type;
use crate::program::FunctionDecl;

/// Whether a byte exists at an address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ByteAvailability {
    /// The address is valid but the byte's value is not known (e.g. a
    /// zero-fill region whose contents are loaded at runtime).
    Unknown,
    /// The address is not mapped at all.
    Unavailable,
    Available,
}

impl ByteAvailability {
    /// The address itself is usable, even if the byte value is not known.
    pub fn is_valid_address(self) -> bool {
        self != ByteAvailability::Unavailable
    }

    /// The byte's value can actually be read.
    pub fn has_byte(self) -> bool {
        self == ByteAvailability::Available
    }
}

/// Access permissions of a byte. `Unknown` is treated optimistically.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BytePermission {
    Unknown,
    Readable,
    ReadableWritable,
    ReadableExecutable,
    ReadableWritableExecutable,
}

impl BytePermission {
    pub fn is_executable(self) -> bool {
        matches!(
            self,
            BytePermission::Unknown
                | BytePermission::ReadableExecutable
                | BytePermission::ReadableWritableExecutable
        )
    }
}

/// A byte-granular oracle over the program's memory image.
pub trait MemoryProvider {
    fn query(&self, addr: u64) -> (u8, ByteAvailability, BytePermission);
}

/// Per-address type information: function signatures at entry points, and
/// register type hints at individual instructions.
pub trait TypeProvider {
    /// The declaration of the function whose entry is at `addr`, if known.
    fn try_get_function_type(&self, addr: u64) -> Option<FunctionDecl>;

    /// Invoke `visitor` with `(register name, type, known value)` for every
    /// typed register the provider knows about at `inst_pc` inside the
    /// function entered at `func_addr`.
    fn query_register_state_at_instruction(
        &self,
        func_addr: u64,
        inst_pc: u64,
        visitor: &mut dyn FnMut(&str, &Type, Option<u64>),
    );
}

/// Rewrites control-flow targets, modelling trampolines and hook rewrites.
/// Applied to every target address before block lookup.
pub trait ControlFlowProvider {
    /// The address control actually transfers to when aiming at `addr`.
    /// Identity when no redirection applies.
    fn redirection(&self, addr: u64) -> u64;
}

/// The identity control-flow provider.
#[derive(Debug, Default)]
pub struct NullControlFlowProvider;

impl ControlFlowProvider for NullControlFlowProvider {
    fn redirection(&self, addr: u64) -> u64 {
        addr
    }
}
