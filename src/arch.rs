//! The architecture backend interface.
//!
//! A backend knows how to decode bytes into [`Instruction`] records, how to
//! enumerate the machine's registers, and which of its control-transfer
//! instructions carry delay slots. Backends are intentionally small; the
//! per-instruction behavior itself lives behind opaque semantics functions
//! (see [`crate::semantics`]).

use crate::ir::Type;

/// The control-flow category of a decoded instruction. This is what the
/// lifter dispatches on; everything else about the instruction is opaque.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Category {
    /// Decoding failed, or the byte sequence was empty.
    #[default]
    Invalid,
    /// A valid instruction whose semantics trap the processor, e.g. x86's
    /// `ud2`.
    Error,
    Normal,
    NoOp,
    DirectJump,
    IndirectJump,
    ConditionalIndirectJump,
    FunctionReturn,
    ConditionalFunctionReturn,
    DirectFunctionCall,
    ConditionalDirectFunctionCall,
    IndirectFunctionCall,
    ConditionalIndirectFunctionCall,
    ConditionalBranch,
    /// A non-local transfer such as a system call.
    AsyncHyperCall,
    ConditionalAsyncHyperCall,
}

impl Category {
    /// Whether the instruction's effect is predicated on a condition the
    /// semantics report through the branch-taken flag.
    pub fn is_conditional(self) -> bool {
        matches!(
            self,
            Category::ConditionalIndirectJump
                | Category::ConditionalFunctionReturn
                | Category::ConditionalDirectFunctionCall
                | Category::ConditionalIndirectFunctionCall
                | Category::ConditionalBranch
                | Category::ConditionalAsyncHyperCall
        )
    }

    /// Whether the instruction is some form of function call.
    pub fn is_function_call(self) -> bool {
        matches!(
            self,
            Category::DirectFunctionCall
                | Category::ConditionalDirectFunctionCall
                | Category::IndirectFunctionCall
                | Category::ConditionalIndirectFunctionCall
        )
    }
}

/// A decoded instruction.
///
/// The program-counter fields describe every address the instruction can
/// involve: `next_pc` is the fall-through, `branch_taken_pc` and
/// `branch_not_taken_pc` are the two outcomes of a (possibly conditional)
/// transfer, and `delayed_pc` is the address of a delay-slot instruction if
/// the architecture reports one.
#[derive(Clone, Debug, Default)]
pub struct Instruction {
    pub pc: u64,
    pub next_pc: u64,
    pub branch_taken_pc: u64,
    pub branch_not_taken_pc: u64,
    pub delayed_pc: u64,
    pub category: Category,
    /// The bytes the decoder consumed.
    pub bytes: Vec<u8>,
    /// The name of the semantics function modelling this instruction.
    pub sem: String,
}

impl Instruction {
    pub fn is_valid(&self) -> bool {
        self.category != Category::Invalid
    }

    pub fn is_error(&self) -> bool {
        self.category == Category::Error
    }
}

/// A machine register. Sub-registers name their enclosing register;
/// top-level registers have no parent and are the ones that appear as slots
/// of the emulated state structure.
#[derive(Clone, Debug)]
pub struct Register {
    pub name: String,
    pub bits: u16,
    pub parent: Option<String>,
}

impl Register {
    pub fn new(name: &str, bits: u16) -> Self {
        Self {
            name: name.to_string(),
            bits,
            parent: None,
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    pub fn ty(&self) -> Type {
        Type::Int(self.bits)
    }
}

/// An architecture backend.
pub trait Arch {
    fn name(&self) -> &str;

    /// Pointer width in bits.
    fn address_bits(&self) -> u16;

    /// The maximum number of bytes a single instruction can occupy. The
    /// lifter asks the byte oracle for at most this many bytes per decode.
    fn max_instruction_size(&self) -> usize;

    fn registers(&self) -> &[Register];

    fn register_by_name(&self, name: &str) -> Option<&Register> {
        self.registers().iter().find(|r| r.name == name)
    }

    fn program_counter_register(&self) -> &str;

    fn stack_pointer_register(&self) -> &str;

    /// Decode the instruction at `addr` from `bytes`. Returns `None` when
    /// the bytes do not form an instruction.
    fn decode(&self, addr: u64, bytes: &[u8]) -> Option<Instruction>;

    /// Decode an instruction that sits in the delay slot of another
    /// instruction. Some architectures restrict what may appear there.
    fn decode_delayed(&self, addr: u64, bytes: &[u8]) -> Option<Instruction> {
        self.decode(addr, bytes)
    }

    /// Whether the instruction following `inst` occupies a delay slot.
    fn may_have_delay_slot(&self, inst: &Instruction) -> bool;

    /// Whether `delayed` actually executes on the given path of `inst`.
    /// Architectures with annulment bits suppress the delay slot on the
    /// not-taken path of some branches.
    fn next_instruction_is_delayed(
        &self,
        inst: &Instruction,
        delayed: &Instruction,
        on_taken_path: bool,
    ) -> bool;

    /// SPARC calling conventions hide a structure-return size in an `unimp`
    /// word after some calls; the lifter probes for it only on SPARC.
    fn is_sparc(&self) -> bool {
        false
    }
}
