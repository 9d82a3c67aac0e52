//! The semantics-template seam.
//!
//! Lifted code follows a three-argument convention: every semantics function
//! and transfer intrinsic takes `(state pointer, memory pointer, program
//! counter)` and returns the new memory pointer. The lifter threads the
//! memory pointer through a `MEMORY` scratch slot, and exposes two further
//! slots the semantics may write through out-pointers: `BRANCH_TAKEN`, set
//! by conditional instructions, and `RETURN_PC`, set by calls to the address
//! execution should resume at.
//!
//! The default [`SemanticsBinder`] binds each decoded instruction to an
//! opaque external function named after its selector, so instruction
//! behavior stays outside the lifter. A semantics library (or a test) may
//! define bodies for those functions; defined bodies are inlined away by the
//! post-lift cleanup.

use crate::arch::Instruction;
use crate::ir::{BlockId, FuncBody, FuncId, FuncType, Inst, InstId, Module, Terminator, Type, Value};

/// Scratch slot holding the current memory pointer.
pub const MEMORY_VAR: &str = "MEMORY";
/// Scratch slot conditional semantics set to non-zero on the taken path.
pub const BRANCH_TAKEN_VAR: &str = "BRANCH_TAKEN";
/// Scratch slot call semantics fill with the expected return address.
pub const RETURN_PC_VAR: &str = "RETURN_PC";
/// State slot holding the address of the next instruction to execute.
pub const NEXT_PC_VAR: &str = "NEXT_PC";

pub const SEMANTICS_PREFIX: &str = "__sem_";
pub const MEMORY_ESCAPE_FN: &str = "__lift_memory_escape";
pub const RETURN_ADDRESS_FN: &str = "__lift_return_address";
pub const SYMBOLIC_PC: &str = "__lift_pc";
pub const SYMBOLIC_SP: &str = "__lift_sp";
pub const SYMBOLIC_RA: &str = "__lift_ra";
pub const UNMODELLED_REG_PREFIX: &str = "__lift_reg_";
pub const TYPE_HINT_PREFIX: &str = "__lift_type_";

/// The type of a transfer intrinsic or unadorned semantics function.
pub fn transfer_type(addr_bits: u16) -> FuncType {
    FuncType::new(
        vec![Type::Ptr, Type::Ptr, Type::Int(addr_bits)],
        Type::Ptr,
    )
}

/// Opaque stand-ins for control transfers the lifter cannot resolve.
#[derive(Clone, Copy, Debug)]
pub struct IntrinsicTable {
    pub error: FuncId,
    pub jump: FuncId,
    pub function_call: FuncId,
    pub function_return: FuncId,
    pub async_hyper_call: FuncId,
}

impl IntrinsicTable {
    pub fn new(module: &mut Module, addr_bits: u16) -> Self {
        let mut declare = |name: &str| {
            let f = module.declare_function(name, transfer_type(addr_bits), 0);
            module.func_mut(f).no_inline = true;
            f
        };
        Self {
            error: declare("__lift_error"),
            jump: declare("__lift_jump"),
            function_call: declare("__lift_function_call"),
            function_return: declare("__lift_function_return"),
            async_hyper_call: declare("__lift_async_hyper_call"),
        }
    }
}

/// Get or declare the opaque memory-read helper for one value width.
pub fn read_memory_intrinsic(module: &mut Module, addr_bits: u16, val_bits: u16) -> FuncId {
    let name = format!("__lift_read_mem{}", val_bits);
    let ty = FuncType::new(vec![Type::Ptr, Type::Int(addr_bits)], Type::Int(val_bits));
    let f = module.declare_function(&name, ty, 0);
    module.func_mut(f).no_inline = true;
    f
}

/// Get or declare the opaque memory-write helper for one value width.
/// Returns the new memory pointer, keeping writes ordered by data flow.
pub fn write_memory_intrinsic(module: &mut Module, addr_bits: u16, val_bits: u16) -> FuncId {
    let name = format!("__lift_write_mem{}", val_bits);
    let ty = FuncType::new(
        vec![Type::Ptr, Type::Int(addr_bits), Type::Int(val_bits)],
        Type::Ptr,
    );
    let f = module.declare_function(&name, ty, 0);
    module.func_mut(f).no_inline = true;
    f
}

/// The helper every native wrapper passes its final memory pointer to, so
/// terminal memory writes cannot be optimized away.
pub fn memory_escape_intrinsic(module: &mut Module) -> FuncId {
    let f = module.declare_function(
        MEMORY_ESCAPE_FN,
        FuncType::new(vec![Type::Ptr], Type::Void),
        0,
    );
    module.func_mut(f).no_inline = true;
    f
}

/// The compiler intrinsic yielding the current frame's return address.
pub fn return_address_intrinsic(module: &mut Module) -> FuncId {
    let f = module.declare_function(RETURN_ADDRESS_FN, FuncType::new(vec![], Type::Ptr), 0);
    module.func_mut(f).no_inline = true;
    module.func_mut(f).read_none = true;
    f
}

/// The scratch slots of one in-progress lifted function.
#[derive(Clone, Debug)]
pub struct LiftedLocals {
    pub memory: Value,
    pub branch_taken: Value,
    pub return_pc: Value,
}

/// Allocate the scratch slots in the entry block of a lifted function and
/// seed the memory slot from the memory-pointer argument.
pub fn create_locals(
    body: &mut FuncBody,
    block: BlockId,
    addr_bits: u16,
    mem_arg: Value,
) -> LiftedLocals {
    let memory = body.alloca(block, Type::Ptr);
    body.store(block, memory.clone(), mem_arg);
    let branch_taken = body.alloca(block, Type::Int(8));
    body.store(block, branch_taken.clone(), Value::int(8, 0));
    let return_pc = body.alloca(block, Type::Int(addr_bits));
    LiftedLocals {
        memory,
        branch_taken,
        return_pc,
    }
}

pub fn load_memory_pointer(body: &mut FuncBody, block: BlockId, locals: &LiftedLocals) -> Value {
    body.load(block, Type::Ptr, locals.memory.clone())
}

pub fn load_branch_taken(body: &mut FuncBody, block: BlockId, locals: &LiftedLocals) -> Value {
    body.load(block, Type::Int(8), locals.branch_taken.clone())
}

/// Terminate `block` with a tail call to a transfer intrinsic, passing the
/// state pointer, the current memory pointer, and the address found in the
/// state's `NEXT_PC` slot. Returns the call so the caller may mute it.
pub fn add_terminating_tail_call(
    module: &mut Module,
    func: FuncId,
    block: BlockId,
    state: Value,
    locals: &LiftedLocals,
    intrinsic: FuncId,
    addr_bits: u16,
) -> InstId {
    let body = module.body_mut(func);
    let mem = load_memory_pointer(body, block, locals);
    let next_pc_ptr = body.reg_addr(block, state.clone(), NEXT_PC_VAR, Type::Int(addr_bits));
    let pc = body.load(block, Type::Int(addr_bits), next_pc_ptr);
    let call = body.call(block, intrinsic, vec![state, mem, pc]);
    let call_id = call.as_inst().unwrap();
    body.set_term(block, Terminator::Ret(call));
    call_id
}

/// Replace the state-pointer argument of a transfer-intrinsic call with an
/// undefined value. What reached the program-counter argument stays
/// observable, while the state pointer no longer escapes through the call.
pub fn mute_state_escape(body: &mut FuncBody, call: InstId) {
    if let Inst::Call { args, .. } = &mut body.insts[call] {
        args[0] = Value::undef(Type::Ptr);
    }
}

/// Emits IR modelling one decoded instruction into a block.
pub trait InstructionSemantics {
    fn lift_into_block(
        &self,
        module: &mut Module,
        func: FuncId,
        block: BlockId,
        state: &Value,
        locals: &LiftedLocals,
        inst: &Instruction,
        is_delayed: bool,
    );
}

/// Binds each instruction to an opaque per-selector semantics function.
///
/// Conditional instructions receive a fourth pointer argument for the
/// branch-taken flag; calls receive a further pointer for the return
/// address. The bound function returns the new memory pointer, which is
/// written back to the `MEMORY` slot.
pub struct SemanticsBinder {
    addr_bits: u16,
    pc_reg: String,
}

impl SemanticsBinder {
    pub fn new(addr_bits: u16, pc_reg: String) -> Self {
        Self { addr_bits, pc_reg }
    }
}

impl InstructionSemantics for SemanticsBinder {
    fn lift_into_block(
        &self,
        module: &mut Module,
        func: FuncId,
        block: BlockId,
        state: &Value,
        locals: &LiftedLocals,
        inst: &Instruction,
        is_delayed: bool,
    ) {
        let bits = self.addr_bits;
        let mut ty = transfer_type(bits);
        if inst.category.is_conditional() {
            ty.params.push(Type::Ptr);
        }
        if inst.category.is_function_call() {
            ty.params.push(Type::Ptr);
        }
        let name = format!("{}{}", SEMANTICS_PREFIX, inst.sem);
        let sem = module.declare_function(&name, ty, 0);

        let body = module.body_mut(func);
        // A delayed instruction executes as part of its transfer; only the
        // primary instruction re-aims the program counter slots.
        if !is_delayed {
            let pc_ptr = body.reg_addr(block, state.clone(), &self.pc_reg, Type::Int(bits));
            body.store(block, pc_ptr, Value::int(bits, inst.pc));
            let next_pc_ptr = body.reg_addr(block, state.clone(), NEXT_PC_VAR, Type::Int(bits));
            body.store(block, next_pc_ptr, Value::int(bits, inst.next_pc));
        }
        let mem = load_memory_pointer(body, block, locals);
        let mut args = vec![state.clone(), mem, Value::int(bits, inst.pc)];
        if inst.category.is_conditional() {
            args.push(locals.branch_taken.clone());
        }
        if inst.category.is_function_call() {
            args.push(locals.return_pc.clone());
        }
        let new_mem = body.call(block, sem, args);
        body.store(block, locals.memory.clone(), new_mem);
    }
}
