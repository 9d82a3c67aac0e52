//! Lifts one machine-code function at a time into IR.
//!
//! Lifting is driven by a work list of control-flow edges. Asking for the
//! block of a successor address enqueues the edge `(from PC, to PC)`; the
//! main loop pops edges, decodes the destination instruction once per
//! address, emits its semantics, and dispatches on its control-flow category
//! to wire up successors. Edges are keyed by both endpoints rather than the
//! destination alone, so a transfer back to the function's own entry is
//! recognized and lowered as a call, not as a back-edge into the first
//! block.
//!
//! Each lifted function comes in two parts. The inner "lifted" function has
//! the three-argument form (state pointer, memory pointer, program counter)
//! and contains one block per decoded edge. The outer "native" function
//! carries the declared ABI: it stack-allocates the emulated state, seeds
//! the program counter, stack pointer, and return address, writes the
//! high-level arguments into their declared locations, calls the inner
//! function, and reads the declared returns back out. After the work list
//! drains, the cleanup pipeline flattens the inner function into the
//! wrapper and simplifies the result.

use std::collections::BTreeSet;
use std::rc::Rc;

use crate::abi;
use crate::arch::{Category, Instruction};
use crate::containers::unordered::UnorderedMap;
use crate::ir::{
    BlockId, Const, FuncId, FuncType, InstId, Module, Terminator, Type, Value,
};
use crate::log::*;
use crate::options::{LifterOptions, StateInitProcedure};
use crate::passes;
use crate::program::{type_digest, FunctionDecl, ValueDecl};
use crate::providers::{MemoryProvider, TypeProvider};
use crate::semantics::{
    self, InstructionSemantics, IntrinsicTable, LiftedLocals, SemanticsBinder,
};

/// The state pointer argument of a lifted (inner) function.
fn state_arg() -> Value {
    Value::Arg(0)
}

/// Lifts functions into a semantics module it owns. One lift at a time; the
/// per-function maps are cleared on entry to [`FunctionLifter::lift_function`].
/// The name-to-address map accumulates across lifts so callers can
/// reassociate emitted entities with their native addresses.
pub struct FunctionLifter {
    options: LifterOptions,
    memory_provider: Rc<dyn MemoryProvider>,
    type_provider: Rc<dyn TypeProvider>,
    semantics: Module,
    intrinsics: IntrinsicTable,
    binder: SemanticsBinder,
    is_sparc: bool,
    addr_bits: u16,

    // Per-lift state below.
    func_address: u64,
    native_func: Option<FuncId>,
    lifted_func: Option<FuncId>,
    locals: Option<LiftedLocals>,
    /// PC of the instruction currently being dispatched; `None` at entry.
    curr_pc: Option<u64>,
    /// Pending `(to PC, from PC)` edges, popped in address order.
    edge_work_list: BTreeSet<(u64, u64)>,
    /// Block for each `(from PC, to PC)` edge.
    edge_to_dest_block: UnorderedMap<(u64, u64), BlockId>,
    /// First block actually lifted for each PC; later edges to the same PC
    /// branch here instead of decoding again.
    addr_to_block: UnorderedMap<u64, BlockId>,
    addr_to_func: UnorderedMap<u64, FuncId>,
    addr_to_decl: UnorderedMap<u64, FunctionDecl>,
    func_name_to_address: UnorderedMap<String, u64>,
}

impl FunctionLifter {
    pub fn new(
        options: LifterOptions,
        memory_provider: Rc<dyn MemoryProvider>,
        type_provider: Rc<dyn TypeProvider>,
    ) -> Self {
        let addr_bits = options.arch.address_bits();
        let is_sparc = options.arch.is_sparc();
        let pc_reg = options.arch.program_counter_register().to_string();
        let mut semantics = Module::new("semantics");
        let intrinsics = IntrinsicTable::new(&mut semantics, addr_bits);
        Self {
            options,
            memory_provider,
            type_provider,
            semantics,
            intrinsics,
            binder: SemanticsBinder::new(addr_bits, pc_reg),
            is_sparc,
            addr_bits,
            func_address: 0,
            native_func: None,
            lifted_func: None,
            locals: None,
            curr_pc: None,
            edge_work_list: BTreeSet::new(),
            edge_to_dest_block: UnorderedMap::default(),
            addr_to_block: UnorderedMap::default(),
            addr_to_func: UnorderedMap::default(),
            addr_to_decl: UnorderedMap::default(),
            func_name_to_address: UnorderedMap::default(),
        }
    }

    pub fn options(&self) -> &LifterOptions {
        &self.options
    }

    /// The module holding all in-progress and finished lifts.
    pub fn semantics_module(&self) -> &Module {
        &self.semantics
    }

    pub fn semantics_module_mut(&mut self) -> &mut Module {
        &mut self.semantics
    }

    /// The native address a generated function name refers to, if any.
    pub fn address_of_named_function(&self, name: &str) -> Option<u64> {
        self.func_name_to_address.get(name).copied()
    }

    fn lifted(&self) -> FuncId {
        self.lifted_func.expect("no function is being lifted")
    }

    fn locals(&self) -> LiftedLocals {
        self.locals.clone().expect("no function is being lifted")
    }

    /// The block that will hold the instruction at `addr`, reached from the
    /// instruction currently being lifted (or from nowhere, at entry).
    /// Creating the block enqueues the edge for decoding; the work list is
    /// never consulted against the PC map here, so a self-tail-call still
    /// gets its own edge and can be recognized as a call later.
    fn get_or_create_block(&mut self, addr: u64) -> BlockId {
        let from_pc = self.curr_pc.unwrap_or(0);
        if let Some(&block) = self.edge_to_dest_block.get(&(from_pc, addr)) {
            return block;
        }
        let lifted = self.lifted();
        let block = self
            .semantics
            .body_mut(lifted)
            .new_block(format!("inst_{:x}", addr));
        self.edge_to_dest_block.insert((from_pc, addr), block);
        self.edge_work_list.insert((addr, from_pc));
        block
    }

    /// Like [`Self::get_or_create_block`], but routed through the
    /// control-flow redirection provider first.
    fn get_or_create_target_block(&mut self, addr: u64) -> BlockId {
        let redirected = self.options.ctrl_flow_provider.redirection(addr);
        self.get_or_create_block(redirected)
    }

    /// Decode the instruction at `addr`. Reads up to the architecture's
    /// maximum instruction size, stopping at the first byte that is missing
    /// or not executable.
    fn decode_instruction(&self, addr: u64, is_delayed: bool) -> Option<Instruction> {
        let max = self.options.arch.max_instruction_size();
        let mut bytes = Vec::with_capacity(max);
        for i in 0..max as u64 {
            let (byte, availability, perms) = self.memory_provider.query(addr + i);
            if !availability.has_byte() || !perms.is_executable() {
                break;
            }
            bytes.push(byte);
        }
        if is_delayed {
            self.options.arch.decode_delayed(addr, &bytes)
        } else {
            self.options.arch.decode(addr, &bytes)
        }
    }

    fn terminating_tail_call(&mut self, block: BlockId, intrinsic: FuncId) -> InstId {
        let locals = self.locals();
        let lifted = self.lifted();
        semantics::add_terminating_tail_call(
            &mut self.semantics,
            lifted,
            block,
            state_arg(),
            &locals,
            intrinsic,
            self.addr_bits,
        )
    }

    /// A non-terminating call to a transfer intrinsic; execution continues
    /// in the same block, with the returned memory pointer stored back.
    fn add_intrinsic_call(&mut self, block: BlockId, intrinsic: FuncId) {
        let locals = self.locals();
        let lifted = self.lifted();
        let addr_bits = self.addr_bits;
        let body = self.semantics.body_mut(lifted);
        let mem = semantics::load_memory_pointer(body, block, &locals);
        let next_pc_ptr = body.reg_addr(
            block,
            state_arg(),
            semantics::NEXT_PC_VAR,
            Type::Int(addr_bits),
        );
        let pc = body.load(block, Type::Int(addr_bits), next_pc_ptr);
        let new_mem = body.call(block, intrinsic, vec![state_arg(), mem, pc]);
        body.store(block, locals.memory.clone(), new_mem);
    }

    /// Split `block` on the branch-taken flag, yielding the taken and
    /// not-taken successor blocks.
    fn emit_condition(&mut self, block: BlockId) -> (BlockId, BlockId) {
        let locals = self.locals();
        let lifted = self.lifted();
        let body = self.semantics.body_mut(lifted);
        let cond = semantics::load_branch_taken(body, block, &locals);
        let taken = body.new_block("");
        let not_taken = body.new_block("");
        body.set_term(
            block,
            Terminator::CondBr {
                cond,
                taken,
                not_taken,
            },
        );
        (taken, not_taken)
    }

    fn set_term(&mut self, block: BlockId, term: Terminator) {
        let lifted = self.lifted();
        self.semantics.body_mut(lifted).set_term(block, term);
    }

    // --- category visitors -------------------------------------------------

    /// An invalid instruction: a byte sequence that did not decode, or an
    /// empty one.
    fn visit_invalid(&mut self, block: BlockId) {
        let call = self.terminating_tail_call(block, self.intrinsics.error);
        let lifted = self.lifted();
        semantics::mute_state_escape(self.semantics.body_mut(lifted), call);
    }

    /// An error instruction is valid but traps the processor. Unlike an
    /// invalid instruction it may carry a delay slot, whose instruction
    /// executes before the trap.
    fn visit_error(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        self.visit_delayed_instruction(inst, delayed, block, true);
        self.visit_invalid(block);
    }

    fn visit_normal(&mut self, inst: &Instruction, block: BlockId) {
        let target = self.get_or_create_target_block(inst.next_pc);
        self.set_term(block, Terminator::Br(target));
    }

    fn visit_direct_jump(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        self.visit_delayed_instruction(inst, delayed, block, true);
        let target = self.get_or_create_target_block(inst.branch_taken_pc);
        self.set_term(block, Terminator::Br(target));
    }

    /// The target of an indirect jump is unknown, so the block ends with a
    /// tail call to the jump intrinsic, which stands in for "transfer to
    /// whatever the state says".
    fn visit_indirect_jump(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        self.visit_delayed_instruction(inst, delayed, block, true);
        self.terminating_tail_call(block, self.intrinsics.jump);
    }

    fn visit_conditional_indirect_jump(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        let (taken, not_taken) = self.emit_condition(block);
        self.visit_delayed_instruction(inst, delayed, taken, true);
        self.visit_delayed_instruction(inst, delayed, not_taken, false);
        self.terminating_tail_call(taken, self.intrinsics.jump);
        let target = self.get_or_create_target_block(inst.branch_not_taken_pc);
        self.set_term(not_taken, Terminator::Br(target));
    }

    fn visit_function_return(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        self.visit_delayed_instruction(inst, delayed, block, true);
        let call = self.terminating_tail_call(block, self.intrinsics.function_return);
        let lifted = self.lifted();
        semantics::mute_state_escape(self.semantics.body_mut(lifted), call);
    }

    fn visit_conditional_function_return(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        let (taken, not_taken) = self.emit_condition(block);
        self.visit_delayed_instruction(inst, delayed, taken, true);
        let call = self.terminating_tail_call(taken, self.intrinsics.function_return);
        let lifted = self.lifted();
        semantics::mute_state_escape(self.semantics.body_mut(lifted), call);
        self.visit_delayed_instruction(inst, delayed, not_taken, false);
        let target = self.get_or_create_target_block(inst.branch_not_taken_pc);
        self.set_term(not_taken, Terminator::Br(target));
    }

    /// Resolve the declaration to call when control aims at `address`:
    /// consult the redirection first, ask the type provider at the
    /// redirected address, and fall back to the original address. The
    /// returned declaration is rebased onto the redirected address.
    fn try_get_target_function_type(&self, address: u64) -> Option<FunctionDecl> {
        let redirected = self.options.ctrl_flow_provider.redirection(address);
        let mut decl = self.type_provider.try_get_function_type(redirected);
        if decl.is_none() && redirected != address {
            decl = self.type_provider.try_get_function_type(address);
        }
        let mut decl = decl?;
        decl.address = redirected;
        Some(decl)
    }

    /// Try to lower a direct call at `inst` into an ABI-correct call to the
    /// declared function at its target. Falls back to the opaque call
    /// intrinsic when there is no usable declaration.
    fn call_function(&mut self, inst: &Instruction, block: BlockId) {
        if let Some(decl) = self.try_get_target_function_type(inst.branch_taken_pc) {
            match self.declare_function(&decl) {
                Some(callee) => {
                    if self
                        .try_call_native_function(decl.address, callee, block)
                        .is_none()
                    {
                        error!(
                            "Failed to marshal call to native function";
                            "callee" => format!("{:#x}", decl.address),
                            "call_pc" => format!("{:#x}", inst.pc),
                            "function" => format!("{:#x}", self.func_address),
                        );
                        self.add_intrinsic_call(block, self.intrinsics.function_call);
                    }
                }
                None => {
                    error!(
                        "Call targets non-executable memory or an invalid address";
                        "target" => format!("{:#x}", inst.branch_taken_pc),
                        "call_pc" => format!("{:#x}", inst.pc),
                        "function" => format!("{:#x}", self.func_address),
                    );
                    self.add_intrinsic_call(block, self.intrinsics.function_call);
                }
            }
        } else {
            error!(
                "Missing type information for called function";
                "target" => format!("{:#x}", inst.branch_taken_pc),
                "call_pc" => format!("{:#x}", inst.pc),
                "function" => format!("{:#x}", self.func_address),
            );
            self.add_intrinsic_call(block, self.intrinsics.function_call);
        }
    }

    fn visit_direct_function_call(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        self.visit_delayed_instruction(inst, delayed, block, true);
        self.call_function(inst, block);
        self.visit_after_function_call(inst, block);
    }

    fn visit_conditional_direct_function_call(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        let (taken, not_taken) = self.emit_condition(block);
        self.visit_delayed_instruction(inst, delayed, taken, true);
        self.call_function(inst, taken);
        self.visit_after_function_call(inst, taken);
        self.visit_delayed_instruction(inst, delayed, not_taken, false);
        let target = self.get_or_create_target_block(inst.branch_not_taken_pc);
        self.set_term(not_taken, Terminator::Br(target));
    }

    /// Indirect calls keep the call-graph shape of the binary: the opaque
    /// call intrinsic is called (not tail-called) and lifting resumes at the
    /// return address.
    fn visit_indirect_function_call(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        self.visit_delayed_instruction(inst, delayed, block, true);
        self.add_intrinsic_call(block, self.intrinsics.function_call);
        self.visit_after_function_call(inst, block);
    }

    fn visit_conditional_indirect_function_call(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        let (taken, not_taken) = self.emit_condition(block);
        self.visit_delayed_instruction(inst, delayed, taken, true);
        self.add_intrinsic_call(taken, self.intrinsics.function_call);
        self.visit_after_function_call(inst, taken);
        self.visit_delayed_instruction(inst, delayed, not_taken, false);
        let target = self.get_or_create_target_block(inst.branch_not_taken_pc);
        self.set_term(not_taken, Terminator::Br(target));
    }

    fn visit_conditional_branch(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        let (taken, not_taken) = self.emit_condition(block);
        self.visit_delayed_instruction(inst, delayed, taken, true);
        self.visit_delayed_instruction(inst, delayed, not_taken, false);
        let taken_target = self.get_or_create_target_block(inst.branch_taken_pc);
        self.set_term(taken, Terminator::Br(taken_target));
        let not_taken_target = self.get_or_create_target_block(inst.branch_not_taken_pc);
        self.set_term(not_taken, Terminator::Br(not_taken_target));
    }

    fn visit_async_hyper_call(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        self.visit_delayed_instruction(inst, delayed, block, true);
        self.terminating_tail_call(block, self.intrinsics.async_hyper_call);
    }

    fn visit_conditional_async_hyper_call(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
    ) {
        let (taken, not_taken) = self.emit_condition(block);
        self.visit_delayed_instruction(inst, delayed, taken, true);
        self.visit_delayed_instruction(inst, delayed, not_taken, false);
        self.terminating_tail_call(taken, self.intrinsics.async_hyper_call);
        let target = self.get_or_create_target_block(inst.branch_not_taken_pc);
        self.set_term(not_taken, Terminator::Br(target));
    }

    /// Lift `delayed` into `block` if the architecture says it executes on
    /// this path of `inst`. Delay-slot instructions appear physically after
    /// their transfer but execute before it takes effect, so their IR is
    /// emitted into each successor edge that runs them.
    fn visit_delayed_instruction(
        &mut self,
        inst: &Instruction,
        delayed: Option<&Instruction>,
        block: BlockId,
        on_taken_path: bool,
    ) {
        let Some(delayed) = delayed else { return };
        let arch = Rc::clone(&self.options.arch);
        if !arch.next_instruction_is_delayed(inst, delayed, on_taken_path) {
            return;
        }
        let locals = self.locals();
        let lifted = self.lifted();
        self.binder.lift_into_block(
            &mut self.semantics,
            lifted,
            block,
            &state_arg(),
            &locals,
            delayed,
            true,
        );
    }

    // --- post-call linkage -------------------------------------------------

    /// Figure out where execution resumes after a call, both as a constant
    /// address for the control-flow graph and as the runtime value the
    /// semantics saved into the return-PC slot.
    ///
    /// SPARC calling conventions may place an `unimp` word (Format 0a,
    /// `op = 0`, `op2 = 0`) directly after a call; its payload tells the
    /// callee the size of a structure being returned, and the callee returns
    /// past it. When the four bytes after the call decode that way, the
    /// resume address is pushed four bytes further. A zero payload is still
    /// a skip; nothing is inferred about the callee not returning.
    fn load_function_return_address(
        &mut self,
        inst: &Instruction,
        block: BlockId,
    ) -> (u64, Value) {
        let pc = inst.branch_not_taken_pc;
        let locals = self.locals();
        let lifted = self.lifted();
        let addr_bits = self.addr_bits;
        let ret_pc = self.semantics.body_mut(lifted).load(
            block,
            Type::Int(addr_bits),
            locals.return_pc.clone(),
        );
        if !self.is_sparc {
            return (pc, ret_pc);
        }

        let mut bytes = [0u8; 4];
        for (i, slot) in bytes.iter_mut().enumerate() {
            let (byte, availability, perms) = self.memory_provider.query(pc + i as u64);
            if !availability.has_byte() {
                error!(
                    "Byte is not available for the return-address probe";
                    "address" => format!("{:#x}", pc + i as u64),
                    "call_pc" => format!("{:#x}", inst.pc),
                );
                return (pc, ret_pc);
            }
            if !perms.is_executable() {
                error!(
                    "Byte inspected by the return-address probe is not executable";
                    "address" => format!("{:#x}", pc + i as u64),
                    "call_pc" => format!("{:#x}", inst.pc),
                );
                return (pc, ret_pc);
            }
            *slot = byte;
        }

        let word = u32::from_be_bytes(bytes);
        let op = word >> 30;
        let op2 = (word >> 22) & 0x7;
        if op == 0 && op2 == 0 {
            let imm22 = word & 0x3f_ffff;
            info!(
                "Found structure return after call";
                "size" => imm22,
                "unimp_pc" => format!("{:#x}", pc),
                "call_pc" => format!("{:#x}", inst.pc),
            );
            let adjusted =
                self.semantics
                    .body_mut(lifted)
                    .add(block, ret_pc, Value::int(addr_bits, 4));
            (pc + 4, adjusted)
        } else {
            (pc, ret_pc)
        }
    }

    /// A call does not terminate a block. Store the resume address into the
    /// PC and NEXT_PC slots and branch to the resume block.
    fn visit_after_function_call(&mut self, inst: &Instruction, block: BlockId) {
        let (ret_pc, ret_pc_val) = self.load_function_return_address(inst, block);
        let pc_reg = self.options.arch.program_counter_register().to_string();
        let addr_bits = self.addr_bits;
        let lifted = self.lifted();
        {
            let body = self.semantics.body_mut(lifted);
            let pc_ptr = body.reg_addr(block, state_arg(), &pc_reg, Type::Int(addr_bits));
            body.store(block, pc_ptr, ret_pc_val.clone());
            let next_pc_ptr = body.reg_addr(
                block,
                state_arg(),
                semantics::NEXT_PC_VAR,
                Type::Int(addr_bits),
            );
            body.store(block, next_pc_ptr, ret_pc_val);
        }
        let target = self.get_or_create_target_block(ret_pc);
        self.set_term(block, Terminator::Br(target));
    }

    // --- type hints ----------------------------------------------------------

    /// Get or declare the opaque taint function for one goal type. The
    /// function reads no memory, so later passes may move and merge its
    /// calls freely while its name keeps the goal type recoverable.
    fn get_or_create_tainted_function(&mut self, current_bits: u16, goal: &Type) -> FuncId {
        let name = format!("{}{}", semantics::TYPE_HINT_PREFIX, type_digest(goal));
        let ty = FuncType::new(vec![Type::Int(current_bits)], goal.clone());
        let f = self.semantics.declare_function(&name, ty, 0);
        self.semantics.func_mut(f).no_inline = true;
        self.semantics.func_mut(f).read_none = true;
        f
    }

    /// Apply one `(register, type, value)` hint at the current instruction.
    /// Only top-level pointer-width integer registers participate. Pointer
    /// goal types wrap the register's value through a taint call; a provided
    /// concrete value is stored first when the options allow it.
    fn visit_typed_hinted_register(
        &mut self,
        block: BlockId,
        reg_name: &str,
        ty: &Type,
        maybe_value: Option<u64>,
    ) {
        let arch = Rc::clone(&self.options.arch);
        let Some(reg) = arch.register_by_name(reg_name) else {
            return;
        };
        if !reg.is_top_level() || reg.bits != self.addr_bits {
            return;
        }
        let bits = reg.bits;
        let lifted = self.lifted();
        let reg_ptr =
            self.semantics
                .body_mut(lifted)
                .reg_addr(block, state_arg(), reg_name, Type::Int(bits));

        let mut reg_value = None;
        if self.options.store_inferred_register_values {
            if let Some(value) = maybe_value {
                let c = Value::int(bits, value);
                self.semantics
                    .body_mut(lifted)
                    .store(block, reg_ptr.clone(), c.clone());
                reg_value = Some(c);
            }
        }

        if !ty.is_pointer() {
            return;
        }

        let taint = self.get_or_create_tainted_function(bits, ty);
        let body = self.semantics.body_mut(lifted);
        let current = reg_value
            .unwrap_or_else(|| body.load(block, Type::Int(bits), reg_ptr.clone()));
        let tainted = body.call(block, taint, vec![current]);
        let replacement = body.ptr_to_int(block, tainted, bits);
        body.store(block, reg_ptr, replacement);
    }

    // --- per-instruction driver ------------------------------------------

    /// Emit the instruction's semantics into `block`, then dispatch on its
    /// category to encode the control-flow shape.
    fn visit_instruction(&mut self, inst: &Instruction, block: BlockId) {
        self.curr_pc = Some(inst.pc);

        // Semantic lifting never fails; invalid instructions were filtered
        // out by the work-list loop.
        let locals = self.locals();
        let lifted = self.lifted();
        self.binder.lift_into_block(
            &mut self.semantics,
            lifted,
            block,
            &state_arg(),
            &locals,
            inst,
            false,
        );

        let arch = Rc::clone(&self.options.arch);
        let mut delayed = None;
        if arch.may_have_delay_slot(inst) {
            delayed = self.decode_instruction(inst.delayed_pc, true);
            if delayed.is_none() {
                error!(
                    "Unable to decode or use delayed instruction";
                    "address" => format!("{:#x}", inst.delayed_pc),
                    "of" => format!("{:#x}", inst.pc),
                );
            }
        }

        if self.options.symbolic_register_types {
            let type_provider = Rc::clone(&self.type_provider);
            let func_address = self.func_address;
            type_provider.query_register_state_at_instruction(
                func_address,
                inst.pc,
                &mut |reg, ty, value| {
                    self.visit_typed_hinted_register(block, reg, ty, value);
                },
            );
        }

        let delayed = delayed.as_ref();
        match inst.category {
            Category::Invalid => self.visit_invalid(block),
            Category::Error => self.visit_error(inst, delayed, block),
            Category::Normal | Category::NoOp => self.visit_normal(inst, block),
            Category::DirectJump => self.visit_direct_jump(inst, delayed, block),
            Category::IndirectJump => self.visit_indirect_jump(inst, delayed, block),
            Category::ConditionalIndirectJump => {
                self.visit_conditional_indirect_jump(inst, delayed, block)
            }
            Category::FunctionReturn => self.visit_function_return(inst, delayed, block),
            Category::ConditionalFunctionReturn => {
                self.visit_conditional_function_return(inst, delayed, block)
            }
            Category::DirectFunctionCall => {
                self.visit_direct_function_call(inst, delayed, block)
            }
            Category::ConditionalDirectFunctionCall => {
                self.visit_conditional_direct_function_call(inst, delayed, block)
            }
            Category::IndirectFunctionCall => {
                self.visit_indirect_function_call(inst, delayed, block)
            }
            Category::ConditionalIndirectFunctionCall => {
                self.visit_conditional_indirect_function_call(inst, delayed, block)
            }
            Category::ConditionalBranch => self.visit_conditional_branch(inst, delayed, block),
            Category::AsyncHyperCall => self.visit_async_hyper_call(inst, delayed, block),
            Category::ConditionalAsyncHyperCall => {
                self.visit_conditional_async_hyper_call(inst, delayed, block)
            }
        }

        self.curr_pc = None;
    }

    /// Marshal a call to the declared native function at `native_addr` from
    /// inside the lifted function. Returns the new memory pointer, or `None`
    /// when the declaration cannot be marshalled on this architecture.
    fn try_call_native_function(
        &mut self,
        native_addr: u64,
        native_func: FuncId,
        block: BlockId,
    ) -> Option<Value> {
        let decl = self.addr_to_decl.get(&native_addr)?.clone();
        let arch = Rc::clone(&self.options.arch);
        if !abi::declaration_is_marshallable(arch.as_ref(), &decl) {
            return None;
        }
        let locals = self.locals();
        let lifted = self.lifted();
        let mem = {
            let body = self.semantics.body_mut(lifted);
            semantics::load_memory_pointer(body, block, &locals)
        };
        let mem = abi::call_from_lifted_block(
            &mut self.semantics,
            lifted,
            block,
            arch.as_ref(),
            &state_arg(),
            mem,
            native_func,
            &decl,
        );
        self.semantics
            .body_mut(lifted)
            .store(block, locals.memory.clone(), mem.clone());
        Some(mem)
    }

    /// Run the work list until it drains.
    fn visit_instructions(&mut self) {
        while let Some(&(inst_addr, from_addr)) = self.edge_work_list.iter().next() {
            self.edge_work_list.remove(&(inst_addr, from_addr));
            let block = self.edge_to_dest_block[&(from_addr, inst_addr)];
            {
                let body = self.semantics.body(self.lifted());
                let b = &body.blocks[block];
                if !b.insts.is_empty() || !matches!(b.term, Terminator::None) {
                    continue; // Filled via another edge to the same PC.
                }
            }

            // An edge landing on a declared function entry is a tail call or
            // a fall-through into another function, unless it is this lift's
            // own initial edge. Either way the callee's ABI call replaces
            // any decoding of its body here. An edge back to our own entry
            // from a non-zero PC is deliberately included.
            if inst_addr != self.func_address || from_addr != 0 {
                if let Some(decl) = self.try_get_target_function_type(inst_addr) {
                    if let Some(callee) = self.declare_function(&decl) {
                        if let Some(mem) =
                            self.try_call_native_function(decl.address, callee, block)
                        {
                            self.set_term(block, Terminator::Ret(mem));
                            continue;
                        }
                    }
                    error!(
                        "Failed to call native function via fall-through or tail call";
                        "target" => format!("{:#x}", inst_addr),
                        "from" => format!("{:#x}", from_addr),
                        "function" => format!("{:#x}", self.func_address),
                    );
                    // Recover by decoding the instructions instead.
                }
            }

            if let Some(&first) = self.addr_to_block.get(&inst_addr) {
                // Already lifted via another control-flow edge; merge.
                self.set_term(block, Terminator::Br(first));
                continue;
            }
            self.addr_to_block.insert(inst_addr, block);

            match self.decode_instruction(inst_addr, false) {
                None => {
                    error!(
                        "Could not decode instruction";
                        "address" => format!("{:#x}", inst_addr),
                        "from" => format!("{:#x}", from_addr),
                        "function" => format!("{:#x}", self.func_address),
                    );
                    self.visit_invalid(block);
                }
                Some(inst) if !inst.is_valid() => {
                    self.visit_invalid(block);
                }
                Some(inst) => {
                    self.visit_instruction(&inst, block);
                }
            }
        }
    }

    // --- declarations and the native wrapper --------------------------------

    /// Get or declare the native function for `decl` in the semantics
    /// module, remembering its declaration and its generated name.
    fn get_or_declare_function(&mut self, decl: &FunctionDecl) -> FuncId {
        if let Some(&f) = self.addr_to_func.get(&decl.address) {
            return f;
        }
        self.addr_to_decl.insert(decl.address, decl.clone());
        let name = decl.lifted_name();
        self.func_name_to_address.insert(name.clone(), decl.address);
        let f = self
            .semantics
            .declare_function(&name, decl.func_type(), decl.calling_convention);
        self.semantics.func_mut(f).no_inline = true;
        self.addr_to_func.insert(decl.address, f);
        f
    }

    /// Declare the native function for `decl`. Returns `None` when the
    /// declared address is unmapped or not executable; nothing is emitted in
    /// that case.
    pub fn declare_function(&mut self, decl: &FunctionDecl) -> Option<FuncId> {
        let (_, availability, perms) = self.memory_provider.query(decl.address);
        if !availability.is_valid_address() || !perms.is_executable() {
            return None;
        }
        Some(self.get_or_declare_function(decl))
    }

    fn allocate_and_initialize_state(&mut self, native: FuncId, block: BlockId) -> Value {
        let arch = Rc::clone(&self.options.arch);
        let state_ty = Type::Struct(
            arch.registers()
                .iter()
                .filter(|r| r.is_top_level())
                .map(|r| r.ty())
                .collect(),
        );
        let state = self
            .semantics
            .body_mut(native)
            .alloca(block, state_ty.clone());
        match self.options.state_init {
            StateInitProcedure::None => {}
            StateInitProcedure::Zeroes => {
                self.semantics.body_mut(native).store(
                    block,
                    state.clone(),
                    Value::Const(Const::Zero(state_ty)),
                );
            }
            StateInitProcedure::Undef => {
                self.semantics.body_mut(native).store(
                    block,
                    state.clone(),
                    Value::undef(state_ty),
                );
            }
            StateInitProcedure::RegGlobals => {
                self.initialize_state_from_register_globals(native, block, &state);
            }
            StateInitProcedure::RegGlobalsOverZeroes => {
                self.semantics.body_mut(native).store(
                    block,
                    state.clone(),
                    Value::Const(Const::Zero(state_ty)),
                );
                self.initialize_state_from_register_globals(native, block, &state);
            }
            StateInitProcedure::RegGlobalsOverUndef => {
                self.semantics.body_mut(native).store(
                    block,
                    state.clone(),
                    Value::undef(state_ty),
                );
                self.initialize_state_from_register_globals(native, block, &state);
            }
        }
        state
    }

    /// Copy one external global per top-level register into the state, so
    /// dependencies the declaration missed show up as uses of those globals
    /// after optimization.
    fn initialize_state_from_register_globals(
        &mut self,
        native: FuncId,
        block: BlockId,
        state: &Value,
    ) {
        let arch = Rc::clone(&self.options.arch);
        for reg in arch.registers().iter().filter(|r| r.is_top_level()) {
            // When the stack pointer is symbolic, a register global for it
            // would only confuse later stack-frame recovery.
            if self.options.symbolic_sp && reg.name == arch.stack_pointer_register() {
                continue;
            }
            let global_name = format!("{}{}", semantics::UNMODELLED_REG_PREFIX, reg.name);
            let global = self.semantics.declare_global(&global_name, reg.ty());
            let body = self.semantics.body_mut(native);
            let value = body.load(block, reg.ty(), Value::Const(Const::GlobalRef(global)));
            let slot = body.reg_addr(block, state.clone(), &reg.name, reg.ty());
            body.store(block, slot, value);
        }
    }

    /// Seed the program counter with `&__lift_pc + address`, a relocatable
    /// expression that optimization folds but never destroys, so derived
    /// values remain recognizable as cross-references.
    fn initialize_symbolic_program_counter(
        &mut self,
        native: FuncId,
        block: BlockId,
        state: &Value,
    ) -> Value {
        let bits = self.addr_bits;
        let pc_reg = self.options.arch.program_counter_register().to_string();
        let global = self.semantics.declare_global(semantics::SYMBOLIC_PC, Type::Int(8));
        let pc = Value::Const(Const::GlobalAddr {
            global,
            offset: self.func_address,
            bits,
        });
        let body = self.semantics.body_mut(native);
        let slot = body.reg_addr(block, state.clone(), &pc_reg, Type::Int(bits));
        body.store(block, slot, pc.clone());
        pc
    }

    fn initialize_concrete_program_counter(
        &mut self,
        native: FuncId,
        block: BlockId,
        state: &Value,
    ) -> Value {
        let bits = self.addr_bits;
        let pc_reg = self.options.arch.program_counter_register().to_string();
        let pc = Value::int(bits, self.func_address);
        let body = self.semantics.body_mut(native);
        let slot = body.reg_addr(block, state.clone(), &pc_reg, Type::Int(bits));
        body.store(block, slot, pc.clone());
        pc
    }

    fn initialize_symbolic_stack_pointer(
        &mut self,
        native: FuncId,
        block: BlockId,
        state: &Value,
    ) {
        let sp_reg = self.options.arch.stack_pointer_register().to_string();
        let bits = self
            .options
            .arch
            .register_by_name(&sp_reg)
            .map(|r| r.bits)
            .unwrap_or(self.addr_bits);
        let global = self.semantics.declare_global(semantics::SYMBOLIC_SP, Type::Int(8));
        let sp = Value::Const(Const::GlobalAddr {
            global,
            offset: 0,
            bits,
        });
        let body = self.semantics.body_mut(native);
        let slot = body.reg_addr(block, state.clone(), &sp_reg, Type::Int(bits));
        body.store(block, slot, sp);
    }

    fn initialize_symbolic_return_address(
        &mut self,
        native: FuncId,
        block: BlockId,
        state: &Value,
        mem: Value,
        ret_address: &ValueDecl,
    ) -> Value {
        let bits = self.addr_bits;
        let global = self.semantics.declare_global(semantics::SYMBOLIC_RA, Type::Int(8));
        let ra = Value::Const(Const::GlobalAddr {
            global,
            offset: 0,
            bits,
        });
        let arch = Rc::clone(&self.options.arch);
        abi::store_native_value(
            &mut self.semantics,
            native,
            block,
            arch.as_ref(),
            state,
            mem,
            ret_address,
            ra,
        )
    }

    fn initialize_concrete_return_address(
        &mut self,
        native: FuncId,
        block: BlockId,
        state: &Value,
        mem: Value,
        ret_address: &ValueDecl,
    ) -> Value {
        let bits = self.addr_bits;
        let intrinsic = semantics::return_address_intrinsic(&mut self.semantics);
        let ra = {
            let body = self.semantics.body_mut(native);
            let raw = body.call(block, intrinsic, vec![]);
            body.ptr_to_int(block, raw, bits)
        };
        let arch = Rc::clone(&self.options.arch);
        abi::store_native_value(
            &mut self.semantics,
            native,
            block,
            arch.as_ref(),
            state,
            mem,
            ret_address,
            ra,
        )
    }

    /// Build the native wrapper: allocate and seed the emulated state, write
    /// the high-level arguments into their declared locations, call the
    /// lifted function, read the declared returns back out, and let the
    /// final memory pointer escape.
    fn call_lifted_function_from_native_function(&mut self, decl: &FunctionDecl) {
        let native = self.native_func.expect("no function is being lifted");
        if !self.semantics.func(native).is_declaration() {
            return;
        }
        let lifted = self.lifted();
        let arch = Rc::clone(&self.options.arch);

        self.semantics.define(native);
        let block = self.semantics.body(native).entry;

        let mut mem: Value = Value::Const(Const::NullPtr);
        let state = self.allocate_and_initialize_state(native, block);

        let pc = if self.options.symbolic_pc {
            self.initialize_symbolic_program_counter(native, block, &state)
        } else {
            self.initialize_concrete_program_counter(native, block, &state)
        };

        if self.options.symbolic_sp {
            self.initialize_symbolic_stack_pointer(native, block, &state);
        }

        mem = if self.options.symbolic_ra {
            self.initialize_symbolic_return_address(native, block, &state, mem, &decl.return_address)
        } else {
            self.initialize_concrete_return_address(native, block, &state, mem, &decl.return_address)
        };

        for (i, param) in decl.params.iter().enumerate() {
            mem = abi::store_native_value(
                &mut self.semantics,
                native,
                block,
                arch.as_ref(),
                &state,
                mem,
                &param.value,
                Value::Arg(i as u32),
            );
        }

        let mem = self
            .semantics
            .body_mut(native)
            .call(block, lifted, vec![state.clone(), mem, pc]);

        let ret_val = match decl.returns.len() {
            0 => None,
            1 => Some(abi::load_lifted_value(
                &mut self.semantics,
                native,
                block,
                arch.as_ref(),
                &state,
                &mem,
                &decl.returns[0],
            )),
            _ => {
                let ret_ty = decl.func_type().ret;
                let mut agg = Value::undef(ret_ty);
                for (index, ret_decl) in decl.returns.iter().enumerate() {
                    let part = abi::load_lifted_value(
                        &mut self.semantics,
                        native,
                        block,
                        arch.as_ref(),
                        &state,
                        &mem,
                        ret_decl,
                    );
                    agg = self
                        .semantics
                        .body_mut(native)
                        .insert_field(block, agg, index, part);
                }
                Some(agg)
            }
        };

        // Terminal memory writes must not be erasable.
        let escape = semantics::memory_escape_intrinsic(&mut self.semantics);
        let body = self.semantics.body_mut(native);
        body.call(block, escape, vec![mem]);
        body.set_term(
            block,
            match ret_val {
                Some(v) => Terminator::Ret(v),
                None => Terminator::RetVoid,
            },
        );
    }

    /// Lift the function described by `decl`. Returns `None` when the
    /// declared address is unmapped or not executable. When the address is
    /// valid but its bytes are unknown, the returned function stays a
    /// declaration. A function already lifted under the same name is
    /// returned as-is.
    pub fn lift_function(&mut self, decl: &FunctionDecl) -> Option<FuncId> {
        self.addr_to_decl.clear();
        self.addr_to_func.clear();
        self.edge_work_list.clear();
        self.edge_to_dest_block.clear();
        self.addr_to_block.clear();
        self.curr_pc = None;
        self.locals = None;
        self.lifted_func = None;
        self.func_address = decl.address;

        let (_, availability, perms) = self.memory_provider.query(decl.address);
        if !availability.is_valid_address() || !perms.is_executable() {
            return None;
        }

        let native = self.get_or_declare_function(decl);
        self.native_func = Some(native);
        if !self.semantics.func(native).is_declaration() {
            return Some(native);
        }
        if !availability.has_byte() {
            // Valid and executable, but the data is not present: leave a
            // declaration.
            return Some(native);
        }

        let lifted_name = format!("{}.lifted", self.semantics.func(native).name);
        let lifted = self.semantics.declare_function(
            &lifted_name,
            semantics::transfer_type(self.addr_bits),
            0,
        );
        self.lifted_func = Some(lifted);
        // A previous lift of this address may have left a stale body here.
        self.semantics.define(lifted);
        let entry = self.semantics.body(lifted).entry;

        let locals = {
            let body = self.semantics.body_mut(lifted);
            semantics::create_locals(body, entry, self.addr_bits, Value::Arg(1))
        };
        self.locals = Some(locals);

        // Both PC slots are seeded from the program-counter argument before
        // any lifted instruction can depend on them.
        {
            let pc_reg = self.options.arch.program_counter_register().to_string();
            let addr_bits = self.addr_bits;
            let body = self.semantics.body_mut(lifted);
            let pc_ptr = body.reg_addr(entry, state_arg(), &pc_reg, Type::Int(addr_bits));
            body.store(entry, pc_ptr, Value::Arg(2));
            let next_pc_ptr = body.reg_addr(
                entry,
                state_arg(),
                semantics::NEXT_PC_VAR,
                Type::Int(addr_bits),
            );
            body.store(entry, next_pc_ptr, Value::Arg(2));
        }

        // Seeds the work list with the entry edge (from PC = 0).
        let first = self.get_or_create_block(self.func_address);
        self.semantics
            .body_mut(lifted)
            .set_term(entry, Terminator::Br(first));

        self.visit_instructions();
        self.call_lifted_function_from_native_function(decl);
        passes::run_cleanup_pipeline(&mut self.semantics, native);

        Some(native)
    }
}
