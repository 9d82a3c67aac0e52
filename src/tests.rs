//! Test fixtures and end-to-end lifting tests.
//!
//! The fixtures center on `mini32`, a 32-bit fixed-width architecture with
//! four-byte instructions: one opcode byte followed by a 24-bit big-endian
//! immediate. The `mini32-sparc` variant adds delay slots on transfers and
//! the SPARC structure-return probe. The fixture providers are also used by
//! the command-line tool, which accepts both architecture names.

use std::cell::RefCell;
use std::rc::Rc;

use crate::arch::{Arch, Category, Instruction, Register};
use crate::containers::unordered::UnorderedMap;
use crate::function_lifter::FunctionLifter;
use crate::ir::Type;
use crate::options::LifterOptions;
use crate::program::{FunctionDecl, ParameterDecl, ValueDecl};
use crate::providers::{
    ByteAvailability, BytePermission, ControlFlowProvider, MemoryProvider, TypeProvider,
};

/// A 32-bit fixed-width architecture for exercising the lifter.
pub struct MiniArch {
    name: &'static str,
    registers: Vec<Register>,
    delay_slots: bool,
    sparc: bool,
}

impl MiniArch {
    pub fn new() -> Self {
        Self {
            name: "mini32",
            registers: Self::register_set(),
            delay_slots: false,
            sparc: false,
        }
    }

    /// Delay slots on every jump, branch, call, and return, plus the
    /// structure-return `unimp` probe after calls.
    pub fn sparc_like() -> Self {
        Self {
            name: "mini32-sparc",
            registers: Self::register_set(),
            delay_slots: true,
            sparc: true,
        }
    }

    fn register_set() -> Vec<Register> {
        let mut registers: Vec<Register> = ["r0", "r1", "r2", "r3", "sp", "ra", "pc"]
            .iter()
            .map(|name| Register::new(name, 32))
            .collect();
        registers.push(Register {
            name: "r0l".into(),
            bits: 16,
            parent: Some("r0".into()),
        });
        registers
    }

    fn has_delay_slot(category: Category) -> bool {
        use Category::*;
        matches!(
            category,
            DirectJump
                | IndirectJump
                | ConditionalIndirectJump
                | FunctionReturn
                | ConditionalFunctionReturn
                | DirectFunctionCall
                | ConditionalDirectFunctionCall
                | IndirectFunctionCall
                | ConditionalIndirectFunctionCall
                | ConditionalBranch
        )
    }
}

impl Default for MiniArch {
    fn default() -> Self {
        Self::new()
    }
}

impl Arch for MiniArch {
    fn name(&self) -> &str {
        self.name
    }

    fn address_bits(&self) -> u16 {
        32
    }

    fn max_instruction_size(&self) -> usize {
        4
    }

    fn registers(&self) -> &[Register] {
        &self.registers
    }

    fn program_counter_register(&self) -> &str {
        "pc"
    }

    fn stack_pointer_register(&self) -> &str {
        "sp"
    }

    fn decode(&self, addr: u64, bytes: &[u8]) -> Option<Instruction> {
        if bytes.len() < 4 {
            return None;
        }
        let imm = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]) as u64;
        use Category::*;
        let (category, sem) = match bytes[0] {
            0x00 => (NoOp, "nop"),
            0x01 => (Normal, "alu"),
            0x02 => (DirectJump, "jmp"),
            0x03 => (IndirectJump, "jmpr"),
            0x04 => (ConditionalBranch, "bcc"),
            0x05 => (DirectFunctionCall, "call"),
            0x06 => (IndirectFunctionCall, "callr"),
            0x07 => (FunctionReturn, "ret"),
            0x08 => (Error, "trap"),
            0x09 => (AsyncHyperCall, "hcall"),
            0x0a => (ConditionalIndirectJump, "bjmpr"),
            0x0b => (ConditionalFunctionReturn, "bret"),
            0x0c => (ConditionalDirectFunctionCall, "bcall"),
            0x0d => (ConditionalIndirectFunctionCall, "bcallr"),
            0x0e => (ConditionalAsyncHyperCall, "bhcall"),
            _ => return None,
        };
        let next_pc = addr + 4;
        let slotted = self.delay_slots && Self::has_delay_slot(category);
        // With a delay slot, the not-taken path resumes after the slot.
        let fall_through = if slotted { addr + 8 } else { addr + 4 };
        Some(Instruction {
            pc: addr,
            next_pc,
            branch_taken_pc: imm,
            branch_not_taken_pc: fall_through,
            delayed_pc: if slotted { addr + 4 } else { 0 },
            category,
            bytes: bytes[..4].to_vec(),
            sem: sem.to_string(),
        })
    }

    fn may_have_delay_slot(&self, inst: &Instruction) -> bool {
        self.delay_slots && inst.delayed_pc != 0
    }

    fn next_instruction_is_delayed(
        &self,
        _inst: &Instruction,
        _delayed: &Instruction,
        _on_taken_path: bool,
    ) -> bool {
        // No annulment bits; the slot executes on both paths.
        true
    }

    fn is_sparc(&self) -> bool {
        self.sparc
    }
}

/// Wraps an architecture and counts primary decodes per address.
pub struct CountingArch {
    inner: MiniArch,
    pub decodes: RefCell<UnorderedMap<u64, usize>>,
}

impl CountingArch {
    pub fn new(inner: MiniArch) -> Self {
        Self {
            inner,
            decodes: RefCell::new(UnorderedMap::default()),
        }
    }

    pub fn decode_count(&self, addr: u64) -> usize {
        self.decodes.borrow().get(&addr).copied().unwrap_or(0)
    }
}

impl Arch for CountingArch {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn address_bits(&self) -> u16 {
        self.inner.address_bits()
    }
    fn max_instruction_size(&self) -> usize {
        self.inner.max_instruction_size()
    }
    fn registers(&self) -> &[Register] {
        self.inner.registers()
    }
    fn program_counter_register(&self) -> &str {
        self.inner.program_counter_register()
    }
    fn stack_pointer_register(&self) -> &str {
        self.inner.stack_pointer_register()
    }
    fn decode(&self, addr: u64, bytes: &[u8]) -> Option<Instruction> {
        *self.decodes.borrow_mut().entry(addr).or_default() += 1;
        self.inner.decode(addr, bytes)
    }
    fn decode_delayed(&self, addr: u64, bytes: &[u8]) -> Option<Instruction> {
        self.inner.decode_delayed(addr, bytes)
    }
    fn may_have_delay_slot(&self, inst: &Instruction) -> bool {
        self.inner.may_have_delay_slot(inst)
    }
    fn next_instruction_is_delayed(
        &self,
        inst: &Instruction,
        delayed: &Instruction,
        on_taken_path: bool,
    ) -> bool {
        self.inner.next_instruction_is_delayed(inst, delayed, on_taken_path)
    }
    fn is_sparc(&self) -> bool {
        self.inner.is_sparc()
    }
}

/// Encode one `mini32` instruction.
pub fn enc(op: u8, imm: u32) -> [u8; 4] {
    [op, (imm >> 16) as u8, (imm >> 8) as u8, imm as u8]
}

/// An in-memory byte oracle.
#[derive(Default)]
pub struct FixtureMemory {
    bytes: UnorderedMap<u64, (Option<u8>, BytePermission)>,
}

impl FixtureMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, addr: u64, bytes: &[u8], perm: BytePermission) -> &mut Self {
        for (i, &b) in bytes.iter().enumerate() {
            self.bytes.insert(addr + i as u64, (Some(b), perm));
        }
        self
    }

    pub fn map_code(&mut self, addr: u64, words: &[[u8; 4]]) -> &mut Self {
        for (i, word) in words.iter().enumerate() {
            self.map(
                addr + 4 * i as u64,
                word,
                BytePermission::ReadableExecutable,
            );
        }
        self
    }

    /// A valid executable address whose byte values are not known.
    pub fn map_unknown(&mut self, addr: u64, len: u64, perm: BytePermission) -> &mut Self {
        for i in 0..len {
            self.bytes.insert(addr + i, (None, perm));
        }
        self
    }
}

impl MemoryProvider for FixtureMemory {
    fn query(&self, addr: u64) -> (u8, ByteAvailability, BytePermission) {
        match self.bytes.get(&addr) {
            None => (0, ByteAvailability::Unavailable, BytePermission::Unknown),
            Some((None, perm)) => (0, ByteAvailability::Unknown, *perm),
            Some((Some(b), perm)) => (*b, ByteAvailability::Available, *perm),
        }
    }
}

/// A type provider backed by plain maps.
#[derive(Default)]
pub struct FixtureTypes {
    decls: UnorderedMap<u64, FunctionDecl>,
    hints: UnorderedMap<(u64, u64), Vec<(String, Type, Option<u64>)>>,
}

impl FixtureTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, decl: FunctionDecl) -> &mut Self {
        self.decls.insert(decl.address, decl);
        self
    }

    pub fn hint(
        &mut self,
        func_addr: u64,
        inst_pc: u64,
        reg: &str,
        ty: Type,
        value: Option<u64>,
    ) -> &mut Self {
        self.hints
            .entry((func_addr, inst_pc))
            .or_default()
            .push((reg.to_string(), ty, value));
        self
    }
}

impl TypeProvider for FixtureTypes {
    fn try_get_function_type(&self, addr: u64) -> Option<FunctionDecl> {
        self.decls.get(&addr).cloned()
    }

    fn query_register_state_at_instruction(
        &self,
        func_addr: u64,
        inst_pc: u64,
        visitor: &mut dyn FnMut(&str, &Type, Option<u64>),
    ) {
        if let Some(hints) = self.hints.get(&(func_addr, inst_pc)) {
            for (reg, ty, value) in hints {
                visitor(reg, ty, *value);
            }
        }
    }
}

/// A redirection provider backed by a plain map.
#[derive(Default)]
pub struct FixtureRedirects {
    map: UnorderedMap<u64, u64>,
}

impl FixtureRedirects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn redirect(&mut self, from: u64, to: u64) -> &mut Self {
        self.map.insert(from, to);
        self
    }
}

impl ControlFlowProvider for FixtureRedirects {
    fn redirection(&self, addr: u64) -> u64 {
        *self.map.get(&addr).unwrap_or(&addr)
    }
}

/// `i32 f(i32 r0)` returning in `r0`, return address in `ra`, stack pointer
/// preserved.
pub fn int_decl(address: u64) -> FunctionDecl {
    FunctionDecl {
        address,
        params: vec![ParameterDecl {
            name: Some("a".into()),
            value: ValueDecl::register("r0", Type::Int(32)),
        }],
        returns: vec![ValueDecl::register("r0", Type::Int(32))],
        return_address: ValueDecl::register("ra", Type::Int(32)),
        return_stack_pointer: "sp".into(),
        return_stack_pointer_offset: 0,
        register_info: UnorderedMap::default(),
        is_noreturn: false,
        is_variadic: false,
        calling_convention: 0,
    }
}

/// A lifter over the fixture providers.
pub fn make_lifter(
    arch: Rc<dyn Arch>,
    memory: FixtureMemory,
    types: FixtureTypes,
    redirects: FixtureRedirects,
) -> FunctionLifter {
    let options = LifterOptions::new(arch, Rc::new(redirects));
    FunctionLifter::new(options, Rc::new(memory), Rc::new(types))
}

#[cfg(test)]
mod lift {
    use super::*;
    use crate::entity_lifter::EntityLifter;
    use crate::ir::{Const, FuncBody, FuncId, Inst, InstId, Module, Terminator, Value};
    use crate::options::StateInitProcedure;
    use crate::spec;

    fn lifted_body<'m>(module: &'m Module, decl: &FunctionDecl) -> &'m FuncBody {
        let name = format!("{}.lifted", decl.lifted_name());
        let f = module
            .function_named(&name)
            .unwrap_or_else(|| panic!("missing lifted function `{}`", name));
        module.body(f)
    }

    fn calls_to(module: &Module, body: &FuncBody, name: &str) -> Vec<InstId> {
        let mut out = Vec::new();
        for (_, b) in body.blocks.iter() {
            for &id in &b.insts {
                if let Inst::Call { callee, .. } = &body.insts[id] {
                    if module.func(*callee).name == name {
                        out.push(id);
                    }
                }
            }
        }
        out
    }

    fn call_args(body: &FuncBody, id: InstId) -> Vec<Value> {
        match &body.insts[id] {
            Inst::Call { args, .. } => args.clone(),
            other => panic!("not a call: {:?}", other),
        }
    }

    fn blocks_named(body: &FuncBody, name: &str) -> Vec<crate::ir::BlockId> {
        body.blocks
            .iter()
            .filter(|(_, b)| b.name == name)
            .map(|(id, _)| id)
            .collect()
    }

    fn native_body<'m>(module: &'m Module, f: FuncId) -> &'m FuncBody {
        module.body(f)
    }

    #[test]
    fn edges_are_keyed_by_both_endpoints_and_each_pc_decodes_once() {
        // 0x1000: jmp 0x1008
        // 0x1008: alu
        // 0x100c: jmp 0x1008   (second predecessor of 0x1008)
        let arch = Rc::new(CountingArch::new(MiniArch::new()));
        let mut memory = FixtureMemory::new();
        memory.map_code(
            0x1000,
            &[enc(0x02, 0x1008), enc(0x01, 0), enc(0x02, 0x1008)],
        );
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut lifter = make_lifter(
            Rc::clone(&arch) as Rc<dyn Arch>,
            memory,
            types,
            FixtureRedirects::new(),
        );
        let decl = int_decl(0x1000);
        lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);

        // Two distinct predecessors produced two distinct blocks for the
        // same destination PC.
        let dest_blocks = blocks_named(body, "inst_1008");
        assert_eq!(dest_blocks.len(), 2, "one block per incoming edge");

        // Exactly one of them was filled by decoding; the other merges into
        // it with a plain branch.
        let (filled, merged): (Vec<_>, Vec<_>) = dest_blocks
            .iter()
            .partition::<Vec<&crate::ir::BlockId>, _>(|&&b| !body.blocks[b].insts.is_empty());
        assert_eq!(filled.len(), 1);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            body.blocks[*merged[0]].term,
            Terminator::Br(*filled[0]),
            "the re-entry branches to the first lifted block"
        );

        // The decoder ran at most once per address.
        for addr in [0x1000u64, 0x1008, 0x100c] {
            assert_eq!(arch.decode_count(addr), 1, "address {:#x}", addr);
        }
    }

    #[test]
    fn self_tail_call_is_lowered_as_a_call() {
        // 0x1000: alu
        // 0x1004: jmp 0x1000   (transfer back to our own entry)
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x01, 0), enc(0x02, 0x1000)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let decl = int_decl(0x1000);
        lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);
        let native_name = decl.lifted_name();

        let self_calls = calls_to(module, body, &native_name);
        assert_eq!(self_calls.len(), 1, "the back-edge became an ABI call");

        // The call's block returns the marshalled memory pointer rather
        // than branching back into the entry block.
        let call_block = body
            .blocks
            .iter()
            .find(|(_, b)| b.insts.contains(&self_calls[0]))
            .map(|(id, _)| id)
            .unwrap();
        assert!(matches!(body.blocks[call_block].term, Terminator::Ret(_)));
    }

    #[test]
    fn terminating_intrinsics_have_muted_state_pointers() {
        // 0x1000: ret
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let decl = int_decl(0x1000);
        let native = lifter.lift_function(&decl).expect("lift succeeds");

        // Muting survives inlining into the native wrapper.
        let module = lifter.semantics_module();
        let body = native_body(module, native);
        let rets = calls_to(module, body, "__lift_function_return");
        assert_eq!(rets.len(), 1);
        assert_eq!(
            call_args(body, rets[0])[0],
            Value::undef(Type::Ptr),
            "the state pointer must not escape through the return intrinsic"
        );
    }

    #[test]
    fn indirect_jump_tail_calls_the_jump_intrinsic_unmuted() {
        // 0x1000: jmpr
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x03, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let decl = int_decl(0x1000);
        lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);
        let jumps = calls_to(module, body, "__lift_jump");
        assert_eq!(jumps.len(), 1);
        assert_eq!(
            call_args(body, jumps[0])[0],
            Value::Arg(0),
            "jumps keep the state pointer"
        );
        let jump_block = body
            .blocks
            .iter()
            .find(|(_, b)| b.insts.contains(&jumps[0]))
            .map(|(id, _)| id)
            .unwrap();
        assert!(
            matches!(body.blocks[jump_block].term, Terminator::Ret(_)),
            "nothing follows an indirect jump"
        );
    }

    #[test]
    fn conditional_branch_duplicates_the_delay_slot_on_both_paths() {
        // 0xa000: bcc 0xa010   (delay slot at 0xa004, fall-through 0xa008)
        // 0xa004: alu          (the delayed instruction)
        // 0xa008: ret
        // 0xa010: ret
        let arch = Rc::new(MiniArch::sparc_like());
        let mut memory = FixtureMemory::new();
        memory.map_code(
            0xa000,
            &[enc(0x04, 0xa010), enc(0x01, 0), enc(0x07, 0)],
        );
        memory.map_code(0xa010, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0xa000));

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let decl = int_decl(0xa000);
        lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);

        let (taken, not_taken) = body
            .blocks
            .iter()
            .find_map(|(_, b)| match &b.term {
                Terminator::CondBr {
                    taken, not_taken, ..
                } => Some((*taken, *not_taken)),
                _ => None,
            })
            .expect("the branch splits on the branch-taken flag");

        // The delayed `alu` was lifted into both successor edges.
        for (path, block) in [("taken", taken), ("not-taken", not_taken)] {
            let delayed: Vec<_> = body.blocks[block]
                .insts
                .iter()
                .filter(|&&id| match &body.insts[id] {
                    Inst::Call { callee, .. } => module.func(*callee).name == "__sem_alu",
                    _ => false,
                })
                .collect();
            assert_eq!(delayed.len(), 1, "delay slot missing on the {} path", path);
        }

        // Each path then branches to its own edge-keyed block.
        let taken_succ = match body.blocks[taken].term {
            Terminator::Br(b) => b,
            ref other => panic!("unexpected taken terminator {:?}", other),
        };
        let not_taken_succ = match body.blocks[not_taken].term {
            Terminator::Br(b) => b,
            ref other => panic!("unexpected not-taken terminator {:?}", other),
        };
        assert_eq!(body.blocks[taken_succ].name, "inst_a010");
        assert_eq!(body.blocks[not_taken_succ].name, "inst_a008");
    }

    #[test]
    fn native_wrapper_round_trips_the_declared_abi() {
        // i32 f(i32 r1, i32 [sp+8]) returning in r0; body: ret.
        let mut decl = int_decl(0x1000);
        decl.params = vec![
            ParameterDecl {
                name: Some("a".into()),
                value: ValueDecl::register("r1", Type::Int(32)),
            },
            ParameterDecl {
                name: Some("b".into()),
                value: ValueDecl::memory("sp", 8, Type::Int(32)),
            },
        ];

        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(decl.clone());

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let native = lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let body = native_body(module, native);

        // The register argument is written into its declared slot.
        let mut stored_r1 = false;
        for (_, inst) in body.insts.iter() {
            if let Inst::Store { ptr, value } = inst {
                if *value == Value::Arg(0) {
                    if let Value::Inst(p) = ptr {
                        if matches!(&body.insts[*p], Inst::RegAddr { reg, .. } if reg == "r1") {
                            stored_r1 = true;
                        }
                    }
                }
            }
        }
        assert!(stored_r1, "first argument reaches the r1 slot");

        // The memory argument goes through the 32-bit write helper, with
        // the argument value as the data operand.
        let writes = calls_to(module, body, "__lift_write_mem32");
        assert_eq!(writes.len(), 1);
        assert_eq!(call_args(body, writes[0])[2], Value::Arg(1));

        // The declared return is read back out of r0 and returned.
        let ret_value = body
            .blocks
            .iter()
            .find_map(|(_, b)| match &b.term {
                Terminator::Ret(v) => Some(v.clone()),
                _ => None,
            })
            .expect("the wrapper returns a value");
        let Value::Inst(load) = ret_value else {
            panic!("expected a loaded return value, got {:?}", ret_value);
        };
        match &body.insts[load] {
            Inst::Load { ptr: Value::Inst(p), .. } => {
                assert!(
                    matches!(&body.insts[*p], Inst::RegAddr { reg, .. } if reg == "r0"),
                    "return value comes from the r0 slot"
                );
            }
            other => panic!("expected a load, got {:?}", other),
        }

        // The final memory pointer escapes.
        assert_eq!(calls_to(module, body, "__lift_memory_escape").len(), 1);
    }

    fn sparc_call_fixture(unimp_word: Option<u32>) -> (FunctionLifter, FunctionDecl) {
        // 0xb000: call 0x2000  (delay slot at 0xb004, fall-through 0xb008)
        // 0xb004: alu
        // 0xb008: unimp word, or a plain alu when `unimp_word` is None
        // 0xb00c: ret
        // 0x2000: ret          (the declared callee)
        let arch = Rc::new(MiniArch::sparc_like());
        let mut memory = FixtureMemory::new();
        memory.map_code(0xb000, &[enc(0x05, 0x2000), enc(0x01, 0)]);
        match unimp_word {
            Some(word) => memory.map(
                0xb008,
                &word.to_be_bytes(),
                BytePermission::ReadableExecutable,
            ),
            None => memory.map_code(0xb008, &[enc(0x01, 0)]),
        };
        memory.map_code(0xb00c, &[enc(0x07, 0)]);
        memory.map_code(0x2000, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0xb000));
        types.declare(int_decl(0x2000));

        let lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        (lifter, int_decl(0xb000))
    }

    #[test]
    fn structure_return_unimp_skips_four_bytes() {
        let (mut lifter, decl) = sparc_call_fixture(Some(0x0000_0010));
        lifter.lift_function(&decl).expect("lift succeeds");
        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);

        assert_eq!(
            blocks_named(body, "inst_b00c").len(),
            1,
            "execution resumes past the unimp word"
        );
        assert!(
            blocks_named(body, "inst_b008").is_empty(),
            "the unimp word itself is never a control-flow target"
        );

        // The typed call to the declared callee was emitted.
        assert_eq!(
            calls_to(module, body, &int_decl(0x2000).lifted_name()).len(),
            1
        );
    }

    #[test]
    fn zero_unimp_payload_still_skips() {
        let (mut lifter, decl) = sparc_call_fixture(Some(0));
        lifter.lift_function(&decl).expect("lift succeeds");
        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);
        assert_eq!(blocks_named(body, "inst_b00c").len(), 1);
        assert!(blocks_named(body, "inst_b008").is_empty());
    }

    #[test]
    fn non_unimp_word_resumes_at_the_fall_through() {
        let (mut lifter, decl) = sparc_call_fixture(None);
        lifter.lift_function(&decl).expect("lift succeeds");
        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);
        assert_eq!(blocks_named(body, "inst_b008").len(), 1);
    }

    #[test]
    fn direct_jump_to_a_declared_function_is_a_tail_call() {
        // 0x1000: jmp 0x2000, with 0x2000 declared and mapped.
        let arch = Rc::new(CountingArch::new(MiniArch::new()));
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x02, 0x2000)]);
        memory.map_code(0x2000, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));
        types.declare(int_decl(0x2000));

        let mut lifter = make_lifter(
            Rc::clone(&arch) as Rc<dyn Arch>,
            memory,
            types,
            FixtureRedirects::new(),
        );
        let decl = int_decl(0x1000);
        let native = lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let callee_name = int_decl(0x2000).lifted_name();

        // The edge block marshals an ABI call and returns its memory
        // pointer; the callee's body is never decoded into this function.
        let body = lifted_body(module, &decl);
        let calls = calls_to(module, body, &callee_name);
        assert_eq!(calls.len(), 1);
        assert_eq!(arch.decode_count(0x2000), 0);

        // The call survives into the native wrapper.
        assert_eq!(
            calls_to(module, native_body(module, native), &callee_name).len(),
            1
        );
    }

    #[test]
    fn undecodable_bytes_become_a_muted_error_call() {
        // 0x1000: alu
        // 0x1004: readable-writable data, not executable
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x01, 0)]);
        memory.map(
            0x1004,
            &[0xde, 0xad, 0xbe, 0xef],
            BytePermission::ReadableWritable,
        );
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let decl = int_decl(0x1000);
        lifter.lift_function(&decl).expect("the lift itself succeeds");

        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);
        let errors = calls_to(module, body, "__lift_error");
        assert_eq!(errors.len(), 1);
        assert_eq!(call_args(body, errors[0])[0], Value::undef(Type::Ptr));
    }

    #[test]
    fn calls_follow_control_flow_redirections() {
        // 0xd000: call 0xe000; the redirection maps 0xe000 to 0xf000 and
        // only 0xf000 has a declaration.
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0xd000, &[enc(0x05, 0xe000), enc(0x07, 0)]);
        memory.map_code(0xf000, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0xd000));
        types.declare(int_decl(0xf000));
        let mut redirects = FixtureRedirects::new();
        redirects.redirect(0xe000, 0xf000);

        let mut lifter = make_lifter(arch, memory, types, redirects);
        let decl = int_decl(0xd000);
        lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);
        assert_eq!(
            calls_to(module, body, &int_decl(0xf000).lifted_name()).len(),
            1,
            "the call targets the redirected declaration"
        );
        assert!(
            module
                .function_named(&int_decl(0xe000).lifted_name())
                .is_none(),
            "no declaration is created for the unredirected address"
        );
    }

    #[test]
    fn unknown_bytes_leave_a_declaration_only_function() {
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_unknown(0x1000, 4, BytePermission::ReadableExecutable);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let decl = int_decl(0x1000);
        let native = lifter.lift_function(&decl).expect("address is usable");
        assert!(lifter.semantics_module().func(native).is_declaration());
    }

    #[test]
    fn unusable_addresses_lift_to_nothing() {
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        // Mapped but not executable.
        memory.map(0x2000, &[0u8; 4], BytePermission::ReadableWritable);
        let mut lifter = make_lifter(
            arch,
            memory,
            FixtureTypes::new(),
            FixtureRedirects::new(),
        );
        assert!(lifter.lift_function(&int_decl(0x9000)).is_none());
        assert!(lifter.lift_function(&int_decl(0x2000)).is_none());
        assert!(lifter.declare_function(&int_decl(0x2000)).is_none());
    }

    #[test]
    fn pointer_type_hints_inject_taint_calls() {
        // A pointer hint with a concrete value on r1, plus a hint on a
        // sub-register that must be ignored.
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));
        types.hint(0x1000, 0x1000, "r1", Type::Ptr, Some(0x4000));
        types.hint(0x1000, 0x1000, "r0l", Type::Ptr, None);

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let decl = int_decl(0x1000);
        lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let taint = module
            .function_named("__lift_type_p")
            .expect("taint function declared");
        assert!(module.func(taint).read_none);

        let body = lifted_body(module, &decl);
        let taints = calls_to(module, body, "__lift_type_p");
        assert_eq!(taints.len(), 1, "sub-register hints are ignored");
        assert_eq!(
            call_args(body, taints[0])[0],
            Value::int(32, 0x4000),
            "the provided concrete value feeds the taint call"
        );
    }

    #[test]
    fn register_globals_seed_the_state_except_a_symbolic_sp() {
        let arch: Rc<dyn Arch> = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut options = LifterOptions::new(Rc::clone(&arch), Rc::new(FixtureRedirects::new()));
        options.state_init = StateInitProcedure::RegGlobalsOverZeroes;
        let mut lifter = FunctionLifter::new(options, Rc::new(memory), Rc::new(types));
        let decl = int_decl(0x1000);
        let native = lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        assert!(module.global_named("__lift_reg_r0").is_some());
        assert!(
            module.global_named("__lift_reg_sp").is_none(),
            "a symbolic stack pointer suppresses its register global"
        );
        assert!(module.global_named("__lift_pc").is_some());

        let body = native_body(module, native);

        // The register-global seed for r2 is never overwritten, so its load
        // and store survive cleanup.
        let reg_r2 = module.global_named("__lift_reg_r2").expect("r2 global");
        let loads_r2 = body.insts.iter().any(|(_, inst)| {
            matches!(
                inst,
                Inst::Load { ptr: Value::Const(Const::GlobalRef(g)), .. } if *g == reg_r2
            )
        });
        assert!(loads_r2, "the r2 seed loads from its register global");

        // The symbolic return address is a relocatable constant stored into
        // the declared return-address location.
        let ra = module.global_named("__lift_ra").expect("ra global");
        let seeds_ra = body.insts.iter().any(|(_, inst)| {
            matches!(
                inst,
                Inst::Store {
                    value: Value::Const(Const::GlobalAddr { global, offset: 0, .. }),
                    ..
                } if *global == ra
            )
        });
        assert!(seeds_ra, "the return-address seed references the symbolic base");
    }

    #[test]
    fn conditional_return_mutes_only_the_taken_path() {
        // 0x1000: bret (conditional return), fall-through 0x1004
        // 0x1004: ret
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x0b, 0), enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        let decl = int_decl(0x1000);
        lifter.lift_function(&decl).expect("lift succeeds");

        let module = lifter.semantics_module();
        let body = lifted_body(module, &decl);
        let rets = calls_to(module, body, "__lift_function_return");
        assert_eq!(rets.len(), 2, "one per return instruction");
        for id in rets {
            assert_eq!(call_args(body, id)[0], Value::undef(Type::Ptr));
        }
        assert!(
            body.blocks
                .iter()
                .any(|(_, b)| matches!(b.term, Terminator::CondBr { .. })),
            "the conditional return splits on the branch-taken flag"
        );
    }

    #[test]
    fn entity_lifter_copies_into_the_target_and_deduplicates() {
        let spec_text = r#"{
            "arch": "mini32",
            "functions": [{
                "address": 4096,
                "parameters": [{"name": "a", "type": "i32", "register": "r0"}],
                "return_values": [{"type": "i32", "register": "r0"}],
                "return_address": {"type": "i32", "register": "ra"},
                "return_stack_pointer": {"register": "sp", "offset": 0}
            }],
            "memory": [
                {"address": 4096, "is_executable": true, "data": "0100000007000000"}
            ],
            "symbols": [[4096, "main"]]
        }"#;
        let arch: Rc<dyn Arch> = Rc::new(MiniArch::new());
        let program = Rc::new(spec::parse_spec(arch.as_ref(), spec_text).expect("spec parses"));
        let options = LifterOptions::new(
            Rc::clone(&arch),
            Rc::clone(&program) as Rc<dyn ControlFlowProvider>,
        );
        let mut entity_lifter = EntityLifter::new(
            options,
            Rc::clone(&program) as Rc<dyn MemoryProvider>,
            Rc::clone(&program) as Rc<dyn TypeProvider>,
        );

        let decl = program.function_at(0x1000).unwrap().clone();
        let first = entity_lifter.lift_entity(&decl).expect("lift succeeds");
        assert!(!entity_lifter.module().func(first).is_declaration());
        assert!(entity_lifter
            .module()
            .func(first)
            .name
            .starts_with("sub_1000_"));

        // A second lift lands on the same target entity.
        let second = entity_lifter.lift_entity(&decl).expect("lift succeeds");
        assert_eq!(first, second);

        // Applying the symbol name sticks across a further re-lift.
        entity_lifter.module_mut().set_func_name(first, "main");
        let third = entity_lifter.lift_entity(&decl).expect("lift succeeds");
        assert_eq!(first, third);
        assert_eq!(entity_lifter.module().func(first).name, "main");
        assert!(!entity_lifter.module().func(first).is_declaration());
    }

    #[test]
    fn semantics_bodies_are_inlined_by_the_cleanup_pipeline() {
        // Define the `ret` semantics before lifting: it just returns the
        // memory pointer unchanged. After the pipeline, no call to it may
        // remain in the native wrapper.
        let arch = Rc::new(MiniArch::new());
        let mut memory = FixtureMemory::new();
        memory.map_code(0x1000, &[enc(0x07, 0)]);
        let mut types = FixtureTypes::new();
        types.declare(int_decl(0x1000));

        let mut lifter = make_lifter(arch, memory, types, FixtureRedirects::new());
        {
            let module = lifter.semantics_module_mut();
            let sem = module.declare_function(
                "__sem_ret",
                crate::semantics::transfer_type(32),
                0,
            );
            module.define(sem);
            let entry = module.body(sem).entry;
            module
                .body_mut(sem)
                .set_term(entry, Terminator::Ret(Value::Arg(1)));
        }

        let decl = int_decl(0x1000);
        let native = lifter.lift_function(&decl).expect("lift succeeds");
        let module = lifter.semantics_module();
        let body = native_body(module, native);
        assert!(
            calls_to(module, body, "__sem_ret").is_empty(),
            "defined semantics are flattened into the wrapper"
        );
        // The opaque return intrinsic is still there.
        assert_eq!(calls_to(module, body, "__lift_function_return").len(), 1);
    }
}
