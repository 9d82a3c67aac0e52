//! A small SSA-flavoured intermediate representation for lifted machine code.
//!
//! The representation is deliberately minimal: it carries exactly the
//! operations the lifter emits when modelling the effect of machine code on
//! an emulated processor state and a threaded memory pointer. Basic blocks
//! and instructions live in per-function arenas and are referred to by
//! identity handles, so the control-flow graph may freely contain cycles and
//! multi-edges without any back-references.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use itertools::Itertools;
use slotmap::{new_key_type, SlotMap};
use std::fmt;

new_key_type! {
    /// Identity of a function within a [`Module`].
    pub struct FuncId;
    /// Identity of a global variable within a [`Module`].
    pub struct GlobalId;
    /// Identity of a basic block within a [`FuncBody`].
    pub struct BlockId;
    /// Identity of an instruction within a [`FuncBody`].
    pub struct InstId;
}

/// A first-order value type.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Type {
    Void,
    /// An integer of the given bit width.
    Int(u16),
    /// An opaque pointer. All pointers share one type; what they point at is
    /// implied by the operation using them.
    Ptr,
    /// An aggregate of the given field types, used for multi-value returns
    /// and for the emulated state structure.
    Struct(Vec<Type>),
}

impl Type {
    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }
}

/// The type of a function: parameter types, return type, and whether the
/// function accepts additional variadic arguments.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub ret: Type,
    pub is_variadic: bool,
}

impl FuncType {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self {
            params,
            ret,
            is_variadic: false,
        }
    }
}

/// A constant value.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Const {
    /// An integer constant of the given width.
    Int { bits: u16, value: u64 },
    /// The null pointer.
    NullPtr,
    /// The zero value of an arbitrary type (all-zero bytes).
    Zero(Type),
    /// An undefined value of an arbitrary type.
    Undef(Type),
    /// The address of a global, as a pointer.
    GlobalRef(GlobalId),
    /// The address of a global plus a byte offset, reinterpreted as an
    /// integer of the given width. This is a relocatable expression; it
    /// survives constant folding intact so later passes can recover
    /// cross-references from it.
    GlobalAddr {
        global: GlobalId,
        offset: u64,
        bits: u16,
    },
}

impl Const {
    pub fn ty(&self) -> Type {
        match self {
            Const::Int { bits, .. } => Type::Int(*bits),
            Const::NullPtr => Type::Ptr,
            Const::Zero(ty) | Const::Undef(ty) => ty.clone(),
            Const::GlobalRef(_) => Type::Ptr,
            Const::GlobalAddr { bits, .. } => Type::Int(*bits),
        }
    }
}

/// A value usable as an instruction operand. Instruction results are
/// identified by the instruction that produced them.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Value {
    /// The n-th parameter of the enclosing function.
    Arg(u32),
    /// The result of an instruction in the enclosing function.
    Inst(InstId),
    Const(Const),
}

impl Value {
    pub fn int(bits: u16, value: u64) -> Self {
        Value::Const(Const::Int { bits, value })
    }

    pub fn undef(ty: Type) -> Self {
        Value::Const(Const::Undef(ty))
    }

    pub fn as_inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(id) => Some(*id),
            _ => None,
        }
    }
}

/// An instruction.
///
/// Loads and stores through [`Inst::RegAddr`] pointers model access to the
/// named slot of an emulated state structure; loads and stores through
/// [`Inst::Alloca`] pointers model function-local scratch slots. Everything
/// else a machine instruction does is hidden behind [`Inst::Call`]s to
/// opaque semantics functions and intrinsics.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Inst {
    /// A stack slot of the given type; yields a pointer to it.
    Alloca(Type),
    /// Read a value of type `ty` through `ptr`.
    Load { ty: Type, ptr: Value },
    /// Write `value` through `ptr`.
    Store { ptr: Value, value: Value },
    /// The address of the register slot named `reg` inside the emulated
    /// state structure pointed to by `state`.
    RegAddr {
        state: Value,
        reg: String,
        ty: Type,
    },
    /// A direct call.
    Call { callee: FuncId, args: Vec<Value> },
    /// Integer addition (wrapping).
    Add { lhs: Value, rhs: Value },
    /// Reinterpret a pointer as an integer of the given width.
    PtrToInt { value: Value, bits: u16 },
    /// Reinterpret an integer as a pointer.
    IntToPtr { value: Value },
    /// `agg` with field `index` replaced by `value`.
    InsertField {
        agg: Value,
        index: usize,
        value: Value,
    },
    /// Field `index` of the aggregate `agg`.
    ExtractField { agg: Value, index: usize },
}

impl Inst {
    /// Whether removing this instruction (when its result is unused) would
    /// change observable behavior.
    pub fn has_side_effects(&self, module: &Module) -> bool {
        match self {
            Inst::Store { .. } => true,
            Inst::Call { callee, .. } => !module.func(*callee).read_none,
            _ => false,
        }
    }

    pub fn for_each_operand(&self, mut f: impl FnMut(&Value)) {
        match self {
            Inst::Alloca(_) => {}
            Inst::Load { ptr, .. } => f(ptr),
            Inst::Store { ptr, value } => {
                f(ptr);
                f(value);
            }
            Inst::RegAddr { state, .. } => f(state),
            Inst::Call { args, .. } => args.iter().for_each(f),
            Inst::Add { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            Inst::PtrToInt { value, .. } | Inst::IntToPtr { value } => f(value),
            Inst::InsertField { agg, value, .. } => {
                f(agg);
                f(value);
            }
            Inst::ExtractField { agg, .. } => f(agg),
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Inst::Alloca(_) => {}
            Inst::Load { ptr, .. } => f(ptr),
            Inst::Store { ptr, value } => {
                f(ptr);
                f(value);
            }
            Inst::RegAddr { state, .. } => f(state),
            Inst::Call { args, .. } => args.iter_mut().for_each(f),
            Inst::Add { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            Inst::PtrToInt { value, .. } | Inst::IntToPtr { value } => f(value),
            Inst::InsertField { agg, value, .. } => {
                f(agg);
                f(value);
            }
            Inst::ExtractField { agg, .. } => f(agg),
        }
    }
}

/// How a basic block ends.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub enum Terminator {
    /// Still under construction.
    #[default]
    None,
    Br(BlockId),
    /// Two-way branch; `cond` is an integer, non-zero means taken.
    CondBr {
        cond: Value,
        taken: BlockId,
        not_taken: BlockId,
    },
    Ret(Value),
    RetVoid,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::None | Terminator::Ret(_) | Terminator::RetVoid => vec![],
            Terminator::Br(b) => vec![*b],
            Terminator::CondBr {
                taken, not_taken, ..
            } => vec![*taken, *not_taken],
        }
    }

    pub fn for_each_value(&self, mut f: impl FnMut(&Value)) {
        match self {
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::Ret(v) => f(v),
            _ => {}
        }
    }

    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::Ret(v) => f(v),
            _ => {}
        }
    }
}

/// A basic block: a straight-line run of instructions plus a terminator.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
    pub term: Terminator,
}

/// The body of a defined function.
#[derive(Clone, Debug)]
pub struct FuncBody {
    pub ty: FuncType,
    pub blocks: SlotMap<BlockId, Block>,
    pub insts: SlotMap<InstId, Inst>,
    pub entry: BlockId,
}

impl FuncBody {
    pub fn new(ty: FuncType) -> Self {
        let mut blocks = SlotMap::with_key();
        let entry = blocks.insert(Block {
            name: String::new(),
            insts: Vec::new(),
            term: Terminator::None,
        });
        Self {
            ty,
            blocks,
            insts: SlotMap::with_key(),
            entry,
        }
    }

    pub fn new_block(&mut self, name: impl Into<String>) -> BlockId {
        self.blocks.insert(Block {
            name: name.into(),
            insts: Vec::new(),
            term: Terminator::None,
        })
    }

    /// Append an instruction to `block` and return its result value.
    pub fn push(&mut self, block: BlockId, inst: Inst) -> Value {
        let id = self.insts.insert(inst);
        self.blocks[block].insts.push(id);
        Value::Inst(id)
    }

    pub fn set_term(&mut self, block: BlockId, term: Terminator) {
        self.blocks[block].term = term;
    }

    pub fn alloca(&mut self, block: BlockId, ty: Type) -> Value {
        self.push(block, Inst::Alloca(ty))
    }

    pub fn load(&mut self, block: BlockId, ty: Type, ptr: Value) -> Value {
        self.push(block, Inst::Load { ty, ptr })
    }

    pub fn store(&mut self, block: BlockId, ptr: Value, value: Value) -> Value {
        self.push(block, Inst::Store { ptr, value })
    }

    pub fn reg_addr(&mut self, block: BlockId, state: Value, reg: &str, ty: Type) -> Value {
        self.push(
            block,
            Inst::RegAddr {
                state,
                reg: reg.to_string(),
                ty,
            },
        )
    }

    pub fn call(&mut self, block: BlockId, callee: FuncId, args: Vec<Value>) -> Value {
        self.push(block, Inst::Call { callee, args })
    }

    pub fn add(&mut self, block: BlockId, lhs: Value, rhs: Value) -> Value {
        self.push(block, Inst::Add { lhs, rhs })
    }

    pub fn ptr_to_int(&mut self, block: BlockId, value: Value, bits: u16) -> Value {
        self.push(block, Inst::PtrToInt { value, bits })
    }

    pub fn int_to_ptr(&mut self, block: BlockId, value: Value) -> Value {
        self.push(block, Inst::IntToPtr { value })
    }

    pub fn insert_field(&mut self, block: BlockId, agg: Value, index: usize, value: Value) -> Value {
        self.push(block, Inst::InsertField { agg, index, value })
    }

    pub fn extract_field(&mut self, block: BlockId, agg: Value, index: usize) -> Value {
        self.push(block, Inst::ExtractField { agg, index })
    }

    /// The type of an arbitrary value appearing in this body.
    pub fn value_type(&self, module: &Module, v: &Value) -> Type {
        match v {
            Value::Arg(i) => self.ty.params[*i as usize].clone(),
            Value::Const(c) => c.ty(),
            Value::Inst(id) => self.inst_type(module, *id),
        }
    }

    pub fn inst_type(&self, module: &Module, id: InstId) -> Type {
        match &self.insts[id] {
            Inst::Alloca(_) | Inst::RegAddr { .. } | Inst::IntToPtr { .. } => Type::Ptr,
            Inst::Load { ty, .. } => ty.clone(),
            Inst::Store { .. } => Type::Void,
            Inst::Call { callee, .. } => module.func(*callee).ty.ret.clone(),
            Inst::Add { lhs, .. } => self.value_type(module, lhs),
            Inst::PtrToInt { bits, .. } => Type::Int(*bits),
            Inst::InsertField { agg, .. } => self.value_type(module, agg),
            Inst::ExtractField { agg, index } => match self.value_type(module, agg) {
                Type::Struct(fields) => fields[*index].clone(),
                other => other,
            },
        }
    }

    /// Replace every use of `from` (in operands and terminators) with `to`.
    pub fn replace_uses(&mut self, from: &Value, to: &Value) {
        for (_, inst) in self.insts.iter_mut() {
            inst.for_each_operand_mut(|v| {
                if v == from {
                    *v = to.clone();
                }
            });
        }
        for (_, block) in self.blocks.iter_mut() {
            block.term.for_each_value_mut(|v| {
                if v == from {
                    *v = to.clone();
                }
            });
        }
    }

    /// The number of operand and terminator uses of `v`.
    pub fn use_count(&self, v: &Value) -> usize {
        let mut n = 0;
        for (_, inst) in self.insts.iter() {
            inst.for_each_operand(|op| {
                if op == v {
                    n += 1;
                }
            });
        }
        for (_, block) in self.blocks.iter() {
            block.term.for_each_value(|op| {
                if op == v {
                    n += 1;
                }
            });
        }
        n
    }

    /// Remove a set of instructions from every block and from the arena.
    pub fn remove_insts(&mut self, dead: &UnorderedSet<InstId>) {
        for (_, block) in self.blocks.iter_mut() {
            block.insts.retain(|id| !dead.contains(id));
        }
        self.insts.retain(|id, _| !dead.contains(&id));
    }

    /// Drop arena entries for instructions no longer listed in any block.
    pub fn purge_unlisted_insts(&mut self) {
        let mut live = UnorderedSet::default();
        for (_, block) in self.blocks.iter() {
            live.extend(block.insts.iter().copied());
        }
        self.insts.retain(|id, _| live.contains(&id));
    }
}

/// A function: a declaration, optionally with a body.
#[derive(Clone, Debug)]
pub struct Func {
    pub name: String,
    pub ty: FuncType,
    pub calling_convention: u32,
    /// Never inline this function; also marks intrinsics and other opaque
    /// declarations whose calls must survive cleanup untouched.
    pub no_inline: bool,
    /// Reads no memory and has no side effects. Calls to such a function
    /// may be removed if their result is unused.
    pub read_none: bool,
    pub body: Option<FuncBody>,
}

impl Func {
    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }
}

/// A global variable. Globals are declared by name; an uninitialized global
/// is an external symbol, an initialized one is zero-filled.
#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub zero_initialized: bool,
}

/// A module: a bag of functions and globals with unique names.
#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    funcs: SlotMap<FuncId, Func>,
    globals: SlotMap<GlobalId, Global>,
    func_names: UnorderedMap<String, FuncId>,
    global_names: UnorderedMap<String, GlobalId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Get or create a declaration for `name`. The type of an existing
    /// function must match.
    pub fn declare_function(&mut self, name: &str, ty: FuncType, calling_convention: u32) -> FuncId {
        if let Some(&f) = self.func_names.get(name) {
            assert_eq!(
                self.funcs[f].ty, ty,
                "redeclaration of `{}` with a different type",
                name
            );
            return f;
        }
        let f = self.funcs.insert(Func {
            name: name.to_string(),
            ty,
            calling_convention,
            no_inline: false,
            read_none: false,
            body: None,
        });
        self.func_names.insert(name.to_string(), f);
        f
    }

    pub fn function_named(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    pub fn func(&self, f: FuncId) -> &Func {
        &self.funcs[f]
    }

    pub fn func_mut(&mut self, f: FuncId) -> &mut Func {
        &mut self.funcs[f]
    }

    pub fn funcs(&self) -> impl Iterator<Item = (FuncId, &Func)> {
        self.funcs.iter()
    }

    /// Give `f` a fresh, empty body, replacing any existing one.
    pub fn define(&mut self, f: FuncId) -> &mut FuncBody {
        let ty = self.funcs[f].ty.clone();
        self.funcs[f].body = Some(FuncBody::new(ty));
        self.funcs[f].body.as_mut().unwrap()
    }

    pub fn erase_body(&mut self, f: FuncId) {
        self.funcs[f].body = None;
    }

    /// The body of a defined function. Panics on a declaration.
    pub fn body(&self, f: FuncId) -> &FuncBody {
        self.funcs[f]
            .body
            .as_ref()
            .unwrap_or_else(|| panic!("function `{}` has no body", self.funcs[f].name))
    }

    pub fn body_mut(&mut self, f: FuncId) -> &mut FuncBody {
        let name = self.funcs[f].name.clone();
        self.funcs[f]
            .body
            .as_mut()
            .unwrap_or_else(|| panic!("function `{}` has no body", name))
    }

    /// Rename a function, keeping the name index coherent.
    pub fn set_func_name(&mut self, f: FuncId, new_name: &str) {
        let old = self.funcs[f].name.clone();
        if old == new_name {
            return;
        }
        assert!(
            !self.func_names.contains_key(new_name),
            "a function named `{}` already exists",
            new_name
        );
        self.func_names.remove(&old);
        self.func_names.insert(new_name.to_string(), f);
        self.funcs[f].name = new_name.to_string();
    }

    /// Get or create a global named `name`. The type of an existing global
    /// must match.
    pub fn declare_global(&mut self, name: &str, ty: Type) -> GlobalId {
        if let Some(&g) = self.global_names.get(name) {
            assert_eq!(
                self.globals[g].ty, ty,
                "redeclaration of global `{}` with a different type",
                name
            );
            return g;
        }
        let g = self.globals.insert(Global {
            name: name.to_string(),
            ty,
            zero_initialized: false,
        });
        self.global_names.insert(name.to_string(), g);
        g
    }

    pub fn global_named(&self, name: &str) -> Option<GlobalId> {
        self.global_names.get(name).copied()
    }

    pub fn global(&self, g: GlobalId) -> &Global {
        &self.globals[g]
    }

    pub fn global_mut(&mut self, g: GlobalId) -> &mut Global {
        &mut self.globals[g]
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &Global)> {
        self.globals.iter()
    }

    pub fn set_global_name(&mut self, g: GlobalId, new_name: &str) {
        let old = self.globals[g].name.clone();
        if old == new_name {
            return;
        }
        assert!(
            !self.global_names.contains_key(new_name),
            "a global named `{}` already exists",
            new_name
        );
        self.global_names.remove(&old);
        self.global_names.insert(new_name.to_string(), g);
        self.globals[g].name = new_name.to_string();
    }

    /// Copy a function from another module into this one, replacing any body
    /// the destination already had. Referenced functions and globals are
    /// declared here by name; instruction and block identities are freshly
    /// allocated.
    pub fn import_function(&mut self, src: &Module, src_id: FuncId) -> FuncId {
        let src_func = src.func(src_id);
        let dst_id = self.declare_function(
            &src_func.name,
            src_func.ty.clone(),
            src_func.calling_convention,
        );
        self.funcs[dst_id].no_inline = src_func.no_inline;
        self.funcs[dst_id].read_none = src_func.read_none;

        let Some(src_body) = &src_func.body else {
            return dst_id;
        };

        // Declare every function and global the body refers to.
        let mut func_map: UnorderedMap<FuncId, FuncId> = UnorderedMap::default();
        let mut global_map: UnorderedMap<GlobalId, GlobalId> = UnorderedMap::default();
        for (_, inst) in src_body.insts.iter() {
            if let Inst::Call { callee, .. } = inst {
                if !func_map.contains_key(callee) {
                    let cf = src.func(*callee);
                    let nf = self.declare_function(&cf.name, cf.ty.clone(), cf.calling_convention);
                    self.funcs[nf].no_inline |= cf.no_inline;
                    self.funcs[nf].read_none |= cf.read_none;
                    func_map.insert(*callee, nf);
                }
            }
            let mut remap_global = |g: GlobalId| {
                if !global_map.contains_key(&g) {
                    let sg = src.global(g);
                    let ng = self.declare_global(&sg.name, sg.ty.clone());
                    self.globals[ng].zero_initialized |= sg.zero_initialized;
                    global_map.insert(g, ng);
                }
            };
            inst.for_each_operand(|v| {
                if let Value::Const(Const::GlobalRef(g) | Const::GlobalAddr { global: g, .. }) = v {
                    remap_global(*g);
                }
            });
        }
        for (_, block) in src_body.blocks.iter() {
            block.term.for_each_value(|v| {
                if let Value::Const(Const::GlobalRef(g) | Const::GlobalAddr { global: g, .. }) = v {
                    if !global_map.contains_key(g) {
                        let sg = src.global(*g);
                        let ng = self.declare_global(&sg.name, sg.ty.clone());
                        global_map.insert(*g, ng);
                    }
                }
            });
        }

        // Clone the body, then fix up identities.
        let mut body = FuncBody::new(src_body.ty.clone());
        body.blocks.clear();
        let mut block_map: UnorderedMap<BlockId, BlockId> = UnorderedMap::default();
        for (bid, b) in src_body.blocks.iter() {
            let nb = body.blocks.insert(Block {
                name: b.name.clone(),
                insts: Vec::new(),
                term: Terminator::None,
            });
            block_map.insert(bid, nb);
        }
        body.entry = block_map[&src_body.entry];
        let mut inst_map: UnorderedMap<InstId, InstId> = UnorderedMap::default();
        for (bid, b) in src_body.blocks.iter() {
            for &iid in &b.insts {
                let nid = body.insts.insert(src_body.insts[iid].clone());
                body.blocks[block_map[&bid]].insts.push(nid);
                inst_map.insert(iid, nid);
            }
        }
        let remap_value = |v: &mut Value| match v {
            Value::Inst(id) => {
                let new_id = inst_map[id];
                *id = new_id;
            }
            Value::Const(Const::GlobalRef(g) | Const::GlobalAddr { global: g, .. }) => {
                let new_g = global_map[g];
                *g = new_g;
            }
            _ => {}
        };
        let ids: Vec<InstId> = inst_map.values().copied().collect();
        for nid in ids {
            if let Inst::Call { callee, .. } = &mut body.insts[nid] {
                let new_callee = func_map[callee];
                *callee = new_callee;
            }
            body.insts[nid].for_each_operand_mut(remap_value);
        }
        for (bid, b) in src_body.blocks.iter() {
            let mut term = b.term.clone();
            match &mut term {
                Terminator::Br(t) => {
                    let new_t = block_map[t];
                    *t = new_t;
                }
                Terminator::CondBr {
                    taken, not_taken, ..
                } => {
                    let (new_taken, new_not_taken) = (block_map[taken], block_map[not_taken]);
                    *taken = new_taken;
                    *not_taken = new_not_taken;
                }
                _ => {}
            }
            term.for_each_value_mut(remap_value);
            body.blocks[block_map[&bid]].term = term;
        }

        self.funcs[dst_id].body = Some(body);
        dst_id
    }
}

// ---------------------------------------------------------------------------
// Textual dump, for debugging and for the command-line tool's output.

struct ValueNames {
    by_inst: UnorderedMap<InstId, usize>,
    block_labels: UnorderedMap<BlockId, String>,
    order: Vec<BlockId>,
}

impl ValueNames {
    fn assign(body: &FuncBody) -> Self {
        let mut by_inst = UnorderedMap::default();
        let mut block_labels = UnorderedMap::default();
        let mut next = 0usize;
        let mut order: Vec<BlockId> = vec![body.entry];
        let mut seen: UnorderedSet<BlockId> = std::iter::once(body.entry).collect();
        let mut i = 0;
        while i < order.len() {
            let b = order[i];
            i += 1;
            for succ in body.blocks[b].term.successors() {
                if seen.insert(succ) {
                    order.push(succ);
                }
            }
        }
        // Blocks unreachable from the entry still get labels, after the rest.
        for (bid, _) in body.blocks.iter() {
            if seen.insert(bid) {
                order.push(bid);
            }
        }
        for (n, bid) in order.iter().enumerate() {
            let base = &body.blocks[*bid].name;
            let label = if base.is_empty() {
                format!("bb{}", n)
            } else {
                base.clone()
            };
            block_labels.insert(*bid, label);
            for &iid in &body.blocks[*bid].insts {
                by_inst.insert(iid, next);
                next += 1;
            }
        }
        Self {
            by_inst,
            block_labels,
            order,
        }
    }
}

fn fmt_type(ty: &Type) -> String {
    match ty {
        Type::Void => "void".into(),
        Type::Int(bits) => format!("i{}", bits),
        Type::Ptr => "ptr".into(),
        Type::Struct(fields) => format!("{{{}}}", fields.iter().map(fmt_type).join(", ")),
    }
}

fn fmt_value(module: &Module, names: &ValueNames, v: &Value) -> String {
    match v {
        Value::Arg(i) => format!("%arg{}", i),
        Value::Inst(id) => match names.by_inst.get(id) {
            Some(n) => format!("%{}", n),
            None => "%?".into(),
        },
        Value::Const(c) => match c {
            Const::Int { bits, value } => format!("i{} {:#x}", bits, value),
            Const::NullPtr => "null".into(),
            Const::Zero(ty) => format!("zeroinit {}", fmt_type(ty)),
            Const::Undef(ty) => format!("undef {}", fmt_type(ty)),
            Const::GlobalRef(g) => format!("@{}", module.global(*g).name),
            Const::GlobalAddr {
                global,
                offset,
                bits,
            } => format!("(i{})(@{} + {:#x})", bits, module.global(*global).name, offset),
        },
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for (_, g) in self.globals.iter() {
            writeln!(f, "global @{} : {}", g.name, fmt_type(&g.ty))?;
        }
        let mut funcs: Vec<&Func> = self.funcs.iter().map(|(_, func)| func).collect();
        funcs.sort_by(|a, b| a.name.cmp(&b.name));
        for func in funcs {
            let params = func.ty.params.iter().map(fmt_type).join(", ");
            let sig = format!(
                "{}({}{}) -> {}",
                func.name,
                params,
                if func.ty.is_variadic { ", ..." } else { "" },
                fmt_type(&func.ty.ret)
            );
            match &func.body {
                None => writeln!(f, "declare {}", sig)?,
                Some(body) => {
                    writeln!(f, "define {} {{", sig)?;
                    let names = ValueNames::assign(body);
                    for bid in names.order.iter().copied() {
                        writeln!(f, "{}:", names.block_labels[&bid])?;
                        for &iid in &body.blocks[bid].insts {
                            let val = |v: &Value| fmt_value(self, &names, v);
                            let lhs = format!("  %{} = ", names.by_inst[&iid]);
                            match &body.insts[iid] {
                                Inst::Alloca(ty) => {
                                    writeln!(f, "{}alloca {}", lhs, fmt_type(ty))?
                                }
                                Inst::Load { ty, ptr } => {
                                    writeln!(f, "{}load {}, {}", lhs, fmt_type(ty), val(ptr))?
                                }
                                Inst::Store { ptr, value } => {
                                    writeln!(f, "  store {}, {}", val(value), val(ptr))?
                                }
                                Inst::RegAddr { state, reg, ty } => writeln!(
                                    f,
                                    "{}regaddr {}.{} : {}",
                                    lhs,
                                    val(state),
                                    reg,
                                    fmt_type(ty)
                                )?,
                                Inst::Call { callee, args } => {
                                    let args = args.iter().map(|a| val(a)).join(", ");
                                    writeln!(
                                        f,
                                        "{}call @{}({})",
                                        lhs,
                                        self.func(*callee).name,
                                        args
                                    )?
                                }
                                Inst::Add { lhs: a, rhs: b } => {
                                    writeln!(f, "{}add {}, {}", lhs, val(a), val(b))?
                                }
                                Inst::PtrToInt { value, bits } => {
                                    writeln!(f, "{}ptrtoint {} to i{}", lhs, val(value), bits)?
                                }
                                Inst::IntToPtr { value } => {
                                    writeln!(f, "{}inttoptr {}", lhs, val(value))?
                                }
                                Inst::InsertField { agg, index, value } => writeln!(
                                    f,
                                    "{}insertfield {}, {}, {}",
                                    lhs,
                                    val(agg),
                                    index,
                                    val(value)
                                )?,
                                Inst::ExtractField { agg, index } => {
                                    writeln!(f, "{}extractfield {}, {}", lhs, val(agg), index)?
                                }
                            }
                        }
                        match &body.blocks[bid].term {
                            Terminator::None => writeln!(f, "  <unterminated>")?,
                            Terminator::Br(b) => {
                                writeln!(f, "  br {}", names.block_labels[b])?
                            }
                            Terminator::CondBr {
                                cond,
                                taken,
                                not_taken,
                            } => writeln!(
                                f,
                                "  condbr {}, {}, {}",
                                fmt_value(self, &names, cond),
                                names.block_labels[taken],
                                names.block_labels[not_taken]
                            )?,
                            Terminator::Ret(v) => {
                                writeln!(f, "  ret {}", fmt_value(self, &names, v))?
                            }
                            Terminator::RetVoid => writeln!(f, "  ret void")?,
                        }
                    }
                    writeln!(f, "}}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_and_dump_a_function() {
        let mut module = Module::new("m");
        let callee = module.declare_function(
            "ext",
            FuncType::new(vec![Type::Ptr], Type::Ptr),
            0,
        );
        let f = module.declare_function(
            "f",
            FuncType::new(vec![Type::Int(32)], Type::Int(32)),
            0,
        );
        module.define(f);
        let body = module.body_mut(f);
        let entry = body.entry;
        let slot = body.alloca(entry, Type::Int(32));
        body.store(entry, slot.clone(), Value::Arg(0));
        let v = body.load(entry, Type::Int(32), slot);
        let sum = body.add(entry, v, Value::int(32, 1));
        body.set_term(entry, Terminator::Ret(sum));

        assert!(module.func(callee).is_declaration());
        assert!(!module.func(f).is_declaration());
        let text = module.to_string();
        assert!(text.contains("declare ext(ptr) -> ptr"));
        assert!(text.contains("define f(i32) -> i32 {"));
        assert!(text.contains("add"));
    }

    #[test]
    fn import_remaps_callees_and_globals() {
        let mut src = Module::new("src");
        let g = src.declare_global("anchor", Type::Int(8));
        let callee = src.declare_function("callee", FuncType::new(vec![], Type::Void), 0);
        let f = src.declare_function("f", FuncType::new(vec![], Type::Int(64)), 0);
        src.define(f);
        let body = src.body_mut(f);
        let entry = body.entry;
        body.call(entry, callee, vec![]);
        body.set_term(
            entry,
            Terminator::Ret(Value::Const(Const::GlobalAddr {
                global: g,
                offset: 16,
                bits: 64,
            })),
        );

        let mut dst = Module::new("dst");
        let imported = dst.import_function(&src, f);
        assert_eq!(dst.func(imported).name, "f");
        assert!(dst.function_named("callee").is_some());
        assert!(dst.global_named("anchor").is_some());
        let dst_body = dst.body(imported);
        match &dst_body.blocks[dst_body.entry].term {
            Terminator::Ret(Value::Const(Const::GlobalAddr { global, .. })) => {
                assert_eq!(*global, dst.global_named("anchor").unwrap());
            }
            other => panic!("unexpected terminator {:?}", other),
        }
    }

    #[test]
    fn replace_uses_rewrites_operands_and_terminators() {
        let mut module = Module::new("m");
        let f = module.declare_function("f", FuncType::new(vec![Type::Int(8)], Type::Int(8)), 0);
        module.define(f);
        let body = module.body_mut(f);
        let entry = body.entry;
        let a = body.add(entry, Value::Arg(0), Value::int(8, 1));
        body.set_term(entry, Terminator::Ret(a.clone()));
        body.replace_uses(&a, &Value::int(8, 7));
        assert_eq!(
            body.blocks[entry].term,
            Terminator::Ret(Value::int(8, 7))
        );
        assert_eq!(body.use_count(&a), 0);
    }
}
