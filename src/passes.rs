//! Post-lift flattening and cleanup.
//!
//! The pipeline first inlines every call to a defined, inline-eligible
//! function into the native wrapper, materializing the three-argument
//! helpers as straight-line code over the stack-allocated state. A fixed
//! sequence of function-local simplifications then runs: control-flow
//! simplification, promotion of scratch-slot memory to values, constant
//! reassociation, dead-store and dead-code elimination, scalar replacement
//! of the state aggregate, a second dead-code sweep, and instruction
//! combining. Local value names are stripped at the end.
//!
//! The analyses are deliberately block-local and conservative: any call
//! that may touch memory acts as a barrier, and nothing is moved across
//! blocks. Opaque declarations (intrinsics, semantics stubs) are never
//! touched.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::ir::{
    Block, BlockId, Const, FuncBody, FuncId, GlobalId, Inst, InstId, Module, Terminator, Type,
    Value,
};

pub fn run_cleanup_pipeline(module: &mut Module, func: FuncId) {
    inline_all_calls(module, func);
    simplify_cfg(module, func);
    promote_local_memory(module, func);
    reassociate(module, func);
    eliminate_dead_stores(module, func);
    eliminate_dead_code(module, func);
    split_state_allocas(module, func);
    eliminate_dead_code(module, func);
    combine_instructions(module, func);
    strip_value_names(module, func);
}

// ---------------------------------------------------------------------------
// Inlining

struct CallSite {
    block: BlockId,
    index: usize,
    call: InstId,
    callee: FuncId,
}

fn find_inlinable_call(module: &Module, func: FuncId) -> Option<CallSite> {
    let body = module.body(func);
    for (block, b) in body.blocks.iter() {
        for (index, &id) in b.insts.iter().enumerate() {
            if let Inst::Call { callee, .. } = &body.insts[id] {
                let f = module.func(*callee);
                if *callee != func && !f.is_declaration() && !f.no_inline {
                    return Some(CallSite {
                        block,
                        index,
                        call: id,
                        callee: *callee,
                    });
                }
            }
        }
    }
    None
}

/// Repeatedly inline calls to defined, inline-eligible functions until none
/// remain.
pub fn inline_all_calls(module: &mut Module, func: FuncId) {
    while let Some(site) = find_inlinable_call(module, func) {
        inline_call(module, func, site);
    }
}

fn inline_call(module: &mut Module, func: FuncId, site: CallSite) {
    let callee_body = module
        .func(site.callee)
        .body
        .clone()
        .expect("inline target has a body");
    let ret_ty = callee_body.ty.ret.clone();
    let args = match &module.body(func).insts[site.call] {
        Inst::Call { args, .. } => args.clone(),
        _ => unreachable!(),
    };

    let body = module.body_mut(func);

    // Split the call block: everything after the call moves into a fresh
    // continuation block that inherits the terminator.
    let cont = body.new_block("");
    let moved = body.blocks[site.block].insts.split_off(site.index + 1);
    body.blocks[cont].insts = moved;
    body.blocks[cont].term =
        std::mem::replace(&mut body.blocks[site.block].term, Terminator::None);
    let popped = body.blocks[site.block].insts.pop();
    debug_assert_eq!(popped, Some(site.call));

    // Clone the callee's blocks and instructions.
    let mut block_map: UnorderedMap<BlockId, BlockId> = UnorderedMap::default();
    for (bid, b) in callee_body.blocks.iter() {
        let nb = body.new_block(b.name.clone());
        block_map.insert(bid, nb);
    }
    let mut inst_map: UnorderedMap<InstId, InstId> = UnorderedMap::default();
    for (bid, b) in callee_body.blocks.iter() {
        for &iid in &b.insts {
            let nid = body.insts.insert(callee_body.insts[iid].clone());
            body.blocks[block_map[&bid]].insts.push(nid);
            inst_map.insert(iid, nid);
        }
    }
    let ids: Vec<InstId> = inst_map.values().copied().collect();
    for nid in ids {
        body.insts[nid].for_each_operand_mut(|v| match v {
            Value::Arg(i) => {
                let index = *i as usize;
                *v = args[index].clone();
            }
            Value::Inst(id) => {
                let new_id = inst_map[id];
                *id = new_id;
            }
            _ => {}
        });
    }

    // Returns become branches to the continuation.
    let mut returned: Vec<(BlockId, Option<Value>)> = Vec::new();
    for (bid, b) in callee_body.blocks.iter() {
        let nb = block_map[&bid];
        let remap_value = |v: &Value| match v {
            Value::Arg(i) => args[*i as usize].clone(),
            Value::Inst(id) => Value::Inst(inst_map[id]),
            other => other.clone(),
        };
        let term = match &b.term {
            Terminator::None => Terminator::None,
            Terminator::Br(t) => Terminator::Br(block_map[t]),
            Terminator::CondBr {
                cond,
                taken,
                not_taken,
            } => Terminator::CondBr {
                cond: remap_value(cond),
                taken: block_map[taken],
                not_taken: block_map[not_taken],
            },
            Terminator::Ret(v) => {
                returned.push((nb, Some(remap_value(v))));
                Terminator::Br(cont)
            }
            Terminator::RetVoid => {
                returned.push((nb, None));
                Terminator::Br(cont)
            }
        };
        body.blocks[nb].term = term;
    }

    // Wire the call's result through. A single return feeds uses directly;
    // multiple returns merge through a scratch slot, since the IR has no
    // phi nodes.
    let call_value = Value::Inst(site.call);
    if !ret_ty.is_void() {
        match returned.len() {
            0 => {
                // The callee never returns; uses of the call are unreachable.
                body.replace_uses(&call_value, &Value::undef(ret_ty));
            }
            1 => {
                let v = returned[0].1.clone().expect("typed return");
                body.replace_uses(&call_value, &v);
            }
            _ => {
                let slot_id = body.insts.insert(Inst::Alloca(ret_ty.clone()));
                body.blocks[site.block].insts.push(slot_id);
                let slot = Value::Inst(slot_id);
                for (ret_block, v) in &returned {
                    let store = body.insts.insert(Inst::Store {
                        ptr: slot.clone(),
                        value: v.clone().expect("typed return"),
                    });
                    body.blocks[*ret_block].insts.push(store);
                }
                let load = body.insts.insert(Inst::Load {
                    ty: ret_ty,
                    ptr: slot,
                });
                body.blocks[cont].insts.insert(0, load);
                body.replace_uses(&call_value, &Value::Inst(load));
            }
        }
    }

    body.blocks[site.block].term = Terminator::Br(block_map[&callee_body.entry]);
    body.insts.remove(site.call);
}

// ---------------------------------------------------------------------------
// Control-flow simplification

/// Remove blocks unreachable from the entry, then merge single-predecessor
/// straight-line chains.
pub fn simplify_cfg(module: &mut Module, func: FuncId) {
    let body = module.body_mut(func);
    remove_unreachable_blocks(body);
    loop {
        let mut preds: UnorderedMap<BlockId, usize> = UnorderedMap::default();
        for (_, b) in body.blocks.iter() {
            for succ in b.term.successors() {
                *preds.entry(succ).or_default() += 1;
            }
        }
        let mut merged = None;
        for (bid, b) in body.blocks.iter() {
            if let Terminator::Br(target) = &b.term {
                let target = *target;
                if target != bid
                    && target != body.entry
                    && preds.get(&target).copied() == Some(1)
                {
                    merged = Some((bid, target));
                    break;
                }
            }
        }
        let Some((bid, target)) = merged else { break };
        let Block { insts, term, .. } = body.blocks.remove(target).expect("merge target");
        body.blocks[bid].insts.extend(insts);
        body.blocks[bid].term = term;
    }
    body.purge_unlisted_insts();
}

fn remove_unreachable_blocks(body: &mut FuncBody) {
    let mut reachable: UnorderedSet<BlockId> = UnorderedSet::default();
    let mut stack = vec![body.entry];
    reachable.insert(body.entry);
    while let Some(bid) = stack.pop() {
        for succ in body.blocks[bid].term.successors() {
            if reachable.insert(succ) {
                stack.push(succ);
            }
        }
    }
    body.blocks.retain(|bid, _| reachable.contains(&bid));
    body.purge_unlisted_insts();
}

// ---------------------------------------------------------------------------
// Memory promotion, dead stores, dead code

/// What a pointer value definitely refers to.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum Root {
    Alloca(InstId),
    /// A register slot of some state pointer.
    Reg(Value, String),
    Global(GlobalId),
}

fn root_of(body: &FuncBody, ptr: &Value) -> Option<Root> {
    match ptr {
        Value::Inst(id) => match &body.insts[*id] {
            Inst::Alloca(_) => Some(Root::Alloca(*id)),
            Inst::RegAddr { state, reg, .. } => Some(Root::Reg(state.clone(), reg.clone())),
            _ => None,
        },
        Value::Const(Const::GlobalRef(g)) => Some(Root::Global(*g)),
        _ => None,
    }
}

/// A whole-object access through an alloca overlaps every register slot
/// carved out of that same alloca.
fn may_alias(a: &Root, b: &Root) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Root::Alloca(id), Root::Reg(state, _)) | (Root::Reg(state, _), Root::Alloca(id)) => {
            state == &Value::Inst(*id)
        }
        _ => false,
    }
}

fn call_is_barrier(module: &Module, body: &FuncBody, id: InstId) -> bool {
    match &body.insts[id] {
        Inst::Call { callee, .. } => !module.func(*callee).read_none,
        _ => false,
    }
}

/// Forward stored values to loads of the same slot within a block. Any call
/// that may touch memory invalidates everything known.
pub fn promote_local_memory(module: &mut Module, func: FuncId) {
    let body = module.body(func);
    let mut replacements: Vec<(InstId, Value)> = Vec::new();
    for (_, b) in body.blocks.iter() {
        let mut known: UnorderedMap<Root, Value> = UnorderedMap::default();
        for &id in &b.insts {
            if call_is_barrier(module, body, id) {
                known.clear();
                continue;
            }
            match &body.insts[id] {
                Inst::Store { ptr, value } => match root_of(body, ptr) {
                    Some(root) => {
                        known.retain(|k, _| !may_alias(k, &root));
                        known.insert(root, value.clone());
                    }
                    None => known.clear(),
                },
                Inst::Load { ty, ptr } => {
                    if let Some(root) = root_of(body, ptr) {
                        if let Some(v) = known.get(&root) {
                            if body.value_type(module, v) == *ty {
                                replacements.push((id, v.clone()));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    let body = module.body_mut(func);
    for (load, v) in replacements {
        body.replace_uses(&Value::Inst(load), &v);
    }
}

/// Fold chains of constant additions: `(x + c1) + c2` becomes `x + (c1+c2)`,
/// and constants move to the right-hand side.
pub fn reassociate(module: &mut Module, func: FuncId) {
    let body = module.body_mut(func);
    loop {
        let mut change: Option<(InstId, Inst)> = None;
        for (id, inst) in body.insts.iter() {
            let Inst::Add { lhs, rhs } = inst else {
                continue;
            };
            if matches!(lhs, Value::Const(Const::Int { .. }))
                && !matches!(rhs, Value::Const(_))
            {
                change = Some((
                    id,
                    Inst::Add {
                        lhs: rhs.clone(),
                        rhs: lhs.clone(),
                    },
                ));
                break;
            }
            if let (Value::Inst(inner), Value::Const(Const::Int { bits, value: c2 })) = (lhs, rhs)
            {
                if let Inst::Add {
                    lhs: x,
                    rhs: Value::Const(Const::Int { value: c1, .. }),
                } = &body.insts[*inner]
                {
                    change = Some((
                        id,
                        Inst::Add {
                            lhs: x.clone(),
                            rhs: Value::Const(Const::Int {
                                bits: *bits,
                                value: c1.wrapping_add(*c2),
                            }),
                        },
                    ));
                    break;
                }
            }
        }
        match change {
            Some((id, inst)) => body.insts[id] = inst,
            None => break,
        }
    }
}

/// Remove stores that are overwritten later in the same block with no
/// intervening read or barrier.
pub fn eliminate_dead_stores(module: &mut Module, func: FuncId) {
    let body = module.body(func);
    let mut dead: UnorderedSet<InstId> = UnorderedSet::default();
    for (_, b) in body.blocks.iter() {
        // Slots known to be overwritten later with nothing reading between.
        let mut overwritten: UnorderedSet<Root> = UnorderedSet::default();
        for &id in b.insts.iter().rev() {
            if call_is_barrier(module, body, id) {
                overwritten.clear();
                continue;
            }
            match &body.insts[id] {
                Inst::Store { ptr, .. } => match root_of(body, ptr) {
                    Some(root) => {
                        if overwritten.contains(&root) {
                            dead.insert(id);
                        } else {
                            overwritten.insert(root);
                        }
                    }
                    None => overwritten.clear(),
                },
                Inst::Load { ptr, .. } => match root_of(body, ptr) {
                    Some(root) => {
                        overwritten.retain(|r| !may_alias(r, &root));
                    }
                    None => overwritten.clear(),
                },
                _ => {}
            }
        }
    }
    module.body_mut(func).remove_insts(&dead);
}

/// Remove instructions whose results are unused and which have no side
/// effects, repeating until nothing changes.
pub fn eliminate_dead_code(module: &mut Module, func: FuncId) {
    loop {
        let body = module.body(func);
        let mut used: UnorderedSet<InstId> = UnorderedSet::default();
        for (_, inst) in body.insts.iter() {
            inst.for_each_operand(|v| {
                if let Value::Inst(id) = v {
                    used.insert(*id);
                }
            });
        }
        for (_, b) in body.blocks.iter() {
            b.term.for_each_value(|v| {
                if let Value::Inst(id) = v {
                    used.insert(*id);
                }
            });
        }
        let mut dead: UnorderedSet<InstId> = UnorderedSet::default();
        for (id, inst) in body.insts.iter() {
            if !used.contains(&id) && !inst.has_side_effects(module) {
                dead.insert(id);
            }
        }
        if dead.is_empty() {
            break;
        }
        module.body_mut(func).remove_insts(&dead);
    }
}

/// Scalar replacement of the state aggregate: an alloca whose only uses are
/// register-slot addressing (and whole-object zero/undef stores) is split
/// into one scalar alloca per register slot.
pub fn split_state_allocas(module: &mut Module, func: FuncId) {
    loop {
        let candidate = find_splittable_alloca(module, func);
        let Some((alloca, whole_stores, slots)) = candidate else {
            break;
        };
        let body = module.body_mut(func);
        let (home_block, home_index) = locate_inst(body, alloca);

        // One scalar slot per register name, in first-use order.
        let mut scalar: UnorderedMap<String, InstId> = UnorderedMap::default();
        let mut reg_order: Vec<(String, Type)> = Vec::new();
        let mut insert_at = home_index + 1;
        for (reg, ty, _) in &slots {
            if scalar.contains_key(reg) {
                continue;
            }
            let id = body.insts.insert(Inst::Alloca(ty.clone()));
            body.blocks[home_block].insts.insert(insert_at, id);
            insert_at += 1;
            scalar.insert(reg.clone(), id);
            reg_order.push((reg.clone(), ty.clone()));
        }

        // Whole-object initializing stores become per-slot stores.
        let mut dead: UnorderedSet<InstId> = UnorderedSet::default();
        for (store_id, is_zero) in &whole_stores {
            let (sb, si) = locate_inst(body, *store_id);
            let mut at = si + 1;
            for (reg, ty) in &reg_order {
                let value = if *is_zero {
                    Value::Const(Const::Zero(ty.clone()))
                } else {
                    Value::undef(ty.clone())
                };
                let id = body.insts.insert(Inst::Store {
                    ptr: Value::Inst(scalar[reg]),
                    value,
                });
                body.blocks[sb].insts.insert(at, id);
                at += 1;
            }
            dead.insert(*store_id);
        }

        for (reg, _, reg_addr) in &slots {
            body.replace_uses(&Value::Inst(*reg_addr), &Value::Inst(scalar[reg]));
            dead.insert(*reg_addr);
        }
        dead.insert(alloca);
        body.remove_insts(&dead);
    }
}

type SplitPlan = (InstId, Vec<(InstId, bool)>, Vec<(String, Type, InstId)>);

fn find_splittable_alloca(module: &Module, func: FuncId) -> Option<SplitPlan> {
    let body = module.body(func);
    'alloca: for (id, inst) in body.insts.iter() {
        if !matches!(inst, Inst::Alloca(Type::Struct(_))) {
            continue;
        }
        let this = Value::Inst(id);
        let mut whole_stores: Vec<(InstId, bool)> = Vec::new();
        let mut slots: Vec<(String, Type, InstId)> = Vec::new();
        let mut terminator_use = false;
        for (_, b) in body.blocks.iter() {
            b.term.for_each_value(|v| {
                if *v == this {
                    terminator_use = true;
                }
            });
        }
        if terminator_use {
            continue;
        }
        for (use_id, use_inst) in body.insts.iter() {
            let mut uses_this = false;
            use_inst.for_each_operand(|v| {
                if *v == this {
                    uses_this = true;
                }
            });
            if !uses_this {
                continue;
            }
            match use_inst {
                Inst::RegAddr { state, reg, ty } if *state == this => {
                    // Conflicting widths for one slot keep the aggregate.
                    if slots.iter().any(|(r, t, _)| r == reg && t != ty) {
                        continue 'alloca;
                    }
                    slots.push((reg.clone(), ty.clone(), use_id));
                }
                Inst::Store { ptr, value } if *ptr == this => match value {
                    Value::Const(Const::Zero(_)) => whole_stores.push((use_id, true)),
                    Value::Const(Const::Undef(_)) => whole_stores.push((use_id, false)),
                    _ => continue 'alloca,
                },
                _ => continue 'alloca,
            }
        }
        if slots.is_empty() {
            continue;
        }
        return Some((id, whole_stores, slots));
    }
    None
}

fn locate_inst(body: &FuncBody, id: InstId) -> (BlockId, usize) {
    for (bid, b) in body.blocks.iter() {
        if let Some(index) = b.insts.iter().position(|&i| i == id) {
            return (bid, index);
        }
    }
    panic!("instruction is not listed in any block");
}

// ---------------------------------------------------------------------------
// Instruction combining

/// Fold constants and trivial cast pairs, and collapse branches on constant
/// conditions.
pub fn combine_instructions(module: &mut Module, func: FuncId) {
    loop {
        let mut changed = false;

        let body = module.body(func);
        let mut replace: Option<(InstId, Value)> = None;
        for (id, inst) in body.insts.iter() {
            match inst {
                Inst::Add { lhs, rhs } => match (lhs, rhs) {
                    (
                        Value::Const(Const::Int { bits, value: a }),
                        Value::Const(Const::Int { value: b, .. }),
                    ) => {
                        replace = Some((
                            id,
                            Value::Const(Const::Int {
                                bits: *bits,
                                value: a.wrapping_add(*b),
                            }),
                        ));
                    }
                    (
                        Value::Const(Const::GlobalAddr {
                            global,
                            offset,
                            bits,
                        }),
                        Value::Const(Const::Int { value, .. }),
                    )
                    | (
                        Value::Const(Const::Int { value, .. }),
                        Value::Const(Const::GlobalAddr {
                            global,
                            offset,
                            bits,
                        }),
                    ) => {
                        replace = Some((
                            id,
                            Value::Const(Const::GlobalAddr {
                                global: *global,
                                offset: offset.wrapping_add(*value),
                                bits: *bits,
                            }),
                        ));
                    }
                    (x, Value::Const(Const::Int { value: 0, .. })) => {
                        replace = Some((id, x.clone()));
                    }
                    _ => {}
                },
                Inst::PtrToInt { value, bits } => match value {
                    Value::Const(Const::GlobalRef(g)) => {
                        replace = Some((
                            id,
                            Value::Const(Const::GlobalAddr {
                                global: *g,
                                offset: 0,
                                bits: *bits,
                            }),
                        ));
                    }
                    Value::Inst(inner) => {
                        if let Inst::IntToPtr { value: original } = &body.insts[*inner] {
                            if body.value_type(module, original) == Type::Int(*bits) {
                                replace = Some((id, original.clone()));
                            }
                        }
                    }
                    _ => {}
                },
                Inst::IntToPtr { value } => {
                    if let Value::Const(Const::GlobalAddr {
                        global,
                        offset: 0,
                        ..
                    }) = value
                    {
                        replace = Some((id, Value::Const(Const::GlobalRef(*global))));
                    }
                }
                _ => {}
            }
            if replace.is_some() {
                break;
            }
        }
        if let Some((id, v)) = replace {
            let body = module.body_mut(func);
            body.replace_uses(&Value::Inst(id), &v);
            let mut dead = UnorderedSet::default();
            dead.insert(id);
            body.remove_insts(&dead);
            changed = true;
        }

        // Branches on constant conditions.
        let body = module.body_mut(func);
        let mut fold: Option<(BlockId, BlockId)> = None;
        for (bid, b) in body.blocks.iter() {
            if let Terminator::CondBr {
                cond: Value::Const(Const::Int { value, .. }),
                taken,
                not_taken,
            } = &b.term
            {
                fold = Some((bid, if *value != 0 { *taken } else { *not_taken }));
                break;
            }
        }
        if let Some((bid, target)) = fold {
            body.set_term(bid, Terminator::Br(target));
            changed = true;
        }

        if !changed {
            break;
        }
    }
}

/// Generated block names only obscure the output.
pub fn strip_value_names(module: &mut Module, func: FuncId) {
    let body = module.body_mut(func);
    for (_, b) in body.blocks.iter_mut() {
        b.name.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::FuncType;

    fn int_func(module: &mut Module, name: &str) -> FuncId {
        let f = module.declare_function(
            name,
            FuncType::new(vec![Type::Int(32)], Type::Int(32)),
            0,
        );
        module.define(f);
        f
    }

    #[test]
    fn inline_single_return_callee() {
        let mut module = Module::new("m");
        let callee = int_func(&mut module, "callee");
        {
            let body = module.body_mut(callee);
            let entry = body.entry;
            let v = body.add(entry, Value::Arg(0), Value::int(32, 5));
            body.set_term(entry, Terminator::Ret(v));
        }
        let caller = int_func(&mut module, "caller");
        {
            let body = module.body_mut(caller);
            let entry = body.entry;
            let c = body.call(entry, callee, vec![Value::Arg(0)]);
            body.set_term(entry, Terminator::Ret(c));
        }

        inline_all_calls(&mut module, caller);
        let body = module.body(caller);
        for (_, inst) in body.insts.iter() {
            assert!(
                !matches!(inst, Inst::Call { .. }),
                "call should have been inlined"
            );
        }
    }

    #[test]
    fn simplify_merges_straight_line_blocks() {
        let mut module = Module::new("m");
        let f = int_func(&mut module, "f");
        let body = module.body_mut(f);
        let entry = body.entry;
        let second = body.new_block("second");
        let v = body.add(second, Value::Arg(0), Value::int(32, 1));
        body.set_term(entry, Terminator::Br(second));
        body.set_term(second, Terminator::Ret(v));
        let dangling = body.new_block("unreachable");
        body.set_term(dangling, Terminator::RetVoid);

        simplify_cfg(&mut module, f);
        let body = module.body(f);
        assert_eq!(body.blocks.len(), 1);
        assert!(matches!(body.blocks[body.entry].term, Terminator::Ret(_)));
    }

    #[test]
    fn promote_and_dce_remove_scratch_slots() {
        let mut module = Module::new("m");
        let f = int_func(&mut module, "f");
        let body = module.body_mut(f);
        let entry = body.entry;
        let slot = body.alloca(entry, Type::Int(32));
        body.store(entry, slot.clone(), Value::Arg(0));
        let v = body.load(entry, Type::Int(32), slot);
        body.set_term(entry, Terminator::Ret(v));

        promote_local_memory(&mut module, f);
        eliminate_dead_stores(&mut module, f);
        eliminate_dead_code(&mut module, f);

        let body = module.body(f);
        assert_eq!(body.blocks[body.entry].term, Terminator::Ret(Value::Arg(0)));
        // The store is not overwritten, so only promotion plus dead-code
        // elimination may remove the slot once the load is gone.
        assert!(body
            .insts
            .iter()
            .all(|(_, i)| !matches!(i, Inst::Load { .. })));
    }

    #[test]
    fn dead_store_elimination_is_blocked_by_calls() {
        let mut module = Module::new("m");
        let ext = module.declare_function("ext", FuncType::new(vec![], Type::Void), 0);
        module.func_mut(ext).no_inline = true;
        let f = int_func(&mut module, "f");
        let body = module.body_mut(f);
        let entry = body.entry;
        let slot = body.alloca(entry, Type::Int(32));
        body.store(entry, slot.clone(), Value::int(32, 1));
        body.call(entry, ext, vec![]);
        body.store(entry, slot.clone(), Value::int(32, 2));
        body.set_term(entry, Terminator::Ret(Value::Arg(0)));

        eliminate_dead_stores(&mut module, f);
        let stores = module
            .body(f)
            .insts
            .iter()
            .filter(|(_, i)| matches!(i, Inst::Store { .. }))
            .count();
        assert_eq!(stores, 2, "the call may observe the first store");
    }

    #[test]
    fn combine_folds_relocatable_offsets() {
        let mut module = Module::new("m");
        let g = module.declare_global("anchor", Type::Int(8));
        let f = int_func(&mut module, "f");
        let body = module.body_mut(f);
        let entry = body.entry;
        let base = Value::Const(Const::GlobalAddr {
            global: g,
            offset: 0x1000,
            bits: 32,
        });
        let sum = body.add(entry, base, Value::int(32, 8));
        body.set_term(entry, Terminator::Ret(sum));

        combine_instructions(&mut module, f);
        let body = module.body(f);
        match &body.blocks[body.entry].term {
            Terminator::Ret(Value::Const(Const::GlobalAddr { offset, .. })) => {
                assert_eq!(*offset, 0x1008);
            }
            other => panic!("expected folded relocation, got {:?}", other),
        }
    }
}
