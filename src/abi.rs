//! Marshalling between the high-level function ABI and the emulated state.
//!
//! A declared value lives either in a register slot of the state structure
//! or in memory at a register-relative address. Stores to memory thread the
//! memory pointer through the width-suffixed write helpers, so the data
//! dependency chain of memory effects is explicit in the IR.

use crate::arch::Arch;
use crate::ir::{BlockId, FuncId, Module, Type, Value};
use crate::program::{FunctionDecl, ValueDecl, ValueLocation};
use crate::semantics;

fn bit_width(ty: &Type, addr_bits: u16) -> u16 {
    match ty {
        Type::Int(bits) => *bits,
        Type::Ptr => addr_bits,
        // Aggregates never occupy a single declared location; each field
        // gets its own value declaration.
        Type::Void | Type::Struct(_) => panic!("type {:?} has no single location width", ty),
    }
}

fn register_bits(arch: &dyn Arch, name: &str) -> u16 {
    arch.register_by_name(name)
        .map(|r| r.bits)
        .unwrap_or_else(|| arch.address_bits())
}

/// Whether every register a declaration names is known to the architecture.
/// Marshalling code paths assume this has been checked.
pub fn declaration_is_marshallable(arch: &dyn Arch, decl: &FunctionDecl) -> bool {
    let location_ok = |v: &ValueDecl| match &v.location {
        ValueLocation::Register(r) => arch.register_by_name(r).is_some(),
        ValueLocation::Memory { base, .. } => arch.register_by_name(base).is_some(),
    };
    decl.params.iter().all(|p| location_ok(&p.value))
        && decl.returns.iter().all(location_ok)
        && location_ok(&decl.return_address)
        && arch.register_by_name(&decl.return_stack_pointer).is_some()
}

/// Store a high-level `value` into its declared location. Returns the
/// (possibly new) memory pointer.
pub fn store_native_value(
    module: &mut Module,
    func: FuncId,
    block: BlockId,
    arch: &dyn Arch,
    state: &Value,
    mem: Value,
    decl: &ValueDecl,
    value: Value,
) -> Value {
    let addr_bits = arch.address_bits();
    let val_bits = bit_width(&decl.ty, addr_bits);
    match &decl.location {
        ValueLocation::Register(reg) => {
            let body = module.body_mut(func);
            let v = if decl.ty.is_pointer() {
                body.ptr_to_int(block, value, val_bits)
            } else {
                value
            };
            let slot = body.reg_addr(block, state.clone(), reg, Type::Int(val_bits));
            body.store(block, slot, v);
            mem
        }
        ValueLocation::Memory { base, offset } => {
            let write = semantics::write_memory_intrinsic(module, addr_bits, val_bits);
            let base_bits = register_bits(arch, base);
            let body = module.body_mut(func);
            let base_ptr = body.reg_addr(block, state.clone(), base, Type::Int(base_bits));
            let base_val = body.load(block, Type::Int(base_bits), base_ptr);
            let addr = body.add(block, base_val, Value::int(addr_bits, *offset as u64));
            let v = if decl.ty.is_pointer() {
                body.ptr_to_int(block, value, val_bits)
            } else {
                value
            };
            body.call(block, write, vec![mem, addr, v])
        }
    }
}

/// Load a declared value out of the emulated state or memory and present it
/// at its high-level type.
pub fn load_lifted_value(
    module: &mut Module,
    func: FuncId,
    block: BlockId,
    arch: &dyn Arch,
    state: &Value,
    mem: &Value,
    decl: &ValueDecl,
) -> Value {
    let addr_bits = arch.address_bits();
    let val_bits = bit_width(&decl.ty, addr_bits);
    let raw = match &decl.location {
        ValueLocation::Register(reg) => {
            let body = module.body_mut(func);
            let slot = body.reg_addr(block, state.clone(), reg, Type::Int(val_bits));
            body.load(block, Type::Int(val_bits), slot)
        }
        ValueLocation::Memory { base, offset } => {
            let read = semantics::read_memory_intrinsic(module, addr_bits, val_bits);
            let base_bits = register_bits(arch, base);
            let body = module.body_mut(func);
            let base_ptr = body.reg_addr(block, state.clone(), base, Type::Int(base_bits));
            let base_val = body.load(block, Type::Int(base_bits), base_ptr);
            let addr = body.add(block, base_val, Value::int(addr_bits, *offset as u64));
            body.call(block, read, vec![mem.clone(), addr])
        }
    };
    if decl.ty.is_pointer() {
        module.body_mut(func).int_to_ptr(block, raw)
    } else {
        raw
    }
}

/// Call a declared native function from inside a lifted block: pull its
/// arguments out of the emulated state, make the high-level call, write the
/// returned values back into the state, and apply the declared stack-pointer
/// exit discipline. Returns the new memory pointer.
pub fn call_from_lifted_block(
    module: &mut Module,
    func: FuncId,
    block: BlockId,
    arch: &dyn Arch,
    state: &Value,
    mem: Value,
    callee: FuncId,
    decl: &FunctionDecl,
) -> Value {
    let addr_bits = arch.address_bits();

    // The exit stack pointer is defined over the named register's value on
    // entry to the callee, so sample it before anything else happens.
    let sp_bits = register_bits(arch, &decl.return_stack_pointer);
    let sp_entry = {
        let body = module.body_mut(func);
        let sp_ptr = body.reg_addr(
            block,
            state.clone(),
            &decl.return_stack_pointer,
            Type::Int(sp_bits),
        );
        body.load(block, Type::Int(sp_bits), sp_ptr)
    };

    let mut args = Vec::with_capacity(decl.params.len());
    for param in &decl.params {
        args.push(load_lifted_value(
            module,
            func,
            block,
            arch,
            state,
            &mem,
            &param.value,
        ));
    }
    let ret = module.body_mut(func).call(block, callee, args);

    let mut mem = mem;
    match decl.returns.len() {
        0 => {}
        1 => {
            mem = store_native_value(
                module, func, block, arch, state, mem, &decl.returns[0], ret,
            );
        }
        _ => {
            for (index, ret_decl) in decl.returns.iter().enumerate() {
                let part = module
                    .body_mut(func)
                    .extract_field(block, ret.clone(), index);
                mem = store_native_value(module, func, block, arch, state, mem, ret_decl, part);
            }
        }
    }

    // sp' = entry value of the declared register, plus the declared offset.
    let body = module.body_mut(func);
    let sp_exit = body.add(
        block,
        sp_entry,
        Value::int(sp_bits, decl.return_stack_pointer_offset as u64),
    );
    let sp_name = arch.stack_pointer_register().to_string();
    let sp_slot = body.reg_addr(block, state.clone(), &sp_name, Type::Int(sp_bits));
    body.store(block, sp_slot, sp_exit);

    mem
}
