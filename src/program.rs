//! The registry of declared functions, variables, memory ranges, symbols,
//! and control-flow redirections.
//!
//! A [`Program`] is the in-memory form of an input specification. It backs
//! all three provider interfaces, so a fully populated registry is
//! everything a lifter needs to go from an entry address to lifted IR.

use crate::containers::unordered::UnorderedMap;
use crate::ir::{FuncType, Type};
use crate::providers::{
    ByteAvailability, BytePermission, ControlFlowProvider, MemoryProvider, TypeProvider,
};
use itertools::Itertools;
use std::collections::BTreeMap;
use thiserror::Error;

/// Where a parameter or return value lives at a function boundary.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ValueLocation {
    /// In the named register.
    Register(String),
    /// In memory at `base register + offset`, with the base register read
    /// at function entry (typically the stack pointer).
    Memory { base: String, offset: i64 },
}

/// A typed value location.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ValueDecl {
    pub location: ValueLocation,
    pub ty: Type,
}

impl ValueDecl {
    pub fn register(reg: &str, ty: Type) -> Self {
        Self {
            location: ValueLocation::Register(reg.to_string()),
            ty,
        }
    }

    pub fn memory(base: &str, offset: i64, ty: Type) -> Self {
        Self {
            location: ValueLocation::Memory {
                base: base.to_string(),
                offset,
            },
            ty,
        }
    }
}

/// A named function parameter.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ParameterDecl {
    /// Parameter names make the output easier to read but are optional.
    pub name: Option<String>,
    pub value: ValueDecl,
}

/// A register whose higher-level type (and possibly concrete value) is known
/// at one specific instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TypedRegisterDecl {
    pub reg: String,
    pub ty: Type,
    pub value: Option<u64>,
}

/// Everything the lifter needs to know about one native function's ABI.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionDecl {
    pub address: u64,
    pub params: Vec<ParameterDecl>,
    pub returns: Vec<ValueDecl>,
    /// Where the caller's return address is stored on entry.
    pub return_address: ValueDecl,
    /// The stack pointer's value on exit, expressed as
    /// `return_stack_pointer + return_stack_pointer_offset` over the named
    /// register's value on entry.
    pub return_stack_pointer: String,
    pub return_stack_pointer_offset: i64,
    /// Typed-register hints, keyed by instruction address.
    pub register_info: UnorderedMap<u64, Vec<TypedRegisterDecl>>,
    pub is_noreturn: bool,
    pub is_variadic: bool,
    pub calling_convention: u32,
}

impl FunctionDecl {
    /// The high-level type of the native function.
    pub fn func_type(&self) -> FuncType {
        let params = self.params.iter().map(|p| p.value.ty.clone()).collect();
        let ret = match self.returns.len() {
            0 => Type::Void,
            1 => self.returns[0].ty.clone(),
            _ => Type::Struct(self.returns.iter().map(|r| r.ty.clone()).collect()),
        };
        let mut ty = FuncType::new(params, ret);
        ty.is_variadic = self.is_variadic;
        ty
    }

    /// The default name given to this function until a symbol renames it:
    /// `sub_<hex address>_<type digest>_<calling convention>`.
    pub fn lifted_name(&self) -> String {
        format!(
            "sub_{:x}_{}_{}",
            self.address,
            func_type_digest(&self.func_type()),
            self.calling_convention
        )
    }
}

/// A declared global variable.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GlobalVarDecl {
    pub address: u64,
    pub ty: Type,
}

impl GlobalVarDecl {
    /// The default name given to this variable until a symbol renames it.
    pub fn lifted_name(&self) -> String {
        format!("var_{:x}_{}", self.address, type_digest(&self.ty))
    }
}

/// A deterministic, underscore-free encoding of a type, used inside
/// generated entity names.
pub fn type_digest(ty: &Type) -> String {
    match ty {
        Type::Void => "v".to_string(),
        Type::Int(bits) => format!("i{}", bits),
        Type::Ptr => "p".to_string(),
        Type::Struct(fields) => format!("s{}e", fields.iter().map(type_digest).join("")),
    }
}

/// The digest of a function type: return type first, then each parameter,
/// then a `z` marker for variadic functions.
pub fn func_type_digest(ty: &FuncType) -> String {
    format!(
        "{}{}{}",
        type_digest(&ty.ret),
        ty.params.iter().map(type_digest).join(""),
        if ty.is_variadic { "z" } else { "" }
    )
}

/// A contiguous run of mapped bytes.
#[derive(Clone, Debug)]
pub struct ByteRange {
    pub address: u64,
    pub data: Vec<u8>,
    pub is_writeable: bool,
    pub is_executable: bool,
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("function at {0:#x} is already declared")]
    DuplicateFunction(u64),
    #[error("variable at {0:#x} is already declared")]
    DuplicateVariable(u64),
    #[error("memory range at {0:#x} overlaps an existing range")]
    OverlappingRange(u64),
}

/// The program registry.
#[derive(Debug, Default)]
pub struct Program {
    pub arch_name: Option<String>,
    pub os_name: Option<String>,
    functions: BTreeMap<u64, FunctionDecl>,
    variables: BTreeMap<u64, GlobalVarDecl>,
    ranges: BTreeMap<u64, ByteRange>,
    symbols: Vec<(u64, String)>,
    redirections: UnorderedMap<u64, u64>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_function(&mut self, decl: FunctionDecl) -> Result<(), ProgramError> {
        if self.functions.contains_key(&decl.address) {
            return Err(ProgramError::DuplicateFunction(decl.address));
        }
        self.functions.insert(decl.address, decl);
        Ok(())
    }

    pub fn declare_variable(&mut self, decl: GlobalVarDecl) -> Result<(), ProgramError> {
        if self.variables.contains_key(&decl.address) {
            return Err(ProgramError::DuplicateVariable(decl.address));
        }
        self.variables.insert(decl.address, decl);
        Ok(())
    }

    pub fn map_range(&mut self, range: ByteRange) -> Result<(), ProgramError> {
        let start = range.address;
        let end = start + range.data.len() as u64;
        // The nearest range at or below `start` must end before it, and the
        // next range above must begin at or after `end`.
        if let Some((_, prev)) = self.ranges.range(..=start).next_back() {
            if prev.address + prev.data.len() as u64 > start {
                return Err(ProgramError::OverlappingRange(start));
            }
        }
        if let Some((&next_start, _)) = self.ranges.range(start..).next() {
            if next_start < end {
                return Err(ProgramError::OverlappingRange(start));
            }
        }
        self.ranges.insert(start, range);
        Ok(())
    }

    pub fn add_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.push((addr, name.to_string()));
    }

    pub fn add_control_flow_redirection(&mut self, from: u64, to: u64) {
        self.redirections.insert(from, to);
    }

    pub fn function_at(&self, addr: u64) -> Option<&FunctionDecl> {
        self.functions.get(&addr)
    }

    pub fn variable_at(&self, addr: u64) -> Option<&GlobalVarDecl> {
        self.variables.get(&addr)
    }

    /// Declared functions, in address order.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.functions.values()
    }

    /// Declared variables, in address order.
    pub fn variables(&self) -> impl Iterator<Item = &GlobalVarDecl> {
        self.variables.values()
    }

    pub fn symbols(&self) -> impl Iterator<Item = (u64, &str)> {
        self.symbols.iter().map(|(a, n)| (*a, n.as_str()))
    }

    fn range_containing(&self, addr: u64) -> Option<&ByteRange> {
        let (_, range) = self.ranges.range(..=addr).next_back()?;
        let end = range.address + range.data.len() as u64;
        (addr < end).then_some(range)
    }
}

impl MemoryProvider for Program {
    fn query(&self, addr: u64) -> (u8, ByteAvailability, BytePermission) {
        match self.range_containing(addr) {
            None => (0, ByteAvailability::Unavailable, BytePermission::Unknown),
            Some(range) => {
                let byte = range.data[(addr - range.address) as usize];
                let perm = match (range.is_writeable, range.is_executable) {
                    (false, false) => BytePermission::Readable,
                    (true, false) => BytePermission::ReadableWritable,
                    (false, true) => BytePermission::ReadableExecutable,
                    (true, true) => BytePermission::ReadableWritableExecutable,
                };
                (byte, ByteAvailability::Available, perm)
            }
        }
    }
}

impl TypeProvider for Program {
    fn try_get_function_type(&self, addr: u64) -> Option<FunctionDecl> {
        self.functions.get(&addr).cloned()
    }

    fn query_register_state_at_instruction(
        &self,
        func_addr: u64,
        inst_pc: u64,
        visitor: &mut dyn FnMut(&str, &Type, Option<u64>),
    ) {
        let Some(decl) = self.functions.get(&func_addr) else {
            return;
        };
        let Some(hints) = decl.register_info.get(&inst_pc) else {
            return;
        };
        for hint in hints {
            visitor(&hint.reg, &hint.ty, hint.value);
        }
    }
}

impl ControlFlowProvider for Program {
    fn redirection(&self, addr: u64) -> u64 {
        *self.redirections.get(&addr).unwrap_or(&addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digests_are_deterministic_and_underscore_free() {
        let ty = FuncType::new(
            vec![Type::Int(32), Type::Ptr],
            Type::Struct(vec![Type::Int(64), Type::Ptr]),
        );
        let digest = func_type_digest(&ty);
        assert_eq!(digest, "si64pei32p");
        assert!(!digest.contains('_'));
    }

    #[test]
    fn range_queries_respect_bounds_and_permissions() {
        let mut program = Program::new();
        program
            .map_range(ByteRange {
                address: 0x1000,
                data: vec![0xaa, 0xbb],
                is_writeable: false,
                is_executable: true,
            })
            .unwrap();
        assert_eq!(
            program.query(0x1000),
            (0xaa, ByteAvailability::Available, BytePermission::ReadableExecutable)
        );
        assert_eq!(
            program.query(0x1001),
            (0xbb, ByteAvailability::Available, BytePermission::ReadableExecutable)
        );
        assert_eq!(program.query(0x1002).1, ByteAvailability::Unavailable);
        assert_eq!(program.query(0xfff).1, ByteAvailability::Unavailable);

        assert!(program
            .map_range(ByteRange {
                address: 0x1001,
                data: vec![0x00],
                is_writeable: false,
                is_executable: false,
            })
            .is_err());
    }

    #[test]
    fn redirections_default_to_identity() {
        let mut program = Program::new();
        program.add_control_flow_redirection(0xe000, 0xf000);
        assert_eq!(program.redirection(0xe000), 0xf000);
        assert_eq!(program.redirection(0xe004), 0xe004);
    }
}
