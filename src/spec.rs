//! Parsing of JSON input specifications into a [`Program`] registry.
//!
//! A specification describes, for one binary: the functions to lift (entry
//! address, calling convention, typed parameter and return locations, the
//! return-address location, the stack pointer's exit value), declared global
//! variables, mapped memory ranges with permissions and hex-encoded data,
//! symbol names, and control-flow redirections.
//!
//! Types use a compact textual grammar: `v` is void, `iN` an N-bit integer,
//! `p` a pointer, and `{t0,t1,...}` a struct of those field types.

use crate::arch::Arch;
use crate::ir::Type;
use crate::program::{
    ByteRange, FunctionDecl, GlobalVarDecl, ParameterDecl, Program, ProgramError,
    TypedRegisterDecl, ValueDecl, ValueLocation,
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("function at {address:#x}: {message}")]
    Function { address: u64, message: String },
    #[error("variable at {address:#x}: {message}")]
    Variable { address: u64, message: String },
    #[error("cannot parse type `{0}`")]
    BadType(String),
    #[error("memory range at {address:#x}: {message}")]
    Range { address: u64, message: String },
}

#[derive(Debug, Deserialize, Default)]
struct RawSpec {
    arch: Option<String>,
    os: Option<String>,
    #[serde(default)]
    functions: Vec<RawFunction>,
    #[serde(default)]
    variables: Vec<RawVariable>,
    #[serde(default)]
    memory: Vec<RawRange>,
    #[serde(default)]
    symbols: Vec<(u64, String)>,
    #[serde(default)]
    control_flow_redirections: Vec<(u64, u64)>,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    address: u64,
    #[serde(default)]
    parameters: Vec<RawValue>,
    #[serde(default)]
    return_values: Vec<RawValue>,
    return_address: Option<RawValue>,
    return_stack_pointer: Option<RawReturnStackPointer>,
    #[serde(default)]
    register_info: Vec<RawTypedRegister>,
    #[serde(default)]
    is_noreturn: bool,
    #[serde(default)]
    is_variadic: bool,
    #[serde(default)]
    calling_convention: u32,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    name: Option<String>,
    #[serde(rename = "type")]
    type_str: String,
    register: Option<String>,
    memory: Option<RawMemoryLocation>,
}

#[derive(Debug, Deserialize)]
struct RawMemoryLocation {
    register: String,
    #[serde(default)]
    offset: i64,
}

#[derive(Debug, Deserialize)]
struct RawReturnStackPointer {
    register: String,
    #[serde(default)]
    offset: i64,
}

#[derive(Debug, Deserialize)]
struct RawTypedRegister {
    address: u64,
    register: String,
    #[serde(rename = "type")]
    type_str: String,
    value: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawVariable {
    address: u64,
    #[serde(rename = "type")]
    type_str: String,
}

#[derive(Debug, Deserialize)]
struct RawRange {
    address: u64,
    #[serde(default)]
    is_writeable: bool,
    #[serde(default)]
    is_executable: bool,
    data: String,
}

/// Read only the `arch` field of a specification, so the caller can build
/// the architecture backend before full parsing (which validates register
/// names against it).
pub fn peek_arch_name(text: &str) -> Result<Option<String>, SpecError> {
    #[derive(Deserialize)]
    struct ArchOnly {
        arch: Option<String>,
    }
    Ok(serde_json::from_str::<ArchOnly>(text)?.arch)
}

/// Parse a specification and populate a fresh [`Program`].
pub fn parse_spec(arch: &dyn Arch, text: &str) -> Result<Program, SpecError> {
    let raw: RawSpec = serde_json::from_str(text)?;
    let mut program = Program::new();
    program.arch_name = raw.arch;
    program.os_name = raw.os;

    for func in &raw.functions {
        let decl = parse_function(arch, func)?;
        program.declare_function(decl)?;
    }
    for var in &raw.variables {
        let ty = parse_type(&var.type_str).map_err(|e| SpecError::Variable {
            address: var.address,
            message: e.to_string(),
        })?;
        program.declare_variable(GlobalVarDecl {
            address: var.address,
            ty,
        })?;
    }
    for range in &raw.memory {
        program.map_range(parse_range(range)?)?;
    }
    for (addr, name) in &raw.symbols {
        program.add_symbol(name, *addr);
    }
    for (from, to) in &raw.control_flow_redirections {
        program.add_control_flow_redirection(*from, *to);
    }
    Ok(program)
}

fn function_error(address: u64, message: impl Into<String>) -> SpecError {
    SpecError::Function {
        address,
        message: message.into(),
    }
}

fn parse_function(arch: &dyn Arch, raw: &RawFunction) -> Result<FunctionDecl, SpecError> {
    let address = raw.address;

    let mut params = Vec::with_capacity(raw.parameters.len());
    for value in &raw.parameters {
        params.push(ParameterDecl {
            name: value.name.clone(),
            value: parse_value(arch, address, value, "function parameter")?,
        });
    }

    let mut returns = Vec::with_capacity(raw.return_values.len());
    for value in &raw.return_values {
        returns.push(parse_value(arch, address, value, "function return value")?);
    }

    let return_address = raw
        .return_address
        .as_ref()
        .ok_or_else(|| function_error(address, "missing `return_address`"))
        .and_then(|v| parse_value(arch, address, v, "return address"))?;

    let return_sp = raw
        .return_stack_pointer
        .as_ref()
        .ok_or_else(|| function_error(address, "missing `return_stack_pointer`"))?;
    if arch.register_by_name(&return_sp.register).is_none() {
        return Err(function_error(
            address,
            format!(
                "unknown register `{}` used for the exit stack pointer",
                return_sp.register
            ),
        ));
    }

    let mut register_info = crate::containers::unordered::UnorderedMap::default();
    for hint in &raw.register_info {
        if arch.register_by_name(&hint.register).is_none() {
            return Err(function_error(
                address,
                format!("unknown register `{}` in register_info", hint.register),
            ));
        }
        let ty = parse_type(&hint.type_str)
            .map_err(|e| function_error(address, e.to_string()))?;
        register_info
            .entry(hint.address)
            .or_insert_with(Vec::new)
            .push(TypedRegisterDecl {
                reg: hint.register.clone(),
                ty,
                value: hint.value,
            });
    }

    Ok(FunctionDecl {
        address,
        params,
        returns,
        return_address,
        return_stack_pointer: return_sp.register.clone(),
        return_stack_pointer_offset: return_sp.offset,
        register_info,
        is_noreturn: raw.is_noreturn,
        is_variadic: raw.is_variadic,
        calling_convention: raw.calling_convention,
    })
}

/// Parse a value location: exactly one of `register` or `memory`, plus a
/// type that can occupy a single location.
fn parse_value(
    arch: &dyn Arch,
    address: u64,
    raw: &RawValue,
    what: &str,
) -> Result<ValueDecl, SpecError> {
    let ty = parse_type(&raw.type_str).map_err(|e| function_error(address, e.to_string()))?;
    if !matches!(ty, Type::Int(_) | Type::Ptr) {
        return Err(function_error(
            address,
            format!("a {} must have an integer or pointer type", what),
        ));
    }
    let location = match (&raw.register, &raw.memory) {
        (Some(_), Some(_)) => {
            return Err(function_error(
                address,
                format!(
                    "a {} cannot be resident in both a register and a memory location",
                    what
                ),
            ));
        }
        (None, None) => {
            return Err(function_error(
                address,
                format!(
                    "a {} must be resident in either a register or a memory location",
                    what
                ),
            ));
        }
        (Some(reg), None) => {
            if arch.register_by_name(reg).is_none() {
                return Err(function_error(
                    address,
                    format!("unknown register `{}` used for storing a {}", reg, what),
                ));
            }
            ValueLocation::Register(reg.clone())
        }
        (None, Some(mem)) => {
            if arch.register_by_name(&mem.register).is_none() {
                return Err(function_error(
                    address,
                    format!(
                        "unknown memory base register `{}` used for storing a {}",
                        mem.register, what
                    ),
                ));
            }
            ValueLocation::Memory {
                base: mem.register.clone(),
                offset: mem.offset,
            }
        }
    };
    Ok(ValueDecl { location, ty })
}

fn parse_range(raw: &RawRange) -> Result<ByteRange, SpecError> {
    let text = raw.data.trim();
    if text.len() % 2 != 0 {
        return Err(SpecError::Range {
            address: raw.address,
            message: "hex data must have an even number of characters".into(),
        });
    }
    let mut data = Vec::with_capacity(text.len() / 2);
    for i in (0..text.len()).step_by(2) {
        let pair = &text[i..i + 2];
        let byte = u8::from_str_radix(pair, 16).map_err(|_| SpecError::Range {
            address: raw.address,
            message: format!("invalid hex byte `{}`", pair),
        })?;
        data.push(byte);
    }
    Ok(ByteRange {
        address: raw.address,
        data,
        is_writeable: raw.is_writeable,
        is_executable: raw.is_executable,
    })
}

/// Parse the compact type grammar.
pub fn parse_type(text: &str) -> Result<Type, SpecError> {
    let (ty, rest) = parse_type_prefix(text.trim())?;
    if !rest.is_empty() {
        return Err(SpecError::BadType(text.to_string()));
    }
    Ok(ty)
}

fn parse_type_prefix(text: &str) -> Result<(Type, &str), SpecError> {
    let bad = || SpecError::BadType(text.to_string());
    if let Some(rest) = text.strip_prefix('v') {
        return Ok((Type::Void, rest));
    }
    if let Some(rest) = text.strip_prefix('p') {
        return Ok((Type::Ptr, rest));
    }
    if let Some(rest) = text.strip_prefix('i') {
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(bad());
        }
        let bits: u16 = rest[..end].parse().map_err(|_| bad())?;
        if bits == 0 {
            return Err(bad());
        }
        return Ok((Type::Int(bits), &rest[end..]));
    }
    if let Some(mut rest) = text.strip_prefix('{') {
        let mut fields = Vec::new();
        loop {
            let (field, after) = parse_type_prefix(rest)?;
            fields.push(field);
            if let Some(after) = after.strip_prefix(',') {
                rest = after;
            } else if let Some(after) = after.strip_prefix('}') {
                return Ok((Type::Struct(fields), after));
            } else {
                return Err(bad());
            }
        }
    }
    Err(bad())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::providers::{ByteAvailability, BytePermission, MemoryProvider};
    use crate::tests::MiniArch;

    const SPEC: &str = r#"{
        "arch": "mini32",
        "os": "linux",
        "functions": [
            {
                "address": 4096,
                "parameters": [
                    {"name": "a", "type": "i32", "register": "r0"},
                    {"type": "p", "memory": {"register": "sp", "offset": 8}}
                ],
                "return_values": [{"type": "i32", "register": "r0"}],
                "return_address": {"type": "i32", "register": "ra"},
                "return_stack_pointer": {"register": "sp", "offset": 0},
                "register_info": [
                    {"address": 4100, "register": "r1", "type": "p", "value": 8192}
                ],
                "is_variadic": false,
                "calling_convention": 0
            }
        ],
        "variables": [{"address": 16384, "type": "{i32,i32}"}],
        "memory": [
            {"address": 4096, "is_executable": true, "data": "01000000070000f0"}
        ],
        "symbols": [[4096, "main"]],
        "control_flow_redirections": [[57344, 61440]]
    }"#;

    #[test]
    fn parses_a_complete_spec() {
        let arch = MiniArch::new();
        let program = parse_spec(&arch, SPEC).expect("spec parses");
        assert_eq!(program.arch_name.as_deref(), Some("mini32"));

        let decl = program.function_at(0x1000).expect("function declared");
        assert_eq!(decl.params.len(), 2);
        assert_eq!(decl.params[0].name.as_deref(), Some("a"));
        assert_eq!(
            decl.params[1].value.location,
            ValueLocation::Memory {
                base: "sp".into(),
                offset: 8
            }
        );
        assert_eq!(decl.returns.len(), 1);
        assert_eq!(decl.return_stack_pointer, "sp");
        let hints = decl.register_info.get(&4100).expect("hint recorded");
        assert_eq!(hints[0].reg, "r1");
        assert_eq!(hints[0].value, Some(8192));

        assert_eq!(
            program.variable_at(0x4000).map(|v| v.ty.clone()),
            Some(Type::Struct(vec![Type::Int(32), Type::Int(32)]))
        );
        let (byte, availability, perms) = program.query(0x1000);
        assert_eq!(byte, 0x01);
        assert_eq!(availability, ByteAvailability::Available);
        assert_eq!(perms, BytePermission::ReadableExecutable);
        assert_eq!(program.symbols().next(), Some((4096, "main")));
        use crate::providers::ControlFlowProvider;
        assert_eq!(program.redirection(57344), 61440);
    }

    #[test]
    fn rejects_ambiguous_and_missing_locations() {
        let arch = MiniArch::new();
        let both = r#"{"functions": [{
            "address": 1,
            "parameters": [{"type": "i32", "register": "r0",
                            "memory": {"register": "sp", "offset": 0}}],
            "return_address": {"type": "i32", "register": "ra"},
            "return_stack_pointer": {"register": "sp"}
        }]}"#;
        assert!(matches!(
            parse_spec(&arch, both),
            Err(SpecError::Function { .. })
        ));

        let neither = r#"{"functions": [{
            "address": 1,
            "parameters": [{"type": "i32"}],
            "return_address": {"type": "i32", "register": "ra"},
            "return_stack_pointer": {"register": "sp"}
        }]}"#;
        assert!(matches!(
            parse_spec(&arch, neither),
            Err(SpecError::Function { .. })
        ));
    }

    #[test]
    fn rejects_unknown_registers_and_bad_types() {
        let arch = MiniArch::new();
        let bad_reg = r#"{"functions": [{
            "address": 1,
            "parameters": [{"type": "i32", "register": "xmm0"}],
            "return_address": {"type": "i32", "register": "ra"},
            "return_stack_pointer": {"register": "sp"}
        }]}"#;
        assert!(parse_spec(&arch, bad_reg).is_err());

        assert!(parse_type("i").is_err());
        assert!(parse_type("{i32").is_err());
        assert!(parse_type("q8").is_err());
        assert_eq!(parse_type("{i8,p}").unwrap(), Type::Struct(vec![Type::Int(8), Type::Ptr]));
    }

    #[test]
    fn rejects_odd_or_invalid_hex_data() {
        let arch = MiniArch::new();
        let odd = r#"{"memory": [{"address": 0, "data": "abc"}]}"#;
        assert!(matches!(parse_spec(&arch, odd), Err(SpecError::Range { .. })));
        let bad = r#"{"memory": [{"address": 0, "data": "zz"}]}"#;
        assert!(matches!(parse_spec(&arch, bad), Err(SpecError::Range { .. })));
    }
}
