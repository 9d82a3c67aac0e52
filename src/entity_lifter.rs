//! Deduplicates lifts and copies finished bodies into the target module.
//!
//! The entity lifter remembers which functions and variables already exist
//! at each native address of its target module. Lifting an address that
//! already has an entity of the same type refreshes that entity's body in
//! place, preserving any name a user gave it. Callees discovered inside a
//! freshly copied body are registered at their own addresses, so later
//! lifts and declarations find them.

use std::rc::Rc;

use crate::containers::unordered::UnorderedMap;
use crate::function_lifter::FunctionLifter;
use crate::ir::{FuncId, GlobalId, Inst, Module};
use crate::log::*;
use crate::options::LifterOptions;
use crate::program::{FunctionDecl, GlobalVarDecl};
use crate::providers::{MemoryProvider, TypeProvider};

/// Something emitted into the target module at a native address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Entity {
    Func(FuncId),
    Var(GlobalId),
}

/// Owns a function lifter and the module lifted entities are copied into.
pub struct EntityLifter {
    function_lifter: FunctionLifter,
    target: Module,
    addr_to_entities: UnorderedMap<u64, Vec<Entity>>,
}

impl EntityLifter {
    pub fn new(
        options: LifterOptions,
        memory_provider: Rc<dyn MemoryProvider>,
        type_provider: Rc<dyn TypeProvider>,
    ) -> Self {
        Self {
            function_lifter: FunctionLifter::new(options, memory_provider, type_provider),
            target: Module::new("lifted_code"),
            addr_to_entities: UnorderedMap::default(),
        }
    }

    /// The module all finished entities live in.
    pub fn module(&self) -> &Module {
        &self.target
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.target
    }

    pub fn into_module(self) -> Module {
        self.target
    }

    pub fn function_lifter(&self) -> &FunctionLifter {
        &self.function_lifter
    }

    fn add_entity(&mut self, entity: Entity, address: u64) {
        let entities = self.addr_to_entities.entry(address).or_default();
        if !entities.contains(&entity) {
            entities.push(entity);
        }
    }

    /// Functions already present at `address`: the first with a matching
    /// type, and (failing that) the first with any other type.
    fn find_existing(&self, decl: &FunctionDecl) -> (Option<FuncId>, Option<FuncId>) {
        let ty = decl.func_type();
        let mut found_by_type = None;
        let mut found_by_address = None;
        if let Some(entities) = self.addr_to_entities.get(&decl.address) {
            for entity in entities {
                if let Entity::Func(f) = entity {
                    if self.target.func(*f).ty == ty {
                        if found_by_type.is_none() {
                            found_by_type = Some(*f);
                        }
                    } else if found_by_address.is_none() {
                        found_by_address = Some(*f);
                    }
                }
            }
        }
        (found_by_type, found_by_address)
    }

    /// Lift the function at `decl.address` into the target module.
    ///
    /// Returns `None` only when lifting fails outright and no same-typed
    /// entity already existed. A pre-existing entity of the same type is
    /// returned on failure, and refreshed (keeping its name) on success.
    pub fn lift_entity(&mut self, decl: &FunctionDecl) -> Option<FuncId> {
        let (found_by_type, found_by_address) = self.find_existing(decl);
        if let Some(other) = found_by_address {
            error!(
                "Ignoring existing version of function with a different type";
                "address" => format!("{:#x}", decl.address),
                "existing" => %self.target.func(other).name,
            );
        }

        let Some(func) = self.function_lifter.lift_function(decl) else {
            return found_by_type;
        };

        // If the pre-existing function was renamed by a user, adopt the
        // generated name for the copy-in, then restore the user's name.
        let new_name = self
            .function_lifter
            .semantics_module()
            .func(func)
            .name
            .clone();
        let mut user_name = None;
        if let Some(existing) = found_by_type {
            let existing_name = self.target.func(existing).name.clone();
            if existing_name != new_name {
                user_name = Some(existing_name);
                self.target.set_func_name(existing, &new_name);
            }
        }

        let in_target = self
            .target
            .import_function(self.function_lifter.semantics_module(), func);

        if let Some(existing) = found_by_type {
            assert_eq!(in_target, existing);
        }
        if let Some(name) = user_name {
            self.target.set_func_name(in_target, &name);
        }
        self.add_entity(Entity::Func(in_target), decl.address);

        // The body may call other declared functions; register them at
        // their addresses too.
        let mut callees: Vec<(String, u64)> = Vec::new();
        {
            let src = self.function_lifter.semantics_module();
            if let Some(body) = &src.func(func).body {
                for (_, inst) in body.insts.iter() {
                    if let Inst::Call { callee, .. } = inst {
                        let name = &src.func(*callee).name;
                        if let Some(addr) = self.function_lifter.address_of_named_function(name) {
                            callees.push((name.clone(), addr));
                        }
                    }
                }
            }
        }
        for (name, addr) in callees {
            if let Some(f) = self.target.function_named(&name) {
                self.add_entity(Entity::Func(f), addr);
            }
        }

        // The semantics-module copy has served its purpose; keep the
        // declaration around for future lifts.
        self.function_lifter.semantics_module_mut().erase_body(func);

        Some(in_target)
    }

    /// Declare (without decoding any bytes) the function described by
    /// `decl` in the target module.
    pub fn declare_entity(&mut self, decl: &FunctionDecl) -> Option<FuncId> {
        let (found_by_type, found_by_address) = self.find_existing(decl);
        if let Some(f) = found_by_type {
            return Some(f);
        }
        if let Some(other) = found_by_address {
            error!(
                "Ignoring existing version of function with a different type";
                "address" => format!("{:#x}", decl.address),
                "existing" => %self.target.func(other).name,
            );
        }
        let func = self.function_lifter.declare_function(decl)?;
        let in_target = self
            .target
            .import_function(self.function_lifter.semantics_module(), func);
        self.add_entity(Entity::Func(in_target), decl.address);
        Some(in_target)
    }

    /// Declare a global variable in the target module.
    pub fn declare_variable(&mut self, decl: &GlobalVarDecl) -> GlobalId {
        if let Some(entities) = self.addr_to_entities.get(&decl.address) {
            for entity in entities {
                if let Entity::Var(g) = entity {
                    if self.target.global(*g).ty == decl.ty {
                        return *g;
                    }
                }
            }
        }
        let g = self.target.declare_global(&decl.lifted_name(), decl.ty.clone());
        self.add_entity(Entity::Var(g), decl.address);
        g
    }
}
