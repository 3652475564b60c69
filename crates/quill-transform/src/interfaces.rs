//! Lambda interface registry
//!
//! Indirect calls through lambda-typed values compile to virtual dispatch
//! on a synthesized interface with a single abstract method `run`. One
//! interface exists per (argument count, has-return) pair, named `FnN` or
//! `FnVoidN`, parameterized over the return type (when present) and the
//! argument types, and living under the `Quill` runtime namespace.

use std::collections::HashMap;

use log::debug;
use quill_hir::{Compilation, SymbolFlags, SymbolKind};
use quill_types::{SymbolId, TypeId};

/// The namespace synthesized interfaces are placed under.
const RUNTIME_NAMESPACE: &str = "Quill";

/// Memoized synthesis of `FnN`/`FnVoidN` interfaces.
pub struct InterfaceRegistry {
    /// `arg_count << 1 | has_return` -> interface symbol
    interfaces: HashMap<u32, SymbolId>,
    namespace: Option<SymbolId>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self {
            interfaces: HashMap::new(),
            namespace: None,
        }
    }

    /// The `Quill` namespace, reusing a user declaration when one exists.
    fn namespace(&mut self, compilation: &mut Compilation) -> SymbolId {
        if let Some(namespace) = self.namespace {
            return namespace;
        }
        let global = compilation.symbols.global();
        let namespace = match compilation.symbols.find_member(global, RUNTIME_NAMESPACE) {
            Some(existing) if compilation.symbols.get(existing).kind.is_object() => existing,
            _ => {
                let namespace =
                    compilation
                        .symbols
                        .new_object(SymbolKind::ObjectNamespace, RUNTIME_NAMESPACE, global);
                compilation.symbols.get_mut(namespace).flags |= SymbolFlags::IS_IMPORTED;
                let ty = compilation.types.symbol_type(namespace);
                compilation.symbols.get_mut(namespace).resolved_type = Some(ty);
                namespace
            }
        };
        self.namespace = Some(namespace);
        namespace
    }

    /// Retrieve or create the interface for an (arity, has-return) pair.
    pub fn interface_for(
        &mut self,
        compilation: &mut Compilation,
        arg_count: usize,
        has_return: bool,
    ) -> SymbolId {
        let key = (arg_count << 1) as u32 | has_return as u32;
        if let Some(&interface) = self.interfaces.get(&key) {
            return interface;
        }
        let namespace = self.namespace(compilation);
        let name = if has_return {
            format!("Fn{}", arg_count)
        } else {
            format!("FnVoid{}", arg_count)
        };
        let interface = match compilation.symbols.find_member(namespace, &name) {
            Some(existing) if compilation.symbols.get(existing).kind == SymbolKind::ObjectInterface => existing,
            _ => create_interface(compilation, namespace, name, arg_count, has_return),
        };
        self.interfaces.insert(key, interface);
        interface
    }

    /// The instantiated interface type for a lambda type.
    pub fn interface_type_for(&mut self, compilation: &mut Compilation, lambda_type: TypeId) -> TypeId {
        let (argument_types, return_type) = {
            let (args, ret) = compilation.types.lambda_signature(lambda_type);
            (args.to_vec(), ret)
        };
        let interface = self.interface_for(compilation, argument_types.len(), return_type.is_some());
        let parameters = compilation.symbols.get(interface).parameters.clone();
        let mut substitutions = Vec::with_capacity(parameters.len());
        if let Some(ret) = return_type {
            substitutions.push(ret);
        }
        substitutions.extend(argument_types);
        let environment = compilation.types.create_environment(&parameters, &substitutions);
        let base = compilation
            .symbols
            .get(interface)
            .resolved_type
            .expect("interface must be typed");
        compilation.types.substitute(base, &environment)
    }

    /// The `run` method dispatched through for a lambda type.
    pub fn run_method_for(&mut self, compilation: &mut Compilation, lambda_type: TypeId) -> SymbolId {
        let (arg_count, has_return) = {
            let (args, ret) = compilation.types.lambda_signature(lambda_type);
            (args.len(), ret.is_some())
        };
        let interface = self.interface_for(compilation, arg_count, has_return);
        compilation
            .symbols
            .find_member(interface, "run")
            .expect("lambda interface is missing its run method")
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn create_interface(
    compilation: &mut Compilation,
    namespace: SymbolId,
    name: String,
    arg_count: usize,
    has_return: bool,
) -> SymbolId {
    debug!("synthesizing lambda interface {}", name);
    let interface = compilation
        .symbols
        .new_object(SymbolKind::ObjectInterface, name, namespace);

    // Parameters: R (when there is a return type), then A1..An.
    let mut parameters = Vec::new();
    if has_return {
        parameters.push(compilation.symbols.new_parameter("R", interface));
    }
    for i in 0..arg_count {
        parameters.push(compilation.symbols.new_parameter(format!("A{}", i + 1), interface));
    }
    let mut parameter_types = Vec::with_capacity(parameters.len());
    for &parameter in &parameters {
        let ty = compilation.types.symbol_type(parameter);
        compilation.symbols.get_mut(parameter).resolved_type = Some(ty);
        parameter_types.push(ty);
    }

    // The interface's declared type is parameterized over its own
    // parameters, so instantiation is a plain substitution.
    let base = compilation.types.symbol_type(interface);
    let self_type = compilation.types.parameterize(base, &parameter_types);
    compilation.symbols.get_mut(interface).resolved_type = Some(self_type);

    // The single abstract method.
    let run = compilation
        .symbols
        .new_function(SymbolKind::FunctionInstance, "run", Some(interface));
    let run_type = compilation.types.symbol_type(run);
    compilation.symbols.get_mut(run).resolved_type = Some(run_type);
    let offset = has_return as usize;
    for i in 0..arg_count {
        let argument = compilation.symbols.new_variable(
            SymbolKind::VariableArgument,
            format!("a{}", i + 1),
            Some(parameter_types[offset + i]),
        );
        compilation.symbols.get_mut(run).arguments.push(argument);
    }
    if has_return {
        compilation.symbols.get_mut(run).return_type = Some(parameter_types[0]);
    }
    interface
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interfaces_are_memoized() {
        let mut compilation = Compilation::new();
        let mut registry = InterfaceRegistry::new();

        let a = registry.interface_for(&mut compilation, 1, true);
        let b = registry.interface_for(&mut compilation, 1, true);
        let c = registry.interface_for(&mut compilation, 1, false);
        let d = registry.interface_for(&mut compilation, 2, true);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        assert_eq!(compilation.symbols.get(a).name, "Fn1");
        assert_eq!(compilation.symbols.get(c).name, "FnVoid1");
        assert_eq!(compilation.symbols.get(d).name, "Fn2");
    }

    #[test]
    fn test_namespace_is_synthesized_once() {
        let mut compilation = Compilation::new();
        let mut registry = InterfaceRegistry::new();

        registry.interface_for(&mut compilation, 0, false);
        registry.interface_for(&mut compilation, 3, true);

        let global = compilation.symbols.global();
        let namespace = compilation
            .symbols
            .find_member(global, "Quill")
            .expect("runtime namespace should exist");
        let symbol = compilation.symbols.get(namespace);
        assert_eq!(symbol.kind, SymbolKind::ObjectNamespace);
        assert!(symbol.flags.contains(SymbolFlags::IS_IMPORTED));
        assert_eq!(symbol.members.len(), 2);
    }

    #[test]
    fn test_user_namespace_is_reused() {
        let mut compilation = Compilation::new();
        let global = compilation.symbols.global();
        let user = compilation
            .symbols
            .new_object(SymbolKind::ObjectNamespace, "Quill", global);

        let mut registry = InterfaceRegistry::new();
        let interface = registry.interface_for(&mut compilation, 1, true);
        assert_eq!(compilation.symbols.get(interface).parent, Some(user));
        assert!(!compilation.symbols.get(user).flags.contains(SymbolFlags::IS_IMPORTED));
    }

    #[test]
    fn test_instantiation_substitutes_parameters() {
        let mut compilation = Compilation::new();
        let mut registry = InterfaceRegistry::new();

        let global = compilation.symbols.global();
        let int_class = compilation.symbols.new_object(SymbolKind::ObjectClass, "int", global);
        let int_ty = compilation.types.symbol_type(int_class);
        let string_class = compilation.symbols.new_object(SymbolKind::ObjectClass, "string", global);
        let string_ty = compilation.types.symbol_type(string_class);

        let lambda_ty = compilation.types.lambda_type(vec![string_ty], Some(int_ty));
        let instance = registry.interface_type_for(&mut compilation, lambda_ty);

        let interface = registry.interface_for(&mut compilation, 1, true);
        assert_eq!(compilation.types.symbol_of(instance), Some(interface));
        assert_eq!(compilation.types.type_args_of(instance), &[int_ty, string_ty]);

        // The same lambda type instantiates to the same interface type.
        let again = registry.interface_type_for(&mut compilation, lambda_ty);
        assert_eq!(instance, again);

        // The run method has the declared shape.
        let run = registry.run_method_for(&mut compilation, lambda_ty);
        let run_symbol = compilation.symbols.get(run);
        assert_eq!(run_symbol.name, "run");
        assert_eq!(run_symbol.arguments.len(), 1);
        assert!(run_symbol.value.is_none());
    }
}
