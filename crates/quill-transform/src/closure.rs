//! Closure conversion pass
//!
//! Lowers first-class lambdas into first-order objects:
//! 1. Every lambda literal becomes a class with a single instance method
//!    `run`, implementing the `FnN`/`FnVoidN` interface for its signature,
//!    and the lambda expression becomes a constructor call of that class.
//! 2. Every scope whose bindings are captured across a lambda boundary is
//!    reified as a heap-allocated environment class with one instance
//!    field per captured binding. Environments hold references to parent
//!    environments ("copies"), so a deeply nested lambda reaches an outer
//!    capture in a constant number of member accesses instead of walking a
//!    frame chain at runtime.
//! 3. Every call through a lambda-typed value becomes virtual dispatch on
//!    the interface method `run`.
//!
//! The pass runs in three phases over one global HIR: a scan that builds
//! the scope tree and records definitions, uses, and call sites; the
//! lambda rewrite; and the call rewrite. It consumes a fully resolved,
//! fully typed `Compilation` and mutates it in place. Invariant
//! violations are compiler bugs and abort via assertion.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use quill_hir::{names, Ast, BinaryOp, Compilation, NodeKind, SymbolKind};
use quill_types::{NodeId, SymbolId};

use crate::interfaces::InterfaceRegistry;

/// Convert every closure in the compilation to explicit objects.
pub fn convert_closures(compilation: &mut Compilation) {
    let mut converter = ClosureConverter::new();
    converter.scan(compilation);
    debug!(
        "closure conversion: {} scopes, {} call sites",
        converter.scopes.len(),
        converter.calls.len()
    );
    converter.convert_lambdas(compilation);
    converter.convert_calls(compilation);
}

/// The kind of a scanned scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    /// A function body (including the body of a lambda).
    Function,
    /// A lambda expression. The lambda object itself acts as the scope's
    /// environment; its nested `Function` scope owns the lambda's locals
    /// and arguments.
    Lambda,
    /// A loop body; gets a fresh environment per iteration when captured.
    Loop,
}

/// Index of a scope in the pre-order scope list.
type ScopeIndex = usize;

/// A binding visible in a scope.
#[derive(Debug)]
struct Definition {
    symbol: SymbolId,
    /// The declaring `Variable` node, or `None` for synthetic bindings
    /// (arguments, `this`, loop variables).
    node: Option<NodeId>,
    is_captured: bool,
    /// The environment field that stores this binding once captured.
    member: Option<SymbolId>,
}

/// Where a definition lives: (owning scope, index in its definition list).
#[derive(Debug, Clone, Copy)]
struct DefinitionRef {
    scope: ScopeIndex,
    index: usize,
}

/// A reference to a definition from a `Name` node.
#[derive(Debug, Clone, Copy)]
struct Use {
    definition: DefinitionRef,
    node: NodeId,
}

/// An obligation for a scope's environment to hold a reference to an
/// ancestor scope's environment.
#[derive(Debug)]
struct EnvCopy {
    scope: ScopeIndex,
    member: Option<SymbolId>,
}

/// One node in the scope tree, stored flat in pre-order.
struct Scope {
    kind: ScopeKind,
    /// The node that introduces the scope: the body block for `Function`,
    /// the lambda expression for `Lambda`, the loop statement for `Loop`.
    node: NodeId,
    /// The function whose body this scope sits in.
    enclosing_function: SymbolId,
    /// Rewritten during conversion so that chains only visit scopes with
    /// environments.
    parent: Option<ScopeIndex>,
    has_captured_definitions: bool,
    has_capturing_uses: bool,
    environment_object: Option<SymbolId>,
    environment_constructor: Option<SymbolId>,
    /// The local holding the environment instance; for lambda scopes this
    /// is the `run` method's receiver.
    environment_variable: Option<SymbolId>,
    environment_constructor_call: Option<NodeId>,
    definitions: Vec<Definition>,
    uses: Vec<Use>,
    copies: Vec<EnvCopy>,
    definition_lookup: HashMap<SymbolId, usize>,
    copy_lookup: HashMap<ScopeIndex, usize>,
}

impl Scope {
    fn new(kind: ScopeKind, node: NodeId, enclosing_function: SymbolId, parent: Option<ScopeIndex>) -> Self {
        Self {
            kind,
            node,
            enclosing_function,
            parent,
            has_captured_definitions: false,
            has_capturing_uses: false,
            environment_object: None,
            environment_constructor: None,
            environment_variable: None,
            environment_constructor_call: None,
            definitions: Vec::new(),
            uses: Vec::new(),
            copies: Vec::new(),
            definition_lookup: HashMap::new(),
            copy_lookup: HashMap::new(),
        }
    }
}

struct ClosureConverter {
    /// All scopes in the exact pre-order the scan pushed them; every later
    /// sweep iterates this order.
    scopes: Vec<Scope>,
    /// Stack of active scopes during the scan.
    stack: Vec<ScopeIndex>,
    /// Every call site, for the call rewrite phase.
    calls: Vec<NodeId>,
    interfaces: InterfaceRegistry,
    /// Names already taken inside each function, for generating locals.
    local_names: HashMap<SymbolId, HashSet<String>>,
}

impl ClosureConverter {
    fn new() -> Self {
        Self {
            scopes: Vec::new(),
            stack: Vec::new(),
            calls: Vec::new(),
            interfaces: InterfaceRegistry::new(),
            local_names: HashMap::new(),
        }
    }

    // Phase 1: scan

    fn scan(&mut self, compilation: &Compilation) {
        self.visit_object(compilation, compilation.symbols.global());
        assert!(self.stack.is_empty());
    }

    fn visit_object(&mut self, compilation: &Compilation, object: SymbolId) {
        for index in 0..compilation.symbols.get(object).members.len() {
            let member = compilation.symbols.get(object).members[index];
            let kind = compilation.symbols.get(member).kind;
            if kind.is_object() {
                self.visit_object(compilation, member);
            } else if kind.is_function() {
                self.visit_function(compilation, member);
            }
        }
    }

    fn visit_function(&mut self, compilation: &Compilation, function: SymbolId) {
        let symbol = compilation.symbols.get(function);
        let Some(body) = symbol.value else {
            return;
        };
        self.push_scope(ScopeKind::Function, body, function);
        if let Some(this) = symbol.this {
            self.record_definition(this, None);
        }
        for index in 0..compilation.symbols.get(function).arguments.len() {
            let argument = compilation.symbols.get(function).arguments[index];
            self.record_definition(argument, None);
        }
        self.visit(compilation, body);
        self.pop_scope();
    }

    fn visit(&mut self, compilation: &Compilation, node: NodeId) {
        let ast = &compilation.ast;
        match ast.kind(node) {
            NodeKind::Lambda => {
                // A lambda pushes two scopes: the lambda scope, whose
                // environment is the lambda object itself, and a function
                // scope for the body. Arguments belong to the function
                // scope, so a captured argument lands in an environment
                // allocated per invocation, not per lambda object.
                let function = ast.get(node).symbol.expect("lambda node must carry its function");
                self.push_scope(ScopeKind::Lambda, node, self.current_function());
                let body = compilation
                    .symbols
                    .get(function)
                    .value
                    .expect("lambda function must have a body");
                self.push_scope(ScopeKind::Function, body, function);
                for index in 0..compilation.symbols.get(function).arguments.len() {
                    let argument = compilation.symbols.get(function).arguments[index];
                    self.record_definition(argument, None);
                }
                self.visit(compilation, body);
                self.pop_scope();
                self.pop_scope();
            }
            NodeKind::Foreach => {
                // The iterated value stays outside the loop scope so that
                // hoisting it can never capture the loop variable.
                self.visit(compilation, ast.child(node, 0));
                self.push_scope(ScopeKind::Loop, node, self.current_function());
                let variable = ast.get(node).symbol.expect("foreach must carry its loop variable");
                self.record_definition(variable, None);
                self.visit(compilation, ast.child(node, 1));
                self.pop_scope();
            }
            NodeKind::For | NodeKind::While => {
                self.push_scope(ScopeKind::Loop, node, self.current_function());
                for index in 0..ast.children(node).len() {
                    self.visit(compilation, ast.child(node, index));
                }
                self.pop_scope();
            }
            NodeKind::Variable => {
                let symbol = ast.get(node).symbol.expect("variable node must carry its symbol");
                self.record_definition(symbol, Some(node));
                for index in 0..ast.children(node).len() {
                    self.visit(compilation, ast.child(node, index));
                }
            }
            NodeKind::Catch => {
                // Catch-bound names resolve like surrounding locals.
                // Capturing one across a lambda boundary is unsupported
                // and trips the rewrite assertion.
                if let Some(symbol) = ast.get(node).symbol {
                    self.record_definition(symbol, Some(node));
                }
                for index in 0..ast.children(node).len() {
                    self.visit(compilation, ast.child(node, index));
                }
            }
            NodeKind::Call => {
                self.calls.push(node);
                for index in 0..ast.children(node).len() {
                    self.visit(compilation, ast.child(node, index));
                }
            }
            NodeKind::Name => {
                let Some(symbol) = ast.get(node).symbol else {
                    return;
                };
                if compilation.symbols.get(symbol).kind.is_local_or_argument() {
                    self.record_use(symbol, node);
                }
            }
            _ => {
                for index in 0..ast.children(node).len() {
                    self.visit(compilation, ast.child(node, index));
                }
            }
        }
    }

    fn push_scope(&mut self, kind: ScopeKind, node: NodeId, enclosing_function: SymbolId) -> ScopeIndex {
        let index = self.scopes.len();
        let parent = self.stack.last().copied();
        self.scopes.push(Scope::new(kind, node, enclosing_function, parent));
        self.stack.push(index);
        index
    }

    fn pop_scope(&mut self) {
        self.stack.pop().expect("scope stack underflow");
    }

    fn current_scope(&self) -> ScopeIndex {
        *self.stack.last().expect("no active scope")
    }

    fn current_function(&self) -> SymbolId {
        self.scopes[self.current_scope()].enclosing_function
    }

    fn record_definition(&mut self, symbol: SymbolId, node: Option<NodeId>) {
        let current = self.current_scope();
        let scope = &mut self.scopes[current];
        let index = scope.definitions.len();
        let previous = scope.definition_lookup.insert(symbol, index);
        assert!(previous.is_none(), "symbol {} defined twice in one scope", symbol);
        scope.definitions.push(Definition {
            symbol,
            node,
            is_captured: false,
            member: None,
        });
    }

    /// Resolve a name against the active scope stack and record the use.
    /// Crossing a lambda scope on the way to the defining scope marks the
    /// definition as captured.
    fn record_use(&mut self, symbol: SymbolId, node: NodeId) {
        let using = self.current_scope();
        let mut is_captured = false;
        let mut current = Some(using);
        while let Some(index) = current {
            if let Some(&definition_index) = self.scopes[index].definition_lookup.get(&symbol) {
                self.scopes[using].uses.push(Use {
                    definition: DefinitionRef {
                        scope: index,
                        index: definition_index,
                    },
                    node,
                });
                if is_captured {
                    self.scopes[index].definitions[definition_index].is_captured = true;
                    self.scopes[index].has_captured_definitions = true;
                    self.scopes[using].has_capturing_uses = true;
                }
                return;
            }
            if self.scopes[index].kind == ScopeKind::Lambda {
                is_captured = true;
            }
            current = self.scopes[index].parent;
        }
        // The symbol belongs to a function that isn't on the stack;
        // nothing to record.
    }

    // Phase 2: convert lambdas

    fn convert_lambdas(&mut self, compilation: &mut Compilation) {
        self.propagate_copies();

        // Environments are synthesized in pre-order, and each scope's
        // parent chain is collapsed right after, so any ancestor a later
        // scope needs an environment from already has one.
        for index in 0..self.scopes.len() {
            let scope = &self.scopes[index];
            if scope.has_captured_definitions || scope.kind == ScopeKind::Lambda {
                self.create_environment(compilation, index);
                self.collapse_parent(index);
            }
        }
        for index in 0..self.scopes.len() {
            if self.scopes[index].environment_object.is_some() {
                self.wire_copies(compilation, index);
            }
        }
        for index in 0..self.scopes.len() {
            if self.scopes[index].has_captured_definitions {
                self.rewrite_definitions(compilation, index);
            }
        }
        for index in 0..self.scopes.len() {
            self.rewrite_uses(compilation, index);
        }
    }

    /// Make sure every scope between a capturing use and the defining
    /// scope (exclusive) has a copy entry for the defining scope. The
    /// defining scope itself is reached by direct variable reference.
    fn propagate_copies(&mut self) {
        for index in 0..self.scopes.len() {
            if !self.scopes[index].has_capturing_uses {
                continue;
            }
            let definitions: Vec<DefinitionRef> =
                self.scopes[index].uses.iter().map(|u| u.definition).collect();
            for definition in definitions {
                if !self.scopes[definition.scope].definitions[definition.index].is_captured {
                    continue;
                }
                let target = definition.scope;
                let mut current = index;
                while current != target {
                    let scope = &mut self.scopes[current];
                    if !scope.copy_lookup.contains_key(&target) {
                        scope.copy_lookup.insert(target, scope.copies.len());
                        scope.copies.push(EnvCopy {
                            scope: target,
                            member: None,
                        });
                    }
                    current = self.scopes[current]
                        .parent
                        .expect("defining scope must be an ancestor of the use");
                }
            }
        }
    }

    /// Synthesize the environment class for a scope and splice it into
    /// the AST.
    fn create_environment(&mut self, compilation: &mut Compilation, index: ScopeIndex) {
        let kind = self.scopes[index].kind;
        assert!(
            kind != ScopeKind::Lambda || !self.scopes[index].has_captured_definitions,
            "a lambda scope must not own captured definitions"
        );

        let base_name = self.environment_name(compilation, index);
        let global = compilation.symbols.global();
        let class_name = compilation.symbols.generate_name(global, &base_name);
        trace!("environment {} for scope {}", class_name, index);

        let class = compilation
            .symbols
            .new_object(SymbolKind::ObjectClass, class_name, global);
        let class_type = compilation.types.symbol_type(class);
        compilation.symbols.get_mut(class).resolved_type = Some(class_type);

        // The constructor starts with an empty body; copy wiring adds one
        // argument and one assignment per parent-environment reference.
        let constructor = compilation
            .symbols
            .new_function(SymbolKind::FunctionConstructor, "new", Some(class));
        let constructor_type = compilation.types.symbol_type(constructor);
        let constructor_body = compilation.ast.create_block();
        let constructor_this =
            compilation
                .symbols
                .new_variable(SymbolKind::VariableLocal, "self", Some(class_type));
        {
            let symbol = compilation.symbols.get_mut(constructor);
            symbol.resolved_type = Some(constructor_type);
            symbol.return_type = Some(class_type);
            symbol.value = Some(constructor_body);
            symbol.this = Some(constructor_this);
        }

        let callee = compilation.symbol_reference(constructor);
        let constructor_call = compilation.ast.create_call(callee);
        compilation.ast.with_type(constructor_call, class_type);

        // One instance field per captured definition of this scope.
        for definition_index in 0..self.scopes[index].definitions.len() {
            if !self.scopes[index].definitions[definition_index].is_captured {
                continue;
            }
            let symbol = self.scopes[index].definitions[definition_index].symbol;
            let (symbol_name, symbol_type) = {
                let s = compilation.symbols.get(symbol);
                (s.name.clone(), s.resolved_type)
            };
            let member_name = compilation.symbols.generate_name(class, &symbol_name);
            let member =
                compilation
                    .symbols
                    .new_variable(SymbolKind::VariableInstance, member_name, symbol_type);
            compilation.symbols.append_member(class, member);
            self.scopes[index].definitions[definition_index].member = Some(member);
        }

        self.scopes[index].environment_object = Some(class);
        self.scopes[index].environment_constructor = Some(constructor);

        match kind {
            ScopeKind::Function => {
                let body = self.scopes[index].node;
                self.splice_environment(compilation, index, body, constructor_call);
            }
            ScopeKind::Loop => {
                // Prepending into the loop body allocates a fresh
                // environment per iteration.
                let loop_node = self.scopes[index].node;
                let body = *compilation
                    .ast
                    .children(loop_node)
                    .last()
                    .expect("loop must have a body block");
                self.splice_environment(compilation, index, body, constructor_call);
            }
            ScopeKind::Lambda => {
                let lambda_node = self.scopes[index].node;
                let lambda_type = compilation
                    .ast
                    .get(lambda_node)
                    .resolved_type
                    .expect("lambda node must be typed");
                let interface_type = self.interfaces.interface_type_for(compilation, lambda_type);
                compilation.symbols.get_mut(class).implements.push(interface_type);

                // The lambda's function becomes the instance method `run`.
                let function = compilation
                    .ast
                    .get(lambda_node)
                    .symbol
                    .expect("lambda node must carry its function");
                {
                    let symbol = compilation.symbols.get_mut(function);
                    symbol.kind = SymbolKind::FunctionInstance;
                    symbol.name = "run".to_string();
                }
                compilation.symbols.append_member(class, function);
                let run_this =
                    compilation
                        .symbols
                        .new_variable(SymbolKind::VariableLocal, "self", Some(class_type));
                compilation.symbols.get_mut(function).this = Some(run_this);
                self.scopes[index].environment_variable = Some(run_this);

                // The lambda expression's value is now the lambda object.
                compilation.ast.become_node(lambda_node, constructor_call);
                self.scopes[index].environment_constructor_call = Some(lambda_node);
            }
        }
    }

    /// Declare the environment local at the top of `body` and prefill
    /// captured synthetic bindings (arguments, `this`, loop variables) in
    /// source order.
    fn splice_environment(
        &mut self,
        compilation: &mut Compilation,
        index: ScopeIndex,
        body: NodeId,
        constructor_call: NodeId,
    ) {
        let class_type = compilation
            .ast
            .get(constructor_call)
            .resolved_type
            .expect("constructor call must be typed");
        let function = self.scopes[index].enclosing_function;
        let env_name = self.generate_local_name(compilation, function, "env");
        let env_var = compilation
            .symbols
            .new_variable(SymbolKind::VariableLocal, env_name, Some(class_type));
        compilation.symbols.get_mut(env_var).value = Some(constructor_call);

        let variable = compilation.ast.create_variable(env_var);
        compilation.ast.append_child(variable, constructor_call);
        let variables = compilation.ast.create_variables();
        compilation.ast.append_child(variables, variable);
        compilation.ast.prepend_child(body, variables);

        self.scopes[index].environment_variable = Some(env_var);
        self.scopes[index].environment_constructor_call = Some(constructor_call);

        let mut anchor = variables;
        for definition_index in 0..self.scopes[index].definitions.len() {
            let definition = &self.scopes[index].definitions[definition_index];
            if !definition.is_captured || definition.node.is_some() {
                continue;
            }
            let member = definition.member.expect("captured definition must have a member");
            let symbol = definition.symbol;
            let env_ref = compilation.symbol_reference(env_var);
            let target = compilation.member_reference(env_ref, member);
            let value = compilation.symbol_reference(symbol);
            let assign = compilation.ast.create_binary(BinaryOp::Assign, target, value);
            if let Some(ty) = compilation.symbols.get(member).resolved_type {
                compilation.ast.with_type(assign, ty);
            }
            let statement = compilation.ast.create_expression(assign);
            compilation.ast.insert_child_after(body, anchor, statement);
            anchor = statement;
        }
    }

    /// Skip parents without environments. Scopes are processed in
    /// pre-order, so every ancestor that needs an environment already has
    /// one by the time its descendants collapse.
    fn collapse_parent(&mut self, index: ScopeIndex) {
        while let Some(parent) = self.scopes[index].parent {
            if self.scopes[parent].environment_object.is_some() {
                break;
            }
            self.scopes[index].parent = self.scopes[parent].parent;
        }
    }

    /// Materialize the copy entries of a scope: an instance field and a
    /// constructor argument per referenced parent environment, plus the
    /// matching constructor-call argument. Argument order follows the
    /// copy list, which fixes the constructor ABI.
    fn wire_copies(&mut self, compilation: &mut Compilation, index: ScopeIndex) {
        if self.scopes[index].copies.is_empty() {
            return;
        }
        let class = self.scopes[index].environment_object.expect("environment must exist");
        let constructor = self.scopes[index]
            .environment_constructor
            .expect("environment constructor must exist");
        let constructor_body = compilation
            .symbols
            .get(constructor)
            .value
            .expect("constructor must have a body");
        let constructor_this = compilation
            .symbols
            .get(constructor)
            .this
            .expect("constructor must have a receiver");
        let call = self.scopes[index]
            .environment_constructor_call
            .expect("environment constructor call must exist");
        let parent = self.scopes[index]
            .parent
            .expect("a scope with copies must have a parent environment");

        for copy_index in 0..self.scopes[index].copies.len() {
            let target = self.scopes[index].copies[copy_index].scope;
            let target_class = self.scopes[target]
                .environment_object
                .expect("copy target must have an environment");
            let target_type = compilation
                .symbols
                .get(target_class)
                .resolved_type
                .expect("environment class must be typed");

            let base = if self.scopes[target].kind == ScopeKind::Lambda {
                "lambda"
            } else {
                "env"
            };
            let member_name = compilation.symbols.generate_name(class, base);
            let member = compilation.symbols.new_variable(
                SymbolKind::VariableInstance,
                member_name.clone(),
                Some(target_type),
            );
            compilation.symbols.append_member(class, member);
            self.scopes[index].copies[copy_index].member = Some(member);

            let argument = compilation.symbols.new_variable(
                SymbolKind::VariableArgument,
                member_name,
                Some(target_type),
            );
            compilation.symbols.get_mut(constructor).arguments.push(argument);

            let this_ref = compilation.symbol_reference(constructor_this);
            let lhs = compilation.member_reference(this_ref, member);
            let rhs = compilation.symbol_reference(argument);
            let assign = compilation.ast.create_binary(BinaryOp::Assign, lhs, rhs);
            compilation.ast.with_type(assign, target_type);
            let statement = compilation.ast.create_expression(assign);
            compilation.ast.append_child(constructor_body, statement);

            let reference = self.reference_to_scope(compilation, parent, target);
            compilation.ast.append_child(call, reference);
        }
    }

    /// Build an expression that evaluates to `target`'s environment,
    /// starting the lookup at `from`. After parent collapsing this is at
    /// most one member access on the nearest environment variable.
    fn reference_to_scope(&self, compilation: &mut Compilation, from: ScopeIndex, target: ScopeIndex) -> NodeId {
        let mut current = from;
        loop {
            let scope = &self.scopes[current];
            if scope.environment_object.is_some() {
                let variable = scope
                    .environment_variable
                    .expect("environment variable must exist");
                let reference = compilation.symbol_reference(variable);
                if current == target {
                    return reference;
                }
                let copy_index = *scope
                    .copy_lookup
                    .get(&target)
                    .expect("an environment on the path must copy the target");
                let member = scope.copies[copy_index]
                    .member
                    .expect("copy member must be materialized");
                return compilation.member_reference(reference, member);
            }
            current = scope
                .parent
                .expect("walked past the root looking for an environment");
        }
    }

    /// Turn captured variable declarations into assignments onto the
    /// scope's environment.
    fn rewrite_definitions(&mut self, compilation: &mut Compilation, index: ScopeIndex) {
        for definition_index in 0..self.scopes[index].definitions.len() {
            let (is_captured, node, member) = {
                let definition = &self.scopes[index].definitions[definition_index];
                (definition.is_captured, definition.node, definition.member)
            };
            if !is_captured {
                continue;
            }
            // Synthetic bindings were prefilled when the environment was
            // spliced in.
            let Some(node) = node else {
                continue;
            };
            assert_eq!(
                compilation.ast.kind(node),
                NodeKind::Variable,
                "captured definition must be a variable declaration"
            );
            let variables = compilation
                .ast
                .parent(node)
                .expect("variable declaration must have a parent");
            assert_eq!(
                compilation.ast.kind(variables),
                NodeKind::Variables,
                "captured variable must sit in a variables group"
            );
            let member = member.expect("captured definition must have a member");

            let initializer = compilation.ast.children(node).first().copied();
            let statement = initializer.map(|value| {
                compilation.ast.remove(value);
                let env_ref = self.reference_to_scope(compilation, index, index);
                let lhs = compilation.member_reference(env_ref, member);
                let assign = compilation.ast.create_binary(BinaryOp::Assign, lhs, value);
                if let Some(ty) = compilation.symbols.get(member).resolved_type {
                    compilation.ast.with_type(assign, ty);
                }
                compilation.ast.create_expression(assign)
            });

            if compilation.ast.children(variables).len() == 1 {
                match statement {
                    Some(statement) => compilation.ast.replace_with(variables, statement),
                    None => compilation.ast.remove(variables),
                }
                continue;
            }

            // The group keeps its other declarations; the assignment must
            // run exactly where the extracted declaration did, so the
            // later declarations move into their own group behind it.
            let block = compilation
                .ast
                .parent(variables)
                .expect("variables group must have a parent");
            let position = compilation
                .ast
                .children(variables)
                .iter()
                .position(|&child| child == node)
                .expect("declaration must sit in its group");
            compilation.ast.extract_variable_from_variables(variables, node);
            let Some(statement) = statement else {
                continue;
            };
            let trailing = compilation.ast.children(variables)[position..].to_vec();
            if position == 0 {
                compilation.ast.insert_child_before(block, variables, statement);
            } else {
                compilation.ast.insert_child_after(block, variables, statement);
                if !trailing.is_empty() {
                    let rest = compilation.ast.create_variables();
                    for declaration in trailing {
                        compilation.ast.remove(declaration);
                        compilation.ast.append_child(rest, declaration);
                    }
                    compilation.ast.insert_child_after(block, statement, rest);
                }
            }
        }
    }

    /// Overwrite captured `Name` uses with member accesses on the right
    /// environment. The node identity is preserved so enclosing
    /// expressions keep pointing at the rewritten node.
    fn rewrite_uses(&mut self, compilation: &mut Compilation, index: ScopeIndex) {
        for use_index in 0..self.scopes[index].uses.len() {
            let Use { definition, node } = self.scopes[index].uses[use_index];
            let (is_captured, member) = {
                let d = &self.scopes[definition.scope].definitions[definition.index];
                (d.is_captured, d.member)
            };
            if !is_captured {
                continue;
            }
            let member = member.expect("captured definition must have a member");
            let member_type = compilation.symbols.get(member).resolved_type;
            let value = self.reference_to_scope(compilation, index, definition.scope);
            let access = compilation.ast.create_member_reference(value, member);
            compilation.ast.become_node(node, access);
            if let Some(ty) = member_type {
                compilation.ast.with_type(node, ty);
            }
        }
    }

    // Phase 3: convert calls

    /// Route every call through a lambda-typed value into virtual
    /// dispatch on the interface's `run` method.
    fn convert_calls(&mut self, compilation: &mut Compilation) {
        for call_index in 0..self.calls.len() {
            let call = self.calls[call_index];
            let callee = compilation.ast.child(call, 0);
            let Some(callee_type) = compilation.ast.get(callee).resolved_type else {
                continue;
            };
            if !compilation.types.is_lambda(callee_type) {
                continue;
            }
            let run = self.interfaces.run_method_for(compilation, callee_type);
            // Detach the callee through a placeholder so the subtree is
            // never orphaned while the member access is built around it.
            let placeholder = compilation.ast.create_null();
            compilation.ast.replace_with(callee, placeholder);
            let access = compilation.member_reference(callee, run);
            compilation.ast.replace_with(placeholder, access);
        }
    }

    // Naming

    /// Compose the environment class name from the enclosing function
    /// chain of the scope's root, e.g. `CounterStepEnv` for a scope in
    /// method `step` of class `Counter`.
    fn environment_name(&self, compilation: &Compilation, index: ScopeIndex) -> String {
        let mut root = index;
        while let Some(parent) = self.scopes[root].parent {
            root = parent;
        }
        let mut name = match self.scopes[index].kind {
            ScopeKind::Lambda => "Lambda".to_string(),
            _ => "Env".to_string(),
        };
        let mut symbol = Some(self.scopes[root].enclosing_function);
        while let Some(id) = symbol {
            if id == compilation.symbols.global() {
                break;
            }
            let s = compilation.symbols.get(id);
            if !names::is_invalid_identifier(&s.name) {
                name = format!("{}{}", names::capitalize(&s.name), name);
            }
            symbol = s.parent;
        }
        name
    }

    /// Pick a local name based on `prefix` that nothing in `function`
    /// uses yet.
    fn generate_local_name(&mut self, compilation: &Compilation, function: SymbolId, prefix: &str) -> String {
        if !self.local_names.contains_key(&function) {
            let taken = collect_local_names(compilation, function);
            self.local_names.insert(function, taken);
        }
        let taken = self.local_names.get_mut(&function).expect("just inserted");
        let name = if !taken.contains(prefix) {
            prefix.to_string()
        } else {
            let mut counter = 2;
            loop {
                let candidate = format!("{}{}", prefix, counter);
                if !taken.contains(&candidate) {
                    break candidate;
                }
                counter += 1;
            }
        };
        taken.insert(name.clone());
        name
    }
}

/// Every name already bound inside a function: arguments, the receiver,
/// and declared locals. Lambda bodies are separate functions and are not
/// walked into (their body hangs off their own function symbol).
fn collect_local_names(compilation: &Compilation, function: SymbolId) -> HashSet<String> {
    let mut taken = HashSet::new();
    let symbol = compilation.symbols.get(function);
    for &argument in &symbol.arguments {
        taken.insert(compilation.symbols.get(argument).name.clone());
    }
    if let Some(this) = symbol.this {
        taken.insert(compilation.symbols.get(this).name.clone());
    }
    if let Some(body) = symbol.value {
        collect_variable_names(compilation, body, &mut taken);
    }
    taken
}

fn collect_variable_names(compilation: &Compilation, node: NodeId, taken: &mut HashSet<String>) {
    let ast: &Ast = &compilation.ast;
    if ast.kind(node) == NodeKind::Variable {
        if let Some(symbol) = ast.get(node).symbol {
            taken.insert(compilation.symbols.get(symbol).name.clone());
        }
    }
    for index in 0..ast.children(node).len() {
        collect_variable_names(compilation, ast.child(node, index), taken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_hir::Compilation;

    fn method_with_body(compilation: &mut Compilation, name: &str) -> (SymbolId, NodeId) {
        let global = compilation.symbols.global();
        let function = compilation
            .symbols
            .new_function(SymbolKind::FunctionInstance, name, Some(global));
        let body = compilation.ast.create_block();
        compilation.symbols.get_mut(function).value = Some(body);
        (function, body)
    }

    #[test]
    fn test_scan_records_definitions_and_uses() {
        let mut compilation = Compilation::new();
        let (_, body) = method_with_body(&mut compilation, "f");

        let local = compilation
            .symbols
            .new_variable(SymbolKind::VariableLocal, "x", None);
        let variable = compilation.ast.create_variable(local);
        let variables = compilation.ast.create_variables();
        compilation.ast.append_child(variables, variable);
        compilation.ast.append_child(body, variables);

        let reference = compilation.symbol_reference(local);
        let statement = compilation.ast.create_expression(reference);
        compilation.ast.append_child(body, statement);

        let mut converter = ClosureConverter::new();
        converter.scan(&compilation);

        assert_eq!(converter.scopes.len(), 1);
        let scope = &converter.scopes[0];
        assert_eq!(scope.kind, ScopeKind::Function);
        assert_eq!(scope.definitions.len(), 1);
        assert_eq!(scope.uses.len(), 1);
        assert!(!scope.definitions[0].is_captured);
        assert!(!scope.has_capturing_uses);
    }

    #[test]
    #[should_panic(expected = "defined twice")]
    fn test_duplicate_definition_panics() {
        let mut compilation = Compilation::new();
        let (_, body) = method_with_body(&mut compilation, "f");

        let local = compilation
            .symbols
            .new_variable(SymbolKind::VariableLocal, "x", None);
        for _ in 0..2 {
            let variable = compilation.ast.create_variable(local);
            let variables = compilation.ast.create_variables();
            compilation.ast.append_child(variables, variable);
            compilation.ast.append_child(body, variables);
        }

        let mut converter = ClosureConverter::new();
        converter.scan(&compilation);
    }

    #[test]
    fn test_environment_name_uses_function_chain() {
        let mut compilation = Compilation::new();
        let global = compilation.symbols.global();
        let class = compilation
            .symbols
            .new_object(SymbolKind::ObjectClass, "Counter", global);
        let function = compilation
            .symbols
            .new_function(SymbolKind::FunctionInstance, "step", Some(class));
        let body = compilation.ast.create_block();
        compilation.symbols.get_mut(function).value = Some(body);

        let mut converter = ClosureConverter::new();
        converter.scan(&compilation);
        assert_eq!(converter.scopes.len(), 1);
        assert_eq!(converter.environment_name(&compilation, 0), "CounterStepEnv");
    }

    #[test]
    fn test_generate_local_name_avoids_existing_locals() {
        let mut compilation = Compilation::new();
        let (function, body) = method_with_body(&mut compilation, "f");

        let env_local = compilation
            .symbols
            .new_variable(SymbolKind::VariableLocal, "env", None);
        let variable = compilation.ast.create_variable(env_local);
        let variables = compilation.ast.create_variables();
        compilation.ast.append_child(variables, variable);
        compilation.ast.append_child(body, variables);

        let mut converter = ClosureConverter::new();
        assert_eq!(converter.generate_local_name(&compilation, function, "env"), "env2");
        assert_eq!(converter.generate_local_name(&compilation, function, "env"), "env3");
    }
}
