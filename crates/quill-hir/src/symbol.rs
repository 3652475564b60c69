//! Symbol table for the resolved Quill program.
//!
//! Symbols live in a flat arena owned by `SymbolTable` and reference each
//! other by `SymbolId`. One record shape covers every kind of symbol;
//! fields that do not apply to a kind stay empty.

use quill_types::{NodeId, SymbolId, TypeId};

/// The kind of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Class declaration.
    ObjectClass,
    /// Interface declaration.
    ObjectInterface,
    /// Namespace declaration (the global scope is one).
    ObjectNamespace,
    /// Constructor function of a class.
    FunctionConstructor,
    /// Instance method.
    FunctionInstance,
    /// The function behind a lambda literal, before closure conversion
    /// turns it into an instance method.
    FunctionLocal,
    /// Function argument variable.
    VariableArgument,
    /// Instance field of an object.
    VariableInstance,
    /// Local variable (including the receiver variable of a method).
    VariableLocal,
    /// Generic type parameter of an object.
    ParameterObject,
}

impl SymbolKind {
    pub fn is_object(self) -> bool {
        matches!(
            self,
            SymbolKind::ObjectClass | SymbolKind::ObjectInterface | SymbolKind::ObjectNamespace
        )
    }

    pub fn is_function(self) -> bool {
        matches!(
            self,
            SymbolKind::FunctionConstructor | SymbolKind::FunctionInstance | SymbolKind::FunctionLocal
        )
    }

    /// Check if this is a binding that scope analysis tracks uses of.
    pub fn is_local_or_argument(self) -> bool {
        matches!(self, SymbolKind::VariableLocal | SymbolKind::VariableArgument)
    }
}

/// Flags for symbol classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolFlags(u8);

impl SymbolFlags {
    /// No flags.
    pub const NONE: SymbolFlags = SymbolFlags(0);
    /// Symbol is provided by the runtime; emitters reference it but must
    /// not re-declare it.
    pub const IS_IMPORTED: SymbolFlags = SymbolFlags(1 << 0);

    /// Check if a flag is set.
    #[inline]
    pub const fn contains(self, other: SymbolFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Combine flags.
    #[inline]
    pub const fn union(self, other: SymbolFlags) -> SymbolFlags {
        SymbolFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for SymbolFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for SymbolFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Resolution state of a symbol.
///
/// Symbols synthesized by middle-end passes are created fully resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolState {
    Uninitialized,
    Initialized,
}

/// One symbol in the resolved program.
#[derive(Debug)]
pub struct Symbol {
    pub id: SymbolId,
    pub kind: SymbolKind,
    pub name: String,
    pub parent: Option<SymbolId>,
    pub state: SymbolState,
    pub flags: SymbolFlags,
    pub resolved_type: Option<TypeId>,
    /// Nested members, for objects.
    pub members: Vec<SymbolId>,
    /// Generic type parameters, for objects.
    pub parameters: Vec<SymbolId>,
    /// Argument variables, for functions.
    pub arguments: Vec<SymbolId>,
    /// The receiver variable, for instance functions and constructors.
    pub this: Option<SymbolId>,
    /// Return type, for functions.
    pub return_type: Option<TypeId>,
    /// Variable initializer or function body block.
    pub value: Option<NodeId>,
    /// Implemented interface types, for classes.
    pub implements: Vec<TypeId>,
}

/// Arena of all symbols in a compilation, rooted at the global namespace.
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    global: SymbolId,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = Self {
            symbols: Vec::new(),
            global: 0,
        };
        let global = table.push(SymbolKind::ObjectNamespace, "<global>".to_string(), None);
        table.global = global;
        table
    }

    /// The global namespace root.
    pub fn global(&self) -> SymbolId {
        self.global
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id as usize]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id as usize]
    }

    /// Total number of symbols in the table.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn push(&mut self, kind: SymbolKind, name: String, parent: Option<SymbolId>) -> SymbolId {
        let id = self.symbols.len() as SymbolId;
        self.symbols.push(Symbol {
            id,
            kind,
            name,
            parent,
            state: SymbolState::Initialized,
            flags: SymbolFlags::NONE,
            resolved_type: None,
            members: Vec::new(),
            parameters: Vec::new(),
            arguments: Vec::new(),
            this: None,
            return_type: None,
            value: None,
            implements: Vec::new(),
        });
        id
    }

    /// Create an object symbol as a member of `parent`.
    pub fn new_object(&mut self, kind: SymbolKind, name: impl Into<String>, parent: SymbolId) -> SymbolId {
        assert!(kind.is_object());
        let id = self.push(kind, name.into(), Some(parent));
        self.get_mut(parent).members.push(id);
        id
    }

    /// Create a function symbol, optionally as a member of an object.
    pub fn new_function(
        &mut self,
        kind: SymbolKind,
        name: impl Into<String>,
        parent: Option<SymbolId>,
    ) -> SymbolId {
        assert!(kind.is_function());
        let id = self.push(kind, name.into(), parent);
        if let Some(parent) = parent {
            self.get_mut(parent).members.push(id);
        }
        id
    }

    /// Create a variable symbol. Instance variables should be attached to
    /// their object with `append_member` afterwards.
    pub fn new_variable(
        &mut self,
        kind: SymbolKind,
        name: impl Into<String>,
        resolved_type: Option<TypeId>,
    ) -> SymbolId {
        let id = self.push(kind, name.into(), None);
        self.get_mut(id).resolved_type = resolved_type;
        id
    }

    /// Create a generic type parameter of an object.
    pub fn new_parameter(&mut self, name: impl Into<String>, parent: SymbolId) -> SymbolId {
        let id = self.push(SymbolKind::ParameterObject, name.into(), Some(parent));
        self.get_mut(parent).parameters.push(id);
        id
    }

    /// Attach an existing symbol as a member of an object.
    pub fn append_member(&mut self, object: SymbolId, member: SymbolId) {
        self.get_mut(member).parent = Some(object);
        self.get_mut(object).members.push(member);
    }

    /// Find a direct member of an object by name.
    pub fn find_member(&self, object: SymbolId, name: &str) -> Option<SymbolId> {
        self.get(object)
            .members
            .iter()
            .copied()
            .find(|&member| self.get(member).name == name)
    }

    /// Pick a name based on `prefix` that no member of `object` uses yet.
    pub fn generate_name(&self, object: SymbolId, prefix: &str) -> String {
        if self.find_member(object, prefix).is_none() {
            return prefix.to_string();
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{}{}", prefix, counter);
            if self.find_member(object, &candidate).is_none() {
                return candidate;
            }
            counter += 1;
        }
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_flags() {
        let flags = SymbolFlags::NONE | SymbolFlags::IS_IMPORTED;
        assert!(flags.contains(SymbolFlags::IS_IMPORTED));
        assert!(SymbolFlags::NONE.contains(SymbolFlags::NONE));
        assert!(!SymbolFlags::NONE.contains(SymbolFlags::IS_IMPORTED));
    }

    #[test]
    fn test_member_lookup() {
        let mut table = SymbolTable::new();
        let global = table.global();
        let class = table.new_object(SymbolKind::ObjectClass, "Counter", global);
        let method = table.new_function(SymbolKind::FunctionInstance, "step", Some(class));

        assert_eq!(table.find_member(global, "Counter"), Some(class));
        assert_eq!(table.find_member(class, "step"), Some(method));
        assert_eq!(table.find_member(class, "missing"), None);
        assert_eq!(table.get(method).parent, Some(class));
    }

    #[test]
    fn test_generate_name() {
        let mut table = SymbolTable::new();
        let global = table.global();
        let class = table.new_object(SymbolKind::ObjectClass, "Env", global);

        assert_eq!(table.generate_name(class, "n"), "n");
        let field = table.new_variable(SymbolKind::VariableInstance, "n", None);
        table.append_member(class, field);
        assert_eq!(table.generate_name(class, "n"), "n2");

        let field2 = table.new_variable(SymbolKind::VariableInstance, "n2", None);
        table.append_member(class, field2);
        assert_eq!(table.generate_name(class, "n"), "n3");
    }
}
