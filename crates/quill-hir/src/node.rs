//! AST node arena for the resolved Quill program.
//!
//! Nodes are homogeneous records with an ordered child list, stored in a
//! flat arena indexed by `NodeId`. Node identity is the arena index, so a
//! node can be rewritten in place (`become_node`) without touching the
//! parents that reference it. That property is what middle-end passes rely
//! on when they overwrite expressions that other rewrites still point at.

use quill_types::{NodeId, SymbolId, TypeId};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Assign,
    Add,
    Subtract,
    Multiply,
    Divide,
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
}

/// The kind of an AST node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Placeholder with no meaning; used while rewiring subtrees.
    Null,

    // Statements
    /// Statement list: `{ ... }`
    Block,
    /// Declaration group holding one or more `Variable` children.
    Variables,
    /// Single variable declaration; `symbol` is the variable, the only
    /// child (if present) is the initializer.
    Variable,
    /// Expression statement.
    Expression,
    /// `return`; the only child (if present) is the value.
    Return,
    /// `if`: children are condition, then-block, optional else-block.
    If,
    /// `while`: children are condition and body block.
    While,
    /// C-style `for`: children are setup, test, update, body block.
    For,
    /// `for x in value`: `symbol` is the loop variable, children are the
    /// iterated value and the body block.
    Foreach,
    /// `try`: children are the guarded block and catch clauses.
    Try,
    /// Catch clause: `symbol` is the bound variable, the only child is the
    /// handler block.
    Catch,
    Break,
    Continue,

    // Expressions
    /// Reference to a symbol by name.
    Name,
    /// Member access: the only child is the target value, `symbol` is the
    /// accessed member.
    Dot,
    /// Call: children are the callee followed by the arguments.
    Call,
    /// Lambda literal: `symbol` is its `FunctionLocal`, whose `value` holds
    /// the body block. Closure conversion erases every one of these.
    Lambda,
    /// Binary operation.
    Binary(BinaryOp),
    /// Type reference in expression position (e.g. a constructor target).
    Type,
    NullLiteral,
    IntLiteral,
    BoolLiteral,
    StringLiteral,
}

/// Literal payload of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Int(i64),
    Bool(bool),
    String(String),
}

/// One AST node.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub symbol: Option<SymbolId>,
    pub resolved_type: Option<TypeId>,
    pub content: Option<Content>,
}

/// Arena of all AST nodes in a compilation.
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id as usize]
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.get(id).kind
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.get(id).children
    }

    pub fn child(&self, id: NodeId, index: usize) -> NodeId {
        self.get(id).children[index]
    }

    /// Iterate over every live node id in the arena, including detached
    /// subtrees.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as NodeId).filter(move |&id| self.get(id).kind != NodeKind::Null)
    }

    /// Total number of nodes ever allocated.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn new_node(&mut self, kind: NodeKind) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(Node {
            id,
            kind,
            parent: None,
            children: Vec::new(),
            symbol: None,
            resolved_type: None,
            content: None,
        });
        id
    }

    // Factory

    pub fn create_null(&mut self) -> NodeId {
        self.new_node(NodeKind::Null)
    }

    pub fn create_block(&mut self) -> NodeId {
        self.new_node(NodeKind::Block)
    }

    pub fn create_variables(&mut self) -> NodeId {
        self.new_node(NodeKind::Variables)
    }

    pub fn create_variable(&mut self, symbol: SymbolId) -> NodeId {
        let node = self.new_node(NodeKind::Variable);
        self.get_mut(node).symbol = Some(symbol);
        node
    }

    pub fn create_symbol_reference(&mut self, symbol: SymbolId) -> NodeId {
        let node = self.new_node(NodeKind::Name);
        self.get_mut(node).symbol = Some(symbol);
        node
    }

    pub fn create_member_reference(&mut self, value: NodeId, member: SymbolId) -> NodeId {
        let node = self.new_node(NodeKind::Dot);
        self.get_mut(node).symbol = Some(member);
        self.append_child(node, value);
        node
    }

    pub fn create_call(&mut self, callee: NodeId) -> NodeId {
        let node = self.new_node(NodeKind::Call);
        self.append_child(node, callee);
        node
    }

    pub fn create_binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        let node = self.new_node(NodeKind::Binary(op));
        self.append_child(node, left);
        self.append_child(node, right);
        node
    }

    pub fn create_expression(&mut self, value: NodeId) -> NodeId {
        let node = self.new_node(NodeKind::Expression);
        self.append_child(node, value);
        node
    }

    pub fn create_return(&mut self, value: Option<NodeId>) -> NodeId {
        let node = self.new_node(NodeKind::Return);
        if let Some(value) = value {
            self.append_child(node, value);
        }
        node
    }

    pub fn create_type(&mut self, ty: TypeId) -> NodeId {
        let node = self.new_node(NodeKind::Type);
        self.get_mut(node).resolved_type = Some(ty);
        node
    }

    pub fn create_lambda(&mut self, function: SymbolId) -> NodeId {
        let node = self.new_node(NodeKind::Lambda);
        self.get_mut(node).symbol = Some(function);
        node
    }

    pub fn create_foreach(&mut self, variable: SymbolId, value: NodeId, body: NodeId) -> NodeId {
        let node = self.new_node(NodeKind::Foreach);
        self.get_mut(node).symbol = Some(variable);
        self.append_child(node, value);
        self.append_child(node, body);
        node
    }

    pub fn create_int(&mut self, value: i64) -> NodeId {
        let node = self.new_node(NodeKind::IntLiteral);
        self.get_mut(node).content = Some(Content::Int(value));
        node
    }

    /// Stamp a resolved type onto a node, returning it for chaining.
    pub fn with_type(&mut self, node: NodeId, ty: TypeId) -> NodeId {
        self.get_mut(node).resolved_type = Some(ty);
        node
    }

    // Mutation

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        assert!(self.get(child).parent.is_none(), "child already has a parent");
        self.get_mut(child).parent = Some(parent);
        self.get_mut(parent).children.push(child);
    }

    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
        assert!(self.get(child).parent.is_none(), "child already has a parent");
        self.get_mut(child).parent = Some(parent);
        self.get_mut(parent).children.insert(0, child);
    }

    /// Insert `child` into `parent` directly after the existing child
    /// `after`.
    pub fn insert_child_after(&mut self, parent: NodeId, after: NodeId, child: NodeId) {
        assert!(self.get(child).parent.is_none(), "child already has a parent");
        let index = self.child_index(parent, after);
        self.get_mut(child).parent = Some(parent);
        self.get_mut(parent).children.insert(index + 1, child);
    }

    /// Insert `child` into `parent` directly before the existing child
    /// `before`.
    pub fn insert_child_before(&mut self, parent: NodeId, before: NodeId, child: NodeId) {
        assert!(self.get(child).parent.is_none(), "child already has a parent");
        let index = self.child_index(parent, before);
        self.get_mut(child).parent = Some(parent);
        self.get_mut(parent).children.insert(index, child);
    }

    /// Detach a node from its parent.
    pub fn remove(&mut self, node: NodeId) {
        if let Some(parent) = self.get(node).parent {
            let index = self.child_index(parent, node);
            self.get_mut(parent).children.remove(index);
            self.get_mut(node).parent = None;
        }
    }

    /// Replace `node` with `replacement` in its parent's child list.
    /// `node` is detached; `replacement` must not be attached anywhere.
    pub fn replace_with(&mut self, node: NodeId, replacement: NodeId) {
        assert!(self.get(replacement).parent.is_none(), "replacement already has a parent");
        let parent = self.get(node).parent.expect("cannot replace a detached node");
        let index = self.child_index(parent, node);
        self.get_mut(parent).children[index] = replacement;
        self.get_mut(replacement).parent = Some(parent);
        self.get_mut(node).parent = None;
    }

    /// Take over the contents of `donor` in place, keeping this node's
    /// identity and position in its parent. The donor must be detached and
    /// is left as a dead `Null` node.
    pub fn become_node(&mut self, node: NodeId, donor: NodeId) {
        assert_ne!(node, donor);
        assert!(self.get(donor).parent.is_none(), "donor already has a parent");

        let old_children = std::mem::take(&mut self.get_mut(node).children);
        for child in old_children {
            self.get_mut(child).parent = None;
        }

        let donor_node = self.get_mut(donor);
        let kind = donor_node.kind;
        let children = std::mem::take(&mut donor_node.children);
        let symbol = donor_node.symbol.take();
        let resolved_type = donor_node.resolved_type.take();
        let content = donor_node.content.take();
        donor_node.kind = NodeKind::Null;

        let target = self.get_mut(node);
        target.kind = kind;
        target.symbol = symbol;
        target.resolved_type = resolved_type;
        target.content = content;
        target.children = children.clone();
        for child in children {
            self.get_mut(child).parent = Some(node);
        }
    }

    /// Pull a single `Variable` child out of a `Variables` group.
    pub fn extract_variable_from_variables(&mut self, variables: NodeId, variable: NodeId) {
        assert_eq!(self.kind(variables), NodeKind::Variables);
        assert_eq!(self.kind(variable), NodeKind::Variable);
        assert_eq!(self.get(variable).parent, Some(variables));
        self.remove(variable);
    }

    fn child_index(&self, parent: NodeId, child: NodeId) -> usize {
        self.get(parent)
            .children
            .iter()
            .position(|&c| c == child)
            .expect("node is not a child of its parent")
    }
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splicing() {
        let mut ast = Ast::new();
        let block = ast.create_block();
        let a = ast.create_int(1);
        let b = ast.create_int(2);
        let c = ast.create_int(3);
        ast.append_child(block, b);
        ast.prepend_child(block, a);
        ast.insert_child_after(block, b, c);
        assert_eq!(ast.children(block), &[a, b, c]);

        ast.remove(b);
        assert_eq!(ast.children(block), &[a, c]);
        assert_eq!(ast.parent(b), None);

        let d = ast.create_int(4);
        ast.replace_with(a, d);
        assert_eq!(ast.children(block), &[d, c]);
        assert_eq!(ast.parent(a), None);
        assert_eq!(ast.parent(d), Some(block));
    }

    #[test]
    fn test_become_node_keeps_identity() {
        let mut ast = Ast::new();
        let block = ast.create_block();
        let name = ast.create_symbol_reference(5);
        ast.append_child(block, name);

        let value = ast.create_symbol_reference(6);
        let dot = ast.create_member_reference(value, 7);
        ast.become_node(name, dot);

        // The parent still points at the same id, which is now the access.
        assert_eq!(ast.children(block), &[name]);
        assert_eq!(ast.kind(name), NodeKind::Dot);
        assert_eq!(ast.get(name).symbol, Some(7));
        assert_eq!(ast.children(name), &[value]);
        assert_eq!(ast.parent(value), Some(name));
        assert_eq!(ast.kind(dot), NodeKind::Null);
    }

    #[test]
    fn test_swap_through_placeholder() {
        let mut ast = Ast::new();
        let call = {
            let callee = ast.create_symbol_reference(1);
            ast.create_call(callee)
        };
        let callee = ast.child(call, 0);

        // Detach the callee through a placeholder, wrap it, and put the
        // wrapper back where the callee was.
        let placeholder = ast.create_null();
        ast.replace_with(callee, placeholder);
        let dot = ast.create_member_reference(callee, 9);
        ast.replace_with(placeholder, dot);

        assert_eq!(ast.child(call, 0), dot);
        assert_eq!(ast.children(dot), &[callee]);
        assert_eq!(ast.parent(callee), Some(dot));
    }

    #[test]
    #[should_panic(expected = "child already has a parent")]
    fn test_double_attach_panics() {
        let mut ast = Ast::new();
        let block = ast.create_block();
        let other = ast.create_block();
        let child = ast.create_int(1);
        ast.append_child(block, child);
        ast.append_child(other, child);
    }
}
