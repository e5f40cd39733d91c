//! Arena syntax tree handed over by the source parser.
//!
//! Nodes are addressed by index. Line spans are 1-based and inclusive.
//! Child order is positional for a few node kinds:
//!
//! - `If`: condition, then branch, optional else branch.
//! - `Loop`: statements before the optional `Condition` are initialisers,
//!   statements after it are updates, and the last child is the body. A
//!   for-each loop has the loop variable, the iterated expression and the body.
//! - `Conditional`: condition, then value, else value.
//! - `Synchronized`: lock expression, body.
//! - `Invocation`: optional receiver (when `has_receiver`), then arguments.

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, AnalysisResult};
use crate::ir::{ConstantValue, MethodSignature};

pub type NodeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineSpan {
    pub start: usize,
    pub end: usize,
}

impl LineSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn line(line: usize) -> Self {
        Self::new(line, line)
    }

    pub fn contains(&self, line: usize) -> bool {
        self.start <= line && line <= self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    UShr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
    PreIncrement,
    PreDecrement,
    PostIncrement,
    PostDecrement,
}

impl UnaryOp {
    pub fn is_step(self) -> bool {
        matches!(
            self,
            UnaryOp::PreIncrement
                | UnaryOp::PreDecrement
                | UnaryOp::PostIncrement
                | UnaryOp::PostDecrement
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopKind {
    While,
    DoWhile,
    For,
    ForEach { over_array: bool },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Qualified binary name, e.g. `org.example.Parser$Entry`.
    Class {
        name: String,
    },
    /// Optional child: initializer.
    FieldDecl {
        name: String,
        ty: String,
        is_static: bool,
        is_final: bool,
    },
    Method {
        name: String,
        descriptor: String,
        is_static: bool,
    },
    Block,
    /// Optional child: initializer.
    LocalDecl {
        name: String,
        ty: String,
        is_final: bool,
    },
    If,
    Loop {
        kind: LoopKind,
    },
    /// Wraps the condition expression of a loop.
    Condition,
    /// Children: selector, then cases.
    Switch,
    /// Children: statements.
    SwitchCase {
        labels: Vec<ConstantValue>,
    },
    /// Children: body, catches, optional finally block.
    Try,
    Catch {
        types: Vec<String>,
    },
    Return,
    Throw,
    Synchronized,
    ExprStmt,
    Break,
    Continue,
    Literal(ConstantValue),
    Binary(BinaryOp),
    Unary(UnaryOp),
    Conditional,
    Cast {
        ty: String,
    },
    LocalRead {
        name: String,
    },
    /// Optional child: receiver.
    FieldRead {
        owner: String,
        name: String,
        is_static: bool,
    },
    /// Children: optional receiver, value.
    FieldWrite {
        owner: String,
        name: String,
        is_static: bool,
        op: Option<BinaryOp>,
    },
    /// Assignment to a local; child: value.
    Assign {
        target: String,
        op: Option<BinaryOp>,
    },
    /// Children: array, index, value.
    ArrayStore,
    /// Children: array, index.
    ArrayAccess,
    Invocation {
        owner: String,
        name: String,
        arity: usize,
        has_receiver: bool,
    },
    /// Children: constructor arguments.
    NewObject {
        ty: String,
    },
    /// Children: initializer elements, or dimension expressions.
    NewArray {
        element: String,
        has_initializer: bool,
    },
    InstanceOf {
        ty: String,
    },
    Lambda,
    ArrayLength,
}

impl NodeKind {
    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            NodeKind::Block
                | NodeKind::LocalDecl { .. }
                | NodeKind::If
                | NodeKind::Loop { .. }
                | NodeKind::Switch
                | NodeKind::SwitchCase { .. }
                | NodeKind::Try
                | NodeKind::Catch { .. }
                | NodeKind::Return
                | NodeKind::Throw
                | NodeKind::Synchronized
                | NodeKind::ExprStmt
                | NodeKind::Break
                | NodeKind::Continue
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyntaxNode {
    pub kind: NodeKind,
    pub lines: LineSpan,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub parent: Option<NodeId>,
}

/// Parsed source file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntaxTree {
    pub path: String,
    pub line_count: usize,
    nodes: Vec<SyntaxNode>,
    roots: Vec<NodeId>,
}

impl SyntaxTree {
    pub fn new(path: impl Into<String>, line_count: usize) -> Self {
        Self {
            path: path.into(),
            line_count,
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Append a node under `parent`, or as a root.
    pub fn push(&mut self, parent: Option<NodeId>, kind: NodeKind, lines: LineSpan) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(SyntaxNode {
            kind,
            lines,
            children: Vec::new(),
            parent,
        });
        match parent {
            Some(parent) => self.nodes[parent].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    /// Check the links of a deserialized tree.
    ///
    /// Every index is in range, parent and child links agree, and each node
    /// is reached exactly once from the roots. The accessors rely on this.
    pub fn validate(&self) -> AnalysisResult<()> {
        let malformed = |reason: String| {
            AnalysisError::malformed_diff(0, format!("{}: {reason}", self.path))
        };
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<(NodeId, Option<NodeId>)> =
            self.roots.iter().rev().map(|root| (*root, None)).collect();
        while let Some((id, parent)) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                return Err(malformed(format!("node {id} is out of range")));
            };
            if seen[id] {
                return Err(malformed(format!("node {id} is reachable twice")));
            }
            seen[id] = true;
            if node.parent != parent {
                return Err(malformed(format!("node {id} disagrees with its parent link")));
            }
            stack.extend(node.children.iter().rev().map(|child| (*child, Some(id))));
        }
        match seen.iter().position(|reached| !reached) {
            Some(id) => Err(malformed(format!("node {id} is unreachable from the roots"))),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> &SyntaxNode {
        &self.nodes[id]
    }

    pub fn get(&self, id: NodeId) -> Option<&SyntaxNode> {
        self.nodes.get(id)
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// `id` and every node below it, in preorder.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.nodes[node].children.iter().rev().copied());
        }
        order
    }

    /// Nearest ancestor (or self) satisfying `predicate`.
    pub fn ancestor(&self, id: NodeId, predicate: impl Fn(&NodeKind) -> bool) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current {
            if predicate(&self.nodes[node].kind) {
                return Some(node);
            }
            current = self.nodes[node].parent;
        }
        None
    }

    pub fn enclosing_method(&self, id: NodeId) -> Option<NodeId> {
        self.ancestor(id, |kind| matches!(kind, NodeKind::Method { .. }))
    }

    pub fn enclosing_class(&self, id: NodeId) -> Option<NodeId> {
        self.ancestor(id, |kind| matches!(kind, NodeKind::Class { .. }))
    }

    /// Method nodes in preorder.
    pub fn methods(&self) -> Vec<NodeId> {
        self.roots
            .iter()
            .flat_map(|root| self.descendants(*root))
            .filter(|id| matches!(self.nodes[*id].kind, NodeKind::Method { .. }))
            .collect()
    }

    /// Whether `id` is a block that other analyses treat as a change scope.
    ///
    /// A method's direct body block is folded into the method itself.
    fn is_scope(&self, id: NodeId) -> bool {
        match self.nodes[id].kind {
            NodeKind::Method { .. } => true,
            NodeKind::Block => !matches!(
                self.nodes[id].parent.map(|parent| &self.nodes[parent].kind),
                Some(NodeKind::Method { .. })
            ),
            _ => false,
        }
    }

    /// Smallest method or statement block spanning `line`.
    pub fn enclosing_block(&self, line: usize) -> Option<NodeId> {
        (0..self.nodes.len())
            .filter(|id| self.is_scope(*id) && self.nodes[*id].lines.contains(line))
            .min_by_key(|id| (self.nodes[*id].lines.len(), usize::MAX - self.depth(*id)))
    }

    fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes[id].parent;
        while let Some(node) = current {
            depth += 1;
            current = self.nodes[node].parent;
        }
        depth
    }

    /// Bytecode-side identity of a method node.
    pub fn method_signature(&self, method: NodeId) -> Option<MethodSignature> {
        let NodeKind::Method {
            name,
            descriptor,
            is_static,
        } = &self.nodes[method].kind
        else {
            return None;
        };
        let class = self.enclosing_class(method)?;
        let NodeKind::Class { name: owner } = &self.nodes[class].kind else {
            return None;
        };
        Some(MethodSignature {
            owner: internal_name(owner),
            name: name.clone(),
            descriptor: descriptor.clone(),
            is_static: *is_static,
        })
    }

    /// Stable label for a scope: the method key, plus `#n` for the n-th nested block.
    pub fn block_label(&self, scope: NodeId) -> Option<String> {
        let method = self.enclosing_method(scope)?;
        let key = self.method_signature(method)?.key();
        if scope == method {
            return Some(key);
        }
        let ordinal = self
            .descendants(method)
            .into_iter()
            .filter(|id| *id != method && self.is_scope(*id))
            .position(|id| id == scope)?;
        Some(format!("{key}#{}", ordinal + 1))
    }

    /// Statement blocks of a method in preorder, the method body first.
    pub fn statement_blocks(&self, method: NodeId) -> Vec<NodeId> {
        self.descendants(method)
            .into_iter()
            .filter(|id| matches!(self.nodes[*id].kind, NodeKind::Block))
            .collect()
    }
}

/// `org.example.Parser` to `org/example/Parser`.
pub fn internal_name(qualified: &str) -> String {
    qualified.replace('.', "/")
}
