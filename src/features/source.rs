use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::analysis::constants::{ConstantBinding, coerce};
use crate::features::{
    ARRAY_LENGTH, FeatureConfig, FeatureOrigin, FeatureSet, InstructionShape, LoopSignature,
    Multiset, bump, call_target, creation_key, field_key, type_descriptor,
};
use crate::ir::ConstantValue;
use crate::syntax::{BinaryOp, LoopKind, NodeId, NodeKind, SyntaxTree, UnaryOp, internal_name};

/// One method of a parsed source file with its folded constants.
pub struct SourceMethod<'a> {
    pub tree: &'a SyntaxTree,
    pub method: NodeId,
    pub constants: &'a ConstantBinding,
}

/// Build the feature set of a source method, modelling what javac emits for it.
pub fn extract_source_features(method: &SourceMethod<'_>, config: &FeatureConfig) -> FeatureSet {
    let key = method
        .tree
        .method_signature(method.method)
        .map(|signature| signature.key())
        .unwrap_or_default();
    let mut walker = Walker {
        tree: method.tree,
        binding: method.constants,
        config,
        set: FeatureSet::new(FeatureOrigin::Source, key),
        calls: BTreeMap::new(),
        guards: BTreeSet::new(),
        block: method.method,
    };

    for child in method.tree.children(method.method).to_vec() {
        walker.walk(child, false);
    }
    if walker.config.shapes && walker.falls_off_end(method.method) {
        bump(&mut walker.set.shapes, InstructionShape::Return);
    }

    let mut set = walker.set;
    if config.call_sites {
        let mut order = vec![method.method];
        order.extend(method.tree.statement_blocks(method.method));
        let mut calls = walker.calls;
        for block in order {
            if let Some(group) = calls.remove(&block) {
                set.call_sites.push(group);
            }
        }
    }
    set.loops.sort();

    debug!("{}: {} source features", set.method, set.size());
    set
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExitClass {
    Constant,
    Variable,
    Call,
}

struct Walker<'a> {
    tree: &'a SyntaxTree,
    binding: &'a ConstantBinding,
    config: &'a FeatureConfig,
    set: FeatureSet,
    calls: BTreeMap<NodeId, Multiset<String>>,
    /// `if` statements whose branches leave a loop.
    guards: BTreeSet<NodeId>,
    /// Innermost statement block being walked.
    block: NodeId,
}

impl Walker<'_> {
    fn kind(&self, node: NodeId) -> &NodeKind {
        self.tree.kind(node)
    }

    fn child(&self, node: NodeId, index: usize) -> Option<NodeId> {
        self.tree.children(node).get(index).copied()
    }

    fn shape(&mut self, shape: InstructionShape) {
        if self.config.shapes {
            bump(&mut self.set.shapes, shape);
        }
    }

    fn constant(&mut self, value: &ConstantValue) {
        if self.config.constants {
            self.set.add_constant(value);
        }
    }

    fn call(&mut self, owner: &str, name: &str, arity: usize) {
        if !self.config.call_sites {
            return;
        }
        if let Some(target) = call_target(owner, name, arity) {
            bump(self.calls.entry(self.block).or_default(), target);
        }
    }

    fn access(&mut self, key: Option<String>) {
        if let (true, Some(key)) = (self.config.field_accesses, key) {
            bump(&mut self.set.field_accesses, key);
        }
    }

    fn creation(&mut self, key: Option<String>) {
        if let (true, Some(key)) = (self.config.object_creations, key) {
            bump(&mut self.set.object_creations, key);
        }
    }

    fn is_folded(&self, node: NodeId) -> bool {
        !self.kind(node).is_statement() && self.binding.is_compile_time(node)
    }

    /// String operand of a concatenation that is not itself constant.
    fn is_concat_operand(&self, node: NodeId) -> bool {
        let Some(parent) = self.tree.parent(node) else {
            return false;
        };
        matches!(self.kind(parent), NodeKind::Binary(BinaryOp::Add))
            && !self.binding.is_compile_time(parent)
            && matches!(self.binding.value(node), Some(ConstantValue::Str(_)))
    }

    fn walk(&mut self, node: NodeId, in_condition: bool) {
        if self.is_folded(node) {
            if !self.is_concat_operand(node) {
                if let Some(value) = self.binding.value(node).cloned() {
                    self.constant(&value);
                }
            }
            return;
        }

        let children = self.tree.children(node).to_vec();
        match self.kind(node).clone() {
            NodeKind::Class { .. } | NodeKind::Lambda => return,
            NodeKind::Block => {
                let outer = self.block;
                self.block = node;
                for child in children {
                    self.walk(child, false);
                }
                self.block = outer;
                return;
            }
            NodeKind::LocalDecl { ty, .. } => {
                if let Some(init) = children.first() {
                    match self.binding.value(*init).cloned() {
                        Some(value) if self.is_folded(*init) => {
                            if let Some(value) = coerce(&ty, &value) {
                                self.constant(&value);
                            }
                        }
                        _ => self.walk(*init, false),
                    }
                }
                return;
            }
            NodeKind::If | NodeKind::Conditional => {
                let shapes = !self.guards.contains(&node);
                for (position, child) in children.into_iter().enumerate() {
                    if position == 0 {
                        self.condition(child, false, shapes);
                    }
                    self.walk(child, position == 0);
                }
                return;
            }
            NodeKind::Loop { kind } => self.enter_loop(node, kind),
            NodeKind::Condition => {
                for child in children {
                    self.walk(child, true);
                }
                return;
            }
            NodeKind::Switch => self.shape(InstructionShape::Switch),
            NodeKind::Synchronized => self.shape(InstructionShape::Monitor),
            NodeKind::Throw => self.shape(InstructionShape::Throw),
            NodeKind::Return => self.shape(InstructionShape::Return),
            NodeKind::InstanceOf { .. } => self.shape(InstructionShape::InstanceOf),
            NodeKind::Binary(op) => {
                self.shift(op);
                if is_boolean_operator(op) && !in_condition {
                    self.materialized(node);
                }
                let short_circuit = matches!(op, BinaryOp::And | BinaryOp::Or);
                for child in children {
                    self.walk(child, short_circuit);
                }
                return;
            }
            NodeKind::Unary(op) => {
                if op.is_step() {
                    self.constant(&ConstantValue::Int(1));
                    if let Some(NodeKind::FieldRead { owner, name, .. }) =
                        children.first().map(|child| self.kind(*child).clone())
                    {
                        self.access(field_key(&internal_name(&owner), &name));
                    }
                }
                if op == UnaryOp::Not {
                    if !in_condition {
                        self.materialized(node);
                    }
                    for child in children {
                        self.walk(child, true);
                    }
                    return;
                }
            }
            NodeKind::Assign { op: Some(op), .. } => self.shift(op),
            NodeKind::FieldRead { owner, name, .. } => {
                self.access(field_key(&internal_name(&owner), &name));
            }
            NodeKind::FieldWrite {
                owner, name, op, ..
            } => {
                let key = field_key(&internal_name(&owner), &name);
                if let Some(op) = op {
                    self.shift(op);
                    self.access(key.clone());
                }
                self.access(key);
            }
            NodeKind::ArrayLength => self.access(Some(ARRAY_LENGTH.to_string())),
            NodeKind::Invocation {
                owner, name, arity, ..
            } => self.call(&internal_name(&owner), &name, arity),
            NodeKind::NewObject { ty } => {
                let internal = internal_name(&ty);
                self.creation(creation_key(&internal));
                self.call(&internal, "<init>", children.len());
            }
            NodeKind::NewArray {
                element,
                has_initializer,
            } => {
                self.creation(Some(format!("[{}", type_descriptor(&element))));
                if has_initializer {
                    let count = i32::try_from(children.len()).unwrap_or(i32::MAX);
                    self.constant(&ConstantValue::Int(count));
                    for index in 0..count {
                        self.constant(&ConstantValue::Int(index));
                    }
                }
            }
            _ => {}
        }

        for child in children {
            self.walk(child, false);
        }
    }

    fn shift(&mut self, op: BinaryOp) {
        match op {
            BinaryOp::Shl => self.shape(InstructionShape::ShiftLeft),
            BinaryOp::Shr => self.shape(InstructionShape::ShiftRight),
            BinaryOp::UShr => self.shape(InstructionShape::UnsignedShiftRight),
            _ => {}
        }
    }

    /// A boolean expression used as a value branches and pushes 1 or 0.
    fn materialized(&mut self, node: NodeId) {
        self.condition(node, false, true);
        self.constant(&ConstantValue::Int(1));
        self.constant(&ConstantValue::Int(0));
    }

    /// Branch shapes and implied zero constants of a condition.
    fn condition(&mut self, node: NodeId, jump_when: bool, shapes: bool) {
        let mut leaves = Vec::new();
        self.leaves(node, jump_when, &mut leaves);
        for (leaf, sense) in leaves {
            match self.kind(leaf).clone() {
                NodeKind::Binary(op) => {
                    let op = if sense { op } else { negate(op) };
                    if shapes {
                        if let Some(shape) = branch_shape(op) {
                            self.shape(shape);
                        }
                    }
                }
                NodeKind::Invocation { .. } | NodeKind::InstanceOf { .. } => {}
                _ => self.constant(&ConstantValue::Int(0)),
            }
        }
    }

    /// Branch leaves of a condition with whether each jumps on true, following javac.
    fn leaves(&self, node: NodeId, jump_when: bool, out: &mut Vec<(NodeId, bool)>) {
        if self.is_folded(node) {
            return;
        }
        let left = self.child(node, 0);
        let right = self.child(node, 1);
        match self.kind(node) {
            NodeKind::Binary(BinaryOp::And) => {
                if let (Some(left), Some(right)) = (left, right) {
                    self.leaves(left, false, out);
                    self.leaves(right, jump_when, out);
                }
            }
            NodeKind::Binary(BinaryOp::Or) => {
                if let (Some(left), Some(right)) = (left, right) {
                    self.leaves(left, true, out);
                    self.leaves(right, jump_when, out);
                }
            }
            NodeKind::Unary(UnaryOp::Not) => {
                if let Some(operand) = left {
                    self.leaves(operand, !jump_when, out);
                }
            }
            _ => out.push((node, jump_when)),
        }
    }

    fn enter_loop(&mut self, node: NodeId, kind: LoopKind) {
        self.shape(InstructionShape::Loop);
        let mut signature = LoopSignature {
            depth: self.loop_depth(node),
            ..LoopSignature::default()
        };
        match kind {
            LoopKind::ForEach { over_array: true } => {
                signature.variable_exits += 1;
                self.access(Some(ARRAY_LENGTH.to_string()));
                self.constant(&ConstantValue::Int(0));
                self.constant(&ConstantValue::Int(1));
            }
            LoopKind::ForEach { over_array: false } => {
                signature.call_exits += 1;
                self.call("java/util/Iterator", "hasNext", 0);
                self.call("java/util/Iterator", "next", 0);
            }
            _ => {}
        }

        let condition = self
            .tree
            .children(node)
            .iter()
            .copied()
            .find(|child| matches!(self.kind(*child), NodeKind::Condition))
            .and_then(|condition| self.child(condition, 0));
        let mut exits = Vec::new();
        if let Some(condition) = condition {
            let mut leaves = Vec::new();
            self.leaves(condition, false, &mut leaves);
            exits.extend(leaves.into_iter().filter(|(_, sense)| !sense).map(|(leaf, _)| leaf));
            // Loop conditions only contribute their implied zero constants.
            self.condition(condition, false, false);
        }
        for guard in self.exit_guards(node) {
            if let Some(condition) = self.child(guard, 0) {
                let mut leaves = Vec::new();
                self.leaves(condition, true, &mut leaves);
                exits.extend(leaves.into_iter().filter(|(_, sense)| *sense).map(|(leaf, _)| leaf));
            }
            self.guards.insert(guard);
        }
        for leaf in exits {
            match self.classify_exit(leaf) {
                ExitClass::Constant => signature.constant_exits += 1,
                ExitClass::Variable => signature.variable_exits += 1,
                ExitClass::Call => signature.call_exits += 1,
            }
        }
        if self.config.loops {
            self.set.loops.push(signature);
        }
    }

    fn loop_depth(&self, node: NodeId) -> usize {
        let mut depth = 1;
        let mut current = self.tree.parent(node);
        while let Some(ancestor) = current {
            match self.kind(ancestor) {
                NodeKind::Loop { .. } => depth += 1,
                NodeKind::Method { .. } | NodeKind::Lambda | NodeKind::Class { .. } => break,
                _ => {}
            }
            current = self.tree.parent(ancestor);
        }
        depth
    }

    /// `if` statements directly guarding a `break` or `return` out of `lp`.
    fn exit_guards(&self, lp: NodeId) -> Vec<NodeId> {
        let mut guards = BTreeSet::new();
        for node in self.tree.descendants(lp) {
            let leaves_loop = match self.kind(node) {
                NodeKind::Return | NodeKind::Throw => true,
                NodeKind::Break => self.break_target(node) == Some(lp),
                _ => false,
            };
            if !leaves_loop || self.innermost_scope(node) != Some(lp) {
                continue;
            }
            let guard = self
                .tree
                .ancestor(node, |kind| matches!(kind, NodeKind::If | NodeKind::Loop { .. }));
            if let Some(guard) = guard.filter(|guard| matches!(self.kind(*guard), NodeKind::If)) {
                guards.insert(guard);
            }
        }
        guards.into_iter().collect()
    }

    /// Loop or switch an unlabeled `break` leaves.
    fn break_target(&self, node: NodeId) -> Option<NodeId> {
        self.tree.ancestor(node, |kind| {
            matches!(kind, NodeKind::Loop { .. } | NodeKind::Switch)
        })
    }

    /// Innermost loop around `node`, not crossing a lambda or nested class.
    fn innermost_scope(&self, node: NodeId) -> Option<NodeId> {
        let scope = self.tree.ancestor(node, |kind| {
            matches!(
                kind,
                NodeKind::Loop { .. } | NodeKind::Lambda | NodeKind::Class { .. } | NodeKind::Method { .. }
            )
        })?;
        matches!(self.kind(scope), NodeKind::Loop { .. }).then_some(scope)
    }

    fn classify_exit(&self, leaf: NodeId) -> ExitClass {
        match self.kind(leaf) {
            NodeKind::Binary(op) if op.is_comparison() => {
                let (Some(left), Some(right)) = (self.child(leaf, 0), self.child(leaf, 1)) else {
                    return ExitClass::Variable;
                };
                let compares_to_zero = self.is_folded(right)
                    && matches!(
                        self.binding.value(right),
                        Some(ConstantValue::Int(0) | ConstantValue::Long(0) | ConstantValue::Null)
                    );
                if compares_to_zero {
                    return if matches!(self.kind(left), NodeKind::Invocation { .. }) {
                        ExitClass::Call
                    } else {
                        ExitClass::Constant
                    };
                }
                if self.is_folded(right) || matches!(self.kind(right), NodeKind::Literal(_)) {
                    ExitClass::Constant
                } else if matches!(self.kind(right), NodeKind::Invocation { .. }) {
                    ExitClass::Call
                } else {
                    ExitClass::Variable
                }
            }
            NodeKind::Invocation { .. } => ExitClass::Call,
            _ => ExitClass::Constant,
        }
    }

    /// Whether a void method can reach its closing brace, which javac ends with `return`.
    fn falls_off_end(&self, method: NodeId) -> bool {
        let NodeKind::Method { descriptor, .. } = self.kind(method) else {
            return false;
        };
        if !descriptor.ends_with(")V") {
            return false;
        }
        let Some(body) = self
            .tree
            .children(method)
            .iter()
            .copied()
            .find(|child| matches!(self.kind(*child), NodeKind::Block))
        else {
            return false;
        };
        !self
            .tree
            .children(body)
            .last()
            .is_some_and(|last| matches!(self.kind(*last), NodeKind::Return | NodeKind::Throw))
    }
}

fn is_boolean_operator(op: BinaryOp) -> bool {
    op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or)
}

fn negate(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Ge,
        BinaryOp::Le => BinaryOp::Gt,
        BinaryOp::Gt => BinaryOp::Le,
        BinaryOp::Ge => BinaryOp::Lt,
        BinaryOp::Eq => BinaryOp::Ne,
        BinaryOp::Ne => BinaryOp::Eq,
        other => other,
    }
}

fn branch_shape(op: BinaryOp) -> Option<InstructionShape> {
    match op {
        BinaryOp::Lt => Some(InstructionShape::BranchLt),
        BinaryOp::Le => Some(InstructionShape::BranchLe),
        BinaryOp::Gt => Some(InstructionShape::BranchGt),
        BinaryOp::Ge => Some(InstructionShape::BranchGe),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::constants::propagate_constants;
    use crate::analysis::library::LibraryConstants;
    use crate::syntax::LineSpan;

    struct Fixture {
        tree: SyntaxTree,
        method: NodeId,
        body: NodeId,
    }

    impl Fixture {
        fn new(descriptor: &str) -> Self {
            let mut tree = SyntaxTree::new("src/a/Counter.java", 30);
            let class = tree.push(
                None,
                NodeKind::Class {
                    name: "a.Counter".to_string(),
                },
                LineSpan::new(1, 30),
            );
            let method = tree.push(
                Some(class),
                NodeKind::Method {
                    name: "count".to_string(),
                    descriptor: descriptor.to_string(),
                    is_static: true,
                },
                LineSpan::new(2, 29),
            );
            let body = tree.push(Some(method), NodeKind::Block, LineSpan::new(2, 29));
            Self { tree, method, body }
        }

        fn add(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
            self.tree.push(Some(parent), kind, LineSpan::line(3))
        }

        fn int(&mut self, parent: NodeId, value: i32) -> NodeId {
            self.add(parent, NodeKind::Literal(ConstantValue::Int(value)))
        }

        fn read(&mut self, parent: NodeId, name: &str) -> NodeId {
            self.add(
                parent,
                NodeKind::LocalRead {
                    name: name.to_string(),
                },
            )
        }

        fn extract(&self) -> FeatureSet {
            let binding = propagate_constants(&self.tree, &LibraryConstants::builtin());
            let method = SourceMethod {
                tree: &self.tree,
                method: self.method,
                constants: &binding,
            };
            extract_source_features(&method, &FeatureConfig::default())
        }
    }

    /// `for (int i = 0; i < 10; i++) { sum += helper(i); } return sum;`
    fn counting_loop() -> Fixture {
        let mut f = Fixture::new("(I)I");
        let body = f.body;
        let lp = f.add(body, NodeKind::Loop { kind: LoopKind::For });
        let init = f.add(
            lp,
            NodeKind::LocalDecl {
                name: "i".to_string(),
                ty: "int".to_string(),
                is_final: false,
            },
        );
        f.int(init, 0);
        let condition = f.add(lp, NodeKind::Condition);
        let less = f.add(condition, NodeKind::Binary(BinaryOp::Lt));
        f.read(less, "i");
        f.int(less, 10);
        let update = f.add(lp, NodeKind::ExprStmt);
        let step = f.add(update, NodeKind::Unary(UnaryOp::PostIncrement));
        f.read(step, "i");
        let loop_body = f.add(lp, NodeKind::Block);
        let stmt = f.add(loop_body, NodeKind::ExprStmt);
        let assign = f.add(
            stmt,
            NodeKind::Assign {
                target: "sum".to_string(),
                op: Some(BinaryOp::Add),
            },
        );
        let call = f.add(
            assign,
            NodeKind::Invocation {
                owner: "a.Counter".to_string(),
                name: "helper".to_string(),
                arity: 1,
                has_receiver: false,
            },
        );
        f.read(call, "i");
        let ret = f.add(body, NodeKind::Return);
        f.read(ret, "sum");
        f
    }

    #[test]
    fn counting_loop_matches_compiled_shape() {
        let set = counting_loop().extract();
        assert_eq!(
            vec![LoopSignature {
                depth: 1,
                constant_exits: 1,
                variable_exits: 0,
                call_exits: 0,
            }],
            set.loops
        );
        assert_eq!(None, set.shapes.get(&InstructionShape::BranchGe));
        assert_eq!(Some(&1), set.shapes.get(&InstructionShape::Loop));
        assert_eq!(Some(&1), set.shapes.get(&InstructionShape::Return));
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(0)));
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(10)));
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(1)));
        assert_eq!(1, set.call_sites.len());
        assert_eq!(Some(&1), set.call_sites[0].get("a/Counter/helper/1"));
    }

    #[test]
    fn guard_condition_maps_to_inverted_branch() {
        let mut f = Fixture::new("(I)V");
        let body = f.body;
        let branch = f.add(body, NodeKind::If);
        let less = f.add(branch, NodeKind::Binary(BinaryOp::Lt));
        f.read(less, "n");
        f.int(less, 0);
        let then = f.add(branch, NodeKind::Block);
        let throw = f.add(then, NodeKind::Throw);
        f.add(
            throw,
            NodeKind::NewObject {
                ty: "java.lang.IllegalArgumentException".to_string(),
            },
        );
        let set = f.extract();
        assert_eq!(Some(&1), set.shapes.get(&InstructionShape::BranchGe));
        assert_eq!(Some(&1), set.shapes.get(&InstructionShape::Throw));
        // Implicit return at the end of a void method.
        assert_eq!(Some(&1), set.shapes.get(&InstructionShape::Return));
        assert_eq!(
            Some(&1),
            set.object_creations.get("java/lang/IllegalArgumentException")
        );
        assert_eq!(
            Some(&1),
            set.call_sites[0].get("java/lang/IllegalArgumentException/<init>/0")
        );
    }

    #[test]
    fn boolean_values_materialize_one_and_zero() {
        let mut f = Fixture::new("(II)Z");
        let body = f.body;
        let ret = f.add(body, NodeKind::Return);
        let less = f.add(ret, NodeKind::Binary(BinaryOp::Lt));
        f.read(less, "a");
        f.read(less, "b");
        let set = f.extract();
        assert_eq!(Some(&1), set.shapes.get(&InstructionShape::BranchGe));
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(1)));
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(0)));
    }

    #[test]
    fn folded_expressions_contribute_one_constant() {
        let mut f = Fixture::new("()J");
        let body = f.body;
        let decl = f.add(
            body,
            NodeKind::LocalDecl {
                name: "mask".to_string(),
                ty: "long".to_string(),
                is_final: false,
            },
        );
        let shift = f.add(decl, NodeKind::Binary(BinaryOp::Shl));
        f.int(shift, 1);
        f.int(shift, 4);
        let ret = f.add(body, NodeKind::Return);
        f.read(ret, "mask");
        let set = f.extract();
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Long(16)));
        assert_eq!(1, set.constants.len());
        assert_eq!(None, set.shapes.get(&InstructionShape::ShiftLeft));
    }

    #[test]
    fn lambda_bodies_are_skipped() {
        let mut f = Fixture::new("()V");
        let body = f.body;
        let stmt = f.add(body, NodeKind::ExprStmt);
        let lambda = f.add(stmt, NodeKind::Lambda);
        let inner = f.add(
            lambda,
            NodeKind::Invocation {
                owner: "a.Counter".to_string(),
                name: "helper".to_string(),
                arity: 0,
                has_receiver: false,
            },
        );
        f.int(inner, 3);
        let set = f.extract();
        assert!(set.call_sites.is_empty());
        assert!(set.constants.is_empty());
    }
}
