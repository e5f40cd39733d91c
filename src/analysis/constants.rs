//! Constant propagation over a source syntax tree.
//!
//! Expressions are folded bottom-up with Java semantics. Locals are folded
//! by one forward pass per statement block; anything assigned under nested
//! control flow is dropped from the environment once that statement ends,
//! and anything assigned inside a loop is dropped before the loop starts.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::analysis::library::LibraryConstants;
use crate::ir::ConstantValue;
use crate::syntax::{BinaryOp, NodeId, NodeKind, SyntaxTree, UnaryOp};

/// Outcome of folding one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constness {
    Constant(ConstantValue),
    NonConstant,
}

/// Fold results for every visited expression node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantBinding {
    values: BTreeMap<NodeId, Constness>,
    /// Constant nodes that javac would also fold (constant expressions in the JLS sense).
    compile_time: BTreeSet<NodeId>,
}

impl ConstantBinding {
    pub fn get(&self, node: NodeId) -> Option<&Constness> {
        self.values.get(&node)
    }

    pub fn value(&self, node: NodeId) -> Option<&ConstantValue> {
        match self.values.get(&node) {
            Some(Constness::Constant(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_constant(&self, node: NodeId) -> bool {
        self.value(node).is_some()
    }

    /// Whether the compiler inlines this node as a single constant.
    pub fn is_compile_time(&self, node: NodeId) -> bool {
        self.compile_time.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn record(&mut self, node: NodeId, folded: Option<Folded>) -> Option<Folded> {
        match &folded {
            Some(Folded { value, compile_time }) => {
                self.values.insert(node, Constness::Constant(value.clone()));
                if *compile_time {
                    self.compile_time.insert(node);
                }
            }
            None => {
                self.values.insert(node, Constness::NonConstant);
            }
        }
        folded
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Folded {
    value: ConstantValue,
    compile_time: bool,
}

#[derive(Clone, Debug)]
struct LocalValue {
    value: ConstantValue,
    is_final: bool,
}

type Env = BTreeMap<String, LocalValue>;

/// Fold every expression of `tree`.
pub fn propagate_constants(tree: &SyntaxTree, table: &LibraryConstants) -> ConstantBinding {
    let mut folder = Folder {
        tree,
        table,
        fields: fold_constant_fields(tree, table),
        binding: ConstantBinding::default(),
    };
    for root in tree.roots() {
        folder.declarations(*root);
    }
    debug!(
        "folded {} of {} expression nodes in {}",
        folder.binding.values.values().filter(|v| matches!(v, Constness::Constant(_))).count(),
        folder.binding.len(),
        tree.path
    );
    folder.binding
}

/// Final fields, static or instance, of classes in the tree whose initializer folds.
fn fold_constant_fields(
    tree: &SyntaxTree,
    table: &LibraryConstants,
) -> BTreeMap<String, ConstantValue> {
    let candidates: Vec<(String, String, NodeId)> = (0..tree.len())
        .filter_map(|id| {
            let NodeKind::FieldDecl {
                name, ty, is_final, ..
            } = tree.kind(id)
            else {
                return None;
            };
            if !is_final {
                return None;
            }
            let initializer = *tree.children(id).first()?;
            let class = tree.enclosing_class(id)?;
            let NodeKind::Class { name: owner } = tree.kind(class) else {
                return None;
            };
            Some((format!("{owner}#{name}"), ty.clone(), initializer))
        })
        .collect();

    let mut fields = BTreeMap::new();
    // Fields may refer to each other; every round resolves at least one more or stops.
    for _ in 0..=candidates.len() {
        let mut folder = Folder {
            tree,
            table,
            fields: fields.clone(),
            binding: ConstantBinding::default(),
        };
        let mut progressed = false;
        for (key, ty, initializer) in &candidates {
            if fields.contains_key(key) {
                continue;
            }
            let folded = folder.expression(*initializer, &Env::new());
            if let Some(value) = folded
                .filter(|folded| folded.compile_time)
                .and_then(|folded| coerce(ty, &folded.value))
            {
                fields.insert(key.clone(), value);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    fields
}

struct Folder<'a> {
    tree: &'a SyntaxTree,
    table: &'a LibraryConstants,
    fields: BTreeMap<String, ConstantValue>,
    binding: ConstantBinding,
}

impl Folder<'_> {
    /// Walk class members, folding field initializers and method bodies.
    fn declarations(&mut self, node: NodeId) {
        match self.tree.kind(node) {
            NodeKind::Class { .. } => {
                for child in self.tree.children(node).to_vec() {
                    self.declarations(child);
                }
            }
            NodeKind::FieldDecl { .. } => {
                for child in self.tree.children(node).to_vec() {
                    self.expression(child, &Env::new());
                }
            }
            NodeKind::Method { .. } => {
                let mut env = Env::new();
                for child in self.tree.children(node).to_vec() {
                    self.statement(child, &mut env);
                }
            }
            _ => {
                let mut env = Env::new();
                self.statement(node, &mut env);
            }
        }
    }

    fn statement(&mut self, node: NodeId, env: &mut Env) {
        let children = self.tree.children(node).to_vec();
        match self.tree.kind(node).clone() {
            NodeKind::Block => {
                for child in children {
                    self.statement(child, env);
                }
            }
            NodeKind::Class { .. } | NodeKind::Method { .. } | NodeKind::FieldDecl { .. } => {
                self.declarations(node);
            }
            NodeKind::LocalDecl { name, ty, is_final } => {
                let folded = children.first().and_then(|init| {
                    let folded = self.expression(*init, env);
                    self.invalidate_assigned(*init, env);
                    folded
                });
                match folded.and_then(|folded| coerce(&ty, &folded.value)) {
                    Some(value) => {
                        env.insert(name, LocalValue { value, is_final });
                    }
                    None => {
                        env.remove(&name);
                    }
                }
            }
            NodeKind::ExprStmt => {
                for child in children {
                    self.statement(child, env);
                }
            }
            NodeKind::Assign { target, op } => {
                let value = children.first().and_then(|child| self.expression(*child, env));
                if let Some(child) = children.first() {
                    self.invalidate_assigned(*child, env);
                }
                let result = match (op, value) {
                    (None, Some(value)) => Some(value.value),
                    (Some(op), Some(value)) => env.get(&target).and_then(|current| {
                        let result = binary(op, &current.value, &value.value)?;
                        coerce_like(&current.value, result)
                    }),
                    _ => None,
                };
                self.binding.record(
                    node,
                    result.clone().map(|value| Folded {
                        value,
                        compile_time: false,
                    }),
                );
                match result {
                    Some(value) => {
                        env.insert(
                            target,
                            LocalValue {
                                value,
                                is_final: false,
                            },
                        );
                    }
                    None => {
                        env.remove(&target);
                    }
                }
            }
            NodeKind::Loop { .. } => {
                // A loop body may run many times, so nothing it assigns is known on entry.
                self.invalidate_assigned(node, env);
                let mut inner = env.clone();
                for child in children {
                    self.nested(child, &mut inner);
                }
                self.invalidate_assigned(node, env);
            }
            NodeKind::If
            | NodeKind::Switch
            | NodeKind::SwitchCase { .. }
            | NodeKind::Try
            | NodeKind::Catch { .. }
            | NodeKind::Synchronized => {
                let mut inner = env.clone();
                let mut first = true;
                for child in children {
                    // The leading condition or selector runs unconditionally.
                    if first && !self.tree.kind(child).is_statement() {
                        self.expression(child, &inner);
                    } else {
                        let mut branch = inner.clone();
                        self.nested(child, &mut branch);
                        if matches!(self.tree.kind(node), NodeKind::Synchronized) {
                            inner = branch;
                        }
                    }
                    first = false;
                }
                self.invalidate_assigned(node, env);
            }
            NodeKind::Return | NodeKind::Throw => {
                for child in children {
                    self.expression(child, env);
                    self.invalidate_assigned(child, env);
                }
            }
            NodeKind::Break | NodeKind::Continue => {}
            _ => {
                // Expression used as a statement.
                self.expression(node, env);
                self.invalidate_assigned(node, env);
            }
        }
    }

    fn nested(&mut self, node: NodeId, env: &mut Env) {
        match self.tree.kind(node) {
            NodeKind::Condition => {
                for child in self.tree.children(node).to_vec() {
                    self.expression(child, env);
                }
            }
            kind if kind.is_statement() => self.statement(node, env),
            NodeKind::Assign { .. } => self.statement(node, env),
            _ => {
                self.expression(node, env);
            }
        }
    }

    /// Drop every local assigned anywhere below `node`.
    fn invalidate_assigned(&self, node: NodeId, env: &mut Env) {
        for name in assigned_locals(self.tree, node) {
            env.remove(&name);
        }
    }

    fn expression(&mut self, node: NodeId, env: &Env) -> Option<Folded> {
        if self.tree.kind(node).is_statement() {
            let mut scratch = env.clone();
            self.statement(node, &mut scratch);
            return None;
        }
        let folded = self.fold(node, env);
        self.binding.record(node, folded)
    }

    fn fold(&mut self, node: NodeId, env: &Env) -> Option<Folded> {
        let children = self.tree.children(node).to_vec();
        match self.tree.kind(node).clone() {
            NodeKind::Literal(value) => Some(Folded {
                value,
                compile_time: true,
            }),
            NodeKind::LocalRead { name } => env.get(&name).map(|local| Folded {
                value: local.value.clone(),
                compile_time: local.is_final,
            }),
            NodeKind::FieldRead { owner, name, .. } => {
                for child in &children {
                    self.expression(*child, env);
                }
                self.field(&owner, &name)
            }
            NodeKind::Binary(op) => {
                let left = children.first().and_then(|child| self.expression(*child, env));
                let right = children.get(1).and_then(|child| self.expression(*child, env));
                let (left, right) = (left?, right?);
                binary(op, &left.value, &right.value).map(|value| Folded {
                    value,
                    compile_time: left.compile_time && right.compile_time,
                })
            }
            NodeKind::Unary(op) => {
                let operand = children.first().and_then(|child| self.expression(*child, env));
                if op.is_step() {
                    None
                } else {
                    let operand = operand?;
                    unary(op, &operand.value).map(|value| Folded {
                        value,
                        compile_time: operand.compile_time,
                    })
                }
            }
            NodeKind::Conditional => {
                let parts: Vec<Option<Folded>> = children
                    .iter()
                    .map(|child| self.expression(*child, env))
                    .collect();
                match parts.as_slice() {
                    [Some(condition), Some(then), Some(otherwise)] => match condition.value {
                        ConstantValue::Bool(flag) => {
                            let chosen = if flag { then } else { otherwise };
                            Some(Folded {
                                value: chosen.value.clone(),
                                compile_time: condition.compile_time
                                    && then.compile_time
                                    && otherwise.compile_time,
                            })
                        }
                        _ => None,
                    },
                    _ => None,
                }
            }
            NodeKind::Cast { ty } => {
                let operand = children.first().and_then(|child| self.expression(*child, env))?;
                cast(&ty, &operand.value).map(|value| Folded {
                    value,
                    compile_time: operand.compile_time,
                })
            }
            NodeKind::Invocation {
                owner, name, arity, ..
            } => {
                let arguments: Vec<Option<Folded>> = children
                    .iter()
                    .map(|child| self.expression(*child, env))
                    .collect();
                if arity == 0 {
                    self.table.invocation(&owner, &name).cloned().map(|value| Folded {
                        value,
                        compile_time: false,
                    })
                } else if name == "valueOf" && arity == 1 {
                    arguments
                        .last()
                        .cloned()
                        .flatten()
                        .and_then(|argument| boxed(&owner, &argument.value))
                        .map(|value| Folded {
                            value,
                            compile_time: false,
                        })
                } else {
                    None
                }
            }
            NodeKind::ArrayLength => {
                for child in &children {
                    self.expression(*child, env);
                }
                children.first().and_then(|array| match self.tree.kind(*array) {
                    NodeKind::NewArray {
                        has_initializer: true,
                        ..
                    } => Some(Folded {
                        value: ConstantValue::Int(
                            i32::try_from(self.tree.children(*array).len()).ok()?,
                        ),
                        compile_time: false,
                    }),
                    _ => None,
                })
            }
            NodeKind::Assign { .. } => {
                let value = children.first().and_then(|child| self.expression(*child, env));
                value.map(|value| Folded {
                    compile_time: false,
                    ..value
                })
            }
            NodeKind::Lambda => {
                for child in children {
                    let mut lambda_env = Env::new();
                    self.nested(child, &mut lambda_env);
                }
                None
            }
            _ => {
                for child in children {
                    self.expression(child, env);
                }
                None
            }
        }
    }

    fn field(&self, owner: &str, name: &str) -> Option<Folded> {
        let key = format!("{owner}#{name}");
        if let Some(value) = self.table.get(&key) {
            return Some(Folded {
                value: value.clone(),
                compile_time: true,
            });
        }
        if owner.starts_with("java.io.") {
            return None;
        }
        self.fields.get(&key).map(|value| Folded {
            value: value.clone(),
            compile_time: true,
        })
    }
}

/// Compound assignment keeps the type of its target.
fn coerce_like(target: &ConstantValue, value: ConstantValue) -> Option<ConstantValue> {
    match target {
        ConstantValue::Int(_) => cast("int", &value),
        ConstantValue::Long(_) => cast("long", &value),
        ConstantValue::Float(_) => cast("float", &value),
        ConstantValue::Double(_) => cast("double", &value),
        ConstantValue::Char(_) => cast("char", &value),
        _ => Some(value),
    }
}

/// Names of locals assigned anywhere below `node`, including `++`/`--` targets.
pub fn assigned_locals(tree: &SyntaxTree, node: NodeId) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for id in tree.descendants(node) {
        match tree.kind(id) {
            NodeKind::Assign { target, .. } => {
                names.insert(target.clone());
            }
            NodeKind::Unary(op) if op.is_step() => {
                if let Some(NodeKind::LocalRead { name }) =
                    tree.children(id).first().map(|child| tree.kind(*child))
                {
                    names.insert(name.clone());
                }
            }
            _ => {}
        }
    }
    names
}

/// Convert a folded initializer to the declared type, widening int literals.
pub fn coerce(ty: &str, value: &ConstantValue) -> Option<ConstantValue> {
    match ty {
        "int" | "long" | "float" | "double" | "char" | "short" | "byte" => {
            match value {
                ConstantValue::Str(_) | ConstantValue::Bool(_) | ConstantValue::Null => None,
                _ => cast(ty, value),
            }
        }
        "boolean" => match value {
            ConstantValue::Bool(_) => Some(value.clone()),
            _ => None,
        },
        _ => Some(value.clone()),
    }
}

#[derive(Clone, Copy, Debug)]
enum Num {
    I(i32),
    L(i64),
    F(f32),
    D(f64),
}

fn numeric(value: &ConstantValue) -> Option<Num> {
    match value {
        ConstantValue::Int(v) => Some(Num::I(*v)),
        ConstantValue::Char(v) => Some(Num::I(i32::from(*v))),
        ConstantValue::Long(v) => Some(Num::L(*v)),
        ConstantValue::Float(v) => Some(Num::F(*v)),
        ConstantValue::Double(v) => Some(Num::D(*v)),
        _ => None,
    }
}

fn as_f64(num: Num) -> f64 {
    match num {
        Num::I(v) => f64::from(v),
        Num::L(v) => v as f64,
        Num::F(v) => f64::from(v),
        Num::D(v) => v,
    }
}

fn as_f32(num: Num) -> f32 {
    match num {
        Num::I(v) => v as f32,
        Num::L(v) => v as f32,
        Num::F(v) => v,
        Num::D(v) => v as f32,
    }
}

fn as_i64(num: Num) -> i64 {
    match num {
        Num::I(v) => i64::from(v),
        Num::L(v) => v,
        Num::F(v) => v as i64,
        Num::D(v) => v as i64,
    }
}

fn as_i32(num: Num) -> i32 {
    match num {
        Num::I(v) => v,
        Num::L(v) => v as i32,
        Num::F(v) => v as i32,
        Num::D(v) => v as i32,
    }
}

/// Binary numeric promotion.
fn promote(left: Num, right: Num) -> (Num, Num) {
    match (left, right) {
        (Num::D(_), _) | (_, Num::D(_)) => (Num::D(as_f64(left)), Num::D(as_f64(right))),
        (Num::F(_), _) | (_, Num::F(_)) => (Num::F(as_f32(left)), Num::F(as_f32(right))),
        (Num::L(_), _) | (_, Num::L(_)) => (Num::L(as_i64(left)), Num::L(as_i64(right))),
        _ => (Num::I(as_i32(left)), Num::I(as_i32(right))),
    }
}

fn binary(op: BinaryOp, left: &ConstantValue, right: &ConstantValue) -> Option<ConstantValue> {
    use ConstantValue::*;

    if op == BinaryOp::Add && (matches!(left, Str(_)) || matches!(right, Str(_))) {
        return Some(Str(format!("{}{}", java_string(left), java_string(right))));
    }
    match (left, right) {
        (Bool(a), Bool(b)) => {
            return match op {
                BinaryOp::And | BinaryOp::BitAnd => Some(Bool(*a && *b)),
                BinaryOp::Or | BinaryOp::BitOr => Some(Bool(*a || *b)),
                BinaryOp::BitXor | BinaryOp::Ne => Some(Bool(a != b)),
                BinaryOp::Eq => Some(Bool(a == b)),
                _ => None,
            };
        }
        (Str(a), Str(b)) => {
            return match op {
                BinaryOp::Eq => Some(Bool(a == b)),
                BinaryOp::Ne => Some(Bool(a != b)),
                _ => None,
            };
        }
        _ => {}
    }

    let (left, right) = (numeric(left)?, numeric(right)?);
    match op {
        BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr => shift(op, left, right),
        _ if op.is_comparison() => compare(op, left, right).map(Bool),
        _ => arithmetic(op, promote(left, right)),
    }
}

fn shift(op: BinaryOp, left: Num, right: Num) -> Option<ConstantValue> {
    let distance = as_i64(match right {
        Num::I(_) | Num::L(_) => right,
        _ => return None,
    });
    match left {
        Num::I(v) => {
            let distance = (distance & 0x1f) as u32;
            Some(ConstantValue::Int(match op {
                BinaryOp::Shl => v.wrapping_shl(distance),
                BinaryOp::Shr => v.wrapping_shr(distance),
                _ => ((v as u32) >> distance) as i32,
            }))
        }
        Num::L(v) => {
            let distance = (distance & 0x3f) as u32;
            Some(ConstantValue::Long(match op {
                BinaryOp::Shl => v.wrapping_shl(distance),
                BinaryOp::Shr => v.wrapping_shr(distance),
                _ => ((v as u64) >> distance) as i64,
            }))
        }
        _ => None,
    }
}

fn compare(op: BinaryOp, left: Num, right: Num) -> Option<bool> {
    let ordering = match promote(left, right) {
        (Num::I(a), Num::I(b)) => Some(a.cmp(&b)),
        (Num::L(a), Num::L(b)) => Some(a.cmp(&b)),
        (Num::F(a), Num::F(b)) => a.partial_cmp(&b),
        (Num::D(a), Num::D(b)) => a.partial_cmp(&b),
        _ => None,
    };
    // NaN compares unequal to everything.
    let Some(ordering) = ordering else {
        return Some(op == BinaryOp::Ne);
    };
    Some(match op {
        BinaryOp::Eq => ordering.is_eq(),
        BinaryOp::Ne => ordering.is_ne(),
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn arithmetic(op: BinaryOp, operands: (Num, Num)) -> Option<ConstantValue> {
    use ConstantValue::*;

    match operands {
        (Num::I(a), Num::I(b)) => Some(Int(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div if b == 0 => return None,
            BinaryOp::Div => a.wrapping_div(b),
            BinaryOp::Rem if b == 0 => return None,
            BinaryOp::Rem => a.wrapping_rem(b),
            BinaryOp::BitAnd => a & b,
            BinaryOp::BitOr => a | b,
            BinaryOp::BitXor => a ^ b,
            _ => return None,
        })),
        (Num::L(a), Num::L(b)) => Some(Long(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div if b == 0 => return None,
            BinaryOp::Div => a.wrapping_div(b),
            BinaryOp::Rem if b == 0 => return None,
            BinaryOp::Rem => a.wrapping_rem(b),
            BinaryOp::BitAnd => a & b,
            BinaryOp::BitOr => a | b,
            BinaryOp::BitXor => a ^ b,
            _ => return None,
        })),
        (Num::F(a), Num::F(b)) => Some(Float(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            _ => return None,
        })),
        (Num::D(a), Num::D(b)) => Some(Double(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            _ => return None,
        })),
        _ => None,
    }
}

fn unary(op: UnaryOp, value: &ConstantValue) -> Option<ConstantValue> {
    use ConstantValue::*;

    if let (UnaryOp::Not, Bool(flag)) = (op, value) {
        return Some(Bool(!flag));
    }
    let promoted = match numeric(value)? {
        Num::I(v) => Num::I(v),
        other => other,
    };
    match (op, promoted) {
        (UnaryOp::Plus, Num::I(v)) => Some(Int(v)),
        (UnaryOp::Plus, _) => Some(value.clone()),
        (UnaryOp::Neg, Num::I(v)) => Some(Int(v.wrapping_neg())),
        (UnaryOp::Neg, Num::L(v)) => Some(Long(v.wrapping_neg())),
        (UnaryOp::Neg, Num::F(v)) => Some(Float(-v)),
        (UnaryOp::Neg, Num::D(v)) => Some(Double(-v)),
        (UnaryOp::BitNot, Num::I(v)) => Some(Int(!v)),
        (UnaryOp::BitNot, Num::L(v)) => Some(Long(!v)),
        _ => None,
    }
}

/// Primitive and String casts.
fn cast(ty: &str, value: &ConstantValue) -> Option<ConstantValue> {
    use ConstantValue::*;

    if matches!(ty, "String" | "java.lang.String") {
        return matches!(value, Str(_)).then(|| value.clone());
    }
    if ty == "boolean" {
        return matches!(value, Bool(_)).then(|| value.clone());
    }
    let num = numeric(value)?;
    Some(match ty {
        "int" => Int(as_i32(num)),
        "long" => Long(as_i64(num)),
        "float" => Float(as_f32(num)),
        "double" => Double(as_f64(num)),
        "short" => Int(i32::from(as_i32(num) as i16)),
        "byte" => Int(i32::from(as_i32(num) as i8)),
        "char" => Char(as_i32(num) as u16),
        _ => return None,
    })
}

/// Result of `Owner.valueOf(argument)` for wrapper types and `String`.
fn boxed(owner: &str, argument: &ConstantValue) -> Option<ConstantValue> {
    let simple = owner.rsplit(['.', '/']).next().unwrap_or(owner);
    match simple {
        "Integer" => cast("int", argument),
        "Long" => cast("long", argument),
        "Float" => cast("float", argument),
        "Double" => cast("double", argument),
        "Short" => cast("short", argument),
        "Byte" => cast("byte", argument),
        "Character" => matches!(argument, ConstantValue::Char(_)).then(|| argument.clone()),
        "Boolean" => matches!(argument, ConstantValue::Bool(_)).then(|| argument.clone()),
        "String" => Some(ConstantValue::Str(java_string(argument))),
        _ => None,
    }
}

/// `String.valueOf` formatting of a constant.
pub fn java_string(value: &ConstantValue) -> String {
    match value {
        ConstantValue::Int(v) => v.to_string(),
        ConstantValue::Long(v) => v.to_string(),
        ConstantValue::Float(v) => java_float(f64::from(*v), format!("{v}"), format!("{v:e}")),
        ConstantValue::Double(v) => java_float(*v, format!("{v}"), format!("{v:e}")),
        ConstantValue::Bool(v) => v.to_string(),
        ConstantValue::Char(v) => char::from_u32(u32::from(*v))
            .map(String::from)
            .unwrap_or_default(),
        ConstantValue::Str(v) => v.clone(),
        ConstantValue::Null => "null".to_string(),
    }
}

fn java_float(value: f64, plain: String, scientific: String) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = value.abs();
    if value == 0.0 || (1e-3..1e7).contains(&magnitude) {
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        let (mantissa, exponent) = scientific
            .split_once('e')
            .unwrap_or((scientific.as_str(), "0"));
        if mantissa.contains('.') {
            format!("{mantissa}E{exponent}")
        } else {
            format!("{mantissa}.0E{exponent}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::LineSpan;

    struct Builder {
        tree: SyntaxTree,
        body: NodeId,
    }

    impl Builder {
        fn new() -> Self {
            let mut tree = SyntaxTree::new("src/a/Sample.java", 40);
            let class = tree.push(
                None,
                NodeKind::Class {
                    name: "a.Sample".to_string(),
                },
                LineSpan::new(1, 40),
            );
            let method = tree.push(
                Some(class),
                NodeKind::Method {
                    name: "run".to_string(),
                    descriptor: "()V".to_string(),
                    is_static: true,
                },
                LineSpan::new(2, 39),
            );
            let body = tree.push(Some(method), NodeKind::Block, LineSpan::new(2, 39));
            Self { tree, body }
        }

        fn at(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
            self.tree.push(Some(parent), kind, LineSpan::line(3))
        }

        fn literal(&mut self, parent: NodeId, value: ConstantValue) -> NodeId {
            self.at(parent, NodeKind::Literal(value))
        }

        fn local(&mut self, parent: NodeId, name: &str, ty: &str) -> NodeId {
            self.at(
                parent,
                NodeKind::LocalDecl {
                    name: name.to_string(),
                    ty: ty.to_string(),
                    is_final: false,
                },
            )
        }

        fn read(&mut self, parent: NodeId, name: &str) -> NodeId {
            self.at(
                parent,
                NodeKind::LocalRead {
                    name: name.to_string(),
                },
            )
        }

        fn fold(&self) -> ConstantBinding {
            propagate_constants(&self.tree, &LibraryConstants::builtin())
        }
    }

    #[test]
    fn arithmetic_follows_precedence_tree() {
        let mut b = Builder::new();
        let stmt = b.at(b.body, NodeKind::ExprStmt);
        let add = b.at(stmt, NodeKind::Binary(BinaryOp::Add));
        b.literal(add, ConstantValue::Int(1));
        let mul = b.at(add, NodeKind::Binary(BinaryOp::Mul));
        b.literal(mul, ConstantValue::Int(2));
        b.literal(mul, ConstantValue::Int(3));
        let binding = b.fold();
        assert_eq!(Some(&ConstantValue::Int(7)), binding.value(add));
        assert!(binding.is_compile_time(add));
    }

    #[test]
    fn int_arithmetic_wraps() {
        assert_eq!(
            Some(ConstantValue::Int(i32::MIN)),
            binary(BinaryOp::Add, &ConstantValue::Int(i32::MAX), &ConstantValue::Int(1))
        );
        assert_eq!(
            Some(ConstantValue::Int(i32::MIN)),
            binary(BinaryOp::Div, &ConstantValue::Int(i32::MIN), &ConstantValue::Int(-1))
        );
        assert_eq!(
            None,
            binary(BinaryOp::Div, &ConstantValue::Int(1), &ConstantValue::Int(0))
        );
        assert_eq!(
            Some(ConstantValue::Int(2)),
            binary(BinaryOp::Shl, &ConstantValue::Int(1), &ConstantValue::Int(33))
        );
        assert_eq!(
            Some(ConstantValue::Int(0x7fff_ffff)),
            binary(BinaryOp::UShr, &ConstantValue::Int(-1), &ConstantValue::Int(1))
        );
        assert_eq!(
            Some(ConstantValue::Double(f64::INFINITY)),
            binary(BinaryOp::Div, &ConstantValue::Double(1.0), &ConstantValue::Int(0))
        );
    }

    #[test]
    fn concatenation_uses_java_formatting() {
        assert_eq!(
            Some(ConstantValue::Str("v1.0".to_string())),
            binary(
                BinaryOp::Add,
                &ConstantValue::Str("v".to_string()),
                &ConstantValue::Double(1.0)
            )
        );
        assert_eq!("1.0E10", java_string(&ConstantValue::Double(1e10)));
        assert_eq!("1.0E-4", java_string(&ConstantValue::Double(0.0001)));
        assert_eq!("0.5", java_string(&ConstantValue::Float(0.5)));
        assert_eq!("a", java_string(&ConstantValue::Char(u16::from(b'a'))));
        assert_eq!(
            Some(ConstantValue::Str("x1true".to_string())),
            binary(
                BinaryOp::Add,
                &ConstantValue::Str("x1".to_string()),
                &ConstantValue::Bool(true)
            )
        );
    }

    #[test]
    fn unknown_external_field_is_not_constant() {
        let mut b = Builder::new();
        let stmt = b.at(b.body, NodeKind::ExprStmt);
        let known = b.at(
            stmt,
            NodeKind::FieldRead {
                owner: "java.lang.Integer".to_string(),
                name: "MAX_VALUE".to_string(),
                is_static: true,
            },
        );
        let stmt = b.at(b.body, NodeKind::ExprStmt);
        let unknown = b.at(
            stmt,
            NodeKind::FieldRead {
                owner: "org.other.Config".to_string(),
                name: "LIMIT".to_string(),
                is_static: true,
            },
        );
        let binding = b.fold();
        assert_eq!(Some(&ConstantValue::Int(i32::MAX)), binding.value(known));
        assert_eq!(Some(&Constness::NonConstant), binding.get(unknown));
    }

    #[test]
    fn final_fields_in_the_same_tree_fold() {
        let mut b = Builder::new();
        let class = 0;
        let field = b.tree.push(
            Some(class),
            NodeKind::FieldDecl {
                name: "LIMIT".to_string(),
                ty: "long".to_string(),
                is_static: true,
                is_final: true,
            },
            LineSpan::line(2),
        );
        b.literal(field, ConstantValue::Int(8));
        let stmt = b.at(b.body, NodeKind::ExprStmt);
        let read = b.at(
            stmt,
            NodeKind::FieldRead {
                owner: "a.Sample".to_string(),
                name: "LIMIT".to_string(),
                is_static: true,
            },
        );
        let binding = b.fold();
        assert_eq!(Some(&ConstantValue::Long(8)), binding.value(read));
    }

    #[test]
    fn instance_final_fields_fold_like_static_ones() {
        let mut b = Builder::new();
        let class = 0;
        let field = b.tree.push(
            Some(class),
            NodeKind::FieldDecl {
                name: "width".to_string(),
                ty: "int".to_string(),
                is_static: false,
                is_final: true,
            },
            LineSpan::line(2),
        );
        b.literal(field, ConstantValue::Int(3));
        let mutable = b.tree.push(
            Some(class),
            NodeKind::FieldDecl {
                name: "height".to_string(),
                ty: "int".to_string(),
                is_static: false,
                is_final: false,
            },
            LineSpan::line(3),
        );
        b.literal(mutable, ConstantValue::Int(4));
        let stmt = b.at(b.body, NodeKind::ExprStmt);
        let width = b.at(
            stmt,
            NodeKind::FieldRead {
                owner: "a.Sample".to_string(),
                name: "width".to_string(),
                is_static: false,
            },
        );
        let other = b.at(b.body, NodeKind::ExprStmt);
        let height = b.at(
            other,
            NodeKind::FieldRead {
                owner: "a.Sample".to_string(),
                name: "height".to_string(),
                is_static: false,
            },
        );
        let binding = b.fold();
        assert_eq!(Some(&ConstantValue::Int(3)), binding.value(width));
        assert_eq!(Some(&Constness::NonConstant), binding.get(height));
    }

    #[test]
    fn straight_line_locals_fold() {
        let mut b = Builder::new();
        let decl = b.local(b.body, "x", "int");
        b.literal(decl, ConstantValue::Int(4));
        let stmt = b.at(b.body, NodeKind::ExprStmt);
        let sum = b.at(stmt, NodeKind::Binary(BinaryOp::Add));
        let read = b.read(sum, "x");
        b.literal(sum, ConstantValue::Int(1));
        let binding = b.fold();
        assert_eq!(Some(&ConstantValue::Int(5)), binding.value(sum));
        assert!(!binding.is_compile_time(sum));
        assert_eq!(Some(&ConstantValue::Int(4)), binding.value(read));
    }

    #[test]
    fn locals_assigned_in_loops_are_not_folded() {
        let mut b = Builder::new();
        let decl = b.local(b.body, "i", "int");
        b.literal(decl, ConstantValue::Int(0));
        let lp = b.at(b.body, NodeKind::Loop { kind: crate::syntax::LoopKind::While });
        let condition = b.at(lp, NodeKind::Condition);
        let less = b.at(condition, NodeKind::Binary(BinaryOp::Lt));
        let in_condition = b.read(less, "i");
        b.literal(less, ConstantValue::Int(10));
        let body = b.at(lp, NodeKind::Block);
        let stmt = b.at(body, NodeKind::ExprStmt);
        let step = b.at(stmt, NodeKind::Unary(UnaryOp::PostIncrement));
        b.read(step, "i");
        let after = b.at(b.body, NodeKind::ExprStmt);
        let after_read = b.read(after, "i");
        let binding = b.fold();
        assert_eq!(Some(&Constness::NonConstant), binding.get(in_condition));
        assert_eq!(Some(&Constness::NonConstant), binding.get(after_read));
        assert_eq!(Some(&Constness::NonConstant), binding.get(less));
    }

    #[test]
    fn branch_assignments_invalidate_after_the_statement() {
        let mut b = Builder::new();
        let decl = b.local(b.body, "x", "int");
        b.literal(decl, ConstantValue::Int(1));
        let branch = b.at(b.body, NodeKind::If);
        b.literal(branch, ConstantValue::Bool(true));
        let then = b.at(branch, NodeKind::Block);
        let stmt = b.at(then, NodeKind::ExprStmt);
        let assign = b.at(
            stmt,
            NodeKind::Assign {
                target: "x".to_string(),
                op: None,
            },
        );
        b.literal(assign, ConstantValue::Int(2));
        let inner = b.at(then, NodeKind::ExprStmt);
        let inner_read = b.read(inner, "x");
        let after = b.at(b.body, NodeKind::ExprStmt);
        let after_read = b.read(after, "x");
        let binding = b.fold();
        assert_eq!(Some(&ConstantValue::Int(2)), binding.value(inner_read));
        assert_eq!(Some(&Constness::NonConstant), binding.get(after_read));
    }

    #[test]
    fn boxing_and_array_length_fold() {
        let mut b = Builder::new();
        let stmt = b.at(b.body, NodeKind::ExprStmt);
        let boxed = b.at(
            stmt,
            NodeKind::Invocation {
                owner: "java.lang.Long".to_string(),
                name: "valueOf".to_string(),
                arity: 1,
                has_receiver: false,
            },
        );
        b.literal(boxed, ConstantValue::Int(3));
        let stmt = b.at(b.body, NodeKind::ExprStmt);
        let length = b.at(stmt, NodeKind::ArrayLength);
        let array = b.at(
            length,
            NodeKind::NewArray {
                element: "int".to_string(),
                has_initializer: true,
            },
        );
        b.literal(array, ConstantValue::Int(1));
        b.literal(array, ConstantValue::Int(2));
        let binding = b.fold();
        assert_eq!(Some(&ConstantValue::Long(3)), binding.value(boxed));
        assert_eq!(Some(&ConstantValue::Int(2)), binding.value(length));
    }

    #[test]
    fn casts_truncate_like_java() {
        assert_eq!(Some(ConstantValue::Int(-128)), cast("byte", &ConstantValue::Int(128)));
        assert_eq!(Some(ConstantValue::Int(3)), cast("int", &ConstantValue::Double(3.9)));
        assert_eq!(Some(ConstantValue::Int(0)), cast("int", &ConstantValue::Double(f64::NAN)));
        assert_eq!(
            Some(ConstantValue::Char(u16::from(b'A'))),
            cast("char", &ConstantValue::Int(65))
        );
    }
}
