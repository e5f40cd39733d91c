//! Forward abstract interpretation of the operand stack and local variables.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use jdescriptor::{MethodDescriptor, TypeDescriptor};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, AnalysisResult};
use crate::ir::{
    BlockTarget, ConstantValue, EdgeKind, ExceptionHandler, Instruction, InstructionGraph,
    InstructionKind, MethodSignature, descriptor_text,
};
use crate::opcodes::{self, Produced, StackRule};

const OBJECT: &str = "java/lang/Object";
const THROWABLE: &str = "java/lang/Throwable";

/// Abstract value of a stack entry or local variable.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Null,
    /// Internal class name or array descriptor.
    Reference(String),
    ReturnAddress,
    Unknown,
}

impl ValueKind {
    pub fn join(&self, other: &ValueKind) -> ValueKind {
        match (self, other) {
            (a, b) if a == b => a.clone(),
            (ValueKind::Null, ValueKind::Reference(name))
            | (ValueKind::Reference(name), ValueKind::Null) => ValueKind::Reference(name.clone()),
            (ValueKind::Reference(_), ValueKind::Reference(_)) => {
                ValueKind::Reference(OBJECT.to_string())
            }
            _ => ValueKind::Unknown,
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, ValueKind::Long | ValueKind::Double)
    }

    fn from_descriptor(descriptor: &TypeDescriptor) -> ValueKind {
        match descriptor {
            TypeDescriptor::Byte
            | TypeDescriptor::Char
            | TypeDescriptor::Integer
            | TypeDescriptor::Short
            | TypeDescriptor::Boolean => ValueKind::Int,
            TypeDescriptor::Long => ValueKind::Long,
            TypeDescriptor::Float => ValueKind::Float,
            TypeDescriptor::Double => ValueKind::Double,
            TypeDescriptor::Object(name) => ValueKind::Reference(name.clone()),
            TypeDescriptor::Array(..) => ValueKind::Reference(descriptor_text(descriptor)),
            TypeDescriptor::Void => ValueKind::Unknown,
        }
    }

    /// Kind of a value whose field descriptor is `text`.
    fn parse(text: &str) -> Option<ValueKind> {
        text.parse::<TypeDescriptor>()
            .ok()
            .map(|descriptor| ValueKind::from_descriptor(&descriptor))
    }

    fn from_produced(produced: Produced) -> ValueKind {
        match produced {
            Produced::Int => ValueKind::Int,
            Produced::Long => ValueKind::Long,
            Produced::Float => ValueKind::Float,
            Produced::Double => ValueKind::Double,
            Produced::Reference => ValueKind::Reference(OBJECT.to_string()),
            Produced::Null => ValueKind::Null,
        }
    }

    fn from_constant(value: &ConstantValue) -> ValueKind {
        match value {
            ConstantValue::Int(_) | ConstantValue::Bool(_) | ConstantValue::Char(_) => {
                ValueKind::Int
            }
            ConstantValue::Long(_) => ValueKind::Long,
            ConstantValue::Float(_) => ValueKind::Float,
            ConstantValue::Double(_) => ValueKind::Double,
            ConstantValue::Str(_) => ValueKind::Reference("java/lang/String".to_string()),
            ConstantValue::Null => ValueKind::Null,
        }
    }
}

/// Options for [`analyze_operand_types`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeOptions {
    /// Fail on opcodes without a transfer rule.
    pub strict: bool,
    /// Maximum number of block visits.
    pub cap: usize,
}

/// Abstract state at the entry of one block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameState {
    pub stack: Vec<ValueKind>,
    pub locals: Vec<ValueKind>,
}

impl FrameState {
    fn join(&self, other: &FrameState) -> FrameState {
        FrameState {
            stack: join_slots(&self.stack, &other.stack),
            locals: join_slots(&self.locals, &other.locals),
        }
    }
}

/// Slot-wise join; slots present on only one side degrade to unknown.
fn join_slots(left: &[ValueKind], right: &[ValueKind]) -> Vec<ValueKind> {
    let width = left.len().max(right.len());
    (0..width)
        .map(|slot| match (left.get(slot), right.get(slot)) {
            (Some(a), Some(b)) => a.join(b),
            _ => ValueKind::Unknown,
        })
        .collect()
}

/// Operand types inferred for one method.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandTypeBinding {
    /// Entry frame per reachable block.
    pub entries: BTreeMap<usize, FrameState>,
    /// Argument kinds of each invocation, receiver first, keyed by offset.
    pub call_arguments: BTreeMap<u32, Vec<ValueKind>>,
    /// Offsets whose opcode had no transfer rule.
    pub degraded: BTreeSet<u32>,
}

impl OperandTypeBinding {
    /// Kind of `slot` (0 = bottom) on the stack at entry of `block`.
    pub fn entry_stack(&self, block: usize, slot: usize) -> Option<&ValueKind> {
        self.entries.get(&block)?.stack.get(slot)
    }

    pub fn entry_local(&self, block: usize, index: usize) -> Option<&ValueKind> {
        self.entries.get(&block)?.locals.get(index)
    }
}

/// Infer stack and local kinds at every block entry.
pub fn analyze_operand_types(
    graph: &InstructionGraph,
    signature: &MethodSignature,
    options: TypeOptions,
) -> AnalysisResult<OperandTypeBinding> {
    analyze_with_handlers(graph, signature, &[], options)
}

/// Like [`analyze_operand_types`], seeding handler entries with their catch types.
pub fn analyze_with_handlers(
    graph: &InstructionGraph,
    signature: &MethodSignature,
    handlers: &[ExceptionHandler],
    options: TypeOptions,
) -> AnalysisResult<OperandTypeBinding> {
    let mut binding = OperandTypeBinding::default();
    if graph.is_empty() {
        return Ok(binding);
    }
    let descriptor = parse_method(&signature.descriptor, 0)?;
    let mut locals = Vec::new();
    if !signature.is_static {
        locals.push(ValueKind::Reference(signature.owner.clone()));
    }
    for parameter in descriptor.parameter_types() {
        let kind = ValueKind::from_descriptor(parameter);
        let wide = kind.is_wide();
        locals.push(kind);
        if wide {
            locals.push(ValueKind::Unknown);
        }
    }

    let catch_types: BTreeMap<usize, String> = handlers
        .iter()
        .filter_map(|handler| {
            let block = graph.block_of_offset(handler.handler_pc)?;
            let name = handler
                .catch_type
                .clone()
                .unwrap_or_else(|| THROWABLE.to_string());
            Some((block, name))
        })
        .collect();

    let entry = graph.entry();
    binding.entries.insert(
        entry,
        FrameState {
            stack: Vec::new(),
            locals,
        },
    );
    let mut queue = VecDeque::from([entry]);
    let mut queued = BTreeSet::from([entry]);
    let mut visits = 0;
    while let Some(index) = queue.pop_front() {
        queued.remove(&index);
        if visits >= options.cap {
            return Err(AnalysisError::Convergence {
                analysis: "operand types",
                iterations: visits,
            });
        }
        visits += 1;

        let Some(block) = graph.block(index) else {
            continue;
        };
        let Some(state) = binding.entries.get(&index).cloned() else {
            continue;
        };
        let mut frame = Frame::from(state.clone());
        for inst in &block.instructions {
            frame.execute(inst, options.strict, &mut binding)?;
        }

        for successor in &block.successors {
            let BlockTarget::Block(target) = successor.target else {
                continue;
            };
            let incoming = if successor.kind == EdgeKind::Exception {
                let name = catch_types
                    .get(&target)
                    .cloned()
                    .unwrap_or_else(|| THROWABLE.to_string());
                // Handler locals may come from anywhere inside the protected block.
                FrameState {
                    stack: vec![ValueKind::Reference(name)],
                    locals: join_slots(&state.locals, &frame.locals),
                }
            } else {
                FrameState {
                    stack: frame.stack.clone(),
                    locals: frame.locals.clone(),
                }
            };
            let merged = match binding.entries.get(&target) {
                Some(existing) => existing.join(&incoming),
                None => incoming,
            };
            if binding.entries.get(&target) != Some(&merged) {
                binding.entries.insert(target, merged);
                if queued.insert(target) {
                    queue.push_back(target);
                }
            }
        }
    }

    debug!(
        "operand types for {} converged after {visits} block visits",
        signature.key()
    );
    Ok(binding)
}

struct Frame {
    stack: Vec<ValueKind>,
    locals: Vec<ValueKind>,
}

impl From<FrameState> for Frame {
    fn from(state: FrameState) -> Self {
        Self {
            stack: state.stack,
            locals: state.locals,
        }
    }
}

impl Frame {
    fn pop(&mut self) -> ValueKind {
        self.stack.pop().unwrap_or(ValueKind::Unknown)
    }

    fn pop_n(&mut self, count: usize) -> Vec<ValueKind> {
        let split = self.stack.len().saturating_sub(count);
        let mut popped = self.stack.split_off(split);
        while popped.len() < count {
            popped.insert(0, ValueKind::Unknown);
        }
        popped
    }

    fn push(&mut self, kind: ValueKind) {
        self.stack.push(kind);
    }

    fn local(&self, index: usize) -> ValueKind {
        self.locals.get(index).cloned().unwrap_or(ValueKind::Unknown)
    }

    fn store(&mut self, index: usize, kind: ValueKind) {
        let width = if kind.is_wide() { index + 2 } else { index + 1 };
        if self.locals.len() < width {
            self.locals.resize(width, ValueKind::Unknown);
        }
        // Overwriting the upper half of a wide value invalidates it.
        if index > 0 && self.locals[index - 1].is_wide() {
            self.locals[index - 1] = ValueKind::Unknown;
        }
        let wide = kind.is_wide();
        self.locals[index] = kind;
        if wide {
            self.locals[index + 1] = ValueKind::Unknown;
        }
    }

    fn execute(
        &mut self,
        inst: &Instruction,
        strict: bool,
        binding: &mut OperandTypeBinding,
    ) -> AnalysisResult<()> {
        let Some(rule) = opcodes::stack_rule(inst.opcode) else {
            return self.degrade(inst, strict, binding);
        };
        match rule {
            StackRule::Fixed { pops, push } => {
                self.pop_n(usize::from(pops));
                if let Some(produced) = push {
                    self.push(ValueKind::from_produced(produced));
                }
            }
            StackRule::LoadLocal(produced) => {
                let index = local_index(inst);
                let stored = self.local(index);
                let kind = match produced {
                    Produced::Reference => match stored {
                        ValueKind::Reference(_) | ValueKind::Null | ValueKind::ReturnAddress => {
                            stored
                        }
                        _ => ValueKind::Reference(OBJECT.to_string()),
                    },
                    other => ValueKind::from_produced(other),
                };
                self.push(kind);
            }
            StackRule::StoreLocal => {
                let value = self.pop();
                self.store(local_index(inst), value);
            }
            StackRule::ArrayLoad(produced) => {
                self.pop_n(2);
                self.push(ValueKind::from_produced(produced));
            }
            StackRule::ReferenceArrayLoad => {
                self.pop();
                let array = self.pop();
                let element = match array {
                    ValueKind::Reference(descriptor) if descriptor.starts_with('[') => {
                        ValueKind::parse(&descriptor[1..])
                            .unwrap_or_else(|| ValueKind::Reference(OBJECT.to_string()))
                    }
                    _ => ValueKind::Reference(OBJECT.to_string()),
                };
                self.push(element);
            }
            StackRule::Constant => {
                let kind = match &inst.kind {
                    InstructionKind::Constant(value) => ValueKind::from_constant(value),
                    InstructionKind::Type(_) => ValueKind::Reference("java/lang/Class".to_string()),
                    _ => ValueKind::Unknown,
                };
                self.push(kind);
            }
            StackRule::Pop2 => {
                if !self.pop().is_wide() {
                    self.pop();
                }
            }
            StackRule::Dup => {
                let top = self.pop();
                self.push(top.clone());
                self.push(top);
            }
            StackRule::DupX1 => {
                let v1 = self.pop();
                let v2 = self.pop();
                self.stack.extend([v1.clone(), v2, v1]);
            }
            StackRule::DupX2 => {
                let v1 = self.pop();
                let v2 = self.pop();
                if v2.is_wide() {
                    self.stack.extend([v1.clone(), v2, v1]);
                } else {
                    let v3 = self.pop();
                    self.stack.extend([v1.clone(), v3, v2, v1]);
                }
            }
            StackRule::Dup2 => {
                let v1 = self.pop();
                if v1.is_wide() {
                    self.stack.extend([v1.clone(), v1]);
                } else {
                    let v2 = self.pop();
                    self.stack.extend([v2.clone(), v1.clone(), v2, v1]);
                }
            }
            StackRule::Dup2X1 => {
                let v1 = self.pop();
                if v1.is_wide() {
                    let v2 = self.pop();
                    self.stack.extend([v1.clone(), v2, v1]);
                } else {
                    let v2 = self.pop();
                    let v3 = self.pop();
                    self.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                }
            }
            StackRule::Dup2X2 => {
                let v1 = self.pop();
                let top: Vec<ValueKind> = if v1.is_wide() {
                    vec![v1]
                } else {
                    let v2 = self.pop();
                    vec![v2, v1]
                };
                let v3 = self.pop();
                let under: Vec<ValueKind> = if v3.is_wide() {
                    vec![v3]
                } else {
                    let v4 = self.pop();
                    vec![v4, v3]
                };
                self.stack.extend(top.iter().cloned());
                self.stack.extend(under);
                self.stack.extend(top);
            }
            StackRule::Swap => {
                let v1 = self.pop();
                let v2 = self.pop();
                self.stack.extend([v1, v2]);
            }
            StackRule::Increment => {
                if let InstructionKind::Increment { index, .. } = inst.kind {
                    self.store(usize::from(index), ValueKind::Int);
                }
            }
            StackRule::GetField { receiver } => {
                if receiver {
                    self.pop();
                }
                self.push(field_kind(inst));
            }
            StackRule::PutField { receiver } => {
                self.pop();
                if receiver {
                    self.pop();
                }
            }
            StackRule::Invoke { receiver } => {
                let InstructionKind::Invoke(call) = &inst.kind else {
                    return Err(AnalysisError::malformed_bytecode(
                        inst.offset,
                        "invocation without call site",
                    ));
                };
                let descriptor = parse_method(&call.descriptor, inst.offset)?;
                let count = descriptor.parameter_types().len() + usize::from(receiver);
                let arguments = self.pop_n(count);
                binding.call_arguments.insert(inst.offset, arguments);
                match descriptor.return_type() {
                    TypeDescriptor::Void => {}
                    returned => self.push(ValueKind::from_descriptor(returned)),
                }
            }
            StackRule::New => self.push(type_operand(inst)),
            StackRule::NewArray => {
                self.pop();
                let kind = match inst.kind {
                    InstructionKind::NewArray(array) => {
                        ValueKind::Reference(array.descriptor().to_string())
                    }
                    _ => ValueKind::Reference(OBJECT.to_string()),
                };
                self.push(kind);
            }
            StackRule::ReferenceArray => {
                self.pop();
                let kind = match &inst.kind {
                    InstructionKind::Type(name) if name.starts_with('[') => {
                        ValueKind::Reference(format!("[{name}"))
                    }
                    InstructionKind::Type(name) => ValueKind::Reference(format!("[L{name};")),
                    _ => ValueKind::Reference(OBJECT.to_string()),
                };
                self.push(kind);
            }
            StackRule::MultiArray => {
                let (descriptor, dimensions) = match &inst.kind {
                    InstructionKind::MultiNewArray {
                        descriptor,
                        dimensions,
                    } => (descriptor.clone(), usize::from(*dimensions)),
                    _ => (OBJECT.to_string(), 1),
                };
                self.pop_n(dimensions);
                self.push(ValueKind::Reference(descriptor));
            }
            StackRule::CheckCast => {
                self.pop();
                self.push(type_operand(inst));
            }
            StackRule::Jsr => self.push(ValueKind::ReturnAddress),
            StackRule::Ret => {}
        }
        Ok(())
    }

    fn degrade(
        &mut self,
        inst: &Instruction,
        strict: bool,
        binding: &mut OperandTypeBinding,
    ) -> AnalysisResult<()> {
        if strict {
            return Err(AnalysisError::UnsupportedOpcode {
                opcode: inst.opcode,
                offset: inst.offset,
            });
        }
        warn!(
            "no transfer rule for opcode 0x{:02x} at offset {}, operand types degrade to unknown",
            inst.opcode, inst.offset
        );
        binding.degraded.insert(inst.offset);
        match inst.stack_effect {
            Some(effect) => {
                self.pop_n(usize::from(effect.pops));
                for _ in 0..effect.pushes {
                    self.push(ValueKind::Unknown);
                }
            }
            None => {
                for slot in self.stack.iter_mut() {
                    *slot = ValueKind::Unknown;
                }
            }
        }
        Ok(())
    }
}

fn local_index(inst: &Instruction) -> usize {
    match inst.kind {
        InstructionKind::Local { index } => usize::from(index),
        _ => match inst.opcode {
            opcodes::ILOAD_0..=0x2d => usize::from((inst.opcode - opcodes::ILOAD_0) % 4),
            opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
                usize::from((inst.opcode - opcodes::ISTORE_0) % 4)
            }
            _ => 0,
        },
    }
}

fn field_kind(inst: &Instruction) -> ValueKind {
    match &inst.kind {
        InstructionKind::Field(field) => {
            ValueKind::parse(&field.descriptor).unwrap_or(ValueKind::Unknown)
        }
        _ => ValueKind::Unknown,
    }
}

fn parse_method(text: &str, offset: u32) -> AnalysisResult<MethodDescriptor> {
    text.parse::<MethodDescriptor>().map_err(|_| {
        AnalysisError::malformed_bytecode(offset, format!("invalid descriptor `{text}`"))
    })
}

fn type_operand(inst: &Instruction) -> ValueKind {
    match &inst.kind {
        InstructionKind::Type(name) => ValueKind::Reference(name.clone()),
        _ => ValueKind::Reference(OBJECT.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_graph;
    use crate::ir::{CallKind, CallSite, FieldRef, StackEffect};

    fn signature(descriptor: &str, is_static: bool) -> MethodSignature {
        MethodSignature {
            owner: "a/Sample".to_string(),
            name: "run".to_string(),
            descriptor: descriptor.to_string(),
            is_static,
        }
    }

    fn options() -> TypeOptions {
        TypeOptions {
            strict: false,
            cap: 256,
        }
    }

    fn branch(offset: u32, opcode: u8, target: u32) -> Instruction {
        Instruction::new(offset, opcode, InstructionKind::Branch { target })
    }

    #[test]
    fn join_follows_lattice() {
        let string = ValueKind::Reference("java/lang/String".to_string());
        let list = ValueKind::Reference("java/util/List".to_string());
        assert_eq!(string, ValueKind::Null.join(&string));
        assert_eq!(
            ValueKind::Reference(OBJECT.to_string()),
            string.join(&list)
        );
        assert_eq!(ValueKind::Unknown, ValueKind::Int.join(&ValueKind::Float));
        assert_eq!(ValueKind::Long, ValueKind::Long.join(&ValueKind::Long));
    }

    #[test]
    fn parameters_seed_locals_with_wide_slots() {
        let instructions = vec![Instruction::simple(0, opcodes::RETURN)];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let binding = analyze_operand_types(&graph, &signature("(JI)V", false), options())
            .expect("types");
        assert_eq!(
            Some(&ValueKind::Reference("a/Sample".to_string())),
            binding.entry_local(0, 0)
        );
        assert_eq!(Some(&ValueKind::Long), binding.entry_local(0, 1));
        assert_eq!(Some(&ValueKind::Int), binding.entry_local(0, 3));
    }

    #[test]
    fn conflicting_branches_join_to_unknown() {
        // iload_0; ifeq L; iconst_1; goto J; L: fconst_0; J: pop; return
        let instructions = vec![
            Instruction::simple(0, opcodes::ILOAD_0),
            branch(1, opcodes::IFEQ, 8),
            Instruction::simple(4, opcodes::ICONST_1),
            branch(5, opcodes::GOTO, 9),
            Instruction::simple(8, opcodes::FCONST_0),
            Instruction::simple(9, opcodes::POP),
            Instruction::simple(10, opcodes::RETURN),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let binding =
            analyze_operand_types(&graph, &signature("(I)V", true), options()).expect("types");
        let join = graph.block_of_offset(9).expect("join block");
        assert_eq!(Some(&ValueKind::Unknown), binding.entry_stack(join, 0));
    }

    #[test]
    fn loop_state_stays_sound() {
        // aconst_null; astore_1; L: aload_1; ifnonnull X; new String; astore_1; goto L; X: return
        let instructions = vec![
            Instruction::simple(0, opcodes::ACONST_NULL),
            Instruction::simple(1, 0x4c),
            Instruction::simple(2, 0x2b),
            branch(3, opcodes::IFNONNULL, 13),
            Instruction::new(6, opcodes::NEW, InstructionKind::Type("java/lang/String".to_string())),
            Instruction::simple(9, 0x4c),
            branch(10, opcodes::GOTO, 2),
            Instruction::simple(13, opcodes::RETURN),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let binding =
            analyze_operand_types(&graph, &signature("()V", true), options()).expect("types");
        let header = graph.block_of_offset(2).expect("header");
        assert_eq!(
            Some(&ValueKind::Reference("java/lang/String".to_string())),
            binding.entry_local(header, 1)
        );
    }

    #[test]
    fn invocation_arguments_are_recorded() {
        let call = CallSite {
            owner: "java/util/Map".to_string(),
            name: "put".to_string(),
            descriptor: "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;".to_string(),
            kind: CallKind::Interface,
        };
        let instructions = vec![
            Instruction::new(
                0,
                opcodes::GETSTATIC,
                InstructionKind::Field(FieldRef {
                    owner: "a/Sample".to_string(),
                    name: "CACHE".to_string(),
                    descriptor: "Ljava/util/Map;".to_string(),
                }),
            ),
            Instruction::simple(3, opcodes::ACONST_NULL),
            Instruction::new(
                4,
                opcodes::LDC,
                InstructionKind::Constant(ConstantValue::Str("k".to_string())),
            ),
            Instruction::new(6, opcodes::INVOKEINTERFACE, InstructionKind::Invoke(call)),
            Instruction::simple(11, opcodes::ARETURN),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let binding = analyze_operand_types(
            &graph,
            &signature("()Ljava/lang/Object;", true),
            options(),
        )
        .expect("types");
        assert_eq!(
            Some(&vec![
                ValueKind::Reference("java/util/Map".to_string()),
                ValueKind::Null,
                ValueKind::Reference("java/lang/String".to_string()),
            ]),
            binding.call_arguments.get(&6)
        );
    }

    #[test]
    fn bitwise_operators_keep_operand_width() {
        // iload_0; sipush 255; iand; lload_1; ldc2_w 255L; land; invokestatic mask(IJ)V; return
        let call = CallSite {
            owner: "a/Sample".to_string(),
            name: "mask".to_string(),
            descriptor: "(IJ)V".to_string(),
            kind: CallKind::Static,
        };
        let instructions = vec![
            Instruction::simple(0, opcodes::ILOAD_0),
            Instruction::new(
                1,
                opcodes::SIPUSH,
                InstructionKind::Constant(ConstantValue::Int(255)),
            ),
            Instruction::simple(4, opcodes::IAND),
            Instruction::simple(5, 0x1f),
            Instruction::new(
                6,
                opcodes::LDC2_W,
                InstructionKind::Constant(ConstantValue::Long(255)),
            ),
            Instruction::simple(9, opcodes::LAND),
            Instruction::new(10, opcodes::INVOKESTATIC, InstructionKind::Invoke(call)),
            Instruction::simple(13, opcodes::RETURN),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let binding =
            analyze_operand_types(&graph, &signature("(IJ)V", true), options()).expect("types");
        assert_eq!(
            Some(&vec![ValueKind::Int, ValueKind::Long]),
            binding.call_arguments.get(&10)
        );
    }

    #[test]
    fn unknown_opcode_degrades_or_fails_in_strict_mode() {
        let mut odd = Instruction::simple(1, 0xcb);
        odd.stack_effect = Some(StackEffect { pops: 1, pushes: 1 });
        let instructions = vec![
            Instruction::simple(0, opcodes::ICONST_0),
            odd,
            Instruction::simple(2, opcodes::IRETURN),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let lenient =
            analyze_operand_types(&graph, &signature("()I", true), options()).expect("types");
        assert!(lenient.degraded.contains(&1));

        let strict = TypeOptions {
            strict: true,
            cap: 256,
        };
        let error =
            analyze_operand_types(&graph, &signature("()I", true), strict).expect_err("strict");
        assert_eq!(
            AnalysisError::UnsupportedOpcode {
                opcode: 0xcb,
                offset: 1
            },
            error
        );
    }

    #[test]
    fn cap_triggers_convergence_error() {
        let instructions = vec![
            Instruction::simple(0, opcodes::NOP),
            branch(1, opcodes::GOTO, 0),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let options = TypeOptions {
            strict: false,
            cap: 0,
        };
        let error =
            analyze_operand_types(&graph, &signature("()V", true), options).expect_err("cap");
        assert!(matches!(error, AnalysisError::Convergence { .. }));
    }

    #[test]
    fn handler_entry_holds_catch_type() {
        let instructions = vec![
            Instruction::simple(0, opcodes::NOP),
            Instruction::simple(1, opcodes::RETURN),
            Instruction::simple(2, 0x4c),
            Instruction::simple(3, opcodes::RETURN),
        ];
        let handlers = vec![ExceptionHandler {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 2,
            catch_type: Some("java/io/IOException".to_string()),
        }];
        let graph = build_graph(&instructions, &handlers).expect("graph");
        let binding =
            analyze_with_handlers(&graph, &signature("()V", true), &handlers, options())
                .expect("types");
        let handler = graph.block_of_offset(2).expect("handler block");
        assert_eq!(
            Some(&ValueKind::Reference("java/io/IOException".to_string())),
            binding.entry_stack(handler, 0)
        );
    }
}
