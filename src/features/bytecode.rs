use std::collections::BTreeSet;

use jdescriptor::MethodDescriptor;
use log::debug;

use crate::analysis::dominators::Dominators;
use crate::analysis::loops::Loop;
use crate::analysis::operand_types::OperandTypeBinding;
use crate::features::{
    ARRAY_LENGTH, FeatureConfig, FeatureOrigin, FeatureSet, InstructionShape, LoopSignature,
    Multiset, bump, call_target, creation_key, field_key,
};
use crate::ir::{
    BlockTarget, CallKind, CallSite, ConstantValue, EdgeKind, Instruction, InstructionGraph,
    InstructionKind, MethodSignature,
};
use crate::opcodes;

/// One analysed method body.
pub struct BytecodeMethod<'a> {
    pub signature: &'a MethodSignature,
    pub graph: &'a InstructionGraph,
    pub dominators: &'a Dominators,
    pub loops: &'a [Loop],
    pub types: &'a OperandTypeBinding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExitClass {
    Constant,
    Variable,
    Call,
}

/// Build the feature set of a compiled method.
pub fn extract_bytecode_features(method: &BytecodeMethod<'_>, config: &FeatureConfig) -> FeatureSet {
    let mut set = FeatureSet::new(FeatureOrigin::Bytecode, method.signature.key());
    let (signatures, loop_control) = loop_signatures(method);

    if config.loops {
        set.loops = signatures;
        set.loops.sort();
    }
    if config.shapes {
        for _ in method.loops {
            bump(&mut set.shapes, InstructionShape::Loop);
        }
    }

    for &index in method.dominators.preorder() {
        let Some(block) = method.graph.block(index) else {
            continue;
        };
        let mut calls = Multiset::new();
        for (position, instruction) in block.instructions.iter().enumerate() {
            let previous = position
                .checked_sub(1)
                .and_then(|prev| block.instructions.get(prev));
            if config.shapes && !loop_control.contains(&instruction.offset) {
                if let Some(shape) = shape_of(instruction.opcode) {
                    bump(&mut set.shapes, shape);
                }
            }
            if config.constants {
                constants_of(&mut set, instruction, previous);
            }
            if config.call_sites {
                if let InstructionKind::Invoke(call) = &instruction.kind {
                    if let Some(target) = invoke_target(method.types, instruction.offset, call) {
                        bump(&mut calls, target);
                    }
                }
            }
            if config.field_accesses {
                let access = match &instruction.kind {
                    InstructionKind::Field(field) => field_key(&field.owner, &field.name),
                    _ if instruction.opcode == opcodes::ARRAYLENGTH => Some(ARRAY_LENGTH.to_string()),
                    _ => None,
                };
                if let Some(access) = access {
                    bump(&mut set.field_accesses, access);
                }
            }
            if config.object_creations {
                if let Some(created) = creation_of(instruction) {
                    bump(&mut set.object_creations, created);
                }
            }
        }
        if !calls.is_empty() {
            set.call_sites.push(calls);
        }
    }

    debug!(
        "{}: {} bytecode features over {} blocks",
        set.method,
        set.size(),
        method.graph.len()
    );
    set
}

fn shape_of(opcode: u8) -> Option<InstructionShape> {
    Some(match opcode {
        opcodes::ATHROW => InstructionShape::Throw,
        opcodes::MONITORENTER => InstructionShape::Monitor,
        opcodes::INSTANCEOF => InstructionShape::InstanceOf,
        opcodes::IFLT | opcodes::IF_ICMPLT => InstructionShape::BranchLt,
        opcodes::IFLE | opcodes::IF_ICMPLE => InstructionShape::BranchLe,
        opcodes::IFGT | opcodes::IF_ICMPGT => InstructionShape::BranchGt,
        opcodes::IFGE | opcodes::IF_ICMPGE => InstructionShape::BranchGe,
        opcodes::ISHL | opcodes::LSHL => InstructionShape::ShiftLeft,
        opcodes::ISHR | opcodes::LSHR => InstructionShape::ShiftRight,
        opcodes::IUSHR | opcodes::LUSHR => InstructionShape::UnsignedShiftRight,
        _ if opcodes::is_switch(opcode) => InstructionShape::Switch,
        _ if opcodes::is_return(opcode) => InstructionShape::Return,
        _ => return None,
    })
}

fn constants_of(set: &mut FeatureSet, instruction: &Instruction, previous: Option<&Instruction>) {
    if let Some(value) = instruction.constant_value() {
        set.add_constant(&value);
        return;
    }
    match &instruction.kind {
        InstructionKind::Increment { delta, .. } => {
            set.add_constant(&ConstantValue::Int(i32::from(*delta).abs()));
        }
        // A comparison against zero has no push of its own.
        _ if (opcodes::IFEQ..=opcodes::IFLE).contains(&instruction.opcode)
            && !previous.is_some_and(yields_condition) =>
        {
            set.add_constant(&ConstantValue::Int(0));
        }
        _ => {}
    }
}

/// Instructions whose result is already a condition for a unary branch.
fn yields_condition(instruction: &Instruction) -> bool {
    if instruction.opcode == opcodes::INSTANCEOF || opcodes::is_value_compare(instruction.opcode) {
        return true;
    }
    matches!(&instruction.kind, InstructionKind::Invoke(call) if call.descriptor.ends_with(")Z"))
}

fn invoke_target(types: &OperandTypeBinding, offset: u32, call: &CallSite) -> Option<String> {
    if call.kind == CallKind::Dynamic {
        return None;
    }
    let arity = match call.descriptor.parse::<MethodDescriptor>() {
        Ok(descriptor) => descriptor.parameter_types().len(),
        Err(_) => {
            let arguments = types.call_arguments.get(&offset)?;
            let receiver = usize::from(call.kind != CallKind::Static);
            arguments.len().saturating_sub(receiver)
        }
    };
    call_target(&call.owner, &call.name, arity)
}

fn creation_of(instruction: &Instruction) -> Option<String> {
    match (&instruction.kind, instruction.opcode) {
        (InstructionKind::Type(ty), opcodes::NEW) => creation_key(ty),
        (InstructionKind::Type(ty), opcodes::ANEWARRAY) => Some(if ty.starts_with('[') {
            format!("[{ty}")
        } else {
            format!("[L{ty};")
        }),
        (InstructionKind::NewArray(kind), _) => Some(kind.descriptor().to_string()),
        (InstructionKind::MultiNewArray { descriptor, .. }, _) => Some(descriptor.clone()),
        _ => None,
    }
}

/// Loop signatures plus offsets of branches that only steer loops.
fn loop_signatures(method: &BytecodeMethod<'_>) -> (Vec<LoopSignature>, BTreeSet<u32>) {
    let mut control = BTreeSet::new();
    let mut signatures = Vec::new();
    for lp in method.loops {
        let mut signature = LoopSignature {
            depth: lp.depth,
            ..LoopSignature::default()
        };
        for &member in &lp.members {
            let Some(block) = method.graph.block(member) else {
                continue;
            };
            let Some(last) = block.last_instruction() else {
                continue;
            };
            if !opcodes::is_conditional_branch(last.opcode) {
                continue;
            }
            let exits = block.successors.iter().any(|successor| match successor.target {
                BlockTarget::Block(target) => !lp.contains(target),
                BlockTarget::Exit => true,
            });
            let back_edge = block.successors.iter().any(|successor| {
                successor.kind == EdgeKind::ConditionalTrue
                    && successor.target == BlockTarget::Block(lp.header)
                    && lp.latches.contains(&member)
            });
            if exits {
                match classify_exit(&block.instructions) {
                    ExitClass::Constant => signature.constant_exits += 1,
                    ExitClass::Variable => signature.variable_exits += 1,
                    ExitClass::Call => signature.call_exits += 1,
                }
            }
            if exits || back_edge {
                control.insert(last.offset);
            }
        }
        signatures.push(signature);
    }
    (signatures, control)
}

/// Classify the branch closing `instructions` by what it compares against.
fn classify_exit(instructions: &[Instruction]) -> ExitClass {
    let Some((branch, rest)) = instructions.split_last() else {
        return ExitClass::Variable;
    };
    if matches!(branch.opcode, opcodes::IFNULL | opcodes::IFNONNULL) {
        return ExitClass::Constant;
    }
    let operand = rest.last();
    if opcodes::is_unary_branch(branch.opcode) {
        return match operand {
            Some(previous) if opcodes::is_invoke(previous.opcode) => ExitClass::Call,
            Some(previous) if opcodes::is_value_compare(previous.opcode) => {
                classify_operand(rest.len().checked_sub(2).and_then(|index| rest.get(index)))
            }
            _ => ExitClass::Constant,
        };
    }
    classify_operand(operand)
}

fn classify_operand(operand: Option<&Instruction>) -> ExitClass {
    match operand {
        Some(instruction) if instruction.constant_value().is_some() => ExitClass::Constant,
        Some(instruction) if opcodes::is_invoke(instruction.opcode) => ExitClass::Call,
        _ => ExitClass::Variable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dominators::compute_dominators;
    use crate::analysis::loops::find_loops;
    use crate::cfg::build_graph;
    use crate::ir::FieldRef;

    fn signature() -> MethodSignature {
        MethodSignature {
            owner: "a/Counter".to_string(),
            name: "count".to_string(),
            descriptor: "(I)I".to_string(),
            is_static: true,
        }
    }

    fn extract(instructions: &[Instruction]) -> FeatureSet {
        let graph = build_graph(instructions, &[]).expect("graph");
        let dominators = compute_dominators(&graph, 64).expect("dominators");
        let loops = find_loops(&graph, &dominators);
        let types = OperandTypeBinding::default();
        let signature = signature();
        let method = BytecodeMethod {
            signature: &signature,
            graph: &graph,
            dominators: &dominators,
            loops: &loops,
            types: &types,
        };
        extract_bytecode_features(&method, &FeatureConfig::default())
    }

    fn invoke(offset: u32, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Instruction {
        let kind = match opcode {
            opcodes::INVOKESTATIC => CallKind::Static,
            opcodes::INVOKEINTERFACE => CallKind::Interface,
            opcodes::INVOKEDYNAMIC => CallKind::Dynamic,
            _ => CallKind::Virtual,
        };
        Instruction::new(
            offset,
            opcode,
            InstructionKind::Invoke(CallSite {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                kind,
            }),
        )
    }

    /// `for (int i = 0; i < 10; i++) sum += helper(i); return sum;`
    fn counting_loop() -> Vec<Instruction> {
        vec![
            Instruction::simple(0, opcodes::ICONST_0),
            Instruction::new(1, opcodes::ISTORE, InstructionKind::Local { index: 1 }),
            Instruction::new(3, opcodes::ILOAD, InstructionKind::Local { index: 1 }),
            Instruction::new(5, opcodes::BIPUSH, InstructionKind::Constant(ConstantValue::Int(10))),
            Instruction::new(7, opcodes::IF_ICMPGE, InstructionKind::Branch { target: 22 }),
            Instruction::new(10, opcodes::ILOAD, InstructionKind::Local { index: 1 }),
            invoke(12, opcodes::INVOKESTATIC, "a/Counter", "helper", "(I)I"),
            Instruction::simple(15, opcodes::ISTORE_0),
            Instruction::new(16, opcodes::IINC, InstructionKind::Increment { index: 1, delta: 1 }),
            Instruction::new(19, opcodes::GOTO, InstructionKind::Branch { target: 3 }),
            Instruction::simple(22, opcodes::ILOAD_0),
            Instruction::simple(23, opcodes::IRETURN),
        ]
    }

    #[test]
    fn counting_loop_has_constant_exit() {
        let set = extract(&counting_loop());
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
    }

    #[test]
    fn constants_include_increments() {
        let set = extract(&counting_loop());
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(0)));
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(10)));
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(1)));
    }

    #[test]
    fn calls_are_grouped_per_block() {
        let set = extract(&counting_loop());
        assert_eq!(1, set.call_sites.len());
        assert_eq!(Some(&1), set.call_sites[0].get("a/Counter/helper/1"));
    }

    #[test]
    fn guard_outside_loops_counts_as_branch_shape() {
        let instructions = vec![
            Instruction::simple(0, opcodes::ILOAD_0),
            Instruction::new(1, opcodes::IFGE, InstructionKind::Branch { target: 8 }),
            Instruction::new(4, opcodes::NEW, InstructionKind::Type("java/lang/IllegalArgumentException".to_string())),
            Instruction::simple(7, opcodes::ATHROW),
            Instruction::simple(8, opcodes::ILOAD_0),
            Instruction::simple(9, opcodes::IRETURN),
        ];
        let set = extract(&instructions);
        assert_eq!(Some(&1), set.shapes.get(&InstructionShape::BranchGe));
        assert_eq!(Some(&1), set.shapes.get(&InstructionShape::Throw));
        assert_eq!(Some(&1), set.constants.get(&ConstantValue::Int(0)));
        assert_eq!(
            Some(&1),
            set.object_creations.get("java/lang/IllegalArgumentException")
        );
    }

    #[test]
    fn boolean_calls_do_not_imply_zero() {
        let instructions = vec![
            Instruction::simple(0, opcodes::ALOAD_0),
            invoke(1, opcodes::INVOKEINTERFACE, "java/util/List", "isEmpty", "()Z"),
            Instruction::new(6, opcodes::IFEQ, InstructionKind::Branch { target: 10 }),
            Instruction::simple(9, opcodes::RETURN),
            Instruction::new(
                10,
                opcodes::GETSTATIC,
                InstructionKind::Field(FieldRef {
                    owner: "a/Counter".to_string(),
                    name: "total".to_string(),
                    descriptor: "I".to_string(),
                }),
            ),
            invoke(13, opcodes::INVOKEDYNAMIC, "", "makeConcatWithConstants", "(I)Ljava/lang/String;"),
            Instruction::simple(18, opcodes::RETURN),
        ];
        let set = extract(&instructions);
        assert!(set.constants.is_empty());
        assert_eq!(Some(&1), set.field_accesses.get("a/Counter/total"));
        assert_eq!(1, set.call_sites.len());
        assert_eq!(Some(&1), set.call_sites[0].get("java/util/List/isEmpty/0"));
    }
}
