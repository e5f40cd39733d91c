use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::error::{AnalysisError, AnalysisResult};
use crate::ir::{
    BlockTarget, EdgeKind, ExceptionHandler, Instruction, InstructionBlock, InstructionGraph,
    InstructionKind, Successor,
};
use crate::opcodes;

/// Build a control flow graph from decoded instructions.
///
/// Blocks partition `instructions` in order. Handler blocks receive an
/// exception edge from every block whose first instruction lies inside the
/// protected range.
pub fn build_graph(
    instructions: &[Instruction],
    handlers: &[ExceptionHandler],
) -> AnalysisResult<InstructionGraph> {
    let Some(first) = instructions.first() else {
        return Err(AnalysisError::malformed_bytecode(0, "empty instruction list"));
    };
    for window in instructions.windows(2) {
        if window[1].offset <= window[0].offset {
            return Err(AnalysisError::malformed_bytecode(
                window[1].offset,
                "instruction offsets are not strictly increasing",
            ));
        }
    }

    let positions: BTreeMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .map(|(position, inst)| (inst.offset, position))
        .collect();
    let last_offset = instructions.last().map_or(first.offset, |inst| inst.offset);
    let aligned = |offset: u32, at: u32, what: &str| -> AnalysisResult<()> {
        if positions.contains_key(&offset) {
            Ok(())
        } else {
            Err(AnalysisError::malformed_bytecode(
                at,
                format!("{what} {offset} does not start an instruction"),
            ))
        }
    };

    let mut leaders = BTreeSet::new();
    leaders.insert(first.offset);
    for (position, inst) in instructions.iter().enumerate() {
        let targets = inst.jump_targets();
        for target in &targets {
            aligned(*target, inst.offset, "branch target")?;
            leaders.insert(*target);
        }
        let ends_block = !targets.is_empty()
            || opcodes::is_conditional_branch(inst.opcode)
            || opcodes::is_unconditional_branch(inst.opcode)
            || opcodes::is_switch(inst.opcode)
            || opcodes::is_exit_opcode(inst.opcode);
        if ends_block {
            if let Some(next) = instructions.get(position + 1) {
                leaders.insert(next.offset);
            }
        }
    }
    for handler in handlers {
        aligned(handler.handler_pc, handler.handler_pc, "handler")?;
        aligned(handler.start_pc, handler.start_pc, "protected range start")?;
        // A protected range may end past the final instruction.
        if handler.end_pc <= last_offset {
            aligned(handler.end_pc, handler.end_pc, "protected range end")?;
            leaders.insert(handler.end_pc);
        }
        leaders.insert(handler.handler_pc);
        leaders.insert(handler.start_pc);
    }

    let mut blocks = Vec::new();
    let mut block_of_leader = BTreeMap::new();
    let mut current: Vec<Instruction> = Vec::new();
    for inst in instructions {
        if leaders.contains(&inst.offset) && !current.is_empty() {
            push_block(&mut blocks, &mut block_of_leader, std::mem::take(&mut current));
        }
        current.push(inst.clone());
    }
    push_block(&mut blocks, &mut block_of_leader, current);

    let block_count = blocks.len();
    for index in 0..block_count {
        let Some(last) = blocks[index].instructions.last() else {
            continue;
        };
        let next = (index + 1 < block_count).then_some(index + 1);
        let target_block = |offset: u32| -> AnalysisResult<usize> {
            block_of_leader.get(&offset).copied().ok_or_else(|| {
                AnalysisError::malformed_bytecode(offset, "target is not a block leader")
            })
        };
        let mut successors = Vec::new();
        if opcodes::is_exit_opcode(last.opcode) {
            successors.push(Successor {
                target: BlockTarget::Exit,
                kind: EdgeKind::Return,
            });
        } else if opcodes::is_switch(last.opcode) {
            let mut seen = BTreeSet::new();
            for target in last.jump_targets() {
                let block = target_block(target)?;
                if seen.insert(block) {
                    successors.push(Successor {
                        target: BlockTarget::Block(block),
                        kind: EdgeKind::Jump,
                    });
                }
            }
        } else if opcodes::is_conditional_branch(last.opcode) {
            let InstructionKind::Branch { target } = last.kind else {
                return Err(AnalysisError::malformed_bytecode(
                    last.offset,
                    "conditional branch without target",
                ));
            };
            successors.push(Successor {
                target: BlockTarget::Block(target_block(target)?),
                kind: EdgeKind::ConditionalTrue,
            });
            if let Some(next) = next {
                successors.push(Successor {
                    target: BlockTarget::Block(next),
                    kind: EdgeKind::ConditionalFalse,
                });
            }
        } else if opcodes::is_unconditional_branch(last.opcode) {
            let InstructionKind::Branch { target } = last.kind else {
                return Err(AnalysisError::malformed_bytecode(
                    last.offset,
                    "jump without target",
                ));
            };
            successors.push(Successor {
                target: BlockTarget::Block(target_block(target)?),
                kind: EdgeKind::Jump,
            });
        } else if let Some(next) = next {
            successors.push(Successor {
                target: BlockTarget::Block(next),
                kind: EdgeKind::FallThrough,
            });
        }
        blocks[index].successors = successors;
    }

    for handler in handlers {
        let Some(&handler_block) = block_of_leader.get(&handler.handler_pc) else {
            continue;
        };
        for block in blocks.iter_mut() {
            let inside =
                block.start_offset >= handler.start_pc && block.start_offset < handler.end_pc;
            let already = block.successors.iter().any(|successor| {
                successor.kind == EdgeKind::Exception
                    && successor.target == BlockTarget::Block(handler_block)
            });
            if inside && !already {
                block.successors.push(Successor {
                    target: BlockTarget::Block(handler_block),
                    kind: EdgeKind::Exception,
                });
            }
        }
    }

    let graph = InstructionGraph::from_blocks(blocks);
    debug!(
        "built graph with {} blocks and {} edges",
        graph.len(),
        graph.edges().len()
    );
    Ok(graph)
}

fn push_block(
    blocks: &mut Vec<InstructionBlock>,
    block_of_leader: &mut BTreeMap<u32, usize>,
    instructions: Vec<Instruction>,
) {
    let (Some(start_offset), Some(end_offset)) = (
        instructions.first().map(|inst| inst.offset),
        instructions.last().map(|inst| inst.offset),
    ) else {
        return;
    };
    let index = blocks.len();
    block_of_leader.insert(start_offset, index);
    blocks.push(InstructionBlock {
        index,
        start_offset,
        end_offset,
        instructions,
        successors: Vec::new(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ConstantValue;

    fn branch(offset: u32, opcode: u8, target: u32) -> Instruction {
        Instruction::new(offset, opcode, InstructionKind::Branch { target })
    }

    fn push(offset: u32, value: i32) -> Instruction {
        Instruction::new(
            offset,
            opcodes::BIPUSH,
            InstructionKind::Constant(ConstantValue::Int(value)),
        )
    }

    #[test]
    fn straight_line_code_is_one_block() {
        let instructions = vec![
            push(0, 1),
            push(2, 2),
            Instruction::simple(4, opcodes::IADD),
            Instruction::simple(5, opcodes::IRETURN),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        assert_eq!(1, graph.len());
        assert_eq!(vec![0], graph.exit_blocks());
        assert_eq!(
            vec![Successor {
                target: BlockTarget::Exit,
                kind: EdgeKind::Return
            }],
            graph.blocks()[0].successors
        );
    }

    #[test]
    fn conditional_branch_has_two_edges() {
        let instructions = vec![
            Instruction::new(0, opcodes::ILOAD_0, InstructionKind::Local { index: 0 }),
            branch(1, opcodes::IFEQ, 6),
            Instruction::simple(4, opcodes::ICONST_1),
            Instruction::simple(5, opcodes::IRETURN),
            Instruction::simple(6, opcodes::ICONST_0),
            Instruction::simple(7, opcodes::IRETURN),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        assert_eq!(3, graph.len());
        let kinds: Vec<_> = graph.blocks()[0]
            .successors
            .iter()
            .map(|successor| (successor.target, successor.kind))
            .collect();
        assert_eq!(
            vec![
                (BlockTarget::Block(2), EdgeKind::ConditionalTrue),
                (BlockTarget::Block(1), EdgeKind::ConditionalFalse),
            ],
            kinds
        );
        assert_eq!(vec![vec![], vec![0], vec![0]], graph.predecessors());
    }

    #[test]
    fn handler_receives_exception_edges() {
        let instructions = vec![
            Instruction::simple(0, opcodes::ICONST_1),
            Instruction::simple(1, opcodes::POP),
            branch(2, opcodes::GOTO, 6),
            Instruction::simple(5, opcodes::ATHROW),
            Instruction::simple(6, opcodes::RETURN),
        ];
        let handlers = vec![ExceptionHandler {
            start_pc: 0,
            end_pc: 5,
            handler_pc: 5,
            catch_type: None,
        }];
        let graph = build_graph(&instructions, &handlers).expect("graph");
        assert_eq!(3, graph.len());
        assert!(graph.blocks()[0].successors.contains(&Successor {
            target: BlockTarget::Block(1),
            kind: EdgeKind::Exception,
        }));
        assert_eq!(Some(1), graph.block_of_offset(5));
    }

    #[test]
    fn misaligned_target_is_rejected() {
        let instructions = vec![branch(0, opcodes::GOTO, 2), Instruction::simple(3, opcodes::RETURN)];
        let error = build_graph(&instructions, &[]).expect_err("misaligned");
        assert!(matches!(error, AnalysisError::MalformedBytecode { offset: 0, .. }));
    }

    #[test]
    fn empty_and_unordered_lists_are_rejected() {
        assert!(build_graph(&[], &[]).is_err());
        let instructions = vec![
            Instruction::simple(2, opcodes::NOP),
            Instruction::simple(1, opcodes::RETURN),
        ];
        assert!(build_graph(&instructions, &[]).is_err());
    }

    #[test]
    fn switch_targets_are_deduplicated() {
        let instructions = vec![
            Instruction::simple(0, opcodes::ICONST_0),
            Instruction::new(
                1,
                opcodes::TABLESWITCH,
                InstructionKind::Switch {
                    default: 20,
                    cases: vec![(0, 21), (1, 21)],
                },
            ),
            Instruction::simple(20, opcodes::RETURN),
            Instruction::simple(21, opcodes::RETURN),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        assert_eq!(2, graph.blocks()[0].successors.len());
        for block in graph.blocks() {
            for successor in block.successor_blocks() {
                assert!(successor < graph.len());
            }
        }
    }

    #[test]
    fn falling_off_the_end_has_no_successor() {
        let instructions = vec![Instruction::simple(0, opcodes::NOP)];
        let graph = build_graph(&instructions, &[]).expect("graph");
        assert!(graph.blocks()[0].successors.is_empty());
        assert_eq!(vec![0], graph.exit_blocks());
    }
}
