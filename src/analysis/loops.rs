use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::analysis::dominators::{Dominators, compute_dominators};
use crate::error::AnalysisResult;
use crate::ir::InstructionGraph;

/// Natural loop identified by its header block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub header: usize,
    /// Member blocks, header included.
    pub members: BTreeSet<usize>,
    /// Sources of back edges into the header.
    pub latches: BTreeSet<usize>,
    /// Nesting depth, 1 for outermost loops.
    pub depth: usize,
    /// Index of the smallest enclosing loop in the returned list.
    pub parent: Option<usize>,
}

impl Loop {
    pub fn contains(&self, block: usize) -> bool {
        self.members.contains(&block)
    }
}

/// Detect natural loops, sorted by header.
pub fn analyze_loops(graph: &InstructionGraph, cap: usize) -> AnalysisResult<Vec<Loop>> {
    let dominators = compute_dominators(graph, cap)?;
    Ok(find_loops(graph, &dominators))
}

/// Detect natural loops from precomputed dominators.
pub fn find_loops(graph: &InstructionGraph, dominators: &Dominators) -> Vec<Loop> {
    let predecessors = graph.predecessors();
    let mut by_header: BTreeMap<usize, (BTreeSet<usize>, BTreeSet<usize>)> = BTreeMap::new();

    for block in graph.blocks() {
        if !dominators.is_reachable(block.index) {
            continue;
        }
        for header in block.successor_blocks() {
            if !dominators.dominates(header, block.index) {
                continue;
            }
            let (members, latches) = by_header.entry(header).or_default();
            latches.insert(block.index);
            members.insert(header);
            let mut stack = vec![block.index];
            while let Some(node) = stack.pop() {
                if !members.insert(node) {
                    continue;
                }
                stack.extend(
                    predecessors[node]
                        .iter()
                        .copied()
                        .filter(|pred| dominators.is_reachable(*pred)),
                );
            }
        }
    }

    let mut loops: Vec<Loop> = by_header
        .into_iter()
        .map(|(header, (members, latches))| Loop {
            header,
            members,
            latches,
            depth: 1,
            parent: None,
        })
        .collect();

    for index in 0..loops.len() {
        let parent = (0..loops.len())
            .filter(|other| {
                *other != index
                    && loops[*other].members.len() > loops[index].members.len()
                    && loops[index].members.is_subset(&loops[*other].members)
            })
            .min_by_key(|other| loops[*other].members.len());
        loops[index].parent = parent;
    }
    for index in 0..loops.len() {
        let mut depth = 1;
        let mut current = loops[index].parent;
        while let Some(parent) = current {
            depth += 1;
            current = loops[parent].parent;
        }
        loops[index].depth = depth;
    }

    debug!("found {} loops in {} blocks", loops.len(), graph.len());
    loops
}

/// Innermost loop containing `block`.
pub fn innermost_loop(loops: &[Loop], block: usize) -> Option<usize> {
    loops
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.contains(block))
        .max_by_key(|(_, candidate)| candidate.depth)
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_graph;
    use crate::ir::{Instruction, InstructionKind};
    use crate::opcodes;

    fn branch(offset: u32, opcode: u8, target: u32) -> Instruction {
        Instruction::new(offset, opcode, InstructionKind::Branch { target })
    }

    fn nested() -> InstructionGraph {
        let instructions = vec![
            Instruction::simple(0, opcodes::NOP),
            Instruction::simple(1, opcodes::ILOAD_0),
            branch(2, opcodes::IFEQ, 20),
            Instruction::simple(5, 0x1b),
            branch(6, opcodes::IFEQ, 12),
            branch(9, opcodes::GOTO, 5),
            branch(12, opcodes::GOTO, 1),
            Instruction::simple(20, opcodes::RETURN),
        ];
        build_graph(&instructions, &[]).expect("graph")
    }

    #[test]
    fn self_loop_has_single_member() {
        let instructions = vec![
            Instruction::simple(0, opcodes::NOP),
            branch(1, opcodes::GOTO, 1),
        ];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let loops = analyze_loops(&graph, 64).expect("loops");
        assert_eq!(1, loops.len());
        assert_eq!(BTreeSet::from([1]), loops[0].members);
        assert_eq!(BTreeSet::from([1]), loops[0].latches);
    }

    #[test]
    fn nested_loops_get_parent_and_depth() {
        let graph = nested();
        let loops = analyze_loops(&graph, 64).expect("loops");
        assert_eq!(2, loops.len());
        assert_eq!(1, loops[0].header);
        assert_eq!(BTreeSet::from([1, 2, 3, 4]), loops[0].members);
        assert_eq!(1, loops[0].depth);
        assert_eq!(2, loops[1].header);
        assert_eq!(BTreeSet::from([2, 3]), loops[1].members);
        assert_eq!(Some(0), loops[1].parent);
        assert_eq!(2, loops[1].depth);
        assert_eq!(Some(1), innermost_loop(&loops, 3));
        assert_eq!(None, innermost_loop(&loops, 5));
    }

    #[test]
    fn repeated_analysis_is_identical() {
        let graph = nested();
        let first = analyze_loops(&graph, 64).expect("loops");
        let second = analyze_loops(&graph, 64).expect("loops");
        assert_eq!(first, second);
    }

    #[test]
    fn loops_nest_or_are_disjoint() {
        let graph = nested();
        let loops = analyze_loops(&graph, 64).expect("loops");
        for a in &loops {
            for b in &loops {
                let shared = a.members.intersection(&b.members).count();
                assert!(
                    shared == 0
                        || a.members.is_subset(&b.members)
                        || b.members.is_subset(&a.members)
                );
            }
        }
    }

    #[test]
    fn straight_line_code_has_no_loops() {
        let instructions = vec![Instruction::simple(0, opcodes::RETURN)];
        let graph = build_graph(&instructions, &[]).expect("graph");
        assert!(analyze_loops(&graph, 64).expect("loops").is_empty());
    }
}
