//! Iterative dominator sets over an [`InstructionGraph`].
//!
//! The entry dominates only itself; every other reachable block is dominated
//! by itself plus the intersection of its predecessors' sets. Blocks that are
//! unreachable from the entry have no dominator set and are ignored by the
//! loop and feature passes.

use std::collections::{BTreeSet, VecDeque};

use log::debug;

use crate::error::{AnalysisError, AnalysisResult};
use crate::ir::InstructionGraph;

/// Dominance facts for one graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dominators {
    sets: Vec<Option<BTreeSet<usize>>>,
    idom: Vec<Option<usize>>,
    preorder: Vec<usize>,
}

impl Dominators {
    pub fn is_reachable(&self, block: usize) -> bool {
        matches!(self.sets.get(block), Some(Some(_)))
    }

    /// Checks if block `a` dominates block `b`. A block dominates itself.
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        match self.sets.get(b) {
            Some(Some(set)) => set.contains(&a),
            _ => false,
        }
    }

    pub fn dominators_of(&self, block: usize) -> Option<&BTreeSet<usize>> {
        self.sets.get(block).and_then(Option::as_ref)
    }

    /// Closest strict dominator, `None` for the entry and unreachable blocks.
    pub fn immediate_dominator(&self, block: usize) -> Option<usize> {
        self.idom.get(block).copied().flatten()
    }

    /// Reachable blocks in dominator tree preorder, children by ascending index.
    pub fn preorder(&self) -> &[usize] {
        &self.preorder
    }
}

/// Compute dominator sets, failing with `Convergence` after `cap` rounds.
pub fn compute_dominators(graph: &InstructionGraph, cap: usize) -> AnalysisResult<Dominators> {
    let count = graph.len();
    if count == 0 {
        return Ok(Dominators {
            sets: Vec::new(),
            idom: Vec::new(),
            preorder: Vec::new(),
        });
    }
    let entry = graph.entry();
    let reachable = reachable_blocks(graph);
    let predecessors = graph.predecessors();

    let mut sets: Vec<Option<BTreeSet<usize>>> = (0..count)
        .map(|block| {
            if block == entry {
                Some(BTreeSet::from([entry]))
            } else if reachable.contains(&block) {
                Some(reachable.clone())
            } else {
                None
            }
        })
        .collect();

    let mut rounds = 0;
    let mut changed = true;
    while changed {
        if rounds >= cap {
            return Err(AnalysisError::Convergence {
                analysis: "dominators",
                iterations: rounds,
            });
        }
        rounds += 1;
        changed = false;
        for block in reachable.iter().copied().filter(|block| *block != entry) {
            let mut next: Option<BTreeSet<usize>> = None;
            for pred in &predecessors[block] {
                let Some(pred_set) = &sets[*pred] else {
                    continue;
                };
                next = Some(match next {
                    None => pred_set.clone(),
                    Some(acc) => acc.intersection(pred_set).copied().collect(),
                });
            }
            let mut next = next.unwrap_or_default();
            next.insert(block);
            if sets[block].as_ref() != Some(&next) {
                sets[block] = Some(next);
                changed = true;
            }
        }
    }
    debug!("dominators converged after {rounds} rounds");

    let idom: Vec<Option<usize>> = (0..count)
        .map(|block| {
            let set = sets[block].as_ref()?;
            // Strict dominators form a chain; the closest one has the largest set.
            set.iter()
                .copied()
                .filter(|candidate| *candidate != block)
                .max_by_key(|candidate| sets[*candidate].as_ref().map_or(0, BTreeSet::len))
        })
        .collect();

    let mut children = vec![Vec::new(); count];
    for (block, parent) in idom.iter().enumerate() {
        if let Some(parent) = parent {
            children[*parent].push(block);
        }
    }
    let mut preorder = Vec::with_capacity(reachable.len());
    let mut stack = vec![entry];
    while let Some(block) = stack.pop() {
        preorder.push(block);
        stack.extend(children[block].iter().rev().copied());
    }

    Ok(Dominators {
        sets,
        idom,
        preorder,
    })
}

/// Blocks reachable from the entry along any edge kind.
pub fn reachable_blocks(graph: &InstructionGraph) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    if graph.is_empty() {
        return seen;
    }
    let mut queue = VecDeque::from([graph.entry()]);
    seen.insert(graph.entry());
    while let Some(block) = queue.pop_front() {
        let Some(block) = graph.block(block) else {
            continue;
        };
        for successor in block.successor_blocks() {
            if seen.insert(successor) {
                queue.push_back(successor);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_graph;
    use crate::ir::{Instruction, InstructionKind};
    use crate::opcodes;

    fn diamond() -> InstructionGraph {
        let instructions = vec![
            Instruction::simple(0, opcodes::ILOAD_0),
            Instruction::new(1, opcodes::IFEQ, InstructionKind::Branch { target: 8 }),
            Instruction::simple(4, opcodes::ICONST_1),
            Instruction::new(5, opcodes::GOTO, InstructionKind::Branch { target: 9 }),
            Instruction::simple(8, opcodes::ICONST_0),
            Instruction::simple(9, opcodes::IRETURN),
            Instruction::simple(10, opcodes::RETURN),
        ];
        build_graph(&instructions, &[]).expect("graph")
    }

    #[test]
    fn diamond_join_is_dominated_by_entry_only() {
        let graph = diamond();
        let dominators = compute_dominators(&graph, 64).expect("dominators");
        assert!(dominators.dominates(0, 3));
        assert!(!dominators.dominates(1, 3));
        assert!(!dominators.dominates(2, 3));
        assert_eq!(Some(0), dominators.immediate_dominator(3));
        assert_eq!(None, dominators.immediate_dominator(0));
        assert_eq!(&[0, 1, 2, 3], dominators.preorder());
    }

    #[test]
    fn unreachable_blocks_have_no_dominators() {
        let graph = diamond();
        let dominators = compute_dominators(&graph, 64).expect("dominators");
        assert!(!dominators.is_reachable(4));
        assert!(!dominators.dominates(0, 4));
        assert_eq!(None, dominators.dominators_of(4));
    }

    #[test]
    fn zero_cap_fails_to_converge() {
        let graph = diamond();
        let error = compute_dominators(&graph, 0).expect_err("cap");
        assert_eq!(
            AnalysisError::Convergence {
                analysis: "dominators",
                iterations: 0
            },
            error
        );
    }
}
