use crate::error::AnalysisResult;
use crate::ir::{ExceptionHandler, InstructionGraph, MethodSignature};
use crate::syntax::SyntaxTree;

pub mod constants;
pub mod dominators;
pub mod library;
pub mod loops;
pub mod operand_types;

use constants::{ConstantBinding, propagate_constants};
use dominators::{Dominators, compute_dominators};
use library::LibraryConstants;
use loops::{Loop, analyze_loops};
use operand_types::{OperandTypeBinding, TypeOptions, analyze_with_handlers};

/// Metadata describing an analysis pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisMetadata {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

/// A single analysis pass over one method representation.
pub trait Analysis {
    type Input: ?Sized;
    type Output;

    fn metadata(&self) -> AnalysisMetadata;
    fn run(&self, input: &Self::Input) -> AnalysisResult<Self::Output>;
}

pub struct DominatorAnalysis {
    pub cap: usize,
}

impl Analysis for DominatorAnalysis {
    type Input = InstructionGraph;
    type Output = Dominators;

    fn metadata(&self) -> AnalysisMetadata {
        AnalysisMetadata {
            id: "DOMINATORS",
            name: "Dominators",
            description: "Dominator sets and dominator-tree order of reachable blocks",
        }
    }

    fn run(&self, input: &InstructionGraph) -> AnalysisResult<Dominators> {
        compute_dominators(input, self.cap)
    }
}

pub struct LoopAnalysis {
    pub cap: usize,
}

impl Analysis for LoopAnalysis {
    type Input = InstructionGraph;
    type Output = Vec<Loop>;

    fn metadata(&self) -> AnalysisMetadata {
        AnalysisMetadata {
            id: "LOOPS",
            name: "Natural loops",
            description: "Natural loops with nesting depth and parent links",
        }
    }

    fn run(&self, input: &InstructionGraph) -> AnalysisResult<Vec<Loop>> {
        analyze_loops(input, self.cap)
    }
}

pub struct OperandTypeAnalysis<'a> {
    pub signature: &'a MethodSignature,
    pub handlers: &'a [ExceptionHandler],
    pub options: TypeOptions,
}

impl Analysis for OperandTypeAnalysis<'_> {
    type Input = InstructionGraph;
    type Output = OperandTypeBinding;

    fn metadata(&self) -> AnalysisMetadata {
        AnalysisMetadata {
            id: "OPERAND_TYPES",
            name: "Operand types",
            description: "Abstract kinds of stack slots and locals at block entries",
        }
    }

    fn run(&self, input: &InstructionGraph) -> AnalysisResult<OperandTypeBinding> {
        analyze_with_handlers(input, self.signature, self.handlers, self.options)
    }
}

pub struct ConstantAnalysis<'a> {
    pub table: &'a LibraryConstants,
}

impl Analysis for ConstantAnalysis<'_> {
    type Input = SyntaxTree;
    type Output = ConstantBinding;

    fn metadata(&self) -> AnalysisMetadata {
        AnalysisMetadata {
            id: "CONSTANTS",
            name: "Source constants",
            description: "Compile-time values of source expressions",
        }
    }

    fn run(&self, input: &SyntaxTree) -> AnalysisResult<ConstantBinding> {
        Ok(propagate_constants(input, self.table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_graph;
    use crate::ir::Instruction;
    use crate::opcodes;

    #[test]
    fn analysis_ids_are_unique() {
        let table = LibraryConstants::new();
        let signature = MethodSignature {
            owner: "a/B".to_string(),
            name: "run".to_string(),
            descriptor: "()V".to_string(),
            is_static: true,
        };
        let options = TypeOptions {
            strict: false,
            cap: 16,
        };
        let ids = [
            DominatorAnalysis { cap: 1 }.metadata().id,
            LoopAnalysis { cap: 1 }.metadata().id,
            OperandTypeAnalysis {
                signature: &signature,
                handlers: &[],
                options,
            }
            .metadata()
            .id,
            ConstantAnalysis { table: &table }.metadata().id,
        ];
        let unique: std::collections::BTreeSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[test]
    fn loop_analysis_runs_through_trait() {
        let instructions = vec![Instruction::simple(0, opcodes::RETURN)];
        let graph = build_graph(&instructions, &[]).expect("graph");
        let loops = LoopAnalysis { cap: 8 }.run(&graph).expect("loops");
        assert!(loops.is_empty());
    }
}
