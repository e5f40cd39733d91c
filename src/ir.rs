use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use jdescriptor::TypeDescriptor;
use serde::{Deserialize, Serialize};

use crate::opcodes;

/// Exception handler metadata from the Code attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    /// Exclusive end of the protected range.
    pub end_pc: u32,
    pub handler_pc: u32,
    #[serde(default)]
    pub catch_type: Option<String>,
}

/// Declared identity of a method body.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    /// Internal class name, e.g. `org/example/Parser`.
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub is_static: bool,
}

impl MethodSignature {
    /// Key used to pair bytecode and source methods: `owner.name(descriptor)`.
    pub fn key(&self) -> String {
        format!("{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: u8,
    #[serde(default)]
    pub kind: InstructionKind,
    /// Stack effect reported by the decoder, used when no transfer rule applies.
    #[serde(default)]
    pub stack_effect: Option<StackEffect>,
}

impl Instruction {
    pub fn new(offset: u32, opcode: u8, kind: InstructionKind) -> Self {
        Self {
            offset,
            opcode,
            kind,
            stack_effect: None,
        }
    }

    /// Instruction without operands.
    pub fn simple(offset: u32, opcode: u8) -> Self {
        Self::new(offset, opcode, InstructionKind::Other)
    }

    /// Constant pushed by this instruction, if any.
    pub fn constant_value(&self) -> Option<ConstantValue> {
        match self.opcode {
            opcodes::ICONST_M1..=opcodes::ICONST_5 => {
                Some(ConstantValue::Int(i32::from(self.opcode) - 3))
            }
            opcodes::LCONST_0 | opcodes::LCONST_1 => {
                Some(ConstantValue::Long(i64::from(self.opcode - opcodes::LCONST_0)))
            }
            opcodes::FCONST_0..=opcodes::FCONST_2 => {
                Some(ConstantValue::Float(f32::from(self.opcode - opcodes::FCONST_0)))
            }
            opcodes::DCONST_0 | opcodes::DCONST_1 => {
                Some(ConstantValue::Double(f64::from(self.opcode - opcodes::DCONST_0)))
            }
            _ => match &self.kind {
                InstructionKind::Constant(value) => Some(value.clone()),
                _ => None,
            },
        }
    }

    /// Branch targets and switch targets in declaration order.
    pub fn jump_targets(&self) -> Vec<u32> {
        match &self.kind {
            InstructionKind::Branch { target } => vec![*target],
            InstructionKind::Switch { default, cases } => {
                let mut targets = vec![*default];
                targets.extend(cases.iter().map(|(_, target)| *target));
                targets
            }
            _ => Vec::new(),
        }
    }
}

/// Operand payload decoded for an instruction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum InstructionKind {
    Invoke(CallSite),
    Field(FieldRef),
    Branch {
        target: u32,
    },
    Switch {
        default: u32,
        cases: Vec<(i32, u32)>,
    },
    Constant(ConstantValue),
    /// Class operand of `new`, `checkcast`, `instanceof`, `anewarray` or a class `ldc`.
    Type(String),
    NewArray(ArrayKind),
    MultiNewArray {
        descriptor: String,
        dimensions: u8,
    },
    Local {
        index: u16,
    },
    Increment {
        index: u16,
        delta: i16,
    },
    #[default]
    Other,
}

/// Stack effect reported by the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEffect {
    pub pops: u8,
    pub pushes: u8,
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub kind: CallKind,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
    Dynamic,
}

/// Field operand of `getfield`/`putfield`/`getstatic`/`putstatic`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// Element type operand of `newarray`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayKind {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl ArrayKind {
    /// Array type descriptor, e.g. `[I`.
    pub fn descriptor(self) -> &'static str {
        match self {
            ArrayKind::Boolean => "[Z",
            ArrayKind::Char => "[C",
            ArrayKind::Float => "[F",
            ArrayKind::Double => "[D",
            ArrayKind::Byte => "[B",
            ArrayKind::Short => "[S",
            ArrayKind::Int => "[I",
            ArrayKind::Long => "[J",
        }
    }
}

/// Descriptor text of a parsed type, e.g. `[[I` or `Ljava/lang/String;`.
pub fn descriptor_text(descriptor: &TypeDescriptor) -> String {
    match descriptor {
        TypeDescriptor::Byte => "B".to_string(),
        TypeDescriptor::Char => "C".to_string(),
        TypeDescriptor::Double => "D".to_string(),
        TypeDescriptor::Float => "F".to_string(),
        TypeDescriptor::Integer => "I".to_string(),
        TypeDescriptor::Long => "J".to_string(),
        TypeDescriptor::Short => "S".to_string(),
        TypeDescriptor::Boolean => "Z".to_string(),
        TypeDescriptor::Void => "V".to_string(),
        TypeDescriptor::Object(name) => format!("L{name};"),
        TypeDescriptor::Array(element, dimensions) => format!(
            "{}{}",
            "[".repeat(usize::from(*dimensions)),
            descriptor_text(element)
        ),
    }
}

/// Literal value shared by bytecode constants and source constant folding.
///
/// Floating point values compare by bit pattern so the type is usable as a map key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ConstantValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Char(u16),
    Str(String),
    Null,
}

impl ConstantValue {
    fn rank(&self) -> u8 {
        match self {
            ConstantValue::Int(_) => 0,
            ConstantValue::Long(_) => 1,
            ConstantValue::Float(_) => 2,
            ConstantValue::Double(_) => 3,
            ConstantValue::Bool(_) => 4,
            ConstantValue::Char(_) => 5,
            ConstantValue::Str(_) => 6,
            ConstantValue::Null => 7,
        }
    }
}

impl PartialEq for ConstantValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ConstantValue {}

impl PartialOrd for ConstantValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConstantValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use ConstantValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Long(a), Long(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.to_bits().cmp(&b.to_bits()),
            (Double(a), Double(b)) => a.to_bits().cmp(&b.to_bits()),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Char(a), Char(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for ConstantValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ConstantValue::Int(v) => v.hash(state),
            ConstantValue::Long(v) => v.hash(state),
            ConstantValue::Float(v) => v.to_bits().hash(state),
            ConstantValue::Double(v) => v.to_bits().hash(state),
            ConstantValue::Bool(v) => v.hash(state),
            ConstantValue::Char(v) => v.hash(state),
            ConstantValue::Str(v) => v.hash(state),
            ConstantValue::Null => {}
        }
    }
}

/// Edge classification used for CFG inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    FallThrough,
    ConditionalTrue,
    ConditionalFalse,
    Exception,
    Jump,
    Return,
}

/// Successor of a block: another block or the method exit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum BlockTarget {
    Block(usize),
    Exit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Successor {
    pub target: BlockTarget,
    pub kind: EdgeKind,
}

/// Edge between two blocks, flattened for inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: usize,
    pub to: BlockTarget,
    pub kind: EdgeKind,
}

/// Basic block covering a range of bytecode offsets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstructionBlock {
    pub index: usize,
    pub start_offset: u32,
    /// Offset of the last instruction in the block.
    pub end_offset: u32,
    pub instructions: Vec<Instruction>,
    pub successors: Vec<Successor>,
}

impl InstructionBlock {
    /// Successor block indices, excluding the exit sentinel.
    pub fn successor_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.successors.iter().filter_map(|successor| match successor.target {
            BlockTarget::Block(index) => Some(index),
            BlockTarget::Exit => None,
        })
    }

    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}

/// Basic block graph for one method body. Entry is block 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstructionGraph {
    blocks: Vec<InstructionBlock>,
}

impl InstructionGraph {
    pub(crate) fn from_blocks(blocks: Vec<InstructionBlock>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[InstructionBlock] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&InstructionBlock> {
        self.blocks.get(index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry(&self) -> usize {
        0
    }

    /// Predecessor block indices per block, deduplicated and sorted.
    pub fn predecessors(&self) -> Vec<Vec<usize>> {
        let mut predecessors = vec![BTreeSet::new(); self.blocks.len()];
        for block in &self.blocks {
            for successor in block.successor_blocks() {
                predecessors[successor].insert(block.index);
            }
        }
        predecessors
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect()
    }

    pub fn edges(&self) -> Vec<FlowEdge> {
        self.blocks
            .iter()
            .flat_map(|block| {
                block.successors.iter().map(move |successor| FlowEdge {
                    from: block.index,
                    to: successor.target,
                    kind: successor.kind,
                })
            })
            .collect()
    }

    /// Blocks without any successor block.
    pub fn exit_blocks(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .filter(|block| block.successor_blocks().next().is_none())
            .map(|block| block.index)
            .collect()
    }

    pub fn block_of_offset(&self, offset: u32) -> Option<usize> {
        let position = self
            .blocks
            .partition_point(|block| block.start_offset <= offset);
        let block = self.blocks.get(position.checked_sub(1)?)?;
        (offset <= block.end_offset).then_some(block.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_values_compare_floats_by_bits() {
        assert_eq!(ConstantValue::Double(f64::NAN), ConstantValue::Double(f64::NAN));
        assert_ne!(ConstantValue::Float(0.0), ConstantValue::Float(-0.0));
        assert!(ConstantValue::Int(5) < ConstantValue::Long(0));
    }

    #[test]
    fn parsed_descriptors_render_back() {
        for text in ["I", "Ljava/lang/String;", "[[J", "[Ljava/util/Map;"] {
            let descriptor: TypeDescriptor = text.parse().expect("descriptor");
            assert_eq!(text, descriptor_text(&descriptor));
        }
    }

    #[test]
    fn instruction_constants_cover_short_forms() {
        let iconst = Instruction::simple(0, opcodes::ICONST_M1);
        assert_eq!(Some(ConstantValue::Int(-1)), iconst.constant_value());
        let dconst = Instruction::simple(0, opcodes::DCONST_1);
        assert_eq!(Some(ConstantValue::Double(1.0)), dconst.constant_value());
        let bipush = Instruction::new(
            0,
            opcodes::BIPUSH,
            InstructionKind::Constant(ConstantValue::Int(42)),
        );
        assert_eq!(Some(ConstantValue::Int(42)), bipush.constant_value());
    }

    #[test]
    fn signature_key_joins_owner_name_and_descriptor() {
        let signature = MethodSignature {
            owner: "a/B".to_string(),
            name: "run".to_string(),
            descriptor: "(I)V".to_string(),
            is_static: true,
        };
        assert_eq!("a/B.run(I)V", signature.key());
    }
}
