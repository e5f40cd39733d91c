//! Shape-and-content signatures of a method, comparable across bytecode and source.

use std::collections::BTreeMap;

use jdescriptor::TypeDescriptor;
use serde::{Deserialize, Serialize};

use crate::ir::{ConstantValue, descriptor_text};

mod bytecode;
mod source;

pub use bytecode::{BytecodeMethod, extract_bytecode_features};
pub use source::{SourceMethod, extract_source_features};

/// Counted bag of feature keys.
pub type Multiset<K> = BTreeMap<K, usize>;

/// Call target in `owner/name/arity` form with an internal (slash) owner.
pub type CallTarget = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureOrigin {
    Bytecode,
    Source,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InstructionShape {
    Throw,
    Monitor,
    Switch,
    InstanceOf,
    Return,
    Loop,
    BranchLt,
    BranchLe,
    BranchGt,
    BranchGe,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
}

/// Loop nesting depth plus how its exits are decided.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoopSignature {
    pub depth: usize,
    /// Exits comparing against a constant.
    pub constant_exits: usize,
    /// Exits comparing against another variable.
    pub variable_exits: usize,
    /// Exits decided by a call result.
    pub call_exits: usize,
}

/// Which feature families to compute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub call_sites: bool,
    pub constants: bool,
    pub loops: bool,
    pub shapes: bool,
    pub field_accesses: bool,
    pub object_creations: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            call_sites: true,
            constants: true,
            loops: true,
            shapes: true,
            field_accesses: true,
            object_creations: true,
        }
    }
}

/// Normalised fingerprint of one method.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub origin: FeatureOrigin,
    /// Method key, `owner.name+descriptor`.
    pub method: String,
    #[serde(default)]
    pub shapes: Multiset<InstructionShape>,
    #[serde(default)]
    pub loops: Vec<LoopSignature>,
    /// Per-block call targets in dominance order; empty groups are omitted.
    #[serde(default)]
    pub call_sites: Vec<Multiset<CallTarget>>,
    #[serde(default, with = "entries")]
    pub constants: Multiset<ConstantValue>,
    #[serde(default)]
    pub field_accesses: Multiset<String>,
    #[serde(default)]
    pub object_creations: Multiset<String>,
}

impl FeatureSet {
    pub fn new(origin: FeatureOrigin, method: impl Into<String>) -> Self {
        Self {
            origin,
            method: method.into(),
            shapes: Multiset::new(),
            loops: Vec::new(),
            call_sites: Vec::new(),
            constants: Multiset::new(),
            field_accesses: Multiset::new(),
            object_creations: Multiset::new(),
        }
    }

    /// All call targets regardless of block.
    pub fn calls(&self) -> Multiset<CallTarget> {
        let mut all = Multiset::new();
        for group in &self.call_sites {
            for (target, count) in group {
                *all.entry(target.clone()).or_default() += count;
            }
        }
        all
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
            && self.loops.is_empty()
            && self.call_sites.is_empty()
            && self.constants.is_empty()
            && self.field_accesses.is_empty()
            && self.object_creations.is_empty()
    }

    /// Number of feature occurrences over every family.
    pub fn size(&self) -> usize {
        self.shapes.values().sum::<usize>()
            + self.loops.len()
            + self.call_sites.iter().flat_map(|group| group.values()).sum::<usize>()
            + self.constants.values().sum::<usize>()
            + self.field_accesses.values().sum::<usize>()
            + self.object_creations.values().sum::<usize>()
    }

    pub(crate) fn add_constant(&mut self, value: &ConstantValue) {
        if let Some(value) = normalize_constant(value) {
            bump(&mut self.constants, value);
        }
    }
}

pub(crate) fn bump<K: Ord>(set: &mut Multiset<K>, key: K) {
    *set.entry(key).or_default() += 1;
}

/// Booleans and chars as ints; null carries no information.
pub(crate) fn normalize_constant(value: &ConstantValue) -> Option<ConstantValue> {
    match value {
        ConstantValue::Null => None,
        ConstantValue::Bool(flag) => Some(ConstantValue::Int(i32::from(*flag))),
        ConstantValue::Char(ch) => Some(ConstantValue::Int(i32::from(*ch))),
        other => Some(other.clone()),
    }
}

/// `Foo$1`, `val$2` and similar compiler-generated names.
fn has_anonymous_segment(name: &str) -> bool {
    name.split('$')
        .skip(1)
        .any(|segment| !segment.is_empty() && segment.chars().all(|ch| ch.is_ascii_digit()))
}

fn ends_with_anonymous_suffix(name: &str) -> bool {
    match name.rsplit_once('$') {
        Some((_, suffix)) => !suffix.is_empty() && suffix.chars().all(|ch| ch.is_ascii_digit()),
        None => false,
    }
}

/// Calls that compilers insert or drop freely, and synthetic targets.
pub(crate) fn is_noise_call(owner: &str, name: &str) -> bool {
    matches!(
        name,
        "toString" | "valueOf" | "append" | "longValue" | "makeConcatWithConstants"
    ) || (name == "<init>" && matches!(owner, "java/lang/Object" | "java/lang/StringBuilder"))
        || ends_with_anonymous_suffix(name)
        || name.starts_with("lambda$")
        || name.starts_with("access$")
        || has_anonymous_segment(owner)
}

/// Normalised call target, or `None` for filtered calls.
pub(crate) fn call_target(owner: &str, name: &str, arity: usize) -> Option<CallTarget> {
    let owner = owner.replace('.', "/");
    if is_noise_call(&owner, name) {
        return None;
    }
    Some(format!("{owner}/{name}/{arity}"))
}

/// Normalised field access key, or `None` for synthetic fields.
pub(crate) fn field_key(owner: &str, name: &str) -> Option<String> {
    let owner = owner.replace('.', "/");
    if owner == "java/lang/Void" || owner.contains('$') || ends_with_anonymous_suffix(name) {
        return None;
    }
    Some(format!("{owner}/{name}"))
}

/// Key recorded for `array.length`.
pub(crate) const ARRAY_LENGTH: &str = "[]/length";

/// Object creation key, `None` for string-building noise.
pub(crate) fn creation_key(internal: &str) -> Option<String> {
    (internal != "java/lang/StringBuilder" && !has_anonymous_segment(internal))
        .then(|| internal.to_string())
}

/// JVM descriptor of a source type such as `int`, `java.lang.String` or `int[]`.
pub(crate) fn type_descriptor(ty: &str) -> String {
    descriptor_text(&source_type(ty))
}

fn source_type(ty: &str) -> TypeDescriptor {
    let element = ty.trim_end_matches("[]");
    let dimensions = (ty.len() - element.len()) / 2;
    let base = match element {
        "boolean" => TypeDescriptor::Boolean,
        "byte" => TypeDescriptor::Byte,
        "char" => TypeDescriptor::Char,
        "short" => TypeDescriptor::Short,
        "int" => TypeDescriptor::Integer,
        "long" => TypeDescriptor::Long,
        "float" => TypeDescriptor::Float,
        "double" => TypeDescriptor::Double,
        "void" => TypeDescriptor::Void,
        other => TypeDescriptor::Object(other.replace('.', "/")),
    };
    match dimensions.try_into() {
        Ok(dimensions) if ty.len() > element.len() => {
            TypeDescriptor::Array(Box::new(base), dimensions)
        }
        _ => base,
    }
}

/// Serialize a multiset as a list of pairs so non-string keys survive JSON.
mod entries {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Multiset;

    pub fn serialize<K, S>(set: &Multiset<K>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(set.iter())
    }

    pub fn deserialize<'de, K, D>(deserializer: D) -> Result<Multiset<K>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        D: Deserializer<'de>,
    {
        let pairs: Vec<(K, usize)> = Vec::deserialize(deserializer)?;
        let mut set = Multiset::new();
        for (key, count) in pairs {
            *set.entry(key).or_default() += count;
        }
        Ok(set)
    }
}
