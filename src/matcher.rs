//! Comparative matching of a target method against pre- and post-patch references.
//!
//! Absolute similarity between bytecode and source features is noisy, so the
//! matcher only asks which reference the target is closer to. Each family is
//! restricted to the features that differ between the references, with the
//! shared floor removed, and compared by weighted Jaccard similarity.

use std::collections::BTreeSet;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::features::{FeatureSet, LoopSignature, Multiset};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Patched,
    Vulnerable,
    Inconclusive,
    /// The target shares nothing with either reference.
    Unmatched,
}

impl Verdict {
    pub fn is_decisive(self) -> bool {
        matches!(self, Verdict::Patched | Verdict::Vulnerable)
    }
}

/// Relative weight of each feature family in the combined score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchWeights {
    pub call_sites: f64,
    pub constants: f64,
    pub loops: f64,
    pub shapes: f64,
    /// Field accesses and object creations.
    pub accesses: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            call_sites: 0.35,
            constants: 0.25,
            loops: 0.15,
            shapes: 0.15,
            accesses: 0.10,
        }
    }
}

impl MatchWeights {
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.call_sites,
            self.constants,
            self.loops,
            self.shapes,
            self.accesses,
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub verdict: Verdict,
    /// Similarity of the target to the pre-patch reference, in [0, 1].
    pub pre_score: f64,
    /// Similarity of the target to the post-patch reference, in [0, 1].
    pub post_score: f64,
    /// Number of feature occurrences that tell the references apart.
    pub discriminating: usize,
}

/// Decide whether `target` looks like `pre` or `post` with default weights.
pub fn match_patch(target: &FeatureSet, pre: &FeatureSet, post: &FeatureSet, margin: f64) -> MatchOutcome {
    match_patch_with(target, pre, post, margin, &MatchWeights::default())
}

pub fn match_patch_with(
    target: &FeatureSet,
    pre: &FeatureSet,
    post: &FeatureSet,
    margin: f64,
    weights: &MatchWeights,
) -> MatchOutcome {
    let families = [
        (
            weights.call_sites,
            compare(&target.calls(), &pre.calls(), &post.calls()),
        ),
        (
            weights.constants,
            compare(&target.constants, &pre.constants, &post.constants),
        ),
        (weights.loops, compare_loops(&target.loops, &pre.loops, &post.loops)),
        (
            weights.shapes,
            compare(&target.shapes, &pre.shapes, &post.shapes),
        ),
        (
            weights.accesses,
            compare(&accesses(target), &accesses(pre), &accesses(post)),
        ),
    ];

    let shared = families.iter().any(|(_, family)| family.shared);
    let discriminating: usize = families.iter().map(|(_, family)| family.discriminating).sum();
    let mut total_weight = 0.0;
    let mut pre_score = 0.0;
    let mut post_score = 0.0;
    for (weight, family) in &families {
        if family.discriminating == 0 || *weight <= 0.0 {
            continue;
        }
        total_weight += weight;
        pre_score += weight * family.pre;
        post_score += weight * family.post;
    }
    if total_weight > 0.0 {
        pre_score /= total_weight;
        post_score /= total_weight;
    }

    let verdict = if !shared {
        Verdict::Unmatched
    } else if total_weight == 0.0 {
        Verdict::Inconclusive
    } else if post_score - pre_score >= margin && post_score > pre_score {
        Verdict::Patched
    } else if pre_score - post_score >= margin && pre_score > post_score {
        Verdict::Vulnerable
    } else {
        Verdict::Inconclusive
    };

    debug!(
        "{}: {:?} (pre {:.3}, post {:.3}, {} discriminating)",
        target.method, verdict, pre_score, post_score, discriminating
    );
    MatchOutcome {
        verdict,
        pre_score,
        post_score,
        discriminating,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct FamilyScore {
    pre: f64,
    post: f64,
    discriminating: usize,
    /// Target has at least one feature present in a reference.
    shared: bool,
}

fn accesses(set: &FeatureSet) -> Multiset<String> {
    let mut merged = Multiset::new();
    for (key, count) in &set.field_accesses {
        *merged.entry(format!("get {key}")).or_default() += count;
    }
    for (key, count) in &set.object_creations {
        *merged.entry(format!("new {key}")).or_default() += count;
    }
    merged
}

fn compare<K: Ord + Clone>(target: &Multiset<K>, pre: &Multiset<K>, post: &Multiset<K>) -> FamilyScore {
    let shared = target
        .keys()
        .any(|key| pre.contains_key(key) || post.contains_key(key));

    let keys: BTreeSet<&K> = pre.keys().chain(post.keys()).collect();
    let mut score = FamilyScore {
        shared,
        ..FamilyScore::default()
    };
    let (mut pre_min, mut pre_max, mut post_min, mut post_max) = (0, 0, 0, 0);
    for key in keys {
        let in_pre = pre.get(key).copied().unwrap_or(0);
        let in_post = post.get(key).copied().unwrap_or(0);
        if in_pre == in_post {
            continue;
        }
        let floor = in_pre.min(in_post);
        let residual_pre = in_pre - floor;
        let residual_post = in_post - floor;
        let residual_target = target.get(key).copied().unwrap_or(0).saturating_sub(floor);
        score.discriminating += residual_pre.abs_diff(residual_post);
        pre_min += residual_target.min(residual_pre);
        pre_max += residual_target.max(residual_pre);
        post_min += residual_target.min(residual_post);
        post_max += residual_target.max(residual_post);
    }
    score.pre = jaccard(pre_min, pre_max);
    score.post = jaccard(post_min, post_max);
    score
}

/// Loop multisets, plus full credit when the target's loops equal one reference exactly.
fn compare_loops(target: &[LoopSignature], pre: &[LoopSignature], post: &[LoopSignature]) -> FamilyScore {
    let mut score = compare(&loop_set(target), &loop_set(pre), &loop_set(post));
    if score.discriminating > 0 {
        let target = loop_set(target);
        if target == loop_set(pre) {
            score.pre = 1.0;
        }
        if target == loop_set(post) {
            score.post = 1.0;
        }
    }
    score
}

fn loop_set(loops: &[LoopSignature]) -> Multiset<LoopSignature> {
    let mut set = Multiset::new();
    for signature in loops {
        *set.entry(*signature).or_default() += 1;
    }
    set
}

fn jaccard(intersection: usize, union: usize) -> f64 {
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}
