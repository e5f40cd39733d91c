//! Per-vulnerability patch presence decision over a whole artifact.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::analysis::constants::ConstantBinding;
use crate::analysis::dominators::Dominators;
use crate::analysis::library::LibraryConstants;
use crate::analysis::loops::find_loops;
use crate::analysis::operand_types::{OperandTypeBinding, TypeOptions};
use crate::analysis::{Analysis, ConstantAnalysis, DominatorAnalysis, OperandTypeAnalysis};
use crate::cfg::build_graph;
use crate::config::AnalysisConfig;
use crate::diff::{SourceLookup, SourcePair, parse_diff};
use crate::error::AnalysisResult;
use crate::features::{
    BytecodeMethod, FeatureSet, SourceMethod, extract_bytecode_features, extract_source_features,
};
use crate::ir::{ExceptionHandler, Instruction, MethodSignature};
use crate::matcher::{Verdict, match_patch_with};
use crate::syntax::SyntaxTree;

/// `group:artifact:version` of a Maven artifact.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactCoordinates {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

impl ArtifactCoordinates {
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split(':');
        let group = parts.next()?.trim();
        let artifact = parts.next()?.trim();
        let version = parts.next()?.trim();
        if parts.next().is_some() || group.is_empty() || artifact.is_empty() {
            return None;
        }
        Some(Self {
            group: group.to_string(),
            artifact: artifact.to_string(),
            version: version.to_string(),
        })
    }
}

impl fmt::Display for ArtifactCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)
    }
}

/// Reference features of one method on both sides of the patch.
///
/// A missing side means the patch adds or removes the method.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMethod {
    pub signature: MethodSignature,
    #[serde(default)]
    pub pre: Option<FeatureSet>,
    #[serde(default)]
    pub post: Option<FeatureSet>,
}

/// A known vulnerability and its fix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityInfo {
    pub advisory_id: String,
    pub artifact: ArtifactCoordinates,
    /// Unified diff of the fix.
    #[serde(default)]
    pub diff: String,
    /// Precomputed reference features.
    #[serde(default)]
    pub methods: Vec<ReferenceMethod>,
    /// Pre- and post-patch sources used to derive references and locate changes.
    #[serde(default)]
    pub sources: Option<SourcePair>,
}

/// A decoded method of the target artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub signature: MethodSignature,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub handlers: Vec<ExceptionHandler>,
}

/// Bytecode features of every method in the artifact under test.
#[derive(Clone, Debug, Default)]
pub struct TargetArtifact {
    methods: BTreeMap<MethodSignature, AnalysisResult<FeatureSet>>,
}

impl TargetArtifact {
    /// Analyse every method body in parallel; failures stay attached to their method.
    pub fn analyze(methods: &[MethodBody], config: &AnalysisConfig) -> Self {
        let methods: BTreeMap<MethodSignature, AnalysisResult<FeatureSet>> = methods
            .par_iter()
            .map(|body| {
                let result = analyze_method(body, config);
                if let Err(error) = &result {
                    warn!("skipping {}: {error}", body.signature.key());
                }
                (body.signature.clone(), result)
            })
            .collect();
        debug!("analysed {} target methods", methods.len());
        Self { methods }
    }

    /// Artifact from features computed elsewhere.
    pub fn from_features(features: impl IntoIterator<Item = (MethodSignature, FeatureSet)>) -> Self {
        Self {
            methods: features
                .into_iter()
                .map(|(signature, set)| (signature, Ok(set)))
                .collect(),
        }
    }

    pub fn get(&self, signature: &MethodSignature) -> Option<&AnalysisResult<FeatureSet>> {
        self.methods.get(signature)
    }

    /// Exact signature first, then the only method with the same owner and name.
    pub fn resolve(
        &self,
        signature: &MethodSignature,
    ) -> Option<(&MethodSignature, &AnalysisResult<FeatureSet>)> {
        if let Some(found) = self.methods.get_key_value(signature) {
            return Some(found);
        }
        let mut candidates = self
            .methods
            .iter()
            .filter(|(key, _)| key.owner == signature.owner && key.name == signature.name);
        let first = candidates.next()?;
        candidates.next().is_none().then_some(first)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Graph, flow analyses and bytecode features of one method.
pub fn analyze_method(body: &MethodBody, config: &AnalysisConfig) -> AnalysisResult<FeatureSet> {
    let graph = build_graph(&body.instructions, &body.handlers)?;
    let cap = config.iteration_cap(graph.len());
    let dominators: Dominators = DominatorAnalysis { cap }.run(&graph)?;
    let loops = find_loops(&graph, &dominators);
    let types: OperandTypeBinding = OperandTypeAnalysis {
        signature: &body.signature,
        handlers: &body.handlers,
        options: TypeOptions {
            strict: config.strict_opcodes,
            cap,
        },
    }
    .run(&graph)?;
    let method = BytecodeMethod {
        signature: &body.signature,
        graph: &graph,
        dominators: &dominators,
        loops: &loops,
        types: &types,
    };
    Ok(extract_bytecode_features(&method, &config.features))
}

/// Source-side reference features for every method of either tree.
pub fn reference_methods(
    pre: Option<&SyntaxTree>,
    post: Option<&SyntaxTree>,
    table: &LibraryConstants,
    config: &AnalysisConfig,
) -> AnalysisResult<Vec<ReferenceMethod>> {
    let mut by_signature: BTreeMap<MethodSignature, ReferenceMethod> = BTreeMap::new();
    for (tree, is_post) in [(pre, false), (post, true)] {
        let Some(tree) = tree else {
            continue;
        };
        tree.validate()?;
        let binding: ConstantBinding = ConstantAnalysis { table }.run(tree)?;
        for method in tree.methods() {
            let Some(signature) = tree.method_signature(method) else {
                continue;
            };
            let source = SourceMethod {
                tree,
                method,
                constants: &binding,
            };
            let features = extract_source_features(&source, &config.features);
            let entry = by_signature
                .entry(signature.clone())
                .or_insert_with(|| ReferenceMethod {
                    signature,
                    pre: None,
                    post: None,
                });
            if is_post {
                entry.post = Some(features);
            } else {
                entry.pre = Some(features);
            }
        }
    }
    Ok(by_signature.into_values().collect())
}

/// Verdict for one affected method.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodVerdict {
    /// Reference method key.
    pub method: String,
    /// Target method it was compared with, when one was found.
    pub target: Option<String>,
    pub verdict: Verdict,
    pub pre_score: Option<f64>,
    pub post_score: Option<f64>,
    pub discriminating: usize,
    pub error: Option<String>,
}

/// Outcome for one vulnerability against one artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchReport {
    pub advisory_id: String,
    pub artifact: String,
    pub verdict: Verdict,
    /// Share of decisive evidence pointing to the patched version.
    pub patched_ratio: Option<f64>,
    pub methods: Vec<MethodVerdict>,
    /// Diff files that could not be parsed.
    pub diff_errors: Vec<String>,
}

pub struct PatchAnalyzer {
    config: AnalysisConfig,
    library: LibraryConstants,
}

impl PatchAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        let library = config.library();
        Self { config, library }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyse independent vulnerabilities in parallel.
    pub fn analyze_all(
        &self,
        vulnerabilities: &[VulnerabilityInfo],
        target: &TargetArtifact,
    ) -> Vec<PatchReport> {
        vulnerabilities
            .par_iter()
            .map(|vulnerability| self.analyze(vulnerability, target))
            .collect()
    }

    pub fn analyze(&self, vulnerability: &VulnerabilityInfo, target: &TargetArtifact) -> PatchReport {
        let mut diff_errors = Vec::new();
        let mut references: BTreeMap<MethodSignature, ReferenceMethod> = vulnerability
            .methods
            .iter()
            .map(|method| (method.signature.clone(), method.clone()))
            .collect();

        let sources = ValidSources::new(vulnerability.sources.as_ref(), &mut diff_errors);
        let paths: BTreeSet<&str> = sources.pre.keys().chain(sources.post.keys()).copied().collect();
        for path in paths {
            if !self.config.accepts_file(path) {
                continue;
            }
            match reference_methods(
                sources.pre_tree(path),
                sources.post_tree(path),
                &self.library,
                &self.config,
            ) {
                Ok(methods) => {
                    for method in methods {
                        references.entry(method.signature.clone()).or_insert(method);
                    }
                }
                Err(error) => diff_errors.push(format!("{path}: {error}")),
            }
        }

        let mut affected: BTreeSet<MethodSignature> = BTreeSet::new();
        for file in parse_diff(&vulnerability.diff, &sources) {
            match file {
                Ok(file) => {
                    if !file.path().is_some_and(|path| self.config.accepts_file(path)) {
                        continue;
                    }
                    affected.extend(file.methods().into_iter().cloned());
                }
                Err(error) => diff_errors.push(error.to_string()),
            }
        }
        if affected.is_empty() {
            affected.extend(references.keys().cloned());
        }

        let methods: Vec<MethodVerdict> = affected
            .iter()
            .filter_map(|signature| {
                let Some(reference) = references.get(signature) else {
                    warn!(
                        "{}: no reference features for {}",
                        vulnerability.advisory_id,
                        signature.key()
                    );
                    return None;
                };
                Some(self.judge(reference, target))
            })
            .collect();

        let (verdict, patched_ratio) = aggregate(&methods, self.config.presence_threshold);
        info!(
            "{} on {}: {:?} over {} methods",
            vulnerability.advisory_id,
            vulnerability.artifact,
            verdict,
            methods.len()
        );
        PatchReport {
            advisory_id: vulnerability.advisory_id.clone(),
            artifact: vulnerability.artifact.to_string(),
            verdict,
            patched_ratio,
            methods,
            diff_errors,
        }
    }

    fn judge(&self, reference: &ReferenceMethod, target: &TargetArtifact) -> MethodVerdict {
        let mut verdict = MethodVerdict {
            method: reference.signature.key(),
            target: None,
            verdict: Verdict::Inconclusive,
            pre_score: None,
            post_score: None,
            discriminating: 0,
            error: None,
        };
        let evidence = |set: &FeatureSet| set.size().max(1);

        match (target.resolve(&reference.signature), &reference.pre, &reference.post) {
            (None, None, Some(post)) => {
                verdict.verdict = Verdict::Vulnerable;
                verdict.discriminating = evidence(post);
            }
            (None, Some(pre), None) => {
                verdict.verdict = Verdict::Patched;
                verdict.discriminating = evidence(pre);
            }
            (None, _, _) => verdict.verdict = Verdict::Unmatched,
            (Some((key, Err(error))), _, _) => {
                verdict.target = Some(key.key());
                verdict.error = Some(error.to_string());
            }
            (Some((key, Ok(features))), pre, post) => {
                verdict.target = Some(key.key());
                match (pre, post) {
                    (Some(pre), Some(post)) => {
                        let outcome = match_patch_with(
                            features,
                            pre,
                            post,
                            self.config.margin,
                            &self.config.weights,
                        );
                        verdict.verdict = outcome.verdict;
                        verdict.pre_score = Some(outcome.pre_score);
                        verdict.post_score = Some(outcome.post_score);
                        verdict.discriminating = outcome.discriminating;
                    }
                    (None, Some(post)) => {
                        verdict.verdict = Verdict::Patched;
                        verdict.discriminating = evidence(post);
                    }
                    (Some(pre), None) => {
                        verdict.verdict = Verdict::Vulnerable;
                        verdict.discriminating = evidence(pre);
                    }
                    (None, None) => {}
                }
            }
        }
        debug!("{}: {:?}", verdict.method, verdict.verdict);
        verdict
    }
}

/// Source trees whose node links check out; broken trees are reported and left out.
#[derive(Default)]
struct ValidSources<'a> {
    pre: BTreeMap<&'a str, &'a SyntaxTree>,
    post: BTreeMap<&'a str, &'a SyntaxTree>,
}

impl<'a> ValidSources<'a> {
    fn new(sources: Option<&'a SourcePair>, errors: &mut Vec<String>) -> Self {
        let mut valid = Self::default();
        let Some(sources) = sources else {
            return valid;
        };
        for (side, trees) in [(&mut valid.pre, &sources.pre), (&mut valid.post, &sources.post)] {
            for (path, tree) in trees {
                match tree.validate() {
                    Ok(()) => {
                        side.insert(path.as_str(), tree);
                    }
                    Err(error) => {
                        warn!("skipping source tree {path}: {error}");
                        errors.push(error.to_string());
                    }
                }
            }
        }
        valid
    }
}

impl SourceLookup for ValidSources<'_> {
    fn pre_tree(&self, path: &str) -> Option<&SyntaxTree> {
        self.pre.get(path).copied()
    }

    fn post_tree(&self, path: &str) -> Option<&SyntaxTree> {
        self.post.get(path).copied()
    }
}

/// Weigh decisive method verdicts by their discriminating evidence.
fn aggregate(methods: &[MethodVerdict], threshold: f64) -> (Verdict, Option<f64>) {
    let mut patched = 0.0;
    let mut total = 0.0;
    for method in methods.iter().filter(|method| method.verdict.is_decisive()) {
        let weight = method.discriminating.max(1) as f64;
        total += weight;
        if method.verdict == Verdict::Patched {
            patched += weight;
        }
    }
    if total == 0.0 {
        let all_unmatched = !methods.is_empty()
            && methods
                .iter()
                .all(|method| method.verdict == Verdict::Unmatched);
        let verdict = if all_unmatched {
            Verdict::Unmatched
        } else {
            Verdict::Inconclusive
        };
        return (verdict, None);
    }
    let ratio = patched / total;
    let verdict = if ratio >= threshold {
        Verdict::Patched
    } else if ratio <= 1.0 - threshold {
        Verdict::Vulnerable
    } else {
        Verdict::Inconclusive
    };
    (verdict, Some(ratio))
}
