use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::analysis::library::LibraryConstants;
use crate::features::FeatureConfig;
use crate::ir::ConstantValue;
use crate::matcher::MatchWeights;

/// Tunable settings shared by every stage of the analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Fixed points stop after `iteration_cap_factor * max(blocks, 1)` rounds.
    pub iteration_cap_factor: usize,
    /// Fail on opcodes without a transfer rule instead of degrading to unknown.
    pub strict_opcodes: bool,
    pub features: FeatureConfig,
    pub weights: MatchWeights,
    /// Minimum similarity gap for a decisive verdict.
    pub margin: f64,
    /// Share of patched evidence needed to call an artifact patched.
    pub presence_threshold: f64,
    /// Extra well-known constants keyed like `java.lang.Integer#MAX_VALUE`.
    pub library_constants: BTreeMap<String, ConstantValue>,
    /// Only diff files under this prefix are considered.
    pub source_root: Option<String>,
    /// Diff files whose path contains any of these fragments are skipped.
    pub ignored_files: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            iteration_cap_factor: 32,
            strict_opcodes: false,
            features: FeatureConfig::default(),
            weights: MatchWeights::default(),
            margin: 0.1,
            presence_threshold: 0.6,
            library_constants: BTreeMap::new(),
            source_root: None,
            ignored_files: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    /// Load a JSON configuration file; missing fields keep their defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.iteration_cap_factor > 0,
            "iteration_cap_factor must be positive"
        );
        ensure!(
            (0.0..=1.0).contains(&self.margin),
            "margin must be within [0, 1], got {}",
            self.margin
        );
        ensure!(
            (0.0..=1.0).contains(&self.presence_threshold),
            "presence_threshold must be within [0, 1], got {}",
            self.presence_threshold
        );
        let weights = self.weights.as_array();
        if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
            bail!("match weights must be non-negative");
        }
        ensure!(
            weights.iter().sum::<f64>() > 0.0,
            "match weights must not all be zero"
        );
        Ok(())
    }

    /// Iteration cap for a graph with `blocks` blocks.
    pub fn iteration_cap(&self, blocks: usize) -> usize {
        self.iteration_cap_factor.saturating_mul(blocks.max(1))
    }

    /// Built-in library constants extended with the configured entries.
    pub fn library(&self) -> LibraryConstants {
        let mut library = LibraryConstants::builtin();
        library.extend(self.library_constants.clone());
        library
    }

    pub fn accepts_file(&self, path: &str) -> bool {
        if let Some(root) = &self.source_root {
            if !path.starts_with(root.as_str()) {
                return false;
            }
        }
        !self
            .ignored_files
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
    }
}
