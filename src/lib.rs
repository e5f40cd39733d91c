//! Patch-presence testing for JVM bytecode.
//!
//! Reference features are extracted from the source on both sides of a
//! security fix, bytecode features from the artifact under test, and each
//! affected method is judged by which side it resembles more.

pub mod analysis;
pub mod cfg;
pub mod config;
pub mod diff;
pub mod error;
pub mod features;
pub mod ir;
pub mod matcher;
mod opcodes;
pub mod patch;
pub mod syntax;

pub use config::AnalysisConfig;
pub use error::{AnalysisError, AnalysisResult};
pub use matcher::{MatchOutcome, Verdict, match_patch};
pub use patch::{PatchAnalyzer, PatchReport, TargetArtifact, VulnerabilityInfo};
