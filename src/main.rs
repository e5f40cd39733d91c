use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use patchprobe::patch::{MethodBody, PatchAnalyzer, PatchReport, TargetArtifact, VulnerabilityInfo};
use patchprobe::AnalysisConfig;

/// CLI arguments for patchprobe execution.
#[derive(Parser, Debug)]
#[command(
    name = "patchprobe",
    about = "Decide whether JVM bytecode contains known security patches.",
    version
)]
struct Cli {
    /// JSON request with target methods and vulnerabilities.
    #[arg(long, value_name = "PATH")]
    request: PathBuf,
    /// JSON analysis configuration.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Override the configured similarity margin.
    #[arg(long)]
    margin: Option<f64>,
    /// Fail methods with unsupported opcodes instead of degrading.
    #[arg(long)]
    strict: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    methods: Vec<MethodBody>,
    #[serde(default)]
    vulnerabilities: Vec<VulnerabilityInfo>,
}

#[derive(Debug, Serialize)]
struct Report {
    tool: ToolInfo,
    invocation: Invocation,
    results: Vec<PatchReport>,
}

#[derive(Debug, Serialize)]
struct ToolInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct Invocation {
    arguments: Vec<String>,
    command_line: String,
    margin: f64,
    presence_threshold: f64,
    strict_opcodes: bool,
    /// Target methods analysed without error.
    analysed_methods: usize,
    failed_methods: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    run(cli)
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Off
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .target(env_logger::Target::Stderr);
    if !cli.quiet {
        builder.parse_default_env();
    }
    builder.init();
}

fn run(cli: Cli) -> Result<()> {
    if !cli.request.exists() {
        anyhow::bail!("request not found: {}", cli.request.display());
    }
    let config = load_config(&cli)?;

    let started_at = Instant::now();
    let request = read_request(&cli.request)?;
    let target = TargetArtifact::analyze(&request.methods, &config);
    let failed_methods = request
        .methods
        .iter()
        .filter(|body| matches!(target.get(&body.signature), Some(Err(_))))
        .count();
    let analysed_at = Instant::now();
    let invocation = build_invocation(&config, &target, failed_methods);

    let analyzer = PatchAnalyzer::new(config);
    let results = analyzer.analyze_all(&request.vulnerabilities, &target);

    let report = Report {
        tool: ToolInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        },
        invocation,
        results,
    };

    let mut writer = report_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &report)
        .context("failed to serialize report")?;
    writer.write_all(b"\n").context("failed to write report")?;
    writer.flush().context("failed to flush report")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} bytecode_ms={} methods={} vulnerabilities={}",
            started_at.elapsed().as_millis(),
            analysed_at.duration_since(started_at).as_millis(),
            target.len(),
            request.vulnerabilities.len()
        );
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AnalysisConfig> {
    let mut config = match &cli.config {
        Some(path) => AnalysisConfig::from_path(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(margin) = cli.margin {
        config.margin = margin;
    }
    if cli.strict {
        config.strict_opcodes = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read_request(path: &Path) -> Result<Request> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Report destination; no path or `-` means stdout.
fn report_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    let Some(path) = output.filter(|path| *path != Path::new("-")) else {
        return Ok(Box::new(io::stdout().lock()));
    };
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn build_invocation(
    config: &AnalysisConfig,
    target: &TargetArtifact,
    failed_methods: usize,
) -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    Invocation {
        command_line: arguments.join(" "),
        arguments,
        margin: config.margin,
        presence_threshold: config.presence_threshold,
        strict_opcodes: config.strict_opcodes,
        analysed_methods: target.len().saturating_sub(failed_methods),
        failed_methods,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn cli(request: PathBuf, output: PathBuf) -> Cli {
        Cli {
            request,
            config: None,
            output: Some(output),
            margin: None,
            strict: false,
            quiet: true,
            timing: false,
            verbose: false,
        }
    }

    #[test]
    fn report_lists_every_vulnerability() {
        let dir = tempfile::tempdir().expect("temp dir");
        let request = dir.path().join("request.json");
        let output = dir.path().join("report.json");
        let mut file = File::create(&request).expect("create request");
        write!(
            file,
            r#"{{
                "methods": [{{
                    "signature": {{"owner": "a/B", "name": "run", "descriptor": "()V", "is_static": true}},
                    "instructions": [{{"offset": 0, "opcode": 177}}]
                }}],
                "vulnerabilities": [{{
                    "advisory_id": "CVE-2024-0003",
                    "artifact": {{"group": "org.example", "artifact": "b", "version": "2.0"}}
                }}]
            }}"#
        )
        .expect("write request");

        run(cli(request, output.clone())).expect("run");

        let text = fs::read_to_string(&output).expect("read report");
        let value: serde_json::Value = serde_json::from_str(&text).expect("parse report");
        assert_eq!(value["tool"]["name"], "patchprobe");
        assert_eq!(value["invocation"]["analysed_methods"], 1);
        assert_eq!(value["invocation"]["margin"], 0.1);
        assert_eq!(value["results"][0]["advisory_id"], "CVE-2024-0003");
        assert_eq!(value["results"][0]["artifact"], "org.example:b:2.0");
        assert_eq!(value["results"][0]["verdict"], "INCONCLUSIVE");
    }

    #[test]
    fn margin_flag_is_validated() {
        let dir = tempfile::tempdir().expect("temp dir");
        let request = dir.path().join("request.json");
        fs::write(&request, "{}").expect("write request");
        let mut cli = cli(request, dir.path().join("report.json"));
        cli.margin = Some(1.5);
        assert!(run(cli).is_err());
    }

    #[test]
    fn missing_request_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cli = cli(dir.path().join("absent.json"), dir.path().join("report.json"));
        let error = run(cli).expect_err("missing request");
        assert!(error.to_string().contains("request not found"));
    }
}
