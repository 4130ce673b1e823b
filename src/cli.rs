use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use crate::formats::InputFormat;
use crate::liftover::ChainMap;
use crate::output::TsvTableWriter;
use crate::pipeline::{ConvertConfig, Converter, DEFAULT_BATCH_SIZE};
use crate::reference::FastaReference;
use crate::report::{RunReport, RunSummary};

#[derive(Debug, Parser)]
#[command(author, version, about = "Convert variant input files into normalized variant tables", long_about = None)]
struct Cli {
    /// Input files (VCF-like or tabular; gzip accepted)
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Input file format (auto-detected if not specified)
    #[arg(long, value_enum, default_value_t = InputFormat::Auto)]
    format: InputFormat,

    /// Input genome assembly (e.g. hg19, GRCh37). Overrides anything the
    /// input declares; liftover runs when it differs from hg38.
    #[arg(long, value_name = "ASSEMBLY")]
    genome: Option<String>,

    /// Reference genome FASTA used to resolve missing reference bases
    #[arg(long, value_name = "FASTA")]
    reference: Option<PathBuf>,

    /// UCSC chain file for liftover to hg38
    #[arg(long, value_name = "CHAIN")]
    chain: Option<PathBuf>,

    /// Directory for the output tables
    #[arg(long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Base name for output tables and the run report
    #[arg(long, default_value = "run")]
    run_name: String,

    /// Worker pool size (0 = all cores)
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Lines per worker per read batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Skip sample columns and per-sample tables entirely
    #[arg(long)]
    ignore_sample: bool,

    /// Force the chrM liftover decision independently of the general one
    #[arg(long)]
    liftover_chrm: Option<bool>,

    /// Logging verbosity (e.g. error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let reference = match &cli.reference {
        Some(path) => Some(Arc::new(
            FastaReference::open(path)
                .with_context(|| format!("failed to open reference {}", path.display()))?,
        ) as Arc<dyn crate::reference::ReferenceReader>),
        None => None,
    };

    let lifter = match &cli.chain {
        Some(path) => Some(Arc::new(ChainMap::load(path)?) as Arc<dyn crate::liftover::Lifter>),
        None => None,
    };

    let mut config = ConvertConfig::new(cli.inputs.clone());
    config.input_format = cli.format;
    config.genome = cli.genome.clone();
    config.num_workers = cli.workers;
    config.batch_size = cli.batch_size;
    config.ignore_sample = cli.ignore_sample;
    config.liftover_chrm = cli.liftover_chrm;

    let converter = Converter::new(config, reference, lifter);
    let mut writer = TsvTableWriter::new(&cli.output_dir, &cli.run_name)?;
    let summary = converter.run(&mut writer)?;

    print_summary(&summary);

    let inputs: Vec<String> = cli
        .inputs
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    RunReport::new(&cli.run_name, &inputs, summary)
        .write(&cli.output_dir)
        .context("failed to write run report")?;

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .ok();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Converted {lines} lines into {variants} variants.",
        lines = summary.total_lines_converted,
        variants = summary.total_variants,
    );
    if summary.no_alt_allele_count > 0 {
        println!(
            "{count} lines or alleles had no alternate allele.",
            count = summary.no_alt_allele_count
        );
    }
    if summary.error_count > 0 {
        println!(
            "{count} lines or alleles were dropped; see the error table.",
            count = summary.error_count
        );
    }
    if !summary.detected_assemblies.is_empty() {
        println!(
            "Input assemblies: {}",
            summary.detected_assemblies.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["varconvert", "input.tsv"]);
        assert_eq!(cli.inputs, vec![PathBuf::from("input.tsv")]);
        assert_eq!(cli.format, InputFormat::Auto);
        assert_eq!(cli.run_name, "run");
        assert_eq!(cli.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn parses_liftover_flags() {
        let cli = Cli::parse_from([
            "varconvert",
            "in.vcf",
            "--genome",
            "hg19",
            "--chain",
            "hg19ToHg38.over.chain",
            "--liftover-chrm",
            "false",
            "--workers",
            "4",
        ]);
        assert_eq!(cli.genome.as_deref(), Some("hg19"));
        assert_eq!(cli.liftover_chrm, Some(false));
        assert_eq!(cli.workers, 4);
    }
}
