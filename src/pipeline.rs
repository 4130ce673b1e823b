use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;

use crate::batch::{LineBatchReader, LineChunk};
use crate::errors::{ConfigError, DropReason, ErrorEvent, ErrorTracker, StepFailure};
use crate::formats::{make_parser, FormatParser, InputFormat, ParseOutcome};
use crate::liftover::{Lifter, LiftoverEngine};
use crate::normalize::VariantNormalizer;
use crate::output::{self, OutputAssembler, TableWriter};
use crate::reference::ReferenceReader;
use crate::report::{ConversionStats, RunSummary};
use crate::variant::Candidate;

/// Assembly every committed variant is expressed in.
pub const SYSTEM_ASSEMBLY: &str = "hg38";

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// GRCh assembly names accepted from inputs, mapped onto UCSC-style names.
fn resolve_assembly_alias(raw: &str) -> String {
    match raw {
        "GRCh36" => String::from("hg18"),
        "GRCh37" => String::from("hg19"),
        "GRCh38" => String::from("hg38"),
        other => other.to_string(),
    }
}

/// Caller-owned configuration for a conversion run.
#[derive(Clone, Debug)]
pub struct ConvertConfig {
    pub inputs: Vec<PathBuf>,
    pub input_format: InputFormat,
    /// Declared input assembly; overrides anything the input declares.
    pub genome: Option<String>,
    /// Worker pool size; 0 means every available core.
    pub num_workers: usize,
    /// Lines per worker per read batch.
    pub batch_size: usize,
    pub ignore_sample: bool,
    /// Independent liftover decision for chrM; defaults to the general one.
    pub liftover_chrm: Option<bool>,
}

impl ConvertConfig {
    pub fn new(inputs: Vec<PathBuf>) -> Self {
        Self {
            inputs,
            input_format: InputFormat::Auto,
            genome: None,
            num_workers: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            ignore_sample: false,
            liftover_chrm: None,
        }
    }
}

/// The conversion pipeline: slices inputs into line batches, fans them out
/// across a bounded worker pool, and merges worker results in chunk order so
/// uid assignment is reproducible for any worker count.
pub struct Converter {
    config: ConvertConfig,
    reference: Option<Arc<dyn ReferenceReader>>,
    lifter: Option<Arc<dyn Lifter>>,
}

/// A committed candidate, tagged with its chunk-local uid slot.
struct CommittedRow {
    local_seq: u64,
    lifted: bool,
    var: Candidate,
}

/// Everything a worker hands back for one chunk. Workers share nothing
/// mutable; the coordinator reduces these sequentially.
#[derive(Default)]
struct WorkerOutput {
    committed: Vec<CommittedRow>,
    errors: Vec<ErrorEvent>,
    stats: ConversionStats,
    /// uid slots consumed by this chunk, dropped and duplicate alleles
    /// included.
    alleles_processed: u64,
}

struct WorkerContext<'a> {
    parser: &'a dyn FormatParser,
    normalizer: &'a VariantNormalizer,
    engine: &'a LiftoverEngine,
    file_no: u32,
    ignore_sample: bool,
}

impl Converter {
    pub fn new(
        config: ConvertConfig,
        reference: Option<Arc<dyn ReferenceReader>>,
        lifter: Option<Arc<dyn Lifter>>,
    ) -> Self {
        Self {
            config,
            reference,
            lifter,
        }
    }

    /// Run the conversion, streaming finished table batches into `writer`.
    /// The writer is flushed and closed on every exit path; buffered error
    /// rows are force-drained even when the run aborts.
    pub fn run(&self, writer: &mut dyn TableWriter) -> Result<RunSummary> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.effective_workers())
            .build()
            .context("failed to build worker pool")?;

        let mut tracker = ErrorTracker::new();
        let mut state = RunState::default();

        let outcome = self.convert_inputs(&pool, writer, &mut tracker, &mut state);

        let flush = force_flush(writer, &mut tracker);
        outcome?;
        flush?;

        let summary =
            RunSummary::from_stats(&state.stats, state.total_variants, state.assemblies);
        tracing::info!(
            lines_converted = summary.total_lines_converted,
            errors = summary.error_count,
            no_alt = summary.no_alt_allele_count,
            variants = summary.total_variants,
            "finished conversion"
        );
        Ok(summary)
    }

    fn effective_workers(&self) -> usize {
        if self.config.num_workers > 0 {
            self.config.num_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    fn convert_inputs(
        &self,
        pool: &rayon::ThreadPool,
        writer: &mut dyn TableWriter,
        tracker: &mut ErrorTracker,
        state: &mut RunState,
    ) -> Result<()> {
        for (file_no, path) in self.config.inputs.iter().enumerate() {
            self.convert_file(file_no as u32, path, pool, writer, tracker, state)?;
        }
        Ok(())
    }

    fn convert_file(
        &self,
        file_no: u32,
        path: &Path,
        pool: &rayon::ThreadPool,
        writer: &mut dyn TableWriter,
        tracker: &mut ErrorTracker,
        state: &mut RunState,
    ) -> Result<()> {
        let input_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut parser = make_parser(self.config.input_format, path);
        parser.setup(path)?;
        tracing::info!(
            input = %path.display(),
            format = parser.format_name(),
            "starting conversion"
        );

        let assembly = self.resolve_assembly(parser.as_ref());
        if !state.assemblies.contains(&assembly) {
            state.assemblies.push(assembly.clone());
        }

        let do_liftover = assembly != SYSTEM_ASSEMBLY;
        let do_liftover_chrm = self.config.liftover_chrm.unwrap_or(do_liftover);
        tracing::info!(
            assembly = %assembly,
            liftover = do_liftover,
            liftover_chrm = do_liftover_chrm,
            "liftover decision"
        );

        let engine = if do_liftover || do_liftover_chrm {
            let lifter = self
                .lifter
                .clone()
                .ok_or_else(|| ConfigError::MissingChainFile(assembly.clone()))?;
            LiftoverEngine::new(lifter, self.reference.clone(), do_liftover, do_liftover_chrm)
        } else {
            LiftoverEngine::disabled()
        };

        let normalizer = VariantNormalizer::new(self.reference.clone());
        let samples: Vec<String> = if self.config.ignore_sample {
            Vec::new()
        } else {
            parser.samples().to_vec()
        };
        let mut assembler = OutputAssembler::new(&samples);

        let mut reader = LineBatchReader::open(path)
            .with_context(|| format!("failed to open input {}", path.display()))?;
        let num_workers = pool.current_num_threads();
        let mut next_line: u64 = 1;

        loop {
            let (chunks, has_more) =
                reader.read_batch(next_line, num_workers, self.config.batch_size)?;
            if chunks.is_empty() {
                break;
            }
            let lines_read: usize = chunks.iter().map(LineChunk::len).sum();
            next_line += lines_read as u64;

            let ctx = WorkerContext {
                parser: parser.as_ref(),
                normalizer: &normalizer,
                engine: &engine,
                file_no,
                ignore_sample: self.config.ignore_sample,
            };
            let outputs: Vec<Result<WorkerOutput, ConfigError>> =
                pool.install(|| chunks.par_iter().map(|c| process_chunk(&ctx, c)).collect());

            assembler.begin_batch(lines_read);
            for result in outputs {
                let worker = result?;
                for row in &worker.committed {
                    let uid = state.uid + row.local_seq;
                    assembler.push_variant(uid, &row.var);
                    if row.lifted {
                        assembler.push_mapping(uid, &row.var);
                    }
                    for (sample, genotype) in &row.var.samples {
                        assembler.push_sample(uid, sample, genotype);
                    }
                    state.total_variants += 1;
                }
                state.uid += worker.alleles_processed;
                state.stats.absorb(&worker.stats);
                for event in &worker.errors {
                    tracker.record(file_no, &input_name, event);
                }
            }

            assembler.push_error_rows(tracker.drain(false));
            for batch in assembler.finish_batch() {
                writer.write_batch(&batch)?;
            }

            if !has_more {
                break;
            }
        }

        Ok(())
    }

    fn resolve_assembly(&self, parser: &dyn FormatParser) -> String {
        let declared = self
            .config
            .genome
            .clone()
            .or_else(|| parser.detected_assembly().map(str::to_string));
        match declared {
            Some(raw) => resolve_assembly_alias(&raw),
            None => {
                tracing::warn!(
                    "no input assembly declared or detected; assuming {SYSTEM_ASSEMBLY}"
                );
                String::from(SYSTEM_ASSEMBLY)
            }
        }
    }
}

#[derive(Default)]
struct RunState {
    stats: ConversionStats,
    uid: u64,
    total_variants: u64,
    assemblies: Vec<String>,
}

fn force_flush(writer: &mut dyn TableWriter, tracker: &mut ErrorTracker) -> Result<()> {
    let rows = tracker.drain(true);
    if !rows.is_empty() {
        writer.write_batch(&output::error_batch(rows))?;
    }
    writer.close()
}

fn process_chunk(ctx: &WorkerContext<'_>, chunk: &LineChunk) -> Result<WorkerOutput, ConfigError> {
    let mut out = WorkerOutput::default();
    for (line_no, line) in &chunk.lines {
        match ctx.parser.parse_line(line) {
            Err(e) => {
                out.stats.invalid += 1;
                out.errors.push(ErrorEvent {
                    line_no: *line_no,
                    message: e.to_string(),
                    expected: false,
                });
            }
            Ok(ParseOutcome::Ignore) => {}
            Ok(ParseOutcome::Variants(candidates)) if candidates.is_empty() => {
                out.stats.no_alt_allele += 1;
            }
            Ok(ParseOutcome::Variants(candidates)) => {
                process_line(ctx, *line_no, candidates, &mut out)?;
                out.stats.valid += 1;
            }
        }
    }
    Ok(out)
}

fn process_line(
    ctx: &WorkerContext<'_>,
    line_no: u64,
    candidates: Vec<Candidate>,
    out: &mut WorkerOutput,
) -> Result<(), ConfigError> {
    let line_base = out.alleles_processed;
    let allele_count = candidates.len() as u64;
    // Identity -> committed index for this line's first occurrences; None
    // marks a first occurrence that was dropped.
    let mut seen: HashMap<String, Option<usize>> = HashMap::new();

    for (ordinal, mut var) in candidates.into_iter().enumerate() {
        var.line_no = line_no;
        var.file_no = ctx.file_no;
        if ctx.ignore_sample {
            var.samples.clear();
        }
        let local_seq = line_base + ordinal as u64;

        if let Err(reason) = ctx.normalizer.normalize_chrom(&mut var) {
            record_drop(out, line_no, &reason);
            continue;
        }

        let key = var.identity_key();
        if let Some(first) = seen.get(&key) {
            // Duplicate allele on the same line: no row of its own, but its
            // genotype data lands on the first occurrence's uid. The slot it
            // occupies still counts toward uid assignment.
            if let Some(idx) = *first {
                let target = &mut out.committed[idx].var;
                for (sample, genotype) in var.samples {
                    target.samples.entry(sample).or_insert(genotype);
                }
            }
            continue;
        }

        match ctx.normalizer.normalize(&mut var) {
            Err(StepFailure::Fatal(e)) => return Err(e),
            Err(StepFailure::Drop(reason)) => {
                seen.insert(key, None);
                record_drop(out, line_no, &reason);
                continue;
            }
            Ok(()) => {}
        }

        let lifted = ctx.engine.needed_for(&var.chrom);
        match ctx.engine.lift_variant(&mut var) {
            Ok(()) => {
                seen.insert(key, Some(out.committed.len()));
                out.committed.push(CommittedRow {
                    local_seq,
                    lifted,
                    var,
                });
            }
            Err(reason) => {
                seen.insert(key, None);
                record_drop(out, line_no, &reason);
            }
        }
    }

    out.alleles_processed += allele_count;
    Ok(())
}

fn record_drop(out: &mut WorkerOutput, line_no: u64, reason: &DropReason) {
    if reason.counts_as_no_alt() {
        out.stats.no_alt_allele += 1;
    } else {
        out.stats.invalid += 1;
    }
    out.errors.push(ErrorEvent {
        line_no,
        message: reason.to_string(),
        expected: reason.is_expected(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::ParseError;
    use crate::reference::FixedReference;

    /// Line grammar for pipeline tests: `chrom,pos,ref,alt[,sample]`
    /// semicolon-separated per allele.
    struct StubParser;

    impl FormatParser for StubParser {
        fn format_name(&self) -> &'static str {
            "stub"
        }

        fn setup(&mut self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn parse_line(&self, line: &str) -> Result<ParseOutcome, ParseError> {
            if line.starts_with('#') {
                return Ok(ParseOutcome::Ignore);
            }
            if line == "empty" {
                return Ok(ParseOutcome::Variants(Vec::new()));
            }
            if line == "bad" {
                return Err(ParseError::InvalidPosition(String::from("bad")));
            }
            let mut variants = Vec::new();
            for entry in line.split(';') {
                let f: Vec<&str> = entry.split(',').collect();
                let mut var = Candidate::new(f[0], f[1].parse().unwrap(), f[2], f[3]);
                if let Some(sample) = f.get(4) {
                    var.samples
                        .insert(sample.to_string(), f[3].to_string());
                }
                variants.push(var);
            }
            Ok(ParseOutcome::Variants(variants))
        }
    }

    fn run_chunk(lines: &[(u64, &str)]) -> WorkerOutput {
        let normalizer = VariantNormalizer::new(Some(Arc::new(FixedReference::new(
            "chr1", "ACGTACGTACGT",
        ))));
        let engine = LiftoverEngine::disabled();
        let ctx = WorkerContext {
            parser: &StubParser,
            normalizer: &normalizer,
            engine: &engine,
            file_no: 0,
            ignore_sample: false,
        };
        let chunk = LineChunk {
            lines: lines
                .iter()
                .map(|(no, text)| (*no, text.to_string()))
                .collect(),
        };
        process_chunk(&ctx, &chunk).unwrap()
    }

    #[test]
    fn duplicate_allele_commits_once_with_merged_samples() {
        let out = run_chunk(&[(1, "chr1,100,A,G,s1;chr1,100,A,G,s2")]);

        assert_eq!(out.committed.len(), 1);
        assert_eq!(out.alleles_processed, 2);
        let row = &out.committed[0];
        assert_eq!(row.local_seq, 0);
        assert_eq!(row.var.samples.len(), 2);
        assert!(row.var.samples.contains_key("s1"));
        assert!(row.var.samples.contains_key("s2"));
        assert_eq!(out.stats.valid, 1);
    }

    #[test]
    fn uid_slots_cover_dropped_alleles() {
        // First allele invalid, second fine: the committed row sits in the
        // second slot.
        let out = run_chunk(&[(1, "chr1,100,N,G;chr1,101,A,G")]);
        assert_eq!(out.committed.len(), 1);
        assert_eq!(out.committed[0].local_seq, 1);
        assert_eq!(out.alleles_processed, 2);
        assert_eq!(out.stats.invalid, 1);
        assert_eq!(out.stats.valid, 1);
    }

    #[test]
    fn line_outcomes_feed_the_right_counters() {
        let out = run_chunk(&[
            (1, "#header"),
            (2, "empty"),
            (3, "bad"),
            (4, "chr1,100,A,A"),
            (5, "chr1,100,A,G"),
        ]);
        assert_eq!(out.stats.valid, 2); // lines 4 and 5 both parsed
        assert_eq!(out.stats.invalid, 1); // parse error on line 3
        assert_eq!(out.stats.no_alt_allele, 2); // line 2 empty + line 4 no-variant drop
        assert_eq!(out.committed.len(), 1);
        assert_eq!(out.errors.len(), 2);
    }

    #[test]
    fn duplicate_of_dropped_first_occurrence_vanishes() {
        let out = run_chunk(&[(1, "chr1,100,N,G,s1;chr1,100,N,G,s2")]);
        assert!(out.committed.is_empty());
        assert_eq!(out.alleles_processed, 2);
        // Only the first occurrence is counted and logged.
        assert_eq!(out.stats.invalid, 1);
    }

    #[test]
    fn chrom_normalization_precedes_dedup_identity() {
        // "x" and "chrx" normalize to the same chromosome, so the two
        // alleles collapse into one committed row.
        let out = run_chunk(&[(1, "x,100,A,G,s1;chrx,100,A,G,s2")]);
        assert_eq!(out.committed.len(), 1);
        assert_eq!(out.committed[0].var.chrom, "chrX");
        assert_eq!(out.committed[0].var.samples.len(), 2);
    }
}
