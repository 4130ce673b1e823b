use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::batch::open_text;
use crate::variant::Candidate;

/// Result of parsing one raw input line.
#[derive(Clone, Debug, PartialEq)]
pub enum ParseOutcome {
    /// Candidate alleles found on the line. An empty list means the line is
    /// well-formed but carries no alternate allele.
    Variants(Vec<Candidate>),
    /// Suppress the line entirely (headers, comments); no stats change.
    Ignore,
}

/// Errors raised while parsing a single line. These are per-line failures:
/// the offending line is counted and logged, the batch continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected at least {expected} tab-delimited fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("invalid position: {0}")]
    InvalidPosition(String),
}

/// Format-specific translation of raw lines into candidate alleles. The
/// pipeline depends only on this contract; grammars live entirely behind it.
pub trait FormatParser: Send + Sync {
    fn format_name(&self) -> &'static str;

    /// One-time header scan before any line parsing: collects the sample
    /// universe and any assembly hint the format can provide.
    fn setup(&mut self, path: &Path) -> Result<()>;

    /// Samples this input may attach genotype data to, in column order.
    fn samples(&self) -> &[String] {
        &[]
    }

    /// Assembly declared by the input itself, if the format can tell.
    fn detected_assembly(&self) -> Option<&str> {
        None
    }

    fn parse_line(&self, line: &str) -> Result<ParseOutcome, ParseError>;
}

/// Supported input formats.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum InputFormat {
    /// VCF-like text input.
    Vcf,
    /// Tab-separated `chrom pos ref alt [sample [genotype]]` input.
    Tabular,
    /// Detect from extension and content.
    Auto,
}

impl InputFormat {
    /// Resolve `Auto` by extension, then by peeking the first line.
    pub fn detect(path: &Path) -> Self {
        if let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) {
            let base = name.strip_suffix(".gz").unwrap_or(&name);
            if base.ends_with(".vcf") {
                return Self::Vcf;
            }
            if base.ends_with(".tsv") || base.ends_with(".txt") || base.ends_with(".tab") {
                return Self::Tabular;
            }
        }

        if let Ok(mut reader) = open_text(path) {
            let mut first = String::new();
            if reader.read_line(&mut first).is_ok() && first.starts_with("##fileformat=VCF") {
                return Self::Vcf;
            }
        }

        Self::Tabular
    }
}

/// Construct the parser for a resolved (non-Auto) format.
pub fn make_parser(format: InputFormat, path: &Path) -> Box<dyn FormatParser> {
    let resolved = if format == InputFormat::Auto {
        InputFormat::detect(path)
    } else {
        format
    };
    match resolved {
        InputFormat::Vcf => Box::new(VcfParser::new()),
        InputFormat::Tabular | InputFormat::Auto => Box::new(TabularParser::new()),
    }
}

const ASSEMBLY_TOKENS: [&str; 6] = ["grch38", "grch37", "grch36", "hg38", "hg19", "hg18"];

fn sniff_assembly(line: &str) -> Option<String> {
    let lower = line.to_lowercase();
    for token in ASSEMBLY_TOKENS {
        if lower.contains(token) {
            // Preserve the canonical capitalization of the token family.
            return Some(if token.starts_with("grch") {
                format!("GRCh{}", &token[4..])
            } else {
                token.to_string()
            });
        }
    }
    None
}

fn parse_pos(raw: &str) -> Result<u64, ParseError> {
    raw.parse::<u64>()
        .map_err(|_| ParseError::InvalidPosition(raw.to_string()))
}

// ============================================================================
// VCF-like parser
// ============================================================================

/// Parser for VCF-like text: tab-separated fixed columns, comma-separated
/// alternate alleles, GT-bearing sample columns.
pub struct VcfParser {
    samples: Vec<String>,
    assembly: Option<String>,
}

impl VcfParser {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            assembly: None,
        }
    }
}

impl Default for VcfParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatParser for VcfParser {
    fn format_name(&self) -> &'static str {
        "vcf"
    }

    fn setup(&mut self, path: &Path) -> Result<()> {
        let reader = open_text(path)
            .with_context(|| format!("failed to open input {}", path.display()))?;
        for line in reader.lines() {
            let line = line?;
            if line.starts_with("#CHROM") {
                // Columns after FORMAT are sample names.
                self.samples = line.split('\t').skip(9).map(|s| s.to_string()).collect();
                break;
            }
            if !line.starts_with('#') {
                break;
            }
            if (line.starts_with("##reference") || line.starts_with("##assembly"))
                && self.assembly.is_none()
            {
                self.assembly = sniff_assembly(&line);
            }
        }
        Ok(())
    }

    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn detected_assembly(&self) -> Option<&str> {
        self.assembly.as_deref()
    }

    fn parse_line(&self, line: &str) -> Result<ParseOutcome, ParseError> {
        if line.is_empty() || line.starts_with('#') {
            return Ok(ParseOutcome::Ignore);
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(ParseError::FieldCount {
                expected: 8,
                found: fields.len(),
            });
        }

        let chrom = fields[0];
        let pos = parse_pos(fields[1])?;
        let ref_base = fields[3];
        let alt_field = fields[4];

        if alt_field.is_empty() || alt_field == "." {
            return Ok(ParseOutcome::Variants(Vec::new()));
        }

        let alts: Vec<&str> = alt_field.split(',').filter(|a| *a != "*").collect();
        if alts.is_empty() {
            return Ok(ParseOutcome::Variants(Vec::new()));
        }

        let genotypes = self.decode_genotypes(&fields);

        let mut variants = Vec::with_capacity(alts.len());
        for (alt_idx, alt) in alts.iter().enumerate() {
            let mut candidate = Candidate::new(chrom, pos, ref_base, alt);
            for (sample, indices) in &genotypes {
                if indices.iter().any(|i| *i == Some(alt_idx + 1)) {
                    let token = render_genotype(indices, ref_base, &alts);
                    candidate.samples.insert(sample.clone(), token);
                }
            }
            variants.push(candidate);
        }

        Ok(ParseOutcome::Variants(variants))
    }
}

impl VcfParser {
    /// Decode each sample column's GT into allele indices (None = missing).
    fn decode_genotypes(&self, fields: &[&str]) -> Vec<(String, Vec<Option<usize>>)> {
        if fields.len() < 10 || self.samples.is_empty() {
            return Vec::new();
        }

        let Some(gt_index) = fields[8].split(':').position(|key| key == "GT") else {
            return Vec::new();
        };

        let mut decoded = Vec::new();
        for (column, sample) in fields[9..].iter().zip(&self.samples) {
            let Some(token) = column.split(':').nth(gt_index) else {
                continue;
            };
            let indices: Vec<Option<usize>> = token
                .split(['/', '|'])
                .map(|a| if a == "." { None } else { a.parse::<usize>().ok() })
                .collect();
            decoded.push((sample.clone(), indices));
        }
        decoded
    }
}

/// Render GT indices as a base-level genotype token. Missing alleles stay
/// `.` here; the normalizer substitutes the resolved reference base later.
fn render_genotype(indices: &[Option<usize>], ref_base: &str, alts: &[&str]) -> String {
    let rendered: Vec<&str> = indices
        .iter()
        .map(|idx| match idx {
            Some(0) => ref_base,
            Some(i) => alts.get(*i - 1).copied().unwrap_or("."),
            None => ".",
        })
        .collect();
    rendered.join("/")
}

// ============================================================================
// Tabular parser
// ============================================================================

/// Parser for the custom tabular format:
/// `chrom <TAB> pos <TAB> ref <TAB> alt [<TAB> sample [<TAB> genotype]]`.
pub struct TabularParser {
    samples: Vec<String>,
}

impl TabularParser {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }
}

impl Default for TabularParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatParser for TabularParser {
    fn format_name(&self) -> &'static str {
        "tabular"
    }

    /// Full-file scan for the sample universe; sample tables must exist
    /// before the first batch is assembled.
    fn setup(&mut self, path: &Path) -> Result<()> {
        let reader = open_text(path)
            .with_context(|| format!("failed to open input {}", path.display()))?;
        let mut samples = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(sample) = line.split('\t').nth(4)
                && !sample.is_empty()
                && !samples.iter().any(|s| s == sample)
            {
                samples.push(sample.to_string());
            }
        }
        samples.sort();
        self.samples = samples;
        Ok(())
    }

    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn parse_line(&self, line: &str) -> Result<ParseOutcome, ParseError> {
        if line.is_empty() || line.starts_with('#') {
            return Ok(ParseOutcome::Ignore);
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            return Err(ParseError::FieldCount {
                expected: 4,
                found: fields.len(),
            });
        }

        let chrom = fields[0];
        let pos = parse_pos(fields[1])?;
        let ref_base = fields[2];
        let alt_base = fields[3];

        if alt_base.is_empty() || alt_base == "." {
            return Ok(ParseOutcome::Variants(Vec::new()));
        }

        let mut candidate = Candidate::new(chrom, pos, ref_base, alt_base);
        if let Some(sample) = fields.get(4).filter(|s| !s.is_empty()) {
            let genotype = fields.get(5).copied().unwrap_or(alt_base);
            candidate.samples.insert(sample.to_string(), genotype.to_string());
        }

        Ok(ParseOutcome::Variants(vec![candidate]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vcf_parser_for(contents: &str) -> VcfParser {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in.vcf");
        std::fs::write(&path, contents).unwrap();
        let mut parser = VcfParser::new();
        parser.setup(&path).unwrap();
        parser
    }

    #[test]
    fn vcf_setup_collects_samples_and_assembly() {
        let parser = vcf_parser_for(
            "##fileformat=VCFv4.2\n\
             ##reference=file:///data/hg19.fa\n\
             #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\ts2\n",
        );
        assert_eq!(parser.samples(), ["s1", "s2"]);
        assert_eq!(parser.detected_assembly(), Some("hg19"));
    }

    #[test]
    fn vcf_multiallelic_line_yields_one_candidate_per_alt() {
        let parser = vcf_parser_for(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\ts2\n",
        );
        let outcome = parser
            .parse_line("chr1\t100\t.\tA\tG,T\t.\t.\t.\tGT\t0/1\t2/2")
            .unwrap();
        let ParseOutcome::Variants(vars) = outcome else {
            panic!("expected variants");
        };
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].alt_base, "G");
        assert_eq!(vars[0].samples.len(), 1);
        assert_eq!(vars[0].samples.get("s1").map(String::as_str), Some("A/G"));
        assert_eq!(vars[1].alt_base, "T");
        assert_eq!(vars[1].samples.get("s2").map(String::as_str), Some("T/T"));
    }

    #[test]
    fn vcf_missing_alt_is_no_alt_allele_not_error() {
        let parser = vcf_parser_for("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n");
        let outcome = parser
            .parse_line("chr1\t100\t.\tA\t.\t.\t.\t.")
            .unwrap();
        assert_eq!(outcome, ParseOutcome::Variants(Vec::new()));
    }

    #[test]
    fn vcf_header_lines_are_ignored() {
        let parser = VcfParser::new();
        assert_eq!(
            parser.parse_line("##contig=<ID=chr1>").unwrap(),
            ParseOutcome::Ignore
        );
    }

    #[test]
    fn vcf_short_line_is_a_parse_error() {
        let parser = VcfParser::new();
        assert_eq!(
            parser.parse_line("chr1\t100\t.\tA"),
            Err(ParseError::FieldCount {
                expected: 8,
                found: 4
            })
        );
    }

    #[test]
    fn vcf_missing_genotype_allele_renders_as_dot() {
        let parser = vcf_parser_for(
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\n",
        );
        let ParseOutcome::Variants(vars) = parser
            .parse_line("chr1\t100\t.\tA\tG\t.\t.\t.\tGT\t./1")
            .unwrap()
        else {
            panic!("expected variants");
        };
        assert_eq!(vars[0].samples.get("s1").map(String::as_str), Some("./G"));
    }

    #[test]
    fn tabular_parses_minimal_and_sampled_lines() {
        let parser = TabularParser::new();
        let ParseOutcome::Variants(vars) =
            parser.parse_line("chr2\t500\tAT\tA").unwrap()
        else {
            panic!("expected variants");
        };
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].ref_base, "AT");

        let ParseOutcome::Variants(vars) = parser
            .parse_line("chr2\t500\tA\tG\tNA12878\tA.")
            .unwrap()
        else {
            panic!("expected variants");
        };
        assert_eq!(
            vars[0].samples.get("NA12878").map(String::as_str),
            Some("A.")
        );
    }

    #[test]
    fn tabular_setup_collects_sorted_sample_universe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in.tsv");
        std::fs::write(
            &path,
            "#comment\nchr1\t1\tA\tG\tzeta\nchr1\t2\tA\tG\talpha\nchr1\t3\tA\tG\tzeta\n",
        )
        .unwrap();
        let mut parser = TabularParser::new();
        parser.setup(&path).unwrap();
        assert_eq!(parser.samples(), ["alpha", "zeta"]);
    }

    #[test]
    fn tabular_bad_position_is_a_parse_error() {
        let parser = TabularParser::new();
        assert_eq!(
            parser.parse_line("chr1\tabc\tA\tG"),
            Err(ParseError::InvalidPosition(String::from("abc")))
        );
    }

    #[test]
    fn detect_by_extension_and_content() {
        let dir = tempdir().unwrap();
        let vcf = dir.path().join("x.vcf.gz");
        std::fs::write(&vcf, "").unwrap();
        assert_eq!(InputFormat::detect(&vcf), InputFormat::Vcf);

        let anon = dir.path().join("data.input");
        std::fs::write(&anon, "##fileformat=VCFv4.3\n").unwrap();
        assert_eq!(InputFormat::detect(&anon), InputFormat::Vcf);

        let tsv = dir.path().join("data.tsv");
        std::fs::write(&tsv, "chr1\t1\tA\tG\n").unwrap();
        assert_eq!(InputFormat::detect(&tsv), InputFormat::Tabular);
    }
}
