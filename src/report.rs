//! Run statistics and the structured run report.
//!
//! The report is a JSON file written alongside the output tables so
//! downstream tooling can consume run metadata without parsing logs.

use std::path::Path;

use serde::Serialize;

/// Per-worker line/allele outcome counters, reduced sequentially by the
/// coordinator after each batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    /// Lines that parsed and had their alleles processed.
    pub valid: u64,
    /// Parse failures and dropped alleles (ignored variants, liftover
    /// failures, unexpected errors).
    pub invalid: u64,
    /// Lines or alleles with nothing to convert.
    pub no_alt_allele: u64,
}

impl ConversionStats {
    pub fn absorb(&mut self, other: &ConversionStats) {
        self.valid += other.valid;
        self.invalid += other.invalid;
        self.no_alt_allele += other.no_alt_allele;
    }
}

/// Aggregate result of a conversion run. Always produced, even when many
/// lines failed; a non-zero error count is not a run failure.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub total_lines_converted: u64,
    pub valid_count: u64,
    pub error_count: u64,
    pub no_alt_allele_count: u64,
    /// Committed variants across all inputs.
    pub total_variants: u64,
    /// Input assemblies, in file order, deduplicated.
    pub detected_assemblies: Vec<String>,
}

impl RunSummary {
    pub fn from_stats(
        stats: &ConversionStats,
        total_variants: u64,
        detected_assemblies: Vec<String>,
    ) -> Self {
        Self {
            total_lines_converted: stats.valid,
            valid_count: stats.valid,
            error_count: stats.invalid,
            no_alt_allele_count: stats.no_alt_allele,
            total_variants,
            detected_assemblies,
        }
    }
}

/// Report serialized as `{run_name}_report.json` next to the output tables.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub version: String,
    pub timestamp: String,
    pub run_name: String,
    pub inputs: Vec<String>,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn new(run_name: &str, inputs: &[String], summary: RunSummary) -> Self {
        let timestamp = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| String::from("unknown"));
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp,
            run_name: run_name.to_string(),
            inputs: inputs.to_vec(),
            summary,
        }
    }

    pub fn write(&self, dir: &Path) -> std::io::Result<()> {
        let path = dir.join(format!("{}_report.json", self.run_name));
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        tracing::info!("wrote run report to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_reduce_by_absorb() {
        let mut total = ConversionStats::default();
        total.absorb(&ConversionStats {
            valid: 2,
            invalid: 1,
            no_alt_allele: 0,
        });
        total.absorb(&ConversionStats {
            valid: 3,
            invalid: 0,
            no_alt_allele: 4,
        });
        assert_eq!(
            total,
            ConversionStats {
                valid: 5,
                invalid: 1,
                no_alt_allele: 4
            }
        );
    }

    #[test]
    fn report_round_trips_to_json() {
        let summary = RunSummary::from_stats(
            &ConversionStats {
                valid: 10,
                invalid: 2,
                no_alt_allele: 1,
            },
            12,
            vec![String::from("hg19")],
        );
        let report = RunReport::new("run", &[String::from("in.tsv")], summary);

        let dir = tempfile::tempdir().unwrap();
        report.write(dir.path()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("run_report.json")).unwrap();
        assert!(contents.contains("\"valid_count\": 10"));
        assert!(contents.contains("hg19"));
    }
}
