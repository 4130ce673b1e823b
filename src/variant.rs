use std::collections::BTreeMap;
use std::fmt;

/// A candidate variant produced by parsing one input line.
///
/// Mutated in place by the normalization and liftover steps. The `ori_*`
/// fields freeze the coordinates and alleles as they appeared in the input;
/// they feed the coordinate-mapping table for lifted variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub chrom: String,
    /// 1-based start position.
    pub pos: u64,
    /// 1-based inclusive end position (`pos + ref len - 1`; `-` counts as 1).
    pub end_pos: u64,
    pub ref_base: String,
    pub alt_base: String,

    pub ori_chrom: String,
    pub ori_pos: u64,
    pub ori_end_pos: u64,
    pub ori_ref_base: String,
    pub ori_alt_base: String,

    /// Sample name -> genotype token, for samples carrying this allele.
    /// BTreeMap so row emission order is deterministic.
    pub samples: BTreeMap<String, String>,

    pub line_no: u64,
    pub file_no: u32,
}

impl Candidate {
    pub fn new(chrom: &str, pos: u64, ref_base: &str, alt_base: &str) -> Self {
        let ref_len = allele_len(ref_base);
        let end_pos = pos + ref_len.saturating_sub(1);
        Self {
            chrom: chrom.to_string(),
            pos,
            end_pos,
            ref_base: ref_base.to_string(),
            alt_base: alt_base.to_string(),
            ori_chrom: chrom.to_string(),
            ori_pos: pos,
            ori_end_pos: end_pos,
            ori_ref_base: ref_base.to_string(),
            ori_alt_base: alt_base.to_string(),
            samples: BTreeMap::new(),
            line_no: 0,
            file_no: 0,
        }
    }

    pub fn with_sample(mut self, sample: &str, genotype: &str) -> Self {
        self.samples.insert(sample.to_string(), genotype.to_string());
        self
    }

    /// Identity used for per-line deduplication. Valid only once the
    /// chromosome has been normalized; the rest of the fields are still the
    /// pre-normalization, pre-liftover values at that point.
    pub fn identity_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.chrom, self.pos, self.ref_base, self.alt_base
        )
    }

    /// Whether any of the normalization or liftover steps moved this
    /// candidate away from its input representation.
    pub fn was_remapped(&self) -> bool {
        self.chrom != self.ori_chrom
            || self.pos != self.ori_pos
            || self.end_pos != self.ori_end_pos
            || self.ref_base != self.ori_ref_base
            || self.alt_base != self.ori_alt_base
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {}>{}",
            self.chrom, self.pos, self.ref_base, self.alt_base
        )
    }
}

/// Allele length in reference space; the `-` indel placeholder occupies a
/// single position.
pub fn allele_len(allele: &str) -> u64 {
    if allele == "-" {
        1
    } else {
        allele.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn originals_frozen_at_construction() {
        let mut var = Candidate::new("chr1", 100, "ATG", "AAG");
        assert_eq!(var.end_pos, 102);
        var.pos = 101;
        var.ref_base = String::from("T");
        assert_eq!(var.ori_pos, 100);
        assert_eq!(var.ori_ref_base, "ATG");
        assert!(var.was_remapped());
    }

    #[test]
    fn identity_key_uses_current_fields() {
        let var = Candidate::new("chr1", 100, "A", "G");
        assert_eq!(var.identity_key(), "chr1:100:A:G");
    }

    #[test]
    fn placeholder_allele_spans_one_base() {
        let var = Candidate::new("chr1", 50, "-", "GG");
        assert_eq!(var.end_pos, 50);
    }
}
